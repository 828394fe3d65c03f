//! Association requester module
//!
//! The module provides an abstraction for a DICOM association
//! in which this application entity requests an association
//! with another node, usually taking the role of a service class user (SCU).
//! The outbound C-STORE sub-operations of a C-MOVE
//! establish their associations through this module.

use std::borrow::Cow;
use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use bytes::BytesMut;
use snafu::{ensure, ResultExt};
use tracing::debug;

use crate::association::pdata::PDataWriter;
use crate::association::uid::trim_uid;
use crate::association::{
    read_pdu_from_wire, AbortedSnafu, ConnectSnafu, MissingAbstractSyntaxSnafu,
    NegotiatedOptions, NoAcceptedPresentationContextsSnafu, RejectedSnafu, Result, SendPduSnafu,
    SocketOptions, UnexpectedPduSnafu, UnknownPresentationContextSnafu, WireSendSnafu,
};
use crate::pdu::{
    write_pdu, AssociationAC, AssociationRQ, PDataValueType, Pdu,
    PresentationContextNegotiated, PresentationContextProposed, PresentationContextResultReason,
    UserVariableItem, APPLICATION_CONTEXT_NAME, DEFAULT_MAX_PDU, PDU_HEADER_SIZE,
};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

/// A DICOM association builder for a requesting node.
/// The final outcome is a [`ClientAssociation`].
///
/// This is the standard way of requesting and establishing
/// an association with another DICOM node,
/// that one usually taking the role of a service class provider (SCP).
///
/// # Example
///
/// ```no_run
/// # use pacs_ul::association::client::ClientAssociationOptions;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let association = ClientAssociationOptions::new()
///    .calling_ae_title("MOVE-SCU")
///    .called_ae_title("STORE-SCP")
///    .with_abstract_syntax("1.2.840.10008.1.1")
///    .with_transfer_syntax("1.2.840.10008.1.2.1")
///    .establish("129.168.0.5:104")?;
/// # Ok(())
/// # }
/// ```
///
/// The SCU proposes by default the transfer syntaxes
/// _Implicit VR Little Endian_ and _Explicit VR Little Endian_.
/// Other transfer syntaxes can be proposed
/// via the method [`with_transfer_syntax`](Self::with_transfer_syntax).
#[derive(Debug, Clone)]
pub struct ClientAssociationOptions {
    /// the calling AE title
    calling_ae_title: Cow<'static, str>,
    /// the called AE title
    called_ae_title: Cow<'static, str>,
    /// the requested application context name
    application_context_name: Cow<'static, str>,
    /// the list of requested abstract syntaxes
    abstract_syntax_uids: Vec<Cow<'static, str>>,
    /// the list of requested transfer syntaxes
    transfer_syntax_uids: Vec<Cow<'static, str>>,
    /// the maximum PDU length this node is willing to receive
    max_pdu_length: u32,
    /// whether to receive PDUs in strict mode
    strict: bool,
    /// options for the underlying TCP socket
    socket_options: SocketOptions,
}

impl Default for ClientAssociationOptions {
    fn default() -> Self {
        ClientAssociationOptions {
            calling_ae_title: "THIS-SCU".into(),
            called_ae_title: "ANY-SCP".into(),
            application_context_name: APPLICATION_CONTEXT_NAME.into(),
            abstract_syntax_uids: Vec::new(),
            transfer_syntax_uids: Vec::new(),
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            socket_options: SocketOptions::default(),
        }
    }
}

impl ClientAssociationOptions {
    /// Create a new set of options for establishing an association.
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the calling application entity title for the association,
    /// which refers to this DICOM node.
    ///
    /// The default is `THIS-SCU`.
    pub fn calling_ae_title<T>(mut self, calling_ae_title: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.calling_ae_title = calling_ae_title.into();
        self
    }

    /// Define the called application entity title for the association,
    /// which refers to the target DICOM node.
    ///
    /// The default is `ANY-SCP`.
    pub fn called_ae_title<T>(mut self, called_ae_title: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.called_ae_title = called_ae_title.into();
        self
    }

    /// Include this abstract syntax
    /// in the list of proposed presentation contexts.
    pub fn with_abstract_syntax<T>(mut self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.abstract_syntax_uids
            .push(trim_uid(abstract_syntax_uid.into()));
        self
    }

    /// Include this transfer syntax in each proposed presentation context.
    pub fn with_transfer_syntax<T>(mut self, transfer_syntax_uid: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.transfer_syntax_uids
            .push(trim_uid(transfer_syntax_uid.into()));
        self
    }

    /// Override the maximum expected PDU length.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Override strict mode:
    /// whether receiving PDUs must not
    /// surpass the negotiated maximum PDU length.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Set the read timeout for the underlying TCP socket.
    pub fn read_timeout(self, timeout: Duration) -> Self {
        Self {
            socket_options: SocketOptions {
                read_timeout: Some(timeout),
                ..self.socket_options
            },
            ..self
        }
    }

    /// Set the connection timeout for the underlying TCP socket.
    pub fn connection_timeout(self, timeout: Duration) -> Self {
        Self {
            socket_options: SocketOptions {
                connection_timeout: Some(timeout),
                ..self.socket_options
            },
            ..self
        }
    }

    /// Initiate the TCP connection and negotiate the association.
    pub fn establish<T: ToSocketAddrs>(self, address: T) -> Result<ClientAssociation> {
        let ClientAssociationOptions {
            calling_ae_title,
            called_ae_title,
            application_context_name,
            abstract_syntax_uids,
            mut transfer_syntax_uids,
            max_pdu_length,
            strict,
            socket_options,
        } = self;

        // fail if no abstract syntaxes were provided: they represent intent,
        // should not be omitted by the user
        ensure!(!abstract_syntax_uids.is_empty(), MissingAbstractSyntaxSnafu);

        // provide default transfer syntaxes
        if transfer_syntax_uids.is_empty() {
            // Explicit VR Little Endian
            transfer_syntax_uids.push("1.2.840.10008.1.2.1".into());
            // Implicit VR Little Endian
            transfer_syntax_uids.push("1.2.840.10008.1.2".into());
        }

        let presentation_contexts: Vec<_> = abstract_syntax_uids
            .into_iter()
            .enumerate()
            .map(|(i, abstract_syntax)| PresentationContextProposed {
                // 1, 3, 5, ...
                id: (2 * i + 1) as u8,
                abstract_syntax: abstract_syntax.to_string(),
                transfer_syntaxes: transfer_syntax_uids
                    .iter()
                    .map(|uid| uid.to_string())
                    .collect(),
            })
            .collect();

        let msg = Pdu::AssociationRQ(AssociationRQ {
            protocol_version: 1,
            calling_ae_title: calling_ae_title.to_string(),
            called_ae_title: called_ae_title.to_string(),
            application_context_name: application_context_name.to_string(),
            presentation_contexts: presentation_contexts.clone(),
            user_variables: vec![
                UserVariableItem::MaxLength(max_pdu_length),
                UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
                UserVariableItem::ImplementationVersionName(
                    IMPLEMENTATION_VERSION_NAME.to_string(),
                ),
            ],
        });

        let mut socket = if let Some(timeout) = socket_options.connection_timeout {
            let address = address.to_socket_addrs().context(ConnectSnafu)?.next();
            let Some(address) = address else {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    "no socket address",
                ))
                .context(ConnectSnafu);
            };
            TcpStream::connect_timeout(&address, timeout).context(ConnectSnafu)?
        } else {
            TcpStream::connect(address).context(ConnectSnafu)?
        };
        socket
            .set_read_timeout(socket_options.read_timeout)
            .context(super::SetReadTimeoutSnafu)?;
        socket
            .set_write_timeout(socket_options.write_timeout)
            .context(super::SetWriteTimeoutSnafu)?;

        let mut write_buffer: Vec<u8> = Vec::with_capacity(max_pdu_length as usize);
        write_pdu(&mut write_buffer, &msg).context(SendPduSnafu)?;
        socket.write_all(&write_buffer).context(WireSendSnafu)?;

        let mut read_buffer =
            BytesMut::with_capacity((max_pdu_length + PDU_HEADER_SIZE) as usize);
        let msg = read_pdu_from_wire(&mut socket, &mut read_buffer, max_pdu_length, strict)?;

        match msg {
            Pdu::AssociationAC(AssociationAC {
                protocol_version: _,
                application_context_name: _,
                called_ae_title: _,
                calling_ae_title: _,
                presentation_contexts: presentation_contexts_scp,
                user_variables,
            }) => {
                // accepted context ids must be odd
                // and refer to contexts we actually proposed
                let negotiated: Vec<PresentationContextNegotiated> = presentation_contexts_scp
                    .into_iter()
                    .filter_map(|result| {
                        let proposed =
                            presentation_contexts.iter().find(|pc| pc.id == result.id)?;
                        if result.id % 2 == 0 {
                            return None;
                        }
                        Some(PresentationContextNegotiated {
                            id: result.id,
                            reason: result.reason,
                            abstract_syntax: proposed.abstract_syntax.clone(),
                            transfer_syntax: trim_uid(Cow::from(result.transfer_syntax))
                                .to_string(),
                        })
                    })
                    .collect();

                ensure!(
                    negotiated
                        .iter()
                        .any(|pc| pc.reason == PresentationContextResultReason::Acceptance),
                    NoAcceptedPresentationContextsSnafu
                );

                let peer_max_pdu_length = user_variables
                    .iter()
                    .find_map(|item| match item {
                        UserVariableItem::MaxLength(len) => Some(*len),
                        _ => None,
                    })
                    .unwrap_or(DEFAULT_MAX_PDU);
                let peer_max_pdu_length = if peer_max_pdu_length == 0 {
                    u32::MAX
                } else {
                    peer_max_pdu_length
                };

                debug!(
                    "association established with `{}` ({} accepted context(s))",
                    called_ae_title,
                    negotiated
                        .iter()
                        .filter(|pc| pc.reason == PresentationContextResultReason::Acceptance)
                        .count()
                );

                Ok(ClientAssociation {
                    negotiated: NegotiatedOptions {
                        peer_ae_title: called_ae_title.to_string(),
                        peer_max_pdu_length,
                        presentation_contexts: negotiated,
                        user_variables,
                    },
                    requestor_max_pdu_length: max_pdu_length,
                    socket,
                    read_buffer,
                    write_buffer,
                    strict,
                    released: false,
                })
            }
            Pdu::AssociationRJ(association_rj) => RejectedSnafu { association_rj }.fail(),
            Pdu::AbortRQ { .. } => AbortedSnafu.fail(),
            pdu => UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail(),
        }
    }
}

/// A DICOM upper level association from the perspective
/// of a requesting application entity.
///
/// The most common operations of an established association are
/// [`send`](Self::send)
/// and [`receive`](Self::receive).
/// Sending large P-Data fragments may be easier through the P-Data sender
/// abstraction (see [`send_pdata`](Self::send_pdata)).
///
/// When the value falls out of scope,
/// the program will try to gracefully release the association,
/// then shut down the underlying TCP connection.
#[derive(Debug)]
pub struct ClientAssociation {
    /// The negotiation outcome
    negotiated: NegotiatedOptions,
    /// The maximum PDU length this node is willing to receive
    requestor_max_pdu_length: u32,
    /// The TCP stream to the other DICOM node
    socket: TcpStream,
    /// Read buffer from the socket
    read_buffer: BytesMut,
    /// Reusable buffer for sending PDUs on the wire
    write_buffer: Vec<u8>,
    /// whether to receive PDUs in strict mode
    strict: bool,
    /// whether the association was already released
    released: bool,
}

impl ClientAssociation {
    /// Obtain a view of the negotiated presentation contexts.
    pub fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
        &self.negotiated.presentation_contexts
    }

    /// Obtain the first accepted presentation context
    /// for the given abstract syntax, if any.
    pub fn accepted_context_for(
        &self,
        abstract_syntax: &str,
    ) -> Option<&PresentationContextNegotiated> {
        self.negotiated.presentation_contexts.iter().find(|pc| {
            pc.reason == PresentationContextResultReason::Acceptance
                && pc.abstract_syntax == abstract_syntax
        })
    }

    /// Obtain the remote DICOM node's application entity title.
    pub fn peer_ae_title(&self) -> &str {
        &self.negotiated.peer_ae_title
    }

    /// Retrieve the maximum PDU length the peer is willing to receive.
    pub fn peer_max_pdu_length(&self) -> u32 {
        self.negotiated.peer_max_pdu_length
    }

    /// Send a PDU message to the other intervenient.
    pub fn send(&mut self, msg: &Pdu) -> Result<()> {
        self.write_buffer.clear();
        write_pdu(&mut self.write_buffer, msg).context(SendPduSnafu)?;
        self.socket
            .write_all(&self.write_buffer)
            .context(WireSendSnafu)
    }

    /// Read a PDU message from the other intervenient.
    pub fn receive(&mut self) -> Result<Pdu> {
        read_pdu_from_wire(
            &mut self.socket,
            &mut self.read_buffer,
            self.requestor_max_pdu_length,
            self.strict,
        )
    }

    /// Send a command payload on the given presentation context,
    /// fragmenting it as needed.
    pub fn send_command(&mut self, presentation_context_id: u8, data: Vec<u8>) -> Result<()> {
        for pdu in crate::association::pdata::fragment_pdata(
            presentation_context_id,
            PDataValueType::Command,
            data,
            self.negotiated.peer_max_pdu_length,
        ) {
            self.send(&pdu)?;
        }
        Ok(())
    }

    /// Prepare a P-Data writer for sending
    /// one or more data items on the given presentation context.
    pub fn send_pdata(&mut self, presentation_context_id: u8) -> Result<PDataWriter<&mut TcpStream>> {
        ensure!(
            self.negotiated
                .accepted_context(presentation_context_id)
                .is_some(),
            UnknownPresentationContextSnafu {
                id: presentation_context_id
            }
        );
        Ok(PDataWriter::new(
            &mut self.socket,
            presentation_context_id,
            self.negotiated.peer_max_pdu_length,
        ))
    }

    /// Gracefully release the association.
    pub fn release(&mut self) -> Result<()> {
        self.released = true;
        self.send(&Pdu::ReleaseRQ)?;

        let pdu = self.receive()?;
        match pdu {
            Pdu::ReleaseRP => {}
            Pdu::AbortRQ { .. } => return AbortedSnafu.fail(),
            pdu => return UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail(),
        }

        let _ = self.socket.shutdown(std::net::Shutdown::Both);
        Ok(())
    }

    /// Send an A-ABORT and shut down the connection.
    pub fn abort(&mut self) -> Result<()> {
        self.released = true;
        let out = self.send(&Pdu::AbortRQ {
            source: crate::pdu::AbortRQSource::ServiceUser,
        });
        let _ = self.socket.shutdown(std::net::Shutdown::Both);
        out
    }
}

impl Drop for ClientAssociation {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.release();
        }
    }
}
