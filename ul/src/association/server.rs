//! Association acceptor module
//!
//! The module provides an abstraction for a DICOM association
//! in which this application entity listens to incoming association requests.
//! See [`ServerAssociationOptions`]
//! for details and examples on how to create an association.
//!
//! The driver here is a thin blocking wrapper around
//! [`ScpMachine`](crate::association::machine::ScpMachine):
//! it reads PDUs from the socket, feeds them to the machine
//! and carries out the emitted actions.

use std::borrow::Cow;
use std::io::Write;
use std::net::TcpStream;
use std::time::Duration;

use bytes::BytesMut;
use snafu::{ensure, ResultExt};
use tracing::warn;

use crate::association::machine::{AssociationState, ScpMachine, ScpMachineOptions, ScpOutput};
use crate::association::pdata::PDataWriter;
use crate::association::{
    read_pdu_from_wire, AbortedSnafu, AcceptAny, AcceptCalledAeTitle, AccessControl,
    MissingAbstractSyntaxSnafu, NegotiatedOptions, RejectedSnafu, Result, SendPduSnafu,
    SocketOptions, UnknownPresentationContextSnafu, WireSendSnafu,
};
use crate::pdu::{
    write_pdu, AssociationRJ, PDataValueType, Pdu, PresentationContextNegotiated,
    DEFAULT_MAX_PDU, PDU_HEADER_SIZE,
};

/// A DICOM association builder for an acceptor DICOM node,
/// usually taking the role of a service class provider (SCP).
///
/// The outcome of a successful negotiation is a [`ServerAssociation`].
/// Unlike the [`ClientAssociationOptions`],
/// a value of this type can be reused for multiple connections.
///
/// [`ClientAssociationOptions`]: crate::association::client::ClientAssociationOptions
///
/// Access control logic is available,
/// enabling application entities to decide on
/// whether to accept or reject the association request
/// based on the _called_ and _calling_ AE titles.
///
/// - By default, the application will accept requests from anyone
///   ([`AcceptAny`])
/// - To only accept requests with a matching _called_ AE title,
///   add a call to [`accept_called_ae_title`]
///   ([`AcceptCalledAeTitle`]).
/// - Any other policy can be implemented through the [`AccessControl`] trait.
///
/// [`accept_called_ae_title`]: Self::accept_called_ae_title
///
/// # Example
///
/// ```no_run
/// # use std::net::TcpListener;
/// # use pacs_ul::association::server::ServerAssociationOptions;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// # let tcp_listener: TcpListener = unimplemented!();
/// let scp_options = ServerAssociationOptions::new()
///    .with_abstract_syntax("1.2.840.10008.1.1")
///    .with_transfer_syntax("1.2.840.10008.1.2.1");
///
/// let (stream, _address) = tcp_listener.accept()?;
/// scp_options.establish(stream)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ServerAssociationOptions<A> {
    /// the application entity access control policy
    ae_access_control: A,
    /// the AE title of this DICOM node
    ae_title: Cow<'static, str>,
    /// the list of supported abstract syntaxes
    abstract_syntax_uids: Vec<Cow<'static, str>>,
    /// the list of supported transfer syntaxes
    transfer_syntax_uids: Vec<Cow<'static, str>>,
    /// the maximum PDU length
    max_pdu_length: u32,
    /// whether to receive PDUs in strict mode
    strict: bool,
    /// whether to accept unknown abstract syntaxes
    promiscuous: bool,
    /// options for the underlying TCP socket
    socket_options: SocketOptions,
}

impl Default for ServerAssociationOptions<AcceptAny> {
    fn default() -> Self {
        ServerAssociationOptions {
            ae_access_control: AcceptAny,
            ae_title: "THIS-SCP".into(),
            abstract_syntax_uids: Vec::new(),
            transfer_syntax_uids: Vec::new(),
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            promiscuous: false,
            socket_options: SocketOptions::default(),
        }
    }
}

impl ServerAssociationOptions<AcceptAny> {
    /// Create a new set of options for establishing an association.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<A> ServerAssociationOptions<A>
where
    A: AccessControl + Clone + 'static,
{
    /// Change the access control policy to accept any association
    /// regardless of the specified AE titles.
    ///
    /// This is the default behavior when the options are first created.
    pub fn accept_any(self) -> ServerAssociationOptions<AcceptAny> {
        self.ae_access_control(AcceptAny)
    }

    /// Change the access control policy to accept an association
    /// if the called AE title matches this node's AE title.
    pub fn accept_called_ae_title(self) -> ServerAssociationOptions<AcceptCalledAeTitle> {
        self.ae_access_control(AcceptCalledAeTitle)
    }

    /// Change the access control policy.
    pub fn ae_access_control<P>(self, access_control: P) -> ServerAssociationOptions<P>
    where
        P: AccessControl,
    {
        let ServerAssociationOptions {
            ae_title,
            abstract_syntax_uids,
            transfer_syntax_uids,
            max_pdu_length,
            strict,
            promiscuous,
            ae_access_control: _,
            socket_options,
        } = self;

        ServerAssociationOptions {
            ae_access_control: access_control,
            ae_title,
            abstract_syntax_uids,
            transfer_syntax_uids,
            max_pdu_length,
            strict,
            promiscuous,
            socket_options,
        }
    }

    /// Define the application entity title referring to this DICOM node.
    ///
    /// The default is `THIS-SCP`.
    pub fn ae_title<T>(mut self, ae_title: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.ae_title = ae_title.into();
        self
    }

    /// Include this abstract syntax
    /// in the list of accepted presentation contexts.
    pub fn with_abstract_syntax<T>(mut self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.abstract_syntax_uids.push(abstract_syntax_uid.into());
        self
    }

    /// Include this transfer syntax in each accepted presentation context.
    pub fn with_transfer_syntax<T>(mut self, transfer_syntax_uid: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.transfer_syntax_uids.push(transfer_syntax_uid.into());
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

    /// Override promiscuous mode:
    /// whether to accept unknown abstract syntaxes.
    pub fn promiscuous(mut self, promiscuous: bool) -> Self {
        self.promiscuous = promiscuous;
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

    /// Set the write timeout for the underlying TCP socket.
    pub fn write_timeout(self, timeout: Duration) -> Self {
        Self {
            socket_options: SocketOptions {
                write_timeout: Some(timeout),
                ..self.socket_options
            },
            ..self
        }
    }

    /// Build a fresh state machine with these options,
    /// for callers that drive the socket themselves
    /// (such as the pipelined server).
    pub fn machine(&self) -> ScpMachine {
        let mut options = ScpMachineOptions::new()
            .ae_title(self.ae_title.clone())
            .max_pdu_length(self.max_pdu_length)
            .promiscuous(self.promiscuous)
            .ae_access_control(self.ae_access_control.clone());
        for uid in &self.abstract_syntax_uids {
            options = options.with_abstract_syntax(uid.clone());
        }
        for uid in &self.transfer_syntax_uids {
            options = options.with_transfer_syntax(uid.clone());
        }
        options.build()
    }

    /// Negotiate an association with the given TCP stream.
    pub fn establish(&self, mut socket: TcpStream) -> Result<ServerAssociation> {
        ensure!(
            !self.abstract_syntax_uids.is_empty() || self.promiscuous,
            MissingAbstractSyntaxSnafu
        );

        socket
            .set_read_timeout(self.socket_options.read_timeout)
            .context(super::SetReadTimeoutSnafu)?;
        socket
            .set_write_timeout(self.socket_options.write_timeout)
            .context(super::SetWriteTimeoutSnafu)?;

        let mut machine = self.machine();
        let mut read_buffer =
            BytesMut::with_capacity((self.max_pdu_length + PDU_HEADER_SIZE) as usize);
        let mut write_buffer: Vec<u8> = Vec::with_capacity(self.max_pdu_length as usize);

        let pdu = read_pdu_from_wire(&mut socket, &mut read_buffer, self.max_pdu_length, self.strict)?;
        let outputs = machine.handle_pdu(pdu);

        let mut rejection: Option<AssociationRJ> = None;
        for output in outputs {
            match output {
                ScpOutput::Send(pdu) => {
                    if let Pdu::AssociationRJ(rj) = &pdu {
                        rejection = Some(rj.clone());
                    }
                    write_buffer.clear();
                    write_pdu(&mut write_buffer, &pdu).context(SendPduSnafu)?;
                    socket.write_all(&write_buffer).context(WireSendSnafu)?;
                }
                ScpOutput::Closed => {}
                ScpOutput::Aborted => return AbortedSnafu.fail(),
                output => {
                    warn!("unexpected machine output during establish: {:?}", output);
                }
            }
        }

        if let Some(association_rj) = rejection {
            return RejectedSnafu { association_rj }.fail();
        }

        ensure!(
            machine.state() == AssociationState::Established,
            AbortedSnafu
        );

        Ok(ServerAssociation {
            machine,
            socket,
            read_buffer,
            write_buffer,
            strict: self.strict,
        })
    }
}

/// A DICOM upper level association from the perspective
/// of an accepting application entity.
///
/// The most common operations of an established association are
/// [`send`](Self::send)
/// and [`receive`](Self::receive).
/// Sending large P-Data fragments may be easier through the P-Data sender
/// abstraction (see [`send_pdata`](Self::send_pdata)).
///
/// When the value falls out of scope,
/// the program will shut down the underlying TCP connection.
#[derive(Debug)]
pub struct ServerAssociation {
    /// The state machine driving this association
    machine: ScpMachine,
    /// The TCP stream to the other DICOM node
    socket: TcpStream,
    /// Read buffer from the socket
    read_buffer: BytesMut,
    /// Reusable buffer for sending PDUs on the wire
    write_buffer: Vec<u8>,
    /// whether to receive PDUs in strict mode
    strict: bool,
}

impl ServerAssociation {
    /// Obtain a view of the negotiated presentation contexts.
    pub fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
        self.machine
            .negotiated()
            .map(|n| n.presentation_contexts.as_slice())
            .unwrap_or(&[])
    }

    /// Obtain the negotiation outcome.
    pub fn negotiated(&self) -> Option<&NegotiatedOptions> {
        self.machine.negotiated()
    }

    /// Obtain the remote DICOM node's application entity title.
    pub fn client_ae_title(&self) -> &str {
        self.machine.peer_ae_title().unwrap_or_default()
    }

    /// Retrieve the maximum PDU length admitted by this application entity.
    pub fn acceptor_max_pdu_length(&self) -> u32 {
        self.machine.acceptor_max_pdu_length()
    }

    /// Retrieve the maximum PDU length the requestor is willing to receive.
    pub fn requestor_max_pdu_length(&self) -> u32 {
        self.machine.peer_max_pdu_length()
    }

    /// Send a PDU message to the other intervenient.
    pub fn send(&mut self, pdu: &Pdu) -> Result<()> {
        self.write_buffer.clear();
        write_pdu(&mut self.write_buffer, pdu).context(SendPduSnafu)?;
        self.socket
            .write_all(&self.write_buffer)
            .context(WireSendSnafu)
    }

    /// Read a PDU message from the other intervenient.
    pub fn receive(&mut self) -> Result<Pdu> {
        read_pdu_from_wire(
            &mut self.socket,
            &mut self.read_buffer,
            self.machine.acceptor_max_pdu_length(),
            self.strict,
        )
    }

    /// Prepare a P-Data writer for sending
    /// one or more data items on the given presentation context.
    ///
    /// Returns a writer which automatically
    /// splits the inner data into separate PDUs if necessary.
    pub fn send_pdata(&mut self, presentation_context_id: u8) -> Result<PDataWriter<&mut TcpStream>> {
        ensure!(
            self.machine.transfer_syntax(presentation_context_id).is_some(),
            UnknownPresentationContextSnafu {
                id: presentation_context_id
            }
        );
        Ok(PDataWriter::new(
            &mut self.socket,
            presentation_context_id,
            self.machine.peer_max_pdu_length(),
        ))
    }

    /// Send a command payload on the given presentation context,
    /// fragmenting it as needed.
    pub fn send_command(&mut self, presentation_context_id: u8, data: Vec<u8>) -> Result<()> {
        for pdu in crate::association::pdata::fragment_pdata(
            presentation_context_id,
            PDataValueType::Command,
            data,
            self.machine.peer_max_pdu_length(),
        ) {
            self.send(&pdu)?;
        }
        Ok(())
    }

    /// Wait for the peer's release request and answer it.
    pub fn handle_release(&mut self) -> Result<()> {
        let pdu = self.receive()?;
        for output in self.machine.handle_pdu(pdu) {
            if let ScpOutput::Send(pdu) = output {
                self.send(&pdu)?;
            }
        }
        ensure!(
            self.machine.state() == AssociationState::Closed,
            AbortedSnafu
        );
        Ok(())
    }

    /// Send an A-ABORT and shut down the connection.
    pub fn abort(&mut self) -> Result<()> {
        for output in self.machine.abort() {
            if let ScpOutput::Send(pdu) = output {
                self.send(&pdu)?;
            }
        }
        let _ = self.socket.shutdown(std::net::Shutdown::Both);
        Ok(())
    }

    /// Access the state machine for direct event handling.
    pub fn machine_mut(&mut self) -> &mut ScpMachine {
        &mut self.machine
    }
}
