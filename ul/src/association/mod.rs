//! DICOM association module
//!
//! This module contains the association state machine
//! and the utilities for establishing associations
//! between DICOM nodes via TCP/IP.
//!
//! - [`machine`] holds the sans-IO SCP state machine,
//!   which consumes decoded PDUs and emits actions;
//!   it is the piece driven by the I/O pipeline.
//! - [`server`] and [`client`] are the socket-facing drivers
//!   for the acceptor and requestor roles.
//! - [`pdata`] provides a writer abstraction
//!   which fragments P-Data payloads
//!   to honor the peer's maximum PDU length.

use std::io::Read;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use snafu::{Backtrace, ResultExt, Snafu};

use crate::pdu::reader::DecodeError;
use crate::pdu::writer::EncodeError;
use crate::pdu::{
    pdu_length, read_pdu, AssociationRJ, AssociationRJServiceUserReason, Pdu,
    PresentationContextNegotiated, UserVariableItem, PDU_HEADER_SIZE,
};

pub mod client;
pub mod machine;
pub mod pdata;
pub mod server;
pub(crate) mod uid;

/// An error during association negotiation or traffic.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
#[non_exhaustive]
pub enum Error {
    /// missing abstract syntax to begin negotiation
    MissingAbstractSyntax { backtrace: Backtrace },

    /// could not connect to peer
    Connect {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not set socket read timeout
    SetReadTimeout {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not set socket write timeout
    SetWriteTimeout {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// failed to encode an outgoing PDU
    SendPdu {
        #[snafu(source(from(EncodeError, Box::new)))]
        source: Box<EncodeError>,
    },

    /// failed to send PDU bytes on the wire
    WireSend {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// failed to read PDU bytes from the wire
    WireRecv {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// the connection was closed by the peer
    ConnectionClosed { backtrace: Backtrace },

    /// failed to decode an incoming PDU
    ReceivePdu {
        #[snafu(source(from(DecodeError, Box::new)))]
        source: Box<DecodeError>,
    },

    #[snafu(display("association rejected by the peer: {:?}", association_rj))]
    Rejected {
        association_rj: AssociationRJ,
        backtrace: Backtrace,
    },

    /// association aborted
    Aborted { backtrace: Backtrace },

    #[snafu(display("unexpected PDU `{}` for the association state", pdu.short_description()))]
    #[non_exhaustive]
    UnexpectedPdu {
        /// the PDU obtained from the other node
        pdu: Box<Pdu>,
        backtrace: Backtrace,
    },

    /// no presentation contexts accepted by the peer
    NoAcceptedPresentationContexts { backtrace: Backtrace },

    #[snafu(display("attempted to send a message on unknown presentation context {}", id))]
    UnknownPresentationContext { id: u8, backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The outcome of a successful association negotiation,
/// frozen for the lifetime of the association.
#[derive(Debug, Clone)]
pub struct NegotiatedOptions {
    /// the application entity title of the peer node
    pub peer_ae_title: String,
    /// the maximum PDU length the peer is willing to receive
    /// (an advertised 0 is normalized to "practically unlimited")
    pub peer_max_pdu_length: u32,
    /// all negotiated presentation contexts,
    /// including the ones that were not accepted
    pub presentation_contexts: Vec<PresentationContextNegotiated>,
    /// the user variables received from the peer
    pub user_variables: Vec<UserVariableItem>,
}

impl NegotiatedOptions {
    /// Obtain the accepted presentation context with the given identifier.
    pub fn accepted_context(&self, id: u8) -> Option<&PresentationContextNegotiated> {
        self.presentation_contexts.iter().find(|pc| {
            pc.id == id
                && pc.reason == crate::pdu::PresentationContextResultReason::Acceptance
        })
    }
}

/// Options for the underlying TCP socket of an association.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketOptions {
    /// Timeout for individual receive operations
    pub read_timeout: Option<Duration>,
    /// Timeout for individual send operations
    pub write_timeout: Option<Duration>,
    /// Timeout for the initial connection
    pub connection_timeout: Option<Duration>,
}

/// Common interface for application entity access control policies.
///
/// Existing implementations include [`AcceptAny`] and [`AcceptCalledAeTitle`],
/// but users are free to implement their own.
pub trait AccessControl: Send + Sync {
    /// Obtain the decision of whether to accept an incoming association
    /// request based on the recorded application entity titles.
    ///
    /// Returns `Ok(())` if the requesting node should be given clearance.
    /// Otherwise, a concrete association RJ service user reason is given.
    fn check_access(
        &self,
        this_ae_title: &str,
        calling_ae_title: &str,
        called_ae_title: &str,
    ) -> Result<(), AssociationRJServiceUserReason>;
}

/// An access control rule that accepts any incoming association request.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptAny;

impl AccessControl for AcceptAny {
    fn check_access(
        &self,
        _this_ae_title: &str,
        _calling_ae_title: &str,
        _called_ae_title: &str,
    ) -> Result<(), AssociationRJServiceUserReason> {
        Ok(())
    }
}

/// An access control rule that accepts association requests
/// in which the called AE title matches this node's AE title.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptCalledAeTitle;

impl AccessControl for AcceptCalledAeTitle {
    fn check_access(
        &self,
        this_ae_title: &str,
        _calling_ae_title: &str,
        called_ae_title: &str,
    ) -> Result<(), AssociationRJServiceUserReason> {
        if this_ae_title == called_ae_title {
            Ok(())
        } else {
            Err(AssociationRJServiceUserReason::CalledAETitleNotRecognized)
        }
    }
}

/// An access control rule that accepts association requests
/// only from a fixed set of calling AE titles.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct AcceptKnownCallingAeTitles {
    pub calling_ae_titles: Vec<String>,
}

impl AccessControl for AcceptKnownCallingAeTitles {
    fn check_access(
        &self,
        _this_ae_title: &str,
        calling_ae_title: &str,
        _called_ae_title: &str,
    ) -> Result<(), AssociationRJServiceUserReason> {
        if self
            .calling_ae_titles
            .iter()
            .any(|ae| ae == calling_ae_title)
        {
            Ok(())
        } else {
            Err(AssociationRJServiceUserReason::CallingAETitleNotRecognized)
        }
    }
}

/// Read bytes from the wire until one complete PDU can be decoded.
///
/// `buffer` carries bytes left over from previous reads,
/// so back-to-back PDUs in one TCP segment are not lost.
pub(crate) fn read_pdu_from_wire<R>(
    reader: &mut R,
    buffer: &mut BytesMut,
    max_pdu_length: u32,
    strict: bool,
) -> Result<Pdu>
where
    R: Read,
{
    let mut chunk = [0u8; 8192];
    loop {
        if buffer.len() >= PDU_HEADER_SIZE as usize {
            // the decoder reports over-long PDUs from the header alone,
            // so a hostile length prefix cannot make us buffer forever
            match read_pdu(buffer, max_pdu_length, strict) {
                Ok(pdu) => {
                    let n = pdu_length(buffer).expect("complete PDU was just decoded");
                    buffer.advance(n);
                    return Ok(pdu);
                }
                Err(e) if e.is_incomplete() => {}
                Err(e) => return Err(e).context(ReceivePduSnafu),
            }
        }

        let n = reader.read(&mut chunk).context(WireRecvSnafu)?;
        if n == 0 {
            return ConnectionClosedSnafu.fail();
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
}
