//! DIMSE service class providers.
//!
//! Each service implements the [`DimseService`] trait
//! and is registered in a [`ServiceRegistry`]
//! keyed by the abstract syntax UIDs it serves.
//! The server's `dimse_process` stage dispatches
//! every complete [`DimseMessage`] through the registry;
//! handlers produce their responses through a [`Responder`],
//! so a C-FIND can stream an arbitrary number of pending
//! matches without buffering them.
//!
//! Errors never cross the DIMSE boundary untranslated:
//! every failure a handler can hit resolves to a status code
//! on the response message, and the association survives.

pub mod blob;
pub mod echo;
pub mod find;
pub mod r#move;
pub mod mpps;
pub mod store;
pub mod uids;
pub mod worklist;

pub use blob::{instance_blob_path, BlobStore, FileBlobStore};
pub use echo::VerificationScp;
pub use find::QueryScp;
pub use mpps::MppsScp;
pub use r#move::{MoveScp, RemoteNode};
pub use store::StorageScp;
pub use worklist::WorklistScp;

use std::collections::HashMap;
use std::sync::Arc;

use pacs_dimse::message::DimseMessage;
use pacs_dimse::{status, CommandSet};
use snafu::{Backtrace, Snafu};
use tracing::{debug, warn};

/// An error inside a service handler.
///
/// These are internal: the dispatch layer translates them
/// into DIMSE status codes before anything reaches the peer.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
#[non_exhaustive]
pub enum Error {
    /// DIMSE codec failure
    #[snafu(context(false))]
    Dimse {
        #[snafu(source(from(pacs_dimse::Error, Box::new)))]
        source: Box<pacs_dimse::Error>,
    },

    /// storage index failure
    #[snafu(context(false))]
    Index {
        #[snafu(source(from(pacs_index::Error, Box::new)))]
        source: Box<pacs_index::Error>,
    },

    #[snafu(display("could not write blob `{}`", path))]
    BlobWrite {
        path: String,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("could not read blob `{}`", path))]
    BlobRead {
        path: String,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("blob path `{}` is not valid", path))]
    BlobPath { path: String, backtrace: Backtrace },

    #[snafu(display("request is missing `{}`", what))]
    MissingAttribute {
        what: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("no service registered for SOP class `{}`", uid))]
    UnknownSopClass { uid: String, backtrace: Backtrace },

    #[snafu(display("unknown move destination `{}`", ae_title))]
    UnknownDestination {
        ae_title: String,
        backtrace: Backtrace,
    },

    /// failure on the outbound sub-operation association
    SubOperation {
        #[snafu(source(from(pacs_ul::association::Error, Box::new)))]
        source: Box<pacs_ul::association::Error>,
    },

    #[snafu(display("could not deliver response: {}", message))]
    Respond {
        message: String,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The identity of one DIMSE request within its association.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// the session (association) identifier
    pub session_id: u64,
    /// the presentation context the request arrived on
    pub context_id: u8,
    /// the abstract syntax negotiated for that context
    pub abstract_syntax: String,
    /// the transfer syntax negotiated for that context
    pub transfer_syntax: String,
    /// the AE title of the requesting peer
    pub calling_ae_title: String,
    /// the AE title of this node
    pub called_ae_title: String,
}

/// Sink for response messages.
///
/// The pipelined server submits each response
/// to the response encoding stage;
/// tests collect them in memory.
pub trait Responder {
    fn respond(&mut self, message: DimseMessage) -> Result<()>;
}

impl<F> Responder for F
where
    F: FnMut(DimseMessage) -> Result<()>,
{
    fn respond(&mut self, message: DimseMessage) -> Result<()> {
        self(message)
    }
}

/// A DIMSE service handler for one or more SOP classes.
pub trait DimseService: Send + Sync {
    /// The abstract syntax UIDs this service serves.
    fn supported_sop_classes(&self) -> &[&'static str];

    /// Handle one complete request message,
    /// producing zero or more responses through the responder.
    fn handle(
        &self,
        ctx: &RequestContext,
        message: DimseMessage,
        responder: &mut dyn Responder,
    ) -> Result<()>;
}

/// Routes DIMSE messages to the service
/// registered for their presentation context's abstract syntax.
#[derive(Default, Clone)]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<dyn DimseService>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        ServiceRegistry::default()
    }

    /// Register a service under every SOP class it supports.
    pub fn register(&mut self, service: Arc<dyn DimseService>) {
        for sop_class in service.supported_sop_classes() {
            let previous = self
                .services
                .insert((*sop_class).to_string(), Arc::clone(&service));
            if previous.is_some() {
                warn!("service for `{}` was replaced", sop_class);
            }
        }
    }

    /// The service registered for an abstract syntax, if any.
    pub fn get(&self, abstract_syntax: &str) -> Option<&Arc<dyn DimseService>> {
        self.services.get(abstract_syntax)
    }

    /// All registered abstract syntaxes,
    /// for advertising them at association negotiation.
    pub fn abstract_syntaxes(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    /// Dispatch a message to its handler.
    ///
    /// An unknown SOP class is answered with
    /// "SOP class not supported" when the command has a response;
    /// handler errors are translated to a failure status
    /// so that the association survives.
    pub fn dispatch(
        &self,
        ctx: &RequestContext,
        message: DimseMessage,
        responder: &mut dyn Responder,
    ) -> Result<()> {
        let Some(service) = self.get(&ctx.abstract_syntax) else {
            warn!(
                "no service for abstract syntax `{}` (from `{}`)",
                ctx.abstract_syntax, ctx.calling_ae_title
            );
            return refuse(
                ctx,
                &message.command,
                status::REFUSED_SOP_CLASS_NOT_SUPPORTED,
                responder,
            );
        };

        debug!(
            "dispatching {} on context {} for `{}`",
            message.command.command_field, ctx.context_id, ctx.calling_ae_title
        );

        let command = message.command.clone();
        match service.handle(ctx, message, responder) {
            Ok(()) => Ok(()),
            Err(error) => {
                warn!("{} handler failed: {}", command.command_field, error);
                refuse(ctx, &command, failure_status(&error), responder)
            }
        }
    }
}

/// Send a plain failure response for the given request,
/// when the command has a response at all.
fn refuse(
    ctx: &RequestContext,
    command: &CommandSet,
    status: status::StatusCode,
    responder: &mut dyn Responder,
) -> Result<()> {
    let Some(response) = CommandSet::generic_rsp(command, status) else {
        return Ok(());
    };
    responder.respond(DimseMessage {
        context_id: ctx.context_id,
        command: response,
        dataset: None,
    })
}

/// Translate an internal error into the DIMSE status
/// reported to the peer.
pub fn failure_status(error: &Error) -> status::StatusCode {
    match error {
        // the request itself could not be interpreted
        Error::Dimse { .. } | Error::MissingAttribute { .. } => status::ERROR_CANNOT_UNDERSTAND,
        // resource-level failures
        Error::BlobWrite { .. } => status::REFUSED_OUT_OF_RESOURCES,
        Error::BlobRead { .. } | Error::BlobPath { .. } => status::ERROR_UNABLE_TO_PROCESS,
        Error::UnknownSopClass { .. } => status::REFUSED_SOP_CLASS_NOT_SUPPORTED,
        Error::UnknownDestination { .. } => status::REFUSED_MOVE_DESTINATION_UNKNOWN,
        Error::SubOperation { .. } => status::REFUSED_OUT_OF_RESOURCES_SUBOPS,
        Error::Index { source, .. } => match source.as_ref() {
            pacs_index::Error::DuplicateMpps { .. } => status::ERROR_DUPLICATE_SOP_INSTANCE,
            pacs_index::Error::InvalidStateTransition { .. } => status::ERROR_UNABLE_TO_PROCESS,
            pacs_index::Error::InvalidRecord { .. } => status::ERROR_CANNOT_UNDERSTAND,
            _ => status::ERROR_UNABLE_TO_PROCESS,
        },
        Error::Respond { .. } => status::ERROR_UNABLE_TO_PROCESS,
    }
}
