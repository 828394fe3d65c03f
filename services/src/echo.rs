//! Verification service class provider (C-ECHO).

use pacs_dimse::command::CommandField;
use pacs_dimse::message::DimseMessage;
use pacs_dimse::{status, CommandSet};
use tracing::{debug, warn};

use crate::{uids, DimseService, RequestContext, Responder, Result};

/// Answers C-ECHO-RQ with success.
#[derive(Debug, Default)]
pub struct VerificationScp;

impl DimseService for VerificationScp {
    fn supported_sop_classes(&self) -> &[&'static str] {
        &[uids::VERIFICATION]
    }

    fn handle(
        &self,
        ctx: &RequestContext,
        message: DimseMessage,
        responder: &mut dyn Responder,
    ) -> Result<()> {
        if message.command.command_field != CommandField::CEchoRq {
            warn!(
                "verification service ignoring {}",
                message.command.command_field
            );
            return Ok(());
        }

        debug!("C-ECHO from `{}`", ctx.calling_ae_title);
        responder.respond(DimseMessage {
            context_id: ctx.context_id,
            command: CommandSet::echo_rsp(&message.command, status::SUCCESS),
            dataset: None,
        })
    }
}
