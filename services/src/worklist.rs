//! Modality Worklist service class provider (MWL C-FIND).
//!
//! Scheduled procedure steps are matched against the identifier
//! and streamed back as pending responses, like any C-FIND.
//! Only `SCHEDULED` items are returned to modalities.

use std::sync::Arc;

use pacs_dimse::command::CommandField;
use pacs_dimse::dataset::DataSet;
use pacs_dimse::message::DimseMessage;
use pacs_dimse::{status, tags, CommandSet};
use pacs_index::{IndexDatabase, WorklistQuery};
use pacs_pipeline::CancelRegistry;
use tracing::{debug, warn};

use crate::{uids, DimseService, MissingAttributeSnafu, RequestContext, Responder, Result};

/// Serves the modality worklist to modalities.
pub struct WorklistScp {
    index: Arc<IndexDatabase>,
    cancels: Arc<CancelRegistry>,
}

impl WorklistScp {
    pub fn new(index: Arc<IndexDatabase>, cancels: Arc<CancelRegistry>) -> WorklistScp {
        WorklistScp { index, cancels }
    }
}

fn filter_value(identifier: &DataSet, tag: tags::Tag) -> Option<String> {
    identifier
        .get_str(tag)
        .filter(|v| !v.is_empty() && v != "*")
}

impl DimseService for WorklistScp {
    fn supported_sop_classes(&self) -> &[&'static str] {
        &[uids::MODALITY_WORKLIST_FIND]
    }

    fn handle(
        &self,
        ctx: &RequestContext,
        message: DimseMessage,
        responder: &mut dyn Responder,
    ) -> Result<()> {
        let command = message.command;
        match command.command_field {
            CommandField::CFindRq => {}
            CommandField::CCancelRq => return Ok(()),
            other => {
                warn!("worklist service ignoring {}", other);
                return Ok(());
            }
        }

        let payload = message.dataset.ok_or_else(|| {
            MissingAttributeSnafu {
                what: "worklist identifier",
            }
            .build()
        })?;
        let identifier = DataSet::read(&payload, &ctx.transfer_syntax)?;

        let (scheduled_from, scheduled_to) = identifier
            .get_str(tags::SCHEDULED_PROCEDURE_STEP_START_DATE)
            .filter(|v| !v.is_empty() && v != "*")
            .map(|v| match v.split_once('-') {
                Some((from, to)) => (
                    (!from.is_empty()).then(|| format!("{from}000000")),
                    (!to.is_empty()).then(|| format!("{to}235959")),
                ),
                None => (Some(format!("{v}000000")), Some(format!("{v}235959"))),
            })
            .unwrap_or((None, None));

        let query = WorklistQuery {
            step_id: filter_value(&identifier, tags::SCHEDULED_PROCEDURE_STEP_ID),
            patient_id: filter_value(&identifier, tags::PATIENT_ID),
            patient_name: filter_value(&identifier, tags::PATIENT_NAME),
            accession_no: filter_value(&identifier, tags::ACCESSION_NUMBER),
            modality: filter_value(&identifier, tags::MODALITY),
            station_ae: filter_value(&identifier, tags::SCHEDULED_STATION_AE_TITLE),
            scheduled_from,
            scheduled_to,
            ..Default::default()
        };

        let items = self.index.query_worklist(&query)?;
        debug!(
            "MWL C-FIND from `{}`: {} scheduled item(s)",
            ctx.calling_ae_title,
            items.len()
        );

        let message_id = command.message_id.unwrap_or_default();
        for item in items {
            if self.cancels.is_cancelled(ctx.session_id, message_id) {
                self.cancels.clear(ctx.session_id, message_id);
                return responder.respond(DimseMessage {
                    context_id: ctx.context_id,
                    command: CommandSet::find_rsp(&command, status::CANCEL, false),
                    dataset: None,
                });
            }

            let mut out = DataSet::new();
            out.put_str(tags::PATIENT_ID, item.patient_id);
            out.put_str(tags::PATIENT_NAME, item.patient_name);
            out.put_str(tags::PATIENT_BIRTH_DATE, item.birth_date);
            out.put_str(tags::PATIENT_SEX, item.sex);
            out.put_str(tags::ACCESSION_NUMBER, item.accession_no);
            out.put_str(tags::STUDY_INSTANCE_UID, item.study_uid);
            out.put_str(tags::MODALITY, item.modality);
            out.put_str(tags::SCHEDULED_STATION_AE_TITLE, item.station_ae);
            out.put_str(tags::SCHEDULED_PROCEDURE_STEP_ID, item.step_id);
            out.put_str(
                tags::SCHEDULED_PROCEDURE_STEP_DESCRIPTION,
                item.procedure_desc,
            );
            out.put_str(tags::REQUESTED_PROCEDURE_ID, item.requested_proc_id);
            if item.scheduled_datetime.len() >= 8 {
                out.put_str(
                    tags::SCHEDULED_PROCEDURE_STEP_START_DATE,
                    &item.scheduled_datetime[..8],
                );
                if item.scheduled_datetime.len() >= 14 {
                    out.put_str(
                        tags::SCHEDULED_PROCEDURE_STEP_START_TIME,
                        &item.scheduled_datetime[8..14],
                    );
                }
            }

            responder.respond(DimseMessage {
                context_id: ctx.context_id,
                command: CommandSet::find_rsp(&command, status::PENDING, true),
                dataset: Some(out.encode(&ctx.transfer_syntax)?),
            })?;
        }

        responder.respond(DimseMessage {
            context_id: ctx.context_id,
            command: CommandSet::find_rsp(&command, status::SUCCESS, false),
            dataset: None,
        })
    }
}
