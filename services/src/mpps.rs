//! MPPS service class provider (N-CREATE / N-SET).
//!
//! N-CREATE opens a procedure step in `IN PROGRESS`
//! and flips the matching worklist item to `STARTED`;
//! N-SET moves the step to `COMPLETED` or `DISCONTINUED`
//! and completes the worklist item.
//! The index enforces that final states reject further updates.

use std::sync::Arc;

use pacs_dimse::command::CommandField;
use pacs_dimse::dataset::DataSet;
use pacs_dimse::message::DimseMessage;
use pacs_dimse::{status, tags, CommandSet};
use pacs_index::{IndexDatabase, MppsRecord, WorklistStatus};
use tracing::{debug, info, warn};

use crate::{uids, DimseService, MissingAttributeSnafu, RequestContext, Responder, Result};

/// Tracks Modality Performed Procedure Steps.
pub struct MppsScp {
    index: Arc<IndexDatabase>,
}

impl MppsScp {
    pub fn new(index: Arc<IndexDatabase>) -> MppsScp {
        MppsScp { index }
    }

    fn handle_n_create(
        &self,
        ctx: &RequestContext,
        command: &CommandSet,
        dataset: Option<&[u8]>,
        responder: &mut dyn Responder,
    ) -> Result<()> {
        let mpps_uid = command
            .affected_sop_instance_uid
            .clone()
            .filter(|uid| !uid.is_empty())
            .ok_or_else(|| {
                MissingAttributeSnafu {
                    what: "Affected SOP Instance UID",
                }
                .build()
            })?;

        let attributes = match dataset {
            Some(bytes) => DataSet::read(bytes, &ctx.transfer_syntax)?,
            None => DataSet::new(),
        };

        let mut record = MppsRecord::new(mpps_uid.clone());
        record.station_ae = attributes
            .get_str(tags::PERFORMED_STATION_AE_TITLE)
            .unwrap_or_else(|| ctx.calling_ae_title.clone());
        record.modality = attributes.get_str(tags::MODALITY).unwrap_or_default();
        record.study_uid = attributes
            .get_str(tags::STUDY_INSTANCE_UID)
            .unwrap_or_default();
        record.accession_no = attributes
            .get_str(tags::ACCESSION_NUMBER)
            .unwrap_or_default();
        record.scheduled_step_id = attributes
            .get_str(tags::SCHEDULED_PROCEDURE_STEP_ID)
            .unwrap_or_default();
        record.requested_proc_id = attributes
            .get_str(tags::REQUESTED_PROCEDURE_ID)
            .unwrap_or_default();
        record.start_datetime = format!(
            "{}{}",
            attributes
                .get_str(tags::PERFORMED_PROCEDURE_STEP_START_DATE)
                .unwrap_or_default(),
            attributes
                .get_str(tags::PERFORMED_PROCEDURE_STEP_START_TIME)
                .unwrap_or_default(),
        );

        let scheduled_step_id = record.scheduled_step_id.clone();
        let accession_no = record.accession_no.clone();

        let status = match self.index.create_mpps(&record) {
            Ok(_pk) => {
                info!("MPPS `{}` created by `{}`", mpps_uid, ctx.calling_ae_title);

                // the matching worklist item starts now; a step without
                // a worklist entry is legal (unscheduled procedure)
                if !scheduled_step_id.is_empty() {
                    if let Err(error) = self.index.update_worklist_status(
                        &scheduled_step_id,
                        &accession_no,
                        WorklistStatus::Started,
                    ) {
                        debug!("worklist not started for `{}`: {}", scheduled_step_id, error);
                    }
                }
                status::SUCCESS
            }
            Err(error) => {
                warn!("N-CREATE for `{}` failed: {}", mpps_uid, error);
                crate::failure_status(&crate::Error::Index {
                    source: Box::new(error),
                })
            }
        };

        responder.respond(DimseMessage {
            context_id: ctx.context_id,
            command: CommandSet::n_create_rsp(command, status),
            dataset: None,
        })
    }

    fn handle_n_set(
        &self,
        ctx: &RequestContext,
        command: &CommandSet,
        dataset: Option<&[u8]>,
        responder: &mut dyn Responder,
    ) -> Result<()> {
        let mpps_uid = command
            .requested_sop_instance_uid
            .clone()
            .filter(|uid| !uid.is_empty())
            .ok_or_else(|| {
                MissingAttributeSnafu {
                    what: "Requested SOP Instance UID",
                }
                .build()
            })?;

        let attributes = match dataset {
            Some(bytes) => DataSet::read(bytes, &ctx.transfer_syntax)?,
            None => DataSet::new(),
        };

        let mut update = MppsRecord::new(mpps_uid.clone());
        update.status = attributes
            .get_str(tags::PERFORMED_PROCEDURE_STEP_STATUS)
            .unwrap_or_default();
        update.end_datetime = format!(
            "{}{}",
            attributes
                .get_str(tags::PERFORMED_PROCEDURE_STEP_END_DATE)
                .unwrap_or_default(),
            attributes
                .get_str(tags::PERFORMED_PROCEDURE_STEP_END_TIME)
                .unwrap_or_default(),
        );

        let status = match self.index.update_mpps(&update) {
            Ok(()) => {
                info!(
                    "MPPS `{}` updated{} by `{}`",
                    mpps_uid,
                    if update.status.is_empty() {
                        String::new()
                    } else {
                        format!(" to {}", update.status)
                    },
                    ctx.calling_ae_title
                );

                // a completed step completes its worklist item
                if update.status == "COMPLETED" {
                    if let Ok(Some(record)) = self.index.find_mpps(&mpps_uid) {
                        if !record.scheduled_step_id.is_empty() {
                            if let Err(error) = self.index.update_worklist_status(
                                &record.scheduled_step_id,
                                &record.accession_no,
                                WorklistStatus::Completed,
                            ) {
                                debug!(
                                    "worklist not completed for `{}`: {}",
                                    record.scheduled_step_id, error
                                );
                            }
                        }
                    }
                }
                status::SUCCESS
            }
            Err(error) => {
                warn!("N-SET for `{}` rejected: {}", mpps_uid, error);
                crate::failure_status(&crate::Error::Index {
                    source: Box::new(error),
                })
            }
        };

        responder.respond(DimseMessage {
            context_id: ctx.context_id,
            command: CommandSet::n_set_rsp(command, status),
            dataset: None,
        })
    }
}

impl DimseService for MppsScp {
    fn supported_sop_classes(&self) -> &[&'static str] {
        &[uids::MODALITY_PERFORMED_PROCEDURE_STEP]
    }

    fn handle(
        &self,
        ctx: &RequestContext,
        message: DimseMessage,
        responder: &mut dyn Responder,
    ) -> Result<()> {
        match message.command.command_field {
            CommandField::NCreateRq => self.handle_n_create(
                ctx,
                &message.command,
                message.dataset.as_deref(),
                responder,
            ),
            CommandField::NSetRq => {
                self.handle_n_set(ctx, &message.command, message.dataset.as_deref(), responder)
            }
            other => {
                warn!("MPPS service ignoring {}", other);
                Ok(())
            }
        }
    }
}
