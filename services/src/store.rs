//! Storage service class provider (C-STORE).
//!
//! An inbound instance is written to the blob store first,
//! then the whole patient/study/series/instance chain
//! is upserted in one index transaction.
//! If the index write fails, the freshly written blob is removed,
//! so the two stores never disagree about what was received.

use std::sync::Arc;

use pacs_dimse::command::CommandField;
use pacs_dimse::dataset::DataSet;
use pacs_dimse::message::DimseMessage;
use pacs_dimse::{status, tags, CommandSet};
use pacs_index::{
    AuditRecord, IndexDatabase, InstanceRecord, PatientRecord, SeriesRecord, StudyRecord,
};
use tracing::{info, warn};

use crate::blob::{instance_blob_path, BlobStore};
use crate::{uids, DimseService, MissingAttributeSnafu, RequestContext, Responder, Result};

/// Stores inbound composite instances.
pub struct StorageScp {
    index: Arc<IndexDatabase>,
    blobs: Arc<dyn BlobStore>,
}

impl StorageScp {
    pub fn new(index: Arc<IndexDatabase>, blobs: Arc<dyn BlobStore>) -> StorageScp {
        StorageScp { index, blobs }
    }

    /// Pull the entity chain out of the received data set.
    fn records_from_dataset(
        &self,
        command: &CommandSet,
        dataset: &DataSet,
        transfer_syntax: &str,
        file_size: i64,
    ) -> Result<(PatientRecord, StudyRecord, SeriesRecord, InstanceRecord, String)> {
        let sop_uid = command
            .affected_sop_instance_uid
            .clone()
            .or_else(|| dataset.get_str(tags::SOP_INSTANCE_UID))
            .filter(|uid| !uid.is_empty())
            .ok_or_else(|| {
                MissingAttributeSnafu {
                    what: "SOP Instance UID",
                }
                .build()
            })?;
        let sop_class_uid = command
            .affected_sop_class_uid
            .clone()
            .or_else(|| dataset.get_str(tags::SOP_CLASS_UID))
            .filter(|uid| !uid.is_empty())
            .ok_or_else(|| {
                MissingAttributeSnafu {
                    what: "SOP Class UID",
                }
                .build()
            })?;
        let study_uid = dataset
            .get_str(tags::STUDY_INSTANCE_UID)
            .filter(|uid| !uid.is_empty())
            .ok_or_else(|| {
                MissingAttributeSnafu {
                    what: "Study Instance UID",
                }
                .build()
            })?;
        let series_uid = dataset
            .get_str(tags::SERIES_INSTANCE_UID)
            .filter(|uid| !uid.is_empty())
            .ok_or_else(|| {
                MissingAttributeSnafu {
                    what: "Series Instance UID",
                }
                .build()
            })?;

        // an absent patient id gets a fallback key, as unidentified
        // patients must still be retrievable by study
        let patient_id = dataset
            .get_str(tags::PATIENT_ID)
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| "UNKNOWN".to_string());

        let mut patient = PatientRecord::new(patient_id);
        patient.patient_name = dataset.get_str(tags::PATIENT_NAME).unwrap_or_default();
        patient.birth_date = dataset.get_str(tags::PATIENT_BIRTH_DATE).unwrap_or_default();
        patient.sex = dataset.get_str(tags::PATIENT_SEX).unwrap_or_default();

        let mut study = StudyRecord::new(study_uid.clone());
        study.study_id = dataset.get_str(tags::STUDY_ID).unwrap_or_default();
        study.study_date = dataset.get_str(tags::STUDY_DATE).unwrap_or_default();
        study.study_time = dataset.get_str(tags::STUDY_TIME).unwrap_or_default();
        study.accession_number = dataset.get_str(tags::ACCESSION_NUMBER).unwrap_or_default();
        study.referring_physician = dataset
            .get_str(tags::REFERRING_PHYSICIAN_NAME)
            .unwrap_or_default();
        study.study_description = dataset.get_str(tags::STUDY_DESCRIPTION).unwrap_or_default();

        let mut series = SeriesRecord::new(series_uid.clone());
        series.modality = dataset.get_str(tags::MODALITY).unwrap_or_default();
        series.series_number = dataset.get_int(tags::SERIES_NUMBER);
        series.series_description = dataset
            .get_str(tags::SERIES_DESCRIPTION)
            .unwrap_or_default();
        series.body_part_examined = dataset
            .get_str(tags::BODY_PART_EXAMINED)
            .unwrap_or_default();
        series.station_name = dataset.get_str(tags::STATION_NAME).unwrap_or_default();

        let file_path = instance_blob_path(&study_uid, &series_uid, &sop_uid);
        let mut instance = InstanceRecord::new(sop_uid);
        instance.sop_class_uid = sop_class_uid;
        instance.file_path = file_path.clone();
        instance.file_size = file_size;
        instance.transfer_syntax = transfer_syntax.to_string();
        instance.instance_number = dataset.get_int(tags::INSTANCE_NUMBER);

        Ok((patient, study, series, instance, file_path))
    }

    fn audit(&self, ctx: &RequestContext, outcome: &str, patient_id: &str, study_uid: &str, message: String) {
        let result = self.index.add_audit_log(&AuditRecord {
            event_type: "C-STORE".to_string(),
            outcome: outcome.to_string(),
            actor_ae: ctx.calling_ae_title.clone(),
            patient_id: patient_id.to_string(),
            study_uid: study_uid.to_string(),
            message,
            ..Default::default()
        });
        if let Err(error) = result {
            warn!("audit log write failed: {}", error);
        }
    }
}

impl DimseService for StorageScp {
    fn supported_sop_classes(&self) -> &[&'static str] {
        uids::STORAGE_SOP_CLASSES
    }

    fn handle(
        &self,
        ctx: &RequestContext,
        message: DimseMessage,
        responder: &mut dyn Responder,
    ) -> Result<()> {
        if message.command.command_field != CommandField::CStoreRq {
            warn!("storage service ignoring {}", message.command.command_field);
            return Ok(());
        }

        let command = message.command;
        let mut respond = |status| {
            responder.respond(DimseMessage {
                context_id: ctx.context_id,
                command: CommandSet::store_rsp(&command, status),
                dataset: None,
            })
        };

        let Some(payload) = message.dataset else {
            warn!("C-STORE without a data set from `{}`", ctx.calling_ae_title);
            return respond(status::ERROR_CANNOT_UNDERSTAND);
        };

        // the scanner only pulls the top-level string attributes;
        // the payload itself is stored verbatim
        let dataset = match DataSet::read(&payload, &ctx.transfer_syntax) {
            Ok(dataset) => dataset,
            Err(error) => {
                warn!("unreadable C-STORE data set: {}", error);
                self.audit(ctx, "FAILURE", "", "", format!("unreadable data set: {error}"));
                return respond(status::ERROR_CANNOT_UNDERSTAND);
            }
        };

        let (patient, study, series, instance, file_path) = match self.records_from_dataset(
            &command,
            &dataset,
            &ctx.transfer_syntax,
            payload.len() as i64,
        ) {
            Ok(parts) => parts,
            Err(error) => {
                warn!("C-STORE rejected: {}", error);
                self.audit(ctx, "FAILURE", "", "", error.to_string());
                return respond(status::ERROR_CANNOT_UNDERSTAND);
            }
        };

        // blob first; a failed index write removes it again below
        if let Err(error) = self.blobs.put(&file_path, &payload) {
            warn!("blob write failed: {}", error);
            self.audit(
                ctx,
                "FAILURE",
                &patient.patient_id,
                &study.study_uid,
                error.to_string(),
            );
            return respond(status::REFUSED_OUT_OF_RESOURCES);
        }

        match self
            .index
            .upsert_instance_chain(&patient, &study, &series, &instance)
        {
            Ok(_pk) => {
                info!(
                    "stored instance `{}` from `{}` ({} bytes)",
                    instance.sop_uid,
                    ctx.calling_ae_title,
                    payload.len()
                );
                self.audit(
                    ctx,
                    "SUCCESS",
                    &patient.patient_id,
                    &study.study_uid,
                    format!("stored `{}`", instance.sop_uid),
                );
                respond(status::SUCCESS)
            }
            Err(error) => {
                warn!("index write failed, removing blob: {}", error);
                if let Err(cleanup) = self.blobs.remove(&file_path) {
                    warn!("blob cleanup failed as well: {}", cleanup);
                }
                self.audit(
                    ctx,
                    "FAILURE",
                    &patient.patient_id,
                    &study.study_uid,
                    error.to_string(),
                );
                respond(status::ERROR_UNABLE_TO_PROCESS)
            }
        }
    }
}
