//! Query service class provider (C-FIND).
//!
//! The identifier data set is translated into an index query
//! at the requested level, and every match is streamed back
//! as a pending response before the single final response.
//! Each response identifier is built inside the streaming loop,
//! so the cancellation checkpoint before every pending page
//! actually interrupts the remaining work.
//! A cancelled query finishes with the Cancel status.

use std::sync::Arc;

use pacs_dimse::command::CommandField;
use pacs_dimse::dataset::DataSet;
use pacs_dimse::message::DimseMessage;
use pacs_dimse::{status, tags, CommandSet};
use pacs_index::{
    IndexDatabase, InstanceQuery, InstanceRecord, PatientQuery, PatientRecord, SeriesQuery,
    SeriesRecord, StudyQuery, StudyRecord,
};
use pacs_pipeline::CancelRegistry;
use tracing::{debug, warn};

use crate::{uids, DimseService, MissingAttributeSnafu, RequestContext, Responder, Result};

/// Answers C-FIND queries at the patient, study,
/// series and image levels.
pub struct QueryScp {
    index: Arc<IndexDatabase>,
    cancels: Arc<CancelRegistry>,
}

impl QueryScp {
    pub fn new(index: Arc<IndexDatabase>, cancels: Arc<CancelRegistry>) -> QueryScp {
        QueryScp { index, cancels }
    }

    /// Stream one pending response per row, then the final response.
    ///
    /// `build` runs per row inside the loop;
    /// the cancel flag is observed before every page.
    fn stream_matches<T>(
        &self,
        ctx: &RequestContext,
        command: &CommandSet,
        responder: &mut dyn Responder,
        rows: Vec<T>,
        mut build: impl FnMut(&T) -> Result<Vec<u8>>,
    ) -> Result<()> {
        let message_id = command.message_id.unwrap_or_default();

        for row in &rows {
            if self.cancels.is_cancelled(ctx.session_id, message_id) {
                self.cancels.clear(ctx.session_id, message_id);
                debug!("C-FIND {} cancelled by the peer", message_id);
                return responder.respond(DimseMessage {
                    context_id: ctx.context_id,
                    command: CommandSet::find_rsp(command, status::CANCEL, false),
                    dataset: None,
                });
            }

            let identifier = build(row)?;
            responder.respond(DimseMessage {
                context_id: ctx.context_id,
                command: CommandSet::find_rsp(command, status::PENDING, true),
                dataset: Some(identifier),
            })?;
        }

        responder.respond(DimseMessage {
            context_id: ctx.context_id,
            command: CommandSet::find_rsp(command, status::SUCCESS, false),
            dataset: None,
        })
    }

    fn patient_identifier(
        &self,
        patient: &PatientRecord,
        transfer_syntax: &str,
    ) -> Result<Vec<u8>> {
        let mut out = DataSet::new();
        out.put_str(tags::QUERY_RETRIEVE_LEVEL, "PATIENT");
        out.put_str(tags::PATIENT_ID, patient.patient_id.clone());
        out.put_str(tags::PATIENT_NAME, patient.patient_name.clone());
        out.put_str(tags::PATIENT_BIRTH_DATE, patient.birth_date.clone());
        out.put_str(tags::PATIENT_SEX, patient.sex.clone());
        Ok(out.encode(transfer_syntax)?)
    }

    fn study_identifier(&self, study: &StudyRecord, transfer_syntax: &str) -> Result<Vec<u8>> {
        let patient = self.index.find_patient_by_pk(study.patient_pk)?;
        let related_series = self.index.series_count_for_study(&study.study_uid)?;

        let mut out = DataSet::new();
        out.put_str(tags::QUERY_RETRIEVE_LEVEL, "STUDY");
        out.put_str(tags::STUDY_INSTANCE_UID, study.study_uid.clone());
        out.put_str(tags::STUDY_ID, study.study_id.clone());
        out.put_str(tags::STUDY_DATE, study.study_date.clone());
        out.put_str(tags::STUDY_TIME, study.study_time.clone());
        out.put_str(tags::ACCESSION_NUMBER, study.accession_number.clone());
        out.put_str(
            tags::REFERRING_PHYSICIAN_NAME,
            study.referring_physician.clone(),
        );
        out.put_str(tags::STUDY_DESCRIPTION, study.study_description.clone());
        out.put_str(tags::MODALITIES_IN_STUDY, study.modalities_in_study.clone());
        if let Some(patient) = patient {
            out.put_str(tags::PATIENT_ID, patient.patient_id);
            out.put_str(tags::PATIENT_NAME, patient.patient_name);
        }
        out.put_str(
            tags::NUMBER_OF_STUDY_RELATED_SERIES,
            related_series.to_string(),
        );
        Ok(out.encode(transfer_syntax)?)
    }

    fn series_identifier(&self, series: &SeriesRecord, transfer_syntax: &str) -> Result<Vec<u8>> {
        let study = self.index.find_study_by_pk(series.study_pk)?;

        let mut out = DataSet::new();
        out.put_str(tags::QUERY_RETRIEVE_LEVEL, "SERIES");
        out.put_str(tags::SERIES_INSTANCE_UID, series.series_uid.clone());
        out.put_str(tags::MODALITY, series.modality.clone());
        if let Some(number) = series.series_number {
            out.put_str(tags::SERIES_NUMBER, number.to_string());
        }
        out.put_str(tags::SERIES_DESCRIPTION, series.series_description.clone());
        out.put_str(tags::BODY_PART_EXAMINED, series.body_part_examined.clone());
        out.put_str(tags::STATION_NAME, series.station_name.clone());
        if let Some(study) = study {
            out.put_str(tags::STUDY_INSTANCE_UID, study.study_uid);
        }
        Ok(out.encode(transfer_syntax)?)
    }

    fn instance_identifier(
        &self,
        instance: &InstanceRecord,
        transfer_syntax: &str,
    ) -> Result<Vec<u8>> {
        let series = self.index.find_series_by_pk(instance.series_pk)?;

        let mut out = DataSet::new();
        out.put_str(tags::QUERY_RETRIEVE_LEVEL, "IMAGE");
        out.put_str(tags::SOP_INSTANCE_UID, instance.sop_uid.clone());
        out.put_str(tags::SOP_CLASS_UID, instance.sop_class_uid.clone());
        if let Some(number) = instance.instance_number {
            out.put_str(tags::INSTANCE_NUMBER, number.to_string());
        }
        if let Some(series) = series {
            out.put_str(tags::SERIES_INSTANCE_UID, series.series_uid);
        }
        Ok(out.encode(transfer_syntax)?)
    }
}

/// A DICOM date or date range attribute:
/// `V`, `V-`, `-V` or `FROM-TO`.
fn parse_date_range(value: &str) -> (Option<String>, Option<String>) {
    match value.split_once('-') {
        Some((from, to)) => (
            (!from.is_empty()).then(|| from.to_string()),
            (!to.is_empty()).then(|| to.to_string()),
        ),
        None => (Some(value.to_string()), Some(value.to_string())),
    }
}

/// A non-empty, non-universal-match identifier value.
fn filter_value(identifier: &DataSet, tag: tags::Tag) -> Option<String> {
    identifier
        .get_str(tag)
        .filter(|v| !v.is_empty() && v != "*")
}

impl DimseService for QueryScp {
    fn supported_sop_classes(&self) -> &[&'static str] {
        &[uids::PATIENT_ROOT_QR_FIND, uids::STUDY_ROOT_QR_FIND]
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
            CommandField::CCancelRq => {
                // the dispatch layer flips the flag before handlers run;
                // a stray cancel with nothing in flight is a no-op
                return Ok(());
            }
            other => {
                warn!("query service ignoring {}", other);
                return Ok(());
            }
        }

        let payload = message.dataset.ok_or_else(|| {
            MissingAttributeSnafu {
                what: "query identifier",
            }
            .build()
        })?;
        let identifier = DataSet::read(&payload, &ctx.transfer_syntax)?;

        let level = identifier
            .get_str(tags::QUERY_RETRIEVE_LEVEL)
            .unwrap_or_else(|| "STUDY".to_string());
        debug!(
            "C-FIND at {} level from `{}`",
            level, ctx.calling_ae_title
        );

        let transfer_syntax = ctx.transfer_syntax.clone();
        match level.as_str() {
            "PATIENT" => {
                let query = PatientQuery {
                    patient_id: filter_value(&identifier, tags::PATIENT_ID),
                    patient_name: filter_value(&identifier, tags::PATIENT_NAME),
                    sex: filter_value(&identifier, tags::PATIENT_SEX),
                    ..Default::default()
                };
                let rows = self.index.search_patients(&query)?;
                self.stream_matches(ctx, &command, responder, rows, |patient| {
                    self.patient_identifier(patient, &transfer_syntax)
                })
            }
            "STUDY" => {
                let (study_date_from, study_date_to) = identifier
                    .get_str(tags::STUDY_DATE)
                    .filter(|v| !v.is_empty() && v != "*")
                    .map(|v| parse_date_range(&v))
                    .unwrap_or((None, None));

                let query = StudyQuery {
                    patient_id: filter_value(&identifier, tags::PATIENT_ID),
                    patient_name: filter_value(&identifier, tags::PATIENT_NAME),
                    study_uid: filter_value(&identifier, tags::STUDY_INSTANCE_UID),
                    study_id: filter_value(&identifier, tags::STUDY_ID),
                    accession_number: filter_value(&identifier, tags::ACCESSION_NUMBER),
                    modality: filter_value(&identifier, tags::MODALITIES_IN_STUDY),
                    study_description: filter_value(&identifier, tags::STUDY_DESCRIPTION),
                    study_date_from,
                    study_date_to,
                    ..Default::default()
                };
                let rows = self.index.search_studies(&query)?;
                self.stream_matches(ctx, &command, responder, rows, |study| {
                    self.study_identifier(study, &transfer_syntax)
                })
            }
            "SERIES" => {
                let query = SeriesQuery {
                    study_uid: filter_value(&identifier, tags::STUDY_INSTANCE_UID),
                    series_uid: filter_value(&identifier, tags::SERIES_INSTANCE_UID),
                    modality: filter_value(&identifier, tags::MODALITY),
                    ..Default::default()
                };
                let rows = self.index.search_series(&query)?;
                self.stream_matches(ctx, &command, responder, rows, |series| {
                    self.series_identifier(series, &transfer_syntax)
                })
            }
            "IMAGE" => {
                let query = InstanceQuery {
                    series_uid: filter_value(&identifier, tags::SERIES_INSTANCE_UID),
                    sop_uid: filter_value(&identifier, tags::SOP_INSTANCE_UID),
                    sop_class_uid: filter_value(&identifier, tags::SOP_CLASS_UID),
                    ..Default::default()
                };
                let rows = self.index.search_instances(&query)?;
                self.stream_matches(ctx, &command, responder, rows, |instance| {
                    self.instance_identifier(instance, &transfer_syntax)
                })
            }
            other => {
                warn!("unsupported query level `{}`", other);
                responder.respond(DimseMessage {
                    context_id: ctx.context_id,
                    command: CommandSet::find_rsp(
                        &command,
                        status::ERROR_INVALID_ATTRIBUTE_VALUE,
                        false,
                    ),
                    dataset: None,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_ranges_parse() {
        assert_eq!(
            parse_date_range("20240101-20240131"),
            (Some("20240101".into()), Some("20240131".into()))
        );
        assert_eq!(
            parse_date_range("20240101-"),
            (Some("20240101".into()), None)
        );
        assert_eq!(parse_date_range("-20240131"), (None, Some("20240131".into())));
        assert_eq!(
            parse_date_range("20240115"),
            (Some("20240115".into()), Some("20240115".into()))
        );
    }
}
