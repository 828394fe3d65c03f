//! Record types mapping one-to-one to the index tables.
//!
//! All attribute fields are plain strings in DICOM value formats
//! (dates `YYYYMMDD`, times `HHMMSS`, datetimes `YYYYMMDDHHMMSS`);
//! an empty string means "not provided".
//! Primary keys are assigned by the database
//! and are zero on records that were never stored.

use chrono::{DateTime, Utc};

/// A patient, keyed by the patient id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatientRecord {
    pub pk: i64,
    /// Patient ID (0010,0020), at most 64 characters
    pub patient_id: String,
    /// Patient's Name in DICOM PN format
    pub patient_name: String,
    /// Birth date in YYYYMMDD format
    pub birth_date: String,
    /// Sex code (M, F, O)
    pub sex: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl PatientRecord {
    pub fn new(patient_id: impl Into<String>) -> Self {
        PatientRecord {
            patient_id: patient_id.into(),
            ..Default::default()
        }
    }
}

/// A study, keyed by the study instance UID.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StudyRecord {
    pub pk: i64,
    /// Foreign key to the patient
    pub patient_pk: i64,
    /// Study Instance UID (0020,000D)
    pub study_uid: String,
    pub study_id: String,
    /// Study date in YYYYMMDD format
    pub study_date: String,
    /// Study time in HHMMSS format
    pub study_time: String,
    pub accession_number: String,
    pub referring_physician: String,
    pub study_description: String,
    /// Denormalized list of modalities, recomputed from the series
    pub modalities_in_study: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl StudyRecord {
    pub fn new(study_uid: impl Into<String>) -> Self {
        StudyRecord {
            study_uid: study_uid.into(),
            ..Default::default()
        }
    }
}

/// A series, keyed by the series instance UID.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesRecord {
    pub pk: i64,
    /// Foreign key to the study
    pub study_pk: i64,
    /// Series Instance UID (0020,000E)
    pub series_uid: String,
    /// Modality (CT, MR, ...)
    pub modality: String,
    pub series_number: Option<i64>,
    pub series_description: String,
    pub body_part_examined: String,
    pub station_name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SeriesRecord {
    pub fn new(series_uid: impl Into<String>) -> Self {
        SeriesRecord {
            series_uid: series_uid.into(),
            ..Default::default()
        }
    }
}

/// A stored instance, keyed by the SOP instance UID.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceRecord {
    pub pk: i64,
    /// Foreign key to the series
    pub series_pk: i64,
    /// SOP Instance UID (0008,0018)
    pub sop_uid: String,
    /// SOP Class UID (0008,0016)
    pub sop_class_uid: String,
    /// Blob location relative to the configured blob root
    pub file_path: String,
    pub file_size: i64,
    pub transfer_syntax: String,
    pub instance_number: Option<i64>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl InstanceRecord {
    pub fn new(sop_uid: impl Into<String>) -> Self {
        InstanceRecord {
            sop_uid: sop_uid.into(),
            ..Default::default()
        }
    }
}

/// The states of a Modality Performed Procedure Step.
///
/// `Completed` and `Discontinued` are final:
/// once reached, further updates are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MppsStatus {
    InProgress,
    Completed,
    Discontinued,
}

impl MppsStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MppsStatus::InProgress => "IN PROGRESS",
            MppsStatus::Completed => "COMPLETED",
            MppsStatus::Discontinued => "DISCONTINUED",
        }
    }

    pub fn parse(value: &str) -> Option<MppsStatus> {
        match value {
            "IN PROGRESS" => Some(MppsStatus::InProgress),
            "COMPLETED" => Some(MppsStatus::Completed),
            "DISCONTINUED" => Some(MppsStatus::Discontinued),
            _ => None,
        }
    }

    pub fn is_final(self) -> bool {
        matches!(self, MppsStatus::Completed | MppsStatus::Discontinued)
    }
}

impl std::fmt::Display for MppsStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A Modality Performed Procedure Step record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MppsRecord {
    pub pk: i64,
    /// SOP Instance UID of the MPPS
    pub mpps_uid: String,
    /// Current status (see [`MppsStatus`])
    pub status: String,
    /// Start datetime in YYYYMMDDHHMMSS format
    pub start_datetime: String,
    /// End datetime, set when completed or discontinued
    pub end_datetime: String,
    /// Performing station AE title
    pub station_ae: String,
    pub station_name: String,
    pub modality: String,
    /// Related Study Instance UID
    pub study_uid: String,
    pub accession_no: String,
    /// Scheduled Procedure Step ID from the worklist
    pub scheduled_step_id: String,
    pub requested_proc_id: String,
    /// Performed series information, serialized
    pub performed_series: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl MppsRecord {
    pub fn new(mpps_uid: impl Into<String>) -> Self {
        MppsRecord {
            mpps_uid: mpps_uid.into(),
            ..Default::default()
        }
    }

    /// Whether this MPPS is in a final state.
    pub fn is_final(&self) -> bool {
        MppsStatus::parse(&self.status).is_some_and(MppsStatus::is_final)
    }

    pub fn status(&self) -> Option<MppsStatus> {
        MppsStatus::parse(&self.status)
    }
}

/// The states of a scheduled procedure step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorklistStatus {
    Scheduled,
    Started,
    Completed,
}

impl WorklistStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorklistStatus::Scheduled => "SCHEDULED",
            WorklistStatus::Started => "STARTED",
            WorklistStatus::Completed => "COMPLETED",
        }
    }

    pub fn parse(value: &str) -> Option<WorklistStatus> {
        match value {
            "SCHEDULED" => Some(WorklistStatus::Scheduled),
            "STARTED" => Some(WorklistStatus::Started),
            "COMPLETED" => Some(WorklistStatus::Completed),
            _ => None,
        }
    }

    /// Whether the step may move from `self` to `next`.
    ///
    /// The flow is strictly forward:
    /// SCHEDULED to STARTED or COMPLETED, STARTED to COMPLETED.
    pub fn can_transition_to(self, next: WorklistStatus) -> bool {
        use WorklistStatus::*;
        matches!(
            (self, next),
            (Scheduled, Started) | (Scheduled, Completed) | (Started, Completed)
        )
    }
}

impl std::fmt::Display for WorklistStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scheduled procedure step for the modality worklist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorklistItem {
    pub pk: i64,
    /// Scheduled Procedure Step ID (required)
    pub step_id: String,
    /// Current status (see [`WorklistStatus`])
    pub step_status: String,
    pub patient_id: String,
    pub patient_name: String,
    pub birth_date: String,
    pub sex: String,
    pub accession_no: String,
    pub requested_proc_id: String,
    /// Study Instance UID pre-assigned for the procedure
    pub study_uid: String,
    /// Scheduled start in YYYYMMDDHHMMSS format
    pub scheduled_datetime: String,
    /// Scheduled station AE title
    pub station_ae: String,
    pub station_name: String,
    pub modality: String,
    pub procedure_desc: String,
    pub protocol_code: String,
    pub referring_phys: String,
    pub referring_phys_id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// An audit log entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditRecord {
    pub pk: i64,
    /// Event type, e.g. `C-STORE`, `C-FIND`, `ASSOCIATION`
    pub event_type: String,
    /// Outcome: `SUCCESS` or `FAILURE`
    pub outcome: String,
    /// AE title of the acting peer
    pub actor_ae: String,
    pub patient_id: String,
    pub study_uid: String,
    /// Free-form detail message
    pub message: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mpps_status_round_trip() {
        for status in [
            MppsStatus::InProgress,
            MppsStatus::Completed,
            MppsStatus::Discontinued,
        ] {
            assert_eq!(MppsStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(MppsStatus::parse("UNKNOWN"), None);
        assert!(!MppsStatus::InProgress.is_final());
        assert!(MppsStatus::Completed.is_final());
        assert!(MppsStatus::Discontinued.is_final());
    }

    #[test]
    fn worklist_transitions_are_forward_only() {
        use WorklistStatus::*;
        assert!(Scheduled.can_transition_to(Started));
        assert!(Scheduled.can_transition_to(Completed));
        assert!(Started.can_transition_to(Completed));
        assert!(!Started.can_transition_to(Scheduled));
        assert!(!Completed.can_transition_to(Started));
        assert!(!Completed.can_transition_to(Scheduled));
    }
}
