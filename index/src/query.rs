//! Query structs for the `search_*` family.
//!
//! Unset fields are not part of the filter.
//! Text filters may contain `*`, which maps to the SQL `%` wildcard;
//! a pattern without `*` is compared by equality, not by prefix.
//! `limit` of 0 means unlimited;
//! `offset` skips that many matches for pagination.

/// Filter for [`search_patients`](crate::IndexDatabase::search_patients).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatientQuery {
    pub patient_id: Option<String>,
    pub patient_name: Option<String>,
    pub sex: Option<String>,
    /// Birth date range begin, inclusive, YYYYMMDD
    pub birth_date_from: Option<String>,
    /// Birth date range end, inclusive, YYYYMMDD
    pub birth_date_to: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl PatientQuery {
    pub fn has_criteria(&self) -> bool {
        self.patient_id.is_some()
            || self.patient_name.is_some()
            || self.sex.is_some()
            || self.birth_date_from.is_some()
            || self.birth_date_to.is_some()
    }
}

/// Filter for [`search_studies`](crate::IndexDatabase::search_studies).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StudyQuery {
    pub patient_id: Option<String>,
    pub patient_name: Option<String>,
    pub study_uid: Option<String>,
    pub study_id: Option<String>,
    pub accession_number: Option<String>,
    /// Matches against the denormalized modalities of the study
    pub modality: Option<String>,
    pub referring_physician: Option<String>,
    pub study_description: Option<String>,
    /// Study date range begin, inclusive, YYYYMMDD
    pub study_date_from: Option<String>,
    /// Study date range end, inclusive, YYYYMMDD
    pub study_date_to: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl StudyQuery {
    pub fn has_criteria(&self) -> bool {
        self.patient_id.is_some()
            || self.patient_name.is_some()
            || self.study_uid.is_some()
            || self.study_id.is_some()
            || self.accession_number.is_some()
            || self.modality.is_some()
            || self.referring_physician.is_some()
            || self.study_description.is_some()
            || self.study_date_from.is_some()
            || self.study_date_to.is_some()
    }
}

/// Filter for [`search_series`](crate::IndexDatabase::search_series).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesQuery {
    pub study_uid: Option<String>,
    pub series_uid: Option<String>,
    pub modality: Option<String>,
    pub body_part_examined: Option<String>,
    pub station_name: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

/// Filter for [`search_instances`](crate::IndexDatabase::search_instances).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceQuery {
    pub series_uid: Option<String>,
    pub sop_uid: Option<String>,
    pub sop_class_uid: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

/// Filter for [`search_mpps`](crate::IndexDatabase::search_mpps).
///
/// All filters compare exactly; MPPS attributes are not wildcarded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MppsQuery {
    pub mpps_uid: Option<String>,
    pub status: Option<String>,
    pub station_ae: Option<String>,
    pub modality: Option<String>,
    pub study_uid: Option<String>,
    pub accession_no: Option<String>,
    /// Start date range begin, inclusive, YYYYMMDD
    pub start_date_from: Option<String>,
    /// Start date range end, inclusive, YYYYMMDD
    pub start_date_to: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl MppsQuery {
    pub fn has_criteria(&self) -> bool {
        self.mpps_uid.is_some()
            || self.status.is_some()
            || self.station_ae.is_some()
            || self.modality.is_some()
            || self.study_uid.is_some()
            || self.accession_no.is_some()
            || self.start_date_from.is_some()
            || self.start_date_to.is_some()
    }
}

/// Filter for [`query_worklist`](crate::IndexDatabase::query_worklist).
///
/// When `status` is unset, only `SCHEDULED` items are returned,
/// which is what MWL C-FIND wants.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorklistQuery {
    pub step_id: Option<String>,
    pub patient_id: Option<String>,
    pub patient_name: Option<String>,
    pub accession_no: Option<String>,
    pub modality: Option<String>,
    pub station_ae: Option<String>,
    /// Status filter; unset means `SCHEDULED`
    pub status: Option<String>,
    /// Scheduled datetime range begin, inclusive, YYYYMMDDHHMMSS
    pub scheduled_from: Option<String>,
    /// Scheduled datetime range end, inclusive, YYYYMMDDHHMMSS
    pub scheduled_to: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

/// Filter for [`query_audit_log`](crate::IndexDatabase::query_audit_log).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditQuery {
    pub event_type: Option<String>,
    pub outcome: Option<String>,
    pub actor_ae: Option<String>,
    pub patient_id: Option<String>,
    pub study_uid: Option<String>,
    pub limit: usize,
    pub offset: usize,
}
