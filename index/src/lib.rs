//! Persistent metadata index for the PACS.
//!
//! The index is a SQLite-backed catalog of the DICOM entity chain
//! (patient, study, series, instance),
//! the modality worklist, MPPS records and the audit log.
//! DIMSE service handlers execute against it:
//! C-STORE upserts the instance chain,
//! C-FIND and MWL queries translate to [`query`] structs,
//! C-MOVE enumerates instance file paths,
//! and N-CREATE/N-SET drive the MPPS state machine.
//!
//! One process-wide connection with WAL journaling is used;
//! the internal lock enforces a single writer
//! while reads remain cheap.
//! The schema evolves through the ordered,
//! forward-only migrations of [`migrations`].

pub mod db;
pub mod migrations;
pub mod query;
pub mod records;

mod workflow;

pub use db::{IndexConfig, IndexDatabase, StorageStats};
pub use query::{
    AuditQuery, InstanceQuery, MppsQuery, PatientQuery, SeriesQuery, StudyQuery, WorklistQuery,
};
pub use records::{
    AuditRecord, InstanceRecord, MppsRecord, MppsStatus, PatientRecord, SeriesRecord, StudyRecord,
    WorklistItem, WorklistStatus,
};

use snafu::{Backtrace, Snafu};

/// An error from the storage index.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("could not open index database at `{}`", path))]
    Open {
        path: String,
        source: rusqlite::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("database error during {}", operation))]
    Sqlite {
        operation: &'static str,
        source: rusqlite::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("schema migration to version {} failed", version))]
    Migration {
        version: i64,
        source: rusqlite::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("invalid {}: {}", what, why))]
    InvalidRecord {
        what: &'static str,
        why: String,
        backtrace: Backtrace,
    },

    #[snafu(display("{} `{}` not found", entity, key))]
    NotFound {
        entity: &'static str,
        key: String,
        backtrace: Backtrace,
    },

    #[snafu(display("invalid state transition from `{}` to `{}`", from, to))]
    InvalidStateTransition {
        from: String,
        to: String,
        backtrace: Backtrace,
    },

    #[snafu(display("MPPS `{}` already exists", mpps_uid))]
    DuplicateMpps {
        mpps_uid: String,
        backtrace: Backtrace,
    },

    #[snafu(display("integrity check failed: {}", message))]
    Integrity {
        message: String,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
