//! Schema migration runner.
//!
//! Migrations are an ordered, append-only list of idempotent steps.
//! Each pending migration runs in its own transaction;
//! a failure rolls that step back and prevents the database from opening.
//! There is no down-migration.

use chrono::Utc;
use rusqlite::Connection;
use snafu::ResultExt;
use tracing::info;

use crate::{MigrationSnafu, Result, SqliteSnafu};

/// One schema migration step.
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
}

/// The schema version this build expects.
pub const LATEST_VERSION: i64 = 4;

/// The ordered migration list, `v1..vN`.
pub fn migrations() -> &'static [Migration] {
    &[
        Migration {
            version: 1,
            description: "core entity chain: patients, studies, series, instances",
            sql: r#"
CREATE TABLE IF NOT EXISTS patients (
    pk INTEGER PRIMARY KEY,
    patient_id TEXT NOT NULL UNIQUE,
    patient_name TEXT NOT NULL DEFAULT '',
    birth_date TEXT NOT NULL DEFAULT '',
    sex TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS studies (
    pk INTEGER PRIMARY KEY,
    patient_pk INTEGER NOT NULL REFERENCES patients(pk) ON DELETE CASCADE,
    study_uid TEXT NOT NULL UNIQUE,
    study_id TEXT NOT NULL DEFAULT '',
    study_date TEXT NOT NULL DEFAULT '',
    study_time TEXT NOT NULL DEFAULT '',
    accession_number TEXT NOT NULL DEFAULT '',
    referring_physician TEXT NOT NULL DEFAULT '',
    study_description TEXT NOT NULL DEFAULT '',
    modalities_in_study TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_studies_patient ON studies(patient_pk);

CREATE TABLE IF NOT EXISTS series (
    pk INTEGER PRIMARY KEY,
    study_pk INTEGER NOT NULL REFERENCES studies(pk) ON DELETE CASCADE,
    series_uid TEXT NOT NULL UNIQUE,
    modality TEXT NOT NULL DEFAULT '',
    series_number INTEGER,
    series_description TEXT NOT NULL DEFAULT '',
    body_part_examined TEXT NOT NULL DEFAULT '',
    station_name TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_series_study ON series(study_pk);

CREATE TABLE IF NOT EXISTS instances (
    pk INTEGER PRIMARY KEY,
    series_pk INTEGER NOT NULL REFERENCES series(pk) ON DELETE CASCADE,
    sop_uid TEXT NOT NULL UNIQUE,
    sop_class_uid TEXT NOT NULL DEFAULT '',
    file_path TEXT NOT NULL DEFAULT '',
    file_size INTEGER NOT NULL DEFAULT 0,
    transfer_syntax TEXT NOT NULL DEFAULT '',
    instance_number INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_instances_series ON instances(series_pk);
"#,
        },
        Migration {
            version: 2,
            description: "workflow tables: mpps and worklist",
            sql: r#"
CREATE TABLE IF NOT EXISTS mpps (
    pk INTEGER PRIMARY KEY,
    mpps_uid TEXT NOT NULL UNIQUE,
    status TEXT NOT NULL DEFAULT 'IN PROGRESS',
    start_datetime TEXT NOT NULL DEFAULT '',
    end_datetime TEXT NOT NULL DEFAULT '',
    station_ae TEXT NOT NULL DEFAULT '',
    station_name TEXT NOT NULL DEFAULT '',
    modality TEXT NOT NULL DEFAULT '',
    study_uid TEXT NOT NULL DEFAULT '',
    accession_no TEXT NOT NULL DEFAULT '',
    scheduled_step_id TEXT NOT NULL DEFAULT '',
    requested_proc_id TEXT NOT NULL DEFAULT '',
    performed_series TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_mpps_study ON mpps(study_uid);
CREATE INDEX IF NOT EXISTS idx_mpps_station ON mpps(station_ae, status);

CREATE TABLE IF NOT EXISTS worklist (
    pk INTEGER PRIMARY KEY,
    step_id TEXT NOT NULL,
    step_status TEXT NOT NULL DEFAULT 'SCHEDULED',
    patient_id TEXT NOT NULL DEFAULT '',
    patient_name TEXT NOT NULL DEFAULT '',
    birth_date TEXT NOT NULL DEFAULT '',
    sex TEXT NOT NULL DEFAULT '',
    accession_no TEXT NOT NULL DEFAULT '',
    requested_proc_id TEXT NOT NULL DEFAULT '',
    study_uid TEXT NOT NULL DEFAULT '',
    scheduled_datetime TEXT NOT NULL DEFAULT '',
    station_ae TEXT NOT NULL DEFAULT '',
    station_name TEXT NOT NULL DEFAULT '',
    modality TEXT NOT NULL DEFAULT '',
    procedure_desc TEXT NOT NULL DEFAULT '',
    protocol_code TEXT NOT NULL DEFAULT '',
    referring_phys TEXT NOT NULL DEFAULT '',
    referring_phys_id TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (step_id, accession_no)
);
CREATE INDEX IF NOT EXISTS idx_worklist_status ON worklist(step_status, scheduled_datetime);
"#,
        },
        Migration {
            version: 3,
            description: "audit log",
            sql: r#"
CREATE TABLE IF NOT EXISTS audit_log (
    pk INTEGER PRIMARY KEY,
    event_type TEXT NOT NULL,
    outcome TEXT NOT NULL DEFAULT '',
    actor_ae TEXT NOT NULL DEFAULT '',
    patient_id TEXT NOT NULL DEFAULT '',
    study_uid TEXT NOT NULL DEFAULT '',
    message TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_event ON audit_log(event_type, created_at);
"#,
        },
        Migration {
            version: 4,
            description: "search indices for the query paths",
            sql: r#"
CREATE INDEX IF NOT EXISTS idx_patients_name ON patients(patient_name);
CREATE INDEX IF NOT EXISTS idx_studies_date ON studies(study_date DESC, study_time DESC);
CREATE INDEX IF NOT EXISTS idx_studies_accession ON studies(accession_number);
CREATE INDEX IF NOT EXISTS idx_series_modality ON series(modality);
CREATE INDEX IF NOT EXISTS idx_instances_sop_class ON instances(sop_class_uid);
"#,
        },
    ]
}

/// Read the current schema version; 0 when no migration ever ran.
pub fn current_version(conn: &Connection) -> Result<i64> {
    ensure_version_table(conn)?;
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .context(SqliteSnafu {
        operation: "read schema version",
    })
}

/// Whether any migration is pending.
pub fn needs_migration(conn: &Connection) -> Result<bool> {
    Ok(current_version(conn)? < LATEST_VERSION)
}

/// Run all pending migrations, each in its own transaction.
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let current = current_version(conn)?;

    for migration in migrations().iter().filter(|m| m.version > current) {
        let result: std::result::Result<(), rusqlite::Error> = (|| {
            let tx = conn.transaction()?;
            tx.execute_batch(migration.sql)?;
            tx.execute(
                "INSERT INTO schema_version (version, description, applied_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![migration.version, migration.description, Utc::now()],
            )?;
            tx.commit()
        })();

        result.context(MigrationSnafu {
            version: migration.version,
        })?;
        info!(
            "schema migrated to v{}: {}",
            migration.version, migration.description
        );
    }

    Ok(())
}

fn ensure_version_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL DEFAULT '',
            applied_at TEXT NOT NULL
        )",
    )
    .context(SqliteSnafu {
        operation: "create schema_version table",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_ordered_and_dense() {
        let list = migrations();
        assert_eq!(list.len() as i64, LATEST_VERSION);
        for (i, migration) in list.iter().enumerate() {
            assert_eq!(migration.version, i as i64 + 1);
            assert!(!migration.description.is_empty());
        }
    }

    #[test]
    fn run_twice_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), LATEST_VERSION);
        assert!(!needs_migration(&conn).unwrap());

        run_migrations(&mut conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), LATEST_VERSION);

        // history has one row per version
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, LATEST_VERSION);
    }
}
