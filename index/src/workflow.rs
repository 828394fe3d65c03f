//! Worklist, MPPS and audit log operations.
//!
//! The MPPS state machine lives here:
//! N-CREATE inserts a record in `IN PROGRESS`,
//! N-SET moves it to `COMPLETED` or `DISCONTINUED`,
//! and final states reject any further update.
//! Worklist items follow SCHEDULED to STARTED to COMPLETED,
//! driven by the MPPS events.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, OptionalExtension, Row};
use snafu::{ensure, ResultExt};
use tracing::debug;

use crate::db::{collect_rows, Filter, IndexDatabase};
use crate::query::{AuditQuery, MppsQuery, WorklistQuery};
use crate::records::{AuditRecord, MppsRecord, MppsStatus, WorklistItem, WorklistStatus};
use crate::{
    DuplicateMppsSnafu, InvalidRecordSnafu, InvalidStateTransitionSnafu, NotFoundSnafu, Result,
    SqliteSnafu,
};

impl IndexDatabase {
    // ======================================================================
    // MPPS
    // ======================================================================

    /// Create a new MPPS record (N-CREATE).
    ///
    /// The record always starts in `IN PROGRESS`;
    /// a duplicate UID is an error.
    pub fn create_mpps(&self, record: &MppsRecord) -> Result<i64> {
        ensure!(
            !record.mpps_uid.is_empty(),
            InvalidRecordSnafu {
                what: "mpps uid",
                why: "must not be empty",
            }
        );

        self.with_conn(|conn| {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT pk FROM mpps WHERE mpps_uid = ?1",
                    [&record.mpps_uid],
                    |row| row.get(0),
                )
                .optional()
                .context(SqliteSnafu {
                    operation: "create mpps",
                })?;
            ensure!(
                exists.is_none(),
                DuplicateMppsSnafu {
                    mpps_uid: record.mpps_uid.clone(),
                }
            );

            conn.query_row(
                "INSERT INTO mpps (mpps_uid, status, start_datetime, end_datetime, station_ae, \
                   station_name, modality, study_uid, accession_no, scheduled_step_id, \
                   requested_proc_id, performed_series, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13) \
                 RETURNING pk",
                params![
                    record.mpps_uid,
                    MppsStatus::InProgress.as_str(),
                    record.start_datetime,
                    record.end_datetime,
                    record.station_ae,
                    record.station_name,
                    record.modality,
                    record.study_uid,
                    record.accession_no,
                    record.scheduled_step_id,
                    record.requested_proc_id,
                    record.performed_series,
                    Utc::now(),
                ],
                |row| row.get(0),
            )
            .context(SqliteSnafu {
                operation: "create mpps",
            })
        })
    }

    /// Update an MPPS record (N-SET).
    ///
    /// The status transition is validated before anything else:
    /// records in a final state reject every update.
    /// After validation, only the non-empty fields of `record`
    /// overwrite the stored values.
    pub fn update_mpps(&self, record: &MppsRecord) -> Result<()> {
        let existing = self.find_mpps(&record.mpps_uid)?.ok_or_else(|| {
            NotFoundSnafu {
                entity: "mpps",
                key: record.mpps_uid.clone(),
            }
            .build()
        })?;

        // transition validation comes first; a final state
        // rejects the update regardless of the payload
        ensure!(
            !existing.is_final(),
            InvalidStateTransitionSnafu {
                from: existing.status.clone(),
                to: if record.status.is_empty() {
                    "(update)".to_string()
                } else {
                    record.status.clone()
                },
            }
        );

        if !record.status.is_empty() {
            ensure!(
                MppsStatus::parse(&record.status).is_some(),
                InvalidRecordSnafu {
                    what: "mpps status",
                    why: format!("unknown status `{}`", record.status),
                }
            );
        }

        self.with_conn(|conn| {
            conn.execute(
                "UPDATE mpps SET \
                   status = CASE WHEN ?2 != '' THEN ?2 ELSE status END, \
                   start_datetime = CASE WHEN ?3 != '' THEN ?3 ELSE start_datetime END, \
                   end_datetime = CASE WHEN ?4 != '' THEN ?4 ELSE end_datetime END, \
                   station_ae = CASE WHEN ?5 != '' THEN ?5 ELSE station_ae END, \
                   station_name = CASE WHEN ?6 != '' THEN ?6 ELSE station_name END, \
                   modality = CASE WHEN ?7 != '' THEN ?7 ELSE modality END, \
                   study_uid = CASE WHEN ?8 != '' THEN ?8 ELSE study_uid END, \
                   accession_no = CASE WHEN ?9 != '' THEN ?9 ELSE accession_no END, \
                   scheduled_step_id = CASE WHEN ?10 != '' THEN ?10 ELSE scheduled_step_id END, \
                   requested_proc_id = CASE WHEN ?11 != '' THEN ?11 ELSE requested_proc_id END, \
                   performed_series = CASE WHEN ?12 != '' THEN ?12 ELSE performed_series END, \
                   updated_at = ?13 \
                 WHERE mpps_uid = ?1",
                params![
                    record.mpps_uid,
                    record.status,
                    record.start_datetime,
                    record.end_datetime,
                    record.station_ae,
                    record.station_name,
                    record.modality,
                    record.study_uid,
                    record.accession_no,
                    record.scheduled_step_id,
                    record.requested_proc_id,
                    record.performed_series,
                    Utc::now(),
                ],
            )
            .context(SqliteSnafu {
                operation: "update mpps",
            })?;
            Ok(())
        })?;

        debug!(
            "mpps `{}` updated{}",
            record.mpps_uid,
            if record.status.is_empty() {
                String::new()
            } else {
                format!(" to {}", record.status)
            }
        );
        Ok(())
    }

    /// Find an MPPS by its SOP instance UID.
    pub fn find_mpps(&self, mpps_uid: &str) -> Result<Option<MppsRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {MPPS_COLUMNS} FROM mpps WHERE mpps_uid = ?1"),
                [mpps_uid],
                row_to_mpps,
            )
            .optional()
            .context(SqliteSnafu {
                operation: "find mpps",
            })
        })
    }

    /// Find an MPPS by primary key.
    pub fn find_mpps_by_pk(&self, pk: i64) -> Result<Option<MppsRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {MPPS_COLUMNS} FROM mpps WHERE pk = ?1"),
                [pk],
                row_to_mpps,
            )
            .optional()
            .context(SqliteSnafu {
                operation: "find mpps by pk",
            })
        })
    }

    /// List the `IN PROGRESS` MPPS records of one station.
    pub fn list_active_mpps(&self, station_ae: &str) -> Result<Vec<MppsRecord>> {
        self.with_conn(|conn| {
            collect_rows(
                conn,
                &format!(
                    "SELECT {MPPS_COLUMNS} FROM mpps \
                     WHERE station_ae = ?1 AND status = 'IN PROGRESS' ORDER BY pk ASC"
                ),
                &[Value::from(station_ae.to_string())],
                row_to_mpps,
                "list active mpps",
            )
        })
    }

    /// Find the MPPS records related to one study.
    pub fn find_mpps_by_study(&self, study_uid: &str) -> Result<Vec<MppsRecord>> {
        self.with_conn(|conn| {
            collect_rows(
                conn,
                &format!("SELECT {MPPS_COLUMNS} FROM mpps WHERE study_uid = ?1 ORDER BY pk ASC"),
                &[Value::from(study_uid.to_string())],
                row_to_mpps,
                "find mpps by study",
            )
        })
    }

    /// Search MPPS records; all filters compare exactly.
    pub fn search_mpps(&self, query: &MppsQuery) -> Result<Vec<MppsRecord>> {
        let mut filter = Filter::new();
        filter.push_exact("mpps_uid", query.mpps_uid.as_deref());
        filter.push_exact("status", query.status.as_deref());
        filter.push_exact("station_ae", query.station_ae.as_deref());
        filter.push_exact("modality", query.modality.as_deref());
        filter.push_exact("study_uid", query.study_uid.as_deref());
        filter.push_exact("accession_no", query.accession_no.as_deref());
        filter.push_range(
            "substr(start_datetime, 1, 8)",
            query.start_date_from.as_deref(),
            query.start_date_to.as_deref(),
        );

        let sql = format!(
            "SELECT {MPPS_COLUMNS} FROM mpps{} ORDER BY pk ASC LIMIT ?{} OFFSET ?{}",
            filter.where_clause(),
            filter.len() + 1,
            filter.len() + 2,
        );
        let params = filter.into_params(query.limit, query.offset);

        self.with_conn(|conn| collect_rows(conn, &sql, &params, row_to_mpps, "search mpps"))
    }

    /// Delete an MPPS record.
    pub fn delete_mpps(&self, mpps_uid: &str) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn
                .execute("DELETE FROM mpps WHERE mpps_uid = ?1", [mpps_uid])
                .context(SqliteSnafu {
                    operation: "delete mpps",
                })?;
            ensure!(
                changed > 0,
                NotFoundSnafu {
                    entity: "mpps",
                    key: mpps_uid,
                }
            );
            Ok(())
        })
    }

    /// Total MPPS count.
    pub fn mpps_count(&self) -> Result<u64> {
        self.count_rows("SELECT COUNT(*) FROM mpps", &[])
    }

    /// MPPS count for one status.
    pub fn mpps_count_by_status(&self, status: &str) -> Result<u64> {
        self.count_rows(
            "SELECT COUNT(*) FROM mpps WHERE status = ?1",
            &[Value::from(status.to_string())],
        )
    }

    // ======================================================================
    // worklist
    // ======================================================================

    /// Add a new scheduled procedure step.
    ///
    /// The step starts in `SCHEDULED` unless the item says otherwise.
    pub fn add_worklist_item(&self, item: &WorklistItem) -> Result<i64> {
        ensure!(
            !item.step_id.is_empty(),
            InvalidRecordSnafu {
                what: "worklist step id",
                why: "must not be empty",
            }
        );
        let status = if item.step_status.is_empty() {
            WorklistStatus::Scheduled.as_str()
        } else {
            item.step_status.as_str()
        };
        ensure!(
            WorklistStatus::parse(status).is_some(),
            InvalidRecordSnafu {
                what: "worklist status",
                why: format!("unknown status `{status}`"),
            }
        );

        self.with_conn(|conn| {
            conn.query_row(
                "INSERT INTO worklist (step_id, step_status, patient_id, patient_name, \
                   birth_date, sex, accession_no, requested_proc_id, study_uid, \
                   scheduled_datetime, station_ae, station_name, modality, procedure_desc, \
                   protocol_code, referring_phys, referring_phys_id, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?18) \
                 RETURNING pk",
                params![
                    item.step_id,
                    status,
                    item.patient_id,
                    item.patient_name,
                    item.birth_date,
                    item.sex,
                    item.accession_no,
                    item.requested_proc_id,
                    item.study_uid,
                    item.scheduled_datetime,
                    item.station_ae,
                    item.station_name,
                    item.modality,
                    item.procedure_desc,
                    item.protocol_code,
                    item.referring_phys,
                    item.referring_phys_id,
                    Utc::now(),
                ],
                |row| row.get(0),
            )
            .context(SqliteSnafu {
                operation: "add worklist item",
            })
        })
    }

    /// Move a worklist item to a new status,
    /// called when the corresponding MPPS events arrive.
    ///
    /// The flow is strictly forward;
    /// anything else is an `InvalidStateTransition`.
    pub fn update_worklist_status(
        &self,
        step_id: &str,
        accession_no: &str,
        new_status: WorklistStatus,
    ) -> Result<()> {
        let item = self
            .find_worklist_item(step_id, accession_no)?
            .ok_or_else(|| {
                NotFoundSnafu {
                    entity: "worklist item",
                    key: format!("{step_id}/{accession_no}"),
                }
                .build()
            })?;

        let current = WorklistStatus::parse(&item.step_status).ok_or_else(|| {
            InvalidRecordSnafu {
                what: "worklist status",
                why: format!("unknown stored status `{}`", item.step_status),
            }
            .build()
        })?;
        ensure!(
            current.can_transition_to(new_status),
            InvalidStateTransitionSnafu {
                from: current.as_str(),
                to: new_status.as_str(),
            }
        );

        self.with_conn(|conn| {
            conn.execute(
                "UPDATE worklist SET step_status = ?3, updated_at = ?4 \
                 WHERE step_id = ?1 AND accession_no = ?2",
                params![step_id, accession_no, new_status.as_str(), Utc::now()],
            )
            .context(SqliteSnafu {
                operation: "update worklist status",
            })?;
            Ok(())
        })
    }

    /// Query worklist items for MWL C-FIND.
    ///
    /// With no status filter, only `SCHEDULED` items are returned.
    pub fn query_worklist(&self, query: &WorklistQuery) -> Result<Vec<WorklistItem>> {
        let mut filter = Filter::new();
        filter.push_exact("step_id", query.step_id.as_deref());
        filter.push_pattern("patient_id", query.patient_id.as_deref());
        filter.push_pattern("patient_name", query.patient_name.as_deref());
        filter.push_pattern("accession_no", query.accession_no.as_deref());
        filter.push_exact("modality", query.modality.as_deref());
        filter.push_exact("station_ae", query.station_ae.as_deref());
        filter.push_exact(
            "step_status",
            Some(query.status.as_deref().unwrap_or("SCHEDULED")),
        );
        filter.push_range(
            "scheduled_datetime",
            query.scheduled_from.as_deref(),
            query.scheduled_to.as_deref(),
        );

        let sql = format!(
            "SELECT {WORKLIST_COLUMNS} FROM worklist{} \
             ORDER BY scheduled_datetime ASC, pk ASC LIMIT ?{} OFFSET ?{}",
            filter.where_clause(),
            filter.len() + 1,
            filter.len() + 2,
        );
        let params = filter.into_params(query.limit, query.offset);

        self.with_conn(|conn| {
            collect_rows(conn, &sql, &params, row_to_worklist, "query worklist")
        })
    }

    /// Find a worklist item by step id and accession number.
    pub fn find_worklist_item(
        &self,
        step_id: &str,
        accession_no: &str,
    ) -> Result<Option<WorklistItem>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {WORKLIST_COLUMNS} FROM worklist \
                     WHERE step_id = ?1 AND accession_no = ?2"
                ),
                [step_id, accession_no],
                row_to_worklist,
            )
            .optional()
            .context(SqliteSnafu {
                operation: "find worklist item",
            })
        })
    }

    /// Find a worklist item by primary key.
    pub fn find_worklist_by_pk(&self, pk: i64) -> Result<Option<WorklistItem>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {WORKLIST_COLUMNS} FROM worklist WHERE pk = ?1"),
                [pk],
                row_to_worklist,
            )
            .optional()
            .context(SqliteSnafu {
                operation: "find worklist by pk",
            })
        })
    }

    /// Delete a worklist item.
    pub fn delete_worklist_item(&self, step_id: &str, accession_no: &str) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "DELETE FROM worklist WHERE step_id = ?1 AND accession_no = ?2",
                    [step_id, accession_no],
                )
                .context(SqliteSnafu {
                    operation: "delete worklist item",
                })?;
            ensure!(
                changed > 0,
                NotFoundSnafu {
                    entity: "worklist item",
                    key: format!("{step_id}/{accession_no}"),
                }
            );
            Ok(())
        })
    }

    /// Remove worklist items scheduled before the given instant.
    ///
    /// Items still in `SCHEDULED` are kept;
    /// returns the number of deleted items.
    pub fn cleanup_worklist_items_before(&self, before: DateTime<Utc>) -> Result<usize> {
        let cutoff = before.format("%Y%m%d%H%M%S").to_string();
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM worklist \
                 WHERE step_status != 'SCHEDULED' AND scheduled_datetime < ?1",
                [&cutoff],
            )
            .context(SqliteSnafu {
                operation: "cleanup worklist",
            })
        })
    }

    /// Total worklist count.
    pub fn worklist_count(&self) -> Result<u64> {
        self.count_rows("SELECT COUNT(*) FROM worklist", &[])
    }

    /// Worklist count for one status.
    pub fn worklist_count_by_status(&self, status: &str) -> Result<u64> {
        self.count_rows(
            "SELECT COUNT(*) FROM worklist WHERE step_status = ?1",
            &[Value::from(status.to_string())],
        )
    }

    // ======================================================================
    // audit log
    // ======================================================================

    /// Append an audit log entry.
    pub fn add_audit_log(&self, record: &AuditRecord) -> Result<i64> {
        self.with_conn(|conn| {
            conn.query_row(
                "INSERT INTO audit_log (event_type, outcome, actor_ae, patient_id, study_uid, \
                   message, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) RETURNING pk",
                params![
                    record.event_type,
                    record.outcome,
                    record.actor_ae,
                    record.patient_id,
                    record.study_uid,
                    record.message,
                    Utc::now(),
                ],
                |row| row.get(0),
            )
            .context(SqliteSnafu {
                operation: "add audit log",
            })
        })
    }

    /// Query audit log entries, newest first.
    pub fn query_audit_log(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>> {
        let mut filter = Filter::new();
        filter.push_exact("event_type", query.event_type.as_deref());
        filter.push_exact("outcome", query.outcome.as_deref());
        filter.push_exact("actor_ae", query.actor_ae.as_deref());
        filter.push_pattern("patient_id", query.patient_id.as_deref());
        filter.push_exact("study_uid", query.study_uid.as_deref());

        let sql = format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_log{} \
             ORDER BY pk DESC LIMIT ?{} OFFSET ?{}",
            filter.where_clause(),
            filter.len() + 1,
            filter.len() + 2,
        );
        let params = filter.into_params(query.limit, query.offset);

        self.with_conn(|conn| collect_rows(conn, &sql, &params, row_to_audit, "query audit log"))
    }

    /// Find an audit entry by primary key.
    pub fn find_audit_by_pk(&self, pk: i64) -> Result<Option<AuditRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {AUDIT_COLUMNS} FROM audit_log WHERE pk = ?1"),
                [pk],
                row_to_audit,
            )
            .optional()
            .context(SqliteSnafu {
                operation: "find audit by pk",
            })
        })
    }

    /// Total audit log count.
    pub fn audit_count(&self) -> Result<u64> {
        self.count_rows("SELECT COUNT(*) FROM audit_log", &[])
    }

    /// Remove audit entries created before the given instant;
    /// returns the number of deleted entries.
    pub fn cleanup_audit_logs_before(&self, before: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM audit_log WHERE created_at < ?1", [before])
                .context(SqliteSnafu {
                    operation: "cleanup audit log",
                })
        })
    }
}

const MPPS_COLUMNS: &str = "pk, mpps_uid, status, start_datetime, end_datetime, station_ae, \
     station_name, modality, study_uid, accession_no, scheduled_step_id, requested_proc_id, \
     performed_series, created_at, updated_at";

fn row_to_mpps(row: &Row) -> rusqlite::Result<MppsRecord> {
    Ok(MppsRecord {
        pk: row.get(0)?,
        mpps_uid: row.get(1)?,
        status: row.get(2)?,
        start_datetime: row.get(3)?,
        end_datetime: row.get(4)?,
        station_ae: row.get(5)?,
        station_name: row.get(6)?,
        modality: row.get(7)?,
        study_uid: row.get(8)?,
        accession_no: row.get(9)?,
        scheduled_step_id: row.get(10)?,
        requested_proc_id: row.get(11)?,
        performed_series: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

const WORKLIST_COLUMNS: &str = "pk, step_id, step_status, patient_id, patient_name, birth_date, \
     sex, accession_no, requested_proc_id, study_uid, scheduled_datetime, station_ae, \
     station_name, modality, procedure_desc, protocol_code, referring_phys, referring_phys_id, \
     created_at, updated_at";

fn row_to_worklist(row: &Row) -> rusqlite::Result<WorklistItem> {
    Ok(WorklistItem {
        pk: row.get(0)?,
        step_id: row.get(1)?,
        step_status: row.get(2)?,
        patient_id: row.get(3)?,
        patient_name: row.get(4)?,
        birth_date: row.get(5)?,
        sex: row.get(6)?,
        accession_no: row.get(7)?,
        requested_proc_id: row.get(8)?,
        study_uid: row.get(9)?,
        scheduled_datetime: row.get(10)?,
        station_ae: row.get(11)?,
        station_name: row.get(12)?,
        modality: row.get(13)?,
        procedure_desc: row.get(14)?,
        protocol_code: row.get(15)?,
        referring_phys: row.get(16)?,
        referring_phys_id: row.get(17)?,
        created_at: row.get(18)?,
        updated_at: row.get(19)?,
    })
}

const AUDIT_COLUMNS: &str =
    "pk, event_type, outcome, actor_ae, patient_id, study_uid, message, created_at";

fn row_to_audit(row: &Row) -> rusqlite::Result<AuditRecord> {
    Ok(AuditRecord {
        pk: row.get(0)?,
        event_type: row.get(1)?,
        outcome: row.get(2)?,
        actor_ae: row.get(3)?,
        patient_id: row.get(4)?,
        study_uid: row.get(5)?,
        message: row.get(6)?,
        created_at: row.get(7)?,
    })
}
