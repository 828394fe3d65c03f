//! The index database: connection management,
//! the patient/study/series/instance chain and maintenance.
//!
//! The worklist, MPPS and audit log operations live in the
//! `workflow` module and attach to the same [`IndexDatabase`].

use std::sync::Mutex;

use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension, Row};
use snafu::{ensure, ResultExt};
use tracing::{debug, info, warn};

use crate::migrations;
use crate::query::{InstanceQuery, PatientQuery, SeriesQuery, StudyQuery};
use crate::records::{InstanceRecord, PatientRecord, SeriesRecord, StudyRecord};
use crate::{IntegritySnafu, InvalidRecordSnafu, NotFoundSnafu, OpenSnafu, Result, SqliteSnafu};

/// The DICOM limit for UI and long string identifiers.
const MAX_KEY_LENGTH: usize = 64;

/// Configuration for the index database.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Page cache size in megabytes
    pub cache_size_mb: usize,
    /// Enable write-ahead logging for concurrent readers
    pub wal_mode: bool,
    /// Enable memory-mapped I/O for reads
    pub mmap_enabled: bool,
    /// Maximum memory map size in bytes
    pub mmap_size: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            cache_size_mb: 64,
            wal_mode: true,
            mmap_enabled: true,
            mmap_size: 1024 * 1024 * 1024,
        }
    }
}

/// Aggregate statistics over the database contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub total_patients: u64,
    pub total_studies: u64,
    pub total_series: u64,
    pub total_instances: u64,
    /// Sum of the stored instances' file sizes in bytes
    pub total_file_size: i64,
    /// Size of the database file in bytes
    pub database_size: i64,
}

/// The PACS metadata index.
///
/// One process-wide connection;
/// the inner lock enforces the single-writer discipline
/// while WAL keeps readers unblocked at the backend level.
/// All methods take `&self` and are safe to call
/// from any stage worker.
pub struct IndexDatabase {
    conn: Mutex<Connection>,
    path: String,
}

impl std::fmt::Debug for IndexDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexDatabase")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl IndexDatabase {
    /// Open or create a database with the default configuration,
    /// running any pending schema migrations.
    pub fn open(path: &str) -> Result<IndexDatabase> {
        Self::open_with_config(path, &IndexConfig::default())
    }

    /// Open or create a database with a custom configuration.
    ///
    /// A failing migration rolls back and prevents opening.
    pub fn open_with_config(path: &str, config: &IndexConfig) -> Result<IndexDatabase> {
        let mut conn = Connection::open(path).context(OpenSnafu { path })?;
        configure(&conn, config).context(OpenSnafu { path })?;
        migrations::run_migrations(&mut conn)?;
        info!(
            "index database open at `{}` (schema v{})",
            path,
            migrations::current_version(&conn)?
        );
        Ok(IndexDatabase {
            conn: Mutex::new(conn),
            path: path.to_string(),
        })
    }

    /// Open a transient in-memory database, for tests.
    pub fn open_in_memory() -> Result<IndexDatabase> {
        Self::open(":memory:")
    }

    /// The database file path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The current schema version.
    pub fn schema_version(&self) -> Result<i64> {
        let conn = self.lock();
        migrations::current_version(&conn)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("index connection lock poisoned")
    }

    // ======================================================================
    // patients
    // ======================================================================

    /// Insert or update a patient by its patient id.
    ///
    /// Existing attribute values are kept when the incoming
    /// field is empty; the primary key is stable across calls.
    pub fn upsert_patient(&self, record: &PatientRecord) -> Result<i64> {
        let conn = self.lock();
        upsert_patient_tx(&conn, record)
    }

    /// Find a patient by patient id.
    pub fn find_patient(&self, patient_id: &str) -> Result<Option<PatientRecord>> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {PATIENT_COLUMNS} FROM patients WHERE patient_id = ?1"),
            [patient_id],
            row_to_patient,
        )
        .optional()
        .context(SqliteSnafu {
            operation: "find patient",
        })
    }

    /// Find a patient by primary key.
    pub fn find_patient_by_pk(&self, pk: i64) -> Result<Option<PatientRecord>> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {PATIENT_COLUMNS} FROM patients WHERE pk = ?1"),
            [pk],
            row_to_patient,
        )
        .optional()
        .context(SqliteSnafu {
            operation: "find patient by pk",
        })
    }

    /// Search patients with optional filters and wildcards.
    pub fn search_patients(&self, query: &PatientQuery) -> Result<Vec<PatientRecord>> {
        let mut filter = Filter::new();
        filter.push_pattern("patient_id", query.patient_id.as_deref());
        filter.push_pattern("patient_name", query.patient_name.as_deref());
        filter.push_pattern("sex", query.sex.as_deref());
        filter.push_range("birth_date", query.birth_date_from.as_deref(), query.birth_date_to.as_deref());

        let sql = format!(
            "SELECT {PATIENT_COLUMNS} FROM patients{} ORDER BY patient_id ASC, pk ASC LIMIT ?{} OFFSET ?{}",
            filter.where_clause(),
            filter.len() + 1,
            filter.len() + 2,
        );
        let params = filter.into_params(query.limit, query.offset);

        let conn = self.lock();
        collect_rows(&conn, &sql, &params, row_to_patient, "search patients")
    }

    /// Delete a patient, cascading to its studies, series and instances.
    ///
    /// The corresponding blob files are not touched.
    pub fn delete_patient(&self, patient_id: &str) -> Result<()> {
        let conn = self.lock();
        let changed = conn
            .execute("DELETE FROM patients WHERE patient_id = ?1", [patient_id])
            .context(SqliteSnafu {
                operation: "delete patient",
            })?;
        ensure!(
            changed > 0,
            NotFoundSnafu {
                entity: "patient",
                key: patient_id,
            }
        );
        debug!("deleted patient `{}` (cascading)", patient_id);
        Ok(())
    }

    /// Total patient count.
    pub fn patient_count(&self) -> Result<u64> {
        self.count_rows("SELECT COUNT(*) FROM patients", &[])
    }

    // ======================================================================
    // studies
    // ======================================================================

    /// Insert or update a study by its study instance UID.
    pub fn upsert_study(&self, record: &StudyRecord) -> Result<i64> {
        let conn = self.lock();
        upsert_study_tx(&conn, record)
    }

    /// Find a study by study instance UID.
    pub fn find_study(&self, study_uid: &str) -> Result<Option<StudyRecord>> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {STUDY_COLUMNS} FROM studies WHERE study_uid = ?1"),
            [study_uid],
            row_to_study,
        )
        .optional()
        .context(SqliteSnafu {
            operation: "find study",
        })
    }

    /// Find a study by primary key.
    pub fn find_study_by_pk(&self, pk: i64) -> Result<Option<StudyRecord>> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {STUDY_COLUMNS} FROM studies WHERE pk = ?1"),
            [pk],
            row_to_study,
        )
        .optional()
        .context(SqliteSnafu {
            operation: "find study by pk",
        })
    }

    /// List all studies of a patient, most recent first.
    pub fn list_studies(&self, patient_id: &str) -> Result<Vec<StudyRecord>> {
        let sql = format!(
            "SELECT {STUDY_COLUMNS} FROM studies \
             WHERE patient_pk = (SELECT pk FROM patients WHERE patient_id = ?1) \
             ORDER BY study_date DESC, study_time DESC, pk ASC"
        );
        let conn = self.lock();
        collect_rows(
            &conn,
            &sql,
            &[Value::from(patient_id.to_string())],
            row_to_study,
            "list studies",
        )
    }

    /// Search studies with optional filters and wildcards.
    ///
    /// Matches are ordered by study date and time, most recent first,
    /// with the primary key as the stable tie-break.
    pub fn search_studies(&self, query: &StudyQuery) -> Result<Vec<StudyRecord>> {
        let mut filter = Filter::new();
        filter.push_pattern("s.study_uid", query.study_uid.as_deref());
        filter.push_pattern("s.study_id", query.study_id.as_deref());
        filter.push_pattern("s.accession_number", query.accession_number.as_deref());
        filter.push_pattern("s.referring_physician", query.referring_physician.as_deref());
        filter.push_pattern("s.study_description", query.study_description.as_deref());
        filter.push_pattern("p.patient_id", query.patient_id.as_deref());
        filter.push_pattern("p.patient_name", query.patient_name.as_deref());
        filter.push_range(
            "s.study_date",
            query.study_date_from.as_deref(),
            query.study_date_to.as_deref(),
        );
        if let Some(modality) = query.modality.as_deref() {
            // the denormalized field is a backslash separated list
            filter.push_contains("s.modalities_in_study", modality);
        }

        let sql = format!(
            "SELECT {STUDY_COLUMNS_QUALIFIED} FROM studies s \
             JOIN patients p ON p.pk = s.patient_pk{} \
             ORDER BY s.study_date DESC, s.study_time DESC, s.pk ASC LIMIT ?{} OFFSET ?{}",
            filter.where_clause(),
            filter.len() + 1,
            filter.len() + 2,
        );
        let params = filter.into_params(query.limit, query.offset);

        let conn = self.lock();
        collect_rows(&conn, &sql, &params, row_to_study, "search studies")
    }

    /// Delete a study, cascading to its series and instances.
    pub fn delete_study(&self, study_uid: &str) -> Result<()> {
        let conn = self.lock();
        let changed = conn
            .execute("DELETE FROM studies WHERE study_uid = ?1", [study_uid])
            .context(SqliteSnafu {
                operation: "delete study",
            })?;
        ensure!(
            changed > 0,
            NotFoundSnafu {
                entity: "study",
                key: study_uid,
            }
        );
        Ok(())
    }

    /// Total study count.
    pub fn study_count(&self) -> Result<u64> {
        self.count_rows("SELECT COUNT(*) FROM studies", &[])
    }

    /// Study count for one patient.
    pub fn study_count_for_patient(&self, patient_id: &str) -> Result<u64> {
        self.count_rows(
            "SELECT COUNT(*) FROM studies \
             WHERE patient_pk = (SELECT pk FROM patients WHERE patient_id = ?1)",
            &[Value::from(patient_id.to_string())],
        )
    }

    /// Recompute the denormalized modalities of a study
    /// from its series rows.
    pub fn update_modalities_in_study(&self, study_pk: i64) -> Result<()> {
        let conn = self.lock();
        update_modalities_in_study_tx(&conn, study_pk)
    }

    // ======================================================================
    // series
    // ======================================================================

    /// Insert or update a series by its series instance UID.
    pub fn upsert_series(&self, record: &SeriesRecord) -> Result<i64> {
        let conn = self.lock();
        upsert_series_tx(&conn, record)
    }

    /// Find a series by series instance UID.
    pub fn find_series(&self, series_uid: &str) -> Result<Option<SeriesRecord>> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {SERIES_COLUMNS} FROM series WHERE series_uid = ?1"),
            [series_uid],
            row_to_series,
        )
        .optional()
        .context(SqliteSnafu {
            operation: "find series",
        })
    }

    /// Find a series by primary key.
    pub fn find_series_by_pk(&self, pk: i64) -> Result<Option<SeriesRecord>> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {SERIES_COLUMNS} FROM series WHERE pk = ?1"),
            [pk],
            row_to_series,
        )
        .optional()
        .context(SqliteSnafu {
            operation: "find series by pk",
        })
    }

    /// List all series of a study in series number order.
    pub fn list_series(&self, study_uid: &str) -> Result<Vec<SeriesRecord>> {
        let sql = format!(
            "SELECT {SERIES_COLUMNS} FROM series \
             WHERE study_pk = (SELECT pk FROM studies WHERE study_uid = ?1) \
             ORDER BY series_number ASC, pk ASC"
        );
        let conn = self.lock();
        collect_rows(
            &conn,
            &sql,
            &[Value::from(study_uid.to_string())],
            row_to_series,
            "list series",
        )
    }

    /// Search series with optional filters and wildcards.
    pub fn search_series(&self, query: &SeriesQuery) -> Result<Vec<SeriesRecord>> {
        let mut filter = Filter::new();
        filter.push_pattern("se.series_uid", query.series_uid.as_deref());
        filter.push_pattern("se.modality", query.modality.as_deref());
        filter.push_pattern("se.body_part_examined", query.body_part_examined.as_deref());
        filter.push_pattern("se.station_name", query.station_name.as_deref());
        filter.push_pattern("st.study_uid", query.study_uid.as_deref());

        let sql = format!(
            "SELECT {SERIES_COLUMNS_QUALIFIED} FROM series se \
             JOIN studies st ON st.pk = se.study_pk{} \
             ORDER BY se.series_number ASC, se.pk ASC LIMIT ?{} OFFSET ?{}",
            filter.where_clause(),
            filter.len() + 1,
            filter.len() + 2,
        );
        let params = filter.into_params(query.limit, query.offset);

        let conn = self.lock();
        collect_rows(&conn, &sql, &params, row_to_series, "search series")
    }

    /// Delete a series, cascading to its instances,
    /// and refresh the study's modality list.
    pub fn delete_series(&self, series_uid: &str) -> Result<()> {
        let conn = self.lock();
        let study_pk: Option<i64> = conn
            .query_row(
                "SELECT study_pk FROM series WHERE series_uid = ?1",
                [series_uid],
                |row| row.get(0),
            )
            .optional()
            .context(SqliteSnafu {
                operation: "delete series",
            })?;
        let study_pk = study_pk.ok_or_else(|| {
            NotFoundSnafu {
                entity: "series",
                key: series_uid,
            }
            .build()
        })?;

        conn.execute("DELETE FROM series WHERE series_uid = ?1", [series_uid])
            .context(SqliteSnafu {
                operation: "delete series",
            })?;
        update_modalities_in_study_tx(&conn, study_pk)
    }

    /// Total series count.
    pub fn series_count(&self) -> Result<u64> {
        self.count_rows("SELECT COUNT(*) FROM series", &[])
    }

    /// Series count for one study.
    pub fn series_count_for_study(&self, study_uid: &str) -> Result<u64> {
        self.count_rows(
            "SELECT COUNT(*) FROM series \
             WHERE study_pk = (SELECT pk FROM studies WHERE study_uid = ?1)",
            &[Value::from(study_uid.to_string())],
        )
    }

    // ======================================================================
    // instances
    // ======================================================================

    /// Insert or update an instance by its SOP instance UID.
    pub fn upsert_instance(&self, record: &InstanceRecord) -> Result<i64> {
        let conn = self.lock();
        upsert_instance_tx(&conn, record)
    }

    /// Find an instance by SOP instance UID.
    pub fn find_instance(&self, sop_uid: &str) -> Result<Option<InstanceRecord>> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {INSTANCE_COLUMNS} FROM instances WHERE sop_uid = ?1"),
            [sop_uid],
            row_to_instance,
        )
        .optional()
        .context(SqliteSnafu {
            operation: "find instance",
        })
    }

    /// Find an instance by primary key.
    pub fn find_instance_by_pk(&self, pk: i64) -> Result<Option<InstanceRecord>> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {INSTANCE_COLUMNS} FROM instances WHERE pk = ?1"),
            [pk],
            row_to_instance,
        )
        .optional()
        .context(SqliteSnafu {
            operation: "find instance by pk",
        })
    }

    /// List all instances of a series in instance number order.
    pub fn list_instances(&self, series_uid: &str) -> Result<Vec<InstanceRecord>> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances \
             WHERE series_pk = (SELECT pk FROM series WHERE series_uid = ?1) \
             ORDER BY instance_number ASC, pk ASC"
        );
        let conn = self.lock();
        collect_rows(
            &conn,
            &sql,
            &[Value::from(series_uid.to_string())],
            row_to_instance,
            "list instances",
        )
    }

    /// Search instances with optional filters.
    pub fn search_instances(&self, query: &InstanceQuery) -> Result<Vec<InstanceRecord>> {
        let mut filter = Filter::new();
        filter.push_pattern("i.sop_uid", query.sop_uid.as_deref());
        filter.push_pattern("i.sop_class_uid", query.sop_class_uid.as_deref());
        filter.push_pattern("se.series_uid", query.series_uid.as_deref());

        let sql = format!(
            "SELECT {INSTANCE_COLUMNS_QUALIFIED} FROM instances i \
             JOIN series se ON se.pk = i.series_pk{} \
             ORDER BY i.instance_number ASC, i.pk ASC LIMIT ?{} OFFSET ?{}",
            filter.where_clause(),
            filter.len() + 1,
            filter.len() + 2,
        );
        let params = filter.into_params(query.limit, query.offset);

        let conn = self.lock();
        collect_rows(&conn, &sql, &params, row_to_instance, "search instances")
    }

    /// Delete an instance by SOP instance UID.
    pub fn delete_instance(&self, sop_uid: &str) -> Result<()> {
        let conn = self.lock();
        let changed = conn
            .execute("DELETE FROM instances WHERE sop_uid = ?1", [sop_uid])
            .context(SqliteSnafu {
                operation: "delete instance",
            })?;
        ensure!(
            changed > 0,
            NotFoundSnafu {
                entity: "instance",
                key: sop_uid,
            }
        );
        Ok(())
    }

    /// Total instance count.
    pub fn instance_count(&self) -> Result<u64> {
        self.count_rows("SELECT COUNT(*) FROM instances", &[])
    }

    /// Instance count for one series.
    pub fn instance_count_for_series(&self, series_uid: &str) -> Result<u64> {
        self.count_rows(
            "SELECT COUNT(*) FROM instances \
             WHERE series_pk = (SELECT pk FROM series WHERE series_uid = ?1)",
            &[Value::from(series_uid.to_string())],
        )
    }

    /// Upsert the whole entity chain of a stored instance
    /// in one transaction, refreshing the study's modality list.
    ///
    /// The foreign keys of the given records are filled in here;
    /// callers only provide the natural keys and attributes.
    pub fn upsert_instance_chain(
        &self,
        patient: &PatientRecord,
        study: &StudyRecord,
        series: &SeriesRecord,
        instance: &InstanceRecord,
    ) -> Result<i64> {
        let mut conn = self.lock();
        let tx = conn.transaction().context(SqliteSnafu {
            operation: "begin instance chain",
        })?;

        let instance_pk = {
            let patient_pk = upsert_patient_tx(&tx, patient)?;
            let mut study = study.clone();
            study.patient_pk = patient_pk;
            let study_pk = upsert_study_tx(&tx, &study)?;
            let mut series = series.clone();
            series.study_pk = study_pk;
            let series_pk = upsert_series_tx(&tx, &series)?;
            let mut instance = instance.clone();
            instance.series_pk = series_pk;
            let instance_pk = upsert_instance_tx(&tx, &instance)?;
            update_modalities_in_study_tx(&tx, study_pk)?;
            instance_pk
        };

        tx.commit().context(SqliteSnafu {
            operation: "commit instance chain",
        })?;
        Ok(instance_pk)
    }

    // ======================================================================
    // file path lookups
    // ======================================================================

    /// The blob path of one instance, if it is indexed.
    pub fn get_file_path(&self, sop_uid: &str) -> Result<Option<String>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT file_path FROM instances WHERE sop_uid = ?1",
            [sop_uid],
            |row| row.get(0),
        )
        .optional()
        .context(SqliteSnafu {
            operation: "get file path",
        })
    }

    /// All blob paths of a study, for bulk operations such as C-MOVE.
    pub fn get_study_files(&self, study_uid: &str) -> Result<Vec<String>> {
        let conn = self.lock();
        collect_rows(
            &conn,
            "SELECT i.file_path FROM instances i \
             JOIN series se ON se.pk = i.series_pk \
             JOIN studies st ON st.pk = se.study_pk \
             WHERE st.study_uid = ?1 ORDER BY i.pk ASC",
            &[Value::from(study_uid.to_string())],
            |row| row.get(0),
            "get study files",
        )
    }

    /// All blob paths of a series.
    pub fn get_series_files(&self, series_uid: &str) -> Result<Vec<String>> {
        let conn = self.lock();
        collect_rows(
            &conn,
            "SELECT i.file_path FROM instances i \
             JOIN series se ON se.pk = i.series_pk \
             WHERE se.series_uid = ?1 ORDER BY i.pk ASC",
            &[Value::from(series_uid.to_string())],
            |row| row.get(0),
            "get series files",
        )
    }

    // ======================================================================
    // maintenance
    // ======================================================================

    /// Rebuild the database file, reclaiming unused space.
    ///
    /// Requires exclusive access and may take time
    /// proportional to the database size.
    pub fn vacuum(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch("VACUUM").context(SqliteSnafu {
            operation: "vacuum",
        })
    }

    /// Refresh table statistics for the query planner.
    pub fn analyze(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch("ANALYZE").context(SqliteSnafu {
            operation: "analyze",
        })
    }

    /// Write WAL contents to the main database file.
    ///
    /// With `truncate`, the WAL file is reset afterwards.
    pub fn checkpoint(&self, truncate: bool) -> Result<()> {
        let conn = self.lock();
        let mode = if truncate { "TRUNCATE" } else { "PASSIVE" };
        let (busy, _log, _checkpointed): (i64, i64, i64) = conn
            .query_row(&format!("PRAGMA wal_checkpoint({mode})"), [], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .context(SqliteSnafu {
                operation: "checkpoint",
            })?;
        if busy != 0 {
            warn!("WAL checkpoint was blocked by a concurrent reader");
        }
        Ok(())
    }

    /// Run the backend integrity check.
    ///
    /// Any finding is reported as an [`Integrity`](crate::Error::Integrity)
    /// error carrying the backend's human-readable message.
    pub fn verify_integrity(&self) -> Result<()> {
        let conn = self.lock();
        let findings = collect_rows(
            &conn,
            "PRAGMA integrity_check",
            &[],
            |row| row.get::<_, String>(0),
            "integrity check",
        )?;
        if findings.len() == 1 && findings[0] == "ok" {
            Ok(())
        } else {
            IntegritySnafu {
                message: findings.join("; "),
            }
            .fail()
        }
    }

    /// Aggregate statistics about the database contents.
    pub fn get_storage_stats(&self) -> Result<StorageStats> {
        let conn = self.lock();
        let operation = "storage stats";

        let total_patients =
            conn.query_row("SELECT COUNT(*) FROM patients", [], |r| r.get(0));
        let total_studies = conn.query_row("SELECT COUNT(*) FROM studies", [], |r| r.get(0));
        let total_series = conn.query_row("SELECT COUNT(*) FROM series", [], |r| r.get(0));
        let total_instances =
            conn.query_row("SELECT COUNT(*) FROM instances", [], |r| r.get(0));
        let total_file_size = conn.query_row(
            "SELECT COALESCE(SUM(file_size), 0) FROM instances",
            [],
            |r| r.get(0),
        );
        let page_count: rusqlite::Result<i64> =
            conn.query_row("PRAGMA page_count", [], |r| r.get(0));
        let page_size: rusqlite::Result<i64> =
            conn.query_row("PRAGMA page_size", [], |r| r.get(0));

        Ok(StorageStats {
            total_patients: total_patients.context(SqliteSnafu { operation })?,
            total_studies: total_studies.context(SqliteSnafu { operation })?,
            total_series: total_series.context(SqliteSnafu { operation })?,
            total_instances: total_instances.context(SqliteSnafu { operation })?,
            total_file_size: total_file_size.context(SqliteSnafu { operation })?,
            database_size: page_count.context(SqliteSnafu { operation })?
                * page_size.context(SqliteSnafu { operation })?,
        })
    }

    pub(crate) fn count_rows(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let conn = self.lock();
        conn.query_row(sql, rusqlite::params_from_iter(params.iter()), |row| {
            row.get(0)
        })
        .context(SqliteSnafu { operation: "count" })
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let conn = self.lock();
        f(&conn)
    }
}

fn configure(conn: &Connection, config: &IndexConfig) -> rusqlite::Result<()> {
    if config.wal_mode {
        // WAL keeps readers unblocked while one writer proceeds
        let _mode: String =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    }
    conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA synchronous = NORMAL;")?;
    conn.execute_batch(&format!(
        "PRAGMA cache_size = -{};",
        config.cache_size_mb * 1024
    ))?;
    if config.mmap_enabled {
        let _size: i64 = conn.query_row(
            &format!("PRAGMA mmap_size = {}", config.mmap_size),
            [],
            |row| row.get(0),
        )?;
    }
    Ok(())
}

// ==========================================================================
// upsert implementations, shared between public wrappers
// and the chained transaction
// ==========================================================================

fn validate_key(what: &'static str, value: &str) -> Result<()> {
    ensure!(
        !value.is_empty(),
        InvalidRecordSnafu {
            what,
            why: "must not be empty",
        }
    );
    ensure!(
        value.len() <= MAX_KEY_LENGTH,
        InvalidRecordSnafu {
            what,
            why: format!("exceeds {MAX_KEY_LENGTH} characters"),
        }
    );
    Ok(())
}

fn upsert_patient_tx(conn: &Connection, record: &PatientRecord) -> Result<i64> {
    validate_key("patient id", &record.patient_id)?;
    conn.query_row(
        "INSERT INTO patients (patient_id, patient_name, birth_date, sex, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?5) \
         ON CONFLICT(patient_id) DO UPDATE SET \
           patient_name = CASE WHEN excluded.patient_name != '' THEN excluded.patient_name ELSE patients.patient_name END, \
           birth_date = CASE WHEN excluded.birth_date != '' THEN excluded.birth_date ELSE patients.birth_date END, \
           sex = CASE WHEN excluded.sex != '' THEN excluded.sex ELSE patients.sex END, \
           updated_at = excluded.updated_at \
         RETURNING pk",
        params![
            record.patient_id,
            record.patient_name,
            record.birth_date,
            record.sex,
            Utc::now(),
        ],
        |row| row.get(0),
    )
    .context(SqliteSnafu {
        operation: "upsert patient",
    })
}

fn upsert_study_tx(conn: &Connection, record: &StudyRecord) -> Result<i64> {
    validate_key("study uid", &record.study_uid)?;
    conn.query_row(
        "INSERT INTO studies (patient_pk, study_uid, study_id, study_date, study_time, \
           accession_number, referring_physician, study_description, modalities_in_study, \
           created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10) \
         ON CONFLICT(study_uid) DO UPDATE SET \
           study_id = CASE WHEN excluded.study_id != '' THEN excluded.study_id ELSE studies.study_id END, \
           study_date = CASE WHEN excluded.study_date != '' THEN excluded.study_date ELSE studies.study_date END, \
           study_time = CASE WHEN excluded.study_time != '' THEN excluded.study_time ELSE studies.study_time END, \
           accession_number = CASE WHEN excluded.accession_number != '' THEN excluded.accession_number ELSE studies.accession_number END, \
           referring_physician = CASE WHEN excluded.referring_physician != '' THEN excluded.referring_physician ELSE studies.referring_physician END, \
           study_description = CASE WHEN excluded.study_description != '' THEN excluded.study_description ELSE studies.study_description END, \
           updated_at = excluded.updated_at \
         RETURNING pk",
        params![
            record.patient_pk,
            record.study_uid,
            record.study_id,
            record.study_date,
            record.study_time,
            record.accession_number,
            record.referring_physician,
            record.study_description,
            record.modalities_in_study,
            Utc::now(),
        ],
        |row| row.get(0),
    )
    .context(SqliteSnafu {
        operation: "upsert study",
    })
}

fn upsert_series_tx(conn: &Connection, record: &SeriesRecord) -> Result<i64> {
    validate_key("series uid", &record.series_uid)?;
    conn.query_row(
        "INSERT INTO series (study_pk, series_uid, modality, series_number, \
           series_description, body_part_examined, station_name, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8) \
         ON CONFLICT(series_uid) DO UPDATE SET \
           modality = CASE WHEN excluded.modality != '' THEN excluded.modality ELSE series.modality END, \
           series_number = COALESCE(excluded.series_number, series.series_number), \
           series_description = CASE WHEN excluded.series_description != '' THEN excluded.series_description ELSE series.series_description END, \
           body_part_examined = CASE WHEN excluded.body_part_examined != '' THEN excluded.body_part_examined ELSE series.body_part_examined END, \
           station_name = CASE WHEN excluded.station_name != '' THEN excluded.station_name ELSE series.station_name END, \
           updated_at = excluded.updated_at \
         RETURNING pk",
        params![
            record.study_pk,
            record.series_uid,
            record.modality,
            record.series_number,
            record.series_description,
            record.body_part_examined,
            record.station_name,
            Utc::now(),
        ],
        |row| row.get(0),
    )
    .context(SqliteSnafu {
        operation: "upsert series",
    })
}

fn upsert_instance_tx(conn: &Connection, record: &InstanceRecord) -> Result<i64> {
    validate_key("sop instance uid", &record.sop_uid)?;
    ensure!(
        record.file_size >= 0,
        InvalidRecordSnafu {
            what: "instance file size",
            why: "must not be negative",
        }
    );
    conn.query_row(
        "INSERT INTO instances (series_pk, sop_uid, sop_class_uid, file_path, file_size, \
           transfer_syntax, instance_number, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8) \
         ON CONFLICT(sop_uid) DO UPDATE SET \
           sop_class_uid = CASE WHEN excluded.sop_class_uid != '' THEN excluded.sop_class_uid ELSE instances.sop_class_uid END, \
           file_path = CASE WHEN excluded.file_path != '' THEN excluded.file_path ELSE instances.file_path END, \
           file_size = excluded.file_size, \
           transfer_syntax = CASE WHEN excluded.transfer_syntax != '' THEN excluded.transfer_syntax ELSE instances.transfer_syntax END, \
           instance_number = COALESCE(excluded.instance_number, instances.instance_number), \
           updated_at = excluded.updated_at \
         RETURNING pk",
        params![
            record.series_pk,
            record.sop_uid,
            record.sop_class_uid,
            record.file_path,
            record.file_size,
            record.transfer_syntax,
            record.instance_number,
            Utc::now(),
        ],
        |row| row.get(0),
    )
    .context(SqliteSnafu {
        operation: "upsert instance",
    })
}

fn update_modalities_in_study_tx(conn: &Connection, study_pk: i64) -> Result<()> {
    let mut stmt = conn
        .prepare(
            "SELECT DISTINCT modality FROM series \
             WHERE study_pk = ?1 AND modality != '' ORDER BY modality",
        )
        .context(SqliteSnafu {
            operation: "update modalities in study",
        })?;
    let modalities: std::result::Result<Vec<String>, _> = stmt
        .query_map([study_pk], |row| row.get(0))
        .context(SqliteSnafu {
            operation: "update modalities in study",
        })?
        .collect();
    let modalities = modalities.context(SqliteSnafu {
        operation: "update modalities in study",
    })?;

    conn.execute(
        "UPDATE studies SET modalities_in_study = ?1 WHERE pk = ?2",
        params![modalities.join("\\"), study_pk],
    )
    .context(SqliteSnafu {
        operation: "update modalities in study",
    })?;
    Ok(())
}

// ==========================================================================
// row mapping
// ==========================================================================

const PATIENT_COLUMNS: &str =
    "pk, patient_id, patient_name, birth_date, sex, created_at, updated_at";

fn row_to_patient(row: &Row) -> rusqlite::Result<PatientRecord> {
    Ok(PatientRecord {
        pk: row.get(0)?,
        patient_id: row.get(1)?,
        patient_name: row.get(2)?,
        birth_date: row.get(3)?,
        sex: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

const STUDY_COLUMNS: &str = "pk, patient_pk, study_uid, study_id, study_date, study_time, \
     accession_number, referring_physician, study_description, modalities_in_study, \
     created_at, updated_at";

const STUDY_COLUMNS_QUALIFIED: &str =
    "s.pk, s.patient_pk, s.study_uid, s.study_id, s.study_date, s.study_time, \
     s.accession_number, s.referring_physician, s.study_description, s.modalities_in_study, \
     s.created_at, s.updated_at";

fn row_to_study(row: &Row) -> rusqlite::Result<StudyRecord> {
    Ok(StudyRecord {
        pk: row.get(0)?,
        patient_pk: row.get(1)?,
        study_uid: row.get(2)?,
        study_id: row.get(3)?,
        study_date: row.get(4)?,
        study_time: row.get(5)?,
        accession_number: row.get(6)?,
        referring_physician: row.get(7)?,
        study_description: row.get(8)?,
        modalities_in_study: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

const SERIES_COLUMNS: &str = "pk, study_pk, series_uid, modality, series_number, \
     series_description, body_part_examined, station_name, created_at, updated_at";

const SERIES_COLUMNS_QUALIFIED: &str =
    "se.pk, se.study_pk, se.series_uid, se.modality, se.series_number, \
     se.series_description, se.body_part_examined, se.station_name, se.created_at, se.updated_at";

fn row_to_series(row: &Row) -> rusqlite::Result<SeriesRecord> {
    Ok(SeriesRecord {
        pk: row.get(0)?,
        study_pk: row.get(1)?,
        series_uid: row.get(2)?,
        modality: row.get(3)?,
        series_number: row.get(4)?,
        series_description: row.get(5)?,
        body_part_examined: row.get(6)?,
        station_name: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

const INSTANCE_COLUMNS: &str = "pk, series_pk, sop_uid, sop_class_uid, file_path, file_size, \
     transfer_syntax, instance_number, created_at, updated_at";

const INSTANCE_COLUMNS_QUALIFIED: &str =
    "i.pk, i.series_pk, i.sop_uid, i.sop_class_uid, i.file_path, i.file_size, \
     i.transfer_syntax, i.instance_number, i.created_at, i.updated_at";

fn row_to_instance(row: &Row) -> rusqlite::Result<InstanceRecord> {
    Ok(InstanceRecord {
        pk: row.get(0)?,
        series_pk: row.get(1)?,
        sop_uid: row.get(2)?,
        sop_class_uid: row.get(3)?,
        file_path: row.get(4)?,
        file_size: row.get(5)?,
        transfer_syntax: row.get(6)?,
        instance_number: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

// ==========================================================================
// filter building
// ==========================================================================

/// Accumulates WHERE conditions with positional parameters.
///
/// `*` in user patterns maps to the SQL `%` wildcard;
/// patterns without `*` compare by equality.
pub(crate) struct Filter {
    conditions: Vec<String>,
    params: Vec<Value>,
}

impl Filter {
    pub(crate) fn new() -> Self {
        Filter {
            conditions: vec![],
            params: vec![],
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.params.len()
    }

    pub(crate) fn push_pattern(&mut self, column: &str, pattern: Option<&str>) {
        let Some(pattern) = pattern else { return };
        if pattern.contains('*') {
            self.conditions
                .push(format!("{column} LIKE ?{}", self.params.len() + 1));
            self.params.push(Value::from(pattern.replace('*', "%")));
        } else {
            self.conditions
                .push(format!("{column} = ?{}", self.params.len() + 1));
            self.params.push(Value::from(pattern.to_string()));
        }
    }

    pub(crate) fn push_exact(&mut self, column: &str, value: Option<&str>) {
        let Some(value) = value else { return };
        self.conditions
            .push(format!("{column} = ?{}", self.params.len() + 1));
        self.params.push(Value::from(value.to_string()));
    }

    pub(crate) fn push_range(&mut self, column: &str, from: Option<&str>, to: Option<&str>) {
        if let Some(from) = from {
            self.conditions
                .push(format!("{column} >= ?{}", self.params.len() + 1));
            self.params.push(Value::from(from.to_string()));
        }
        if let Some(to) = to {
            self.conditions
                .push(format!("{column} <= ?{}", self.params.len() + 1));
            self.params.push(Value::from(to.to_string()));
        }
    }

    /// Match one entry of a backslash separated value list.
    pub(crate) fn push_contains(&mut self, column: &str, value: &str) {
        self.conditions.push(format!(
            "('\\' || {column} || '\\') LIKE ?{}",
            self.params.len() + 1
        ));
        self.params
            .push(Value::from(format!("%\\{}\\%", value.replace('*', "%"))));
    }

    pub(crate) fn where_clause(&self) -> String {
        if self.conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.conditions.join(" AND "))
        }
    }

    /// Consume the filter, appending the LIMIT and OFFSET parameters.
    pub(crate) fn into_params(self, limit: usize, offset: usize) -> Vec<Value> {
        let mut params = self.params;
        params.push(Value::from(if limit == 0 { -1 } else { limit as i64 }));
        params.push(Value::from(offset as i64));
        params
    }
}

pub(crate) fn collect_rows<T>(
    conn: &Connection,
    sql: &str,
    params: &[Value],
    mapper: impl Fn(&Row) -> rusqlite::Result<T>,
    operation: &'static str,
) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql).context(SqliteSnafu { operation })?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), mapper)
        .context(SqliteSnafu { operation })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context(SqliteSnafu { operation })?);
    }
    Ok(out)
}
