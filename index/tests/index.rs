//! End-to-end tests for the storage index against a real database file.

use chrono::{Duration, Utc};
use matches::matches;
use pacs_index::{
    Error, IndexDatabase, InstanceRecord, MppsRecord, PatientQuery, PatientRecord, SeriesRecord,
    StudyQuery, StudyRecord, WorklistItem, WorklistQuery, WorklistStatus,
};

fn open_temp() -> (tempfile::TempDir, IndexDatabase) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.db");
    let db = IndexDatabase::open(path.to_str().unwrap()).unwrap();
    (dir, db)
}

/// Insert a full chain for one instance.
fn seed_instance(
    db: &IndexDatabase,
    patient_id: &str,
    study_uid: &str,
    series_uid: &str,
    sop_uid: &str,
    modality: &str,
) -> i64 {
    let mut patient = PatientRecord::new(patient_id);
    patient.patient_name = format!("{patient_id}^Test");
    let mut study = StudyRecord::new(study_uid);
    study.study_date = "20240115".into();
    study.study_time = "101530".into();
    let mut series = SeriesRecord::new(series_uid);
    series.modality = modality.into();
    let mut instance = InstanceRecord::new(sop_uid);
    instance.sop_class_uid = "1.2.840.10008.5.1.4.1.1.2".into();
    instance.file_path = format!("{study_uid}/{series_uid}/{sop_uid}.dcm");
    instance.file_size = 4096;
    instance.transfer_syntax = "1.2.840.10008.1.2".into();

    db.upsert_instance_chain(&patient, &study, &series, &instance)
        .unwrap()
}

#[test]
fn schema_is_migrated_on_open() {
    let (_dir, db) = open_temp();
    assert_eq!(
        db.schema_version().unwrap(),
        pacs_index::migrations::LATEST_VERSION
    );
}

#[test]
fn upsert_patient_keeps_the_pk_stable() {
    let (_dir, db) = open_temp();

    let mut record = PatientRecord::new("DOE01");
    record.patient_name = "Doe^John".into();
    record.birth_date = "19800115".into();
    record.sex = "M".into();

    let pk1 = db.upsert_patient(&record).unwrap();
    let pk2 = db.upsert_patient(&record).unwrap();
    assert_eq!(pk1, pk2);

    // an upsert with empty attributes does not blank stored values
    let sparse = PatientRecord::new("DOE01");
    let pk3 = db.upsert_patient(&sparse).unwrap();
    assert_eq!(pk1, pk3);

    let found = db.find_patient("DOE01").unwrap().unwrap();
    assert_eq!(found.patient_name, "Doe^John");
    assert_eq!(found.birth_date, "19800115");
    assert_eq!(found.sex, "M");
    assert_eq!(db.find_patient_by_pk(pk1).unwrap().unwrap().patient_id, "DOE01");
}

#[test]
fn empty_patient_id_is_rejected() {
    let (_dir, db) = open_temp();
    let err = db.upsert_patient(&PatientRecord::new("")).unwrap_err();
    assert!(matches!(err, Error::InvalidRecord { .. }));

    let err = db
        .upsert_patient(&PatientRecord::new("X".repeat(65)))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRecord { .. }));
}

#[test]
fn instance_chain_upsert_is_queriable() {
    let (_dir, db) = open_temp();
    let pk = seed_instance(&db, "DOE01", "1.2.3.10", "1.2.3.10.1", "1.2.3.10.1.1", "CT");
    assert!(pk > 0);

    assert_eq!(db.patient_count().unwrap(), 1);
    assert_eq!(db.study_count().unwrap(), 1);
    assert_eq!(db.series_count().unwrap(), 1);
    assert_eq!(db.instance_count().unwrap(), 1);

    let instance = db.find_instance("1.2.3.10.1.1").unwrap().unwrap();
    assert_eq!(instance.file_size, 4096);

    // the chain is linked through foreign keys
    let series = db.find_series_by_pk(instance.series_pk).unwrap().unwrap();
    assert_eq!(series.series_uid, "1.2.3.10.1");
    let study = db.find_study_by_pk(series.study_pk).unwrap().unwrap();
    assert_eq!(study.study_uid, "1.2.3.10");
    assert_eq!(study.modalities_in_study, "CT");

    // a second series refreshes the denormalized modality list
    seed_instance(&db, "DOE01", "1.2.3.10", "1.2.3.10.2", "1.2.3.10.2.1", "MR");
    let study = db.find_study("1.2.3.10").unwrap().unwrap();
    assert_eq!(study.modalities_in_study, "CT\\MR");

    assert_eq!(db.study_count_for_patient("DOE01").unwrap(), 1);
    assert_eq!(db.series_count_for_study("1.2.3.10").unwrap(), 2);
    assert_eq!(db.instance_count_for_series("1.2.3.10.1").unwrap(), 1);
}

#[test]
fn wildcard_search_matches_like_and_exact() {
    let (_dir, db) = open_temp();
    seed_instance(&db, "DOE01", "1.2.3.1", "1.2.3.1.1", "1.2.3.1.1.1", "CT");
    seed_instance(&db, "DOE02", "1.2.3.2", "1.2.3.2.1", "1.2.3.2.1.1", "CT");
    seed_instance(&db, "SMITH01", "1.2.3.3", "1.2.3.3.1", "1.2.3.3.1.1", "MR");

    let query = PatientQuery {
        patient_id: Some("DOE*".into()),
        ..Default::default()
    };
    let matches = db.search_patients(&query).unwrap();
    assert_eq!(matches.len(), 2);
    assert!(matches.iter().all(|p| p.patient_id.starts_with("DOE")));

    // no wildcard means equality, not prefix
    let query = PatientQuery {
        patient_id: Some("DOE".into()),
        ..Default::default()
    };
    assert!(db.search_patients(&query).unwrap().is_empty());

    let query = StudyQuery {
        patient_id: Some("DOE*".into()),
        ..Default::default()
    };
    assert_eq!(db.search_studies(&query).unwrap().len(), 2);

    let query = StudyQuery {
        modality: Some("MR".into()),
        ..Default::default()
    };
    let studies = db.search_studies(&query).unwrap();
    assert_eq!(studies.len(), 1);
    assert_eq!(studies[0].study_uid, "1.2.3.3");
}

#[test]
fn study_search_orders_by_date_desc_and_paginates() {
    let (_dir, db) = open_temp();

    for (i, date) in ["20240110", "20240120", "20240115"].iter().enumerate() {
        let patient_pk = db.upsert_patient(&PatientRecord::new("DOE01")).unwrap();
        let mut study = StudyRecord::new(format!("1.2.9.{i}"));
        study.patient_pk = patient_pk;
        study.study_date = date.to_string();
        db.upsert_study(&study).unwrap();
    }

    let all = db.search_studies(&StudyQuery::default()).unwrap();
    let dates: Vec<_> = all.iter().map(|s| s.study_date.as_str()).collect();
    assert_eq!(dates, ["20240120", "20240115", "20240110"]);

    let page = db
        .search_studies(&StudyQuery {
            limit: 1,
            offset: 1,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].study_date, "20240115");

    let range = db
        .search_studies(&StudyQuery {
            study_date_from: Some("20240112".into()),
            study_date_to: Some("20240117".into()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(range.len(), 1);
    assert_eq!(range[0].study_date, "20240115");
}

#[test]
fn delete_patient_cascades_to_the_whole_chain() {
    let (_dir, db) = open_temp();
    seed_instance(&db, "DOE01", "1.2.3.1", "1.2.3.1.1", "1.2.3.1.1.1", "CT");
    seed_instance(&db, "DOE01", "1.2.3.1", "1.2.3.1.2", "1.2.3.1.2.1", "CT");
    seed_instance(&db, "SMITH01", "1.2.3.9", "1.2.3.9.1", "1.2.3.9.1.1", "MR");

    db.delete_patient("DOE01").unwrap();

    assert_eq!(db.patient_count().unwrap(), 1);
    assert_eq!(db.study_count().unwrap(), 1);
    assert_eq!(db.series_count().unwrap(), 1);
    assert_eq!(db.instance_count().unwrap(), 1);
    assert!(db.find_study("1.2.3.1").unwrap().is_none());
    assert!(db.find_instance("1.2.3.1.1.1").unwrap().is_none());

    let err = db.delete_patient("DOE01").unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[test]
fn file_path_lookups() {
    let (_dir, db) = open_temp();
    seed_instance(&db, "DOE01", "1.2.3.1", "1.2.3.1.1", "1.2.3.1.1.1", "CT");
    seed_instance(&db, "DOE01", "1.2.3.1", "1.2.3.1.1", "1.2.3.1.1.2", "CT");
    seed_instance(&db, "DOE01", "1.2.3.1", "1.2.3.1.2", "1.2.3.1.2.1", "CT");

    assert_eq!(
        db.get_file_path("1.2.3.1.1.1").unwrap().as_deref(),
        Some("1.2.3.1/1.2.3.1.1/1.2.3.1.1.1.dcm")
    );
    assert_eq!(db.get_file_path("no.such.uid").unwrap(), None);
    assert_eq!(db.get_study_files("1.2.3.1").unwrap().len(), 3);
    assert_eq!(db.get_series_files("1.2.3.1.1").unwrap().len(), 2);
}

#[test]
fn mpps_state_machine() {
    let (_dir, db) = open_temp();

    let mut record = MppsRecord::new("1.2.3.55");
    record.station_ae = "CT01".into();
    record.modality = "CT".into();
    record.study_uid = "1.2.3.1".into();
    record.start_datetime = "20240115093000".into();
    let pk = db.create_mpps(&record).unwrap();
    assert!(pk > 0);

    // duplicate N-CREATE is refused
    let err = db.create_mpps(&record).unwrap_err();
    assert!(matches!(err, Error::DuplicateMpps { .. }));

    let stored = db.find_mpps("1.2.3.55").unwrap().unwrap();
    assert_eq!(stored.status, "IN PROGRESS");
    assert_eq!(db.list_active_mpps("CT01").unwrap().len(), 1);
    assert_eq!(db.find_mpps_by_study("1.2.3.1").unwrap().len(), 1);

    // a partial update in progress only touches non-empty fields
    let mut update = MppsRecord::new("1.2.3.55");
    update.performed_series = "[\"1.2.3.1.1\"]".into();
    db.update_mpps(&update).unwrap();
    let stored = db.find_mpps("1.2.3.55").unwrap().unwrap();
    assert_eq!(stored.status, "IN PROGRESS");
    assert_eq!(stored.station_ae, "CT01");
    assert_eq!(stored.performed_series, "[\"1.2.3.1.1\"]");

    // complete it
    let mut done = MppsRecord::new("1.2.3.55");
    done.status = "COMPLETED".into();
    done.end_datetime = "20240115103000".into();
    db.update_mpps(&done).unwrap();
    assert_eq!(db.mpps_count_by_status("COMPLETED").unwrap(), 1);
    assert_eq!(db.list_active_mpps("CT01").unwrap().len(), 0);

    // final states reject every further update
    let err = db.update_mpps(&done).unwrap_err();
    assert!(matches!(err, Error::InvalidStateTransition { .. }));
    let mut discontinue = MppsRecord::new("1.2.3.55");
    discontinue.status = "DISCONTINUED".into();
    let err = db.update_mpps(&discontinue).unwrap_err();
    assert!(matches!(err, Error::InvalidStateTransition { .. }));

    assert_eq!(db.mpps_count().unwrap(), 1);
    db.delete_mpps("1.2.3.55").unwrap();
    assert_eq!(db.mpps_count().unwrap(), 0);
}

#[test]
fn worklist_flow_follows_mpps_events() {
    let (_dir, db) = open_temp();

    let item = WorklistItem {
        step_id: "SPS001".into(),
        patient_id: "DOE01".into(),
        patient_name: "Doe^John".into(),
        accession_no: "ACC001".into(),
        modality: "CT".into(),
        station_ae: "CT01".into(),
        scheduled_datetime: "20240115090000".into(),
        ..Default::default()
    };
    db.add_worklist_item(&item).unwrap();

    // MWL C-FIND sees the scheduled item
    let query = WorklistQuery {
        modality: Some("CT".into()),
        ..Default::default()
    };
    assert_eq!(db.query_worklist(&query).unwrap().len(), 1);

    // MPPS N-CREATE starts the step; it is no longer scheduled
    db.update_worklist_status("SPS001", "ACC001", WorklistStatus::Started)
        .unwrap();
    assert!(db.query_worklist(&query).unwrap().is_empty());
    assert_eq!(db.worklist_count_by_status("STARTED").unwrap(), 1);

    // backward transitions are rejected
    let err = db
        .update_worklist_status("SPS001", "ACC001", WorklistStatus::Scheduled)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidStateTransition { .. }));

    db.update_worklist_status("SPS001", "ACC001", WorklistStatus::Completed)
        .unwrap();

    // cleanup by time point only removes non-scheduled items
    let deleted = db
        .cleanup_worklist_items_before(Utc::now() + Duration::days(365))
        .unwrap();
    assert_eq!(deleted, 1);
    assert_eq!(db.worklist_count().unwrap(), 0);
}

#[test]
fn audit_log_round_trip() {
    let (_dir, db) = open_temp();

    db.add_audit_log(&pacs_index::AuditRecord {
        event_type: "C-STORE".into(),
        outcome: "SUCCESS".into(),
        actor_ae: "CT01".into(),
        patient_id: "DOE01".into(),
        study_uid: "1.2.3.1".into(),
        message: "stored 1 instance".into(),
        ..Default::default()
    })
    .unwrap();

    assert_eq!(db.audit_count().unwrap(), 1);

    let entries = db
        .query_audit_log(&pacs_index::AuditQuery {
            event_type: Some("C-STORE".into()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].actor_ae, "CT01");

    let deleted = db
        .cleanup_audit_logs_before(Utc::now() + Duration::days(1))
        .unwrap();
    assert_eq!(deleted, 1);
    assert_eq!(db.audit_count().unwrap(), 0);
}

#[test]
fn maintenance_operations_run() {
    let (_dir, db) = open_temp();
    seed_instance(&db, "DOE01", "1.2.3.1", "1.2.3.1.1", "1.2.3.1.1.1", "CT");

    db.analyze().unwrap();
    db.checkpoint(true).unwrap();
    db.vacuum().unwrap();
    db.verify_integrity().unwrap();

    let stats = db.get_storage_stats().unwrap();
    assert_eq!(stats.total_patients, 1);
    assert_eq!(stats.total_studies, 1);
    assert_eq!(stats.total_series, 1);
    assert_eq!(stats.total_instances, 1);
    assert_eq!(stats.total_file_size, 4096);
    assert!(stats.database_size > 0);
}

#[test]
fn reopen_keeps_the_data() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.db");
    let path = path.to_str().unwrap();

    {
        let db = IndexDatabase::open(path).unwrap();
        seed_instance(&db, "DOE01", "1.2.3.1", "1.2.3.1.1", "1.2.3.1.1.1", "CT");
    }

    let db = IndexDatabase::open(path).unwrap();
    assert_eq!(db.instance_count().unwrap(), 1);
    assert_eq!(
        db.schema_version().unwrap(),
        pacs_index::migrations::LATEST_VERSION
    );
}
