//! Handler-level tests for the DIMSE service providers.

use std::sync::Arc;

use pacs_dimse::command::{CommandField, Priority};
use pacs_dimse::dataset::DataSet;
use pacs_dimse::message::DimseMessage;
use pacs_dimse::{status, tags, CommandSet};
use pacs_index::{IndexDatabase, WorklistItem};
use pacs_pipeline::CancelRegistry;
use pacs_services::{
    uids, FileBlobStore, MppsScp, QueryScp, RequestContext, ServiceRegistry, StorageScp,
    VerificationScp, WorklistScp,
};

struct Env {
    _dir: tempfile::TempDir,
    index: Arc<IndexDatabase>,
    blobs: Arc<FileBlobStore>,
    cancels: Arc<CancelRegistry>,
}

fn env() -> Env {
    let dir = tempfile::tempdir().unwrap();
    let index = Arc::new(
        IndexDatabase::open(dir.path().join("index.db").to_str().unwrap()).unwrap(),
    );
    let blobs = Arc::new(FileBlobStore::new(dir.path().join("blobs")));
    Env {
        _dir: dir,
        index,
        blobs,
        cancels: Arc::new(CancelRegistry::new()),
    }
}

fn ctx(abstract_syntax: &str) -> RequestContext {
    RequestContext {
        session_id: 1,
        context_id: 1,
        abstract_syntax: abstract_syntax.to_string(),
        transfer_syntax: uids::IMPLICIT_VR_LE.to_string(),
        calling_ae_title: "TEST-SCU".to_string(),
        called_ae_title: "TEST-SCP".to_string(),
    }
}

/// Build an encoded CT data set for one instance.
fn ct_dataset(patient_id: &str, study_uid: &str, series_uid: &str, sop_uid: &str) -> Vec<u8> {
    let mut ds = DataSet::new();
    ds.put_str(tags::SOP_CLASS_UID, "1.2.840.10008.5.1.4.1.1.2");
    ds.put_str(tags::SOP_INSTANCE_UID, sop_uid);
    ds.put_str(tags::PATIENT_ID, patient_id);
    ds.put_str(tags::PATIENT_NAME, format!("{patient_id}^Test"));
    ds.put_str(tags::STUDY_INSTANCE_UID, study_uid);
    ds.put_str(tags::STUDY_DATE, "20240115");
    ds.put_str(tags::STUDY_TIME, "101530");
    ds.put_str(tags::SERIES_INSTANCE_UID, series_uid);
    ds.put_str(tags::MODALITY, "CT");
    ds.put_str(tags::SERIES_NUMBER, "1");
    ds.put_str(tags::INSTANCE_NUMBER, "1");
    ds.encode(uids::IMPLICIT_VR_LE).unwrap()
}

fn store_instance(env: &Env, patient_id: &str, study: &str, series: &str, sop: &str) {
    let scp = StorageScp::new(Arc::clone(&env.index), env.blobs.clone());
    let command = CommandSet::store_rq(
        1,
        "1.2.840.10008.5.1.4.1.1.2",
        sop,
        Priority::Medium,
    );
    let message = DimseMessage {
        context_id: 1,
        command,
        dataset: Some(ct_dataset(patient_id, study, series, sop)),
    };
    let mut responses = Vec::new();
    let mut responder = |m: DimseMessage| {
        responses.push(m);
        Ok(())
    };
    use pacs_services::DimseService;
    scp.handle(&ctx("1.2.840.10008.5.1.4.1.1.2"), message, &mut responder)
        .unwrap();
    assert_eq!(responses[0].command.status, Some(status::SUCCESS));
}

#[test]
fn store_writes_blob_and_index_row() {
    let env = env();
    store_instance(&env, "DOE01", "1.2.3.1", "1.2.3.1.1", "1.2.3.1.1.1");

    // the index row is present
    let instance = env.index.find_instance("1.2.3.1.1.1").unwrap().unwrap();
    assert_eq!(instance.sop_class_uid, "1.2.840.10008.5.1.4.1.1.2");
    assert_eq!(instance.transfer_syntax, uids::IMPLICIT_VR_LE);

    // the blob is at the computed path
    let expected_path = "1.2.3.1/1.2.3.1.1/1.2.3.1.1.1.dcm";
    assert_eq!(instance.file_path, expected_path);
    use pacs_services::BlobStore;
    let bytes = env.blobs.get(expected_path).unwrap();
    assert_eq!(bytes.len() as i64, instance.file_size);
}

#[test]
fn store_without_dataset_cannot_be_understood() {
    let env = env();
    let scp = StorageScp::new(Arc::clone(&env.index), env.blobs.clone());
    let message = DimseMessage {
        context_id: 1,
        command: CommandSet::store_rq(1, "1.2.840.10008.5.1.4.1.1.2", "1.2.3", Priority::Medium),
        dataset: None,
    };

    let mut responses = Vec::new();
    let mut responder = |m: DimseMessage| {
        responses.push(m);
        Ok(())
    };
    use pacs_services::DimseService;
    scp.handle(&ctx("1.2.840.10008.5.1.4.1.1.2"), message, &mut responder)
        .unwrap();

    assert_eq!(
        responses[0].command.status,
        Some(status::ERROR_CANNOT_UNDERSTAND)
    );
    assert_eq!(env.index.instance_count().unwrap(), 0);
}

#[test]
fn find_streams_pending_then_one_final() {
    let env = env();
    store_instance(&env, "DOE01", "1.2.3.1", "1.2.3.1.1", "1.2.3.1.1.1");
    store_instance(&env, "DOE02", "1.2.3.2", "1.2.3.2.1", "1.2.3.2.1.1");
    store_instance(&env, "SMITH01", "1.2.3.3", "1.2.3.3.1", "1.2.3.3.1.1");

    let scp = QueryScp::new(Arc::clone(&env.index), Arc::clone(&env.cancels));

    let mut identifier = DataSet::new();
    identifier.put_str(tags::QUERY_RETRIEVE_LEVEL, "STUDY");
    identifier.put_str(tags::PATIENT_ID, "DOE*");
    let message = DimseMessage {
        context_id: 1,
        command: CommandSet::find_rq(5, uids::STUDY_ROOT_QR_FIND, Priority::Medium),
        dataset: Some(identifier.encode(uids::IMPLICIT_VR_LE).unwrap()),
    };

    let mut responses = Vec::new();
    let mut responder = |m: DimseMessage| {
        responses.push(m);
        Ok(())
    };
    use pacs_services::DimseService;
    scp.handle(&ctx(uids::STUDY_ROOT_QR_FIND), message, &mut responder)
        .unwrap();

    // two pending responses, then exactly one final success
    assert_eq!(responses.len(), 3);
    for pending in &responses[..2] {
        assert_eq!(pending.command.status, Some(status::PENDING));
        assert_eq!(pending.command.message_id_being_responded_to, Some(5));
        let identifier = DataSet::read(
            pending.dataset.as_ref().unwrap(),
            uids::IMPLICIT_VR_LE,
        )
        .unwrap();
        assert!(identifier
            .get_str(tags::PATIENT_ID)
            .unwrap()
            .starts_with("DOE"));
    }
    assert_eq!(responses[2].command.status, Some(status::SUCCESS));
    assert!(responses[2].dataset.is_none());
}

#[test]
fn cancel_mid_find_ends_with_cancel_status() {
    let env = env();
    for i in 0..20 {
        store_instance(
            &env,
            &format!("DOE{i:02}"),
            &format!("1.2.3.{i}"),
            &format!("1.2.3.{i}.1"),
            &format!("1.2.3.{i}.1.1"),
        );
    }

    let scp = QueryScp::new(Arc::clone(&env.index), Arc::clone(&env.cancels));

    let mut identifier = DataSet::new();
    identifier.put_str(tags::QUERY_RETRIEVE_LEVEL, "STUDY");
    identifier.put_str(tags::PATIENT_ID, "DOE*");
    let message = DimseMessage {
        context_id: 1,
        command: CommandSet::find_rq(9, uids::STUDY_ROOT_QR_FIND, Priority::Medium),
        dataset: Some(identifier.encode(uids::IMPLICIT_VR_LE).unwrap()),
    };

    // the "peer" cancels after receiving the tenth pending response
    let cancels = Arc::clone(&env.cancels);
    let mut responses: Vec<DimseMessage> = Vec::new();
    let mut responder = |m: DimseMessage| {
        let pending = m.command.status == Some(status::PENDING);
        responses.push(m);
        if pending && responses.len() == 10 {
            cancels.cancel(1, 9);
        }
        Ok(())
    };
    use pacs_services::DimseService;
    scp.handle(&ctx(uids::STUDY_ROOT_QR_FIND), message, &mut responder)
        .unwrap();

    // ten pending responses, then a single final cancel
    assert_eq!(responses.len(), 11);
    let last = responses.last().unwrap();
    assert_eq!(last.command.status, Some(status::CANCEL));
    assert!(!env.cancels.is_cancelled(1, 9));
}

#[test]
fn unknown_sop_class_is_refused_by_dispatch() {
    let env = env();
    let mut registry = ServiceRegistry::new();
    registry.register(Arc::new(VerificationScp));
    registry.register(Arc::new(QueryScp::new(
        Arc::clone(&env.index),
        Arc::clone(&env.cancels),
    )));

    let message = DimseMessage {
        context_id: 1,
        command: CommandSet::echo_rq(1, "1.2.840.10008.9.9.9"),
        dataset: None,
    };
    let mut responses = Vec::new();
    let mut responder = |m: DimseMessage| {
        responses.push(m);
        Ok(())
    };
    registry
        .dispatch(&ctx("1.2.840.10008.9.9.9"), message, &mut responder)
        .unwrap();

    assert_eq!(
        responses[0].command.status,
        Some(status::REFUSED_SOP_CLASS_NOT_SUPPORTED)
    );
}

#[test]
fn mpps_drives_the_worklist() {
    let env = env();

    env.index
        .add_worklist_item(&WorklistItem {
            step_id: "SPS001".into(),
            accession_no: "ACC001".into(),
            patient_id: "DOE01".into(),
            modality: "CT".into(),
            scheduled_datetime: "20240115090000".into(),
            ..Default::default()
        })
        .unwrap();

    let scp = MppsScp::new(Arc::clone(&env.index));
    use pacs_services::DimseService;

    // N-CREATE starts the step
    let mut attributes = DataSet::new();
    attributes.put_str(tags::PERFORMED_PROCEDURE_STEP_STATUS, "IN PROGRESS");
    attributes.put_str(tags::SCHEDULED_PROCEDURE_STEP_ID, "SPS001");
    attributes.put_str(tags::ACCESSION_NUMBER, "ACC001");
    attributes.put_str(tags::MODALITY, "CT");
    attributes.put_str(tags::STUDY_INSTANCE_UID, "1.2.3.1");
    attributes.put_str(tags::PERFORMED_PROCEDURE_STEP_START_DATE, "20240115");
    attributes.put_str(tags::PERFORMED_PROCEDURE_STEP_START_TIME, "093000");

    let create = DimseMessage {
        context_id: 1,
        command: CommandSet::n_create_rq(1, uids::MODALITY_PERFORMED_PROCEDURE_STEP, "1.2.3.77"),
        dataset: Some(attributes.encode(uids::IMPLICIT_VR_LE).unwrap()),
    };
    let mut responses = Vec::new();
    let mut responder = |m: DimseMessage| {
        responses.push(m);
        Ok(())
    };
    scp.handle(
        &ctx(uids::MODALITY_PERFORMED_PROCEDURE_STEP),
        create,
        &mut responder,
    )
    .unwrap();
    assert_eq!(responses[0].command.command_field, CommandField::NCreateRsp);
    assert_eq!(responses[0].command.status, Some(status::SUCCESS));

    let item = env
        .index
        .find_worklist_item("SPS001", "ACC001")
        .unwrap()
        .unwrap();
    assert_eq!(item.step_status, "STARTED");

    // N-SET completes the step and the worklist item
    let mut attributes = DataSet::new();
    attributes.put_str(tags::PERFORMED_PROCEDURE_STEP_STATUS, "COMPLETED");
    attributes.put_str(tags::PERFORMED_PROCEDURE_STEP_END_DATE, "20240115");
    attributes.put_str(tags::PERFORMED_PROCEDURE_STEP_END_TIME, "103000");

    let set = DimseMessage {
        context_id: 1,
        command: CommandSet::n_set_rq(2, uids::MODALITY_PERFORMED_PROCEDURE_STEP, "1.2.3.77"),
        dataset: Some(attributes.encode(uids::IMPLICIT_VR_LE).unwrap()),
    };
    let mut responses = Vec::new();
    let mut responder = |m: DimseMessage| {
        responses.push(m);
        Ok(())
    };
    scp.handle(
        &ctx(uids::MODALITY_PERFORMED_PROCEDURE_STEP),
        set,
        &mut responder,
    )
    .unwrap();
    assert_eq!(responses[0].command.status, Some(status::SUCCESS));

    let item = env
        .index
        .find_worklist_item("SPS001", "ACC001")
        .unwrap()
        .unwrap();
    assert_eq!(item.step_status, "COMPLETED");

    // a final MPPS rejects further N-SETs
    let mut attributes = DataSet::new();
    attributes.put_str(tags::PERFORMED_PROCEDURE_STEP_STATUS, "DISCONTINUED");
    let set_again = DimseMessage {
        context_id: 1,
        command: CommandSet::n_set_rq(3, uids::MODALITY_PERFORMED_PROCEDURE_STEP, "1.2.3.77"),
        dataset: Some(attributes.encode(uids::IMPLICIT_VR_LE).unwrap()),
    };
    let mut responses = Vec::new();
    let mut responder = |m: DimseMessage| {
        responses.push(m);
        Ok(())
    };
    scp.handle(
        &ctx(uids::MODALITY_PERFORMED_PROCEDURE_STEP),
        set_again,
        &mut responder,
    )
    .unwrap();
    assert_eq!(
        responses[0].command.status,
        Some(status::ERROR_UNABLE_TO_PROCESS)
    );
}

#[test]
fn worklist_find_returns_scheduled_items() {
    let env = env();
    env.index
        .add_worklist_item(&WorklistItem {
            step_id: "SPS001".into(),
            accession_no: "ACC001".into(),
            patient_id: "DOE01".into(),
            patient_name: "Doe^John".into(),
            modality: "CT".into(),
            station_ae: "CT01".into(),
            scheduled_datetime: "20240115090000".into(),
            ..Default::default()
        })
        .unwrap();
    env.index
        .add_worklist_item(&WorklistItem {
            step_id: "SPS002".into(),
            accession_no: "ACC002".into(),
            patient_id: "DOE02".into(),
            modality: "MR".into(),
            scheduled_datetime: "20240116090000".into(),
            ..Default::default()
        })
        .unwrap();

    let scp = WorklistScp::new(Arc::clone(&env.index), Arc::clone(&env.cancels));

    let mut identifier = DataSet::new();
    identifier.put_str(tags::MODALITY, "CT");
    let message = DimseMessage {
        context_id: 1,
        command: CommandSet::find_rq(4, uids::MODALITY_WORKLIST_FIND, Priority::Medium),
        dataset: Some(identifier.encode(uids::IMPLICIT_VR_LE).unwrap()),
    };

    let mut responses = Vec::new();
    let mut responder = |m: DimseMessage| {
        responses.push(m);
        Ok(())
    };
    use pacs_services::DimseService;
    scp.handle(&ctx(uids::MODALITY_WORKLIST_FIND), message, &mut responder)
        .unwrap();

    assert_eq!(responses.len(), 2);
    let identifier = DataSet::read(
        responses[0].dataset.as_ref().unwrap(),
        uids::IMPLICIT_VR_LE,
    )
    .unwrap();
    assert_eq!(identifier.get_str(tags::PATIENT_ID).as_deref(), Some("DOE01"));
    assert_eq!(
        identifier.get_str(tags::SCHEDULED_PROCEDURE_STEP_ID).as_deref(),
        Some("SPS001")
    );
    assert_eq!(
        identifier
            .get_str(tags::SCHEDULED_PROCEDURE_STEP_START_DATE)
            .as_deref(),
        Some("20240115")
    );
    assert_eq!(responses[1].command.status, Some(status::SUCCESS));
}

#[test]
fn move_to_unknown_destination_is_refused() {
    let env = env();
    store_instance(&env, "DOE01", "1.2.3.1", "1.2.3.1.1", "1.2.3.1.1.1");

    let scp = pacs_services::MoveScp::new(
        Arc::clone(&env.index),
        env.blobs.clone(),
        Arc::clone(&env.cancels),
        "TEST-SCP",
        // no known destinations
        std::iter::empty(),
    );

    let mut identifier = DataSet::new();
    identifier.put_str(tags::QUERY_RETRIEVE_LEVEL, "STUDY");
    identifier.put_str(tags::STUDY_INSTANCE_UID, "1.2.3.1");
    let message = DimseMessage {
        context_id: 1,
        command: CommandSet::move_rq(6, uids::STUDY_ROOT_QR_MOVE, "NOWHERE", Priority::Medium),
        dataset: Some(identifier.encode(uids::IMPLICIT_VR_LE).unwrap()),
    };

    let mut responses = Vec::new();
    let mut responder = |m: DimseMessage| {
        responses.push(m);
        Ok(())
    };
    use pacs_services::DimseService;
    scp.handle(&ctx(uids::STUDY_ROOT_QR_MOVE), message, &mut responder)
        .unwrap();

    assert_eq!(responses.len(), 1);
    assert_eq!(
        responses[0].command.status,
        Some(status::REFUSED_MOVE_DESTINATION_UNKNOWN)
    );
}
