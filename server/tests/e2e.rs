//! End-to-end scenarios over a real TCP loopback:
//! a full server (pipeline, services, index, blob store)
//! talked to by the client association driver.

use std::sync::Arc;
use std::time::Duration;

use matches::matches;
use tempfile::TempDir;

use pacs_dimse::command::{CommandField, Priority};
use pacs_dimse::dataset::DataSet;
use pacs_dimse::message::{DimseMessage, MessageAssembler};
use pacs_dimse::{status, tags, CommandSet};
use pacs_index::IndexDatabase;
use pacs_server::{PacsServer, ServerConfig, ServerHandle};
use pacs_ul::association::client::{ClientAssociation, ClientAssociationOptions};
use pacs_ul::association::pdata::fragment_pdata;
use pacs_ul::association::Error as AssociationError;
use pacs_ul::pdu::{
    AssociationRJResult, AssociationRJServiceUserReason, AssociationRJSource, PDataValue,
    PDataValueType, Pdu,
};
use pacs_ul::FullAeAddr;

const VERIFICATION: &str = "1.2.840.10008.1.1";
const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
const STUDY_ROOT_FIND: &str = "1.2.840.10008.5.1.4.1.2.2.1";
const STUDY_ROOT_MOVE: &str = "1.2.840.10008.5.1.4.1.2.2.2";
const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

struct TestServer {
    handle: ServerHandle,
    index: Arc<IndexDatabase>,
    _dir: TempDir,
}

fn start_server(ae_title: &str, remote_nodes: Vec<FullAeAddr>) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        ae_title: ae_title.to_string(),
        host: "127.0.0.1".to_string(),
        port: 0,
        db_path: dir.path().join("index.db").to_str().unwrap().to_string(),
        storage_dir: dir.path().join("blobs"),
        idle_timeout: Some(Duration::from_secs(10)),
        remote_nodes,
        ..Default::default()
    };

    let server = PacsServer::bind(config).unwrap();
    let index = Arc::clone(server.index());
    let handle = server.spawn().unwrap();
    TestServer {
        handle,
        index,
        _dir: dir,
    }
}

fn connect(server: &TestServer, abstract_syntax: &str) -> ClientAssociation {
    ClientAssociationOptions::new()
        .calling_ae_title("TEST-SCU")
        .called_ae_title("PACS-SCP")
        .with_abstract_syntax(abstract_syntax.to_string())
        .with_transfer_syntax(IMPLICIT_VR_LE)
        .read_timeout(Duration::from_secs(10))
        .establish(server.handle.addr())
        .unwrap()
}

/// Send one DIMSE message on the given presentation context.
fn send_message(
    association: &mut ClientAssociation,
    context_id: u8,
    command: CommandSet,
    dataset: Option<Vec<u8>>,
) {
    association
        .send_command(context_id, command.encode())
        .unwrap();
    if let Some(dataset) = dataset {
        for pdu in fragment_pdata(
            context_id,
            PDataValueType::Data,
            dataset,
            association.peer_max_pdu_length(),
        ) {
            association.send(&pdu).unwrap();
        }
    }
}

/// Receive one complete DIMSE message,
/// reassembling fragments as they come.
fn receive_message(association: &mut ClientAssociation) -> DimseMessage {
    let mut assembler = MessageAssembler::new();
    let mut command_buffer = Vec::new();
    let mut data_buffer = Vec::new();

    loop {
        match association.receive().unwrap() {
            Pdu::PData { data } => {
                for value in data {
                    match value.value_type {
                        PDataValueType::Command => {
                            command_buffer.extend(value.data);
                            if value.is_last {
                                if let Some(message) = assembler
                                    .push_command(
                                        value.presentation_context_id,
                                        &std::mem::take(&mut command_buffer),
                                    )
                                    .unwrap()
                                {
                                    return message;
                                }
                            }
                        }
                        PDataValueType::Data => {
                            data_buffer.extend(value.data);
                            if value.is_last {
                                if let Some(message) = assembler
                                    .push_data(
                                        value.presentation_context_id,
                                        std::mem::take(&mut data_buffer),
                                    )
                                    .unwrap()
                                {
                                    return message;
                                }
                            }
                        }
                    }
                }
            }
            pdu => panic!("unexpected {} while awaiting a message", pdu.short_description()),
        }
    }
}

/// An encoded CT data set, padded to at least `min_size` bytes.
fn ct_dataset(
    patient_id: &str,
    study_uid: &str,
    series_uid: &str,
    sop_uid: &str,
    min_size: usize,
) -> Vec<u8> {
    let mut ds = DataSet::new();
    ds.put_str(tags::SOP_CLASS_UID, CT_IMAGE_STORAGE);
    ds.put_str(tags::SOP_INSTANCE_UID, sop_uid);
    ds.put_str(tags::PATIENT_ID, patient_id);
    ds.put_str(tags::PATIENT_NAME, format!("{patient_id}^Test"));
    ds.put_str(tags::PATIENT_SEX, "O");
    ds.put_str(tags::STUDY_INSTANCE_UID, study_uid);
    ds.put_str(tags::STUDY_DATE, "20240115");
    ds.put_str(tags::STUDY_TIME, "101530");
    ds.put_str(tags::SERIES_INSTANCE_UID, series_uid);
    ds.put_str(tags::MODALITY, "CT");
    ds.put_str(tags::SERIES_NUMBER, "1");
    ds.put_str(tags::INSTANCE_NUMBER, "1");

    let mut encoded = ds.encode(IMPLICIT_VR_LE).unwrap();
    if encoded.len() < min_size {
        // top off with a comment attribute so the payload
        // reaches the requested size
        let padding = min_size - encoded.len();
        ds.put_str((0x0020, 0x4000), "X".repeat(padding));
        encoded = ds.encode(IMPLICIT_VR_LE).unwrap();
    }
    encoded
}

fn store_over_the_wire(server: &TestServer, patient_id: &str, suffix: u32) {
    let mut association = connect(server, CT_IMAGE_STORAGE);
    let context_id = association
        .accepted_context_for(CT_IMAGE_STORAGE)
        .unwrap()
        .id;

    let sop_uid = format!("1.9.{suffix}.1.1");
    let dataset = ct_dataset(
        patient_id,
        &format!("1.9.{suffix}"),
        &format!("1.9.{suffix}.1"),
        &sop_uid,
        0,
    );
    send_message(
        &mut association,
        context_id,
        CommandSet::store_rq(1, CT_IMAGE_STORAGE, &sop_uid, Priority::Medium),
        Some(dataset),
    );

    let response = receive_message(&mut association);
    assert_eq!(response.command.status, Some(status::SUCCESS));
    association.release().unwrap();
}

#[test]
fn c_echo_round_trip() {
    let server = start_server("PACS-SCP", vec![]);

    let mut association = connect(&server, VERIFICATION);
    let context_id = association.accepted_context_for(VERIFICATION).unwrap().id;

    send_message(
        &mut association,
        context_id,
        CommandSet::echo_rq(1, VERIFICATION),
        None,
    );

    let response = receive_message(&mut association);
    assert_eq!(response.command.command_field, CommandField::CEchoRsp);
    assert_eq!(response.command.status, Some(status::SUCCESS));
    assert_eq!(response.command.message_id_being_responded_to, Some(1));

    association.release().unwrap();
    server.handle.shutdown();
}

#[test]
fn c_store_indexes_and_persists_the_blob() {
    let server = start_server("PACS-SCP", vec![]);

    let mut association = connect(&server, CT_IMAGE_STORAGE);
    let context_id = association
        .accepted_context_for(CT_IMAGE_STORAGE)
        .unwrap()
        .id;

    let dataset = ct_dataset("DOE01", "1.2.3.1", "1.2.3.1.1", "1.2.3.1.1.1", 4096);
    assert!(dataset.len() >= 4096);

    send_message(
        &mut association,
        context_id,
        CommandSet::store_rq(7, CT_IMAGE_STORAGE, "1.2.3.1.1.1", Priority::Medium),
        Some(dataset.clone()),
    );

    let response = receive_message(&mut association);
    assert_eq!(response.command.command_field, CommandField::CStoreRsp);
    assert_eq!(response.command.status, Some(status::SUCCESS));
    assert_eq!(response.command.message_id_being_responded_to, Some(7));
    association.release().unwrap();

    // one new instance row
    let instance = server.index.find_instance("1.2.3.1.1.1").unwrap().unwrap();
    assert_eq!(instance.file_size as usize, dataset.len());

    // and the blob file exists at the computed path
    let blob = server._dir.path().join("blobs").join(&instance.file_path);
    assert!(blob.is_file());
    assert_eq!(std::fs::read(blob).unwrap().len(), dataset.len());

    server.handle.shutdown();
}

#[test]
fn c_find_streams_wildcard_matches() {
    let server = start_server("PACS-SCP", vec![]);
    store_over_the_wire(&server, "DOE01", 1);
    store_over_the_wire(&server, "DOE02", 2);
    store_over_the_wire(&server, "SMITH01", 3);

    let mut association = connect(&server, STUDY_ROOT_FIND);
    let context_id = association.accepted_context_for(STUDY_ROOT_FIND).unwrap().id;

    let mut identifier = DataSet::new();
    identifier.put_str(tags::QUERY_RETRIEVE_LEVEL, "STUDY");
    identifier.put_str(tags::PATIENT_ID, "DOE*");
    send_message(
        &mut association,
        context_id,
        CommandSet::find_rq(11, STUDY_ROOT_FIND, Priority::Medium),
        Some(identifier.encode(IMPLICIT_VR_LE).unwrap()),
    );

    let mut pending = Vec::new();
    loop {
        let response = receive_message(&mut association);
        assert_eq!(response.command.command_field, CommandField::CFindRsp);
        match response.command.status {
            Some(status::PENDING) => {
                let identifier =
                    DataSet::read(response.dataset.as_ref().unwrap(), IMPLICIT_VR_LE).unwrap();
                pending.push(identifier.get_str(tags::PATIENT_ID).unwrap());
            }
            Some(status::SUCCESS) => break,
            other => panic!("unexpected find status {:?}", other),
        }
    }

    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|id| id.starts_with("DOE")));

    association.release().unwrap();
    server.handle.shutdown();
}

#[test]
fn association_is_rejected_for_an_unknown_called_ae() {
    let server = start_server("PACS-SCP", vec![]);

    let error = ClientAssociationOptions::new()
        .calling_ae_title("TEST-SCU")
        .called_ae_title("UNKNOWN")
        .with_abstract_syntax(VERIFICATION)
        .establish(server.handle.addr())
        .expect_err("the association should be rejected");

    match error {
        AssociationError::Rejected { association_rj, .. } => {
            assert_eq!(association_rj.result, AssociationRJResult::Permanent);
            assert_eq!(
                association_rj.source,
                AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::CalledAETitleNotRecognized
                )
            );
        }
        other => panic!("unexpected error {:?}", other),
    }

    server.handle.shutdown();
}

#[test]
fn fragmented_command_pdvs_are_reassembled() {
    let server = start_server("PACS-SCP", vec![]);

    let mut association = connect(&server, VERIFICATION);
    let context_id = association.accepted_context_for(VERIFICATION).unwrap().id;

    // split the echo command into two PDVs by hand
    let command_bytes = CommandSet::echo_rq(3, VERIFICATION).encode();
    let (first, second) = command_bytes.split_at(command_bytes.len() / 2);

    association
        .send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: context_id,
                value_type: PDataValueType::Command,
                is_last: false,
                data: first.to_vec(),
            }],
        })
        .unwrap();
    association
        .send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: context_id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: second.to_vec(),
            }],
        })
        .unwrap();

    let response = receive_message(&mut association);
    assert_eq!(response.command.command_field, CommandField::CEchoRsp);
    assert_eq!(response.command.status, Some(status::SUCCESS));
    assert_eq!(response.command.message_id_being_responded_to, Some(3));

    association.release().unwrap();
    server.handle.shutdown();
}

#[test]
fn c_cancel_interrupts_a_long_find() {
    let server = start_server("PACS-SCP", vec![]);

    // seed many studies directly through the index,
    // so the matching loop runs long enough to observe the cancel
    for i in 0..500 {
        let patient_pk = server
            .index
            .upsert_patient(&pacs_index::PatientRecord::new(format!("DOE{i:04}")))
            .unwrap();
        let mut study = pacs_index::StudyRecord::new(format!("1.5.{i}"));
        study.patient_pk = patient_pk;
        study.study_date = "20240115".into();
        server.index.upsert_study(&study).unwrap();
    }

    let mut association = connect(&server, STUDY_ROOT_FIND);
    let context_id = association.accepted_context_for(STUDY_ROOT_FIND).unwrap().id;

    let mut identifier = DataSet::new();
    identifier.put_str(tags::QUERY_RETRIEVE_LEVEL, "STUDY");
    identifier.put_str(tags::PATIENT_ID, "DOE*");
    send_message(
        &mut association,
        context_id,
        CommandSet::find_rq(21, STUDY_ROOT_FIND, Priority::Medium),
        Some(identifier.encode(IMPLICIT_VR_LE).unwrap()),
    );

    // read a few pages, then cancel the rest
    let mut pending = 0;
    for _ in 0..10 {
        let response = receive_message(&mut association);
        assert_eq!(response.command.status, Some(status::PENDING));
        pending += 1;
    }
    association
        .send_command(context_id, CommandSet::cancel_rq(21).encode())
        .unwrap();

    let final_status = loop {
        let response = receive_message(&mut association);
        match response.command.status {
            Some(status::PENDING) => pending += 1,
            Some(final_status) => break final_status,
            None => panic!("response without a status"),
        }
    };

    assert_eq!(final_status, status::CANCEL);
    assert!(
        pending < 500,
        "the matching loop ran to completion despite the cancel"
    );

    association.abort().unwrap();
    server.handle.shutdown();
}

#[test]
fn c_move_sends_the_study_to_the_destination() {
    // destination PACS first, so its address is known
    let destination = start_server("PACS-B", vec![]);
    let destination_node: FullAeAddr =
        format!("PACS-B@{}", destination.handle.addr()).parse().unwrap();

    let source = start_server("PACS-SCP", vec![destination_node]);
    store_over_the_wire(&source, "DOE01", 42);
    assert_eq!(source.index.instance_count().unwrap(), 1);
    assert_eq!(destination.index.instance_count().unwrap(), 0);

    let mut association = connect(&source, STUDY_ROOT_MOVE);
    let context_id = association.accepted_context_for(STUDY_ROOT_MOVE).unwrap().id;

    let mut identifier = DataSet::new();
    identifier.put_str(tags::QUERY_RETRIEVE_LEVEL, "STUDY");
    identifier.put_str(tags::STUDY_INSTANCE_UID, "1.9.42");
    send_message(
        &mut association,
        context_id,
        CommandSet::move_rq(31, STUDY_ROOT_MOVE, "PACS-B", Priority::Medium),
        Some(identifier.encode(IMPLICIT_VR_LE).unwrap()),
    );

    let final_response = loop {
        let response = receive_message(&mut association);
        assert_eq!(response.command.command_field, CommandField::CMoveRsp);
        match response.command.status {
            Some(status::PENDING) => {}
            Some(_) => break response,
            None => panic!("move response without a status"),
        }
    };

    assert_eq!(final_response.command.status, Some(status::SUCCESS));
    assert_eq!(final_response.command.completed_sub_operations, Some(1));
    assert_eq!(final_response.command.failed_sub_operations, Some(0));
    assert_eq!(final_response.command.remaining_sub_operations, Some(0));

    // the destination indexed the transferred instance
    let moved = destination.index.find_instance("1.9.42.1.1").unwrap();
    assert!(matches!(moved, Some(_)));

    association.release().unwrap();
    source.handle.shutdown();
    destination.handle.shutdown();
}
