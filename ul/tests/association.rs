//! Loopback tests for association negotiation and traffic.

use std::net::{SocketAddr, TcpListener};
use std::thread;

use matches::matches;
use pacs_ul::association::client::ClientAssociationOptions;
use pacs_ul::association::server::ServerAssociationOptions;
use pacs_ul::association::Error;
use pacs_ul::pdu::{
    AssociationRJServiceUserReason, AssociationRJSource, PDataValueType, Pdu,
};

static SCP_AE_TITLE: &str = "STORE-SCP";
static SCU_AE_TITLE: &str = "STORE-SCU";

static VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";
static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

fn spawn_scp() -> (thread::JoinHandle<Result<(), Error>>, SocketAddr) {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new()
        .accept_called_ae_title()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .with_transfer_syntax(IMPLICIT_VR_LE);

    let handle = thread::spawn(move || {
        let (stream, _addr) = listener.accept().unwrap();
        let mut association = scp.establish(stream)?;

        assert_eq!(association.client_ae_title(), SCU_AE_TITLE);
        assert!(association
            .presentation_contexts()
            .iter()
            .any(|pc| pc.abstract_syntax == VERIFICATION_SOP_CLASS));

        // echo reassembled command payloads until the release arrives
        let mut command_buffer = Vec::new();
        loop {
            match association.receive()? {
                Pdu::PData { data } => {
                    for value in data {
                        assert_eq!(value.value_type, PDataValueType::Command);
                        let context_id = value.presentation_context_id;
                        command_buffer.extend(value.data);
                        if value.is_last {
                            association
                                .send_command(context_id, std::mem::take(&mut command_buffer))?;
                        }
                    }
                }
                Pdu::ReleaseRQ => {
                    association.send(&Pdu::ReleaseRP)?;
                    break;
                }
                pdu => panic!("unexpected pdu {:?}", pdu),
            }
        }
        Ok(())
    });

    (handle, addr)
}

#[test]
fn associate_and_release() {
    let (scp_handle, scp_addr) = spawn_scp();

    let mut association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .with_transfer_syntax(IMPLICIT_VR_LE)
        .establish(scp_addr)
        .unwrap();

    let context = association
        .accepted_context_for(VERIFICATION_SOP_CLASS)
        .expect("verification context should be accepted")
        .clone();
    assert_eq!(context.transfer_syntax, IMPLICIT_VR_LE);
    assert_eq!(context.id % 2, 1);

    // send a small command payload, expect it echoed back
    let payload = vec![0x08u8, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00];
    association.send_command(context.id, payload.clone()).unwrap();

    match association.receive().unwrap() {
        Pdu::PData { data } => {
            assert_eq!(data[0].presentation_context_id, context.id);
            assert_eq!(data[0].data, payload);
        }
        pdu => panic!("unexpected pdu {:?}", pdu),
    }

    association.release().unwrap();

    scp_handle
        .join()
        .expect("SCP panicked")
        .expect("SCP errored");
}

#[test]
fn reject_on_unknown_called_ae_title() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new()
        .accept_called_ae_title()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS);

    let scp_handle = thread::spawn(move || {
        let (stream, _addr) = listener.accept().unwrap();
        scp.establish(stream)
    });

    let err = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title("UNKNOWN")
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .establish(addr)
        .expect_err("association should have been rejected");

    match err {
        Error::Rejected { association_rj, .. } => {
            assert_eq!(
                association_rj.source,
                AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::CalledAETitleNotRecognized
                )
            );
        }
        err => panic!("unexpected error {:?}", err),
    }

    // the SCP side reports the rejection as well
    let result = scp_handle.join().expect("SCP panicked");
    assert!(matches!(result, Err(Error::Rejected { .. })));
}

#[test]
fn no_accepted_contexts_fails_the_association() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax("1.2.840.10008.5.1.4.1.1.2");

    let scp_handle = thread::spawn(move || {
        let (stream, _addr) = listener.accept().unwrap();
        // negotiation itself succeeds, but with zero accepted contexts
        scp.establish(stream)
    });

    let err = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .establish(addr)
        .expect_err("association should not be usable");

    assert!(matches!(err, Error::NoAcceptedPresentationContexts { .. }));

    let _ = scp_handle.join().expect("SCP panicked");
}

#[test]
fn large_payloads_are_fragmented_on_the_wire() {
    let (scp_handle, scp_addr) = spawn_scp();

    let mut association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .with_transfer_syntax(IMPLICIT_VR_LE)
        .establish(scp_addr)
        .unwrap();

    let context_id = association
        .accepted_context_for(VERIFICATION_SOP_CLASS)
        .unwrap()
        .id;

    // larger than the default max PDU length, so it must be split;
    // the SCP reassembles it and echoes the whole payload back
    let payload: Vec<u8> = (0..40_000u32).map(|x| x as u8).collect();
    association
        .send_command(context_id, payload.clone())
        .unwrap();

    let mut echoed = Vec::new();
    loop {
        match association.receive().unwrap() {
            Pdu::PData { data } => {
                for value in data {
                    let done = value.is_last;
                    echoed.extend(value.data);
                    if done {
                        assert_eq!(echoed, payload);
                        association.release().unwrap();
                        scp_handle
                            .join()
                            .expect("SCP panicked")
                            .expect("SCP errored");
                        return;
                    }
                }
            }
            pdu => panic!("unexpected pdu {:?}", pdu),
        }
    }
}
