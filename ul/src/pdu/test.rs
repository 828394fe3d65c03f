use crate::pdu::reader::{pdu_length, read_pdu, DecodeError};
use crate::pdu::writer::write_pdu;
use crate::pdu::*;
use matches::matches;
use rstest::rstest;

fn encode(pdu: &Pdu) -> Vec<u8> {
    let mut bytes = vec![0u8; 0];
    write_pdu(&mut bytes, pdu).unwrap();
    bytes
}

#[test]
fn can_read_write_associate_rq() {
    let association_rq = Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "calling ae".to_string(),
        called_ae_title: "called ae".to_string(),
        application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
        presentation_contexts: vec![
            PresentationContextProposed {
                id: 1,
                abstract_syntax: "abstract 1".to_string(),
                transfer_syntaxes: vec!["transfer 1".to_string(), "transfer 2".to_string()],
            },
            PresentationContextProposed {
                id: 3,
                abstract_syntax: "abstract 2".to_string(),
                transfer_syntaxes: vec!["transfer 3".to_string(), "transfer 4".to_string()],
            },
        ],
        user_variables: vec![
            UserVariableItem::ImplementationClassUID("class uid".to_string()),
            UserVariableItem::ImplementationVersionName("version name".to_string()),
            UserVariableItem::MaxLength(23),
            UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid: "abstract 1".to_string(),
                scu_role: true,
                scp_role: false,
            }),
        ],
    });

    let bytes = encode(&association_rq);
    let result = read_pdu(&bytes, DEFAULT_MAX_PDU, true).unwrap();

    assert_eq!(result, association_rq);
}

#[test]
fn can_read_write_associate_ac() {
    let association_ac = Pdu::AssociationAC(AssociationAC {
        protocol_version: 1,
        called_ae_title: "called ae".to_string(),
        calling_ae_title: "calling ae".to_string(),
        application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
        presentation_contexts: vec![
            PresentationContextResult {
                id: 1,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
            PresentationContextResult {
                id: 3,
                reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
        ],
        user_variables: vec![UserVariableItem::MaxLength(16384)],
    });

    let bytes = encode(&association_ac);
    let result = read_pdu(&bytes, DEFAULT_MAX_PDU, true).unwrap();

    assert_eq!(result, association_ac);
}

#[test]
fn can_read_write_associate_rj() {
    let association_rj = Pdu::AssociationRJ(AssociationRJ {
        result: AssociationRJResult::Permanent,
        source: AssociationRJSource::ServiceUser(
            AssociationRJServiceUserReason::CalledAETitleNotRecognized,
        ),
    });

    let bytes = encode(&association_rj);
    // fixed 10 byte PDU
    assert_eq!(bytes.len(), 10);
    assert_eq!(&bytes[6..], &[0x00, 0x01, 0x01, 0x07]);

    let result = read_pdu(&bytes, DEFAULT_MAX_PDU, true).unwrap();
    assert_eq!(result, association_rj);
}

#[test]
fn can_read_write_pdata() {
    let pdata = Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id: 3,
            value_type: PDataValueType::Command,
            is_last: true,
            data: vec![0, 1, 2, 3],
        }],
    };

    let bytes = encode(&pdata);
    let result = read_pdu(&bytes, DEFAULT_MAX_PDU, true).unwrap();

    assert_eq!(result, pdata);
}

#[test]
fn can_read_pdata_with_empty_value() {
    // a PDV with no payload is legal: 2 bytes of context id + control header
    let pdata = Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id: 5,
            value_type: PDataValueType::Data,
            is_last: false,
            data: vec![],
        }],
    };

    let bytes = encode(&pdata);
    // header + item length + context id + control header
    assert_eq!(bytes.len(), 6 + 4 + 2);

    let result = read_pdu(&bytes, DEFAULT_MAX_PDU, true).unwrap();
    assert_eq!(result, pdata);
}

#[rstest]
#[case(Pdu::ReleaseRQ)]
#[case(Pdu::ReleaseRP)]
#[case(Pdu::AbortRQ {
    source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu),
})]
#[case(Pdu::AbortRQ { source: AbortRQSource::ServiceUser })]
fn can_read_write_release_and_abort(#[case] pdu: Pdu) {
    let bytes = encode(&pdu);
    assert_eq!(bytes.len(), 10);
    let result = read_pdu(&bytes, DEFAULT_MAX_PDU, true).unwrap();
    assert_eq!(result, pdu);
}

#[test]
fn ae_titles_are_space_padded_and_trimmed() {
    let association_rq = Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "SCU".to_string(),
        called_ae_title: "EXACTLY-16-CHARS".to_string(),
        application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.1.1".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }],
        user_variables: vec![],
    });

    let bytes = encode(&association_rq);
    // called AE title occupies bytes 10..26 of the PDU
    assert_eq!(&bytes[10..26], b"EXACTLY-16-CHARS");
    assert_eq!(&bytes[26..32], b"SCU   ");

    match read_pdu(&bytes, DEFAULT_MAX_PDU, true).unwrap() {
        Pdu::AssociationRQ(AssociationRQ {
            calling_ae_title,
            called_ae_title,
            ..
        }) => {
            assert_eq!(calling_ae_title, "SCU");
            assert_eq!(called_ae_title, "EXACTLY-16-CHARS");
        }
        pdu => panic!("unexpected pdu {:?}", pdu),
    }
}

#[test]
fn over_long_ae_titles_are_truncated() {
    let association_rq = Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "A-VERY-LONG-CALLING-AE-TITLE".to_string(),
        called_ae_title: "SCP".to_string(),
        application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
        presentation_contexts: vec![],
        user_variables: vec![],
    });

    let bytes = encode(&association_rq);
    match read_pdu(&bytes, DEFAULT_MAX_PDU, true).unwrap() {
        Pdu::AssociationRQ(AssociationRQ {
            calling_ae_title, ..
        }) => assert_eq!(calling_ae_title, "A-VERY-LONG-CALL"),
        pdu => panic!("unexpected pdu {:?}", pdu),
    }
}

#[test]
fn pdu_length_frames_the_stream() {
    let pdu = Pdu::ReleaseRQ;
    let bytes = encode(&pdu);

    assert_eq!(pdu_length(&bytes), Some(bytes.len()));
    // a partial buffer is not a frame yet
    assert_eq!(pdu_length(&bytes[..5]), None);
    assert_eq!(pdu_length(&bytes[..8]), None);

    // trailing bytes of the next PDU do not change the frame size
    let mut two = bytes.clone();
    two.extend_from_slice(&bytes);
    assert_eq!(pdu_length(&two), Some(bytes.len()));

    // whatever pdu_length frames must decode
    let n = pdu_length(&two).unwrap();
    assert!(read_pdu(&two[..n], DEFAULT_MAX_PDU, true).is_ok());
}

#[test]
fn incomplete_input_is_classified_as_recoverable() {
    let bytes = encode(&Pdu::AbortRQ {
        source: AbortRQSource::ServiceUser,
    });

    let err = read_pdu(&bytes[..3], DEFAULT_MAX_PDU, true).unwrap_err();
    assert!(matches!(err, DecodeError::IncompleteHeader { .. }));
    assert!(err.is_incomplete());

    let err = read_pdu(&bytes[..8], DEFAULT_MAX_PDU, true).unwrap_err();
    assert!(matches!(err, DecodeError::IncompletePdu { .. }));
    assert!(err.is_incomplete());
}

#[test]
fn unrecognized_pdu_type_is_rejected() {
    let bytes = [0xAA, 0x00, 0x00, 0x00, 0x00, 0x04, 0, 0, 0, 0];
    let err = read_pdu(&bytes, DEFAULT_MAX_PDU, true).unwrap_err();
    assert!(matches!(err, DecodeError::InvalidPduType { pdu_type: 0xAA, .. }));
    assert!(!err.is_incomplete());
}

#[test]
fn protocol_version_without_bit_0_is_rejected() {
    let valid = encode(&Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "SCU".to_string(),
        called_ae_title: "SCP".to_string(),
        application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
        presentation_contexts: vec![],
        user_variables: vec![],
    }));

    let mut bytes = valid;
    // protocol version lives right after the 6 byte header
    bytes[6] = 0x00;
    bytes[7] = 0x02;

    let err = read_pdu(&bytes, DEFAULT_MAX_PDU, true).unwrap_err();
    assert!(matches!(
        err,
        DecodeError::InvalidProtocolVersion { version: 2, .. }
    ));
}

#[test]
fn nested_item_overflow_is_rejected() {
    let valid = encode(&Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "SCU".to_string(),
        called_ae_title: "SCP".to_string(),
        application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
        presentation_contexts: vec![],
        user_variables: vec![],
    }));

    let mut bytes = valid;
    // the application context item header sits at offset 74;
    // inflate its declared length past the end of the PDU body
    assert_eq!(bytes[74], 0x10);
    bytes[76] = 0xFF;
    bytes[77] = 0xFF;

    let err = read_pdu(&bytes, DEFAULT_MAX_PDU, true).unwrap_err();
    assert!(matches!(err, DecodeError::BufferOverflow { .. }));
}

#[test]
fn strict_mode_rejects_oversized_pdus() {
    let pdata = Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Data,
            is_last: true,
            data: vec![0u8; MINIMUM_PDU_SIZE as usize],
        }],
    };
    let bytes = encode(&pdata);

    let err = read_pdu(&bytes, MINIMUM_PDU_SIZE, true).unwrap_err();
    assert!(matches!(err, DecodeError::PduTooLarge { .. }));

    // lenient mode logs and accepts up to the hard ceiling
    assert!(read_pdu(&bytes, MINIMUM_PDU_SIZE, false).is_ok());
}

#[test]
fn unknown_user_sub_items_are_skipped() {
    let association_rq = Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "SCU".to_string(),
        called_ae_title: "SCP".to_string(),
        application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
        presentation_contexts: vec![],
        user_variables: vec![UserVariableItem::MaxLength(23)],
    });

    // splice an unrecognized sub-item behind the maximum length sub-item,
    // patching the user information item and PDU lengths by hand
    let mut bytes = encode(&association_rq);
    bytes.extend_from_slice(&[0x77, 0x00, 0x00, 0x02, 0xAB, 0xCD]);

    let user_info = 74 + 4 + APPLICATION_CONTEXT_NAME.len();
    assert_eq!(bytes[user_info], 0x50);
    let item_length =
        u16::from_be_bytes([bytes[user_info + 2], bytes[user_info + 3]]) + 6;
    bytes[user_info + 2..user_info + 4].copy_from_slice(&item_length.to_be_bytes());
    let pdu_length = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]) + 6;
    bytes[2..6].copy_from_slice(&pdu_length.to_be_bytes());

    // the unrecognized sub-item is dropped, everything else survives
    let result = read_pdu(&bytes, DEFAULT_MAX_PDU, true).unwrap();
    assert_eq!(result, association_rq);
}

#[test]
fn uid_trailing_nuls_are_trimmed() {
    let association_rq = Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "SCU".to_string(),
        called_ae_title: "SCP".to_string(),
        application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.1.1\0".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2\0".to_string()],
        }],
        user_variables: vec![],
    });

    let bytes = encode(&association_rq);
    match read_pdu(&bytes, DEFAULT_MAX_PDU, true).unwrap() {
        Pdu::AssociationRQ(AssociationRQ {
            presentation_contexts,
            ..
        }) => {
            assert_eq!(presentation_contexts[0].abstract_syntax, "1.2.840.10008.1.1");
            assert_eq!(
                presentation_contexts[0].transfer_syntaxes[0],
                "1.2.840.10008.1.2"
            );
        }
        pdu => panic!("unexpected pdu {:?}", pdu),
    }
}
