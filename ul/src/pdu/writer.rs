//! PDU writer module
//!
//! Pure encoding of protocol data units into byte buffers.
//! The encoder builds nested type-length-value items
//! by writing each item body into a scratch buffer first,
//! so no encoding pass allocates more than twice the final size.
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, WriteBytesExt};
use snafu::{Backtrace, ResultExt, Snafu};
use std::io::Write;

/// An error encoding a PDU.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum EncodeError {
    #[snafu(display("could not write PDU field `{}`", field))]
    WriteField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("could not write {} reserved bytes", bytes))]
    WriteReserved {
        bytes: u32,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("field `{}` is not valid ASCII", field))]
    EncodeField {
        field: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("failed to write chunk `{}`", name))]
    WriteChunk {
        name: &'static str,
        #[snafu(source(from(WriteChunkError, Box::new)))]
        source: Box<WriteChunkError>,
    },
}

pub type Result<T> = std::result::Result<T, EncodeError>;

#[derive(Debug, Snafu)]
pub enum WriteChunkError {
    #[snafu(display("failed to build chunk"))]
    BuildChunk {
        #[snafu(source(from(EncodeError, Box::new)))]
        source: Box<EncodeError>,
    },
    #[snafu(display("failed to write chunk length"))]
    WriteLength {
        backtrace: Backtrace,
        source: std::io::Error,
    },
    #[snafu(display("failed to write chunk data"))]
    WriteData {
        backtrace: Backtrace,
        source: std::io::Error,
    },
}

fn write_chunk_u32<F>(writer: &mut dyn Write, func: F) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data).context(BuildChunkSnafu)?;

    let length = data.len() as u32;
    writer
        .write_u32::<BigEndian>(length)
        .context(WriteLengthSnafu)?;
    writer.write_all(&data).context(WriteDataSnafu)?;

    Ok(())
}

fn write_chunk_u16<F>(writer: &mut dyn Write, func: F) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data).context(BuildChunkSnafu)?;

    let length = data.len() as u16;
    writer
        .write_u16::<BigEndian>(length)
        .context(WriteLengthSnafu)?;
    writer.write_all(&data).context(WriteDataSnafu)?;

    Ok(())
}

/// Encode ASCII text, rejecting non-ASCII input.
fn encode_text(value: &str, field: &'static str) -> Result<Vec<u8>> {
    snafu::ensure!(value.is_ascii(), EncodeFieldSnafu { field });
    Ok(value.as_bytes().to_vec())
}

/// Encode an AE title into exactly 16 bytes,
/// space-padded, truncated when over-long.
fn write_ae_title(writer: &mut dyn Write, value: &str, field: &'static str) -> Result<()> {
    let mut ae_title_bytes = encode_text(value, field)?;
    ae_title_bytes.resize(16, b' ');
    writer.write_all(&ae_title_bytes).context(WriteFieldSnafu { field })
}

/// Encode a single PDU into the given writer.
///
/// The first six bytes written are the PDU header;
/// the declared length is always consistent with the body.
pub fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: Write,
{
    match pdu {
        Pdu::AssociationRQ(AssociationRQ {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => {
            // 1 - PDU-type - 01H, 2 - reserved
            writer
                .write_u8(0x01)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                // 7-8 - Protocol-version: version 1, bit 0 set
                writer
                    .write_u16::<BigEndian>(*protocol_version)
                    .context(WriteFieldSnafu {
                        field: "Protocol-version",
                    })?;

                // 9-10 - Reserved
                writer
                    .write_u16::<BigEndian>(0x00)
                    .context(WriteReservedSnafu { bytes: 2_u32 })?;

                // 11-26 - Called-AE-title, 27-42 - Calling-AE-title:
                // 16 characters each, space padded
                write_ae_title(writer, called_ae_title, "Called-AE-title")?;
                write_ae_title(writer, calling_ae_title, "Calling-AE-title")?;

                // 43-74 - Reserved
                writer
                    .write_all(&[0; 32])
                    .context(WriteReservedSnafu { bytes: 32_u32 })?;

                write_pdu_variable_application_context_name(writer, application_context_name)?;

                for presentation_context in presentation_contexts {
                    write_pdu_variable_presentation_context_proposed(
                        writer,
                        presentation_context,
                    )?;
                }

                write_pdu_variable_user_variables(writer, user_variables)?;

                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-RQ",
            })?;

            Ok(())
        }
        Pdu::AssociationAC(AssociationAC {
            protocol_version,
            application_context_name,
            called_ae_title,
            calling_ae_title,
            presentation_contexts,
            user_variables,
        }) => {
            // 1 - PDU-type - 02H, 2 - reserved
            writer
                .write_u8(0x02)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                writer
                    .write_u16::<BigEndian>(*protocol_version)
                    .context(WriteFieldSnafu {
                        field: "Protocol-version",
                    })?;

                writer
                    .write_u16::<BigEndian>(0x00)
                    .context(WriteReservedSnafu { bytes: 2_u32 })?;

                // 11-42 - the AE title fields are sent back
                // with the values received in the A-ASSOCIATE-RQ
                write_ae_title(writer, called_ae_title, "Called-AE-title")?;
                write_ae_title(writer, calling_ae_title, "Calling-AE-title")?;

                writer
                    .write_all(&[0; 32])
                    .context(WriteReservedSnafu { bytes: 32_u32 })?;

                write_pdu_variable_application_context_name(writer, application_context_name)?;

                for presentation_context in presentation_contexts {
                    write_pdu_variable_presentation_context_result(writer, presentation_context)?;
                }

                write_pdu_variable_user_variables(writer, user_variables)?;

                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-AC",
            })
        }
        Pdu::AssociationRJ(AssociationRJ { result, source }) => {
            // 1 - PDU-type - 03H, 2 - reserved
            writer
                .write_u8(0x03)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                // 7 - reserved, 8 - result, 9 - source, 10 - reason/diag
                writer.push(0x00);
                writer.push(match result {
                    AssociationRJResult::Permanent => 0x01,
                    AssociationRJResult::Transient => 0x02,
                });
                let (source_byte, reason_byte) = match source {
                    AssociationRJSource::ServiceUser(reason) => (
                        0x01,
                        match reason {
                            AssociationRJServiceUserReason::NoReasonGiven => 0x01,
                            AssociationRJServiceUserReason::ApplicationContextNameNotSupported => {
                                0x02
                            }
                            AssociationRJServiceUserReason::CallingAETitleNotRecognized => 0x03,
                            AssociationRJServiceUserReason::CalledAETitleNotRecognized => 0x07,
                            AssociationRJServiceUserReason::Reserved(data) => *data,
                        },
                    ),
                    AssociationRJSource::ServiceProviderAsce(reason) => (
                        0x02,
                        match reason {
                            AssociationRJServiceProviderAsceReason::NoReasonGiven => 0x01,
                            AssociationRJServiceProviderAsceReason::ProtocolVersionNotSupported => {
                                0x02
                            }
                        },
                    ),
                    AssociationRJSource::ServiceProviderPresentation(reason) => (
                        0x03,
                        match reason {
                            AssociationRJServiceProviderPresentationReason::TemporaryCongestion => {
                                0x01
                            }
                            AssociationRJServiceProviderPresentationReason::LocalLimitExceeded => {
                                0x02
                            }
                            AssociationRJServiceProviderPresentationReason::Reserved(data) => *data,
                        },
                    ),
                };
                writer.push(source_byte);
                writer.push(reason_byte);

                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-RJ",
            })?;

            Ok(())
        }
        Pdu::PData { data } => {
            // 1 - PDU-type - 04H, 2 - reserved
            writer
                .write_u8(0x04)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                for presentation_data_value in data {
                    write_chunk_u32(writer, |writer| {
                        // 5 - Presentation-context-ID
                        writer.push(presentation_data_value.presentation_context_id);

                        // 6 - message control header:
                        // bit 0 command/data, bit 1 last/more
                        let mut message_header = 0x00;
                        if let PDataValueType::Command = presentation_data_value.value_type {
                            message_header |= 0x01;
                        }
                        if presentation_data_value.is_last {
                            message_header |= 0x02;
                        }
                        writer.push(message_header);

                        // message fragment
                        writer.extend(&presentation_data_value.data);

                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "Presentation-data-value item",
                    })?;
                }

                Ok(())
            })
            .context(WriteChunkSnafu { name: "P-DATA-TF" })
        }
        Pdu::ReleaseRQ => {
            writer
                .write_u8(0x05)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                writer.extend([0u8; 4]);
                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-RELEASE-RQ",
            })?;

            Ok(())
        }
        Pdu::ReleaseRP => {
            writer
                .write_u8(0x06)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                writer.extend([0u8; 4]);
                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-RELEASE-RP",
            })?;

            Ok(())
        }
        Pdu::AbortRQ { source } => {
            writer
                .write_u8(0x07)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, |writer| {
                // 7-8 reserved, 9 source, 10 reason/diag
                writer.push(0);
                writer.push(0);
                let source_word = match source {
                    AbortRQSource::ServiceUser => [0x00; 2],
                    AbortRQSource::Reserved => [0x01, 0x00],
                    AbortRQSource::ServiceProvider(reason) => match reason {
                        AbortRQServiceProviderReason::ReasonNotSpecified => [0x02, 0x00],
                        AbortRQServiceProviderReason::UnrecognizedPdu => [0x02, 0x01],
                        AbortRQServiceProviderReason::UnexpectedPdu => [0x02, 0x02],
                        AbortRQServiceProviderReason::Reserved => [0x02, 0x03],
                        AbortRQServiceProviderReason::UnrecognizedPduParameter => [0x02, 0x04],
                        AbortRQServiceProviderReason::UnexpectedPduParameter => [0x02, 0x05],
                        AbortRQServiceProviderReason::InvalidPduParameter => [0x02, 0x06],
                    },
                };
                writer.extend(source_word);

                Ok(())
            })
            .context(WriteChunkSnafu { name: "A-ABORT" })?;

            Ok(())
        }
    }
}

fn write_pdu_variable_application_context_name(
    writer: &mut dyn Write,
    application_context_name: &str,
) -> Result<()> {
    // 1 - Item-type - 10H, 2 - reserved
    writer
        .write_u8(0x10)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u16(writer, |writer| {
        writer
            .write_all(&encode_text(
                application_context_name,
                "Application-context-name",
            )?)
            .context(WriteFieldSnafu {
                field: "Application-context-name",
            })
    })
    .context(WriteChunkSnafu {
        name: "Application Context Item",
    })?;

    Ok(())
}

fn write_pdu_variable_presentation_context_proposed(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextProposed,
) -> Result<()> {
    // 1 - Item-type - 20H, 2 - reserved
    writer
        .write_u8(0x20)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u16(writer, |writer| {
        // 5 - Presentation-context-ID, 6-8 - reserved
        writer
            .write_u8(presentation_context.id)
            .context(WriteFieldSnafu {
                field: "Presentation-context-ID",
            })?;
        writer
            .write_all(&[0x00; 3])
            .context(WriteReservedSnafu { bytes: 3_u32 })?;

        // one abstract syntax sub-item (30H)
        writer
            .write_u8(0x30)
            .context(WriteFieldSnafu { field: "Item-type" })?;
        writer
            .write_u8(0x00)
            .context(WriteReservedSnafu { bytes: 1_u32 })?;

        write_chunk_u16(writer, |writer| {
            writer
                .write_all(&encode_text(
                    &presentation_context.abstract_syntax,
                    "Abstract-syntax-name",
                )?)
                .context(WriteFieldSnafu {
                    field: "Abstract-syntax-name",
                })
        })
        .context(WriteChunkSnafu {
            name: "Abstract Syntax Sub-Item",
        })?;

        // one or more transfer syntax sub-items (40H)
        for transfer_syntax in &presentation_context.transfer_syntaxes {
            writer
                .write_u8(0x40)
                .context(WriteFieldSnafu { field: "Item-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u16(writer, |writer| {
                writer
                    .write_all(&encode_text(transfer_syntax, "Transfer-syntax-name")?)
                    .context(WriteFieldSnafu {
                        field: "Transfer-syntax-name",
                    })
            })
            .context(WriteChunkSnafu {
                name: "Transfer Syntax Sub-Item",
            })?;
        }

        Ok(())
    })
    .context(WriteChunkSnafu {
        name: "Presentation Context Item",
    })?;

    Ok(())
}

fn write_pdu_variable_presentation_context_result(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextResult,
) -> Result<()> {
    // 1 - Item-type - 21H, 2 - reserved
    writer
        .write_u8(0x21)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u16(writer, |writer| {
        // 5 - Presentation-context-ID, 6 - reserved,
        // 7 - result/reason, 8 - reserved
        writer
            .write_u8(presentation_context.id)
            .context(WriteFieldSnafu {
                field: "Presentation-context-ID",
            })?;
        writer
            .write_u8(0x00)
            .context(WriteReservedSnafu { bytes: 1_u32 })?;
        writer
            .write_u8(presentation_context.reason as u8)
            .context(WriteFieldSnafu {
                field: "Result/Reason",
            })?;
        writer
            .write_u8(0x00)
            .context(WriteReservedSnafu { bytes: 1_u32 })?;

        // one transfer syntax sub-item (40H);
        // not significant unless the result is acceptance
        writer
            .write_u8(0x40)
            .context(WriteFieldSnafu { field: "Item-type" })?;
        writer
            .write_u8(0x00)
            .context(WriteReservedSnafu { bytes: 1_u32 })?;

        write_chunk_u16(writer, |writer| {
            writer
                .write_all(&encode_text(
                    &presentation_context.transfer_syntax,
                    "Transfer-syntax-name",
                )?)
                .context(WriteFieldSnafu {
                    field: "Transfer-syntax-name",
                })
        })
        .context(WriteChunkSnafu {
            name: "Transfer Syntax Sub-Item",
        })?;

        Ok(())
    })
    .context(WriteChunkSnafu {
        name: "Presentation Context Result Item",
    })
}

fn write_pdu_variable_user_variables(
    writer: &mut dyn Write,
    user_variables: &[UserVariableItem],
) -> Result<()> {
    if user_variables.is_empty() {
        return Ok(());
    }

    // 1 - Item-type - 50H, 2 - reserved
    writer
        .write_u8(0x50)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u16(writer, |writer| {
        for user_variable in user_variables {
            match user_variable {
                UserVariableItem::MaxLength(max_length) => {
                    writer
                        .write_u8(0x51)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;

                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_u32::<BigEndian>(*max_length)
                            .context(WriteFieldSnafu {
                                field: "Maximum-length-received",
                            })
                    })
                    .context(WriteChunkSnafu {
                        name: "Maximum-length-received",
                    })?;
                }
                UserVariableItem::ImplementationClassUID(implementation_class_uid) => {
                    writer
                        .write_u8(0x52)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;

                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_all(&encode_text(
                                implementation_class_uid,
                                "Implementation-class-uid",
                            )?)
                            .context(WriteFieldSnafu {
                                field: "Implementation-class-uid",
                            })
                    })
                    .context(WriteChunkSnafu {
                        name: "Implementation-class-uid",
                    })?;
                }
                UserVariableItem::ImplementationVersionName(implementation_version_name) => {
                    writer
                        .write_u8(0x55)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;

                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_all(&encode_text(
                                implementation_version_name,
                                "Implementation-version-name",
                            )?)
                            .context(WriteFieldSnafu {
                                field: "Implementation-version-name",
                            })
                    })
                    .context(WriteChunkSnafu {
                        name: "Implementation-version-name",
                    })?;
                }
                UserVariableItem::RoleSelection(role_selection) => {
                    writer
                        .write_u8(0x54)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;

                    write_chunk_u16(writer, |writer| {
                        write_chunk_u16(writer, |writer| {
                            writer
                                .write_all(&encode_text(
                                    &role_selection.sop_class_uid,
                                    "SOP-class-uid",
                                )?)
                                .context(WriteFieldSnafu {
                                    field: "SOP-class-uid",
                                })
                        })
                        .context(WriteChunkSnafu {
                            name: "SOP-class-uid",
                        })?;
                        writer.push(role_selection.scu_role as u8);
                        writer.push(role_selection.scp_role as u8);
                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "Role Selection Sub-Item",
                    })?;
                }
            }
        }

        Ok(())
    })
    .context(WriteChunkSnafu { name: "User-data" })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_write_chunks_with_preceding_u32_length() {
        let mut bytes = vec![0u8; 0];
        write_chunk_u32(&mut bytes, |writer| {
            writer
                .write_u8(0x02)
                .context(WriteFieldSnafu { field: "Field1" })?;
            write_chunk_u32(writer, |writer| {
                writer
                    .write_u8(0x03)
                    .context(WriteFieldSnafu { field: "Field2" })?;
                Ok(())
            })
            .context(WriteChunkSnafu { name: "Chunk2" })
        })
        .unwrap();

        assert_eq!(bytes.len(), 10);
        assert_eq!(bytes, &[0, 0, 0, 6, 2, 0, 0, 0, 1, 3]);
    }

    #[test]
    fn can_write_chunks_with_preceding_u16_length() {
        let mut bytes = vec![0u8; 0];
        write_chunk_u16(&mut bytes, |writer| {
            writer
                .write_u8(0x02)
                .context(WriteFieldSnafu { field: "Field1" })?;
            write_chunk_u16(writer, |writer| {
                writer
                    .write_u8(0x03)
                    .context(WriteFieldSnafu { field: "Field2" })?;
                Ok(())
            })
            .context(WriteChunkSnafu { name: "Chunk2" })
        })
        .unwrap();

        assert_eq!(bytes.len(), 6);
        assert_eq!(bytes, &[0, 4, 2, 0, 1, 3]);
    }

    #[test]
    fn write_abort_rq() {
        let mut out = vec![];

        // abort by request of the service user
        let pdu = Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        };
        write_pdu(&mut out, &pdu).unwrap();
        assert_eq!(
            &out,
            &[
                // code 7 + reserved byte
                0x07, 0x00, //
                // PDU length: 4 bytes
                0x00, 0x00, 0x00, 0x04, //
                // reserved 2 bytes + source: service user (0) + reason (0)
                0x00, 0x00, 0x00, 0x00,
            ]
        );
        out.clear();

        // abort by request of the service provider
        let pdu = Pdu::AbortRQ {
            source: AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::InvalidPduParameter,
            ),
        };
        write_pdu(&mut out, &pdu).unwrap();
        assert_eq!(
            &out,
            &[
                // code 7 + reserved byte
                0x07, 0x00, //
                // PDU length: 4 bytes
                0x00, 0x00, 0x00, 0x04, //
                // reserved 2 bytes
                0x00, 0x00, //
                // source: service provider (2), invalid parameter value (6)
                0x02, 0x06,
            ]
        );
    }
}
