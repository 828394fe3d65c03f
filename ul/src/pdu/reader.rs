//! PDU reader module
//!
//! Pure decoding of protocol data units from byte spans.
//! Streaming callers use [`pdu_length`] to frame the TCP byte stream
//! and hand exactly one PDU's worth of bytes to [`read_pdu`].
use crate::pdu::*;
use snafu::{ensure, Backtrace, Snafu};
use tracing::warn;

/// An error decoding a PDU from a byte span.
///
/// The `IncompleteHeader` and `IncompletePdu` variants are recoverable:
/// the caller is expected to read more bytes and try again.
/// All other variants are protocol failures
/// which escalate to an A-ABORT.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum DecodeError {
    #[snafu(display("incomplete PDU header: got {} bytes of {}", got, PDU_HEADER_SIZE))]
    IncompleteHeader { got: usize, backtrace: Backtrace },

    #[snafu(display("incomplete PDU: declared {} bytes, got {}", needed, got))]
    IncompletePdu {
        needed: usize,
        got: usize,
        backtrace: Backtrace,
    },

    #[snafu(display("invalid PDU type {:#04X}", pdu_type))]
    InvalidPduType { pdu_type: u8, backtrace: Backtrace },

    #[snafu(display("invalid protocol version {:#06X}", version))]
    InvalidProtocolVersion { version: u16, backtrace: Backtrace },

    #[snafu(display("invalid item type {:#04X} in `{}`", item_type, field))]
    InvalidItemType {
        item_type: u8,
        field: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("malformed PDU field `{}`", field))]
    MalformedPdu {
        field: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("length of `{}` exceeds its enclosing item", field))]
    BufferOverflow {
        field: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "incoming PDU was too large: length {}, maximum is {}",
        pdu_length,
        max_pdu_length
    ))]
    PduTooLarge {
        pdu_length: u32,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },
}

impl DecodeError {
    /// Whether the failure only means that more bytes are required.
    pub fn is_incomplete(&self) -> bool {
        matches!(
            self,
            DecodeError::IncompleteHeader { .. } | DecodeError::IncompletePdu { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, DecodeError>;

/// Return the total size in bytes of the first PDU in `buf`,
/// if a complete one is present.
///
/// This inspects no more than the 6-byte header.
/// `None` means that more bytes must be read from the transport
/// before a PDU can be decoded.
pub fn pdu_length(buf: &[u8]) -> Option<usize> {
    if buf.len() < PDU_HEADER_SIZE as usize {
        return None;
    }
    let body_length = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;
    let total = PDU_HEADER_SIZE as usize + body_length;
    if buf.len() < total {
        return None;
    }
    Some(total)
}

/// A bounds-checked cursor over a PDU body span.
///
/// Any read past the end of the span is a `BufferOverflow`:
/// the enclosing length said there was more data than there is.
struct Span<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Span<'a> {
    fn new(data: &'a [u8]) -> Self {
        Span { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn read_u8(&mut self, field: &'static str) -> Result<u8> {
        ensure!(self.remaining() >= 1, BufferOverflowSnafu { field });
        let v = self.data[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn read_u16(&mut self, field: &'static str) -> Result<u16> {
        let b = self.read_bytes(2, field)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self, field: &'static str) -> Result<u32> {
        let b = self.read_bytes(4, field)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_bytes(&mut self, n: usize, field: &'static str) -> Result<&'a [u8]> {
        ensure!(self.remaining() >= n, BufferOverflowSnafu { field });
        let v = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(v)
    }

    fn skip(&mut self, n: usize, field: &'static str) -> Result<()> {
        ensure!(self.remaining() >= n, BufferOverflowSnafu { field });
        self.pos += n;
        Ok(())
    }
}

/// Decode ASCII text, rejecting non-ASCII bytes.
fn decode_text(bytes: &[u8], field: &'static str) -> Result<String> {
    ensure!(bytes.is_ascii(), MalformedPduSnafu { field });
    // safe: just checked for ASCII
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

/// Decode an AE title field: 16 bytes of ASCII,
/// leading and trailing spaces being non-significant.
fn decode_ae_title(span: &mut Span, field: &'static str) -> Result<String> {
    let bytes = span.read_bytes(16, field)?;
    Ok(decode_text(bytes, field)?.trim().to_string())
}

/// Decode a UID value, trimming trailing spaces and NULs.
fn decode_uid(bytes: &[u8], field: &'static str) -> Result<String> {
    Ok(decode_text(bytes, field)?
        .trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
        .to_string())
}

/// Decode a single PDU from the given byte span.
///
/// The span must contain the whole PDU
/// (check with [`pdu_length`] first when framing a stream);
/// otherwise `IncompleteHeader` or `IncompletePdu` is returned
/// so that the caller can wait for more bytes.
///
/// In strict mode, PDUs larger than `max_pdu_length` are refused;
/// otherwise only the hard protocol ceiling is enforced
/// and a warning is logged.
pub fn read_pdu(buf: &[u8], max_pdu_length: u32, strict: bool) -> Result<Pdu> {
    ensure!(
        buf.len() >= PDU_HEADER_SIZE as usize,
        IncompleteHeaderSnafu { got: buf.len() }
    );

    let pdu_type = buf[0];
    let pdu_length = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);

    if strict {
        ensure!(
            pdu_length <= max_pdu_length,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length
            }
        );
    } else if pdu_length > max_pdu_length {
        ensure!(
            pdu_length <= MAXIMUM_PDU_SIZE,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length: MAXIMUM_PDU_SIZE
            }
        );
        warn!(
            "incoming PDU was too large: length {}, maximum is {}",
            pdu_length, max_pdu_length
        );
    }

    let needed = PDU_HEADER_SIZE as usize + pdu_length as usize;
    ensure!(
        buf.len() >= needed,
        IncompletePduSnafu {
            needed,
            got: buf.len()
        }
    );

    let mut span = Span::new(&buf[PDU_HEADER_SIZE as usize..needed]);

    match pdu_type {
        0x01 => read_association_rq(&mut span),
        0x02 => read_association_ac(&mut span),
        0x03 => {
            // A-ASSOCIATE-RJ: reserved, result, source, reason/diag
            span.read_u8("Reserved")?;
            let result = AssociationRJResult::from_code(span.read_u8("Result")?);
            let source = span.read_u8("Source")?;
            let reason = span.read_u8("Reason/Diag.")?;
            let result = result.ok_or_else(|| MalformedPduSnafu { field: "Result" }.build())?;
            let source = AssociationRJSource::from_parts(source, reason)
                .ok_or_else(|| MalformedPduSnafu { field: "Source" }.build())?;
            Ok(Pdu::AssociationRJ(AssociationRJ { result, source }))
        }
        0x04 => read_p_data(&mut span),
        0x05 => {
            // A-RELEASE-RQ: 4 reserved bytes, not tested when received
            span.skip(4, "Reserved")?;
            Ok(Pdu::ReleaseRQ)
        }
        0x06 => {
            // A-RELEASE-RP: 4 reserved bytes, not tested when received
            span.skip(4, "Reserved")?;
            Ok(Pdu::ReleaseRP)
        }
        0x07 => {
            // A-ABORT: 2 reserved bytes, source, reason/diag
            span.skip(2, "Reserved")?;
            let source = span.read_u8("Source")?;
            let reason = span.read_u8("Reason/Diag.")?;
            let source = AbortRQSource::from_parts(source, reason)
                .ok_or_else(|| MalformedPduSnafu { field: "Source" }.build())?;
            Ok(Pdu::AbortRQ { source })
        }
        _ => InvalidPduTypeSnafu { pdu_type }.fail(),
    }
}

fn read_association_rq(span: &mut Span) -> Result<Pdu> {
    // 7-8 - Protocol-version - one bit per supported version of the
    // DICOM UL protocol. This is version 1, identified with bit 0 set.
    let protocol_version = span.read_u16("Protocol-version")?;
    ensure!(
        protocol_version & 0x0001 != 0,
        InvalidProtocolVersionSnafu {
            version: protocol_version
        }
    );

    // 9-10 - Reserved
    span.skip(2, "Reserved")?;

    // 11-26 - Called-AE-title, 27-42 - Calling-AE-title:
    // 16 characters each, leading and trailing spaces non-significant
    let called_ae_title = decode_ae_title(span, "Called-AE-title")?;
    let calling_ae_title = decode_ae_title(span, "Calling-AE-title")?;

    // 43-74 - Reserved
    span.skip(32, "Reserved")?;

    // 75-xxx - Variable items: one application context item,
    // one or more presentation context items and one user information item
    let mut application_context_name: Option<String> = None;
    let mut presentation_contexts = vec![];
    let mut user_variables = vec![];

    while span.remaining() > 0 {
        match read_pdu_variable(span)? {
            PduVariableItem::ApplicationContext(val) => {
                application_context_name = Some(val);
            }
            PduVariableItem::PresentationContextProposed(val) => {
                presentation_contexts.push(val);
            }
            PduVariableItem::UserVariables(val) => {
                user_variables = val;
            }
            PduVariableItem::PresentationContextResult(_) => {
                return MalformedPduSnafu {
                    field: "Presentation context AC item in A-ASSOCIATE-RQ",
                }
                .fail();
            }
            PduVariableItem::Unknown(item_type) => {
                warn!("unknown variable item type {:#04X} skipped", item_type);
            }
        }
    }

    Ok(Pdu::AssociationRQ(AssociationRQ {
        protocol_version,
        application_context_name: application_context_name.ok_or_else(|| {
            MalformedPduSnafu {
                field: "Application-context-name",
            }
            .build()
        })?,
        called_ae_title,
        calling_ae_title,
        presentation_contexts,
        user_variables,
    }))
}

fn read_association_ac(span: &mut Span) -> Result<Pdu> {
    let protocol_version = span.read_u16("Protocol-version")?;
    ensure!(
        protocol_version & 0x0001 != 0,
        InvalidProtocolVersionSnafu {
            version: protocol_version
        }
    );

    span.skip(2, "Reserved")?;

    // the AE title fields are reserved in the AC PDU,
    // sent back as received but not tested; keep them for diagnostics
    let called_ae_title = decode_ae_title(span, "Called-AE-title")?;
    let calling_ae_title = decode_ae_title(span, "Calling-AE-title")?;

    span.skip(32, "Reserved")?;

    let mut application_context_name: Option<String> = None;
    let mut presentation_contexts = vec![];
    let mut user_variables = vec![];

    while span.remaining() > 0 {
        match read_pdu_variable(span)? {
            PduVariableItem::ApplicationContext(val) => {
                application_context_name = Some(val);
            }
            PduVariableItem::PresentationContextResult(val) => {
                presentation_contexts.push(val);
            }
            PduVariableItem::UserVariables(val) => {
                user_variables = val;
            }
            PduVariableItem::PresentationContextProposed(_) => {
                return MalformedPduSnafu {
                    field: "Presentation context RQ item in A-ASSOCIATE-AC",
                }
                .fail();
            }
            PduVariableItem::Unknown(item_type) => {
                warn!("unknown variable item type {:#04X} skipped", item_type);
            }
        }
    }

    Ok(Pdu::AssociationAC(AssociationAC {
        protocol_version,
        application_context_name: application_context_name.ok_or_else(|| {
            MalformedPduSnafu {
                field: "Application-context-name",
            }
            .build()
        })?,
        called_ae_title,
        calling_ae_title,
        presentation_contexts,
        user_variables,
    }))
}

fn read_p_data(span: &mut Span) -> Result<Pdu> {
    let mut values = vec![];
    while span.remaining() > 0 {
        // 1-4 - Item-length: bytes from the first byte of the following
        // field to the last byte of the presentation data value
        let item_length = span.read_u32("Item-length")?;
        ensure!(
            item_length >= 2,
            MalformedPduSnafu {
                field: "Item-length"
            }
        );

        // 5 - Presentation-context-ID: odd integers between 1 and 255
        let presentation_context_id = span.read_u8("Presentation-context-ID")?;

        // 6 - Message control header: bit 0 command/data, bit 1 last/more
        let header = span.read_u8("Message Control Header")?;
        let value_type = if header & 0x01 > 0 {
            PDataValueType::Command
        } else {
            PDataValueType::Data
        };
        let is_last = (header & 0x02) > 0;

        let data = span
            .read_bytes(item_length as usize - 2, "Presentation-data-value")?
            .to_vec();

        values.push(PDataValue {
            presentation_context_id,
            value_type,
            is_last,
            data,
        });
    }

    Ok(Pdu::PData { data: values })
}

/// An intermediate representation of one variable item.
enum PduVariableItem {
    Unknown(u8),
    ApplicationContext(String),
    PresentationContextProposed(PresentationContextProposed),
    PresentationContextResult(PresentationContextResult),
    UserVariables(Vec<UserVariableItem>),
}

fn read_pdu_variable(span: &mut Span) -> Result<PduVariableItem> {
    // item header: type, reserved, u16 length
    let item_type = span.read_u8("Item-type")?;
    span.read_u8("Reserved")?;
    let item_length = span.read_u16("Item-length")?;
    let mut item = Span::new(span.read_bytes(item_length as usize, "Item value")?);

    match item_type {
        0x10 => {
            // Application Context Item
            let val = decode_uid(item.data, "Application-context-name")?;
            Ok(PduVariableItem::ApplicationContext(val))
        }
        0x20 => {
            // Presentation Context Item (proposed)
            let presentation_context_id = item.read_u8("Presentation-context-ID")?;
            item.skip(3, "Reserved")?;

            let mut abstract_syntax: Option<String> = None;
            let mut transfer_syntaxes = vec![];

            // sub-items: one abstract syntax, one or more transfer syntaxes
            while item.remaining() > 0 {
                let sub_type = item.read_u8("Item-type")?;
                item.read_u8("Reserved")?;
                let sub_length = item.read_u16("Item-length")?;
                let value = item.read_bytes(sub_length as usize, "Sub-item value")?;

                match sub_type {
                    0x30 => {
                        abstract_syntax = Some(decode_uid(value, "Abstract-syntax-name")?);
                    }
                    0x40 => {
                        transfer_syntaxes.push(decode_uid(value, "Transfer-syntax-name")?);
                    }
                    _ => {
                        return InvalidItemTypeSnafu {
                            item_type: sub_type,
                            field: "Presentation context item",
                        }
                        .fail();
                    }
                }
            }

            Ok(PduVariableItem::PresentationContextProposed(
                PresentationContextProposed {
                    id: presentation_context_id,
                    abstract_syntax: abstract_syntax.ok_or_else(|| {
                        MalformedPduSnafu {
                            field: "Abstract-syntax-name",
                        }
                        .build()
                    })?,
                    transfer_syntaxes,
                },
            ))
        }
        0x21 => {
            // Presentation Context Item (result)
            let presentation_context_id = item.read_u8("Presentation-context-ID")?;
            item.read_u8("Reserved")?;
            let reason =
                PresentationContextResultReason::from_code(item.read_u8("Result/Reason")?)
                    .ok_or_else(|| {
                        MalformedPduSnafu {
                            field: "Result/Reason",
                        }
                        .build()
                    })?;
            item.read_u8("Reserved")?;

            // exactly one transfer syntax sub-item;
            // not significant when the result is not acceptance
            let mut transfer_syntax: Option<String> = None;
            while item.remaining() > 0 {
                let sub_type = item.read_u8("Item-type")?;
                item.read_u8("Reserved")?;
                let sub_length = item.read_u16("Item-length")?;
                let value = item.read_bytes(sub_length as usize, "Sub-item value")?;

                match sub_type {
                    0x40 => {
                        ensure!(
                            transfer_syntax.is_none(),
                            MalformedPduSnafu {
                                field: "multiple transfer syntax sub-items"
                            }
                        );
                        transfer_syntax = Some(decode_uid(value, "Transfer-syntax-name")?);
                    }
                    _ => {
                        return InvalidItemTypeSnafu {
                            item_type: sub_type,
                            field: "Presentation context result item",
                        }
                        .fail();
                    }
                }
            }

            Ok(PduVariableItem::PresentationContextResult(
                PresentationContextResult {
                    id: presentation_context_id,
                    reason,
                    transfer_syntax: transfer_syntax.ok_or_else(|| {
                        MalformedPduSnafu {
                            field: "Transfer-syntax-name",
                        }
                        .build()
                    })?,
                },
            ))
        }
        0x50 => {
            // User Information Item
            let mut user_variables = vec![];

            while item.remaining() > 0 {
                let sub_type = item.read_u8("Item-type")?;
                item.read_u8("Reserved")?;
                let sub_length = item.read_u16("Item-length")?;
                let mut sub = Span::new(item.read_bytes(sub_length as usize, "Sub-item value")?);

                match sub_type {
                    0x51 => {
                        // Maximum Length: the largest P-DATA-TF PDU the emitter
                        // is prepared to receive; 0 means no maximum
                        user_variables.push(UserVariableItem::MaxLength(
                            sub.read_u32("Maximum-length-received")?,
                        ));
                    }
                    0x52 => {
                        user_variables.push(UserVariableItem::ImplementationClassUID(decode_uid(
                            sub.data,
                            "Implementation-class-uid",
                        )?));
                    }
                    0x55 => {
                        user_variables.push(UserVariableItem::ImplementationVersionName(
                            decode_text(sub.data, "Implementation-version-name")?
                                .trim()
                                .to_string(),
                        ));
                    }
                    0x54 => {
                        // SCP/SCU Role Selection
                        let uid_length = sub.read_u16("UID-length")?;
                        let sop_class_uid = decode_uid(
                            sub.read_bytes(uid_length as usize, "SOP-class-uid")?,
                            "SOP-class-uid",
                        )?;
                        let scu_role = sub.read_u8("SCU-role")? != 0;
                        let scp_role = sub.read_u8("SCP-role")? != 0;
                        user_variables.push(UserVariableItem::RoleSelection(RoleSelection {
                            sop_class_uid,
                            scu_role,
                            scp_role,
                        }));
                    }
                    _ => {
                        // unknown user sub-items are skipped, not failed
                        warn!("unknown user sub-item type {:#04X} skipped", sub_type);
                    }
                }
            }

            Ok(PduVariableItem::UserVariables(user_variables))
        }
        _ => Ok(PduVariableItem::Unknown(item_type)),
    }
}
