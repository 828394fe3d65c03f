//! Command set codec.
//!
//! Command sets are always encoded in Implicit VR Little Endian,
//! regardless of the transfer syntax negotiated for the context
//! (DICOM PS3.7 §6.3.1).
//! Only group 0000 elements are meaningful here;
//! unknown elements are skipped on read.

use snafu::ensure;

use crate::command::{CommandField, Priority};
use crate::status::StatusCode;
use crate::tags::{self, Tag};
use crate::{
    InvalidValueLengthSnafu, MissingCommandFieldSnafu, NonAsciiTextSnafu, Result, TruncatedSnafu,
    UnknownCommandFieldSnafu,
};

/// Command Data Set Type value for "no data set present".
pub const DATA_SET_ABSENT: u16 = 0x0101;

/// Command Data Set Type value for "a data set follows".
pub const DATA_SET_PRESENT: u16 = 0x0001;

/// A decoded DICOM command set.
///
/// Constructors exist for every message the services emit;
/// response constructors echo the request's message id
/// in Message ID Being Responded To.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSet {
    pub command_field: CommandField,
    pub message_id: Option<u16>,
    pub message_id_being_responded_to: Option<u16>,
    pub affected_sop_class_uid: Option<String>,
    pub requested_sop_class_uid: Option<String>,
    pub affected_sop_instance_uid: Option<String>,
    pub requested_sop_instance_uid: Option<String>,
    pub priority: Option<Priority>,
    pub data_set_type: u16,
    pub status: Option<StatusCode>,
    pub move_destination: Option<String>,
    pub move_originator_ae_title: Option<String>,
    pub move_originator_message_id: Option<u16>,
    pub remaining_sub_operations: Option<u16>,
    pub completed_sub_operations: Option<u16>,
    pub failed_sub_operations: Option<u16>,
    pub warning_sub_operations: Option<u16>,
}

impl CommandSet {
    fn new(command_field: CommandField) -> Self {
        CommandSet {
            command_field,
            message_id: None,
            message_id_being_responded_to: None,
            affected_sop_class_uid: None,
            requested_sop_class_uid: None,
            affected_sop_instance_uid: None,
            requested_sop_instance_uid: None,
            priority: None,
            data_set_type: DATA_SET_ABSENT,
            status: None,
            move_destination: None,
            move_originator_ae_title: None,
            move_originator_message_id: None,
            remaining_sub_operations: None,
            completed_sub_operations: None,
            failed_sub_operations: None,
            warning_sub_operations: None,
        }
    }

    /// Whether a data set payload follows this command.
    pub fn has_data_set(&self) -> bool {
        self.data_set_type != DATA_SET_ABSENT
    }

    // ------------------------------------------------------------------
    // request constructors
    // ------------------------------------------------------------------

    pub fn echo_rq(message_id: u16, sop_class_uid: &str) -> Self {
        let mut cmd = CommandSet::new(CommandField::CEchoRq);
        cmd.message_id = Some(message_id);
        cmd.affected_sop_class_uid = Some(sop_class_uid.to_string());
        cmd
    }

    pub fn store_rq(
        message_id: u16,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        priority: Priority,
    ) -> Self {
        let mut cmd = CommandSet::new(CommandField::CStoreRq);
        cmd.message_id = Some(message_id);
        cmd.affected_sop_class_uid = Some(sop_class_uid.to_string());
        cmd.affected_sop_instance_uid = Some(sop_instance_uid.to_string());
        cmd.priority = Some(priority);
        cmd.data_set_type = DATA_SET_PRESENT;
        cmd
    }

    /// A C-STORE-RQ performed as a sub-operation of a C-MOVE,
    /// carrying the originator AE title and message id.
    pub fn store_rq_for_move(
        message_id: u16,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        originator_ae_title: &str,
        originator_message_id: u16,
    ) -> Self {
        let mut cmd = Self::store_rq(message_id, sop_class_uid, sop_instance_uid, Priority::Medium);
        cmd.move_originator_ae_title = Some(originator_ae_title.to_string());
        cmd.move_originator_message_id = Some(originator_message_id);
        cmd
    }

    pub fn find_rq(message_id: u16, sop_class_uid: &str, priority: Priority) -> Self {
        let mut cmd = CommandSet::new(CommandField::CFindRq);
        cmd.message_id = Some(message_id);
        cmd.affected_sop_class_uid = Some(sop_class_uid.to_string());
        cmd.priority = Some(priority);
        cmd.data_set_type = DATA_SET_PRESENT;
        cmd
    }

    pub fn move_rq(
        message_id: u16,
        sop_class_uid: &str,
        destination_ae_title: &str,
        priority: Priority,
    ) -> Self {
        let mut cmd = CommandSet::new(CommandField::CMoveRq);
        cmd.message_id = Some(message_id);
        cmd.affected_sop_class_uid = Some(sop_class_uid.to_string());
        cmd.move_destination = Some(destination_ae_title.to_string());
        cmd.priority = Some(priority);
        cmd.data_set_type = DATA_SET_PRESENT;
        cmd
    }

    pub fn cancel_rq(message_id_being_responded_to: u16) -> Self {
        let mut cmd = CommandSet::new(CommandField::CCancelRq);
        cmd.message_id_being_responded_to = Some(message_id_being_responded_to);
        cmd
    }

    pub fn n_create_rq(message_id: u16, sop_class_uid: &str, sop_instance_uid: &str) -> Self {
        let mut cmd = CommandSet::new(CommandField::NCreateRq);
        cmd.message_id = Some(message_id);
        cmd.affected_sop_class_uid = Some(sop_class_uid.to_string());
        cmd.affected_sop_instance_uid = Some(sop_instance_uid.to_string());
        cmd.data_set_type = DATA_SET_PRESENT;
        cmd
    }

    pub fn n_set_rq(message_id: u16, sop_class_uid: &str, sop_instance_uid: &str) -> Self {
        let mut cmd = CommandSet::new(CommandField::NSetRq);
        cmd.message_id = Some(message_id);
        cmd.requested_sop_class_uid = Some(sop_class_uid.to_string());
        cmd.requested_sop_instance_uid = Some(sop_instance_uid.to_string());
        cmd.data_set_type = DATA_SET_PRESENT;
        cmd
    }

    // ------------------------------------------------------------------
    // response constructors
    // ------------------------------------------------------------------

    pub fn echo_rsp(request: &CommandSet, status: StatusCode) -> Self {
        let mut cmd = CommandSet::new(CommandField::CEchoRsp);
        cmd.message_id_being_responded_to = request.message_id;
        cmd.affected_sop_class_uid = request.affected_sop_class_uid.clone();
        cmd.status = Some(status);
        cmd
    }

    pub fn store_rsp(request: &CommandSet, status: StatusCode) -> Self {
        let mut cmd = CommandSet::new(CommandField::CStoreRsp);
        cmd.message_id_being_responded_to = request.message_id;
        cmd.affected_sop_class_uid = request.affected_sop_class_uid.clone();
        cmd.affected_sop_instance_uid = request.affected_sop_instance_uid.clone();
        cmd.status = Some(status);
        cmd
    }

    /// A C-FIND response; `with_data_set` is true on pending responses
    /// which carry a match identifier.
    pub fn find_rsp(request: &CommandSet, status: StatusCode, with_data_set: bool) -> Self {
        let mut cmd = CommandSet::new(CommandField::CFindRsp);
        cmd.message_id_being_responded_to = request.message_id;
        cmd.affected_sop_class_uid = request.affected_sop_class_uid.clone();
        cmd.status = Some(status);
        if with_data_set {
            cmd.data_set_type = DATA_SET_PRESENT;
        }
        cmd
    }

    /// A C-MOVE response with sub-operation counters.
    pub fn move_rsp(
        request: &CommandSet,
        status: StatusCode,
        remaining: u16,
        completed: u16,
        failed: u16,
        warning: u16,
    ) -> Self {
        let mut cmd = CommandSet::new(CommandField::CMoveRsp);
        cmd.message_id_being_responded_to = request.message_id;
        cmd.affected_sop_class_uid = request.affected_sop_class_uid.clone();
        cmd.status = Some(status);
        cmd.remaining_sub_operations = Some(remaining);
        cmd.completed_sub_operations = Some(completed);
        cmd.failed_sub_operations = Some(failed);
        cmd.warning_sub_operations = Some(warning);
        cmd
    }

    pub fn n_create_rsp(request: &CommandSet, status: StatusCode) -> Self {
        let mut cmd = CommandSet::new(CommandField::NCreateRsp);
        cmd.message_id_being_responded_to = request.message_id;
        cmd.affected_sop_class_uid = request.affected_sop_class_uid.clone();
        cmd.affected_sop_instance_uid = request.affected_sop_instance_uid.clone();
        cmd.status = Some(status);
        cmd
    }

    /// A minimal failure response for any request command,
    /// echoing the message id and the SOP identifiers.
    ///
    /// Returns `None` for commands without a response
    /// (C-CANCEL-RQ) and for messages that are already responses.
    pub fn generic_rsp(request: &CommandSet, status: StatusCode) -> Option<Self> {
        if request.command_field.is_response() {
            return None;
        }
        let response_field = request.command_field.response()?;
        let mut cmd = CommandSet::new(response_field);
        cmd.message_id_being_responded_to = request.message_id;
        cmd.affected_sop_class_uid = request
            .affected_sop_class_uid
            .clone()
            .or_else(|| request.requested_sop_class_uid.clone());
        cmd.affected_sop_instance_uid = request
            .affected_sop_instance_uid
            .clone()
            .or_else(|| request.requested_sop_instance_uid.clone());
        cmd.status = Some(status);
        Some(cmd)
    }

    pub fn n_set_rsp(request: &CommandSet, status: StatusCode) -> Self {
        let mut cmd = CommandSet::new(CommandField::NSetRsp);
        cmd.message_id_being_responded_to = request.message_id;
        cmd.affected_sop_class_uid = request.requested_sop_class_uid.clone();
        cmd.affected_sop_instance_uid = request.requested_sop_instance_uid.clone();
        cmd.status = Some(status);
        cmd
    }

    // ------------------------------------------------------------------
    // codec
    // ------------------------------------------------------------------

    /// Encode the command set in Implicit VR Little Endian,
    /// with the leading Command Group Length element.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(128);

        if let Some(uid) = &self.affected_sop_class_uid {
            put_uid(&mut body, tags::AFFECTED_SOP_CLASS_UID, uid);
        }
        if let Some(uid) = &self.requested_sop_class_uid {
            put_uid(&mut body, tags::REQUESTED_SOP_CLASS_UID, uid);
        }
        put_u16(&mut body, tags::COMMAND_FIELD, self.command_field.code());
        if let Some(id) = self.message_id {
            put_u16(&mut body, tags::MESSAGE_ID, id);
        }
        if let Some(id) = self.message_id_being_responded_to {
            put_u16(&mut body, tags::MESSAGE_ID_BEING_RESPONDED_TO, id);
        }
        if let Some(destination) = &self.move_destination {
            put_text(&mut body, tags::MOVE_DESTINATION, destination);
        }
        if let Some(priority) = self.priority {
            put_u16(&mut body, tags::PRIORITY, priority as u16);
        }
        put_u16(&mut body, tags::COMMAND_DATA_SET_TYPE, self.data_set_type);
        if let Some(status) = self.status {
            put_u16(&mut body, tags::STATUS, status);
        }
        if let Some(uid) = &self.affected_sop_instance_uid {
            put_uid(&mut body, tags::AFFECTED_SOP_INSTANCE_UID, uid);
        }
        if let Some(uid) = &self.requested_sop_instance_uid {
            put_uid(&mut body, tags::REQUESTED_SOP_INSTANCE_UID, uid);
        }
        if let Some(n) = self.remaining_sub_operations {
            put_u16(&mut body, tags::NUMBER_OF_REMAINING_SUBOPERATIONS, n);
        }
        if let Some(n) = self.completed_sub_operations {
            put_u16(&mut body, tags::NUMBER_OF_COMPLETED_SUBOPERATIONS, n);
        }
        if let Some(n) = self.failed_sub_operations {
            put_u16(&mut body, tags::NUMBER_OF_FAILED_SUBOPERATIONS, n);
        }
        if let Some(n) = self.warning_sub_operations {
            put_u16(&mut body, tags::NUMBER_OF_WARNING_SUBOPERATIONS, n);
        }
        if let Some(ae) = &self.move_originator_ae_title {
            put_text(&mut body, tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE, ae);
        }
        if let Some(id) = self.move_originator_message_id {
            put_u16(&mut body, tags::MOVE_ORIGINATOR_MESSAGE_ID, id);
        }

        let mut out = Vec::with_capacity(body.len() + 12);
        put_element_header(&mut out, tags::COMMAND_GROUP_LENGTH, 4);
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// Decode a command set from Implicit VR Little Endian bytes.
    ///
    /// Unknown elements are skipped;
    /// a missing Command Field element is an error.
    pub fn decode(data: &[u8]) -> Result<CommandSet> {
        let mut command_field: Option<CommandField> = None;
        let mut cmd = CommandSet::new(CommandField::CEchoRq);

        let mut pos = 0;
        while pos < data.len() {
            let (tag, value, next) = read_element(data, pos)?;
            pos = next;

            match tag {
                tags::COMMAND_GROUP_LENGTH => {}
                tags::COMMAND_FIELD => {
                    let value = read_u16_value(tag, value)?;
                    command_field = Some(
                        CommandField::from_code(value)
                            .ok_or_else(|| UnknownCommandFieldSnafu { value }.build())?,
                    );
                }
                tags::MESSAGE_ID => cmd.message_id = Some(read_u16_value(tag, value)?),
                tags::MESSAGE_ID_BEING_RESPONDED_TO => {
                    cmd.message_id_being_responded_to = Some(read_u16_value(tag, value)?)
                }
                tags::AFFECTED_SOP_CLASS_UID => {
                    cmd.affected_sop_class_uid = Some(read_text_value(tag, value)?)
                }
                tags::REQUESTED_SOP_CLASS_UID => {
                    cmd.requested_sop_class_uid = Some(read_text_value(tag, value)?)
                }
                tags::AFFECTED_SOP_INSTANCE_UID => {
                    cmd.affected_sop_instance_uid = Some(read_text_value(tag, value)?)
                }
                tags::REQUESTED_SOP_INSTANCE_UID => {
                    cmd.requested_sop_instance_uid = Some(read_text_value(tag, value)?)
                }
                tags::PRIORITY => {
                    cmd.priority = Priority::from_code(read_u16_value(tag, value)?);
                }
                tags::COMMAND_DATA_SET_TYPE => {
                    cmd.data_set_type = read_u16_value(tag, value)?;
                }
                tags::STATUS => cmd.status = Some(read_u16_value(tag, value)?),
                tags::MOVE_DESTINATION => {
                    cmd.move_destination = Some(read_text_value(tag, value)?)
                }
                tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE => {
                    cmd.move_originator_ae_title = Some(read_text_value(tag, value)?)
                }
                tags::MOVE_ORIGINATOR_MESSAGE_ID => {
                    cmd.move_originator_message_id = Some(read_u16_value(tag, value)?)
                }
                tags::NUMBER_OF_REMAINING_SUBOPERATIONS => {
                    cmd.remaining_sub_operations = Some(read_u16_value(tag, value)?)
                }
                tags::NUMBER_OF_COMPLETED_SUBOPERATIONS => {
                    cmd.completed_sub_operations = Some(read_u16_value(tag, value)?)
                }
                tags::NUMBER_OF_FAILED_SUBOPERATIONS => {
                    cmd.failed_sub_operations = Some(read_u16_value(tag, value)?)
                }
                tags::NUMBER_OF_WARNING_SUBOPERATIONS => {
                    cmd.warning_sub_operations = Some(read_u16_value(tag, value)?)
                }
                _ => {}
            }
        }

        cmd.command_field = command_field.ok_or_else(|| MissingCommandFieldSnafu.build())?;
        Ok(cmd)
    }
}

fn put_element_header(out: &mut Vec<u8>, tag: Tag, length: u32) {
    out.extend_from_slice(&tag.0.to_le_bytes());
    out.extend_from_slice(&tag.1.to_le_bytes());
    out.extend_from_slice(&length.to_le_bytes());
}

fn put_u16(out: &mut Vec<u8>, tag: Tag, value: u16) {
    put_element_header(out, tag, 2);
    out.extend_from_slice(&value.to_le_bytes());
}

/// Write a UID value, NUL padded to an even length.
fn put_uid(out: &mut Vec<u8>, tag: Tag, value: &str) {
    let mut bytes = value.as_bytes().to_vec();
    if bytes.len() % 2 != 0 {
        bytes.push(0x00);
    }
    put_element_header(out, tag, bytes.len() as u32);
    out.extend_from_slice(&bytes);
}

/// Write a text value, space padded to an even length.
fn put_text(out: &mut Vec<u8>, tag: Tag, value: &str) {
    let mut bytes = value.as_bytes().to_vec();
    if bytes.len() % 2 != 0 {
        bytes.push(b' ');
    }
    put_element_header(out, tag, bytes.len() as u32);
    out.extend_from_slice(&bytes);
}

/// Read one implicit VR element, returning its tag, value span
/// and the offset of the next element.
fn read_element(data: &[u8], pos: usize) -> Result<(Tag, &[u8], usize)> {
    ensure!(data.len() >= pos + 8, TruncatedSnafu { offset: pos });
    let group = u16::from_le_bytes([data[pos], data[pos + 1]]);
    let element = u16::from_le_bytes([data[pos + 2], data[pos + 3]]);
    let length = u32::from_le_bytes([
        data[pos + 4],
        data[pos + 5],
        data[pos + 6],
        data[pos + 7],
    ]);
    let tag = (group, element);
    ensure!(
        length != 0xFFFF_FFFF,
        InvalidValueLengthSnafu { tag, length }
    );
    let value_start = pos + 8;
    let value_end = value_start + length as usize;
    ensure!(data.len() >= value_end, TruncatedSnafu { offset: pos });
    Ok((tag, &data[value_start..value_end], value_end))
}

fn read_u16_value(tag: Tag, value: &[u8]) -> Result<u16> {
    ensure!(
        value.len() >= 2,
        InvalidValueLengthSnafu {
            tag,
            length: value.len() as u32
        }
    );
    Ok(u16::from_le_bytes([value[0], value[1]]))
}

fn read_text_value(tag: Tag, value: &[u8]) -> Result<String> {
    ensure!(value.is_ascii(), NonAsciiTextSnafu { tag });
    Ok(String::from_utf8_lossy(value)
        .trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
        .to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_round_trip() {
        let rq = CommandSet::echo_rq(1, "1.2.840.10008.1.1");
        let bytes = rq.encode();

        // group length element first
        assert_eq!(&bytes[0..4], &[0x00, 0x00, 0x00, 0x00]);
        let group_length =
            u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        assert_eq!(group_length, bytes.len() - 12);

        let decoded = CommandSet::decode(&bytes).unwrap();
        assert_eq!(decoded, rq);
        assert_eq!(decoded.command_field, CommandField::CEchoRq);
        assert_eq!(decoded.message_id, Some(1));
        assert!(!decoded.has_data_set());
    }

    #[test]
    fn store_round_trip_keeps_uids() {
        let rq = CommandSet::store_rq(
            7,
            "1.2.840.10008.5.1.4.1.1.2",
            "1.2.3.4.5.6.7.8.9",
            Priority::Medium,
        );
        let bytes = rq.encode();
        let decoded = CommandSet::decode(&bytes).unwrap();
        assert_eq!(decoded, rq);
        assert!(decoded.has_data_set());
        assert_eq!(
            decoded.affected_sop_class_uid.as_deref(),
            Some("1.2.840.10008.5.1.4.1.1.2")
        );
        assert_eq!(
            decoded.affected_sop_instance_uid.as_deref(),
            Some("1.2.3.4.5.6.7.8.9")
        );
    }

    #[test]
    fn responses_echo_the_request_message_id() {
        let rq = CommandSet::find_rq(42, "1.2.840.10008.5.1.4.1.2.2.1", Priority::Medium);
        let rsp = CommandSet::find_rsp(&rq, crate::status::PENDING, true);
        assert_eq!(rsp.message_id_being_responded_to, Some(42));
        assert!(rsp.has_data_set());

        let done = CommandSet::find_rsp(&rq, crate::status::SUCCESS, false);
        assert!(!done.has_data_set());

        let bytes = rsp.encode();
        let decoded = CommandSet::decode(&bytes).unwrap();
        assert_eq!(decoded.status, Some(crate::status::PENDING));
        assert_eq!(decoded.message_id_being_responded_to, Some(42));
    }

    #[test]
    fn move_rsp_counts_round_trip() {
        let rq = CommandSet::move_rq(9, "1.2.840.10008.5.1.4.1.2.2.2", "TARGET-SCP", Priority::Medium);
        assert_eq!(rq.move_destination.as_deref(), Some("TARGET-SCP"));

        let rsp = CommandSet::move_rsp(&rq, crate::status::PENDING, 3, 2, 1, 0);
        let decoded = CommandSet::decode(&rsp.encode()).unwrap();
        assert_eq!(decoded.remaining_sub_operations, Some(3));
        assert_eq!(decoded.completed_sub_operations, Some(2));
        assert_eq!(decoded.failed_sub_operations, Some(1));
        assert_eq!(decoded.warning_sub_operations, Some(0));
    }

    #[test]
    fn unknown_elements_are_skipped() {
        let rq = CommandSet::echo_rq(5, "1.2.840.10008.1.1");
        let mut bytes = rq.encode();
        // append an element of a tag this codec does not know
        bytes.extend_from_slice(&[0x00, 0x00, 0x51, 0x00]);
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&[0xAB, 0xCD]);

        let decoded = CommandSet::decode(&bytes).unwrap();
        assert_eq!(decoded.message_id, Some(5));
    }

    #[test]
    fn missing_command_field_is_an_error() {
        let rq = CommandSet::echo_rq(5, "1.2.840.10008.1.1");
        let bytes = rq.encode();
        // cut the stream before the command field element
        let err = CommandSet::decode(&bytes[..12]).unwrap_err();
        assert!(matches!(err, crate::Error::MissingCommandField { .. }));
    }

    #[test]
    fn truncated_element_is_an_error() {
        let rq = CommandSet::echo_rq(5, "1.2.840.10008.1.1");
        let bytes = rq.encode();
        let err = CommandSet::decode(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, crate::Error::Truncated { .. }));
    }

    #[test]
    fn cancel_rq_carries_only_the_target_message_id() {
        let cancel = CommandSet::cancel_rq(17);
        let decoded = CommandSet::decode(&cancel.encode()).unwrap();
        assert_eq!(decoded.command_field, CommandField::CCancelRq);
        assert_eq!(decoded.message_id_being_responded_to, Some(17));
        assert!(!decoded.has_data_set());
    }
}
