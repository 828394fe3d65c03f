//! A light data set codec.
//!
//! This is not a general DICOM parser:
//! it walks the top level of an uncompressed little-endian data set,
//! collecting the primitive attributes the services care about
//! (identifiers for C-FIND and the patient/study/series chain
//! of stored instances) and skipping over everything else,
//! including sequences of undefined length.
//! Pixel data groups are never retained.

use std::collections::BTreeMap;

use snafu::ensure;

use crate::tags::{self, Tag};
use crate::{
    InvalidValueLengthSnafu, Result, TruncatedSnafu, UnsupportedTransferSyntaxSnafu,
};

/// Implicit VR Little Endian.
pub const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

/// Explicit VR Little Endian.
pub const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

const UNDEFINED_LENGTH: u32 = 0xFFFF_FFFF;

/// A flat view over the top-level attributes of a data set.
///
/// Also used to build C-FIND response identifiers,
/// which carry text attributes only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataSet {
    elements: BTreeMap<Tag, Vec<u8>>,
}

/// Whether the transfer syntax uses explicit value representations.
fn is_explicit(transfer_syntax: &str) -> Result<bool> {
    match transfer_syntax {
        IMPLICIT_VR_LE => Ok(false),
        EXPLICIT_VR_LE => Ok(true),
        uid => UnsupportedTransferSyntaxSnafu { uid }.fail(),
    }
}

impl DataSet {
    pub fn new() -> Self {
        DataSet::default()
    }

    /// Parse the top level of a data set
    /// encoded in the given transfer syntax.
    pub fn read(data: &[u8], transfer_syntax: &str) -> Result<DataSet> {
        let explicit = is_explicit(transfer_syntax)?;
        let mut elements = BTreeMap::new();

        let mut pos = 0;
        while pos < data.len() {
            let (tag, length, value_start) = read_header(data, pos, explicit)?;

            if length == UNDEFINED_LENGTH {
                // sequence or encapsulated data of undefined length
                pos = skip_sequence(data, value_start, explicit)?;
                continue;
            }

            let value_end = value_start + length as usize;
            ensure!(data.len() >= value_end, TruncatedSnafu { offset: pos });

            // pixel data and beyond is never retained here
            if tag.0 < 0x7FE0 {
                elements.insert(tag, data[value_start..value_end].to_vec());
            }
            pos = value_end;
        }

        Ok(DataSet { elements })
    }

    /// Get a text attribute,
    /// trimmed of padding and trailing NULs.
    pub fn get_str(&self, tag: Tag) -> Option<String> {
        self.elements.get(&tag).map(|value| {
            String::from_utf8_lossy(value)
                .trim_matches(|c: char| c.is_whitespace() || c == '\0')
                .to_string()
        })
    }

    /// Get an integer attribute encoded as an integer string (IS).
    pub fn get_int(&self, tag: Tag) -> Option<i64> {
        self.get_str(tag).and_then(|s| s.parse().ok())
    }

    /// Get the raw value bytes of an attribute.
    pub fn get_raw(&self, tag: Tag) -> Option<&[u8]> {
        self.elements.get(&tag).map(|v| v.as_slice())
    }

    /// Insert or replace a text attribute.
    pub fn put_str(&mut self, tag: Tag, value: impl Into<String>) {
        self.elements.insert(tag, value.into().into_bytes());
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.elements.contains_key(&tag)
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Encode the attributes in ascending tag order.
    ///
    /// Only text attributes are supported,
    /// which covers the identifiers this node emits.
    pub fn encode(&self, transfer_syntax: &str) -> Result<Vec<u8>> {
        let explicit = is_explicit(transfer_syntax)?;
        let mut out = Vec::with_capacity(self.elements.len() * 32);

        for (tag, value) in &self.elements {
            let mut bytes = value.clone();
            if bytes.len() % 2 != 0 {
                // UI values pad with NUL, texts pad with space
                bytes.push(if vr_for(*tag) == b"UI" { 0x00 } else { b' ' });
            }

            out.extend_from_slice(&tag.0.to_le_bytes());
            out.extend_from_slice(&tag.1.to_le_bytes());
            if explicit {
                out.extend_from_slice(vr_for(*tag));
                out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
            } else {
                out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            }
            out.extend_from_slice(&bytes);
        }

        Ok(out)
    }
}

/// The value representation used when encoding an attribute explicitly.
fn vr_for(tag: Tag) -> &'static [u8; 2] {
    match tag {
        tags::SOP_CLASS_UID
        | tags::SOP_INSTANCE_UID
        | tags::STUDY_INSTANCE_UID
        | tags::SERIES_INSTANCE_UID => b"UI",
        tags::STUDY_DATE
        | tags::PATIENT_BIRTH_DATE
        | tags::SCHEDULED_PROCEDURE_STEP_START_DATE
        | tags::PERFORMED_PROCEDURE_STEP_START_DATE
        | tags::PERFORMED_PROCEDURE_STEP_END_DATE => b"DA",
        tags::STUDY_TIME
        | tags::SCHEDULED_PROCEDURE_STEP_START_TIME
        | tags::PERFORMED_PROCEDURE_STEP_START_TIME
        | tags::PERFORMED_PROCEDURE_STEP_END_TIME => b"TM",
        tags::PATIENT_NAME | tags::REFERRING_PHYSICIAN_NAME => b"PN",
        tags::SCHEDULED_STATION_AE_TITLE | tags::PERFORMED_STATION_AE_TITLE => b"AE",
        tags::QUERY_RETRIEVE_LEVEL
        | tags::MODALITY
        | tags::MODALITIES_IN_STUDY
        | tags::PATIENT_SEX
        | tags::BODY_PART_EXAMINED
        | tags::PERFORMED_PROCEDURE_STEP_STATUS => b"CS",
        tags::SERIES_NUMBER
        | tags::INSTANCE_NUMBER
        | tags::NUMBER_OF_STUDY_RELATED_SERIES
        | tags::NUMBER_OF_STUDY_RELATED_INSTANCES => b"IS",
        tags::ACCESSION_NUMBER
        | tags::STUDY_ID
        | tags::STATION_NAME
        | tags::SCHEDULED_PROCEDURE_STEP_ID
        | tags::PERFORMED_PROCEDURE_STEP_ID
        | tags::REQUESTED_PROCEDURE_ID => b"SH",
        _ => b"LO",
    }
}

/// Value representations with a 2-byte reserved field
/// and a 4-byte length in explicit VR.
fn is_long_form(vr: &[u8]) -> bool {
    matches!(
        vr,
        b"OB" | b"OD" | b"OF" | b"OL" | b"OW" | b"SQ" | b"UC" | b"UR" | b"UT" | b"UN"
    )
}

/// Read one element header.
///
/// Returns the tag, the value length
/// (possibly [`UNDEFINED_LENGTH`]) and the offset of the value.
fn read_header(data: &[u8], pos: usize, explicit: bool) -> Result<(Tag, u32, usize)> {
    ensure!(data.len() >= pos + 8, TruncatedSnafu { offset: pos });
    let group = u16::from_le_bytes([data[pos], data[pos + 1]]);
    let element = u16::from_le_bytes([data[pos + 2], data[pos + 3]]);
    let tag = (group, element);

    // delimitation items always use the implicit layout
    if !explicit || group == 0xFFFE {
        let length = u32::from_le_bytes([
            data[pos + 4],
            data[pos + 5],
            data[pos + 6],
            data[pos + 7],
        ]);
        return Ok((tag, length, pos + 8));
    }

    let vr = [data[pos + 4], data[pos + 5]];
    if is_long_form(&vr) {
        ensure!(data.len() >= pos + 12, TruncatedSnafu { offset: pos });
        let length = u32::from_le_bytes([
            data[pos + 8],
            data[pos + 9],
            data[pos + 10],
            data[pos + 11],
        ]);
        Ok((tag, length, pos + 12))
    } else {
        let length = u16::from_le_bytes([data[pos + 6], data[pos + 7]]) as u32;
        Ok((tag, length, pos + 8))
    }
}

/// Skip the items of an undefined-length sequence,
/// returning the offset just past the sequence delimitation item.
fn skip_sequence(data: &[u8], mut pos: usize, explicit: bool) -> Result<usize> {
    loop {
        ensure!(data.len() >= pos + 8, TruncatedSnafu { offset: pos });
        let group = u16::from_le_bytes([data[pos], data[pos + 1]]);
        let element = u16::from_le_bytes([data[pos + 2], data[pos + 3]]);
        let length = u32::from_le_bytes([
            data[pos + 4],
            data[pos + 5],
            data[pos + 6],
            data[pos + 7],
        ]);
        pos += 8;

        match (group, element) {
            t if t == tags::SEQUENCE_DELIMITATION => return Ok(pos),
            t if t == tags::ITEM => {
                if length == UNDEFINED_LENGTH {
                    pos = skip_item(data, pos, explicit)?;
                } else {
                    pos += length as usize;
                    ensure!(data.len() >= pos, TruncatedSnafu { offset: pos });
                }
            }
            tag => {
                return InvalidValueLengthSnafu { tag, length }.fail();
            }
        }
    }
}

/// Skip the elements of an undefined-length item,
/// returning the offset just past the item delimitation element.
fn skip_item(data: &[u8], mut pos: usize, explicit: bool) -> Result<usize> {
    loop {
        let (tag, length, value_start) = read_header(data, pos, explicit)?;
        if tag == tags::ITEM_DELIMITATION {
            return Ok(value_start);
        }
        if length == UNDEFINED_LENGTH {
            pos = skip_sequence(data, value_start, explicit)?;
        } else {
            pos = value_start + length as usize;
            ensure!(data.len() >= pos, TruncatedSnafu { offset: pos });
        }
    }
}
