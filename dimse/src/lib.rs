//! DICOM message service element (DIMSE) layer.
//!
//! This crate sits between the upper layer protocol
//! and the service class implementations:
//! it encodes and decodes command sets,
//! classifies command fields and status codes,
//! and assembles complete DIMSE messages
//! from the command and data set payloads
//! reassembled by the association layer.
//!
//! - [`command`] enumerates the DIMSE-C and DIMSE-N command fields.
//! - [`status`] holds the status code registry and its category predicates.
//! - [`command_set`] is the Implicit VR Little Endian codec
//!   for group 0000 command sets.
//! - [`dataset`] is a light data set codec for query identifiers
//!   and for pulling patient/study/series attributes
//!   out of stored instances.
//! - [`message`] pairs command sets with their data set payloads.

pub mod command;
pub mod command_set;
pub mod dataset;
pub mod message;
pub mod status;
pub mod tags;

pub use command::{CommandField, Priority};
pub use command_set::CommandSet;
pub use dataset::DataSet;
pub use message::{DimseMessage, MessageAssembler};

use snafu::{Backtrace, Snafu};

/// An error in the DIMSE layer.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("truncated element at offset {}", offset))]
    Truncated { offset: usize, backtrace: Backtrace },

    #[snafu(display("element {:04X},{:04X} has invalid length {}", tag.0, tag.1, length))]
    InvalidValueLength {
        tag: tags::Tag,
        length: u32,
        backtrace: Backtrace,
    },

    /// command set has no command field element
    MissingCommandField { backtrace: Backtrace },

    #[snafu(display("unknown command field {:#06X}", value))]
    UnknownCommandField { value: u16, backtrace: Backtrace },

    #[snafu(display("unsupported transfer syntax `{}`", uid))]
    UnsupportedTransferSyntax { uid: String, backtrace: Backtrace },

    #[snafu(display("text in element {:04X},{:04X} is not ASCII", tag.0, tag.1))]
    NonAsciiText { tag: tags::Tag, backtrace: Backtrace },

    #[snafu(display("data set fragment on context {} without a pending command", context_id))]
    DataWithoutCommand { context_id: u8, backtrace: Backtrace },

    #[snafu(display(
        "data set fragment on context {} does not match pending command context {}",
        got,
        expected
    ))]
    ContextMismatch {
        expected: u8,
        got: u8,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
