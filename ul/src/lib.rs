//! This crate contains the types and methods needed to interact
//! with DICOM nodes through the upper layer protocol.
//!
//! The crate is the protocol core of the PACS:
//! it owns the binary representation of protocol data units
//! and the life cycle of an association,
//! leaving DIMSE semantics and storage to the crates above it.
//!
//! - The [`pdu`] module
//!   provides data structures representing _protocol data units_
//!   together with a pure codec over byte spans,
//!   a framing helper for streaming callers,
//!   and a process-wide buffer pool.
//! - The [`association`] module
//!   comprises the association state machine
//!   and the socket-facing SCU and SCP drivers
//!   which negotiate and establish associations over TCP.
//! - The [`address`] module
//!   provides an abstraction for compound addresses
//!   referring to application entities in a network.

pub mod address;
pub mod association;
pub mod pdu;

/// The implementation class UID advertised by this node.
///
/// Automatically generated as per the standard, part 5, section B.2.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.305828072172226727271631875403444125818";

/// The implementation version name advertised by this node.
pub const IMPLEMENTATION_VERSION_NAME: &str = "PACS-RS 0.1";

// re-exports

pub use address::{AeAddr, FullAeAddr};
pub use association::client::{ClientAssociation, ClientAssociationOptions};
pub use association::machine::{ScpMachine, ScpMachineOptions, ScpOutput};
pub use association::server::{ServerAssociation, ServerAssociationOptions};
pub use pdu::read_pdu;
pub use pdu::write_pdu;
pub use pdu::Pdu;
