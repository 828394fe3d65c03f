//! Protocol data unit module
//!
//! This module comprises the data types for all PDU variants
//! defined in DICOM PS3.8 §9.3,
//! plus the codec functions [`read_pdu`] and [`write_pdu`]
//! and the framing helper [`pdu_length`].

pub mod pool;
pub mod reader;
pub mod writer;

#[cfg(test)]
mod test;

pub use reader::{pdu_length, read_pdu};
pub use writer::write_pdu;

/// The default maximum PDU size
pub const DEFAULT_MAX_PDU: u32 = 16_384;

/// The minimum PDU size,
/// as specified by the standard
pub const MINIMUM_PDU_SIZE: u32 = 4_096;

/// The maximum PDU size,
/// as specified by the standard
pub const MAXIMUM_PDU_SIZE: u32 = 131_072;

/// The length of the PDU header in bytes,
/// comprising the PDU type (1 byte),
/// reserved byte (1 byte),
/// and PDU length (4 bytes).
pub const PDU_HEADER_SIZE: u32 = 6;

/// The default DICOM application context name.
pub const APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

/// A presentation context proposed by the association requestor.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PresentationContextProposed {
    /// the presentation context identifier, an odd number between 1 and 255
    pub id: u8,
    /// the proposed abstract syntax UID
    pub abstract_syntax: String,
    /// the proposed transfer syntax UIDs
    pub transfer_syntaxes: Vec<String>,
}

/// A presentation context result returned by the association acceptor.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PresentationContextResult {
    /// the presentation context identifier as proposed
    pub id: u8,
    /// the outcome of the negotiation for this context
    pub reason: PresentationContextResultReason,
    /// the accorded transfer syntax UID
    /// (not significant unless the reason is `Acceptance`)
    pub transfer_syntax: String,
}

/// A fully negotiated presentation context,
/// carrying both the abstract syntax from the proposal
/// and the accorded transfer syntax.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PresentationContextNegotiated {
    /// the presentation context identifier
    pub id: u8,
    /// the outcome of the negotiation for this context
    pub reason: PresentationContextResultReason,
    /// the abstract syntax UID from the proposal
    pub abstract_syntax: String,
    /// the accorded transfer syntax UID
    pub transfer_syntax: String,
}

/// The reason recorded in a presentation context result.
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PresentationContextResultReason {
    Acceptance = 0,
    UserRejection = 1,
    NoReason = 2,
    AbstractSyntaxNotSupported = 3,
    TransferSyntaxesNotSupported = 4,
}

impl PresentationContextResultReason {
    fn from_code(code: u8) -> Option<PresentationContextResultReason> {
        match code {
            0 => Some(PresentationContextResultReason::Acceptance),
            1 => Some(PresentationContextResultReason::UserRejection),
            2 => Some(PresentationContextResultReason::NoReason),
            3 => Some(PresentationContextResultReason::AbstractSyntaxNotSupported),
            4 => Some(PresentationContextResultReason::TransferSyntaxesNotSupported),
            _ => None,
        }
    }
}

/// The result field of an association rejection.
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJResult {
    /// rejected-permanent
    Permanent,
    /// rejected-transient
    Transient,
}

impl AssociationRJResult {
    fn from_code(code: u8) -> Option<AssociationRJResult> {
        match code {
            1 => Some(AssociationRJResult::Permanent),
            2 => Some(AssociationRJResult::Transient),
            _ => None,
        }
    }
}

/// The source and reason of an association rejection.
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJSource {
    /// DICOM UL service-user
    ServiceUser(AssociationRJServiceUserReason),
    /// DICOM UL service-provider (ACSE related function)
    ServiceProviderAsce(AssociationRJServiceProviderAsceReason),
    /// DICOM UL service-provider (presentation related function)
    ServiceProviderPresentation(AssociationRJServiceProviderPresentationReason),
}

impl AssociationRJSource {
    fn from_parts(source: u8, reason: u8) -> Option<AssociationRJSource> {
        match (source, reason) {
            (1, 1) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::NoReasonGiven,
            )),
            (1, 2) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
            )),
            (1, 3) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CallingAETitleNotRecognized,
            )),
            (1, 7) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAETitleNotRecognized,
            )),
            (1, x @ 4..=6) | (1, x @ 8..=10) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::Reserved(x),
            )),
            (2, 1) => Some(AssociationRJSource::ServiceProviderAsce(
                AssociationRJServiceProviderAsceReason::NoReasonGiven,
            )),
            (2, 2) => Some(AssociationRJSource::ServiceProviderAsce(
                AssociationRJServiceProviderAsceReason::ProtocolVersionNotSupported,
            )),
            (3, 1) => Some(AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::TemporaryCongestion,
            )),
            (3, 2) => Some(AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
            )),
            (3, x @ 0) | (3, x @ 3..=7) => Some(AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::Reserved(x),
            )),
            _ => None,
        }
    }
}

/// Rejection reasons from the service user.
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceUserReason {
    NoReasonGiven,
    ApplicationContextNameNotSupported,
    CallingAETitleNotRecognized,
    CalledAETitleNotRecognized,
    Reserved(u8),
}

/// Rejection reasons from the service provider (ACSE related function).
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceProviderAsceReason {
    NoReasonGiven,
    ProtocolVersionNotSupported,
}

/// Rejection reasons from the service provider (presentation related function).
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceProviderPresentationReason {
    TemporaryCongestion,
    LocalLimitExceeded,
    Reserved(u8),
}

/// A single presentation data value fragment.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PDataValue {
    /// the identifier of the presentation context this fragment belongs to
    pub presentation_context_id: u8,
    /// whether the fragment carries command or data set bytes
    pub value_type: PDataValueType,
    /// whether this is the last fragment of the command or data set
    pub is_last: bool,
    /// the fragment payload
    pub data: Vec<u8>,
}

/// The kind of payload in a presentation data value.
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PDataValueType {
    Command,
    Data,
}

/// The source of an A-ABORT.
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AbortRQSource {
    /// DICOM UL service-user (initiated abort)
    ServiceUser,
    /// DICOM UL service-provider (initiated abort)
    ServiceProvider(AbortRQServiceProviderReason),
    Reserved,
}

impl AbortRQSource {
    fn from_parts(source: u8, reason: u8) -> Option<AbortRQSource> {
        match (source, reason) {
            (0, _) => Some(AbortRQSource::ServiceUser),
            (1, _) => Some(AbortRQSource::Reserved),
            (2, 0) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::ReasonNotSpecified,
            )),
            (2, 1) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnrecognizedPdu,
            )),
            (2, 2) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnexpectedPdu,
            )),
            (2, 3) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::Reserved,
            )),
            (2, 4) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnrecognizedPduParameter,
            )),
            (2, 5) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnexpectedPduParameter,
            )),
            (2, 6) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::InvalidPduParameter,
            )),
            _ => None,
        }
    }
}

/// The reason of a service provider initiated A-ABORT.
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AbortRQServiceProviderReason {
    /// reason-not-specified
    ReasonNotSpecified,
    /// unrecognized-PDU
    UnrecognizedPdu,
    /// unexpected-PDU
    UnexpectedPdu,
    Reserved,
    /// unrecognized-PDU parameter
    UnrecognizedPduParameter,
    /// unexpected-PDU parameter
    UnexpectedPduParameter,
    /// invalid-PDU-parameter value
    InvalidPduParameter,
}

/// An item of the user information item,
/// as defined in DICOM PS3.8 Annex D.
///
/// Sub-items of any other type are skipped on decode.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum UserVariableItem {
    /// 0x51: the maximum PDU length the emitter is willing to receive
    MaxLength(u32),
    /// 0x52: the implementation class UID of the emitter
    ImplementationClassUID(String),
    /// 0x55: the implementation version name of the emitter
    ImplementationVersionName(String),
    /// 0x54: SCP/SCU role selection for one SOP class
    RoleSelection(RoleSelection),
}

/// An SCP/SCU role selection sub-item.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct RoleSelection {
    /// the SOP class UID the roles apply to
    pub sop_class_uid: String,
    /// whether the emitter proposes to act as an SCU
    pub scu_role: bool,
    /// whether the emitter proposes to act as an SCP
    pub scp_role: bool,
}

/// The body of an A-ASSOCIATE-RQ PDU.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct AssociationRQ {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextProposed>,
    pub user_variables: Vec<UserVariableItem>,
}

/// The body of an A-ASSOCIATE-AC PDU.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct AssociationAC {
    pub protocol_version: u16,
    pub called_ae_title: String,
    pub calling_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextResult>,
    pub user_variables: Vec<UserVariableItem>,
}

/// The body of an A-ASSOCIATE-RJ PDU.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct AssociationRJ {
    pub result: AssociationRJResult,
    pub source: AssociationRJSource,
}

/// A DICOM upper layer protocol data unit.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum Pdu {
    /// A-ASSOCIATE-RQ (type 0x01)
    AssociationRQ(AssociationRQ),
    /// A-ASSOCIATE-AC (type 0x02)
    AssociationAC(AssociationAC),
    /// A-ASSOCIATE-RJ (type 0x03)
    AssociationRJ(AssociationRJ),
    /// P-DATA-TF (type 0x04)
    PData { data: Vec<PDataValue> },
    /// A-RELEASE-RQ (type 0x05)
    ReleaseRQ,
    /// A-RELEASE-RP (type 0x06)
    ReleaseRP,
    /// A-ABORT (type 0x07)
    AbortRQ { source: AbortRQSource },
}

impl Pdu {
    /// A short description of the PDU variant for logging.
    pub fn short_description(&self) -> &'static str {
        match self {
            Pdu::AssociationRQ { .. } => "A-ASSOCIATE-RQ",
            Pdu::AssociationAC { .. } => "A-ASSOCIATE-AC",
            Pdu::AssociationRJ { .. } => "A-ASSOCIATE-RJ",
            Pdu::PData { .. } => "P-DATA-TF",
            Pdu::ReleaseRQ => "A-RELEASE-RQ",
            Pdu::ReleaseRP => "A-RELEASE-RP",
            Pdu::AbortRQ { .. } => "A-ABORT",
        }
    }
}
