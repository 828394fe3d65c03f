//! Association state machine module
//!
//! The [`ScpMachine`] is the sans-IO heart of the acceptor side:
//! it consumes decoded PDUs and protocol events
//! and emits the actions the transport layer must carry out.
//! Because it performs no I/O of its own,
//! the same machine drives both the blocking
//! [`ServerAssociation`](crate::association::server::ServerAssociation)
//! and the pipelined server sessions.

use std::borrow::Cow;
use std::collections::HashMap;

use tracing::{debug, warn};

use crate::association::uid::trim_uid;
use crate::association::{AcceptAny, AccessControl, NegotiatedOptions};
use crate::pdu::reader::DecodeError;
use crate::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, AssociationAC, AssociationRJ,
    AssociationRJResult, AssociationRJSource, AssociationRQ, PDataValueType, Pdu,
    PresentationContextNegotiated, PresentationContextResult, PresentationContextResultReason,
    UserVariableItem, APPLICATION_CONTEXT_NAME, DEFAULT_MAX_PDU,
};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

/// Implicit VR Little Endian,
/// the default transfer syntax placed in rejected context results.
const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

/// The life cycle state of an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssociationState {
    /// No negotiation has started yet (requestor side before A-ASSOCIATE-RQ)
    Idle,
    /// Waiting for the peer's A-ASSOCIATE-RQ (acceptor side)
    AwaitingAssociateRq,
    /// Waiting for the peer's A-ASSOCIATE-AC (requestor side)
    AwaitingAssociateAc,
    /// Negotiation succeeded, DIMSE traffic may flow
    Established,
    /// A release was initiated locally, waiting for A-RELEASE-RP
    Releasing,
    /// The association ended in an orderly fashion
    Closed,
    /// The association was aborted
    Aborted,
}

/// An action requested by the state machine.
///
/// The transport driver executes these in order:
/// `Send` writes a PDU to the peer,
/// `Command`/`Data` hand a reassembled DIMSE fragment stream
/// to the message layer,
/// `Closed` and `Aborted` end the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ScpOutput {
    /// Write this PDU to the peer
    Send(Pdu),
    /// A complete command set was reassembled on this context
    Command { context_id: u8, data: Vec<u8> },
    /// A complete data set was reassembled on this context
    Data { context_id: u8, data: Vec<u8> },
    /// The association ended in an orderly fashion; drop the connection
    Closed,
    /// The association was aborted; drop the connection
    Aborted,
}

/// Options for building an SCP state machine.
///
/// A value of this type can be reused for multiple connections.
pub struct ScpMachineOptions {
    /// the AE title of this DICOM node
    ae_title: Cow<'static, str>,
    /// the expected application context name
    application_context_name: Cow<'static, str>,
    /// the list of supported abstract syntaxes
    abstract_syntax_uids: Vec<Cow<'static, str>>,
    /// the list of supported transfer syntaxes
    transfer_syntax_uids: Vec<Cow<'static, str>>,
    /// the maximum PDU length this node is willing to receive
    max_pdu_length: u32,
    /// whether to accept unknown abstract syntaxes
    promiscuous: bool,
    /// the application entity access control policy
    access_control: Box<dyn AccessControl>,
}

impl std::fmt::Debug for ScpMachineOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScpMachineOptions")
            .field("ae_title", &self.ae_title)
            .field("application_context_name", &self.application_context_name)
            .field("abstract_syntax_uids", &self.abstract_syntax_uids)
            .field("transfer_syntax_uids", &self.transfer_syntax_uids)
            .field("max_pdu_length", &self.max_pdu_length)
            .field("promiscuous", &self.promiscuous)
            .finish_non_exhaustive()
    }
}

impl Default for ScpMachineOptions {
    fn default() -> Self {
        ScpMachineOptions {
            ae_title: "THIS-SCP".into(),
            application_context_name: APPLICATION_CONTEXT_NAME.into(),
            abstract_syntax_uids: Vec::new(),
            transfer_syntax_uids: Vec::new(),
            max_pdu_length: DEFAULT_MAX_PDU,
            promiscuous: false,
            access_control: Box::new(AcceptAny),
        }
    }
}

impl ScpMachineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the application entity title referring to this DICOM node.
    ///
    /// The default is `THIS-SCP`.
    pub fn ae_title<T>(mut self, ae_title: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.ae_title = ae_title.into();
        self
    }

    /// Include this abstract syntax
    /// in the list of supported presentation contexts.
    pub fn with_abstract_syntax<T>(mut self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.abstract_syntax_uids
            .push(trim_uid(abstract_syntax_uid.into()));
        self
    }

    /// Include this transfer syntax in the supported set.
    ///
    /// When no transfer syntax is given,
    /// the first syntax proposed for each context is accepted.
    pub fn with_transfer_syntax<T>(mut self, transfer_syntax_uid: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.transfer_syntax_uids
            .push(trim_uid(transfer_syntax_uid.into()));
        self
    }

    /// Override the maximum expected PDU length.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Override promiscuous mode:
    /// whether to accept unknown abstract syntaxes.
    pub fn promiscuous(mut self, promiscuous: bool) -> Self {
        self.promiscuous = promiscuous;
        self
    }

    /// Change the access control policy.
    ///
    /// The default is to accept any requesting node
    /// regardless of the specified AE titles.
    pub fn ae_access_control<P>(mut self, access_control: P) -> Self
    where
        P: AccessControl + 'static,
    {
        self.access_control = Box::new(access_control);
        self
    }

    /// Build the state machine for one incoming connection.
    pub fn build(self) -> ScpMachine {
        ScpMachine {
            options: self,
            state: AssociationState::AwaitingAssociateRq,
            negotiated: None,
            command_buffers: HashMap::new(),
            data_buffers: HashMap::new(),
        }
    }
}

/// The acceptor-side association state machine.
///
/// One instance exists per TCP connection and is exclusively owned
/// by it. Feed decoded PDUs through [`handle_pdu`](Self::handle_pdu)
/// and execute the returned outputs in order.
#[derive(Debug)]
pub struct ScpMachine {
    options: ScpMachineOptions,
    state: AssociationState,
    negotiated: Option<NegotiatedOptions>,
    // reassembly buffers, keyed by presentation context id
    command_buffers: HashMap<u8, Vec<u8>>,
    data_buffers: HashMap<u8, Vec<u8>>,
}

impl ScpMachine {
    /// The current state of the association.
    pub fn state(&self) -> AssociationState {
        self.state
    }

    /// The negotiation outcome, present once `Established` was reached.
    ///
    /// The returned value never mutates after negotiation.
    pub fn negotiated(&self) -> Option<&NegotiatedOptions> {
        self.negotiated.as_ref()
    }

    /// The transfer syntax accorded for the given presentation context,
    /// if that context was accepted.
    pub fn transfer_syntax(&self, context_id: u8) -> Option<&str> {
        self.negotiated
            .as_ref()
            .and_then(|n| n.accepted_context(context_id))
            .map(|pc| pc.transfer_syntax.as_str())
    }

    /// The maximum PDU length the peer is willing to receive.
    pub fn peer_max_pdu_length(&self) -> u32 {
        self.negotiated
            .as_ref()
            .map(|n| n.peer_max_pdu_length)
            .unwrap_or(DEFAULT_MAX_PDU)
    }

    /// The AE title of the peer node, once negotiation has happened.
    pub fn peer_ae_title(&self) -> Option<&str> {
        self.negotiated.as_ref().map(|n| n.peer_ae_title.as_str())
    }

    /// The maximum PDU length this node accepts.
    pub fn acceptor_max_pdu_length(&self) -> u32 {
        self.options.max_pdu_length
    }

    /// The AE title of this node.
    pub fn ae_title(&self) -> &str {
        &self.options.ae_title
    }

    /// Feed one decoded PDU into the machine.
    pub fn handle_pdu(&mut self, pdu: Pdu) -> Vec<ScpOutput> {
        match (self.state, pdu) {
            (AssociationState::AwaitingAssociateRq, Pdu::AssociationRQ(rq)) => {
                self.negotiate(rq)
            }
            (AssociationState::Established, Pdu::PData { data }) => self.reassemble(data),
            (AssociationState::Established, Pdu::ReleaseRQ) => {
                debug!("peer requested release");
                self.state = AssociationState::Closed;
                vec![ScpOutput::Send(Pdu::ReleaseRP), ScpOutput::Closed]
            }
            (AssociationState::Releasing, Pdu::ReleaseRP) => {
                self.state = AssociationState::Closed;
                vec![ScpOutput::Closed]
            }
            (AssociationState::Releasing, Pdu::ReleaseRQ) => {
                // release collision: answer the peer and close
                self.state = AssociationState::Closed;
                vec![ScpOutput::Send(Pdu::ReleaseRP), ScpOutput::Closed]
            }
            (AssociationState::Closed, _) | (AssociationState::Aborted, _) => vec![],
            (_, Pdu::AbortRQ { source }) => {
                warn!("association aborted by peer: {:?}", source);
                self.state = AssociationState::Aborted;
                vec![ScpOutput::Aborted]
            }
            (_, pdu) => {
                warn!(
                    "unexpected {} PDU in state {:?}",
                    pdu.short_description(),
                    self.state
                );
                self.abort_with(AbortRQServiceProviderReason::UnexpectedPdu)
            }
        }
    }

    /// Feed a PDU decode failure into the machine.
    ///
    /// Incomplete input produces no action:
    /// the transport is expected to read more bytes.
    /// Any other failure aborts the association.
    pub fn handle_decode_error(&mut self, error: &DecodeError) -> Vec<ScpOutput> {
        if error.is_incomplete() {
            return vec![];
        }
        warn!("aborting association: {}", error);
        let reason = match error {
            DecodeError::InvalidPduType { .. } => AbortRQServiceProviderReason::UnrecognizedPdu,
            _ => AbortRQServiceProviderReason::InvalidPduParameter,
        };
        self.abort_with(reason)
    }

    /// Signal that the peer has been idle for longer than allowed.
    pub fn handle_timeout(&mut self) -> Vec<ScpOutput> {
        warn!("association timed out in state {:?}", self.state);
        self.abort_with(AbortRQServiceProviderReason::ReasonNotSpecified)
    }

    /// Initiate an orderly release from this side.
    pub fn release(&mut self) -> Vec<ScpOutput> {
        match self.state {
            AssociationState::Established => {
                self.state = AssociationState::Releasing;
                vec![ScpOutput::Send(Pdu::ReleaseRQ)]
            }
            _ => vec![],
        }
    }

    /// Abort the association from this side.
    pub fn abort(&mut self) -> Vec<ScpOutput> {
        self.abort_with(AbortRQServiceProviderReason::ReasonNotSpecified)
    }

    fn abort_with(&mut self, reason: AbortRQServiceProviderReason) -> Vec<ScpOutput> {
        let was_open = !matches!(
            self.state,
            AssociationState::Closed | AssociationState::Aborted
        );
        self.state = AssociationState::Aborted;
        self.command_buffers.clear();
        self.data_buffers.clear();
        if was_open {
            vec![
                ScpOutput::Send(Pdu::AbortRQ {
                    source: AbortRQSource::ServiceProvider(reason),
                }),
                ScpOutput::Aborted,
            ]
        } else {
            vec![ScpOutput::Aborted]
        }
    }

    /// Process an association request:
    /// either transition to `Established` and emit the A-ASSOCIATE-AC,
    /// or emit an A-ASSOCIATE-RJ and close.
    fn negotiate(&mut self, rq: AssociationRQ) -> Vec<ScpOutput> {
        let AssociationRQ {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        } = rq;

        if application_context_name != self.options.application_context_name {
            return self.reject(AssociationRJSource::ServiceUser(
                crate::pdu::AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
            ));
        }

        if let Err(reason) = self.options.access_control.check_access(
            &self.options.ae_title,
            &calling_ae_title,
            &called_ae_title,
        ) {
            return self.reject(AssociationRJSource::ServiceUser(reason));
        }

        // fetch the requested maximum PDU length;
        // 0 means unlimited, so use the largest 32-bit unsigned number
        let peer_max_pdu_length = user_variables
            .iter()
            .find_map(|item| match item {
                UserVariableItem::MaxLength(len) => Some(*len),
                _ => None,
            })
            .unwrap_or(DEFAULT_MAX_PDU);
        let peer_max_pdu_length = if peer_max_pdu_length == 0 {
            u32::MAX
        } else {
            peer_max_pdu_length
        };

        let mut seen_ids = std::collections::HashSet::new();
        let presentation_contexts_negotiated: Vec<_> = presentation_contexts
            .into_iter()
            .map(|pc| {
                let abstract_syntax = trim_uid(Cow::from(pc.abstract_syntax));

                // context ids must be odd and unique within the request
                if pc.id % 2 == 0 || !seen_ids.insert(pc.id) {
                    warn!("dismissing presentation context with bad id {}", pc.id);
                    return PresentationContextNegotiated {
                        id: pc.id,
                        reason: PresentationContextResultReason::NoReason,
                        transfer_syntax: IMPLICIT_VR_LE.to_string(),
                        abstract_syntax: abstract_syntax.to_string(),
                    };
                }

                if !self.options.abstract_syntax_uids.contains(&abstract_syntax)
                    && !self.options.promiscuous
                {
                    return PresentationContextNegotiated {
                        id: pc.id,
                        reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                        transfer_syntax: IMPLICIT_VR_LE.to_string(),
                        abstract_syntax: abstract_syntax.to_string(),
                    };
                }

                let (transfer_syntax, reason) = self
                    .choose_ts(pc.transfer_syntaxes)
                    .map(|ts| (ts, PresentationContextResultReason::Acceptance))
                    .unwrap_or_else(|| {
                        (
                            IMPLICIT_VR_LE.to_string(),
                            PresentationContextResultReason::TransferSyntaxesNotSupported,
                        )
                    });

                PresentationContextNegotiated {
                    id: pc.id,
                    reason,
                    transfer_syntax,
                    abstract_syntax: abstract_syntax.to_string(),
                }
            })
            .collect();

        let ac = Pdu::AssociationAC(AssociationAC {
            protocol_version,
            application_context_name,
            presentation_contexts: presentation_contexts_negotiated
                .iter()
                .map(|pc| PresentationContextResult {
                    id: pc.id,
                    reason: pc.reason,
                    transfer_syntax: pc.transfer_syntax.clone(),
                })
                .collect(),
            calling_ae_title: calling_ae_title.clone(),
            called_ae_title,
            user_variables: vec![
                UserVariableItem::MaxLength(self.options.max_pdu_length),
                UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
                UserVariableItem::ImplementationVersionName(
                    IMPLEMENTATION_VERSION_NAME.to_string(),
                ),
            ],
        });

        debug!(
            "association established with `{}` ({} context(s))",
            calling_ae_title,
            presentation_contexts_negotiated
                .iter()
                .filter(|pc| pc.reason == PresentationContextResultReason::Acceptance)
                .count()
        );

        // the accepted context map is frozen from this point on
        self.negotiated = Some(NegotiatedOptions {
            peer_ae_title: calling_ae_title,
            peer_max_pdu_length,
            presentation_contexts: presentation_contexts_negotiated,
            user_variables,
        });
        self.state = AssociationState::Established;

        vec![ScpOutput::Send(ac)]
    }

    fn reject(&mut self, source: AssociationRJSource) -> Vec<ScpOutput> {
        self.state = AssociationState::Closed;
        vec![
            ScpOutput::Send(Pdu::AssociationRJ(AssociationRJ {
                result: AssociationRJResult::Permanent,
                source,
            })),
            ScpOutput::Closed,
        ]
    }

    /// From a sequence of proposed transfer syntaxes,
    /// choose the first one on the options' list.
    /// An empty options list accepts the first proposed syntax.
    fn choose_ts<I>(&self, it: I) -> Option<String>
    where
        I: IntoIterator<Item = String>,
    {
        let mut it = it.into_iter();
        if self.options.transfer_syntax_uids.is_empty() {
            return it.next();
        }

        it.find(|ts| {
            let trimmed = trim_uid(Cow::from(ts.as_str()));
            self.options
                .transfer_syntax_uids
                .iter()
                .any(|uid| *uid == trimmed)
        })
    }

    /// Append P-Data fragments to the per-context reassembly buffers,
    /// emitting completed command or data set payloads.
    fn reassemble(&mut self, values: Vec<crate::pdu::PDataValue>) -> Vec<ScpOutput> {
        let mut outputs = vec![];
        for value in values {
            let context_id = value.presentation_context_id;
            let accepted = self
                .negotiated
                .as_ref()
                .map(|n| n.accepted_context(context_id).is_some())
                .unwrap_or(false);
            if !accepted {
                warn!(
                    "P-Data fragment on unaccepted presentation context {}",
                    context_id
                );
                return self.abort_with(AbortRQServiceProviderReason::UnexpectedPduParameter);
            }

            match value.value_type {
                PDataValueType::Command => {
                    let buffer = self.command_buffers.entry(context_id).or_default();
                    buffer.extend_from_slice(&value.data);
                    if value.is_last {
                        let data = self
                            .command_buffers
                            .remove(&context_id)
                            .unwrap_or_default();
                        outputs.push(ScpOutput::Command { context_id, data });
                    }
                }
                PDataValueType::Data => {
                    let buffer = self.data_buffers.entry(context_id).or_default();
                    buffer.extend_from_slice(&value.data);
                    if value.is_last {
                        let data = self.data_buffers.remove(&context_id).unwrap_or_default();
                        outputs.push(ScpOutput::Data { context_id, data });
                    }
                }
            }
        }
        outputs
    }
}
