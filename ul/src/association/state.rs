//! Association state machine.
//!
//! [`AssociationState`] holds the phase of one association
//! and the parameters negotiated for it.
//! It performs no I/O:
//! drivers feed it every PDU they send and receive,
//! and act on the events and errors that come back.
use std::collections::BTreeMap;

use snafu::{ensure, Backtrace, ResultExt, Snafu};
use tracing::{debug, warn};

use crate::association::pdata::{self, PDataMessage, Reassembler};
use crate::pdu::{
    reader, AbortRQServiceProviderReason, AbortRQSource, AssociationAC, AssociationRJ,
    AssociationRQ, PDataValue, Pdu, PduType, UserInformationItem, DEFAULT_MAX_PDU,
    MAXIMUM_PDU_SIZE,
};

/// The lifecycle phase of an association.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum AssociationPhase {
    /// No association request was sent or received yet
    Idle,
    /// The association request is awaiting an answer
    Requesting,
    /// The association is ready for data transfer
    Established,
    /// A release was requested and not yet confirmed
    Releasing,
    /// The association was released or rejected
    Closed,
    /// The association was aborted
    Aborted,
}

impl AssociationPhase {
    /// Whether no further PDUs can be exchanged.
    pub fn is_terminal(self) -> bool {
        matches!(self, AssociationPhase::Closed | AssociationPhase::Aborted)
    }
}

/// The part played by this node in the association.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Role {
    /// Sends the association request
    Requestor,
    /// Receives the association request
    Acceptor,
}

/// Which node asked for the association to be released.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ReleaseInitiator {
    Local,
    Peer,
    /// Both nodes sent A-RELEASE-RQ
    Collision,
}

/// A presentation context accepted during negotiation.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct AcceptedContext {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntax: String,
}

/// How a terminated association came to an end.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Termination {
    /// Orderly release
    Released,
    /// The association request was rejected
    Rejected(AssociationRJ),
    /// The peer sent an A-ABORT
    AbortedByPeer(AbortRQSource),
    /// This node aborted the association
    AbortedLocally(AbortRQSource),
    /// The transport failed
    TransportFailed,
}

/// Something which happened as a consequence of a received PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The peer requests an association (acceptor only)
    AssociationRequested(AssociationRQ),
    /// The association was accepted (requestor only)
    Established(AssociationAC),
    /// The association request was rejected (requestor only)
    Rejected(AssociationRJ),
    /// A whole command or data set arrived
    Data(PDataMessage),
    /// The peer asks for the association to be released
    ReleaseRequested,
    /// The peer confirmed the release
    Released,
    /// The peer aborted the association
    Aborted(AbortRQSource),
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// A PDU arrived which is not allowed in the current phase.
    /// The association is aborted.
    #[snafu(display("Unexpected {} while {:?}", pdu_type, phase))]
    UnexpectedPdu {
        phase: AssociationPhase,
        pdu_type: PduType,
        backtrace: Backtrace,
    },

    /// The local node tried to send a PDU
    /// which is not allowed in the current phase
    #[snafu(display("Cannot send {} while {:?}", pdu_type, phase))]
    IllegalSend {
        phase: AssociationPhase,
        pdu_type: PduType,
        backtrace: Backtrace,
    },

    #[snafu(display("Association is already {:?}", phase))]
    Terminated {
        phase: AssociationPhase,
        backtrace: Backtrace,
    },

    #[snafu(display("Presentation context {} was not accepted", id))]
    PresentationContextNotAccepted { id: u8, backtrace: Backtrace },

    #[snafu(display("Presentation context {} was not proposed", id))]
    UnknownPresentationContext { id: u8, backtrace: Backtrace },

    #[snafu(display(
        "Presentation context {} was accepted with transfer syntax {:?}, which was not proposed",
        id,
        transfer_syntax
    ))]
    UnproposedTransferSyntax {
        id: u8,
        transfer_syntax: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Presentation context {} was proposed more than once", id))]
    DuplicatePresentationContextId { id: u8, backtrace: Backtrace },

    #[snafu(display("Could not reassemble P-Data"))]
    Reassembly {
        #[snafu(backtrace)]
        source: pdata::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone)]
struct ProposedContext {
    abstract_syntax: String,
    transfer_syntaxes: Vec<String>,
}

/// The state of a single association,
/// from the point of view of one of its nodes.
#[derive(Debug)]
pub struct AssociationState {
    role: Role,
    phase: AssociationPhase,
    /// maximum PDU length announced by this node, 0 if unlimited
    local_max_pdu_length: u32,
    /// maximum PDU length announced by the peer, 0 if unlimited
    peer_max_pdu_length: u32,
    proposed: BTreeMap<u8, ProposedContext>,
    accepted: BTreeMap<u8, AcceptedContext>,
    release_initiator: Option<ReleaseInitiator>,
    reassembler: Reassembler,
    termination: Option<Termination>,
    pending_abort: Option<AbortRQSource>,
}

impl AssociationState {
    /// Create the state of an association to be requested by this node.
    pub fn requestor() -> Self {
        Self::new(Role::Requestor)
    }

    /// Create the state of an association to be requested by the peer.
    pub fn acceptor() -> Self {
        Self::new(Role::Acceptor)
    }

    /// Refuse incoming commands and data sets
    /// of more than `max_message_length` bytes,
    /// aborting the association instead.
    pub fn with_max_message_length(mut self, max_message_length: usize) -> Self {
        self.reassembler = Reassembler::with_max_message_length(max_message_length);
        self
    }

    fn new(role: Role) -> Self {
        AssociationState {
            role,
            phase: AssociationPhase::Idle,
            local_max_pdu_length: DEFAULT_MAX_PDU,
            peer_max_pdu_length: DEFAULT_MAX_PDU,
            proposed: BTreeMap::new(),
            accepted: BTreeMap::new(),
            release_initiator: None,
            reassembler: Reassembler::new(),
            termination: None,
            pending_abort: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> AssociationPhase {
        self.phase
    }

    /// The reason for the association to have ended,
    /// if it did.
    pub fn termination(&self) -> Option<&Termination> {
        self.termination.as_ref()
    }

    pub fn release_initiator(&self) -> Option<ReleaseInitiator> {
        self.release_initiator
    }

    /// The maximum PDU length that this node announced it can receive.
    /// Zero means unlimited.
    pub fn local_max_pdu_length(&self) -> u32 {
        self.local_max_pdu_length
    }

    /// The maximum PDU length that the peer announced it can receive.
    /// Zero means unlimited.
    pub fn peer_max_pdu_length(&self) -> u32 {
        self.peer_max_pdu_length
    }

    /// The maximum PDU length in effect for the association,
    /// which is the lowest of the limits announced by both nodes.
    pub fn max_pdu_length(&self) -> u32 {
        match (self.local_max_pdu_length, self.peer_max_pdu_length) {
            (0, 0) => MAXIMUM_PDU_SIZE,
            (0, len) | (len, 0) => len,
            (local, peer) => local.min(peer),
        }
    }

    /// The presentation contexts accepted so far, by ID.
    pub fn accepted_contexts(&self) -> impl Iterator<Item = &AcceptedContext> + '_ {
        self.accepted.values()
    }

    pub fn accepted_context(&self, id: u8) -> Option<&AcceptedContext> {
        self.accepted.get(&id)
    }

    /// Take the A-ABORT which this node must send
    /// after the state machine aborted the association by itself.
    pub fn take_pending_abort(&mut self) -> Option<Pdu> {
        self.pending_abort
            .take()
            .map(|source| Pdu::AbortRQ { source })
    }

    fn transition(&mut self, phase: AssociationPhase) {
        if self.phase != phase {
            debug!("Association {:?}: {:?} -> {:?}", self.role, self.phase, phase);
        }
        self.phase = phase;
    }

    fn terminate(&mut self, phase: AssociationPhase, termination: Termination) {
        self.transition(phase);
        self.reassembler.reset();
        self.termination = Some(termination);
    }

    /// Abort the association on behalf of the state machine,
    /// leaving an A-ABORT to be sent.
    fn force_abort(&mut self, reason: AbortRQServiceProviderReason) {
        let source = AbortRQSource::ServiceProvider(reason);
        self.pending_abort = Some(source.clone());
        self.terminate(AssociationPhase::Aborted, Termination::AbortedLocally(source));
    }

    /// Record a PDU about to be sent by this node.
    ///
    /// A PDU which is not allowed in the current phase
    /// is refused, and the state is left untouched.
    pub fn send(&mut self, pdu: &Pdu) -> Result<()> {
        use AssociationPhase::*;

        let phase = self.phase;
        ensure!(!phase.is_terminal(), TerminatedSnafu { phase });

        match (phase, self.role, pdu) {
            (_, _, Pdu::AbortRQ { source }) => {
                self.terminate(Aborted, Termination::AbortedLocally(source.clone()));
            }
            (Idle, Role::Requestor, Pdu::AssociationRQ(rq)) => {
                self.record_proposed(&rq)?;
                self.local_max_pdu_length = announced_max_pdu_length(&rq.user_information);
                self.transition(Requesting);
            }
            (Requesting, Role::Acceptor, Pdu::AssociationAC(ac)) => {
                let mut accepted = BTreeMap::new();
                for pc in &ac.presentation_contexts {
                    let proposed = self
                        .proposed
                        .get(&pc.id())
                        .ok_or_else(|| UnknownPresentationContextSnafu { id: pc.id() }.build())?;
                    if let (true, Some(ts)) = (pc.is_accepted(), pc.transfer_syntax()) {
                        accepted.insert(
                            pc.id(),
                            AcceptedContext {
                                id: pc.id(),
                                abstract_syntax: proposed.abstract_syntax.clone(),
                                transfer_syntax: ts.to_string(),
                            },
                        );
                    }
                }
                self.accepted = accepted;
                self.local_max_pdu_length = announced_max_pdu_length(&ac.user_information);
                self.transition(Established);
                self.log_negotiated();
            }
            (Requesting, Role::Acceptor, Pdu::AssociationRJ(rj)) => {
                self.terminate(Closed, Termination::Rejected(rj.clone()));
            }
            (Established, _, Pdu::PData { data })
            | (Releasing, _, Pdu::PData { data })
                if phase == Established
                    || self.release_initiator == Some(ReleaseInitiator::Peer) =>
            {
                for value in data {
                    let id = value.presentation_context_id;
                    ensure!(
                        self.accepted.contains_key(&id),
                        PresentationContextNotAcceptedSnafu { id }
                    );
                }
            }
            (Established, _, Pdu::ReleaseRQ) => {
                self.release_initiator = Some(ReleaseInitiator::Local);
                self.transition(Releasing);
            }
            (Releasing, _, Pdu::ReleaseRP) => match self.release_initiator {
                Some(ReleaseInitiator::Peer) => {
                    self.terminate(Closed, Termination::Released);
                }
                Some(ReleaseInitiator::Collision) => {
                    debug!("Release collision: waiting for the peer's A-RELEASE-RP");
                }
                _ => {
                    return IllegalSendSnafu {
                        phase,
                        pdu_type: pdu.pdu_type(),
                    }
                    .fail();
                }
            },
            _ => {
                return IllegalSendSnafu {
                    phase,
                    pdu_type: pdu.pdu_type(),
                }
                .fail();
            }
        }
        Ok(())
    }

    /// Process a PDU received from the peer.
    ///
    /// A PDU which is not allowed in the current phase,
    /// or which refers to presentation contexts that were not accepted,
    /// aborts the association.
    /// The A-ABORT to send back is then available
    /// through [`take_pending_abort`](Self::take_pending_abort).
    pub fn receive(&mut self, pdu: Pdu) -> Result<Vec<Event>> {
        let phase = self.phase;
        ensure!(!phase.is_terminal(), TerminatedSnafu { phase });

        let result = self.receive_impl(pdu);
        if let Err(e) = &result {
            let reason = match e {
                Error::UnexpectedPdu { .. } => AbortRQServiceProviderReason::UnexpectedPdu,
                _ => AbortRQServiceProviderReason::InvalidPduParameter,
            };
            warn!("Aborting association: {}", e);
            self.force_abort(reason);
        }
        result
    }

    fn receive_impl(&mut self, pdu: Pdu) -> Result<Vec<Event>> {
        use AssociationPhase::*;

        let phase = self.phase;
        let pdu_type = pdu.pdu_type();
        let events = match (phase, self.role, pdu) {
            (_, _, Pdu::AbortRQ { source }) => {
                self.terminate(Aborted, Termination::AbortedByPeer(source.clone()));
                vec![Event::Aborted(source)]
            }
            (Idle, Role::Acceptor, Pdu::AssociationRQ(rq)) => {
                self.record_proposed(&rq)?;
                self.peer_max_pdu_length = announced_max_pdu_length(&rq.user_information);
                self.transition(Requesting);
                vec![Event::AssociationRequested(rq)]
            }
            (Requesting, Role::Requestor, Pdu::AssociationAC(ac)) => {
                let mut accepted = BTreeMap::new();
                for pc in &ac.presentation_contexts {
                    let proposed = self
                        .proposed
                        .get(&pc.id())
                        .ok_or_else(|| UnknownPresentationContextSnafu { id: pc.id() }.build())?;
                    if !pc.is_accepted() {
                        continue;
                    }
                    // the answer may only pick one of the proposed transfer syntaxes
                    let ts = pc
                        .transfer_syntax()
                        .filter(|ts| proposed.transfer_syntaxes.iter().any(|p| p == ts))
                        .ok_or_else(|| {
                            UnproposedTransferSyntaxSnafu {
                                id: pc.id(),
                                transfer_syntax: pc.transfer_syntax().unwrap_or_default(),
                            }
                            .build()
                        })?;
                    accepted.insert(
                        pc.id(),
                        AcceptedContext {
                            id: pc.id(),
                            abstract_syntax: proposed.abstract_syntax.clone(),
                            transfer_syntax: ts.to_string(),
                        },
                    );
                }
                self.accepted = accepted;
                self.peer_max_pdu_length = announced_max_pdu_length(&ac.user_information);
                self.transition(Established);
                self.log_negotiated();
                vec![Event::Established(ac)]
            }
            (Requesting, Role::Requestor, Pdu::AssociationRJ(rj)) => {
                debug!("Association rejected: {}", rj.source);
                self.terminate(Closed, Termination::Rejected(rj.clone()));
                vec![Event::Rejected(rj)]
            }
            (Established, _, Pdu::PData { data })
            | (Releasing, _, Pdu::PData { data })
                if phase == Established
                    || matches!(
                        self.release_initiator,
                        Some(ReleaseInitiator::Local | ReleaseInitiator::Collision)
                    ) =>
            {
                let mut events = vec![];
                for value in data {
                    if let Some(message) = self.reassemble(value)? {
                        events.push(Event::Data(message));
                    }
                }
                events
            }
            (Established, _, Pdu::ReleaseRQ) => {
                self.release_initiator = Some(ReleaseInitiator::Peer);
                self.transition(Releasing);
                vec![Event::ReleaseRequested]
            }
            (Releasing, _, Pdu::ReleaseRQ)
                if self.release_initiator == Some(ReleaseInitiator::Local) =>
            {
                warn!("Release collision: both nodes requested a release");
                self.release_initiator = Some(ReleaseInitiator::Collision);
                vec![Event::ReleaseRequested]
            }
            (Releasing, _, Pdu::ReleaseRP)
                if matches!(
                    self.release_initiator,
                    Some(ReleaseInitiator::Local | ReleaseInitiator::Collision)
                ) =>
            {
                self.terminate(Closed, Termination::Released);
                vec![Event::Released]
            }
            _ => {
                return UnexpectedPduSnafu { phase, pdu_type }.fail();
            }
        };
        Ok(events)
    }

    fn record_proposed(&mut self, rq: &AssociationRQ) -> Result<()> {
        let mut proposed = BTreeMap::new();
        for pc in &rq.presentation_contexts {
            let previous = proposed.insert(
                pc.id(),
                ProposedContext {
                    abstract_syntax: pc.abstract_syntax().unwrap_or_default().to_string(),
                    transfer_syntaxes: pc.transfer_syntaxes().map(String::from).collect(),
                },
            );
            ensure!(
                previous.is_none(),
                DuplicatePresentationContextIdSnafu { id: pc.id() }
            );
        }
        self.proposed = proposed;
        Ok(())
    }

    fn reassemble(&mut self, value: PDataValue) -> Result<Option<PDataMessage>> {
        let id = value.presentation_context_id;
        ensure!(
            self.accepted.contains_key(&id),
            PresentationContextNotAcceptedSnafu { id }
        );
        self.reassembler.push(value).context(ReassemblySnafu)
    }

    /// Abort the association from this node.
    ///
    /// Returns the A-ABORT PDU to send,
    /// or `None` if the association had already ended.
    pub fn abort(&mut self, source: AbortRQSource) -> Option<Pdu> {
        if self.phase.is_terminal() {
            return None;
        }
        self.terminate(
            AssociationPhase::Aborted,
            Termination::AbortedLocally(source.clone()),
        );
        Some(Pdu::AbortRQ { source })
    }

    /// Abort the association because an incoming PDU could not be decoded.
    ///
    /// Returns the A-ABORT PDU to send,
    /// or `None` if the association had already ended.
    pub fn decode_failed(&mut self, error: &reader::Error) -> Option<Pdu> {
        if self.phase.is_terminal() {
            return None;
        }
        warn!("Aborting association on malformed PDU: {}", error);
        let reason = match error {
            reader::Error::UnknownPduType { .. } => AbortRQServiceProviderReason::UnrecognizedPdu,
            _ => AbortRQServiceProviderReason::InvalidPduParameter,
        };
        self.force_abort(reason);
        self.take_pending_abort()
    }

    /// Mark the association as aborted because the transport failed.
    pub fn transport_failed(&mut self) {
        if self.phase.is_terminal() {
            return;
        }
        self.pending_abort = None;
        self.terminate(AssociationPhase::Aborted, Termination::TransportFailed);
    }

    fn log_negotiated(&self) {
        debug!(
            "Association established with max PDU length {} ({} accepted presentation contexts)",
            self.max_pdu_length(),
            self.accepted.len()
        );
        for pc in self.accepted.values() {
            debug!(
                "Presentation context {}: {} with {}",
                pc.id, pc.abstract_syntax, pc.transfer_syntax
            );
        }
    }
}

/// The maximum PDU length announced in user information,
/// or the default for those who announce none.
fn announced_max_pdu_length(user_information: &UserInformationItem) -> u32 {
    user_information.max_length().unwrap_or(DEFAULT_MAX_PDU)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{
        AssociationRJResult, AssociationRJServiceUserReason, AssociationRJSource,
        PDataValueType, PresentationContextItem, PresentationContextResultReason, SubItem,
        DICOM_APPLICATION_CONTEXT_NAME, PROTOCOL_VERSION,
    };
    use matches::assert_matches;

    const VERIFICATION: &str = "1.2.840.10008.1.1";
    const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
    const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

    fn rq(max_length: u32) -> AssociationRQ {
        AssociationRQ {
            protocol_version: PROTOCOL_VERSION,
            calling_ae_title: "SCU".to_string(),
            called_ae_title: "SCP".to_string(),
            application_context_name: DICOM_APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: vec![
                PresentationContextItem::request(1, VERIFICATION, [IMPLICIT_VR_LE, EXPLICIT_VR_LE])
                    .unwrap(),
                PresentationContextItem::request(3, "1.2.3.4", [IMPLICIT_VR_LE]).unwrap(),
            ],
            user_information: UserInformationItem::new(vec![SubItem::MaximumLength(max_length)]),
            unsupported_items: vec![],
        }
    }

    fn ac(max_length: u32) -> AssociationAC {
        AssociationAC {
            protocol_version: PROTOCOL_VERSION,
            calling_ae_title: "SCU".to_string(),
            called_ae_title: "SCP".to_string(),
            application_context_name: DICOM_APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: vec![
                PresentationContextItem::response(
                    1,
                    PresentationContextResultReason::Acceptance,
                    Some(EXPLICIT_VR_LE.to_string()),
                )
                .unwrap(),
                PresentationContextItem::response(
                    3,
                    PresentationContextResultReason::AbstractSyntaxNotSupported,
                    None,
                )
                .unwrap(),
            ],
            user_information: UserInformationItem::new(vec![SubItem::MaximumLength(max_length)]),
            unsupported_items: vec![],
        }
    }

    fn pdata(id: u8, is_last: bool, data: &[u8]) -> Pdu {
        Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: id,
                value_type: PDataValueType::Data,
                is_last,
                data: data.to_vec(),
            }],
        }
    }

    fn established_requestor() -> AssociationState {
        let mut state = AssociationState::requestor();
        state.send(&Pdu::AssociationRQ(rq(16_384))).unwrap();
        state.receive(Pdu::AssociationAC(ac(32_768))).unwrap();
        state
    }

    #[test]
    fn oversized_message_aborts() {
        let mut state = AssociationState::requestor().with_max_message_length(4);
        state.send(&Pdu::AssociationRQ(rq(16_384))).unwrap();
        state.receive(Pdu::AssociationAC(ac(32_768))).unwrap();

        assert!(state.receive(pdata(1, false, &[1, 2, 3])).unwrap().is_empty());
        assert_matches!(
            state.receive(pdata(1, false, &[4, 5])),
            Err(Error::Reassembly {
                source: pdata::Error::MessageTooLarge {
                    length: 5,
                    max_message_length: 4,
                    ..
                },
            })
        );
        assert_eq!(state.phase(), AssociationPhase::Aborted);
        assert_eq!(
            state.take_pending_abort(),
            Some(Pdu::AbortRQ {
                source: AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::InvalidPduParameter
                )
            })
        );
    }

    #[test]
    fn requestor_lifecycle() {
        let mut state = AssociationState::requestor();
        assert_eq!(state.phase(), AssociationPhase::Idle);

        state.send(&Pdu::AssociationRQ(rq(16_384))).unwrap();
        assert_eq!(state.phase(), AssociationPhase::Requesting);

        let events = state.receive(Pdu::AssociationAC(ac(32_768))).unwrap();
        assert_matches!(&events[..], [Event::Established(_)]);
        assert_eq!(state.phase(), AssociationPhase::Established);
        assert_eq!(state.max_pdu_length(), 16_384);

        // context 1 accepted with the second proposed transfer syntax
        let pc = state.accepted_context(1).unwrap();
        assert_eq!(pc.abstract_syntax, VERIFICATION);
        assert_eq!(pc.transfer_syntax, EXPLICIT_VR_LE);
        assert!(state.accepted_context(3).is_none());

        state.send(&pdata(1, true, &[1, 2, 3])).unwrap();
        assert_matches!(
            state.send(&pdata(3, true, &[1, 2, 3])),
            Err(Error::PresentationContextNotAccepted { id: 3, .. })
        );
        assert_eq!(state.phase(), AssociationPhase::Established);

        let events = state.receive(pdata(1, false, &[1])).unwrap();
        assert!(events.is_empty());
        let events = state.receive(pdata(1, true, &[2])).unwrap();
        assert_matches!(&events[..], [Event::Data(message)] if message.data[..] == [1u8, 2]);

        state.send(&Pdu::ReleaseRQ).unwrap();
        assert_eq!(state.phase(), AssociationPhase::Releasing);
        assert_eq!(state.release_initiator(), Some(ReleaseInitiator::Local));

        // the peer may still send data before confirming
        let events = state.receive(pdata(1, true, &[9])).unwrap();
        assert_eq!(events.len(), 1);

        let events = state.receive(Pdu::ReleaseRP).unwrap();
        assert_eq!(events, vec![Event::Released]);
        assert_eq!(state.phase(), AssociationPhase::Closed);
        assert_eq!(state.termination(), Some(&Termination::Released));
    }

    #[test]
    fn acceptor_lifecycle() {
        let mut state = AssociationState::acceptor();
        let events = state.receive(Pdu::AssociationRQ(rq(0))).unwrap();
        assert_matches!(&events[..], [Event::AssociationRequested(_)]);
        assert_eq!(state.phase(), AssociationPhase::Requesting);

        state.send(&Pdu::AssociationAC(ac(16_384))).unwrap();
        assert_eq!(state.phase(), AssociationPhase::Established);
        // the requestor accepts PDUs of any length
        assert_eq!(state.max_pdu_length(), 16_384);

        let events = state.receive(Pdu::ReleaseRQ).unwrap();
        assert_eq!(events, vec![Event::ReleaseRequested]);
        // data may still be sent before confirming
        state.send(&pdata(1, true, &[0])).unwrap();
        state.send(&Pdu::ReleaseRP).unwrap();
        assert_eq!(state.phase(), AssociationPhase::Closed);
    }

    #[test]
    fn unlimited_on_both_sides_is_the_largest_pdu() {
        let mut state = AssociationState::requestor();
        state.send(&Pdu::AssociationRQ(rq(0))).unwrap();
        state.receive(Pdu::AssociationAC(ac(0))).unwrap();
        assert_eq!(state.max_pdu_length(), MAXIMUM_PDU_SIZE);
    }

    #[test]
    fn data_while_requesting_aborts() {
        let mut state = AssociationState::requestor();
        state.send(&Pdu::AssociationRQ(rq(16_384))).unwrap();

        assert_matches!(
            state.receive(pdata(1, true, &[0])),
            Err(Error::UnexpectedPdu {
                phase: AssociationPhase::Requesting,
                pdu_type: PduType::PData,
                ..
            })
        );
        assert_eq!(state.phase(), AssociationPhase::Aborted);
        let expected_source =
            AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu);
        assert_eq!(
            state.termination(),
            Some(&Termination::AbortedLocally(expected_source.clone()))
        );
        assert_eq!(
            state.take_pending_abort(),
            Some(Pdu::AbortRQ {
                source: expected_source
            })
        );
        assert_eq!(state.take_pending_abort(), None);

        // nothing else goes through
        assert_matches!(
            state.receive(Pdu::ReleaseRP),
            Err(Error::Terminated { .. })
        );
        assert_matches!(state.send(&Pdu::ReleaseRQ), Err(Error::Terminated { .. }));
    }

    #[test]
    fn illegal_send_keeps_the_phase() {
        let mut state = AssociationState::requestor();
        assert_matches!(
            state.send(&pdata(1, true, &[0])),
            Err(Error::IllegalSend {
                phase: AssociationPhase::Idle,
                ..
            })
        );
        assert_eq!(state.phase(), AssociationPhase::Idle);
        assert_matches!(
            state.send(&Pdu::AssociationAC(ac(0))),
            Err(Error::IllegalSend { .. })
        );
        assert_eq!(state.phase(), AssociationPhase::Idle);
    }

    #[test]
    fn rejection_closes() {
        let mut state = AssociationState::requestor();
        state.send(&Pdu::AssociationRQ(rq(16_384))).unwrap();
        let rj = AssociationRJ {
            result: AssociationRJResult::Permanent,
            source: AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAETitleNotRecognized,
            ),
        };
        let events = state.receive(Pdu::AssociationRJ(rj.clone())).unwrap();
        assert_eq!(events, vec![Event::Rejected(rj.clone())]);
        assert_eq!(state.phase(), AssociationPhase::Closed);
        assert_eq!(state.termination(), Some(&Termination::Rejected(rj)));
    }

    #[test]
    fn peer_abort() {
        let mut state = established_requestor();
        let events = state
            .receive(Pdu::AbortRQ {
                source: AbortRQSource::ServiceUser,
            })
            .unwrap();
        assert_eq!(events, vec![Event::Aborted(AbortRQSource::ServiceUser)]);
        assert_eq!(state.phase(), AssociationPhase::Aborted);
        assert_eq!(state.take_pending_abort(), None);
    }

    #[test]
    fn data_on_unaccepted_context_aborts() {
        let mut state = established_requestor();
        assert_matches!(
            state.receive(pdata(3, true, &[0])),
            Err(Error::PresentationContextNotAccepted { id: 3, .. })
        );
        assert_eq!(state.phase(), AssociationPhase::Aborted);
        assert_eq!(
            state.take_pending_abort(),
            Some(Pdu::AbortRQ {
                source: AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::InvalidPduParameter
                )
            })
        );
    }

    #[test]
    fn release_collision() {
        let mut state = established_requestor();
        state.send(&Pdu::ReleaseRQ).unwrap();
        let events = state.receive(Pdu::ReleaseRQ).unwrap();
        assert_eq!(events, vec![Event::ReleaseRequested]);
        assert_eq!(state.phase(), AssociationPhase::Releasing);
        assert_eq!(state.release_initiator(), Some(ReleaseInitiator::Collision));

        state.send(&Pdu::ReleaseRP).unwrap();
        assert_eq!(state.phase(), AssociationPhase::Releasing);
        state.receive(Pdu::ReleaseRP).unwrap();
        assert_eq!(state.phase(), AssociationPhase::Closed);
    }

    #[test]
    fn local_abort_and_transport_failure() {
        let mut state = established_requestor();
        assert_eq!(
            state.abort(AbortRQSource::ServiceUser),
            Some(Pdu::AbortRQ {
                source: AbortRQSource::ServiceUser
            })
        );
        assert_eq!(state.phase(), AssociationPhase::Aborted);
        assert_eq!(state.abort(AbortRQSource::ServiceUser), None);

        let mut state = established_requestor();
        state.transport_failed();
        assert_eq!(state.phase(), AssociationPhase::Aborted);
        assert_eq!(state.termination(), Some(&Termination::TransportFailed));
    }

    #[test]
    fn malformed_pdu_aborts() {
        let mut state = established_requestor();
        let error = crate::pdu::read_pdu(&mut &[0x0A, 0, 0, 0, 0, 0][..], 16_384).unwrap_err();
        assert_eq!(
            state.decode_failed(&error),
            Some(Pdu::AbortRQ {
                source: AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::UnrecognizedPdu
                )
            })
        );
        assert_eq!(state.phase(), AssociationPhase::Aborted);
    }
}
