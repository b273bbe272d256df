//! DICOM association module
//!
//! This module contains utilities for establishing associations
//! between DICOM nodes and exchanging data through them.
//!
//! The protocol logic is in [`state`]:
//! a state machine which performs no I/O,
//! fed with the PDUs sent and received.
//! On top of it, [`Association`] drives one association
//! over any blocking byte stream.
//!
//! As an association requester, often as a service class user (SCU),
//! a new association can be started
//! via the [`ClientAssociationOptions`][1] type.
//! The minimum required properties are the proposed presentation contexts
//! and a connected stream to the target node.
//!
//! As an association acceptor,
//! usually taking the role of a service class provider (SCP),
//! a newly accepted [TCP stream][2] can be passed to
//! a previously prepared [`ServerAssociationOptions`][3].
//!
//! [1]: crate::association::client::ClientAssociationOptions
//! [2]: std::net::TcpStream
//! [3]: crate::association::server::ServerAssociationOptions
use std::collections::VecDeque;
use std::io::{Read, Write};

use snafu::{Backtrace, ResultExt, Snafu};
use tracing::{debug, warn};

use crate::pdu::{
    self, encode_pdu, read_pdu, AbortRQSource, AssociationRJ, PDataValueType, Pdu,
    UserInformationItem, MAXIMUM_PDU_SIZE,
};

pub mod client;
pub mod negotiation;
#[cfg(feature = "async")]
pub mod nonblocking;
pub mod pdata;
pub mod server;
pub mod state;

pub use client::ClientAssociationOptions;
pub use negotiation::{
    AcceptAny, AcceptCalledAeTitle, AcceptListed, AccessControl, PresentationContextPolicy,
};
#[cfg(feature = "async")]
pub use nonblocking::AsyncAssociation;
pub use pdata::{fragment, PDataMessage, Reassembler};
pub use server::ServerAssociationOptions;
pub use state::{
    AcceptedContext, AssociationPhase, AssociationState, Event, Role, Termination,
};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// missing abstract syntax to begin negotiation
    MissingAbstractSyntax { backtrace: Backtrace },

    #[snafu(display("too many presentation contexts ({}), at most 128 are allowed", count))]
    TooManyPresentationContexts { count: usize, backtrace: Backtrace },

    #[snafu(display("invalid maximum PDU length {}", max_pdu_length))]
    InvalidMaxPdu {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    /// invalid presentation context
    InvalidPresentationContext {
        #[snafu(backtrace)]
        source: pdu::reader::Error,
    },

    /// failed to send PDU message
    #[non_exhaustive]
    Send {
        #[snafu(backtrace)]
        source: pdu::writer::Error,
    },

    /// failed to send PDU message on wire
    #[non_exhaustive]
    WireSend {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// failed to receive PDU message from wire
    #[non_exhaustive]
    WireReceive {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// failed to receive PDU message
    #[non_exhaustive]
    Receive {
        #[snafu(backtrace)]
        source: pdu::reader::Error,
    },

    /// the peer closed the connection
    ConnectionClosed { backtrace: Backtrace },

    /// association protocol violation
    Protocol {
        #[snafu(backtrace)]
        source: state::Error,
    },

    /// could not split data into P-Data fragments
    Fragment {
        #[snafu(backtrace)]
        source: pdata::Error,
    },

    #[snafu(display("association rejected: {}", association_rj.source))]
    Rejected {
        association_rj: AssociationRJ,
        backtrace: Backtrace,
    },

    /// no presentation contexts accepted by the peer
    NoAcceptedPresentationContexts { backtrace: Backtrace },

    #[snafu(display("protocol version mismatch: expected {}, got {}", expected, got))]
    ProtocolVersionMismatch {
        expected: u16,
        got: u16,
        backtrace: Backtrace,
    },

    /// the first PDU received was not an association request
    NoAssociationRequest { backtrace: Backtrace },

    #[snafu(display("association aborted: {}", abort_source))]
    Aborted {
        abort_source: AbortRQSource,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Something received from an established association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// A whole command or data set
    Data(PDataMessage),
    /// The association was released by the peer,
    /// and the release was confirmed
    Released,
    /// The peer aborted the association
    Aborted(AbortRQSource),
}

/// An association between this node and a peer,
/// driven over a blocking byte stream.
///
/// Values of this type are created by
/// [`ClientAssociationOptions::establish`]
/// or [`ServerAssociationOptions::establish`].
///
/// The association is not released when dropped:
/// call [`release`](Association::release) or [`abort`](Association::abort)
/// before closing the stream.
#[derive(Debug)]
pub struct Association<S> {
    stream: S,
    state: AssociationState,
    /// The application entity title of the other DICOM node
    peer_ae_title: String,
    /// User information sent by the other DICOM node
    peer_user_information: UserInformationItem,
    /// Messages received but not yet handed over
    pending: VecDeque<PDataMessage>,
    /// How the association ended, once the pending messages are handed over
    end: Option<Received>,
}

impl<S> Association<S>
where
    S: Read + Write,
{
    pub(crate) fn new(stream: S, state: AssociationState) -> Self {
        Association {
            stream,
            state,
            peer_ae_title: String::new(),
            peer_user_information: UserInformationItem::default(),
            pending: VecDeque::new(),
            end: None,
        }
    }

    /// The protocol state of this association.
    pub fn state(&self) -> &AssociationState {
        &self.state
    }

    /// Obtain a view of the accepted presentation contexts.
    pub fn presentation_contexts(&self) -> impl Iterator<Item = &AcceptedContext> + '_ {
        self.state.accepted_contexts()
    }

    /// The maximum PDU length in effect for this association.
    pub fn max_pdu_length(&self) -> u32 {
        self.state.max_pdu_length()
    }

    /// Obtain the remote DICOM node's application entity title.
    pub fn peer_ae_title(&self) -> &str {
        &self.peer_ae_title
    }

    /// The user information items sent by the remote DICOM node.
    pub fn peer_user_information(&self) -> &UserInformationItem {
        &self.peer_user_information
    }

    /// Retrieve the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Send a command or data set through the given presentation context,
    /// split into as many P-DATA-TF PDUs as necessary.
    pub fn send(&mut self, presentation_context_id: u8, data: &[u8], is_command: bool) -> Result<()> {
        let value_type = if is_command {
            PDataValueType::Command
        } else {
            PDataValueType::Data
        };
        let fragments = pdata::fragment(
            presentation_context_id,
            value_type,
            data,
            self.state.max_pdu_length(),
        )
        .context(FragmentSnafu)?;
        for pdu in fragments {
            self.send_pdu(&pdu)?;
        }
        Ok(())
    }

    /// Wait for the next command or data set,
    /// or for the association to end.
    ///
    /// A release requested by the peer is confirmed automatically,
    /// and reported after any messages received before it.
    pub fn receive(&mut self) -> Result<Received> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Ok(Received::Data(message));
            }
            if let Some(end) = self.end.take() {
                return Ok(end);
            }

            for event in self.receive_events()? {
                match event {
                    Event::Data(message) => self.pending.push_back(message),
                    Event::ReleaseRequested => {
                        debug!("Release requested by {}", self.peer_ae_title);
                        self.send_pdu(&Pdu::ReleaseRP)?;
                        self.end = Some(Received::Released);
                    }
                    Event::Released => self.end = Some(Received::Released),
                    Event::Aborted(source) => self.end = Some(Received::Aborted(source)),
                    Event::AssociationRequested(_)
                    | Event::Established(_)
                    | Event::Rejected(_) => {}
                }
            }
        }
    }

    /// Gracefully release the association,
    /// waiting for the peer's confirmation.
    ///
    /// Data still arriving from the peer in the meantime is discarded.
    pub fn release(&mut self) -> Result<()> {
        self.send_pdu(&Pdu::ReleaseRQ)?;
        loop {
            for event in self.receive_events()? {
                match event {
                    Event::Released => return Ok(()),
                    Event::ReleaseRequested => {
                        // release collision
                        self.send_pdu(&Pdu::ReleaseRP)?;
                    }
                    Event::Aborted(abort_source) => {
                        return AbortedSnafu { abort_source }.fail();
                    }
                    Event::Data(message) => {
                        warn!(
                            "Discarding {} bytes received on presentation context {} during release",
                            message.data.len(),
                            message.presentation_context_id
                        );
                    }
                    Event::AssociationRequested(_)
                    | Event::Established(_)
                    | Event::Rejected(_) => {}
                }
            }
        }
    }

    /// Abort the association.
    ///
    /// Nothing is sent if the association had already ended.
    pub fn abort(&mut self) -> Result<()> {
        match self.state.abort(AbortRQSource::ServiceUser) {
            Some(pdu) => self.write_pdu(&pdu),
            None => Ok(()),
        }
    }

    /// Send a single PDU to the peer,
    /// after validating it against the association state.
    pub fn send_pdu(&mut self, pdu: &Pdu) -> Result<()> {
        let bytes = encode_pdu(pdu).context(SendSnafu)?;
        self.state.send(pdu).context(ProtocolSnafu)?;
        self.write_bytes(&bytes)
    }

    /// Write a PDU with no state validation.
    fn write_pdu(&mut self, pdu: &Pdu) -> Result<()> {
        let bytes = encode_pdu(pdu).context(SendSnafu)?;
        self.write_bytes(&bytes)
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let result = self
            .stream
            .write_all(bytes)
            .and_then(|_| self.stream.flush());
        if result.is_err() {
            self.state.transport_failed();
        }
        result.context(WireSendSnafu)
    }

    /// Read a single PDU from the peer,
    /// without feeding it to the association state.
    fn receive_pdu(&mut self) -> Result<Pdu> {
        let max_pdu_length = match self.state.local_max_pdu_length() {
            0 => MAXIMUM_PDU_SIZE,
            len => len,
        };
        match read_pdu(&mut self.stream, max_pdu_length) {
            Ok(pdu) => Ok(pdu),
            Err(pdu::reader::Error::NoPduAvailable { .. }) => {
                self.state.transport_failed();
                ConnectionClosedSnafu.fail()
            }
            Err(e @ pdu::reader::Error::ReadPdu { .. })
            | Err(e @ pdu::reader::Error::ReadPduField { .. }) => {
                self.state.transport_failed();
                Err(e).context(ReceiveSnafu)
            }
            Err(e) => {
                if let Some(abort) = self.state.decode_failed(&e) {
                    // the association is over either way
                    if let Err(send_error) = self.write_pdu(&abort) {
                        warn!("Failed to send A-ABORT: {}", send_error);
                    }
                }
                Err(e).context(ReceiveSnafu)
            }
        }
    }

    /// Receive one PDU and feed it to the association state.
    pub(crate) fn receive_events(&mut self) -> Result<Vec<Event>> {
        let pdu = self.receive_pdu()?;
        match self.state.receive(pdu) {
            Ok(events) => Ok(events),
            Err(e) => {
                if let Some(abort) = self.state.take_pending_abort() {
                    if let Err(send_error) = self.write_pdu(&abort) {
                        warn!("Failed to send A-ABORT: {}", send_error);
                    }
                }
                Err(e).context(ProtocolSnafu)
            }
        }
    }
}
