//! Asynchronous associations, driven over tokio streams.
//!
//! The protocol logic is the same [`AssociationState`]
//! as in the blocking [`Association`](super::Association);
//! only the I/O differs.
use std::collections::VecDeque;

use snafu::ResultExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::{
    association::{
        AbortedSnafu, AcceptedContext, AccessControl, AssociationState, ClientAssociationOptions,
        ConnectionClosedSnafu, Event, FragmentSnafu, NoAcceptedPresentationContextsSnafu,
        NoAssociationRequestSnafu, PresentationContextPolicy, ProtocolSnafu,
        ProtocolVersionMismatchSnafu, Received, ReceiveSnafu, RejectedSnafu, Result, SendSnafu,
        ServerAssociationOptions, WireReceiveSnafu, WireSendSnafu,
    },
    pdu::{
        check_pdu_header, encode_pdu, read_pdu_body, AbortRQServiceProviderReason,
        AbortRQSource, PDataValueType, Pdu, UserInformationItem, MAXIMUM_PDU_SIZE,
        PDU_HEADER_SIZE,
    },
};

use super::pdata;

/// An association between this node and a peer,
/// driven over an asynchronous byte stream.
///
/// Values of this type are created by
/// [`ClientAssociationOptions::establish_async`]
/// or [`ServerAssociationOptions::establish_async`].
#[derive(Debug)]
pub struct AsyncAssociation<S> {
    stream: S,
    state: AssociationState,
    peer_ae_title: String,
    peer_user_information: UserInformationItem,
    pending: VecDeque<pdata::PDataMessage>,
    end: Option<Received>,
}

impl<S> AsyncAssociation<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(stream: S, state: AssociationState) -> Self {
        AsyncAssociation {
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
    pub async fn send(
        &mut self,
        presentation_context_id: u8,
        data: &[u8],
        is_command: bool,
    ) -> Result<()> {
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
            self.send_pdu(&pdu).await?;
        }
        Ok(())
    }

    /// Wait for the next command or data set,
    /// or for the association to end.
    ///
    /// A release requested by the peer is confirmed automatically,
    /// and reported after any messages received before it.
    pub async fn receive(&mut self) -> Result<Received> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Ok(Received::Data(message));
            }
            if let Some(end) = self.end.take() {
                return Ok(end);
            }

            for event in self.receive_events().await? {
                match event {
                    Event::Data(message) => self.pending.push_back(message),
                    Event::ReleaseRequested => {
                        debug!("Release requested by {}", self.peer_ae_title);
                        self.send_pdu(&Pdu::ReleaseRP).await?;
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
    pub async fn release(&mut self) -> Result<()> {
        self.send_pdu(&Pdu::ReleaseRQ).await?;
        loop {
            for event in self.receive_events().await? {
                match event {
                    Event::Released => return Ok(()),
                    Event::ReleaseRequested => {
                        self.send_pdu(&Pdu::ReleaseRP).await?;
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
    pub async fn abort(&mut self) -> Result<()> {
        match self.state.abort(AbortRQSource::ServiceUser) {
            Some(pdu) => self.write_pdu(&pdu).await,
            None => Ok(()),
        }
    }

    /// Send a single PDU to the peer,
    /// after validating it against the association state.
    pub async fn send_pdu(&mut self, pdu: &Pdu) -> Result<()> {
        let bytes = encode_pdu(pdu).context(SendSnafu)?;
        self.state.send(pdu).context(ProtocolSnafu)?;
        self.write_bytes(&bytes).await
    }

    async fn write_pdu(&mut self, pdu: &Pdu) -> Result<()> {
        let bytes = encode_pdu(pdu).context(SendSnafu)?;
        self.write_bytes(&bytes).await
    }

    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let result = match self.stream.write_all(bytes).await {
            Ok(_) => self.stream.flush().await,
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.state.transport_failed();
        }
        result.context(WireSendSnafu)
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        if let Err(e) = self.stream.read_exact(buf).await {
            self.state.transport_failed();
            return Err(e).context(WireReceiveSnafu);
        }
        Ok(())
    }

    async fn receive_pdu(&mut self) -> Result<Pdu> {
        let max_pdu_length = match self.state.local_max_pdu_length() {
            0 => MAXIMUM_PDU_SIZE,
            len => len,
        };

        let mut header = [0; PDU_HEADER_SIZE as usize];
        match self.stream.read(&mut header[..1]).await {
            Ok(0) => {
                self.state.transport_failed();
                return ConnectionClosedSnafu.fail();
            }
            Ok(_) => {}
            Err(e) => {
                self.state.transport_failed();
                return Err(e).context(WireReceiveSnafu);
            }
        }
        self.read_exact(&mut header[1..]).await?;

        let pdu_length = u32::from_be_bytes([header[2], header[3], header[4], header[5]]);
        let decoded = match check_pdu_header(header[0], pdu_length, max_pdu_length) {
            Ok(pdu_type) => {
                let mut body = vec![0; pdu_length as usize];
                self.read_exact(&mut body).await?;
                read_pdu_body(pdu_type, &body)
            }
            Err(e) => Err(e),
        };

        match decoded {
            Ok(pdu) => Ok(pdu),
            Err(e) => {
                if let Some(abort) = self.state.decode_failed(&e) {
                    // the association is over either way
                    if let Err(send_error) = self.write_pdu(&abort).await {
                        warn!("Failed to send A-ABORT: {}", send_error);
                    }
                }
                Err(e).context(ReceiveSnafu)
            }
        }
    }

    async fn receive_events(&mut self) -> Result<Vec<Event>> {
        let pdu = self.receive_pdu().await?;
        match self.state.receive(pdu) {
            Ok(events) => Ok(events),
            Err(e) => {
                if let Some(abort) = self.state.take_pending_abort() {
                    if let Err(send_error) = self.write_pdu(&abort).await {
                        warn!("Failed to send A-ABORT: {}", send_error);
                    }
                }
                Err(e).context(ProtocolSnafu)
            }
        }
    }
}

impl<'a> ClientAssociationOptions<'a> {
    /// Request a new DICOM association over the given asynchronous stream.
    ///
    /// See [`establish`](Self::establish).
    pub async fn establish_async<S>(self, stream: S) -> Result<AsyncAssociation<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let rq = self.association_rq()?;
        let expected_version = rq.protocol_version;
        let mut association = AsyncAssociation::new(stream, self.association_state());
        association.peer_ae_title = rq.called_ae_title.clone();
        association.send_pdu(&Pdu::AssociationRQ(rq)).await?;

        loop {
            for event in association.receive_events().await? {
                match event {
                    Event::Established(ac) => {
                        if ac.protocol_version != expected_version {
                            let source = AbortRQSource::ServiceProvider(
                                AbortRQServiceProviderReason::InvalidPduParameter,
                            );
                            if let Some(abort) = association.state.abort(source) {
                                if let Err(send_error) = association.write_pdu(&abort).await {
                                    warn!("Failed to send A-ABORT: {}", send_error);
                                }
                            }
                            return ProtocolVersionMismatchSnafu {
                                expected: expected_version,
                                got: ac.protocol_version,
                            }
                            .fail();
                        }

                        association.peer_user_information = ac.user_information;

                        if association.state.accepted_contexts().next().is_none() {
                            warn!("No presentation context was accepted, releasing");
                            if let Err(e) = association.release().await {
                                warn!("Failed to release association: {}", e);
                            }
                            return NoAcceptedPresentationContextsSnafu.fail();
                        }
                        return Ok(association);
                    }
                    Event::Rejected(association_rj) => {
                        return RejectedSnafu { association_rj }.fail();
                    }
                    Event::Aborted(abort_source) => {
                        return AbortedSnafu { abort_source }.fail();
                    }
                    Event::AssociationRequested(_)
                    | Event::Data(_)
                    | Event::ReleaseRequested
                    | Event::Released => {}
                }
            }
        }
    }
}

impl<'a, A, P> ServerAssociationOptions<'a, A, P>
where
    A: AccessControl,
    P: PresentationContextPolicy,
{
    /// Negotiate an association with the given asynchronous stream.
    ///
    /// See [`establish`](Self::establish).
    pub async fn establish_async<S>(&self, stream: S) -> Result<AsyncAssociation<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.check_max_pdu_length()?;
        let mut association = AsyncAssociation::new(stream, self.association_state());

        let rq = loop {
            let mut request = None;
            for event in association.receive_events().await? {
                match event {
                    Event::AssociationRequested(rq) => request = Some(rq),
                    Event::Aborted(abort_source) => {
                        return AbortedSnafu { abort_source }.fail();
                    }
                    _ => return NoAssociationRequestSnafu.fail(),
                }
            }
            if let Some(rq) = request {
                break rq;
            }
        };

        match self.negotiate(&rq) {
            Ok(ac) => {
                association.send_pdu(&Pdu::AssociationAC(ac)).await?;
                association.peer_ae_title = rq.calling_ae_title;
                association.peer_user_information = rq.user_information;
                Ok(association)
            }
            Err(association_rj) => {
                debug!(
                    "Rejecting association from {}: {}",
                    rq.calling_ae_title, association_rj.source
                );
                association
                    .send_pdu(&Pdu::AssociationRJ(association_rj.clone()))
                    .await?;
                RejectedSnafu { association_rj }.fail()
            }
        }
    }
}
