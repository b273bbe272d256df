//! Association acceptor module
//!
//! The module provides an abstraction for a DICOM association
//! in which this application entity listens to incoming association requests.
//! See [`ServerAssociationOptions`]
//! for details and examples on how to create an association.
use std::borrow::Cow;
use std::io::{Read, Write};

use snafu::ensure;
use tracing::debug;

use crate::{
    association::{
        negotiation::{negotiate, NegotiationOptions},
        AbortedSnafu, AcceptAny, AcceptCalledAeTitle, AcceptListed, AccessControl, Association,
        AssociationState, Event, InvalidMaxPduSnafu, NoAssociationRequestSnafu,
        PresentationContextPolicy, RejectedSnafu, Result,
    },
    pdu::{
        AssociationAC, AssociationRJ, AssociationRQ, Pdu, SubItem, DEFAULT_MAX_PDU,
        DICOM_APPLICATION_CONTEXT_NAME, MAXIMUM_PDU_SIZE, MINIMUM_PDU_SIZE, PROTOCOL_VERSION,
    },
    IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME,
};

/// A DICOM association builder for an acceptor DICOM node,
/// often taking the role of a service class provider (SCP).
///
/// This is the standard way of negotiating and establishing
/// an association with a requesting node.
/// The outcome is an [`Association`].
///
/// # Example
///
/// ```no_run
/// # use std::net::TcpListener;
/// # use dicom_dul::association::server::ServerAssociationOptions;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// # let tcp_listener: TcpListener = unimplemented!();
/// let scp_options = ServerAssociationOptions::new()
///    .with_abstract_syntax("1.2.840.10008.1.1")
///    .with_transfer_syntax("1.2.840.10008.1.2.1");
///
/// let (stream, _address) = tcp_listener.accept()?;
/// scp_options.establish(stream)?;
/// # Ok(())
/// # }
/// ```
///
/// The SCP will by default accept all transfer syntaxes
/// and all abstract syntaxes,
/// until some are listed.
/// The first proposed transfer syntax which is also listed is chosen.
/// Any other [`PresentationContextPolicy`] can be set with
/// [`presentation_context_policy`](Self::presentation_context_policy).
///
/// Access control logic is also available,
/// enabling application entities to decide on
/// whether to accept or reject the association request
/// based on the _called_ and _calling_ AE titles.
///
/// - By default, the application will accept requests from anyone
///   ([`AcceptAny`])
/// - To only accept requests with a matching _called_ AE title,
///   add a call to [`accept_called_ae_title`](Self::accept_called_ae_title)
///   ([`AcceptCalledAeTitle`]).
/// - Any other policy can be implemented through the [`AccessControl`] trait.
#[derive(Debug, Clone)]
pub struct ServerAssociationOptions<'a, A, P = AcceptListed> {
    /// the application entity access control policy
    ae_access_control: A,
    /// the presentation context policy
    policy: P,
    /// the AE title of this DICOM node
    ae_title: Cow<'a, str>,
    /// the requested application context name
    application_context_name: Cow<'a, str>,
    /// the expected protocol version
    protocol_version: u16,
    /// the maximum PDU length
    max_pdu_length: u32,
    /// the maximum length of a command or data set received
    max_message_length: Option<usize>,
}

impl<'a> Default for ServerAssociationOptions<'a, AcceptAny> {
    fn default() -> Self {
        ServerAssociationOptions {
            ae_access_control: AcceptAny,
            policy: AcceptListed::default(),
            ae_title: "THIS-SCP".into(),
            application_context_name: DICOM_APPLICATION_CONTEXT_NAME.into(),
            protocol_version: PROTOCOL_VERSION,
            max_pdu_length: DEFAULT_MAX_PDU,
            max_message_length: None,
        }
    }
}

impl<'a> ServerAssociationOptions<'a, AcceptAny> {
    /// Create a new set of options for establishing an association.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<'a, A, P> ServerAssociationOptions<'a, A, P>
where
    A: AccessControl,
    P: PresentationContextPolicy,
{
    /// Change the access control policy to accept any association
    /// regardless of the specified AE titles.
    ///
    /// This is the default behavior when the options are first created.
    pub fn accept_any(self) -> ServerAssociationOptions<'a, AcceptAny, P> {
        self.ae_access_control(AcceptAny)
    }

    /// Change the access control policy to accept an association
    /// if the called AE title matches this node's AE title.
    pub fn accept_called_ae_title(self) -> ServerAssociationOptions<'a, AcceptCalledAeTitle, P> {
        self.ae_access_control(AcceptCalledAeTitle)
    }

    /// Change the access control policy.
    pub fn ae_access_control<C>(self, access_control: C) -> ServerAssociationOptions<'a, C, P>
    where
        C: AccessControl,
    {
        let ServerAssociationOptions {
            ae_title,
            application_context_name,
            policy,
            protocol_version,
            max_pdu_length,
            max_message_length,
            ae_access_control: _,
        } = self;

        ServerAssociationOptions {
            ae_access_control: access_control,
            policy,
            ae_title,
            application_context_name,
            protocol_version,
            max_pdu_length,
            max_message_length,
        }
    }

    /// Change the policy deciding the outcome of each presentation context.
    pub fn presentation_context_policy<Q>(self, policy: Q) -> ServerAssociationOptions<'a, A, Q>
    where
        Q: PresentationContextPolicy,
    {
        let ServerAssociationOptions {
            ae_access_control,
            ae_title,
            application_context_name,
            protocol_version,
            max_pdu_length,
            max_message_length,
            policy: _,
        } = self;

        ServerAssociationOptions {
            ae_access_control,
            policy,
            ae_title,
            application_context_name,
            protocol_version,
            max_pdu_length,
            max_message_length,
        }
    }

    /// Define the application entity title referring to this DICOM node.
    ///
    /// The default is `THIS-SCP`.
    pub fn ae_title<T>(mut self, ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.ae_title = ae_title.into();
        self
    }

    /// Override the application context name.
    pub fn application_context_name<T>(mut self, application_context_name: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.application_context_name = application_context_name.into();
        self
    }

    /// Override the protocol version.
    pub fn protocol_version(mut self, protocol_version: u16) -> Self {
        self.protocol_version = protocol_version;
        self
    }

    /// Override the maximum PDU length
    /// that this application entity will admit.
    ///
    /// Zero means no limit.
    /// Any other value must be within
    /// [`MINIMUM_PDU_SIZE`] and [`MAXIMUM_PDU_SIZE`],
    /// or establishing an association fails with
    /// [`InvalidMaxPdu`](crate::association::Error::InvalidMaxPdu).
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Abort the association if the peer sends a command or data set
    /// of more than this many bytes.
    ///
    /// There is no limit by default.
    pub fn max_message_length(mut self, value: usize) -> Self {
        self.max_message_length = Some(value);
        self
    }

    pub(crate) fn association_state(&self) -> AssociationState {
        let state = AssociationState::acceptor();
        match self.max_message_length {
            Some(max) => state.with_max_message_length(max),
            None => state,
        }
    }

    pub(crate) fn check_max_pdu_length(&self) -> Result<()> {
        let max_pdu_length = self.max_pdu_length;
        ensure!(
            max_pdu_length == 0 || (MINIMUM_PDU_SIZE..=MAXIMUM_PDU_SIZE).contains(&max_pdu_length),
            InvalidMaxPduSnafu { max_pdu_length }
        );
        Ok(())
    }

    /// Answer the given association request,
    /// without any I/O.
    pub fn negotiate(&self, rq: &AssociationRQ) -> std::result::Result<AssociationAC, AssociationRJ> {
        let user_information = [
            SubItem::ImplementationClassUid(IMPLEMENTATION_CLASS_UID.to_string()),
            SubItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
        ];
        negotiate(
            rq,
            &NegotiationOptions {
                ae_title: &self.ae_title,
                application_context_name: &self.application_context_name,
                protocol_version: self.protocol_version,
                max_pdu_length: self.max_pdu_length,
                user_information: &user_information,
                access_control: &self.ae_access_control,
                policy: &self.policy,
            },
        )
    }

    /// Negotiate an association with the given stream,
    /// which should be freshly accepted from a listener.
    ///
    /// The association is established
    /// even if none of the presentation contexts were accepted.
    /// A rejected request results in
    /// [`Rejected`](crate::association::Error::Rejected),
    /// after the rejection is sent to the requestor.
    pub fn establish<S>(&self, stream: S) -> Result<Association<S>>
    where
        S: Read + Write,
    {
        self.check_max_pdu_length()?;
        let mut association = Association::new(stream, self.association_state());

        let rq = loop {
            let mut request = None;
            for event in association.receive_events()? {
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
                debug!(
                    "Accepting association from {}, {} of {} presentation contexts",
                    rq.calling_ae_title,
                    ac.presentation_contexts
                        .iter()
                        .filter(|pc| pc.is_accepted())
                        .count(),
                    ac.presentation_contexts.len()
                );
                association.send_pdu(&Pdu::AssociationAC(ac))?;
                association.peer_ae_title = rq.calling_ae_title;
                association.peer_user_information = rq.user_information;
                Ok(association)
            }
            Err(association_rj) => {
                debug!(
                    "Rejecting association from {}: {}",
                    rq.calling_ae_title, association_rj.source
                );
                association.send_pdu(&Pdu::AssociationRJ(association_rj.clone()))?;
                RejectedSnafu { association_rj }.fail()
            }
        }
    }
}

impl<'a, A> ServerAssociationOptions<'a, A, AcceptListed>
where
    A: AccessControl,
{
    /// Include this abstract syntax
    /// in the list of abstract syntaxes to accept.
    pub fn with_abstract_syntax<T>(mut self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let uid = abstract_syntax_uid.into();
        self.policy
            .abstract_syntaxes
            .push(uid.trim_end_matches(['\0', ' ']).to_string());
        self
    }

    /// Include this transfer syntax
    /// in the list of transfer syntaxes to accept.
    pub fn with_transfer_syntax<T>(mut self, transfer_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let uid = transfer_syntax_uid.into();
        self.policy
            .transfer_syntaxes
            .push(uid.trim_end_matches(['\0', ' ']).to_string());
        self
    }

    /// Accept any abstract syntax and any transfer syntax,
    /// forgetting the ones listed so far.
    pub fn promiscuous(mut self) -> Self {
        self.policy = AcceptListed::promiscuous();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::ClientAssociationOptions;
    use crate::pdu::{AssociationRJServiceUserReason, AssociationRJSource};
    use matches::assert_matches;

    #[test]
    fn negotiation_follows_the_listed_syntaxes() {
        let rq = ClientAssociationOptions::new()
            .called_ae_title("THIS-SCP")
            .with_presentation_context("1.2.840.10008.1.1", vec!["1.2.840.10008.1.2"])
            .with_presentation_context(
                "1.2.840.10008.1.1",
                vec!["1.2.840.10008.1.2", "1.2.840.10008.1.2.1"],
            )
            .association_rq()
            .unwrap();

        let ac = ServerAssociationOptions::new()
            .with_abstract_syntax("1.2.840.10008.1.1")
            .with_transfer_syntax("1.2.840.10008.1.2.1\0")
            .negotiate(&rq)
            .unwrap();

        assert_eq!(ac.presentation_contexts.len(), 2);
        assert!(!ac.presentation_contexts[0].is_accepted());
        assert!(ac.presentation_contexts[1].is_accepted());
        assert_eq!(
            ac.presentation_contexts[1].transfer_syntax(),
            Some("1.2.840.10008.1.2.1")
        );
        assert_eq!(ac.user_information.max_length(), Some(DEFAULT_MAX_PDU));
        assert_eq!(
            ac.user_information.implementation_version_name(),
            Some(IMPLEMENTATION_VERSION_NAME)
        );
    }

    #[test]
    fn called_ae_title_access_control() {
        let rq = ClientAssociationOptions::new()
            .called_ae_title("SOMEONE-ELSE")
            .with_abstract_syntax("1.2.840.10008.1.1")
            .association_rq()
            .unwrap();

        let options = ServerAssociationOptions::new().accept_called_ae_title();
        assert_matches!(
            options.negotiate(&rq),
            Err(AssociationRJ {
                source: AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::CalledAETitleNotRecognized
                ),
                ..
            })
        );

        // accepted once this node is called by its name
        let options = options.ae_title("SOMEONE-ELSE");
        assert!(options.negotiate(&rq).is_ok());
    }

    #[test]
    fn max_pdu_length_out_of_range_is_refused() {
        for max_pdu_length in [1, MINIMUM_PDU_SIZE - 1, MAXIMUM_PDU_SIZE + 1] {
            let options = ServerAssociationOptions::new().max_pdu_length(max_pdu_length);
            // nothing is read from the stream
            let stream = std::io::Cursor::new(Vec::new());
            assert_matches!(
                options.establish(stream),
                Err(crate::association::Error::InvalidMaxPdu { max_pdu_length: m, .. })
                    if m == max_pdu_length
            );
        }
        for max_pdu_length in [0, MINIMUM_PDU_SIZE, MAXIMUM_PDU_SIZE] {
            let options = ServerAssociationOptions::new().max_pdu_length(max_pdu_length);
            assert!(options.check_max_pdu_length().is_ok());
        }
    }
}
