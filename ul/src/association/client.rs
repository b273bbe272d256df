//! Association requester module
//!
//! The module provides an abstraction for a DICOM association
//! in which this application entity is the one requesting the association.
//! See [`ClientAssociationOptions`](self::ClientAssociationOptions)
//! for details and examples on how to create an association.
use std::borrow::Cow;
use std::io::{Read, Write};

use snafu::{ensure, ResultExt};
use tracing::{debug, warn};

use crate::{
    association::{
        AbortedSnafu, Association, AssociationState, Event, InvalidMaxPduSnafu,
        InvalidPresentationContextSnafu, MissingAbstractSyntaxSnafu,
        NoAcceptedPresentationContextsSnafu, ProtocolVersionMismatchSnafu, RejectedSnafu,
        Result, TooManyPresentationContextsSnafu,
    },
    pdu::{
        AbortRQServiceProviderReason, AbortRQSource, AssociationRQ, Pdu,
        PresentationContextItem, SubItem, UserIdentity, UserInformationItem, DEFAULT_MAX_PDU,
        DICOM_APPLICATION_CONTEXT_NAME, MAXIMUM_PDU_SIZE, MINIMUM_PDU_SIZE, PROTOCOL_VERSION,
    },
    IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME,
};

/// A DICOM association builder for a client node.
/// The final outcome is an [`Association`].
///
/// This is the standard way of requesting and establishing
/// an association with another DICOM node,
/// that one usually taking the role of a service class provider (SCP).
///
/// # Example
///
/// ```no_run
/// # use std::net::TcpStream;
/// # use dicom_dul::association::client::ClientAssociationOptions;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let stream = TcpStream::connect("129.168.0.5:104")?;
/// let association = ClientAssociationOptions::new()
///    .called_ae_title("STORE-SCP")
///    .with_presentation_context("1.2.840.10008.1.1", vec!["1.2.840.10008.1.2.1", "1.2.840.10008.1.2"])
///    .establish(stream)?;
/// # Ok(())
/// # }
/// ```
///
/// At least one presentation context must be specified,
/// using the method [`with_presentation_context`](Self::with_presentation_context)
/// and supplying both an abstract syntax and list of transfer syntaxes.
/// Presentation context IDs are assigned in order: 1, 3, 5, and so on.
///
/// A helper method [`with_abstract_syntax`](Self::with_abstract_syntax) will
/// include by default the transfer syntaxes
/// _Explicit VR Little Endian_ and _Implicit VR Little Endian_
/// in the resulting presentation context.
#[derive(Debug, Clone)]
pub struct ClientAssociationOptions<'a> {
    /// the calling AE title
    calling_ae_title: Cow<'a, str>,
    /// the called AE title
    called_ae_title: Cow<'a, str>,
    /// the requested application context name
    application_context_name: Cow<'a, str>,
    /// the list of requested presentation contexts
    presentation_contexts: Vec<(Cow<'a, str>, Vec<Cow<'a, str>>)>,
    /// the expected protocol version
    protocol_version: u16,
    /// the maximum PDU length requested for receiving PDUs
    max_pdu_length: u32,
    /// user identity negotiation, if any
    user_identity: Option<UserIdentity>,
    /// the maximum length of a command or data set received
    max_message_length: Option<usize>,
}

impl<'a> Default for ClientAssociationOptions<'a> {
    fn default() -> Self {
        ClientAssociationOptions {
            calling_ae_title: "THIS-SCU".into(),
            called_ae_title: "ANY-SCP".into(),
            application_context_name: DICOM_APPLICATION_CONTEXT_NAME.into(),
            presentation_contexts: Vec::new(),
            protocol_version: PROTOCOL_VERSION,
            max_pdu_length: DEFAULT_MAX_PDU,
            user_identity: None,
            max_message_length: None,
        }
    }
}

impl<'a> ClientAssociationOptions<'a> {
    /// Create a new set of options for establishing an association.
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the calling application entity title for the association,
    /// which refers to this DICOM node.
    ///
    /// The default is `THIS-SCU`.
    pub fn calling_ae_title<T>(mut self, calling_ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.calling_ae_title = calling_ae_title.into();
        self
    }

    /// Define the called application entity title for the association,
    /// which refers to the target DICOM node.
    ///
    /// The default is `ANY-SCP`.
    pub fn called_ae_title<T>(mut self, called_ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.called_ae_title = called_ae_title.into();
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

    /// Include this presentation context
    /// in the list of proposed presentation contexts.
    pub fn with_presentation_context<T>(
        mut self,
        abstract_syntax_uid: T,
        transfer_syntax_uids: Vec<T>,
    ) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let transfer_syntaxes: Vec<Cow<'a, str>> = transfer_syntax_uids
            .into_iter()
            .map(|t| trim_uid(t.into()))
            .collect();
        self.presentation_contexts
            .push((trim_uid(abstract_syntax_uid.into()), transfer_syntaxes));
        self
    }

    /// Helper to add this abstract syntax
    /// with the default transfer syntaxes
    /// to the list of proposed presentation contexts.
    pub fn with_abstract_syntax<T>(self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let default_transfer_syntaxes: Vec<Cow<'a, str>> =
            vec!["1.2.840.10008.1.2.1".into(), "1.2.840.10008.1.2".into()];
        self.with_presentation_context(abstract_syntax_uid.into(), default_transfer_syntaxes)
    }

    /// Override the protocol version.
    pub fn protocol_version(mut self, protocol_version: u16) -> Self {
        self.protocol_version = protocol_version;
        self
    }

    /// Override the maximum PDU length
    /// that this application entity will admit.
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
        let state = AssociationState::requestor();
        match self.max_message_length {
            Some(max) => state.with_max_message_length(max),
            None => state,
        }
    }

    /// Request user identity negotiation
    /// with the given user name.
    pub fn username<T>(self, username: T) -> Self
    where
        T: Into<String>,
    {
        self.user_identity(UserIdentity::new(
            false,
            crate::pdu::UserIdentityType::Username,
            username.into().into_bytes(),
            vec![],
        ))
    }

    /// Request user identity negotiation
    /// with the given user name and password.
    pub fn username_password<T, U>(self, username: T, password: U) -> Self
    where
        T: Into<String>,
        U: Into<String>,
    {
        self.user_identity(UserIdentity::new(
            false,
            crate::pdu::UserIdentityType::UsernamePassword,
            username.into().into_bytes(),
            password.into().into_bytes(),
        ))
    }

    /// Request user identity negotiation.
    pub fn user_identity(mut self, user_identity: UserIdentity) -> Self {
        self.user_identity = Some(user_identity);
        self
    }

    /// Build the association request PDU
    /// out of these options.
    pub fn association_rq(&self) -> Result<AssociationRQ> {
        // fail if no presentation contexts were provided: they represent intent,
        // should not be omitted by the user
        ensure!(
            !self.presentation_contexts.is_empty(),
            MissingAbstractSyntaxSnafu
        );
        ensure!(
            self.presentation_contexts.len() <= 128,
            TooManyPresentationContextsSnafu {
                count: self.presentation_contexts.len()
            }
        );
        ensure!(
            (MINIMUM_PDU_SIZE..=MAXIMUM_PDU_SIZE).contains(&self.max_pdu_length),
            InvalidMaxPduSnafu {
                max_pdu_length: self.max_pdu_length
            }
        );

        let presentation_contexts = self
            .presentation_contexts
            .iter()
            .zip((1..=u8::MAX).step_by(2))
            .map(|((abstract_syntax, transfer_syntaxes), id)| {
                PresentationContextItem::request(
                    id,
                    abstract_syntax.as_ref(),
                    transfer_syntaxes.iter().map(|ts| ts.as_ref()),
                )
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .context(InvalidPresentationContextSnafu)?;

        let mut user_information = vec![
            SubItem::MaximumLength(self.max_pdu_length),
            SubItem::ImplementationClassUid(IMPLEMENTATION_CLASS_UID.to_string()),
            SubItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
        ];
        if let Some(user_identity) = &self.user_identity {
            user_information.push(SubItem::UserIdentity(user_identity.clone()));
        }

        Ok(AssociationRQ {
            protocol_version: self.protocol_version,
            calling_ae_title: self.calling_ae_title.to_string(),
            called_ae_title: self.called_ae_title.to_string(),
            application_context_name: self.application_context_name.to_string(),
            presentation_contexts,
            user_information: UserInformationItem::new(user_information),
            unsupported_items: vec![],
        })
    }

    /// Request a new DICOM association over the given stream,
    /// negotiating the presentation contexts in the process.
    ///
    /// The stream would usually be a [`TcpStream`](std::net::TcpStream)
    /// already connected to the target node.
    /// If the peer accepts none of the proposed presentation contexts,
    /// the association is released
    /// and [`NoAcceptedPresentationContexts`](crate::association::Error::NoAcceptedPresentationContexts)
    /// is returned.
    pub fn establish<S>(self, stream: S) -> Result<Association<S>>
    where
        S: Read + Write,
    {
        let rq = self.association_rq()?;
        let mut association = Association::new(stream, self.association_state());
        association.peer_ae_title = rq.called_ae_title.clone();

        debug!(
            "Requesting association {} -> {}",
            rq.calling_ae_title, rq.called_ae_title
        );
        association.send_pdu(&Pdu::AssociationRQ(rq))?;

        // wait for the answer to the request
        loop {
            for event in association.receive_events()? {
                match event {
                    Event::Established(ac) => {
                        if ac.protocol_version != self.protocol_version {
                            let source = AbortRQSource::ServiceProvider(
                                AbortRQServiceProviderReason::InvalidPduParameter,
                            );
                            if let Some(abort) = association.state.abort(source) {
                                if let Err(send_error) = association.write_pdu(&abort) {
                                    warn!("Failed to send A-ABORT: {}", send_error);
                                }
                            }
                            return ProtocolVersionMismatchSnafu {
                                expected: self.protocol_version,
                                got: ac.protocol_version,
                            }
                            .fail();
                        }

                        association.peer_user_information = ac.user_information;

                        if association.state.accepted_contexts().next().is_none() {
                            warn!("No presentation context was accepted, releasing");
                            if let Err(e) = association.release() {
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

/// Remove trailing null and space padding from a UID.
fn trim_uid(uid: Cow<str>) -> Cow<str> {
    if uid.ends_with(['\0', ' ']) {
        Cow::Owned(uid.trim_end_matches(['\0', ' ']).to_string())
    } else {
        uid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::Error;
    use matches::assert_matches;

    #[test]
    fn presentation_context_ids_are_odd_and_in_order() {
        let rq = ClientAssociationOptions::new()
            .with_abstract_syntax("1.2.840.10008.1.1")
            .with_presentation_context("1.2.840.10008.5.1.4.1.1.2\0", vec!["1.2.840.10008.1.2"])
            .association_rq()
            .unwrap();

        let ids: Vec<_> = rq.presentation_contexts.iter().map(|pc| pc.id()).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(
            rq.presentation_contexts[1].abstract_syntax(),
            Some("1.2.840.10008.5.1.4.1.1.2")
        );
        assert_eq!(
            rq.presentation_contexts[0].transfer_syntaxes().collect::<Vec<_>>(),
            vec!["1.2.840.10008.1.2.1", "1.2.840.10008.1.2"]
        );
        assert_eq!(rq.user_information.max_length(), Some(DEFAULT_MAX_PDU));
        assert_eq!(
            rq.user_information.implementation_class_uid(),
            Some(IMPLEMENTATION_CLASS_UID)
        );
    }

    #[test]
    fn needs_a_presentation_context() {
        assert_matches!(
            ClientAssociationOptions::new().association_rq(),
            Err(Error::MissingAbstractSyntax { .. })
        );
    }

    #[test]
    fn max_pdu_length_must_be_in_range() {
        assert_matches!(
            ClientAssociationOptions::new()
                .with_abstract_syntax("1.2.840.10008.1.1")
                .max_pdu_length(1024)
                .association_rq(),
            Err(Error::InvalidMaxPdu {
                max_pdu_length: 1024,
                ..
            })
        );
    }

    #[test]
    fn too_many_presentation_contexts() {
        let mut options = ClientAssociationOptions::new();
        for _ in 0..129 {
            options = options.with_abstract_syntax("1.2.840.10008.1.1");
        }
        assert_matches!(
            options.association_rq(),
            Err(Error::TooManyPresentationContexts { count: 129, .. })
        );
    }

    #[test]
    fn user_identity_is_proposed() {
        let rq = ClientAssociationOptions::new()
            .with_abstract_syntax("1.2.840.10008.1.1")
            .username_password("user", "secret")
            .association_rq()
            .unwrap();
        let identity = rq.user_information.user_identity().unwrap();
        assert_eq!(identity.primary_field(), b"user");
        assert_eq!(identity.secondary_field(), b"secret");
    }
}
