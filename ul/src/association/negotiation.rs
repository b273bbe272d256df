//! Association negotiation from the acceptor's side:
//! access control, and the choice of an outcome
//! for every proposed presentation context.
use tracing::debug;

use crate::pdu::{
    AssociationAC, AssociationRJ, AssociationRJResult, AssociationRJServiceProviderASCEReason,
    AssociationRJServiceUserReason, AssociationRJSource, AssociationRQ, PresentationContextItem,
    PresentationContextResultReason, SubItem, UserIdentity, UserInformationItem,
};

/// Common interface for application entity access control policies.
///
/// Existing implementations include [`AcceptAny`] and [`AcceptCalledAeTitle`],
/// but users are free to implement their own.
pub trait AccessControl {
    /// Obtain the decision of whether to accept an incoming association request
    /// based on the recorded application entity titles and/or user identity.
    ///
    /// Returns Ok(()) if the requester node should be given clearance.
    /// Otherwise, a concrete association RJ service user reason is given.
    fn check_access(
        &self,
        this_ae_title: &str,
        calling_ae_title: &str,
        called_ae_title: &str,
        user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason>;
}

/// An access control rule that accepts any incoming association request.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptAny;

impl AccessControl for AcceptAny {
    fn check_access(
        &self,
        _this_ae_title: &str,
        _calling_ae_title: &str,
        _called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason> {
        Ok(())
    }
}

/// An access control rule that accepts association requests
/// that match the called AE title with the node's AE title.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptCalledAeTitle;

impl AccessControl for AcceptCalledAeTitle {
    fn check_access(
        &self,
        this_ae_title: &str,
        _calling_ae_title: &str,
        called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason> {
        if this_ae_title == called_ae_title {
            Ok(())
        } else {
            Err(AssociationRJServiceUserReason::CalledAETitleNotRecognized)
        }
    }
}

/// Decides the outcome of each proposed presentation context.
pub trait PresentationContextPolicy {
    /// Pick one of the proposed transfer syntaxes
    /// for the given abstract syntax,
    /// or give the reason for refusing the presentation context.
    ///
    /// The transfer syntaxes are in the requestor's order of preference.
    fn choose_transfer_syntax(
        &self,
        abstract_syntax: &str,
        transfer_syntaxes: &[&str],
    ) -> Result<String, PresentationContextResultReason>;
}

/// Accept the abstract syntaxes and transfer syntaxes in the given lists.
///
/// The first proposed transfer syntax which is also listed is chosen.
/// An empty list accepts anything.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct AcceptListed {
    pub abstract_syntaxes: Vec<String>,
    pub transfer_syntaxes: Vec<String>,
}

impl AcceptListed {
    pub fn new<A, T>(abstract_syntaxes: A, transfer_syntaxes: T) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        T: IntoIterator,
        T::Item: Into<String>,
    {
        AcceptListed {
            abstract_syntaxes: abstract_syntaxes.into_iter().map(Into::into).collect(),
            transfer_syntaxes: transfer_syntaxes.into_iter().map(Into::into).collect(),
        }
    }

    /// Accept any abstract syntax with any transfer syntax.
    pub fn promiscuous() -> Self {
        Self::default()
    }
}

impl PresentationContextPolicy for AcceptListed {
    fn choose_transfer_syntax(
        &self,
        abstract_syntax: &str,
        transfer_syntaxes: &[&str],
    ) -> Result<String, PresentationContextResultReason> {
        if !self.abstract_syntaxes.is_empty()
            && !self.abstract_syntaxes.iter().any(|a| a == abstract_syntax)
        {
            return Err(PresentationContextResultReason::AbstractSyntaxNotSupported);
        }

        transfer_syntaxes
            .iter()
            .find(|ts| {
                self.transfer_syntaxes.is_empty() || self.transfer_syntaxes.iter().any(|t| t == **ts)
            })
            .map(|ts| ts.to_string())
            .ok_or(PresentationContextResultReason::TransferSyntaxesNotSupported)
    }
}

/// The acceptor's parameters of a negotiation.
pub struct NegotiationOptions<'a, A: ?Sized, P: ?Sized> {
    /// the AE title of the accepting node
    pub ae_title: &'a str,
    pub application_context_name: &'a str,
    pub protocol_version: u16,
    /// maximum PDU length announced to the requestor, 0 if unlimited
    pub max_pdu_length: u32,
    /// extra user information sub-items sent in the acceptance
    pub user_information: &'a [SubItem],
    pub access_control: &'a A,
    pub policy: &'a P,
}

/// Answer an association request.
///
/// The request is rejected as a whole if the protocol version,
/// application context name or access control do not agree.
/// Otherwise every proposed presentation context
/// receives an answer according to the policy,
/// even if none is accepted.
pub fn negotiate<A, P>(
    rq: &AssociationRQ,
    options: &NegotiationOptions<'_, A, P>,
) -> Result<AssociationAC, AssociationRJ>
where
    A: AccessControl + ?Sized,
    P: PresentationContextPolicy + ?Sized,
{
    if rq.protocol_version != options.protocol_version {
        debug!(
            "Rejecting protocol version {:#06x}",
            rq.protocol_version
        );
        return Err(AssociationRJ {
            result: AssociationRJResult::Permanent,
            source: AssociationRJSource::ServiceProviderASCE(
                AssociationRJServiceProviderASCEReason::ProtocolVersionNotSupported,
            ),
        });
    }

    if rq.application_context_name != options.application_context_name {
        debug!(
            "Rejecting application context {}",
            rq.application_context_name
        );
        return Err(AssociationRJ {
            result: AssociationRJResult::Permanent,
            source: AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
            ),
        });
    }

    options
        .access_control
        .check_access(
            options.ae_title,
            &rq.calling_ae_title,
            &rq.called_ae_title,
            rq.user_information.user_identity(),
        )
        .map_err(|reason| AssociationRJ {
            result: AssociationRJResult::Permanent,
            source: AssociationRJSource::ServiceUser(reason),
        })?;

    let presentation_contexts = rq
        .presentation_contexts
        .iter()
        .filter_map(|pc| negotiate_presentation_context(pc, options.policy))
        .collect();

    let user_information = UserInformationItem::new(
        std::iter::once(SubItem::MaximumLength(options.max_pdu_length))
            .chain(options.user_information.iter().cloned())
            .collect(),
    );

    Ok(AssociationAC {
        protocol_version: options.protocol_version,
        calling_ae_title: rq.calling_ae_title.clone(),
        called_ae_title: rq.called_ae_title.clone(),
        application_context_name: options.application_context_name.to_string(),
        presentation_contexts,
        user_information,
        unsupported_items: vec![],
    })
}

fn negotiate_presentation_context<P>(
    pc: &PresentationContextItem,
    policy: &P,
) -> Option<PresentationContextItem>
where
    P: PresentationContextPolicy + ?Sized,
{
    let abstract_syntax = pc.abstract_syntax().unwrap_or_default();
    let transfer_syntaxes: Vec<_> = pc.transfer_syntaxes().collect();

    let (reason, transfer_syntax) =
        match policy.choose_transfer_syntax(abstract_syntax, &transfer_syntaxes) {
            Ok(ts) => (PresentationContextResultReason::Acceptance, Some(ts)),
            Err(PresentationContextResultReason::Acceptance) => {
                (PresentationContextResultReason::NoReason, None)
            }
            Err(reason) => (reason, None),
        };
    debug!(
        "Presentation context {} ({}): {}",
        pc.id(),
        abstract_syntax,
        reason
    );

    // the ID was already known to be odd
    PresentationContextItem::response(pc.id(), reason, transfer_syntax).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{DICOM_APPLICATION_CONTEXT_NAME, PROTOCOL_VERSION};
    use matches::assert_matches;

    const VERIFICATION: &str = "1.2.840.10008.1.1";
    const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
    const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
    const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";
    const JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";

    fn rq() -> AssociationRQ {
        AssociationRQ {
            protocol_version: PROTOCOL_VERSION,
            calling_ae_title: "STORE-SCU".to_string(),
            called_ae_title: "STORE-SCP".to_string(),
            application_context_name: DICOM_APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: vec![
                PresentationContextItem::request(1, VERIFICATION, [JPEG_BASELINE, EXPLICIT_VR_LE])
                    .unwrap(),
                PresentationContextItem::request(3, CT_IMAGE_STORAGE, [JPEG_BASELINE]).unwrap(),
                PresentationContextItem::request(5, "1.2.3.4.5", [IMPLICIT_VR_LE]).unwrap(),
            ],
            user_information: UserInformationItem::new(vec![SubItem::MaximumLength(16_384)]),
            unsupported_items: vec![],
        }
    }

    fn options<'a, A>(
        access_control: &'a A,
        policy: &'a AcceptListed,
    ) -> NegotiationOptions<'a, A, AcceptListed> {
        NegotiationOptions {
            ae_title: "STORE-SCP",
            application_context_name: DICOM_APPLICATION_CONTEXT_NAME,
            protocol_version: PROTOCOL_VERSION,
            max_pdu_length: 32_768,
            user_information: &[],
            access_control,
            policy,
        }
    }

    #[test]
    fn each_context_gets_an_answer() {
        let policy = AcceptListed::new(
            [VERIFICATION, CT_IMAGE_STORAGE],
            [IMPLICIT_VR_LE, EXPLICIT_VR_LE],
        );
        let ac = negotiate(&rq(), &options(&AcceptAny, &policy)).unwrap();

        let answers: Vec<_> = ac
            .presentation_contexts
            .iter()
            .map(|pc| (pc.id(), pc.result(), pc.transfer_syntax()))
            .collect();
        assert_eq!(
            answers,
            vec![
                (
                    1,
                    Some(PresentationContextResultReason::Acceptance),
                    Some(EXPLICIT_VR_LE)
                ),
                (
                    3,
                    Some(PresentationContextResultReason::TransferSyntaxesNotSupported),
                    None
                ),
                (
                    5,
                    Some(PresentationContextResultReason::AbstractSyntaxNotSupported),
                    None
                ),
            ]
        );
        assert_eq!(ac.user_information.max_length(), Some(32_768));
        assert_eq!(ac.called_ae_title, "STORE-SCP");
    }

    #[test]
    fn promiscuous_policy_takes_the_first_proposal() {
        let policy = AcceptListed::promiscuous();
        let ac = negotiate(&rq(), &options(&AcceptAny, &policy)).unwrap();
        assert!(ac.presentation_contexts.iter().all(|pc| pc.is_accepted()));
        assert_eq!(
            ac.presentation_contexts[0].transfer_syntax(),
            Some(JPEG_BASELINE)
        );
    }

    #[test]
    fn rejects_unknown_called_ae_title() {
        let policy = AcceptListed::promiscuous();
        let mut options = options(&AcceptCalledAeTitle, &policy);
        options.ae_title = "OTHER-SCP";
        let rj = negotiate(&rq(), &options).unwrap_err();
        assert_eq!(rj.result, AssociationRJResult::Permanent);
        assert_eq!(
            rj.source,
            AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAETitleNotRecognized
            )
        );
    }

    #[test]
    fn rejects_other_protocol_versions_and_application_contexts() {
        let policy = AcceptListed::promiscuous();

        let mut request = rq();
        request.protocol_version = 3;
        assert_matches!(
            negotiate(&request, &options(&AcceptAny, &policy)),
            Err(AssociationRJ {
                source: AssociationRJSource::ServiceProviderASCE(
                    AssociationRJServiceProviderASCEReason::ProtocolVersionNotSupported
                ),
                ..
            })
        );

        let mut request = rq();
        request.application_context_name = "1.2.3".to_string();
        assert_matches!(
            negotiate(&request, &options(&AcceptAny, &policy)),
            Err(AssociationRJ {
                source: AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::ApplicationContextNameNotSupported
                ),
                ..
            })
        );
    }
}
