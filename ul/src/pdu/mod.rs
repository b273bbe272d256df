//! Protocol Data Unit module
//!
//! This module comprises the data structures representing
//! the protocol data units (PDUs) of the DICOM upper layer
//! and the sub-items nested inside them,
//! as well as readers and writers of PDUs from arbitrary data sources.
//!
//! All PDU kinds and sub-item kinds are closed enumerations,
//! so that encoding and decoding are exhaustive matches.
//! Sub-items of an unknown type are kept verbatim
//! in [`SubItem::Unsupported`].
pub mod cursor;
pub mod reader;
pub mod writer;

use std::fmt::Display;

pub use cursor::PduCursor;
pub use reader::{
    check_pdu_header, read_pdu, read_pdu_body, read_sub_item, DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE,
    MINIMUM_PDU_SIZE, PDU_HEADER_SIZE,
};
pub use writer::{encode_pdu, encode_sub_item, write_pdu};

/// The only version of the upper layer protocol in existence.
pub const PROTOCOL_VERSION: u16 = 1;

/// The DICOM application context name,
/// which must be the application context of every association.
pub const DICOM_APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

/// The maximum length of an application entity title, in bytes.
pub const AE_TITLE_LENGTH: usize = 16;

/// Wire identifiers of the sub-items found in association PDUs.
pub mod item_type {
    pub const APPLICATION_CONTEXT: u8 = 0x10;
    pub const PRESENTATION_CONTEXT_REQUEST: u8 = 0x20;
    pub const PRESENTATION_CONTEXT_RESPONSE: u8 = 0x21;
    pub const ABSTRACT_SYNTAX: u8 = 0x30;
    pub const TRANSFER_SYNTAX: u8 = 0x40;
    pub const USER_INFORMATION: u8 = 0x50;
    pub const MAXIMUM_LENGTH: u8 = 0x51;
    pub const IMPLEMENTATION_CLASS_UID: u8 = 0x52;
    pub const ASYNCHRONOUS_OPERATIONS_WINDOW: u8 = 0x53;
    pub const ROLE_SELECTION: u8 = 0x54;
    pub const IMPLEMENTATION_VERSION_NAME: u8 = 0x55;
    pub const SOP_CLASS_EXTENDED_NEGOTIATION: u8 = 0x56;
    pub const USER_IDENTITY: u8 = 0x58;
}

/// The type tag of a PDU, as found in the first byte of its header.
#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PduType {
    /// A-ASSOCIATE-RQ
    AssociationRQ = 0x01,
    /// A-ASSOCIATE-AC
    AssociationAC = 0x02,
    /// A-ASSOCIATE-RJ
    AssociationRJ = 0x03,
    /// P-DATA-TF
    PData = 0x04,
    /// A-RELEASE-RQ
    ReleaseRQ = 0x05,
    /// A-RELEASE-RP
    ReleaseRP = 0x06,
    /// A-ABORT
    AbortRQ = 0x07,
}

impl PduType {
    /// Interpret the given wire tag.
    /// Returns `None` if the byte does not identify any PDU kind.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(PduType::AssociationRQ),
            0x02 => Some(PduType::AssociationAC),
            0x03 => Some(PduType::AssociationRJ),
            0x04 => Some(PduType::PData),
            0x05 => Some(PduType::ReleaseRQ),
            0x06 => Some(PduType::ReleaseRP),
            0x07 => Some(PduType::AbortRQ),
            _ => None,
        }
    }

    /// The wire tag of this PDU kind.
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl Display for PduType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PduType::AssociationRQ => "A-ASSOCIATE-RQ",
            PduType::AssociationAC => "A-ASSOCIATE-AC",
            PduType::AssociationRJ => "A-ASSOCIATE-RJ",
            PduType::PData => "P-DATA-TF",
            PduType::ReleaseRQ => "A-RELEASE-RQ",
            PduType::ReleaseRP => "A-RELEASE-RP",
            PduType::AbortRQ => "A-ABORT",
        };
        f.write_str(name)
    }
}

/// The outcome of negotiating a single presentation context.
#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub enum PresentationContextResultReason {
    Acceptance = 0,
    UserRejection = 1,
    NoReason = 2,
    AbstractSyntaxNotSupported = 3,
    TransferSyntaxesNotSupported = 4,
}

impl PresentationContextResultReason {
    pub fn from(reason: u8) -> Option<PresentationContextResultReason> {
        let result = match reason {
            0 => PresentationContextResultReason::Acceptance,
            1 => PresentationContextResultReason::UserRejection,
            2 => PresentationContextResultReason::NoReason,
            3 => PresentationContextResultReason::AbstractSyntaxNotSupported,
            4 => PresentationContextResultReason::TransferSyntaxesNotSupported,
            _ => {
                return None;
            }
        };

        Some(result)
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl Display for PresentationContextResultReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            PresentationContextResultReason::Acceptance => "acceptance",
            PresentationContextResultReason::UserRejection => "user rejection",
            PresentationContextResultReason::NoReason => "no reason",
            PresentationContextResultReason::AbstractSyntaxNotSupported => {
                "abstract syntax not supported"
            }
            PresentationContextResultReason::TransferSyntaxesNotSupported => {
                "transfer syntaxes not supported"
            }
        };
        f.write_str(msg)
    }
}

/// Whether a presentation context item is a proposal (item type 20H)
/// or the answer to one (item type 21H).
#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub enum PresentationContextType {
    Request,
    Response,
}

impl PresentationContextType {
    pub fn item_type(self) -> u8 {
        match self {
            PresentationContextType::Request => item_type::PRESENTATION_CONTEXT_REQUEST,
            PresentationContextType::Response => item_type::PRESENTATION_CONTEXT_RESPONSE,
        }
    }
}

/// A presentation context item,
/// either proposed by the association requestor
/// or answered by the acceptor.
///
/// The context identifier is always odd:
/// every constructor refuses even identifiers.
#[derive(Debug, Clone, Eq, PartialEq, PartialOrd, Hash)]
pub struct PresentationContextItem {
    kind: PresentationContextType,
    id: u8,
    result: Option<PresentationContextResultReason>,
    items: Vec<SubItem>,
}

impl PresentationContextItem {
    /// Create a proposed presentation context
    /// with one abstract syntax and the given candidate transfer syntaxes.
    pub fn request<A, I, T>(id: u8, abstract_syntax: A, transfer_syntaxes: I) -> reader::Result<Self>
    where
        A: Into<String>,
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let items = std::iter::once(SubItem::AbstractSyntax(abstract_syntax.into()))
            .chain(
                transfer_syntaxes
                    .into_iter()
                    .map(|ts| SubItem::TransferSyntax(ts.into())),
            )
            .collect();
        let pc = Self::from_parts(PresentationContextType::Request, id, None, items)?;
        snafu::ensure!(
            pc.transfer_syntax().is_some(),
            reader::MissingTransferSyntaxSnafu { id }
        );
        Ok(pc)
    }

    /// Create a presentation context answer.
    ///
    /// The transfer syntax must be present on acceptance.
    pub fn response(
        id: u8,
        reason: PresentationContextResultReason,
        transfer_syntax: Option<String>,
    ) -> reader::Result<Self> {
        snafu::ensure!(
            transfer_syntax.is_some() || reason != PresentationContextResultReason::Acceptance,
            reader::MissingTransferSyntaxSnafu { id }
        );
        let items = transfer_syntax
            .map(SubItem::TransferSyntax)
            .into_iter()
            .collect();
        Self::from_parts(PresentationContextType::Response, id, Some(reason), items)
    }

    /// Assemble a presentation context item from its raw parts.
    ///
    /// Only the parity of the identifier is checked here.
    /// Any other shape the peer could not decode,
    /// such as a result on a request item or a missing transfer syntax,
    /// is refused when the item is encoded.
    pub fn from_parts(
        kind: PresentationContextType,
        id: u8,
        result: Option<PresentationContextResultReason>,
        items: Vec<SubItem>,
    ) -> reader::Result<Self> {
        snafu::ensure!(id % 2 == 1, reader::EvenPresentationContextIdSnafu { id });
        Ok(PresentationContextItem {
            kind,
            id,
            result,
            items,
        })
    }

    pub fn kind(&self) -> PresentationContextType {
        self.kind
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    /// The negotiation result, only present in response items.
    pub fn result(&self) -> Option<PresentationContextResultReason> {
        self.result
    }

    /// The nested abstract/transfer syntax sub-items, in wire order.
    pub fn items(&self) -> &[SubItem] {
        &self.items
    }

    pub fn abstract_syntax(&self) -> Option<&str> {
        self.items.iter().find_map(|item| match item {
            SubItem::AbstractSyntax(uid) => Some(uid.as_str()),
            _ => None,
        })
    }

    pub fn transfer_syntaxes(&self) -> impl Iterator<Item = &str> + '_ {
        self.items.iter().filter_map(|item| match item {
            SubItem::TransferSyntax(uid) => Some(uid.as_str()),
            _ => None,
        })
    }

    /// The first (and in a response, the only) transfer syntax.
    pub fn transfer_syntax(&self) -> Option<&str> {
        self.transfer_syntaxes().next()
    }

    /// Whether this is a response item declaring acceptance.
    pub fn is_accepted(&self) -> bool {
        self.result == Some(PresentationContextResultReason::Acceptance)
    }
}

/// The user information item,
/// holding the user data sub-items of an association PDU.
#[derive(Debug, Clone, Default, Eq, PartialEq, PartialOrd, Hash)]
pub struct UserInformationItem {
    pub items: Vec<SubItem>,
}

impl UserInformationItem {
    pub fn new(items: Vec<SubItem>) -> Self {
        UserInformationItem { items }
    }

    /// The maximum PDU length that the sender of this item can receive.
    /// Zero means unlimited.
    pub fn max_length(&self) -> Option<u32> {
        self.items.iter().find_map(|item| match item {
            SubItem::MaximumLength(len) => Some(*len),
            _ => None,
        })
    }

    pub fn implementation_class_uid(&self) -> Option<&str> {
        self.items.iter().find_map(|item| match item {
            SubItem::ImplementationClassUid(uid) => Some(uid.as_str()),
            _ => None,
        })
    }

    pub fn implementation_version_name(&self) -> Option<&str> {
        self.items.iter().find_map(|item| match item {
            SubItem::ImplementationVersionName(name) => Some(name.as_str()),
            _ => None,
        })
    }

    pub fn asynchronous_operations_window(&self) -> Option<&AsynchronousOperationsWindow> {
        self.items.iter().find_map(|item| match item {
            SubItem::AsynchronousOperationsWindow(window) => Some(window),
            _ => None,
        })
    }

    pub fn role_selections(&self) -> impl Iterator<Item = &RoleSelection> + '_ {
        self.items.iter().filter_map(|item| match item {
            SubItem::RoleSelection(role) => Some(role),
            _ => None,
        })
    }

    pub fn user_identity(&self) -> Option<&UserIdentity> {
        self.items.iter().find_map(|item| match item {
            SubItem::UserIdentity(identity) => Some(identity),
            _ => None,
        })
    }
}

/// Asynchronous operations window negotiation (PS3.7 D.3.3.3).
#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Hash)]
pub struct AsynchronousOperationsWindow {
    pub max_operations_invoked: u16,
    pub max_operations_performed: u16,
}

/// SCU/SCP role selection for one SOP class (PS3.7 D.3.3.4).
#[derive(Debug, Clone, Eq, PartialEq, PartialOrd, Hash)]
pub struct RoleSelection {
    pub sop_class_uid: String,
    pub scu_role: u8,
    pub scp_role: u8,
}

/// SOP class extended negotiation (PS3.7 D.3.3.5).
#[derive(Debug, Clone, Eq, PartialEq, PartialOrd, Hash)]
pub struct SopClassExtendedNegotiation {
    pub sop_class_uid: String,
    pub service_class_application_information: Vec<u8>,
}

/// User identity negotiation request (PS3.7 D.3.3.7).
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash)]
pub struct UserIdentity {
    positive_response_requested: bool,
    identity_type: UserIdentityType,
    primary_field: Vec<u8>,
    secondary_field: Vec<u8>,
}

impl UserIdentity {
    pub fn new(
        positive_response_requested: bool,
        identity_type: UserIdentityType,
        primary_field: Vec<u8>,
        secondary_field: Vec<u8>,
    ) -> Self {
        UserIdentity {
            positive_response_requested,
            identity_type,
            primary_field,
            secondary_field,
        }
    }

    pub fn positive_response_requested(&self) -> bool {
        self.positive_response_requested
    }

    pub fn identity_type(&self) -> UserIdentityType {
        self.identity_type
    }

    pub fn primary_field(&self) -> &[u8] {
        &self.primary_field
    }

    pub fn secondary_field(&self) -> &[u8] {
        &self.secondary_field
    }
}

// keep secrets out of logs
impl std::fmt::Debug for UserIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserIdentity")
            .field("positive_response_requested", &self.positive_response_requested)
            .field("identity_type", &self.identity_type)
            .field("primary_field", &format_args!("{} bytes", self.primary_field.len()))
            .field(
                "secondary_field",
                &format_args!("{} bytes", self.secondary_field.len()),
            )
            .finish()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Hash)]
#[non_exhaustive]
pub enum UserIdentityType {
    Username,
    UsernamePassword,
    KerberosServiceTicket,
    SamlAssertion,
    Jwt,
}

impl UserIdentityType {
    pub fn from(user_identity_type: u8) -> Option<Self> {
        match user_identity_type {
            1 => Some(Self::Username),
            2 => Some(Self::UsernamePassword),
            3 => Some(Self::KerberosServiceTicket),
            4 => Some(Self::SamlAssertion),
            5 => Some(Self::Jwt),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::Username => 1,
            Self::UsernamePassword => 2,
            Self::KerberosServiceTicket => 3,
            Self::SamlAssertion => 4,
            Self::Jwt => 5,
        }
    }
}

/// A variable item or sub-item of an association PDU.
#[derive(Debug, Clone, Eq, PartialEq, PartialOrd, Hash)]
pub enum SubItem {
    /// Application context item (10H)
    ApplicationContext(String),
    /// Presentation context item, proposed (20H) or answered (21H)
    PresentationContext(PresentationContextItem),
    /// Abstract syntax sub-item (30H)
    AbstractSyntax(String),
    /// Transfer syntax sub-item (40H)
    TransferSyntax(String),
    /// User information item (50H)
    UserInformation(UserInformationItem),
    /// Maximum length sub-item (51H)
    MaximumLength(u32),
    /// Implementation class UID sub-item (52H)
    ImplementationClassUid(String),
    /// Asynchronous operations window sub-item (53H)
    AsynchronousOperationsWindow(AsynchronousOperationsWindow),
    /// SCP/SCU role selection sub-item (54H)
    RoleSelection(RoleSelection),
    /// Implementation version name sub-item (55H)
    ImplementationVersionName(String),
    /// SOP class extended negotiation sub-item (56H)
    SopClassExtendedNegotiation(SopClassExtendedNegotiation),
    /// User identity negotiation sub-item (58H)
    UserIdentity(UserIdentity),
    /// Any other item, kept as is
    Unsupported { item_type: u8, data: Vec<u8> },
}

impl SubItem {
    /// The wire identifier of this item.
    pub fn item_type(&self) -> u8 {
        match self {
            SubItem::ApplicationContext(_) => item_type::APPLICATION_CONTEXT,
            SubItem::PresentationContext(pc) => pc.kind().item_type(),
            SubItem::AbstractSyntax(_) => item_type::ABSTRACT_SYNTAX,
            SubItem::TransferSyntax(_) => item_type::TRANSFER_SYNTAX,
            SubItem::UserInformation(_) => item_type::USER_INFORMATION,
            SubItem::MaximumLength(_) => item_type::MAXIMUM_LENGTH,
            SubItem::ImplementationClassUid(_) => item_type::IMPLEMENTATION_CLASS_UID,
            SubItem::AsynchronousOperationsWindow(_) => {
                item_type::ASYNCHRONOUS_OPERATIONS_WINDOW
            }
            SubItem::RoleSelection(_) => item_type::ROLE_SELECTION,
            SubItem::ImplementationVersionName(_) => item_type::IMPLEMENTATION_VERSION_NAME,
            SubItem::SopClassExtendedNegotiation(_) => item_type::SOP_CLASS_EXTENDED_NEGOTIATION,
            SubItem::UserIdentity(_) => item_type::USER_IDENTITY,
            SubItem::Unsupported { item_type, .. } => *item_type,
        }
    }
}

#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJResult {
    Permanent = 1,
    Transient = 2,
}

impl AssociationRJResult {
    pub fn from(value: u8) -> Option<AssociationRJResult> {
        match value {
            1 => Some(AssociationRJResult::Permanent),
            2 => Some(AssociationRJResult::Transient),
            _ => None,
        }
    }

    pub fn to_u8(&self) -> u8 {
        match self {
            AssociationRJResult::Permanent => 1,
            AssociationRJResult::Transient => 2,
        }
    }
}

/// Source of an association rejection,
/// with the reason given by that source.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJSource {
    ServiceUser(AssociationRJServiceUserReason),
    ServiceProviderASCE(AssociationRJServiceProviderASCEReason),
    ServiceProviderPresentation(AssociationRJServiceProviderPresentationReason),
}

impl AssociationRJSource {
    /// Interpret the source and reason/diag. fields of an A-ASSOCIATE-RJ.
    pub fn from(source: u8, reason: u8) -> Option<AssociationRJSource> {
        use AssociationRJServiceProviderPresentationReason as Presentation;
        use AssociationRJServiceUserReason as User;

        let result = match (source, reason) {
            (1, 1) => AssociationRJSource::ServiceUser(User::NoReasonGiven),
            (1, 2) => AssociationRJSource::ServiceUser(User::ApplicationContextNameNotSupported),
            (1, 3) => AssociationRJSource::ServiceUser(User::CallingAETitleNotRecognized),
            (1, 7) => AssociationRJSource::ServiceUser(User::CalledAETitleNotRecognized),
            (1, x @ (4..=6 | 8..=10)) => AssociationRJSource::ServiceUser(User::Reserved(x)),
            (2, 1) => AssociationRJSource::ServiceProviderASCE(
                AssociationRJServiceProviderASCEReason::NoReasonGiven,
            ),
            (2, 2) => AssociationRJSource::ServiceProviderASCE(
                AssociationRJServiceProviderASCEReason::ProtocolVersionNotSupported,
            ),
            (3, 1) => AssociationRJSource::ServiceProviderPresentation(
                Presentation::TemporaryCongestion,
            ),
            (3, 2) => AssociationRJSource::ServiceProviderPresentation(
                Presentation::LocalLimitExceeded,
            ),
            (3, x @ (0 | 3..=7)) => {
                AssociationRJSource::ServiceProviderPresentation(Presentation::Reserved(x))
            }
            _ => {
                return None;
            }
        };
        Some(result)
    }

    /// The source field code.
    pub fn source_code(&self) -> u8 {
        match self {
            AssociationRJSource::ServiceUser(_) => 1,
            AssociationRJSource::ServiceProviderASCE(_) => 2,
            AssociationRJSource::ServiceProviderPresentation(_) => 3,
        }
    }

    /// The reason/diag. field code.
    pub fn reason_code(&self) -> u8 {
        match self {
            AssociationRJSource::ServiceUser(reason) => match reason {
                AssociationRJServiceUserReason::NoReasonGiven => 1,
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported => 2,
                AssociationRJServiceUserReason::CallingAETitleNotRecognized => 3,
                AssociationRJServiceUserReason::CalledAETitleNotRecognized => 7,
                AssociationRJServiceUserReason::Reserved(code) => *code,
            },
            AssociationRJSource::ServiceProviderASCE(reason) => match reason {
                AssociationRJServiceProviderASCEReason::NoReasonGiven => 1,
                AssociationRJServiceProviderASCEReason::ProtocolVersionNotSupported => 2,
            },
            AssociationRJSource::ServiceProviderPresentation(reason) => match reason {
                AssociationRJServiceProviderPresentationReason::TemporaryCongestion => 1,
                AssociationRJServiceProviderPresentationReason::LocalLimitExceeded => 2,
                AssociationRJServiceProviderPresentationReason::Reserved(code) => *code,
            },
        }
    }
}

impl Display for AssociationRJSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssociationRJSource::ServiceUser(r) => write!(f, "service user: {}", r),
            AssociationRJSource::ServiceProviderASCE(r) => {
                write!(f, "service provider (ACSE): {}", r)
            }
            AssociationRJSource::ServiceProviderPresentation(r) => {
                write!(f, "service provider (presentation): {}", r)
            }
        }
    }
}

#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceUserReason {
    NoReasonGiven,
    ApplicationContextNameNotSupported,
    CallingAETitleNotRecognized,
    CalledAETitleNotRecognized,
    Reserved(u8),
}

impl Display for AssociationRJServiceUserReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssociationRJServiceUserReason::NoReasonGiven => f.write_str("no reason given"),
            AssociationRJServiceUserReason::ApplicationContextNameNotSupported => {
                f.write_str("application context name not supported")
            }
            AssociationRJServiceUserReason::CallingAETitleNotRecognized => {
                f.write_str("calling AE title not recognized")
            }
            AssociationRJServiceUserReason::CalledAETitleNotRecognized => {
                f.write_str("called AE title not recognized")
            }
            AssociationRJServiceUserReason::Reserved(code) => write!(f, "reserved code {}", code),
        }
    }
}

#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceProviderASCEReason {
    NoReasonGiven,
    ProtocolVersionNotSupported,
}

impl Display for AssociationRJServiceProviderASCEReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssociationRJServiceProviderASCEReason::NoReasonGiven => f.write_str("no reason given"),
            AssociationRJServiceProviderASCEReason::ProtocolVersionNotSupported => {
                f.write_str("protocol version not supported")
            }
        }
    }
}

#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceProviderPresentationReason {
    TemporaryCongestion,
    LocalLimitExceeded,
    Reserved(u8),
}

impl Display for AssociationRJServiceProviderPresentationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssociationRJServiceProviderPresentationReason::TemporaryCongestion => {
                f.write_str("temporary congestion")
            }
            AssociationRJServiceProviderPresentationReason::LocalLimitExceeded => {
                f.write_str("local limit exceeded")
            }
            AssociationRJServiceProviderPresentationReason::Reserved(code) => {
                write!(f, "reserved code {}", code)
            }
        }
    }
}

/// A presentation data value item of a P-DATA-TF PDU:
/// one fragment of a command or data set stream.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PDataValue {
    pub presentation_context_id: u8,
    pub value_type: PDataValueType,
    pub is_last: bool,
    pub data: Vec<u8>,
}

impl PDataValue {
    /// The message control header byte:
    /// bit 0 set for command fragments, bit 1 set for the last fragment.
    pub fn control_header(&self) -> u8 {
        let mut header = 0x00;
        if self.value_type == PDataValueType::Command {
            header |= 0x01;
        }
        if self.is_last {
            header |= 0x02;
        }
        header
    }

    /// The value of the item-length field,
    /// counting the context ID and control header bytes.
    pub fn item_length(&self) -> usize {
        2 + self.data.len()
    }

    pub fn is_command(&self) -> bool {
        self.value_type == PDataValueType::Command
    }
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PDataValueType {
    Command,
    Data,
}

impl PDataValueType {
    pub fn from_control_header(header: u8) -> Self {
        if header & 0x01 != 0 {
            PDataValueType::Command
        } else {
            PDataValueType::Data
        }
    }
}

#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AbortRQSource {
    ServiceUser,
    ServiceProvider(AbortRQServiceProviderReason),
    Reserved,
}

impl AbortRQSource {
    /// Interpret the source and reason/diag. fields of an A-ABORT.
    pub fn from(source: u8, reason: u8) -> Option<AbortRQSource> {
        use AbortRQServiceProviderReason as Reason;

        let result = match (source, reason) {
            (0, _) => AbortRQSource::ServiceUser,
            (1, _) => AbortRQSource::Reserved,
            (2, 0) => AbortRQSource::ServiceProvider(Reason::ReasonNotSpecified),
            (2, 1) => AbortRQSource::ServiceProvider(Reason::UnrecognizedPdu),
            (2, 2) => AbortRQSource::ServiceProvider(Reason::UnexpectedPdu),
            (2, 3) => AbortRQSource::ServiceProvider(Reason::Reserved),
            (2, 4) => AbortRQSource::ServiceProvider(Reason::UnrecognizedPduParameter),
            (2, 5) => AbortRQSource::ServiceProvider(Reason::UnexpectedPduParameter),
            (2, 6) => AbortRQSource::ServiceProvider(Reason::InvalidPduParameter),
            (_, _) => {
                return None;
            }
        };

        Some(result)
    }

    pub fn source_code(&self) -> u8 {
        match self {
            AbortRQSource::ServiceUser => 0,
            AbortRQSource::Reserved => 1,
            AbortRQSource::ServiceProvider(_) => 2,
        }
    }

    /// The reason/diag. field code,
    /// which is only significant for service provider aborts.
    pub fn reason_code(&self) -> u8 {
        match self {
            AbortRQSource::ServiceUser | AbortRQSource::Reserved => 0,
            AbortRQSource::ServiceProvider(reason) => match reason {
                AbortRQServiceProviderReason::ReasonNotSpecified => 0,
                AbortRQServiceProviderReason::UnrecognizedPdu => 1,
                AbortRQServiceProviderReason::UnexpectedPdu => 2,
                AbortRQServiceProviderReason::Reserved => 3,
                AbortRQServiceProviderReason::UnrecognizedPduParameter => 4,
                AbortRQServiceProviderReason::UnexpectedPduParameter => 5,
                AbortRQServiceProviderReason::InvalidPduParameter => 6,
            },
        }
    }
}

impl Display for AbortRQSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortRQSource::ServiceUser => f.write_str("service user"),
            AbortRQSource::Reserved => f.write_str("reserved source"),
            AbortRQSource::ServiceProvider(reason) => write!(f, "service provider: {}", reason),
        }
    }
}

/// An enumeration of supported A-ABORT PDU provider reasons.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AbortRQServiceProviderReason {
    /// Reason Not Specified
    ReasonNotSpecified,
    /// Unrecognized PDU
    UnrecognizedPdu,
    /// Unexpected PDU
    UnexpectedPdu,
    /// Reserved
    Reserved,
    /// Unrecognized PDU parameter
    UnrecognizedPduParameter,
    /// Unexpected PDU parameter
    UnexpectedPduParameter,
    /// Invalid PDU parameter
    InvalidPduParameter,
}

impl Display for AbortRQServiceProviderReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            AbortRQServiceProviderReason::ReasonNotSpecified => "reason not specified",
            AbortRQServiceProviderReason::UnrecognizedPdu => "unrecognized PDU",
            AbortRQServiceProviderReason::UnexpectedPdu => "unexpected PDU",
            AbortRQServiceProviderReason::Reserved => "reserved code",
            AbortRQServiceProviderReason::UnrecognizedPduParameter => "unrecognized PDU parameter",
            AbortRQServiceProviderReason::UnexpectedPduParameter => "unexpected PDU parameter",
            AbortRQServiceProviderReason::InvalidPduParameter => "invalid PDU parameter",
        };
        f.write_str(msg)
    }
}

/// An in-memory representation of a full Protocol Data Unit (PDU).
#[derive(Debug, Clone, Eq, PartialEq, PartialOrd, Hash)]
pub enum Pdu {
    /// Association request (A-ASSOCIATE-RQ)
    AssociationRQ(AssociationRQ),
    /// Association acknowledgement (A-ASSOCIATE-AC)
    AssociationAC(AssociationAC),
    /// Association rejection (A-ASSOCIATE-RJ)
    AssociationRJ(AssociationRJ),
    /// P-Data (P-DATA-TF)
    PData { data: Vec<PDataValue> },
    /// Association release request (A-RELEASE-RQ)
    ReleaseRQ,
    /// Association release reply (A-RELEASE-RP)
    ReleaseRP,
    /// Association abort request (A-ABORT)
    AbortRQ { source: AbortRQSource },
}

impl Pdu {
    /// The wire tag of this PDU.
    pub fn pdu_type(&self) -> PduType {
        match self {
            Pdu::AssociationRQ(_) => PduType::AssociationRQ,
            Pdu::AssociationAC(_) => PduType::AssociationAC,
            Pdu::AssociationRJ(_) => PduType::AssociationRJ,
            Pdu::PData { .. } => PduType::PData,
            Pdu::ReleaseRQ => PduType::ReleaseRQ,
            Pdu::ReleaseRP => PduType::ReleaseRP,
            Pdu::AbortRQ { .. } => PduType::AbortRQ,
        }
    }

    /// Provide a short description of the PDU.
    pub fn short_description(&self) -> impl std::fmt::Display + '_ {
        PduShortDescription(self)
    }
}

struct PduShortDescription<'a>(&'a Pdu);

impl std::fmt::Display for PduShortDescription<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Pdu::AssociationRQ(rq) => write!(
                f,
                "AssociationRQ {{ {} -> {}, {} presentation contexts }}",
                rq.calling_ae_title,
                rq.called_ae_title,
                rq.presentation_contexts.len()
            ),
            Pdu::AssociationAC(ac) => write!(
                f,
                "AssociationAC {{ {} accepted of {} presentation contexts }}",
                ac.presentation_contexts
                    .iter()
                    .filter(|pc| pc.is_accepted())
                    .count(),
                ac.presentation_contexts.len()
            ),
            Pdu::AssociationRJ { .. }
            | Pdu::ReleaseRQ
            | Pdu::ReleaseRP
            | Pdu::AbortRQ { .. } => std::fmt::Debug::fmt(self.0, f),
            Pdu::PData { data } => match data.as_slice() {
                [value] => write!(f, "PData [({:?}, {} bytes)]", value.value_type, value.data.len()),
                [first, second] => write!(
                    f,
                    "PData [({:?}, {} bytes), ({:?}, {} bytes)]",
                    first.value_type,
                    first.data.len(),
                    second.value_type,
                    second.data.len(),
                ),
                _ => write!(f, "PData [{} p-data values]", data.len()),
            },
        }
    }
}

/// An in-memory representation of an association request
#[derive(Debug, Clone, Eq, Hash, PartialEq, PartialOrd)]
pub struct AssociationRQ {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    /// proposed presentation contexts (item type 20H)
    pub presentation_contexts: Vec<PresentationContextItem>,
    pub user_information: UserInformationItem,
    /// variable items of unknown type, kept for forwarding
    pub unsupported_items: Vec<SubItem>,
}

impl From<AssociationRQ> for Pdu {
    fn from(value: AssociationRQ) -> Self {
        Pdu::AssociationRQ(value)
    }
}

/// An in-memory representation of an association acknowledgement
#[derive(Debug, Clone, Eq, Hash, PartialEq, PartialOrd)]
pub struct AssociationAC {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    /// presentation context answers (item type 21H)
    pub presentation_contexts: Vec<PresentationContextItem>,
    pub user_information: UserInformationItem,
    /// variable items of unknown type, kept for forwarding
    pub unsupported_items: Vec<SubItem>,
}

impl From<AssociationAC> for Pdu {
    fn from(value: AssociationAC) -> Self {
        Pdu::AssociationAC(value)
    }
}

/// An in-memory representation of an association rejection.
#[derive(Debug, Clone, Eq, Hash, PartialEq, PartialOrd)]
pub struct AssociationRJ {
    pub result: AssociationRJResult,
    pub source: AssociationRJSource,
}

impl From<AssociationRJ> for Pdu {
    fn from(value: AssociationRJ) -> Self {
        Pdu::AssociationRJ(value)
    }
}
