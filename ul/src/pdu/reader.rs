/// PDU reader module
use crate::pdu::cursor::PduCursor;
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, ReadBytesExt};
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use std::io::{ErrorKind, Read};
use tracing::warn;

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

#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Invalid max PDU length {}", max_pdu_length))]
    InvalidMaxPdu {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("No PDU available"))]
    NoPduAvailable { backtrace: Backtrace },

    #[snafu(display("Could not read PDU"))]
    ReadPdu {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not read PDU field `{}`", field))]
    ReadPduField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Incoming pdu was too large: length {}, maximum is {}",
        pdu_length,
        max_pdu_length
    ))]
    PduTooLarge {
        pdu_length: u32,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("Unknown PDU type 0x{:02X}", pdu_type))]
    UnknownPduType { pdu_type: u8, backtrace: Backtrace },

    #[snafu(display(
        "Field `{}` needs {} bytes but only {} are left in the item",
        field,
        needed,
        available
    ))]
    ShortRead {
        field: &'static str,
        needed: usize,
        available: usize,
        backtrace: Backtrace,
    },

    #[snafu(display("{} trailing bytes at the end of the {}", remaining, region))]
    TrailingData {
        region: &'static str,
        remaining: usize,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid length {} for {} item", length, item))]
    InvalidItemLength {
        item: &'static str,
        length: usize,
        backtrace: Backtrace,
    },

    #[snafu(display("Presentation context ID {} is not odd", id))]
    EvenPresentationContextId { id: u8, backtrace: Backtrace },

    #[snafu(display("Unsupported protocol version {:#06x}", version))]
    UnsupportedProtocolVersion { version: u16, backtrace: Backtrace },

    #[snafu(display("Could not decode text field `{}`", field))]
    InvalidText {
        field: &'static str,
        source: std::str::Utf8Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid presentation context result reason {}", code))]
    InvalidPresentationContextResultReason { code: u8, backtrace: Backtrace },

    #[snafu(display("Invalid association rejection result {}", result))]
    InvalidRejectResult { result: u8, backtrace: Backtrace },

    #[snafu(display(
        "Invalid reject source {} or reason {}",
        source_code,
        reason_code
    ))]
    InvalidRejectSourceOrReason {
        source_code: u8,
        reason_code: u8,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid abort source {} or reason {}", source_code, reason_code))]
    InvalidAbortSourceOrReason {
        source_code: u8,
        reason_code: u8,
        backtrace: Backtrace,
    },

    #[snafu(display("Missing {} item in {}", item, pdu_type))]
    MissingSubItem {
        pdu_type: PduType,
        item: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("Duplicate {} item in {}", item, pdu_type))]
    DuplicateSubItem {
        pdu_type: PduType,
        item: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("Item of type 0x{:02X} is not allowed in the {}", item_type, context))]
    UnexpectedSubItem {
        context: &'static str,
        item_type: u8,
        backtrace: Backtrace,
    },

    #[snafu(display("Missing abstract syntax in presentation context {}", id))]
    MissingAbstractSyntax { id: u8, backtrace: Backtrace },

    #[snafu(display("Multiple abstract syntaxes in presentation context {}", id))]
    MultipleAbstractSyntaxes { id: u8, backtrace: Backtrace },

    #[snafu(display("Missing transfer syntax in presentation context {}", id))]
    MissingTransferSyntax { id: u8, backtrace: Backtrace },

    #[snafu(display("Multiple transfer syntaxes were accepted in presentation context {}", id))]
    MultipleTransferSyntaxesAccepted { id: u8, backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Read a single PDU from the given source.
///
/// `max_pdu_length` is the maximum PDU length that the caller agreed to
/// receive. A PDU declaring a length of twice this value or more
/// is refused before its body is read,
/// smaller excesses are tolerated.
///
/// A clean end of stream before the first byte of the PDU
/// is reported as [`Error::NoPduAvailable`].
pub fn read_pdu<R>(reader: &mut R, max_pdu_length: u32) -> Result<Pdu>
where
    R: Read,
{
    ensure!(max_pdu_length > 0, InvalidMaxPduSnafu { max_pdu_length });

    // Whether the peer closed the connection in between PDUs
    // is only known by the first byte.
    let mut pdu_type = [0; 1];
    if let Err(e) = reader.read_exact(&mut pdu_type) {
        ensure!(e.kind() != ErrorKind::UnexpectedEof, NoPduAvailableSnafu);
        return Err(e).context(ReadPduFieldSnafu { field: "type" });
    }
    let pdu_type = pdu_type[0];

    reader
        .read_u8()
        .context(ReadPduFieldSnafu { field: "reserved" })?;
    let pdu_length = reader
        .read_u32::<BigEndian>()
        .context(ReadPduFieldSnafu { field: "length" })?;

    let pdu_type = check_pdu_header(pdu_type, pdu_length, max_pdu_length)?;

    let mut bytes = vec![0; pdu_length as usize];
    reader.read_exact(&mut bytes).context(ReadPduSnafu)?;

    read_pdu_body(pdu_type, &bytes)
}

/// Validate the type and length of an incoming PDU
/// before its body is read.
///
/// Fails if the length is twice `max_pdu_length` or more,
/// or if the PDU type is unknown.
pub fn check_pdu_header(pdu_type: u8, pdu_length: u32, max_pdu_length: u32) -> Result<PduType> {
    ensure!(max_pdu_length > 0, InvalidMaxPduSnafu { max_pdu_length });
    ensure!(
        u64::from(pdu_length) < 2 * u64::from(max_pdu_length),
        PduTooLargeSnafu {
            pdu_length,
            max_pdu_length
        }
    );
    if pdu_length > max_pdu_length {
        warn!(
            "Incoming PDU length {} exceeds the maximum of {}",
            pdu_length, max_pdu_length
        );
    }

    PduType::from_u8(pdu_type).context(UnknownPduTypeSnafu { pdu_type })
}

/// Decode the body of a PDU,
/// which must span the whole of `bytes`.
pub fn read_pdu_body(pdu_type: PduType, bytes: &[u8]) -> Result<Pdu> {
    let mut cursor = PduCursor::new(bytes);
    let pdu = match pdu_type {
        PduType::AssociationRQ => {
            let body = read_association_body(&mut cursor, pdu_type)?;
            Pdu::AssociationRQ(AssociationRQ {
                protocol_version: body.protocol_version,
                calling_ae_title: body.calling_ae_title,
                called_ae_title: body.called_ae_title,
                application_context_name: body.application_context_name,
                presentation_contexts: body.presentation_contexts,
                user_information: body.user_information,
                unsupported_items: body.unsupported_items,
            })
        }
        PduType::AssociationAC => {
            let body = read_association_body(&mut cursor, pdu_type)?;
            Pdu::AssociationAC(AssociationAC {
                protocol_version: body.protocol_version,
                calling_ae_title: body.calling_ae_title,
                called_ae_title: body.called_ae_title,
                application_context_name: body.application_context_name,
                presentation_contexts: body.presentation_contexts,
                user_information: body.user_information,
                unsupported_items: body.unsupported_items,
            })
        }
        PduType::AssociationRJ => {
            // 7 - Reserved - This reserved field shall be sent with a value 00H but not tested to
            // this value when received.
            cursor.skip_reserved(1)?;

            let result = cursor.read_u8("result")?;
            let result =
                AssociationRJResult::from(result).context(InvalidRejectResultSnafu { result })?;

            let source_code = cursor.read_u8("source")?;
            let reason_code = cursor.read_u8("reason/diag.")?;
            let source = AssociationRJSource::from(source_code, reason_code).context(
                InvalidRejectSourceOrReasonSnafu {
                    source_code,
                    reason_code,
                },
            )?;

            Pdu::AssociationRJ(AssociationRJ { result, source })
        }
        PduType::PData => {
            let mut values = vec![];
            while !cursor.is_empty() {
                values.push(read_pdata_value(&mut cursor)?);
            }
            Pdu::PData { data: values }
        }
        PduType::ReleaseRQ => {
            cursor.skip_reserved(4)?;
            Pdu::ReleaseRQ
        }
        PduType::ReleaseRP => {
            cursor.skip_reserved(4)?;
            Pdu::ReleaseRP
        }
        PduType::AbortRQ => {
            // 7-8 - Reserved
            cursor.skip_reserved(2)?;

            let source_code = cursor.read_u8("source")?;
            let reason_code = cursor.read_u8("reason/diag.")?;
            let source = AbortRQSource::from(source_code, reason_code).context(
                InvalidAbortSourceOrReasonSnafu {
                    source_code,
                    reason_code,
                },
            )?;

            Pdu::AbortRQ { source }
        }
    };

    cursor.finish("PDU")?;
    Ok(pdu)
}

/// The parts shared by A-ASSOCIATE-RQ and A-ASSOCIATE-AC.
struct AssociationBody {
    protocol_version: u16,
    calling_ae_title: String,
    called_ae_title: String,
    application_context_name: String,
    presentation_contexts: Vec<PresentationContextItem>,
    user_information: UserInformationItem,
    unsupported_items: Vec<SubItem>,
}

fn read_association_body(
    cursor: &mut PduCursor<'_>,
    pdu_type: PduType,
) -> Result<AssociationBody> {
    // 7-8 - Protocol-version - This two byte field shall use one bit to identify each version
    // of the DICOM UL protocol supported by the calling end-system. This is Version 1 and
    // shall be identified with bit 0 set.
    let protocol_version = cursor.read_u16("protocol version")?;
    ensure!(
        protocol_version & 0x0001 != 0,
        UnsupportedProtocolVersionSnafu {
            version: protocol_version
        }
    );

    // 9-10 - Reserved
    cursor.skip_reserved(2)?;

    // 11-26 - Called-AE-title, 27-42 - Calling-AE-title.
    // Leading and trailing spaces are non-significant.
    let called_ae_title = read_ae_title(cursor, "Called-AE-title")?;
    let calling_ae_title = read_ae_title(cursor, "Calling-AE-title")?;

    // 43-74 - Reserved
    cursor.skip_reserved(32)?;

    let expected_kind = match pdu_type {
        PduType::AssociationRQ => PresentationContextType::Request,
        _ => PresentationContextType::Response,
    };
    let context = match pdu_type {
        PduType::AssociationRQ => "A-ASSOCIATE-RQ",
        _ => "A-ASSOCIATE-AC",
    };

    let mut application_context_name = None;
    let mut presentation_contexts = vec![];
    let mut user_information = None;
    let mut unsupported_items = vec![];

    // 75-xxx - Variable items - one Application Context Item,
    // one or more Presentation Context Items and one User Information Item.
    while !cursor.is_empty() {
        match read_sub_item(cursor)? {
            SubItem::ApplicationContext(name) => {
                ensure!(
                    application_context_name.is_none(),
                    DuplicateSubItemSnafu {
                        pdu_type,
                        item: "application context"
                    }
                );
                application_context_name = Some(name);
            }
            SubItem::PresentationContext(pc) => {
                ensure!(
                    pc.kind() == expected_kind,
                    UnexpectedSubItemSnafu {
                        context,
                        item_type: pc.kind().item_type(),
                    }
                );
                presentation_contexts.push(pc);
            }
            SubItem::UserInformation(info) => {
                ensure!(
                    user_information.is_none(),
                    DuplicateSubItemSnafu {
                        pdu_type,
                        item: "user information"
                    }
                );
                user_information = Some(info);
            }
            item @ SubItem::Unsupported { .. } => {
                warn!(
                    "Unsupported variable item 0x{:02X} in {}",
                    item.item_type(),
                    context
                );
                unsupported_items.push(item);
            }
            item => {
                return UnexpectedSubItemSnafu {
                    context,
                    item_type: item.item_type(),
                }
                .fail();
            }
        }
    }

    let application_context_name = application_context_name.context(MissingSubItemSnafu {
        pdu_type,
        item: "application context",
    })?;
    ensure!(
        !presentation_contexts.is_empty(),
        MissingSubItemSnafu {
            pdu_type,
            item: "presentation context"
        }
    );
    let user_information = user_information.context(MissingSubItemSnafu {
        pdu_type,
        item: "user information",
    })?;

    Ok(AssociationBody {
        protocol_version,
        calling_ae_title,
        called_ae_title,
        application_context_name,
        presentation_contexts,
        user_information,
        unsupported_items,
    })
}

fn read_pdata_value(cursor: &mut PduCursor<'_>) -> Result<PDataValue> {
    // Item-length, counting the presentation context ID and the
    // message control header
    let item_length = cursor.read_u32("Item-Length")? as usize;
    ensure!(
        item_length >= 2,
        InvalidItemLengthSnafu {
            item: "presentation data value",
            length: item_length,
        }
    );
    let mut item = cursor.sub_cursor("Presentation-data-value", item_length)?;

    let presentation_context_id = item.read_u8("Presentation-context-ID")?;

    // Message Control Header:
    // bit 0 set means command information, unset means data set information;
    // bit 1 set means last fragment.
    let header = item.read_u8("Message Control Header")?;
    if header & 0xFC != 0 {
        warn!("Reserved bits set in message control header {:#04x}", header);
    }

    Ok(PDataValue {
        presentation_context_id,
        value_type: PDataValueType::from_control_header(header),
        is_last: header & 0x02 != 0,
        data: item.read_rest().to_vec(),
    })
}

/// Read the 4 byte header of a variable item,
/// returning its type and a cursor over its body.
fn read_item_header<'a>(cursor: &mut PduCursor<'a>) -> Result<(u8, PduCursor<'a>)> {
    let item_type = cursor.read_u8("Item-type")?;
    cursor.skip_reserved(1)?;
    let item_length = cursor.read_u16("Item-length")?;
    let body = cursor.sub_cursor("Item body", usize::from(item_length))?;
    Ok((item_type, body))
}

/// Decode one variable item or sub-item from the cursor,
/// including its 4 byte header.
///
/// Items of a type not known by this implementation,
/// or a known type in a place where it is not defined,
/// are retained as [`SubItem::Unsupported`].
pub fn read_sub_item(cursor: &mut PduCursor<'_>) -> Result<SubItem> {
    let (item_type, body) = read_item_header(cursor)?;
    read_sub_item_body(item_type, body)
}

fn read_sub_item_body(item_type: u8, mut body: PduCursor<'_>) -> Result<SubItem> {
    let item = match item_type {
        item_type::APPLICATION_CONTEXT => {
            SubItem::ApplicationContext(read_text(&mut body, "Application-context-name")?)
        }
        item_type::PRESENTATION_CONTEXT_REQUEST => SubItem::PresentationContext(
            read_presentation_context(&mut body, PresentationContextType::Request)?,
        ),
        item_type::PRESENTATION_CONTEXT_RESPONSE => SubItem::PresentationContext(
            read_presentation_context(&mut body, PresentationContextType::Response)?,
        ),
        item_type::ABSTRACT_SYNTAX => {
            SubItem::AbstractSyntax(read_text(&mut body, "Abstract-syntax-name")?)
        }
        item_type::TRANSFER_SYNTAX => {
            SubItem::TransferSyntax(read_text(&mut body, "Transfer-syntax-name")?)
        }
        item_type::USER_INFORMATION => {
            let mut items = vec![];
            while !body.is_empty() {
                let (item_type, sub_body) = read_item_header(&mut body)?;
                let item = match item_type {
                    item_type::MAXIMUM_LENGTH..=item_type::USER_IDENTITY => {
                        read_sub_item_body(item_type, sub_body)?
                    }
                    _ => unsupported(item_type, sub_body),
                };
                items.push(item);
            }
            return Ok(SubItem::UserInformation(UserInformationItem { items }));
        }
        item_type::MAXIMUM_LENGTH => {
            // 5-8 - Maximum-length-received
            ensure!(
                body.remaining() == 4,
                InvalidItemLengthSnafu {
                    item: "maximum length",
                    length: body.remaining(),
                }
            );
            SubItem::MaximumLength(body.read_u32("Maximum-length-received")?)
        }
        item_type::IMPLEMENTATION_CLASS_UID => {
            SubItem::ImplementationClassUid(read_text(&mut body, "Implementation-class-uid")?)
        }
        item_type::ASYNCHRONOUS_OPERATIONS_WINDOW => {
            ensure!(
                body.remaining() == 4,
                InvalidItemLengthSnafu {
                    item: "asynchronous operations window",
                    length: body.remaining(),
                }
            );
            SubItem::AsynchronousOperationsWindow(AsynchronousOperationsWindow {
                max_operations_invoked: body.read_u16("Maximum-number-operations-invoked")?,
                max_operations_performed: body.read_u16("Maximum-number-operations-performed")?,
            })
        }
        item_type::ROLE_SELECTION => {
            let uid_length = body.read_u16("UID-length")?;
            let sop_class_uid =
                read_text_n(&mut body, "SOP-class-uid", usize::from(uid_length))?;
            let scu_role = body.read_u8("SCU-role")?;
            let scp_role = body.read_u8("SCP-role")?;
            SubItem::RoleSelection(RoleSelection {
                sop_class_uid,
                scu_role,
                scp_role,
            })
        }
        item_type::IMPLEMENTATION_VERSION_NAME => SubItem::ImplementationVersionName(
            read_text(&mut body, "Implementation-version-name")?,
        ),
        item_type::SOP_CLASS_EXTENDED_NEGOTIATION => {
            let uid_length = body.read_u16("SOP-class-uid-length")?;
            let sop_class_uid =
                read_text_n(&mut body, "SOP-class-uid", usize::from(uid_length))?;
            SubItem::SopClassExtendedNegotiation(SopClassExtendedNegotiation {
                sop_class_uid,
                service_class_application_information: body.read_rest().to_vec(),
            })
        }
        item_type::USER_IDENTITY => {
            let raw = body.clone();
            let identity_type = body.read_u8("User-Identity-Type")?;
            let Some(identity_type) = UserIdentityType::from(identity_type) else {
                warn!("Unknown user identity type {}", identity_type);
                return Ok(unsupported(item_type, raw));
            };
            let positive_response_requested =
                body.read_u8("Positive-response-requested")? == 1;
            let primary_length = body.read_u16("Primary-field-length")?;
            let primary_field = body
                .read_bytes("Primary-field", usize::from(primary_length))?
                .to_vec();
            let secondary_length = body.read_u16("Secondary-field-length")?;
            let secondary_field = body
                .read_bytes("Secondary-field", usize::from(secondary_length))?
                .to_vec();
            SubItem::UserIdentity(UserIdentity::new(
                positive_response_requested,
                identity_type,
                primary_field,
                secondary_field,
            ))
        }
        _ => return Ok(unsupported(item_type, body)),
    };
    body.finish("sub-item")?;
    Ok(item)
}

fn unsupported(item_type: u8, mut body: PduCursor<'_>) -> SubItem {
    SubItem::Unsupported {
        item_type,
        data: body.read_rest().to_vec(),
    }
}

fn read_presentation_context(
    body: &mut PduCursor<'_>,
    kind: PresentationContextType,
) -> Result<PresentationContextItem> {
    // 5 - Presentation-context-ID - Presentation-context-ID values shall be odd integers
    // between 1 and 255
    let id = body.read_u8("Presentation-context-ID")?;
    ensure!(id % 2 == 1, EvenPresentationContextIdSnafu { id });

    // 6 - Reserved
    body.skip_reserved(1)?;

    // 7 - Result/Reason, reserved in a proposal
    let code = body.read_u8("Result/Reason")?;
    let result = match kind {
        PresentationContextType::Request => None,
        PresentationContextType::Response => Some(
            PresentationContextResultReason::from(code)
                .context(InvalidPresentationContextResultReasonSnafu { code })?,
        ),
    };

    // 8 - Reserved
    body.skip_reserved(1)?;

    // 9-xxx - abstract syntax and transfer syntax sub-items
    let mut items = vec![];
    while !body.is_empty() {
        let (item_type, mut sub_body) = read_item_header(body)?;
        let item = match item_type {
            item_type::ABSTRACT_SYNTAX => {
                SubItem::AbstractSyntax(read_text(&mut sub_body, "Abstract-syntax-name")?)
            }
            item_type::TRANSFER_SYNTAX => {
                SubItem::TransferSyntax(read_text(&mut sub_body, "Transfer-syntax-name")?)
            }
            _ => unsupported(item_type, sub_body),
        };
        items.push(item);
    }

    let abstract_syntaxes = items
        .iter()
        .filter(|item| matches!(item, SubItem::AbstractSyntax(_)))
        .count();
    let transfer_syntaxes = items
        .iter()
        .filter(|item| matches!(item, SubItem::TransferSyntax(_)))
        .count();

    match kind {
        PresentationContextType::Request => {
            ensure!(abstract_syntaxes > 0, MissingAbstractSyntaxSnafu { id });
            ensure!(abstract_syntaxes == 1, MultipleAbstractSyntaxesSnafu { id });
            ensure!(transfer_syntaxes > 0, MissingTransferSyntaxSnafu { id });
        }
        PresentationContextType::Response => {
            ensure!(
                abstract_syntaxes == 0,
                UnexpectedSubItemSnafu {
                    context: "presentation context response",
                    item_type: item_type::ABSTRACT_SYNTAX,
                }
            );
            ensure!(
                transfer_syntaxes <= 1,
                MultipleTransferSyntaxesAcceptedSnafu { id }
            );
            ensure!(
                transfer_syntaxes == 1
                    || result != Some(PresentationContextResultReason::Acceptance),
                MissingTransferSyntaxSnafu { id }
            );
        }
    }

    PresentationContextItem::from_parts(kind, id, result, items)
}

/// Read the rest of the item as a UID or name.
fn read_text(cursor: &mut PduCursor<'_>, field: &'static str) -> Result<String> {
    let n = cursor.remaining();
    read_text_n(cursor, field, n)
}

/// Read `n` bytes as a UID or name,
/// without the trailing null padding of UIDs.
/// Spaces are significant.
fn read_text_n(cursor: &mut PduCursor<'_>, field: &'static str, n: usize) -> Result<String> {
    let bytes = cursor.read_bytes(field, n)?;
    let text = std::str::from_utf8(bytes).context(InvalidTextSnafu { field })?;
    Ok(text.trim_end_matches('\0').to_string())
}

fn read_ae_title(cursor: &mut PduCursor<'_>, field: &'static str) -> Result<String> {
    let bytes = cursor.read_bytes(field, AE_TITLE_LENGTH)?;
    let text = std::str::from_utf8(bytes).context(InvalidTextSnafu { field })?;
    Ok(text.trim_matches(['\0', ' ']).to_string())
}
