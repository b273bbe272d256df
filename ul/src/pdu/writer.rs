use crate::pdu::*;
use byteordered::byteorder::{BigEndian, WriteBytesExt};
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use std::io::Write;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Could not write chunk of {} PDU structure", name))]
    WriteChunk {
        /// the name of the PDU structure
        name: &'static str,
        source: WriteChunkError,
    },

    #[snafu(display("Could not write field `{}`", field))]
    WriteField {
        field: &'static str,
        backtrace: Backtrace,
        source: std::io::Error,
    },

    #[snafu(display("Could not write {} reserved bytes", bytes))]
    WriteReserved {
        bytes: u32,
        backtrace: Backtrace,
        source: std::io::Error,
    },

    #[snafu(display("Could not write PDU"))]
    WritePdu {
        backtrace: Backtrace,
        source: std::io::Error,
    },

    /// AE titles must have between 1 and 16 bytes
    #[snafu(display("Invalid {} {:?} ({} bytes)", field, ae_title, ae_title.len()))]
    InvalidAeTitle {
        field: &'static str,
        ae_title: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Field `{}` is too long ({} bytes)", field, length))]
    FieldTooLong {
        field: &'static str,
        length: usize,
        backtrace: Backtrace,
    },

    #[snafu(display("Proposed presentation context {} carries a result", id))]
    ResultOnRequestItem { id: u8, backtrace: Backtrace },

    #[snafu(display("Presentation context answer {} has no result", id))]
    MissingResult { id: u8, backtrace: Backtrace },

    #[snafu(display("Presentation context ID {} is not odd", id))]
    EvenPresentationContextId { id: u8, backtrace: Backtrace },

    #[snafu(display("Missing abstract syntax in presentation context {}", id))]
    MissingAbstractSyntax { id: u8, backtrace: Backtrace },

    #[snafu(display("Multiple abstract syntaxes in presentation context {}", id))]
    MultipleAbstractSyntaxes { id: u8, backtrace: Backtrace },

    /// A proposal needs at least one transfer syntax,
    /// an acceptance needs exactly one
    #[snafu(display("Missing transfer syntax in presentation context {}", id))]
    MissingTransferSyntax { id: u8, backtrace: Backtrace },

    #[snafu(display("Multiple transfer syntaxes in presentation context answer {}", id))]
    MultipleTransferSyntaxes { id: u8, backtrace: Backtrace },

    #[snafu(display("Presentation context {} is of the wrong kind for {}", id, pdu_type))]
    UnexpectedPresentationContext {
        id: u8,
        pdu_type: PduType,
        backtrace: Backtrace,
    },

    #[snafu(display("Item of type 0x{:02X} is not allowed in the {}", item_type, context))]
    UnexpectedSubItem {
        context: &'static str,
        item_type: u8,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum WriteChunkError {
    #[snafu(display("Failed to build chunk"))]
    BuildChunk {
        backtrace: Backtrace,
        source: Box<Error>,
    },
    #[snafu(display("Chunk of {} bytes does not fit in its length field", length))]
    ChunkTooLong { length: usize, backtrace: Backtrace },
    #[snafu(display("Failed to write chunk length"))]
    WriteLength {
        backtrace: Backtrace,
        source: std::io::Error,
    },
    #[snafu(display("Failed to write chunk data"))]
    WriteData {
        backtrace: Backtrace,
        source: std::io::Error,
    },
}

fn write_chunk_u32<F>(writer: &mut dyn Write, func: F) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data).map_err(Box::from).context(BuildChunkSnafu)?;

    let length = u32::try_from(data.len()).ok().context(ChunkTooLongSnafu {
        length: data.len(),
    })?;
    writer
        .write_u32::<BigEndian>(length)
        .context(WriteLengthSnafu)?;

    writer.write_all(&data).context(WriteDataSnafu)?;

    Ok(())
}

fn write_chunk_u16<F>(writer: &mut dyn Write, func: F) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data).map_err(Box::from).context(BuildChunkSnafu)?;

    let length = u16::try_from(data.len()).ok().context(ChunkTooLongSnafu {
        length: data.len(),
    })?;
    writer
        .write_u16::<BigEndian>(length)
        .context(WriteLengthSnafu)?;

    writer.write_all(&data).context(WriteDataSnafu)?;

    Ok(())
}

/// Write a variable item:
/// item type, a reserved byte, and the 2 byte length of the content
/// produced by `func`.
fn write_item<F>(writer: &mut dyn Write, item_type: u8, name: &'static str, func: F) -> Result<()>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    writer
        .write_u8(item_type)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;
    write_chunk_u16(writer, func).context(WriteChunkSnafu { name })
}

/// Encode a whole PDU, header included, into a new buffer.
///
/// PDUs which the peer would refuse to decode,
/// such as an association request with a blank AE title
/// or a presentation context without a transfer syntax,
/// fail with the corresponding error before any byte is produced.
pub fn encode_pdu(pdu: &Pdu) -> Result<Vec<u8>> {
    match pdu {
        Pdu::AssociationRQ(rq) => check_association(
            PduType::AssociationRQ,
            &rq.called_ae_title,
            &rq.calling_ae_title,
            &rq.presentation_contexts,
            &rq.unsupported_items,
        )?,
        Pdu::AssociationAC(ac) => check_association(
            PduType::AssociationAC,
            &ac.called_ae_title,
            &ac.calling_ae_title,
            &ac.presentation_contexts,
            &ac.unsupported_items,
        )?,
        _ => {}
    }

    let mut buffer = Vec::with_capacity(64);
    let writer: &mut dyn Write = &mut buffer;

    // 1 - PDU-type
    writer
        .write_u8(pdu.pdu_type().to_u8())
        .context(WriteFieldSnafu { field: "PDU-type" })?;

    // 2 - Reserved - This reserved field shall be sent with a value 00H but not
    // tested to this value when received.
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    // 3-6 - PDU-length
    write_chunk_u32(writer, |writer| write_pdu_body(writer, pdu)).context(WriteChunkSnafu {
        name: "PDU",
    })?;

    Ok(buffer)
}

/// Encode a PDU and write it to the given destination.
///
/// Nothing is written if the PDU cannot be encoded.
pub fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: Write,
{
    let bytes = encode_pdu(pdu)?;
    writer.write_all(&bytes).context(WritePduSnafu)?;
    Ok(())
}

/// Encode a single variable item or sub-item, header included.
pub fn encode_sub_item(item: &SubItem) -> Result<Vec<u8>> {
    let mut buffer = vec![];
    write_sub_item(&mut buffer, item)?;
    Ok(buffer)
}

fn write_pdu_body(writer: &mut Vec<u8>, pdu: &Pdu) -> Result<()> {
    match pdu {
        Pdu::AssociationRQ(AssociationRQ {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_information,
            unsupported_items,
        }) => {
            write_ae_header(writer, *protocol_version, called_ae_title, calling_ae_title)?;
            write_association_items(
                writer,
                application_context_name,
                presentation_contexts,
                user_information,
                unsupported_items,
            )
        }
        Pdu::AssociationAC(AssociationAC {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_information,
            unsupported_items,
        }) => {
            write_ae_header(writer, *protocol_version, called_ae_title, calling_ae_title)?;
            write_association_items(
                writer,
                application_context_name,
                presentation_contexts,
                user_information,
                unsupported_items,
            )
        }
        Pdu::AssociationRJ(AssociationRJ { result, source }) => {
            // 7 - Reserved
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            // 8 - Result
            writer
                .write_u8(result.to_u8())
                .context(WriteFieldSnafu { field: "Result" })?;

            // 9 - Source
            writer
                .write_u8(source.source_code())
                .context(WriteFieldSnafu { field: "Source" })?;

            // 10 - Reason/Diag.
            writer
                .write_u8(source.reason_code())
                .context(WriteFieldSnafu {
                    field: "Reason/Diag.",
                })?;
            Ok(())
        }
        Pdu::PData { data } => {
            for value in data {
                write_chunk_u32(writer, |writer| {
                    writer
                        .write_u8(value.presentation_context_id)
                        .context(WriteFieldSnafu {
                            field: "Presentation-context-ID",
                        })?;
                    writer
                        .write_u8(value.control_header())
                        .context(WriteFieldSnafu {
                            field: "Message Control Header",
                        })?;
                    writer
                        .write_all(&value.data)
                        .context(WriteFieldSnafu {
                            field: "Presentation-data-value",
                        })?;
                    Ok(())
                })
                .context(WriteChunkSnafu {
                    name: "Presentation-data-value Item",
                })?;
            }
            Ok(())
        }
        Pdu::ReleaseRQ | Pdu::ReleaseRP => {
            // 7-10 - Reserved
            writer
                .write_u32::<BigEndian>(0x00)
                .context(WriteReservedSnafu { bytes: 4_u32 })?;
            Ok(())
        }
        Pdu::AbortRQ { source } => {
            // 7-8 - Reserved
            writer
                .write_u16::<BigEndian>(0x00)
                .context(WriteReservedSnafu { bytes: 2_u32 })?;

            // 9 - Source
            writer
                .write_u8(source.source_code())
                .context(WriteFieldSnafu { field: "Source" })?;

            // 10 - Reason/Diag
            writer
                .write_u8(source.reason_code())
                .context(WriteFieldSnafu {
                    field: "Reason/Diag",
                })?;
            Ok(())
        }
    }
}

fn write_ae_header(
    writer: &mut Vec<u8>,
    protocol_version: u16,
    called_ae_title: &str,
    calling_ae_title: &str,
) -> Result<()> {
    // 7-8 - Protocol-version
    writer
        .write_u16::<BigEndian>(protocol_version)
        .context(WriteFieldSnafu {
            field: "Protocol-version",
        })?;

    // 9-10 - Reserved
    writer
        .write_u16::<BigEndian>(0x00)
        .context(WriteReservedSnafu { bytes: 2_u32 })?;

    // 11-26 - Called-AE-title
    write_ae_title(writer, "Called-AE-title", called_ae_title)?;

    // 27-42 - Calling-AE-title
    write_ae_title(writer, "Calling-AE-title", calling_ae_title)?;

    // 43-74 - Reserved
    writer
        .write_all(&[0; 32])
        .context(WriteReservedSnafu { bytes: 32_u32 })?;

    Ok(())
}

/// Write an AE title padded with trailing spaces to 16 bytes.
/// The title was already checked with [`check_ae_title`].
fn write_ae_title(writer: &mut Vec<u8>, field: &'static str, ae_title: &str) -> Result<()> {
    let mut bytes = [b' '; AE_TITLE_LENGTH];
    for (dst, src) in bytes.iter_mut().zip(ae_title.bytes()) {
        *dst = src;
    }
    writer
        .write_all(&bytes)
        .context(WriteFieldSnafu { field })?;
    Ok(())
}

/// Titles which do not fit are refused, never truncated.
fn check_ae_title(field: &'static str, ae_title: &str, allow_blank: bool) -> Result<()> {
    ensure!(
        ae_title.len() <= AE_TITLE_LENGTH && (allow_blank || !ae_title.trim().is_empty()),
        InvalidAeTitleSnafu { field, ae_title }
    );
    Ok(())
}

fn check_association(
    pdu_type: PduType,
    called_ae_title: &str,
    calling_ae_title: &str,
    presentation_contexts: &[PresentationContextItem],
    unsupported_items: &[SubItem],
) -> Result<()> {
    let (expected_kind, context) = match pdu_type {
        PduType::AssociationRQ => (PresentationContextType::Request, "A-ASSOCIATE-RQ"),
        _ => (PresentationContextType::Response, "A-ASSOCIATE-AC"),
    };

    // the AE titles of an acceptance are returned as received but not tested,
    // so blank titles are tolerated there
    let allow_blank = pdu_type == PduType::AssociationAC;
    check_ae_title("Called-AE-title", called_ae_title, allow_blank)?;
    check_ae_title("Calling-AE-title", calling_ae_title, allow_blank)?;

    for pc in presentation_contexts {
        ensure!(
            pc.kind() == expected_kind,
            UnexpectedPresentationContextSnafu {
                id: pc.id(),
                pdu_type,
            }
        );
        check_presentation_context(pc)?;
    }

    for item in unsupported_items {
        ensure!(
            matches!(item, SubItem::Unsupported { .. }),
            UnexpectedSubItemSnafu {
                context,
                item_type: item.item_type(),
            }
        );
    }

    Ok(())
}

/// Check that the peer can decode the presentation context item,
/// returning the value of its Result/Reason field.
fn check_presentation_context(pc: &PresentationContextItem) -> Result<u8> {
    let id = pc.id();
    ensure!(id % 2 == 1, EvenPresentationContextIdSnafu { id });

    let abstract_syntaxes = pc
        .items()
        .iter()
        .filter(|item| matches!(item, SubItem::AbstractSyntax(_)))
        .count();
    let transfer_syntaxes = pc.transfer_syntaxes().count();

    match (pc.kind(), pc.result()) {
        (PresentationContextType::Request, None) => {
            ensure!(abstract_syntaxes > 0, MissingAbstractSyntaxSnafu { id });
            ensure!(abstract_syntaxes == 1, MultipleAbstractSyntaxesSnafu { id });
            ensure!(transfer_syntaxes > 0, MissingTransferSyntaxSnafu { id });
            Ok(0x00)
        }
        (PresentationContextType::Request, Some(_)) => ResultOnRequestItemSnafu { id }.fail(),
        (PresentationContextType::Response, Some(result)) => {
            ensure!(
                abstract_syntaxes == 0,
                UnexpectedSubItemSnafu {
                    context: "presentation context answer",
                    item_type: item_type::ABSTRACT_SYNTAX,
                }
            );
            ensure!(transfer_syntaxes <= 1, MultipleTransferSyntaxesSnafu { id });
            ensure!(
                transfer_syntaxes == 1 || result != PresentationContextResultReason::Acceptance,
                MissingTransferSyntaxSnafu { id }
            );
            Ok(result.to_u8())
        }
        (PresentationContextType::Response, None) => MissingResultSnafu { id }.fail(),
    }
}

fn write_association_items(
    writer: &mut Vec<u8>,
    application_context_name: &str,
    presentation_contexts: &[PresentationContextItem],
    user_information: &UserInformationItem,
    unsupported_items: &[SubItem],
) -> Result<()> {
    // 75-xxx - Variable items
    write_item(
        writer,
        item_type::APPLICATION_CONTEXT,
        "Application Context Item",
        |writer| {
            writer
                .write_all(application_context_name.as_bytes())
                .context(WriteFieldSnafu {
                    field: "Application-context-name",
                })
        },
    )?;

    for pc in presentation_contexts {
        write_presentation_context(writer, pc)?;
    }

    write_user_information(writer, user_information)?;

    for item in unsupported_items {
        write_sub_item(writer, item)?;
    }

    Ok(())
}

fn write_presentation_context(writer: &mut dyn Write, pc: &PresentationContextItem) -> Result<()> {
    let id = pc.id();
    let result = check_presentation_context(pc)?;

    write_item(
        writer,
        pc.kind().item_type(),
        "Presentation Context Item",
        |writer| {
            // 5 - Presentation-context-ID
            writer.write_u8(id).context(WriteFieldSnafu {
                field: "Presentation-context-ID",
            })?;

            // 6 - Reserved
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            // 7 - Result/Reason, reserved in a proposal
            writer.write_u8(result).context(WriteFieldSnafu {
                field: "Result/Reason",
            })?;

            // 8 - Reserved
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            // 9-xxx - Abstract/Transfer Syntax Sub-Items
            for item in pc.items() {
                write_sub_item(writer, item)?;
            }
            Ok(())
        },
    )
}

fn write_user_information(writer: &mut dyn Write, info: &UserInformationItem) -> Result<()> {
    write_item(
        writer,
        item_type::USER_INFORMATION,
        "User Information Item",
        |writer| {
            for item in &info.items {
                write_sub_item(writer, item)?;
            }
            Ok(())
        },
    )
}

fn write_sub_item(writer: &mut dyn Write, item: &SubItem) -> Result<()> {
    let name = match item {
        SubItem::PresentationContext(pc) => return write_presentation_context(writer, pc),
        SubItem::UserInformation(info) => return write_user_information(writer, info),
        SubItem::ApplicationContext(_) => "Application Context Item",
        SubItem::AbstractSyntax(_) => "Abstract Syntax Sub-Item",
        SubItem::TransferSyntax(_) => "Transfer Syntax Sub-Item",
        SubItem::MaximumLength(_) => "Maximum Length Sub-Item",
        SubItem::ImplementationClassUid(_) => "Implementation Class UID Sub-Item",
        SubItem::AsynchronousOperationsWindow(_) => "Asynchronous Operations Window Sub-Item",
        SubItem::RoleSelection(_) => "SCP/SCU Role Selection Sub-Item",
        SubItem::ImplementationVersionName(_) => "Implementation Version Name Sub-Item",
        SubItem::SopClassExtendedNegotiation(_) => "SOP Class Extended Negotiation Sub-Item",
        SubItem::UserIdentity(_) => "User Identity Sub-Item",
        SubItem::Unsupported { .. } => "Unsupported Item",
    };

    write_item(writer, item.item_type(), name, |writer| match item {
        SubItem::ApplicationContext(text)
        | SubItem::AbstractSyntax(text)
        | SubItem::TransferSyntax(text)
        | SubItem::ImplementationClassUid(text)
        | SubItem::ImplementationVersionName(text) => writer
            .write_all(text.as_bytes())
            .context(WriteFieldSnafu { field: name }),
        SubItem::MaximumLength(length) => writer
            .write_u32::<BigEndian>(*length)
            .context(WriteFieldSnafu {
                field: "Maximum-length-received",
            }),
        SubItem::AsynchronousOperationsWindow(window) => {
            writer
                .write_u16::<BigEndian>(window.max_operations_invoked)
                .context(WriteFieldSnafu {
                    field: "Maximum-number-operations-invoked",
                })?;
            writer
                .write_u16::<BigEndian>(window.max_operations_performed)
                .context(WriteFieldSnafu {
                    field: "Maximum-number-operations-performed",
                })
        }
        SubItem::RoleSelection(role) => {
            write_u16_prefixed(writer, "SOP-class-uid", role.sop_class_uid.as_bytes())?;
            writer
                .write_u8(role.scu_role)
                .context(WriteFieldSnafu { field: "SCU-role" })?;
            writer
                .write_u8(role.scp_role)
                .context(WriteFieldSnafu { field: "SCP-role" })
        }
        SubItem::SopClassExtendedNegotiation(negotiation) => {
            write_u16_prefixed(
                writer,
                "SOP-class-uid",
                negotiation.sop_class_uid.as_bytes(),
            )?;
            writer
                .write_all(&negotiation.service_class_application_information)
                .context(WriteFieldSnafu {
                    field: "Service-class-application-information",
                })
        }
        SubItem::UserIdentity(identity) => {
            writer
                .write_u8(identity.identity_type().to_u8())
                .context(WriteFieldSnafu {
                    field: "User-Identity-Type",
                })?;
            writer
                .write_u8(u8::from(identity.positive_response_requested()))
                .context(WriteFieldSnafu {
                    field: "Positive-response-requested",
                })?;
            write_u16_prefixed(writer, "Primary-field", identity.primary_field())?;
            write_u16_prefixed(writer, "Secondary-field", identity.secondary_field())
        }
        SubItem::Unsupported { data, .. } => writer
            .write_all(data)
            .context(WriteFieldSnafu { field: name }),
        SubItem::PresentationContext(_) | SubItem::UserInformation(_) => Ok(()),
    })
}

fn write_u16_prefixed(writer: &mut Vec<u8>, field: &'static str, bytes: &[u8]) -> Result<()> {
    let length = u16::try_from(bytes.len())
        .ok()
        .context(FieldTooLongSnafu {
            field,
            length: bytes.len(),
        })?;
    writer
        .write_u16::<BigEndian>(length)
        .context(WriteFieldSnafu { field })?;
    writer.write_all(bytes).context(WriteFieldSnafu { field })?;
    Ok(())
}
