use dicom_dul::pdu::reader::Error as ReadError;
use dicom_dul::pdu::writer::Error as WriteError;
use dicom_dul::pdu::{
    encode_pdu, encode_sub_item, read_pdu, read_sub_item, write_pdu, AbortRQServiceProviderReason,
    AbortRQSource, AssociationAC, AssociationRJ, AssociationRJResult,
    AssociationRJServiceProviderPresentationReason, AssociationRJServiceUserReason,
    AssociationRJSource, AssociationRQ, AsynchronousOperationsWindow, PDataValue,
    PDataValueType, Pdu, PduCursor, PresentationContextItem, PresentationContextResultReason,
    PresentationContextType,
    RoleSelection, SopClassExtendedNegotiation, SubItem, UserIdentity, UserIdentityType,
    UserInformationItem, DEFAULT_MAX_PDU, DICOM_APPLICATION_CONTEXT_NAME, PROTOCOL_VERSION,
};
use matches::assert_matches;
use rstest::rstest;

static VERIFICATION: &str = "1.2.840.10008.1.1";
static CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
static EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

fn association_rq() -> AssociationRQ {
    AssociationRQ {
        protocol_version: PROTOCOL_VERSION,
        calling_ae_title: "CALLING AE".to_string(),
        called_ae_title: "CALLED AE".to_string(),
        application_context_name: DICOM_APPLICATION_CONTEXT_NAME.to_string(),
        presentation_contexts: vec![
            PresentationContextItem::request(1, VERIFICATION, [IMPLICIT_VR_LE, EXPLICIT_VR_LE])
                .unwrap(),
            PresentationContextItem::request(3, CT_IMAGE_STORAGE, [EXPLICIT_VR_LE]).unwrap(),
        ],
        user_information: UserInformationItem::new(vec![
            SubItem::MaximumLength(DEFAULT_MAX_PDU),
            SubItem::ImplementationClassUid("1.2.3.4".to_string()),
            SubItem::AsynchronousOperationsWindow(AsynchronousOperationsWindow {
                max_operations_invoked: 1,
                max_operations_performed: 1,
            }),
            SubItem::RoleSelection(RoleSelection {
                sop_class_uid: CT_IMAGE_STORAGE.to_string(),
                scu_role: 1,
                scp_role: 0,
            }),
            SubItem::ImplementationVersionName("TEST 1.0".to_string()),
            SubItem::SopClassExtendedNegotiation(SopClassExtendedNegotiation {
                sop_class_uid: CT_IMAGE_STORAGE.to_string(),
                service_class_application_information: vec![1, 1, 0, 1, 1, 0, 1],
            }),
            SubItem::UserIdentity(UserIdentity::new(
                true,
                UserIdentityType::UsernamePassword,
                b"MyUsername".to_vec(),
                b"MyPassword".to_vec(),
            )),
        ]),
        unsupported_items: vec![],
    }
}

fn association_ac() -> AssociationAC {
    AssociationAC {
        protocol_version: PROTOCOL_VERSION,
        calling_ae_title: "CALLING AE".to_string(),
        called_ae_title: "CALLED AE".to_string(),
        application_context_name: DICOM_APPLICATION_CONTEXT_NAME.to_string(),
        presentation_contexts: vec![
            PresentationContextItem::response(
                1,
                PresentationContextResultReason::Acceptance,
                Some(IMPLICIT_VR_LE.to_string()),
            )
            .unwrap(),
            PresentationContextItem::response(
                3,
                PresentationContextResultReason::AbstractSyntaxNotSupported,
                None,
            )
            .unwrap(),
        ],
        user_information: UserInformationItem::new(vec![
            SubItem::MaximumLength(0),
            SubItem::ImplementationClassUid("1.2.3.4.5".to_string()),
        ]),
        unsupported_items: vec![],
    }
}

#[rstest]
#[case::association_rq(Pdu::AssociationRQ(association_rq()))]
#[case::association_ac(Pdu::AssociationAC(association_ac()))]
#[case::association_rj(Pdu::AssociationRJ(AssociationRJ {
    result: AssociationRJResult::Transient,
    source: AssociationRJSource::ServiceProviderPresentation(
        AssociationRJServiceProviderPresentationReason::TemporaryCongestion,
    ),
}))]
#[case::pdata(Pdu::PData {
    data: vec![
        PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Command,
            is_last: true,
            data: vec![0x55; 64],
        },
        PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Data,
            is_last: false,
            data: vec![],
        },
    ],
})]
#[case::release_rq(Pdu::ReleaseRQ)]
#[case::release_rp(Pdu::ReleaseRP)]
#[case::abort_user(Pdu::AbortRQ { source: AbortRQSource::ServiceUser })]
#[case::abort_provider(Pdu::AbortRQ {
    source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu),
})]
fn can_read_write_pdu(#[case] pdu: Pdu) {
    let mut bytes = vec![];
    write_pdu(&mut bytes, &pdu).unwrap();
    assert_eq!(bytes, encode_pdu(&pdu).unwrap());

    // the declared length covers the rest of the PDU
    let length = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
    assert_eq!(length as usize, bytes.len() - 6);
    assert_eq!(bytes[0], pdu.pdu_type().to_u8());

    let mut reader = &bytes[..];
    let decoded = read_pdu(&mut reader, DEFAULT_MAX_PDU).unwrap();
    assert_eq!(decoded, pdu);
    assert!(reader.is_empty());
}

#[test]
fn association_rq_fields_survive() {
    let bytes = encode_pdu(&association_rq().into()).unwrap();
    let rq = match read_pdu(&mut &bytes[..], DEFAULT_MAX_PDU).unwrap() {
        Pdu::AssociationRQ(rq) => rq,
        pdu => panic!("unexpected {}", pdu.short_description()),
    };

    assert_eq!(rq.calling_ae_title, "CALLING AE");
    assert_eq!(rq.called_ae_title, "CALLED AE");
    assert_eq!(rq.presentation_contexts.len(), 2);
    assert_eq!(rq.presentation_contexts[0].abstract_syntax(), Some(VERIFICATION));
    assert_eq!(
        rq.presentation_contexts[0].transfer_syntaxes().collect::<Vec<_>>(),
        vec![IMPLICIT_VR_LE, EXPLICIT_VR_LE]
    );
    assert_eq!(rq.user_information.max_length(), Some(DEFAULT_MAX_PDU));
    assert_eq!(rq.user_information.implementation_class_uid(), Some("1.2.3.4"));
    assert_eq!(rq.user_information.implementation_version_name(), Some("TEST 1.0"));
    let role = rq.user_information.role_selections().next().unwrap();
    assert_eq!(role.scu_role, 1);
    assert_eq!(role.scp_role, 0);
    let identity = rq.user_information.user_identity().unwrap();
    assert_eq!(identity.identity_type(), UserIdentityType::UsernamePassword);
    assert_eq!(identity.primary_field(), b"MyUsername");
    assert_eq!(identity.secondary_field(), b"MyPassword");
}

#[test]
fn association_rq_layout() {
    let bytes = encode_pdu(&association_rq().into()).unwrap();
    // protocol version, reserved
    assert_eq!(&bytes[6..10], &[0x00, 0x01, 0x00, 0x00]);
    // AE titles are space padded to 16 bytes, called first
    assert_eq!(&bytes[10..26], b"CALLED AE       ");
    assert_eq!(&bytes[26..42], b"CALLING AE      ");
    assert_eq!(&bytes[42..74], &[0; 32]);
    // application context item comes first
    assert_eq!(bytes[74], 0x10);
    assert_eq!(
        u16::from_be_bytes([bytes[76], bytes[77]]) as usize,
        DICOM_APPLICATION_CONTEXT_NAME.len()
    );
}

/// P-DATA-TF with one command fragment of 2 bytes
#[test]
fn pdata_layout() {
    let pdu = Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Command,
            is_last: true,
            data: vec![0xAB, 0xCD],
        }],
    };
    assert_eq!(
        encode_pdu(&pdu).unwrap(),
        vec![
            0x04, 0x00, 0x00, 0x00, 0x00, 0x08, // header
            0x00, 0x00, 0x00, 0x04, // item length
            0x01, // presentation context ID
            0x03, // command, last
            0xAB, 0xCD,
        ]
    );
}

#[test]
fn unknown_pdu_type_is_refused() {
    let bytes = [0x08, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00];
    assert_matches!(
        read_pdu(&mut &bytes[..], DEFAULT_MAX_PDU),
        Err(ReadError::UnknownPduType { pdu_type: 0x08, .. })
    );
}

#[test]
fn oversized_pdu_is_refused_before_reading() {
    // declares 32768 bytes but carries none
    let bytes = [0x04, 0x00, 0x00, 0x00, 0x80, 0x00];
    assert_matches!(
        read_pdu(&mut &bytes[..], DEFAULT_MAX_PDU),
        Err(ReadError::PduTooLarge {
            pdu_length: 0x8000,
            max_pdu_length: DEFAULT_MAX_PDU,
            ..
        })
    );
}

#[test]
fn pdu_above_maximum_is_tolerated() {
    let pdu = Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Data,
            is_last: true,
            data: vec![0; 5000],
        }],
    };
    let bytes = encode_pdu(&pdu).unwrap();
    assert_eq!(read_pdu(&mut &bytes[..], 4096).unwrap(), pdu);
}

#[test]
fn end_of_stream() {
    assert_matches!(
        read_pdu(&mut &[][..], DEFAULT_MAX_PDU),
        Err(ReadError::NoPduAvailable { .. })
    );
    // a truncated PDU is not a clean end of stream
    let bytes = encode_pdu(&Pdu::ReleaseRQ).unwrap();
    assert_matches!(
        read_pdu(&mut &bytes[..7], DEFAULT_MAX_PDU),
        Err(ReadError::ReadPdu { .. })
    );
}

#[test]
fn trailing_bytes_in_release_rq() {
    let bytes = [0x05, 0x00, 0x00, 0x00, 0x00, 0x05, 0, 0, 0, 0, 0];
    assert_matches!(
        read_pdu(&mut &bytes[..], DEFAULT_MAX_PDU),
        Err(ReadError::TrailingData { remaining: 1, .. })
    );
}

#[test]
fn consecutive_pdus_from_one_stream() {
    let mut bytes = encode_pdu(&Pdu::ReleaseRQ).unwrap();
    bytes.extend(encode_pdu(&Pdu::ReleaseRP).unwrap());

    let mut reader = &bytes[..];
    assert_eq!(read_pdu(&mut reader, DEFAULT_MAX_PDU).unwrap(), Pdu::ReleaseRQ);
    assert_eq!(read_pdu(&mut reader, DEFAULT_MAX_PDU).unwrap(), Pdu::ReleaseRP);
    assert_matches!(
        read_pdu(&mut reader, DEFAULT_MAX_PDU),
        Err(ReadError::NoPduAvailable { .. })
    );
}

#[test]
fn unknown_sub_items_are_kept() {
    let mut rq = association_rq();
    rq.user_information.items.push(SubItem::Unsupported {
        item_type: 0x5F,
        data: vec![1, 2, 3],
    });
    let bytes = encode_pdu(&rq.clone().into()).unwrap();
    assert_eq!(read_pdu(&mut &bytes[..], DEFAULT_MAX_PDU).unwrap(), rq.into());
}

#[test]
fn ae_title_too_long() {
    let mut rq = association_rq();
    rq.calling_ae_title = "A-VERY-LONG-AE-TITLE".to_string();
    assert_matches!(
        encode_pdu(&rq.into()),
        Err(WriteError::InvalidAeTitle { .. })
    );
}

#[test]
fn blank_ae_title_in_request() {
    let mut rq = association_rq();
    rq.called_ae_title = "   ".to_string();
    assert_matches!(
        encode_pdu(&rq.into()),
        Err(WriteError::InvalidAeTitle { .. })
    );
}

#[test]
fn presentation_context_without_transfer_syntax_is_not_encoded() {
    let mut rq = association_rq();
    rq.presentation_contexts.push(
        PresentationContextItem::from_parts(
            PresentationContextType::Request,
            5,
            None,
            vec![SubItem::AbstractSyntax(CT_IMAGE_STORAGE.to_string())],
        )
        .unwrap(),
    );
    assert_matches!(
        encode_pdu(&rq.into()),
        Err(WriteError::MissingTransferSyntax { id: 5, .. })
    );

    let mut ac = association_ac();
    ac.presentation_contexts.push(
        PresentationContextItem::from_parts(
            PresentationContextType::Response,
            5,
            Some(PresentationContextResultReason::Acceptance),
            vec![],
        )
        .unwrap(),
    );
    assert_matches!(
        encode_pdu(&ac.into()),
        Err(WriteError::MissingTransferSyntax { id: 5, .. })
    );
}

#[test]
fn every_encoded_presentation_context_can_be_decoded() {
    let mut ac = association_ac();
    ac.presentation_contexts.push(
        PresentationContextItem::from_parts(
            PresentationContextType::Response,
            5,
            Some(PresentationContextResultReason::TransferSyntaxesNotSupported),
            vec![],
        )
        .unwrap(),
    );
    let pdu: Pdu = ac.into();
    let bytes = encode_pdu(&pdu).unwrap();
    assert_eq!(read_pdu(&mut &bytes[..], DEFAULT_MAX_PDU).unwrap(), pdu);
}

#[rstest]
#[case::version_name(SubItem::ImplementationVersionName("MYAPP 1.0 ".to_string()))]
#[case::class_uid(SubItem::ImplementationClassUid("1.2.3.4 ".to_string()))]
#[case::abstract_syntax(SubItem::AbstractSyntax(" 1.2.3".to_string()))]
fn text_keeps_its_spaces(#[case] item: SubItem) {
    let bytes = encode_sub_item(&item).unwrap();
    let mut cursor = PduCursor::new(&bytes);
    assert_eq!(read_sub_item(&mut cursor).unwrap(), item);
}

#[rstest]
#[case::maximum_length(SubItem::MaximumLength(32768), &[0x51, 0x00, 0x00, 0x04, 0x00, 0x00, 0x80, 0x00])]
#[case::async_window(
    SubItem::AsynchronousOperationsWindow(AsynchronousOperationsWindow {
        max_operations_invoked: 2,
        max_operations_performed: 3,
    }),
    &[0x53, 0x00, 0x00, 0x04, 0x00, 0x02, 0x00, 0x03]
)]
#[case::transfer_syntax(
    SubItem::TransferSyntax(IMPLICIT_VR_LE.to_string()),
    b"\x40\x00\x00\x111.2.840.10008.1.2"
)]
fn sub_item_bytes(#[case] item: SubItem, #[case] expected: &[u8]) {
    let bytes = encode_sub_item(&item).unwrap();
    assert_eq!(bytes, expected);

    let mut cursor = PduCursor::new(&bytes);
    assert_eq!(read_sub_item(&mut cursor).unwrap(), item);
    assert!(cursor.is_empty());
}

#[test]
fn sub_item_padding_is_trimmed() {
    // UID padded with a trailing null byte
    let bytes = b"\x30\x00\x00\x121.2.840.10008.1.1\0";
    let mut cursor = PduCursor::new(bytes);
    assert_eq!(
        read_sub_item(&mut cursor).unwrap(),
        SubItem::AbstractSyntax(VERIFICATION.to_string())
    );
}

#[test]
fn maximum_length_item_of_wrong_size() {
    let bytes = [0x51, 0x00, 0x00, 0x02, 0x40, 0x00];
    let mut cursor = PduCursor::new(&bytes);
    assert_matches!(
        read_sub_item(&mut cursor),
        Err(ReadError::InvalidItemLength { length: 2, .. })
    );
}

#[test]
fn rejection_codes() {
    let rj = Pdu::AssociationRJ(AssociationRJ {
        result: AssociationRJResult::Permanent,
        source: AssociationRJSource::ServiceUser(
            AssociationRJServiceUserReason::CallingAETitleNotRecognized,
        ),
    });
    assert_eq!(
        encode_pdu(&rj).unwrap(),
        vec![0x03, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x01, 0x01, 0x03]
    );
}
