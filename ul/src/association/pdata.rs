//! Splitting of outgoing commands and data sets into P-DATA-TF PDUs,
//! and reassembly of the incoming fragments into whole messages.
use bytes::{Bytes, BytesMut};
use snafu::{ensure, Backtrace, Snafu};

use crate::pdu::{PDataValue, PDataValueType, Pdu, PDU_HEADER_SIZE};

/// The bytes of a P-DATA-TF PDU with a single value
/// which are not fragment data:
/// the PDU header, the item length,
/// the presentation context ID and the message control header.
pub const PDATA_OVERHEAD: u32 = PDU_HEADER_SIZE + 4 + 2;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display(
        "Maximum PDU length {} leaves no room for P-Data fragments",
        max_pdu_length
    ))]
    MaxPduTooSmall {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "{:?} fragment for presentation context {} interleaved with pending {:?} message on context {}",
        found_type,
        found_id,
        pending_type,
        pending_id
    ))]
    InterleavedFragment {
        pending_id: u8,
        pending_type: PDataValueType,
        found_id: u8,
        found_type: PDataValueType,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Message of at least {} bytes exceeds the maximum of {}",
        length,
        max_message_length
    ))]
    MessageTooLarge {
        length: usize,
        max_message_length: usize,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The maximum number of data bytes in a single P-Data fragment
/// so that the whole PDU fits in `max_pdu_length` bytes.
pub fn max_fragment_length(max_pdu_length: u32) -> Result<usize> {
    ensure!(
        max_pdu_length > PDATA_OVERHEAD,
        MaxPduTooSmallSnafu { max_pdu_length }
    );
    Ok((max_pdu_length - PDATA_OVERHEAD) as usize)
}

/// Split a command or data set into P-DATA-TF PDUs
/// of one presentation data value each.
///
/// Every PDU produced,
/// once encoded with its header,
/// takes at most `max_pdu_length` bytes.
/// Only the last fragment is marked as such.
/// Empty data still yields one (empty) last fragment.
pub fn fragment(
    presentation_context_id: u8,
    value_type: PDataValueType,
    data: &[u8],
    max_pdu_length: u32,
) -> Result<Fragments<'_>> {
    let max_len = max_fragment_length(max_pdu_length)?;
    Ok(Fragments {
        presentation_context_id,
        value_type,
        chunks: data.chunks(max_len).peekable(),
        empty_pending: data.is_empty(),
    })
}

/// Iterator of P-DATA-TF PDUs, created by [`fragment`].
#[derive(Debug)]
#[must_use]
pub struct Fragments<'a> {
    presentation_context_id: u8,
    value_type: PDataValueType,
    chunks: std::iter::Peekable<std::slice::Chunks<'a, u8>>,
    empty_pending: bool,
}

impl Iterator for Fragments<'_> {
    type Item = Pdu;

    fn next(&mut self) -> Option<Pdu> {
        let (data, is_last) = match self.chunks.next() {
            Some(chunk) => (chunk.to_vec(), self.chunks.peek().is_none()),
            None if self.empty_pending => {
                self.empty_pending = false;
                (vec![], true)
            }
            None => return None,
        };
        Some(Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: self.presentation_context_id,
                value_type: self.value_type,
                is_last,
                data,
            }],
        })
    }
}

/// A complete command or data set,
/// reassembled from one or more P-Data fragments.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct PDataMessage {
    pub presentation_context_id: u8,
    pub value_type: PDataValueType,
    pub data: Bytes,
}

impl PDataMessage {
    pub fn is_command(&self) -> bool {
        self.value_type == PDataValueType::Command
    }
}

/// Accumulates P-Data fragments until a whole message is available.
///
/// Only one message can be pending at a time:
/// a fragment of another presentation context or value type
/// before the last fragment of the pending message
/// is a protocol error.
/// So is a message growing past the maximum message length, if one is set.
#[derive(Debug, Default)]
pub struct Reassembler {
    pending: Option<(u8, PDataValueType)>,
    buffer: BytesMut,
    max_message_length: Option<usize>,
}

impl Reassembler {
    /// Create a reassembler admitting messages of any length.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a reassembler refusing messages
    /// of more than `max_message_length` bytes.
    pub fn with_max_message_length(max_message_length: usize) -> Self {
        Reassembler {
            max_message_length: Some(max_message_length),
            ..Self::default()
        }
    }

    pub fn max_message_length(&self) -> Option<usize> {
        self.max_message_length
    }

    /// Whether some fragments were received
    /// without the last one.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Take in the next fragment,
    /// returning the whole message if it was the last one.
    pub fn push(&mut self, value: PDataValue) -> Result<Option<PDataMessage>> {
        if let Some((pending_id, pending_type)) = self.pending {
            ensure!(
                pending_id == value.presentation_context_id && pending_type == value.value_type,
                InterleavedFragmentSnafu {
                    pending_id,
                    pending_type,
                    found_id: value.presentation_context_id,
                    found_type: value.value_type,
                }
            );
        }

        if let Some(max_message_length) = self.max_message_length {
            let length = self.buffer.len() + value.data.len();
            if length > max_message_length {
                self.reset();
                return MessageTooLargeSnafu {
                    length,
                    max_message_length,
                }
                .fail();
            }
        }

        self.buffer.extend_from_slice(&value.data);

        if value.is_last {
            self.pending = None;
            Ok(Some(PDataMessage {
                presentation_context_id: value.presentation_context_id,
                value_type: value.value_type,
                data: self.buffer.split().freeze(),
            }))
        } else {
            self.pending = Some((value.presentation_context_id, value.value_type));
            Ok(None)
        }
    }

    /// Discard any partial message.
    pub fn reset(&mut self) {
        self.pending = None;
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{encode_pdu, read_pdu, MINIMUM_PDU_SIZE};
    use matches::assert_matches;

    fn values(pdus: Vec<Pdu>) -> Vec<PDataValue> {
        pdus.into_iter()
            .flat_map(|pdu| match pdu {
                Pdu::PData { data } => data,
                pdu => panic!("not P-Data: {:?}", pdu),
            })
            .collect()
    }

    #[test]
    fn fragments_fit_in_the_maximum_pdu_length() {
        let data: Vec<u8> = (0..40_000).map(|i| (i % 251) as u8).collect();
        let pdus: Vec<_> = fragment(1, PDataValueType::Data, &data, 16_384)
            .unwrap()
            .collect();
        assert_eq!(pdus.len(), 3);

        for pdu in &pdus {
            let bytes = encode_pdu(pdu).unwrap();
            assert!(bytes.len() <= 16_384, "PDU of {} bytes", bytes.len());
            // each fragment can be read back under the same limit
            assert_eq!(&read_pdu(&mut &bytes[..], 16_384).unwrap(), pdu);
        }

        let values = values(pdus);
        assert_eq!(
            values.iter().map(|v| v.is_last).collect::<Vec<_>>(),
            vec![false, false, true]
        );
        assert!(values.iter().all(|v| v.value_type == PDataValueType::Data));
        assert_eq!(values[0].data.len(), 16_384 - 12);

        let mut reassembler = Reassembler::new();
        let mut messages = vec![];
        for value in values {
            if let Some(message) = reassembler.push(value).unwrap() {
                messages.push(message);
            }
        }
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].data, data);
        assert!(!reassembler.is_pending());
    }

    #[test]
    fn data_filling_exactly_one_fragment() {
        let data = vec![0x11; (MINIMUM_PDU_SIZE - PDATA_OVERHEAD) as usize];
        let pdus: Vec<_> = fragment(3, PDataValueType::Command, &data, MINIMUM_PDU_SIZE)
            .unwrap()
            .collect();
        assert_eq!(pdus.len(), 1);
        assert_eq!(encode_pdu(&pdus[0]).unwrap().len(), MINIMUM_PDU_SIZE as usize);
    }

    #[test]
    fn empty_data_is_one_last_fragment() {
        let pdus: Vec<_> = fragment(5, PDataValueType::Command, &[], 16_384)
            .unwrap()
            .collect();
        assert_eq!(
            pdus,
            vec![Pdu::PData {
                data: vec![PDataValue {
                    presentation_context_id: 5,
                    value_type: PDataValueType::Command,
                    is_last: true,
                    data: vec![],
                }]
            }]
        );
    }

    #[test]
    fn maximum_length_must_leave_room_for_data() {
        assert_matches!(
            fragment(1, PDataValueType::Data, &[1, 2, 3], 12),
            Err(Error::MaxPduTooSmall {
                max_pdu_length: 12,
                ..
            })
        );
        assert_eq!(max_fragment_length(13).unwrap(), 1);
    }

    #[test]
    fn interleaved_fragments_are_refused() {
        let mut reassembler = Reassembler::new();
        let first = PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Data,
            is_last: false,
            data: vec![1, 2],
        };
        assert_eq!(reassembler.push(first).unwrap(), None);
        assert!(reassembler.is_pending());

        let other_context = PDataValue {
            presentation_context_id: 3,
            value_type: PDataValueType::Data,
            is_last: true,
            data: vec![3],
        };
        assert_matches!(
            reassembler.push(other_context),
            Err(Error::InterleavedFragment {
                pending_id: 1,
                found_id: 3,
                ..
            })
        );

        let command = PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Command,
            is_last: true,
            data: vec![3],
        };
        assert_matches!(
            reassembler.push(command),
            Err(Error::InterleavedFragment { .. })
        );

        reassembler.reset();
        assert!(!reassembler.is_pending());
    }

    #[test]
    fn command_then_data_on_the_same_context() {
        let mut reassembler = Reassembler::new();
        let command = reassembler
            .push(PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0xC0],
            })
            .unwrap()
            .unwrap();
        assert!(command.is_command());
        assert_eq!(&command.data[..], &[0xC0]);

        let data = reassembler
            .push(PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Data,
                is_last: true,
                data: vec![0xDA, 0x7A],
            })
            .unwrap()
            .unwrap();
        assert!(!data.is_command());
        assert_eq!(&data.data[..], &[0xDA, 0x7A]);
    }

    #[test]
    fn messages_beyond_the_maximum_length_are_refused() {
        let fragment = |is_last, len| PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Data,
            is_last,
            data: vec![0x55; len],
        };

        let mut reassembler = Reassembler::with_max_message_length(10);
        assert_eq!(reassembler.max_message_length(), Some(10));
        assert_eq!(reassembler.push(fragment(false, 6)).unwrap(), None);
        assert_matches!(
            reassembler.push(fragment(false, 6)),
            Err(Error::MessageTooLarge {
                length: 12,
                max_message_length: 10,
                ..
            })
        );
        // the partial message is dropped
        assert!(!reassembler.is_pending());

        // a message of exactly the maximum length is complete
        assert_eq!(reassembler.push(fragment(false, 4)).unwrap(), None);
        let message = reassembler.push(fragment(true, 6)).unwrap().unwrap();
        assert_eq!(message.data.len(), 10);

        assert_eq!(Reassembler::new().max_message_length(), None);
    }
}
