//! Bounded big-endian cursor over an in-memory PDU body.
//!
//! Every nested item is decoded from its own sub-cursor,
//! so that reading past the item's declared length
//! fails instead of consuming the bytes of the next item.
use bytes::Buf;
use snafu::ensure;

use super::reader::{Result, ShortReadSnafu, TrailingDataSnafu};

/// A read-only view over a region of a PDU,
/// consumed from the front.
#[derive(Debug, Clone)]
pub struct PduCursor<'a> {
    data: &'a [u8],
}

impl<'a> PduCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        PduCursor { data }
    }

    /// The number of bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn require(&self, field: &'static str, needed: usize) -> Result<()> {
        ensure!(
            self.data.len() >= needed,
            ShortReadSnafu {
                field,
                needed,
                available: self.data.len(),
            }
        );
        Ok(())
    }

    pub fn read_u8(&mut self, field: &'static str) -> Result<u8> {
        self.require(field, 1)?;
        Ok(self.data.get_u8())
    }

    pub fn read_u16(&mut self, field: &'static str) -> Result<u16> {
        self.require(field, 2)?;
        Ok(self.data.get_u16())
    }

    pub fn read_u32(&mut self, field: &'static str) -> Result<u32> {
        self.require(field, 4)?;
        Ok(self.data.get_u32())
    }

    /// Skip over `n` reserved bytes, whatever their value.
    pub fn skip_reserved(&mut self, n: usize) -> Result<()> {
        self.require("reserved", n)?;
        self.data.advance(n);
        Ok(())
    }

    /// Take the next `n` bytes without copying them.
    pub fn read_bytes(&mut self, field: &'static str, n: usize) -> Result<&'a [u8]> {
        self.require(field, n)?;
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    /// Take the next `n` bytes as a cursor of their own.
    pub fn sub_cursor(&mut self, field: &'static str, n: usize) -> Result<PduCursor<'a>> {
        self.read_bytes(field, n).map(PduCursor::new)
    }

    /// Take everything left in this cursor.
    pub fn read_rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.data)
    }

    /// Declare the region fully decoded.
    /// Fails if any byte was left unread.
    pub fn finish(self, region: &'static str) -> Result<()> {
        ensure!(
            self.data.is_empty(),
            TrailingDataSnafu {
                region,
                remaining: self.data.len(),
            }
        );
        Ok(())
    }
}
