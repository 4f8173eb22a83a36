//! Little-endian field decoding shared by the BGZF, header, record and index
//! parsers.
//!
//! Every fixed-width integer in BGZF, BAM and BAI is little-endian. These
//! helpers are the only place that knowledge lives; `byteorder` does the
//! swap on big-endian hosts.
//!
//! The `le_*` functions read at a fixed offset and return `None` when the
//! slice is too short, so callers decide which error to raise. The
//! [`Cursor`] wrapper is used by the sequential parsers (header, index).

use byteorder::{ByteOrder, LittleEndian};

/// Read a little-endian `u16` at `offset`.
#[inline]
pub fn le_u16(data: &[u8], offset: usize) -> Option<u16> {
    data.get(offset..offset.checked_add(2)?).map(LittleEndian::read_u16)
}

/// Read a little-endian `i16` at `offset`.
#[inline]
pub fn le_i16(data: &[u8], offset: usize) -> Option<i16> {
    data.get(offset..offset.checked_add(2)?).map(LittleEndian::read_i16)
}

/// Read a little-endian `u32` at `offset`.
#[inline]
pub fn le_u32(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset.checked_add(4)?).map(LittleEndian::read_u32)
}

/// Read a little-endian `i32` at `offset`.
#[inline]
pub fn le_i32(data: &[u8], offset: usize) -> Option<i32> {
    data.get(offset..offset.checked_add(4)?).map(LittleEndian::read_i32)
}

/// Read a little-endian `u64` at `offset`.
#[inline]
pub fn le_u64(data: &[u8], offset: usize) -> Option<u64> {
    data.get(offset..offset.checked_add(8)?).map(LittleEndian::read_u64)
}

/// Read a little-endian IEEE-754 `f32` at `offset`.
#[inline]
pub fn le_f32(data: &[u8], offset: usize) -> Option<f32> {
    data.get(offset..offset.checked_add(4)?).map(LittleEndian::read_f32)
}

/// Sequential reader over a byte slice.
///
/// Each read advances the position; a short read returns `None` and leaves
/// the position unchanged.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    /// Start reading at the beginning of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Take the next `n` bytes.
    pub fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let out = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(out)
    }

    /// Next `i32`.
    pub fn i32(&mut self) -> Option<i32> {
        self.bytes(4).map(LittleEndian::read_i32)
    }

    /// Next `u32`.
    pub fn u32(&mut self) -> Option<u32> {
        self.bytes(4).map(LittleEndian::read_u32)
    }

    /// Next `u64`.
    pub fn u64(&mut self) -> Option<u64> {
        self.bytes(8).map(LittleEndian::read_u64)
    }
}
