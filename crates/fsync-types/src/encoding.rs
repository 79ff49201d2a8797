//! Fixed-width integer helpers for the authority wire format.
//!
//! Frame headers are big-endian, payload fields little-endian. Readers take
//! a slice of exactly the field width and return `None` otherwise, so a
//! truncated buffer surfaces as a decode error rather than a panic.

#[inline]
pub fn append_u16_be(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

#[inline]
pub fn append_u32_be(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

#[inline]
pub fn append_u64_be(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

#[inline]
pub fn append_u32_le(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

#[inline]
pub fn append_i32_le(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

#[inline]
#[must_use]
pub fn read_u16_be(src: &[u8]) -> Option<u16> {
    Some(u16::from_be_bytes(src.try_into().ok()?))
}

#[inline]
#[must_use]
pub fn read_u32_be(src: &[u8]) -> Option<u32> {
    Some(u32::from_be_bytes(src.try_into().ok()?))
}

#[inline]
#[must_use]
pub fn read_u64_be(src: &[u8]) -> Option<u64> {
    Some(u64::from_be_bytes(src.try_into().ok()?))
}

#[inline]
#[must_use]
pub fn read_u32_le(src: &[u8]) -> Option<u32> {
    Some(u32::from_le_bytes(src.try_into().ok()?))
}

#[inline]
#[must_use]
pub fn read_i32_le(src: &[u8]) -> Option<i32> {
    Some(i32::from_le_bytes(src.try_into().ok()?))
}

/// Sequential little-endian reader over a payload.
#[derive(Debug)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    #[must_use]
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Take the next `n` bytes, or `None` if fewer remain.
    pub fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let bytes = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(bytes)
    }

    pub fn u32_le(&mut self) -> Option<u32> {
        read_u32_le(self.take(4)?)
    }

    pub fn i32_le(&mut self) -> Option<i32> {
        read_i32_le(self.take(4)?)
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}
