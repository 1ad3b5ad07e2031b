//! Growable write buffer and bounds-checked read cursor.

use core::fmt;

use super::ArchiveError;

const VARINT_MAX_LEN: usize = 10;

/// An append-only buffer that serializers write into.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct WriteMessage {
    buf: Vec<u8>,
}

impl WriteMessage {
    /// Creates an empty message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty message with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Appends one byte.
    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    /// Appends a little-endian u32.
    pub fn put_u32_le(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Appends a little-endian u64.
    pub fn put_u64_le(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Appends an unsigned LEB128 varint.
    pub fn put_varint(&mut self, mut v: u64) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                self.buf.push(byte);
                break;
            }
            self.buf.push(byte | 0x80);
        }
    }

    /// Appends raw bytes.
    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true when nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Borrows the written bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes the message, returning its bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

impl fmt::Debug for WriteMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteMessage")
            .field("len", &self.buf.len())
            .finish()
    }
}

/// Number of bytes [`WriteMessage::put_varint`] emits for `v`.
pub fn varint_len(v: u64) -> usize {
    let bits = 64 - v.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

/// A slice-backed cursor for decoding.
pub struct ReadStream<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> ReadStream<'a> {
    /// Creates a cursor positioned at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, off: 0 }
    }

    /// Takes the next `n` bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], ArchiveError> {
        let end = self
            .off
            .checked_add(n)
            .ok_or(ArchiveError::Malformed("length overflows cursor"))?;
        if end > self.buf.len() {
            return Err(ArchiveError::NotEnoughData);
        }
        let slice = &self.buf[self.off..end];
        self.off = end;
        Ok(slice)
    }

    /// Reads one byte.
    pub fn read_u8(&mut self) -> Result<u8, ArchiveError> {
        Ok(self.take(1)?[0])
    }

    /// Reads a little-endian u32.
    pub fn read_u32_le(&mut self) -> Result<u32, ArchiveError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    /// Reads a little-endian u64.
    pub fn read_u64_le(&mut self) -> Result<u64, ArchiveError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    /// Reads an unsigned LEB128 varint.
    pub fn read_varint(&mut self) -> Result<u64, ArchiveError> {
        let mut result = 0u64;
        let mut shift = 0u32;
        for i in 0..VARINT_MAX_LEN {
            let byte = self.read_u8()?;
            let payload = (byte & 0x7f) as u64;
            if i == VARINT_MAX_LEN - 1 && payload > 1 {
                return Err(ArchiveError::Malformed("varint overflows 64 bits"));
            }
            result |= payload << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(ArchiveError::Malformed("varint longer than 10 bytes"))
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.off)
    }

    /// Current offset from the start of the buffer.
    pub fn position(&self) -> usize {
        self.off
    }

    /// Fails with [`ArchiveError::ExtraData`] if any input is left over.
    pub fn ensure_consumed(&self) -> Result<(), ArchiveError> {
        match self.remaining() {
            0 => Ok(()),
            remaining => Err(ArchiveError::ExtraData { remaining }),
        }
    }
}

impl<'a> fmt::Debug for ReadStream<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadStream")
            .field("off", &self.off)
            .field("remaining", &self.remaining())
            .finish()
    }
}
