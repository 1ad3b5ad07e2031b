//! Version-independent encoding for root metadata.
//!
//! Values stored through this codec must be readable before the reader knows
//! which cluster version wrote the rest of the shard, so their layout is frozen.

use super::{ArchiveError, ReadStream, WriteMessage};

/// A type with a frozen byte layout.
pub trait FixedCodec: Sized {
    /// Appends the fixed encoding of `self`.
    fn encode_fixed(&self, out: &mut WriteMessage);
    /// Reads a value written by [`FixedCodec::encode_fixed`].
    fn decode_fixed(s: &mut ReadStream<'_>) -> Result<Self, ArchiveError>;
}

/// Encodes `value` into a fresh buffer.
pub fn encode_fixed<T: FixedCodec>(value: &T) -> Vec<u8> {
    let mut wm = WriteMessage::new();
    value.encode_fixed(&mut wm);
    wm.into_vec()
}

/// Decodes exactly one `T` from `bytes`.
pub fn decode_fixed<T: FixedCodec>(bytes: &[u8]) -> Result<T, ArchiveError> {
    let mut s = ReadStream::new(bytes);
    let value = T::decode_fixed(&mut s)?;
    s.ensure_consumed()?;
    Ok(value)
}
