#![forbid(unsafe_code)]
//! Versioned serialization.
//!
//! Every persisted or replicated value implements [`Archive`], generic over a
//! [`Version`] marker. Runtime code picks the marker through
//! [`serialize_for_version`] and friends, so the version-specific branches live
//! in exactly one `match`.

use bytes::Bytes;

mod fixed;
mod stream;
mod version;
mod versioned;

pub use fixed::{decode_fixed, encode_fixed, FixedCodec};
pub use stream::{varint_len, ReadStream, WriteMessage};
pub use version::{
    deserialize_cluster_version, serialize_cluster_version, ClusterVersion, Version, V1_13,
    V1_13_2,
};
pub use versioned::{
    decode_for_version, deserialize_for_version, encode_for_version, serialize_for_version,
    serialized_size_for_version,
};

/// Outcome of a failed decode.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ArchiveError {
    /// Input ended before the value was complete.
    #[error("not enough data")]
    NotEnoughData,
    /// The value decoded but input remained.
    #[error("{remaining} bytes of extra data")]
    ExtraData {
        /// Unconsumed byte count.
        remaining: usize,
    },
    /// The bytes do not describe a valid value.
    #[error("malformed: {0}")]
    Malformed(&'static str),
    /// A cluster version tag lies outside the supported range.
    #[error("cluster version tag {tag} out of range")]
    RangeError {
        /// The rejected tag.
        tag: i8,
    },
}

/// A value with a per-version encoding.
pub trait Archive: Sized {
    /// Appends the encoding of `self` for version `V`.
    fn serialize<V: Version>(&self, wm: &mut WriteMessage);
    /// Reads a value written by [`Archive::serialize`] for version `V`.
    fn deserialize<V: Version>(s: &mut ReadStream<'_>) -> Result<Self, ArchiveError>;
    /// Exact length [`Archive::serialize`] produces for version `V`.
    fn serialized_size<V: Version>(&self) -> usize;
}

impl Archive for u8 {
    fn serialize<V: Version>(&self, wm: &mut WriteMessage) {
        wm.put_u8(*self);
    }

    fn deserialize<V: Version>(s: &mut ReadStream<'_>) -> Result<Self, ArchiveError> {
        s.read_u8()
    }

    fn serialized_size<V: Version>(&self) -> usize {
        1
    }
}

impl Archive for bool {
    fn serialize<V: Version>(&self, wm: &mut WriteMessage) {
        wm.put_u8(u8::from(*self));
    }

    fn deserialize<V: Version>(s: &mut ReadStream<'_>) -> Result<Self, ArchiveError> {
        match s.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(ArchiveError::Malformed("bool out of range")),
        }
    }

    fn serialized_size<V: Version>(&self) -> usize {
        1
    }
}

impl Archive for u32 {
    fn serialize<V: Version>(&self, wm: &mut WriteMessage) {
        V::put_u32(wm, *self);
    }

    fn deserialize<V: Version>(s: &mut ReadStream<'_>) -> Result<Self, ArchiveError> {
        V::get_u32(s)
    }

    fn serialized_size<V: Version>(&self) -> usize {
        V::u32_size(*self)
    }
}

impl Archive for u64 {
    fn serialize<V: Version>(&self, wm: &mut WriteMessage) {
        V::put_u64(wm, *self);
    }

    fn deserialize<V: Version>(s: &mut ReadStream<'_>) -> Result<Self, ArchiveError> {
        V::get_u64(s)
    }

    fn serialized_size<V: Version>(&self) -> usize {
        V::u64_size(*self)
    }
}

fn get_len<V: Version>(s: &mut ReadStream<'_>) -> Result<usize, ArchiveError> {
    let len = V::get_u64(s)?;
    let len = usize::try_from(len).map_err(|_| ArchiveError::Malformed("length exceeds usize"))?;
    // Every element takes at least one byte, so a longer count is a lie.
    if len > s.remaining() {
        return Err(ArchiveError::NotEnoughData);
    }
    Ok(len)
}

impl Archive for Bytes {
    fn serialize<V: Version>(&self, wm: &mut WriteMessage) {
        V::put_u64(wm, self.len() as u64);
        wm.put_slice(self);
    }

    fn deserialize<V: Version>(s: &mut ReadStream<'_>) -> Result<Self, ArchiveError> {
        let len = get_len::<V>(s)?;
        Ok(Bytes::copy_from_slice(s.take(len)?))
    }

    fn serialized_size<V: Version>(&self) -> usize {
        V::u64_size(self.len() as u64) + self.len()
    }
}

impl<T: Archive> Archive for Vec<T> {
    fn serialize<V: Version>(&self, wm: &mut WriteMessage) {
        V::put_u64(wm, self.len() as u64);
        for item in self {
            item.serialize::<V>(wm);
        }
    }

    fn deserialize<V: Version>(s: &mut ReadStream<'_>) -> Result<Self, ArchiveError> {
        let len = get_len::<V>(s)?;
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            out.push(T::deserialize::<V>(s)?);
        }
        Ok(out)
    }

    fn serialized_size<V: Version>(&self) -> usize {
        V::u64_size(self.len() as u64)
            + self.iter().map(|item| item.serialized_size::<V>()).sum::<usize>()
    }
}

impl<T: Archive> Archive for Option<T> {
    fn serialize<V: Version>(&self, wm: &mut WriteMessage) {
        match self {
            None => wm.put_u8(0),
            Some(value) => {
                wm.put_u8(1);
                value.serialize::<V>(wm);
            }
        }
    }

    fn deserialize<V: Version>(s: &mut ReadStream<'_>) -> Result<Self, ArchiveError> {
        match s.read_u8()? {
            0 => Ok(None),
            1 => Ok(Some(T::deserialize::<V>(s)?)),
            _ => Err(ArchiveError::Malformed("option tag out of range")),
        }
    }

    fn serialized_size<V: Version>(&self) -> usize {
        1 + self.as_ref().map_or(0, |value| value.serialized_size::<V>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_and_bytes_roundtrip() {
        let value: Option<Bytes> = Some(Bytes::from_static(b"payload"));
        for version in ClusterVersion::ALL {
            let bytes = encode_for_version(version, &value);
            assert_eq!(bytes.len(), serialized_size_for_version(version, &value));
            assert_eq!(decode_for_version::<Option<Bytes>>(version, &bytes).unwrap(), value);
        }
    }

    #[test]
    fn lying_length_prefix_is_rejected() {
        let mut wm = WriteMessage::new();
        V1_13_2::put_u64(&mut wm, 1_000_000);
        wm.put_slice(b"abc");
        assert_eq!(
            decode_for_version::<Bytes>(ClusterVersion::V1_13_2, wm.as_slice()),
            Err(ArchiveError::NotEnoughData)
        );
    }

    #[test]
    fn bad_bool_is_malformed() {
        assert!(matches!(
            decode_for_version::<bool>(ClusterVersion::CLUSTER, &[2]),
            Err(ArchiveError::Malformed(_))
        ));
    }
}
