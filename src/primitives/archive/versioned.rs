//! Dispatch from a runtime [`ClusterVersion`] to the matching [`Version`] marker.
//!
//! The version itself is never written into the payload; callers carry it
//! out-of-band (a container header, a handshake).

use super::version::{ClusterVersion, V1_13, V1_13_2};
use super::{Archive, ArchiveError, ReadStream, WriteMessage};

/// Serializes `value` in the encoding of `version`.
pub fn serialize_for_version<T: Archive>(version: ClusterVersion, wm: &mut WriteMessage, value: &T) {
    match version {
        ClusterVersion::V1_13 => value.serialize::<V1_13>(wm),
        ClusterVersion::V1_13_2 => value.serialize::<V1_13_2>(wm),
    }
}

/// Deserializes a `T` written with the encoding of `version`.
///
/// Trailing input is left in the stream; see [`decode_for_version`] for the
/// strict form.
pub fn deserialize_for_version<T: Archive>(
    version: ClusterVersion,
    s: &mut ReadStream<'_>,
) -> Result<T, ArchiveError> {
    match version {
        ClusterVersion::V1_13 => T::deserialize::<V1_13>(s),
        ClusterVersion::V1_13_2 => T::deserialize::<V1_13_2>(s),
    }
}

/// Exact number of bytes [`serialize_for_version`] writes for `value`.
pub fn serialized_size_for_version<T: Archive>(version: ClusterVersion, value: &T) -> usize {
    match version {
        ClusterVersion::V1_13 => value.serialized_size::<V1_13>(),
        ClusterVersion::V1_13_2 => value.serialized_size::<V1_13_2>(),
    }
}

/// Serializes `value` into a fresh buffer.
pub fn encode_for_version<T: Archive>(version: ClusterVersion, value: &T) -> Vec<u8> {
    let mut wm = WriteMessage::with_capacity(serialized_size_for_version(version, value));
    serialize_for_version(version, &mut wm, value);
    wm.into_vec()
}

/// Decodes exactly one `T` from `bytes`, rejecting trailing data.
pub fn decode_for_version<T: Archive>(version: ClusterVersion, bytes: &[u8]) -> Result<T, ArchiveError> {
    let mut s = ReadStream::new(bytes);
    let value = deserialize_for_version(version, &mut s)?;
    s.ensure_consumed()?;
    Ok(value)
}
