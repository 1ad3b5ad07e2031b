//! Cluster version tags and the per-version primitive encoders.

use std::fmt;

use super::{ArchiveError, ReadStream, WriteMessage};
use super::stream::varint_len;

/// A wire/disk encoding generation.
///
/// Tags are contiguous from [`ClusterVersion::OLDEST`] to
/// [`ClusterVersion::LATEST_OVERALL`]; anything outside is rejected on decode.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
#[repr(i8)]
pub enum ClusterVersion {
    /// Fixed-width integers and lengths.
    V1_13 = 0,
    /// LEB128 varint integers and lengths.
    V1_13_2 = 1,
}

impl ClusterVersion {
    /// The oldest version this build can read.
    pub const OLDEST: ClusterVersion = ClusterVersion::V1_13;
    /// The newest version this build knows about.
    pub const LATEST_OVERALL: ClusterVersion = ClusterVersion::V1_13_2;
    /// The version used for blocks written to disk.
    pub const LATEST_DISK: ClusterVersion = ClusterVersion::V1_13_2;
    /// The version used for intra-cluster messages.
    pub const CLUSTER: ClusterVersion = ClusterVersion::V1_13_2;

    /// Every supported version, oldest first.
    pub const ALL: [ClusterVersion; 2] = [ClusterVersion::V1_13, ClusterVersion::V1_13_2];

    /// The on-the-wire tag.
    pub const fn tag(self) -> i8 {
        self as i8
    }

    /// Maps a tag back to a version, failing outside the contiguous range.
    pub fn from_tag(tag: i8) -> Result<Self, ArchiveError> {
        if tag < Self::OLDEST.tag() || tag > Self::LATEST_OVERALL.tag() {
            return Err(ArchiveError::RangeError { tag });
        }
        Ok(match tag {
            0 => ClusterVersion::V1_13,
            _ => ClusterVersion::V1_13_2,
        })
    }
}

impl fmt::Display for ClusterVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterVersion::V1_13 => f.write_str("1.13"),
            ClusterVersion::V1_13_2 => f.write_str("1.13.2"),
        }
    }
}

/// Writes the version tag in its fixed, version-independent format.
pub fn serialize_cluster_version(wm: &mut WriteMessage, version: ClusterVersion) {
    wm.put_u8(version.tag() as u8);
}

/// Reads a version tag written by [`serialize_cluster_version`].
pub fn deserialize_cluster_version(s: &mut ReadStream<'_>) -> Result<ClusterVersion, ArchiveError> {
    let raw = s.read_u8()? as i8;
    ClusterVersion::from_tag(raw)
}

/// Compile-time marker for one [`ClusterVersion`].
///
/// The primitive encoders are the only place where versions diverge; composite
/// types build on them and stay version-agnostic.
pub trait Version: Copy + Send + Sync + 'static {
    /// The tag this marker stands for.
    const CLUSTER_VERSION: ClusterVersion;

    /// Writes a 32-bit integer.
    fn put_u32(wm: &mut WriteMessage, v: u32);
    /// Writes a 64-bit integer.
    fn put_u64(wm: &mut WriteMessage, v: u64);
    /// Reads a 32-bit integer.
    fn get_u32(s: &mut ReadStream<'_>) -> Result<u32, ArchiveError>;
    /// Reads a 64-bit integer.
    fn get_u64(s: &mut ReadStream<'_>) -> Result<u64, ArchiveError>;
    /// Encoded size of `v` as written by [`Version::put_u32`].
    fn u32_size(v: u32) -> usize;
    /// Encoded size of `v` as written by [`Version::put_u64`].
    fn u64_size(v: u64) -> usize;
}

/// Marker for [`ClusterVersion::V1_13`].
#[derive(Copy, Clone, Debug)]
pub struct V1_13;

/// Marker for [`ClusterVersion::V1_13_2`].
#[derive(Copy, Clone, Debug)]
pub struct V1_13_2;

impl Version for V1_13 {
    const CLUSTER_VERSION: ClusterVersion = ClusterVersion::V1_13;

    fn put_u32(wm: &mut WriteMessage, v: u32) {
        wm.put_u32_le(v);
    }

    fn put_u64(wm: &mut WriteMessage, v: u64) {
        wm.put_u64_le(v);
    }

    fn get_u32(s: &mut ReadStream<'_>) -> Result<u32, ArchiveError> {
        s.read_u32_le()
    }

    fn get_u64(s: &mut ReadStream<'_>) -> Result<u64, ArchiveError> {
        s.read_u64_le()
    }

    fn u32_size(_v: u32) -> usize {
        4
    }

    fn u64_size(_v: u64) -> usize {
        8
    }
}

impl Version for V1_13_2 {
    const CLUSTER_VERSION: ClusterVersion = ClusterVersion::V1_13_2;

    fn put_u32(wm: &mut WriteMessage, v: u32) {
        wm.put_varint(v as u64);
    }

    fn put_u64(wm: &mut WriteMessage, v: u64) {
        wm.put_varint(v);
    }

    fn get_u32(s: &mut ReadStream<'_>) -> Result<u32, ArchiveError> {
        let v = s.read_varint()?;
        u32::try_from(v).map_err(|_| ArchiveError::Malformed("varint exceeds u32"))
    }

    fn get_u64(s: &mut ReadStream<'_>) -> Result<u64, ArchiveError> {
        s.read_varint()
    }

    fn u32_size(v: u32) -> usize {
        varint_len(v as u64)
    }

    fn u64_size(v: u64) -> usize {
        varint_len(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_contiguous() {
        for (i, v) in ClusterVersion::ALL.iter().enumerate() {
            assert_eq!(v.tag(), ClusterVersion::OLDEST.tag() + i as i8);
            assert_eq!(ClusterVersion::from_tag(v.tag()).unwrap(), *v);
        }
        assert_eq!(
            *ClusterVersion::ALL.last().unwrap(),
            ClusterVersion::LATEST_OVERALL
        );
    }

    #[test]
    fn version_tag_roundtrips() {
        for v in ClusterVersion::ALL {
            let mut wm = WriteMessage::new();
            serialize_cluster_version(&mut wm, v);
            assert_eq!(wm.len(), 1);
            let mut s = ReadStream::new(wm.as_slice());
            assert_eq!(deserialize_cluster_version(&mut s).unwrap(), v);
        }
    }

    #[test]
    fn out_of_range_tags_fail() {
        for raw in [-1i8, 2, 17, i8::MIN, i8::MAX] {
            let bytes = [raw as u8];
            let mut s = ReadStream::new(&bytes);
            assert_eq!(
                deserialize_cluster_version(&mut s),
                Err(ArchiveError::RangeError { tag: raw })
            );
        }
    }

    #[test]
    fn integer_widths_differ_between_versions() {
        let mut old = WriteMessage::new();
        V1_13::put_u32(&mut old, 5);
        let mut new = WriteMessage::new();
        V1_13_2::put_u32(&mut new, 5);
        assert_eq!(old.len(), 4);
        assert_eq!(new.len(), 1);
    }

    #[test]
    fn oversized_varint_is_not_a_u32() {
        let mut wm = WriteMessage::new();
        wm.put_varint(u64::from(u32::MAX) + 1);
        let mut s = ReadStream::new(wm.as_slice());
        assert!(matches!(V1_13_2::get_u32(&mut s), Err(ArchiveError::Malformed(_))));
    }
}
