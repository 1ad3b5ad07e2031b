use std::fmt;

use crate::primitives::archive::{Archive, ArchiveError, ReadStream, Version, WriteMessage};

/// Replication timestamp attached to writes and block recency markers.
///
/// Ordered and monotonic per shard; [`ReplTimestamp::DISTANT_PAST`] sorts before
/// every timestamp a real write can carry.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct ReplTimestamp(pub u32);

impl ReplTimestamp {
    /// The oldest possible timestamp.
    pub const DISTANT_PAST: ReplTimestamp = ReplTimestamp(0);
    /// Marker for "no timestamp"; never produced by [`ReplTimestamp::next`].
    pub const INVALID: ReplTimestamp = ReplTimestamp(u32::MAX);

    /// Returns the timestamp immediately after this one.
    pub fn next(self) -> Self {
        debug_assert!(self != Self::INVALID, "next() on invalid timestamp");
        ReplTimestamp(self.0.saturating_add(1).min(u32::MAX - 1))
    }

    /// Returns true for [`ReplTimestamp::INVALID`].
    pub const fn is_invalid(self) -> bool {
        self.0 == u32::MAX
    }
}

impl fmt::Display for ReplTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_invalid() {
            f.write_str("invalid")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl Archive for ReplTimestamp {
    fn serialize<V: Version>(&self, wm: &mut WriteMessage) {
        V::put_u32(wm, self.0);
    }

    fn deserialize<V: Version>(s: &mut ReadStream<'_>) -> Result<Self, ArchiveError> {
        V::get_u32(s).map(ReplTimestamp)
    }

    fn serialized_size<V: Version>(&self) -> usize {
        V::u32_size(self.0)
    }
}
