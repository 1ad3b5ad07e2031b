use std::cmp::Ordering;
use std::fmt;

use crate::primitives::archive::{
    Archive, ArchiveError, FixedCodec, ReadStream, Version, WriteMessage,
};
use crate::types::{Result, SliceError};

/// Maximum length of a key in bytes.
pub const MAX_KEY_SIZE: usize = 250;

const BOUND_NONE: u8 = 0;
const BOUND_OPEN: u8 = 1;
const BOUND_CLOSED: u8 = 2;

/// A key stored in a shard, at most [`MAX_KEY_SIZE`] bytes.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct StoreKey(Vec<u8>);

impl StoreKey {
    /// Builds a key, rejecting anything longer than [`MAX_KEY_SIZE`].
    pub fn new(bytes: impl AsRef<[u8]>) -> Result<Self> {
        let bytes = bytes.as_ref();
        if bytes.len() > MAX_KEY_SIZE {
            return Err(SliceError::Invalid("key longer than MAX_KEY_SIZE"));
        }
        Ok(StoreKey(bytes.to_vec()))
    }

    /// The smallest key (empty).
    pub fn min() -> Self {
        StoreKey(Vec::new())
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Key length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true for the empty key.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn put(&self, wm: &mut WriteMessage) {
        wm.put_u8(self.0.len() as u8);
        wm.put_slice(&self.0);
    }

    fn get(s: &mut ReadStream<'_>) -> std::result::Result<Self, ArchiveError> {
        let len = s.read_u8()? as usize;
        if len > MAX_KEY_SIZE {
            return Err(ArchiveError::Malformed("key length exceeds MAX_KEY_SIZE"));
        }
        Ok(StoreKey(s.take(len)?.to_vec()))
    }
}

impl fmt::Debug for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(text) if text.chars().all(|c| !c.is_control()) => write!(f, "{text:?}"),
            _ => write!(f, "0x{}", hex::encode(&self.0)),
        }
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Archive for StoreKey {
    fn serialize<V: Version>(&self, wm: &mut WriteMessage) {
        self.put(wm);
    }

    fn deserialize<V: Version>(s: &mut ReadStream<'_>) -> std::result::Result<Self, ArchiveError> {
        Self::get(s)
    }

    fn serialized_size<V: Version>(&self) -> usize {
        1 + self.0.len()
    }
}

/// One end of a key interval.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Bound {
    /// The interval extends without limit on this side.
    Unbounded,
    /// The key itself is excluded.
    Open(StoreKey),
    /// The key itself is included.
    Closed(StoreKey),
}

impl Bound {
    fn tag(&self) -> u8 {
        match self {
            Bound::Unbounded => BOUND_NONE,
            Bound::Open(_) => BOUND_OPEN,
            Bound::Closed(_) => BOUND_CLOSED,
        }
    }

    fn key(&self) -> Option<&StoreKey> {
        match self {
            Bound::Unbounded => None,
            Bound::Open(key) | Bound::Closed(key) => Some(key),
        }
    }

    fn put(&self, wm: &mut WriteMessage) {
        wm.put_u8(self.tag());
        if let Some(key) = self.key() {
            key.put(wm);
        }
    }

    fn get(s: &mut ReadStream<'_>) -> std::result::Result<Self, ArchiveError> {
        match s.read_u8()? {
            BOUND_NONE => Ok(Bound::Unbounded),
            BOUND_OPEN => Ok(Bound::Open(StoreKey::get(s)?)),
            BOUND_CLOSED => Ok(Bound::Closed(StoreKey::get(s)?)),
            _ => Err(ArchiveError::Malformed("unknown key bound tag")),
        }
    }

    fn encoded_len(&self) -> usize {
        1 + self.key().map_or(0, |key| 1 + key.len())
    }
}

/// An interval over the key space, fixed per shard at creation time.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct KeyRange {
    /// Lower end.
    pub left: Bound,
    /// Upper end.
    pub right: Bound,
}

impl KeyRange {
    /// Builds a range from its two bounds.
    pub fn new(left: Bound, right: Bound) -> Self {
        Self { left, right }
    }

    /// The range covering every key.
    pub fn universe() -> Self {
        Self::new(Bound::Unbounded, Bound::Unbounded)
    }

    /// `[left, right)`
    pub fn half_open(left: StoreKey, right: StoreKey) -> Self {
        Self::new(Bound::Closed(left), Bound::Open(right))
    }

    /// Returns true when `key` falls inside the range.
    pub fn contains(&self, key: &StoreKey) -> bool {
        let above_left = match &self.left {
            Bound::Unbounded => true,
            Bound::Open(left) => key > left,
            Bound::Closed(left) => key >= left,
        };
        let below_right = match &self.right {
            Bound::Unbounded => true,
            Bound::Open(right) => key < right,
            Bound::Closed(right) => key <= right,
        };
        above_left && below_right
    }

    /// Returns true when no key can satisfy both bounds.
    pub fn is_empty(&self) -> bool {
        match (self.left.key(), self.right.key()) {
            (Some(left), Some(right)) => match left.cmp(right) {
                Ordering::Greater => true,
                Ordering::Equal => {
                    !(matches!(self.left, Bound::Closed(_))
                        && matches!(self.right, Bound::Closed(_)))
                }
                Ordering::Less => false,
            },
            _ => false,
        }
    }
}

/// The metainfo encoding: frozen, independent of any cluster version.
impl FixedCodec for KeyRange {
    fn encode_fixed(&self, out: &mut WriteMessage) {
        self.left.put(out);
        self.right.put(out);
    }

    fn decode_fixed(s: &mut ReadStream<'_>) -> std::result::Result<Self, ArchiveError> {
        let left = Bound::get(s)?;
        let right = Bound::get(s)?;
        Ok(KeyRange { left, right })
    }
}

impl Archive for KeyRange {
    fn serialize<V: Version>(&self, wm: &mut WriteMessage) {
        self.left.put(wm);
        self.right.put(wm);
    }

    fn deserialize<V: Version>(s: &mut ReadStream<'_>) -> std::result::Result<Self, ArchiveError> {
        let left = Bound::get(s)?;
        let right = Bound::get(s)?;
        Ok(KeyRange { left, right })
    }

    fn serialized_size<V: Version>(&self) -> usize {
        self.left.encoded_len() + self.right.encoded_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::archive::{decode_fixed, encode_fixed};

    fn key(s: &str) -> StoreKey {
        StoreKey::new(s).unwrap()
    }

    #[test]
    fn rejects_oversized_keys() {
        assert!(StoreKey::new(vec![b'x'; MAX_KEY_SIZE]).is_ok());
        assert!(matches!(
            StoreKey::new(vec![b'x'; MAX_KEY_SIZE + 1]),
            Err(SliceError::Invalid(_))
        ));
    }

    #[test]
    fn half_open_contains() {
        let range = KeyRange::half_open(key("a"), key("z"));
        assert!(range.contains(&key("a")));
        assert!(range.contains(&key("k")));
        assert!(!range.contains(&key("z")));
        assert!(!range.contains(&StoreKey::min()));
        assert!(KeyRange::universe().contains(&StoreKey::min()));
    }

    #[test]
    fn empty_ranges() {
        assert!(KeyRange::new(Bound::Open(key("a")), Bound::Open(key("a"))).is_empty());
        assert!(!KeyRange::new(Bound::Closed(key("a")), Bound::Closed(key("a"))).is_empty());
        assert!(KeyRange::new(Bound::Closed(key("b")), Bound::Closed(key("a"))).is_empty());
        assert!(!KeyRange::universe().is_empty());
    }

    #[test]
    fn fixed_encoding_layout_is_stable() {
        let range = KeyRange::half_open(key("a"), key("z"));
        let bytes = encode_fixed(&range);
        assert_eq!(bytes, vec![BOUND_CLOSED, 1, b'a', BOUND_OPEN, 1, b'z']);
        assert_eq!(decode_fixed::<KeyRange>(&bytes).unwrap(), range);
    }

    #[test]
    fn debug_prints_binary_keys_as_hex() {
        assert_eq!(format!("{:?}", key("k")), "\"k\"");
        assert_eq!(format!("{:?}", StoreKey::new([0u8, 1]).unwrap()), "0x0001");
    }
}
