//! Write requests and their results.
//!
//! [`Mutation`] and [`MutationResult`] are closed sum types; the dispatcher
//! matches them exhaustively, so a new variant cannot be added without
//! routing it.

use bytes::Bytes;

use crate::primitives::archive::{Archive, ArchiveError, ReadStream, Version, WriteMessage};
use crate::types::{ReplTimestamp, StoreKey};

/// A CAS value proposed for a write, paired with its replication timestamp.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct CasTime {
    /// CAS assigned to the value if the write stores one.
    pub proposed_cas: u64,
    /// Replication timestamp of the write.
    pub timestamp: ReplTimestamp,
}

impl CasTime {
    /// Pairs a CAS with a timestamp.
    pub fn new(proposed_cas: u64, timestamp: ReplTimestamp) -> Self {
        Self {
            proposed_cas,
            timestamp,
        }
    }
}

impl Archive for CasTime {
    fn serialize<V: Version>(&self, wm: &mut WriteMessage) {
        V::put_u64(wm, self.proposed_cas);
        self.timestamp.serialize::<V>(wm);
    }

    fn deserialize<V: Version>(s: &mut ReadStream<'_>) -> Result<Self, ArchiveError> {
        Ok(Self {
            proposed_cas: V::get_u64(s)?,
            timestamp: ReplTimestamp::deserialize::<V>(s)?,
        })
    }

    fn serialized_size<V: Version>(&self) -> usize {
        V::u64_size(self.proposed_cas) + self.timestamp.serialized_size::<V>()
    }
}

// Encodes a fieldless enum as a single tag byte.
macro_rules! tag_enum {
    ($ty:ident, $what:literal, { $($variant:ident = $tag:literal),+ $(,)? }) => {
        impl $ty {
            fn tag(self) -> u8 {
                match self {
                    $($ty::$variant => $tag,)+
                }
            }

            fn from_tag(tag: u8) -> Result<Self, ArchiveError> {
                match tag {
                    $($tag => Ok($ty::$variant),)+
                    _ => Err(ArchiveError::Malformed(concat!("unknown ", $what, " tag"))),
                }
            }
        }

        impl Archive for $ty {
            fn serialize<V: Version>(&self, wm: &mut WriteMessage) {
                wm.put_u8(self.tag());
            }

            fn deserialize<V: Version>(s: &mut ReadStream<'_>) -> Result<Self, ArchiveError> {
                Self::from_tag(s.read_u8()?)
            }

            fn serialized_size<V: Version>(&self) -> usize {
                1
            }
        }
    };
}

/// Whether a set may create a key that does not exist.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum AddPolicy {
    /// Create the key if missing.
    Yes,
    /// Never create the key.
    No,
}

tag_enum!(AddPolicy, "add policy", { Yes = 0, No = 1 });

/// Whether a set may overwrite an existing key.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ReplacePolicy {
    /// Overwrite unconditionally.
    Yes,
    /// Overwrite only when the stored CAS equals `old_cas`.
    IfCasMatches,
    /// Never overwrite.
    No,
}

tag_enum!(ReplacePolicy, "replace policy", { Yes = 0, IfCasMatches = 1, No = 2 });

/// Direction of an arithmetic mutation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum IncrDecrKind {
    /// Add, wrapping at `u64::MAX`.
    Incr,
    /// Subtract, stopping at zero.
    Decr,
}

tag_enum!(IncrDecrKind, "incr/decr kind", { Incr = 0, Decr = 1 });

/// Which end of the value new data is attached to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum AppendPrependKind {
    /// After the existing bytes.
    Append,
    /// Before the existing bytes.
    Prepend,
}

tag_enum!(AppendPrependKind, "append/prepend kind", { Append = 0, Prepend = 1 });

/// Read a value, assigning it a CAS if it has none.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GetCasMutation {
    /// Key to read.
    pub key: StoreKey,
}

/// Set, add, replace, or compare-and-swap.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SarcMutation {
    /// Key to write.
    pub key: StoreKey,
    /// New value.
    pub data: Bytes,
    /// Opaque client flags stored with the value.
    pub flags: u32,
    /// Expiry in unix seconds; zero never expires.
    pub exptime: u32,
    /// Behavior when the key is missing.
    pub add_policy: AddPolicy,
    /// Behavior when the key exists.
    pub replace_policy: ReplacePolicy,
    /// CAS compared under [`ReplacePolicy::IfCasMatches`].
    pub old_cas: u64,
}

/// Numeric increment or decrement of a decimal value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IncrDecrMutation {
    /// Direction.
    pub kind: IncrDecrKind,
    /// Key holding the number.
    pub key: StoreKey,
    /// Amount to add or subtract.
    pub amount: u64,
}

/// Append or prepend bytes to an existing value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AppendPrependMutation {
    /// Which end to extend.
    pub kind: AppendPrependKind,
    /// Key to extend.
    pub key: StoreKey,
    /// Bytes to attach.
    pub data: Bytes,
}

/// Remove a key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeleteMutation {
    /// Key to remove.
    pub key: StoreKey,
    /// Skip recording a tombstone for backfill.
    pub dont_put_in_delete_queue: bool,
}

/// One write request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Mutation {
    /// See [`GetCasMutation`].
    GetCas(GetCasMutation),
    /// See [`SarcMutation`].
    Sarc(SarcMutation),
    /// See [`IncrDecrMutation`].
    IncrDecr(IncrDecrMutation),
    /// See [`AppendPrependMutation`].
    AppendPrepend(AppendPrependMutation),
    /// See [`DeleteMutation`].
    Delete(DeleteMutation),
}

impl Mutation {
    /// A get that assigns a CAS.
    pub fn get_cas(key: StoreKey) -> Self {
        Mutation::GetCas(GetCasMutation { key })
    }

    /// An unconditional set.
    pub fn set(key: StoreKey, data: impl Into<Bytes>) -> Self {
        Mutation::Sarc(SarcMutation {
            key,
            data: data.into(),
            flags: 0,
            exptime: 0,
            add_policy: AddPolicy::Yes,
            replace_policy: ReplacePolicy::Yes,
            old_cas: 0,
        })
    }

    /// A set that only creates missing keys.
    pub fn add(key: StoreKey, data: impl Into<Bytes>) -> Self {
        Mutation::Sarc(SarcMutation {
            key,
            data: data.into(),
            flags: 0,
            exptime: 0,
            add_policy: AddPolicy::Yes,
            replace_policy: ReplacePolicy::No,
            old_cas: 0,
        })
    }

    /// A set that only overwrites existing keys.
    pub fn replace(key: StoreKey, data: impl Into<Bytes>) -> Self {
        Mutation::Sarc(SarcMutation {
            key,
            data: data.into(),
            flags: 0,
            exptime: 0,
            add_policy: AddPolicy::No,
            replace_policy: ReplacePolicy::Yes,
            old_cas: 0,
        })
    }

    /// A set that overwrites only when the stored CAS equals `old_cas`.
    pub fn cas(key: StoreKey, data: impl Into<Bytes>, old_cas: u64) -> Self {
        Mutation::Sarc(SarcMutation {
            key,
            data: data.into(),
            flags: 0,
            exptime: 0,
            add_policy: AddPolicy::No,
            replace_policy: ReplacePolicy::IfCasMatches,
            old_cas,
        })
    }

    /// An increment.
    pub fn incr(key: StoreKey, amount: u64) -> Self {
        Mutation::IncrDecr(IncrDecrMutation {
            kind: IncrDecrKind::Incr,
            key,
            amount,
        })
    }

    /// A decrement.
    pub fn decr(key: StoreKey, amount: u64) -> Self {
        Mutation::IncrDecr(IncrDecrMutation {
            kind: IncrDecrKind::Decr,
            key,
            amount,
        })
    }

    /// An append.
    pub fn append(key: StoreKey, data: impl Into<Bytes>) -> Self {
        Mutation::AppendPrepend(AppendPrependMutation {
            kind: AppendPrependKind::Append,
            key,
            data: data.into(),
        })
    }

    /// A prepend.
    pub fn prepend(key: StoreKey, data: impl Into<Bytes>) -> Self {
        Mutation::AppendPrepend(AppendPrependMutation {
            kind: AppendPrependKind::Prepend,
            key,
            data: data.into(),
        })
    }

    /// A delete that leaves a tombstone for backfill.
    pub fn delete(key: StoreKey) -> Self {
        Mutation::Delete(DeleteMutation {
            key,
            dont_put_in_delete_queue: false,
        })
    }

    /// Short name of the variant, used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::GetCas(_) => "get_cas",
            Mutation::Sarc(_) => "sarc",
            Mutation::IncrDecr(_) => "incr_decr",
            Mutation::AppendPrepend(_) => "append_prepend",
            Mutation::Delete(_) => "delete",
        }
    }

    /// Key the mutation targets.
    pub fn key(&self) -> &StoreKey {
        match self {
            Mutation::GetCas(m) => &m.key,
            Mutation::Sarc(m) => &m.key,
            Mutation::IncrDecr(m) => &m.key,
            Mutation::AppendPrepend(m) => &m.key,
            Mutation::Delete(m) => &m.key,
        }
    }
}

const MUTATION_GET_CAS: u8 = 0;
const MUTATION_SARC: u8 = 1;
const MUTATION_INCR_DECR: u8 = 2;
const MUTATION_APPEND_PREPEND: u8 = 3;
const MUTATION_DELETE: u8 = 4;

impl Archive for Mutation {
    fn serialize<V: Version>(&self, wm: &mut WriteMessage) {
        match self {
            Mutation::GetCas(m) => {
                wm.put_u8(MUTATION_GET_CAS);
                m.key.serialize::<V>(wm);
            }
            Mutation::Sarc(m) => {
                wm.put_u8(MUTATION_SARC);
                m.key.serialize::<V>(wm);
                m.data.serialize::<V>(wm);
                V::put_u32(wm, m.flags);
                V::put_u32(wm, m.exptime);
                m.add_policy.serialize::<V>(wm);
                m.replace_policy.serialize::<V>(wm);
                V::put_u64(wm, m.old_cas);
            }
            Mutation::IncrDecr(m) => {
                wm.put_u8(MUTATION_INCR_DECR);
                m.kind.serialize::<V>(wm);
                m.key.serialize::<V>(wm);
                V::put_u64(wm, m.amount);
            }
            Mutation::AppendPrepend(m) => {
                wm.put_u8(MUTATION_APPEND_PREPEND);
                m.kind.serialize::<V>(wm);
                m.key.serialize::<V>(wm);
                m.data.serialize::<V>(wm);
            }
            Mutation::Delete(m) => {
                wm.put_u8(MUTATION_DELETE);
                m.key.serialize::<V>(wm);
                m.dont_put_in_delete_queue.serialize::<V>(wm);
            }
        }
    }

    fn deserialize<V: Version>(s: &mut ReadStream<'_>) -> Result<Self, ArchiveError> {
        Ok(match s.read_u8()? {
            MUTATION_GET_CAS => Mutation::GetCas(GetCasMutation {
                key: StoreKey::deserialize::<V>(s)?,
            }),
            MUTATION_SARC => Mutation::Sarc(SarcMutation {
                key: StoreKey::deserialize::<V>(s)?,
                data: Bytes::deserialize::<V>(s)?,
                flags: V::get_u32(s)?,
                exptime: V::get_u32(s)?,
                add_policy: AddPolicy::deserialize::<V>(s)?,
                replace_policy: ReplacePolicy::deserialize::<V>(s)?,
                old_cas: V::get_u64(s)?,
            }),
            MUTATION_INCR_DECR => Mutation::IncrDecr(IncrDecrMutation {
                kind: IncrDecrKind::deserialize::<V>(s)?,
                key: StoreKey::deserialize::<V>(s)?,
                amount: V::get_u64(s)?,
            }),
            MUTATION_APPEND_PREPEND => Mutation::AppendPrepend(AppendPrependMutation {
                kind: AppendPrependKind::deserialize::<V>(s)?,
                key: StoreKey::deserialize::<V>(s)?,
                data: Bytes::deserialize::<V>(s)?,
            }),
            MUTATION_DELETE => Mutation::Delete(DeleteMutation {
                key: StoreKey::deserialize::<V>(s)?,
                dont_put_in_delete_queue: bool::deserialize::<V>(s)?,
            }),
            _ => return Err(ArchiveError::Malformed("unknown mutation tag")),
        })
    }

    fn serialized_size<V: Version>(&self) -> usize {
        1 + match self {
            Mutation::GetCas(m) => m.key.serialized_size::<V>(),
            Mutation::Sarc(m) => {
                m.key.serialized_size::<V>()
                    + m.data.serialized_size::<V>()
                    + V::u32_size(m.flags)
                    + V::u32_size(m.exptime)
                    + 2
                    + V::u64_size(m.old_cas)
            }
            Mutation::IncrDecr(m) => 1 + m.key.serialized_size::<V>() + V::u64_size(m.amount),
            Mutation::AppendPrepend(m) => {
                1 + m.key.serialized_size::<V>() + m.data.serialized_size::<V>()
            }
            Mutation::Delete(m) => m.key.serialized_size::<V>() + 1,
        }
    }
}

/// Result of a point read.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct GetResult {
    /// Stored value, `None` when the key is absent or expired.
    pub value: Option<Bytes>,
    /// Client flags stored with the value.
    pub flags: u32,
    /// CAS of the value; zero when absent or never assigned.
    pub cas: u64,
}

impl GetResult {
    /// The result for a missing key.
    pub fn not_found() -> Self {
        Self::default()
    }
}

impl Archive for GetResult {
    fn serialize<V: Version>(&self, wm: &mut WriteMessage) {
        self.value.serialize::<V>(wm);
        V::put_u32(wm, self.flags);
        V::put_u64(wm, self.cas);
    }

    fn deserialize<V: Version>(s: &mut ReadStream<'_>) -> Result<Self, ArchiveError> {
        Ok(Self {
            value: Option::<Bytes>::deserialize::<V>(s)?,
            flags: V::get_u32(s)?,
            cas: V::get_u64(s)?,
        })
    }

    fn serialized_size<V: Version>(&self) -> usize {
        self.value.serialized_size::<V>() + V::u32_size(self.flags) + V::u64_size(self.cas)
    }
}

/// Outcome of a [`SarcMutation`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SetResult {
    /// The value was written.
    Stored,
    /// The key was missing and the add policy forbade creating it.
    DidntAdd,
    /// The key existed and the replace policy forbade overwriting it.
    DidntReplace,
    /// A CAS write targeted a missing key.
    NotFound,
    /// A CAS write saw a different CAS.
    Exists,
    /// The value exceeds the maximum value size.
    TooLarge,
}

tag_enum!(SetResult, "set result", {
    Stored = 0,
    DidntAdd = 1,
    DidntReplace = 2,
    NotFound = 3,
    Exists = 4,
    TooLarge = 5,
});

/// Outcome of an [`IncrDecrMutation`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum IncrDecrResult {
    /// The new value.
    Success(u64),
    /// The key is absent.
    NotFound,
    /// The stored value is not a decimal number.
    NotNumeric,
}

impl Archive for IncrDecrResult {
    fn serialize<V: Version>(&self, wm: &mut WriteMessage) {
        match self {
            IncrDecrResult::Success(value) => {
                wm.put_u8(0);
                V::put_u64(wm, *value);
            }
            IncrDecrResult::NotFound => wm.put_u8(1),
            IncrDecrResult::NotNumeric => wm.put_u8(2),
        }
    }

    fn deserialize<V: Version>(s: &mut ReadStream<'_>) -> Result<Self, ArchiveError> {
        match s.read_u8()? {
            0 => Ok(IncrDecrResult::Success(V::get_u64(s)?)),
            1 => Ok(IncrDecrResult::NotFound),
            2 => Ok(IncrDecrResult::NotNumeric),
            _ => Err(ArchiveError::Malformed("unknown incr/decr result tag")),
        }
    }

    fn serialized_size<V: Version>(&self) -> usize {
        match self {
            IncrDecrResult::Success(value) => 1 + V::u64_size(*value),
            _ => 1,
        }
    }
}

/// Outcome of an [`AppendPrependMutation`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum AppendPrependResult {
    /// The value was extended.
    Success,
    /// The key is absent.
    NotFound,
    /// The extended value would exceed the maximum value size.
    TooLarge,
}

tag_enum!(AppendPrependResult, "append/prepend result", {
    Success = 0,
    NotFound = 1,
    TooLarge = 2,
});

/// Outcome of a [`DeleteMutation`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum DeleteResult {
    /// The key was removed.
    Deleted,
    /// The key was absent.
    NotFound,
}

tag_enum!(DeleteResult, "delete result", { Deleted = 0, NotFound = 1 });

/// Result of one [`Mutation`], in the variant matching the request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MutationResult {
    /// Answer to [`Mutation::GetCas`].
    GetCas(GetResult),
    /// Answer to [`Mutation::Sarc`].
    Sarc(SetResult),
    /// Answer to [`Mutation::IncrDecr`].
    IncrDecr(IncrDecrResult),
    /// Answer to [`Mutation::AppendPrepend`].
    AppendPrepend(AppendPrependResult),
    /// Answer to [`Mutation::Delete`].
    Delete(DeleteResult),
}

impl MutationResult {
    /// Short name of the variant; equals [`Mutation::kind`] of the request.
    pub fn kind(&self) -> &'static str {
        match self {
            MutationResult::GetCas(_) => "get_cas",
            MutationResult::Sarc(_) => "sarc",
            MutationResult::IncrDecr(_) => "incr_decr",
            MutationResult::AppendPrepend(_) => "append_prepend",
            MutationResult::Delete(_) => "delete",
        }
    }
}

impl Archive for MutationResult {
    fn serialize<V: Version>(&self, wm: &mut WriteMessage) {
        match self {
            MutationResult::GetCas(r) => {
                wm.put_u8(MUTATION_GET_CAS);
                r.serialize::<V>(wm);
            }
            MutationResult::Sarc(r) => {
                wm.put_u8(MUTATION_SARC);
                r.serialize::<V>(wm);
            }
            MutationResult::IncrDecr(r) => {
                wm.put_u8(MUTATION_INCR_DECR);
                r.serialize::<V>(wm);
            }
            MutationResult::AppendPrepend(r) => {
                wm.put_u8(MUTATION_APPEND_PREPEND);
                r.serialize::<V>(wm);
            }
            MutationResult::Delete(r) => {
                wm.put_u8(MUTATION_DELETE);
                r.serialize::<V>(wm);
            }
        }
    }

    fn deserialize<V: Version>(s: &mut ReadStream<'_>) -> Result<Self, ArchiveError> {
        Ok(match s.read_u8()? {
            MUTATION_GET_CAS => MutationResult::GetCas(GetResult::deserialize::<V>(s)?),
            MUTATION_SARC => MutationResult::Sarc(SetResult::deserialize::<V>(s)?),
            MUTATION_INCR_DECR => MutationResult::IncrDecr(IncrDecrResult::deserialize::<V>(s)?),
            MUTATION_APPEND_PREPEND => {
                MutationResult::AppendPrepend(AppendPrependResult::deserialize::<V>(s)?)
            }
            MUTATION_DELETE => MutationResult::Delete(DeleteResult::deserialize::<V>(s)?),
            _ => return Err(ArchiveError::Malformed("unknown mutation result tag")),
        })
    }

    fn serialized_size<V: Version>(&self) -> usize {
        1 + match self {
            MutationResult::GetCas(r) => r.serialized_size::<V>(),
            MutationResult::Sarc(r) => r.serialized_size::<V>(),
            MutationResult::IncrDecr(r) => r.serialized_size::<V>(),
            MutationResult::AppendPrepend(r) => r.serialized_size::<V>(),
            MutationResult::Delete(r) => r.serialized_size::<V>(),
        }
    }
}
