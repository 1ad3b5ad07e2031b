//! Contract between the slice and the tree algorithms it drives.
//!
//! Every entry point runs inside a transaction the caller opened and against a
//! superblock the caller already locked; the slice and the dispatcher own
//! ordering and transaction scope.

use bytes::Bytes;

use crate::primitives::archive::{Archive, ArchiveError, ReadStream, Version, WriteMessage};
use crate::primitives::cache::Transaction;
use crate::storage::mutation::{
    AppendPrependKind, AppendPrependResult, CasTime, DeleteResult, GetResult, IncrDecrKind,
    IncrDecrResult, SarcMutation, SetResult,
};
use crate::storage::superblock::GotSuperblock;
use crate::types::{KeyRange, ReplTimestamp, Result, StoreKey};

/// One live entry returned by a range read.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyValuePair {
    /// Entry key.
    pub key: StoreKey,
    /// Entry value.
    pub value: Bytes,
    /// Client flags.
    pub flags: u32,
    /// CAS of the entry.
    pub cas: u64,
}

impl Archive for KeyValuePair {
    fn serialize<V: Version>(&self, wm: &mut WriteMessage) {
        self.key.serialize::<V>(wm);
        self.value.serialize::<V>(wm);
        V::put_u32(wm, self.flags);
        V::put_u64(wm, self.cas);
    }

    fn deserialize<V: Version>(s: &mut ReadStream<'_>) -> std::result::Result<Self, ArchiveError> {
        Ok(Self {
            key: StoreKey::deserialize::<V>(s)?,
            value: Bytes::deserialize::<V>(s)?,
            flags: V::get_u32(s)?,
            cas: V::get_u64(s)?,
        })
    }

    fn serialized_size<V: Version>(&self) -> usize {
        self.key.serialized_size::<V>()
            + self.value.serialized_size::<V>()
            + V::u32_size(self.flags)
            + V::u64_size(self.cas)
    }
}

/// One live entry streamed by a backfill.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BackfillAtom {
    /// Entry key.
    pub key: StoreKey,
    /// Entry value.
    pub value: Bytes,
    /// Client flags.
    pub flags: u32,
    /// Expiry in unix seconds; zero never expires.
    pub exptime: u32,
    /// CAS of the entry.
    pub cas: u64,
    /// Timestamp of the entry's last write.
    pub recency: ReplTimestamp,
}

impl Archive for BackfillAtom {
    fn serialize<V: Version>(&self, wm: &mut WriteMessage) {
        self.key.serialize::<V>(wm);
        self.value.serialize::<V>(wm);
        V::put_u32(wm, self.flags);
        V::put_u32(wm, self.exptime);
        V::put_u64(wm, self.cas);
        self.recency.serialize::<V>(wm);
    }

    fn deserialize<V: Version>(s: &mut ReadStream<'_>) -> std::result::Result<Self, ArchiveError> {
        Ok(Self {
            key: StoreKey::deserialize::<V>(s)?,
            value: Bytes::deserialize::<V>(s)?,
            flags: V::get_u32(s)?,
            exptime: V::get_u32(s)?,
            cas: V::get_u64(s)?,
            recency: ReplTimestamp::deserialize::<V>(s)?,
        })
    }

    fn serialized_size<V: Version>(&self) -> usize {
        self.key.serialized_size::<V>()
            + self.value.serialized_size::<V>()
            + V::u32_size(self.flags)
            + V::u32_size(self.exptime)
            + V::u64_size(self.cas)
            + self.recency.serialized_size::<V>()
    }
}

/// Receives the records a backfill streams.
pub trait BackfillCallback {
    /// A key deleted at `recency`.
    fn on_deletion(&mut self, key: &StoreKey, recency: ReplTimestamp);
    /// A live entry.
    fn on_keyvalue(&mut self, atom: BackfillAtom);
    /// Called once after the last record.
    fn done(&mut self);
}

/// Decides which keys a range erasure removes.
pub trait KeyTester {
    /// Returns true when `key` should be erased.
    fn key_should_be_erased(&self, key: &StoreKey) -> bool;
}

impl<F> KeyTester for F
where
    F: Fn(&StoreKey) -> bool,
{
    fn key_should_be_erased(&self, key: &StoreKey) -> bool {
        self(key)
    }
}

/// Tree algorithms behind one slice, one entry point per operation.
pub trait BTreeAlgorithms: Send + Sync + 'static {
    /// Point read.
    fn get(
        &self,
        key: &StoreKey,
        txn: &mut Transaction<'_>,
        sb: &mut GotSuperblock,
    ) -> Result<GetResult>;

    /// Live entries inside `range`, in key order.
    fn range_get(
        &self,
        range: &KeyRange,
        txn: &mut Transaction<'_>,
        sb: &mut GotSuperblock,
    ) -> Result<Vec<KeyValuePair>>;

    /// Read that assigns `castime.proposed_cas` to a value without a CAS.
    fn get_cas(
        &self,
        key: &StoreKey,
        castime: CasTime,
        txn: &mut Transaction<'_>,
        sb: &mut GotSuperblock,
    ) -> Result<GetResult>;

    /// Set, add, replace, or compare-and-swap.
    fn set(
        &self,
        mutation: &SarcMutation,
        castime: CasTime,
        txn: &mut Transaction<'_>,
        sb: &mut GotSuperblock,
    ) -> Result<SetResult>;

    /// Decimal increment or decrement.
    fn incr_decr(
        &self,
        key: &StoreKey,
        kind: IncrDecrKind,
        amount: u64,
        castime: CasTime,
        txn: &mut Transaction<'_>,
        sb: &mut GotSuperblock,
    ) -> Result<IncrDecrResult>;

    /// Extends an existing value.
    fn append_prepend(
        &self,
        key: &StoreKey,
        kind: AppendPrependKind,
        data: &Bytes,
        castime: CasTime,
        txn: &mut Transaction<'_>,
        sb: &mut GotSuperblock,
    ) -> Result<AppendPrependResult>;

    /// Removes a key, recording a tombstone unless `dont_put_in_delete_queue`.
    fn delete(
        &self,
        key: &StoreKey,
        dont_put_in_delete_queue: bool,
        timestamp: ReplTimestamp,
        txn: &mut Transaction<'_>,
        sb: &mut GotSuperblock,
    ) -> Result<DeleteResult>;

    /// Streams entries and tombstones in `range` written at or after `since`.
    fn backfill(
        &self,
        range: &KeyRange,
        since: ReplTimestamp,
        callback: &mut dyn BackfillCallback,
        txn: &mut Transaction<'_>,
        sb: &mut GotSuperblock,
    ) -> Result<()>;

    /// Erases keys in `range` that `tester` selects; returns how many.
    fn erase_range(
        &self,
        tester: &dyn KeyTester,
        range: &KeyRange,
        txn: &mut Transaction<'_>,
        sb: &mut GotSuperblock,
    ) -> Result<usize>;
}
