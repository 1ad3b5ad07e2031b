//! Single-leaf reference tree.
//!
//! The whole key space of a shard lives in one leaf block hanging off the
//! superblock. The block is a container record:
//!
//! | bytes  | field                          |
//! |--------|--------------------------------|
//! | 0..4   | magic `leaf`                   |
//! | 4..8   | crc32 over block id + payload  |
//! | 8      | cluster version tag            |
//! | 9..13  | payload length                 |
//! | 13..   | payload                        |
//!
//! The payload is encoded for [`ClusterVersion::LATEST_DISK`]; readers pick
//! the decoder from the tag in the header.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use tracing::{error, trace};

use crate::primitives::archive::{
    decode_for_version, encode_for_version, Archive, ArchiveError, ClusterVersion, ReadStream,
    Version, WriteMessage,
};
use crate::primitives::cache::{Access, BufLock, Transaction};
use crate::storage::algorithms::{
    BTreeAlgorithms, BackfillAtom, BackfillCallback, KeyTester, KeyValuePair,
};
use crate::storage::mutation::{
    AddPolicy, AppendPrependKind, AppendPrependResult, CasTime, DeleteResult, GetResult,
    IncrDecrKind, IncrDecrResult, ReplacePolicy, SarcMutation, SetResult,
};
use crate::storage::superblock::GotSuperblock;
use crate::types::{block_crc32, BlockId, KeyRange, ReplTimestamp, Result, SliceError, StoreKey};

/// Largest value a set or append may store.
pub const MAX_VALUE_SIZE: usize = 1 << 20;

const LEAF_MAGIC: [u8; 4] = *b"leaf";
const LEAF_MAGIC_RANGE: Range<usize> = 0..4;
const LEAF_CRC: Range<usize> = 4..8;
const LEAF_VERSION: usize = 8;
const LEAF_PAYLOAD_LEN: Range<usize> = 9..13;
const LEAF_HEADER_LEN: usize = 13;

#[derive(Clone, Debug, Eq, PartialEq)]
struct LeafEntry {
    key: StoreKey,
    value: Bytes,
    flags: u32,
    exptime: u32,
    cas: u64,
    recency: ReplTimestamp,
}

impl LeafEntry {
    fn is_expired(&self, now: u32) -> bool {
        self.exptime != 0 && self.exptime <= now
    }
}

impl Archive for LeafEntry {
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

#[derive(Clone, Debug, Eq, PartialEq)]
struct Tombstone {
    key: StoreKey,
    recency: ReplTimestamp,
}

impl Archive for Tombstone {
    fn serialize<V: Version>(&self, wm: &mut WriteMessage) {
        self.key.serialize::<V>(wm);
        self.recency.serialize::<V>(wm);
    }

    fn deserialize<V: Version>(s: &mut ReadStream<'_>) -> std::result::Result<Self, ArchiveError> {
        Ok(Self {
            key: StoreKey::deserialize::<V>(s)?,
            recency: ReplTimestamp::deserialize::<V>(s)?,
        })
    }

    fn serialized_size<V: Version>(&self) -> usize {
        self.key.serialized_size::<V>() + self.recency.serialized_size::<V>()
    }
}

// Both lists are kept sorted by key.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
struct LeafContents {
    entries: Vec<LeafEntry>,
    tombstones: Vec<Tombstone>,
}

impl LeafContents {
    fn find(&self, key: &StoreKey) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|e| e.key.cmp(key))
    }

    fn live(&self, key: &StoreKey, now: u32) -> Option<usize> {
        self.find(key).ok().filter(|&i| !self.entries[i].is_expired(now))
    }

    fn upsert(&mut self, entry: LeafEntry) {
        self.clear_tombstone(&entry.key);
        match self.find(&entry.key) {
            Ok(i) => self.entries[i] = entry,
            Err(i) => self.entries.insert(i, entry),
        }
    }

    fn clear_tombstone(&mut self, key: &StoreKey) {
        if let Ok(i) = self.tombstones.binary_search_by(|t| t.key.cmp(key)) {
            self.tombstones.remove(i);
        }
    }

    fn add_tombstone(&mut self, key: StoreKey, recency: ReplTimestamp) {
        match self.tombstones.binary_search_by(|t| t.key.cmp(&key)) {
            Ok(i) => self.tombstones[i].recency = recency,
            Err(i) => self.tombstones.insert(i, Tombstone { key, recency }),
        }
    }

    fn prune_expired(&mut self, now: u32) {
        self.entries.retain(|e| !e.is_expired(now));
    }
}

impl Archive for LeafContents {
    fn serialize<V: Version>(&self, wm: &mut WriteMessage) {
        self.entries.serialize::<V>(wm);
        self.tombstones.serialize::<V>(wm);
    }

    fn deserialize<V: Version>(s: &mut ReadStream<'_>) -> std::result::Result<Self, ArchiveError> {
        Ok(Self {
            entries: Vec::<LeafEntry>::deserialize::<V>(s)?,
            tombstones: Vec::<Tombstone>::deserialize::<V>(s)?,
        })
    }

    fn serialized_size<V: Version>(&self) -> usize {
        self.entries.serialized_size::<V>() + self.tombstones.serialized_size::<V>()
    }
}

type Clock = Arc<dyn Fn() -> u32 + Send + Sync>;

/// Tree algorithms storing a whole shard in one leaf block.
#[derive(Clone)]
pub struct LeafTree {
    clock: Clock,
}

impl Default for LeafTree {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LeafTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafTree").finish_non_exhaustive()
    }
}

impl LeafTree {
    /// A tree that expires entries against the system clock.
    pub fn new() -> Self {
        Self::with_clock(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs().min(u32::MAX as u64) as u32)
                .unwrap_or(0)
        })
    }

    /// A tree that reads the current unix time from `clock`.
    pub fn with_clock(clock: impl Fn() -> u32 + Send + Sync + 'static) -> Self {
        Self {
            clock: Arc::new(clock),
        }
    }

    fn now(&self) -> u32 {
        (self.clock)()
    }

    fn load(
        &self,
        txn: &mut Transaction<'_>,
        sb: &GotSuperblock,
        access: Access,
    ) -> Result<Option<(BufLock, LeafContents)>> {
        let root = sb.root_block();
        if root.is_null() {
            return Ok(None);
        }
        let lock = txn.acquire(root, access)?;
        lock.set_eviction_priority(sb.root_eviction_priority().incr());
        let contents = decode_leaf(root, lock.data())?;
        Ok(Some((lock, contents)))
    }

    /// Writes `contents` into the existing root, or allocates a root and
    /// links it from the superblock once the leaf image is in place.
    fn store_root(
        &self,
        root: Option<BufLock>,
        contents: &mut LeafContents,
        txn: &mut Transaction<'_>,
        sb: &mut GotSuperblock,
    ) -> Result<()> {
        if let Some(mut lock) = root {
            return self.store(&mut lock, contents);
        }
        let (version, payload) = self.leaf_payload(contents, txn.cache().block_size())?;
        let mut lock = txn.allocate()?;
        lock.set_eviction_priority(sb.root_eviction_priority().incr());
        write_leaf(lock.id(), version, &payload, lock.data_mut()?);
        sb.set_root_block(lock.id())?;
        trace!(root = %lock.id(), "leaf.create_root");
        Ok(())
    }

    fn store(&self, lock: &mut BufLock, contents: &mut LeafContents) -> Result<()> {
        let (version, payload) = self.leaf_payload(contents, lock.data().len())?;
        write_leaf(lock.id(), version, &payload, lock.data_mut()?);
        Ok(())
    }

    fn leaf_payload(
        &self,
        contents: &mut LeafContents,
        block_size: usize,
    ) -> Result<(ClusterVersion, Vec<u8>)> {
        contents.prune_expired(self.now());
        let version = ClusterVersion::LATEST_DISK;
        let payload = encode_for_version(version, contents);
        if LEAF_HEADER_LEN + payload.len() > block_size {
            return Err(SliceError::Invalid("leaf block full"));
        }
        Ok((version, payload))
    }
}

fn write_leaf(id: BlockId, version: ClusterVersion, payload: &[u8], block: &mut [u8]) {
    block[LEAF_MAGIC_RANGE].copy_from_slice(&LEAF_MAGIC);
    block[LEAF_CRC].copy_from_slice(&block_crc32(id.0, payload).to_be_bytes());
    block[LEAF_VERSION] = version.tag() as u8;
    block[LEAF_PAYLOAD_LEN].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    block[LEAF_HEADER_LEN..LEAF_HEADER_LEN + payload.len()].copy_from_slice(payload);
    block[LEAF_HEADER_LEN + payload.len()..].fill(0);
}

fn decode_leaf(id: BlockId, block: &[u8]) -> Result<LeafContents> {
    if block.len() < LEAF_HEADER_LEN || block[LEAF_MAGIC_RANGE] != LEAF_MAGIC {
        return Err(corrupt_leaf(id, "bad magic".into()));
    }
    let version = ClusterVersion::from_tag(block[LEAF_VERSION] as i8)
        .map_err(|err| corrupt_leaf(id, err.to_string()))?;
    let mut len_raw = [0u8; 4];
    len_raw.copy_from_slice(&block[LEAF_PAYLOAD_LEN]);
    let len = u32::from_be_bytes(len_raw) as usize;
    let payload = block
        .get(LEAF_HEADER_LEN..LEAF_HEADER_LEN.saturating_add(len))
        .ok_or_else(|| corrupt_leaf(id, "payload length exceeds block".into()))?;
    let mut crc_raw = [0u8; 4];
    crc_raw.copy_from_slice(&block[LEAF_CRC]);
    if u32::from_be_bytes(crc_raw) != block_crc32(id.0, payload) {
        return Err(corrupt_leaf(id, "checksum mismatch".into()));
    }
    decode_for_version(version, payload).map_err(|err| corrupt_leaf(id, err.to_string()))
}

fn corrupt_leaf(id: BlockId, reason: String) -> SliceError {
    error!(block = %id, reason = %reason, "leaf.corrupt");
    SliceError::Corruption(format!("leaf {id}: {reason}"))
}

fn parse_decimal(value: &[u8]) -> Option<u64> {
    std::str::from_utf8(value).ok()?.trim_end().parse().ok()
}

impl BTreeAlgorithms for LeafTree {
    fn get(
        &self,
        key: &StoreKey,
        txn: &mut Transaction<'_>,
        sb: &mut GotSuperblock,
    ) -> Result<GetResult> {
        let Some((_lock, contents)) = self.load(txn, sb, Access::Read)? else {
            return Ok(GetResult::not_found());
        };
        Ok(match contents.live(key, self.now()) {
            Some(i) => {
                let entry = &contents.entries[i];
                GetResult {
                    value: Some(entry.value.clone()),
                    flags: entry.flags,
                    cas: entry.cas,
                }
            }
            None => GetResult::not_found(),
        })
    }

    fn range_get(
        &self,
        range: &KeyRange,
        txn: &mut Transaction<'_>,
        sb: &mut GotSuperblock,
    ) -> Result<Vec<KeyValuePair>> {
        let Some((_lock, contents)) = self.load(txn, sb, Access::Read)? else {
            return Ok(Vec::new());
        };
        let now = self.now();
        Ok(contents
            .entries
            .into_iter()
            .filter(|e| range.contains(&e.key) && !e.is_expired(now))
            .map(|e| KeyValuePair {
                key: e.key,
                value: e.value,
                flags: e.flags,
                cas: e.cas,
            })
            .collect())
    }

    fn get_cas(
        &self,
        key: &StoreKey,
        castime: CasTime,
        txn: &mut Transaction<'_>,
        sb: &mut GotSuperblock,
    ) -> Result<GetResult> {
        let Some((mut lock, mut contents)) = self.load(txn, sb, Access::Write)? else {
            return Ok(GetResult::not_found());
        };
        let Some(i) = contents.live(key, self.now()) else {
            return Ok(GetResult::not_found());
        };
        let entry = &mut contents.entries[i];
        let assign = entry.cas == 0;
        if assign {
            entry.cas = castime.proposed_cas;
        }
        let result = GetResult {
            value: Some(entry.value.clone()),
            flags: entry.flags,
            cas: entry.cas,
        };
        if assign {
            self.store(&mut lock, &mut contents)?;
        }
        Ok(result)
    }

    fn set(
        &self,
        m: &SarcMutation,
        castime: CasTime,
        txn: &mut Transaction<'_>,
        sb: &mut GotSuperblock,
    ) -> Result<SetResult> {
        if m.data.len() > MAX_VALUE_SIZE {
            return Ok(SetResult::TooLarge);
        }
        let (root, mut contents) = match self.load(txn, sb, Access::Write)? {
            Some((lock, contents)) => (Some(lock), contents),
            None => (None, LeafContents::default()),
        };
        let existing = contents.live(&m.key, self.now()).map(|i| contents.entries[i].cas);
        match (existing, m.add_policy, m.replace_policy) {
            (None, AddPolicy::No, ReplacePolicy::IfCasMatches) => return Ok(SetResult::NotFound),
            (None, AddPolicy::No, _) => return Ok(SetResult::DidntAdd),
            (Some(_), _, ReplacePolicy::No) => return Ok(SetResult::DidntReplace),
            (Some(cas), _, ReplacePolicy::IfCasMatches) if cas != m.old_cas => {
                return Ok(SetResult::Exists)
            }
            _ => {}
        }
        contents.upsert(LeafEntry {
            key: m.key.clone(),
            value: m.data.clone(),
            flags: m.flags,
            exptime: m.exptime,
            cas: castime.proposed_cas,
            recency: castime.timestamp,
        });
        self.store_root(root, &mut contents, txn, sb)?;
        Ok(SetResult::Stored)
    }

    fn incr_decr(
        &self,
        key: &StoreKey,
        kind: IncrDecrKind,
        amount: u64,
        castime: CasTime,
        txn: &mut Transaction<'_>,
        sb: &mut GotSuperblock,
    ) -> Result<IncrDecrResult> {
        let Some((mut lock, mut contents)) = self.load(txn, sb, Access::Write)? else {
            return Ok(IncrDecrResult::NotFound);
        };
        let Some(i) = contents.live(key, self.now()) else {
            return Ok(IncrDecrResult::NotFound);
        };
        let Some(current) = parse_decimal(&contents.entries[i].value) else {
            return Ok(IncrDecrResult::NotNumeric);
        };
        let next = match kind {
            IncrDecrKind::Incr => current.wrapping_add(amount),
            IncrDecrKind::Decr => current.saturating_sub(amount),
        };
        let entry = &mut contents.entries[i];
        entry.value = Bytes::from(next.to_string());
        entry.cas = castime.proposed_cas;
        entry.recency = castime.timestamp;
        self.store(&mut lock, &mut contents)?;
        Ok(IncrDecrResult::Success(next))
    }

    fn append_prepend(
        &self,
        key: &StoreKey,
        kind: AppendPrependKind,
        data: &Bytes,
        castime: CasTime,
        txn: &mut Transaction<'_>,
        sb: &mut GotSuperblock,
    ) -> Result<AppendPrependResult> {
        let Some((mut lock, mut contents)) = self.load(txn, sb, Access::Write)? else {
            return Ok(AppendPrependResult::NotFound);
        };
        let Some(i) = contents.live(key, self.now()) else {
            return Ok(AppendPrependResult::NotFound);
        };
        let entry = &mut contents.entries[i];
        if entry.value.len() + data.len() > MAX_VALUE_SIZE {
            return Ok(AppendPrependResult::TooLarge);
        }
        let mut joined = BytesMut::with_capacity(entry.value.len() + data.len());
        match kind {
            AppendPrependKind::Append => {
                joined.extend_from_slice(&entry.value);
                joined.extend_from_slice(data);
            }
            AppendPrependKind::Prepend => {
                joined.extend_from_slice(data);
                joined.extend_from_slice(&entry.value);
            }
        }
        entry.value = joined.freeze();
        entry.cas = castime.proposed_cas;
        entry.recency = castime.timestamp;
        self.store(&mut lock, &mut contents)?;
        Ok(AppendPrependResult::Success)
    }

    fn delete(
        &self,
        key: &StoreKey,
        dont_put_in_delete_queue: bool,
        timestamp: ReplTimestamp,
        txn: &mut Transaction<'_>,
        sb: &mut GotSuperblock,
    ) -> Result<DeleteResult> {
        let Some((mut lock, mut contents)) = self.load(txn, sb, Access::Write)? else {
            return Ok(DeleteResult::NotFound);
        };
        let Some(i) = contents.live(key, self.now()) else {
            return Ok(DeleteResult::NotFound);
        };
        contents.entries.remove(i);
        if !dont_put_in_delete_queue {
            contents.add_tombstone(key.clone(), timestamp);
        }
        self.store(&mut lock, &mut contents)?;
        Ok(DeleteResult::Deleted)
    }

    fn backfill(
        &self,
        range: &KeyRange,
        since: ReplTimestamp,
        callback: &mut dyn BackfillCallback,
        txn: &mut Transaction<'_>,
        sb: &mut GotSuperblock,
    ) -> Result<()> {
        if let Some((_lock, contents)) = self.load(txn, sb, Access::Read)? {
            for tombstone in &contents.tombstones {
                if tombstone.recency >= since && range.contains(&tombstone.key) {
                    callback.on_deletion(&tombstone.key, tombstone.recency);
                }
            }
            let now = self.now();
            for entry in contents.entries {
                if entry.recency >= since && range.contains(&entry.key) && !entry.is_expired(now) {
                    callback.on_keyvalue(BackfillAtom {
                        key: entry.key,
                        value: entry.value,
                        flags: entry.flags,
                        exptime: entry.exptime,
                        cas: entry.cas,
                        recency: entry.recency,
                    });
                }
            }
        }
        callback.done();
        Ok(())
    }

    fn erase_range(
        &self,
        tester: &dyn KeyTester,
        range: &KeyRange,
        txn: &mut Transaction<'_>,
        sb: &mut GotSuperblock,
    ) -> Result<usize> {
        let Some((mut lock, mut contents)) = self.load(txn, sb, Access::Write)? else {
            return Ok(0);
        };
        let before = contents.entries.len();
        contents
            .entries
            .retain(|e| !(range.contains(&e.key) && tester.key_should_be_erased(&e.key)));
        let erased = before - contents.entries.len();
        if erased > 0 {
            self.store(&mut lock, &mut contents)?;
        }
        Ok(erased)
    }
}
