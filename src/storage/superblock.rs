//! The shard's root metadata block.
//!
//! Layout of block [`SUPERBLOCK_ID`] (big-endian):
//!
//! | bytes    | field                 |
//! |----------|-----------------------|
//! | 0..8     | magic                 |
//! | 8..16    | root block id         |
//! | 16..20   | replication clock     |
//! | 20..24   | last sync             |
//! | 24..28   | replication master id |
//! | 28..32   | replication slave id  |
//! | 32..36   | metainfo length       |
//! | 36..     | metainfo entries      |
//!
//! The metainfo blob is a sequence of `u32 len, key, u32 len, value` entries.
//! Its first entry is the shard's key range in the fixed encoding, with an
//! empty value. Nothing in this block goes through the versioned codec, so it
//! can be read before the reader knows which version wrote the shard.

use std::convert::TryInto;
use std::ops::Range;

use tracing::{debug, error, info};

use crate::primitives::archive::{decode_fixed, encode_fixed};
use crate::primitives::cache::{Access, BlockCache, BufLock, EvictionPriority, Transaction};
use crate::primitives::concurrency::{Admission, SequenceGroup};
use crate::types::{BlockId, KeyRange, ReplTimestamp, Result, SliceError};

/// Block holding the superblock.
pub const SUPERBLOCK_ID: BlockId = BlockId(0);
/// Tag stamped at offset 0 of a valid superblock.
pub const SUPERBLOCK_MAGIC: [u8; 8] = *b"slicesb1";

const SB_MAGIC: Range<usize> = 0..8;
const SB_ROOT_BLOCK: Range<usize> = 8..16;
const SB_REPLICATION_CLOCK: Range<usize> = 16..20;
const SB_LAST_SYNC: Range<usize> = 20..24;
const SB_MASTER_ID: Range<usize> = 24..28;
const SB_SLAVE_ID: Range<usize> = 28..32;
const SB_METAINFO_LEN: Range<usize> = 32..36;
const SB_METAINFO_START: usize = 36;

/// A locked superblock inside a transaction.
pub struct GotSuperblock {
    lock: BufLock,
    root_eviction_priority: EvictionPriority,
}

impl GotSuperblock {
    /// Locks the superblock and validates its magic.
    pub fn acquire(
        txn: &mut Transaction<'_>,
        access: Access,
        root_eviction_priority: EvictionPriority,
    ) -> Result<Self> {
        let lock = txn.acquire(SUPERBLOCK_ID, access)?;
        let magic = &lock.data()[SB_MAGIC];
        if magic != SUPERBLOCK_MAGIC {
            error!(
                slice = txn.cache().slice_num(),
                magic = %hex::encode(magic),
                "superblock.bad_magic"
            );
            return Err(SliceError::Corruption(format!(
                "superblock magic mismatch: {}",
                hex::encode(magic)
            )));
        }
        lock.set_eviction_priority(root_eviction_priority);
        Ok(Self {
            lock,
            root_eviction_priority,
        })
    }

    /// Eviction priority the tree's root should carry.
    pub fn root_eviction_priority(&self) -> EvictionPriority {
        self.root_eviction_priority
    }

    /// Returns true when the lock allows writes.
    pub fn is_write(&self) -> bool {
        self.lock.is_write()
    }

    /// Root node of the tree, [`BlockId::NULL`] when the tree is empty.
    pub fn root_block(&self) -> BlockId {
        BlockId(read_u64(self.lock.data(), SB_ROOT_BLOCK))
    }

    /// Points the superblock at a new root.
    pub fn set_root_block(&mut self, root: BlockId) -> Result<()> {
        write_bytes(self.lock.data_mut()?, SB_ROOT_BLOCK, &root.0.to_be_bytes());
        Ok(())
    }

    /// Most recent applied replicated write.
    pub fn replication_clock(&self) -> ReplTimestamp {
        ReplTimestamp(read_u32(self.lock.data(), SB_REPLICATION_CLOCK))
    }

    /// Raises the replication clock to `ts`; never lowers it.
    pub fn bump_replication_clock(&mut self, ts: ReplTimestamp) -> Result<ReplTimestamp> {
        let clock = self.replication_clock().max(ts);
        write_bytes(self.lock.data_mut()?, SB_REPLICATION_CLOCK, &clock.0.to_be_bytes());
        Ok(clock)
    }

    /// Last confirmed sync with a replication peer.
    pub fn last_sync(&self) -> ReplTimestamp {
        ReplTimestamp(read_u32(self.lock.data(), SB_LAST_SYNC))
    }

    /// Records a sync.
    pub fn set_last_sync(&mut self, ts: ReplTimestamp) -> Result<()> {
        write_bytes(self.lock.data_mut()?, SB_LAST_SYNC, &ts.0.to_be_bytes());
        Ok(())
    }

    /// Bound master; zero when unbound.
    pub fn replication_master_id(&self) -> u32 {
        read_u32(self.lock.data(), SB_MASTER_ID)
    }

    /// Binds a master.
    pub fn set_replication_master_id(&mut self, id: u32) -> Result<()> {
        write_bytes(self.lock.data_mut()?, SB_MASTER_ID, &id.to_be_bytes());
        Ok(())
    }

    /// Bound slave; zero when unbound.
    pub fn replication_slave_id(&self) -> u32 {
        read_u32(self.lock.data(), SB_SLAVE_ID)
    }

    /// Binds a slave.
    pub fn set_replication_slave_id(&mut self, id: u32) -> Result<()> {
        write_bytes(self.lock.data_mut()?, SB_SLAVE_ID, &id.to_be_bytes());
        Ok(())
    }

    /// All metainfo entries in stored order.
    pub fn metainfo_entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        parse_metainfo(self.lock.data())
    }

    /// Value stored under `key`.
    pub fn get_metainfo(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .metainfo_entries()?
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v))
    }

    /// Inserts or replaces the entry for `key`.
    ///
    /// The key range entry is fixed at creation and cannot be overwritten.
    pub fn set_metainfo(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut entries = self.metainfo_entries()?;
        reject_key_range_edit(&entries, key)?;
        match entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_vec(),
            None => entries.push((key.to_vec(), value.to_vec())),
        }
        self.write_metainfo(&entries)
    }

    /// Removes the entry for `key`; returns whether one existed.
    ///
    /// The key range entry cannot be removed.
    pub fn delete_metainfo(&mut self, key: &[u8]) -> Result<bool> {
        let mut entries = self.metainfo_entries()?;
        reject_key_range_edit(&entries, key)?;
        let before = entries.len();
        entries.retain(|(k, _)| k != key);
        if entries.len() == before {
            return Ok(false);
        }
        self.write_metainfo(&entries)?;
        Ok(true)
    }

    /// Decodes the key range from the first metainfo entry.
    pub fn key_range(&self) -> Result<KeyRange> {
        let entries = self.metainfo_entries()?;
        let Some((first, _)) = entries.first() else {
            error!("superblock.metainfo_missing_key_range");
            return Err(SliceError::Corruption(
                "superblock metainfo has no key range".into(),
            ));
        };
        decode_fixed::<KeyRange>(first).map_err(|err| {
            error!(error = %err, "superblock.metainfo_bad_key_range");
            SliceError::Corruption(format!("superblock key range undecodable: {err}"))
        })
    }

    fn write_metainfo(&mut self, entries: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        let blob = encode_metainfo(entries);
        let data = self.lock.data_mut()?;
        if SB_METAINFO_START + blob.len() > data.len() {
            return Err(SliceError::Invalid("superblock metainfo exceeds block size"));
        }
        write_bytes(data, SB_METAINFO_LEN, &(blob.len() as u32).to_be_bytes());
        data[SB_METAINFO_START..SB_METAINFO_START + blob.len()].copy_from_slice(&blob);
        data[SB_METAINFO_START + blob.len()..].fill(0);
        Ok(())
    }

    fn initialize(&mut self, key_range: &KeyRange) -> Result<()> {
        let data = self.lock.data_mut()?;
        data.fill(0);
        data[SB_MAGIC].copy_from_slice(&SUPERBLOCK_MAGIC);
        write_bytes(data, SB_ROOT_BLOCK, &BlockId::NULL.0.to_be_bytes());
        let distant_past = ReplTimestamp::DISTANT_PAST.0.to_be_bytes();
        write_bytes(data, SB_REPLICATION_CLOCK, &distant_past);
        write_bytes(data, SB_LAST_SYNC, &distant_past);
        self.write_metainfo(&[(encode_fixed(key_range), Vec::new())])
    }
}

/// Initializes the superblock of a fresh shard covering `key_range`.
///
/// Both replication timestamps and the block's recency start at
/// [`ReplTimestamp::DISTANT_PAST`], so a shard later made a slave pulls its
/// master's full history.
pub fn create(cache: &BlockCache, key_range: &KeyRange) -> Result<()> {
    let seq_group = SequenceGroup::for_slice(cache.slice_num());
    let mut txn = Transaction::begin(cache, &seq_group, Access::Write, 1, ReplTimestamp::DISTANT_PAST)?;
    let mut lock = txn.acquire(SUPERBLOCK_ID, Access::Write)?;
    lock.touch_recency(ReplTimestamp::DISTANT_PAST)?;
    let mut sb = GotSuperblock {
        lock,
        root_eviction_priority: EvictionPriority::INITIAL_ROOT,
    };
    sb.initialize(key_range)?;
    info!(slice = cache.slice_num(), key_range = ?key_range, "superblock.create");
    Ok(())
}

/// Initializes a shard that covers every key.
pub fn create_universe(cache: &BlockCache) -> Result<()> {
    create(cache, &KeyRange::universe())
}

/// Runs `f` on the superblock inside a short transaction of its own.
///
/// An `admission` is held until the transaction has its place in the lane, so
/// the next token from the same source cannot overtake it at the superblock.
pub fn with_superblock<R>(
    cache: &BlockCache,
    seq_group: &SequenceGroup,
    access: Access,
    admission: Option<Admission>,
    root_eviction_priority: EvictionPriority,
    f: impl FnOnce(&mut GotSuperblock) -> Result<R>,
) -> Result<R> {
    let mut txn = Transaction::begin(cache, seq_group, access, 0, ReplTimestamp::DISTANT_PAST)?;
    if let Some(admission) = admission {
        txn.set_order_token(admission.release());
    }
    let mut sb = GotSuperblock::acquire(&mut txn, access, root_eviction_priority)?;
    let out = f(&mut sb)?;
    debug!(slice = cache.slice_num(), access = ?access, "superblock.txn");
    Ok(out)
}

fn read_u32(data: &[u8], range: Range<usize>) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&data[range]);
    u32::from_be_bytes(raw)
}

fn read_u64(data: &[u8], range: Range<usize>) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[range]);
    u64::from_be_bytes(raw)
}

fn write_bytes(data: &mut [u8], range: Range<usize>, bytes: &[u8]) {
    data[range].copy_from_slice(bytes);
}

fn reject_key_range_edit(entries: &[(Vec<u8>, Vec<u8>)], key: &[u8]) -> Result<()> {
    match entries.first() {
        Some((first, _)) if first == key => {
            debug!("superblock.key_range_edit_rejected");
            Err(SliceError::Invalid("superblock key range is immutable"))
        }
        _ => Ok(()),
    }
}

fn encode_metainfo(entries: &[(Vec<u8>, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in entries {
        out.extend_from_slice(&(key.len() as u32).to_be_bytes());
        out.extend_from_slice(key);
        out.extend_from_slice(&(value.len() as u32).to_be_bytes());
        out.extend_from_slice(value);
    }
    out
}

fn parse_metainfo(data: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let len = read_u32(data, SB_METAINFO_LEN) as usize;
    let blob = data
        .get(SB_METAINFO_START..SB_METAINFO_START.saturating_add(len))
        .ok_or_else(|| corrupt_metainfo("length exceeds block"))?;
    let mut entries = Vec::new();
    let mut rest = blob;
    while !rest.is_empty() {
        let (key, tail) = take_field(rest)?;
        let (value, tail) = take_field(tail)?;
        entries.push((key.to_vec(), value.to_vec()));
        rest = tail;
    }
    Ok(entries)
}

fn take_field(buf: &[u8]) -> Result<(&[u8], &[u8])> {
    let header: [u8; 4] = buf
        .get(..4)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| corrupt_metainfo("truncated entry length"))?;
    let len = u32::from_be_bytes(header) as usize;
    let body = &buf[4..];
    if body.len() < len {
        return Err(corrupt_metainfo("truncated entry"));
    }
    Ok(body.split_at(len))
}

fn corrupt_metainfo(what: &'static str) -> SliceError {
    error!(reason = what, "superblock.bad_metainfo");
    SliceError::Corruption(format!("superblock metainfo: {what}"))
}
