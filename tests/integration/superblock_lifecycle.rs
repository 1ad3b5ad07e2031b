#![allow(missing_docs)]

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::sync::{Arc, Once};

use slicestore::{
    primitives::cache::{Access, BlockCache, CacheOptions, EvictionPriority, Transaction},
    primitives::concurrency::SequenceGroup,
    storage::{
        superblock::{self, with_superblock},
        BtreeSlice, SliceOptions, SUPERBLOCK_ID, SUPERBLOCK_MAGIC,
    },
    types::{BlockId, Bound, KeyRange, ReplTimestamp, Result, SliceError, StoreKey},
};
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .try_init();
    });
}

fn key(s: &str) -> StoreKey {
    StoreKey::new(s).expect("valid key")
}

fn read_sb<R>(cache: &BlockCache, f: impl FnOnce(&mut superblock::GotSuperblock) -> Result<R>) -> Result<R> {
    let seq = SequenceGroup::for_slice(cache.slice_num());
    with_superblock(cache, &seq, Access::Read, None, EvictionPriority::INITIAL_ROOT, f)
}

#[test]
fn fresh_shard_starts_empty_and_in_the_distant_past() -> Result<()> {
    init_tracing();
    let cache = BlockCache::in_memory()?;
    let range = KeyRange::new(Bound::Closed(key("a")), Bound::Open(key("z")));
    superblock::create(&cache, &range)?;

    read_sb(&cache, |sb| {
        assert_eq!(sb.root_block(), BlockId::NULL);
        assert_eq!(sb.replication_clock(), ReplTimestamp::DISTANT_PAST);
        assert_eq!(sb.last_sync(), ReplTimestamp::DISTANT_PAST);
        assert_eq!(sb.replication_master_id(), 0);
        assert_eq!(sb.replication_slave_id(), 0);
        assert_eq!(sb.key_range()?, range);
        Ok(())
    })?;

    let seq = SequenceGroup::for_slice(cache.slice_num());
    let mut txn = Transaction::begin(&cache, &seq, Access::Read, 0, ReplTimestamp::DISTANT_PAST)?;
    let lock = txn.acquire(SUPERBLOCK_ID, Access::Read)?;
    assert_eq!(&lock.data()[..8], &SUPERBLOCK_MAGIC);
    assert_eq!(lock.recency(), ReplTimestamp::DISTANT_PAST);
    Ok(())
}

#[test]
fn replication_clock_takes_the_maximum() -> Result<()> {
    init_tracing();
    let cache = BlockCache::in_memory()?;
    superblock::create_universe(&cache)?;
    let seq = SequenceGroup::for_slice(cache.slice_num());
    let write = |ts: u32| {
        with_superblock(&cache, &seq, Access::Write, None, EvictionPriority::INITIAL_ROOT, |sb| {
            sb.bump_replication_clock(ReplTimestamp(ts))
        })
    };
    assert_eq!(write(10)?, ReplTimestamp(10));
    assert_eq!(write(20)?, ReplTimestamp(20));
    assert_eq!(write(10)?, ReplTimestamp(20));
    assert_eq!(read_sb(&cache, |sb| Ok(sb.replication_clock()))?, ReplTimestamp(20));
    Ok(())
}

#[test]
fn recreate_resets_replication_state() -> Result<()> {
    init_tracing();
    let cache = BlockCache::in_memory()?;
    superblock::create_universe(&cache)?;
    let seq = SequenceGroup::for_slice(cache.slice_num());
    with_superblock(&cache, &seq, Access::Write, None, EvictionPriority::INITIAL_ROOT, |sb| {
        sb.bump_replication_clock(ReplTimestamp(50))?;
        sb.set_replication_master_id(7)
    })?;
    superblock::create(&cache, &KeyRange::half_open(key("m"), key("n")))?;
    read_sb(&cache, |sb| {
        assert_eq!(sb.replication_clock(), ReplTimestamp::DISTANT_PAST);
        assert_eq!(sb.replication_master_id(), 0);
        assert_eq!(sb.key_range()?, KeyRange::half_open(key("m"), key("n")));
        Ok(())
    })
}

#[test]
fn damaged_magic_on_disk_is_corruption() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("shard.blocks");
    {
        let cache = BlockCache::open(CacheOptions::default().block_size(512).path(&path))?;
        superblock::create_universe(&cache)?;
        cache.flush()?;
    }
    {
        let mut file = OpenOptions::new().write(true).open(&path)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(b"garbage!")?;
        file.sync_all()?;
    }
    let cache = Arc::new(BlockCache::open(CacheOptions::default().block_size(512).path(&path))?);
    let err = BtreeSlice::open(cache, SliceOptions::default()).unwrap_err();
    assert!(matches!(err, SliceError::Corruption(_)), "got {err:?}");
    Ok(())
}
