#![allow(missing_docs)]

use std::sync::mpsc;
use std::sync::{Arc, Once};
use std::thread;
use std::time::Duration;

use slicestore::{
    primitives::archive::encode_fixed,
    primitives::cache::{BlockCache, CacheOptions},
    primitives::concurrency::{OrderToken, SequenceGroup},
    storage::{
        BackfillAtom, BackfillCallback, BtreeSlice, CasTime, DeleteMutation, DeleteResult,
        IncrDecrResult, KeyValuePair, Mutation, MutationResult, SetResult, SliceOptions,
    },
    types::{Bound, KeyRange, ReplTimestamp, Result, SliceError, StoreKey},
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

fn castime(n: u32) -> CasTime {
    CasTime::new(u64::from(n), ReplTimestamp(n))
}

fn shard(range: KeyRange) -> Result<(Arc<BtreeSlice>, SequenceGroup)> {
    let cache = Arc::new(BlockCache::in_memory()?);
    BtreeSlice::create(&cache, &range)?;
    let seq = SequenceGroup::for_slice(cache.slice_num());
    Ok((Arc::new(BtreeSlice::open(cache, SliceOptions::default())?), seq))
}

#[test]
fn set_then_get_with_later_token() -> Result<()> {
    init_tracing();
    let (slice, seq) = shard(KeyRange::half_open(key("a"), key("z")))?;
    let source = slice.order_source();
    let set_token = source.issue();
    let get_token = source.issue();

    let stored = slice.change(&Mutation::set(key("k"), "v"), castime(1), &seq, set_token)?;
    assert_eq!(stored, MutationResult::Sarc(SetResult::Stored));
    let got = slice.get(&key("k"), &seq, get_token)?;
    assert_eq!(got.value.as_deref(), Some(&b"v"[..]));
    assert_eq!(got.cas, 1);
    Ok(())
}

#[test]
fn checkpoint_holds_reads_behind_earlier_writes() -> Result<()> {
    init_tracing();
    let (slice, seq) = shard(KeyRange::universe())?;

    // Bypassing the checkpoint lets a read submitted after the write's token
    // was issued run first and miss the write.
    let source = slice.order_source();
    let set_token = source.issue();
    let raced = slice.get(&key("k"), &seq, OrderToken::ignore())?;
    assert!(raced.value.is_none());

    // Checked through the checkpoint, the same read waits for the write.
    let get_token = source.issue();
    let (tx, rx) = mpsc::channel();
    let reader = {
        let slice = Arc::clone(&slice);
        let seq = seq.clone();
        thread::spawn(move || {
            let got = slice.get(&key("k"), &seq, get_token);
            tx.send(()).ok();
            got
        })
    };
    thread::sleep(Duration::from_millis(50));
    assert!(rx.try_recv().is_err(), "read must wait for the earlier token");

    slice.change(&Mutation::set(key("k"), "v"), castime(1), &seq, set_token)?;
    let got = reader.join().expect("reader thread")?;
    assert_eq!(got.value.as_deref(), Some(&b"v"[..]));
    Ok(())
}

#[test]
fn mutation_variants_report_memcached_results() -> Result<()> {
    init_tracing();
    let (slice, seq) = shard(KeyRange::universe())?;
    let source = slice.order_source();
    let change = |m: Mutation, n: u32| slice.change(&m, castime(n), &seq, source.issue());

    assert_eq!(
        change(Mutation::incr(key("n"), 1), 1)?,
        MutationResult::IncrDecr(IncrDecrResult::NotFound)
    );
    change(Mutation::set(key("n"), "41"), 2)?;
    assert_eq!(
        change(Mutation::incr(key("n"), 1), 3)?,
        MutationResult::IncrDecr(IncrDecrResult::Success(42))
    );
    assert_eq!(
        change(Mutation::add(key("n"), "0"), 4)?,
        MutationResult::Sarc(SetResult::DidntReplace)
    );
    assert_eq!(
        change(Mutation::cas(key("n"), "7", 99), 5)?,
        MutationResult::Sarc(SetResult::Exists)
    );
    assert_eq!(
        change(Mutation::cas(key("n"), "7", 3), 6)?,
        MutationResult::Sarc(SetResult::Stored)
    );
    assert_eq!(
        change(Mutation::delete(key("n")), 7)?,
        MutationResult::Delete(DeleteResult::Deleted)
    );
    assert_eq!(
        change(Mutation::delete(key("n")), 8)?,
        MutationResult::Delete(DeleteResult::NotFound)
    );
    Ok(())
}

#[test]
fn refused_writes_keep_fresh_shard_usable() -> Result<()> {
    init_tracing();
    let (slice, seq) = shard(KeyRange::universe())?;
    let source = slice.order_source();

    assert_eq!(
        slice.change(&Mutation::replace(key("k"), "v"), castime(1), &seq, source.issue())?,
        MutationResult::Sarc(SetResult::DidntAdd)
    );
    assert_eq!(
        slice.change(&Mutation::cas(key("k"), "v", 1), castime(2), &seq, source.issue())?,
        MutationResult::Sarc(SetResult::NotFound)
    );
    let got = slice.get(&key("k"), &seq, source.issue())?;
    assert!(got.value.is_none());
    assert!(slice.range_get(Bound::Unbounded, Bound::Unbounded, &seq, source.issue())?.is_empty());

    slice.change(&Mutation::set(key("k"), "v"), castime(3), &seq, source.issue())?;
    let got = slice.get(&key("k"), &seq, source.issue())?;
    assert_eq!(got.value.as_deref(), Some(&b"v"[..]));
    Ok(())
}

#[test]
fn key_range_metainfo_is_immutable() -> Result<()> {
    init_tracing();
    let range = KeyRange::half_open(key("a"), key("m"));
    let (slice, seq) = shard(range.clone())?;
    let source = slice.order_source();
    let range_key = encode_fixed(&range);

    let deleted = slice.delete_metainfo(&range_key, &seq, source.issue());
    assert!(matches!(deleted, Err(SliceError::Invalid(_))), "got {deleted:?}");
    let replaced = slice.set_metainfo(&range_key, b"x", &seq, source.issue());
    assert!(matches!(replaced, Err(SliceError::Invalid(_))), "got {replaced:?}");
    assert_eq!(slice.key_range(&seq)?, range);

    let reopened = BtreeSlice::open(Arc::clone(slice.cache()), SliceOptions::default())?;
    assert_eq!(reopened.key_range(&seq)?, range);
    Ok(())
}

#[test]
fn range_get_honors_bound_kinds() -> Result<()> {
    init_tracing();
    let (slice, seq) = shard(KeyRange::universe())?;
    let source = slice.order_source();
    for (i, k) in ["a", "b", "c", "d"].into_iter().enumerate() {
        slice.change(&Mutation::set(key(k), k), castime(i as u32 + 1), &seq, source.issue())?;
    }
    let keys = |pairs: Vec<KeyValuePair>| -> Vec<StoreKey> {
        pairs.into_iter().map(|p| p.key).collect()
    };

    let open_closed = slice.range_get(Bound::Open(key("a")), Bound::Closed(key("c")), &seq, source.issue())?;
    assert_eq!(keys(open_closed), vec![key("b"), key("c")]);
    let everything = slice.range_get(Bound::Unbounded, Bound::Unbounded, &seq, source.issue())?;
    assert_eq!(everything.len(), 4);
    assert_eq!(&everything[3].value[..], b"d");
    let tail = slice.range_get(Bound::Closed(key("c")), Bound::Unbounded, &seq, source.issue())?;
    assert_eq!(keys(tail), vec![key("c"), key("d")]);
    Ok(())
}

#[derive(Default)]
struct Collected {
    deletions: Vec<(StoreKey, ReplTimestamp)>,
    atoms: Vec<BackfillAtom>,
    done: usize,
}

impl BackfillCallback for Collected {
    fn on_deletion(&mut self, key: &StoreKey, recency: ReplTimestamp) {
        self.deletions.push((key.clone(), recency));
    }

    fn on_keyvalue(&mut self, atom: BackfillAtom) {
        self.atoms.push(atom);
    }

    fn done(&mut self) {
        self.done += 1;
    }
}

#[test]
fn backfill_streams_changes_since_timestamp() -> Result<()> {
    init_tracing();
    let (slice, seq) = shard(KeyRange::universe())?;
    let source = slice.order_source();
    slice.change(&Mutation::set(key("old"), "1"), castime(1), &seq, source.issue())?;
    slice.change(&Mutation::set(key("new"), "2"), castime(5), &seq, source.issue())?;
    slice.change(&Mutation::set(key("gone"), "3"), castime(2), &seq, source.issue())?;
    slice.change(&Mutation::delete(key("gone")), castime(6), &seq, source.issue())?;
    slice.change(&Mutation::set(key("quiet"), "4"), castime(3), &seq, source.issue())?;
    let quiet_delete = Mutation::Delete(DeleteMutation {
        key: key("quiet"),
        dont_put_in_delete_queue: true,
    });
    slice.change(&quiet_delete, castime(7), &seq, source.issue())?;

    let mut collected = Collected::default();
    slice.backfill(&KeyRange::universe(), ReplTimestamp(4), &mut collected, &seq, source.issue())?;
    assert_eq!(collected.done, 1);
    assert_eq!(collected.deletions, vec![(key("gone"), ReplTimestamp(6))]);
    assert_eq!(collected.atoms.len(), 1);
    assert_eq!(collected.atoms[0].key, key("new"));
    assert_eq!(collected.atoms[0].recency, ReplTimestamp(5));

    let mut narrow = Collected::default();
    let range = KeyRange::half_open(key("a"), key("m"));
    slice.backfill(&range, ReplTimestamp::DISTANT_PAST, &mut narrow, &seq, source.issue())?;
    assert_eq!(narrow.deletions.len(), 1);
    assert!(narrow.atoms.is_empty());
    Ok(())
}

#[test]
fn backfill_delete_range_erases_selected_keys() -> Result<()> {
    init_tracing();
    let (slice, seq) = shard(KeyRange::universe())?;
    let source = slice.order_source();
    for (i, k) in ["a", "b1", "b2", "c", "d"].into_iter().enumerate() {
        slice.change(&Mutation::set(key(k), "v"), castime(i as u32 + 1), &seq, source.issue())?;
    }
    let not_b = |k: &StoreKey| !k.as_bytes().starts_with(b"b");
    let erased = slice.backfill_delete_range(
        &not_b,
        Some(&key("a")),
        Some(&key("c")),
        &seq,
        source.issue(),
    )?;
    assert_eq!(erased, 1, "only c lies in (a, c] and fails the keep test");
    let left = slice.range_get(Bound::Unbounded, Bound::Unbounded, &seq, source.issue())?;
    let left: Vec<StoreKey> = left.into_iter().map(|p| p.key).collect();
    assert_eq!(left, vec![key("a"), key("b1"), key("b2"), key("d")]);
    Ok(())
}

#[test]
fn replication_metadata_round_trips() -> Result<()> {
    init_tracing();
    let (slice, seq) = shard(KeyRange::half_open(key("a"), key("z")))?;
    let source = slice.order_source();

    assert_eq!(slice.replication_clock(&seq)?, ReplTimestamp::DISTANT_PAST);
    assert_eq!(slice.set_replication_clock(ReplTimestamp(9), &seq, source.issue())?, ReplTimestamp(9));
    assert_eq!(slice.set_replication_clock(ReplTimestamp(4), &seq, source.issue())?, ReplTimestamp(9));
    assert_eq!(slice.replication_clock(&seq)?, ReplTimestamp(9));

    slice.set_last_sync(ReplTimestamp(3), &seq, source.issue())?;
    assert_eq!(slice.last_sync(&seq)?, ReplTimestamp(3));
    slice.set_replication_master_id(11, &seq, source.issue())?;
    slice.set_replication_slave_id(12, &seq, source.issue())?;
    assert_eq!(slice.replication_master_id(&seq)?, 11);
    assert_eq!(slice.replication_slave_id(&seq)?, 12);

    assert_eq!(slice.key_range(&seq)?, KeyRange::half_open(key("a"), key("z")));
    slice.set_metainfo(b"owner", b"node-1", &seq, source.issue())?;
    assert_eq!(slice.get_metainfo(b"owner", &seq)?, Some(b"node-1".to_vec()));
    assert_eq!(slice.metainfo_entries(&seq)?.len(), 2);
    assert!(slice.delete_metainfo(b"owner", &seq, source.issue())?);
    assert_eq!(slice.get_metainfo(b"owner", &seq)?, None);
    Ok(())
}

#[test]
fn flushed_shard_reopens_with_its_data() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("shard0.blocks");
    {
        let cache = Arc::new(BlockCache::open(CacheOptions::default().path(&path))?);
        BtreeSlice::create_universe(&cache)?;
        let slice = BtreeSlice::open(Arc::clone(&cache), SliceOptions::default())?;
        let seq = SequenceGroup::for_slice(cache.slice_num());
        let source = slice.order_source();
        slice.change(&Mutation::set(key("durable"), "yes"), castime(3), &seq, source.issue())?;
        slice.set_replication_clock(ReplTimestamp(3), &seq, source.issue())?;
        assert!(cache.flush()? >= 2);
    }
    let cache = Arc::new(BlockCache::open(CacheOptions::default().path(&path))?);
    let slice = BtreeSlice::open(Arc::clone(&cache), SliceOptions::default())?;
    let seq = SequenceGroup::for_slice(cache.slice_num());
    let got = slice.get(&key("durable"), &seq, OrderToken::ignore())?;
    assert_eq!(got.value.as_deref(), Some(&b"yes"[..]));
    assert_eq!(slice.replication_clock(&seq)?, ReplTimestamp(3));
    Ok(())
}
