//! The per-shard facade.
//!
//! A [`BtreeSlice`] owns a shard's ordering checkpoint and hands every request
//! to the tree algorithms inside a transaction on the shard's cache. Token
//! entry points check the caller's token through the checkpoint first; the
//! `_in_txn` variants run inside a transaction the caller already opened with
//! [`BtreeSlice::begin_transaction`].

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use tracing::{debug, info, trace};

use crate::primitives::cache::{
    Access, BlockCache, CacheAccount, EvictionPriority, Transaction,
};
use crate::primitives::concurrency::{Admission, OrderCheckpoint, OrderSource, OrderToken, SequenceGroup};
use crate::storage::algorithms::{
    BTreeAlgorithms, BackfillAtom, BackfillCallback, KeyTester, KeyValuePair,
};
use crate::storage::dispatch;
use crate::storage::leaf::LeafTree;
use crate::storage::metrics::{default_metrics, SliceMetrics};
use crate::storage::mutation::{CasTime, GetResult, Mutation, MutationResult};
use crate::storage::options::SliceOptions;
use crate::storage::superblock::{self, with_superblock, GotSuperblock};
use crate::types::{Bound, KeyRange, ReplTimestamp, Result, StoreKey};

/// Controller for one shard's tree.
pub struct BtreeSlice<A: BTreeAlgorithms = LeafTree> {
    cache: Arc<BlockCache>,
    algorithms: A,
    checkpoint: OrderCheckpoint,
    backfill_account: CacheAccount,
    root_eviction_priority: AtomicI32,
    metrics: Arc<dyn SliceMetrics>,
}

impl BtreeSlice<LeafTree> {
    /// Formats the shard held by `cache` to cover `key_range`.
    ///
    /// The superblock does not depend on the tree algorithms; slices with
    /// other algorithms open shards formatted here too.
    pub fn create(cache: &BlockCache, key_range: &KeyRange) -> Result<()> {
        superblock::create(cache, key_range)
    }

    /// Formats the shard held by `cache` to cover every key.
    pub fn create_universe(cache: &BlockCache) -> Result<()> {
        superblock::create_universe(cache)
    }

    /// Opens a formatted shard with the single-leaf tree.
    pub fn open(cache: Arc<BlockCache>, options: SliceOptions) -> Result<Self> {
        Self::with_algorithms(cache, LeafTree::new(), options)
    }
}

impl<A: BTreeAlgorithms> BtreeSlice<A> {
    /// Opens a formatted shard driven by `algorithms`.
    ///
    /// Fails with corruption when block 0 is not a superblock.
    pub fn with_algorithms(cache: Arc<BlockCache>, algorithms: A, options: SliceOptions) -> Result<Self> {
        let probe = SequenceGroup::for_slice(cache.slice_num());
        let key_range = with_superblock(
            &cache,
            &probe,
            Access::Read,
            None,
            options.root_eviction_priority,
            |sb| sb.key_range(),
        )?;
        let checkpoint = OrderCheckpoint::new(format!("slice-{}", cache.slice_num()));
        let backfill_account = cache.create_account(options.backfill_cache_priority);
        info!(
            slice = cache.slice_num(),
            key_range = ?key_range,
            backfill_priority = options.backfill_cache_priority,
            "slice.open"
        );
        Ok(Self {
            cache,
            algorithms,
            checkpoint,
            backfill_account,
            root_eviction_priority: AtomicI32::new(options.root_eviction_priority.0),
            metrics: options.metrics.unwrap_or_else(default_metrics),
        })
    }

    /// The shard's cache.
    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    /// The tree algorithms behind this slice.
    pub fn algorithms(&self) -> &A {
        &self.algorithms
    }

    /// A new token source bound to this slice's checkpoint.
    pub fn order_source(&self) -> OrderSource {
        self.checkpoint.source()
    }

    /// Account backfill reads are charged to.
    pub fn backfill_account(&self) -> &CacheAccount {
        &self.backfill_account
    }

    /// Eviction priority handed to the tree root.
    pub fn root_eviction_priority(&self) -> EvictionPriority {
        EvictionPriority(self.root_eviction_priority.load(Ordering::Relaxed))
    }

    /// Replaces the root eviction priority for later transactions.
    pub fn set_root_eviction_priority(&self, priority: EvictionPriority) {
        self.root_eviction_priority.store(priority.0, Ordering::Relaxed);
    }

    /// Checks `token` through and opens a transaction holding the superblock.
    ///
    /// The returned pair feeds the `_in_txn` entry points.
    pub fn begin_transaction(
        &self,
        seq_group: &SequenceGroup,
        access: Access,
        token: OrderToken,
    ) -> Result<(Transaction<'_>, GotSuperblock)> {
        let admission = self.admit(token);
        self.begin(seq_group, access, 1, ReplTimestamp::DISTANT_PAST, admission)
    }

    /// Point read.
    pub fn get(&self, key: &StoreKey, seq_group: &SequenceGroup, token: OrderToken) -> Result<GetResult> {
        self.metrics.operation("get");
        let admission = self.admit(token);
        let (mut txn, mut sb) =
            self.begin(seq_group, Access::Read, 0, ReplTimestamp::DISTANT_PAST, admission)?;
        self.get_in_txn(key, &mut txn, &mut sb)
    }

    /// Point read inside a caller-held transaction.
    pub fn get_in_txn(
        &self,
        key: &StoreKey,
        txn: &mut Transaction<'_>,
        sb: &mut GotSuperblock,
    ) -> Result<GetResult> {
        let result = self.algorithms.get(key, txn, sb)?;
        trace!(slice = self.slice_num(), key = %key, found = result.value.is_some(), "slice.get");
        Ok(result)
    }

    /// Live entries between `left` and `right`, in key order.
    pub fn range_get(
        &self,
        left: Bound,
        right: Bound,
        seq_group: &SequenceGroup,
        token: OrderToken,
    ) -> Result<Vec<KeyValuePair>> {
        self.metrics.operation("range_get");
        let admission = self.admit(token);
        let (mut txn, mut sb) =
            self.begin(seq_group, Access::Read, 0, ReplTimestamp::DISTANT_PAST, admission)?;
        self.range_get_in_txn(left, right, &mut txn, &mut sb)
    }

    /// Range read inside a caller-held transaction.
    pub fn range_get_in_txn(
        &self,
        left: Bound,
        right: Bound,
        txn: &mut Transaction<'_>,
        sb: &mut GotSuperblock,
    ) -> Result<Vec<KeyValuePair>> {
        let range = KeyRange::new(left, right);
        let pairs = self.algorithms.range_get(&range, txn, sb)?;
        trace!(slice = self.slice_num(), range = ?range, pairs = pairs.len(), "slice.range_get");
        Ok(pairs)
    }

    /// Applies one mutation.
    pub fn change(
        &self,
        mutation: &Mutation,
        castime: CasTime,
        seq_group: &SequenceGroup,
        token: OrderToken,
    ) -> Result<MutationResult> {
        self.metrics.operation("change");
        self.metrics.mutation(mutation.kind());
        let admission = self.admit(token);
        let result = dispatch::change_ordered(
            &self.algorithms,
            &self.cache,
            seq_group,
            admission,
            mutation,
            castime,
            self.root_eviction_priority(),
        )?;
        debug!(
            slice = self.slice_num(),
            kind = mutation.kind(),
            key = %mutation.key(),
            result = ?result,
            "slice.change"
        );
        Ok(result)
    }

    /// Applies one mutation inside a caller-held write transaction.
    pub fn change_in_txn(
        &self,
        mutation: &Mutation,
        castime: CasTime,
        txn: &mut Transaction<'_>,
        sb: &mut GotSuperblock,
    ) -> Result<MutationResult> {
        self.metrics.mutation(mutation.kind());
        dispatch::change_in_txn(&self.algorithms, mutation, castime, txn, sb)
    }

    /// Streams entries and tombstones in `range` written at or after `since`.
    ///
    /// Reads are charged to the slice's backfill account.
    pub fn backfill(
        &self,
        range: &KeyRange,
        since: ReplTimestamp,
        callback: &mut dyn BackfillCallback,
        seq_group: &SequenceGroup,
        token: OrderToken,
    ) -> Result<()> {
        self.metrics.operation("backfill");
        let admission = self.admit(token);
        let (mut txn, mut sb) =
            self.begin(seq_group, Access::Read, 0, ReplTimestamp::DISTANT_PAST, admission)?;
        txn.set_account(&self.backfill_account);
        self.backfill_in_txn(range, since, callback, &mut txn, &mut sb)
    }

    /// Backfill inside a caller-held transaction.
    pub fn backfill_in_txn(
        &self,
        range: &KeyRange,
        since: ReplTimestamp,
        callback: &mut dyn BackfillCallback,
        txn: &mut Transaction<'_>,
        sb: &mut GotSuperblock,
    ) -> Result<()> {
        let mut counting = CountingCallback {
            inner: callback,
            metrics: self.metrics.as_ref(),
            atoms: 0,
        };
        self.algorithms.backfill(range, since, &mut counting, txn, sb)?;
        debug!(
            slice = self.slice_num(),
            range = ?range,
            since = %since,
            atoms = counting.atoms,
            "slice.backfill"
        );
        Ok(())
    }

    /// Erases keys after `left_exclusive` up to and including `right_inclusive`
    /// that `tester` selects. A missing end leaves that side unbounded.
    ///
    /// Returns the number of keys erased.
    pub fn backfill_delete_range(
        &self,
        tester: &dyn KeyTester,
        left_exclusive: Option<&StoreKey>,
        right_inclusive: Option<&StoreKey>,
        seq_group: &SequenceGroup,
        token: OrderToken,
    ) -> Result<usize> {
        self.metrics.operation("backfill_delete_range");
        let admission = self.admit(token);
        let (mut txn, mut sb) =
            self.begin(seq_group, Access::Write, 1, ReplTimestamp::DISTANT_PAST, admission)?;
        self.backfill_delete_range_in_txn(tester, left_exclusive, right_inclusive, &mut txn, &mut sb)
    }

    /// Range erasure inside a caller-held write transaction.
    pub fn backfill_delete_range_in_txn(
        &self,
        tester: &dyn KeyTester,
        left_exclusive: Option<&StoreKey>,
        right_inclusive: Option<&StoreKey>,
        txn: &mut Transaction<'_>,
        sb: &mut GotSuperblock,
    ) -> Result<usize> {
        let range = delete_range_bounds(left_exclusive, right_inclusive);
        let erased = self.algorithms.erase_range(tester, &range, txn, sb)?;
        debug!(slice = self.slice_num(), range = ?range, erased, "slice.backfill_delete_range");
        Ok(erased)
    }

    /// Raises the replication clock to `ts`; a smaller `ts` leaves it as is.
    pub fn set_replication_clock(
        &self,
        ts: ReplTimestamp,
        seq_group: &SequenceGroup,
        token: OrderToken,
    ) -> Result<ReplTimestamp> {
        self.metrics.operation("set_replication_clock");
        let admission = self.admit(token);
        self.on_home(seq_group, Access::Write, Some(admission), move |sb| {
            sb.bump_replication_clock(ts)
        })
    }

    /// Current replication clock.
    pub fn replication_clock(&self, seq_group: &SequenceGroup) -> Result<ReplTimestamp> {
        self.metrics.operation("replication_clock");
        self.on_home(seq_group, Access::Read, None, |sb| Ok(sb.replication_clock()))
    }

    /// Records the timestamp of the last completed sync.
    pub fn set_last_sync(
        &self,
        ts: ReplTimestamp,
        seq_group: &SequenceGroup,
        token: OrderToken,
    ) -> Result<()> {
        self.metrics.operation("set_last_sync");
        let admission = self.admit(token);
        self.on_home(seq_group, Access::Write, Some(admission), move |sb| sb.set_last_sync(ts))
    }

    /// Timestamp of the last completed sync.
    pub fn last_sync(&self, seq_group: &SequenceGroup) -> Result<ReplTimestamp> {
        self.metrics.operation("last_sync");
        self.on_home(seq_group, Access::Read, None, |sb| Ok(sb.last_sync()))
    }

    /// Records the id of the replication master.
    pub fn set_replication_master_id(
        &self,
        id: u32,
        seq_group: &SequenceGroup,
        token: OrderToken,
    ) -> Result<()> {
        self.metrics.operation("set_replication_master_id");
        let admission = self.admit(token);
        self.on_home(seq_group, Access::Write, Some(admission), move |sb| {
            sb.set_replication_master_id(id)
        })
    }

    /// Id of the replication master, zero when unset.
    pub fn replication_master_id(&self, seq_group: &SequenceGroup) -> Result<u32> {
        self.metrics.operation("replication_master_id");
        self.on_home(seq_group, Access::Read, None, |sb| Ok(sb.replication_master_id()))
    }

    /// Records the id of the replication slave.
    pub fn set_replication_slave_id(
        &self,
        id: u32,
        seq_group: &SequenceGroup,
        token: OrderToken,
    ) -> Result<()> {
        self.metrics.operation("set_replication_slave_id");
        let admission = self.admit(token);
        self.on_home(seq_group, Access::Write, Some(admission), move |sb| {
            sb.set_replication_slave_id(id)
        })
    }

    /// Id of the replication slave, zero when unset.
    pub fn replication_slave_id(&self, seq_group: &SequenceGroup) -> Result<u32> {
        self.metrics.operation("replication_slave_id");
        self.on_home(seq_group, Access::Read, None, |sb| Ok(sb.replication_slave_id()))
    }

    /// Key range the shard was created with.
    pub fn key_range(&self, seq_group: &SequenceGroup) -> Result<KeyRange> {
        self.metrics.operation("key_range");
        self.metainfo_txn(seq_group, Access::Read, None, |sb| sb.key_range())
    }

    /// Value stored under `key` in the superblock metainfo.
    pub fn get_metainfo(&self, key: &[u8], seq_group: &SequenceGroup) -> Result<Option<Vec<u8>>> {
        self.metrics.operation("get_metainfo");
        self.metainfo_txn(seq_group, Access::Read, None, |sb| sb.get_metainfo(key))
    }

    /// Inserts or replaces a metainfo entry.
    pub fn set_metainfo(
        &self,
        key: &[u8],
        value: &[u8],
        seq_group: &SequenceGroup,
        token: OrderToken,
    ) -> Result<()> {
        self.metrics.operation("set_metainfo");
        let admission = self.admit(token);
        self.metainfo_txn(seq_group, Access::Write, Some(admission), |sb| {
            sb.set_metainfo(key, value)
        })
    }

    /// Removes a metainfo entry; returns whether it existed.
    pub fn delete_metainfo(
        &self,
        key: &[u8],
        seq_group: &SequenceGroup,
        token: OrderToken,
    ) -> Result<bool> {
        self.metrics.operation("delete_metainfo");
        let admission = self.admit(token);
        self.metainfo_txn(seq_group, Access::Write, Some(admission), |sb| sb.delete_metainfo(key))
    }

    /// Every metainfo entry in stored order, key range first.
    pub fn metainfo_entries(&self, seq_group: &SequenceGroup) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.metrics.operation("metainfo_entries");
        self.metainfo_txn(seq_group, Access::Read, None, |sb| sb.metainfo_entries())
    }

    fn slice_num(&self) -> usize {
        self.cache.slice_num()
    }

    fn admit(&self, token: OrderToken) -> Admission {
        let admission = self.checkpoint.enter(token);
        let waited = admission.waited();
        if !waited.is_zero() {
            self.metrics.checkpoint_wait(waited);
        }
        admission
    }

    fn begin(
        &self,
        seq_group: &SequenceGroup,
        access: Access,
        expected_changes: usize,
        recency: ReplTimestamp,
        admission: Admission,
    ) -> Result<(Transaction<'_>, GotSuperblock)> {
        let mut txn = Transaction::begin(&self.cache, seq_group, access, expected_changes, recency)?;
        txn.set_order_token(admission.release());
        let sb = GotSuperblock::acquire(&mut txn, access, self.root_eviction_priority())?;
        Ok((txn, sb))
    }

    fn metainfo_txn<R>(
        &self,
        seq_group: &SequenceGroup,
        access: Access,
        admission: Option<Admission>,
        f: impl FnOnce(&mut GotSuperblock) -> Result<R>,
    ) -> Result<R> {
        with_superblock(
            &self.cache,
            seq_group,
            access,
            admission,
            self.root_eviction_priority(),
            f,
        )
    }

    // Replication metadata lives with the shard's home context.
    fn on_home<R, F>(
        &self,
        seq_group: &SequenceGroup,
        access: Access,
        admission: Option<Admission>,
        f: F,
    ) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut GotSuperblock) -> Result<R> + Send + 'static,
    {
        let cache = Arc::clone(&self.cache);
        let seq_group = seq_group.clone();
        let priority = self.root_eviction_priority();
        if !self.cache.home().is_current() {
            trace!(slice = self.slice_num(), home = self.cache.home().name(), "slice.hop_home");
        }
        self.cache
            .home()
            .run(move || with_superblock(&cache, &seq_group, access, admission, priority, f))?
    }
}

impl<A: BTreeAlgorithms> fmt::Debug for BtreeSlice<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BtreeSlice")
            .field("slice_num", &self.cache.slice_num())
            .field("checkpoint", &self.checkpoint)
            .field("root_eviction_priority", &self.root_eviction_priority())
            .finish_non_exhaustive()
    }
}

fn delete_range_bounds(left_exclusive: Option<&StoreKey>, right_inclusive: Option<&StoreKey>) -> KeyRange {
    KeyRange::new(
        left_exclusive.map_or(Bound::Unbounded, |key| Bound::Open(key.clone())),
        right_inclusive.map_or(Bound::Unbounded, |key| Bound::Closed(key.clone())),
    )
}

struct CountingCallback<'a> {
    inner: &'a mut dyn BackfillCallback,
    metrics: &'a dyn SliceMetrics,
    atoms: u64,
}

impl BackfillCallback for CountingCallback<'_> {
    fn on_deletion(&mut self, key: &StoreKey, recency: ReplTimestamp) {
        self.atoms += 1;
        self.metrics.backfill_atom();
        self.inner.on_deletion(key, recency);
    }

    fn on_keyvalue(&mut self, atom: BackfillAtom) {
        self.atoms += 1;
        self.metrics.backfill_atom();
        self.inner.on_keyvalue(atom);
    }

    fn done(&mut self) {
        self.inner.done();
    }
}
