use std::fmt;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
    RawRwLock,
};
use tracing::{debug, trace};

use super::frame::Frame;
use super::{Access, BlockCache, CacheAccount, EvictionPriority};
use crate::primitives::concurrency::{LaneTicket, OrderToken, SequenceGroup};
use crate::types::{BlockId, ReplTimestamp, Result, SliceError};

/// A scoped unit of work against a [`BlockCache`].
///
/// Locks taken through the transaction live in the returned [`BufLock`]s and are
/// released when those are dropped.
pub struct Transaction<'c> {
    cache: &'c BlockCache,
    access: Access,
    recency: ReplTimestamp,
    expected_changes: usize,
    ticket: LaneTicket,
    account: Option<CacheAccount>,
    order_token: OrderToken,
    acquired: usize,
    started: Instant,
}

impl<'c> Transaction<'c> {
    /// Opens a transaction on the cache's lane of `seq_group`.
    ///
    /// `recency` stamps every block acquired for write; `expected_changes` is a
    /// sizing hint.
    pub fn begin(
        cache: &'c BlockCache,
        seq_group: &SequenceGroup,
        access: Access,
        expected_changes: usize,
        recency: ReplTimestamp,
    ) -> Result<Self> {
        let ticket = seq_group.take_ticket(cache.slice_num())?;
        cache.counters.transactions.fetch_add(1, AtomicOrdering::Relaxed);
        trace!(
            slice = cache.slice_num(),
            access = ?access,
            ticket = ticket.ticket(),
            expected_changes,
            recency = %recency,
            "cache.txn.begin"
        );
        Ok(Self {
            cache,
            access,
            recency,
            expected_changes,
            ticket,
            account: None,
            order_token: OrderToken::ignore(),
            acquired: 0,
            started: Instant::now(),
        })
    }

    /// The cache this transaction runs against.
    pub fn cache(&self) -> &'c BlockCache {
        self.cache
    }

    /// Access mode the transaction was opened with.
    pub fn access(&self) -> Access {
        self.access
    }

    /// Timestamp stamped onto written blocks.
    pub fn recency(&self) -> ReplTimestamp {
        self.recency
    }

    /// Charges subsequent acquisitions to `account`.
    pub fn set_account(&mut self, account: &CacheAccount) {
        self.account = Some(account.clone());
    }

    /// Records the token of the operation this transaction serves.
    pub fn set_order_token(&mut self, token: OrderToken) {
        self.order_token = token;
    }

    /// Token recorded with [`Transaction::set_order_token`].
    pub fn order_token(&self) -> OrderToken {
        self.order_token
    }

    /// Locks `block` for `access`.
    pub fn acquire(&mut self, block: BlockId, access: Access) -> Result<BufLock> {
        if access == Access::Write && self.access == Access::Read {
            return Err(SliceError::Invalid("write access in a read transaction"));
        }
        let frame = self.cache.frame(block)?;
        self.ticket.wait_turn();
        let guard = match access {
            Access::Read => LockGuard::Read(frame.buf.read_arc()),
            Access::Write => LockGuard::Write(frame.buf.write_arc()),
        };
        self.ticket.finish();
        if access == Access::Write {
            frame.dirty.store(true, AtomicOrdering::Release);
            frame
                .recency
                .fetch_max(self.recency.0, AtomicOrdering::AcqRel);
        }
        if let Some(account) = &self.account {
            account.charge();
        }
        self.acquired += 1;
        self.cache.counters.acquires.fetch_add(1, AtomicOrdering::Relaxed);
        trace!(block = %block, access = ?access, "cache.txn.acquire");
        Ok(BufLock {
            id: block,
            frame,
            guard,
        })
    }

    /// Allocates a zeroed block and locks it for write.
    pub fn allocate(&mut self) -> Result<BufLock> {
        if self.access == Access::Read {
            return Err(SliceError::Invalid("allocation in a read transaction"));
        }
        let block = self.cache.allocate_frame();
        self.acquire(block, Access::Write)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.ticket.finish();
        debug!(
            slice = self.cache.slice_num(),
            access = ?self.access,
            acquired = self.acquired,
            expected_changes = self.expected_changes,
            token = ?self.order_token,
            elapsed_us = self.started.elapsed().as_micros() as u64,
            "cache.txn.end"
        );
    }
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("slice", &self.cache.slice_num())
            .field("access", &self.access)
            .field("recency", &self.recency)
            .field("acquired", &self.acquired)
            .finish()
    }
}

enum LockGuard {
    Read(ArcRwLockReadGuard<RawRwLock, Box<[u8]>>),
    Write(ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>),
}

/// A held lock on one block's bytes.
pub struct BufLock {
    id: BlockId,
    frame: Arc<Frame>,
    guard: LockGuard,
}

impl BufLock {
    /// The locked block.
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Returns true when the lock grants write access.
    pub fn is_write(&self) -> bool {
        matches!(self.guard, LockGuard::Write(_))
    }

    /// Block contents.
    pub fn data(&self) -> &[u8] {
        match &self.guard {
            LockGuard::Read(guard) => &guard[..],
            LockGuard::Write(guard) => &guard[..],
        }
    }

    /// Mutable block contents; fails on a read lock.
    pub fn data_mut(&mut self) -> Result<&mut [u8]> {
        match &mut self.guard {
            LockGuard::Read(_) => Err(SliceError::Invalid("block locked for read")),
            LockGuard::Write(guard) => Ok(&mut guard[..]),
        }
    }

    /// Sets the block's recency marker to exactly `ts`.
    pub fn touch_recency(&mut self, ts: ReplTimestamp) -> Result<()> {
        if !self.is_write() {
            return Err(SliceError::Invalid("block locked for read"));
        }
        self.frame.recency.store(ts.0, AtomicOrdering::Release);
        Ok(())
    }

    /// Most recent write timestamp recorded for the block.
    pub fn recency(&self) -> ReplTimestamp {
        ReplTimestamp(self.frame.recency.load(AtomicOrdering::Acquire))
    }

    /// Biases eviction of this block.
    pub fn set_eviction_priority(&self, priority: EvictionPriority) {
        self.frame
            .eviction_priority
            .store(priority.0, AtomicOrdering::Relaxed);
    }

    /// Current eviction priority of the block.
    pub fn eviction_priority(&self) -> EvictionPriority {
        EvictionPriority(self.frame.eviction_priority.load(AtomicOrdering::Relaxed))
    }
}

impl fmt::Debug for BufLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufLock")
            .field("id", &self.id)
            .field("write", &self.is_write())
            .finish()
    }
}
