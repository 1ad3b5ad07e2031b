#![forbid(unsafe_code)]
//! In-process block cache serving one shard.
//!
//! Blocks are fixed-size byte buffers addressed by [`BlockId`]. Block 0 is
//! always present and holds the shard's superblock. When a backing file is
//! configured, block `i` lives at offset `i * block_size` and
//! [`BlockCache::flush`] writes dirty blocks back.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, error, info};

use crate::primitives::concurrency::ExecutionContext;
use crate::primitives::io::{block_offset, FileIo, StdFileIo};
use crate::types::{BlockId, Result, SliceError};

mod frame;
mod txn;

use frame::Frame;
pub use txn::{BufLock, Transaction};

/// Default block size in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;
/// Smallest block size the cache accepts.
pub const MIN_BLOCK_SIZE: usize = 512;

/// Lock mode for transactions and block acquisitions.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Access {
    /// Shared access.
    Read,
    /// Exclusive access.
    Write,
}

/// Bias applied when choosing blocks to evict; higher values are kept longer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EvictionPriority(pub i32);

impl EvictionPriority {
    /// Priority given to a fresh shard's root.
    pub const INITIAL_ROOT: EvictionPriority = EvictionPriority(100);
    /// Priority of blocks nobody set one for.
    pub const DEFAULT: EvictionPriority = EvictionPriority(0);

    /// Priority one level further from the root.
    pub fn incr(self) -> Self {
        EvictionPriority(self.0.saturating_add(1))
    }
}

impl Default for EvictionPriority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Construction parameters for [`BlockCache`].
#[derive(Clone, Debug)]
pub struct CacheOptions {
    /// Size of every block in bytes.
    pub block_size: usize,
    /// Index of the shard this cache serves; selects its sequence-group lane.
    pub slice_num: usize,
    /// Backing file; `None` keeps everything in memory.
    pub path: Option<PathBuf>,
    /// Execution context owning the shard; one is spawned when absent.
    pub home: Option<ExecutionContext>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            slice_num: 0,
            path: None,
            home: None,
        }
    }
}

impl CacheOptions {
    /// Sets the block size.
    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Sets the shard index.
    pub fn slice_num(mut self, slice_num: usize) -> Self {
        self.slice_num = slice_num;
        self
    }

    /// Backs the cache with the file at `path`.
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Runs shard work on an existing execution context.
    pub fn home(mut self, home: ExecutionContext) -> Self {
        self.home = Some(home);
        self
    }
}

/// A priority account that transactions charge their block acquisitions to.
#[derive(Clone)]
pub struct CacheAccount {
    inner: Arc<AccountInner>,
}

struct AccountInner {
    priority: i32,
    charged: AtomicU64,
}

impl CacheAccount {
    /// I/O priority of the account.
    pub fn priority(&self) -> i32 {
        self.inner.priority
    }

    /// Block acquisitions charged so far.
    pub fn blocks_charged(&self) -> u64 {
        self.inner.charged.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn charge(&self) {
        self.inner.charged.fetch_add(1, AtomicOrdering::Relaxed);
    }
}

impl fmt::Debug for CacheAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheAccount")
            .field("priority", &self.inner.priority)
            .field("charged", &self.blocks_charged())
            .finish()
    }
}

#[derive(Default)]
pub(crate) struct CacheCounters {
    pub transactions: AtomicU64,
    pub acquires: AtomicU64,
    pub flushed: AtomicU64,
}

/// Point-in-time cache statistics.
#[derive(Default, Clone, Debug, PartialEq, Eq)]
pub struct CacheStats {
    /// Blocks resident in the cache.
    pub blocks: u64,
    /// Blocks modified since the last flush.
    pub dirty_blocks: u64,
    /// Transactions opened.
    pub transactions: u64,
    /// Block acquisitions across all transactions.
    pub acquires: u64,
    /// Blocks written back by [`BlockCache::flush`].
    pub flushed: u64,
}

/// Fixed-size block store for one shard.
pub struct BlockCache {
    block_size: usize,
    slice_num: usize,
    frames: RwLock<FxHashMap<BlockId, Arc<Frame>>>,
    next_block: AtomicU64,
    io: Option<Arc<dyn FileIo>>,
    home: ExecutionContext,
    pub(crate) counters: CacheCounters,
}

impl BlockCache {
    /// Opens a cache, loading previously flushed blocks from the backing file.
    pub fn open(options: CacheOptions) -> Result<Self> {
        if options.block_size < MIN_BLOCK_SIZE {
            return Err(SliceError::Invalid("block size below MIN_BLOCK_SIZE"));
        }
        let home = match options.home {
            Some(home) => home,
            None => ExecutionContext::spawn(format!("slice-{}", options.slice_num))?,
        };
        let io: Option<Arc<dyn FileIo>> = match &options.path {
            Some(path) => Some(Arc::new(StdFileIo::open(path)?)),
            None => None,
        };
        let mut frames = FxHashMap::default();
        if let Some(io) = &io {
            load_blocks(io.as_ref(), options.block_size, &mut frames)?;
        }
        if frames.is_empty() {
            frames.insert(BlockId(0), Arc::new(Frame::zeroed(options.block_size)));
        }
        let next_block = frames.len() as u64;
        info!(
            slice = options.slice_num,
            block_size = options.block_size,
            blocks = next_block,
            path = ?options.path,
            "cache.open"
        );
        Ok(Self {
            block_size: options.block_size,
            slice_num: options.slice_num,
            frames: RwLock::new(frames),
            next_block: AtomicU64::new(next_block),
            io,
            home,
            counters: CacheCounters::default(),
        })
    }

    /// An in-memory cache with default options.
    pub fn in_memory() -> Result<Self> {
        Self::open(CacheOptions::default())
    }

    /// Size of every block in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Shard index this cache serves.
    pub fn slice_num(&self) -> usize {
        self.slice_num
    }

    /// Execution context owning the shard.
    pub fn home(&self) -> &ExecutionContext {
        &self.home
    }

    /// Creates an account for a class of traffic.
    pub fn create_account(&self, priority: i32) -> CacheAccount {
        debug!(slice = self.slice_num, priority, "cache.create_account");
        CacheAccount {
            inner: Arc::new(AccountInner {
                priority,
                charged: AtomicU64::new(0),
            }),
        }
    }

    /// Writes every dirty block to the backing file and syncs it.
    ///
    /// Returns the number of blocks written; in-memory caches write nothing.
    pub fn flush(&self) -> Result<usize> {
        let Some(io) = &self.io else {
            return Ok(0);
        };
        let mut dirty: Vec<(BlockId, Arc<Frame>)> = self
            .frames
            .read()
            .iter()
            .filter(|(_, frame)| frame.dirty.load(AtomicOrdering::Acquire))
            .map(|(id, frame)| (*id, Arc::clone(frame)))
            .collect();
        dirty.sort_by_key(|(id, _)| *id);
        for (id, frame) in &dirty {
            let buf = frame.buf.read();
            frame.dirty.store(false, AtomicOrdering::Release);
            io.write_at(block_offset(*id, self.block_size)?, &buf)?;
        }
        io.sync_all()?;
        self.counters
            .flushed
            .fetch_add(dirty.len() as u64, AtomicOrdering::Relaxed);
        debug!(slice = self.slice_num, blocks = dirty.len(), "cache.flush");
        Ok(dirty.len())
    }

    /// Current statistics.
    pub fn stats(&self) -> CacheStats {
        let frames = self.frames.read();
        CacheStats {
            blocks: frames.len() as u64,
            dirty_blocks: frames
                .values()
                .filter(|frame| frame.dirty.load(AtomicOrdering::Relaxed))
                .count() as u64,
            transactions: self.counters.transactions.load(AtomicOrdering::Relaxed),
            acquires: self.counters.acquires.load(AtomicOrdering::Relaxed),
            flushed: self.counters.flushed.load(AtomicOrdering::Relaxed),
        }
    }

    fn frame(&self, block: BlockId) -> Result<Arc<Frame>> {
        self.frames
            .read()
            .get(&block)
            .cloned()
            .ok_or(SliceError::Invalid("block id was never allocated"))
    }

    fn allocate_frame(&self) -> BlockId {
        let id = BlockId(self.next_block.fetch_add(1, AtomicOrdering::Relaxed));
        self.frames
            .write()
            .insert(id, Arc::new(Frame::zeroed(self.block_size)));
        id
    }
}

impl fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockCache")
            .field("slice_num", &self.slice_num)
            .field("block_size", &self.block_size)
            .field("backed", &self.io.is_some())
            .finish()
    }
}

fn load_blocks(
    io: &dyn FileIo,
    block_size: usize,
    frames: &mut FxHashMap<BlockId, Arc<Frame>>,
) -> Result<()> {
    let len = io.len()?;
    if len % block_size as u64 != 0 {
        error!(len, block_size, "cache.open.partial_block");
        return Err(SliceError::Corruption(format!(
            "backing file length {len} is not a multiple of block size {block_size}"
        )));
    }
    for i in 0..len / block_size as u64 {
        let id = BlockId(i);
        let mut buf = vec![0u8; block_size].into_boxed_slice();
        io.read_at(block_offset(id, block_size)?, &mut buf)?;
        frames.insert(id, Arc::new(Frame::from_bytes(buf, false)));
    }
    Ok(())
}
