#![forbid(unsafe_code)]
//! Identifiers, timestamps, keys, and the crate-wide error type.

use std::fmt;

use crate::config::ConfigError;
use crate::primitives::archive::ArchiveError;

mod checksum;
mod key;
mod timestamp;

pub use checksum::block_crc32;
pub use key::{Bound, KeyRange, StoreKey, MAX_KEY_SIZE};
pub use timestamp::ReplTimestamp;

/// Identifier of a block inside a [`crate::primitives::cache::BlockCache`].
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct BlockId(pub u64);

impl BlockId {
    /// Sentinel meaning "no block", used for the root of an empty tree.
    pub const NULL: BlockId = BlockId(u64::MAX);

    /// Returns true when this id is the [`BlockId::NULL`] sentinel.
    pub const fn is_null(self) -> bool {
        self.0 == u64::MAX
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("null")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Errors surfaced by the slice layer.
///
/// Ordering violations are not represented here: they indicate a caller bug
/// and abort the offending operation with a panic.
#[derive(thiserror::Error, Debug)]
pub enum SliceError {
    /// Underlying file I/O failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Persisted state failed validation and needs operator attention.
    #[error("corruption: {0}")]
    Corruption(String),
    /// The caller supplied an argument the engine cannot act on.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// A versioned payload failed to decode.
    #[error("archive: {0}")]
    Archive(#[from] ArchiveError),
    /// Engine configuration could not be loaded.
    #[error("config: {0}")]
    Config(#[from] ConfigError),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SliceError>;
