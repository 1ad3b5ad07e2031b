//! Shard storage: superblock, mutation model, tree algorithms, and the slice
//! facade that ties them to the cache and ordering primitives.

/// Contract between the slice and its tree algorithms.
pub mod algorithms;

/// Mutation routing.
pub mod dispatch;

/// Single-leaf reference tree.
pub mod leaf;

/// Mutation requests and results.
pub mod mutation;

/// Root metadata block of a shard.
pub mod superblock;

mod metrics;
mod options;
mod slice;

pub use algorithms::{BTreeAlgorithms, BackfillAtom, BackfillCallback, KeyTester, KeyValuePair};
pub use leaf::{LeafTree, MAX_VALUE_SIZE};
pub use metrics::{default_metrics, CounterMetrics, NoopMetrics, SliceMetrics};
pub use mutation::{
    AddPolicy, AppendPrependKind, AppendPrependMutation, AppendPrependResult, CasTime,
    DeleteMutation, DeleteResult, GetCasMutation, GetResult, IncrDecrKind, IncrDecrMutation,
    IncrDecrResult, Mutation, MutationResult, ReplacePolicy, SarcMutation, SetResult,
};
pub use options::{SliceOptions, BACKFILL_CACHE_PRIORITY};
pub use slice::BtreeSlice;
pub use superblock::{GotSuperblock, SUPERBLOCK_ID, SUPERBLOCK_MAGIC};
