//! Low-level primitives the slice layer is built from.
//!
//! Includes the versioned codec, ordering and scheduling controls, the block
//! cache, and positioned file I/O.

/// Versioned and fixed-format serialization.
pub mod archive;

/// Block cache, transactions, and buffer locks.
///
/// Provides the transaction interface the superblock manager and tree
/// algorithms run against.
pub mod cache;

/// Order tokens, checkpoints, sequence groups, and execution contexts.
pub mod concurrency;

/// Positioned file I/O for persisting cache blocks.
pub mod io;
