//! Per-shard control layer for a B-tree key-value store.
//!
//! A [`storage::BtreeSlice`] fronts one shard: it orders incoming requests
//! through an order checkpoint, runs them inside block-cache transactions
//! against the shard's superblock, and hands the actual tree work to a
//! [`storage::BTreeAlgorithms`] implementation.

#![warn(missing_docs)]

pub mod config;
pub mod primitives;
pub mod storage;
pub mod types;
