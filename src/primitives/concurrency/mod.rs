#![forbid(unsafe_code)]
//! Ordering and scheduling primitives.
//!
//! - [`OrderCheckpoint`] admits [`OrderToken`]s from a source in issue order.
//! - [`SequenceGroup`] queues cache transactions per shard lane.
//! - [`ExecutionContext`] is the worker a shard's metadata operations run on.

mod home;
mod order;
mod sequence;

pub use home::ExecutionContext;
pub use order::{Admission, OrderCheckpoint, OrderSource, OrderToken};
pub use sequence::{LaneTicket, SequenceGroup};
