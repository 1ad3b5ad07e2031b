//! FIFO lanes for cache transactions.
//!
//! A [`SequenceGroup`] has one lane per shard. A transaction takes a ticket on
//! its shard's lane when it begins and may not acquire its first block until
//! every earlier ticket on that lane has either acquired one or ended.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::types::{Result, SliceError};

#[derive(Default, Debug)]
struct LaneState {
    next_ticket: u64,
    now_serving: u64,
    // Tickets that finished before their turn came.
    abandoned: BTreeSet<u64>,
}

impl LaneState {
    fn finish(&mut self, ticket: u64) {
        if self.now_serving == ticket {
            self.now_serving += 1;
            while self.abandoned.remove(&self.now_serving) {
                self.now_serving += 1;
            }
        } else {
            self.abandoned.insert(ticket);
        }
    }
}

struct Inner {
    lanes: Mutex<Vec<LaneState>>,
    turn: Condvar,
}

/// Per-shard FIFO lanes shared by the transactions of a set of shards.
#[derive(Clone)]
pub struct SequenceGroup {
    inner: Arc<Inner>,
}

impl SequenceGroup {
    /// Creates a group with `lane_count` lanes (at least one).
    pub fn new(lane_count: usize) -> Self {
        let lanes = (0..lane_count.max(1)).map(|_| LaneState::default()).collect();
        Self {
            inner: Arc::new(Inner {
                lanes: Mutex::new(lanes),
                turn: Condvar::new(),
            }),
        }
    }

    /// A group sized for shards `0..=slice_num`.
    pub fn for_slice(slice_num: usize) -> Self {
        Self::new(slice_num + 1)
    }

    /// Number of lanes.
    pub fn lane_count(&self) -> usize {
        self.inner.lanes.lock().len()
    }

    /// Takes the next ticket on `lane`.
    pub fn take_ticket(&self, lane: usize) -> Result<LaneTicket> {
        let mut lanes = self.inner.lanes.lock();
        let state = lanes
            .get_mut(lane)
            .ok_or(SliceError::Invalid("sequence group lane out of range"))?;
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        Ok(LaneTicket {
            group: Arc::clone(&self.inner),
            lane,
            ticket,
            done: false,
        })
    }
}

impl fmt::Debug for SequenceGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequenceGroup")
            .field("lanes", &self.lane_count())
            .finish()
    }
}

/// A place in one lane's queue.
pub struct LaneTicket {
    group: Arc<Inner>,
    lane: usize,
    ticket: u64,
    done: bool,
}

impl LaneTicket {
    /// Lane this ticket belongs to.
    pub fn lane(&self) -> usize {
        self.lane
    }

    /// Position within the lane.
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Returns true once [`LaneTicket::finish`] ran.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Blocks until every earlier ticket on the lane has finished.
    pub fn wait_turn(&self) {
        if self.done {
            return;
        }
        let mut lanes = self.group.lanes.lock();
        while lanes[self.lane].now_serving != self.ticket {
            self.group.turn.wait(&mut lanes);
        }
    }

    /// Gives up the ticket's turn, letting the next ticket proceed.
    pub fn finish(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.group.lanes.lock()[self.lane].finish(self.ticket);
        self.group.turn.notify_all();
    }
}

impl Drop for LaneTicket {
    fn drop(&mut self) {
        self.finish();
    }
}

impl fmt::Debug for LaneTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaneTicket")
            .field("lane", &self.lane)
            .field("ticket", &self.ticket)
            .field("done", &self.done)
            .finish()
    }
}
