use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32};
use std::sync::Arc;

use crate::types::ReplTimestamp;

pub(crate) struct Frame {
    pub buf: Arc<RwLock<Box<[u8]>>>,
    pub recency: AtomicU32,
    pub eviction_priority: AtomicI32,
    pub dirty: AtomicBool,
}

impl Frame {
    pub fn zeroed(block_size: usize) -> Self {
        Self::from_bytes(vec![0u8; block_size].into_boxed_slice(), true)
    }

    pub fn from_bytes(bytes: Box<[u8]>, dirty: bool) -> Self {
        Self {
            buf: Arc::new(RwLock::new(bytes)),
            recency: AtomicU32::new(ReplTimestamp::DISTANT_PAST.0),
            eviction_priority: AtomicI32::new(0),
            dirty: AtomicBool::new(dirty),
        }
    }
}
