use std::fmt;
use std::sync::Arc;

use crate::primitives::cache::EvictionPriority;

/// Cache account priority for backfill traffic; foreground work uses the
/// cache's default account.
pub const BACKFILL_CACHE_PRIORITY: i32 = 10;

/// Configuration options supplied when creating or opening a [`super::BtreeSlice`].
#[derive(Clone)]
pub struct SliceOptions {
    /// Priority of the cache account backfills are charged to.
    pub backfill_cache_priority: i32,
    /// Eviction priority handed to the tree root at startup.
    pub root_eviction_priority: EvictionPriority,
    /// Optional metrics collection implementation.
    pub metrics: Option<Arc<dyn super::metrics::SliceMetrics>>,
}

impl Default for SliceOptions {
    fn default() -> Self {
        Self {
            backfill_cache_priority: BACKFILL_CACHE_PRIORITY,
            root_eviction_priority: EvictionPriority::INITIAL_ROOT,
            metrics: None,
        }
    }
}

impl SliceOptions {
    /// Creates options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the backfill account priority.
    pub fn backfill_cache_priority(mut self, priority: i32) -> Self {
        self.backfill_cache_priority = priority;
        self
    }

    /// Sets the initial root eviction priority.
    pub fn root_eviction_priority(mut self, priority: EvictionPriority) -> Self {
        self.root_eviction_priority = priority;
        self
    }

    /// Sets the metrics collection implementation.
    pub fn metrics(mut self, metrics: Arc<dyn super::metrics::SliceMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

impl fmt::Debug for SliceOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SliceOptions")
            .field("backfill_cache_priority", &self.backfill_cache_priority)
            .field("root_eviction_priority", &self.root_eviction_priority)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}
