use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Sink for slice-level operation counters.
///
/// Implementations must be cheap; every call happens on the operation path.
pub trait SliceMetrics: Send + Sync {
    /// Records a facade operation by name (`"get"`, `"range_get"`, ...).
    fn operation(&self, name: &'static str);

    /// Records a dispatched mutation by kind.
    fn mutation(&self, kind: &'static str);

    /// Records time an operation spent waiting at the ordering checkpoint.
    fn checkpoint_wait(&self, waited: Duration);

    /// Records one record streamed to a backfill callback.
    fn backfill_atom(&self);
}

/// Discards everything.
#[derive(Default)]
pub struct NoopMetrics;

impl SliceMetrics for NoopMetrics {
    fn operation(&self, _name: &'static str) {}
    fn mutation(&self, _kind: &'static str) {}
    fn checkpoint_wait(&self, _waited: Duration) {}
    fn backfill_atom(&self) {}
}

/// Atomic counters for every [`SliceMetrics`] event.
#[derive(Default)]
pub struct CounterMetrics {
    /// Point reads.
    pub gets: AtomicU64,
    /// Range reads.
    pub range_gets: AtomicU64,
    /// Mutations of any kind.
    pub changes: AtomicU64,
    /// Backfill runs.
    pub backfills: AtomicU64,
    /// Range erasures.
    pub delete_ranges: AtomicU64,
    /// Replication metadata reads and writes.
    pub metadata_ops: AtomicU64,
    /// Sets, adds, and replaces.
    pub sarc_mutations: AtomicU64,
    /// Deletes.
    pub delete_mutations: AtomicU64,
    /// Operations that blocked at the checkpoint.
    pub checkpoint_waits: AtomicU64,
    /// Total checkpoint wait in microseconds.
    pub checkpoint_wait_us: AtomicU64,
    /// Records streamed to backfill callbacks.
    pub backfill_atoms: AtomicU64,
}

impl SliceMetrics for CounterMetrics {
    fn operation(&self, name: &'static str) {
        let counter = match name {
            "get" => &self.gets,
            "range_get" => &self.range_gets,
            "change" => &self.changes,
            "backfill" => &self.backfills,
            "backfill_delete_range" => &self.delete_ranges,
            _ => &self.metadata_ops,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn mutation(&self, kind: &'static str) {
        match kind {
            "sarc" => {
                self.sarc_mutations.fetch_add(1, Ordering::Relaxed);
            }
            "delete" => {
                self.delete_mutations.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    fn checkpoint_wait(&self, waited: Duration) {
        if waited.is_zero() {
            return;
        }
        self.checkpoint_waits.fetch_add(1, Ordering::Relaxed);
        self.checkpoint_wait_us
            .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);
    }

    fn backfill_atom(&self) {
        self.backfill_atoms.fetch_add(1, Ordering::Relaxed);
    }
}

/// The metrics sink used when none is configured: [`NoopMetrics`].
pub fn default_metrics() -> Arc<dyn SliceMetrics> {
    Arc::new(NoopMetrics)
}
