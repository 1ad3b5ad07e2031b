//! Causal ordering of operations entering a slice.
//!
//! An [`OrderSource`] issues contiguous tokens; the [`OrderCheckpoint`] that
//! minted the source admits them strictly in issue order, blocking callers that
//! arrive early. Presenting a token out of sequence is a caller bug and panics.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

static NEXT_CHECKPOINT_ID: AtomicU64 = AtomicU64::new(1);

/// A position in one source's operation sequence.
///
/// Tokens only compare meaningfully against tokens of the same source.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct OrderToken {
    checkpoint: u64,
    source: u64,
    value: u64,
}

impl OrderToken {
    /// A token that every checkpoint lets through without ordering.
    ///
    /// Meant for maintenance paths and tests; operations carrying it race freely.
    pub const fn ignore() -> Self {
        Self {
            checkpoint: 0,
            source: 0,
            value: 0,
        }
    }

    /// Returns true for [`OrderToken::ignore`].
    pub const fn is_ignore(&self) -> bool {
        self.checkpoint == 0
    }

    /// Identifier of the issuing source.
    pub const fn source(&self) -> u64 {
        self.source
    }

    /// Sequence number within the source, starting at 1.
    pub const fn value(&self) -> u64 {
        self.value
    }
}

impl PartialOrd for OrderToken {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        if self.checkpoint != other.checkpoint || self.source != other.source {
            return None;
        }
        Some(self.value.cmp(&other.value))
    }
}

impl fmt::Debug for OrderToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ignore() {
            return f.write_str("OrderToken(ignore)");
        }
        write!(
            f,
            "OrderToken({}:{}#{})",
            self.checkpoint, self.source, self.value
        )
    }
}

/// Issues contiguous tokens for one logical source.
///
/// Dropping the source retires it: the checkpoint forgets the source once
/// every token it issued has been admitted and released.
pub struct OrderSource {
    inner: Arc<Inner>,
    source: u64,
    next: AtomicU64,
}

impl OrderSource {
    /// Issues the next token. Every issued token must eventually be checked
    /// through, or later tokens from this source wait forever.
    pub fn issue(&self) -> OrderToken {
        OrderToken {
            checkpoint: self.inner.id,
            source: self.source,
            value: self.next.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Identifier stamped into issued tokens.
    pub fn id(&self) -> u64 {
        self.source
    }
}

impl fmt::Debug for OrderSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderSource")
            .field("checkpoint", &self.inner.id)
            .field("source", &self.source)
            .field("next", &self.next.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for OrderSource {
    fn drop(&mut self) {
        let issued = self.next.load(Ordering::Relaxed) - 1;
        let mut sources = self.inner.sources.lock();
        if let Some(state) = sources.get_mut(&self.source) {
            state.retired_through = Some(issued);
            if state.is_settled() {
                sources.remove(&self.source);
            }
        }
        trace!(checkpoint = %self.inner.tag, source = self.source, issued, "checkpoint.source_retired");
    }
}

#[derive(Default, Debug)]
struct SourceState {
    last_admitted: u64,
    in_flight: bool,
    // Last token value issued, set once the source is dropped.
    retired_through: Option<u64>,
}

impl SourceState {
    fn is_settled(&self) -> bool {
        !self.in_flight
            && self
                .retired_through
                .is_some_and(|issued| self.last_admitted >= issued)
    }
}

struct Inner {
    id: u64,
    tag: String,
    next_source: AtomicU64,
    sources: Mutex<FxHashMap<u64, SourceState>>,
    admitted: Condvar,
}

/// Per-slice admission point for [`OrderToken`]s.
#[derive(Clone)]
pub struct OrderCheckpoint {
    inner: Arc<Inner>,
}

impl OrderCheckpoint {
    /// Creates a checkpoint; `tag` names it in logs and panics.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_CHECKPOINT_ID.fetch_add(1, Ordering::Relaxed),
                tag: tag.into(),
                next_source: AtomicU64::new(1),
                sources: Mutex::new(FxHashMap::default()),
                admitted: Condvar::new(),
            }),
        }
    }

    /// Name given at construction.
    pub fn tag(&self) -> &str {
        &self.inner.tag
    }

    /// Registers a new source whose tokens this checkpoint will accept.
    pub fn source(&self) -> OrderSource {
        let source = self.inner.next_source.fetch_add(1, Ordering::Relaxed);
        self.inner
            .sources
            .lock()
            .insert(source, SourceState::default());
        OrderSource {
            inner: Arc::clone(&self.inner),
            source,
            next: AtomicU64::new(1),
        }
    }

    /// Highest token value admitted so far for `source`.
    pub fn high_water(&self, source: u64) -> Option<u64> {
        self.inner
            .sources
            .lock()
            .get(&source)
            .map(|state| state.last_admitted)
    }

    /// Waits until `token` is next in its source's sequence and admits it.
    ///
    /// The next token from the same source stays blocked until the returned
    /// [`Admission`] is released or dropped.
    ///
    /// # Panics
    ///
    /// If the token was minted by another checkpoint, names an unknown source,
    /// or has already been admitted.
    pub fn enter(&self, token: OrderToken) -> Admission {
        if token.is_ignore() {
            return Admission {
                checkpoint: None,
                token,
                waited: Duration::ZERO,
            };
        }
        assert!(
            token.checkpoint == self.inner.id,
            "order token {token:?} presented to checkpoint `{}` ({})",
            self.inner.tag,
            self.inner.id
        );
        let started = Instant::now();
        let mut waited = false;
        let mut sources = self.inner.sources.lock();
        loop {
            let Some(state) = sources.get_mut(&token.source) else {
                panic!(
                    "order token {token:?} names a source unknown to checkpoint `{}`",
                    self.inner.tag
                );
            };
            assert!(
                token.value > state.last_admitted,
                "order token {token:?} regressed at checkpoint `{}` (last admitted {})",
                self.inner.tag,
                state.last_admitted
            );
            if state.last_admitted + 1 == token.value && !state.in_flight {
                state.last_admitted = token.value;
                state.in_flight = true;
                break;
            }
            if !waited {
                waited = true;
                trace!(
                    checkpoint = %self.inner.tag,
                    token = ?token,
                    last_admitted = state.last_admitted,
                    "checkpoint.wait"
                );
            }
            self.inner.admitted.wait(&mut sources);
        }
        drop(sources);
        let waited = if waited {
            let elapsed = started.elapsed();
            debug!(
                checkpoint = %self.inner.tag,
                token = ?token,
                waited_us = elapsed.as_micros() as u64,
                "checkpoint.admitted_after_wait"
            );
            elapsed
        } else {
            Duration::ZERO
        };
        Admission {
            checkpoint: Some(Arc::clone(&self.inner)),
            token,
            waited,
        }
    }

    /// Admits `token` and immediately lets its successor through.
    pub fn check_through(&self, token: OrderToken) -> OrderToken {
        self.enter(token).release()
    }
}

impl fmt::Debug for OrderCheckpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderCheckpoint")
            .field("id", &self.inner.id)
            .field("tag", &self.inner.tag)
            .finish()
    }
}

/// Proof that a token passed its checkpoint.
///
/// Holding it keeps the source's next token waiting; dropping it lets that
/// token in.
#[must_use = "dropping the admission immediately admits the next token"]
pub struct Admission {
    checkpoint: Option<Arc<Inner>>,
    token: OrderToken,
    waited: Duration,
}

impl Admission {
    /// The admitted token.
    pub fn token(&self) -> OrderToken {
        self.token
    }

    /// Time spent blocked before admission.
    pub fn waited(&self) -> Duration {
        self.waited
    }

    /// Releases the admission and returns the token.
    pub fn release(self) -> OrderToken {
        self.token
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        let Some(inner) = self.checkpoint.take() else {
            return;
        };
        let mut sources = inner.sources.lock();
        if let Some(state) = sources.get_mut(&self.token.source) {
            state.in_flight = false;
            if state.is_settled() {
                sources.remove(&self.token.source);
            }
        }
        drop(sources);
        inner.admitted.notify_all();
    }
}

impl fmt::Debug for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Admission")
            .field("token", &self.token)
            .field("waited", &self.waited)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn tokens_are_contiguous_per_source() {
        let checkpoint = OrderCheckpoint::new("t");
        let source = checkpoint.source();
        let a = source.issue();
        let b = source.issue();
        assert_eq!(a.value(), 1);
        assert_eq!(b.value(), 2);
        assert!(a < b);
        let other = checkpoint.source().issue();
        assert_eq!(a.partial_cmp(&other), None);
    }

    #[test]
    fn in_order_tokens_pass_without_waiting() {
        let checkpoint = OrderCheckpoint::new("t");
        let source = checkpoint.source();
        for _ in 0..3 {
            let admission = checkpoint.enter(source.issue());
            assert_eq!(admission.waited(), Duration::ZERO);
        }
        assert_eq!(checkpoint.high_water(source.id()), Some(3));
    }

    #[test]
    fn early_token_waits_for_predecessor() {
        let checkpoint = OrderCheckpoint::new("t");
        let source = checkpoint.source();
        let first = source.issue();
        let second = source.issue();
        let (tx, rx) = mpsc::channel();
        let cp = checkpoint.clone();
        let handle = thread::spawn(move || {
            let admitted = cp.check_through(second);
            tx.send(admitted.value()).unwrap();
        });
        thread::sleep(Duration::from_millis(20));
        assert!(rx.try_recv().is_err());
        checkpoint.check_through(first);
        assert_eq!(rx.recv().unwrap(), 2);
        handle.join().unwrap();
    }

    #[test]
    fn ignore_token_bypasses_ordering() {
        let checkpoint = OrderCheckpoint::new("t");
        let _held = checkpoint.enter(checkpoint.source().issue());
        let passed = checkpoint.check_through(OrderToken::ignore());
        assert!(passed.is_ignore());
    }

    #[test]
    fn dropped_sources_are_forgotten_once_drained() {
        let checkpoint = OrderCheckpoint::new("t");
        let idle = checkpoint.source();
        let idle_id = idle.id();
        assert_eq!(checkpoint.high_water(idle_id), Some(0));
        drop(idle);
        assert_eq!(checkpoint.high_water(idle_id), None);

        let source = checkpoint.source();
        let id = source.id();
        let first = source.issue();
        let second = source.issue();
        drop(source);
        assert_eq!(checkpoint.high_water(id), Some(0));
        checkpoint.check_through(first);
        assert_eq!(checkpoint.high_water(id), Some(1));
        let admission = checkpoint.enter(second);
        assert_eq!(checkpoint.high_water(id), Some(2));
        drop(admission);
        assert_eq!(checkpoint.high_water(id), None);
    }

    #[test]
    #[should_panic(expected = "regressed")]
    fn duplicate_token_panics() {
        let checkpoint = OrderCheckpoint::new("t");
        let source = checkpoint.source();
        let token = source.issue();
        checkpoint.check_through(token);
        checkpoint.check_through(token);
    }

    #[test]
    #[should_panic(expected = "presented to checkpoint")]
    fn foreign_token_panics() {
        let ours = OrderCheckpoint::new("ours");
        let theirs = OrderCheckpoint::new("theirs");
        ours.check_through(theirs.source().issue());
    }
}
