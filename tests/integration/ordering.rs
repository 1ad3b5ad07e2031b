#![allow(missing_docs)]

use std::sync::{Arc, Barrier, Once};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;
use slicestore::{
    primitives::cache::BlockCache,
    primitives::concurrency::{OrderCheckpoint, OrderToken, SequenceGroup},
    storage::{BtreeSlice, CasTime, Mutation, SliceOptions},
    types::{ReplTimestamp, Result, StoreKey},
};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .try_init();
    });
}

#[test]
fn concurrent_tokens_are_admitted_in_issue_order() {
    init_tracing();
    let checkpoint = OrderCheckpoint::new("ordering");
    let source = checkpoint.source();
    let mut rng = rand::thread_rng();
    for _ in 0..20 {
        let mut tokens: Vec<(usize, _)> = (0..3).map(|i| (i, source.issue())).collect();
        tokens.shuffle(&mut rng);
        let admitted = Arc::new(Mutex::new(Vec::new()));
        let barrier = Arc::new(Barrier::new(tokens.len()));
        let handles: Vec<_> = tokens
            .into_iter()
            .map(|(position, token)| {
                let checkpoint = checkpoint.clone();
                let admitted = Arc::clone(&admitted);
                let barrier = Arc::clone(&barrier);
                let jitter = Duration::from_micros(rng.gen_range(0..500));
                thread::spawn(move || {
                    barrier.wait();
                    thread::sleep(jitter);
                    let admission = checkpoint.enter(token);
                    admitted.lock().push(position);
                    drop(admission);
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker");
        }
        assert_eq!(*admitted.lock(), vec![0, 1, 2]);
    }
}

#[test]
fn slice_writes_land_in_token_order() -> Result<()> {
    init_tracing();
    let cache = Arc::new(BlockCache::in_memory()?);
    BtreeSlice::create_universe(&cache)?;
    let slice = Arc::new(BtreeSlice::open(Arc::clone(&cache), SliceOptions::default())?);
    let seq = SequenceGroup::for_slice(cache.slice_num());
    let source = slice.order_source();
    let key = StoreKey::new("k")?;
    slice.change(&Mutation::set(key.clone(), ""), CasTime::new(0, ReplTimestamp(0)), &seq, OrderToken::ignore())?;

    let mut writes: Vec<(u32, _)> = (1..=8).map(|n| (n, source.issue())).collect();
    writes.shuffle(&mut rand::thread_rng());
    let barrier = Arc::new(Barrier::new(writes.len()));
    let handles: Vec<_> = writes
        .into_iter()
        .map(|(n, token)| {
            let slice = Arc::clone(&slice);
            let seq = seq.clone();
            let key = key.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mutation = Mutation::append(key, n.to_string());
                slice.change(&mutation, CasTime::new(u64::from(n), ReplTimestamp(n)), &seq, token)
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer")?;
    }

    let got = slice.get(&key, &seq, source.issue())?;
    assert_eq!(got.value.as_deref(), Some(&b"12345678"[..]));
    Ok(())
}

#[test]
#[should_panic(expected = "presented to checkpoint")]
fn token_from_another_checkpoint_panics() {
    let ours = OrderCheckpoint::new("ours");
    let theirs = OrderCheckpoint::new("theirs");
    let token = theirs.source().issue();
    let _ = ours.enter(token);
}

#[test]
#[should_panic(expected = "regressed")]
fn replayed_token_panics() {
    let checkpoint = OrderCheckpoint::new("replay");
    let source = checkpoint.source();
    let token = source.issue();
    checkpoint.check_through(token);
    checkpoint.check_through(token);
}
