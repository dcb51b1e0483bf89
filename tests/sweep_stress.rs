#![allow(clippy::unwrap_used, missing_docs)]

//! Cross-thread sweep correctness under sustained insert load.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rustc_hash::FxHashSet;

use peekfs::trace::tablet::TabletStore;

#[test]
fn disjoint_ranges_union_exactly() {
    let store = Arc::new(TabletStore::new());

    let mut workers = Vec::new();
    for begin in [0u64, 500] {
        let store = Arc::clone(&store);
        workers.push(std::thread::spawn(move || {
            let tablet = store.tablet_for_current_thread();
            for i in begin..begin + 500 {
                tablet.insert(i);
            }
        }));
    }
    for w in workers {
        w.join().expect("worker panicked");
    }

    let mut aggregated = FxHashSet::default();
    store.sweep(&mut aggregated);
    assert_eq!(aggregated.len(), 1000);
    for i in 0..1000u64 {
        assert!(aggregated.contains(&i), "missing item {i}");
    }
}

#[test]
fn concurrent_sweeps_neither_lose_nor_duplicate() {
    let concurrency = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(4) as u64;
    let n_threads = concurrency * 8;
    const PER_THREAD: u64 = 500;

    let store = Arc::new(TabletStore::new());
    let remaining = Arc::new(AtomicUsize::new(n_threads as usize));

    let mut workers = Vec::new();
    for t in 0..n_threads {
        let store = Arc::clone(&store);
        let remaining = Arc::clone(&remaining);
        workers.push(std::thread::spawn(move || {
            let tablet = store.tablet_for_current_thread();
            for i in t * PER_THREAD..(t + 1) * PER_THREAD {
                tablet.insert(i);
                if i % 100 == 0 {
                    std::thread::sleep(Duration::from_micros(20));
                }
            }
            remaining.fetch_sub(1, Ordering::Relaxed);
        }));
    }

    // Count every drained element across repeated sweeps; a duplicate would
    // inflate the total even if the final set looked right.
    let mut total_drained = 0usize;
    let mut aggregated = FxHashSet::default();
    while remaining.load(Ordering::Relaxed) > 0 {
        let mut round = FxHashSet::default();
        store.sweep(&mut round);
        total_drained += round.len();
        aggregated.extend(round);
        std::thread::sleep(Duration::from_micros(10));
    }
    for w in workers {
        w.join().expect("worker panicked");
    }
    let mut round = FxHashSet::default();
    store.sweep(&mut round);
    total_drained += round.len();
    aggregated.extend(round);

    let expected = (n_threads * PER_THREAD) as usize;
    assert_eq!(aggregated.len(), expected);
    assert_eq!(
        total_drained, expected,
        "every inode is drained by exactly one sweep"
    );
    for i in 0..n_threads * PER_THREAD {
        assert!(aggregated.contains(&i), "missing item {i}");
    }
}
