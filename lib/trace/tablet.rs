//! Per-thread accumulators for observed inode numbers.
//!
//! Inserts are the hot path (one per tracer frame per thread) and must not
//! contend: each logical thread owns its own tablet behind its own lock.
//! Draining is a cold, cooperative sweep serialized on a dedicated mutex.

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use rustc_hash::FxHashSet;

static NEXT_LOGICAL_THREAD_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static LOGICAL_THREAD_ID: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Dense process-wide ID for the calling thread, assigned on first use.
/// Slots of exited threads are not reused.
pub fn logical_thread_id() -> usize {
    LOGICAL_THREAD_ID.with(|id| match id.get() {
        Some(assigned) => assigned,
        None => {
            let assigned = NEXT_LOGICAL_THREAD_ID.fetch_add(1, Ordering::Relaxed);
            id.set(Some(assigned));
            assigned
        }
    })
}

/// One thread's set of observed inode numbers.
#[derive(Default)]
pub struct Tablet {
    data: Mutex<FxHashSet<u64>>,
}

impl Tablet {
    /// Add `ino` to this tablet. Returns true iff it was not already present.
    pub fn insert(&self, ino: u64) -> bool {
        self.lock().insert(ino)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, ino: u64) -> bool {
        self.lock().contains(&ino)
    }

    fn swap(&self, other: &mut FxHashSet<u64>) {
        std::mem::swap(&mut *self.lock(), other);
    }

    fn lock(&self) -> MutexGuard<'_, FxHashSet<u64>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Growable collection of tablets, one slot per logical thread ID.
///
/// A slot, once created, holds the same tablet for the life of the process;
/// only its *contents* are drained by sweeps.
#[derive(Default)]
pub struct TabletStore {
    slots: RwLock<Vec<Arc<Tablet>>>,
    sweep_serial: Mutex<()>,
}

impl TabletStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The tablet slotted at `index`, growing the slot vector if needed.
    pub fn at(&self, index: usize) -> Arc<Tablet> {
        {
            let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(tablet) = slots.get(index) {
                return Arc::clone(tablet);
            }
        }

        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        while slots.len() <= index {
            slots.push(Arc::new(Tablet::default()));
        }
        Arc::clone(&slots[index])
    }

    /// The calling thread's tablet.
    pub fn tablet_for_current_thread(&self) -> Arc<Tablet> {
        self.at(logical_thread_id())
    }

    /// Drain every tablet's current contents into `into`.
    ///
    /// An insert that happens-before the sweep takes its tablet's lock lands
    /// in this output; an insert racing that acquisition lands in this
    /// output or the next one, never both and never neither.
    pub fn sweep(&self, into: &mut FxHashSet<u64>) {
        let _serial = self
            .sweep_serial
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        // Size the scratch tablets before touching the store lock again, so
        // the lock-held phase is only swaps.
        let count = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        let mut scratch: Vec<FxHashSet<u64>> = Vec::new();
        scratch.resize_with(count, FxHashSet::default);

        {
            let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
            // The store may have grown since the count was read.
            scratch.resize_with(slots.len(), FxHashSet::default);
            for (tablet, empty) in slots.iter().zip(scratch.iter_mut()) {
                tablet.swap(empty);
            }
        }

        // The scratch tablets are unreachable by other threads now; merge
        // without locks and drop their storage as we go.
        for drained in scratch {
            into.extend(drained);
        }
    }
}
