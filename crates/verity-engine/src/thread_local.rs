//! Per-thread result delegates
//!
//! Each pool thread writes into its own slot, keyed by the rayon thread
//! index, so no two threads ever mutate the same structure during the
//! parallel phase. Slots are folded into the shared results only during the
//! single-threaded merge step.

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Identity of the thread that owns a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WorkerKey {
    /// The thread that owns the execution context (sequential phase)
    Caller,
    /// A pool worker thread
    Pool(usize),
}

impl WorkerKey {
    /// Key of the calling thread
    pub fn current() -> Self {
        match rayon::current_thread_index() {
            Some(index) => WorkerKey::Pool(index),
            None => WorkerKey::Caller,
        }
    }
}

/// Map from worker identity to a lazily created value
pub struct ThreadLocalStore<T> {
    slots: RwLock<BTreeMap<WorkerKey, Arc<Mutex<T>>>>,
}

impl<T: Default> ThreadLocalStore<T> {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create the slot for `key` if it does not exist yet
    pub fn register(&self, key: WorkerKey) {
        self.slot(key);
    }

    fn slot(&self, key: WorkerKey) -> Arc<Mutex<T>> {
        if let Some(slot) = self.slots.read().get(&key) {
            return Arc::clone(slot);
        }
        Arc::clone(self.slots.write().entry(key).or_default())
    }

    /// Run `f` with exclusive access to the slot for `key`
    ///
    /// Only the owning thread uses a pool slot, so the lock is uncontended.
    pub fn with<R>(&self, key: WorkerKey, f: impl FnOnce(&mut T) -> R) -> R {
        let slot = self.slot(key);
        let mut guard = slot.lock();
        f(&mut guard)
    }

    /// Keys with a slot, in key order
    pub fn keys(&self) -> Vec<WorkerKey> {
        self.slots.read().keys().copied().collect()
    }

    /// Take every slot's value, leaving fresh defaults behind
    ///
    /// Values come out in key order, which keeps merges deterministic for a
    /// given pool layout.
    pub fn drain(&self) -> Vec<(WorkerKey, T)> {
        self.slots
            .read()
            .iter()
            .map(|(key, slot)| (*key, std::mem::take(&mut *slot.lock())))
            .collect()
    }

    /// Drop every slot
    pub fn clear(&self) {
        self.slots.write().clear();
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }
}

impl<T: Default> Default for ThreadLocalStore<T> {
    fn default() -> Self {
        Self::new()
    }
}
