//! Per-key mutexes for read-modify-write sequences against storage.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};

type SlotGuard = ArcMutexGuard<RawMutex, ()>;

/// Mutexes created on demand per key and reclaimed when idle.
#[derive(Debug, Default)]
pub(crate) struct KeyedLocks {
    slots: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    /// Block until `key` is free, then hold it until the guard drops.
    pub(crate) fn lock(&self, key: &str) -> KeyGuard<'_> {
        let slot = {
            let mut slots = self.slots.lock();
            Arc::clone(slots.entry(key.to_string()).or_default())
        };
        KeyGuard {
            owner: self,
            key: key.to_string(),
            guard: Some(Mutex::lock_arc(&slot)),
        }
    }

    /// Keys currently held or waited on.
    pub(crate) fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

pub(crate) struct KeyGuard<'a> {
    owner: &'a KeyedLocks,
    key: String,
    guard: Option<SlotGuard>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut slots = self.owner.slots.lock();
        // Only the map still holds the slot: nobody is waiting on it.
        let idle = slots
            .get(&self.key)
            .is_some_and(|slot| Arc::strong_count(slot) == 1);
        if idle {
            slots.remove(&self.key);
        }
    }
}
