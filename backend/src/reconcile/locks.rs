//! Per-key mutual exclusion.
//!
//! Create-or-find must run one at a time for the same provider identity or
//! the same `(machine key, user)` pair, while unrelated keys proceed in
//! parallel. Slots are created on demand and dropped once no caller holds or
//! waits on them.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug)]
pub struct KeyedLocks<K> {
    slots: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `key`.
    pub fn with_lock<R>(&self, key: &K, f: impl FnOnce() -> R) -> R {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.entry(key.clone()).or_default().clone()
        };
        // Dropped after `_guard` and before `slot`, on return or unwind.
        let _release = Release {
            slots: &self.slots,
            key,
        };

        // A panic inside `f` poisons only this slot's unit value.
        let _guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }

    /// Number of keys currently held or waited on.
    pub fn active(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Removes the slot for `key` once no other caller holds or waits on it.
struct Release<'a, K: Eq + Hash> {
    slots: &'a Mutex<HashMap<K, Arc<Mutex<()>>>>,
    key: &'a K,
}

impl<K: Eq + Hash> Drop for Release<'_, K> {
    fn drop(&mut self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one in `with_lock`: nobody else is waiting.
        if slots.get(self.key).is_some_and(|slot| Arc::strong_count(slot) == 2) {
            slots.remove(self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_slots_are_released() {
        let locks = KeyedLocks::new();
        let value = locks.with_lock(&"a".to_string(), || 7);
        assert_eq!(value, 7);
        assert_eq!(locks.active(), 0);
    }

    #[test]
    fn test_same_key_is_serialized() {
        let locks = Arc::new(KeyedLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                thread::spawn(move || {
                    locks.with_lock(&"same".to_string(), || {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(5));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    });
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active(), 0);
    }

    #[test]
    fn test_slot_released_when_closure_panics() {
        let locks = KeyedLocks::new();
        let key = "boom".to_string();

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            locks.with_lock(&key, || -> u32 { panic!("resolver failed") })
        }));
        assert!(outcome.is_err());
        assert_eq!(locks.active(), 0);

        // The key is usable again afterwards.
        assert_eq!(locks.with_lock(&key, || 3), 3);
        assert_eq!(locks.active(), 0);
    }

    #[test]
    fn test_different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let nested = locks.with_lock(&1u32, || locks.with_lock(&2u32, || "inner"));
        assert_eq!(nested, "inner");
    }
}
