//! Lazily populated per-key state shared by the keyed limiters.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

/// Map from identity key to per-key state.
///
/// The map lock only guards insertion and iteration. Each state value is
/// handed out as an `Arc` and synchronizes itself (atomics or its own mutex),
/// so holding a state never blocks other keys.
///
/// Entries are never removed: a key observed once keeps its state for the
/// lifetime of the registry.
pub struct PerKeyRegistry<S> {
    entries: RwLock<HashMap<String, Arc<S>>>,
}

impl<S> PerKeyRegistry<S> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Get the state for `key`, creating it with `init` on first use.
    pub fn get_or_insert_with<F>(&self, key: &str, init: F) -> Arc<S>
    where
        F: FnOnce() -> S,
    {
        if let Some(state) = self.entries.read().get(key) {
            return Arc::clone(state);
        }

        let mut entries = self.entries.write();
        // Another caller may have inserted between the two locks
        let state = entries.entry(key.to_string()).or_insert_with(|| {
            debug!(key = %key, "Creating per-key state");
            Arc::new(init())
        });
        Arc::clone(state)
    }

    pub fn get(&self, key: &str) -> Option<Arc<S>> {
        self.entries.read().get(key).cloned()
    }

    /// Visit every state under a read lock.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&str, &S),
    {
        let entries = self.entries.read();
        for (key, state) in entries.iter() {
            f(key, state);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<S> Default for PerKeyRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_lazy_creation() {
        let registry: PerKeyRegistry<AtomicUsize> = PerKeyRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.get("a").is_none());

        registry.get_or_insert_with("a", || AtomicUsize::new(7));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("a").unwrap().load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_existing_state_is_reused() {
        let registry: PerKeyRegistry<AtomicUsize> = PerKeyRegistry::new();

        let first = registry.get_or_insert_with("a", || AtomicUsize::new(0));
        first.fetch_add(1, Ordering::SeqCst);
        let second = registry.get_or_insert_with("a", || AtomicUsize::new(100));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_insert_creates_one_state() {
        let registry: Arc<PerKeyRegistry<AtomicUsize>> = Arc::new(PerKeyRegistry::new());
        let inits = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let inits = Arc::clone(&inits);
                thread::spawn(move || {
                    registry
                        .get_or_insert_with("shared", || {
                            inits.fetch_add(1, Ordering::SeqCst);
                            AtomicUsize::new(0)
                        })
                        .fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(inits.load(Ordering::SeqCst), 1);
        assert_eq!(registry.get("shared").unwrap().load(Ordering::SeqCst), 16);
    }

    #[test]
    fn test_for_each_visits_all() {
        let registry: PerKeyRegistry<AtomicUsize> = PerKeyRegistry::new();
        for key in ["a", "b", "c"] {
            registry.get_or_insert_with(key, || AtomicUsize::new(1));
        }

        let mut total = 0;
        registry.for_each(|_, state| total += state.load(Ordering::SeqCst));
        assert_eq!(total, 3);
    }
}
