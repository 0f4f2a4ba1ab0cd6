use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

struct Pending<V> {
    value: V,
    deadline: Instant,
}

/// Per-key debounce queue
///
/// Each key holds only its latest pending value. Every update pushes the key's
/// deadline out by the coalescing window, so a burst of updates is released
/// once, after the burst goes quiet.
pub struct CoalescingQueue<K, V> {
    window: Duration,
    pending: HashMap<K, Pending<V>>,
}

impl<K: Eq + Hash + Clone, V> CoalescingQueue<K, V> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    /// Derive the new pending value from the previous one, resetting the deadline
    pub fn upsert_with(&mut self, key: K, now: Instant, f: impl FnOnce(Option<V>) -> V) {
        let previous = self.pending.remove(&key).map(|p| p.value);
        self.pending.insert(
            key,
            Pending {
                value: f(previous),
                deadline: now + self.window,
            },
        );
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.pending.get(key).map(|p| &p.value)
    }

    /// Remove and return every entry whose deadline has passed
    pub fn take_due(&mut self, now: Instant) -> Vec<(K, V)> {
        let due: Vec<K> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(k, _)| k.clone())
            .collect();

        due.into_iter()
            .filter_map(|k| self.pending.remove(&k).map(|p| (k, p.value)))
            .collect()
    }

    /// Remove and return every entry regardless of deadline
    pub fn take_all(&mut self) -> Vec<(K, V)> {
        self.pending.drain().map(|(k, p)| (k, p.value)).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
