//! Rendezvous between proposers and the apply task.
//!
//! A proposer registers a key before submitting its entry; the apply task
//! triggers the key when the entry is applied. Triggering a key nobody waits
//! for (a duplicate, or an entry proposed by another member) is a no-op.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use tokio::sync::oneshot;

pub struct WaitRegistry<K, V> {
    pending: Mutex<HashMap<K, oneshot::Sender<V>>>,
}

impl<K: Eq + Hash, V> WaitRegistry<K, V> {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Start waiting for `key`. A second registration replaces the first,
    /// whose receiver then resolves with an error.
    pub fn register(&self, key: K) -> oneshot::Receiver<V> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(key, tx);
        rx
    }

    /// Resolve `key`. Returns whether someone was waiting.
    pub fn trigger(&self, key: &K, value: V) -> bool {
        match self.pending.lock().remove(key) {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    pub fn cancel(&self, key: &K) {
        self.pending.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash, V> Default for WaitRegistry<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_resolves_registered_waiter() {
        let w: WaitRegistry<u64, &str> = WaitRegistry::new();
        let rx = w.register(7);
        assert!(!w.trigger(&8, "other"));
        assert!(w.trigger(&7, "done"));
        assert_eq!(rx.await.unwrap(), "done");
        assert!(w.is_empty());
    }

    #[tokio::test]
    async fn cancelled_waiter_sees_closed_channel() {
        let w: WaitRegistry<u64, ()> = WaitRegistry::new();
        let rx = w.register(1);
        w.cancel(&1);
        assert!(rx.await.is_err());
    }
}
