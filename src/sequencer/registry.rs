//! Per-key queue and lock registries.
//!
//! Neither registry synchronises on its own; the [`Sequencer`](super::Sequencer)
//! owns both behind a single mutex so that "enqueue + acquire" and
//! "empty-check + release + remove" are each one indivisible step.

use std::collections::{HashMap, HashSet, VecDeque};

use super::SenderKey;

/// FIFO task queues keyed by sender.
#[derive(Debug)]
pub struct QueueRegistry<T> {
    queues: HashMap<SenderKey, VecDeque<T>>,
}

impl<T> QueueRegistry<T> {
    pub fn new() -> Self {
        Self {
            queues: HashMap::new(),
        }
    }

    /// Append a task, creating the queue if absent. Returns the new length.
    pub fn enqueue(&mut self, key: &SenderKey, task: T) -> usize {
        let queue = self.queues.entry(key.clone()).or_default();
        queue.push_back(task);
        queue.len()
    }

    pub fn peek_front(&self, key: &SenderKey) -> Option<&T> {
        self.queues.get(key).and_then(|q| q.front())
    }

    /// Remove the head task. Empty or absent queues yield `None`.
    pub fn pop_front(&mut self, key: &SenderKey) -> Option<T> {
        self.queues.get_mut(key).and_then(|q| q.pop_front())
    }

    /// True when the queue is absent or has no tasks.
    pub fn is_empty(&self, key: &SenderKey) -> bool {
        self.queues.get(key).is_none_or(|q| q.is_empty())
    }

    pub fn len(&self, key: &SenderKey) -> usize {
        self.queues.get(key).map_or(0, |q| q.len())
    }

    /// Drop the registry entry for `key` entirely.
    pub fn remove(&mut self, key: &SenderKey) {
        self.queues.remove(key);
    }

    pub fn contains(&self, key: &SenderKey) -> bool {
        self.queues.contains_key(key)
    }

    /// Number of keys with a registry entry.
    pub fn key_count(&self) -> usize {
        self.queues.len()
    }

    /// Total tasks waiting across all keys.
    pub fn total_pending(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn keys(&self) -> impl Iterator<Item = &SenderKey> {
        self.queues.keys()
    }
}

impl<T> Default for QueueRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Held locks, one per key with an active drain loop. Presence means held.
#[derive(Debug, Default)]
pub struct LockRegistry {
    held: HashSet<SenderKey>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `key`. Returns `false`, changing nothing, if it is
    /// already held.
    pub fn try_acquire(&mut self, key: &SenderKey) -> bool {
        if self.held.contains(key) {
            return false;
        }
        self.held.insert(key.clone());
        true
    }

    /// Remove the lock entry. Releasing an unheld key is a no-op.
    pub fn release(&mut self, key: &SenderKey) {
        self.held.remove(key);
    }

    pub fn is_held(&self, key: &SenderKey) -> bool {
        self.held.contains(key)
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> SenderKey {
        SenderKey::new(s)
    }

    #[test]
    fn enqueue_reports_new_length() {
        let mut queues = QueueRegistry::new();
        assert_eq!(queues.enqueue(&key("u1"), "a"), 1);
        assert_eq!(queues.enqueue(&key("u1"), "b"), 2);
        assert_eq!(queues.enqueue(&key("u2"), "x"), 1);
        assert_eq!(queues.key_count(), 2);
        assert_eq!(queues.total_pending(), 3);
    }

    #[test]
    fn pop_front_is_fifo() {
        let mut queues = QueueRegistry::new();
        let k = key("u1");
        queues.enqueue(&k, 1);
        queues.enqueue(&k, 2);
        queues.enqueue(&k, 3);

        assert_eq!(queues.peek_front(&k), Some(&1));
        assert_eq!(queues.pop_front(&k), Some(1));
        assert_eq!(queues.pop_front(&k), Some(2));
        assert_eq!(queues.pop_front(&k), Some(3));
        assert_eq!(queues.pop_front(&k), None);
    }

    #[test]
    fn pop_front_on_absent_queue_is_noop() {
        let mut queues: QueueRegistry<u32> = QueueRegistry::new();
        assert_eq!(queues.pop_front(&key("nobody")), None);
        assert!(!queues.contains(&key("nobody")));
    }

    #[test]
    fn is_empty_covers_absent_and_drained() {
        let mut queues = QueueRegistry::new();
        let k = key("u1");
        assert!(queues.is_empty(&k));

        queues.enqueue(&k, "a");
        assert!(!queues.is_empty(&k));

        queues.pop_front(&k);
        assert!(queues.is_empty(&k));
        // Drained but still registered until the drain loop removes it.
        assert!(queues.contains(&k));

        queues.remove(&k);
        assert!(!queues.contains(&k));
        assert!(queues.is_empty(&k));
    }

    #[test]
    fn keys_are_compared_exactly() {
        let mut queues = QueueRegistry::new();
        queues.enqueue(&key("telegram:42"), "a");
        assert!(queues.is_empty(&key("telegram:042")));
        assert!(queues.is_empty(&key("Telegram:42")));
    }

    #[test]
    fn try_acquire_is_exclusive() {
        let mut locks = LockRegistry::new();
        let k = key("u1");
        assert!(locks.try_acquire(&k));
        assert!(!locks.try_acquire(&k));
        assert!(locks.is_held(&k));
        assert_eq!(locks.held_count(), 1);

        locks.release(&k);
        assert!(!locks.is_held(&k));
        assert!(locks.try_acquire(&k));
    }

    #[test]
    fn release_unheld_is_noop() {
        let mut locks = LockRegistry::new();
        locks.release(&key("ghost"));
        locks.release(&key("ghost"));
        assert_eq!(locks.held_count(), 0);
    }

    #[test]
    fn locks_are_independent_per_key() {
        let mut locks = LockRegistry::new();
        assert!(locks.try_acquire(&key("u1")));
        assert!(locks.try_acquire(&key("u2")));
        locks.release(&key("u1"));
        assert!(locks.is_held(&key("u2")));
    }
}
