//! Per-key sequencer: one FIFO queue and one drain lock per sender.
//!
//! Tasks submitted under the same [`SenderKey`] are processed strictly one at
//! a time, in submission order, by a single drain loop. Different keys drain
//! concurrently. The queue and lock registries live behind one mutex whose
//! critical sections never await, so:
//!
//! - `submit` appends the task and tries to take the lock in one step;
//! - the drain loop pops the next task, or (finding the queue empty) releases
//!   the lock and drops the queue, in one step.
//!
//! An enqueue racing with the end of a drain therefore either lands before
//! the emptiness check (the loop sees it) or after the release (the submitter
//! gets [`Admission::Drain`] and starts a new loop). Nothing is stranded.

mod drain;
pub mod registry;

pub use drain::{DrainReport, TaskProcessor};
pub use registry::{LockRegistry, QueueRegistry};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Stable identifier of a message originator. Compared by exact string
/// equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SenderKey(String);

impl SenderKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key for a user on a given transport: `"<channel>:<user_id>"`.
    pub fn for_channel_user(channel: &str, user_id: &str) -> Self {
        Self(format!("{channel}:{user_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SenderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SenderKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for SenderKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// What the submitter must do after [`Sequencer::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "Admission::Drain obliges the caller to run the drain loop"]
pub enum Admission {
    /// The caller now holds the key's lock and must run [`Sequencer::drain`].
    Drain,
    /// A drain loop is already active; it will reach this task.
    Queued {
        /// Queue length including the new task.
        pending: usize,
    },
}

/// Point-in-time view of one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeySnapshot {
    pub key: SenderKey,
    pub pending: usize,
    pub draining: bool,
}

/// Aggregate counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SequencerStats {
    /// Keys with a held lock.
    pub active_keys: usize,
    /// Keys with a queue entry.
    pub queued_keys: usize,
    /// Tasks waiting across all keys (excludes tasks being processed).
    pub pending_tasks: usize,
    /// Drain loops that ran to an empty queue and released their lock.
    pub completed_drains: u64,
}

struct Registries<T> {
    queues: QueueRegistry<T>,
    locks: LockRegistry,
}

/// Owns the queue and lock registries. Construct one per process (or per
/// test) and share it by `Arc`.
pub struct Sequencer<T> {
    inner: Mutex<Registries<T>>,
    completed_drains: AtomicU64,
}

impl<T> Sequencer<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Registries {
                queues: QueueRegistry::new(),
                locks: LockRegistry::new(),
            }),
            completed_drains: AtomicU64::new(0),
        }
    }

    fn registries(&self) -> MutexGuard<'_, Registries<T>> {
        // Critical sections only touch the maps, so a poisoned guard still
        // holds consistent data.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue `task` under `key` and try to take the key's lock, as one
    /// indivisible step.
    pub fn submit(&self, key: &SenderKey, task: T) -> Admission {
        let mut reg = self.registries();
        let pending = reg.queues.enqueue(key, task);
        if reg.locks.try_acquire(key) {
            if pending > 1 {
                warn!(
                    key = %key,
                    pending,
                    "Found queued tasks with no drain loop; adopting them"
                );
            }
            Admission::Drain
        } else {
            Admission::Queued { pending }
        }
    }

    /// Pop the next task for a lock holder. On an empty queue, releases the
    /// lock and removes the queue entry before returning `None`.
    fn take_next(&self, key: &SenderKey) -> Option<T> {
        let mut reg = self.registries();
        match reg.queues.pop_front(key) {
            Some(task) => Some(task),
            None => {
                reg.locks.release(key);
                reg.queues.remove(key);
                self.completed_drains.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Whether a drain loop currently holds `key`.
    pub fn is_draining(&self, key: &SenderKey) -> bool {
        self.registries().locks.is_held(key)
    }

    /// Tasks waiting for `key` (excludes the one being processed).
    pub fn pending(&self, key: &SenderKey) -> usize {
        self.registries().queues.len(key)
    }

    /// True when `key` has neither a queue entry nor a held lock.
    pub fn is_idle(&self, key: &SenderKey) -> bool {
        let reg = self.registries();
        !reg.queues.contains(key) && !reg.locks.is_held(key)
    }

    pub fn stats(&self) -> SequencerStats {
        let reg = self.registries();
        SequencerStats {
            active_keys: reg.locks.held_count(),
            queued_keys: reg.queues.key_count(),
            pending_tasks: reg.queues.total_pending(),
            completed_drains: self.completed_drains.load(Ordering::Relaxed),
        }
    }

    /// Snapshot of every key that has a queue entry, sorted by key.
    pub fn snapshot(&self) -> Vec<KeySnapshot> {
        let reg = self.registries();
        let mut keys: Vec<KeySnapshot> = reg
            .queues
            .keys()
            .map(|key| KeySnapshot {
                key: key.clone(),
                pending: reg.queues.len(key),
                draining: reg.locks.is_held(key),
            })
            .collect();
        keys.sort_by(|a, b| a.key.cmp(&b.key));
        keys
    }
}

impl<T> Default for Sequencer<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_key_for_channel_user() {
        let key = SenderKey::for_channel_user("telegram", "12345");
        assert_eq!(key.as_str(), "telegram:12345");
        assert_eq!(key.to_string(), "telegram:12345");
    }

    #[test]
    fn sender_key_serializes_as_plain_string() {
        let key = SenderKey::new("web:alice");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"web:alice\"");
    }

    #[test]
    fn first_submit_drains_later_ones_queue() {
        let seq = Sequencer::new();
        let key = SenderKey::new("u1");

        assert_eq!(seq.submit(&key, "a"), Admission::Drain);
        assert_eq!(seq.submit(&key, "b"), Admission::Queued { pending: 2 });
        assert_eq!(seq.submit(&key, "c"), Admission::Queued { pending: 3 });
        assert!(seq.is_draining(&key));
        assert_eq!(seq.pending(&key), 3);
    }

    #[test]
    fn take_next_releases_on_empty() {
        let seq = Sequencer::new();
        let key = SenderKey::new("u1");
        let _ = seq.submit(&key, 1);

        assert_eq!(seq.take_next(&key), Some(1));
        assert!(seq.is_draining(&key));
        assert!(!seq.is_idle(&key));

        assert_eq!(seq.take_next(&key), None);
        assert!(!seq.is_draining(&key));
        assert!(seq.is_idle(&key));
        assert_eq!(seq.stats().completed_drains, 1);
    }

    #[test]
    fn submit_after_release_starts_new_drain() {
        let seq = Sequencer::new();
        let key = SenderKey::new("u1");
        let _ = seq.submit(&key, 1);
        seq.take_next(&key);
        seq.take_next(&key);

        assert_eq!(seq.submit(&key, 2), Admission::Drain);
    }

    #[test]
    fn keys_do_not_share_locks() {
        let seq = Sequencer::new();
        assert_eq!(seq.submit(&SenderKey::new("u1"), 1), Admission::Drain);
        assert_eq!(seq.submit(&SenderKey::new("u2"), 2), Admission::Drain);

        let stats = seq.stats();
        assert_eq!(stats.active_keys, 2);
        assert_eq!(stats.queued_keys, 2);
        assert_eq!(stats.pending_tasks, 2);
    }

    #[test]
    fn snapshot_is_sorted_by_key() {
        let seq = Sequencer::new();
        let _ = seq.submit(&SenderKey::new("web:b"), ());
        let _ = seq.submit(&SenderKey::new("web:a"), ());
        let _ = seq.submit(&SenderKey::new("web:a"), ());

        let snap = seq.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].key.as_str(), "web:a");
        assert_eq!(snap[0].pending, 2);
        assert!(snap[0].draining);
        assert_eq!(snap[1].key.as_str(), "web:b");
    }
}
