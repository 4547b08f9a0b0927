//! Deduplicating, per-key serialized work queue

use crate::store::ObjectKey;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Exponential backoff: `base * factor^attempt`, capped at `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub factor: u32,
    pub max: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            factor: 2,
            max: Duration::from_secs(1000),
        }
    }
}

impl ExponentialBackoff {
    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        self.factor
            .checked_pow(attempt)
            .and_then(|multiplier| self.base.checked_mul(multiplier))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    /// Keys waiting for a worker, in arrival order
    queue: VecDeque<ObjectKey>,
    /// Keys that need processing (queued, or re-added while processing)
    dirty: HashSet<ObjectKey>,
    /// Keys currently held by a worker
    processing: HashSet<ObjectKey>,
    /// Consecutive failures per key
    failures: HashMap<ObjectKey, u32>,
}

/// Work queue feeding the reconcile workers.
///
/// A key is queued at most once. A key handed to a worker is not handed to
/// another until [`WorkQueue::done`] is called; adds in between are collapsed
/// and the key is queued again on `done`.
#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    backoff: ExponentialBackoff,
    shutdown: CancellationToken,
}

impl WorkQueue {
    pub fn new(backoff: ExponentialBackoff, shutdown: CancellationToken) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            backoff,
            shutdown,
        }
    }

    /// Enqueue `key` unless it is already pending
    pub fn add(&self, key: ObjectKey) {
        if self.shutdown.is_cancelled() {
            return;
        }
        {
            let mut state = self.state.lock();
            if !state.dirty.insert(key.clone()) {
                return;
            }
            if state.processing.contains(&key) {
                return;
            }
            state.queue.push_back(key);
        }
        self.notify.notify_one();
    }

    /// Enqueue `key` once `delay` has elapsed
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = queue.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(key),
            }
        });
    }

    /// Wait for the next key. Returns `None` once shutdown was requested.
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }
            {
                let mut state = self.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.queue.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }

    /// Release `key` after processing; requeues it if it was added meanwhile
    pub fn done(&self, key: &ObjectKey) {
        let requeued = {
            let mut state = self.state.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) {
                state.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Record a failure of `key` and return the delay before its retry
    pub fn backoff(&self, key: &ObjectKey) -> Duration {
        let mut state = self.state.lock();
        let failures = state.failures.entry(key.clone()).or_insert(0);
        let delay = self.backoff.delay(*failures);
        *failures = failures.saturating_add(1);
        delay
    }

    /// Reset the failure count of `key`
    pub fn forget(&self, key: &ObjectKey) {
        self.state.lock().failures.remove(key);
    }

    /// Consecutive failures recorded for `key`
    pub fn failures(&self, key: &ObjectKey) -> u32 {
        self.state.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Number of keys waiting for a worker
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
