//! Work Queue
//!
//! Keyed work queue with per-item exponential backoff. A key is handed to
//! at most one worker at a time; re-adding a key while it is processed
//! defers it until [`TaskQueue::done`] is called.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

// =============================================================================
// Constants
// =============================================================================

pub const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
pub const BACKOFF_MAX: Duration = Duration::from_secs(60);

fn new_backoff() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(BACKOFF_INITIAL)
        .with_multiplier(2.0)
        .with_randomization_factor(0.0)
        .with_max_interval(BACKOFF_MAX)
        .with_max_elapsed_time(None)
        .build()
}

struct Retry {
    backoff: ExponentialBackoff,
    attempts: u32,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    queued: HashSet<String>,
    processing: HashSet<String>,
    dirty: HashSet<String>,
    retries: HashMap<String, Retry>,
    shutting_down: bool,
}

struct Inner {
    name: String,
    max_retries: u32,
    state: Mutex<QueueState>,
    notify: Notify,
}

/// Rate-limited keyed work queue
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

impl TaskQueue {
    /// `max_retries` of 0 retries forever
    pub fn new(name: impl Into<String>, max_retries: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                max_retries,
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Enqueue a key; duplicates collapse
    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return;
            }
            if state.processing.contains(&key) {
                state.dirty.insert(key);
                return;
            }
            if !state.queued.insert(key.clone()) {
                return;
            }
            state.queue.push_back(key);
        }
        self.inner.notify.notify_one();
    }

    /// Enqueue after the key's next backoff delay.
    ///
    /// Returns false when the retry budget is exhausted; the key is then
    /// forgotten and not enqueued.
    pub fn add_rate_limited(&self, key: impl Into<String>) -> bool {
        let key = key.into();
        let delay = {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return false;
            }
            let retry = state.retries.entry(key.clone()).or_insert_with(|| Retry {
                backoff: new_backoff(),
                attempts: 0,
            });
            if self.inner.max_retries > 0 && retry.attempts >= self.inner.max_retries {
                state.retries.remove(&key);
                warn!(
                    "Queue {}: dropping {} after {} retries",
                    self.inner.name, key, self.inner.max_retries
                );
                return false;
            }
            retry.attempts += 1;
            retry.backoff.next_backoff().unwrap_or(BACKOFF_MAX)
        };

        debug!("Queue {}: requeue {} in {:?}", self.inner.name, key, delay);
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
        true
    }

    /// Enqueue after a fixed delay
    pub fn add_after(&self, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Next key to process, or `None` once shut down and drained
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.inner.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark a key as processed; a key re-added meanwhile is requeued
    pub fn done(&self, key: &str) {
        let requeue = {
            let mut state = self.inner.state.lock();
            state.processing.remove(key);
            state.dirty.remove(key)
        };
        if requeue {
            self.add(key);
        }
    }

    /// Reset the key's backoff
    pub fn forget(&self, key: &str) {
        self.inner.state.lock().retries.remove(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.inner
            .state
            .lock()
            .retries
            .get(key)
            .map(|r| r.attempts)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting keys; `get` returns `None` once the queue drains
    pub fn shutdown(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicates_collapse() {
        let q = TaskQueue::new("test", 0);
        q.add("a");
        q.add("a");
        q.add("b");
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await.as_deref(), Some("b"));
    }

    #[test]
    fn test_get_waits_for_add() {
        let q = TaskQueue::new("test", 0);
        let mut get = tokio_test::task::spawn(q.get());
        tokio_test::assert_pending!(get.poll());
        q.add("a");
        assert!(get.is_woken());
        let key = tokio_test::assert_ready!(get.poll());
        assert_eq!(key.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_processing_key_deferred_until_done() {
        let q = TaskQueue::new("test", 0);
        q.add("a");
        let key = q.get().await.unwrap();
        q.add("a");
        assert!(q.is_empty());
        q.done(&key);
        assert_eq!(q.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_and_caps() {
        let q = TaskQueue::new("test", 0);
        let mut delays = Vec::new();
        for _ in 0..8 {
            let start = tokio::time::Instant::now();
            assert!(q.add_rate_limited("a"));
            let key = q.get().await.unwrap();
            delays.push(start.elapsed().as_secs());
            q.done(&key);
        }
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);

        q.forget("a");
        assert_eq!(q.num_requeues("a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_retries() {
        let q = TaskQueue::new("test", 2);
        assert!(q.add_rate_limited("a"));
        assert!(q.add_rate_limited("a"));
        assert!(!q.add_rate_limited("a"));
        assert_eq!(q.num_requeues("a"), 0);
    }

    #[tokio::test]
    async fn test_shutdown_drains() {
        let q = TaskQueue::new("test", 0);
        q.add("a");
        q.shutdown();
        q.add("b");
        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await, None);
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiter() {
        let q = TaskQueue::new("test", 0);
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.shutdown();
        assert_eq!(waiter.await.unwrap(), None);
    }
}
