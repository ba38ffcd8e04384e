//! Keyed work queue with per-key retry backoff.
//!
//! A key is queued at most once while waiting. A key added while a worker
//! holds it is parked and requeued when the worker calls [`WorkQueue::done`],
//! so one key is never processed by two workers at the same time.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tracing::debug;

pub const MIN_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

#[derive(Default)]
struct Inner {
    queue: VecDeque<String>,
    dirty: FxHashSet<String>,
    processing: FxHashSet<String>,
    failures: FxHashMap<String, u32>,
    shutting_down: bool,
}

struct Shared {
    name: &'static str,
    inner: Mutex<Inner>,
    notify: Notify,
}

#[derive(Clone)]
pub struct WorkQueue {
    shared: Arc<Shared>,
}

/// Delay before the `failures`-th retry: doubling from the minimum, capped.
pub fn retry_delay(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    (MIN_RETRY_DELAY * 2u32.pow(exp)).min(MAX_RETRY_DELAY)
}

impl WorkQueue {
    pub fn new(name: &'static str) -> Self {
        Self { shared: Arc::new(Shared { name, inner: Mutex::new(Inner::default()), notify: Notify::new() }) }
    }

    pub fn name(&self) -> &'static str { self.shared.name }

    fn lock(&self) -> MutexGuard<'_, Inner> { self.shared.inner.lock().unwrap_or_else(|err| err.into_inner()) }

    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut inner = self.lock();
        if inner.shutting_down || inner.dirty.contains(&key) {
            return;
        }
        inner.dirty.insert(key.clone());
        if inner.processing.contains(&key) {
            return;
        }
        inner.queue.push_back(key);
        drop(inner);
        self.shared.notify.notify_one();
    }

    /// Re-add `key` after its backoff delay. Returns the delay.
    pub fn add_rate_limited(&self, key: &str) -> Duration {
        let failures = {
            let mut inner = self.lock();
            let n = inner.failures.entry(key.to_string()).or_insert(0);
            *n = n.saturating_add(1);
            *n
        };
        let delay = retry_delay(failures);
        counter!("kube_queue_retries_total", 1u64, "queue" => self.shared.name);
        debug!(queue = self.shared.name, key, failures, delay_ms = delay.as_millis() as u64, "requeue with backoff");
        let q = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            q.add(key);
        });
        delay
    }

    /// Clear the failure history of `key`.
    pub fn forget(&self, key: &str) { self.lock().failures.remove(key); }

    pub fn num_requeues(&self, key: &str) -> u32 { self.lock().failures.get(key).copied().unwrap_or(0) }

    /// Wait for the next key. `None` once the queue is shut down and empty.
    pub async fn next(&self) -> Option<String> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    return Some(key);
                }
                if inner.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Release a key returned by [`next`](Self::next).
    pub fn done(&self, key: &str) {
        let mut inner = self.lock();
        inner.processing.remove(key);
        if inner.dirty.contains(key) {
            inner.queue.push_back(key.to_string());
            drop(inner);
            self.shared.notify.notify_one();
        }
    }

    pub fn len(&self) -> usize { self.lock().queue.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.shared.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(retry_delay(1), Duration::from_secs(1));
        assert_eq!(retry_delay(2), Duration::from_secs(2));
        assert_eq!(retry_delay(5), Duration::from_secs(16));
        assert_eq!(retry_delay(9), Duration::from_secs(256));
        assert_eq!(retry_delay(10), MAX_RETRY_DELAY);
        assert_eq!(retry_delay(u32::MAX), MAX_RETRY_DELAY);
    }

    #[tokio::test]
    async fn waiting_keys_are_deduplicated() {
        let q = WorkQueue::new("test");
        q.add("a/x");
        q.add("a/y");
        q.add("a/x");
        assert_eq!(q.len(), 2);
        assert_eq!(q.next().await.as_deref(), Some("a/x"));
        assert_eq!(q.next().await.as_deref(), Some("a/y"));
    }

    #[tokio::test]
    async fn key_added_while_processing_comes_back_after_done() {
        let q = WorkQueue::new("test");
        q.add("k");
        let k = q.next().await.unwrap();
        q.add("k");
        assert!(q.is_empty());
        q.done(&k);
        assert_eq!(q.len(), 1);
        assert_eq!(q.next().await.as_deref(), Some("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_add_waits_for_backoff() {
        let q = WorkQueue::new("test");
        assert_eq!(q.add_rate_limited("k"), Duration::from_secs(1));
        assert_eq!(q.add_rate_limited("k"), Duration::from_secs(2));
        assert_eq!(q.num_requeues("k"), 2);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(q.is_empty());
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(q.len(), 1);
        q.forget("k");
        assert_eq!(q.num_requeues("k"), 0);
    }

    #[tokio::test]
    async fn shut_down_wakes_waiters() {
        let q = WorkQueue::new("test");
        let waiter = tokio::spawn({
            let q = q.clone();
            async move { q.next().await }
        });
        tokio::task::yield_now().await;
        q.shut_down();
        assert_eq!(waiter.await.unwrap(), None);
        q.add("late");
        assert!(q.is_empty());
    }
}
