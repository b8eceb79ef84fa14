//! Keyed work queue.
//!
//! - A key waiting in the queue is stored once, however often it is added.
//! - A key handed to a worker is not handed out again until [`WorkQueue::done`];
//!   adds that arrive meanwhile are replayed at that point.
//! - Failures back off per key, `base * 2^(failures - 1)` capped at `max`,
//!   until [`WorkQueue::forget`] resets the count.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    /// Keys that need a pass: queued, or re-added while in flight.
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shut_down: bool,
}

pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl WorkQueue {
    pub fn new(backoff_base: Duration, backoff_max: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            backoff_base,
            backoff_max,
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // The state stays consistent across a panic in another holder.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, key: &str) {
        let mut state = self.lock();
        if state.shut_down || !state.dirty.insert(key.to_string()) {
            return;
        }
        if state.processing.contains(key) {
            return;
        }
        state.queue.push_back(key.to_string());
        drop(state);
        self.notify.notify_one();
    }

    /// Add `key` once `delay` has passed.
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Record a failure for `key` and add it back after its backoff.
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) -> Duration {
        let failures = {
            let mut state = self.lock();
            let n = state.failures.entry(key.to_string()).or_insert(0);
            *n = n.saturating_add(1);
            *n
        };
        let delay = backoff_delay(failures, self.backoff_base, self.backoff_max);
        debug!(%key, failures, delay_ms = delay.as_millis() as u64, "requeue with backoff");
        self.add_after(key, delay);
        delay
    }

    /// Clear the failure count of `key`.
    pub fn forget(&self, key: &str) {
        self.lock().failures.remove(key);
    }

    /// Wait for the next key. `None` once the queue is shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.shut_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Mark `key` finished; replays an add that arrived while it ran.
    pub fn done(&self, key: &str) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shut_down {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub fn shut_down(&self) {
        self.lock().shut_down = true;
        self.notify.notify_waiters();
    }

    /// Keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn failures(&self, key: &str) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }
}

/// `base * 2^(failures - 1)`, capped at `max`.
pub fn backoff_delay(failures: u32, base: Duration, max: Duration) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Arc<WorkQueue> {
        WorkQueue::new(Duration::from_millis(10), Duration::from_millis(80))
    }

    async fn next(queue: &WorkQueue) -> Option<String> {
        tokio::time::timeout(Duration::from_millis(500), queue.get())
            .await
            .ok()
            .flatten()
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(3);
        assert_eq!(backoff_delay(0, base, max), Duration::ZERO);
        assert_eq!(backoff_delay(1, base, max), Duration::from_millis(500));
        assert_eq!(backoff_delay(2, base, max), Duration::from_millis(1000));
        assert_eq!(backoff_delay(3, base, max), Duration::from_millis(2000));
        assert_eq!(backoff_delay(4, base, max), Duration::from_secs(3));
        assert_eq!(backoff_delay(64, base, max), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn duplicate_adds_collapse() {
        let q = queue();
        q.add("ns/a");
        q.add("ns/a");
        q.add("ns/b");
        assert_eq!(q.len(), 2);
        assert_eq!(next(&q).await.as_deref(), Some("ns/a"));
        assert_eq!(next(&q).await.as_deref(), Some("ns/b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn in_flight_key_is_not_handed_out_twice() {
        let q = queue();
        q.add("ns/a");
        let key = next(&q).await.unwrap();

        q.add("ns/a");
        assert!(q.is_empty(), "re-add while in flight must wait");

        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(next(&q).await.as_deref(), Some("ns/a"));
        q.done("ns/a");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn delayed_add_arrives() {
        let q = queue();
        q.add_after("ns/a", Duration::from_millis(20));
        assert!(q.is_empty());
        assert_eq!(next(&q).await.as_deref(), Some("ns/a"));
    }

    #[tokio::test]
    async fn failures_grow_until_forgotten() {
        let q = queue();
        assert_eq!(q.add_rate_limited("ns/a"), Duration::from_millis(10));
        assert_eq!(q.add_rate_limited("ns/a"), Duration::from_millis(20));
        assert_eq!(q.failures("ns/a"), 2);
        q.forget("ns/a");
        assert_eq!(q.failures("ns/a"), 0);
        assert_eq!(next(&q).await.as_deref(), Some("ns/a"));
    }

    #[tokio::test]
    async fn shutdown_releases_waiters() {
        let q = queue();
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.shut_down();
        let got = tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, None);

        q.add("ns/a");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn waiting_worker_wakes_on_add() {
        let q = queue();
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.add("ns/a");
        let got = tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.as_deref(), Some("ns/a"));
    }
}
