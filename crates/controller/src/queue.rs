//! Coalescing work queue for object keys.
//!
//! Keys are handed out in FIFO order and deduplicated while they wait. A key that is pushed
//! while a worker holds it is marked dirty and queued again once the worker is done, so one
//! key is never reconciled by two workers at the same time.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use kubesync_core::ObjectKey;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;

pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(300);
const BASE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct QueueState {
    order: VecDeque<ObjectKey>,
    queued: FxHashSet<ObjectKey>,
    in_flight: FxHashSet<ObjectKey>,
    dirty: FxHashSet<ObjectKey>,
    failures: FxHashMap<ObjectKey, u32>,
    closed: bool,
}

impl QueueState {
    fn enqueue(&mut self, key: ObjectKey) -> bool {
        if self.in_flight.contains(&key) {
            self.dirty.insert(key);
            return false;
        }
        if !self.queued.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        true
    }
}

#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    max_backoff: Duration,
}

impl WorkQueue {
    pub fn new(max_backoff: Duration) -> Self {
        Self { state: Mutex::new(QueueState::default()), notify: Notify::new(), max_backoff }
    }

    // Critical sections never panic, so a poisoned lock still holds a consistent state.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Queues `key` unless it is already waiting. Ignored after [`WorkQueue::close`].
    pub fn push(&self, key: ObjectKey) {
        let mut st = self.lock();
        if st.closed {
            return;
        }
        if st.enqueue(key) {
            drop(st);
            self.notify.notify_one();
        }
    }

    /// Waits for the next key and marks it in flight. `None` once the queue is closed and
    /// drained.
    pub async fn pop(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if let Some(key) = st.order.pop_front() {
                    st.queued.remove(&key);
                    st.in_flight.insert(key.clone());
                    return Some(key);
                }
                if st.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Releases a key taken by [`WorkQueue::pop`].
    ///
    /// A key that was pushed meanwhile is queued again right away. For a failed pass the
    /// returned delay is the backoff after which the caller should push the key again.
    pub fn done(&self, key: &ObjectKey, succeeded: bool) -> Option<Duration> {
        let mut st = self.lock();
        st.in_flight.remove(key);
        let retry = if succeeded {
            st.failures.remove(key);
            None
        } else {
            let n = st.failures.entry(key.clone()).or_insert(0);
            *n = n.saturating_add(1);
            Some(backoff(*n, self.max_backoff))
        };
        let requeued = !st.closed && st.dirty.remove(key) && st.enqueue(key.clone());
        drop(st);
        if requeued {
            self.notify.notify_one();
        }
        retry
    }

    /// Stops accepting keys; waiting workers drain what is left and then see `None`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Number of keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn failures(&self, key: &ObjectKey) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }
}

/// `1s * 2^(failures-1)`, capped at `max`.
pub fn backoff(failures: u32, max: Duration) -> Duration {
    let exp = failures.saturating_sub(1).min(31);
    BASE_BACKOFF.checked_mul(1u32 << exp).map_or(max, |d| d.min(max))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k(name: &str) -> ObjectKey {
        ObjectKey::new(Some("team"), name)
    }

    #[tokio::test]
    async fn waiting_keys_are_coalesced_in_fifo_order() {
        let q = WorkQueue::new(DEFAULT_MAX_BACKOFF);
        q.push(k("a"));
        q.push(k("b"));
        q.push(k("a"));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().await, Some(k("a")));
        assert_eq!(q.pop().await, Some(k("b")));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn key_pushed_while_in_flight_runs_again_afterwards() {
        let q = WorkQueue::new(DEFAULT_MAX_BACKOFF);
        q.push(k("a"));
        let a = q.pop().await.unwrap();
        q.push(k("a"));
        q.push(k("a"));
        // Not handed out twice at the same time.
        assert!(q.is_empty());
        assert_eq!(q.done(&a, true), None);
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop().await, Some(k("a")));
    }

    #[tokio::test]
    async fn failures_back_off_exponentially_until_success() {
        let q = WorkQueue::new(Duration::from_secs(5));
        for expected in [1, 2, 4, 5, 5] {
            q.push(k("a"));
            let a = q.pop().await.unwrap();
            assert_eq!(q.done(&a, false), Some(Duration::from_secs(expected)));
        }
        assert_eq!(q.failures(&k("a")), 5);
        q.push(k("a"));
        let a = q.pop().await.unwrap();
        assert_eq!(q.done(&a, true), None);
        assert_eq!(q.failures(&k("a")), 0);
    }

    #[tokio::test]
    async fn closed_queue_drains_then_ends() {
        let q = std::sync::Arc::new(WorkQueue::new(DEFAULT_MAX_BACKOFF));
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.pop().await })
        };
        q.push(k("a"));
        assert_eq!(waiter.await.unwrap(), Some(k("a")));

        q.push(k("b"));
        q.close();
        q.push(k("c"));
        assert_eq!(q.pop().await, Some(k("b")));
        assert_eq!(q.pop().await, None);
    }

    #[test]
    fn backoff_saturates() {
        assert_eq!(backoff(1, DEFAULT_MAX_BACKOFF), Duration::from_secs(1));
        assert_eq!(backoff(9, DEFAULT_MAX_BACKOFF), Duration::from_secs(256));
        assert_eq!(backoff(10, DEFAULT_MAX_BACKOFF), DEFAULT_MAX_BACKOFF);
        assert_eq!(backoff(u32::MAX, DEFAULT_MAX_BACKOFF), DEFAULT_MAX_BACKOFF);
    }
}
