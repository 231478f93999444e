//! Deduplicating work queue keyed by object, with per-key serialization.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kiln_core::ObjectKey;
use metrics::gauge;
use rustc_hash::FxHashSet;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Default)]
struct State {
    pending: FxHashSet<ObjectKey>,
    order: VecDeque<ObjectKey>,
    in_flight: FxHashSet<ObjectKey>,
    /// Keys re-added while in flight; handed out again once done.
    dirty: FxHashSet<ObjectKey>,
    closed: bool,
    coalesced: u64,
}

/// FIFO of keys with three guarantees: a key is queued at most once, a key
/// that is in flight is never handed to a second worker, and a key re-added
/// while in flight runs again after the current pass ends.
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<State>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn add(&self, key: ObjectKey) {
        let mut st = self.lock();
        if st.closed {
            return;
        }
        if st.in_flight.contains(&key) {
            st.dirty.insert(key);
            return;
        }
        if !st.pending.insert(key.clone()) {
            st.coalesced += 1;
            return;
        }
        st.order.push_back(key);
        gauge!("work_queue_depth", st.order.len() as f64);
        drop(st);
        self.notify.notify_one();
    }

    /// Enqueue `key` once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        let q = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            debug!(key = %key, delay_ms = delay.as_millis() as u64, "delayed requeue");
            q.add(key);
        });
    }

    /// Take the next key, marking it in flight.
    pub fn try_next(&self) -> Option<ObjectKey> {
        let mut st = self.lock();
        let key = st.order.pop_front()?;
        st.pending.remove(&key);
        st.in_flight.insert(key.clone());
        gauge!("work_queue_depth", st.order.len() as f64);
        Some(key)
    }

    /// Wait for the next key; `None` once the queue is shut down.
    pub async fn next(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(key) = self.try_next() {
                return Some(key);
            }
            if self.lock().closed {
                return None;
            }
            notified.await;
        }
    }

    /// Release a key handed out by `next`.
    pub fn done(&self, key: &ObjectKey) {
        let mut st = self.lock();
        st.in_flight.remove(key);
        if st.dirty.remove(key) && !st.closed && st.pending.insert(key.clone()) {
            st.order.push_back(key.clone());
            drop(st);
            self.notify.notify_one();
        }
    }

    pub fn shutdown(&self) {
        let mut st = self.lock();
        st.closed = true;
        st.order.clear();
        st.pending.clear();
        st.dirty.clear();
        drop(st);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds absorbed because the key was already queued.
    pub fn coalesced(&self) -> u64 {
        self.lock().coalesced
    }
}
