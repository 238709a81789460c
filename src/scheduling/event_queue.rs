//! The event-driven work queue.
//!
//! A bounded-intent, duplicate-free FIFO of components whose inbound queues
//! just became non-empty. Event-pool workers block briefly on `poll`; stop
//! paths call `remove`. The queue is cluster-aware: on a non-primary node
//! it silently drops primary-only components instead of handing them out.

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::model::connectable::Connectable;

#[derive(Default)]
struct QueueInner {
    ready: VecDeque<Arc<Connectable>>,
    queued_ids: FxHashSet<String>,
}

/// Fair, duplicate-free queue of ready event-driven components.
pub struct EventDrivenWorkerQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    primary: AtomicBool,
    clustered: AtomicBool,
}

impl Default for EventDrivenWorkerQueue {
    fn default() -> Self {
        Self::new(false, false)
    }
}

impl EventDrivenWorkerQueue {
    #[must_use]
    pub fn new(primary: bool, clustered: bool) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            primary: AtomicBool::new(primary),
            clustered: AtomicBool::new(clustered),
        }
    }

    pub fn set_primary(&self, primary: bool) {
        self.primary.store(primary, Ordering::SeqCst);
    }

    pub fn set_clustered(&self, clustered: bool) {
        self.clustered.store(clustered, Ordering::SeqCst);
    }

    /// Record readiness. Idempotent: a component already queued is not
    /// queued twice.
    pub fn offer(&self, component: Arc<Connectable>) {
        let mut inner = self.inner.lock();
        if !inner.queued_ids.insert(component.id().to_string()) {
            return;
        }
        inner.ready.push_back(component);
        drop(inner);
        self.notify.notify_one();
    }

    /// Take the next ready component, waiting up to `timeout` for one to
    /// appear. Primary-only components are dropped on non-primary cluster
    /// members rather than returned.
    pub async fn poll(&self, timeout: Duration) -> Option<Arc<Connectable>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut inner = self.inner.lock();
                while let Some(component) = inner.ready.pop_front() {
                    inner.queued_ids.remove(component.id());
                    if self.should_drop(&component) {
                        continue;
                    }
                    return Some(component);
                }
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let notified = self.notify.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return None,
            }
        }
    }

    /// Withdraw a component, typically on its stop path.
    pub fn remove(&self, component_id: &str) {
        let mut inner = self.inner.lock();
        if inner.queued_ids.remove(component_id) {
            inner.ready.retain(|queued| queued.id() != component_id);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().ready.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().ready.is_empty()
    }

    fn should_drop(&self, component: &Connectable) -> bool {
        component.scheduling_strategy().is_primary_only()
            && self.clustered.load(Ordering::SeqCst)
            && !self.primary.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for EventDrivenWorkerQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDrivenWorkerQueue")
            .field("ready", &self.len())
            .field("primary", &self.primary.load(Ordering::SeqCst))
            .field("clustered", &self.clustered.load(Ordering::SeqCst))
            .finish()
    }
}
