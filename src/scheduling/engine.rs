//! Bounded worker pools.
//!
//! A [`FlowEngine`] bounds how many component triggers run at once. It is a
//! semaphore-gated task group rather than a dedicated thread pool: tasks
//! queue on the semaphore, the permit count is adjustable at runtime, and
//! shutdown either drains in-flight work within a budget or aborts it.
//!
//! Periodic framework tasks (expiration sweep, remote refresh, status
//! capture, heartbeating) run as fixed-delay loops registered on the engine
//! so shutdown can cancel them without interrupting a run already in
//! progress.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error("engine {name} is shut down")]
    #[diagnostic(code(floweave::engine::terminated))]
    Terminated { name: String },
}

struct ActiveGuard {
    active: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Drop for ActiveGuard {
    // Runs on unwind too, so a panicking trigger cannot wedge the drain
    // accounting.
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.idle.notify_waiters();
    }
}

/// Cancellation handle for a periodic task. Dropping the handle does not
/// cancel the loop; `cancel` flips the stop signal, and the loop exits at
/// its next wait point (a run already in progress completes).
pub struct PeriodicHandle {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PeriodicHandle {
    pub fn cancel(&self) {
        let _ = self.stop.send(true);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.stop.borrow()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

/// A named, bounded pool of worker tasks.
pub struct FlowEngine {
    name: String,
    permits: Arc<Semaphore>,
    max_tasks: AtomicUsize,
    active: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    shutdown: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    periodic: Mutex<Vec<Arc<PeriodicHandle>>>,
}

impl FlowEngine {
    #[must_use]
    pub fn new(name: impl Into<String>, max_tasks: usize) -> Arc<Self> {
        let max_tasks = max_tasks.max(1);
        Arc::new(Self {
            name: name.into(),
            permits: Arc::new(Semaphore::new(max_tasks)),
            max_tasks: AtomicUsize::new(max_tasks),
            active: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
            shutdown: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            periodic: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn max_tasks(&self) -> usize {
        self.max_tasks.load(Ordering::SeqCst)
    }

    /// Tasks currently holding a permit.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Adjust the pool bound. Growing takes effect immediately; shrinking
    /// takes effect as in-flight tasks release their permits.
    pub fn set_max_tasks(self: &Arc<Self>, new_max: usize) {
        let new_max = new_max.max(1);
        let old = self.max_tasks.swap(new_max, Ordering::SeqCst);
        if new_max > old {
            self.permits.add_permits(new_max - old);
        } else if new_max < old {
            let to_remove = old - new_max;
            let permits = self.permits.clone();
            tokio::spawn(async move {
                if let Ok(acquired) = permits.acquire_many(to_remove as u32).await {
                    acquired.forget();
                }
            });
        }
    }

    /// Run a future on the pool, waiting for a permit. Returns an error if
    /// the engine has been shut down; the future is dropped in that case.
    pub fn execute<F>(self: &Arc<Self>, future: F) -> Result<(), EngineError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_terminated() {
            return Err(EngineError::Terminated {
                name: self.name.clone(),
            });
        }
        let permits = self.permits.clone();
        let active = self.active.clone();
        let idle = self.idle.clone();
        let handle = tokio::spawn(async move {
            let Ok(_permit) = permits.acquire().await else {
                // Semaphore closed by shutdown; the work is abandoned.
                return;
            };
            active.fetch_add(1, Ordering::SeqCst);
            let _guard = ActiveGuard { active, idle };
            future.await;
        });
        let mut workers = self.workers.lock();
        workers.retain(|worker| !worker.is_finished());
        workers.push(handle);
        Ok(())
    }

    /// Register a fixed-delay periodic loop. The body runs to completion on
    /// every iteration; cancellation is observed at the next delay.
    pub fn schedule_with_fixed_delay<F, Fut>(
        self: &Arc<Self>,
        task_name: &'static str,
        initial_delay: Duration,
        delay: Duration,
        mut body: F,
    ) -> Arc<PeriodicHandle>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let engine_name = self.name.clone();
        let handle = tokio::spawn(async move {
            if !initial_delay.is_zero() {
                tokio::select! {
                    _ = stop_rx.changed() => return,
                    _ = tokio::time::sleep(initial_delay) => {}
                }
            }
            loop {
                if *stop_rx.borrow() {
                    break;
                }
                body().await;
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            tracing::debug!(engine = %engine_name, task = task_name, "periodic task stopped");
        });
        let periodic = Arc::new(PeriodicHandle {
            stop: stop_tx,
            handle,
        });
        self.periodic.lock().push(periodic.clone());
        periodic
    }

    /// Graceful shutdown: refuse new work, cancel periodic loops without
    /// interrupting a run in progress, and wait up to `budget` for active
    /// tasks to drain. Returns true when the pool drained cleanly.
    pub async fn shutdown(self: &Arc<Self>, budget: Duration) -> bool {
        self.shutdown.store(true, Ordering::SeqCst);
        for periodic in self.periodic.lock().iter() {
            periodic.cancel();
        }
        let deadline = tokio::time::Instant::now() + budget;
        while self.active_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            // Re-poll on a short tick as well: notify_waiters does not
            // store a permit, so a release between the count check and the
            // wait registration would otherwise be missed.
            let wait = self.idle.notified();
            tokio::select! {
                _ = wait => {}
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
        true
    }

    /// Immediate shutdown: abort every worker and periodic task.
    pub fn shutdown_now(self: &Arc<Self>) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.permits.close();
        for periodic in self.periodic.lock().iter() {
            periodic.cancel();
            periodic.abort();
        }
        for worker in self.workers.lock().iter() {
            worker.abort();
        }
    }
}

impl std::fmt::Debug for FlowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowEngine")
            .field("name", &self.name)
            .field("max_tasks", &self.max_tasks())
            .field("active", &self.active_count())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn execute_bounds_concurrency() {
        let engine = FlowEngine::new("test", 2);
        let running = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        for _ in 0..8 {
            let running = running.clone();
            let peak = peak.clone();
            engine
                .execute(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn graceful_shutdown_drains() {
        let engine = FlowEngine::new("test", 4);
        let completed = Arc::new(AtomicU32::new(0));
        for _ in 0..4 {
            let completed = completed.clone();
            engine
                .execute(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    completed.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        // Give the workers a moment to claim permits.
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(engine.shutdown(Duration::from_secs(2)).await);
        assert_eq!(completed.load(Ordering::SeqCst), 4);
        assert!(engine.execute(async {}).is_err());
    }

    #[tokio::test]
    async fn graceful_shutdown_reports_wedged_worker() {
        let engine = FlowEngine::new("test", 1);
        engine
            .execute(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!engine.shutdown(Duration::from_millis(50)).await);
        engine.shutdown_now();
    }

    #[tokio::test]
    async fn periodic_task_repeats_until_cancelled() {
        let engine = FlowEngine::new("test", 1);
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = ticks.clone();
        let handle = engine.schedule_with_fixed_delay(
            "ticker",
            Duration::ZERO,
            Duration::from_millis(10),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();
        let after_cancel = ticks.load(Ordering::SeqCst);
        assert!(after_cancel >= 3, "expected several ticks, saw {after_cancel}");

        tokio::time::sleep(Duration::from_millis(50)).await;
        let settled = ticks.load(Ordering::SeqCst);
        assert!(settled <= after_cancel + 1, "ticks continued after cancel");
    }
}
