//! Scheduling agents: the bridge between a component's scheduling strategy
//! and the worker pools.
//!
//! One agent per strategy, all owned by the [`ProcessScheduler`]:
//!
//! - **timer-driven** — a per-component driver loop ticks every period and
//!   dispatches up to `max_concurrent_tasks` triggers onto the timer pool.
//! - **cron-driven** — the driver sleeps to the next wall-clock match of
//!   the component's cron expression.
//! - **event-driven** — no driver; pool workers pull ready components off
//!   the [`EventDrivenWorkerQueue`].
//! - **primary-node-only** — the timer driver with a primary gate consulted
//!   before every dispatch. Flipping primary off stops new dispatches at
//!   once; in-flight triggers complete.
//!
//! Every trigger runs through one wrapper: back-pressure check (skip and
//! yield when any outbound queue is full), yield/penalty suppression, the
//! compare-and-increment concurrency gate, the plug-in extension scope, and
//! an exception barrier that penalises the component instead of propagating.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use miette::Diagnostic;
use thiserror::Error;

use crate::model::connectable::Connectable;
use crate::plugin::ReportingTaskNode;
use crate::scheduling::engine::FlowEngine;
use crate::scheduling::event_queue::EventDrivenWorkerQueue;
use crate::scheduling::session::{clamp_period, relay_trigger, SessionFactory};
use crate::repository::FlowFileEvent;
use crate::types::SchedulingStrategy;

/// Errors raised when binding a component to its agent.
#[derive(Debug, Error, Diagnostic)]
pub enum ScheduleError {
    #[error("component {id} uses cron scheduling but has no cron expression")]
    #[diagnostic(code(floweave::scheduling::missing_cron))]
    MissingCronExpression { id: String },

    #[error("invalid cron expression {expression:?} on component {id}: {message}")]
    #[diagnostic(code(floweave::scheduling::invalid_cron))]
    InvalidCronExpression {
        id: String,
        expression: String,
        message: String,
    },
}

struct ComponentSchedule {
    stop: watch::Sender<bool>,
    driver: Option<JoinHandle<()>>,
}

/// Owns the four agents, the two worker pools they dispatch onto, and the
/// per-component driver tasks.
pub struct ProcessScheduler {
    timer_engine: Arc<FlowEngine>,
    event_engine: Arc<FlowEngine>,
    worker_queue: Arc<EventDrivenWorkerQueue>,
    session_factory: Arc<SessionFactory>,
    schedule_minimum: Duration,
    primary: Arc<AtomicBool>,
    schedules: Mutex<FxHashMap<String, ComponentSchedule>>,
    worker_stop: watch::Sender<bool>,
}

impl ProcessScheduler {
    #[must_use]
    pub fn new(
        timer_engine: Arc<FlowEngine>,
        event_engine: Arc<FlowEngine>,
        worker_queue: Arc<EventDrivenWorkerQueue>,
        session_factory: Arc<SessionFactory>,
        schedule_minimum: Duration,
    ) -> Arc<Self> {
        let (worker_stop, _) = watch::channel(false);
        Arc::new(Self {
            timer_engine,
            event_engine,
            worker_queue,
            session_factory,
            schedule_minimum,
            primary: Arc::new(AtomicBool::new(false)),
            schedules: Mutex::new(FxHashMap::default()),
            worker_stop,
        })
    }

    #[must_use]
    pub fn worker_queue(&self) -> &Arc<EventDrivenWorkerQueue> {
        &self.worker_queue
    }

    #[must_use]
    pub fn session_factory(&self) -> &Arc<SessionFactory> {
        &self.session_factory
    }

    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.primary.load(Ordering::SeqCst)
    }

    pub fn set_primary(&self, primary: bool) {
        self.primary.store(primary, Ordering::SeqCst);
        self.worker_queue.set_primary(primary);
    }

    /// Launch the event-pool workers. Called once at controller start; each
    /// worker occupies one event-pool slot for the life of the scheduler.
    pub fn start_event_workers(self: &Arc<Self>, workers: usize) {
        for worker_index in 0..workers {
            let scheduler = self.clone();
            let mut stop = self.worker_stop.subscribe();
            let result = self.event_engine.execute(async move {
                loop {
                    if *stop.borrow() {
                        break;
                    }
                    let polled = tokio::select! {
                        _ = stop.changed() => break,
                        polled = scheduler
                            .worker_queue
                            .poll(Duration::from_millis(100)) => polled,
                    };
                    let Some(component) = polled else {
                        continue;
                    };
                    scheduler.trigger_once(&component).await;
                    if component.scheduled_state().is_running() && component.has_queued_work() {
                        scheduler.worker_queue.offer(component);
                    }
                }
                tracing::debug!(worker = worker_index, "event-driven worker exited");
            });
            if result.is_err() {
                tracing::warn!("event engine refused worker; scheduler already shut down");
                return;
            }
        }
    }

    /// A destination's inbound queue just became non-empty.
    pub fn notify_ready(&self, component: &Arc<Connectable>) {
        if component.scheduling_strategy().is_event_driven()
            && component.scheduled_state().is_running()
        {
            self.worker_queue.offer(component.clone());
        }
    }

    /// Bind a freshly-started component to its agent.
    pub fn schedule(self: &Arc<Self>, component: &Arc<Connectable>) -> Result<(), ScheduleError> {
        if let Some(handle) = component.processor() {
            handle.extension.sync_scope(|| handle.plugin.on_scheduled());
        }

        match component.scheduling_strategy() {
            SchedulingStrategy::TimerDriven => {
                self.spawn_timer_driver(component.clone(), false);
            }
            SchedulingStrategy::PrimaryNodeOnly => {
                self.spawn_timer_driver(component.clone(), true);
            }
            SchedulingStrategy::CronDriven => {
                self.spawn_cron_driver(component.clone())?;
            }
            SchedulingStrategy::EventDriven => {
                // No driver; readiness flows through the worker queue.
                let mut schedules = self.schedules.lock();
                let (stop, _) = watch::channel(false);
                schedules.insert(
                    component.id().to_string(),
                    ComponentSchedule { stop, driver: None },
                );
                drop(schedules);
                if component.has_queued_work() {
                    self.worker_queue.offer(component.clone());
                }
            }
        }
        Ok(())
    }

    /// Detach a component from its agent. The scheduled state is already
    /// Stopped; in-flight triggers complete on their own.
    pub fn unschedule(&self, component: &Arc<Connectable>) {
        if let Some(schedule) = self.schedules.lock().remove(component.id()) {
            let _ = schedule.stop.send(true);
            drop(schedule.driver);
        }
        self.worker_queue.remove(component.id());
        if let Some(handle) = component.processor() {
            handle.extension.sync_scope(|| handle.plugin.on_unscheduled());
        }
    }

    /// Bind a reporting task to the timer or cron agent.
    pub fn schedule_reporting_task(
        self: &Arc<Self>,
        node: &Arc<ReportingTaskNode>,
    ) -> Result<(), ScheduleError> {
        node.extension().sync_scope(|| node.task().on_scheduled());
        let (stop_tx, mut stop) = watch::channel(false);

        let driver = match node.scheduling_strategy() {
            SchedulingStrategy::CronDriven => {
                let schedule = parse_cron(node.id(), node.cron_expression())?;
                let node = node.clone();
                tokio::spawn(async move {
                    loop {
                        let Some(delay) = delay_to_next(&schedule) else {
                            break;
                        };
                        tokio::select! {
                            _ = stop.changed() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        if *stop.borrow() {
                            break;
                        }
                        run_reporting_task(&node).await;
                    }
                })
            }
            _ => {
                let period = clamp_period(node.scheduling_period(), self.schedule_minimum);
                let node = node.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = stop.changed() => break,
                            _ = tokio::time::sleep(period) => {}
                        }
                        if *stop.borrow() {
                            break;
                        }
                        run_reporting_task(&node).await;
                    }
                })
            }
        };

        self.schedules.lock().insert(
            node.id().to_string(),
            ComponentSchedule {
                stop: stop_tx,
                driver: Some(driver),
            },
        );
        Ok(())
    }

    pub fn unschedule_reporting_task(&self, node: &Arc<ReportingTaskNode>) {
        if let Some(schedule) = self.schedules.lock().remove(node.id()) {
            let _ = schedule.stop.send(true);
            drop(schedule.driver);
        }
        node.extension().sync_scope(|| node.task().on_unscheduled());
    }

    /// Stop every driver and event worker. Engines are shut down separately
    /// so the caller controls the drain budget.
    pub fn shutdown(&self) {
        let _ = self.worker_stop.send(true);
        let mut schedules = self.schedules.lock();
        for (_, schedule) in schedules.drain() {
            let _ = schedule.stop.send(true);
        }
    }

    // ---- drivers ---------------------------------------------------------

    fn spawn_timer_driver(self: &Arc<Self>, component: Arc<Connectable>, primary_only: bool) {
        let (stop_tx, mut stop) = watch::channel(false);
        let scheduler = self.clone();
        let primary = self.primary.clone();
        let period = clamp_period(component.scheduling_period(), self.schedule_minimum);
        let driver_component = component.clone();
        let driver = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = tokio::time::sleep(period) => {}
                }
                if *stop.borrow() {
                    break;
                }
                if primary_only && !primary.load(Ordering::SeqCst) {
                    continue;
                }
                scheduler.dispatch_up_to_max(&driver_component);
            }
        });
        self.schedules.lock().insert(
            component.id().to_string(),
            ComponentSchedule {
                stop: stop_tx,
                driver: Some(driver),
            },
        );
    }

    fn spawn_cron_driver(self: &Arc<Self>, component: Arc<Connectable>) -> Result<(), ScheduleError> {
        let schedule = parse_cron(component.id(), component.cron_expression())?;
        let (stop_tx, mut stop) = watch::channel(false);
        let scheduler = self.clone();
        let driver_component = component.clone();
        let driver = tokio::spawn(async move {
            loop {
                let Some(delay) = delay_to_next(&schedule) else {
                    break;
                };
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                if *stop.borrow() {
                    break;
                }
                scheduler.dispatch_up_to_max(&driver_component);
            }
        });
        self.schedules.lock().insert(
            component.id().to_string(),
            ComponentSchedule {
                stop: stop_tx,
                driver: Some(driver),
            },
        );
        Ok(())
    }

    /// One agent tick: dispatch as many triggers as the concurrency gate
    /// permits, each as a pool task.
    fn dispatch_up_to_max(self: &Arc<Self>, component: &Arc<Connectable>) {
        if !component.scheduled_state().is_running() {
            return;
        }
        if component.is_yielded() || component.is_penalized() {
            return;
        }
        if component.any_downstream_full() {
            component.yield_now();
            tracing::debug!(
                component = component.id(),
                "downstream back-pressure, yielding"
            );
            return;
        }
        for _ in 0..component.max_concurrent_tasks() {
            if !component.try_acquire_trigger() {
                break;
            }
            let scheduler = self.clone();
            let component_for_task = component.clone();
            let result = self.timer_engine.execute(async move {
                scheduler.run_acquired_trigger(&component_for_task).await;
            });
            if result.is_err() {
                component.release_trigger();
                break;
            }
        }
    }

    /// Full trigger path used by the event workers, where no dispatch-side
    /// acquisition has happened yet.
    pub(crate) async fn trigger_once(&self, component: &Arc<Connectable>) {
        if !component.scheduled_state().is_running() {
            return;
        }
        if component.is_yielded() || component.is_penalized() {
            return;
        }
        if component.any_downstream_full() {
            component.yield_now();
            return;
        }
        if !component.try_acquire_trigger() {
            return;
        }
        self.run_acquired_trigger(component).await;
    }

    /// Body shared by both dispatch paths. The caller has already passed
    /// the concurrency gate; this always releases it.
    async fn run_acquired_trigger(&self, component: &Arc<Connectable>) {
        let started = Instant::now();
        let mut session = self.session_factory.create_session(component.clone());

        let result = match component.processor() {
            Some(handle) => {
                handle
                    .extension
                    .scope(handle.plugin.on_trigger(&mut session))
                    .await
            }
            None => {
                relay_trigger(&mut session).await;
                Ok(())
            }
        };

        match result {
            Ok(()) => {
                if let Err(error) = session.commit().await {
                    tracing::warn!(
                        component = component.id(),
                        error = %error,
                        "session commit failed; penalizing component"
                    );
                    component.penalize();
                }
            }
            Err(error) => {
                tracing::warn!(
                    component = component.id(),
                    error = %error,
                    "trigger failed; penalizing component"
                );
                session.rollback();
                component.penalize();
            }
        }

        self.session_factory.event_repository.record(
            component.id(),
            FlowFileEvent {
                invocations: 1,
                processing_nanos: started.elapsed().as_nanos().min(u64::MAX as u128) as u64,
                ..Default::default()
            },
        );
        component.release_trigger();
    }
}

impl std::fmt::Debug for ProcessScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessScheduler")
            .field("primary", &self.is_primary())
            .field("scheduled", &self.schedules.lock().len())
            .finish()
    }
}

async fn run_reporting_task(node: &Arc<ReportingTaskNode>) {
    if !node.scheduled_state().is_running() {
        return;
    }
    let task = node.task().clone();
    let result = node.extension().scope(task.on_trigger()).await;
    if let Err(error) = result {
        tracing::warn!(task = node.id(), error = %error, "reporting task failed");
    }
}

fn parse_cron(
    component_id: &str,
    expression: Option<String>,
) -> Result<cron::Schedule, ScheduleError> {
    let Some(expression) = expression else {
        return Err(ScheduleError::MissingCronExpression {
            id: component_id.to_string(),
        });
    };
    cron::Schedule::from_str(&expression).map_err(|error| ScheduleError::InvalidCronExpression {
        id: component_id.to_string(),
        expression,
        message: error.to_string(),
    })
}

fn delay_to_next(schedule: &cron::Schedule) -> Option<Duration> {
    let next = schedule.upcoming(chrono::Utc).next()?;
    // A match in the immediate past rounds up to "now".
    Some((next - chrono::Utc::now()).to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cron_parse_rejects_garbage() {
        let err = parse_cron("p1", Some("not a cron".to_string())).unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidCronExpression { .. }));

        let err = parse_cron("p1", None).unwrap_err();
        assert!(matches!(err, ScheduleError::MissingCronExpression { .. }));
    }

    #[test]
    fn cron_parse_accepts_standard_expression() {
        // six-field expression with seconds
        assert!(parse_cron("p1", Some("*/5 * * * * *".to_string())).is_ok());
    }
}
