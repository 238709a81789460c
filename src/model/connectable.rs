//! Graph vertices: processors, ports, funnels, and remote ports.
//!
//! A [`Connectable`] carries the per-vertex state the scheduling agents
//! consult on every dispatch: scheduled state, concurrency gate, yield and
//! penalty expirations, and the sets of attached connections. Connections
//! are held weakly; their owning group keeps them alive, so dropping a
//! connection from its group is enough to detach it everywhere.

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::model::connection::Connection;
use crate::plugin::{ExtensionContext, Processor};
use crate::types::{ConnectableKind, Position, ScheduledState, SchedulingStrategy};

/// Relationship name used by ports and funnels, which declare no
/// relationships of their own.
pub const ANONYMOUS_RELATIONSHIP: &str = "";

/// Processor-specific state attached to a [`Connectable`] of kind
/// `Processor`.
pub struct ProcessorHandle {
    /// Registry type name the plug-in was resolved from.
    pub type_name: String,
    /// The plug-in implementation.
    pub plugin: Arc<dyn Processor>,
    /// Resource namespace installed around every plug-in entry point.
    pub extension: Arc<ExtensionContext>,
    properties: RwLock<rustc_hash::FxHashMap<String, String>>,
    auto_terminated: RwLock<FxHashSet<String>>,
}

impl ProcessorHandle {
    #[must_use]
    pub fn new(
        type_name: impl Into<String>,
        plugin: Arc<dyn Processor>,
        extension: Arc<ExtensionContext>,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            plugin,
            extension,
            properties: RwLock::new(rustc_hash::FxHashMap::default()),
            auto_terminated: RwLock::new(FxHashSet::default()),
        }
    }

    #[must_use]
    pub fn properties(&self) -> rustc_hash::FxHashMap<String, String> {
        self.properties.read().clone()
    }

    pub fn set_property(&self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.write().insert(key.into(), value.into());
    }

    /// Relationships whose flow files are dropped instead of routed.
    #[must_use]
    pub fn auto_terminated(&self) -> FxHashSet<String> {
        self.auto_terminated.read().clone()
    }

    pub fn set_auto_terminated(&self, relationships: FxHashSet<String>) {
        *self.auto_terminated.write() = relationships;
    }
}

impl fmt::Debug for ProcessorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorHandle")
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// A vertex in the flow graph.
pub struct Connectable {
    id: String,
    kind: ConnectableKind,
    name: RwLock<String>,
    comments: RwLock<String>,
    position: RwLock<Position>,
    /// Owning group, by id. A weak back-link; resolved through the controller.
    group_id: RwLock<String>,
    scheduled_state: RwLock<ScheduledState>,
    scheduling_strategy: RwLock<SchedulingStrategy>,
    scheduling_period: RwLock<Duration>,
    cron_expression: RwLock<Option<String>>,
    max_concurrent_tasks: AtomicUsize,
    active_tasks: AtomicUsize,
    trigger_count: AtomicU64,
    yield_period: RwLock<Duration>,
    penalization_period: RwLock<Duration>,
    yield_expiration: Mutex<Option<Instant>>,
    penalty_expiration: Mutex<Option<Instant>>,
    incoming: RwLock<Vec<Weak<Connection>>>,
    outgoing: RwLock<Vec<Weak<Connection>>>,
    processor: Option<ProcessorHandle>,
    /// Validity override used by ports/funnels and tests. Processors combine
    /// this with plug-in validation.
    validity: RwLock<Option<Arc<dyn Fn() -> bool + Send + Sync>>>,
}

impl Connectable {
    #[must_use]
    pub fn new(id: impl Into<String>, kind: ConnectableKind, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            name: RwLock::new(name.into()),
            comments: RwLock::new(String::new()),
            position: RwLock::new(Position::default()),
            group_id: RwLock::new(String::new()),
            scheduled_state: RwLock::new(ScheduledState::Stopped),
            scheduling_strategy: RwLock::new(SchedulingStrategy::TimerDriven),
            scheduling_period: RwLock::new(Duration::from_secs(1)),
            cron_expression: RwLock::new(None),
            max_concurrent_tasks: AtomicUsize::new(1),
            active_tasks: AtomicUsize::new(0),
            trigger_count: AtomicU64::new(0),
            yield_period: RwLock::new(Duration::from_secs(1)),
            penalization_period: RwLock::new(Duration::from_secs(30)),
            yield_expiration: Mutex::new(None),
            penalty_expiration: Mutex::new(None),
            incoming: RwLock::new(Vec::new()),
            outgoing: RwLock::new(Vec::new()),
            processor: None,
            validity: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn with_processor(mut self, handle: ProcessorHandle) -> Self {
        self.processor = Some(handle);
        self
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn kind(&self) -> ConnectableKind {
        self.kind
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    #[must_use]
    pub fn comments(&self) -> String {
        self.comments.read().clone()
    }

    pub fn set_comments(&self, comments: impl Into<String>) {
        *self.comments.write() = comments.into();
    }

    #[must_use]
    pub fn position(&self) -> Position {
        *self.position.read()
    }

    pub fn set_position(&self, position: Position) {
        *self.position.write() = position;
    }

    #[must_use]
    pub fn group_id(&self) -> String {
        self.group_id.read().clone()
    }

    pub fn set_group_id(&self, group_id: impl Into<String>) {
        *self.group_id.write() = group_id.into();
    }

    #[must_use]
    pub fn processor(&self) -> Option<&ProcessorHandle> {
        self.processor.as_ref()
    }

    // ---- scheduled state ------------------------------------------------

    #[must_use]
    pub fn scheduled_state(&self) -> ScheduledState {
        *self.scheduled_state.read()
    }

    /// Raw state store. Transition legality lives in
    /// [`crate::scheduling::lifecycle`]; callers go through that module.
    pub(crate) fn store_scheduled_state(&self, state: ScheduledState) {
        *self.scheduled_state.write() = state;
    }

    /// Atomically transition `expected → next`. Returns the observed state
    /// on mismatch so the state machine can report the illegal transition.
    pub(crate) fn compare_and_set_state(
        &self,
        expected: ScheduledState,
        next: ScheduledState,
    ) -> Result<(), ScheduledState> {
        let mut state = self.scheduled_state.write();
        if *state == expected {
            *state = next;
            Ok(())
        } else {
            Err(*state)
        }
    }

    #[must_use]
    pub fn scheduling_strategy(&self) -> SchedulingStrategy {
        *self.scheduling_strategy.read()
    }

    pub fn set_scheduling_strategy(&self, strategy: SchedulingStrategy) {
        *self.scheduling_strategy.write() = strategy;
    }

    #[must_use]
    pub fn scheduling_period(&self) -> Duration {
        *self.scheduling_period.read()
    }

    pub fn set_scheduling_period(&self, period: Duration) {
        *self.scheduling_period.write() = period;
    }

    #[must_use]
    pub fn cron_expression(&self) -> Option<String> {
        self.cron_expression.read().clone()
    }

    pub fn set_cron_expression(&self, expression: Option<String>) {
        *self.cron_expression.write() = expression;
    }

    // ---- concurrency gate -----------------------------------------------

    #[must_use]
    pub fn max_concurrent_tasks(&self) -> usize {
        self.max_concurrent_tasks.load(Ordering::SeqCst)
    }

    /// Values below one are clamped to one.
    pub fn set_max_concurrent_tasks(&self, max: usize) {
        self.max_concurrent_tasks.store(max.max(1), Ordering::SeqCst);
    }

    #[must_use]
    pub fn active_task_count(&self) -> usize {
        self.active_tasks.load(Ordering::SeqCst)
    }

    /// Compare-and-increment against `max_concurrent_tasks`. Returns false
    /// when the component is saturated.
    pub fn try_acquire_trigger(&self) -> bool {
        let max = self.max_concurrent_tasks();
        let mut current = self.active_tasks.load(Ordering::SeqCst);
        loop {
            if current >= max {
                return false;
            }
            match self.active_tasks.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn release_trigger(&self) {
        self.active_tasks.fetch_sub(1, Ordering::SeqCst);
        self.trigger_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Completed trigger invocations since creation.
    #[must_use]
    pub fn trigger_count(&self) -> u64 {
        self.trigger_count.load(Ordering::SeqCst)
    }

    // ---- yield & penalisation -------------------------------------------

    #[must_use]
    pub fn yield_period(&self) -> Duration {
        *self.yield_period.read()
    }

    pub fn set_yield_period(&self, period: Duration) {
        *self.yield_period.write() = period;
    }

    #[must_use]
    pub fn penalization_period(&self) -> Duration {
        *self.penalization_period.read()
    }

    pub fn set_penalization_period(&self, period: Duration) {
        *self.penalization_period.write() = period;
    }

    /// Exclude this component from scheduling for its yield period.
    pub fn yield_now(&self) {
        *self.yield_expiration.lock() = Some(Instant::now() + self.yield_period());
    }

    #[must_use]
    pub fn is_yielded(&self) -> bool {
        let mut expiration = self.yield_expiration.lock();
        match *expiration {
            Some(until) if until > Instant::now() => true,
            Some(_) => {
                *expiration = None;
                false
            }
            None => false,
        }
    }

    /// Self-imposed cooldown after a failed processing attempt.
    pub fn penalize(&self) {
        *self.penalty_expiration.lock() = Some(Instant::now() + self.penalization_period());
    }

    #[must_use]
    pub fn is_penalized(&self) -> bool {
        let mut expiration = self.penalty_expiration.lock();
        match *expiration {
            Some(until) if until > Instant::now() => true,
            Some(_) => {
                *expiration = None;
                false
            }
            None => false,
        }
    }

    // ---- validity --------------------------------------------------------

    pub fn set_validity(&self, predicate: Arc<dyn Fn() -> bool + Send + Sync>) {
        *self.validity.write() = Some(predicate);
    }

    /// Whether the component may transition to Running. Processors are valid
    /// when their plug-in reports no validation errors; any installed
    /// override must also hold.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if let Some(predicate) = self.validity.read().clone() {
            if !predicate() {
                return false;
            }
        }
        if let Some(handle) = &self.processor {
            return handle.plugin.validate(&handle.properties()).is_empty();
        }
        true
    }

    // ---- relationships ---------------------------------------------------

    /// Relationship names this vertex may route to. Ports and funnels expose
    /// only the anonymous relationship.
    #[must_use]
    pub fn relationships(&self) -> Vec<String> {
        match &self.processor {
            Some(handle) => handle.plugin.relationships(),
            None => vec![ANONYMOUS_RELATIONSHIP.to_string()],
        }
    }

    // ---- connections -----------------------------------------------------

    pub(crate) fn register_incoming(&self, connection: &Arc<Connection>) {
        self.incoming.write().push(Arc::downgrade(connection));
    }

    pub(crate) fn register_outgoing(&self, connection: &Arc<Connection>) {
        self.outgoing.write().push(Arc::downgrade(connection));
    }

    pub(crate) fn unregister_connection(&self, connection_id: &str) {
        let prune = |list: &mut Vec<Weak<Connection>>| {
            list.retain(|weak| match weak.upgrade() {
                Some(conn) => conn.id() != connection_id,
                None => false,
            });
        };
        prune(&mut self.incoming.write());
        prune(&mut self.outgoing.write());
    }

    #[must_use]
    pub fn incoming_connections(&self) -> Vec<Arc<Connection>> {
        self.incoming
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    #[must_use]
    pub fn outgoing_connections(&self) -> Vec<Arc<Connection>> {
        self.outgoing
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Whether any inbound queue holds work.
    #[must_use]
    pub fn has_queued_work(&self) -> bool {
        self.incoming_connections()
            .iter()
            .any(|conn| !conn.queue().is_empty())
    }

    /// Whether any outbound queue signals back-pressure.
    #[must_use]
    pub fn any_downstream_full(&self) -> bool {
        self.outgoing_connections()
            .iter()
            .any(|conn| conn.queue().is_full())
    }
}

impl fmt::Debug for Connectable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connectable")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("name", &self.name.read().clone())
            .field("state", &self.scheduled_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_gate_respects_max() {
        let connectable = Connectable::new("p1", ConnectableKind::Processor, "proc");
        connectable.set_max_concurrent_tasks(2);

        assert!(connectable.try_acquire_trigger());
        assert!(connectable.try_acquire_trigger());
        assert!(!connectable.try_acquire_trigger());

        connectable.release_trigger();
        assert!(connectable.try_acquire_trigger());
        assert_eq!(connectable.trigger_count(), 1);
    }

    #[test]
    fn max_concurrent_tasks_clamped_to_one() {
        let connectable = Connectable::new("p1", ConnectableKind::Processor, "proc");
        connectable.set_max_concurrent_tasks(0);
        assert_eq!(connectable.max_concurrent_tasks(), 1);
    }

    #[test]
    fn yield_expires() {
        let connectable = Connectable::new("p1", ConnectableKind::Processor, "proc");
        connectable.set_yield_period(Duration::from_millis(5));
        connectable.yield_now();
        assert!(connectable.is_yielded());
        std::thread::sleep(Duration::from_millis(10));
        assert!(!connectable.is_yielded());
    }

    #[test]
    fn penalty_expires() {
        let connectable = Connectable::new("p1", ConnectableKind::Processor, "proc");
        connectable.set_penalization_period(Duration::from_millis(5));
        connectable.penalize();
        assert!(connectable.is_penalized());
        std::thread::sleep(Duration::from_millis(10));
        assert!(!connectable.is_penalized());
    }

    #[test]
    fn validity_override_applies() {
        let connectable = Connectable::new("f1", ConnectableKind::Funnel, "funnel");
        assert!(connectable.is_valid());
        connectable.set_validity(Arc::new(|| false));
        assert!(!connectable.is_valid());
    }

    #[test]
    fn ports_expose_anonymous_relationship() {
        let port = Connectable::new("in1", ConnectableKind::InputPort, "in");
        assert_eq!(port.relationships(), vec![ANONYMOUS_RELATIONSHIP.to_string()]);
    }
}
