//! The plug-in surface: processors, prioritisers, reporting tasks, and the
//! registry that resolves type names to factories.
//!
//! Every plug-in entry point — construction, triggers, lifecycle hooks —
//! runs with the plug-in's [`ExtensionContext`] installed on the current
//! task. The context is a scoped acquisition: it is restored on every exit
//! path, including panics, because the task-local scope unwinds with the
//! stack.

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::cmp::Ordering;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::model::flowfile::FlowFileRecord;
use crate::scheduling::session::ProcessSession;
use crate::types::{ScheduledState, SchedulingStrategy};

/// Errors raised by plug-in resolution and construction.
#[derive(Debug, Error, Diagnostic)]
pub enum PluginError {
    #[error("unknown processor type: {type_name}")]
    #[diagnostic(
        code(floweave::plugin::unknown_processor),
        help("Register the type with the PluginRegistry before referencing it.")
    )]
    UnknownProcessorType { type_name: String },

    #[error("unknown prioritizer type: {type_name}")]
    #[diagnostic(code(floweave::plugin::unknown_prioritizer))]
    UnknownPrioritizerType { type_name: String },

    #[error("unknown reporting task type: {type_name}")]
    #[diagnostic(code(floweave::plugin::unknown_reporting_task))]
    UnknownReportingTaskType { type_name: String },

    #[error("constructor for {type_name} failed: {message}")]
    #[diagnostic(code(floweave::plugin::construction))]
    Construction { type_name: String, message: String },
}

/// Error returned by a processor's trigger.
#[derive(Debug, Error, Diagnostic)]
pub enum ProcessorError {
    #[error("processing failed: {0}")]
    #[diagnostic(code(floweave::plugin::processing))]
    Failed(String),

    #[error(transparent)]
    #[diagnostic(code(floweave::plugin::io))]
    Io(#[from] std::io::Error),
}

tokio::task_local! {
    static CURRENT_EXTENSION: Arc<ExtensionContext>;
}

/// The resource namespace of a plug-in.
///
/// Analogue of a per-plug-in loader: any code that needs to resolve
/// plug-in-scoped resources asks [`ExtensionContext::current`] while inside
/// a scope established by [`scope`](Self::scope) or
/// [`sync_scope`](Self::sync_scope).
#[derive(Debug)]
pub struct ExtensionContext {
    name: String,
    resources: Vec<String>,
}

impl ExtensionContext {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            resources: Vec::new(),
        })
    }

    #[must_use]
    pub fn with_resources(name: impl Into<String>, resources: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            resources,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn resources(&self) -> &[String] {
        &self.resources
    }

    /// The context installed on the current task, if any.
    #[must_use]
    pub fn current() -> Option<Arc<ExtensionContext>> {
        CURRENT_EXTENSION.try_with(Arc::clone).ok()
    }

    /// Run a future with this context installed. The previous context (if
    /// any) is visible again as soon as the future completes, errors, or
    /// panics.
    pub async fn scope<F>(self: &Arc<Self>, future: F) -> F::Output
    where
        F: Future,
    {
        CURRENT_EXTENSION.scope(self.clone(), future).await
    }

    /// Run a closure with this context installed. Same restoration
    /// guarantees as [`scope`](Self::scope).
    pub fn sync_scope<R>(self: &Arc<Self>, f: impl FnOnce() -> R) -> R {
        CURRENT_EXTENSION.sync_scope(self.clone(), f)
    }
}

/// A processing node implementation.
///
/// The trigger is the only required method. Lifecycle hooks default to
/// no-ops; the engine invokes each hook if the plug-in cares to implement
/// it, always inside the plug-in's extension scope:
///
/// - `on_added` — once, when the node is first added to the graph
/// - `on_removed` — once, when the node is removed
/// - `on_scheduled` — each transition to Running, before the first trigger
/// - `on_unscheduled` — each transition out of Running
/// - `on_shutdown` — once, at controller shutdown
#[async_trait]
pub trait Processor: Send + Sync {
    /// Relationship names this processor may transfer to. Must be non-empty
    /// and stable for the life of the node.
    fn relationships(&self) -> Vec<String>;

    /// Validation errors for the given property map. Empty means valid; a
    /// non-empty result blocks the Stopped→Running transition.
    fn validate(&self, _properties: &FxHashMap<String, String>) -> Vec<String> {
        Vec::new()
    }

    /// Process one batch of work.
    async fn on_trigger(&self, session: &mut ProcessSession) -> Result<(), ProcessorError>;

    fn on_added(&self) {}
    fn on_removed(&self) {}
    fn on_scheduled(&self) {}
    fn on_unscheduled(&self) {}
    fn on_shutdown(&self) {}
}

/// Total-order comparator plug-in for queue ordering.
pub trait FlowFilePrioritizer: Send + Sync {
    fn name(&self) -> &str;

    /// `Less` means `a` leaves the queue before `b`.
    fn compare(&self, a: &FlowFileRecord, b: &FlowFileRecord) -> Ordering;
}

/// A background task that reports engine state somewhere else.
#[async_trait]
pub trait ReportingTask: Send + Sync {
    async fn on_trigger(&self) -> Result<(), ProcessorError>;

    fn on_scheduled(&self) {}
    fn on_unscheduled(&self) {}
}

/// Scheduling shell around a [`ReportingTask`] plug-in.
pub struct ReportingTaskNode {
    id: String,
    type_name: String,
    name: RwLock<String>,
    task: Arc<dyn ReportingTask>,
    extension: Arc<ExtensionContext>,
    strategy: RwLock<SchedulingStrategy>,
    period: RwLock<Duration>,
    cron_expression: RwLock<Option<String>>,
    state: RwLock<ScheduledState>,
}

impl ReportingTaskNode {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        type_name: impl Into<String>,
        task: Arc<dyn ReportingTask>,
        extension: Arc<ExtensionContext>,
    ) -> Self {
        let type_name = type_name.into();
        Self {
            id: id.into(),
            name: RwLock::new(type_name.clone()),
            type_name,
            task,
            extension,
            strategy: RwLock::new(SchedulingStrategy::TimerDriven),
            period: RwLock::new(Duration::from_secs(60)),
            cron_expression: RwLock::new(None),
            state: RwLock::new(ScheduledState::Stopped),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    #[must_use]
    pub fn task(&self) -> &Arc<dyn ReportingTask> {
        &self.task
    }

    #[must_use]
    pub fn extension(&self) -> &Arc<ExtensionContext> {
        &self.extension
    }

    #[must_use]
    pub fn scheduling_strategy(&self) -> SchedulingStrategy {
        *self.strategy.read()
    }

    pub fn set_scheduling_strategy(&self, strategy: SchedulingStrategy) {
        *self.strategy.write() = strategy;
    }

    #[must_use]
    pub fn scheduling_period(&self) -> Duration {
        *self.period.read()
    }

    pub fn set_scheduling_period(&self, period: Duration) {
        *self.period.write() = period;
    }

    #[must_use]
    pub fn cron_expression(&self) -> Option<String> {
        self.cron_expression.read().clone()
    }

    pub fn set_cron_expression(&self, expression: Option<String>) {
        *self.cron_expression.write() = expression;
    }

    #[must_use]
    pub fn scheduled_state(&self) -> ScheduledState {
        *self.state.read()
    }

    pub(crate) fn store_scheduled_state(&self, state: ScheduledState) {
        *self.state.write() = state;
    }
}

impl fmt::Debug for ReportingTaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportingTaskNode")
            .field("id", &self.id)
            .field("type_name", &self.type_name)
            .field("state", &self.scheduled_state())
            .finish()
    }
}

type ProcessorFactory = Arc<dyn Fn() -> Arc<dyn Processor> + Send + Sync>;
type ReportingTaskFactory = Arc<dyn Fn() -> Arc<dyn ReportingTask> + Send + Sync>;

struct ProcessorRegistration {
    factory: ProcessorFactory,
    extension: Arc<ExtensionContext>,
}

struct ReportingTaskRegistration {
    factory: ReportingTaskFactory,
    extension: Arc<ExtensionContext>,
}

/// Registry of plug-in types, keyed by type name.
///
/// Stands in for the external extension manager: the embedding application
/// registers factories at startup, the controller resolves them at graph
/// construction time. Construction runs inside the plug-in's extension
/// scope.
#[derive(Default)]
pub struct PluginRegistry {
    processors: RwLock<FxHashMap<String, ProcessorRegistration>>,
    prioritizers: RwLock<FxHashMap<String, Arc<dyn FlowFilePrioritizer>>>,
    reporting_tasks: RwLock<FxHashMap<String, ReportingTaskRegistration>>,
}

impl PluginRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_processor(
        &self,
        type_name: impl Into<String>,
        extension: Arc<ExtensionContext>,
        factory: impl Fn() -> Arc<dyn Processor> + Send + Sync + 'static,
    ) {
        self.processors.write().insert(
            type_name.into(),
            ProcessorRegistration {
                factory: Arc::new(factory),
                extension,
            },
        );
    }

    pub fn register_prioritizer(
        &self,
        type_name: impl Into<String>,
        prioritizer: Arc<dyn FlowFilePrioritizer>,
    ) {
        self.prioritizers.write().insert(type_name.into(), prioritizer);
    }

    pub fn register_reporting_task(
        &self,
        type_name: impl Into<String>,
        extension: Arc<ExtensionContext>,
        factory: impl Fn() -> Arc<dyn ReportingTask> + Send + Sync + 'static,
    ) {
        self.reporting_tasks.write().insert(
            type_name.into(),
            ReportingTaskRegistration {
                factory: Arc::new(factory),
                extension,
            },
        );
    }

    #[must_use]
    pub fn has_processor(&self, type_name: &str) -> bool {
        self.processors.read().contains_key(type_name)
    }

    #[must_use]
    pub fn has_prioritizer(&self, type_name: &str) -> bool {
        self.prioritizers.read().contains_key(type_name)
    }

    #[must_use]
    pub fn processor_types(&self) -> Vec<String> {
        self.processors.read().keys().cloned().collect()
    }

    /// Construct a processor instance inside its extension scope.
    pub fn create_processor(
        &self,
        type_name: &str,
    ) -> Result<(Arc<dyn Processor>, Arc<ExtensionContext>), PluginError> {
        let (factory, extension) = {
            let processors = self.processors.read();
            let registration = processors.get(type_name).ok_or_else(|| {
                PluginError::UnknownProcessorType {
                    type_name: type_name.to_string(),
                }
            })?;
            (registration.factory.clone(), registration.extension.clone())
        };
        let plugin = extension.sync_scope(|| factory());
        Ok((plugin, extension))
    }

    pub fn prioritizer(
        &self,
        type_name: &str,
    ) -> Result<Arc<dyn FlowFilePrioritizer>, PluginError> {
        self.prioritizers
            .read()
            .get(type_name)
            .cloned()
            .ok_or_else(|| PluginError::UnknownPrioritizerType {
                type_name: type_name.to_string(),
            })
    }

    pub fn create_reporting_task(
        &self,
        type_name: &str,
    ) -> Result<(Arc<dyn ReportingTask>, Arc<ExtensionContext>), PluginError> {
        let (factory, extension) = {
            let tasks = self.reporting_tasks.read();
            let registration = tasks.get(type_name).ok_or_else(|| {
                PluginError::UnknownReportingTaskType {
                    type_name: type_name.to_string(),
                }
            })?;
            (registration.factory.clone(), registration.extension.clone())
        };
        let task = extension.sync_scope(|| factory());
        Ok((task, extension))
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("processors", &self.processors.read().len())
            .field("prioritizers", &self.prioritizers.read().len())
            .field("reporting_tasks", &self.reporting_tasks.read().len())
            .finish()
    }
}
