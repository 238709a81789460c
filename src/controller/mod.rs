//! The controller façade: the single entry point that owns the live graph,
//! the scheduler, the periodic framework tasks, and the cluster state.
//!
//! Mutations take the controller's write lock; queries take the read lock.
//! Worker triggers never touch this lock — they rely on connection
//! endpoints being immutable and on stop-before-remove discipline.

pub mod heartbeat;
pub mod replay;
pub mod snippet;
pub mod status;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::instrument;
use uuid::Uuid;

use miette::Diagnostic;
use thiserror::Error;

use crate::model::claim::ContentClaimManager;
use crate::model::connectable::{Connectable, ProcessorHandle, ANONYMOUS_RELATIONSHIP};
use crate::model::connection::Connection;
use crate::model::group::{GroupError, Label, ProcessGroup, RemoteProcessGroup};
use crate::model::queue::QueueSize;
use crate::plugin::{PluginError, PluginRegistry, ReportingTaskNode};
use crate::repository::{
    Bulletin, ComponentStatusRepository, ContentRepository, Counter, CounterRepository,
    FlowFileEventRepository, FlowFileRepository, NodeProtocolSender, ProvenanceRepository,
    RepositoryError, SiteToSiteClient, SwapManager, VolatileBulletinRepository,
};
use crate::scheduling::engine::{FlowEngine, PeriodicHandle};
use crate::scheduling::event_queue::EventDrivenWorkerQueue;
use crate::scheduling::session::{expire_queue, SessionFactory};
use crate::scheduling::{lifecycle, LifecycleError, ProcessScheduler, ScheduleError};
use crate::settings::{EngineSettings, SettingsError, TlsContext};
use crate::types::{ConnectableKind, Position, SchedulingStrategy};

use self::heartbeat::{
    HeartbeatBean, HeartbeatMessage, HeartbeatPayload, HeartbeatSlot, SystemDiagnostics,
};
use self::replay::ReplayError;
use self::snippet::SnippetError;
use self::status::{
    aggregate_group_status, ConnectionStatus, ProcessGroupStatus, ProcessorStatus,
    RemoteGroupStatus,
};

const DEFAULT_TIMER_THREADS: usize = 10;
const DEFAULT_EVENT_THREADS: usize = 5;
const CLUSTER_TASK_THREADS: usize = 3;
const FRAMEWORK_TASK_PERIOD: Duration = Duration::from_secs(30);
const HEARTBEAT_SEND_PERIOD: Duration = Duration::from_millis(250);
const BULLETIN_SEND_PERIOD: Duration = Duration::from_secs(2);

/// Umbrella error for façade operations.
#[derive(Debug, Error, Diagnostic)]
pub enum ControllerError {
    #[error("identifier {id} is already in use")]
    #[diagnostic(code(floweave::controller::duplicate_id))]
    DuplicateId { id: String },

    #[error("unknown component: {id}")]
    #[diagnostic(code(floweave::controller::unknown_component))]
    UnknownComponent { id: String },

    #[error("unknown process group: {id}")]
    #[diagnostic(code(floweave::controller::unknown_group))]
    UnknownGroup { id: String },

    #[error("connection must subscribe to at least one relationship")]
    #[diagnostic(code(floweave::controller::empty_relationships))]
    EmptyRelationships,

    #[error("source {source_id} does not declare relationship {relationship:?}")]
    #[diagnostic(code(floweave::controller::unknown_relationship))]
    UnknownRelationship {
        source_id: String,
        relationship: String,
    },

    #[error("controller is not configured for clustering")]
    #[diagnostic(code(floweave::controller::not_clustered))]
    NotConfiguredForClustering,

    #[error("controller already stopped or still stopping")]
    #[diagnostic(code(floweave::controller::terminated))]
    AlreadyTerminated,

    #[error(transparent)]
    #[diagnostic(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Group(#[from] GroupError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Snippet(#[from] SnippetError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Replay(#[from] ReplayError),

    #[error(transparent)]
    #[diagnostic(code(floweave::controller::repository))]
    Repository(#[from] RepositoryError),
}

/// Null-means-unchanged update record for processors.
#[derive(Clone, Debug, Default)]
pub struct UpdateProcessor {
    pub name: Option<String>,
    pub comments: Option<String>,
    pub position: Option<Position>,
    pub scheduling_strategy: Option<SchedulingStrategy>,
    pub scheduling_period: Option<Duration>,
    pub cron_expression: Option<String>,
    pub max_concurrent_tasks: Option<usize>,
    pub yield_period: Option<Duration>,
    pub penalization_period: Option<Duration>,
    pub properties: Option<FxHashMap<String, String>>,
    pub auto_terminated: Option<FxHashSet<String>>,
}

/// Null-means-unchanged update record for connections.
#[derive(Clone, Debug, Default)]
pub struct UpdateConnection {
    pub name: Option<Option<String>>,
    pub relationships: Option<FxHashSet<String>>,
    pub back_pressure_object_threshold: Option<usize>,
    pub back_pressure_byte_threshold: Option<u64>,
    pub flowfile_expiration: Option<Duration>,
    pub prioritizers: Option<Vec<String>>,
    pub bend_points: Option<Vec<Position>>,
}

/// Outcome of [`FlowController::shutdown`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Whether both worker pools drained within the budget.
    pub clean: bool,
}

struct ClusterState {
    clustered: bool,
    primary: bool,
    connected: bool,
}

struct HeartbeatTasks {
    generator: Arc<PeriodicHandle>,
    sender: Arc<PeriodicHandle>,
    bulletins: Arc<PeriodicHandle>,
}

/// Builder for [`FlowController`].
pub struct FlowControllerBuilder {
    node_id: String,
    settings: EngineSettings,
    registry: Arc<PluginRegistry>,
    flowfile_repository: Option<Arc<dyn FlowFileRepository>>,
    content_repository: Option<Arc<dyn ContentRepository>>,
    provenance_repository: Option<Arc<dyn ProvenanceRepository>>,
    event_repository: Option<Arc<dyn FlowFileEventRepository>>,
    component_status_repository: Option<Arc<dyn ComponentStatusRepository>>,
    swap_manager: Option<Arc<dyn SwapManager>>,
    protocol_sender: Option<Arc<dyn NodeProtocolSender>>,
    site_to_site_client: Option<Arc<dyn SiteToSiteClient>>,
    tls: Option<TlsContext>,
}

impl FlowControllerBuilder {
    #[must_use]
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            settings: EngineSettings::default(),
            registry: Arc::new(PluginRegistry::new()),
            flowfile_repository: None,
            content_repository: None,
            provenance_repository: None,
            event_repository: None,
            component_status_repository: None,
            swap_manager: None,
            protocol_sender: None,
            site_to_site_client: None,
            tls: None,
        }
    }

    #[must_use]
    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn registry(mut self, registry: Arc<PluginRegistry>) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn flowfile_repository(mut self, repository: Arc<dyn FlowFileRepository>) -> Self {
        self.flowfile_repository = Some(repository);
        self
    }

    #[must_use]
    pub fn content_repository(mut self, repository: Arc<dyn ContentRepository>) -> Self {
        self.content_repository = Some(repository);
        self
    }

    #[must_use]
    pub fn provenance_repository(mut self, repository: Arc<dyn ProvenanceRepository>) -> Self {
        self.provenance_repository = Some(repository);
        self
    }

    #[must_use]
    pub fn event_repository(mut self, repository: Arc<dyn FlowFileEventRepository>) -> Self {
        self.event_repository = Some(repository);
        self
    }

    #[must_use]
    pub fn component_status_repository(
        mut self,
        repository: Arc<dyn ComponentStatusRepository>,
    ) -> Self {
        self.component_status_repository = Some(repository);
        self
    }

    #[must_use]
    pub fn swap_manager(mut self, swap_manager: Arc<dyn SwapManager>) -> Self {
        self.swap_manager = Some(swap_manager);
        self
    }

    #[must_use]
    pub fn site_to_site_client(mut self, client: Arc<dyn SiteToSiteClient>) -> Self {
        self.site_to_site_client = Some(client);
        self
    }

    #[must_use]
    pub fn tls_context(mut self, tls: TlsContext) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Build a controller that never participates in a cluster.
    pub fn build_standalone(self) -> Result<Arc<FlowController>, ControllerError> {
        FlowController::build(self, false, None)
    }

    /// Build a cluster member. The protocol sender carries heartbeats and
    /// bulletins to the cluster manager.
    pub fn build_clustered(
        mut self,
        protocol_sender: Arc<dyn NodeProtocolSender>,
    ) -> Result<Arc<FlowController>, ControllerError> {
        self.protocol_sender = Some(protocol_sender.clone());
        FlowController::build(self, true, Some(protocol_sender))
    }
}

/// The in-process controller owning the live flow graph.
pub struct FlowController {
    node_id: String,
    settings: EngineSettings,
    lock: RwLock<ClusterState>,
    root_group: Arc<ProcessGroup>,
    ids: Mutex<FxHashSet<String>>,
    registry: Arc<PluginRegistry>,
    scheduler: Arc<ProcessScheduler>,
    timer_engine: Arc<FlowEngine>,
    event_engine: Arc<FlowEngine>,
    cluster_engine: Arc<FlowEngine>,
    session_factory: Arc<SessionFactory>,
    flowfile_repository: Arc<dyn FlowFileRepository>,
    content_repository: Arc<dyn ContentRepository>,
    provenance_repository: Arc<dyn ProvenanceRepository>,
    event_repository: Arc<dyn FlowFileEventRepository>,
    component_status_repository: Arc<dyn ComponentStatusRepository>,
    bulletin_repository: Arc<VolatileBulletinRepository>,
    swap_manager: Option<Arc<dyn SwapManager>>,
    protocol_sender: Option<Arc<dyn NodeProtocolSender>>,
    site_to_site_client: Option<Arc<dyn SiteToSiteClient>>,
    counters: Arc<CounterRepository>,
    claim_manager: Arc<ContentClaimManager>,
    reporting_tasks: Mutex<FxHashMap<String, Arc<ReportingTaskNode>>>,
    configured_for_clustering: bool,
    heartbeat_bean: RwLock<HeartbeatBean>,
    heartbeat_slot: Arc<HeartbeatSlot>,
    heartbeats_suspended: Arc<AtomicBool>,
    heartbeat_tasks: Mutex<Option<HeartbeatTasks>>,
    deferred_starts: Mutex<Vec<Arc<Connectable>>>,
    initialized: AtomicBool,
    terminated: AtomicBool,
    system_start_time: DateTime<Utc>,
    start_instant: Instant,
}

impl FlowController {
    fn build(
        builder: FlowControllerBuilder,
        configured_for_clustering: bool,
        protocol_sender: Option<Arc<dyn NodeProtocolSender>>,
    ) -> Result<Arc<Self>, ControllerError> {
        builder.settings.verify_site_to_site(builder.tls.as_ref())?;

        let flowfile_repository = builder
            .flowfile_repository
            .ok_or_else(|| RepositoryError::Other("flow-file repository is required".into()))?;
        let content_repository = builder
            .content_repository
            .ok_or_else(|| RepositoryError::Other("content repository is required".into()))?;
        let provenance_repository = builder
            .provenance_repository
            .ok_or_else(|| RepositoryError::Other("provenance repository is required".into()))?;
        let event_repository = builder.event_repository.unwrap_or_else(|| {
            Arc::new(crate::repository::RingFlowFileEventRepository::new())
        });
        let component_status_repository = builder
            .component_status_repository
            .unwrap_or_else(|| Arc::new(status::VolatileComponentStatusRepository::default()));

        let claim_manager = Arc::new(ContentClaimManager::new());
        let counters = Arc::new(CounterRepository::new());
        let bulletin_repository = Arc::new(VolatileBulletinRepository::default());

        let timer_engine = FlowEngine::new("timer-driven", DEFAULT_TIMER_THREADS);
        let event_engine = FlowEngine::new("event-driven", DEFAULT_EVENT_THREADS);
        let cluster_engine = FlowEngine::new("cluster-tasks", CLUSTER_TASK_THREADS);

        let worker_queue = Arc::new(EventDrivenWorkerQueue::new(false, configured_for_clustering));
        let session_factory = Arc::new(SessionFactory {
            flowfile_repository: flowfile_repository.clone(),
            content_repository: content_repository.clone(),
            provenance_repository: provenance_repository.clone(),
            event_repository: event_repository.clone(),
            counters: counters.clone(),
            claim_manager: claim_manager.clone(),
        });
        let scheduler = ProcessScheduler::new(
            timer_engine.clone(),
            event_engine.clone(),
            worker_queue,
            session_factory.clone(),
            builder.settings.schedule_minimum,
        );

        let root_group = Arc::new(ProcessGroup::new(
            Uuid::new_v4().to_string(),
            "Flow",
            None,
        ));
        let mut ids = FxHashSet::default();
        ids.insert(root_group.id().to_string());

        let heartbeat_bean = HeartbeatBean {
            root_group: root_group.clone(),
            primary: false,
            connected: false,
        };

        Ok(Arc::new(Self {
            node_id: builder.node_id,
            settings: builder.settings,
            lock: RwLock::new(ClusterState {
                clustered: configured_for_clustering,
                primary: false,
                connected: false,
            }),
            root_group,
            ids: Mutex::new(ids),
            registry: builder.registry,
            scheduler,
            timer_engine,
            event_engine,
            cluster_engine,
            session_factory,
            flowfile_repository,
            content_repository,
            provenance_repository,
            event_repository,
            component_status_repository,
            bulletin_repository,
            swap_manager: builder.swap_manager,
            protocol_sender,
            site_to_site_client: builder.site_to_site_client,
            counters,
            claim_manager,
            reporting_tasks: Mutex::new(FxHashMap::default()),
            configured_for_clustering,
            heartbeat_bean: RwLock::new(heartbeat_bean),
            heartbeat_slot: Arc::new(HeartbeatSlot::new()),
            heartbeats_suspended: Arc::new(AtomicBool::new(false)),
            heartbeat_tasks: Mutex::new(None),
            deferred_starts: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            system_start_time: Utc::now(),
            start_instant: Instant::now(),
        }))
    }

    // ---- identity & simple queries ---------------------------------------

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    #[must_use]
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn bulletin_repository(&self) -> &Arc<VolatileBulletinRepository> {
        &self.bulletin_repository
    }

    #[must_use]
    pub fn claim_manager(&self) -> &Arc<ContentClaimManager> {
        &self.claim_manager
    }

    #[must_use]
    pub fn root_group(&self) -> &Arc<ProcessGroup> {
        &self.root_group
    }

    #[must_use]
    pub fn root_group_id(&self) -> &str {
        self.root_group.id()
    }

    #[must_use]
    pub fn group(&self, group_id: &str) -> Option<Arc<ProcessGroup>> {
        let _read = self.lock.read();
        self.root_group.find_group(group_id)
    }

    #[must_use]
    pub fn find_connectable(&self, id: &str) -> Option<Arc<Connectable>> {
        let _read = self.lock.read();
        self.root_group.find_connectable(id)
    }

    /// The live connection owning the given queue identifier, if any.
    #[must_use]
    pub fn find_connection(&self, queue_id: &str) -> Option<Arc<Connection>> {
        let _read = self.lock.read();
        self.root_group
            .find_all_connections()
            .into_iter()
            .find(|connection| connection.id() == queue_id)
    }

    #[must_use]
    pub fn all_queue_sizes(&self) -> QueueSize {
        let _read = self.lock.read();
        self.root_group.total_queued()
    }

    #[must_use]
    pub fn counters(&self) -> Vec<Arc<Counter>> {
        self.counters.counters()
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_clustered(&self) -> bool {
        self.lock.read().clustered
    }

    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.lock.read().primary
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.lock.read().connected
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        self.settings.heartbeat_interval
    }

    #[must_use]
    pub fn max_timer_driven_threads(&self) -> usize {
        self.timer_engine.max_tasks()
    }

    /// Resize the timer pool. Shrinking takes effect as in-flight triggers
    /// complete.
    pub fn set_max_timer_driven_threads(&self, max: usize) {
        self.timer_engine.set_max_tasks(max);
    }

    #[must_use]
    pub fn max_event_driven_threads(&self) -> usize {
        self.event_engine.max_tasks()
    }

    /// Resize the event pool. Shrinking takes effect as in-flight triggers
    /// complete.
    pub fn set_max_event_driven_threads(&self, max: usize) {
        self.event_engine.set_max_tasks(max);
    }

    // ---- creation --------------------------------------------------------

    /// Create a child process group.
    #[instrument(skip(self), err)]
    pub fn create_process_group(
        &self,
        parent_group_id: &str,
        id: &str,
        name: &str,
    ) -> Result<Arc<ProcessGroup>, ControllerError> {
        let _write = self.lock.write();
        let parent = self.require_group(parent_group_id)?;
        self.claim_id(id)?;
        let group = Arc::new(ProcessGroup::new(
            id,
            name,
            Some(parent_group_id.to_string()),
        ));
        parent.add_group(group.clone());
        Ok(group)
    }

    /// Create a processor of the given registered type and add it to the
    /// group. The plug-in's `on_added` hook runs exactly once, inside its
    /// extension scope.
    #[instrument(skip(self), err)]
    pub fn create_processor(
        &self,
        group_id: &str,
        type_name: &str,
        id: &str,
        name: &str,
    ) -> Result<Arc<Connectable>, ControllerError> {
        eprintln!("DEBUG create_processor: before write lock {}", id);
        let _write = self.lock.write();
        eprintln!("DEBUG create_processor: got write lock {}", id);
        let group = self.require_group(group_id)?;
        self.claim_id(id)?;

        let (plugin, extension) = match self.registry.create_processor(type_name) {
            Ok(created) => created,
            Err(error) => {
                self.release_id(id);
                return Err(error.into());
            }
        };
        let handle = ProcessorHandle::new(type_name, plugin, extension);
        let connectable = Arc::new(
            Connectable::new(id, ConnectableKind::Processor, name).with_processor(handle),
        );
        if let Some(handle) = connectable.processor() {
            handle.extension.sync_scope(|| handle.plugin.on_added());
        }
        group.add_processor(connectable.clone());
        Ok(connectable)
    }

    /// Create an input port. In the root group this yields a site-to-site
    /// reachable root port.
    #[instrument(skip(self), err)]
    pub fn create_local_input_port(
        &self,
        group_id: &str,
        id: &str,
        name: &str,
    ) -> Result<Arc<Connectable>, ControllerError> {
        self.create_port(group_id, id, name, true)
    }

    /// Create an output port. In the root group this yields a site-to-site
    /// reachable root port.
    #[instrument(skip(self), err)]
    pub fn create_local_output_port(
        &self,
        group_id: &str,
        id: &str,
        name: &str,
    ) -> Result<Arc<Connectable>, ControllerError> {
        self.create_port(group_id, id, name, false)
    }

    fn create_port(
        &self,
        group_id: &str,
        id: &str,
        name: &str,
        input: bool,
    ) -> Result<Arc<Connectable>, ControllerError> {
        let _write = self.lock.write();
        let group = self.require_group(group_id)?;
        self.claim_id(id)?;
        let kind = match (input, group.is_root()) {
            (true, true) => ConnectableKind::RootInputPort,
            (true, false) => ConnectableKind::InputPort,
            (false, true) => ConnectableKind::RootOutputPort,
            (false, false) => ConnectableKind::OutputPort,
        };
        let port = Arc::new(Connectable::new(id, kind, name));
        let added = if input {
            group.add_input_port(port.clone())
        } else {
            group.add_output_port(port.clone())
        };
        if let Err(error) = added {
            self.release_id(id);
            return Err(error.into());
        }
        Ok(port)
    }

    #[instrument(skip(self), err)]
    pub fn create_funnel(
        &self,
        group_id: &str,
        id: &str,
    ) -> Result<Arc<Connectable>, ControllerError> {
        let _write = self.lock.write();
        let group = self.require_group(group_id)?;
        self.claim_id(id)?;
        let funnel = Arc::new(Connectable::new(id, ConnectableKind::Funnel, "Funnel"));
        group.add_funnel(funnel.clone());
        Ok(funnel)
    }

    #[instrument(skip(self, text), err)]
    pub fn create_label(
        &self,
        group_id: &str,
        id: &str,
        text: &str,
    ) -> Result<Arc<Label>, ControllerError> {
        let _write = self.lock.write();
        let group = self.require_group(group_id)?;
        self.claim_id(id)?;
        let label = Arc::new(Label::new(id, text));
        group.add_label(label.clone());
        Ok(label)
    }

    #[instrument(skip(self), err)]
    pub fn create_remote_process_group(
        &self,
        group_id: &str,
        id: &str,
        target_uri: &str,
    ) -> Result<Arc<RemoteProcessGroup>, ControllerError> {
        let _write = self.lock.write();
        let group = self.require_group(group_id)?;
        self.claim_id(id)?;
        let remote = Arc::new(RemoteProcessGroup::new(id, target_uri));
        if let Some(client) = &self.site_to_site_client {
            remote.set_client(client.clone());
        }
        group.add_remote_group(remote.clone());
        Ok(remote)
    }

    #[instrument(skip(self), err)]
    pub fn create_reporting_task(
        &self,
        type_name: &str,
        id: &str,
    ) -> Result<Arc<ReportingTaskNode>, ControllerError> {
        let _write = self.lock.write();
        self.claim_id(id)?;
        let (task, extension) = match self.registry.create_reporting_task(type_name) {
            Ok(created) => created,
            Err(error) => {
                self.release_id(id);
                return Err(error.into());
            }
        };
        let node = Arc::new(ReportingTaskNode::new(id, type_name, task, extension));
        self.reporting_tasks
            .lock()
            .insert(id.to_string(), node.clone());
        Ok(node)
    }

    /// Create a connection. The relationship set must be non-empty and
    /// declared by the source; connections from ports and funnels default
    /// to the anonymous relationship when an empty set is given.
    #[instrument(skip(self, relationships), err)]
    pub fn create_connection(
        &self,
        group_id: &str,
        id: &str,
        source_id: &str,
        destination_id: &str,
        relationships: FxHashSet<String>,
    ) -> Result<Arc<Connection>, ControllerError> {
        eprintln!("DEBUG create_connection: before write lock {}", id);
        let _write = self.lock.write();
        eprintln!("DEBUG create_connection: got write lock {}", id);
        let group = self.require_group(group_id)?;
        let source = self
            .root_group
            .find_connectable(source_id)
            .ok_or_else(|| ControllerError::UnknownComponent {
                id: source_id.to_string(),
            })?;
        let destination = self
            .root_group
            .find_connectable(destination_id)
            .ok_or_else(|| ControllerError::UnknownComponent {
                id: destination_id.to_string(),
            })?;

        let relationships = if relationships.is_empty() {
            if source.kind().is_processor() {
                return Err(ControllerError::EmptyRelationships);
            }
            FxHashSet::from_iter([ANONYMOUS_RELATIONSHIP.to_string()])
        } else {
            relationships
        };
        let declared = source.relationships();
        for relationship in &relationships {
            if !declared.contains(relationship) {
                return Err(ControllerError::UnknownRelationship {
                    source_id: source_id.to_string(),
                    relationship: relationship.clone(),
                });
            }
        }

        self.claim_id(id)?;
        let connection = Connection::connect(id, source, destination.clone(), relationships);
        self.wire_readiness(&connection, destination);
        group.add_connection(connection.clone());
        Ok(connection)
    }

    fn wire_readiness(&self, connection: &Arc<Connection>, destination: Arc<Connectable>) {
        let scheduler = self.scheduler.clone();
        connection
            .queue()
            .set_readiness_callback(Arc::new(move || {
                scheduler.notify_ready(&destination);
            }));
    }

    // ---- updates ---------------------------------------------------------

    /// Apply a partial update; `None` fields are left unchanged.
    #[instrument(skip(self, update), err)]
    pub fn update_processor(
        &self,
        id: &str,
        update: UpdateProcessor,
    ) -> Result<(), ControllerError> {
        eprintln!("DEBUG update_processor: before write lock {}", id);
        let _write = self.lock.write();
        eprintln!("DEBUG update_processor: got write lock {}", id);
        let component = self
            .root_group
            .find_connectable(id)
            .ok_or_else(|| ControllerError::UnknownComponent { id: id.to_string() })?;

        if let Some(name) = update.name {
            component.set_name(name);
        }
        if let Some(comments) = update.comments {
            component.set_comments(comments);
        }
        if let Some(position) = update.position {
            component.set_position(position);
        }
        if let Some(strategy) = update.scheduling_strategy {
            component.set_scheduling_strategy(strategy);
        }
        if let Some(period) = update.scheduling_period {
            component.set_scheduling_period(period);
        }
        if let Some(expression) = update.cron_expression {
            component.set_cron_expression(Some(expression));
        }
        if let Some(max) = update.max_concurrent_tasks {
            component.set_max_concurrent_tasks(max);
        }
        if let Some(period) = update.yield_period {
            component.set_yield_period(period);
        }
        if let Some(period) = update.penalization_period {
            component.set_penalization_period(period);
        }
        if let Some(properties) = update.properties {
            if let Some(handle) = component.processor() {
                for (key, value) in properties {
                    handle.set_property(key, value);
                }
            }
        }
        if let Some(auto_terminated) = update.auto_terminated {
            if let Some(handle) = component.processor() {
                handle.set_auto_terminated(auto_terminated);
            }
        }
        Ok(())
    }

    /// Apply a partial update; `None` fields are left unchanged.
    #[instrument(skip(self, update), err)]
    pub fn update_connection(
        &self,
        id: &str,
        update: UpdateConnection,
    ) -> Result<(), ControllerError> {
        let _write = self.lock.write();
        let connection = self
            .root_group
            .find_all_connections()
            .into_iter()
            .find(|connection| connection.id() == id)
            .ok_or_else(|| ControllerError::UnknownComponent { id: id.to_string() })?;

        if let Some(relationships) = &update.relationships {
            if relationships.is_empty() {
                return Err(ControllerError::EmptyRelationships);
            }
            let declared = connection.source().relationships();
            for relationship in relationships {
                if !declared.contains(relationship) {
                    return Err(ControllerError::UnknownRelationship {
                        source_id: connection.source().id().to_string(),
                        relationship: relationship.clone(),
                    });
                }
            }
        }

        if let Some(name) = update.name {
            connection.set_name(name);
        }
        if let Some(relationships) = update.relationships {
            connection.set_relationships(relationships);
        }
        if let Some(threshold) = update.back_pressure_object_threshold {
            connection.queue().set_back_pressure_object_threshold(threshold);
        }
        if let Some(threshold) = update.back_pressure_byte_threshold {
            connection.queue().set_back_pressure_byte_threshold(threshold);
        }
        if let Some(expiration) = update.flowfile_expiration {
            connection.queue().set_flowfile_expiration(expiration);
        }
        if let Some(prioritizer_names) = update.prioritizers {
            let mut chain = Vec::with_capacity(prioritizer_names.len());
            for name in &prioritizer_names {
                chain.push(self.registry.prioritizer(name)?);
            }
            connection.queue().set_prioritizers(chain);
        }
        if let Some(bends) = update.bend_points {
            connection.set_bend_points(bends);
        }
        Ok(())
    }

    // ---- removal ---------------------------------------------------------

    /// Remove a processor, port, or funnel. It must be stopped; its
    /// `on_removed` hook runs exactly once.
    #[instrument(skip(self), err)]
    pub fn remove_connectable(&self, id: &str) -> Result<(), ControllerError> {
        let _write = self.lock.write();
        let owner = self
            .find_owning_group(id)
            .ok_or_else(|| ControllerError::UnknownComponent { id: id.to_string() })?;
        let component = owner.remove_connectable(id)?;
        for connection in component
            .incoming_connections()
            .into_iter()
            .chain(component.outgoing_connections())
        {
            tracing::warn!(
                connection = connection.id(),
                component = id,
                "removing component that still has attached connections"
            );
        }
        if let Some(handle) = component.processor() {
            handle.extension.sync_scope(|| handle.plugin.on_removed());
        }
        self.release_id(id);
        Ok(())
    }

    /// Remove a connection. Its queue must be empty.
    #[instrument(skip(self), err)]
    pub fn remove_connection(&self, id: &str) -> Result<(), ControllerError> {
        let _write = self.lock.write();
        let owner = self
            .find_owning_connection_group(id)
            .ok_or_else(|| ControllerError::UnknownComponent { id: id.to_string() })?;
        owner.remove_connection(id)?;
        self.release_id(id);
        Ok(())
    }

    // ---- lifecycle -------------------------------------------------------

    /// Start a processor. Before `initialize_flow` completes, the start is
    /// buffered and flushed by [`start_delayed`](Self::start_delayed).
    #[instrument(skip(self), err)]
    pub fn start_processor(&self, id: &str) -> Result<(), ControllerError> {
        self.start_connectable(id)
    }

    /// Start any processor, port, or funnel by id.
    pub fn start_connectable(&self, id: &str) -> Result<(), ControllerError> {
        eprintln!("DEBUG start_connectable: before write lock {}", id);
        let _write = self.lock.write();
        eprintln!("DEBUG start_connectable: got write lock {}", id);
        let component = self
            .root_group
            .find_connectable(id)
            .ok_or_else(|| ControllerError::UnknownComponent { id: id.to_string() })?;
        if !self.is_initialized() {
            lifecycle::verify_can_start(&component)?;
            self.deferred_starts.lock().push(component);
            return Ok(());
        }
        eprintln!("DEBUG start_connectable: calling start_now {}", id);
        let r = self.start_now(&component);
        eprintln!("DEBUG start_connectable: start_now done {}", id);
        r
    }

    fn start_now(&self, component: &Arc<Connectable>) -> Result<(), ControllerError> {
        lifecycle::start(component)?;
        if let Err(error) = self.scheduler.schedule(component) {
            // Undo the transition so the component is not marked Running
            // without an agent behind it.
            let _ = lifecycle::stop(component);
            return Err(error.into());
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub fn stop_processor(&self, id: &str) -> Result<(), ControllerError> {
        self.stop_connectable(id)
    }

    pub fn stop_connectable(&self, id: &str) -> Result<(), ControllerError> {
        let _write = self.lock.write();
        let component = self
            .root_group
            .find_connectable(id)
            .ok_or_else(|| ControllerError::UnknownComponent { id: id.to_string() })?;
        lifecycle::stop(&component)?;
        self.scheduler.unschedule(&component);
        Ok(())
    }

    pub fn enable_connectable(&self, id: &str) -> Result<(), ControllerError> {
        let _write = self.lock.write();
        let component = self
            .root_group
            .find_connectable(id)
            .ok_or_else(|| ControllerError::UnknownComponent { id: id.to_string() })?;
        lifecycle::enable(&component)?;
        Ok(())
    }

    pub fn disable_connectable(&self, id: &str) -> Result<(), ControllerError> {
        let _write = self.lock.write();
        let component = self
            .root_group
            .find_connectable(id)
            .ok_or_else(|| ControllerError::UnknownComponent { id: id.to_string() })?;
        lifecycle::disable(&component)?;
        Ok(())
    }

    /// Start every enabled component in the group, reporting tasks first,
    /// then processors and ports, then child groups. Individual failures
    /// are logged, not propagated.
    #[instrument(skip(self), err)]
    pub fn start_process_group(&self, group_id: &str) -> Result<(), ControllerError> {
        let group = {
            let _read = self.lock.read();
            self.require_group(group_id)?
        };
        if group.is_root() {
            let tasks: Vec<Arc<ReportingTaskNode>> =
                self.reporting_tasks.lock().values().cloned().collect();
            for node in tasks {
                if node.scheduled_state().is_disabled() {
                    continue;
                }
                if let Err(error) = self.start_reporting_task(node.id()) {
                    tracing::error!(task = node.id(), %error, "unable to start reporting task");
                }
            }
        }
        self.start_group_tree(&group);
        Ok(())
    }

    fn start_group_tree(&self, group: &Arc<ProcessGroup>) {
        for component in group.connectables() {
            if component.scheduled_state().is_disabled() {
                continue;
            }
            if component.scheduled_state().is_running() {
                continue;
            }
            if let Err(error) = self.start_connectable(component.id()) {
                tracing::error!(component = component.id(), %error, "unable to start component");
            }
        }
        for child in group.groups() {
            self.start_group_tree(&child);
        }
    }

    /// Stop every running component in the group, child groups first, then
    /// processors and ports, then (for the root) reporting tasks.
    #[instrument(skip(self), err)]
    pub fn stop_process_group(&self, group_id: &str) -> Result<(), ControllerError> {
        let group = {
            let _read = self.lock.read();
            self.require_group(group_id)?
        };
        self.stop_group_tree(&group);
        if group.is_root() {
            let tasks: Vec<Arc<ReportingTaskNode>> =
                self.reporting_tasks.lock().values().cloned().collect();
            for node in tasks {
                if node.scheduled_state().is_running() {
                    if let Err(error) = self.stop_reporting_task(node.id()) {
                        tracing::error!(task = node.id(), %error, "unable to stop reporting task");
                    }
                }
            }
        }
        Ok(())
    }

    fn stop_group_tree(&self, group: &Arc<ProcessGroup>) {
        for child in group.groups() {
            self.stop_group_tree(&child);
        }
        for component in group.connectables() {
            if component.scheduled_state().is_running() {
                if let Err(error) = self.stop_connectable(component.id()) {
                    tracing::error!(component = component.id(), %error, "unable to stop component");
                }
            }
        }
    }

    pub fn start_reporting_task(&self, id: &str) -> Result<(), ControllerError> {
        let node = self
            .reporting_tasks
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| ControllerError::UnknownComponent { id: id.to_string() })?;
        lifecycle::start_reporting_task(&node)?;
        if let Err(error) = self.scheduler.schedule_reporting_task(&node) {
            let _ = lifecycle::stop_reporting_task(&node);
            return Err(error.into());
        }
        Ok(())
    }

    pub fn stop_reporting_task(&self, id: &str) -> Result<(), ControllerError> {
        let node = self
            .reporting_tasks
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| ControllerError::UnknownComponent { id: id.to_string() })?;
        lifecycle::stop_reporting_task(&node)?;
        self.scheduler.unschedule_reporting_task(&node);
        Ok(())
    }

    // ---- initialisation & shutdown ---------------------------------------

    /// Bring the flow online: recover swapped and persisted flow files,
    /// clean the content repository, and start the periodic framework
    /// tasks. Failure here aborts startup.
    #[instrument(skip(self), err)]
    pub async fn initialize_flow(self: &Arc<Self>) -> Result<(), ControllerError> {
        let mut max_swap_id = 0u64;
        if let Some(swap_manager) = &self.swap_manager {
            if self.flowfile_repository.is_volatile() {
                swap_manager.purge().await?;
            } else {
                max_swap_id = swap_manager
                    .recover_swapped_flowfiles(self.claim_manager.clone())
                    .await?;
            }
        }

        self.flowfile_repository
            .initialize(self.claim_manager.clone())
            .await?;
        let max_id = self.flowfile_repository.load(max_swap_id + 1).await?;
        tracing::info!(max_flowfile_id = max_id, "flow-file repository loaded");

        // Loading restored the claimant counts, so superfluous content can go.
        self.content_repository.cleanup().await?;

        if let Some(swap_manager) = &self.swap_manager {
            swap_manager.start();
        }

        self.scheduler.start_event_workers(DEFAULT_EVENT_THREADS);
        self.start_framework_tasks();
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn start_framework_tasks(self: &Arc<Self>) {
        let controller = self.clone();
        self.timer_engine.schedule_with_fixed_delay(
            "refresh-remote-groups",
            Duration::ZERO,
            FRAMEWORK_TASK_PERIOD,
            move || {
                let controller = controller.clone();
                async move {
                    controller.refresh_remote_groups().await;
                }
            },
        );

        let controller = self.clone();
        self.timer_engine.schedule_with_fixed_delay(
            "expire-flowfiles",
            FRAMEWORK_TASK_PERIOD,
            FRAMEWORK_TASK_PERIOD,
            move || {
                let controller = controller.clone();
                async move {
                    controller.expire_flowfiles().await;
                }
            },
        );

        let controller = self.clone();
        self.timer_engine.schedule_with_fixed_delay(
            "capture-component-status",
            self.settings.status_snapshot_interval,
            self.settings.status_snapshot_interval,
            move || {
                let controller = controller.clone();
                async move {
                    let status = controller.controller_status();
                    controller.component_status_repository.capture(status);
                }
            },
        );
    }

    async fn refresh_remote_groups(&self) {
        let remotes = {
            let _read = self.lock.read();
            self.root_group.find_all_remote_groups()
        };
        for remote in remotes {
            if let Err(error) = remote.refresh_flow_contents().await {
                tracing::warn!(
                    remote = remote.id(),
                    target_uri = remote.target_uri(),
                    "unable to communicate with remote instance: {error}"
                );
                tracing::debug!(remote = remote.id(), ?error, "remote refresh failure detail");
            }
        }
    }

    async fn expire_flowfiles(&self) {
        let connections = {
            let _read = self.lock.read();
            self.root_group.find_all_connections()
        };
        for connection in connections {
            match expire_queue(&connection, &self.session_factory).await {
                Ok(0) => {}
                Ok(count) => {
                    tracing::info!(connection = connection.id(), count, "expired flow files");
                }
                Err(error) => {
                    tracing::warn!(connection = connection.id(), %error, "expiration sweep failed");
                }
            }
        }
        self.claim_manager.purge_unclaimed();
    }

    /// Flush the deferred-start buffer, in order. Disabled components are
    /// skipped; individual failures are logged and do not abort the flush.
    #[instrument(skip(self))]
    pub fn start_delayed(&self) {
        let _write = self.lock.write();
        let deferred: Vec<Arc<Connectable>> = self.deferred_starts.lock().drain(..).collect();
        tracing::info!(count = deferred.len(), "starting deferred processors/ports/funnels");
        for component in deferred {
            if component.scheduled_state().is_disabled() {
                continue;
            }
            if let Err(error) = self.start_now(&component) {
                tracing::error!(component = component.id(), %error, "unable to start component");
            }
        }
    }

    /// Stop the controller. Graceful shutdown waits half the configured
    /// budget per pool; kill aborts workers immediately. Either way every
    /// running component is stopped, periodic tasks are cancelled, and the
    /// delegated repositories are closed.
    #[instrument(skip(self), err)]
    pub async fn shutdown(self: &Arc<Self>, kill: bool) -> Result<ShutdownReport, ControllerError> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Err(ControllerError::AlreadyTerminated);
        }

        let _ = self.stop_process_group(&self.root_group_id().to_string());
        self.stop_heartbeat_tasks();
        self.scheduler.shutdown();
        self.root_group.shutdown();

        let budget = self.settings.graceful_shutdown / 2;
        let clean = if kill {
            tracing::info!("initiated immediate shutdown of flow controller");
            self.timer_engine.shutdown_now();
            self.event_engine.shutdown_now();
            self.cluster_engine.shutdown_now();
            false
        } else {
            tracing::info!(
                budget_seconds = self.settings.graceful_shutdown.as_secs(),
                "initiated graceful shutdown of flow controller"
            );
            let timer_clean = self.timer_engine.shutdown(budget).await;
            let event_clean = self.event_engine.shutdown(budget).await;
            self.cluster_engine.shutdown(Duration::from_secs(1)).await;
            timer_clean && event_clean
        };

        if let Err(error) = self.flowfile_repository.close().await {
            tracing::warn!(%error, "unable to shut down flow-file repository");
        }
        if let Some(swap_manager) = &self.swap_manager {
            swap_manager.shutdown();
        }
        if let Err(error) = self.content_repository.shutdown().await {
            tracing::warn!(%error, "unable to shut down content repository");
        }
        if let Err(error) = self.provenance_repository.close().await {
            tracing::warn!(%error, "unable to shut down provenance repository");
        }

        if clean {
            tracing::info!("controller has been terminated successfully");
        } else {
            tracing::warn!(
                "controller hasn't terminated properly; an uninterruptible worker may still be running"
            );
        }
        Ok(ShutdownReport { clean })
    }

    // ---- cluster state ---------------------------------------------------

    pub fn set_clustered(&self, clustered: bool) {
        let mut state = self.lock.write();
        if state.clustered == clustered {
            return;
        }
        state.clustered = clustered;
        self.scheduler.worker_queue().set_clustered(clustered);
        self.refresh_heartbeat_bean(&state);
    }

    pub fn set_primary(&self, primary: bool) {
        let mut state = self.lock.write();
        if state.primary == primary {
            return;
        }
        tracing::info!(from = state.primary, to = primary, "setting primary flag");
        state.primary = primary;
        self.scheduler.set_primary(primary);
        self.refresh_heartbeat_bean(&state);
    }

    pub fn set_connected(&self, connected: bool) {
        let mut state = self.lock.write();
        state.connected = connected;
        self.refresh_heartbeat_bean(&state);
    }

    fn refresh_heartbeat_bean(&self, state: &ClusterState) {
        *self.heartbeat_bean.write() = HeartbeatBean {
            root_group: self.root_group.clone(),
            primary: state.primary,
            connected: state.connected,
        };
    }

    // ---- heartbeating ----------------------------------------------------

    /// Begin heartbeating to the cluster manager. Idempotent over
    /// [`stop_heartbeating`](Self::stop_heartbeating): any running tasks
    /// are stopped first.
    #[instrument(skip(self), err)]
    pub fn start_heartbeating(self: &Arc<Self>) -> Result<(), ControllerError> {
        if !self.configured_for_clustering {
            return Err(ControllerError::NotConfiguredForClustering);
        }
        let Some(sender) = self.protocol_sender.clone() else {
            return Err(ControllerError::NotConfiguredForClustering);
        };

        let _write = self.lock.write();
        self.stop_heartbeat_tasks();

        let bulletin_feed = self.bulletin_repository.subscribe();
        let node_id = self.node_id.clone();
        let bulletin_sender = sender.clone();
        let bulletins = self.cluster_engine.schedule_with_fixed_delay(
            "bulletins",
            HEARTBEAT_SEND_PERIOD,
            BULLETIN_SEND_PERIOD,
            move || {
                let node_id = node_id.clone();
                let bulletin_feed = bulletin_feed.clone();
                let sender = bulletin_sender.clone();
                async move {
                    heartbeat::send_bulletins(&node_id, &bulletin_feed, &sender).await;
                }
            },
        );

        let controller = self.clone();
        let generator = self.cluster_engine.schedule_with_fixed_delay(
            "heartbeat-generator",
            Duration::ZERO,
            self.settings.heartbeat_interval,
            move || {
                let controller = controller.clone();
                async move {
                    if let Some(message) = controller.generate_heartbeat_message() {
                        controller.heartbeat_slot.store(message);
                        tracing::debug!(target: "floweave::heartbeat", "generated heartbeat");
                    }
                }
            },
        );

        let slot = self.heartbeat_slot.clone();
        let suspended = self.heartbeats_suspended.clone();
        let heartbeat_sender = self.cluster_engine.schedule_with_fixed_delay(
            "heartbeat-sender",
            HEARTBEAT_SEND_PERIOD,
            HEARTBEAT_SEND_PERIOD,
            move || {
                let slot = slot.clone();
                let suspended = suspended.clone();
                let sender = sender.clone();
                async move {
                    heartbeat::send_heartbeat(&slot, &suspended, &sender).await;
                }
            },
        );

        *self.heartbeat_tasks.lock() = Some(HeartbeatTasks {
            generator,
            sender: heartbeat_sender,
            bulletins,
        });
        Ok(())
    }

    /// Cancel the heartbeat tasks. A send already in flight completes.
    #[instrument(skip(self), err)]
    pub fn stop_heartbeating(&self) -> Result<(), ControllerError> {
        if !self.configured_for_clustering {
            return Err(ControllerError::NotConfiguredForClustering);
        }
        let _write = self.lock.write();
        self.stop_heartbeat_tasks();
        Ok(())
    }

    fn stop_heartbeat_tasks(&self) {
        if let Some(tasks) = self.heartbeat_tasks.lock().take() {
            tasks.generator.cancel();
            tasks.sender.cancel();
            tasks.bulletins.cancel();
        }
    }

    /// Temporarily stop transmitting without cancelling the tasks. Takes no
    /// lock; generation continues and the freshest snapshot still wins.
    pub fn suspend_heartbeats(&self) {
        self.heartbeats_suspended.store(true, Ordering::SeqCst);
    }

    /// Re-enable transmission after [`suspend_heartbeats`](Self::suspend_heartbeats).
    pub fn resume_heartbeats(&self) {
        self.heartbeats_suspended.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_heartbeating(&self) -> bool {
        self.heartbeat_tasks
            .lock()
            .as_ref()
            .is_some_and(|tasks| {
                !tasks.generator.is_cancelled() && !tasks.sender.is_cancelled()
            })
    }

    fn generate_heartbeat_message(&self) -> Option<HeartbeatMessage> {
        let bean = self.heartbeat_bean.read().clone();
        let report = self.event_repository.report_last_window();
        let group_status = aggregate_group_status(&bean.root_group, &report);
        let queued = bean.root_group.total_queued();

        let payload = HeartbeatPayload {
            system_start_time: self.system_start_time,
            active_thread_count: group_status.active_thread_count,
            total_flowfile_count: queued.object_count,
            total_flowfile_bytes: queued.byte_count,
            counters: self
                .counters
                .counters()
                .iter()
                .map(|counter| {
                    (
                        format!("{}:{}", counter.context, counter.name),
                        counter.value(),
                    )
                })
                .collect(),
            system_diagnostics: SystemDiagnostics {
                available_processors: std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1),
                uptime_millis: self.start_instant.elapsed().as_millis() as u64,
            },
            group_status,
            site_to_site_port: self.settings.remote_input_socket_port,
            site_to_site_secure: self.settings.site_to_site_secure,
        };

        Some(HeartbeatMessage {
            node_id: self.node_id.clone(),
            created: Utc::now(),
            primary: bean.primary,
            connected: bean.connected,
            payload,
        })
    }

    // ---- status ----------------------------------------------------------

    /// Aggregated status of the whole flow.
    #[must_use]
    pub fn controller_status(&self) -> ProcessGroupStatus {
        let _read = self.lock.read();
        let report = self.event_repository.report_last_window();
        aggregate_group_status(&self.root_group, &report)
    }

    /// Aggregated status of one group subtree.
    pub fn group_status(&self, group_id: &str) -> Result<ProcessGroupStatus, ControllerError> {
        let _read = self.lock.read();
        let group = self.require_group(group_id)?;
        let report = self.event_repository.report_last_window();
        Ok(aggregate_group_status(&group, &report))
    }

    #[must_use]
    pub fn connection_status_history(
        &self,
        connection_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        max_points: usize,
    ) -> Vec<ConnectionStatus> {
        self.component_status_repository
            .connection_status_history(connection_id, from, to, max_points)
    }

    #[must_use]
    pub fn processor_status_history(
        &self,
        processor_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        max_points: usize,
    ) -> Vec<ProcessorStatus> {
        self.component_status_repository
            .processor_status_history(processor_id, from, to, max_points)
    }

    #[must_use]
    pub fn group_status_history(
        &self,
        group_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        max_points: usize,
    ) -> Vec<ProcessGroupStatus> {
        self.component_status_repository
            .group_status_history(group_id, from, to, max_points)
    }

    #[must_use]
    pub fn remote_group_status_history(
        &self,
        remote_group_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        max_points: usize,
    ) -> Vec<RemoteGroupStatus> {
        self.component_status_repository
            .remote_group_status_history(remote_group_id, from, to, max_points)
    }

    /// Raise an operator-visible diagnostic.
    pub fn report_bulletin(&self, bulletin: Bulletin) {
        self.bulletin_repository.add(bulletin);
    }

    // ---- internals -------------------------------------------------------

    fn require_group(&self, group_id: &str) -> Result<Arc<ProcessGroup>, ControllerError> {
        self.root_group
            .find_group(group_id)
            .ok_or_else(|| ControllerError::UnknownGroup {
                id: group_id.to_string(),
            })
    }

    fn claim_id(&self, id: &str) -> Result<(), ControllerError> {
        let mut ids = self.ids.lock();
        if !ids.insert(id.to_string()) {
            return Err(ControllerError::DuplicateId { id: id.to_string() });
        }
        Ok(())
    }

    fn release_id(&self, id: &str) {
        self.ids.lock().remove(id);
    }

    fn id_in_use(&self, id: &str) -> bool {
        self.ids.lock().contains(id)
    }

    fn find_owning_group(&self, id: &str) -> Option<Arc<ProcessGroup>> {
        fn walk(group: &Arc<ProcessGroup>, id: &str) -> Option<Arc<ProcessGroup>> {
            if group
                .connectables()
                .iter()
                .any(|component| component.id() == id)
            {
                return Some(group.clone());
            }
            group.groups().into_iter().find_map(|child| walk(&child, id))
        }
        walk(&self.root_group, id)
    }

    fn find_owning_connection_group(&self, id: &str) -> Option<Arc<ProcessGroup>> {
        fn walk(group: &Arc<ProcessGroup>, id: &str) -> Option<Arc<ProcessGroup>> {
            if group
                .connections()
                .iter()
                .any(|connection| connection.id() == id)
            {
                return Some(group.clone());
            }
            group.groups().into_iter().find_map(|child| walk(&child, id))
        }
        walk(&self.root_group, id)
    }
}

impl std::fmt::Debug for FlowController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowController")
            .field("node_id", &self.node_id)
            .field("initialized", &self.is_initialized())
            .field("terminated", &self.is_terminated())
            .field("clustered", &self.is_clustered())
            .finish()
    }
}
