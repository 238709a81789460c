//! Shared fixtures: in-memory repositories, test processors, and a
//! controller builder wired with all of them.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use floweave::controller::heartbeat::{HeartbeatMessage, NodeBulletinsMessage};
use floweave::controller::{FlowController, FlowControllerBuilder};
use floweave::model::claim::{ContentClaim, ContentClaimManager};
use floweave::plugin::{
    ExtensionContext, PluginRegistry, Processor, ProcessorError, ReportingTask,
};
use floweave::repository::{
    ContentRepository, EventReporter, FlowFileRepository, NodeProtocolSender,
    ProvenanceEventRecord, ProvenanceRepository, RepositoryError, RepositoryUpdate,
};
use floweave::scheduling::ProcessSession;
use floweave::settings::EngineSettings;

/// Install the test-run tracing subscriber once. Controlled through
/// `RUST_LOG`; silent by default.
pub fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

// ---------------------------------------------------------------------------
// repositories
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryFlowFileRepository {
    sequence: AtomicU64,
    volatile: bool,
    pub updates: Mutex<Vec<RepositoryUpdate>>,
}

impl InMemoryFlowFileRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn volatile() -> Self {
        Self {
            volatile: true,
            ..Self::default()
        }
    }

    pub fn update_count(&self) -> usize {
        self.updates.lock().len()
    }
}

#[async_trait]
impl FlowFileRepository for InMemoryFlowFileRepository {
    async fn initialize(
        &self,
        _claim_manager: Arc<ContentClaimManager>,
    ) -> Result<(), RepositoryError> {
        Ok(())
    }

    async fn load(&self, starting_id: u64) -> Result<u64, RepositoryError> {
        self.sequence.store(starting_id, Ordering::SeqCst);
        Ok(starting_id)
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    async fn update(&self, batch: Vec<RepositoryUpdate>) -> Result<(), RepositoryError> {
        self.updates.lock().extend(batch);
        Ok(())
    }

    fn is_volatile(&self) -> bool {
        self.volatile
    }

    async fn close(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}

/// Content repository whose accessibility is scripted per claim.
#[derive(Default)]
pub struct InMemoryContentRepository {
    accessible: Mutex<FxHashMap<String, bool>>,
    fail_accessibility: Mutex<bool>,
}

impl InMemoryContentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(claim: &ContentClaim) -> String {
        format!("{}/{}/{}", claim.container(), claim.section(), claim.id())
    }

    pub fn mark_accessible(&self, container: &str, section: &str, id: &str) {
        self.accessible
            .lock()
            .insert(format!("{container}/{section}/{id}"), true);
    }

    pub fn mark_inaccessible(&self, container: &str, section: &str, id: &str) {
        self.accessible
            .lock()
            .insert(format!("{container}/{section}/{id}"), false);
    }

    /// Make every accessibility probe return an I/O error.
    pub fn fail_accessibility_checks(&self) {
        *self.fail_accessibility.lock() = true;
    }
}

#[async_trait]
impl ContentRepository for InMemoryContentRepository {
    async fn initialize(
        &self,
        _claim_manager: Arc<ContentClaimManager>,
    ) -> Result<(), RepositoryError> {
        Ok(())
    }

    async fn is_accessible(&self, claim: &ContentClaim) -> Result<bool, RepositoryError> {
        if *self.fail_accessibility.lock() {
            return Err(RepositoryError::Other("content repository offline".into()));
        }
        Ok(self
            .accessible
            .lock()
            .get(&Self::key(claim))
            .copied()
            .unwrap_or(false))
    }

    async fn read(&self, claim: &ContentClaim) -> Result<Vec<u8>, RepositoryError> {
        if self.is_accessible(claim).await? {
            Ok(Vec::new())
        } else {
            Err(RepositoryError::Other("claim not accessible".into()))
        }
    }

    async fn cleanup(&self) -> Result<(), RepositoryError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryProvenanceRepository {
    next_id: AtomicU64,
    pub events: Mutex<Vec<ProvenanceEventRecord>>,
}

impl InMemoryProvenanceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an event directly, returning its assigned id.
    pub fn seed(&self, mut event: ProvenanceEventRecord) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        event.id = id;
        self.events.lock().push(event);
        id
    }

    pub fn events_snapshot(&self) -> Vec<ProvenanceEventRecord> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl ProvenanceRepository for InMemoryProvenanceRepository {
    async fn initialize(
        &self,
        _reporter: Arc<dyn EventReporter>,
    ) -> Result<(), RepositoryError> {
        Ok(())
    }

    async fn register_event(
        &self,
        mut event: ProvenanceEventRecord,
    ) -> Result<u64, RepositoryError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        event.id = id;
        self.events.lock().push(event);
        Ok(id)
    }

    async fn get_event(&self, id: u64) -> Result<Option<ProvenanceEventRecord>, RepositoryError> {
        Ok(self
            .events
            .lock()
            .iter()
            .find(|event| event.id == id)
            .cloned())
    }

    async fn get_events(
        &self,
        first_id: u64,
        max: usize,
    ) -> Result<Vec<ProvenanceEventRecord>, RepositoryError> {
        Ok(self
            .events
            .lock()
            .iter()
            .filter(|event| event.id >= first_id)
            .take(max)
            .cloned()
            .collect())
    }

    async fn close(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}

/// Protocol sender that records everything and can be scripted to fail.
#[derive(Default)]
pub struct RecordingProtocolSender {
    pub heartbeats: Mutex<Vec<HeartbeatMessage>>,
    pub bulletins: Mutex<Vec<NodeBulletinsMessage>>,
    fail_unknown_address: Mutex<bool>,
}

impl RecordingProtocolSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn heartbeat_count(&self) -> usize {
        self.heartbeats.lock().len()
    }

    pub fn fail_with_unknown_address(&self) {
        *self.fail_unknown_address.lock() = true;
    }

    pub fn clear_failures(&self) {
        *self.fail_unknown_address.lock() = false;
    }
}

#[async_trait]
impl NodeProtocolSender for RecordingProtocolSender {
    async fn heartbeat(&self, message: HeartbeatMessage) -> Result<(), RepositoryError> {
        if *self.fail_unknown_address.lock() {
            return Err(RepositoryError::UnknownServiceAddress(
                "cluster manager address not yet known".into(),
            ));
        }
        self.heartbeats.lock().push(message);
        Ok(())
    }

    async fn send_bulletins(&self, message: NodeBulletinsMessage) -> Result<(), RepositoryError> {
        if *self.fail_unknown_address.lock() {
            return Err(RepositoryError::UnknownServiceAddress(
                "cluster manager address not yet known".into(),
            ));
        }
        self.bulletins.lock().push(message);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// processors
// ---------------------------------------------------------------------------

/// Declares "success" and does nothing per trigger.
#[derive(Default)]
pub struct NoopProcessor;

#[async_trait]
impl Processor for NoopProcessor {
    fn relationships(&self) -> Vec<String> {
        vec!["success".to_string()]
    }

    async fn on_trigger(&self, _session: &mut ProcessSession) -> Result<(), ProcessorError> {
        Ok(())
    }
}

/// Emits one fresh flow file to "success" per trigger.
#[derive(Default)]
pub struct GenerateProcessor;

#[async_trait]
impl Processor for GenerateProcessor {
    fn relationships(&self) -> Vec<String> {
        vec!["success".to_string()]
    }

    async fn on_trigger(&self, session: &mut ProcessSession) -> Result<(), ProcessorError> {
        let record = session.create(FxHashMap::default());
        session.transfer(record, "success");
        Ok(())
    }
}

/// Always fails, so penalisation paths can be observed.
#[derive(Default)]
pub struct FailingProcessor;

#[async_trait]
impl Processor for FailingProcessor {
    fn relationships(&self) -> Vec<String> {
        vec!["success".to_string()]
    }

    async fn on_trigger(&self, _session: &mut ProcessSession) -> Result<(), ProcessorError> {
        Err(ProcessorError::Failed("always fails".into()))
    }
}

/// Reporting task that counts its invocations.
pub struct CountingReportingTask {
    pub runs: Arc<AtomicU64>,
}

#[async_trait]
impl ReportingTask for CountingReportingTask {
    async fn on_trigger(&self) -> Result<(), ProcessorError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn test_registry() -> Arc<PluginRegistry> {
    let registry = Arc::new(PluginRegistry::new());
    registry.register_processor("NoopProcessor", ExtensionContext::new("noop"), || {
        Arc::new(NoopProcessor)
    });
    registry.register_processor("GenerateProcessor", ExtensionContext::new("generate"), || {
        Arc::new(GenerateProcessor)
    });
    registry.register_processor("FailingProcessor", ExtensionContext::new("failing"), || {
        Arc::new(FailingProcessor)
    });
    registry
}

// ---------------------------------------------------------------------------
// controller harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub controller: Arc<FlowController>,
    pub flowfiles: Arc<InMemoryFlowFileRepository>,
    pub content: Arc<InMemoryContentRepository>,
    pub provenance: Arc<InMemoryProvenanceRepository>,
    pub protocol: Option<Arc<RecordingProtocolSender>>,
}

impl Harness {
    pub fn root(&self) -> String {
        self.controller.root_group_id().to_string()
    }
}

fn base_builder(
    settings: EngineSettings,
) -> (
    FlowControllerBuilder,
    Arc<InMemoryFlowFileRepository>,
    Arc<InMemoryContentRepository>,
    Arc<InMemoryProvenanceRepository>,
) {
    init_tracing();
    let flowfiles = Arc::new(InMemoryFlowFileRepository::new());
    let content = Arc::new(InMemoryContentRepository::new());
    let provenance = Arc::new(InMemoryProvenanceRepository::new());
    let builder = FlowControllerBuilder::new("node-1")
        .settings(settings)
        .registry(test_registry())
        .flowfile_repository(flowfiles.clone())
        .content_repository(content.clone())
        .provenance_repository(provenance.clone());
    (builder, flowfiles, content, provenance)
}

/// A standalone controller with in-memory repositories, flow initialised.
pub async fn standalone_harness() -> Harness {
    standalone_harness_with(EngineSettings::default()).await
}

pub async fn standalone_harness_with(settings: EngineSettings) -> Harness {
    let (builder, flowfiles, content, provenance) = base_builder(settings);
    let controller = builder.build_standalone().expect("controller builds");
    controller
        .initialize_flow()
        .await
        .expect("flow initialises");
    Harness {
        controller,
        flowfiles,
        content,
        provenance,
        protocol: None,
    }
}

/// A clustered controller with a recording protocol sender.
pub async fn clustered_harness_with(settings: EngineSettings) -> Harness {
    let (builder, flowfiles, content, provenance) = base_builder(settings);
    let protocol = Arc::new(RecordingProtocolSender::new());
    let controller = builder
        .build_clustered(protocol.clone())
        .expect("controller builds");
    controller
        .initialize_flow()
        .await
        .expect("flow initialises");
    Harness {
        controller,
        flowfiles,
        content,
        provenance,
        protocol: Some(protocol),
    }
}

/// Poll until the predicate holds or the deadline passes.
pub async fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}
