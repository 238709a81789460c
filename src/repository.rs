//! Contracts for the external collaborators the engine is wired to.
//!
//! The core owns no durability. Everything below is dependency-injected at
//! controller construction: the flow-file repository (durable index), the
//! content repository (blob store), the provenance repository (append-only
//! audit log), the swap manager (overflow spill), the component status
//! repository (history reservoir), and the node protocol sender (cluster
//! transport). The bulletin repository and counter repository are the two
//! in-memory pieces the core carries itself.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::controller::heartbeat::{HeartbeatMessage, NodeBulletinsMessage};
use crate::controller::status::{
    ConnectionStatus, ProcessGroupStatus, ProcessorStatus, RemoteGroupStatus,
};
use crate::model::claim::{ContentClaim, ContentClaimManager};
use crate::model::flowfile::FlowFileRecord;
use crate::model::group::RemoteFlowContents;

/// Shared error type for repository operations.
#[derive(Debug, Error, Diagnostic)]
pub enum RepositoryError {
    #[error(transparent)]
    #[diagnostic(code(floweave::repository::io))]
    Io(#[from] std::io::Error),

    /// The cluster manager's service address is not yet known. Expected
    /// during failover; callers log at debug and move on.
    #[error("unknown service address: {0}")]
    #[diagnostic(code(floweave::repository::unknown_service_address))]
    UnknownServiceAddress(String),

    #[error("not authorized: {0}")]
    #[diagnostic(code(floweave::repository::authorization))]
    Authorization(String),

    #[error("{0}")]
    #[diagnostic(code(floweave::repository::other))]
    Other(String),
}

impl RepositoryError {
    #[must_use]
    pub fn is_unknown_service_address(&self) -> bool {
        matches!(self, Self::UnknownServiceAddress(_))
    }

    #[must_use]
    pub fn is_authorization(&self) -> bool {
        matches!(self, Self::Authorization(_))
    }
}

// ---------------------------------------------------------------------------
// provenance events
// ---------------------------------------------------------------------------

/// The kind of transformation a provenance event records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProvenanceEventType {
    Create,
    Receive,
    Send,
    Drop,
    Expire,
    Fork,
    Join,
    Clone,
    Route,
    AttributesModified,
    Replay,
}

/// Content-claim coordinates carried inside a provenance event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClaimCoordinates {
    pub container: String,
    pub section: String,
    pub identifier: String,
    pub offset: u64,
    pub size: u64,
}

/// An immutable audit record describing one transformation of a flow file.
#[derive(Clone, Debug)]
pub struct ProvenanceEventRecord {
    pub id: u64,
    pub event_type: ProvenanceEventType,
    pub event_time: DateTime<Utc>,
    pub flowfile_uuid: String,
    pub component_id: String,
    pub component_type: String,
    pub attributes: FxHashMap<String, String>,
    pub previous_attributes: FxHashMap<String, String>,
    pub lineage_identifiers: Vec<String>,
    pub lineage_start_date: DateTime<Utc>,
    pub previous_claim: Option<ClaimCoordinates>,
    pub current_claim: Option<ClaimCoordinates>,
    pub source_queue_identifier: Option<String>,
    pub parent_uuids: Vec<String>,
    pub child_uuids: Vec<String>,
    pub details: Option<String>,
}

impl ProvenanceEventRecord {
    /// Start a builder for the given type and flow-file UUID. The id is
    /// assigned by the provenance repository at registration.
    #[must_use]
    pub fn builder(
        event_type: ProvenanceEventType,
        flowfile_uuid: impl Into<String>,
    ) -> ProvenanceEventBuilder {
        ProvenanceEventBuilder {
            event: ProvenanceEventRecord {
                id: 0,
                event_type,
                event_time: Utc::now(),
                flowfile_uuid: flowfile_uuid.into(),
                component_id: String::new(),
                component_type: String::new(),
                attributes: FxHashMap::default(),
                previous_attributes: FxHashMap::default(),
                lineage_identifiers: Vec::new(),
                lineage_start_date: Utc::now(),
                previous_claim: None,
                current_claim: None,
                source_queue_identifier: None,
                parent_uuids: Vec::new(),
                child_uuids: Vec::new(),
                details: None,
            },
        }
    }
}

/// Builder for [`ProvenanceEventRecord`].
pub struct ProvenanceEventBuilder {
    event: ProvenanceEventRecord,
}

impl ProvenanceEventBuilder {
    #[must_use]
    pub fn component(mut self, id: impl Into<String>, component_type: impl Into<String>) -> Self {
        self.event.component_id = id.into();
        self.event.component_type = component_type.into();
        self
    }

    #[must_use]
    pub fn attributes(mut self, attributes: FxHashMap<String, String>) -> Self {
        self.event.attributes = attributes;
        self
    }

    #[must_use]
    pub fn previous_attributes(mut self, attributes: FxHashMap<String, String>) -> Self {
        self.event.previous_attributes = attributes;
        self
    }

    #[must_use]
    pub fn lineage(
        mut self,
        identifiers: Vec<String>,
        start_date: DateTime<Utc>,
    ) -> Self {
        self.event.lineage_identifiers = identifiers;
        self.event.lineage_start_date = start_date;
        self
    }

    #[must_use]
    pub fn previous_claim(mut self, claim: ClaimCoordinates) -> Self {
        self.event.previous_claim = Some(claim);
        self
    }

    #[must_use]
    pub fn current_claim(mut self, claim: ClaimCoordinates) -> Self {
        self.event.current_claim = Some(claim);
        self
    }

    #[must_use]
    pub fn source_queue(mut self, queue_id: impl Into<String>) -> Self {
        self.event.source_queue_identifier = Some(queue_id.into());
        self
    }

    #[must_use]
    pub fn parent_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.event.parent_uuids.push(uuid.into());
        self
    }

    #[must_use]
    pub fn child_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.event.child_uuids.push(uuid.into());
        self
    }

    #[must_use]
    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.event.details = Some(details.into());
        self
    }

    #[must_use]
    pub fn build(self) -> ProvenanceEventRecord {
        self.event
    }
}

// ---------------------------------------------------------------------------
// consumed repository contracts
// ---------------------------------------------------------------------------

/// One pending update for the flow-file repository: a record and the queue
/// it now lives on (`None` when the record left the flow).
#[derive(Clone, Debug)]
pub struct RepositoryUpdate {
    pub record: Arc<FlowFileRecord>,
    pub destination_queue: Option<String>,
}

/// Durable index of in-flight flow files.
#[async_trait]
pub trait FlowFileRepository: Send + Sync {
    async fn initialize(&self, claim_manager: Arc<ContentClaimManager>)
        -> Result<(), RepositoryError>;

    /// Recover persisted records, enqueueing them on their recorded queues.
    /// Returns the highest record id seen so sequencing can resume above it.
    async fn load(&self, starting_id: u64) -> Result<u64, RepositoryError>;

    /// Next value of the monotone record sequence.
    fn next_sequence(&self) -> u64;

    async fn update(&self, batch: Vec<RepositoryUpdate>) -> Result<(), RepositoryError>;

    /// Volatile repositories lose state on restart; swap recovery is skipped
    /// for them.
    fn is_volatile(&self) -> bool;

    async fn close(&self) -> Result<(), RepositoryError>;
}

/// Blob store for flow-file payloads.
#[async_trait]
pub trait ContentRepository: Send + Sync {
    async fn initialize(&self, claim_manager: Arc<ContentClaimManager>)
        -> Result<(), RepositoryError>;

    async fn is_accessible(&self, claim: &ContentClaim) -> Result<bool, RepositoryError>;

    async fn read(&self, claim: &ContentClaim) -> Result<Vec<u8>, RepositoryError>;

    /// Reclaim storage for claims whose claimant count has reached zero.
    async fn cleanup(&self) -> Result<(), RepositoryError>;

    async fn shutdown(&self) -> Result<(), RepositoryError>;
}

/// Append-only audit log.
#[async_trait]
pub trait ProvenanceRepository: Send + Sync {
    async fn initialize(&self, reporter: Arc<dyn EventReporter>) -> Result<(), RepositoryError>;

    /// Persist the event, returning its assigned id.
    async fn register_event(&self, event: ProvenanceEventRecord) -> Result<u64, RepositoryError>;

    async fn get_event(&self, id: u64) -> Result<Option<ProvenanceEventRecord>, RepositoryError>;

    async fn get_events(
        &self,
        first_id: u64,
        max: usize,
    ) -> Result<Vec<ProvenanceEventRecord>, RepositoryError>;

    async fn close(&self) -> Result<(), RepositoryError>;
}

/// Overflow spill for queues too deep to hold in memory.
#[async_trait]
pub trait SwapManager: Send + Sync {
    /// Discard all swapped data. Used when the flow-file repository is
    /// volatile and recovery would resurrect orphans.
    async fn purge(&self) -> Result<(), RepositoryError>;

    /// Re-enqueue swapped flow files; returns the highest record id seen.
    async fn recover_swapped_flowfiles(
        &self,
        claim_manager: Arc<ContentClaimManager>,
    ) -> Result<u64, RepositoryError>;

    fn start(&self);

    fn shutdown(&self);
}

/// History reservoir for status snapshots, queryable per component kind.
pub trait ComponentStatusRepository: Send + Sync {
    fn capture(&self, status: ProcessGroupStatus);

    fn connection_status_history(
        &self,
        connection_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        max_points: usize,
    ) -> Vec<ConnectionStatus>;

    fn processor_status_history(
        &self,
        processor_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        max_points: usize,
    ) -> Vec<ProcessorStatus>;

    fn group_status_history(
        &self,
        group_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        max_points: usize,
    ) -> Vec<ProcessGroupStatus>;

    fn remote_group_status_history(
        &self,
        remote_group_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        max_points: usize,
    ) -> Vec<RemoteGroupStatus>;
}

/// Cluster transport for heartbeats and bulletins.
#[async_trait]
pub trait NodeProtocolSender: Send + Sync {
    async fn heartbeat(&self, message: HeartbeatMessage) -> Result<(), RepositoryError>;

    async fn send_bulletins(&self, message: NodeBulletinsMessage) -> Result<(), RepositoryError>;
}

/// Site-to-site port discovery for remote process groups.
#[async_trait]
pub trait SiteToSiteClient: Send + Sync {
    async fn discover_ports(
        &self,
        target_uri: &str,
        timeout: Duration,
    ) -> Result<RemoteFlowContents, RepositoryError>;
}

/// Callback surface repositories use to raise operator-visible diagnostics.
pub trait EventReporter: Send + Sync {
    fn report(&self, level: BulletinLevel, category: &str, message: &str);
}

// ---------------------------------------------------------------------------
// flow-file event repository (rolling five-minute counters)
// ---------------------------------------------------------------------------

/// Per-component activity counters over the reporting window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlowFileEvent {
    pub flowfiles_in: u64,
    pub bytes_in: u64,
    pub flowfiles_out: u64,
    pub bytes_out: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub flowfiles_received: u64,
    pub bytes_received: u64,
    pub flowfiles_sent: u64,
    pub bytes_sent: u64,
    pub invocations: u64,
    pub processing_nanos: u64,
}

impl FlowFileEvent {
    pub fn absorb(&mut self, other: &FlowFileEvent) {
        self.flowfiles_in += other.flowfiles_in;
        self.bytes_in += other.bytes_in;
        self.flowfiles_out += other.flowfiles_out;
        self.bytes_out += other.bytes_out;
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
        self.flowfiles_received += other.flowfiles_received;
        self.bytes_received += other.bytes_received;
        self.flowfiles_sent += other.flowfiles_sent;
        self.bytes_sent += other.bytes_sent;
        self.invocations += other.invocations;
        self.processing_nanos += other.processing_nanos;
    }
}

/// Snapshot of every component's counters for one aggregation pass.
#[derive(Clone, Debug, Default)]
pub struct RepositoryStatusReport {
    entries: FxHashMap<String, FlowFileEvent>,
}

impl RepositoryStatusReport {
    #[must_use]
    pub fn entry(&self, component_id: &str) -> Option<&FlowFileEvent> {
        self.entries.get(component_id)
    }

    pub fn insert(&mut self, component_id: impl Into<String>, event: FlowFileEvent) {
        self.entries.insert(component_id.into(), event);
    }
}

/// Rolling store of per-component activity, queried by the status
/// aggregator for its last-N-minutes report.
pub trait FlowFileEventRepository: Send + Sync {
    fn record(&self, component_id: &str, event: FlowFileEvent);

    fn report_last_window(&self) -> RepositoryStatusReport;
}

/// In-memory event repository with a five-minute rolling window.
#[derive(Default)]
pub struct RingFlowFileEventRepository {
    samples: Mutex<FxHashMap<String, VecDeque<(DateTime<Utc>, FlowFileEvent)>>>,
}

impl RingFlowFileEventRepository {
    const WINDOW_SECONDS: i64 = 300;

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl FlowFileEventRepository for RingFlowFileEventRepository {
    fn record(&self, component_id: &str, event: FlowFileEvent) {
        let mut samples = self.samples.lock();
        samples
            .entry(component_id.to_string())
            .or_default()
            .push_back((Utc::now(), event));
    }

    fn report_last_window(&self) -> RepositoryStatusReport {
        let cutoff = Utc::now() - chrono::Duration::seconds(Self::WINDOW_SECONDS);
        let mut report = RepositoryStatusReport::default();
        let mut samples = self.samples.lock();
        for (component_id, window) in samples.iter_mut() {
            while window
                .front()
                .is_some_and(|(when, _)| *when < cutoff)
            {
                window.pop_front();
            }
            let mut total = FlowFileEvent::default();
            for (_, event) in window.iter() {
                total.absorb(event);
            }
            report.insert(component_id.clone(), total);
        }
        report
    }
}

// ---------------------------------------------------------------------------
// bulletins
// ---------------------------------------------------------------------------

/// Severity of a bulletin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum BulletinLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for BulletinLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        };
        write!(f, "{label}")
    }
}

/// A transient diagnostic record aggregated for operator visibility.
#[derive(Clone, Debug)]
pub struct Bulletin {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub level: BulletinLevel,
    pub category: String,
    pub message: String,
    pub source_id: Option<String>,
    pub source_name: Option<String>,
    pub group_id: Option<String>,
}

/// In-memory bulletin feed.
///
/// Keeps a bounded backlog for local queries and, when a subscriber is
/// attached (cluster mode), tees every bulletin into the subscriber's
/// channel so the heartbeat subsystem can forward them.
pub struct VolatileBulletinRepository {
    capacity: usize,
    next_id: AtomicU64,
    backlog: Mutex<VecDeque<Bulletin>>,
    subscriber: RwLock<Option<flume::Sender<Bulletin>>>,
}

impl Default for VolatileBulletinRepository {
    fn default() -> Self {
        Self::with_capacity(1000)
    }
}

impl VolatileBulletinRepository {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            next_id: AtomicU64::new(0),
            backlog: Mutex::new(VecDeque::new()),
            subscriber: RwLock::new(None),
        }
    }

    pub fn add(&self, mut bulletin: Bulletin) {
        bulletin.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if let Some(sender) = self.subscriber.read().clone() {
            let _ = sender.send(bulletin.clone());
        }
        let mut backlog = self.backlog.lock();
        if backlog.len() == self.capacity {
            backlog.pop_front();
        }
        backlog.push_back(bulletin);
    }

    /// Divert a copy of every future bulletin into the returned channel.
    /// Used by the clustered heartbeat subsystem.
    pub fn subscribe(&self) -> flume::Receiver<Bulletin> {
        let (sender, receiver) = flume::unbounded();
        *self.subscriber.write() = Some(sender);
        receiver
    }

    /// Most recent bulletins, oldest first.
    #[must_use]
    pub fn recent(&self, max: usize) -> Vec<Bulletin> {
        let backlog = self.backlog.lock();
        backlog
            .iter()
            .rev()
            .take(max)
            .rev()
            .cloned()
            .collect()
    }
}

/// Reporter that turns repository diagnostics into bulletins.
pub struct BulletinEventReporter {
    repository: Arc<VolatileBulletinRepository>,
}

impl BulletinEventReporter {
    #[must_use]
    pub fn new(repository: Arc<VolatileBulletinRepository>) -> Self {
        Self { repository }
    }
}

impl EventReporter for BulletinEventReporter {
    fn report(&self, level: BulletinLevel, category: &str, message: &str) {
        self.repository.add(Bulletin {
            id: 0,
            timestamp: Utc::now(),
            level,
            category: category.to_string(),
            message: message.to_string(),
            source_id: None,
            source_name: None,
            group_id: None,
        });
    }
}

// ---------------------------------------------------------------------------
// counters
// ---------------------------------------------------------------------------

/// A named counter adjusted by processing sessions.
#[derive(Debug)]
pub struct Counter {
    pub context: String,
    pub name: String,
    value: AtomicI64,
}

impl Counter {
    #[must_use]
    pub fn value(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }
}

/// Registry of counters, keyed by `context:name`.
#[derive(Debug, Default)]
pub struct CounterRepository {
    counters: Mutex<FxHashMap<String, Arc<Counter>>>,
}

impl CounterRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn adjust(&self, context: &str, name: &str, delta: i64) -> i64 {
        let key = format!("{context}:{name}");
        let counter = {
            let mut counters = self.counters.lock();
            counters
                .entry(key)
                .or_insert_with(|| {
                    Arc::new(Counter {
                        context: context.to_string(),
                        name: name.to_string(),
                        value: AtomicI64::new(0),
                    })
                })
                .clone()
        };
        counter.value.fetch_add(delta, Ordering::SeqCst) + delta
    }

    #[must_use]
    pub fn counters(&self) -> Vec<Arc<Counter>> {
        self.counters.lock().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulletin_backlog_is_bounded() {
        let repository = VolatileBulletinRepository::with_capacity(2);
        for i in 0..3 {
            repository.add(Bulletin {
                id: 0,
                timestamp: Utc::now(),
                level: BulletinLevel::Info,
                category: "test".into(),
                message: format!("bulletin {i}"),
                source_id: None,
                source_name: None,
                group_id: None,
            });
        }
        let recent = repository.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "bulletin 1");
        assert_eq!(recent[1].message, "bulletin 2");
    }

    #[test]
    fn subscriber_receives_copies() {
        let repository = VolatileBulletinRepository::default();
        let receiver = repository.subscribe();
        repository.add(Bulletin {
            id: 0,
            timestamp: Utc::now(),
            level: BulletinLevel::Warning,
            category: "test".into(),
            message: "diverted".into(),
            source_id: None,
            source_name: None,
            group_id: None,
        });
        let received = receiver.try_recv().unwrap();
        assert_eq!(received.message, "diverted");
        assert_eq!(repository.recent(10).len(), 1);
    }

    #[test]
    fn counters_accumulate_per_key() {
        let counters = CounterRepository::new();
        assert_eq!(counters.adjust("proc", "records", 2), 2);
        assert_eq!(counters.adjust("proc", "records", 3), 5);
        assert_eq!(counters.adjust("other", "records", 1), 1);
        assert_eq!(counters.counters().len(), 2);
    }

    #[test]
    fn rolling_report_sums_samples() {
        let repository = RingFlowFileEventRepository::new();
        repository.record(
            "p1",
            FlowFileEvent {
                flowfiles_in: 1,
                bytes_in: 10,
                ..Default::default()
            },
        );
        repository.record(
            "p1",
            FlowFileEvent {
                flowfiles_in: 2,
                bytes_in: 20,
                ..Default::default()
            },
        );
        let report = repository.report_last_window();
        let entry = report.entry("p1").unwrap();
        assert_eq!(entry.flowfiles_in, 3);
        assert_eq!(entry.bytes_in, 30);
    }

    #[test]
    fn provenance_builder_collects_lineage() {
        let event = ProvenanceEventRecord::builder(ProvenanceEventType::Replay, "child-uuid")
            .component("p1", "GenerateRecord")
            .parent_uuid("parent-uuid")
            .child_uuid("child-uuid")
            .details("Replay requested by ops")
            .build();
        assert_eq!(event.event_type, ProvenanceEventType::Replay);
        assert_eq!(event.parent_uuids, vec!["parent-uuid".to_string()]);
        assert_eq!(event.details.as_deref(), Some("Replay requested by ops"));
    }
}
