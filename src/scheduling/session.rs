//! Processing sessions: the view of the engine a trigger works through.
//!
//! A session is created per trigger invocation. The plug-in polls inbound
//! work, creates or transfers records, and the trigger wrapper commits (or
//! rolls back) the whole batch: routing to outbound queues, one durable
//! flow-file repository update, provenance registration, and counter
//! adjustments all happen at commit.

use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::model::claim::ContentClaimManager;
use crate::model::connectable::{Connectable, ANONYMOUS_RELATIONSHIP};
use crate::model::connection::Connection;
use crate::model::flowfile::{attributes, FlowFileRecord, FlowFileRecordBuilder};
use crate::repository::{
    ContentRepository, CounterRepository, FlowFileEvent, FlowFileEventRepository,
    FlowFileRepository, ProvenanceEventRecord, ProvenanceEventType, ProvenanceRepository,
    RepositoryError, RepositoryUpdate,
};

/// The repositories and shared services a session operates against.
///
/// One factory is built at controller construction and handed to every
/// scheduling agent.
pub struct SessionFactory {
    pub flowfile_repository: Arc<dyn FlowFileRepository>,
    pub content_repository: Arc<dyn ContentRepository>,
    pub provenance_repository: Arc<dyn ProvenanceRepository>,
    pub event_repository: Arc<dyn FlowFileEventRepository>,
    pub counters: Arc<CounterRepository>,
    pub claim_manager: Arc<ContentClaimManager>,
}

impl SessionFactory {
    /// Open a session for one trigger of the given component.
    #[must_use]
    pub fn create_session(self: &Arc<Self>, component: Arc<Connectable>) -> ProcessSession {
        ProcessSession {
            factory: self.clone(),
            component,
            polled: Vec::new(),
            created: Vec::new(),
            transfers: Vec::new(),
            expired: Vec::new(),
            counter_adjustments: Vec::new(),
            stats: FlowFileEvent::default(),
        }
    }
}

struct PolledRecord {
    record: Arc<FlowFileRecord>,
    source: Arc<Connection>,
}

/// Scratch state for one trigger invocation.
pub struct ProcessSession {
    factory: Arc<SessionFactory>,
    component: Arc<Connectable>,
    polled: Vec<PolledRecord>,
    created: Vec<Arc<FlowFileRecord>>,
    transfers: Vec<(Arc<FlowFileRecord>, String)>,
    expired: Vec<Arc<FlowFileRecord>>,
    counter_adjustments: Vec<(String, i64)>,
    stats: FlowFileEvent,
}

impl ProcessSession {
    #[must_use]
    pub fn component(&self) -> &Arc<Connectable> {
        &self.component
    }

    /// Poll one record from the component's inbound queues, round-robin.
    pub fn get(&mut self) -> Option<Arc<FlowFileRecord>> {
        let connections = self.component.incoming_connections();
        for connection in connections {
            let mut expired = Vec::new();
            let polled = connection.queue().poll(&mut expired);
            self.expired.extend(expired);
            if let Some(record) = polled {
                self.stats.flowfiles_in += 1;
                self.stats.bytes_in += record.size();
                self.polled.push(PolledRecord {
                    record: record.clone(),
                    source: connection,
                });
                return Some(record);
            }
        }
        None
    }

    /// Poll up to `max` records.
    pub fn get_batch(&mut self, max: usize) -> Vec<Arc<FlowFileRecord>> {
        let mut records = Vec::new();
        while records.len() < max {
            match self.get() {
                Some(record) => records.push(record),
                None => break,
            }
        }
        records
    }

    /// Create a fresh record owned by this session. A CREATE provenance
    /// event is registered at commit.
    pub fn create(&mut self, attrs: FxHashMap<String, String>) -> Arc<FlowFileRecord> {
        let record = FlowFileRecordBuilder::default()
            .id(self.factory.flowfile_repository.next_sequence())
            .attributes(attrs)
            .attribute(attributes::UUID, Uuid::new_v4().to_string())
            .build();
        self.created.push(record.clone());
        record
    }

    /// Route a record to a relationship. The record lands on every outbound
    /// connection subscribed to that relationship at commit.
    pub fn transfer(&mut self, record: Arc<FlowFileRecord>, relationship: impl Into<String>) {
        self.transfers.push((record, relationship.into()));
    }

    /// Route to the anonymous relationship used by ports and funnels.
    pub fn transfer_anonymous(&mut self, record: Arc<FlowFileRecord>) {
        self.transfer(record, ANONYMOUS_RELATIONSHIP);
    }

    pub fn adjust_counter(&mut self, name: impl Into<String>, delta: i64) {
        self.counter_adjustments.push((name.into(), delta));
    }

    /// IO statistics accumulated so far (used by the trigger wrapper).
    #[must_use]
    pub fn stats(&self) -> FlowFileEvent {
        self.stats
    }

    /// Apply the session: enqueue transfers, drop auto-terminated and
    /// expired records, persist the repository update, register provenance.
    pub async fn commit(mut self) -> Result<FlowFileEvent, RepositoryError> {
        let auto_terminated = self
            .component
            .processor()
            .map(|handle| handle.auto_terminated())
            .unwrap_or_default();
        let outgoing = self.component.outgoing_connections();

        let mut updates: Vec<RepositoryUpdate> = Vec::new();
        let mut provenance: Vec<ProvenanceEventRecord> = Vec::new();

        for record in &self.created {
            provenance.push(
                ProvenanceEventRecord::builder(ProvenanceEventType::Create, record.uuid())
                    .component(self.component.id(), self.component.kind().to_string())
                    .attributes(record.attributes().clone())
                    .build(),
            );
        }

        for (record, relationship) in std::mem::take(&mut self.transfers) {
            let destinations: Vec<Arc<Connection>> = outgoing
                .iter()
                .filter(|conn| conn.subscribes_to(&relationship))
                .cloned()
                .collect();

            if destinations.is_empty() {
                if auto_terminated.contains(&relationship) {
                    self.release_record(&record, &mut updates);
                    provenance.push(
                        ProvenanceEventRecord::builder(ProvenanceEventType::Drop, record.uuid())
                            .component(self.component.id(), self.component.kind().to_string())
                            .build(),
                    );
                    continue;
                }
                return Err(RepositoryError::Other(format!(
                    "relationship {relationship:?} of {} has no connection and is not auto-terminated",
                    self.component.id()
                )));
            }

            // Additional destinations receive a clone of the record; each
            // copy takes its own reference on the content claim.
            for (index, destination) in destinations.iter().enumerate() {
                let routed = if index == 0 {
                    record.clone()
                } else {
                    let clone = FlowFileRecordBuilder::from_record(&record)
                        .id(self.factory.flowfile_repository.next_sequence())
                        .attribute(attributes::UUID, Uuid::new_v4().to_string())
                        .build();
                    if let Some(claim) = clone.content_claim() {
                        self.factory.claim_manager.increment(claim);
                    }
                    provenance.push(
                        ProvenanceEventRecord::builder(ProvenanceEventType::Clone, record.uuid())
                            .component(self.component.id(), self.component.kind().to_string())
                            .parent_uuid(record.uuid())
                            .child_uuid(clone.uuid())
                            .build(),
                    );
                    clone
                };
                self.stats.flowfiles_out += 1;
                self.stats.bytes_out += routed.size();
                updates.push(RepositoryUpdate {
                    record: routed.clone(),
                    destination_queue: Some(destination.id().to_string()),
                });
                destination.queue().put(routed);
            }
        }

        for record in std::mem::take(&mut self.expired) {
            self.release_record(&record, &mut updates);
            provenance.push(
                ProvenanceEventRecord::builder(ProvenanceEventType::Expire, record.uuid())
                    .component(self.component.id(), self.component.kind().to_string())
                    .build(),
            );
        }

        self.factory.flowfile_repository.update(updates).await?;
        for event in provenance {
            self.factory.provenance_repository.register_event(event).await?;
        }
        for (name, delta) in &self.counter_adjustments {
            self.factory
                .counters
                .adjust(&self.component.name(), name, *delta);
        }

        self.factory
            .event_repository
            .record(self.component.id(), self.stats);
        Ok(self.stats)
    }

    /// Undo the session: polled records return to their source queues.
    pub fn rollback(self) {
        for polled in self.polled {
            polled.source.queue().put(polled.record);
        }
    }

    /// Release a record leaving the flow: drop its claim reference and mark
    /// it gone in the repository batch.
    fn release_record(&self, record: &Arc<FlowFileRecord>, updates: &mut Vec<RepositoryUpdate>) {
        if let Some(claim) = record.content_claim() {
            self.factory.claim_manager.decrement(claim);
        }
        updates.push(RepositoryUpdate {
            record: record.clone(),
            destination_queue: None,
        });
    }
}

/// Built-in trigger for ports and funnels: relay everything queued inbound
/// to the anonymous relationship, one bounded batch per invocation.
pub async fn relay_trigger(session: &mut ProcessSession) {
    const RELAY_BATCH: usize = 100;
    let records = session.get_batch(RELAY_BATCH);
    for record in records {
        session.transfer_anonymous(record);
    }
}

/// Expire old flow files on one queue outside any session. Used by the
/// periodic sweep: claims are released and EXPIRE events registered.
pub async fn expire_queue(
    connection: &Arc<Connection>,
    factory: &Arc<SessionFactory>,
) -> Result<usize, RepositoryError> {
    let expired = connection.queue().drain_expired();
    if expired.is_empty() {
        return Ok(0);
    }
    let count = expired.len();
    let mut updates = Vec::with_capacity(count);
    for record in expired {
        if let Some(claim) = record.content_claim() {
            factory.claim_manager.decrement(claim);
        }
        factory
            .provenance_repository
            .register_event(
                ProvenanceEventRecord::builder(ProvenanceEventType::Expire, record.uuid())
                    .component(connection.id(), "connection".to_string())
                    .source_queue(connection.id())
                    .build(),
            )
            .await?;
        updates.push(RepositoryUpdate {
            record,
            destination_queue: None,
        });
    }
    factory.flowfile_repository.update(updates).await?;
    Ok(count)
}

/// Clamp a scheduling period to the configured floor.
#[must_use]
pub fn clamp_period(period: Duration, floor: Duration) -> Duration {
    period.max(floor)
}
