//! Status aggregation: one post-order pass over the group tree composing
//! per-vertex counters and queue sizes into a [`ProcessGroupStatus`].
//!
//! Per-component activity comes from the flow-file event repository's
//! rolling window report; queue depths are read live. Every summable field
//! of a group is the sum of its children's plus its local contribution.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::model::group::{ProcessGroup, RemoteProcessGroup};
use crate::repository::{ComponentStatusRepository, RepositoryStatusReport};
use crate::types::ScheduledState;

/// Activity and occupancy of one processor.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProcessorStatus {
    pub id: String,
    pub group_id: String,
    pub name: String,
    pub processor_type: String,
    pub run_status: Option<ScheduledState>,
    pub active_thread_count: usize,
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

/// Activity and occupancy of one connection.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub id: String,
    pub group_id: String,
    pub name: String,
    pub source_id: String,
    pub source_name: String,
    pub destination_id: String,
    pub destination_name: String,
    pub queued_count: usize,
    pub queued_bytes: u64,
    pub input_count: u64,
    pub input_bytes: u64,
    pub output_count: u64,
    pub output_bytes: u64,
}

/// Activity of one remote process group.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RemoteGroupStatus {
    pub id: String,
    pub group_id: String,
    pub target_uri: String,
    pub transmitting: bool,
    pub sent_count: u64,
    pub sent_bytes: u64,
    pub received_count: u64,
    pub received_bytes: u64,
    pub authorization_issue: Option<String>,
}

/// Aggregated status of a process group and, recursively, its children.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessGroupStatus {
    pub id: String,
    pub name: String,
    pub creation_timestamp: DateTime<Utc>,
    pub active_thread_count: usize,
    pub queued_count: usize,
    pub queued_bytes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub input_count: u64,
    pub input_bytes: u64,
    pub output_count: u64,
    pub output_bytes: u64,
    pub flowfiles_received: u64,
    pub bytes_received: u64,
    pub flowfiles_sent: u64,
    pub bytes_sent: u64,
    pub processor_status: Vec<ProcessorStatus>,
    pub connection_status: Vec<ConnectionStatus>,
    pub remote_group_status: Vec<RemoteGroupStatus>,
    pub group_status: Vec<ProcessGroupStatus>,
}

impl Default for ProcessGroupStatus {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            creation_timestamp: Utc::now(),
            active_thread_count: 0,
            queued_count: 0,
            queued_bytes: 0,
            bytes_read: 0,
            bytes_written: 0,
            input_count: 0,
            input_bytes: 0,
            output_count: 0,
            output_bytes: 0,
            flowfiles_received: 0,
            bytes_received: 0,
            flowfiles_sent: 0,
            bytes_sent: 0,
            processor_status: Vec::new(),
            connection_status: Vec::new(),
            remote_group_status: Vec::new(),
            group_status: Vec::new(),
        }
    }
}

/// Build the aggregated status tree rooted at `group`.
#[must_use]
pub fn aggregate_group_status(
    group: &Arc<ProcessGroup>,
    report: &RepositoryStatusReport,
) -> ProcessGroupStatus {
    let mut status = ProcessGroupStatus {
        id: group.id().to_string(),
        name: group.name(),
        creation_timestamp: Utc::now(),
        ..Default::default()
    };

    for processor in group.processors() {
        let processor_status = processor_status(group, &processor, report);
        status.active_thread_count += processor_status.active_thread_count;
        status.bytes_read += processor_status.bytes_read;
        status.bytes_written += processor_status.bytes_written;
        status.flowfiles_received += processor_status.flowfiles_received;
        status.bytes_received += processor_status.bytes_received;
        status.flowfiles_sent += processor_status.flowfiles_sent;
        status.bytes_sent += processor_status.bytes_sent;
        status.processor_status.push(processor_status);
    }

    // A group's input/output is what crosses its ports.
    for port in group.input_ports() {
        if let Some(event) = report.entry(port.id()) {
            status.input_count += event.flowfiles_in;
            status.input_bytes += event.bytes_in;
        }
        status.active_thread_count += port.active_task_count();
    }
    for port in group.output_ports() {
        if let Some(event) = report.entry(port.id()) {
            status.output_count += event.flowfiles_out;
            status.output_bytes += event.bytes_out;
        }
        status.active_thread_count += port.active_task_count();
    }

    for child in group.groups() {
        let child_status = aggregate_group_status(&child, report);
        status.active_thread_count += child_status.active_thread_count;
        status.queued_count += child_status.queued_count;
        status.queued_bytes += child_status.queued_bytes;
        status.bytes_read += child_status.bytes_read;
        status.bytes_written += child_status.bytes_written;
        status.input_count += child_status.input_count;
        status.input_bytes += child_status.input_bytes;
        status.output_count += child_status.output_count;
        status.output_bytes += child_status.output_bytes;
        status.flowfiles_received += child_status.flowfiles_received;
        status.bytes_received += child_status.bytes_received;
        status.flowfiles_sent += child_status.flowfiles_sent;
        status.bytes_sent += child_status.bytes_sent;
        status.group_status.push(child_status);
    }

    for remote in group.remote_groups() {
        let remote_status = remote_group_status(group, &remote, report);
        status.flowfiles_received += remote_status.received_count;
        status.bytes_received += remote_status.received_bytes;
        status.flowfiles_sent += remote_status.sent_count;
        status.bytes_sent += remote_status.sent_bytes;
        status.remote_group_status.push(remote_status);
    }

    for connection in group.connections() {
        let mut connection_status = ConnectionStatus {
            id: connection.id().to_string(),
            group_id: group.id().to_string(),
            name: connection.display_name(),
            source_id: connection.source().id().to_string(),
            source_name: connection.source().name(),
            destination_id: connection.destination().id().to_string(),
            destination_name: connection.destination().name(),
            ..Default::default()
        };
        if let Some(event) = report.entry(connection.id()) {
            connection_status.input_count = event.flowfiles_in;
            connection_status.input_bytes = event.bytes_in;
            connection_status.output_count = event.flowfiles_out;
            connection_status.output_bytes = event.bytes_out;
        }
        let queue_size = connection.queue().size();
        connection_status.queued_count = queue_size.object_count;
        connection_status.queued_bytes = queue_size.byte_count;
        status.queued_count += queue_size.object_count;
        status.queued_bytes += queue_size.byte_count;
        status.connection_status.push(connection_status);
    }

    status
}

fn processor_status(
    group: &Arc<ProcessGroup>,
    processor: &Arc<crate::model::connectable::Connectable>,
    report: &RepositoryStatusReport,
) -> ProcessorStatus {
    let mut status = ProcessorStatus {
        id: processor.id().to_string(),
        group_id: group.id().to_string(),
        name: processor.name(),
        processor_type: processor
            .processor()
            .map(|handle| handle.type_name.clone())
            .unwrap_or_default(),
        run_status: Some(processor.scheduled_state()),
        active_thread_count: processor.active_task_count(),
        ..Default::default()
    };
    if let Some(event) = report.entry(processor.id()) {
        status.flowfiles_in = event.flowfiles_in;
        status.bytes_in = event.bytes_in;
        status.flowfiles_out = event.flowfiles_out;
        status.bytes_out = event.bytes_out;
        status.bytes_read = event.bytes_read;
        status.bytes_written = event.bytes_written;
        status.flowfiles_received = event.flowfiles_received;
        status.bytes_received = event.bytes_received;
        status.flowfiles_sent = event.flowfiles_sent;
        status.bytes_sent = event.bytes_sent;
        status.invocations = event.invocations;
        status.processing_nanos = event.processing_nanos;
    }
    status
}

fn remote_group_status(
    group: &Arc<ProcessGroup>,
    remote: &Arc<RemoteProcessGroup>,
    report: &RepositoryStatusReport,
) -> RemoteGroupStatus {
    let mut status = RemoteGroupStatus {
        id: remote.id().to_string(),
        group_id: group.id().to_string(),
        target_uri: remote.target_uri().to_string(),
        transmitting: remote.is_transmitting(),
        authorization_issue: remote.authorization_issue(),
        ..Default::default()
    };
    if let Some(event) = report.entry(remote.id()) {
        status.sent_count = event.flowfiles_sent;
        status.sent_bytes = event.bytes_sent;
        status.received_count = event.flowfiles_received;
        status.received_bytes = event.bytes_received;
    }
    status
}

/// In-memory history reservoir: one day of snapshots at the default
/// five-minute cadence.
pub struct VolatileComponentStatusRepository {
    capacity: usize,
    snapshots: Mutex<VecDeque<ProcessGroupStatus>>,
}

impl Default for VolatileComponentStatusRepository {
    fn default() -> Self {
        Self::with_capacity(288)
    }
}

impl VolatileComponentStatusRepository {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            snapshots: Mutex::new(VecDeque::new()),
        }
    }

    #[must_use]
    pub fn snapshot_count(&self) -> usize {
        self.snapshots.lock().len()
    }

    /// Extract one component's entry from each retained snapshot, oldest
    /// first, bounded by the time window and point count.
    fn history<T>(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        max_points: usize,
        find: impl Fn(&ProcessGroupStatus) -> Option<T>,
    ) -> Vec<T> {
        let snapshots = self.snapshots.lock();
        snapshots
            .iter()
            .filter(|snapshot| {
                from.is_none_or(|from| snapshot.creation_timestamp >= from)
                    && to.is_none_or(|to| snapshot.creation_timestamp <= to)
            })
            .filter_map(|snapshot| find(snapshot))
            .take(max_points)
            .collect()
    }
}

fn find_group_entry(status: &ProcessGroupStatus, group_id: &str) -> Option<ProcessGroupStatus> {
    if status.id == group_id {
        return Some(status.clone());
    }
    status
        .group_status
        .iter()
        .find_map(|child| find_group_entry(child, group_id))
}

fn find_connection_entry(
    status: &ProcessGroupStatus,
    connection_id: &str,
) -> Option<ConnectionStatus> {
    status
        .connection_status
        .iter()
        .find(|connection| connection.id == connection_id)
        .cloned()
        .or_else(|| {
            status
                .group_status
                .iter()
                .find_map(|child| find_connection_entry(child, connection_id))
        })
}

fn find_processor_entry(
    status: &ProcessGroupStatus,
    processor_id: &str,
) -> Option<ProcessorStatus> {
    status
        .processor_status
        .iter()
        .find(|processor| processor.id == processor_id)
        .cloned()
        .or_else(|| {
            status
                .group_status
                .iter()
                .find_map(|child| find_processor_entry(child, processor_id))
        })
}

fn find_remote_group_entry(
    status: &ProcessGroupStatus,
    remote_group_id: &str,
) -> Option<RemoteGroupStatus> {
    status
        .remote_group_status
        .iter()
        .find(|remote| remote.id == remote_group_id)
        .cloned()
        .or_else(|| {
            status
                .group_status
                .iter()
                .find_map(|child| find_remote_group_entry(child, remote_group_id))
        })
}

impl ComponentStatusRepository for VolatileComponentStatusRepository {
    fn capture(&self, status: ProcessGroupStatus) {
        let mut snapshots = self.snapshots.lock();
        if snapshots.len() == self.capacity {
            snapshots.pop_front();
        }
        snapshots.push_back(status);
    }

    fn connection_status_history(
        &self,
        connection_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        max_points: usize,
    ) -> Vec<ConnectionStatus> {
        self.history(from, to, max_points, |snapshot| {
            find_connection_entry(snapshot, connection_id)
        })
    }

    fn processor_status_history(
        &self,
        processor_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        max_points: usize,
    ) -> Vec<ProcessorStatus> {
        self.history(from, to, max_points, |snapshot| {
            find_processor_entry(snapshot, processor_id)
        })
    }

    fn group_status_history(
        &self,
        group_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        max_points: usize,
    ) -> Vec<ProcessGroupStatus> {
        self.history(from, to, max_points, |snapshot| {
            find_group_entry(snapshot, group_id)
        })
    }

    fn remote_group_status_history(
        &self,
        remote_group_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        max_points: usize,
    ) -> Vec<RemoteGroupStatus> {
        self.history(from, to, max_points, |snapshot| {
            find_remote_group_entry(snapshot, remote_group_id)
        })
    }
}
