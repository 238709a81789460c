//! The clustered heartbeat subsystem.
//!
//! Three periodic tasks cooperate over one single-slot message cell:
//!
//! 1. the **generator** (every `node.heartbeat.interval`) snapshots the
//!    [`HeartbeatBean`], aggregates status, and *overwrites* the cell;
//! 2. the **sender** (every 250 ms) takes the cell's content, if any, and
//!    transmits it — so between two sends only the latest snapshot
//!    survives;
//! 3. the **bulletins** task (every 2 s) drains the diverted bulletin feed,
//!    scrubs XML-illegal characters, and transmits the batch.
//!
//! Transport failures never fail a task: an unknown service address is
//! expected during cluster-manager failover and is logged at debug.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::controller::status::ProcessGroupStatus;
use crate::model::group::ProcessGroup;
use crate::repository::{Bulletin, NodeProtocolSender};

/// Immutable snapshot of the three inputs heartbeat generation needs.
/// Swapped wholesale whenever any of the three change, so generation never
/// blocks reconfiguration.
#[derive(Clone)]
pub struct HeartbeatBean {
    pub root_group: Arc<ProcessGroup>,
    pub primary: bool,
    pub connected: bool,
}

/// Host-level figures piggybacked on each heartbeat.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SystemDiagnostics {
    pub available_processors: usize,
    pub uptime_millis: u64,
}

/// The status payload of one heartbeat.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub system_start_time: DateTime<Utc>,
    pub active_thread_count: usize,
    pub total_flowfile_count: usize,
    pub total_flowfile_bytes: u64,
    pub counters: Vec<(String, i64)>,
    pub system_diagnostics: SystemDiagnostics,
    pub group_status: ProcessGroupStatus,
    pub site_to_site_port: Option<u16>,
    pub site_to_site_secure: bool,
}

/// One liveness + status message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    pub node_id: String,
    pub created: DateTime<Utc>,
    pub primary: bool,
    pub connected: bool,
    pub payload: HeartbeatPayload,
}

/// A batch of node bulletins forwarded to the cluster manager.
#[derive(Clone, Debug)]
pub struct NodeBulletinsMessage {
    pub node_id: String,
    pub bulletins: Vec<Bulletin>,
}

/// The single-slot cell between generator and sender. Store overwrites;
/// take clears. Dropped snapshots are by design: the freshest wins.
#[derive(Default)]
pub struct HeartbeatSlot {
    message: Mutex<Option<HeartbeatMessage>>,
}

impl HeartbeatSlot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, message: HeartbeatMessage) {
        *self.message.lock() = Some(message);
    }

    #[must_use]
    pub fn take(&self) -> Option<HeartbeatMessage> {
        self.message.lock().take()
    }
}

/// Sender-task body: take the latest snapshot and transmit it. Absence of a
/// message is silent; transport errors are swallowed after logging.
pub async fn send_heartbeat(
    slot: &HeartbeatSlot,
    suspended: &AtomicBool,
    sender: &Arc<dyn NodeProtocolSender>,
) {
    if suspended.load(Ordering::SeqCst) {
        return;
    }
    let Some(message) = slot.take() else {
        tracing::debug!(target: "floweave::heartbeat", "no heartbeat to send");
        return;
    };
    let created = message.created;
    let send_start = Instant::now();
    match sender.heartbeat(message).await {
        Ok(()) => {
            tracing::info!(
                target: "floweave::heartbeat",
                created = %created,
                send_millis = send_start.elapsed().as_millis() as u64,
                "heartbeat sent"
            );
        }
        Err(error) if error.is_unknown_service_address() => {
            tracing::debug!(target: "floweave::heartbeat", %error, "heartbeat not sent");
        }
        Err(error) => {
            tracing::warn!(
                target: "floweave::heartbeat",
                %error,
                "failed to send heartbeat to cluster manager"
            );
        }
    }
}

/// Bulletins-task body: drain the diverted feed, scrub, transmit. An empty
/// drain is a no-op.
pub async fn send_bulletins(
    node_id: &str,
    receiver: &flume::Receiver<Bulletin>,
    sender: &Arc<dyn NodeProtocolSender>,
) {
    let mut bulletins = Vec::new();
    while let Ok(bulletin) = receiver.try_recv() {
        bulletins.push(escape_bulletin(bulletin));
    }
    if bulletins.is_empty() {
        return;
    }
    let message = NodeBulletinsMessage {
        node_id: node_id.to_string(),
        bulletins,
    };
    match sender.send_bulletins(message).await {
        Ok(()) => {
            tracing::debug!(target: "floweave::heartbeat", "bulletins sent to cluster manager");
        }
        Err(error) => {
            // Includes the expected unknown-service-address case.
            tracing::debug!(
                target: "floweave::heartbeat",
                %error,
                "failed to send bulletins to cluster manager"
            );
        }
    }
}

fn is_illegal_xml_char(c: char) -> bool {
    (c as u32) < 0x20 && c != '\u{09}' && c != '\u{0A}' && c != '\u{0D}'
}

fn contains_illegal_xml_chars(message: &str) -> bool {
    message.chars().any(is_illegal_xml_char)
}

/// Replace XML-illegal control characters with `?`.
#[must_use]
pub fn strip_illegal_xml_chars(value: &str) -> String {
    value
        .chars()
        .map(|c| if is_illegal_xml_char(c) { '?' } else { c })
        .collect()
}

fn escape_bulletin(bulletin: Bulletin) -> Bulletin {
    if !contains_illegal_xml_chars(&bulletin.message) {
        return bulletin;
    }
    Bulletin {
        message: strip_illegal_xml_chars(&bulletin.message),
        ..bulletin
    }
}
