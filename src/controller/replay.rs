//! Replay: reconstructing a unit of work from a prior provenance event.
//!
//! Each precondition fails with a specific reason surfaced to the caller.
//! On success a fresh flow file appears on the event's source queue with a
//! new UUID, replay marker attributes, and its own claim reference; a
//! REPLAY provenance event links the new UUID (child) to the original
//! (parent).

use rustc_hash::FxHashMap;
use std::sync::Arc;
use uuid::Uuid;

use miette::Diagnostic;
use thiserror::Error;

use crate::controller::{ControllerError, FlowController};
use crate::model::connection::Connection;
use crate::model::flowfile::{attributes, FlowFileRecordBuilder};
use crate::repository::{
    ProvenanceEventRecord, ProvenanceEventType, RepositoryError, RepositoryUpdate,
};

/// Why a provenance event cannot be replayed.
#[derive(Debug, Error, Diagnostic)]
pub enum ReplayError {
    #[error("Cannot replay events that are created from multiple parents")]
    #[diagnostic(code(floweave::replay::join_event))]
    JoinEvent,

    #[error("Cannot replay data from Provenance Event because the event does not contain the required Content Claim")]
    #[diagnostic(code(floweave::replay::missing_content_claim))]
    MissingContentClaim,

    #[error("Content is no longer available in Content Repository")]
    #[diagnostic(code(floweave::replay::content_unavailable))]
    ContentNotAvailable,

    #[error("Cannot replay data from Provenance Event because the event does not specify the Source FlowFile Queue")]
    #[diagnostic(code(floweave::replay::missing_source_queue))]
    MissingSourceQueue,

    #[error("Cannot replay data from Provenance Event because the Source FlowFile Queue with ID {queue_id} no longer exists")]
    #[diagnostic(code(floweave::replay::source_queue_gone))]
    SourceQueueGone { queue_id: String },

    #[error("cannot find provenance event with id {id}")]
    #[diagnostic(code(floweave::replay::unknown_event))]
    UnknownEvent { id: u64 },

    #[error(transparent)]
    #[diagnostic(code(floweave::replay::repository))]
    Repository(#[from] RepositoryError),
}

impl FlowController {
    /// Replay by provenance event id; resolves the event first.
    #[tracing::instrument(skip(self), err)]
    pub async fn replay_flowfile_by_id(
        self: &Arc<Self>,
        event_id: u64,
        requestor: &str,
    ) -> Result<ProvenanceEventRecord, ControllerError> {
        let event = self
            .provenance_repository
            .get_event(event_id)
            .await
            .map_err(ReplayError::from)?
            .ok_or(ReplayError::UnknownEvent { id: event_id })?;
        self.replay_flowfile(&event, requestor).await
    }

    /// Replay the given provenance event. See the module docs for the
    /// precondition chain.
    #[tracing::instrument(skip(self, event), err)]
    pub async fn replay_flowfile(
        self: &Arc<Self>,
        event: &ProvenanceEventRecord,
        requestor: &str,
    ) -> Result<ProvenanceEventRecord, ControllerError> {
        if event.event_type == ProvenanceEventType::Join {
            return Err(ReplayError::JoinEvent.into());
        }

        let previous_claim = event
            .previous_claim
            .as_ref()
            .ok_or(ReplayError::MissingContentClaim)?;

        let queue_id = event
            .source_queue_identifier
            .as_ref()
            .ok_or(ReplayError::MissingSourceQueue)?;

        let connection =
            self.find_connection(queue_id)
                .ok_or_else(|| ReplayError::SourceQueueGone {
                    queue_id: queue_id.clone(),
                })?;

        let claim = self.claim_manager.new_claim(
            &previous_claim.container,
            &previous_claim.section,
            &previous_claim.identifier,
            false,
        );

        // Reference the claim before probing accessibility; undo on failure
        // so the claimant count is unchanged when replay raises.
        self.claim_manager.increment(&claim);
        let accessible = match self.content_repository.is_accessible(&claim).await {
            Ok(accessible) => accessible,
            Err(error) => {
                self.claim_manager.decrement(&claim);
                return Err(ReplayError::from(error).into());
            }
        };
        if !accessible {
            self.claim_manager.decrement(&claim);
            return Err(ReplayError::ContentNotAvailable.into());
        }

        let parent_uuid = event.flowfile_uuid.clone();
        let new_uuid = Uuid::new_v4().to_string();

        let mut lineage = event.lineage_identifiers.clone();
        lineage.push(parent_uuid.clone());

        let mut previous_attributes: FxHashMap<String, String> =
            event.previous_attributes.clone();
        previous_attributes.remove(attributes::DISCARD_REASON);
        previous_attributes.remove(attributes::ALTERNATE_IDENTIFIER);

        let record = FlowFileRecordBuilder::default()
            .id(self.flowfile_repository.next_sequence())
            .attributes(previous_attributes)
            .content_claim(claim)
            .content_claim_offset(previous_claim.offset)
            .size(previous_claim.size)
            .lineage_identifiers(lineage)
            .lineage_start_date(event.lineage_start_date)
            .attribute(attributes::REPLAY, "true")
            .attribute(
                attributes::REPLAY_TIMESTAMP,
                chrono::Utc::now().to_rfc3339(),
            )
            .attribute(attributes::UUID, new_uuid.clone())
            .build();

        let mut replay_builder = ProvenanceEventRecord::builder(
            ProvenanceEventType::Replay,
            parent_uuid.clone(),
        )
        .component(&event.component_id, &event.component_type)
        .child_uuid(new_uuid)
        .parent_uuid(parent_uuid)
        .attributes(record.attributes().clone())
        .lineage(
            event.lineage_identifiers.clone(),
            event.lineage_start_date,
        )
        .details(format!("Replay requested by {requestor}"));
        if let Some(current) = &event.current_claim {
            replay_builder = replay_builder.current_claim(current.clone());
        }
        let mut replay_event = replay_builder.build();

        let assigned_id = self
            .provenance_repository
            .register_event(replay_event.clone())
            .await
            .map_err(ReplayError::from)?;
        replay_event.id = assigned_id;

        self.flowfile_repository
            .update(vec![RepositoryUpdate {
                record: record.clone(),
                destination_queue: Some(connection.id().to_string()),
            }])
            .await
            .map_err(ReplayError::from)?;

        connection.queue().put(record);
        Ok(replay_event)
    }

    /// Non-throwing probe: the first failing replay precondition, or `None`
    /// when the event is replayable. No state is changed.
    pub async fn replay_failure_reason(
        self: &Arc<Self>,
        event: &ProvenanceEventRecord,
    ) -> Option<String> {
        if event.event_type == ProvenanceEventType::Join {
            return Some(ReplayError::JoinEvent.to_string());
        }
        let Some(previous_claim) = event.previous_claim.as_ref() else {
            return Some(ReplayError::MissingContentClaim.to_string());
        };

        let claim = self.claim_manager.new_claim(
            &previous_claim.container,
            &previous_claim.section,
            &previous_claim.identifier,
            false,
        );
        match self.content_repository.is_accessible(&claim).await {
            Ok(true) => {}
            Ok(false) => return Some(ReplayError::ContentNotAvailable.to_string()),
            Err(error) => {
                return Some(format!(
                    "Failed to determine whether or not content was available in Content Repository due to {error}"
                ));
            }
        }

        let Some(queue_id) = event.source_queue_identifier.as_ref() else {
            return Some(ReplayError::MissingSourceQueue.to_string());
        };
        let connection: Option<Arc<Connection>> = self.find_connection(queue_id);
        if connection.is_none() {
            return Some(
                ReplayError::SourceQueueGone {
                    queue_id: queue_id.clone(),
                }
                .to_string(),
            );
        }
        None
    }
}
