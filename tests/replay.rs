mod common;

use rustc_hash::{FxHashMap, FxHashSet};

use floweave::repository::{ClaimCoordinates, ProvenanceEventRecord, ProvenanceEventType};

use common::*;

fn previous_claim() -> ClaimCoordinates {
    ClaimCoordinates {
        container: "default".to_string(),
        section: "1".to_string(),
        identifier: "claim-1".to_string(),
        offset: 0,
        size: 128,
    }
}

fn replayable_event(queue_id: &str) -> ProvenanceEventRecord {
    let mut previous_attributes = FxHashMap::default();
    previous_attributes.insert("uuid".to_string(), "parent-uuid".to_string());
    previous_attributes.insert("filename".to_string(), "data.bin".to_string());
    previous_attributes.insert("discard.reason".to_string(), "stale".to_string());

    ProvenanceEventRecord::builder(ProvenanceEventType::Create, "parent-uuid")
        .component("p1", "GenerateProcessor")
        .previous_attributes(previous_attributes)
        .previous_claim(previous_claim())
        .source_queue(queue_id)
        .build()
}

async fn harness_with_queue() -> Harness {
    let harness = standalone_harness().await;
    let controller = &harness.controller;
    let root = harness.root();
    controller
        .create_processor(&root, "GenerateProcessor", "p1", "source")
        .unwrap();
    controller.create_funnel(&root, "f1").unwrap();
    controller
        .create_connection(
            &root,
            "queue-1",
            "p1",
            "f1",
            FxHashSet::from_iter(["success".to_string()]),
        )
        .unwrap();
    harness
}

#[tokio::test]
async fn replay_reconstructs_flowfile_on_source_queue() {
    let harness = harness_with_queue().await;
    let controller = &harness.controller;
    harness.content.mark_accessible("default", "1", "claim-1");
    let event_id = harness.provenance.seed(replayable_event("queue-1"));

    let replay_event = controller
        .replay_flowfile_by_id(event_id, "unit-test")
        .await
        .unwrap();

    assert_eq!(replay_event.event_type, ProvenanceEventType::Replay);
    assert_eq!(replay_event.parent_uuids, vec!["parent-uuid".to_string()]);
    assert_eq!(replay_event.child_uuids.len(), 1);
    assert_eq!(
        replay_event.details.as_deref(),
        Some("Replay requested by unit-test")
    );

    // The reconstructed record sits on the source queue with the replay
    // markers and without the discarded attributes.
    let connection = controller.find_connection("queue-1").unwrap();
    let mut expired = Vec::new();
    let record = connection.queue().poll(&mut expired).unwrap();
    assert_eq!(record.attribute("flowfile.replay"), Some("true"));
    assert!(record.attribute("flowfile.replay.timestamp").is_some());
    assert!(record.attribute("discard.reason").is_none());
    assert_eq!(record.attribute("filename"), Some("data.bin"));
    assert_ne!(record.uuid(), "parent-uuid");
    assert_eq!(record.size(), 128);

    // The new record holds its own reference on the content claim.
    let claim = controller
        .claim_manager()
        .new_claim("default", "1", "claim-1", false);
    assert_eq!(controller.claim_manager().claimant_count(&claim), 1);

    // A REPLAY provenance event was registered.
    let events = harness.provenance.events_snapshot();
    assert!(events
        .iter()
        .any(|event| event.event_type == ProvenanceEventType::Replay));

    // And the flow-file repository saw the new record.
    assert!(harness.flowfiles.update_count() >= 1);
}

#[tokio::test]
async fn join_events_are_not_replayable() {
    let harness = harness_with_queue().await;
    let controller = &harness.controller;
    harness.content.mark_accessible("default", "1", "claim-1");

    let mut event = replayable_event("queue-1");
    event.event_type = ProvenanceEventType::Join;
    let event_id = harness.provenance.seed(event);

    let err = controller
        .replay_flowfile_by_id(event_id, "unit-test")
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Cannot replay events that are created from multiple parents"
    );

    // No state change: queue empty, no claim references, no REPLAY event.
    let connection = controller.find_connection("queue-1").unwrap();
    assert!(connection.queue().is_empty());
    let claim = controller
        .claim_manager()
        .new_claim("default", "1", "claim-1", false);
    assert_eq!(controller.claim_manager().claimant_count(&claim), 0);
    assert!(!harness
        .provenance
        .events_snapshot()
        .iter()
        .any(|event| event.event_type == ProvenanceEventType::Replay));
}

#[tokio::test]
async fn missing_claim_and_queue_fail_with_specific_reasons() {
    let harness = harness_with_queue().await;
    let controller = &harness.controller;

    let mut event = replayable_event("queue-1");
    event.previous_claim = None;
    let id = harness.provenance.seed(event);
    let err = controller.replay_flowfile_by_id(id, "t").await.unwrap_err();
    assert!(err.to_string().contains("does not contain the required Content Claim"));

    harness.content.mark_accessible("default", "1", "claim-1");
    let mut event = replayable_event("queue-1");
    event.source_queue_identifier = None;
    let id = harness.provenance.seed(event);
    let err = controller.replay_flowfile_by_id(id, "t").await.unwrap_err();
    assert!(err.to_string().contains("does not specify the Source FlowFile Queue"));

    let event = replayable_event("vanished-queue");
    let id = harness.provenance.seed(event);
    let err = controller.replay_flowfile_by_id(id, "t").await.unwrap_err();
    assert!(err
        .to_string()
        .contains("Source FlowFile Queue with ID vanished-queue no longer exists"));
}

#[tokio::test]
async fn inaccessible_content_leaves_claimant_count_unchanged() {
    let harness = harness_with_queue().await;
    let controller = &harness.controller;
    harness.content.mark_inaccessible("default", "1", "claim-1");
    let event_id = harness.provenance.seed(replayable_event("queue-1"));

    let err = controller
        .replay_flowfile_by_id(event_id, "unit-test")
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Content is no longer available in Content Repository"
    );

    // The increment taken before the accessibility probe must be undone.
    let claim = controller
        .claim_manager()
        .new_claim("default", "1", "claim-1", false);
    assert_eq!(controller.claim_manager().claimant_count(&claim), 0);
}

#[tokio::test]
async fn accessibility_probe_errors_also_roll_back_the_claim() {
    let harness = harness_with_queue().await;
    let controller = &harness.controller;
    harness.content.fail_accessibility_checks();
    let event_id = harness.provenance.seed(replayable_event("queue-1"));

    assert!(controller
        .replay_flowfile_by_id(event_id, "unit-test")
        .await
        .is_err());

    let claim = controller
        .claim_manager()
        .new_claim("default", "1", "claim-1", false);
    assert_eq!(controller.claim_manager().claimant_count(&claim), 0);
}

#[tokio::test]
async fn replay_failure_reason_probe_is_side_effect_free() {
    let harness = harness_with_queue().await;
    let controller = &harness.controller;
    harness.content.mark_accessible("default", "1", "claim-1");

    let event = replayable_event("queue-1");
    assert!(controller.replay_failure_reason(&event).await.is_none());

    let mut join = replayable_event("queue-1");
    join.event_type = ProvenanceEventType::Join;
    assert_eq!(
        controller.replay_failure_reason(&join).await.as_deref(),
        Some("Cannot replay events that are created from multiple parents")
    );

    let claim = controller
        .claim_manager()
        .new_claim("default", "1", "claim-1", false);
    assert_eq!(controller.claim_manager().claimant_count(&claim), 0);
}
