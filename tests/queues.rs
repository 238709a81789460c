mod common;

use rustc_hash::FxHashSet;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use floweave::model::flowfile::FlowFileRecord;
use floweave::plugin::FlowFilePrioritizer;
use floweave::repository::{CounterRepository, RingFlowFileEventRepository};
use floweave::scheduling::session::expire_queue;
use floweave::scheduling::SessionFactory;
use floweave::UpdateConnection;

use common::*;

struct SmallestFirst;

impl FlowFilePrioritizer for SmallestFirst {
    fn name(&self) -> &str {
        "smallest-first"
    }

    fn compare(&self, a: &FlowFileRecord, b: &FlowFileRecord) -> Ordering {
        a.size().cmp(&b.size())
    }
}

#[tokio::test]
async fn registered_prioritizer_orders_a_live_queue() {
    let harness = standalone_harness().await;
    let controller = &harness.controller;
    let root = harness.root();

    controller
        .registry()
        .register_prioritizer("SmallestFirst", Arc::new(SmallestFirst));

    controller
        .create_processor(&root, "GenerateProcessor", "gen", "generator")
        .unwrap();
    controller.create_funnel(&root, "f1").unwrap();
    let connection = controller
        .create_connection(
            &root,
            "c1",
            "gen",
            "f1",
            FxHashSet::from_iter(["success".to_string()]),
        )
        .unwrap();
    controller
        .update_connection(
            "c1",
            UpdateConnection {
                prioritizers: Some(vec!["SmallestFirst".to_string()]),
                ..Default::default()
            },
        )
        .unwrap();

    connection
        .queue()
        .put(FlowFileRecord::builder().id(1).size(300).build());
    connection
        .queue()
        .put(FlowFileRecord::builder().id(2).size(100).build());
    connection
        .queue()
        .put(FlowFileRecord::builder().id(3).size(200).build());

    let mut expired = Vec::new();
    let order: Vec<u64> = std::iter::from_fn(|| connection.queue().poll(&mut expired))
        .map(|record| record.id())
        .collect();
    assert_eq!(order, vec![2, 3, 1]);

    // An unknown prioritizer name is rejected.
    let err = controller
        .update_connection(
            "c1",
            UpdateConnection {
                prioritizers: Some(vec!["Missing".to_string()]),
                ..Default::default()
            },
        )
        .unwrap_err();
    assert!(err.to_string().contains("unknown prioritizer type"));
}

#[tokio::test]
async fn expiration_sweep_releases_claims_and_records_events() {
    let harness = standalone_harness().await;
    let controller = &harness.controller;
    let root = harness.root();

    controller
        .create_processor(&root, "GenerateProcessor", "gen", "generator")
        .unwrap();
    controller.create_funnel(&root, "f1").unwrap();
    let connection = controller
        .create_connection(
            &root,
            "c1",
            "gen",
            "f1",
            FxHashSet::from_iter(["success".to_string()]),
        )
        .unwrap();

    let claim_manager = controller.claim_manager().clone();
    let claim = claim_manager.new_claim("default", "1", "old-claim", false);
    claim_manager.increment(&claim);

    let stale = FlowFileRecord::builder()
        .id(99)
        .attribute("uuid", "stale-uuid")
        .entry_date(chrono::Utc::now() - chrono::Duration::seconds(120))
        .content_claim(claim.clone())
        .size(10)
        .build();
    connection.queue().put(stale);
    connection
        .queue()
        .set_flowfile_expiration(Duration::from_secs(30));

    let factory = Arc::new(SessionFactory {
        flowfile_repository: harness.flowfiles.clone(),
        content_repository: harness.content.clone(),
        provenance_repository: harness.provenance.clone(),
        event_repository: Arc::new(RingFlowFileEventRepository::new()),
        counters: Arc::new(CounterRepository::new()),
        claim_manager: claim_manager.clone(),
    });

    let expired = expire_queue(&connection, &factory).await.unwrap();
    assert_eq!(expired, 1);
    assert!(connection.queue().is_empty());
    assert_eq!(claim_manager.claimant_count(&claim), 0);
    assert!(harness
        .provenance
        .events_snapshot()
        .iter()
        .any(|event| matches!(
            event.event_type,
            floweave::repository::ProvenanceEventType::Expire
        )));
}

#[tokio::test]
async fn nonempty_connection_cannot_be_removed_through_the_facade() {
    let harness = standalone_harness().await;
    let controller = &harness.controller;
    let root = harness.root();

    controller
        .create_processor(&root, "GenerateProcessor", "gen", "generator")
        .unwrap();
    controller.create_funnel(&root, "f1").unwrap();
    let connection = controller
        .create_connection(
            &root,
            "c1",
            "gen",
            "f1",
            FxHashSet::from_iter(["success".to_string()]),
        )
        .unwrap();
    connection
        .queue()
        .put(FlowFileRecord::builder().id(1).size(1).build());

    assert!(controller.remove_connection("c1").is_err());

    let mut expired = Vec::new();
    connection.queue().poll(&mut expired);
    controller.remove_connection("c1").unwrap();
    assert!(controller.find_connection("c1").is_none());
}
