mod common;

use rustc_hash::FxHashSet;
use std::time::Duration;

use floweave::{UpdateConnection, UpdateProcessor};

use common::*;

#[tokio::test]
async fn full_downstream_queue_stops_triggers_and_drain_resumes_them() {
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
    controller
        .update_connection(
            "c1",
            UpdateConnection {
                back_pressure_object_threshold: Some(5),
                ..Default::default()
            },
        )
        .unwrap();
    controller
        .update_processor(
            "gen",
            UpdateProcessor {
                scheduling_period: Some(Duration::from_millis(20)),
                yield_period: Some(Duration::from_millis(50)),
                ..Default::default()
            },
        )
        .unwrap();

    controller.start_processor("gen").unwrap();

    // The producer fills the queue to its threshold and must then observe
    // back-pressure.
    assert!(
        wait_until(Duration::from_secs(2), || connection.queue().is_full()).await,
        "queue should reach its threshold"
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    let size_at_full = connection.queue().size().object_count;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        connection.queue().size().object_count,
        size_at_full,
        "triggers must cease while the downstream queue is full"
    );

    // Drain the queue; after the yield period the producer resumes.
    let mut expired = Vec::new();
    while connection.queue().poll(&mut expired).is_some() {}
    assert!(
        wait_until(Duration::from_secs(2), || {
            connection.queue().size().object_count > 0
        })
        .await,
        "triggers must resume after the queue drains"
    );

    controller.stop_processor("gen").unwrap();
}

#[tokio::test]
async fn funnel_relays_until_its_downstream_fills() {
    let harness = standalone_harness().await;
    let controller = &harness.controller;
    let root = harness.root();

    controller
        .create_processor(&root, "GenerateProcessor", "gen", "generator")
        .unwrap();
    controller.create_funnel(&root, "f1").unwrap();
    controller.create_funnel(&root, "f2").unwrap();
    let upstream = controller
        .create_connection(
            &root,
            "c1",
            "gen",
            "f1",
            FxHashSet::from_iter(["success".to_string()]),
        )
        .unwrap();
    let downstream = controller
        .create_connection(&root, "c2", "f1", "f2", FxHashSet::default())
        .unwrap();
    controller
        .update_connection(
            "c2",
            UpdateConnection {
                back_pressure_object_threshold: Some(5),
                ..Default::default()
            },
        )
        .unwrap();
    controller
        .update_processor(
            "gen",
            UpdateProcessor {
                scheduling_period: Some(Duration::from_millis(20)),
                ..Default::default()
            },
        )
        .unwrap();
    let funnel = controller.find_connectable("f1").unwrap();
    funnel.set_scheduling_period(Duration::from_millis(20));
    funnel.set_yield_period(Duration::from_secs(10));

    controller.start_processor("gen").unwrap();
    controller.start_connectable("f1").unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || {
            downstream.queue().size().object_count >= 5
        })
        .await,
        "the funnel should relay until its downstream queue fills"
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        funnel.is_yielded(),
        "a full downstream queue must make the funnel yield"
    );
    // With the funnel yielded, records pile up on its inbound queue.
    assert!(
        wait_until(Duration::from_secs(2), || {
            upstream.queue().size().object_count > 0
        })
        .await
    );

    controller.stop_processor("gen").unwrap();
    controller.stop_connectable("f1").unwrap();
}

#[tokio::test]
async fn zero_threshold_never_signals_full() {
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
    controller
        .update_processor(
            "gen",
            UpdateProcessor {
                scheduling_period: Some(Duration::from_millis(10)),
                ..Default::default()
            },
        )
        .unwrap();

    controller.start_processor("gen").unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || {
            connection.queue().size().object_count >= 20
        })
        .await
    );
    assert!(!connection.queue().is_full());
    controller.stop_processor("gen").unwrap();
}
