mod common;

use chrono::Utc;
use std::time::Duration;

use floweave::repository::{Bulletin, BulletinLevel};
use floweave::settings::EngineSettings;

use common::*;

fn fast_heartbeat_settings() -> EngineSettings {
    EngineSettings {
        heartbeat_interval: Duration::from_secs(1),
        ..Default::default()
    }
}

#[tokio::test]
async fn heartbeats_flow_to_the_protocol_sender() {
    let harness = clustered_harness_with(fast_heartbeat_settings()).await;
    let controller = &harness.controller;
    let protocol = harness.protocol.as_ref().unwrap();

    controller.start_heartbeating().unwrap();
    assert!(controller.is_heartbeating());

    assert!(
        wait_until(Duration::from_secs(2), || protocol.heartbeat_count() > 0).await,
        "a generated heartbeat must be transmitted"
    );

    let heartbeat = protocol.heartbeats.lock()[0].clone();
    assert_eq!(heartbeat.node_id, "node-1");
    assert!(!heartbeat.primary);

    controller.stop_heartbeating().unwrap();
    assert!(!controller.is_heartbeating());
}

#[tokio::test]
async fn suspended_heartbeats_are_not_transmitted() {
    let harness = clustered_harness_with(fast_heartbeat_settings()).await;
    let controller = &harness.controller;
    let protocol = harness.protocol.as_ref().unwrap();

    controller.suspend_heartbeats();
    controller.start_heartbeating().unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(
        protocol.heartbeat_count(),
        0,
        "suspension must gate the sender, not the generator"
    );

    controller.resume_heartbeats();
    assert!(
        wait_until(Duration::from_secs(2), || protocol.heartbeat_count() > 0).await,
        "resume must let the buffered snapshot go out"
    );
    controller.stop_heartbeating().unwrap();
}

#[tokio::test]
async fn start_heartbeating_is_idempotent_over_stop() {
    let harness = clustered_harness_with(fast_heartbeat_settings()).await;
    let controller = &harness.controller;

    controller.start_heartbeating().unwrap();
    // Starting again implicitly stops the previous tasks first.
    controller.start_heartbeating().unwrap();
    assert!(controller.is_heartbeating());

    controller.stop_heartbeating().unwrap();
    assert!(!controller.is_heartbeating());
    // Stopping when already stopped is a no-op.
    controller.stop_heartbeating().unwrap();
}

#[tokio::test]
async fn standalone_controller_refuses_heartbeating() {
    let harness = standalone_harness().await;
    assert!(harness.controller.start_heartbeating().is_err());
    assert!(harness.controller.stop_heartbeating().is_err());
}

#[tokio::test]
async fn transport_failures_do_not_cancel_the_schedule() {
    let harness = clustered_harness_with(fast_heartbeat_settings()).await;
    let controller = &harness.controller;
    let protocol = harness.protocol.as_ref().unwrap();

    protocol.fail_with_unknown_address();
    controller.start_heartbeating().unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(controller.is_heartbeating());

    // Once the address resolves, the next snapshot goes through.
    protocol.clear_failures();
    assert!(
        wait_until(Duration::from_secs(2), || protocol.heartbeat_count() > 0).await,
        "heartbeating must continue with the next snapshot after failures"
    );
    controller.stop_heartbeating().unwrap();
}

#[tokio::test]
async fn bulletins_are_batched_and_escaped() {
    let harness = clustered_harness_with(fast_heartbeat_settings()).await;
    let controller = &harness.controller;
    let protocol = harness.protocol.as_ref().unwrap();

    controller.start_heartbeating().unwrap();
    controller.report_bulletin(Bulletin {
        id: 0,
        timestamp: Utc::now(),
        level: BulletinLevel::Warning,
        category: "test".into(),
        message: "control\u{01}char".into(),
        source_id: Some("p1".into()),
        source_name: Some("proc".into()),
        group_id: None,
    });

    assert!(
        wait_until(Duration::from_secs(4), || !protocol.bulletins.lock().is_empty()).await,
        "the bulletins task must forward node bulletins"
    );
    let batch = protocol.bulletins.lock()[0].clone();
    assert_eq!(batch.node_id, "node-1");
    assert_eq!(batch.bulletins.len(), 1);
    assert_eq!(batch.bulletins[0].message, "control?char");
    controller.stop_heartbeating().unwrap();
}
