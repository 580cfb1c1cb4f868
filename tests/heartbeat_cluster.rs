//! Heartbeat generation, delivery, suspension, and bulletin forwarding.

mod common;

use common::{test_registry, CapturingSender};
use flowgrid::controller::FlowEngineBuilder;
use flowgrid::repo::{Bulletin, BulletinSeverity};
use flowgrid::EngineSettings;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

fn settings() -> EngineSettings {
    EngineSettings {
        heartbeat_delay_seconds: 1,
        ..EngineSettings::default()
    }
}

#[tokio::test]
async fn test_heartbeats_reach_the_protocol_sender() {
    let sender = Arc::new(CapturingSender::default());
    let controller = FlowEngineBuilder::new(settings())
        .extensions(test_registry())
        .protocol_sender(sender.clone())
        .node_id("node-1")
        .build()
        .expect("controller builds");
    controller.initialize_flow().expect("initialize");
    controller.set_clustered(true, true);
    controller.start_heartbeating().expect("heartbeating");

    tokio::time::sleep(Duration::from_millis(2600)).await;

    let heartbeats = sender.heartbeats.lock().clone();
    assert!(
        !heartbeats.is_empty(),
        "at least one heartbeat was transmitted"
    );
    let latest = heartbeats.last().expect("heartbeat");
    assert_eq!(latest.node_id, "node-1");
    assert!(latest.connected);
    assert!(latest.payload.system_diagnostics.available_processors >= 1);

    controller.shutdown(false).await.expect("shutdown");
}

#[tokio::test]
async fn test_suspended_heartbeats_are_not_delivered() {
    let sender = Arc::new(CapturingSender::default());
    let controller = FlowEngineBuilder::new(settings())
        .extensions(test_registry())
        .protocol_sender(sender.clone())
        .build()
        .expect("controller builds");
    controller.initialize_flow().expect("initialize");

    controller.suspend_heartbeats();
    controller.start_heartbeating().expect("heartbeating");
    tokio::time::sleep(Duration::from_millis(1800)).await;
    assert!(
        sender.heartbeats.lock().is_empty(),
        "suspension blocks delivery"
    );

    controller.resume_heartbeats();
    tokio::time::sleep(Duration::from_millis(1800)).await;
    assert!(
        !sender.heartbeats.lock().is_empty(),
        "delivery resumes after resume"
    );

    controller.shutdown(false).await.expect("shutdown");
}

#[tokio::test]
async fn test_restart_heartbeating_is_idempotent() {
    let sender = Arc::new(CapturingSender::default());
    let controller = FlowEngineBuilder::new(settings())
        .extensions(test_registry())
        .protocol_sender(sender.clone())
        .build()
        .expect("controller builds");
    controller.initialize_flow().expect("initialize");

    controller.start_heartbeating().expect("heartbeating");
    // Restarting stops the previous tasks first; no duplicate senders pile up.
    controller.start_heartbeating().expect("heartbeating again");
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let after_restart = sender.heartbeats.lock().len();
    assert!(after_restart >= 1);
    // A single generator at 1 s cadence cannot have produced many messages.
    assert!(
        after_restart <= 3,
        "restart did not double the heartbeat stream ({})",
        after_restart
    );

    controller.shutdown(false).await.expect("shutdown");
}

#[tokio::test]
async fn test_bulletins_are_bundled_and_sanitised() {
    let sender = Arc::new(CapturingSender::default());
    let controller = FlowEngineBuilder::new(settings())
        .extensions(test_registry())
        .protocol_sender(sender.clone())
        .build()
        .expect("controller builds");
    controller.initialize_flow().expect("initialize");
    controller.start_heartbeating().expect("heartbeating");

    controller.context().repositories.bulletins.add(Bulletin {
        id: 0,
        category: "Log Message".to_string(),
        severity: BulletinSeverity::Warning,
        source_id: Some("p1".to_string()),
        message: "bad\u{01}byte".to_string(),
        timestamp: Utc::now(),
    });

    tokio::time::sleep(Duration::from_millis(2600)).await;

    let bundles = sender.bulletins.lock().clone();
    assert!(!bundles.is_empty(), "bulletins were forwarded");
    let message = &bundles[0].bulletins[0].message;
    assert_eq!(message, "bad?byte", "XML-illegal characters are escaped");

    controller.shutdown(false).await.expect("shutdown");
}
