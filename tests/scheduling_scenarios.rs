//! Scheduling behaviour end to end: timer cadence, back-pressure, the
//! primary-node gate, failure penalisation, and shutdown budgets.

mod common;

use common::build_controller;
use flowgrid::scheduling::{SchedulingConfig, SchedulingStrategy};
use flowgrid::{ConnectionUpdate, EngineSettings, ScheduledState};
use std::time::{Duration, Instant};

fn timer_config(period: &str) -> SchedulingConfig {
    SchedulingConfig {
        strategy: SchedulingStrategy::TimerDriven,
        period: period.to_string(),
        max_concurrent_tasks: 1,
        yield_period: Duration::from_millis(200),
        penalization_period: Duration::from_millis(200),
    }
}

#[tokio::test]
async fn test_timer_driven_trigger_cadence() {
    let controller = build_controller(EngineSettings::default());
    let root = controller.root_group_id();

    controller
        .create_processor(&root, "p1", "generate", "test.Generating", timer_config("100 millis"))
        .expect("create processor");
    controller.create_funnel(&root, "f1").expect("create funnel");
    controller
        .create_connection(&root, "c1", "p1", "f1", vec!["success".to_string()])
        .expect("create connection");

    controller.start_processor("p1").expect("start");
    tokio::time::sleep(Duration::from_millis(1000)).await;
    controller.stop_processor("p1").expect("stop");
    // Let any in-flight trigger finish before counting.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let n = controller.invocation_count("p1").expect("count");
    assert!(
        (8..=12).contains(&n),
        "expected roughly 10 triggers in one second, saw {}",
        n
    );

    // Triggered work landed on the downstream queue.
    let size = controller.queue_size("c1").expect("queue size");
    assert_eq!(size.object_count as u64, n);

    // The processor's counter adjustments are visible through the façade.
    let generated = controller
        .counters()
        .into_iter()
        .find(|(name, _)| name == "generated")
        .map(|(_, value)| value)
        .unwrap_or(0);
    assert_eq!(generated as u64, n);

    controller.shutdown(false).await.expect("shutdown");
}

#[tokio::test]
async fn test_backpressure_suppresses_and_resumes_triggers() {
    let controller = build_controller(EngineSettings::default());
    let root = controller.root_group_id();

    controller
        .create_processor(&root, "p1", "generate", "test.Generating", timer_config("50 millis"))
        .expect("create processor");
    controller.create_funnel(&root, "f1").expect("create funnel");
    controller.create_funnel(&root, "f2").expect("create funnel");
    controller
        .create_connection(&root, "c1", "p1", "f1", vec!["success".to_string()])
        .expect("create connection");
    controller
        .create_connection(&root, "c2", "f1", "f2", vec![])
        .expect("create connection");
    controller
        .update_connection(
            "c1",
            ConnectionUpdate {
                object_threshold: Some(5),
                ..ConnectionUpdate::default()
            },
        )
        .expect("set threshold");

    // Only the producer runs; its outbound queue fills to the threshold.
    controller.start_processor("p1").expect("start");
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert!(controller.queue_size("c1").expect("size").object_count >= 5);
    let stalled_at = controller.invocation_count("p1").expect("count");

    // Full queue: triggers must have ceased.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let still_stalled = controller.invocation_count("p1").expect("count");
    assert!(
        still_stalled <= stalled_at + 1,
        "triggers should cease under back-pressure ({} -> {})",
        stalled_at,
        still_stalled
    );

    // Draining the queue lifts back-pressure and triggers resume.
    controller.start_connectable("f1").expect("start funnel");
    tokio::time::sleep(Duration::from_millis(800)).await;
    let resumed = controller.invocation_count("p1").expect("count");
    assert!(
        resumed > still_stalled,
        "triggers should resume after drain ({} -> {})",
        still_stalled,
        resumed
    );

    controller.shutdown(false).await.expect("shutdown");
}

#[tokio::test]
async fn test_primary_only_gated_on_primary_flag() {
    let controller = build_controller(EngineSettings::default());
    let root = controller.root_group_id();

    let config = SchedulingConfig {
        strategy: SchedulingStrategy::PrimaryNodeOnly,
        period: "100 millis".to_string(),
        max_concurrent_tasks: 1,
        yield_period: Duration::from_millis(200),
        penalization_period: Duration::from_millis(200),
    };
    controller
        .create_processor(&root, "p1", "primary-work", "test.Generating", config)
        .expect("create processor");
    controller.create_funnel(&root, "f1").expect("create funnel");
    controller
        .create_connection(&root, "c1", "p1", "f1", vec!["success".to_string()])
        .expect("create connection");

    controller.set_clustered(true, true);
    controller.set_primary(false);
    controller.start_processor("p1").expect("start");

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        controller.invocation_count("p1").expect("count"),
        0,
        "no triggers while not primary"
    );

    controller.set_primary(true);
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(
        controller.invocation_count("p1").expect("count") > 0,
        "triggers begin after the primary flag flips"
    );

    controller.shutdown(false).await.expect("shutdown");
}

#[tokio::test]
async fn test_failed_trigger_penalizes_component() {
    let controller = build_controller(EngineSettings::default());
    let root = controller.root_group_id();

    let config = SchedulingConfig {
        strategy: SchedulingStrategy::TimerDriven,
        period: "50 millis".to_string(),
        max_concurrent_tasks: 1,
        yield_period: Duration::from_millis(100),
        penalization_period: Duration::from_secs(60),
    };
    controller
        .create_processor(&root, "p1", "fails", "test.Failing", config)
        .expect("create processor");
    controller.create_funnel(&root, "f1").expect("create funnel");
    controller
        .create_connection(&root, "c1", "p1", "f1", vec!["success".to_string()])
        .expect("create connection");

    controller.start_processor("p1").expect("start");
    tokio::time::sleep(Duration::from_millis(700)).await;
    controller.stop_processor("p1").expect("stop");

    // First trigger fails and the long penalty suppresses the rest.
    let n = controller.invocation_count("p1").expect("count");
    assert!(n >= 1, "the processor triggered at least once");
    assert!(n <= 2, "penalisation suppressed further triggers, saw {}", n);

    controller.shutdown(false).await.expect("shutdown");
}

#[tokio::test]
async fn test_event_driven_component_runs_on_queue_activity() {
    let controller = build_controller(EngineSettings::default());
    let root = controller.root_group_id();

    controller
        .create_processor(&root, "p1", "generate", "test.Generating", timer_config("50 millis"))
        .expect("create processor");
    controller.create_funnel(&root, "f1").expect("create funnel");
    controller.create_funnel(&root, "f2").expect("create funnel");
    controller
        .create_connection(&root, "c1", "p1", "f1", vec!["success".to_string()])
        .expect("create connection");
    controller
        .create_connection(&root, "c2", "f1", "f2", vec![])
        .expect("create connection");

    // The funnel is event-driven: it only runs when c1 becomes non-empty.
    controller.start_connectable("f1").expect("start funnel");
    assert_eq!(controller.invocation_count("f1").expect("count"), 0);

    controller.start_processor("p1").expect("start");
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(
        controller.invocation_count("f1").expect("count") > 0,
        "queue activity woke the event-driven funnel"
    );
    assert!(
        controller.queue_size("c2").expect("size").object_count > 0,
        "relayed flow files reached the downstream queue"
    );

    controller.shutdown(false).await.expect("shutdown");
}

#[tokio::test]
async fn test_stop_rejected_from_stopped_state() {
    let controller = build_controller(EngineSettings::default());
    let root = controller.root_group_id();
    controller.create_funnel(&root, "f1").expect("create funnel");
    assert!(controller.stop_connectable("f1").is_err());
    assert_eq!(
        controller.connectable_state("f1").expect("state"),
        ScheduledState::Stopped
    );
    controller.shutdown(false).await.expect("shutdown");
}

#[tokio::test]
async fn test_graceful_shutdown_completes_within_budget() {
    let settings = EngineSettings {
        graceful_shutdown_seconds: 2,
        ..EngineSettings::default()
    };
    let controller = build_controller(settings);
    let root = controller.root_group_id();

    controller
        .create_processor(&root, "p1", "generate", "test.Generating", timer_config("50 millis"))
        .expect("create processor");
    controller.create_funnel(&root, "f1").expect("create funnel");
    controller
        .create_connection(&root, "c1", "p1", "f1", vec!["success".to_string()])
        .expect("create connection");
    controller.start_processor("p1").expect("start");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    let clean = controller.shutdown(false).await.expect("shutdown");
    assert!(clean, "no processor wedged, the drain is clean");
    assert!(
        started.elapsed() < Duration::from_secs(3),
        "shutdown stays within the budget"
    );
}
