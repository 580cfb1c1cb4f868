//! Shared fixtures for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use flowgrid::controller::{FlowController, FlowEngineBuilder};
use flowgrid::error::EngineResult;
use flowgrid::extension::ExtensionRegistry;
use flowgrid::heartbeat::{HeartbeatMessage, NodeBulletinsMessage};
use flowgrid::processor::{ProcessSession, Processor, Relationship};
use flowgrid::repo::NodeProtocolSender;
use flowgrid::EngineSettings;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Relationship every test processor routes to.
pub const SUCCESS: &str = "success";

/// Processor that emits one fresh flow file per trigger.
#[derive(Default)]
pub struct GeneratingProcessor;

#[async_trait]
impl Processor for GeneratingProcessor {
    fn relationships(&self) -> Vec<Relationship> {
        vec![Relationship::named(SUCCESS)]
    }

    async fn on_trigger(&self, session: &mut ProcessSession) -> EngineResult<()> {
        let record = session.create(HashMap::new());
        session.transfer(record, SUCCESS);
        session.adjust_counter("generated", 1);
        Ok(())
    }
}

/// Processor that fails every trigger.
#[derive(Default)]
pub struct FailingProcessor;

#[async_trait]
impl Processor for FailingProcessor {
    fn relationships(&self) -> Vec<Relationship> {
        vec![Relationship::named(SUCCESS)]
    }

    async fn on_trigger(&self, _session: &mut ProcessSession) -> EngineResult<()> {
        Err(flowgrid::EngineError::Internal(
            "simulated processing failure".to_string(),
        ))
    }
}

/// Registry with the test processor types registered.
pub fn test_registry() -> Arc<ExtensionRegistry> {
    let registry = ExtensionRegistry::new();
    registry.register_processor(
        "test.Generating",
        Arc::new(|| {
            let plugin: Arc<dyn Processor> = Arc::new(GeneratingProcessor);
            plugin
        }),
    );
    registry.register_processor(
        "test.Failing",
        Arc::new(|| {
            let plugin: Arc<dyn Processor> = Arc::new(FailingProcessor);
            plugin
        }),
    );
    Arc::new(registry)
}

/// Install a test subscriber once so `RUST_LOG` works during test runs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Build an initialized controller around the test registry.
pub fn build_controller(settings: EngineSettings) -> Arc<FlowController> {
    init_tracing();
    let controller = FlowEngineBuilder::new(settings)
        .extensions(test_registry())
        .build()
        .expect("controller builds");
    controller.initialize_flow().expect("flow initializes");
    controller
}

/// Protocol sender that records everything it is asked to transmit.
#[derive(Default)]
pub struct CapturingSender {
    /// Transmitted heartbeats
    pub heartbeats: Mutex<Vec<HeartbeatMessage>>,
    /// Transmitted bulletin bundles
    pub bulletins: Mutex<Vec<NodeBulletinsMessage>>,
}

impl NodeProtocolSender for CapturingSender {
    fn heartbeat(&self, message: &HeartbeatMessage) -> EngineResult<()> {
        self.heartbeats.lock().push(message.clone());
        Ok(())
    }

    fn send_bulletins(&self, message: &NodeBulletinsMessage) -> EngineResult<()> {
        self.bulletins.lock().push(message.clone());
        Ok(())
    }
}
