//! In-process dataflow controller
//!
//! This crate provides the core of a dataflow execution engine:
//! - A live graph of processors, ports, funnels, and remote ports joined by
//!   queued connections with back-pressure and prioritisation
//! - A scheduling engine with timer, cron, event-driven, and
//!   primary-node-only strategies over two bounded worker pools
//! - Atomic graph mutation under a single reader-writer discipline,
//!   including all-or-nothing snippet instantiation
//! - Replay of flow files from prior provenance events
//! - Clustered heartbeating with single-slot snapshot semantics
//! - Tree-structured status aggregation into a bounded history
//!
//! Durable state is delegated to repository traits; in-memory defaults keep
//! the controller fully usable stand-alone.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod claim;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod extension;
pub mod flowfile;
pub mod graph;
pub mod heartbeat;
pub mod processor;
pub mod repo;
pub mod replay;
pub mod reporting;
pub mod scheduling;
pub mod snippet;
pub mod status;

pub use claim::{ContentClaim, ContentClaimManager};
pub use config::EngineSettings;
pub use context::{CounterRepository, EngineContext};
pub use controller::{
    ConnectionUpdate, FlowController, FlowEngineBuilder, ProcessorUpdate, TlsContext,
};
pub use error::{EngineError, EngineResult};
pub use flowfile::{FlowFileBuilder, FlowFileRecord};
pub use graph::{ConnectableKind, FlowFileQueue, Position, QueueSize};
pub use heartbeat::{HeartbeatBean, HeartbeatMessage, HeartbeatMonitor};
pub use processor::{ProcessSession, Processor, Relationship, ReportingTask};
pub use scheduling::{ScheduledState, SchedulingConfig, SchedulingStrategy};
pub use snippet::Snippet;
pub use status::ProcessGroupStatus;
