//! Contracts for the delegated repositories
//!
//! The controller owns no durable state of its own; everything durable is
//! delegated through these traits. In-memory defaults live in
//! [`memory`] so the controller is usable stand-alone.

pub mod memory;

use crate::claim::ContentClaimManager;
use crate::error::EngineResult;
use crate::flowfile::{ContentClaimRef, FlowFileRecord};
use crate::heartbeat::{HeartbeatMessage, NodeBulletinsMessage};
use crate::status::ProcessGroupStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Kind of change captured by a repository record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepositoryRecordType {
    /// A new flow file entered the flow
    Create,
    /// An existing flow file changed attributes, content, or queue
    Update,
    /// A flow file left the flow
    Delete,
}

/// One entry of a flow-file repository batch update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryRecord {
    /// The record after the change
    pub record: FlowFileRecord,
    /// Kind of change
    pub record_type: RepositoryRecordType,
    /// Queue the record now resides on, if any
    pub destination_queue: Option<String>,
}

/// Durable index of in-flight flow files.
pub trait FlowFileRepository: Send + Sync {
    /// Prepare the repository for use.
    fn initialize(&self) -> EngineResult<()>;
    /// Recover persisted records; returns the highest sequence id seen.
    fn load(&self) -> EngineResult<u64>;
    /// Issue the next flow-file sequence id.
    fn next_sequence(&self) -> u64;
    /// Durably apply a batch of record changes.
    fn update_repository(&self, records: &[RepositoryRecord]) -> EngineResult<()>;
    /// Whether the repository loses its contents on restart.
    fn is_volatile(&self) -> bool;
    /// Release resources.
    fn close(&self) -> EngineResult<()>;
}

/// Blob store for flow-file content.
pub trait ContentRepository: Send + Sync {
    /// Prepare the repository; the claim manager tracks claimant counts.
    fn initialize(&self, claims: Arc<ContentClaimManager>) -> EngineResult<()>;
    /// Whether the claim's content can still be read.
    fn is_accessible(&self, claim: &ContentClaimRef) -> EngineResult<bool>;
    /// Read the content span identified by the claim.
    fn read(&self, claim: &ContentClaimRef) -> EngineResult<Vec<u8>>;
    /// Reclaim storage for unclaimed content.
    fn cleanup(&self);
    /// Release resources.
    fn shutdown(&self);
}

/// Kind of provenance event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvenanceEventType {
    /// Flow file created from external input
    Create,
    /// Flow file received from a remote system
    Receive,
    /// Flow file sent to a remote system
    Send,
    /// Flow file dropped from the flow
    Drop,
    /// Flow file removed because it aged past the queue expiration
    Expire,
    /// Flow file split into children
    Fork,
    /// Flow file created by combining multiple parents
    Join,
    /// Flow file cloned
    Clone,
    /// Flow file routed on a relationship
    Route,
    /// Content was replaced
    ContentModified,
    /// Attributes were modified
    AttributesModified,
    /// Flow file re-created from a prior event's content claim
    Replay,
}

/// Immutable audit record describing one transformation of a flow file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceEventRecord {
    /// Identifier assigned by the repository on registration
    pub id: u64,
    /// Event kind
    pub event_type: ProvenanceEventType,
    /// UUID of the flow file the event describes
    pub flowfile_uuid: String,
    /// Parent flow-file UUIDs (multiple for Join)
    pub parent_uuids: Vec<String>,
    /// Child flow-file UUIDs
    pub child_uuids: Vec<String>,
    /// Identifier of the component that emitted the event
    pub component_id: String,
    /// Attribute map of the flow file at event time
    pub attributes: std::collections::HashMap<String, String>,
    /// Content claim before the event, if any
    pub previous_claim: Option<ContentClaimRef>,
    /// Identifier of the queue the flow file was taken from, if any
    pub source_queue_id: Option<String>,
    /// Free-form details
    pub details: Option<String>,
    /// Event timestamp
    pub timestamp: DateTime<Utc>,
}

/// Append-only audit log of flow-file transformations.
pub trait ProvenanceRepository: Send + Sync {
    /// Prepare the repository for use.
    fn initialize(&self) -> EngineResult<()>;
    /// Append an event; the repository assigns and returns its id.
    fn register_event(&self, event: ProvenanceEventRecord) -> EngineResult<u64>;
    /// Fetch one event by id.
    fn event(&self, id: u64) -> EngineResult<Option<ProvenanceEventRecord>>;
    /// Fetch up to `max` events starting at `first_id`.
    fn events(&self, first_id: u64, max: usize) -> EngineResult<Vec<ProvenanceEventRecord>>;
    /// Release resources.
    fn close(&self) -> EngineResult<()>;
}

/// Severity of a bulletin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BulletinSeverity {
    /// Diagnostic detail
    Debug,
    /// Informational
    Info,
    /// Needs operator attention
    Warning,
    /// Failure
    Error,
}

/// Transient diagnostic record surfaced to operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bulletin {
    /// Monotone bulletin id
    pub id: u64,
    /// Category label, e.g. "Log Message"
    pub category: String,
    /// Severity
    pub severity: BulletinSeverity,
    /// Identifier of the component the bulletin concerns, if any
    pub source_id: Option<String>,
    /// Human-readable message
    pub message: String,
    /// Creation timestamp
    pub timestamp: DateTime<Utc>,
}

/// In-memory diagnostic feed.
pub trait BulletinRepository: Send + Sync {
    /// Publish a bulletin.
    fn add(&self, bulletin: Bulletin);
    /// Take all node-level bulletins accumulated since the last drain.
    fn drain_node_bulletins(&self) -> Vec<Bulletin>;
}

/// Overflow spill for queues too large to hold in memory.
pub trait FlowFileSwapManager: Send + Sync {
    /// Discard all swapped content.
    fn purge(&self) -> EngineResult<()>;
    /// Recover swapped flow files; returns the highest sequence id seen.
    fn recover_swapped(&self, claims: Arc<ContentClaimManager>) -> EngineResult<u64>;
    /// Start background swapping.
    fn start(&self) -> EngineResult<()>;
    /// Stop background swapping.
    fn shutdown(&self);
}

/// Bounded history of aggregated status snapshots.
pub trait ComponentStatusRepository: Send + Sync {
    /// Append one aggregated snapshot.
    fn capture(&self, status: &ProcessGroupStatus);
    /// Most recent snapshot, if any.
    fn latest(&self) -> Option<ProcessGroupStatus>;
    /// Snapshots captured in `[from, to]`, newest last, at most `max_points`.
    fn history(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        max_points: usize,
    ) -> Vec<(DateTime<Utc>, ProcessGroupStatus)>;
}

/// Transport used to reach the cluster manager.
pub trait NodeProtocolSender: Send + Sync {
    /// Transmit a heartbeat message.
    fn heartbeat(&self, message: &HeartbeatMessage) -> EngineResult<()>;
    /// Transmit bundled node bulletins.
    fn send_bulletins(&self, message: &NodeBulletinsMessage) -> EngineResult<()>;
}

/// The full set of delegated repositories consumed by the controller.
#[derive(Clone)]
pub struct RepositorySet {
    /// Durable flow-file index
    pub flowfile: Arc<dyn FlowFileRepository>,
    /// Content blob store
    pub content: Arc<dyn ContentRepository>,
    /// Provenance event log
    pub provenance: Arc<dyn ProvenanceRepository>,
    /// Diagnostic feed
    pub bulletins: Arc<dyn BulletinRepository>,
    /// Overflow spill
    pub swap: Arc<dyn FlowFileSwapManager>,
    /// Status history
    pub status: Arc<dyn ComponentStatusRepository>,
}

impl RepositorySet {
    /// A fully in-memory repository set.
    pub fn in_memory(history_samples: usize) -> Self {
        Self {
            flowfile: Arc::new(memory::InMemoryFlowFileRepository::new()),
            content: Arc::new(memory::InMemoryContentRepository::new()),
            provenance: Arc::new(memory::InMemoryProvenanceRepository::new()),
            bulletins: Arc::new(memory::InMemoryBulletinRepository::new()),
            swap: Arc::new(memory::NoopSwapManager),
            status: Arc::new(memory::InMemoryStatusRepository::new(history_samples)),
        }
    }
}
