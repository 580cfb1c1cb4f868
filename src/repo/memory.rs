//! In-memory repository implementations
//!
//! Default, non-durable implementations of the repository contracts. They
//! keep the controller fully functional stand-alone and are what the test
//! suite runs against.

use super::{
    Bulletin, BulletinRepository, ComponentStatusRepository, ContentRepository,
    FlowFileRepository, FlowFileSwapManager, NodeProtocolSender, ProvenanceEventRecord,
    ProvenanceRepository, RepositoryRecord, RepositoryRecordType,
};
use crate::claim::ContentClaimManager;
use crate::error::{EngineError, EngineResult};
use crate::flowfile::ContentClaimRef;
use crate::heartbeat::{HeartbeatMessage, NodeBulletinsMessage};
use crate::status::ProcessGroupStatus;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Volatile flow-file repository backed by a map keyed by record UUID.
#[derive(Default)]
pub struct InMemoryFlowFileRepository {
    sequence: AtomicU64,
    records: RwLock<HashMap<String, RepositoryRecord>>,
}

impl InMemoryFlowFileRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-deleted) records, for assertions.
    pub fn live_count(&self) -> usize {
        self.records.read().len()
    }
}

impl FlowFileRepository for InMemoryFlowFileRepository {
    fn initialize(&self) -> EngineResult<()> {
        Ok(())
    }

    fn load(&self) -> EngineResult<u64> {
        Ok(self.sequence.load(Ordering::SeqCst))
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn update_repository(&self, records: &[RepositoryRecord]) -> EngineResult<()> {
        let mut map = self.records.write();
        for entry in records {
            let uuid = entry.record.uuid().to_string();
            match entry.record_type {
                RepositoryRecordType::Delete => {
                    map.remove(&uuid);
                }
                RepositoryRecordType::Create | RepositoryRecordType::Update => {
                    map.insert(uuid, entry.clone());
                }
            }
        }
        Ok(())
    }

    fn is_volatile(&self) -> bool {
        true
    }

    fn close(&self) -> EngineResult<()> {
        Ok(())
    }
}

/// Content store holding blobs in a map keyed by claim identity.
#[derive(Default)]
pub struct InMemoryContentRepository {
    blobs: RwLock<HashMap<(String, String, String), Vec<u8>>>,
    claims: RwLock<Option<Arc<ContentClaimManager>>>,
}

impl InMemoryContentRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store content for a claim (test seam; real repositories write through
    /// a session).
    pub fn put(&self, claim: &ContentClaimRef, bytes: Vec<u8>) {
        let key = (
            claim.claim.container.clone(),
            claim.claim.section.clone(),
            claim.claim.id.clone(),
        );
        self.blobs.write().insert(key, bytes);
    }

    /// Remove content for a claim (test seam).
    pub fn remove(&self, claim: &ContentClaimRef) {
        let key = (
            claim.claim.container.clone(),
            claim.claim.section.clone(),
            claim.claim.id.clone(),
        );
        self.blobs.write().remove(&key);
    }
}

impl ContentRepository for InMemoryContentRepository {
    fn initialize(&self, claims: Arc<ContentClaimManager>) -> EngineResult<()> {
        *self.claims.write() = Some(claims);
        Ok(())
    }

    fn is_accessible(&self, claim: &ContentClaimRef) -> EngineResult<bool> {
        let key = (
            claim.claim.container.clone(),
            claim.claim.section.clone(),
            claim.claim.id.clone(),
        );
        Ok(self.blobs.read().contains_key(&key))
    }

    fn read(&self, claim: &ContentClaimRef) -> EngineResult<Vec<u8>> {
        let key = (
            claim.claim.container.clone(),
            claim.claim.section.clone(),
            claim.claim.id.clone(),
        );
        self.blobs
            .read()
            .get(&key)
            .map(|bytes| {
                let start = (claim.offset as usize).min(bytes.len());
                let end = ((claim.offset + claim.size) as usize).min(bytes.len());
                bytes[start..end].to_vec()
            })
            .ok_or_else(|| {
                EngineError::Repository(format!("Content claim {} not found", claim.claim))
            })
    }

    fn cleanup(&self) {
        let Some(claims) = self.claims.read().clone() else {
            return;
        };
        let mut blobs = self.blobs.write();
        blobs.retain(|(container, section, id), _| {
            let claim = crate::claim::ContentClaim::new(
                container.clone(),
                section.clone(),
                id.clone(),
                false,
            );
            claims.claimant_count(&claim) > 0
        });
    }

    fn shutdown(&self) {}
}

/// Append-only provenance log backed by a vector.
#[derive(Default)]
pub struct InMemoryProvenanceRepository {
    next_id: AtomicU64,
    events: RwLock<Vec<ProvenanceEventRecord>>,
}

impl InMemoryProvenanceRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProvenanceRepository for InMemoryProvenanceRepository {
    fn initialize(&self) -> EngineResult<()> {
        Ok(())
    }

    fn register_event(&self, mut event: ProvenanceEventRecord) -> EngineResult<u64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        event.id = id;
        self.events.write().push(event);
        Ok(id)
    }

    fn event(&self, id: u64) -> EngineResult<Option<ProvenanceEventRecord>> {
        Ok(self.events.read().iter().find(|e| e.id == id).cloned())
    }

    fn events(&self, first_id: u64, max: usize) -> EngineResult<Vec<ProvenanceEventRecord>> {
        Ok(self
            .events
            .read()
            .iter()
            .filter(|e| e.id >= first_id)
            .take(max)
            .cloned()
            .collect())
    }

    fn close(&self) -> EngineResult<()> {
        Ok(())
    }
}

/// Bounded in-memory bulletin feed.
pub struct InMemoryBulletinRepository {
    next_id: AtomicU64,
    pending: Mutex<Vec<Bulletin>>,
    max_pending: usize,
}

impl InMemoryBulletinRepository {
    /// Create a feed retaining at most 1000 undrained bulletins.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            pending: Mutex::new(Vec::new()),
            max_pending: 1000,
        }
    }
}

impl Default for InMemoryBulletinRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl BulletinRepository for InMemoryBulletinRepository {
    fn add(&self, mut bulletin: Bulletin) {
        bulletin.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut pending = self.pending.lock();
        if pending.len() >= self.max_pending {
            pending.remove(0);
        }
        pending.push(bulletin);
    }

    fn drain_node_bulletins(&self) -> Vec<Bulletin> {
        std::mem::take(&mut *self.pending.lock())
    }
}

/// Swap manager that never spills; queues are bounded by back-pressure.
pub struct NoopSwapManager;

impl FlowFileSwapManager for NoopSwapManager {
    fn purge(&self) -> EngineResult<()> {
        Ok(())
    }

    fn recover_swapped(&self, _claims: Arc<ContentClaimManager>) -> EngineResult<u64> {
        Ok(0)
    }

    fn start(&self) -> EngineResult<()> {
        Ok(())
    }

    fn shutdown(&self) {}
}

/// Fixed-size reservoir of aggregated status snapshots.
pub struct InMemoryStatusRepository {
    samples: Mutex<VecDeque<(DateTime<Utc>, ProcessGroupStatus)>>,
    capacity: usize,
}

impl InMemoryStatusRepository {
    /// Create a reservoir holding `capacity` snapshots.
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    /// Number of captured snapshots, for assertions.
    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    /// Whether no snapshot has been captured yet.
    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }
}

impl ComponentStatusRepository for InMemoryStatusRepository {
    fn capture(&self, status: &ProcessGroupStatus) {
        let mut samples = self.samples.lock();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back((Utc::now(), status.clone()));
    }

    fn latest(&self) -> Option<ProcessGroupStatus> {
        self.samples.lock().back().map(|(_, status)| status.clone())
    }

    fn history(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        max_points: usize,
    ) -> Vec<(DateTime<Utc>, ProcessGroupStatus)> {
        let samples = self.samples.lock();
        let mut points: Vec<_> = samples
            .iter()
            .filter(|(ts, _)| from.map(|f| *ts >= f).unwrap_or(true))
            .filter(|(ts, _)| to.map(|t| *ts <= t).unwrap_or(true))
            .cloned()
            .collect();
        if points.len() > max_points {
            let skip = points.len() - max_points;
            points.drain(0..skip);
        }
        points
    }
}

/// Protocol sender that logs instead of transmitting; the stand-alone
/// default when no cluster manager is configured.
pub struct LoggingProtocolSender;

impl NodeProtocolSender for LoggingProtocolSender {
    fn heartbeat(&self, message: &HeartbeatMessage) -> EngineResult<()> {
        let wire_bytes = serde_json::to_vec(message)
            .map(|bytes| bytes.len())
            .unwrap_or(0);
        tracing::debug!(
            node = %message.node_id,
            queued_objects = message.payload.total_queued_count,
            wire_bytes,
            "Heartbeat (no cluster manager configured)"
        );
        Ok(())
    }

    fn send_bulletins(&self, message: &NodeBulletinsMessage) -> EngineResult<()> {
        tracing::debug!(
            node = %message.node_id,
            bulletins = message.bulletins.len(),
            "Node bulletins (no cluster manager configured)"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowfile::FlowFileBuilder;

    #[test]
    fn test_flowfile_repository_sequence() {
        let repo = InMemoryFlowFileRepository::new();
        assert_eq!(repo.next_sequence(), 1);
        assert_eq!(repo.next_sequence(), 2);
        assert_eq!(repo.load().expect("load"), 2);
    }

    #[test]
    fn test_flowfile_repository_delete_removes() {
        let repo = InMemoryFlowFileRepository::new();
        let record = FlowFileBuilder::new(repo.next_sequence()).build();
        repo.update_repository(&[RepositoryRecord {
            record: record.clone(),
            record_type: RepositoryRecordType::Create,
            destination_queue: Some("q1".to_string()),
        }])
        .expect("update");
        assert_eq!(repo.live_count(), 1);
        repo.update_repository(&[RepositoryRecord {
            record,
            record_type: RepositoryRecordType::Delete,
            destination_queue: None,
        }])
        .expect("update");
        assert_eq!(repo.live_count(), 0);
    }

    #[test]
    fn test_provenance_ids_are_assigned() {
        let repo = InMemoryProvenanceRepository::new();
        let event = ProvenanceEventRecord {
            id: 999,
            event_type: super::super::ProvenanceEventType::Create,
            flowfile_uuid: "uuid-1".to_string(),
            parent_uuids: vec![],
            child_uuids: vec![],
            component_id: "p1".to_string(),
            attributes: Default::default(),
            previous_claim: None,
            source_queue_id: None,
            details: None,
            timestamp: Utc::now(),
        };
        let id = repo.register_event(event).expect("register");
        assert_eq!(id, 0);
        assert!(repo.event(0).expect("event").is_some());
        assert!(repo.event(999).expect("event").is_none());
    }

    #[test]
    fn test_bulletin_drain_empties_feed() {
        let repo = InMemoryBulletinRepository::new();
        repo.add(Bulletin {
            id: 0,
            category: "Log Message".to_string(),
            severity: super::super::BulletinSeverity::Warning,
            source_id: None,
            message: "queue full".to_string(),
            timestamp: Utc::now(),
        });
        assert_eq!(repo.drain_node_bulletins().len(), 1);
        assert!(repo.drain_node_bulletins().is_empty());
    }

    #[test]
    fn test_status_reservoir_is_bounded() {
        let repo = InMemoryStatusRepository::new(3);
        for _ in 0..5 {
            repo.capture(&ProcessGroupStatus::default());
        }
        assert_eq!(repo.len(), 3);
    }
}
