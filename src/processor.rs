//! Processor plug-ins and the per-trigger session
//!
//! A processor declares its relationships and is handed a session on each
//! trigger. The session pulls from inbound queues, routes transferred flow
//! files to the outbound connections subscribing to each relationship, and
//! on commit applies the whole batch to the flow-file repository and the
//! provenance log. Ports and funnels relay through the same session.

use crate::context::EngineContext;
use crate::error::EngineResult;
use crate::flowfile::{attributes, FlowFileBuilder, FlowFileRecord};
use crate::graph::{Connection, ConnectableNode};
use crate::repo::{
    ProvenanceEventRecord, ProvenanceEventType, RepositoryRecord, RepositoryRecordType,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Relationship name used by ports and funnels, which have a single
/// unnamed output branch.
pub const RELAY_RELATIONSHIP: &str = "";

/// A named output branch declared by a processor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relationship {
    /// Relationship name
    pub name: String,
    /// What routing to this relationship means
    pub description: String,
}

impl Relationship {
    /// Create a relationship with an empty description.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
        }
    }
}

/// A processing plug-in. Lifecycle hooks default to no-ops; the controller
/// invokes each exactly when declared by the lifecycle (`on_added` once at
/// first registration, `on_scheduled`/`on_unscheduled` around Running,
/// `on_removed` at deletion, `on_shutdown` at controller shutdown).
#[async_trait]
pub trait Processor: Send + Sync {
    /// Output branches this processor may route to.
    fn relationships(&self) -> Vec<Relationship>;

    /// Validity predicate gating the start transition.
    fn is_valid(&self) -> bool {
        true
    }

    /// Process one batch of work.
    async fn on_trigger(&self, session: &mut ProcessSession) -> EngineResult<()>;

    /// Invoked once when the processor is first added to the graph.
    fn on_added(&self) -> EngineResult<()> {
        Ok(())
    }

    /// Invoked when the processor is removed from the graph.
    fn on_removed(&self) -> EngineResult<()> {
        Ok(())
    }

    /// Invoked when the processor transitions to Running.
    fn on_scheduled(&self) -> EngineResult<()> {
        Ok(())
    }

    /// Invoked when the processor leaves Running.
    fn on_unscheduled(&self) -> EngineResult<()> {
        Ok(())
    }

    /// Invoked at controller shutdown.
    fn on_shutdown(&self) {}
}

/// Context handed to reporting tasks on each trigger.
pub struct ReportingContext {
    context: Arc<EngineContext>,
}

impl ReportingContext {
    pub(crate) fn new(context: Arc<EngineContext>) -> Self {
        Self { context }
    }

    /// Most recent aggregated status snapshot, if one has been captured.
    pub fn latest_status(&self) -> Option<crate::status::ProcessGroupStatus> {
        self.context.repositories.status.latest()
    }

    /// Snapshot of the named counters.
    pub fn counters(&self) -> Vec<(String, i64)> {
        self.context.counters.snapshot()
    }

    /// Publish a bulletin.
    pub fn bulletin(
        &self,
        severity: crate::repo::BulletinSeverity,
        source_id: Option<String>,
        message: impl Into<String>,
    ) {
        self.context.repositories.bulletins.add(crate::repo::Bulletin {
            id: 0,
            category: "Reporting Task".to_string(),
            severity,
            source_id,
            message: message.into(),
            timestamp: Utc::now(),
        });
    }
}

/// A reporting plug-in scheduled like a processor but without queues.
#[async_trait]
pub trait ReportingTask: Send + Sync {
    /// Produce one report.
    async fn on_trigger(&self, context: &ReportingContext) -> EngineResult<()>;

    /// Invoked when the task transitions to Running.
    fn on_scheduled(&self) -> EngineResult<()> {
        Ok(())
    }

    /// Invoked when the task leaves Running.
    fn on_unscheduled(&self) -> EngineResult<()> {
        Ok(())
    }

    /// Invoked at controller shutdown.
    fn on_shutdown(&self) {}
}

struct PulledRecord {
    original: FlowFileRecord,
    source: Arc<Connection>,
}

/// The unit-of-work session handed to a component on each trigger.
///
/// All changes are buffered and applied on [`commit`](Self::commit); an
/// error path rolls back by returning pulled records to their queues.
pub struct ProcessSession {
    node: Arc<ConnectableNode>,
    context: Arc<EngineContext>,
    outstanding: HashMap<u64, PulledRecord>,
    created: Vec<u64>,
    transfers: Vec<(FlowFileRecord, String)>,
    removals: Vec<(FlowFileRecord, String)>,
    transmissions: Vec<FlowFileRecord>,
    expired: Vec<FlowFileRecord>,
    poll_cursor: usize,
}

impl ProcessSession {
    pub(crate) fn new(node: Arc<ConnectableNode>, context: Arc<EngineContext>) -> Self {
        Self {
            node,
            context,
            outstanding: HashMap::new(),
            created: Vec::new(),
            transfers: Vec::new(),
            removals: Vec::new(),
            transmissions: Vec::new(),
            expired: Vec::new(),
            poll_cursor: 0,
        }
    }

    /// The component this session runs for.
    pub fn component_id(&self) -> String {
        self.node.id().to_string()
    }

    /// Pull the next available flow file from the inbound queues,
    /// round-robin across connections.
    pub fn get(&mut self) -> Option<FlowFileRecord> {
        let incoming = self.node.incoming();
        if incoming.is_empty() {
            return None;
        }
        for offset in 0..incoming.len() {
            let index = (self.poll_cursor + offset) % incoming.len();
            let connection = &incoming[index];
            let polled = connection.queue().poll();
            self.expired.extend(polled.expired);
            if let Some(record) = polled.record {
                self.poll_cursor = index + 1;
                self.outstanding.insert(
                    record.id,
                    PulledRecord {
                        original: record.clone(),
                        source: connection.clone(),
                    },
                );
                return Some(record);
            }
        }
        None
    }

    /// Create a new flow file with the given attributes.
    pub fn create(&mut self, attrs: HashMap<String, String>) -> FlowFileRecord {
        let id = self.context.repositories.flowfile.next_sequence();
        let record = FlowFileBuilder::new(id).attributes(attrs).build();
        self.created.push(id);
        record
    }

    /// Read the content of a flow file.
    pub fn read(&self, record: &FlowFileRecord) -> EngineResult<Vec<u8>> {
        let Some(content) = &record.content else {
            return Ok(Vec::new());
        };
        let bytes = self.context.repositories.content.read(content)?;
        self.node.totals().add_bytes_read(bytes.len() as u64);
        Ok(bytes)
    }

    /// Route a flow file to a relationship. Takes effect at commit.
    pub fn transfer(&mut self, record: FlowFileRecord, relationship: impl Into<String>) {
        self.transfers.push((record, relationship.into()));
    }

    /// Drop a flow file from the flow. Takes effect at commit.
    pub fn remove(&mut self, record: FlowFileRecord, reason: impl Into<String>) {
        self.removals.push((record, reason.into()));
    }

    /// Mark a flow file as transmitted to a remote instance. Takes effect at
    /// commit.
    pub fn transmit(&mut self, record: FlowFileRecord) {
        self.transmissions.push(record);
    }

    /// Adjust a named counter.
    pub fn adjust_counter(&self, name: &str, delta: i64) {
        self.context.counters.adjust(name, delta);
    }

    /// Apply the session: route transfers, apply removals, update the
    /// flow-file repository in one batch, and register provenance. Pulled
    /// records the component did not account for are returned to their
    /// source queues.
    pub fn commit(mut self) -> EngineResult<()> {
        let mut batch: Vec<RepositoryRecord> = Vec::new();
        let mut input_count = 0u64;
        let mut input_bytes = 0u64;
        let mut output_count = 0u64;
        let mut output_bytes = 0u64;
        let component_id = self.node.id().to_string();

        // Expired records seen while polling leave the flow entirely.
        for record in std::mem::take(&mut self.expired) {
            self.drop_record(&record, RepositoryRecordType::Delete, &mut batch);
            self.register_event(
                ProvenanceEventType::Expire,
                &record,
                None,
                Some("flow file exceeded queue expiration".to_string()),
            );
        }

        let transfers = std::mem::take(&mut self.transfers);
        for (record, relationship) in transfers {
            let pulled = self.outstanding.remove(&record.id);
            if let Some(pulled) = &pulled {
                input_count += 1;
                input_bytes += pulled.original.content_size();
            }
            let targets = self.node.connections_for_relationship(&relationship);
            if targets.is_empty() {
                // No subscriber: the relationship is implicitly
                // auto-terminated and the flow file leaves the flow.
                self.drop_record(&record, RepositoryRecordType::Delete, &mut batch);
                self.register_event(
                    ProvenanceEventType::Drop,
                    &record,
                    pulled.as_ref().map(|p| p.source.queue().id().to_string()),
                    Some(format!("no connection for relationship '{}'", relationship)),
                );
                continue;
            }

            for (index, connection) in targets.iter().enumerate() {
                let outgoing = if index == 0 {
                    record.clone()
                } else {
                    let clone = self.clone_record(&record);
                    self.register_clone_event(&record, &clone);
                    clone
                };
                let record_type = if index > 0 || self.created.contains(&record.id) {
                    RepositoryRecordType::Create
                } else {
                    RepositoryRecordType::Update
                };
                batch.push(RepositoryRecord {
                    record: outgoing.clone(),
                    record_type,
                    destination_queue: Some(connection.queue().id().to_string()),
                });
                output_count += 1;
                output_bytes += outgoing.content_size();
                let event_type = if self.created.contains(&record.id) {
                    ProvenanceEventType::Create
                } else {
                    ProvenanceEventType::Route
                };
                if index == 0 {
                    let source_queue = pulled
                        .as_ref()
                        .map(|p| p.source.queue().id().to_string())
                        .or_else(|| Some(connection.queue().id().to_string()));
                    self.register_event(event_type, &outgoing, source_queue, None);
                }
                connection.queue().offer(outgoing);
            }
        }

        let removals = std::mem::take(&mut self.removals);
        for (record, reason) in removals {
            let pulled = self.outstanding.remove(&record.id);
            if let Some(pulled) = &pulled {
                input_count += 1;
                input_bytes += pulled.original.content_size();
            }
            self.drop_record(&record, RepositoryRecordType::Delete, &mut batch);
            self.register_event(
                ProvenanceEventType::Drop,
                &record,
                pulled.as_ref().map(|p| p.source.queue().id().to_string()),
                Some(reason),
            );
        }

        let transmissions = std::mem::take(&mut self.transmissions);
        for record in transmissions {
            let pulled = self.outstanding.remove(&record.id);
            if let Some(pulled) = &pulled {
                input_count += 1;
                input_bytes += pulled.original.content_size();
            }
            self.node.totals().add_sent(1, record.content_size());
            self.drop_record(&record, RepositoryRecordType::Delete, &mut batch);
            self.register_event(
                ProvenanceEventType::Send,
                &record,
                pulled.as_ref().map(|p| p.source.queue().id().to_string()),
                None,
            );
        }

        // Anything pulled but unaccounted for goes back where it came from.
        for (_, pulled) in std::mem::take(&mut self.outstanding) {
            tracing::debug!(
                component = %component_id,
                flowfile = %pulled.original.uuid(),
                "Returning unaccounted flow file to its source queue"
            );
            pulled.source.queue().offer(pulled.original);
        }

        self.context.repositories.flowfile.update_repository(&batch)?;
        self.node.totals().add_input(input_count, input_bytes);
        self.node.totals().add_output(output_count, output_bytes);
        Ok(())
    }

    /// Discard the session, returning every pulled record to its source
    /// queue.
    pub fn rollback(mut self) {
        for (_, pulled) in std::mem::take(&mut self.outstanding) {
            pulled.source.queue().offer(pulled.original);
        }
    }

    fn clone_record(&self, record: &FlowFileRecord) -> FlowFileRecord {
        let mut clone = record.clone();
        clone.id = self.context.repositories.flowfile.next_sequence();
        clone
            .attributes
            .insert(attributes::UUID.to_string(), Uuid::new_v4().to_string());
        if let Some(content) = &clone.content {
            self.context.claims.increment(&content.claim);
        }
        clone
    }

    fn drop_record(
        &self,
        record: &FlowFileRecord,
        record_type: RepositoryRecordType,
        batch: &mut Vec<RepositoryRecord>,
    ) {
        if let Some(content) = &record.content {
            self.context.claims.decrement(&content.claim);
        }
        batch.push(RepositoryRecord {
            record: record.clone(),
            record_type,
            destination_queue: None,
        });
    }

    fn register_event(
        &self,
        event_type: ProvenanceEventType,
        record: &FlowFileRecord,
        source_queue_id: Option<String>,
        details: Option<String>,
    ) {
        let event = ProvenanceEventRecord {
            id: 0,
            event_type,
            flowfile_uuid: record.uuid().to_string(),
            parent_uuids: Vec::new(),
            child_uuids: Vec::new(),
            component_id: self.node.id().to_string(),
            attributes: record.attributes.clone(),
            previous_claim: record.content.clone(),
            source_queue_id,
            details,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.context.repositories.provenance.register_event(event) {
            tracing::warn!(component = %self.node.id(), error = %e, "Failed to register provenance event");
        }
    }

    fn register_clone_event(&self, parent: &FlowFileRecord, child: &FlowFileRecord) {
        let event = ProvenanceEventRecord {
            id: 0,
            event_type: ProvenanceEventType::Clone,
            flowfile_uuid: child.uuid().to_string(),
            parent_uuids: vec![parent.uuid().to_string()],
            child_uuids: vec![child.uuid().to_string()],
            component_id: self.node.id().to_string(),
            attributes: child.attributes.clone(),
            previous_claim: child.content.clone(),
            source_queue_id: None,
            details: None,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.context.repositories.provenance.register_event(event) {
            tracing::warn!(component = %self.node.id(), error = %e, "Failed to register provenance event");
        }
    }
}

/// Built-in trigger behaviour for ports and funnels: relay every available
/// inbound flow file downstream (or to the remote instance for remote input
/// ports).
pub(crate) fn relay_trigger(session: &mut ProcessSession, transmit: bool) {
    const RELAY_BATCH: usize = 100;
    for _ in 0..RELAY_BATCH {
        let Some(record) = session.get() else {
            break;
        };
        if transmit {
            session.transmit(record);
        } else {
            session.transfer(record, RELAY_RELATIONSHIP);
        }
    }
}

