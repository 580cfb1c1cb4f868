//! Graph vertices
//!
//! A connectable is any vertex able to produce or consume flow files:
//! processors run a plug-in on trigger; ports, funnels, and remote ports
//! relay. Endpoint adjacency lists are maintained by the graph under the
//! controller lock; everything a trigger touches (scheduled state, trigger
//! slots, totals) is lock-free.

use super::connection::Connection;
use super::Position;
use crate::processor::{Processor, Relationship};
use crate::scheduling::{ScheduleCell, SchedulingConfig};
use crate::status::EventTotals;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Kind of graph vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectableKind {
    /// Runs a processor plug-in on trigger
    Processor,
    /// Receives flow files into a group
    InputPort,
    /// Emits flow files out of a group
    OutputPort,
    /// Merges any number of connections into one
    Funnel,
    /// Sends flow files to a remote instance
    RemoteInputPort,
    /// Receives flow files from a remote instance
    RemoteOutputPort,
    /// Receives flow files into the root group from outside
    RootInputPort,
    /// Emits flow files from the root group to outside
    RootOutputPort,
}

impl ConnectableKind {
    /// Whether this vertex is any flavour of port.
    pub fn is_port(&self) -> bool {
        !matches!(self, ConnectableKind::Processor | ConnectableKind::Funnel)
    }

    /// Whether triggers relay rather than run a plug-in.
    pub fn is_relay(&self) -> bool {
        !matches!(self, ConnectableKind::Processor)
    }
}

/// A vertex of the flow graph.
pub struct ConnectableNode {
    id: String,
    kind: ConnectableKind,
    name: RwLock<String>,
    position: RwLock<Position>,
    parent_group: RwLock<String>,
    scheduling: RwLock<SchedulingConfig>,
    schedule: ScheduleCell,
    totals: EventTotals,
    incoming: RwLock<Vec<Arc<Connection>>>,
    outgoing: RwLock<Vec<Arc<Connection>>>,
    processor: Option<Arc<dyn Processor>>,
    type_name: Option<String>,
    relationships: Vec<Relationship>,
}

impl ConnectableNode {
    /// Create a non-processor vertex.
    pub fn new(
        id: impl Into<String>,
        kind: ConnectableKind,
        name: impl Into<String>,
        parent_group: impl Into<String>,
    ) -> Self {
        debug_assert!(kind != ConnectableKind::Processor);
        Self {
            id: id.into(),
            kind,
            name: RwLock::new(name.into()),
            position: RwLock::new(Position::default()),
            parent_group: RwLock::new(parent_group.into()),
            scheduling: RwLock::new(SchedulingConfig {
                strategy: crate::scheduling::SchedulingStrategy::EventDriven,
                ..SchedulingConfig::default()
            }),
            schedule: ScheduleCell::default(),
            totals: EventTotals::default(),
            incoming: RwLock::new(Vec::new()),
            outgoing: RwLock::new(Vec::new()),
            processor: None,
            type_name: None,
            relationships: Vec::new(),
        }
    }

    /// Create a processor vertex around its plug-in.
    pub fn processor(
        id: impl Into<String>,
        name: impl Into<String>,
        parent_group: impl Into<String>,
        type_name: impl Into<String>,
        plugin: Arc<dyn Processor>,
        scheduling: SchedulingConfig,
    ) -> Self {
        let relationships = plugin.relationships();
        Self {
            id: id.into(),
            kind: ConnectableKind::Processor,
            name: RwLock::new(name.into()),
            position: RwLock::new(Position::default()),
            parent_group: RwLock::new(parent_group.into()),
            scheduling: RwLock::new(scheduling),
            schedule: ScheduleCell::default(),
            totals: EventTotals::default(),
            incoming: RwLock::new(Vec::new()),
            outgoing: RwLock::new(Vec::new()),
            processor: Some(plugin),
            type_name: Some(type_name.into()),
            relationships,
        }
    }

    /// Stable identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Vertex kind.
    pub fn kind(&self) -> ConnectableKind {
        self.kind
    }

    /// Human-readable name.
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    /// Rename the vertex.
    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    /// Canvas position.
    pub fn position(&self) -> Position {
        *self.position.read()
    }

    /// Move the vertex on the canvas.
    pub fn set_position(&self, position: Position) {
        *self.position.write() = position;
    }

    /// Identifier of the containing group.
    pub fn parent_group(&self) -> String {
        self.parent_group.read().clone()
    }

    pub(crate) fn set_parent_group(&self, group_id: impl Into<String>) {
        *self.parent_group.write() = group_id.into();
    }

    /// Scheduling configuration snapshot.
    pub fn scheduling(&self) -> SchedulingConfig {
        self.scheduling.read().clone()
    }

    /// Replace the scheduling configuration. Callers verify the component is
    /// not running.
    pub fn set_scheduling(&self, config: SchedulingConfig) {
        *self.scheduling.write() = config;
    }

    /// Scheduled-state cell.
    pub fn schedule(&self) -> &ScheduleCell {
        &self.schedule
    }

    /// Event totals.
    pub fn totals(&self) -> &EventTotals {
        &self.totals
    }

    /// The processor plug-in, for processor vertices.
    pub fn plugin(&self) -> Option<&Arc<dyn Processor>> {
        self.processor.as_ref()
    }

    /// Registered plug-in type name, for processor vertices.
    pub fn type_name(&self) -> Option<&str> {
        self.type_name.as_deref()
    }

    /// Relationships declared by the plug-in (empty for relays).
    pub fn relationships(&self) -> &[Relationship] {
        &self.relationships
    }

    /// Inbound connections.
    pub fn incoming(&self) -> Vec<Arc<Connection>> {
        self.incoming.read().clone()
    }

    /// Outbound connections.
    pub fn outgoing(&self) -> Vec<Arc<Connection>> {
        self.outgoing.read().clone()
    }

    /// Whether the vertex has any attached connection.
    pub fn has_connections(&self) -> bool {
        !self.incoming.read().is_empty() || !self.outgoing.read().is_empty()
    }

    /// Outbound connections subscribing to the given relationship.
    pub fn connections_for_relationship(&self, relationship: &str) -> Vec<Arc<Connection>> {
        self.outgoing
            .read()
            .iter()
            .filter(|c| c.matches_relationship(relationship))
            .cloned()
            .collect()
    }

    pub(crate) fn add_incoming(&self, connection: Arc<Connection>) {
        self.incoming.write().push(connection);
    }

    pub(crate) fn add_outgoing(&self, connection: Arc<Connection>) {
        self.outgoing.write().push(connection);
    }

    pub(crate) fn remove_connection(&self, connection_id: &str) {
        self.incoming.write().retain(|c| c.id() != connection_id);
        self.outgoing.write().retain(|c| c.id() != connection_id);
    }

    /// Validity predicate gating the Stopped → Running transition.
    pub fn is_valid(&self) -> bool {
        match self.kind {
            ConnectableKind::Processor => self
                .processor
                .as_ref()
                .map(|p| p.is_valid())
                .unwrap_or(false),
            ConnectableKind::Funnel
            | ConnectableKind::InputPort
            | ConnectableKind::RootInputPort
            | ConnectableKind::RemoteOutputPort => !self.outgoing.read().is_empty(),
            ConnectableKind::OutputPort
            | ConnectableKind::RootOutputPort
            | ConnectableKind::RemoteInputPort => !self.incoming.read().is_empty(),
        }
    }
}

impl std::fmt::Debug for ConnectableNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectableNode")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("name", &self.name.read().clone())
            .field("state", &self.schedule.state())
            .finish()
    }
}
