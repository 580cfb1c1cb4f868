//! Graph edges
//!
//! A connection carries flow files from one connectable to another and owns
//! the queue between them. Endpoints are fixed at creation; rerouting means
//! deleting and recreating the connection.

use super::connectable::ConnectableNode;
use super::queue::FlowFileQueue;
use super::Position;
use parking_lot::RwLock;
use std::sync::Arc;

/// A directed edge of the flow graph.
pub struct Connection {
    id: String,
    name: RwLock<Option<String>>,
    parent_group: String,
    source: Arc<ConnectableNode>,
    destination: Arc<ConnectableNode>,
    relationships: Vec<String>,
    bend_points: RwLock<Vec<Position>>,
    queue: Arc<FlowFileQueue>,
}

impl Connection {
    /// Create a connection; the queue is created alongside and keyed by the
    /// connection id.
    pub fn new(
        id: impl Into<String>,
        parent_group: impl Into<String>,
        source: Arc<ConnectableNode>,
        destination: Arc<ConnectableNode>,
        relationships: Vec<String>,
    ) -> Self {
        let id = id.into();
        let queue = Arc::new(FlowFileQueue::new(id.clone(), destination.id().to_string()));
        Self {
            id,
            name: RwLock::new(None),
            parent_group: parent_group.into(),
            source,
            destination,
            relationships,
            bend_points: RwLock::new(Vec::new()),
            queue,
        }
    }

    /// Stable identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Optional display name.
    pub fn name(&self) -> Option<String> {
        self.name.read().clone()
    }

    /// Set the display name.
    pub fn set_name(&self, name: Option<String>) {
        *self.name.write() = name;
    }

    /// Identifier of the containing group.
    pub fn parent_group(&self) -> &str {
        &self.parent_group
    }

    /// Source endpoint.
    pub fn source(&self) -> &Arc<ConnectableNode> {
        &self.source
    }

    /// Destination endpoint.
    pub fn destination(&self) -> &Arc<ConnectableNode> {
        &self.destination
    }

    /// Relationship names this connection subscribes to.
    pub fn relationships(&self) -> &[String] {
        &self.relationships
    }

    /// Whether this connection subscribes to the given relationship.
    pub fn matches_relationship(&self, relationship: &str) -> bool {
        self.relationships.iter().any(|r| r == relationship)
    }

    /// Bend points for rendering.
    pub fn bend_points(&self) -> Vec<Position> {
        self.bend_points.read().clone()
    }

    /// Replace the bend points.
    pub fn set_bend_points(&self, points: Vec<Position>) {
        *self.bend_points.write() = points;
    }

    /// The owned queue.
    pub fn queue(&self) -> &Arc<FlowFileQueue> {
        &self.queue
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("source", &self.source.id())
            .field("destination", &self.destination.id())
            .field("relationships", &self.relationships)
            .finish()
    }
}
