//! The flow graph model
//!
//! Typed vertices, connections with owned queues, and recursive groups.
//! Components live in flat indexes keyed by stable string id so uniqueness
//! is enforced across the whole graph; groups hold membership only, and
//! parent links are ids rather than owning references. The graph itself is
//! protected by the controller's reader-writer lock.

pub mod connectable;
pub mod connection;
pub mod group;
pub mod queue;

pub use connectable::{ConnectableKind, ConnectableNode};
pub use connection::Connection;
pub use group::{
    Label, NoopDiscovery, ProcessGroup, RemoteGroupContents, RemotePortDescriptor,
    RemotePortDiscovery, RemoteProcessGroup,
};
pub use queue::{FlowFilePrioritizer, FlowFileQueue, Polled, QueueActivityListener, QueueSize};

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Canvas coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Horizontal coordinate
    pub x: f64,
    /// Vertical coordinate
    pub y: f64,
}

/// The live graph owned by the controller.
#[derive(Debug)]
pub struct FlowGraph {
    root_id: String,
    groups: HashMap<String, ProcessGroup>,
    connectables: HashMap<String, Arc<ConnectableNode>>,
    connections: HashMap<String, Arc<Connection>>,
}

impl FlowGraph {
    /// Create a graph holding only the root group.
    pub fn new(root_id: impl Into<String>, root_name: impl Into<String>) -> Self {
        let root_id = root_id.into();
        let mut groups = HashMap::new();
        groups.insert(
            root_id.clone(),
            ProcessGroup::new(root_id.clone(), root_name, None),
        );
        Self {
            root_id,
            groups,
            connectables: HashMap::new(),
            connections: HashMap::new(),
        }
    }

    /// Identifier of the root group.
    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    /// Whether any component anywhere in the graph uses this identifier.
    pub fn contains_id(&self, id: &str) -> bool {
        self.groups.contains_key(id)
            || self.connectables.contains_key(id)
            || self.connections.contains_key(id)
            || self
                .groups
                .values()
                .any(|g| g.labels.contains_key(id) || g.remote_groups.contains_key(id))
    }

    fn require_unique(&self, id: &str) -> EngineResult<()> {
        if self.contains_id(id) {
            return Err(EngineError::DuplicateIdentifier(id.to_string()));
        }
        Ok(())
    }

    /// Look up a group.
    pub fn group(&self, id: &str) -> Option<&ProcessGroup> {
        self.groups.get(id)
    }

    /// Look up a group mutably.
    pub fn group_mut(&mut self, id: &str) -> Option<&mut ProcessGroup> {
        self.groups.get_mut(id)
    }

    /// Look up a connectable.
    pub fn connectable(&self, id: &str) -> Option<&Arc<ConnectableNode>> {
        self.connectables.get(id)
    }

    /// Look up a connection.
    pub fn connection(&self, id: &str) -> Option<&Arc<Connection>> {
        self.connections.get(id)
    }

    /// Look up a remote process group anywhere in the graph.
    pub fn remote_group(&self, id: &str) -> Option<Arc<RemoteProcessGroup>> {
        self.groups
            .values()
            .find_map(|g| g.remote_groups.get(id).cloned())
    }

    /// Iterate all connectables.
    pub fn connectables(&self) -> impl Iterator<Item = &Arc<ConnectableNode>> {
        self.connectables.values()
    }

    /// Iterate all connections.
    pub fn connections(&self) -> impl Iterator<Item = &Arc<Connection>> {
        self.connections.values()
    }

    /// Iterate all remote process groups.
    pub fn remote_groups(&self) -> impl Iterator<Item = Arc<RemoteProcessGroup>> + '_ {
        self.groups
            .values()
            .flat_map(|g| g.remote_groups.values().cloned())
    }

    /// Register a child group.
    pub fn add_group(&mut self, parent_id: &str, group: ProcessGroup) -> EngineResult<()> {
        self.require_unique(&group.id)?;
        if !self.groups.contains_key(parent_id) {
            return Err(EngineError::ComponentNotFound(parent_id.to_string()));
        }
        let id = group.id.clone();
        self.groups.insert(id.clone(), group);
        if let Some(parent) = self.groups.get_mut(parent_id) {
            parent.child_groups.push(id);
        }
        Ok(())
    }

    /// Register a connectable into a group. Port names must be unique among
    /// the group's sibling ports.
    pub fn add_connectable(
        &mut self,
        group_id: &str,
        node: Arc<ConnectableNode>,
    ) -> EngineResult<()> {
        self.require_unique(node.id())?;
        let Some(group) = self.groups.get(group_id) else {
            return Err(EngineError::ComponentNotFound(group_id.to_string()));
        };
        if node.kind().is_port() {
            let name = node.name();
            let clash = group.connectables.iter().any(|id| {
                self.connectables
                    .get(id)
                    .map(|sibling| sibling.kind().is_port() && sibling.name() == name)
                    .unwrap_or(false)
            });
            if clash {
                return Err(EngineError::IllegalState(format!(
                    "A port named '{}' already exists in group {}",
                    name, group_id
                )));
            }
        }
        node.set_parent_group(group_id);
        let id = node.id().to_string();
        self.connectables.insert(id.clone(), node);
        if let Some(group) = self.groups.get_mut(group_id) {
            group.connectables.push(id);
        }
        Ok(())
    }

    /// Register a connection into a group and onto its endpoints.
    pub fn add_connection(
        &mut self,
        group_id: &str,
        connection: Arc<Connection>,
    ) -> EngineResult<()> {
        self.require_unique(connection.id())?;
        if !self.groups.contains_key(group_id) {
            return Err(EngineError::ComponentNotFound(group_id.to_string()));
        }
        connection.source().add_outgoing(connection.clone());
        connection.destination().add_incoming(connection.clone());
        let id = connection.id().to_string();
        self.connections.insert(id.clone(), connection);
        if let Some(group) = self.groups.get_mut(group_id) {
            group.connections.push(id);
        }
        Ok(())
    }

    /// Register a label into a group.
    pub fn add_label(&mut self, group_id: &str, label: Label) -> EngineResult<()> {
        self.require_unique(&label.id)?;
        let Some(group) = self.groups.get_mut(group_id) else {
            return Err(EngineError::ComponentNotFound(group_id.to_string()));
        };
        group.labels.insert(label.id.clone(), label);
        Ok(())
    }

    /// Register a remote process group into a group.
    pub fn add_remote_group(
        &mut self,
        group_id: &str,
        remote: Arc<RemoteProcessGroup>,
    ) -> EngineResult<()> {
        self.require_unique(remote.id())?;
        let Some(group) = self.groups.get_mut(group_id) else {
            return Err(EngineError::ComponentNotFound(group_id.to_string()));
        };
        group.remote_groups.insert(remote.id().to_string(), remote);
        Ok(())
    }

    /// Remove a connectable. It must be stopped, idle, and have no attached
    /// connections.
    pub fn remove_connectable(&mut self, id: &str) -> EngineResult<Arc<ConnectableNode>> {
        let Some(node) = self.connectables.get(id).cloned() else {
            return Err(EngineError::ComponentNotFound(id.to_string()));
        };
        node.schedule().verify_can_delete()?;
        if node.has_connections() {
            return Err(EngineError::IllegalState(format!(
                "Cannot remove {} while connections are attached",
                id
            )));
        }
        let group_id = node.parent_group();
        if let Some(group) = self.groups.get_mut(&group_id) {
            group.connectables.retain(|c| c != id);
        }
        self.connectables.remove(id);
        Ok(node)
    }

    /// Remove a connection. Its queue must be empty.
    pub fn remove_connection(&mut self, id: &str) -> EngineResult<Arc<Connection>> {
        let Some(connection) = self.connections.get(id).cloned() else {
            return Err(EngineError::ComponentNotFound(id.to_string()));
        };
        if !connection.queue().is_empty() {
            return Err(EngineError::IllegalState(format!(
                "Cannot remove connection {} while its queue is not empty",
                id
            )));
        }
        connection.source().remove_connection(id);
        connection.destination().remove_connection(id);
        let group_id = connection.parent_group().to_string();
        if let Some(group) = self.groups.get_mut(&group_id) {
            group.connections.retain(|c| c != id);
        }
        self.connections.remove(id);
        Ok(connection)
    }

    /// Remove an empty, non-root group.
    pub fn remove_group(&mut self, id: &str) -> EngineResult<()> {
        if id == self.root_id {
            return Err(EngineError::IllegalState(
                "Cannot remove the root group".to_string(),
            ));
        }
        let Some(group) = self.groups.get(id) else {
            return Err(EngineError::ComponentNotFound(id.to_string()));
        };
        if !group.is_empty() {
            return Err(EngineError::IllegalState(format!(
                "Cannot remove non-empty group {}",
                id
            )));
        }
        let parent = group.parent.clone();
        self.groups.remove(id);
        if let Some(parent_id) = parent {
            if let Some(parent) = self.groups.get_mut(&parent_id) {
                parent.child_groups.retain(|g| g != id);
            }
        }
        Ok(())
    }

    /// Ids of every component in the graph, for snippet validation.
    pub fn all_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.groups.keys().cloned().collect();
        ids.extend(self.connectables.keys().cloned());
        ids.extend(self.connections.keys().cloned());
        for group in self.groups.values() {
            ids.extend(group.labels.keys().cloned());
            ids.extend(group.remote_groups.keys().cloned());
        }
        ids
    }

    /// Port names at the root level, for snippet validation.
    pub fn root_port_names(&self) -> Vec<String> {
        let Some(root) = self.groups.get(&self.root_id) else {
            return Vec::new();
        };
        root.connectables
            .iter()
            .filter_map(|id| self.connectables.get(id))
            .filter(|node| node.kind().is_port())
            .map(|node| node.name())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn funnel(id: &str, graph: &FlowGraph) -> Arc<ConnectableNode> {
        Arc::new(ConnectableNode::new(
            id,
            ConnectableKind::Funnel,
            id,
            graph.root_id().to_string(),
        ))
    }

    #[test]
    fn test_duplicate_identifier_rejected() {
        let mut graph = FlowGraph::new("root", "Flow");
        let node = funnel("f1", &graph);
        graph.add_connectable("root", node).expect("add");
        let dup = funnel("f1", &graph);
        assert!(matches!(
            graph.add_connectable("root", dup),
            Err(EngineError::DuplicateIdentifier(_))
        ));
    }

    #[test]
    fn test_port_name_unique_among_siblings() {
        let mut graph = FlowGraph::new("root", "Flow");
        let port = Arc::new(ConnectableNode::new(
            "p1",
            ConnectableKind::InputPort,
            "ingest",
            "root",
        ));
        graph.add_connectable("root", port).expect("add");
        let clash = Arc::new(ConnectableNode::new(
            "p2",
            ConnectableKind::InputPort,
            "ingest",
            "root",
        ));
        assert!(graph.add_connectable("root", clash).is_err());
    }

    #[test]
    fn test_remove_connection_requires_empty_queue() {
        let mut graph = FlowGraph::new("root", "Flow");
        let a = funnel("a", &graph);
        let b = funnel("b", &graph);
        graph.add_connectable("root", a.clone()).expect("add");
        graph.add_connectable("root", b.clone()).expect("add");
        let connection = Arc::new(Connection::new("c1", "root", a, b, vec![String::new()]));
        graph.add_connection("root", connection.clone()).expect("add");

        connection
            .queue()
            .offer(crate::flowfile::FlowFileBuilder::new(1).build());
        assert!(graph.remove_connection("c1").is_err());

        connection.queue().drain();
        graph.remove_connection("c1").expect("remove");
        assert!(graph.connection("c1").is_none());
    }

    #[test]
    fn test_remove_connectable_requires_detached() {
        let mut graph = FlowGraph::new("root", "Flow");
        let a = funnel("a", &graph);
        let b = funnel("b", &graph);
        graph.add_connectable("root", a.clone()).expect("add");
        graph.add_connectable("root", b.clone()).expect("add");
        let connection = Arc::new(Connection::new("c1", "root", a, b, vec![String::new()]));
        graph.add_connection("root", connection).expect("add");

        assert!(graph.remove_connectable("a").is_err());
        graph.remove_connection("c1").expect("remove");
        graph.remove_connectable("a").expect("remove");
    }

    #[test]
    fn test_remove_group_requires_empty() {
        let mut graph = FlowGraph::new("root", "Flow");
        graph
            .add_group("root", ProcessGroup::new("g1", "child", Some("root".to_string())))
            .expect("add group");
        let node = funnel("f1", &graph);
        graph.add_connectable("g1", node).expect("add");
        assert!(graph.remove_group("g1").is_err());
        graph.remove_connectable("f1").expect("remove");
        graph.remove_group("g1").expect("remove group");
        assert!(graph.group("g1").is_none());
    }
}
