//! Flow snippets
//!
//! A snippet is a self-contained sub-graph description instantiated into a
//! target group in one call. Validation runs in full before any mutation so
//! a rejected snippet leaves the target group untouched.

use crate::error::{EngineError, EngineResult};
use crate::extension::ExtensionRegistry;
use crate::graph::{FlowGraph, Label, Position};
use crate::scheduling::SchedulingConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Processor description within a snippet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorDto {
    /// Stable identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Registered plug-in type name
    pub type_name: String,
    /// Canvas position
    pub position: Position,
    /// Scheduling configuration
    pub scheduling: SchedulingConfig,
}

/// Port description within a snippet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortDto {
    /// Stable identifier
    pub id: String,
    /// Port name, unique among sibling ports
    pub name: String,
    /// Canvas position
    pub position: Position,
}

/// Funnel description within a snippet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelDto {
    /// Stable identifier
    pub id: String,
    /// Canvas position
    pub position: Position,
}

/// Remote process group description within a snippet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteGroupDto {
    /// Stable identifier
    pub id: String,
    /// Target instance URI
    pub target_uri: String,
    /// Optional display name
    pub name: Option<String>,
}

/// Child group description within a snippet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupDto {
    /// Stable identifier
    pub id: String,
    /// Group name
    pub name: String,
    /// Contained components
    pub contents: Snippet,
}

/// Connection description within a snippet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDto {
    /// Stable identifier
    pub id: String,
    /// Optional display name
    pub name: Option<String>,
    /// Source component id (within the snippet or the live graph)
    pub source_id: String,
    /// Destination component id (within the snippet or the live graph)
    pub destination_id: String,
    /// Subscribed relationship names
    pub relationships: Vec<String>,
    /// Back-pressure object threshold override
    pub object_threshold: Option<usize>,
    /// Back-pressure byte threshold override
    pub byte_threshold: Option<u64>,
    /// Flow-file expiration period, as a time period string
    pub expiration: Option<String>,
    /// Prioritiser type names, applied in order
    pub prioritizers: Vec<String>,
    /// Bend points for rendering
    pub bends: Vec<Position>,
}

/// A pre-validated sub-graph to add to a target group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snippet {
    /// Labels
    pub labels: Vec<Label>,
    /// Funnels
    pub funnels: Vec<FunnelDto>,
    /// Input ports
    pub input_ports: Vec<PortDto>,
    /// Output ports
    pub output_ports: Vec<PortDto>,
    /// Processors
    pub processors: Vec<ProcessorDto>,
    /// Remote process groups
    pub remote_groups: Vec<RemoteGroupDto>,
    /// Child groups, instantiated recursively
    pub child_groups: Vec<GroupDto>,
    /// Connections, instantiated last
    pub connections: Vec<ConnectionDto>,
}

impl Snippet {
    /// Every identifier declared anywhere in the snippet, recursively.
    pub fn all_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        self.collect_ids(&mut ids);
        ids
    }

    fn collect_ids(&self, ids: &mut Vec<String>) {
        ids.extend(self.labels.iter().map(|l| l.id.clone()));
        ids.extend(self.funnels.iter().map(|f| f.id.clone()));
        ids.extend(self.input_ports.iter().map(|p| p.id.clone()));
        ids.extend(self.output_ports.iter().map(|p| p.id.clone()));
        ids.extend(self.processors.iter().map(|p| p.id.clone()));
        ids.extend(self.remote_groups.iter().map(|r| r.id.clone()));
        ids.extend(self.connections.iter().map(|c| c.id.clone()));
        for group in &self.child_groups {
            ids.push(group.id.clone());
            group.contents.collect_ids(ids);
        }
    }

    /// Port names declared at the snippet's top level.
    pub fn port_names(&self) -> Vec<String> {
        self.input_ports
            .iter()
            .chain(self.output_ports.iter())
            .map(|p| p.name.clone())
            .collect()
    }

    fn collect_processor_types(&self, types: &mut Vec<String>) {
        types.extend(self.processors.iter().map(|p| p.type_name.clone()));
        for group in &self.child_groups {
            group.contents.collect_processor_types(types);
        }
    }

    fn collect_prioritizer_types(&self, types: &mut Vec<String>) {
        for connection in &self.connections {
            types.extend(connection.prioritizers.iter().cloned());
        }
        for group in &self.child_groups {
            group.contents.collect_prioritizer_types(types);
        }
    }

    fn collect_connections(&self) -> Vec<&ConnectionDto> {
        let mut connections: Vec<&ConnectionDto> = self.connections.iter().collect();
        for group in &self.child_groups {
            connections.extend(group.contents.collect_connections());
        }
        connections
    }
}

/// Validate a snippet against the live graph and the extension registry.
/// Rejects duplicate identifiers anywhere in the live graph, root-level port
/// name collisions, unknown processor or prioritiser type names, and
/// connections whose endpoints resolve nowhere.
pub(crate) fn validate_snippet(
    graph: &FlowGraph,
    registry: &ExtensionRegistry,
    snippet: &Snippet,
    target_group_id: &str,
) -> EngineResult<()> {
    if graph.group(target_group_id).is_none() {
        return Err(EngineError::ComponentNotFound(target_group_id.to_string()));
    }

    let ids = snippet.all_ids();
    let mut seen = HashSet::new();
    for id in &ids {
        if !seen.insert(id.clone()) {
            return Err(EngineError::DuplicateIdentifier(id.clone()));
        }
        if graph.contains_id(id) {
            return Err(EngineError::DuplicateIdentifier(id.clone()));
        }
    }

    if target_group_id == graph.root_id() {
        let existing: HashSet<String> = graph.root_port_names().into_iter().collect();
        let mut snippet_names = HashSet::new();
        for name in snippet.port_names() {
            if existing.contains(&name) || !snippet_names.insert(name.clone()) {
                return Err(EngineError::IllegalState(format!(
                    "A port named '{}' already exists at the root level",
                    name
                )));
            }
        }
    }

    let mut processor_types = Vec::new();
    snippet.collect_processor_types(&mut processor_types);
    for type_name in processor_types {
        if !registry.has_processor(&type_name) {
            return Err(EngineError::Instantiation {
                type_name,
                reason: "unknown processor type".to_string(),
            });
        }
    }

    let mut prioritizer_types = Vec::new();
    snippet.collect_prioritizer_types(&mut prioritizer_types);
    for type_name in prioritizer_types {
        if !registry.has_prioritizer(&type_name) {
            return Err(EngineError::Instantiation {
                type_name,
                reason: "unknown prioritizer type".to_string(),
            });
        }
    }

    let known: HashSet<&str> = seen.iter().map(String::as_str).collect();
    for connection in snippet.collect_connections() {
        for endpoint in [&connection.source_id, &connection.destination_id] {
            if !known.contains(endpoint.as_str()) && graph.connectable(endpoint).is_none() {
                return Err(EngineError::InvalidArgument(format!(
                    "Connection {} references unknown endpoint {}",
                    connection.id, endpoint
                )));
            }
        }
        if let Some(expiration) = &connection.expiration {
            crate::config::parse_time_period(expiration)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_ids_recursive() {
        let snippet = Snippet {
            funnels: vec![FunnelDto {
                id: "f1".to_string(),
                position: Position::default(),
            }],
            child_groups: vec![GroupDto {
                id: "g1".to_string(),
                name: "child".to_string(),
                contents: Snippet {
                    funnels: vec![FunnelDto {
                        id: "f2".to_string(),
                        position: Position::default(),
                    }],
                    ..Snippet::default()
                },
            }],
            ..Snippet::default()
        };
        let ids = snippet.all_ids();
        assert!(ids.contains(&"f1".to_string()));
        assert!(ids.contains(&"g1".to_string()));
        assert!(ids.contains(&"f2".to_string()));
    }

    #[test]
    fn test_validate_rejects_duplicate_within_snippet() {
        let graph = FlowGraph::new("root", "Flow");
        let registry = ExtensionRegistry::new();
        let snippet = Snippet {
            funnels: vec![
                FunnelDto {
                    id: "f1".to_string(),
                    position: Position::default(),
                },
                FunnelDto {
                    id: "f1".to_string(),
                    position: Position::default(),
                },
            ],
            ..Snippet::default()
        };
        assert!(matches!(
            validate_snippet(&graph, &registry, &snippet, "root"),
            Err(EngineError::DuplicateIdentifier(_))
        ));
    }

    #[test]
    fn test_validate_rejects_unknown_processor_type() {
        let graph = FlowGraph::new("root", "Flow");
        let registry = ExtensionRegistry::new();
        let snippet = Snippet {
            processors: vec![ProcessorDto {
                id: "p1".to_string(),
                name: "P".to_string(),
                type_name: "org.example.Missing".to_string(),
                position: Position::default(),
                scheduling: SchedulingConfig::default(),
            }],
            ..Snippet::default()
        };
        assert!(matches!(
            validate_snippet(&graph, &registry, &snippet, "root"),
            Err(EngineError::Instantiation { .. })
        ));
    }
}
