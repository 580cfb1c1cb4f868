//! Process groups, labels, and remote process groups

use super::Position;
use crate::error::EngineResult;
use crate::status::EventTotals;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Annotation placed on the canvas; carries no flow-file semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    /// Stable identifier
    pub id: String,
    /// Label text
    pub text: String,
    /// Canvas position
    pub position: Position,
    /// Width in canvas units
    pub width: f64,
    /// Height in canvas units
    pub height: f64,
}

/// Recursive container of flow components.
///
/// Groups own membership only; the components themselves live in the graph's
/// flat indexes so identifier uniqueness can be enforced globally.
#[derive(Debug)]
pub struct ProcessGroup {
    /// Stable identifier
    pub id: String,
    /// Group name
    pub name: String,
    /// Parent group id; `None` only for the root
    pub parent: Option<String>,
    /// Canvas position
    pub position: Position,
    /// Operator comments
    pub comments: String,
    /// Child group ids
    pub child_groups: Vec<String>,
    /// Member connectable ids, in insertion order
    pub connectables: Vec<String>,
    /// Member connection ids, in insertion order
    pub connections: Vec<String>,
    /// Member labels
    pub labels: HashMap<String, Label>,
    /// Member remote process groups
    pub remote_groups: HashMap<String, Arc<RemoteProcessGroup>>,
}

impl ProcessGroup {
    /// Create an empty group.
    pub fn new(id: impl Into<String>, name: impl Into<String>, parent: Option<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            parent,
            position: Position::default(),
            comments: String::new(),
            child_groups: Vec::new(),
            connectables: Vec::new(),
            connections: Vec::new(),
            labels: HashMap::new(),
            remote_groups: HashMap::new(),
        }
    }

    /// Whether the group holds no components at all.
    pub fn is_empty(&self) -> bool {
        self.child_groups.is_empty()
            && self.connectables.is_empty()
            && self.connections.is_empty()
            && self.labels.is_empty()
            && self.remote_groups.is_empty()
    }
}

/// A port advertised by a remote instance, discovered on refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemotePortDescriptor {
    /// Identifier assigned by the remote instance
    pub id: String,
    /// Port name on the remote instance
    pub name: String,
    /// Whether the remote port is running
    pub target_running: bool,
}

/// Contents reported by a remote instance.
#[derive(Debug, Clone, Default)]
pub struct RemoteGroupContents {
    /// Input ports the remote instance accepts data on
    pub input_ports: Vec<RemotePortDescriptor>,
    /// Output ports the remote instance offers data on
    pub output_ports: Vec<RemotePortDescriptor>,
}

/// Discovery of a remote instance's site-to-site ports. The transport is an
/// external collaborator; the controller only needs this contract for the
/// periodic refresh.
pub trait RemotePortDiscovery: Send + Sync {
    /// Fetch the remote instance's advertised ports.
    fn discover(&self, target_uri: &str, timeout: Duration) -> EngineResult<RemoteGroupContents>;
}

/// Discovery stub used when no site-to-site client is configured.
pub struct NoopDiscovery;

impl RemotePortDiscovery for NoopDiscovery {
    fn discover(&self, _target_uri: &str, _timeout: Duration) -> EngineResult<RemoteGroupContents> {
        Ok(RemoteGroupContents::default())
    }
}

/// A reference to a remote flow instance.
pub struct RemoteProcessGroup {
    id: String,
    target_uri: String,
    name: RwLock<String>,
    position: RwLock<Position>,
    communications_timeout: RwLock<Duration>,
    yield_period: RwLock<Duration>,
    transmitting: AtomicBool,
    input_ports: RwLock<Vec<RemotePortDescriptor>>,
    output_ports: RwLock<Vec<RemotePortDescriptor>>,
    last_refreshed: RwLock<Option<DateTime<Utc>>>,
    last_refresh_error: RwLock<Option<String>>,
    authorization_issue: RwLock<Option<String>>,
    totals: EventTotals,
}

impl RemoteProcessGroup {
    /// Create a remote group reference.
    pub fn new(id: impl Into<String>, target_uri: impl Into<String>) -> Self {
        let target_uri = target_uri.into();
        Self {
            id: id.into(),
            name: RwLock::new(target_uri.clone()),
            target_uri,
            position: RwLock::new(Position::default()),
            communications_timeout: RwLock::new(Duration::from_secs(30)),
            yield_period: RwLock::new(Duration::from_secs(10)),
            transmitting: AtomicBool::new(false),
            input_ports: RwLock::new(Vec::new()),
            output_ports: RwLock::new(Vec::new()),
            last_refreshed: RwLock::new(None),
            last_refresh_error: RwLock::new(None),
            authorization_issue: RwLock::new(None),
            totals: EventTotals::default(),
        }
    }

    /// Stable identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Target instance URI.
    pub fn target_uri(&self) -> &str {
        &self.target_uri
    }

    /// Display name.
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    /// Rename the remote group.
    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    /// Canvas position.
    pub fn position(&self) -> Position {
        *self.position.read()
    }

    /// Move the remote group on the canvas.
    pub fn set_position(&self, position: Position) {
        *self.position.write() = position;
    }

    /// Timeout applied to remote communications.
    pub fn communications_timeout(&self) -> Duration {
        *self.communications_timeout.read()
    }

    /// Set the communications timeout.
    pub fn set_communications_timeout(&self, timeout: Duration) {
        *self.communications_timeout.write() = timeout;
    }

    /// Pause applied after a failed remote interaction.
    pub fn yield_period(&self) -> Duration {
        *self.yield_period.read()
    }

    /// Set the yield period.
    pub fn set_yield_period(&self, period: Duration) {
        *self.yield_period.write() = period;
    }

    /// Whether transmission to the remote instance is enabled.
    pub fn is_transmitting(&self) -> bool {
        self.transmitting.load(Ordering::SeqCst)
    }

    /// Enable or disable transmission.
    pub fn set_transmitting(&self, transmitting: bool) {
        self.transmitting.store(transmitting, Ordering::SeqCst);
    }

    /// Ports the remote instance accepts data on, as of the last refresh.
    pub fn input_ports(&self) -> Vec<RemotePortDescriptor> {
        self.input_ports.read().clone()
    }

    /// Ports the remote instance offers data on, as of the last refresh.
    pub fn output_ports(&self) -> Vec<RemotePortDescriptor> {
        self.output_ports.read().clone()
    }

    /// Instant of the last successful refresh.
    pub fn last_refreshed(&self) -> Option<DateTime<Utc>> {
        *self.last_refreshed.read()
    }

    /// Error of the most recent failed refresh, if the last refresh failed.
    pub fn last_refresh_error(&self) -> Option<String> {
        self.last_refresh_error.read().clone()
    }

    /// Last-known authorisation issue reported by the remote instance.
    pub fn authorization_issue(&self) -> Option<String> {
        self.authorization_issue.read().clone()
    }

    /// Record an authorisation issue.
    pub fn set_authorization_issue(&self, issue: Option<String>) {
        *self.authorization_issue.write() = issue;
    }

    /// Event totals for sent/received accounting.
    pub fn totals(&self) -> &EventTotals {
        &self.totals
    }

    /// Refresh the advertised port descriptors through the given discovery.
    pub fn refresh(&self, discovery: &dyn RemotePortDiscovery) -> EngineResult<()> {
        match discovery.discover(&self.target_uri, self.communications_timeout()) {
            Ok(contents) => {
                *self.input_ports.write() = contents.input_ports;
                *self.output_ports.write() = contents.output_ports;
                *self.last_refreshed.write() = Some(Utc::now());
                *self.last_refresh_error.write() = None;
                Ok(())
            }
            Err(e) => {
                *self.last_refresh_error.write() = Some(e.to_string());
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for RemoteProcessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProcessGroup")
            .field("id", &self.id)
            .field("target_uri", &self.target_uri)
            .field("transmitting", &self.is_transmitting())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    struct FixedDiscovery;
    impl RemotePortDiscovery for FixedDiscovery {
        fn discover(
            &self,
            _target_uri: &str,
            _timeout: Duration,
        ) -> EngineResult<RemoteGroupContents> {
            Ok(RemoteGroupContents {
                input_ports: vec![RemotePortDescriptor {
                    id: "in1".to_string(),
                    name: "incoming".to_string(),
                    target_running: true,
                }],
                output_ports: vec![],
            })
        }
    }

    struct FailingDiscovery;
    impl RemotePortDiscovery for FailingDiscovery {
        fn discover(
            &self,
            _target_uri: &str,
            _timeout: Duration,
        ) -> EngineResult<RemoteGroupContents> {
            Err(EngineError::Communication("connection refused".to_string()))
        }
    }

    #[test]
    fn test_refresh_replaces_ports() {
        let group = RemoteProcessGroup::new("rpg1", "https://remote.example:8443");
        group.refresh(&FixedDiscovery).expect("refresh");
        assert_eq!(group.input_ports().len(), 1);
        assert!(group.last_refreshed().is_some());
        assert!(group.last_refresh_error().is_none());
    }

    #[test]
    fn test_refresh_failure_records_error() {
        let group = RemoteProcessGroup::new("rpg1", "https://remote.example:8443");
        assert!(group.refresh(&FailingDiscovery).is_err());
        assert!(group
            .last_refresh_error()
            .expect("error recorded")
            .contains("connection refused"));
    }
}
