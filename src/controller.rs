//! The flow controller façade
//!
//! Owns the live graph and everything that drives it: the scheduler and its
//! pools, the periodic services (status aggregation, flow-file expiration,
//! remote-group refresh), the heartbeat monitor, and the deferred-start
//! buffer. Mutations take the exclusive controller lock; queries take the
//! shared lock; trigger workers touch only lock-free per-component state.

use crate::config::{parse_time_period, EngineSettings};
use crate::context::EngineContext;
use crate::error::{EngineError, EngineResult};
use crate::extension::{ExtensionRegistry, ExtensionScope};
use crate::flowfile::FlowFileRecord;
use crate::graph::{
    ConnectableKind, ConnectableNode, Connection, FlowGraph, Label, NoopDiscovery, Position,
    ProcessGroup, QueueActivityListener, RemotePortDiscovery, RemoteProcessGroup,
};
use crate::heartbeat::{
    HeartbeatBean, HeartbeatMonitor, HeartbeatPayload, SystemDiagnostics,
};
use crate::processor::RELAY_RELATIONSHIP;
use crate::repo::{NodeProtocolSender, ProvenanceEventRecord, ProvenanceEventType, RepositorySet};
use crate::replay::replay_event;
use crate::reporting::ReportingTaskNode;
use crate::scheduling::agents::ScheduledEntity;
use crate::scheduling::{ProcessScheduler, ScheduledState, SchedulingConfig};
use crate::snippet::{validate_snippet, Snippet};
use crate::status::{aggregate_group, ProcessGroupStatus};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// TLS material required for secure site-to-site.
#[derive(Debug, Clone)]
pub struct TlsContext {
    /// Path to the keystore
    pub keystore: String,
    /// Path to the truststore
    pub truststore: String,
}

/// Partial update of a processor; `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct ProcessorUpdate {
    /// New display name
    pub name: Option<String>,
    /// New canvas position
    pub position: Option<Position>,
    /// New scheduling strategy
    pub strategy: Option<crate::scheduling::SchedulingStrategy>,
    /// New scheduling period string
    pub period: Option<String>,
    /// New concurrent task bound
    pub max_concurrent_tasks: Option<usize>,
    /// New yield period string
    pub yield_period: Option<String>,
    /// New penalisation period string
    pub penalization_period: Option<String>,
}

/// Partial update of a connection; `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct ConnectionUpdate {
    /// New display name
    pub name: Option<Option<String>>,
    /// New back-pressure object threshold
    pub object_threshold: Option<usize>,
    /// New back-pressure byte threshold
    pub byte_threshold: Option<u64>,
    /// New flow-file expiration period string; empty disables expiration
    pub expiration: Option<String>,
    /// New prioritiser type names, applied in order
    pub prioritizers: Option<Vec<String>>,
    /// New bend points
    pub bends: Option<Vec<Position>>,
}

/// Builder assembling a [`FlowController`] with injected collaborators.
pub struct FlowEngineBuilder {
    settings: EngineSettings,
    repositories: Option<RepositorySet>,
    extensions: Arc<ExtensionRegistry>,
    protocol_sender: Option<Arc<dyn NodeProtocolSender>>,
    discovery: Option<Arc<dyn RemotePortDiscovery>>,
    tls: Option<TlsContext>,
    node_id: Option<String>,
}

impl FlowEngineBuilder {
    /// Start a builder with the given settings.
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            repositories: None,
            extensions: Arc::new(ExtensionRegistry::new()),
            protocol_sender: None,
            discovery: None,
            tls: None,
            node_id: None,
        }
    }

    /// Inject a repository set; defaults to the in-memory implementations.
    pub fn repositories(mut self, repositories: RepositorySet) -> Self {
        self.repositories = Some(repositories);
        self
    }

    /// Inject the extension registry.
    pub fn extensions(mut self, extensions: Arc<ExtensionRegistry>) -> Self {
        self.extensions = extensions;
        self
    }

    /// Inject the cluster protocol sender; defaults to a logging stub.
    pub fn protocol_sender(mut self, sender: Arc<dyn NodeProtocolSender>) -> Self {
        self.protocol_sender = Some(sender);
        self
    }

    /// Inject the remote site-to-site discovery client.
    pub fn remote_discovery(mut self, discovery: Arc<dyn RemotePortDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Provide a TLS context for secure site-to-site.
    pub fn tls_context(mut self, tls: TlsContext) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Set the node identifier used in cluster messages.
    pub fn node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Build the controller. Must be called from within a tokio runtime;
    /// the periodic services and pool workers are spawned here.
    pub fn build(self) -> EngineResult<Arc<FlowController>> {
        FlowController::new(self)
    }
}

/// The in-process controller of a live dataflow graph.
pub struct FlowController {
    graph: RwLock<FlowGraph>,
    context: Arc<EngineContext>,
    scheduler: Arc<ProcessScheduler>,
    extensions: Arc<ExtensionRegistry>,
    heartbeat: Arc<HeartbeatMonitor>,
    discovery: Arc<dyn RemotePortDiscovery>,
    reporting_tasks: DashMap<String, Arc<ReportingTaskNode>>,
    started: AtomicBool,
    terminated: AtomicBool,
    clustered: AtomicBool,
    connected: AtomicBool,
    deferred_starts: Mutex<Vec<String>>,
    periodic_cancel: CancellationToken,
    start_time: DateTime<Utc>,
    node_id: String,
    weak_self: Weak<FlowController>,
}

impl FlowController {
    /// Generate a fresh component identifier.
    pub fn generate_id() -> String {
        Uuid::new_v4().to_string()
    }

    fn new(builder: FlowEngineBuilder) -> EngineResult<Arc<Self>> {
        let settings = builder.settings.clone();
        settings.validate()?;
        if settings.site_to_site_secure && builder.tls.is_none() {
            return Err(EngineError::Configuration(
                "Site-to-site is configured to be secure but no TLS context was provided"
                    .to_string(),
            ));
        }

        let repositories = builder
            .repositories
            .unwrap_or_else(|| RepositorySet::in_memory(settings.status_history_samples));
        let context = Arc::new(EngineContext::new(repositories, settings.clone()));
        context.repositories.content.initialize(context.claims.clone())?;
        context.repositories.flowfile.initialize()?;
        context.repositories.provenance.initialize()?;

        let scheduler = ProcessScheduler::new(context.clone());
        scheduler.start_event_workers();

        let root_id = Self::generate_id();
        let graph = FlowGraph::new(root_id.clone(), "Flow");

        let node_id = builder.node_id.unwrap_or_else(Self::generate_id);
        let sender = builder
            .protocol_sender
            .unwrap_or_else(|| Arc::new(crate::repo::memory::LoggingProtocolSender));
        let heartbeat = HeartbeatMonitor::new(
            node_id.clone(),
            Duration::from_secs(settings.heartbeat_delay_seconds),
            sender,
            HeartbeatBean {
                root_group_id: root_id,
                primary: false,
                connected: false,
            },
        );

        let controller = Arc::new_cyclic(|weak| Self {
            graph: RwLock::new(graph),
            context,
            scheduler,
            extensions: builder.extensions,
            heartbeat,
            discovery: builder.discovery.unwrap_or_else(|| Arc::new(NoopDiscovery)),
            reporting_tasks: DashMap::new(),
            started: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            clustered: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            deferred_starts: Mutex::new(Vec::new()),
            periodic_cancel: CancellationToken::new(),
            start_time: Utc::now(),
            node_id,
            weak_self: weak.clone(),
        });

        controller.spawn_periodic_services();
        tracing::info!(node = %controller.node_id, "Flow controller created");
        Ok(controller)
    }

    fn spawn_periodic_services(&self) {
        let settings = &self.context.settings;

        // Status aggregation: never dropped, always appended.
        let weak = self.weak_self.clone();
        let cancel = self.periodic_cancel.clone();
        let snapshot_period = Duration::from_millis(settings.status_snapshot_millis);
        tokio::spawn(periodic(cancel, snapshot_period, move || {
            if let Some(controller) = weak.upgrade() {
                let status = controller.controller_status();
                controller.context.repositories.status.capture(&status);
            }
        }));

        // Flow-file expiration sweep.
        let weak = self.weak_self.clone();
        let cancel = self.periodic_cancel.clone();
        let sweep_period = Duration::from_millis(settings.expiration_sweep_millis);
        tokio::spawn(periodic(cancel, sweep_period, move || {
            if let Some(controller) = weak.upgrade() {
                controller.sweep_expired_flowfiles();
            }
        }));

        // Remote-group refresh.
        let weak = self.weak_self.clone();
        let cancel = self.periodic_cancel.clone();
        let refresh_period = Duration::from_millis(settings.remote_refresh_millis);
        tokio::spawn(periodic(cancel, refresh_period, move || {
            if let Some(controller) = weak.upgrade() {
                controller.refresh_remote_groups();
            }
        }));
    }

    fn ensure_not_terminated(&self) -> EngineResult<()> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(EngineError::Terminated);
        }
        Ok(())
    }

    /// Controller settings.
    pub fn settings(&self) -> &EngineSettings {
        &self.context.settings
    }

    /// Shared engine services.
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    /// Identifier of the root group.
    pub fn root_group_id(&self) -> String {
        self.graph.read().root_id().to_string()
    }

    /// Node identifier used in cluster messages.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    // ── Creation ─────────────────────────────────────────────────────────

    /// Create a child process group.
    pub fn create_process_group(
        &self,
        parent_id: &str,
        id: impl Into<String>,
        name: impl Into<String>,
    ) -> EngineResult<()> {
        self.ensure_not_terminated()?;
        let id = id.into();
        let mut graph = self.graph.write();
        graph.add_group(
            parent_id,
            ProcessGroup::new(id.clone(), name, Some(parent_id.to_string())),
        )?;
        tracing::debug!(group = %id, parent = %parent_id, "Created process group");
        Ok(())
    }

    /// Create a processor from a registered type.
    pub fn create_processor(
        &self,
        group_id: &str,
        id: impl Into<String>,
        name: impl Into<String>,
        type_name: &str,
        scheduling: SchedulingConfig,
    ) -> EngineResult<()> {
        self.ensure_not_terminated()?;
        scheduling.validate()?;
        let id = id.into();
        let mut graph = self.graph.write();
        let plugin = self.extensions.create_processor(type_name)?;
        let node = Arc::new(ConnectableNode::processor(
            id.clone(),
            name,
            group_id.to_string(),
            type_name.to_string(),
            plugin,
            scheduling,
        ));
        graph.add_connectable(group_id, node.clone())?;
        // first_time_added: the hook runs exactly once, here.
        let added = {
            let _scope = ExtensionScope::enter(type_name);
            node.plugin().map(|p| p.on_added()).unwrap_or(Ok(()))
        };
        if let Err(e) = added {
            graph.remove_connectable(&id)?;
            return Err(EngineError::Instantiation {
                type_name: type_name.to_string(),
                reason: format!("on_added hook failed: {}", e),
            });
        }
        tracing::debug!(processor = %id, r#type = %type_name, "Created processor");
        Ok(())
    }

    /// Create a local input port. At the root level the port becomes a root
    /// input port reachable from outside the instance.
    pub fn create_local_input_port(
        &self,
        group_id: &str,
        id: impl Into<String>,
        name: impl Into<String>,
    ) -> EngineResult<()> {
        self.create_port(group_id, id, name, true)
    }

    /// Create a local output port; at the root level it becomes a root
    /// output port.
    pub fn create_local_output_port(
        &self,
        group_id: &str,
        id: impl Into<String>,
        name: impl Into<String>,
    ) -> EngineResult<()> {
        self.create_port(group_id, id, name, false)
    }

    fn create_port(
        &self,
        group_id: &str,
        id: impl Into<String>,
        name: impl Into<String>,
        input: bool,
    ) -> EngineResult<()> {
        self.ensure_not_terminated()?;
        let mut graph = self.graph.write();
        let kind = match (input, group_id == graph.root_id()) {
            (true, true) => ConnectableKind::RootInputPort,
            (true, false) => ConnectableKind::InputPort,
            (false, true) => ConnectableKind::RootOutputPort,
            (false, false) => ConnectableKind::OutputPort,
        };
        let node = Arc::new(ConnectableNode::new(id, kind, name, group_id.to_string()));
        graph.add_connectable(group_id, node)
    }

    /// Create a funnel.
    pub fn create_funnel(&self, group_id: &str, id: impl Into<String>) -> EngineResult<()> {
        self.ensure_not_terminated()?;
        let id = id.into();
        let node = Arc::new(ConnectableNode::new(
            id.clone(),
            ConnectableKind::Funnel,
            id,
            group_id.to_string(),
        ));
        self.graph.write().add_connectable(group_id, node)
    }

    /// Create a label.
    pub fn create_label(&self, group_id: &str, label: Label) -> EngineResult<()> {
        self.ensure_not_terminated()?;
        self.graph.write().add_label(group_id, label)
    }

    /// Create a remote process group.
    pub fn create_remote_process_group(
        &self,
        group_id: &str,
        id: impl Into<String>,
        target_uri: impl Into<String>,
    ) -> EngineResult<()> {
        self.ensure_not_terminated()?;
        let remote = Arc::new(RemoteProcessGroup::new(id, target_uri));
        self.graph.write().add_remote_group(group_id, remote)
    }

    /// Create a reporting task from a registered type.
    pub fn create_reporting_task(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
        type_name: &str,
        scheduling: SchedulingConfig,
    ) -> EngineResult<()> {
        self.ensure_not_terminated()?;
        scheduling.validate()?;
        let id = id.into();
        if self.graph.read().contains_id(&id) || self.reporting_tasks.contains_key(&id) {
            return Err(EngineError::DuplicateIdentifier(id));
        }
        let task = self.extensions.create_reporting_task(type_name)?;
        let node = Arc::new(ReportingTaskNode::new(
            id.clone(),
            name,
            type_name.to_string(),
            task,
            scheduling,
        ));
        self.reporting_tasks.insert(id.clone(), node);
        tracing::debug!(task = %id, r#type = %type_name, "Created reporting task");
        Ok(())
    }

    /// Create a connection between two existing connectables.
    pub fn create_connection(
        &self,
        group_id: &str,
        id: impl Into<String>,
        source_id: &str,
        destination_id: &str,
        relationships: Vec<String>,
    ) -> EngineResult<()> {
        self.ensure_not_terminated()?;
        let id = id.into();
        let mut graph = self.graph.write();
        let source = graph
            .connectable(source_id)
            .cloned()
            .ok_or_else(|| EngineError::ComponentNotFound(source_id.to_string()))?;
        let destination = graph
            .connectable(destination_id)
            .cloned()
            .ok_or_else(|| EngineError::ComponentNotFound(destination_id.to_string()))?;

        let relationships = if source.kind() == ConnectableKind::Processor {
            if relationships.is_empty() {
                return Err(EngineError::InvalidArgument(
                    "A connection from a processor must select at least one relationship"
                        .to_string(),
                ));
            }
            for name in &relationships {
                if !source.relationships().iter().any(|r| &r.name == name) {
                    return Err(EngineError::InvalidArgument(format!(
                        "Processor {} does not declare relationship '{}'",
                        source_id, name
                    )));
                }
            }
            relationships
        } else if relationships.is_empty() {
            vec![RELAY_RELATIONSHIP.to_string()]
        } else {
            relationships
        };

        let connection = Arc::new(Connection::new(
            id.clone(),
            group_id.to_string(),
            source,
            destination,
            relationships,
        ));
        let listener: Arc<dyn QueueActivityListener> = self.scheduler.clone();
        connection.queue().set_activity_listener(listener);
        graph.add_connection(group_id, connection)?;
        tracing::debug!(connection = %id, source = %source_id, destination = %destination_id, "Created connection");
        Ok(())
    }

    // ── Updates ──────────────────────────────────────────────────────────

    /// Apply a partial processor update. Scheduling changes require the
    /// processor to be stopped.
    pub fn update_processor(&self, id: &str, update: ProcessorUpdate) -> EngineResult<()> {
        self.ensure_not_terminated()?;
        let graph = self.graph.write();
        let node = graph
            .connectable(id)
            .cloned()
            .ok_or_else(|| EngineError::ComponentNotFound(id.to_string()))?;

        let scheduling_change = update.strategy.is_some()
            || update.period.is_some()
            || update.max_concurrent_tasks.is_some()
            || update.yield_period.is_some()
            || update.penalization_period.is_some();
        if scheduling_change && node.schedule().state() == ScheduledState::Running {
            return Err(EngineError::IllegalState(format!(
                "Cannot reconfigure scheduling of {} while Running",
                id
            )));
        }

        if let Some(name) = update.name {
            node.set_name(name);
        }
        if let Some(position) = update.position {
            node.set_position(position);
        }
        if scheduling_change {
            let mut config = node.scheduling();
            if let Some(strategy) = update.strategy {
                config.strategy = strategy;
            }
            if let Some(period) = update.period {
                config.period = period;
            }
            if let Some(max) = update.max_concurrent_tasks {
                config.max_concurrent_tasks = max;
            }
            if let Some(yield_period) = update.yield_period {
                config.yield_period = parse_time_period(&yield_period)?;
            }
            if let Some(penalty) = update.penalization_period {
                config.penalization_period = parse_time_period(&penalty)?;
            }
            config.validate()?;
            node.set_scheduling(config);
        }
        Ok(())
    }

    /// Apply a partial connection update.
    pub fn update_connection(&self, id: &str, update: ConnectionUpdate) -> EngineResult<()> {
        self.ensure_not_terminated()?;
        let graph = self.graph.write();
        let connection = graph
            .connection(id)
            .cloned()
            .ok_or_else(|| EngineError::ComponentNotFound(id.to_string()))?;

        if let Some(name) = update.name {
            connection.set_name(name);
        }
        if update.object_threshold.is_some() || update.byte_threshold.is_some() {
            let object = update
                .object_threshold
                .unwrap_or_else(|| connection.queue().object_threshold());
            let bytes = update
                .byte_threshold
                .unwrap_or_else(|| connection.queue().byte_threshold());
            connection.queue().set_thresholds(object, bytes);
        }
        if let Some(expiration) = update.expiration {
            if expiration.trim().is_empty() {
                connection.queue().set_expiration(None);
            } else {
                connection
                    .queue()
                    .set_expiration(Some(parse_time_period(&expiration)?));
            }
        }
        if let Some(prioritizer_types) = update.prioritizers {
            let mut prioritizers = Vec::with_capacity(prioritizer_types.len());
            for type_name in &prioritizer_types {
                prioritizers.push(self.extensions.create_prioritizer(type_name)?);
            }
            connection.queue().set_prioritizers(prioritizers);
        }
        if let Some(bends) = update.bends {
            connection.set_bend_points(bends);
        }
        Ok(())
    }

    /// Rename a process group.
    pub fn update_process_group(&self, id: &str, name: impl Into<String>) -> EngineResult<()> {
        self.ensure_not_terminated()?;
        let mut graph = self.graph.write();
        let group = graph
            .group_mut(id)
            .ok_or_else(|| EngineError::ComponentNotFound(id.to_string()))?;
        group.name = name.into();
        Ok(())
    }

    // ── Removal ──────────────────────────────────────────────────────────

    /// Remove a connection; its queue must be empty.
    pub fn remove_connection(&self, id: &str) -> EngineResult<()> {
        self.ensure_not_terminated()?;
        self.graph.write().remove_connection(id).map(|_| ())
    }

    /// Remove a connectable; it must be stopped, idle, and detached.
    pub fn remove_connectable(&self, id: &str) -> EngineResult<()> {
        self.ensure_not_terminated()?;
        let node = self.graph.write().remove_connectable(id)?;
        if let Some(plugin) = node.plugin() {
            let _scope = ExtensionScope::enter(node.type_name().unwrap_or_default());
            if let Err(e) = plugin.on_removed() {
                tracing::warn!(component = %id, error = %e, "on_removed hook failed");
            }
        }
        Ok(())
    }

    /// Remove an empty process group.
    pub fn remove_process_group(&self, id: &str) -> EngineResult<()> {
        self.ensure_not_terminated()?;
        self.graph.write().remove_group(id)
    }

    /// Remove a stopped reporting task.
    pub fn remove_reporting_task(&self, id: &str) -> EngineResult<()> {
        self.ensure_not_terminated()?;
        let Some(task) = self.reporting_tasks.get(id).map(|t| t.value().clone()) else {
            return Err(EngineError::ComponentNotFound(id.to_string()));
        };
        task.schedule().verify_can_delete()?;
        self.reporting_tasks.remove(id);
        Ok(())
    }

    // ── Queries ──────────────────────────────────────────────────────────

    /// Scheduled state of a connectable.
    pub fn connectable_state(&self, id: &str) -> EngineResult<ScheduledState> {
        let graph = self.graph.read();
        graph
            .connectable(id)
            .map(|node| node.schedule().state())
            .ok_or_else(|| EngineError::ComponentNotFound(id.to_string()))
    }

    /// Queue footprint of a connection.
    pub fn queue_size(&self, connection_id: &str) -> EngineResult<crate::graph::QueueSize> {
        let graph = self.graph.read();
        graph
            .connection(connection_id)
            .map(|c| c.queue().size())
            .ok_or_else(|| EngineError::ComponentNotFound(connection_id.to_string()))
    }

    /// Aggregated status of one group subtree.
    pub fn group_status(&self, group_id: &str) -> EngineResult<ProcessGroupStatus> {
        let graph = self.graph.read();
        if graph.group(group_id).is_none() {
            return Err(EngineError::ComponentNotFound(group_id.to_string()));
        }
        Ok(aggregate_group(&graph, group_id))
    }

    /// Aggregated status of the whole flow.
    pub fn controller_status(&self) -> ProcessGroupStatus {
        let graph = self.graph.read();
        let root = graph.root_id().to_string();
        aggregate_group(&graph, &root)
    }

    /// Snapshot of the named counters.
    pub fn counters(&self) -> Vec<(String, i64)> {
        self.context.counters.snapshot()
    }

    /// Reset one named counter, returning its previous value.
    pub fn reset_counter(&self, name: &str) -> i64 {
        self.context.counters.reset(name)
    }

    /// Captured status snapshots within `[from, to]`, newest last.
    pub fn status_history(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        max_points: usize,
    ) -> Vec<(DateTime<Utc>, ProcessGroupStatus)> {
        self.context.repositories.status.history(from, to, max_points)
    }

    /// Enable or disable transmission of a remote process group.
    pub fn set_remote_group_transmitting(&self, id: &str, transmitting: bool) -> EngineResult<()> {
        self.ensure_not_terminated()?;
        let graph = self.graph.read();
        let remote = graph
            .remote_group(id)
            .ok_or_else(|| EngineError::ComponentNotFound(id.to_string()))?;
        remote.set_transmitting(transmitting);
        Ok(())
    }

    /// Trigger invocation count of a component, for monitoring.
    pub fn invocation_count(&self, id: &str) -> EngineResult<u64> {
        let graph = self.graph.read();
        graph
            .connectable(id)
            .map(|node| node.totals().invocation_count())
            .ok_or_else(|| EngineError::ComponentNotFound(id.to_string()))
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Enable a disabled connectable.
    pub fn enable_connectable(&self, id: &str) -> EngineResult<()> {
        let graph = self.graph.read();
        let node = graph
            .connectable(id)
            .ok_or_else(|| EngineError::ComponentNotFound(id.to_string()))?;
        node.schedule().enable()
    }

    /// Disable a stopped connectable.
    pub fn disable_connectable(&self, id: &str) -> EngineResult<()> {
        let graph = self.graph.read();
        let node = graph
            .connectable(id)
            .ok_or_else(|| EngineError::ComponentNotFound(id.to_string()))?;
        node.schedule().disable()
    }

    /// Start a processor. Before [`initialize_flow`](Self::initialize_flow)
    /// completes, the request is buffered and flushed by `start_delayed`.
    pub fn start_processor(&self, id: &str) -> EngineResult<()> {
        self.start_connectable(id)
    }

    /// Stop a processor.
    pub fn stop_processor(&self, id: &str) -> EngineResult<()> {
        self.stop_connectable(id)
    }

    /// Start any connectable.
    pub fn start_connectable(&self, id: &str) -> EngineResult<()> {
        self.ensure_not_terminated()?;
        if !self.started.load(Ordering::SeqCst) {
            let mut deferred = self.deferred_starts.lock();
            deferred.push(id.to_string());
            tracing::debug!(component = %id, "Buffered start until flow initialization");
            return Ok(());
        }
        let node = {
            let graph = self.graph.read();
            graph
                .connectable(id)
                .cloned()
                .ok_or_else(|| EngineError::ComponentNotFound(id.to_string()))?
        };
        node.schedule().verify_can_start()?;
        if !node.is_valid() {
            return Err(EngineError::IllegalState(format!(
                "Component {} is not valid and cannot be started",
                id
            )));
        }
        self.scheduler.start(ScheduledEntity::Component(node))
    }

    /// Stop any connectable. In-flight triggers complete on their own.
    pub fn stop_connectable(&self, id: &str) -> EngineResult<()> {
        let node = {
            let graph = self.graph.read();
            graph
                .connectable(id)
                .cloned()
                .ok_or_else(|| EngineError::ComponentNotFound(id.to_string()))?
        };
        self.scheduler.stop(&ScheduledEntity::Component(node))
    }

    /// Start a reporting task.
    pub fn start_reporting_task(&self, id: &str) -> EngineResult<()> {
        self.ensure_not_terminated()?;
        let Some(task) = self.reporting_tasks.get(id).map(|t| t.value().clone()) else {
            return Err(EngineError::ComponentNotFound(id.to_string()));
        };
        if !self.started.load(Ordering::SeqCst) {
            self.deferred_starts.lock().push(id.to_string());
            return Ok(());
        }
        self.scheduler.start(ScheduledEntity::Reporting(task))
    }

    /// Stop a reporting task.
    pub fn stop_reporting_task(&self, id: &str) -> EngineResult<()> {
        let Some(task) = self.reporting_tasks.get(id).map(|t| t.value().clone()) else {
            return Err(EngineError::ComponentNotFound(id.to_string()));
        };
        self.scheduler.stop(&ScheduledEntity::Reporting(task))
    }

    /// Start every enabled, valid component in a group, recursively.
    /// Reporting tasks are controller-level and start first; then
    /// processors and ports, children depth-first.
    pub fn start_process_group(&self, group_id: &str) -> EngineResult<()> {
        self.ensure_not_terminated()?;
        let members = self.collect_group_members(group_id)?;
        for node in members {
            if node.schedule().state() != ScheduledState::Stopped {
                continue;
            }
            if !node.is_valid() {
                tracing::debug!(component = %node.id(), "Skipping start of invalid component");
                continue;
            }
            if let Err(e) = self.start_connectable(node.id()) {
                tracing::warn!(component = %node.id(), error = %e, "Failed to start component");
            }
        }
        Ok(())
    }

    /// Stop every running component in a group, recursively.
    pub fn stop_process_group(&self, group_id: &str) -> EngineResult<()> {
        let mut members = self.collect_group_members(group_id)?;
        members.reverse();
        for node in members {
            if node.schedule().state() != ScheduledState::Running {
                continue;
            }
            if let Err(e) = self.stop_connectable(node.id()) {
                tracing::warn!(component = %node.id(), error = %e, "Failed to stop component");
            }
        }
        Ok(())
    }

    fn collect_group_members(&self, group_id: &str) -> EngineResult<Vec<Arc<ConnectableNode>>> {
        let graph = self.graph.read();
        if graph.group(group_id).is_none() {
            return Err(EngineError::ComponentNotFound(group_id.to_string()));
        }
        let mut members = Vec::new();
        let mut pending = vec![group_id.to_string()];
        while let Some(current) = pending.pop() {
            let Some(group) = graph.group(&current) else {
                continue;
            };
            for id in &group.connectables {
                if let Some(node) = graph.connectable(id) {
                    members.push(node.clone());
                }
            }
            pending.extend(group.child_groups.iter().cloned());
        }
        Ok(members)
    }

    /// Load durable state and open the gate for start operations: recovers
    /// the flow-file repository and swapped flow files, then flushes the
    /// deferred-start buffer in order. Failure here is fatal to startup.
    pub fn initialize_flow(&self) -> EngineResult<()> {
        self.ensure_not_terminated()?;
        let max_id = self.context.repositories.flowfile.load()?;
        let swapped_max = self
            .context
            .repositories
            .swap
            .recover_swapped(self.context.claims.clone())?;
        self.context.repositories.swap.start()?;
        tracing::info!(
            max_flowfile_id = max_id.max(swapped_max),
            "Flow initialized"
        );
        self.started.store(true, Ordering::SeqCst);
        self.start_delayed();
        Ok(())
    }

    /// Flush the deferred-start buffer, in order.
    pub fn start_delayed(&self) {
        let deferred: Vec<String> = std::mem::take(&mut *self.deferred_starts.lock());
        for id in deferred {
            let result = if self.reporting_tasks.contains_key(&id) {
                self.start_reporting_task(&id)
            } else {
                self.start_connectable(&id)
            };
            if let Err(e) = result {
                tracing::warn!(component = %id, error = %e, "Deferred start failed");
            }
        }
    }

    // ── Cluster ──────────────────────────────────────────────────────────

    /// Inform the controller whether it participates in a cluster.
    pub fn set_clustered(&self, clustered: bool, connected: bool) {
        self.clustered.store(clustered, Ordering::SeqCst);
        self.connected.store(connected, Ordering::SeqCst);
        self.scheduler.set_clustered(clustered);
        self.refresh_heartbeat_bean();
        tracing::info!(clustered, connected, "Cluster state changed");
    }

    /// Flip the primary-node flag. Primary-only components observe the flag
    /// on their next tick.
    pub fn set_primary(&self, primary: bool) {
        self.scheduler.set_primary(primary);
        self.refresh_heartbeat_bean();
        tracing::info!(primary, "Primary-node flag changed");
    }

    /// Whether this node is the elected primary.
    pub fn is_primary(&self) -> bool {
        self.scheduler.is_primary()
    }

    /// Whether this node participates in a cluster.
    pub fn is_clustered(&self) -> bool {
        self.clustered.load(Ordering::SeqCst)
    }

    fn refresh_heartbeat_bean(&self) {
        self.heartbeat.set_bean(HeartbeatBean {
            root_group_id: self.root_group_id(),
            primary: self.scheduler.is_primary(),
            connected: self.connected.load(Ordering::SeqCst),
        });
    }

    /// The heartbeat monitor.
    pub fn heartbeat_monitor(&self) -> &Arc<HeartbeatMonitor> {
        &self.heartbeat
    }

    /// Start (or restart) heartbeating.
    pub fn start_heartbeating(&self) -> EngineResult<()> {
        self.ensure_not_terminated()?;
        let weak = self.weak_self.clone();
        let payload_source = Arc::new(move || {
            weak.upgrade().map(|controller| controller.heartbeat_payload())
        });
        self.heartbeat
            .start(payload_source, self.context.repositories.bulletins.clone());
        Ok(())
    }

    /// Stop heartbeating.
    pub fn stop_heartbeating(&self) {
        self.heartbeat.stop();
    }

    /// Suspend heartbeat delivery without cancelling the tasks.
    pub fn suspend_heartbeats(&self) {
        self.heartbeat.suspend();
    }

    /// Resume heartbeat delivery.
    pub fn resume_heartbeats(&self) {
        self.heartbeat.resume();
    }

    /// Build one heartbeat payload from a fresh status aggregation pass.
    pub fn heartbeat_payload(&self) -> HeartbeatPayload {
        let status = self.controller_status();
        HeartbeatPayload {
            system_start_time: self.start_time,
            active_thread_count: status.active_thread_count,
            total_queued_count: status.queued_count,
            total_queued_bytes: status.queued_bytes,
            counters: self.context.counters.snapshot(),
            system_diagnostics: SystemDiagnostics {
                available_processors: std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1),
                uptime_seconds: (Utc::now() - self.start_time).num_seconds().max(0) as u64,
            },
            group_status: status,
            site_to_site_port: self.context.settings.remote_input_port,
            generated_at: Utc::now(),
        }
    }

    // ── Replay ───────────────────────────────────────────────────────────

    /// Reconstruct a flow file from a prior provenance event and enqueue it
    /// on its original source queue.
    pub fn replay_flow_file(&self, event_id: u64) -> EngineResult<FlowFileRecord> {
        self.ensure_not_terminated()?;
        let graph = self.graph.read();
        replay_event(&graph, &self.context, event_id)
    }

    // ── Snippets ─────────────────────────────────────────────────────────

    /// Instantiate a snippet into a target group, atomically: validation
    /// runs in full first, and any late failure rolls back everything the
    /// call created.
    pub fn instantiate_snippet(&self, group_id: &str, snippet: &Snippet) -> EngineResult<()> {
        self.ensure_not_terminated()?;
        let mut graph = self.graph.write();
        validate_snippet(&graph, &self.extensions, snippet, group_id)?;

        let mut refs = InstantiatedRefs::default();
        match self.instantiate_into(&mut graph, group_id, snippet, &mut refs) {
            Ok(()) => Ok(()),
            Err(e) => {
                refs.undo(&mut graph);
                Err(e)
            }
        }
    }

    fn instantiate_into(
        &self,
        graph: &mut FlowGraph,
        group_id: &str,
        snippet: &Snippet,
        refs: &mut InstantiatedRefs,
    ) -> EngineResult<()> {
        for label in &snippet.labels {
            graph.add_label(group_id, label.clone())?;
            refs.labels.push((group_id.to_string(), label.id.clone()));
        }
        for funnel in &snippet.funnels {
            let node = Arc::new(ConnectableNode::new(
                funnel.id.clone(),
                ConnectableKind::Funnel,
                funnel.id.clone(),
                group_id.to_string(),
            ));
            node.set_position(funnel.position);
            graph.add_connectable(group_id, node)?;
            refs.connectables.push(funnel.id.clone());
        }
        for (ports, input) in [(&snippet.input_ports, true), (&snippet.output_ports, false)] {
            for port in ports.iter() {
                let kind = match (input, group_id == graph.root_id()) {
                    (true, true) => ConnectableKind::RootInputPort,
                    (true, false) => ConnectableKind::InputPort,
                    (false, true) => ConnectableKind::RootOutputPort,
                    (false, false) => ConnectableKind::OutputPort,
                };
                let node = Arc::new(ConnectableNode::new(
                    port.id.clone(),
                    kind,
                    port.name.clone(),
                    group_id.to_string(),
                ));
                node.set_position(port.position);
                graph.add_connectable(group_id, node)?;
                refs.connectables.push(port.id.clone());
            }
        }
        for processor in &snippet.processors {
            let plugin = self.extensions.create_processor(&processor.type_name)?;
            let node = Arc::new(ConnectableNode::processor(
                processor.id.clone(),
                processor.name.clone(),
                group_id.to_string(),
                processor.type_name.clone(),
                plugin,
                processor.scheduling.clone(),
            ));
            node.set_position(processor.position);
            graph.add_connectable(group_id, node.clone())?;
            refs.connectables.push(processor.id.clone());
            let added = {
                let _scope = ExtensionScope::enter(processor.type_name.as_str());
                node.plugin().map(|p| p.on_added()).unwrap_or(Ok(()))
            };
            if let Err(e) = added {
                return Err(EngineError::Instantiation {
                    type_name: processor.type_name.clone(),
                    reason: format!("on_added hook failed: {}", e),
                });
            }
        }
        for remote in &snippet.remote_groups {
            let group = Arc::new(RemoteProcessGroup::new(
                remote.id.clone(),
                remote.target_uri.clone(),
            ));
            if let Some(name) = &remote.name {
                group.set_name(name.clone());
            }
            graph.add_remote_group(group_id, group)?;
            refs.remotes.push((group_id.to_string(), remote.id.clone()));
        }
        for child in &snippet.child_groups {
            graph.add_group(
                group_id,
                ProcessGroup::new(child.id.clone(), child.name.clone(), Some(group_id.to_string())),
            )?;
            refs.groups.push(child.id.clone());
            self.instantiate_into(graph, &child.id, &child.contents, refs)?;
        }
        for dto in &snippet.connections {
            let source = graph
                .connectable(&dto.source_id)
                .cloned()
                .ok_or_else(|| EngineError::ComponentNotFound(dto.source_id.clone()))?;
            let destination = graph
                .connectable(&dto.destination_id)
                .cloned()
                .ok_or_else(|| EngineError::ComponentNotFound(dto.destination_id.clone()))?;
            let relationships = if source.kind() == ConnectableKind::Processor {
                if dto.relationships.is_empty() {
                    return Err(EngineError::InvalidArgument(format!(
                        "Connection {} from a processor must select at least one relationship",
                        dto.id
                    )));
                }
                dto.relationships.clone()
            } else if dto.relationships.is_empty() {
                vec![RELAY_RELATIONSHIP.to_string()]
            } else {
                dto.relationships.clone()
            };
            let connection = Arc::new(Connection::new(
                dto.id.clone(),
                group_id.to_string(),
                source,
                destination,
                relationships,
            ));
            if dto.object_threshold.is_some() || dto.byte_threshold.is_some() {
                connection.queue().set_thresholds(
                    dto.object_threshold
                        .unwrap_or(crate::graph::FlowFileQueue::DEFAULT_OBJECT_THRESHOLD),
                    dto.byte_threshold
                        .unwrap_or(crate::graph::FlowFileQueue::DEFAULT_BYTE_THRESHOLD),
                );
            }
            if let Some(expiration) = &dto.expiration {
                connection
                    .queue()
                    .set_expiration(Some(parse_time_period(expiration)?));
            }
            if !dto.prioritizers.is_empty() {
                let mut prioritizers = Vec::with_capacity(dto.prioritizers.len());
                for type_name in &dto.prioritizers {
                    prioritizers.push(self.extensions.create_prioritizer(type_name)?);
                }
                connection.queue().set_prioritizers(prioritizers);
            }
            connection.set_bend_points(dto.bends.clone());
            let listener: Arc<dyn QueueActivityListener> = self.scheduler.clone();
            connection.queue().set_activity_listener(listener);
            graph.add_connection(group_id, connection)?;
            refs.connections.push(dto.id.clone());
        }
        Ok(())
    }

    // ── Periodic service bodies ──────────────────────────────────────────

    fn sweep_expired_flowfiles(&self) {
        let queues: Vec<_> = {
            let graph = self.graph.read();
            graph.connections().map(|c| c.queue().clone()).collect()
        };
        let mut expired_total = 0usize;
        for queue in queues {
            for record in queue.sweep_expired() {
                expired_total += 1;
                if let Some(content) = &record.content {
                    self.context.claims.decrement(&content.claim);
                }
                let event = ProvenanceEventRecord {
                    id: 0,
                    event_type: ProvenanceEventType::Expire,
                    flowfile_uuid: record.uuid().to_string(),
                    parent_uuids: Vec::new(),
                    child_uuids: Vec::new(),
                    component_id: queue.id().to_string(),
                    attributes: record.attributes.clone(),
                    previous_claim: record.content.clone(),
                    source_queue_id: Some(queue.id().to_string()),
                    details: Some("flow file exceeded queue expiration".to_string()),
                    timestamp: Utc::now(),
                };
                if let Err(e) = self.context.repositories.provenance.register_event(event) {
                    tracing::warn!(error = %e, "Failed to register expiration event");
                }
                let delete = crate::repo::RepositoryRecord {
                    record,
                    record_type: crate::repo::RepositoryRecordType::Delete,
                    destination_queue: None,
                };
                if let Err(e) = self
                    .context
                    .repositories
                    .flowfile
                    .update_repository(&[delete])
                {
                    tracing::warn!(error = %e, "Failed to record flow-file expiration");
                }
            }
        }
        if expired_total > 0 {
            tracing::debug!(expired = expired_total, "Expired flow files swept");
        }
    }

    fn refresh_remote_groups(&self) {
        let remotes: Vec<_> = {
            let graph = self.graph.read();
            graph.remote_groups().collect()
        };
        for remote in remotes {
            if let Err(e) = remote.refresh(self.discovery.as_ref()) {
                tracing::warn!(remote = %remote.id(), error = %e, "Remote group refresh failed");
            }
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────────────

    /// Shut the controller down. Stops every running component, cancels the
    /// periodic services and heartbeating, and drains the worker pools
    /// within the configured budget (or aborts them when `kill`). Returns
    /// true when the pools drained cleanly.
    pub async fn shutdown(&self, kill: bool) -> EngineResult<bool> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Ok(true);
        }
        tracing::info!(kill, "Shutting down flow controller");

        let running: Vec<Arc<ConnectableNode>> = {
            let graph = self.graph.read();
            graph
                .connectables()
                .filter(|n| n.schedule().state() == ScheduledState::Running)
                .cloned()
                .collect()
        };
        for node in running {
            if let Err(e) = self.scheduler.stop(&ScheduledEntity::Component(node.clone())) {
                tracing::warn!(component = %node.id(), error = %e, "Failed to stop component during shutdown");
            }
        }
        for entry in self.reporting_tasks.iter() {
            if entry.value().schedule().state() == ScheduledState::Running {
                let _ = self
                    .scheduler
                    .stop(&ScheduledEntity::Reporting(entry.value().clone()));
            }
        }

        self.periodic_cancel.cancel();
        self.heartbeat.stop();

        let budget = Duration::from_secs(self.context.settings.graceful_shutdown_seconds);
        let clean = self.scheduler.shutdown(budget, kill).await;
        if !clean {
            tracing::warn!("Flow controller was not cleanly terminated");
        }

        // Shutdown hooks, then repository release.
        {
            let graph = self.graph.read();
            for node in graph.connectables() {
                if let Some(plugin) = node.plugin() {
                    let _scope = ExtensionScope::enter(node.type_name().unwrap_or_default());
                    plugin.on_shutdown();
                }
            }
        }
        for entry in self.reporting_tasks.iter() {
            let _scope = ExtensionScope::enter(entry.value().type_name());
            entry.value().task().on_shutdown();
        }

        self.context.repositories.swap.shutdown();
        if let Err(e) = self.context.repositories.flowfile.close() {
            tracing::warn!(error = %e, "Failed to close flow-file repository");
        }
        if let Err(e) = self.context.repositories.provenance.close() {
            tracing::warn!(error = %e, "Failed to close provenance repository");
        }
        self.context.repositories.content.shutdown();

        Ok(clean)
    }
}

#[derive(Default)]
struct InstantiatedRefs {
    labels: Vec<(String, String)>,
    connectables: Vec<String>,
    connections: Vec<String>,
    remotes: Vec<(String, String)>,
    groups: Vec<String>,
}

impl InstantiatedRefs {
    /// Remove everything a failed snippet instantiation created, in reverse
    /// dependency order. Components were created in this call, so they are
    /// stopped and their queues empty.
    fn undo(self, graph: &mut FlowGraph) {
        for id in self.connections.iter().rev() {
            let _ = graph.remove_connection(id);
        }
        for id in self.connectables.iter().rev() {
            let _ = graph.remove_connectable(id);
        }
        for (group_id, label_id) in self.labels.iter().rev() {
            if let Some(group) = graph.group_mut(group_id) {
                group.labels.remove(label_id);
            }
        }
        for (group_id, remote_id) in self.remotes.iter().rev() {
            if let Some(group) = graph.group_mut(group_id) {
                group.remote_groups.remove(remote_id);
            }
        }
        for id in self.groups.iter().rev() {
            let _ = graph.remove_group(id);
        }
    }
}

/// Run `body` every `period` until cancelled, with an exception barrier: a
/// panicking body is caught so a single failure cannot cancel the schedule.
async fn periodic<F>(cancel: CancellationToken, period: Duration, body: F)
where
    F: Fn() + Send + 'static,
{
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first interval tick fires immediately; skip it so the first body
    // run happens one full period after start.
    tick.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(&body)).is_err() {
                    tracing::error!("Periodic task panicked; schedule continues");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> Arc<FlowController> {
        FlowEngineBuilder::new(EngineSettings::default())
            .build()
            .expect("controller builds")
    }

    #[tokio::test]
    async fn test_secure_site_to_site_requires_tls() {
        let settings = EngineSettings {
            site_to_site_secure: true,
            ..EngineSettings::default()
        };
        let result = FlowEngineBuilder::new(settings).build();
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_deferred_start_flushes_on_initialize() {
        let controller = controller();
        let root = controller.root_group_id();
        controller.create_funnel(&root, "f1").expect("create");
        controller.create_funnel(&root, "f2").expect("create");
        controller
            .create_connection(&root, "c1", "f1", "f2", vec![])
            .expect("connect");

        // Buffered: the flow is not initialized yet.
        controller.start_connectable("f1").expect("buffered start");
        assert_eq!(
            controller.connectable_state("f1").expect("state"),
            ScheduledState::Stopped
        );

        controller.initialize_flow().expect("initialize");
        assert_eq!(
            controller.connectable_state("f1").expect("state"),
            ScheduledState::Running
        );
        controller.shutdown(false).await.expect("shutdown");
    }

    #[tokio::test]
    async fn test_mutation_rejected_after_shutdown() {
        let controller = controller();
        let root = controller.root_group_id();
        controller.shutdown(false).await.expect("shutdown");
        assert!(matches!(
            controller.create_funnel(&root, "f1"),
            Err(EngineError::Terminated)
        ));
    }

    #[tokio::test]
    async fn test_update_processor_scheduling_requires_stopped() {
        let controller = controller();
        let root = controller.root_group_id();
        controller.create_funnel(&root, "f1").expect("create");
        controller.create_funnel(&root, "f2").expect("create");
        controller
            .create_connection(&root, "c1", "f1", "f2", vec![])
            .expect("connect");
        controller.initialize_flow().expect("initialize");
        controller.start_connectable("f1").expect("start");

        let update = ProcessorUpdate {
            max_concurrent_tasks: Some(4),
            ..ProcessorUpdate::default()
        };
        assert!(matches!(
            controller.update_processor("f1", update.clone()),
            Err(EngineError::IllegalState(_))
        ));

        // Renaming is not a scheduling change and is allowed while running.
        let rename = ProcessorUpdate {
            name: Some("renamed".to_string()),
            ..ProcessorUpdate::default()
        };
        controller.update_processor("f1", rename).expect("rename");

        controller.stop_connectable("f1").expect("stop");
        controller.update_processor("f1", update).expect("update when stopped");
        controller.shutdown(false).await.expect("shutdown");
    }

    #[tokio::test]
    async fn test_group_start_and_stop_recurse() {
        let controller = controller();
        let root = controller.root_group_id();
        controller
            .create_process_group(&root, "g1", "child")
            .expect("create group");
        controller.create_funnel(&root, "f1").expect("create");
        controller.create_funnel(&root, "f2").expect("create");
        controller.create_funnel("g1", "f3").expect("create");
        controller
            .create_connection(&root, "c1", "f1", "f2", vec![])
            .expect("connect");
        controller
            .create_connection("g1", "c2", "f3", "f1", vec![])
            .expect("connect");
        controller.initialize_flow().expect("initialize");

        controller.start_process_group(&root).expect("group start");
        assert_eq!(
            controller.connectable_state("f1").expect("state"),
            ScheduledState::Running
        );
        assert_eq!(
            controller.connectable_state("f3").expect("state"),
            ScheduledState::Running,
            "children of nested groups start too"
        );
        // f2 has no outbound connection, so it is invalid and skipped.
        assert_eq!(
            controller.connectable_state("f2").expect("state"),
            ScheduledState::Stopped
        );

        controller.stop_process_group(&root).expect("group stop");
        assert_eq!(
            controller.connectable_state("f1").expect("state"),
            ScheduledState::Stopped
        );
        assert_eq!(
            controller.connectable_state("f3").expect("state"),
            ScheduledState::Stopped
        );
        controller.shutdown(false).await.expect("shutdown");
    }

    #[tokio::test]
    async fn test_connection_requires_declared_relationship() {
        let controller = controller();
        let root = controller.root_group_id();
        controller.create_funnel(&root, "f1").expect("create");
        controller.create_funnel(&root, "f2").expect("create");
        // Relay sources get the anonymous relationship by default.
        controller
            .create_connection(&root, "c1", "f1", "f2", vec![])
            .expect("relay connection");
        // Unknown source: error.
        assert!(controller
            .create_connection(&root, "c2", "missing", "f2", vec![])
            .is_err());
    }
}
