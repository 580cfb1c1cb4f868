//! Component status and the aggregation pass
//!
//! Each component accumulates event totals in lock-free counters; a periodic
//! pass walks the group tree in post-order and rolls the summable fields up
//! to the root, appending each snapshot to the component status repository.

use crate::graph::{ConnectableKind, FlowGraph};
use crate::scheduling::ScheduledState;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free per-component event totals.
#[derive(Debug, Default)]
pub struct EventTotals {
    input_count: AtomicU64,
    input_bytes: AtomicU64,
    output_count: AtomicU64,
    output_bytes: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    sent_count: AtomicU64,
    sent_bytes: AtomicU64,
    received_count: AtomicU64,
    received_bytes: AtomicU64,
    invocations: AtomicU64,
    processing_nanos: AtomicU64,
}

impl EventTotals {
    /// Record flow files consumed from inbound queues.
    pub fn add_input(&self, count: u64, bytes: u64) {
        self.input_count.fetch_add(count, Ordering::Relaxed);
        self.input_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record flow files routed to outbound queues.
    pub fn add_output(&self, count: u64, bytes: u64) {
        self.output_count.fetch_add(count, Ordering::Relaxed);
        self.output_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record content bytes read.
    pub fn add_bytes_read(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record content bytes written.
    pub fn add_bytes_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record flow files sent to a remote system.
    pub fn add_sent(&self, count: u64, bytes: u64) {
        self.sent_count.fetch_add(count, Ordering::Relaxed);
        self.sent_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record flow files received from a remote system.
    pub fn add_received(&self, count: u64, bytes: u64) {
        self.received_count.fetch_add(count, Ordering::Relaxed);
        self.received_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record one trigger invocation and its duration.
    pub fn add_invocation(&self, nanos: u64) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        self.processing_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    /// Number of trigger invocations so far.
    pub fn invocation_count(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    fn snapshot(&self) -> TotalsSnapshot {
        TotalsSnapshot {
            input_count: self.input_count.load(Ordering::Relaxed),
            input_bytes: self.input_bytes.load(Ordering::Relaxed),
            output_count: self.output_count.load(Ordering::Relaxed),
            output_bytes: self.output_bytes.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            sent_count: self.sent_count.load(Ordering::Relaxed),
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            received_count: self.received_count.load(Ordering::Relaxed),
            received_bytes: self.received_bytes.load(Ordering::Relaxed),
            invocations: self.invocations.load(Ordering::Relaxed),
            processing_nanos: self.processing_nanos.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct TotalsSnapshot {
    input_count: u64,
    input_bytes: u64,
    output_count: u64,
    output_bytes: u64,
    bytes_read: u64,
    bytes_written: u64,
    sent_count: u64,
    sent_bytes: u64,
    received_count: u64,
    received_bytes: u64,
    invocations: u64,
    processing_nanos: u64,
}

/// Status of one processor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessorStatus {
    /// Processor id
    pub id: String,
    /// Processor name
    pub name: String,
    /// Scheduled state at capture time
    pub run_status: Option<ScheduledState>,
    /// Workers currently inside the processor
    pub active_thread_count: usize,
    /// Flow files consumed
    pub input_count: u64,
    /// Bytes of consumed flow-file content
    pub input_bytes: u64,
    /// Flow files produced
    pub output_count: u64,
    /// Bytes of produced flow-file content
    pub output_bytes: u64,
    /// Content bytes read
    pub bytes_read: u64,
    /// Content bytes written
    pub bytes_written: u64,
    /// Trigger invocations
    pub invocations: u64,
    /// Cumulative trigger time in nanoseconds
    pub processing_nanos: u64,
}

/// Status of one local or root-level port.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortStatus {
    /// Port id
    pub id: String,
    /// Port name
    pub name: String,
    /// Scheduled state at capture time
    pub run_status: Option<ScheduledState>,
    /// Workers currently inside the port
    pub active_thread_count: usize,
    /// Flow files consumed
    pub input_count: u64,
    /// Bytes consumed
    pub input_bytes: u64,
    /// Flow files produced
    pub output_count: u64,
    /// Bytes produced
    pub output_bytes: u64,
}

/// Status of one connection and its queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// Connection id
    pub id: String,
    /// Connection name
    pub name: Option<String>,
    /// Source component id
    pub source_id: String,
    /// Destination component id
    pub destination_id: String,
    /// Queued flow files
    pub queued_count: u64,
    /// Queued bytes
    pub queued_bytes: u64,
    /// Whether the queue has reached a back-pressure threshold
    pub full: bool,
}

/// Status of one remote process group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteGroupStatus {
    /// Remote group id
    pub id: String,
    /// Target URI
    pub target_uri: String,
    /// Whether transmission is enabled
    pub transmitting: bool,
    /// Flow files sent
    pub sent_count: u64,
    /// Bytes sent
    pub sent_bytes: u64,
    /// Flow files received
    pub received_count: u64,
    /// Bytes received
    pub received_bytes: u64,
    /// Last refresh or authorisation issue, if any
    pub last_refresh_error: Option<String>,
}

/// Aggregated status of a process group subtree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessGroupStatus {
    /// Group id
    pub id: String,
    /// Group name
    pub name: String,
    /// Workers active anywhere in the subtree
    pub active_thread_count: usize,
    /// Flow files queued in the subtree
    pub queued_count: u64,
    /// Bytes queued in the subtree
    pub queued_bytes: u64,
    /// Content bytes read in the subtree
    pub bytes_read: u64,
    /// Content bytes written in the subtree
    pub bytes_written: u64,
    /// Flow files consumed in the subtree
    pub input_count: u64,
    /// Bytes consumed in the subtree
    pub input_bytes: u64,
    /// Flow files produced in the subtree
    pub output_count: u64,
    /// Bytes produced in the subtree
    pub output_bytes: u64,
    /// Flow files sent to remote systems from the subtree
    pub sent_count: u64,
    /// Bytes sent to remote systems from the subtree
    pub sent_bytes: u64,
    /// Flow files received from remote systems in the subtree
    pub received_count: u64,
    /// Bytes received from remote systems in the subtree
    pub received_bytes: u64,
    /// Per-processor status
    pub processors: Vec<ProcessorStatus>,
    /// Per-port status
    pub ports: Vec<PortStatus>,
    /// Per-connection status
    pub connections: Vec<ConnectionStatus>,
    /// Per-remote-group status
    pub remote_groups: Vec<RemoteGroupStatus>,
    /// Child group subtrees
    pub child_groups: Vec<ProcessGroupStatus>,
}

/// Compose the status tree for `group_id`, post-order. The caller holds the
/// controller read lock; only lock-free per-component state is read beyond
/// the graph structure itself.
pub(crate) fn aggregate_group(graph: &FlowGraph, group_id: &str) -> ProcessGroupStatus {
    let Some(group) = graph.group(group_id) else {
        return ProcessGroupStatus::default();
    };

    let mut status = ProcessGroupStatus {
        id: group.id.clone(),
        name: group.name.clone(),
        ..Default::default()
    };

    for child_id in &group.child_groups {
        let child = aggregate_group(graph, child_id);
        status.active_thread_count += child.active_thread_count;
        status.queued_count += child.queued_count;
        status.queued_bytes += child.queued_bytes;
        status.bytes_read += child.bytes_read;
        status.bytes_written += child.bytes_written;
        status.input_count += child.input_count;
        status.input_bytes += child.input_bytes;
        status.output_count += child.output_count;
        status.output_bytes += child.output_bytes;
        status.sent_count += child.sent_count;
        status.sent_bytes += child.sent_bytes;
        status.received_count += child.received_count;
        status.received_bytes += child.received_bytes;
        status.child_groups.push(child);
    }

    for id in &group.connectables {
        let Some(node) = graph.connectable(id) else {
            continue;
        };
        let totals = node.totals().snapshot();
        let active = node.schedule().active_tasks();
        status.active_thread_count += active;
        status.bytes_read += totals.bytes_read;
        status.bytes_written += totals.bytes_written;
        status.input_count += totals.input_count;
        status.input_bytes += totals.input_bytes;
        status.output_count += totals.output_count;
        status.output_bytes += totals.output_bytes;
        status.sent_count += totals.sent_count;
        status.sent_bytes += totals.sent_bytes;
        status.received_count += totals.received_count;
        status.received_bytes += totals.received_bytes;

        match node.kind() {
            ConnectableKind::Processor => status.processors.push(ProcessorStatus {
                id: node.id().to_string(),
                name: node.name(),
                run_status: Some(node.schedule().state()),
                active_thread_count: active,
                input_count: totals.input_count,
                input_bytes: totals.input_bytes,
                output_count: totals.output_count,
                output_bytes: totals.output_bytes,
                bytes_read: totals.bytes_read,
                bytes_written: totals.bytes_written,
                invocations: totals.invocations,
                processing_nanos: totals.processing_nanos,
            }),
            ConnectableKind::Funnel => {}
            _ => status.ports.push(PortStatus {
                id: node.id().to_string(),
                name: node.name(),
                run_status: Some(node.schedule().state()),
                active_thread_count: active,
                input_count: totals.input_count,
                input_bytes: totals.input_bytes,
                output_count: totals.output_count,
                output_bytes: totals.output_bytes,
            }),
        }
    }

    for id in &group.connections {
        let Some(connection) = graph.connection(id) else {
            continue;
        };
        let size = connection.queue().size();
        status.queued_count += size.object_count as u64;
        status.queued_bytes += size.byte_count;
        status.connections.push(ConnectionStatus {
            id: connection.id().to_string(),
            name: connection.name(),
            source_id: connection.source().id().to_string(),
            destination_id: connection.destination().id().to_string(),
            queued_count: size.object_count as u64,
            queued_bytes: size.byte_count,
            full: connection.queue().is_full(),
        });
    }

    for remote in group.remote_groups.values() {
        let totals = remote.totals().snapshot();
        status.sent_count += totals.sent_count;
        status.sent_bytes += totals.sent_bytes;
        status.received_count += totals.received_count;
        status.received_bytes += totals.received_bytes;
        status.remote_groups.push(RemoteGroupStatus {
            id: remote.id().to_string(),
            target_uri: remote.target_uri().to_string(),
            transmitting: remote.is_transmitting(),
            sent_count: totals.sent_count,
            sent_bytes: totals.sent_bytes,
            received_count: totals.received_count,
            received_bytes: totals.received_bytes,
            last_refresh_error: remote.last_refresh_error(),
        });
    }

    status
}
