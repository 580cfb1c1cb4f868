//! Clustered heartbeat subsystem
//!
//! Three periodic tasks cooperate: the generator snapshots aggregated
//! status into a single-slot cell (overwriting any unsent predecessor), the
//! sender drains that cell every 250 ms unless suspended, and the bulletin
//! bundler forwards accumulated node bulletins every 2 s. The most recent
//! snapshot always wins; transport failures are logged at debug and never
//! fail the schedule.

use crate::repo::{Bulletin, BulletinRepository, NodeProtocolSender};
use crate::status::ProcessGroupStatus;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Cadence of the sender task.
const SEND_INTERVAL: Duration = Duration::from_millis(250);
/// Cadence of the bulletin bundler.
const BULLETIN_INTERVAL: Duration = Duration::from_secs(2);

/// Immutable snapshot of the cluster-relevant controller state. Swapped
/// atomically whenever any field changes, so heartbeat generation never
/// blocks reconfiguration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatBean {
    /// Identifier of the current root group
    pub root_group_id: String,
    /// Whether this node is the elected primary
    pub primary: bool,
    /// Whether this node is connected to the cluster
    pub connected: bool,
}

/// Host-level diagnostics carried by each heartbeat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemDiagnostics {
    /// Logical processors available to the controller
    pub available_processors: usize,
    /// Seconds since controller start
    pub uptime_seconds: u64,
}

/// Payload of one heartbeat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Instant the controller started
    pub system_start_time: DateTime<Utc>,
    /// Workers active anywhere in the flow
    pub active_thread_count: usize,
    /// Flow files queued across all connections
    pub total_queued_count: u64,
    /// Bytes queued across all connections
    pub total_queued_bytes: u64,
    /// Named counter snapshot
    pub counters: Vec<(String, i64)>,
    /// Host diagnostics
    pub system_diagnostics: SystemDiagnostics,
    /// Aggregated root-group status
    pub group_status: ProcessGroupStatus,
    /// Site-to-site listening port, when the listener is enabled
    pub site_to_site_port: Option<u16>,
    /// Instant the payload was generated
    pub generated_at: DateTime<Utc>,
}

/// A heartbeat as handed to the protocol sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    /// Identifier of this node
    pub node_id: String,
    /// Whether this node is the elected primary
    pub primary: bool,
    /// Whether this node considers itself connected
    pub connected: bool,
    /// Status payload
    pub payload: HeartbeatPayload,
}

/// Bundled node bulletins as handed to the protocol sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeBulletinsMessage {
    /// Identifier of this node
    pub node_id: String,
    /// Drained bulletins, messages already XML-sanitised
    pub bulletins: Vec<Bulletin>,
}

/// Replace XML-illegal control characters (anything below 0x20 except tab,
/// line feed, carriage return) with `?`.
pub fn escape_xml_illegal(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            if (c as u32) < 0x20 && c != '\u{09}' && c != '\u{0A}' && c != '\u{0D}' {
                '?'
            } else {
                c
            }
        })
        .collect()
}

/// Generates, stores, and transmits heartbeats.
pub struct HeartbeatMonitor {
    node_id: String,
    heartbeat_delay: Duration,
    bean: ArcSwap<HeartbeatBean>,
    slot: Mutex<Option<HeartbeatMessage>>,
    suspended: AtomicBool,
    sender: Arc<dyn NodeProtocolSender>,
    cancel: Mutex<Option<CancellationToken>>,
    weak_self: Weak<HeartbeatMonitor>,
}

impl HeartbeatMonitor {
    /// Create a monitor; heartbeating does not start until
    /// [`start`](Self::start).
    pub fn new(
        node_id: impl Into<String>,
        heartbeat_delay: Duration,
        sender: Arc<dyn NodeProtocolSender>,
        initial_bean: HeartbeatBean,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            node_id: node_id.into(),
            heartbeat_delay,
            bean: ArcSwap::from_pointee(initial_bean),
            slot: Mutex::new(None),
            suspended: AtomicBool::new(false),
            sender,
            cancel: Mutex::new(None),
            weak_self: weak.clone(),
        })
    }

    /// Current cluster-state snapshot.
    pub fn bean(&self) -> Arc<HeartbeatBean> {
        self.bean.load_full()
    }

    /// Swap in a new cluster-state snapshot.
    pub fn set_bean(&self, bean: HeartbeatBean) {
        self.bean.store(Arc::new(bean));
    }

    /// Stop delivering heartbeats while keeping the tasks scheduled.
    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::SeqCst);
    }

    /// Resume heartbeat delivery.
    pub fn resume(&self) {
        self.suspended.store(false, Ordering::SeqCst);
    }

    /// Whether delivery is suspended.
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Store a generated heartbeat, overwriting any unsent predecessor.
    pub fn store(&self, message: HeartbeatMessage) {
        *self.slot.lock() = Some(message);
    }

    /// Atomically take the stored heartbeat, clearing the slot.
    pub fn take(&self) -> Option<HeartbeatMessage> {
        self.slot.lock().take()
    }

    /// Start the generator, sender, and bulletin tasks. Idempotent over
    /// [`stop`](Self::stop): an already-running monitor is stopped first and
    /// restarted.
    pub fn start(
        &self,
        payload_source: Arc<dyn Fn() -> Option<HeartbeatPayload> + Send + Sync>,
        bulletins: Arc<dyn BulletinRepository>,
    ) {
        self.stop();
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        let cancel = CancellationToken::new();
        *self.cancel.lock() = Some(cancel.clone());
        tracing::info!(node = %self.node_id, "Starting heartbeat tasks");

        // Generator: snapshot status into the single slot.
        let monitor = this.clone();
        let generator_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(monitor.heartbeat_delay);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = generator_cancel.cancelled() => break,
                    _ = tick.tick() => {
                        let bean = monitor.bean();
                        let Some(payload) = payload_source() else { continue };
                        monitor.store(HeartbeatMessage {
                            node_id: monitor.node_id.clone(),
                            primary: bean.primary,
                            connected: bean.connected,
                            payload,
                        });
                    }
                }
            }
        });

        // Sender: drain the slot unless suspended.
        let monitor = this.clone();
        let sender_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SEND_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = sender_cancel.cancelled() => break,
                    _ = tick.tick() => {
                        if monitor.is_suspended() {
                            continue;
                        }
                        let Some(message) = monitor.take() else { continue };
                        let started = Instant::now();
                        match monitor.sender.heartbeat(&message) {
                            Ok(()) => {
                                tracing::debug!(
                                    node = %monitor.node_id,
                                    elapsed_ms = started.elapsed().as_millis() as u64,
                                    "Heartbeat sent"
                                );
                                metrics::counter!("flowgrid_heartbeats_sent_total").increment(1);
                            }
                            Err(e) => {
                                // Expected during cluster-manager failover.
                                tracing::debug!(node = %monitor.node_id, error = %e, "Heartbeat send failed");
                            }
                        }
                    }
                }
            }
        });

        // Bulletin bundler: forward accumulated node bulletins.
        let monitor = this;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(BULLETIN_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        let mut drained = bulletins.drain_node_bulletins();
                        if drained.is_empty() {
                            continue;
                        }
                        for bulletin in &mut drained {
                            bulletin.message = escape_xml_illegal(&bulletin.message);
                        }
                        let message = NodeBulletinsMessage {
                            node_id: monitor.node_id.clone(),
                            bulletins: drained,
                        };
                        if let Err(e) = monitor.sender.send_bulletins(&message) {
                            tracing::debug!(node = %monitor.node_id, error = %e, "Bulletin send failed");
                        }
                    }
                }
            }
        });
    }

    /// Cancel the heartbeat tasks.
    pub fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
            tracing::info!(node = %self.node_id, "Stopped heartbeat tasks");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(tag: &str) -> HeartbeatMessage {
        HeartbeatMessage {
            node_id: tag.to_string(),
            primary: false,
            connected: true,
            payload: HeartbeatPayload {
                system_start_time: Utc::now(),
                active_thread_count: 0,
                total_queued_count: 0,
                total_queued_bytes: 0,
                counters: Vec::new(),
                system_diagnostics: SystemDiagnostics::default(),
                group_status: ProcessGroupStatus::default(),
                site_to_site_port: None,
                generated_at: Utc::now(),
            },
        }
    }

    fn monitor() -> Arc<HeartbeatMonitor> {
        HeartbeatMonitor::new(
            "node-1",
            Duration::from_secs(5),
            Arc::new(crate::repo::memory::LoggingProtocolSender),
            HeartbeatBean {
                root_group_id: "root".to_string(),
                primary: false,
                connected: false,
            },
        )
    }

    #[test]
    fn test_single_slot_overwrite() {
        let monitor = monitor();
        monitor.store(message("first"));
        monitor.store(message("second"));
        monitor.store(message("third"));
        let taken = monitor.take().expect("message stored");
        assert_eq!(taken.node_id, "third");
        assert!(monitor.take().is_none());
    }

    #[test]
    fn test_bean_swap() {
        let monitor = monitor();
        assert!(!monitor.bean().primary);
        monitor.set_bean(HeartbeatBean {
            root_group_id: "root".to_string(),
            primary: true,
            connected: true,
        });
        let bean = monitor.bean();
        assert!(bean.primary);
        assert!(bean.connected);
    }

    #[test]
    fn test_escape_xml_illegal() {
        let input = "ok\u{09}\u{0A}\u{0D} but \u{01}\u{1F} not";
        let escaped = escape_xml_illegal(input);
        assert_eq!(escaped, "ok\u{09}\u{0A}\u{0D} but ?? not");
    }

    #[test]
    fn test_suspend_resume() {
        let monitor = monitor();
        assert!(!monitor.is_suspended());
        monitor.suspend();
        assert!(monitor.is_suspended());
        monitor.resume();
        assert!(!monitor.is_suspended());
    }
}
