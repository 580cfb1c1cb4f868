//! Event-driven work queue
//!
//! A bounded, deduplicated, approximately-FIFO queue of components that have
//! work available. A component is offered when one of its inbound queues
//! transitions from empty to non-empty; event-pool workers poll entries off
//! the queue. On non-primary cluster nodes, primary-only entries are
//! dropped at poll time.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// One ready component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyEntry {
    /// Component id
    pub component_id: String,
    /// Whether the component's strategy is primary-node-only
    pub primary_only: bool,
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<ReadyEntry>,
    queued: HashSet<String>,
}

/// Fair queue of components ready for event-driven execution.
#[derive(Default)]
pub struct EventDrivenWorkerQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    primary: AtomicBool,
    clustered: AtomicBool,
}

impl EventDrivenWorkerQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a component has work available. Idempotent: a component
    /// already queued is not queued twice.
    pub fn offer(&self, component_id: &str, primary_only: bool) {
        {
            let mut state = self.state.lock();
            if !state.queued.insert(component_id.to_string()) {
                return;
            }
            state.entries.push_back(ReadyEntry {
                component_id: component_id.to_string(),
                primary_only,
            });
        }
        self.notify.notify_one();
    }

    /// Take the next ready component, waiting up to `wait` for one to
    /// arrive. Primary-only entries are discarded while this node is a
    /// clustered non-primary.
    pub async fn poll(&self, wait: Duration) -> Option<ReadyEntry> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(entry) = self.take_eligible() {
                return Some(entry);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return self.take_eligible();
            }
        }
    }

    fn take_eligible(&self) -> Option<ReadyEntry> {
        let drop_primary_only =
            self.clustered.load(Ordering::SeqCst) && !self.primary.load(Ordering::SeqCst);
        let mut state = self.state.lock();
        while let Some(entry) = state.entries.pop_front() {
            state.queued.remove(&entry.component_id);
            if entry.primary_only && drop_primary_only {
                continue;
            }
            return Some(entry);
        }
        None
    }

    /// Remove a component from the queue, used when it is stopped.
    pub fn remove(&self, component_id: &str) {
        let mut state = self.state.lock();
        if state.queued.remove(component_id) {
            state.entries.retain(|e| e.component_id != component_id);
        }
    }

    /// Number of queued components.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether no component is queued.
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Inform the queue of the node's primary flag.
    pub fn set_primary(&self, primary: bool) {
        self.primary.store(primary, Ordering::SeqCst);
        if primary {
            self.notify.notify_waiters();
        }
    }

    /// Inform the queue whether the node is clustered.
    pub fn set_clustered(&self, clustered: bool) {
        self.clustered.store(clustered, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offer_is_idempotent() {
        let queue = EventDrivenWorkerQueue::new();
        queue.offer("p1", false);
        queue.offer("p1", false);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_poll_is_fifo() {
        let queue = EventDrivenWorkerQueue::new();
        queue.offer("p1", false);
        queue.offer("p2", false);
        let first = queue.poll(Duration::from_millis(10)).await.expect("entry");
        assert_eq!(first.component_id, "p1");
        let second = queue.poll(Duration::from_millis(10)).await.expect("entry");
        assert_eq!(second.component_id, "p2");
    }

    #[tokio::test]
    async fn test_poll_times_out_empty() {
        let queue = EventDrivenWorkerQueue::new();
        assert!(queue.poll(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn test_primary_only_dropped_on_non_primary() {
        let queue = EventDrivenWorkerQueue::new();
        queue.set_clustered(true);
        queue.set_primary(false);
        queue.offer("primary-task", true);
        queue.offer("ordinary", false);
        let entry = queue.poll(Duration::from_millis(10)).await.expect("entry");
        assert_eq!(entry.component_id, "ordinary");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_remove_discards_entry() {
        let queue = EventDrivenWorkerQueue::new();
        queue.offer("p1", false);
        queue.remove("p1");
        assert!(queue.poll(Duration::from_millis(5)).await.is_none());
    }
}
