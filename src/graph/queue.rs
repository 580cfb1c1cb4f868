//! Per-connection flow-file queue
//!
//! Ordered queue with object/byte back-pressure thresholds, flow-file
//! expiration, and a pluggable prioritiser chain. Reaching either threshold
//! signals "full"; upstream triggers observe back-pressure and yield rather
//! than block. The queue itself keeps accepting offers so that in-flight
//! work can always land.

use crate::flowfile::FlowFileRecord;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Object and byte footprint of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSize {
    /// Number of queued flow files
    pub object_count: usize,
    /// Total content bytes queued
    pub byte_count: u64,
}

/// Total-order plug-in over queued flow files. Ties are broken by insertion
/// order.
pub trait FlowFilePrioritizer: Send + Sync {
    /// Registry type name of this prioritiser.
    fn type_name(&self) -> &str;
    /// Compare two records; `Less` dequeues first.
    fn compare(&self, a: &FlowFileRecord, b: &FlowFileRecord) -> CmpOrdering;
}

/// Callback invoked when a queue transitions from empty to non-empty.
pub trait QueueActivityListener: Send + Sync {
    /// The destination of `queue_id`'s connection has work available.
    fn queue_activated(&self, destination_id: &str);
}

/// Outcome of one poll: at most one live record, plus any records that aged
/// past the expiration period while being skipped over.
#[derive(Debug, Default)]
pub struct Polled {
    /// The next record in prioritiser order, if any
    pub record: Option<FlowFileRecord>,
    /// Records dropped because they expired
    pub expired: Vec<FlowFileRecord>,
}

struct QueuedRecord {
    seq: u64,
    record: FlowFileRecord,
}

struct QueueInner {
    records: VecDeque<QueuedRecord>,
    byte_count: u64,
    next_seq: u64,
}

/// The ordered queue owned by a connection.
pub struct FlowFileQueue {
    id: String,
    destination_id: String,
    inner: Mutex<QueueInner>,
    object_count: AtomicUsize,
    object_threshold: AtomicUsize,
    byte_threshold: AtomicU64,
    expiration_ms: AtomicU64,
    prioritizers: RwLock<Vec<Arc<dyn FlowFilePrioritizer>>>,
    listener: RwLock<Option<Arc<dyn QueueActivityListener>>>,
}

impl FlowFileQueue {
    /// Default back-pressure object threshold.
    pub const DEFAULT_OBJECT_THRESHOLD: usize = 10_000;
    /// Default back-pressure byte threshold (1 GB).
    pub const DEFAULT_BYTE_THRESHOLD: u64 = 1024 * 1024 * 1024;

    /// Create a queue feeding `destination_id`.
    pub fn new(id: impl Into<String>, destination_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            destination_id: destination_id.into(),
            inner: Mutex::new(QueueInner {
                records: VecDeque::new(),
                byte_count: 0,
                next_seq: 0,
            }),
            object_count: AtomicUsize::new(0),
            object_threshold: AtomicUsize::new(Self::DEFAULT_OBJECT_THRESHOLD),
            byte_threshold: AtomicU64::new(Self::DEFAULT_BYTE_THRESHOLD),
            expiration_ms: AtomicU64::new(0),
            prioritizers: RwLock::new(Vec::new()),
            listener: RwLock::new(None),
        }
    }

    /// Queue identifier (the owning connection's id).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Identifier of the component this queue feeds.
    pub fn destination_id(&self) -> &str {
        &self.destination_id
    }

    /// Install the empty-to-non-empty activation callback.
    pub fn set_activity_listener(&self, listener: Arc<dyn QueueActivityListener>) {
        *self.listener.write() = Some(listener);
    }

    /// Replace the back-pressure thresholds. Zero disables a threshold.
    pub fn set_thresholds(&self, object_threshold: usize, byte_threshold: u64) {
        self.object_threshold.store(object_threshold, Ordering::SeqCst);
        self.byte_threshold.store(byte_threshold, Ordering::SeqCst);
    }

    /// Current back-pressure object threshold.
    pub fn object_threshold(&self) -> usize {
        self.object_threshold.load(Ordering::SeqCst)
    }

    /// Current back-pressure byte threshold.
    pub fn byte_threshold(&self) -> u64 {
        self.byte_threshold.load(Ordering::SeqCst)
    }

    /// Replace the flow-file expiration period; `None` disables expiration.
    pub fn set_expiration(&self, period: Option<std::time::Duration>) {
        let millis = period.map(|p| p.as_millis() as u64).unwrap_or(0);
        self.expiration_ms.store(millis, Ordering::SeqCst);
    }

    /// Replace the prioritiser chain.
    pub fn set_prioritizers(&self, prioritizers: Vec<Arc<dyn FlowFilePrioritizer>>) {
        *self.prioritizers.write() = prioritizers;
    }

    /// Current footprint.
    pub fn size(&self) -> QueueSize {
        let inner = self.inner.lock();
        QueueSize {
            object_count: inner.records.len(),
            byte_count: inner.byte_count,
        }
    }

    /// Whether the queue holds no records.
    pub fn is_empty(&self) -> bool {
        self.object_count.load(Ordering::SeqCst) == 0
    }

    /// Whether either back-pressure threshold has been reached.
    pub fn is_full(&self) -> bool {
        let object_threshold = self.object_threshold.load(Ordering::SeqCst);
        let byte_threshold = self.byte_threshold.load(Ordering::SeqCst);
        let inner = self.inner.lock();
        (object_threshold > 0 && inner.records.len() >= object_threshold)
            || (byte_threshold > 0 && inner.byte_count >= byte_threshold)
    }

    /// Append a record. Notifies the activity listener on the empty →
    /// non-empty transition.
    pub fn offer(&self, record: FlowFileRecord) {
        let was_empty;
        {
            let mut inner = self.inner.lock();
            was_empty = inner.records.is_empty();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.byte_count += record.content_size();
            inner.records.push_back(QueuedRecord { seq, record });
            self.object_count.store(inner.records.len(), Ordering::SeqCst);
        }
        if was_empty {
            let listener = self.listener.read().clone();
            if let Some(listener) = listener {
                listener.queue_activated(&self.destination_id);
            }
        }
    }

    /// Take the next record in prioritiser order, dropping expired records
    /// encountered along the way.
    pub fn poll(&self) -> Polled {
        let expiration_ms = self.expiration_ms.load(Ordering::SeqCst);
        let prioritizers = self.prioritizers.read().clone();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut polled = Polled::default();
        let now = Utc::now();

        if expiration_ms > 0 {
            let mut live = VecDeque::with_capacity(inner.records.len());
            for queued in inner.records.drain(..) {
                if queued.record.age(now).num_milliseconds() >= expiration_ms as i64 {
                    inner.byte_count -= queued.record.content_size();
                    polled.expired.push(queued.record);
                } else {
                    live.push_back(queued);
                }
            }
            inner.records = live;
        }

        let index = if prioritizers.is_empty() {
            if inner.records.is_empty() {
                None
            } else {
                Some(0)
            }
        } else {
            let mut best: Option<usize> = None;
            for i in 0..inner.records.len() {
                match best {
                    None => best = Some(i),
                    Some(b) => {
                        let ord = compare_chain(
                            &prioritizers,
                            &inner.records[i],
                            &inner.records[b],
                        );
                        if ord == CmpOrdering::Less {
                            best = Some(i);
                        }
                    }
                }
            }
            best
        };

        if let Some(index) = index {
            if let Some(queued) = inner.records.remove(index) {
                inner.byte_count -= queued.record.content_size();
                polled.record = Some(queued.record);
            }
        }
        self.object_count.store(inner.records.len(), Ordering::SeqCst);
        polled
    }

    /// Remove and return every record that aged past the expiration period.
    pub fn sweep_expired(&self) -> Vec<FlowFileRecord> {
        let expiration_ms = self.expiration_ms.load(Ordering::SeqCst);
        if expiration_ms == 0 {
            return Vec::new();
        }
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let now = Utc::now();
        let mut expired = Vec::new();
        let mut live = VecDeque::with_capacity(inner.records.len());
        for queued in inner.records.drain(..) {
            if queued.record.age(now).num_milliseconds() >= expiration_ms as i64 {
                inner.byte_count -= queued.record.content_size();
                expired.push(queued.record);
            } else {
                live.push_back(queued);
            }
        }
        inner.records = live;
        self.object_count.store(inner.records.len(), Ordering::SeqCst);
        expired
    }

    /// Remove and return every queued record.
    pub fn drain(&self) -> Vec<FlowFileRecord> {
        let mut inner = self.inner.lock();
        inner.byte_count = 0;
        let drained = inner.records.drain(..).map(|q| q.record).collect();
        self.object_count.store(0, Ordering::SeqCst);
        drained
    }
}

fn compare_chain(
    prioritizers: &[Arc<dyn FlowFilePrioritizer>],
    a: &QueuedRecord,
    b: &QueuedRecord,
) -> CmpOrdering {
    for prioritizer in prioritizers {
        match prioritizer.compare(&a.record, &b.record) {
            CmpOrdering::Equal => continue,
            other => return other,
        }
    }
    a.seq.cmp(&b.seq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowfile::FlowFileBuilder;

    fn record(id: u64) -> FlowFileRecord {
        FlowFileBuilder::new(id).build()
    }

    #[test]
    fn test_fifo_without_prioritizers() {
        let queue = FlowFileQueue::new("q1", "dest");
        queue.offer(record(1));
        queue.offer(record(2));
        assert_eq!(queue.poll().record.expect("record").id, 1);
        assert_eq!(queue.poll().record.expect("record").id, 2);
        assert!(queue.poll().record.is_none());
    }

    #[test]
    fn test_thresholds_signal_full() {
        let queue = FlowFileQueue::new("q1", "dest");
        queue.set_thresholds(2, 0);
        queue.offer(record(1));
        assert!(!queue.is_full());
        queue.offer(record(2));
        assert!(queue.is_full());
        // The queue still accepts offers while full.
        queue.offer(record(3));
        assert_eq!(queue.size().object_count, 3);
    }

    #[test]
    fn test_prioritizer_total_order_with_insertion_tiebreak() {
        struct ByPriorityAttr;
        impl FlowFilePrioritizer for ByPriorityAttr {
            fn type_name(&self) -> &str {
                "by-priority-attribute"
            }
            fn compare(&self, a: &FlowFileRecord, b: &FlowFileRecord) -> CmpOrdering {
                let pa = a.attributes.get("priority").cloned().unwrap_or_default();
                let pb = b.attributes.get("priority").cloned().unwrap_or_default();
                pa.cmp(&pb)
            }
        }

        let queue = FlowFileQueue::new("q1", "dest");
        queue.set_prioritizers(vec![Arc::new(ByPriorityAttr)]);
        queue.offer(FlowFileBuilder::new(1).attribute("priority", "b").build());
        queue.offer(FlowFileBuilder::new(2).attribute("priority", "a").build());
        queue.offer(FlowFileBuilder::new(3).attribute("priority", "a").build());

        assert_eq!(queue.poll().record.expect("record").id, 2);
        assert_eq!(queue.poll().record.expect("record").id, 3);
        assert_eq!(queue.poll().record.expect("record").id, 1);
    }

    #[test]
    fn test_activation_listener_fires_on_empty_transition() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        #[derive(Default)]
        struct CountingListener {
            activations: AtomicUsize,
        }
        impl QueueActivityListener for CountingListener {
            fn queue_activated(&self, _destination_id: &str) {
                self.activations.fetch_add(1, Ordering::SeqCst);
            }
        }

        let queue = FlowFileQueue::new("q1", "dest");
        let listener = Arc::new(CountingListener::default());
        queue.set_activity_listener(listener.clone());

        queue.offer(record(1));
        queue.offer(record(2));
        assert_eq!(listener.activations.load(Ordering::SeqCst), 1);

        queue.poll();
        queue.poll();
        queue.offer(record(3));
        assert_eq!(listener.activations.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_sweep_expired() {
        let queue = FlowFileQueue::new("q1", "dest");
        queue.set_expiration(Some(std::time::Duration::from_millis(0)));
        queue.offer(record(1));
        let expired = queue.sweep_expired();
        assert_eq!(expired.len(), 1);
        assert!(queue.is_empty());
        assert_eq!(queue.size().byte_count, 0);
    }
}
