//! Per-connection flow-file queue.
//!
//! Each connection owns exactly one queue. The queue keeps records in
//! prioritiser order (insertion order when no prioritisers are set, ties
//! broken by insertion sequence), enforces back-pressure thresholds on
//! object count and byte count, and drops expired records at poll time.
//!
//! The queue never blocks producers: back-pressure is cooperative. Upstream
//! scheduling agents consult [`FlowFileQueue::is_full`] before issuing a
//! trigger and yield instead of enqueueing into a full queue.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::model::flowfile::FlowFileRecord;
use crate::plugin::FlowFilePrioritizer;

/// Snapshot of a queue's occupancy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueSize {
    pub object_count: usize,
    pub byte_count: u64,
}

impl QueueSize {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.object_count == 0
    }
}

/// Callback invoked when the queue transitions from empty to non-empty.
/// Wired by the connection so event-driven destinations become ready.
pub type ReadinessCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone)]
struct QueuedRecord {
    record: Arc<FlowFileRecord>,
    seq: u64,
}

#[derive(Default)]
struct Backlog {
    entries: VecDeque<QueuedRecord>,
    byte_count: u64,
    next_seq: u64,
}

/// Ordered queue with cooperative back-pressure.
pub struct FlowFileQueue {
    backlog: Mutex<Backlog>,
    prioritizers: RwLock<Vec<Arc<dyn FlowFilePrioritizer>>>,
    /// 0 means unlimited on that axis.
    object_threshold: AtomicUsize,
    byte_threshold: AtomicU64,
    /// Nanoseconds; 0 means records never expire.
    expiration_nanos: AtomicU64,
    on_ready: RwLock<Option<ReadinessCallback>>,
}

impl Default for FlowFileQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowFileQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            backlog: Mutex::new(Backlog::default()),
            prioritizers: RwLock::new(Vec::new()),
            object_threshold: AtomicUsize::new(0),
            byte_threshold: AtomicU64::new(0),
            expiration_nanos: AtomicU64::new(0),
            on_ready: RwLock::new(None),
        }
    }

    /// Install the empty→non-empty readiness callback. At most one.
    pub fn set_readiness_callback(&self, callback: ReadinessCallback) {
        *self.on_ready.write() = Some(callback);
    }

    pub fn set_back_pressure_object_threshold(&self, threshold: usize) {
        self.object_threshold.store(threshold, Ordering::SeqCst);
    }

    pub fn set_back_pressure_byte_threshold(&self, threshold: u64) {
        self.byte_threshold.store(threshold, Ordering::SeqCst);
    }

    #[must_use]
    pub fn back_pressure_object_threshold(&self) -> usize {
        self.object_threshold.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn back_pressure_byte_threshold(&self) -> u64 {
        self.byte_threshold.load(Ordering::SeqCst)
    }

    /// Maximum age before a record is dropped at poll time. Zero disables.
    pub fn set_flowfile_expiration(&self, max_age: Duration) {
        self.expiration_nanos
            .store(max_age.as_nanos().min(u64::MAX as u128) as u64, Ordering::SeqCst);
    }

    #[must_use]
    pub fn flowfile_expiration(&self) -> Duration {
        Duration::from_nanos(self.expiration_nanos.load(Ordering::SeqCst))
    }

    /// Replace the prioritiser chain and re-sort the held backlog.
    pub fn set_prioritizers(&self, prioritizers: Vec<Arc<dyn FlowFilePrioritizer>>) {
        let mut guard = self.prioritizers.write();
        *guard = prioritizers;
        let mut backlog = self.backlog.lock();
        let chain = guard.clone();
        let mut entries: Vec<QueuedRecord> = backlog.entries.drain(..).collect();
        entries.sort_by(|a, b| Self::compare(&chain, a, b));
        backlog.entries = entries.into();
    }

    #[must_use]
    pub fn prioritizers(&self) -> Vec<Arc<dyn FlowFilePrioritizer>> {
        self.prioritizers.read().clone()
    }

    /// Current occupancy. Both axes are guaranteed non-negative by type.
    #[must_use]
    pub fn size(&self) -> QueueSize {
        let backlog = self.backlog.lock();
        QueueSize {
            object_count: backlog.entries.len(),
            byte_count: backlog.byte_count,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backlog.lock().entries.is_empty()
    }

    /// Whether either back-pressure axis has reached its threshold.
    #[must_use]
    pub fn is_full(&self) -> bool {
        let object_threshold = self.object_threshold.load(Ordering::SeqCst);
        let byte_threshold = self.byte_threshold.load(Ordering::SeqCst);
        if object_threshold == 0 && byte_threshold == 0 {
            return false;
        }
        let backlog = self.backlog.lock();
        (object_threshold > 0 && backlog.entries.len() >= object_threshold)
            || (byte_threshold > 0 && backlog.byte_count >= byte_threshold)
    }

    /// Enqueue one record.
    pub fn put(&self, record: Arc<FlowFileRecord>) {
        self.put_all(std::iter::once(record));
    }

    /// Enqueue a batch. Fires the readiness callback once if the queue was
    /// empty before the batch landed.
    pub fn put_all(&self, records: impl IntoIterator<Item = Arc<FlowFileRecord>>) {
        let chain = self.prioritizers.read().clone();
        let was_empty;
        {
            let mut backlog = self.backlog.lock();
            was_empty = backlog.entries.is_empty();
            for record in records {
                let seq = backlog.next_seq;
                backlog.next_seq += 1;
                backlog.byte_count += record.size();
                let entry = QueuedRecord { record, seq };
                if chain.is_empty() {
                    backlog.entries.push_back(entry);
                } else {
                    let at = backlog
                        .entries
                        .partition_point(|existing| {
                            Self::compare(&chain, existing, &entry) != std::cmp::Ordering::Greater
                        });
                    backlog.entries.insert(at, entry);
                }
            }
        }
        if was_empty {
            if let Some(callback) = self.on_ready.read().clone() {
                callback();
            }
        }
    }

    /// Dequeue the highest-priority live record. Expired records encountered
    /// on the way are appended to `expired_out` and never returned.
    pub fn poll(&self, expired_out: &mut Vec<Arc<FlowFileRecord>>) -> Option<Arc<FlowFileRecord>> {
        let max_age = self.flowfile_expiration();
        let now = Utc::now();
        let mut backlog = self.backlog.lock();
        while let Some(entry) = backlog.entries.pop_front() {
            backlog.byte_count -= entry.record.size();
            if Self::is_expired(&entry.record, max_age, now) {
                expired_out.push(entry.record);
                continue;
            }
            return Some(entry.record);
        }
        None
    }

    /// Dequeue up to `max` live records.
    pub fn poll_batch(
        &self,
        max: usize,
        expired_out: &mut Vec<Arc<FlowFileRecord>>,
    ) -> Vec<Arc<FlowFileRecord>> {
        let mut polled = Vec::new();
        while polled.len() < max {
            match self.poll(expired_out) {
                Some(record) => polled.push(record),
                None => break,
            }
        }
        polled
    }

    /// Remove every expired record. Used by the periodic expiration sweep.
    pub fn drain_expired(&self) -> Vec<Arc<FlowFileRecord>> {
        let max_age = self.flowfile_expiration();
        if max_age.is_zero() {
            return Vec::new();
        }
        let now = Utc::now();
        let mut backlog = self.backlog.lock();
        let mut expired = Vec::new();
        let mut kept = VecDeque::with_capacity(backlog.entries.len());
        while let Some(entry) = backlog.entries.pop_front() {
            if Self::is_expired(&entry.record, max_age, now) {
                backlog.byte_count -= entry.record.size();
                expired.push(entry.record);
            } else {
                kept.push_back(entry);
            }
        }
        backlog.entries = kept;
        expired
    }

    fn is_expired(
        record: &FlowFileRecord,
        max_age: Duration,
        now: chrono::DateTime<Utc>,
    ) -> bool {
        if max_age.is_zero() {
            return false;
        }
        match chrono::Duration::from_std(max_age) {
            Ok(limit) => record.age_at(now) > limit,
            Err(_) => false,
        }
    }

    fn compare(
        chain: &[Arc<dyn FlowFilePrioritizer>],
        a: &QueuedRecord,
        b: &QueuedRecord,
    ) -> std::cmp::Ordering {
        for prioritizer in chain {
            let ordering = prioritizer.compare(&a.record, &b.record);
            if ordering != std::cmp::Ordering::Equal {
                return ordering;
            }
        }
        a.seq.cmp(&b.seq)
    }
}

impl std::fmt::Debug for FlowFileQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let size = self.size();
        f.debug_struct("FlowFileQueue")
            .field("object_count", &size.object_count)
            .field("byte_count", &size.byte_count)
            .field("full", &self.is_full())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn record(id: u64, size: u64) -> Arc<FlowFileRecord> {
        FlowFileRecord::builder()
            .id(id)
            .attribute("uuid", format!("uuid-{id}"))
            .size(size)
            .build()
    }

    struct LargestFirst;

    impl FlowFilePrioritizer for LargestFirst {
        fn name(&self) -> &str {
            "largest-first"
        }

        fn compare(&self, a: &FlowFileRecord, b: &FlowFileRecord) -> std::cmp::Ordering {
            b.size().cmp(&a.size())
        }
    }

    #[test]
    fn fifo_by_default() {
        let queue = FlowFileQueue::new();
        queue.put(record(1, 10));
        queue.put(record(2, 20));

        let mut expired = Vec::new();
        assert_eq!(queue.poll(&mut expired).unwrap().id(), 1);
        assert_eq!(queue.poll(&mut expired).unwrap().id(), 2);
        assert!(expired.is_empty());
    }

    #[test]
    fn size_accounting_tracks_bytes() {
        let queue = FlowFileQueue::new();
        queue.put(record(1, 10));
        queue.put(record(2, 30));
        assert_eq!(
            queue.size(),
            QueueSize {
                object_count: 2,
                byte_count: 40
            }
        );

        let mut expired = Vec::new();
        queue.poll(&mut expired);
        assert_eq!(
            queue.size(),
            QueueSize {
                object_count: 1,
                byte_count: 30
            }
        );
    }

    #[test]
    fn back_pressure_on_either_axis() {
        let queue = FlowFileQueue::new();
        queue.set_back_pressure_object_threshold(2);
        queue.put(record(1, 1));
        assert!(!queue.is_full());
        queue.put(record(2, 1));
        assert!(queue.is_full());

        let byte_queue = FlowFileQueue::new();
        byte_queue.set_back_pressure_byte_threshold(100);
        byte_queue.put(record(1, 100));
        assert!(byte_queue.is_full());
    }

    #[test]
    fn zero_thresholds_mean_unlimited() {
        let queue = FlowFileQueue::new();
        for id in 0..1000 {
            queue.put(record(id, 1024));
        }
        assert!(!queue.is_full());
    }

    #[test]
    fn prioritizer_orders_and_insertion_breaks_ties() {
        let queue = FlowFileQueue::new();
        queue.set_prioritizers(vec![Arc::new(LargestFirst)]);
        queue.put(record(1, 10));
        queue.put(record(2, 50));
        queue.put(record(3, 50));

        let mut expired = Vec::new();
        assert_eq!(queue.poll(&mut expired).unwrap().id(), 2);
        assert_eq!(queue.poll(&mut expired).unwrap().id(), 3);
        assert_eq!(queue.poll(&mut expired).unwrap().id(), 1);
    }

    #[test]
    fn set_prioritizers_resorts_backlog() {
        let queue = FlowFileQueue::new();
        queue.put(record(1, 10));
        queue.put(record(2, 50));
        queue.set_prioritizers(vec![Arc::new(LargestFirst)]);

        let mut expired = Vec::new();
        assert_eq!(queue.poll(&mut expired).unwrap().id(), 2);
    }

    #[test]
    fn readiness_fires_only_on_empty_transition() {
        let queue = FlowFileQueue::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        queue.set_readiness_callback(Arc::new(move || {
            flag.store(true, Ordering::SeqCst);
        }));

        queue.put(record(1, 1));
        assert!(fired.load(Ordering::SeqCst));

        fired.store(false, Ordering::SeqCst);
        queue.put(record(2, 1));
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn expired_records_are_diverted() {
        let queue = FlowFileQueue::new();
        let old = FlowFileRecord::builder()
            .id(1)
            .entry_date(Utc::now() - chrono::Duration::seconds(60))
            .build();
        queue.put(old);
        queue.set_flowfile_expiration(Duration::from_millis(1));

        let mut expired = Vec::new();
        assert!(queue.poll(&mut expired).is_none());
        assert_eq!(expired.len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_expired_keeps_live_records() {
        let queue = FlowFileQueue::new();
        let old = FlowFileRecord::builder()
            .id(1)
            .entry_date(Utc::now() - chrono::Duration::seconds(60))
            .size(5)
            .build();
        queue.put(old);
        queue.put(record(2, 7));
        queue.set_flowfile_expiration(Duration::from_secs(30));

        let expired = queue.drain_expired();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id(), 1);
        assert_eq!(
            queue.size(),
            QueueSize {
                object_count: 1,
                byte_count: 7
            }
        );
    }
}
