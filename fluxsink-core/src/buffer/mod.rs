//! Per-stream record buffers
//!
//! Each stream owns an ordered queue of serialized records plus its byte
//! accounting. Dequeue is two-phase: `reserve_batch` moves a prefix of the
//! queue into a [`Reservation`], and the caller either commits it after a
//! durable flush (releasing memory and advancing checkpoint progress) or
//! aborts it after a failed one.

use crate::memory::MemoryManager;
use crate::state::CheckpointTracker;
use crate::{Result, SinkError, StreamDescriptor};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// A record held in memory in its serialized form
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedRecord {
    /// Destination stream
    pub stream: StreamDescriptor,
    /// Serialized (transformed) payload
    pub data: Bytes,
    /// Record metadata after transformation
    pub meta: Option<Value>,
    /// Extraction time in milliseconds since epoch
    pub emitted_at: i64,
}

impl BufferedRecord {
    /// Bytes charged against the memory budget
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Ordered queue for one stream
pub struct StreamBuffer {
    records: VecDeque<BufferedRecord>,
    queued_bytes: u64,
    in_flight_bytes: u64,
    last_flush: Instant,
}

impl StreamBuffer {
    fn new() -> Self {
        Self {
            records: VecDeque::new(),
            queued_bytes: 0,
            in_flight_bytes: 0,
            last_flush: Instant::now(),
        }
    }

    /// Records waiting to be flushed
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Bytes waiting to be flushed
    pub fn queued_bytes(&self) -> u64 {
        self.queued_bytes
    }

    /// Time since the last committed flush (or creation)
    pub fn idle_for(&self) -> Duration {
        self.last_flush.elapsed()
    }
}

/// Point-in-time view of a non-empty buffer
#[derive(Debug, Clone)]
pub struct BufferSnapshot {
    pub stream: StreamDescriptor,
    pub queued_bytes: u64,
    pub idle_for: Duration,
}

/// Records removed from a buffer but not yet confirmed durable
#[derive(Debug)]
pub struct Reservation {
    stream: StreamDescriptor,
    records: Vec<BufferedRecord>,
    bytes: u64,
}

impl Reservation {
    /// Stream the batch belongs to
    pub fn stream(&self) -> &StreamDescriptor {
        &self.stream
    }

    /// Records in enqueue order
    pub fn records(&self) -> &[BufferedRecord] {
        &self.records
    }

    /// Total accounted bytes
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// All stream buffers plus their shared memory and checkpoint accounting
pub struct BufferStore {
    memory: Arc<MemoryManager>,
    tracker: Arc<CheckpointTracker>,
    buffers: RwLock<HashMap<StreamDescriptor, Arc<Mutex<StreamBuffer>>>>,
}

impl BufferStore {
    /// Create an empty store
    pub fn new(memory: Arc<MemoryManager>, tracker: Arc<CheckpointTracker>) -> Self {
        Self {
            memory,
            tracker,
            buffers: RwLock::new(HashMap::new()),
        }
    }

    /// Append a record to its stream's buffer.
    ///
    /// Requests memory first and blocks while the budget is exhausted;
    /// `on_wait` runs each time the request starts waiting, after the
    /// requester counts as a waiter, so flush workers can relieve the
    /// pressure. Fails only when the pipeline is cancelled.
    pub fn enqueue(&self, record: BufferedRecord, on_wait: impl FnMut()) -> Result<()> {
        let stream = record.stream.clone();
        let size = record.size();

        if !self.memory.request_allocation_with(&stream, size, on_wait) {
            return Err(SinkError::Cancelled(format!(
                "enqueue for {} refused after cancellation",
                stream
            )));
        }

        let buffer = self.buffer_for(&stream);
        let mut buffer = buffer.lock();
        // Counted before the record becomes visible to a reserving worker.
        self.tracker.record_enqueued(&stream, 1);
        buffer.records.push_back(record);
        buffer.queued_bytes += size;

        Ok(())
    }

    /// Move a prefix of at most `max_bytes` out of the stream's buffer.
    ///
    /// At least one record is taken when the buffer is non-empty, even if it
    /// alone exceeds `max_bytes`. Returns `None` for an empty buffer.
    pub fn reserve_batch(&self, stream: &StreamDescriptor, max_bytes: u64) -> Option<Reservation> {
        let buffer = self.buffers.read().get(stream).cloned()?;
        let mut buffer = buffer.lock();

        let mut records = Vec::new();
        let mut bytes = 0u64;
        while let Some(next) = buffer.records.front() {
            let size = next.size();
            if !records.is_empty() && bytes + size > max_bytes {
                break;
            }
            bytes += size;
            if let Some(record) = buffer.records.pop_front() {
                records.push(record);
            }
        }

        if records.is_empty() {
            return None;
        }

        buffer.queued_bytes -= bytes;
        buffer.in_flight_bytes += bytes;

        debug!(stream = %stream, records = records.len(), bytes, "Reserved batch");
        Some(Reservation {
            stream: stream.clone(),
            records,
            bytes,
        })
    }

    /// Confirm a reservation was durably persisted.
    ///
    /// Releases its memory and advances the stream's checkpoint progress,
    /// which may emit checkpoints.
    pub fn commit(&self, reservation: Reservation) -> Result<()> {
        let stream = reservation.stream;
        if let Some(buffer) = self.buffers.read().get(&stream) {
            let mut buffer = buffer.lock();
            buffer.in_flight_bytes -= reservation.bytes;
            buffer.last_flush = Instant::now();
        }
        self.memory.release(&stream, reservation.bytes);
        self.tracker
            .record_flushed(&stream, reservation.records.len() as u64)?;
        Ok(())
    }

    /// Drop a reservation whose flush failed, releasing its memory only
    pub fn abort(&self, reservation: Reservation) {
        if let Some(buffer) = self.buffers.read().get(&reservation.stream) {
            buffer.lock().in_flight_bytes -= reservation.bytes;
        }
        self.memory.release(&reservation.stream, reservation.bytes);
    }

    /// Bytes queued for a stream
    pub fn peek_size(&self, stream: &StreamDescriptor) -> u64 {
        self.buffers
            .read()
            .get(stream)
            .map(|b| b.lock().queued_bytes)
            .unwrap_or(0)
    }

    /// Bytes queued across all streams
    pub fn total_buffered_bytes(&self) -> u64 {
        self.buffers
            .read()
            .values()
            .map(|b| b.lock().queued_bytes)
            .sum()
    }

    /// Bytes reserved by in-flight flushes across all streams
    pub fn in_flight_bytes(&self) -> u64 {
        self.buffers
            .read()
            .values()
            .map(|b| b.lock().in_flight_bytes)
            .sum()
    }

    /// Snapshots of every non-empty buffer
    pub fn snapshots(&self) -> Vec<BufferSnapshot> {
        self.buffers
            .read()
            .iter()
            .filter_map(|(stream, buffer)| {
                let buffer = buffer.lock();
                (!buffer.is_empty()).then(|| BufferSnapshot {
                    stream: stream.clone(),
                    queued_bytes: buffer.queued_bytes,
                    idle_for: buffer.idle_for(),
                })
            })
            .collect()
    }

    fn buffer_for(&self, stream: &StreamDescriptor) -> Arc<Mutex<StreamBuffer>> {
        if let Some(buffer) = self.buffers.read().get(stream) {
            return buffer.clone();
        }
        self.buffers
            .write()
            .entry(stream.clone())
            .or_insert_with(|| Arc::new(Mutex::new(StreamBuffer::new())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Checkpoint;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    fn record(stream: &StreamDescriptor, size: usize) -> BufferedRecord {
        BufferedRecord {
            stream: stream.clone(),
            data: Bytes::from(vec![b'x'; size]),
            meta: None,
            emitted_at: 0,
        }
    }

    fn store(limit: u64) -> (BufferStore, Arc<MemoryManager>, Arc<CheckpointTracker>) {
        let memory = Arc::new(MemoryManager::new(limit));
        let sink = Arc::new(|_: &Checkpoint| -> Result<()> { Ok(()) });
        let tracker = Arc::new(CheckpointTracker::new(sink));
        (
            BufferStore::new(memory.clone(), tracker.clone()),
            memory,
            tracker,
        )
    }

    #[test]
    fn test_enqueue_accounts_bytes() {
        let (store, memory, _) = store(1000);
        let users = StreamDescriptor::new("users");

        store.enqueue(record(&users, 100), || {}).unwrap();
        store.enqueue(record(&users, 50), || {}).unwrap();

        assert_eq!(store.peek_size(&users), 150);
        assert_eq!(store.total_buffered_bytes(), 150);
        assert_eq!(memory.used(), 150);
        assert_eq!(store.snapshots().len(), 1);
    }

    #[test]
    fn test_reserve_respects_max_bytes() {
        let (store, _, _) = store(1000);
        let users = StreamDescriptor::new("users");
        for _ in 0..5 {
            store.enqueue(record(&users, 100), || {}).unwrap();
        }

        let batch = store.reserve_batch(&users, 250).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.bytes(), 200);
        assert_eq!(store.peek_size(&users), 300);
        assert_eq!(store.in_flight_bytes(), 200);
    }

    #[test]
    fn test_reserve_takes_oversized_head() {
        let (store, _, _) = store(1000);
        let users = StreamDescriptor::new("users");
        store.enqueue(record(&users, 500), || {}).unwrap();

        let batch = store.reserve_batch(&users, 10).unwrap();
        assert_eq!(batch.len(), 1);
        assert!(store.reserve_batch(&users, 10).is_none());
    }

    #[test]
    fn test_commit_releases_memory_and_advances_progress() {
        let (store, memory, tracker) = store(1000);
        let users = StreamDescriptor::new("users");
        store.enqueue(record(&users, 100), || {}).unwrap();
        store.enqueue(record(&users, 100), || {}).unwrap();

        let batch = store.reserve_batch(&users, 1000).unwrap();
        assert_eq!(memory.used(), 200);
        store.commit(batch).unwrap();

        assert_eq!(memory.used(), 0);
        assert_eq!(store.in_flight_bytes(), 0);
        assert_eq!(tracker.flushed_records(&users), 2);
        assert!(store.snapshots().is_empty());
    }

    #[test]
    fn test_abort_releases_memory_without_progress() {
        let (store, memory, tracker) = store(1000);
        let users = StreamDescriptor::new("users");
        store.enqueue(record(&users, 100), || {}).unwrap();

        let batch = store.reserve_batch(&users, 1000).unwrap();
        store.abort(batch);

        assert_eq!(memory.used(), 0);
        assert_eq!(store.in_flight_bytes(), 0);
        assert_eq!(store.peek_size(&users), 0);
        assert_eq!(tracker.flushed_records(&users), 0);
    }

    #[test]
    fn test_on_wait_runs_once_blocked() {
        let (store, memory, _) = store(100);
        let store = Arc::new(store);
        let users = StreamDescriptor::new("users");
        store.enqueue(record(&users, 100), || {}).unwrap();

        let (waiting_tx, waiting_rx) = crossbeam_channel::unbounded();
        let blocked = {
            let store = store.clone();
            let users = users.clone();
            thread::spawn(move || {
                store.enqueue(record(&users, 10), || {
                    let _ = waiting_tx.send(());
                })
            })
        };

        waiting_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(memory.is_under_pressure(1.0));

        let batch = store.reserve_batch(&users, 1000).unwrap();
        store.commit(batch).unwrap();
        blocked.join().unwrap().unwrap();
        assert_eq!(store.peek_size(&users), 10);
        assert_eq!(memory.used(), 10);
    }

    #[test]
    fn test_enqueue_refused_after_cancel() {
        let (store, memory, _) = store(100);
        let users = StreamDescriptor::new("users");
        store.enqueue(record(&users, 100), || {}).unwrap();

        let waits = AtomicUsize::new(0);
        memory.cancel();
        let result = store.enqueue(record(&users, 10), || {
            waits.fetch_add(1, Ordering::SeqCst);
        });

        assert!(matches!(result, Err(SinkError::Cancelled(_))));
        assert_eq!(waits.load(Ordering::SeqCst), 0);
        assert_eq!(store.peek_size(&users), 100);
    }

    #[test]
    fn test_flushed_never_outruns_enqueued() {
        let (store, _, tracker) = store(1_000_000);
        let store = Arc::new(store);
        let users = StreamDescriptor::new("users");
        let done = Arc::new(AtomicBool::new(false));

        let flusher = {
            let store = store.clone();
            let tracker = tracker.clone();
            let users = users.clone();
            let done = done.clone();
            thread::spawn(move || loop {
                let finished = done.load(Ordering::SeqCst);
                match store.reserve_batch(&users, 1) {
                    Some(batch) => {
                        store.commit(batch).unwrap();
                        let flushed = tracker.flushed_records(&users);
                        assert!(flushed <= tracker.enqueued_records(&users));
                    }
                    None if finished => break,
                    None => thread::yield_now(),
                }
            })
        };

        for _ in 0..2000 {
            store.enqueue(record(&users, 1), || {}).unwrap();
        }
        done.store(true, Ordering::SeqCst);
        flusher.join().unwrap();

        assert_eq!(tracker.flushed_records(&users), 2000);
        assert_eq!(tracker.enqueued_records(&users), 2000);
    }
}
