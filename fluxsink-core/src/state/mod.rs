//! Checkpoint tracking
//!
//! Every checkpoint gets a global sequence number at ingestion time and a
//! watermark per covered stream: the number of records enqueued for that
//! stream when the checkpoint arrived. A checkpoint is emitted once each
//! covered stream has flushed up to its watermark AND every checkpoint with
//! a lower sequence number has been emitted.

use crate::destination::CheckpointSink;
use crate::{Result, StreamDescriptor, StreamSyncSummary};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Streams a checkpoint vouches for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointScope {
    /// A per-stream state: only that stream's records precede it
    Stream(StreamDescriptor),
    /// A global or legacy state: covers every stream seen so far
    Global,
}

/// Opaque checkpoint marker, round-tripped unchanged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    /// Original serialized message
    pub raw: String,
    /// Streams it depends on
    pub scope: CheckpointScope,
}

impl Checkpoint {
    /// Create a checkpoint marker
    pub fn new(raw: impl Into<String>, scope: CheckpointScope) -> Self {
        Self {
            raw: raw.into(),
            scope,
        }
    }
}

/// Flush progress of one stream, in records
#[derive(Debug, Clone, Copy, Default)]
struct StreamProgress {
    enqueued: u64,
    flushed: u64,
    failed: bool,
}

#[derive(Debug)]
struct PendingCheckpoint {
    checkpoint: Checkpoint,
    watermarks: Vec<(StreamDescriptor, u64)>,
}

#[derive(Default)]
struct TrackerState {
    next_seq: u64,
    streams: HashMap<StreamDescriptor, StreamProgress>,
    pending: BTreeMap<u64, PendingCheckpoint>,
    emitted: u64,
}

impl TrackerState {
    fn is_satisfied(&self, pending: &PendingCheckpoint) -> bool {
        pending.watermarks.iter().all(|(stream, watermark)| {
            self.streams
                .get(stream)
                .map(|p| !p.failed && p.flushed >= *watermark)
                .unwrap_or(*watermark == 0)
        })
    }
}

/// Decides when checkpoints become safe to forward downstream
pub struct CheckpointTracker {
    inner: Mutex<TrackerState>,
    sink: Arc<dyn CheckpointSink>,
}

impl CheckpointTracker {
    /// Create a tracker emitting into `sink`
    pub fn new(sink: Arc<dyn CheckpointSink>) -> Self {
        Self {
            inner: Mutex::new(TrackerState::default()),
            sink,
        }
    }

    /// Count `records` newly enqueued for `stream`
    pub fn record_enqueued(&self, stream: &StreamDescriptor, records: u64) {
        let mut state = self.inner.lock();
        state.streams.entry(stream.clone()).or_default().enqueued += records;
    }

    /// Register a checkpoint, snapshotting the watermarks it depends on.
    ///
    /// Returns the checkpoint's global sequence number. The checkpoint is
    /// emitted right away when nothing it depends on is still buffered.
    pub fn register(&self, checkpoint: Checkpoint) -> Result<u64> {
        let mut state = self.inner.lock();

        let watermarks = match &checkpoint.scope {
            CheckpointScope::Stream(stream) => {
                let enqueued = state.streams.entry(stream.clone()).or_default().enqueued;
                vec![(stream.clone(), enqueued)]
            }
            CheckpointScope::Global => {
                let mut marks: Vec<_> = state
                    .streams
                    .iter()
                    .map(|(stream, progress)| (stream.clone(), progress.enqueued))
                    .collect();
                marks.sort();
                marks
            }
        };

        let seq = state.next_seq;
        state.next_seq += 1;

        debug!(seq, streams = watermarks.len(), "Registered checkpoint");
        state.pending.insert(
            seq,
            PendingCheckpoint {
                checkpoint,
                watermarks,
            },
        );

        self.emit_ready(&mut state)?;
        Ok(seq)
    }

    /// Advance `stream`'s flushed count and emit whatever became safe
    pub fn record_flushed(&self, stream: &StreamDescriptor, records: u64) -> Result<usize> {
        let mut state = self.inner.lock();
        let progress = state.streams.entry(stream.clone()).or_default();
        progress.flushed += records;

        if progress.flushed > progress.enqueued {
            warn!(
                stream = %stream,
                flushed = progress.flushed,
                enqueued = progress.enqueued,
                "Flushed more records than were enqueued"
            );
        }

        self.emit_ready(&mut state)
    }

    /// Mark a stream as failed; checkpoints depending on it are never emitted
    pub fn mark_failed(&self, stream: &StreamDescriptor) {
        let mut state = self.inner.lock();
        state.streams.entry(stream.clone()).or_default().failed = true;

        let blocked = state
            .pending
            .values()
            .filter(|p| p.watermarks.iter().any(|(s, _)| s == stream))
            .count();
        warn!(stream = %stream, blocked, "Stream failed, dependent checkpoints will not be emitted");
    }

    /// Emit every checkpoint that is safe now
    pub fn flush_ready(&self) -> Result<usize> {
        let mut state = self.inner.lock();
        self.emit_ready(&mut state)
    }

    /// Checkpoints registered but not yet emitted
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Checkpoints emitted so far
    pub fn emitted_count(&self) -> u64 {
        self.inner.lock().emitted
    }

    /// Records flushed for a stream
    pub fn flushed_records(&self, stream: &StreamDescriptor) -> u64 {
        self.inner
            .lock()
            .streams
            .get(stream)
            .map(|p| p.flushed)
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn enqueued_records(&self, stream: &StreamDescriptor) -> u64 {
        self.inner
            .lock()
            .streams
            .get(stream)
            .map(|p| p.enqueued)
            .unwrap_or(0)
    }

    /// Per-stream summary of flushed records
    pub fn summaries(&self) -> HashMap<StreamDescriptor, StreamSyncSummary> {
        self.inner
            .lock()
            .streams
            .iter()
            .map(|(stream, progress)| {
                (
                    stream.clone(),
                    StreamSyncSummary {
                        records_written: progress.flushed,
                        complete: !progress.failed && progress.flushed == progress.enqueued,
                    },
                )
            })
            .collect()
    }

    /// Emit from the head of the sequence while the head is satisfied.
    ///
    /// Runs under the tracker lock so emission order matches sequence order
    /// regardless of which worker completed the unblocking flush.
    fn emit_ready(&self, state: &mut TrackerState) -> Result<usize> {
        let mut emitted = 0;

        loop {
            let ready = match state.pending.first_key_value() {
                Some((_, head)) => state.is_satisfied(head),
                None => false,
            };
            if !ready {
                break;
            }

            let Some((seq, pending)) = state.pending.pop_first() else {
                break;
            };

            self.sink.emit(&pending.checkpoint)?;
            state.emitted += 1;
            emitted += 1;
            debug!(seq, "Emitted checkpoint");
        }

        if emitted > 0 {
            info!(
                emitted,
                pending = state.pending.len(),
                "Checkpoints are durable"
            );
        }

        Ok(emitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SinkError;

    #[derive(Default)]
    struct RecordingSink {
        emitted: Mutex<Vec<String>>,
    }

    impl CheckpointSink for RecordingSink {
        fn emit(&self, checkpoint: &Checkpoint) -> Result<()> {
            self.emitted.lock().push(checkpoint.raw.clone());
            Ok(())
        }
    }

    fn tracker() -> (CheckpointTracker, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (CheckpointTracker::new(sink.clone()), sink)
    }

    fn stream_state(name: &str, stream: &StreamDescriptor) -> Checkpoint {
        Checkpoint::new(name, CheckpointScope::Stream(stream.clone()))
    }

    #[test]
    fn test_checkpoint_waits_for_flush() {
        let (tracker, sink) = tracker();
        let users = StreamDescriptor::new("users");

        tracker.record_enqueued(&users, 3);
        tracker.register(stream_state("c1", &users)).unwrap();
        assert!(sink.emitted.lock().is_empty());

        tracker.record_flushed(&users, 2).unwrap();
        assert!(sink.emitted.lock().is_empty());

        tracker.record_flushed(&users, 1).unwrap();
        assert_eq!(*sink.emitted.lock(), vec!["c1"]);
        assert_eq!(tracker.pending_count(), 0);
        assert_eq!(tracker.emitted_count(), 1);
    }

    #[test]
    fn test_emission_keeps_arrival_order() {
        let (tracker, sink) = tracker();
        let x = StreamDescriptor::new("x");
        let y = StreamDescriptor::new("y");

        tracker.record_enqueued(&x, 3);
        tracker.register(stream_state("c1", &x)).unwrap();
        tracker.record_enqueued(&y, 9);
        tracker.register(stream_state("c2", &y)).unwrap();

        // Y flushes first, but C2 arrived after C1.
        assert_eq!(tracker.record_flushed(&y, 9).unwrap(), 0);
        assert!(sink.emitted.lock().is_empty());

        assert_eq!(tracker.record_flushed(&x, 3).unwrap(), 2);
        assert_eq!(*sink.emitted.lock(), vec!["c1", "c2"]);
    }

    #[test]
    fn test_empty_interval_shares_watermark() {
        let (tracker, sink) = tracker();
        let users = StreamDescriptor::new("users");

        tracker.record_enqueued(&users, 2);
        tracker.register(stream_state("c1", &users)).unwrap();
        tracker.register(stream_state("c2", &users)).unwrap();

        tracker.record_flushed(&users, 2).unwrap();
        assert_eq!(*sink.emitted.lock(), vec!["c1", "c2"]);
    }

    #[test]
    fn test_checkpoint_without_pending_records_emits_immediately() {
        let (tracker, sink) = tracker();
        tracker
            .register(stream_state("c0", &StreamDescriptor::new("never_seen")))
            .unwrap();
        tracker
            .register(Checkpoint::new("g0", CheckpointScope::Global))
            .unwrap();
        assert_eq!(*sink.emitted.lock(), vec!["c0", "g0"]);
    }

    #[test]
    fn test_global_checkpoint_waits_for_every_stream() {
        let (tracker, sink) = tracker();
        let a = StreamDescriptor::new("a");
        let b = StreamDescriptor::new("b");

        tracker.record_enqueued(&a, 1);
        tracker.record_enqueued(&b, 1);
        tracker
            .register(Checkpoint::new("g1", CheckpointScope::Global))
            .unwrap();
        // Records after the checkpoint do not delay it.
        tracker.record_enqueued(&a, 5);

        tracker.record_flushed(&a, 1).unwrap();
        assert!(sink.emitted.lock().is_empty());
        tracker.record_flushed(&b, 1).unwrap();
        assert_eq!(*sink.emitted.lock(), vec!["g1"]);
    }

    #[test]
    fn test_failed_stream_blocks_dependent_checkpoints() {
        let (tracker, sink) = tracker();
        let z = StreamDescriptor::new("z");

        tracker.record_enqueued(&z, 2);
        tracker.register(stream_state("c1", &z)).unwrap();
        tracker.record_enqueued(&z, 1);
        tracker.register(stream_state("c2", &z)).unwrap();

        tracker.record_flushed(&z, 2).unwrap();
        tracker.mark_failed(&z);
        tracker.flush_ready().unwrap();

        assert_eq!(*sink.emitted.lock(), vec!["c1"]);
        assert_eq!(tracker.pending_count(), 1);
    }

    #[test]
    fn test_sink_error_propagates() {
        struct FailingSink;
        impl CheckpointSink for FailingSink {
            fn emit(&self, _checkpoint: &Checkpoint) -> Result<()> {
                Err(SinkError::Emit("stdout closed".into()))
            }
        }

        let tracker = CheckpointTracker::new(Arc::new(FailingSink));
        let result = tracker.register(Checkpoint::new("c", CheckpointScope::Global));
        assert!(matches!(result, Err(SinkError::Emit(_))));
    }

    #[test]
    fn test_summaries_report_flushed_records() {
        let (tracker, _sink) = tracker();
        let users = StreamDescriptor::new("users");
        tracker.record_enqueued(&users, 4);
        tracker.record_flushed(&users, 4).unwrap();

        let orders = StreamDescriptor::new("orders");
        tracker.record_enqueued(&orders, 2);
        tracker.record_flushed(&orders, 1).unwrap();

        let summaries = tracker.summaries();
        assert_eq!(summaries[&users].records_written, 4);
        assert!(summaries[&users].complete);
        assert_eq!(summaries[&orders].records_written, 1);
        assert!(!summaries[&orders].complete);
        assert_eq!(tracker.flushed_records(&users), 4);
    }
}
