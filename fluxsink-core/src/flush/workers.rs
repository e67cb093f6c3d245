//! Flush worker pool
//!
//! A fixed set of worker threads asks the selector for a stream, reserves a
//! batch, persists it and commits or aborts the reservation. A timer thread
//! wakes idle workers periodically so age-based flushes happen even when no
//! new data arrives.

use super::{FailureSink, FlushSelector, WakeSignal};
use crate::buffer::BufferStore;
use crate::destination::Persister;
use crate::state::CheckpointTracker;
use crate::{Result, SinkError, StreamDescriptor};
use crossbeam_channel::{select, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Worker pool settings
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of worker threads
    pub worker_count: usize,
    /// Upper bound on one batch
    pub max_batch_bytes: u64,
    /// Timer period
    pub flush_interval: Duration,
}

struct Shared {
    config: WorkerConfig,
    selector: Arc<FlushSelector>,
    buffers: Arc<BufferStore>,
    tracker: Arc<CheckpointTracker>,
    persister: Arc<dyn Persister>,
    failure: Arc<FailureSink>,
    signal: Arc<WakeSignal>,
    draining: AtomicBool,
    stopped: AtomicBool,
}

/// Running flush workers plus their timer
pub struct FlushWorkers {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    timer: Option<(Sender<()>, JoinHandle<()>)>,
}

impl FlushWorkers {
    /// Spawn the worker threads and the timer thread
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        config: WorkerConfig,
        selector: Arc<FlushSelector>,
        buffers: Arc<BufferStore>,
        tracker: Arc<CheckpointTracker>,
        persister: Arc<dyn Persister>,
        failure: Arc<FailureSink>,
        signal: Arc<WakeSignal>,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            config,
            selector,
            buffers,
            tracker,
            persister,
            failure,
            signal,
            draining: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        });

        let mut pool = Self {
            shared: shared.clone(),
            workers: Vec::with_capacity(shared.config.worker_count),
            timer: None,
        };

        for id in 0..shared.config.worker_count {
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("flush-worker-{}", id))
                .spawn(move || shared.run_worker(id))?;
            pool.workers.push(handle);
        }

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let ticker = crossbeam_channel::tick(shared.config.flush_interval);
        let signal = shared.signal.clone();
        let timer = thread::Builder::new()
            .name("flush-timer".to_string())
            .spawn(move || loop {
                select! {
                    recv(ticker) -> _ => signal.notify_all(),
                    recv(stop_rx) -> _ => break,
                }
            })?;
        pool.timer = Some((stop_tx, timer));

        info!(
            workers = shared.config.worker_count,
            interval_ms = shared.config.flush_interval.as_millis() as u64,
            "Started flush workers"
        );
        Ok(pool)
    }

    /// Flush every remaining buffer regardless of thresholds, then stop.
    ///
    /// Returns once all in-flight flushes have completed. Buffers are not
    /// drained if a failure was recorded.
    pub fn close(&mut self) -> Result<()> {
        info!(
            buffered_bytes = self.shared.buffers.total_buffered_bytes(),
            "Draining flush workers"
        );
        self.shared.draining.store(true, Ordering::SeqCst);
        self.shared.signal.notify_all();
        self.join()
    }

    fn join(&mut self) -> Result<()> {
        let mut panicked = 0;
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                panicked += 1;
            }
        }

        if let Some((stop_tx, timer)) = self.timer.take() {
            drop(stop_tx);
            if timer.join().is_err() {
                panicked += 1;
            }
        }

        if panicked > 0 {
            return Err(SinkError::Internal(format!(
                "{} flush thread(s) panicked",
                panicked
            )));
        }
        Ok(())
    }
}

impl Drop for FlushWorkers {
    fn drop(&mut self) {
        if self.workers.is_empty() && self.timer.is_none() {
            return;
        }
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.signal.notify_all();
        let _ = self.join();
    }
}

impl Shared {
    fn run_worker(&self, id: usize) {
        debug!(worker = id, "Flush worker started");

        loop {
            if self.failure.is_failed() || self.stopped.load(Ordering::SeqCst) {
                break;
            }

            let seen = self.signal.generation();
            let draining = self.draining.load(Ordering::SeqCst);

            match self.selector.select_next(draining) {
                Some(stream) => self.flush_stream(id, stream),
                None if draining => break,
                None => self.signal.wait_since(seen),
            }
        }

        debug!(worker = id, "Flush worker stopped");
    }

    fn flush_stream(&self, worker: usize, stream: StreamDescriptor) {
        let Some(reservation) = self
            .buffers
            .reserve_batch(&stream, self.config.max_batch_bytes)
        else {
            self.selector.finish(&stream);
            return;
        };

        let started = Instant::now();
        let records = reservation.len();
        let bytes = reservation.bytes();

        match self.persister.flush(&stream, reservation.records()) {
            Ok(()) => {
                let committed = self.buffers.commit(reservation);
                self.selector.finish(&stream);
                match committed {
                    Ok(()) => info!(
                        worker,
                        stream = %stream,
                        records,
                        bytes,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Flushed batch"
                    ),
                    Err(err) => {
                        self.failure.record(err);
                    }
                }
            }
            Err(err) => {
                self.buffers.abort(reservation);
                self.selector.mark_failed(&stream);
                self.tracker.mark_failed(&stream);
                self.failure.record(into_flush_error(&stream, err));
            }
        }
    }
}

fn into_flush_error(stream: &StreamDescriptor, err: SinkError) -> SinkError {
    match err {
        SinkError::Flush { .. } => err,
        other => SinkError::Flush {
            stream: stream.to_string(),
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferedRecord;
    use crate::flush::{FlushState, SelectorConfig};
    use crate::memory::MemoryManager;
    use crate::state::{Checkpoint, CheckpointScope};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    struct Harness {
        memory: Arc<MemoryManager>,
        tracker: Arc<CheckpointTracker>,
        buffers: Arc<BufferStore>,
        selector: Arc<FlushSelector>,
        failure: Arc<FailureSink>,
        signal: Arc<WakeSignal>,
        emitted: Arc<Mutex<Vec<String>>>,
    }

    impl Harness {
        fn new(limit: u64) -> Self {
            let memory = Arc::new(MemoryManager::new(limit));
            let signal = Arc::new(WakeSignal::new());
            let emitted = Arc::new(Mutex::new(Vec::new()));
            let sink = {
                let emitted = emitted.clone();
                Arc::new(move |c: &Checkpoint| -> Result<()> {
                    emitted.lock().push(c.raw.clone());
                    Ok(())
                })
            };
            let tracker = Arc::new(CheckpointTracker::new(sink));
            let buffers = Arc::new(BufferStore::new(memory.clone(), tracker.clone()));
            let selector = Arc::new(FlushSelector::new(
                SelectorConfig {
                    min_batch_bytes: 1_000_000,
                    max_buffer_age: Duration::from_secs(3600),
                    memory_pressure_ratio: 0.9,
                },
                buffers.clone(),
                memory.clone(),
            ));
            let failure = Arc::new(FailureSink::new(memory.clone(), signal.clone()));
            Self {
                memory,
                tracker,
                buffers,
                selector,
                failure,
                signal,
                emitted,
            }
        }

        fn start(&self, workers: usize, persister: Arc<dyn Persister>) -> FlushWorkers {
            FlushWorkers::start(
                WorkerConfig {
                    worker_count: workers,
                    max_batch_bytes: 100,
                    flush_interval: Duration::from_millis(10),
                },
                self.selector.clone(),
                self.buffers.clone(),
                self.tracker.clone(),
                persister,
                self.failure.clone(),
                self.signal.clone(),
            )
            .unwrap()
        }

        fn enqueue(&self, name: &str, size: usize) {
            self.buffers
                .enqueue(
                    BufferedRecord {
                        stream: StreamDescriptor::new(name),
                        data: Bytes::from(vec![b'7'; size]),
                        meta: None,
                        emitted_at: 0,
                    },
                    || {},
                )
                .unwrap();
        }

        fn checkpoint(&self, raw: &str, name: &str) {
            self.tracker
                .register(Checkpoint::new(
                    raw,
                    CheckpointScope::Stream(StreamDescriptor::new(name)),
                ))
                .unwrap();
        }
    }

    #[test]
    fn test_close_drains_below_threshold() {
        let harness = Harness::new(10_000);
        let flushed = Arc::new(AtomicUsize::new(0));
        let persister = {
            let flushed = flushed.clone();
            Arc::new(move |_: &StreamDescriptor, batch: &[BufferedRecord]| -> Result<()> {
                flushed.fetch_add(batch.len(), Ordering::SeqCst);
                Ok(())
            })
        };

        let mut workers = harness.start(2, persister);
        for _ in 0..10 {
            harness.enqueue("a", 30);
        }
        harness.checkpoint("c1", "a");
        harness.enqueue("b", 10);

        workers.close().unwrap();

        assert_eq!(flushed.load(Ordering::SeqCst), 11);
        assert_eq!(harness.buffers.total_buffered_bytes(), 0);
        assert_eq!(harness.memory.used(), 0);
        assert_eq!(*harness.emitted.lock(), vec!["c1"]);
    }

    #[test]
    fn test_no_concurrent_flush_of_same_stream() {
        let harness = Harness::new(100_000);
        let active = Arc::new(Mutex::new(HashSet::new()));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let persister = {
            let active = active.clone();
            let overlaps = overlaps.clone();
            Arc::new(move |stream: &StreamDescriptor, _: &[BufferedRecord]| -> Result<()> {
                if !active.lock().insert(stream.clone()) {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                thread::sleep(Duration::from_millis(2));
                active.lock().remove(stream);
                Ok(())
            })
        };

        for _ in 0..50 {
            harness.enqueue("hot", 50);
        }
        harness.enqueue("cold", 50);

        let mut workers = harness.start(4, persister);
        workers.close().unwrap();

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(harness.tracker.flushed_records(&StreamDescriptor::new("hot")), 50);
        assert_eq!(harness.tracker.flushed_records(&StreamDescriptor::new("cold")), 1);
    }

    #[test]
    fn test_failure_stops_workers_and_blocks_checkpoints() {
        let harness = Harness::new(100_000);
        let calls = Arc::new(AtomicUsize::new(0));
        let persister = {
            let calls = calls.clone();
            Arc::new(move |_: &StreamDescriptor, _: &[BufferedRecord]| -> Result<()> {
                if calls.fetch_add(1, Ordering::SeqCst) == 2 {
                    return Err(SinkError::Io(Arc::new(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "target went away",
                    ))));
                }
                Ok(())
            })
        };

        // Three batches of 100 bytes each (max_batch_bytes = 100).
        for i in 0..3 {
            harness.enqueue("z", 100);
            harness.checkpoint(&format!("c{}", i + 1), "z");
        }

        let mut workers = harness.start(1, persister);
        workers.close().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(harness.failure.is_failed());
        assert!(matches!(
            harness.failure.first_error(),
            Some(SinkError::Flush { .. })
        ));
        assert_eq!(
            harness.selector.state(&StreamDescriptor::new("z")),
            FlushState::Failed
        );
        assert_eq!(*harness.emitted.lock(), vec!["c1", "c2"]);
        assert_eq!(harness.memory.used(), 0);
    }

    #[test]
    fn test_timer_wakes_workers_for_aged_buffers() {
        let memory = Arc::new(MemoryManager::new(10_000));
        let signal = Arc::new(WakeSignal::new());
        let sink = Arc::new(|_: &Checkpoint| -> Result<()> { Ok(()) });
        let tracker = Arc::new(CheckpointTracker::new(sink));
        let buffers = Arc::new(BufferStore::new(memory.clone(), tracker.clone()));
        let selector = Arc::new(FlushSelector::new(
            SelectorConfig {
                min_batch_bytes: 1_000_000,
                max_buffer_age: Duration::from_millis(20),
                memory_pressure_ratio: 0.9,
            },
            buffers.clone(),
            memory.clone(),
        ));
        let failure = Arc::new(FailureSink::new(memory, signal.clone()));

        let mut workers = FlushWorkers::start(
            WorkerConfig {
                worker_count: 1,
                max_batch_bytes: 1000,
                flush_interval: Duration::from_millis(5),
            },
            selector,
            buffers.clone(),
            tracker.clone(),
            Arc::new(|_: &StreamDescriptor, _: &[BufferedRecord]| -> Result<()> { Ok(()) }),
            failure,
            signal,
        )
        .unwrap();

        buffers
            .enqueue(
                BufferedRecord {
                    stream: StreamDescriptor::new("trickle"),
                    data: Bytes::from_static(b"{}"),
                    meta: None,
                    emitted_at: 0,
                },
                || {},
            )
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while tracker.flushed_records(&StreamDescriptor::new("trickle")) == 0 {
            assert!(Instant::now() < deadline, "aged buffer was never flushed");
            thread::sleep(Duration::from_millis(5));
        }
        workers.close().unwrap();
    }
}
