//! Asynchronous stream consumer
//!
//! Top-level coordinator of a run. The caller feeds inbound messages one at
//! a time from a single thread; records are buffered under the memory
//! budget and flushed by background workers, checkpoints are forwarded once
//! durable.
//!
//! ```text
//! start() ─► accept()* ─► close()
//!   │                        │
//!   ├ prepare schemas        ├ drain workers, emit ready checkpoints
//!   ├ prepare final tables   ├ type and dedupe
//!   └ spawn workers          ├ commit final tables
//!                            └ cleanup, surface first error
//! ```

use crate::buffer::BufferStore;
use crate::destination::{CheckpointSink, Persister, SchemaLifecycle};
use crate::flush::{FailureSink, FlushSelector, FlushWorkers, SelectorConfig, WakeSignal, WorkerConfig};
use crate::ingest::{deserialize_message, IdentityTransformer, Message, Transformer};
use crate::memory::MemoryManager;
use crate::schema::ConfiguredCatalog;
use crate::state::{CheckpointScope, CheckpointTracker};
use crate::{EngineConfig, Result, SinkError, StreamDescriptor};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Running,
    Closed,
}

/// Point-in-time engine statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineStats {
    pub memory_used: u64,
    pub memory_limit: u64,
    pub buffered_bytes: u64,
    pub in_flight_bytes: u64,
    pub flushing_streams: usize,
    pub records_accepted: u64,
    pub checkpoints_accepted: u64,
    pub pending_checkpoints: usize,
    pub emitted_checkpoints: u64,
    pub flushed_records: BTreeMap<StreamDescriptor, u64>,
}

/// Buffers inbound records and persists them in the background
pub struct AsyncStreamConsumer {
    config: EngineConfig,
    memory: Arc<MemoryManager>,
    tracker: Arc<CheckpointTracker>,
    buffers: Arc<BufferStore>,
    selector: Arc<FlushSelector>,
    failure: Arc<FailureSink>,
    signal: Arc<WakeSignal>,
    persister: Arc<dyn Persister>,
    lifecycle: Arc<dyn SchemaLifecycle>,
    transformer: Arc<dyn Transformer>,
    known_streams: Option<HashSet<StreamDescriptor>>,
    workers: Option<FlushWorkers>,
    phase: Phase,
    records_accepted: u64,
    checkpoints_accepted: u64,
}

impl AsyncStreamConsumer {
    /// Create a consumer. Nothing runs until [`start`](Self::start).
    pub fn new(
        config: EngineConfig,
        persister: Arc<dyn Persister>,
        sink: Arc<dyn CheckpointSink>,
        lifecycle: Arc<dyn SchemaLifecycle>,
    ) -> Result<Self> {
        config.validate()?;

        let memory = Arc::new(MemoryManager::new(config.memory_limit.resolve()));
        let signal = Arc::new(WakeSignal::new());
        let tracker = Arc::new(CheckpointTracker::new(sink));
        let buffers = Arc::new(BufferStore::new(memory.clone(), tracker.clone()));
        let selector = Arc::new(FlushSelector::new(
            SelectorConfig {
                min_batch_bytes: config.min_batch_bytes,
                max_buffer_age: config.max_buffer_age(),
                memory_pressure_ratio: config.memory_pressure_ratio,
            },
            buffers.clone(),
            memory.clone(),
        ));
        let failure = Arc::new(FailureSink::new(memory.clone(), signal.clone()));

        Ok(Self {
            config,
            memory,
            tracker,
            buffers,
            selector,
            failure,
            signal,
            persister,
            lifecycle,
            transformer: Arc::new(IdentityTransformer),
            known_streams: None,
            workers: None,
            phase: Phase::Created,
            records_accepted: 0,
            checkpoints_accepted: 0,
        })
    }

    /// Use `transformer` on every record before buffering
    pub fn with_transformer(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.transformer = transformer;
        self
    }

    /// Reject records for streams missing from `catalog`
    pub fn with_catalog(mut self, catalog: &ConfiguredCatalog) -> Result<Self> {
        let streams = catalog.by_descriptor(self.config.default_namespace.as_deref())?;
        self.known_streams = Some(streams.into_keys().collect());
        Ok(self)
    }

    /// Prepare the destination and spawn the flush workers
    pub fn start(&mut self) -> Result<()> {
        if self.phase != Phase::Created {
            return Err(SinkError::Lifecycle("consumer already started".into()));
        }

        self.lifecycle.prepare_schemas_and_run_migrations()?;
        self.lifecycle.prepare_final_tables()?;

        let workers = FlushWorkers::start(
            WorkerConfig {
                worker_count: self.config.worker_count,
                max_batch_bytes: self.config.max_batch_bytes,
                flush_interval: self.config.flush_interval(),
            },
            self.selector.clone(),
            self.buffers.clone(),
            self.tracker.clone(),
            self.persister.clone(),
            self.failure.clone(),
            self.signal.clone(),
        )?;
        self.workers = Some(workers);
        self.phase = Phase::Running;

        info!(
            memory_limit = self.memory.limit(),
            workers = self.config.worker_count,
            min_batch_bytes = self.config.min_batch_bytes,
            "Consumer started"
        );
        Ok(())
    }

    /// Deserialize, classify and accept one inbound line.
    ///
    /// Blocks while the memory budget is exhausted. Any error is fatal for
    /// the run: the caller must stop feeding messages and call
    /// [`close`](Self::close).
    pub fn accept(&mut self, line: &str) -> Result<()> {
        self.ensure_accepting()?;
        match deserialize_message(line, self.transformer.as_ref()) {
            Ok(message) => self.accept_message(message),
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Accept an already classified message
    pub fn accept_message(&mut self, message: Message) -> Result<()> {
        self.ensure_accepting()?;

        match message {
            Message::Record(mut record) => {
                record.stream = self.normalize(record.stream.clone());
                let stream = record.stream.clone();

                if let Some(known) = &self.known_streams {
                    if !known.contains(&stream) {
                        return Err(self.fail(SinkError::UnknownStream(stream.to_string())));
                    }
                }

                let signal = self.signal.clone();
                if let Err(err) = self.buffers.enqueue(record, || signal.notify_all()) {
                    if err.is_fatal() {
                        return Err(self.fail(err));
                    }
                    // A cancelled enqueue echoes the failure already recorded.
                    return Err(self.failure.first_error().unwrap_or(err));
                }
                self.records_accepted += 1;

                if self.buffers.peek_size(&stream) >= self.config.min_batch_bytes
                    || self.memory.is_under_pressure(self.config.memory_pressure_ratio)
                {
                    self.signal.notify_one();
                }
                Ok(())
            }
            Message::Checkpoint(mut checkpoint) => {
                if let CheckpointScope::Stream(stream) = &mut checkpoint.scope {
                    *stream = self.normalize(stream.clone());
                }
                match self.tracker.register(checkpoint) {
                    Ok(seq) => {
                        self.checkpoints_accepted += 1;
                        debug!(seq, "Accepted checkpoint");
                        Ok(())
                    }
                    Err(err) => Err(self.fail(err)),
                }
            }
        }
    }

    /// Drain every buffer, finish the destination lifecycle and report the
    /// first failure of the run, if any.
    ///
    /// The lifecycle steps after draining run even when the run failed so
    /// the destination can clean up; their own errors never replace an
    /// earlier one.
    pub fn close(&mut self) -> Result<()> {
        match self.phase {
            Phase::Running => {}
            Phase::Created => return Err(SinkError::Lifecycle("consumer not started".into())),
            Phase::Closed => return Err(SinkError::Lifecycle("consumer already closed".into())),
        }

        if let Some(mut workers) = self.workers.take() {
            if let Err(err) = workers.close() {
                self.failure.record(err);
            }
        }
        if !self.failure.is_failed() {
            if let Err(err) = self.tracker.flush_ready() {
                self.failure.record(err);
            }
        }

        let summaries = self.tracker.summaries();
        let lifecycle = self.lifecycle.clone();
        self.run_step("type_and_dedupe", || lifecycle.type_and_dedupe(&summaries));
        self.run_step("commit_final_tables", || lifecycle.commit_final_tables());
        self.run_step("cleanup", || lifecycle.cleanup());
        self.phase = Phase::Closed;

        let stats = self.stats();
        info!(
            records = stats.records_accepted,
            checkpoints_emitted = stats.emitted_checkpoints,
            checkpoints_pending = stats.pending_checkpoints,
            streams = stats.flushed_records.len(),
            failed = self.failure.is_failed(),
            "Consumer closed"
        );

        match self.failure.first_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Current statistics
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            memory_used: self.memory.used(),
            memory_limit: self.memory.limit(),
            buffered_bytes: self.buffers.total_buffered_bytes(),
            in_flight_bytes: self.buffers.in_flight_bytes(),
            flushing_streams: self.selector.flushing_count(),
            records_accepted: self.records_accepted,
            checkpoints_accepted: self.checkpoints_accepted,
            pending_checkpoints: self.tracker.pending_count(),
            emitted_checkpoints: self.tracker.emitted_count(),
            flushed_records: self
                .tracker
                .summaries()
                .into_iter()
                .map(|(stream, summary)| (stream, summary.records_written))
                .collect(),
        }
    }

    /// The first error recorded during the run
    pub fn first_error(&self) -> Option<SinkError> {
        self.failure.first_error()
    }

    fn ensure_accepting(&self) -> Result<()> {
        match self.phase {
            Phase::Running => self.failure.check(),
            Phase::Created => Err(SinkError::Lifecycle("consumer not started".into())),
            Phase::Closed => Err(SinkError::Lifecycle("consumer already closed".into())),
        }
    }

    fn normalize(&self, stream: StreamDescriptor) -> StreamDescriptor {
        stream.or_namespace(self.config.default_namespace.as_deref())
    }

    /// Record `err` as a run failure and hand it back to the caller
    fn fail(&self, err: SinkError) -> SinkError {
        if let SinkError::Transform { stream, .. } = &err {
            let stream = self.normalize(stream.clone());
            self.selector.mark_failed(&stream);
            self.tracker.mark_failed(&stream);
        }
        self.failure.record(err.clone());
        err
    }

    fn run_step(&self, step: &str, f: impl FnOnce() -> Result<()>) {
        if let Err(err) = f() {
            warn!(step, "Lifecycle step failed: {}", err);
            self.failure.record(err);
        }
    }
}
