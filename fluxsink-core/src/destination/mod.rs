//! Destination-side capabilities injected into the engine
//!
//! - [`Persister`]: writes one batch of a stream to the target store
//! - [`CheckpointSink`]: receives durable checkpoints in arrival order
//! - [`SchemaLifecycle`]: prepare / type-and-dedupe / commit / cleanup calls
//!   made around the buffering run

mod local;

pub use local::{LocalDestination, LocalStreamConfig, SyncPolicy, DEFAULT_SEGMENT_SIZE};

use crate::buffer::BufferedRecord;
use crate::state::Checkpoint;
use crate::{Result, StreamDescriptor, StreamSyncSummary};
use std::collections::HashMap;

/// Persists batches of buffered records.
///
/// Called from flush workers; must be safe to call concurrently for
/// different streams. Never called concurrently for the same stream.
pub trait Persister: Send + Sync {
    /// Write `batch` (in enqueue order) to the target for `stream`
    fn flush(&self, stream: &StreamDescriptor, batch: &[BufferedRecord]) -> Result<()>;
}

impl<F> Persister for F
where
    F: Fn(&StreamDescriptor, &[BufferedRecord]) -> Result<()> + Send + Sync,
{
    fn flush(&self, stream: &StreamDescriptor, batch: &[BufferedRecord]) -> Result<()> {
        self(stream, batch)
    }
}

/// Receives checkpoints once they are durable
pub trait CheckpointSink: Send + Sync {
    /// Forward `checkpoint` downstream
    fn emit(&self, checkpoint: &Checkpoint) -> Result<()>;
}

impl<F> CheckpointSink for F
where
    F: Fn(&Checkpoint) -> Result<()> + Send + Sync,
{
    fn emit(&self, checkpoint: &Checkpoint) -> Result<()> {
        self(checkpoint)
    }
}

/// Schema and final-table lifecycle of the destination
pub trait SchemaLifecycle: Send + Sync {
    /// Create schemas and migrate existing tables (uses the schema diff)
    fn prepare_schemas_and_run_migrations(&self) -> Result<()>;

    /// Create or truncate final tables before records arrive
    fn prepare_final_tables(&self) -> Result<()>;

    /// Materialize what was synced for each stream
    fn type_and_dedupe(&self, summaries: &HashMap<StreamDescriptor, StreamSyncSummary>)
        -> Result<()>;

    /// Make the final tables visible
    fn commit_final_tables(&self) -> Result<()>;

    /// Remove temporary artifacts
    fn cleanup(&self) -> Result<()>;
}

/// Lifecycle that does nothing, for destinations without final tables
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLifecycle;

impl SchemaLifecycle for NoopLifecycle {
    fn prepare_schemas_and_run_migrations(&self) -> Result<()> {
        Ok(())
    }

    fn prepare_final_tables(&self) -> Result<()> {
        Ok(())
    }

    fn type_and_dedupe(
        &self,
        _summaries: &HashMap<StreamDescriptor, StreamSyncSummary>,
    ) -> Result<()> {
        Ok(())
    }

    fn commit_final_tables(&self) -> Result<()> {
        Ok(())
    }

    fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}
