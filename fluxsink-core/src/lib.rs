//! FluxSink Core - Asynchronous Ingestion Engine for Destination Connectors
//!
//! FluxSink receives a sequential stream of protocol messages (records and
//! checkpoint states), buffers records in memory under a global byte budget,
//! persists them in batches on background workers, and only forwards a
//! checkpoint once every record that precedes it has been flushed.
//!
//! # Architecture
//!
//! - **Memory Manager**: global byte budget gating every enqueue (backpressure)
//! - **Buffer Store**: per-stream ordered queues with two-phase dequeue
//! - **Checkpoint Tracker**: watermarks per stream, emission in arrival order
//! - **Flush Workers**: fixed worker pool plus a periodic timer, driven by the
//!   flush selector and guarded by the failure sink
//! - **Schema Reconciler**: minimal column diff between observed and expected tables
//! - **Local Destination**: JSONL segment writer with the schema lifecycle

pub mod buffer;
pub mod config;
pub mod consumer;
pub mod destination;
pub mod flush;
pub mod ingest;
pub mod memory;
pub mod schema;
pub mod state;

mod error;
mod types;

pub use config::{EngineConfig, MemoryLimit};
pub use consumer::{AsyncStreamConsumer, EngineStats};
pub use error::{Result, SinkError};
pub use types::*;

/// FluxSink version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
