//! FluxSink CLI - buffered destination reading protocol messages from stdin
//!
//! Records are written as JSONL segments under the output directory.
//! Durable checkpoints are echoed to stdout; logs go to stderr.

use anyhow::{Context, Result};
use clap::Parser;
use fluxsink_core::destination::{CheckpointSink, LocalDestination, SyncPolicy, DEFAULT_SEGMENT_SIZE};
use fluxsink_core::schema::ConfiguredCatalog;
use fluxsink_core::state::Checkpoint;
use fluxsink_core::{AsyncStreamConsumer, EngineConfig, MemoryLimit, SinkError};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fluxsink")]
#[command(version, about = "Buffered destination: stdin messages in, JSONL segments out")]
struct Args {
    /// Engine configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Configured catalog file (JSON)
    #[arg(long)]
    catalog: PathBuf,

    /// Directory receiving the stream segments
    #[arg(short, long, default_value = "output")]
    output_dir: PathBuf,

    /// Override the number of flush workers
    #[arg(long)]
    workers: Option<usize>,

    /// Override the memory budget with an absolute byte count
    #[arg(long)]
    memory_limit_bytes: Option<u64>,

    /// Segment size before rotation
    #[arg(long, default_value_t = DEFAULT_SEGMENT_SIZE)]
    segment_size: u64,

    /// Do not fsync segments after each batch
    #[arg(long)]
    no_sync: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

/// Writes each durable checkpoint to stdout as its original line
struct StdoutSink;

impl CheckpointSink for StdoutSink {
    fn emit(&self, checkpoint: &Checkpoint) -> fluxsink_core::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(out, "{}", checkpoint.raw)
            .and_then(|()| out.flush())
            .map_err(|e| SinkError::Emit(format!("writing checkpoint to stdout: {}", e)))
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.json_logs);

    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.worker_count = workers;
    }
    if let Some(bytes) = args.memory_limit_bytes {
        config.memory_limit = MemoryLimit::Bytes(bytes);
    }

    let catalog = ConfiguredCatalog::from_file(&args.catalog)
        .with_context(|| format!("loading catalog {}", args.catalog.display()))?;

    let sync_policy = if args.no_sync {
        SyncPolicy::None
    } else {
        SyncPolicy::EveryBatch
    };
    let destination = Arc::new(
        LocalDestination::from_catalog(
            &args.output_dir,
            &catalog,
            config.default_namespace.as_deref(),
        )?
        .with_segment_size(args.segment_size)
        .with_sync_policy(sync_policy),
    );

    info!("Starting FluxSink v{}", fluxsink_core::VERSION);
    info!(
        output_dir = %args.output_dir.display(),
        streams = catalog.streams.len(),
        "Writing to local destination"
    );

    let mut consumer = AsyncStreamConsumer::new(
        config,
        destination.clone(),
        Arc::new(StdoutSink),
        destination,
    )?
    .with_catalog(&catalog)?;
    consumer.start()?;

    let read = read_messages(&mut consumer);
    let closed = consumer.close();

    if let Err(err) = closed {
        let stage = if err.is_flush_failure() {
            format!("writing segments under {}", args.output_dir.display())
        } else {
            "sync failed".to_string()
        };
        return Err(err).context(stage);
    }
    read.context("reading stdin")?;
    Ok(())
}

/// Feed stdin into the consumer until EOF or the first rejected message
fn read_messages(consumer: &mut AsyncStreamConsumer) -> io::Result<()> {
    for line in io::stdin().lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let Err(err) = consumer.accept(&line) {
            error!("Stopping ingestion: {}", err);
            break;
        }
    }
    Ok(())
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
