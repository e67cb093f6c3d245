//! Local file destination
//!
//! Each stream gets a directory `<root>/<namespace>/<name>` holding
//! newline-delimited raw segments (`raw_<id>.jsonl`) plus lifecycle files:
//!
//! - `_schema.json`: the table schema last applied
//! - `_layout`: marker for the current raw layout
//! - `_summary.json`: what the last run wrote
//!
//! Overwrite streams are written into `_staging/` and swapped in when the
//! final tables are committed.

use crate::buffer::BufferedRecord;
use crate::destination::{Persister, SchemaLifecycle};
use crate::schema::{compute_diff, ConfiguredCatalog, TableSchema};
use crate::{DestinationSyncMode, Result, StreamDescriptor, StreamSyncSummary};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::value::RawValue;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SCHEMA_FILE: &str = "_schema.json";
const LAYOUT_FILE: &str = "_layout";
const SUMMARY_FILE: &str = "_summary.json";
const STAGING_DIR: &str = "_staging";
const LAYOUT_VERSION: &str = "raw-v2";
const DEFAULT_NAMESPACE_DIR: &str = "_default";

/// Default segment size before rotation (64MB)
pub const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// When segment files are fsynced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPolicy {
    /// After every persisted batch
    #[default]
    EveryBatch,
    /// After every N batches
    EveryN(usize),
    /// Leave it to the OS
    None,
}

/// What the destination knows about one configured stream
#[derive(Debug, Clone, PartialEq)]
pub struct LocalStreamConfig {
    pub sync_mode: DestinationSyncMode,
    pub schema: TableSchema,
}

/// One line of a raw segment
#[derive(Serialize)]
struct RawRow<'a> {
    raw_id: Uuid,
    extracted_at: Option<DateTime<Utc>>,
    loaded_at: DateTime<Utc>,
    data: &'a RawValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    meta: Option<&'a Value>,
}

#[derive(Serialize)]
struct SummaryFile<'a> {
    stream: &'a StreamDescriptor,
    sync_mode: DestinationSyncMode,
    records_written: u64,
    complete: bool,
    finished_at: DateTime<Utc>,
}

/// Appends raw rows to the current segment of one directory
struct SegmentWriter {
    dir: PathBuf,
    file: BufWriter<File>,
    segment_id: u64,
    bytes_written: u64,
    batches_since_sync: usize,
}

impl SegmentWriter {
    fn open(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        let segment_id = find_latest_segment(&dir)?;
        let file = open_segment(&dir, segment_id)?;
        let bytes_written = file.metadata()?.len();

        Ok(Self {
            dir,
            file: BufWriter::new(file),
            segment_id,
            bytes_written,
            batches_since_sync: 0,
        })
    }

    fn write_line(&mut self, line: &[u8], segment_size: u64) -> Result<()> {
        let len = line.len() as u64;
        if self.bytes_written > 0 && self.bytes_written + len > segment_size {
            self.rotate()?;
        }
        self.file.write_all(line)?;
        self.bytes_written += len;
        Ok(())
    }

    fn finish_batch(&mut self, policy: SyncPolicy) -> Result<()> {
        self.file.flush()?;
        self.batches_since_sync += 1;

        let sync = match policy {
            SyncPolicy::EveryBatch => true,
            SyncPolicy::EveryN(n) => self.batches_since_sync >= n,
            SyncPolicy::None => false,
        };
        if sync {
            self.file.get_ref().sync_all()?;
            self.batches_since_sync = 0;
        }
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_all()?;

        self.segment_id += 1;
        self.file = BufWriter::new(open_segment(&self.dir, self.segment_id)?);
        self.bytes_written = 0;
        debug!(dir = %self.dir.display(), segment = self.segment_id, "Rotated segment");
        Ok(())
    }
}

/// Writes streams as raw JSONL segments under a root directory
pub struct LocalDestination {
    root: PathBuf,
    streams: BTreeMap<StreamDescriptor, LocalStreamConfig>,
    segment_size: u64,
    sync_policy: SyncPolicy,
    writers: RwLock<HashMap<StreamDescriptor, Arc<Mutex<SegmentWriter>>>>,
    complete: Mutex<HashSet<StreamDescriptor>>,
}

impl LocalDestination {
    /// Create a destination for the given streams
    pub fn new(
        root: impl Into<PathBuf>,
        streams: BTreeMap<StreamDescriptor, LocalStreamConfig>,
    ) -> Self {
        Self {
            root: root.into(),
            streams,
            segment_size: DEFAULT_SEGMENT_SIZE,
            sync_policy: SyncPolicy::default(),
            writers: RwLock::new(HashMap::new()),
            complete: Mutex::new(HashSet::new()),
        }
    }

    /// Create a destination for every stream of a configured catalog
    pub fn from_catalog(
        root: impl Into<PathBuf>,
        catalog: &ConfiguredCatalog,
        default_namespace: Option<&str>,
    ) -> Result<Self> {
        let mut streams = BTreeMap::new();
        for (descriptor, configured) in catalog.by_descriptor(default_namespace)? {
            streams.insert(
                descriptor,
                LocalStreamConfig {
                    sync_mode: configured.destination_sync_mode,
                    schema: configured.table_schema()?,
                },
            );
        }
        Ok(Self::new(root, streams))
    }

    /// Set the size at which segments rotate
    pub fn with_segment_size(mut self, bytes: u64) -> Self {
        self.segment_size = bytes;
        self
    }

    /// Set the fsync policy
    pub fn with_sync_policy(mut self, policy: SyncPolicy) -> Self {
        self.sync_policy = policy;
        self
    }

    /// Directory of a stream's final data
    pub fn stream_dir(&self, stream: &StreamDescriptor) -> PathBuf {
        let namespace = stream.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE_DIR);
        self.root
            .join(path_component(namespace))
            .join(path_component(&stream.name))
    }

    fn sync_mode(&self, stream: &StreamDescriptor) -> DestinationSyncMode {
        self.streams
            .get(stream)
            .map(|c| c.sync_mode)
            .unwrap_or_default()
    }

    fn write_dir(&self, stream: &StreamDescriptor) -> PathBuf {
        let dir = self.stream_dir(stream);
        match self.sync_mode(stream) {
            DestinationSyncMode::Overwrite => dir.join(STAGING_DIR),
            _ => dir,
        }
    }

    fn writer_for(&self, stream: &StreamDescriptor) -> Result<Arc<Mutex<SegmentWriter>>> {
        if let Some(writer) = self.writers.read().get(stream) {
            return Ok(writer.clone());
        }

        let mut writers = self.writers.write();
        if let Some(writer) = writers.get(stream) {
            return Ok(writer.clone());
        }
        let writer = Arc::new(Mutex::new(SegmentWriter::open(self.write_dir(stream))?));
        writers.insert(stream.clone(), writer.clone());
        Ok(writer)
    }

    fn migrate_schema(&self, stream: &StreamDescriptor, expected: &TableSchema) -> Result<()> {
        let dir = self.stream_dir(stream);
        fs::create_dir_all(&dir)?;
        let schema_path = dir.join(SCHEMA_FILE);

        if !schema_path.exists() {
            write_json_atomic(&schema_path, expected)?;
            fs::write(dir.join(LAYOUT_FILE), LAYOUT_VERSION)?;
            info!(stream = %stream, columns = expected.len(), "Created table schema");
            return Ok(());
        }

        let observed: TableSchema = serde_json::from_slice(&fs::read(&schema_path)?)?;
        let report = compute_diff(&observed, expected, is_modern_layout(&dir)?);
        if report.is_no_op() {
            debug!(stream = %stream, "Table schema up to date");
            return Ok(());
        }

        info!(
            stream = %stream,
            add = ?report.columns_to_add,
            remove = ?report.columns_to_remove,
            change_type = ?report.columns_to_change_type,
            modern = report.is_modern_format,
            "Migrating table schema"
        );
        write_json_atomic(&schema_path, expected)?;
        fs::write(dir.join(LAYOUT_FILE), LAYOUT_VERSION)?;
        Ok(())
    }

    fn swap_staging(&self, stream: &StreamDescriptor) -> Result<()> {
        let dir = self.stream_dir(stream);
        let staging = dir.join(STAGING_DIR);
        if !staging.exists() {
            return Ok(());
        }

        let mut removed = 0;
        for path in segment_paths(&dir)? {
            fs::remove_file(path)?;
            removed += 1;
        }
        let mut moved = 0;
        for path in segment_paths(&staging)? {
            if let Some(name) = path.file_name() {
                fs::rename(&path, dir.join(name))?;
                moved += 1;
            }
        }
        fs::remove_dir_all(&staging)?;

        info!(stream = %stream, removed, moved, "Swapped overwrite segments");
        Ok(())
    }
}

impl Persister for LocalDestination {
    fn flush(&self, stream: &StreamDescriptor, batch: &[BufferedRecord]) -> Result<()> {
        let writer = self.writer_for(stream)?;
        let loaded_at = Utc::now();
        let mut writer = writer.lock();

        let mut line = Vec::with_capacity(256);
        for record in batch {
            line.clear();
            let data: &RawValue = serde_json::from_slice(&record.data)?;
            let row = RawRow {
                raw_id: Uuid::new_v4(),
                extracted_at: Utc.timestamp_millis_opt(record.emitted_at).single(),
                loaded_at,
                data,
                meta: record.meta.as_ref(),
            };
            serde_json::to_writer(&mut line, &row)?;
            line.push(b'\n');
            writer.write_line(&line, self.segment_size)?;
        }
        writer.finish_batch(self.sync_policy)?;

        debug!(stream = %stream, rows = batch.len(), segment = writer.segment_id, "Wrote raw rows");
        Ok(())
    }
}

impl SchemaLifecycle for LocalDestination {
    fn prepare_schemas_and_run_migrations(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        for (stream, config) in &self.streams {
            self.migrate_schema(stream, &config.schema)?;
        }
        Ok(())
    }

    fn prepare_final_tables(&self) -> Result<()> {
        for (stream, config) in &self.streams {
            if config.sync_mode != DestinationSyncMode::Overwrite {
                continue;
            }
            let staging = self.stream_dir(stream).join(STAGING_DIR);
            if staging.exists() {
                fs::remove_dir_all(&staging)?;
            }
            fs::create_dir_all(&staging)?;
            debug!(stream = %stream, "Prepared overwrite staging");
        }
        Ok(())
    }

    fn type_and_dedupe(
        &self,
        summaries: &HashMap<StreamDescriptor, StreamSyncSummary>,
    ) -> Result<()> {
        let mut complete = self.complete.lock();
        for (stream, config) in &self.streams {
            // A stream that received nothing was still fully synced.
            let summary = summaries.get(stream).copied().unwrap_or(StreamSyncSummary {
                records_written: 0,
                complete: true,
            });
            if summary.complete {
                complete.insert(stream.clone());
            }

            let dir = self.stream_dir(stream);
            fs::create_dir_all(&dir)?;
            let path = dir.join(format!("{}.tmp", SUMMARY_FILE));
            let file = SummaryFile {
                stream,
                sync_mode: config.sync_mode,
                records_written: summary.records_written,
                complete: summary.complete,
                finished_at: Utc::now(),
            };
            fs::write(&path, serde_json::to_vec_pretty(&file)?)?;
        }
        Ok(())
    }

    fn commit_final_tables(&self) -> Result<()> {
        // Close segment handles before moving files.
        self.writers.write().clear();
        let complete = self.complete.lock();

        for (stream, config) in &self.streams {
            let dir = self.stream_dir(stream);
            if config.sync_mode == DestinationSyncMode::Overwrite {
                if complete.contains(stream) {
                    self.swap_staging(stream)?;
                } else {
                    warn!(stream = %stream, "Stream incomplete, keeping previous data");
                }
            }

            let pending = dir.join(format!("{}.tmp", SUMMARY_FILE));
            if pending.exists() {
                fs::rename(&pending, dir.join(SUMMARY_FILE))?;
            }
        }
        Ok(())
    }

    fn cleanup(&self) -> Result<()> {
        let mut removed = 0;
        for stream in self.streams.keys() {
            let dir = self.stream_dir(stream);
            let staging = dir.join(STAGING_DIR);
            if staging.exists() {
                fs::remove_dir_all(&staging)?;
                removed += 1;
            }
            if !dir.exists() {
                continue;
            }
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().is_some_and(|ext| ext == "tmp") {
                    fs::remove_file(&path)?;
                    removed += 1;
                }
            }
        }
        debug!(removed, "Cleaned up temporary files");
        Ok(())
    }
}

fn path_component(name: &str) -> String {
    name.replace(['/', '\\'], "_")
}

fn segment_id(path: &Path) -> Option<u64> {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_prefix("raw_"))
        .and_then(|n| n.strip_suffix(".jsonl"))
        .and_then(|id| id.parse().ok())
}

fn segment_paths(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if segment_id(&path).is_some() {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

fn find_latest_segment(dir: &Path) -> Result<u64> {
    Ok(segment_paths(dir)?
        .iter()
        .filter_map(|p| segment_id(p))
        .max()
        .unwrap_or(0))
}

fn open_segment(dir: &Path, segment_id: u64) -> Result<File> {
    let path = dir.join(format!("raw_{:020}.jsonl", segment_id));
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

fn is_modern_layout(dir: &Path) -> Result<bool> {
    match fs::read_to_string(dir.join(LAYOUT_FILE)) {
        Ok(marker) => Ok(marker.trim() == LAYOUT_VERSION),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
