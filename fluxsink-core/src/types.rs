//! Core types for FluxSink

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a destination table: optional namespace plus stream name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamDescriptor {
    /// Namespace (schema / dataset); `None` when the source sets none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Stream name
    pub name: String,
}

impl StreamDescriptor {
    /// Create a descriptor without a namespace
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Set the namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Fill in the namespace when the descriptor has none
    pub fn or_namespace(mut self, default: Option<&str>) -> Self {
        if self.namespace.is_none() {
            self.namespace = default.map(str::to_string);
        }
        self
    }
}

impl fmt::Display for StreamDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}.{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// How a stream's final table is written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationSyncMode {
    /// Append records to the existing table
    #[default]
    Append,
    /// Replace the table contents
    Overwrite,
    /// Append, then deduplicate on the primary key
    AppendDedup,
}

/// What a run synced for one stream, handed to type-and-dedupe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamSyncSummary {
    /// Records durably flushed during this run
    pub records_written: u64,
    /// Every enqueued record was flushed and the stream never failed
    pub complete: bool,
}
