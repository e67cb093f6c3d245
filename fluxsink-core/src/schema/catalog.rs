//! Configured catalog: the streams a run is allowed to write

use super::TableSchema;
use crate::{DestinationSyncMode, Result, SinkError, StreamDescriptor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// Stream definition as declared by the source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSpec {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub json_schema: Value,
}

/// A stream plus how the destination must write it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfiguredStream {
    pub stream: StreamSpec,
    #[serde(default)]
    pub destination_sync_mode: DestinationSyncMode,
}

impl ConfiguredStream {
    /// Descriptor with the default namespace applied
    pub fn descriptor(&self, default_namespace: Option<&str>) -> StreamDescriptor {
        StreamDescriptor {
            namespace: self.stream.namespace.clone(),
            name: self.stream.name.clone(),
        }
        .or_namespace(default_namespace)
    }

    /// Expected table schema
    pub fn table_schema(&self) -> Result<TableSchema> {
        TableSchema::from_json_schema(&self.stream.json_schema).map_err(|e| {
            SinkError::Schema(format!("stream {}: {}", self.stream.name, e))
        })
    }
}

/// Every stream of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfiguredCatalog {
    pub streams: Vec<ConfiguredStream>,
}

impl ConfiguredCatalog {
    /// Load a catalog from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse a catalog from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| SinkError::Config(format!("invalid configured catalog: {}", e)))
    }

    /// Streams keyed by descriptor, default namespace applied.
    ///
    /// Two entries resolving to the same descriptor are rejected.
    pub fn by_descriptor(
        &self,
        default_namespace: Option<&str>,
    ) -> Result<BTreeMap<StreamDescriptor, &ConfiguredStream>> {
        let mut streams = BTreeMap::new();
        for configured in &self.streams {
            let descriptor = configured.descriptor(default_namespace);
            if streams.insert(descriptor.clone(), configured).is_some() {
                return Err(SinkError::Config(format!(
                    "stream {} appears more than once in the catalog",
                    descriptor
                )));
            }
        }
        Ok(streams)
    }
}
