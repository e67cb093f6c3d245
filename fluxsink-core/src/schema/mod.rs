//! Table schemas and the minimal column diff between them

mod catalog;

pub use catalog::{ConfiguredCatalog, ConfiguredStream, StreamSpec};

use crate::{Result, SinkError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Declared column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    String,
    Integer,
    Number,
    Boolean,
    Date,
    TimestampWithTimezone,
    TimestampWithoutTimezone,
    TimeWithTimezone,
    TimeWithoutTimezone,
    Array,
    Object,
    /// Unions and untyped properties, stored as raw JSON
    Unknown,
}

impl ColumnType {
    /// Map a JSON-schema property to a column type
    pub fn from_json_schema(property: &Value) -> Self {
        let types: Vec<&str> = match property.get("type") {
            Some(Value::String(t)) => vec![t.as_str()],
            Some(Value::Array(ts)) => ts.iter().filter_map(Value::as_str).collect(),
            _ => return ColumnType::Unknown,
        };
        let non_null: Vec<&str> = types.into_iter().filter(|t| *t != "null").collect();
        let [single] = non_null.as_slice() else {
            return ColumnType::Unknown;
        };

        let format = property.get("format").and_then(Value::as_str);
        let airbyte_type = property.get("airbyte_type").and_then(Value::as_str);

        match (*single, format, airbyte_type) {
            ("string", Some("date"), _) => ColumnType::Date,
            ("string", Some("date-time"), Some("timestamp_without_timezone")) => {
                ColumnType::TimestampWithoutTimezone
            }
            ("string", Some("date-time"), _) => ColumnType::TimestampWithTimezone,
            ("string", Some("time"), Some("time_with_timezone")) => ColumnType::TimeWithTimezone,
            ("string", Some("time"), _) => ColumnType::TimeWithoutTimezone,
            ("string", _, _) => ColumnType::String,
            ("integer", _, _) => ColumnType::Integer,
            ("number", _, Some("integer")) => ColumnType::Integer,
            ("number", _, _) => ColumnType::Number,
            ("boolean", _, _) => ColumnType::Boolean,
            ("array", _, _) => ColumnType::Array,
            ("object", _, _) => ColumnType::Object,
            _ => ColumnType::Unknown,
        }
    }
}

/// Column name to declared type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: BTreeMap<String, ColumnType>,
}

impl TableSchema {
    /// Create an empty schema
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a column
    pub fn with_column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.insert(name.into(), column_type);
        self
    }

    /// Build from a stream's JSON schema (`properties` of an object schema)
    pub fn from_json_schema(schema: &Value) -> Result<Self> {
        let properties = match schema.get("properties") {
            Some(Value::Object(properties)) => properties,
            Some(_) => {
                return Err(SinkError::Schema(
                    "json schema `properties` is not an object".to_string(),
                ))
            }
            None if schema.is_object() => return Ok(Self::new()),
            None => {
                return Err(SinkError::Schema("json schema is not an object".to_string()));
            }
        };

        let columns = properties
            .iter()
            .map(|(name, property)| (name.clone(), ColumnType::from_json_schema(property)))
            .collect();
        Ok(Self { columns })
    }

    /// Number of columns
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Columns an existing table must change to match the expected schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlterTableReport {
    pub columns_to_add: BTreeSet<String>,
    pub columns_to_remove: BTreeSet<String>,
    pub columns_to_change_type: BTreeSet<String>,
    /// Whether the table already uses the current layout
    pub is_modern_format: bool,
}

impl AlterTableReport {
    /// A table in the current layout whose columns already match.
    ///
    /// A legacy-layout table is never a no-op: it still needs migrating.
    pub fn is_no_op(&self) -> bool {
        self.is_modern_format
            && self.columns_to_add.is_empty()
            && self.columns_to_remove.is_empty()
            && self.columns_to_change_type.is_empty()
    }
}

/// Diff `observed` against `expected` by column name.
///
/// Names are compared as given; identifier normalization happens before.
pub fn compute_diff(
    observed: &TableSchema,
    expected: &TableSchema,
    is_modern_format: bool,
) -> AlterTableReport {
    let columns_to_add = expected
        .columns
        .keys()
        .filter(|name| !observed.columns.contains_key(*name))
        .cloned()
        .collect();

    let columns_to_remove = observed
        .columns
        .keys()
        .filter(|name| !expected.columns.contains_key(*name))
        .cloned()
        .collect();

    let columns_to_change_type = expected
        .columns
        .iter()
        .filter(|(name, expected_type)| {
            observed
                .columns
                .get(*name)
                .is_some_and(|observed_type| observed_type != *expected_type)
        })
        .map(|(name, _)| name.clone())
        .collect();

    AlterTableReport {
        columns_to_add,
        columns_to_remove,
        columns_to_change_type,
        is_modern_format,
    }
}
