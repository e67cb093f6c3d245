//! Error types for FluxSink

use crate::StreamDescriptor;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias for FluxSink operations
pub type Result<T> = std::result::Result<T, SinkError>;

/// FluxSink error types
///
/// Errors are cloneable so the first captured failure can be handed to the
/// front-end, the workers and the final `close()` caller alike.
#[derive(Error, Debug, Clone)]
pub enum SinkError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    /// JSON (de)serialization failed
    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    /// Inbound message is malformed or of an unsupported type
    #[error("Classification error: {0}")]
    Classification(String),

    /// Record references a stream missing from the configured catalog
    #[error("Unknown stream: {0}")]
    UnknownStream(String),

    /// The pluggable data transform rejected a record
    #[error("Transform failed for stream {stream}: {message}")]
    Transform {
        stream: StreamDescriptor,
        message: String,
    },

    /// Persisting a batch failed
    #[error("Flush failed for stream {stream}: {message}")]
    Flush { stream: String, message: String },

    /// Emitting a durable checkpoint downstream failed
    #[error("Checkpoint emission failed: {0}")]
    Emit(String),

    /// Schema reconciliation error
    #[error("Schema error: {0}")]
    Schema(String),

    /// Schema lifecycle (prepare / type-and-dedupe / commit / cleanup) error
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The pipeline was cancelled before the operation could complete
    #[error("Pipeline cancelled: {0}")]
    Cancelled(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for SinkError {
    fn from(err: std::io::Error) -> Self {
        SinkError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for SinkError {
    fn from(err: serde_json::Error) -> Self {
        SinkError::Json(Arc::new(err))
    }
}

impl SinkError {
    /// Check if the error came out of a persistence call
    pub fn is_flush_failure(&self) -> bool {
        matches!(self, SinkError::Flush { .. } | SinkError::Io(_))
    }

    /// Check if the error aborts the whole run
    ///
    /// Only cancellation notices are non-fatal: they echo a failure that was
    /// already recorded elsewhere.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SinkError::Cancelled(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_predicates() {
        let flush = SinkError::Flush {
            stream: "public.users".into(),
            message: "connection reset".into(),
        };
        assert!(flush.is_flush_failure());
        assert!(flush.is_fatal());

        let cancelled = SinkError::Cancelled("first failure recorded".into());
        assert!(!cancelled.is_fatal());
        assert!(!cancelled.is_flush_failure());
    }

    #[test]
    fn test_io_error_is_cloneable() {
        let err: SinkError = std::io::Error::new(std::io::ErrorKind::Other, "disk full").into();
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
        assert!(copy.is_flush_failure());
    }
}
