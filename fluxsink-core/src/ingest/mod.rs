//! Inbound message deserialization and classification
//!
//! Each line of the inbound stream is one protocol message. Records are
//! transformed and re-serialized, and only the serialized form is buffered.
//! States are kept as the original line so they round-trip unchanged.

mod transform;

pub use transform::{IdentityTransformer, Transformer};

use crate::buffer::BufferedRecord;
use crate::state::{Checkpoint, CheckpointScope};
use crate::{Result, SinkError, StreamDescriptor};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;

/// A classified inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A data record, already serialized
    Record(BufferedRecord),
    /// A checkpoint marker
    Checkpoint(Checkpoint),
}

/// Only the fields the engine needs; everything else stays opaque
#[derive(Debug, Deserialize)]
struct PartialMessage {
    #[serde(rename = "type")]
    message_type: String,
    record: Option<PartialRecord>,
    state: Option<PartialState>,
}

#[derive(Debug, Deserialize)]
struct PartialRecord {
    #[serde(default)]
    namespace: Option<String>,
    stream: String,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    emitted_at: i64,
    #[serde(default)]
    meta: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct PartialState {
    #[serde(rename = "type", default)]
    state_type: Option<String>,
    #[serde(default)]
    stream: Option<PartialStreamState>,
}

#[derive(Debug, Deserialize)]
struct PartialStreamState {
    stream_descriptor: StreamDescriptor,
}

/// Parse and classify one inbound message.
///
/// Unknown message types, records without data and malformed JSON are
/// classification errors. Transform failures are reported as
/// [`SinkError::Transform`] for the record's stream.
pub fn deserialize_message(line: &str, transformer: &dyn Transformer) -> Result<Message> {
    let partial: PartialMessage = serde_json::from_str(line)
        .map_err(|e| SinkError::Classification(format!("unable to deserialize message: {}", e)))?;

    match partial.message_type.as_str() {
        "RECORD" => {
            let record = partial.record.ok_or_else(|| {
                SinkError::Classification("RECORD message without a record".to_string())
            })?;
            classify_record(record, transformer)
        }
        "STATE" => {
            let state = partial.state.ok_or_else(|| {
                SinkError::Classification("STATE message without a state".to_string())
            })?;
            Ok(Message::Checkpoint(Checkpoint::new(
                line.trim(),
                checkpoint_scope(state),
            )))
        }
        other => Err(SinkError::Classification(format!(
            "unsupported message type: {}",
            other
        ))),
    }
}

fn classify_record(record: PartialRecord, transformer: &dyn Transformer) -> Result<Message> {
    let stream = StreamDescriptor {
        namespace: record.namespace,
        name: record.stream,
    };

    let data = record.data.ok_or_else(|| {
        SinkError::Classification(format!("record for {} has no data", stream))
    })?;

    let (data, meta) = transformer
        .transform(&stream, data, record.meta)
        .map_err(|e| match e {
            SinkError::Transform { .. } => e,
            other => SinkError::Transform {
                stream: stream.clone(),
                message: other.to_string(),
            },
        })?;

    // Only the serialized form is kept in memory from here on.
    let serialized = serde_json::to_vec(&data)?;

    Ok(Message::Record(BufferedRecord {
        stream,
        data: Bytes::from(serialized),
        meta,
        emitted_at: record.emitted_at,
    }))
}

fn checkpoint_scope(state: PartialState) -> CheckpointScope {
    match (state.state_type.as_deref(), state.stream) {
        (Some("STREAM"), Some(stream)) => CheckpointScope::Stream(stream.stream_descriptor),
        _ => CheckpointScope::Global,
    }
}
