//! Pluggable record transforms

use crate::{Result, StreamDescriptor};
use serde_json::Value;

/// Rewrites a record's payload and metadata before it is buffered.
///
/// Must be deterministic and free of side effects visible to the engine.
pub trait Transformer: Send + Sync {
    /// Transform `data` and `meta` for `stream`
    fn transform(
        &self,
        stream: &StreamDescriptor,
        data: Value,
        meta: Option<Value>,
    ) -> Result<(Value, Option<Value>)>;
}

impl<F> Transformer for F
where
    F: Fn(&StreamDescriptor, Value, Option<Value>) -> Result<(Value, Option<Value>)> + Send + Sync,
{
    fn transform(
        &self,
        stream: &StreamDescriptor,
        data: Value,
        meta: Option<Value>,
    ) -> Result<(Value, Option<Value>)> {
        self(stream, data, meta)
    }
}

/// Passes records through unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTransformer;

impl Transformer for IdentityTransformer {
    fn transform(
        &self,
        _stream: &StreamDescriptor,
        data: Value,
        meta: Option<Value>,
    ) -> Result<(Value, Option<Value>)> {
        Ok((data, meta))
    }
}
