//! Flush candidate selection

use super::FlushState;
use crate::buffer::{BufferSnapshot, BufferStore};
use crate::memory::MemoryManager;
use crate::StreamDescriptor;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Selection thresholds
#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Buffers at or above this size are flushed on size alone
    pub min_batch_bytes: u64,
    /// Non-empty buffers idle this long are flushed regardless of size
    pub max_buffer_age: Duration,
    /// Memory usage ratio that disables the size threshold
    pub memory_pressure_ratio: f64,
}

/// Picks the next stream to flush and owns every stream's [`FlushState`]
pub struct FlushSelector {
    config: SelectorConfig,
    buffers: Arc<BufferStore>,
    memory: Arc<MemoryManager>,
    states: Mutex<HashMap<StreamDescriptor, FlushState>>,
}

impl FlushSelector {
    /// Create a selector over `buffers`
    pub fn new(config: SelectorConfig, buffers: Arc<BufferStore>, memory: Arc<MemoryManager>) -> Self {
        Self {
            config,
            buffers,
            memory,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Select a stream and mark it `Flushing` in one step.
    ///
    /// With `drain` set every non-empty idle buffer is eligible, largest first.
    /// Returns `None` when no stream qualifies.
    pub fn select_next(&self, drain: bool) -> Option<StreamDescriptor> {
        let mut states = self.states.lock();

        let eligible: Vec<BufferSnapshot> = self
            .buffers
            .snapshots()
            .into_iter()
            .filter(|s| states.get(&s.stream).copied().unwrap_or_default() == FlushState::Idle)
            .collect();
        if eligible.is_empty() {
            return None;
        }

        let ignore_threshold =
            drain || self.memory.is_under_pressure(self.config.memory_pressure_ratio);
        let stream = pick_candidate(&eligible, &self.config, ignore_threshold)?;

        debug!(stream = %stream, drain, ignore_threshold, "Selected stream for flush");
        states.insert(stream.clone(), FlushState::Flushing);
        Some(stream)
    }

    /// Release a stream after its flush completed successfully
    pub fn finish(&self, stream: &StreamDescriptor) {
        let mut states = self.states.lock();
        if let Some(state) = states.get_mut(stream) {
            if *state == FlushState::Flushing {
                *state = FlushState::Idle;
            }
        }
    }

    /// Mark a stream failed; it is never selected again
    pub fn mark_failed(&self, stream: &StreamDescriptor) {
        self.states.lock().insert(stream.clone(), FlushState::Failed);
    }

    /// Current state of a stream
    pub fn state(&self, stream: &StreamDescriptor) -> FlushState {
        self.states.lock().get(stream).copied().unwrap_or_default()
    }

    /// Number of streams currently being flushed
    pub fn flushing_count(&self) -> usize {
        self.states
            .lock()
            .values()
            .filter(|s| **s == FlushState::Flushing)
            .count()
    }
}

/// Policy over eligible buffers.
///
/// Largest buffer above `min_batch_bytes` wins; otherwise the buffer idle
/// the longest, provided it reached `max_buffer_age`. When the threshold is
/// ignored (drain or memory pressure) the largest buffer wins outright.
fn pick_candidate(
    eligible: &[BufferSnapshot],
    config: &SelectorConfig,
    ignore_threshold: bool,
) -> Option<StreamDescriptor> {
    let largest = eligible.iter().max_by_key(|s| s.queued_bytes);

    if ignore_threshold {
        return largest.map(|s| s.stream.clone());
    }

    if let Some(s) = largest.filter(|s| s.queued_bytes >= config.min_batch_bytes) {
        return Some(s.stream.clone());
    }

    eligible
        .iter()
        .filter(|s| s.idle_for >= config.max_buffer_age)
        .max_by_key(|s| s.idle_for)
        .map(|s| s.stream.clone())
}
