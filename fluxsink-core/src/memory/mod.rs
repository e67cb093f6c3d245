//! Global memory budget for buffered records
//!
//! Every enqueue asks the manager for the record's bytes first. When the
//! budget is exhausted the caller blocks until flushes release space, which
//! throttles ingestion to flush throughput.

use crate::StreamDescriptor;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

/// Process-wide byte budget
pub struct MemoryManager {
    limit: u64,
    inner: Mutex<MemoryState>,
    freed: Condvar,
}

#[derive(Default)]
struct MemoryState {
    used: u64,
    waiters: usize,
    cancelled: bool,
}

impl MemoryManager {
    /// Create a manager with a fixed limit in bytes
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            inner: Mutex::new(MemoryState::default()),
            freed: Condvar::new(),
        }
    }

    /// Block until `bytes` can be granted to `stream`.
    ///
    /// Returns `false` only when the manager was cancelled while waiting.
    /// A request larger than the whole limit is granted once nothing else is
    /// allocated, so a single oversized record cannot deadlock the pipeline.
    pub fn request_allocation(&self, stream: &StreamDescriptor, bytes: u64) -> bool {
        self.request_allocation_with(stream, bytes, || {})
    }

    /// Like [`request_allocation`](Self::request_allocation), calling
    /// `on_wait` before every wait.
    ///
    /// The requester is already counted as a waiter when `on_wait` runs, so
    /// anything it wakes observes the pressure. `on_wait` is called with the
    /// budget lock held and must not touch the manager.
    pub fn request_allocation_with(
        &self,
        stream: &StreamDescriptor,
        bytes: u64,
        mut on_wait: impl FnMut(),
    ) -> bool {
        let mut state = self.inner.lock();
        loop {
            if state.cancelled {
                return false;
            }
            if self.fits(&state, bytes) {
                state.used += bytes;
                return true;
            }

            debug!(stream = %stream, bytes, used = state.used, limit = self.limit, "Waiting for memory");
            state.waiters += 1;
            on_wait();
            self.freed.wait(&mut state);
            state.waiters -= 1;
        }
    }

    /// Grant `bytes` only if it fits right now
    pub fn try_request_allocation(&self, stream: &StreamDescriptor, bytes: u64) -> bool {
        let mut state = self.inner.lock();
        if state.cancelled || !self.fits(&state, bytes) {
            return false;
        }
        state.used += bytes;
        debug!(stream = %stream, bytes, used = state.used, "Granted memory");
        true
    }

    /// Return bytes previously granted to `stream`
    pub fn release(&self, stream: &StreamDescriptor, bytes: u64) {
        let mut state = self.inner.lock();

        if bytes > state.used {
            warn!(stream = %stream, bytes, used = state.used, "Releasing more memory than allocated");
        }
        state.used = state.used.saturating_sub(bytes);
        self.freed.notify_all();
    }

    /// Wake every blocked requester and refuse further allocations
    pub fn cancel(&self) {
        let mut state = self.inner.lock();
        state.cancelled = true;
        self.freed.notify_all();
    }

    /// Bytes currently allocated
    pub fn used(&self) -> u64 {
        self.inner.lock().used
    }

    /// Configured limit
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// True when a requester is blocked or usage crossed `ratio` of the limit
    pub fn is_under_pressure(&self, ratio: f64) -> bool {
        let state = self.inner.lock();
        state.waiters > 0 || (state.used as f64) >= (self.limit as f64) * ratio
    }

    fn fits(&self, state: &MemoryState, bytes: u64) -> bool {
        state.used == 0 || state.used.saturating_add(bytes) <= self.limit
    }
}
