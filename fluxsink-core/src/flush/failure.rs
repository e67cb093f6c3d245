//! First-failure-wins error capture

use super::WakeSignal;
use crate::memory::MemoryManager;
use crate::SinkError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

/// Collects the first fatal error and cancels the pipeline
pub struct FailureSink {
    first: Mutex<Option<SinkError>>,
    failed: AtomicBool,
    memory: Arc<MemoryManager>,
    signal: Arc<WakeSignal>,
}

impl FailureSink {
    /// Create a sink that cancels `memory` and wakes `signal` on failure
    pub fn new(memory: Arc<MemoryManager>, signal: Arc<WakeSignal>) -> Self {
        Self {
            first: Mutex::new(None),
            failed: AtomicBool::new(false),
            memory,
            signal,
        }
    }

    /// Record an error. Returns `true` if it is the first one.
    ///
    /// The first error cancels pending memory requests (unblocking the
    /// front-end) and wakes every worker so they stop selecting streams.
    /// Later errors are logged and discarded.
    pub fn record(&self, err: SinkError) -> bool {
        {
            let mut first = self.first.lock();
            if first.is_some() {
                warn!("Discarding error after first failure: {}", err);
                return false;
            }
            error!("Pipeline failed: {}", err);
            *first = Some(err);
            self.failed.store(true, Ordering::SeqCst);
        }

        self.memory.cancel();
        self.signal.notify_all();
        true
    }

    /// Check if a failure was recorded
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// The first recorded error
    pub fn first_error(&self) -> Option<SinkError> {
        self.first.lock().clone()
    }

    /// `Err` with a cancellation notice if the pipeline already failed
    pub fn check(&self) -> crate::Result<()> {
        match self.first_error() {
            Some(err) => Err(SinkError::Cancelled(err.to_string())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StreamDescriptor;

    fn failure_sink() -> (FailureSink, Arc<MemoryManager>) {
        let memory = Arc::new(MemoryManager::new(100));
        (
            FailureSink::new(memory.clone(), Arc::new(WakeSignal::new())),
            memory,
        )
    }

    #[test]
    fn test_first_failure_wins() {
        let (sink, _) = failure_sink();
        assert!(sink.check().is_ok());

        assert!(sink.record(SinkError::Flush {
            stream: "z".into(),
            message: "first".into(),
        }));
        assert!(!sink.record(SinkError::Flush {
            stream: "z".into(),
            message: "second".into(),
        }));

        assert!(sink.is_failed());
        match sink.first_error() {
            Some(SinkError::Flush { message, .. }) => assert_eq!(message, "first"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(matches!(sink.check(), Err(SinkError::Cancelled(_))));
    }

    #[test]
    fn test_failure_cancels_memory() {
        let (sink, memory) = failure_sink();
        sink.record(SinkError::Internal("boom".into()));
        assert!(!memory.request_allocation(&StreamDescriptor::new("a"), 1));
    }
}
