//! Flush scheduling: candidate selection, worker pool, failure capture

mod failure;
mod selector;
mod workers;

pub use failure::FailureSink;
pub use selector::{FlushSelector, SelectorConfig};
pub use workers::{FlushWorkers, WorkerConfig};

use parking_lot::{Condvar, Mutex};

/// Flush state of one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushState {
    /// Not being flushed
    #[default]
    Idle,
    /// Held by exactly one worker
    Flushing,
    /// A flush failed; terminal for the run
    Failed,
}

/// Wakes idle workers on new data, memory pressure, timer ticks or shutdown.
///
/// Waiters pass the generation observed before they looked for work, so a
/// notification that lands between the check and the wait is not lost.
#[derive(Default)]
pub struct WakeSignal {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl WakeSignal {
    /// Create a signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Current generation
    pub fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    /// Wake one waiter
    pub fn notify_one(&self) {
        let mut generation = self.generation.lock();
        *generation += 1;
        self.cond.notify_one();
    }

    /// Wake every waiter
    pub fn notify_all(&self) {
        let mut generation = self.generation.lock();
        *generation += 1;
        self.cond.notify_all();
    }

    /// Block until the generation moves past `seen`
    pub fn wait_since(&self, seen: u64) {
        let mut generation = self.generation.lock();
        while *generation == seen {
            self.cond.wait(&mut generation);
        }
    }
}
