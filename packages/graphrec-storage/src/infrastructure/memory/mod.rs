//! In-memory backends for every port
//!
//! Used by unit tests and single-process deployments. Each store can be
//! switched into a failing state to exercise degradation paths.

mod coordination;
mod graph;
mod read_models;
mod stream;

pub use coordination::{InMemoryCheckpointStore, InMemoryIdempotencyStore, InMemoryLeaseStore};
pub use graph::InMemoryGraphStore;
pub use read_models::{InMemoryCacheStore, InMemorySearchIndex};
pub use stream::{InMemoryDeadLetters, InMemoryEventLog};

use crate::error::{Result, StorageError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Switch that makes a store report `Unavailable`
#[derive(Debug, Default)]
pub struct FaultSwitch {
    down: AtomicBool,
    failing_calls: AtomicUsize,
}

impl FaultSwitch {
    /// Fail every call until `set_down(false)`
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Fail the next `n` calls, then recover
    pub fn fail_next(&self, n: usize) {
        self.failing_calls.store(n, Ordering::SeqCst);
    }

    pub(crate) fn check(&self, what: &str) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StorageError::unavailable(format!("{} is down", what)));
        }
        let consumed = self
            .failing_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if consumed.is_ok() {
            return Err(StorageError::unavailable(format!(
                "{} injected failure",
                what
            )));
        }
        Ok(())
    }
}
