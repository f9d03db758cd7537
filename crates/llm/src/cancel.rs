//! Cooperative cancellation for long-running research operations.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A cheap, clonable cancellation flag.
///
/// The control loop checks the token at every suspension point (LLM call,
/// embedding call, store call, tool invocation) and winds down cleanly when
/// it trips.  Cancellation is cooperative: nothing is interrupted mid-flight,
/// the current operation finishes or errors and the loop stops afterwards.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the token.  Idempotent; all clones observe the flag.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
