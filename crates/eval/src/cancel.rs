//! Cancellation and deadlines.
//!
//! A cancel token is shared between the caller and the evaluator. The
//! evaluator checks it between expressions; deadlines are observed
//! through the same token, so there is no internal wall-clock
//! enforcement.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Observed by the evaluator between expressions.
pub trait Cancel: Send + Sync {
    fn cancelled(&self) -> bool;
}

/// A cancel token with an optional deadline.
#[derive(Debug)]
pub struct CancelHandle {
    flag: AtomicBool,
    deadline: Option<Instant>,
}

impl CancelHandle {
    pub fn new() -> Self {
        CancelHandle {
            flag: AtomicBool::new(false),
            deadline: None,
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        CancelHandle {
            flag: AtomicBool::new(false),
            deadline: Some(deadline),
        }
    }

    /// Request cancellation. Safe to call from another thread.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        CancelHandle::new()
    }
}

impl Cancel for CancelHandle {
    fn cancelled(&self) -> bool {
        if self.flag.load(Ordering::Relaxed) {
            return true;
        }
        match self.deadline {
            Some(d) => Instant::now() >= d,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn cancel_flag_and_deadline() {
        let c = CancelHandle::new();
        assert!(!c.cancelled());
        c.cancel();
        assert!(c.cancelled());

        let expired = CancelHandle::with_deadline(Instant::now() - Duration::from_secs(1));
        assert!(expired.cancelled());
    }
}
