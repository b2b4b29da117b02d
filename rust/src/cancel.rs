//! Cooperative cancellation.
//!
//! No upgrader phase runs on its own thread; long-running I/O (pull,
//! import, checkout, commit, prune) polls a shared handle between logical
//! steps. There is no hard-interrupt: cancellation is only observed at the
//! poll points the long-running loop chooses to check.

use crate::error::{Result, UpgraderError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cheaply-cloneable cancellation flag, shared between the orchestrator
/// and whatever external caller (CLI, D-Bus) drives it.
#[derive(Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Poll point: returns `Err(UpgraderError::Cancelled)` if cancellation
    /// was requested since the handle was created.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(UpgraderError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cancels_are_observed() {
        let h = CancelHandle::new();
        assert!(h.check().is_ok());
        h.cancel();
        assert!(h.check().unwrap_err().is_cancelled());
    }

    #[test]
    fn clones_share_state() {
        let h = CancelHandle::new();
        let h2 = h.clone();
        h2.cancel();
        assert!(h.is_cancelled());
    }
}
