//! Explicit one-time initialization context, replacing process-wide global
//! state with a value the caller constructs and threads through explicitly.
//!
//! The original core relies on process-wide signal-handler registration,
//! the object store's thread-unsafe internals, and static libdnf globals.
//! Here that's bundled into a lazily-invoked init guard, and the resulting
//! context is threaded explicitly into every operation instead of being
//! read back out of statics.

use once_cell::sync::OnceCell;

static INIT: OnceCell<()> = OnceCell::new();

/// Process-wide setup that must run exactly once before any upgrader
/// operation: installing the `tracing` subscriber (when the host hasn't
/// already), and anything else that would otherwise be a global side
/// effect. Idempotent — later calls are no-ops.
pub fn ensure_initialized() {
    INIT.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Bundles the handles an upgrade run needs so call sites pass one value
/// instead of reaching for ambient globals (design note 9).
pub struct UpgradeContext<'a> {
    pub store: &'a dyn crate::store::ObjectStore,
    pub solver: &'a dyn crate::solver::Solver,
    pub sink: &'a dyn crate::progress::ProgressSink,
    pub cancel: crate::cancel::CancelHandle,
}

impl<'a> UpgradeContext<'a> {
    pub fn new(
        store: &'a dyn crate::store::ObjectStore,
        solver: &'a dyn crate::solver::Solver,
        sink: &'a dyn crate::progress::ProgressSink,
    ) -> Self {
        ensure_initialized();
        UpgradeContext {
            store,
            solver,
            sink,
            cancel: crate::cancel::CancelHandle::new(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::progress::SilentSink;
    use crate::solver::TrivialSolver;
    use crate::store::MemoryStore;

    #[test]
    fn ensure_initialized_is_idempotent() {
        ensure_initialized();
        ensure_initialized();
    }

    #[test]
    fn context_construction_does_not_panic() {
        let store = MemoryStore::new();
        let solver = TrivialSolver;
        let sink = SilentSink;
        let ctx = UpgradeContext::new(&store, &solver, &sink);
        assert!(!ctx.cancel.is_cancelled());
    }
}
