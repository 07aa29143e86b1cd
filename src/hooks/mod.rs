//
// Process-wide hook registries. Each registry is an append-only vector of
// callbacks populated once at startup; every callback failure is logged and
// swallowed so plugins can never break an engine operation.
//
pub mod audit;
pub mod conditional;
pub mod metrics;
pub mod notifications;

use std::sync::{Arc, RwLock};

pub(crate) struct Registry<T: ?Sized> {
    name: &'static str,
    hooks: RwLock<Vec<Arc<T>>>,
}

impl<T: ?Sized> Registry<T> {
    pub(crate) const fn new(name: &'static str) -> Self {
        Self {
            name,
            hooks: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn register(&self, hook: Arc<T>) {
        self.hooks.write().expect("Hook registry poisoned").push(hook);
        debug!("Registered a {} hook", self.name);
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<T>> {
        self.hooks.read().expect("Hook registry poisoned").clone()
    }

    /// Runs `f` over every hook, logging failures and carrying on
    pub(crate) fn dispatch<F>(&self, what: &str, mut f: F)
    where
        F: FnMut(&T) -> crate::error::EmptyResult,
    {
        for hook in self.snapshot() {
            if let Err(e) = f(&hook) {
                warn!("Failed to run {} hook ({what}): {e:#?}", self.name);
            }
        }
    }
}

/// Registers the built-in hooks. Deployments that stream to an external
/// system register their own before this, or instead of it.
pub fn init_defaults() {
    notifications::register(Arc::new(notifications::LogNotifier));
    audit::register(Arc::new(audit::LogAuditSink));
    metrics::register(Arc::new(metrics::LogMetricsSink));
}
