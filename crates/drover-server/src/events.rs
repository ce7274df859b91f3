//! Lifecycle event subscriptions.
//!
//! Hooks run synchronously on the thread that emits the event, in
//! subscription order. Emission continues with the next hook even if one
//! panics.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, warn};

/// Something notable that happened to the server or one of its workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Listeners are bound and the server is ready (pool ready or fleet
    /// spawned).
    Booted { clustered: bool },
    /// A worker process reported ready.
    WorkerBooted { index: usize, pid: u32, phase: u64 },
    /// A worker process exited without being asked to.
    WorkerCrashed { index: usize, pid: u32, status: String },
    /// A restart was requested.
    Restarting { phased: bool },
    /// The server finished shutting down.
    Stopped,
}

type Hook = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

/// Registered lifecycle hooks. Cheap to clone.
#[derive(Clone, Default)]
pub struct Events {
    hooks: Vec<Hook>,
}

impl Events {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook for every future event.
    pub fn subscribe<F>(&mut self, hook: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.hooks.push(Arc::new(hook));
    }

    pub fn emit(&self, event: LifecycleEvent) {
        debug!(?event, "lifecycle event");
        for hook in &self.hooks {
            if catch_unwind(AssertUnwindSafe(|| hook(&event))).is_err() {
                warn!(?event, "lifecycle hook panicked");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl std::fmt::Debug for Events {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Events").field("hooks", &self.hooks.len()).finish()
    }
}
