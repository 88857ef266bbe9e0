//! Registry of spawned child processes

use crate::runtime::process::ProcessHandle;
use indexmap::IndexMap;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

static GLOBAL: LazyLock<ProcessRegistry> = LazyLock::new(ProcessRegistry::new);

/// Logical child name to process handle.
///
/// Cloning shares the same entries. Entries are never removed; teardown
/// goes through [`ShutdownManager`](crate::runtime::ShutdownManager) or
/// the harness.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    entries: Arc<Mutex<IndexMap<String, Arc<dyn ProcessHandle>>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry, created on first use
    pub fn global() -> ProcessRegistry {
        GLOBAL.clone()
    }

    /// Track `handle` under `name`; a later registration for the same name wins
    pub fn register(&self, name: impl Into<String>, handle: Arc<dyn ProcessHandle>) {
        let name = name.into();
        log::debug!("Tracking child '{}' (PID {:?})", name, handle.pid());
        if let Some(previous) = self.lock().insert(name.clone(), handle) {
            log::debug!(
                "Child '{}' replaced previous handle (PID {:?})",
                name,
                previous.pid()
            );
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProcessHandle>> {
        self.lock().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Registered entries in registration order
    pub fn snapshot(&self) -> Vec<(String, Arc<dyn ProcessHandle>)> {
        self.lock()
            .iter()
            .map(|(name, handle)| (name.clone(), Arc::clone(handle)))
            .collect()
    }

    // Shutdown may run while another thread panicked holding the lock;
    // the map itself stays consistent, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, IndexMap<String, Arc<dyn ProcessHandle>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
