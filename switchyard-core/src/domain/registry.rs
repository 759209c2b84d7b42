//! The fixed set of backends behind the virtual service.

use std::sync::Arc;

use crate::domain::backend::SharedBackend;

/// An ordered registry of backends, fixed at startup.
///
/// The health monitor writes through each backend's own health snapshot while
/// packet-in handling reads; neither side takes a lock.
#[derive(Debug)]
pub struct BackendRegistry {
    backends: Arc<[SharedBackend]>,
}

impl BackendRegistry {
    /// Create a registry from the configured backends, preserving their order.
    pub fn new(backends: Vec<SharedBackend>) -> Self {
        Self {
            backends: backends.into(),
        }
    }

    /// All backends in registry order (e.g., for the health monitor).
    pub fn snapshot(&self) -> Arc<[SharedBackend]> {
        Arc::clone(&self.backends)
    }

    /// Backends currently eligible for new connections, in registry order.
    pub fn healthy(&self) -> Vec<SharedBackend> {
        self.backends.iter().filter(|b| b.is_healthy()).cloned().collect()
    }

    /// Number of configured backends.
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Whether no backends are configured.
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

/// A shared reference to the backend registry.
pub type SharedBackendRegistry = Arc<BackendRegistry>;
