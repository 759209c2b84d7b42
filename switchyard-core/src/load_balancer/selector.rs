//! Load Balancing Selector logic

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::domain::backend::SharedBackend;
use crate::domain::registry::BackendRegistry;

/// How a backend is chosen among the currently HEALTHY ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionPolicy {
    /// Cycle through eligible backends in registry order.
    #[default]
    RoundRobin,
    /// Pick uniformly at random.
    Random,
}

/// Picks one eligible backend per new connection.
#[derive(Debug)]
pub struct Selector {
    policy: SelectionPolicy,
    cursor: AtomicUsize,
}

impl Selector {
    /// Create a selector applying `policy`.
    pub fn new(policy: SelectionPolicy) -> Self {
        Self {
            policy,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Select a HEALTHY backend, or `None` when there is none.
    ///
    /// The round-robin cursor only advances when a backend is returned.
    pub fn select(&self, registry: &BackendRegistry) -> Option<SharedBackend> {
        let eligible = registry.healthy();
        if eligible.is_empty() {
            return None;
        }

        let index = match self.policy {
            SelectionPolicy::RoundRobin => {
                self.cursor.fetch_add(1, Ordering::Relaxed) % eligible.len()
            }
            SelectionPolicy::Random => rand::thread_rng().gen_range(0..eligible.len()),
        };
        eligible.get(index).cloned()
    }
}
