//! Backend server models.

use arc_swap::ArcSwap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::domain::addr::MacAddr;

/// A unique identifier for a backend server, its position in the configured list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendId(pub u32);

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backend-{}", self.0)
    }
}

/// Controller-tracked availability of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthStatus {
    /// Eligible for new connections.
    Healthy,
    /// Reachable but above the CPU threshold; skipped until it cools down.
    Overloaded,
    /// The last metrics probe failed.
    Down,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthStatus::Healthy => "HEALTHY",
            HealthStatus::Overloaded => "OVERLOADED",
            HealthStatus::Down => "DOWN",
        })
    }
}

/// The mutable half of a backend, always read and written as one unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthSnapshot {
    /// Current classification.
    pub status: HealthStatus,
    /// CPU percentage reported by the last successful probe.
    pub cpu_percent: f64,
}

/// Represents a single upstream backend server
#[derive(Debug)]
pub struct Backend {
    /// The unique ID of the backend
    pub id: BackendId,
    /// The IPv4 address the virtual service is rewritten to
    pub ip: Ipv4Addr,
    /// The hardware address used to find the backend's switch port
    pub mac: MacAddr,
    /// Status and CPU, swapped together so readers never see a torn pair
    health: ArcSwap<HealthSnapshot>,
}

impl Backend {
    /// Create a new backend
    pub fn new(id: BackendId, ip: Ipv4Addr, mac: MacAddr) -> Self {
        Self {
            id,
            ip,
            mac,
            // assume healthy until the first probe says otherwise
            health: ArcSwap::from_pointee(HealthSnapshot {
                status: HealthStatus::Healthy,
                cpu_percent: 0.0,
            }),
        }
    }

    /// A consistent copy of the current status and CPU reading.
    pub fn health(&self) -> HealthSnapshot {
        **self.health.load()
    }

    /// Shorthand for `health().status`.
    pub fn status(&self) -> HealthStatus {
        self.health.load().status
    }

    /// Check if the backend may receive new connections
    pub fn is_healthy(&self) -> bool {
        self.status() == HealthStatus::Healthy
    }

    /// Publish a new status/CPU pair.
    pub fn set_health(&self, snapshot: HealthSnapshot) {
        self.health.store(Arc::new(snapshot));
    }
}

/// A thread-safe reference to a Backend.
pub type SharedBackend = Arc<Backend>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn backend() -> Backend {
        Backend::new(BackendId(0), Ipv4Addr::new(10, 0, 0, 2), MacAddr([0, 0, 0, 0, 0, 2]))
    }

    #[test]
    fn starts_healthy_with_zero_cpu() {
        let b = backend();
        assert!(b.is_healthy());
        assert_eq!(b.health().cpu_percent, 0.0);
    }

    #[test]
    fn id_and_status_display() {
        assert_eq!(BackendId(2).to_string(), "backend-2");
        assert_eq!(HealthStatus::Overloaded.to_string(), "OVERLOADED");
    }

    #[test]
    fn readers_never_observe_a_torn_pair() {
        let b = Arc::new(backend());
        // Every write keeps cpu == 90.0 iff status == Overloaded.
        thread::scope(|s| {
            let writer = Arc::clone(&b);
            s.spawn(move || {
                for i in 0..10_000 {
                    let snapshot = if i % 2 == 0 {
                        HealthSnapshot {
                            status: HealthStatus::Overloaded,
                            cpu_percent: 90.0,
                        }
                    } else {
                        HealthSnapshot {
                            status: HealthStatus::Healthy,
                            cpu_percent: 10.0,
                        }
                    };
                    writer.set_health(snapshot);
                }
            });
            for _ in 0..4 {
                let reader = Arc::clone(&b);
                s.spawn(move || {
                    for _ in 0..10_000 {
                        let h = reader.health();
                        assert_eq!(h.status == HealthStatus::Overloaded, h.cpu_percent == 90.0);
                    }
                });
            }
        });
    }
}
