//! CPU-driven health classification with hysteresis.
//!
//! The monitor feeds one [`ProbeOutcome`] per backend per round into
//! [`Hysteresis::apply`], which publishes the new status/CPU pair and reports
//! the edge, if any, so the caller can log it once.

use crate::domain::backend::{Backend, HealthSnapshot, HealthStatus};

/// CPU percentage assumed when a metrics report omits the field.
pub const MISSING_CPU_PERCENT: f64 = 100.0;

/// Result of probing one backend's metrics endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    /// The endpoint answered with a CPU reading.
    Metrics {
        /// Reported CPU percentage.
        cpu_percent: f64,
    },
    /// Timeout, connection failure, bad status or malformed body.
    Failed {
        /// Human-readable cause, for logs.
        reason: String,
    },
}

/// A status change produced by one probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    /// Status before the probe.
    pub from: HealthStatus,
    /// Status after the probe.
    pub to: HealthStatus,
    /// CPU after the probe (unchanged on failure).
    pub cpu_percent: f64,
}

/// Overload/recovery thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hysteresis {
    /// A HEALTHY backend reporting strictly more than this becomes OVERLOADED.
    pub overload_above: f64,
    /// An OVERLOADED backend reporting strictly less than this becomes HEALTHY.
    pub recover_below: f64,
}

impl Default for Hysteresis {
    fn default() -> Self {
        Self {
            overload_above: 80.0,
            recover_below: 50.0,
        }
    }
}

impl Hysteresis {
    /// Status after a successful probe reporting `cpu_percent`.
    ///
    /// Any status other than OVERLOADED collapses to HEALTHY on success, so a
    /// DOWN backend comes back HEALTHY even when it reports high load; it is
    /// only marked OVERLOADED on the following probe.
    pub fn next_status(&self, current: HealthStatus, cpu_percent: f64) -> HealthStatus {
        match current {
            HealthStatus::Healthy if cpu_percent > self.overload_above => HealthStatus::Overloaded,
            HealthStatus::Overloaded if cpu_percent < self.recover_below => HealthStatus::Healthy,
            HealthStatus::Overloaded => HealthStatus::Overloaded,
            HealthStatus::Healthy | HealthStatus::Down => HealthStatus::Healthy,
        }
    }

    /// Fold `outcome` into `backend`'s health and return the edge, if any.
    pub fn apply(&self, backend: &Backend, outcome: &ProbeOutcome) -> Option<Transition> {
        let current = backend.health();
        let next = match outcome {
            ProbeOutcome::Metrics { cpu_percent } => HealthSnapshot {
                status: self.next_status(current.status, *cpu_percent),
                cpu_percent: *cpu_percent,
            },
            ProbeOutcome::Failed { .. } => HealthSnapshot {
                status: HealthStatus::Down,
                cpu_percent: current.cpu_percent,
            },
        };
        backend.set_health(next);

        (next.status != current.status).then_some(Transition {
            from: current.status,
            to: next.status,
            cpu_percent: next.cpu_percent,
        })
    }
}
