//! Periodic probing of every backend and publication of its health.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::config::HealthConfig;
use switchyard_core::domain::backend::{HealthStatus, SharedBackend};
use switchyard_core::domain::registry::SharedBackendRegistry;
use switchyard_core::health::{Hysteresis, ProbeOutcome, Transition};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::prober::probe_metrics;

/// Probes each backend's metrics endpoint once per interval.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    registry: SharedBackendRegistry,
    hysteresis: Hysteresis,
    interval: Duration,
    timeout: Duration,
    metrics_port: u16,
    metrics_path: Arc<str>,
}

impl HealthMonitor {
    /// Monitor the backends in `registry` with the given settings.
    pub fn new(registry: SharedBackendRegistry, config: &HealthConfig) -> Self {
        Self {
            registry,
            hysteresis: config.hysteresis(),
            interval: config.interval(),
            timeout: config.timeout(),
            metrics_port: config.metrics_port,
            metrics_path: Arc::from(config.metrics_path.as_str()),
        }
    }

    /// Run forever on the current runtime, probing immediately and then every interval.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.probe_round().await;
            }
        })
    }

    /// Probe every backend concurrently and apply the results.
    ///
    /// Returns the status changes of this round.
    pub async fn probe_round(&self) -> Vec<Transition> {
        let mut probes = JoinSet::new();
        for backend in self.registry.snapshot().iter() {
            let backend = Arc::clone(backend);
            let addr = SocketAddr::from((backend.ip, self.metrics_port));
            let path = Arc::clone(&self.metrics_path);
            let timeout = self.timeout;
            probes.spawn(async move {
                let outcome = match probe_metrics(addr, &path, timeout).await {
                    Ok(cpu_percent) => ProbeOutcome::Metrics { cpu_percent },
                    Err(e) => ProbeOutcome::Failed { reason: e.to_string() },
                };
                (backend, outcome)
            });
        }

        let mut transitions = Vec::new();
        while let Some(joined) = probes.join_next().await {
            let (backend, outcome) = match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "probe task failed");
                    continue;
                }
            };
            debug!(id = %backend.id, backend = %backend.ip, ?outcome, "probe finished");
            if let Some(transition) = self.hysteresis.apply(&backend, &outcome) {
                log_transition(&backend, &transition, &outcome);
                transitions.push(transition);
            }
        }

        self.log_status();
        transitions
    }

    fn log_status(&self) {
        let backends = self.registry.snapshot();
        let active: Vec<String> = backends
            .iter()
            .filter(|b| b.is_healthy())
            .map(|b| b.ip.to_string())
            .collect();
        info!(
            active = %active.join(","),
            backends = %status_line(&backends),
            "{}/{} backends active",
            active.len(),
            backends.len()
        );
    }
}

/// One `id@ip=STATUS(cpu%)` entry per backend, in registry order.
fn status_line(backends: &[SharedBackend]) -> String {
    backends
        .iter()
        .map(|b| {
            let health = b.health();
            format!("{}@{}={}({:.1}%)", b.id, b.ip, health.status, health.cpu_percent)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn log_transition(backend: &SharedBackend, transition: &Transition, outcome: &ProbeOutcome) {
    let (id, ip) = (backend.id, backend.ip);
    let cpu = transition.cpu_percent;
    match (transition.from, transition.to) {
        (_, HealthStatus::Down) => {
            let reason = match outcome {
                ProbeOutcome::Failed { reason } => reason.as_str(),
                ProbeOutcome::Metrics { .. } => "",
            };
            error!(%id, backend = %ip, %reason, "backend is DOWN");
        }
        (_, HealthStatus::Overloaded) => {
            warn!(
                %id,
                backend = %ip,
                cpu_percent = cpu,
                "backend OVERLOADED, skipping it for new connections"
            );
        }
        (HealthStatus::Down, HealthStatus::Healthy) => {
            info!(%id, backend = %ip, cpu_percent = cpu, "backend recovered");
        }
        (_, HealthStatus::Healthy) => {
            info!(%id, backend = %ip, cpu_percent = cpu, "backend recovered from load");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health_check::prober::testing::metrics_server;
    use hyper::StatusCode;
    use switchyard_core::config::{BackendConfig, ControllerConfig};
    use switchyard_core::MacAddr;

    fn monitor(port: u16, hosts: &[[u8; 4]]) -> (HealthMonitor, SharedBackendRegistry) {
        let mut config = ControllerConfig::default();
        config.backends = hosts
            .iter()
            .map(|ip| BackendConfig {
                ip: (*ip).into(),
                mac: MacAddr([0, 0, 0, 0, ip[2], ip[3]]),
            })
            .collect();
        config.health.metrics_port = port;
        config.health.timeout_ms = 300;
        let registry = config.build_registry();
        (HealthMonitor::new(Arc::clone(&registry), &config.health), registry)
    }

    #[tokio::test]
    async fn status_line_names_each_backend() {
        let addr = metrics_server("127.0.0.1", StatusCode::OK, r#"{"cpu_percent": 12.5}"#).await;
        let (monitor, registry) = monitor(addr.port(), &[[127, 0, 0, 1], [127, 0, 0, 2]]);

        monitor.probe_round().await;

        assert_eq!(
            status_line(&registry.snapshot()),
            "backend-0@127.0.0.1=HEALTHY(12.5%) backend-1@127.0.0.2=DOWN(0.0%)"
        );
    }

    #[tokio::test]
    async fn unreachable_backend_goes_down() {
        let addr = metrics_server("127.0.0.1", StatusCode::OK, r#"{"cpu_percent": 10}"#).await;
        let (monitor, registry) = monitor(addr.port(), &[[127, 0, 0, 1], [127, 0, 0, 2]]);

        let transitions = monitor.probe_round().await;

        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].to, HealthStatus::Down);
        let healthy = registry.healthy();
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].ip.octets(), [127, 0, 0, 1]);
        assert_eq!(healthy[0].health().cpu_percent, 10.0);
    }

    #[tokio::test]
    async fn busy_backend_is_overloaded_and_stays_out() {
        let addr = metrics_server("127.0.0.1", StatusCode::OK, r#"{"cpu_percent": 93.5}"#).await;
        let (monitor, registry) = monitor(addr.port(), &[[127, 0, 0, 1]]);

        let first = monitor.probe_round().await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].from, HealthStatus::Healthy);
        assert_eq!(first[0].to, HealthStatus::Overloaded);

        assert!(monitor.probe_round().await.is_empty());
        assert!(registry.healthy().is_empty());
    }

    #[tokio::test]
    async fn spawned_monitor_probes_immediately() {
        let addr = metrics_server("127.0.0.1", StatusCode::OK, "{}").await;
        let (monitor, registry) = monitor(addr.port(), &[[127, 0, 0, 1]]);

        let handle = monitor.spawn();
        for _ in 0..50 {
            if registry.healthy().is_empty() {
                break;
            }
            time::sleep(Duration::from_millis(20)).await;
        }
        handle.abort();

        // A report without cpu_percent reads as 100%.
        let backends = registry.snapshot();
        assert_eq!(backends[0].status(), HealthStatus::Overloaded);
    }
}
