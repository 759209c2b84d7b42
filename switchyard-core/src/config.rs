//! Process-wide static configuration.
//!
//! Every field has a default matching the reference deployment: virtual
//! service 10.0.0.100 / 00:00:00:00:00:fe fronting three backends on
//! 10.0.0.2-4, probed every 5 s with a 1 s timeout.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::domain::addr::MacAddr;
use crate::domain::backend::{Backend, BackendId};
use crate::domain::registry::BackendRegistry;
use crate::domain::service::VirtualService;
use crate::flow::FlowProgrammer;
use crate::health::Hysteresis;
use crate::load_balancer::selector::SelectionPolicy;

/// Rejected configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// The recovery threshold must sit below the overload threshold.
    #[error("recover_cpu_percent ({recover}) must be below overload_cpu_percent ({overload})")]
    ThresholdOrder {
        /// Configured recovery threshold.
        recover: f64,
        /// Configured overload threshold.
        overload: f64,
    },
    /// A duration or timeout that must be positive was zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    /// Two backends share an address.
    #[error("duplicate backend address {0}")]
    DuplicateBackend(String),
    /// A backend uses the virtual service's IP or MAC.
    #[error("backend {0} collides with the virtual service identity")]
    BackendIsVirtual(String),
    /// The metrics path is not absolute.
    #[error("metrics_path must start with '/': {0:?}")]
    MetricsPath(String),
}

/// Root of the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerConfig {
    /// Address the OpenFlow listener binds to.
    pub listen: SocketAddr,
    /// The virtual service identity.
    pub service: ServiceConfig,
    /// Backends in selection order.
    pub backends: Vec<BackendConfig>,
    /// Health monitor settings.
    pub health: HealthConfig,
    /// Flow idle timeouts.
    pub flows: FlowConfig,
    /// Backend selection.
    pub balancer: BalancerConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 6653)),
            service: ServiceConfig::default(),
            backends: (2u8..=4)
                .map(|n| BackendConfig {
                    ip: Ipv4Addr::new(10, 0, 0, n),
                    mac: MacAddr([0, 0, 0, 0, 0, n]),
                })
                .collect(),
            health: HealthConfig::default(),
            flows: FlowConfig::default(),
            balancer: BalancerConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.health.validate()?;
        self.flows.validate()?;

        let mut ips = HashSet::new();
        let mut macs = HashSet::new();
        for backend in &self.backends {
            if backend.ip == self.service.ip || backend.mac == self.service.mac {
                return Err(ConfigError::BackendIsVirtual(backend.ip.to_string()));
            }
            if !ips.insert(backend.ip) {
                return Err(ConfigError::DuplicateBackend(backend.ip.to_string()));
            }
            if !macs.insert(backend.mac) {
                return Err(ConfigError::DuplicateBackend(backend.mac.to_string()));
            }
        }
        Ok(())
    }

    /// The virtual service described by `service`.
    pub fn virtual_service(&self) -> VirtualService {
        VirtualService::new(self.service.ip, self.service.mac)
    }

    /// A registry holding every configured backend, all initially HEALTHY.
    pub fn build_registry(&self) -> Arc<BackendRegistry> {
        let backends = self
            .backends
            .iter()
            .zip(0u32..)
            .map(|(b, id)| Arc::new(Backend::new(BackendId(id), b.ip, b.mac)))
            .collect();
        Arc::new(BackendRegistry::new(backends))
    }
}

/// Virtual IP/MAC pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Virtual IP clients connect to.
    pub ip: Ipv4Addr,
    /// MAC advertised for the virtual IP.
    pub mac: MacAddr,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            ip: Ipv4Addr::new(10, 0, 0, 100),
            mac: MacAddr([0, 0, 0, 0, 0, 0xfe]),
        }
    }
}

/// One backend server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    /// Address traffic is rewritten to.
    pub ip: Ipv4Addr,
    /// Hardware address used to locate the backend's switch port.
    pub mac: MacAddr,
}

/// Health monitor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    /// Seconds between probe rounds.
    pub interval_secs: u64,
    /// Per-probe timeout in milliseconds.
    pub timeout_ms: u64,
    /// TCP port of each backend's metrics endpoint.
    pub metrics_port: u16,
    /// HTTP path of the metrics endpoint.
    pub metrics_path: String,
    /// HEALTHY backends above this CPU percentage become OVERLOADED.
    pub overload_cpu_percent: f64,
    /// OVERLOADED backends below this CPU percentage become HEALTHY.
    pub recover_cpu_percent: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        let thresholds = Hysteresis::default();
        Self {
            interval_secs: 5,
            timeout_ms: 1000,
            metrics_port: 5000,
            metrics_path: "/metrics".to_string(),
            overload_cpu_percent: thresholds.overload_above,
            recover_cpu_percent: thresholds.recover_below,
        }
    }
}

impl HealthConfig {
    /// Time between probe rounds.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Upper bound on a single probe.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// The overload/recovery thresholds.
    pub fn hysteresis(&self) -> Hysteresis {
        Hysteresis {
            overload_above: self.overload_cpu_percent,
            recover_below: self.recover_cpu_percent,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs == 0 {
            return Err(ConfigError::Zero("health.interval_secs"));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Zero("health.timeout_ms"));
        }
        if !self.metrics_path.starts_with('/') {
            return Err(ConfigError::MetricsPath(self.metrics_path.clone()));
        }
        if self.recover_cpu_percent >= self.overload_cpu_percent {
            return Err(ConfigError::ThresholdOrder {
                recover: self.recover_cpu_percent,
                overload: self.overload_cpu_percent,
            });
        }
        Ok(())
    }
}

/// Idle timeouts, in seconds, for installed rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlowConfig {
    /// Learned L2 forwarding rules.
    pub l2_idle_timeout: u16,
    /// Load-balancer rewrite rules.
    pub balanced_idle_timeout: u16,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            l2_idle_timeout: 60,
            balanced_idle_timeout: 10,
        }
    }
}

impl FlowConfig {
    /// A programmer using these timeouts.
    pub fn programmer(&self) -> FlowProgrammer {
        FlowProgrammer::new(self.l2_idle_timeout, self.balanced_idle_timeout)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.l2_idle_timeout == 0 {
            return Err(ConfigError::Zero("flows.l2_idle_timeout"));
        }
        if self.balanced_idle_timeout == 0 {
            return Err(ConfigError::Zero("flows.balanced_idle_timeout"));
        }
        Ok(())
    }
}

/// Backend selection settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BalancerConfig {
    /// Selection policy among HEALTHY backends.
    pub policy: SelectionPolicy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ControllerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.backends.len(), 3);
        assert_eq!(config.health.interval(), Duration::from_secs(5));
        assert_eq!(config.health.timeout(), Duration::from_secs(1));
        assert_eq!(config.balancer.policy, SelectionPolicy::RoundRobin);
    }

    #[test]
    fn empty_file_yields_defaults() {
        let config: ControllerConfig = toml::from_str("").unwrap();
        assert_eq!(config, ControllerConfig::default());
    }

    #[test]
    fn parses_full_file() {
        let config: ControllerConfig = toml::from_str(
            r#"
            listen = "127.0.0.1:6633"

            [service]
            ip = "192.168.1.10"
            mac = "02:00:00:00:00:0A"

            [[backends]]
            ip = "192.168.1.11"
            mac = "02:00:00:00:00:0b"

            [health]
            interval_secs = 2
            overload_cpu_percent = 90.0
            recover_cpu_percent = 40.0

            [flows]
            balanced_idle_timeout = 30

            [balancer]
            policy = "random"
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.listen, "127.0.0.1:6633".parse().unwrap());
        assert_eq!(config.service.mac, MacAddr([2, 0, 0, 0, 0, 0x0a]));
        assert_eq!(config.backends.len(), 1);
        assert_eq!(config.health.timeout_ms, 1000);
        assert_eq!(config.health.hysteresis().overload_above, 90.0);
        assert_eq!(config.flows.l2_idle_timeout, 60);
        assert_eq!(config.balancer.policy, SelectionPolicy::Random);

        let registry = config.build_registry();
        assert_eq!(registry.snapshot()[0].ip, Ipv4Addr::new(192, 168, 1, 11));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<ControllerConfig>("[health]\nperiod = 5").is_err());
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let mut config = ControllerConfig::default();
        config.health.recover_cpu_percent = 80.0;
        assert!(matches!(config.validate(), Err(ConfigError::ThresholdOrder { .. })));
    }

    #[test]
    fn rejects_duplicate_and_virtual_backends() {
        let mut config = ControllerConfig::default();
        config.backends.push(config.backends[0]);
        assert!(matches!(config.validate(), Err(ConfigError::DuplicateBackend(_))));

        let mut config = ControllerConfig::default();
        config.backends[1].mac = config.service.mac;
        assert!(matches!(config.validate(), Err(ConfigError::BackendIsVirtual(_))));
    }

    #[test]
    fn rejects_zero_timeouts_and_relative_path() {
        let mut config = ControllerConfig::default();
        config.flows.balanced_idle_timeout = 0;
        assert_eq!(config.validate(), Err(ConfigError::Zero("flows.balanced_idle_timeout")));

        let mut config = ControllerConfig::default();
        config.health.timeout_ms = 0;
        assert_eq!(config.validate(), Err(ConfigError::Zero("health.timeout_ms")));

        let mut config = ControllerConfig::default();
        config.health.metrics_path = "metrics".into();
        assert!(matches!(config.validate(), Err(ConfigError::MetricsPath(_))));
    }
}
