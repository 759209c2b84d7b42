//! Loading the controller configuration from a TOML file.

use std::path::{Path, PathBuf};
use switchyard_core::config::{ConfigError, ControllerConfig};
use thiserror::Error;

/// Why a configuration could not be loaded.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Read {
        /// File that was requested.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The file is not valid TOML or has unknown keys.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// The values are inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(#[from] ConfigError),
}

/// Load and validate the configuration at `path`, or the defaults when no path is given.
pub fn load(path: Option<&Path>) -> Result<ControllerConfig, LoadError> {
    let Some(path) = path else {
        let config = ControllerConfig::default();
        config.validate()?;
        return Ok(config);
    };

    let content = std::fs::read_to_string(path).map_err(|source| LoadError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&content)
}

/// Parse and validate a TOML document. Omitted keys take their defaults.
pub fn parse(content: &str) -> Result<ControllerConfig, LoadError> {
    let config: ControllerConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use switchyard_core::load_balancer::selector::SelectionPolicy;

    #[test]
    fn defaults_without_a_file() {
        let config = load(None).unwrap();
        assert_eq!(config, ControllerConfig::default());
        assert_eq!(config.listen.port(), 6653);
        assert_eq!(config.backends.len(), 3);
    }

    #[test]
    fn partial_file_overrides_only_what_it_names() {
        let config = parse(
            r#"
            listen = "127.0.0.1:6633"

            [health]
            interval_secs = 2

            [balancer]
            policy = "random"

            [[backends]]
            ip = "10.0.0.7"
            mac = "00:00:00:00:00:07"
            "#,
        )
        .unwrap();

        assert_eq!(config.listen.port(), 6633);
        assert_eq!(config.health.interval_secs, 2);
        assert_eq!(config.health.timeout_ms, 1000);
        assert_eq!(config.balancer.policy, SelectionPolicy::Random);
        assert_eq!(config.backends.len(), 1);
        assert_eq!(config.backends[0].ip, Ipv4Addr::new(10, 0, 0, 7));
        assert_eq!(config.service.ip, Ipv4Addr::new(10, 0, 0, 100));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = parse("[health]\nintervall_secs = 2\n").unwrap_err();
        assert!(matches!(err, LoadError::Parse(_)));
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let err = parse("[health]\noverload_cpu_percent = 40.0\n").unwrap_err();
        assert!(matches!(err, LoadError::Invalid(ConfigError::ThresholdOrder { .. })));
    }

    #[test]
    fn missing_file_reports_its_path() {
        let err = load(Some(Path::new("/nonexistent/switchyard.toml"))).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/switchyard.toml"));
    }
}
