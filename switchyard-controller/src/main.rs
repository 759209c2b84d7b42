//! Switchyard Controller
//!
//! The Tokio process that accepts OpenFlow switch connections, answers
//! packet-ins through the core [`Controller`], and runs the backend health
//! monitor alongside it.

#![deny(missing_docs)]

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use switchyard_core::Controller;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod health_check;
mod openflow;
mod server;

use health_check::HealthMonitor;

#[derive(Parser, Debug)]
#[command(name = "switchyard", about = "OpenFlow load-balancing controller", long_about = None)]
struct Cli {
    /// TOML configuration file; built-in defaults are used when omitted
    #[arg(long, short, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Override the OpenFlow listen address
    #[arg(long, value_name = "ADDR")]
    listen: Option<SocketAddr>,
    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// The primary entrypoint for the controller.
///
/// Loads the configuration, starts the health monitor and serves switches
/// until the listener fails or the process is interrupted.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("invalid log filter")?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    let mut config = config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }

    let service = config.virtual_service();
    let registry = config.build_registry();
    info!(
        vip = %service.ip,
        vmac = %service.mac,
        backends = registry.len(),
        policy = ?config.balancer.policy,
        "starting switchyard controller"
    );

    let controller = Arc::new(Controller::new(
        service,
        Arc::clone(&registry),
        config.balancer.policy,
        config.flows.programmer(),
    ));
    let monitor = HealthMonitor::new(registry, &config.health).spawn();

    let outcome = tokio::select! {
        served = server::start_server(config.listen, controller) => {
            served.with_context(|| format!("OpenFlow listener on {}", config.listen))
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for shutdown signal")?;
            info!("shutdown requested");
            Ok(())
        }
    };

    monitor.abort();
    if let Err(e) = &outcome {
        error!(error = %format!("{e:#}"), "controller stopped");
    }
    info!("shutting down");
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn cli_overrides() {
        let cli = Cli::parse_from([
            "switchyard",
            "--config",
            "/etc/switchyard.toml",
            "--listen",
            "127.0.0.1:6633",
            "--log-level",
            "debug",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/switchyard.toml")));
        assert_eq!(cli.listen, Some(SocketAddr::from(([127, 0, 0, 1], 6633))));
        assert_eq!(cli.log_level, "debug");
    }

    #[test]
    fn cli_defaults() {
        let cli = Cli::parse_from(["switchyard"]);
        assert!(cli.config.is_none());
        assert!(cli.listen.is_none());
        assert_eq!(cli.log_level, "info");
    }
}
