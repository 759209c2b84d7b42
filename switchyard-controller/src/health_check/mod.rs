//! Backend health monitoring over each backend's HTTP metrics endpoint.

pub mod monitor;
pub mod prober;

pub use monitor::HealthMonitor;
