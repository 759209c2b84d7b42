//! Domain models shared by the packet-in path and the health monitor.

pub mod addr;
pub mod backend;
pub mod registry;
pub mod service;
