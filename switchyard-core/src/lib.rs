//! Switchyard Core functionality.
//!
//! This crate contains the packet-in decision engine of the Switchyard SDN
//! controller: MAC learning, the ARP proxy for the virtual service, backend
//! health state, the layer-4 load balancer and the translation of decisions
//! into flow-table commands. It performs no I/O; the controller process
//! supplies switch sessions through [`flow::Datapath`] and drives health
//! probes through [`health::Hysteresis`].

pub mod arp_proxy;
pub mod config;
pub mod controller;
pub mod domain;
pub mod flow;
pub mod health;
pub mod learning;
pub mod load_balancer;
pub mod packet;

pub use controller::{Controller, Decision};
pub use domain::addr::{Dpid, MacAddr, PortNo};
