//! The load-balanced virtual endpoint.

use std::net::Ipv4Addr;

use crate::domain::addr::MacAddr;

/// The single virtual address pair clients talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualService {
    /// Address answered by the ARP proxy and rewritten by load-balancer rules.
    pub ip: Ipv4Addr,
    /// Hardware address advertised for `ip`.
    pub mac: MacAddr,
}

impl VirtualService {
    /// Create a virtual service from its IP/MAC identity.
    pub fn new(ip: Ipv4Addr, mac: MacAddr) -> Self {
        Self { ip, mac }
    }
}
