//! Answers ARP requests for the virtual IP on behalf of the backend pool.

use bytes::Bytes;

use crate::domain::addr::MacAddr;
use crate::domain::service::VirtualService;
use crate::packet::{ArpOperation, ArpPacket};

/// Synthesizes ARP replies advertising the virtual service's MAC.
#[derive(Debug, Clone, Copy)]
pub struct ArpProxy {
    service: VirtualService,
}

impl ArpProxy {
    /// Create a proxy for `service`.
    pub fn new(service: VirtualService) -> Self {
        Self { service }
    }

    /// Whether `arp` is a who-has for the virtual IP.
    pub fn is_vip_request(&self, arp: &ArpPacket) -> bool {
        arp.operation == ArpOperation::Request && arp.target_ip == self.service.ip
    }

    /// Build the reply frame for a virtual-IP request sent from `requester_mac`.
    ///
    /// Returns `None` for anything else: requests for other addresses and all
    /// replies are left to normal switching.
    pub fn reply(&self, arp: &ArpPacket, requester_mac: MacAddr) -> Option<Bytes> {
        if !self.is_vip_request(arp) {
            return None;
        }
        let reply = ArpPacket {
            operation: ArpOperation::Reply,
            sender_mac: self.service.mac,
            sender_ip: self.service.ip,
            target_mac: arp.sender_mac,
            target_ip: arp.sender_ip,
        };
        Some(reply.to_frame(self.service.mac, requester_mac))
    }
}
