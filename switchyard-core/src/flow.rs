//! Flow-table commands and the translation of forwarding decisions into them.

use bytes::Bytes;
use std::net::Ipv4Addr;

use crate::domain::addr::{Dpid, MacAddr, PortNo};
use crate::domain::backend::Backend;
use crate::domain::service::VirtualService;
use crate::packet::{ETHERTYPE_IPV4, IPPROTO_TCP};

/// Priority of the catch-all rule that sends unmatched packets to the controller.
pub const TABLE_MISS_PRIORITY: u16 = 0;
/// Priority of learned L2 forwarding rules.
pub const L2_PRIORITY: u16 = 1;
/// Priority of load-balancer rewrite rules.
pub const LOAD_BALANCER_PRIORITY: u16 = 2;

/// Where an output action sends a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputPort {
    /// A physical switch port.
    Physical(PortNo),
    /// Every port except the ingress port.
    Flood,
    /// Back to the controller as a packet-in.
    Controller,
}

/// A single flow or packet-out action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Rewrite the Ethernet source.
    SetEthSrc(MacAddr),
    /// Rewrite the Ethernet destination.
    SetEthDst(MacAddr),
    /// Rewrite the IPv4 source.
    SetIpv4Src(Ipv4Addr),
    /// Rewrite the IPv4 destination.
    SetIpv4Dst(Ipv4Addr),
    /// Emit the packet.
    Output(OutputPort),
}

/// Match predicate of a flow rule. `None` fields are wildcards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowMatch {
    /// Ingress port.
    pub in_port: Option<PortNo>,
    /// Ethernet destination.
    pub eth_dst: Option<MacAddr>,
    /// Ethernet source.
    pub eth_src: Option<MacAddr>,
    /// EtherType.
    pub eth_type: Option<u16>,
    /// IPv4 source.
    pub ipv4_src: Option<Ipv4Addr>,
    /// IPv4 destination.
    pub ipv4_dst: Option<Ipv4Addr>,
    /// IP protocol number.
    pub ip_proto: Option<u8>,
    /// TCP source port.
    pub tcp_src: Option<u16>,
    /// TCP destination port.
    pub tcp_dst: Option<u16>,
}

/// A rule to add to a switch's flow table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRule {
    /// Higher wins.
    pub priority: u16,
    /// Which packets the rule applies to.
    pub matcher: FlowMatch,
    /// Applied in order.
    pub actions: Vec<Action>,
    /// Seconds without a match before the switch drops the rule; 0 never expires.
    pub idle_timeout: u16,
}

/// Instruction to emit one packet from the switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketOut {
    /// Switch-side buffer holding the packet, if the switch buffered it.
    pub buffer_id: Option<u32>,
    /// Port the packet originally arrived on; `None` for controller-generated packets.
    pub in_port: Option<PortNo>,
    /// Applied in order.
    pub actions: Vec<Action>,
    /// Frame bytes, used when the packet is not buffered on the switch.
    pub data: Bytes,
}

/// Command sink for one connected switch.
///
/// Both operations are fire-and-forget: implementations queue the command and
/// return without waiting for the switch.
pub trait Datapath: Send + Sync {
    /// Identity of the switch this handle talks to.
    fn dpid(&self) -> Dpid;
    /// Add a rule to the switch's flow table.
    fn install_flow(&self, rule: FlowRule);
    /// Emit a packet from the switch.
    fn packet_out(&self, packet: PacketOut);
}

/// Identifies one client-side TCP connection to the virtual service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientFlow {
    /// Port the client's traffic enters on.
    pub in_port: PortNo,
    /// Client IPv4 address.
    pub client_ip: Ipv4Addr,
    /// Client TCP port.
    pub client_port: u16,
    /// Destination TCP port on the virtual service.
    pub service_port: u16,
}

/// Forward and reverse rules for one redirected connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectPair {
    /// Client to backend, rewriting the destination to the backend.
    pub forward: FlowRule,
    /// Backend to client, rewriting the source to the virtual service.
    pub reverse: FlowRule,
}

/// Builds flow rules and packet-outs. Holds only the configured idle timeouts.
#[derive(Debug, Clone, Copy)]
pub struct FlowProgrammer {
    l2_idle_timeout: u16,
    balanced_idle_timeout: u16,
}

impl FlowProgrammer {
    /// Create a programmer with the idle timeouts for learned and balanced rules.
    pub fn new(l2_idle_timeout: u16, balanced_idle_timeout: u16) -> Self {
        Self {
            l2_idle_timeout,
            balanced_idle_timeout,
        }
    }

    /// The permanent lowest-priority rule punting every unmatched packet to the controller.
    pub fn table_miss(&self) -> FlowRule {
        FlowRule {
            priority: TABLE_MISS_PRIORITY,
            matcher: FlowMatch::default(),
            actions: vec![Action::Output(OutputPort::Controller)],
            idle_timeout: 0,
        }
    }

    /// Rule sending frames for `eth_dst` arriving on `in_port` straight to `out_port`.
    pub fn l2_forward(&self, in_port: PortNo, eth_dst: MacAddr, out_port: PortNo) -> FlowRule {
        FlowRule {
            priority: L2_PRIORITY,
            matcher: FlowMatch {
                in_port: Some(in_port),
                eth_dst: Some(eth_dst),
                ..FlowMatch::default()
            },
            actions: vec![Action::Output(OutputPort::Physical(out_port))],
            idle_timeout: self.l2_idle_timeout,
        }
    }

    /// Mirror-image rewrite rules steering `flow` to `backend` on `backend_port`.
    pub fn redirect(
        &self,
        service: &VirtualService,
        flow: ClientFlow,
        backend: &Backend,
        backend_port: PortNo,
    ) -> RedirectPair {
        let forward = FlowRule {
            priority: LOAD_BALANCER_PRIORITY,
            matcher: FlowMatch {
                in_port: Some(flow.in_port),
                eth_type: Some(ETHERTYPE_IPV4),
                ipv4_src: Some(flow.client_ip),
                ipv4_dst: Some(service.ip),
                ip_proto: Some(IPPROTO_TCP),
                tcp_src: Some(flow.client_port),
                tcp_dst: Some(flow.service_port),
                ..FlowMatch::default()
            },
            actions: vec![
                Action::SetEthDst(backend.mac),
                Action::SetIpv4Dst(backend.ip),
                Action::Output(OutputPort::Physical(backend_port)),
            ],
            idle_timeout: self.balanced_idle_timeout,
        };
        let reverse = FlowRule {
            priority: LOAD_BALANCER_PRIORITY,
            matcher: FlowMatch {
                in_port: Some(backend_port),
                eth_type: Some(ETHERTYPE_IPV4),
                ipv4_src: Some(backend.ip),
                ipv4_dst: Some(flow.client_ip),
                ip_proto: Some(IPPROTO_TCP),
                tcp_src: Some(flow.service_port),
                tcp_dst: Some(flow.client_port),
                ..FlowMatch::default()
            },
            actions: vec![
                Action::SetEthSrc(service.mac),
                Action::SetIpv4Src(service.ip),
                Action::Output(OutputPort::Physical(flow.in_port)),
            ],
            idle_timeout: self.balanced_idle_timeout,
        };
        RedirectPair { forward, reverse }
    }

    /// Re-emit the packet that triggered a packet-in with `actions`.
    pub fn forward_packet(
        &self,
        buffer_id: Option<u32>,
        in_port: PortNo,
        actions: Vec<Action>,
        data: Bytes,
    ) -> PacketOut {
        PacketOut {
            buffer_id,
            in_port: Some(in_port),
            actions,
            data,
        }
    }

    /// Emit a controller-generated frame out of a single port.
    pub fn inject(&self, out_port: PortNo, data: Bytes) -> PacketOut {
        PacketOut {
            buffer_id: None,
            in_port: None,
            actions: vec![Action::Output(OutputPort::Physical(out_port))],
            data,
        }
    }
}
