//! Steering of new virtual-service connections to a backend.

use std::net::Ipv4Addr;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::domain::addr::{Dpid, MacAddr};
use crate::domain::backend::SharedBackend;
use crate::domain::registry::SharedBackendRegistry;
use crate::domain::service::VirtualService;
use crate::flow::{ClientFlow, FlowProgrammer, PacketOut, RedirectPair};
use crate::learning::MacLearningTable;
use crate::load_balancer::selector::{SelectionPolicy, Selector};
use crate::packet::{Ipv4Header, PacketIn, TcpPorts};

/// Why a virtual-service packet was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DropReason {
    /// Every backend is OVERLOADED or DOWN.
    #[error("no healthy backend available")]
    NoHealthyBackend,
    /// The selected backend has not sent a frame the switch could learn from yet.
    #[error("switch port of backend {ip} ({mac}) not learned yet")]
    BackendPortUnknown {
        /// Backend address.
        ip: Ipv4Addr,
        /// Backend hardware address.
        mac: MacAddr,
    },
}

/// Commands that steer one client connection to a backend.
#[derive(Debug, Clone)]
pub struct Redirect {
    /// The backend chosen for the connection.
    pub backend: SharedBackend,
    /// Forward and reverse rewrite rules.
    pub rules: RedirectPair,
    /// Sends the triggering packet along the forward path right away.
    pub packet_out: PacketOut,
}

/// Layer-4 load balancer for the virtual service.
#[derive(Debug)]
pub struct LoadBalancer {
    service: VirtualService,
    registry: SharedBackendRegistry,
    selector: Selector,
    programmer: FlowProgrammer,
}

impl LoadBalancer {
    /// Create a balancer choosing among `registry` with `policy`.
    pub fn new(
        service: VirtualService,
        registry: SharedBackendRegistry,
        policy: SelectionPolicy,
        programmer: FlowProgrammer,
    ) -> Self {
        Self {
            service,
            registry,
            selector: Selector::new(policy),
            programmer,
        }
    }

    /// The shared backend registry.
    pub fn registry(&self) -> &SharedBackendRegistry {
        &self.registry
    }

    /// Whether a packet with these headers is addressed to the virtual service.
    pub fn accepts(&self, ip: &Ipv4Header) -> bool {
        ip.dst == self.service.ip
    }

    /// Pick a backend for the connection carried by `event` and build its rules.
    pub fn balance(
        &self,
        dpid: Dpid,
        event: &PacketIn,
        ip: &Ipv4Header,
        tcp: TcpPorts,
        table: &MacLearningTable,
    ) -> Result<Redirect, DropReason> {
        let Some(backend) = self.selector.select(&self.registry) else {
            error!(%dpid, client = %ip.src, "no healthy backend available, dropping packet");
            return Err(DropReason::NoHealthyBackend);
        };

        let Some(backend_port) = table.lookup(dpid, backend.mac) else {
            warn!(
                %dpid,
                id = %backend.id,
                backend = %backend.ip,
                mac = %backend.mac,
                "backend port not learned yet, dropping packet"
            );
            return Err(DropReason::BackendPortUnknown {
                ip: backend.ip,
                mac: backend.mac,
            });
        };

        info!(
            %dpid,
            client = %ip.src,
            client_port = tcp.src,
            id = %backend.id,
            backend = %backend.ip,
            backend_port,
            "redirecting virtual service connection"
        );

        let flow = ClientFlow {
            in_port: event.in_port,
            client_ip: ip.src,
            client_port: tcp.src,
            service_port: tcp.dst,
        };
        let rules = self.programmer.redirect(&self.service, flow, &backend, backend_port);
        let packet_out = self.programmer.forward_packet(
            event.buffer_id,
            event.in_port,
            rules.forward.actions.clone(),
            event.data.clone(),
        );

        Ok(Redirect {
            backend,
            rules,
            packet_out,
        })
    }
}
