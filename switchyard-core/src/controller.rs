//! Packet-in classification: learn, then ARP proxy, then load balancer, then L2.
//!
//! [`Controller::decide`] turns one packet-in into a [`Decision`] without
//! touching the switch; [`Controller::execute`] replays a decision's commands
//! against a [`Datapath`]. Every decision is terminal for its packet.

use tracing::{debug, info, trace};

use crate::arp_proxy::ArpProxy;
use crate::domain::addr::Dpid;
use crate::domain::registry::SharedBackendRegistry;
use crate::domain::service::VirtualService;
use crate::flow::{Action, Datapath, FlowProgrammer, FlowRule, OutputPort, PacketOut};
use crate::learning::MacLearningTable;
use crate::load_balancer::balancer::{DropReason, LoadBalancer, Redirect};
use crate::load_balancer::selector::SelectionPolicy;
use crate::packet::{PacketIn, ParsedPacket};

/// Outcome of handling one packet-in.
#[derive(Debug, Clone)]
pub enum Decision {
    /// Not an Ethernet frame; nothing learned, nothing sent.
    Ignored,
    /// ARP request for the virtual IP, answered out of the ingress port.
    ArpReply {
        /// The synthesized reply.
        packet_out: PacketOut,
    },
    /// Virtual-service connection steered to a backend.
    Balanced(Redirect),
    /// Virtual-service packet that could not be steered.
    Dropped(DropReason),
    /// Destination known; rule installed and packet sent on.
    Forward {
        /// Priority-1 rule for the destination.
        rule: FlowRule,
        /// Sends the triggering packet to the learned port.
        packet_out: PacketOut,
    },
    /// Destination unknown; packet flooded without a rule.
    Flood {
        /// Sends the triggering packet out of every port.
        packet_out: PacketOut,
    },
}

/// The packet-in decision engine shared by all switch sessions.
#[derive(Debug)]
pub struct Controller {
    mac_table: MacLearningTable,
    arp_proxy: ArpProxy,
    balancer: LoadBalancer,
    programmer: FlowProgrammer,
}

impl Controller {
    /// Wire up a controller for `service` backed by `registry`.
    pub fn new(
        service: VirtualService,
        registry: SharedBackendRegistry,
        policy: SelectionPolicy,
        programmer: FlowProgrammer,
    ) -> Self {
        Self {
            mac_table: MacLearningTable::new(),
            arp_proxy: ArpProxy::new(service),
            balancer: LoadBalancer::new(service, registry, policy, programmer),
            programmer,
        }
    }

    /// The learning table populated from packet-ins.
    pub fn mac_table(&self) -> &MacLearningTable {
        &self.mac_table
    }

    /// The load balancer, exposing the virtual service and registry.
    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    /// Prepare a freshly connected switch: install the table-miss rule.
    pub fn switch_connected(&self, datapath: &dyn Datapath) {
        info!(dpid = %datapath.dpid(), "switch connected, installing table-miss rule");
        datapath.install_flow(self.programmer.table_miss());
    }

    /// Classify `event` from switch `dpid`, updating the learning table.
    pub fn decide(&self, dpid: Dpid, event: &PacketIn) -> Decision {
        let packet = match ParsedPacket::parse(&event.data) {
            Ok(packet) => packet,
            Err(e) => {
                trace!(%dpid, in_port = event.in_port, error = %e, "ignoring packet-in");
                return Decision::Ignored;
            }
        };
        let eth = packet.ethernet;

        if self.mac_table.learn(dpid, eth.src, event.in_port) != Some(event.in_port) {
            debug!(%dpid, mac = %eth.src, port = event.in_port, "learned host location");
        }

        if let Some(arp) = &packet.arp {
            if let Some(frame) = self.arp_proxy.reply(arp, eth.src) {
                info!(%dpid, requester = %arp.sender_ip, "answering ARP for virtual IP");
                return Decision::ArpReply {
                    packet_out: self.programmer.inject(event.in_port, frame),
                };
            }
        }

        if let (Some(ip), Some(tcp)) = (&packet.ipv4, packet.tcp) {
            if self.balancer.accepts(ip) {
                return match self.balancer.balance(dpid, event, ip, tcp, &self.mac_table) {
                    Ok(redirect) => Decision::Balanced(redirect),
                    Err(reason) => Decision::Dropped(reason),
                };
            }
        }

        match self.mac_table.lookup(dpid, eth.dst) {
            Some(out_port) => {
                debug!(%dpid, src = %eth.src, dst = %eth.dst, out_port, "installing L2 flow");
                Decision::Forward {
                    rule: self.programmer.l2_forward(event.in_port, eth.dst, out_port),
                    packet_out: self.programmer.forward_packet(
                        event.buffer_id,
                        event.in_port,
                        vec![Action::Output(OutputPort::Physical(out_port))],
                        event.data.clone(),
                    ),
                }
            }
            None => {
                trace!(%dpid, src = %eth.src, dst = %eth.dst, "flooding to unknown destination");
                Decision::Flood {
                    packet_out: self.programmer.forward_packet(
                        event.buffer_id,
                        event.in_port,
                        vec![Action::Output(OutputPort::Flood)],
                        event.data.clone(),
                    ),
                }
            }
        }
    }

    /// Issue the switch commands a decision calls for.
    pub fn execute(&self, datapath: &dyn Datapath, decision: &Decision) {
        match decision {
            Decision::Ignored | Decision::Dropped(_) => {}
            Decision::ArpReply { packet_out } | Decision::Flood { packet_out } => {
                datapath.packet_out(packet_out.clone());
            }
            Decision::Forward { rule, packet_out } => {
                datapath.install_flow(rule.clone());
                datapath.packet_out(packet_out.clone());
            }
            Decision::Balanced(redirect) => {
                datapath.install_flow(redirect.rules.forward.clone());
                datapath.install_flow(redirect.rules.reverse.clone());
                datapath.packet_out(redirect.packet_out.clone());
            }
        }
    }

    /// Decide and execute in one step, returning the decision taken.
    pub fn handle_packet_in(&self, datapath: &dyn Datapath, event: &PacketIn) -> Decision {
        let decision = self.decide(datapath.dpid(), event);
        self.execute(datapath, &decision);
        decision
    }
}
