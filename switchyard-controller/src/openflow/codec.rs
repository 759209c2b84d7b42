//! OpenFlow 1.3 wire encoding for the handful of messages the controller uses.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use switchyard_core::flow::{Action, FlowMatch, FlowRule, OutputPort, PacketOut};
use switchyard_core::packet::PacketIn;
use thiserror::Error;

/// Protocol version byte for OpenFlow 1.3.
pub const OFP_VERSION: u8 = 0x04;
/// Size of the common message header.
pub const HEADER_LEN: usize = 8;

const OFPT_HELLO: u8 = 0;
const OFPT_ERROR: u8 = 1;
const OFPT_ECHO_REQUEST: u8 = 2;
const OFPT_ECHO_REPLY: u8 = 3;
const OFPT_FEATURES_REQUEST: u8 = 5;
const OFPT_FEATURES_REPLY: u8 = 6;
const OFPT_PACKET_IN: u8 = 10;
const OFPT_PACKET_OUT: u8 = 13;
const OFPT_FLOW_MOD: u8 = 14;

const OFPP_FLOOD: u32 = 0xffff_fffb;
const OFPP_CONTROLLER: u32 = 0xffff_fffd;
const OFPP_ANY: u32 = 0xffff_ffff;
const OFPG_ANY: u32 = 0xffff_ffff;
const OFP_NO_BUFFER: u32 = 0xffff_ffff;
const OFPCML_MAX: u16 = 0xffe5;
const OFPCML_NO_BUFFER: u16 = 0xffff;

const OFPFC_ADD: u8 = 0;
const OFPMT_OXM: u16 = 1;
const OFPIT_APPLY_ACTIONS: u16 = 4;
const OFPAT_OUTPUT: u16 = 0;
const OFPAT_SET_FIELD: u16 = 25;

const OFPXMC_OPENFLOW_BASIC: u16 = 0x8000;
const OXM_IN_PORT: u8 = 0;
const OXM_ETH_DST: u8 = 3;
const OXM_ETH_SRC: u8 = 4;
const OXM_ETH_TYPE: u8 = 5;
const OXM_IP_PROTO: u8 = 10;
const OXM_IPV4_SRC: u8 = 11;
const OXM_IPV4_DST: u8 = 12;
const OXM_TCP_SRC: u8 = 13;
const OXM_TCP_DST: u8 = 14;

/// Wire-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// A message other than HELLO used another protocol version.
    #[error("unsupported OpenFlow version {0:#04x}")]
    UnsupportedVersion(u8),
    /// The header's length field is shorter than the header itself.
    #[error("invalid message length {0}")]
    BadLength(u16),
    /// A message body ended early.
    #[error("truncated {0} message")]
    Truncated(&'static str),
    /// A packet-in without an `in_port` match field.
    #[error("packet-in carries no in_port")]
    MissingInPort,
    /// An encoded message would not fit the 16-bit length field.
    #[error("message of {0} bytes exceeds the OpenFlow length limit")]
    TooLarge(usize),
}

/// The common OpenFlow header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Protocol version.
    pub version: u8,
    /// Message type.
    pub msg_type: u8,
    /// Total message length, header included.
    pub length: u16,
    /// Transaction id.
    pub xid: u32,
}

impl Header {
    /// Decode a header, validating only the length field.
    pub fn decode(raw: [u8; HEADER_LEN]) -> Result<Self, CodecError> {
        let mut buf = &raw[..];
        let header = Self {
            version: buf.get_u8(),
            msg_type: buf.get_u8(),
            length: buf.get_u16(),
            xid: buf.get_u32(),
        };
        if usize::from(header.length) < HEADER_LEN {
            return Err(CodecError::BadLength(header.length));
        }
        Ok(header)
    }

    /// Length of the body following the header.
    pub fn body_len(&self) -> usize {
        usize::from(self.length) - HEADER_LEN
    }
}

/// Messages received from a switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Version negotiation.
    Hello,
    /// The switch rejected something we sent.
    Error {
        /// `ofp_error_type`.
        err_type: u16,
        /// Type-specific code.
        code: u16,
    },
    /// Keepalive that must be echoed back.
    EchoRequest(Bytes),
    /// Answer to one of our keepalives.
    EchoReply,
    /// Handshake completion carrying the switch identity.
    FeaturesReply {
        /// Datapath id.
        datapath_id: u64,
        /// Packets the switch can buffer.
        n_buffers: u32,
        /// Number of flow tables.
        n_tables: u8,
    },
    /// A packet that matched no flow rule.
    PacketIn(PacketIn),
    /// Any message type the controller does not act on.
    Unhandled(u8),
}

/// Messages sent to a switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Version negotiation.
    Hello,
    /// Answer to a switch keepalive.
    EchoReply(Bytes),
    /// Ask for the datapath id.
    FeaturesRequest,
    /// Add a flow rule.
    FlowMod(FlowRule),
    /// Emit a packet.
    PacketOut(PacketOut),
}

/// Decode the body of a message whose header has already been read.
pub fn decode(header: &Header, body: Bytes) -> Result<Inbound, CodecError> {
    if header.msg_type == OFPT_HELLO {
        return Ok(Inbound::Hello);
    }
    if header.version != OFP_VERSION {
        return Err(CodecError::UnsupportedVersion(header.version));
    }
    match header.msg_type {
        OFPT_ERROR => {
            let mut buf = body;
            ensure(&buf, 4, "error")?;
            Ok(Inbound::Error {
                err_type: buf.get_u16(),
                code: buf.get_u16(),
            })
        }
        OFPT_ECHO_REQUEST => Ok(Inbound::EchoRequest(body)),
        OFPT_ECHO_REPLY => Ok(Inbound::EchoReply),
        OFPT_FEATURES_REPLY => {
            let mut buf = body;
            ensure(&buf, 13, "features reply")?;
            Ok(Inbound::FeaturesReply {
                datapath_id: buf.get_u64(),
                n_buffers: buf.get_u32(),
                n_tables: buf.get_u8(),
            })
        }
        OFPT_PACKET_IN => decode_packet_in(body).map(Inbound::PacketIn),
        other => Ok(Inbound::Unhandled(other)),
    }
}

fn decode_packet_in(mut buf: Bytes) -> Result<PacketIn, CodecError> {
    // buffer_id, total_len, reason, table_id, cookie, then the match header.
    ensure(&buf, 20, "packet-in")?;
    let buffer_id = buf.get_u32();
    buf.advance(2 + 1 + 1 + 8);

    let match_type = buf.get_u16();
    let match_len = usize::from(buf.get_u16());
    if match_type != OFPMT_OXM || match_len < 4 {
        return Err(CodecError::Truncated("packet-in match"));
    }
    let oxm_len = match_len - 4;
    let padded = match_len.next_multiple_of(8) - 4;
    ensure(&buf, padded + 2, "packet-in match")?;

    let mut oxms = buf.split_to(padded).slice(..oxm_len);
    let mut in_port = None;
    while oxms.remaining() >= 4 {
        let oxm_header = oxms.get_u32();
        let class = (oxm_header >> 16) as u16;
        let field = ((oxm_header >> 9) & 0x7f) as u8;
        let len = (oxm_header & 0xff) as usize;
        ensure(&oxms, len, "oxm field")?;
        if class == OFPXMC_OPENFLOW_BASIC && field == OXM_IN_PORT && len == 4 {
            in_port = Some(oxms.get_u32());
        } else {
            oxms.advance(len);
        }
    }
    buf.advance(2);

    Ok(PacketIn {
        in_port: in_port.ok_or(CodecError::MissingInPort)?,
        buffer_id: (buffer_id != OFP_NO_BUFFER).then_some(buffer_id),
        data: buf,
    })
}

/// Encode `message` with transaction id `xid`.
pub fn encode(xid: u32, message: &Outbound) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::with_capacity(64);
    let msg_type = match message {
        Outbound::Hello => OFPT_HELLO,
        Outbound::EchoReply(_) => OFPT_ECHO_REPLY,
        Outbound::FeaturesRequest => OFPT_FEATURES_REQUEST,
        Outbound::FlowMod(_) => OFPT_FLOW_MOD,
        Outbound::PacketOut(_) => OFPT_PACKET_OUT,
    };
    buf.put_u8(OFP_VERSION);
    buf.put_u8(msg_type);
    buf.put_u16(0);
    buf.put_u32(xid);

    match message {
        Outbound::Hello | Outbound::FeaturesRequest => {}
        Outbound::EchoReply(payload) => buf.put_slice(payload),
        Outbound::FlowMod(rule) => put_flow_mod(&mut buf, rule),
        Outbound::PacketOut(packet) => put_packet_out(&mut buf, packet),
    }

    let length = u16::try_from(buf.len()).map_err(|_| CodecError::TooLarge(buf.len()))?;
    buf[2..4].copy_from_slice(&length.to_be_bytes());
    Ok(buf.freeze())
}

fn put_flow_mod(buf: &mut BytesMut, rule: &FlowRule) {
    buf.put_u64(0); // cookie
    buf.put_u64(0); // cookie mask
    buf.put_u8(0); // table
    buf.put_u8(OFPFC_ADD);
    buf.put_u16(rule.idle_timeout);
    buf.put_u16(0); // hard timeout
    buf.put_u16(rule.priority);
    buf.put_u32(OFP_NO_BUFFER);
    buf.put_u32(OFPP_ANY);
    buf.put_u32(OFPG_ANY);
    buf.put_u16(0); // flags
    buf.put_bytes(0, 2);
    put_match(buf, &rule.matcher);

    if !rule.actions.is_empty() {
        let start = buf.len();
        buf.put_u16(OFPIT_APPLY_ACTIONS);
        buf.put_u16(0);
        buf.put_bytes(0, 4);
        for action in &rule.actions {
            put_action(buf, action);
        }
        patch_len(buf, start);
    }
}

fn put_packet_out(buf: &mut BytesMut, packet: &PacketOut) {
    buf.put_u32(packet.buffer_id.unwrap_or(OFP_NO_BUFFER));
    buf.put_u32(packet.in_port.unwrap_or(OFPP_CONTROLLER));
    let actions_len_at = buf.len();
    buf.put_u16(0);
    buf.put_bytes(0, 6);
    let actions_start = buf.len();
    for action in &packet.actions {
        put_action(buf, action);
    }
    let actions_len = (buf.len() - actions_start) as u16;
    buf[actions_len_at..actions_len_at + 2].copy_from_slice(&actions_len.to_be_bytes());
    // Buffered packets are released by id; the switch ignores trailing data.
    if packet.buffer_id.is_none() {
        buf.put_slice(&packet.data);
    }
}

fn put_match(buf: &mut BytesMut, m: &FlowMatch) {
    let start = buf.len();
    buf.put_u16(OFPMT_OXM);
    buf.put_u16(0);
    if let Some(port) = m.in_port {
        put_oxm(buf, OXM_IN_PORT, &port.to_be_bytes());
    }
    if let Some(mac) = m.eth_dst {
        put_oxm(buf, OXM_ETH_DST, &mac.octets());
    }
    if let Some(mac) = m.eth_src {
        put_oxm(buf, OXM_ETH_SRC, &mac.octets());
    }
    if let Some(ethertype) = m.eth_type {
        put_oxm(buf, OXM_ETH_TYPE, &ethertype.to_be_bytes());
    }
    if let Some(proto) = m.ip_proto {
        put_oxm(buf, OXM_IP_PROTO, &[proto]);
    }
    if let Some(ip) = m.ipv4_src {
        put_oxm(buf, OXM_IPV4_SRC, &ip.octets());
    }
    if let Some(ip) = m.ipv4_dst {
        put_oxm(buf, OXM_IPV4_DST, &ip.octets());
    }
    if let Some(port) = m.tcp_src {
        put_oxm(buf, OXM_TCP_SRC, &port.to_be_bytes());
    }
    if let Some(port) = m.tcp_dst {
        put_oxm(buf, OXM_TCP_DST, &port.to_be_bytes());
    }
    // ofp_match.length excludes the trailing padding.
    let len = (buf.len() - start) as u16;
    buf[start + 2..start + 4].copy_from_slice(&len.to_be_bytes());
    pad_to_8(buf, start);
}

fn put_oxm(buf: &mut BytesMut, field: u8, value: &[u8]) {
    buf.put_u16(OFPXMC_OPENFLOW_BASIC);
    buf.put_u8(field << 1);
    buf.put_u8(value.len() as u8);
    buf.put_slice(value);
}

fn put_action(buf: &mut BytesMut, action: &Action) {
    match action {
        Action::Output(port) => {
            let (port_no, max_len) = match port {
                OutputPort::Physical(p) => (*p, OFPCML_MAX),
                OutputPort::Flood => (OFPP_FLOOD, OFPCML_MAX),
                OutputPort::Controller => (OFPP_CONTROLLER, OFPCML_NO_BUFFER),
            };
            buf.put_u16(OFPAT_OUTPUT);
            buf.put_u16(16);
            buf.put_u32(port_no);
            buf.put_u16(max_len);
            buf.put_bytes(0, 6);
        }
        Action::SetEthSrc(mac) => put_set_field(buf, OXM_ETH_SRC, &mac.octets()),
        Action::SetEthDst(mac) => put_set_field(buf, OXM_ETH_DST, &mac.octets()),
        Action::SetIpv4Src(ip) => put_set_field(buf, OXM_IPV4_SRC, &ip.octets()),
        Action::SetIpv4Dst(ip) => put_set_field(buf, OXM_IPV4_DST, &ip.octets()),
    }
}

fn put_set_field(buf: &mut BytesMut, field: u8, value: &[u8]) {
    let start = buf.len();
    buf.put_u16(OFPAT_SET_FIELD);
    buf.put_u16(0);
    put_oxm(buf, field, value);
    pad_to_8(buf, start);
    patch_len(buf, start);
}

fn pad_to_8(buf: &mut BytesMut, start: usize) {
    let len = buf.len() - start;
    buf.put_bytes(0, len.next_multiple_of(8) - len);
}

/// Write the length of the structure beginning at `start` into its second u16.
fn patch_len(buf: &mut BytesMut, start: usize) {
    let len = (buf.len() - start) as u16;
    buf[start + 2..start + 4].copy_from_slice(&len.to_be_bytes());
}

fn ensure(buf: &Bytes, needed: usize, what: &'static str) -> Result<(), CodecError> {
    if buf.remaining() < needed {
        return Err(CodecError::Truncated(what));
    }
    Ok(())
}
