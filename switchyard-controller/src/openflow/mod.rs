//! OpenFlow 1.3 southbound channel.
//!
//! Only the subset the controller needs is implemented: the handshake,
//! keepalive, packet-in, flow-mod and packet-out.

pub mod codec;
pub mod session;
