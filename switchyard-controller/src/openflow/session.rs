//! One switch connection: handshake, keepalive and packet-in dispatch.

use bytes::{Bytes, BytesMut};
use crossbeam_queue::SegQueue;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::flow::{Datapath, FlowRule, PacketOut};
use switchyard_core::{Controller, Dpid};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

use crate::openflow::codec::{self, CodecError, Header, Inbound, Outbound, HEADER_LEN};

/// How long a closing session waits for its queued messages to reach the socket.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors that end a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The socket failed.
    #[error("connection error: {0}")]
    Io(#[from] io::Error),
    /// The byte stream can no longer be framed.
    #[error("framing error: {0}")]
    Codec(#[from] CodecError),
}

/// Lock-free queue of encoded messages waiting for the socket writer.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    messages: SegQueue<Bytes>,
    ready: Notify,
    next_xid: AtomicU32,
    closed: AtomicBool,
}

impl OutboundQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `message` under a fresh transaction id.
    pub fn send(&self, message: &Outbound) {
        let xid = self.next_xid.fetch_add(1, Ordering::Relaxed);
        self.send_with_xid(xid, message);
    }

    /// Queue `message` under `xid`, for replies that must echo the request's id.
    pub fn send_with_xid(&self, xid: u32, message: &Outbound) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        match codec::encode(xid, message) {
            Ok(bytes) => {
                self.messages.push(bytes);
                self.ready.notify_one();
            }
            Err(e) => warn!(error = %e, "dropping unencodable message"),
        }
    }

    /// Stop accepting messages; the writer exits once the backlog is flushed.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.ready.notify_one();
    }

    /// Write queued messages to `writer` until the queue is closed.
    pub async fn drain_into<W>(&self, mut writer: W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            while let Some(bytes) = self.messages.pop() {
                writer.write_all(&bytes).await?;
            }
            if self.closed.load(Ordering::Acquire) {
                return writer.flush().await;
            }
            self.ready.notified().await;
        }
    }
}

/// [`Datapath`] handle for a switch that completed its handshake.
#[derive(Debug, Clone)]
pub struct SwitchHandle {
    dpid: Dpid,
    outbound: Arc<OutboundQueue>,
}

impl SwitchHandle {
    /// Bind `dpid` to the session's outbound queue.
    pub fn new(dpid: Dpid, outbound: Arc<OutboundQueue>) -> Self {
        Self { dpid, outbound }
    }
}

impl Datapath for SwitchHandle {
    fn dpid(&self) -> Dpid {
        self.dpid
    }

    fn install_flow(&self, rule: FlowRule) {
        self.outbound.send(&Outbound::FlowMod(rule));
    }

    fn packet_out(&self, packet: PacketOut) {
        self.outbound.send(&Outbound::PacketOut(packet));
    }
}

/// Drive one switch connection until it closes.
pub async fn run_session(
    stream: TcpStream,
    peer: SocketAddr,
    controller: Arc<Controller>,
) -> Result<(), SessionError> {
    stream.set_nodelay(true)?;
    let (mut reader, writer) = stream.into_split();

    let outbound = Arc::new(OutboundQueue::new());
    let mut writer_task = {
        let outbound = Arc::clone(&outbound);
        tokio::spawn(async move {
            if let Err(e) = outbound.drain_into(writer).await {
                debug!(%peer, error = %e, "switch writer stopped");
            }
        })
    };

    outbound.send(&Outbound::Hello);
    outbound.send(&Outbound::FeaturesRequest);

    let result = dispatch(&mut reader, peer, &controller, &outbound).await;

    outbound.close();
    if tokio::time::timeout(FLUSH_TIMEOUT, &mut writer_task).await.is_err() {
        warn!(%peer, "switch writer did not flush in time, dropping backlog");
        writer_task.abort();
    }
    result
}

async fn dispatch<R>(
    reader: &mut R,
    peer: SocketAddr,
    controller: &Controller,
    outbound: &Arc<OutboundQueue>,
) -> Result<(), SessionError>
where
    R: AsyncRead + Unpin,
{
    let mut switch: Option<SwitchHandle> = None;

    while let Some((header, body)) = read_message(reader).await? {
        let message = match codec::decode(&header, body) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    %peer,
                    msg_type = header.msg_type,
                    error = %e,
                    "ignoring undecodable message"
                );
                continue;
            }
        };

        match message {
            Inbound::Hello => debug!(%peer, version = header.version, "hello received"),
            Inbound::EchoRequest(payload) => {
                outbound.send_with_xid(header.xid, &Outbound::EchoReply(payload));
            }
            Inbound::FeaturesReply { datapath_id, n_buffers, n_tables } => {
                let handle = SwitchHandle::new(Dpid(datapath_id), Arc::clone(outbound));
                info!(
                    %peer,
                    dpid = %handle.dpid(),
                    n_buffers,
                    n_tables,
                    "switch handshake complete"
                );
                controller.switch_connected(&handle);
                switch = Some(handle);
            }
            Inbound::PacketIn(event) => match &switch {
                Some(handle) => {
                    controller.handle_packet_in(handle, &event);
                }
                None => debug!(%peer, "packet-in before features reply, ignoring"),
            },
            Inbound::Error { err_type, code } => {
                warn!(%peer, err_type, code, "switch reported an error");
            }
            Inbound::EchoReply | Inbound::Unhandled(_) => {
                trace!(%peer, msg_type = header.msg_type, "ignoring message");
            }
        }
    }

    Ok(())
}

/// Read one framed message, or `None` on a clean close between messages.
async fn read_message<R>(reader: &mut R) -> Result<Option<(Header, Bytes)>, SessionError>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; HEADER_LEN];
    match reader.read_exact(&mut raw).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let header = Header::decode(raw)?;

    let mut body = BytesMut::zeroed(header.body_len());
    reader.read_exact(&mut body).await?;
    Ok(Some((header, body.freeze())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openflow::codec::testing::{echo_request, features_reply, packet_in, split};
    use std::net::Ipv4Addr;
    use switchyard_core::config::ControllerConfig;
    use switchyard_core::packet::testing::arp_request;
    use switchyard_core::packet::ParsedPacket;
    use switchyard_core::MacAddr;
    use tokio::net::TcpListener;

    fn controller() -> Arc<Controller> {
        let config = ControllerConfig::default();
        Arc::new(Controller::new(
            config.virtual_service(),
            config.build_registry(),
            config.balancer.policy,
            config.flows.programmer(),
        ))
    }

    async fn read_one(stream: &mut TcpStream) -> (Header, Bytes) {
        read_message(stream).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn queue_flushes_backlog_before_closing() {
        let queue = OutboundQueue::new();
        queue.send(&Outbound::Hello);
        queue.send(&Outbound::FeaturesRequest);
        queue.close();
        queue.send(&Outbound::Hello);

        let mut sink = Vec::new();
        queue.drain_into(&mut sink).await.unwrap();
        assert_eq!(sink.len(), 2 * HEADER_LEN);
        assert_eq!(sink[1], 0);
        assert_eq!(sink[HEADER_LEN + 1], 5);
        assert_eq!(&sink[HEADER_LEN + 4..HEADER_LEN + 8], &1u32.to_be_bytes());
    }

    #[tokio::test]
    async fn handshake_table_miss_and_arp_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let controller = controller();
        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            run_session(stream, peer, controller).await
        });

        let mut switch = TcpStream::connect(addr).await.unwrap();

        let (hello, _) = read_one(&mut switch).await;
        assert_eq!(hello.msg_type, 0);
        let (features, _) = read_one(&mut switch).await;
        assert_eq!(features.msg_type, 5);

        switch.write_all(&echo_request(77, b"ping")).await.unwrap();
        let (echo, payload) = read_one(&mut switch).await;
        assert_eq!((echo.msg_type, echo.xid), (3, 77));
        assert_eq!(&payload[..], b"ping");

        switch.write_all(&features_reply(0xab)).await.unwrap();
        let (flow_mod, body) = read_one(&mut switch).await;
        assert_eq!(flow_mod.msg_type, 14);
        assert_eq!(&body[22..24], &0u16.to_be_bytes()); // table-miss priority

        let frame = arp_request(
            MacAddr([0, 0, 0, 0, 0, 1]),
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 100),
        );
        switch.write_all(&packet_in(1, 0xffff_ffff, &frame)).await.unwrap();
        let (packet_out, body) = read_one(&mut switch).await;
        assert_eq!(packet_out.msg_type, 13);
        let reply = ParsedPacket::parse(&body[32..]).unwrap();
        assert_eq!(reply.ethernet.src, MacAddr([0, 0, 0, 0, 0, 0xfe]));
        assert_eq!(reply.arp.unwrap().target_ip, Ipv4Addr::new(10, 0, 0, 1));

        drop(switch);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn replies_reach_a_half_closed_switch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let controller = controller();
        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            run_session(stream, peer, controller).await
        });

        let mut switch = TcpStream::connect(addr).await.unwrap();
        let frame = arp_request(
            MacAddr([0, 0, 0, 0, 0, 1]),
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 100),
        );
        switch.write_all(&features_reply(0xcd)).await.unwrap();
        switch.write_all(&packet_in(1, 0xffff_ffff, &frame)).await.unwrap();
        switch.shutdown().await.unwrap();

        let mut received = Vec::new();
        switch.read_to_end(&mut received).await.unwrap();
        server.await.unwrap().unwrap();

        let mut kinds = Vec::new();
        let mut rest = Bytes::from(received);
        while !rest.is_empty() {
            let len = usize::from(u16::from_be_bytes([rest[2], rest[3]]));
            let (header, _) = split(rest.split_to(len));
            kinds.push(header.msg_type);
        }
        // HELLO, FEATURES_REQUEST, table-miss FLOW_MOD, ARP reply PACKET_OUT.
        assert_eq!(kinds, vec![0, 5, 14, 13]);
    }

    #[tokio::test]
    async fn packet_in_before_handshake_is_ignored() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let controller = controller();
        let server_controller = Arc::clone(&controller);
        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            run_session(stream, peer, server_controller).await
        });

        let mut switch = TcpStream::connect(addr).await.unwrap();
        read_one(&mut switch).await;
        read_one(&mut switch).await;

        let frame = arp_request(
            MacAddr([0, 0, 0, 0, 0, 1]),
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 100),
        );
        switch.write_all(&packet_in(1, 0xffff_ffff, &frame)).await.unwrap();
        drop(switch);

        server.await.unwrap().unwrap();
        assert!(controller.mac_table().switches().is_empty());
    }

    #[test]
    fn split_helper_matches_header_decode() {
        let (header, body) = split(features_reply(5));
        assert_eq!(header.body_len(), body.len());
    }
}
