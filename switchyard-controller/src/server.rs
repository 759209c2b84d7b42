//! Listener accepting OpenFlow switch connections.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use switchyard_core::Controller;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::openflow::session::run_session;

/// Binds `addr` and serves switches until the listener fails.
pub async fn start_server(addr: SocketAddr, controller: Arc<Controller>) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "listening for switches");
    serve(listener, controller).await
}

/// Accept loop; each switch gets its own task.
pub async fn serve(listener: TcpListener, controller: Arc<Controller>) -> io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        info!(%peer, "switch connected");

        let controller = Arc::clone(&controller);
        tokio::task::spawn(async move {
            match run_session(stream, peer, controller).await {
                Ok(()) => info!(%peer, "switch disconnected"),
                Err(e) => warn!(%peer, error = %e, "switch session failed"),
            }
            debug!(%peer, "session task finished");
        });
    }
}
