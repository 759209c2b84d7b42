//! HTTP probe of a backend's CPU metrics endpoint.

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::header::HOST;
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use switchyard_core::health::MISSING_CPU_PERCENT;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time;

/// Why a probe produced no CPU reading.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The whole exchange did not finish in time.
    #[error("no response within {0:?}")]
    Timeout(Duration),
    /// TCP connect failed.
    #[error("connect failed: {0}")]
    Connect(#[from] io::Error),
    /// HTTP protocol failure.
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),
    /// The request could not be built.
    #[error("invalid request: {0}")]
    Request(#[from] hyper::http::Error),
    /// The endpoint answered with anything but 200 OK.
    #[error("unexpected status {0}")]
    Status(StatusCode),
    /// The body is not a metrics report.
    #[error("malformed metrics body: {0}")]
    Body(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct MetricsReport {
    #[serde(default = "missing_cpu")]
    cpu_percent: f64,
}

fn missing_cpu() -> f64 {
    MISSING_CPU_PERCENT
}

/// Aborts the spawned connection driver when the probe finishes or is cancelled.
struct ConnectionTask(JoinHandle<()>);

impl Drop for ConnectionTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Fetch `path` from `addr` and return the reported CPU percentage.
///
/// A report without `cpu_percent` reads as fully loaded.
pub async fn probe_metrics(
    addr: SocketAddr,
    path: &str,
    timeout: Duration,
) -> Result<f64, ProbeError> {
    time::timeout(timeout, fetch(addr, path))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
}

async fn fetch(addr: SocketAddr, path: &str) -> Result<f64, ProbeError> {
    let stream = TcpStream::connect(addr).await?;
    let (mut sender, connection) =
        hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    let _driver = ConnectionTask(tokio::spawn(async move {
        let _ = connection.await;
    }));

    let request = Request::get(path)
        .header(HOST, addr.to_string())
        .body(Empty::<Bytes>::new())?;
    let response = sender.send_request(request).await?;

    let status = response.status();
    if status != StatusCode::OK {
        return Err(ProbeError::Status(status));
    }

    let body = response.into_body().collect().await?.to_bytes();
    let report: MetricsReport = serde_json::from_slice(&body)?;
    Ok(report.cpu_percent)
}
