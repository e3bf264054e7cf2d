use http_body_util::BodyExt;
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

use crate::wire::{ProbeReply, PROBE_PATH};

/// Why a single probe attempt failed. Never fatal: the round skips the
/// replica and the next round tries again.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected status {0}")]
    Status(StatusCode),

    #[error("decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Issue one probe request against a replica and decode its reply.
///
/// A fresh connection per probe keeps the measurement out-of-band: probes
/// never queue behind application requests on a shared connection. The
/// timeout covers connect and request separately.
pub async fn fetch_probe(server: &str, timeout: Duration) -> Result<ProbeReply, ProbeError> {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(server)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(ProbeError::Transport(format!("connect failed: {}", e))),
        Err(_) => return Err(ProbeError::Transport("connect timeout".to_string())),
    };

    let io = TokioIo::new(stream);

    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| ProbeError::Transport(format!("handshake failed: {}", e)))?;

    // Drive the connection until the exchange completes
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Connection error during probe: {}", e);
        }
    });

    let req = Request::builder()
        .method("GET")
        .uri(format!("http://{}{}", server, PROBE_PATH))
        .header("Host", server)
        .body(String::new())
        .map_err(|e| ProbeError::Transport(format!("request build failed: {}", e)))?;

    let response = match tokio::time::timeout(timeout, sender.send_request(req)).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => return Err(ProbeError::Transport(format!("request failed: {}", e))),
        Err(_) => return Err(ProbeError::Transport("request timeout".to_string())),
    };

    if !response.status().is_success() {
        return Err(ProbeError::Status(response.status()));
    }

    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| ProbeError::Transport(format!("body read failed: {}", e)))?
        .to_bytes();

    let reply: ProbeReply = serde_json::from_slice(&body)?;
    Ok(reply)
}
