use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{body::Incoming, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::metrics;
use crate::server::latency::LatencyRing;
use crate::server::rif::RifCounter;
use crate::wire::{ProbeReply, PROBE_PATH};

/// HTTP body type for responses
type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

#[derive(Debug, Serialize)]
struct MessageReply {
    message: String,
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    strings: Vec<String>,
}

/// A single replica: simulated application endpoints plus the probe
/// responder.
///
/// The handlers' business logic is throwaway; what matters is that every
/// application request increments the RIF counter on entry, decrements it on
/// exit, and records `(rif_at_entry, latency)` into the sample ring. Probes
/// answer from both without participating in either.
pub struct ReplicaServer {
    rif: RifCounter,
    latency: LatencyRing,
}

impl ReplicaServer {
    pub fn new() -> Self {
        Self {
            rif: RifCounter::new(),
            latency: LatencyRing::new(),
        }
    }

    /// Bind the listen address and serve until the process exits.
    pub async fn run(self, listen: &str) -> Result<()> {
        let addr: SocketAddr = listen
            .parse()
            .context(format!("Invalid listen address: {}", listen))?;

        let listener = TcpListener::bind(addr)
            .await
            .context(format!("Failed to bind to {}", addr))?;

        info!("Replica listening on {}", addr);
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let server = Arc::new(self);

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let server = Arc::clone(&server);

            tokio::spawn(async move {
                let io = TokioIo::new(stream);

                let service = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { server.handle_request(req).await }
                });

                if let Err(e) = http1::Builder::new()
                    .keep_alive(true)
                    .serve_connection(io, service)
                    .await
                {
                    // Filter out benign connection reset errors
                    let err_str = format!("{}", e);
                    if !err_str.contains("connection reset") && !err_str.contains("broken pipe") {
                        error!("Error serving connection from {}: {}", remote_addr, e);
                    }
                }
            });
        }
    }

    async fn handle_request(&self, req: Request<Incoming>) -> Result<Response<BoxBody>> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        debug!("{} {}", method, path);

        let response = match (method, path.as_str()) {
            (Method::GET, PROBE_PATH) => self.handle_probe(),
            (Method::GET, "/ping") => self.measured("/ping", || self.handle_ping()).await,
            (Method::POST, "/medium") => self.measured("/medium", || self.handle_medium()).await,
            (Method::POST, "/batch") => self.measured("/batch", || self.handle_batch(req)).await,
            (_, PROBE_PATH | "/ping" | "/medium" | "/batch") => {
                self.error_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".into())
            }
            _ => self.error_response(StatusCode::NOT_FOUND, format!("No such path: {}", path)),
        };

        Ok(response)
    }

    /// Run `handler` between RIF enter/exit, recording the latency sample
    /// against the RIF the request saw on arrival.
    async fn measured<F, Fut>(&self, path: &'static str, handler: F) -> Response<BoxBody>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Response<BoxBody>>,
    {
        let rif = self.rif.enter();
        metrics::record_current_rif(rif);

        let start = Instant::now();
        let response = handler().await;
        let elapsed = start.elapsed();

        self.rif.exit();
        self.latency.record(rif, elapsed);
        metrics::record_request_latency(path, elapsed);

        response
    }

    fn handle_probe(&self) -> Response<BoxBody> {
        let current_rif = self.rif.current();
        let median_latency = self.latency.estimate(current_rif);

        debug!(
            rif = current_rif,
            median_latency_us = median_latency.as_micros() as u64,
            "probe_answered"
        );
        metrics::record_median_latency(median_latency);

        self.json_response(StatusCode::OK, &ProbeReply::new(current_rif, median_latency))
    }

    async fn handle_ping(&self) -> Response<BoxBody> {
        self.json_response(
            StatusCode::OK,
            &MessageReply {
                message: "pong".to_string(),
            },
        )
    }

    async fn handle_medium(&self) -> Response<BoxBody> {
        // Simulated medium-weight work: ~3s with +-1s of spread.
        let offset_secs = {
            use rand::Rng;
            rand::thread_rng().gen_range(-1i64..=1)
        };
        tokio::time::sleep(Duration::from_secs((3 + offset_secs).max(0) as u64)).await;

        self.json_response(
            StatusCode::OK,
            &MessageReply {
                message: "Medium process complete".to_string(),
            },
        )
    }

    async fn handle_batch(&self, req: Request<Incoming>) -> Response<BoxBody> {
        let body = match req.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!("Failed to read request body: {}", e);
                return self.error_response(
                    StatusCode::BAD_REQUEST,
                    format!("Failed to read request body: {}", e),
                );
            }
        };

        let batch: BatchRequest = match serde_json::from_slice(&body) {
            Ok(batch) => batch,
            Err(e) => {
                return self
                    .error_response(StatusCode::BAD_REQUEST, format!("Invalid batch body: {}", e));
            }
        };

        // Simulated heavy work: ~10s with +-5s of spread.
        let offset_secs = {
            use rand::Rng;
            rand::thread_rng().gen_range(-5i64..=5)
        };
        tokio::time::sleep(Duration::from_secs((10 + offset_secs).max(0) as u64)).await;

        self.json_response(
            StatusCode::OK,
            &MessageReply {
                message: format!("Processed batch of {} strings", batch.strings.len()),
            },
        )
    }

    fn json_response(&self, status: StatusCode, value: &impl Serialize) -> Response<BoxBody> {
        let body = serde_json::to_vec(value).unwrap_or_default();
        Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .body(self.bytes_body(Bytes::from(body)))
            .unwrap()
    }

    /// Create an error response
    fn error_response(&self, status: StatusCode, message: String) -> Response<BoxBody> {
        Response::builder()
            .status(status)
            .header("Content-Type", "text/plain")
            .body(self.bytes_body(Bytes::from(message)))
            .unwrap()
    }

    /// Convert Bytes into a BoxBody
    fn bytes_body(&self, b: Bytes) -> BoxBody {
        use http_body_util::Full;
        Full::new(b).map_err(|never| match never {}).boxed()
    }
}

impl Default for ReplicaServer {
    fn default() -> Self {
        Self::new()
    }
}
