//! Client process: probe pool maintenance, replica selection, and
//! application request dispatch.
//!
//! # Components
//!
//! - [`ProbePool`]: bounded pool of recent probes with hot-cold selection
//! - [`prober`]: one-shot probe transport over HTTP
//! - [`Client`]: owns the pool behind a mutex, runs the background prober,
//!   and dispatches application requests to selected replicas
//!
//! The background prober and foreground selections share one mutex; a probe
//! round holds it for the duration of the fan-out, so selections that run
//! after a round observe all of its insertions at once.

pub mod pool;
pub mod prober;

pub use pool::{ProbeInfo, ProbePool, Selection};
pub use prober::ProbeError;

use anyhow::Result;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::metrics;

/// Replica selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    /// Hot-cold selection over the probe pool
    Hcl,
    /// Rotate over the configured servers, ignoring probes
    RoundRobin,
}

impl SelectionMode {
    /// Parse a mode name; anything unrecognised falls back to HCL.
    pub fn parse(name: &str) -> Self {
        match name {
            "round_robin" => SelectionMode::RoundRobin,
            _ => SelectionMode::Hcl,
        }
    }
}

/// Failures surfaced to application callers.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The pool is empty; retry after the next probe round.
    #[error("no probes available")]
    NoProbes,

    #[error("request to {server} failed: {message}")]
    Transport { server: String, message: String },

    #[error("{server} answered {path} with status {status}")]
    BadStatus {
        server: String,
        path: String,
        status: StatusCode,
    },
}

/// Snapshot of one pooled probe, for introspection and tests.
#[derive(Debug, Clone)]
pub struct ProbeStat {
    pub server_id: String,
    pub rif: u64,
    pub latency: Duration,
    pub use_count: u32,
    pub normalized_rif: f64,
}

/// Snapshot of the pool.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub probes: Vec<ProbeStat>,
    pub max_rif: u64,
}

/// Load-balancing client for a fixed set of replicas.
pub struct Client {
    config: ClientConfig,
    selection: SelectionMode,
    pool: Mutex<ProbePool>,
    probe_interval: Duration,
    probe_timeout: Duration,
    rr_cursor: AtomicUsize,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Client {
    /// Build a client from a validated configuration. The probe reuse bound
    /// is derived here, once.
    pub fn new(mut config: ClientConfig, selection: SelectionMode) -> Result<Self> {
        config.validate()?;

        let max_use = config.max_probe_use();
        info!(
            servers = config.servers.len(),
            pool_size = config.max_probe_pool_size,
            reuse_bound = max_use,
            "client_configured"
        );

        let pool = ProbePool::new(
            config.max_probe_pool_size,
            config.probe_ttl(),
            max_use,
            config.q_rif_threshold,
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            probe_interval: config.probe_interval(),
            probe_timeout: config.probe_timeout(),
            config,
            selection,
            pool: Mutex::new(pool),
            rr_cursor: AtomicUsize::new(0),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Start the background prober.
    /// Returns a task handle that runs until [`Client::shutdown`] is called.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut shutdown = self.shutdown_rx.clone();
            let mut ticker = tokio::time::interval(self.probe_interval);
            // One round in flight at a time; late rounds are delayed, never
            // stacked.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                interval_ms = self.probe_interval.as_millis() as u64,
                "prober started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => self.probe_round().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("prober stopped");
        })
    }

    /// Signal the prober to stop after the round currently in flight, if
    /// any, completes.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Execute one probe round: purge, make room, fan out to every replica,
    /// insert the successes, refresh normalisation.
    ///
    /// The pool mutex is held for the whole round, including the network
    /// fan-out, so selections either see the previous round's pool or this
    /// round's in full.
    pub async fn probe_round(&self) {
        let mut pool = self.pool.lock().await;

        let stale = pool.purge_expired(Instant::now());
        if stale > 0 {
            metrics::record_stale_probes(stale);
        }

        pool.make_room();

        for server in &self.config.servers {
            match prober::fetch_probe(server, self.probe_timeout).await {
                Ok(reply) => {
                    pool.insert(ProbeInfo::new(
                        server.clone(),
                        reply.rif,
                        reply.latency(),
                        Instant::now(),
                    ));
                }
                Err(e) => {
                    debug!(server = %server, error = %e, "probe_failed");
                    metrics::record_probe_failure(server);
                }
            }
        }

        pool.refresh_normalization();

        metrics::record_max_rif(pool.max_rif());
        for probe in pool.probes() {
            metrics::record_normalized_rif(&probe.server_id, probe.normalized_rif);
        }
    }

    /// Pick a replica for one outbound request.
    ///
    /// Under HCL an empty pool is a recoverable failure; callers may retry
    /// after the next probe round.
    pub async fn select_replica(&self, job: &str) -> Result<String, ClientError> {
        let server = match self.selection {
            SelectionMode::RoundRobin => {
                let idx = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % self.config.servers.len();
                self.config.servers[idx].clone()
            }
            SelectionMode::Hcl => {
                let mut pool = self.pool.lock().await;
                let selection = pool.select().ok_or(ClientError::NoProbes)?;

                debug!(
                    server = %selection.server_id,
                    job = %job,
                    hot = selection.hot,
                    use_count = selection.use_count,
                    "replica_selected"
                );
                metrics::record_probe_reuse(&selection.server_id);
                metrics::record_selection(selection.hot, &selection.server_id);

                selection.server_id
            }
        };

        metrics::record_server_chosen(&server, job);
        Ok(server)
    }

    /// Send a ping request to a selected replica.
    pub async fn ping(&self) -> Result<(), ClientError> {
        let server = self.select_replica("ping").await?;
        self.send_request(&server, Method::GET, "/ping", None).await
    }

    /// Send a medium processing request to a selected replica.
    pub async fn medium_process(&self) -> Result<(), ClientError> {
        let server = self.select_replica("medium").await?;
        self.send_request(&server, Method::POST, "/medium", None)
            .await
    }

    /// Send a batch processing request to a selected replica.
    pub async fn batch_process(&self, strings: &[String]) -> Result<(), ClientError> {
        let server = self.select_replica("batch").await?;
        let body = serde_json::json!({ "strings": strings }).to_string();
        self.send_request(&server, Method::POST, "/batch", Some(body))
            .await
    }

    /// Snapshot the pool for introspection.
    pub async fn pool_stats(&self) -> PoolStats {
        let pool = self.pool.lock().await;
        PoolStats {
            probes: pool
                .probes()
                .iter()
                .map(|p| ProbeStat {
                    server_id: p.server_id.clone(),
                    rif: p.rif,
                    latency: p.latency,
                    use_count: p.use_count,
                    normalized_rif: p.normalized_rif,
                })
                .collect(),
            max_rif: pool.max_rif(),
        }
    }

    /// Issue one application request. Non-2xx responses and transport errors
    /// surface verbatim; there is no retry.
    async fn send_request(
        &self,
        server: &str,
        method: Method,
        path: &str,
        body: Option<String>,
    ) -> Result<(), ClientError> {
        let transport = |message: String| ClientError::Transport {
            server: server.to_string(),
            message,
        };

        let stream = TcpStream::connect(server)
            .await
            .map_err(|e| transport(format!("connect failed: {}", e)))?;
        let io = TokioIo::new(stream);

        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| transport(format!("handshake failed: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Connection error during request: {}", e);
            }
        });

        let mut builder = Request::builder()
            .method(method)
            .uri(format!("http://{}{}", server, path))
            .header("Host", server);
        if body.is_some() {
            builder = builder.header("Content-Type", "application/json");
        }
        let req = builder
            .body(body.unwrap_or_default())
            .map_err(|e| transport(format!("request build failed: {}", e)))?;

        let response = sender
            .send_request(req)
            .await
            .map_err(|e| transport(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            warn!(
                server = %server,
                path = %path,
                status = response.status().as_u16(),
                "request_rejected"
            );
            return Err(ClientError::BadStatus {
                server: server.to_string(),
                path: path.to_string(),
                status: response.status(),
            });
        }

        Ok(())
    }
}
