//! Replica process: application endpoints plus the probe responder.
//!
//! Every application request passes through the requests-in-flight counter
//! and leaves a latency sample behind; probes read both without ever touching
//! the counter.

pub mod latency;
mod replica;
pub mod rif;

pub use latency::LatencyRing;
pub use replica::ReplicaServer;
pub use rif::RifCounter;

use anyhow::Result;

/// Run a replica server on the given listen address until the process exits.
pub async fn run_server(listen: &str) -> Result<()> {
    ReplicaServer::new().run(listen).await
}
