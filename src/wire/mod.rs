//! Probe wire format shared by the replica server and the client prober.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Distinguished path replicas answer probes on.
pub const PROBE_PATH: &str = "/probe";

/// Payload returned by a replica's probe endpoint.
///
/// Latency travels as a signed integer number of nanoseconds. A zero latency
/// means the replica has no samples yet; clients treat it as the smallest
/// possible latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReply {
    /// Requests in flight on the replica when the probe was answered.
    pub rif: u64,

    /// Conditional median latency at that RIF, in nanoseconds.
    #[serde(rename = "latency")]
    pub latency_nanos: i64,
}

impl ProbeReply {
    /// Build a reply from a duration, saturating at `i64::MAX` nanoseconds.
    pub fn new(rif: u64, latency: Duration) -> Self {
        let latency_nanos = i64::try_from(latency.as_nanos()).unwrap_or(i64::MAX);
        Self { rif, latency_nanos }
    }

    /// Reported latency as a `Duration`. Negative values clamp to zero.
    pub fn latency(&self) -> Duration {
        Duration::from_nanos(self.latency_nanos.max(0) as u64)
    }
}
