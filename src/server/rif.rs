use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free requests-in-flight counter for a replica.
///
/// `enter` returns the count the arriving request observed; that snapshot is
/// what gets attached to the request's latency sample on completion, so the
/// sample expresses the load the request saw on arrival. Probe handling never
/// touches the counter: probes are short and out-of-band, and counting them
/// would bias the very metric they report.
#[derive(Debug, Default)]
pub struct RifCounter {
    inflight: AtomicU64,
}

impl RifCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request entering and return the new in-flight count.
    pub fn enter(&self) -> u64 {
        self.inflight.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Record a request leaving.
    pub fn exit(&self) {
        self.inflight.fetch_sub(1, Ordering::Relaxed);
    }

    /// Current in-flight count.
    pub fn current(&self) -> u64 {
        self.inflight.load(Ordering::Relaxed)
    }
}
