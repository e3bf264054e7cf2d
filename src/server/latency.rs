use std::cmp::Reverse;
use std::collections::VecDeque;
use std::sync::RwLock;
use std::time::Duration;

/// Number of nearest samples consulted per estimate.
const NEIGHBORS: usize = 5;

/// Default sample capacity.
pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy)]
struct Sample {
    rif: u64,
    latency: Duration,
}

/// Bounded ring of (RIF-at-entry, latency) samples with nearest-RIF median
/// estimation.
///
/// Request completions append on the write side; probe responders estimate on
/// the read side, so concurrent probes never block each other. Appending past
/// capacity drops the oldest sample.
#[derive(Debug)]
pub struct LatencyRing {
    samples: RwLock<VecDeque<Sample>>,
    capacity: usize,
}

impl LatencyRing {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append a sample, evicting the oldest when full.
    pub fn record(&self, rif: u64, latency: Duration) {
        let mut samples = match self.samples.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        samples.push_back(Sample { rif, latency });
        if samples.len() > self.capacity {
            samples.pop_front();
        }
    }

    /// Median latency among the stored samples whose RIF is closest to
    /// `rif_query`.
    ///
    /// At most [`NEIGHBORS`] samples are consulted; equal distances favour the
    /// fresher sample. An empty ring yields `Duration::ZERO`, the "no data"
    /// sentinel on the wire.
    pub fn estimate(&self, rif_query: u64) -> Duration {
        let samples = match self.samples.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if samples.is_empty() {
            return Duration::ZERO;
        }

        let mut ranked: Vec<(u64, usize, Duration)> = samples
            .iter()
            .enumerate()
            .map(|(seq, s)| (s.rif.abs_diff(rif_query), seq, s.latency))
            .collect();
        ranked.sort_by_key(|&(dist, seq, _)| (dist, Reverse(seq)));

        let mut latencies: Vec<Duration> = ranked
            .iter()
            .take(NEIGHBORS)
            .map(|&(_, _, latency)| latency)
            .collect();
        latencies.sort();

        latencies[latencies.len() / 2]
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.samples.read().unwrap().len()
    }
}

impl Default for LatencyRing {
    fn default() -> Self {
        Self::new()
    }
}
