use std::time::{Duration, Instant};
use tracing::debug;

/// One probe response currently held by the pool.
#[derive(Debug, Clone)]
pub struct ProbeInfo {
    /// Replica address this probe came from
    pub server_id: String,

    /// Requests in flight reported by the replica
    pub rif: u64,

    /// Conditional median latency reported by the replica
    pub latency: Duration,

    /// When the client received this probe
    pub timestamp: Instant,

    /// Number of selections that have picked this probe
    pub use_count: u32,

    /// RIF divided by the pool-wide maximum ever observed, in [0, 1]
    pub normalized_rif: f64,
}

impl ProbeInfo {
    pub fn new(server_id: String, rif: u64, latency: Duration, timestamp: Instant) -> Self {
        Self {
            server_id,
            rif,
            latency,
            timestamp,
            use_count: 0,
            normalized_rif: 0.0,
        }
    }
}

/// Outcome of one hot-cold selection.
#[derive(Debug, Clone)]
pub struct Selection {
    pub server_id: String,
    /// Whether the chosen probe came from the hot partition
    pub hot: bool,
    pub use_count: u32,
}

/// The client's pool of recent probes plus the monotonic RIF ceiling used for
/// normalisation.
///
/// Pure bookkeeping: the owning client serialises access and performs all
/// network I/O. Insertion order is preserved so that eviction and selection
/// tie-breaks are deterministic.
#[derive(Debug)]
pub struct ProbePool {
    probes: Vec<ProbeInfo>,
    max_rif: u64,
    max_size: usize,
    max_age: Duration,
    max_use: u32,
    hot_threshold: f64,
}

impl ProbePool {
    pub fn new(max_size: usize, max_age: Duration, max_use: u32, hot_threshold: f64) -> Self {
        Self {
            probes: Vec::with_capacity(max_size),
            max_rif: 0,
            max_size,
            max_age,
            max_use,
            hot_threshold,
        }
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// Largest RIF ever observed; never decreases.
    pub fn max_rif(&self) -> u64 {
        self.max_rif
    }

    pub fn probes(&self) -> &[ProbeInfo] {
        &self.probes
    }

    fn is_hot(&self, probe: &ProbeInfo) -> bool {
        probe.normalized_rif >= self.hot_threshold
    }

    /// Remove every probe that has aged out or hit its reuse bound.
    /// Returns the number removed.
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let max_age = self.max_age;
        let max_use = self.max_use;

        let before = self.probes.len();
        self.probes.retain(|probe| {
            let keep =
                now.duration_since(probe.timestamp) < max_age && probe.use_count < max_use;
            if !keep {
                debug!(
                    server = %probe.server_id,
                    use_count = probe.use_count,
                    age_ms = now.duration_since(probe.timestamp).as_millis() as u64,
                    "probe_purged"
                );
            }
            keep
        });
        before - self.probes.len()
    }

    /// Evict probes until there is room for at least one insertion.
    /// Returns the number evicted.
    pub fn make_room(&mut self) -> usize {
        let mut evicted = 0;
        while self.probes.len() >= self.max_size {
            if !self.evict_one() {
                break;
            }
            evicted += 1;
        }
        evicted
    }

    /// Remove the least useful probe: the hottest one when any probe is hot,
    /// otherwise the one with the worst latency. Ties keep the earliest
    /// entry as the victim.
    pub fn evict_one(&mut self) -> bool {
        if self.probes.is_empty() {
            return false;
        }

        let mut hot_victim: Option<(usize, u64)> = None;
        for (i, probe) in self.probes.iter().enumerate() {
            if !self.is_hot(probe) {
                continue;
            }
            match hot_victim {
                Some((_, best_rif)) if probe.rif <= best_rif => {}
                _ => hot_victim = Some((i, probe.rif)),
            }
        }

        let victim = match hot_victim {
            Some((idx, _)) => idx,
            None => {
                let mut worst: (usize, Duration) = (0, self.probes[0].latency);
                for (i, probe) in self.probes.iter().enumerate().skip(1) {
                    if probe.latency > worst.1 {
                        worst = (i, probe.latency);
                    }
                }
                worst.0
            }
        };

        let probe = self.probes.remove(victim);
        debug!(server = %probe.server_id, rif = probe.rif, "probe_evicted");
        true
    }

    /// Append a fresh probe. Normalisation happens separately, once per
    /// round, after all insertions.
    pub fn insert(&mut self, probe: ProbeInfo) {
        self.probes.push(probe);
    }

    /// Raise the RIF ceiling to cover the current pool and recompute every
    /// probe's normalised RIF against it.
    pub fn refresh_normalization(&mut self) {
        let observed = self.probes.iter().map(|p| p.rif).max().unwrap_or(0);
        self.max_rif = self.max_rif.max(observed);

        for probe in &mut self.probes {
            probe.normalized_rif = if self.max_rif > 0 {
                probe.rif as f64 / self.max_rif as f64
            } else {
                1.0
            };
        }
    }

    /// Hot-cold-lexicographic selection.
    ///
    /// Cold probes win on lowest RIF; only when every probe is hot does
    /// latency decide. The chosen probe's `use_count` is incremented. Ties
    /// keep the first entry encountered.
    pub fn select(&mut self) -> Option<Selection> {
        if self.probes.is_empty() {
            return None;
        }

        let cold_idx = self
            .probes
            .iter()
            .enumerate()
            .filter(|(_, p)| !self.is_hot(p))
            .min_by_key(|(_, p)| p.rif)
            .map(|(i, _)| i);

        let (idx, hot) = match cold_idx {
            Some(i) => (i, false),
            None => {
                let i = self
                    .probes
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, p)| p.latency)
                    .map(|(i, _)| i)?;
                (i, true)
            }
        };

        let probe = &mut self.probes[idx];
        probe.use_count += 1;

        Some(Selection {
            server_id: probe.server_id.clone(),
            hot,
            use_count: probe.use_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn pool(max_size: usize, hot_threshold: f64) -> ProbePool {
        ProbePool::new(max_size, Duration::from_secs(5), 10, hot_threshold)
    }

    fn probe(server: &str, rif: u64, latency: Duration) -> ProbeInfo {
        ProbeInfo::new(server.to_string(), rif, latency, Instant::now())
    }

    #[test]
    fn test_empty_pool_selects_nothing() {
        let mut pool = pool(16, 0.75);
        assert!(pool.select().is_none());
    }

    #[test]
    fn test_selection_prefers_cold() {
        let mut pool = pool(16, 0.5);
        pool.insert(probe("a", 100, ms(5)));
        pool.insert(probe("b", 1, ms(80)));
        pool.refresh_normalization();
        assert_eq!(pool.max_rif(), 100);

        let selection = pool.select().unwrap();
        assert_eq!(selection.server_id, "b");
        assert!(!selection.hot);
    }

    #[test]
    fn test_selection_within_hot_set_uses_latency() {
        let mut pool = pool(16, 0.5);
        pool.insert(probe("a", 90, ms(50)));
        pool.insert(probe("c", 100, ms(20)));
        pool.refresh_normalization();

        let selection = pool.select().unwrap();
        assert_eq!(selection.server_id, "c");
        assert!(selection.hot);
    }

    #[test]
    fn test_selection_cold_ties_keep_first() {
        let mut pool = pool(16, 0.9);
        pool.insert(probe("a", 3, ms(10)));
        pool.insert(probe("b", 3, ms(1)));
        pool.insert(probe("c", 100, ms(1)));
        pool.refresh_normalization();

        let selection = pool.select().unwrap();
        assert_eq!(selection.server_id, "a");
    }

    #[test]
    fn test_selection_increments_use_count() {
        let mut pool = pool(16, 0.75);
        pool.insert(probe("a", 1, ms(10)));
        pool.refresh_normalization();

        assert_eq!(pool.select().unwrap().use_count, 1);
        assert_eq!(pool.select().unwrap().use_count, 2);
        assert_eq!(pool.probes()[0].use_count, 2);
    }

    #[test]
    fn test_eviction_prefers_hottest() {
        let mut pool = pool(5, 0.75);
        pool.insert(probe("hot", 99, ms(1)));
        pool.insert(probe("c1", 1, ms(10)));
        pool.insert(probe("c2", 2, ms(20)));
        pool.insert(probe("c3", 3, ms(30)));
        pool.insert(probe("c4", 4, ms(40)));
        pool.refresh_normalization();

        assert!(pool.evict_one());
        assert_eq!(pool.len(), 4);
        assert!(pool.probes().iter().all(|p| p.server_id != "hot"));
    }

    #[test]
    fn test_eviction_all_cold_removes_worst_latency() {
        let mut pool = pool(4, 0.75);
        // Seed a high ceiling from an earlier round so the probes below all
        // normalise as cold.
        pool.insert(probe("seed", 100, ms(1)));
        pool.refresh_normalization();
        pool.evict_one();

        pool.insert(probe("a", 1, ms(10)));
        pool.insert(probe("b", 2, ms(90)));
        pool.insert(probe("c", 3, ms(40)));
        pool.refresh_normalization();

        assert!(pool.evict_one());
        assert!(pool.probes().iter().all(|p| p.server_id != "b"));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_make_room_frees_a_slot() {
        let mut pool = pool(3, 0.75);
        pool.insert(probe("a", 1, ms(10)));
        pool.insert(probe("b", 2, ms(20)));
        pool.insert(probe("c", 3, ms(30)));
        pool.refresh_normalization();

        let evicted = pool.make_room();
        assert_eq!(evicted, 1);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_purge_removes_overused_probes() {
        let mut pool = ProbePool::new(16, Duration::from_secs(5), 2, 0.75);
        pool.insert(probe("a", 1, ms(10)));
        pool.refresh_normalization();

        pool.select().unwrap();
        assert_eq!(pool.purge_expired(Instant::now()), 0);

        pool.select().unwrap();
        assert_eq!(pool.purge_expired(Instant::now()), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_purge_removes_stale_probes() {
        let mut pool = ProbePool::new(16, ms(50), 10, 0.75);
        let old = Instant::now();
        pool.insert(ProbeInfo::new("a".to_string(), 1, ms(10), old));
        pool.refresh_normalization();

        assert_eq!(pool.purge_expired(old + ms(49)), 0);
        assert_eq!(pool.purge_expired(old + ms(50)), 1);
    }

    #[test]
    fn test_max_rif_is_monotonic() {
        let mut pool = pool(16, 0.75);
        pool.insert(probe("a", 50, ms(10)));
        pool.refresh_normalization();
        assert_eq!(pool.max_rif(), 50);

        // Dropping the high-RIF probe must not lower the ceiling.
        pool.evict_one();
        pool.insert(probe("b", 5, ms(10)));
        pool.refresh_normalization();
        assert_eq!(pool.max_rif(), 50);
        assert!((pool.probes()[0].normalized_rif - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_normalization_with_zero_ceiling() {
        let mut pool = pool(16, 0.75);
        pool.insert(probe("a", 0, ms(10)));
        pool.refresh_normalization();

        assert_eq!(pool.max_rif(), 0);
        assert_eq!(pool.probes()[0].normalized_rif, 1.0);
    }
}
