use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Upper bound on the number of replica addresses a client will track.
pub const MAX_SERVERS: usize = 5;

/// Client configuration
///
/// The probe reuse bound is not read from the file; it is derived from the
/// other parameters (see [`ClientConfig::max_probe_use`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Upper bound on the probe pool size (M)
    #[serde(default = "default_max_probe_pool_size")]
    pub max_probe_pool_size: usize,

    /// Number of replicas in the pool (N)
    pub num_replicas: usize,

    /// Probe rounds per second
    pub probe_rate: f64,

    /// Hot/cold split on normalised RIF, typically 0.75
    pub q_rif_threshold: f64,

    /// Safety factor in the probe reuse bound
    #[serde(default = "default_delta_reuse")]
    pub delta_reuse: f64,

    /// Probe time-to-live in seconds
    #[serde(default = "default_max_probe_age")]
    pub max_probe_age: u64,

    /// Replica addresses (host:port), capped at [`MAX_SERVERS`]
    pub servers: Vec<String>,
}

fn default_max_probe_pool_size() -> usize {
    16
}

fn default_delta_reuse() -> f64 {
    0.1
}

fn default_max_probe_age() -> u64 {
    5
}

impl ClientConfig {
    /// Validate parameters and cap the server list.
    pub fn validate(&mut self) -> Result<()> {
        if self.servers.is_empty() {
            anyhow::bail!("servers list is empty");
        }
        if self.servers.len() > MAX_SERVERS {
            warn!(
                configured = self.servers.len(),
                kept = MAX_SERVERS,
                "too many servers configured, ignoring the rest"
            );
            self.servers.truncate(MAX_SERVERS);
        }
        if self.num_replicas == 0 {
            anyhow::bail!("num_replicas must be positive");
        }
        if self.probe_rate <= 0.0 {
            anyhow::bail!("probe_rate must be positive");
        }
        if self.q_rif_threshold <= 0.0 || self.q_rif_threshold > 1.0 {
            anyhow::bail!(
                "q_rif_threshold must be in (0, 1], got {}",
                self.q_rif_threshold
            );
        }
        if self.max_probe_pool_size == 0 {
            anyhow::bail!("max_probe_pool_size must be positive");
        }
        Ok(())
    }

    /// Probe time-to-live.
    pub fn probe_ttl(&self) -> Duration {
        Duration::from_secs(self.max_probe_age)
    }

    /// Interval between probe rounds (1 / probe_rate).
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.probe_rate)
    }

    /// Per-probe timeout: at most one probe interval, so a slow replica can
    /// never starve the prober, with a one second ceiling.
    pub fn probe_timeout(&self) -> Duration {
        self.probe_interval().min(Duration::from_secs(1))
    }

    /// Maximum number of times a probe may be selected before it is purged.
    ///
    /// Balances the expected probe removal rate against the insertion rate,
    /// with `delta_reuse` as a safety factor. A degenerate denominator (pool
    /// turnover outpacing probing) clamps to 1, the only safe value.
    pub fn max_probe_use(&self) -> u32 {
        let r_remove = 1.0 / self.max_probe_age as f64;
        let denom = (1.0
            - (self.max_probe_pool_size as f64 / self.num_replicas as f64) * self.probe_rate)
            - r_remove;

        if denom <= 0.0 {
            return 1;
        }

        let b_reuse = ((1.0 + self.delta_reuse) / denom).ceil();
        if b_reuse < 1.0 {
            1
        } else {
            b_reuse as u32
        }
    }
}

/// Load client configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<ClientConfig> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: ClientConfig =
        serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

    Ok(config)
}

/// Load client configuration from environment variables
///
/// - `PREQUAL_SERVERS` (comma-separated host:port list, required)
/// - `PREQUAL_NUM_REPLICAS` (required)
/// - `PREQUAL_PROBE_RATE` (required)
/// - `PREQUAL_Q_RIF_THRESHOLD` (required)
/// - `PREQUAL_MAX_PROBE_POOL_SIZE` (optional, default 16)
/// - `PREQUAL_DELTA_REUSE` (optional, default 0.1)
/// - `PREQUAL_MAX_PROBE_AGE` (optional seconds, default 5)
pub fn load_from_env() -> Result<ClientConfig> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let servers_str =
        std::env::var("PREQUAL_SERVERS").context("PREQUAL_SERVERS environment variable not set")?;

    let servers: Vec<String> = servers_str
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    if servers.is_empty() {
        anyhow::bail!("PREQUAL_SERVERS contains no valid addresses");
    }

    let num_replicas = std::env::var("PREQUAL_NUM_REPLICAS")
        .context("PREQUAL_NUM_REPLICAS environment variable not set")?
        .parse()
        .context("PREQUAL_NUM_REPLICAS is not a valid integer")?;

    let probe_rate = std::env::var("PREQUAL_PROBE_RATE")
        .context("PREQUAL_PROBE_RATE environment variable not set")?
        .parse()
        .context("PREQUAL_PROBE_RATE is not a valid number")?;

    let q_rif_threshold = std::env::var("PREQUAL_Q_RIF_THRESHOLD")
        .context("PREQUAL_Q_RIF_THRESHOLD environment variable not set")?
        .parse()
        .context("PREQUAL_Q_RIF_THRESHOLD is not a valid number")?;

    let mut config = ClientConfig {
        max_probe_pool_size: default_max_probe_pool_size(),
        num_replicas,
        probe_rate,
        q_rif_threshold,
        delta_reuse: default_delta_reuse(),
        max_probe_age: default_max_probe_age(),
        servers,
    };

    if let Ok(size) = std::env::var("PREQUAL_MAX_PROBE_POOL_SIZE") {
        if let Ok(val) = size.parse() {
            config.max_probe_pool_size = val;
        }
    }

    if let Ok(delta) = std::env::var("PREQUAL_DELTA_REUSE") {
        if let Ok(val) = delta.parse() {
            config.delta_reuse = val;
        }
    }

    if let Ok(age) = std::env::var("PREQUAL_MAX_PROBE_AGE") {
        if let Ok(val) = age.parse() {
            config.max_probe_age = val;
        }
    }

    Ok(config)
}

/// Load configuration from file or environment
///
/// Tries the YAML file when a path is given, otherwise falls back to
/// environment variables. The returned configuration is validated.
pub fn load_config(config_path: Option<&str>) -> Result<ClientConfig> {
    let mut config = if let Some(path) = config_path {
        load_from_yaml(path)?
    } else {
        load_from_env()?
    };

    config.validate()?;
    Ok(config)
}
