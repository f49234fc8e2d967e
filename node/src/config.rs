use crate::Error;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fs::File,
    num::{NonZeroU64, NonZeroUsize},
    path::{Path, PathBuf},
    time::Duration,
};
use xshard_collator::{
    engine,
    types::{ShardId, MAX_NEIGHBORS},
};

/// Node configuration, read from a YAML file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the cursor store.
    pub storage_dir: PathBuf,

    /// Storage partition of the cursor store within `storage_dir`.
    #[serde(default = "default_partition")]
    pub partition: String,

    /// Shard this collator builds blocks for.
    pub shard: ShardId,

    /// Initial neighbors (also the static membership).
    pub neighbors: Vec<ShardId>,

    /// Number of snapshots to retain (all if unset).
    #[serde(default)]
    pub retention: Option<NonZeroU64>,

    pub engine: EngineConfig,

    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Partition used when none is configured.
pub const DEFAULT_PARTITION: &str = "collator";

fn default_partition() -> String {
    DEFAULT_PARTITION.into()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    pub max_batch: NonZeroUsize,
    pub max_messages: NonZeroUsize,
    pub concurrency: NonZeroUsize,
    pub fetch_timeout_ms: u64,
    pub cycle_interval_ms: u64,
    pub unavailable_threshold: u32,
}

impl From<&EngineConfig> for engine::Config {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            max_batch: cfg.max_batch,
            max_messages: cfg.max_messages,
            concurrency: cfg.concurrency,
            fetch_timeout: Duration::from_millis(cfg.fetch_timeout_ms),
            cycle_interval: Duration::from_millis(cfg.cycle_interval_ms),
            unavailable_threshold: cfg.unavailable_threshold,
        }
    }
}

/// Parameters of the simulated neighbor traffic.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Seed for all simulated randomness.
    pub seed: u64,

    /// How often each neighbor may produce a block.
    pub block_interval_ms: u64,

    /// Probability that a neighbor produces a block on each tick.
    pub block_probability: f64,

    /// Maximum number of cross-shard messages in a neighbor block.
    pub max_txs: usize,

    /// Probability that a neighbor toggles between online and offline on each tick.
    pub outage_probability: f64,

    /// Probability that the local pipeline aborts a block.
    pub abort_probability: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            block_interval_ms: 100,
            block_probability: 0.5,
            max_txs: 8,
            outage_probability: 0.0,
            abort_probability: 0.0,
        }
    }
}

impl Config {
    /// Read and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)?;
        let cfg: Self = serde_yaml::from_reader(file)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), Error> {
        let unique: BTreeSet<_> = self.neighbors.iter().collect();
        if self.partition.is_empty() {
            return Err(Error::InvalidConfig("empty partition".into()));
        }
        if unique.len() != self.neighbors.len() {
            return Err(Error::InvalidConfig("duplicate neighbor".into()));
        }
        if unique.contains(&self.shard) {
            return Err(Error::InvalidConfig(format!(
                "shard {} cannot be its own neighbor",
                self.shard
            )));
        }
        if unique.len() > MAX_NEIGHBORS {
            return Err(Error::InvalidConfig(format!(
                "{} neighbors exceeds the limit of {}",
                unique.len(),
                MAX_NEIGHBORS
            )));
        }
        let sim = &self.simulation;
        for (name, p) in [
            ("block_probability", sim.block_probability),
            ("outage_probability", sim.outage_probability),
            ("abort_probability", sim.abort_probability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(Error::InvalidConfig(format!("{name} must be within [0, 1]")));
            }
        }
        Ok(())
    }
}
