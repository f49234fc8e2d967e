use commonware_utils::NZUsize;
use std::{num::NonZeroUsize, time::Duration};

/// Configuration for the [super::Engine].
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum number of messages requested from a single neighbor per cycle.
    pub max_batch: NonZeroUsize,

    /// Maximum number of messages included in a single block (across all neighbors).
    pub max_messages: NonZeroUsize,

    /// Number of neighbor fetches allowed in flight at once.
    pub concurrency: NonZeroUsize,

    /// How long to wait for a single neighbor before treating it as unavailable.
    pub fetch_timeout: Duration,

    /// Pause between cycles in [super::Engine::run].
    pub cycle_interval: Duration,

    /// Consecutive unavailable cycles after which a neighbor is logged as an error
    /// (rather than a warning).
    pub unavailable_threshold: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_batch: NZUsize!(256),
            max_messages: NZUsize!(1024),
            concurrency: NZUsize!(16),
            fetch_timeout: Duration::from_secs(2),
            cycle_interval: Duration::from_millis(500),
            unavailable_threshold: 10,
        }
    }
}
