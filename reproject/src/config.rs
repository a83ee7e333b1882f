//! Tuning knobs of a view schema migration.

use std::time::Duration;

/// Replay and cleanup settings used by [`crate::ViewSchema`].
#[derive(Debug, Clone)]
pub struct ViewSchemaConfig {
    /// Number of events read and projected per block
    pub block_size: u16,

    /// Maximum number of replay groups processed at the same time
    pub number_of_replay_workers: usize,

    /// Group exponent of the online replay, `16^k` groups
    pub online_group_exponent: u32,

    /// Group exponent of the offline replay
    pub offline_group_exponent: u32,

    /// Default group exponent of a dry run
    pub dryrun_group_exponent: u32,

    /// Only events created within this window are considered offline
    pub offline_recency_window: Duration,

    /// How many versions below the current one are checked for stale tables
    pub old_version_lookback: u32,
}

impl Default for ViewSchemaConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            number_of_replay_workers: NUMBER_OF_REPLAY_WORKERS,
            online_group_exponent: ONLINE_GROUP_EXPONENT,
            offline_group_exponent: OFFLINE_GROUP_EXPONENT,
            dryrun_group_exponent: DRYRUN_GROUP_EXPONENT,
            offline_recency_window: OFFLINE_RECENCY_WINDOW,
            old_version_lookback: OLD_VERSION_LOOKBACK,
        }
    }
}

/// Default number of events per replay block
///
/// Each block is one read against the event store followed by one ledger
/// insert of its event ids.
pub const DEFAULT_BLOCK_SIZE: u16 = 1000;

/// Default number of concurrent replay workers
///
/// Each worker uses its own connection, size the pool accordingly.
pub const NUMBER_OF_REPLAY_WORKERS: usize = 4;

/// Default online group exponent, `16^3 = 4096` groups of one prefix each
pub const ONLINE_GROUP_EXPONENT: u32 = 3;

/// Default offline group exponent
///
/// The offline replay only processes the gap left by the online phase, few
/// groups are enough.
pub const OFFLINE_GROUP_EXPONENT: u32 = 1;

/// Default dry run group exponent
pub const DRYRUN_GROUP_EXPONENT: u32 = 3;

/// Default offline recency window
pub const OFFLINE_RECENCY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Default lookback used when dropping tables of aborted migrations
pub const OLD_VERSION_LOOKBACK: u32 = 10;

/// Configuration builder for customizing view schema migrations
#[derive(Debug)]
pub struct ConfigBuilder {
    config: ViewSchemaConfig,
}

impl ConfigBuilder {
    /// Create a new configuration builder with default values
    pub fn new() -> Self {
        Self {
            config: ViewSchemaConfig::default(),
        }
    }

    /// Set the number of events per replay block
    pub fn block_size(mut self, size: u16) -> Self {
        self.config.block_size = size.max(1);
        self
    }

    /// Set the number of concurrent replay workers
    pub fn replay_workers(mut self, workers: usize) -> Self {
        self.config.number_of_replay_workers = workers.max(1);
        self
    }

    /// Set the online group exponent
    pub fn online_group_exponent(mut self, exponent: u32) -> Self {
        self.config.online_group_exponent = exponent;
        self
    }

    /// Set the offline group exponent
    pub fn offline_group_exponent(mut self, exponent: u32) -> Self {
        self.config.offline_group_exponent = exponent;
        self
    }

    /// Set the default dry run group exponent
    pub fn dryrun_group_exponent(mut self, exponent: u32) -> Self {
        self.config.dryrun_group_exponent = exponent;
        self
    }

    /// Set the offline recency window
    pub fn offline_recency_window(mut self, window: Duration) -> Self {
        self.config.offline_recency_window = window;
        self
    }

    /// Set the stale table lookback
    pub fn old_version_lookback(mut self, versions: u32) -> Self {
        self.config.old_version_lookback = versions;
        self
    }

    /// Build the final configuration
    pub fn build(self) -> ViewSchemaConfig {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
