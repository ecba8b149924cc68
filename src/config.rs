use std::time::Duration;

use crate::error::ConfigError;

/// Default interval between gossip rounds in milliseconds.
pub const DEFAULT_GOSSIP_INTERVAL_MILLIS: u64 = 1_000;

/// Default time a tombstone is kept before it is purged, in seconds.
pub const DEFAULT_REMOVED_TIME_TO_LIVE_SECS: u64 = 120;

/// Default interval between tombstone purge passes, in seconds.
pub const DEFAULT_PRUNE_INTERVAL_SECS: u64 = 60;

/// Default maximum number of registrations carried by a single delta.
pub const DEFAULT_MAX_DELTA_ELEMENTS: usize = 3_000;

/// Configuration for a pubsub mediator.
#[derive(Debug, Clone)]
pub struct MediatorConfig {
    /// Interval between gossip rounds.
    pub gossip_interval: Duration,
    /// How long a tombstoned registration is retained before being purged.
    ///
    /// Must comfortably exceed the time gossip needs to reach every member, otherwise a stale
    /// delta can bring a removed registration back.
    pub removed_time_to_live: Duration,
    /// Interval between tombstone purge passes.
    pub prune_interval: Duration,
    /// Maximum number of registrations sent to one peer per gossip round.
    pub max_delta_elements: usize,
}

impl MediatorConfig {
    /// Checks every value is in range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gossip_interval.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "gossip_interval must be greater than zero".to_string(),
            ));
        }
        if self.prune_interval.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "prune_interval must be greater than zero".to_string(),
            ));
        }
        if self.removed_time_to_live.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "removed_time_to_live must be greater than zero".to_string(),
            ));
        }
        if self.max_delta_elements == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_delta_elements must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            gossip_interval: Duration::from_millis(DEFAULT_GOSSIP_INTERVAL_MILLIS),
            removed_time_to_live: Duration::from_secs(DEFAULT_REMOVED_TIME_TO_LIVE_SECS),
            prune_interval: Duration::from_secs(DEFAULT_PRUNE_INTERVAL_SECS),
            max_delta_elements: DEFAULT_MAX_DELTA_ELEMENTS,
        }
    }
}
