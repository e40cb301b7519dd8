use serde::Deserialize;
use std::time::Duration;

/// Change replay and convergence settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum number of change feed messages applied to the shadow table in one batch.
    pub batch_size: usize,
    /// Maximum time in milliseconds spent filling a batch of change feed messages before
    /// applying it.
    pub batch_max_fill_ms: u64,
    /// Maximum distance, in change feed positions, between the live position and the applied
    /// position for the shadow table to be considered caught up.
    pub convergence_bound: u64,
    /// Minimum time in milliseconds the lag has to stay within the bound before cutover.
    pub convergence_dwell_ms: u64,
    /// Interval in milliseconds between two convergence observations while the feed is idle.
    pub check_interval_ms: u64,
    /// Maximum time in milliseconds spent in syncing before the migration fails, unbounded if unset.
    pub max_convergence_wait_ms: Option<u64>,
    /// Time in milliseconds after which an unavailable change feed fails the migration.
    pub feed_unavailable_timeout_ms: u64,
}

impl SyncConfig {
    pub fn batch_max_fill(&self) -> Duration {
        Duration::from_millis(self.batch_max_fill_ms)
    }

    pub fn convergence_dwell(&self) -> Duration {
        Duration::from_millis(self.convergence_dwell_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn max_convergence_wait(&self) -> Option<Duration> {
        self.max_convergence_wait_ms.map(Duration::from_millis)
    }

    pub fn feed_unavailable_timeout(&self) -> Duration {
        Duration::from_millis(self.feed_unavailable_timeout_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 1_000,
            batch_max_fill_ms: 100,
            convergence_bound: 100,
            convergence_dwell_ms: 500,
            check_interval_ms: 100,
            max_convergence_wait_ms: Some(60 * 60 * 1_000),
            feed_unavailable_timeout_ms: 60 * 1_000,
        }
    }
}
