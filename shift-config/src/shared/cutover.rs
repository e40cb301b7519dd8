use serde::Deserialize;
use std::time::Duration;

/// Settings of the cutover critical section.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CutoverConfig {
    /// Maximum time in milliseconds to wait for exclusive write access to the live table.
    pub lock_timeout_ms: u64,
    /// Maximum time in milliseconds spent replaying the last changes while writes are fenced.
    pub drain_timeout_ms: u64,
    /// Number of cutover attempts before the migration fails.
    pub max_attempts: u32,
    /// Delay in milliseconds before re-checking convergence after a failed attempt.
    pub retry_delay_ms: u64,
    /// Whether the retired table is dropped after a successful cutover.
    ///
    /// When `false`, the table is kept under its drop-pending name for external cleanup.
    pub drop_retired_table: bool,
}

impl CutoverConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for CutoverConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 2_000,
            drain_timeout_ms: 3_000,
            max_attempts: 5,
            retry_delay_ms: 250,
            drop_retired_table: true,
        }
    }
}
