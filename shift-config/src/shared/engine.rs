use serde::Deserialize;

use crate::shared::{
    CopyConfig, CutoverConfig, RetryConfig, SyncConfig, ThrottleConfig, ValidationError,
};

/// Configuration of the migration engine.
///
/// Every section falls back to its defaults when absent from the configuration sources.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of migrations executing concurrently on one shard.
    pub max_concurrent_migrations: usize,
    pub copy: CopyConfig,
    pub sync: SyncConfig,
    pub cutover: CutoverConfig,
    pub throttle: ThrottleConfig,
    /// Retry policy for transient change feed errors.
    pub feed_retry: RetryConfig,
}

impl EngineConfig {
    /// Validates the configuration, returning the first invalid setting found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_concurrent_migrations == 0 {
            return Err(ValidationError::MaxConcurrentMigrationsZero);
        }

        if self.copy.chunk_size == 0 {
            return Err(ValidationError::CopyChunkSizeZero);
        }

        if self.sync.batch_size == 0 {
            return Err(ValidationError::SyncBatchSizeZero);
        }

        if self.sync.batch_max_fill_ms == 0 {
            return Err(ValidationError::SyncBatchMaxFillZero);
        }

        if self.throttle.threshold.is_nan() || self.throttle.threshold <= 0.0 {
            return Err(ValidationError::InvalidThrottleThreshold(
                self.throttle.threshold,
            ));
        }

        if !(0.0..1.0).contains(&self.throttle.hysteresis) {
            return Err(ValidationError::InvalidThrottleHysteresis(
                self.throttle.hysteresis,
            ));
        }

        if self.cutover.max_attempts == 0 {
            return Err(ValidationError::CutoverMaxAttemptsZero);
        }

        if self.feed_retry.max_attempts == 0 {
            return Err(ValidationError::FeedRetryMaxAttemptsZero);
        }

        if self.feed_retry.backoff_factor < 1.0 {
            return Err(ValidationError::InvalidBackoffFactor(
                self.feed_retry.backoff_factor,
            ));
        }

        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_migrations: 4,
            copy: CopyConfig::default(),
            sync: SyncConfig::default(),
            cutover: CutoverConfig::default(),
            throttle: ThrottleConfig::default(),
            feed_retry: RetryConfig::default(),
        }
    }
}
