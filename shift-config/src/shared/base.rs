use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("`max_concurrent_migrations` cannot be zero")]
    MaxConcurrentMigrationsZero,

    #[error("`copy.chunk_size` cannot be zero")]
    CopyChunkSizeZero,

    #[error("`sync.batch_size` cannot be zero")]
    SyncBatchSizeZero,

    #[error("`sync.batch_max_fill_ms` cannot be zero")]
    SyncBatchMaxFillZero,

    #[error("`throttle.hysteresis` must be in [0, 1), got {0}")]
    InvalidThrottleHysteresis(f64),

    #[error("`throttle.threshold` must be positive, got {0}")]
    InvalidThrottleThreshold(f64),

    #[error("`cutover.max_attempts` cannot be zero")]
    CutoverMaxAttemptsZero,

    #[error("`feed_retry.max_attempts` cannot be zero")]
    FeedRetryMaxAttemptsZero,

    #[error("`feed_retry.backoff_factor` must be at least 1.0, got {0}")]
    InvalidBackoffFactor(f32),
}
