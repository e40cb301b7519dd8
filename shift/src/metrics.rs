use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};

static REGISTER_METRICS: Once = Once::new();

pub const SHIFT_MIGRATIONS_TOTAL: &str = "shift_migrations_total";
pub const SHIFT_ROWS_COPIED_TOTAL: &str = "shift_rows_copied_total";
pub const SHIFT_EVENTS_APPLIED_TOTAL: &str = "shift_events_applied_total";
pub const SHIFT_COPY_CHUNK_DURATION_SECONDS: &str = "shift_copy_chunk_duration_seconds";
pub const SHIFT_SYNC_LAG: &str = "shift_sync_lag";
pub const SHIFT_THROTTLED_TOTAL: &str = "shift_throttled_total";
pub const SHIFT_CUTOVER_ATTEMPTS_TOTAL: &str = "shift_cutover_attempts_total";
pub const STATUS: &str = "status";
pub const SHARD: &str = "shard";

/// Describes the metrics emitted by the engine. Safe to call many times, the metrics are only
/// described once.
pub(crate) fn register_metrics() {
    REGISTER_METRICS.call_once(|| {
        describe_gauge!(
            SHIFT_MIGRATIONS_TOTAL,
            Unit::Count,
            "Number of shard migrations per status"
        );

        describe_counter!(
            SHIFT_ROWS_COPIED_TOTAL,
            Unit::Count,
            "Rows copied into shadow tables"
        );

        describe_counter!(
            SHIFT_EVENTS_APPLIED_TOTAL,
            Unit::Count,
            "Change events applied to shadow tables"
        );

        describe_histogram!(
            SHIFT_COPY_CHUNK_DURATION_SECONDS,
            Unit::Seconds,
            "Time taken to copy one chunk of rows into a shadow table"
        );

        describe_gauge!(
            SHIFT_SYNC_LAG,
            Unit::Count,
            "Feed positions between the live position and the applied position of a shadow table"
        );

        describe_counter!(
            SHIFT_THROTTLED_TOTAL,
            Unit::Count,
            "Times the throttler paused copy and replay"
        );

        describe_counter!(
            SHIFT_CUTOVER_ATTEMPTS_TOTAL,
            Unit::Count,
            "Cutover attempts, including attempts that timed out"
        );
    });
}
