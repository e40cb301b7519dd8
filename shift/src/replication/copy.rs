use metrics::{counter, histogram};
use shift_config::shared::EngineConfig;
use std::time::Instant;
use tracing::{debug, info};

use crate::concurrency::cancel::StopSignals;
use crate::error::ShiftResult;
#[cfg(feature = "failpoints")]
use crate::failpoints::{COPY_AFTER_CHUNK, shift_fail_point};
use crate::metrics::{SHARD, SHIFT_COPY_CHUNK_DURATION_SECONDS, SHIFT_ROWS_COPIED_TOTAL};
use crate::replication::PhaseOutcome;
use crate::schema::RowTranslator;
use crate::state::RecordWriter;
use crate::storage::SchemaEngine;
use crate::store::MigrationStore;
use crate::throttle::Throttler;
use crate::types::TableRow;

/// Copies the rows of the live table into the shadow table, starting after the persisted cursor.
///
/// Each chunk is read, translated, written and checkpointed before the next one is read, so a
/// crash re-copies at most one chunk. Rewriting a chunk is harmless since rows are upserted.
pub async fn copy_table<D, S>(
    database: &D,
    writer: &mut RecordWriter<S>,
    translator: &RowTranslator,
    config: &EngineConfig,
    throttler: &Throttler,
    stop: &mut StopSignals,
) -> ShiftResult<PhaseOutcome>
where
    D: SchemaEngine,
    S: MigrationStore,
{
    let source_table = writer.record().request.table.clone();
    let shadow_table = writer.record().shadow_table.clone();
    let shard = writer.record().shard.to_string();
    let chunk_size = config.copy.chunk_size;

    info!(
        cursor = ?writer.record().progress.copy_cursor,
        "copying rows into shadow table {shadow_table}"
    );

    loop {
        if let Some(reason) = stop.check() {
            return Ok(PhaseOutcome::Stopped(reason));
        }
        if let Some(reason) = throttler.wait_until_open(stop).await {
            return Ok(PhaseOutcome::Stopped(reason));
        }

        let started = Instant::now();
        let cursor = writer.record().progress.copy_cursor.clone();
        let rows = database
            .read_chunk(&source_table, cursor.as_ref(), chunk_size)
            .await?;
        let Some(last_row) = rows.last() else {
            break;
        };

        let next_cursor = translator.source_key(last_row)?;
        let read = rows.len();
        let translated = rows
            .iter()
            .map(|row| translator.translate(row))
            .collect::<ShiftResult<Vec<TableRow>>>()?;
        database.upsert_rows(&shadow_table, translated).await?;

        let progress = writer.progress_mut();
        progress.copy_cursor = Some(next_cursor);
        progress.rows_copied += read as u64;
        writer.checkpoint().await?;

        counter!(SHIFT_ROWS_COPIED_TOTAL, SHARD => shard.clone()).increment(read as u64);
        histogram!(SHIFT_COPY_CHUNK_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        debug!(rows = read, "copied chunk");

        #[cfg(feature = "failpoints")]
        shift_fail_point(COPY_AFTER_CHUNK)?;

        if read < chunk_size {
            break;
        }
    }

    info!(
        rows_copied = writer.record().progress.rows_copied,
        "bulk copy finished"
    );

    Ok(PhaseOutcome::Finished)
}
