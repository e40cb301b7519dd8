//! Cutover coordinator: publishes a converged shadow table as the live table.
//!
//! The swap is made of three renames:
//!
//! 1. live table to the retired name,
//! 2. shadow table to the live name,
//! 3. retired table to the drop-pending name.
//!
//! They run while every client write on the live table is fenced, either as a single atomic
//! rename when the engine supports it or one by one. Before renaming, the coordinator looks at
//! which tables exist to find out how far a previous, interrupted attempt went and resumes from
//! the next rename.
//!
//! Once a rename took effect the migration can only move forward: a failing rename is retried
//! from the stage found by inspection, and the migration stays in `CuttingOver` until every
//! rename is done.

use metrics::counter;
use shift_config::shared::EngineConfig;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{ErrorKind, ShiftError, ShiftResult};
#[cfg(feature = "failpoints")]
use crate::failpoints::{CUTOVER_AFTER_RENAME_STEP, CUTOVER_BEFORE_RENAME, shift_fail_point};
use crate::metrics::{SHARD, SHIFT_CUTOVER_ATTEMPTS_TOTAL};
use crate::replication::apply::ChangeApplier;
use crate::state::{MigrationRecord, RecordWriter};
use crate::storage::{ChangeFeed, SchemaEngine};
use crate::store::MigrationStore;
use crate::{bail, shift_error};

/// Outcome of a cutover attempt.
#[derive(Debug)]
pub enum CutoverOutcome {
    /// The shadow table is live.
    Complete,
    /// Nothing was renamed, either because exclusive access could not be obtained in time or
    /// because the first rename failed. The migration should return to syncing and try again.
    Retry(ShiftError),
    /// A rename failed after another one took effect. The migration must stay in `CuttingOver`
    /// and resume the remaining renames.
    Resume(ShiftError),
}

/// Progress of the rename sequence, inferred from the tables present on the shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RenameStage {
    /// No rename took effect yet.
    NotStarted,
    /// The live table was retired but the shadow table is not published.
    LiveRetired,
    /// The shadow table is published, the retired table still has its temporary name.
    ShadowPublished,
    /// Every rename took effect.
    Done,
}

/// Names of the tables taking part in the rename sequence.
#[derive(Debug, Clone)]
struct CutoverTables {
    live: String,
    shadow: String,
    retired: String,
    drop_pending: String,
}

impl CutoverTables {
    fn of(record: &MigrationRecord) -> Self {
        let id = record.id();

        Self {
            live: record.request.table.clone(),
            shadow: record.shadow_table.clone(),
            retired: id.retired_table_name(),
            drop_pending: id.drop_pending_table_name(),
        }
    }

    fn renames_from(&self, stage: RenameStage) -> Vec<(String, String)> {
        let all = [
            (self.live.clone(), self.retired.clone()),
            (self.shadow.clone(), self.live.clone()),
            (self.retired.clone(), self.drop_pending.clone()),
        ];
        let skip = match stage {
            RenameStage::NotStarted => 0,
            RenameStage::LiveRetired => 1,
            RenameStage::ShadowPublished => 2,
            RenameStage::Done => 3,
        };

        all.into_iter().skip(skip).collect()
    }
}

async fn table_exists<D: SchemaEngine>(database: &D, table: &str) -> ShiftResult<bool> {
    Ok(database.table_schema(table).await?.is_some())
}

/// Finds out which renames already took effect.
///
/// Only called once the shadow table was created, so a live table without shadow nor retired
/// table means every rename took effect and the drop-pending table may already be gone.
async fn inspect<D: SchemaEngine>(
    database: &D,
    tables: &CutoverTables,
) -> ShiftResult<RenameStage> {
    let live = table_exists(database, &tables.live).await?;
    let shadow = table_exists(database, &tables.shadow).await?;
    let retired = table_exists(database, &tables.retired).await?;

    let stage = match (live, shadow, retired) {
        (true, true, false) => RenameStage::NotStarted,
        (false, true, true) => RenameStage::LiveRetired,
        (true, false, true) => RenameStage::ShadowPublished,
        (true, false, false) => RenameStage::Done,
        _ => bail!(
            ErrorKind::CutoverFailed,
            "Tables are in an unexpected state for cutover",
            format!(
                "live `{}`: {live}, shadow `{}`: {shadow}, retired `{}`: {retired}",
                tables.live, tables.shadow, tables.retired
            )
        ),
    };

    Ok(stage)
}

/// Returns `true` if at least one rename of the cutover of `record` took effect.
///
/// A migration in this situation must not fail, its live table may be missing until the
/// remaining renames run.
pub async fn renames_started<D: SchemaEngine>(
    database: &D,
    record: &MigrationRecord,
) -> ShiftResult<bool> {
    let stage = inspect(database, &CutoverTables::of(record)).await?;

    Ok(stage != RenameStage::NotStarted)
}

async fn rename<D: SchemaEngine>(database: &D, renames: &[(String, String)]) -> ShiftResult<()> {
    if database.supports_atomic_rename() {
        return database.rename_tables(renames).await;
    }

    for step in renames {
        database.rename_tables(std::slice::from_ref(step)).await?;
        info!(from = %step.0, to = %step.1, "rename step done");

        #[cfg(feature = "failpoints")]
        shift_fail_point(CUTOVER_AFTER_RENAME_STEP)?;
    }

    Ok(())
}

/// Runs one cutover attempt for the migration owned by `writer`.
///
/// The write fence is held from before the drain of the last changes until the renames are
/// done, so every write committed on the live table before the swap is in the shadow table and
/// every later write lands in the new live table.
pub async fn run_cutover<D, S>(
    database: &D,
    applier: Option<&mut ChangeApplier<D>>,
    writer: &mut RecordWriter<S>,
    config: &EngineConfig,
) -> ShiftResult<CutoverOutcome>
where
    D: SchemaEngine + ChangeFeed,
    S: MigrationStore,
{
    let tables = CutoverTables::of(writer.record());

    writer.progress_mut().cutover_attempts += 1;
    writer.checkpoint().await?;
    counter!(SHIFT_CUTOVER_ATTEMPTS_TOTAL, SHARD => writer.record().shard.to_string())
        .increment(1);

    let stage = inspect(database, &tables).await?;
    info!(?stage, attempt = writer.record().progress.cutover_attempts, "starting cutover");

    if stage != RenameStage::Done {
        let fence = match database
            .acquire_write_fence(&tables.live, config.cutover.lock_timeout())
            .await
        {
            Ok(fence) => fence,
            Err(err) if err.kind() == ErrorKind::LockTimeout => {
                warn!(error = %err, "could not fence writes on the live table");
                return Ok(CutoverOutcome::Retry(err));
            }
            Err(err) => return Err(err),
        };

        if stage == RenameStage::NotStarted {
            let Some(applier) = applier else {
                bail!(
                    ErrorKind::CutoverFailed,
                    "Cannot drain changes without a change applier",
                    format!("shadow table `{}`", tables.shadow)
                );
            };
            let live_position = database.live_position().await?;
            let deadline = Instant::now() + config.cutover.drain_timeout();
            if !applier.catch_up_to(writer, live_position, deadline).await? {
                drop(fence);
                return Ok(CutoverOutcome::Retry(shift_error!(
                    ErrorKind::LockTimeout,
                    "Timed out draining changes while writes were fenced",
                    format!("drain to position {live_position}")
                )));
            }
            // The drain must be durable before the live table is renamed away.
            writer.checkpoint().await?;
        }

        #[cfg(feature = "failpoints")]
        shift_fail_point(CUTOVER_BEFORE_RENAME)?;

        if let Err(err) = rename(database, &tables.renames_from(stage)).await {
            drop(fence);
            let stage = inspect(database, &tables).await?;
            warn!(error = %err, ?stage, "rename failed during cutover");

            return Ok(match stage {
                RenameStage::NotStarted => CutoverOutcome::Retry(err),
                _ => CutoverOutcome::Resume(err),
            });
        }
        drop(fence);
        info!("shadow table {} is now live", tables.shadow);
    }

    if config.cutover.drop_retired_table {
        // The new live table is in place, a leftover retired table is not worth failing for.
        match database.drop_table(&tables.drop_pending).await {
            Ok(true) => info!("dropped retired table {}", tables.drop_pending),
            Ok(false) => {}
            Err(err) => warn!(error = %err, "failed to drop retired table {}", tables.drop_pending),
        }
    }

    Ok(CutoverOutcome::Complete)
}
