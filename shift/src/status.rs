//! Migration-wide view over the per-shard records of a migration.

use crate::bail;
use crate::error::{ErrorKind, ShiftResult};
use crate::state::{MigrationRecord, MigrationStatus};
use crate::store::MigrationStore;
use crate::types::MigrationId;

/// Status of a migration across every shard, along with the raw per-shard records.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationStatusView {
    pub id: MigrationId,
    pub status: MigrationStatus,
    pub shards: Vec<MigrationRecord>,
}

impl MigrationStatusView {
    /// Builds the view of migration `id` from its per-shard records.
    ///
    /// Returns `None` if there are no records.
    pub fn from_records(id: MigrationId, shards: Vec<MigrationRecord>) -> Option<Self> {
        let status = aggregate_status(&shards)?;

        Some(Self { id, status, shards })
    }

    /// Returns `true` once every shard reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.shards.iter().all(|record| record.status.is_terminal())
    }

    /// Messages of the failed shards, prefixed by the shard name.
    pub fn failures(&self) -> Vec<String> {
        self.shards
            .iter()
            .filter(|record| record.status == MigrationStatus::Failed)
            .map(|record| {
                let message = record.message.as_deref().unwrap_or("unknown error");
                format!("{}: {message}", record.shard)
            })
            .collect()
    }
}

/// Folds per-shard statuses into the status of the migration.
///
/// A failed shard makes the whole migration failed, even if other shards completed: completed
/// shards are never rolled back. Otherwise the migration is as advanced as its least advanced
/// running shard, and complete only once every shard is.
pub fn aggregate_status(records: &[MigrationRecord]) -> Option<MigrationStatus> {
    if records.is_empty() {
        return None;
    }

    if records
        .iter()
        .any(|record| record.status == MigrationStatus::Failed)
    {
        return Some(MigrationStatus::Failed);
    }

    if let Some(least_advanced) = records
        .iter()
        .map(|record| record.status)
        .filter(|status| !status.is_terminal())
        .min_by_key(|status| status.rank())
    {
        return Some(least_advanced);
    }

    if records
        .iter()
        .all(|record| record.status == MigrationStatus::Complete)
    {
        return Some(MigrationStatus::Complete);
    }

    // Every shard ended, some of them cancelled.
    Some(MigrationStatus::Cancelled)
}

/// Reads the records of migration `id` from `store` and aggregates them.
pub async fn migration_status<S: MigrationStore>(
    store: &S,
    id: MigrationId,
) -> ShiftResult<MigrationStatusView> {
    let records = store.get_records(id).await?;

    match MigrationStatusView::from_records(id, records) {
        Some(view) => Ok(view),
        None => bail!(
            ErrorKind::MigrationNotFound,
            "Migration does not exist",
            format!("migration {id}")
        ),
    }
}
