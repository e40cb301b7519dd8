use shift_config::shared::PgConnectionConfig;
use shift_postgres::migrations::connect_store_pool;
use shift_postgres::schema_migrations::{self, MigrationStatusType, SchemaMigrationRow};
use sqlx::PgPool;
use tracing::debug;

use crate::error::{ErrorKind, ShiftError, ShiftResult};
use crate::state::{MigrationProgress, MigrationRecord, MigrationStatus};
use crate::store::MigrationStore;
use crate::types::{DdlStrategy, MigrationId, MigrationRequest, ShardId};
use crate::{bail, shift_error};

const NUM_POOL_CONNECTIONS: u32 = 4;

impl From<MigrationStatus> for MigrationStatusType {
    fn from(status: MigrationStatus) -> Self {
        match status {
            MigrationStatus::Requested => MigrationStatusType::Requested,
            MigrationStatus::Queued => MigrationStatusType::Queued,
            MigrationStatus::Ready => MigrationStatusType::Ready,
            MigrationStatus::Copying => MigrationStatusType::Copying,
            MigrationStatus::Syncing => MigrationStatusType::Syncing,
            MigrationStatus::CuttingOver => MigrationStatusType::CuttingOver,
            MigrationStatus::Complete => MigrationStatusType::Complete,
            MigrationStatus::Failed => MigrationStatusType::Failed,
            MigrationStatus::Cancelled => MigrationStatusType::Cancelled,
        }
    }
}

impl From<MigrationStatusType> for MigrationStatus {
    fn from(status: MigrationStatusType) -> Self {
        match status {
            MigrationStatusType::Requested => MigrationStatus::Requested,
            MigrationStatusType::Queued => MigrationStatus::Queued,
            MigrationStatusType::Ready => MigrationStatus::Ready,
            MigrationStatusType::Copying => MigrationStatus::Copying,
            MigrationStatusType::Syncing => MigrationStatus::Syncing,
            MigrationStatusType::CuttingOver => MigrationStatus::CuttingOver,
            MigrationStatusType::Complete => MigrationStatus::Complete,
            MigrationStatusType::Failed => MigrationStatus::Failed,
            MigrationStatusType::Cancelled => MigrationStatus::Cancelled,
        }
    }
}

impl TryFrom<&MigrationRecord> for SchemaMigrationRow {
    type Error = ShiftError;

    fn try_from(record: &MigrationRecord) -> Result<Self, Self::Error> {
        let progress = serde_json::to_value(&record.progress).map_err(|err| {
            shift_error!(
                ErrorKind::SerializationError,
                "Failed to serialize migration progress",
                err
            )
        })?;

        Ok(SchemaMigrationRow {
            migration_id: record.id().into_inner(),
            keyspace: record.request.keyspace.clone(),
            shard: record.shard.to_string(),
            table_name: record.request.table.clone(),
            alter_statement: record.request.alter_statement.clone(),
            strategy: record.request.strategy.to_string(),
            options: record.request.options.to_string(),
            status: record.status.into(),
            progress,
            message: record.message.clone(),
            requested_at: record.request.requested_at,
            started_at: record.started_at,
            completed_at: record.completed_at,
        })
    }
}

impl TryFrom<SchemaMigrationRow> for MigrationRecord {
    type Error = ShiftError;

    fn try_from(row: SchemaMigrationRow) -> Result<Self, Self::Error> {
        let id = MigrationId::from(row.migration_id);
        let strategy: DdlStrategy = row.strategy.parse()?;
        let progress: MigrationProgress = serde_json::from_value(row.progress)?;

        let shadow_table = id.shadow_table_name();
        let request = MigrationRequest {
            id,
            keyspace: row.keyspace,
            table: row.table_name,
            alter_statement: row.alter_statement,
            strategy,
            options: row.options.parse()?,
            requested_at: row.requested_at,
        };

        Ok(MigrationRecord {
            request,
            shard: ShardId::new(row.shard),
            status: row.status.into(),
            shadow_table,
            progress,
            started_at: row.started_at,
            completed_at: row.completed_at,
            message: row.message,
        })
    }
}

/// A [`MigrationStore`] persisting records in `shift.schema_migrations`.
///
/// The table is created by [`shift_postgres::migrations::migrate_store`], which must have run
/// against the same database.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a store connecting lazily to the database described by `connection_config`.
    pub fn new(connection_config: &PgConnectionConfig) -> Self {
        Self {
            pool: connect_store_pool(connection_config, NUM_POOL_CONNECTIONS),
        }
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn into_records(rows: Vec<SchemaMigrationRow>) -> ShiftResult<Vec<MigrationRecord>> {
    rows.into_iter().map(MigrationRecord::try_from).collect()
}

impl MigrationStore for PostgresStore {
    async fn store_record(&self, record: &MigrationRecord) -> ShiftResult<()> {
        let row = SchemaMigrationRow::try_from(record)?;
        schema_migrations::upsert_schema_migration(&self.pool, &row).await?;

        debug!(
            migration_id = %record.id(),
            shard = %record.shard,
            status = %record.status,
            "stored migration record"
        );

        Ok(())
    }

    async fn get_record(
        &self,
        id: MigrationId,
        shard: &ShardId,
    ) -> ShiftResult<Option<MigrationRecord>> {
        let row =
            schema_migrations::get_schema_migration_row(&self.pool, id.into_inner(), shard.as_str())
                .await?;

        row.map(MigrationRecord::try_from).transpose()
    }

    async fn get_records(&self, id: MigrationId) -> ShiftResult<Vec<MigrationRecord>> {
        let rows = schema_migrations::get_schema_migration_rows(&self.pool, id.into_inner()).await?;

        into_records(rows)
    }

    async fn list_recent(&self, keyspace: &str, limit: usize) -> ShiftResult<Vec<MigrationRecord>> {
        let Ok(limit) = i64::try_from(limit) else {
            bail!(
                ErrorKind::ValidationError,
                "Listing limit is too large",
                format!("limit {limit}")
            );
        };
        let rows =
            schema_migrations::list_recent_schema_migrations(&self.pool, keyspace, limit).await?;

        into_records(rows)
    }

    async fn get_unfinished(
        &self,
        keyspace: &str,
        shard: &ShardId,
    ) -> ShiftResult<Vec<MigrationRecord>> {
        let rows = schema_migrations::get_unfinished_schema_migrations(
            &self.pool,
            keyspace,
            shard.as_str(),
        )
        .await?;

        into_records(rows)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::types::{MigrationOptions, Position, PrimaryKey};

    #[test]
    fn records_survive_the_row_mapping() {
        let request = MigrationRequest {
            id: MigrationId::new(),
            keyspace: "ks".to_owned(),
            table: "stress_test".to_owned(),
            alter_statement: "ALTER TABLE stress_test ADD COLUMN c int".to_owned(),
            strategy: DdlStrategy::Online,
            options: MigrationOptions(vec!["--postpone-completion".to_owned()]),
            requested_at: Utc::now(),
        };
        let mut record = MigrationRecord::new(request, ShardId::new("80-"));
        record.transition(MigrationStatus::Queued).unwrap();
        record.progress.copy_cursor = Some(PrimaryKey::from(17i64));
        record.progress.applied_position = Some(Position(99));
        record.progress.rows_copied = 17;

        let row = SchemaMigrationRow::try_from(&record).unwrap();
        assert_eq!(row.status, MigrationStatusType::Queued);
        assert_eq!(row.strategy, "online");

        let restored = MigrationRecord::try_from(row).unwrap();
        assert_eq!(restored, record);
    }
}
