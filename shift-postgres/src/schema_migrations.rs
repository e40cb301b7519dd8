use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, Type, prelude::FromRow};
use uuid::Uuid;

/// Database enum mirroring the migration lifecycle.
#[derive(Debug, Clone, Copy, Type, PartialEq, Eq)]
#[sqlx(type_name = "shift.migration_status", rename_all = "snake_case")]
pub enum MigrationStatusType {
    Requested,
    Queued,
    Ready,
    Copying,
    Syncing,
    CuttingOver,
    Complete,
    Failed,
    Cancelled,
}

/// One row of `shift.schema_migrations`, keyed by `(migration_id, shard)`.
///
/// Progress counters and positions are kept in the `progress` json column so that the table
/// layout does not change whenever the engine tracks something new.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct SchemaMigrationRow {
    pub migration_id: Uuid,
    pub keyspace: String,
    pub shard: String,
    pub table_name: String,
    pub alter_statement: String,
    pub strategy: String,
    pub options: String,
    pub status: MigrationStatusType,
    pub progress: serde_json::Value,
    pub message: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

const SELECT_COLUMNS: &str = r#"
    select migration_id, keyspace, shard, table_name, alter_statement, strategy, options,
           status, progress, message, requested_at, started_at, completed_at
    from shift.schema_migrations
"#;

/// Inserts or replaces the row of a (migration, shard) pair.
pub async fn upsert_schema_migration<'c, E>(
    executor: E,
    row: &SchemaMigrationRow,
) -> sqlx::Result<()>
where
    E: PgExecutor<'c>,
{
    sqlx::query(
        r#"
        insert into shift.schema_migrations (
            migration_id, keyspace, shard, table_name, alter_statement, strategy, options,
            status, progress, message, requested_at, started_at, completed_at
        )
        values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        on conflict (migration_id, shard) do update set
            status = excluded.status,
            progress = excluded.progress,
            message = excluded.message,
            started_at = excluded.started_at,
            completed_at = excluded.completed_at,
            updated_at = now()
        "#,
    )
    .bind(row.migration_id)
    .bind(&row.keyspace)
    .bind(&row.shard)
    .bind(&row.table_name)
    .bind(&row.alter_statement)
    .bind(&row.strategy)
    .bind(&row.options)
    .bind(row.status)
    .bind(&row.progress)
    .bind(&row.message)
    .bind(row.requested_at)
    .bind(row.started_at)
    .bind(row.completed_at)
    .execute(executor)
    .await?;

    Ok(())
}

/// Fetches the row of one shard of a migration.
pub async fn get_schema_migration_row<'c, E>(
    executor: E,
    migration_id: Uuid,
    shard: &str,
) -> sqlx::Result<Option<SchemaMigrationRow>>
where
    E: PgExecutor<'c>,
{
    let query = format!("{SELECT_COLUMNS} where migration_id = $1 and shard = $2");

    sqlx::query_as(&query)
        .bind(migration_id)
        .bind(shard)
        .fetch_optional(executor)
        .await
}

/// Fetches the rows of every shard of a migration, ordered by shard.
pub async fn get_schema_migration_rows<'c, E>(
    executor: E,
    migration_id: Uuid,
) -> sqlx::Result<Vec<SchemaMigrationRow>>
where
    E: PgExecutor<'c>,
{
    let query = format!("{SELECT_COLUMNS} where migration_id = $1 order by shard");

    sqlx::query_as(&query)
        .bind(migration_id)
        .fetch_all(executor)
        .await
}

/// Lists rows of the most recent migrations of a keyspace, newest first.
///
/// `limit` bounds the number of migrations, not rows: every shard row of a returned migration
/// is included.
pub async fn list_recent_schema_migrations<'c, E>(
    executor: E,
    keyspace: &str,
    limit: i64,
) -> sqlx::Result<Vec<SchemaMigrationRow>>
where
    E: PgExecutor<'c>,
{
    let query = format!(
        r#"{SELECT_COLUMNS}
        where migration_id in (
            select migration_id
            from shift.schema_migrations
            where keyspace = $1
            group by migration_id
            order by max(requested_at) desc
            limit $2
        )
        order by requested_at desc, migration_id, shard
        "#
    );

    sqlx::query_as(&query)
        .bind(keyspace)
        .bind(limit)
        .fetch_all(executor)
        .await
}

/// Fetches the rows of a shard whose migration has not reached a terminal status.
pub async fn get_unfinished_schema_migrations<'c, E>(
    executor: E,
    keyspace: &str,
    shard: &str,
) -> sqlx::Result<Vec<SchemaMigrationRow>>
where
    E: PgExecutor<'c>,
{
    let query = format!(
        r#"{SELECT_COLUMNS}
        where keyspace = $1 and shard = $2
          and status not in ('complete', 'failed', 'cancelled')
        order by requested_at
        "#
    );

    sqlx::query_as(&query)
        .bind(keyspace)
        .bind(shard)
        .fetch_all(executor)
        .await
}
