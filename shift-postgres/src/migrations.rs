use shift_config::shared::{IntoConnectOptions, PgConnectionConfig};
use sqlx::{
    Executor, PgPool,
    postgres::{PgConnectOptions, PgPoolOptions},
};
use tracing::info;

/// Number of connections used while applying migrations.
const NUM_MIGRATION_POOL_CONNECTIONS: u32 = 1;

/// Applies the embedded migrations creating `shift.schema_migrations`.
///
/// The `shift` schema is created first and used as search path, so that the `_sqlx_migrations`
/// bookkeeping table lives next to the control state instead of in `public`.
pub async fn migrate_store(connection_config: &PgConnectionConfig) -> Result<(), sqlx::Error> {
    let options: PgConnectOptions = connection_config.with_db();

    let pool = PgPoolOptions::new()
        .max_connections(NUM_MIGRATION_POOL_CONNECTIONS)
        .min_connections(NUM_MIGRATION_POOL_CONNECTIONS)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute("create schema if not exists shift;").await?;
                conn.execute("set search_path = 'shift';").await?;

                Ok(())
            })
        })
        .connect_with(options)
        .await?;

    info!("applying schema migration store migrations");

    let migrator = sqlx::migrate!("./migrations");
    migrator.run(&pool).await?;

    info!("schema migration store migrations applied");

    pool.close().await;

    Ok(())
}

/// Opens a lazily connecting pool to the store database.
pub fn connect_store_pool(connection_config: &PgConnectionConfig, max_connections: u32) -> PgPool {
    let options: PgConnectOptions = connection_config.with_db();

    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect_lazy_with(options)
}
