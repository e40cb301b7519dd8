use shift_config::shared::{IntoConnectOptions, PgConnectionConfig};
use sqlx::{Connection, Executor, PgConnection, PgPool};

/// Creates the database named in `config` and returns a pool connected to it.
///
/// # Panics
/// Panics if the server cannot be reached or the database cannot be created.
pub async fn create_pg_database(config: &PgConnectionConfig) -> PgPool {
    let mut connection = PgConnection::connect_with(&config.without_db())
        .await
        .expect("failed to connect to Postgres");
    connection
        .execute(&*format!(r#"create database "{}";"#, config.name))
        .await
        .expect("failed to create database");

    PgPool::connect_with(config.with_db())
        .await
        .expect("failed to connect to Postgres")
}

/// Terminates every connection to the database named in `config` and drops it.
///
/// # Panics
/// Panics if any statement fails.
pub async fn drop_pg_database(config: &PgConnectionConfig) {
    let mut connection = PgConnection::connect_with(&config.without_db())
        .await
        .expect("failed to connect to Postgres");

    connection
        .execute(&*format!(
            r#"
            select pg_terminate_backend(pg_stat_activity.pid)
            from pg_stat_activity
            where pg_stat_activity.datname = '{}'
            and pid <> pg_backend_pid();"#,
            config.name
        ))
        .await
        .expect("failed to terminate database connections");

    connection
        .execute(&*format!(r#"drop database if exists "{}";"#, config.name))
        .await
        .expect("failed to drop database");
}
