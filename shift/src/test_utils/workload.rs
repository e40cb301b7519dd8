//! Concurrent write workload against a stress table.
//!
//! Every writer picks a random id and either inserts it, increments its `updates` counter or
//! deletes it when the counter is exactly one. Only statements affecting a row are counted, so
//! at any point where no statement is in flight the table holds `inserts - deletes` rows whose
//! `updates` sum to `updates - deletes`.

use rand::Rng;
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::bail;
use crate::error::{ErrorKind, ShiftError, ShiftResult};
use crate::memory::MemoryDatabase;
use crate::schema::ddl::parse_create_table;
use crate::storage::SchemaEngine;
use crate::types::{Cell, PrimaryKey};

pub const STRESS_TABLE: &str = "stress_test";

pub const CREATE_STRESS_TABLE: &str = "
    CREATE TABLE stress_test (
        id bigint(20) not null,
        rand_val varchar(32) null default '',
        hint_col varchar(64) not null default '',
        created_timestamp timestamp not null default current_timestamp,
        updates int unsigned not null default 0,
        PRIMARY KEY (id),
        key created_idx(created_timestamp),
        key updates_idx(updates)
    ) ENGINE=InnoDB
";

pub const MAX_TABLE_ROWS: i64 = 4096;
pub const MAX_CONCURRENCY: usize = 5;

/// Returns the statement changing the default of `hint_col` to `hint`.
pub fn alter_hint_statement(hint: &str) -> String {
    format!("ALTER TABLE stress_test modify hint_col varchar(64) not null default '{hint}'")
}

/// Statements issued by a workload and their outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteMetrics {
    pub inserts_attempts: u64,
    pub inserts_noops: u64,
    pub inserts: u64,
    pub updates_attempts: u64,
    pub updates_noops: u64,
    pub updates: u64,
    pub deletes_attempts: u64,
    pub deletes_noops: u64,
    pub deletes: u64,
}

impl WriteMetrics {
    pub fn merge(&mut self, other: &WriteMetrics) {
        self.inserts_attempts += other.inserts_attempts;
        self.inserts_noops += other.inserts_noops;
        self.inserts += other.inserts;
        self.updates_attempts += other.updates_attempts;
        self.updates_noops += other.updates_noops;
        self.updates += other.updates;
        self.deletes_attempts += other.deletes_attempts;
        self.deletes_noops += other.deletes_noops;
        self.deletes += other.deletes;
    }

    pub fn expected_rows(&self) -> u64 {
        self.inserts - self.deletes
    }

    /// Deleted rows always had an `updates` value of one.
    pub fn expected_sum_updates(&self) -> u64 {
        self.updates - self.deletes
    }
}

impl fmt::Display for WriteMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "inserts: {}/{} (noops {}), updates: {}/{} (noops {}), deletes: {}/{} (noops {})",
            self.inserts,
            self.inserts_attempts,
            self.inserts_noops,
            self.updates,
            self.updates_attempts,
            self.updates_noops,
            self.deletes,
            self.deletes_attempts,
            self.deletes_noops
        )
    }
}

pub async fn create_stress_table(database: &MemoryDatabase) -> ShiftResult<()> {
    let schema = parse_create_table(CREATE_STRESS_TABLE)?;
    database.create_table(&schema).await
}

fn random_id() -> i64 {
    rand::rng().random_range(0..MAX_TABLE_ROWS)
}

pub async fn generate_insert(database: &MemoryDatabase, metrics: &mut WriteMetrics) -> ShiftResult<()> {
    let rand_val = format!("{:08x}", rand::random::<u32>());
    let values = vec![
        ("id", Cell::I64(random_id())),
        ("rand_val", Cell::String(rand_val)),
    ];

    metrics.inserts_attempts += 1;
    if database.insert_ignore(STRESS_TABLE, values).await? {
        metrics.inserts += 1;
    } else {
        metrics.inserts_noops += 1;
    }

    Ok(())
}

pub async fn generate_update(database: &MemoryDatabase, metrics: &mut WriteMetrics) -> ShiftResult<()> {
    let key = PrimaryKey::from(random_id());

    metrics.updates_attempts += 1;
    let updated = database
        .update(STRESS_TABLE, &key, |schema, row| {
            let Some(index) = schema.column_index("updates") else {
                bail!(ErrorKind::ValidationError, "Column `updates` is missing");
            };
            let Some(updates) = row.values[index].as_u64() else {
                bail!(
                    ErrorKind::ValidationError,
                    "Column `updates` is not an integer",
                    format!("value {}", row.values[index])
                );
            };
            row.values[index] = Cell::U64(updates + 1);

            Ok(())
        })
        .await?;

    if updated {
        metrics.updates += 1;
    } else {
        metrics.updates_noops += 1;
    }

    Ok(())
}

pub async fn generate_delete(database: &MemoryDatabase, metrics: &mut WriteMetrics) -> ShiftResult<()> {
    let key = PrimaryKey::from(random_id());

    metrics.deletes_attempts += 1;
    let deleted = database
        .delete_if(STRESS_TABLE, &key, |schema, row| {
            schema
                .column_index("updates")
                .and_then(|index| row.values[index].as_u64())
                == Some(1)
        })
        .await?;

    if deleted {
        metrics.deletes += 1;
    } else {
        metrics.deletes_noops += 1;
    }

    Ok(())
}

/// Fills an empty stress table and returns the statements issued.
pub async fn init_table(database: &MemoryDatabase) -> ShiftResult<WriteMetrics> {
    let mut metrics = WriteMetrics::default();

    for _ in 0..MAX_TABLE_ROWS / 2 {
        generate_insert(database, &mut metrics).await?;
    }
    for _ in 0..MAX_TABLE_ROWS / 4 {
        generate_update(database, &mut metrics).await?;
    }
    for _ in 0..MAX_TABLE_ROWS / 4 {
        generate_delete(database, &mut metrics).await?;
    }

    debug!(%metrics, "initialized stress table");

    Ok(metrics)
}

/// Checks that the stress table matches `metrics`.
pub async fn check_table_metrics(database: &MemoryDatabase, metrics: &WriteMetrics) -> ShiftResult<()> {
    let rows = database.count_rows(STRESS_TABLE).await? as u64;
    let sum_updates = database.sum_column(STRESS_TABLE, "updates").await?;

    if rows != metrics.expected_rows() || sum_updates != metrics.expected_sum_updates() {
        bail!(
            ErrorKind::InvalidState,
            "Stress table does not match the issued statements",
            format!("{rows} rows and {sum_updates} updates for {metrics}")
        );
    }

    Ok(())
}

/// Writers issuing random statements on a stress table until stopped.
#[derive(Debug)]
pub struct Workload {
    stop_tx: watch::Sender<bool>,
    writers: Vec<JoinHandle<ShiftResult<WriteMetrics>>>,
}

impl Workload {
    /// Starts `concurrency` writers pausing `pause` between statements.
    pub fn start(database: &MemoryDatabase, concurrency: usize, pause: Duration) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);

        let writers = (0..concurrency)
            .map(|_| {
                let database = database.clone();
                let stop_rx = stop_rx.clone();
                tokio::spawn(run_writer(database, stop_rx, pause))
            })
            .collect();

        info!(concurrency, "started workload");

        Self { stop_tx, writers }
    }

    /// Stops every writer and returns the statements they issued.
    pub async fn stop(self) -> ShiftResult<WriteMetrics> {
        self.stop_tx.send_replace(true);

        let mut metrics = WriteMetrics::default();
        let mut errors = Vec::new();
        for writer in self.writers {
            match writer.await {
                Ok(Ok(writer_metrics)) => metrics.merge(&writer_metrics),
                Ok(Err(err)) => errors.push(err),
                Err(err) => errors.push(ShiftError::from(err)),
            }
        }

        if !errors.is_empty() {
            return Err(ShiftError::many(errors));
        }

        info!(%metrics, "stopped workload");

        Ok(metrics)
    }
}

async fn run_writer(
    database: MemoryDatabase,
    stop_rx: watch::Receiver<bool>,
    pause: Duration,
) -> ShiftResult<WriteMetrics> {
    let mut metrics = WriteMetrics::default();

    while !*stop_rx.borrow() {
        let statement = rand::rng().random_range(0..3);
        match statement {
            0 => generate_insert(&database, &mut metrics).await?,
            1 => generate_update(&database, &mut metrics).await?,
            _ => generate_delete(&database, &mut metrics).await?,
        }

        tokio::time::sleep(pause).await;
    }

    Ok(metrics)
}
