//! Intake boundary of the engine.
//!
//! A [`MigrationService`] accepts schema changes for a keyspace and hands them to the
//! [`ShardExecutor`] of every shard of that keyspace served by this process. Submitting never
//! waits for the migration: progress and outcome are read back through [`MigrationService::status`]
//! and [`MigrationService::show`], or awaited with [`MigrationService::wait_for_terminal`].

use chrono::Utc;
use shift_config::shared::EngineConfig;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bail;
use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx, ShutdownTx, create_shutdown_channel};
use crate::error::{ErrorKind, ShiftError, ShiftResult};
use crate::metrics::register_metrics;
use crate::observer::{MigrationObserver, NoopObserver};
use crate::schema::ddl::parse_alter_table;
use crate::schema::{AlterTable, TableSchema};
use crate::state::MigrationRecord;
use crate::status::{MigrationStatusView, migration_status};
use crate::storage::{ChangeFeed, LagSource, SchemaEngine, Topology};
use crate::store::MigrationStore;
use crate::throttle::Throttler;
use crate::types::{DdlStrategy, MigrationId, MigrationRequest, ShardId, SubmitRequest};
use crate::workers::migration::{MigrationWorker, MigrationWorkerState, TableLocks, WorkerContext};
use crate::workers::pool::MigrationWorkerPool;

/// Runs the migrations of one shard.
///
/// The executor owns the worker pool, the throttler and the admission limits of its shard.
#[derive(Debug)]
pub struct ShardExecutor<S, D> {
    keyspace: String,
    shard: ShardId,
    context: WorkerContext<S, D>,
    throttler_handle: Option<JoinHandle<()>>,
}

impl<S, D> ShardExecutor<S, D>
where
    S: MigrationStore + Clone + Send + Sync + 'static,
    D: SchemaEngine + ChangeFeed + LagSource + Clone + Send + Sync + 'static,
{
    pub fn new(
        keyspace: impl Into<String>,
        shard: ShardId,
        config: Arc<EngineConfig>,
        store: S,
        database: D,
        observer: Arc<dyn MigrationObserver>,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        let (throttler, throttler_handle) =
            Throttler::start(config.throttle.clone(), database.clone(), shutdown_rx.clone());
        let run_permit = Arc::new(Semaphore::new(config.max_concurrent_migrations));

        let context = WorkerContext {
            config,
            store,
            database,
            throttler,
            table_locks: TableLocks::default(),
            run_permit,
            observer,
            pool: MigrationWorkerPool::new(),
            shutdown_rx,
        };

        Self {
            keyspace: keyspace.into(),
            shard,
            context,
            throttler_handle,
        }
    }

    pub fn shard(&self) -> &ShardId {
        &self.shard
    }

    pub fn database(&self) -> &D {
        &self.context.database
    }

    pub fn throttler(&self) -> &Throttler {
        &self.context.throttler
    }

    /// Checks that `alter` applies to the live table of this shard.
    pub async fn validate(&self, alter: &AlterTable) -> ShiftResult<TableSchema> {
        let Some(source) = self.context.database.table_schema(&alter.table).await? else {
            bail!(
                ErrorKind::TableNotFound,
                "Table to migrate does not exist",
                format!("table `{}` on shard {}", alter.table, self.shard)
            );
        };

        Ok(alter.apply(&source)?.target)
    }

    /// Persists the record of `request` on this shard and starts its worker.
    pub async fn start_migration(&self, request: MigrationRequest) -> ShiftResult<MigrationRecord> {
        let record = MigrationRecord::new(request, self.shard.clone());
        self.context.store.store_record(&record).await?;
        self.start_worker(record.clone()).await?;

        Ok(record)
    }

    /// Restarts the workers of the migrations of this shard which did not reach a terminal
    /// status, returning how many were started.
    pub async fn recover(&self) -> ShiftResult<usize> {
        let records = self
            .context
            .store
            .get_unfinished(&self.keyspace, &self.shard)
            .await?;

        let mut started = 0;
        for record in records {
            info!(
                migration_id = %record.id(),
                shard = %self.shard,
                status = %record.status,
                "recovering migration"
            );
            if self.start_worker(record).await? {
                started += 1;
            }
        }

        Ok(started)
    }

    async fn start_worker(&self, record: MigrationRecord) -> ShiftResult<bool> {
        let worker = MigrationWorker::new(record, self.context.clone());
        let mut pool = self.context.pool.lock().await;

        pool.start_worker(worker).await
    }

    pub async fn worker_state(&self, id: MigrationId) -> Option<MigrationWorkerState> {
        self.context.pool.lock().await.get_active_worker_state(id)
    }

    /// Requests the cancellation of migration `id` on this shard.
    pub async fn cancel(&self, id: MigrationId) -> ShiftResult<()> {
        if let Some(state) = self.worker_state(id).await {
            return state.request_cancel();
        }

        let Some(record) = self.context.store.get_record(id, &self.shard).await? else {
            bail!(
                ErrorKind::MigrationNotFound,
                "Migration does not exist on shard",
                format!("migration {id} on shard {}", self.shard)
            );
        };

        if record.status.is_cancellable() {
            bail!(
                ErrorKind::InvalidState,
                "Migration has no running worker",
                format!("migration {id} on shard {} is {}", self.shard, record.status)
            );
        }

        bail!(
            ErrorKind::MigrationNotCancellable,
            "Migration can no longer be cancelled",
            format!("migration {id} on shard {} is {}", self.shard, record.status)
        )
    }

    /// Waits until migration `id` reaches a terminal status on this shard.
    pub async fn wait_for_terminal(
        &self,
        id: MigrationId,
        shutdown_rx: ShutdownRx,
    ) -> ShiftResult<ShutdownResult<MigrationRecord, ()>> {
        if let Some(state) = self.worker_state(id).await {
            return state.wait_for_terminal(shutdown_rx).await;
        }

        // The worker already ended, its last status is persisted.
        match self.context.store.get_record(id, &self.shard).await? {
            Some(record) if record.status.is_terminal() => Ok(ShutdownResult::Ok(record)),
            Some(record) => bail!(
                ErrorKind::InvalidState,
                "Migration has no running worker",
                format!("migration {id} on shard {} is {}", self.shard, record.status)
            ),
            None => bail!(
                ErrorKind::MigrationNotFound,
                "Migration does not exist on shard",
                format!("migration {id} on shard {}", self.shard)
            ),
        }
    }

    /// Waits for every worker of the shard to end and for the throttler to stop.
    pub async fn wait_all(&mut self) -> ShiftResult<()> {
        let result = self.context.pool.wait_all().await;

        if let Some(handle) = self.throttler_handle.take() {
            // The throttler only stops on shutdown.
            handle.abort();
            let _ = handle.await;
        }

        result
    }
}

/// Accepts schema changes and dispatches them to the shard executors of this process.
pub struct MigrationService<S, D> {
    config: Arc<EngineConfig>,
    topology: Arc<dyn Topology>,
    store: S,
    observer: Arc<dyn MigrationObserver>,
    executors: HashMap<(String, ShardId), ShardExecutor<S, D>>,
    shutdown_tx: ShutdownTx,
}

impl<S, D> MigrationService<S, D>
where
    S: MigrationStore + Clone + Send + Sync + 'static,
    D: SchemaEngine + ChangeFeed + LagSource + Clone + Send + Sync + 'static,
{
    /// Creates a service without shards, see [`MigrationService::add_shard`].
    pub fn new(config: EngineConfig, topology: Arc<dyn Topology>, store: S) -> ShiftResult<Self> {
        Self::with_observer(config, topology, store, Arc::new(NoopObserver))
    }

    pub fn with_observer(
        config: EngineConfig,
        topology: Arc<dyn Topology>,
        store: S,
        observer: Arc<dyn MigrationObserver>,
    ) -> ShiftResult<Self> {
        config.validate()?;
        register_metrics();

        let (shutdown_tx, _) = create_shutdown_channel();

        Ok(Self {
            config: Arc::new(config),
            topology,
            store,
            observer,
            executors: HashMap::new(),
            shutdown_tx,
        })
    }

    /// Serves `shard` of `keyspace` from this process, running its migrations against
    /// `database`.
    pub fn add_shard(&mut self, keyspace: &str, shard: ShardId, database: D) -> ShiftResult<()> {
        let key = (keyspace.to_owned(), shard.clone());
        if self.executors.contains_key(&key) {
            bail!(
                ErrorKind::InvalidState,
                "Shard is already served",
                format!("shard {shard} of keyspace '{keyspace}'")
            );
        }

        let executor = ShardExecutor::new(
            keyspace,
            shard,
            self.config.clone(),
            self.store.clone(),
            database,
            self.observer.clone(),
            self.shutdown_tx.subscribe(),
        );
        self.executors.insert(key, executor);

        Ok(())
    }

    pub fn shutdown_tx(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    pub fn executor(&self, keyspace: &str, shard: &ShardId) -> Option<&ShardExecutor<S, D>> {
        self.executors.get(&(keyspace.to_owned(), shard.clone()))
    }

    fn executor_or_err(&self, keyspace: &str, shard: &ShardId) -> ShiftResult<&ShardExecutor<S, D>> {
        match self.executor(keyspace, shard) {
            Some(executor) => Ok(executor),
            None => bail!(
                ErrorKind::ShardNotFound,
                "Shard is not served by this process",
                format!("shard {shard} of keyspace '{keyspace}'")
            ),
        }
    }

    /// Validates a schema change and starts it on every shard of its keyspace.
    ///
    /// Rejected requests never create a record. Once accepted, the migration runs on each shard
    /// independently and this call returns without waiting for it.
    pub async fn submit(&self, request: SubmitRequest) -> ShiftResult<MigrationId> {
        let (strategy, options) = DdlStrategy::parse(&request.strategy)?;
        if strategy != DdlStrategy::Online {
            bail!(
                ErrorKind::ValidationError,
                "Only online schema changes are supported",
                format!("strategy '{}'", request.strategy)
            );
        }

        let alter = parse_alter_table(&request.alter_statement)?;
        let table = if request.table.is_empty() {
            alter.table.clone()
        } else {
            request.table.clone()
        };
        if !alter.table.eq_ignore_ascii_case(&table) {
            bail!(
                ErrorKind::ValidationError,
                "Statement alters another table",
                format!("statement alters `{}`, request targets `{table}`", alter.table)
            );
        }

        let shards = self.topology.shards(&request.keyspace)?;
        let mut executors = Vec::with_capacity(shards.len());
        for shard in &shards {
            let executor = self.executor_or_err(&request.keyspace, shard)?;
            executor.validate(&alter).await?;
            executors.push(executor);
        }

        let migration = MigrationRequest {
            id: MigrationId::new(),
            keyspace: request.keyspace,
            table: alter.table.clone(),
            alter_statement: request.alter_statement,
            strategy,
            options,
            requested_at: Utc::now(),
        };
        let id = migration.id;

        info!(
            migration_id = %id,
            keyspace = %migration.keyspace,
            table = %migration.table,
            shards = shards.len(),
            "accepted migration"
        );

        for executor in executors {
            executor.start_migration(migration.clone()).await?;
        }

        Ok(id)
    }

    /// Requests the cancellation of migration `id` on every shard where it can still be
    /// cancelled.
    ///
    /// Fails with [`ErrorKind::MigrationNotCancellable`] if no shard could be cancelled.
    pub async fn cancel(&self, id: MigrationId) -> ShiftResult<()> {
        let records = self.show(id).await?;

        let mut cancelled = 0;
        let mut errors = Vec::new();
        for record in &records {
            let executor = self.executor_or_err(&record.request.keyspace, &record.shard)?;
            match executor.cancel(id).await {
                Ok(()) => cancelled += 1,
                Err(err) if err.kind() == ErrorKind::MigrationNotCancellable => {
                    warn!(migration_id = %id, shard = %record.shard, error = %err, "shard not cancelled");
                    errors.push(err);
                }
                Err(err) => return Err(err),
            }
        }

        if cancelled == 0 {
            return Err(ShiftError::many(errors));
        }

        info!(migration_id = %id, cancelled, "requested migration cancellation");

        Ok(())
    }

    /// Waits until migration `id` reaches a terminal status on every shard and returns the
    /// aggregated view.
    pub async fn wait_for_terminal(
        &self,
        id: MigrationId,
        shutdown_rx: ShutdownRx,
    ) -> ShiftResult<ShutdownResult<MigrationStatusView, ()>> {
        let records = self.show(id).await?;

        for record in &records {
            let executor = self.executor_or_err(&record.request.keyspace, &record.shard)?;
            if let ShutdownResult::Shutdown(()) =
                executor.wait_for_terminal(id, shutdown_rx.clone()).await?
            {
                return Ok(ShutdownResult::Shutdown(()));
            }
        }

        Ok(ShutdownResult::Ok(self.status(id).await?))
    }

    /// Returns the raw per-shard records of migration `id`.
    pub async fn show(&self, id: MigrationId) -> ShiftResult<Vec<MigrationRecord>> {
        let records = self.store.get_records(id).await?;
        if records.is_empty() {
            bail!(
                ErrorKind::MigrationNotFound,
                "Migration does not exist",
                format!("migration {id}")
            );
        }

        Ok(records)
    }

    /// Returns the aggregated status of migration `id`.
    pub async fn status(&self, id: MigrationId) -> ShiftResult<MigrationStatusView> {
        migration_status(&self.store, id).await
    }

    /// Returns the views of the `limit` most recent migrations of `keyspace`, newest first.
    pub async fn list_recent(
        &self,
        keyspace: &str,
        limit: usize,
    ) -> ShiftResult<Vec<MigrationStatusView>> {
        let records = self.store.list_recent(keyspace, limit).await?;

        let mut views: Vec<(MigrationId, Vec<MigrationRecord>)> = Vec::new();
        for record in records {
            match views.iter_mut().find(|(id, _)| *id == record.id()) {
                Some((_, shards)) => shards.push(record),
                None => views.push((record.id(), vec![record])),
            }
        }

        Ok(views
            .into_iter()
            .filter_map(|(id, shards)| MigrationStatusView::from_records(id, shards))
            .collect())
    }

    /// Restarts the unfinished migrations of every served shard.
    pub async fn recover(&self) -> ShiftResult<usize> {
        let mut started = 0;
        for executor in self.executors.values() {
            started += executor.recover().await?;
        }

        if started > 0 {
            info!(started, "recovered unfinished migrations");
        }

        Ok(started)
    }

    /// Stops every worker at its next chunk or event boundary and waits for them.
    ///
    /// Migrations keep their persisted status and resume with [`MigrationService::recover`].
    pub async fn shutdown(mut self) -> ShiftResult<()> {
        info!("shutting down migration service");
        if let Err(err) = self.shutdown_tx.shutdown() {
            warn!(error = %err, "no worker was listening for shutdown");
        }

        let mut errors = Vec::new();
        for (_, executor) in self.executors.iter_mut() {
            if let Err(err) = executor.wait_all().await {
                error!(shard = %executor.shard, error = %err, "shard executor failed");
                errors.push(err);
            }
        }

        if !errors.is_empty() {
            return Err(ShiftError::many(errors));
        }

        Ok(())
    }
}

impl<S, D> std::fmt::Debug for MigrationService<S, D>
where
    S: std::fmt::Debug,
    D: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationService")
            .field("config", &self.config)
            .field("store", &self.store)
            .field("executors", &self.executors)
            .finish_non_exhaustive()
    }
}
