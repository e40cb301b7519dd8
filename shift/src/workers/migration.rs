use chrono::{SubsecRound, Utc};
use futures::FutureExt;
use shift_config::shared::EngineConfig;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

use crate::concurrency::cancel::{CancelTx, StopReason, StopSignals, create_cancel_channel};
use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx};
use crate::cutover::{CutoverOutcome, renames_started, run_cutover};
use crate::error::{ErrorKind, ShiftResult};
use crate::observer::MigrationObserver;
use crate::replication::PhaseOutcome;
use crate::replication::apply::ChangeApplier;
use crate::replication::copy::copy_table;
use crate::schema::ddl::parse_alter_table;
use crate::schema::{RowTranslator, TableSchema};
use crate::state::{MigrationRecord, MigrationStatus, RecordWriter};
use crate::storage::{ChangeFeed, SchemaEngine};
use crate::store::MigrationStore;
use crate::throttle::Throttler;
use crate::types::MigrationId;
use crate::workers::base::{Worker, WorkerHandle};
use crate::workers::pool::MigrationWorkerPool;
use crate::{bail, shift_error};

/// Per-table locks making sure a single migration at a time runs against a table of a shard.
#[derive(Debug, Clone, Default)]
pub struct TableLocks {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl TableLocks {
    async fn lock(&self, table: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(table.to_ascii_lowercase())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        lock.lock_owned().await
    }
}

/// Everything a worker needs from the shard it runs on.
#[derive(Debug, Clone)]
pub struct WorkerContext<S, D> {
    pub config: Arc<EngineConfig>,
    pub store: S,
    pub database: D,
    pub throttler: Throttler,
    pub table_locks: TableLocks,
    pub run_permit: Arc<Semaphore>,
    pub observer: Arc<dyn MigrationObserver>,
    pub pool: MigrationWorkerPool,
    pub shutdown_rx: ShutdownRx,
}

/// Admission slot held from `Ready` until the migration reaches a terminal status.
#[derive(Debug)]
struct Admission {
    _table: OwnedMutexGuard<()>,
    _permit: OwnedSemaphorePermit,
}

/// Schemas and row translation of a migration, derived from the live table and the statement.
#[derive(Debug)]
struct MigrationPlan {
    translator: RowTranslator,
}

impl MigrationPlan {
    fn target(&self) -> &TableSchema {
        self.translator.target()
    }
}

/// State of a migration worker, shared with the executor and callers of the service.
#[derive(Debug, Clone)]
pub struct MigrationWorkerState {
    snapshot_rx: watch::Receiver<MigrationRecord>,
    cancel_tx: CancelTx,
}

impl MigrationWorkerState {
    /// Returns the last published snapshot of the record.
    pub fn record(&self) -> MigrationRecord {
        self.snapshot_rx.borrow().clone()
    }

    pub fn status(&self) -> MigrationStatus {
        self.snapshot_rx.borrow().status
    }

    /// Asks the worker to cancel the migration at its next chunk or event boundary.
    ///
    /// Fails with [`ErrorKind::MigrationNotCancellable`] once the migration is cutting over or
    /// terminal. A cancellation racing with the start of the cutover is ignored by the worker.
    pub fn request_cancel(&self) -> ShiftResult<()> {
        let status = self.status();
        if !status.is_cancellable() {
            bail!(
                ErrorKind::MigrationNotCancellable,
                "Migration can no longer be cancelled",
                format!("migration is {status}")
            );
        }

        self.cancel_tx.cancel();

        Ok(())
    }

    /// Waits until the migration reaches a terminal status and returns its final record.
    ///
    /// Fails with [`ErrorKind::InvalidState`] if the worker stopped without reaching one, which
    /// happens when the engine shuts down or the record could not be persisted.
    pub async fn wait_for_terminal(
        &self,
        mut shutdown_rx: ShutdownRx,
    ) -> ShiftResult<ShutdownResult<MigrationRecord, ()>> {
        let mut snapshot_rx = self.snapshot_rx.clone();

        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => Ok(ShutdownResult::Shutdown(())),

            record = snapshot_rx.wait_for(|record| record.status.is_terminal()) => {
                match record {
                    Ok(record) => Ok(ShutdownResult::Ok(record.clone())),
                    Err(_) => {
                        let record = self.record();
                        bail!(
                            ErrorKind::InvalidState,
                            "Migration worker stopped before the migration ended",
                            format!("migration {} is {}", record.id(), record.status)
                        )
                    }
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct MigrationWorkerHandle {
    state: MigrationWorkerState,
    handle: Option<JoinHandle<ShiftResult<()>>>,
}

impl WorkerHandle<MigrationWorkerState> for MigrationWorkerHandle {
    fn state(&self) -> MigrationWorkerState {
        self.state.clone()
    }

    async fn wait(mut self) -> ShiftResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        handle.await??;

        Ok(())
    }
}

/// Drives one migration on one shard from its persisted status to a terminal status.
///
/// Every status reached is persisted before the worker acts on it, so a worker started from a
/// stored record resumes where the previous one stopped: copy restarts after the copy cursor,
/// replay after the applied position, and cutover after the last rename that took effect.
#[derive(Debug)]
pub struct MigrationWorker<S, D> {
    record: MigrationRecord,
    context: WorkerContext<S, D>,
}

impl<S, D> MigrationWorker<S, D> {
    pub fn new(record: MigrationRecord, context: WorkerContext<S, D>) -> Self {
        Self { record, context }
    }

    pub fn migration_id(&self) -> MigrationId {
        self.record.id()
    }
}

impl<S, D> Worker<MigrationWorkerHandle, MigrationWorkerState> for MigrationWorker<S, D>
where
    S: MigrationStore + Clone + Send + Sync + 'static,
    D: SchemaEngine + ChangeFeed + Clone + Send + Sync + 'static,
{
    type Error = crate::error::ShiftError;

    async fn start(self) -> ShiftResult<MigrationWorkerHandle> {
        let id = self.record.id();
        let span = tracing::info_span!(
            "migration_worker",
            migration_id = %id,
            shard = %self.record.shard,
            table = %self.record.request.table
        );

        let (cancel_tx, cancel_rx) = create_cancel_channel();
        let stop = StopSignals::new(cancel_rx, self.context.shutdown_rx.clone());
        let (writer, snapshot_rx) = RecordWriter::new(
            self.record,
            self.context.store.clone(),
            self.context.observer.clone(),
        );
        let state = MigrationWorkerState {
            snapshot_rx,
            cancel_tx,
        };

        let pool = self.context.pool.clone();
        let run = MigrationRun {
            context: self.context,
            writer,
            stop,
            admission: None,
            plan: None,
            applier: None,
        };
        let migration_worker = async move {
            let result = AssertUnwindSafe(run.run()).catch_unwind().await;

            // The pool is told before the result is returned, so waiting on the pool never misses
            // a worker which panicked.
            pool.lock().await.mark_worker_finished(id);

            match result {
                Ok(result) => result,
                Err(_) => Err(shift_error!(
                    ErrorKind::WorkerPanic,
                    "Migration worker panicked",
                    format!("migration {id}")
                )),
            }
        };

        let handle = tokio::spawn(migration_worker.instrument(span));

        Ok(MigrationWorkerHandle {
            state,
            handle: Some(handle),
        })
    }
}

/// The running part of a [`MigrationWorker`].
struct MigrationRun<S, D> {
    context: WorkerContext<S, D>,
    writer: RecordWriter<S>,
    stop: StopSignals,
    admission: Option<Admission>,
    plan: Option<MigrationPlan>,
    applier: Option<ChangeApplier<D>>,
}

impl<S, D> MigrationRun<S, D>
where
    S: MigrationStore + Clone + Send + Sync + 'static,
    D: SchemaEngine + ChangeFeed + Clone + Send + Sync + 'static,
{
    async fn run(mut self) -> ShiftResult<()> {
        info!(status = %self.writer.status(), "starting migration worker");

        let Err(err) = self.drive().await else {
            return Ok(());
        };

        let status = self.writer.status();
        if status.is_terminal() {
            error!(error = %err, %status, "migration worker failed after the migration ended");
            return Err(err);
        }

        if status == MigrationStatus::CuttingOver {
            match renames_started(&self.context.database, self.writer.record()).await {
                Ok(false) => {}
                Ok(true) => {
                    error!(error = %err, "cutover failed after renaming tables, leaving it to be resumed");
                    return Err(err);
                }
                Err(inspect_err) => {
                    error!(
                        error = %err,
                        inspect_error = %inspect_err,
                        "cutover failed and its tables could not be inspected, leaving it to be resumed"
                    );
                    return Err(err);
                }
            }
        }

        // Nothing was renamed yet, the live table is untouched.
        error!(error = %err, %status, "migration failed");
        drop_shadow_table(&self.context.database, &self.writer.record().shadow_table).await;
        self.writer.fail(&err).await
    }

    /// Moves the migration forward until it reaches a terminal status or the worker is stopped.
    async fn drive(&mut self) -> ShiftResult<()> {
        loop {
            let status = self.writer.status();
            if !status.is_terminal()
                && status != MigrationStatus::Requested
                && self.admission.is_none()
                && let Some(reason) = self.admit().await
            {
                return self.stop_migration(reason).await;
            }

            match status {
                MigrationStatus::Requested => {
                    self.plan().await?;
                    self.writer.transition(MigrationStatus::Queued).await?;
                }
                MigrationStatus::Queued => {
                    // An earlier migration of the table may have changed it while this one
                    // waited for admission.
                    self.plan = None;
                    self.plan().await?;
                    self.writer.transition(MigrationStatus::Ready).await?;
                }
                MigrationStatus::Ready => {
                    self.prepare_shadow_table().await?;
                    self.writer.transition(MigrationStatus::Copying).await?;
                }
                MigrationStatus::Copying => {
                    let translator = self.plan().await?.translator.clone();
                    let outcome = copy_table(
                        &self.context.database,
                        &mut self.writer,
                        &translator,
                        &self.context.config,
                        &self.context.throttler,
                        &mut self.stop,
                    )
                    .await?;

                    match outcome {
                        PhaseOutcome::Finished => {
                            self.writer.transition(MigrationStatus::Syncing).await?
                        }
                        PhaseOutcome::Stopped(reason) => return self.stop_migration(reason).await,
                    }
                }
                MigrationStatus::Syncing => {
                    self.ensure_applier().await?;
                    let Some(applier) = self.applier.as_mut() else {
                        bail!(ErrorKind::InvalidState, "Change applier is missing");
                    };
                    let outcome = applier
                        .sync_until_converged(
                            &mut self.writer,
                            &self.context.throttler,
                            &mut self.stop,
                        )
                        .await?;

                    if let PhaseOutcome::Stopped(reason) = outcome {
                        return self.stop_migration(reason).await;
                    }
                    // Last chance to honor a cancellation, the cutover cannot be cancelled.
                    if let Some(reason) = self.stop.check() {
                        return self.stop_migration(reason).await;
                    }
                    self.writer.transition(MigrationStatus::CuttingOver).await?;
                }
                MigrationStatus::CuttingOver => {
                    if let Some(reason) = self.cut_over().await? {
                        return self.stop_migration(reason).await;
                    }
                }
                MigrationStatus::Complete | MigrationStatus::Failed | MigrationStatus::Cancelled => {
                    info!(%status, "migration finished");
                    return Ok(());
                }
            }
        }
    }

    /// Waits for the table lock, then for a run permit.
    async fn admit(&mut self) -> Option<StopReason> {
        let table = self.writer.record().request.table.clone();
        debug!("waiting for an admission slot");

        let table_guard = tokio::select! {
            biased;

            reason = self.stop.stopped() => return Some(reason),

            guard = self.context.table_locks.lock(&table) => guard,
        };

        let permit = tokio::select! {
            biased;

            reason = self.stop.stopped() => return Some(reason),

            permit = self.context.run_permit.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                // The executor closed the semaphore, it is shutting down.
                Err(_) => return Some(StopReason::Shutdown),
            },
        };

        info!("admitted migration");
        self.admission = Some(Admission {
            _table: table_guard,
            _permit: permit,
        });

        None
    }

    /// Loads the live table schema and derives the target schema from the alter statement.
    async fn plan(&mut self) -> ShiftResult<&MigrationPlan> {
        if self.plan.is_none() {
            let default_timestamp = *self
                .writer
                .progress_mut()
                .default_timestamp
                .get_or_insert_with(|| Utc::now().trunc_subsecs(0));
            let request = &self.writer.record().request;
            let alter = parse_alter_table(&request.alter_statement)?;
            let Some(source) = self.context.database.table_schema(&request.table).await? else {
                bail!(
                    ErrorKind::TableNotFound,
                    "Table to migrate does not exist",
                    format!("table `{}`", request.table)
                );
            };
            let delta = alter.apply(&source)?;

            self.plan = Some(MigrationPlan {
                translator: RowTranslator::new(&source, &delta, default_timestamp),
            });
        }

        match &self.plan {
            Some(plan) => Ok(plan),
            None => bail!(ErrorKind::InvalidState, "Migration plan is missing"),
        }
    }

    /// Creates the shadow table and captures the copy baseline.
    ///
    /// The baseline is read before the first chunk, so every change missed by the copy is
    /// replayed afterwards.
    async fn prepare_shadow_table(&mut self) -> ShiftResult<()> {
        let shadow_table = self.writer.record().shadow_table.clone();
        let shadow_schema = self.plan().await?.target().renamed(shadow_table.clone());

        // Left over by a crash between its creation and the transition to copying.
        if self.context.database.drop_table(&shadow_table).await? {
            warn!("dropped leftover shadow table {shadow_table}");
        }
        self.context.database.create_table(&shadow_schema).await?;

        let baseline = self.context.database.live_position().await?;
        let progress = self.writer.progress_mut();
        progress.copy_baseline_position = Some(baseline);
        progress.copy_cursor = None;
        progress.applied_position = None;
        info!(%baseline, "created shadow table {shadow_table}");

        Ok(())
    }

    async fn ensure_applier(&mut self) -> ShiftResult<()> {
        if self.applier.is_some() {
            return Ok(());
        }

        let translator = self.plan().await?.translator.clone();
        self.applier = Some(ChangeApplier::new(
            self.context.database.clone(),
            translator,
            &self.writer,
            self.context.config.clone(),
            self.context.shutdown_rx.clone(),
        ));

        Ok(())
    }

    /// Runs a cutover attempt, going back to syncing when nothing was renamed and staying in
    /// cutting over when the renames have to be resumed.
    ///
    /// Returns the reason to stop if the worker is stopped while waiting to retry.
    async fn cut_over(&mut self) -> ShiftResult<Option<StopReason>> {
        // After a crash in the middle of the renames the live table may already be retired, and
        // there is nothing left to drain.
        let shadow_table = self.writer.record().shadow_table.clone();
        let live_table = self.writer.record().request.table.clone();
        let database = &self.context.database;
        if database.table_schema(&shadow_table).await?.is_some()
            && database.table_schema(&live_table).await?.is_some()
        {
            self.ensure_applier().await?;
        }

        let config = self.context.config.clone();
        let outcome = run_cutover(
            &self.context.database,
            self.applier.as_mut(),
            &mut self.writer,
            &config,
        )
        .await?;

        let attempts = self.writer.record().progress.cutover_attempts;
        let err = match outcome {
            CutoverOutcome::Complete => {
                self.writer.transition(MigrationStatus::Complete).await?;
                return Ok(None);
            }
            CutoverOutcome::Retry(err) => err,
            CutoverOutcome::Resume(err) => {
                if attempts >= config.cutover.max_attempts {
                    bail!(
                        ErrorKind::CutoverFailed,
                        "Cutover kept failing between renames",
                        format!("{attempts} attempts, last error: {err}")
                    );
                }

                warn!(attempts, error = %err, "cutover interrupted between renames, resuming");
                self.writer
                    .set_message(format!("cutover attempt {attempts} interrupted: {err}"));
                self.writer.checkpoint().await?;

                // Cancellation is no longer possible, only a shutdown interrupts the wait.
                return tokio::select! {
                    biased;

                    _ = self.stop.shutdown_requested() => Ok(Some(StopReason::Shutdown)),

                    _ = tokio::time::sleep(config.cutover.retry_delay()) => Ok(None),
                };
            }
        };

        if attempts >= config.cutover.max_attempts {
            bail!(
                ErrorKind::CutoverFailed,
                "Cutover kept failing",
                format!("{attempts} attempts, last error: {err}")
            );
        }

        info!(attempts, error = %err, "cutover attempt failed, returning to syncing");
        self.writer
            .set_message(format!("cutover attempt {attempts} failed: {err}"));
        self.writer.transition(MigrationStatus::Syncing).await?;

        tokio::select! {
            biased;

            reason = self.stop.stopped() => Ok(Some(reason)),

            _ = tokio::time::sleep(config.cutover.retry_delay()) => Ok(None),
        }
    }

    async fn stop_migration(&mut self, reason: StopReason) -> ShiftResult<()> {
        match reason {
            StopReason::Shutdown => {
                info!(status = %self.writer.status(), "migration worker shut down");
                Ok(())
            }
            StopReason::Cancelled => {
                info!("cancelling migration");
                drop_shadow_table(&self.context.database, &self.writer.record().shadow_table).await;
                self.writer.set_message("cancelled on request");
                self.writer.transition(MigrationStatus::Cancelled).await
            }
        }
    }
}

async fn drop_shadow_table<D: SchemaEngine>(database: &D, shadow_table: &str) {
    match database.drop_table(shadow_table).await {
        Ok(true) => info!("dropped shadow table {shadow_table}"),
        Ok(false) => {}
        Err(err) => warn!(error = %err, "failed to drop shadow table {shadow_table}"),
    }
}
