use std::collections::HashMap;
use std::mem;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::error::{ShiftError, ShiftResult};
use crate::storage::{ChangeFeed, SchemaEngine};
use crate::store::MigrationStore;
use crate::types::MigrationId;
use crate::workers::base::{Worker, WorkerHandle};
use crate::workers::migration::{MigrationWorker, MigrationWorkerHandle, MigrationWorkerState};

/// How often [`MigrationWorkerPool::wait_all`] looks at the pool again when no worker reported.
const POOL_REFRESH_FREQUENCY: Duration = Duration::from_millis(100);

/// Internal state for [`MigrationWorkerPool`].
#[derive(Debug)]
pub struct MigrationWorkerPoolInner {
    /// Running workers indexed by migration.
    active: HashMap<MigrationId, MigrationWorkerHandle>,
    /// Workers which ended, kept until their result is collected by [`Self::wait_all`].
    finished: HashMap<MigrationId, Vec<MigrationWorkerHandle>>,
    pool_update: Arc<Notify>,
}

impl MigrationWorkerPoolInner {
    fn new() -> Self {
        Self {
            active: HashMap::new(),
            finished: HashMap::new(),
            pool_update: Arc::new(Notify::new()),
        }
    }

    /// Starts a worker unless one is already running for the same migration.
    ///
    /// Returns `Ok(false)` when a worker for the migration is already active.
    pub async fn start_worker<S, D>(&mut self, worker: MigrationWorker<S, D>) -> ShiftResult<bool>
    where
        S: MigrationStore + Clone + Send + Sync + 'static,
        D: SchemaEngine + ChangeFeed + Clone + Send + Sync + 'static,
    {
        let id = worker.migration_id();
        if self.active.contains_key(&id) {
            warn!("worker for migration {id} already exists in the pool");
            return Ok(false);
        }

        let handle = worker.start().await?;
        self.active.insert(id, handle);

        debug!("added worker for migration {id} to the pool");

        Ok(true)
    }

    /// Moves the worker of `id` from the active to the finished workers and wakes up waiters.
    pub fn mark_worker_finished(&mut self, id: MigrationId) {
        let removed_worker = self.active.remove(&id);

        self.pool_update.notify_waiters();

        if let Some(removed_worker) = removed_worker {
            self.finished.entry(id).or_default().push(removed_worker);
        }
    }

    pub fn get_active_worker_state(&self, id: MigrationId) -> Option<MigrationWorkerState> {
        Some(self.active.get(&id)?.state())
    }

    /// Returns the ids of the migrations with a running worker.
    pub fn active_migrations(&self) -> Vec<MigrationId> {
        self.active.keys().copied().collect()
    }

    /// Collects the results of the finished workers once no worker is active.
    ///
    /// Returns `Ok(Some(notify))` while workers are active. Waiting on them here would deadlock,
    /// since a worker takes the pool lock to mark itself as finished.
    pub async fn wait_all(&mut self) -> ShiftResult<Option<Arc<Notify>>> {
        if !self.active.is_empty() {
            return Ok(Some(self.pool_update.clone()));
        }

        let mut errors = Vec::new();
        for (_, workers) in mem::take(&mut self.finished) {
            for worker in workers {
                if let Err(err) = worker.wait().await {
                    errors.push(err);
                }
            }
        }

        if !errors.is_empty() {
            return Err(ShiftError::many(errors));
        }

        Ok(None)
    }
}

/// Pool of the migration workers of one shard.
#[derive(Debug, Clone)]
pub struct MigrationWorkerPool {
    inner: Arc<Mutex<MigrationWorkerPoolInner>>,
}

impl MigrationWorkerPool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MigrationWorkerPoolInner::new())),
        }
    }

    /// Waits until every worker of the pool ended and returns their errors.
    pub async fn wait_all(&self) -> ShiftResult<()> {
        loop {
            let notify = {
                let mut workers = self.inner.lock().await;
                let Some(notify) = workers.wait_all().await? else {
                    return Ok(());
                };

                notify
            };

            // A worker finishing between the unlock and this point is picked up on the next
            // refresh.
            let _ = tokio::time::timeout(POOL_REFRESH_FREQUENCY, notify.notified()).await;
        }
    }
}

impl Default for MigrationWorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for MigrationWorkerPool {
    type Target = Mutex<MigrationWorkerPoolInner>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
