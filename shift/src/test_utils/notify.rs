use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{Notify, RwLock};

use crate::bail;
use crate::error::{ErrorKind, ShiftResult};
use crate::state::{MigrationRecord, MigrationStatus};
use crate::store::{MemoryStore, MigrationStore};
use crate::types::{MigrationId, ShardId};

type StatusCondition = (MigrationId, ShardId, MigrationStatus, Arc<Notify>);

#[derive(Debug, Default)]
struct Inner {
    statuses: HashMap<(MigrationId, ShardId), MigrationStatus>,
    status_conditions: Vec<StatusCondition>,
}

impl Inner {
    fn check_conditions(&mut self) {
        let statuses = &self.statuses;
        self.status_conditions
            .retain(|(id, shard, expected_status, notify)| {
                let reached = statuses.get(&(*id, shard.clone())) == Some(expected_status);
                if reached {
                    notify.notify_one();
                }

                !reached
            });
    }
}

/// A [`MemoryStore`] which notifies when a migration reaches a status on a shard.
#[derive(Debug, Clone, Default)]
pub struct NotifyingStore {
    store: MemoryStore,
    inner: Arc<RwLock<Inner>>,
    failing_stores: Arc<AtomicU32>,
}

impl NotifyingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a [`Notify`] fired once migration `id` reaches `expected_status` on `shard`.
    pub async fn notify_on_status(
        &self,
        id: MigrationId,
        shard: &ShardId,
        expected_status: MigrationStatus,
    ) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        let mut inner = self.inner.write().await;
        inner
            .status_conditions
            .push((id, shard.clone(), expected_status, notify.clone()));

        // The status may already be reached, in which case no later store would fire it.
        inner.check_conditions();

        notify
    }

    /// Makes the next `count` calls to [`MigrationStore::store_record`] fail.
    pub fn fail_next_stores(&self, count: u32) {
        self.failing_stores.store(count, Ordering::SeqCst);
    }
}

impl MigrationStore for NotifyingStore {
    async fn store_record(&self, record: &MigrationRecord) -> ShiftResult<()> {
        let failing = self
            .failing_stores
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| count.checked_sub(1));
        if failing.is_ok() {
            bail!(
                ErrorKind::StateStoreError,
                "Injected store failure",
                format!("migration {} on shard {}", record.id(), record.shard)
            );
        }

        self.store.store_record(record).await?;

        let mut inner = self.inner.write().await;
        inner
            .statuses
            .insert((record.id(), record.shard.clone()), record.status);
        inner.check_conditions();

        Ok(())
    }

    async fn get_record(
        &self,
        id: MigrationId,
        shard: &ShardId,
    ) -> ShiftResult<Option<MigrationRecord>> {
        self.store.get_record(id, shard).await
    }

    async fn get_records(&self, id: MigrationId) -> ShiftResult<Vec<MigrationRecord>> {
        self.store.get_records(id).await
    }

    async fn list_recent(&self, keyspace: &str, limit: usize) -> ShiftResult<Vec<MigrationRecord>> {
        self.store.list_recent(keyspace, limit).await
    }

    async fn get_unfinished(
        &self,
        keyspace: &str,
        shard: &ShardId,
    ) -> ShiftResult<Vec<MigrationRecord>> {
        self.store.get_unfinished(keyspace, shard).await
    }
}
