use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::ShiftResult;
use crate::state::MigrationRecord;
use crate::store::MigrationStore;
use crate::types::{MigrationId, ShardId};

#[derive(Debug, Default)]
struct Inner {
    records: BTreeMap<(MigrationId, ShardId), MigrationRecord>,
}

/// A [`MigrationStore`] keeping records in memory, lost when the process exits.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MigrationStore for MemoryStore {
    async fn store_record(&self, record: &MigrationRecord) -> ShiftResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .records
            .insert((record.id(), record.shard.clone()), record.clone());

        Ok(())
    }

    async fn get_record(
        &self,
        id: MigrationId,
        shard: &ShardId,
    ) -> ShiftResult<Option<MigrationRecord>> {
        let inner = self.inner.lock().await;

        Ok(inner.records.get(&(id, shard.clone())).cloned())
    }

    async fn get_records(&self, id: MigrationId) -> ShiftResult<Vec<MigrationRecord>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .records
            .values()
            .filter(|record| record.id() == id)
            .cloned()
            .collect())
    }

    async fn list_recent(&self, keyspace: &str, limit: usize) -> ShiftResult<Vec<MigrationRecord>> {
        let inner = self.inner.lock().await;

        let mut migrations: Vec<_> = inner
            .records
            .values()
            .filter(|record| record.request.keyspace == keyspace)
            .map(|record| (record.request.requested_at, record.id()))
            .collect();
        migrations.sort_by(|a, b| b.cmp(a));
        migrations.dedup();
        migrations.truncate(limit);

        let mut records = Vec::new();
        for (_, id) in migrations {
            records.extend(
                inner
                    .records
                    .values()
                    .filter(|record| record.id() == id)
                    .cloned(),
            );
        }

        Ok(records)
    }

    async fn get_unfinished(
        &self,
        keyspace: &str,
        shard: &ShardId,
    ) -> ShiftResult<Vec<MigrationRecord>> {
        let inner = self.inner.lock().await;

        let mut records: Vec<_> = inner
            .records
            .values()
            .filter(|record| {
                record.request.keyspace == keyspace
                    && record.shard == *shard
                    && !record.status.is_terminal()
            })
            .cloned()
            .collect();
        records.sort_by_key(|record| record.request.requested_at);

        Ok(records)
    }
}
