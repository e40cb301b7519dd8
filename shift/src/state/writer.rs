use metrics::gauge;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use crate::error::{ShiftError, ShiftResult};
use crate::metrics::{SHARD, SHIFT_MIGRATIONS_TOTAL, STATUS};
use crate::observer::MigrationObserver;
use crate::state::{MigrationProgress, MigrationRecord, MigrationStatus};
use crate::store::MigrationStore;

/// Exclusive owner of a [`MigrationRecord`] while a worker drives it.
///
/// Every change goes through the writer, which persists it in the store before publishing a
/// snapshot to readers of the worker state.
#[derive(Debug)]
pub struct RecordWriter<S> {
    record: MigrationRecord,
    store: S,
    snapshot_tx: watch::Sender<MigrationRecord>,
    observer: Arc<dyn MigrationObserver>,
}

impl<S> RecordWriter<S> {
    pub fn record(&self) -> &MigrationRecord {
        &self.record
    }

    pub fn status(&self) -> MigrationStatus {
        self.record.status
    }

    pub fn progress_mut(&mut self) -> &mut MigrationProgress {
        &mut self.record.progress
    }

    /// Sets the message shown along with the status, without persisting it.
    pub fn set_message(&mut self, message: impl Into<String>) {
        self.record.set_message(message);
    }
}

impl<S> RecordWriter<S>
where
    S: MigrationStore,
{
    pub fn new(
        record: MigrationRecord,
        store: S,
        observer: Arc<dyn MigrationObserver>,
    ) -> (Self, watch::Receiver<MigrationRecord>) {
        let (snapshot_tx, snapshot_rx) = watch::channel(record.clone());
        gauge!(
            SHIFT_MIGRATIONS_TOTAL,
            STATUS => record.status.as_static_str(),
            SHARD => record.shard.to_string()
        )
        .increment(1.0);

        let writer = Self {
            record,
            store,
            snapshot_tx,
            observer,
        };

        (writer, snapshot_rx)
    }

    /// Persists the current progress and publishes it.
    pub async fn checkpoint(&mut self) -> ShiftResult<()> {
        self.store.store_record(&self.record).await?;
        self.snapshot_tx.send_replace(self.record.clone());

        Ok(())
    }

    /// Moves the record to `next`, persists it and notifies the observer.
    pub async fn transition(&mut self, next: MigrationStatus) -> ShiftResult<()> {
        let from = self.record.status;
        self.record.transition(next)?;
        self.store.store_record(&self.record).await?;

        info!(from = %from, to = %next, "migration status changed");
        let shard = self.record.shard.to_string();
        gauge!(SHIFT_MIGRATIONS_TOTAL, STATUS => from.as_static_str(), SHARD => shard.clone())
            .decrement(1.0);
        gauge!(SHIFT_MIGRATIONS_TOTAL, STATUS => next.as_static_str(), SHARD => shard)
            .increment(1.0);

        self.observer.on_status_change(&self.record, from, next);
        self.snapshot_tx.send_replace(self.record.clone());

        Ok(())
    }

    /// Moves the record to [`MigrationStatus::Failed`] with the error as message.
    pub async fn fail(&mut self, err: &ShiftError) -> ShiftResult<()> {
        self.record.set_message(err.to_string());
        self.transition(MigrationStatus::Failed).await
    }
}
