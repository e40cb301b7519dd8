use std::fmt;

use crate::state::{MigrationRecord, MigrationStatus};

/// Hook notified of every status transition of the migrations run by an executor.
///
/// Observers are called from the worker driving the migration, after the transition has been
/// persisted and before it becomes visible to waiters. They must not block.
pub trait MigrationObserver: fmt::Debug + Send + Sync {
    fn on_status_change(
        &self,
        record: &MigrationRecord,
        from: MigrationStatus,
        to: MigrationStatus,
    );
}

/// Observer ignoring every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl MigrationObserver for NoopObserver {
    fn on_status_change(&self, _: &MigrationRecord, _: MigrationStatus, _: MigrationStatus) {}
}
