use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::observer::MigrationObserver;
use crate::state::{MigrationRecord, MigrationStatus};
use crate::types::{MigrationId, ShardId};

/// Observer recording every status transition, per migration and shard.
#[derive(Debug, Clone, Default)]
pub struct RecordingObserver {
    transitions: Arc<Mutex<HashMap<(MigrationId, ShardId), Vec<MigrationStatus>>>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statuses reached by migration `id` on `shard`, in order, excluding the initial one.
    pub fn statuses(&self, id: MigrationId, shard: &ShardId) -> Vec<MigrationStatus> {
        let transitions = self
            .transitions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        transitions
            .get(&(id, shard.clone()))
            .cloned()
            .unwrap_or_default()
    }
}

impl MigrationObserver for RecordingObserver {
    fn on_status_change(&self, record: &MigrationRecord, _from: MigrationStatus, to: MigrationStatus) {
        let mut transitions = self
            .transitions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        transitions
            .entry((record.id(), record.shard.clone()))
            .or_default()
            .push(to);
    }
}
