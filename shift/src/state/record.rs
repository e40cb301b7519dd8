use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bail;
use crate::error::{ErrorKind, ShiftResult};
use crate::state::MigrationStatus;
use crate::types::{MigrationId, MigrationRequest, Position, PrimaryKey, ShardId};

/// Resumption points and counters of a migration on one shard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationProgress {
    /// Primary key of the last row copied into the shadow table.
    pub copy_cursor: Option<PrimaryKey>,
    /// Feed position captured before the first copied chunk was read.
    pub copy_baseline_position: Option<Position>,
    /// Feed position up to which changes have been applied to the shadow table.
    pub applied_position: Option<Position>,
    pub rows_copied: u64,
    pub events_applied: u64,
    pub cutover_attempts: u32,
    /// Value given to new `CURRENT_TIMESTAMP` columns, fixed when the migration is planned.
    #[serde(default)]
    pub default_timestamp: Option<DateTime<Utc>>,
}

impl MigrationProgress {
    /// Position from which change replay resumes.
    pub fn replay_position(&self) -> Option<Position> {
        self.applied_position.or(self.copy_baseline_position)
    }
}

/// State of a migration on one shard, owned by the worker driving it.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationRecord {
    pub request: MigrationRequest,
    pub shard: ShardId,
    pub status: MigrationStatus,
    pub shadow_table: String,
    pub progress: MigrationProgress,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Human readable detail, always set for failed migrations.
    pub message: Option<String>,
}

impl MigrationRecord {
    pub fn new(request: MigrationRequest, shard: ShardId) -> Self {
        let shadow_table = request.id.shadow_table_name();

        Self {
            request,
            shard,
            status: MigrationStatus::Requested,
            shadow_table,
            progress: MigrationProgress::default(),
            started_at: None,
            completed_at: None,
            message: None,
        }
    }

    pub fn id(&self) -> MigrationId {
        self.request.id
    }

    /// Moves the record to `next`, stamping start and completion times.
    ///
    /// Fails with [`ErrorKind::InvalidTransition`] if `next` is not reachable from the current
    /// status.
    pub fn transition(&mut self, next: MigrationStatus) -> ShiftResult<()> {
        if !self.status.can_transition_to(next) {
            bail!(
                ErrorKind::InvalidTransition,
                "Invalid migration status transition",
                format!(
                    "migration {} on shard {} cannot move from {} to {next}",
                    self.request.id, self.shard, self.status
                )
            );
        }

        if next == MigrationStatus::Copying && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        self.status = next;

        Ok(())
    }

    /// Sets the human readable detail shown along with the status.
    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = Some(message.into());
    }
}
