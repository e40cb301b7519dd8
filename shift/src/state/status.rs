use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a migration on one shard.
///
/// Statuses are declared in lifecycle order: a migration moves one step forward at a time,
/// except for the terminal [`MigrationStatus::Failed`] and [`MigrationStatus::Cancelled`] and
/// the return from [`MigrationStatus::CuttingOver`] to [`MigrationStatus::Syncing`] after a
/// failed cutover attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    /// Accepted by the intake, not yet validated against the shard.
    Requested,
    /// Validated against the shard, waiting for an admission slot.
    Queued,
    /// Holds an admission slot.
    Ready,
    /// Bulk copying existing rows into the shadow table.
    Copying,
    /// Replaying the change feed onto the shadow table.
    Syncing,
    /// Swapping the shadow table in.
    CuttingOver,
    Complete,
    Failed,
    Cancelled,
}

impl MigrationStatus {
    pub const ALL: [MigrationStatus; 9] = [
        MigrationStatus::Requested,
        MigrationStatus::Queued,
        MigrationStatus::Ready,
        MigrationStatus::Copying,
        MigrationStatus::Syncing,
        MigrationStatus::CuttingOver,
        MigrationStatus::Complete,
        MigrationStatus::Failed,
        MigrationStatus::Cancelled,
    ];

    /// Position of the status in the lifecycle. Terminal statuses share the highest rank.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Requested => 0,
            Self::Queued => 1,
            Self::Ready => 2,
            Self::Copying => 3,
            Self::Syncing => 4,
            Self::CuttingOver => 5,
            Self::Complete | Self::Failed | Self::Cancelled => 6,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }

    /// Returns `true` if a migration in this status can still be cancelled.
    pub fn is_cancellable(&self) -> bool {
        self.rank() < Self::CuttingOver.rank()
    }

    /// Returns `true` if moving from this status to `next` is allowed.
    pub fn can_transition_to(&self, next: MigrationStatus) -> bool {
        match (self, next) {
            (current, _) if current.is_terminal() => false,
            (_, Self::Failed) => true,
            (current, Self::Cancelled) => current.is_cancellable(),
            (Self::CuttingOver, Self::Syncing) => true,
            (current, next) => next.rank() == current.rank() + 1,
        }
    }

    pub fn as_static_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Queued => "queued",
            Self::Ready => "ready",
            Self::Copying => "copying",
            Self::Syncing => "syncing",
            Self::CuttingOver => "cutting_over",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_static_str())
    }
}
