//! Copy & sync engine: converges a shadow table with its live table.
//!
//! The bulk copy reads the live table in primary key order and writes translated rows into the
//! shadow table, one persisted chunk at a time. Change replay then consumes the change feed from
//! the position captured before the first copied chunk, applying each event as an upsert or a
//! delete keyed by primary key, until the shadow table has caught up with the live table.

use crate::concurrency::cancel::StopReason;

pub mod apply;
pub mod copy;

/// Outcome of a copy or sync phase which did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    Finished,
    Stopped(StopReason),
}
