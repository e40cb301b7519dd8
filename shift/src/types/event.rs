use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{PrimaryKey, TableRow};

/// A position in the change feed.
///
/// Positions are assigned when a change commits and strictly increase across all tables.
/// [`Position::ZERO`] precedes every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position(pub u64);

impl Position {
    pub const ZERO: Position = Position(0);

    pub fn next(self) -> Position {
        Position(self.0 + 1)
    }

    /// Returns how many positions `later` is ahead of `self`, zero if it is behind.
    pub fn lag_to(self, later: Position) -> u64 {
        later.0.saturating_sub(self.0)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

/// A committed row mutation.
///
/// `row_image` is the row after the change for inserts and updates, and the removed row for
/// deletes.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: String,
    pub primary_key: PrimaryKey,
    pub operation: ChangeOperation,
    pub row_image: TableRow,
    pub position: Position,
}

/// An item of a change feed subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Change(ChangeEvent),
    /// Every change of the subscribed table up to this position has been delivered.
    Heartbeat(Position),
}

impl FeedMessage {
    pub fn position(&self) -> Position {
        match self {
            FeedMessage::Change(event) => event.position,
            FeedMessage::Heartbeat(position) => *position,
        }
    }
}
