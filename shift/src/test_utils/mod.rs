//! Helpers for testing migrations against in-memory shards.
//!
//! Includes a store notifying on status changes, an observer recording transitions, a
//! concurrent write workload and builders for services over in-memory databases.

pub mod cluster;
pub mod notify;
pub mod observer;
pub mod workload;
