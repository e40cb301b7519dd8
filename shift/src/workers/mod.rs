//! Migration workers and the pool tracking them.
//!
//! One [`migration::MigrationWorker`] drives one migration on one shard from its persisted
//! status to a terminal status, and the [`pool::MigrationWorkerPool`] of the shard keeps their
//! handles so that they can be cancelled, awaited and inspected.

pub mod base;
pub mod migration;
pub mod pool;
