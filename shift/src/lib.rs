//! Online schema migrations for sharded tables.
//!
//! A schema change submitted to the [`service::MigrationService`] runs independently on every
//! shard of its keyspace. On each shard the rows of the live table are copied into a shadow
//! table created with the new schema, changes committed meanwhile are replayed from the change
//! feed until the shadow table converges, and the shadow table is then swapped in with three
//! renames while client writes are briefly fenced.
//!
//! Progress of every shard is persisted in a [`store::MigrationStore`], so that a migration
//! interrupted by a restart resumes where it stopped, and folded into one migration-wide
//! status by [`status::aggregate_status`].

pub mod concurrency;
pub mod cutover;
pub mod error;
#[cfg(feature = "failpoints")]
pub mod failpoints;
mod macros;
pub mod memory;
pub mod metrics;
pub mod observer;
pub mod replication;
pub mod schema;
pub mod service;
pub mod state;
pub mod status;
pub mod storage;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod throttle;
pub mod types;
pub mod workers;
