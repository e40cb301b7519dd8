//! Postgres persistence of schema migration control state.
//!
//! Every (migration, shard) pair is stored as one row of `shift.schema_migrations`. The engine
//! crate maps its own record type onto [`schema_migrations::SchemaMigrationRow`].

pub mod migrations;
pub mod schema_migrations;
#[cfg(feature = "test-utils")]
pub mod test_utils;
