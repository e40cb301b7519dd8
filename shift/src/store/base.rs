use std::future::Future;

use crate::error::ShiftResult;
use crate::state::MigrationRecord;
use crate::types::{MigrationId, ShardId};

/// Persistent storage of [`MigrationRecord`]s, one per migration and shard.
///
/// Records are only written by the worker owning them, while any number of readers may query
/// them concurrently.
pub trait MigrationStore {
    /// Inserts `record` or replaces the stored record with the same migration id and shard.
    fn store_record(&self, record: &MigrationRecord) -> impl Future<Output = ShiftResult<()>> + Send;

    fn get_record(
        &self,
        id: MigrationId,
        shard: &ShardId,
    ) -> impl Future<Output = ShiftResult<Option<MigrationRecord>>> + Send;

    /// Returns the records of every shard of a migration, ordered by shard.
    fn get_records(
        &self,
        id: MigrationId,
    ) -> impl Future<Output = ShiftResult<Vec<MigrationRecord>>> + Send;

    /// Returns the records of the `limit` most recently requested migrations of `keyspace`,
    /// newest first, one record per shard.
    fn list_recent(
        &self,
        keyspace: &str,
        limit: usize,
    ) -> impl Future<Output = ShiftResult<Vec<MigrationRecord>>> + Send;

    /// Returns the records of `shard` whose status is not terminal, oldest request first.
    fn get_unfinished(
        &self,
        keyspace: &str,
        shard: &ShardId,
    ) -> impl Future<Output = ShiftResult<Vec<MigrationRecord>>> + Send;
}
