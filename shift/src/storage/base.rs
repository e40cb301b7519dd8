use futures::stream::BoxStream;
use std::future::Future;
use std::time::Duration;

use crate::error::ShiftResult;
use crate::schema::TableSchema;
use crate::types::{FeedMessage, Position, PrimaryKey, TableRow};

/// A stream of messages of a change feed subscription.
///
/// The stream is infinite while the feed is healthy. An `Err` item or the end of the stream
/// means the subscription is broken and must be re-established from the last applied position.
pub type FeedStream = BoxStream<'static, ShiftResult<FeedMessage>>;

/// Schema and row level primitives of the storage engine of a shard.
///
/// Row operations issued through this trait are internal to the migration engine: they are not
/// published on the [`ChangeFeed`] and do not wait on write fences.
pub trait SchemaEngine {
    /// Guard excluding every client write on a table while it is held.
    type WriteFence: Send + 'static;

    /// Returns the schema of `table`, or `None` if it does not exist.
    fn table_schema(
        &self,
        table: &str,
    ) -> impl Future<Output = ShiftResult<Option<TableSchema>>> + Send;

    /// Creates an empty table with the given schema.
    fn create_table(&self, schema: &TableSchema) -> impl Future<Output = ShiftResult<()>> + Send;

    /// Drops `table`, returning whether it existed.
    fn drop_table(&self, table: &str) -> impl Future<Output = ShiftResult<bool>> + Send;

    /// Renames tables in order, each pair being `(from, to)`.
    ///
    /// When [`SchemaEngine::supports_atomic_rename`] is `true`, either every rename takes effect
    /// or none does, and no reader can observe an intermediate state.
    fn rename_tables(
        &self,
        renames: &[(String, String)],
    ) -> impl Future<Output = ShiftResult<()>> + Send;

    fn supports_atomic_rename(&self) -> bool;

    /// Waits until every in-flight write on `table` has committed and blocks new ones.
    ///
    /// Fails with [`crate::error::ErrorKind::LockTimeout`] if the fence cannot be acquired
    /// within `timeout`. The fence is bound to the table name, so it keeps excluding writers
    /// across renames of the underlying table.
    fn acquire_write_fence(
        &self,
        table: &str,
        timeout: Duration,
    ) -> impl Future<Output = ShiftResult<Self::WriteFence>> + Send;

    /// Reads up to `limit` rows of `table` in primary key order, starting right after `after`.
    fn read_chunk(
        &self,
        table: &str,
        after: Option<&PrimaryKey>,
        limit: usize,
    ) -> impl Future<Output = ShiftResult<Vec<TableRow>>> + Send;

    /// Inserts rows, replacing rows with the same primary key.
    fn upsert_rows(
        &self,
        table: &str,
        rows: Vec<TableRow>,
    ) -> impl Future<Output = ShiftResult<()>> + Send;

    /// Deletes the rows with the given primary keys, ignoring keys that do not exist.
    fn delete_rows(
        &self,
        table: &str,
        keys: Vec<PrimaryKey>,
    ) -> impl Future<Output = ShiftResult<()>> + Send;
}

/// Ordered, resumable stream of committed row changes.
pub trait ChangeFeed {
    /// Subscribes to the changes of `table` committed strictly after `from`.
    fn subscribe(
        &self,
        table: &str,
        from: Position,
    ) -> impl Future<Output = ShiftResult<FeedStream>> + Send;

    /// Returns the position of the most recent committed change across all tables.
    fn live_position(&self) -> impl Future<Output = ShiftResult<Position>> + Send;
}

/// Source of the load signal the throttler acts upon.
pub trait LagSource {
    fn current_lag_estimate(&self) -> impl Future<Output = ShiftResult<f64>> + Send;
}
