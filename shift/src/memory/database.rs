use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, watch};
use tracing::{debug, info};

use crate::bail;
use crate::error::{ErrorKind, ShiftResult};
use crate::memory::feed::feed_stream;
use crate::schema::{TableSchema, conforms};
use crate::storage::{ChangeFeed, FeedStream, LagSource, SchemaEngine};
use crate::types::{Cell, ChangeEvent, ChangeOperation, Position, PrimaryKey, TableRow};

#[derive(Debug)]
pub(super) struct MemoryTable {
    pub(super) schema: TableSchema,
    pub(super) rows: BTreeMap<PrimaryKey, TableRow>,
}

#[derive(Debug, Default)]
pub(super) struct DatabaseState {
    pub(super) tables: HashMap<String, MemoryTable>,
    /// Every committed change, the change at position `p` being stored at index `p - 1`.
    pub(super) log: Vec<ChangeEvent>,
}

impl DatabaseState {
    fn table(&self, name: &str) -> ShiftResult<&MemoryTable> {
        match self.tables.get(name) {
            Some(table) => Ok(table),
            None => bail!(
                ErrorKind::TableNotFound,
                "Table does not exist",
                format!("table `{name}`")
            ),
        }
    }

    fn table_mut(&mut self, name: &str) -> ShiftResult<&mut MemoryTable> {
        match self.tables.get_mut(name) {
            Some(table) => Ok(table),
            None => bail!(
                ErrorKind::TableNotFound,
                "Table does not exist",
                format!("table `{name}`")
            ),
        }
    }

    pub(super) fn live_position(&self) -> Position {
        Position(self.log.len() as u64)
    }

    fn append(
        &mut self,
        table: &str,
        primary_key: PrimaryKey,
        operation: ChangeOperation,
        row_image: TableRow,
    ) {
        let position = self.live_position().next();
        self.log.push(ChangeEvent {
            table: table.to_owned(),
            primary_key,
            operation,
            row_image,
            position,
        });
    }

    fn rename(&mut self, from: &str, to: &str) {
        if let Some(mut table) = self.tables.remove(from) {
            table.schema.name = to.to_owned();
            self.tables.insert(to.to_owned(), table);
        }
    }
}

#[derive(Debug)]
pub(super) struct Inner {
    pub(super) state: Mutex<DatabaseState>,
    pub(super) position_tx: watch::Sender<Position>,
    pub(super) feed_failures: AtomicU32,
    fences: Mutex<HashMap<String, Arc<RwLock<()>>>>,
    lag_estimate: AtomicU64,
    atomic_rename: bool,
}

/// A process-local storage engine for one shard.
///
/// Client statements ([`MemoryDatabase::insert_ignore`], [`MemoryDatabase::update`],
/// [`MemoryDatabase::delete_if`]) wait on the write fence of their table and append exactly
/// one change per affected row to the change log, under the same lock as the mutation. Reads
/// issued by clients wait on the fence as well, so a table is never observed missing while it
/// is being swapped.
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    inner: Arc<Inner>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::build(true)
    }

    /// Creates a database whose renames apply one table at a time.
    pub fn without_atomic_rename() -> Self {
        Self::build(false)
    }

    fn build(atomic_rename: bool) -> Self {
        let (position_tx, _) = watch::channel(Position::ZERO);
        let inner = Inner {
            state: Mutex::new(DatabaseState::default()),
            position_tx,
            feed_failures: AtomicU32::new(0),
            fences: Mutex::new(HashMap::new()),
            lag_estimate: AtomicU64::new(0f64.to_bits()),
            atomic_rename,
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Makes the next `count` reads of open feed subscriptions fail with a transient error.
    pub fn inject_feed_failures(&self, count: u32) {
        self.inner.feed_failures.store(count, Ordering::SeqCst);
    }

    pub fn set_lag_estimate(&self, lag: f64) {
        self.inner.lag_estimate.store(lag.to_bits(), Ordering::SeqCst);
    }

    async fn fence(&self, table: &str) -> Arc<RwLock<()>> {
        let mut fences = self.inner.fences.lock().await;
        fences
            .entry(table.to_owned())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Runs a client statement on `table` and publishes the new feed position if it logged
    /// changes.
    async fn execute<T, F>(&self, table: &str, statement: F) -> ShiftResult<T>
    where
        F: FnOnce(&mut DatabaseState) -> ShiftResult<T>,
    {
        let fence = self.fence(table).await;
        let _guard = fence.read().await;

        let mut state = self.inner.state.lock().await;
        let before = state.live_position();
        let result = statement(&mut *state)?;

        let after = state.live_position();
        if after != before {
            self.inner.position_tx.send_replace(after);
        }

        Ok(result)
    }

    /// Inserts a row unless its primary key already exists, like `INSERT IGNORE`.
    ///
    /// Columns not listed in `values` take their default. Returns whether a row was inserted.
    pub async fn insert_ignore(&self, table: &str, values: Vec<(&str, Cell)>) -> ShiftResult<bool> {
        self.execute(table, |state| {
            let memory_table = state.table_mut(table)?;
            let schema = &memory_table.schema;

            for (name, _) in &values {
                if schema.column(name).is_none() {
                    bail!(
                        ErrorKind::ValidationError,
                        "Unknown column in insert",
                        format!("column `{name}` in table `{table}`")
                    );
                }
            }

            let mut cells = Vec::with_capacity(schema.columns.len());
            for column in &schema.columns {
                let value = values
                    .iter()
                    .find(|(name, _)| column.name.eq_ignore_ascii_case(name))
                    .map(|(_, cell)| column.convert(cell.clone()))
                    .unwrap_or_else(|| column.default_value());

                match value {
                    Ok(cell) => cells.push(cell),
                    Err(reason) => bail!(ErrorKind::ValidationError, "Invalid value", reason),
                }
            }

            let row = TableRow::new(cells);
            let key = schema.key_of(&row)?;
            if memory_table.rows.contains_key(&key) {
                return Ok(false);
            }
            memory_table.rows.insert(key.clone(), row.clone());

            state.append(table, key, ChangeOperation::Insert, row);

            Ok(true)
        })
        .await
    }

    /// Updates the row with primary key `key` in place through `update`.
    ///
    /// Returns whether the row existed and was changed. The primary key cannot be changed.
    pub async fn update<F>(&self, table: &str, key: &PrimaryKey, update: F) -> ShiftResult<bool>
    where
        F: FnOnce(&TableSchema, &mut TableRow) -> ShiftResult<()>,
    {
        self.execute(table, |state| {
            let memory_table = state.table_mut(table)?;
            let Some(current) = memory_table.rows.get(key) else {
                return Ok(false);
            };

            let mut row = current.clone();
            update(&memory_table.schema, &mut row)?;
            if row == *current {
                return Ok(false);
            }

            if !conforms(&memory_table.schema, &row) {
                bail!(
                    ErrorKind::ValidationError,
                    "Updated row does not match the table schema",
                    format!("row with key {key} in table `{table}`")
                );
            }
            if memory_table.schema.key_of(&row)? != *key {
                bail!(
                    ErrorKind::ValidationError,
                    "Primary key cannot be updated",
                    format!("row with key {key} in table `{table}`")
                );
            }
            memory_table.rows.insert(key.clone(), row.clone());

            state.append(table, key.clone(), ChangeOperation::Update, row);

            Ok(true)
        })
        .await
    }

    /// Deletes the row with primary key `key` if it exists and satisfies `predicate`.
    pub async fn delete_if<F>(&self, table: &str, key: &PrimaryKey, predicate: F) -> ShiftResult<bool>
    where
        F: FnOnce(&TableSchema, &TableRow) -> bool,
    {
        self.execute(table, |state| {
            let memory_table = state.table_mut(table)?;
            let matches = memory_table
                .rows
                .get(key)
                .is_some_and(|row| predicate(&memory_table.schema, row));
            if !matches {
                return Ok(false);
            }

            let Some(row) = memory_table.rows.remove(key) else {
                return Ok(false);
            };
            state.append(table, key.clone(), ChangeOperation::Delete, row);

            Ok(true)
        })
        .await
    }

    /// Returns every row of `table` in primary key order.
    pub async fn rows(&self, table: &str) -> ShiftResult<Vec<TableRow>> {
        self.execute(table, |state| {
            Ok(state.table(table)?.rows.values().cloned().collect())
        })
        .await
    }

    pub async fn count_rows(&self, table: &str) -> ShiftResult<usize> {
        self.execute(table, |state| Ok(state.table(table)?.rows.len()))
            .await
    }

    /// Sums a non-negative integer column, counting nulls as zero.
    pub async fn sum_column(&self, table: &str, column: &str) -> ShiftResult<u64> {
        self.execute(table, |state| {
            let memory_table = state.table(table)?;
            let Some(index) = memory_table.schema.column_index(column) else {
                bail!(
                    ErrorKind::ValidationError,
                    "Column does not exist",
                    format!("column `{column}` in table `{table}`")
                );
            };

            let mut sum = 0u64;
            for row in memory_table.rows.values() {
                let cell = &row.values[index];
                if cell.is_null() {
                    continue;
                }
                let Some(value) = cell.as_u64() else {
                    bail!(
                        ErrorKind::ValidationError,
                        "Column is not a non-negative integer",
                        format!("column `{column}` has value {cell}")
                    );
                };
                sum += value;
            }

            Ok(sum)
        })
        .await
    }

    /// Returns the `CREATE TABLE` statement of `table`, like `SHOW CREATE TABLE`.
    pub async fn show_create_table(&self, table: &str) -> ShiftResult<String> {
        self.execute(table, |state| {
            Ok(state.table(table)?.schema.create_table_statement())
        })
        .await
    }

    pub async fn table_names(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        let mut names: Vec<_> = state.tables.keys().cloned().collect();
        names.sort();

        names
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaEngine for MemoryDatabase {
    type WriteFence = OwnedRwLockWriteGuard<()>;

    async fn table_schema(&self, table: &str) -> ShiftResult<Option<TableSchema>> {
        let state = self.inner.state.lock().await;
        Ok(state.tables.get(table).map(|table| table.schema.clone()))
    }

    async fn create_table(&self, schema: &TableSchema) -> ShiftResult<()> {
        schema.validate()?;

        let mut state = self.inner.state.lock().await;
        if state.tables.contains_key(&schema.name) {
            bail!(
                ErrorKind::TableAlreadyExists,
                "Table already exists",
                format!("table `{}`", schema.name)
            );
        }

        info!(table = %schema.name, "creating table");
        state.tables.insert(
            schema.name.clone(),
            MemoryTable {
                schema: schema.clone(),
                rows: BTreeMap::new(),
            },
        );

        Ok(())
    }

    async fn drop_table(&self, table: &str) -> ShiftResult<bool> {
        let mut state = self.inner.state.lock().await;
        let existed = state.tables.remove(table).is_some();
        if existed {
            info!(table, "dropped table");
        }

        Ok(existed)
    }

    async fn rename_tables(&self, renames: &[(String, String)]) -> ShiftResult<()> {
        let mut state = self.inner.state.lock().await;

        if !self.inner.atomic_rename {
            for (from, to) in renames {
                if !state.tables.contains_key(from) {
                    bail!(
                        ErrorKind::TableNotFound,
                        "Table to rename does not exist",
                        format!("table `{from}`")
                    );
                }
                if state.tables.contains_key(to) {
                    bail!(
                        ErrorKind::TableAlreadyExists,
                        "Rename target already exists",
                        format!("table `{to}`")
                    );
                }
                state.rename(from, to);
                debug!(from, to, "renamed table");
            }

            return Ok(());
        }

        // Validate the whole sequence before touching anything.
        let mut names: HashSet<&str> = state.tables.keys().map(String::as_str).collect();
        for (from, to) in renames {
            if !names.remove(from.as_str()) {
                bail!(
                    ErrorKind::TableNotFound,
                    "Table to rename does not exist",
                    format!("table `{from}`")
                );
            }
            if !names.insert(to.as_str()) {
                bail!(
                    ErrorKind::TableAlreadyExists,
                    "Rename target already exists",
                    format!("table `{to}`")
                );
            }
        }

        for (from, to) in renames {
            state.rename(from, to);
            debug!(from, to, "renamed table");
        }

        Ok(())
    }

    fn supports_atomic_rename(&self) -> bool {
        self.inner.atomic_rename
    }

    async fn acquire_write_fence(
        &self,
        table: &str,
        timeout: Duration,
    ) -> ShiftResult<Self::WriteFence> {
        let fence = self.fence(table).await;
        match tokio::time::timeout(timeout, fence.write_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => bail!(
                ErrorKind::LockTimeout,
                "Timed out waiting for the write fence",
                format!("table `{table}` after {timeout:?}")
            ),
        }
    }

    async fn read_chunk(
        &self,
        table: &str,
        after: Option<&PrimaryKey>,
        limit: usize,
    ) -> ShiftResult<Vec<TableRow>> {
        let state = self.inner.state.lock().await;
        let rows = &state.table(table)?.rows;

        let lower = match after {
            Some(key) => Bound::Excluded(key.clone()),
            None => Bound::Unbounded,
        };
        let chunk = rows
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, row)| row.clone())
            .collect();

        Ok(chunk)
    }

    async fn upsert_rows(&self, table: &str, rows: Vec<TableRow>) -> ShiftResult<()> {
        let mut state = self.inner.state.lock().await;
        let MemoryTable {
            schema,
            rows: stored,
        } = state.table_mut(table)?;

        for row in rows {
            if !conforms(schema, &row) {
                bail!(
                    ErrorKind::InvalidState,
                    "Row does not match the table schema",
                    format!("table `{table}`")
                );
            }
            stored.insert(schema.key_of(&row)?, row);
        }

        Ok(())
    }

    async fn delete_rows(&self, table: &str, keys: Vec<PrimaryKey>) -> ShiftResult<()> {
        let mut state = self.inner.state.lock().await;
        let memory_table = state.table_mut(table)?;
        for key in keys {
            memory_table.rows.remove(&key);
        }

        Ok(())
    }
}

impl ChangeFeed for MemoryDatabase {
    async fn subscribe(&self, table: &str, from: Position) -> ShiftResult<FeedStream> {
        debug!(table, %from, "subscribing to change feed");
        Ok(feed_stream(self.inner.clone(), table.to_owned(), from))
    }

    async fn live_position(&self) -> ShiftResult<Position> {
        Ok(*self.inner.position_tx.borrow())
    }
}

impl LagSource for MemoryDatabase {
    async fn current_lag_estimate(&self) -> ShiftResult<f64> {
        Ok(f64::from_bits(self.inner.lag_estimate.load(Ordering::SeqCst)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ddl::parse_create_table;

    async fn database() -> MemoryDatabase {
        let database = MemoryDatabase::new();
        let schema = parse_create_table(
            "CREATE TABLE t (id bigint NOT NULL, v int unsigned NOT NULL DEFAULT 0, PRIMARY KEY (id))",
        )
        .unwrap();
        database.create_table(&schema).await.unwrap();

        database
    }

    #[tokio::test]
    async fn statements_are_logged_once_per_affected_row() {
        let database = database().await;

        assert!(
            database
                .insert_ignore("t", vec![("id", Cell::I64(1))])
                .await
                .unwrap()
        );
        assert!(
            !database
                .insert_ignore("t", vec![("id", Cell::I64(1))])
                .await
                .unwrap()
        );
        let key = PrimaryKey::from(1i64);
        assert!(
            database
                .update("t", &key, |_, row| {
                    row.values[1] = Cell::U64(5);
                    Ok(())
                })
                .await
                .unwrap()
        );
        assert!(database.delete_if("t", &key, |_, _| true).await.unwrap());

        assert_eq!(database.live_position().await.unwrap(), Position(3));
        assert_eq!(database.count_rows("t").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn engine_writes_are_not_logged() {
        let database = database().await;

        database
            .upsert_rows("t", vec![TableRow::new(vec![Cell::I64(1), Cell::U64(2)])])
            .await
            .unwrap();

        assert_eq!(database.live_position().await.unwrap(), Position::ZERO);
        assert_eq!(database.sum_column("t", "v").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn chunks_are_read_in_key_order() {
        let database = database().await;
        for id in [3i64, 1, 2] {
            database
                .insert_ignore("t", vec![("id", Cell::I64(id))])
                .await
                .unwrap();
        }

        let first = database.read_chunk("t", None, 2).await.unwrap();
        let after = PrimaryKey::from(2i64);
        let rest = database.read_chunk("t", Some(&after), 2).await.unwrap();

        assert_eq!(first[0].values[0], Cell::I64(1));
        assert_eq!(first[1].values[0], Cell::I64(2));
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].values[0], Cell::I64(3));
    }

    #[tokio::test]
    async fn atomic_renames_are_all_or_nothing() {
        let database = database().await;

        let err = database
            .rename_tables(&[
                ("t".to_owned(), "u".to_owned()),
                ("missing".to_owned(), "t".to_owned()),
            ])
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::TableNotFound);
        assert_eq!(database.table_names().await, vec!["t".to_owned()]);
    }

    #[tokio::test]
    async fn write_fence_blocks_writers_and_times_out() {
        let database = database().await;

        let fence = database
            .acquire_write_fence("t", Duration::from_millis(100))
            .await
            .unwrap();
        let err = database
            .acquire_write_fence("t", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockTimeout);

        let writer = {
            let database = database.clone();
            tokio::spawn(async move {
                database
                    .insert_ignore("t", vec![("id", Cell::I64(1))])
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        drop(fence);
        assert!(writer.await.unwrap().unwrap());
    }
}
