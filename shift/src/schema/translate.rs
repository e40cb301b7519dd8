use chrono::{DateTime, Utc};

use crate::error::{ErrorKind, ShiftError, ShiftResult};
use crate::{bail, shift_error};
use crate::schema::alter::SchemaDelta;
use crate::schema::table::{ColumnSchema, TableSchema};
use crate::types::{Cell, PrimaryKey, TableRow};

#[derive(Debug, Clone)]
enum ColumnPlan {
    Copy { source: usize },
    Default,
}

/// Projects rows of the source schema onto the target schema of a [`SchemaDelta`].
///
/// Translation is deterministic: the same source row always yields the same target row. New
/// columns defaulting to `CURRENT_TIMESTAMP` get `default_timestamp`, which the migration fixes
/// once so that copied, replayed and redelivered rows agree.
#[derive(Debug, Clone)]
pub struct RowTranslator {
    source_key_indices: Vec<usize>,
    source_width: usize,
    target: TableSchema,
    plan: Vec<ColumnPlan>,
    default_timestamp: DateTime<Utc>,
}

impl RowTranslator {
    pub fn new(source: &TableSchema, delta: &SchemaDelta, default_timestamp: DateTime<Utc>) -> Self {
        let plan = delta
            .origins
            .iter()
            .map(|origin| match origin {
                Some(source) => ColumnPlan::Copy { source: *source },
                None => ColumnPlan::Default,
            })
            .collect();

        Self {
            source_key_indices: source.primary_key_indices(),
            source_width: source.columns.len(),
            target: delta.target.clone(),
            plan,
            default_timestamp,
        }
    }

    pub fn target(&self) -> &TableSchema {
        &self.target
    }

    /// Extracts the primary key of a source row.
    pub fn source_key(&self, row: &TableRow) -> ShiftResult<PrimaryKey> {
        PrimaryKey::from_row(row, &self.source_key_indices)
    }

    /// Translates a source row into a target row.
    ///
    /// Fails with [`ErrorKind::SchemaTranslationError`] when a value cannot be represented
    /// under the new column definition without losing information.
    pub fn translate(&self, row: &TableRow) -> ShiftResult<TableRow> {
        if row.values.len() != self.source_width {
            bail!(
                ErrorKind::SchemaTranslationError,
                "Row does not match the source schema",
                format!(
                    "expected {} values, got {}",
                    self.source_width,
                    row.values.len()
                )
            );
        }

        let mut values = Vec::with_capacity(self.plan.len());
        for (plan, column) in self.plan.iter().zip(&self.target.columns) {
            let converted = match plan {
                ColumnPlan::Copy { source } => column.convert(row.values[*source].clone()),
                ColumnPlan::Default => column.default_value_at(self.default_timestamp),
            };

            match converted {
                Ok(cell) => values.push(cell),
                Err(reason) => return Err(self.translation_error(row, column, reason)),
            }
        }

        Ok(TableRow::new(values))
    }

    fn translation_error(
        &self,
        row: &TableRow,
        column: &ColumnSchema,
        reason: String,
    ) -> ShiftError {
        let key = self
            .source_key(row)
            .map(|key| key.to_string())
            .unwrap_or_else(|_| "unknown".to_owned());

        shift_error!(
            ErrorKind::SchemaTranslationError,
            "Row cannot be translated to the new schema",
            format!(
                "row with key {key} in table `{}`, column `{}`: {reason}",
                self.target.name, column.name
            )
        )
    }
}

/// Returns `true` if every value of `row` is already valid under `schema`.
pub(crate) fn conforms(schema: &TableSchema, row: &TableRow) -> bool {
    row.values.len() == schema.columns.len()
        && row
            .values
            .iter()
            .zip(&schema.columns)
            .all(|(cell, column)| matches!(column.convert(cell.clone()), Ok(ref c) if c == cell))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::schema::ddl::{parse_alter_table, parse_create_table};

    fn source() -> TableSchema {
        parse_create_table(
            "CREATE TABLE t (
                id bigint not null,
                name varchar(32) null,
                hits int unsigned not null default 0,
                PRIMARY KEY (id)
            )",
        )
        .unwrap()
    }

    fn translator(alter: &str) -> RowTranslator {
        let source = source();
        let delta = parse_alter_table(alter).unwrap().apply(&source).unwrap();
        RowTranslator::new(&source, &delta, Utc::now())
    }

    fn row(id: i64, name: Option<&str>, hits: u64) -> TableRow {
        TableRow::new(vec![
            Cell::I64(id),
            name.map(|name| Cell::String(name.to_owned()))
                .unwrap_or(Cell::Null),
            Cell::U64(hits),
        ])
    }

    #[test]
    fn new_columns_get_their_default() {
        let translator =
            translator("ALTER TABLE t ADD COLUMN note varchar(8) NOT NULL DEFAULT 'n', DROP hits");

        let translated = translator.translate(&row(1, Some("a"), 3)).unwrap();

        assert_eq!(
            translated.values,
            vec![
                Cell::I64(1),
                Cell::String("a".to_owned()),
                Cell::String("n".to_owned())
            ]
        );
        assert!(conforms(translator.target(), &translated));
    }

    #[test]
    fn current_timestamp_defaults_do_not_depend_on_when_rows_are_translated() {
        let source = source();
        let delta = parse_alter_table(
            "ALTER TABLE t ADD COLUMN created_at timestamp NOT NULL DEFAULT CURRENT_TIMESTAMP",
        )
        .unwrap()
        .apply(&source)
        .unwrap();
        let migration_started = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let translator = RowTranslator::new(&source, &delta, migration_started);

        let copied = translator.translate(&row(1, Some("a"), 3)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1_100));
        let replayed = translator.clone().translate(&row(1, Some("a"), 3)).unwrap();

        assert_eq!(copied, replayed);
        assert_eq!(copied.values[3], Cell::Timestamp(migration_started));
    }

    #[test]
    fn widening_keeps_values() {
        let translator = translator("ALTER TABLE t MODIFY hits bigint");

        let translated = translator.translate(&row(1, None, 7)).unwrap();

        assert_eq!(translated.values[2], Cell::I64(7));
    }

    #[test]
    fn lossy_conversions_fail_translation() {
        let translator = translator("ALTER TABLE t MODIFY name varchar(2)");

        assert!(translator.translate(&row(1, Some("ab"), 0)).is_ok());
        let err = translator.translate(&row(9, Some("abc"), 0)).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SchemaTranslationError);
        assert!(err.detail().unwrap().contains("(9)"));
    }

    #[test]
    fn null_into_not_null_fails_translation() {
        let translator = translator("ALTER TABLE t MODIFY name varchar(32) NOT NULL");

        let err = translator.translate(&row(1, None, 0)).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SchemaTranslationError);
    }
}
