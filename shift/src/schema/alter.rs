use crate::bail;
use crate::error::{ErrorKind, ShiftResult};
use crate::schema::table::{ColumnSchema, DefaultValue, IndexSchema, TableSchema};

/// A parsed `ALTER TABLE` statement.
#[derive(Debug, Clone, PartialEq)]
pub struct AlterTable {
    pub table: String,
    pub operations: Vec<AlterOperation>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlterOperation {
    AddColumn(ColumnSchema),
    DropColumn(String),
    ModifyColumn(ColumnSchema),
    ChangeColumn { old: String, column: ColumnSchema },
    RenameColumn { from: String, to: String },
    SetDefault { column: String, default: DefaultValue },
    DropDefault { column: String },
    AddIndex(IndexSchema),
    DropIndex(String),
}

/// The outcome of applying an [`AlterTable`] to a schema.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaDelta {
    /// The schema after the alter, under the name of the altered table.
    pub target: TableSchema,
    /// For each target column, the position of the source column its values come from, or
    /// `None` for columns filled with their default.
    pub origins: Vec<Option<usize>>,
}

impl AlterTable {
    /// Applies the operations in order to `source`, producing the target schema.
    ///
    /// Fails with [`ErrorKind::ValidationError`] when an operation references a missing column
    /// or index, adds one that already exists, or drops or retypes a primary key column.
    pub fn apply(&self, source: &TableSchema) -> ShiftResult<SchemaDelta> {
        let mut columns: Vec<(ColumnSchema, Option<usize>)> = source
            .columns
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, column)| (column, Some(i)))
            .collect();
        let mut primary_key = source.primary_key.clone();
        let mut indexes = source.indexes.clone();

        for operation in &self.operations {
            match operation {
                AlterOperation::AddColumn(column) => {
                    if position(&columns, &column.name).is_some() {
                        bail!(
                            ErrorKind::ValidationError,
                            "Column already exists",
                            format!("column `{}` in table `{}`", column.name, source.name)
                        );
                    }
                    columns.push((column.clone(), None));
                }
                AlterOperation::DropColumn(name) => {
                    let index = existing(&columns, name, &source.name)?;
                    if contains(&primary_key, name) {
                        bail!(
                            ErrorKind::ValidationError,
                            "Primary key columns cannot be dropped",
                            format!("column `{name}` in table `{}`", source.name)
                        );
                    }
                    columns.remove(index);

                    for index in &mut indexes {
                        index.columns.retain(|column| !column.eq_ignore_ascii_case(name));
                    }
                    indexes.retain(|index| !index.columns.is_empty());
                }
                AlterOperation::ModifyColumn(column) => {
                    let index = existing(&columns, &column.name, &source.name)?;
                    replace_column(&mut columns[index].0, column, &primary_key)?;
                }
                AlterOperation::ChangeColumn { old, column } => {
                    let index = existing(&columns, old, &source.name)?;
                    if !old.eq_ignore_ascii_case(&column.name) {
                        ensure_absent(&columns, &column.name, &source.name)?;
                    }
                    replace_column(&mut columns[index].0, column, &primary_key)?;
                    rename_references(&mut primary_key, &mut indexes, old, &column.name);
                }
                AlterOperation::RenameColumn { from, to } => {
                    let index = existing(&columns, from, &source.name)?;
                    if !from.eq_ignore_ascii_case(to) {
                        ensure_absent(&columns, to, &source.name)?;
                    }
                    columns[index].0.name = to.clone();
                    rename_references(&mut primary_key, &mut indexes, from, to);
                }
                AlterOperation::SetDefault { column, default } => {
                    let index = existing(&columns, column, &source.name)?;
                    columns[index].0.default = Some(default.clone());
                }
                AlterOperation::DropDefault { column } => {
                    let index = existing(&columns, column, &source.name)?;
                    columns[index].0.default = None;
                }
                AlterOperation::AddIndex(index) => {
                    if indexes
                        .iter()
                        .any(|other| other.name.eq_ignore_ascii_case(&index.name))
                    {
                        bail!(
                            ErrorKind::ValidationError,
                            "Index already exists",
                            format!("index `{}` in table `{}`", index.name, source.name)
                        );
                    }
                    indexes.push(index.clone());
                }
                AlterOperation::DropIndex(name) => {
                    let Some(index) = indexes
                        .iter()
                        .position(|index| index.name.eq_ignore_ascii_case(name))
                    else {
                        bail!(
                            ErrorKind::ValidationError,
                            "Index does not exist",
                            format!("index `{name}` in table `{}`", source.name)
                        );
                    };
                    indexes.remove(index);
                }
            }
        }

        let (columns, origins) = columns.into_iter().unzip();
        let target = TableSchema::new(source.name.clone(), columns, primary_key, indexes)?;

        Ok(SchemaDelta { target, origins })
    }
}

fn position(columns: &[(ColumnSchema, Option<usize>)], name: &str) -> Option<usize> {
    columns
        .iter()
        .position(|(column, _)| column.name.eq_ignore_ascii_case(name))
}

fn existing(
    columns: &[(ColumnSchema, Option<usize>)],
    name: &str,
    table: &str,
) -> ShiftResult<usize> {
    match position(columns, name) {
        Some(index) => Ok(index),
        None => bail!(
            ErrorKind::ValidationError,
            "Column does not exist",
            format!("column `{name}` in table `{table}`")
        ),
    }
}

fn ensure_absent(
    columns: &[(ColumnSchema, Option<usize>)],
    name: &str,
    table: &str,
) -> ShiftResult<()> {
    if position(columns, name).is_some() {
        bail!(
            ErrorKind::ValidationError,
            "Column already exists",
            format!("column `{name}` in table `{table}`")
        );
    }

    Ok(())
}

fn contains(names: &[String], name: &str) -> bool {
    names.iter().any(|other| other.eq_ignore_ascii_case(name))
}

/// Replaces the definition of `current` with `new`, refusing to change the type of a primary
/// key column.
fn replace_column(
    current: &mut ColumnSchema,
    new: &ColumnSchema,
    primary_key: &[String],
) -> ShiftResult<()> {
    if contains(primary_key, &current.name) {
        if current.ty != new.ty {
            bail!(
                ErrorKind::ValidationError,
                "Primary key columns cannot be retyped",
                format!("column `{}` from {} to {}", current.name, current.ty, new.ty)
            );
        }

        *current = ColumnSchema {
            nullable: false,
            ..new.clone()
        };
        return Ok(());
    }

    *current = new.clone();

    Ok(())
}

fn rename_references(
    primary_key: &mut [String],
    indexes: &mut [IndexSchema],
    from: &str,
    to: &str,
) {
    let names = primary_key
        .iter_mut()
        .chain(indexes.iter_mut().flat_map(|index| index.columns.iter_mut()));
    for name in names {
        if name.eq_ignore_ascii_case(from) {
            *name = to.to_owned();
        }
    }
}
