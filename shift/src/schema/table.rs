use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use std::fmt;
use std::fmt::Write;

use crate::bail;
use crate::error::{ErrorKind, ShiftResult};
use crate::types::{Cell, PrimaryKey, TableRow};

/// Format of timestamps when converted from and to text.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegerWidth {
    Tiny,
    Small,
    Int,
    Big,
}

impl IntegerWidth {
    fn bits(self) -> u32 {
        match self {
            IntegerWidth::Tiny => 8,
            IntegerWidth::Small => 16,
            IntegerWidth::Int => 32,
            IntegerWidth::Big => 64,
        }
    }

    /// Returns the inclusive range of values a column of this width can hold.
    pub fn bounds(self, unsigned: bool) -> (i128, i128) {
        let bits = self.bits();
        if unsigned {
            (0, (1i128 << bits) - 1)
        } else {
            (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer { width: IntegerWidth, unsigned: bool },
    /// Variable length text of at most the given number of characters.
    Varchar(u32),
    Text,
    Timestamp,
    Boolean,
    Double,
}

impl ColumnType {
    /// Whether values of this type can be part of a primary key.
    pub fn is_key_type(&self) -> bool {
        matches!(
            self,
            ColumnType::Integer { .. } | ColumnType::Varchar(_) | ColumnType::Text
        )
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Integer { width, unsigned } => {
                let name = match width {
                    IntegerWidth::Tiny => "tinyint",
                    IntegerWidth::Small => "smallint",
                    IntegerWidth::Int => "int",
                    IntegerWidth::Big => "bigint",
                };
                f.write_str(name)?;
                if *unsigned {
                    f.write_str(" unsigned")?;
                }

                Ok(())
            }
            ColumnType::Varchar(length) => write!(f, "varchar({length})"),
            ColumnType::Text => f.write_str("text"),
            ColumnType::Timestamp => f.write_str("timestamp"),
            ColumnType::Boolean => f.write_str("boolean"),
            ColumnType::Double => f.write_str("double"),
        }
    }
}

/// A literal value as written in a statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Integer(i128),
    Float(f64),
    String(String),
}

impl Literal {
    fn to_raw_cell(&self) -> Result<Cell, String> {
        let cell = match self {
            Literal::Null => Cell::Null,
            Literal::Bool(value) => Cell::Bool(*value),
            Literal::Integer(value) => {
                if let Ok(value) = i64::try_from(*value) {
                    Cell::I64(value)
                } else if let Ok(value) = u64::try_from(*value) {
                    Cell::U64(value)
                } else {
                    return Err(format!("integer literal {value} is out of range"));
                }
            }
            Literal::Float(value) => Cell::F64(*value),
            Literal::String(value) => Cell::String(value.clone()),
        };

        Ok(cell)
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Null => f.write_str("NULL"),
            Literal::Bool(true) => f.write_str("TRUE"),
            Literal::Bool(false) => f.write_str("FALSE"),
            Literal::Integer(value) => write!(f, "'{value}'"),
            Literal::Float(value) => write!(f, "'{value}'"),
            Literal::String(value) => write!(f, "'{}'", value.replace('\'', "''")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue {
    Literal(Literal),
    CurrentTimestamp,
}

impl fmt::Display for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultValue::Literal(literal) => literal.fmt(f),
            DefaultValue::CurrentTimestamp => f.write_str("CURRENT_TIMESTAMP"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSchema {
    pub name: String,
    pub ty: ColumnType,
    pub nullable: bool,
    pub default: Option<DefaultValue>,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: true,
            default: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_default(mut self, default: DefaultValue) -> Self {
        self.default = Some(default);
        self
    }

    /// Converts `cell` into a value of this column.
    ///
    /// Fails with a description of the problem when the value does not fit the column type or
    /// is null in a non-nullable column.
    pub fn convert(&self, cell: Cell) -> Result<Cell, String> {
        if cell.is_null() {
            if self.nullable {
                return Ok(Cell::Null);
            }

            return Err(format!("column `{}` cannot be null", self.name));
        }

        convert_cell(cell, &self.ty).map_err(|reason| format!("column `{}`: {reason}", self.name))
    }

    /// Returns the value of this column for a row that does not specify it.
    ///
    /// Non-nullable columns without an explicit default get the zero value of their type.
    pub fn default_value(&self) -> Result<Cell, String> {
        self.default_value_at(Utc::now())
    }

    /// Same as [`ColumnSchema::default_value`], with `CURRENT_TIMESTAMP` evaluated as `now`.
    pub fn default_value_at(&self, now: DateTime<Utc>) -> Result<Cell, String> {
        match &self.default {
            Some(DefaultValue::CurrentTimestamp) => {
                self.convert(Cell::Timestamp(now.trunc_subsecs(0)))
            }
            Some(DefaultValue::Literal(literal)) => self.convert(literal.to_raw_cell()?),
            None if self.nullable => Ok(Cell::Null),
            None => Ok(zero_value(&self.ty)),
        }
    }

    fn definition(&self) -> String {
        let mut definition = format!("`{}` {}", self.name, self.ty);
        if !self.nullable {
            definition.push_str(" NOT NULL");
        }
        match &self.default {
            Some(default) => {
                let _ = write!(definition, " DEFAULT {default}");
            }
            None if self.nullable => definition.push_str(" DEFAULT NULL"),
            None => {}
        }

        definition
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSchema {
    pub name: String,
    pub columns: Vec<String>,
}

/// Schema of a table: columns in order, primary key and secondary indexes.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    pub primary_key: Vec<String>,
    pub indexes: Vec<IndexSchema>,
}

impl TableSchema {
    pub fn new(
        name: impl Into<String>,
        columns: Vec<ColumnSchema>,
        primary_key: Vec<String>,
        indexes: Vec<IndexSchema>,
    ) -> ShiftResult<Self> {
        let schema = Self {
            name: name.into(),
            columns,
            primary_key,
            indexes,
        };
        schema.validate()?;

        Ok(schema)
    }

    /// Checks the structural rules every table must satisfy.
    pub fn validate(&self) -> ShiftResult<()> {
        if self.columns.is_empty() {
            bail!(
                ErrorKind::ValidationError,
                "Table has no columns",
                format!("table `{}`", self.name)
            );
        }

        for (i, column) in self.columns.iter().enumerate() {
            if self.columns[..i]
                .iter()
                .any(|other| other.name.eq_ignore_ascii_case(&column.name))
            {
                bail!(
                    ErrorKind::ValidationError,
                    "Duplicate column name",
                    format!("column `{}` in table `{}`", column.name, self.name)
                );
            }

            if let Some(default) = &column.default {
                if *default == DefaultValue::CurrentTimestamp && column.ty != ColumnType::Timestamp
                {
                    bail!(
                        ErrorKind::ValidationError,
                        "CURRENT_TIMESTAMP default on a non timestamp column",
                        format!("column `{}`", column.name)
                    );
                }

                if let Err(reason) = column.default_value() {
                    bail!(ErrorKind::ValidationError, "Invalid default value", reason);
                }
            }
        }

        if self.primary_key.is_empty() {
            bail!(
                ErrorKind::ValidationError,
                "Table has no primary key",
                format!("table `{}`", self.name)
            );
        }

        for key_column in &self.primary_key {
            let Some(column) = self.column(key_column) else {
                bail!(
                    ErrorKind::ValidationError,
                    "Primary key references an unknown column",
                    format!("column `{key_column}` in table `{}`", self.name)
                );
            };

            if !column.ty.is_key_type() {
                bail!(
                    ErrorKind::ValidationError,
                    "Primary key column must be an integer or a string",
                    format!("column `{}` has type {}", column.name, column.ty)
                );
            }
        }

        for (i, index) in self.indexes.iter().enumerate() {
            if self.indexes[..i]
                .iter()
                .any(|other| other.name.eq_ignore_ascii_case(&index.name))
            {
                bail!(
                    ErrorKind::ValidationError,
                    "Duplicate index name",
                    format!("index `{}` in table `{}`", index.name, self.name)
                );
            }

            for column in &index.columns {
                if self.column(column).is_none() {
                    bail!(
                        ErrorKind::ValidationError,
                        "Index references an unknown column",
                        format!("index `{}` uses column `{column}`", index.name)
                    );
                }
            }
        }

        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns
            .iter()
            .find(|column| column.name.eq_ignore_ascii_case(name))
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|column| column.name.eq_ignore_ascii_case(name))
    }

    pub fn is_primary_key_column(&self, name: &str) -> bool {
        self.primary_key
            .iter()
            .any(|key_column| key_column.eq_ignore_ascii_case(name))
    }

    /// Returns the column positions of the primary key, in key order.
    pub fn primary_key_indices(&self) -> Vec<usize> {
        self.primary_key
            .iter()
            .filter_map(|key_column| self.column_index(key_column))
            .collect()
    }

    pub fn key_of(&self, row: &TableRow) -> ShiftResult<PrimaryKey> {
        PrimaryKey::from_row(row, &self.primary_key_indices())
    }

    /// Returns a copy of this schema under another table name.
    pub fn renamed(&self, name: impl Into<String>) -> TableSchema {
        TableSchema {
            name: name.into(),
            ..self.clone()
        }
    }

    /// Renders the schema as a deterministic `CREATE TABLE` statement.
    pub fn create_table_statement(&self) -> String {
        let mut lines: Vec<String> = self
            .columns
            .iter()
            .map(|column| format!("  {}", column.definition()))
            .collect();

        lines.push(format!("  PRIMARY KEY ({})", quote_list(&self.primary_key)));

        for index in &self.indexes {
            lines.push(format!(
                "  KEY `{}` ({})",
                index.name,
                quote_list(&index.columns)
            ));
        }

        format!("CREATE TABLE `{}` (\n{}\n)", self.name, lines.join(",\n"))
    }
}

fn quote_list(names: &[String]) -> String {
    names
        .iter()
        .map(|name| format!("`{name}`"))
        .collect::<Vec<_>>()
        .join(",")
}

fn zero_value(ty: &ColumnType) -> Cell {
    match ty {
        ColumnType::Integer { unsigned: true, .. } => Cell::U64(0),
        ColumnType::Integer { unsigned: false, .. } => Cell::I64(0),
        ColumnType::Varchar(_) | ColumnType::Text => Cell::String(String::new()),
        ColumnType::Timestamp => Cell::Timestamp(DateTime::<Utc>::UNIX_EPOCH),
        ColumnType::Boolean => Cell::Bool(false),
        ColumnType::Double => Cell::F64(0.0),
    }
}

/// Converts a non-null `cell` into a value of type `ty`.
///
/// Conversions never lose information: values out of range, text too long for its column and
/// fractional numbers converted to integers are rejected.
pub fn convert_cell(cell: Cell, ty: &ColumnType) -> Result<Cell, String> {
    match ty {
        ColumnType::Integer { width, unsigned } => {
            let value: i128 = match &cell {
                Cell::I64(value) => i128::from(*value),
                Cell::U64(value) => i128::from(*value),
                Cell::Bool(value) => i128::from(*value),
                Cell::F64(value) if value.is_finite() && value.fract() == 0.0 => *value as i128,
                Cell::String(value) => value
                    .trim()
                    .parse::<i128>()
                    .map_err(|_| format!("'{value}' is not an integer"))?,
                other => return Err(format!("{other} cannot be converted to {ty}")),
            };

            let (min, max) = width.bounds(*unsigned);
            if value < min || value > max {
                return Err(format!("value {value} does not fit in {ty}"));
            }

            // The bounds check above guarantees both conversions succeed.
            if *unsigned {
                Ok(Cell::U64(value as u64))
            } else {
                Ok(Cell::I64(value as i64))
            }
        }
        ColumnType::Varchar(length) => {
            let text = to_text(cell)?;
            let chars = text.chars().count();
            if chars > *length as usize {
                return Err(format!(
                    "text of {chars} characters does not fit in varchar({length})"
                ));
            }

            Ok(Cell::String(text))
        }
        ColumnType::Text => Ok(Cell::String(to_text(cell)?)),
        ColumnType::Boolean => match cell {
            Cell::Bool(value) => Ok(Cell::Bool(value)),
            Cell::I64(0) | Cell::U64(0) => Ok(Cell::Bool(false)),
            Cell::I64(1) | Cell::U64(1) => Ok(Cell::Bool(true)),
            Cell::String(value) => match value.trim().to_lowercase().as_str() {
                "0" | "false" => Ok(Cell::Bool(false)),
                "1" | "true" => Ok(Cell::Bool(true)),
                _ => Err(format!("'{value}' is not a boolean")),
            },
            other => Err(format!("{other} cannot be converted to {ty}")),
        },
        ColumnType::Double => match cell {
            Cell::F64(value) => Ok(Cell::F64(value)),
            Cell::I64(value) => Ok(Cell::F64(value as f64)),
            Cell::U64(value) => Ok(Cell::F64(value as f64)),
            Cell::String(value) => value
                .trim()
                .parse::<f64>()
                .map(Cell::F64)
                .map_err(|_| format!("'{value}' is not a number")),
            other => Err(format!("{other} cannot be converted to {ty}")),
        },
        ColumnType::Timestamp => match cell {
            Cell::Timestamp(value) => Ok(Cell::Timestamp(value)),
            Cell::String(value) => NaiveDateTime::parse_from_str(value.trim(), TIMESTAMP_FORMAT)
                .map(|naive| Cell::Timestamp(naive.and_utc()))
                .map_err(|_| format!("'{value}' is not a timestamp")),
            other => Err(format!("{other} cannot be converted to {ty}")),
        },
    }
}

fn to_text(cell: Cell) -> Result<String, String> {
    let text = match cell {
        Cell::String(value) => value,
        Cell::I64(value) => value.to_string(),
        Cell::U64(value) => value.to_string(),
        Cell::F64(value) => value.to_string(),
        Cell::Bool(value) => if value { "1" } else { "0" }.to_owned(),
        Cell::Timestamp(value) => value.format(TIMESTAMP_FORMAT).to_string(),
        Cell::Null => return Err("NULL cannot be converted to text".to_owned()),
    };

    Ok(text)
}
