use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::bail;
use crate::error::{ErrorKind, ShiftError, ShiftResult};

/// A single value of a table row.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    I64(i64),
    U64(u64),
    F64(f64),
    String(String),
    Timestamp(DateTime<Utc>),
}

impl Cell {
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    /// Returns the value as an unsigned integer when it is a non-negative integer.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Cell::U64(value) => Some(*value),
            Cell::I64(value) => u64::try_from(*value).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Cell::String(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Null => f.write_str("NULL"),
            Cell::Bool(value) => write!(f, "{value}"),
            Cell::I64(value) => write!(f, "{value}"),
            Cell::U64(value) => write!(f, "{value}"),
            Cell::F64(value) => write!(f, "{value}"),
            Cell::String(value) => write!(f, "'{value}'"),
            Cell::Timestamp(value) => write!(f, "'{}'", value.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}

/// A row of a table with one [`Cell`] per column, in column order.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    pub values: Vec<Cell>,
}

impl TableRow {
    pub fn new(values: Vec<Cell>) -> Self {
        Self { values }
    }
}

/// A single primary key column value.
///
/// Only integer and string columns can be part of a primary key, which keeps keys totally
/// ordered.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyCell {
    I64(i64),
    U64(u64),
    String(String),
}

impl TryFrom<&Cell> for KeyCell {
    type Error = ShiftError;

    fn try_from(cell: &Cell) -> Result<Self, Self::Error> {
        match cell {
            Cell::I64(value) => Ok(KeyCell::I64(*value)),
            Cell::U64(value) => Ok(KeyCell::U64(*value)),
            Cell::String(value) => Ok(KeyCell::String(value.clone())),
            other => bail!(
                ErrorKind::ValidationError,
                "Primary key value is not an integer or a string",
                format!("got {other}")
            ),
        }
    }
}

impl From<&KeyCell> for Cell {
    fn from(key: &KeyCell) -> Self {
        match key {
            KeyCell::I64(value) => Cell::I64(*value),
            KeyCell::U64(value) => Cell::U64(*value),
            KeyCell::String(value) => Cell::String(value.clone()),
        }
    }
}

/// The primary key of a row, ordered column by column.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PrimaryKey(pub Vec<KeyCell>);

impl PrimaryKey {
    /// Builds the key of `row` from the cells at `key_indices`.
    pub fn from_row(row: &TableRow, key_indices: &[usize]) -> ShiftResult<Self> {
        let mut key = Vec::with_capacity(key_indices.len());
        for &index in key_indices {
            let Some(cell) = row.values.get(index) else {
                bail!(
                    ErrorKind::InvalidState,
                    "Row is shorter than its primary key",
                    format!("missing column at index {index}")
                );
            };
            key.push(KeyCell::try_from(cell)?);
        }

        Ok(Self(key))
    }
}

impl From<u64> for PrimaryKey {
    fn from(value: u64) -> Self {
        Self(vec![KeyCell::U64(value)])
    }
}

impl From<i64> for PrimaryKey {
    fn from(value: i64) -> Self {
        Self(vec![KeyCell::I64(value)])
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, cell) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match cell {
                KeyCell::I64(value) => write!(f, "{value}")?,
                KeyCell::U64(value) => write!(f, "{value}")?,
                KeyCell::String(value) => write!(f, "'{value}'")?,
            }
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_built_from_key_columns() {
        let row = TableRow::new(vec![
            Cell::String("a".to_owned()),
            Cell::I64(7),
            Cell::Null,
        ]);

        let key = PrimaryKey::from_row(&row, &[1, 0]).unwrap();

        assert_eq!(
            key,
            PrimaryKey(vec![KeyCell::I64(7), KeyCell::String("a".to_owned())])
        );
        assert_eq!(key.to_string(), "(7, 'a')");
    }

    #[test]
    fn null_cannot_be_part_of_a_key() {
        let row = TableRow::new(vec![Cell::Null]);

        let err = PrimaryKey::from_row(&row, &[0]).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }

    #[test]
    fn keys_survive_persistence() {
        let key = PrimaryKey::from(42u64);

        let json = serde_json::to_string(&key).unwrap();
        let restored: PrimaryKey = serde_json::from_str(&json).unwrap();

        assert_eq!(restored, key);
    }
}
