use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::bail;
use crate::error::{ErrorKind, ShiftError, ShiftResult};

/// Prefix of every table name owned by the engine.
const ENGINE_TABLE_PREFIX: &str = "_shift";

/// Globally unique identifier of a migration, shared by all of its shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MigrationId(Uuid);

impl MigrationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn into_inner(self) -> Uuid {
        self.0
    }

    /// Name of the table receiving the new schema while the migration runs.
    pub fn shadow_table_name(&self) -> String {
        format!("{ENGINE_TABLE_PREFIX}_{}_shd", self.0.simple())
    }

    /// Name the live table is moved to during the first step of the cutover.
    pub fn retired_table_name(&self) -> String {
        format!("{ENGINE_TABLE_PREFIX}_{}_old", self.0.simple())
    }

    /// Name the retired table ends up with once the cutover is complete.
    pub fn drop_pending_table_name(&self) -> String {
        format!("{ENGINE_TABLE_PREFIX}_{}_del", self.0.simple())
    }
}

impl Default for MigrationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for MigrationId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for MigrationId {
    type Err = ShiftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match Uuid::parse_str(s) {
            Ok(uuid) => Ok(Self(uuid)),
            Err(err) => bail!(
                ErrorKind::ValidationError,
                "Invalid migration id",
                format!("'{s}': {err}")
            ),
        }
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a shard of a keyspace, e.g. `-80` or `80-`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId(String);

impl ShardId {
    pub fn new(shard: impl Into<String>) -> Self {
        Self(shard.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a schema change is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DdlStrategy {
    /// Blocking execution of the statement against the live table.
    Direct,
    /// Shadow table copy, change replay and atomic cutover.
    Online,
}

impl DdlStrategy {
    /// Parses a strategy string such as `online` or `online --allow-zero-in-date`.
    ///
    /// The first word names the strategy, an empty string meaning [`DdlStrategy::Direct`].
    /// Remaining words must be flags starting with `-` and are kept verbatim.
    pub fn parse(value: &str) -> ShiftResult<(DdlStrategy, MigrationOptions)> {
        let mut words = value.split_whitespace();

        let strategy = match words.next() {
            None => DdlStrategy::Direct,
            Some(word) => word.parse()?,
        };

        let mut flags = Vec::new();
        for word in words {
            if !word.starts_with('-') || word.trim_start_matches('-').is_empty() {
                bail!(
                    ErrorKind::ValidationError,
                    "Invalid DDL strategy flag",
                    format!("'{word}' in '{value}' is not a flag")
                );
            }
            flags.push(word.to_owned());
        }

        Ok((strategy, MigrationOptions(flags)))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DdlStrategy::Direct => "direct",
            DdlStrategy::Online => "online",
        }
    }
}

impl FromStr for DdlStrategy {
    type Err = ShiftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "" | "direct" => Ok(DdlStrategy::Direct),
            "online" => Ok(DdlStrategy::Online),
            other => bail!(
                ErrorKind::ValidationError,
                "Unknown DDL strategy",
                format!("'{other}', expected 'online' or 'direct'")
            ),
        }
    }
}

impl fmt::Display for DdlStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flags given along with the strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationOptions(pub Vec<String>);

impl MigrationOptions {
    /// Returns `true` if `flag` was given, with or without a value.
    pub fn has_flag(&self, flag: &str) -> bool {
        let flag = flag.trim_start_matches('-');
        self.0.iter().any(|given| {
            let given = given.trim_start_matches('-');
            given == flag || given.split_once('=').is_some_and(|(name, _)| name == flag)
        })
    }
}

impl fmt::Display for MigrationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

impl FromStr for MigrationOptions {
    type Err = ShiftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.split_whitespace().map(str::to_owned).collect()))
    }
}

/// A schema change as submitted by an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    pub keyspace: String,
    pub table: String,
    pub alter_statement: String,
    /// Strategy with optional flags, e.g. `online`.
    pub strategy: String,
}

/// An accepted migration request, immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRequest {
    pub id: MigrationId,
    pub keyspace: String,
    pub table: String,
    pub alter_statement: String,
    pub strategy: DdlStrategy,
    pub options: MigrationOptions,
    pub requested_at: DateTime<Utc>,
}
