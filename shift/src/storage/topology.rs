use std::collections::HashMap;

use crate::bail;
use crate::error::{ErrorKind, ShiftResult};
use crate::types::ShardId;

/// Enumerates the shards of a keyspace.
pub trait Topology: Send + Sync {
    fn shards(&self, keyspace: &str) -> ShiftResult<Vec<ShardId>>;
}

/// A [`Topology`] with a fixed list of shards per keyspace.
#[derive(Debug, Clone, Default)]
pub struct StaticTopology {
    keyspaces: HashMap<String, Vec<ShardId>>,
}

impl StaticTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keyspace(
        mut self,
        keyspace: impl Into<String>,
        shards: impl IntoIterator<Item = ShardId>,
    ) -> Self {
        let mut shards: Vec<_> = shards.into_iter().collect();
        shards.sort();
        shards.dedup();
        self.keyspaces.insert(keyspace.into(), shards);
        self
    }
}

impl Topology for StaticTopology {
    fn shards(&self, keyspace: &str) -> ShiftResult<Vec<ShardId>> {
        match self.keyspaces.get(keyspace) {
            Some(shards) if !shards.is_empty() => Ok(shards.clone()),
            _ => bail!(
                ErrorKind::ShardNotFound,
                "Keyspace has no shards",
                format!("keyspace '{keyspace}'")
            ),
        }
    }
}
