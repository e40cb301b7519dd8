use shift_config::shared::{
    CopyConfig, CutoverConfig, EngineConfig, RetryConfig, SyncConfig, ThrottleConfig,
};
use std::sync::Arc;

use crate::error::ShiftResult;
use crate::memory::MemoryDatabase;
use crate::service::MigrationService;
use crate::storage::StaticTopology;
use crate::test_utils::notify::NotifyingStore;
use crate::test_utils::observer::RecordingObserver;
use crate::types::{ShardId, SubmitRequest};

pub const TEST_KEYSPACE: &str = "test_keyspace";

/// Engine configuration with short intervals, suited to in-memory shards.
pub fn test_engine_config() -> EngineConfig {
    EngineConfig {
        max_concurrent_migrations: 2,
        copy: CopyConfig { chunk_size: 256 },
        sync: SyncConfig {
            batch_size: 256,
            batch_max_fill_ms: 5,
            convergence_bound: 200,
            convergence_dwell_ms: 20,
            check_interval_ms: 10,
            max_convergence_wait_ms: Some(30_000),
            feed_unavailable_timeout_ms: 5_000,
        },
        cutover: CutoverConfig {
            lock_timeout_ms: 1_000,
            drain_timeout_ms: 2_000,
            max_attempts: 5,
            retry_delay_ms: 10,
            drop_retired_table: true,
        },
        throttle: ThrottleConfig {
            enabled: false,
            threshold: 1.0,
            hysteresis: 0.2,
            sample_interval_ms: 10,
        },
        feed_retry: RetryConfig {
            max_attempts: 5,
            initial_delay_ms: 5,
            max_delay_ms: 50,
            backoff_factor: 2.0,
        },
    }
}

/// A service serving every shard of [`TEST_KEYSPACE`] from in-memory databases.
#[derive(Debug)]
pub struct TestCluster {
    pub service: MigrationService<NotifyingStore, MemoryDatabase>,
    pub store: NotifyingStore,
    pub observer: Arc<RecordingObserver>,
    pub shards: Vec<(ShardId, MemoryDatabase)>,
}

impl TestCluster {
    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.shards.iter().map(|(shard, _)| shard.clone()).collect()
    }

    pub fn databases(&self) -> impl Iterator<Item = &MemoryDatabase> {
        self.shards.iter().map(|(_, database)| database)
    }
}

/// Builds a [`TestCluster`] with one fresh [`MemoryDatabase`] per shard name.
pub fn create_cluster(shard_names: &[&str], config: EngineConfig) -> ShiftResult<TestCluster> {
    let databases = shard_names.iter().map(|_| MemoryDatabase::new()).collect();

    create_cluster_with(shard_names, databases, NotifyingStore::new(), config)
}

/// Builds a [`TestCluster`] over existing databases and store, e.g. to restart a cluster.
pub fn create_cluster_with(
    shard_names: &[&str],
    databases: Vec<MemoryDatabase>,
    store: NotifyingStore,
    config: EngineConfig,
) -> ShiftResult<TestCluster> {
    let shards: Vec<_> = shard_names
        .iter()
        .map(|name| ShardId::new(*name))
        .zip(databases)
        .collect();

    let topology = StaticTopology::new()
        .with_keyspace(TEST_KEYSPACE, shards.iter().map(|(shard, _)| shard.clone()));
    let observer = Arc::new(RecordingObserver::new());

    let mut service = MigrationService::with_observer(
        config,
        Arc::new(topology),
        store.clone(),
        observer.clone(),
    )?;
    for (shard, database) in &shards {
        service.add_shard(TEST_KEYSPACE, shard.clone(), database.clone())?;
    }

    Ok(TestCluster {
        service,
        store,
        observer,
        shards,
    })
}

pub fn online_request(alter_statement: impl Into<String>) -> SubmitRequest {
    let alter_statement = alter_statement.into();

    SubmitRequest {
        keyspace: TEST_KEYSPACE.to_owned(),
        table: String::new(),
        alter_statement,
        strategy: "online".to_owned(),
    }
}
