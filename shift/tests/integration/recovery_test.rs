use std::time::Duration;

use shift::concurrency::shutdown::ShutdownResult;
use shift::memory::MemoryDatabase;
use shift::state::MigrationStatus;
use shift::store::MigrationStore;
use shift::test_utils::cluster::{
    TEST_KEYSPACE, TestCluster, create_cluster, create_cluster_with, online_request,
    test_engine_config,
};
use shift::test_utils::workload::{
    STRESS_TABLE, Workload, alter_hint_statement, check_table_metrics, create_stress_table,
    init_table,
};
use shift::types::MigrationId;
use shift_telemetry::tracing::init_test_tracing;

use crate::throttle_test::throttled_engine_config;

const SHARDS: [&str; 2] = ["-80", "80-"];

async fn wait_until_paused(cluster: &TestCluster) {
    for shard in cluster.shard_ids() {
        let executor = cluster.service.executor(TEST_KEYSPACE, &shard).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !executor.throttler().state().paused {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("throttler did not pause");
    }
}

async fn wait_until_copying(cluster: &TestCluster, id: MigrationId) {
    for shard in cluster.shard_ids() {
        cluster
            .store
            .notify_on_status(id, &shard, MigrationStatus::Copying)
            .await
            .notified()
            .await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn interrupted_migration_resumes_after_a_restart() {
    init_test_tracing();

    let cluster = create_cluster(&SHARDS, throttled_engine_config()).unwrap();
    let mut expected = Vec::new();
    for database in cluster.databases() {
        create_stress_table(database).await.unwrap();
        expected.push(init_table(database).await.unwrap());
        database.set_lag_estimate(5.0);
    }
    wait_until_paused(&cluster).await;

    let id = cluster
        .service
        .submit(online_request(alter_hint_statement("x")))
        .await
        .unwrap();
    wait_until_copying(&cluster, id).await;

    let databases: Vec<MemoryDatabase> = cluster.databases().cloned().collect();
    let store = cluster.store.clone();
    cluster.service.shutdown().await.unwrap();

    // Shutting down keeps the status so the migration can be picked up again.
    let records = store.get_records(id).await.unwrap();
    assert!(records.iter().all(|record| record.status == MigrationStatus::Copying));

    // Writes keep coming while the engine is down and after it restarts.
    let mut workloads = Vec::new();
    for database in &databases {
        database.set_lag_estimate(0.0);
        workloads.push(Workload::start(database, 2, Duration::from_millis(2)));
    }

    let restarted = create_cluster_with(&SHARDS, databases.clone(), store, test_engine_config())
        .unwrap();
    assert_eq!(restarted.service.recover().await.unwrap(), SHARDS.len());

    let shutdown_rx = restarted.service.shutdown_tx().subscribe();
    let ShutdownResult::Ok(view) = restarted
        .service
        .wait_for_terminal(id, shutdown_rx)
        .await
        .unwrap()
    else {
        panic!("service shut down while waiting for migration");
    };
    assert_eq!(view.status, MigrationStatus::Complete);

    for ((workload, metrics), database) in workloads
        .into_iter()
        .zip(expected.iter_mut())
        .zip(&databases)
    {
        metrics.merge(&workload.stop().await.unwrap());
        check_table_metrics(database, metrics).await.unwrap();

        let create_table = database.show_create_table(STRESS_TABLE).await.unwrap();
        assert!(create_table.contains("DEFAULT 'x'"), "{create_table}");
        assert_eq!(database.table_names().await, vec![STRESS_TABLE.to_owned()]);
    }

    // Nothing is left to recover.
    assert_eq!(restarted.service.recover().await.unwrap(), 0);

    restarted.service.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn recovery_without_unfinished_migrations_starts_nothing() {
    init_test_tracing();

    let cluster = create_cluster(&SHARDS, test_engine_config()).unwrap();
    for database in cluster.databases() {
        create_stress_table(database).await.unwrap();
        init_table(database).await.unwrap();
    }

    assert_eq!(cluster.service.recover().await.unwrap(), 0);

    let id = cluster
        .service
        .submit(online_request(alter_hint_statement("x")))
        .await
        .unwrap();
    let shutdown_rx = cluster.service.shutdown_tx().subscribe();
    let result = cluster
        .service
        .wait_for_terminal(id, shutdown_rx)
        .await
        .unwrap();
    assert!(!result.should_shutdown());

    assert_eq!(cluster.service.recover().await.unwrap(), 0);

    cluster.service.shutdown().await.unwrap();
}
