use std::time::Duration;

use shift::concurrency::shutdown::ShutdownResult;
use shift::state::MigrationStatus;
use shift::test_utils::cluster::{TEST_KEYSPACE, create_cluster, online_request, test_engine_config};
use shift::test_utils::workload::{
    STRESS_TABLE, alter_hint_statement, check_table_metrics, create_stress_table, init_table,
};
use shift_config::shared::EngineConfig;
use shift_telemetry::tracing::init_test_tracing;

pub fn throttled_engine_config() -> EngineConfig {
    let mut config = test_engine_config();
    config.throttle.enabled = true;
    config.throttle.threshold = 1.0;

    config
}

#[tokio::test(flavor = "multi_thread")]
async fn lagging_shard_holds_the_copy_until_the_lag_recovers() {
    init_test_tracing();

    let cluster = create_cluster(&["0"], throttled_engine_config()).unwrap();
    let shard = cluster.shard_ids().remove(0);
    let database = cluster.databases().next().unwrap().clone();
    create_stress_table(&database).await.unwrap();
    let metrics = init_table(&database).await.unwrap();

    database.set_lag_estimate(5.0);
    let throttler = cluster
        .service
        .executor(TEST_KEYSPACE, &shard)
        .unwrap()
        .throttler()
        .clone();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !throttler.state().paused {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("throttler did not pause");
    assert_eq!(throttler.state().current_lag_estimate, 5.0);

    let id = cluster
        .service
        .submit(online_request(alter_hint_statement("x")))
        .await
        .unwrap();

    let copying = cluster
        .store
        .notify_on_status(id, &shard, MigrationStatus::Copying)
        .await;
    copying.notified().await;

    // Several sampling intervals go by without a single chunk being copied.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let records = cluster.service.show(id).await.unwrap();
    assert_eq!(records[0].status, MigrationStatus::Copying);
    assert_eq!(records[0].progress.rows_copied, 0);

    database.set_lag_estimate(0.0);

    let shutdown_rx = cluster.service.shutdown_tx().subscribe();
    let result = cluster
        .service
        .wait_for_terminal(id, shutdown_rx)
        .await
        .unwrap();
    let ShutdownResult::Ok(view) = result else {
        panic!("service shut down while waiting for migration");
    };
    assert_eq!(view.status, MigrationStatus::Complete);
    assert!(!throttler.state().paused);

    check_table_metrics(&database, &metrics).await.unwrap();
    let create_table = database.show_create_table(STRESS_TABLE).await.unwrap();
    assert!(create_table.contains("DEFAULT 'x'"), "{create_table}");

    cluster.service.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn lag_hovering_around_the_threshold_keeps_the_throttler_paused() {
    init_test_tracing();

    let cluster = create_cluster(&["0"], throttled_engine_config()).unwrap();
    let shard = cluster.shard_ids().remove(0);
    let database = cluster.databases().next().unwrap().clone();
    let throttler = cluster
        .service
        .executor(TEST_KEYSPACE, &shard)
        .unwrap()
        .throttler()
        .clone();

    database.set_lag_estimate(1.5);
    tokio::time::timeout(Duration::from_secs(5), async {
        while !throttler.state().paused {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("throttler did not pause");

    // Below the threshold but above the resume threshold.
    database.set_lag_estimate(0.9);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let state = throttler.state();
    assert!(state.paused);
    assert_eq!(state.current_lag_estimate, 0.9);

    database.set_lag_estimate(0.5);
    tokio::time::timeout(Duration::from_secs(5), async {
        while throttler.state().paused {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("throttler did not resume");

    cluster.service.shutdown().await.unwrap();
}
