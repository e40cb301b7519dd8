use std::time::Duration;

use shift::concurrency::shutdown::ShutdownResult;
use shift::error::ErrorKind;
use shift::state::MigrationStatus;
use shift::test_utils::cluster::{
    TEST_KEYSPACE, create_cluster, online_request, test_engine_config,
};
use shift::test_utils::workload::{
    STRESS_TABLE, alter_hint_statement, check_table_metrics, create_stress_table, init_table,
};
use shift::types::MigrationId;
use shift_telemetry::tracing::init_test_tracing;

use crate::throttle_test::throttled_engine_config;

#[tokio::test(flavor = "multi_thread")]
async fn cancelling_a_copying_migration_drops_the_shadow_table() {
    init_test_tracing();

    let cluster = create_cluster(&["-80", "80-"], throttled_engine_config()).unwrap();
    let mut expected = Vec::new();
    for database in cluster.databases() {
        create_stress_table(database).await.unwrap();
        expected.push(init_table(database).await.unwrap());
        // Holds every migration in the copy phase.
        database.set_lag_estimate(5.0);
    }
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

    let id = cluster
        .service
        .submit(online_request(alter_hint_statement("x")))
        .await
        .unwrap();
    for shard in cluster.shard_ids() {
        cluster
            .store
            .notify_on_status(id, &shard, MigrationStatus::Copying)
            .await
            .notified()
            .await;
    }

    cluster.service.cancel(id).await.unwrap();

    let shutdown_rx = cluster.service.shutdown_tx().subscribe();
    let ShutdownResult::Ok(view) = cluster
        .service
        .wait_for_terminal(id, shutdown_rx)
        .await
        .unwrap()
    else {
        panic!("service shut down while waiting for migration");
    };
    assert_eq!(view.status, MigrationStatus::Cancelled);
    for record in &view.shards {
        assert_eq!(record.status, MigrationStatus::Cancelled);
        assert_eq!(record.message.as_deref(), Some("cancelled on request"));
        assert!(record.completed_at.is_some());
    }

    for (database, metrics) in cluster.databases().zip(&expected) {
        assert_eq!(database.table_names().await, vec![STRESS_TABLE.to_owned()]);
        check_table_metrics(database, metrics).await.unwrap();
    }

    // A terminal migration can no longer be cancelled.
    let err = cluster.service.cancel(id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MigrationNotCancellable);

    cluster.service.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn completed_migrations_cannot_be_cancelled() {
    init_test_tracing();

    let cluster = create_cluster(&["0"], test_engine_config()).unwrap();
    let database = cluster.databases().next().unwrap().clone();
    create_stress_table(&database).await.unwrap();
    init_table(&database).await.unwrap();

    let id = cluster
        .service
        .submit(online_request(alter_hint_statement("x")))
        .await
        .unwrap();
    let shutdown_rx = cluster.service.shutdown_tx().subscribe();
    let ShutdownResult::Ok(view) = cluster
        .service
        .wait_for_terminal(id, shutdown_rx)
        .await
        .unwrap()
    else {
        panic!("service shut down while waiting for migration");
    };
    assert_eq!(view.status, MigrationStatus::Complete);

    let err = cluster.service.cancel(id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MigrationNotCancellable);

    let err = cluster.service.cancel(MigrationId::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MigrationNotFound);

    // The migration stays complete.
    let view = cluster.service.status(id).await.unwrap();
    assert_eq!(view.status, MigrationStatus::Complete);

    cluster.service.shutdown().await.unwrap();
}
