use std::time::Duration;

use shift::concurrency::shutdown::ShutdownResult;
use shift::error::ErrorKind;
use shift::memory::MemoryDatabase;
use shift::state::MigrationStatus;
use shift::status::MigrationStatusView;
use shift::test_utils::cluster::{
    TEST_KEYSPACE, TestCluster, create_cluster, create_cluster_with, online_request,
    test_engine_config,
};
use shift::test_utils::notify::NotifyingStore;
use shift::test_utils::workload::{
    MAX_CONCURRENCY, STRESS_TABLE, Workload, alter_hint_statement, check_table_metrics,
    create_stress_table, init_table,
};
use shift::storage::SchemaEngine;
use shift::types::{Cell, MigrationId, SubmitRequest};
use shift_telemetry::tracing::init_test_tracing;

pub async fn wait_for_terminal(cluster: &TestCluster, id: MigrationId) -> MigrationStatusView {
    let shutdown_rx = cluster.service.shutdown_tx().subscribe();
    let result = tokio::time::timeout(
        Duration::from_secs(60),
        cluster.service.wait_for_terminal(id, shutdown_rx),
    )
    .await
    .expect("migration did not end in time")
    .unwrap();

    match result {
        ShutdownResult::Ok(view) => view,
        ShutdownResult::Shutdown(()) => panic!("service shut down while waiting for migration"),
    }
}

pub async fn assert_only_live_table(database: &MemoryDatabase) {
    assert_eq!(database.table_names().await, vec![STRESS_TABLE.to_owned()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn migration_under_concurrent_writes_keeps_every_row() {
    init_test_tracing();

    let cluster = create_cluster(&["-80", "80-"], test_engine_config()).unwrap();

    let mut expected = Vec::new();
    let mut workloads = Vec::new();
    for database in cluster.databases() {
        create_stress_table(database).await.unwrap();
        expected.push(init_table(database).await.unwrap());
        workloads.push(Workload::start(
            database,
            MAX_CONCURRENCY,
            Duration::from_millis(2),
        ));
    }

    // Let the writers run for a while before the migration starts.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let id = cluster
        .service
        .submit(online_request(alter_hint_statement("x")))
        .await
        .unwrap();

    let view = wait_for_terminal(&cluster, id).await;
    assert_eq!(view.status, MigrationStatus::Complete);
    assert!(view.shards.iter().all(|shard| shard.status == MigrationStatus::Complete));

    for ((workload, metrics), database) in workloads
        .into_iter()
        .zip(expected.iter_mut())
        .zip(cluster.databases())
    {
        let workload_metrics = workload.stop().await.unwrap();
        metrics.merge(&workload_metrics);

        check_table_metrics(database, metrics).await.unwrap();

        let create_table = database.show_create_table(STRESS_TABLE).await.unwrap();
        assert!(create_table.contains("DEFAULT 'x'"), "{create_table}");
        assert_only_live_table(database).await;
    }

    for shard in cluster.shard_ids() {
        let statuses = cluster.observer.statuses(id, &shard);
        assert_eq!(statuses.first(), Some(&MigrationStatus::Queued));
        assert_eq!(statuses.last(), Some(&MigrationStatus::Complete));
        assert!(
            statuses
                .windows(2)
                .all(|pair| pair[0].can_transition_to(pair[1])),
            "{statuses:?}"
        );
    }

    cluster.service.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn migration_without_writes_walks_through_every_status() {
    init_test_tracing();

    let cluster = create_cluster(&["-40", "40-80", "80-c0", "c0-"], test_engine_config()).unwrap();
    for database in cluster.databases() {
        create_stress_table(database).await.unwrap();
        init_table(database).await.unwrap();
    }

    let id = cluster
        .service
        .submit(online_request(alter_hint_statement("y")))
        .await
        .unwrap();

    let view = wait_for_terminal(&cluster, id).await;
    assert_eq!(view.status, MigrationStatus::Complete);
    assert_eq!(view.shards.len(), 4);
    assert!(view.failures().is_empty());

    for shard in cluster.shard_ids() {
        assert_eq!(
            cluster.observer.statuses(id, &shard),
            vec![
                MigrationStatus::Queued,
                MigrationStatus::Ready,
                MigrationStatus::Copying,
                MigrationStatus::Syncing,
                MigrationStatus::CuttingOver,
                MigrationStatus::Complete,
            ]
        );
    }

    for database in cluster.databases() {
        let create_table = database.show_create_table(STRESS_TABLE).await.unwrap();
        assert!(create_table.contains("DEFAULT 'y'"), "{create_table}");
        assert_only_live_table(database).await;
    }

    let records = cluster.service.show(id).await.unwrap();
    assert_eq!(records.len(), 4);
    assert!(records.iter().all(|record| record.completed_at.is_some()));
    assert!(records.iter().all(|record| record.progress.rows_copied > 0));

    let recent = cluster
        .service
        .list_recent(TEST_KEYSPACE, 10)
        .await
        .unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].id, id);
    assert_eq!(recent[0].status, MigrationStatus::Complete);

    cluster.service.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn added_timestamp_column_gets_one_value_for_every_row() {
    init_test_tracing();

    let cluster = create_cluster(&["0"], test_engine_config()).unwrap();
    let database = cluster.databases().next().unwrap().clone();
    create_stress_table(&database).await.unwrap();
    init_table(&database).await.unwrap();

    let id = cluster
        .service
        .submit(online_request(
            "ALTER TABLE stress_test ADD COLUMN migrated_at timestamp NOT NULL DEFAULT CURRENT_TIMESTAMP",
        ))
        .await
        .unwrap();

    let view = wait_for_terminal(&cluster, id).await;
    assert_eq!(view.status, MigrationStatus::Complete);
    let default_timestamp = view.shards[0]
        .progress
        .default_timestamp
        .expect("the migration fixes its timestamp when planned");

    let schema = database.table_schema(STRESS_TABLE).await.unwrap().unwrap();
    let index = schema.column_index("migrated_at").unwrap();
    let rows = database.rows(STRESS_TABLE).await.unwrap();
    assert!(!rows.is_empty());
    for row in rows {
        assert_eq!(row.values[index], Cell::Timestamp(default_timestamp));
    }

    cluster.service.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn consecutive_migrations_of_the_same_table_both_complete() {
    init_test_tracing();

    let cluster = create_cluster(&["0"], test_engine_config()).unwrap();
    let database = cluster.databases().next().unwrap().clone();
    create_stress_table(&database).await.unwrap();
    let mut metrics = init_table(&database).await.unwrap();
    let workload = Workload::start(&database, 2, Duration::from_millis(2));

    let first = cluster
        .service
        .submit(online_request(alter_hint_statement("first")))
        .await
        .unwrap();
    let second = cluster
        .service
        .submit(online_request(alter_hint_statement("second")))
        .await
        .unwrap();

    assert_eq!(
        wait_for_terminal(&cluster, first).await.status,
        MigrationStatus::Complete
    );
    assert_eq!(
        wait_for_terminal(&cluster, second).await.status,
        MigrationStatus::Complete
    );

    metrics.merge(&workload.stop().await.unwrap());
    check_table_metrics(&database, &metrics).await.unwrap();

    // Migrations of one table run one after the other, the last one to complete wins.
    let first_completed = cluster.service.show(first).await.unwrap()[0].completed_at;
    let second_completed = cluster.service.show(second).await.unwrap()[0].completed_at;
    let last_hint = if first_completed < second_completed {
        "second"
    } else {
        "first"
    };
    let create_table = database.show_create_table(STRESS_TABLE).await.unwrap();
    assert!(
        create_table.contains(&format!("DEFAULT '{last_hint}'")),
        "{create_table}"
    );
    assert_only_live_table(&database).await;

    cluster.service.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn non_atomic_renames_complete_the_cutover() {
    init_test_tracing();

    let cluster = create_cluster_with(
        &["-80", "80-"],
        vec![
            MemoryDatabase::without_atomic_rename(),
            MemoryDatabase::without_atomic_rename(),
        ],
        NotifyingStore::new(),
        test_engine_config(),
    )
    .unwrap();

    let mut expected = Vec::new();
    let mut workloads = Vec::new();
    for database in cluster.databases() {
        create_stress_table(database).await.unwrap();
        expected.push(init_table(database).await.unwrap());
        workloads.push(Workload::start(database, 2, Duration::from_millis(2)));
    }

    let id = cluster
        .service
        .submit(online_request(alter_hint_statement("z")))
        .await
        .unwrap();
    assert_eq!(
        wait_for_terminal(&cluster, id).await.status,
        MigrationStatus::Complete
    );

    for ((workload, metrics), database) in workloads
        .into_iter()
        .zip(expected.iter_mut())
        .zip(cluster.databases())
    {
        metrics.merge(&workload.stop().await.unwrap());
        check_table_metrics(database, metrics).await.unwrap();
        assert_only_live_table(database).await;
    }

    cluster.service.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_feed_failures_are_retried() {
    init_test_tracing();

    let cluster = create_cluster(&["0"], test_engine_config()).unwrap();
    let database = cluster.databases().next().unwrap().clone();
    create_stress_table(&database).await.unwrap();
    init_table(&database).await.unwrap();
    database.inject_feed_failures(2);

    let id = cluster
        .service
        .submit(online_request(alter_hint_statement("x")))
        .await
        .unwrap();

    assert_eq!(
        wait_for_terminal(&cluster, id).await.status,
        MigrationStatus::Complete
    );
    assert_only_live_table(&database).await;

    cluster.service.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn unavailable_feed_fails_the_migration() {
    init_test_tracing();

    let cluster = create_cluster(&["0"], test_engine_config()).unwrap();
    let database = cluster.databases().next().unwrap().clone();
    create_stress_table(&database).await.unwrap();
    let metrics = init_table(&database).await.unwrap();
    database.inject_feed_failures(u32::MAX);

    let id = cluster
        .service
        .submit(online_request(alter_hint_statement("x")))
        .await
        .unwrap();

    let view = wait_for_terminal(&cluster, id).await;
    assert_eq!(view.status, MigrationStatus::Failed);

    let failures = view.failures();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].contains("Change feed is unavailable"), "{failures:?}");

    // The live table keeps its schema and rows.
    check_table_metrics(&database, &metrics).await.unwrap();
    let create_table = database.show_create_table(STRESS_TABLE).await.unwrap();
    assert!(!create_table.contains("DEFAULT 'x'"), "{create_table}");
    assert_only_live_table(&database).await;

    cluster.service.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn rows_which_do_not_fit_the_new_schema_fail_the_migration() {
    init_test_tracing();

    let cluster = create_cluster(&["-80", "80-"], test_engine_config()).unwrap();
    for database in cluster.databases() {
        create_stress_table(database).await.unwrap();
        init_table(database).await.unwrap();
    }

    // Every row holds an eight character `rand_val`.
    let id = cluster
        .service
        .submit(online_request(
            "ALTER TABLE stress_test modify rand_val varchar(4) null default ''",
        ))
        .await
        .unwrap();

    let view = wait_for_terminal(&cluster, id).await;
    assert_eq!(view.status, MigrationStatus::Failed);
    for record in &view.shards {
        assert_eq!(record.status, MigrationStatus::Failed);
        let message = record.message.as_deref().unwrap_or_default();
        assert!(message.contains("SchemaTranslationError"), "{message}");
    }

    for database in cluster.databases() {
        let create_table = database.show_create_table(STRESS_TABLE).await.unwrap();
        assert!(create_table.contains("varchar(32)"), "{create_table}");
        assert_only_live_table(database).await;
    }

    cluster.service.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_requests_are_rejected_without_a_record() {
    init_test_tracing();

    let cluster = create_cluster(&["-80", "80-"], test_engine_config()).unwrap();
    for database in cluster.databases() {
        create_stress_table(database).await.unwrap();
    }

    let direct = SubmitRequest {
        strategy: "direct".to_owned(),
        ..online_request(alter_hint_statement("x"))
    };
    let err = cluster.service.submit(direct).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);

    let unknown_strategy = SubmitRequest {
        strategy: "sideways".to_owned(),
        ..online_request(alter_hint_statement("x"))
    };
    let err = cluster.service.submit(unknown_strategy).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);

    let err = cluster
        .service
        .submit(online_request("ALTER stress_test add column"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);

    let err = cluster
        .service
        .submit(online_request("ALTER TABLE missing add column c int"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TableNotFound);

    let err = cluster
        .service
        .submit(online_request("ALTER TABLE stress_test drop column missing"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);

    let other_table = SubmitRequest {
        table: "other".to_owned(),
        ..online_request(alter_hint_statement("x"))
    };
    let err = cluster.service.submit(other_table).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);

    let unknown_keyspace = SubmitRequest {
        keyspace: "unknown".to_owned(),
        ..online_request(alter_hint_statement("x"))
    };
    let err = cluster.service.submit(unknown_keyspace).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ShardNotFound);

    assert!(
        cluster
            .service
            .list_recent(TEST_KEYSPACE, 10)
            .await
            .unwrap()
            .is_empty()
    );

    let err = cluster.service.status(MigrationId::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MigrationNotFound);

    cluster.service.shutdown().await.unwrap();
}
