use fail::FailScenario;
use shift::concurrency::shutdown::ShutdownResult;
use shift::error::ErrorKind;
use shift::failpoints::{COPY_AFTER_CHUNK, CUTOVER_AFTER_RENAME_STEP, CUTOVER_BEFORE_RENAME};
use shift::memory::MemoryDatabase;
use shift::state::MigrationStatus;
use shift::status::MigrationStatusView;
use shift::store::MigrationStore;
use shift::test_utils::cluster::{
    TestCluster, create_cluster, create_cluster_with, online_request, test_engine_config,
};
use shift::test_utils::notify::NotifyingStore;
use shift::test_utils::workload::{
    STRESS_TABLE, alter_hint_statement, check_table_metrics, create_stress_table, init_table,
};
use shift::types::MigrationId;
use shift_telemetry::tracing::init_test_tracing;

async fn wait_for_terminal(cluster: &TestCluster, id: MigrationId) -> MigrationStatusView {
    let shutdown_rx = cluster.service.shutdown_tx().subscribe();
    let ShutdownResult::Ok(view) = cluster
        .service
        .wait_for_terminal(id, shutdown_rx)
        .await
        .unwrap()
    else {
        panic!("service shut down while waiting for migration");
    };

    view
}

#[tokio::test(flavor = "multi_thread")]
async fn failure_during_copy_fails_the_migration_and_drops_the_shadow_table() {
    let _scenario = FailScenario::setup();
    fail::cfg(COPY_AFTER_CHUNK, "return").unwrap();

    init_test_tracing();

    let cluster = create_cluster(&["-80", "80-"], test_engine_config()).unwrap();
    let mut expected = Vec::new();
    for database in cluster.databases() {
        create_stress_table(database).await.unwrap();
        expected.push(init_table(database).await.unwrap());
    }

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
    assert_eq!(view.status, MigrationStatus::Failed);

    let failures = view.failures();
    assert_eq!(failures.len(), 2);
    for failure in &failures {
        assert!(failure.contains("FailpointTriggered"), "{failure}");
    }

    // A single chunk was copied before the failure.
    for record in &view.shards {
        assert_eq!(record.progress.rows_copied, 256);
    }

    for (database, metrics) in cluster.databases().zip(&expected) {
        assert_eq!(database.table_names().await, vec![STRESS_TABLE.to_owned()]);
        check_table_metrics(database, metrics).await.unwrap();
    }

    cluster.service.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn panic_between_renames_is_resumed_after_a_restart() {
    let _scenario = FailScenario::setup();
    fail::cfg(CUTOVER_AFTER_RENAME_STEP, "1*panic").unwrap();

    init_test_tracing();

    let database = MemoryDatabase::without_atomic_rename();
    let store = NotifyingStore::new();
    let cluster = create_cluster_with(
        &["0"],
        vec![database.clone()],
        store.clone(),
        test_engine_config(),
    )
    .unwrap();
    let shard = cluster.shard_ids().remove(0);

    create_stress_table(&database).await.unwrap();
    let metrics = init_table(&database).await.unwrap();

    let id = cluster
        .service
        .submit(online_request(alter_hint_statement("x")))
        .await
        .unwrap();

    // The worker dies right after retiring the live table.
    let shutdown_rx = cluster.service.shutdown_tx().subscribe();
    let err = cluster
        .service
        .wait_for_terminal(id, shutdown_rx)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let err = cluster.service.shutdown().await.unwrap_err();
    assert!(err.kinds().contains(&ErrorKind::WorkerPanic), "{err}");

    let record = store.get_record(id, &shard).await.unwrap().unwrap();
    assert_eq!(record.status, MigrationStatus::CuttingOver);
    assert!(!database.table_names().await.contains(&STRESS_TABLE.to_owned()));

    let restarted = create_cluster_with(
        &["0"],
        vec![database.clone()],
        store.clone(),
        test_engine_config(),
    )
    .unwrap();
    assert_eq!(restarted.service.recover().await.unwrap(), 1);

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
    assert!(view.shards[0].progress.cutover_attempts >= 2);

    assert_eq!(database.table_names().await, vec![STRESS_TABLE.to_owned()]);
    check_table_metrics(&database, &metrics).await.unwrap();
    let create_table = database.show_create_table(STRESS_TABLE).await.unwrap();
    assert!(create_table.contains("DEFAULT 'x'"), "{create_table}");

    restarted.service.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn failure_before_the_renames_drops_the_shadow_table() {
    let _scenario = FailScenario::setup();
    fail::cfg(CUTOVER_BEFORE_RENAME, "return").unwrap();

    init_test_tracing();

    let cluster = create_cluster(&["0"], test_engine_config()).unwrap();
    let database = cluster.databases().next().unwrap().clone();
    create_stress_table(&database).await.unwrap();
    let metrics = init_table(&database).await.unwrap();

    let id = cluster
        .service
        .submit(online_request(alter_hint_statement("x")))
        .await
        .unwrap();

    let view = wait_for_terminal(&cluster, id).await;
    assert_eq!(view.status, MigrationStatus::Failed);
    assert_eq!(view.shards[0].progress.cutover_attempts, 1);
    let failures = view.failures();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].contains("FailpointTriggered"), "{failures:?}");

    assert_eq!(database.table_names().await, vec![STRESS_TABLE.to_owned()]);
    check_table_metrics(&database, &metrics).await.unwrap();
    let create_table = database.show_create_table(STRESS_TABLE).await.unwrap();
    assert!(!create_table.contains("DEFAULT 'x'"), "{create_table}");

    cluster.service.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_rename_step_is_resumed_by_the_same_worker() {
    let _scenario = FailScenario::setup();
    fail::cfg(CUTOVER_AFTER_RENAME_STEP, "1*return").unwrap();

    init_test_tracing();

    let database = MemoryDatabase::without_atomic_rename();
    let cluster = create_cluster_with(
        &["0"],
        vec![database.clone()],
        NotifyingStore::new(),
        test_engine_config(),
    )
    .unwrap();
    let shard = cluster.shard_ids().remove(0);
    create_stress_table(&database).await.unwrap();
    let metrics = init_table(&database).await.unwrap();

    let id = cluster
        .service
        .submit(online_request(alter_hint_statement("x")))
        .await
        .unwrap();

    let view = wait_for_terminal(&cluster, id).await;
    assert_eq!(view.status, MigrationStatus::Complete);
    assert_eq!(view.shards[0].progress.cutover_attempts, 2);

    // The migration never left the cutover once the live table was retired.
    let statuses = cluster.observer.statuses(id, &shard);
    assert_eq!(
        statuses.last_chunk::<2>(),
        Some(&[MigrationStatus::CuttingOver, MigrationStatus::Complete])
    );

    assert_eq!(database.table_names().await, vec![STRESS_TABLE.to_owned()]);
    check_table_metrics(&database, &metrics).await.unwrap();
    let create_table = database.show_create_table(STRESS_TABLE).await.unwrap();
    assert!(create_table.contains("DEFAULT 'x'"), "{create_table}");

    cluster.service.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn every_rename_step_failing_still_completes_the_cutover() {
    let _scenario = FailScenario::setup();
    fail::cfg(CUTOVER_AFTER_RENAME_STEP, "return").unwrap();

    init_test_tracing();

    let database = MemoryDatabase::without_atomic_rename();
    let cluster = create_cluster_with(
        &["0"],
        vec![database.clone()],
        NotifyingStore::new(),
        test_engine_config(),
    )
    .unwrap();
    create_stress_table(&database).await.unwrap();
    let metrics = init_table(&database).await.unwrap();

    let id = cluster
        .service
        .submit(online_request(alter_hint_statement("x")))
        .await
        .unwrap();

    // Each attempt gets one rename further, the fourth one finds every rename done.
    let view = wait_for_terminal(&cluster, id).await;
    assert_eq!(view.status, MigrationStatus::Complete);
    assert_eq!(view.shards[0].progress.cutover_attempts, 4);

    assert_eq!(database.table_names().await, vec![STRESS_TABLE.to_owned()]);
    check_table_metrics(&database, &metrics).await.unwrap();

    cluster.service.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_rename_retries_leave_the_migration_resumable() {
    let _scenario = FailScenario::setup();
    fail::cfg(CUTOVER_AFTER_RENAME_STEP, "return").unwrap();

    init_test_tracing();

    let mut config = test_engine_config();
    config.cutover.max_attempts = 2;
    let database = MemoryDatabase::without_atomic_rename();
    let store = NotifyingStore::new();
    let cluster =
        create_cluster_with(&["0"], vec![database.clone()], store.clone(), config).unwrap();
    let shard = cluster.shard_ids().remove(0);
    create_stress_table(&database).await.unwrap();
    let metrics = init_table(&database).await.unwrap();

    let id = cluster
        .service
        .submit(online_request(alter_hint_statement("x")))
        .await
        .unwrap();

    let shutdown_rx = cluster.service.shutdown_tx().subscribe();
    let err = cluster
        .service
        .wait_for_terminal(id, shutdown_rx)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let err = cluster.service.shutdown().await.unwrap_err();
    assert!(err.kinds().contains(&ErrorKind::CutoverFailed), "{err}");

    // The second attempt published the shadow table before failing.
    let record = store.get_record(id, &shard).await.unwrap().unwrap();
    assert_eq!(record.status, MigrationStatus::CuttingOver);
    assert_eq!(record.progress.cutover_attempts, 2);
    let create_table = database.show_create_table(STRESS_TABLE).await.unwrap();
    assert!(create_table.contains("DEFAULT 'x'"), "{create_table}");

    fail::remove(CUTOVER_AFTER_RENAME_STEP);
    let restarted = create_cluster_with(
        &["0"],
        vec![database.clone()],
        store.clone(),
        test_engine_config(),
    )
    .unwrap();
    assert_eq!(restarted.service.recover().await.unwrap(), 1);

    let view = wait_for_terminal(&restarted, id).await;
    assert_eq!(view.status, MigrationStatus::Complete);
    assert_eq!(view.shards[0].progress.cutover_attempts, 3);

    assert_eq!(database.table_names().await, vec![STRESS_TABLE.to_owned()]);
    check_table_metrics(&database, &metrics).await.unwrap();

    restarted.service.shutdown().await.unwrap();
}
