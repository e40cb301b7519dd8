use shift::concurrency::shutdown::ShutdownResult;
use shift::metrics::{SHIFT_CUTOVER_ATTEMPTS_TOTAL, SHIFT_MIGRATIONS_TOTAL, SHIFT_ROWS_COPIED_TOTAL};
use shift::state::MigrationStatus;
use shift::test_utils::cluster::{create_cluster, online_request, test_engine_config};
use shift::test_utils::workload::{alter_hint_statement, create_stress_table, init_table};
use shift_telemetry::metrics::init_metrics_handle;
use shift_telemetry::tracing::init_test_tracing;

#[tokio::test(flavor = "multi_thread")]
async fn migration_progress_is_exported_to_prometheus() {
    init_test_tracing();
    let handle = init_metrics_handle().unwrap();

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

    let rendered = handle.render();
    for metric in [
        SHIFT_MIGRATIONS_TOTAL,
        SHIFT_ROWS_COPIED_TOTAL,
        SHIFT_CUTOVER_ATTEMPTS_TOTAL,
    ] {
        assert!(rendered.contains(metric), "{metric} missing from:\n{rendered}");
    }

    cluster.service.shutdown().await.unwrap();
}
