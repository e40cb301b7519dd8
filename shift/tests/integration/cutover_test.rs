use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use shift::error::ErrorKind;
use shift::state::MigrationStatus;
use shift::storage::SchemaEngine;
use shift::test_utils::cluster::{TestCluster, create_cluster, online_request, test_engine_config};
use shift::test_utils::workload::{
    STRESS_TABLE, Workload, alter_hint_statement, check_table_metrics, create_stress_table,
    init_table,
};
use shift::types::{MigrationId, ShardId};
use shift_config::shared::EngineConfig;
use shift_telemetry::tracing::init_test_tracing;

use crate::migration_test::{assert_only_live_table, wait_for_terminal};

fn short_lock_timeout_config(max_attempts: u32, retry_delay_ms: u64) -> EngineConfig {
    let mut config = test_engine_config();
    config.cutover.lock_timeout_ms = 50;
    config.cutover.max_attempts = max_attempts;
    config.cutover.retry_delay_ms = retry_delay_ms;

    config
}

async fn wait_for_status(
    cluster: &TestCluster,
    id: MigrationId,
    shard: &ShardId,
    status: MigrationStatus,
) {
    let reached = cluster.store.notify_on_status(id, shard, status).await;
    tokio::time::timeout(Duration::from_secs(10), reached.notified())
        .await
        .unwrap_or_else(|_| panic!("migration did not reach {status}"));
}

/// Position of the first cutover attempt which went back to syncing.
fn first_returned_cutover(statuses: &[MigrationStatus]) -> Option<usize> {
    statuses.windows(2).position(|pair| {
        pair == [MigrationStatus::CuttingOver, MigrationStatus::Syncing]
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn fenced_writes_send_the_migration_back_to_syncing() {
    init_test_tracing();

    let cluster = create_cluster(&["0"], short_lock_timeout_config(5, 10)).unwrap();
    let shard = cluster.shard_ids().remove(0);
    let database = cluster.databases().next().unwrap().clone();
    create_stress_table(&database).await.unwrap();
    let metrics = init_table(&database).await.unwrap();

    // Another session holds the table, the first cutover attempt cannot fence writes.
    let fence = database
        .acquire_write_fence(STRESS_TABLE, Duration::from_secs(1))
        .await
        .unwrap();

    let id = cluster
        .service
        .submit(online_request(alter_hint_statement("x")))
        .await
        .unwrap();
    wait_for_status(&cluster, id, &shard, MigrationStatus::CuttingOver).await;
    wait_for_status(&cluster, id, &shard, MigrationStatus::Syncing).await;
    drop(fence);

    let view = wait_for_terminal(&cluster, id).await;
    assert_eq!(view.status, MigrationStatus::Complete);
    assert!(view.shards[0].progress.cutover_attempts >= 2);

    let statuses = cluster.observer.statuses(id, &shard);
    assert!(first_returned_cutover(&statuses).is_some(), "{statuses:?}");
    assert_eq!(statuses.last(), Some(&MigrationStatus::Complete));

    check_table_metrics(&database, &metrics).await.unwrap();
    let create_table = database.show_create_table(STRESS_TABLE).await.unwrap();
    assert!(create_table.contains("DEFAULT 'x'"), "{create_table}");
    assert_only_live_table(&database).await;

    cluster.service.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn cutover_fails_once_every_attempt_timed_out() {
    init_test_tracing();

    let cluster = create_cluster(&["0"], short_lock_timeout_config(3, 10)).unwrap();
    let shard = cluster.shard_ids().remove(0);
    let database = cluster.databases().next().unwrap().clone();
    create_stress_table(&database).await.unwrap();
    let metrics = init_table(&database).await.unwrap();

    let fence = database
        .acquire_write_fence(STRESS_TABLE, Duration::from_secs(1))
        .await
        .unwrap();

    let id = cluster
        .service
        .submit(online_request(alter_hint_statement("x")))
        .await
        .unwrap();

    let view = wait_for_terminal(&cluster, id).await;
    drop(fence);

    assert_eq!(view.status, MigrationStatus::Failed);
    assert_eq!(view.shards[0].progress.cutover_attempts, 3);
    let failures = view.failures();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].contains("CutoverFailed"), "{failures:?}");
    assert!(failures[0].contains("LockTimeout"), "{failures:?}");

    let statuses = cluster.observer.statuses(id, &shard);
    let returned = statuses
        .windows(2)
        .filter(|pair| *pair == [MigrationStatus::CuttingOver, MigrationStatus::Syncing])
        .count();
    assert_eq!(returned, 2, "{statuses:?}");
    assert_eq!(statuses.last(), Some(&MigrationStatus::Failed));

    // The live table is untouched and the shadow table is gone.
    check_table_metrics(&database, &metrics).await.unwrap();
    let create_table = database.show_create_table(STRESS_TABLE).await.unwrap();
    assert!(!create_table.contains("DEFAULT 'x'"), "{create_table}");
    assert_only_live_table(&database).await;

    cluster.service.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelling_a_syncing_migration_drops_the_shadow_table() {
    init_test_tracing();

    // A long retry delay keeps the migration in syncing after its first cutover attempt.
    let cluster = create_cluster(&["0"], short_lock_timeout_config(5, 60_000)).unwrap();
    let shard = cluster.shard_ids().remove(0);
    let database = cluster.databases().next().unwrap().clone();
    create_stress_table(&database).await.unwrap();
    let metrics = init_table(&database).await.unwrap();

    let fence = database
        .acquire_write_fence(STRESS_TABLE, Duration::from_secs(1))
        .await
        .unwrap();

    let id = cluster
        .service
        .submit(online_request(alter_hint_statement("x")))
        .await
        .unwrap();
    wait_for_status(&cluster, id, &shard, MigrationStatus::CuttingOver).await;
    wait_for_status(&cluster, id, &shard, MigrationStatus::Syncing).await;

    // The worker publishes its new status right after storing it.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match cluster.service.cancel(id).await {
                Ok(()) => break,
                Err(err) if err.kind() == ErrorKind::MigrationNotCancellable => {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Err(err) => panic!("unexpected error: {err}"),
            }
        }
    })
    .await
    .expect("migration did not become cancellable");

    let view = wait_for_terminal(&cluster, id).await;
    drop(fence);

    assert_eq!(view.status, MigrationStatus::Cancelled);
    let record = &view.shards[0];
    assert_eq!(record.message.as_deref(), Some("cancelled on request"));
    assert_eq!(record.progress.cutover_attempts, 1);

    let statuses = cluster.observer.statuses(id, &shard);
    assert_eq!(
        statuses.last_chunk::<3>(),
        Some(&[
            MigrationStatus::CuttingOver,
            MigrationStatus::Syncing,
            MigrationStatus::Cancelled,
        ])
    );

    check_table_metrics(&database, &metrics).await.unwrap();
    assert_only_live_table(&database).await;

    cluster.service.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn readers_always_find_the_live_table_during_cutover() {
    init_test_tracing();

    let cluster = create_cluster(&["0"], test_engine_config()).unwrap();
    let database = cluster.databases().next().unwrap().clone();
    create_stress_table(&database).await.unwrap();
    let mut metrics = init_table(&database).await.unwrap();
    let workload = Workload::start(&database, 2, Duration::from_millis(2));

    let done = Arc::new(AtomicBool::new(false));
    let reader = tokio::spawn({
        let database = database.clone();
        let done = done.clone();
        async move {
            let mut reads = 0u64;
            while !done.load(Ordering::SeqCst) {
                database.table_schema(STRESS_TABLE).await?.ok_or_else(|| {
                    format!("`{STRESS_TABLE}` was missing after {reads} reads")
                })?;
                reads += 1;
                tokio::task::yield_now().await;
            }

            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(reads)
        }
    });

    let id = cluster
        .service
        .submit(online_request(alter_hint_statement("x")))
        .await
        .unwrap();
    let view = wait_for_terminal(&cluster, id).await;
    assert_eq!(view.status, MigrationStatus::Complete);

    done.store(true, Ordering::SeqCst);
    let reads = reader.await.unwrap().unwrap();
    assert!(reads > 0);

    metrics.merge(&workload.stop().await.unwrap());
    check_table_metrics(&database, &metrics).await.unwrap();
    assert_only_live_table(&database).await;

    cluster.service.shutdown().await.unwrap();
}
