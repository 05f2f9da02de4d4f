use sync_server::config::MonitorSettings;
use sync_server::models::ConfigStatus;
use sync_server::store::{configs, stats, work_rows};
use sync_server::test_support::{TestDatabase, TestFixtures};
use sync_server::workers::monitor::CompletionMonitor;

#[tokio::test]
async fn premature_completion_is_reverted_then_closed_again() {
    let test_db = TestDatabase::new().await.expect("test database");
    let pool = test_db.pool_clone();
    let fixtures = TestFixtures::new(&pool);

    let config_id = fixtures.insert_config("completed").await.expect("config");
    sqlx::query(
        "UPDATE sync_configs SET sync_started_at = NOW(), sync_completed_at = NOW() WHERE id = $1",
    )
    .bind(config_id)
    .execute(&pool)
    .await
    .unwrap();

    // Two rows still pending while the configuration claims to be done.
    work_rows::upsert_queued(&pool, config_id, "T1", "grant-g").await.unwrap();
    work_rows::upsert_queued(&pool, config_id, "T2", "grant-g").await.unwrap();

    let monitor = CompletionMonitor::new(pool.clone(), MonitorSettings::from_env());

    assert_eq!(monitor.recover_premature().await.expect("recover"), 1);
    assert_eq!(
        configs::get_status(&pool, config_id).await.unwrap(),
        ConfigStatus::ThreadSync
    );
    let (completed_at,): (Option<chrono::DateTime<chrono::Utc>>,) =
        sqlx::query_as("SELECT sync_completed_at FROM sync_configs WHERE id = $1")
            .bind(config_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert!(completed_at.is_none());

    // Workers finish the remaining rows; the monitor closes the config again.
    work_rows::mark_completed(&pool, config_id, "T1", 2).await.unwrap();
    work_rows::mark_completed(&pool, config_id, "T2", 1).await.unwrap();

    assert_eq!(monitor.recompute_and_close().await.expect("close"), 1);
    assert_eq!(
        configs::get_status(&pool, config_id).await.unwrap(),
        ConfigStatus::Completed
    );

    // A second recovery pass has nothing to do.
    assert_eq!(monitor.recover_premature().await.expect("recover"), 0);

    test_db.close().await.expect("drop test database");
}

#[tokio::test]
async fn derived_counters_satisfy_the_counter_identity() {
    let test_db = TestDatabase::new().await.expect("test database");
    let pool = test_db.pool_clone();
    let fixtures = TestFixtures::new(&pool);

    let config_id = fixtures.insert_config("thread_sync").await.expect("config");

    work_rows::upsert_queued(&pool, config_id, "T1", "g").await.unwrap();
    work_rows::upsert_queued(&pool, config_id, "T2", "g").await.unwrap();
    work_rows::upsert_queued(&pool, config_id, "T3", "g").await.unwrap();
    work_rows::upsert_queued(&pool, config_id, "T4", "g").await.unwrap();
    work_rows::upsert_queued(&pool, config_id, "T5", "g").await.unwrap();

    work_rows::mark_completed(&pool, config_id, "T1", 3).await.unwrap();
    work_rows::mark_completed(&pool, config_id, "T2", 1).await.unwrap();
    work_rows::mark_failed(&pool, config_id, "T3", "boom").await.unwrap();
    assert!(work_rows::claim_processing(&pool, config_id, "T4").await.unwrap());
    // T5 stays queued.

    let monitor = CompletionMonitor::new(pool.clone(), MonitorSettings::from_env());
    // A configuration with pending rows must not close.
    assert_eq!(monitor.recompute_and_close().await.expect("pass"), 0);

    let row = stats::get(&pool, config_id).await.unwrap().expect("stats row");
    let status_queued = 1; // T5
    assert_eq!(
        row.threads_completed + row.threads_failed + status_queued + row.threads_processing,
        row.threads_queued,
        "counter identity holds at quiescence"
    );
    assert_eq!(row.threads_completed, 2);
    assert_eq!(row.threads_failed, 1);
    assert_eq!(row.threads_processing, 1);
    assert_eq!(row.messages_synced, 4);

    test_db.close().await.expect("drop test database");
}

#[tokio::test]
async fn backfill_configurations_are_never_closed_early() {
    let test_db = TestDatabase::new().await.expect("test database");
    let pool = test_db.pool_clone();
    let fixtures = TestFixtures::new(&pool);

    // All rows terminal, but pagination may still be running.
    let config_id = fixtures.insert_config("backfill").await.expect("config");
    work_rows::upsert_queued(&pool, config_id, "T1", "g").await.unwrap();
    work_rows::mark_completed(&pool, config_id, "T1", 1).await.unwrap();

    let monitor = CompletionMonitor::new(pool.clone(), MonitorSettings::from_env());
    assert_eq!(monitor.recompute_and_close().await.expect("pass"), 0);
    assert_eq!(
        configs::get_status(&pool, config_id).await.unwrap(),
        ConfigStatus::Backfill
    );

    test_db.close().await.expect("drop test database");
}
