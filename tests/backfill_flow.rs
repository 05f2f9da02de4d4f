use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use sync_server::config::{BackfillSettings, ThreadSyncSettings};
use sync_server::payloads::BackfillJob;
use sync_server::provider::{Participant, ProviderMessage, ProviderThread};
use sync_server::queue::{JobQueue, INBOX_BACKFILL_JOBS, THREAD_SYNC_JOBS};
use sync_server::store::{configs, stats, work_rows};
use sync_server::test_support::{FakeProvider, TestDatabase, TestFixtures};
use sync_server::workers::backfill::BackfillOrchestrator;
use sync_server::workers::thread_sync::ThreadSyncWorker;

// Mid-window timestamp for a 2024-01-01 .. 2024-01-02 backfill.
const IN_WINDOW_TS: i64 = 1_704_100_000;

fn thread(id: &str, subject: &str) -> ProviderThread {
    ProviderThread {
        id: id.to_string(),
        subject: Some(subject.to_string()),
        participants: vec![Participant {
            name: Some("Alice".to_string()),
            email: "alice@example.com".to_string(),
        }],
        latest_ts: IN_WINDOW_TS,
        unread: true,
        starred: false,
    }
}

fn message(id: &str, thread_id: &str, body: &str) -> ProviderMessage {
    ProviderMessage {
        id: id.to_string(),
        thread_id: thread_id.to_string(),
        subject: Some("subject".to_string()),
        snippet: Some(body.chars().take(32).collect()),
        body: Some(body.to_string()),
        from_addrs: vec![Participant {
            name: None,
            email: "alice@example.com".to_string(),
        }],
        to_addrs: vec![],
        date: IN_WINDOW_TS,
    }
}

fn fast_thread_sync_settings() -> ThreadSyncSettings {
    let mut settings = ThreadSyncSettings::from_env();
    settings.thread_delay = Duration::ZERO;
    settings.message_delay = Duration::ZERO;
    settings
}

fn backfill_job(config_id: uuid::Uuid, inbox_id: uuid::Uuid, grant: &str) -> BackfillJob {
    BackfillJob {
        inbox_id,
        config_id,
        grant_id: grant.to_string(),
        start_date: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        end_date: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
    }
}

#[tokio::test]
async fn fresh_backfill_syncs_two_threads_and_three_messages() {
    let test_db = TestDatabase::new().await.expect("test database");
    let pool = test_db.pool_clone();
    let fixtures = TestFixtures::new(&pool);

    let config_id = fixtures.insert_config("idle").await.expect("config");
    let inbox_id = fixtures.insert_inbox(config_id, "grant-g").await.expect("inbox");

    let provider = Arc::new(FakeProvider::new());
    provider.add_thread(thread("T1", "Billing issue"), vec![
        message("M1", "T1", "Our invoice looks wrong"),
        message("M2", "T1", "Attaching the statement"),
    ]);
    provider.add_thread(thread("T2", "Feature request"), vec![
        message("M3", "T2", "Could you add exports?"),
    ]);

    let queue = JobQueue::new(pool.clone());
    queue
        .enqueue(INBOX_BACKFILL_JOBS, &backfill_job(config_id, inbox_id, "grant-g"))
        .await
        .expect("enqueue");

    let orchestrator = BackfillOrchestrator::new(
        pool.clone(),
        queue.clone(),
        provider.clone(),
        BackfillSettings::from_env(),
        Duration::ZERO,
    );
    let shutdown = CancellationToken::new();
    assert!(orchestrator.poll_once(&shutdown).await.expect("poll"));

    // The orchestration job is acked and every work row is on the sync queue.
    assert_eq!(queue.depth(INBOX_BACKFILL_JOBS).await.unwrap(), 0);
    assert_eq!(queue.depth(THREAD_SYNC_JOBS).await.unwrap(), 2);

    let worker = ThreadSyncWorker::new(
        pool.clone(),
        queue.clone(),
        provider.clone(),
        fast_thread_sync_settings(),
        Duration::ZERO,
        0,
    );
    loop {
        let messages = queue
            .read(THREAD_SYNC_JOBS, Duration::from_secs(60), 10)
            .await
            .expect("read");
        if messages.is_empty() {
            break;
        }
        for msg in &messages {
            worker.process_message(msg).await.expect("process");
        }
    }

    assert_eq!(queue.depth(THREAD_SYNC_JOBS).await.unwrap(), 0);

    for remote_id in ["T1", "T2"] {
        let row = work_rows::get(&pool, config_id, remote_id)
            .await
            .expect("row")
            .expect("row exists");
        assert_eq!(row.status, "completed");
        assert!(row.published_at.is_some());
    }

    let monitor = sync_server::workers::monitor::CompletionMonitor::new(
        pool.clone(),
        sync_server::config::MonitorSettings::from_env(),
    );
    assert_eq!(monitor.recompute_and_close().await.expect("close"), 1);

    assert_eq!(
        configs::get_status(&pool, config_id).await.expect("status"),
        sync_server::models::ConfigStatus::Completed
    );

    let stats_row = stats::get(&pool, config_id)
        .await
        .expect("stats")
        .expect("stats row");
    assert_eq!(stats_row.threads_total, 0, "total stays 0 when unknown");
    assert_eq!(stats_row.threads_queued, 2);
    assert_eq!(stats_row.threads_completed, 2);
    assert_eq!(stats_row.threads_failed, 0);
    assert_eq!(stats_row.messages_synced, 3);

    let thread_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM threads")
        .fetch_one(&pool)
        .await
        .unwrap();
    let message_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(thread_count, 2);
    assert_eq!(message_count, 3);

    test_db.close().await.expect("drop test database");
}

#[tokio::test]
async fn running_the_orchestrator_twice_yields_the_same_work_rows() {
    let test_db = TestDatabase::new().await.expect("test database");
    let pool = test_db.pool_clone();
    let fixtures = TestFixtures::new(&pool);

    let config_id = fixtures.insert_config("idle").await.expect("config");
    let inbox_id = fixtures.insert_inbox(config_id, "grant-g").await.expect("inbox");

    let provider = Arc::new(FakeProvider::new());
    provider.add_thread(thread("T1", "One"), vec![message("M1", "T1", "hello")]);
    provider.add_thread(thread("T2", "Two"), vec![message("M2", "T2", "world")]);

    let queue = JobQueue::new(pool.clone());
    let orchestrator = BackfillOrchestrator::new(
        pool.clone(),
        queue.clone(),
        provider,
        BackfillSettings::from_env(),
        Duration::ZERO,
    );
    let shutdown = CancellationToken::new();

    for _ in 0..2 {
        queue
            .enqueue(INBOX_BACKFILL_JOBS, &backfill_job(config_id, inbox_id, "grant-g"))
            .await
            .expect("enqueue");
        assert!(orchestrator.poll_once(&shutdown).await.expect("poll"));
    }

    let row_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM thread_work WHERE config_id = $1")
            .bind(config_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(row_count, 2, "re-queueing resets rows instead of adding");

    test_db.close().await.expect("drop test database");
}

#[tokio::test]
async fn requeue_preserves_newest_nonempty_grant() {
    let test_db = TestDatabase::new().await.expect("test database");
    let pool = test_db.pool_clone();
    let fixtures = TestFixtures::new(&pool);

    let config_id = fixtures.insert_config("backfill").await.expect("config");

    work_rows::upsert_queued(&pool, config_id, "T1", "G1")
        .await
        .expect("insert");
    work_rows::upsert_queued(&pool, config_id, "T1", "G2")
        .await
        .expect("requeue");

    let row = work_rows::get(&pool, config_id, "T1")
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(row.grant_id, "G2");
    assert_eq!(row.status, "queued");

    // An empty incoming grant must never null out the stored credential.
    work_rows::upsert_queued(&pool, config_id, "T1", "")
        .await
        .expect("requeue empty");
    let row = work_rows::get(&pool, config_id, "T1")
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(row.grant_id, "G2");

    test_db.close().await.expect("drop test database");
}

#[tokio::test]
async fn resync_counts_messages_that_already_exist_locally() {
    let test_db = TestDatabase::new().await.expect("test database");
    let pool = test_db.pool_clone();
    let fixtures = TestFixtures::new(&pool);

    let config_id = fixtures.insert_config("thread_sync").await.expect("config");
    let inbox_id = fixtures.insert_inbox(config_id, "grant-g").await.expect("inbox");

    let provider = Arc::new(FakeProvider::new());
    provider.add_thread(thread("T1", "One"), vec![
        message("M1", "T1", "first"),
        message("M2", "T1", "second"),
    ]);

    let queue = JobQueue::new(pool.clone());
    let worker = ThreadSyncWorker::new(
        pool.clone(),
        queue.clone(),
        provider,
        fast_thread_sync_settings(),
        Duration::ZERO,
        0,
    );

    let job = sync_server::payloads::ThreadSyncJob {
        thread_id: "T1".to_string(),
        grant_id: "grant-g".to_string(),
        inbox_id,
        config_id,
    };

    for _ in 0..2 {
        // Re-queue resets the row; the second pass finds every message
        // already present but still reports the full remote count.
        work_rows::upsert_queued(&pool, config_id, "T1", "grant-g").await.unwrap();
        queue.enqueue(THREAD_SYNC_JOBS, &job).await.expect("enqueue");
        let messages = queue
            .read(THREAD_SYNC_JOBS, Duration::from_secs(60), 1)
            .await
            .expect("read");
        worker.process_message(&messages[0]).await.expect("process");

        let row = work_rows::get(&pool, config_id, "T1")
            .await
            .unwrap()
            .expect("row");
        assert_eq!(row.status, "completed");
        assert_eq!(row.messages_synced, 2);
    }

    let message_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(message_count, 2, "no duplicate rows on resync");

    test_db.close().await.expect("drop test database");
}

#[tokio::test]
async fn thread_missing_on_provider_closes_the_row_empty() {
    let test_db = TestDatabase::new().await.expect("test database");
    let pool = test_db.pool_clone();
    let fixtures = TestFixtures::new(&pool);

    let config_id = fixtures.insert_config("thread_sync").await.expect("config");
    let inbox_id = fixtures.insert_inbox(config_id, "grant-g").await.expect("inbox");

    let queue = JobQueue::new(pool.clone());
    let worker = ThreadSyncWorker::new(
        pool.clone(),
        queue.clone(),
        Arc::new(FakeProvider::new()),
        fast_thread_sync_settings(),
        Duration::ZERO,
        0,
    );

    work_rows::upsert_queued(&pool, config_id, "gone", "grant-g").await.unwrap();
    queue
        .enqueue(
            THREAD_SYNC_JOBS,
            &sync_server::payloads::ThreadSyncJob {
                thread_id: "gone".to_string(),
                grant_id: "grant-g".to_string(),
                inbox_id,
                config_id,
            },
        )
        .await
        .expect("enqueue");

    let messages = queue
        .read(THREAD_SYNC_JOBS, Duration::from_secs(60), 1)
        .await
        .expect("read");
    worker.process_message(&messages[0]).await.expect("process");

    let row = work_rows::get(&pool, config_id, "gone")
        .await
        .unwrap()
        .expect("row");
    assert_eq!(row.status, "completed");
    assert_eq!(row.messages_synced, 0);
    assert_eq!(queue.depth(THREAD_SYNC_JOBS).await.unwrap(), 0);

    test_db.close().await.expect("drop test database");
}

#[tokio::test]
async fn startup_sweep_publishes_rows_orphaned_before_publication() {
    let test_db = TestDatabase::new().await.expect("test database");
    let pool = test_db.pool_clone();
    let fixtures = TestFixtures::new(&pool);

    let config_id = fixtures.insert_config("thread_sync").await.expect("config");
    fixtures.insert_inbox(config_id, "grant-g").await.expect("inbox");

    // Simulate a crash between row insertion and queue publication.
    for i in 0..50 {
        work_rows::upsert_queued(&pool, config_id, &format!("T{}", i), "grant-g")
            .await
            .expect("insert");
    }

    let queue = JobQueue::new(pool.clone());
    let orchestrator = BackfillOrchestrator::new(
        pool.clone(),
        queue.clone(),
        Arc::new(FakeProvider::new()),
        BackfillSettings::from_env(),
        Duration::ZERO,
    );

    let published = orchestrator.sweep_unpublished().await.expect("sweep");
    assert_eq!(published, 50);
    assert_eq!(queue.depth(THREAD_SYNC_JOBS).await.unwrap(), 50);

    let unpublished: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM thread_work WHERE config_id = $1 AND published_at IS NULL",
    )
    .bind(config_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(unpublished, 0);

    // A second sweep finds nothing to do.
    assert_eq!(orchestrator.sweep_unpublished().await.expect("sweep"), 0);

    test_db.close().await.expect("drop test database");
}
