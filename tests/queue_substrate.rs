use std::time::Duration;

use serde_json::json;
use sync_server::queue::JobQueue;
use sync_server::test_support::TestDatabase;

#[tokio::test]
async fn enqueue_read_delete_round_trip() {
    let test_db = TestDatabase::new().await.expect("test database");
    let queue = JobQueue::new(test_db.pool_clone());

    let first = queue
        .enqueue("test_queue", &json!({"n": 1}))
        .await
        .expect("enqueue");
    let second = queue
        .enqueue("test_queue", &json!({"n": 2}))
        .await
        .expect("enqueue");
    assert!(second > first, "message ids are monotonic");

    let messages = queue
        .read("test_queue", Duration::from_secs(30), 10)
        .await
        .expect("read");
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].payload["n"], 1, "best-effort FIFO by id");
    assert_eq!(messages[0].read_ct, 1);

    // Both messages are now invisible for the visibility window.
    let hidden = queue
        .read("test_queue", Duration::from_secs(30), 10)
        .await
        .expect("read");
    assert!(hidden.is_empty());

    for message in &messages {
        assert!(queue.delete("test_queue", message.msg_id).await.expect("delete"));
    }
    assert_eq!(queue.depth("test_queue").await.expect("depth"), 0);

    // Deleting again reports the message as gone.
    assert!(!queue.delete("test_queue", first).await.expect("delete"));

    test_db.close().await.expect("drop test database");
}

#[tokio::test]
async fn undeleted_message_redelivers_with_incremented_read_ct() {
    let test_db = TestDatabase::new().await.expect("test database");
    let queue = JobQueue::new(test_db.pool_clone());

    queue
        .enqueue("retry_queue", &json!({"attempt": "x"}))
        .await
        .expect("enqueue");

    // Zero visibility makes the message immediately visible again, standing in
    // for an expired visibility timeout.
    let first = queue
        .read("retry_queue", Duration::ZERO, 1)
        .await
        .expect("read");
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].read_ct, 1);

    let second = queue
        .read("retry_queue", Duration::ZERO, 1)
        .await
        .expect("read");
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].msg_id, first[0].msg_id);
    assert_eq!(second[0].read_ct, 2);

    test_db.close().await.expect("drop test database");
}

#[tokio::test]
async fn queues_are_isolated_by_name() {
    let test_db = TestDatabase::new().await.expect("test database");
    let queue = JobQueue::new(test_db.pool_clone());

    queue.enqueue("queue_a", &json!({})).await.expect("enqueue");

    let other = queue
        .read("queue_b", Duration::from_secs(30), 10)
        .await
        .expect("read");
    assert!(other.is_empty());
    assert_eq!(queue.depth("queue_a").await.expect("depth"), 1);

    assert_eq!(queue.purge("queue_a").await.expect("purge"), 1);
    assert_eq!(queue.depth("queue_a").await.expect("depth"), 0);

    test_db.close().await.expect("drop test database");
}
