//! End-to-end scenarios against the memory backend: send → refresh →
//! get_next → ack/redeliver, shard rollover, delete cascade.

use crate::model::{MessageDescriptor, ShardKind};
use crate::queue::{QueueMetrics, QueueService, ShardAllocator};
use crate::region::NoPeersTransport;
use crate::store::{MemoryStore, QueueStore};
use crate::tests::test_config;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

fn service_with_store(region: &str) -> (Arc<QueueService>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let service = Arc::new(QueueService::new(
        test_config(region),
        store.clone(),
        Arc::new(NoPeersTransport),
        QueueMetrics::new().unwrap(),
    ));
    (service, store)
}

fn service(region: &str) -> Arc<QueueService> {
    service_with_store(region).0
}

/// Refresh-and-poll until one descriptor shows up (or the deadline passes).
async fn next_one(service: &QueueService, queue: &str) -> Option<MessageDescriptor> {
    for _ in 0..100 {
        service.refresh().await.unwrap();
        let batch = service.get_next_messages(queue, 1).await.unwrap();
        if let Some(d) = batch.into_iter().next() {
            return Some(d);
        }
        sleep(Duration::from_millis(50)).await;
    }
    None
}

#[tokio::test]
async fn single_send_receive_round_trips_the_body() {
    let svc = service("dc1");
    svc.create_queue(svc.local_queue("orders")).await.unwrap();

    svc.send_message("orders", "dc1", &b"my test data"[..], "text/plain", None, None)
        .await
        .unwrap();

    svc.refresh().await.unwrap();
    let batch = svc.get_next_messages("orders", 1).await.unwrap();
    assert_eq!(batch.len(), 1);

    let body = svc.load_message_data(batch[0].message_id).await.unwrap();
    assert_eq!(&body.blob[..], b"my test data");
    assert_eq!(body.content_type, "text/plain");
}

#[tokio::test]
async fn batch_draining_serves_four_quarters() {
    let svc = service("dc1");
    svc.create_queue(svc.local_queue("bulk")).await.unwrap();

    for i in 0..100 {
        svc.send_message("bulk", "dc1", format!("payload {i}"), "text/plain", None, None)
            .await
            .unwrap();
    }

    // Poll until the buffer holds all 100.
    let mut buffered = 0;
    for _ in 0..15 {
        svc.refresh().await.unwrap();
        buffered = svc.buffered_len("bulk").await.unwrap();
        if buffered == 100 {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(buffered, 100);

    for expected_left in [75, 50, 25, 0] {
        let batch = svc.get_next_messages("bulk", 25).await.unwrap();
        assert_eq!(batch.len(), 25);
        assert_eq!(svc.buffered_len("bulk").await.unwrap(), expected_left);
    }
}

#[tokio::test]
async fn ack_removes_message_and_body() {
    let svc = service("dc1");
    svc.create_queue(svc.local_queue("q")).await.unwrap();

    let message_id = svc
        .send_message("q", "dc1", &b"one"[..], "text/plain", None, None)
        .await
        .unwrap();

    let d = next_one(&svc, "q").await.expect("message should arrive");
    assert_eq!(d.message_id, message_id);
    svc.ack_message("q", d.queue_message_id).await.unwrap();

    svc.refresh().await.unwrap();
    assert!(svc.get_next_messages("q", 1).await.unwrap().is_empty());
    assert!(svc
        .load_message_data(message_id)
        .await
        .unwrap_err()
        .is_benign());

    // Acking twice is a no-op.
    svc.ack_message("q", d.queue_message_id).await.unwrap();
}

#[tokio::test]
async fn lease_expiry_redelivers_with_a_new_attempt_id() {
    let svc = service("dc1");
    svc.create_queue(svc.local_queue("q")).await.unwrap();

    svc.send_message("q", "dc1", &b"slow consumer"[..], "text/plain", None, None)
        .await
        .unwrap();

    let first = next_one(&svc, "q").await.expect("first delivery");
    assert_eq!(first.n_returned, 0);

    // Do not ack; wait out the 1 s lease (plus sweep tick slack).
    let second = next_one(&svc, "q").await.expect("redelivery");
    assert_eq!(second.message_id, first.message_id);
    assert_ne!(second.queue_message_id, first.queue_message_id);
    assert_eq!(second.n_returned, 1);
}

#[tokio::test]
async fn redelivery_waits_for_the_lease() {
    let svc = service("dc1");
    let mut q = svc.local_queue("q");
    q.lease_seconds = 30;
    svc.create_queue(q).await.unwrap();
    svc.send_message("q", "dc1", &b"x"[..], "text/plain", None, None)
        .await
        .unwrap();

    let _first = next_one(&svc, "q").await.expect("first delivery");

    // Well inside the lease nothing comes back, even with refreshes.
    sleep(Duration::from_millis(300)).await;
    svc.refresh().await.unwrap();
    assert!(svc.get_next_messages("q", 1).await.unwrap().is_empty());
}

#[tokio::test]
async fn nack_returns_the_message_without_waiting_for_the_lease() {
    let svc = service("dc1");
    svc.create_queue(svc.local_queue("q")).await.unwrap();
    svc.send_message("q", "dc1", &b"retry me"[..], "text/plain", None, None)
        .await
        .unwrap();

    let d = next_one(&svc, "q").await.expect("first delivery");
    svc.nack_message("q", d.queue_message_id).await.unwrap();

    let again = next_one(&svc, "q").await.expect("nacked message comes back");
    assert_eq!(again.message_id, d.message_id);
    assert_ne!(again.queue_message_id, d.queue_message_id);
    assert_eq!(again.n_returned, 1);

    // Nacking the already-requeued attempt id is a no-op.
    svc.nack_message("q", d.queue_message_id).await.unwrap();
}

#[tokio::test]
async fn exhausted_redeliveries_dead_letter_the_message() {
    let svc = service("dc1");
    let mut q = svc.local_queue("q");
    q.max_redeliveries = 2;
    svc.create_queue(q).await.unwrap();

    svc.send_message("q", "dc1", &b"poison"[..], "text/plain", None, None)
        .await
        .unwrap();

    // Initial delivery plus two redeliveries; never acked.
    for expected_returns in [0, 1, 2] {
        let d = next_one(&svc, "q").await.expect("delivery attempt");
        assert_eq!(d.n_returned, expected_returns);
    }

    // The third lease expiry exceeds the cap; nothing comes back.
    sleep(Duration::from_millis(1_500)).await;
    svc.refresh().await.unwrap();
    assert!(svc.get_next_messages("q", 1).await.unwrap().is_empty());

    #[cfg(feature = "metrics")]
    assert_eq!(svc.metrics().dead_letter_count(), 1);
}

#[tokio::test]
async fn allocator_rolls_the_shard_over_near_capacity() {
    let (svc, store) = service_with_store("dc1");
    svc.create_queue(svc.local_queue("hot")).await.unwrap();

    let allocator = ShardAllocator::new(
        store.clone(),
        100,
        60_000,
        QueueMetrics::new().unwrap(),
    );

    for _ in 0..85 {
        svc.send_message("hot", "dc1", &b"x"[..], "text/plain", None, None)
            .await
            .unwrap();
    }
    allocator.check_queue("hot", "dc1").await;
    assert_eq!(
        store.list_shards("hot", "dc1", ShardKind::Default).await.unwrap().len(),
        1
    );

    for _ in 0..10 {
        svc.send_message("hot", "dc1", &b"x"[..], "text/plain", None, None)
            .await
            .unwrap();
    }
    let before = crate::timeuuid::now_ms();
    allocator.check_queue("hot", "dc1").await;

    let shards = store.list_shards("hot", "dc1", ShardKind::Default).await.unwrap();
    assert_eq!(shards.len(), 2);
    assert_eq!(shards[1].shard_id, 1);
    assert!(shards[1].pivot.unix_ms() > before);

    // Sends keep landing in shard 0 until the future pivot passes.
    svc.send_message("hot", "dc1", &b"x"[..], "text/plain", None, None)
        .await
        .unwrap();
    assert_eq!(
        store.get_counter("hot", "dc1", ShardKind::Default, 1).await.unwrap(),
        Some(0)
    );
}

#[tokio::test]
async fn delayed_sends_stay_invisible_until_due() {
    let svc = service("dc1");
    svc.create_queue(svc.local_queue("q")).await.unwrap();

    svc.send_message("q", "dc1", &b"later"[..], "text/plain", Some(60_000), None)
        .await
        .unwrap();

    svc.refresh().await.unwrap();
    assert!(svc.get_next_messages("q", 1).await.unwrap().is_empty());
    // Still durable, just not due.
    assert_eq!(svc.queue_depth("q").await.unwrap(), 1);
}

#[tokio::test]
async fn expired_messages_are_discarded_not_delivered() {
    let svc = service("dc1");
    svc.create_queue(svc.local_queue("q")).await.unwrap();

    let message_id = svc
        .send_message("q", "dc1", &b"stale"[..], "text/plain", None, Some(1))
        .await
        .unwrap();

    sleep(Duration::from_millis(50)).await;
    svc.refresh().await.unwrap();

    assert!(svc.get_next_messages("q", 1).await.unwrap().is_empty());
    assert!(svc
        .load_message_data(message_id)
        .await
        .unwrap_err()
        .is_benign());
}

#[tokio::test]
async fn queue_depth_estimates_from_counters() {
    let svc = service("dc1");
    svc.create_queue(svc.local_queue("q")).await.unwrap();

    for _ in 0..3 {
        svc.send_message("q", "dc1", &b"x"[..], "text/plain", None, None)
            .await
            .unwrap();
    }
    assert_eq!(svc.queue_depth("q").await.unwrap(), 3);

    // Moving to inflight keeps the message alive, so depth holds.
    let d = next_one(&svc, "q").await.unwrap();
    assert_eq!(svc.queue_depth("q").await.unwrap(), 3);

    svc.ack_message("q", d.queue_message_id).await.unwrap();
    assert_eq!(svc.queue_depth("q").await.unwrap(), 2);
}

#[tokio::test]
async fn deleting_a_queue_cascades() {
    let svc = service("dc1");
    svc.create_queue(svc.local_queue("doomed")).await.unwrap();
    let message_id = svc
        .send_message("doomed", "dc1", &b"x"[..], "text/plain", None, None)
        .await
        .unwrap();

    svc.delete_queue("doomed").await.unwrap();

    assert!(matches!(
        svc.get_next_messages("doomed", 1).await.unwrap_err(),
        crate::error::AppError::QueueNotFound(_)
    ));
    assert!(svc
        .load_message_data(message_id)
        .await
        .unwrap_err()
        .is_benign());
}

#[tokio::test]
async fn creating_the_same_queue_twice_conflicts() {
    let svc = service("dc1");
    svc.create_queue(svc.local_queue("q")).await.unwrap();
    assert!(matches!(
        svc.create_queue(svc.local_queue("q")).await.unwrap_err(),
        crate::error::AppError::QueueAlreadyExists(_)
    ));
}

#[tokio::test]
async fn sending_to_an_unknown_queue_fails() {
    let svc = service("dc1");
    let err = svc
        .send_message("ghost", "dc1", &b"x"[..], "text/plain", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, crate::error::AppError::QueueNotFound(_)));
}

#[tokio::test]
async fn restart_restores_actors_from_persisted_queues() {
    let (first, store) = service_with_store("dc1");
    first.create_queue(first.local_queue("q")).await.unwrap();
    first
        .send_message("q", "dc1", &b"survives"[..], "text/plain", None, None)
        .await
        .unwrap();
    first.shutdown().await;

    // A new service over the same storage picks the queue back up.
    let second = Arc::new(QueueService::new(
        test_config("dc1"),
        store,
        Arc::new(NoPeersTransport),
        QueueMetrics::new().unwrap(),
    ));
    second.start().await.unwrap();

    let d = next_one(&second, "q").await.expect("message survives restart");
    let body = second.load_message_data(d.message_id).await.unwrap();
    assert_eq!(&body.blob[..], b"survives");
}
