//! Cross-region forwarding through the in-process transport. Both services
//! share one store, the way peer regions share a replicated wide-column
//! cluster; each writes and serves only rows tagged with its own region.

use crate::error::AppError;
use crate::queue::{QueueMetrics, QueueService};
use crate::region::{InProcessTransport, NoPeersTransport};
use crate::store::MemoryStore;
use crate::tests::test_config;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

async fn two_region_setup() -> (Arc<QueueService>, Arc<QueueService>) {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(InProcessTransport::new());

    let east = Arc::new(QueueService::new(
        test_config("us-east"),
        store.clone(),
        transport.clone(),
        QueueMetrics::new().unwrap(),
    ));
    let west = Arc::new(QueueService::new(
        test_config("eu-west"),
        store,
        transport.clone(),
        QueueMetrics::new().unwrap(),
    ));

    transport.register("us-east", east.clone()).await;
    transport.register("eu-west", west.clone()).await;
    (east, west)
}

#[tokio::test]
async fn a_forwarded_send_is_served_by_the_destination_region() {
    let (east, west) = two_region_setup().await;

    let mut q = east.local_queue("global");
    q.regions = vec!["us-east".into(), "eu-west".into()];
    east.create_queue(q).await.unwrap();

    let message_id = east
        .send_message("global", "eu-west", &b"bonjour"[..], "text/plain", None, None)
        .await
        .unwrap();

    // The producer region has nothing to serve...
    east.refresh().await.unwrap();
    assert!(east.get_next_messages("global", 1).await.unwrap().is_empty());

    // ...the destination region does.
    let mut delivered = None;
    for _ in 0..100 {
        west.refresh().await.unwrap();
        let batch = west.get_next_messages("global", 1).await.unwrap();
        if let Some(d) = batch.into_iter().next() {
            delivered = Some(d);
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    let d = delivered.expect("message should reach eu-west");
    assert_eq!(d.message_id, message_id);

    let body = west.load_message_data(d.message_id).await.unwrap();
    assert_eq!(&body.blob[..], b"bonjour");

    west.ack_message("global", d.queue_message_id).await.unwrap();
}

#[tokio::test]
async fn forwarding_without_a_route_is_an_error() {
    let store = Arc::new(MemoryStore::new());
    let svc = Arc::new(QueueService::new(
        test_config("us-east"),
        store,
        Arc::new(NoPeersTransport),
        QueueMetrics::new().unwrap(),
    ));

    svc.create_queue(svc.local_queue("q")).await.unwrap();
    let err = svc
        .send_message("q", "eu-west", &b"x"[..], "text/plain", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NoRoute(region) if region == "eu-west"));
}
