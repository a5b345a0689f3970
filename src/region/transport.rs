//! Message forwarding between regions.
//!
//! A send whose destination is not the local region travels through a
//! `RegionTransport` to the peer hosting that region, which then performs
//! the full local write (body first, then the available row). The wire
//! encoding and connection handling live behind the trait; the payload is
//! serde-ready so a wire transport can encode it however it likes.

use crate::error::{AppError, AppResult};
use crate::queue::service::QueueService;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Everything a peer needs to replay the send locally. Carries the body so
/// the destination region ends up with its own copy of the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardedSend {
    pub queue: String,
    pub source_region: String,
    pub dest_region: String,
    pub message_id: Uuid,
    pub body: Option<Vec<u8>>,
    pub content_type: Option<String>,
    pub delay_ms: Option<u64>,
    pub expiration_ms: Option<u64>,
}

#[async_trait]
pub trait RegionTransport: Send + Sync {
    /// Deliver a forwarded send to the peer serving `fwd.dest_region`.
    async fn forward_send(&self, fwd: ForwardedSend) -> AppResult<()>;
}

/// Transport for a single-region deployment: any forward is a routing error.
#[derive(Debug, Default)]
pub struct NoPeersTransport;

#[async_trait]
impl RegionTransport for NoPeersTransport {
    async fn forward_send(&self, fwd: ForwardedSend) -> AppResult<()> {
        Err(AppError::NoRoute(fwd.dest_region))
    }
}

/// Transport between co-hosted services, one per region. Used by tests and
/// embedded multi-region setups; a networked deployment supplies its own
/// `RegionTransport` instead.
#[derive(Default)]
pub struct InProcessTransport {
    peers: RwLock<HashMap<String, Arc<QueueService>>>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, region: impl Into<String>, service: Arc<QueueService>) {
        self.peers.write().await.insert(region.into(), service);
    }
}

#[async_trait]
impl RegionTransport for InProcessTransport {
    async fn forward_send(&self, fwd: ForwardedSend) -> AppResult<()> {
        let peer = self
            .peers
            .read()
            .await
            .get(&fwd.dest_region)
            .cloned()
            .ok_or_else(|| AppError::NoRoute(fwd.dest_region.clone()))?;
        debug!(
            queue = %fwd.queue,
            dest_region = %fwd.dest_region,
            message_id = %fwd.message_id,
            "forwarding send to peer region"
        );
        peer.accept_forwarded(fwd).await
    }
}
