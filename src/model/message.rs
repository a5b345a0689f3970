use crate::timeuuid::TimeUuid;
use bytes::Bytes;
use uuid::Uuid;

/// One persisted row in either the available or the inflight table.
///
/// `queue_message_id` names a single delivery attempt; `message_id` names the
/// payload and is stable across redeliveries.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub queue: String,
    pub region: String,
    pub shard_id: u32,
    pub queue_message_id: TimeUuid,
    pub message_id: Uuid,
    pub queued_at_ms: u64,
    pub inflight_at_ms: Option<u64>,
    pub n_returned: u32,
    pub expires_at_ms: Option<u64>,
}

impl QueueMessage {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        matches!(self.expires_at_ms, Some(at) if at <= now_ms)
    }

    pub fn descriptor(&self) -> MessageDescriptor {
        MessageDescriptor {
            queue_message_id: self.queue_message_id,
            message_id: self.message_id,
            shard_id: self.shard_id,
            queued_at_ms: self.queued_at_ms,
            inflight_at_ms: self.inflight_at_ms.unwrap_or(0),
            n_returned: self.n_returned,
        }
    }
}

/// What `get_next` hands to consumers. Payload bytes are fetched separately
/// by `message_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDescriptor {
    pub queue_message_id: TimeUuid,
    pub message_id: Uuid,
    pub shard_id: u32,
    pub queued_at_ms: u64,
    pub inflight_at_ms: u64,
    pub n_returned: u32,
}

/// Opaque payload, written once before the index row and deleted on final
/// ack.
#[derive(Debug, Clone)]
pub struct MessageBody {
    pub message_id: Uuid,
    pub blob: Bytes,
    pub content_type: String,
}

impl MessageBody {
    pub fn new(message_id: Uuid, blob: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            message_id,
            blob: blob.into(),
            content_type: content_type.into(),
        }
    }
}
