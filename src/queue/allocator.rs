use crate::error::{AppResult, ErrorKind};
use crate::model::{Shard, ShardKind};
use crate::queue::metrics::QueueMetrics;
use crate::store::QueueStore;
use crate::timeuuid::{self, TimeUuid};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Fraction of `max_shard_size` at which the next shard is cut.
const ALLOCATION_THRESHOLD: f64 = 0.9;

/// Watches per-shard counters and cuts the next shard before the current one
/// fills up.
///
/// The new pivot is stamped slightly in the future so producers that routed
/// against the old shard list in the window between ticks still land in the
/// current shard; once the pivot's timestamp passes, writers deterministically
/// route newer ids to the new shard.
pub struct ShardAllocator {
    store: Arc<dyn QueueStore>,
    max_shard_size: i64,
    advance_ms: u64,
    metrics: QueueMetrics,
}

impl ShardAllocator {
    pub fn new(
        store: Arc<dyn QueueStore>,
        max_shard_size: i64,
        advance_ms: u64,
        metrics: QueueMetrics,
    ) -> Self {
        Self {
            store,
            max_shard_size,
            advance_ms,
            metrics,
        }
    }

    /// One allocator tick for a queue: check both shard kinds. Never fails;
    /// anything that goes wrong is logged and retried on the next tick.
    pub async fn check_queue(&self, queue: &str, region: &str) {
        for kind in ShardKind::BOTH {
            if let Err(e) = self.check(queue, region, kind).await {
                warn!(
                    queue,
                    region,
                    kind = kind.as_str(),
                    error = %e,
                    "shard check failed; will retry on next tick"
                );
            }
        }
    }

    /// Check one (queue, region, kind) and allocate the successor shard when
    /// the latest counter crosses the threshold. Returns the new shard when
    /// one was cut.
    pub async fn check(
        &self,
        queue: &str,
        region: &str,
        kind: ShardKind,
    ) -> AppResult<Option<Shard>> {
        let shards = self.store.list_shards(queue, region, kind).await?;
        let Some(latest) = shards.last() else {
            // Shard 0 is created with the queue; nothing to grow from here.
            warn!(queue, region, kind = kind.as_str(), "no shards to check");
            return Ok(None);
        };

        let counter = self
            .store
            .get_counter(queue, region, kind, latest.shard_id)
            .await?
            .unwrap_or(0);

        let threshold = (self.max_shard_size as f64 * ALLOCATION_THRESHOLD) as i64;
        if counter <= threshold {
            debug!(
                queue,
                region,
                kind = kind.as_str(),
                shard_id = latest.shard_id,
                counter,
                threshold,
                "latest shard below threshold"
            );
            return Ok(None);
        }

        let shard = Shard {
            queue: queue.to_string(),
            region: region.to_string(),
            kind,
            shard_id: latest.shard_id + 1,
            pivot: TimeUuid::at_unix_ms(timeuuid::now_ms() + self.advance_ms),
        };

        match self.store.put_shard(&shard).await {
            Ok(()) => {
                self.store
                    .add_to_counter(queue, region, kind, shard.shard_id, 0)
                    .await?;
                self.metrics.inc_shard_allocation(kind.as_str());
                info!(
                    queue,
                    region,
                    kind = kind.as_str(),
                    shard_id = shard.shard_id,
                    pivot_ms = shard.pivot.unix_ms(),
                    "allocated shard"
                );
                Ok(Some(shard))
            }
            // Another allocator won the race; its shard is the new latest.
            Err(e) if e.kind() == ErrorKind::Conflict => {
                debug!(queue, region, kind = kind.as_str(), "lost allocation race");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
