//! Per-(queue, region) actor.
//!
//! One daemon task owns the in-memory buffer and is the only code path that
//! moves rows available → inflight for its queue. Timer loops only *send*
//! commands into the mailbox, so every transition — refresh, ack, nack,
//! shard check, sweep — is processed strictly one at a time.

use crate::appconfig::{DeliveryConfig, ShardsConfig};
use crate::error::{AppError, AppResult};
use crate::model::{shard_for, MessageDescriptor, Queue, QueueMessage, Shard, ShardKind};
use crate::queue::allocator::ShardAllocator;
use crate::queue::buffer::MessageBuffer;
use crate::queue::metrics::QueueMetrics;
use crate::queue::sweeper::{Requeue, TimeoutSweeper};
use crate::store::QueueStore;
use crate::timeuuid::{self, TimeUuid};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};

/// Mailbox depth. Senders back off (await) when the actor falls behind.
const MAILBOX_DEPTH: usize = 256;

#[derive(Debug)]
pub enum QueueCommand {
    /// Top up the buffer from storage. Carries a notifier when a caller
    /// (operator hook, test) wants to observe completion.
    Refresh { done: Option<oneshot::Sender<()>> },
    /// Serve up to `n` buffered descriptors; never touches storage.
    GetNext {
        n: usize,
        reply: oneshot::Sender<Vec<MessageDescriptor>>,
    },
    Ack {
        id: TimeUuid,
        reply: oneshot::Sender<AppResult<()>>,
    },
    Nack {
        id: TimeUuid,
        reply: oneshot::Sender<AppResult<()>>,
    },
    /// Allocator tick.
    ShardCheck,
    /// Sweeper tick.
    SweepExpired,
    BufferLen { reply: oneshot::Sender<usize> },
    Shutdown,
}

/// Handle to a running actor: the mailbox plus the daemon and timer tasks.
pub struct QueueActorHandle {
    tx: mpsc::Sender<QueueCommand>,
    daemon: JoinHandle<()>,
    timers: Vec<JoinHandle<()>>,
}

impl QueueActorHandle {
    pub fn sender(&self) -> mpsc::Sender<QueueCommand> {
        self.tx.clone()
    }

    /// Stop the timers, let the daemon drain its mailbox and exit.
    pub async fn shutdown(self) {
        for t in &self.timers {
            t.abort();
        }
        let _ = self.tx.send(QueueCommand::Shutdown).await;
        let _ = self.daemon.await;
    }
}

pub struct QueueActor {
    queue: Queue,
    region: String,
    store: Arc<dyn QueueStore>,
    delivery: DeliveryConfig,
    buffer: MessageBuffer,
    allocator: ShardAllocator,
    sweeper: TimeoutSweeper,
    metrics: QueueMetrics,
    /// Own mailbox, used to nudge a refresh after get_next drains the buffer.
    self_tx: mpsc::Sender<QueueCommand>,
}

/// Spawn the actor daemon and its timer loops.
pub fn spawn(
    queue: Queue,
    region: String,
    store: Arc<dyn QueueStore>,
    delivery: DeliveryConfig,
    shards: ShardsConfig,
    metrics: QueueMetrics,
) -> QueueActorHandle {
    let (tx, rx) = mpsc::channel::<QueueCommand>(MAILBOX_DEPTH);

    let actor = QueueActor {
        buffer: MessageBuffer::new(delivery.buffer_target),
        allocator: ShardAllocator::new(
            store.clone(),
            shards.max_shard_size,
            shards.allocation_advance_ms,
            metrics.clone(),
        ),
        sweeper: TimeoutSweeper::new(store.clone(), metrics.clone()),
        queue,
        region,
        store,
        metrics,
        self_tx: tx.clone(),
        delivery: delivery.clone(),
    };

    let daemon = tokio::spawn(actor.run(rx));

    let timers = vec![
        spawn_tick(tx.clone(), delivery.refresh_interval_ms, || {
            QueueCommand::Refresh { done: None }
        }),
        spawn_tick(tx.clone(), shards.check_interval_ms, || {
            QueueCommand::ShardCheck
        }),
        spawn_tick(tx.clone(), delivery.sweep_interval_ms, || {
            QueueCommand::SweepExpired
        }),
    ];

    QueueActorHandle { tx, daemon, timers }
}

/// A timer loop only sends; the actor does the work, one command at a time.
fn spawn_tick(
    tx: mpsc::Sender<QueueCommand>,
    period_ms: u64,
    make: impl Fn() -> QueueCommand + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_millis(period_ms.max(1)));
        // The first tick fires immediately; skip it so a fresh actor does not
        // race its own startup.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if tx.send(make()).await.is_err() {
                break;
            }
        }
    })
}

impl QueueActor {
    async fn run(mut self, mut rx: mpsc::Receiver<QueueCommand>) {
        info!(queue = %self.queue.name, region = %self.region, "queue actor started");

        while let Some(cmd) = rx.recv().await {
            match cmd {
                QueueCommand::Refresh { done } => {
                    if let Err(e) = self.refresh().await {
                        warn!(
                            queue = %self.queue.name,
                            region = %self.region,
                            error = %e,
                            "refresh failed"
                        );
                    }
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                }
                QueueCommand::GetNext { n, reply } => {
                    let batch = self.buffer.poll_up_to(n);
                    self.metrics.add_dequeued(batch.len() as u64);
                    self.metrics
                        .set_buffer_size(&self.queue.name, self.buffer.len() as i64);
                    let _ = reply.send(batch);
                    self.nudge_refresh();
                }
                QueueCommand::Ack { id, reply } => {
                    let res = self.ack(id).await;
                    let _ = reply.send(res);
                }
                QueueCommand::Nack { id, reply } => {
                    let res = self.nack(id).await;
                    let _ = reply.send(res);
                }
                QueueCommand::ShardCheck => {
                    self.allocator
                        .check_queue(&self.queue.name, &self.region)
                        .await;
                }
                QueueCommand::SweepExpired => {
                    let t0 = Instant::now();
                    match self.sweeper.sweep(&self.queue, &self.region).await {
                        Ok(_) => self
                            .metrics
                            .observe_sweep_latency(t0.elapsed().as_secs_f64()),
                        Err(e) => warn!(
                            queue = %self.queue.name,
                            region = %self.region,
                            error = %e,
                            "sweep failed"
                        ),
                    }
                }
                QueueCommand::BufferLen { reply } => {
                    let _ = reply.send(self.buffer.len());
                }
                QueueCommand::Shutdown => break,
            }
        }

        info!(queue = %self.queue.name, region = %self.region, "queue actor stopped");
    }

    /// Best-effort self-refresh after a dequeue; dropped when the mailbox is
    /// already busy, which is fine — the periodic tick catches up.
    fn nudge_refresh(&self) {
        if self.buffer.len() < self.low_watermark() {
            let _ = self.self_tx.try_send(QueueCommand::Refresh { done: None });
        }
    }

    fn low_watermark(&self) -> usize {
        self.delivery
            .buffer_target
            .saturating_sub(self.delivery.refresh_batch)
            .max(1)
    }

    /// Pull rows from the active default shards, move each to inflight, and
    /// append the new descriptors to the buffer.
    ///
    /// The inflight row is durable before its descriptor is appended, so a
    /// descriptor handed out by get_next always has storage backing it.
    async fn refresh(&mut self) -> AppResult<()> {
        if self.buffer.len() >= self.low_watermark() {
            return Ok(());
        }
        let mut budget = self
            .delivery
            .refresh_batch
            .min(self.buffer.remaining_capacity());
        if budget == 0 {
            return Ok(());
        }

        let t0 = Instant::now();
        let now = timeuuid::now_ms();

        let default_shards = self
            .store
            .list_shards(&self.queue.name, &self.region, ShardKind::Default)
            .await?;
        let inflight_shards = self
            .store
            .list_shards(&self.queue.name, &self.region, ShardKind::Inflight)
            .await?;

        let mut moved: Vec<MessageDescriptor> = Vec::new();

        // Oldest shards drain first; shards with a future pivot hold nothing
        // deliverable yet.
        for shard in default_shards.iter().filter(|s| s.pivot.unix_ms() <= now) {
            if budget == 0 {
                break;
            }
            let rows = self
                .store
                .read_available(&self.queue.name, &self.region, shard.shard_id, now, budget)
                .await?;

            for row in rows {
                if row.is_expired(now) {
                    self.discard_expired(shard, row, now).await?;
                    continue;
                }
                let descriptor = self.move_to_inflight(shard, row, &inflight_shards, now).await?;
                moved.push(descriptor);
                budget -= 1;
            }
        }

        if !moved.is_empty() {
            debug!(
                queue = %self.queue.name,
                region = %self.region,
                moved = moved.len(),
                buffered = self.buffer.len() + moved.len(),
                "refreshed buffer"
            );
        }
        self.buffer.append(moved);
        self.metrics
            .set_buffer_size(&self.queue.name, self.buffer.len() as i64);
        self.metrics
            .observe_refresh_latency(t0.elapsed().as_secs_f64());
        Ok(())
    }

    /// available → inflight for one row. Write the inflight row first; the
    /// data model tolerates both rows existing across a crash, never neither.
    async fn move_to_inflight(
        &self,
        from: &Shard,
        row: QueueMessage,
        inflight_shards: &[Shard],
        now_ms: u64,
    ) -> AppResult<MessageDescriptor> {
        let attempt_id = TimeUuid::at_unix_ms(now_ms);
        let target = shard_for(inflight_shards, attempt_id).ok_or_else(|| AppError::NoShard {
            queue: self.queue.name.clone(),
            region: self.region.clone(),
        })?;

        let inflight_row = QueueMessage {
            queue: row.queue.clone(),
            region: row.region.clone(),
            shard_id: target.shard_id,
            queue_message_id: attempt_id,
            message_id: row.message_id,
            queued_at_ms: row.queued_at_ms,
            inflight_at_ms: Some(now_ms),
            n_returned: row.n_returned,
            expires_at_ms: row.expires_at_ms,
        };

        self.store.put_inflight(&inflight_row).await?;
        if self
            .store
            .delete_available(
                &self.queue.name,
                &self.region,
                from.shard_id,
                row.queue_message_id,
            )
            .await?
        {
            self.store
                .add_to_counter(
                    &self.queue.name,
                    &self.region,
                    ShardKind::Default,
                    from.shard_id,
                    -1,
                )
                .await?;
        }
        self.store
            .add_to_counter(
                &self.queue.name,
                &self.region,
                ShardKind::Inflight,
                target.shard_id,
                1,
            )
            .await?;

        Ok(inflight_row.descriptor())
    }

    async fn discard_expired(
        &self,
        shard: &Shard,
        row: QueueMessage,
        now_ms: u64,
    ) -> AppResult<()> {
        if self
            .store
            .delete_available(
                &self.queue.name,
                &self.region,
                shard.shard_id,
                row.queue_message_id,
            )
            .await?
        {
            self.store
                .add_to_counter(
                    &self.queue.name,
                    &self.region,
                    ShardKind::Default,
                    shard.shard_id,
                    -1,
                )
                .await?;
            self.store.delete_body(row.message_id).await?;
            self.metrics.inc_expired();
            debug!(
                queue = %self.queue.name,
                message_id = %row.message_id,
                expired_at_ms = row.expires_at_ms.unwrap_or(now_ms),
                "discarded expired message"
            );
        }
        Ok(())
    }

    /// Delete the inflight row for one delivery attempt and drop its body.
    /// Unknown ids are a benign miss (double ack, or the sweeper got there
    /// first).
    async fn ack(&mut self, id: TimeUuid) -> AppResult<()> {
        let inflight_shards = self
            .store
            .list_shards(&self.queue.name, &self.region, ShardKind::Inflight)
            .await?;
        let shard = shard_for(&inflight_shards, id).ok_or_else(|| AppError::NoShard {
            queue: self.queue.name.clone(),
            region: self.region.clone(),
        })?;

        let Some(row) = self
            .store
            .get_inflight(&self.queue.name, &self.region, shard.shard_id, id)
            .await?
        else {
            return Err(AppError::MessageNotFound(id.to_string()));
        };

        if self
            .store
            .delete_inflight(&self.queue.name, &self.region, shard.shard_id, id)
            .await?
        {
            self.store
                .add_to_counter(
                    &self.queue.name,
                    &self.region,
                    ShardKind::Inflight,
                    shard.shard_id,
                    -1,
                )
                .await?;
            self.store.delete_body(row.message_id).await?;
            self.metrics.inc_acked();
        }
        Ok(())
    }

    /// Give the message back immediately: same transition as a lease expiry.
    async fn nack(&mut self, id: TimeUuid) -> AppResult<()> {
        let inflight_shards = self
            .store
            .list_shards(&self.queue.name, &self.region, ShardKind::Inflight)
            .await?;
        let shard = shard_for(&inflight_shards, id).ok_or_else(|| AppError::NoShard {
            queue: self.queue.name.clone(),
            region: self.region.clone(),
        })?;

        let Some(row) = self
            .store
            .get_inflight(&self.queue.name, &self.region, shard.shard_id, id)
            .await?
        else {
            return Err(AppError::MessageNotFound(id.to_string()));
        };

        let default_shards = self
            .store
            .list_shards(&self.queue.name, &self.region, ShardKind::Default)
            .await?;
        let outcome = self
            .sweeper
            .requeue(
                &self.queue,
                &self.region,
                &default_shards,
                shard.shard_id,
                row,
                timeuuid::now_ms(),
            )
            .await?;
        if outcome != Requeue::Skipped {
            self.metrics.inc_nacked();
        }
        Ok(())
    }
}
