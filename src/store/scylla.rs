//! Wide-column store backend (ScyllaDB / Cassandra).
//!
//! Message rows cluster by `(ts_ms, id)` inside a `(queue, region, shard_id)`
//! partition, so range reads come back in the same order `TimeUuid` sorts
//! in-process. Shard counters live in a counter table mutated only through
//! atomic adds. Conditional deletes use lightweight transactions so the
//! caller can tell whether it actually removed a row.

use crate::appconfig::ScyllaConfig;
use crate::error::{AppError, AppResult};
use crate::model::{MessageBody, Queue, QueueMessage, Shard, ShardKind};
use crate::store::traits::QueueStore;
use crate::timeuuid::TimeUuid;
use async_trait::async_trait;
use scylla::cql_to_rust::{FromCqlVal, FromCqlValError, FromRowError};
use scylla::frame::value::Counter;
use scylla::prepared_statement::PreparedStatement;
use scylla::{FromRow, Session, SessionBuilder};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

const CREATE_TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS queues (
        name text PRIMARY KEY,
        origin_region text,
        regions list<text>,
        default_delay_ms bigint,
        lease_seconds int,
        max_redeliveries int
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS shards (
        queue text,
        region text,
        kind text,
        shard_id int,
        pivot uuid,
        PRIMARY KEY ((queue, region, kind), shard_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS shard_counters (
        queue text,
        region text,
        kind text,
        shard_id int,
        count counter,
        PRIMARY KEY ((queue, region, kind, shard_id))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages_available (
        queue text,
        region text,
        shard_id int,
        ts_ms bigint,
        id uuid,
        message_id uuid,
        queued_at_ms bigint,
        n_returned int,
        expires_at_ms bigint,
        PRIMARY KEY ((queue, region, shard_id), ts_ms, id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages_inflight (
        queue text,
        region text,
        shard_id int,
        ts_ms bigint,
        id uuid,
        message_id uuid,
        queued_at_ms bigint,
        inflight_at_ms bigint,
        n_returned int,
        expires_at_ms bigint,
        PRIMARY KEY ((queue, region, shard_id), ts_ms, id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS message_bodies (
        message_id uuid PRIMARY KEY,
        blob blob,
        content_type text
    )
    "#,
];

const INSERT_QUEUE: &str = r#"
    INSERT INTO queues (name, origin_region, regions, default_delay_ms, lease_seconds, max_redeliveries)
    VALUES (?, ?, ?, ?, ?, ?)
    IF NOT EXISTS
"#;

const GET_QUEUE: &str = r#"
    SELECT name, origin_region, regions, default_delay_ms, lease_seconds, max_redeliveries
    FROM queues
    WHERE name = ?
"#;

const LIST_QUEUES: &str = r#"
    SELECT name, origin_region, regions, default_delay_ms, lease_seconds, max_redeliveries
    FROM queues
"#;

const DELETE_QUEUE: &str = "DELETE FROM queues WHERE name = ?";

const INSERT_SHARD: &str = r#"
    INSERT INTO shards (queue, region, kind, shard_id, pivot)
    VALUES (?, ?, ?, ?, ?)
    IF NOT EXISTS
"#;

const LIST_SHARDS: &str = r#"
    SELECT shard_id, pivot
    FROM shards
    WHERE queue = ? AND region = ? AND kind = ?
"#;

const DELETE_SHARDS: &str = "DELETE FROM shards WHERE queue = ? AND region = ? AND kind = ?";

const ADD_TO_COUNTER: &str = r#"
    UPDATE shard_counters SET count = count + ?
    WHERE queue = ? AND region = ? AND kind = ? AND shard_id = ?
"#;

const GET_COUNTER: &str = r#"
    SELECT count FROM shard_counters
    WHERE queue = ? AND region = ? AND kind = ? AND shard_id = ?
"#;

const DELETE_COUNTER: &str = r#"
    DELETE FROM shard_counters
    WHERE queue = ? AND region = ? AND kind = ? AND shard_id = ?
"#;

const INSERT_AVAILABLE: &str = r#"
    INSERT INTO messages_available (queue, region, shard_id, ts_ms, id, message_id, queued_at_ms, n_returned, expires_at_ms)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

const READ_AVAILABLE: &str = r#"
    SELECT id, message_id, queued_at_ms, n_returned, expires_at_ms
    FROM messages_available
    WHERE queue = ? AND region = ? AND shard_id = ? AND ts_ms <= ?
    LIMIT ?
"#;

const DELETE_AVAILABLE: &str = r#"
    DELETE FROM messages_available
    WHERE queue = ? AND region = ? AND shard_id = ? AND ts_ms = ? AND id = ?
    IF EXISTS
"#;

const LIST_AVAILABLE_MESSAGE_IDS: &str = r#"
    SELECT message_id FROM messages_available
    WHERE queue = ? AND region = ? AND shard_id = ?
"#;

const DELETE_AVAILABLE_PARTITION: &str = r#"
    DELETE FROM messages_available
    WHERE queue = ? AND region = ? AND shard_id = ?
"#;

const INSERT_INFLIGHT: &str = r#"
    INSERT INTO messages_inflight (queue, region, shard_id, ts_ms, id, message_id, queued_at_ms, inflight_at_ms, n_returned, expires_at_ms)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

const GET_INFLIGHT: &str = r#"
    SELECT id, message_id, queued_at_ms, inflight_at_ms, n_returned, expires_at_ms
    FROM messages_inflight
    WHERE queue = ? AND region = ? AND shard_id = ? AND ts_ms = ? AND id = ?
"#;

const READ_EXPIRED_INFLIGHT: &str = r#"
    SELECT id, message_id, queued_at_ms, inflight_at_ms, n_returned, expires_at_ms
    FROM messages_inflight
    WHERE queue = ? AND region = ? AND shard_id = ? AND inflight_at_ms < ?
    LIMIT ?
    ALLOW FILTERING
"#;

const DELETE_INFLIGHT: &str = r#"
    DELETE FROM messages_inflight
    WHERE queue = ? AND region = ? AND shard_id = ? AND ts_ms = ? AND id = ?
    IF EXISTS
"#;

const LIST_INFLIGHT_MESSAGE_IDS: &str = r#"
    SELECT message_id FROM messages_inflight
    WHERE queue = ? AND region = ? AND shard_id = ?
"#;

const DELETE_INFLIGHT_PARTITION: &str = r#"
    DELETE FROM messages_inflight
    WHERE queue = ? AND region = ? AND shard_id = ?
"#;

const INSERT_BODY: &str = r#"
    INSERT INTO message_bodies (message_id, blob, content_type)
    VALUES (?, ?, ?)
"#;

const GET_BODY: &str = "SELECT blob, content_type FROM message_bodies WHERE message_id = ?";

const DELETE_BODY: &str = "DELETE FROM message_bodies WHERE message_id = ?";

/// First column of a lightweight-transaction result. Conflict results carry
/// extra columns, so the row cannot be read as a plain `(bool,)`.
struct Applied(bool);

impl FromRow for Applied {
    fn from_row(
        row: scylla::frame::response::result::Row,
    ) -> Result<Self, scylla::cql_to_rust::FromRowError> {
        row.columns
            .first()
            .ok_or(FromRowError::BadCqlVal {
                err: FromCqlValError::ValIsNull,
                column: 0,
            })
            .and_then(|cqlval| {
                bool::from_cql(cqlval.to_owned()).map_err(|_err| FromRowError::BadCqlVal {
                    err: FromCqlValError::BadCqlType,
                    column: 0,
                })
            })
            .map(Applied)
    }
}

fn db_err(e: impl std::fmt::Display) -> AppError {
    AppError::Storage(e.to_string())
}

struct Statements {
    insert_queue: PreparedStatement,
    get_queue: PreparedStatement,
    delete_queue: PreparedStatement,
    insert_shard: PreparedStatement,
    list_shards: PreparedStatement,
    add_to_counter: PreparedStatement,
    get_counter: PreparedStatement,
    insert_available: PreparedStatement,
    read_available: PreparedStatement,
    delete_available: PreparedStatement,
    insert_inflight: PreparedStatement,
    get_inflight: PreparedStatement,
    read_expired_inflight: PreparedStatement,
    delete_inflight: PreparedStatement,
    insert_body: PreparedStatement,
    get_body: PreparedStatement,
    delete_body: PreparedStatement,
}

pub struct ScyllaStore {
    session: Arc<Session>,
    ps: Statements,
}

impl ScyllaStore {
    /// Connect, create the keyspace/tables when missing, and prepare the hot
    /// path statements.
    pub async fn connect(cfg: &ScyllaConfig) -> AppResult<Self> {
        let session = SessionBuilder::new()
            .known_nodes(&cfg.nodes)
            .build()
            .await
            .map_err(db_err)?;

        session
            .query(
                format!(
                    "CREATE KEYSPACE IF NOT EXISTS {} WITH replication = \
                     {{'class': 'SimpleStrategy', 'replication_factor': {}}}",
                    cfg.keyspace, cfg.replication_factor
                ),
                &[],
            )
            .await
            .map_err(db_err)?;
        session
            .use_keyspace(&cfg.keyspace, false)
            .await
            .map_err(db_err)?;
        for ddl in CREATE_TABLES {
            session.query(*ddl, &[]).await.map_err(db_err)?;
        }

        let ps = Statements {
            insert_queue: session.prepare(INSERT_QUEUE).await.map_err(db_err)?,
            get_queue: session.prepare(GET_QUEUE).await.map_err(db_err)?,
            delete_queue: session.prepare(DELETE_QUEUE).await.map_err(db_err)?,
            insert_shard: session.prepare(INSERT_SHARD).await.map_err(db_err)?,
            list_shards: session.prepare(LIST_SHARDS).await.map_err(db_err)?,
            add_to_counter: session.prepare(ADD_TO_COUNTER).await.map_err(db_err)?,
            get_counter: session.prepare(GET_COUNTER).await.map_err(db_err)?,
            insert_available: session.prepare(INSERT_AVAILABLE).await.map_err(db_err)?,
            read_available: session.prepare(READ_AVAILABLE).await.map_err(db_err)?,
            delete_available: session.prepare(DELETE_AVAILABLE).await.map_err(db_err)?,
            insert_inflight: session.prepare(INSERT_INFLIGHT).await.map_err(db_err)?,
            get_inflight: session.prepare(GET_INFLIGHT).await.map_err(db_err)?,
            read_expired_inflight: session
                .prepare(READ_EXPIRED_INFLIGHT)
                .await
                .map_err(db_err)?,
            delete_inflight: session.prepare(DELETE_INFLIGHT).await.map_err(db_err)?,
            insert_body: session.prepare(INSERT_BODY).await.map_err(db_err)?,
            get_body: session.prepare(GET_BODY).await.map_err(db_err)?,
            delete_body: session.prepare(DELETE_BODY).await.map_err(db_err)?,
        };

        info!(keyspace = %cfg.keyspace, nodes = cfg.nodes.len(), "scylla store ready");
        Ok(Self {
            session: Arc::new(session),
            ps,
        })
    }

    fn queue_from_row(
        (name, origin_region, regions, default_delay_ms, lease_seconds, max_redeliveries): (
            String,
            String,
            Vec<String>,
            i64,
            i32,
            i32,
        ),
    ) -> Queue {
        Queue {
            name,
            origin_region,
            regions,
            default_delay_ms: default_delay_ms.max(0) as u64,
            lease_seconds: lease_seconds.max(0) as u32,
            max_redeliveries: max_redeliveries.max(0) as u32,
        }
    }

    #[allow(clippy::type_complexity)]
    fn available_from_row(
        queue: &str,
        region: &str,
        shard_id: u32,
        (id, message_id, queued_at_ms, n_returned, expires_at_ms): (
            Uuid,
            Uuid,
            i64,
            i32,
            Option<i64>,
        ),
    ) -> QueueMessage {
        QueueMessage {
            queue: queue.to_string(),
            region: region.to_string(),
            shard_id,
            queue_message_id: TimeUuid::from(id),
            message_id,
            queued_at_ms: queued_at_ms.max(0) as u64,
            inflight_at_ms: None,
            n_returned: n_returned.max(0) as u32,
            expires_at_ms: expires_at_ms.map(|v| v.max(0) as u64),
        }
    }

    #[allow(clippy::type_complexity)]
    fn inflight_from_row(
        queue: &str,
        region: &str,
        shard_id: u32,
        (id, message_id, queued_at_ms, inflight_at_ms, n_returned, expires_at_ms): (
            Uuid,
            Uuid,
            i64,
            Option<i64>,
            i32,
            Option<i64>,
        ),
    ) -> QueueMessage {
        QueueMessage {
            queue: queue.to_string(),
            region: region.to_string(),
            shard_id,
            queue_message_id: TimeUuid::from(id),
            message_id,
            queued_at_ms: queued_at_ms.max(0) as u64,
            inflight_at_ms: inflight_at_ms.map(|v| v.max(0) as u64),
            n_returned: n_returned.max(0) as u32,
            expires_at_ms: expires_at_ms.map(|v| v.max(0) as u64),
        }
    }

    async fn drop_partition(
        &self,
        queue: &str,
        region: &str,
        shard_id: u32,
        list_ids: &str,
        delete_partition: &str,
    ) -> AppResult<()> {
        let ids = self
            .session
            .query(list_ids, (queue, region, shard_id as i32))
            .await
            .map_err(db_err)?
            .rows_typed_or_empty::<(Uuid,)>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        for (message_id,) in ids {
            self.delete_body(message_id).await?;
        }
        self.session
            .query(delete_partition, (queue, region, shard_id as i32))
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl QueueStore for ScyllaStore {
    async fn put_queue(&self, queue: &Queue) -> AppResult<()> {
        let applied = self
            .session
            .execute(
                &self.ps.insert_queue,
                (
                    queue.name.as_str(),
                    queue.origin_region.as_str(),
                    queue.regions.clone(),
                    queue.default_delay_ms as i64,
                    queue.lease_seconds as i32,
                    queue.max_redeliveries as i32,
                ),
            )
            .await
            .map_err(db_err)?
            .first_row_typed::<Applied>()
            .map_err(db_err)?;
        if !applied.0 {
            return Err(AppError::QueueAlreadyExists(queue.name.clone()));
        }
        Ok(())
    }

    async fn get_queue(&self, name: &str) -> AppResult<Option<Queue>> {
        self.session
            .execute(&self.ps.get_queue, (name,))
            .await
            .map_err(db_err)?
            .maybe_first_row_typed::<(String, String, Vec<String>, i64, i32, i32)>()
            .map_err(db_err)
            .map(|row| row.map(Self::queue_from_row))
    }

    async fn list_queues(&self) -> AppResult<Vec<Queue>> {
        let mut queues = self
            .session
            .query(LIST_QUEUES, &[])
            .await
            .map_err(db_err)?
            .rows_typed_or_empty::<(String, String, Vec<String>, i64, i32, i32)>()
            .map(|row| row.map(Self::queue_from_row))
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        queues.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(queues)
    }

    async fn delete_queue(&self, name: &str) -> AppResult<()> {
        let Some(queue) = self.get_queue(name).await? else {
            return Ok(());
        };

        for region in &queue.regions {
            for kind in ShardKind::BOTH {
                let shards = self.list_shards(name, region, kind).await?;
                for shard in &shards {
                    self.drop_partition(
                        name,
                        region,
                        shard.shard_id,
                        LIST_AVAILABLE_MESSAGE_IDS,
                        DELETE_AVAILABLE_PARTITION,
                    )
                    .await?;
                    self.drop_partition(
                        name,
                        region,
                        shard.shard_id,
                        LIST_INFLIGHT_MESSAGE_IDS,
                        DELETE_INFLIGHT_PARTITION,
                    )
                    .await?;
                    self.session
                        .query(
                            DELETE_COUNTER,
                            (name, region.as_str(), kind.as_str(), shard.shard_id as i32),
                        )
                        .await
                        .map_err(db_err)?;
                }
                self.session
                    .query(DELETE_SHARDS, (name, region.as_str(), kind.as_str()))
                    .await
                    .map_err(db_err)?;
            }
        }

        self.session
            .execute(&self.ps.delete_queue, (name,))
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn put_shard(&self, shard: &Shard) -> AppResult<()> {
        let applied = self
            .session
            .execute(
                &self.ps.insert_shard,
                (
                    shard.queue.as_str(),
                    shard.region.as_str(),
                    shard.kind.as_str(),
                    shard.shard_id as i32,
                    shard.pivot.as_uuid(),
                ),
            )
            .await
            .map_err(db_err)?
            .first_row_typed::<Applied>()
            .map_err(db_err)?;
        if !applied.0 {
            return Err(AppError::ShardExists {
                queue: shard.queue.clone(),
                shard_id: shard.shard_id,
            });
        }
        Ok(())
    }

    async fn list_shards(
        &self,
        queue: &str,
        region: &str,
        kind: ShardKind,
    ) -> AppResult<Vec<Shard>> {
        self.session
            .execute(&self.ps.list_shards, (queue, region, kind.as_str()))
            .await
            .map_err(db_err)?
            .rows_typed_or_empty::<(i32, Uuid)>()
            .map(|row| {
                row.map(|(shard_id, pivot)| Shard {
                    queue: queue.to_string(),
                    region: region.to_string(),
                    kind,
                    shard_id: shard_id.max(0) as u32,
                    pivot: TimeUuid::from(pivot),
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)
    }

    async fn add_to_counter(
        &self,
        queue: &str,
        region: &str,
        kind: ShardKind,
        shard_id: u32,
        delta: i64,
    ) -> AppResult<()> {
        self.session
            .execute(
                &self.ps.add_to_counter,
                (Counter(delta), queue, region, kind.as_str(), shard_id as i32),
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_counter(
        &self,
        queue: &str,
        region: &str,
        kind: ShardKind,
        shard_id: u32,
    ) -> AppResult<Option<i64>> {
        self.session
            .execute(
                &self.ps.get_counter,
                (queue, region, kind.as_str(), shard_id as i32),
            )
            .await
            .map_err(db_err)?
            .maybe_first_row_typed::<(Counter,)>()
            .map_err(db_err)
            .map(|row| row.map(|(c,)| c.0))
    }

    async fn put_available(&self, row: &QueueMessage) -> AppResult<()> {
        self.session
            .execute(
                &self.ps.insert_available,
                (
                    row.queue.as_str(),
                    row.region.as_str(),
                    row.shard_id as i32,
                    row.queue_message_id.unix_ms() as i64,
                    row.queue_message_id.as_uuid(),
                    row.message_id,
                    row.queued_at_ms as i64,
                    row.n_returned as i32,
                    row.expires_at_ms.map(|v| v as i64),
                ),
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn read_available(
        &self,
        queue: &str,
        region: &str,
        shard_id: u32,
        up_to_ms: u64,
        limit: usize,
    ) -> AppResult<Vec<QueueMessage>> {
        self.session
            .execute(
                &self.ps.read_available,
                (
                    queue,
                    region,
                    shard_id as i32,
                    up_to_ms as i64,
                    limit as i32,
                ),
            )
            .await
            .map_err(db_err)?
            .rows_typed_or_empty::<(Uuid, Uuid, i64, i32, Option<i64>)>()
            .map(|row| row.map(|r| Self::available_from_row(queue, region, shard_id, r)))
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)
    }

    async fn delete_available(
        &self,
        queue: &str,
        region: &str,
        shard_id: u32,
        id: TimeUuid,
    ) -> AppResult<bool> {
        let applied = self
            .session
            .execute(
                &self.ps.delete_available,
                (
                    queue,
                    region,
                    shard_id as i32,
                    id.unix_ms() as i64,
                    id.as_uuid(),
                ),
            )
            .await
            .map_err(db_err)?
            .first_row_typed::<Applied>()
            .map_err(db_err)?;
        Ok(applied.0)
    }

    async fn put_inflight(&self, row: &QueueMessage) -> AppResult<()> {
        self.session
            .execute(
                &self.ps.insert_inflight,
                (
                    row.queue.as_str(),
                    row.region.as_str(),
                    row.shard_id as i32,
                    row.queue_message_id.unix_ms() as i64,
                    row.queue_message_id.as_uuid(),
                    row.message_id,
                    row.queued_at_ms as i64,
                    row.inflight_at_ms.map(|v| v as i64),
                    row.n_returned as i32,
                    row.expires_at_ms.map(|v| v as i64),
                ),
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_inflight(
        &self,
        queue: &str,
        region: &str,
        shard_id: u32,
        id: TimeUuid,
    ) -> AppResult<Option<QueueMessage>> {
        self.session
            .execute(
                &self.ps.get_inflight,
                (
                    queue,
                    region,
                    shard_id as i32,
                    id.unix_ms() as i64,
                    id.as_uuid(),
                ),
            )
            .await
            .map_err(db_err)?
            .maybe_first_row_typed::<(Uuid, Uuid, i64, Option<i64>, i32, Option<i64>)>()
            .map_err(db_err)
            .map(|row| row.map(|r| Self::inflight_from_row(queue, region, shard_id, r)))
    }

    async fn read_expired_inflight(
        &self,
        queue: &str,
        region: &str,
        shard_id: u32,
        cutoff_ms: u64,
        limit: usize,
    ) -> AppResult<Vec<QueueMessage>> {
        self.session
            .execute(
                &self.ps.read_expired_inflight,
                (
                    queue,
                    region,
                    shard_id as i32,
                    cutoff_ms as i64,
                    limit as i32,
                ),
            )
            .await
            .map_err(db_err)?
            .rows_typed_or_empty::<(Uuid, Uuid, i64, Option<i64>, i32, Option<i64>)>()
            .map(|row| row.map(|r| Self::inflight_from_row(queue, region, shard_id, r)))
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)
    }

    async fn delete_inflight(
        &self,
        queue: &str,
        region: &str,
        shard_id: u32,
        id: TimeUuid,
    ) -> AppResult<bool> {
        let applied = self
            .session
            .execute(
                &self.ps.delete_inflight,
                (
                    queue,
                    region,
                    shard_id as i32,
                    id.unix_ms() as i64,
                    id.as_uuid(),
                ),
            )
            .await
            .map_err(db_err)?
            .first_row_typed::<Applied>()
            .map_err(db_err)?;
        Ok(applied.0)
    }

    async fn put_body(&self, body: &MessageBody) -> AppResult<()> {
        self.session
            .execute(
                &self.ps.insert_body,
                (
                    body.message_id,
                    body.blob.to_vec(),
                    body.content_type.as_str(),
                ),
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_body(&self, message_id: Uuid) -> AppResult<Option<MessageBody>> {
        self.session
            .execute(&self.ps.get_body, (message_id,))
            .await
            .map_err(db_err)?
            .maybe_first_row_typed::<(Vec<u8>, String)>()
            .map_err(db_err)
            .map(|row| row.map(|(blob, content_type)| MessageBody::new(message_id, blob, content_type)))
    }

    async fn delete_body(&self, message_id: Uuid) -> AppResult<()> {
        self.session
            .execute(&self.ps.delete_body, (message_id,))
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
