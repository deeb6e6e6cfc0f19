//! Thin client for the cascaded queue's consumer-side SQL surface.
//!
//! Tick management, batch accounting and node-role bookkeeping all live in
//! the `pgq` / `pgq_node` schemas on the participating databases; the
//! consumer only calls into them.

use chrono::{DateTime, Utc};
use tokio_postgres::GenericClient;
use tracing::debug;

use crate::event::Event;
use crate::QueueError;

/// One batch window of the event stream.
#[derive(Debug, Clone, Copy)]
pub struct BatchInfo {
    pub batch_id: i64,
    pub tick_id: i64,
    pub prev_tick_id: i64,
    pub batch_end: DateTime<Utc>,
}

/// Role of a node in the cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Root,
    Branch,
    Leaf,
}

impl NodeType {
    fn parse(s: &str) -> Result<NodeType, QueueError> {
        match s {
            "root" => Ok(NodeType::Root),
            "branch" => Ok(NodeType::Branch),
            "leaf" => Ok(NodeType::Leaf),
            other => Err(QueueError::Protocol(format!("unknown node type: {other}"))),
        }
    }
}

/// Node metadata from `pgq_node.get_node_info()`.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub node_name: String,
    pub node_type: NodeType,
    pub provider_node: Option<String>,
    pub provider_location: Option<String>,
    pub worker_name: Option<String>,
}

impl NodeInfo {
    pub async fn load<C: GenericClient>(db: &C, queue_name: &str) -> Result<NodeInfo, QueueError> {
        let row = db
            .query_one("select * from pgq_node.get_node_info($1)", &[&queue_name])
            .await?;
        let ret_code: i32 = row.try_get("ret_code")?;
        if ret_code >= 400 {
            let note: Option<String> = row.try_get("ret_note").ok();
            return Err(QueueError::Protocol(format!(
                "node lookup failed for queue {queue_name}: {}",
                note.unwrap_or_else(|| ret_code.to_string())
            )));
        }
        Ok(NodeInfo {
            node_name: row.try_get("node_name")?,
            node_type: NodeType::parse(row.try_get::<_, String>("node_type")?.as_str())?,
            provider_node: row.try_get("provider_node")?,
            provider_location: row.try_get("provider_location")?,
            worker_name: row.try_get("worker_name")?,
        })
    }
}

/// A registered consumer on one cascaded queue.
///
/// `pgq_min_count` / `pgq_min_interval` control batch accumulation; the
/// replay worker clears them temporarily while a table sync hand-off is
/// pending.  `consumer_filter` is an SQL boolean over the event columns,
/// applied server side.
#[derive(Debug, Clone)]
pub struct CascadedConsumer {
    pub queue_name: String,
    pub consumer_name: String,
    pub pgq_min_count: Option<i32>,
    pub pgq_min_interval: Option<String>,
    pub consumer_filter: Option<String>,
}

impl CascadedConsumer {
    pub fn new(queue_name: &str, consumer_name: &str) -> CascadedConsumer {
        CascadedConsumer {
            queue_name: queue_name.to_owned(),
            consumer_name: consumer_name.to_owned(),
            pgq_min_count: None,
            pgq_min_interval: None,
            consumer_filter: None,
        }
    }

    /// Register at the queue's current position.
    pub async fn register<C: GenericClient>(&self, db: &C) -> Result<(), QueueError> {
        db.execute(
            "select pgq.register_consumer($1, $2)",
            &[&self.queue_name, &self.consumer_name],
        )
        .await?;
        Ok(())
    }

    /// Register at a known tick, used by the copy worker to rejoin the
    /// stream at the point its snapshot was taken.
    pub async fn register_at<C: GenericClient>(
        &self,
        db: &C,
        tick_id: i64,
    ) -> Result<(), QueueError> {
        db.execute(
            "select pgq.register_consumer_at($1, $2, $3)",
            &[&self.queue_name, &self.consumer_name, &tick_id],
        )
        .await?;
        Ok(())
    }

    pub async fn unregister<C: GenericClient>(&self, db: &C) -> Result<(), QueueError> {
        db.execute(
            "select pgq.unregister_consumer($1, $2)",
            &[&self.queue_name, &self.consumer_name],
        )
        .await?;
        Ok(())
    }

    /// Ask for the next batch; `None` means the consumer is caught up.
    pub async fn next_batch<C: GenericClient>(
        &self,
        db: &C,
    ) -> Result<Option<BatchInfo>, QueueError> {
        let row = db
            .query_one(
                "select pgq.next_batch_custom($1, $2, NULL, $3, ($4::text)::interval) as batch_id",
                &[
                    &self.queue_name,
                    &self.consumer_name,
                    &self.pgq_min_count,
                    &self.pgq_min_interval,
                ],
            )
            .await?;
        let batch_id: Option<i64> = row.try_get("batch_id")?;
        let Some(batch_id) = batch_id else {
            return Ok(None);
        };

        let info = db
            .query_one(
                "select tick_id, prev_tick_id, batch_end from pgq.get_batch_info($1)",
                &[&batch_id],
            )
            .await?;
        let batch = BatchInfo {
            batch_id,
            tick_id: info.try_get("tick_id")?,
            prev_tick_id: info.try_get("prev_tick_id")?,
            batch_end: info.try_get("batch_end")?,
        };
        debug!(
            batch_id,
            tick_id = batch.tick_id,
            prev_tick_id = batch.prev_tick_id,
            "got batch"
        );
        Ok(Some(batch))
    }

    /// Fetch the batch's events in event-id order, with the server-side
    /// filter applied when one is configured.
    pub async fn batch_events<C: GenericClient>(
        &self,
        db: &C,
        batch_id: i64,
    ) -> Result<Vec<Event>, QueueError> {
        let base = "select ev_id, ev_time, ev_txid, ev_retry, ev_type, ev_data, \
                    ev_extra1, ev_extra2, ev_extra3, ev_extra4 \
                    from pgq.get_batch_events($1)";
        let sql = match &self.consumer_filter {
            Some(filter) => format!("{base} where ({filter}) order by ev_id"),
            None => format!("{base} order by ev_id"),
        };
        let rows = db.query(&sql, &[&batch_id]).await?;
        rows.iter().map(Event::from_row).collect()
    }

    pub async fn finish_batch<C: GenericClient>(
        &self,
        db: &C,
        batch_id: i64,
    ) -> Result<(), QueueError> {
        db.execute("select pgq.finish_batch($1)", &[&batch_id]).await?;
        Ok(())
    }

    /// Record on the local node how far this worker has applied.  Called
    /// inside the batch transaction so position and data commit together.
    pub async fn set_completed<C: GenericClient>(
        &self,
        dst: &C,
        tick_id: i64,
    ) -> Result<(), QueueError> {
        dst.execute(
            "select pgq_node.set_consumer_completed($1, $2, $3)",
            &[&self.queue_name, &self.consumer_name, &tick_id],
        )
        .await?;
        Ok(())
    }

    /// Re-insert an event into a local queue (leaf forwarding, qsplitter).
    pub async fn insert_event<C: GenericClient>(
        &self,
        db: &C,
        queue_name: &str,
        ev: &Event,
    ) -> Result<(), QueueError> {
        db.execute(
            "select pgq.insert_event($1, $2, $3, $4, $5, $6, $7)",
            &[
                &queue_name,
                &ev.ev_type,
                &ev.data,
                &ev.extra1,
                &ev.extra2,
                &ev.extra3,
                &ev.extra4,
            ],
        )
        .await?;
        Ok(())
    }
}
