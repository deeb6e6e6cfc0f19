//! Offline table checking: a lock-and-wait sync primitive with compare and
//! repair built on top.
//!
//! The syncer briefly locks the table on the provider so its triggers stop
//! emitting, forces a tick, waits until the subscriber worker has applied
//! past that tick, and only then lets the check run.  At that point the two
//! sides are guaranteed to frame the same data.

pub mod compare;
pub mod repair;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tokio_postgres::Client;
use tracing::{debug, info};

use cartage_core::Config;
use cartage_handlers::{Handler, HandlerError, HandlerRegistry};
use cartage_queue::copydata::connect_database;
use cartage_queue::{NodeInfo, QueueError};
use cartage_util::{db_urldecode, fq_name, quote_fqident};

/// Exit code used when compare finds a difference.
pub const EXIT_MISMATCH: i32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("database error: {0}")]
    Db(#[from] tokio_postgres::Error),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error(transparent)]
    Worker(#[from] cartage_core::WorkerError),

    #[error(transparent)]
    Parse(#[from] cartage_util::ParseError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Structural(String),

    #[error("usage error: {0}")]
    Usage(String),
}

/// Info about one replicated table on one node.
pub struct SyncTable {
    pub table_name: String,
    pub dest_table: String,
    pub merge_state: Option<String>,
    pub plugin: Box<dyn Handler>,
}

/// Load a single table's info from `get_table_list`.
async fn load_sync_table(
    db: &Client,
    queue: &str,
    registry: &HandlerRegistry,
    name: &str,
) -> Result<Option<SyncTable>, SyncError> {
    let rows = db
        .query(
            "select table_name, local, merge_state, table_attrs, \
             coalesce(dest_table, table_name) as dest_table \
             from cartage.get_table_list($1) where table_name = $2",
            &[&queue, &name],
        )
        .await?;
    let Some(row) = rows.first() else {
        return Ok(None);
    };
    let local: bool = row.try_get("local")?;
    if !local {
        return Ok(None);
    }
    let table_name: String = row.try_get("table_name")?;
    let dest_table: String = row.try_get("dest_table")?;
    let attrs: Option<String> = row.try_get("table_attrs")?;
    let hstr = match attrs.as_deref() {
        Some(a) if !a.is_empty() => db_urldecode(a)?
            .get("handler")
            .cloned()
            .flatten()
            .unwrap_or_default(),
        _ => String::new(),
    };
    let plugin = registry.build(&table_name, &hstr, Some(&dest_table))?;
    Ok(Some(SyncTable {
        table_name,
        dest_table,
        merge_state: row.try_get("merge_state")?,
        plugin,
    }))
}

/// The check run once both sides frame the same data.  Returns an exit
/// code; the largest one across tables becomes the process exit code.
#[async_trait]
pub trait SyncRunner {
    async fn process_sync(
        &mut self,
        cf: &Config,
        src_info: &mut SyncTable,
        dst_info: &mut SyncTable,
        src: &mut Client,
        dst: &mut Client,
    ) -> Result<i32, SyncError>;
}

pub struct Syncer {
    pub cf: Config,
    registry: HandlerRegistry,
    /// Tolerate tables that are not in `ok` state.
    pub force: bool,
}

impl Syncer {
    pub fn new(cf: Config) -> Result<Syncer, SyncError> {
        let registry = HandlerRegistry::new(cf.handler_context()?);
        Ok(Syncer {
            cf,
            registry,
            force: false,
        })
    }

    /// Check the given tables one by one; empty list means all local
    /// tables.
    pub async fn run(
        &mut self,
        tables: &[String],
        runner: &mut dyn SyncRunner,
    ) -> Result<i32, SyncError> {
        let dst = connect_database(&self.cf.db).await?;
        let node = NodeInfo::load(&dst, &self.cf.queue_name).await?;
        let provider = node.provider_location.clone().ok_or_else(|| {
            SyncError::Usage(format!("node {} has no provider", node.node_name))
        })?;
        let worker = node
            .worker_name
            .clone()
            .unwrap_or_else(|| self.cf.job_name.clone());

        let tables = if tables.is_empty() {
            let rows = dst
                .query(
                    "select table_name from cartage.get_table_list($1) where local \
                     order by table_name",
                    &[&self.cf.queue_name],
                )
                .await?;
            rows.iter().map(|r| r.get(0)).collect()
        } else {
            tables.iter().map(|t| fq_name(t)).collect::<Vec<String>>()
        };

        let mut src = connect_database(&provider).await?;
        let mut lock_db = connect_database(&provider).await?;
        let mut dst = dst;
        let mut worst = 0;

        for name in tables {
            let code = self
                .check_table(&name, &worker, &mut src, &mut lock_db, &mut dst, runner)
                .await?;
            worst = worst.max(code);
        }
        Ok(worst)
    }

    async fn check_table(
        &mut self,
        name: &str,
        worker: &str,
        src: &mut Client,
        lock_db: &mut Client,
        dst: &mut Client,
        runner: &mut dyn SyncRunner,
    ) -> Result<i32, SyncError> {
        let mut dst_info = load_sync_table(dst, &self.cf.queue_name, &self.registry, name)
            .await?
            .ok_or_else(|| SyncError::Usage(format!("table {name} not local on this node")))?;
        let mut src_info = load_sync_table(src, &self.cf.queue_name, &self.registry, name)
            .await?
            .ok_or_else(|| SyncError::Usage(format!("table {name} not found on provider")))?;

        if dst_info.merge_state.as_deref() != Some("ok") && !self.force {
            return Err(SyncError::Usage(format!(
                "table {name} is not in sync yet (state: {:?})",
                dst_info.merge_state
            )));
        }

        // stop the provider-side triggers from emitting for this table
        info!(table = name, "locking table on provider");
        let lock_tx = lock_db.transaction().await?;
        let timeout_ms = (self.cf.lock_timeout * 1000.0) as i64;
        if timeout_ms > 0 {
            lock_tx
                .batch_execute(&format!("SET LOCAL statement_timeout = {timeout_ms}"))
                .await?;
        }
        lock_tx
            .batch_execute(&format!(
                "lock table {} in share mode",
                quote_fqident(&src_info.dest_table)
            ))
            .await?;

        // force a tick and wait until the worker has applied past it
        let tick_row = src
            .query_one("select pgq.ticker($1) as tick", &[&self.cf.queue_name])
            .await?;
        let tick: i64 = tick_row.try_get("tick")?;
        info!(table = name, tick, "waiting for subscriber to reach tick");
        loop {
            let row = src
                .query_opt(
                    "select last_tick from pgq.get_consumer_info($1, $2)",
                    &[&self.cf.queue_name, &worker.to_owned()],
                )
                .await?;
            let last_tick: Option<i64> = match row {
                Some(row) => row.try_get("last_tick")?,
                None => {
                    return Err(SyncError::Usage(format!(
                        "worker {worker} is not registered on the queue"
                    )))
                }
            };
            if last_tick.is_some_and(|t| t >= tick) {
                break;
            }
            debug!(table = name, tick, ?last_tick, "still behind");
            sleep(Duration::from_millis(500)).await;
        }

        let code = runner
            .process_sync(&self.cf, &mut src_info, &mut dst_info, src, dst)
            .await?;

        lock_tx.rollback().await?;
        Ok(code)
    }
}
