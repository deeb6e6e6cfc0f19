//! Event filtering by hash, for horizontally partitioned databases.
//!
//! On the root node the table trigger is told to put `hash=<int>` of the key
//! column into `ev_extra3`.  On branch and leaf nodes the replay stream and
//! the initial COPY are both filtered down to rows whose
//! `hash & shard_mask == shard_nr`, with the local shard layout loaded from
//! the database once per batch.
//!
//! Arguments:
//!   key=COLUMN           - column to hash
//!   hash_key=COLUMN      - same, overrides `key`
//!   hash_expr=EXPR       - full hash expression override
//!   encoding=ENC         - rejected, no encoding validation support
//!   ignore_truncate=BOOL - skip truncate events, default 0
//!   disable_replay=BOOL  - no replay to table, just event forwarding

use async_trait::async_trait;
use tokio_postgres::Transaction;
use tracing::debug;

use cartage_queue::copydata::CopyStats;
use cartage_queue::{BatchInfo, Event};
use cartage_util::{db_urldecode, quote_fqident, quote_ident};

use crate::args::HandlerArgs;
use crate::table::{reject_encoding_arg, TableApplier};
use crate::{HandlerContext, HandlerError, SqlQueue};

const DEFAULT_HASH_FUNC: &str = "partconf.get_hash_raw";
const DEFAULT_INFO_SQL: &str = "select shard_nr, shard_mask, shard_count from partconf.conf";

/// Local shard layout.
#[derive(Debug, Clone, Copy)]
pub struct ShardInfo {
    pub shard_nr: i64,
    pub shard_mask: i64,
}

/// Hash filter shared by the shard handler and the dispatcher.
#[derive(Debug, Clone)]
pub struct ShardFilter {
    pub hash_key: String,
    pub hash_expr: String,
    info_sql: String,
    info: Option<ShardInfo>,
}

impl ShardFilter {
    /// Build from handler args.  `None` when no hash key was configured,
    /// which only the dispatcher treats as acceptable.
    pub fn from_args(
        args: &HandlerArgs,
        ctx: &HandlerContext,
    ) -> Result<Option<ShardFilter>, HandlerError> {
        let hash_key = args.get("hash_key").or_else(|| args.get("key"));
        let Some(hash_key) = hash_key else {
            return Ok(None);
        };
        let hash_func = ctx
            .shard_hash_func
            .clone()
            .unwrap_or_else(|| DEFAULT_HASH_FUNC.to_owned());
        let hash_expr = match args.get("hash_expr") {
            Some(expr) => expr.to_owned(),
            None => format!("{}({})", quote_fqident(&hash_func), quote_ident(hash_key)),
        };
        Ok(Some(ShardFilter {
            hash_key: hash_key.to_owned(),
            hash_expr,
            info_sql: ctx
                .shard_info_sql
                .clone()
                .unwrap_or_else(|| DEFAULT_INFO_SQL.to_owned()),
            info: None,
        }))
    }

    /// Trigger argument that makes the provider compute the hash.
    pub fn trigger_arg(&self) -> String {
        format!("ev_extra3='hash='||{}", self.hash_expr)
    }

    /// Load `(shard_nr, shard_mask, shard_count)` once; later calls reuse
    /// the cached values until `clear()`.
    pub async fn load(&mut self, db: &Transaction<'_>) -> Result<ShardInfo, HandlerError> {
        if let Some(info) = self.info {
            return Ok(info);
        }
        let row = db.query_one(&self.info_sql, &[]).await?;
        let shard_nr: Option<i64> = row.try_get(0)?;
        let shard_mask: Option<i64> = row.try_get(1)?;
        let shard_count: Option<i64> = row.try_get(2)?;
        let (Some(shard_nr), Some(shard_mask), Some(shard_count)) =
            (shard_nr, shard_mask, shard_count)
        else {
            return Err(HandlerError::Config("error loading shard info".to_owned()));
        };
        if shard_count & shard_mask != 0 || shard_mask + 1 != shard_count {
            return Err(HandlerError::Config(format!(
                "invalid shard info: mask={shard_mask} count={shard_count}"
            )));
        }
        if shard_nr < 0 || shard_nr >= shard_count {
            return Err(HandlerError::Config(format!(
                "invalid shard nr: {shard_nr} of {shard_count}"
            )));
        }
        let info = ShardInfo {
            shard_nr,
            shard_mask,
        };
        self.info = Some(info);
        Ok(info)
    }

    pub fn clear(&mut self) {
        self.info = None;
    }

    /// Does the event's `extra3` hash land on the local shard?
    pub fn is_local_event(&self, ev: &Event) -> Result<bool, HandlerError> {
        let info = self.info.ok_or_else(|| {
            HandlerError::Event("shard info not loaded before event".to_owned())
        })?;
        let extra3 = ev.extra3.as_deref().ok_or_else(|| {
            HandlerError::Event(format!("shard event {} without extra3", ev.id))
        })?;
        let meta = db_urldecode(extra3)?;
        let hash = meta
            .get("hash")
            .cloned()
            .flatten()
            .and_then(|h| h.parse::<i64>().ok())
            .ok_or_else(|| {
                HandlerError::Event(format!("shard event {} extra3 has no hash= token", ev.id))
            })?;
        let is_local = (hash & info.shard_mask) == info.shard_nr;
        debug!(
            hash,
            shard_nr = info.shard_nr,
            shard_mask = info.shard_mask,
            is_local,
            "shard filter"
        );
        Ok(is_local)
    }

    /// WHERE fragment of the same shape, for COPY and repair.
    pub fn copy_condition(&self) -> Result<String, HandlerError> {
        let info = self.info.ok_or_else(|| {
            HandlerError::Event("shard info not loaded for copy condition".to_owned())
        })?;
        Ok(format!(
            "({} & {}) = {}",
            self.hash_expr, info.shard_mask, info.shard_nr
        ))
    }
}

pub struct ShardHandler {
    applier: TableApplier,
    filter: ShardFilter,
    disable_replay: bool,
    ignore_truncate: bool,
}

const SHARD_ARGS: &[&str] = &[
    "key",
    "hash_key",
    "hash_expr",
    "encoding",
    "ignore_truncate",
    "disable_replay",
];

impl ShardHandler {
    pub fn build(
        table_name: &str,
        args: &HandlerArgs,
        dest_table: &str,
        ctx: &HandlerContext,
    ) -> Result<ShardHandler, HandlerError> {
        args.validate(SHARD_ARGS)?;
        reject_encoding_arg(args)?;
        let filter = ShardFilter::from_args(args, ctx)?.ok_or_else(|| {
            HandlerError::Config("specify hash key field as hash_key argument".to_owned())
        })?;
        Ok(ShardHandler {
            applier: TableApplier::new(table_name, dest_table),
            filter,
            disable_replay: args.get_bool("disable_replay", false)?,
            ignore_truncate: args.get_bool("ignore_truncate", false)?,
        })
    }
}

#[async_trait]
impl crate::Handler for ShardHandler {
    fn handler_name(&self) -> &'static str {
        "shard"
    }

    fn dest_table(&self) -> &str {
        &self.applier.dest_table
    }

    fn add_trigger_args(&self, args: &mut Vec<String>) {
        args.push(self.filter.trigger_arg());
    }

    fn needs_table(&self) -> bool {
        !self.disable_replay
    }

    fn ignore_truncate(&self) -> bool {
        self.ignore_truncate
    }

    async fn prepare_batch(
        &mut self,
        _batch: Option<&BatchInfo>,
        dst: &Transaction<'_>,
    ) -> Result<(), HandlerError> {
        self.filter.load(dst).await?;
        Ok(())
    }

    async fn process_event(
        &mut self,
        ev: &Event,
        sql: &mut SqlQueue,
        dst: &Transaction<'_>,
    ) -> Result<(), HandlerError> {
        if self.disable_replay {
            return Ok(());
        }
        if !self.filter.is_local_event(ev)? {
            return Ok(());
        }
        let stmt = self.applier.event_sql(ev, true)?;
        sql.push(stmt, dst).await
    }

    async fn get_copy_condition(
        &mut self,
        _src: &Transaction<'_>,
        dst: &Transaction<'_>,
    ) -> Result<String, HandlerError> {
        self.filter.load(dst).await?;
        self.filter.copy_condition()
    }

    async fn real_copy(
        &mut self,
        src_table: &str,
        src: &Transaction<'_>,
        dst: &Transaction<'_>,
        columns: &[String],
    ) -> Result<CopyStats, HandlerError> {
        if self.disable_replay {
            return Ok(CopyStats::default());
        }
        let condition = self.get_copy_condition(src, dst).await?;
        let mut spec = cartage_queue::copydata::CopySpec::new(src_table, self.dest_table(), columns);
        spec.condition = Some(condition);
        Ok(cartage_queue::copydata::full_copy(src, dst, &spec, None).await?)
    }

    async fn real_copy_threaded(
        &mut self,
        src_table: &str,
        src: &Transaction<'_>,
        dst: &Transaction<'_>,
        dst_connstr: &str,
        columns: &[String],
        parallel: usize,
        session_setup: &[String],
    ) -> Result<CopyStats, HandlerError> {
        if self.disable_replay {
            return Ok(CopyStats::default());
        }
        let condition = self.get_copy_condition(src, dst).await?;
        let mut spec = cartage_queue::copydata::CopySpec::new(src_table, self.dest_table(), columns);
        spec.condition = Some(condition);
        Ok(cartage_queue::copydata::full_copy_parallel(
            src,
            dst_connstr,
            &spec,
            parallel,
            session_setup,
            None,
        )
        .await?)
    }

    fn get_copy_event(
        &mut self,
        ev: Event,
        _queue_name: &str,
    ) -> Result<Option<Event>, HandlerError> {
        if self.filter.is_local_event(&ev)? {
            Ok(Some(ev))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn filter_with_info(nr: i64, mask: i64) -> ShardFilter {
        ShardFilter {
            hash_key: "id".to_owned(),
            hash_expr: "partconf.get_hash_raw(id)".to_owned(),
            info_sql: DEFAULT_INFO_SQL.to_owned(),
            info: Some(ShardInfo {
                shard_nr: nr,
                shard_mask: mask,
            }),
        }
    }

    fn shard_event(hash: i64) -> Event {
        Event {
            id: 10,
            ev_type: "I:id".to_owned(),
            data: Some("id=1".to_owned()),
            extra1: Some("public.t".to_owned()),
            extra2: None,
            extra3: Some(format!("hash={hash}")),
            extra4: None,
            time: Utc::now(),
            txid: Some(5),
            retry: None,
        }
    }

    #[test]
    fn local_shard_math() {
        let f = filter_with_info(0, 1);
        assert!(f.is_local_event(&shard_event(4)).unwrap());
        assert!(!f.is_local_event(&shard_event(5)).unwrap());

        let f = filter_with_info(3, 3);
        assert!(f.is_local_event(&shard_event(7)).unwrap());
        assert!(!f.is_local_event(&shard_event(8)).unwrap());
    }

    #[test]
    fn missing_hash_token_is_error() {
        let f = filter_with_info(0, 1);
        let mut ev = shard_event(1);
        ev.extra3 = None;
        assert!(f.is_local_event(&ev).is_err());
        let mut ev = shard_event(1);
        ev.extra3 = Some("other=1".to_owned());
        assert!(f.is_local_event(&ev).is_err());
    }

    #[test]
    fn copy_condition_shape() {
        let f = filter_with_info(2, 3);
        assert_eq!(
            f.copy_condition().unwrap(),
            "(partconf.get_hash_raw(id) & 3) = 2"
        );
    }

    #[test]
    fn trigger_arg_shape() {
        let f = filter_with_info(0, 1);
        assert_eq!(
            f.trigger_arg(),
            "ev_extra3='hash='||partconf.get_hash_raw(id)"
        );
    }

    #[test]
    fn hash_key_required() {
        let ctx = HandlerContext::default();
        let args = HandlerArgs::default();
        assert!(ShardHandler::build("public.t", &args, "public.t", &ctx).is_err());
    }
}
