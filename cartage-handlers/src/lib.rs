//! Per-table transform plugins.
//!
//! Each replicated table is bound to one handler which decides how trigger
//! arguments look on the provider, how replayed events turn into SQL on the
//! subscriber, and how the initial COPY is filtered or rewritten.  Handlers
//! are looked up by name through [`HandlerRegistry`]; handler strings have
//! the form `name` or `name(arg1=v1&arg2=v2)`.

pub mod applyfn;
pub mod args;
pub mod dispatch;
pub mod obfuscate;
pub mod queue_table;
pub mod shard;
pub mod table;
pub mod vtable;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_postgres::Transaction;

use cartage_queue::copydata::{full_copy, full_copy_parallel, CopySpec, CopyStats};
use cartage_queue::{BatchInfo, Event, QueueError};
use cartage_util::{db_urldecode, db_urlencode};

use crate::args::HandlerArgs;
use crate::obfuscate::ObfuscationMap;

/// Handler failures.  Configuration problems are fatal at build time; event
/// problems carry enough context to identify the offending row.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("unknown handler: {0}")]
    UnknownHandler(String),

    #[error("handler configuration error: {0}")]
    Config(String),

    #[error("bad event: {0}")]
    Event(String),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("database error: {0}")]
    Db(#[from] tokio_postgres::Error),

    #[error(transparent)]
    Parse(#[from] cartage_util::ParseError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Buffered SQL statements applied to the subscriber.
///
/// Statements are batched into a single `execute()` round-trip for
/// throughput; the replay worker drops the limit to one statement while
/// isolating a failing event.
pub struct SqlQueue {
    buf: Vec<String>,
    limit: usize,
}

/// Statements batched per round-trip during normal replay.
pub const SQL_QUEUE_LIMIT: usize = 200;

impl SqlQueue {
    pub fn new(limit: usize) -> SqlQueue {
        SqlQueue {
            buf: Vec::new(),
            limit,
        }
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    pub async fn push(&mut self, sql: String, dst: &Transaction<'_>) -> Result<(), HandlerError> {
        self.buf.push(sql);
        if self.buf.len() >= self.limit.max(1) {
            self.flush(dst).await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self, dst: &Transaction<'_>) -> Result<(), HandlerError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let joined = self.buf.join("\n");
        self.buf.clear();
        dst.batch_execute(&joined).await?;
        Ok(())
    }
}

/// The per-table transform contract.
#[async_trait]
pub trait Handler: Send {
    fn handler_name(&self) -> &'static str;

    fn dest_table(&self) -> &str;

    /// Mutate the trigger argument list used when registering the table
    /// upstream.
    fn add_trigger_args(&self, _args: &mut Vec<String>) {}

    /// Drop any per-batch state.
    fn reset(&mut self) {}

    /// Does the destination table have to physically exist?
    fn needs_table(&self) -> bool {
        true
    }

    fn ignore_truncate(&self) -> bool {
        false
    }

    /// Called on the first event touching this table in a batch.
    async fn prepare_batch(
        &mut self,
        _batch: Option<&BatchInfo>,
        _dst: &Transaction<'_>,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Transform one event, emitting SQL into `sql` or buffering it for
    /// `finish_batch`.
    async fn process_event(
        &mut self,
        ev: &Event,
        sql: &mut SqlQueue,
        dst: &Transaction<'_>,
    ) -> Result<(), HandlerError>;

    /// Flush buffered per-batch state to the subscriber.
    async fn finish_batch(
        &mut self,
        _batch: &BatchInfo,
        _dst: &Transaction<'_>,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    /// WHERE fragment filtering both COPY and live replay, empty for none.
    async fn get_copy_condition(
        &mut self,
        _src: &Transaction<'_>,
        _dst: &Transaction<'_>,
    ) -> Result<String, HandlerError> {
        Ok(String::new())
    }

    /// Single-stream bulk copy of the table.
    async fn real_copy(
        &mut self,
        src_table: &str,
        src: &Transaction<'_>,
        dst: &Transaction<'_>,
        columns: &[String],
    ) -> Result<CopyStats, HandlerError> {
        let condition = self.get_copy_condition(src, dst).await?;
        let mut spec = CopySpec::new(src_table, self.dest_table(), columns);
        if !condition.is_empty() {
            spec.condition = Some(condition);
        }
        Ok(full_copy(src, dst, &spec, None).await?)
    }

    /// Fan-out bulk copy over `parallel` inserter connections.
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
        let condition = self.get_copy_condition(src, dst).await?;
        let mut spec = CopySpec::new(src_table, self.dest_table(), columns);
        if !condition.is_empty() {
            spec.condition = Some(condition);
        }
        Ok(full_copy_parallel(src, dst_connstr, &spec, parallel, session_setup, None).await?)
    }

    /// Transform or drop an event forwarded to this node's own queue.
    /// `None` drops it.
    fn get_copy_event(
        &mut self,
        ev: Event,
        _queue_name: &str,
    ) -> Result<Option<Event>, HandlerError> {
        Ok(Some(ev))
    }
}

/// Shared context passed to handler construction: configuration the
/// concrete handlers need that is not part of the handler string.
#[derive(Debug, Clone, Default)]
pub struct HandlerContext {
    /// Hash function for the shard handler's default hash expression.
    pub shard_hash_func: Option<String>,
    /// Query returning `(shard_nr, shard_mask, shard_count)`.
    pub shard_info_sql: Option<String>,
    /// Keyed-hash key for the obfuscator.
    pub obfuscator_key: Vec<u8>,
    /// Obfuscation rules, keyed by source table.
    pub obfuscator_map: Option<ObfuscationMap>,
}

/// Name → factory mapping for handlers.
#[derive(Clone)]
pub struct HandlerRegistry {
    ctx: Arc<HandlerContext>,
}

impl HandlerRegistry {
    pub fn new(ctx: HandlerContext) -> HandlerRegistry {
        HandlerRegistry { ctx: Arc::new(ctx) }
    }

    /// Parse a handler string and build the handler for one table.
    pub fn build(
        &self,
        table_name: &str,
        hstr: &str,
        dest_table: Option<&str>,
    ) -> Result<Box<dyn Handler>, HandlerError> {
        let (name, args) = parse_handler_string(hstr)?;
        let args = HandlerArgs::new(args);
        let name = if name.is_empty() { "cartage" } else { &name };
        let dest = dest_table.unwrap_or(table_name);

        match name {
            "cartage" => Ok(Box::new(table::TableHandler::build(
                table_name, &args, dest,
            )?)),
            "shard" | "part" => Ok(Box::new(shard::ShardHandler::build(
                table_name, &args, dest, &self.ctx,
            )?)),
            "qtable" => Ok(Box::new(queue_table::QueueTableHandler::build(
                table_name, &args, dest,
            )?)),
            "qsplitter" => Ok(Box::new(queue_table::QueueSplitterHandler::build(
                table_name, &args, dest,
            )?)),
            "vtable" | "fake_local" => Ok(Box::new(vtable::VirtualTableHandler::build(
                table_name, &args, dest,
            )?)),
            "applyfn" => Ok(Box::new(applyfn::ApplyFuncHandler::build(
                table_name, &args, dest,
            )?)),
            "multimaster" => Ok(Box::new(applyfn::ApplyFuncHandler::build_multimaster(
                table_name, &args, dest,
            )?)),
            "obfuscate" => Ok(Box::new(obfuscate::Obfuscator::build(
                table_name, &args, dest, &self.ctx,
            )?)),
            other => match dispatch::preset_args(other) {
                Some(preset) => Ok(Box::new(dispatch::Dispatcher::build(
                    table_name,
                    &args.with_defaults(&preset),
                    dest,
                    &self.ctx,
                )?)),
                None => Err(HandlerError::UnknownHandler(other.to_owned())),
            },
        }
    }

    /// Decide if a table can serve as a copy source, from its attrs alone.
    pub fn handler_allows_copy(&self, table_attrs: Option<&str>) -> Result<bool, HandlerError> {
        let Some(attrs) = table_attrs else {
            return Ok(true);
        };
        if attrs.is_empty() {
            return Ok(true);
        }
        let attrs = db_urldecode(attrs)?;
        let hstr = attrs
            .get("handler")
            .cloned()
            .flatten()
            .unwrap_or_default();
        let handler = self.build("unused.string", &hstr, None)?;
        Ok(handler.needs_table())
    }

    /// All registered handler names with one-line summaries.
    pub fn list(&self) -> Vec<(String, &'static str)> {
        let mut out = vec![
            ("cartage".to_owned(), "default handler, applies events as plain SQL"),
            ("shard".to_owned(), "event filtering by hash, for partitioned databases"),
            ("part".to_owned(), "compat name for shard handler"),
            ("dispatch".to_owned(), "partitioned loader, routes rows to child tables"),
            ("qtable".to_owned(), "queue table setup, all events ignored"),
            ("qsplitter".to_owned(), "copy events for one table into another queue"),
            ("vtable".to_owned(), "virtual table, registers without processing events"),
            ("fake_local".to_owned(), "compat name for vtable"),
            ("applyfn".to_owned(), "send all events to a database function"),
            ("multimaster".to_owned(), "merge-on-time apply for multi-master replicas"),
            ("obfuscate".to_owned(), "keyed-hash obfuscation of replicated data"),
        ];
        for name in dispatch::PRESET_NAMES {
            out.push(((*name).to_owned(), "dispatch preset with fixed partitioning args"));
        }
        out
    }
}

/// Split `name(args)` into name and argument map.
pub fn parse_handler_string(
    hstr: &str,
) -> Result<(String, indexmap::IndexMap<String, String>), HandlerError> {
    let mut args = indexmap::IndexMap::new();
    let Some(pos) = hstr.find('(') else {
        return Ok((hstr.to_owned(), args));
    };
    if !hstr.ends_with(')') {
        return Err(HandlerError::Config(format!(
            "invalid handler format: {hstr}"
        )));
    }
    let name = hstr[..pos].to_owned();
    let astr = &hstr[pos + 1..hstr.len() - 1];
    if !astr.is_empty() {
        // older strings used comma separators inside the parens
        let astr = astr.replace(',', "&");
        for (key, value) in db_urldecode(&astr)? {
            if let Some(value) = value {
                args.insert(key, value);
            }
        }
    }
    Ok((name, args))
}

/// Build a handler string from a name and `key=value` argument strings.
pub fn create_handler_string(name: &str, arglist: &[String]) -> Result<String, HandlerError> {
    if name.contains('(') {
        return Err(HandlerError::Config(format!("invalid handler name: {name}")));
    }
    if arglist.is_empty() {
        return Ok(name.to_owned());
    }
    let args = args::parse_arg_list(arglist)?;
    let astr = db_urlencode(args.iter().map(|(k, v)| (k.as_str(), Some(v.as_str()))));
    Ok(format!("{name}({astr})"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_string_roundtrip() {
        let hstr = create_handler_string(
            "shard",
            &["key=user_id".to_owned(), "disable_replay=1".to_owned()],
        )
        .unwrap();
        assert_eq!(hstr, "shard(key=user_id&disable_replay=1)");
        let (name, args) = parse_handler_string(&hstr).unwrap();
        assert_eq!(name, "shard");
        assert_eq!(args["key"], "user_id");
        assert_eq!(args["disable_replay"], "1");
    }

    #[test]
    fn bare_name_and_errors() {
        let (name, args) = parse_handler_string("qtable").unwrap();
        assert_eq!(name, "qtable");
        assert!(args.is_empty());
        assert!(parse_handler_string("x(oops").is_err());
        assert!(create_handler_string("a(b)", &[]).is_err());
    }

    #[test]
    fn registry_builds_known_handlers() {
        let reg = HandlerRegistry::new(HandlerContext::default());
        assert!(reg.build("public.t", "", None).is_ok());
        assert!(reg.build("public.t", "cartage", None).is_ok());
        assert!(reg.build("public.t", "vtable", None).is_ok());
        assert!(reg.build("public.t", "shard(key=id)", None).is_ok());
        assert!(matches!(
            reg.build("public.t", "nonsense", None),
            Err(HandlerError::UnknownHandler(_))
        ));
    }

    #[test]
    fn copy_allowed_follows_needs_table() {
        let reg = HandlerRegistry::new(HandlerContext::default());
        assert!(reg.handler_allows_copy(None).unwrap());
        assert!(reg.handler_allows_copy(Some("handler=cartage")).unwrap());
        assert!(!reg.handler_allows_copy(Some("handler=qtable")).unwrap());
        assert!(!reg
            .handler_allows_copy(Some("handler=vtable&skip_truncate=1"))
            .unwrap());
    }
}
