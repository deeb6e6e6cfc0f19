//! Partitioned dispatch: route each row to a time-bucketed child table.
//!
//! Arguments:
//!   table_mode        - part (default) / direct / ignore
//!   part_mode         - batch_time (default) / event_time / date_field / current_time
//!   part_field        - timestamp column, required for part_mode=date_field
//!   period            - day (default) / month / year / hour
//!   part_name         - custom child name template (%(parent)s, %(year)s, ...)
//!   part_template     - custom SQL for creating the child table
//!   pre_part          - SQL run before creating a child table
//!   post_part         - SQL run after creating a child table
//!   part_func         - partition creation function, default cartage.create_partition
//!   retention_period  - drop children older than this ('3 months', '1 year')
//!   ignore_old_events - 1 = drop events aimed at obsolete children
//!   row_mode          - plain (default) / keep_latest / keep_all
//!   event_types       - comma list of I,U,D to process, default all
//!   load_mode         - direct (default) / bulk
//!   method            - bulk method: 0 correct / 1 delete / 2 merged / 3 insert
//!   fields            - source field list with optional renames (f1,f2:new2)
//!   skip_fields       - fields to drop
//!   table             - override destination parent table
//!   analyze           - 1 = analyze temp tables after load
//!   ignore_truncate   - 1 = ignore truncate events
//!   encoding          - rejected, no encoding validation support
//!   key / hash_key / hash_expr / disable_replay - optional shard filtering

use std::collections::HashSet;

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, Datelike, NaiveDateTime, Timelike, Utc};
use futures::{pin_mut, SinkExt};
use indexmap::IndexMap;
use tokio_postgres::Transaction;
use tracing::{debug, info};

use cartage_queue::catalog::{exists_function, exists_table};
use cartage_queue::copydata::{full_copy, full_copy_parallel, CopySpec, CopyStats};
use cartage_queue::{parse_row_data, BatchInfo, Event, EventKind, RowData, RowOp, RowPayload};
use cartage_util::{quote_copy, quote_fqident, quote_ident};

use crate::args::HandlerArgs;
use crate::shard::ShardFilter;
use crate::table::{reject_encoding_arg, TableApplier};
use crate::{HandlerContext, HandlerError, SqlQueue};

const PART_FUNC_NEW: &str = "cartage.create_partition";
const PART_FUNC_OLD: &str = "public.create_partition";
const RETENTION_FUNC: &str = "cartage.drop_obsolete_partitions";
const OBSOLETE_FUNC: &str = "cartage.is_obsolete_partition";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TableMode {
    Part,
    Direct,
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartMode {
    BatchTime,
    EventTime,
    DateField,
    CurrentTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Period {
    Day,
    Month,
    Year,
    Hour,
}

impl Period {
    fn as_str(&self) -> &'static str {
        match self {
            Period::Day => "day",
            Period::Month => "month",
            Period::Year => "year",
            Period::Hour => "hour",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowMode {
    Plain,
    KeepAll,
    KeepLatest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadMode {
    Direct,
    Bulk,
}

/// Bulk loader method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    /// COPY inserts, UPDATE-from-temp for updates, DELETE-using-temp.
    Correct,
    /// Like correct but updates become DELETE + COPY.
    Delete,
    /// Like delete but insert rows ride along with the update rows.
    Merged,
    /// COPY inserts only, anything else is an error.
    Insert,
}

#[derive(Debug, Clone)]
struct DispatchConf {
    table_mode: TableMode,
    part_mode: PartMode,
    part_field: Option<String>,
    period: Period,
    part_name: Option<String>,
    part_template: Option<String>,
    pre_part: Option<String>,
    post_part: Option<String>,
    part_func: String,
    retention_period: Option<String>,
    ignore_old_events: bool,
    row_mode: RowMode,
    event_types: Vec<RowOp>,
    load_mode: LoadMode,
    method: Method,
    skip_fields: Vec<String>,
    field_map: Option<IndexMap<String, String>>,
    ignore_truncate: bool,
    analyze: bool,
}

const DISPATCH_ARGS: &[&str] = &[
    "table_mode",
    "part_func",
    "part_mode",
    "part_field",
    "period",
    "part_name",
    "part_template",
    "row_mode",
    "event_types",
    "load_mode",
    "method",
    "fields",
    "skip_fields",
    "table",
    "pre_part",
    "post_part",
    "retention_period",
    "ignore_old_events",
    "ignore_truncate",
    "encoding",
    "analyze",
    "key",
    "hash_key",
    "hash_expr",
    "disable_replay",
];

impl DispatchConf {
    fn from_args(args: &HandlerArgs) -> Result<DispatchConf, HandlerError> {
        args.validate(DISPATCH_ARGS)?;
        reject_encoding_arg(args)?;

        let table_mode = match args.get_choice("table_mode", &["part", "direct", "ignore"])?.as_str() {
            "part" => TableMode::Part,
            "direct" => TableMode::Direct,
            _ => TableMode::Ignore,
        };
        let part_mode = match args
            .get_choice(
                "part_mode",
                &["batch_time", "event_time", "date_field", "current_time"],
            )?
            .as_str()
        {
            "batch_time" => PartMode::BatchTime,
            "event_time" => PartMode::EventTime,
            "date_field" => PartMode::DateField,
            _ => PartMode::CurrentTime,
        };
        let part_field = args.get("part_field").map(str::to_owned);
        if table_mode == TableMode::Part && part_mode == PartMode::DateField && part_field.is_none()
        {
            return Err(HandlerError::Config(
                "part_mode date_field requires part_field".to_owned(),
            ));
        }
        let period = match args.get_choice("period", &["day", "month", "year", "hour"])?.as_str() {
            "day" => Period::Day,
            "month" => Period::Month,
            "year" => Period::Year,
            _ => Period::Hour,
        };
        let row_mode = match args
            .get_choice("row_mode", &["plain", "keep_all", "keep_latest"])?
            .as_str()
        {
            "plain" => RowMode::Plain,
            "keep_all" => RowMode::KeepAll,
            _ => RowMode::KeepLatest,
        };
        let event_types = match args.get("event_types").unwrap_or("*") {
            "*" => vec![RowOp::Insert, RowOp::Update, RowOp::Delete],
            list => list
                .split(',')
                .map(|t| {
                    RowOp::from_letter(&t.trim().to_uppercase()).ok_or_else(|| {
                        HandlerError::Config(format!("unsupported operation: {t}"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
        };
        let load_mode = match args.get_choice("load_mode", &["direct", "bulk"])?.as_str() {
            "direct" => LoadMode::Direct,
            _ => LoadMode::Bulk,
        };
        let method = match args.get_choice("method", &["0", "1", "2", "3"])?.as_str() {
            "0" => Method::Correct,
            "1" => Method::Delete,
            "2" => Method::Merged,
            _ => Method::Insert,
        };
        let skip_fields: Vec<String> = args
            .get("skip_fields")
            .map(|list| {
                list.split(',')
                    .map(|f| f.trim().to_lowercase())
                    .filter(|f| !f.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let field_map = match args.get("fields").unwrap_or("*") {
            "*" => None,
            list => {
                let mut map = IndexMap::new();
                for field in list.split(',') {
                    match field.split_once(':') {
                        Some((src, dst)) => map.insert(src.to_owned(), dst.to_owned()),
                        None => map.insert(field.to_owned(), field.to_owned()),
                    };
                }
                Some(map)
            }
        };

        Ok(DispatchConf {
            table_mode,
            part_mode,
            part_field,
            period,
            part_name: args.get("part_name").map(str::to_owned),
            part_template: args.get("part_template").map(str::to_owned),
            pre_part: args.get("pre_part").map(str::to_owned),
            post_part: args.get("post_part").map(str::to_owned),
            part_func: args.get("part_func").unwrap_or(PART_FUNC_NEW).to_owned(),
            retention_period: args.get("retention_period").map(str::to_owned),
            ignore_old_events: args.get_bool("ignore_old_events", false)?,
            row_mode,
            event_types,
            load_mode,
            method,
            skip_fields,
            field_map,
            ignore_truncate: args.get_bool("ignore_truncate", false)?,
            analyze: args.get_bool("analyze", false)?,
        })
    }
}

/// COPY a set of buffered rows into one table.
async fn copy_rows(
    dst: &Transaction<'_>,
    quoted_table: &str,
    fields: &[String],
    rows: &[RowData],
) -> Result<(), HandlerError> {
    let sql = format!(
        "COPY {} ({}) FROM STDIN",
        quoted_table,
        fields.iter().map(|f| quote_ident(f)).collect::<Vec<_>>().join(",")
    );
    let sink = dst.copy_in(&sql).await?;
    pin_mut!(sink);
    let mut buf = BytesMut::new();
    for row in rows {
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                buf.extend_from_slice(b"\t");
            }
            let val = row.get(field).cloned().flatten();
            buf.extend_from_slice(quote_copy(val.as_deref()).as_bytes());
        }
        buf.extend_from_slice(b"\n");
        if buf.len() > 64 * 1024 {
            sink.send(buf.split().freeze()).await?;
        }
    }
    if !buf.is_empty() {
        sink.send(buf.split().freeze()).await?;
    }
    sink.finish().await?;
    Ok(())
}

/// Per-destination row sink.
#[async_trait]
trait Loader: Send + Sync {
    fn process(&mut self, op: RowOp, row: RowData) -> Result<(), HandlerError>;
    async fn flush(&mut self, dst: &Transaction<'_>) -> Result<(), HandlerError>;
}

/// Buffer `(op, row)` pairs, flush as one concatenated SQL script.
struct DirectLoader {
    table: String,
    pkeys: Vec<String>,
    data: Vec<(RowOp, RowData)>,
}

impl DirectLoader {
    fn new(table: String, pkeys: Vec<String>) -> DirectLoader {
        DirectLoader {
            table,
            pkeys,
            data: Vec::new(),
        }
    }
}

#[async_trait]
impl Loader for DirectLoader {
    fn process(&mut self, op: RowOp, row: RowData) -> Result<(), HandlerError> {
        self.data.push((op, row));
        Ok(())
    }

    async fn flush(&mut self, dst: &Transaction<'_>) -> Result<(), HandlerError> {
        if self.data.is_empty() {
            return Ok(());
        }
        let mut stmts = Vec::with_capacity(self.data.len());
        for (op, row) in self.data.drain(..) {
            stmts.push(match op {
                RowOp::Insert => cartage_queue::sqlgen::mk_insert_sql(&row, &self.table, &self.pkeys),
                RowOp::Update => cartage_queue::sqlgen::mk_update_sql(&row, &self.table, &self.pkeys)?,
                RowOp::Delete => cartage_queue::sqlgen::mk_delete_sql(&row, &self.table, &self.pkeys)?,
            });
        }
        dst.batch_execute(&stmts.join("\n")).await?;
        Ok(())
    }
}

/// Effective operation for one pkey after collapsing its event chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BulkOp {
    Insert,
    Update,
    Delete,
    /// Insert later cancelled by delete; nothing to do unless re-inserted.
    Cancelled,
}

/// Collapse two consecutive operations on the same pkey.  Chains without an
/// edge keep the prior state, which also covers repeated deletes.
fn collapse_op(cur: Option<BulkOp>, ev: RowOp) -> BulkOp {
    match (cur, ev) {
        (None, RowOp::Insert) => BulkOp::Insert,
        (None, RowOp::Update) => BulkOp::Update,
        (None, RowOp::Delete) => BulkOp::Delete,
        (Some(BulkOp::Insert), RowOp::Delete) => BulkOp::Cancelled,
        (Some(BulkOp::Update), RowOp::Delete) => BulkOp::Delete,
        (Some(BulkOp::Delete), RowOp::Insert) => BulkOp::Update,
        (Some(BulkOp::Cancelled), RowOp::Insert) => BulkOp::Insert,
        (Some(cur), _) => cur,
    }
}

/// Collect rows per pkey, collapse each chain to its final effect, then load
/// with COPY and set-based statements through a temp table.
struct BulkLoader {
    table: String,
    quoted_table: String,
    temp: String,
    quoted_temp: String,
    pkeys: Vec<String>,
    fields: Option<Vec<String>>,
    method: Method,
    analyze: bool,
    pkey_ev_map: IndexMap<Vec<Option<String>>, (BulkOp, RowData)>,
    temp_present: bool,
}

impl BulkLoader {
    fn new(
        table: String,
        pkeys: Vec<String>,
        method: Method,
        analyze: bool,
    ) -> Result<BulkLoader, HandlerError> {
        if pkeys.is_empty() {
            return Err(HandlerError::Config(format!(
                "non-pk tables not supported: {table}"
            )));
        }
        let temp = format!("{}_loadertmp", table.replace('.', "_"));
        Ok(BulkLoader {
            quoted_table: quote_fqident(&table),
            quoted_temp: quote_ident(&temp),
            temp,
            table,
            pkeys,
            fields: None,
            method,
            analyze,
            pkey_ev_map: IndexMap::new(),
            temp_present: false,
        })
    }

    fn nonkeys(&self) -> Vec<String> {
        match &self.fields {
            None => Vec::new(),
            Some(fields) => fields
                .iter()
                .filter(|f| !self.pkeys.contains(f))
                .cloned()
                .collect(),
        }
    }

    fn where_clause(&self) -> String {
        self.pkeys
            .iter()
            .map(|f| format!("{}.{} = t.{}", self.quoted_table, quote_ident(f), quote_ident(f)))
            .collect::<Vec<_>>()
            .join(" and ")
    }

    fn cols(&self) -> String {
        self.fields
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|f| quote_ident(f))
            .collect::<Vec<_>>()
            .join(",")
    }

    async fn exists_temp(&self, dst: &Transaction<'_>) -> Result<bool, HandlerError> {
        let row = dst
            .query_one(
                "select count(*) > 0 as found from pg_catalog.pg_class \
                 where relname = $1 and relnamespace = pg_my_temp_schema()",
                &[&self.temp],
            )
            .await?;
        Ok(row.try_get("found")?)
    }

    async fn create_temp(&mut self, dst: &Transaction<'_>) -> Result<(), HandlerError> {
        if self.temp_present {
            dst.batch_execute(&format!("truncate {}", self.quoted_temp)).await?;
            return Ok(());
        }
        dst.batch_execute(&format!(
            "create temp table {} (like {}) on commit preserve rows",
            self.quoted_temp, self.quoted_table
        ))
        .await?;
        self.temp_present = true;
        Ok(())
    }

    /// COPY rows into the temp table, or straight into the target.
    async fn bulk_insert(
        &mut self,
        dst: &Transaction<'_>,
        rows: &[RowData],
        direct_target: bool,
    ) -> Result<(), HandlerError> {
        if rows.is_empty() {
            return Ok(());
        }
        let fields = self.fields.clone().unwrap_or_default();
        if direct_target {
            debug!(table = %self.table, rows = rows.len(), "bulk: COPY into target");
            copy_rows(dst, &self.quoted_table, &fields, rows).await?;
        } else {
            self.create_temp(dst).await?;
            debug!(temp = %self.temp, rows = rows.len(), "bulk: COPY into temp");
            copy_rows(dst, &self.quoted_temp, &fields, rows).await?;
            if self.analyze {
                dst.batch_execute(&format!("analyze {}", self.quoted_temp)).await?;
            }
        }
        Ok(())
    }

    async fn process_delete(
        &mut self,
        dst: &Transaction<'_>,
        deletes: &[RowData],
    ) -> Result<(), HandlerError> {
        if deletes.is_empty() {
            return Ok(());
        }
        debug!(table = %self.table, rows = deletes.len(), "bulk: deleting");
        self.bulk_insert(dst, deletes, false).await?;
        dst.batch_execute(&format!(
            "delete from only {} using {} as t where {}",
            self.quoted_table,
            self.quoted_temp,
            self.where_clause()
        ))
        .await?;
        Ok(())
    }

    async fn process_update(
        &mut self,
        dst: &Transaction<'_>,
        updates: &[RowData],
        inserts: &[RowData],
    ) -> Result<(), HandlerError> {
        let mut data = updates.to_vec();
        if self.method == Method::Merged {
            data.extend_from_slice(inserts);
        }
        if data.is_empty() {
            return Ok(());
        }
        debug!(table = %self.table, rows = data.len(), "bulk: updating");
        self.bulk_insert(dst, &data, false).await?;
        if self.method == Method::Correct {
            let setters: Vec<String> = self
                .nonkeys()
                .iter()
                .map(|c| format!("{} = t.{}", quote_ident(c), quote_ident(c)))
                .collect();
            // pk-only table, nothing to update
            if setters.is_empty() {
                return Ok(());
            }
            dst.batch_execute(&format!(
                "update only {} set {} from {} as t where {}",
                self.quoted_table,
                setters.join(", "),
                self.quoted_temp,
                self.where_clause()
            ))
            .await?;
        } else {
            dst.batch_execute(&format!(
                "delete from only {} using {} as t where {}",
                self.quoted_table,
                self.quoted_temp,
                self.where_clause()
            ))
            .await?;
            dst.batch_execute(&format!(
                "insert into {} ({}) select {} from {}",
                self.quoted_table,
                self.cols(),
                self.cols(),
                self.quoted_temp
            ))
            .await?;
        }
        Ok(())
    }

    async fn process_insert(
        &mut self,
        dst: &Transaction<'_>,
        inserts: &[RowData],
    ) -> Result<(), HandlerError> {
        if inserts.is_empty() || self.method == Method::Merged {
            return Ok(());
        }
        debug!(table = %self.table, rows = inserts.len(), "bulk: inserting");
        self.bulk_insert(dst, inserts, true).await
    }
}

#[async_trait]
impl Loader for BulkLoader {
    fn process(&mut self, op: RowOp, row: RowData) -> Result<(), HandlerError> {
        if self.method == Method::Insert && op != RowOp::Insert {
            return Err(HandlerError::Event(format!(
                "{} not supported by method insert",
                op.as_letter()
            )));
        }
        let pk_data: Vec<Option<String>> = self
            .pkeys
            .iter()
            .map(|k| row.get(k).cloned().flatten())
            .collect();
        let cur = self.pkey_ev_map.get(&pk_data).map(|(op, _)| *op);
        let next = collapse_op(cur, op);
        if self.fields.is_none() {
            self.fields = Some(row.keys().cloned().collect());
        }
        // update of a pk-only table collapses to nothing
        if next == BulkOp::Update && row.len() == pk_data.len() {
            self.pkey_ev_map.shift_remove(&pk_data);
            return Ok(());
        }
        self.pkey_ev_map.insert(pk_data, (next, row));
        Ok(())
    }

    async fn flush(&mut self, dst: &Transaction<'_>) -> Result<(), HandlerError> {
        if self.pkey_ev_map.is_empty() {
            return Ok(());
        }
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        let mut deletes = Vec::new();
        for (op, row) in self.pkey_ev_map.values() {
            match op {
                BulkOp::Insert => inserts.push(row.clone()),
                BulkOp::Update => updates.push(row.clone()),
                BulkOp::Delete => deletes.push(row.clone()),
                BulkOp::Cancelled => {}
            }
        }
        self.pkey_ev_map.clear();
        debug!(
            table = %self.table,
            inserts = inserts.len(),
            updates = updates.len(),
            deletes = deletes.len(),
            "bulk flush"
        );

        self.temp_present = self.exists_temp(dst).await?;
        self.process_delete(dst, &deletes).await?;
        self.process_update(dst, &updates, &inserts).await?;
        self.process_insert(dst, &inserts).await?;
        if self.temp_present {
            dst.batch_execute(&format!("truncate {}", self.quoted_temp)).await?;
        }
        Ok(())
    }
}

pub struct Dispatcher {
    applier: TableApplier,
    conf: DispatchConf,
    shard: Option<ShardFilter>,
    disable_replay: bool,
    ignored_tables: HashSet<String>,
    loaders: IndexMap<String, Box<dyn Loader>>,
    pkeys: Option<Vec<String>>,
    batch_end: Option<DateTime<Utc>>,
}

impl Dispatcher {
    pub fn build(
        table_name: &str,
        args: &HandlerArgs,
        dest_table: &str,
        ctx: &HandlerContext,
    ) -> Result<Dispatcher, HandlerError> {
        let dest_table = args.get("table").unwrap_or(dest_table);
        let conf = DispatchConf::from_args(args)?;
        Ok(Dispatcher {
            applier: TableApplier::new(table_name, dest_table),
            conf,
            shard: ShardFilter::from_args(args, ctx)?,
            disable_replay: args.get_bool("disable_replay", false)?,
            ignored_tables: HashSet::new(),
            loaders: IndexMap::new(),
            pkeys: None,
            batch_end: None,
        })
    }

    fn filter_data(&self, mut row: RowData) -> RowData {
        if !self.conf.skip_fields.is_empty() {
            row.retain(|k, _| !self.conf.skip_fields.contains(k));
        }
        if let Some(fmap) = &self.conf.field_map {
            let mut out = RowData::with_capacity(fmap.len());
            for (src, dst) in fmap {
                out.insert(dst.clone(), row.get(src).cloned().flatten());
            }
            return out;
        }
        row
    }

    fn filter_pkeys(&self, pkeys: &[String]) -> Vec<String> {
        let mut pkeys: Vec<String> = pkeys
            .iter()
            .filter(|p| !self.conf.skip_fields.contains(*p))
            .cloned()
            .collect();
        if let Some(fmap) = &self.conf.field_map {
            pkeys = pkeys
                .iter()
                .filter_map(|p| fmap.get(p).cloned())
                .collect();
        }
        pkeys
    }

    /// Child table name and bucket time for one event.
    fn split_format(
        &self,
        ev: &Event,
        row: &RowData,
    ) -> Result<(String, DateTime<Utc>), HandlerError> {
        let dtm = match self.conf.part_mode {
            PartMode::BatchTime => self.batch_end.ok_or_else(|| {
                HandlerError::Event("batch_time partitioning outside a batch".to_owned())
            })?,
            PartMode::EventTime => ev.time,
            PartMode::CurrentTime => Utc::now(),
            PartMode::DateField => {
                let field = self.conf.part_field.as_deref().unwrap_or_default();
                let value = row.get(field).cloned().flatten().ok_or_else(|| {
                    HandlerError::Event(format!("part_field({field}) is NULL: ev_id={}", ev.id))
                })?;
                let head = &value[..value.len().min(19)];
                let naive = NaiveDateTime::parse_from_str(head, "%Y-%m-%d %H:%M:%S")
                    .map_err(|e| {
                        HandlerError::Event(format!("bad {field} timestamp {value:?}: {e}"))
                    })?;
                naive.and_utc()
            }
        };

        let name = match &self.conf.part_name {
            Some(template) => subst_template(
                template,
                &[
                    ("parent", self.applier.dest_table.clone()),
                    ("year", format!("{:04}", dtm.year())),
                    ("month", format!("{:02}", dtm.month())),
                    ("day", format!("{:02}", dtm.day())),
                    ("hour", format!("{:02}", dtm.hour())),
                ],
            ),
            None => {
                let mut name = format!(
                    "{}_{:04}_{:02}",
                    self.applier.dest_table,
                    dtm.year(),
                    dtm.month()
                );
                match self.conf.period {
                    Period::Year => {
                        name = format!("{}_{:04}", self.applier.dest_table, dtm.year())
                    }
                    Period::Month => {}
                    Period::Day => name = format!("{}_{:02}", name, dtm.day()),
                    Period::Hour => {
                        name = format!("{}_{:02}_{:02}", name, dtm.day(), dtm.hour())
                    }
                }
                name
            }
        };
        Ok((name, dtm))
    }

    async fn is_obsolete_partition(
        &self,
        dst: &Transaction<'_>,
        part: &str,
        retention: &str,
    ) -> Result<bool, HandlerError> {
        let row = dst
            .query_one(
                &format!("select {OBSOLETE_FUNC}($1, $2, $3)"),
                &[&part, &retention, &self.conf.period.as_str()],
            )
            .await?;
        let obsolete: bool = row.try_get(0)?;
        if obsolete {
            info!(table = part, "ignored table");
        }
        Ok(obsolete)
    }

    async fn drop_obsolete_partitions(
        &mut self,
        dst: &Transaction<'_>,
        retention: &str,
    ) -> Result<Vec<String>, HandlerError> {
        let rows = dst
            .query(
                &format!("select {RETENTION_FUNC}($1, $2, $3)"),
                &[
                    &self.applier.dest_table,
                    &retention,
                    &self.conf.period.as_str(),
                ],
            )
            .await?;
        let dropped: Vec<String> = rows.iter().map(|r| r.get(0)).collect();
        if !dropped.is_empty() {
            info!(tables = ?dropped, "dropped partitions");
        }
        Ok(dropped)
    }

    /// Create the child table if needed, honoring templates and retention.
    async fn check_part(
        &mut self,
        dst: &Transaction<'_>,
        part: &str,
        part_time: DateTime<Utc>,
    ) -> Result<(), HandlerError> {
        if self.conf.ignore_old_events {
            if let Some(retention) = self.conf.retention_period.clone() {
                if self.is_obsolete_partition(dst, part, &retention).await? {
                    self.ignored_tables.insert(part.to_owned());
                    return Ok(());
                }
            }
        }
        if exists_table(dst, part).await? {
            return Ok(());
        }

        let quoted_part = quote_fqident(part);
        let vals = [
            ("dest", quoted_part.clone()),
            ("part", quoted_part.clone()),
            ("parent", self.applier.fq_dest_table.clone()),
            ("pkeys", self.pkeys.clone().unwrap_or_default().join(",")),
            ("schema_table", quoted_part.replace('.', "__")),
            (
                "part_field",
                self.conf.part_field.clone().unwrap_or_default(),
            ),
            (
                "part_time",
                part_time.format("%Y-%m-%d %H:%M:%S").to_string(),
            ),
            ("period", self.conf.period.as_str().to_owned()),
        ];

        if let Some(pre) = &self.conf.pre_part {
            dst.batch_execute(&subst_template(pre, &vals)).await?;
        }

        if let Some(template) = &self.conf.part_template {
            dst.batch_execute(&subst_template(template, &vals)).await?;
        } else {
            let pkeys = self.pkeys.clone().unwrap_or_default().join(",");
            let mut func = self.conf.part_func.clone();
            let mut have_func = exists_function(dst, &func, 6).await?;
            if !have_func && func == PART_FUNC_NEW {
                func = PART_FUNC_OLD.to_owned();
                have_func = exists_function(dst, &func, 6).await?;
            }
            if have_func {
                debug!(func, part, "creating partition via function");
                dst.execute(
                    &format!("select {}($1, $2, $3, $4, $5, $6)", quote_fqident(&func)),
                    &[
                        &self.applier.dest_table,
                        &part,
                        &pkeys,
                        &self.conf.part_field,
                        &part_time,
                        &self.conf.period.as_str(),
                    ],
                )
                .await?;
            } else {
                debug!(func, part, "partition function missing, cloning parent");
                dst.batch_execute(&format!(
                    "create table {} (like {} including all)",
                    quoted_part, self.applier.fq_dest_table
                ))
                .await?;
            }
        }

        if let Some(post) = &self.conf.post_part {
            dst.batch_execute(&subst_template(post, &vals)).await?;
        }
        info!(table = part, "created table");

        if let Some(retention) = self.conf.retention_period.clone() {
            let dropped = self.drop_obsolete_partitions(dst, &retention).await?;
            if self.conf.ignore_old_events {
                for table in dropped {
                    self.loaders.shift_remove(&table);
                    self.ignored_tables.insert(table);
                }
            }
        }
        Ok(())
    }

    fn make_loader(&self, table: String) -> Result<Box<dyn Loader>, HandlerError> {
        let pkeys = self.pkeys.clone().unwrap_or_default();
        Ok(match self.conf.load_mode {
            LoadMode::Direct => Box::new(DirectLoader::new(table, pkeys)),
            LoadMode::Bulk => Box::new(BulkLoader::new(
                table,
                pkeys,
                self.conf.method,
                self.conf.analyze,
            )?),
        })
    }

    fn copy_columns(&self, columns: &[String]) -> (Vec<String>, Vec<String>) {
        let mut src: Vec<String> = columns
            .iter()
            .filter(|c| !self.conf.skip_fields.contains(*c))
            .cloned()
            .collect();
        let mut dst = src.clone();
        if let Some(fmap) = &self.conf.field_map {
            src.retain(|c| fmap.contains_key(c));
            dst = src.iter().map(|c| fmap[c].clone()).collect();
        }
        (src, dst)
    }
}

fn subst_template(template: &str, vals: &[(&str, String)]) -> String {
    let mut out = template.to_owned();
    for (key, value) in vals {
        out = out.replace(&format!("%({key})s"), value);
    }
    out
}

#[async_trait]
impl crate::Handler for Dispatcher {
    fn handler_name(&self) -> &'static str {
        "dispatch"
    }

    fn dest_table(&self) -> &str {
        &self.applier.dest_table
    }

    fn add_trigger_args(&self, args: &mut Vec<String>) {
        if let Some(shard) = &self.shard {
            args.push(shard.trigger_arg());
        }
    }

    fn reset(&mut self) {
        self.loaders.clear();
        self.batch_end = None;
    }

    fn ignore_truncate(&self) -> bool {
        self.conf.ignore_truncate
    }

    async fn prepare_batch(
        &mut self,
        batch: Option<&BatchInfo>,
        dst: &Transaction<'_>,
    ) -> Result<(), HandlerError> {
        if self.conf.table_mode != TableMode::Ignore {
            self.batch_end = batch.map(|b| b.batch_end);
        }
        if let Some(shard) = &mut self.shard {
            shard.load(dst).await?;
        }
        Ok(())
    }

    async fn process_event(
        &mut self,
        ev: &Event,
        _sql: &mut SqlQueue,
        dst: &Transaction<'_>,
    ) -> Result<(), HandlerError> {
        if self.conf.table_mode == TableMode::Ignore || self.disable_replay {
            return Ok(());
        }
        if let Some(shard) = &self.shard {
            if !shard.is_local_event(ev)? {
                return Ok(());
            }
        }
        let EventKind::Row { op, pkey, sql_form } = ev.kind()? else {
            return Err(HandlerError::Event(format!(
                "unsupported event type: {}",
                ev.ev_type
            )));
        };
        if sql_form {
            return Err(HandlerError::Event(format!(
                "unsupported event type: {}/extra1={:?}",
                ev.ev_type, ev.extra1
            )));
        }
        if !self.conf.event_types.contains(&op) {
            return Ok(());
        }
        if self.pkeys.is_none() {
            self.pkeys = Some(self.filter_pkeys(&pkey));
        }
        let RowPayload::Row(row) = parse_row_data(ev, false)? else {
            return Err(HandlerError::Event("expected structured row".to_owned()));
        };
        let row = self.filter_data(row);

        let dst_name = match self.conf.table_mode {
            TableMode::Part => {
                let (part, part_time) = self.split_format(ev, &row)?;
                if self.ignored_tables.contains(&part) {
                    return Ok(());
                }
                if !self.loaders.contains_key(&part) {
                    self.check_part(dst, &part, part_time).await?;
                    if self.ignored_tables.contains(&part) {
                        return Ok(());
                    }
                }
                part
            }
            _ => self.applier.dest_table.clone(),
        };

        if !self.loaders.contains_key(&dst_name) {
            let loader = self.make_loader(dst_name.clone())?;
            self.loaders.insert(dst_name.clone(), loader);
        }
        let loader = self.loaders.get_mut(&dst_name).expect("loader just added");

        match self.conf.row_mode {
            RowMode::Plain => loader.process(op, row)?,
            RowMode::KeepAll => match op {
                RowOp::Update => loader.process(RowOp::Insert, row)?,
                RowOp::Delete => {}
                RowOp::Insert => loader.process(op, row)?,
            },
            RowMode::KeepLatest => match op {
                RowOp::Update => {
                    loader.process(RowOp::Delete, row.clone())?;
                    loader.process(RowOp::Insert, row)?;
                }
                _ => loader.process(op, row)?,
            },
        }
        Ok(())
    }

    async fn finish_batch(
        &mut self,
        _batch: &BatchInfo,
        dst: &Transaction<'_>,
    ) -> Result<(), HandlerError> {
        if self.conf.table_mode == TableMode::Ignore {
            return Ok(());
        }
        for loader in self.loaders.values_mut() {
            loader.flush(dst).await?;
        }
        Ok(())
    }

    async fn get_copy_condition(
        &mut self,
        _src: &Transaction<'_>,
        dst: &Transaction<'_>,
    ) -> Result<String, HandlerError> {
        match &mut self.shard {
            Some(shard) => {
                shard.load(dst).await?;
                shard.copy_condition()
            }
            None => Ok(String::new()),
        }
    }

    async fn real_copy(
        &mut self,
        src_table: &str,
        src: &Transaction<'_>,
        dst: &Transaction<'_>,
        columns: &[String],
    ) -> Result<CopyStats, HandlerError> {
        let condition = self.get_copy_condition(src, dst).await?;
        let (src_cols, dst_cols) = self.copy_columns(columns);
        let spec = CopySpec {
            src_table: src_table.to_owned(),
            dst_table: self.applier.dest_table.clone(),
            src_columns: src_cols,
            dst_columns: dst_cols,
            condition: (!condition.is_empty()).then_some(condition),
        };
        Ok(full_copy(src, dst, &spec, None).await?)
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
        let condition = self.get_copy_condition(src, dst).await?;
        let (src_cols, dst_cols) = self.copy_columns(columns);
        let spec = CopySpec {
            src_table: src_table.to_owned(),
            dst_table: self.applier.dest_table.clone(),
            src_columns: src_cols,
            dst_columns: dst_cols,
            condition: (!condition.is_empty()).then_some(condition),
        };
        Ok(full_copy_parallel(src, dst_connstr, &spec, parallel, session_setup, None).await?)
    }

    fn get_copy_event(
        &mut self,
        ev: Event,
        _queue_name: &str,
    ) -> Result<Option<Event>, HandlerError> {
        match &self.shard {
            Some(shard) => {
                if shard.is_local_event(&ev)? {
                    Ok(Some(ev))
                } else {
                    Ok(None)
                }
            }
            None => Ok(Some(ev)),
        }
    }
}

/// Preset names registered alongside `dispatch`, each a fixed set of
/// partitioning defaults over the same implementation.
pub const PRESET_NAMES: &[&str] = &[
    "hourly_event",
    "hourly_batch",
    "hourly_field",
    "hourly_time",
    "daily_event",
    "daily_batch",
    "daily_field",
    "daily_time",
    "monthly_event",
    "monthly_batch",
    "monthly_field",
    "monthly_time",
    "yearly_event",
    "yearly_batch",
    "yearly_field",
    "yearly_time",
    "bulk_hourly_event",
    "bulk_hourly_batch",
    "bulk_hourly_field",
    "bulk_hourly_time",
    "bulk_daily_event",
    "bulk_daily_batch",
    "bulk_daily_field",
    "bulk_daily_time",
    "bulk_monthly_event",
    "bulk_monthly_batch",
    "bulk_monthly_field",
    "bulk_monthly_time",
    "bulk_yearly_event",
    "bulk_yearly_batch",
    "bulk_yearly_field",
    "bulk_yearly_time",
    "bulk_direct",
    "direct",
    "dispatch",
];

/// Default arguments for one preset name, `None` for unknown names.
pub fn preset_args(name: &str) -> Option<Vec<(&'static str, &'static str)>> {
    if name == "dispatch" {
        return Some(vec![]);
    }
    if name == "bulk_direct" {
        return Some(vec![("load_mode", "bulk"), ("table_mode", "direct")]);
    }
    if name == "direct" {
        return Some(vec![("load_mode", "direct"), ("table_mode", "direct")]);
    }

    let (load_mode, rest) = match name.strip_prefix("bulk_") {
        Some(rest) => ("bulk", rest),
        None => ("direct", name),
    };
    let (period, mode) = rest.split_once('_')?;
    let period = match period {
        "hourly" => "hour",
        "daily" => "day",
        "monthly" => "month",
        "yearly" => "year",
        _ => return None,
    };
    let part_mode = match mode {
        "event" => "event_time",
        "batch" => "batch_time",
        "field" => "date_field",
        "time" => "current_time",
        _ => return None,
    };
    Some(vec![
        ("table_mode", "part"),
        ("row_mode", "keep_latest"),
        ("load_mode", load_mode),
        ("period", period),
        ("part_mode", part_mode),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn build(arglist: &[(&str, &str)]) -> Dispatcher {
        let args = HandlerArgs::new(
            arglist
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
        );
        Dispatcher::build("public.log", &args, "public.log", &HandlerContext::default()).unwrap()
    }

    fn row(pairs: &[(&str, Option<&str>)]) -> RowData {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.map(str::to_owned)))
            .collect()
    }

    fn data_event(ev_type: &str, data: &str) -> Event {
        Event {
            id: 3,
            ev_type: ev_type.to_owned(),
            data: Some(data.to_owned()),
            extra1: Some("public.log".to_owned()),
            extra2: None,
            extra3: None,
            extra4: None,
            time: Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap(),
            txid: Some(77),
            retry: None,
        }
    }

    #[test]
    fn op_graph_collapse() {
        use RowOp::*;
        // I, U, U, D on one pkey ends as a no-op
        let mut op = None;
        for ev in [Insert, Update, Update, Delete] {
            op = Some(collapse_op(op, ev));
        }
        assert_eq!(op, Some(BulkOp::Cancelled));

        // D then I becomes U, I then U stays I, repeated D keeps D
        assert_eq!(collapse_op(Some(BulkOp::Delete), Insert), BulkOp::Update);
        assert_eq!(collapse_op(Some(BulkOp::Insert), Update), BulkOp::Insert);
        assert_eq!(collapse_op(Some(BulkOp::Delete), Delete), BulkOp::Delete);
        assert_eq!(collapse_op(Some(BulkOp::Cancelled), Insert), BulkOp::Insert);
    }

    #[test]
    fn part_names_per_period() {
        let d = build(&[("part_mode", "event_time")]);
        let ev = data_event("I:id", "id=1");
        let (name, _) = d.split_format(&ev, &row(&[("id", Some("1"))])).unwrap();
        assert_eq!(name, "public.log_2024_01_15");

        let d = build(&[("part_mode", "event_time"), ("period", "hour")]);
        let (name, _) = d.split_format(&ev, &row(&[("id", Some("1"))])).unwrap();
        assert_eq!(name, "public.log_2024_01_15_10");

        let d = build(&[("part_mode", "event_time"), ("period", "month")]);
        let (name, _) = d.split_format(&ev, &row(&[("id", Some("1"))])).unwrap();
        assert_eq!(name, "public.log_2024_01");

        let d = build(&[("part_mode", "event_time"), ("period", "year")]);
        let (name, _) = d.split_format(&ev, &row(&[("id", Some("1"))])).unwrap();
        assert_eq!(name, "public.log_2024");
    }

    #[test]
    fn date_field_partitioning() {
        let d = build(&[("part_mode", "date_field"), ("part_field", "ts")]);
        let ev = data_event("I:id", "id=1");
        let (name, _) = d
            .split_format(&ev, &row(&[("id", Some("1")), ("ts", Some("2023-12-31 23:59:59.5"))]))
            .unwrap();
        assert_eq!(name, "public.log_2023_12_31");

        let err = d.split_format(&ev, &row(&[("id", Some("1")), ("ts", None)]));
        assert!(err.is_err(), "NULL part_field must fail");
    }

    #[test]
    fn custom_part_name_template() {
        let d = build(&[
            ("part_mode", "event_time"),
            ("part_name", "%(parent)s_y%(year)sm%(month)s"),
        ]);
        let ev = data_event("I:id", "id=1");
        let (name, _) = d.split_format(&ev, &row(&[])).unwrap();
        assert_eq!(name, "public.log_y2024m01");
    }

    #[test]
    fn field_projection() {
        let d = build(&[("skip_fields", "secret"), ("fields", "id,v:val")]);
        let projected = d.filter_data(row(&[
            ("id", Some("1")),
            ("secret", Some("x")),
            ("v", Some("y")),
        ]));
        assert_eq!(projected.len(), 2);
        assert_eq!(projected["id"], Some("1".to_owned()));
        assert_eq!(projected["val"], Some("y".to_owned()));
        assert_eq!(d.filter_pkeys(&["id".to_owned(), "secret".to_owned()]), vec!["id"]);
    }

    #[test]
    fn copy_column_projection() {
        let d = build(&[("skip_fields", "secret"), ("fields", "id,v:val")]);
        let (src, dst) = d.copy_columns(&[
            "id".to_owned(),
            "secret".to_owned(),
            "v".to_owned(),
        ]);
        assert_eq!(src, vec!["id", "v"]);
        assert_eq!(dst, vec!["id", "val"]);
    }

    #[test]
    fn presets() {
        let p = preset_args("bulk_daily_field").unwrap();
        assert!(p.contains(&("load_mode", "bulk")));
        assert!(p.contains(&("period", "day")));
        assert!(p.contains(&("part_mode", "date_field")));
        assert!(p.contains(&("row_mode", "keep_latest")));

        assert_eq!(
            preset_args("direct").unwrap(),
            vec![("load_mode", "direct"), ("table_mode", "direct")]
        );
        assert!(preset_args("weekly_event").is_none());
    }

    #[test]
    fn method_insert_rejects_other_ops() {
        let mut loader = BulkLoader::new(
            "public.log".to_owned(),
            vec!["id".to_owned()],
            Method::Insert,
            false,
        )
        .unwrap();
        assert!(loader.process(RowOp::Insert, row(&[("id", Some("1")), ("v", Some("a"))])).is_ok());
        assert!(loader.process(RowOp::Update, row(&[("id", Some("1")), ("v", Some("b"))])).is_err());
    }

    #[test]
    fn bulk_loader_requires_pkeys() {
        assert!(BulkLoader::new("t".to_owned(), vec![], Method::Correct, false).is_err());
    }

    #[test]
    fn pk_only_update_dropped() {
        let mut loader = BulkLoader::new(
            "public.log".to_owned(),
            vec!["id".to_owned()],
            Method::Correct,
            false,
        )
        .unwrap();
        loader.process(RowOp::Update, row(&[("id", Some("1"))])).unwrap();
        assert!(loader.pkey_ev_map.is_empty());

        // an insert that later collapses back to insert is kept
        loader.process(RowOp::Insert, row(&[("id", Some("2"))])).unwrap();
        assert_eq!(loader.pkey_ev_map.len(), 1);
    }
}
