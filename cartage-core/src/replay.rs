//! The replay worker: a cascaded batch consumer driving every replicated
//! table through its state machine.
//!
//! One process per subscriber node.  Each batch is applied in a single
//! transaction on the subscriber; table state changes ride in the same
//! transaction so position and data commit together.  Initial copies run in
//! separately spawned worker processes coordinated purely through the table
//! state rows, with the hand-off anchored at `sync_tick_id`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use indexmap::{IndexMap, IndexSet};
use metrics::counter;
use tokio::time::sleep;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, GenericClient, Row, Transaction};
use tracing::{debug, error, info, trace, warn};

use cartage_handlers::{Handler as _, HandlerRegistry, SqlQueue, SQL_QUEUE_LIMIT};
use cartage_queue::catalog;
use cartage_queue::copydata::connect_database;
use cartage_queue::{BatchInfo, CascadedConsumer, Event, EventKind, NodeInfo, NodeType};
use cartage_util::pidfile::{copy_pidfile, pidfile_alive, PidFile};
use cartage_util::{fq_name, glob, parse_statements, quote_fqident, quote_literal};

use crate::config::Config;
use crate::exec_attrs::ExecAttrs;
use crate::state::{Counter, TablePhase, TableState};
use crate::WorkerError;

/// Whether the worker keeps running after the current batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Exit,
}

/// Sync scheduler verdict for one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncRes {
    /// Continue with the batch.
    Ok,
    /// Sleep, reload state, try again.
    Loop,
    /// Nothing left to do, worker exits.
    Exit,
}

/// Run a metadata function that reports `(ret_code, ret_note)` rows.
pub async fn exec_cmd<C: GenericClient>(
    db: &C,
    sql: &str,
    params: &[&(dyn ToSql + Sync)],
) -> Result<Vec<Row>, WorkerError> {
    let rows = db.query(sql, params).await?;
    for row in &rows {
        let code: i32 = row.try_get("ret_code")?;
        let note: Option<String> = row.try_get("ret_note").ok().flatten();
        if code >= 300 {
            return Err(WorkerError::State(format!(
                "command failed: {code} {}",
                note.unwrap_or_default()
            )));
        }
        if let Some(note) = note {
            debug!(code, note, "metadata call");
        }
    }
    Ok(rows)
}

pub struct Replicator {
    pub cf: Config,
    pub consumer: CascadedConsumer,
    registry: HandlerRegistry,
    node: Option<NodeInfo>,
    /// Set on a copy worker: the one table being copied.
    copy_table_name: Option<String>,
    tables: IndexMap<String, TableState>,
    copy_method_map: HashMap<String, Option<usize>>,
    cur_tick: i64,
    prev_tick: i64,
    sql_queue: SqlQueue,
    used: IndexSet<String>,
    /// Saved batch accumulation settings while a do-sync hand-off needs
    /// small batches: (tick it was set at, min_count, min_interval).
    dsync_backup: Option<(i64, Option<i32>, Option<String>)>,
    prev_batch_had_events: bool,
    caught_up: bool,
    retry_mode: bool,
    code_checked: bool,
}

impl Replicator {
    pub fn new(cf: Config, copy_table_name: Option<String>) -> Result<Replicator, WorkerError> {
        let registry = HandlerRegistry::new(cf.handler_context()?);
        let consumer = CascadedConsumer::new(&cf.queue_name, &cf.job_name);
        Ok(Replicator {
            cf,
            consumer,
            registry,
            node: None,
            copy_table_name: copy_table_name.map(|t| fq_name(&t)),
            tables: IndexMap::new(),
            copy_method_map: HashMap::new(),
            cur_tick: 0,
            prev_tick: 0,
            sql_queue: SqlQueue::new(SQL_QUEUE_LIMIT),
            used: IndexSet::new(),
            dsync_backup: None,
            prev_batch_had_events: false,
            caught_up: false,
            retry_mode: false,
            code_checked: false,
        })
    }

    pub fn is_copy_worker(&self) -> bool {
        self.copy_table_name.is_some()
    }

    pub(crate) fn table_mut(&mut self, name: &str) -> Option<&mut TableState> {
        self.tables.get_mut(name)
    }

    /// Inserter pool size for a table's copy, `None` for single-stream.
    pub(crate) fn copy_method(&self, name: &str) -> Option<usize> {
        self.copy_method_map.get(name).copied().flatten()
    }

    fn node_type(&self) -> Option<NodeType> {
        self.node.as_ref().map(|n| n.node_type)
    }

    /// Configuration and handler problems do not go away on retry.
    fn is_fatal(err: &WorkerError) -> bool {
        match err {
            WorkerError::Config(_) | WorkerError::Usage(_) => true,
            WorkerError::Handler(e) => matches!(
                e,
                cartage_handlers::HandlerError::Config(_)
                    | cartage_handlers::HandlerError::UnknownHandler(_)
            ),
            WorkerError::Event { source, .. } => Self::is_fatal(source),
            _ => false,
        }
    }

    /// Main loop: fetch batches from the provider, apply them on the
    /// subscriber, retry failed batches with statement batching disabled.
    pub async fn run(&mut self) -> Result<(), WorkerError> {
        let _pidfile = match (&self.cf.pidfile, self.is_copy_worker()) {
            (Some(path), false) => Some(PidFile::take(path.clone())?),
            _ => None,
        };

        let mut dst = connect_database(&self.cf.db).await?;
        self.check_code(&dst).await?;
        dst.batch_execute("select cartage.set_session_replication_role('replica', false)")
            .await?;

        let node = NodeInfo::load(&dst, &self.cf.queue_name).await?;
        info!(node = %node.node_name, node_type = ?node.node_type, "node loaded");

        if node.node_type == NodeType::Root {
            return self.run_root(&dst).await;
        }

        let provider = node.provider_location.clone().ok_or_else(|| {
            WorkerError::State(format!("node {} has no provider", node.node_name))
        })?;
        let worker = node
            .worker_name
            .clone()
            .unwrap_or_else(|| self.cf.job_name.clone());
        self.consumer.consumer_name = match &self.copy_table_name {
            Some(table) => format!("{worker}.copy.{table}"),
            None => worker,
        };
        self.node = Some(node);

        let mut src = connect_database(&provider).await?;
        self.consumer.register(&src).await?;

        loop {
            match self.process_one(&mut src, &mut dst).await {
                Ok(Flow::Exit) => return Ok(()),
                Ok(Flow::Continue) => {
                    self.retry_mode = false;
                }
                Err(e) if Self::is_fatal(&e) => return Err(e),
                Err(e) => {
                    error!(error = %e, "batch failed, retrying");
                    self.retry_mode = true;
                    sleep(Duration::from_secs(20)).await;
                }
            }
        }
    }

    /// On the root node the worker only keeps sequence positions flowing
    /// into the queue.
    async fn run_root(&mut self, dst: &Client) -> Result<(), WorkerError> {
        info!("running on root node, publishing sequence positions");
        loop {
            exec_cmd(
                dst,
                "select * from cartage.root_check_seqs($1)",
                &[&self.cf.queue_name],
            )
            .await?;
            sleep(Duration::from_secs_f64(self.cf.loop_delay.max(1.0))).await;
        }
    }

    async fn process_one(
        &mut self,
        src: &mut Client,
        dst: &mut Client,
    ) -> Result<Flow, WorkerError> {
        let Some(batch) = self.consumer.next_batch(src).await? else {
            self.caught_up = true;
            self.prev_batch_had_events = false;
            sleep(Duration::from_secs_f64(self.cf.loop_delay)).await;
            return Ok(Flow::Continue);
        };
        let flow = self.process_batch(src, dst, &batch).await?;
        self.caught_up = false;
        Ok(flow)
    }

    /// All work for one batch.
    async fn process_batch(
        &mut self,
        src: &mut Client,
        dst: &mut Client,
        batch: &BatchInfo,
    ) -> Result<Flow, WorkerError> {
        self.cur_tick = batch.tick_id;
        self.prev_tick = batch.prev_tick_id;

        self.sync_database_encodings(src, dst).await?;
        self.load_table_state(&*dst).await?;

        if self.sync_tables(src, dst).await? == Flow::Exit {
            return Ok(Flow::Exit);
        }

        self.copy_snapshot_cleanup(&*dst).await?;

        // only the main worker touches fkeys
        if !self.is_copy_worker() {
            self.restore_fkeys(&*dst).await?;
        }

        let events = self.consumer.batch_events(src, batch.batch_id).await?;
        let had_events = !events.is_empty();
        let forward = self.node_type() == Some(NodeType::Branch) && !self.is_copy_worker();

        // the actual event processing: everything below must land in one
        // transaction on the subscriber so the position advances atomically
        let tx = dst.transaction().await?;
        self.sql_queue = SqlQueue::new(if self.retry_mode { 1 } else { SQL_QUEUE_LIMIT });
        self.used.clear();

        for ev in &events {
            if let Err(e) = self.process_remote_event(&tx, ev, batch).await {
                return Err(e.for_event(ev.id, ev.txid));
            }
            if forward {
                if let Err(e) = self.forward_event(&tx, ev, batch).await {
                    return Err(e.for_event(ev.id, ev.txid));
                }
            }
        }

        self.sql_queue.flush(&tx).await?;
        let touched: Vec<String> = self.used.iter().cloned().collect();
        for name in touched {
            if let Some(t) = self.tables.get_mut(&name) {
                if let Some(plugin) = t.plugin.as_mut() {
                    plugin.finish_batch(batch, &tx).await?;
                }
            }
        }
        self.used.clear();

        self.save_table_state(&tx).await?;
        self.consumer.set_completed(&tx, batch.tick_id).await?;
        tx.commit().await?;
        self.consumer.finish_batch(src, batch.batch_id).await?;

        self.prev_batch_had_events = had_events;
        Ok(Flow::Continue)
    }

    async fn check_code(&mut self, db: &Client) -> Result<(), WorkerError> {
        if self.code_checked {
            return Ok(());
        }
        let row = db
            .query_one(
                "select count(*) > 0 as found from pg_catalog.pg_namespace where nspname = 'cartage'",
                &[],
            )
            .await?;
        let found: bool = row.try_get("found")?;
        if !found {
            return Err(WorkerError::Usage(
                "cartage schema not installed in target database".to_owned(),
            ));
        }
        self.code_checked = true;
        Ok(())
    }

    /// Make sure client_encoding matches the provider for the session.
    async fn sync_database_encodings(
        &self,
        src: &Client,
        dst: &Client,
    ) -> Result<(), WorkerError> {
        let src_enc = catalog::client_encoding(src).await?;
        let dst_enc = catalog::client_encoding(dst).await?;
        if src_enc != dst_enc {
            info!(src_enc, dst_enc, "aligning client encoding");
            dst.batch_execute(&format!(
                "set client_encoding = {}",
                quote_literal(Some(src_enc.as_str()))
            ))
            .await?;
        }
        Ok(())
    }

    // -- table state cache ------------------------------------------------

    pub(crate) async fn load_table_state<C: GenericClient>(
        &mut self,
        db: &C,
    ) -> Result<(), WorkerError> {
        let rows = db
            .query(
                "select * from cartage.get_table_list($1)",
                &[&self.cf.queue_name],
            )
            .await?;

        let mut new_map = IndexMap::with_capacity(rows.len());
        for row in &rows {
            let local: bool = row.try_get("local")?;
            if !local {
                continue;
            }
            let name: String = row.try_get("table_name")?;
            let mut t = self
                .tables
                .shift_remove(&name)
                .unwrap_or_else(|| TableState::new(&name));
            t.loaded_state(row, &self.registry)?;
            new_map.insert(name, t);
        }
        self.tables = new_map;

        self.fill_copy_method();
        self.setup_local_only_filter();
        Ok(())
    }

    fn fill_copy_method(&mut self) {
        self.copy_method_map.clear();
        for name in self.tables.keys() {
            let threaded = glob::glob_match_any(
                self.cf.threaded_copy_tables.iter().map(String::as_str),
                name,
            );
            self.copy_method_map.insert(
                name.clone(),
                threaded.then_some(self.cf.threaded_copy_pool_size),
            );
        }
    }

    /// With local_only, install a server-side event filter that keeps meta
    /// events, EXECUTE (unless dropped) and data events for local tables.
    fn setup_local_only_filter(&mut self) {
        if !self.cf.local_only {
            self.consumer.consumer_filter = None;
            return;
        }
        let filterlist = match &self.copy_table_name {
            Some(table) => quote_literal(Some(table.as_str())),
            None => self
                .tables
                .keys()
                .map(|n| quote_literal(Some(n.as_str())))
                .collect::<Vec<_>>()
                .join(","),
        };
        let mut conds = vec![
            "ev_type like 'pgq.%'".to_owned(),
            "ev_type like 'cartage.%'".to_owned(),
        ];
        if !self.cf.local_only_drop_execute {
            conds.push("ev_type = 'EXECUTE'".to_owned());
        }
        if !filterlist.is_empty() {
            conds.push(format!("ev_extra1 in ({filterlist})"));
        }
        self.consumer.consumer_filter = Some(format!("({})", conds.join(" or ")));
    }

    /// Persist every dirty table state row.
    pub(crate) async fn save_table_state<C: GenericClient>(
        &mut self,
        db: &C,
    ) -> Result<(), WorkerError> {
        let queue = self.cf.queue_name.clone();
        let copy_thread = self.is_copy_worker();
        for t in self.tables.values_mut() {
            // a handler argument may redirect the table; keep the catalog row
            // in sync with it
            if let Some(plugin) = &t.plugin {
                if plugin.dest_table() != t.dest_table {
                    info!(
                        table = %t.name,
                        dest = plugin.dest_table(),
                        "overwriting dest_table from handler"
                    );
                    db.execute(
                        "update cartage.table_info set dest_table = $1 \
                         where queue_name = $2 and table_name = $3",
                        &[&plugin.dest_table(), &queue, &t.name],
                    )
                    .await?;
                    t.dest_table = plugin.dest_table().to_owned();
                }
            }

            if !t.changed {
                continue;
            }
            let merge_state = t.render_state();
            info!(
                table = %t.name,
                copy = copy_thread,
                new_state = ?merge_state,
                "storing table state"
            );
            db.execute(
                "select cartage.local_set_table_state($1, $2, $3, $4)",
                &[&queue, &t.name, &t.str_snapshot, &merge_state],
            )
            .await?;
            t.changed = false;
        }
        Ok(())
    }

    pub(crate) async fn change_table_state(
        &mut self,
        dst: &Client,
        name: &str,
        state: TablePhase,
        tick_id: Option<i64>,
    ) -> Result<(), WorkerError> {
        let t = self
            .tables
            .get_mut(name)
            .ok_or_else(|| WorkerError::State(format!("unknown table: {name}")))?;
        t.change_state(state, tick_id);
        let rendered = t.render_state();
        self.save_table_state(dst).await?;
        info!(table = name, state = ?rendered, "table state changed");
        Ok(())
    }

    async fn copy_snapshot_cleanup<C: GenericClient>(&mut self, db: &C) -> Result<(), WorkerError> {
        let no_lag = self.caught_up;
        let copy_thread = self.is_copy_worker();
        let mut changes = false;
        for t in self.tables.values_mut() {
            t.gc_snapshot(copy_thread, self.prev_tick, self.cur_tick, no_lag);
            changes = changes || t.changed;
        }
        if changes {
            self.save_table_state(db).await?;
        }
        Ok(())
    }

    // -- sync scheduler ---------------------------------------------------

    /// Drive the per-table state machines until the batch can proceed.
    async fn sync_tables(&mut self, src: &mut Client, dst: &mut Client) -> Result<Flow, WorkerError> {
        debug!("sync tables");
        loop {
            let cnt = Counter::new(self.tables.values(), &self.copy_method_map);
            let res = if self.is_copy_worker() {
                self.sync_from_copy_thread(cnt, src, dst).await?
            } else {
                self.sync_from_main_thread(cnt, src, dst).await?
            };
            match res {
                SyncRes::Ok => return Ok(Flow::Continue),
                SyncRes::Exit => {
                    debug!("sync tables: exit");
                    if self.is_copy_worker() {
                        self.consumer.unregister(&*src).await?;
                    }
                    return Ok(Flow::Exit);
                }
                SyncRes::Loop => {
                    debug!("sync tables: sleeping");
                    sleep(Duration::from_secs(3)).await;
                    self.load_table_state(&*dst).await?;
                }
            }
        }
    }

    /// Main thread scheduling: promote wanna-sync tables when batches are
    /// small, and admit new copies up to `parallel_copies`.
    async fn sync_from_main_thread(
        &mut self,
        cnt: Counter,
        src: &mut Client,
        dst: &mut Client,
    ) -> Result<SyncRes, WorkerError> {
        let mut ret = SyncRes::Ok;

        if cnt.do_sync > 0 {
            // wait for the copy worker to catch up and take over
            ret = SyncRes::Loop;
        }

        // wanna-sync -> do-sync must happen on small batches, or the copy
        // worker can overshoot the agreed tick
        let mut dsync_ok = true;
        if self.consumer.pgq_min_count.is_some() || self.consumer.pgq_min_interval.is_some() {
            dsync_ok = false;
        } else if let Some((tick, _, _)) = &self.dsync_backup {
            if *tick >= self.cur_tick {
                dsync_ok = false;
            }
        }

        let mut need_dsync = false;
        let ready: Vec<String> = self
            .tables
            .values()
            .filter(|t| {
                t.state == TablePhase::WannaSync
                    && t.sync_tick_id.is_some_and(|s| self.cur_tick >= s)
            })
            .map(|t| t.name.clone())
            .collect();
        for name in ready {
            if dsync_ok {
                self.change_table_state(dst, &name, TablePhase::DoSync, Some(self.cur_tick))
                    .await?;
                ret = SyncRes::Loop;
            } else {
                need_dsync = true;
            }
        }

        // tune batch size if needed
        if need_dsync {
            if self.consumer.pgq_min_count.is_some() || self.consumer.pgq_min_interval.is_some() {
                self.dsync_backup = Some((
                    self.cur_tick,
                    self.consumer.pgq_min_count.take(),
                    self.consumer.pgq_min_interval.take(),
                ));
            }
        } else if let Some((_, min_count, min_interval)) = self.dsync_backup.take() {
            self.consumer.pgq_min_count = min_count;
            self.consumer.pgq_min_interval = min_interval;
        }

        // admit new copies
        let mut npossible = self.cf.parallel_copies.saturating_sub(cnt.copy_count());
        if cnt.missing > 0 && npossible > 0 {
            let pmap = self.load_provider_state_map(src).await?;
            let missing: Vec<String> = self
                .tables
                .values()
                .filter(|t| t.state == TablePhase::Missing)
                .map(|t| t.name.clone())
                .collect();
            for name in missing {
                let has_copy_node = self.tables[&name].table_attrs.contains_key("copy_node");
                if !has_copy_node {
                    // regular provider is used
                    match pmap.get(&name) {
                        None => {
                            warn!(table = %name, "table not available on provider");
                            continue;
                        }
                        Some(phase) if *phase != TablePhase::Ok => {
                            info!(table = %name, "table not OK on provider, waiting");
                            continue;
                        }
                        Some(_) => {}
                    }
                }

                if npossible == 0 {
                    break;
                }
                npossible -= 1;

                // drop fkeys first so a failure in between leaves the table
                // still missing
                let dest = self.tables[&name].dest_table.clone();
                self.drop_fkeys(&*dst, &dest).await?;
                self.change_table_state(dst, &name, TablePhase::InCopy, None)
                    .await?;
                self.launch_copy(&name)?;
                ret = SyncRes::Loop;
            }
        }

        Ok(ret)
    }

    /// Copy thread scheduling: run the copy, catch up, hand over at the
    /// agreed tick.
    async fn sync_from_copy_thread(
        &mut self,
        _cnt: Counter,
        src: &mut Client,
        dst: &mut Client,
    ) -> Result<SyncRes, WorkerError> {
        let name = self
            .copy_table_name
            .clone()
            .expect("copy worker without table");

        // somebody may have done remove-table in the meantime
        let Some(t) = self.tables.get(&name) else {
            error!(table = %name, "copy worker lost its table");
            return Ok(SyncRes::Exit);
        };
        let state = t.state;
        let sync_tick_id = t.sync_tick_id;
        let copy_role = t.copy_role.clone();
        let has_dropped_ddl = t.dropped_ddl.is_some();

        match state {
            TablePhase::DoSync => {
                // these settings may cause the copy to miss the agreed tick
                self.consumer.pgq_min_count = None;
                self.consumer.pgq_min_interval = None;

                let sync_tick = sync_tick_id
                    .ok_or_else(|| WorkerError::State(format!("do-sync without tick: {name}")))?;
                if self.cur_tick == sync_tick {
                    self.change_table_state(dst, &name, TablePhase::Ok, None).await?;
                    Ok(SyncRes::Exit)
                } else if self.cur_tick < sync_tick {
                    Ok(SyncRes::Ok)
                } else {
                    error!(
                        cur_tick = self.cur_tick,
                        sync_tick, "copy worker overshot the sync tick"
                    );
                    Err(WorkerError::State("invalid table state".to_owned()))
                }
            }
            TablePhase::WannaSync => {
                // wait for the main worker to react
                Ok(SyncRes::Loop)
            }
            TablePhase::CatchingUp => {
                // partition merging: not our turn yet
                if matches!(copy_role.as_deref(), Some("wait-replay") | Some("lead")) {
                    return Ok(SyncRes::Loop);
                }
                // copy just finished, put the dropped DDL back first
                if has_dropped_ddl {
                    self.restore_copy_ddl(&name, dst).await?;
                    return Ok(SyncRes::Ok);
                }
                // more events pending: keep consuming
                if self.prev_batch_had_events {
                    return Ok(SyncRes::Ok);
                }
                // seems we have caught up
                self.change_table_state(dst, &name, TablePhase::WannaSync, Some(self.cur_tick))
                    .await?;
                Ok(SyncRes::Loop)
            }
            TablePhase::InCopy => {
                self.do_copy(&name, src, dst).await?;
                // forget the previous work estimate
                self.prev_batch_had_events = true;
                Ok(SyncRes::Loop)
            }
            TablePhase::Missing | TablePhase::Ok => Ok(SyncRes::Exit),
        }
    }

    /// Re-issue the index/constraint DDL the copy dropped for speed, then
    /// analyze the freshly loaded table.
    async fn restore_copy_ddl(&mut self, name: &str, dst: &Client) -> Result<(), WorkerError> {
        let (ddl, dest_table) = {
            let t = self
                .tables
                .get_mut(name)
                .ok_or_else(|| WorkerError::State(format!("unknown table: {name}")))?;
            let Some(ddl) = t.dropped_ddl.take() else {
                return Ok(());
            };
            (ddl, t.dest_table.clone())
        };

        info!(table = name, "restoring DDL");
        for stmt in parse_statements(&ddl) {
            info!(sql = %stmt, "restore");
            dst.batch_execute(&stmt).await?;
        }
        exec_cmd(
            dst,
            "select * from cartage.local_set_table_struct($1, $2, NULL)",
            &[&self.cf.queue_name, &name],
        )
        .await?;

        info!(table = name, "analyze");
        dst.batch_execute(&format!("analyze {}", quote_fqident(&dest_table)))
            .await?;
        Ok(())
    }

    /// Table states on the provider, for copy admission.
    async fn load_provider_state_map(
        &self,
        src: &Client,
    ) -> Result<HashMap<String, TablePhase>, WorkerError> {
        let rows = src
            .query(
                "select table_name, local, merge_state from cartage.get_table_list($1)",
                &[&self.cf.queue_name],
            )
            .await?;
        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            let local: bool = row.try_get("local")?;
            if !local {
                continue;
            }
            let name: String = row.try_get("table_name")?;
            let merge_state: Option<String> = row.try_get("merge_state")?;
            let mut scratch = TableState::new(&name);
            let phase = scratch.parse_state(merge_state.as_deref())?;
            map.insert(name, phase);
        }
        Ok(map)
    }

    /// Spawn a detached copy worker process for one table.
    fn launch_copy(&self, table_name: &str) -> Result<(), WorkerError> {
        info!(table = table_name, "launching copy process");
        let exe = std::env::current_exe()?;
        let conf: PathBuf = self.cf.config_path.clone();

        // let an existing copy finish and clean its pidfile, otherwise the
        // new one exits immediately
        if let Some(base) = &self.cf.pidfile {
            let pidfile = copy_pidfile(base, table_name);
            while pidfile_alive(&pidfile) {
                warn!(table = table_name, "waiting for existing copy to exit");
                std::thread::sleep(Duration::from_secs(2));
            }
        }

        let mut cmd = std::process::Command::new(&exe);
        cmd.arg(&conf).arg("copy").arg(table_name).arg("-d");
        debug!(cmd = ?cmd, "launch args");
        let child = cmd.spawn()?;
        debug!(pid = child.id(), "copy process spawned");
        Ok(())
    }

    // -- event processing -------------------------------------------------

    async fn process_remote_event(
        &mut self,
        tx: &Transaction<'_>,
        ev: &Event,
        batch: &BatchInfo,
    ) -> Result<(), WorkerError> {
        trace!(
            ev_id = ev.id,
            ev_type = %ev.ev_type,
            extra1 = ?ev.extra1,
            "event"
        );
        match ev.kind()? {
            EventKind::Row { .. } => self.handle_data_event(tx, ev, batch).await,
            EventKind::Truncate => {
                self.sql_queue.flush(tx).await?;
                self.handle_truncate_event(tx, ev, batch).await
            }
            EventKind::Execute => {
                self.sql_queue.flush(tx).await?;
                self.handle_execute_event(tx, ev).await
            }
            EventKind::AddTable => {
                self.sql_queue.flush(tx).await?;
                self.add_set_table(tx, ev).await
            }
            EventKind::RemoveTable => {
                self.sql_queue.flush(tx).await?;
                self.remove_set_table(tx, ev).await
            }
            EventKind::RemoveSeq => {
                self.sql_queue.flush(tx).await?;
                self.remove_set_seq(tx, ev).await
            }
            EventKind::UpdateSeq => {
                self.sql_queue.flush(tx).await?;
                self.update_seq(tx, ev).await
            }
            EventKind::Cascade | EventKind::Other => {
                // queue-internal events are the runtime's business
                trace!(ev_type = %ev.ev_type, "ignoring meta event");
                Ok(())
            }
        }
    }

    async fn handle_data_event(
        &mut self,
        tx: &Transaction<'_>,
        ev: &Event,
        batch: &BatchInfo,
    ) -> Result<(), WorkerError> {
        let Some(extra1) = ev.extra1.as_deref() else {
            counter!("cartage.ignored_events").increment(1);
            return Ok(());
        };
        let name = fq_name(extra1);
        let cur_tick = self.cur_tick;
        let copy_thread = self.copy_table_name.is_some();
        let copy_name = self.copy_table_name.clone();

        let Some(t) = self.tables.get_mut(&name) else {
            counter!("cartage.ignored_events").increment(1);
            return Ok(());
        };
        if !t.interesting(ev, cur_tick, copy_thread, copy_name.as_deref()) {
            counter!("cartage.ignored_events").increment(1);
            return Ok(());
        }
        let plugin = t
            .plugin
            .as_mut()
            .ok_or_else(|| WorkerError::State(format!("no handler bound for {name}")))?;
        if self.used.insert(name.clone()) {
            plugin.prepare_batch(Some(batch), tx).await?;
        }
        plugin.process_event(ev, &mut self.sql_queue, tx).await?;
        counter!("cartage.applied_events").increment(1);
        Ok(())
    }

    async fn handle_truncate_event(
        &mut self,
        tx: &Transaction<'_>,
        ev: &Event,
        batch: &BatchInfo,
    ) -> Result<(), WorkerError> {
        let Some(extra1) = ev.extra1.as_deref() else {
            return Ok(());
        };
        let name = fq_name(extra1);
        let cur_tick = self.cur_tick;
        let copy_thread = self.copy_table_name.is_some();
        let copy_name = self.copy_table_name.clone();

        let Some(t) = self.tables.get_mut(&name) else {
            counter!("cartage.ignored_events").increment(1);
            return Ok(());
        };
        if !t.interesting(ev, cur_tick, copy_thread, copy_name.as_deref()) {
            counter!("cartage.ignored_events").increment(1);
            return Ok(());
        }
        let fqname = quote_fqident(&t.dest_table);
        let plugin = t
            .plugin
            .as_mut()
            .ok_or_else(|| WorkerError::State(format!("no handler bound for {name}")))?;
        if self.used.insert(name.clone()) {
            plugin.prepare_batch(Some(batch), tx).await?;
        }
        if plugin.ignore_truncate() {
            info!(table = %fqname, "ignoring truncate");
            return Ok(());
        }

        // CASCADE, because without it the statement cannot work with fkeys
        // on either side
        self.sql_queue.flush(tx).await?;
        tx.batch_execute(&format!("TRUNCATE {fqname} CASCADE;")).await?;
        Ok(())
    }

    /// Run journaled DDL on this node if its exec-attrs match.
    async fn handle_execute_event(
        &mut self,
        tx: &Transaction<'_>,
        ev: &Event,
    ) -> Result<(), WorkerError> {
        if self.is_copy_worker() {
            return Ok(());
        }

        let fname = ev.extra1.clone().unwrap_or_default();
        let s_attrs = ev.extra2.clone().unwrap_or_default();
        let attrs = ExecAttrs::from_urlenc(&s_attrs)?;
        let sql = ev.data.clone().unwrap_or_default();

        // DDL must fire local triggers if there are any
        tx.batch_execute("select cartage.set_session_replication_role('local', true)")
            .await?;

        let mut seq_map = HashMap::new();
        let rows = tx
            .query(
                "select seq_name from cartage.get_seq_list($1) where local",
                &[&self.cf.queue_name],
            )
            .await?;
        for row in rows {
            let seq: String = row.try_get("seq_name")?;
            seq_map.insert(seq.clone(), seq);
        }
        let mut tbl_map = HashMap::new();
        for t in self.tables.values() {
            tbl_map.insert(t.name.clone(), t.dest_table.clone());
        }

        let res = exec_cmd(
            tx,
            "select * from cartage.execute_start($1, $2, $3, false, $4)",
            &[&self.cf.queue_name, &fname, &sql, &s_attrs],
        )
        .await?;
        let ret: i32 = res
            .first()
            .map(|r| r.try_get("ret_code"))
            .transpose()?
            .unwrap_or(200);
        if ret > 200 {
            warn!(file = %fname, "skipping execution");
            tx.batch_execute("select cartage.set_session_replication_role('replica', true)")
                .await?;
            return Ok(());
        }

        if attrs.need_execute(tx, &tbl_map, &seq_map).await? {
            info!(file = %fname, "executing sql");
            let xsql = attrs.process_sql(&sql, &tbl_map, &seq_map)?;
            for stmt in parse_statements(&xsql) {
                tx.batch_execute(&stmt).await?;
            }
        } else {
            info!(file = %fname, "execution not needed on this node");
        }

        exec_cmd(
            tx,
            "select * from cartage.execute_finish($1, $2)",
            &[&self.cf.queue_name, &fname],
        )
        .await?;
        tx.batch_execute("select cartage.set_session_replication_role('replica', true)")
            .await?;
        Ok(())
    }

    /// A new table appeared on the root; remember it.
    async fn add_set_table(&mut self, tx: &Transaction<'_>, ev: &Event) -> Result<(), WorkerError> {
        let Some(tbl) = ev.data.as_deref() else {
            return Ok(());
        };
        if !self.cf.register_only_tables.is_empty()
            && !self.cf.register_only_tables.iter().any(|t| t == tbl)
        {
            return Ok(());
        }
        if self.cf.register_skip_tables.iter().any(|t| t == tbl) {
            return Ok(());
        }
        tx.execute(
            "select cartage.global_add_table($1, $2)",
            &[&self.cf.queue_name, &tbl],
        )
        .await?;
        Ok(())
    }

    async fn remove_set_table(
        &mut self,
        tx: &Transaction<'_>,
        ev: &Event,
    ) -> Result<(), WorkerError> {
        let Some(tbl) = ev.data.as_deref() else {
            return Ok(());
        };
        self.tables.shift_remove(tbl);
        tx.execute(
            "select cartage.global_remove_table($1, $2)",
            &[&self.cf.queue_name, &tbl],
        )
        .await?;
        Ok(())
    }

    async fn remove_set_seq(
        &mut self,
        tx: &Transaction<'_>,
        ev: &Event,
    ) -> Result<(), WorkerError> {
        let Some(seq) = ev.data.as_deref() else {
            return Ok(());
        };
        tx.execute(
            "select cartage.global_remove_seq($1, $2)",
            &[&self.cf.queue_name, &seq],
        )
        .await?;
        Ok(())
    }

    async fn update_seq(&mut self, tx: &Transaction<'_>, ev: &Event) -> Result<(), WorkerError> {
        if self.is_copy_worker() {
            return Ok(());
        }
        let seq = ev.extra1.clone().unwrap_or_default();
        let val: i64 = ev
            .data
            .as_deref()
            .and_then(|d| d.trim().parse().ok())
            .ok_or_else(|| {
                WorkerError::State(format!("update-seq event {} without value", ev.id))
            })?;
        exec_cmd(
            tx,
            "select * from cartage.global_update_seq($1, $2, $3)",
            &[&self.cf.queue_name, &seq, &val],
        )
        .await?;
        Ok(())
    }

    /// On a branch node, re-insert the event into the local queue copy so
    /// nodes below get it.  Handlers may rewrite or drop data events here.
    async fn forward_event(
        &mut self,
        tx: &Transaction<'_>,
        ev: &Event,
        batch: &BatchInfo,
    ) -> Result<(), WorkerError> {
        let mut out = ev.clone();
        if ev.is_data_event() {
            if let Some(extra1) = ev.extra1.as_deref() {
                let name = fq_name(extra1);
                if let Some(t) = self.tables.get_mut(&name) {
                    if let Some(plugin) = t.plugin.as_mut() {
                        if self.used.insert(name.clone()) {
                            plugin.prepare_batch(Some(batch), tx).await?;
                        }
                        match plugin.get_copy_event(ev.clone(), &self.cf.queue_name)? {
                            Some(rewritten) => out = rewritten,
                            None => return Ok(()),
                        }
                    }
                }
            }
        }
        self.consumer
            .insert_event(tx, &self.cf.queue_name, &out)
            .await?;
        Ok(())
    }

    // -- foreign keys -----------------------------------------------------

    /// Drop all fkeys to and from a table, one at a time to avoid deadlocks
    /// with user code.
    pub(crate) async fn drop_fkeys<C: GenericClient>(
        &self,
        db: &C,
        table_name: &str,
    ) -> Result<(), WorkerError> {
        let rows = db
            .query(
                "select * from cartage.find_table_fkeys($1)",
                &[&table_name],
            )
            .await?;
        for row in rows {
            let fkey: String = row.try_get("fkey_name")?;
            let from_table: String = row.try_get("from_table")?;
            info!(fkey = %fkey, "dropping fkey");
            db.execute(
                "select cartage.drop_table_fkey($1, $2)",
                &[&from_table, &fkey],
            )
            .await?;
        }
        Ok(())
    }

    /// Restore fkeys whose both endpoints are back in sync.
    async fn restore_fkeys<C: GenericClient>(&self, db: &C) -> Result<(), WorkerError> {
        let rows = db
            .query(
                "select * from cartage.get_valid_pending_fkeys($1)",
                &[&self.cf.queue_name],
            )
            .await?;
        for row in rows {
            let fkey: String = row.try_get("fkey_name")?;
            let from_table: String = row.try_get("from_table")?;
            let to_table: String = row.try_get("to_table")?;
            info!(fkey = %fkey, from_table = %from_table, to_table = %to_table, "creating fkey");
            db.execute(
                "select cartage.restore_table_fkey($1, $2)",
                &[&from_table, &fkey],
            )
            .await?;
        }
        Ok(())
    }
}
