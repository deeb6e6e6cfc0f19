//! Replication administration: attaching tables and sequences, handler
//! changes, resync, structure checks and DDL execution.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Args;
use indexmap::IndexMap;
use tokio_postgres::Client;
use tracing::{debug, info, warn};

use cartage_core::exec_attrs::ExecAttrs;
use cartage_core::replay::exec_cmd;
use cartage_core::Config;
use cartage_queue::catalog;
use cartage_queue::copydata::connect_database;
use cartage_queue::{NodeInfo, NodeType};
use cartage_handlers::{create_handler_string, Handler as _, HandlerRegistry};
use cartage_util::urlenc::UrlMap;
use cartage_util::{
    db_urldecode, db_urlencode, fq_name, fq_name_parts, glob, parse_statements, quote_ident,
};

/// Flags shared by add-table, change-handler, add-seq and resync.
#[derive(Args, Debug, Clone, Default)]
pub struct AddOpts {
    /// No initial copy needed, table is already in sync
    #[arg(long)]
    pub expect_sync: bool,

    /// Do not delete old data on the subscriber before copy
    #[arg(long)]
    pub skip_truncate: bool,

    /// Walk upstream to find a node to copy from
    #[arg(long)]
    pub find_copy_node: bool,

    /// Use NODE as source for the initial copy
    #[arg(long, value_name = "NODE")]
    pub copy_node: Option<String>,

    /// Ignore object differences
    #[arg(long)]
    pub force: bool,

    /// Include all possible objects
    #[arg(long)]
    pub all: bool,

    /// Wait until all tables are in sync before returning
    #[arg(long)]
    pub wait_sync: bool,

    /// Create the object with minimal schema if missing
    #[arg(long)]
    pub create: bool,

    /// Create the object with full schema if missing
    #[arg(long)]
    pub create_full: bool,

    /// Trigger flags (BAIUDLQ)
    #[arg(long, value_name = "FLAGS")]
    pub trigger_flags: Option<String>,

    /// Custom trigger argument, may repeat
    #[arg(long = "trigger-arg")]
    pub trigger_arg: Vec<String>,

    /// Do not put triggers on the table
    #[arg(long)]
    pub no_triggers: bool,

    /// Custom handler for the table
    #[arg(long)]
    pub handler: Option<String>,

    /// Argument to the custom handler, may repeat
    #[arg(long = "handler-arg")]
    pub handler_arg: Vec<String>,

    /// Merge tables from all source queues
    #[arg(long)]
    pub merge_all: bool,

    /// Do not merge tables from source queues
    #[arg(long)]
    pub no_merge: bool,

    /// Max number of parallel copy processes for this table
    #[arg(long, value_name = "NUM")]
    pub max_parallel_copy: Option<u32>,

    /// Name for the actual destination table
    #[arg(long, value_name = "NAME")]
    pub dest_table: Option<String>,

    /// Skip objects that do not exist
    #[arg(long)]
    pub skip_non_existing: bool,
}

#[derive(Debug, Clone)]
struct TableInfo {
    local: bool,
    dest_table: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CreateMode {
    None,
    Minimal,
    Full,
}

impl CreateMode {
    fn from_opts(opts: &AddOpts) -> CreateMode {
        if opts.create_full {
            CreateMode::Full
        } else if opts.create {
            CreateMode::Minimal
        } else {
            CreateMode::None
        }
    }
}

pub struct Admin {
    cf: Config,
    registry: HandlerRegistry,
    db: Client,
    node: NodeInfo,
}

impl Admin {
    pub async fn new(cf: Config) -> anyhow::Result<Admin> {
        let registry = HandlerRegistry::new(cf.handler_context()?);
        let db = connect_database(&cf.db).await?;
        let node = NodeInfo::load(&db, &cf.queue_name).await?;
        Ok(Admin {
            cf,
            registry,
            db,
            node,
        })
    }

    fn is_root(&self) -> bool {
        self.node.node_type == NodeType::Root
    }

    async fn set_lock_timeout(&self) -> anyhow::Result<()> {
        let ms = (self.cf.lock_timeout * 1000.0) as i64;
        if ms > 0 {
            let q = format!("set statement_timeout = {ms}");
            debug!(sql = %q);
            self.db.batch_execute(&q).await?;
        }
        Ok(())
    }

    /// Connection to the node used as copy/DDL source.
    async fn provider_db(&self, copy_node: Option<&str>) -> anyhow::Result<Client> {
        let location = match copy_node {
            Some(node) => {
                let rows = self
                    .db
                    .query(
                        "select node_name, node_location from pgq_node.get_queue_locations($1)",
                        &[&self.cf.queue_name],
                    )
                    .await?;
                let mut location = None;
                for row in rows {
                    let name: String = row.try_get("node_name")?;
                    if name == node {
                        location = Some(row.try_get::<_, String>("node_location")?);
                    }
                }
                let location =
                    location.with_context(|| format!("cannot find node <{node}>"))?;
                if node == self.node.node_name {
                    bail!("cannot use itself as provider");
                }
                location
            }
            None => self
                .node
                .provider_location
                .clone()
                .unwrap_or_else(|| self.cf.db.clone()),
        };
        Ok(connect_database(&location).await?)
    }

    async fn fetch_set_tables(
        &self,
        db: &Client,
    ) -> anyhow::Result<IndexMap<String, TableInfo>> {
        let rows = db
            .query(
                "select table_name, local, \
                 coalesce(dest_table, table_name) as dest_table \
                 from cartage.get_table_list($1)",
                &[&self.cf.queue_name],
            )
            .await?;
        let mut map = IndexMap::with_capacity(rows.len());
        for row in rows {
            map.insert(
                row.try_get::<_, String>("table_name")?,
                TableInfo {
                    local: row.try_get("local")?,
                    dest_table: row.try_get("dest_table")?,
                },
            );
        }
        Ok(map)
    }

    async fn fetch_seqs(
        &self,
        db: &Client,
    ) -> anyhow::Result<IndexMap<String, (bool, Option<i64>)>> {
        let rows = db
            .query(
                "select seq_name, local, last_value from cartage.get_seq_list($1)",
                &[&self.cf.queue_name],
            )
            .await?;
        let mut map = IndexMap::with_capacity(rows.len());
        for row in rows {
            map.insert(
                row.try_get::<_, String>("seq_name")?,
                (row.try_get("local")?, row.try_get("last_value")?),
            );
        }
        Ok(map)
    }

    fn register_table_ok(&self, tbl: &str) -> bool {
        if !self.cf.register_only_tables.is_empty()
            && !self.cf.register_only_tables.iter().any(|t| t == tbl)
        {
            return false;
        }
        !self.cf.register_skip_tables.iter().any(|t| t == tbl)
    }

    /// Bring the local catalog in sync with the provider's table list.
    async fn sync_table_list(
        &self,
        src_tbls: &IndexMap<String, TableInfo>,
        dst_tbls: &IndexMap<String, TableInfo>,
    ) -> anyhow::Result<()> {
        for tbl in src_tbls.keys() {
            if !self.register_table_ok(tbl) {
                continue;
            }
            if !dst_tbls.contains_key(tbl) {
                info!(table = %tbl, "table info missing from subscriber, adding");
                exec_cmd(
                    &self.db,
                    "select * from cartage.global_add_table($1, $2)",
                    &[&self.cf.queue_name, tbl],
                )
                .await?;
            }
        }
        for tbl in dst_tbls.keys() {
            if !src_tbls.contains_key(tbl) {
                info!(table = %tbl, "table gone on provider, removing");
                exec_cmd(
                    &self.db,
                    "select * from cartage.global_remove_table($1, $2)",
                    &[&self.cf.queue_name, tbl],
                )
                .await?;
            }
        }
        Ok(())
    }

    fn build_tgargs(&self, opts: &AddOpts) -> Vec<String> {
        let mut tgargs: Vec<String> = opts.trigger_arg.clone();
        if let Some(flags) = &opts.trigger_flags {
            tgargs.push(format!("tgflags={flags}"));
        }
        if opts.no_triggers {
            tgargs.push("no_triggers".to_owned());
        }
        if opts.merge_all {
            tgargs.push("merge_all".to_owned());
        }
        if opts.no_merge {
            tgargs.push("no_merge".to_owned());
        }
        if opts.expect_sync {
            tgargs.push("expect_sync".to_owned());
        }
        tgargs
    }

    /// Build the handler string and let the handler add its trigger args.
    fn build_handler_string(
        &self,
        tbl: &str,
        tgargs: &mut Vec<String>,
        opts: &AddOpts,
    ) -> anyhow::Result<String> {
        let name = opts.handler.as_deref().unwrap_or_default();
        let hstr = create_handler_string(name, &opts.handler_arg)?;
        let handler = self
            .registry
            .build(tbl, &hstr, opts.dest_table.as_deref())?;
        handler.add_trigger_args(tgargs);
        Ok(hstr)
    }

    fn handler_needs_table(&self, opts: &AddOpts) -> anyhow::Result<bool> {
        match &opts.handler {
            None => Ok(true),
            Some(name) => {
                let hstr = create_handler_string(name, &opts.handler_arg)?;
                let handler = self.registry.build("unused.string", &hstr, None)?;
                Ok(handler.needs_table())
            }
        }
    }

    /// Expand cmdline object names: globbing, --all, existence checks.
    async fn expand_arg_list(
        &self,
        kind: char,
        existing: bool,
        args: &[String],
        allow_nonexist: bool,
        opts: &AddOpts,
    ) -> anyhow::Result<Vec<String>> {
        let q1 = match kind {
            'S' => "select seq_name from cartage.get_seq_list($1) where local",
            'r' => "select table_name from cartage.get_table_list($1) where local",
            _ => bail!("bad object kind"),
        };
        let q2 = format!(
            "select obj_name from cartage.local_show_missing($1) where obj_kind = '{kind}'"
        );

        let mut lst_exists = Vec::new();
        for row in self.db.query(q1, &[&self.cf.queue_name]).await? {
            lst_exists.push(row.get::<_, String>(0));
        }
        let mut lst_missing = Vec::new();
        for row in self.db.query(&q2, &[&self.cf.queue_name]).await? {
            lst_missing.push(row.get::<_, String>(0));
        }

        if args.is_empty() && opts.all {
            return Ok(if existing { lst_exists } else { lst_missing });
        }

        let (full, reverse) = if existing {
            (&lst_exists, &lst_missing)
        } else {
            (&lst_missing, &lst_exists)
        };
        self.solve_globbing(args, full, reverse, allow_nonexist, opts.force)
    }

    fn solve_globbing(
        &self,
        args: &[String],
        full_list: &[String],
        reverse_list: &[String],
        allow_nonexist: bool,
        force: bool,
    ) -> anyhow::Result<Vec<String>> {
        let full_map: HashSet<&str> = full_list.iter().map(String::as_str).collect();
        let reverse_map: HashSet<&str> = reverse_list.iter().map(String::as_str).collect();
        let mut res = Vec::new();
        let mut seen = HashSet::new();
        let mut err = false;

        for arg in args {
            if arg.contains('*') || arg.contains('?') {
                let pattern = if arg.contains('.') {
                    arg.clone()
                } else {
                    format!("public.{arg}")
                };
                for name in full_list {
                    if glob::glob_match(&pattern, name) && seen.insert(name.clone()) {
                        res.push(name.clone());
                    }
                }
            } else {
                let name = fq_name(arg);
                if seen.contains(&name) {
                    continue;
                }
                if full_map.contains(name.as_str()) {
                    seen.insert(name.clone());
                    res.push(name);
                } else if reverse_map.contains(name.as_str()) {
                    info!(object = %name, "already processed");
                } else if allow_nonexist {
                    seen.insert(name.clone());
                    res.push(name);
                } else if force {
                    warn!(object = %name, "not available, but --force is used");
                    seen.insert(name.clone());
                    res.push(name);
                } else {
                    warn!(object = %name, "not available");
                    err = true;
                }
            }
        }
        if err {
            bail!("cannot proceed");
        }
        if res.is_empty() {
            info!("nothing to do");
        }
        Ok(res)
    }

    // -- add/remove table -------------------------------------------------

    pub async fn add_table(&mut self, tables: &[String], opts: &AddOpts) -> anyhow::Result<i32> {
        let mut copy_node = opts.copy_node.clone();
        let mut src_db = None;
        let mut src_tbls;

        if self.is_root() {
            src_tbls = self.fetch_set_tables(&self.db).await?;
        } else {
            let src = self.provider_db(copy_node.as_deref()).await?;
            src_tbls = self.fetch_set_tables(&src).await?;
            let dst_tbls = self.fetch_set_tables(&self.db).await?;
            self.sync_table_list(&src_tbls, &dst_tbls).await?;
            src_db = Some(src);
        }

        let needs_tbl = self.handler_needs_table(opts)?;
        let args = self
            .expand_arg_list('r', false, tables, !needs_tbl, opts)
            .await?;
        let create = CreateMode::from_opts(opts);

        // search for a usable copy node when requested and needed
        if opts.find_copy_node && create != CreateMode::None && needs_tbl && !self.is_root() {
            let provider_location = self
                .node
                .provider_location
                .clone()
                .context("node has no provider")?;
            let (src_name, _, _) = self
                .find_copy_source(&args, &self.node.node_name, &provider_location)
                .await?;
            copy_node = Some(src_name);
            let src = self.provider_db(copy_node.as_deref()).await?;
            src_tbls = self.fetch_set_tables(&src).await?;
            src_db = Some(src);
        }

        if !self.is_root() && !opts.expect_sync && !opts.find_copy_node {
            let mut problems = false;
            for tbl in &args {
                let tbl = fq_name(tbl);
                if let Some(info) = src_tbls.get(&tbl) {
                    if !info.local {
                        if opts.skip_non_existing {
                            warn!(table = %tbl, "table does not exist on provider");
                        } else {
                            tracing::error!(
                                table = %tbl,
                                "table does not exist on provider, need to switch to different provider"
                            );
                            problems = true;
                        }
                    }
                }
            }
            if problems {
                bail!("problems, canceling operation");
            }
        }

        if opts.dest_table.is_some() && args.len() > 1 {
            bail!("--dest-table can be given only for a single table");
        }

        for tbl in &args {
            self.add_one_table(src_db.as_ref(), tbl, create, &src_tbls, opts, copy_node.as_deref())
                .await?;
        }

        if opts.wait_sync {
            self.wait_for_sync().await?;
        }
        Ok(0)
    }

    async fn add_one_table(
        &self,
        src_db: Option<&Client>,
        tbl: &str,
        create: CreateMode,
        src_tbls: &IndexMap<String, TableInfo>,
        opts: &AddOpts,
        copy_node: Option<&str>,
    ) -> anyhow::Result<()> {
        let tbl = fq_name(tbl);
        let dest_table = fq_name(opts.dest_table.as_deref().unwrap_or(&tbl));
        let tbl_exists = catalog::exists_table(&self.db, &dest_table).await?;
        let desc = if dest_table == tbl {
            tbl.clone()
        } else {
            format!("{tbl}({dest_table})")
        };

        self.set_lock_timeout().await?;

        if create != CreateMode::None {
            if tbl_exists {
                info!(table = %desc, "table already exists, not touching");
            } else if let Some(src) = src_db {
                let src_dest = src_tbls
                    .get(&tbl)
                    .map(|i| i.dest_table.clone())
                    .unwrap_or_else(|| tbl.clone());
                if !catalog::exists_table(src, &src_dest).await? {
                    warn!(table = %desc, "table missing on provider, cannot create, skipping");
                    return Ok(());
                }
                let (schema, _) = fq_name_parts(&dest_table);
                if !catalog::exists_schema(&self.db, schema).await? {
                    self.db
                        .batch_execute(&format!("create schema {}", quote_ident(schema)))
                        .await?;
                }
                self.create_table_like(src, &src_dest, &dest_table, create == CreateMode::Full)
                    .await?;
            }
        } else if !tbl_exists && opts.skip_non_existing {
            warn!(table = %desc, "table does not exist on local node, skipping");
            return Ok(());
        }

        let mut tgargs = self.build_tgargs(opts);
        let mut attrs = UrlMap::new();
        if opts.handler.is_some() {
            let hstr = self.build_handler_string(&tbl, &mut tgargs, opts)?;
            attrs.insert("handler".to_owned(), Some(hstr));
        }
        if opts.find_copy_node {
            attrs.insert("copy_node".to_owned(), Some("?".to_owned()));
        } else if let Some(node) = copy_node {
            attrs.insert("copy_node".to_owned(), Some(node.to_owned()));
        }
        if !opts.expect_sync && opts.skip_truncate {
            attrs.insert("skip_truncate".to_owned(), Some("1".to_owned()));
        }
        if let Some(max) = opts.max_parallel_copy {
            attrs.insert("max_parallel_copy".to_owned(), Some(max.to_string()));
        }

        let attrs_str = (!attrs.is_empty())
            .then(|| db_urlencode(attrs.iter().map(|(k, v)| (k.as_str(), v.as_deref()))));
        let dest_param = (dest_table != tbl).then_some(dest_table.clone());

        exec_cmd(
            &self.db,
            "select * from cartage.local_add_table($1, $2, $3, $4, $5)",
            &[&self.cf.queue_name, &tbl, &tgargs, &attrs_str, &dest_param],
        )
        .await?;
        Ok(())
    }

    /// Recreate a table from the provider's definition: columns and pkey,
    /// plus defaults and indexes in full mode.
    async fn create_table_like(
        &self,
        src: &Client,
        src_table: &str,
        dest_table: &str,
        full: bool,
    ) -> anyhow::Result<()> {
        let (schema, name) = fq_name_parts(src_table);
        let rows = src
            .query(
                "select a.attname, format_type(a.atttypid, a.atttypmod) as coltype, \
                 a.attnotnull, pg_get_expr(d.adbin, d.adrelid) as coldefault \
                 from pg_catalog.pg_attribute a \
                 join pg_catalog.pg_class c on c.oid = a.attrelid \
                 join pg_catalog.pg_namespace n on n.oid = c.relnamespace \
                 left join pg_catalog.pg_attrdef d \
                   on d.adrelid = a.attrelid and d.adnum = a.attnum \
                 where n.nspname = $1 and c.relname = $2 \
                   and a.attnum > 0 and not a.attisdropped \
                 order by a.attnum",
                &[&schema, &name],
            )
            .await?;
        if rows.is_empty() {
            bail!("cannot read structure of {src_table}");
        }

        let mut defs = Vec::with_capacity(rows.len() + 1);
        for row in &rows {
            let colname: String = row.try_get("attname")?;
            let coltype: String = row.try_get("coltype")?;
            let notnull: bool = row.try_get("attnotnull")?;
            let coldefault: Option<String> = row.try_get("coldefault")?;
            let mut def = format!("{} {}", quote_ident(&colname), coltype);
            if full {
                if let Some(expr) = coldefault {
                    def.push_str(&format!(" default {expr}"));
                }
            }
            if notnull {
                def.push_str(" not null");
            }
            defs.push(def);
        }
        let pkeys = catalog::get_table_pkeys(src, src_table).await?;
        if !pkeys.is_empty() {
            let quoted: Vec<String> = pkeys.iter().map(|k| quote_ident(k)).collect();
            defs.push(format!("primary key ({})", quoted.join(", ")));
        }

        let sql = format!(
            "create table {} (\n    {}\n)",
            cartage_util::quote_fqident(dest_table),
            defs.join(",\n    ")
        );
        debug!(sql = %sql);
        self.db.batch_execute(&sql).await?;
        info!(table = dest_table, "table created");

        if full {
            // check and fkey definitions never embed the table's own name,
            // so they survive a rename
            let rows = src
                .query(
                    "select c.conname, pg_get_constraintdef(c.oid) as condef \
                     from pg_catalog.pg_constraint c \
                     join pg_catalog.pg_class r on r.oid = c.conrelid \
                     join pg_catalog.pg_namespace n on n.oid = r.relnamespace \
                     where n.nspname = $1 and r.relname = $2 \
                       and c.contype in ('c', 'f') \
                     order by c.conname",
                    &[&schema, &name],
                )
                .await?;
            for row in rows {
                let conname: String = row.try_get("conname")?;
                let condef: String = row.try_get("condef")?;
                let sql = format!(
                    "alter table {} add constraint {} {}",
                    cartage_util::quote_fqident(dest_table),
                    quote_ident(&conname),
                    condef
                );
                debug!(sql = %sql);
                self.db.batch_execute(&sql).await?;
            }

            // index definitions reference the source name, only portable
            // when the name is unchanged
            if dest_table != src_table {
                warn!(
                    table = dest_table,
                    "renamed table, skipping index creation"
                );
                return Ok(());
            }
            let rows = src
                .query(
                    "select pg_get_indexdef(i.indexrelid) as indexdef \
                     from pg_catalog.pg_index i \
                     join pg_catalog.pg_class c on c.oid = i.indrelid \
                     join pg_catalog.pg_namespace n on n.oid = c.relnamespace \
                     where n.nspname = $1 and c.relname = $2 and not i.indisprimary",
                    &[&schema, &name],
                )
                .await?;
            for row in rows {
                let indexdef: String = row.try_get("indexdef")?;
                debug!(sql = %indexdef);
                self.db.batch_execute(&indexdef).await?;
            }
        }
        Ok(())
    }

    pub async fn remove_table(&mut self, tables: &[String], all: bool) -> anyhow::Result<i32> {
        let opts = AddOpts {
            all,
            ..AddOpts::default()
        };
        let args = self.expand_arg_list('r', true, tables, false, &opts).await?;
        for tbl in args {
            exec_cmd(
                &self.db,
                "select * from cartage.local_remove_table($1, $2)",
                &[&self.cf.queue_name, &tbl],
            )
            .await?;
        }
        Ok(0)
    }

    pub async fn change_handler(&mut self, table: &str, opts: &AddOpts) -> anyhow::Result<i32> {
        let tbl = fq_name(table);
        let rows = self
            .db
            .query(
                "select table_attrs, coalesce(dest_table, table_name) as dest_table \
                 from cartage.get_table_list($1) where table_name = $2 and local",
                &[&self.cf.queue_name, &tbl],
            )
            .await?;
        let Some(row) = rows.first() else {
            bail!("table {tbl} not found on this node");
        };
        let r_attrs: Option<String> = row.try_get("table_attrs")?;
        let mut attrs = match r_attrs.as_deref() {
            Some(a) if !a.is_empty() => db_urldecode(a)?,
            _ => UrlMap::new(),
        };
        let old_handler = attrs.get("handler").cloned().flatten();

        let mut tgargs = self.build_tgargs(opts);
        let new_handler = match &opts.handler {
            Some(_) => Some(self.build_handler_string(&tbl, &mut tgargs, opts)?),
            None => None,
        };

        if old_handler == new_handler {
            info!("handler is already set to desired value, nothing done");
            return Ok(0);
        }
        match &new_handler {
            Some(hstr) => {
                attrs.insert("handler".to_owned(), Some(hstr.clone()));
            }
            None => {
                attrs.shift_remove("handler");
            }
        }

        let attrs_str = (!attrs.is_empty())
            .then(|| db_urlencode(attrs.iter().map(|(k, v)| (k.as_str(), v.as_deref()))));
        exec_cmd(
            &self.db,
            "select * from cartage.local_change_handler($1, $2, $3, $4)",
            &[&self.cf.queue_name, &tbl, &tgargs, &attrs_str],
        )
        .await?;
        Ok(0)
    }

    // -- sequences --------------------------------------------------------

    pub async fn add_seq(&mut self, seqs: &[String], opts: &AddOpts) -> anyhow::Result<i32> {
        let src_db = if self.is_root() {
            None
        } else {
            Some(self.provider_db(None).await?)
        };
        let src_seqs = match &src_db {
            Some(src) => self.fetch_seqs(src).await?,
            None => self.fetch_seqs(&self.db).await?,
        };
        let dst_seqs = self.fetch_seqs(&self.db).await?;
        self.sync_seq_list(&src_seqs, &dst_seqs).await?;

        let args = self.expand_arg_list('S', false, seqs, false, opts).await?;
        let create = CreateMode::from_opts(opts);

        for seq in args {
            let seq = fq_name(&seq);
            let seq_exists = catalog::exists_sequence(&self.db, &seq).await?;
            if create != CreateMode::None {
                if seq_exists {
                    info!(seq = %seq, "sequence already exists, not creating");
                } else {
                    let known_upstream = match &src_db {
                        Some(src) => catalog::exists_sequence(src, &seq).await?,
                        None => false,
                    };
                    if !known_upstream {
                        warn!(seq = %seq, "sequence missing on provider, skipping");
                        continue;
                    }
                    self.db
                        .batch_execute(&format!(
                            "create sequence {}",
                            cartage_util::quote_fqident(&seq)
                        ))
                        .await?;
                }
            } else if !seq_exists {
                if opts.skip_non_existing {
                    warn!(seq = %seq, "sequence missing on local node, skipping");
                    continue;
                }
                bail!("sequence {seq} missing on local node");
            }
            exec_cmd(
                &self.db,
                "select * from cartage.local_add_seq($1, $2)",
                &[&self.cf.queue_name, &seq],
            )
            .await?;
        }
        Ok(0)
    }

    async fn sync_seq_list(
        &self,
        src_seqs: &IndexMap<String, (bool, Option<i64>)>,
        dst_seqs: &IndexMap<String, (bool, Option<i64>)>,
    ) -> anyhow::Result<()> {
        for (seq, (_, last_value)) in src_seqs {
            if !self.cf.register_only_seqs.is_empty()
                && !self.cf.register_only_seqs.iter().any(|s| s == seq)
            {
                continue;
            }
            if self.cf.register_skip_seqs.iter().any(|s| s == seq) {
                continue;
            }
            if !dst_seqs.contains_key(seq) {
                info!(seq = %seq, "sequence info missing from subscriber, adding");
                exec_cmd(
                    &self.db,
                    "select * from cartage.global_update_seq($1, $2, $3)",
                    &[&self.cf.queue_name, seq, &last_value.unwrap_or(1)],
                )
                .await?;
            }
        }
        for seq in dst_seqs.keys() {
            if !src_seqs.contains_key(seq) {
                info!(seq = %seq, "sequence gone on provider, removing");
                exec_cmd(
                    &self.db,
                    "select * from cartage.global_remove_seq($1, $2)",
                    &[&self.cf.queue_name, seq],
                )
                .await?;
            }
        }
        Ok(())
    }

    pub async fn remove_seq(&mut self, seqs: &[String], all: bool) -> anyhow::Result<i32> {
        let opts = AddOpts {
            all,
            ..AddOpts::default()
        };
        let args = self.expand_arg_list('S', true, seqs, false, &opts).await?;
        for seq in args {
            exec_cmd(
                &self.db,
                "select * from cartage.local_remove_seq($1, $2)",
                &[&self.cf.queue_name, &seq],
            )
            .await?;
        }
        Ok(0)
    }

    // -- listings ---------------------------------------------------------

    pub async fn tables(&mut self, names_only: bool) -> anyhow::Result<i32> {
        let rows = self
            .db
            .query(
                "select table_name, merge_state, table_attrs \
                 from cartage.get_table_list($1) where local order by table_name",
                &[&self.cf.queue_name],
            )
            .await?;
        if names_only {
            for row in rows {
                println!("{}", row.get::<_, String>("table_name"));
            }
            return Ok(0);
        }
        println!("{:<40} {:<16} {}", "table_name", "merge_state", "table_attrs");
        for row in rows {
            let name: String = row.try_get("table_name")?;
            let state: Option<String> = row.try_get("merge_state")?;
            let attrs: Option<String> = row.try_get("table_attrs")?;
            println!(
                "{:<40} {:<16} {}",
                name,
                state.unwrap_or_default(),
                attrs.unwrap_or_default()
            );
        }
        Ok(0)
    }

    pub async fn seqs(&mut self) -> anyhow::Result<i32> {
        let rows = self
            .db
            .query(
                "select seq_name, local, last_value from cartage.get_seq_list($1)",
                &[&self.cf.queue_name],
            )
            .await?;
        println!("{:<40} {:<6} {}", "seq_name", "local", "last_value");
        for row in rows {
            let name: String = row.try_get("seq_name")?;
            let local: bool = row.try_get("local")?;
            let last: Option<i64> = row.try_get("last_value")?;
            println!(
                "{:<40} {:<6} {}",
                name,
                local,
                last.map_or_else(String::new, |v| v.to_string())
            );
        }
        Ok(0)
    }

    pub async fn missing(&mut self) -> anyhow::Result<i32> {
        let rows = self
            .db
            .query(
                "select * from cartage.local_show_missing($1)",
                &[&self.cf.queue_name],
            )
            .await?;
        for row in rows {
            let kind: String = row.try_get("obj_kind")?;
            let name: String = row.try_get("obj_name")?;
            println!("{kind}\t{name}");
        }
        Ok(0)
    }

    pub async fn fkeys(&mut self) -> anyhow::Result<i32> {
        let rows = self
            .db
            .query(
                "select * from cartage.get_valid_pending_fkeys($1)",
                &[&self.cf.queue_name],
            )
            .await?;
        println!("{:<30} {:<30} {}", "from_table", "to_table", "fkey_name");
        for row in rows {
            let from_table: String = row.try_get("from_table")?;
            let to_table: String = row.try_get("to_table")?;
            let fkey: String = row.try_get("fkey_name")?;
            println!("{from_table:<30} {to_table:<30} {fkey}");
        }
        Ok(0)
    }

    // -- resync / wait-sync / check ---------------------------------------

    pub async fn resync(&mut self, tables: &[String], opts: &AddOpts) -> anyhow::Result<i32> {
        let args = self.expand_arg_list('r', true, tables, false, opts).await?;

        if !opts.find_copy_node {
            let src = self.provider_db(opts.copy_node.as_deref()).await?;
            let src_tbls = self.fetch_set_tables(&src).await?;
            let mut problems = 0;
            for tbl in &args {
                let tbl = fq_name(tbl);
                if !src_tbls.get(&tbl).map(|i| i.local).unwrap_or(false) {
                    tracing::error!(
                        table = %tbl,
                        "table does not exist on provider, need to switch to different provider"
                    );
                    problems += 1;
                }
            }
            if problems > 0 {
                bail!("problems, canceling operation");
            }
        }

        if opts.find_copy_node || opts.copy_node.is_some() {
            let rows = self
                .db
                .query(
                    "select table_name, table_attrs \
                     from cartage.get_table_list($1) where local",
                    &[&self.cf.queue_name],
                )
                .await?;
            for row in rows {
                let name: String = row.try_get("table_name")?;
                if !args.contains(&name) {
                    continue;
                }
                let r_attrs: Option<String> = row.try_get("table_attrs")?;
                let mut attrs = match r_attrs.as_deref() {
                    Some(a) if !a.is_empty() => db_urldecode(a)?,
                    _ => UrlMap::new(),
                };
                if opts.find_copy_node {
                    attrs.insert("copy_node".to_owned(), Some("?".to_owned()));
                } else if let Some(node) = &opts.copy_node {
                    attrs.insert("copy_node".to_owned(), Some(node.clone()));
                }
                let attrs_str =
                    db_urlencode(attrs.iter().map(|(k, v)| (k.as_str(), v.as_deref())));
                exec_cmd(
                    &self.db,
                    "select * from cartage.local_set_table_attrs($1, $2, $3)",
                    &[&self.cf.queue_name, &name, &attrs_str],
                )
                .await?;
            }
        }

        for tbl in &args {
            exec_cmd(
                &self.db,
                "select * from cartage.local_set_table_state($1, $2, null, null)",
                &[&self.cf.queue_name, tbl],
            )
            .await?;
        }
        Ok(0)
    }

    pub async fn wait_sync(&mut self) -> anyhow::Result<i32> {
        self.wait_for_sync().await?;
        Ok(0)
    }

    async fn wait_for_sync(&self) -> anyhow::Result<()> {
        info!("waiting until all tables are in sync");
        let mut partial: HashMap<String, bool> = HashMap::new();
        let mut startup_info = false;

        loop {
            let rows = self
                .db
                .query(
                    "select table_name, merge_state \
                     from cartage.get_table_list($1) where local",
                    &[&self.cf.queue_name],
                )
                .await?;

            let mut total = 0usize;
            let mut behind = 0usize;
            let mut done_list = Vec::new();
            for row in rows {
                total += 1;
                let tbl: String = row.try_get("table_name")?;
                let state: Option<String> = row.try_get("merge_state")?;
                if state.as_deref() != Some("ok") {
                    partial.insert(tbl, false);
                    behind += 1;
                } else if let Some(done) = partial.get_mut(&tbl) {
                    if !*done {
                        *done = true;
                        done_list.push(tbl);
                    }
                }
            }

            if !startup_info {
                info!(behind, total, "tables to copy");
                startup_info = true;
            }
            for tbl in done_list {
                info!(table = %tbl, done = total - behind, total, "finished");
            }
            if behind == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        }
        info!("all done");
        Ok(())
    }

    /// Compare column structure of the table(s) on both sides.
    pub async fn check(&mut self, tables: &[String]) -> anyhow::Result<i32> {
        let src = self.provider_db(None).await?;
        let dst_tbls = self.fetch_set_tables(&self.db).await?;
        let list: Vec<String> = if tables.is_empty() {
            dst_tbls
                .iter()
                .filter(|(_, i)| i.local)
                .map(|(n, _)| n.clone())
                .collect()
        } else {
            tables.iter().map(|t| fq_name(t)).collect()
        };

        let mut bad = 0;
        for tbl in list {
            let dest = dst_tbls
                .get(&tbl)
                .map(|i| i.dest_table.clone())
                .unwrap_or_else(|| tbl.clone());
            let src_cols = catalog::get_table_columns(&src, &tbl).await?;
            let dst_cols = catalog::get_table_columns(&self.db, &dest).await?;
            if src_cols == dst_cols {
                info!(table = %tbl, "structure ok");
                continue;
            }
            let missing: Vec<&String> =
                src_cols.iter().filter(|c| !dst_cols.contains(c)).collect();
            let extra: Vec<&String> =
                dst_cols.iter().filter(|c| !src_cols.contains(c)).collect();
            warn!(table = %tbl, ?missing, ?extra, "structure mismatch");
            bad += 1;
        }
        Ok(if bad > 0 { 1 } else { 0 })
    }

    // -- execute ----------------------------------------------------------

    pub async fn execute(&mut self, files: &[PathBuf]) -> anyhow::Result<i32> {
        let tables = self.fetch_set_tables(&self.db).await?;
        let seqs = self.fetch_seqs(&self.db).await?;
        let mut local_tables = HashMap::new();
        for (name, info) in &tables {
            if info.local {
                local_tables.insert(name.clone(), info.dest_table.clone());
            }
        }
        let mut local_seqs = HashMap::new();
        for (name, (local, _)) in &seqs {
            if *local {
                local_seqs.insert(name.clone(), name.clone());
            }
        }

        let queue = self.cf.queue_name.clone();
        let tx = self.db.transaction().await?;
        tx.batch_execute("select cartage.set_session_replication_role('local', true)")
            .await?;

        for file in files {
            let sql = std::fs::read_to_string(file)
                .with_context(|| format!("cannot read {}", file.display()))?;
            let fname = file
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default();
            let attrs = ExecAttrs::from_sql(&sql)?;

            let res = exec_cmd(
                &tx,
                "select * from cartage.execute_start($1, $2, $3, true, $4)",
                &[&queue, &fname, &sql, &attrs.to_urlenc()],
            )
            .await?;
            let ret: i32 = res
                .first()
                .map(|r| r.try_get("ret_code"))
                .transpose()?
                .unwrap_or(200);
            if ret > 200 {
                warn!(file = %fname, "skipping execution");
                continue;
            }

            if attrs.need_execute(&tx, &local_tables, &local_seqs).await? {
                info!(file = %fname, "executing sql");
                let xsql = attrs.process_sql(&sql, &local_tables, &local_seqs)?;
                for stmt in parse_statements(&xsql) {
                    tx.batch_execute(&stmt).await?;
                }
            } else {
                info!(file = %fname, "this SQL does not need to run on this node");
            }

            exec_cmd(
                &tx,
                "select * from cartage.execute_finish($1, $2)",
                &[&queue, &fname],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(0)
    }

    // -- copy source discovery --------------------------------------------

    /// Walk the cascade upstream until a node has all requested tables in
    /// `ok` state with data-carrying handlers.
    async fn find_copy_source(
        &self,
        tables: &[String],
        node_name: &str,
        node_location: &str,
    ) -> anyhow::Result<(String, String, Option<String>)> {
        let need: HashSet<String> = tables.iter().map(|t| fq_name(t)).collect();
        let mut node_name = node_name.to_owned();
        let mut location = node_location.to_owned();
        let mut worker_name: Option<String> = None;

        loop {
            let db = connect_database(&location).await?;
            let info = NodeInfo::load(&db, &self.cf.queue_name).await?;
            info!(node = %info.node_name, "checking if node can be used for copy");

            let rows = db
                .query(
                    "select table_name, local, merge_state, table_attrs \
                     from cartage.get_table_list($1)",
                    &[&self.cf.queue_name],
                )
                .await?;
            let mut got = HashSet::new();
            for row in rows {
                let tbl: String = row.try_get("table_name")?;
                if !need.contains(&tbl) {
                    continue;
                }
                let local: bool = row.try_get("local")?;
                if !local {
                    debug!(table = %tbl, "problem: not local");
                    continue;
                }
                let state: Option<String> = row.try_get("merge_state")?;
                if state.as_deref() != Some("ok") {
                    debug!(table = %tbl, "problem: not in sync");
                    continue;
                }
                let attrs: Option<String> = row.try_get("table_attrs")?;
                if !self.registry.handler_allows_copy(attrs.as_deref())? {
                    debug!(table = %tbl, "problem: handler does not store data");
                    continue;
                }
                got.insert(tbl);
            }

            if got == need {
                info!(node = %info.node_name, "node seems a good source, using it");
                return Ok((info.node_name, location, worker_name));
            }
            info!(node = %info.node_name, "node does not have all tables");

            if info.node_type == NodeType::Root {
                bail!("found root and no copy source");
            }
            node_name = info
                .provider_node
                .clone()
                .with_context(|| format!("node {node_name} has no provider"))?;
            location = info
                .provider_location
                .clone()
                .with_context(|| format!("no location for node {node_name}"))?;
            worker_name = info.worker_name.clone();
        }
    }

    // -- handlers ---------------------------------------------------------

    pub fn show_handlers(cf: Config, names: &[String]) -> anyhow::Result<i32> {
        let registry = HandlerRegistry::new(cf.handler_context()?);
        let all = registry.list();
        if names.is_empty() {
            for (name, summary) in all {
                println!("{name} - {summary}");
            }
            return Ok(0);
        }
        let mut code = 0;
        for wanted in names {
            match all.iter().find(|(name, _)| name == wanted) {
                Some((name, summary)) => println!("{name} - {summary}"),
                None => {
                    warn!(handler = %wanted, "unknown handler");
                    code = 1;
                }
            }
        }
        Ok(code)
    }
}
