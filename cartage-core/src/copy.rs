//! Initial table copy, run in a worker process of its own.
//!
//! The main worker spawns `cartage <config> copy <table> -d` when a table
//! enters in-copy; this module is that process.  It bulk-loads the table
//! under a repeatable-read snapshot, records the snapshot so replay can
//! skip rows the copy already saw, then consumes the queue itself until it
//! can hand the table back to the main worker at an agreed tick.

use std::time::Duration;

use tokio::time::sleep;
use tokio_postgres::{Client, IsolationLevel};
use tracing::{info, warn};

use cartage_handlers::Handler;
use cartage_queue::catalog::{client_encoding, get_table_columns};
use cartage_util::pidfile::{copy_pidfile, wait_for_pidfile, PidFile};
use cartage_util::{fq_name, quote_fqident, quote_literal};

use crate::config::Config;
use crate::replay::{exec_cmd, Replicator};
use crate::state::TablePhase;
use crate::WorkerError;

/// Entry point of the copy subcommand.
pub async fn run_copy_worker(cf: Config, table_name: &str) -> Result<(), WorkerError> {
    let table_name = fq_name(table_name);

    // serialize against an older copy of the same table
    let _pidfile = match &cf.pidfile {
        Some(base) => {
            let path = copy_pidfile(base, &table_name);
            wait_for_pidfile(&path, Duration::from_secs(2));
            Some(PidFile::take(path)?)
        }
        None => None,
    };

    let mut worker = Replicator::new(cf, Some(table_name))?;
    worker.run().await
}

impl Replicator {
    /// Bulk-load one table from the provider.
    pub(crate) async fn do_copy(
        &mut self,
        name: &str,
        src: &mut Client,
        dst: &mut Client,
    ) -> Result<(), WorkerError> {
        // partition merge: wait until the lead copy has loaded the data
        loop {
            let role = self.table_mut(name).and_then(|t| t.copy_role.clone());
            if role.as_deref() != Some("wait-copy") {
                break;
            }
            info!(table = name, "waiting for merge lead to finish copy");
            sleep(Duration::from_secs(2)).await;
            self.load_table_state(&*dst).await?;
        }

        let (dest_table, skip_truncate) = {
            let t = self
                .table_mut(name)
                .ok_or_else(|| WorkerError::State(format!("copy: lost table {name}")))?;
            let skip = t
                .table_attrs
                .get("skip_truncate")
                .cloned()
                .flatten()
                .is_some_and(|v| v == "1");
            (t.dest_table.clone(), skip)
        };
        let mut plugin = self
            .table_mut(name)
            .and_then(|t| t.plugin.take())
            .ok_or_else(|| WorkerError::State(format!("no handler bound for {name}")))?;

        // snapshot transaction on the provider side
        let src_tx = src
            .build_transaction()
            .isolation_level(IsolationLevel::RepeatableRead)
            .start()
            .await?;
        let snap_row = src_tx
            .query_one("select txid_current_snapshot()::text as snap", &[])
            .await?;
        let snapshot: String = snap_row.try_get("snap")?;
        let src_enc = client_encoding(&src_tx).await?;

        // record where the copy started; replay filters against this
        if let Some(t) = self.table_mut(name) {
            t.change_snapshot(Some(snapshot.clone()), true);
        }
        self.save_table_state(&*dst).await?;

        let result = self
            .copy_table_data(
                name,
                &dest_table,
                skip_truncate,
                plugin.as_mut(),
                &src_tx,
                dst,
                &src_enc,
            )
            .await;

        if let Some(t) = self.table_mut(name) {
            t.plugin = Some(plugin);
        }
        result?;
        src_tx.commit().await?;

        self.change_table_state(dst, name, TablePhase::CatchingUp, None)
            .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn copy_table_data(
        &mut self,
        name: &str,
        dest_table: &str,
        skip_truncate: bool,
        plugin: &mut dyn Handler,
        src_tx: &tokio_postgres::Transaction<'_>,
        dst: &mut Client,
        src_enc: &str,
    ) -> Result<(), WorkerError> {
        let needs_table = plugin.needs_table();

        let dst_tx = dst.transaction().await?;

        // intersect columns; the destination may carry extras
        let src_cols = get_table_columns(src_tx, name).await?;
        let common: Vec<String> = if needs_table {
            let dst_cols = get_table_columns(&dst_tx, dest_table).await?;
            let common: Vec<String> = src_cols
                .iter()
                .filter(|c| dst_cols.contains(c))
                .cloned()
                .collect();
            if common.is_empty() {
                return Err(WorkerError::State(format!(
                    "no common columns between {name} and {dest_table}"
                )));
            }
            if common.len() != src_cols.len() || common.len() != dst_cols.len() {
                warn!(
                    table = name,
                    src = src_cols.len(),
                    dst = dst_cols.len(),
                    common = common.len(),
                    "column lists differ, copying the intersection"
                );
            }
            common
        } else {
            src_cols
        };

        if needs_table && !skip_truncate {
            info!(table = dest_table, "truncating destination");
            dst_tx
                .batch_execute(&format!("truncate only {}", quote_fqident(dest_table)))
                .await?;
        }

        // secondary indexes slow the load; save and drop them, catch-up
        // puts them back
        if self.cf.copy_drop_indexes && needs_table {
            self.drop_copy_indexes(name, dest_table, &dst_tx).await?;
        }

        let threaded = self.copy_method(name).filter(|n| *n > 1);
        let stats = match threaded {
            Some(parallel) => {
                // the inserters run on their own connections; the truncate
                // and index locks must be released before they connect
                dst_tx.commit().await?;
                let dst_tx = dst.transaction().await?;
                let setup = vec![
                    "select cartage.set_session_replication_role('replica', true)".to_owned(),
                    format!("set client_encoding = {}", quote_literal(Some(src_enc))),
                ];
                let stats = plugin
                    .real_copy_threaded(
                        name,
                        src_tx,
                        &dst_tx,
                        &self.cf.db,
                        &common,
                        parallel,
                        &setup,
                    )
                    .await?;
                dst_tx.commit().await?;
                stats
            }
            None => {
                let stats = plugin.real_copy(name, src_tx, &dst_tx, &common).await?;
                dst_tx.commit().await?;
                stats
            }
        };
        info!(
            table = name,
            bytes = stats.bytes,
            rows = stats.rows,
            "copy finished"
        );
        Ok(())
    }

    /// Save the definitions of non-unique secondary indexes, then drop
    /// them for the duration of the load.
    async fn drop_copy_indexes(
        &mut self,
        name: &str,
        dest_table: &str,
        dst_tx: &tokio_postgres::Transaction<'_>,
    ) -> Result<(), WorkerError> {
        let already_dropped = self
            .table_mut(name)
            .map(|t| t.dropped_ddl.is_some())
            .unwrap_or(false);
        if already_dropped {
            return Ok(());
        }

        let (schema, table) = cartage_util::fq_name_parts(dest_table);
        let rows = dst_tx
            .query(
                "select indexname, indexdef from pg_catalog.pg_indexes \
                 where schemaname = $1 and tablename = $2 \
                   and indexdef not like 'CREATE UNIQUE INDEX%'",
                &[&schema, &table],
            )
            .await?;
        if rows.is_empty() {
            return Ok(());
        }

        let mut ddl = Vec::with_capacity(rows.len());
        for row in &rows {
            let indexname: String = row.try_get("indexname")?;
            let indexdef: String = row.try_get("indexdef")?;
            info!(index = %indexname, "dropping index for copy");
            dst_tx
                .batch_execute(&format!(
                    "drop index {}.{}",
                    cartage_util::quote_ident(schema),
                    cartage_util::quote_ident(&indexname)
                ))
                .await?;
            ddl.push(format!("{indexdef};"));
        }
        let ddl = ddl.join("\n");
        exec_cmd(
            dst_tx,
            "select * from cartage.local_set_table_struct($1, $2, $3)",
            &[&self.cf.queue_name, &name, &ddl],
        )
        .await?;
        if let Some(t) = self.table_mut(name) {
            t.dropped_ddl = Some(ddl);
        }
        Ok(())
    }
}
