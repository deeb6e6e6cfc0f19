//! Count/checksum comparison of one table on both sides.

use async_trait::async_trait;
use tokio_postgres::Client;
use tracing::{debug, info, warn};

use cartage_core::Config;
use cartage_handlers::Handler as _;
use cartage_util::{fq_name_parts, quote_fqident, quote_ident};

use crate::{SyncError, SyncRunner, SyncTable, EXIT_MISMATCH};

const DEFAULT_COMPARE_SQL: &str = "select count(1) as cnt, \
     sum(hashtext(_COLS_::text)::bigint) as chksum from only _TABLE_";
const DEFAULT_COUNT_SQL: &str = "select count(1) as cnt from only _TABLE_";

pub struct Comparator {
    /// Just count rows, skip the checksum.
    pub count_only: bool,
}

impl Comparator {
    pub fn new(count_only: bool) -> Comparator {
        Comparator { count_only }
    }

    async fn load_cols(db: &Client, table: &str) -> Result<Vec<String>, SyncError> {
        let (schema, name) = fq_name_parts(table);
        let rows = db
            .query(
                "select column_name from information_schema.columns \
                 where table_schema = $1 and table_name = $2 \
                 order by ordinal_position",
                &[&schema, &name],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    /// Quoted tuple of the columns present on both sides.
    async fn calc_cols(
        src: &Client,
        src_tbl: &str,
        dst: &Client,
        dst_tbl: &str,
    ) -> Result<String, SyncError> {
        let cols1 = Self::load_cols(src, src_tbl).await?;
        let cols2 = Self::load_cols(dst, dst_tbl).await?;
        let common: Vec<&String> = cols1.iter().filter(|c| cols2.contains(c)).collect();
        if common.is_empty() {
            return Err(SyncError::Structural(format!(
                "no common columns between {src_tbl} and {dst_tbl}"
            )));
        }
        if common.len() != cols1.len() || cols2.len() != cols1.len() {
            warn!(src_tbl, dst_tbl, "ignoring some columns");
        }
        let quoted: Vec<String> = common.iter().map(|c| quote_ident(c)).collect();
        Ok(format!("({})", quoted.join(",")))
    }

    async fn run_side(
        db: &Client,
        query: &str,
        fmt: &str,
        count_only: bool,
    ) -> Result<String, SyncError> {
        debug!(query, "comparing");
        let row = db.query_one(query, &[]).await?;
        let cnt: i64 = row.try_get("cnt")?;
        let mut out = fmt.replace("%(cnt)d", &cnt.to_string());
        if !count_only {
            let chksum: Option<i64> = row.try_get("chksum")?;
            let chksum = chksum.map_or_else(|| "null".to_owned(), |c| c.to_string());
            out = out.replace("%(chksum)s", &chksum);
        }
        Ok(out)
    }
}

#[async_trait]
impl SyncRunner for Comparator {
    async fn process_sync(
        &mut self,
        cf: &Config,
        src_info: &mut SyncTable,
        dst_info: &mut SyncTable,
        src: &mut Client,
        dst: &mut Client,
    ) -> Result<i32, SyncError> {
        let src_tbl = src_info.dest_table.clone();
        let dst_tbl = dst_info.dest_table.clone();

        // shard and friends filter both sides the same way
        let condition = {
            let src_tx = src.transaction().await?;
            let dst_tx = dst.transaction().await?;
            let cond = dst_info
                .plugin
                .get_copy_condition(&src_tx, &dst_tx)
                .await?;
            src_tx.rollback().await?;
            dst_tx.rollback().await?;
            cond
        };

        info!(table = %dst_tbl, "counting");
        let cols = Self::calc_cols(src, &src_tbl, dst, &dst_tbl).await?;

        let base = match &cf.compare_sql {
            Some(sql) => sql.clone(),
            None if self.count_only => DEFAULT_COUNT_SQL.to_owned(),
            None => DEFAULT_COMPARE_SQL.to_owned(),
        };
        let base = base.replace("_COLS_", &cols);

        let mut src_q = base.replace("_TABLE_", &quote_fqident(&src_tbl));
        let mut dst_q = base.replace("_TABLE_", &quote_fqident(&dst_tbl));
        if !condition.is_empty() {
            src_q = format!("{src_q} WHERE {condition}");
            dst_q = format!("{dst_q} WHERE {condition}");
        }

        let fmt = match &cf.compare_fmt {
            Some(fmt) => fmt.clone(),
            None if self.count_only => "%(cnt)d rows".to_owned(),
            None => "%(cnt)d rows, checksum=%(chksum)s".to_owned(),
        };

        let src_str = Self::run_side(src, &src_q, &fmt, self.count_only).await?;
        info!(side = "src", result = %src_str);
        let dst_str = Self::run_side(dst, &dst_q, &fmt, self.count_only).await?;
        info!(side = "dst", result = %dst_str);

        if src_str != dst_str {
            warn!(table = %dst_tbl, src = %src_str, dst = %dst_str, "results do not match");
            return Ok(EXIT_MISMATCH);
        }
        Ok(0)
    }
}
