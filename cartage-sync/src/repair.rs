//! Repair: sorted-dump diff of one table, producing or applying fixes.
//!
//! Both sides are dumped with COPY in primary-key-first column order,
//! sorted with the external `sort` in C locale, and merge-scanned.  A key
//! only on the provider is a missed insert, a key only on the subscriber a
//! missed delete, a shared key with different data a missed update.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use async_trait::async_trait;
use futures::{pin_mut, StreamExt};
use tokio_postgres::Client;
use tracing::{debug, info};

use cartage_core::Config;
use cartage_handlers::Handler as _;
use cartage_queue::catalog::{get_table_columns, get_table_pkeys};
use cartage_util::{quote_fqident, quote_ident, quote_literal, unescape_copy};

use crate::{SyncError, SyncRunner, SyncTable};

pub struct Repairer {
    /// Apply fixes directly instead of writing a fix file.
    pub apply: bool,
    /// Buffer size for coreutils sort, default 30%.
    pub sort_bufsize: Option<String>,
    /// Extra row filter ANDed with the handler's copy condition.
    pub repair_where: Option<String>,

    pkey_list: Vec<String>,
    common_fields: Vec<String>,
    cnt_insert: u64,
    cnt_update: u64,
    cnt_delete: u64,
}

impl Repairer {
    pub fn new(apply: bool, sort_bufsize: Option<String>, repair_where: Option<String>) -> Repairer {
        Repairer {
            apply,
            sort_bufsize,
            repair_where,
            pkey_list: Vec::new(),
            common_fields: Vec::new(),
            cnt_insert: 0,
            cnt_update: 0,
            cnt_delete: 0,
        }
    }

    /// Common columns of both sides, pkeys first.  Pkeys must match
    /// exactly.
    async fn load_common_columns(
        &mut self,
        src: &Client,
        src_tbl: &str,
        dst: &Client,
        dst_tbl: &str,
    ) -> Result<(), SyncError> {
        self.pkey_list = get_table_pkeys(src, src_tbl).await?;
        let dst_pkey = get_table_pkeys(dst, dst_tbl).await?;
        if dst_pkey != self.pkey_list {
            return Err(SyncError::Structural(format!(
                "primary keys do not match: {:?} vs {:?}",
                self.pkey_list, dst_pkey
            )));
        }

        let src_cols = get_table_columns(src, src_tbl).await?;
        let dst_cols = get_table_columns(dst, dst_tbl).await?;
        let mut field_list = self.pkey_list.clone();
        for f in &src_cols {
            if self.pkey_list.contains(f) || !dst_cols.contains(f) {
                continue;
            }
            field_list.push(f.clone());
        }
        debug!(columns = ?field_list, "using columns");
        self.common_fields = field_list;
        Ok(())
    }

    /// COPY one side into a file.
    async fn dump_table(
        &self,
        db: &mut Client,
        tbl: &str,
        path: &Path,
        condition: &str,
    ) -> Result<(), SyncError> {
        let cols: Vec<String> = self.common_fields.iter().map(|c| quote_ident(c)).collect();
        let whr = if condition.is_empty() { "true" } else { condition };
        let q = format!(
            "copy (SELECT {} FROM {} WHERE {}) to stdout",
            cols.join(","),
            quote_fqident(tbl),
            whr
        );
        debug!(query = %q, "dumping");

        let tx = db.transaction().await?;
        let stream = tx.copy_out(&q).await?;
        pin_mut!(stream);
        let mut file = File::create(path)?;
        let mut size = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(SyncError::Db)?;
            size += chunk.len() as u64;
            file.write_all(&chunk)?;
        }
        file.flush()?;
        tx.commit().await?;
        info!(table = tbl, bytes = size, "dumped");
        Ok(())
    }

    /// Sort a dump in C locale so the merge scan sees a total key order.
    fn do_sort(&self, src: &Path, dst: &Path) -> Result<(), SyncError> {
        let version = Command::new("sort").arg("--version").output();
        let is_coreutils = matches!(
            &version,
            Ok(out) if String::from_utf8_lossy(&out.stdout).contains("coreutils")
        );

        let mut cmd = Command::new("sort");
        cmd.env("LANG", "C").env("LC_ALL", "C").arg("-T").arg(".");
        if is_coreutils {
            cmd.arg("-S")
                .arg(self.sort_bufsize.as_deref().unwrap_or("30%"));
        }
        cmd.arg("-o").arg(dst).arg(src);
        let status = cmd.status()?;
        if !status.success() {
            return Err(SyncError::Structural(format!("sort failed: {status}")));
        }
        Ok(())
    }

    fn get_row(&self, line: Option<&str>) -> Option<Vec<String>> {
        let line = line?;
        let line = line.strip_suffix('\n').unwrap_or(line);
        Some(line.split('\t').map(str::to_owned).collect())
    }

    fn field(&self, row: &[String], name: &str) -> String {
        self.common_fields
            .iter()
            .position(|f| f == name)
            .and_then(|i| row.get(i).cloned())
            .unwrap_or_default()
    }

    /// Compare one field, tolerating a `+hh` timezone suffix present on
    /// only one side.
    fn cmp_value(v1: &str, v2: &str) -> bool {
        if v1 == v2 {
            return true;
        }
        let (z1, z2) = (v1.len(), v2.len());
        if z1 == z2 + 3 && z2 >= 19 && v1.as_bytes()[z2] == b'+' {
            return &v1[..z2] == v2;
        }
        if z1 + 3 == z2 && z1 >= 19 && v2.as_bytes()[z1] == b'+' {
            return v1 == &v2[..z1];
        }
        false
    }

    /// -1 if src < dst, 0 equal, 1 if src > dst.  A missing row sorts
    /// after everything.
    fn cmp_keys(&self, src_row: Option<&Vec<String>>, dst_row: Option<&Vec<String>>) -> i32 {
        match (src_row, dst_row) {
            (None, None) => 0,
            (None, Some(_)) => 1,
            (Some(_), None) => -1,
            (Some(src), Some(dst)) => {
                for key in &self.pkey_list {
                    let v1 = self.field(src, key);
                    let v2 = self.field(dst, key);
                    match v1.cmp(&v2) {
                        std::cmp::Ordering::Less => return -1,
                        std::cmp::Ordering::Greater => return 1,
                        std::cmp::Ordering::Equal => {}
                    }
                }
                0
            }
        }
    }

    fn cmp_data(&self, src_row: &[String], dst_row: &[String]) -> bool {
        for (i, _field) in self.common_fields.iter().enumerate() {
            let v1 = src_row.get(i).map(String::as_str).unwrap_or_default();
            let v2 = dst_row.get(i).map(String::as_str).unwrap_or_default();
            if !Self::cmp_value(v1, v2) {
                return false;
            }
        }
        true
    }

    fn addeq(&self, list: &mut Vec<String>, field: &str, value: Option<String>) {
        list.push(format!(
            "{} = {}",
            quote_ident(field),
            quote_literal(value.as_deref())
        ));
    }

    fn addcmp(&self, list: &mut Vec<String>, field: &str, value: Option<String>) {
        match value {
            None => list.push(format!("{} is null", quote_ident(field))),
            Some(v) => list.push(format!(
                "{} = {}",
                quote_ident(field),
                quote_literal(Some(v.as_str()))
            )),
        }
    }

    fn missed_insert(&mut self, tbl: &str, src_row: &[String]) -> String {
        self.cnt_insert += 1;
        let mut fields = Vec::new();
        let mut values = Vec::new();
        for f in &self.common_fields {
            fields.push(quote_ident(f));
            let v = unescape_copy(&self.field(src_row, f));
            values.push(quote_literal(v.as_deref()));
        }
        format!(
            "insert into {} ({}) values ({});",
            quote_fqident(tbl),
            fields.join(", "),
            values.join(", ")
        )
    }

    fn missed_update(&mut self, tbl: &str, src_row: &[String], dst_row: &[String]) -> String {
        self.cnt_update += 1;
        let mut set_list = Vec::new();
        let mut where_list = Vec::new();
        for f in &self.pkey_list {
            let v = unescape_copy(&self.field(src_row, f));
            self.addcmp(&mut where_list, f, v);
        }
        for f in &self.common_fields {
            let v1 = self.field(src_row, f);
            let v2 = self.field(dst_row, f);
            if Self::cmp_value(&v1, &v2) {
                continue;
            }
            self.addeq(&mut set_list, f, unescape_copy(&v1));
            self.addcmp(&mut where_list, f, unescape_copy(&v2));
        }
        format!(
            "update only {} set {} where {};",
            quote_fqident(tbl),
            set_list.join(", "),
            where_list.join(" and ")
        )
    }

    fn missed_delete(&mut self, tbl: &str, dst_row: &[String]) -> String {
        self.cnt_delete += 1;
        let mut where_list = Vec::new();
        for f in &self.pkey_list {
            let v = unescape_copy(&self.field(dst_row, f));
            self.addcmp(&mut where_list, f, v);
        }
        format!(
            "delete from only {} where {};",
            quote_fqident(tbl),
            where_list.join(" and ")
        )
    }

    async fn show_fix(
        &mut self,
        apply_db: Option<&Client>,
        tbl: &str,
        sql: &str,
    ) -> Result<(), SyncError> {
        debug!(sql, "missed change");
        match apply_db {
            Some(db) => {
                db.batch_execute(sql).await?;
            }
            None => {
                let path = format!("fix.{tbl}.sql");
                let mut f = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                writeln!(f, "{sql}")?;
            }
        }
        Ok(())
    }

    /// Merge-scan the two sorted dumps and emit fixes.
    async fn dump_compare(
        &mut self,
        apply_db: Option<&Client>,
        tbl: &str,
        src_path: &Path,
        dst_path: &Path,
    ) -> Result<(), SyncError> {
        info!(table = tbl, "comparing dumps");
        self.cnt_insert = 0;
        self.cnt_update = 0;
        self.cnt_delete = 0;
        let mut total_src = 0u64;
        let mut total_dst = 0u64;

        let fix = format!("fix.{tbl}.sql");
        if Path::new(&fix).is_file() {
            std::fs::remove_file(&fix)?;
        }

        let mut f1 = BufReader::new(File::open(src_path)?).lines();
        let mut f2 = BufReader::new(File::open(dst_path)?).lines();
        let mut src_ln = f1.next().transpose()?;
        let mut dst_ln = f2.next().transpose()?;
        if src_ln.is_some() {
            total_src += 1;
        }
        if dst_ln.is_some() {
            total_dst += 1;
        }

        while src_ln.is_some() || dst_ln.is_some() {
            let mut keep_src = false;
            let mut keep_dst = false;
            if src_ln != dst_ln {
                let src_row = self.get_row(src_ln.as_deref());
                let dst_row = self.get_row(dst_ln.as_deref());
                match self.cmp_keys(src_row.as_ref(), dst_row.as_ref()) {
                    d if d > 0 => {
                        let sql =
                            self.missed_delete(tbl, dst_row.as_deref().unwrap_or_default());
                        self.show_fix(apply_db, tbl, &sql).await?;
                        keep_src = true;
                    }
                    d if d < 0 => {
                        let sql =
                            self.missed_insert(tbl, src_row.as_deref().unwrap_or_default());
                        self.show_fix(apply_db, tbl, &sql).await?;
                        keep_dst = true;
                    }
                    _ => {
                        let src_row = src_row.unwrap_or_default();
                        let dst_row = dst_row.unwrap_or_default();
                        if !self.cmp_data(&src_row, &dst_row) {
                            let sql = self.missed_update(tbl, &src_row, &dst_row);
                            self.show_fix(apply_db, tbl, &sql).await?;
                        }
                    }
                }
            }

            if !keep_src {
                src_ln = f1.next().transpose()?;
                if src_ln.is_some() {
                    total_src += 1;
                }
            }
            if !keep_dst {
                dst_ln = f2.next().transpose()?;
                if dst_ln.is_some() {
                    total_dst += 1;
                }
            }
        }

        info!(
            table = tbl,
            src_rows = total_src,
            dst_rows = total_dst,
            missed_inserts = self.cnt_insert,
            missed_updates = self.cnt_update,
            missed_deletes = self.cnt_delete,
            "repair finished"
        );
        Ok(())
    }
}

#[async_trait]
impl SyncRunner for Repairer {
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

        // triggers must not see the fixes
        let apply_db = if self.apply {
            let db = cartage_queue::copydata::connect_database(&cf.db).await?;
            db.batch_execute("select cartage.set_session_replication_role('replica', false)")
                .await?;
            Some(db)
        } else {
            None
        };

        info!(table = %dst_tbl, "checking");
        self.load_common_columns(src, &src_tbl, dst, &dst_tbl).await?;

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
        let condition = match (&self.repair_where, condition.is_empty()) {
            (Some(extra), false) => format!("{condition} and {extra}"),
            (Some(extra), true) => extra.clone(),
            (None, _) => condition,
        };

        let dump_src = PathBuf::from(format!("{dst_tbl}.src"));
        let dump_dst = PathBuf::from(format!("{dst_tbl}.dst"));
        let dump_src_sorted = PathBuf::from(format!("{dst_tbl}.src.sorted"));
        let dump_dst_sorted = PathBuf::from(format!("{dst_tbl}.dst.sorted"));

        info!(table = %src_tbl, condition = %condition, "dumping provider table");
        self.dump_table(src, &src_tbl, &dump_src, &condition).await?;
        info!(table = %dst_tbl, condition = %condition, "dumping subscriber table");
        self.dump_table(dst, &dst_tbl, &dump_dst, &condition).await?;

        info!("sorting dumps");
        self.do_sort(&dump_src, &dump_src_sorted)?;
        self.do_sort(&dump_dst, &dump_dst_sorted)?;

        self.dump_compare(apply_db.as_ref(), &dst_tbl, &dump_src_sorted, &dump_dst_sorted)
            .await?;

        for path in [&dump_src, &dump_dst, &dump_src_sorted, &dump_dst_sorted] {
            let _ = std::fs::remove_file(path);
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repairer() -> Repairer {
        let mut r = Repairer::new(false, None, None);
        r.pkey_list = vec!["id".to_owned()];
        r.common_fields = vec!["id".to_owned(), "v".to_owned()];
        r
    }

    #[test]
    fn key_comparison() {
        let r = repairer();
        let a = vec!["1".to_owned(), "x".to_owned()];
        let b = vec!["2".to_owned(), "x".to_owned()];
        assert_eq!(r.cmp_keys(Some(&a), Some(&b)), -1);
        assert_eq!(r.cmp_keys(Some(&b), Some(&a)), 1);
        assert_eq!(r.cmp_keys(Some(&a), Some(&a)), 0);
        // EOF sorts after everything
        assert_eq!(r.cmp_keys(None, Some(&a)), 1);
        assert_eq!(r.cmp_keys(Some(&a), None), -1);
    }

    #[test]
    fn timezone_suffix_tolerated() {
        assert!(Repairer::cmp_value(
            "2024-01-01 10:00:00+02",
            "2024-01-01 10:00:00"
        ));
        assert!(Repairer::cmp_value(
            "2024-01-01 10:00:00",
            "2024-01-01 10:00:00+02"
        ));
        assert!(!Repairer::cmp_value(
            "2024-01-01 10:00:00+02",
            "2024-01-01 11:00:00"
        ));
        assert!(!Repairer::cmp_value("abc", "abc+02"));
    }

    #[test]
    fn fix_statements() {
        let mut r = repairer();
        let src = vec!["5".to_owned(), "x".to_owned()];
        let dst = vec!["5".to_owned(), "y".to_owned()];
        assert_eq!(
            r.missed_update("public.t", &src, &dst),
            "update only public.t set v = 'x' where id = '5' and v = 'y';"
        );
        assert_eq!(
            r.missed_insert("public.t", &src),
            "insert into public.t (id, v) values ('5', 'x');"
        );
        assert_eq!(
            r.missed_delete("public.t", &dst),
            "delete from only public.t where id = '5';"
        );
        assert_eq!((r.cnt_insert, r.cnt_update, r.cnt_delete), (1, 1, 1));
    }

    #[test]
    fn null_handling_in_fixes() {
        let mut r = repairer();
        let dst = vec!["7".to_owned(), "\\N".to_owned()];
        // pkey null would be odd, but the generator must not crash on it
        assert_eq!(
            r.missed_delete("t", &dst),
            "delete from only public.t where id = '7';"
        );
        let src = vec!["7".to_owned(), "\\N".to_owned()];
        assert_eq!(
            r.missed_insert("t", &src),
            "insert into public.t (id, v) values ('7', null);"
        );
    }
}
