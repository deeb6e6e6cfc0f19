//! Send every event to a database function instead of applying rows.

use async_trait::async_trait;
use tokio_postgres::Transaction;

use cartage_queue::{BatchInfo, Event};
use cartage_util::{db_urlencode, quote_fqident, quote_literal};

use crate::args::HandlerArgs;
use crate::{HandlerError, SqlQueue};

/// Call a database function for every event.
///
/// Arguments:
///   func_name=NAME - database function name
///   func_conf=CONF - opaque conf string passed as first argument
pub struct ApplyFuncHandler {
    name: &'static str,
    dest_table: String,
    func_name: String,
    func_conf: String,
    cur_tick: Option<i64>,
    multimaster: bool,
}

const APPLYFN_ARGS: &[&str] = &["func_name", "func_conf"];

impl ApplyFuncHandler {
    pub fn build(
        _table_name: &str,
        args: &HandlerArgs,
        dest_table: &str,
    ) -> Result<ApplyFuncHandler, HandlerError> {
        args.validate(APPLYFN_ARGS)?;
        Ok(ApplyFuncHandler {
            name: "applyfn",
            dest_table: dest_table.to_owned(),
            func_name: args.get("func_name").unwrap_or("undefined").to_owned(),
            func_conf: args.get("func_conf").unwrap_or("").to_owned(),
            cur_tick: None,
            multimaster: false,
        })
    }

    /// Multimaster preset: a fixed merge function, with all the given args
    /// folded into its conf string.  Accepts any argument.
    pub fn build_multimaster(
        _table_name: &str,
        args: &HandlerArgs,
        dest_table: &str,
    ) -> Result<ApplyFuncHandler, HandlerError> {
        let conf_pairs: Vec<(&str, Option<&str>)> = args
            .iter()
            .filter(|(k, _)| !APPLYFN_ARGS.contains(k))
            .map(|(k, v)| (k, Some(v)))
            .collect();
        Ok(ApplyFuncHandler {
            name: "multimaster",
            dest_table: dest_table.to_owned(),
            func_name: "merge_on_time".to_owned(),
            func_conf: db_urlencode(conf_pairs),
            cur_tick: None,
            multimaster: true,
        })
    }
}

fn opt_i64_literal(v: Option<i64>) -> String {
    v.map_or_else(|| "null".to_owned(), |v| v.to_string())
}

#[async_trait]
impl crate::Handler for ApplyFuncHandler {
    fn handler_name(&self) -> &'static str {
        self.name
    }

    fn dest_table(&self) -> &str {
        &self.dest_table
    }

    fn add_trigger_args(&self, args: &mut Vec<String>) {
        if self.multimaster {
            args.push("no_merge".to_owned());
        }
    }

    async fn prepare_batch(
        &mut self,
        batch: Option<&BatchInfo>,
        _dst: &Transaction<'_>,
    ) -> Result<(), HandlerError> {
        self.cur_tick = batch.map(|b| b.tick_id);
        Ok(())
    }

    async fn process_event(
        &mut self,
        ev: &Event,
        sql: &mut SqlQueue,
        dst: &Transaction<'_>,
    ) -> Result<(), HandlerError> {
        let ev_time = ev.time.format("%Y-%m-%d %H:%M:%S%.6f%:z").to_string();
        let args = [
            quote_literal(Some(self.func_conf.as_str())),
            opt_i64_literal(self.cur_tick),
            ev.id.to_string(),
            quote_literal(Some(ev_time.as_str())),
            opt_i64_literal(ev.txid),
            ev.retry
                .map_or_else(|| "null".to_owned(), |r| r.to_string()),
            quote_literal(Some(ev.ev_type.as_str())),
            quote_literal(ev.data.as_deref()),
            quote_literal(ev.extra1.as_deref()),
            quote_literal(ev.extra2.as_deref()),
            quote_literal(ev.extra3.as_deref()),
            quote_literal(ev.extra4.as_deref()),
        ];
        let stmt = format!(
            "select {}({});",
            quote_fqident(&self.func_name),
            args.join(", ")
        );
        sql.push(stmt, dst).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Handler;

    #[test]
    fn multimaster_folds_args_into_conf() {
        let args = HandlerArgs::new(
            [
                ("timefield".to_owned(), "updated_at".to_owned()),
                ("func_conf".to_owned(), "ignored".to_owned()),
            ]
            .into_iter()
            .collect(),
        );
        let h = ApplyFuncHandler::build_multimaster("public.t", &args, "public.t").unwrap();
        assert_eq!(h.func_name, "merge_on_time");
        assert_eq!(h.func_conf, "timefield=updated_at");

        let mut targs = Vec::new();
        h.add_trigger_args(&mut targs);
        assert_eq!(targs, vec!["no_merge"]);
    }

    #[test]
    fn applyfn_defaults() {
        let h = ApplyFuncHandler::build("public.t", &HandlerArgs::default(), "public.t").unwrap();
        assert_eq!(h.func_name, "undefined");
        assert!(!h.multimaster);
    }
}
