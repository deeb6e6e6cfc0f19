//! The default handler: apply row events as plain SQL.

use async_trait::async_trait;
use tokio_postgres::Transaction;

use cartage_queue::sqlgen::{mk_delete_sql, mk_insert_sql, mk_update_sql};
use cartage_queue::{parse_row_data, Event, EventKind, RowOp, RowPayload};
use cartage_util::quote_fqident;

use crate::args::HandlerArgs;
use crate::{HandlerError, SqlQueue};

/// Table identity shared by every row-applying handler.
#[derive(Debug, Clone)]
pub struct TableApplier {
    pub table_name: String,
    pub dest_table: String,
    pub fq_dest_table: String,
}

impl TableApplier {
    pub fn new(table_name: &str, dest_table: &str) -> TableApplier {
        TableApplier {
            table_name: table_name.to_owned(),
            dest_table: dest_table.to_owned(),
            fq_dest_table: quote_fqident(dest_table),
        }
    }

    /// Build the apply statement for one data event.
    pub fn event_sql(&self, ev: &Event, allow_sql: bool) -> Result<String, HandlerError> {
        let EventKind::Row { op, pkey, .. } = ev.kind()? else {
            return Err(HandlerError::Event(format!(
                "not a data event: {}",
                ev.ev_type
            )));
        };
        match parse_row_data(ev, allow_sql)? {
            RowPayload::Sql(frag) => Ok(match op {
                RowOp::Insert => format!("insert into {} {};", self.fq_dest_table, frag),
                RowOp::Update => format!("update only {} set {};", self.fq_dest_table, frag),
                RowOp::Delete => format!("delete from only {} where {};", self.fq_dest_table, frag),
            }),
            RowPayload::Row(row) => Ok(match op {
                RowOp::Insert => mk_insert_sql(&row, &self.dest_table, &pkey),
                RowOp::Update => mk_update_sql(&row, &self.dest_table, &pkey)?,
                RowOp::Delete => mk_delete_sql(&row, &self.dest_table, &pkey)?,
            }),
        }
    }
}

/// Vanilla row-by-row apply.
///
/// Arguments:
///   encoding=ENC         - rejected, no encoding validation support
///   ignore_truncate=BOOL - skip truncate events, default 0
pub struct TableHandler {
    applier: TableApplier,
    ignore_truncate: bool,
}

const TABLE_ARGS: &[&str] = &["encoding", "ignore_truncate"];

impl TableHandler {
    pub fn build(
        table_name: &str,
        args: &HandlerArgs,
        dest_table: &str,
    ) -> Result<TableHandler, HandlerError> {
        args.validate(TABLE_ARGS)?;
        reject_encoding_arg(args)?;
        Ok(TableHandler {
            applier: TableApplier::new(table_name, dest_table),
            ignore_truncate: args.get_bool("ignore_truncate", false)?,
        })
    }
}

/// The `encoding=` argument is documented for compatibility but has no
/// working validator; accepting it silently would mean silently not doing
/// what was asked.
pub(crate) fn reject_encoding_arg(args: &HandlerArgs) -> Result<(), HandlerError> {
    if args.get("encoding").is_some() {
        return Err(HandlerError::Config(
            "encoding validator not supported".to_owned(),
        ));
    }
    Ok(())
}

#[async_trait]
impl crate::Handler for TableHandler {
    fn handler_name(&self) -> &'static str {
        "cartage"
    }

    fn dest_table(&self) -> &str {
        &self.applier.dest_table
    }

    fn ignore_truncate(&self) -> bool {
        self.ignore_truncate
    }

    async fn process_event(
        &mut self,
        ev: &Event,
        sql: &mut SqlQueue,
        dst: &Transaction<'_>,
    ) -> Result<(), HandlerError> {
        let stmt = self.applier.event_sql(ev, true)?;
        sql.push(stmt, dst).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    pub(crate) fn data_event(ev_type: &str, data: &str) -> Event {
        Event {
            id: 1,
            ev_type: ev_type.to_owned(),
            data: Some(data.to_owned()),
            extra1: Some("public.t".to_owned()),
            extra2: None,
            extra3: None,
            extra4: None,
            time: Utc::now(),
            txid: Some(42),
            retry: None,
        }
    }

    #[test]
    fn urlencoded_insert() {
        let a = TableApplier::new("public.t", "public.t");
        let sql = a.event_sql(&data_event("I:id", "id=1&v=x"), true).unwrap();
        assert_eq!(sql, "insert into public.t (id, v) values ('1', 'x');");
    }

    #[test]
    fn json_delete_with_renamed_dest() {
        let a = TableApplier::new("public.t", "stage.t_copy");
        let sql = a
            .event_sql(
                &data_event(r#"{"op":"D","pkey":["id"]}"#, r#"{"id":3,"v":"x"}"#),
                true,
            )
            .unwrap();
        assert_eq!(sql, "delete from only stage.t_copy where id = '3';");
    }

    #[test]
    fn legacy_sql_fragment() {
        let a = TableApplier::new("public.t", "public.t");
        let sql = a.event_sql(&data_event("U", "v = 'y' where id = 1"), true).unwrap();
        assert_eq!(sql, "update only public.t set v = 'y' where id = 1;");
        assert!(a.event_sql(&data_event("U", "x"), false).is_err());
    }

    #[test]
    fn encoding_arg_rejected() {
        let args = HandlerArgs::new(
            [("encoding".to_owned(), "utf8".to_owned())].into_iter().collect(),
        );
        assert!(TableHandler::build("public.t", &args, "public.t").is_err());
    }
}
