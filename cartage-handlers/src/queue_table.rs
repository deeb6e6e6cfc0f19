//! Handlers for tables that only exist to feed queues.

use async_trait::async_trait;
use tokio_postgres::Transaction;

use cartage_queue::copydata::CopyStats;
use cartage_queue::{BatchInfo, Event};

use crate::args::HandlerArgs;
use crate::{HandlerError, SqlQueue};

/// Queue table on the root node.  The trigger skips row storage entirely,
/// so events are ignored here and copy never runs.
pub struct QueueTableHandler {
    dest_table: String,
}

impl QueueTableHandler {
    pub fn build(
        _table_name: &str,
        args: &HandlerArgs,
        dest_table: &str,
    ) -> Result<QueueTableHandler, HandlerError> {
        args.validate(&[])?;
        Ok(QueueTableHandler {
            dest_table: dest_table.to_owned(),
        })
    }
}

#[async_trait]
impl crate::Handler for QueueTableHandler {
    fn handler_name(&self) -> &'static str {
        "qtable"
    }

    fn dest_table(&self) -> &str {
        &self.dest_table
    }

    fn add_trigger_args(&self, args: &mut Vec<String>) {
        args.push("tgflags=BI".to_owned());
        args.push("SKIP".to_owned());
        args.push("expect_sync".to_owned());
    }

    fn needs_table(&self) -> bool {
        false
    }

    async fn process_event(
        &mut self,
        _ev: &Event,
        _sql: &mut SqlQueue,
        _dst: &Transaction<'_>,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn real_copy(
        &mut self,
        _src_table: &str,
        _src: &Transaction<'_>,
        _dst: &Transaction<'_>,
        _columns: &[String],
    ) -> Result<CopyStats, HandlerError> {
        Ok(CopyStats::default())
    }

    async fn real_copy_threaded(
        &mut self,
        _src_table: &str,
        _src: &Transaction<'_>,
        _dst: &Transaction<'_>,
        _dst_connstr: &str,
        _columns: &[String],
        _parallel: usize,
        _session_setup: &[String],
    ) -> Result<CopyStats, HandlerError> {
        Ok(CopyStats::default())
    }
}

/// Insert all events for one table into another queue.
///
/// Arguments:
///   queue=QUEUE - destination queue name, required
pub struct QueueSplitterHandler {
    dest_table: String,
    dst_queue_name: String,
    rows: Vec<Event>,
}

impl QueueSplitterHandler {
    pub fn build(
        _table_name: &str,
        args: &HandlerArgs,
        dest_table: &str,
    ) -> Result<QueueSplitterHandler, HandlerError> {
        args.validate(&["queue"])?;
        let queue = args
            .get("queue")
            .ok_or_else(|| HandlerError::Config("specify queue with handler arg".to_owned()))?;
        Ok(QueueSplitterHandler {
            dest_table: dest_table.to_owned(),
            dst_queue_name: queue.to_owned(),
            rows: Vec::new(),
        })
    }
}

#[async_trait]
impl crate::Handler for QueueSplitterHandler {
    fn handler_name(&self) -> &'static str {
        "qsplitter"
    }

    fn dest_table(&self) -> &str {
        &self.dest_table
    }

    fn add_trigger_args(&self, args: &mut Vec<String>) {
        args.push("virtual_table".to_owned());
    }

    fn needs_table(&self) -> bool {
        false
    }

    fn reset(&mut self) {
        self.rows.clear();
    }

    async fn prepare_batch(
        &mut self,
        _batch: Option<&BatchInfo>,
        _dst: &Transaction<'_>,
    ) -> Result<(), HandlerError> {
        self.rows.clear();
        Ok(())
    }

    async fn process_event(
        &mut self,
        ev: &Event,
        _sql: &mut SqlQueue,
        _dst: &Transaction<'_>,
    ) -> Result<(), HandlerError> {
        self.rows.push(ev.clone());
        Ok(())
    }

    async fn finish_batch(
        &mut self,
        _batch: &BatchInfo,
        dst: &Transaction<'_>,
    ) -> Result<(), HandlerError> {
        for ev in self.rows.drain(..) {
            dst.execute(
                "select pgq.insert_event($1, $2, $3, $4, $5, $6, $7)",
                &[
                    &self.dst_queue_name,
                    &ev.ev_type,
                    &ev.data,
                    &ev.extra1,
                    &ev.extra2,
                    &ev.extra3,
                    &ev.extra4,
                ],
            )
            .await?;
        }
        Ok(())
    }

    async fn real_copy(
        &mut self,
        _src_table: &str,
        _src: &Transaction<'_>,
        _dst: &Transaction<'_>,
        _columns: &[String],
    ) -> Result<CopyStats, HandlerError> {
        Ok(CopyStats::default())
    }

    async fn real_copy_threaded(
        &mut self,
        _src_table: &str,
        _src: &Transaction<'_>,
        _dst: &Transaction<'_>,
        _dst_connstr: &str,
        _columns: &[String],
        _parallel: usize,
        _session_setup: &[String],
    ) -> Result<CopyStats, HandlerError> {
        Ok(CopyStats::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Handler;

    #[test]
    fn qtable_trigger_args() {
        let h = QueueTableHandler::build("public.q", &HandlerArgs::default(), "public.q").unwrap();
        let mut args = Vec::new();
        h.add_trigger_args(&mut args);
        assert_eq!(args, vec!["tgflags=BI", "SKIP", "expect_sync"]);
        assert!(!h.needs_table());
    }

    #[test]
    fn qsplitter_requires_queue() {
        assert!(QueueSplitterHandler::build("public.q", &HandlerArgs::default(), "public.q").is_err());
        let args = HandlerArgs::new(
            [("queue".to_owned(), "aux_queue".to_owned())].into_iter().collect(),
        );
        let h = QueueSplitterHandler::build("public.q", &args, "public.q").unwrap();
        assert_eq!(h.dst_queue_name, "aux_queue");
        assert!(!h.needs_table());
    }
}
