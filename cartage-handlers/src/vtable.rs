//! Virtual table: registers a table as local without processing events.

use async_trait::async_trait;
use tokio_postgres::Transaction;

use cartage_queue::Event;

use crate::args::HandlerArgs;
use crate::{HandlerError, SqlQueue};

pub struct VirtualTableHandler {
    dest_table: String,
}

impl VirtualTableHandler {
    pub fn build(
        _table_name: &str,
        args: &HandlerArgs,
        dest_table: &str,
    ) -> Result<VirtualTableHandler, HandlerError> {
        args.validate(&[])?;
        Ok(VirtualTableHandler {
            dest_table: dest_table.to_owned(),
        })
    }
}

#[async_trait]
impl crate::Handler for VirtualTableHandler {
    fn handler_name(&self) -> &'static str {
        "vtable"
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

    async fn process_event(
        &mut self,
        _ev: &Event,
        _sql: &mut SqlQueue,
        _dst: &Transaction<'_>,
    ) -> Result<(), HandlerError> {
        Ok(())
    }
}
