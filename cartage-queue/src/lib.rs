//! Consumer-side view of the cascaded event queue.
//!
//! The queue itself (ticker, batch bookkeeping, node roles) lives in the
//! database; this crate holds the event and batch model, the thin SQL client
//! a cascaded consumer needs, catalog probes and the COPY plumbing shared by
//! the copy worker and the repair tooling.

pub mod catalog;
pub mod consumer;
pub mod copydata;
pub mod event;
pub mod row;
pub mod sqlgen;

pub use consumer::{BatchInfo, CascadedConsumer, NodeInfo, NodeType};
pub use event::{Event, EventKind, RowOp};
pub use row::{parse_row_data, RowData, RowPayload};

/// Errors from queue access and event decoding.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Db(#[from] tokio_postgres::Error),

    #[error("bad event: {0}")]
    BadEvent(String),

    #[error("queue protocol error: {0}")]
    Protocol(String),

    #[error("copy stream error: {0}")]
    Copy(String),

    #[error(transparent)]
    Parse(#[from] cartage_util::ParseError),
}
