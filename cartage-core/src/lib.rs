//! Replication core: per-table state, the replay worker and the copy
//! worker.

pub mod config;
pub mod copy;
pub mod exec_attrs;
pub mod replay;
pub mod state;

pub use config::Config;
pub use replay::Replicator;
pub use state::{TablePhase, TableState};

use cartage_handlers::HandlerError;
use cartage_queue::QueueError;

/// Worker-level errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("database error: {0}")]
    Db(#[from] tokio_postgres::Error),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error(transparent)]
    Parse(#[from] cartage_util::ParseError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("usage error: {0}")]
    Usage(String),

    #[error("bad table state: {0}")]
    State(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure while applying one event, decorated with its identity so the
    /// log points at the exact row.
    #[error("[ev_id={ev_id},ev_txid={ev_txid:?}] {source}")]
    Event {
        ev_id: i64,
        ev_txid: Option<i64>,
        #[source]
        source: Box<WorkerError>,
    },
}

impl WorkerError {
    /// Attach in-flight event identity to an error.
    pub fn for_event(self, ev_id: i64, ev_txid: Option<i64>) -> WorkerError {
        WorkerError::Event {
            ev_id,
            ev_txid,
            source: Box::new(self),
        }
    }
}
