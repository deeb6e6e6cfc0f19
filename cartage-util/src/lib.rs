//! Miscellaneous helpers shared by the cartage workspace: SQL quoting,
//! the urlencoded key/value wire codec, COPY text escaping, SQL script
//! splitting, transaction snapshot parsing, glob matching and pidfiles.

pub mod copytext;
pub mod glob;
pub mod pidfile;
pub mod quote;
pub mod snapshot;
pub mod sqlsplit;
pub mod urlenc;

pub use copytext::{quote_copy, unescape_copy};
pub use quote::{fq_name, fq_name_parts, quote_fqident, quote_ident, quote_literal};
pub use snapshot::Snapshot;
pub use sqlsplit::parse_statements;
pub use urlenc::{db_urldecode, db_urlencode};

/// Error from one of the small parsers in this crate.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("invalid urlencoded data: {0}")]
    Urlenc(String),

    #[error("invalid snapshot string: {0}")]
    Snapshot(String),
}
