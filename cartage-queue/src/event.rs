//! Queue events and type-tag decoding.

use chrono::{DateTime, Utc};
use tokio_postgres::Row;

use crate::QueueError;

/// Prefix of replication meta events emitted by the provider-side triggers.
pub const META_PREFIX: &str = "cartage.";

/// One event as stored in the queue.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: i64,
    pub ev_type: String,
    pub data: Option<String>,
    pub extra1: Option<String>,
    pub extra2: Option<String>,
    pub extra3: Option<String>,
    pub extra4: Option<String>,
    pub time: DateTime<Utc>,
    pub txid: Option<i64>,
    pub retry: Option<i32>,
}

/// Row operation carried by a data event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowOp {
    Insert,
    Update,
    Delete,
}

impl RowOp {
    pub fn from_letter(s: &str) -> Option<RowOp> {
        match s {
            "I" => Some(RowOp::Insert),
            "U" => Some(RowOp::Update),
            "D" => Some(RowOp::Delete),
            _ => None,
        }
    }

    pub fn as_letter(&self) -> &'static str {
        match self {
            RowOp::Insert => "I",
            RowOp::Update => "U",
            RowOp::Delete => "D",
        }
    }
}

/// Normalized event type.  The wire carries three encodings of row events
/// (bare letter with an SQL fragment payload, `I:pk1,pk2`, and a JSON
/// object); all of them decode into [`EventKind::Row`] so nothing downstream
/// ever matches on string prefixes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Row {
        op: RowOp,
        pkey: Vec<String>,
        /// Legacy encoding: payload is a raw SQL fragment, not a row.
        sql_form: bool,
    },
    Truncate,
    Execute,
    AddTable,
    RemoveTable,
    RemoveSeq,
    UpdateSeq,
    /// Queue-internal meta event (`pgq.*`), handled by the consumer runtime.
    Cascade,
    Other,
}

impl Event {
    /// Build from a `pgq.get_batch_events()` row.
    pub fn from_row(row: &Row) -> Result<Event, QueueError> {
        Ok(Event {
            id: row.try_get("ev_id")?,
            ev_type: row
                .try_get::<_, Option<String>>("ev_type")?
                .unwrap_or_default(),
            data: row.try_get("ev_data")?,
            extra1: row.try_get("ev_extra1")?,
            extra2: row.try_get("ev_extra2")?,
            extra3: row.try_get("ev_extra3")?,
            extra4: row.try_get("ev_extra4")?,
            time: row.try_get("ev_time")?,
            txid: row.try_get("ev_txid")?,
            retry: row.try_get("ev_retry")?,
        })
    }

    /// Decode the type tag.
    pub fn kind(&self) -> Result<EventKind, QueueError> {
        let t = self.ev_type.as_str();

        if t.starts_with('{') {
            let parsed: serde_json::Value = serde_json::from_str(t)
                .map_err(|e| QueueError::BadEvent(format!("bad json event type {t:?}: {e}")))?;
            let op = parsed
                .get("op")
                .and_then(|v| v.as_str())
                .and_then(|s| RowOp::from_letter(&s[..1.min(s.len())]))
                .ok_or_else(|| QueueError::BadEvent(format!("json event type without op: {t}")))?;
            let pkey = parsed
                .get("pkey")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(str::to_owned))
                        .collect()
                })
                .unwrap_or_default();
            return Ok(EventKind::Row {
                op,
                pkey,
                sql_form: false,
            });
        }

        if let Some(op) = RowOp::from_letter(t) {
            return Ok(EventKind::Row {
                op,
                pkey: Vec::new(),
                sql_form: true,
            });
        }

        if let Some((letter, pkeys)) = t.split_once(':') {
            if let Some(op) = RowOp::from_letter(letter) {
                return Ok(EventKind::Row {
                    op,
                    pkey: pkeys.split(',').map(str::to_owned).collect(),
                    sql_form: false,
                });
            }
        }

        Ok(match t {
            "R" => EventKind::Truncate,
            "EXECUTE" => EventKind::Execute,
            "cartage.add-table" => EventKind::AddTable,
            "cartage.remove-table" => EventKind::RemoveTable,
            "cartage.remove-seq" => EventKind::RemoveSeq,
            "cartage.update-seq" => EventKind::UpdateSeq,
            t if t.starts_with("pgq.") => EventKind::Cascade,
            _ => EventKind::Other,
        })
    }

    /// Is this an insert/update/delete for one table?
    pub fn is_data_event(&self) -> bool {
        matches!(self.kind(), Ok(EventKind::Row { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ev(ev_type: &str) -> Event {
        Event {
            id: 1,
            ev_type: ev_type.to_owned(),
            data: None,
            extra1: None,
            extra2: None,
            extra3: None,
            extra4: None,
            time: Utc::now(),
            txid: Some(100),
            retry: None,
        }
    }

    #[test]
    fn short_form() {
        assert_eq!(
            ev("I").kind().unwrap(),
            EventKind::Row {
                op: RowOp::Insert,
                pkey: vec![],
                sql_form: true
            }
        );
        assert!(ev("D").is_data_event());
    }

    #[test]
    fn long_form() {
        assert_eq!(
            ev("U:id,ts").kind().unwrap(),
            EventKind::Row {
                op: RowOp::Update,
                pkey: vec!["id".into(), "ts".into()],
                sql_form: false
            }
        );
    }

    #[test]
    fn json_form() {
        assert_eq!(
            ev(r#"{"op":"D","pkey":["id"]}"#).kind().unwrap(),
            EventKind::Row {
                op: RowOp::Delete,
                pkey: vec!["id".into()],
                sql_form: false
            }
        );
        assert!(ev(r#"{"op":"X"}"#).kind().is_err());
    }

    #[test]
    fn symbolic_types() {
        assert_eq!(ev("R").kind().unwrap(), EventKind::Truncate);
        assert_eq!(ev("EXECUTE").kind().unwrap(), EventKind::Execute);
        assert_eq!(ev("cartage.add-table").kind().unwrap(), EventKind::AddTable);
        assert_eq!(ev("cartage.update-seq").kind().unwrap(), EventKind::UpdateSeq);
        assert_eq!(ev("pgq.location-info").kind().unwrap(), EventKind::Cascade);
        assert_eq!(ev("NOTIFY").kind().unwrap(), EventKind::Other);
        assert!(!ev("R").is_data_event());
    }
}
