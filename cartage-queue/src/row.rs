//! Row payload decoding.

use indexmap::IndexMap;

use cartage_util::db_urldecode;

use crate::event::{Event, EventKind};
use crate::QueueError;

/// Column name to nullable text value, in wire order.
pub type RowData = IndexMap<String, Option<String>>;

/// Decoded event payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowPayload {
    /// Structured row, from a urlencoded or JSON payload.
    Row(RowData),
    /// Legacy SQL fragment carried by a bare `I`/`U`/`D` event.
    Sql(String),
}

/// Decode the payload of a data event.
///
/// `allow_sql` rejects the legacy fragment form for handlers that cannot
/// apply raw SQL (shard, dispatch, obfuscate and friends).
pub fn parse_row_data(ev: &Event, allow_sql: bool) -> Result<RowPayload, QueueError> {
    let kind = ev.kind()?;
    let sql_form = match kind {
        EventKind::Row { sql_form, .. } => sql_form,
        other => {
            return Err(QueueError::BadEvent(format!(
                "not a data event: {other:?}"
            )))
        }
    };
    let data = ev
        .data
        .as_deref()
        .ok_or_else(|| QueueError::BadEvent(format!("data event {} without payload", ev.id)))?;

    if sql_form {
        if !allow_sql {
            return Err(QueueError::BadEvent(
                "SQL events not supported by this handler".to_owned(),
            ));
        }
        return Ok(RowPayload::Sql(data.to_owned()));
    }

    if data.starts_with('{') {
        let parsed: serde_json::Map<String, serde_json::Value> = serde_json::from_str(data)
            .map_err(|e| QueueError::BadEvent(format!("bad json payload: {e}")))?;
        let mut row = RowData::with_capacity(parsed.len());
        for (key, value) in parsed {
            row.insert(key, json_to_text(value));
        }
        Ok(RowPayload::Row(row))
    } else {
        Ok(RowPayload::Row(db_urldecode(data)?))
    }
}

/// Flatten a JSON scalar to its Postgres text form.
fn json_to_text(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Bool(b) => Some(if b { "true" } else { "false" }.to_owned()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        // nested structures stay as their JSON text, the column is json(b)
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn ev(ev_type: &str, data: &str) -> Event {
        Event {
            id: 7,
            ev_type: ev_type.to_owned(),
            data: Some(data.to_owned()),
            extra1: Some("public.t".to_owned()),
            extra2: None,
            extra3: None,
            extra4: None,
            time: Utc::now(),
            txid: Some(9),
            retry: None,
        }
    }

    #[test]
    fn urlencoded_row() {
        let got = parse_row_data(&ev("I:id", "id=1&v=a+b&gone"), false).unwrap();
        let RowPayload::Row(row) = got else {
            panic!("expected row")
        };
        assert_eq!(row["id"], Some("1".to_owned()));
        assert_eq!(row["v"], Some("a b".to_owned()));
        assert_eq!(row["gone"], None);
    }

    #[test]
    fn json_row() {
        let got = parse_row_data(
            &ev(r#"{"op":"U","pkey":["id"]}"#, r#"{"id":1,"ok":true,"v":null}"#),
            false,
        )
        .unwrap();
        let RowPayload::Row(row) = got else {
            panic!("expected row")
        };
        assert_eq!(row["id"], Some("1".to_owned()));
        assert_eq!(row["ok"], Some("true".to_owned()));
        assert_eq!(row["v"], None);
    }

    #[test]
    fn sql_form_gate() {
        let legacy = ev("D", "id = 5");
        assert_eq!(
            parse_row_data(&legacy, true).unwrap(),
            RowPayload::Sql("id = 5".to_owned())
        );
        assert!(parse_row_data(&legacy, false).is_err());
    }
}
