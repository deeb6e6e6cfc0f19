//! Keyed-hash obfuscation of replicated data.
//!
//! A YAML rule map, keyed by source table, decides per column whether the
//! value is kept, dropped, reduced to a boolean, or replaced by a keyed
//! Blake2s hash (32/64 bit signed ints, or 128 bit rendered as a variant-0
//! UUID).  JSON columns can carry nested rules applied recursively.  The
//! same transform runs on replayed rows, on COPY lines during initial sync
//! and on events forwarded to downstream queues, so consumers below this
//! node only ever see obfuscated data.
//!
//! Arguments:
//!   encoding=ENC         - rejected, no encoding validation support
//!   ignore_truncate=BOOL - skip truncate events, default 0

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use blake2::digest::{Mac, Update, VariableOutput};
use blake2::{Blake2sMac, Blake2sVar};
use serde::Deserialize;
use tokio_postgres::Transaction;
use tracing::warn;
use uuid::Uuid;

use cartage_queue::copydata::{full_copy, CopySpec, CopyStats};
use cartage_queue::sqlgen::{mk_delete_sql, mk_insert_sql, mk_update_sql};
use cartage_queue::{parse_row_data, Event, EventKind, QueueError, RowData, RowOp, RowPayload};
use cartage_util::{db_urlencode, quote_copy, unescape_copy};

use crate::args::HandlerArgs;
use crate::table::{reject_encoding_arg, TableApplier};
use crate::{HandlerContext, HandlerError, SqlQueue};

/// Per-column action.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Keep,
    Skip,
    Bool,
    Hash32,
    Hash64,
    Hash128,
    Json(JsonRules),
}

pub type JsonRules = HashMap<String, JsonRule>;

/// Rule inside a JSON column: a scalar action or a nested object.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRule {
    Keep,
    Skip,
    Bool,
    Hash32,
    Hash64,
    Hash128,
    Nested(JsonRules),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawAction {
    Name(String),
    Json { rules: HashMap<String, RawJsonRule> },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawJsonRule {
    Name(String),
    Map(HashMap<String, RawJsonRule>),
}

fn scalar_action(name: &str) -> Result<Action, HandlerError> {
    Ok(match name {
        "keep" => Action::Keep,
        "skip" => Action::Skip,
        "bool" => Action::Bool,
        "hash32" => Action::Hash32,
        "hash64" => Action::Hash64,
        "hash" => Action::Hash128,
        other => {
            return Err(HandlerError::Config(format!(
                "invalid obfuscation action: {other}"
            )))
        }
    })
}

fn json_rule(raw: RawJsonRule) -> Result<JsonRule, HandlerError> {
    Ok(match raw {
        RawJsonRule::Name(name) => match scalar_action(&name)? {
            Action::Keep => JsonRule::Keep,
            Action::Skip => JsonRule::Skip,
            Action::Bool => JsonRule::Bool,
            Action::Hash32 => JsonRule::Hash32,
            Action::Hash64 => JsonRule::Hash64,
            Action::Hash128 => JsonRule::Hash128,
            Action::Json(_) => unreachable!("scalar_action never builds Json"),
        },
        RawJsonRule::Map(map) => {
            let mut rules = JsonRules::new();
            for (key, value) in map {
                rules.insert(key, json_rule(value)?);
            }
            JsonRule::Nested(rules)
        }
    })
}

/// The full rule map, keyed by source table name.
#[derive(Debug, Clone, Default)]
pub struct ObfuscationMap {
    tables: HashMap<String, HashMap<String, Action>>,
}

impl ObfuscationMap {
    pub fn load_str(yaml: &str) -> Result<ObfuscationMap, HandlerError> {
        let raw: HashMap<String, HashMap<String, RawAction>> = serde_yaml_ng::from_str(yaml)
            .map_err(|e| HandlerError::Config(format!("bad obfuscation map: {e}")))?;
        let mut tables = HashMap::new();
        for (table, columns) in raw {
            let mut rules = HashMap::new();
            for (column, action) in columns {
                let action = match action {
                    RawAction::Name(name) => scalar_action(&name)?,
                    RawAction::Json { rules } => {
                        let mut nested = JsonRules::new();
                        for (key, value) in rules {
                            nested.insert(key, json_rule(value)?);
                        }
                        Action::Json(nested)
                    }
                };
                rules.insert(column, action);
            }
            tables.insert(table, rules);
        }
        Ok(ObfuscationMap { tables })
    }

    pub fn load(path: &Path) -> Result<ObfuscationMap, HandlerError> {
        let body = std::fs::read_to_string(path)?;
        ObfuscationMap::load_str(&body)
    }

    pub fn table_rules(&self, table: &str) -> Option<&HashMap<String, Action>> {
        self.tables.get(table)
    }
}

/// Keyed Blake2s with 4/8/16 byte output.  An empty key means plain hashing.
fn keyed_digest(key: &[u8], data: &[u8], out: &mut [u8]) {
    if key.is_empty() {
        let mut h = Blake2sVar::new(out.len()).expect("output size is 4, 8 or 16");
        h.update(data);
        h.finalize_variable(out).expect("output size is 4, 8 or 16");
        return;
    }
    // key length is checked at handler construction
    match out.len() {
        4 => {
            let mut m = Blake2sMac::<blake2::digest::consts::U4>::new_from_slice(key)
                .expect("key up to 32 bytes");
            Mac::update(&mut m, data);
            out.copy_from_slice(&m.finalize().into_bytes());
        }
        8 => {
            let mut m = Blake2sMac::<blake2::digest::consts::U8>::new_from_slice(key)
                .expect("key up to 32 bytes");
            Mac::update(&mut m, data);
            out.copy_from_slice(&m.finalize().into_bytes());
        }
        _ => {
            let mut m = Blake2sMac::<blake2::digest::consts::U16>::new_from_slice(key)
                .expect("key up to 32 bytes");
            Mac::update(&mut m, data);
            out.copy_from_slice(&m.finalize().into_bytes());
        }
    }
}

fn hash32(key: &[u8], data: &[u8]) -> i32 {
    let mut out = [0u8; 4];
    keyed_digest(key, data, &mut out);
    i32::from_be_bytes(out)
}

fn hash64(key: &[u8], data: &[u8]) -> i64 {
    let mut out = [0u8; 8];
    keyed_digest(key, data, &mut out);
    i64::from_be_bytes(out)
}

/// 128-bit hash rendered as a variant-0 UUID, so obfuscated values cannot
/// collide with normal (variant-1) UUIDs.
fn hash128(key: &[u8], data: &[u8]) -> String {
    let mut out = [0u8; 16];
    keyed_digest(key, data, &mut out);
    let mut v = u128::from_be_bytes(out);
    v &= !(0x8000u128 << 48);
    Uuid::from_u128(v).to_string()
}

fn text_truthy(value: &str) -> bool {
    !matches!(
        value.to_ascii_lowercase().as_str(),
        "" | "0" | "f" | "false" | "n" | "no" | "off"
    )
}

fn bool_text(value: &str) -> String {
    if text_truthy(value) { "t" } else { "f" }.to_owned()
}

fn json_scalar_bytes(value: &serde_json::Value) -> Result<Vec<u8>, HandlerError> {
    match value {
        serde_json::Value::String(s) => Ok(s.as_bytes().to_vec()),
        serde_json::Value::Number(n) => Ok(n.to_string().into_bytes()),
        serde_json::Value::Bool(b) => Ok(if *b { b"t".to_vec() } else { b"f".to_vec() }),
        other => Err(HandlerError::Event(format!(
            "invalid input type for hashing: {other}"
        ))),
    }
}

fn json_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::String(s) => text_truthy(s),
        serde_json::Value::Number(n) => n.as_f64() != Some(0.0),
        _ => false,
    }
}

/// Apply one JSON rule; `None` drops the field.
fn obf_json(
    key: &[u8],
    value: &serde_json::Value,
    rule: &JsonRule,
) -> Result<Option<serde_json::Value>, HandlerError> {
    use serde_json::Value;

    if let JsonRule::Nested(rules) = rule {
        let Value::Object(obj) = value else {
            return Ok(None);
        };
        let mut result = serde_json::Map::new();
        for (rule_key, rule_value) in rules {
            let inner = obj.get(rule_key).unwrap_or(&Value::Null);
            if let Some(v) = obf_json(key, inner, rule_value)? {
                result.insert(rule_key.clone(), v);
            }
        }
        if result.is_empty() {
            return Ok(None);
        }
        return Ok(Some(Value::Object(result)));
    }

    match rule {
        JsonRule::Keep => {
            if value.is_null() {
                Ok(None)
            } else {
                Ok(Some(value.clone()))
            }
        }
        JsonRule::Skip => Ok(None),
        _ if value.is_null() || value.is_object() || value.is_array() => Ok(None),
        JsonRule::Bool => Ok(Some(Value::Bool(json_truthy(value)))),
        JsonRule::Hash32 => Ok(Some(Value::from(hash32(key, &json_scalar_bytes(value)?)))),
        JsonRule::Hash64 => Ok(Some(Value::from(hash64(key, &json_scalar_bytes(value)?)))),
        JsonRule::Hash128 => Ok(Some(Value::from(hash128(key, &json_scalar_bytes(value)?)))),
        JsonRule::Nested(_) => unreachable!("handled above"),
    }
}

/// Obfuscate one JSON column's text.
fn obf_json_text(
    key: &[u8],
    value: Option<&str>,
    rules: &JsonRules,
) -> Result<Option<String>, HandlerError> {
    let Some(text) = value else {
        return Ok(None);
    };
    let parsed: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| HandlerError::Event(format!("bad json column value: {e}")))?;
    let rule = JsonRule::Nested(rules.clone());
    let obfuscated = obf_json(key, &parsed, &rule)?
        .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()));
    Ok(Some(obfuscated.to_string()))
}

fn obf_scalar(
    key: &[u8],
    action: &Action,
    value: Option<&str>,
) -> Result<Option<String>, HandlerError> {
    let Some(value) = value else {
        return Ok(None);
    };
    Ok(Some(match action {
        Action::Bool => bool_text(value),
        Action::Hash32 => hash32(key, value.as_bytes()).to_string(),
        Action::Hash64 => hash64(key, value.as_bytes()).to_string(),
        Action::Hash128 => hash128(key, value.as_bytes()),
        _ => unreachable!("scalar path only"),
    }))
}

/// Transform a parsed row.
fn obf_row(
    rules: &HashMap<String, Action>,
    key: &[u8],
    row: RowData,
) -> Result<RowData, HandlerError> {
    let mut dst = RowData::with_capacity(row.len());
    for (field, value) in row {
        let action = rules.get(&field).unwrap_or(&Action::Skip);
        match action {
            Action::Skip => continue,
            Action::Keep => {
                dst.insert(field, value);
            }
            Action::Json(json_rules) => {
                let v = obf_json_text(key, value.as_deref(), json_rules)?;
                dst.insert(field, v);
            }
            scalar => {
                let v = obf_scalar(key, scalar, value.as_deref())?;
                dst.insert(field, v);
            }
        }
    }
    Ok(dst)
}

/// Transform one COPY text line; `columns` is the filtered column list the
/// COPY statement selects.
fn obf_copy_line(
    rules: &HashMap<String, Action>,
    key: &[u8],
    line: &str,
    columns: &[String],
) -> Result<String, HandlerError> {
    let body = match line.strip_suffix('\n') {
        Some(body) => body,
        None => {
            warn!("copy line without trailing newline");
            line
        }
    };
    let mut out: Vec<String> = Vec::with_capacity(columns.len());
    for (field, raw) in columns.iter().zip(body.split('\t')) {
        let action = rules.get(field).unwrap_or(&Action::Skip);
        match action {
            Action::Keep => out.push(raw.to_owned()),
            Action::Skip => continue,
            Action::Json(json_rules) => {
                let value = unescape_copy(raw);
                let v = obf_json_text(key, value.as_deref(), json_rules)?;
                out.push(quote_copy(v.as_deref()));
            }
            scalar => {
                let value = unescape_copy(raw);
                match value {
                    None => out.push(raw.to_owned()),
                    Some(v) => {
                        let v = obf_scalar(key, scalar, Some(v.as_str()))?;
                        out.push(quote_copy(v.as_deref()));
                    }
                }
            }
        }
    }
    Ok(out.join("\t") + "\n")
}

pub struct Obfuscator {
    applier: TableApplier,
    ignore_truncate: bool,
    key: Vec<u8>,
    rules: HashMap<String, Action>,
}

const OBFUSCATE_ARGS: &[&str] = &["encoding", "ignore_truncate"];

impl Obfuscator {
    pub fn build(
        table_name: &str,
        args: &HandlerArgs,
        dest_table: &str,
        ctx: &HandlerContext,
    ) -> Result<Obfuscator, HandlerError> {
        args.validate(OBFUSCATE_ARGS)?;
        reject_encoding_arg(args)?;
        if ctx.obfuscator_key.len() > 32 {
            return Err(HandlerError::Config(
                "obfuscator_key longer than 32 bytes".to_owned(),
            ));
        }
        let map = ctx
            .obfuscator_map
            .as_ref()
            .ok_or_else(|| HandlerError::Config("obfuscator_map not configured".to_owned()))?;
        let rules = map
            .table_rules(table_name)
            .ok_or_else(|| {
                HandlerError::Config(format!("source table not in obfuscation map: {table_name}"))
            })?
            .clone();
        Ok(Obfuscator {
            applier: TableApplier::new(table_name, dest_table),
            ignore_truncate: args.get_bool("ignore_truncate", false)?,
            key: ctx.obfuscator_key.clone(),
            rules,
        })
    }

    fn copy_column_list(&self, columns: &[String]) -> Vec<String> {
        columns
            .iter()
            .filter(|c| !matches!(self.rules.get(*c), None | Some(Action::Skip)))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl crate::Handler for Obfuscator {
    fn handler_name(&self) -> &'static str {
        "obfuscate"
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
        let EventKind::Row { op, pkey, .. } = ev.kind()? else {
            return Err(HandlerError::Event(format!(
                "not a data event: {}",
                ev.ev_type
            )));
        };
        let RowPayload::Row(row) = parse_row_data(ev, false)? else {
            return Err(HandlerError::Event("expected structured row".to_owned()));
        };
        let row = obf_row(&self.rules, &self.key, row)?;
        let table = &self.applier.dest_table;
        let stmt = match op {
            RowOp::Insert => mk_insert_sql(&row, table, &pkey),
            RowOp::Update => mk_update_sql(&row, table, &pkey)?,
            RowOp::Delete => mk_delete_sql(&row, table, &pkey)?,
        };
        sql.push(stmt, dst).await
    }

    async fn real_copy(
        &mut self,
        src_table: &str,
        src: &Transaction<'_>,
        dst: &Transaction<'_>,
        columns: &[String],
    ) -> Result<CopyStats, HandlerError> {
        let columns = self.copy_column_list(columns);
        let spec = CopySpec::new(src_table, self.dest_table(), &columns);

        let rules = self.rules.clone();
        let key = self.key.clone();
        let mut hook = move |line: &str| -> Result<String, QueueError> {
            obf_copy_line(&rules, &key, line, &columns)
                .map_err(|e| QueueError::Copy(e.to_string()))
        };
        Ok(full_copy(src, dst, &spec, Some(&mut hook)).await?)
    }

    async fn real_copy_threaded(
        &mut self,
        src_table: &str,
        src: &Transaction<'_>,
        _dst: &Transaction<'_>,
        dst_connstr: &str,
        columns: &[String],
        parallel: usize,
        session_setup: &[String],
    ) -> Result<CopyStats, HandlerError> {
        let columns = self.copy_column_list(columns);
        let spec = CopySpec::new(src_table, self.dest_table(), &columns);

        let rules = self.rules.clone();
        let key = self.key.clone();
        let mut hook = move |line: &str| -> Result<String, QueueError> {
            obf_copy_line(&rules, &key, line, &columns)
                .map_err(|e| QueueError::Copy(e.to_string()))
        };
        Ok(cartage_queue::copydata::full_copy_parallel(
            src,
            dst_connstr,
            &spec,
            parallel,
            session_setup,
            Some(&mut hook),
        )
        .await?)
    }

    /// Downstream consumers must only ever see obfuscated data, so the
    /// forwarded event carries the transformed row in the original wire
    /// format.
    fn get_copy_event(
        &mut self,
        ev: Event,
        _queue_name: &str,
    ) -> Result<Option<Event>, HandlerError> {
        if !ev.is_data_event() {
            return Ok(Some(ev));
        }
        let RowPayload::Row(row) = parse_row_data(&ev, false)? else {
            return Err(HandlerError::Event("expected structured row".to_owned()));
        };
        let row = obf_row(&self.rules, &self.key, row)?;
        let json_form = ev.data.as_deref().is_some_and(|d| d.starts_with('{'));
        let data = if json_form {
            let mut obj = serde_json::Map::new();
            for (field, value) in row {
                obj.insert(
                    field,
                    value.map_or(serde_json::Value::Null, serde_json::Value::String),
                );
            }
            serde_json::Value::Object(obj).to_string()
        } else {
            db_urlencode(row.iter().map(|(k, v)| (k.as_str(), v.as_deref())))
        };
        Ok(Some(Event {
            data: Some(data),
            ..ev
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const KEY: &[u8] = b"seedForHash";

    fn rules() -> HashMap<String, Action> {
        let yaml = "
public.users:
  id: keep
  name: hash32
  email: hash64
  token: hash
  active: bool
  secret: skip
  profile:
    rules:
      city: keep
      ssn: hash
";
        ObfuscationMap::load_str(yaml)
            .unwrap()
            .table_rules("public.users")
            .unwrap()
            .clone()
    }

    fn row(pairs: &[(&str, Option<&str>)]) -> RowData {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.map(str::to_owned)))
            .collect()
    }

    #[test]
    fn hashes_are_deterministic_and_key_sensitive() {
        assert_eq!(hash32(KEY, b"alice"), hash32(KEY, b"alice"));
        assert_ne!(hash32(KEY, b"alice"), hash32(KEY, b"bob"));
        assert_ne!(hash32(KEY, b"alice"), hash32(b"otherkey", b"alice"));
        assert_ne!(hash64(KEY, b"alice"), hash64(KEY, b"bob") );
        assert_eq!(hash128(KEY, b"alice"), hash128(KEY, b"alice"));
    }

    #[test]
    fn hash128_is_variant0_uuid() {
        let s = hash128(KEY, b"payload");
        let parsed = Uuid::parse_str(&s).unwrap();
        // variant bits live in byte 8; variant 0 means top bit clear
        assert!(parsed.as_bytes()[8] & 0x80 == 0);
    }

    #[test]
    fn row_transform() {
        let r = rules();
        let out = obf_row(
            &r,
            KEY,
            row(&[
                ("id", Some("1")),
                ("name", Some("alice")),
                ("secret", Some("x")),
                ("active", Some("yes")),
                ("missing_rule", Some("z")),
                ("email", None),
            ]),
        )
        .unwrap();
        assert_eq!(out["id"], Some("1".to_owned()));
        assert_eq!(out["name"], Some(hash32(KEY, b"alice").to_string()));
        assert_eq!(out["active"], Some("t".to_owned()));
        assert_eq!(out["email"], None, "null stays null");
        assert!(!out.contains_key("secret"));
        assert!(!out.contains_key("missing_rule"), "unlisted columns drop");
    }

    #[test]
    fn json_rules_recurse() {
        let r = rules();
        let Some(Action::Json(json_rules)) = r.get("profile").cloned() else {
            panic!("profile should parse as json rules");
        };
        let out = obf_json_text(
            KEY,
            Some(r#"{"city":"tallinn","ssn":"1234","extra":"x"}"#),
            &json_rules,
        )
        .unwrap()
        .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["city"], "tallinn");
        assert_eq!(parsed["ssn"], hash128(KEY, b"1234"));
        assert!(parsed.get("extra").is_none());

        // non-object input collapses to empty object
        let out = obf_json_text(KEY, Some("[1,2]"), &json_rules).unwrap().unwrap();
        assert_eq!(out, "{}");
    }

    #[test]
    fn copy_line_matches_row_transform() {
        let r = rules();
        let columns: Vec<String> = ["id", "name", "email", "token", "active", "profile"]
            .iter()
            .map(|s| (*s).to_owned())
            .collect();
        let line = "1\talice\ta@b.c\tt0k\tyes\t\\N\n";
        let copied = obf_copy_line(&r, KEY, line, &columns).unwrap();

        let transformed = obf_row(
            &r,
            KEY,
            row(&[
                ("id", Some("1")),
                ("name", Some("alice")),
                ("email", Some("a@b.c")),
                ("token", Some("t0k")),
                ("active", Some("yes")),
                ("profile", None),
            ]),
        )
        .unwrap();
        let expected: Vec<String> = columns
            .iter()
            .map(|c| quote_copy(transformed.get(c).cloned().flatten().as_deref()))
            .collect();
        assert_eq!(copied, expected.join("\t") + "\n");
    }

    #[test]
    fn copy_event_reencodes_same_format() {
        use chrono::Utc;
        let ctx = HandlerContext {
            obfuscator_key: KEY.to_vec(),
            obfuscator_map: Some(ObfuscationMap {
                tables: [("public.users".to_owned(), rules())].into_iter().collect(),
            }),
            ..HandlerContext::default()
        };
        let mut h = Obfuscator::build(
            "public.users",
            &HandlerArgs::default(),
            "public.users",
            &ctx,
        )
        .unwrap();

        let ev = Event {
            id: 1,
            ev_type: "I:id".to_owned(),
            data: Some("id=1&name=alice&secret=x".to_owned()),
            extra1: Some("public.users".to_owned()),
            extra2: None,
            extra3: None,
            extra4: None,
            time: Utc::now(),
            txid: Some(4),
            retry: None,
        };
        let out = crate::Handler::get_copy_event(&mut h, ev, "queue").unwrap().unwrap();
        let data = out.data.unwrap();
        assert!(data.starts_with("id=1&name="));
        assert!(!data.contains("secret"));
        assert!(!data.contains("alice"));
    }

    #[test]
    fn missing_map_is_config_error() {
        let ctx = HandlerContext::default();
        assert!(matches!(
            Obfuscator::build("public.users", &HandlerArgs::default(), "public.users", &ctx),
            Err(HandlerError::Config(_))
        ));
    }
}
