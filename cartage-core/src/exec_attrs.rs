//! Parser for EXECUTE meta-attributes.
//!
//! DDL shipped through the queue carries a meta-comment header declaring
//! which local objects it needs and which names it renames:
//!
//! ```text
//! --*-- Local-Sequence: myseq
//! --*-- Local-Table: table1,
//! --*--     table2, table3
//! ```
//!
//! Only lines starting with the `--*--` sentinel are parsed; parsing stops
//! at the first SQL statement.  A line ending with `,` continues on the
//! next meta line.

use std::collections::HashMap;

use tokio_postgres::Transaction;

use cartage_queue::catalog;
use cartage_util::{db_urldecode, db_urlencode, fq_name, quote_fqident};

use crate::WorkerError;

pub const META_PREFIX: &str = "--*--";
const META_SPLITLINE: usize = 70;

/// Recognized attribute keys, in probe order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrKey {
    LocalTable,
    LocalSequence,
    LocalDestination,
    NeedTable,
    NeedSequence,
    NeedFunction,
    NeedSchema,
    NeedView,
}

pub const ALL_KEYS: [AttrKey; 8] = [
    AttrKey::LocalTable,
    AttrKey::LocalSequence,
    AttrKey::LocalDestination,
    AttrKey::NeedTable,
    AttrKey::NeedSequence,
    AttrKey::NeedFunction,
    AttrKey::NeedSchema,
    AttrKey::NeedView,
];

impl AttrKey {
    pub fn nice_name(&self) -> &'static str {
        match self {
            AttrKey::LocalTable => "Local-Table",
            AttrKey::LocalSequence => "Local-Sequence",
            AttrKey::LocalDestination => "Local-Destination",
            AttrKey::NeedTable => "Need-Table",
            AttrKey::NeedSequence => "Need-Sequence",
            AttrKey::NeedFunction => "Need-Function",
            AttrKey::NeedSchema => "Need-Schema",
            AttrKey::NeedView => "Need-View",
        }
    }

    pub fn key(&self) -> String {
        self.nice_name().to_lowercase()
    }

    fn parse(name: &str) -> Option<AttrKey> {
        let lower = name.trim().to_lowercase();
        ALL_KEYS.iter().copied().find(|k| k.key() == lower)
    }

    /// Local-* keys also substitute `@name@` in the SQL body.
    fn local_rename(&self) -> bool {
        matches!(
            self,
            AttrKey::LocalTable | AttrKey::LocalSequence | AttrKey::LocalDestination
        )
    }

    /// Does one object name match on this node?
    async fn matches(
        &self,
        db: &Transaction<'_>,
        objname: &str,
        tables: &HashMap<String, String>,
        seqs: &HashMap<String, String>,
    ) -> Result<bool, WorkerError> {
        Ok(match self {
            AttrKey::LocalTable => tables.contains_key(objname),
            AttrKey::LocalSequence => seqs.contains_key(objname),
            AttrKey::LocalDestination => match tables.get(objname) {
                Some(dest) => catalog::exists_table(db, dest).await?,
                None => false,
            },
            AttrKey::NeedTable => catalog::exists_table(db, objname).await?,
            AttrKey::NeedSequence => catalog::exists_sequence(db, objname).await?,
            AttrKey::NeedSchema => catalog::exists_schema(db, objname).await?,
            AttrKey::NeedView => catalog::exists_view(db, objname).await?,
            AttrKey::NeedFunction => {
                // accepts name(nargs)
                let (name, nargs) = match objname.find('(') {
                    Some(p1) => match objname.find(')') {
                        Some(p2) if p2 > p1 => {
                            let n = objname[p1 + 1..p2].trim().parse::<i16>().map_err(|_| {
                                WorkerError::Usage(format!("bad function spec: {objname}"))
                            })?;
                            (&objname[..p1], n)
                        }
                        _ => (objname, 0),
                    },
                    None => (objname, 0),
                };
                catalog::exists_function(db, name, nargs).await?
            }
        })
    }
}

/// Container and parser for EXECUTE attributes.
#[derive(Debug, Clone, Default)]
pub struct ExecAttrs {
    attrs: Vec<(AttrKey, Vec<String>)>,
}

impl ExecAttrs {
    pub fn new() -> ExecAttrs {
        ExecAttrs::default()
    }

    pub fn from_sql(sql: &str) -> Result<ExecAttrs, WorkerError> {
        let mut a = ExecAttrs::new();
        a.parse_sql(sql)?;
        Ok(a)
    }

    pub fn from_urlenc(data: &str) -> Result<ExecAttrs, WorkerError> {
        let mut a = ExecAttrs::new();
        a.parse_urlenc(data)?;
        Ok(a)
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    pub fn values(&self, key: AttrKey) -> &[String] {
        self.attrs
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_slice())
            .unwrap_or(&[])
    }

    /// Add a single value under a key name.
    pub fn add_value(&mut self, key: &str, value: &str) -> Result<(), WorkerError> {
        let key = AttrKey::parse(key)
            .ok_or_else(|| WorkerError::Usage(format!("invalid exec-attrs key: {key}")))?;
        let value = value.trim();
        match self.attrs.iter_mut().find(|(k, _)| *k == key) {
            Some((_, values)) => values.push(value.to_owned()),
            None => self.attrs.push((key, vec![value.to_owned()])),
        }
        Ok(())
    }

    /// Urlencoded form, stored in `ev_extra2` of EXECUTE events.
    pub fn to_urlenc(&self) -> String {
        let pairs: Vec<(String, String)> = self
            .attrs
            .iter()
            .map(|(k, values)| (k.key(), values.join(",")))
            .collect();
        db_urlencode(pairs.iter().map(|(k, v)| (k.as_str(), Some(v.as_str()))))
    }

    pub fn parse_urlenc(&mut self, data: &str) -> Result<(), WorkerError> {
        for (key, value) in db_urldecode(data)? {
            if let Some(value) = value {
                for part in value.split(',') {
                    if !part.trim().is_empty() {
                        self.add_value(&key, part)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Render meta-comment lines, wrapped at ~70 chars with trailing-comma
    /// continuation.  Round-trips through `parse_sql`.
    pub fn to_sql(&self) -> String {
        let mut lines: Vec<String> = Vec::new();
        for key in ALL_KEYS {
            let values = self.values(key);
            if values.is_empty() {
                continue;
            }
            let mut line = format!("{META_PREFIX} {}: ", key.nice_name());
            let mut start = 0;
            for (nr, value) in values.iter().enumerate() {
                if nr > start {
                    line.push_str(", ");
                }
                line.push_str(value);
                if line.len() >= META_SPLITLINE && nr < values.len() - 1 {
                    line.push(',');
                    lines.push(line);
                    line = format!("{META_PREFIX}     ");
                    start = nr + 1;
                }
            }
            lines.push(line);
        }
        lines.join("\n")
    }

    /// Parse meta-comments off the top of an SQL script.
    pub fn parse_sql(&mut self, sql: &str) -> Result<(), WorkerError> {
        let mut cur_key: Option<String> = None;
        for line in sql.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if !line.starts_with("--") {
                break;
            }
            let Some(rest) = line.strip_prefix(META_PREFIX) else {
                continue;
            };
            let rest = rest.trim();
            if rest.is_empty() {
                continue;
            }

            if let Some(key) = cur_key.clone() {
                // continuation of the previous key
                for value in rest.split(',') {
                    if !value.trim().is_empty() {
                        self.add_value(&key, value)?;
                    }
                }
                if !rest.ends_with(',') {
                    cur_key = None;
                }
                continue;
            }

            let Some(pos) = rest.find(':') else {
                continue;
            };
            let key = rest[..pos].trim().to_owned();
            for value in rest[pos + 1..].split(',') {
                if !value.trim().is_empty() {
                    self.add_value(&key, value)?;
                }
            }
            cur_key = rest.ends_with(',').then_some(key);
        }
        Ok(())
    }

    /// Decide whether the SQL should run on this node.
    ///
    /// All attribute values matching locally means run; none matching means
    /// skip; a mixed result means the script's assumptions are inconsistent
    /// with this node and is a hard error.  No attributes at all means run.
    pub async fn need_execute(
        &self,
        db: &Transaction<'_>,
        local_tables: &HashMap<String, String>,
        local_seqs: &HashMap<String, String>,
    ) -> Result<bool, WorkerError> {
        if self.attrs.is_empty() {
            return Ok(true);
        }
        let mut good: Vec<&str> = Vec::new();
        let mut miss: Vec<&str> = Vec::new();
        for (key, values) in &self.attrs {
            for value in values {
                let fqname = fq_name(value);
                if key.matches(db, &fqname, local_tables, local_seqs).await? {
                    good.push(value);
                } else {
                    miss.push(value);
                }
            }
        }
        match (good.is_empty(), miss.is_empty()) {
            (false, true) => Ok(true),
            (true, false) => Ok(false),
            (true, true) => Ok(true),
            (false, false) => Err(WorkerError::Usage(format!(
                "SQL only partially matches local setup: matches={good:?} misses={miss:?}"
            ))),
        }
    }

    /// Substitute `@name@` tags with quoted local destination names.
    pub fn process_sql(
        &self,
        sql: &str,
        local_tables: &HashMap<String, String>,
        local_seqs: &HashMap<String, String>,
    ) -> Result<String, WorkerError> {
        let mut sql = sql.to_owned();
        for (key, values) in &self.attrs {
            if !key.local_rename() {
                continue;
            }
            for value in values {
                let fqname = fq_name(value);
                let localname = local_tables
                    .get(&fqname)
                    .or_else(|| local_seqs.get(&fqname))
                    .ok_or_else(|| {
                        WorkerError::State(format!("lost table during rename: {value}"))
                    })?;
                sql = sql.replace(&format!("@{value}@"), &quote_fqident(localname));
            }
        }
        Ok(sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn serialize_with_wrapping() {
        let mut a = ExecAttrs::new();
        a.add_value("Local-Table", "mytable").unwrap();
        a.add_value("Local-Sequence", "seq1").unwrap();
        a.add_value("Local-Sequence", "seq2").unwrap();
        for n in 1..=7 {
            a.add_value("Local-Destination", &format!("mytable-longname-more{n}"))
                .unwrap();
        }
        assert_eq!(
            a.to_sql(),
            "--*-- Local-Table: mytable\n\
             --*-- Local-Sequence: seq1, seq2\n\
             --*-- Local-Destination: mytable-longname-more1, mytable-longname-more2,\n\
             --*--     mytable-longname-more3, mytable-longname-more4, mytable-longname-more5,\n\
             --*--     mytable-longname-more6, mytable-longname-more7"
        );
    }

    #[test]
    fn parse_with_continuations() {
        let sql = "\n\n --\n\n\
                   --*-- Local-Table: foo ,\n\
                   --\n\
                   --*-- bar ,\n\
                   --*--\n\
                   --*-- zoo\n\
                   --*--\n\
                   --*-- Local-Sequence: goo\n\
                   --*--\n\
                   --\n\n\
                   create fooza;\n";
        let a = ExecAttrs::from_sql(sql).unwrap();
        assert_eq!(
            a.to_sql(),
            "--*-- Local-Table: foo, bar, zoo\n--*-- Local-Sequence: goo"
        );
    }

    #[test]
    fn parsing_stops_at_sql() {
        let sql = "--*-- Need-Table: a\nselect 1;\n--*-- Need-Table: b\n";
        let a = ExecAttrs::from_sql(sql).unwrap();
        assert_eq!(a.values(AttrKey::NeedTable), ["a"]);
    }

    #[test]
    fn urlenc_roundtrip() {
        let mut a = ExecAttrs::new();
        a.add_value("Local-Table", "mytable").unwrap();
        a.add_value("Local-Sequence", "seq1").unwrap();
        a.add_value("Local-Sequence", "seq2").unwrap();

        let enc = a.to_urlenc();
        assert_eq!(enc, "local-table=mytable&local-sequence=seq1%2cseq2");
        let b = ExecAttrs::from_urlenc(&enc).unwrap();
        assert_eq!(b.values(AttrKey::LocalTable), ["mytable"]);
        assert_eq!(b.values(AttrKey::LocalSequence), ["seq1", "seq2"]);
        assert_eq!(a.to_sql(), b.to_sql());
    }

    #[test]
    fn unknown_keys_rejected() {
        let mut a = ExecAttrs::new();
        assert!(a.add_value("Need-Cluster", "x").is_err());
    }

    #[test]
    fn rename_substitution() {
        let mut a = ExecAttrs::new();
        a.add_value("Local-Table", "foo").unwrap();
        a.add_value("Local-Table", "bar").unwrap();
        a.add_value("Local-Table", "zoo").unwrap();

        let mut tables = HashMap::new();
        tables.insert("public.foo".to_owned(), "public.foo".to_owned());
        tables.insert("public.bar".to_owned(), "other.Bar".to_owned());
        tables.insert("public.zoo".to_owned(), "Other.Foo".to_owned());
        let seqs = HashMap::new();

        let sql = "alter table @foo@;\nalter table @bar@;\nalter table @zoo@;";
        assert_eq!(
            a.process_sql(sql, &tables, &seqs).unwrap(),
            "alter table public.foo;\nalter table other.\"Bar\";\nalter table \"Other\".\"Foo\";"
        );
    }
}
