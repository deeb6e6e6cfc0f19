//! SQL statement builders for row events.

use cartage_util::{quote_fqident, quote_ident, quote_literal};

use crate::row::RowData;
use crate::QueueError;

/// `insert into T (cols) values (lits);`
pub fn mk_insert_sql(row: &RowData, table: &str, _pkey: &[String]) -> String {
    let cols: Vec<String> = row.keys().map(|k| quote_ident(k)).collect();
    let vals: Vec<String> = row.values().map(|v| quote_literal(v.as_deref())).collect();
    format!(
        "insert into {} ({}) values ({});",
        quote_fqident(table),
        cols.join(", "),
        vals.join(", ")
    )
}

/// `update only T set non_pk = lit, ... where pk = lit and ...;`
pub fn mk_update_sql(row: &RowData, table: &str, pkey: &[String]) -> Result<String, QueueError> {
    if pkey.is_empty() {
        return Err(QueueError::BadEvent(format!(
            "update without primary key on {table}"
        )));
    }
    let whe = pkey_condition(row, table, pkey)?;
    let mut set = Vec::new();
    for (col, val) in row {
        if pkey.contains(col) {
            continue;
        }
        set.push(format!("{} = {}", quote_ident(col), quote_literal(val.as_deref())));
    }
    if set.is_empty() {
        // pkey-only table, nothing to change but keep the statement valid
        for col in pkey {
            let val = row.get(col).cloned().flatten();
            set.push(format!("{} = {}", quote_ident(col), quote_literal(val.as_deref())));
        }
    }
    Ok(format!(
        "update only {} set {} where {};",
        quote_fqident(table),
        set.join(", "),
        whe
    ))
}

/// `delete from only T where pk = lit and ...;`
pub fn mk_delete_sql(row: &RowData, table: &str, pkey: &[String]) -> Result<String, QueueError> {
    if pkey.is_empty() {
        return Err(QueueError::BadEvent(format!(
            "delete without primary key on {table}"
        )));
    }
    Ok(format!(
        "delete from only {} where {};",
        quote_fqident(table),
        pkey_condition(row, table, pkey)?
    ))
}

fn pkey_condition(row: &RowData, table: &str, pkey: &[String]) -> Result<String, QueueError> {
    let mut parts = Vec::with_capacity(pkey.len());
    for col in pkey {
        let val = row.get(col).ok_or_else(|| {
            QueueError::BadEvent(format!("pkey column {col} missing from event row on {table}"))
        })?;
        match val {
            Some(v) => parts.push(format!(
                "{} = {}",
                quote_ident(col),
                quote_literal(Some(v.as_str()))
            )),
            None => parts.push(format!("{} is null", quote_ident(col))),
        }
    }
    Ok(parts.join(" and "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn row(pairs: &[(&str, Option<&str>)]) -> RowData {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.map(str::to_owned)))
            .collect()
    }

    #[test]
    fn insert() {
        let r = row(&[("id", Some("1")), ("v", Some("o'x")), ("n", None)]);
        assert_eq!(
            mk_insert_sql(&r, "public.t", &[]),
            "insert into public.t (id, v, n) values ('1', 'o''x', null);"
        );
    }

    #[test]
    fn update() {
        let r = row(&[("id", Some("1")), ("v", Some("y"))]);
        assert_eq!(
            mk_update_sql(&r, "t", &["id".to_owned()]).unwrap(),
            "update only public.t set v = 'y' where id = '1';"
        );
    }

    #[test]
    fn update_pkey_only_table() {
        let r = row(&[("id", Some("1"))]);
        assert_eq!(
            mk_update_sql(&r, "t", &["id".to_owned()]).unwrap(),
            "update only public.t set id = '1' where id = '1';"
        );
    }

    #[test]
    fn delete_with_null_pk_part() {
        let r = row(&[("a", Some("1")), ("b", None)]);
        assert_eq!(
            mk_delete_sql(&r, "s.t", &["a".to_owned(), "b".to_owned()]).unwrap(),
            "delete from only s.t where a = '1' and b is null;"
        );
    }

    #[test]
    fn missing_pkey_is_error() {
        let r = row(&[("v", Some("1"))]);
        assert!(mk_delete_sql(&r, "t", &["id".to_owned()]).is_err());
        assert!(mk_update_sql(&r, "t", &[]).is_err());
    }
}
