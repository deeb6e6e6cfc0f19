//! Probes against the local system catalogs.

use tokio_postgres::GenericClient;

use cartage_util::fq_name_parts;

use crate::QueueError;

pub async fn exists_table<C: GenericClient>(db: &C, name: &str) -> Result<bool, QueueError> {
    relkind_exists(db, name, &["r", "p"]).await
}

pub async fn exists_view<C: GenericClient>(db: &C, name: &str) -> Result<bool, QueueError> {
    relkind_exists(db, name, &["v", "m"]).await
}

pub async fn exists_sequence<C: GenericClient>(db: &C, name: &str) -> Result<bool, QueueError> {
    relkind_exists(db, name, &["S"]).await
}

async fn relkind_exists<C: GenericClient>(
    db: &C,
    name: &str,
    kinds: &[&str],
) -> Result<bool, QueueError> {
    let (schema, rel) = fq_name_parts(name);
    let row = db
        .query_one(
            "select count(*) > 0 as found \
             from pg_catalog.pg_class c \
             join pg_catalog.pg_namespace n on n.oid = c.relnamespace \
             where n.nspname = $1 and c.relname = $2 \
               and c.relkind::text = any($3)",
            &[&schema, &rel, &kinds],
        )
        .await?;
    Ok(row.try_get("found")?)
}

pub async fn exists_schema<C: GenericClient>(db: &C, name: &str) -> Result<bool, QueueError> {
    let row = db
        .query_one(
            "select count(*) > 0 as found from pg_catalog.pg_namespace where nspname = $1",
            &[&name],
        )
        .await?;
    Ok(row.try_get("found")?)
}

/// `name` or `name(nargs)`.
pub async fn exists_function<C: GenericClient>(
    db: &C,
    name: &str,
    nargs: i16,
) -> Result<bool, QueueError> {
    let (schema, fname) = fq_name_parts(name);
    let row = db
        .query_one(
            "select count(*) > 0 as found \
             from pg_catalog.pg_proc p \
             join pg_catalog.pg_namespace n on n.oid = p.pronamespace \
             where n.nspname = $1 and p.proname = $2 and p.pronargs = $3",
            &[&schema, &fname, &nargs],
        )
        .await?;
    Ok(row.try_get("found")?)
}

/// Column names in attribute order.
pub async fn get_table_columns<C: GenericClient>(
    db: &C,
    name: &str,
) -> Result<Vec<String>, QueueError> {
    let (schema, rel) = fq_name_parts(name);
    let rows = db
        .query(
            "select a.attname \
             from pg_catalog.pg_attribute a \
             join pg_catalog.pg_class c on c.oid = a.attrelid \
             join pg_catalog.pg_namespace n on n.oid = c.relnamespace \
             where n.nspname = $1 and c.relname = $2 \
               and a.attnum > 0 and not a.attisdropped \
             order by a.attnum",
            &[&schema, &rel],
        )
        .await?;
    Ok(rows.iter().map(|r| r.get(0)).collect())
}

/// Primary key column names in key order.
pub async fn get_table_pkeys<C: GenericClient>(
    db: &C,
    name: &str,
) -> Result<Vec<String>, QueueError> {
    let (schema, rel) = fq_name_parts(name);
    let rows = db
        .query(
            "select a.attname \
             from pg_catalog.pg_index i \
             join pg_catalog.pg_class c on c.oid = i.indrelid \
             join pg_catalog.pg_namespace n on n.oid = c.relnamespace \
             join pg_catalog.pg_attribute a \
               on a.attrelid = c.oid and a.attnum = any(i.indkey) \
             where n.nspname = $1 and c.relname = $2 and i.indisprimary \
             order by array_position(i.indkey, a.attnum)",
            &[&schema, &rel],
        )
        .await?;
    Ok(rows.iter().map(|r| r.get(0)).collect())
}

/// Current client encoding of a session.
pub async fn client_encoding<C: GenericClient>(db: &C) -> Result<String, QueueError> {
    let row = db.query_one("show client_encoding", &[]).await?;
    Ok(row.try_get(0)?)
}
