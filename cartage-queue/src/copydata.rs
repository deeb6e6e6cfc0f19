//! COPY streaming between two databases.
//!
//! A single-stream variant pipes `COPY ... TO STDOUT` straight into
//! `COPY ... FROM STDIN`, and a fan-out variant round-robins buffered blocks
//! to a pool of inserter tasks, each with its own subscriber connection.
//! Both accept an optional per-line write hook (obfuscation, field
//! projection).

use bytes::{Bytes, BytesMut};
use futures::{pin_mut, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_postgres::{Client, NoTls, Transaction};
use tracing::{debug, error};

use cartage_util::{quote_fqident, quote_ident};

use crate::QueueError;

/// Producer-side block size for the fan-out copy.
const COPY_MERGE_BUF: usize = 256 * 1024;
/// Inserter-side flush threshold.
const COPY_FROM_BLK: usize = 1024 * 1024;

/// Rewrites one COPY text line (trailing newline included).
pub type WriteHook<'a> = &'a mut (dyn FnMut(&str) -> Result<String, QueueError> + Send);

#[derive(Debug, Clone, Copy, Default)]
pub struct CopyStats {
    pub bytes: u64,
    pub rows: u64,
}

/// What to copy where.
#[derive(Debug, Clone)]
pub struct CopySpec {
    pub src_table: String,
    pub dst_table: String,
    pub src_columns: Vec<String>,
    pub dst_columns: Vec<String>,
    pub condition: Option<String>,
}

impl CopySpec {
    pub fn new(src_table: &str, dst_table: &str, columns: &[String]) -> CopySpec {
        CopySpec {
            src_table: src_table.to_owned(),
            dst_table: dst_table.to_owned(),
            src_columns: columns.to_vec(),
            dst_columns: columns.to_vec(),
            condition: None,
        }
    }

    fn qfields(columns: &[String]) -> String {
        if columns.is_empty() {
            "*".to_owned()
        } else {
            columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(",")
        }
    }

    pub fn copy_to_sql(&self) -> String {
        match &self.condition {
            Some(cond) if !cond.is_empty() => format!(
                "COPY (SELECT {} FROM {} WHERE {}) TO STDOUT",
                Self::qfields(&self.src_columns),
                quote_fqident(&self.src_table),
                cond
            ),
            _ if self.src_columns.is_empty() => {
                format!("COPY {} TO STDOUT", quote_fqident(&self.src_table))
            }
            _ => format!(
                "COPY {} ({}) TO STDOUT",
                quote_fqident(&self.src_table),
                Self::qfields(&self.src_columns)
            ),
        }
    }

    pub fn copy_from_sql(&self) -> String {
        if self.dst_columns.is_empty() {
            format!("COPY {} FROM STDIN", quote_fqident(&self.dst_table))
        } else {
            format!(
                "COPY {} ({}) FROM STDIN",
                quote_fqident(&self.dst_table),
                Self::qfields(&self.dst_columns)
            )
        }
    }
}

/// Connect and drive the connection in a background task.
pub async fn connect_database(connstr: &str) -> Result<Client, QueueError> {
    let (client, connection) = tokio_postgres::connect(connstr, NoTls).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!(error = %e, "database connection closed");
        }
    });
    Ok(client)
}

/// Splits the COPY byte stream into whole lines for the write hook.
#[derive(Default)]
struct LineFramer {
    partial: BytesMut,
}

impl LineFramer {
    fn push(
        &mut self,
        chunk: &[u8],
        hook: &mut (dyn FnMut(&str) -> Result<String, QueueError> + Send),
        out: &mut BytesMut,
    ) -> Result<(), QueueError> {
        self.partial.extend_from_slice(chunk);
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let line = self.partial.split_to(pos + 1);
            let line = std::str::from_utf8(&line)
                .map_err(|_| QueueError::Copy("non-utf8 data in COPY stream".to_owned()))?;
            out.extend_from_slice(hook(line)?.as_bytes());
        }
        Ok(())
    }

    fn finish(
        &mut self,
        hook: &mut (dyn FnMut(&str) -> Result<String, QueueError> + Send),
        out: &mut BytesMut,
    ) -> Result<(), QueueError> {
        if self.partial.is_empty() {
            return Ok(());
        }
        // the server always terminates rows; a leftover means a torn stream
        let line = self.partial.split();
        let line = std::str::from_utf8(&line)
            .map_err(|_| QueueError::Copy("non-utf8 data in COPY stream".to_owned()))?;
        out.extend_from_slice(hook(line)?.as_bytes());
        Ok(())
    }
}

/// Stream one table from `src` to `dst` on the current connections.
pub async fn full_copy(
    src: &Transaction<'_>,
    dst: &Transaction<'_>,
    spec: &CopySpec,
    mut write_hook: Option<WriteHook<'_>>,
) -> Result<CopyStats, QueueError> {
    let sql_to = spec.copy_to_sql();
    let sql_from = spec.copy_from_sql();
    debug!(sql_to, sql_from, "starting copy");

    let out = src.copy_out(&sql_to).await?;
    pin_mut!(out);
    let sink = dst.copy_in(&sql_from).await?;
    pin_mut!(sink);

    let mut stats = CopyStats::default();
    let mut framer = LineFramer::default();
    let mut buf = BytesMut::new();

    while let Some(chunk) = out.next().await {
        let chunk: Bytes = chunk?;
        let block = match write_hook.as_mut() {
            Some(hook) => {
                framer.push(&chunk, &mut **hook, &mut buf)?;
                if buf.is_empty() {
                    continue;
                }
                buf.split().freeze()
            }
            None => chunk,
        };
        stats.bytes += block.len() as u64;
        sink.send(block).await?;
    }
    if let Some(hook) = write_hook.as_mut() {
        framer.finish(&mut **hook, &mut buf)?;
        if !buf.is_empty() {
            let block = buf.split().freeze();
            stats.bytes += block.len() as u64;
            sink.send(block).await?;
        }
    }

    stats.rows = sink.finish().await?;
    Ok(stats)
}

/// One inserter: its own connection, its own COPY FROM, blocks over a
/// bounded channel for back-pressure.
async fn inserter(
    connstr: String,
    sql_from: String,
    session_setup: Vec<String>,
    mut rx: mpsc::Receiver<Bytes>,
) -> Result<u64, QueueError> {
    let client = connect_database(&connstr).await?;
    for sql in &session_setup {
        client.batch_execute(sql).await?;
    }
    let sink = client.copy_in(&sql_from).await?;
    pin_mut!(sink);

    let mut pending = BytesMut::new();
    while let Some(block) = rx.recv().await {
        pending.extend_from_slice(&block);
        if pending.len() >= COPY_FROM_BLK {
            sink.send(pending.split().freeze()).await?;
        }
    }
    if !pending.is_empty() {
        sink.send(pending.split().freeze()).await?;
    }
    Ok(sink.finish().await?)
}

/// Fan-out copy: one producer, `parallel` inserter tasks.
///
/// The producer batches the outgoing stream into ~256 KiB blocks and
/// round-robins them across the inserters; any inserter failure aborts the
/// whole copy.
pub async fn full_copy_parallel(
    src: &Transaction<'_>,
    dst_connstr: &str,
    spec: &CopySpec,
    parallel: usize,
    session_setup: &[String],
    mut write_hook: Option<WriteHook<'_>>,
) -> Result<CopyStats, QueueError> {
    assert!(parallel >= 1, "parallel copy needs at least one inserter");

    let sql_to = spec.copy_to_sql();
    let sql_from = spec.copy_from_sql();
    debug!(sql_to, sql_from, parallel, "starting parallel copy");

    let mut senders = Vec::with_capacity(parallel);
    let mut workers = Vec::with_capacity(parallel);
    for _ in 0..parallel {
        let (tx, rx) = mpsc::channel::<Bytes>(4);
        senders.push(tx);
        workers.push(tokio::spawn(inserter(
            dst_connstr.to_owned(),
            sql_from.clone(),
            session_setup.to_vec(),
            rx,
        )));
    }

    let out = src.copy_out(&sql_to).await?;
    pin_mut!(out);

    let mut stats = CopyStats::default();
    let mut framer = LineFramer::default();
    let mut block = BytesMut::new();
    let mut send_pos = 0usize;

    let mut send_block = |block: Bytes, pos: &mut usize| {
        let target = senders[*pos % parallel].clone();
        *pos += 1;
        async move {
            target
                .send(block)
                .await
                .map_err(|_| QueueError::Copy("inserter exited early".to_owned()))
        }
    };

    while let Some(chunk) = out.next().await {
        let chunk: Bytes = chunk?;
        match write_hook.as_mut() {
            Some(hook) => framer.push(&chunk, &mut **hook, &mut block)?,
            None => block.extend_from_slice(&chunk),
        }
        if block.len() >= COPY_MERGE_BUF {
            let b = block.split().freeze();
            stats.bytes += b.len() as u64;
            send_block(b, &mut send_pos).await?;
        }
    }
    if let Some(hook) = write_hook.as_mut() {
        framer.finish(&mut **hook, &mut block)?;
    }
    if !block.is_empty() {
        let b = block.split().freeze();
        stats.bytes += b.len() as u64;
        send_block(b, &mut send_pos).await?;
    }

    drop(senders);
    for worker in workers {
        let rows = worker
            .await
            .map_err(|e| QueueError::Copy(format!("inserter panicked: {e}")))??;
        stats.rows += rows;
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> CopySpec {
        CopySpec {
            src_table: "public.t".into(),
            dst_table: "dst.t2".into(),
            src_columns: vec!["id".into(), "v".into()],
            dst_columns: vec!["id".into(), "val".into()],
            condition: None,
        }
    }

    #[test]
    fn copy_sql_plain() {
        let s = spec();
        assert_eq!(s.copy_to_sql(), "COPY public.t (id,v) TO STDOUT");
        assert_eq!(s.copy_from_sql(), "COPY dst.t2 (id,val) FROM STDIN");
    }

    #[test]
    fn copy_sql_with_condition() {
        let mut s = spec();
        s.condition = Some("(h & 3) = 1".into());
        assert_eq!(
            s.copy_to_sql(),
            "COPY (SELECT id,v FROM public.t WHERE (h & 3) = 1) TO STDOUT"
        );
    }

    #[test]
    fn framer_reassembles_split_lines() {
        let mut framer = LineFramer::default();
        let mut hook = |line: &str| -> Result<String, QueueError> { Ok(line.to_uppercase()) };
        let mut out = BytesMut::new();
        framer.push(b"ab\tc", &mut hook, &mut out).unwrap();
        assert!(out.is_empty());
        framer.push(b"d\nxy\n", &mut hook, &mut out).unwrap();
        assert_eq!(&out[..], b"AB\tCD\nXY\n");
    }
}
