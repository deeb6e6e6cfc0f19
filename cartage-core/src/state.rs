//! Per-table replication state.
//!
//! Each locally replicated table moves through
//! missing → in-copy → catching-up → wanna-sync → do-sync → ok, with the
//! main worker and the copy worker each owning a fixed set of transitions.
//! The database row behind this is the source of truth; this cache is
//! rebuilt from it at the top of every batch.

use std::collections::HashMap;

use tokio_postgres::Row;
use tracing::debug;

use cartage_handlers::{Handler, HandlerRegistry};
use cartage_queue::Event;
use cartage_util::urlenc::UrlMap;
use cartage_util::{db_urldecode, Snapshot};

use crate::WorkerError;

/// Default cap on parallel copy processes per table.
pub const MAX_PARALLEL_COPY: usize = 8;

/// Table state machine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TablePhase {
    Missing,
    InCopy,
    CatchingUp,
    WannaSync,
    DoSync,
    Ok,
}

/// State of one replicated table on this node.
pub struct TableState {
    pub name: String,
    pub dest_table: String,
    pub state: TablePhase,
    pub str_snapshot: Option<String>,
    from_snapshot: Option<Snapshot>,
    pub sync_tick_id: Option<i64>,
    pub last_snapshot_tick: Option<i64>,
    pub last_tick: Option<i64>,
    pub ok_batch_count: i32,
    pub table_attrs: UrlMap,
    pub copy_role: Option<String>,
    pub dropped_ddl: Option<String>,
    pub copy_pos: i32,
    pub max_parallel_copy: usize,
    pub plugin: Option<Box<dyn Handler>>,
    pub changed: bool,
}

impl TableState {
    pub fn new(name: &str) -> TableState {
        TableState {
            name: name.to_owned(),
            dest_table: name.to_owned(),
            state: TablePhase::Missing,
            str_snapshot: None,
            from_snapshot: None,
            sync_tick_id: None,
            last_snapshot_tick: None,
            last_tick: Some(0),
            ok_batch_count: 0,
            table_attrs: UrlMap::new(),
            copy_role: None,
            dropped_ddl: None,
            copy_pos: 0,
            max_parallel_copy: MAX_PARALLEL_COPY,
            plugin: None,
            changed: false,
        }
    }

    /// Reset all info, as after remove-table.
    pub fn forget(&mut self) {
        self.state = TablePhase::Missing;
        self.str_snapshot = None;
        self.from_snapshot = None;
        self.sync_tick_id = None;
        self.last_snapshot_tick = None;
        self.last_tick = Some(0);
        self.ok_batch_count = 0;
        self.table_attrs = UrlMap::new();
        self.plugin = None;
        self.copy_pos = 0;
        self.max_parallel_copy = MAX_PARALLEL_COPY;
        self.changed = true;
    }

    pub fn change_snapshot(&mut self, str_snapshot: Option<String>, tag_changed: bool) {
        if self.str_snapshot == str_snapshot {
            return;
        }
        debug!(table = %self.name, snapshot = ?str_snapshot, "change_snapshot");
        self.from_snapshot = str_snapshot
            .as_deref()
            .and_then(|s| Snapshot::parse(s).ok());
        self.str_snapshot = str_snapshot;
        if tag_changed {
            self.ok_batch_count = 0;
            self.last_tick = None;
            self.changed = true;
        }
    }

    pub fn change_state(&mut self, state: TablePhase, tick_id: Option<i64>) {
        if self.state == state && self.sync_tick_id == tick_id {
            return;
        }
        self.state = state;
        self.sync_tick_id = tick_id;
        self.changed = true;
        debug!(table = %self.name, state = ?self.render_state(), "change_state");
    }

    /// The `merge_state` string stored in the database.
    pub fn render_state(&self) -> Option<String> {
        match self.state {
            TablePhase::Missing => None,
            TablePhase::InCopy => Some("in-copy".to_owned()),
            TablePhase::CatchingUp => Some("catching-up".to_owned()),
            TablePhase::WannaSync => {
                Some(format!("wanna-sync:{}", self.sync_tick_id.unwrap_or(0)))
            }
            TablePhase::DoSync => Some(format!("do-sync:{}", self.sync_tick_id.unwrap_or(0))),
            TablePhase::Ok => Some("ok".to_owned()),
        }
    }

    /// Parse a stored `merge_state` string, capturing the sync tick.
    pub fn parse_state(&mut self, merge_state: Option<&str>) -> Result<TablePhase, WorkerError> {
        match merge_state {
            None => Ok(TablePhase::Missing),
            Some("in-copy") => Ok(TablePhase::InCopy),
            Some("catching-up") => Ok(TablePhase::CatchingUp),
            Some("ok") | Some("?") => Ok(TablePhase::Ok),
            Some(other) => {
                if let Some((prefix, tick)) = other.split_once(':') {
                    if let Ok(tick) = tick.parse::<i64>() {
                        self.sync_tick_id = Some(tick);
                        match prefix {
                            "wanna-sync" => return Ok(TablePhase::WannaSync),
                            "do-sync" => return Ok(TablePhase::DoSync),
                            _ => {}
                        }
                    }
                }
                Err(WorkerError::State(other.to_owned()))
            }
        }
    }

    /// Refresh from a `get_table_list()` row and rebind the handler.
    pub fn loaded_state(&mut self, row: &Row, registry: &HandlerRegistry) -> Result<(), WorkerError> {
        let merge_state: Option<String> = row.try_get("merge_state")?;
        let custom_snapshot: Option<String> = row.try_get("custom_snapshot")?;
        debug!(
            table = %self.name,
            merge_state = ?merge_state,
            snapshot = ?custom_snapshot,
            "loaded_state"
        );
        self.change_snapshot(custom_snapshot, false);
        self.state = self.parse_state(merge_state.as_deref())?;
        self.changed = false;
        let attrs: Option<String> = row.try_get("table_attrs")?;
        self.table_attrs = match attrs.as_deref() {
            Some(a) if !a.is_empty() => db_urldecode(a)?,
            _ => UrlMap::new(),
        };
        self.copy_role = row.try_get("copy_role")?;
        self.dropped_ddl = row.try_get("dropped_ddl")?;
        if merge_state.as_deref() == Some("?") {
            self.changed = true;
        }

        self.copy_pos = row
            .try_get::<_, Option<i32>>("copy_pos")
            .unwrap_or(None)
            .unwrap_or(0);
        self.max_parallel_copy = self
            .table_attrs
            .get("max_parallel_copy")
            .cloned()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(MAX_PARALLEL_COPY);

        let dest: Option<String> = row.try_get("dest_table")?;
        self.dest_table = match dest {
            Some(d) if !d.is_empty() => d,
            _ => self.name.clone(),
        };

        // `handlers` is the legacy spelling of the attribute
        let hstr = self
            .table_attrs
            .get("handler")
            .or_else(|| self.table_attrs.get("handlers"))
            .cloned()
            .flatten()
            .unwrap_or_default();
        self.plugin = Some(registry.build(&self.name, &hstr, Some(&self.dest_table))?);
        Ok(())
    }

    pub fn max_parallel_copies_reached(&self) -> bool {
        self.copy_pos as usize >= self.max_parallel_copy
    }

    /// Does this table want the given event?
    ///
    /// During normal replay only tables in `ok` state accept events; on a
    /// copy worker only the copied table does, while catching up or doing
    /// the final sync.  Events already visible to the copy snapshot are
    /// dropped, and after a few batches with nothing filtered the snapshot
    /// check disables itself.
    pub fn interesting(
        &mut self,
        ev: &Event,
        tick_id: i64,
        copy_thread: bool,
        copy_table_name: Option<&str>,
    ) -> bool {
        if copy_thread {
            if Some(self.name.as_str()) != copy_table_name {
                return false;
            }
            if !matches!(self.state, TablePhase::CatchingUp | TablePhase::DoSync) {
                return false;
            }
        } else if self.state != TablePhase::Ok {
            return false;
        }

        let Some(snapshot) = &self.from_snapshot else {
            return true;
        };
        if let Some(txid) = ev.txid {
            if snapshot.contains(txid) {
                return false;
            }
        }

        // after a couple of fully-interesting batches there can be at most
        // one partially interesting batch left, stop checking
        if Some(tick_id) != self.last_tick {
            self.last_tick = Some(tick_id);
            self.ok_batch_count += 1;
            if self.ok_batch_count > 3 {
                self.change_snapshot(None, true);
            }
        }
        true
    }

    /// Remove the attached snapshot once the stream has passed it.  Needed
    /// for mostly-idle tables where the batch counter in `interesting()`
    /// would take a long time to trip.
    pub fn gc_snapshot(
        &mut self,
        copy_thread: bool,
        prev_tick: i64,
        cur_tick: i64,
        no_lag: bool,
    ) {
        if self.str_snapshot.is_none() {
            return;
        }
        if copy_thread {
            if self.state != TablePhase::CatchingUp {
                return;
            }
        } else if self.state != TablePhase::Ok {
            return;
        }

        match self.last_snapshot_tick {
            None => {
                if no_lag {
                    self.last_snapshot_tick = Some(cur_tick);
                }
            }
            Some(last) => {
                if last < prev_tick {
                    self.change_snapshot(None, true);
                }
            }
        }
    }
}

/// Tally of table phases, used by the sync scheduler.  A table in threaded
/// copy occupies its whole inserter pool's worth of slots.
#[derive(Debug, Default, Clone, Copy)]
pub struct Counter {
    pub missing: usize,
    pub copy: usize,
    pub catching_up: usize,
    pub wanna_sync: usize,
    pub do_sync: usize,
    pub ok: usize,
}

impl Counter {
    pub fn new<'a, I>(tables: I, copy_method_map: &HashMap<String, Option<usize>>) -> Counter
    where
        I: IntoIterator<Item = &'a TableState>,
    {
        let mut cnt = Counter::default();
        for t in tables {
            match t.state {
                TablePhase::Missing => cnt.missing += 1,
                TablePhase::InCopy => {
                    cnt.copy += copy_method_map.get(&t.name).copied().flatten().unwrap_or(1)
                }
                TablePhase::CatchingUp => cnt.catching_up += 1,
                TablePhase::WannaSync => cnt.wanna_sync += 1,
                TablePhase::DoSync => cnt.do_sync += 1,
                TablePhase::Ok => cnt.ok += 1,
            }
        }
        cnt
    }

    pub fn copy_count(&self) -> usize {
        self.copy + self.catching_up + self.wanna_sync + self.do_sync
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn ev(txid: i64) -> Event {
        Event {
            id: 1,
            ev_type: "I:id".to_owned(),
            data: Some("id=1".to_owned()),
            extra1: Some("public.t".to_owned()),
            extra2: None,
            extra3: None,
            extra4: None,
            time: Utc::now(),
            txid: Some(txid),
            retry: None,
        }
    }

    #[test]
    fn state_render_parse_roundtrip() {
        let mut t = TableState::new("public.t");
        for (phase, tick) in [
            (TablePhase::InCopy, None),
            (TablePhase::CatchingUp, None),
            (TablePhase::WannaSync, Some(17)),
            (TablePhase::DoSync, Some(17)),
            (TablePhase::Ok, None),
        ] {
            t.change_state(phase, tick);
            let rendered = t.render_state();
            let mut t2 = TableState::new("public.t");
            let parsed = t2.parse_state(rendered.as_deref()).unwrap();
            assert_eq!(parsed, phase);
            assert_eq!(t2.sync_tick_id.or(tick), tick);
        }

        let mut t3 = TableState::new("public.t");
        assert_eq!(t3.parse_state(None).unwrap(), TablePhase::Missing);
        assert_eq!(t3.parse_state(Some("?")).unwrap(), TablePhase::Ok);
        assert!(t3.parse_state(Some("gibberish")).is_err());
        assert!(t3.parse_state(Some("wanna-sync:x")).is_err());
    }

    #[test]
    fn change_state_marks_dirty() {
        let mut t = TableState::new("public.t");
        t.changed = false;
        t.change_state(TablePhase::InCopy, None);
        assert!(t.changed);
        t.changed = false;
        // same state, same tick: no-op
        t.change_state(TablePhase::InCopy, None);
        assert!(!t.changed);
    }

    #[test]
    fn snapshot_filtering() {
        let mut t = TableState::new("public.t");
        t.state = TablePhase::Ok;
        t.change_snapshot(Some("100:200:150".to_owned()), false);

        // already visible to the copy: dropped
        assert!(!t.interesting(&ev(50), 10, false, None));
        // in progress at snapshot time: replayed
        assert!(t.interesting(&ev(150), 10, false, None));
        // after snapshot: replayed
        assert!(t.interesting(&ev(300), 11, false, None));
    }

    #[test]
    fn snapshot_disabled_after_ok_batches() {
        let mut t = TableState::new("public.t");
        t.state = TablePhase::Ok;
        t.change_snapshot(Some("100:100:".to_owned()), false);

        for tick in 1..=4 {
            assert!(t.interesting(&ev(1000 + tick), tick, false, None));
        }
        assert!(t.str_snapshot.is_none(), "snapshot dropped after 4 ticks");
    }

    #[test]
    fn interest_rules_per_worker() {
        let mut t = TableState::new("public.t");
        t.state = TablePhase::CatchingUp;
        assert!(!t.interesting(&ev(1), 1, false, None), "main ignores non-ok");
        assert!(t.interesting(&ev(1), 1, true, Some("public.t")));
        assert!(!t.interesting(&ev(1), 1, true, Some("public.other")));

        t.state = TablePhase::InCopy;
        assert!(!t.interesting(&ev(1), 1, true, Some("public.t")));
    }

    #[test]
    fn gc_snapshot_two_phase() {
        let mut t = TableState::new("public.t");
        t.state = TablePhase::Ok;
        t.change_snapshot(Some("5:5:".to_owned()), false);

        // lagging: nothing recorded
        t.gc_snapshot(false, 9, 10, false);
        assert!(t.str_snapshot.is_some());
        assert_eq!(t.last_snapshot_tick, None);

        // caught up: remember current tick
        t.gc_snapshot(false, 9, 10, true);
        assert_eq!(t.last_snapshot_tick, Some(10));

        // still same batch window: keep
        t.gc_snapshot(false, 10, 11, true);
        assert!(t.str_snapshot.is_some());

        // stream has passed it: clear
        t.gc_snapshot(false, 11, 12, true);
        assert!(t.str_snapshot.is_none());
    }

    #[test]
    fn counter_threaded_slots() {
        let mut a = TableState::new("public.a");
        a.state = TablePhase::InCopy;
        let mut b = TableState::new("public.b");
        b.state = TablePhase::InCopy;
        let mut c = TableState::new("public.c");
        c.state = TablePhase::Ok;

        let mut map = HashMap::new();
        map.insert("public.a".to_owned(), Some(4));
        map.insert("public.b".to_owned(), None);
        map.insert("public.c".to_owned(), None);

        let cnt = Counter::new([&a, &b, &c], &map);
        assert_eq!(cnt.copy, 5);
        assert_eq!(cnt.ok, 1);
        assert_eq!(cnt.copy_count(), 5);
    }
}
