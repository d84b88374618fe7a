//! Background flush worker.
//!
//! The worker owns the backing store and the fail queue. Each cycle it
//! receives one batch of changes from the collector and applies it:
//!
//! 1. Prepend the fail queue left by earlier cycles
//! 2. Coalesce updates into earlier inserts/updates of the same key
//! 3. Split into an insert batch and an ordered "other" batch
//! 4. Insert batch: one transaction of multi-row inserts, falling back to
//!    single-row inserts after a rollback
//! 5. Other batch: row by row, stopping at the first failure
//! 6. Whatever was not applied moves to the fail queue, which is mirrored
//!    to the bomb file (written if non-empty, removed if empty)
//!
//! Panics inside a cycle are caught; everything outstanding is treated as
//! failed, so a change is delayed but never dropped.

use crate::codec::EntityCodec;
use crate::envelope::{decode_fail_queue, encode_fail_queue, PendingChange};
use crate::error::{CoreError, CoreResult};
use crate::recovery::RecoveryFiles;
use crate::stats::FlushStats;
use crate::types::Op;
use stasis_storage::{BackingStore, ColumnSet, Record, StorageError, StorageResult};
use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Where a change goes after coalescing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Multi-row insert batch.
    Insert,
    /// Ordered row-by-row batch.
    Other,
    /// Folded into the change at this index.
    Fold(usize),
}

/// Plans coalescing and partitioning of `changes`, given their keys.
///
/// An update folds into the latest surviving insert or update of the same
/// key. An insert joins the insert batch only if no earlier surviving
/// change of its key is an update or delete, so per-key order holds when
/// the insert batch runs first.
fn plan<K: Eq + std::hash::Hash>(ops: &[Op], keys: &[K]) -> Vec<Step> {
    let mut latest: HashMap<&K, usize> = HashMap::new();
    let mut non_insert: HashSet<&K> = HashSet::new();
    let mut steps = Vec::with_capacity(ops.len());

    for (index, (&op, key)) in ops.iter().zip(keys).enumerate() {
        if op == Op::Update {
            if let Some(&target) = latest.get(key) {
                if matches!(ops[target], Op::Insert | Op::Update) {
                    steps.push(Step::Fold(target));
                    continue;
                }
            }
        }

        let step = if op == Op::Insert && !non_insert.contains(key) {
            Step::Insert
        } else {
            Step::Other
        };
        if op != Op::Insert {
            non_insert.insert(key);
        }
        latest.insert(key, index);
        steps.push(step);
    }
    steps
}

/// Applies one change as a single statement.
///
/// A panicking driver is reported as a failed statement.
pub(crate) fn apply_change<T: Record>(
    store: &mut dyn BackingStore<T>,
    columns: &[String],
    change: &PendingChange<T>,
) -> StorageResult<u64> {
    panic::catch_unwind(AssertUnwindSafe(|| match change.op {
        Op::Insert => store.insert(&change.entity),
        Op::Update => {
            let key = change.key();
            if change.dirty.is_set_all() {
                return store.update(&key, &change.entity, ColumnSet::All);
            }
            let names: Vec<String> = change
                .dirty
                .iter_set()
                .filter_map(|i| columns.get(i).cloned())
                .collect();
            if names.is_empty() {
                store.update(&key, &change.entity, ColumnSet::All)
            } else {
                store.update(&key, &change.entity, ColumnSet::Only(&names))
            }
        }
        Op::Delete => store.delete(&change.key()),
    }))
    .unwrap_or_else(|payload| {
        Err(StorageError::backend(format!(
            "statement panicked: {}",
            panic_message(&*payload)
        )))
    })
}

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("(non-string panic)")
}

/// Owns the backing store and applies batches to it.
pub(crate) struct FlushWorker<T: Record> {
    name: Arc<str>,
    store: Box<dyn BackingStore<T>>,
    codec: Arc<dyn EntityCodec<T>>,
    files: Arc<RecoveryFiles>,
    stats: Arc<FlushStats>,
    /// Column name of each field, by declaration index.
    columns: Vec<String>,
    batch_size: usize,
    idle_interval: Duration,
    fail_queue: Vec<PendingChange<T>>,
    inserts: VecDeque<PendingChange<T>>,
    others: VecDeque<PendingChange<T>>,
    /// A transaction is open on `store`.
    in_tx: bool,
}

impl<T: Record> FlushWorker<T> {
    pub(crate) fn new(
        name: Arc<str>,
        store: Box<dyn BackingStore<T>>,
        codec: Arc<dyn EntityCodec<T>>,
        files: Arc<RecoveryFiles>,
        stats: Arc<FlushStats>,
        batch_size: usize,
        idle_interval: Duration,
    ) -> Self {
        let mapper = store.column_mapper();
        let columns = T::FIELDS.iter().map(|f| mapper.column_name(f)).collect();
        Self {
            name,
            store,
            codec,
            files,
            stats,
            columns,
            batch_size: batch_size.max(1),
            idle_interval,
            fail_queue: Vec::new(),
            inserts: VecDeque::new(),
            others: VecDeque::new(),
            in_tx: false,
        }
    }

    /// Column names by field index.
    pub(crate) fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Changes waiting for the next non-idle cycle.
    #[cfg(test)]
    pub(crate) fn fail_queue(&self) -> &[PendingChange<T>] {
        &self.fail_queue
    }

    /// Replays pending changes before the manager accepts work.
    ///
    /// A worker that already holds a fail queue replays it and ignores the
    /// bomb file, which may lag behind after a failed bomb write. A fresh
    /// worker replays the bomb file, if any. Returns the number of rows
    /// replayed.
    ///
    /// # Errors
    ///
    /// Fails if the tmp marker exists, the bomb is unreadable, or a row
    /// fails; in the last case the fail queue and the bomb hold exactly the
    /// rows from the failing one onward.
    pub(crate) fn recover(&mut self) -> CoreResult<usize> {
        self.files.check_tmp()?;
        let mut queue = if self.fail_queue.is_empty() {
            let Some(payload) = self.files.read_bomb()? else {
                return Ok(0);
            };
            decode_fail_queue(&*self.codec, &payload, T::field_count())?
        } else {
            mem::take(&mut self.fail_queue)
        };
        info!(manager = %self.name, rows = queue.len(), "replaying pending changes");

        let mut applied = 0;
        let mut failure = None;
        for change in &queue {
            if let Err(e) = apply_change(&mut *self.store, &self.columns, change) {
                failure = Some(e);
                break;
            }
            applied += 1;
        }
        self.stats.record_recovered(applied as u64);

        if let Some(e) = failure {
            self.fail_queue = queue.split_off(applied);
            warn!(
                manager = %self.name,
                index = applied,
                remaining = self.fail_queue.len(),
                error = %e,
                "replay stopped"
            );
            let payload = encode_fail_queue(&*self.codec, &self.fail_queue)?;
            self.files.write_bomb(&payload)?;
            self.stats.record_bomb_write();
            return Err(e.into());
        }

        if self.files.remove_bomb()? {
            self.stats.record_bomb_removal();
        }
        info!(manager = %self.name, rows = applied, "replay complete");
        Ok(applied)
    }

    /// Runs one cycle over `batch`, leaving it empty.
    ///
    /// Returns true if the worker should exit.
    pub(crate) fn run_cycle(&mut self, batch: &mut Vec<PendingChange<T>>, keep_running: bool) -> bool {
        let started = Instant::now();
        if batch.is_empty() {
            if !keep_running {
                return true;
            }
            thread::sleep(self.idle_interval);
            self.stats.record_idle_cycle(started.elapsed());
            return false;
        }

        let rows = self.fail_queue.len() + batch.len();
        debug!(manager = %self.name, rows, retries = self.fail_queue.len(), "flush cycle");
        self.others.extend(self.fail_queue.drain(..));
        self.others.extend(batch.drain(..));

        match panic::catch_unwind(AssertUnwindSafe(|| self.flush())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(manager = %self.name, error = %e, "flush cycle stopped at a failed row");
            }
            Err(payload) => {
                self.stats.record_panic();
                error!(
                    manager = %self.name,
                    "flush cycle panicked: {}",
                    panic_message(&*payload)
                );
            }
        }

        self.rollback_if_open();
        self.data_to_fail_queue();
        self.persist_fail_queue();
        self.stats.record_cycle(started.elapsed());
        !keep_running
    }

    fn flush(&mut self) -> CoreResult<()> {
        self.coalesce();
        self.flush_inserts()?;
        self.flush_others()
    }

    /// Coalesces `others` and splits it into `inserts` and `others`.
    fn coalesce(&mut self) {
        let ops: Vec<Op> = self.others.iter().map(|c| c.op).collect();
        let keys: Vec<T::Key> = self.others.iter().map(PendingChange::key).collect();
        let steps = plan(&ops, &keys);

        let mut slots: Vec<Option<PendingChange<T>>> =
            mem::take(&mut self.others).into_iter().map(Some).collect();
        let mut merged = 0;
        for (index, step) in steps.iter().enumerate() {
            let Step::Fold(target) = *step else {
                continue;
            };
            let Some(change) = slots[index].take() else {
                continue;
            };
            if let Some(into) = slots[target].as_mut() {
                into.entity = change.entity;
                into.dirty.merge(&change.dirty);
                merged += 1;
            }
        }
        if merged > 0 {
            self.stats.record_merged(merged);
        }

        for (slot, step) in slots.into_iter().zip(steps) {
            match (slot, step) {
                (Some(change), Step::Insert) => self.inserts.push_back(change),
                (Some(change), _) => self.others.push_back(change),
                (None, _) => {}
            }
        }
    }

    fn flush_inserts(&mut self) -> CoreResult<()> {
        if self.inserts.is_empty() {
            return Ok(());
        }

        match self.insert_multi() {
            Ok(()) => {
                self.stats.record_applied(self.inserts.len() as u64);
                self.inserts.clear();
                return Ok(());
            }
            Err(e) => {
                warn!(
                    manager = %self.name,
                    rows = self.inserts.len(),
                    error = %e,
                    "multi-row insert failed, falling back to single-row inserts"
                );
                self.rollback_if_open();
                self.stats.record_insert_fallback();
            }
        }

        while let Some(change) = self.inserts.front() {
            if let Err(e) = apply_change(&mut *self.store, &self.columns, change) {
                warn!(manager = %self.name, key = ?change.key(), error = %e, "insert failed");
                return Err(e.into());
            }
            self.inserts.pop_front();
            self.stats.record_applied(1);
        }
        Ok(())
    }

    /// Inserts the whole insert batch in one transaction.
    fn insert_multi(&mut self) -> StorageResult<()> {
        self.store.begin()?;
        self.in_tx = true;

        for chunk in self.inserts.make_contiguous().chunks(self.batch_size) {
            let rows: Vec<&T> = chunk.iter().map(|c| &c.entity).collect();
            self.store.insert_multi(&rows)?;
            self.stats.record_multi_insert();
        }

        // A failed commit ends the transaction too.
        self.in_tx = false;
        self.store.commit()
    }

    fn flush_others(&mut self) -> CoreResult<()> {
        while let Some(change) = self.others.front() {
            if let Err(e) = apply_change(&mut *self.store, &self.columns, change) {
                warn!(
                    manager = %self.name,
                    op = %change.op,
                    key = ?change.key(),
                    error = %e,
                    "write failed"
                );
                return Err(CoreError::from(e));
            }
            self.others.pop_front();
            self.stats.record_applied(1);
        }
        Ok(())
    }

    fn rollback_if_open(&mut self) {
        if !self.in_tx {
            return;
        }
        self.in_tx = false;
        if let Err(e) = self.store.rollback() {
            warn!(manager = %self.name, error = %e, "rollback failed");
        }
    }

    /// Moves every unapplied change into the fail queue, in order.
    fn data_to_fail_queue(&mut self) {
        let moved = self.inserts.len() + self.others.len();
        self.fail_queue.extend(self.inserts.drain(..));
        self.fail_queue.extend(self.others.drain(..));
        if moved > 0 {
            self.stats.record_failed(moved as u64);
        }
    }

    /// Makes the bomb file mirror the fail queue.
    fn persist_fail_queue(&mut self) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| -> CoreResult<()> {
            if self.fail_queue.is_empty() {
                if self.files.remove_bomb()? {
                    self.stats.record_bomb_removal();
                }
                return Ok(());
            }
            let payload = encode_fail_queue(&*self.codec, &self.fail_queue)?;
            self.files.write_bomb(&payload)?;
            self.stats.record_bomb_write();
            debug!(manager = %self.name, rows = self.fail_queue.len(), "bomb file written");
            Ok(())
        }));

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(
                    manager = %self.name,
                    rows = self.fail_queue.len(),
                    error = %e,
                    "failed to sync bomb file"
                );
            }
            Err(payload) => {
                self.stats.record_panic();
                error!(
                    manager = %self.name,
                    "bomb encoding panicked: {}",
                    panic_message(&*payload)
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::DirtyBitmap;
    use crate::codec::CborCodec;
    use crate::config::ManagerConfig;
    use crate::recovery::RecoveryFiles;
    use serde::{Deserialize, Serialize};
    use stasis_storage::{InMemoryStore, Statement};
    use tempfile::{tempdir, TempDir};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        id: u32,
        name: String,
        count: i64,
    }

    impl Record for Item {
        type Key = u32;
        const TABLE: &'static str = "item";
        const FIELDS: &'static [&'static str] = &["id", "name", "count"];

        fn primary_key(&self) -> u32 {
            self.id
        }

        fn assign_field(&mut self, src: &Self, field: usize) {
            match field {
                0 => self.id = src.id,
                1 => self.name = src.name.clone(),
                2 => self.count = src.count,
                _ => {}
            }
        }
    }

    fn item(id: u32, count: i64) -> Item {
        Item {
            id,
            name: format!("item-{id}"),
            count,
        }
    }

    struct Harness {
        _dir: TempDir,
        store: InMemoryStore<Item>,
        files: Arc<RecoveryFiles>,
        stats: Arc<FlushStats>,
        worker: FlushWorker<Item>,
    }

    fn harness(batch_size: usize) -> Harness {
        let dir = tempdir().unwrap();
        let config = ManagerConfig::new().data_dir(dir.path()).sync_files(false);
        let files = Arc::new(RecoveryFiles::open("item", 3, &config).unwrap());
        let stats = Arc::new(FlushStats::new());
        let store = InMemoryStore::new();
        let worker = FlushWorker::new(
            Arc::from("item"),
            Box::new(store.clone()),
            Arc::new(CborCodec::new()),
            Arc::clone(&files),
            Arc::clone(&stats),
            batch_size,
            Duration::from_millis(1),
        );
        Harness {
            _dir: dir,
            store,
            files,
            stats,
            worker,
        }
    }

    #[test]
    fn plan_folds_updates_and_keeps_order() {
        use Op::{Delete, Insert, Update};
        let ops = [Insert, Update, Update, Delete, Insert, Update, Insert];
        let keys = [1, 1, 2, 1, 1, 1, 3];
        assert_eq!(
            plan(&ops, &keys),
            vec![
                Step::Insert,
                Step::Fold(0),
                Step::Other,
                Step::Other,
                Step::Other,
                Step::Fold(4),
                Step::Insert,
            ]
        );
    }

    #[test]
    fn empty_stop_batch_exits() {
        let mut h = harness(100);
        assert!(h.worker.run_cycle(&mut Vec::new(), false));
        assert!(!h.worker.run_cycle(&mut Vec::new(), true));
        assert_eq!(h.stats.snapshot().idle_cycles, 1);
    }

    #[test]
    fn inserts_are_chunked() {
        let mut h = harness(100);
        let mut batch: Vec<_> = (0..250).map(|i| PendingChange::insert(item(i, 0))).collect();
        assert!(!h.worker.run_cycle(&mut batch, true));

        assert!(batch.is_empty());
        assert_eq!(h.store.len(), 250);
        assert_eq!(h.store.multi_insert_sizes(), vec![100, 100, 50]);
        assert!(h.worker.fail_queue().is_empty());
        assert!(!h.files.bomb_exists());
    }

    #[test]
    fn failed_chunk_falls_back_to_single_inserts() {
        let mut h = harness(100);
        h.store.fail_multi_insert_call(2);
        let mut batch: Vec<_> = (0..250).map(|i| PendingChange::insert(item(i, 0))).collect();
        h.worker.run_cycle(&mut batch, true);

        assert_eq!(h.store.len(), 250);
        let singles = h
            .store
            .statements()
            .iter()
            .filter(|e| matches!(e.statement, Statement::Insert { .. }))
            .count();
        assert_eq!(singles, 250);
        assert_eq!(h.stats.snapshot().insert_fallbacks, 1);
        assert!(h.worker.fail_queue().is_empty());
    }

    #[test]
    fn failing_row_moves_remainder_to_fail_queue() {
        let mut h = harness(100);
        h.store.fail_key(180);
        let mut batch: Vec<_> = (0..250).map(|i| PendingChange::insert(item(i, 0))).collect();
        h.worker.run_cycle(&mut batch, true);

        assert_eq!(h.store.len(), 180);
        let failed: Vec<u32> = h.worker.fail_queue().iter().map(|c| c.entity.id).collect();
        assert_eq!(failed, (180..250).collect::<Vec<_>>());
        assert!(h.files.bomb_exists());

        // next non-idle cycle retries the fail queue first
        h.store.clear_faults();
        let mut batch = vec![PendingChange::insert(item(900, 0))];
        h.worker.run_cycle(&mut batch, true);
        assert_eq!(h.store.len(), 251);
        assert!(h.worker.fail_queue().is_empty());
        assert!(!h.files.bomb_exists());
    }

    #[test]
    fn idle_cycle_does_not_retry() {
        let mut h = harness(100);
        h.store.fail_key(1);
        h.worker.run_cycle(&mut vec![PendingChange::insert(item(1, 0))], true);
        assert_eq!(h.worker.fail_queue().len(), 1);

        h.store.clear_faults();
        h.worker.run_cycle(&mut Vec::new(), true);
        assert_eq!(h.worker.fail_queue().len(), 1);
    }

    #[test]
    fn partial_update_writes_named_columns() {
        let mut h = harness(100);
        h.worker.run_cycle(&mut vec![PendingChange::insert(item(1, 5))], true);
        h.store.clear_statements();

        let mut changed = item(1, 9);
        changed.name = "renamed".into();
        let dirty = DirtyBitmap::for_fields(Item::FIELDS, &["count"]);
        h.worker
            .run_cycle(&mut vec![PendingChange::update(changed, dirty)], true);

        let stored = h.store.get(&1).unwrap();
        assert_eq!(stored.count, 9);
        assert_eq!(stored.name, "item-1");
        assert_eq!(
            h.store.statements()[0].statement,
            Statement::Update {
                key: 1,
                columns: Some(vec!["count".to_string()])
            }
        );
    }

    #[test]
    fn empty_bitmap_update_writes_full_row() {
        let mut h = harness(100);
        h.worker.run_cycle(&mut vec![PendingChange::insert(item(1, 5))], true);
        h.store.clear_statements();

        let change = PendingChange::update(item(1, 6), DirtyBitmap::new(3));
        h.worker.run_cycle(&mut vec![change], true);
        assert_eq!(
            h.store.statements()[0].statement,
            Statement::Update { key: 1, columns: None }
        );
        assert_eq!(h.store.get(&1).unwrap().count, 6);
    }

    #[test]
    fn set_all_update_writes_every_column() {
        let mut h = harness(100);
        h.worker.run_cycle(&mut vec![PendingChange::insert(item(1, 5))], true);
        h.store.clear_statements();

        let changed = Item {
            id: 1,
            name: "renamed".into(),
            count: 9,
        };
        let change = PendingChange::update_all(changed.clone());
        assert!(change.dirty.is_set_all());
        h.worker.run_cycle(&mut vec![change], true);

        assert_eq!(
            h.store.statements()[0].statement,
            Statement::Update { key: 1, columns: None }
        );
        assert_eq!(h.store.get(&1).unwrap(), changed);
    }

    #[test]
    fn insert_then_update_coalesces() {
        let mut h = harness(100);
        let mut dirty = DirtyBitmap::new(3);
        dirty.set(2);
        let mut batch = vec![
            PendingChange::insert(item(1, 1)),
            PendingChange::update(item(1, 2), dirty),
        ];
        h.worker.run_cycle(&mut batch, true);

        assert_eq!(h.store.get(&1).unwrap().count, 2);
        assert_eq!(h.store.multi_insert_sizes(), vec![1]);
        assert_eq!(h.stats.snapshot().rows_merged, 1);
        assert!(!h
            .store
            .statements()
            .iter()
            .any(|e| matches!(e.statement, Statement::Update { .. })));
    }

    #[test]
    fn delete_then_reinsert_keeps_order() {
        let mut h = harness(100);
        h.worker.run_cycle(&mut vec![PendingChange::insert(item(1, 1))], true);

        let mut batch = vec![
            PendingChange::delete(item(1, 1)),
            PendingChange::insert(item(1, 7)),
        ];
        h.worker.run_cycle(&mut batch, true);
        assert_eq!(h.store.get(&1).unwrap().count, 7);
        assert!(h.worker.fail_queue().is_empty());
    }

    #[test]
    fn panicking_row_is_a_failed_row() {
        let mut h = harness(100);
        h.worker.run_cycle(&mut vec![PendingChange::insert(item(1, 1))], true);
        h.store.panic_on_key(1);

        let mut batch = vec![
            PendingChange::update_all(item(1, 2)),
            PendingChange::insert(item(2, 2)),
        ];
        h.worker.run_cycle(&mut batch, true);
        // item 2 went through the insert batch before the update panicked
        assert!(h.store.contains(&2));
        assert_eq!(h.worker.fail_queue().len(), 1);
        assert!(h.files.bomb_exists());
    }

    #[test]
    fn panic_inside_transaction_rolls_back() {
        let mut h = harness(2);
        h.store.panic_on_key(3);
        let mut batch: Vec<_> = (0..4).map(|i| PendingChange::insert(item(i, 0))).collect();
        h.worker.run_cycle(&mut batch, true);

        assert!(!h.store.in_transaction());
        assert_eq!(h.stats.snapshot().panics, 1);
        assert_eq!(h.worker.fail_queue().len(), 4);
        assert!(h.store.is_empty());
    }

    #[test]
    fn stop_batch_is_processed_then_exit() {
        let mut h = harness(100);
        let exit = h
            .worker
            .run_cycle(&mut vec![PendingChange::insert(item(1, 1))], false);
        assert!(exit);
        assert!(h.store.contains(&1));
    }

    #[test]
    fn recover_replays_and_removes_bomb() {
        let mut h = harness(100);
        let codec: Box<dyn EntityCodec<Item>> = Box::new(CborCodec::new());
        let changes = vec![
            PendingChange::insert(item(1, 1)),
            PendingChange::update_all(item(1, 2)),
        ];
        h.files
            .write_bomb(&encode_fail_queue(&*codec, &changes).unwrap())
            .unwrap();

        assert_eq!(h.worker.recover().unwrap(), 2);
        assert_eq!(h.store.get(&1).unwrap().count, 2);
        assert!(!h.files.bomb_exists());
        // replay is sequential, never batched
        assert!(h.store.multi_insert_sizes().is_empty());
    }

    #[test]
    fn recover_failure_truncates_bomb() {
        let mut h = harness(100);
        let codec: Box<dyn EntityCodec<Item>> = Box::new(CborCodec::new());
        let changes: Vec<_> = (0..5).map(|i| PendingChange::insert(item(i, 0))).collect();
        h.files
            .write_bomb(&encode_fail_queue(&*codec, &changes).unwrap())
            .unwrap();

        h.store.fail_key(3);
        assert!(h.worker.recover().is_err());
        assert_eq!(h.store.len(), 3);

        let payload = h.files.read_bomb().unwrap().unwrap();
        let left = decode_fail_queue(&*codec, &payload, 3).unwrap();
        assert_eq!(left, changes[3..].to_vec());
    }

    #[test]
    fn recover_prefers_unpersisted_fail_queue() {
        let mut h = harness(100);
        let codec: Box<dyn EntityCodec<Item>> = Box::new(CborCodec::new());
        h.store.fail_key(1);
        h.worker.run_cycle(&mut vec![PendingChange::insert(item(1, 0))], true);
        assert!(h.files.bomb_exists());

        // a directory at the tmp path makes the next bomb write fail
        // before any marker is created
        std::fs::create_dir(h.files.tmp_path()).unwrap();
        h.worker.run_cycle(&mut vec![PendingChange::insert(item(2, 0))], true);
        std::fs::remove_dir(h.files.tmp_path()).unwrap();

        let ids: Vec<u32> = h.worker.fail_queue().iter().map(|c| c.entity.id).collect();
        assert_eq!(ids, vec![1, 2]);
        let payload = h.files.read_bomb().unwrap().unwrap();
        assert_eq!(decode_fail_queue(&*codec, &payload, 3).unwrap().len(), 1);

        h.store.clear_faults();
        assert_eq!(h.worker.recover().unwrap(), 2);
        assert!(h.store.contains(&1));
        assert!(h.store.contains(&2));
        assert!(h.worker.fail_queue().is_empty());
        assert!(!h.files.bomb_exists());
    }

    #[test]
    fn failed_recover_keeps_remainder_in_memory() {
        let mut h = harness(100);
        h.store.fail_key(1);
        let mut batch: Vec<_> = (0..3).map(|i| PendingChange::insert(item(i, 0))).collect();
        h.worker.run_cycle(&mut batch, true);
        assert_eq!(h.worker.fail_queue().len(), 2);

        assert!(h.worker.recover().is_err());
        let ids: Vec<u32> = h.worker.fail_queue().iter().map(|c| c.entity.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(h.files.bomb_exists());

        h.store.clear_faults();
        assert_eq!(h.worker.recover().unwrap(), 2);
        assert_eq!(h.store.len(), 3);
    }

    #[test]
    fn recover_refuses_tmp_marker() {
        let mut h = harness(100);
        std::fs::write(h.files.tmp_path(), b"torn").unwrap();
        assert!(matches!(
            h.worker.recover(),
            Err(CoreError::TempFileExists { .. })
        ));
    }
}
