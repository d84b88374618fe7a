//! In-memory reference driver.

use crate::error::{StorageError, StorageResult};
use crate::mapper::{ColumnMapper, SnakeMapper};
use crate::record::{ColumnSet, Record};
use crate::store::BackingStore;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Statement log entries kept by default; older entries are dropped.
pub const DEFAULT_LOG_LIMIT: usize = 65_536;

/// A statement issued against an [`InMemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement<K> {
    /// Transaction opened.
    Begin,
    /// Transaction committed.
    Commit,
    /// Transaction rolled back.
    Rollback,
    /// Multi-row insert of `rows` rows.
    InsertMulti {
        /// Number of rows in the statement.
        rows: usize,
    },
    /// Single-row insert.
    Insert {
        /// Primary key of the row.
        key: K,
    },
    /// Single-row update.
    Update {
        /// Primary key of the row.
        key: K,
        /// Column subset, `None` for a full-row update.
        columns: Option<Vec<String>>,
    },
    /// Single-row delete.
    Delete {
        /// Primary key of the row.
        key: K,
    },
}

/// One entry of the statement log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executed<K> {
    /// The statement.
    pub statement: Statement<K>,
    /// Whether it succeeded.
    pub ok: bool,
}

#[derive(Debug)]
struct Faults<K> {
    /// 1-based ordinals of `insert_multi` calls that fail.
    multi_calls: HashSet<usize>,
    /// Statements touching these keys fail.
    keys: HashSet<K>,
    /// Statements touching these keys panic.
    panic_keys: HashSet<K>,
    /// Whether `commit` fails.
    commit: bool,
}

impl<K> Default for Faults<K> {
    fn default() -> Self {
        Self {
            multi_calls: HashSet::new(),
            keys: HashSet::new(),
            panic_keys: HashSet::new(),
            commit: false,
        }
    }
}

struct Inner<R: Record> {
    rows: HashMap<R::Key, R>,
    /// Rows as they were when the open transaction began.
    saved: Option<HashMap<R::Key, R>>,
    log: VecDeque<Executed<R::Key>>,
    log_limit: usize,
    multi_calls: usize,
    faults: Faults<R::Key>,
}

impl<R: Record> Inner<R> {
    fn record(&mut self, statement: Statement<R::Key>, ok: bool) {
        if self.log_limit == 0 {
            return;
        }
        while self.log.len() >= self.log_limit {
            self.log.pop_front();
        }
        self.log.push_back(Executed { statement, ok });
    }

    fn check_key(&self, key: &R::Key) -> StorageResult<()> {
        if self.faults.panic_keys.contains(key) {
            panic!("injected panic for key {key:?}");
        }
        if self.faults.keys.contains(key) {
            return Err(StorageError::injected(format!("write rejected for key {key:?}")));
        }
        Ok(())
    }
}

/// A thread-safe, in-memory table that behaves like a relational session.
///
/// This driver is a test double for the write-behind engine. It keeps
/// every row in one map and copies the whole table on `begin`, so it is not
/// meant to back a real workload.
///
/// Clones share the same table, so a test can hand one clone to a manager
/// and keep another to inspect rows, the statement log, and to inject
/// faults while the manager runs.
///
/// The statement log keeps the latest [`DEFAULT_LOG_LIMIT`] entries; see
/// [`InMemoryStore::set_log_limit`].
///
/// # Transactions
///
/// `begin` snapshots the table; `rollback` restores the snapshot and
/// `commit` discards it. Single-row statements outside a transaction apply
/// immediately.
///
/// # Example
///
/// ```rust
/// use stasis_storage::{BackingStore, InMemoryStore, Record};
///
/// #[derive(Debug, Clone)]
/// struct Tag(u32);
///
/// impl Record for Tag {
///     type Key = u32;
///     const TABLE: &'static str = "tag";
///     const FIELDS: &'static [&'static str] = &["id"];
///     fn primary_key(&self) -> u32 { self.0 }
///     fn assign_field(&mut self, src: &Self, _field: usize) { self.0 = src.0; }
/// }
///
/// let mut store = InMemoryStore::new();
/// store.begin().unwrap();
/// store.insert_multi(&[&Tag(1), &Tag(2)]).unwrap();
/// store.rollback().unwrap();
/// assert!(store.is_empty());
/// ```
pub struct InMemoryStore<R: Record> {
    inner: Arc<Mutex<Inner<R>>>,
    mapper: Arc<dyn ColumnMapper>,
}

impl<R: Record> InMemoryStore<R> {
    /// Creates an empty store using the snake-case column convention.
    #[must_use]
    pub fn new() -> Self {
        Self::with_mapper(SnakeMapper)
    }

    /// Creates an empty store using the given column convention.
    #[must_use]
    pub fn with_mapper(mapper: impl ColumnMapper + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                rows: HashMap::new(),
                saved: None,
                log: VecDeque::new(),
                log_limit: DEFAULT_LOG_LIMIT,
                multi_calls: 0,
                faults: Faults::default(),
            })),
            mapper: Arc::new(mapper),
        }
    }

    /// Creates a store pre-populated with rows.
    ///
    /// Useful for tests that start from existing data.
    #[must_use]
    pub fn with_rows(rows: impl IntoIterator<Item = R>) -> Self {
        let store = Self::new();
        {
            let mut inner = store.inner.lock();
            for row in rows {
                inner.rows.insert(row.primary_key(), row);
            }
        }
        store
    }

    /// Returns a copy of the row with the given key.
    #[must_use]
    pub fn get(&self, key: &R::Key) -> Option<R> {
        self.inner.lock().rows.get(key).cloned()
    }

    /// Returns true if a row with the given key exists.
    #[must_use]
    pub fn contains(&self, key: &R::Key) -> bool {
        self.inner.lock().rows.contains_key(key)
    }

    /// Returns the number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().rows.len()
    }

    /// Returns true if the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a copy of every row, in no particular order.
    #[must_use]
    pub fn rows(&self) -> Vec<R> {
        self.inner.lock().rows.values().cloned().collect()
    }

    /// Returns true if a transaction is open.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.inner.lock().saved.is_some()
    }

    /// Returns a copy of the statement log, oldest first.
    #[must_use]
    pub fn statements(&self) -> Vec<Executed<R::Key>> {
        self.inner.lock().log.iter().cloned().collect()
    }

    /// Returns the row counts of every successful multi-row insert.
    #[must_use]
    pub fn multi_insert_sizes(&self) -> Vec<usize> {
        self.inner
            .lock()
            .log
            .iter()
            .filter_map(|e| match e.statement {
                Statement::InsertMulti { rows } if e.ok => Some(rows),
                _ => None,
            })
            .collect()
    }

    /// Clears the statement log.
    pub fn clear_statements(&self) {
        self.inner.lock().log.clear();
    }

    /// Keeps at most `limit` log entries, dropping the oldest first.
    ///
    /// A limit of zero turns the log off.
    pub fn set_log_limit(&self, limit: usize) {
        let mut inner = self.inner.lock();
        inner.log_limit = limit;
        while inner.log.len() > limit {
            inner.log.pop_front();
        }
    }

    /// Makes the `nth` call (1-based, counted over the store's lifetime)
    /// to `insert_multi` fail.
    pub fn fail_multi_insert_call(&self, nth: usize) {
        self.inner.lock().faults.multi_calls.insert(nth);
    }

    /// Makes every statement touching `key` fail until cleared.
    pub fn fail_key(&self, key: R::Key) {
        self.inner.lock().faults.keys.insert(key);
    }

    /// Makes every statement touching `key` panic until cleared.
    pub fn panic_on_key(&self, key: R::Key) {
        self.inner.lock().faults.panic_keys.insert(key);
    }

    /// Sets whether `commit` fails.
    pub fn fail_commit(&self, fail: bool) {
        self.inner.lock().faults.commit = fail;
    }

    /// Removes every injected fault.
    pub fn clear_faults(&self) {
        self.inner.lock().faults = Faults::default();
    }

    fn resolve_columns(&self, columns: &[String]) -> StorageResult<Vec<usize>> {
        let mut indices = Vec::with_capacity(columns.len());
        for column in columns {
            let index = R::FIELDS
                .iter()
                .position(|field| self.mapper.column_name(field) == *column)
                .ok_or_else(|| {
                    StorageError::backend(format!("unknown column `{column}` in {}", R::TABLE))
                })?;
            indices.push(index);
        }
        Ok(indices)
    }
}

impl<R: Record> Default for InMemoryStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Record> Clone for InMemoryStore<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            mapper: Arc::clone(&self.mapper),
        }
    }
}

impl<R: Record> std::fmt::Debug for InMemoryStore<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("InMemoryStore")
            .field("table", &R::TABLE)
            .field("rows", &inner.rows.len())
            .field("in_transaction", &inner.saved.is_some())
            .finish_non_exhaustive()
    }
}

impl<R: Record> BackingStore<R> for InMemoryStore<R> {
    fn begin(&mut self) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if inner.saved.is_some() {
            inner.record(Statement::Begin, false);
            return Err(StorageError::TransactionActive);
        }
        inner.saved = Some(inner.rows.clone());
        inner.record(Statement::Begin, true);
        Ok(())
    }

    fn commit(&mut self) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        let Some(saved) = inner.saved.take() else {
            inner.record(Statement::Commit, false);
            return Err(StorageError::NoTransaction);
        };
        if inner.faults.commit {
            inner.rows = saved;
            inner.record(Statement::Commit, false);
            return Err(StorageError::injected("commit rejected"));
        }
        inner.record(Statement::Commit, true);
        Ok(())
    }

    fn rollback(&mut self) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        let Some(saved) = inner.saved.take() else {
            inner.record(Statement::Rollback, false);
            return Err(StorageError::NoTransaction);
        };
        inner.rows = saved;
        inner.record(Statement::Rollback, true);
        Ok(())
    }

    fn insert_multi(&mut self, rows: &[&R]) -> StorageResult<u64> {
        let mut inner = self.inner.lock();
        inner.multi_calls += 1;
        let statement = Statement::InsertMulti { rows: rows.len() };

        if inner.faults.multi_calls.contains(&inner.multi_calls) {
            inner.record(statement, false);
            return Err(StorageError::injected(format!(
                "multi insert call {} rejected",
                inner.multi_calls
            )));
        }

        let mut seen = HashSet::with_capacity(rows.len());
        for row in rows {
            let key = row.primary_key();
            if let Err(e) = inner.check_key(&key) {
                inner.record(statement, false);
                return Err(e);
            }
            if inner.rows.contains_key(&key) || !seen.insert(key.clone()) {
                inner.record(statement, false);
                return Err(StorageError::DuplicateKey(format!("{key:?}")));
            }
        }

        for row in rows {
            inner.rows.insert(row.primary_key(), (*row).clone());
        }
        inner.record(statement, true);
        Ok(rows.len() as u64)
    }

    fn insert(&mut self, row: &R) -> StorageResult<u64> {
        let mut inner = self.inner.lock();
        let key = row.primary_key();
        let statement = Statement::Insert { key: key.clone() };

        if let Err(e) = inner.check_key(&key) {
            inner.record(statement, false);
            return Err(e);
        }
        if inner.rows.contains_key(&key) {
            inner.record(statement, false);
            return Err(StorageError::DuplicateKey(format!("{key:?}")));
        }

        inner.rows.insert(key, row.clone());
        inner.record(statement, true);
        Ok(1)
    }

    fn update(&mut self, key: &R::Key, row: &R, columns: ColumnSet<'_>) -> StorageResult<u64> {
        let fields = match columns {
            ColumnSet::All => None,
            ColumnSet::Only(names) => Some(self.resolve_columns(names)),
        };

        let mut inner = self.inner.lock();
        let statement = Statement::Update {
            key: key.clone(),
            columns: match columns {
                ColumnSet::All => None,
                ColumnSet::Only(names) => Some(names.to_vec()),
            },
        };

        let fields = match fields.transpose() {
            Ok(fields) => fields,
            Err(e) => {
                inner.record(statement, false);
                return Err(e);
            }
        };
        if let Err(e) = inner.check_key(key) {
            inner.record(statement, false);
            return Err(e);
        }

        let affected = match inner.rows.get_mut(key) {
            None => 0,
            Some(stored) => {
                match fields {
                    None => *stored = row.clone(),
                    Some(indices) => {
                        for index in indices {
                            stored.assign_field(row, index);
                        }
                    }
                }
                1
            }
        };
        inner.record(statement, true);
        Ok(affected)
    }

    fn delete(&mut self, key: &R::Key) -> StorageResult<u64> {
        let mut inner = self.inner.lock();
        let statement = Statement::Delete { key: key.clone() };

        if let Err(e) = inner.check_key(key) {
            inner.record(statement, false);
            return Err(e);
        }

        let affected = u64::from(inner.rows.remove(key).is_some());
        inner.record(statement, true);
        Ok(affected)
    }

    fn column_mapper(&self) -> &dyn ColumnMapper {
        &*self.mapper
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: u32,
        name: String,
        qty: i64,
    }

    impl Record for Item {
        type Key = u32;
        const TABLE: &'static str = "item";
        const FIELDS: &'static [&'static str] = &["id", "name", "qty"];

        fn primary_key(&self) -> u32 {
            self.id
        }

        fn assign_field(&mut self, src: &Self, field: usize) {
            match field {
                0 => self.id = src.id,
                1 => self.name = src.name.clone(),
                2 => self.qty = src.qty,
                _ => {}
            }
        }
    }

    fn item(id: u32, name: &str, qty: i64) -> Item {
        Item {
            id,
            name: name.to_string(),
            qty,
        }
    }

    #[test]
    fn memory_new_is_empty() {
        let store = InMemoryStore::<Item>::new();
        assert!(store.is_empty());
        assert!(store.statements().is_empty());
    }

    #[test]
    fn memory_insert_and_get() {
        let mut store = InMemoryStore::new();
        assert_eq!(store.insert(&item(1, "a", 3)).unwrap(), 1);
        assert_eq!(store.get(&1), Some(item(1, "a", 3)));
    }

    #[test]
    fn memory_duplicate_insert_fails() {
        let mut store = InMemoryStore::new();
        store.insert(&item(1, "a", 3)).unwrap();
        let result = store.insert(&item(1, "b", 4));
        assert!(matches!(result, Err(StorageError::DuplicateKey(_))));
        assert_eq!(store.get(&1).unwrap().name, "a");
    }

    #[test]
    fn memory_multi_insert_is_all_or_nothing() {
        let mut store = InMemoryStore::new();
        store.insert(&item(2, "b", 0)).unwrap();

        let rows = [item(1, "a", 0), item(2, "dup", 0), item(3, "c", 0)];
        let refs: Vec<&Item> = rows.iter().collect();
        assert!(store.insert_multi(&refs).is_err());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn memory_partial_update_touches_only_named_columns() {
        let mut store = InMemoryStore::with_rows([item(1, "old", 1)]);
        let columns = vec!["qty".to_string()];
        let affected = store
            .update(&1, &item(1, "new", 9), ColumnSet::Only(&columns))
            .unwrap();
        assert_eq!(affected, 1);
        assert_eq!(store.get(&1), Some(item(1, "old", 9)));
    }

    #[test]
    fn memory_full_update_replaces_row() {
        let mut store = InMemoryStore::with_rows([item(1, "old", 1)]);
        store.update(&1, &item(1, "new", 9), ColumnSet::All).unwrap();
        assert_eq!(store.get(&1), Some(item(1, "new", 9)));
    }

    #[test]
    fn memory_update_unknown_column_fails() {
        let mut store = InMemoryStore::with_rows([item(1, "old", 1)]);
        let columns = vec!["colour".to_string()];
        let result = store.update(&1, &item(1, "new", 9), ColumnSet::Only(&columns));
        assert!(matches!(result, Err(StorageError::Backend(_))));
    }

    #[test]
    fn memory_update_missing_row_affects_nothing() {
        let mut store = InMemoryStore::<Item>::new();
        let affected = store.update(&7, &item(7, "x", 0), ColumnSet::All).unwrap();
        assert_eq!(affected, 0);
        assert!(store.is_empty());
    }

    #[test]
    fn memory_delete() {
        let mut store = InMemoryStore::with_rows([item(1, "a", 1)]);
        assert_eq!(store.delete(&1).unwrap(), 1);
        assert_eq!(store.delete(&1).unwrap(), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn memory_rollback_restores_rows() {
        let mut store = InMemoryStore::with_rows([item(1, "a", 1)]);
        store.begin().unwrap();
        store.insert_multi(&[&item(2, "b", 2)]).unwrap();
        store.delete(&1).unwrap();
        store.rollback().unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.contains(&1));
        assert!(!store.in_transaction());
    }

    #[test]
    fn memory_commit_keeps_rows() {
        let mut store = InMemoryStore::new();
        store.begin().unwrap();
        store.insert_multi(&[&item(1, "a", 1), &item(2, "b", 2)]).unwrap();
        store.commit().unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.multi_insert_sizes(), vec![2]);
    }

    #[test]
    fn memory_nested_begin_fails() {
        let mut store = InMemoryStore::<Item>::new();
        store.begin().unwrap();
        assert!(matches!(store.begin(), Err(StorageError::TransactionActive)));
    }

    #[test]
    fn memory_commit_without_begin_fails() {
        let mut store = InMemoryStore::<Item>::new();
        assert!(matches!(store.commit(), Err(StorageError::NoTransaction)));
        assert!(matches!(store.rollback(), Err(StorageError::NoTransaction)));
    }

    #[test]
    fn memory_failed_commit_discards_transaction() {
        let mut store = InMemoryStore::new();
        store.fail_commit(true);
        store.begin().unwrap();
        store.insert_multi(&[&item(1, "a", 1)]).unwrap();
        assert!(store.commit().is_err());
        assert!(store.is_empty());
        assert!(!store.in_transaction());
    }

    #[test]
    fn memory_injected_multi_call_failure() {
        let mut store = InMemoryStore::new();
        store.fail_multi_insert_call(2);
        assert!(store.insert_multi(&[&item(1, "a", 1)]).is_ok());
        assert!(store.insert_multi(&[&item(2, "b", 1)]).is_err());
        assert!(store.insert_multi(&[&item(3, "c", 1)]).is_ok());
        assert_eq!(store.multi_insert_sizes(), vec![1, 1]);
    }

    #[test]
    fn memory_injected_key_failure() {
        let mut store = InMemoryStore::new();
        store.fail_key(5);
        assert!(matches!(
            store.insert(&item(5, "x", 0)),
            Err(StorageError::Injected(_))
        ));
        store.clear_faults();
        assert!(store.insert(&item(5, "x", 0)).is_ok());
    }

    #[test]
    fn memory_clones_share_table() {
        let mut writer = InMemoryStore::new();
        let reader = writer.clone();
        writer.insert(&item(1, "a", 1)).unwrap();
        assert!(reader.contains(&1));
    }

    #[test]
    fn memory_logs_failed_statements() {
        let mut store = InMemoryStore::<Item>::new();
        store.fail_key(1);
        let _ = store.delete(&1);
        let log = store.statements();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].statement, Statement::Delete { key: 1 });
        assert!(!log[0].ok);
    }

    #[test]
    fn memory_log_keeps_latest_entries() {
        let mut store = InMemoryStore::new();
        store.set_log_limit(2);
        for id in 1..=3 {
            store.insert(&item(id, "a", 0)).unwrap();
        }
        let keys: Vec<_> = store
            .statements()
            .into_iter()
            .map(|e| e.statement)
            .collect();
        assert_eq!(
            keys,
            vec![Statement::Insert { key: 2 }, Statement::Insert { key: 3 }]
        );

        store.set_log_limit(0);
        store.delete(&1).unwrap();
        assert!(store.statements().is_empty());
        assert_eq!(store.len(), 2);
    }
}
