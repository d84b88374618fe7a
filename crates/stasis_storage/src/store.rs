//! Backing-store driver trait definition.

use crate::error::StorageResult;
use crate::mapper::{ColumnMapper, SnakeMapper};
use crate::record::{ColumnSet, Record};

/// A session against the relational store that mirrors one record type.
///
/// The write-behind engine owns its store exclusively and drives it from a
/// single background thread, so methods take `&mut self`. Single-row
/// statements issued while a transaction is open join that transaction;
/// outside a transaction they commit on their own.
///
/// Every method is fallible. The engine retries at row granularity, so a
/// driver should fail the one statement that went wrong rather than poison
/// the whole session.
///
/// # Implementors
///
/// - [`super::InMemoryStore`] - Reference driver for tests
pub trait BackingStore<R: Record>: Send {
    /// Opens a transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if a transaction is already open or the driver fails.
    fn begin(&mut self) -> StorageResult<()>;

    /// Commits the open transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if no transaction is open or the commit fails. A
    /// failed commit leaves nothing of the transaction applied.
    fn commit(&mut self) -> StorageResult<()>;

    /// Rolls back the open transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if no transaction is open.
    fn rollback(&mut self) -> StorageResult<()>;

    /// Inserts several rows with one statement.
    ///
    /// Returns the number of rows inserted.
    ///
    /// # Errors
    ///
    /// Returns an error if any row is rejected; no row of the statement is
    /// applied in that case.
    fn insert_multi(&mut self, rows: &[&R]) -> StorageResult<u64>;

    /// Inserts one row.
    ///
    /// # Errors
    ///
    /// Returns an error if the row is rejected (e.g. duplicate key).
    fn insert(&mut self, row: &R) -> StorageResult<u64>;

    /// Updates the row identified by `key` with values taken from `row`.
    ///
    /// Returns the number of rows affected (0 if the key does not exist).
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    fn update(&mut self, key: &R::Key, row: &R, columns: ColumnSet<'_>) -> StorageResult<u64>;

    /// Deletes the row identified by `key`.
    ///
    /// Returns the number of rows affected (0 if the key does not exist).
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    fn delete(&mut self, key: &R::Key) -> StorageResult<u64>;

    /// Returns the naming convention used to turn field names into columns.
    fn column_mapper(&self) -> &dyn ColumnMapper {
        &SnakeMapper
    }
}

impl<R: Record, S: BackingStore<R> + ?Sized> BackingStore<R> for Box<S> {
    fn begin(&mut self) -> StorageResult<()> {
        (**self).begin()
    }

    fn commit(&mut self) -> StorageResult<()> {
        (**self).commit()
    }

    fn rollback(&mut self) -> StorageResult<()> {
        (**self).rollback()
    }

    fn insert_multi(&mut self, rows: &[&R]) -> StorageResult<u64> {
        (**self).insert_multi(rows)
    }

    fn insert(&mut self, row: &R) -> StorageResult<u64> {
        (**self).insert(row)
    }

    fn update(&mut self, key: &R::Key, row: &R, columns: ColumnSet<'_>) -> StorageResult<u64> {
        (**self).update(key, row, columns)
    }

    fn delete(&mut self, key: &R::Key) -> StorageResult<u64> {
        (**self).delete(key)
    }

    fn column_mapper(&self) -> &dyn ColumnMapper {
        (**self).column_mapper()
    }
}
