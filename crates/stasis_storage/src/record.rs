//! Record contract shared by drivers and the write-behind engine.

use std::fmt;
use std::hash::Hash;

/// A domain record persisted as one row of one table.
///
/// The field list is fixed and ordered: index `i` in [`Record::FIELDS`] is
/// the same index the engine uses for dirty-field tracking, so it must
/// never be reordered once data has been written with it.
///
/// # Invariants
///
/// - `primary_key` is stable for the lifetime of the record
/// - `FIELDS` lists every persisted field exactly once, in declaration order
/// - `assign_field(src, i)` copies only field `i`
pub trait Record: Clone + Send + Sync + 'static {
    /// Primary key type (single column).
    type Key: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    /// Table name, also used as the manager's persist name.
    const TABLE: &'static str;

    /// Field names in declaration order.
    const FIELDS: &'static [&'static str];

    /// Returns the record's primary key.
    fn primary_key(&self) -> Self::Key;

    /// Copies field `field` (declaration index) from `src` into `self`.
    ///
    /// Drivers that apply column subsets in place use this. Out-of-range
    /// indices must be ignored.
    fn assign_field(&mut self, src: &Self, field: usize);

    /// Returns the number of declared fields.
    #[must_use]
    fn field_count() -> usize {
        Self::FIELDS.len()
    }
}

/// Columns written by an update statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnSet<'a> {
    /// Every column of the row.
    All,
    /// Only the named columns.
    Only(&'a [String]),
}

impl ColumnSet<'_> {
    /// Returns true if this set writes every column.
    #[must_use]
    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }
}
