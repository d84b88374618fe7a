//! Per-entity dirty-field tracking.
//!
//! One bit per declared field, in declaration order. Setting every word to
//! `u64::MAX` is the "full row" sentinel: [`DirtyBitmap::is_set_all`] checks
//! for it directly instead of counting bits, and an update carrying it is
//! written with every column.

use std::fmt;

/// Fixed-size bit vector marking changed fields.
///
/// The word count is `ceil(field_count / 64)` and never changes after
/// construction. Indices at or past `field_count` are ignored by every
/// mutator, so padding bits are only ever set by [`DirtyBitmap::set_all`].
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DirtyBitmap {
    words: Vec<u64>,
    field_count: usize,
}

impl DirtyBitmap {
    /// Number of 64-bit words needed for `field_count` fields.
    #[must_use]
    pub const fn words_for(field_count: usize) -> usize {
        field_count.div_ceil(64)
    }

    /// Creates a bitmap with no bits set.
    #[must_use]
    pub fn new(field_count: usize) -> Self {
        Self {
            words: vec![0; Self::words_for(field_count)],
            field_count,
        }
    }

    /// Creates a bitmap carrying the full-row sentinel.
    #[must_use]
    pub fn all(field_count: usize) -> Self {
        let mut bitmap = Self::new(field_count);
        bitmap.set_all();
        bitmap
    }

    /// Creates a bitmap for the declared `fields` with `dirty` marked.
    ///
    /// Names not in `fields` are ignored.
    #[must_use]
    pub fn for_fields(fields: &[&str], dirty: &[&str]) -> Self {
        let mut bitmap = Self::new(fields.len());
        for name in dirty {
            if let Some(index) = fields.iter().position(|f| f == name) {
                bitmap.set(index);
            }
        }
        bitmap
    }

    /// Rebuilds a bitmap from its raw words.
    ///
    /// Returns `None` if `words` has the wrong length for `field_count`.
    #[must_use]
    pub fn from_words(field_count: usize, words: Vec<u64>) -> Option<Self> {
        (words.len() == Self::words_for(field_count)).then_some(Self { words, field_count })
    }

    /// Returns the number of fields tracked.
    #[must_use]
    pub fn field_count(&self) -> usize {
        self.field_count
    }

    /// Returns the raw words, least significant field first.
    #[must_use]
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Marks field `index` dirty. No-op past `field_count`.
    pub fn set(&mut self, index: usize) {
        if index < self.field_count {
            self.words[index / 64] |= 1 << (index % 64);
        }
    }

    /// Returns true if field `index` is dirty.
    #[must_use]
    pub fn get(&self, index: usize) -> bool {
        index < self.field_count && self.words[index / 64] & (1 << (index % 64)) != 0
    }

    /// Marks field `index` clean. No-op past `field_count`.
    pub fn clear(&mut self, index: usize) {
        if index < self.field_count {
            self.words[index / 64] &= !(1 << (index % 64));
        }
    }

    /// Sets the full-row sentinel.
    pub fn set_all(&mut self) {
        self.words.fill(u64::MAX);
    }

    /// Returns true if the full-row sentinel is set.
    #[must_use]
    pub fn is_set_all(&self) -> bool {
        self.words.iter().all(|&w| w == u64::MAX)
    }

    /// Marks every field clean.
    pub fn clear_all(&mut self) {
        self.words.fill(0);
    }

    /// Returns true if no field is dirty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// ORs `other` into `self`.
    ///
    /// Words beyond the shorter bitmap are left untouched.
    pub fn merge(&mut self, other: &Self) {
        for (word, theirs) in self.words.iter_mut().zip(&other.words) {
            *word |= theirs;
        }
    }

    /// Iterates over dirty field indices in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.field_count).filter(move |&i| self.get(i))
    }

    /// Returns the dirty field indices.
    #[must_use]
    pub fn set_indices(&self) -> Vec<usize> {
        self.iter_set().collect()
    }
}

impl fmt::Debug for DirtyBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_set_all() {
            return write!(f, "DirtyBitmap(all of {})", self.field_count);
        }
        f.debug_tuple("DirtyBitmap")
            .field(&self.set_indices())
            .finish()
    }
}
