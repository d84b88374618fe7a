//! Flush statistics.
//!
//! Counters are atomic and can be read while the background threads run.
//! Values only grow, except `last_cycle` which is a gauge.
//!
//! # Usage
//!
//! ```rust,ignore
//! let stats = manager.stats().snapshot();
//! println!("rows applied: {}", stats.rows_applied);
//! println!("in fail queue: {}", stats.rows_failed);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters of one manager's flush engine.
#[derive(Debug, Default)]
pub struct FlushStats {
    // Cycle counters
    /// Flush cycles that had work.
    cycles: AtomicU64,
    /// Flush cycles that found nothing to do.
    idle_cycles: AtomicU64,
    /// Duration of the last cycle, in microseconds.
    last_cycle_micros: AtomicU64,

    // Row counters
    /// Rows written to the backing store.
    rows_applied: AtomicU64,
    /// Rows moved into the fail queue.
    rows_failed: AtomicU64,
    /// Changes folded into an earlier change of the same key.
    rows_merged: AtomicU64,
    /// Rows replayed from a bomb file at startup.
    rows_recovered: AtomicU64,

    // Insert batching
    /// Multi-row insert statements that succeeded.
    multi_inserts: AtomicU64,
    /// Insert batches that fell back to single-row inserts.
    insert_fallbacks: AtomicU64,

    // Recovery files
    /// Bomb file writes.
    bomb_writes: AtomicU64,
    /// Bomb file removals.
    bomb_removals: AtomicU64,

    // Faults
    /// Panics caught inside a cycle.
    panics: AtomicU64,
}

impl FlushStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_cycle(&self, elapsed: Duration) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.set_last_cycle(elapsed);
    }

    pub(crate) fn record_idle_cycle(&self, elapsed: Duration) {
        self.idle_cycles.fetch_add(1, Ordering::Relaxed);
        self.set_last_cycle(elapsed);
    }

    fn set_last_cycle(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.last_cycle_micros.store(micros, Ordering::Relaxed);
    }

    pub(crate) fn record_applied(&self, rows: u64) {
        self.rows_applied.fetch_add(rows, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self, rows: u64) {
        self.rows_failed.fetch_add(rows, Ordering::Relaxed);
    }

    pub(crate) fn record_merged(&self, rows: u64) {
        self.rows_merged.fetch_add(rows, Ordering::Relaxed);
    }

    pub(crate) fn record_recovered(&self, rows: u64) {
        self.rows_recovered.fetch_add(rows, Ordering::Relaxed);
    }

    pub(crate) fn record_multi_insert(&self) {
        self.multi_inserts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_insert_fallback(&self) {
        self.insert_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_bomb_write(&self) {
        self.bomb_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_bomb_removal(&self) {
        self.bomb_removals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_panic(&self) {
        self.panics.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the duration of the last cycle.
    pub fn last_cycle(&self) -> Duration {
        Duration::from_micros(self.last_cycle_micros.load(Ordering::Relaxed))
    }

    /// Returns a point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            idle_cycles: self.idle_cycles.load(Ordering::Relaxed),
            last_cycle: self.last_cycle(),
            rows_applied: self.rows_applied.load(Ordering::Relaxed),
            rows_failed: self.rows_failed.load(Ordering::Relaxed),
            rows_merged: self.rows_merged.load(Ordering::Relaxed),
            rows_recovered: self.rows_recovered.load(Ordering::Relaxed),
            multi_inserts: self.multi_inserts.load(Ordering::Relaxed),
            insert_fallbacks: self.insert_fallbacks.load(Ordering::Relaxed),
            bomb_writes: self.bomb_writes.load(Ordering::Relaxed),
            bomb_removals: self.bomb_removals.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`FlushStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Flush cycles that had work.
    pub cycles: u64,
    /// Flush cycles that found nothing to do.
    pub idle_cycles: u64,
    /// Duration of the last cycle.
    pub last_cycle: Duration,
    /// Rows written to the backing store.
    pub rows_applied: u64,
    /// Rows moved into the fail queue.
    pub rows_failed: u64,
    /// Changes folded into an earlier change of the same key.
    pub rows_merged: u64,
    /// Rows replayed from a bomb file.
    pub rows_recovered: u64,
    /// Multi-row insert statements that succeeded.
    pub multi_inserts: u64,
    /// Insert batches that fell back to single-row inserts.
    pub insert_fallbacks: u64,
    /// Bomb file writes.
    pub bomb_writes: u64,
    /// Bomb file removals.
    pub bomb_removals: u64,
    /// Panics caught inside a cycle.
    pub panics: u64,
}
