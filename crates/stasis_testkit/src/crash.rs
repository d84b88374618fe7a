//! Crash and shutdown scenarios for the write-behind engine.
//!
//! Each scenario drives a [`TestManager`] through a failure path and
//! reports what ended up in the backing store and the bomb file.
//!
//! ## Scenarios
//!
//! 1. **Bulk insert** - one large insert batch, optionally with a rejected
//!    multi-row statement or a poisoned row
//! 2. **Shutdown drain** - changes queued before and during shutdown
//! 3. **Bomb replay** - restart against a failing store, twice
//! 4. **Tmp marker** - a bomb write interrupted mid-way
//! 5. **Panicking store** - a driver that panics inside a transaction
//!
//! ## Usage
//!
//! ```rust,ignore
//! use stasis_testkit::crash::{bulk_insert_scenario, BulkInsertFault};
//!
//! let report = bulk_insert_scenario(250, 100, BulkInsertFault::MultiInsertCall(2));
//! assert_eq!(report.single_inserts, 250);
//! ```

use crate::fixtures::{player, Player, TestManager};
use stasis_core::{decode_fail_queue, CborCodec, CoreError, EntityCodec, PendingChange};
use stasis_storage::{Record, Statement};
use std::fs;
use std::thread;
use std::time::Duration;

/// Fault injected into a bulk insert scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkInsertFault {
    /// Nothing fails.
    None,
    /// The nth multi-row insert call (1-based) is rejected.
    MultiInsertCall(usize),
    /// Every statement touching this player id fails.
    Row(u64),
}

/// Outcome of [`bulk_insert_scenario`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkInsertReport {
    /// Row counts of the successful multi-row insert statements.
    pub multi_insert_sizes: Vec<usize>,
    /// Number of single-row insert statements issued.
    pub single_inserts: usize,
    /// Rows in the store after shutdown.
    pub stored: usize,
    /// Player ids left in the bomb file, in order.
    pub bomb_ids: Vec<u64>,
}

/// Reads the player ids recorded in the manager's bomb file.
pub fn bomb_ids(test: &TestManager) -> Vec<u64> {
    bomb_changes(test)
        .into_iter()
        .map(|change| change.entity.id)
        .collect()
}

/// Reads the changes recorded in the manager's bomb file.
pub fn bomb_changes(test: &TestManager) -> Vec<PendingChange<Player>> {
    let Some(payload) = test
        .recovery_files()
        .read_bomb()
        .expect("Failed to read bomb file")
    else {
        return Vec::new();
    };
    let codec: Box<dyn EntityCodec<Player>> = Box::new(CborCodec::new());
    decode_fail_queue(&*codec, &payload, Player::field_count()).expect("Failed to decode bomb")
}

/// Inserts `rows` players in a single flush cycle and shuts down.
///
/// The first cycle after start idles for a while; all rows are queued
/// during that sleep so the next swap carries every one of them.
pub fn bulk_insert_scenario(
    rows: u64,
    batch_size: usize,
    fault: BulkInsertFault,
) -> BulkInsertReport {
    let test = TestManager::with_config(|config| {
        config
            .batch_size(batch_size)
            .idle_interval(Duration::from_millis(300))
    });
    match fault {
        BulkInsertFault::None => {}
        BulkInsertFault::MultiInsertCall(nth) => test.store.fail_multi_insert_call(nth),
        BulkInsertFault::Row(id) => test.store.fail_key(id),
    }

    test.start().expect("Failed to start manager");
    let idling = test.wait_for(Duration::from_secs(5), |t| {
        t.stats().snapshot().idle_cycles >= 1
    });
    assert!(idling, "manager never idled");
    // the next cycle is now asleep with an empty batch
    thread::sleep(Duration::from_millis(30));

    for id in 0..rows {
        test.insert(player(id)).expect("Failed to queue insert");
    }
    test.stop().expect("Failed to stop manager");

    let single_inserts = test
        .store
        .statements()
        .iter()
        .filter(|e| matches!(e.statement, Statement::Insert { .. }))
        .count();
    BulkInsertReport {
        multi_insert_sizes: test.store.multi_insert_sizes(),
        single_inserts,
        stored: test.store.len(),
        bomb_ids: bomb_ids(&test),
    }
}

/// Queues `before` inserts, requests shutdown, and queues `during` more
/// while the drain runs. Returns the manager after shutdown and the number
/// of inserts the manager accepted; inserts that arrive after the queue
/// closed are rejected.
///
/// Every drain includes at least one idle cycle, so the queue stays open
/// for an idle interval after the exit request.
pub fn shutdown_drain_scenario(before: u64, during: u64) -> (TestManager, usize) {
    let test = TestManager::with_config(|config| config.idle_interval(Duration::from_millis(200)));
    test.start().expect("Failed to start manager");
    for id in 0..before {
        test.insert(player(id)).expect("Failed to queue insert");
    }

    let mut accepted = before as usize;
    thread::scope(|scope| {
        let stopper = scope.spawn(|| test.stop());
        thread::sleep(Duration::from_millis(10));
        for id in before..before + during {
            if test.insert(player(id)).is_ok() {
                accepted += 1;
            }
        }
        stopper
            .join()
            .expect("Stop thread panicked")
            .expect("Failed to stop manager");
    });
    (test, accepted)
}

/// Outcome of [`bomb_replay_scenario`].
#[derive(Debug)]
pub struct ReplayReport {
    /// Bomb contents before any restart.
    pub original: Vec<u8>,
    /// Bomb contents after the first failed restart.
    pub after_first: Vec<u8>,
    /// Bomb contents after the second failed restart.
    pub after_second: Vec<u8>,
    /// Error of the first restart.
    pub first_error: CoreError,
    /// Player ids in the store after both restarts.
    pub stored_ids: Vec<u64>,
    /// The manager, still holding the bomb.
    pub test: TestManager,
}

/// Leaves `rows` inserts in a bomb file, then restarts twice against a
/// store that rejects player `poison`.
pub fn bomb_replay_scenario(rows: u64, poison: u64) -> ReplayReport {
    let test = TestManager::new();
    let codec: Box<dyn EntityCodec<Player>> = Box::new(CborCodec::new());
    let changes: Vec<_> = (0..rows).map(|id| PendingChange::insert(player(id))).collect();
    let payload =
        stasis_core::encode_fail_queue(&*codec, &changes).expect("Failed to encode fail queue");
    test.recovery_files()
        .write_bomb(&payload)
        .expect("Failed to write bomb");
    let original = fs::read(test.recovery_files().bomb_path()).expect("Failed to read bomb");

    test.store.fail_key(poison);
    let first_error = test.start().expect_err("Replay should fail");
    let after_first = fs::read(test.recovery_files().bomb_path()).expect("Failed to read bomb");

    let test = test.reopen();
    let _ = test.start().expect_err("Replay should fail again");
    let after_second = fs::read(test.recovery_files().bomb_path()).expect("Failed to read bomb");

    let mut stored_ids: Vec<u64> = test.store.rows().iter().map(|p| p.id).collect();
    stored_ids.sort_unstable();
    ReplayReport {
        original,
        after_first,
        after_second,
        first_error,
        stored_ids,
        test,
    }
}

/// Leaves a tmp marker behind, as an interrupted bomb write would.
pub fn interrupted_bomb_write(test: &TestManager) {
    fs::write(test.recovery_files().tmp_path(), b"STASIS1:player:5:0000")
        .expect("Failed to write tmp marker");
}

/// Removes the tmp marker, as an operator would after inspecting it.
pub fn discard_tmp(test: &TestManager) {
    fs::remove_file(test.recovery_files().tmp_path()).expect("Failed to remove tmp marker");
}
