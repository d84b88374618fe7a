//! Property-based test generators using proptest.
//!
//! Provides strategies for players, dirty bitmaps, pending changes and
//! operation sequences against the cache and the manager.

use crate::fixtures::Player;
use proptest::prelude::*;
use stasis_core::{DirtyBitmap, Op, PendingChange};
use stasis_storage::Record;

/// Strategy for generating players with ids below `max_id`.
pub fn player_strategy(max_id: u64) -> impl Strategy<Value = Player> {
    (
        0..max_id,
        prop::string::string_regex("[a-zA-Z][a-zA-Z0-9 ]{0,15}").expect("Invalid regex"),
        1..100u32,
        any::<i64>(),
        prop::option::of(prop::string::string_regex("[a-z]{1,8}").expect("Invalid regex")),
    )
        .prop_map(|(id, name, level, gold, guild_name)| Player {
            id,
            name,
            level,
            gold,
            guild_name,
        })
}

/// Strategy for generating bitmaps over `field_count` fields, including the
/// full-row sentinel.
pub fn dirty_strategy(field_count: usize) -> impl Strategy<Value = DirtyBitmap> {
    prop_oneof![
        1 => Just(DirtyBitmap::all(field_count)),
        4 => prop::collection::vec(any::<bool>(), field_count).prop_map(move |bits| {
            let mut bitmap = DirtyBitmap::new(field_count);
            for (index, set) in bits.into_iter().enumerate() {
                if set {
                    bitmap.set(index);
                }
            }
            bitmap
        }),
    ]
}

/// Strategy for generating single pending changes of players.
pub fn change_strategy() -> impl Strategy<Value = PendingChange<Player>> {
    let fields = Player::field_count();
    (player_strategy(1_000), 0..3u8, dirty_strategy(fields)).prop_map(|(player, op, dirty)| {
        match op {
            0 => PendingChange::insert(player),
            1 => PendingChange::update(player, dirty),
            _ => PendingChange::delete(player),
        }
    })
}

/// Strategy for generating change lists of up to `max_len` entries.
pub fn change_list_strategy(max_len: usize) -> impl Strategy<Value = Vec<PendingChange<Player>>> {
    prop::collection::vec(change_strategy(), 0..=max_len)
}

/// An operation against a `ConcurrentCache<u32, u32>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOp {
    /// `load(key)`
    Load(u32),
    /// `store(key, value)`
    Store(u32, u32),
    /// `load_or_store(key, value)`
    LoadOrStore(u32, u32),
    /// `load_and_delete(key)`
    LoadAndDelete(u32),
    /// `delete(key)`
    Delete(u32),
}

/// Strategy for generating cache operation sequences over a small key
/// space, so keys are revisited often.
pub fn cache_ops_strategy(keys: u32, max_len: usize) -> impl Strategy<Value = Vec<CacheOp>> {
    let op = prop_oneof![
        3 => (0..keys).prop_map(CacheOp::Load),
        3 => (0..keys, any::<u32>()).prop_map(|(k, v)| CacheOp::Store(k, v)),
        1 => (0..keys, any::<u32>()).prop_map(|(k, v)| CacheOp::LoadOrStore(k, v)),
        1 => (0..keys).prop_map(CacheOp::LoadAndDelete),
        2 => (0..keys).prop_map(CacheOp::Delete),
    ];
    prop::collection::vec(op, 0..=max_len)
}

/// A mutation requested from a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerOp {
    /// Kind of mutation.
    pub op: Op,
    /// Player id.
    pub id: u64,
    /// New level for inserts and updates.
    pub level: u32,
}

/// Strategy for generating manager mutation sequences over `keys` ids.
pub fn manager_ops_strategy(keys: u64, max_len: usize) -> impl Strategy<Value = Vec<ManagerOp>> {
    let op = (0..3u8, 0..keys, 1..1_000u32).prop_map(|(kind, id, level)| ManagerOp {
        op: match kind {
            0 => Op::Insert,
            1 => Op::Update,
            _ => Op::Delete,
        },
        id,
        level,
    });
    prop::collection::vec(op, 0..=max_len)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
