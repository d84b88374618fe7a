//! Benchmark utilities.

use stasis_core::{DirtyBitmap, PendingChange};
use stasis_storage::Record;
use stasis_testkit::{player, Player};

/// Generate `count` players with ids `0..count`.
pub fn generate_players(count: usize) -> Vec<Player> {
    (0..count as u64).map(player).collect()
}

/// Generate a fail queue mixing inserts, partial updates and deletes.
pub fn generate_changes(count: usize) -> Vec<PendingChange<Player>> {
    let gold = DirtyBitmap::for_fields(Player::FIELDS, &["gold"]);
    generate_players(count)
        .into_iter()
        .enumerate()
        .map(|(i, p)| match i % 3 {
            0 => PendingChange::insert(p),
            1 => PendingChange::update(p, gold.clone()),
            _ => PendingChange::delete(p),
        })
        .collect()
}
