//! Test fixtures and manager helpers.
//!
//! Provides a sample entity and a manager wired to an [`InMemoryStore`]
//! inside a temporary data directory.

use serde::{Deserialize, Serialize};
use stasis_core::{CborCodec, Manager, ManagerConfig};
use stasis_storage::{InMemoryStore, Record};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Sample entity used across the test suite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    /// Primary key.
    pub id: u64,
    /// Display name.
    pub name: String,
    /// Character level.
    pub level: u32,
    /// Currency balance.
    pub gold: i64,
    /// Guild membership.
    pub guild_name: Option<String>,
}

impl Player {
    /// Field names, in declaration order.
    pub const FIELD_NAMES: &'static [&'static str] = &["id", "name", "level", "gold", "guildName"];
}

impl Record for Player {
    type Key = u64;
    const TABLE: &'static str = "player";
    const FIELDS: &'static [&'static str] = Self::FIELD_NAMES;

    fn primary_key(&self) -> u64 {
        self.id
    }

    fn assign_field(&mut self, src: &Self, field: usize) {
        match field {
            0 => self.id = src.id,
            1 => self.name = src.name.clone(),
            2 => self.level = src.level,
            3 => self.gold = src.gold,
            4 => self.guild_name = src.guild_name.clone(),
            _ => {}
        }
    }
}

/// Creates a level-1 player with id `id`.
pub fn player(id: u64) -> Player {
    Player {
        id,
        name: format!("player-{id}"),
        level: 1,
        gold: 0,
        guild_name: None,
    }
}

/// A configuration with short idle sleeps and no fsync.
pub fn fast_config(dir: &Path) -> ManagerConfig {
    ManagerConfig::new()
        .data_dir(dir)
        .idle_interval(Duration::from_millis(1))
        .sync_files(false)
}

/// A manager over an in-memory store, cleaned up on drop.
#[derive(Debug)]
pub struct TestManager {
    /// The manager; dropped (and stopped) first.
    pub manager: Manager<Player>,
    /// Handle on the manager's store.
    pub store: InMemoryStore<Player>,
    config: ManagerConfig,
    _temp_dir: TempDir,
}

impl TestManager {
    /// Creates an idle manager with [`fast_config`].
    pub fn new() -> Self {
        Self::with_config(|config| config)
    }

    /// Creates an idle manager with an adjusted configuration.
    pub fn with_config(adjust: impl FnOnce(ManagerConfig) -> ManagerConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = adjust(fast_config(temp_dir.path()));
        Self::open(temp_dir, config, InMemoryStore::new())
    }

    /// Creates and starts a manager.
    pub fn started() -> Self {
        let test = Self::new();
        test.manager.start().expect("Failed to start manager");
        test
    }

    fn open(temp_dir: TempDir, config: ManagerConfig, store: InMemoryStore<Player>) -> Self {
        let manager = Manager::new(store.clone(), CborCodec::new(), config.clone())
            .expect("Failed to create manager");
        Self {
            manager,
            store,
            config,
            _temp_dir: temp_dir,
        }
    }

    /// Drops the manager and opens a new one on the same directory and
    /// store, as a process restart would. The new manager is idle.
    pub fn reopen(self) -> Self {
        let Self {
            manager,
            store,
            config,
            _temp_dir,
        } = self;
        drop(manager);
        Self::open(_temp_dir, config, store)
    }

    /// Returns the data directory.
    pub fn dir(&self) -> &Path {
        self._temp_dir.path()
    }

    /// Returns the configuration the manager was built with.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Polls `condition` until it holds or `timeout` passes.
    pub fn wait_for(&self, timeout: Duration, mut condition: impl FnMut(&Self) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if condition(self) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Waits up to five seconds for the store to hold `rows` rows.
    pub fn wait_for_rows(&self, rows: usize) -> bool {
        self.wait_for(Duration::from_secs(5), |t| t.store.len() == rows)
    }
}

impl Default for TestManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestManager {
    type Target = Manager<Player>;

    fn deref(&self) -> &Self::Target {
        &self.manager
    }
}

/// Runs `f` against a started manager, then stops it.
///
/// # Example
///
/// ```rust,ignore
/// use stasis_testkit::{player, with_running_manager};
///
/// with_running_manager(|manager, store| {
///     manager.insert(player(1)).unwrap();
/// });
/// ```
pub fn with_running_manager<F, R>(f: F) -> R
where
    F: FnOnce(&Manager<Player>, &InMemoryStore<Player>) -> R,
{
    let test = TestManager::started();
    let result = f(&test.manager, &test.store);
    test.manager.stop().expect("Failed to stop manager");
    result
}
