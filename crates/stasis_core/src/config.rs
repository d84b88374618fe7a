//! Manager configuration.

use crate::error::{CoreError, CoreResult};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for a write-behind manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Directory holding the bomb, tmp marker and lock files.
    pub data_dir: PathBuf,

    /// Bomb file path; defaults to `<data_dir>/<name>.bomb`.
    pub bomb_path: Option<PathBuf>,

    /// Tmp marker path; defaults to `<data_dir>/<name>.tmp`.
    pub tmp_path: Option<PathBuf>,

    /// Rows per multi-row insert statement.
    pub batch_size: usize,

    /// Sleep of a cycle that found nothing to flush.
    pub idle_interval: Duration,

    /// Active-queue length above which the collector warns.
    pub overload_queue_len: usize,

    /// Cycle duration above which the collector warns.
    pub slow_cycle: Duration,

    /// Whether to fsync bomb writes and their directory.
    pub sync_files: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            bomb_path: None,
            tmp_path: None,
            batch_size: 100,
            idle_interval: Duration::from_millis(100),
            overload_queue_len: 100_000,
            slow_cycle: Duration::from_secs(5),
            sync_files: true,
        }
    }
}

impl ManagerConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the data directory.
    #[must_use]
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = path.into();
        self
    }

    /// Overrides the bomb file path.
    #[must_use]
    pub fn bomb_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.bomb_path = Some(path.into());
        self
    }

    /// Overrides the tmp marker path.
    #[must_use]
    pub fn tmp_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.tmp_path = Some(path.into());
        self
    }

    /// Sets rows per multi-row insert statement.
    #[must_use]
    pub const fn batch_size(mut self, rows: usize) -> Self {
        self.batch_size = rows;
        self
    }

    /// Sets the idle cycle sleep.
    #[must_use]
    pub const fn idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    /// Sets the overload warning threshold.
    #[must_use]
    pub const fn overload_queue_len(mut self, len: usize) -> Self {
        self.overload_queue_len = len;
        self
    }

    /// Sets the slow cycle warning threshold.
    #[must_use]
    pub const fn slow_cycle(mut self, duration: Duration) -> Self {
        self.slow_cycle = duration;
        self
    }

    /// Sets whether bomb writes are fsynced.
    #[must_use]
    pub const fn sync_files(mut self, value: bool) -> Self {
        self.sync_files = value;
        self
    }

    /// Returns the bomb file path for manager `name`.
    #[must_use]
    pub fn resolve_bomb_path(&self, name: &str) -> PathBuf {
        self.bomb_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join(format!("{name}.bomb")))
    }

    /// Returns the tmp marker path for manager `name`.
    #[must_use]
    pub fn resolve_tmp_path(&self, name: &str) -> PathBuf {
        self.tmp_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join(format!("{name}.tmp")))
    }

    /// Returns the lock file path for manager `name`.
    #[must_use]
    pub fn resolve_lock_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{name}.lock"))
    }

    /// Checks the configuration for manager `name`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] if the batch size is zero, the
    /// name is unusable in file names and the bomb prefix, or the bomb and
    /// tmp paths coincide or live in different directories. The bomb is
    /// renamed into place from the tmp path, which only works within one
    /// directory.
    pub fn validate(&self, name: &str) -> CoreResult<()> {
        validate_name(name)?;
        if self.batch_size == 0 {
            return Err(CoreError::invalid_config("batch_size must be at least 1"));
        }
        let bomb = self.resolve_bomb_path(name);
        let tmp = self.resolve_tmp_path(name);
        if bomb == tmp {
            return Err(CoreError::invalid_config(
                "bomb and tmp paths must differ",
            ));
        }
        if bomb.parent() != tmp.parent() {
            return Err(CoreError::invalid_config(format!(
                "bomb path {} and tmp path {} must share a directory",
                bomb.display(),
                tmp.display()
            )));
        }
        Ok(())
    }
}

/// Checks that a manager name can be embedded in file names and the bomb
/// prefix.
///
/// # Errors
///
/// Returns [`CoreError::InvalidConfig`] for an empty name or one containing
/// whitespace, `:` or a path separator.
pub fn validate_name(name: &str) -> CoreResult<()> {
    if name.is_empty() {
        return Err(CoreError::invalid_config("manager name is empty"));
    }
    if let Some(c) = name
        .chars()
        .find(|&c| c.is_whitespace() || c == ':' || c == '/' || c == '\\')
    {
        return Err(CoreError::invalid_config(format!(
            "manager name {name:?} contains {c:?}"
        )));
    }
    if Path::new(name).components().count() != 1 || name == "." || name == ".." {
        return Err(CoreError::invalid_config(format!(
            "manager name {name:?} is not a plain file name"
        )));
    }
    Ok(())
}
