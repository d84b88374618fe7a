//! CLI command implementations.

pub mod discard_tmp;
pub mod inspect;
pub mod status;
pub mod verify;

use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Failures reported by the commands themselves.
#[derive(Debug, Error)]
pub enum CommandError {
    /// No bomb file for the requested manager.
    #[error("no bomb file at {}", path.display())]
    NoBomb {
        /// Expected bomb path.
        path: PathBuf,
    },

    /// No tmp marker for the requested manager.
    #[error("no tmp marker at {}", path.display())]
    NoTmp {
        /// Expected marker path.
        path: PathBuf,
    },

    /// A live manager holds the lock.
    #[error("manager {name} is running; stop it first")]
    ManagerRunning {
        /// Persist name.
        name: String,
    },

    /// A destructive command was run without `--force`.
    #[error("refusing to {action} without --force")]
    ForceRequired {
        /// What would have been done.
        action: &'static str,
    },

    /// Verification found problems.
    #[error("verification failed: {problems} problem(s)")]
    VerifyFailed {
        /// Number of problems.
        problems: usize,
    },
}

/// Recovery files of one manager found in a data directory.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ManagerFiles {
    /// `<name>.bomb`
    pub bomb: Option<PathBuf>,
    /// `<name>.tmp`
    pub tmp: Option<PathBuf>,
    /// `<name>.lock`
    pub lock: Option<PathBuf>,
}

/// Groups the recovery files in `dir` by manager name.
pub fn scan(dir: &Path) -> io::Result<BTreeMap<String, ManagerFiles>> {
    let mut found: BTreeMap<String, ManagerFiles> = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let (Some(stem), Some(ext)) = (
            path.file_stem().and_then(|s| s.to_str()).map(str::to_owned),
            path.extension().and_then(|s| s.to_str()).map(str::to_owned),
        ) else {
            continue;
        };
        if !matches!(ext.as_str(), "bomb" | "tmp" | "lock") {
            continue;
        }
        let files = found.entry(stem).or_default();
        match ext.as_str() {
            "bomb" => files.bomb = Some(path),
            "tmp" => files.tmp = Some(path),
            _ => files.lock = Some(path),
        }
    }
    Ok(found)
}

/// Returns true if a running manager holds the lock file.
pub fn is_locked(lock_path: &Path) -> io::Result<bool> {
    let file = match OpenOptions::new().read(true).write(true).open(lock_path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if file.try_lock_exclusive().is_err() {
        return Ok(true);
    }
    file.unlock()?;
    Ok(false)
}

pub(crate) fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{}", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
