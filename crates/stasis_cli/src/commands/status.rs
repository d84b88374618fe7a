//! Status command implementation.

use super::{format_size, is_locked, scan};
use serde::Serialize;
use std::fs;
use std::path::Path;

/// Recovery state of one manager.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ManagerStatus {
    /// Persist name.
    pub name: String,
    /// Whether a live manager object holds the lock.
    pub locked: bool,
    /// Bomb file size, if one exists.
    pub bomb_size: Option<u64>,
    /// Whether a tmp marker exists.
    pub tmp_marker: bool,
}

impl ManagerStatus {
    /// Describes what the next start will do.
    pub fn verdict(&self) -> &'static str {
        match (self.tmp_marker, self.bomb_size.is_some()) {
            (true, _) => "blocked: tmp marker",
            (false, true) => "replays bomb on start",
            (false, false) => "clean",
        }
    }
}

/// Collects the recovery state of every manager with files in `dir`.
pub fn status(dir: &Path) -> Result<Vec<ManagerStatus>, Box<dyn std::error::Error>> {
    let mut statuses = Vec::new();
    for (name, files) in scan(dir)? {
        let locked = match &files.lock {
            Some(lock) => is_locked(lock)?,
            None => false,
        };
        let bomb_size = match &files.bomb {
            Some(bomb) => Some(fs::metadata(bomb)?.len()),
            None => None,
        };
        statuses.push(ManagerStatus {
            name,
            locked,
            bomb_size,
            tmp_marker: files.tmp.is_some(),
        });
    }
    Ok(statuses)
}

/// Runs the status command.
pub fn run(dir: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let statuses = status(dir)?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }

    if statuses.is_empty() {
        println!("No recovery files in {:?}", dir);
        return Ok(());
    }
    println!("{:<24} {:<8} {:<10} STATE", "MANAGER", "LOCKED", "BOMB");
    for s in &statuses {
        let bomb = s.bomb_size.map_or_else(|| "-".to_string(), format_size);
        let locked = if s.locked { "yes" } else { "no" };
        println!("{:<24} {:<8} {:<10} {}", s.name, locked, bomb, s.verdict());
    }
    Ok(())
}
