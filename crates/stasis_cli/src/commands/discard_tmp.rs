//! Discard-tmp command implementation.
//!
//! A tmp marker means a bomb write was interrupted. The bomb file next to
//! it, if any, is the last complete fail queue; the marker itself may be
//! torn. Startup refuses to guess, so an operator inspects and removes it.

use super::{is_locked, CommandError};
use stasis_core::{validate_name, ManagerConfig};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Removes the tmp marker of manager `name`, returning its path.
pub fn discard(dir: &Path, name: &str, force: bool) -> Result<PathBuf, Box<dyn std::error::Error>> {
    validate_name(name)?;
    let config = ManagerConfig::new().data_dir(dir);
    let tmp_path = config.resolve_tmp_path(name);
    if !tmp_path.exists() {
        return Err(CommandError::NoTmp { path: tmp_path }.into());
    }
    if is_locked(&config.resolve_lock_path(name))? {
        return Err(CommandError::ManagerRunning {
            name: name.to_string(),
        }
        .into());
    }
    if !force {
        return Err(CommandError::ForceRequired {
            action: "delete the tmp marker",
        }
        .into());
    }

    fs::remove_file(&tmp_path)?;
    info!("Removed tmp marker {:?}", tmp_path);
    Ok(tmp_path)
}

/// Runs the discard-tmp command.
pub fn run(dir: &Path, name: &str, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let removed = discard(dir, name, force)?;
    println!("Removed {}", removed.display());
    println!("Run `stasis verify` before restarting {name}.");
    Ok(())
}
