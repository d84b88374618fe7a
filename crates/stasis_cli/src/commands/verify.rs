//! Verify command implementation.

use super::{scan, CommandError};
use stasis_core::{split_fail_queue, validate_name, BombImage, CoreResult, RawEnvelope};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of bomb files checked.
    pub bombs_checked: usize,
    /// Number of pending changes in valid bombs.
    pub changes: usize,
    /// List of errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Checks every bomb file and tmp marker in `dir`.
pub fn verify(dir: &Path) -> Result<VerifyResult, Box<dyn std::error::Error>> {
    let mut result = VerifyResult::default();

    for (name, files) in scan(dir)? {
        if let Err(e) = validate_name(&name) {
            result.errors.push(format!("{name}: {e}"));
        }
        if let Some(tmp) = &files.tmp {
            result.errors.push(format!(
                "{name}: tmp marker {} blocks startup",
                tmp.display()
            ));
        }
        let Some(bomb) = &files.bomb else {
            continue;
        };

        result.bombs_checked += 1;
        let bytes = fs::read(bomb)?;
        match check_bomb(&name, &bytes) {
            Ok(changes) => {
                debug!(manager = %name, changes, "bomb ok");
                result.changes += changes;
            }
            Err(e) => result.errors.push(format!("{name}: {e}")),
        }
    }

    Ok(result)
}

fn check_bomb(name: &str, bytes: &[u8]) -> CoreResult<usize> {
    let image = BombImage::parse(bytes)?;
    image.check_owner(name, image.field_count)?;
    let frames = split_fail_queue(image.payload)?;
    for frame in &frames {
        RawEnvelope::parse(frame, image.field_count)?;
    }
    Ok(frames.len())
}

/// Runs the verify command.
pub fn run(dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying recovery files in {:?}", dir);
    println!();

    let result = verify(dir)?;
    println!("  Bomb files checked: {}", result.bombs_checked);
    println!("  Pending changes:    {}", result.changes);
    for error in &result.errors {
        println!("  ERROR: {}", error);
    }

    println!();
    if result.is_ok() {
        println!("✓ Verification passed");
        Ok(())
    } else {
        println!("✗ Verification failed");
        Err(CommandError::VerifyFailed {
            problems: result.errors.len(),
        }
        .into())
    }
}
