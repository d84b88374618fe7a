//! Inspect command implementation.

use super::{format_size, CommandError};
use serde::Serialize;
use stasis_core::{split_fail_queue, BombImage, ManagerConfig, Op, RawEnvelope};
use std::fs;
use std::path::Path;

/// Bomb file inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Bomb file path.
    pub path: String,
    /// Manager name from the prefix.
    pub name: String,
    /// Entity field count from the prefix.
    pub field_count: usize,
    /// Payload checksum, hex.
    pub checksum: String,
    /// File size in bytes.
    pub file_size: u64,
    /// Number of pending changes.
    pub changes: usize,
    /// Pending inserts.
    pub inserts: usize,
    /// Pending updates.
    pub updates: usize,
    /// Pending deletes.
    pub deletes: usize,
    /// Whether a tmp marker sits next to the bomb.
    pub tmp_marker: bool,
    /// Per-change details (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<EntryInfo>>,
}

/// One pending change, without its decoded entity.
#[derive(Debug, Serialize)]
pub struct EntryInfo {
    /// Position in the fail queue.
    pub index: usize,
    /// Kind of write.
    pub op: &'static str,
    /// Entity payload size in bytes.
    pub payload_size: usize,
    /// Dirty field indices; `None` for a full row.
    pub dirty: Option<Vec<usize>>,
}

fn op_name(op: Op) -> &'static str {
    match op {
        Op::Insert => "insert",
        Op::Update => "update",
        Op::Delete => "delete",
    }
}

/// Reads and summarizes the bomb file of manager `name` in `dir`.
pub fn inspect(
    dir: &Path,
    name: &str,
    show_entries: bool,
) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let config = ManagerConfig::new().data_dir(dir);
    let bomb_path = config.resolve_bomb_path(name);
    if !bomb_path.exists() {
        return Err(CommandError::NoBomb { path: bomb_path }.into());
    }

    let bytes = fs::read(&bomb_path)?;
    let image = BombImage::parse(&bytes)?;
    let frames = split_fail_queue(image.payload)?;

    let mut result = InspectResult {
        path: bomb_path.display().to_string(),
        name: image.name.to_string(),
        field_count: image.field_count,
        checksum: format!("{:08x}", image.checksum),
        file_size: bytes.len() as u64,
        changes: frames.len(),
        inserts: 0,
        updates: 0,
        deletes: 0,
        tmp_marker: config.resolve_tmp_path(name).exists(),
        entries: show_entries.then(Vec::new),
    };

    for (index, frame) in frames.iter().enumerate() {
        let envelope = RawEnvelope::parse(frame, image.field_count)?;
        match envelope.op {
            Op::Insert => result.inserts += 1,
            Op::Update => result.updates += 1,
            Op::Delete => result.deletes += 1,
        }
        if let Some(entries) = result.entries.as_mut() {
            entries.push(EntryInfo {
                index,
                op: op_name(envelope.op),
                payload_size: envelope.payload.len(),
                dirty: (!envelope.dirty.is_set_all()).then(|| envelope.dirty.set_indices()),
            });
        }
    }

    Ok(result)
}

/// Runs the inspect command.
pub fn run(
    dir: &Path,
    name: &str,
    show_entries: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let result = inspect(dir, name, show_entries)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("Stasis Bomb Inspection");
    println!("======================");
    println!();
    println!("Path:     {}", result.path);
    println!("Manager:  {}", result.name);
    println!("Fields:   {}", result.field_count);
    println!("Checksum: {}", result.checksum);
    println!("Size:     {}", format_size(result.file_size));
    println!();
    println!("Pending changes: {}", result.changes);
    println!("  Inserts: {}", result.inserts);
    println!("  Updates: {}", result.updates);
    println!("  Deletes: {}", result.deletes);

    if result.tmp_marker {
        println!();
        println!("WARNING: tmp marker present; the manager will refuse to start");
    }

    if let Some(entries) = &result.entries {
        println!();
        println!("Entries:");
        for entry in entries {
            let dirty = match &entry.dirty {
                None => "all fields".to_string(),
                Some(fields) => format!("fields {fields:?}"),
            };
            println!(
                "  [{}] {} {} bytes, {}",
                entry.index, entry.op, entry.payload_size, dirty
            );
        }
    }
}
