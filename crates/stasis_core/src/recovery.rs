//! Crash-recovery files.
//!
//! Each manager owns three files, by default in its data directory:
//!
//! ```text
//! <data_dir>/
//! ├─ <name>.bomb   # unpersisted fail queue, replayed at next start
//! ├─ <name>.tmp    # bomb write in progress; its presence blocks startup
//! └─ <name>.lock   # advisory lock, one manager per bomb file
//! ```
//!
//! ## Bomb format
//!
//! ```text
//! STASIS1:<name>:<field_count>:<crc32 hex> <fail-queue payload>
//! ```
//!
//! The first space byte ends the prefix. Bombs are written to the tmp path,
//! synced, then renamed over the bomb path, so a crash mid-write leaves the
//! tmp marker behind instead of a torn bomb.

use crate::config::ManagerConfig;
use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Magic tag opening every bomb prefix.
pub const BOMB_MAGIC: &str = "STASIS1";

/// A bomb file split into its prefix fields and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BombImage<'a> {
    /// Manager name recorded in the prefix.
    pub name: &'a str,
    /// Field count recorded in the prefix.
    pub field_count: usize,
    /// Payload checksum recorded in the prefix.
    pub checksum: u32,
    /// Fail-queue payload.
    pub payload: &'a [u8],
}

impl<'a> BombImage<'a> {
    /// Parses and checksums a bomb image.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidBombFile`] if there is no space delimiter
    /// or the prefix is malformed, and [`CoreError::ChecksumMismatch`] if the
    /// payload does not match the recorded checksum.
    pub fn parse(bytes: &'a [u8]) -> CoreResult<Self> {
        let delimiter = bytes
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| CoreError::invalid_bomb_file("no space delimiter after prefix"))?;
        let prefix = std::str::from_utf8(&bytes[..delimiter])
            .map_err(|_| CoreError::invalid_bomb_file("prefix is not UTF-8"))?;

        let mut parts = prefix.split(':');
        let (Some(magic), Some(name), Some(fields), Some(checksum), None) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(CoreError::invalid_bomb_file(format!(
                "malformed prefix {prefix:?}"
            )));
        };

        if magic != BOMB_MAGIC {
            return Err(CoreError::invalid_bomb_file(format!(
                "unknown magic {magic:?}"
            )));
        }
        let field_count = fields
            .parse()
            .map_err(|_| CoreError::invalid_bomb_file(format!("bad field count {fields:?}")))?;
        let checksum = u32::from_str_radix(checksum, 16)
            .map_err(|_| CoreError::invalid_bomb_file(format!("bad checksum {checksum:?}")))?;

        let payload = &bytes[delimiter + 1..];
        let actual = compute_crc32(payload);
        if actual != checksum {
            return Err(CoreError::ChecksumMismatch {
                expected: checksum,
                actual,
            });
        }

        Ok(Self {
            name,
            field_count,
            checksum,
            payload,
        })
    }

    /// Checks that the bomb was written by manager `name` for an entity with
    /// `field_count` fields.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidBombFile`] on mismatch.
    pub fn check_owner(&self, name: &str, field_count: usize) -> CoreResult<()> {
        if self.name != name {
            return Err(CoreError::invalid_bomb_file(format!(
                "bomb belongs to {:?}, not {name:?}",
                self.name
            )));
        }
        if self.field_count != field_count {
            return Err(CoreError::invalid_bomb_file(format!(
                "bomb has {} fields, entity has {field_count}",
                self.field_count
            )));
        }
        Ok(())
    }
}

/// Builds a bomb image around a fail-queue payload.
#[must_use]
pub fn encode_bomb(name: &str, field_count: usize, payload: &[u8]) -> Vec<u8> {
    let prefix = format!(
        "{BOMB_MAGIC}:{name}:{field_count}:{:08x} ",
        compute_crc32(payload)
    );
    let mut bytes = Vec::with_capacity(prefix.len() + payload.len());
    bytes.extend_from_slice(prefix.as_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

/// Computes CRC32 checksum for data.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    // IEEE polynomial, reflected
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    data.iter().fold(0xFFFF_FFFF_u32, |crc, &byte| {
        (crc >> 8) ^ CRC32_TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize]
    }) ^ 0xFFFF_FFFF
}

/// The recovery files of one manager, with its lock held.
///
/// Dropping the value releases the lock.
#[derive(Debug)]
pub struct RecoveryFiles {
    name: String,
    field_count: usize,
    bomb_path: PathBuf,
    tmp_path: PathBuf,
    lock_path: PathBuf,
    sync: bool,
    _lock_file: File,
}

impl RecoveryFiles {
    /// Creates the needed directories and takes the manager lock.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ManagerLocked`] if another manager holds the
    /// lock, or an I/O error.
    pub fn open(name: &str, field_count: usize, config: &ManagerConfig) -> CoreResult<Self> {
        let bomb_path = config.resolve_bomb_path(name);
        let tmp_path = config.resolve_tmp_path(name);
        let lock_path = config.resolve_lock_path(name);

        fs::create_dir_all(&config.data_dir)?;
        for path in [&bomb_path, &tmp_path] {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::ManagerLocked { path: lock_path });
        }

        Ok(Self {
            name: name.to_string(),
            field_count,
            bomb_path,
            tmp_path,
            lock_path,
            sync: config.sync_files,
            _lock_file: lock_file,
        })
    }

    /// Returns the bomb file path.
    #[must_use]
    pub fn bomb_path(&self) -> &Path {
        &self.bomb_path
    }

    /// Returns the tmp marker path.
    #[must_use]
    pub fn tmp_path(&self) -> &Path {
        &self.tmp_path
    }

    /// Returns the lock file path.
    #[must_use]
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Returns true if a bomb file exists.
    #[must_use]
    pub fn bomb_exists(&self) -> bool {
        self.bomb_path.exists()
    }

    /// Returns true if a tmp marker exists.
    #[must_use]
    pub fn tmp_exists(&self) -> bool {
        self.tmp_path.exists()
    }

    /// Fails if a tmp marker exists.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TempFileExists`]; never resolved automatically.
    pub fn check_tmp(&self) -> CoreResult<()> {
        if self.tmp_exists() {
            return Err(CoreError::TempFileExists {
                path: self.tmp_path.clone(),
            });
        }
        Ok(())
    }

    /// Reads the bomb file and returns its verified payload.
    ///
    /// Returns `None` if there is no bomb file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is malformed, fails its
    /// checksum, or belongs to another manager.
    pub fn read_bomb(&self) -> CoreResult<Option<Vec<u8>>> {
        let bytes = match fs::read(&self.bomb_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let image = BombImage::parse(&bytes)?;
        image.check_owner(&self.name, self.field_count)?;
        Ok(Some(image.payload.to_vec()))
    }

    /// Atomically replaces the bomb file with `payload`.
    ///
    /// Uses write-then-rename for crash safety:
    /// 1. Write to the tmp marker path
    /// 2. Sync it to disk
    /// 3. Rename it over the bomb path
    /// 4. Fsync the directory so the rename is durable
    ///
    /// # Errors
    ///
    /// Returns an I/O error; the tmp marker may be left behind.
    pub fn write_bomb(&self, payload: &[u8]) -> CoreResult<()> {
        let image = encode_bomb(&self.name, self.field_count, payload);

        let mut file = File::create(&self.tmp_path)?;
        file.write_all(&image)?;
        if self.sync {
            file.sync_all()?;
        }
        drop(file);

        fs::rename(&self.tmp_path, &self.bomb_path)?;
        self.sync_directory()
    }

    /// Deletes the bomb file.
    ///
    /// Returns true if a file was removed.
    ///
    /// # Errors
    ///
    /// Returns an I/O error other than "not found".
    pub fn remove_bomb(&self) -> CoreResult<bool> {
        match fs::remove_file(&self.bomb_path) {
            Ok(()) => {
                self.sync_directory()?;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> CoreResult<()> {
        if !self.sync {
            return Ok(());
        }
        if let Some(parent) = self.bomb_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            File::open(parent)?.sync_all()?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> CoreResult<()> {
        // NTFS journals metadata; directories cannot be opened for fsync
        Ok(())
    }
}
