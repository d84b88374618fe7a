//! Error types for Stasis core.

use crate::types::ManagerState;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in Stasis core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Backing-store error.
    #[error("storage error: {0}")]
    Storage(#[from] stasis_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Entity codec error.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// A flush was interrupted mid-write; the tmp marker must be inspected
    /// by an operator before the manager can start.
    #[error("temp file exists: {}", path.display())]
    TempFileExists {
        /// Path of the tmp marker.
        path: PathBuf,
    },

    /// Bomb file could not be parsed.
    #[error("invalid bomb file: {message}")]
    InvalidBombFile {
        /// Description of the problem.
        message: String,
    },

    /// A serialized change envelope is malformed.
    #[error("invalid envelope: {message}")]
    InvalidEnvelope {
        /// Description of the problem.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// An entity with the same primary key is already resident.
    #[error("entity already exists")]
    AlreadyExists,

    /// The manager is not accepting work.
    #[error("manager not running (state: {state})")]
    NotRunning {
        /// State the manager was in.
        state: ManagerState,
    },

    /// Operation not permitted in current state.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Description of why operation is invalid.
        message: String,
    },

    /// Configuration rejected.
    #[error("invalid config: {message}")]
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },

    /// A manager with the same name is already registered.
    #[error("manager already registered: {name}")]
    AlreadyRegistered {
        /// Name of the manager.
        name: String,
    },

    /// Another manager holds the recovery lock.
    #[error("manager locked: {}", path.display())]
    ManagerLocked {
        /// Path of the lock file.
        path: PathBuf,
    },

    /// A background thread died without handing its state back.
    #[error("flush worker lost")]
    WorkerLost,

    /// A registered manager failed.
    #[error("manager {name}: {source}")]
    Manager {
        /// Name of the manager.
        name: String,
        /// What went wrong.
        source: Box<CoreError>,
    },
}

impl CoreError {
    /// Wraps an error of the manager called `name`.
    pub fn manager(name: impl Into<String>, source: CoreError) -> Self {
        Self::Manager {
            name: name.into(),
            source: Box::new(source),
        }
    }

    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates an invalid bomb file error.
    pub fn invalid_bomb_file(message: impl Into<String>) -> Self {
        Self::InvalidBombFile {
            message: message.into(),
        }
    }

    /// Creates an invalid envelope error.
    pub fn invalid_envelope(message: impl Into<String>) -> Self {
        Self::InvalidEnvelope {
            message: message.into(),
        }
    }

    /// Creates an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates an invalid config error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Returns true for errors that block startup until an operator acts.
    #[must_use]
    pub fn is_startup_fatal(&self) -> bool {
        match self {
            Self::TempFileExists { .. }
            | Self::InvalidBombFile { .. }
            | Self::ChecksumMismatch { .. } => true,
            Self::Manager { source, .. } => source.is_startup_fatal(),
            _ => false,
        }
    }
}
