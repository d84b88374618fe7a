//! Error types for backing-store operations.

use std::io;
use thiserror::Error;

/// Result type for backing-store operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur while talking to a backing store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The driver rejected or failed a statement.
    #[error("backend error: {0}")]
    Backend(String),

    /// A row with the same primary key already exists.
    #[error("duplicate primary key: {0}")]
    DuplicateKey(String),

    /// A fault injected by a test driver.
    #[error("injected fault: {0}")]
    Injected(String),

    /// `commit` or `rollback` was called without an open transaction.
    #[error("no transaction in progress")]
    NoTransaction,

    /// `begin` was called while a transaction is already open.
    #[error("transaction already in progress")]
    TransactionActive,

    /// The store is closed.
    #[error("store is closed")]
    Closed,
}

impl StorageError {
    /// Creates a backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    /// Creates an injected fault error.
    pub fn injected(message: impl Into<String>) -> Self {
        Self::Injected(message.into())
    }
}
