//! # Stasis Storage
//!
//! Backing-store driver contract for Stasis.
//!
//! The write-behind engine in `stasis_core` never talks SQL. It drives a
//! [`BackingStore`], which exposes exactly the operations a relational
//! session offers the engine:
//!
//! - open/commit/roll back a transaction
//! - multi-row insert of homogeneous records
//! - single-row insert, update (optionally restricted to a column subset)
//!   and delete by primary key
//!
//! Records describe themselves through the [`Record`] trait: a primary key
//! and an ordered, fixed list of field names. A [`ColumnMapper`] turns field
//! names into column names following the store's naming convention.
//!
//! ## Available Drivers
//!
//! - [`InMemoryStore`] - Test driver with a capped statement log and fault
//!   injection
//!
//! ## Example
//!
//! ```rust
//! use stasis_storage::{BackingStore, ColumnSet, InMemoryStore, Record};
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Account {
//!     id: u64,
//!     balance: i64,
//! }
//!
//! impl Record for Account {
//!     type Key = u64;
//!     const TABLE: &'static str = "account";
//!     const FIELDS: &'static [&'static str] = &["id", "balance"];
//!
//!     fn primary_key(&self) -> u64 {
//!         self.id
//!     }
//!
//!     fn assign_field(&mut self, src: &Self, field: usize) {
//!         match field {
//!             0 => self.id = src.id,
//!             1 => self.balance = src.balance,
//!             _ => {}
//!         }
//!     }
//! }
//!
//! let mut store = InMemoryStore::<Account>::new();
//! store.insert(&Account { id: 1, balance: 10 }).unwrap();
//! store
//!     .update(&1, &Account { id: 1, balance: 25 }, ColumnSet::All)
//!     .unwrap();
//! assert_eq!(store.get(&1).unwrap().balance, 25);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod mapper;
mod memory;
mod record;
mod store;

pub use error::{StorageError, StorageResult};
pub use mapper::{ColumnMapper, SameMapper, SnakeMapper};
pub use memory::{Executed, InMemoryStore, Statement, DEFAULT_LOG_LIMIT};
pub use record::{ColumnSet, Record};
pub use store::BackingStore;
