//! # Stasis Core
//!
//! Write-behind persistence engine for Stasis.
//!
//! This crate provides:
//! - [`Manager`]: in-memory table of one entity type, mirrored to a
//!   [`stasis_storage::BackingStore`] by a background flush engine
//! - [`ConcurrentCache`]: lock-free-read map backing the in-memory table
//! - [`DirtyBitmap`]: per-entity changed-field tracking for partial updates
//! - Crash recovery: unflushed changes survive in a bomb file that is
//!   replayed before the next start
//! - [`Registry`]: explicit registry of named managers
//!
//! ## Flow
//!
//! ```text
//! caller ──▶ Manager ──▶ cache + active queue
//!                              │ swap per cycle
//!                              ▼
//!                        flush worker ──▶ backing store
//!                              │ unapplied rows
//!                              ▼
//!                      fail queue ⇔ bomb file
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod bitmap;
mod cache;
mod codec;
mod collector;
mod config;
mod envelope;
mod error;
mod flush;
mod manager;
mod recovery;
mod registry;
mod stats;
mod trace;
mod types;

pub use bitmap::DirtyBitmap;
pub use cache::ConcurrentCache;
pub use codec::{CborCodec, EntityCodec};
pub use config::{validate_name, ManagerConfig};
pub use envelope::{
    decode_change, decode_fail_queue, encode_change, encode_fail_queue, split_fail_queue,
    PendingChange, RawEnvelope,
};
pub use error::{CoreError, CoreResult};
pub use manager::Manager;
pub use recovery::{compute_crc32, encode_bomb, BombImage, RecoveryFiles, BOMB_MAGIC};
pub use registry::{Persist, Registry};
pub use stats::{FlushStats, StatsSnapshot};
pub use trace::TraceFeed;
pub use types::{CollectorPhase, ManagerState, Op};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
