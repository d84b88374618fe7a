//! # Stasis Testkit
//!
//! Test utilities for Stasis.
//!
//! This crate provides:
//! - Test fixtures: a sample entity and managers over an in-memory store
//! - Property-based test generators using proptest
//! - Crash, shutdown and recovery scenarios
//! - Stress testing utilities
//!
//! ## Usage
//!
//! ```rust,ignore
//! use stasis_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_manager() {
//!     with_running_manager(|manager, store| {
//!         manager.insert(player(1)).unwrap();
//!         // ... test operations
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use stress::*;
