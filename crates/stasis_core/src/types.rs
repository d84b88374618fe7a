//! Core type definitions for Stasis.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Kind of a pending change.
///
/// The discriminant is the op byte of the change envelope and must never
/// change once data has been written with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    /// Row did not exist before.
    Insert = 1,
    /// Row exists; some or all fields changed.
    Update = 2,
    /// Row removed by primary key.
    Delete = 3,
}

impl Op {
    /// Returns the envelope op byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Parses an envelope op byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Insert),
            2 => Some(Self::Update),
            3 => Some(Self::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of a manager.
///
/// Only `Normal` accepts new work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ManagerState {
    /// Constructed or cleanly stopped.
    Idle = 0,
    /// Recovery done, background threads running.
    Normal = 1,
    /// Faulted; `start` may be retried.
    Panic = 2,
}

impl ManagerState {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Normal,
            2 => Self::Panic,
            _ => Self::Idle,
        }
    }
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Normal => "normal",
            Self::Panic => "panic",
        };
        f.write_str(name)
    }
}

/// Atomically updated [`ManagerState`].
#[derive(Debug)]
pub(crate) struct AtomicState(AtomicU8);

impl AtomicState {
    pub(crate) const fn new(state: ManagerState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> ManagerState {
        ManagerState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, state: ManagerState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Moves from `current` to `new`; returns false if the state was not `current`.
    pub(crate) fn transition(&self, current: ManagerState, new: ManagerState) -> bool {
        self.0
            .compare_exchange(current as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Shutdown progress of the collector thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorPhase {
    /// Accepting work; no exit requested.
    Normal,
    /// Exit requested; next cycle flushes what is already queued.
    DrainActive,
    /// Flushes what producers queued during the first drain.
    DrainFlushing,
    /// Last drain cycle; the stop signal follows it.
    Done,
}

impl CollectorPhase {
    /// Returns the phase entered after a cycle completes in this phase.
    #[must_use]
    pub const fn after_cycle(self) -> Self {
        match self {
            Self::Normal => Self::Normal,
            Self::DrainActive => Self::DrainFlushing,
            Self::DrainFlushing | Self::Done => Self::Done,
        }
    }
}
