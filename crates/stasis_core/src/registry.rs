//! Named manager registry.
//!
//! Orchestration code builds one [`Registry`] at process start, registers
//! every manager and drives them through the object-safe [`Persist`]
//! surface. There is no global instance.

use crate::error::{CoreError, CoreResult};
use crate::manager::Manager;
use crate::types::ManagerState;
use stasis_storage::Record;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};

/// Type-erased manager operations.
pub trait Persist: Send + Sync {
    /// Returns the persist name.
    fn name(&self) -> &str;

    /// Runs recovery and starts the manager.
    ///
    /// # Errors
    ///
    /// Returns an error if startup fails.
    fn start(&self) -> CoreResult<()>;

    /// Drains and stops the manager.
    ///
    /// # Errors
    ///
    /// Returns an error if a background thread was lost.
    fn stop(&self) -> CoreResult<()>;

    /// Returns true if the manager accepts changes.
    fn is_healthy(&self) -> bool;

    /// Returns the lifecycle state.
    fn state(&self) -> ManagerState;

    /// Queues the changes of a bomb image.
    ///
    /// # Errors
    ///
    /// Returns an error if the image is invalid or the manager is not running.
    fn recover_bomb(&self, bomb: &[u8]) -> CoreResult<usize>;

    /// Queues changes from trace envelopes.
    ///
    /// # Errors
    ///
    /// Returns an error if an envelope is invalid or the manager is not running.
    fn replay_trace(&self, envelopes: &[Vec<u8>]) -> CoreResult<usize>;
}

impl<T: Record> Persist for Manager<T> {
    fn name(&self) -> &str {
        self.persist_name()
    }

    fn start(&self) -> CoreResult<()> {
        Manager::start(self)
    }

    fn stop(&self) -> CoreResult<()> {
        Manager::stop(self)
    }

    fn is_healthy(&self) -> bool {
        Manager::is_healthy(self)
    }

    fn state(&self) -> ManagerState {
        Manager::state(self)
    }

    fn recover_bomb(&self, bomb: &[u8]) -> CoreResult<usize> {
        Manager::recover_bomb(self, bomb)
    }

    fn replay_trace(&self, envelopes: &[Vec<u8>]) -> CoreResult<usize> {
        Manager::replay_trace(self, envelopes)
    }
}

/// Managers by persist name, started in registration order.
#[derive(Default)]
pub struct Registry {
    managers: BTreeMap<String, Arc<dyn Persist>>,
    order: Vec<String>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a manager under its persist name.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AlreadyRegistered`] if the name is taken.
    pub fn register(&mut self, manager: Arc<dyn Persist>) -> CoreResult<()> {
        let name = manager.name().to_string();
        if self.managers.contains_key(&name) {
            return Err(CoreError::AlreadyRegistered { name });
        }
        self.order.push(name.clone());
        self.managers.insert(name, manager);
        Ok(())
    }

    /// Returns the manager registered under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Persist>> {
        self.managers.get(name).cloned()
    }

    /// Returns registered names, in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }

    /// Returns the number of registered managers.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn in_order(&self) -> impl DoubleEndedIterator<Item = (&str, &Arc<dyn Persist>)> + '_ {
        self.order
            .iter()
            .filter_map(|name| self.managers.get(name).map(|m| (name.as_str(), m)))
    }

    /// Starts every manager in registration order, stopping at the first
    /// failure.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Manager`] naming the manager that failed.
    pub fn start_all(&self) -> CoreResult<()> {
        for (name, manager) in self.in_order() {
            if manager.is_healthy() {
                continue;
            }
            manager.start().map_err(|e| {
                error!(manager = name, error = %e, "start failed");
                CoreError::manager(name, e)
            })?;
        }
        info!(managers = self.len(), "all managers started");
        Ok(())
    }

    /// Stops every manager in reverse registration order.
    ///
    /// # Errors
    ///
    /// Returns the first failure as [`CoreError::Manager`]; the remaining
    /// managers are still stopped.
    pub fn stop_all(&self) -> CoreResult<()> {
        let mut first = None;
        for (name, manager) in self.in_order().rev() {
            if let Err(e) = manager.stop() {
                error!(manager = name, error = %e, "stop failed");
                first.get_or_insert(CoreError::manager(name, e));
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Returns true if any manager is not healthy.
    pub fn any_dead(&self) -> bool {
        self.managers.values().any(|m| !m.is_healthy())
    }

    /// Returns the names of unhealthy managers with their states.
    pub fn dead(&self) -> Vec<(&str, ManagerState)> {
        self.in_order()
            .filter(|(_, m)| !m.is_healthy())
            .map(|(name, m)| (name, m.state()))
            .collect()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("managers", &self.order)
            .finish()
    }
}
