//! Write-behind manager.
//!
//! A [`Manager`] owns one entity type's in-memory table and mirrors every
//! accepted change to a [`BackingStore`] in the background.
//!
//! ## Lifecycle
//!
//! ```text
//!          start (recovery ok)
//!   Idle ────────────────────────▶ Normal
//!    ▲                              │  │
//!    │ stop (drained)               │  │ mark_panicked / flush thread lost
//!    └──────────────────────────────┘  ▼
//!                                     Panic ── start (recovery ok) ──▶ Normal
//! ```
//!
//! Only `Normal` accepts changes. Mutations update the cache and append to
//! the active queue under the same lock, so the queue order of a key's
//! changes always matches the order the cache saw them in.

use crate::bitmap::DirtyBitmap;
use crate::cache::ConcurrentCache;
use crate::codec::EntityCodec;
use crate::collector::{flush_loop, ActiveQueue, Collector, CollectorExit, Event};
use crate::config::ManagerConfig;
use crate::envelope::{decode_change, decode_fail_queue, encode_change, PendingChange};
use crate::error::{CoreError, CoreResult};
use crate::flush::{panic_message, FlushWorker};
use crate::recovery::{BombImage, RecoveryFiles};
use crate::stats::FlushStats;
use crate::trace::TraceFeed;
use crate::types::{AtomicState, ManagerState, Op};
use parking_lot::Mutex;
use stasis_storage::{BackingStore, Record};
use std::fmt;
use std::mem;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

/// Who owns the flush worker right now.
enum Runtime<T: Record> {
    /// Parked between runs.
    Stopped(Box<FlushWorker<T>>),
    /// Moved into the flush thread.
    Running {
        collector: JoinHandle<CollectorExit>,
        flusher: JoinHandle<FlushWorker<T>>,
        exit: Sender<Event<T>>,
    },
    /// The flush thread died with the worker.
    Lost,
}

/// Write-behind persistence manager for one entity type.
///
/// # Example
///
/// ```rust,ignore
/// let manager = Manager::new(store, CborCodec::new(), ManagerConfig::new().data_dir(dir))?;
/// manager.start()?;
/// manager.insert(player)?;
/// manager.update(changed, DirtyBitmap::for_fields(Player::FIELDS, &["level"]))?;
/// manager.stop()?;
/// ```
pub struct Manager<T: Record> {
    name: Arc<str>,
    config: ManagerConfig,
    state: Arc<AtomicState>,
    cache: ConcurrentCache<T::Key, T>,
    queue: Arc<Mutex<ActiveQueue<T>>>,
    codec: Arc<dyn EntityCodec<T>>,
    files: Arc<RecoveryFiles>,
    stats: Arc<FlushStats>,
    trace: TraceFeed,
    columns: Vec<String>,
    runtime: Mutex<Runtime<T>>,
}

impl<T: Record> Manager<T> {
    /// Creates a manager named after the entity's table.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or another manager
    /// holds the recovery lock for this name.
    pub fn new<S, C>(store: S, codec: C, config: ManagerConfig) -> CoreResult<Self>
    where
        S: BackingStore<T> + 'static,
        C: EntityCodec<T> + 'static,
    {
        Self::with_name(T::TABLE, store, codec, config)
    }

    /// Creates a manager with an explicit persist name.
    ///
    /// # Errors
    ///
    /// Returns an error if the name or configuration is invalid or another
    /// manager holds the recovery lock for this name.
    pub fn with_name<S, C>(name: &str, store: S, codec: C, config: ManagerConfig) -> CoreResult<Self>
    where
        S: BackingStore<T> + 'static,
        C: EntityCodec<T> + 'static,
    {
        config.validate(name)?;
        let files = Arc::new(RecoveryFiles::open(name, T::field_count(), &config)?);
        let name: Arc<str> = Arc::from(name);
        let stats = Arc::new(FlushStats::new());
        let codec: Arc<dyn EntityCodec<T>> = Arc::new(codec);

        let worker = FlushWorker::new(
            Arc::clone(&name),
            Box::new(store),
            Arc::clone(&codec),
            Arc::clone(&files),
            Arc::clone(&stats),
            config.batch_size,
            config.idle_interval,
        );
        let columns = worker.columns().to_vec();

        info!(
            manager = %name,
            fields = T::field_count(),
            bomb = %files.bomb_path().display(),
            "manager created"
        );

        Ok(Self {
            name,
            config,
            state: Arc::new(AtomicState::new(ManagerState::Idle)),
            cache: ConcurrentCache::new(),
            queue: Arc::new(Mutex::new(ActiveQueue::new())),
            codec,
            files,
            stats,
            trace: TraceFeed::new(),
            columns,
            runtime: Mutex::new(Runtime::Stopped(Box::new(worker))),
        })
    }

    /// Returns the persist name.
    pub fn persist_name(&self) -> &str {
        &self.name
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> ManagerState {
        self.state.load()
    }

    /// Returns true if the manager accepts changes.
    pub fn is_healthy(&self) -> bool {
        self.state.load() == ManagerState::Normal
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Returns the flush statistics.
    pub fn stats(&self) -> &FlushStats {
        &self.stats
    }

    /// Returns the recovery file set.
    pub fn recovery_files(&self) -> &RecoveryFiles {
        &self.files
    }

    /// Returns the column name of each field, by declaration index.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Returns the in-memory table.
    pub fn cache(&self) -> &ConcurrentCache<T::Key, T> {
        &self.cache
    }

    /// Returns the number of changes waiting for the next cycle.
    pub fn queue_len(&self) -> usize {
        self.queue.lock().changes.len()
    }

    /// Returns the primary key of `entity`.
    pub fn primary_key(&self, entity: &T) -> T::Key {
        entity.primary_key()
    }

    /// Replays the bomb file and starts the background threads.
    ///
    /// Allowed from `Idle` and `Panic`. A manager in `Panic` whose threads
    /// are still running is drained and stopped first.
    ///
    /// # Errors
    ///
    /// Returns an error if the manager is already running, recovery fails
    /// (the state is left unchanged), or the threads cannot be spawned.
    pub fn start(&self) -> CoreResult<()> {
        let mut runtime = self.runtime.lock();
        if self.state.load() == ManagerState::Normal {
            return Err(CoreError::invalid_state("manager is already running"));
        }
        if matches!(*runtime, Runtime::Running { .. }) {
            self.shutdown(&mut runtime)?;
        }
        let Runtime::Stopped(mut worker) = mem::replace(&mut *runtime, Runtime::Lost) else {
            return Err(CoreError::WorkerLost);
        };

        let recovered = match worker.recover() {
            Ok(rows) => rows,
            Err(e) => {
                error!(manager = %self.name, error = %e, "recovery failed, manager not started");
                *runtime = Runtime::Stopped(worker);
                return Err(e);
            }
        };

        self.queue.lock().open = true;
        let (begin_tx, begin_rx) = mpsc::sync_channel(0);
        let (events_tx, events_rx) = mpsc::channel();

        let flusher = {
            let events = events_tx.clone();
            thread::Builder::new()
                .name(format!("stasis-flush-{}", self.name))
                .spawn(move || flush_loop(*worker, begin_rx, events))
        };
        let flusher = match flusher {
            Ok(handle) => handle,
            Err(e) => {
                self.queue.lock().open = false;
                error!(manager = %self.name, error = %e, "failed to spawn flush thread");
                return Err(e.into());
            }
        };

        let collector = Collector {
            name: Arc::clone(&self.name),
            queue: Arc::clone(&self.queue),
            state: Arc::clone(&self.state),
            stats: Arc::clone(&self.stats),
            begin: begin_tx,
            events: events_rx,
            overload_queue_len: self.config.overload_queue_len,
            slow_cycle: self.config.slow_cycle,
        };
        let collector = thread::Builder::new()
            .name(format!("stasis-collect-{}", self.name))
            .spawn(move || collector.run());
        let collector = match collector {
            Ok(handle) => handle,
            Err(e) => {
                // the begin sender died with the closure, so the flush thread exits
                self.queue.lock().open = false;
                if let Ok(worker) = flusher.join() {
                    *runtime = Runtime::Stopped(Box::new(worker));
                }
                error!(manager = %self.name, error = %e, "failed to spawn collector thread");
                return Err(e.into());
            }
        };

        *runtime = Runtime::Running {
            collector,
            flusher,
            exit: events_tx,
        };
        self.state.store(ManagerState::Normal);
        info!(manager = %self.name, recovered, "manager started");
        Ok(())
    }

    /// Drains every queued change and stops the background threads.
    ///
    /// Producers may keep enqueueing while the drain runs; their changes are
    /// flushed or captured in the bomb file before this returns. Stopping a
    /// stopped manager is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::WorkerLost`] if a background thread died.
    pub fn stop(&self) -> CoreResult<()> {
        let mut runtime = self.runtime.lock();
        if !matches!(*runtime, Runtime::Running { .. }) {
            return Ok(());
        }
        info!(manager = %self.name, queued = self.queue_len(), "stopping manager");
        self.shutdown(&mut runtime)?;

        let stats = self.stats.snapshot();
        info!(
            manager = %self.name,
            applied = stats.rows_applied,
            pending = self.files.bomb_exists(),
            "manager stopped"
        );
        Ok(())
    }

    fn shutdown(&self, runtime: &mut Runtime<T>) -> CoreResult<()> {
        let Runtime::Running {
            collector,
            flusher,
            exit,
        } = mem::replace(runtime, Runtime::Lost)
        else {
            return Ok(());
        };

        // fails only if the collector already ended
        let _ = exit.send(Event::Exit);
        drop(exit);

        let collected = collector.join().unwrap_or_else(|payload| {
            error!(
                manager = %self.name,
                "collector thread panicked: {}",
                panic_message(&*payload)
            );
            CollectorExit::WorkerLost
        });

        match flusher.join() {
            Ok(worker) => *runtime = Runtime::Stopped(Box::new(worker)),
            Err(payload) => {
                self.queue.lock().open = false;
                self.state.store(ManagerState::Panic);
                error!(
                    manager = %self.name,
                    "flush thread panicked: {}",
                    panic_message(&*payload)
                );
                return Err(CoreError::WorkerLost);
            }
        }

        if collected == CollectorExit::WorkerLost {
            self.state.store(ManagerState::Panic);
            return Err(CoreError::WorkerLost);
        }
        // a manager marked panic stays so until restarted
        self.state.transition(ManagerState::Normal, ManagerState::Idle);
        Ok(())
    }

    /// Forces the manager into `Panic`; it stops accepting changes but keeps
    /// flushing what it already has.
    pub fn mark_panicked(&self) {
        self.state.store(ManagerState::Panic);
        warn!(manager = %self.name, "manager marked panic");
    }

    /// Returns the resident entity with `key`.
    pub fn get(&self, key: &T::Key) -> Option<Arc<T>> {
        self.cache.load(key)
    }

    /// Makes an entity read from the backing store resident without queueing
    /// a write. Allowed in any state.
    pub fn load(&self, entity: T) {
        self.cache.store(entity.primary_key(), entity);
    }

    /// Queues an insert.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AlreadyExists`] if the key is resident, or an
    /// error if the manager is not running.
    pub fn insert(&self, entity: T) -> CoreResult<()> {
        self.submit(PendingChange::insert(entity))
    }

    /// Queues an update of the fields marked in `dirty`.
    ///
    /// # Errors
    ///
    /// Returns an error if `dirty` was built for a different field count or
    /// the manager is not running.
    pub fn update(&self, entity: T, dirty: DirtyBitmap) -> CoreResult<()> {
        if dirty.field_count() != T::field_count() {
            return Err(CoreError::invalid_state(format!(
                "dirty bitmap tracks {} fields, {} has {}",
                dirty.field_count(),
                T::TABLE,
                T::field_count()
            )));
        }
        self.submit(PendingChange::update(entity, dirty))
    }

    /// Queues a full-row update.
    ///
    /// # Errors
    ///
    /// Returns an error if the manager is not running.
    pub fn update_all(&self, entity: T) -> CoreResult<()> {
        self.submit(PendingChange::update_all(entity))
    }

    /// Queues a delete.
    ///
    /// # Errors
    ///
    /// Returns an error if the manager is not running.
    pub fn delete(&self, entity: T) -> CoreResult<()> {
        self.submit(PendingChange::delete(entity))
    }

    /// Queues a delete of the resident entity with `key`.
    ///
    /// Returns the removed entity, or `None` if the key was not resident.
    ///
    /// # Errors
    ///
    /// Returns an error if the manager is not running.
    pub fn remove(&self, key: &T::Key) -> CoreResult<Option<Arc<T>>> {
        let Some(entity) = self.cache.load(key) else {
            return Ok(None);
        };
        self.submit(PendingChange::delete(T::clone(&entity)))?;
        Ok(Some(entity))
    }

    /// Applies `change` to the cache and appends it to the active queue.
    fn submit(&self, change: PendingChange<T>) -> CoreResult<()> {
        let state = self.state.load();
        if state != ManagerState::Normal {
            return Err(CoreError::NotRunning { state });
        }

        let mut queue = self.queue.lock();
        if !queue.open {
            return Err(CoreError::invalid_state("manager is shutting down"));
        }

        let key = change.key();
        match change.op {
            Op::Insert => {
                let (_, loaded) = self.cache.load_or_store(key, change.entity.clone());
                if loaded {
                    return Err(CoreError::AlreadyExists);
                }
            }
            Op::Update => self.cache.store(key, change.entity.clone()),
            Op::Delete => self.cache.delete(&key),
        }

        if self.trace.is_active() {
            match encode_change(&*self.codec, &change) {
                Ok(envelope) => self.trace.publish(&envelope),
                Err(e) => warn!(manager = %self.name, error = %e, "trace encoding failed"),
            }
        }
        queue.changes.push(change);
        Ok(())
    }

    /// Applies a change received from elsewhere: the cache follows it
    /// unconditionally and it is queued.
    fn submit_replayed(&self, change: PendingChange<T>) -> CoreResult<()> {
        if change.op == Op::Insert {
            // a replayed insert may overwrite a resident copy
            self.cache.delete(&change.key());
        }
        self.submit(change)
    }

    /// Subscribes to the envelopes of every change accepted from now on.
    pub fn subscribe_trace(&self) -> Receiver<Vec<u8>> {
        self.trace.subscribe()
    }

    /// Queues changes from trace envelopes, in order.
    ///
    /// Every envelope is decoded before any is applied, so a malformed one
    /// rejects the whole call.
    ///
    /// # Errors
    ///
    /// Returns an error if an envelope is malformed or the manager is not
    /// running.
    pub fn replay_trace(&self, envelopes: &[Vec<u8>]) -> CoreResult<usize> {
        let changes = envelopes
            .iter()
            .map(|bytes| self.bytes_to_change(bytes))
            .collect::<CoreResult<Vec<_>>>()?;
        self.enqueue_replayed(changes, "trace")
    }

    /// Queues the changes of a bomb image, e.g. one saved from another host.
    ///
    /// # Errors
    ///
    /// Returns an error if the image is invalid, belongs to another manager,
    /// or the manager is not running.
    pub fn recover_bomb(&self, bomb: &[u8]) -> CoreResult<usize> {
        let image = BombImage::parse(bomb)?;
        image.check_owner(&self.name, T::field_count())?;
        let changes = decode_fail_queue(&*self.codec, image.payload, T::field_count())?;
        self.enqueue_replayed(changes, "bomb image")
    }

    fn enqueue_replayed(&self, changes: Vec<PendingChange<T>>, source: &str) -> CoreResult<usize> {
        let state = self.state.load();
        if state != ManagerState::Normal {
            return Err(CoreError::NotRunning { state });
        }
        let rows = changes.len();
        for change in changes {
            self.submit_replayed(change)?;
        }
        info!(manager = %self.name, rows, source, "replayed changes queued");
        Ok(rows)
    }

    /// Serializes a change into its envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the codec fails.
    pub fn change_to_bytes(&self, change: &PendingChange<T>) -> CoreResult<Vec<u8>> {
        encode_change(&*self.codec, change)
    }

    /// Parses an envelope into a change.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope is malformed or the codec fails.
    pub fn bytes_to_change(&self, bytes: &[u8]) -> CoreResult<PendingChange<T>> {
        decode_change(&*self.codec, bytes, T::field_count())
    }
}

impl<T: Record> fmt::Debug for Manager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("name", &self.name)
            .field("state", &self.state.load())
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl<T: Record> Drop for Manager<T> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!(manager = %self.name, error = %e, "stop on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CborCodec;
    use serde::{Deserialize, Serialize};
    use stasis_storage::InMemoryStore;
    use std::time::{Duration, Instant};
    use tempfile::{tempdir, TempDir};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Hero {
        id: u64,
        name: String,
        level: u32,
    }

    impl Record for Hero {
        type Key = u64;
        const TABLE: &'static str = "hero";
        const FIELDS: &'static [&'static str] = &["id", "name", "level"];

        fn primary_key(&self) -> u64 {
            self.id
        }

        fn assign_field(&mut self, src: &Self, field: usize) {
            match field {
                0 => self.id = src.id,
                1 => self.name = src.name.clone(),
                2 => self.level = src.level,
                _ => {}
            }
        }
    }

    fn hero(id: u64, level: u32) -> Hero {
        Hero {
            id,
            name: format!("hero-{id}"),
            level,
        }
    }

    fn config(dir: &TempDir) -> ManagerConfig {
        ManagerConfig::new()
            .data_dir(dir.path())
            .idle_interval(Duration::from_millis(1))
            .sync_files(false)
    }

    fn manager(dir: &TempDir) -> (Manager<Hero>, InMemoryStore<Hero>) {
        let store = InMemoryStore::new();
        let manager = Manager::new(store.clone(), CborCodec::new(), config(dir)).unwrap();
        (manager, store)
    }

    fn wait_until(mut f: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !f() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn lifecycle() {
        let dir = tempdir().unwrap();
        let (manager, _) = manager(&dir);
        assert_eq!(manager.state(), ManagerState::Idle);
        assert!(!manager.is_healthy());

        manager.start().unwrap();
        assert!(manager.is_healthy());
        assert!(manager.start().is_err());

        manager.stop().unwrap();
        assert_eq!(manager.state(), ManagerState::Idle);
        manager.stop().unwrap();

        manager.start().unwrap();
        assert!(manager.is_healthy());
    }

    #[test]
    fn rejects_work_when_idle() {
        let dir = tempdir().unwrap();
        let (manager, _) = manager(&dir);
        assert!(matches!(
            manager.insert(hero(1, 1)),
            Err(CoreError::NotRunning {
                state: ManagerState::Idle
            })
        ));
    }

    #[test]
    fn writes_reach_the_store() {
        let dir = tempdir().unwrap();
        let (manager, store) = manager(&dir);
        manager.start().unwrap();

        manager.insert(hero(1, 1)).unwrap();
        manager.insert(hero(2, 1)).unwrap();
        manager
            .update(hero(1, 5), DirtyBitmap::for_fields(Hero::FIELDS, &["level"]))
            .unwrap();
        manager.delete(hero(2, 1)).unwrap();
        manager.stop().unwrap();

        assert_eq!(store.get(&1).unwrap().level, 5);
        assert!(!store.contains(&2));
        assert!(!manager.recovery_files().bomb_exists());
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let dir = tempdir().unwrap();
        let (manager, _) = manager(&dir);
        manager.start().unwrap();
        manager.insert(hero(1, 1)).unwrap();
        assert!(matches!(
            manager.insert(hero(1, 2)),
            Err(CoreError::AlreadyExists)
        ));
        assert_eq!(manager.get(&1).unwrap().level, 1);
    }

    #[test]
    fn cache_follows_mutations() {
        let dir = tempdir().unwrap();
        let (manager, _) = manager(&dir);
        manager.load(hero(7, 3));
        assert_eq!(manager.get(&7).unwrap().level, 3);

        manager.start().unwrap();
        manager.update_all(hero(7, 4)).unwrap();
        assert_eq!(manager.get(&7).unwrap().level, 4);
        assert_eq!(manager.remove(&7).unwrap().unwrap().level, 4);
        assert!(manager.get(&7).is_none());
        assert!(manager.remove(&7).unwrap().is_none());
    }

    #[test]
    fn mismatched_bitmap_is_rejected() {
        let dir = tempdir().unwrap();
        let (manager, _) = manager(&dir);
        manager.start().unwrap();
        assert!(manager.update(hero(1, 1), DirtyBitmap::new(4)).is_err());
    }

    #[test]
    fn failed_rows_land_in_bomb_and_replay_on_restart() {
        let dir = tempdir().unwrap();
        let (manager, store) = manager(&dir);
        store.fail_key(2);
        manager.start().unwrap();
        for id in 1..=3 {
            manager.insert(hero(id, 1)).unwrap();
        }
        manager.stop().unwrap();
        assert!(manager.recovery_files().bomb_exists());
        assert!(store.contains(&1));
        assert!(!store.contains(&3));

        store.clear_faults();
        manager.start().unwrap();
        assert!(store.contains(&2));
        assert!(store.contains(&3));
        assert!(!manager.recovery_files().bomb_exists());
        assert_eq!(manager.stats().snapshot().rows_recovered, 2);
    }

    #[test]
    fn failed_recovery_keeps_state() {
        let dir = tempdir().unwrap();
        let (manager, store) = manager(&dir);
        store.fail_key(1);
        manager.start().unwrap();
        manager.insert(hero(1, 1)).unwrap();
        manager.stop().unwrap();

        assert!(manager.start().is_err());
        assert_eq!(manager.state(), ManagerState::Idle);
        store.clear_faults();
        manager.start().unwrap();
        assert!(store.contains(&1));
    }

    #[test]
    fn tmp_marker_blocks_start() {
        let dir = tempdir().unwrap();
        let (manager, _) = manager(&dir);
        std::fs::write(manager.recovery_files().tmp_path(), b"").unwrap();
        let err = manager.start().unwrap_err();
        assert!(err.is_startup_fatal());
        assert_eq!(manager.state(), ManagerState::Idle);
    }

    #[test]
    fn second_manager_on_same_files_is_locked() {
        let dir = tempdir().unwrap();
        let (_first, _) = manager(&dir);
        let second = Manager::<Hero>::new(InMemoryStore::new(), CborCodec::new(), config(&dir));
        assert!(matches!(second, Err(CoreError::ManagerLocked { .. })));
    }

    #[test]
    fn panic_then_restart() {
        let dir = tempdir().unwrap();
        let (manager, store) = manager(&dir);
        manager.start().unwrap();
        manager.insert(hero(1, 1)).unwrap();

        manager.mark_panicked();
        assert_eq!(manager.state(), ManagerState::Panic);
        assert!(manager.insert(hero(2, 1)).is_err());

        manager.start().unwrap();
        assert!(manager.is_healthy());
        manager.stop().unwrap();
        assert!(store.contains(&1));
    }

    #[test]
    fn stop_after_panic_keeps_panic() {
        let dir = tempdir().unwrap();
        let (manager, _) = manager(&dir);
        manager.start().unwrap();
        manager.mark_panicked();
        manager.stop().unwrap();
        assert_eq!(manager.state(), ManagerState::Panic);
    }

    #[test]
    fn trace_replays_on_another_manager() {
        let source_dir = tempdir().unwrap();
        let replica_dir = tempdir().unwrap();
        let (source, _) = manager(&source_dir);
        let (replica, replica_store) = manager(&replica_dir);
        source.start().unwrap();
        replica.start().unwrap();

        let feed = source.subscribe_trace();
        source.insert(hero(1, 1)).unwrap();
        source.update_all(hero(1, 2)).unwrap();
        let envelopes: Vec<Vec<u8>> = feed.try_iter().collect();
        assert_eq!(envelopes.len(), 2);

        assert_eq!(replica.replay_trace(&envelopes).unwrap(), 2);
        assert_eq!(replica.get(&1).unwrap().level, 2);
        replica.stop().unwrap();
        assert_eq!(replica_store.get(&1).unwrap().level, 2);
    }

    #[test]
    fn malformed_trace_applies_nothing() {
        let dir = tempdir().unwrap();
        let (manager, _) = manager(&dir);
        manager.start().unwrap();
        let good = manager
            .change_to_bytes(&PendingChange::insert(hero(1, 1)))
            .unwrap();
        assert!(manager.replay_trace(&[good, vec![0xff]]).is_err());
        assert!(manager.get(&1).is_none());
        assert_eq!(manager.queue_len(), 0);
    }

    #[test]
    fn recover_bomb_checks_owner() {
        let dir = tempdir().unwrap();
        let (manager, _) = manager(&dir);
        manager.start().unwrap();

        let codec: Box<dyn EntityCodec<Hero>> = Box::new(CborCodec::new());
        let payload =
            crate::envelope::encode_fail_queue(&*codec, &[PendingChange::insert(hero(9, 1))])
                .unwrap();
        let foreign = crate::recovery::encode_bomb("villain", 3, &payload);
        assert!(manager.recover_bomb(&foreign).is_err());

        let own = crate::recovery::encode_bomb("hero", 3, &payload);
        assert_eq!(manager.recover_bomb(&own).unwrap(), 1);
        assert_eq!(manager.get(&9).unwrap().level, 1);
    }

    #[test]
    fn envelope_helpers_round_trip() {
        let dir = tempdir().unwrap();
        let (manager, _) = manager(&dir);
        let change = PendingChange::update(
            hero(3, 3),
            DirtyBitmap::for_fields(Hero::FIELDS, &["name"]),
        );
        let bytes = manager.change_to_bytes(&change).unwrap();
        assert_eq!(manager.bytes_to_change(&bytes).unwrap(), change);
        assert_eq!(manager.primary_key(&change.entity), 3);
        assert_eq!(manager.persist_name(), "hero");
        assert_eq!(manager.columns(), ["id", "name", "level"]);
    }

    #[test]
    fn concurrent_producers() {
        let dir = tempdir().unwrap();
        let (manager, store) = manager(&dir);
        let manager = Arc::new(manager);
        manager.start().unwrap();

        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || {
                    for i in 0..100 {
                        manager.insert(hero(t * 1000 + i, 1)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        wait_until(|| store.len() == 400);
        manager.stop().unwrap();
        assert_eq!(store.len(), 400);
    }
}
