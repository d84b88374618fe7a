//! Collector and flush threads.
//!
//! The collector owns the cycle handshake. Each cycle it swaps the active
//! queue for an empty buffer and hands the full one to the flush thread
//! over a rendezvous channel. It then waits for the cycle-end signal,
//! which carries the drained buffer back for the next swap.
//!
//! ```text
//! collector                       flush thread
//!   swap queue ── Begin(batch) ──▶  run_cycle
//!   wait       ◀── CycleEnd(buf) ─  (buf empty)
//! ```
//!
//! Shutdown runs through [`CollectorPhase`]: an exit request is noticed
//! while waiting for a cycle end, two more full cycles drain what was
//! queued before and during the request, and the last swap is sent with
//! `keep_running = false`.

use crate::envelope::PendingChange;
use crate::flush::FlushWorker;
use crate::stats::FlushStats;
use crate::types::{AtomicState, CollectorPhase, ManagerState};
use parking_lot::Mutex;
use stasis_storage::Record;
use std::mem;
use std::sync::mpsc::{Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// The queue producers append to.
#[derive(Debug)]
pub(crate) struct ActiveQueue<T> {
    pub(crate) changes: Vec<PendingChange<T>>,
    /// Cleared once the final batch has been taken.
    pub(crate) open: bool,
}

impl<T> ActiveQueue<T> {
    pub(crate) const fn new() -> Self {
        Self {
            changes: Vec::new(),
            open: false,
        }
    }
}

/// Cycle-begin signal.
pub(crate) struct Begin<T> {
    pub(crate) keep_running: bool,
    pub(crate) batch: Vec<PendingChange<T>>,
}

/// Signals received by the collector.
pub(crate) enum Event<T> {
    /// A cycle finished; carries the emptied batch buffer.
    CycleEnd(Vec<PendingChange<T>>),
    /// Shutdown requested.
    Exit,
    /// The flush thread is unwinding.
    WorkerLost,
}

/// How the collector thread ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CollectorExit {
    /// Drained and stopped the flush thread.
    Drained,
    /// The flush thread disappeared mid-handshake.
    WorkerLost,
}

/// Collector thread state.
pub(crate) struct Collector<T> {
    pub(crate) name: Arc<str>,
    pub(crate) queue: Arc<Mutex<ActiveQueue<T>>>,
    pub(crate) state: Arc<AtomicState>,
    pub(crate) stats: Arc<FlushStats>,
    pub(crate) begin: SyncSender<Begin<T>>,
    pub(crate) events: Receiver<Event<T>>,
    pub(crate) overload_queue_len: usize,
    pub(crate) slow_cycle: Duration,
}

impl<T: Send> Collector<T> {
    /// Runs cycles until shutdown completes or the flush thread is lost.
    pub(crate) fn run(self) -> CollectorExit {
        let mut phase = CollectorPhase::Normal;
        let mut spare = Vec::new();

        loop {
            let batch = mem::replace(&mut self.queue.lock().changes, spare);
            let Some(returned) = self.cycle(batch, true, &mut phase) else {
                return self.worker_lost();
            };
            spare = returned;
            self.check_overload();

            if phase == CollectorPhase::Done {
                break;
            }
            let next = phase.after_cycle();
            if next != phase {
                debug!(manager = %self.name, ?next, "drain cycle complete");
            }
            phase = next;
        }

        let batch = {
            let mut queue = self.queue.lock();
            queue.open = false;
            mem::take(&mut queue.changes)
        };
        debug!(manager = %self.name, rows = batch.len(), "sending stop cycle");
        if self.cycle(batch, false, &mut phase).is_none() {
            return self.worker_lost();
        }
        info!(manager = %self.name, "collector drained");
        CollectorExit::Drained
    }

    /// Runs one handshake; returns the emptied buffer, or `None` if the
    /// flush thread is gone.
    fn cycle(
        &self,
        batch: Vec<PendingChange<T>>,
        keep_running: bool,
        phase: &mut CollectorPhase,
    ) -> Option<Vec<PendingChange<T>>> {
        self.begin.send(Begin { keep_running, batch }).ok()?;
        loop {
            match self.events.recv().ok()? {
                Event::CycleEnd(buffer) => return Some(buffer),
                Event::WorkerLost => return None,
                Event::Exit => {
                    if *phase == CollectorPhase::Normal {
                        info!(manager = %self.name, "shutdown requested, draining");
                        *phase = CollectorPhase::DrainActive;
                    }
                }
            }
        }
    }

    fn check_overload(&self) {
        let queued = self.queue.lock().changes.len();
        if queued > self.overload_queue_len {
            warn!(
                manager = %self.name,
                queued,
                limit = self.overload_queue_len,
                "active queue overloaded"
            );
        }
        let last = self.stats.last_cycle();
        if last > self.slow_cycle {
            warn!(
                manager = %self.name,
                elapsed_ms = u64::try_from(last.as_millis()).unwrap_or(u64::MAX),
                "slow flush cycle"
            );
        }
    }

    fn worker_lost(&self) -> CollectorExit {
        self.queue.lock().open = false;
        self.state.store(ManagerState::Panic);
        error!(manager = %self.name, "flush thread lost, manager marked panic");
        CollectorExit::WorkerLost
    }
}

/// Tells the collector if the flush thread unwinds; the manager keeps a
/// sender of its own, so a dropped sender alone would go unnoticed.
struct UnwindAlarm<'a, T>(&'a Sender<Event<T>>);

impl<T> Drop for UnwindAlarm<'_, T> {
    fn drop(&mut self) {
        if thread::panicking() {
            let _ = self.0.send(Event::WorkerLost);
        }
    }
}

/// Flush thread body; hands the worker back when it exits.
pub(crate) fn flush_loop<T: Record>(
    mut worker: FlushWorker<T>,
    begin: Receiver<Begin<T>>,
    events: Sender<Event<T>>,
) -> FlushWorker<T> {
    let _alarm = UnwindAlarm(&events);
    while let Ok(Begin {
        keep_running,
        mut batch,
    }) = begin.recv()
    {
        let exit = worker.run_cycle(&mut batch, keep_running);
        if events.send(Event::CycleEnd(batch)).is_err() || exit {
            break;
        }
    }
    worker
}
