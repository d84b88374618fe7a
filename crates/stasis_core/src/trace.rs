//! Replication trace feed.
//!
//! Every change a manager accepts can be published as its envelope bytes
//! to any number of subscribers, e.g. a replica that feeds them back in
//! with `Manager::replay_trace`. Envelopes are only built while someone is
//! subscribed.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};

/// Distributes change envelopes to subscribers in acceptance order.
#[derive(Debug, Default)]
pub struct TraceFeed {
    subscribers: RwLock<Vec<Sender<Vec<u8>>>>,
    /// Mirrors `subscribers.len()` so the hot path can skip encoding.
    count: AtomicUsize,
}

impl TraceFeed {
    /// Creates a feed with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to the feed.
    ///
    /// The receiver gets every envelope published after this call. It should
    /// be drained regularly; the channel is unbounded.
    pub fn subscribe(&self) -> Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel();
        let mut subscribers = self.subscribers.write();
        subscribers.push(tx);
        self.count.store(subscribers.len(), Ordering::Release);
        rx
    }

    /// Returns true if anyone may be listening.
    pub fn is_active(&self) -> bool {
        self.count.load(Ordering::Acquire) > 0
    }

    /// Sends an envelope to every subscriber, dropping disconnected ones.
    pub fn publish(&self, envelope: &[u8]) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(envelope.to_vec()).is_ok());
        self.count.store(subscribers.len(), Ordering::Release);
    }

    /// Returns the number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}
