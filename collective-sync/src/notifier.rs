//! Connectivity state and its observers.
//!
//! The collector and the writer each own one half of the connectivity
//! picture: "the last epoch reached every peer" and "the remote holds our
//! latest patch". [`Connectivity`] combines both and broadcasts every change
//! of the combined value to subscribers. Observers never run on the thread
//! that flipped the flag.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 64;

/// Broadcasts boolean state changes to any number of observers.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<bool>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Sends `state` to every current subscriber. Having none is fine.
    pub fn notify(&self, state: bool) {
        let _ = self.tx.send(state);
    }

    /// Returns a receiver that sees every state sent from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Runs `callback` on a background task for every state sent from now
    /// on, preceded by `initial` if given. Must be called inside a Tokio
    /// runtime.
    ///
    /// Delivery is best effort: if the callback falls far behind, skipped
    /// states are dropped and it resumes with the newest ones.
    pub fn register<F>(&self, initial: Option<bool>, callback: F)
    where
        F: Fn(bool) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            if let Some(state) = initial {
                callback(state);
            }
            loop {
                match rx.recv().await {
                    Ok(state) => callback(state),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Connectivity observer lagged, skipped {} updates", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Combined connectivity of one synchronized store.
#[derive(Debug, Default)]
pub struct Connectivity {
    collector: AtomicBool,
    writer: AtomicBool,
    // Serializes flag updates with their notifications
    update: Mutex<()>,
    notifier: Notifier,
}

impl Connectivity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records whether the last collection epoch reached every peer.
    pub fn set_collector(&self, connected: bool) {
        self.update(&self.collector, connected);
    }

    /// Records whether the remote holds the latest local patch.
    pub fn set_writer(&self, up_to_date: bool) {
        self.update(&self.writer, up_to_date);
    }

    /// True when both the collector and the writer are healthy.
    pub fn is_connected(&self) -> bool {
        self.collector_connected() && self.writer_up_to_date()
    }

    pub fn collector_connected(&self) -> bool {
        self.collector.load(Ordering::Acquire)
    }

    pub fn writer_up_to_date(&self) -> bool {
        self.writer.load(Ordering::Acquire)
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    fn update(&self, flag: &AtomicBool, value: bool) {
        let _guard = self.update.lock();
        let before = self.is_connected();
        flag.store(value, Ordering::Release);
        let after = self.is_connected();
        if before != after {
            debug!("Connectivity changed: {}", after);
            self.notifier.notify(after);
        }
    }
}
