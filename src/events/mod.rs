//! In-process event bus
//!
//! Components coordinate through a broadcast bus: the monitor publishes
//! `SystemInfo` samples, a recurring timer publishes `PersistState` ticks that
//! statistics and the session pool react to, and lifecycle events
//! (`Migrating`, `Aborting`, `Exit`) let long-running subscribers wind down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::monitor::SystemInfo;

/// Default buffer capacity of the broadcast channel.
const DEFAULT_CAPACITY: usize = 256;

/// Events published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum Event {
    /// Periodic system status from the monitor.
    SystemInfo { info: SystemInfo },
    /// Periodic tick asking stateful components to persist themselves.
    PersistState { is_migrating: bool },
    /// The hosting platform is migrating the process.
    Migrating,
    /// The run is being aborted.
    Aborting,
    /// The process is exiting; subscribers should stop their loops.
    Exit,
    /// A session was retired from the pool.
    SessionRetired { session_id: String },
}

/// Broadcast event bus with recurring emitter support.
pub struct EventManager {
    sender: broadcast::Sender<Event>,
    closed: AtomicBool,
    recurring: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventManager {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            closed: AtomicBool::new(false),
            recurring: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to all events. Slow receivers may observe `Lagged`.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publish an event. Returns the number of receivers it reached; an event
    /// with no subscribers is silently dropped.
    pub fn emit(&self, event: Event) -> usize {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }
        self.sender.send(event).unwrap_or(0)
    }

    /// Spawn a recurring emitter publishing `make_event()` every `interval`.
    /// The task runs until [`EventManager::close`] is called.
    pub fn start_recurring<F>(self: &Arc<Self>, interval: Duration, make_event: F)
    where
        F: Fn() -> Event + Send + Sync + 'static,
    {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first interval tick fires immediately; skip it so emitters
            // run on the configured cadence.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if manager.closed.load(Ordering::Acquire) {
                    break;
                }
                manager.emit(make_event());
            }
        });
        self.recurring.lock().push(handle);
    }

    /// Emit `Exit`, stop all recurring emitters and refuse further emits.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Exit must go out even though the closed flag is already set.
        let receivers = self.sender.send(Event::Exit).unwrap_or(0);
        debug!("Event manager closed, Exit delivered to {receivers} receivers");
        for handle in self.recurring.lock().drain(..) {
            handle.abort();
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for EventManager {
    fn drop(&mut self) {
        for handle in self.recurring.lock().drain(..) {
            handle.abort();
        }
    }
}
