//! Timer manager.
//!
//! Owns named one-shot timers for the session and reconnector workers.
//! Each timer is a spawned sleep task that invokes its expiry callback
//! with the timer's id; callbacks post messages back into a worker
//! queue. Cancellation aborts the task. Ids are never reused, so a
//! worker resolves the cancel/expiry race by comparing the expired id
//! against the id it currently has registered.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Opaque id of a running (or expired) timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shared timer manager. One instance serves any number of sessions;
/// ownership of a timer id lies with whoever started it.
#[derive(Default)]
pub struct TimerManager {
    next_id: AtomicU64,
    timers: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl TimerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a one-shot timer. `on_expiry` runs on a runtime worker
    /// after `duration`; it receives the timer's own id.
    pub fn start_timer(
        self: &Arc<Self>,
        duration: Duration,
        on_expiry: impl FnOnce(TimerId) + Send + 'static,
    ) -> TimerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let manager = Arc::clone(self);

        // The map entry is inserted under the lock before the task can
        // observe it, so the task's cleanup never races the insert.
        let mut timers = self.timers.lock().expect("timer mutex poisoned");
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            manager
                .timers
                .lock()
                .expect("timer mutex poisoned")
                .remove(&id);
            on_expiry(TimerId(id));
        });
        timers.insert(id, handle);
        TimerId(id)
    }

    /// Cancel a timer. Harmless if it already expired.
    pub fn cancel_timer(&self, id: TimerId) {
        let handle = self
            .timers
            .lock()
            .expect("timer mutex poisoned")
            .remove(&id.0);
        if let Some(handle) = handle {
            handle.abort();
            debug!(timer_id = %id, "Cancelled timer");
        }
    }

    /// Number of timers currently pending.
    pub fn active_timers(&self) -> usize {
        self.timers.lock().expect("timer mutex poisoned").len()
    }
}
