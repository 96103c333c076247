//! Per-name delayed callbacks
//!
//! Each name owns at most one pending timer. Scheduling a name that already
//! has a timer aborts the old one and starts a fresh delay, so a burst of
//! notifications collapses into one callback after the burst goes quiet.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::trace;

/// Callback invoked with the name once its timer expires
pub type FireFn = Arc<dyn Fn(String) + Send + Sync>;

struct Timer {
    id: u64,
    handle: JoinHandle<()>,
}

/// Map from name to its single active timer
pub struct Debouncer {
    delay: Duration,
    fire: FireFn,
    timers: Arc<Mutex<HashMap<String, Timer>>>,
    next_id: AtomicU64,
}

impl Debouncer {
    /// Create a debouncer calling `fire` after `delay` of quiet per name
    pub fn new(delay: Duration, fire: FireFn) -> Self {
        Self {
            delay,
            fire,
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Start or restart the timer for `name`
    ///
    /// Must be called from within a Tokio runtime.
    pub fn schedule(&self, name: &str) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let key = name.to_string();
        let timers = Arc::clone(&self.timers);
        let fire = Arc::clone(&self.fire);
        let delay = self.delay;

        let mut guard = self.timers.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // An aborted timer can still wake if abort raced the sleep; only
            // the timer currently registered for the name may fire.
            let current = {
                let mut timers = timers.lock();
                match timers.get(&key) {
                    Some(timer) if timer.id == id => {
                        timers.remove(&key);
                        true
                    }
                    _ => false,
                }
            };
            if current {
                fire(key);
            }
        });

        if let Some(old) = guard.insert(name.to_string(), Timer { id, handle }) {
            trace!(name = %name, "debounce timer reset");
            old.handle.abort();
        }
    }

    /// Number of timers that have not fired yet
    pub fn pending(&self) -> usize {
        self.timers.lock().len()
    }

    /// Drop every pending timer without firing it
    pub fn cancel_all(&self) {
        for (_, timer) in self.timers.lock().drain() {
            timer.handle.abort();
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
