//! Recompilation counting and the restart signal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use kiln_common::VirtualPath;
use parking_lot::Mutex;
use tracing::{info, warn};

/// Counts rebuilds per logical unit for the lifetime of the process.
pub struct RecompilationCounter {
    ceiling: u32,
    counts: Mutex<HashMap<String, u32>>,
}

impl RecompilationCounter {
    /// A counter that trips after `ceiling` rebuilds of one unit.
    pub fn new(ceiling: u32) -> Self {
        Self {
            ceiling,
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// The configured ceiling.
    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    /// Records one rebuild of `key` and returns the new count.
    pub fn record(&self, key: &str) -> u32 {
        let mut counts = self.counts.lock();
        let count = counts.entry(key.to_string()).or_insert(0);
        *count += 1;
        info!(key, count = *count, ceiling = self.ceiling, "recompiled");
        *count
    }

    /// Returns `true` if `count` rebuilds cross the ceiling.
    pub fn exceeds(&self, count: u32) -> bool {
        count > self.ceiling
    }

    /// Rebuilds of `key` so far.
    pub fn count(&self, key: &str) -> u32 {
        self.counts.lock().get(key).copied().unwrap_or(0)
    }
}

/// Why the process must restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartReason {
    /// The unit that crossed the ceiling.
    pub path: VirtualPath,
    /// Its rebuild count.
    pub recompilations: u32,
}

type RestartCallback = Box<dyn Fn(&RestartReason) + Send + Sync>;

/// A one-shot process-restart signal.
#[derive(Default)]
pub struct RestartSignal {
    fired: AtomicBool,
    callback: Mutex<Option<RestartCallback>>,
}

impl RestartSignal {
    /// An unfired signal with no callback.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the callback run when the signal fires, replacing any
    /// earlier one.
    pub fn on_restart(&self, callback: impl Fn(&RestartReason) + Send + Sync + 'static) {
        *self.callback.lock() = Some(Box::new(callback));
    }

    /// Fires the signal. Only the first call runs the callback and returns
    /// `true`.
    pub fn fire(&self, reason: &RestartReason) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        warn!(
            path = %reason.path,
            recompilations = reason.recompilations,
            "recompilation ceiling crossed, restart required"
        );
        if let Some(callback) = self.callback.lock().as_ref() {
            callback(reason);
        }
        true
    }

    /// Returns `true` once the signal has fired.
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}
