//! Admission gate: a fixed-window counter per caller that limits how many
//! runs each caller may start.
//!
//! The window is approximate, not sliding. A caller can land `limit` runs at
//! the end of one window and `limit` more at the start of the next.

use crate::config::AdmissionConfig;
use crate::Clock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted { remaining: u32 },
    Rejected { retry_after_secs: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    started_at: u64,
    count: u32,
}

/// Per-caller window counters. Owned by whoever builds the gate and shared
/// with it; every update for a key happens under one lock so concurrent
/// submissions from the same caller are never undercounted.
#[derive(Default)]
pub struct WindowCounters {
    windows: Mutex<HashMap<String, Window>>,
}

impl WindowCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one attempt for `key` and return the window it landed in.
    fn hit(&self, key: &str, now: u64, window_secs: u64) -> Window {
        let mut windows = self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = windows
            .entry(key.to_string())
            .or_insert(Window { started_at: now, count: 0 });
        if now >= entry.started_at.saturating_add(window_secs) {
            *entry = Window { started_at: now, count: 0 };
        }
        entry.count = entry.count.saturating_add(1);
        *entry
    }

    /// Drop windows that have fully elapsed. Returns how many were removed.
    fn sweep(&self, now: u64, window_secs: u64) -> usize {
        let mut windows = self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = windows.len();
        windows.retain(|_, w| now < w.started_at.saturating_add(window_secs));
        before - windows.len()
    }

    pub fn len(&self) -> usize {
        self.windows.lock().map(|w| w.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct AdmissionGate {
    config: AdmissionConfig,
    clock: Arc<dyn Clock>,
    counters: Arc<WindowCounters>,
}

impl AdmissionGate {
    pub fn new(config: AdmissionConfig, clock: Arc<dyn Clock>, counters: Arc<WindowCounters>) -> Self {
        Self { config, clock, counters }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Count one run-creation attempt by `caller` and decide whether it may
    /// proceed. Rejected attempts still count toward the window.
    pub fn check(&self, caller: &str) -> Admission {
        let now = self.clock.unix_now_secs();
        let window_secs = self.config.window_secs();
        let window = self.counters.hit(caller, now, window_secs);

        if window.count > self.config.limit {
            let resets_at = window.started_at.saturating_add(window_secs);
            let retry_after_secs = resets_at.saturating_sub(now).max(1);
            warn!(caller, count = window.count, retry_after_secs, "run creation rate limited");
            return Admission::Rejected { retry_after_secs };
        }
        Admission::Admitted { remaining: self.config.limit - window.count }
    }

    /// Forget callers whose window has elapsed.
    pub fn sweep(&self) -> usize {
        self.counters.sweep(self.clock.unix_now_secs(), self.config.window_secs())
    }
}
