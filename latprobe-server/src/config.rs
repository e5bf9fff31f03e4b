use std::time::Duration;
use thiserror::Error;

/// Per-probe timeout used when none is configured (milliseconds).
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Run creations allowed per caller per admission window.
pub const DEFAULT_RATE_LIMIT: u32 = 30;

/// Length of one admission window (seconds).
pub const DEFAULT_RATE_WINDOW_SECS: u64 = 3600;

/// Runs returned by `GET /runs` when no limit is given.
pub const DEFAULT_RECENT_RUNS: usize = 20;

/// Upper bound on `GET /runs?limit=`.
pub const MAX_RECENT_RUNS: usize = 100;

/// How many fresh slugs a store draws before giving up on a collision streak.
pub const SLUG_ATTEMPTS: usize = 5;

/// Capacity of the probe progress broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeConfig {
    pub timeout: Duration,
    /// Off by default: one logical probe is exactly one physical request.
    pub follow_redirects: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            follow_redirects: false,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Admission window must be at least one second, got {0:?}")]
    WindowTooShort(Duration),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionConfig {
    pub limit: u32,
    /// Counted in whole seconds; see [`AdmissionConfig::window_secs`].
    pub window: Duration,
    /// Key callers on the first `X-Forwarded-For` hop instead of the peer
    /// address. Only safe behind a proxy that overwrites the header.
    pub trust_forwarded_for: bool,
}

impl AdmissionConfig {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window, trust_forwarded_for: false }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window < Duration::from_secs(1) {
            return Err(ConfigError::WindowTooShort(self.window));
        }
        Ok(())
    }

    /// Window length in whole seconds, rounded up and never 0.
    pub fn window_secs(&self) -> u64 {
        let secs = self.window.as_secs();
        let secs = if self.window.subsec_nanos() > 0 { secs.saturating_add(1) } else { secs };
        secs.max(1)
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_LIMIT, Duration::from_secs(DEFAULT_RATE_WINDOW_SECS))
    }
}
