//! Fixed-window connection rate limiting.
//!
//! Each client IP owns a window that starts with its first connection and
//! counts connections until the window length has elapsed, at which point the
//! next connection starts a fresh window.

use std::time::{Duration, Instant};

/// Connection rate limit parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Connections allowed per window
    pub max_connections: u32,
    /// Window length
    pub window: Duration,
}

impl RateLimit {
    /// Create a new limit.
    pub fn new(max_connections: u32, window: Duration) -> Self {
        Self {
            max_connections,
            window,
        }
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self::new(100, Duration::from_secs(60))
    }
}

/// Connection counter for a single IP.
#[derive(Debug, Clone)]
pub struct RateWindow {
    /// Start of current window
    start: Instant,
    /// Connections counted in current window
    count: u32,
}

impl RateWindow {
    /// Empty window starting at `now`.
    pub fn new(now: Instant) -> Self {
        Self { start: now, count: 0 }
    }

    /// Start a fresh window if the current one has expired.
    fn roll(&mut self, now: Instant, window: Duration) {
        if now.saturating_duration_since(self.start) >= window {
            self.start = now;
            self.count = 0;
        }
    }

    /// Whether another connection at `now` would exceed `limit`.
    pub fn is_exhausted(&mut self, now: Instant, limit: &RateLimit) -> bool {
        self.roll(now, limit.window);
        self.count >= limit.max_connections
    }

    /// Count one connection at `now`.
    pub fn record(&mut self, now: Instant, limit: &RateLimit) {
        self.roll(now, limit.window);
        self.count = self.count.saturating_add(1);
    }

    /// Connections in the current window.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// When the current window started.
    pub fn started(&self) -> Instant {
        self.start
    }
}
