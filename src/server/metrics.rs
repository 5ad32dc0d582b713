//! Server metrics collection.
//!
//! Aggregate counters only; per-client detail lives in the admission policy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Server metrics collector.
pub struct ServerMetrics {
    /// Server start time
    start_time: Instant,
    started_at: DateTime<Utc>,
    /// Total connections accepted
    total_connections: AtomicU64,
    /// Current active connections
    active_connections: AtomicU64,
    /// Connections rejected by the admission policy
    blocked_connections: AtomicU64,
    /// Admitted connections that ended in an error
    failed_connections: AtomicU64,
    /// Handshake errors
    handshake_errors: AtomicU64,
    /// Sessions ended by a deadline
    timeouts: AtomicU64,
    /// Total bytes sent to clients
    bytes_sent: AtomicU64,
    /// Total bytes received from clients
    bytes_received: AtomicU64,
}

impl ServerMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            started_at: Utc::now(),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            blocked_connections: AtomicU64::new(0),
            failed_connections: AtomicU64::new(0),
            handshake_errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    /// Increment total and active connections.
    pub fn increment_connections(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active connections.
    pub fn decrement_connections(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Increment rejected connection count.
    pub fn increment_blocked(&self) {
        self.blocked_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment failed connection count.
    pub fn increment_failed(&self) {
        self.failed_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment handshake error count.
    pub fn increment_handshake_errors(&self) {
        self.handshake_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment timeout count.
    pub fn increment_timeouts(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Add bytes to sent counter.
    pub fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Add bytes to received counter.
    pub fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Time since the server started.
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Get total connections.
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    /// Get active connections.
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Get rejected connections.
    pub fn blocked_connections(&self) -> u64 {
        self.blocked_connections.load(Ordering::Relaxed)
    }

    /// Get failed connections.
    pub fn failed_connections(&self) -> u64 {
        self.failed_connections.load(Ordering::Relaxed)
    }

    /// Get total bytes sent.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Get total bytes received.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            started_at: self.started_at,
            uptime_secs: self.uptime().as_secs_f64(),
            total_connections: self.total_connections(),
            active_connections: self.active_connections(),
            blocked_connections: self.blocked_connections(),
            failed_connections: self.failed_connections(),
            handshake_errors: self.handshake_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent(),
            bytes_received: self.bytes_received(),
        }
    }

    /// Format metrics as a simple text report.
    pub fn format_report(&self) -> String {
        self.snapshot().format_report()
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Wall-clock start time
    pub started_at: DateTime<Utc>,
    /// Seconds since start
    pub uptime_secs: f64,
    /// Connections accepted
    pub total_connections: u64,
    /// Connections currently open
    pub active_connections: u64,
    /// Connections rejected by policy
    pub blocked_connections: u64,
    /// Admitted connections that failed
    pub failed_connections: u64,
    /// Failed handshakes
    pub handshake_errors: u64,
    /// Sessions ended by a deadline
    pub timeouts: u64,
    /// Bytes sent to clients
    pub bytes_sent: u64,
    /// Bytes received from clients
    pub bytes_received: u64,
}

impl MetricsSnapshot {
    /// Accepted connections per hour of uptime.
    pub fn connections_per_hour(&self) -> f64 {
        if self.uptime_secs <= 0.0 {
            0.0
        } else {
            self.total_connections as f64 / (self.uptime_secs / 3600.0)
        }
    }

    /// Calculate throughput in bytes per second.
    pub fn throughput_bps(&self) -> f64 {
        if self.uptime_secs <= 0.0 {
            0.0
        } else {
            (self.bytes_sent + self.bytes_received) as f64 / self.uptime_secs
        }
    }

    /// One-line summary for periodic logging.
    pub fn summary(&self) -> String {
        format!(
            "uptime {}, {} active, {} total, {} blocked, {} failed, {} sent, {} received",
            format_duration(self.uptime_secs),
            self.active_connections,
            self.total_connections,
            self.blocked_connections,
            self.failed_connections,
            format_bytes(self.bytes_sent),
            format_bytes(self.bytes_received),
        )
    }

    /// Multi-line text report.
    pub fn format_report(&self) -> String {
        format!(
            r#"MTProxy Server Metrics
======================
Started: {}
Uptime:  {}

Connections:
  Total:    {}
  Active:   {}
  Blocked:  {}
  Failed:   {}
  Per hour: {:.1}

Traffic:
  Sent:       {}
  Received:   {}
  Throughput: {}/s

Errors:
  Handshake Errors: {}
  Timeouts:         {}
"#,
            self.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            format_duration(self.uptime_secs),
            self.total_connections,
            self.active_connections,
            self.blocked_connections,
            self.failed_connections,
            self.connections_per_hour(),
            format_bytes(self.bytes_sent),
            format_bytes(self.bytes_received),
            format_bytes(self.throughput_bps() as u64),
            self.handshake_errors,
            self.timeouts,
        )
    }
}

/// Human-readable byte count, e.g. `1.5 KB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    let mut value = bytes as f64;
    for unit in UNITS {
        if value < 1024.0 {
            return format!("{:.1} {}", value, unit);
        }
        value /= 1024.0;
    }
    format!("{:.1} PB", value)
}

/// Human-readable duration in seconds, minutes, hours or days.
pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{:.1}s", seconds)
    } else if seconds < 3600.0 {
        format!("{:.1}m", seconds / 60.0)
    } else if seconds < 86400.0 {
        format!("{:.1}h", seconds / 3600.0)
    } else {
        format!("{:.1}d", seconds / 86400.0)
    }
}
