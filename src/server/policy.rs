//! Per-client admission policy.
//!
//! Checks run in a fixed order for every new connection: deny list, allow
//! list, flagged records, concurrent connection cap, then the rate window.
//! The security lists and the client records each have their own lock and
//! the two are never held at the same time.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::error::RejectReason;
use crate::server::rate_limit::{RateLimit, RateWindow};

/// Default cap on concurrent connections per IP
pub const DEFAULT_MAX_CONNECTIONS_PER_IP: u32 = 10;

/// Admission policy parameters.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// When non-empty only these IPs are admitted
    pub allowlist: Vec<IpAddr>,
    /// Always rejected, even when allow-listed
    pub denylist: Vec<IpAddr>,
    /// Concurrent connections allowed per IP
    pub max_connections_per_ip: u32,
    /// Connection rate limit per IP
    pub rate_limit: RateLimit,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allowlist: Vec::new(),
            denylist: Vec::new(),
            max_connections_per_ip: DEFAULT_MAX_CONNECTIONS_PER_IP,
            rate_limit: RateLimit::default(),
        }
    }
}

/// Allow and deny sets. Deny takes precedence.
#[derive(Debug, Default, Clone)]
pub struct SecurityLists {
    allow: HashSet<IpAddr>,
    deny: HashSet<IpAddr>,
}

impl SecurityLists {
    fn check(&self, ip: &IpAddr) -> Result<(), RejectReason> {
        if self.deny.contains(ip) {
            return Err(RejectReason::Blocklisted);
        }
        if !self.allow.is_empty() && !self.allow.contains(ip) {
            return Err(RejectReason::NotWhitelisted);
        }
        Ok(())
    }
}

/// Everything known about one client IP.
#[derive(Debug)]
struct ClientRecord {
    first_seen: DateTime<Utc>,
    last_seen: Instant,
    last_seen_at: DateTime<Utc>,
    window: RateWindow,
    total_connections: u64,
    active_connections: u32,
    bytes_sent: u64,
    bytes_received: u64,
    blocked: bool,
    block_reason: Option<String>,
}

impl ClientRecord {
    fn new(now: Instant) -> Self {
        let wall = Utc::now();
        Self {
            first_seen: wall,
            last_seen: now,
            last_seen_at: wall,
            window: RateWindow::new(now),
            total_connections: 0,
            active_connections: 0,
            bytes_sent: 0,
            bytes_received: 0,
            blocked: false,
            block_reason: None,
        }
    }

    fn touch(&mut self, now: Instant) {
        self.last_seen = now;
        self.last_seen_at = Utc::now();
    }

    fn block(&mut self, reason: String) {
        self.blocked = true;
        self.block_reason = Some(reason);
    }

    fn snapshot(&self, ip: IpAddr) -> ClientStats {
        ClientStats {
            ip,
            first_seen: self.first_seen,
            last_seen: self.last_seen_at,
            window_connections: self.window.count(),
            total_connections: self.total_connections,
            active_connections: self.active_connections,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            blocked: self.blocked,
            block_reason: self.block_reason.clone(),
        }
    }
}

/// Per-client statistics (safe to expose).
#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    /// Client IP
    pub ip: IpAddr,
    /// First connection
    pub first_seen: DateTime<Utc>,
    /// Most recent admitted connection
    pub last_seen: DateTime<Utc>,
    /// Connections in the current rate window
    pub window_connections: u32,
    /// Connections admitted over the record's lifetime
    pub total_connections: u64,
    /// Admitted connections not yet closed
    pub active_connections: u32,
    /// Bytes sent to the client
    pub bytes_sent: u64,
    /// Bytes received from the client
    pub bytes_received: u64,
    /// Whether the client is blocked
    pub blocked: bool,
    /// Why the client was blocked
    pub block_reason: Option<String>,
}

/// Admission policy shared by all connections.
pub struct SecurityPolicy {
    lists: RwLock<SecurityLists>,
    clients: Mutex<HashMap<IpAddr, ClientRecord>>,
    max_connections_per_ip: u32,
    rate_limit: RateLimit,
}

impl SecurityPolicy {
    /// Create a policy.
    pub fn new(config: PolicyConfig) -> Self {
        let lists = SecurityLists {
            allow: config.allowlist.into_iter().collect(),
            deny: config.denylist.into_iter().collect(),
        };

        Self {
            lists: RwLock::new(lists),
            clients: Mutex::new(HashMap::new()),
            max_connections_per_ip: config.max_connections_per_ip,
            rate_limit: config.rate_limit,
        }
    }

    /// Decide whether `ip` may open a new connection.
    ///
    /// On success the returned ticket holds one of the IP's concurrent
    /// connection slots until it is dropped.
    pub fn admit(self: &Arc<Self>, ip: IpAddr) -> Result<AdmissionTicket, RejectReason> {
        self.lists.read().check(&ip)?;

        let now = Instant::now();
        let exceeded = {
            let mut clients = self.clients.lock();
            let record = clients.entry(ip).or_insert_with(|| ClientRecord::new(now));

            if record.blocked {
                let reason = record
                    .block_reason
                    .clone()
                    .unwrap_or_else(|| RejectReason::Blocklisted.to_string());
                return Err(RejectReason::Blocked(reason));
            }

            if record.active_connections >= self.max_connections_per_ip {
                return Err(RejectReason::TooManyConnections);
            }

            if record.window.is_exhausted(now, &self.rate_limit) {
                record.block(RejectReason::RateLimitExceeded.to_string());
                true
            } else {
                record.window.record(now, &self.rate_limit);
                record.touch(now);
                record.total_connections += 1;
                record.active_connections += 1;
                false
            }
        };

        if exceeded {
            self.lists.write().deny.insert(ip);
            tracing::warn!("{} exceeded the connection rate limit, blocked", ip);
            return Err(RejectReason::RateLimitExceeded);
        }

        Ok(AdmissionTicket {
            policy: Arc::clone(self),
            ip,
        })
    }

    fn release(&self, ip: &IpAddr) {
        if let Some(record) = self.clients.lock().get_mut(ip) {
            record.active_connections = record.active_connections.saturating_sub(1);
        }
    }

    /// Add traffic counters of a finished session to the client's totals.
    pub fn record_traffic(&self, ip: IpAddr, bytes_sent: u64, bytes_received: u64) {
        if let Some(record) = self.clients.lock().get_mut(&ip) {
            record.bytes_sent += bytes_sent;
            record.bytes_received += bytes_received;
        }
    }

    /// Deny-list `ip` and flag its record.
    pub fn block(&self, ip: IpAddr, reason: impl Into<String>) {
        let reason = reason.into();
        self.lists.write().deny.insert(ip);
        {
            let now = Instant::now();
            let mut clients = self.clients.lock();
            clients
                .entry(ip)
                .or_insert_with(|| ClientRecord::new(now))
                .block(reason.clone());
        }
        tracing::info!("blocked {}: {}", ip, reason);
    }

    /// Remove `ip` from the deny list and clear its blocked flag.
    ///
    /// The rate window is left as is. Returns whether anything changed.
    pub fn unblock(&self, ip: IpAddr) -> bool {
        let was_denied = self.lists.write().deny.remove(&ip);
        let was_flagged = match self.clients.lock().get_mut(&ip) {
            Some(record) if record.blocked => {
                record.blocked = false;
                record.block_reason = None;
                true
            }
            _ => false,
        };

        if was_denied || was_flagged {
            tracing::info!("unblocked {}", ip);
        }
        was_denied || was_flagged
    }

    /// Add `ip` to the allow list.
    pub fn allow(&self, ip: IpAddr) {
        self.lists.write().allow.insert(ip);
    }

    /// Whether `ip` is on the deny list.
    pub fn is_blocked(&self, ip: &IpAddr) -> bool {
        self.lists.read().deny.contains(ip)
    }

    /// Deny-listed IPs.
    pub fn blocked_ips(&self) -> Vec<IpAddr> {
        let mut ips: Vec<IpAddr> = self.lists.read().deny.iter().copied().collect();
        ips.sort();
        ips
    }

    /// Purge records idle for at least `max_age`.
    ///
    /// Records with open connections are kept. Returns the number removed.
    pub fn cleanup_idle_clients(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let removed = {
            let mut clients = self.clients.lock();
            let before = clients.len();
            clients.retain(|_, record| {
                record.active_connections > 0
                    || now.saturating_duration_since(record.last_seen) < max_age
            });
            before - clients.len()
        };

        if removed > 0 {
            tracing::debug!("purged {} idle client records", removed);
        }
        removed
    }

    /// Statistics for one client.
    pub fn client_stats(&self, ip: &IpAddr) -> Option<ClientStats> {
        self.clients.lock().get(ip).map(|record| record.snapshot(*ip))
    }

    /// Statistics for every client, most recently seen first.
    pub fn client_snapshots(&self) -> Vec<ClientStats> {
        let mut entries: Vec<(Instant, ClientStats)> = {
            let clients = self.clients.lock();
            clients
                .iter()
                .map(|(ip, record)| (record.last_seen, record.snapshot(*ip)))
                .collect()
        };
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        entries.into_iter().map(|(_, stats)| stats).collect()
    }

    /// Number of tracked client records.
    pub fn tracked_clients(&self) -> usize {
        self.clients.lock().len()
    }
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self::new(PolicyConfig::default())
    }
}

/// One admitted connection's slot against the per-IP cap.
pub struct AdmissionTicket {
    policy: Arc<SecurityPolicy>,
    ip: IpAddr,
}

impl AdmissionTicket {
    /// Client IP this ticket was issued to.
    pub fn ip(&self) -> IpAddr {
        self.ip
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        self.policy.release(&self.ip);
    }
}

impl std::fmt::Debug for AdmissionTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionTicket").field("ip", &self.ip).finish()
    }
}
