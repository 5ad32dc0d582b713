//! Live session tracking.
//!
//! A [`Session`] is shared between its connection task, the relay pumps and
//! the admin surface. Counters are atomics; timestamps and state sit behind
//! small mutexes. Cancellation is a `watch` flag the connection task selects
//! on.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;

/// Unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(u64);

impl SessionId {
    /// Raw id value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for SessionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// Connection accepted, policy not yet consulted
    Accepted,
    /// Policy admitted the client
    Admitted,
    /// Policy rejected the client
    Rejected,
    /// Waiting for the handshake to complete
    Handshaking,
    /// Relaying bytes
    Relaying,
    /// Session is closed
    Closed,
}

impl SessionState {
    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Rejected | SessionState::Closed)
    }
}

/// A single client session.
pub struct Session {
    id: SessionId,
    client_addr: SocketAddr,
    state: Mutex<SessionState>,
    remote: Mutex<Option<String>>,
    created_at: Instant,
    started_at: DateTime<Utc>,
    last_activity: Mutex<Instant>,
    /// Bytes relayed remote -> client
    bytes_sent: AtomicU64,
    /// Bytes relayed client -> remote
    bytes_received: AtomicU64,
    cancel: watch::Sender<bool>,
}

impl Session {
    fn new(id: SessionId, client_addr: SocketAddr) -> Self {
        let (cancel, _) = watch::channel(false);
        let now = Instant::now();

        Self {
            id,
            client_addr,
            state: Mutex::new(SessionState::Accepted),
            remote: Mutex::new(None),
            created_at: now,
            started_at: Utc::now(),
            last_activity: Mutex::new(now),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            cancel,
        }
    }

    /// Get session ID.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Client socket address.
    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Get session state.
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Move to `state`. Terminal states are never left.
    pub fn set_state(&self, state: SessionState) {
        let mut current = self.state.lock();
        if !current.is_terminal() {
            *current = state;
        }
    }

    /// Record the remote endpoint address.
    pub fn set_remote(&self, remote: impl Into<String>) {
        *self.remote.lock() = Some(remote.into());
    }

    /// Remote endpoint address, once connected.
    pub fn remote(&self) -> Option<String> {
        self.remote.lock().clone()
    }

    /// Count bytes read from the client.
    pub fn add_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
        self.touch();
    }

    /// Count bytes written to the client.
    pub fn add_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
        self.touch();
    }

    /// Refresh the activity timestamp.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Bytes written to the client.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Bytes read from the client.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Time since the last relayed chunk.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Check if session has been idle longer than `timeout`.
    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.idle_for() > timeout
    }

    /// Ask the connection task to close this session.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once the session has been cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.subscribe();
        // The sender lives in `self`, so the channel cannot close first
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Get session statistics.
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            id: self.id,
            client_addr: self.client_addr,
            remote: self.remote(),
            state: self.state(),
            started_at: self.started_at,
            duration_secs: self.created_at.elapsed().as_secs_f64(),
            idle_secs: self.idle_for().as_secs_f64(),
            bytes_sent: self.bytes_sent(),
            bytes_received: self.bytes_received(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("client_addr", &self.client_addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Session statistics (safe to expose, no key material).
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    /// Session id
    pub id: SessionId,
    /// Client socket address
    pub client_addr: SocketAddr,
    /// Remote endpoint, once connected
    pub remote: Option<String>,
    /// Current state
    pub state: SessionState,
    /// Wall-clock accept time
    pub started_at: DateTime<Utc>,
    /// Seconds since accept
    pub duration_secs: f64,
    /// Seconds since the last relayed chunk
    pub idle_secs: f64,
    /// Bytes written to the client
    pub bytes_sent: u64,
    /// Bytes read from the client
    pub bytes_received: u64,
}

/// Manages all live sessions.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create and register a session for a freshly accepted connection.
    pub fn register(&self, client_addr: SocketAddr) -> Arc<Session> {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let session = Arc::new(Session::new(id, client_addr));
        self.sessions.write().insert(id, Arc::clone(&session));
        session
    }

    /// Get a session by ID.
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().get(&id).cloned()
    }

    /// Remove a session.
    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.write().remove(&id)
    }

    /// Find the session of a client address.
    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .values()
            .find(|s| s.client_addr() == addr)
            .cloned()
    }

    /// Cancel one session. Returns whether it existed.
    pub fn close(&self, id: SessionId) -> bool {
        match self.get(id) {
            Some(session) => {
                session.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel the session of a client address. Returns whether it existed.
    pub fn close_by_addr(&self, addr: SocketAddr) -> bool {
        match self.find_by_addr(addr) {
            Some(session) => {
                session.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every session. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let sessions: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
        for session in &sessions {
            session.cancel();
        }
        sessions.len()
    }

    /// Cancel sessions idle for longer than `timeout`.
    pub fn evict_idle(&self, timeout: Duration) -> usize {
        let expired: Vec<Arc<Session>> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.is_expired(timeout))
            .cloned()
            .collect();

        for session in &expired {
            tracing::debug!("evicting idle session {} from {}", session.id(), session.client_addr());
            session.cancel();
        }
        expired.len()
    }

    /// Get session count.
    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Statistics for all sessions, newest first.
    pub fn snapshots(&self) -> Vec<SessionStats> {
        let sessions: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
        let mut stats: Vec<SessionStats> = sessions.iter().map(|s| s.stats()).collect();
        stats.sort_by(|a, b| b.id.cmp(&a.id));
        stats
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_session_creation() {
        let registry = SessionRegistry::new();
        let session = registry.register(addr(12345));

        assert_eq!(session.state(), SessionState::Accepted);
        assert_eq!(session.client_addr(), addr(12345));
        assert_eq!(registry.count(), 1);
        assert!(registry.get(session.id()).is_some());
    }

    #[test]
    fn test_ids_are_monotonic() {
        let registry = SessionRegistry::new();
        let a = registry.register(addr(1));
        let b = registry.register(addr(2));
        assert!(b.id() > a.id());
        assert_eq!(a.id().to_string(), "#1");
    }

    #[test]
    fn test_terminal_states_stick() {
        let registry = SessionRegistry::new();
        let session = registry.register(addr(1));

        session.set_state(SessionState::Rejected);
        session.set_state(SessionState::Relaying);
        assert_eq!(session.state(), SessionState::Rejected);
    }

    #[test]
    fn test_traffic_counters() {
        let registry = SessionRegistry::new();
        let session = registry.register(addr(1));

        session.add_received(100);
        session.add_sent(40);
        session.add_sent(2);

        let stats = session.stats();
        assert_eq!(stats.bytes_received, 100);
        assert_eq!(stats.bytes_sent, 42);
        assert!(!session.is_expired(Duration::from_secs(60)));
    }

    #[test]
    fn test_close_by_addr() {
        let registry = SessionRegistry::new();
        let a = registry.register(addr(1));
        let b = registry.register(addr(2));

        assert!(registry.close_by_addr(addr(2)));
        assert!(!registry.close_by_addr(addr(3)));
        assert!(!a.is_cancelled());
        assert!(b.is_cancelled());
    }

    #[test]
    fn test_snapshots_newest_first() {
        let registry = SessionRegistry::new();
        let first = registry.register(addr(1));
        let second = registry.register(addr(2));
        registry.remove(first.id());
        let third = registry.register(addr(3));

        let ids: Vec<SessionId> = registry.snapshots().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![third.id(), second.id()]);
    }

    #[test]
    fn test_evict_idle() {
        let registry = SessionRegistry::new();
        let session = registry.register(addr(1));

        assert_eq!(registry.evict_idle(Duration::from_secs(60)), 0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(registry.evict_idle(Duration::from_millis(1)), 1);
        assert!(session.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_resolves() {
        let registry = SessionRegistry::new();
        let session = registry.register(addr(1));

        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.cancelled().await })
        };

        assert!(registry.close(session.id()));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        // Already-cancelled sessions resolve immediately
        session.cancelled().await;
        assert_eq!(registry.cancel_all(), 1);
    }
}
