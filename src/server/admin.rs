//! Runtime administration of a running server.
//!
//! Every operation is safe to call while traffic is flowing: reads copy
//! snapshots, writes take the relevant lock briefly.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use crate::endpoint::{Endpoint, EndpointTable};
use crate::error::Result;
use crate::server::metrics::MetricsSnapshot;
use crate::server::policy::ClientStats;
use crate::server::session::{SessionId, SessionStats};
use crate::server::Shared;

/// Cloneable handle onto a server's live state.
#[derive(Clone)]
pub struct AdminHandle {
    shared: Arc<Shared>,
}

impl AdminHandle {
    pub(super) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Aggregate counters.
    pub fn stats(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Text report of the aggregate counters.
    pub fn report(&self) -> String {
        self.stats().format_report()
    }

    /// Per-client statistics, most recently seen first.
    pub fn client_stats(&self) -> Vec<ClientStats> {
        self.shared.policy.client_snapshots()
    }

    /// Live sessions, newest first.
    pub fn active_sessions(&self) -> Vec<SessionStats> {
        self.shared.sessions.snapshots()
    }

    /// Close the session of a client address.
    pub fn close_connection(&self, addr: SocketAddr) -> bool {
        let closed = self.shared.sessions.close_by_addr(addr);
        if closed {
            tracing::info!("closing connection from {}", addr);
        }
        closed
    }

    /// Close a session by id.
    pub fn close_session(&self, id: SessionId) -> bool {
        let closed = self.shared.sessions.close(id);
        if closed {
            tracing::info!("closing session {}", id);
        }
        closed
    }

    /// Deny-list an IP. Its open sessions are left running.
    pub fn block_ip(&self, ip: IpAddr, reason: impl Into<String>) {
        self.shared.policy.block(ip, reason);
    }

    /// Lift a block on an IP.
    pub fn unblock_ip(&self, ip: IpAddr) -> bool {
        self.shared.policy.unblock(ip)
    }

    /// Deny-listed IPs.
    pub fn blocked_ips(&self) -> Vec<IpAddr> {
        self.shared.policy.blocked_ips()
    }

    /// Purge client records idle longer than the configured max age.
    pub fn cleanup_idle_clients(&self) -> usize {
        self.shared
            .policy
            .cleanup_idle_clients(self.shared.config.client_max_age)
    }

    /// Current endpoint table.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.shared.endpoints.snapshot().iter().cloned().collect()
    }

    /// Replace the endpoint table.
    pub fn reload_endpoints(&self, table: EndpointTable) {
        self.shared.endpoints.reload(table);
    }

    /// Rebuild the endpoint table from an overlay file.
    ///
    /// The current table stays in place if the file cannot be read.
    pub fn reload_endpoints_from(&self, path: impl AsRef<Path>) -> Result<usize> {
        let table = EndpointTable::load_overlay_file(path)?;
        let count = table.len();
        self.shared.endpoints.reload(table);
        Ok(count)
    }
}

impl std::fmt::Debug for AdminHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminHandle")
            .field("sessions", &self.shared.sessions.count())
            .finish()
    }
}
