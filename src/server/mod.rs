//! Proxy server.
//!
//! ## Connection lifecycle
//!
//! ```text
//! accept ──▶ SecurityPolicy::admit ──▶ ServerHandshake ──▶ connect DC ──▶ relay
//!   │              │ rejected                │ failed            │ failed     │
//!   │              ▼                         ▼                   ▼            ▼
//!   └──────────── teardown: remove session, update metrics and client record
//! ```
//!
//! Every connection runs in its own task tracked by a [`JoinSet`]. A session
//! ends when the relay ends, when the overall connection timeout expires,
//! when it is cancelled through the admin surface, or on server shutdown.

pub mod admin;
pub mod config;
pub mod metrics;
pub mod policy;
pub mod rate_limit;
pub mod session;

pub use admin::AdminHandle;
pub use config::{ServerConfig, ServerConfigFile};
pub use metrics::{format_bytes, format_duration, MetricsSnapshot, ServerMetrics};
pub use policy::{AdmissionTicket, ClientStats, PolicyConfig, SecurityPolicy};
pub use rate_limit::{RateLimit, RateWindow};
pub use session::{Session, SessionId, SessionRegistry, SessionState, SessionStats};

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::crypto::CryptoEngine;
use crate::endpoint::{EndpointRegistry, EndpointTable};
use crate::error::{Error, Result};
use crate::protocol::{ServerHandshake, PREAMBLE_SIZE, RESPONSE_SIZE};
use crate::proxy::{relay, RelayEnd};

/// State shared by the accept loop, connection tasks and admin handles.
struct Shared {
    config: ServerConfig,
    handshake: ServerHandshake,
    endpoints: Arc<EndpointRegistry>,
    policy: Arc<SecurityPolicy>,
    sessions: SessionRegistry,
    metrics: ServerMetrics,
}

impl Shared {
    /// Purge idle clients, evict stale sessions and log a summary.
    fn run_maintenance(&self) {
        let purged = self.policy.cleanup_idle_clients(self.config.client_max_age);
        let evicted = self.sessions.evict_idle(self.config.connection_timeout);
        if purged > 0 || evicted > 0 {
            tracing::debug!(
                "maintenance: purged {} client records, evicted {} sessions",
                purged,
                evicted
            );
        }
        tracing::info!("{}", self.metrics.snapshot().summary());
    }
}

/// Resolves once `shutdown` reads `true` or its sender is gone.
async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let stop = *shutdown.borrow_and_update();
        if stop || shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Main server instance.
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Server {
    /// Create a server, loading the endpoint overlay named in `config`.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let table = match &config.endpoint_overlay {
            Some(path) => EndpointTable::load_overlay_file(path)?,
            None => EndpointTable::builtin(),
        };
        Self::with_endpoints(config, table)
    }

    /// Create a server with an explicit endpoint table.
    pub fn with_endpoints(config: ServerConfig, table: EndpointTable) -> Result<Self> {
        config.validate()?;

        let engine = Arc::new(CryptoEngine::from_secret(config.secret.clone()));
        let endpoints = Arc::new(EndpointRegistry::new(table));
        let handshake = ServerHandshake::new(engine, Arc::clone(&endpoints))
            .with_timeout(config.handshake_timeout);
        let policy = Arc::new(SecurityPolicy::new(config.policy_config()));
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                handshake,
                endpoints,
                policy,
                sessions: SessionRegistry::new(),
                metrics: ServerMetrics::new(),
            }),
            shutdown: Arc::new(shutdown),
        })
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Handle for runtime administration.
    pub fn admin(&self) -> AdminHandle {
        AdminHandle::new(Arc::clone(&self.shared))
    }

    /// Get server metrics.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Get session count.
    pub fn session_count(&self) -> usize {
        self.shared.sessions.count()
    }

    /// Stop accepting and close every session. [`Server::serve`] returns
    /// once all connection tasks have finished.
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested");
        self.shutdown.send_replace(true);
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<()> {
        let addr = self.shared.config.bind_addr();
        let listener = TcpListener::bind(&addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from `listener` until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!(
            "MTProxy listening on {} ({} endpoints)",
            local_addr,
            self.shared.endpoints.len()
        );

        let mut shutdown = self.shutdown.subscribe();
        let maintenance = tokio::spawn(Self::maintenance(
            Arc::clone(&self.shared),
            self.shutdown.subscribe(),
        ));
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = wait_shutdown(&mut shutdown) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let shared = Arc::clone(&self.shared);
                        let shutdown = self.shutdown.subscribe();
                        tasks.spawn(Self::handle_connection(shared, stream, peer_addr, shutdown));
                    }
                    Err(e) => {
                        tracing::warn!("accept error: {}", e);
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::warn!("connection task failed: {}", e);
                    }
                }
            }
        }

        drop(listener);
        let cancelled = self.shared.sessions.cancel_all();
        tracing::info!(
            "stopped accepting, closing {} sessions ({} tasks)",
            cancelled,
            tasks.len()
        );
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::warn!("connection task failed: {}", e);
            }
        }
        let _ = maintenance.await;

        tracing::info!("server stopped: {}", self.shared.metrics.snapshot().summary());
        Ok(())
    }

    async fn maintenance(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(shared.config.cleanup_interval);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => shared.run_maintenance(),
                _ = wait_shutdown(&mut shutdown) => break,
            }
        }
    }

    async fn handle_connection(
        shared: Arc<Shared>,
        stream: TcpStream,
        peer_addr: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let deadline = Instant::now() + shared.config.connection_timeout;
        let session = shared.sessions.register(peer_addr);
        shared.metrics.increment_connections();
        tracing::debug!("session {} accepted from {}", session.id(), peer_addr);

        let result = match shared.policy.admit(peer_addr.ip()) {
            Err(reason) => {
                session.set_state(SessionState::Rejected);
                Err(Error::Rejected(reason))
            }
            Ok(ticket) => {
                session.set_state(SessionState::Admitted);
                let result = tokio::select! {
                    served = tokio::time::timeout_at(
                        deadline,
                        Self::serve_session(&shared, stream, &session),
                    ) => served.unwrap_or_else(|_| Err(Error::timeout(shared.config.connection_timeout))),
                    _ = session.cancelled() => Err(Error::Cancelled),
                    _ = wait_shutdown(&mut shutdown) => Err(Error::Cancelled),
                };
                drop(ticket);
                result
            }
        };

        match &result {
            Ok(end) => {
                tracing::debug!("session {} finished: {}", session.id(), end);
            }
            Err(Error::Rejected(reason)) => {
                shared.metrics.increment_blocked();
                tracing::warn!("rejected connection from {}: {}", peer_addr, reason);
            }
            Err(Error::Cancelled) => {
                tracing::debug!("session {} cancelled", session.id());
            }
            Err(e) => {
                if e.is_timeout() {
                    shared.metrics.increment_timeouts();
                }
                shared.metrics.increment_failed();
                tracing::debug!("session {} from {} failed: {}", session.id(), peer_addr, e);
            }
        }

        session.set_state(SessionState::Closed);

        let (sent, received) = (session.bytes_sent(), session.bytes_received());
        shared.metrics.add_bytes_sent(sent);
        shared.metrics.add_bytes_received(received);
        if !matches!(result, Err(Error::Rejected(_))) {
            shared.policy.record_traffic(peer_addr.ip(), sent, received);
        }
        shared.metrics.decrement_connections();
        shared.sessions.remove(session.id());
    }

    async fn serve_session(
        shared: &Shared,
        mut stream: TcpStream,
        session: &Session,
    ) -> Result<RelayEnd> {
        let _ = stream.set_nodelay(true);

        session.set_state(SessionState::Handshaking);
        let auth = match shared.handshake.perform(&mut stream).await {
            Ok(auth) => auth,
            Err(e) => {
                session.set_state(SessionState::Rejected);
                shared.metrics.increment_handshake_errors();
                return Err(e);
            }
        };
        session.add_received(PREAMBLE_SIZE as u64);
        session.add_sent(RESPONSE_SIZE as u64);

        let endpoint = shared.endpoints.resolve(auth.endpoint_id());
        drop(auth);
        let addr = endpoint.addr();
        session.set_remote(addr.clone());

        let remote = match tokio::time::timeout(
            shared.config.connect_timeout,
            TcpStream::connect(&addr),
        )
        .await
        {
            Ok(Ok(remote)) => remote,
            Ok(Err(e)) => {
                tracing::warn!("cannot reach {}: {}", endpoint, e);
                return Err(Error::protocol(format!("cannot reach {}: {}", endpoint, e)));
            }
            Err(_) => {
                tracing::warn!("connect to {} timed out", endpoint);
                return Err(Error::protocol(format!("connect to {} timed out", endpoint)));
            }
        };
        let _ = remote.set_nodelay(true);

        session.set_state(SessionState::Relaying);
        tracing::debug!(
            "session {} relaying {} <-> {}",
            session.id(),
            session.client_addr(),
            endpoint
        );
        relay(stream, remote, session).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ProxySecret;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn server() -> Server {
        let secret = ProxySecret::from_hex("00112233445566778899aabbccddeeff").unwrap();
        Server::with_endpoints(ServerConfig::new(secret), EndpointTable::builtin()).unwrap()
    }

    async fn socket_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (accepted, peer_addr) = listener.accept().await.unwrap();
        (client, accepted, peer_addr)
    }

    #[tokio::test]
    async fn test_failed_handshake_marks_session_rejected() {
        let server = server();
        let (mut client, accepted, peer_addr) = socket_pair().await;
        client.write_all(&[0u8; 10]).await.unwrap();
        client.shutdown().await.unwrap();

        let session = server.shared.sessions.register(peer_addr);
        let err = Server::serve_session(&server.shared, accepted, &session)
            .await
            .unwrap_err();
        assert!(err.is_protocol_failure());
        assert_eq!(session.state(), SessionState::Rejected);
        assert_eq!(server.metrics().handshake_errors, 1);

        // Teardown cannot overwrite the terminal state
        session.set_state(SessionState::Closed);
        assert_eq!(session.state(), SessionState::Rejected);

        let mut buf = Vec::new();
        let _ = client.read_to_end(&mut buf).await;
        assert!(buf.is_empty());
    }
}
