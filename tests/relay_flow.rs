//! End-to-end tests: a real server relaying to a local echo data center.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use mtproxy::crypto::ProxySecret;
use mtproxy::endpoint::{Endpoint, EndpointTable};
use mtproxy::server::{Server, ServerConfig};

const SECRET_HEX: &str = "00112233445566778899aabbccddeeff";

/// Echo server standing in for every data center.
async fn spawn_echo_dc() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    addr
}

/// Data center that accepts connections and never sends a byte.
async fn spawn_silent_dc() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    addr
}

fn table_for(dc: SocketAddr) -> EndpointTable {
    EndpointTable::with_overlay(
        (1..=5).map(|id| Endpoint::new(id, dc.ip().to_string(), dc.port())),
    )
}

fn base_config() -> ServerConfig {
    ServerConfig::new(ProxySecret::from_hex(SECRET_HEX).unwrap())
}

struct Running {
    server: Server,
    addr: SocketAddr,
    task: JoinHandle<mtproxy::Result<()>>,
}

async fn start(config: ServerConfig, table: EndpointTable) -> Running {
    let server = Server::with_endpoints(config, table).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let serving = server.clone();
    let task = tokio::spawn(async move { serving.serve(listener).await });

    Running { server, addr, task }
}

impl Running {
    async fn stop(self) {
        self.server.shutdown();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

/// Poll `check` until it holds or a second has passed.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

async fn handshake(addr: SocketAddr) -> TcpStream {
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&[0u8; 64]).await.unwrap();
    let mut response = [0u8; 32];
    client.read_exact(&mut response).await.unwrap();
    client
}

#[tokio::test]
async fn test_relay_round_trip() {
    let dc = spawn_echo_dc().await;
    let running = start(base_config(), table_for(dc)).await;

    let mut client = handshake(running.addr).await;
    client.write_all(b"hello through the proxy").await.unwrap();
    let mut echoed = [0u8; 23];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"hello through the proxy");

    let admin = running.server.admin();
    let sessions = admin.active_sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].remote.as_deref(), Some(dc.to_string().as_str()));

    drop(client);
    assert!(eventually(|| running.server.session_count() == 0).await);

    let stats = running.server.metrics();
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.active_connections, 0);
    assert_eq!(stats.failed_connections, 0);
    assert_eq!(stats.bytes_received, 64 + 23);
    assert_eq!(stats.bytes_sent, 32 + 23);

    let clients = admin.client_stats();
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].total_connections, 1);
    assert_eq!(clients[0].bytes_received, 64 + 23);

    running.stop().await;
}

#[tokio::test]
async fn test_denied_client_sees_only_close() {
    let dc = spawn_echo_dc().await;
    let mut config = base_config();
    config.denylist.push("127.0.0.1".parse().unwrap());
    let running = start(config, table_for(dc)).await;

    let mut client = TcpStream::connect(running.addr).await.unwrap();
    let _ = client.write_all(&[0u8; 64]).await;
    let mut buf = Vec::new();
    let _ = client.read_to_end(&mut buf).await;
    assert!(buf.is_empty());

    assert!(eventually(|| running.server.metrics().blocked_connections == 1).await);
    assert_eq!(running.server.metrics().failed_connections, 0);

    running.stop().await;
}

#[tokio::test]
async fn test_short_preamble_counts_handshake_error() {
    let dc = spawn_echo_dc().await;
    let running = start(base_config(), table_for(dc)).await;

    let mut client = TcpStream::connect(running.addr).await.unwrap();
    client.write_all(&[0u8; 10]).await.unwrap();
    client.shutdown().await.unwrap();
    let mut buf = Vec::new();
    let _ = client.read_to_end(&mut buf).await;
    assert!(buf.is_empty());

    assert!(eventually(|| running.server.metrics().failed_connections == 1).await);
    assert_eq!(running.server.metrics().handshake_errors, 1);

    running.stop().await;
}

#[tokio::test]
async fn test_unreachable_dc_closes_session() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_dc = closed.local_addr().unwrap();
    drop(closed);

    let running = start(base_config(), table_for(dead_dc)).await;

    let mut client = handshake(running.addr).await;
    let mut buf = Vec::new();
    let _ = client.read_to_end(&mut buf).await;
    assert!(buf.is_empty());

    assert!(eventually(|| running.server.session_count() == 0).await);
    assert_eq!(running.server.metrics().failed_connections, 1);

    running.stop().await;
}

#[tokio::test]
async fn test_connection_timeout_closes_relaying_session() {
    let dc = spawn_silent_dc().await;
    let mut config = base_config();
    config.connection_timeout = Duration::from_millis(300);
    let running = start(config, table_for(dc)).await;

    let mut client = handshake(running.addr).await;
    client.write_all(b"anyone there?").await.unwrap();

    let mut buf = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut buf))
        .await
        .expect("session outlived the connection timeout");
    assert!(buf.is_empty());

    assert!(eventually(|| running.server.session_count() == 0).await);
    let stats = running.server.metrics();
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.failed_connections, 1);
    assert_eq!(stats.handshake_errors, 0);

    running.stop().await;
}

#[tokio::test]
async fn test_admin_close_session() {
    let dc = spawn_echo_dc().await;
    let running = start(base_config(), table_for(dc)).await;
    let admin = running.server.admin();

    let mut first = handshake(running.addr).await;
    let mut second = handshake(running.addr).await;
    assert!(eventually(|| admin.active_sessions().len() == 2).await);

    let local = first.local_addr().unwrap();
    assert!(admin.close_connection(local));

    let mut buf = Vec::new();
    let _ = first.read_to_end(&mut buf).await;
    assert!(eventually(|| admin.active_sessions().len() == 1).await);

    // The other session is unaffected
    second.write_all(b"still here").await.unwrap();
    let mut echoed = [0u8; 10];
    second.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"still here");

    let remaining = admin.active_sessions()[0].id;
    assert!(admin.close_session(remaining));
    let _ = second.read_to_end(&mut buf).await;
    assert!(eventually(|| running.server.session_count() == 0).await);

    running.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_live_sessions() {
    let dc = spawn_echo_dc().await;
    let running = start(base_config(), table_for(dc)).await;

    let mut client = handshake(running.addr).await;
    assert!(eventually(|| running.server.session_count() == 1).await);

    let server = running.server.clone();
    running.stop().await;

    let mut buf = Vec::new();
    let _ = client.read_to_end(&mut buf).await;
    assert!(buf.is_empty());
    assert_eq!(server.session_count(), 0);
}

#[tokio::test]
async fn test_per_ip_cap() {
    let dc = spawn_echo_dc().await;
    let mut config = base_config();
    config.max_connections_per_ip = 1;
    let running = start(config, table_for(dc)).await;

    let _first = handshake(running.addr).await;

    let mut second = TcpStream::connect(running.addr).await.unwrap();
    let mut buf = Vec::new();
    let _ = second.read_to_end(&mut buf).await;
    assert!(buf.is_empty());
    assert!(eventually(|| running.server.metrics().blocked_connections == 1).await);

    running.stop().await;
}
