//! Bidirectional byte relay between a client and its remote endpoint.
//!
//! Two pumps copy in fixed-size chunks, one per direction, and run inside a
//! single `select!`: whichever finishes first ends the relay and the other is
//! dropped. Byte order within each direction is preserved.

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Result;
use crate::server::session::Session;

/// Chunk size for each pump.
pub const RELAY_BUFFER_SIZE: usize = 8192;

/// Which side ended the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// Client closed its side
    ClientClosed,
    /// Remote closed its side
    RemoteClosed,
}

impl fmt::Display for RelayEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayEnd::ClientClosed => f.write_str("client closed"),
            RelayEnd::RemoteClosed => f.write_str("remote closed"),
        }
    }
}

/// Copy from `reader` to `writer` until EOF, reporting each chunk.
async fn pump<R, W, F>(mut reader: R, mut writer: W, mut on_chunk: F) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(u64),
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        on_chunk(n as u64);
    }
}

/// Relay bytes between `client` and `remote` until one side ends.
///
/// Client-to-remote bytes count as received, remote-to-client bytes as sent.
pub async fn relay<C, R>(client: C, remote: R, session: &Session) -> Result<RelayEnd>
where
    C: AsyncRead + AsyncWrite,
    R: AsyncRead + AsyncWrite,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (remote_read, remote_write) = tokio::io::split(remote);

    let upstream = pump(client_read, remote_write, |n| session.add_received(n));
    let downstream = pump(remote_read, client_write, |n| session.add_sent(n));

    tokio::select! {
        result = upstream => result.map(|()| RelayEnd::ClientClosed),
        result = downstream => result.map(|()| RelayEnd::RemoteClosed),
    }
}
