//! # MTProxy
//!
//! A relay proxy that terminates an obfuscated client handshake and forwards
//! raw traffic to a remote data center chosen during the handshake.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │   Server (accept loop, maintenance, admin handle)       │
//! ├─────────────────────────────────────────────────────────┤
//! │   SecurityPolicy (allow/deny lists, caps, rate window)  │
//! ├─────────────────────────────────────────────────────────┤
//! │   Handshake (64-byte preamble, 32-byte CTR response)    │
//! ├─────────────────────────────────────────────────────────┤
//! │   Relay (two 8 KiB pumps per session)                   │
//! ├─────────────────────────────────────────────────────────┤
//! │   Crypto (AES-256 CTR/IGE, SHA-256/SHA-1/MD5 KDF)       │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! The handshake and endpoint selection are a simplified scheme and are not
//! wire-compatible with any deployed obfuscation protocol.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

use std::time::Duration;

pub mod crypto;
pub mod endpoint;
pub mod error;
pub mod protocol;

#[cfg(feature = "server")]
pub mod proxy;

#[cfg(feature = "server")]
pub mod server;

pub use error::{Error, RejectReason, Result};

/// Time allowed for the client preamble
pub const HANDSHAKE_TIMEOUT: Duration = protocol::DEFAULT_HANDSHAKE_TIMEOUT;

/// Time allowed for connecting to a data center
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on a whole session
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(300);
