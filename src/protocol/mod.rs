//! Client-facing wire protocol.
//!
//! A client opens with a fixed 64-byte preamble; the proxy answers with 32
//! bytes of AES-CTR ciphertext and from then on relays raw bytes without any
//! framing. The [`message`] module holds the MTProto-style encrypted message
//! envelope built on the same key derivation.

pub mod handshake;
pub mod message;

pub use handshake::{AuthSession, HandshakePreamble, HandshakeStage, ServerHandshake};
pub use message::EncryptedMessage;

use std::time::Duration;

/// Size of the client preamble in bytes
pub const PREAMBLE_SIZE: usize = 64;

/// Size of the server response in bytes
pub const RESPONSE_SIZE: usize = 32;

/// Offset of the client nonce inside the preamble
pub const CLIENT_NONCE_OFFSET: usize = 8;

/// Length of the endpoint selector prefix of the preamble
pub const SELECTOR_SIZE: usize = 16;

/// Default time allowed for the client to deliver its preamble
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
