//! Cryptographic primitives for the proxy.
//!
//! This module provides:
//! - The operator-configured [`ProxySecret`]
//! - AES-256 in CTR and IGE modes
//! - Auth-key, msg-key and AES key/IV derivation
//! - SHA-1 / SHA-256 / MD5 helpers and secure random generation
//!
//! Every function is pure over byte buffers. The only state is the loaded
//! secret held by [`CryptoEngine`].

mod cipher;
pub mod kdf;
mod random;
mod secret;

pub use cipher::{decrypt_ctr, decrypt_ige, encrypt_ctr, encrypt_ige};
pub use kdf::{derive_aes_key_iv, md5, msg_key, sha1, sha256};
pub use random::{pad_random, random_padding, SecureRandom};
pub use secret::ProxySecret;

use crate::error::{Error, Result};

/// Size of the proxy secret in bytes
pub const SECRET_SIZE: usize = 16;

/// Size of handshake nonces in bytes
pub const NONCE_SIZE: usize = 16;

/// Size of the derived session auth key (SHA-256 output)
pub const AUTH_KEY_SIZE: usize = 32;

/// AES-256 key size
pub const AES_KEY_SIZE: usize = 32;

/// AES block size
pub const BLOCK_SIZE: usize = 16;

/// IV size for CTR mode (one counter block)
pub const CTR_IV_SIZE: usize = 16;

/// IV size for IGE mode (two chaining blocks)
pub const IGE_IV_SIZE: usize = 32;

/// Size of an MTProto-style message key
pub const MSG_KEY_SIZE: usize = 16;

/// Holds the loaded secret and derives per-session key material from it.
#[derive(Clone, Debug)]
pub struct CryptoEngine {
    secret: ProxySecret,
}

impl CryptoEngine {
    /// Create an engine from a 32-character hex secret.
    pub fn new(secret_hex: &str) -> Result<Self> {
        let secret = ProxySecret::from_hex(secret_hex)?;
        tracing::debug!("crypto engine initialized with secret {:?}", secret);
        Ok(Self { secret })
    }

    /// Create an engine from an already-parsed secret.
    pub fn from_secret(secret: ProxySecret) -> Self {
        Self { secret }
    }

    /// The loaded secret.
    pub fn secret(&self) -> &ProxySecret {
        &self.secret
    }

    /// Derive the session auth key and IV from the two handshake nonces.
    ///
    /// `auth_key = SHA256(client ‖ server ‖ secret)` and
    /// `iv = MD5(server ‖ client ‖ secret[..8])`.
    pub fn derive_auth_key(
        &self,
        client_nonce: &[u8],
        server_nonce: &[u8],
    ) -> Result<([u8; AUTH_KEY_SIZE], [u8; CTR_IV_SIZE])> {
        if client_nonce.len() != NONCE_SIZE || server_nonce.len() != NONCE_SIZE {
            return Err(Error::crypto(format!(
                "invalid nonce length: client {}, server {}, expected {}",
                client_nonce.len(),
                server_nonce.len(),
                NONCE_SIZE
            )));
        }

        let secret = self.secret.as_bytes();
        let auth_key = kdf::sha256_parts(&[client_nonce, server_nonce, &secret[..]]);
        let iv = kdf::md5_parts(&[server_nonce, client_nonce, &secret[..8]]);

        Ok((auth_key, iv))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET_HEX: &str = "00112233445566778899aabbccddeeff";

    #[test]
    fn test_engine_from_valid_secret() {
        let engine = CryptoEngine::new(SECRET_HEX).unwrap();
        assert_eq!(engine.secret().to_hex(), SECRET_HEX);
    }

    #[test]
    fn test_engine_rejects_short_secret() {
        let err = CryptoEngine::new(&"a".repeat(30)).unwrap_err();
        assert!(matches!(err, Error::Crypto(_)));
    }

    #[test]
    fn test_derive_auth_key() {
        let engine = CryptoEngine::new(SECRET_HEX).unwrap();
        let client_nonce: [u8; 16] = SecureRandom::bytes();
        let server_nonce: [u8; 16] = SecureRandom::bytes();

        let (auth_key, iv) = engine.derive_auth_key(&client_nonce, &server_nonce).unwrap();
        assert_eq!(auth_key.len(), AUTH_KEY_SIZE);
        assert_eq!(iv.len(), CTR_IV_SIZE);
        assert_ne!(&auth_key[..16], &iv[..]);

        // Deterministic for the same inputs
        let (again, again_iv) = engine.derive_auth_key(&client_nonce, &server_nonce).unwrap();
        assert_eq!(auth_key, again);
        assert_eq!(iv, again_iv);

        // Nonce order matters
        let (swapped, _) = engine.derive_auth_key(&server_nonce, &client_nonce).unwrap();
        assert_ne!(auth_key, swapped);
    }

    #[test]
    fn test_derive_auth_key_matches_formula() {
        let engine = CryptoEngine::new(SECRET_HEX).unwrap();
        let client_nonce = [0x01u8; 16];
        let server_nonce = [0x02u8; 16];
        let secret = engine.secret().as_bytes().to_vec();

        let (auth_key, iv) = engine.derive_auth_key(&client_nonce, &server_nonce).unwrap();

        let expected_key = sha256(&[&client_nonce[..], &server_nonce[..], &secret[..]].concat());
        let expected_iv = md5(&[&server_nonce[..], &client_nonce[..], &secret[..8]].concat());
        assert_eq!(auth_key, expected_key);
        assert_eq!(iv, expected_iv);
    }

    #[test]
    fn test_invalid_nonce_length() {
        let engine = CryptoEngine::new(SECRET_HEX).unwrap();
        let nonce = [0u8; 16];

        assert!(engine.derive_auth_key(b"short", &nonce).is_err());
        assert!(engine.derive_auth_key(&nonce, b"short").is_err());
    }
}
