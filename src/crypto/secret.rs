//! The operator-configured proxy secret.
//!
//! Externally a secret is 32 hex characters; internally it is 16 raw bytes
//! that are zeroized on drop.

use std::fmt;
use std::str::FromStr;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{SecureRandom, SECRET_SIZE};
use crate::error::{Error, Result};

/// Shared 16-byte secret known to the proxy and its legitimate clients.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ProxySecret([u8; SECRET_SIZE]);

impl ProxySecret {
    /// Parse a secret from its hex form.
    ///
    /// Surrounding whitespace is ignored and upper-case digits are accepted.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let hex_str = hex_str.trim();
        if hex_str.len() != SECRET_SIZE * 2 {
            return Err(Error::crypto(format!(
                "invalid secret length: {} hex characters, expected {}",
                hex_str.len(),
                SECRET_SIZE * 2
            )));
        }

        let mut bytes = [0u8; SECRET_SIZE];
        hex::decode_to_slice(hex_str, &mut bytes)
            .map_err(|e| Error::crypto(format!("invalid secret hex: {}", e)))?;
        Ok(Self(bytes))
    }

    /// Wrap raw secret bytes.
    pub fn from_bytes(bytes: [u8; SECRET_SIZE]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random secret.
    pub fn random() -> Self {
        Self(SecureRandom::bytes())
    }

    /// Raw secret bytes.
    ///
    /// # Security
    ///
    /// Handle with care - this is secret key material.
    pub fn as_bytes(&self) -> &[u8; SECRET_SIZE] {
        &self.0
    }

    /// Lowercase hex form, as handed to clients.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for ProxySecret {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

// Only the first and last two bytes are ever printed.
impl fmt::Debug for ProxySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "ProxySecret({}…{})", &hex[..4], &hex[hex.len() - 4..])
    }
}
