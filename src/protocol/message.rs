//! MTProto-style encrypted message envelope.
//!
//! ```text
//! +----------------+-------------+-------------------------+
//! | auth_key_id u64 LE | msg_key 16B | AES-IGE(padded data) |
//! +----------------+-------------+-------------------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::crypto::{
    decrypt_ige, derive_aes_key_iv, encrypt_ige, msg_key, pad_random, BLOCK_SIZE, MSG_KEY_SIZE,
};
use crate::error::{Error, Result};

/// Header length: auth key id plus msg key.
pub const HEADER_SIZE: usize = 8 + MSG_KEY_SIZE;

/// One encrypted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedMessage {
    /// Identifier of the auth key the message is sealed with
    pub auth_key_id: u64,
    /// Message key, also the integrity check
    pub msg_key: [u8; MSG_KEY_SIZE],
    /// IGE ciphertext
    pub encrypted_data: Bytes,
}

impl EncryptedMessage {
    /// Parse a message from the wire.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::protocol(format!(
                "encrypted message too short: {} bytes, need at least {}",
                data.len(),
                HEADER_SIZE
            )));
        }

        let mut buf = data;
        let auth_key_id = buf.get_u64_le();
        let mut msg_key = [0u8; MSG_KEY_SIZE];
        buf.copy_to_slice(&mut msg_key);

        Ok(Self {
            auth_key_id,
            msg_key,
            encrypted_data: Bytes::copy_from_slice(buf),
        })
    }

    /// Serialize to the wire format.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.encrypted_data.len());
        buf.put_u64_le(self.auth_key_id);
        buf.put_slice(&self.msg_key);
        buf.put_slice(&self.encrypted_data);
        buf.freeze()
    }

    /// Pad, key and encrypt `plaintext`.
    pub fn seal(auth_key_id: u64, auth_key: &[u8], plaintext: &[u8], incoming: bool) -> Result<Self> {
        let padded = pad_random(plaintext, BLOCK_SIZE)?;
        let msg_key = msg_key(auth_key, &padded, incoming)?;
        let (key, iv) = derive_aes_key_iv(auth_key, &msg_key, incoming)?;
        let encrypted = encrypt_ige(&padded, &key, &iv)?;

        Ok(Self {
            auth_key_id,
            msg_key,
            encrypted_data: Bytes::from(encrypted),
        })
    }

    /// Decrypt and verify the message.
    ///
    /// Returns the padded plaintext. A message key that does not match the
    /// decrypted data is a crypto error.
    pub fn open(&self, auth_key: &[u8], incoming: bool) -> Result<Vec<u8>> {
        let (key, iv) = derive_aes_key_iv(auth_key, &self.msg_key, incoming)?;
        let plaintext = decrypt_ige(&self.encrypted_data, &key, &iv)?;

        let expected = msg_key(auth_key, &plaintext, incoming)?;
        if expected != self.msg_key {
            return Err(Error::crypto("msg_key mismatch"));
        }
        Ok(plaintext)
    }

    /// Heuristic check for an encrypted message: long enough and a non-zero
    /// auth key id.
    pub fn looks_encrypted(data: &[u8]) -> bool {
        if data.len() < HEADER_SIZE {
            return false;
        }
        let mut buf = data;
        buf.get_u64_le() != 0
    }
}
