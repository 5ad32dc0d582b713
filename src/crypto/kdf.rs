//! Key derivation and digest helpers.
//!
//! Message keys and AES key/IV pairs follow the MTProto 2.0 layout: the
//! `incoming` flag selects an 8-byte offset `x` into the auth key so that the
//! two directions never share key material.

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::crypto::{AES_KEY_SIZE, IGE_IV_SIZE, MSG_KEY_SIZE};
use crate::error::{Error, Result};

/// SHA-1 digest.
pub fn sha1(data: &[u8]) -> [u8; 20] {
    Sha1::digest(data).into()
}

/// SHA-256 digest.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// MD5 digest.
pub fn md5(data: &[u8]) -> [u8; 16] {
    Md5::digest(data).into()
}

/// SHA-256 over the concatenation of `parts`.
pub(crate) fn sha256_parts(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// MD5 over the concatenation of `parts`.
pub(crate) fn md5_parts(parts: &[&[u8]]) -> [u8; 16] {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn direction_offset(incoming: bool) -> usize {
    if incoming {
        0
    } else {
        8
    }
}

/// Compute the 16-byte message key for `data`.
///
/// `SHA256(auth_key[88+x .. 120+x] ‖ data)[..16]`. The auth key must cover
/// the whole slice, i.e. at least 120 bytes incoming and 128 outgoing.
pub fn msg_key(auth_key: &[u8], data: &[u8], incoming: bool) -> Result<[u8; MSG_KEY_SIZE]> {
    let x = direction_offset(incoming);
    let start = 88 + x;
    let end = start + 32;

    if auth_key.len() < end {
        return Err(Error::crypto(format!(
            "auth key too short for msg_key: {} bytes, need {}",
            auth_key.len(),
            end
        )));
    }

    let digest = sha256_parts(&[&auth_key[start..end], data]);
    let mut key = [0u8; MSG_KEY_SIZE];
    key.copy_from_slice(&digest[..MSG_KEY_SIZE]);
    Ok(key)
}

/// Derive the AES key and IGE IV for one message.
///
/// ```text
/// a   = SHA256(msg_key ‖ auth_key[x .. x+36])
/// b   = SHA256(auth_key[x+40 .. x+76] ‖ msg_key)
/// key = a[0..8]  ‖ b[8..24] ‖ a[24..32]
/// iv  = b[0..8]  ‖ a[8..24] ‖ b[24..32]
/// ```
pub fn derive_aes_key_iv(
    auth_key: &[u8],
    msg_key: &[u8],
    incoming: bool,
) -> Result<([u8; AES_KEY_SIZE], [u8; IGE_IV_SIZE])> {
    if msg_key.len() != MSG_KEY_SIZE {
        return Err(Error::crypto(format!(
            "invalid msg_key length: {}, expected {}",
            msg_key.len(),
            MSG_KEY_SIZE
        )));
    }

    let x = direction_offset(incoming);
    if auth_key.len() < x + 76 {
        return Err(Error::crypto(format!(
            "auth key too short for key derivation: {} bytes, need {}",
            auth_key.len(),
            x + 76
        )));
    }

    let a = sha256_parts(&[msg_key, &auth_key[x..x + 36]]);
    let b = sha256_parts(&[&auth_key[x + 40..x + 76], msg_key]);

    let mut key = [0u8; AES_KEY_SIZE];
    key[..8].copy_from_slice(&a[..8]);
    key[8..24].copy_from_slice(&b[8..24]);
    key[24..].copy_from_slice(&a[24..32]);

    let mut iv = [0u8; IGE_IV_SIZE];
    iv[..8].copy_from_slice(&b[..8]);
    iv[8..24].copy_from_slice(&a[8..24]);
    iv[24..].copy_from_slice(&b[24..32]);

    Ok((key, iv))
}
