//! Secure random number generation.
//!
//! Provides cryptographically secure random bytes using the operating
//! system's entropy source.

use rand::RngCore;
use rand_core::OsRng;

use crate::error::{Error, Result};

/// Cryptographically secure random number generator.
///
/// Wraps the OS-provided entropy source (e.g., /dev/urandom on Unix,
/// BCryptGenRandom on Windows).
pub struct SecureRandom;

impl SecureRandom {
    /// Fill a buffer with cryptographically secure random bytes.
    pub fn fill(dest: &mut [u8]) {
        OsRng.fill_bytes(dest);
    }

    /// Generate a fixed-size array of random bytes.
    pub fn bytes<const N: usize>() -> [u8; N] {
        let mut buf = [0u8; N];
        OsRng.fill_bytes(&mut buf);
        buf
    }

    /// Generate `len` random bytes.
    pub fn vec(len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        OsRng.fill_bytes(&mut buf);
        buf
    }
}

/// Generate random padding of the specified length.
pub fn random_padding(len: usize) -> Vec<u8> {
    SecureRandom::vec(len)
}

/// Pad `data` up to the next multiple of `block_size` with random bytes.
///
/// Always appends between 1 and `block_size` bytes, never zero: data that is
/// already aligned gains a whole extra block.
pub fn pad_random(data: &[u8], block_size: usize) -> Result<Vec<u8>> {
    if block_size == 0 {
        return Err(Error::crypto("padding block size must be non-zero"));
    }

    let padding_len = block_size - (data.len() % block_size);
    let mut padded = Vec::with_capacity(data.len() + padding_len);
    padded.extend_from_slice(data);
    padded.extend_from_slice(&random_padding(padding_len));
    Ok(padded)
}
