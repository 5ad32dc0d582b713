//! AES-256 block cipher modes.
//!
//! CTR is used for the handshake response; IGE is the chaining mode of the
//! encrypted message format. Both take the first 32 bytes of the key and the
//! first 16 (CTR) or 32 (IGE) bytes of the IV, and reject anything shorter.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::{Aes256, Block};

use crate::crypto::{AES_KEY_SIZE, BLOCK_SIZE, CTR_IV_SIZE, IGE_IV_SIZE};
use crate::error::{Error, Result};

/// AES-256 with a 128-bit big-endian counter.
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Apply the AES-256-CTR keystream to `data`.
///
/// CTR is self-inverse, so this both encrypts and decrypts.
fn apply_ctr(data: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
    if key.len() < AES_KEY_SIZE {
        return Err(Error::crypto(format!(
            "AES-CTR key too short: {} bytes, need {}",
            key.len(),
            AES_KEY_SIZE
        )));
    }
    if iv.len() < CTR_IV_SIZE {
        return Err(Error::crypto(format!(
            "AES-CTR IV too short: {} bytes, need {}",
            iv.len(),
            CTR_IV_SIZE
        )));
    }

    let mut cipher = Aes256Ctr::new_from_slices(&key[..AES_KEY_SIZE], &iv[..CTR_IV_SIZE])
        .map_err(|_| Error::crypto("AES-CTR initialization failed"))?;

    let mut buf = data.to_vec();
    cipher.apply_keystream(&mut buf);
    Ok(buf)
}

/// Encrypt with AES-256-CTR.
pub fn encrypt_ctr(data: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
    apply_ctr(data, key, iv)
}

/// Decrypt with AES-256-CTR.
pub fn decrypt_ctr(data: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
    apply_ctr(data, key, iv)
}

fn check_ige_args(data: &[u8], key: &[u8], iv: &[u8]) -> Result<()> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(Error::crypto(format!(
            "IGE data length {} is not a multiple of {}",
            data.len(),
            BLOCK_SIZE
        )));
    }
    if key.len() < AES_KEY_SIZE {
        return Err(Error::crypto(format!(
            "IGE key too short: {} bytes, need {}",
            key.len(),
            AES_KEY_SIZE
        )));
    }
    if iv.len() < IGE_IV_SIZE {
        return Err(Error::crypto(format!(
            "IGE IV too short: {} bytes, need {}",
            iv.len(),
            IGE_IV_SIZE
        )));
    }
    Ok(())
}

/// Split an IGE IV into its two chaining blocks.
fn split_iv(iv: &[u8]) -> ([u8; BLOCK_SIZE], [u8; BLOCK_SIZE]) {
    let mut iv1 = [0u8; BLOCK_SIZE];
    let mut iv2 = [0u8; BLOCK_SIZE];
    iv1.copy_from_slice(&iv[..BLOCK_SIZE]);
    iv2.copy_from_slice(&iv[BLOCK_SIZE..IGE_IV_SIZE]);
    (iv1, iv2)
}

fn xor_in_place(dst: &mut [u8], other: &[u8; BLOCK_SIZE]) {
    for (d, o) in dst.iter_mut().zip(other.iter()) {
        *d ^= o;
    }
}

/// Encrypt with AES-256-IGE.
///
/// `C_i = E(P_i ^ iv1) ^ iv2`, then `iv1 = C_i`, `iv2 = P_i`.
pub fn encrypt_ige(data: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
    check_ige_args(data, key, iv)?;

    let cipher = Aes256::new_from_slice(&key[..AES_KEY_SIZE])
        .map_err(|_| Error::crypto("AES-IGE initialization failed"))?;
    let (mut iv1, mut iv2) = split_iv(iv);

    let mut out = Vec::with_capacity(data.len());
    for plain in data.chunks_exact(BLOCK_SIZE) {
        let mut block = Block::clone_from_slice(plain);
        xor_in_place(&mut block, &iv1);
        cipher.encrypt_block(&mut block);
        xor_in_place(&mut block, &iv2);

        out.extend_from_slice(&block);
        iv1.copy_from_slice(&block);
        iv2.copy_from_slice(plain);
    }

    Ok(out)
}

/// Decrypt with AES-256-IGE.
///
/// `P_i = D(C_i ^ iv2) ^ iv1`, then `iv1 = C_i`, `iv2 = P_i`.
pub fn decrypt_ige(data: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
    check_ige_args(data, key, iv)?;

    let cipher = Aes256::new_from_slice(&key[..AES_KEY_SIZE])
        .map_err(|_| Error::crypto("AES-IGE initialization failed"))?;
    let (mut iv1, mut iv2) = split_iv(iv);

    let mut out = Vec::with_capacity(data.len());
    for encrypted in data.chunks_exact(BLOCK_SIZE) {
        let mut block = Block::clone_from_slice(encrypted);
        xor_in_place(&mut block, &iv2);
        cipher.decrypt_block(&mut block);
        xor_in_place(&mut block, &iv1);

        out.extend_from_slice(&block);
        iv1.copy_from_slice(encrypted);
        iv2.copy_from_slice(&block);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecureRandom;

    #[test]
    fn test_ctr_round_trip_various_lengths() {
        let key: [u8; 32] = SecureRandom::bytes();
        let iv: [u8; 16] = SecureRandom::bytes();

        for len in [0usize, 1, 15, 16, 17, 50, 8192] {
            let plaintext = SecureRandom::vec(len);
            let ciphertext = encrypt_ctr(&plaintext, &key, &iv).unwrap();
            assert_eq!(ciphertext.len(), len);
            if len >= 16 {
                assert_ne!(ciphertext, plaintext);
            }
            assert_eq!(decrypt_ctr(&ciphertext, &key, &iv).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_ctr_uses_key_and_iv_prefix() {
        let key = [0x11u8; 48];
        let iv = [0x22u8; 32];
        let data = b"Hello, World! This is a test message for AES-CTR.";

        let long = encrypt_ctr(data, &key, &iv).unwrap();
        let exact = encrypt_ctr(data, &key[..32], &iv[..16]).unwrap();
        assert_eq!(long, exact);
    }

    #[test]
    fn test_ctr_rejects_short_key_or_iv() {
        assert!(encrypt_ctr(b"data", &[0u8; 16], &[0u8; 16]).is_err());
        assert!(encrypt_ctr(b"data", &[0u8; 32], &[0u8; 8]).is_err());
    }

    #[test]
    fn test_ctr_nist_vector() {
        // NIST SP 800-38A F.5.5, CTR-AES256.Encrypt, first block
        let key = hex::decode("603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4")
            .unwrap();
        let iv = hex::decode("f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff").unwrap();
        let plaintext = hex::decode("6bc1bee22e409f96e93d7e117393172a").unwrap();

        let ciphertext = encrypt_ctr(&plaintext, &key, &iv).unwrap();
        assert_eq!(hex::encode(ciphertext), "601ec313775789a5b7a7f504bbf3d228");
    }

    #[test]
    fn test_ige_round_trip() {
        let key: [u8; 32] = SecureRandom::bytes();
        let iv: [u8; 32] = SecureRandom::bytes();

        for blocks in [1usize, 2, 3, 64] {
            let plaintext = SecureRandom::vec(blocks * BLOCK_SIZE);
            let ciphertext = encrypt_ige(&plaintext, &key, &iv).unwrap();
            assert_eq!(ciphertext.len(), plaintext.len());
            assert_ne!(ciphertext, plaintext);
            assert_eq!(decrypt_ige(&ciphertext, &key, &iv).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_ige_chains_blocks() {
        let key = [0x42u8; 32];
        let iv = [0x24u8; 32];
        let plaintext = [b'A'; 32];

        let ciphertext = encrypt_ige(&plaintext, &key, &iv).unwrap();
        // Identical plaintext blocks must not produce identical ciphertext blocks
        assert_ne!(&ciphertext[..16], &ciphertext[16..]);
    }

    #[test]
    fn test_ige_rejects_invalid_input() {
        let key = [0u8; 32];
        let iv = [0u8; 32];

        assert!(matches!(
            encrypt_ige(b"invalid_length", &key, &iv),
            Err(Error::Crypto(_))
        ));
        assert!(encrypt_ige(&[0u8; 16], b"short_key", &iv).is_err());
        assert!(encrypt_ige(&[0u8; 16], &key, b"short_iv").is_err());
        assert!(decrypt_ige(&[0u8; 17], &key, &iv).is_err());
        assert!(decrypt_ige(&[0u8; 16], &key, &[0u8; 31]).is_err());
    }
}
