//! Authenticated encryption for session traffic and sealed storage
//!
//! XChaCha20-Poly1305 with a fresh random 24-byte nonce prepended to every
//! ciphertext: `nonce || ciphertext || tag`. The Poly1305 tag is the only
//! integrity check applied to wire data, so decryption fails closed on any
//! tampering.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;

use super::{CryptoError, CryptoResult};

/// XChaCha20 nonce length in bytes
pub const NONCE_LEN: usize = 24;

/// Poly1305 tag length in bytes
pub const TAG_LEN: usize = 16;

/// Symmetric key length in bytes
pub const KEY_LEN: usize = 32;

/// Size buckets for padded payloads; payloads larger than the last bucket
/// round up to the next 8 KiB multiple.
const PAD_BUCKETS: &[usize] = &[256, 512, 1024, 2048, 4096, 8192];

/// Encrypt `plaintext` under `key`, binding `associated_data` into the tag
///
/// Returns `nonce || ciphertext || tag` with a fresh random nonce.
pub fn seal(key: &[u8], plaintext: &[u8], associated_data: &[u8]) -> CryptoResult<Vec<u8>> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::InvalidKeyLength {
            expected: KEY_LEN,
            got: key.len(),
        });
    }
    if plaintext.is_empty() {
        return Err(CryptoError::EncryptionFailed(
            "refusing to encrypt empty plaintext".to_string(),
        ));
    }

    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));

    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: associated_data,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a `nonce || ciphertext || tag` blob produced by [`seal`]
///
/// The same `associated_data` must be supplied or the tag check fails.
pub fn open(key: &[u8], blob: &[u8], associated_data: &[u8]) -> CryptoResult<Vec<u8>> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::InvalidKeyLength {
            expected: KEY_LEN,
            got: key.len(),
        });
    }
    if blob.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::DecryptionFailed(format!(
            "ciphertext too short: {} bytes",
            blob.len()
        )));
    }

    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);

    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: associated_data,
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed("authentication tag mismatch".to_string()))
}

/// Pad a payload up to the next size bucket so a passive observer cannot
/// read transfer sizes off the wire. Layout: 8-byte LE length, data, zeros.
pub fn pad_payload(data: &[u8]) -> Vec<u8> {
    let needed = data.len() + 8;
    let target = PAD_BUCKETS
        .iter()
        .copied()
        .find(|&bucket| bucket >= needed)
        .unwrap_or_else(|| (needed + 8191) / 8192 * 8192);

    let mut out = Vec::with_capacity(target);
    out.extend_from_slice(&(data.len() as u64).to_le_bytes());
    out.extend_from_slice(data);
    out.resize(target, 0);
    out
}

/// Recover the original payload from its padded form
pub fn unpad_payload(data: &[u8]) -> CryptoResult<Vec<u8>> {
    if data.len() < 8 {
        return Err(CryptoError::DecryptionFailed(
            "padded payload too short".to_string(),
        ));
    }

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&data[..8]);
    let len = u64::from_le_bytes(len_bytes) as usize;

    if len > data.len() - 8 {
        return Err(CryptoError::DecryptionFailed(
            "padded payload length prefix out of range".to_string(),
        ));
    }

    Ok(data[8..8 + len].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut key);
        key
    }

    #[test]
    fn test_seal_open_round_trip() {
        let key = test_key();
        let blob = seal(&key, b"sync payload", b"ad").unwrap();
        let plain = open(&key, &blob, b"ad").unwrap();
        assert_eq!(plain, b"sync payload");
    }

    #[test]
    fn test_blob_layout() {
        let key = test_key();
        let blob = seal(&key, b"abc", b"").unwrap();
        assert_eq!(blob.len(), NONCE_LEN + 3 + TAG_LEN);
    }

    #[test]
    fn test_empty_plaintext_rejected() {
        let key = test_key();
        assert!(seal(&key, b"", b"").is_err());
    }

    #[test]
    fn test_unique_nonces() {
        let key = test_key();
        let a = seal(&key, b"same message", b"").unwrap();
        let b = seal(&key, b"same message", b"").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
        assert_ne!(a, b);
    }

    // --- Security tests ---

    #[test]
    fn test_wrong_key_fails() {
        let blob = seal(&test_key(), b"secret", b"").unwrap();
        assert!(open(&test_key(), &blob, b"").is_err());
    }

    #[test]
    fn test_tampered_nonce_fails() {
        let key = test_key();
        let mut blob = seal(&key, b"secret", b"").unwrap();
        blob[0] ^= 0x01;
        assert!(open(&key, &blob, b"").is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = test_key();
        let mut blob = seal(&key, b"secret", b"").unwrap();
        blob[NONCE_LEN] ^= 0x01;
        assert!(open(&key, &blob, b"").is_err());
    }

    #[test]
    fn test_tampered_tag_fails() {
        let key = test_key();
        let mut blob = seal(&key, b"secret", b"").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(open(&key, &blob, b"").is_err());
    }

    #[test]
    fn test_truncated_blob_fails() {
        let key = test_key();
        let blob = seal(&key, b"secret", b"").unwrap();
        assert!(open(&key, &blob[..NONCE_LEN + TAG_LEN - 1], b"").is_err());
        assert!(open(&key, &blob[..blob.len() - 1], b"").is_err());
    }

    #[test]
    fn test_mismatched_associated_data_fails() {
        let key = test_key();
        let blob = seal(&key, b"secret", b"message-type-1").unwrap();
        assert!(open(&key, &blob, b"message-type-2").is_err());
        assert!(open(&key, &blob, b"").is_err());
    }

    #[test]
    fn test_invalid_key_length() {
        assert!(matches!(
            seal(&[0u8; 16], b"data", b""),
            Err(CryptoError::InvalidKeyLength { expected: 32, got: 16 })
        ));
    }

    // --- Padding tests ---

    #[test]
    fn test_padding_buckets() {
        assert_eq!(pad_payload(&[7u8; 10]).len(), 256);
        assert_eq!(pad_payload(&[7u8; 250]).len(), 512);
        assert_eq!(pad_payload(&[7u8; 1000]).len(), 1024);
        assert_eq!(pad_payload(&[7u8; 8184]).len(), 8192);
    }

    #[test]
    fn test_padding_overflow_rounds_to_next_block() {
        assert_eq!(pad_payload(&[7u8; 8190]).len(), 16384);
        assert_eq!(pad_payload(&[7u8; 20000]).len(), 24576);
    }

    #[test]
    fn test_pad_unpad_round_trip() {
        let data = vec![42u8; 1234];
        assert_eq!(unpad_payload(&pad_payload(&data)).unwrap(), data);

        let empty: Vec<u8> = Vec::new();
        assert_eq!(unpad_payload(&pad_payload(&empty)).unwrap(), empty);
    }

    #[test]
    fn test_unpad_rejects_bad_prefix() {
        assert!(unpad_payload(&[0u8; 4]).is_err());

        let mut padded = pad_payload(b"hello");
        padded[0] = 0xFF;
        padded[1] = 0xFF;
        assert!(unpad_payload(&padded).is_err());
    }
}
