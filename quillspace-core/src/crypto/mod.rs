//! Cryptographic primitives for vault and session security
//!
//! Pure transformation layer: key derivation, key agreement, and
//! authenticated encryption. Nothing in this module performs I/O.

pub mod cipher;
pub mod kdf;
pub mod keys;

pub use cipher::{open, pad_payload, seal, unpad_payload, NONCE_LEN, TAG_LEN};
pub use kdf::{derive_vault_key, make_key_check, verify_vault_key, KdfParams, VaultKey};
pub use keys::{
    derive_auth_key, derive_session_key, parse_peer_public_key, AuthKey, DeviceKeyPair,
    SessionContext, SessionKey, SESSION_KEY_LEN,
};

use thiserror::Error;

/// Errors from cryptographic operations.
///
/// Every variant is fatal to the session it occurred in; callers must tear
/// the session down rather than retry with the same key material.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KdfFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Peer public key is not a valid curve point: {0}")]
    InvalidPeerKey(String),

    #[error("Stored secret key is invalid: {0}")]
    InvalidSecretKey(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Authentication failed")]
    AuthenticationFailed,
}

pub type CryptoResult<T> = std::result::Result<T, CryptoError>;
