//! Device keypairs and session key agreement
//!
//! Each device holds a long-lived P-256 keypair. A session key is agreed via
//! ECDH and expanded with HKDF-SHA256 over a transcript of both device ids
//! and both handshake nonces, so the key is bound to this peer pair and this
//! handshake. A second HKDF expansion mixes in the vault key to produce the
//! challenge-response authentication key.

use hkdf::Hkdf;
use p256::ecdh::diffie_hellman;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::RngCore;
use sha2::Sha256;
use uuid::Uuid;
use zeroize::Zeroize;

use super::kdf::VaultKey;
use super::{CryptoError, CryptoResult};

/// Session and auth key length in bytes
pub const SESSION_KEY_LEN: usize = 32;

/// Handshake nonce length in bytes
pub const HANDSHAKE_NONCE_LEN: usize = 16;

const SESSION_INFO: &[u8] = b"quillspace-session-v1";
const AUTH_INFO: &[u8] = b"quillspace-auth-v1";

/// Long-lived P-256 keypair identifying a device
#[derive(Clone)]
pub struct DeviceKeyPair {
    secret: SecretKey,
}

impl DeviceKeyPair {
    /// Generate a fresh keypair; called once per device identity
    pub fn generate() -> Self {
        Self {
            secret: SecretKey::random(&mut rand::rngs::OsRng),
        }
    }

    /// Restore a keypair from the raw secret scalar
    pub fn from_secret_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        let secret = SecretKey::from_slice(bytes)
            .map_err(|e| CryptoError::InvalidSecretKey(e.to_string()))?;
        Ok(Self { secret })
    }

    /// Raw secret scalar, for sealing at rest under the vault key
    pub fn secret_bytes(&self) -> Vec<u8> {
        self.secret.to_bytes().to_vec()
    }

    /// Compressed SEC1 encoding of the public key, as sent in handshakes
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.secret
            .public_key()
            .to_encoded_point(true)
            .as_bytes()
            .to_vec()
    }
}

/// Parse a peer's SEC1 public key, rejecting anything off the curve
pub fn parse_peer_public_key(bytes: &[u8]) -> CryptoResult<PublicKey> {
    PublicKey::from_sec1_bytes(bytes).map_err(|e| CryptoError::InvalidPeerKey(e.to_string()))
}

/// Handshake transcript both sides share before key derivation
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub local_device_id: Uuid,
    pub remote_device_id: Uuid,
    pub local_nonce: [u8; HANDSHAKE_NONCE_LEN],
    pub remote_nonce: [u8; HANDSHAKE_NONCE_LEN],
}

impl SessionContext {
    /// Fresh random handshake nonce
    pub fn new_nonce() -> [u8; HANDSHAKE_NONCE_LEN] {
        let mut nonce = [0u8; HANDSHAKE_NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        nonce
    }

    /// HKDF salt: `(device_id, nonce)` pairs ordered by device id, so both
    /// peers derive the identical salt regardless of who initiated.
    pub fn salt_bytes(&self) -> Vec<u8> {
        let mut pairs = [
            (self.local_device_id, self.local_nonce),
            (self.remote_device_id, self.remote_nonce),
        ];
        pairs.sort_by_key(|(id, _)| *id);

        let mut salt = Vec::with_capacity(2 * (16 + HANDSHAKE_NONCE_LEN));
        for (id, nonce) in pairs {
            salt.extend_from_slice(id.as_bytes());
            salt.extend_from_slice(&nonce);
        }
        salt
    }
}

/// Symmetric session key, zeroed on drop
pub struct SessionKey {
    key: [u8; SESSION_KEY_LEN],
}

impl SessionKey {
    pub fn from_bytes(key: [u8; SESSION_KEY_LEN]) -> Self {
        Self { key }
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.key
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Challenge-response key binding the vault secret to one session
pub struct AuthKey {
    key: [u8; SESSION_KEY_LEN],
}

impl AuthKey {
    pub fn from_bytes(key: [u8; SESSION_KEY_LEN]) -> Self {
        Self { key }
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.key
    }
}

impl Drop for AuthKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthKey(..)")
    }
}

/// Agree on a session key with a peer
///
/// ECDH over P-256, then HKDF-SHA256 with the transcript salt. Both sides
/// arrive at the same key; nobody else can without one of the secret keys.
pub fn derive_session_key(
    local: &DeviceKeyPair,
    peer_public_sec1: &[u8],
    context: &SessionContext,
) -> CryptoResult<SessionKey> {
    let peer = parse_peer_public_key(peer_public_sec1)?;
    let shared = diffie_hellman(local.secret.to_nonzero_scalar(), peer.as_affine());

    let salt = context.salt_bytes();
    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared.raw_secret_bytes());

    let mut key = [0u8; SESSION_KEY_LEN];
    hkdf.expand(SESSION_INFO, &mut key)
        .map_err(|e| CryptoError::KdfFailed(e.to_string()))?;

    Ok(SessionKey::from_bytes(key))
}

/// Derive the authentication key for challenge-response
///
/// Mixes the vault key into the session key material, so a valid proof
/// demonstrates knowledge of the vault passphrase for this session only.
pub fn derive_auth_key(
    vault_key: &VaultKey,
    session_key: &SessionKey,
    context: &SessionContext,
) -> CryptoResult<AuthKey> {
    let mut ikm = Vec::with_capacity(64);
    ikm.extend_from_slice(vault_key.as_bytes());
    ikm.extend_from_slice(session_key.as_bytes());

    let salt = context.salt_bytes();
    let hkdf = Hkdf::<Sha256>::new(Some(&salt), &ikm);

    let mut key = [0u8; SESSION_KEY_LEN];
    let expanded = hkdf.expand(AUTH_INFO, &mut key);
    ikm.zeroize();
    expanded.map_err(|e| CryptoError::KdfFailed(e.to_string()))?;

    Ok(AuthKey::from_bytes(key))
}
