//! Argon2id key derivation for the vault passphrase
//!
//! The derived key is deterministic for identical passphrase and parameters,
//! so every replica of a vault derives the same key from the shared
//! passphrase. Derivation parameters (including the salt) are persisted in
//! the vault metadata and travel with the vault.

use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use super::{cipher, CryptoError, CryptoResult};

/// Salt length in bytes
pub const SALT_LEN: usize = 16;

/// Derived vault key length in bytes
pub const VAULT_KEY_LEN: usize = 32;

/// Floor values below which derivation is refused
const MIN_MEM_COST: u32 = 65_536; // 64 MiB
const MIN_TIME_COST: u32 = 3;
const MIN_PARALLELISM: u32 = 4;

/// Known plaintext sealed under the vault key at creation time; opening it
/// again is the unlock check.
const KEY_CHECK_PLAINTEXT: &[u8] = b"quillspace-key-check-v1";
const KEY_CHECK_AD: &[u8] = b"key-check";

/// Argon2id parameters, persisted alongside the vault
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Random salt, generated once at vault creation
    pub salt: [u8; SALT_LEN],
    /// Memory cost in KiB
    pub mem_cost: u32,
    /// Number of passes
    pub time_cost: u32,
    /// Degree of parallelism
    pub parallelism: u32,
    /// Derived key length in bytes
    pub output_length: usize,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            salt: [0u8; SALT_LEN],
            mem_cost: 262_144, // 256 MiB
            time_cost: 3,
            parallelism: 4,
            output_length: VAULT_KEY_LEN,
        }
    }
}

impl KdfParams {
    /// Generate parameters with a fresh random salt
    pub fn generate() -> Self {
        let mut params = Self::default();
        rand::rngs::OsRng.fill_bytes(&mut params.salt);
        params
    }

    /// Reject parameters weaker than the accepted floors
    pub fn validate(&self) -> CryptoResult<()> {
        if self.mem_cost < MIN_MEM_COST {
            return Err(CryptoError::KdfFailed(format!(
                "memory cost {} KiB is below the {} KiB minimum",
                self.mem_cost, MIN_MEM_COST
            )));
        }
        if self.time_cost < MIN_TIME_COST {
            return Err(CryptoError::KdfFailed(format!(
                "time cost {} is below the minimum of {}",
                self.time_cost, MIN_TIME_COST
            )));
        }
        if self.parallelism < MIN_PARALLELISM {
            return Err(CryptoError::KdfFailed(format!(
                "parallelism {} is below the minimum of {}",
                self.parallelism, MIN_PARALLELISM
            )));
        }
        if self.output_length != VAULT_KEY_LEN {
            return Err(CryptoError::InvalidKeyLength {
                expected: VAULT_KEY_LEN,
                got: self.output_length,
            });
        }
        Ok(())
    }
}

/// Vault key derived from the user's passphrase, zeroed on drop
pub struct VaultKey {
    key: [u8; VAULT_KEY_LEN],
}

impl VaultKey {
    pub fn from_bytes(key: [u8; VAULT_KEY_LEN]) -> Self {
        Self { key }
    }

    pub fn as_bytes(&self) -> &[u8; VAULT_KEY_LEN] {
        &self.key
    }
}

impl Drop for VaultKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("VaultKey(..)")
    }
}

/// Derive the vault key from a passphrase with Argon2id
///
/// CPU and memory heavy by construction; callers on an async runtime must
/// run this on a blocking thread.
pub fn derive_vault_key(password: &[u8], params: &KdfParams) -> CryptoResult<VaultKey> {
    params.validate()?;

    let argon_params = Params::new(
        params.mem_cost,
        params.time_cost,
        params.parallelism,
        Some(params.output_length),
    )
    .map_err(|e| CryptoError::KdfFailed(e.to_string()))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut output = [0u8; VAULT_KEY_LEN];
    argon2
        .hash_password_into(password, &params.salt, &mut output)
        .map_err(|e| CryptoError::KdfFailed(e.to_string()))?;

    Ok(VaultKey::from_bytes(output))
}

/// Produce the key-check blob stored at vault creation
pub fn make_key_check(key: &VaultKey) -> CryptoResult<Vec<u8>> {
    cipher::seal(key.as_bytes(), KEY_CHECK_PLAINTEXT, KEY_CHECK_AD)
}

/// Verify a derived key against the stored key-check blob
///
/// Takes the same time on success and failure so unlock attempts leak
/// nothing through timing.
pub fn verify_vault_key(key: &VaultKey, key_check: &[u8]) -> bool {
    let ok = matches!(
        cipher::open(key.as_bytes(), key_check, KEY_CHECK_AD),
        Ok(ref plain) if plain.as_slice() == KEY_CHECK_PLAINTEXT
    );
    std::thread::sleep(std::time::Duration::from_millis(200));
    ok
}
