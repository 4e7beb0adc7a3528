//! Row types shared across the storage and sync layers

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::KdfParams;

/// Current materialized state of one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: Uuid,
    pub entity_type: String,
    pub space_id: Uuid,
    /// Local write counter, bumped on every applied mutation
    pub revision: i64,
    /// Wall-clock of the last applied write, unix milliseconds (advisory)
    pub updated_at: i64,
    /// Application fields as a JSON object; opaque to the sync layer except
    /// where a merge policy names a field
    pub payload: serde_json::Value,
    /// Tombstone flag; deleted entities keep their row for convergence
    pub deleted: bool,
    /// Device that produced the last applied mutation
    pub origin_device_id: Uuid,
    /// Logical clock of the last applied mutation
    pub logical_clock: u64,
}

/// Single-row vault bootstrap state
#[derive(Debug, Clone)]
pub struct VaultMetadata {
    pub schema_version: i32,
    pub kdf_params: KdfParams,
    /// Known plaintext sealed under the vault key; opening it is the unlock
    /// check
    pub key_check: Vec<u8>,
    pub default_space_id: Uuid,
    pub created_at: i64,
}

/// Trust standing of a peer device
///
/// `Unknown` is the standing of a device with no registry row; pinning a key
/// moves it to `FirstUse`, so stored rows never hold it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// Never paired; no key on record
    Unknown,
    /// Key pinned on first contact, never confirmed by the operator
    FirstUse,
    /// Operator confirmed the key fingerprint out of band
    Verified,
    /// Advertised key no longer matches the pinned one
    KeyChanged,
    /// Operator refused this device; sessions are rejected
    Revoked,
}

impl TrustLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::Unknown => "unknown",
            TrustLevel::FirstUse => "first_use",
            TrustLevel::Verified => "verified",
            TrustLevel::KeyChanged => "key_changed",
            TrustLevel::Revoked => "revoked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unknown" => Some(TrustLevel::Unknown),
            "first_use" => Some(TrustLevel::FirstUse),
            "verified" => Some(TrustLevel::Verified),
            "key_changed" => Some(TrustLevel::KeyChanged),
            "revoked" => Some(TrustLevel::Revoked),
            _ => None,
        }
    }
}

/// Peer device as recorded in the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub device_id: Uuid,
    pub device_name: String,
    /// Pinned SEC1 public key from the first completed handshake
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub public_key: Vec<u8>,
    pub trust: TrustLevel,
    pub first_seen: i64,
    pub last_seen: i64,
    pub last_sync_at: Option<i64>,
}

/// One completed or failed sync round, for the audit trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncHistoryEntry {
    pub entry_id: i64,
    pub peer_device_id: Uuid,
    pub space_id: Uuid,
    pub started_at: i64,
    pub duration_ms: i64,
    pub sent: u32,
    pub received: u32,
    pub applied: u32,
    pub skipped: u32,
    pub conflicts: u32,
    pub outcome: String,
}
