//! Device identity and the peer registry
//!
//! The identity keypair is generated once per vault and never silently
//! rotated; its secret is sealed under the vault key at rest. Peers pin the
//! public key they first saw (trust on first use). A changed key is recorded
//! and surfaced but does not block the session; only an explicit revocation
//! does.

use std::collections::HashMap;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use uuid::Uuid;
use zeroize::Zeroizing;

use super::clock::VectorClock;
use crate::crypto::{open, seal, DeviceKeyPair, VaultKey};
use crate::database::schema::parse_uuid;
use crate::database::{DatabaseError, DbResult, PeerInfo, TrustLevel};
use crate::Result;

const IDENTITY_AAD: &[u8] = b"device-identity";

/// This device's sync identity
pub struct DeviceIdentity {
    pub device_id: Uuid,
    pub device_name: String,
    pub keypair: DeviceKeyPair,
}

impl DeviceIdentity {
    /// Generate a new identity with a fresh P-256 keypair
    pub fn generate(device_name: &str) -> Self {
        Self {
            device_id: Uuid::new_v4(),
            device_name: device_name.to_string(),
            keypair: DeviceKeyPair::generate(),
        }
    }

    /// Compressed SEC1 public key, as advertised to peers
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.keypair.public_key_bytes()
    }

    /// SHA-256 of the public key, lowercase hex; shown to users for manual
    /// verification
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.keypair.public_key_bytes()))
    }

    /// Store the identity, sealing the secret scalar under the vault key
    pub fn save_to_db(&self, conn: &Connection, vault_key: &VaultKey) -> Result<()> {
        let sealed = seal(
            vault_key.as_bytes(),
            &Zeroizing::new(self.keypair.secret_bytes()),
            IDENTITY_AAD,
        )?;

        conn.execute(
            "INSERT INTO device_identity (id, device_id, device_name, public_key,
                                          secret_key, created_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET device_name = excluded.device_name",
            params![
                self.device_id.to_string(),
                self.device_name,
                self.keypair.public_key_bytes(),
                sealed,
                Utc::now().timestamp_millis()
            ],
        )
        .map_err(DatabaseError::Sqlite)?;

        Ok(())
    }

    /// Load the stored identity, if any
    pub fn load_from_db(conn: &Connection, vault_key: &VaultKey) -> Result<Option<Self>> {
        let result = conn.query_row(
            "SELECT device_id, device_name, secret_key FROM device_identity WHERE id = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            },
        );

        match result {
            Ok((device_id, device_name, sealed)) => {
                let device_id = parse_uuid(&device_id)?;
                let secret = Zeroizing::new(open(vault_key.as_bytes(), &sealed, IDENTITY_AAD)?);
                let keypair = DeviceKeyPair::from_secret_bytes(&secret)?;
                Ok(Some(Self {
                    device_id,
                    device_name,
                    keypair,
                }))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DatabaseError::Sqlite(e).into()),
        }
    }

    /// Load the identity or create one on first unlock. An existing identity
    /// is never regenerated; peers pin our public key.
    pub fn load_or_create(
        conn: &Connection,
        vault_key: &VaultKey,
        device_name: &str,
    ) -> Result<Self> {
        if let Some(identity) = Self::load_from_db(conn, vault_key)? {
            return Ok(identity);
        }
        let identity = Self::generate(device_name);
        identity.save_to_db(conn, vault_key)?;
        Ok(identity)
    }
}

/// Outcome of checking a peer's presented key against the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCheck {
    /// First contact; the key is now pinned with first-use trust
    Pinned,
    /// Key matches the pinned one
    Match,
    /// Key differs from the pinned one; the new key is recorded and the
    /// change is surfaced to the user
    Changed,
    /// Peer was revoked; the session must be refused
    Revoked,
}

/// Pin or verify a peer's public key during the handshake
pub fn check_and_pin_peer(
    conn: &Connection,
    device_id: &Uuid,
    device_name: &str,
    public_key: &[u8],
) -> DbResult<KeyCheck> {
    let now = Utc::now().timestamp_millis();
    let Some(peer) = get_peer(conn, device_id)? else {
        conn.execute(
            "INSERT INTO peers (device_id, device_name, public_key, trust,
                                first_seen, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                device_id.to_string(),
                device_name,
                public_key,
                TrustLevel::FirstUse.as_str(),
                now
            ],
        )?;
        return Ok(KeyCheck::Pinned);
    };

    if peer.trust == TrustLevel::Revoked {
        return Ok(KeyCheck::Revoked);
    }

    if peer.public_key == public_key {
        conn.execute(
            "UPDATE peers SET device_name = ?1, last_seen = ?2 WHERE device_id = ?3",
            params![device_name, now, device_id.to_string()],
        )?;
        return Ok(KeyCheck::Match);
    }

    conn.execute(
        "UPDATE peers SET device_name = ?1, public_key = ?2, trust = ?3, last_seen = ?4
         WHERE device_id = ?5",
        params![
            device_name,
            public_key,
            TrustLevel::KeyChanged.as_str(),
            now,
            device_id.to_string()
        ],
    )?;
    Ok(KeyCheck::Changed)
}

/// Register or refresh a peer without touching its pinned key
pub fn upsert_peer(
    conn: &Connection,
    device_id: &Uuid,
    device_name: &str,
    public_key: &[u8],
) -> DbResult<()> {
    let now = Utc::now().timestamp_millis();
    conn.execute(
        "INSERT INTO peers (device_id, device_name, public_key, trust, first_seen, last_seen)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)
         ON CONFLICT(device_id) DO UPDATE SET
             device_name = excluded.device_name,
             last_seen = excluded.last_seen",
        params![
            device_id.to_string(),
            device_name,
            public_key,
            TrustLevel::FirstUse.as_str(),
            now
        ],
    )?;
    Ok(())
}

pub fn get_peer(conn: &Connection, device_id: &Uuid) -> DbResult<Option<PeerInfo>> {
    let row = conn
        .query_row(
            "SELECT device_id, device_name, public_key, trust, first_seen, last_seen,
                    last_sync_at
             FROM peers WHERE device_id = ?1",
            params![device_id.to_string()],
            peer_row,
        )
        .optional()?;
    row.map(decode_peer_row).transpose()
}

pub fn list_peers(conn: &Connection) -> DbResult<Vec<PeerInfo>> {
    let mut stmt = conn.prepare(
        "SELECT device_id, device_name, public_key, trust, first_seen, last_seen,
                last_sync_at
         FROM peers ORDER BY last_seen DESC",
    )?;
    let rows = stmt.query_map([], peer_row)?;

    let mut out = Vec::new();
    for row in rows {
        out.push(decode_peer_row(row?)?);
    }
    Ok(out)
}

/// Change a peer's trust level; false if the peer is unknown
pub fn set_peer_trust(conn: &Connection, device_id: &Uuid, trust: TrustLevel) -> DbResult<bool> {
    let updated = conn.execute(
        "UPDATE peers SET trust = ?1 WHERE device_id = ?2",
        params![trust.as_str(), device_id.to_string()],
    )?;
    Ok(updated > 0)
}

/// Record a completed sync round with a peer
pub fn touch_peer_sync(conn: &Connection, device_id: &Uuid, when: i64) -> DbResult<()> {
    conn.execute(
        "UPDATE peers SET last_sync_at = ?1, last_seen = ?1 WHERE device_id = ?2",
        params![when, device_id.to_string()],
    )?;
    Ok(())
}

/// Merge a newly acknowledged clock into the peer's stored ack state
///
/// The ack state feeds log pruning: a mutation may leave the log only when
/// every peer's acked clock covers it.
pub fn update_peer_acked(
    conn: &Connection,
    device_id: &Uuid,
    space_id: &Uuid,
    clock: &VectorClock,
) -> DbResult<()> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT acked_state FROM peers WHERE device_id = ?1",
            params![device_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    let Some(raw) = raw else {
        return Ok(());
    };

    let mut acked: HashMap<Uuid, VectorClock> =
        serde_json::from_str(&raw).map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    acked.entry(*space_id).or_default().merge(clock);

    let raw = serde_json::to_string(&acked)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    conn.execute(
        "UPDATE peers SET acked_state = ?1 WHERE device_id = ?2",
        params![raw, device_id.to_string()],
    )?;
    Ok(())
}

/// Every registered peer's acked clock for a space; peers that never acked
/// anything contribute an empty clock
pub fn load_peer_acked_clocks(conn: &Connection, space_id: &Uuid) -> DbResult<Vec<VectorClock>> {
    let mut stmt = conn.prepare("SELECT acked_state FROM peers")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

    let mut out = Vec::new();
    for row in rows {
        let acked: HashMap<Uuid, VectorClock> = serde_json::from_str(&row?)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        out.push(acked.get(space_id).cloned().unwrap_or_default());
    }
    Ok(out)
}

type PeerRow = (String, String, Vec<u8>, String, i64, i64, Option<i64>);

fn peer_row(row: &rusqlite::Row) -> rusqlite::Result<PeerRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn decode_peer_row(row: PeerRow) -> DbResult<PeerInfo> {
    let (device_id, device_name, public_key, trust, first_seen, last_seen, last_sync_at) = row;
    let trust = TrustLevel::parse(&trust)
        .ok_or_else(|| DatabaseError::Other(format!("unknown trust level: {trust}")))?;

    Ok(PeerInfo {
        device_id: parse_uuid(&device_id)?,
        device_name,
        public_key,
        trust,
        first_seen,
        last_seen,
        last_sync_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::kdf::VAULT_KEY_LEN;
    use crate::database::Database;

    fn vault_key() -> VaultKey {
        VaultKey::from_bytes([7u8; VAULT_KEY_LEN])
    }

    #[test]
    fn generate_device_identity() {
        let identity = DeviceIdentity::generate("Test Device");
        assert_eq!(identity.device_name, "Test Device");
        // Compressed SEC1 point
        assert_eq!(identity.public_key_bytes().len(), 33);
        assert_eq!(identity.fingerprint().len(), 64);
    }

    #[test]
    fn different_identities_have_different_keys() {
        let a = DeviceIdentity::generate("Device A");
        let b = DeviceIdentity::generate("Device B");
        assert_ne!(a.device_id, b.device_id);
        assert_ne!(a.public_key_bytes(), b.public_key_bytes());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let db = Database::in_memory().unwrap();
        let key = vault_key();

        let identity = DeviceIdentity::generate("Test Laptop");
        identity.save_to_db(db.conn(), &key).unwrap();

        let loaded = DeviceIdentity::load_from_db(db.conn(), &key)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.device_id, identity.device_id);
        assert_eq!(loaded.device_name, "Test Laptop");
        assert_eq!(loaded.public_key_bytes(), identity.public_key_bytes());
    }

    #[test]
    fn load_from_empty_db_returns_none() {
        let db = Database::in_memory().unwrap();
        let loaded = DeviceIdentity::load_from_db(db.conn(), &vault_key()).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn load_or_create_never_regenerates() {
        let db = Database::in_memory().unwrap();
        let key = vault_key();

        let first = DeviceIdentity::load_or_create(db.conn(), &key, "desk").unwrap();
        let second = DeviceIdentity::load_or_create(db.conn(), &key, "renamed").unwrap();

        assert_eq!(first.device_id, second.device_id);
        assert_eq!(first.public_key_bytes(), second.public_key_bytes());
        // The stored name is untouched by a later load
        assert_eq!(second.device_name, "desk");
    }

    // --- Security tests ---

    #[test]
    fn wrong_vault_key_cannot_load_identity() {
        let db = Database::in_memory().unwrap();
        let identity = DeviceIdentity::generate("Test");
        identity.save_to_db(db.conn(), &vault_key()).unwrap();

        let wrong = VaultKey::from_bytes([8u8; VAULT_KEY_LEN]);
        assert!(DeviceIdentity::load_from_db(db.conn(), &wrong).is_err());
    }

    #[test]
    fn first_contact_pins_key() {
        let db = Database::in_memory().unwrap();
        let peer = Uuid::new_v4();

        let check = check_and_pin_peer(db.conn(), &peer, "phone", &[2u8; 33]).unwrap();
        assert_eq!(check, KeyCheck::Pinned);

        let info = get_peer(db.conn(), &peer).unwrap().unwrap();
        assert_eq!(info.trust, TrustLevel::FirstUse);
        assert_eq!(info.public_key, vec![2u8; 33]);

        let check = check_and_pin_peer(db.conn(), &peer, "phone", &[2u8; 33]).unwrap();
        assert_eq!(check, KeyCheck::Match);
    }

    #[test]
    fn changed_key_is_recorded_but_allowed() {
        let db = Database::in_memory().unwrap();
        let peer = Uuid::new_v4();
        check_and_pin_peer(db.conn(), &peer, "phone", &[2u8; 33]).unwrap();

        let check = check_and_pin_peer(db.conn(), &peer, "phone", &[3u8; 33]).unwrap();
        assert_eq!(check, KeyCheck::Changed);

        let info = get_peer(db.conn(), &peer).unwrap().unwrap();
        assert_eq!(info.trust, TrustLevel::KeyChanged);
        // The new key is pinned going forward
        assert_eq!(info.public_key, vec![3u8; 33]);
    }

    #[test]
    fn revoked_peer_is_refused_and_key_untouched() {
        let db = Database::in_memory().unwrap();
        let peer = Uuid::new_v4();
        check_and_pin_peer(db.conn(), &peer, "phone", &[2u8; 33]).unwrap();
        assert!(set_peer_trust(db.conn(), &peer, TrustLevel::Revoked).unwrap());

        let check = check_and_pin_peer(db.conn(), &peer, "phone", &[9u8; 33]).unwrap();
        assert_eq!(check, KeyCheck::Revoked);

        let info = get_peer(db.conn(), &peer).unwrap().unwrap();
        assert_eq!(info.public_key, vec![2u8; 33]);
        assert_eq!(info.trust, TrustLevel::Revoked);
    }

    #[test]
    fn trust_update_on_unknown_peer_reports_false() {
        let db = Database::in_memory().unwrap();
        assert!(!set_peer_trust(db.conn(), &Uuid::new_v4(), TrustLevel::Verified).unwrap());
    }

    #[test]
    fn trust_levels_round_trip_through_registry_strings() {
        let levels = [
            TrustLevel::Unknown,
            TrustLevel::FirstUse,
            TrustLevel::Verified,
            TrustLevel::KeyChanged,
            TrustLevel::Revoked,
        ];
        for level in levels {
            assert_eq!(TrustLevel::parse(level.as_str()), Some(level));
        }
        assert_eq!(TrustLevel::parse("trusted"), None);
    }

    #[test]
    fn acked_clocks_merge_monotonically() {
        let db = Database::in_memory().unwrap();
        let peer = Uuid::new_v4();
        let space = Uuid::new_v4();
        let origin = Uuid::new_v4();
        upsert_peer(db.conn(), &peer, "phone", &[2u8; 33]).unwrap();

        let mut acked = VectorClock::new();
        acked.observe(origin, 5);
        update_peer_acked(db.conn(), &peer, &space, &acked).unwrap();

        // A stale ack cannot roll the stored clock back
        let mut stale = VectorClock::new();
        stale.observe(origin, 2);
        update_peer_acked(db.conn(), &peer, &space, &stale).unwrap();

        let clocks = load_peer_acked_clocks(db.conn(), &space).unwrap();
        assert_eq!(clocks.len(), 1);
        assert_eq!(clocks[0].get(&origin), 5);

        // A peer that never acked this space contributes an empty clock
        let other_space = Uuid::new_v4();
        let clocks = load_peer_acked_clocks(db.conn(), &other_space).unwrap();
        assert!(clocks[0].is_empty());
    }
}
