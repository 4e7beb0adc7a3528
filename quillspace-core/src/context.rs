//! The unlocked vault handle
//!
//! A [`VaultContext`] is the single entry point to an unlocked vault: it owns
//! the derived vault key, the device identity, the database handle, and the
//! sync event channel. There is no ambient "current vault"; everything that
//! needs the vault takes a context. Dropping the context locks the vault and
//! zeroes the key material.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto::{
    derive_vault_key, make_key_check, verify_vault_key, CryptoError, KdfParams, VaultKey,
};
use crate::database::schema::CURRENT_SCHEMA_VERSION;
use crate::database::{
    Database, DatabaseError, EntityState, PeerInfo, SyncHistoryEntry, TrustLevel, VaultMetadata,
};
use crate::platform;
use crate::sync::change_tracker::{self, EntityWrite};
use crate::sync::config::SyncSettings;
use crate::sync::conflict::{self, ConflictRecord, MergePolicy, Resolution};
use crate::sync::device::{self, DeviceIdentity};
use crate::sync::events::{SyncEvent, SyncEvents};
use crate::sync::models::MutationRecord;
use crate::{Result, SyncCoreError};

/// What a new device needs to become a replica of an existing vault
///
/// Carries the sync space id and the Argon2id parameters (salt included) so
/// every replica derives the same vault key from the shared passphrase. The
/// key check lets the joining device reject a mistyped passphrase locally.
/// None of this is secret; the passphrase still travels only through the
/// user's head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaSeed {
    pub space_id: Uuid,
    pub kdf_params: KdfParams,
    pub key_check: Vec<u8>,
}

impl ReplicaSeed {
    /// Encode for out-of-band transfer (base64 over JSON)
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self)
            .map_err(|e| SyncCoreError::InvalidInput(format!("seed encoding failed: {e}")))?;
        Ok(BASE64.encode(json))
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        let json = BASE64
            .decode(encoded.trim())
            .map_err(|e| SyncCoreError::InvalidInput(format!("invalid replica seed: {e}")))?;
        serde_json::from_slice(&json)
            .map_err(|e| SyncCoreError::InvalidInput(format!("invalid replica seed: {e}")))
    }
}

/// An unlocked vault
pub struct VaultContext {
    identity: DeviceIdentity,
    vault_key: VaultKey,
    db: Arc<Mutex<Database>>,
    settings: RwLock<SyncSettings>,
    policy: MergePolicy,
    events: SyncEvents,
    space_id: Uuid,
}

impl VaultContext {
    /// Create a brand-new vault with its own sync space
    pub async fn create(
        path: impl AsRef<Path>,
        passphrase: &str,
        device_name: &str,
    ) -> Result<Self> {
        let path = path.as_ref();
        prepare_path(path)?;
        check_passphrase(passphrase)?;

        let params = KdfParams::generate();
        let vault_key = derive_key(passphrase, params.clone()).await?;
        let key_check = make_key_check(&vault_key)?;

        let context =
            Self::materialize(path, vault_key, params, key_check, Uuid::new_v4(), device_name)?;
        info!(
            vault = %path.display(),
            device = %context.identity.device_id,
            space = %context.space_id,
            "vault created"
        );
        Ok(context)
    }

    /// Create a replica of an existing vault on this device
    ///
    /// The passphrase must be the one the seed's vault was created with; a
    /// wrong passphrase is rejected here, before any peer is contacted.
    pub async fn create_replica(
        path: impl AsRef<Path>,
        passphrase: &str,
        device_name: &str,
        seed: &ReplicaSeed,
    ) -> Result<Self> {
        let path = path.as_ref();
        prepare_path(path)?;
        check_passphrase(passphrase)?;

        let vault_key = derive_key(passphrase, seed.kdf_params.clone()).await?;
        if !verify_vault_key(&vault_key, &seed.key_check) {
            return Err(CryptoError::AuthenticationFailed.into());
        }

        let context = Self::materialize(
            path,
            vault_key,
            seed.kdf_params.clone(),
            seed.key_check.clone(),
            seed.space_id,
            device_name,
        )?;
        info!(
            vault = %path.display(),
            device = %context.identity.device_id,
            space = %context.space_id,
            "replica vault created"
        );
        Ok(context)
    }

    /// Unlock an existing vault
    pub async fn unlock(path: impl AsRef<Path>, passphrase: &str) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SyncCoreError::NotFound(format!(
                "no vault at {}",
                path.display()
            )));
        }

        let db = Database::open(path)?;
        let meta = db
            .read_vault_metadata()?
            .ok_or_else(|| SyncCoreError::NotFound("vault metadata".to_string()))?;

        let vault_key = derive_key(passphrase, meta.kdf_params.clone()).await?;
        if !verify_vault_key(&vault_key, &meta.key_check) {
            return Err(CryptoError::AuthenticationFailed.into());
        }

        let identity = DeviceIdentity::load_or_create(
            db.conn(),
            &vault_key,
            &platform::default_device_name(),
        )?;
        let settings = SyncSettings::load(db.conn())?;

        info!(device = %identity.device_id, space = %meta.default_space_id, "vault unlocked");
        Ok(Self::assemble(
            db,
            identity,
            vault_key,
            settings,
            meta.default_space_id,
        ))
    }

    fn materialize(
        path: &Path,
        vault_key: VaultKey,
        kdf_params: KdfParams,
        key_check: Vec<u8>,
        space_id: Uuid,
        device_name: &str,
    ) -> Result<Self> {
        let db = Database::open(path)?;
        db.write_vault_metadata(&VaultMetadata {
            schema_version: CURRENT_SCHEMA_VERSION,
            kdf_params,
            key_check,
            default_space_id: space_id,
            created_at: Utc::now().timestamp_millis(),
        })?;

        let identity = DeviceIdentity::generate(device_name);
        identity.save_to_db(db.conn(), &vault_key)?;

        let settings = SyncSettings::default();
        settings.save(db.conn())?;

        Ok(Self::assemble(db, identity, vault_key, settings, space_id))
    }

    fn assemble(
        db: Database,
        identity: DeviceIdentity,
        vault_key: VaultKey,
        settings: SyncSettings,
        space_id: Uuid,
    ) -> Self {
        Self {
            identity,
            vault_key,
            db: Arc::new(Mutex::new(db)),
            settings: RwLock::new(settings),
            policy: MergePolicy::builtin(),
            events: SyncEvents::new(),
            space_id,
        }
    }

    pub fn device_id(&self) -> Uuid {
        self.identity.device_id
    }

    pub fn device_name(&self) -> &str {
        &self.identity.device_name
    }

    /// SHA-256 fingerprint of this device's public key
    pub fn fingerprint(&self) -> String {
        self.identity.fingerprint()
    }

    pub fn space_id(&self) -> Uuid {
        self.space_id
    }

    pub fn policy(&self) -> &MergePolicy {
        &self.policy
    }

    pub fn events(&self) -> &SyncEvents {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the current sync settings
    pub fn settings(&self) -> SyncSettings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Apply a settings change and persist it
    pub fn update_settings<F: FnOnce(&mut SyncSettings)>(&self, apply: F) -> Result<()> {
        let mut guard = self.settings.write().unwrap_or_else(|e| e.into_inner());
        apply(&mut guard);
        let db = self.lock_db()?;
        guard.save(db.conn())?;
        Ok(())
    }

    /// Export what another device needs to join this vault's sync space
    pub fn replica_seed(&self) -> Result<ReplicaSeed> {
        let db = self.lock_db()?;
        let meta = db
            .read_vault_metadata()?
            .ok_or_else(|| SyncCoreError::NotFound("vault metadata".to_string()))?;
        Ok(ReplicaSeed {
            space_id: meta.default_space_id,
            kdf_params: meta.kdf_params,
            key_check: meta.key_check,
        })
    }

    /// Record a local entity write; the mutation will flow to peers
    pub fn record_write(&self, write: &EntityWrite) -> Result<MutationRecord> {
        let db = self.lock_db()?;
        let record =
            change_tracker::record_local_mutation(db.conn(), &self.identity.device_id, write)?;
        Ok(record)
    }

    pub fn entity(&self, entity_id: &Uuid) -> Result<Option<EntityState>> {
        let db = self.lock_db()?;
        Ok(change_tracker::get_entity(db.conn(), entity_id)?)
    }

    pub fn entities(&self) -> Result<Vec<EntityState>> {
        let db = self.lock_db()?;
        Ok(change_tracker::list_entities(db.conn(), &self.space_id)?)
    }

    pub fn pending_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        let db = self.lock_db()?;
        Ok(conflict::list_pending(db.conn(), &self.space_id)?)
    }

    /// Settle a pending conflict; the decision propagates as a new mutation
    pub fn resolve_conflict(
        &self,
        conflict_id: i64,
        resolution: Resolution,
    ) -> Result<MutationRecord> {
        let db = self.lock_db()?;
        conflict::resolve_conflict(db.conn(), &self.identity.device_id, conflict_id, resolution)?
            .ok_or_else(|| SyncCoreError::NotFound(format!("pending conflict {conflict_id}")))
    }

    pub fn peers(&self) -> Result<Vec<PeerInfo>> {
        let db = self.lock_db()?;
        Ok(device::list_peers(db.conn())?)
    }

    /// Change a peer's trust level; `Revoked` blocks future sessions
    pub fn set_peer_trust(&self, device_id: &Uuid, trust: TrustLevel) -> Result<bool> {
        let db = self.lock_db()?;
        Ok(device::set_peer_trust(db.conn(), device_id, trust)?)
    }

    pub fn sync_history(&self, limit: usize) -> Result<Vec<SyncHistoryEntry>> {
        let db = self.lock_db()?;
        Ok(db.list_sync_history(limit)?)
    }

    pub(crate) fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub(crate) fn vault_key(&self) -> &VaultKey {
        &self.vault_key
    }

    pub(crate) fn db(&self) -> &Mutex<Database> {
        &self.db
    }

    pub(crate) fn lock_db(&self) -> Result<MutexGuard<'_, Database>> {
        self.db
            .lock()
            .map_err(|_| DatabaseError::LockPoisoned("vault database".to_string()).into())
    }

    /// Context over an in-memory vault with a fixed key, for tests
    #[cfg(test)]
    pub(crate) fn for_tests(space_id: Uuid, device_name: &str) -> Self {
        let db = Database::in_memory().expect("in-memory database");
        let vault_key = VaultKey::from_bytes([7u8; 32]);
        db.write_vault_metadata(&VaultMetadata {
            schema_version: CURRENT_SCHEMA_VERSION,
            kdf_params: KdfParams::generate(),
            key_check: make_key_check(&vault_key).expect("key check"),
            default_space_id: space_id,
            created_at: Utc::now().timestamp_millis(),
        })
        .expect("vault metadata");

        let identity = DeviceIdentity::generate(device_name);
        identity.save_to_db(db.conn(), &vault_key).expect("identity");

        let settings = SyncSettings {
            handshake_timeout_secs: 2,
            idle_timeout_secs: 10,
            ..SyncSettings::default()
        };
        Self::assemble(db, identity, vault_key, settings, space_id)
    }
}

/// Run Argon2id off the async scheduler
async fn derive_key(passphrase: &str, params: KdfParams) -> Result<VaultKey> {
    let passphrase = Zeroizing::new(passphrase.as_bytes().to_vec());
    let key = tokio::task::spawn_blocking(move || derive_vault_key(&passphrase, &params))
        .await
        .map_err(|e| CryptoError::KdfFailed(format!("key derivation task failed: {e}")))??;
    Ok(key)
}

fn prepare_path(path: &Path) -> Result<()> {
    if path.exists() {
        return Err(SyncCoreError::InvalidInput(format!(
            "vault already exists at {}",
            path.display()
        )));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn check_passphrase(passphrase: &str) -> Result<()> {
    if passphrase.is_empty() {
        return Err(SyncCoreError::InvalidInput(
            "passphrase must not be empty".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_vault_create_unlock_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.db");

        let created = VaultContext::create(&path, "correct horse battery", "alpha")
            .await
            .unwrap();
        let created_device = created.device_id();
        let created_space = created.space_id();
        drop(created);

        let wrong = VaultContext::unlock(&path, "wrong passphrase").await;
        assert!(matches!(
            wrong,
            Err(SyncCoreError::Crypto(CryptoError::AuthenticationFailed))
        ));

        let unlocked = VaultContext::unlock(&path, "correct horse battery")
            .await
            .unwrap();
        assert_eq!(unlocked.device_id(), created_device);
        assert_eq!(unlocked.space_id(), created_space);
        assert_eq!(unlocked.device_name(), "alpha");
    }

    #[tokio::test]
    async fn test_replica_shares_space_and_secret() {
        let dir = tempfile::tempdir().unwrap();
        let original = VaultContext::create(dir.path().join("a.db"), "same passphrase", "alpha")
            .await
            .unwrap();

        let seed = original.replica_seed().unwrap();
        let encoded = seed.encode().unwrap();
        let decoded = ReplicaSeed::decode(&encoded).unwrap();
        assert_eq!(decoded, seed);

        let replica = VaultContext::create_replica(
            dir.path().join("b.db"),
            "same passphrase",
            "beta",
            &decoded,
        )
        .await
        .unwrap();
        assert_eq!(replica.space_id(), original.space_id());
        assert_ne!(replica.device_id(), original.device_id());
    }

    #[tokio::test]
    async fn test_create_refuses_existing_path_before_deriving() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("occupied.db");
        std::fs::write(&path, b"not a vault").unwrap();

        let res = VaultContext::create(&path, "pw", "alpha").await;
        assert!(matches!(res, Err(SyncCoreError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_empty_passphrase_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let res = VaultContext::create(dir.path().join("v.db"), "", "alpha").await;
        assert!(matches!(res, Err(SyncCoreError::InvalidInput(_))));
    }

    #[test]
    fn test_record_write_flows_into_entity_table() {
        let context = VaultContext::for_tests(Uuid::new_v4(), "test");
        let entity_id = Uuid::new_v4();
        let write = EntityWrite::snapshot(
            entity_id,
            "note",
            context.space_id(),
            serde_json::json!({"title": "hello", "body": "world"}),
        );

        let record = context.record_write(&write).unwrap();
        assert_eq!(record.logical_clock, 1);

        let entities = context.entities().unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].entity_id, entity_id);
        assert!(context.pending_conflicts().unwrap().is_empty());
    }

    #[test]
    fn test_malformed_replica_seed_rejected() {
        assert!(ReplicaSeed::decode("not base64 at all!!!").is_err());
        assert!(ReplicaSeed::decode(&BASE64.encode(b"{\"nope\":1}")).is_err());
    }
}
