//! Sync settings stored in the local database

use serde::{Deserialize, Serialize};

use crate::database::{DatabaseError, DbResult};

/// Tunables for discovery, sessions, and transfer
///
/// One row per vault. Missing table or row loads as defaults, so settings
/// survive schema upgrades without a migration step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// TCP port the sync listener binds; 0 lets the OS pick and the actual
    /// port is advertised over mDNS
    pub listen_port: u16,
    pub handshake_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub batch_max_records: usize,
    pub batch_max_bytes: usize,
    /// Peers not re-advertised within this window drop out of the candidate
    /// list
    pub discovery_stale_secs: u64,
    pub auth_max_attempts: u32,
    pub auth_base_lockout_secs: u64,
    pub last_sync_at: Option<i64>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            listen_port: 0,
            handshake_timeout_secs: 10,
            idle_timeout_secs: 300,
            batch_max_records: 500,
            batch_max_bytes: 256 * 1024,
            discovery_stale_secs: 60,
            auth_max_attempts: 5,
            auth_base_lockout_secs: 60,
            last_sync_at: None,
        }
    }
}

impl SyncSettings {
    /// Load settings from the database. Returns defaults if no row exists.
    pub fn load(conn: &rusqlite::Connection) -> DbResult<Self> {
        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='sync_settings')",
                [],
                |row| row.get(0),
            )
            .map_err(DatabaseError::Sqlite)?;

        if !exists {
            return Ok(Self::default());
        }

        let result = conn.query_row(
            "SELECT listen_port, handshake_timeout_secs, idle_timeout_secs,
                    batch_max_records, batch_max_bytes, discovery_stale_secs,
                    auth_max_attempts, auth_base_lockout_secs, last_sync_at
             FROM sync_settings WHERE id = 1",
            [],
            |row| {
                let listen_port: i64 = row.get(0)?;
                let handshake_timeout_secs: i64 = row.get(1)?;
                let idle_timeout_secs: i64 = row.get(2)?;
                let batch_max_records: i64 = row.get(3)?;
                let batch_max_bytes: i64 = row.get(4)?;
                let discovery_stale_secs: i64 = row.get(5)?;
                let auth_max_attempts: i64 = row.get(6)?;
                let auth_base_lockout_secs: i64 = row.get(7)?;
                let last_sync_at: Option<i64> = row.get(8)?;

                Ok(SyncSettings {
                    listen_port: listen_port as u16,
                    handshake_timeout_secs: handshake_timeout_secs as u64,
                    idle_timeout_secs: idle_timeout_secs as u64,
                    batch_max_records: batch_max_records as usize,
                    batch_max_bytes: batch_max_bytes as usize,
                    discovery_stale_secs: discovery_stale_secs as u64,
                    auth_max_attempts: auth_max_attempts as u32,
                    auth_base_lockout_secs: auth_base_lockout_secs as u64,
                    last_sync_at,
                })
            },
        );

        match result {
            Ok(settings) => Ok(settings),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(Self::default()),
            Err(e) => Err(DatabaseError::Sqlite(e)),
        }
    }

    /// Save settings to the database (upsert)
    pub fn save(&self, conn: &rusqlite::Connection) -> DbResult<()> {
        conn.execute(
            "INSERT INTO sync_settings (id, listen_port, handshake_timeout_secs,
                                        idle_timeout_secs, batch_max_records,
                                        batch_max_bytes, discovery_stale_secs,
                                        auth_max_attempts, auth_base_lockout_secs,
                                        last_sync_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                listen_port = excluded.listen_port,
                handshake_timeout_secs = excluded.handshake_timeout_secs,
                idle_timeout_secs = excluded.idle_timeout_secs,
                batch_max_records = excluded.batch_max_records,
                batch_max_bytes = excluded.batch_max_bytes,
                discovery_stale_secs = excluded.discovery_stale_secs,
                auth_max_attempts = excluded.auth_max_attempts,
                auth_base_lockout_secs = excluded.auth_base_lockout_secs,
                last_sync_at = excluded.last_sync_at",
            rusqlite::params![
                self.listen_port as i64,
                self.handshake_timeout_secs as i64,
                self.idle_timeout_secs as i64,
                self.batch_max_records as i64,
                self.batch_max_bytes as i64,
                self.discovery_stale_secs as i64,
                self.auth_max_attempts as i64,
                self.auth_base_lockout_secs as i64,
                self.last_sync_at,
            ],
        )
        .map_err(DatabaseError::Sqlite)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    #[test]
    fn default_settings() {
        let settings = SyncSettings::default();
        assert_eq!(settings.listen_port, 0);
        assert_eq!(settings.handshake_timeout_secs, 10);
        assert_eq!(settings.idle_timeout_secs, 300);
        assert_eq!(settings.batch_max_records, 500);
        assert_eq!(settings.batch_max_bytes, 262_144);
        assert!(settings.last_sync_at.is_none());
    }

    #[test]
    fn missing_row_loads_defaults() {
        let db = Database::in_memory().unwrap();
        let settings = SyncSettings::load(db.conn()).unwrap();
        assert_eq!(settings, SyncSettings::default());
    }

    #[test]
    fn save_and_load_round_trip() {
        let db = Database::in_memory().unwrap();

        let mut settings = SyncSettings::default();
        settings.listen_port = 47_800;
        settings.batch_max_records = 128;
        settings.last_sync_at = Some(1_700_000_000_000);
        settings.save(db.conn()).unwrap();

        let loaded = SyncSettings::load(db.conn()).unwrap();
        assert_eq!(loaded, settings);

        // Saving again overwrites the same row
        settings.listen_port = 0;
        settings.save(db.conn()).unwrap();
        assert_eq!(SyncSettings::load(db.conn()).unwrap().listen_port, 0);
    }
}
