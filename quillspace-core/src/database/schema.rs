//! Database schema creation and validation

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use uuid::Uuid;

use super::models::{SyncHistoryEntry, VaultMetadata};
use super::{DatabaseError, DbResult};
use crate::crypto::KdfParams;

/// Bumped whenever the schema changes shape
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Handle to the vault database
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the vault database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let db = Self { conn };
        db.initialize_schema()?;
        db.validate_schema_version()?;
        Ok(db)
    }

    /// In-memory database, used by tests
    pub fn in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let db = Self { conn };
        db.initialize_schema()?;
        Ok(db)
    }

    /// Create all tables and indexes; safe to call on an existing database
    pub fn initialize_schema(&self) -> DbResult<()> {
        self.create_vault_metadata_table()?;
        self.create_entities_table()?;
        self.create_mutation_log_table()?;
        self.create_clock_tables()?;
        self.create_device_tables()?;
        self.create_conflict_tables()?;
        self.create_sync_tables()?;
        self.create_indexes()?;
        Ok(())
    }

    fn create_vault_metadata_table(&self) -> DbResult<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS vault_metadata (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                schema_version INTEGER NOT NULL,
                kdf_params TEXT NOT NULL,
                key_check BLOB NOT NULL,
                default_space_id TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    fn create_entities_table(&self) -> DbResult<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS entities (
                entity_id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                space_id TEXT NOT NULL,
                revision INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL,
                payload TEXT NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                origin_device_id TEXT NOT NULL,
                logical_clock INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    fn create_mutation_log_table(&self) -> DbResult<()> {
        // The UNIQUE pair doubles as the idempotency seen-set for remote
        // mutations.
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS mutation_log (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                space_id TEXT NOT NULL,
                origin_device_id TEXT NOT NULL,
                logical_clock INTEGER NOT NULL,
                diff BLOB NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                UNIQUE (origin_device_id, logical_clock)
            )",
            [],
        )?;
        Ok(())
    }

    fn create_clock_tables(&self) -> DbResult<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS vector_clocks (
                space_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                logical_clock INTEGER NOT NULL,
                PRIMARY KEY (space_id, device_id)
            );
            CREATE TABLE IF NOT EXISTS tracker_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                logical_clock INTEGER NOT NULL
            );
            INSERT OR IGNORE INTO tracker_state (id, logical_clock) VALUES (1, 0);",
        )?;
        Ok(())
    }

    fn create_device_tables(&self) -> DbResult<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS device_identity (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                device_id TEXT NOT NULL,
                device_name TEXT NOT NULL,
                public_key BLOB NOT NULL,
                secret_key BLOB NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS peers (
                device_id TEXT PRIMARY KEY,
                device_name TEXT NOT NULL,
                public_key BLOB NOT NULL,
                trust TEXT NOT NULL DEFAULT 'first_use',
                acked_state TEXT NOT NULL DEFAULT '{}',
                first_seen INTEGER NOT NULL,
                last_seen INTEGER NOT NULL,
                last_sync_at INTEGER
            );",
        )?;
        Ok(())
    }

    fn create_conflict_tables(&self) -> DbResult<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS conflict_records (
                conflict_id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_id TEXT NOT NULL,
                space_id TEXT NOT NULL,
                local_mutation BLOB NOT NULL,
                remote_mutation BLOB NOT NULL,
                detected_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS set_tombstones (
                entity_id TEXT NOT NULL,
                field TEXT NOT NULL,
                member TEXT NOT NULL,
                removed_at INTEGER NOT NULL,
                PRIMARY KEY (entity_id, field, member)
            );
            CREATE TABLE IF NOT EXISTS skipped_mutations (
                skip_id INTEGER PRIMARY KEY AUTOINCREMENT,
                origin_device_id TEXT NOT NULL,
                logical_clock INTEGER NOT NULL,
                entity_id TEXT,
                reason TEXT NOT NULL,
                occurred_at INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }

    fn create_sync_tables(&self) -> DbResult<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sync_settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                listen_port INTEGER NOT NULL,
                handshake_timeout_secs INTEGER NOT NULL,
                idle_timeout_secs INTEGER NOT NULL,
                batch_max_records INTEGER NOT NULL,
                batch_max_bytes INTEGER NOT NULL,
                discovery_stale_secs INTEGER NOT NULL,
                auth_max_attempts INTEGER NOT NULL,
                auth_base_lockout_secs INTEGER NOT NULL,
                last_sync_at INTEGER
            );
            CREATE TABLE IF NOT EXISTS sync_history (
                entry_id INTEGER PRIMARY KEY AUTOINCREMENT,
                peer_device_id TEXT NOT NULL,
                space_id TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL,
                sent INTEGER NOT NULL,
                received INTEGER NOT NULL,
                applied INTEGER NOT NULL,
                skipped INTEGER NOT NULL,
                conflicts INTEGER NOT NULL,
                outcome TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    fn create_indexes(&self) -> DbResult<()> {
        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_entities_space ON entities (space_id)",
            "CREATE INDEX IF NOT EXISTS idx_entities_type ON entities (space_id, entity_type)",
            "CREATE INDEX IF NOT EXISTS idx_mutation_log_space
                 ON mutation_log (space_id, origin_device_id, logical_clock)",
            "CREATE INDEX IF NOT EXISTS idx_mutation_log_entity
                 ON mutation_log (entity_id, logical_clock)",
            "CREATE INDEX IF NOT EXISTS idx_conflicts_space
                 ON conflict_records (space_id, detected_at)",
            "CREATE INDEX IF NOT EXISTS idx_history_peer
                 ON sync_history (peer_device_id, started_at)",
        ];

        for sql in indexes {
            self.conn.execute(sql, [])?;
        }
        Ok(())
    }

    /// Refuse to run against a vault written by an incompatible version
    pub fn validate_schema_version(&self) -> DbResult<()> {
        let found = self
            .conn
            .query_row(
                "SELECT schema_version FROM vault_metadata WHERE id = 1",
                [],
                |row| row.get::<_, i32>(0),
            )
            .optional()?;

        match found {
            Some(found) if found != CURRENT_SCHEMA_VERSION => Err(DatabaseError::SchemaMismatch {
                expected: CURRENT_SCHEMA_VERSION,
                found,
            }),
            _ => Ok(()),
        }
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn write_vault_metadata(&self, meta: &VaultMetadata) -> DbResult<()> {
        let kdf_json = serde_json::to_string(&meta.kdf_params)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn.execute(
            "INSERT INTO vault_metadata
                 (id, schema_version, kdf_params, key_check, default_space_id, created_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                 schema_version = excluded.schema_version,
                 kdf_params = excluded.kdf_params,
                 key_check = excluded.key_check,
                 default_space_id = excluded.default_space_id",
            params![
                meta.schema_version,
                kdf_json,
                meta.key_check,
                meta.default_space_id.to_string(),
                meta.created_at
            ],
        )?;
        Ok(())
    }

    pub fn read_vault_metadata(&self) -> DbResult<Option<VaultMetadata>> {
        let row = self
            .conn
            .query_row(
                "SELECT schema_version, kdf_params, key_check, default_space_id, created_at
                 FROM vault_metadata WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, i32>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((schema_version, kdf_json, key_check, space, created_at)) = row else {
            return Ok(None);
        };

        let kdf_params: KdfParams = serde_json::from_str(&kdf_json)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        Ok(Some(VaultMetadata {
            schema_version,
            kdf_params,
            key_check,
            default_space_id: parse_uuid(&space)?,
            created_at,
        }))
    }

    /// Append one completed (or failed) sync round to the history
    pub fn append_sync_history(&self, entry: &SyncHistoryEntry) -> DbResult<i64> {
        self.conn.execute(
            "INSERT INTO sync_history
                 (peer_device_id, space_id, started_at, duration_ms, sent, received,
                  applied, skipped, conflicts, outcome)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                entry.peer_device_id.to_string(),
                entry.space_id.to_string(),
                entry.started_at,
                entry.duration_ms,
                entry.sent,
                entry.received,
                entry.applied,
                entry.skipped,
                entry.conflicts,
                entry.outcome
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Most recent sync rounds, newest first
    pub fn list_sync_history(&self, limit: usize) -> DbResult<Vec<SyncHistoryEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT entry_id, peer_device_id, space_id, started_at, duration_ms,
                    sent, received, applied, skipped, conflicts, outcome
             FROM sync_history ORDER BY started_at DESC, entry_id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, u32>(5)?,
                row.get::<_, u32>(6)?,
                row.get::<_, u32>(7)?,
                row.get::<_, u32>(8)?,
                row.get::<_, u32>(9)?,
                row.get::<_, String>(10)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (
                entry_id,
                peer_device_id,
                space_id,
                started_at,
                duration_ms,
                sent,
                received,
                applied,
                skipped,
                conflicts,
                outcome,
            ) = row?;
            out.push(SyncHistoryEntry {
                entry_id,
                peer_device_id: parse_uuid(&peer_device_id)?,
                space_id: parse_uuid(&space_id)?,
                started_at,
                duration_ms,
                sent,
                received,
                applied,
                skipped,
                conflicts,
                outcome,
            });
        }
        Ok(out)
    }
}

/// Parse a UUID column, mapping garbage to a database error
pub(crate) fn parse_uuid(value: &str) -> DbResult<Uuid> {
    value
        .parse()
        .map_err(|_| DatabaseError::Other(format!("invalid uuid in database: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_creates_all_tables() {
        let db = Database::in_memory().unwrap();

        let tables = [
            "vault_metadata",
            "entities",
            "mutation_log",
            "vector_clocks",
            "tracker_state",
            "device_identity",
            "peers",
            "conflict_records",
            "set_tombstones",
            "skipped_mutations",
            "sync_settings",
            "sync_history",
        ];

        for table in tables {
            let exists: bool = db
                .conn()
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert!(exists, "missing table {table}");
        }
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let db = Database::in_memory().unwrap();
        db.initialize_schema().unwrap();
        db.initialize_schema().unwrap();
    }

    #[test]
    fn test_tracker_state_seeded() {
        let db = Database::in_memory().unwrap();
        let clock: u64 = db
            .conn()
            .query_row("SELECT logical_clock FROM tracker_state WHERE id = 1", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(clock, 0);
    }

    #[test]
    fn test_sync_history_newest_first() {
        let db = Database::in_memory().unwrap();
        db.initialize_schema().unwrap();

        let peer = Uuid::new_v4();
        let space = Uuid::new_v4();
        for (started_at, outcome) in [(1_000, "ok"), (2_000, "failed: connection lost")] {
            db.append_sync_history(&SyncHistoryEntry {
                entry_id: 0,
                peer_device_id: peer,
                space_id: space,
                started_at,
                duration_ms: 42,
                sent: 3,
                received: 1,
                applied: 1,
                skipped: 0,
                conflicts: 0,
                outcome: outcome.to_string(),
            })
            .unwrap();
        }

        let entries = db.list_sync_history(10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].started_at, 2_000);
        assert_eq!(entries[0].outcome, "failed: connection lost");
        assert_eq!(entries[1].sent, 3);

        assert_eq!(db.list_sync_history(1).unwrap().len(), 1);
    }

    #[test]
    fn test_vault_metadata_round_trip() {
        let db = Database::in_memory().unwrap();
        assert!(db.read_vault_metadata().unwrap().is_none());

        let meta = VaultMetadata {
            schema_version: CURRENT_SCHEMA_VERSION,
            kdf_params: KdfParams::generate(),
            key_check: vec![1, 2, 3, 4],
            default_space_id: Uuid::new_v4(),
            created_at: 1_700_000_000_000,
        };
        db.write_vault_metadata(&meta).unwrap();

        let loaded = db.read_vault_metadata().unwrap().unwrap();
        assert_eq!(loaded.kdf_params, meta.kdf_params);
        assert_eq!(loaded.key_check, meta.key_check);
        assert_eq!(loaded.default_space_id, meta.default_space_id);
    }

    #[test]
    fn test_schema_version_mismatch_detected() {
        let db = Database::in_memory().unwrap();
        let meta = VaultMetadata {
            schema_version: CURRENT_SCHEMA_VERSION + 1,
            kdf_params: KdfParams::generate(),
            key_check: vec![0],
            default_space_id: Uuid::new_v4(),
            created_at: 0,
        };
        db.write_vault_metadata(&meta).unwrap();

        assert!(matches!(
            db.validate_schema_version(),
            Err(DatabaseError::SchemaMismatch { .. })
        ));
    }
}
