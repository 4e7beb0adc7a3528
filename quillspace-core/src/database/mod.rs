//! SQLite persistence for vault entities and synchronization state

pub mod models;
pub mod schema;

pub use models::{EntityState, PeerInfo, SyncHistoryEntry, TrustLevel, VaultMetadata};
pub use schema::Database;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Schema version mismatch: expected {expected}, found {found}")]
    SchemaMismatch { expected: i32, found: i32 },

    #[error("Database error: {0}")]
    Other(String),
}

pub type DbResult<T> = std::result::Result<T, DatabaseError>;
