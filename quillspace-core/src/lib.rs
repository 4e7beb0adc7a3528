//! QuillSpace synchronization core
//!
//! Replicates a local-first notes vault between a user's devices without a
//! central server: mDNS peer discovery, ECDH-established encrypted sessions
//! authenticated by the shared vault secret, delta transfer driven by vector
//! clocks, and convergent conflict resolution.

pub mod context;
pub mod crypto;
pub mod database;
pub mod platform;
pub mod sync;

pub use context::{ReplicaSeed, VaultContext};
pub use crypto::CryptoError;
pub use database::{Database, DatabaseError};
pub use sync::change_tracker::ApplyError;
pub use sync::engine::SyncEngine;
pub use sync::events::SyncEvent;
pub use sync::transport::TransportError;

use thiserror::Error;

/// Top-level error type for the synchronization core.
#[derive(Error, Debug)]
pub enum SyncCoreError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Sync round cancelled by shutdown")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SyncCoreError>;
