//! Peer-to-peer encrypted sync for QuillSpace
//!
//! Implements zero-server device synchronization:
//! - mDNS peer discovery on the local network
//! - P-256 ECDH session keys bound to the shared vault secret
//! - XChaCha20-Poly1305 sealed, padded mutation batches
//! - Vector-clock change tracking with field-level merge
//! - Conflict records for edits the rules will not auto-resolve

pub mod change_tracker;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod device;
pub mod discovery;
pub mod engine;
pub mod events;
pub mod models;
pub mod session;
pub mod transport;

pub use clock::VectorClock;
pub use config::SyncSettings;
pub use conflict::{MergePolicy, Resolution};
pub use engine::SyncEngine;
pub use events::{SyncEvent, SyncEvents};
pub use models::{SyncSummary, PROTOCOL_VERSION};
