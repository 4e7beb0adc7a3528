//! Data model for mutations, sessions, and the sync wire protocol

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::clock::VectorClock;

/// Protocol version sent in every Hello; mismatches refuse the session
pub const PROTOCOL_VERSION: u16 = 1;

/// Stable wire discriminants, bound into sealed messages' associated data
pub mod wire_type {
    pub const HELLO: u8 = 1;
    pub const CHALLENGE: u8 = 2;
    pub const CHALLENGE_RESPONSE: u8 = 3;
    pub const VECTOR_CLOCK: u8 = 4;
    pub const MUTATION_BATCH: u8 = 5;
    pub const ACK: u8 = 6;
}

/// One field-level change inside a mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldDiff {
    /// Replace a scalar field with a new value
    Scalar {
        field: String,
        value: serde_json::Value,
    },
    /// Add members to a set-valued field
    SetAdd { field: String, members: Vec<String> },
    /// Remove members from a set-valued field; the removal is tombstoned so
    /// it survives set-union merges
    SetRemove { field: String, members: Vec<String> },
    /// Replace a rich-text field
    Text { field: String, content: String },
    /// Move the entity under a different parent
    Reparent { new_parent: Option<Uuid> },
    /// A change this build does not understand; carried verbatim so newer
    /// peers can still exchange it
    Opaque {
        field: String,
        #[serde(with = "base64_bytes")]
        payload: Vec<u8>,
    },
}

impl FieldDiff {
    /// Field the diff targets; reparent moves are modeled as `parent_id`
    pub fn field_name(&self) -> &str {
        match self {
            FieldDiff::Scalar { field, .. } => field,
            FieldDiff::SetAdd { field, .. } => field,
            FieldDiff::SetRemove { field, .. } => field,
            FieldDiff::Text { field, .. } => field,
            FieldDiff::Reparent { .. } => "parent_id",
            FieldDiff::Opaque { field, .. } => field,
        }
    }
}

/// What a mutation did to its entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityDiff {
    /// Full replacement state; also revives a deleted entity
    Snapshot { payload: serde_json::Value },
    /// Targeted field changes
    Fields(Vec<FieldDiff>),
    /// Entity-level delete marker
    Tombstone,
}

/// One recorded change, the unit of synchronization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub entity_id: Uuid,
    pub entity_type: String,
    pub space_id: Uuid,
    pub origin_device_id: Uuid,
    /// Position in the origin device's Lamport sequence
    pub logical_clock: u64,
    pub diff: EntityDiff,
    /// Wall-clock at the origin, unix milliseconds; advisory, used only for
    /// last-write-wins ordering
    pub timestamp_ms: i64,
}

/// Session lifecycle; `as_str` values appear in status output and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Discovered,
    KeyExchanging,
    Authenticating,
    Established,
    Active,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Discovered => "discovered",
            SessionState::KeyExchanging => "key_exchanging",
            SessionState::Authenticating => "authenticating",
            SessionState::Established => "established",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(SessionState::Idle),
            "discovered" => Some(SessionState::Discovered),
            "key_exchanging" => Some(SessionState::KeyExchanging),
            "authenticating" => Some(SessionState::Authenticating),
            "established" => Some(SessionState::Established),
            "active" => Some(SessionState::Active),
            "closed" => Some(SessionState::Closed),
            _ => None,
        }
    }
}

/// Framed protocol messages
///
/// `Hello`, `Challenge`, and `ChallengeResponse` travel before a session key
/// exists. Everything after the handshake carries an opaque sealed payload
/// plus a cleartext sequence number that is bound into the seal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    Hello(HelloMessage),
    Challenge { nonce: Vec<u8> },
    ChallengeResponse { proof: Vec<u8> },
    VectorClock { seq: u64, payload: Vec<u8> },
    MutationBatch { seq: u64, payload: Vec<u8> },
    Ack { seq: u64, payload: Vec<u8> },
}

impl WireMessage {
    /// Stable discriminant mixed into the AEAD associated data
    pub fn type_byte(&self) -> u8 {
        match self {
            WireMessage::Hello(_) => wire_type::HELLO,
            WireMessage::Challenge { .. } => wire_type::CHALLENGE,
            WireMessage::ChallengeResponse { .. } => wire_type::CHALLENGE_RESPONSE,
            WireMessage::VectorClock { .. } => wire_type::VECTOR_CLOCK,
            WireMessage::MutationBatch { .. } => wire_type::MUTATION_BATCH,
            WireMessage::Ack { .. } => wire_type::ACK,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            WireMessage::Hello(_) => "hello",
            WireMessage::Challenge { .. } => "challenge",
            WireMessage::ChallengeResponse { .. } => "challenge_response",
            WireMessage::VectorClock { .. } => "vector_clock",
            WireMessage::MutationBatch { .. } => "mutation_batch",
            WireMessage::Ack { .. } => "ack",
        }
    }
}

/// Handshake opener, sent cleartext by both sides
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloMessage {
    pub protocol_version: u16,
    pub space_id: Uuid,
    pub device_id: Uuid,
    pub device_name: String,
    /// Compressed SEC1 public key
    pub public_key: Vec<u8>,
    /// Per-session random component of the key derivation transcript
    pub nonce: Vec<u8>,
}

/// Sealed body of a `VectorClock` message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncClockBody {
    pub space_id: Uuid,
    pub clock: VectorClock,
}

/// Sealed body of a `MutationBatch` message; JSON-encoded because records
/// carry arbitrary JSON payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchBody {
    /// Zero-based position of this batch in the sender's stream
    pub batch_index: u32,
    /// Total batches the sender will emit this round; zero records with
    /// `batch_count <= 1` means nothing to transfer
    pub batch_count: u32,
    pub records: Vec<MutationRecord>,
}

/// Sealed body of an `Ack`, one per received batch
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AckBody {
    pub batch_index: u32,
    pub applied: u32,
    pub skipped: u32,
    pub conflicts: u32,
}

/// Outcome of one sync round with one peer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncSummary {
    pub peer_device_id: Uuid,
    pub space_id: Uuid,
    pub sent: u32,
    pub received: u32,
    pub applied: u32,
    pub skipped: u32,
    pub conflicts: u32,
    pub duration_ms: i64,
}

/// A device advertising itself on the local network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerCandidate {
    pub device_id: Uuid,
    pub device_name: String,
    pub address: std::net::SocketAddr,
    /// When the advertisement was last seen, unix ms
    pub advertised_at: i64,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(diff: EntityDiff) -> MutationRecord {
        MutationRecord {
            entity_id: Uuid::new_v4(),
            entity_type: "note".to_string(),
            space_id: Uuid::new_v4(),
            origin_device_id: Uuid::new_v4(),
            logical_clock: 42,
            diff,
            timestamp_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn mutation_record_json_round_trip() {
        let diffs = [
            EntityDiff::Snapshot {
                payload: serde_json::json!({"title": "groceries", "tags": ["home"]}),
            },
            EntityDiff::Fields(vec![
                FieldDiff::Scalar {
                    field: "title".to_string(),
                    value: serde_json::json!("renamed"),
                },
                FieldDiff::SetAdd {
                    field: "tags".to_string(),
                    members: vec!["urgent".to_string()],
                },
                FieldDiff::Text {
                    field: "body".to_string(),
                    content: "first paragraph\n\nsecond".to_string(),
                },
                FieldDiff::Reparent {
                    new_parent: Some(Uuid::new_v4()),
                },
            ]),
            EntityDiff::Tombstone,
        ];

        for diff in diffs {
            let record = sample_record(diff);
            let json = serde_json::to_string(&record).unwrap();
            let back: MutationRecord = serde_json::from_str(&json).unwrap();
            assert_eq!(back, record);
        }
    }

    #[test]
    fn opaque_diff_payload_is_base64_in_json() {
        let record = sample_record(EntityDiff::Fields(vec![FieldDiff::Opaque {
            field: "sketch".to_string(),
            payload: vec![0, 159, 146, 150],
        }]));

        let json = serde_json::to_value(&record).unwrap();
        let payload = &json["diff"]["fields"][0]["opaque"]["payload"];
        assert!(payload.is_string());

        let back: MutationRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn wire_message_bincode_round_trip() {
        let hello = WireMessage::Hello(HelloMessage {
            protocol_version: PROTOCOL_VERSION,
            space_id: Uuid::new_v4(),
            device_id: Uuid::new_v4(),
            device_name: "desk".to_string(),
            public_key: vec![2; 33],
            nonce: vec![7; 16],
        });

        let bytes = bincode::serialize(&hello).unwrap();
        let back: WireMessage = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.type_byte(), hello.type_byte());

        let batch = WireMessage::MutationBatch {
            seq: 9,
            payload: vec![1, 2, 3],
        };
        let bytes = bincode::serialize(&batch).unwrap();
        match bincode::deserialize(&bytes).unwrap() {
            WireMessage::MutationBatch { seq, payload } => {
                assert_eq!(seq, 9);
                assert_eq!(payload, vec![1, 2, 3]);
            }
            other => panic!("unexpected message {}", other.type_name()),
        }
    }

    #[test]
    fn type_bytes_are_distinct() {
        let messages = [
            WireMessage::Hello(HelloMessage {
                protocol_version: PROTOCOL_VERSION,
                space_id: Uuid::nil(),
                device_id: Uuid::nil(),
                device_name: String::new(),
                public_key: Vec::new(),
                nonce: Vec::new(),
            }),
            WireMessage::Challenge { nonce: Vec::new() },
            WireMessage::ChallengeResponse { proof: Vec::new() },
            WireMessage::VectorClock {
                seq: 0,
                payload: Vec::new(),
            },
            WireMessage::MutationBatch {
                seq: 0,
                payload: Vec::new(),
            },
            WireMessage::Ack {
                seq: 0,
                payload: Vec::new(),
            },
        ];

        let mut seen = std::collections::HashSet::new();
        for message in &messages {
            assert!(seen.insert(message.type_byte()));
        }
    }

    #[test]
    fn session_state_string_round_trip() {
        let states = [
            SessionState::Idle,
            SessionState::Discovered,
            SessionState::KeyExchanging,
            SessionState::Authenticating,
            SessionState::Established,
            SessionState::Active,
            SessionState::Closed,
        ];
        for state in states {
            assert_eq!(SessionState::parse(state.as_str()), Some(state));
        }
        assert_eq!(SessionState::parse("bogus"), None);
    }
}
