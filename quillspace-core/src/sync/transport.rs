//! Wire framing and the sealed message channel
//!
//! Frames are a 4-byte big-endian length followed by a bincode
//! [`WireMessage`], capped at 1 MiB. After the handshake every body travels
//! through a [`SealedChannel`]: bucket-padded, then AEAD-sealed with the
//! session key. The associated data binds the message type, a per-direction
//! sequence number, and the sender's device id, so frames cannot be
//! reordered, spliced across types, or reflected back at their sender.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use super::models::WireMessage;
use crate::crypto::{open, pad_payload, seal, unpad_payload, SessionKey};
use crate::Result;

/// Hard cap on a single frame body, length prefix excluded
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Handshake step timed out")]
    HandshakeTimeout,

    #[error("Frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: u16, theirs: u16 },

    #[error("Peer is revoked")]
    PeerRevoked,

    #[error("Too many failed authentication attempts; retry in {retry_after_secs}s")]
    Throttled { retry_after_secs: u64 },
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &WireMessage,
) -> TransportResult<()> {
    let body = bincode::serialize(message)
        .map_err(|e| TransportError::InvalidMessage(e.to_string()))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_LEN,
        });
    }

    writer
        .write_all(&(body.len() as u32).to_be_bytes())
        .await
        .map_err(connection_lost)?;
    writer.write_all(&body).await.map_err(connection_lost)?;
    writer.flush().await.map_err(connection_lost)?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> TransportResult<WireMessage> {
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .await
        .map_err(connection_lost)?;

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_LEN,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(connection_lost)?;
    bincode::deserialize(&body).map_err(|e| TransportError::InvalidMessage(e.to_string()))
}

fn connection_lost(e: std::io::Error) -> TransportError {
    TransportError::ConnectionLost(e.to_string())
}

/// Sealed body codec for one established session
///
/// Counters are per direction: ours for what we send, the peer's for what we
/// receive. A gap or repeat on either side is a protocol violation, not a
/// retry situation.
pub struct SealedChannel {
    key: SessionKey,
    local_device_id: Uuid,
    remote_device_id: Uuid,
    send_seq: u64,
    recv_seq: u64,
}

impl SealedChannel {
    pub fn new(key: SessionKey, local_device_id: Uuid, remote_device_id: Uuid) -> Self {
        Self {
            key,
            local_device_id,
            remote_device_id,
            send_seq: 0,
            recv_seq: 0,
        }
    }

    /// Pad and seal a body; returns the sequence number to send with it
    pub fn seal_payload(&mut self, type_byte: u8, body: &[u8]) -> Result<(u64, Vec<u8>)> {
        let seq = self.send_seq;
        let padded = pad_payload(body);
        let sealed = seal(
            self.key.as_bytes(),
            &padded,
            &associated_data(type_byte, seq, &self.local_device_id),
        )?;
        self.send_seq += 1;
        Ok((seq, sealed))
    }

    /// Open a received body, enforcing strict sequence order
    pub fn open_payload(&mut self, type_byte: u8, seq: u64, sealed: &[u8]) -> Result<Vec<u8>> {
        if seq != self.recv_seq {
            return Err(TransportError::InvalidMessage(format!(
                "out of order message: expected seq {}, got {seq}",
                self.recv_seq
            ))
            .into());
        }

        let padded = open(
            self.key.as_bytes(),
            sealed,
            &associated_data(type_byte, seq, &self.remote_device_id),
        )?;
        let body = unpad_payload(&padded)?;
        self.recv_seq += 1;
        Ok(body)
    }
}

fn associated_data(type_byte: u8, seq: u64, sender: &Uuid) -> [u8; 25] {
    let mut aad = [0u8; 25];
    aad[0] = type_byte;
    aad[1..9].copy_from_slice(&seq.to_be_bytes());
    aad[9..].copy_from_slice(sender.as_bytes());
    aad
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CryptoError, SESSION_KEY_LEN};
    use crate::sync::models::{wire_type, HelloMessage, PROTOCOL_VERSION};
    use crate::SyncCoreError;

    fn hello() -> WireMessage {
        WireMessage::Hello(HelloMessage {
            protocol_version: PROTOCOL_VERSION,
            space_id: Uuid::new_v4(),
            device_id: Uuid::new_v4(),
            device_name: "desk".to_string(),
            public_key: vec![2u8; 33],
            nonce: vec![7u8; 16],
        })
    }

    fn channel_pair() -> (SealedChannel, SealedChannel) {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let key = [9u8; SESSION_KEY_LEN];
        (
            SealedChannel::new(SessionKey::from_bytes(key), a, b),
            SealedChannel::new(SessionKey::from_bytes(key), b, a),
        )
    }

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        write_frame(&mut client, &hello()).await.unwrap();
        let message = read_frame(&mut server).await.unwrap();
        assert_eq!(message.type_byte(), wire_type::HELLO);
    }

    #[tokio::test]
    async fn oversized_frame_is_refused_before_reading() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let len = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        client.write_all(&len).await.unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn truncated_stream_is_connection_lost() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        client.write_all(&8u32.to_be_bytes()).await.unwrap();
        client.write_all(&[1, 2, 3]).await.unwrap();
        drop(client);

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionLost(_)));
    }

    #[tokio::test]
    async fn garbage_body_is_invalid_message() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        client.write_all(&4u32.to_be_bytes()).await.unwrap();
        client.write_all(&[0xff, 0xff, 0xff, 0xff]).await.unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidMessage(_)));
    }

    // --- Security tests ---

    #[test]
    fn sealed_bodies_round_trip_in_order() {
        let (mut alice, mut bob) = channel_pair();

        for i in 0u8..3 {
            let (seq, sealed) = alice
                .seal_payload(wire_type::MUTATION_BATCH, &[i; 10])
                .unwrap();
            assert_eq!(seq, i as u64);
            let body = bob
                .open_payload(wire_type::MUTATION_BATCH, seq, &sealed)
                .unwrap();
            assert_eq!(body, vec![i; 10]);
        }
    }

    #[test]
    fn out_of_order_sequence_is_rejected() {
        let (mut alice, mut bob) = channel_pair();

        let (_, first) = alice.seal_payload(wire_type::ACK, b"one").unwrap();
        let (second_seq, second) = alice.seal_payload(wire_type::ACK, b"two").unwrap();

        // Skipping ahead fails
        let err = bob
            .open_payload(wire_type::ACK, second_seq, &second)
            .unwrap_err();
        assert!(matches!(
            err,
            SyncCoreError::Transport(TransportError::InvalidMessage(_))
        ));

        // Replaying an already consumed sequence also fails
        bob.open_payload(wire_type::ACK, 0, &first).unwrap();
        let err = bob.open_payload(wire_type::ACK, 0, &first).unwrap_err();
        assert!(matches!(
            err,
            SyncCoreError::Transport(TransportError::InvalidMessage(_))
        ));
    }

    #[test]
    fn tampered_body_fails_closed() {
        let (mut alice, mut bob) = channel_pair();

        let (seq, mut sealed) = alice
            .seal_payload(wire_type::VECTOR_CLOCK, b"clock data")
            .unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        let err = bob
            .open_payload(wire_type::VECTOR_CLOCK, seq, &sealed)
            .unwrap_err();
        assert!(matches!(
            err,
            SyncCoreError::Crypto(CryptoError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn type_byte_is_bound_into_the_seal() {
        let (mut alice, mut bob) = channel_pair();

        let (seq, sealed) = alice.seal_payload(wire_type::ACK, b"an ack").unwrap();
        let err = bob
            .open_payload(wire_type::MUTATION_BATCH, seq, &sealed)
            .unwrap_err();
        assert!(matches!(err, SyncCoreError::Crypto(_)));
    }

    #[test]
    fn reflected_frame_is_rejected() {
        let (mut alice, _) = channel_pair();

        // An attacker bouncing our own frame back must not decrypt
        let (seq, sealed) = alice.seal_payload(wire_type::ACK, b"mine").unwrap();
        let err = alice.open_payload(wire_type::ACK, seq, &sealed).unwrap_err();
        assert!(matches!(err, SyncCoreError::Crypto(_)));
    }

    #[test]
    fn sealed_sizes_fall_into_buckets() {
        let (mut alice, _) = channel_pair();

        // Two very different small bodies seal to the same size
        let (_, short) = alice.seal_payload(wire_type::ACK, b"x").unwrap();
        let (_, longer) = alice.seal_payload(wire_type::ACK, &[7u8; 100]).unwrap();
        assert_eq!(short.len(), longer.len());
    }
}
