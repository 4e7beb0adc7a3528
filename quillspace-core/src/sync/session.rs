//! Session establishment and lifecycle
//!
//! A session walks `Idle -> Discovered -> KeyExchanging -> Authenticating ->
//! Established -> (Active | Closed)`. The handshake exchanges cleartext
//! `Hello` frames, derives session and auth keys, then runs a mutual
//! challenge-response that proves both sides hold the same vault secret.
//! Failed proofs feed a per-peer exponential lockout so the vault secret
//! cannot be guessed by repeated connections.
//!
//! The protocol authenticates knowledge of the vault secret, not device
//! provenance: an active man-in-the-middle that already has the secret is
//! outside this design's threat model. Key pinning narrows the window, it
//! does not close it.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::SyncSettings;
use super::device::{self, DeviceIdentity, KeyCheck};
use super::models::{wire_type, HelloMessage, SessionState, WireMessage, PROTOCOL_VERSION};
use super::transport::{read_frame, write_frame, SealedChannel, TransportError};
use crate::crypto::keys::HANDSHAKE_NONCE_LEN;
use crate::crypto::{
    derive_auth_key, derive_session_key, open, seal, AuthKey, CryptoError, SessionContext, VaultKey,
};
use crate::database::{Database, DatabaseError};
use crate::Result;

/// Challenge nonce length in bytes
pub const CHALLENGE_LEN: usize = 32;

/// Per-peer failed authentication tracking with exponential lockout
///
/// Below the attempt limit nothing is enforced. From the limit on, each
/// further failure doubles the lockout, capped at `base * 2^10`.
#[derive(Debug)]
pub struct AuthThrottle {
    max_attempts: u32,
    base_lockout_secs: u64,
    failures: HashMap<Uuid, FailureState>,
}

#[derive(Debug, Clone, Copy)]
struct FailureState {
    attempts: u32,
    last_failure_ms: i64,
}

impl AuthThrottle {
    pub fn new(max_attempts: u32, base_lockout_secs: u64) -> Self {
        Self {
            max_attempts,
            base_lockout_secs,
            failures: HashMap::new(),
        }
    }

    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self::new(settings.auth_max_attempts, settings.auth_base_lockout_secs)
    }

    /// Seconds until `peer` may authenticate again; `None` when not locked
    pub fn retry_after(&self, peer: &Uuid, now_ms: i64) -> Option<u64> {
        let state = self.failures.get(peer)?;
        let lockout = self.lockout_secs(state.attempts)?;
        let elapsed_secs = now_ms.saturating_sub(state.last_failure_ms) / 1000;
        let remaining = lockout as i64 - elapsed_secs;
        (remaining > 0).then_some(remaining as u64)
    }

    pub fn record_failure(&mut self, peer: Uuid, now_ms: i64) {
        let state = self.failures.entry(peer).or_insert(FailureState {
            attempts: 0,
            last_failure_ms: now_ms,
        });
        state.attempts += 1;
        state.last_failure_ms = now_ms;
    }

    /// Forget a peer's failures after it authenticates successfully
    pub fn clear(&mut self, peer: &Uuid) {
        self.failures.remove(peer);
    }

    pub fn failure_count(&self, peer: &Uuid) -> u32 {
        self.failures.get(peer).map(|s| s.attempts).unwrap_or(0)
    }

    /// Lockout for a failure count; `None` below the attempt limit
    fn lockout_secs(&self, attempts: u32) -> Option<u64> {
        if attempts < self.max_attempts {
            return None;
        }
        let excess = attempts - self.max_attempts;
        Some(self.base_lockout_secs * 2u64.pow(excess.min(10)))
    }
}

/// Everything a handshake needs besides the socket
pub struct HandshakeEnv<'a> {
    pub identity: &'a DeviceIdentity,
    pub vault_key: &'a VaultKey,
    pub space_id: Uuid,
    pub settings: SyncSettings,
    pub db: &'a Mutex<Database>,
    pub throttle: &'a Mutex<AuthThrottle>,
}

/// An authenticated session with one peer
///
/// Dropping the session (or consuming it via [`PeerSession::close`]) zeroes
/// the session key.
pub struct PeerSession {
    peer_device_id: Uuid,
    peer_device_name: String,
    key_check: KeyCheck,
    state: SessionState,
    channel: SealedChannel,
    idle_timeout: Duration,
    last_activity: Instant,
}

impl PeerSession {
    pub fn peer_device_id(&self) -> Uuid {
        self.peer_device_id
    }

    pub fn peer_device_name(&self) -> &str {
        &self.peer_device_name
    }

    /// What the handshake found when pinning the peer's key
    pub fn key_check(&self) -> KeyCheck {
        self.key_check
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the idle timeout has elapsed since the last message
    pub fn is_expired(&self) -> bool {
        self.last_activity.elapsed() > self.idle_timeout
    }

    /// Seal a body into the wire message matching `type_byte`
    pub fn seal_message(&mut self, type_byte: u8, body: &[u8]) -> Result<WireMessage> {
        let (seq, payload) = self.channel.seal_payload(type_byte, body)?;
        self.touch();
        match type_byte {
            wire_type::VECTOR_CLOCK => Ok(WireMessage::VectorClock { seq, payload }),
            wire_type::MUTATION_BATCH => Ok(WireMessage::MutationBatch { seq, payload }),
            wire_type::ACK => Ok(WireMessage::Ack { seq, payload }),
            other => {
                Err(TransportError::InvalidMessage(format!("type {other} cannot travel sealed"))
                    .into())
            }
        }
    }

    /// Open a sealed message received from the peer
    pub fn open_message(&mut self, message: &WireMessage) -> Result<Vec<u8>> {
        let (seq, payload) = match message {
            WireMessage::VectorClock { seq, payload }
            | WireMessage::MutationBatch { seq, payload }
            | WireMessage::Ack { seq, payload } => (*seq, payload),
            other => {
                return Err(TransportError::InvalidMessage(format!(
                    "{} message after session establishment",
                    other.type_name()
                ))
                .into())
            }
        };
        let body = self.channel.open_payload(message.type_byte(), seq, payload)?;
        self.touch();
        Ok(body)
    }

    /// End the session; the key zeroes as the channel drops
    pub fn close(mut self) {
        self.state = SessionState::Closed;
        debug!(peer = %self.peer_device_id, state = self.state.as_str(), "session closed");
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
        if self.state == SessionState::Established {
            self.state = SessionState::Active;
        }
    }
}

/// Run the handshake as the connecting side
pub async fn initiate<S>(stream: &mut S, env: &HandshakeEnv<'_>) -> Result<PeerSession>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    handshake(stream, env, true).await
}

/// Run the handshake as the accepting side
pub async fn accept<S>(stream: &mut S, env: &HandshakeEnv<'_>) -> Result<PeerSession>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    handshake(stream, env, false).await
}

async fn handshake<S>(stream: &mut S, env: &HandshakeEnv<'_>, initiator: bool) -> Result<PeerSession>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let step = Duration::from_secs(env.settings.handshake_timeout_secs);
    let local_nonce = SessionContext::new_nonce();
    let hello = WireMessage::Hello(HelloMessage {
        protocol_version: PROTOCOL_VERSION,
        space_id: env.space_id,
        device_id: env.identity.device_id,
        device_name: env.identity.device_name.clone(),
        public_key: env.identity.public_key_bytes(),
        nonce: local_nonce.to_vec(),
    });

    let peer = if initiator {
        write_frame(stream, &hello).await?;
        let peer = expect_hello(read_step(stream, step).await?)?;
        validate_hello(&peer, env)?;
        check_throttle(env, &peer.device_id)?;
        peer
    } else {
        let peer = expect_hello(read_step(stream, step).await?)?;
        // a locked-out peer gets refused before we reveal anything
        validate_hello(&peer, env)?;
        check_throttle(env, &peer.device_id)?;
        write_frame(stream, &hello).await?;
        peer
    };

    debug!(
        peer = %peer.device_id,
        state = SessionState::KeyExchanging.as_str(),
        initiator,
        "handshake"
    );

    let key_check = {
        let db = lock_db(env.db)?;
        device::check_and_pin_peer(
            db.conn(),
            &peer.device_id,
            &peer.device_name,
            &peer.public_key,
        )?
    };
    match key_check {
        KeyCheck::Revoked => {
            warn!(peer = %peer.device_id, "refusing revoked peer");
            return Err(TransportError::PeerRevoked.into());
        }
        KeyCheck::Changed => {
            warn!(peer = %peer.device_id, "peer public key changed since it was pinned");
        }
        KeyCheck::Pinned | KeyCheck::Match => {}
    }

    let mut remote_nonce = [0u8; HANDSHAKE_NONCE_LEN];
    remote_nonce.copy_from_slice(&peer.nonce);
    let context = SessionContext {
        local_device_id: env.identity.device_id,
        remote_device_id: peer.device_id,
        local_nonce,
        remote_nonce,
    };
    let session_key = derive_session_key(&env.identity.keypair, &peer.public_key, &context)?;
    let auth_key = derive_auth_key(env.vault_key, &session_key, &context)?;

    debug!(
        peer = %peer.device_id,
        state = SessionState::Authenticating.as_str(),
        "handshake"
    );

    if initiator {
        challenge_peer(stream, &auth_key, &peer.device_id, step, env).await?;
        answer_challenge(stream, &auth_key, &env.identity.device_id, step).await?;
    } else {
        answer_challenge(stream, &auth_key, &env.identity.device_id, step).await?;
        challenge_peer(stream, &auth_key, &peer.device_id, step, env).await?;
    }

    env.throttle
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clear(&peer.device_id);

    info!(
        peer = %peer.device_id,
        name = %peer.device_name,
        state = SessionState::Established.as_str(),
        "session established"
    );

    Ok(PeerSession {
        peer_device_id: peer.device_id,
        peer_device_name: peer.device_name,
        key_check,
        state: SessionState::Established,
        channel: SealedChannel::new(session_key, env.identity.device_id, peer.device_id),
        idle_timeout: Duration::from_secs(env.settings.idle_timeout_secs),
        last_activity: Instant::now(),
    })
}

/// Send a challenge and verify the peer's proof
async fn challenge_peer<S>(
    stream: &mut S,
    auth_key: &AuthKey,
    peer_device_id: &Uuid,
    step: Duration,
    env: &HandshakeEnv<'_>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut challenge = [0u8; CHALLENGE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut challenge);
    write_frame(
        stream,
        &WireMessage::Challenge {
            nonce: challenge.to_vec(),
        },
    )
    .await?;

    let proof = match read_step(stream, step).await? {
        WireMessage::ChallengeResponse { proof } => proof,
        other => return Err(unexpected(&other, "challenge_response")),
    };

    // the prover seals under its own device id, binding the direction
    let verified = match open(auth_key.as_bytes(), &proof, peer_device_id.as_bytes()) {
        Ok(plain) => bool::from(plain.as_slice().ct_eq(&challenge[..])),
        Err(_) => false,
    };
    if !verified {
        env.throttle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record_failure(*peer_device_id, Utc::now().timestamp_millis());
        warn!(peer = %peer_device_id, "peer failed vault authentication");
        return Err(CryptoError::AuthenticationFailed.into());
    }
    Ok(())
}

/// Receive a challenge and return our proof
async fn answer_challenge<S>(
    stream: &mut S,
    auth_key: &AuthKey,
    own_device_id: &Uuid,
    step: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let nonce = match read_step(stream, step).await? {
        WireMessage::Challenge { nonce } => nonce,
        other => return Err(unexpected(&other, "challenge")),
    };
    if nonce.len() != CHALLENGE_LEN {
        return Err(TransportError::InvalidMessage(format!(
            "challenge of {} bytes, expected {CHALLENGE_LEN}",
            nonce.len()
        ))
        .into());
    }

    let proof = seal(auth_key.as_bytes(), &nonce, own_device_id.as_bytes())?;
    write_frame(stream, &WireMessage::ChallengeResponse { proof }).await?;
    Ok(())
}

async fn read_step<S: AsyncRead + Unpin>(stream: &mut S, step: Duration) -> Result<WireMessage> {
    match tokio::time::timeout(step, read_frame(stream)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(TransportError::HandshakeTimeout.into()),
    }
}

fn expect_hello(message: WireMessage) -> Result<HelloMessage> {
    match message {
        WireMessage::Hello(hello) => Ok(hello),
        other => Err(unexpected(&other, "hello")),
    }
}

fn validate_hello(peer: &HelloMessage, env: &HandshakeEnv<'_>) -> Result<()> {
    if peer.protocol_version != PROTOCOL_VERSION {
        return Err(TransportError::VersionMismatch {
            ours: PROTOCOL_VERSION,
            theirs: peer.protocol_version,
        }
        .into());
    }
    if peer.device_id == env.identity.device_id {
        return Err(TransportError::InvalidMessage("connected to ourselves".to_string()).into());
    }
    if peer.space_id != env.space_id {
        return Err(TransportError::InvalidMessage(format!(
            "peer syncs space {}, ours is {}",
            peer.space_id, env.space_id
        ))
        .into());
    }
    if peer.nonce.len() != HANDSHAKE_NONCE_LEN {
        return Err(TransportError::InvalidMessage(format!(
            "handshake nonce of {} bytes, expected {HANDSHAKE_NONCE_LEN}",
            peer.nonce.len()
        ))
        .into());
    }
    Ok(())
}

fn check_throttle(env: &HandshakeEnv<'_>, peer: &Uuid) -> Result<()> {
    let throttle = env.throttle.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(retry_after_secs) = throttle.retry_after(peer, Utc::now().timestamp_millis()) {
        warn!(peer = %peer, retry_after_secs, "peer is locked out");
        return Err(TransportError::Throttled { retry_after_secs }.into());
    }
    Ok(())
}

fn unexpected(got: &WireMessage, wanted: &str) -> crate::SyncCoreError {
    TransportError::InvalidMessage(format!("expected {wanted}, got {}", got.type_name())).into()
}

fn lock_db(db: &Mutex<Database>) -> Result<MutexGuard<'_, Database>> {
    db.lock()
        .map_err(|_| DatabaseError::LockPoisoned("peer registry".to_string()).into())
}
