//! Sync round orchestration
//!
//! A round is strictly turn-based over one connection: vector clocks are
//! exchanged first, then the initiator streams its missing mutations in
//! bounded batches and the responder answers each with an ack, then the
//! directions swap. Every received batch commits in a single transaction
//! before its ack leaves, so an aborted round never loses acknowledged
//! work and the next round resumes where the last durable batch ended.
//!
//! [`SyncEngine`] is cheap to clone; all clones share the vault context
//! and the peer auth throttle.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::VaultContext;
use crate::database::{DatabaseError, SyncHistoryEntry};
use crate::sync::change_tracker::{self, ApplyError, ApplyOutcome, ChangeCursor};
use crate::sync::clock::VectorClock;
use crate::sync::conflict::{self, MergeOutcome};
use crate::sync::device::{self, KeyCheck};
use crate::sync::discovery::Discovery;
use crate::sync::events::SyncEvent;
use crate::sync::models::{
    wire_type, AckBody, BatchBody, MutationRecord, SyncClockBody, SyncSummary,
};
use crate::sync::session::{self, AuthThrottle, HandshakeEnv, PeerSession};
use crate::sync::transport::{read_frame, write_frame, TransportError};
use crate::{Result, SyncCoreError};

/// Inbound sessions served at once; further connections wait in accept
const MAX_CONCURRENT_SESSIONS: usize = 10;

/// How often the background worker looks at the candidate list
const WORKER_POLL: Duration = Duration::from_secs(5);

const BACKOFF_FLOOR: Duration = Duration::from_secs(1);
const BACKOFF_CEIL: Duration = Duration::from_secs(30);

/// Drives sync rounds against peers, inbound and outbound
#[derive(Clone)]
pub struct SyncEngine {
    context: Arc<VaultContext>,
    throttle: Arc<Mutex<AuthThrottle>>,
}

impl SyncEngine {
    pub fn new(context: Arc<VaultContext>) -> Self {
        let throttle = AuthThrottle::from_settings(&context.settings());
        Self {
            context,
            throttle: Arc::new(Mutex::new(throttle)),
        }
    }

    /// Run one sync round against a peer address
    pub async fn sync_with(&self, addr: SocketAddr) -> Result<SyncSummary> {
        let (_hold, shutdown) = watch::channel(false);
        self.sync_with_until(addr, shutdown).await
    }

    /// Like [`sync_with`](Self::sync_with), but stops at the next batch
    /// boundary once the shutdown flag flips
    pub async fn sync_with_until(
        &self,
        addr: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) -> Result<SyncSummary> {
        let settings = self.context.settings();
        let connect_timeout = Duration::from_secs(settings.handshake_timeout_secs);
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::ConnectionLost(format!("connect to {addr} timed out")))?
            .map_err(|e| TransportError::ConnectionLost(format!("connect to {addr} failed: {e}")))?;
        debug!(%addr, "outbound sync connection");
        self.drive(stream, true, shutdown).await
    }

    /// Accept and serve inbound sync sessions until shutdown
    ///
    /// A connection gets a concurrency permit before it is accepted, so a
    /// flood of peers queues in the listener backlog instead of spawning
    /// unbounded sessions.
    pub async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let permits = Arc::new(Semaphore::new(MAX_CONCURRENT_SESSIONS));
        info!(addr = %listener.local_addr()?, "sync listener started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            let permit = tokio::select! {
                _ = shutdown.changed() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let (stream, peer_addr) = tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };

            debug!(%peer_addr, "inbound sync connection");
            let engine = self.clone();
            let conn_shutdown = shutdown.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = engine.drive(stream, false, conn_shutdown).await {
                    debug!(%peer_addr, error = %e, "inbound sync session ended with error");
                }
            });
        }

        // wait for in-flight sessions before returning
        let _ = permits.acquire_many(MAX_CONCURRENT_SESSIONS as u32).await;
        info!("sync listener stopped");
        Ok(())
    }

    /// Background worker: sync with every discovered peer, with per-peer
    /// exponential backoff after failures
    ///
    /// Each attempt runs in its own task; a slow peer never delays the
    /// others.
    pub fn spawn_worker(
        &self,
        discovery: Arc<Discovery>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let state = Arc::new(Mutex::new(WorkerState::default()));
            info!("background sync worker started");
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(WORKER_POLL) => {}
                }
                if *shutdown.borrow() {
                    break;
                }

                let now = Instant::now();
                for candidate in discovery.candidates() {
                    if candidate.device_id == engine.context.device_id() {
                        continue;
                    }
                    {
                        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                        if state.in_flight.contains(&candidate.device_id) {
                            continue;
                        }
                        let backed_off = state
                            .backoff
                            .get(&candidate.device_id)
                            .map(|b| now < b.not_before)
                            .unwrap_or(false);
                        if backed_off {
                            continue;
                        }
                        state.in_flight.insert(candidate.device_id);
                    }

                    let engine = engine.clone();
                    let state = Arc::clone(&state);
                    let attempt_shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        let device_id = candidate.device_id;
                        let result = engine
                            .sync_with_until(candidate.address, attempt_shutdown)
                            .await;
                        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                        state.in_flight.remove(&device_id);
                        match result {
                            Ok(_) => {
                                state.backoff.remove(&device_id);
                            }
                            Err(e) => {
                                debug!(peer = %device_id, error = %e, "background sync attempt failed");
                                let delay = next_backoff(
                                    state.backoff.get(&device_id).map(|b| b.delay),
                                );
                                state.backoff.insert(
                                    device_id,
                                    PeerBackoff {
                                        delay,
                                        not_before: Instant::now() + delay,
                                    },
                                );
                            }
                        }
                    });
                }
            }
            info!("background sync worker stopped");
        })
    }

    /// Handshake, run one round, record the outcome
    async fn drive<S>(
        &self,
        mut stream: S,
        initiator: bool,
        shutdown: watch::Receiver<bool>,
    ) -> Result<SyncSummary>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let settings = self.context.settings();
        let env = HandshakeEnv {
            identity: self.context.identity(),
            vault_key: self.context.vault_key(),
            space_id: self.context.space_id(),
            settings: settings.clone(),
            db: self.context.db(),
            throttle: self.throttle.as_ref(),
        };
        let session_result = if initiator {
            session::initiate(&mut stream, &env).await
        } else {
            session::accept(&mut stream, &env).await
        };
        let mut session = match session_result {
            Ok(session) => session,
            Err(e) => {
                self.context.events().emit(SyncEvent::RoundFailed {
                    peer_device_id: None,
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        if session.key_check() == KeyCheck::Changed {
            warn!(peer = %session.peer_device_id(), "peer key changed since last pairing");
            self.context.events().emit(SyncEvent::PeerKeyChanged {
                device_id: session.peer_device_id(),
            });
        }

        let started_at = Utc::now().timestamp_millis();
        let mut summary = SyncSummary {
            peer_device_id: session.peer_device_id(),
            space_id: self.context.space_id(),
            ..SyncSummary::default()
        };
        let result = self
            .run_round(&mut stream, &mut session, initiator, &shutdown, &mut summary)
            .await;
        summary.duration_ms = Utc::now().timestamp_millis() - started_at;
        let peer_name = session.peer_device_name().to_string();
        session.close();

        match result {
            Ok(()) => {
                info!(
                    peer = %peer_name,
                    sent = summary.sent,
                    received = summary.received,
                    applied = summary.applied,
                    skipped = summary.skipped,
                    conflicts = summary.conflicts,
                    duration_ms = summary.duration_ms,
                    "sync round completed"
                );
                self.record_history(&summary, started_at, "completed");
                if let Err(e) = self
                    .context
                    .update_settings(|s| s.last_sync_at = Some(started_at))
                {
                    warn!(error = %e, "could not store last sync time");
                }
                self.context
                    .events()
                    .emit(SyncEvent::RoundCompleted(summary.clone()));
                Ok(summary)
            }
            Err(e) => {
                let outcome = if matches!(e, SyncCoreError::Cancelled) {
                    "cancelled"
                } else {
                    "failed"
                };
                warn!(peer = %peer_name, error = %e, outcome, "sync round aborted");
                self.record_history(&summary, started_at, outcome);
                self.context.events().emit(SyncEvent::RoundFailed {
                    peer_device_id: Some(summary.peer_device_id),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run_round<S>(
        &self,
        stream: &mut S,
        session: &mut PeerSession,
        initiator: bool,
        shutdown: &watch::Receiver<bool>,
        summary: &mut SyncSummary,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        check_shutdown(shutdown)?;
        let space_id = self.context.space_id();
        let idle = Duration::from_secs(self.context.settings().idle_timeout_secs);

        let local_clock = {
            let db = self.context.lock_db()?;
            VectorClock::load(db.conn(), &space_id)?
        };
        let our_body = SyncClockBody {
            space_id,
            clock: local_clock.clone(),
        };
        let peer_body: SyncClockBody = if initiator {
            send_sealed(stream, session, wire_type::VECTOR_CLOCK, "vector clock", &our_body)
                .await?;
            read_sealed(stream, session, idle, wire_type::VECTOR_CLOCK, "vector clock").await?
        } else {
            let body =
                read_sealed(stream, session, idle, wire_type::VECTOR_CLOCK, "vector clock")
                    .await?;
            send_sealed(stream, session, wire_type::VECTOR_CLOCK, "vector clock", &our_body)
                .await?;
            body
        };
        if peer_body.space_id != space_id {
            return Err(TransportError::InvalidMessage(
                "vector clock for a different space".to_string(),
            )
            .into());
        }
        let peer_clock = peer_body.clock;
        debug!(peer = %session.peer_device_id(), "clocks exchanged");

        if initiator {
            self.send_changes(stream, session, &peer_clock, idle, shutdown, summary)
                .await?;
            self.receive_changes(stream, session, &peer_clock, idle, shutdown, summary)
                .await?;
        } else {
            self.receive_changes(stream, session, &peer_clock, idle, shutdown, summary)
                .await?;
            self.send_changes(stream, session, &peer_clock, idle, shutdown, summary)
                .await?;
        }

        // The peer acked every batch we sent, so it now covers our starting
        // clock as well as everything it advertised.
        let peer_id = session.peer_device_id();
        let mut acked = local_clock;
        acked.merge(&peer_clock);
        let db = self.context.lock_db()?;
        device::update_peer_acked(db.conn(), &peer_id, &space_id, &acked)?;
        device::touch_peer_sync(db.conn(), &peer_id, Utc::now().timestamp_millis())?;
        let pruned = change_tracker::prune_acknowledged(db.conn(), &space_id)?;
        if pruned > 0 {
            debug!(pruned, "pruned acknowledged log entries");
        }
        Ok(())
    }

    async fn send_changes<S>(
        &self,
        stream: &mut S,
        session: &mut PeerSession,
        peer_clock: &VectorClock,
        idle: Duration,
        shutdown: &watch::Receiver<bool>,
        summary: &mut SyncSummary,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let settings = self.context.settings();
        let records = self.collect_outgoing(peer_clock)?;
        let mut batches =
            partition_batches(records, settings.batch_max_records, settings.batch_max_bytes)?;
        if batches.is_empty() {
            // explicit empty batch so the peer can take its turn
            batches.push(Vec::new());
        }
        let batch_count = batches.len() as u32;

        for (index, records) in batches.into_iter().enumerate() {
            check_shutdown(shutdown)?;
            let index = index as u32;
            let sent = records.len() as u32;
            let body = BatchBody {
                batch_index: index,
                batch_count,
                records,
            };
            send_sealed(stream, session, wire_type::MUTATION_BATCH, "mutation batch", &body)
                .await?;
            let ack: AckBody = read_sealed(stream, session, idle, wire_type::ACK, "ack").await?;
            if ack.batch_index != index {
                return Err(TransportError::InvalidMessage(format!(
                    "ack for batch {} while sending batch {index}",
                    ack.batch_index
                ))
                .into());
            }
            summary.sent += sent;
            debug!(batch = index, of = batch_count, records = sent, "batch acknowledged");
        }
        Ok(())
    }

    async fn receive_changes<S>(
        &self,
        stream: &mut S,
        session: &mut PeerSession,
        peer_clock: &VectorClock,
        idle: Duration,
        shutdown: &watch::Receiver<bool>,
        summary: &mut SyncSummary,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let peer_id = session.peer_device_id();
        let mut expected = 0u32;
        loop {
            check_shutdown(shutdown)?;
            let body: BatchBody =
                read_sealed(stream, session, idle, wire_type::MUTATION_BATCH, "mutation batch")
                    .await?;
            if body.batch_index != expected {
                return Err(TransportError::InvalidMessage(format!(
                    "batch {} arrived while expecting batch {expected}",
                    body.batch_index
                ))
                .into());
            }

            let stats = self.apply_batch(&peer_id, peer_clock, &body.records)?;
            summary.received += body.records.len() as u32;
            summary.applied += stats.applied;
            summary.skipped += stats.skipped;
            summary.conflicts += stats.conflicts;

            let ack = AckBody {
                batch_index: body.batch_index,
                applied: stats.applied,
                skipped: stats.skipped,
                conflicts: stats.conflicts,
            };
            send_sealed(stream, session, wire_type::ACK, "ack", &ack).await?;

            if body.batch_index + 1 >= body.batch_count {
                break;
            }
            expected += 1;
        }
        Ok(())
    }

    /// Apply one batch in a single transaction; the ack goes out only after
    /// the commit, so an acked batch is durable
    fn apply_batch(
        &self,
        peer_device_id: &Uuid,
        peer_clock: &VectorClock,
        records: &[MutationRecord],
    ) -> Result<ApplyStats> {
        let space_id = self.context.space_id();
        let policy = self.context.policy();
        let mut stats = ApplyStats::default();
        let mut deferred = Vec::new();

        {
            let db = self.context.lock_db()?;
            let tx = db.conn().unchecked_transaction().map_err(DatabaseError::from)?;

            for record in records {
                if change_tracker::is_seen(&tx, record)? {
                    continue;
                }
                if let Err(reason) =
                    change_tracker::validate_record(record, &space_id, |t| policy.knows_type(t))
                {
                    note_skip(&tx, record, &reason, &mut stats, &mut deferred)?;
                    continue;
                }

                let local = change_tracker::get_entity(&tx, &record.entity_id)?;
                let tombstones = change_tracker::entity_set_tombstones(&tx, &record.entity_id)?;

                let outcome = match local {
                    None => match conflict::apply_diff(None, record, &tombstones) {
                        Ok(state) => {
                            change_tracker::commit_remote_mutation(&tx, record, Some(&state))?
                        }
                        Err(reason) => {
                            note_skip(&tx, record, &reason, &mut stats, &mut deferred)?;
                            continue;
                        }
                    },
                    Some(entity) => {
                        let pending = change_tracker::local_mutations_not_covered(
                            &tx,
                            &record.entity_id,
                            peer_clock,
                        )?;
                        if pending.is_empty() {
                            // causally newer than everything local
                            match conflict::apply_diff(Some(&entity), record, &tombstones) {
                                Ok(state) => change_tracker::commit_remote_mutation(
                                    &tx,
                                    record,
                                    Some(&state),
                                )?,
                                Err(reason) => {
                                    note_skip(&tx, record, &reason, &mut stats, &mut deferred)?;
                                    continue;
                                }
                            }
                        } else {
                            match conflict::merge(policy, &entity, &pending, record, &tombstones)
                            {
                                Ok(MergeOutcome::Merged(state)) => {
                                    change_tracker::commit_remote_mutation(
                                        &tx,
                                        record,
                                        Some(&state),
                                    )?
                                }
                                Ok(MergeOutcome::Conflict(conflict_reason)) => {
                                    if let Some(newest) = conflict::newest_mutation(&pending) {
                                        let conflict_id =
                                            conflict::record_conflict(&tx, newest, record)?;
                                        stats.conflicts += 1;
                                        deferred.push(SyncEvent::ConflictDetected {
                                            conflict_id,
                                            entity_id: record.entity_id,
                                            peer_device_id: *peer_device_id,
                                        });
                                        debug!(
                                            entity = %record.entity_id,
                                            conflict_id,
                                            reason = %conflict_reason,
                                            "conflict recorded"
                                        );
                                    }
                                    change_tracker::commit_remote_mutation(&tx, record, None)?
                                }
                                Err(reason) => {
                                    note_skip(&tx, record, &reason, &mut stats, &mut deferred)?;
                                    continue;
                                }
                            }
                        }
                    }
                };
                if outcome == ApplyOutcome::Applied {
                    stats.applied += 1;
                }
            }

            tx.commit().map_err(DatabaseError::from)?;
        }

        for event in deferred {
            self.context.events().emit(event);
        }
        Ok(stats)
    }

    fn collect_outgoing(&self, peer_clock: &VectorClock) -> Result<Vec<MutationRecord>> {
        let space_id = self.context.space_id();
        let page_size = self.context.settings().batch_max_records.max(1);
        let db = self.context.lock_db()?;

        let mut out = Vec::new();
        let mut cursor = ChangeCursor {
            origin_device_id: None,
            logical_clock: 0,
        };
        loop {
            let page =
                change_tracker::changes_since(db.conn(), &space_id, peer_clock, &cursor, page_size)?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = ChangeCursor::after(last);
            out.extend(page);
        }
        Ok(out)
    }

    fn record_history(&self, summary: &SyncSummary, started_at: i64, outcome: &str) {
        let entry = SyncHistoryEntry {
            entry_id: 0,
            peer_device_id: summary.peer_device_id,
            space_id: summary.space_id,
            started_at,
            duration_ms: summary.duration_ms,
            sent: summary.sent,
            received: summary.received,
            applied: summary.applied,
            skipped: summary.skipped,
            conflicts: summary.conflicts,
            outcome: outcome.to_string(),
        };
        match self.context.lock_db() {
            Ok(db) => {
                if let Err(e) = db.append_sync_history(&entry) {
                    warn!(error = %e, "could not append sync history");
                }
            }
            Err(e) => warn!(error = %e, "could not append sync history"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ApplyStats {
    applied: u32,
    skipped: u32,
    conflicts: u32,
}

#[derive(Default)]
struct WorkerState {
    in_flight: HashSet<Uuid>,
    backoff: HashMap<Uuid, PeerBackoff>,
}

struct PeerBackoff {
    delay: Duration,
    not_before: Instant,
}

fn next_backoff(previous: Option<Duration>) -> Duration {
    previous
        .map(|d| (d * 2).min(BACKOFF_CEIL))
        .unwrap_or(BACKOFF_FLOOR)
}

fn check_shutdown(shutdown: &watch::Receiver<bool>) -> Result<()> {
    if *shutdown.borrow() {
        return Err(SyncCoreError::Cancelled);
    }
    Ok(())
}

fn note_skip(
    conn: &rusqlite::Connection,
    record: &MutationRecord,
    reason: &ApplyError,
    stats: &mut ApplyStats,
    deferred: &mut Vec<SyncEvent>,
) -> Result<()> {
    warn!(
        origin = %record.origin_device_id,
        clock = record.logical_clock,
        error = %reason,
        "skipping mutation"
    );
    change_tracker::record_skip(conn, record, reason)?;
    stats.skipped += 1;
    deferred.push(SyncEvent::MutationSkipped {
        origin_device_id: record.origin_device_id,
        logical_clock: record.logical_clock,
        reason: reason.to_string(),
    });
    Ok(())
}

/// Split records into batches within the record and byte caps; a single
/// record larger than the byte cap travels alone
fn partition_batches(
    records: Vec<MutationRecord>,
    max_records: usize,
    max_bytes: usize,
) -> Result<Vec<Vec<MutationRecord>>> {
    let max_records = max_records.max(1);
    let mut batches = Vec::new();
    let mut current: Vec<MutationRecord> = Vec::new();
    let mut current_bytes = 0usize;

    for record in records {
        let size = serde_json::to_vec(&record)
            .map_err(|e| {
                TransportError::InvalidMessage(format!("cannot encode mutation record: {e}"))
            })?
            .len();
        if !current.is_empty()
            && (current.len() >= max_records || current_bytes + size > max_bytes)
        {
            batches.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current.push(record);
        current_bytes += size;
    }
    if !current.is_empty() {
        batches.push(current);
    }
    Ok(batches)
}

async fn send_sealed<S, T>(
    stream: &mut S,
    session: &mut PeerSession,
    type_byte: u8,
    kind: &str,
    body: &T,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: Serialize,
{
    let encoded = serde_json::to_vec(body)
        .map_err(|e| TransportError::InvalidMessage(format!("cannot encode {kind} body: {e}")))?;
    let message = session.seal_message(type_byte, &encoded)?;
    write_frame(stream, &message).await?;
    Ok(())
}

async fn read_sealed<S, T>(
    stream: &mut S,
    session: &mut PeerSession,
    idle: Duration,
    type_byte: u8,
    kind: &str,
) -> Result<T>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: DeserializeOwned,
{
    let message = timeout(idle, read_frame(stream))
        .await
        .map_err(|_| {
            TransportError::ConnectionLost(format!("no {kind} within {}s", idle.as_secs()))
        })??;
    if message.type_byte() != type_byte {
        return Err(TransportError::InvalidMessage(format!(
            "expected {kind}, got {}",
            message.type_name()
        ))
        .into());
    }
    let body = session.open_message(&message)?;
    serde_json::from_slice(&body)
        .map_err(|e| TransportError::InvalidMessage(format!("bad {kind} body: {e}")).into())
}
