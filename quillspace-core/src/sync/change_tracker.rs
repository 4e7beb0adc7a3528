//! Mutation log and change tracking
//!
//! Every entity write flows through here. A write and its log record commit
//! in a single transaction, so any entity state can be reconstructed by
//! replaying its mutation chain and no write escapes synchronization. The
//! log's `(origin_device_id, logical_clock)` uniqueness doubles as the
//! idempotency seen-set for remote mutations.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use uuid::Uuid;

use super::clock::{self, VectorClock};
use super::models::{EntityDiff, FieldDiff, MutationRecord};
use crate::database::schema::parse_uuid;
use crate::database::{DatabaseError, DbResult, EntityState};

/// Per-mutation failures that skip the offending record instead of aborting
/// the sync round.
#[derive(Error, Debug)]
pub enum ApplyError {
    #[error("Malformed mutation: {0}")]
    MalformedMutation(String),

    #[error("Unknown entity type: {0}")]
    UnknownEntityType(String),
}

/// Outcome of committing one remote mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Entity state updated
    Applied,
    /// The `(origin, clock)` pair was already in the log; nothing changed
    AlreadySeen,
    /// Mutation logged but local state kept; a conflict record was filed
    ConflictRecorded,
}

/// A local entity write about to be recorded
#[derive(Debug, Clone)]
pub struct EntityWrite {
    pub entity_id: Uuid,
    pub entity_type: String,
    pub space_id: Uuid,
    /// Change description sent to peers
    pub diff: EntityDiff,
    /// Full entity payload after the write
    pub payload: serde_json::Value,
    pub deleted: bool,
}

impl EntityWrite {
    /// Full-state write: create or replace an entity
    pub fn snapshot(
        entity_id: Uuid,
        entity_type: &str,
        space_id: Uuid,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            entity_id,
            entity_type: entity_type.to_string(),
            space_id,
            diff: EntityDiff::Snapshot {
                payload: payload.clone(),
            },
            payload,
            deleted: false,
        }
    }

    /// Delete an entity, keeping its row as a tombstone
    pub fn tombstone(entity: &EntityState) -> Self {
        Self {
            entity_id: entity.entity_id,
            entity_type: entity.entity_type.clone(),
            space_id: entity.space_id,
            diff: EntityDiff::Tombstone,
            payload: entity.payload.clone(),
            deleted: true,
        }
    }
}

/// Position in the `(origin, clock)` ordered change stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeCursor {
    pub origin_device_id: Option<Uuid>,
    pub logical_clock: u64,
}

impl ChangeCursor {
    /// Cursor pointing just past the given record
    pub fn after(record: &MutationRecord) -> Self {
        Self {
            origin_device_id: Some(record.origin_device_id),
            logical_clock: record.logical_clock,
        }
    }
}

/// Record a local write: one transaction covering the clock tick, the log
/// append, the entity upsert, set-tombstone bookkeeping, and the space
/// vector clock.
pub fn record_local_mutation(
    conn: &Connection,
    device_id: &Uuid,
    write: &EntityWrite,
) -> DbResult<MutationRecord> {
    let tx = conn.unchecked_transaction()?;

    let logical_clock = next_logical_clock(&tx)?;
    let timestamp_ms = Utc::now().timestamp_millis();
    let record = MutationRecord {
        entity_id: write.entity_id,
        entity_type: write.entity_type.clone(),
        space_id: write.space_id,
        origin_device_id: *device_id,
        logical_clock,
        diff: write.diff.clone(),
        timestamp_ms,
    };

    insert_log_record(&tx, &record)?;

    let revision = get_entity(&tx, &write.entity_id)?
        .map(|e| e.revision + 1)
        .unwrap_or(1);
    write_entity_state(
        &tx,
        &EntityState {
            entity_id: write.entity_id,
            entity_type: write.entity_type.clone(),
            space_id: write.space_id,
            revision,
            updated_at: timestamp_ms,
            payload: write.payload.clone(),
            deleted: write.deleted,
            origin_device_id: *device_id,
            logical_clock,
        },
    )?;

    record_set_tombstones(&tx, &record)?;
    clock::observe_clock(&tx, &write.space_id, device_id, logical_clock)?;

    tx.commit()?;
    Ok(record)
}

/// Commit one remote mutation inside the caller's transaction
///
/// Idempotent on `(origin, clock)`. `new_state` is the conflict-resolved
/// state to materialize; `None` files nothing here and reports
/// `ConflictRecorded`, the caller persists the conflict record itself.
pub fn commit_remote_mutation(
    conn: &Connection,
    record: &MutationRecord,
    new_state: Option<&EntityState>,
) -> DbResult<ApplyOutcome> {
    if !insert_log_record(conn, record)? {
        return Ok(ApplyOutcome::AlreadySeen);
    }

    // Lamport receive rule: jump past the sender's clock
    conn.execute(
        "UPDATE tracker_state SET logical_clock = MAX(logical_clock, ?1) + 1 WHERE id = 1",
        params![record.logical_clock],
    )?;

    record_set_tombstones(conn, record)?;
    clock::observe_clock(
        conn,
        &record.space_id,
        &record.origin_device_id,
        record.logical_clock,
    )?;

    match new_state {
        Some(state) => {
            write_entity_state(conn, state)?;
            Ok(ApplyOutcome::Applied)
        }
        None => Ok(ApplyOutcome::ConflictRecorded),
    }
}

/// Changes a peer at `since` has not seen, ordered by `(origin, clock)`
///
/// Pages from `cursor`; pass `ChangeCursor::after` of the last returned
/// record to resume. Restartable at any point because the order is total
/// and stable.
pub fn changes_since(
    conn: &Connection,
    space_id: &Uuid,
    since: &VectorClock,
    cursor: &ChangeCursor,
    limit: usize,
) -> DbResult<Vec<MutationRecord>> {
    let mut out = Vec::new();

    for origin in log_origins(conn, space_id)? {
        if out.len() >= limit {
            break;
        }
        if let Some(cursor_origin) = cursor.origin_device_id {
            if origin < cursor_origin {
                continue;
            }
        }

        let mut floor = since.get(&origin);
        if cursor.origin_device_id == Some(origin) {
            floor = floor.max(cursor.logical_clock);
        }

        let mut stmt = conn.prepare(
            "SELECT entity_id, entity_type, space_id, origin_device_id, logical_clock,
                    diff, timestamp_ms
             FROM mutation_log
             WHERE space_id = ?1 AND origin_device_id = ?2 AND logical_clock > ?3
             ORDER BY logical_clock
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![
                space_id.to_string(),
                origin.to_string(),
                floor,
                (limit - out.len()) as i64
            ],
            record_row,
        )?;

        for row in rows {
            out.push(decode_record_row(row?)?);
        }
    }

    Ok(out)
}

/// How many changes `changes_since` would eventually return
pub fn count_changes_since(
    conn: &Connection,
    space_id: &Uuid,
    since: &VectorClock,
) -> DbResult<u64> {
    let mut total = 0u64;
    for origin in log_origins(conn, space_id)? {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM mutation_log
             WHERE space_id = ?1 AND origin_device_id = ?2 AND logical_clock > ?3",
            params![space_id.to_string(), origin.to_string(), since.get(&origin)],
            |row| row.get(0),
        )?;
        total += count;
    }
    Ok(total)
}

/// Local log entries for one entity that `peer_clock` does not cover;
/// non-empty means the peer's incoming mutation is concurrent with ours
pub fn local_mutations_not_covered(
    conn: &Connection,
    entity_id: &Uuid,
    peer_clock: &VectorClock,
) -> DbResult<Vec<MutationRecord>> {
    let mut stmt = conn.prepare(
        "SELECT entity_id, entity_type, space_id, origin_device_id, logical_clock,
                diff, timestamp_ms
         FROM mutation_log
         WHERE entity_id = ?1
         ORDER BY origin_device_id, logical_clock",
    )?;
    let rows = stmt.query_map(params![entity_id.to_string()], record_row)?;

    let mut out = Vec::new();
    for row in rows {
        let record = decode_record_row(row?)?;
        if !peer_clock.covers(&record.origin_device_id, record.logical_clock) {
            out.push(record);
        }
    }
    Ok(out)
}

/// Whether the `(origin, clock)` pair is already in the log
pub fn is_seen(conn: &Connection, record: &MutationRecord) -> DbResult<bool> {
    let seen: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM mutation_log
                       WHERE origin_device_id = ?1 AND logical_clock = ?2)",
        params![
            record.origin_device_id.to_string(),
            record.logical_clock
        ],
        |row| row.get(0),
    )?;
    Ok(seen)
}

/// Validate a remote record before applying it
pub fn validate_record(
    record: &MutationRecord,
    space_id: &Uuid,
    knows_type: impl Fn(&str) -> bool,
) -> Result<(), ApplyError> {
    if record.entity_id.is_nil() {
        return Err(ApplyError::MalformedMutation("nil entity id".to_string()));
    }
    if record.entity_type.is_empty() {
        return Err(ApplyError::MalformedMutation("empty entity type".to_string()));
    }
    if record.space_id != *space_id {
        return Err(ApplyError::MalformedMutation(format!(
            "record for space {} arrived in a session for space {}",
            record.space_id, space_id
        )));
    }
    if record.logical_clock == 0 {
        return Err(ApplyError::MalformedMutation("zero logical clock".to_string()));
    }
    if let EntityDiff::Fields(fields) = &record.diff {
        if fields.is_empty() {
            return Err(ApplyError::MalformedMutation("empty field list".to_string()));
        }
    }
    if !knows_type(&record.entity_type) {
        return Err(ApplyError::UnknownEntityType(record.entity_type.clone()));
    }
    Ok(())
}

/// Record a mutation skipped with an [`ApplyError`] so it can be surfaced
pub fn record_skip(
    conn: &Connection,
    record: &MutationRecord,
    reason: &ApplyError,
) -> DbResult<()> {
    conn.execute(
        "INSERT INTO skipped_mutations
             (origin_device_id, logical_clock, entity_id, reason, occurred_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            record.origin_device_id.to_string(),
            record.logical_clock,
            record.entity_id.to_string(),
            reason.to_string(),
            Utc::now().timestamp_millis()
        ],
    )?;
    Ok(())
}

/// Delete log entries every registered peer has acknowledged
///
/// A record leaves the log only once each peer's stored acked clock covers
/// it; with no registered peers nothing is pruned.
pub fn prune_acknowledged(conn: &Connection, space_id: &Uuid) -> DbResult<u64> {
    let acked = super::device::load_peer_acked_clocks(conn, space_id)?;
    if acked.is_empty() {
        return Ok(0);
    }

    let mut pruned = 0u64;
    for origin in log_origins(conn, space_id)? {
        let floor = acked.iter().map(|clock| clock.get(&origin)).min().unwrap_or(0);
        if floor == 0 {
            continue;
        }
        pruned += conn.execute(
            "DELETE FROM mutation_log
             WHERE space_id = ?1 AND origin_device_id = ?2 AND logical_clock <= ?3",
            params![space_id.to_string(), origin.to_string(), floor],
        )? as u64;
    }
    Ok(pruned)
}

/// Current value of the local Lamport counter
pub fn current_logical_clock(conn: &Connection) -> DbResult<u64> {
    let clock = conn.query_row(
        "SELECT logical_clock FROM tracker_state WHERE id = 1",
        [],
        |row| row.get(0),
    )?;
    Ok(clock)
}

pub fn get_entity(conn: &Connection, entity_id: &Uuid) -> DbResult<Option<EntityState>> {
    let row = conn
        .query_row(
            "SELECT entity_id, entity_type, space_id, revision, updated_at, payload,
                    deleted, origin_device_id, logical_clock
             FROM entities WHERE entity_id = ?1",
            params![entity_id.to_string()],
            entity_row,
        )
        .optional()?;
    row.map(decode_entity_row).transpose()
}

/// All entities of a space, tombstones included
pub fn list_entities(conn: &Connection, space_id: &Uuid) -> DbResult<Vec<EntityState>> {
    let mut stmt = conn.prepare(
        "SELECT entity_id, entity_type, space_id, revision, updated_at, payload,
                deleted, origin_device_id, logical_clock
         FROM entities WHERE space_id = ?1 ORDER BY updated_at DESC",
    )?;
    let rows = stmt.query_map(params![space_id.to_string()], entity_row)?;

    let mut out = Vec::new();
    for row in rows {
        out.push(decode_entity_row(row?)?);
    }
    Ok(out)
}

/// Removal tombstones of an entity, `field -> member -> removed_at`
pub type SetTombstones = std::collections::HashMap<String, std::collections::HashMap<String, i64>>;

/// All active set tombstones for an entity
pub fn entity_set_tombstones(conn: &Connection, entity_id: &Uuid) -> DbResult<SetTombstones> {
    let mut stmt = conn.prepare(
        "SELECT field, member, removed_at FROM set_tombstones WHERE entity_id = ?1",
    )?;
    let rows = stmt.query_map(params![entity_id.to_string()], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
        ))
    })?;

    let mut out = SetTombstones::new();
    for row in rows {
        let (field, member, removed_at) = row?;
        out.entry(field).or_default().insert(member, removed_at);
    }
    Ok(out)
}

/// Active tombstones for one set-valued field
pub fn set_tombstones_for(
    conn: &Connection,
    entity_id: &Uuid,
    field: &str,
) -> DbResult<std::collections::HashMap<String, i64>> {
    let mut stmt = conn.prepare(
        "SELECT member, removed_at FROM set_tombstones WHERE entity_id = ?1 AND field = ?2",
    )?;
    let rows = stmt.query_map(params![entity_id.to_string(), field], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;

    let mut out = std::collections::HashMap::new();
    for row in rows {
        let (member, removed_at) = row?;
        out.insert(member, removed_at);
    }
    Ok(out)
}

fn next_logical_clock(conn: &Connection) -> DbResult<u64> {
    conn.execute(
        "UPDATE tracker_state SET logical_clock = logical_clock + 1 WHERE id = 1",
        [],
    )?;
    current_logical_clock(conn)
}

/// Append to the log; false if the `(origin, clock)` pair was already there
fn insert_log_record(conn: &Connection, record: &MutationRecord) -> DbResult<bool> {
    let diff_blob = serde_json::to_vec(&record.diff)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

    let inserted = conn.execute(
        "INSERT OR IGNORE INTO mutation_log
             (entity_id, entity_type, space_id, origin_device_id, logical_clock,
              diff, timestamp_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            record.entity_id.to_string(),
            record.entity_type,
            record.space_id.to_string(),
            record.origin_device_id.to_string(),
            record.logical_clock,
            diff_blob,
            record.timestamp_ms
        ],
    )?;
    Ok(inserted > 0)
}

pub(crate) fn write_entity_state(conn: &Connection, state: &EntityState) -> DbResult<()> {
    let payload = serde_json::to_string(&state.payload)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

    conn.execute(
        "INSERT INTO entities
             (entity_id, entity_type, space_id, revision, updated_at, payload,
              deleted, origin_device_id, logical_clock)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(entity_id) DO UPDATE SET
             entity_type = excluded.entity_type,
             space_id = excluded.space_id,
             revision = excluded.revision,
             updated_at = excluded.updated_at,
             payload = excluded.payload,
             deleted = excluded.deleted,
             origin_device_id = excluded.origin_device_id,
             logical_clock = excluded.logical_clock",
        params![
            state.entity_id.to_string(),
            state.entity_type,
            state.space_id.to_string(),
            state.revision,
            state.updated_at,
            payload,
            state.deleted,
            state.origin_device_id.to_string(),
            state.logical_clock
        ],
    )?;
    Ok(())
}

/// Keep the set-tombstone table in step with set diffs: removals are
/// tombstoned, a re-add at or after the removal clears the tombstone.
fn record_set_tombstones(conn: &Connection, record: &MutationRecord) -> DbResult<()> {
    let EntityDiff::Fields(fields) = &record.diff else {
        return Ok(());
    };

    for field_diff in fields {
        match field_diff {
            FieldDiff::SetRemove { field, members } => {
                for member in members {
                    conn.execute(
                        "INSERT INTO set_tombstones (entity_id, field, member, removed_at)
                         VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT(entity_id, field, member)
                         DO UPDATE SET removed_at = MAX(removed_at, excluded.removed_at)",
                        params![
                            record.entity_id.to_string(),
                            field,
                            member,
                            record.timestamp_ms
                        ],
                    )?;
                }
            }
            FieldDiff::SetAdd { field, members } => {
                for member in members {
                    conn.execute(
                        "DELETE FROM set_tombstones
                         WHERE entity_id = ?1 AND field = ?2 AND member = ?3
                           AND removed_at <= ?4",
                        params![
                            record.entity_id.to_string(),
                            field,
                            member,
                            record.timestamp_ms
                        ],
                    )?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn log_origins(conn: &Connection, space_id: &Uuid) -> DbResult<Vec<Uuid>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT origin_device_id FROM mutation_log
         WHERE space_id = ?1 ORDER BY origin_device_id",
    )?;
    let rows = stmt.query_map(params![space_id.to_string()], |row| row.get::<_, String>(0))?;

    let mut out = Vec::new();
    for row in rows {
        out.push(parse_uuid(&row?)?);
    }
    Ok(out)
}

type RecordRow = (String, String, String, String, u64, Vec<u8>, i64);

fn record_row(row: &rusqlite::Row) -> rusqlite::Result<RecordRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn decode_record_row(row: RecordRow) -> DbResult<MutationRecord> {
    let (entity_id, entity_type, space_id, origin, logical_clock, diff_blob, timestamp_ms) = row;
    let diff: EntityDiff = serde_json::from_slice(&diff_blob)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

    Ok(MutationRecord {
        entity_id: parse_uuid(&entity_id)?,
        entity_type,
        space_id: parse_uuid(&space_id)?,
        origin_device_id: parse_uuid(&origin)?,
        logical_clock,
        diff,
        timestamp_ms,
    })
}

type EntityRow = (String, String, String, i64, i64, String, bool, String, u64);

fn entity_row(row: &rusqlite::Row) -> rusqlite::Result<EntityRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn decode_entity_row(row: EntityRow) -> DbResult<EntityState> {
    let (entity_id, entity_type, space_id, revision, updated_at, payload, deleted, origin, clock) =
        row;
    let payload = serde_json::from_str(&payload)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

    Ok(EntityState {
        entity_id: parse_uuid(&entity_id)?,
        entity_type,
        space_id: parse_uuid(&space_id)?,
        revision,
        updated_at,
        payload,
        deleted,
        origin_device_id: parse_uuid(&origin)?,
        logical_clock: clock,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use serde_json::json;

    fn setup() -> (Database, Uuid, Uuid) {
        (Database::in_memory().unwrap(), Uuid::new_v4(), Uuid::new_v4())
    }

    fn write_note(db: &Database, device: &Uuid, space: &Uuid, title: &str) -> MutationRecord {
        let write = EntityWrite::snapshot(Uuid::new_v4(), "note", *space, json!({"title": title}));
        record_local_mutation(db.conn(), device, &write).unwrap()
    }

    #[test]
    fn local_mutations_get_increasing_clocks() {
        let (db, device, space) = setup();
        let first = write_note(&db, &device, &space, "one");
        let second = write_note(&db, &device, &space, "two");

        assert_eq!(first.logical_clock, 1);
        assert_eq!(second.logical_clock, 2);
        assert_eq!(current_logical_clock(db.conn()).unwrap(), 2);
    }

    #[test]
    fn write_updates_entity_and_self_clock() {
        let (db, device, space) = setup();
        let record = write_note(&db, &device, &space, "groceries");

        let entity = get_entity(db.conn(), &record.entity_id).unwrap().unwrap();
        assert_eq!(entity.revision, 1);
        assert_eq!(entity.payload["title"], "groceries");
        assert!(!entity.deleted);
        assert_eq!(entity.logical_clock, record.logical_clock);

        let clock = VectorClock::load(db.conn(), &space).unwrap();
        assert_eq!(clock.get(&device), record.logical_clock);
    }

    #[test]
    fn rewrite_bumps_revision() {
        let (db, device, space) = setup();
        let record = write_note(&db, &device, &space, "v1");

        let write = EntityWrite::snapshot(record.entity_id, "note", space, json!({"title": "v2"}));
        record_local_mutation(db.conn(), &device, &write).unwrap();

        let entity = get_entity(db.conn(), &record.entity_id).unwrap().unwrap();
        assert_eq!(entity.revision, 2);
        assert_eq!(entity.payload["title"], "v2");
    }

    #[test]
    fn tombstone_keeps_row() {
        let (db, device, space) = setup();
        let record = write_note(&db, &device, &space, "doomed");
        let entity = get_entity(db.conn(), &record.entity_id).unwrap().unwrap();

        record_local_mutation(db.conn(), &device, &EntityWrite::tombstone(&entity)).unwrap();

        let entity = get_entity(db.conn(), &record.entity_id).unwrap().unwrap();
        assert!(entity.deleted);
        assert_eq!(entity.revision, 2);
    }

    #[test]
    fn changes_since_empty_clock_returns_everything_in_order() {
        let (db, device, space) = setup();
        for i in 0..5 {
            write_note(&db, &device, &space, &format!("note {i}"));
        }

        let changes = changes_since(
            db.conn(),
            &space,
            &VectorClock::new(),
            &ChangeCursor::default(),
            100,
        )
        .unwrap();

        assert_eq!(changes.len(), 5);
        let clocks: Vec<u64> = changes.iter().map(|c| c.logical_clock).collect();
        assert_eq!(clocks, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn changes_since_respects_peer_clock() {
        let (db, device, space) = setup();
        for i in 0..5 {
            write_note(&db, &device, &space, &format!("note {i}"));
        }

        let mut peer_clock = VectorClock::new();
        peer_clock.observe(device, 3);

        let changes = changes_since(db.conn(), &space, &peer_clock, &ChangeCursor::default(), 100)
            .unwrap();
        let clocks: Vec<u64> = changes.iter().map(|c| c.logical_clock).collect();
        assert_eq!(clocks, vec![4, 5]);

        assert_eq!(count_changes_since(db.conn(), &space, &peer_clock).unwrap(), 2);
    }

    #[test]
    fn cursor_pages_without_overlap() {
        let (db, device, space) = setup();
        for i in 0..7 {
            write_note(&db, &device, &space, &format!("note {i}"));
        }

        let mut cursor = ChangeCursor::default();
        let mut collected = Vec::new();
        loop {
            let page = changes_since(db.conn(), &space, &VectorClock::new(), &cursor, 3).unwrap();
            if page.is_empty() {
                break;
            }
            cursor = ChangeCursor::after(page.last().unwrap());
            collected.extend(page);
        }

        let clocks: Vec<u64> = collected.iter().map(|c| c.logical_clock).collect();
        assert_eq!(clocks, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn remote_commit_is_idempotent() {
        let (db, _, space) = setup();
        let remote_device = Uuid::new_v4();
        let record = MutationRecord {
            entity_id: Uuid::new_v4(),
            entity_type: "note".to_string(),
            space_id: space,
            origin_device_id: remote_device,
            logical_clock: 10,
            diff: EntityDiff::Snapshot {
                payload: json!({"title": "from peer"}),
            },
            timestamp_ms: 1_700_000_000_000,
        };
        let state = EntityState {
            entity_id: record.entity_id,
            entity_type: "note".to_string(),
            space_id: space,
            revision: 1,
            updated_at: record.timestamp_ms,
            payload: json!({"title": "from peer"}),
            deleted: false,
            origin_device_id: remote_device,
            logical_clock: 10,
        };

        let first = commit_remote_mutation(db.conn(), &record, Some(&state)).unwrap();
        assert_eq!(first, ApplyOutcome::Applied);

        let second = commit_remote_mutation(db.conn(), &record, Some(&state)).unwrap();
        assert_eq!(second, ApplyOutcome::AlreadySeen);

        // Lamport rule: the local counter jumped past the remote clock
        assert!(current_logical_clock(db.conn()).unwrap() > 10);

        let clock = VectorClock::load(db.conn(), &space).unwrap();
        assert_eq!(clock.get(&remote_device), 10);
    }

    #[test]
    fn uncovered_local_mutations_detect_concurrency() {
        let (db, device, space) = setup();
        let record = write_note(&db, &device, &space, "local edit");

        // Peer that saw nothing from us: our write is concurrent
        let uncovered =
            local_mutations_not_covered(db.conn(), &record.entity_id, &VectorClock::new()).unwrap();
        assert_eq!(uncovered.len(), 1);

        // Peer that saw our write: nothing concurrent
        let mut peer_clock = VectorClock::new();
        peer_clock.observe(device, record.logical_clock);
        let uncovered =
            local_mutations_not_covered(db.conn(), &record.entity_id, &peer_clock).unwrap();
        assert!(uncovered.is_empty());
    }

    #[test]
    fn set_remove_tombstones_and_readd_clears() {
        let (db, device, space) = setup();
        let entity_id = Uuid::new_v4();

        let remove = EntityWrite {
            entity_id,
            entity_type: "note".to_string(),
            space_id: space,
            diff: EntityDiff::Fields(vec![FieldDiff::SetRemove {
                field: "tags".to_string(),
                members: vec!["stale".to_string()],
            }]),
            payload: json!({"tags": []}),
            deleted: false,
        };
        record_local_mutation(db.conn(), &device, &remove).unwrap();

        let tombs = set_tombstones_for(db.conn(), &entity_id, "tags").unwrap();
        assert!(tombs.contains_key("stale"));

        let readd = EntityWrite {
            entity_id,
            entity_type: "note".to_string(),
            space_id: space,
            diff: EntityDiff::Fields(vec![FieldDiff::SetAdd {
                field: "tags".to_string(),
                members: vec!["stale".to_string()],
            }]),
            payload: json!({"tags": ["stale"]}),
            deleted: false,
        };
        record_local_mutation(db.conn(), &device, &readd).unwrap();

        let tombs = set_tombstones_for(db.conn(), &entity_id, "tags").unwrap();
        assert!(tombs.is_empty());
    }

    #[test]
    fn validate_rejects_malformed_records() {
        let space = Uuid::new_v4();
        let good = MutationRecord {
            entity_id: Uuid::new_v4(),
            entity_type: "note".to_string(),
            space_id: space,
            origin_device_id: Uuid::new_v4(),
            logical_clock: 1,
            diff: EntityDiff::Tombstone,
            timestamp_ms: 0,
        };
        assert!(validate_record(&good, &space, |_| true).is_ok());

        let mut wrong_space = good.clone();
        wrong_space.space_id = Uuid::new_v4();
        assert!(matches!(
            validate_record(&wrong_space, &space, |_| true),
            Err(ApplyError::MalformedMutation(_))
        ));

        let mut no_type = good.clone();
        no_type.entity_type.clear();
        assert!(validate_record(&no_type, &space, |_| true).is_err());

        let mut empty_fields = good.clone();
        empty_fields.diff = EntityDiff::Fields(Vec::new());
        assert!(validate_record(&empty_fields, &space, |_| true).is_err());

        assert!(matches!(
            validate_record(&good, &space, |_| false),
            Err(ApplyError::UnknownEntityType(_))
        ));
    }

    #[test]
    fn prune_stops_at_least_acknowledged_clock() {
        let (db, device, space) = setup();
        for i in 0..5 {
            write_note(&db, &device, &space, &format!("note {i}"));
        }

        // No registered peers: nothing may be pruned
        assert_eq!(prune_acknowledged(db.conn(), &space).unwrap(), 0);

        let peer = Uuid::new_v4();
        super::super::device::upsert_peer(db.conn(), &peer, "laptop", &[2u8; 33]).unwrap();
        let mut acked = VectorClock::new();
        acked.observe(device, 3);
        super::super::device::update_peer_acked(db.conn(), &peer, &space, &acked).unwrap();

        assert_eq!(prune_acknowledged(db.conn(), &space).unwrap(), 3);

        let remaining = changes_since(
            db.conn(),
            &space,
            &VectorClock::new(),
            &ChangeCursor::default(),
            100,
        )
        .unwrap();
        let clocks: Vec<u64> = remaining.iter().map(|c| c.logical_clock).collect();
        assert_eq!(clocks, vec![4, 5]);
    }
}
