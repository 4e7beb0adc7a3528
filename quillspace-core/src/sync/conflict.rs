//! Merge rules for concurrent writes
//!
//! When a remote mutation arrives for an entity that also has local
//! mutations the peer has not seen, the two histories are concurrent and the
//! fast apply path is unsafe. Each field then reconciles under a strategy
//! from the [`MergePolicy`] table. Strategies are deterministic and
//! commutative, so two devices merging each other's changes converge on the
//! same state. Anything the rules cannot merge keeps local state and files a
//! conflict record for the user to settle.

use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::change_tracker::{self, ApplyError, EntityWrite, SetTombstones};
use super::models::{EntityDiff, FieldDiff, MutationRecord};
use crate::database::schema::parse_uuid;
use crate::database::{DatabaseError, DbResult, EntityState};

/// Rich-text edits further apart than this fraction of the longer text are
/// surfaced as conflicts instead of merged
const RICH_TEXT_DIVERGENCE_LIMIT: f64 = 0.3;

/// How concurrent writes to one field reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldStrategy {
    /// Higher `(timestamp, origin device id)` wins
    LastWriteWins,
    /// Union of members; removals tombstone until a re-add at or after them
    SetUnion,
    /// Paragraph-level merge below the divergence limit
    RichText,
    /// Never merged automatically
    Structural,
}

/// Per-field merge strategies, keyed by `(entity_type, field)`
///
/// Fields without an explicit rule fall back to last-write-wins. The set of
/// entity types in the table is also the set of types this build will apply
/// from peers.
#[derive(Debug, Clone)]
pub struct MergePolicy {
    rules: HashMap<(String, String), FieldStrategy>,
    types: std::collections::HashSet<String>,
}

impl MergePolicy {
    pub fn new() -> Self {
        Self {
            rules: HashMap::new(),
            types: std::collections::HashSet::new(),
        }
    }

    /// Rules for the built-in entity types
    pub fn builtin() -> Self {
        let mut policy = Self::new();
        for (entity_type, field, strategy) in [
            ("note", "title", FieldStrategy::LastWriteWins),
            ("note", "body", FieldStrategy::RichText),
            ("note", "tags", FieldStrategy::SetUnion),
            ("note", "pinned", FieldStrategy::LastWriteWins),
            ("note", "parent_id", FieldStrategy::Structural),
            ("task", "title", FieldStrategy::LastWriteWins),
            ("task", "notes", FieldStrategy::RichText),
            ("task", "tags", FieldStrategy::SetUnion),
            ("task", "status", FieldStrategy::LastWriteWins),
            ("task", "due_at", FieldStrategy::LastWriteWins),
            ("task", "parent_id", FieldStrategy::Structural),
            ("project", "name", FieldStrategy::LastWriteWins),
            ("project", "description", FieldStrategy::RichText),
            ("project", "tags", FieldStrategy::SetUnion),
            ("project", "parent_id", FieldStrategy::Structural),
            ("category", "name", FieldStrategy::LastWriteWins),
            ("category", "color", FieldStrategy::LastWriteWins),
            ("category", "parent_id", FieldStrategy::Structural),
        ] {
            policy.register(entity_type, field, strategy);
        }
        policy
    }

    pub fn register(&mut self, entity_type: &str, field: &str, strategy: FieldStrategy) {
        self.types.insert(entity_type.to_string());
        self.rules
            .insert((entity_type.to_string(), field.to_string()), strategy);
    }

    pub fn knows_type(&self, entity_type: &str) -> bool {
        self.types.contains(entity_type)
    }

    pub fn strategy_for(&self, entity_type: &str, field: &str) -> FieldStrategy {
        self.rules
            .get(&(entity_type.to_string(), field.to_string()))
            .copied()
            .unwrap_or(FieldStrategy::LastWriteWins)
    }
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Result of merging one concurrent remote mutation
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// Both histories combined into one state
    Merged(EntityState),
    /// The rules gave up; local state stands and a conflict record is filed
    Conflict(String),
}

/// Apply a non-concurrent remote mutation to the current entity state
pub fn apply_diff(
    local: Option<&EntityState>,
    record: &MutationRecord,
    tombstones: &SetTombstones,
) -> Result<EntityState, ApplyError> {
    let (revision, mut payload, mut deleted) = match local {
        Some(entity) => (entity.revision + 1, entity.payload.clone(), entity.deleted),
        None => (1, Value::Object(Map::new()), false),
    };

    match &record.diff {
        EntityDiff::Snapshot { payload: snapshot } => {
            if !snapshot.is_object() {
                return Err(ApplyError::MalformedMutation(
                    "snapshot payload is not a JSON object".to_string(),
                ));
            }
            payload = snapshot.clone();
            deleted = false;
        }
        EntityDiff::Tombstone => {
            deleted = true;
        }
        EntityDiff::Fields(fields) => {
            apply_fields(&mut payload, fields, tombstones, record.timestamp_ms)?;
        }
    }

    Ok(EntityState {
        entity_id: record.entity_id,
        entity_type: record.entity_type.clone(),
        space_id: record.space_id,
        revision,
        updated_at: local
            .map(|e| e.updated_at)
            .unwrap_or(0)
            .max(record.timestamp_ms),
        payload,
        deleted,
        origin_device_id: record.origin_device_id,
        logical_clock: record.logical_clock,
    })
}

/// Apply field diffs onto a payload
///
/// Set additions are dropped when a newer removal tombstone stands; set
/// fields are kept lexically sorted so replicas converge byte for byte.
/// Opaque diffs travel in the log but change no state here.
pub fn apply_fields(
    payload: &mut Value,
    fields: &[FieldDiff],
    tombstones: &SetTombstones,
    timestamp_ms: i64,
) -> Result<(), ApplyError> {
    let obj = as_object_mut(payload)?;
    let empty = HashMap::new();

    for diff in fields {
        match diff {
            FieldDiff::Scalar { field, value } => {
                obj.insert(field.clone(), value.clone());
            }
            FieldDiff::SetAdd { field, members } => {
                let tombs = tombstones.get(field).unwrap_or(&empty);
                let mut set = set_members(obj.get(field));
                for member in members {
                    let blocked = tombs
                        .get(member)
                        .map(|removed_at| *removed_at > timestamp_ms)
                        .unwrap_or(false);
                    if !blocked {
                        set.insert(member.clone());
                    }
                }
                write_set(obj, field, set);
            }
            FieldDiff::SetRemove { field, members } => {
                let mut set = set_members(obj.get(field));
                for member in members {
                    set.remove(member);
                }
                write_set(obj, field, set);
            }
            FieldDiff::Text { field, content } => {
                obj.insert(field.clone(), Value::String(content.clone()));
            }
            FieldDiff::Reparent { new_parent } => {
                obj.insert("parent_id".to_string(), parent_value(new_parent));
            }
            FieldDiff::Opaque { .. } => {}
        }
    }
    Ok(())
}

/// Merge a remote mutation that is concurrent with local history
///
/// `local_pending` are the local log entries the peer has not seen; they
/// tell us which fields were touched on our side and when. On success the
/// returned state reflects both histories. Symmetric inputs produce the same
/// result on both devices.
pub fn merge(
    policy: &MergePolicy,
    local: &EntityState,
    local_pending: &[MutationRecord],
    record: &MutationRecord,
    tombstones: &SetTombstones,
) -> Result<MergeOutcome, ApplyError> {
    let touch = LocalTouch::from_pending(local, local_pending);
    let remote_meta = (record.timestamp_ms, record.origin_device_id);

    if let EntityDiff::Tombstone = record.diff {
        if local.deleted {
            return Ok(MergeOutcome::Merged(merged_state(
                local,
                record,
                local.payload.clone(),
                true,
            )));
        }
        // Delete against a concurrent edit resolves by last write wins
        let keep_deleted = touch
            .newest()
            .map(|local_meta| remote_meta > local_meta)
            .unwrap_or(true);
        return Ok(MergeOutcome::Merged(merged_state(
            local,
            record,
            local.payload.clone(),
            keep_deleted,
        )));
    }
    if local.deleted {
        // Edit against a concurrent local delete, same rule; a winning edit
        // revives the entity
        let local_meta = (local.updated_at, local.origin_device_id);
        if remote_meta <= local_meta {
            return Ok(MergeOutcome::Merged(merged_state(
                local,
                record,
                local.payload.clone(),
                true,
            )));
        }
    }

    let mut payload = local.payload.clone();

    match &record.diff {
        EntityDiff::Snapshot { payload: snapshot } => {
            let Some(snapshot) = snapshot.as_object() else {
                return Err(ApplyError::MalformedMutation(
                    "snapshot payload is not a JSON object".to_string(),
                ));
            };
            let obj = as_object_mut(&mut payload)?;

            // Fields only we have are kept: a snapshot merge never deletes
            // what the other branch still holds
            for (field, remote_value) in snapshot {
                if obj.get(field) == Some(remote_value) {
                    continue;
                }
                match policy.strategy_for(&record.entity_type, field) {
                    FieldStrategy::SetUnion => {
                        let mut set = set_members(obj.get(field));
                        let tombs = tombstones.get(field);
                        for member in set_members(Some(remote_value)) {
                            let blocked = tombs
                                .and_then(|t| t.get(&member))
                                .map(|removed_at| *removed_at > record.timestamp_ms)
                                .unwrap_or(false);
                            if !blocked {
                                set.insert(member);
                            }
                        }
                        write_set(obj, field, set);
                    }
                    FieldStrategy::RichText => match touch.get(field) {
                        None => {
                            obj.insert(field.clone(), remote_value.clone());
                        }
                        Some(local_meta) => {
                            let local_text = text_of(obj.get(field));
                            let remote_text = text_of(Some(remote_value));
                            match text_merge(&local_text, &remote_text, local_meta <= remote_meta) {
                                Some(merged) => {
                                    obj.insert(field.clone(), Value::String(merged));
                                }
                                None => {
                                    return Ok(MergeOutcome::Conflict(divergence_reason(field)))
                                }
                            }
                        }
                    },
                    FieldStrategy::Structural => match touch.get(field) {
                        None => {
                            obj.insert(field.clone(), remote_value.clone());
                        }
                        Some(_) => return Ok(MergeOutcome::Conflict(structural_reason(field))),
                    },
                    FieldStrategy::LastWriteWins => match touch.get(field) {
                        Some(local_meta) if local_meta > remote_meta => {}
                        _ => {
                            obj.insert(field.clone(), remote_value.clone());
                        }
                    },
                }
            }
        }
        EntityDiff::Fields(fields) => {
            let obj = as_object_mut(&mut payload)?;
            let empty = HashMap::new();

            for diff in fields {
                let field = diff.field_name().to_string();
                match diff {
                    FieldDiff::SetAdd { members, .. } => {
                        let tombs = tombstones.get(&field).unwrap_or(&empty);
                        let mut set = set_members(obj.get(&field));
                        for member in members {
                            let blocked = tombs
                                .get(member)
                                .map(|removed_at| *removed_at > record.timestamp_ms)
                                .unwrap_or(false);
                            if !blocked {
                                set.insert(member.clone());
                            }
                        }
                        write_set(obj, &field, set);
                    }
                    FieldDiff::SetRemove { members, .. } => {
                        // A removal only erases members our concurrent
                        // history did not re-add at or after it; the add
                        // side of the same race is let through by the
                        // tombstone check above, so both replicas keep the
                        // member
                        let mut set = set_members(obj.get(&field));
                        for member in members {
                            let kept = newest_pending_add(local_pending, &field, member)
                                .map(|added_at| added_at >= record.timestamp_ms)
                                .unwrap_or(false);
                            if !kept {
                                set.remove(member);
                            }
                        }
                        write_set(obj, &field, set);
                    }
                    FieldDiff::Opaque { .. } => {}
                    FieldDiff::Scalar { .. } | FieldDiff::Text { .. } | FieldDiff::Reparent { .. } => {
                        let candidate = match diff {
                            FieldDiff::Scalar { value, .. } => value.clone(),
                            FieldDiff::Text { content, .. } => Value::String(content.clone()),
                            FieldDiff::Reparent { new_parent } => parent_value(new_parent),
                            _ => continue,
                        };
                        match (policy.strategy_for(&record.entity_type, &field), touch.get(&field)) {
                            (_, None) => {
                                obj.insert(field, candidate);
                            }
                            (FieldStrategy::LastWriteWins, Some(local_meta))
                            | (FieldStrategy::SetUnion, Some(local_meta)) => {
                                if remote_meta > local_meta {
                                    obj.insert(field, candidate);
                                }
                            }
                            (FieldStrategy::RichText, Some(local_meta)) => {
                                let local_text = text_of(obj.get(&field));
                                let remote_text = text_of(Some(&candidate));
                                match text_merge(
                                    &local_text,
                                    &remote_text,
                                    local_meta <= remote_meta,
                                ) {
                                    Some(merged) => {
                                        obj.insert(field, Value::String(merged));
                                    }
                                    None => {
                                        return Ok(MergeOutcome::Conflict(divergence_reason(
                                            &field,
                                        )))
                                    }
                                }
                            }
                            (FieldStrategy::Structural, Some(_)) => {
                                if obj.get(&field) == Some(&candidate) {
                                    continue;
                                }
                                return Ok(MergeOutcome::Conflict(structural_reason(&field)));
                            }
                        }
                    }
                }
            }
        }
        EntityDiff::Tombstone => {}
    }

    Ok(MergeOutcome::Merged(merged_state(local, record, payload, false)))
}

fn merged_state(
    local: &EntityState,
    record: &MutationRecord,
    payload: Value,
    deleted: bool,
) -> EntityState {
    EntityState {
        entity_id: local.entity_id,
        entity_type: record.entity_type.clone(),
        space_id: local.space_id,
        revision: local.revision + 1,
        updated_at: local.updated_at.max(record.timestamp_ms),
        payload,
        deleted,
        origin_device_id: record.origin_device_id,
        logical_clock: record.logical_clock,
    }
}

/// Latest local write per field among mutations the peer has not seen
struct LocalTouch {
    whole: Option<(i64, Uuid)>,
    fields: HashMap<String, (i64, Uuid)>,
}

impl LocalTouch {
    fn from_pending(local: &EntityState, pending: &[MutationRecord]) -> Self {
        let mut touch = Self {
            whole: None,
            fields: HashMap::new(),
        };
        for record in pending {
            let meta = (record.timestamp_ms, record.origin_device_id);
            match &record.diff {
                EntityDiff::Snapshot { .. } | EntityDiff::Tombstone => {
                    touch.whole = touch.whole.max(Some(meta));
                }
                EntityDiff::Fields(fields) => {
                    for diff in fields {
                        let entry = touch
                            .fields
                            .entry(diff.field_name().to_string())
                            .or_insert(meta);
                        *entry = (*entry).max(meta);
                    }
                }
            }
        }
        if pending.is_empty() {
            // Merge called without pending context; the entity row itself
            // stands in for the local side
            touch.whole = Some((local.updated_at, local.origin_device_id));
        }
        touch
    }

    fn get(&self, field: &str) -> Option<(i64, Uuid)> {
        self.fields.get(field).copied().max(self.whole)
    }

    /// Most recent local write to any field
    fn newest(&self) -> Option<(i64, Uuid)> {
        self.fields.values().copied().max().max(self.whole)
    }
}

/// Latest pending local write that (re-)adds `member` to a set field,
/// whether as an explicit add or inside a full snapshot
fn newest_pending_add(pending: &[MutationRecord], field: &str, member: &str) -> Option<i64> {
    pending
        .iter()
        .filter(|record| match &record.diff {
            EntityDiff::Fields(fields) => fields.iter().any(|diff| match diff {
                FieldDiff::SetAdd { field: f, members } => {
                    f == field && members.iter().any(|m| m == member)
                }
                _ => false,
            }),
            EntityDiff::Snapshot { payload } => payload
                .get(field)
                .map(|value| set_members(Some(value)).contains(member))
                .unwrap_or(false),
            EntityDiff::Tombstone => false,
        })
        .map(|record| record.timestamp_ms)
        .max()
}

fn divergence_reason(field: &str) -> String {
    format!("rich text field '{field}' diverged past the merge limit")
}

fn structural_reason(field: &str) -> String {
    format!("structural field '{field}' changed on both devices")
}

/// Character counts above this switch the divergence measure from
/// character-level to paragraph-level edit distance, keeping cost bounded
const RICH_TEXT_CHAR_LIMIT: usize = 4096;

/// Merge two versions of a rich-text field
///
/// Returns `None` when the versions diverge past the limit. Otherwise edits
/// merge at paragraph granularity: shared paragraphs keep their order, and
/// paragraphs unique to one side slot in at their position, the earlier
/// writer's first.
///
/// `local_first` says whether the local edit is the earlier of the pair by
/// `(timestamp, device id)`. The walk always runs earlier-then-later, so
/// both devices merge the same pair in the same order and converge on one
/// document.
fn text_merge(local: &str, remote: &str, local_first: bool) -> Option<String> {
    if local == remote {
        return Some(local.to_string());
    }
    if divergence_ratio(local, remote) > RICH_TEXT_DIVERGENCE_LIMIT {
        return None;
    }
    let (first, second) = if local_first {
        (local, remote)
    } else {
        (remote, local)
    };
    Some(merge_paragraphs(first, second))
}

fn divergence_ratio(local: &str, remote: &str) -> f64 {
    let local_len = local.chars().count();
    let remote_len = remote.chars().count();
    let longest = local_len.max(remote_len);
    if longest == 0 {
        return 0.0;
    }

    if longest > RICH_TEXT_CHAR_LIMIT {
        let a: Vec<&str> = local.split("\n\n").collect();
        let b: Vec<&str> = remote.split("\n\n").collect();
        let longest = a.len().max(b.len());
        return edit_distance(&a, &b) as f64 / longest as f64;
    }

    let a: Vec<char> = local.chars().collect();
    let b: Vec<char> = remote.chars().collect();
    edit_distance(&a, &b) as f64 / longest as f64
}

fn merge_paragraphs(first: &str, second: &str) -> String {
    let a: Vec<&str> = first.split("\n\n").collect();
    let b: Vec<&str> = second.split("\n\n").collect();

    // table[i][j] = LCS length of a[i..] and b[j..]
    let mut table = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for i in (0..a.len()).rev() {
        for j in (0..b.len()).rev() {
            table[i][j] = if a[i] == b[j] {
                table[i + 1][j + 1] + 1
            } else {
                table[i + 1][j].max(table[i][j + 1])
            };
        }
    }

    let mut out: Vec<&str> = Vec::new();
    let mut only_a: Vec<&str> = Vec::new();
    let mut only_b: Vec<&str> = Vec::new();
    let mut balance: HashMap<&str, i32> = HashMap::new();

    let (mut i, mut j) = (0, 0);
    while i < a.len() || j < b.len() {
        if i < a.len() && j < b.len() && a[i] == b[j] {
            flush_unique(&mut out, &mut only_a, &mut only_b, &mut balance);
            out.push(a[i]);
            i += 1;
            j += 1;
        } else if j >= b.len() || (i < a.len() && table[i + 1][j] >= table[i][j + 1]) {
            only_a.push(a[i]);
            i += 1;
        } else {
            only_b.push(b[j]);
            j += 1;
        }
    }
    flush_unique(&mut out, &mut only_a, &mut only_b, &mut balance);

    out.join("\n\n")
}

/// Emit the paragraphs unique to each side since the last shared one,
/// first side's first
///
/// A paragraph that moved shows up as unique on both sides of the walk,
/// possibly in different regions. `balance` counts the copies already
/// emitted per side (positive for the first side, negative for the second)
/// so the twin copy is dropped instead of duplicated.
fn flush_unique<'p>(
    out: &mut Vec<&'p str>,
    only_a: &mut Vec<&'p str>,
    only_b: &mut Vec<&'p str>,
    balance: &mut HashMap<&'p str, i32>,
) {
    for para in only_a.drain(..) {
        let n = balance.entry(para).or_insert(0);
        if *n >= 0 {
            out.push(para);
        }
        *n += 1;
    }
    for para in only_b.drain(..) {
        let n = balance.entry(para).or_insert(0);
        if *n <= 0 {
            out.push(para);
        }
        *n -= 1;
    }
}

fn edit_distance<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0usize; b.len() + 1];
    for (i, item_a) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, item_b) in b.iter().enumerate() {
            let substitute = prev[j] + usize::from(item_a != item_b);
            cur[j + 1] = substitute.min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

fn as_object_mut(payload: &mut Value) -> Result<&mut Map<String, Value>, ApplyError> {
    if payload.is_null() {
        *payload = Value::Object(Map::new());
    }
    payload.as_object_mut().ok_or_else(|| {
        ApplyError::MalformedMutation("entity payload is not a JSON object".to_string())
    })
}

fn set_members(value: Option<&Value>) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    if let Some(Value::Array(items)) = value {
        for item in items {
            if let Value::String(s) = item {
                out.insert(s.clone());
            }
        }
    }
    out
}

fn write_set(obj: &mut Map<String, Value>, field: &str, members: BTreeSet<String>) {
    obj.insert(
        field.to_string(),
        Value::Array(members.into_iter().map(Value::String).collect()),
    );
}

fn text_of(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    }
}

fn parent_value(parent: &Option<Uuid>) -> Value {
    match parent {
        Some(id) => Value::String(id.to_string()),
        None => Value::Null,
    }
}

// --- Conflict record store ---

/// An unresolved divergence kept for the user
///
/// Rows exist only while the conflict is open; resolving one removes it.
#[derive(Debug, Clone, Serialize)]
pub struct ConflictRecord {
    pub conflict_id: i64,
    pub entity_id: Uuid,
    pub space_id: Uuid,
    pub local_mutation: MutationRecord,
    pub remote_mutation: MutationRecord,
    pub detected_at: i64,
}

/// Which side a conflict resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    KeepLocal,
    AcceptRemote,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::KeepLocal => "local",
            Resolution::AcceptRemote => "remote",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" | "keep_local" => Some(Resolution::KeepLocal),
            "remote" | "accept_remote" => Some(Resolution::AcceptRemote),
            _ => None,
        }
    }
}

/// The most recent mutation by wall clock, ties broken by logical clock
pub fn newest_mutation(records: &[MutationRecord]) -> Option<&MutationRecord> {
    records
        .iter()
        .max_by_key(|r| (r.timestamp_ms, r.logical_clock, r.origin_device_id))
}

/// File a conflict between a local and a remote mutation
pub fn record_conflict(
    conn: &Connection,
    local: &MutationRecord,
    remote: &MutationRecord,
) -> DbResult<i64> {
    let local_blob =
        serde_json::to_vec(local).map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let remote_blob =
        serde_json::to_vec(remote).map_err(|e| DatabaseError::Serialization(e.to_string()))?;

    conn.execute(
        "INSERT INTO conflict_records
             (entity_id, space_id, local_mutation, remote_mutation, detected_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            remote.entity_id.to_string(),
            remote.space_id.to_string(),
            local_blob,
            remote_blob,
            Utc::now().timestamp_millis()
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_conflict(conn: &Connection, conflict_id: i64) -> DbResult<Option<ConflictRecord>> {
    let row = conn
        .query_row(
            "SELECT conflict_id, entity_id, space_id, local_mutation, remote_mutation,
                    detected_at
             FROM conflict_records WHERE conflict_id = ?1",
            params![conflict_id],
            conflict_row,
        )
        .optional()?;
    row.map(decode_conflict_row).transpose()
}

/// Unresolved conflicts of a space, oldest first
pub fn list_pending(conn: &Connection, space_id: &Uuid) -> DbResult<Vec<ConflictRecord>> {
    let mut stmt = conn.prepare(
        "SELECT conflict_id, entity_id, space_id, local_mutation, remote_mutation,
                detected_at
         FROM conflict_records
         WHERE space_id = ?1
         ORDER BY detected_at",
    )?;
    let rows = stmt.query_map(params![space_id.to_string()], conflict_row)?;

    let mut out = Vec::new();
    for row in rows {
        out.push(decode_conflict_row(row?)?);
    }
    Ok(out)
}

/// Settle a pending conflict
///
/// The chosen side is re-recorded as a fresh local mutation, so the decision
/// propagates to peers like any other write, and the record is dropped in
/// the same transaction. Returns `None` if the conflict does not exist or
/// was already resolved.
pub fn resolve_conflict(
    conn: &Connection,
    device_id: &Uuid,
    conflict_id: i64,
    resolution: Resolution,
) -> DbResult<Option<MutationRecord>> {
    let tx = conn.unchecked_transaction()?;
    let Some(conflict) = get_conflict(&tx, conflict_id)? else {
        return Ok(None);
    };

    let local = change_tracker::get_entity(&tx, &conflict.entity_id)?;
    let write = match resolution {
        Resolution::KeepLocal => {
            let entity = local.ok_or_else(|| {
                DatabaseError::Other("conflict references a missing entity".to_string())
            })?;
            if entity.deleted {
                EntityWrite::tombstone(&entity)
            } else {
                EntityWrite::snapshot(
                    entity.entity_id,
                    &entity.entity_type,
                    entity.space_id,
                    entity.payload.clone(),
                )
            }
        }
        Resolution::AcceptRemote => {
            let tombstones = change_tracker::entity_set_tombstones(&tx, &conflict.entity_id)?;
            let state = apply_diff(local.as_ref(), &conflict.remote_mutation, &tombstones)
                .map_err(|e| {
                    DatabaseError::Other(format!("conflicted mutation no longer applies: {e}"))
                })?;
            if state.deleted {
                EntityWrite::tombstone(&state)
            } else {
                EntityWrite::snapshot(
                    state.entity_id,
                    &state.entity_type,
                    state.space_id,
                    state.payload,
                )
            }
        }
    };

    let record = change_tracker::record_local_mutation(&tx, device_id, &write)?;
    tx.execute(
        "DELETE FROM conflict_records WHERE conflict_id = ?1",
        params![conflict_id],
    )?;
    tx.commit()?;
    Ok(Some(record))
}

type ConflictRow = (i64, String, String, Vec<u8>, Vec<u8>, i64);

fn conflict_row(row: &rusqlite::Row) -> rusqlite::Result<ConflictRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn decode_conflict_row(row: ConflictRow) -> DbResult<ConflictRecord> {
    let (conflict_id, entity_id, space_id, local_blob, remote_blob, detected_at) = row;
    let local_mutation = serde_json::from_slice(&local_blob)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let remote_mutation = serde_json::from_slice(&remote_blob)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

    Ok(ConflictRecord {
        conflict_id,
        entity_id: parse_uuid(&entity_id)?,
        space_id: parse_uuid(&space_id)?,
        local_mutation,
        remote_mutation,
        detected_at,
    })
}
