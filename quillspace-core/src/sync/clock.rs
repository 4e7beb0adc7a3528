//! Vector clocks tracking what each device has seen per space

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::database::schema::parse_uuid;
use crate::database::DbResult;

/// Highest logical clock seen from each device, scoped to one space
///
/// Entries never decrease. A missing entry counts as zero, so a device the
/// clock has never heard of is behind by definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    entries: HashMap<Uuid, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, device_id: &Uuid) -> u64 {
        self.entries.get(device_id).copied().unwrap_or(0)
    }

    /// True if this clock already accounts for `(device_id, clock)`
    pub fn covers(&self, device_id: &Uuid, clock: u64) -> bool {
        self.get(device_id) >= clock
    }

    /// Raise one entry to at least `clock`
    pub fn observe(&mut self, device_id: Uuid, clock: u64) {
        let entry = self.entries.entry(device_id).or_insert(0);
        if clock > *entry {
            *entry = clock;
        }
    }

    /// Entry-wise maximum with another clock
    pub fn merge(&mut self, other: &VectorClock) {
        for (device_id, clock) in &other.entries {
            self.observe(*device_id, *clock);
        }
    }

    /// True if every entry of `other` is covered by this clock
    pub fn dominates(&self, other: &VectorClock) -> bool {
        other
            .entries
            .iter()
            .all(|(device_id, clock)| self.get(device_id) >= *clock)
    }

    /// Neither clock dominates the other: the histories diverged
    pub fn concurrent_with(&self, other: &VectorClock) -> bool {
        !self.dominates(other) && !other.dominates(self)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Uuid, &u64)> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Load the stored clock for a space
    pub fn load(conn: &Connection, space_id: &Uuid) -> DbResult<Self> {
        let mut stmt = conn.prepare(
            "SELECT device_id, logical_clock FROM vector_clocks WHERE space_id = ?1",
        )?;
        let rows = stmt.query_map(params![space_id.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;

        let mut clock = VectorClock::new();
        for row in rows {
            let (device, value) = row?;
            clock.observe(parse_uuid(&device)?, value);
        }
        Ok(clock)
    }

    /// Persist every entry, never lowering what is already stored
    pub fn save(&self, conn: &Connection, space_id: &Uuid) -> DbResult<()> {
        for (device_id, clock) in &self.entries {
            observe_clock(conn, space_id, device_id, *clock)?;
        }
        Ok(())
    }
}

/// Raise a single stored clock entry; no-op if the stored value is higher
pub fn observe_clock(
    conn: &Connection,
    space_id: &Uuid,
    device_id: &Uuid,
    clock: u64,
) -> DbResult<()> {
    conn.execute(
        "INSERT INTO vector_clocks (space_id, device_id, logical_clock) VALUES (?1, ?2, ?3)
         ON CONFLICT(space_id, device_id)
         DO UPDATE SET logical_clock = MAX(vector_clocks.logical_clock, excluded.logical_clock)",
        params![space_id.to_string(), device_id.to_string(), clock],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    #[test]
    fn observe_never_decreases() {
        let device = Uuid::new_v4();
        let mut clock = VectorClock::new();
        clock.observe(device, 5);
        clock.observe(device, 3);
        assert_eq!(clock.get(&device), 5);
    }

    #[test]
    fn missing_entry_counts_as_zero() {
        let clock = VectorClock::new();
        assert_eq!(clock.get(&Uuid::new_v4()), 0);
        assert!(clock.covers(&Uuid::new_v4(), 0));
        assert!(!clock.covers(&Uuid::new_v4(), 1));
    }

    #[test]
    fn merge_takes_entrywise_max() {
        let a_id = Uuid::new_v4();
        let b_id = Uuid::new_v4();

        let mut a = VectorClock::new();
        a.observe(a_id, 4);
        a.observe(b_id, 1);

        let mut b = VectorClock::new();
        b.observe(a_id, 2);
        b.observe(b_id, 7);

        let mut merged_ab = a.clone();
        merged_ab.merge(&b);
        let mut merged_ba = b.clone();
        merged_ba.merge(&a);

        assert_eq!(merged_ab, merged_ba);
        assert_eq!(merged_ab.get(&a_id), 4);
        assert_eq!(merged_ab.get(&b_id), 7);
    }

    #[test]
    fn dominates_and_concurrent() {
        let a_id = Uuid::new_v4();
        let b_id = Uuid::new_v4();

        let mut ahead = VectorClock::new();
        ahead.observe(a_id, 3);
        ahead.observe(b_id, 2);

        let mut behind = VectorClock::new();
        behind.observe(a_id, 1);

        assert!(ahead.dominates(&behind));
        assert!(!behind.dominates(&ahead));
        assert!(!ahead.concurrent_with(&behind));

        // Each side saw something the other has not
        let mut left = VectorClock::new();
        left.observe(a_id, 5);
        let mut right = VectorClock::new();
        right.observe(b_id, 5);
        assert!(left.concurrent_with(&right));
        assert!(right.concurrent_with(&left));
    }

    #[test]
    fn equal_clocks_are_not_concurrent() {
        let device = Uuid::new_v4();
        let mut a = VectorClock::new();
        a.observe(device, 2);
        let b = a.clone();
        assert!(a.dominates(&b));
        assert!(!a.concurrent_with(&b));
    }

    #[test]
    fn db_round_trip_is_monotonic() {
        let db = Database::in_memory().unwrap();
        let space = Uuid::new_v4();
        let device = Uuid::new_v4();

        observe_clock(db.conn(), &space, &device, 9).unwrap();
        // A lower write must not regress the stored entry
        observe_clock(db.conn(), &space, &device, 4).unwrap();

        let loaded = VectorClock::load(db.conn(), &space).unwrap();
        assert_eq!(loaded.get(&device), 9);
    }

    #[test]
    fn clocks_are_scoped_per_space() {
        let db = Database::in_memory().unwrap();
        let device = Uuid::new_v4();
        let space_a = Uuid::new_v4();
        let space_b = Uuid::new_v4();

        observe_clock(db.conn(), &space_a, &device, 3).unwrap();

        let other = VectorClock::load(db.conn(), &space_b).unwrap();
        assert!(other.is_empty());
    }
}
