//! What the external uploader sees: pending rows with their envelopes, the
//! acknowledgement that flips them to synced, and deletion tombstones.
//!
//! Acknowledging never changes `last_modified`. Id remaps and the synced flag
//! are applied in one immediate transaction, so no other writer can touch a
//! row between its remap and the flag flip.

use rusqlite::{Connection, params};

use crate::db::{Database, Record, begin, select_records};
use crate::error::{StoreError, StoreResult};
use crate::models::{
    CheatDaySettings, DailySteps, EntityKind, Exercise, FoodEntry, Meal, PendingCount, Profile,
    StreakState, SyncAck, SyncRecord, SyncTombstone, UserId, WeightEntry,
};

fn unsynced<R: Record>(conn: &Connection, owner: &UserId) -> StoreResult<Vec<SyncRecord>> {
    let rows = select_records::<R, _>(
        conn,
        "WHERE user_id = ?1 AND synced = 0 ORDER BY last_modified, rowid",
        [owner],
    )?;
    rows.into_iter()
        .map(|row| -> StoreResult<SyncRecord> {
            Ok(SyncRecord {
                kind: R::KIND,
                id: row.id().to_string(),
                owner: row.owner().clone(),
                envelope: row.envelope().clone(),
                payload: serde_json::to_value(&row)?,
            })
        })
        .collect()
}

fn row_exists(conn: &Connection, kind: EntityKind, id: &str) -> StoreResult<bool> {
    let count: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM {} WHERE {} = ?1",
            kind.table(),
            kind.id_column()
        ),
        [id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Moves a row from its local id to the id the server assigned, carrying
/// child references along.
fn remap_id(conn: &Connection, kind: EntityKind, local_id: &str, server_id: &str) -> StoreResult<()> {
    if kind.keyed_by_user() {
        return Err(StoreError::validation(format!(
            "{kind} rows are keyed by user and cannot be remapped"
        )));
    }
    if row_exists(conn, kind, server_id)? {
        return Err(StoreError::Conflict(format!(
            "cannot remap {kind} {local_id}: id {server_id} is already in use"
        )));
    }
    conn.execute(
        &format!("UPDATE {} SET id = ?1 WHERE id = ?2", kind.table()),
        params![server_id, local_id],
    )?;
    if kind == EntityKind::Meal {
        conn.execute(
            "UPDATE food_entries SET meal_id = ?1 WHERE meal_id = ?2",
            params![server_id, local_id],
        )?;
    }
    Ok(())
}

impl Database {
    /// Rows of `kind` owned by `owner` that still need uploading, oldest
    /// change first.
    pub fn list_unsynced(&self, kind: EntityKind, owner: &UserId) -> StoreResult<Vec<SyncRecord>> {
        match kind {
            EntityKind::Meal => unsynced::<Meal>(&self.conn, owner),
            EntityKind::FoodEntry => unsynced::<FoodEntry>(&self.conn, owner),
            EntityKind::Exercise => unsynced::<Exercise>(&self.conn, owner),
            EntityKind::Weight => unsynced::<WeightEntry>(&self.conn, owner),
            EntityKind::Profile => unsynced::<Profile>(&self.conn, owner),
            EntityKind::DailySteps => unsynced::<DailySteps>(&self.conn, owner),
            EntityKind::Streak => unsynced::<StreakState>(&self.conn, owner),
            EntityKind::CheatDay => unsynced::<CheatDaySettings>(&self.conn, owner),
        }
    }

    pub fn pending_counts(&self, owner: &UserId) -> StoreResult<Vec<PendingCount>> {
        EntityKind::ALL
            .into_iter()
            .map(|kind| -> StoreResult<PendingCount> {
                let count = self.conn.query_row(
                    &format!(
                        "SELECT COUNT(*) FROM {} WHERE user_id = ?1 AND synced = 0",
                        kind.table()
                    ),
                    [owner],
                    |row| row.get(0),
                )?;
                Ok(PendingCount { kind, count })
            })
            .collect()
    }

    /// Mark uploaded rows as synced, remapping ids where the server assigned
    /// new ones. Acks for rows that no longer exist, or that changed since
    /// they were listed, are skipped. Returns how many rows were marked.
    pub fn mark_synced(&mut self, kind: EntityKind, acks: &[SyncAck]) -> StoreResult<usize> {
        let tx = begin(&mut self.conn)?;
        // Meal remaps rewrite food_entries.meal_id after the meal id moves.
        tx.pragma_update(None, "defer_foreign_keys", "ON")?;

        let mut marked = 0;
        let mut remapped = 0;
        for ack in acks {
            if !row_exists(&tx, kind, &ack.local_id)? {
                tracing::debug!(
                    event = "sync_ack_skipped",
                    kind = %kind,
                    id = %ack.local_id,
                    reason = "missing"
                );
                continue;
            }

            let target = match ack.server_id.as_deref() {
                Some(server_id) if server_id != ack.local_id => {
                    remap_id(&tx, kind, &ack.local_id, server_id)?;
                    remapped += 1;
                    server_id
                }
                _ => ack.local_id.as_str(),
            };

            let changed = tx.execute(
                &format!(
                    "UPDATE {} SET synced = 1, sync_action = NULL
                     WHERE {} = ?1 AND (?2 IS NULL OR last_modified = ?2)",
                    kind.table(),
                    kind.id_column()
                ),
                params![target, ack.last_modified],
            )?;
            if changed == 0 {
                tracing::debug!(
                    event = "sync_ack_skipped",
                    kind = %kind,
                    id = %target,
                    reason = "modified_since_listing"
                );
            }
            marked += changed;
        }
        tx.commit()?;

        tracing::info!(event = "sync_marked", kind = %kind, marked, remapped);
        Ok(marked)
    }

    pub fn list_tombstones(&self, owner: &UserId) -> StoreResult<Vec<SyncTombstone>> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, kind, id, user_id, deleted_at FROM sync_tombstones
             WHERE user_id = ?1 ORDER BY seq",
        )?;
        let tombstones = stmt
            .query_map([owner], |row| {
                Ok(SyncTombstone {
                    seq: row.get(0)?,
                    kind: row.get(1)?,
                    id: row.get(2)?,
                    user_id: row.get(3)?,
                    deleted_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tombstones)
    }

    /// Forget tombstones the uploader has propagated.
    pub fn ack_tombstones(&mut self, seqs: &[i64]) -> StoreResult<usize> {
        let tx = begin(&mut self.conn)?;
        let mut removed = 0;
        for seq in seqs {
            removed += tx.execute("DELETE FROM sync_tombstones WHERE seq = ?1", [seq])?;
        }
        tx.commit()?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::db::tests::{food, item, test_db, today, user};
    use crate::models::{NewMeal, SyncAction, UpdateFoodEntry};

    #[test]
    fn test_list_unsynced_includes_envelope_and_payload() {
        let (mut db, _) = test_db();
        let alice = user("alice");
        let entry = db.insert_food_entry(&alice, food(today(), "Apple")).unwrap();
        db.insert_food_entry(&user("bob"), food(today(), "Cake")).unwrap();

        let pending = db.list_unsynced(EntityKind::FoodEntry, &alice).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, entry.id);
        assert_eq!(pending[0].envelope.sync_action, Some(SyncAction::Create));
        assert_eq!(pending[0].payload["food_name"], "Apple");
        assert_eq!(pending[0].payload["sync_action"], "create");

        // The streak row created by the insert is pending too.
        assert_eq!(db.list_unsynced(EntityKind::Streak, &alice).unwrap().len(), 1);
    }

    #[test]
    fn test_mark_synced_preserves_last_modified() {
        let (mut db, clock) = test_db();
        let alice = user("alice");
        let entry = db.insert_food_entry(&alice, food(today(), "Apple")).unwrap();

        clock.set_now(clock.now() + chrono::Duration::hours(1));
        let marked = db
            .mark_synced(EntityKind::FoodEntry, &[SyncAck::new(&entry.id)])
            .unwrap();
        assert_eq!(marked, 1);

        let after = db.get_food_entry(&alice, &entry.id).unwrap();
        assert!(after.envelope.synced);
        assert_eq!(after.envelope.sync_action, None);
        assert_eq!(after.envelope.last_modified, entry.envelope.last_modified);
        assert!(db.list_unsynced(EntityKind::FoodEntry, &alice).unwrap().is_empty());
    }

    #[test]
    fn test_mark_synced_skips_rows_changed_since_listing() {
        let (mut db, clock) = test_db();
        let alice = user("alice");
        let entry = db.insert_food_entry(&alice, food(today(), "Apple")).unwrap();
        let listed = db.list_unsynced(EntityKind::FoodEntry, &alice).unwrap();

        clock.set_now(clock.now() + chrono::Duration::minutes(1));
        db.update_food_entry_by_owner(
            &alice,
            &entry.id,
            &UpdateFoodEntry {
                calories: Some(10.0),
                ..UpdateFoodEntry::default()
            },
        )
        .unwrap();

        let ack = SyncAck::new(&entry.id).seen_at(listed[0].envelope.last_modified);
        assert_eq!(db.mark_synced(EntityKind::FoodEntry, &[ack]).unwrap(), 0);
        let still = db.get_food_entry(&alice, &entry.id).unwrap();
        assert!(!still.envelope.synced);
        assert_eq!(still.envelope.sync_action, Some(SyncAction::Update));
    }

    #[test]
    fn test_meal_remap_keeps_entry_references() {
        let (mut db, _) = test_db();
        let alice = user("alice");
        let logged = db
            .log_meal(
                &alice,
                NewMeal {
                    date: today(),
                    meal_type: "dinner".to_string(),
                    name: None,
                    items: vec![item("Rice", 200.0), item("Beans", 150.0)],
                },
            )
            .unwrap();

        let marked = db
            .mark_synced(
                EntityKind::Meal,
                &[SyncAck::remapped(&logged.meal.id, "srv-meal-1")],
            )
            .unwrap();
        assert_eq!(marked, 1);

        let meal = db.get_meal(&alice, "srv-meal-1").unwrap();
        assert!(meal.meal.envelope.synced);
        assert_eq!(meal.entries.len(), 2);
        assert!(
            meal.entries
                .iter()
                .all(|e| e.meal_id.as_deref() == Some("srv-meal-1"))
        );
        assert!(matches!(
            db.get_meal(&alice, &logged.meal.id),
            Err(StoreError::NotFound { .. })
        ));
        // Entries themselves are still pending.
        assert_eq!(db.list_unsynced(EntityKind::FoodEntry, &alice).unwrap().len(), 2);
    }

    #[test]
    fn test_remap_onto_existing_id_conflicts_and_rolls_back() {
        let (mut db, _) = test_db();
        let alice = user("alice");
        let a = db.insert_food_entry(&alice, food(today(), "A")).unwrap();
        let b = db.insert_food_entry(&alice, food(today(), "B")).unwrap();

        let err = db
            .mark_synced(
                EntityKind::FoodEntry,
                &[SyncAck::new(&a.id), SyncAck::remapped(&b.id, &a.id)],
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        // The first ack was rolled back with the rest.
        assert!(!db.get_food_entry(&alice, &a.id).unwrap().envelope.synced);
    }

    #[test]
    fn test_user_keyed_kinds_cannot_be_remapped() {
        let (mut db, _) = test_db();
        let alice = user("alice");
        db.check_streak(&alice, today()).unwrap();
        let err = db
            .mark_synced(EntityKind::Streak, &[SyncAck::remapped("alice", "x")])
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert_eq!(
            db.mark_synced(EntityKind::Streak, &[SyncAck::new("alice")])
                .unwrap(),
            1
        );
    }

    #[test]
    fn test_repeated_ack_is_harmless() {
        let (mut db, _) = test_db();
        let alice = user("alice");
        let entry = db.insert_food_entry(&alice, food(today(), "Apple")).unwrap();
        let ack = SyncAck::remapped(&entry.id, "srv-1");
        assert_eq!(db.mark_synced(EntityKind::FoodEntry, &[ack.clone()]).unwrap(), 1);
        // Replayed after a crash: local id is gone, nothing happens.
        assert_eq!(db.mark_synced(EntityKind::FoodEntry, &[ack]).unwrap(), 0);
        assert!(db.get_food_entry(&alice, "srv-1").unwrap().envelope.synced);
    }

    #[test]
    fn test_pending_counts_and_tombstones() {
        let (mut db, _) = test_db();
        let alice = user("alice");
        let entry = db.insert_food_entry(&alice, food(today(), "Apple")).unwrap();
        db.record_daily_steps(&alice, today(), 100).unwrap();

        let counts = db.pending_counts(&alice).unwrap();
        let count_of = |kind| counts.iter().find(|c| c.kind == kind).unwrap().count;
        assert_eq!(count_of(EntityKind::FoodEntry), 1);
        assert_eq!(count_of(EntityKind::DailySteps), 1);
        assert_eq!(count_of(EntityKind::Weight), 0);

        db.mark_synced(EntityKind::FoodEntry, &[SyncAck::new(&entry.id)])
            .unwrap();
        db.delete_food_entry_by_owner(&alice, &entry.id).unwrap();
        let tombstones = db.list_tombstones(&alice).unwrap();
        assert_eq!(tombstones.len(), 1);
        assert_eq!(tombstones[0].kind, EntityKind::FoodEntry);

        assert_eq!(db.ack_tombstones(&[tombstones[0].seq]).unwrap(), 1);
        assert!(db.list_tombstones(&alice).unwrap().is_empty());
    }
}
