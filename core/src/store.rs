//! Async, shareable handle over [`Database`].
//!
//! Both the foreground (CLI, uploader API) and the background step service
//! hold clones of one [`Store`]. Calls run on the blocking pool behind a
//! single mutex, so writes to the same row are serialized and an envelope is
//! never a mix of two writers. Each committed logical operation is announced
//! once on a broadcast channel.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::clock::Clock;
use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::import::FoodLogRow;
use crate::models::{
    CheatDaySettings, CheatDayStatus, DailySteps, EntityKind, Exercise, FoodEntry, ImportSummary,
    MealWithEntries, NewExercise, NewFoodEntry, NewMeal, NewWeightEntry, OnboardingSession,
    PendingCount, Profile, ProfileUpdate, StepCycle, StepSyncState, StepWrite, StreakState, SyncAck,
    SyncRecord, SyncTombstone, UpdateExercise, UpdateFoodEntry, UpdateWeightEntry, UserId,
    WeightEntry,
};
use crate::retention::PurgeReport;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
    Synced,
    /// Retention removed old rows. Carries no entity refs; listeners reload.
    Purged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    fn user_keyed(kind: EntityKind, owner: &UserId) -> Self {
        Self::new(kind, owner.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEvent {
    pub op: ChangeOp,
    pub owner: Option<UserId>,
    pub entities: Vec<EntityRef>,
}

#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Database>>,
    events: broadcast::Sender<ChangeEvent>,
    clock: Arc<dyn Clock>,
}

impl Store {
    pub fn open(path: &Path) -> StoreResult<Self> {
        Ok(Self::from_database(Database::open(path)?))
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Ok(Self::from_database(Database::open_in_memory()?))
    }

    #[must_use]
    pub fn from_database(db: Database) -> Self {
        let clock = Arc::clone(db.clock());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            db: Arc::new(Mutex::new(db)),
            events,
            clock,
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    #[must_use]
    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    async fn with_db<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Database) -> StoreResult<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut guard = db.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard)
        })
        .await
        .map_err(|err| StoreError::Join(err.to_string()))?
    }

    fn notify(&self, op: ChangeOp, owner: Option<&UserId>, entities: Vec<EntityRef>) {
        // No subscribers is fine.
        let _ = self.events.send(ChangeEvent {
            op,
            owner: owner.cloned(),
            entities,
        });
    }

    // --- Meals ---

    pub async fn log_meal(&self, owner: &UserId, meal: NewMeal) -> StoreResult<MealWithEntries> {
        let o = owner.clone();
        let logged = self.with_db(move |db| db.log_meal(&o, meal)).await?;
        let mut refs = vec![EntityRef::new(EntityKind::Meal, &logged.meal.id)];
        refs.extend(
            logged
                .entries
                .iter()
                .map(|e| EntityRef::new(EntityKind::FoodEntry, &e.id)),
        );
        refs.push(EntityRef::user_keyed(EntityKind::Streak, owner));
        self.notify(ChangeOp::Insert, Some(owner), refs);
        Ok(logged)
    }

    pub async fn get_meal(&self, owner: &UserId, id: &str) -> StoreResult<MealWithEntries> {
        let (o, id) = (owner.clone(), id.to_string());
        self.with_db(move |db| db.get_meal(&o, &id)).await
    }

    pub async fn meals_for_date(
        &self,
        owner: &UserId,
        date: NaiveDate,
    ) -> StoreResult<Vec<MealWithEntries>> {
        let o = owner.clone();
        self.with_db(move |db| db.meals_for_date(&o, date)).await
    }

    pub async fn delete_meal_by_owner(&self, owner: &UserId, id: &str) -> StoreResult<()> {
        let (o, meal_id) = (owner.clone(), id.to_string());
        let entry_ids = self
            .with_db(move |db| db.delete_meal_by_owner(&o, &meal_id))
            .await?;
        let mut refs = vec![EntityRef::new(EntityKind::Meal, id)];
        refs.extend(
            entry_ids
                .into_iter()
                .map(|e| EntityRef::new(EntityKind::FoodEntry, e)),
        );
        self.notify(ChangeOp::Delete, Some(owner), refs);
        Ok(())
    }

    // --- Food entries ---

    pub async fn insert_food_entry(
        &self,
        owner: &UserId,
        new: NewFoodEntry,
    ) -> StoreResult<FoodEntry> {
        let o = owner.clone();
        let entry = self.with_db(move |db| db.insert_food_entry(&o, new)).await?;
        self.notify(
            ChangeOp::Insert,
            Some(owner),
            vec![
                EntityRef::new(EntityKind::FoodEntry, &entry.id),
                EntityRef::user_keyed(EntityKind::Streak, owner),
            ],
        );
        Ok(entry)
    }

    pub async fn get_food_entry(&self, owner: &UserId, id: &str) -> StoreResult<FoodEntry> {
        let (o, id) = (owner.clone(), id.to_string());
        self.with_db(move |db| db.get_food_entry(&o, &id)).await
    }

    pub async fn food_entries_for_date(
        &self,
        owner: &UserId,
        date: NaiveDate,
    ) -> StoreResult<Vec<FoodEntry>> {
        let o = owner.clone();
        self.with_db(move |db| db.food_entries_for_date(&o, date)).await
    }

    pub async fn update_food_entry_by_owner(
        &self,
        owner: &UserId,
        id: &str,
        update: UpdateFoodEntry,
    ) -> StoreResult<FoodEntry> {
        let (o, entry_id) = (owner.clone(), id.to_string());
        let entry = self
            .with_db(move |db| db.update_food_entry_by_owner(&o, &entry_id, &update))
            .await?;
        self.notify(
            ChangeOp::Update,
            Some(owner),
            vec![EntityRef::new(EntityKind::FoodEntry, id)],
        );
        Ok(entry)
    }

    pub async fn delete_food_entry_by_owner(&self, owner: &UserId, id: &str) -> StoreResult<()> {
        let (o, entry_id) = (owner.clone(), id.to_string());
        self.with_db(move |db| db.delete_food_entry_by_owner(&o, &entry_id))
            .await?;
        self.notify(
            ChangeOp::Delete,
            Some(owner),
            vec![EntityRef::new(EntityKind::FoodEntry, id)],
        );
        Ok(())
    }

    // --- Exercises ---

    pub async fn insert_exercise(&self, owner: &UserId, new: NewExercise) -> StoreResult<Exercise> {
        let o = owner.clone();
        let exercise = self.with_db(move |db| db.insert_exercise(&o, new)).await?;
        self.notify(
            ChangeOp::Insert,
            Some(owner),
            vec![
                EntityRef::new(EntityKind::Exercise, &exercise.id),
                EntityRef::user_keyed(EntityKind::Streak, owner),
            ],
        );
        Ok(exercise)
    }

    pub async fn get_exercise(&self, owner: &UserId, id: &str) -> StoreResult<Exercise> {
        let (o, id) = (owner.clone(), id.to_string());
        self.with_db(move |db| db.get_exercise(&o, &id)).await
    }

    pub async fn exercises_for_date(
        &self,
        owner: &UserId,
        date: NaiveDate,
    ) -> StoreResult<Vec<Exercise>> {
        let o = owner.clone();
        self.with_db(move |db| db.exercises_for_date(&o, date)).await
    }

    pub async fn update_exercise_by_owner(
        &self,
        owner: &UserId,
        id: &str,
        update: UpdateExercise,
    ) -> StoreResult<Exercise> {
        let (o, exercise_id) = (owner.clone(), id.to_string());
        let exercise = self
            .with_db(move |db| db.update_exercise_by_owner(&o, &exercise_id, &update))
            .await?;
        self.notify(
            ChangeOp::Update,
            Some(owner),
            vec![EntityRef::new(EntityKind::Exercise, id)],
        );
        Ok(exercise)
    }

    pub async fn delete_exercise_by_owner(&self, owner: &UserId, id: &str) -> StoreResult<()> {
        let (o, exercise_id) = (owner.clone(), id.to_string());
        self.with_db(move |db| db.delete_exercise_by_owner(&o, &exercise_id))
            .await?;
        self.notify(
            ChangeOp::Delete,
            Some(owner),
            vec![EntityRef::new(EntityKind::Exercise, id)],
        );
        Ok(())
    }

    // --- Weights ---

    pub async fn insert_weight(&self, owner: &UserId, new: NewWeightEntry) -> StoreResult<WeightEntry> {
        let o = owner.clone();
        let weight = self.with_db(move |db| db.insert_weight(&o, new)).await?;
        self.notify(
            ChangeOp::Insert,
            Some(owner),
            vec![EntityRef::new(EntityKind::Weight, &weight.id)],
        );
        Ok(weight)
    }

    pub async fn get_weight(&self, owner: &UserId, id: &str) -> StoreResult<WeightEntry> {
        let (o, id) = (owner.clone(), id.to_string());
        self.with_db(move |db| db.get_weight(&o, &id)).await
    }

    pub async fn weights_for_date(
        &self,
        owner: &UserId,
        date: NaiveDate,
    ) -> StoreResult<Vec<WeightEntry>> {
        let o = owner.clone();
        self.with_db(move |db| db.weights_for_date(&o, date)).await
    }

    pub async fn weight_history(&self, owner: &UserId, limit: usize) -> StoreResult<Vec<WeightEntry>> {
        let o = owner.clone();
        self.with_db(move |db| db.weight_history(&o, limit)).await
    }

    pub async fn update_weight_by_owner(
        &self,
        owner: &UserId,
        id: &str,
        update: UpdateWeightEntry,
    ) -> StoreResult<WeightEntry> {
        let (o, weight_id) = (owner.clone(), id.to_string());
        let weight = self
            .with_db(move |db| db.update_weight_by_owner(&o, &weight_id, &update))
            .await?;
        self.notify(
            ChangeOp::Update,
            Some(owner),
            vec![EntityRef::new(EntityKind::Weight, id)],
        );
        Ok(weight)
    }

    pub async fn delete_weight_by_owner(&self, owner: &UserId, id: &str) -> StoreResult<()> {
        let (o, weight_id) = (owner.clone(), id.to_string());
        self.with_db(move |db| db.delete_weight_by_owner(&o, &weight_id))
            .await?;
        self.notify(
            ChangeOp::Delete,
            Some(owner),
            vec![EntityRef::new(EntityKind::Weight, id)],
        );
        Ok(())
    }

    // --- Profile ---

    pub async fn get_profile(&self, owner: &UserId) -> StoreResult<Option<Profile>> {
        let o = owner.clone();
        self.with_db(move |db| db.get_profile(&o)).await
    }

    pub async fn upsert_profile(&self, owner: &UserId, update: ProfileUpdate) -> StoreResult<Profile> {
        let o = owner.clone();
        let profile = self.with_db(move |db| db.upsert_profile(&o, update)).await?;
        self.notify(
            ChangeOp::Update,
            Some(owner),
            vec![EntityRef::user_keyed(EntityKind::Profile, owner)],
        );
        Ok(profile)
    }

    // --- Daily steps ---

    pub async fn get_daily_steps(
        &self,
        owner: &UserId,
        date: NaiveDate,
    ) -> StoreResult<Option<DailySteps>> {
        let o = owner.clone();
        self.with_db(move |db| db.get_daily_steps(&o, date)).await
    }

    pub async fn daily_steps_between(
        &self,
        owner: &UserId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StoreResult<Vec<DailySteps>> {
        let o = owner.clone();
        self.with_db(move |db| db.daily_steps_between(&o, from, to))
            .await
    }

    fn notify_steps(&self, owner: &UserId, write: &StepWrite) {
        if write.raised {
            self.notify(
                ChangeOp::Update,
                Some(owner),
                vec![EntityRef::new(EntityKind::DailySteps, &write.steps.id)],
            );
        }
    }

    pub async fn record_daily_steps(
        &self,
        owner: &UserId,
        date: NaiveDate,
        count: i64,
    ) -> StoreResult<StepWrite> {
        let o = owner.clone();
        let write = self
            .with_db(move |db| db.record_daily_steps(&o, date, count))
            .await?;
        self.notify_steps(owner, &write);
        Ok(write)
    }

    pub async fn override_daily_steps(
        &self,
        owner: &UserId,
        date: NaiveDate,
        count: i64,
    ) -> StoreResult<DailySteps> {
        let o = owner.clone();
        let steps = self
            .with_db(move |db| db.override_daily_steps(&o, date, count))
            .await?;
        self.notify(
            ChangeOp::Update,
            Some(owner),
            vec![EntityRef::new(EntityKind::DailySteps, &steps.id)],
        );
        Ok(steps)
    }

    pub async fn get_step_sync_state(&self, owner: &UserId) -> StoreResult<Option<StepSyncState>> {
        let o = owner.clone();
        self.with_db(move |db| db.get_step_sync_state(&o)).await
    }

    pub async fn persist_step_cycle(
        &self,
        owner: &UserId,
        date: NaiveDate,
        count: i64,
        last_written: Option<i64>,
    ) -> StoreResult<StepCycle> {
        let o = owner.clone();
        let cycle = self
            .with_db(move |db| db.persist_step_cycle(&o, date, count, last_written))
            .await?;
        if let StepCycle::Written(write) = &cycle {
            self.notify_steps(owner, write);
        }
        Ok(cycle)
    }

    // --- Streaks ---

    pub async fn get_streak(&self, owner: &UserId) -> StoreResult<Option<StreakState>> {
        let o = owner.clone();
        self.with_db(move |db| db.get_streak(&o)).await
    }

    pub async fn check_streak(&self, owner: &UserId, today: NaiveDate) -> StoreResult<StreakState> {
        let o = owner.clone();
        self.with_db(move |db| db.check_streak(&o, today)).await
    }

    pub async fn recompute_streak(&self, owner: &UserId, today: NaiveDate) -> StoreResult<StreakState> {
        let o = owner.clone();
        let state = self
            .with_db(move |db| db.recompute_streak(&o, today))
            .await?;
        self.notify(
            ChangeOp::Update,
            Some(owner),
            vec![EntityRef::user_keyed(EntityKind::Streak, owner)],
        );
        Ok(state)
    }

    // --- Cheat day ---

    pub async fn get_cheat_day_settings(
        &self,
        owner: &UserId,
    ) -> StoreResult<Option<CheatDaySettings>> {
        let o = owner.clone();
        self.with_db(move |db| db.get_cheat_day_settings(&o)).await
    }

    pub async fn configure_cheat_day(
        &self,
        owner: &UserId,
        frequency_days: i64,
        preferred_day_of_week: Option<u32>,
        enabled: bool,
        today: NaiveDate,
    ) -> StoreResult<CheatDaySettings> {
        let o = owner.clone();
        let settings = self
            .with_db(move |db| {
                db.configure_cheat_day(&o, frequency_days, preferred_day_of_week, enabled, today)
            })
            .await?;
        self.notify(
            ChangeOp::Update,
            Some(owner),
            vec![EntityRef::user_keyed(EntityKind::CheatDay, owner)],
        );
        Ok(settings)
    }

    pub async fn cheat_day_status(
        &self,
        owner: &UserId,
        today: NaiveDate,
    ) -> StoreResult<Option<CheatDayStatus>> {
        let o = owner.clone();
        let status = self
            .with_db(move |db| db.cheat_day_status(&o, today))
            .await?;
        if status.as_ref().is_some_and(|s| s.auto_advanced) {
            self.notify(
                ChangeOp::Update,
                Some(owner),
                vec![EntityRef::user_keyed(EntityKind::CheatDay, owner)],
            );
        }
        Ok(status)
    }

    pub async fn complete_cheat_day(
        &self,
        owner: &UserId,
        today: NaiveDate,
    ) -> StoreResult<CheatDaySettings> {
        let o = owner.clone();
        let settings = self
            .with_db(move |db| db.complete_cheat_day(&o, today))
            .await?;
        self.notify(
            ChangeOp::Update,
            Some(owner),
            vec![EntityRef::user_keyed(EntityKind::CheatDay, owner)],
        );
        Ok(settings)
    }

    // --- Sync queue ---

    pub async fn list_unsynced(&self, kind: EntityKind, owner: &UserId) -> StoreResult<Vec<SyncRecord>> {
        let o = owner.clone();
        self.with_db(move |db| db.list_unsynced(kind, &o)).await
    }

    pub async fn pending_counts(&self, owner: &UserId) -> StoreResult<Vec<PendingCount>> {
        let o = owner.clone();
        self.with_db(move |db| db.pending_counts(&o)).await
    }

    pub async fn mark_synced(&self, kind: EntityKind, acks: Vec<SyncAck>) -> StoreResult<usize> {
        let refs: Vec<EntityRef> = acks
            .iter()
            .map(|ack| EntityRef::new(kind, ack.server_id.as_ref().unwrap_or(&ack.local_id)))
            .collect();
        let marked = self.with_db(move |db| db.mark_synced(kind, &acks)).await?;
        if marked > 0 {
            self.notify(ChangeOp::Synced, None, refs);
        }
        Ok(marked)
    }

    pub async fn list_tombstones(&self, owner: &UserId) -> StoreResult<Vec<SyncTombstone>> {
        let o = owner.clone();
        self.with_db(move |db| db.list_tombstones(&o)).await
    }

    pub async fn ack_tombstones(&self, seqs: Vec<i64>) -> StoreResult<usize> {
        self.with_db(move |db| db.ack_tombstones(&seqs)).await
    }

    // --- Import, onboarding, retention ---

    pub async fn import_food_log(
        &self,
        owner: &UserId,
        rows: Vec<FoodLogRow>,
        dry_run: bool,
    ) -> StoreResult<ImportSummary> {
        let o = owner.clone();
        let summary = self
            .with_db(move |db| db.import_food_log(&o, &rows, dry_run))
            .await?;
        if !summary.meal_ids.is_empty() {
            let mut refs: Vec<EntityRef> = summary
                .meal_ids
                .iter()
                .map(|id| EntityRef::new(EntityKind::Meal, id))
                .collect();
            refs.push(EntityRef::user_keyed(EntityKind::Streak, owner));
            self.notify(ChangeOp::Insert, Some(owner), refs);
        }
        Ok(summary)
    }

    pub async fn save_onboarding(
        &self,
        session_id: &str,
        partial: ProfileUpdate,
        step_index: i64,
    ) -> StoreResult<OnboardingSession> {
        let session_id = session_id.to_string();
        self.with_db(move |db| db.save_onboarding(&session_id, partial, step_index))
            .await
    }

    pub async fn load_onboarding(&self, session_id: &str) -> StoreResult<Option<OnboardingSession>> {
        let session_id = session_id.to_string();
        self.with_db(move |db| db.load_onboarding(&session_id)).await
    }

    pub async fn consume_onboarding(&self, session_id: &str, owner: &UserId) -> StoreResult<Profile> {
        let (session_id, o) = (session_id.to_string(), owner.clone());
        let profile = self
            .with_db(move |db| db.consume_onboarding(&session_id, &o))
            .await?;
        self.notify(
            ChangeOp::Update,
            Some(owner),
            vec![EntityRef::user_keyed(EntityKind::Profile, owner)],
        );
        Ok(profile)
    }

    pub async fn purge_expired_onboarding(
        &self,
        now: DateTime<Utc>,
        retention_days: i64,
    ) -> StoreResult<usize> {
        self.with_db(move |db| db.purge_expired_onboarding(now, retention_days))
            .await
    }

    pub async fn purge_synced_before(
        &self,
        owner: &UserId,
        horizon: NaiveDate,
    ) -> StoreResult<PurgeReport> {
        let o = owner.clone();
        let report = self
            .with_db(move |db| db.purge_synced_before(&o, horizon))
            .await?;
        if report.total() > 0 {
            self.notify(ChangeOp::Purged, Some(owner), Vec::new());
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::db::tests::{food, item, today, user};
    use tokio::sync::broadcast::error::TryRecvError;

    fn test_store() -> Store {
        let clock = Arc::new(FixedClock::new(today()));
        Store::from_database(Database::open_in_memory().unwrap().with_clock(clock))
    }

    #[tokio::test]
    async fn test_one_event_per_meal_batch() {
        let store = test_store();
        let mut events = store.subscribe();
        let alice = user("alice");

        let meal = store
            .log_meal(
                &alice,
                NewMeal {
                    date: today(),
                    meal_type: "lunch".to_string(),
                    name: Some("Bento".to_string()),
                    items: vec![item("Rice", 200.0), item("Fish", 180.0), item("Tea", 0.0)],
                },
            )
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.op, ChangeOp::Insert);
        assert_eq!(event.owner, Some(alice));
        assert_eq!(event.entities.len(), 5);
        assert_eq!(event.entities[0], EntityRef::new(EntityKind::Meal, &meal.meal.id));
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_failed_write_sends_nothing() {
        let store = test_store();
        let mut events = store.subscribe();
        let alice = user("alice");
        let entry = store.insert_food_entry(&alice, food(today(), "Soup")).await.unwrap();
        events.recv().await.unwrap();

        let err = store
            .delete_food_entry_by_owner(&user("mallory"), &entry.id)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unauthorized { .. }));
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_updates_through_store() {
        let store = test_store();
        let alice = user("alice");
        let entry = store.insert_food_entry(&alice, food(today(), "Soup")).await.unwrap();
        let exercise = store
            .insert_exercise(
                &alice,
                NewExercise {
                    date: today(),
                    exercise_name: "Rowing".to_string(),
                    duration_minutes: 20,
                    calories_burned: 150.0,
                    notes: None,
                },
            )
            .await
            .unwrap();
        let weight = store
            .insert_weight(
                &alice,
                NewWeightEntry {
                    date: today(),
                    weight_kg: 71.0,
                    notes: None,
                },
            )
            .await
            .unwrap();
        let mut events = store.subscribe();

        let entry = store
            .update_food_entry_by_owner(
                &alice,
                &entry.id,
                UpdateFoodEntry {
                    calories: Some(320.0),
                    ..UpdateFoodEntry::default()
                },
            )
            .await
            .unwrap();
        assert!((entry.calories - 320.0).abs() < f64::EPSILON);

        let exercise = store
            .update_exercise_by_owner(
                &alice,
                &exercise.id,
                UpdateExercise {
                    duration_minutes: Some(35),
                    ..UpdateExercise::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(exercise.duration_minutes, 35);

        let weight = store
            .update_weight_by_owner(
                &alice,
                &weight.id,
                UpdateWeightEntry {
                    weight_kg: Some(70.4),
                    ..UpdateWeightEntry::default()
                },
            )
            .await
            .unwrap();
        assert!((weight.weight_kg - 70.4).abs() < f64::EPSILON);

        for (kind, id) in [
            (EntityKind::FoodEntry, &entry.id),
            (EntityKind::Exercise, &exercise.id),
            (EntityKind::Weight, &weight.id),
        ] {
            let event = events.recv().await.unwrap();
            assert_eq!(event.op, ChangeOp::Update);
            assert_eq!(event.entities, vec![EntityRef::new(kind, id)]);
        }
        assert_eq!(entry.envelope.sync_action, Some(crate::models::SyncAction::Update));
        assert!(!weight.envelope.synced);
    }

    #[tokio::test]
    async fn test_step_event_only_when_raised() {
        let store = test_store();
        let mut events = store.subscribe();
        let alice = user("alice");

        store.record_daily_steps(&alice, today(), 500).await.unwrap();
        assert_eq!(events.recv().await.unwrap().op, ChangeOp::Update);

        let write = store.record_daily_steps(&alice, today(), 300).await.unwrap();
        assert!(!write.raised);
        assert_eq!(write.steps.count, 500);
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_mark_synced_announces_acked_rows() {
        let store = test_store();
        let alice = user("alice");
        let entry = store.insert_food_entry(&alice, food(today(), "Soup")).await.unwrap();
        let mut events = store.subscribe();

        let marked = store
            .mark_synced(EntityKind::FoodEntry, vec![SyncAck::remapped(&entry.id, "srv-1")])
            .await
            .unwrap();
        assert_eq!(marked, 1);
        let event = events.recv().await.unwrap();
        assert_eq!(event.op, ChangeOp::Synced);
        assert_eq!(event.entities, vec![EntityRef::new(EntityKind::FoodEntry, "srv-1")]);
        assert!(store.get_food_entry(&alice, "srv-1").await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_writers_serialize() {
        let store = test_store();
        let alice = user("alice");
        let mut tasks = Vec::new();
        for n in 0..16 {
            let store = store.clone();
            let alice = alice.clone();
            tasks.push(tokio::spawn(async move {
                store.record_daily_steps(&alice, today(), n * 100).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        let steps = store.get_daily_steps(&alice, today()).await.unwrap().unwrap();
        assert_eq!(steps.count, 1500);
    }
}
