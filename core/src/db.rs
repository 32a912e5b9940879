use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use serde::Serialize;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{SchemaError, StoreError, StoreResult};
use crate::models::{
    DailySteps, EntityKind, Exercise, FoodEntry, Meal, MealWithEntries, NewExercise,
    NewFoodEntry, NewFoodItem, NewMeal, NewWeightEntry, Profile, ProfileUpdate, StepCycle,
    StepSyncState, StepWrite, SyncEnvelope, UpdateExercise, UpdateFoodEntry, UpdateWeightEntry,
    UserId, WeightEntry,
    validate_exercise, validate_exercise_update, validate_food_item, validate_food_update,
    validate_meal_type, validate_profile_update, validate_step_count, validate_weight,
};
use crate::{schema, streak};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Synchronous record store over one SQLite connection.
///
/// Every mutation rewrites the row's sync envelope in the same statement that
/// changes its data. Update and delete check ownership first and fail with
/// [`StoreError::Unauthorized`] or [`StoreError::NotFound`] without touching
/// the row.
pub struct Database {
    pub(crate) conn: Connection,
    clock: Arc<dyn Clock>,
}

/// A row type living in one of the syncable tables.
pub(crate) trait Record: Serialize + Sized {
    const KIND: EntityKind;
    /// Column list in the order `from_row` reads it.
    const COLUMNS: &'static str;

    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self>;
    fn id(&self) -> &str;
    fn owner(&self) -> &UserId;
    fn envelope(&self) -> &SyncEnvelope;
}

pub(crate) fn select_records<R: Record, P: rusqlite::Params>(
    conn: &Connection,
    clause: &str,
    params: P,
) -> StoreResult<Vec<R>> {
    let sql = format!("SELECT {} FROM {} {clause}", R::COLUMNS, R::KIND.table());
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params, R::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub(crate) fn select_record<R: Record>(conn: &Connection, id: &str) -> StoreResult<Option<R>> {
    let sql = format!(
        "SELECT {} FROM {} WHERE {} = ?1",
        R::COLUMNS,
        R::KIND.table(),
        R::KIND.id_column()
    );
    Ok(conn.query_row(&sql, [id], R::from_row).optional()?)
}

/// Ownership read. A missing row is `NotFound`; a row owned by someone else
/// is `Unauthorized`.
pub(crate) fn check_owner(
    conn: &Connection,
    kind: EntityKind,
    id: &str,
    owner: &UserId,
) -> StoreResult<()> {
    let sql = format!(
        "SELECT user_id FROM {} WHERE {} = ?1",
        kind.table(),
        kind.id_column()
    );
    let found: Option<String> = conn.query_row(&sql, [id], |row| row.get(0)).optional()?;
    match found {
        None => Err(StoreError::not_found(kind, id)),
        Some(user) if user == owner.as_str() => Ok(()),
        Some(_) => Err(StoreError::Unauthorized {
            kind,
            id: id.to_string(),
            owner: owner.to_string(),
        }),
    }
}

/// Leaves a tombstone for rows the uploader has already seen, so the deletion
/// can be propagated. Never-uploaded rows just disappear.
pub(crate) fn tombstone_if_uploaded(
    conn: &Connection,
    kind: EntityKind,
    id: &str,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO sync_tombstones (kind, id, user_id, deleted_at)
             SELECT ?1, id, user_id, ?2 FROM {}
             WHERE id = ?3 AND (synced = 1 OR sync_action = 'update')",
            kind.table()
        ),
        params![kind.as_str(), now, id],
    )?;
    Ok(())
}

fn delete_owned(
    conn: &Connection,
    kind: EntityKind,
    id: &str,
    owner: &UserId,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    check_owner(conn, kind, id, owner)?;
    tombstone_if_uploaded(conn, kind, id, now)?;
    conn.execute(
        &format!("DELETE FROM {} WHERE id = ?1 AND user_id = ?2", kind.table()),
        params![id, owner],
    )?;
    Ok(())
}

pub(crate) fn begin(conn: &mut Connection) -> StoreResult<Transaction<'_>> {
    Ok(conn.transaction_with_behavior(TransactionBehavior::Immediate)?)
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn action_str(envelope: &SyncEnvelope) -> Option<&'static str> {
    envelope.sync_action.map(crate::models::SyncAction::as_str)
}

// --- Row mapping ---

impl Record for Meal {
    const KIND: EntityKind = EntityKind::Meal;
    const COLUMNS: &'static str =
        "id, user_id, date, meal_type, name, created_at, synced, sync_action, last_modified";

    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            date: row.get(2)?,
            meal_type: row.get(3)?,
            name: row.get(4)?,
            created_at: row.get(5)?,
            envelope: SyncEnvelope::from_row(row, 6)?,
        })
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn owner(&self) -> &UserId {
        &self.user_id
    }

    fn envelope(&self) -> &SyncEnvelope {
        &self.envelope
    }
}

impl Record for FoodEntry {
    const KIND: EntityKind = EntityKind::FoodEntry;
    const COLUMNS: &'static str = "id, user_id, meal_id, date, meal_type, food_name, calories,
        protein_g, carbs_g, fat_g, serving_g, healthiness_rating, notes, created_at,
        synced, sync_action, last_modified";

    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            meal_id: row.get(2)?,
            date: row.get(3)?,
            meal_type: row.get(4)?,
            food_name: row.get(5)?,
            calories: row.get(6)?,
            protein_g: row.get(7)?,
            carbs_g: row.get(8)?,
            fat_g: row.get(9)?,
            serving_g: row.get(10)?,
            healthiness_rating: row.get(11)?,
            notes: row.get(12)?,
            created_at: row.get(13)?,
            envelope: SyncEnvelope::from_row(row, 14)?,
        })
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn owner(&self) -> &UserId {
        &self.user_id
    }

    fn envelope(&self) -> &SyncEnvelope {
        &self.envelope
    }
}

impl Record for Exercise {
    const KIND: EntityKind = EntityKind::Exercise;
    const COLUMNS: &'static str = "id, user_id, date, exercise_name, duration_minutes,
        calories_burned, notes, created_at, synced, sync_action, last_modified";

    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            date: row.get(2)?,
            exercise_name: row.get(3)?,
            duration_minutes: row.get(4)?,
            calories_burned: row.get(5)?,
            notes: row.get(6)?,
            created_at: row.get(7)?,
            envelope: SyncEnvelope::from_row(row, 8)?,
        })
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn owner(&self) -> &UserId {
        &self.user_id
    }

    fn envelope(&self) -> &SyncEnvelope {
        &self.envelope
    }
}

impl Record for WeightEntry {
    const KIND: EntityKind = EntityKind::Weight;
    const COLUMNS: &'static str =
        "id, user_id, date, weight_kg, notes, created_at, synced, sync_action, last_modified";

    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            date: row.get(2)?,
            weight_kg: row.get(3)?,
            notes: row.get(4)?,
            created_at: row.get(5)?,
            envelope: SyncEnvelope::from_row(row, 6)?,
        })
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn owner(&self) -> &UserId {
        &self.user_id
    }

    fn envelope(&self) -> &SyncEnvelope {
        &self.envelope
    }
}

impl Record for Profile {
    const KIND: EntityKind = EntityKind::Profile;
    const COLUMNS: &'static str = "user_id, first_name, last_name, height_cm, weight_kg, age,
        gender, activity_level, weight_goal, target_weight_kg, starting_weight_kg,
        is_imperial_units, onboarding_complete, synced, sync_action, last_modified";

    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            user_id: row.get(0)?,
            first_name: row.get(1)?,
            last_name: row.get(2)?,
            height_cm: row.get(3)?,
            weight_kg: row.get(4)?,
            age: row.get(5)?,
            gender: row.get(6)?,
            activity_level: row.get(7)?,
            weight_goal: row.get(8)?,
            target_weight_kg: row.get(9)?,
            starting_weight_kg: row.get(10)?,
            is_imperial_units: row.get(11)?,
            onboarding_complete: row.get(12)?,
            envelope: SyncEnvelope::from_row(row, 13)?,
        })
    }

    fn id(&self) -> &str {
        self.user_id.as_str()
    }

    fn owner(&self) -> &UserId {
        &self.user_id
    }

    fn envelope(&self) -> &SyncEnvelope {
        &self.envelope
    }
}

impl Record for DailySteps {
    const KIND: EntityKind = EntityKind::DailySteps;
    const COLUMNS: &'static str = "id, user_id, date, count, synced, sync_action, last_modified";

    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            date: row.get(2)?,
            count: row.get(3)?,
            envelope: SyncEnvelope::from_row(row, 4)?,
        })
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn owner(&self) -> &UserId {
        &self.user_id
    }

    fn envelope(&self) -> &SyncEnvelope {
        &self.envelope
    }
}

// --- Insert helpers shared with batch import ---

pub(crate) fn insert_meal_row(conn: &Connection, meal: &Meal) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO meals (id, user_id, date, meal_type, name, created_at,
                            synced, sync_action, last_modified)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            meal.id,
            meal.user_id,
            meal.date,
            meal.meal_type,
            meal.name,
            meal.created_at,
            meal.envelope.synced,
            action_str(&meal.envelope),
            meal.envelope.last_modified,
        ],
    )?;
    Ok(())
}

pub(crate) fn insert_food_row(conn: &Connection, entry: &FoodEntry) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO food_entries (id, user_id, meal_id, date, meal_type, food_name, calories,
                                   protein_g, carbs_g, fat_g, serving_g, healthiness_rating,
                                   notes, created_at, synced, sync_action, last_modified)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            entry.id,
            entry.user_id,
            entry.meal_id,
            entry.date,
            entry.meal_type,
            entry.food_name,
            entry.calories,
            entry.protein_g,
            entry.carbs_g,
            entry.fat_g,
            entry.serving_g,
            entry.healthiness_rating,
            entry.notes,
            entry.created_at,
            entry.envelope.synced,
            action_str(&entry.envelope),
            entry.envelope.last_modified,
        ],
    )?;
    Ok(())
}

fn food_entry_from_item(
    owner: &UserId,
    meal_id: Option<String>,
    date: NaiveDate,
    meal_type: &str,
    item: NewFoodItem,
    now: DateTime<Utc>,
) -> FoodEntry {
    FoodEntry {
        id: new_id(),
        user_id: owner.clone(),
        meal_id,
        date,
        meal_type: meal_type.to_string(),
        food_name: item.food_name.trim().to_string(),
        calories: item.calories,
        protein_g: item.protein_g,
        carbs_g: item.carbs_g,
        fat_g: item.fat_g,
        serving_g: item.serving_g,
        healthiness_rating: item.healthiness_rating,
        notes: item.notes,
        created_at: now,
        envelope: SyncEnvelope::created(now),
    }
}

/// Inserts a meal and its food entries. The caller owns the transaction.
/// `meal_type` must already be validated.
pub(crate) fn insert_meal_batch(
    conn: &Connection,
    owner: &UserId,
    date: NaiveDate,
    meal_type: &str,
    name: Option<String>,
    items: Vec<NewFoodItem>,
    now: DateTime<Utc>,
) -> StoreResult<MealWithEntries> {
    let meal = Meal {
        id: new_id(),
        user_id: owner.clone(),
        date,
        meal_type: meal_type.to_string(),
        name,
        created_at: now,
        envelope: SyncEnvelope::created(now),
    };
    insert_meal_row(conn, &meal)?;

    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        let entry =
            food_entry_from_item(owner, Some(meal.id.clone()), date, meal_type, item, now);
        insert_food_row(conn, &entry)?;
        entries.push(entry);
    }
    Ok(MealWithEntries { meal, entries })
}

/// Raise-only step upsert: a lower or equal count leaves the row and its
/// envelope untouched.
pub(crate) fn raise_daily_steps(
    conn: &Connection,
    owner: &UserId,
    date: NaiveDate,
    count: i64,
    now: DateTime<Utc>,
) -> StoreResult<StepWrite> {
    let changed = conn.execute(
        "INSERT INTO daily_steps (id, user_id, date, count, synced, sync_action, last_modified)
         VALUES (?1, ?2, ?3, ?4, 0, 'create', ?5)
         ON CONFLICT(user_id, date) DO UPDATE SET
            count = excluded.count,
            synced = 0,
            sync_action = 'update',
            last_modified = excluded.last_modified
         WHERE excluded.count > daily_steps.count",
        params![new_id(), owner, date, count, now],
    )?;
    let steps = load_daily_steps(conn, owner, date)?
        .ok_or_else(|| StoreError::not_found(EntityKind::DailySteps, date.to_string()))?;
    Ok(StepWrite {
        steps,
        raised: changed > 0,
    })
}

fn load_daily_steps(
    conn: &Connection,
    owner: &UserId,
    date: NaiveDate,
) -> StoreResult<Option<DailySteps>> {
    let mut rows = select_records::<DailySteps, _>(
        conn,
        "WHERE user_id = ?1 AND date = ?2",
        params![owner, date],
    )?;
    Ok(rows.pop())
}

pub(crate) fn upsert_profile_row(
    conn: &Connection,
    owner: &UserId,
    update: &ProfileUpdate,
    complete_onboarding: bool,
    now: DateTime<Utc>,
) -> StoreResult<Profile> {
    conn.execute(
        "INSERT INTO profiles (user_id, first_name, last_name, height_cm, weight_kg, age, gender,
                               activity_level, weight_goal, target_weight_kg, starting_weight_kg,
                               is_imperial_units, onboarding_complete,
                               synced, sync_action, last_modified)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, COALESCE(?12, 0), ?13,
                 0, 'create', ?14)
         ON CONFLICT(user_id) DO UPDATE SET
            first_name = COALESCE(excluded.first_name, first_name),
            last_name = COALESCE(excluded.last_name, last_name),
            height_cm = COALESCE(excluded.height_cm, height_cm),
            weight_kg = COALESCE(excluded.weight_kg, weight_kg),
            age = COALESCE(excluded.age, age),
            gender = COALESCE(excluded.gender, gender),
            activity_level = COALESCE(excluded.activity_level, activity_level),
            weight_goal = COALESCE(excluded.weight_goal, weight_goal),
            target_weight_kg = COALESCE(excluded.target_weight_kg, target_weight_kg),
            starting_weight_kg = COALESCE(excluded.starting_weight_kg, starting_weight_kg),
            is_imperial_units = COALESCE(?12, is_imperial_units),
            onboarding_complete = MAX(onboarding_complete, excluded.onboarding_complete),
            synced = 0,
            sync_action = 'update',
            last_modified = excluded.last_modified",
        params![
            owner,
            update.first_name,
            update.last_name,
            update.height_cm,
            update.weight_kg,
            update.age,
            update.gender,
            update.activity_level,
            update.weight_goal,
            update.target_weight_kg,
            update.starting_weight_kg,
            update.is_imperial_units,
            complete_onboarding,
            now,
        ],
    )?;
    select_record::<Profile>(conn, owner.as_str())?
        .ok_or_else(|| StoreError::not_found(EntityKind::Profile, owner.as_str()))
}

impl Database {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path).map_err(|source| SchemaError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })
        .map_err(SchemaError::Pragma)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(|source| SchemaError::Open {
            path: ":memory:".into(),
            source,
        })?;
        Self::init(conn)
    }

    fn init(mut conn: Connection) -> StoreResult<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(SchemaError::Pragma)?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(SchemaError::Pragma)?;
        schema::ensure_schema(&mut conn)?;
        Ok(Self {
            conn,
            clock: Arc::new(SystemClock),
        })
    }

    /// Replace the clock used for "today" and envelope timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // --- Meals ---

    /// Log a meal and all its food items in one transaction, then run the
    /// streak check once for the whole batch.
    pub fn log_meal(&mut self, owner: &UserId, meal: NewMeal) -> StoreResult<MealWithEntries> {
        let meal_type = validate_meal_type(&meal.meal_type)?;
        if meal.items.is_empty() {
            return Err(StoreError::validation(
                "a meal needs at least one food item",
            ));
        }
        for item in &meal.items {
            validate_food_item(item)?;
        }

        let now = self.clock.now();
        let today = self.clock.today();
        let tx = begin(&mut self.conn)?;
        let logged = insert_meal_batch(&tx, owner, meal.date, &meal_type, meal.name, meal.items, now)?;
        streak::apply_check(&tx, owner, today, now)?;
        tx.commit()?;

        tracing::debug!(
            event = "meal_logged",
            user_id = %owner,
            meal_id = %logged.meal.id,
            entries = logged.entries.len()
        );
        Ok(logged)
    }

    pub fn get_meal(&self, owner: &UserId, id: &str) -> StoreResult<MealWithEntries> {
        check_owner(&self.conn, EntityKind::Meal, id, owner)?;
        let meal = select_record::<Meal>(&self.conn, id)?
            .ok_or_else(|| StoreError::not_found(EntityKind::Meal, id))?;
        let entries = select_records::<FoodEntry, _>(
            &self.conn,
            "WHERE meal_id = ?1 ORDER BY created_at, rowid",
            [id],
        )?;
        Ok(MealWithEntries { meal, entries })
    }

    pub fn meals_for_date(
        &self,
        owner: &UserId,
        date: NaiveDate,
    ) -> StoreResult<Vec<MealWithEntries>> {
        let meals = select_records::<Meal, _>(
            &self.conn,
            "WHERE user_id = ?1 AND date = ?2 ORDER BY created_at, rowid",
            params![owner, date],
        )?;
        meals
            .into_iter()
            .map(|meal| -> StoreResult<MealWithEntries> {
                let entries = select_records::<FoodEntry, _>(
                    &self.conn,
                    "WHERE meal_id = ?1 ORDER BY created_at, rowid",
                    [&meal.id],
                )?;
                Ok(MealWithEntries { meal, entries })
            })
            .collect()
    }

    /// Delete a meal and its entries together. Returns the ids of the food
    /// entries removed with it.
    pub fn delete_meal_by_owner(&mut self, owner: &UserId, id: &str) -> StoreResult<Vec<String>> {
        let now = self.clock.now();
        let tx = begin(&mut self.conn)?;
        check_owner(&tx, EntityKind::Meal, id, owner)?;

        let entry_ids: Vec<String> = {
            let mut stmt = tx.prepare("SELECT id FROM food_entries WHERE meal_id = ?1")?;
            stmt.query_map([id], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?
        };
        for entry_id in &entry_ids {
            delete_owned(&tx, EntityKind::FoodEntry, entry_id, owner, now)?;
        }
        delete_owned(&tx, EntityKind::Meal, id, owner, now)?;
        tx.commit()?;
        Ok(entry_ids)
    }

    // --- Food entries ---

    pub fn insert_food_entry(&mut self, owner: &UserId, new: NewFoodEntry) -> StoreResult<FoodEntry> {
        let meal_type = validate_meal_type(&new.meal_type)?;
        validate_food_item(&new.item)?;

        let now = self.clock.now();
        let today = self.clock.today();
        let entry = food_entry_from_item(owner, None, new.date, &meal_type, new.item, now);

        let tx = begin(&mut self.conn)?;
        insert_food_row(&tx, &entry)?;
        streak::apply_check(&tx, owner, today, now)?;
        tx.commit()?;
        Ok(entry)
    }

    pub fn get_food_entry(&self, owner: &UserId, id: &str) -> StoreResult<FoodEntry> {
        check_owner(&self.conn, EntityKind::FoodEntry, id, owner)?;
        select_record(&self.conn, id)?
            .ok_or_else(|| StoreError::not_found(EntityKind::FoodEntry, id))
    }

    pub fn food_entries_for_date(
        &self,
        owner: &UserId,
        date: NaiveDate,
    ) -> StoreResult<Vec<FoodEntry>> {
        select_records(
            &self.conn,
            "WHERE user_id = ?1 AND date = ?2 ORDER BY created_at, rowid",
            params![owner, date],
        )
    }

    /// Moving an entry to another date or meal type detaches it from its
    /// meal, which keeps the rest of the meal consistent.
    pub fn update_food_entry_by_owner(
        &mut self,
        owner: &UserId,
        id: &str,
        update: &UpdateFoodEntry,
    ) -> StoreResult<FoodEntry> {
        validate_food_update(update)?;
        let meal_type = update
            .meal_type
            .as_deref()
            .map(validate_meal_type)
            .transpose()?;
        let (set_notes, notes) = match &update.notes {
            Some(notes) => (true, notes.clone()),
            None => (false, None),
        };

        let now = self.clock.now();
        let tx = begin(&mut self.conn)?;
        check_owner(&tx, EntityKind::FoodEntry, id, owner)?;
        tx.execute(
            "UPDATE food_entries SET
                date = COALESCE(?1, date),
                meal_type = COALESCE(?2, meal_type),
                food_name = COALESCE(?3, food_name),
                calories = COALESCE(?4, calories),
                protein_g = COALESCE(?5, protein_g),
                carbs_g = COALESCE(?6, carbs_g),
                fat_g = COALESCE(?7, fat_g),
                serving_g = COALESCE(?8, serving_g),
                healthiness_rating = COALESCE(?9, healthiness_rating),
                notes = CASE WHEN ?10 THEN ?11 ELSE notes END,
                meal_id = CASE
                    WHEN (?1 IS NOT NULL AND ?1 <> date)
                      OR (?2 IS NOT NULL AND ?2 <> meal_type) THEN NULL
                    ELSE meal_id END,
                synced = 0,
                sync_action = 'update',
                last_modified = ?12
             WHERE id = ?13 AND user_id = ?14",
            params![
                update.date,
                meal_type,
                update.food_name.as_deref().map(str::trim),
                update.calories,
                update.protein_g,
                update.carbs_g,
                update.fat_g,
                update.serving_g,
                update.healthiness_rating,
                set_notes,
                notes,
                now,
                id,
                owner,
            ],
        )?;
        let entry = select_record::<FoodEntry>(&tx, id)?
            .ok_or_else(|| StoreError::not_found(EntityKind::FoodEntry, id))?;
        tx.commit()?;
        Ok(entry)
    }

    pub fn delete_food_entry_by_owner(&mut self, owner: &UserId, id: &str) -> StoreResult<()> {
        let now = self.clock.now();
        let tx = begin(&mut self.conn)?;
        delete_owned(&tx, EntityKind::FoodEntry, id, owner, now)?;
        tx.commit()?;
        Ok(())
    }

    // --- Exercises ---

    pub fn insert_exercise(&mut self, owner: &UserId, new: NewExercise) -> StoreResult<Exercise> {
        validate_exercise(&new)?;
        let now = self.clock.now();
        let today = self.clock.today();
        let exercise = Exercise {
            id: new_id(),
            user_id: owner.clone(),
            date: new.date,
            exercise_name: new.exercise_name.trim().to_string(),
            duration_minutes: new.duration_minutes,
            calories_burned: new.calories_burned,
            notes: new.notes,
            created_at: now,
            envelope: SyncEnvelope::created(now),
        };

        let tx = begin(&mut self.conn)?;
        tx.execute(
            "INSERT INTO exercises (id, user_id, date, exercise_name, duration_minutes,
                                    calories_burned, notes, created_at,
                                    synced, sync_action, last_modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                exercise.id,
                exercise.user_id,
                exercise.date,
                exercise.exercise_name,
                exercise.duration_minutes,
                exercise.calories_burned,
                exercise.notes,
                exercise.created_at,
                exercise.envelope.synced,
                action_str(&exercise.envelope),
                exercise.envelope.last_modified,
            ],
        )?;
        streak::apply_check(&tx, owner, today, now)?;
        tx.commit()?;
        Ok(exercise)
    }

    pub fn get_exercise(&self, owner: &UserId, id: &str) -> StoreResult<Exercise> {
        check_owner(&self.conn, EntityKind::Exercise, id, owner)?;
        select_record(&self.conn, id)?
            .ok_or_else(|| StoreError::not_found(EntityKind::Exercise, id))
    }

    pub fn exercises_for_date(
        &self,
        owner: &UserId,
        date: NaiveDate,
    ) -> StoreResult<Vec<Exercise>> {
        select_records(
            &self.conn,
            "WHERE user_id = ?1 AND date = ?2 ORDER BY created_at, rowid",
            params![owner, date],
        )
    }

    pub fn update_exercise_by_owner(
        &mut self,
        owner: &UserId,
        id: &str,
        update: &UpdateExercise,
    ) -> StoreResult<Exercise> {
        validate_exercise_update(update)?;
        let (set_notes, notes) = match &update.notes {
            Some(notes) => (true, notes.clone()),
            None => (false, None),
        };

        let now = self.clock.now();
        let tx = begin(&mut self.conn)?;
        check_owner(&tx, EntityKind::Exercise, id, owner)?;
        tx.execute(
            "UPDATE exercises SET
                date = COALESCE(?1, date),
                exercise_name = COALESCE(?2, exercise_name),
                duration_minutes = COALESCE(?3, duration_minutes),
                calories_burned = COALESCE(?4, calories_burned),
                notes = CASE WHEN ?5 THEN ?6 ELSE notes END,
                synced = 0,
                sync_action = 'update',
                last_modified = ?7
             WHERE id = ?8 AND user_id = ?9",
            params![
                update.date,
                update.exercise_name.as_deref().map(str::trim),
                update.duration_minutes,
                update.calories_burned,
                set_notes,
                notes,
                now,
                id,
                owner,
            ],
        )?;
        let exercise = select_record::<Exercise>(&tx, id)?
            .ok_or_else(|| StoreError::not_found(EntityKind::Exercise, id))?;
        tx.commit()?;
        Ok(exercise)
    }

    pub fn delete_exercise_by_owner(&mut self, owner: &UserId, id: &str) -> StoreResult<()> {
        let now = self.clock.now();
        let tx = begin(&mut self.conn)?;
        delete_owned(&tx, EntityKind::Exercise, id, owner, now)?;
        tx.commit()?;
        Ok(())
    }

    // --- Weight tracking ---

    pub fn insert_weight(&mut self, owner: &UserId, new: NewWeightEntry) -> StoreResult<WeightEntry> {
        validate_weight(new.weight_kg)?;
        let now = self.clock.now();
        let entry = WeightEntry {
            id: new_id(),
            user_id: owner.clone(),
            date: new.date,
            weight_kg: new.weight_kg,
            notes: new.notes,
            created_at: now,
            envelope: SyncEnvelope::created(now),
        };
        self.conn.execute(
            "INSERT INTO weights (id, user_id, date, weight_kg, notes, created_at,
                                  synced, sync_action, last_modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.id,
                entry.user_id,
                entry.date,
                entry.weight_kg,
                entry.notes,
                entry.created_at,
                entry.envelope.synced,
                action_str(&entry.envelope),
                entry.envelope.last_modified,
            ],
        )?;
        Ok(entry)
    }

    pub fn get_weight(&self, owner: &UserId, id: &str) -> StoreResult<WeightEntry> {
        check_owner(&self.conn, EntityKind::Weight, id, owner)?;
        select_record(&self.conn, id)?.ok_or_else(|| StoreError::not_found(EntityKind::Weight, id))
    }

    pub fn weights_for_date(
        &self,
        owner: &UserId,
        date: NaiveDate,
    ) -> StoreResult<Vec<WeightEntry>> {
        select_records(
            &self.conn,
            "WHERE user_id = ?1 AND date = ?2 ORDER BY created_at, rowid",
            params![owner, date],
        )
    }

    /// Most recent weigh-ins first.
    pub fn weight_history(&self, owner: &UserId, limit: usize) -> StoreResult<Vec<WeightEntry>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        select_records(
            &self.conn,
            "WHERE user_id = ?1 ORDER BY date DESC, rowid DESC LIMIT ?2",
            params![owner, limit],
        )
    }

    pub fn update_weight_by_owner(
        &mut self,
        owner: &UserId,
        id: &str,
        update: &UpdateWeightEntry,
    ) -> StoreResult<WeightEntry> {
        if update.date.is_none() && update.weight_kg.is_none() && update.notes.is_none() {
            return Err(StoreError::validation("At least one field must be provided"));
        }
        if let Some(kg) = update.weight_kg {
            validate_weight(kg)?;
        }
        let (set_notes, notes) = match &update.notes {
            Some(notes) => (true, notes.clone()),
            None => (false, None),
        };

        let now = self.clock.now();
        let tx = begin(&mut self.conn)?;
        check_owner(&tx, EntityKind::Weight, id, owner)?;
        tx.execute(
            "UPDATE weights SET
                date = COALESCE(?1, date),
                weight_kg = COALESCE(?2, weight_kg),
                notes = CASE WHEN ?3 THEN ?4 ELSE notes END,
                synced = 0,
                sync_action = 'update',
                last_modified = ?5
             WHERE id = ?6 AND user_id = ?7",
            params![update.date, update.weight_kg, set_notes, notes, now, id, owner],
        )?;
        let entry = select_record::<WeightEntry>(&tx, id)?
            .ok_or_else(|| StoreError::not_found(EntityKind::Weight, id))?;
        tx.commit()?;
        Ok(entry)
    }

    pub fn delete_weight_by_owner(&mut self, owner: &UserId, id: &str) -> StoreResult<()> {
        let now = self.clock.now();
        let tx = begin(&mut self.conn)?;
        delete_owned(&tx, EntityKind::Weight, id, owner, now)?;
        tx.commit()?;
        Ok(())
    }

    // --- Profile ---

    pub fn get_profile(&self, owner: &UserId) -> StoreResult<Option<Profile>> {
        select_record(&self.conn, owner.as_str())
    }

    /// Create the profile on first call; afterwards only the fields present
    /// in `update` change.
    pub fn upsert_profile(&mut self, owner: &UserId, mut update: ProfileUpdate) -> StoreResult<Profile> {
        validate_profile_update(&mut update)?;
        let now = self.clock.now();
        upsert_profile_row(&self.conn, owner, &update, false, now)
    }

    // --- Daily steps ---

    pub fn get_daily_steps(&self, owner: &UserId, date: NaiveDate) -> StoreResult<Option<DailySteps>> {
        load_daily_steps(&self.conn, owner, date)
    }

    pub fn daily_steps_between(
        &self,
        owner: &UserId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StoreResult<Vec<DailySteps>> {
        select_records(
            &self.conn,
            "WHERE user_id = ?1 AND date BETWEEN ?2 AND ?3 ORDER BY date",
            params![owner, from, to],
        )
    }

    /// Store `count` for the day unless a higher value is already there.
    pub fn record_daily_steps(
        &mut self,
        owner: &UserId,
        date: NaiveDate,
        count: i64,
    ) -> StoreResult<StepWrite> {
        validate_step_count(count)?;
        let now = self.clock.now();
        raise_daily_steps(&self.conn, owner, date, count, now)
    }

    /// Explicit user correction. Unlike [`Database::record_daily_steps`] this
    /// may lower the stored count.
    pub fn override_daily_steps(
        &mut self,
        owner: &UserId,
        date: NaiveDate,
        count: i64,
    ) -> StoreResult<DailySteps> {
        validate_step_count(count)?;
        let now = self.clock.now();
        self.conn.execute(
            "INSERT INTO daily_steps (id, user_id, date, count, synced, sync_action, last_modified)
             VALUES (?1, ?2, ?3, ?4, 0, 'create', ?5)
             ON CONFLICT(user_id, date) DO UPDATE SET
                count = excluded.count,
                synced = 0,
                sync_action = 'update',
                last_modified = excluded.last_modified",
            params![new_id(), owner, date, count, now],
        )?;
        tracing::info!(event = "steps_overridden", user_id = %owner, %date, count);
        load_daily_steps(&self.conn, owner, date)?
            .ok_or_else(|| StoreError::not_found(EntityKind::DailySteps, date.to_string()))
    }

    pub fn get_step_sync_state(&self, owner: &UserId) -> StoreResult<Option<StepSyncState>> {
        Ok(self
            .conn
            .query_row(
                "SELECT user_id, last_sync_date, last_heartbeat_at
                 FROM step_sync_state WHERE user_id = ?1",
                [owner],
                |row| {
                    Ok(StepSyncState {
                        user_id: row.get(0)?,
                        last_sync_date: row.get(1)?,
                        last_heartbeat_at: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    /// One step-service persistence cycle: the raise-only daily total and the
    /// heartbeat commit together.
    ///
    /// `last_written` is the count the service saw after its previous cycle
    /// for `date`. A stored count below it is a user override, which is kept
    /// instead of being raised back.
    pub fn persist_step_cycle(
        &mut self,
        owner: &UserId,
        date: NaiveDate,
        count: i64,
        last_written: Option<i64>,
    ) -> StoreResult<StepCycle> {
        validate_step_count(count)?;
        let now = self.clock.now();
        let tx = begin(&mut self.conn)?;
        let cycle = match (load_daily_steps(&tx, owner, date)?, last_written) {
            (Some(stored), Some(written)) if stored.count < written => {
                StepCycle::Overridden(stored)
            }
            _ => StepCycle::Written(raise_daily_steps(&tx, owner, date, count, now)?),
        };
        tx.execute(
            "INSERT INTO step_sync_state (user_id, last_sync_date, last_heartbeat_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                last_sync_date = excluded.last_sync_date,
                last_heartbeat_at = excluded.last_heartbeat_at",
            params![owner, date, now],
        )?;
        tx.commit()?;
        Ok(cycle)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::models::SyncAction;

    pub(crate) fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 15).unwrap()
    }

    pub(crate) fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    pub(crate) fn test_db() -> (Database, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(today()));
        let db = Database::open_in_memory()
            .unwrap()
            .with_clock(clock.clone());
        (db, clock)
    }

    pub(crate) fn item(name: &str, calories: f64) -> NewFoodItem {
        NewFoodItem {
            food_name: name.to_string(),
            calories,
            protein_g: Some(1.0),
            carbs_g: None,
            fat_g: None,
            serving_g: Some(100.0),
            healthiness_rating: None,
            notes: None,
        }
    }

    pub(crate) fn food(date: NaiveDate, name: &str) -> NewFoodEntry {
        NewFoodEntry {
            date,
            meal_type: "lunch".to_string(),
            item: item(name, 250.0),
        }
    }

    fn run(date: NaiveDate) -> NewExercise {
        NewExercise {
            date,
            exercise_name: "Running".to_string(),
            duration_minutes: 30,
            calories_burned: 300.0,
            notes: None,
        }
    }

    fn mark_uploaded(db: &Database, table: &str, id: &str) {
        db.conn
            .execute(
                &format!("UPDATE {table} SET synced = 1, sync_action = NULL WHERE id = ?1"),
                [id],
            )
            .unwrap();
    }

    #[test]
    fn test_insert_food_entry_sets_create_envelope() {
        let (mut db, clock) = test_db();
        let entry = db.insert_food_entry(&user("alice"), food(today(), "Apple")).unwrap();
        assert!(!entry.envelope.synced);
        assert_eq!(entry.envelope.sync_action, Some(SyncAction::Create));
        assert_eq!(entry.envelope.last_modified, clock.now());

        let loaded = db.get_food_entry(&user("alice"), &entry.id).unwrap();
        assert_eq!(loaded.food_name, "Apple");
        assert_eq!(loaded.envelope, entry.envelope);
    }

    #[test]
    fn test_update_rewrites_envelope() {
        let (mut db, clock) = test_db();
        let entry = db.insert_food_entry(&user("alice"), food(today(), "Apple")).unwrap();
        mark_uploaded(&db, "food_entries", &entry.id);

        clock.set_now(clock.now() + chrono::Duration::minutes(5));
        let updated = db
            .update_food_entry_by_owner(
                &user("alice"),
                &entry.id,
                &UpdateFoodEntry {
                    calories: Some(90.0),
                    notes: Some(Some("green".to_string())),
                    ..UpdateFoodEntry::default()
                },
            )
            .unwrap();
        assert!((updated.calories - 90.0).abs() < f64::EPSILON);
        assert_eq!(updated.notes.as_deref(), Some("green"));
        assert_eq!(updated.food_name, "Apple");
        assert!(!updated.envelope.synced);
        assert_eq!(updated.envelope.sync_action, Some(SyncAction::Update));
        assert_eq!(updated.envelope.last_modified, clock.now());
    }

    #[test]
    fn test_update_can_clear_notes() {
        let (mut db, _) = test_db();
        let mut new = food(today(), "Apple");
        new.item.notes = Some("snack".to_string());
        let entry = db.insert_food_entry(&user("alice"), new).unwrap();
        let updated = db
            .update_food_entry_by_owner(
                &user("alice"),
                &entry.id,
                &UpdateFoodEntry {
                    notes: Some(None),
                    ..UpdateFoodEntry::default()
                },
            )
            .unwrap();
        assert!(updated.notes.is_none());
    }

    #[test]
    fn test_wrong_owner_is_unauthorized_and_row_untouched() {
        let (mut db, _) = test_db();
        let entry = db.insert_food_entry(&user("alice"), food(today(), "Apple")).unwrap();

        let err = db
            .update_food_entry_by_owner(
                &user("mallory"),
                &entry.id,
                &UpdateFoodEntry {
                    calories: Some(1.0),
                    ..UpdateFoodEntry::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Unauthorized { .. }), "{err:?}");

        let err = db
            .delete_food_entry_by_owner(&user("mallory"), &entry.id)
            .unwrap_err();
        assert!(matches!(err, StoreError::Unauthorized { .. }));

        let err = db.get_food_entry(&user("mallory"), &entry.id).unwrap_err();
        assert!(matches!(err, StoreError::Unauthorized { .. }));

        let still = db.get_food_entry(&user("alice"), &entry.id).unwrap();
        assert!((still.calories - 250.0).abs() < f64::EPSILON);
        assert_eq!(still.envelope, entry.envelope);
    }

    #[test]
    fn test_missing_row_is_not_found() {
        let (mut db, _) = test_db();
        let err = db
            .delete_exercise_by_owner(&user("alice"), "nope")
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn test_query_by_date_is_scoped_to_owner() {
        let (mut db, _) = test_db();
        db.insert_food_entry(&user("alice"), food(today(), "Apple")).unwrap();
        db.insert_food_entry(&user("alice"), food(today(), "Pear")).unwrap();
        db.insert_food_entry(&user("bob"), food(today(), "Cake")).unwrap();
        let yesterday = today().pred_opt().unwrap();
        db.insert_food_entry(&user("alice"), food(yesterday, "Soup")).unwrap();

        let names: Vec<String> = db
            .food_entries_for_date(&user("alice"), today())
            .unwrap()
            .into_iter()
            .map(|e| e.food_name)
            .collect();
        assert_eq!(names, vec!["Apple", "Pear"]);
    }

    #[test]
    fn test_log_meal_inserts_batch() {
        let (mut db, _) = test_db();
        let logged = db
            .log_meal(
                &user("alice"),
                NewMeal {
                    date: today(),
                    meal_type: "Dinner".to_string(),
                    name: Some("Pasta night".to_string()),
                    items: vec![item("Pasta", 400.0), item("Salad", 80.0)],
                },
            )
            .unwrap();
        assert_eq!(logged.meal.meal_type, "dinner");
        assert_eq!(logged.entries.len(), 2);
        assert!(
            logged
                .entries
                .iter()
                .all(|e| e.meal_id.as_deref() == Some(logged.meal.id.as_str()))
        );

        let meals = db.meals_for_date(&user("alice"), today()).unwrap();
        assert_eq!(meals.len(), 1);
        assert!((meals[0].total_calories() - 480.0).abs() < f64::EPSILON);

        let streak = db.get_streak(&user("alice")).unwrap().unwrap();
        assert_eq!(streak.current_streak, 1);
    }

    #[test]
    fn test_moving_entry_detaches_it_from_meal() {
        let (mut db, _) = test_db();
        let alice = user("alice");
        let logged = db
            .log_meal(
                &alice,
                NewMeal {
                    date: today(),
                    meal_type: "dinner".to_string(),
                    name: None,
                    items: vec![item("Pasta", 400.0), item("Salad", 80.0), item("Bread", 120.0)],
                },
            )
            .unwrap();
        let meal_id = logged.meal.id.clone();
        let [pasta, salad, bread] = [0, 1, 2].map(|i| logged.entries[i].id.clone());

        let notes = UpdateFoodEntry {
            notes: Some(Some("extra cheese".to_string())),
            meal_type: Some("Dinner".to_string()),
            ..Default::default()
        };
        let kept = db.update_food_entry_by_owner(&alice, &pasta, &notes).unwrap();
        assert_eq!(kept.meal_id.as_deref(), Some(meal_id.as_str()));

        let yesterday = today().pred_opt().unwrap();
        let moved_date = UpdateFoodEntry {
            date: Some(yesterday),
            ..Default::default()
        };
        let moved = db.update_food_entry_by_owner(&alice, &salad, &moved_date).unwrap();
        assert_eq!(moved.date, yesterday);
        assert!(moved.meal_id.is_none());

        let moved_type = UpdateFoodEntry {
            meal_type: Some("lunch".to_string()),
            ..Default::default()
        };
        let moved = db.update_food_entry_by_owner(&alice, &bread, &moved_type).unwrap();
        assert_eq!(moved.meal_type, "lunch");
        assert!(moved.meal_id.is_none());

        let meal = db.get_meal(&alice, &meal_id).unwrap();
        assert_eq!(meal.entries.len(), 1);
        assert!(meal.entries.iter().all(|e| e.date == meal.meal.date));
    }

    #[test]
    fn test_log_meal_rolls_back_on_failure() {
        let (mut db, _) = test_db();
        db.conn
            .execute_batch(
                "CREATE TRIGGER poison BEFORE INSERT ON food_entries
                 WHEN NEW.food_name = 'Poison'
                 BEGIN SELECT RAISE(ABORT, 'poisoned'); END;",
            )
            .unwrap();

        let result = db.log_meal(
            &user("alice"),
            NewMeal {
                date: today(),
                meal_type: "lunch".to_string(),
                name: None,
                items: vec![item("Bread", 200.0), item("Poison", 1.0)],
            },
        );
        assert!(result.is_err());

        let meals: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM meals", [], |r| r.get(0))
            .unwrap();
        let entries: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM food_entries", [], |r| r.get(0))
            .unwrap();
        assert_eq!((meals, entries), (0, 0));
        assert!(db.get_streak(&user("alice")).unwrap().is_none());
    }

    #[test]
    fn test_log_meal_rejects_empty_and_invalid() {
        let (mut db, _) = test_db();
        let empty = NewMeal {
            date: today(),
            meal_type: "lunch".to_string(),
            name: None,
            items: vec![],
        };
        assert!(matches!(
            db.log_meal(&user("alice"), empty),
            Err(StoreError::Validation(_))
        ));
        let brunch = NewMeal {
            date: today(),
            meal_type: "brunch".to_string(),
            name: None,
            items: vec![item("Eggs", 150.0)],
        };
        assert!(db.log_meal(&user("alice"), brunch).is_err());
    }

    #[test]
    fn test_delete_meal_cascades_entries() {
        let (mut db, _) = test_db();
        let logged = db
            .log_meal(
                &user("alice"),
                NewMeal {
                    date: today(),
                    meal_type: "lunch".to_string(),
                    name: None,
                    items: vec![item("Bread", 200.0), item("Cheese", 110.0)],
                },
            )
            .unwrap();

        let err = db
            .delete_meal_by_owner(&user("bob"), &logged.meal.id)
            .unwrap_err();
        assert!(matches!(err, StoreError::Unauthorized { .. }));

        let removed = db
            .delete_meal_by_owner(&user("alice"), &logged.meal.id)
            .unwrap();
        assert_eq!(removed.len(), 2);
        assert!(db.food_entries_for_date(&user("alice"), today()).unwrap().is_empty());
        assert!(db.meals_for_date(&user("alice"), today()).unwrap().is_empty());
    }

    #[test]
    fn test_delete_uploaded_row_leaves_tombstone() {
        let (mut db, _) = test_db();
        let uploaded = db.insert_exercise(&user("alice"), run(today())).unwrap();
        let local_only = db.insert_exercise(&user("alice"), run(today())).unwrap();
        mark_uploaded(&db, "exercises", &uploaded.id);

        db.delete_exercise_by_owner(&user("alice"), &uploaded.id).unwrap();
        db.delete_exercise_by_owner(&user("alice"), &local_only.id).unwrap();

        let tombstones = db.list_tombstones(&user("alice")).unwrap();
        assert_eq!(tombstones.len(), 1);
        assert_eq!(tombstones[0].id, uploaded.id);
        assert_eq!(tombstones[0].kind, EntityKind::Exercise);
    }

    #[test]
    fn test_exercise_update_and_streak() {
        let (mut db, _) = test_db();
        let ex = db.insert_exercise(&user("alice"), run(today())).unwrap();
        let updated = db
            .update_exercise_by_owner(
                &user("alice"),
                &ex.id,
                &UpdateExercise {
                    duration_minutes: Some(45),
                    ..UpdateExercise::default()
                },
            )
            .unwrap();
        assert_eq!(updated.duration_minutes, 45);
        assert_eq!(updated.envelope.sync_action, Some(SyncAction::Update));
        assert_eq!(db.exercises_for_date(&user("alice"), today()).unwrap().len(), 1);
        assert_eq!(
            db.get_streak(&user("alice")).unwrap().unwrap().current_streak,
            1
        );
    }

    #[test]
    fn test_weight_history_most_recent_first() {
        let (mut db, _) = test_db();
        for (offset, kg) in [(2, 81.0), (1, 80.5), (0, 80.0)] {
            db.insert_weight(
                &user("alice"),
                NewWeightEntry {
                    date: today() - chrono::Duration::days(offset),
                    weight_kg: kg,
                    notes: None,
                },
            )
            .unwrap();
        }
        let history = db.weight_history(&user("alice"), 2).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].date, today());
        assert!(
            db.insert_weight(
                &user("alice"),
                NewWeightEntry {
                    date: today(),
                    weight_kg: 0.0,
                    notes: None
                }
            )
            .is_err()
        );
    }

    #[test]
    fn test_weight_update_by_owner() {
        let (mut db, _) = test_db();
        let w = db
            .insert_weight(
                &user("alice"),
                NewWeightEntry {
                    date: today(),
                    weight_kg: 80.0,
                    notes: None,
                },
            )
            .unwrap();
        let updated = db
            .update_weight_by_owner(
                &user("alice"),
                &w.id,
                &UpdateWeightEntry {
                    weight_kg: Some(79.5),
                    ..UpdateWeightEntry::default()
                },
            )
            .unwrap();
        assert!((updated.weight_kg - 79.5).abs() < f64::EPSILON);
        assert_eq!(db.weights_for_date(&user("alice"), today()).unwrap().len(), 1);
        assert!(matches!(
            db.update_weight_by_owner(&user("bob"), &w.id, &UpdateWeightEntry {
                weight_kg: Some(1.0),
                ..UpdateWeightEntry::default()
            }),
            Err(StoreError::Unauthorized { .. })
        ));
    }

    #[test]
    fn test_profile_upsert_merges_fields() {
        let (mut db, _) = test_db();
        let created = db
            .upsert_profile(
                &user("alice"),
                ProfileUpdate {
                    first_name: Some("Alice".to_string()),
                    height_cm: Some(170.0),
                    ..ProfileUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(created.envelope.sync_action, Some(SyncAction::Create));
        assert!(!created.is_imperial_units);

        let updated = db
            .upsert_profile(
                &user("alice"),
                ProfileUpdate {
                    weight_goal: Some("Lose".to_string()),
                    is_imperial_units: Some(true),
                    ..ProfileUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(updated.first_name.as_deref(), Some("Alice"));
        assert_eq!(updated.weight_goal.as_deref(), Some("lose"));
        assert!(updated.is_imperial_units);
        assert_eq!(updated.envelope.sync_action, Some(SyncAction::Update));
        assert!(db.get_profile(&user("bob")).unwrap().is_none());
    }

    #[test]
    fn test_record_daily_steps_never_lowers() {
        let (mut db, clock) = test_db();
        let first = db.record_daily_steps(&user("alice"), today(), 1200).unwrap();
        assert!(first.raised);
        let first = first.steps;
        assert_eq!(first.envelope.sync_action, Some(SyncAction::Create));

        clock.set_now(clock.now() + chrono::Duration::minutes(1));
        let lower = db.record_daily_steps(&user("alice"), today(), 800).unwrap();
        assert!(!lower.raised);
        assert_eq!(lower.steps.count, 1200);
        assert_eq!(lower.steps.envelope, first.envelope);

        let equal = db.record_daily_steps(&user("alice"), today(), 1200).unwrap();
        assert!(!equal.raised);
        assert_eq!(equal.steps.envelope.last_modified, first.envelope.last_modified);

        let higher = db.record_daily_steps(&user("alice"), today(), 1500).unwrap();
        assert!(higher.raised);
        let higher = higher.steps;
        assert_eq!(higher.count, 1500);
        assert_eq!(higher.id, first.id);
        assert_eq!(higher.envelope.sync_action, Some(SyncAction::Update));
        assert_eq!(higher.envelope.last_modified, clock.now());
    }

    #[test]
    fn test_override_daily_steps_can_lower() {
        let (mut db, _) = test_db();
        db.record_daily_steps(&user("alice"), today(), 5000).unwrap();
        let corrected = db.override_daily_steps(&user("alice"), today(), 3000).unwrap();
        assert_eq!(corrected.count, 3000);
        assert!(db.override_daily_steps(&user("alice"), today(), -1).is_err());
    }

    #[test]
    fn test_persist_step_cycle_writes_heartbeat() {
        let (mut db, clock) = test_db();
        assert!(db.get_step_sync_state(&user("alice")).unwrap().is_none());
        db.persist_step_cycle(&user("alice"), today(), 42, None).unwrap();
        let state = db.get_step_sync_state(&user("alice")).unwrap().unwrap();
        assert_eq!(state.last_sync_date, Some(today()));
        assert_eq!(state.last_heartbeat_at, Some(clock.now()));
        assert_eq!(
            db.get_daily_steps(&user("alice"), today()).unwrap().unwrap().count,
            42
        );
    }

    #[test]
    fn test_persist_step_cycle_keeps_lowered_count() {
        let (mut db, clock) = test_db();
        let alice = user("alice");
        let first = db.persist_step_cycle(&alice, today(), 900, None).unwrap();
        assert!(matches!(first, StepCycle::Written(ref w) if w.raised && w.steps.count == 900));

        db.override_daily_steps(&alice, today(), 250).unwrap();
        let later = clock.now() + chrono::Duration::minutes(5);
        clock.set_now(later);

        match db.persist_step_cycle(&alice, today(), 900, Some(900)).unwrap() {
            StepCycle::Overridden(steps) => assert_eq!(steps.count, 250),
            StepCycle::Written(write) => panic!("override was raised over: {write:?}"),
        }
        assert_eq!(db.get_daily_steps(&alice, today()).unwrap().unwrap().count, 250);
        let state = db.get_step_sync_state(&alice).unwrap().unwrap();
        assert_eq!(state.last_heartbeat_at, Some(later));

        // Without a previous write the service raises as usual.
        let raised = db.persist_step_cycle(&alice, today(), 900, None).unwrap();
        assert!(matches!(raised, StepCycle::Written(ref w) if w.steps.count == 900));
    }

    #[test]
    fn test_file_database_reopens_with_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kcal.db");
        let id = {
            let mut db = Database::open(&path).unwrap();
            db.insert_exercise(&user("alice"), run(today())).unwrap().id
        };
        let db = Database::open(&path).unwrap();
        assert_eq!(db.get_exercise(&user("alice"), &id).unwrap().duration_minutes, 30);
    }
}
