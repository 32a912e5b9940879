use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Identity of the signed-in user every record operation acts for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Result<Self, StoreError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(StoreError::validation("user id must not be empty"));
        }
        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl rusqlite::types::ToSql for UserId {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        self.0.to_sql()
    }
}

impl rusqlite::types::FromSql for UserId {
    fn column_result(value: rusqlite::types::ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
        String::column_result(value).map(Self)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// --- Sync envelope ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Create,
    Update,
}

impl SyncAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
        }
    }

    pub(crate) fn from_column(value: Option<&str>) -> Option<Self> {
        match value {
            Some("create") => Some(Self::Create),
            Some("update") => Some(Self::Update),
            _ => None,
        }
    }
}

/// `{synced, sync_action, last_modified}` carried by every syncable row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEnvelope {
    pub synced: bool,
    pub sync_action: Option<SyncAction>,
    pub last_modified: DateTime<Utc>,
}

impl SyncEnvelope {
    #[must_use]
    pub fn created(now: DateTime<Utc>) -> Self {
        Self {
            synced: false,
            sync_action: Some(SyncAction::Create),
            last_modified: now,
        }
    }

    /// Reads the envelope from the three columns starting at `idx`.
    pub(crate) fn from_row(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Self> {
        let action: Option<String> = row.get(idx + 1)?;
        Ok(Self {
            synced: row.get(idx)?,
            sync_action: SyncAction::from_column(action.as_deref()),
            last_modified: row.get(idx + 2)?,
        })
    }
}

// --- Entity kinds ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Meal,
    FoodEntry,
    Exercise,
    Weight,
    Profile,
    DailySteps,
    Streak,
    CheatDay,
}

impl EntityKind {
    pub const ALL: [EntityKind; 8] = [
        Self::Meal,
        Self::FoodEntry,
        Self::Exercise,
        Self::Weight,
        Self::Profile,
        Self::DailySteps,
        Self::Streak,
        Self::CheatDay,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Meal => "meal",
            Self::FoodEntry => "food_entry",
            Self::Exercise => "exercise",
            Self::Weight => "weight",
            Self::Profile => "profile",
            Self::DailySteps => "daily_steps",
            Self::Streak => "streak",
            Self::CheatDay => "cheat_day",
        }
    }

    #[must_use]
    pub fn table(self) -> &'static str {
        match self {
            Self::Meal => "meals",
            Self::FoodEntry => "food_entries",
            Self::Exercise => "exercises",
            Self::Weight => "weights",
            Self::Profile => "profiles",
            Self::DailySteps => "daily_steps",
            Self::Streak => "streaks",
            Self::CheatDay => "cheat_day_settings",
        }
    }

    /// Primary key column. One-row-per-user tables are keyed by the owner.
    #[must_use]
    pub fn id_column(self) -> &'static str {
        if self.keyed_by_user() { "user_id" } else { "id" }
    }

    #[must_use]
    pub fn keyed_by_user(self) -> bool {
        matches!(self, Self::Profile | Self::Streak | Self::CheatDay)
    }

    /// Dated activity tables the retention purge is allowed to clear.
    #[must_use]
    pub fn is_dated(self) -> bool {
        matches!(
            self,
            Self::Meal | Self::FoodEntry | Self::Exercise | Self::Weight | Self::DailySteps
        )
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl rusqlite::types::FromSql for EntityKind {
    fn column_result(value: rusqlite::types::ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
        let text = value.as_str()?;
        text.parse()
            .map_err(|e: StoreError| rusqlite::types::FromSqlError::Other(e.to_string().into()))
    }
}

impl FromStr for EntityKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == lower || k.table() == lower)
            .ok_or_else(|| {
                StoreError::validation(format!(
                    "Unknown record kind '{s}'. Must be one of: {}",
                    Self::ALL.map(EntityKind::as_str).join(", ")
                ))
            })
    }
}

// --- Meals and food entries ---

#[derive(Debug, Clone, Serialize)]
pub struct Meal {
    pub id: String,
    pub user_id: UserId,
    pub date: NaiveDate,
    pub meal_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub envelope: SyncEnvelope,
}

#[derive(Debug, Clone, Serialize)]
pub struct MealWithEntries {
    #[serde(flatten)]
    pub meal: Meal,
    pub entries: Vec<FoodEntry>,
}

impl MealWithEntries {
    #[must_use]
    pub fn total_calories(&self) -> f64 {
        self.entries.iter().map(|e| e.calories).sum()
    }
}

#[derive(Debug, Clone)]
pub struct NewMeal {
    pub date: NaiveDate,
    pub meal_type: String,
    pub name: Option<String>,
    pub items: Vec<NewFoodItem>,
}

/// One food inside a meal being logged as a batch.
#[derive(Debug, Clone, Deserialize)]
pub struct NewFoodItem {
    pub food_name: String,
    pub calories: f64,
    #[serde(default)]
    pub protein_g: Option<f64>,
    #[serde(default)]
    pub carbs_g: Option<f64>,
    #[serde(default)]
    pub fat_g: Option<f64>,
    #[serde(default)]
    pub serving_g: Option<f64>,
    #[serde(default)]
    pub healthiness_rating: Option<i64>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FoodEntry {
    pub id: String,
    pub user_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meal_id: Option<String>,
    pub date: NaiveDate,
    pub meal_type: String,
    pub food_name: String,
    pub calories: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protein_g: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub carbs_g: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fat_g: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serving_g: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub healthiness_rating: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub envelope: SyncEnvelope,
}

#[derive(Debug, Clone)]
pub struct NewFoodEntry {
    pub date: NaiveDate,
    pub meal_type: String,
    pub item: NewFoodItem,
}

#[derive(Debug, Clone, Default)]
#[allow(clippy::option_option)]
pub struct UpdateFoodEntry {
    pub date: Option<NaiveDate>,
    pub meal_type: Option<String>,
    pub food_name: Option<String>,
    pub calories: Option<f64>,
    pub protein_g: Option<f64>,
    pub carbs_g: Option<f64>,
    pub fat_g: Option<f64>,
    pub serving_g: Option<f64>,
    pub healthiness_rating: Option<i64>,
    pub notes: Option<Option<String>>,
}

impl UpdateFoodEntry {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.date.is_none()
            && self.meal_type.is_none()
            && self.food_name.is_none()
            && self.calories.is_none()
            && self.protein_g.is_none()
            && self.carbs_g.is_none()
            && self.fat_g.is_none()
            && self.serving_g.is_none()
            && self.healthiness_rating.is_none()
            && self.notes.is_none()
    }
}

// --- Exercises ---

#[derive(Debug, Clone, Serialize)]
pub struct Exercise {
    pub id: String,
    pub user_id: UserId,
    pub date: NaiveDate,
    pub exercise_name: String,
    pub duration_minutes: i64,
    pub calories_burned: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub envelope: SyncEnvelope,
}

#[derive(Debug, Clone)]
pub struct NewExercise {
    pub date: NaiveDate,
    pub exercise_name: String,
    pub duration_minutes: i64,
    pub calories_burned: f64,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default)]
#[allow(clippy::option_option)]
pub struct UpdateExercise {
    pub date: Option<NaiveDate>,
    pub exercise_name: Option<String>,
    pub duration_minutes: Option<i64>,
    pub calories_burned: Option<f64>,
    pub notes: Option<Option<String>>,
}

impl UpdateExercise {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.date.is_none()
            && self.exercise_name.is_none()
            && self.duration_minutes.is_none()
            && self.calories_burned.is_none()
            && self.notes.is_none()
    }
}

// --- Weight tracking ---

#[derive(Debug, Clone, Serialize)]
pub struct WeightEntry {
    pub id: String,
    pub user_id: UserId,
    pub date: NaiveDate,
    pub weight_kg: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub envelope: SyncEnvelope,
}

#[derive(Debug, Clone)]
pub struct NewWeightEntry {
    pub date: NaiveDate,
    pub weight_kg: f64,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default)]
#[allow(clippy::option_option)]
pub struct UpdateWeightEntry {
    pub date: Option<NaiveDate>,
    pub weight_kg: Option<f64>,
    pub notes: Option<Option<String>>,
}

// --- Profile ---

#[derive(Debug, Clone, Serialize)]
pub struct Profile {
    pub user_id: UserId,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub height_cm: Option<f64>,
    pub weight_kg: Option<f64>,
    pub age: Option<i64>,
    pub gender: Option<String>,
    pub activity_level: Option<String>,
    pub weight_goal: Option<String>,
    pub target_weight_kg: Option<f64>,
    pub starting_weight_kg: Option<f64>,
    pub is_imperial_units: bool,
    pub onboarding_complete: bool,
    #[serde(flatten)]
    pub envelope: SyncEnvelope,
}

/// Partial profile. Also the payload of a temporary onboarding session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height_cm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight_kg: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight_goal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_weight_kg: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub starting_weight_kg: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_imperial_units: Option<bool>,
}

// --- Steps ---

#[derive(Debug, Clone, Serialize)]
pub struct DailySteps {
    pub id: String,
    pub user_id: UserId,
    pub date: NaiveDate,
    pub count: i64,
    #[serde(flatten)]
    pub envelope: SyncEnvelope,
}

/// Outcome of a raise-only step write. `raised` is false when the stored
/// count was already at least as high and nothing changed.
#[derive(Debug, Clone, Serialize)]
pub struct StepWrite {
    #[serde(flatten)]
    pub steps: DailySteps,
    pub raised: bool,
}

/// Outcome of one step-service persistence cycle.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepCycle {
    Written(StepWrite),
    /// The stored count was below the service's last write, so the user
    /// lowered it. The row was left as is; only the heartbeat moved.
    Overridden(DailySteps),
}

/// Local bookkeeping of the background step service. Not synced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepSyncState {
    pub user_id: UserId,
    pub last_sync_date: Option<NaiveDate>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

// --- Derived state ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreakState {
    pub user_id: UserId,
    pub current_streak: i64,
    pub longest_streak: i64,
    pub last_activity_date: Option<NaiveDate>,
    #[serde(flatten)]
    pub envelope: SyncEnvelope,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheatDaySettings {
    pub user_id: UserId,
    pub frequency_days: i64,
    pub preferred_day_of_week: Option<u32>,
    pub last_cheat_day: Option<NaiveDate>,
    pub next_cheat_day: Option<NaiveDate>,
    pub enabled: bool,
    #[serde(flatten)]
    pub envelope: SyncEnvelope,
}

/// What the UI shows about the cheat-day schedule. Derived, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheatDayStatus {
    pub enabled: bool,
    pub frequency_days: i64,
    pub preferred_day_of_week: Option<u32>,
    pub last_cheat_day: Option<NaiveDate>,
    pub next_cheat_day: NaiveDate,
    pub days_until_next: i64,
    pub days_completed: i64,
    pub is_cheat_day_today: bool,
    /// This read moved the schedule forward.
    pub auto_advanced: bool,
}

// --- Onboarding ---

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OnboardingSession {
    pub session_id: String,
    pub profile: ProfileUpdate,
    pub step_index: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// --- Sync queue ---

/// A pending row as the external uploader sees it.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRecord {
    pub kind: EntityKind,
    pub id: String,
    pub owner: UserId,
    pub envelope: SyncEnvelope,
    pub payload: serde_json::Value,
}

/// Uploader acknowledgement for one row, optionally carrying the id the
/// server assigned on first upload.
///
/// When `last_modified` is set, the row is only marked synced if it still
/// has that timestamp; a row edited after it was listed stays pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncAck {
    pub local_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
}

impl SyncAck {
    #[must_use]
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            server_id: None,
            last_modified: None,
        }
    }

    #[must_use]
    pub fn remapped(local_id: impl Into<String>, server_id: impl Into<String>) -> Self {
        Self {
            server_id: Some(server_id.into()),
            ..Self::new(local_id)
        }
    }

    #[must_use]
    pub fn seen_at(mut self, last_modified: DateTime<Utc>) -> Self {
        self.last_modified = Some(last_modified);
        self
    }
}

/// Unsynced rows of one kind, for badges and the uploader's overview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingCount {
    pub kind: EntityKind,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncTombstone {
    pub seq: i64,
    pub kind: EntityKind,
    pub id: String,
    pub user_id: UserId,
    pub deleted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub rows_parsed: usize,
    pub meals_created: usize,
    pub entries_logged: usize,
    pub dates_spanned: usize,
    pub dry_run: bool,
    /// Ids of the meals written. Empty on a dry run.
    pub meal_ids: Vec<String>,
}

// --- Validation ---

pub const MEAL_TYPES: &[&str] = &["breakfast", "lunch", "dinner", "snack"];
pub const GENDERS: &[&str] = &["male", "female", "other"];
pub const ACTIVITY_LEVELS: &[&str] = &["sedentary", "light", "moderate", "active", "very_active"];
pub const WEIGHT_GOALS: &[&str] = &["lose", "maintain", "gain"];

fn validate_choice(field: &str, value: &str, allowed: &[&str]) -> Result<String, StoreError> {
    let lower = value.trim().to_lowercase();
    if allowed.contains(&lower.as_str()) {
        Ok(lower)
    } else {
        Err(StoreError::validation(format!(
            "Invalid {field} '{value}'. Must be one of: {}",
            allowed.join(", ")
        )))
    }
}

pub fn validate_meal_type(meal: &str) -> Result<String, StoreError> {
    validate_choice("meal type", meal, MEAL_TYPES)
}

fn non_negative(field: &str, value: Option<f64>) -> Result<(), StoreError> {
    match value {
        Some(v) if !v.is_finite() || v < 0.0 => Err(StoreError::validation(format!(
            "{field} must be a non-negative number"
        ))),
        _ => Ok(()),
    }
}

fn positive(field: &str, value: Option<f64>) -> Result<(), StoreError> {
    match value {
        Some(v) if !v.is_finite() || v <= 0.0 => Err(StoreError::validation(format!(
            "{field} must be greater than 0"
        ))),
        _ => Ok(()),
    }
}

fn non_blank(field: &str, value: &str) -> Result<(), StoreError> {
    if value.trim().is_empty() {
        return Err(StoreError::validation(format!("{field} must not be empty")));
    }
    Ok(())
}

fn validate_rating(rating: Option<i64>) -> Result<(), StoreError> {
    if rating.is_some_and(|r| !(1..=10).contains(&r)) {
        return Err(StoreError::validation(
            "healthiness_rating must be between 1 and 10",
        ));
    }
    Ok(())
}

/// Validate a food item: non-empty name, non-negative nutrition, positive serving.
pub fn validate_food_item(item: &NewFoodItem) -> Result<(), StoreError> {
    non_blank("food_name", &item.food_name)?;
    non_negative("calories", Some(item.calories))?;
    non_negative("protein_g", item.protein_g)?;
    non_negative("carbs_g", item.carbs_g)?;
    non_negative("fat_g", item.fat_g)?;
    positive("serving_g", item.serving_g)?;
    validate_rating(item.healthiness_rating)
}

pub fn validate_food_update(update: &UpdateFoodEntry) -> Result<(), StoreError> {
    if update.is_empty() {
        return Err(StoreError::validation("At least one field must be provided"));
    }
    if let Some(name) = &update.food_name {
        non_blank("food_name", name)?;
    }
    if let Some(meal) = &update.meal_type {
        validate_meal_type(meal)?;
    }
    non_negative("calories", update.calories)?;
    non_negative("protein_g", update.protein_g)?;
    non_negative("carbs_g", update.carbs_g)?;
    non_negative("fat_g", update.fat_g)?;
    positive("serving_g", update.serving_g)?;
    validate_rating(update.healthiness_rating)
}

pub fn validate_exercise(exercise: &NewExercise) -> Result<(), StoreError> {
    non_blank("exercise_name", &exercise.exercise_name)?;
    if exercise.duration_minutes < 0 {
        return Err(StoreError::validation("duration_minutes must not be negative"));
    }
    non_negative("calories_burned", Some(exercise.calories_burned))
}

pub fn validate_exercise_update(update: &UpdateExercise) -> Result<(), StoreError> {
    if update.is_empty() {
        return Err(StoreError::validation("At least one field must be provided"));
    }
    if let Some(name) = &update.exercise_name {
        non_blank("exercise_name", name)?;
    }
    if update.duration_minutes.is_some_and(|d| d < 0) {
        return Err(StoreError::validation("duration_minutes must not be negative"));
    }
    non_negative("calories_burned", update.calories_burned)
}

pub fn validate_weight(weight_kg: f64) -> Result<(), StoreError> {
    positive("weight_kg", Some(weight_kg))
}

/// Normalizes enum-like profile fields in place and checks numeric ranges.
pub fn validate_profile_update(update: &mut ProfileUpdate) -> Result<(), StoreError> {
    if let Some(g) = update.gender.as_deref() {
        update.gender = Some(validate_choice("gender", g, GENDERS)?);
    }
    if let Some(a) = update.activity_level.as_deref() {
        update.activity_level = Some(validate_choice("activity_level", a, ACTIVITY_LEVELS)?);
    }
    if let Some(w) = update.weight_goal.as_deref() {
        update.weight_goal = Some(validate_choice("weight_goal", w, WEIGHT_GOALS)?);
    }
    positive("height_cm", update.height_cm)?;
    positive("weight_kg", update.weight_kg)?;
    positive("target_weight_kg", update.target_weight_kg)?;
    positive("starting_weight_kg", update.starting_weight_kg)?;
    if update.age.is_some_and(|a| !(1..=150).contains(&a)) {
        return Err(StoreError::validation("age must be between 1 and 150"));
    }
    Ok(())
}

pub fn validate_step_count(count: i64) -> Result<(), StoreError> {
    if count < 0 {
        return Err(StoreError::validation("step count must not be negative"));
    }
    Ok(())
}
