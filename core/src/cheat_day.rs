//! Recurring cheat-day schedule.
//!
//! `last_cheat_day` is the source of truth; `next_cheat_day` is a cached
//! value that can always be rebuilt with [`next_cheat_day`]. There is no
//! midnight job, so the schedule advances lazily whenever the status is read
//! on or after the scheduled day.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use rusqlite::{Connection, params};

use crate::db::{Database, Record, begin, select_record};
use crate::error::{StoreError, StoreResult};
use crate::models::{CheatDaySettings, CheatDayStatus, EntityKind, SyncEnvelope, UserId};

pub const DEFAULT_FREQUENCY_DAYS: i64 = 7;

/// First day at least `frequency_days` after `anchor`; with a preferred
/// weekday (0 = Sunday .. 6 = Saturday), the first such weekday on or after
/// that point. Never closer than `frequency_days`, even when the preferred
/// weekday comes sooner.
#[must_use]
pub fn next_cheat_day(anchor: NaiveDate, frequency_days: i64, preferred: Option<u32>) -> NaiveDate {
    let earliest = anchor + Duration::days(frequency_days.max(1));
    match preferred {
        None => earliest,
        Some(target) => {
            let current = earliest.weekday().num_days_from_sunday();
            let ahead = (target % 7 + 7 - current) % 7;
            earliest + Duration::days(i64::from(ahead))
        }
    }
}

pub fn validate_schedule(frequency_days: i64, preferred: Option<u32>) -> Result<(), StoreError> {
    if frequency_days < 1 {
        return Err(StoreError::validation(
            "cheat day frequency must be at least 1 day",
        ));
    }
    if preferred.is_some_and(|d| d > 6) {
        return Err(StoreError::validation(
            "preferred day of week must be 0 (Sunday) through 6 (Saturday)",
        ));
    }
    Ok(())
}

/// Pure status evaluation. Returns the settings as they should be stored
/// after this read, plus the derived status.
#[must_use]
pub fn evaluate(settings: &CheatDaySettings, today: NaiveDate) -> (CheatDaySettings, CheatDayStatus) {
    let mut next_settings = settings.clone();
    let freq = settings.frequency_days;
    let pref = settings.preferred_day_of_week;

    let mut next = match (settings.last_cheat_day, settings.next_cheat_day) {
        (Some(last), _) => next_cheat_day(last, freq, pref),
        (None, Some(cached)) => cached,
        (None, None) => next_cheat_day(today, freq, pref),
    };
    let mut days_until = (next - today).num_days();
    let mut auto_advanced = false;

    if settings.enabled && days_until <= 0 {
        next_settings.last_cheat_day = Some(today);
        next = next_cheat_day(today, freq, pref);
        days_until = (next - today).num_days();
        auto_advanced = true;
    }
    next_settings.next_cheat_day = Some(next);

    let status = CheatDayStatus {
        enabled: settings.enabled,
        frequency_days: freq,
        preferred_day_of_week: pref,
        last_cheat_day: next_settings.last_cheat_day,
        next_cheat_day: next,
        days_until_next: days_until.max(0),
        days_completed: (freq - days_until).max(0),
        is_cheat_day_today: settings.enabled && next_settings.last_cheat_day == Some(today),
        auto_advanced,
    };
    (next_settings, status)
}

impl Record for CheatDaySettings {
    const KIND: EntityKind = EntityKind::CheatDay;
    const COLUMNS: &'static str = "user_id, frequency_days, preferred_day_of_week,
        last_cheat_day, next_cheat_day, enabled, synced, sync_action, last_modified";

    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            user_id: row.get(0)?,
            frequency_days: row.get(1)?,
            preferred_day_of_week: row.get(2)?,
            last_cheat_day: row.get(3)?,
            next_cheat_day: row.get(4)?,
            enabled: row.get(5)?,
            envelope: SyncEnvelope::from_row(row, 6)?,
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

fn write_settings(
    conn: &Connection,
    settings: &CheatDaySettings,
    now: DateTime<Utc>,
) -> StoreResult<CheatDaySettings> {
    conn.execute(
        "INSERT INTO cheat_day_settings (user_id, frequency_days, preferred_day_of_week,
                                         last_cheat_day, next_cheat_day, enabled,
                                         synced, sync_action, last_modified)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 'create', ?7)
         ON CONFLICT(user_id) DO UPDATE SET
            frequency_days = excluded.frequency_days,
            preferred_day_of_week = excluded.preferred_day_of_week,
            last_cheat_day = excluded.last_cheat_day,
            next_cheat_day = excluded.next_cheat_day,
            enabled = excluded.enabled,
            synced = 0,
            sync_action = 'update',
            last_modified = excluded.last_modified",
        params![
            settings.user_id,
            settings.frequency_days,
            settings.preferred_day_of_week,
            settings.last_cheat_day,
            settings.next_cheat_day,
            settings.enabled,
            now,
        ],
    )?;
    select_record::<CheatDaySettings>(conn, settings.user_id.as_str())?
        .ok_or_else(|| StoreError::not_found(EntityKind::CheatDay, settings.user_id.as_str()))
}

impl Database {
    pub fn get_cheat_day_settings(&self, owner: &UserId) -> StoreResult<Option<CheatDaySettings>> {
        select_record(&self.conn, owner.as_str())
    }

    /// Create or change the schedule. `next_cheat_day` is recomputed from the
    /// last cheat day, or from `today` when there has not been one.
    pub fn configure_cheat_day(
        &mut self,
        owner: &UserId,
        frequency_days: i64,
        preferred_day_of_week: Option<u32>,
        enabled: bool,
        today: NaiveDate,
    ) -> StoreResult<CheatDaySettings> {
        validate_schedule(frequency_days, preferred_day_of_week)?;
        let now = self.clock().now();
        let tx = begin(&mut self.conn)?;
        let last = select_record::<CheatDaySettings>(&tx, owner.as_str())?
            .and_then(|s| s.last_cheat_day);
        let settings = CheatDaySettings {
            user_id: owner.clone(),
            frequency_days,
            preferred_day_of_week,
            last_cheat_day: last,
            next_cheat_day: Some(next_cheat_day(
                last.unwrap_or(today),
                frequency_days,
                preferred_day_of_week,
            )),
            enabled,
            envelope: SyncEnvelope::created(now),
        };
        let stored = write_settings(&tx, &settings, now)?;
        tx.commit()?;
        Ok(stored)
    }

    /// Current schedule status. Reading on or after the scheduled day moves
    /// the schedule forward and persists it. `None` when the user never
    /// configured a schedule.
    pub fn cheat_day_status(
        &mut self,
        owner: &UserId,
        today: NaiveDate,
    ) -> StoreResult<Option<CheatDayStatus>> {
        let now = self.clock().now();
        let tx = begin(&mut self.conn)?;
        let Some(settings) = select_record::<CheatDaySettings>(&tx, owner.as_str())? else {
            return Ok(None);
        };
        let (updated, status) = evaluate(&settings, today);
        let changed = updated.last_cheat_day != settings.last_cheat_day
            || updated.next_cheat_day != settings.next_cheat_day;
        if changed {
            write_settings(&tx, &updated, now)?;
            tx.commit()?;
        }
        if status.auto_advanced {
            tracing::info!(
                event = "cheat_day_auto_advanced",
                user_id = %owner,
                next = %status.next_cheat_day
            );
        }
        Ok(Some(status))
    }

    /// Explicit "mark complete" for today.
    pub fn complete_cheat_day(&mut self, owner: &UserId, today: NaiveDate) -> StoreResult<CheatDaySettings> {
        let now = self.clock().now();
        let tx = begin(&mut self.conn)?;
        let mut settings = select_record::<CheatDaySettings>(&tx, owner.as_str())?
            .ok_or_else(|| StoreError::not_found(EntityKind::CheatDay, owner.as_str()))?;
        settings.last_cheat_day = Some(today);
        settings.next_cheat_day = Some(next_cheat_day(
            today,
            settings.frequency_days,
            settings.preferred_day_of_week,
        ));
        let stored = write_settings(&tx, &settings, now)?;
        tx.commit()?;
        Ok(stored)
    }
}
