//! Daily-activity streaks.
//!
//! A streak row is derived state: it only moves when an activity record
//! (food entry, meal, exercise) is written, and the check runs inside that
//! write's transaction. Days are local calendar dates from the store's clock.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::{Connection, params};

use crate::db::{Database, Record, begin, select_record};
use crate::error::StoreResult;
use crate::models::{EntityKind, StreakState, SyncEnvelope, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreakCounters {
    pub current: i64,
    pub longest: i64,
    pub last_activity_date: Option<NaiveDate>,
}

impl From<&StreakState> for StreakCounters {
    fn from(state: &StreakState) -> Self {
        Self {
            current: state.current_streak,
            longest: state.longest_streak,
            last_activity_date: state.last_activity_date,
        }
    }
}

/// One streak check for activity on `today`.
///
/// Same day is a no-op, the day after extends the run, anything else starts
/// over at 1. A `last_activity_date` in the future (clock moved backwards)
/// is also left alone.
#[must_use]
pub fn advance(prev: StreakCounters, today: NaiveDate) -> StreakCounters {
    let yesterday = today - Duration::days(1);
    let current = match prev.last_activity_date {
        Some(last) if last >= today => return prev,
        Some(last) if last == yesterday => prev.current + 1,
        _ => 1,
    };
    StreakCounters {
        current,
        longest: prev.longest.max(current),
        last_activity_date: Some(today),
    }
}

/// Rebuilds counters from the set of days with activity.
#[must_use]
pub fn from_activity_dates(dates: &[NaiveDate], today: NaiveDate) -> StreakCounters {
    let mut days: Vec<NaiveDate> = dates.iter().copied().filter(|d| *d <= today).collect();
    days.sort_unstable();
    days.dedup();

    let Some(&last) = days.last() else {
        return StreakCounters::default();
    };

    let mut longest = 0;
    let mut run = 0;
    let mut prev: Option<NaiveDate> = None;
    for day in &days {
        run = match prev {
            Some(p) if *day - p == Duration::days(1) => run + 1,
            _ => 1,
        };
        longest = longest.max(run);
        prev = Some(*day);
    }

    // `run` now holds the length of the run ending at `last`.
    let current = if today - last <= Duration::days(1) { run } else { 0 };
    StreakCounters {
        current,
        longest,
        last_activity_date: Some(last),
    }
}

impl StreakState {
    /// The streak as the user should see it on `today`: a run whose last
    /// active day is before yesterday has lapsed.
    #[must_use]
    pub fn current_as_of(&self, today: NaiveDate) -> i64 {
        match self.last_activity_date {
            Some(last) if today - last <= Duration::days(1) => self.current_streak,
            _ => 0,
        }
    }
}

impl Record for StreakState {
    const KIND: EntityKind = EntityKind::Streak;
    const COLUMNS: &'static str = "user_id, current_streak, longest_streak, last_activity_date,
        synced, sync_action, last_modified";

    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            user_id: row.get(0)?,
            current_streak: row.get(1)?,
            longest_streak: row.get(2)?,
            last_activity_date: row.get(3)?,
            envelope: SyncEnvelope::from_row(row, 4)?,
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

fn write_counters(
    conn: &Connection,
    owner: &UserId,
    counters: StreakCounters,
    now: DateTime<Utc>,
) -> StoreResult<StreakState> {
    conn.execute(
        "INSERT INTO streaks (user_id, current_streak, longest_streak, last_activity_date,
                              synced, sync_action, last_modified)
         VALUES (?1, ?2, ?3, ?4, 0, 'create', ?5)
         ON CONFLICT(user_id) DO UPDATE SET
            current_streak = excluded.current_streak,
            longest_streak = excluded.longest_streak,
            last_activity_date = excluded.last_activity_date,
            synced = 0,
            sync_action = 'update',
            last_modified = excluded.last_modified",
        params![
            owner,
            counters.current,
            counters.longest,
            counters.last_activity_date,
            now
        ],
    )?;
    load(conn, owner)
}

fn load(conn: &Connection, owner: &UserId) -> StoreResult<StreakState> {
    select_record::<StreakState>(conn, owner.as_str())?
        .ok_or_else(|| crate::error::StoreError::not_found(EntityKind::Streak, owner.as_str()))
}

/// Streak check inside the caller's transaction. Lazily creates the row and
/// writes only when the counters actually change.
pub(crate) fn apply_check(
    conn: &Connection,
    owner: &UserId,
    today: NaiveDate,
    now: DateTime<Utc>,
) -> StoreResult<StreakState> {
    let existing = select_record::<StreakState>(conn, owner.as_str())?;
    let prev = existing.as_ref().map(StreakCounters::from).unwrap_or_default();
    let next = advance(prev, today);

    match existing {
        Some(state) if next == prev => Ok(state),
        _ => {
            tracing::debug!(
                event = "streak_advanced",
                user_id = %owner,
                current = next.current,
                longest = next.longest
            );
            write_counters(conn, owner, next, now)
        }
    }
}

impl Database {
    pub fn get_streak(&self, owner: &UserId) -> StoreResult<Option<StreakState>> {
        select_record(&self.conn, owner.as_str())
    }

    /// Run the streak transition for `today` on its own.
    pub fn check_streak(&mut self, owner: &UserId, today: NaiveDate) -> StoreResult<StreakState> {
        let now = self.clock().now();
        let tx = begin(&mut self.conn)?;
        let state = apply_check(&tx, owner, today, now)?;
        tx.commit()?;
        Ok(state)
    }

    /// Repair path: rebuild the streak row from the distinct days that have
    /// food entries or exercises.
    pub fn recompute_streak(&mut self, owner: &UserId, today: NaiveDate) -> StoreResult<StreakState> {
        let now = self.clock().now();
        let tx = begin(&mut self.conn)?;
        let dates: Vec<NaiveDate> = {
            let mut stmt = tx.prepare(
                "SELECT date FROM food_entries WHERE user_id = ?1
                 UNION
                 SELECT date FROM exercises WHERE user_id = ?1
                 ORDER BY date",
            )?;
            stmt.query_map([owner], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?
        };
        let counters = from_activity_dates(&dates, today);
        let state = write_counters(&tx, owner, counters, now)?;
        tx.commit()?;

        tracing::info!(
            event = "streak_recomputed",
            user_id = %owner,
            active_days = dates.len(),
            current = counters.current,
            longest = counters.longest
        );
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::db::tests::{food, test_db, today, user};
    use crate::models::{NewExercise, SyncAction};

    fn day(offset: i64) -> NaiveDate {
        today() + Duration::days(offset)
    }

    fn counters(current: i64, longest: i64, last: Option<NaiveDate>) -> StreakCounters {
        StreakCounters {
            current,
            longest,
            last_activity_date: last,
        }
    }

    #[test]
    fn test_first_activity_starts_streak() {
        assert_eq!(
            advance(StreakCounters::default(), today()),
            counters(1, 1, Some(today()))
        );
    }

    #[test]
    fn test_same_day_is_idempotent() {
        let prev = counters(3, 5, Some(today()));
        let once = advance(prev, today());
        let twice = advance(once, today());
        assert_eq!(once, prev);
        assert_eq!(twice, prev);
    }

    #[test]
    fn test_consecutive_day_extends() {
        let next = advance(counters(4, 4, Some(day(-1))), today());
        assert_eq!(next, counters(5, 5, Some(today())));
    }

    #[test]
    fn test_gap_resets_but_keeps_longest() {
        let next = advance(counters(6, 9, Some(day(-2))), today());
        assert_eq!(next, counters(1, 9, Some(today())));
    }

    #[test]
    fn test_future_last_date_is_left_alone() {
        let prev = counters(2, 2, Some(day(1)));
        assert_eq!(advance(prev, today()), prev);
    }

    #[test]
    fn test_from_activity_dates() {
        let dates = [day(-10), day(-9), day(-8), day(-7), day(-3), day(-1), day(0), day(0)];
        assert_eq!(
            from_activity_dates(&dates, today()),
            counters(2, 4, Some(today()))
        );
        // A run ending yesterday is still alive.
        assert_eq!(
            from_activity_dates(&[day(-2), day(-1)], today()).current,
            2
        );
        // Lapsed run.
        assert_eq!(from_activity_dates(&[day(-5), day(-4)], today()).current, 0);
        assert_eq!(
            from_activity_dates(&[], today()),
            StreakCounters::default()
        );
    }

    #[test]
    fn test_repeated_logging_same_day_does_not_double_count() {
        let (mut db, _) = test_db();
        let alice = user("alice");
        for name in ["Eggs", "Toast", "Coffee"] {
            db.insert_food_entry(&alice, food(today(), name)).unwrap();
        }
        let state = db.get_streak(&alice).unwrap().unwrap();
        assert_eq!(state.current_streak, 1);
        assert_eq!(state.envelope.sync_action, Some(SyncAction::Create));
    }

    #[test]
    fn test_logging_on_consecutive_days() {
        let (mut db, clock) = test_db();
        let alice = user("alice");
        db.insert_food_entry(&alice, food(today(), "Eggs")).unwrap();
        clock.advance_days(1);
        db.insert_exercise(
            &alice,
            NewExercise {
                date: clock.today(),
                exercise_name: "Swim".to_string(),
                duration_minutes: 20,
                calories_burned: 180.0,
                notes: None,
            },
        )
        .unwrap();
        let state = db.get_streak(&alice).unwrap().unwrap();
        assert_eq!((state.current_streak, state.longest_streak), (2, 2));
        assert_eq!(state.envelope.sync_action, Some(SyncAction::Update));

        clock.advance_days(3);
        let state = db.check_streak(&alice, clock.today()).unwrap();
        assert_eq!((state.current_streak, state.longest_streak), (1, 2));
    }

    #[test]
    fn test_current_as_of_lapses() {
        let (mut db, _) = test_db();
        let state = db.check_streak(&user("alice"), today()).unwrap();
        assert_eq!(state.current_as_of(today()), 1);
        assert_eq!(state.current_as_of(day(1)), 1);
        assert_eq!(state.current_as_of(day(2)), 0);
    }

    #[test]
    fn test_recompute_streak_from_history() {
        let (mut db, _) = test_db();
        let alice = user("alice");
        for offset in [-4, -3, -1, 0] {
            db.insert_food_entry(&alice, food(day(offset), "Rice")).unwrap();
        }
        db.conn.execute("DELETE FROM streaks", []).unwrap();

        let state = db.recompute_streak(&alice, today()).unwrap();
        assert_eq!(state.current_streak, 2);
        assert_eq!(state.longest_streak, 2);
        assert_eq!(state.last_activity_date, Some(today()));
    }
}
