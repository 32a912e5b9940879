//! Local retention: old rows the server already has are dropped from the
//! device. Unsynced rows are never touched.

use chrono::{Duration, NaiveDate};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::db::{Database, begin};
use crate::error::StoreResult;
use crate::models::{EntityKind, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Synced dated rows older than this many days are purged.
    pub synced_days: i64,
    pub onboarding_days: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            synced_days: 90,
            onboarding_days: crate::onboarding::DEFAULT_ONBOARDING_RETENTION_DAYS,
        }
    }
}

impl RetentionPolicy {
    #[must_use]
    pub fn horizon(&self, today: NaiveDate) -> NaiveDate {
        today - Duration::days(self.synced_days)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub horizon: Option<NaiveDate>,
    pub removed: Vec<(EntityKind, usize)>,
}

impl PurgeReport {
    #[must_use]
    pub fn total(&self) -> usize {
        self.removed.iter().map(|(_, n)| n).sum()
    }
}

// Children before parents: food entries reference meals.
const PURGE_ORDER: [EntityKind; 5] = [
    EntityKind::FoodEntry,
    EntityKind::Meal,
    EntityKind::Exercise,
    EntityKind::Weight,
    EntityKind::DailySteps,
];

impl Database {
    /// Delete `owner`'s synced rows dated before `horizon`, in one
    /// transaction. A synced meal that still has an unsynced entry stays.
    pub fn purge_synced_before(
        &mut self,
        owner: &UserId,
        horizon: NaiveDate,
    ) -> StoreResult<PurgeReport> {
        let tx = begin(&mut self.conn)?;
        let mut report = PurgeReport {
            horizon: Some(horizon),
            removed: Vec::new(),
        };
        for kind in PURGE_ORDER {
            let extra = if kind == EntityKind::Meal {
                " AND NOT EXISTS (SELECT 1 FROM food_entries f WHERE f.meal_id = meals.id)"
            } else {
                ""
            };
            let sql = format!(
                "DELETE FROM {table} WHERE user_id = ?1 AND date < ?2 AND synced = 1{extra}",
                table = kind.table()
            );
            let n = tx.execute(&sql, params![owner, horizon])?;
            if n > 0 {
                report.removed.push((kind, n));
            }
        }
        tx.commit()?;

        tracing::info!(
            event = "retention_purged",
            user_id = %owner,
            %horizon,
            rows = report.total()
        );
        Ok(report)
    }
}
