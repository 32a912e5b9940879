//! Pre-login onboarding sessions.
//!
//! A session holds the partial profile entered so far, keyed by an opaque id
//! generated on the device. It turns into a real profile once the user signs
//! in, or is purged after the retention window.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{OptionalExtension, params};

use crate::db::{Database, begin, upsert_profile_row};
use crate::error::{StoreError, StoreResult};
use crate::models::{OnboardingSession, Profile, ProfileUpdate, UserId, validate_profile_update};

pub const DEFAULT_ONBOARDING_RETENTION_DAYS: i64 = 7;

fn load(conn: &rusqlite::Connection, session_id: &str) -> StoreResult<Option<OnboardingSession>> {
    let row = conn
        .query_row(
            "SELECT session_id, profile_json, step_index, created_at, updated_at
             FROM onboarding_sessions WHERE session_id = ?1",
            [session_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, DateTime<Utc>>(3)?,
                    row.get::<_, DateTime<Utc>>(4)?,
                ))
            },
        )
        .optional()?;
    row.map(
        |(session_id, json, step_index, created_at, updated_at)| -> StoreResult<_> {
            Ok(OnboardingSession {
                session_id,
                profile: serde_json::from_str(&json)?,
                step_index,
                created_at,
                updated_at,
            })
        },
    )
    .transpose()
}

impl Database {
    /// Save progress. The first save creates the session; later saves
    /// replace the partial profile and step index.
    pub fn save_onboarding(
        &mut self,
        session_id: &str,
        mut partial: ProfileUpdate,
        step_index: i64,
    ) -> StoreResult<OnboardingSession> {
        if session_id.trim().is_empty() {
            return Err(StoreError::validation("session id must not be empty"));
        }
        if step_index < 0 {
            return Err(StoreError::validation("step index must not be negative"));
        }
        validate_profile_update(&mut partial)?;
        let json = serde_json::to_string(&partial)?;
        let now = self.clock().now();
        self.conn.execute(
            "INSERT INTO onboarding_sessions (session_id, profile_json, step_index,
                                              created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(session_id) DO UPDATE SET
                profile_json = excluded.profile_json,
                step_index = excluded.step_index,
                updated_at = excluded.updated_at",
            params![session_id, json, step_index, now],
        )?;
        load(&self.conn, session_id)?
            .ok_or_else(|| StoreError::validation(format!("onboarding session {session_id} vanished")))
    }

    pub fn load_onboarding(&self, session_id: &str) -> StoreResult<Option<OnboardingSession>> {
        load(&self.conn, session_id)
    }

    /// Turn a session into `owner`'s profile: merge the partial profile,
    /// flag onboarding complete and drop the session, atomically.
    pub fn consume_onboarding(&mut self, session_id: &str, owner: &UserId) -> StoreResult<Profile> {
        let now = self.clock().now();
        let tx = begin(&mut self.conn)?;
        let session =
            load(&tx, session_id)?.ok_or_else(|| StoreError::OnboardingNotFound {
                session_id: session_id.to_string(),
            })?;
        let profile = upsert_profile_row(&tx, owner, &session.profile, true, now)?;
        tx.execute(
            "DELETE FROM onboarding_sessions WHERE session_id = ?1",
            [session_id],
        )?;
        tx.commit()?;

        tracing::info!(
            event = "onboarding_consumed",
            user_id = %owner,
            steps_completed = session.step_index
        );
        Ok(profile)
    }

    /// Drop sessions untouched for `retention_days`. Returns how many went.
    pub fn purge_expired_onboarding(
        &mut self,
        now: DateTime<Utc>,
        retention_days: i64,
    ) -> StoreResult<usize> {
        let cutoff = now - Duration::days(retention_days);
        let purged = self.conn.execute(
            "DELETE FROM onboarding_sessions WHERE updated_at < ?1",
            params![cutoff],
        )?;
        if purged > 0 {
            tracing::info!(event = "onboarding_purged", sessions = purged);
        }
        Ok(purged)
    }
}
