//! Detects a background step task that the OS killed without telling us.
//!
//! Every persistence cycle stamps a heartbeat. If the heartbeat is older than
//! `max_silence_secs` the task is presumed dead; restarting it is up to the
//! host.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;
use crate::models::{StepSyncState, UserId};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub max_silence_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            max_silence_secs: 180,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepHealth {
    Alive {
        last_heartbeat: DateTime<Utc>,
    },
    Stale {
        last_heartbeat: DateTime<Utc>,
        #[serde(with = "duration_secs")]
        silent_for: std::time::Duration,
    },
    NeverStarted,
}

mod duration_secs {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &std::time::Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}

impl StepHealth {
    #[must_use]
    pub fn is_alive(&self) -> bool {
        matches!(self, Self::Alive { .. })
    }
}

/// Pure staleness check. A heartbeat from the future counts as alive.
#[must_use]
pub fn assess(
    state: Option<&StepSyncState>,
    now: DateTime<Utc>,
    config: &WatchdogConfig,
) -> StepHealth {
    let Some(last_heartbeat) = state.and_then(|s| s.last_heartbeat_at) else {
        return StepHealth::NeverStarted;
    };
    let silent_for = (now - last_heartbeat).to_std().unwrap_or_default();
    if silent_for.as_secs() > config.max_silence_secs {
        StepHealth::Stale {
            last_heartbeat,
            silent_for,
        }
    } else {
        StepHealth::Alive { last_heartbeat }
    }
}

pub async fn check_step_heartbeat(
    store: &Store,
    owner: &UserId,
    now: DateTime<Utc>,
    config: &WatchdogConfig,
) -> StoreResult<StepHealth> {
    let state = store.get_step_sync_state(owner).await?;
    let health = assess(state.as_ref(), now, config);
    if let StepHealth::Stale { silent_for, .. } = &health {
        tracing::warn!(
            event = "step_heartbeat_stale",
            user_id = %owner,
            silent_secs = silent_for.as_secs()
        );
    }
    Ok(health)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn state(heartbeat: Option<DateTime<Utc>>) -> StepSyncState {
        StepSyncState {
            user_id: UserId::new("alice").unwrap(),
            last_sync_date: None,
            last_heartbeat_at: heartbeat,
        }
    }

    #[test]
    fn test_assess() {
        let config = WatchdogConfig::default();
        let now = Utc::now();

        assert_eq!(assess(None, now, &config), StepHealth::NeverStarted);
        assert_eq!(
            assess(Some(&state(None)), now, &config),
            StepHealth::NeverStarted
        );

        let recent = now - Duration::seconds(60);
        assert!(assess(Some(&state(Some(recent))), now, &config).is_alive());

        let old = now - Duration::minutes(10);
        assert_eq!(
            assess(Some(&state(Some(old))), now, &config),
            StepHealth::Stale {
                last_heartbeat: old,
                silent_for: std::time::Duration::from_secs(600),
            }
        );

        let future = now + Duration::seconds(30);
        assert!(assess(Some(&state(Some(future))), now, &config).is_alive());
    }

    #[tokio::test]
    async fn test_check_against_store() {
        let store = Store::open_in_memory().unwrap();
        let alice = UserId::new("alice").unwrap();
        let config = WatchdogConfig::default();
        let today = store.today();

        assert_eq!(
            check_step_heartbeat(&store, &alice, Utc::now(), &config)
                .await
                .unwrap(),
            StepHealth::NeverStarted
        );

        store.persist_step_cycle(&alice, today, 10, None).await.unwrap();
        let health = check_step_heartbeat(&store, &alice, Utc::now(), &config)
            .await
            .unwrap();
        assert!(health.is_alive());

        let later = Utc::now() + Duration::hours(1);
        let health = check_step_heartbeat(&store, &alice, later, &config)
            .await
            .unwrap();
        assert!(matches!(health, StepHealth::Stale { .. }));
    }

    #[test]
    fn test_health_serializes_with_status_tag() {
        let json = serde_json::to_value(StepHealth::NeverStarted).unwrap();
        assert_eq!(json["status"], "never_started");
    }
}
