use anyhow::Result;

use kcal_core::Store;
use kcal_core::models::{OnboardingSession, ProfileUpdate, UserId};
use kcal_core::retention::RetentionPolicy;

use super::helpers::{json_error, print_json};
use super::profile::{ProfileArgs, print_profile};

/// Fields given now win; anything left out keeps its saved value.
fn overlay(saved: ProfileUpdate, new: ProfileUpdate) -> ProfileUpdate {
    ProfileUpdate {
        first_name: new.first_name.or(saved.first_name),
        last_name: new.last_name.or(saved.last_name),
        height_cm: new.height_cm.or(saved.height_cm),
        weight_kg: new.weight_kg.or(saved.weight_kg),
        age: new.age.or(saved.age),
        gender: new.gender.or(saved.gender),
        activity_level: new.activity_level.or(saved.activity_level),
        weight_goal: new.weight_goal.or(saved.weight_goal),
        target_weight_kg: new.target_weight_kg.or(saved.target_weight_kg),
        starting_weight_kg: new.starting_weight_kg.or(saved.starting_weight_kg),
        is_imperial_units: new.is_imperial_units.or(saved.is_imperial_units),
    }
}

fn print_session(s: &OnboardingSession) -> Result<()> {
    println!(
        "Session {} at step {} (started {}, updated {})",
        s.session_id,
        s.step_index,
        s.created_at.to_rfc3339(),
        s.updated_at.to_rfc3339()
    );
    println!("{}", serde_json::to_string_pretty(&s.profile)?);
    Ok(())
}

pub(crate) async fn cmd_onboarding_save(
    store: &Store,
    session_id: &str,
    fields: ProfileArgs,
    step: i64,
    json: bool,
) -> Result<()> {
    let saved = store
        .load_onboarding(session_id)
        .await?
        .map(|s| s.profile)
        .unwrap_or_default();
    let partial = overlay(saved, ProfileUpdate::from(fields));
    let session = store.save_onboarding(session_id, partial, step).await?;
    if json {
        print_json(&session)?;
    } else {
        print_session(&session)?;
    }
    Ok(())
}

pub(crate) async fn cmd_onboarding_show(store: &Store, session_id: &str, json: bool) -> Result<()> {
    match store.load_onboarding(session_id).await? {
        Some(s) if json => print_json(&s)?,
        Some(s) => print_session(&s)?,
        None if json => println!(
            "{}",
            json_error(&format!("No onboarding session {session_id}"))
        ),
        None => eprintln!("No onboarding session {session_id}"),
    }
    Ok(())
}

pub(crate) async fn cmd_onboarding_consume(
    store: &Store,
    owner: &UserId,
    session_id: &str,
    json: bool,
) -> Result<()> {
    let profile = store.consume_onboarding(session_id, owner).await?;
    if json {
        print_json(&profile)?;
    } else {
        print_profile(&profile);
    }
    Ok(())
}

pub(crate) async fn cmd_onboarding_purge(
    store: &Store,
    policy: &RetentionPolicy,
    json: bool,
) -> Result<()> {
    let purged = store
        .purge_expired_onboarding(store.clock().now(), policy.onboarding_days)
        .await?;
    if json {
        println!("{}", serde_json::json!({ "purged": purged }));
    } else {
        println!(
            "Removed {purged} onboarding session(s) idle for more than {} days",
            policy.onboarding_days
        );
    }
    Ok(())
}

pub(crate) async fn cmd_purge(
    store: &Store,
    owner: &UserId,
    policy: &RetentionPolicy,
    json: bool,
) -> Result<()> {
    let horizon = policy.horizon(store.today());
    let report = store.purge_synced_before(owner, horizon).await?;
    let sessions = store
        .purge_expired_onboarding(store.clock().now(), policy.onboarding_days)
        .await?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "report": report, "onboarding_sessions": sessions })
        );
    } else {
        println!(
            "Removed {} synced row(s) dated before {}",
            report.total(),
            horizon.format("%Y-%m-%d")
        );
        for (kind, n) in &report.removed {
            println!("  {:<12} {n}", kind.as_str());
        }
        if sessions > 0 {
            println!("Removed {sessions} expired onboarding session(s)");
        }
    }
    Ok(())
}
