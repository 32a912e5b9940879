//! Streak and cheat-day commands.

use anyhow::Result;

use kcal_core::Store;
use kcal_core::models::{StreakState, UserId};

use super::helpers::{WEEKDAY_NAMES, json_error, parse_weekday, print_json};

fn print_streak(s: &StreakState) {
    println!(
        "Current streak: {} day{}",
        s.current_streak,
        if s.current_streak == 1 { "" } else { "s" }
    );
    println!("Longest streak: {}", s.longest_streak);
    if let Some(last) = s.last_activity_date {
        println!("Last activity:  {}", last.format("%Y-%m-%d"));
    }
}

pub(crate) async fn cmd_streak_show(store: &Store, owner: &UserId, json: bool) -> Result<()> {
    let Some(state) = store.get_streak(owner).await? else {
        if json {
            println!("{}", json_error(&format!("No activity logged for {owner}")));
        } else {
            eprintln!("No streak yet. Log a food entry or exercise to start one.");
        }
        return Ok(());
    };
    if json {
        print_json(&state)?;
    } else {
        print_streak(&state);
    }
    Ok(())
}

pub(crate) async fn cmd_streak_recompute(store: &Store, owner: &UserId, json: bool) -> Result<()> {
    let state = store.recompute_streak(owner, store.today()).await?;
    if json {
        print_json(&state)?;
    } else {
        println!("Rebuilt from logged activity.");
        print_streak(&state);
    }
    Ok(())
}

pub(crate) async fn cmd_cheat_day_status(store: &Store, owner: &UserId, json: bool) -> Result<()> {
    let Some(status) = store.cheat_day_status(owner, store.today()).await? else {
        if json {
            println!("{}", json_error("No cheat-day schedule configured"));
        } else {
            eprintln!("No cheat-day schedule. Use `kcal cheat-day set --every N` to create one.");
        }
        return Ok(());
    };

    if json {
        print_json(&status)?;
        return Ok(());
    }

    if !status.enabled {
        println!("Cheat days are disabled.");
    }
    if status.is_cheat_day_today {
        println!("Today is your cheat day!");
    } else {
        println!(
            "Next cheat day: {} (in {} day{})",
            status.next_cheat_day.format("%a %Y-%m-%d"),
            status.days_until_next,
            if status.days_until_next == 1 { "" } else { "s" }
        );
    }
    let preferred = status
        .preferred_day_of_week
        .and_then(|d| WEEKDAY_NAMES.get(d as usize))
        .map_or(String::new(), |d| format!(", preferably on {d}"));
    println!("Every {} days{preferred}", status.frequency_days);
    if let Some(last) = status.last_cheat_day {
        println!(
            "Last cheat day: {} ({} days ago)",
            last.format("%Y-%m-%d"),
            status.days_completed
        );
    }
    if status.auto_advanced {
        println!("(The missed cheat day was skipped and the schedule moved forward.)");
    }
    Ok(())
}

pub(crate) async fn cmd_cheat_day_set(
    store: &Store,
    owner: &UserId,
    every: i64,
    day: Option<&str>,
    enabled: bool,
    json: bool,
) -> Result<()> {
    let preferred = day.map(parse_weekday).transpose()?;
    let settings = store
        .configure_cheat_day(owner, every, preferred, enabled, store.today())
        .await?;

    if json {
        print_json(&settings)?;
    } else if let Some(next) = settings.next_cheat_day {
        println!(
            "Cheat day every {} days. Next: {}",
            settings.frequency_days,
            next.format("%a %Y-%m-%d")
        );
    }
    Ok(())
}

pub(crate) async fn cmd_cheat_day_complete(store: &Store, owner: &UserId, json: bool) -> Result<()> {
    let settings = store.complete_cheat_day(owner, store.today()).await?;
    if json {
        print_json(&settings)?;
    } else if let Some(next) = settings.next_cheat_day {
        println!("Enjoy! Next cheat day: {}", next.format("%a %Y-%m-%d"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cheat_day_set_then_complete() {
        let store = Store::open_in_memory().unwrap();
        let alice = UserId::new("alice").unwrap();
        cmd_cheat_day_set(&store, &alice, 7, Some("sat"), true, true)
            .await
            .unwrap();
        let settings = store.get_cheat_day_settings(&alice).await.unwrap().unwrap();
        assert_eq!(settings.preferred_day_of_week, Some(6));

        cmd_cheat_day_complete(&store, &alice, true).await.unwrap();
        let settings = store.get_cheat_day_settings(&alice).await.unwrap().unwrap();
        assert_eq!(settings.last_cheat_day, Some(store.today()));
    }

    #[tokio::test]
    async fn test_complete_without_schedule_fails() {
        let store = Store::open_in_memory().unwrap();
        let alice = UserId::new("alice").unwrap();
        assert!(cmd_cheat_day_complete(&store, &alice, true).await.is_err());
        // Status on an unconfigured user is not an error.
        cmd_cheat_day_status(&store, &alice, true).await.unwrap();
    }

    #[tokio::test]
    async fn test_streak_show_for_new_user() {
        let store = Store::open_in_memory().unwrap();
        let alice = UserId::new("alice").unwrap();
        cmd_streak_show(&store, &alice, true).await.unwrap();
        // Showing is read-only.
        assert!(store.get_streak(&alice).await.unwrap().is_none());
    }
}
