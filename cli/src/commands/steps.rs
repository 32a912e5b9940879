use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use kcal_core::Store;
use kcal_core::models::UserId;
use kcal_core::steps::{
    FileStepCache, StepCache, StepFeeder, StepHealth, StepService, check_step_heartbeat,
};

use crate::config::Config;

use super::helpers::{json_error, parse_date, print_json};

pub(crate) async fn cmd_steps_show(
    store: &Store,
    owner: &UserId,
    date: Option<String>,
    json: bool,
) -> Result<()> {
    let date = parse_date(date, store.today())?;
    let date_str = date.format("%Y-%m-%d");
    match store.get_daily_steps(owner, date).await? {
        Some(steps) if json => print_json(&steps)?,
        Some(steps) => println!(
            "{date_str}: {} steps{}",
            steps.count,
            if steps.envelope.synced { "" } else { " (not synced)" }
        ),
        None if json => println!("{}", json_error(&format!("No steps recorded for {date_str}"))),
        None => eprintln!("No steps recorded for {date_str}"),
    }
    Ok(())
}

pub(crate) fn cmd_steps_cache(
    store: &Store,
    config: &Config,
    owner: &UserId,
    json: bool,
) -> Result<()> {
    let today = store.today();
    let cache = FileStepCache::new(config.step_cache_path());
    let total = cache.read(owner, today);
    if json {
        println!(
            "{}",
            serde_json::json!({ "date": today, "total": total, "path": cache.path() })
        );
    } else if let Some(total) = total {
        println!("Cached total for {}: {total} steps", today.format("%Y-%m-%d"));
    } else {
        eprintln!("No cached total for today in {}", cache.path().display());
    }
    Ok(())
}

pub(crate) async fn cmd_steps_override(
    store: &Store,
    config: &Config,
    owner: &UserId,
    count: i64,
    date: Option<String>,
    json: bool,
) -> Result<()> {
    let date = parse_date(date, store.today())?;
    let steps = store.override_daily_steps(owner, date, count).await?;
    // A stale higher cache would otherwise be merged back on the next run.
    if date == store.today() {
        FileStepCache::new(config.step_cache_path()).write(owner, date, count);
    }

    if json {
        print_json(&steps)?;
    } else {
        println!(
            "Set {} to {} steps",
            steps.date.format("%Y-%m-%d"),
            steps.count
        );
    }
    Ok(())
}

/// Push cumulative readings from `input`, one integer per line. A line
/// reading `reset` ends the sensor session, as a device reboot would.
async fn feed_lines<R: AsyncBufRead + Unpin>(input: R, feeder: StepFeeder) {
    let mut lines = input.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(event = "step_input_failed", error = %e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.eq_ignore_ascii_case("reset") {
            feeder.end_session();
            continue;
        }
        match line.parse::<i64>() {
            Ok(reading) => {
                if let Err(e) = feeder.push(reading) {
                    tracing::warn!(event = "step_reading_dropped", reading, error = %e);
                }
            }
            Err(_) => tracing::warn!(event = "step_input_invalid", line),
        }
    }
}

pub(crate) async fn cmd_steps_run(
    store: &Store,
    config: &Config,
    owner: &UserId,
    seconds: Option<u64>,
    json: bool,
) -> Result<()> {
    let (source, feeder) = config.settings.step_source.build();
    let source_name = source.name();
    let cache: Arc<dyn StepCache> = Arc::new(FileStepCache::new(config.step_cache_path()));
    let handle = StepService::spawn(
        store.clone(),
        source,
        cache,
        owner.clone(),
        Arc::clone(store.clock()),
        config.settings.step_service,
    );

    if let Some(feeder) = feeder {
        tokio::spawn(feed_lines(BufReader::new(tokio::io::stdin()), feeder));
        if !json {
            eprintln!("Reading cumulative step counts from stdin, one per line.");
        }
    }
    if !json {
        eprintln!("Step service running (source: {source_name}). Press Ctrl-C to stop.");
    }

    match seconds {
        Some(secs) => {
            tokio::select! {
                () = tokio::time::sleep(Duration::from_secs(secs)) => {}
                res = tokio::signal::ctrl_c() => res.context("Failed to listen for Ctrl-C")?,
            }
        }
        None => tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?,
    }

    let total = handle.stop().await?;
    let today = store.today();
    if json {
        println!(
            "{}",
            serde_json::json!({ "date": today, "total": total, "source": source_name })
        );
    } else {
        println!(
            "Stopped. {} steps for {}",
            total,
            today.format("%Y-%m-%d")
        );
    }
    Ok(())
}

pub(crate) async fn cmd_steps_health(
    store: &Store,
    config: &Config,
    owner: &UserId,
    json: bool,
) -> Result<()> {
    let now = store.clock().now();
    let health = check_step_heartbeat(store, owner, now, &config.settings.watchdog).await?;

    if json {
        print_json(&health)?;
    } else {
        match health {
            StepHealth::Alive { last_heartbeat } => {
                println!("Alive. Last heartbeat {}", last_heartbeat.to_rfc3339());
            }
            StepHealth::Stale {
                last_heartbeat,
                silent_for,
            } => println!(
                "Stale. Last heartbeat {} ({}s ago); restart with `kcal steps run`",
                last_heartbeat.to_rfc3339(),
                silent_for.as_secs()
            ),
            StepHealth::NeverStarted => println!("The step service has never run for {owner}"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kcal_core::steps::ChannelStepSource;
    use kcal_core::steps::StepSource;

    #[tokio::test]
    async fn test_feed_lines_pushes_readings() {
        let (source, feeder) = ChannelStepSource::new();
        let mut rx = source.subscribe().unwrap();

        let input: &[u8] = b"10\n\nnot-a-number\n25\n";
        feed_lines(input, feeder).await;

        assert_eq!(rx.recv().await, Some(10));
        assert_eq!(rx.recv().await, Some(25));
    }

    #[tokio::test]
    async fn test_reset_line_ends_session() {
        let (source, feeder) = ChannelStepSource::new();
        let mut rx = source.subscribe().unwrap();

        let input: &[u8] = b"10\nreset\n";
        feed_lines(input, feeder).await;

        assert_eq!(rx.recv().await, Some(10));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_override_rewrites_todays_cache() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_dirs(dir.path(), &dir.path().join("none.toml")).unwrap();
        let store = Store::open_in_memory().unwrap();
        let alice = UserId::new("alice").unwrap();
        let cache = FileStepCache::new(config.step_cache_path());
        cache.write(&alice, store.today(), 9000);

        cmd_steps_override(&store, &config, &alice, 4000, None, true)
            .await
            .unwrap();

        assert_eq!(cache.read(&alice, store.today()), Some(4000));
        let stored = store.get_daily_steps(&alice, store.today()).await.unwrap();
        assert_eq!(stored.map(|s| s.count), Some(4000));
    }
}
