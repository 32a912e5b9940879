mod commands;
mod config;
mod logging;
mod server;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process;

use crate::commands::{
    ProfileArgs, cmd_cheat_day_complete, cmd_cheat_day_set, cmd_cheat_day_status,
    cmd_exercise_delete, cmd_exercise_list, cmd_exercise_log, cmd_food_delete, cmd_food_list,
    cmd_food_log, cmd_food_update, cmd_import_csv, cmd_meal_delete, cmd_meal_log,
    cmd_onboarding_consume, cmd_onboarding_purge, cmd_onboarding_save, cmd_onboarding_show,
    cmd_profile_set, cmd_profile_show, cmd_purge, cmd_steps_cache, cmd_steps_health,
    cmd_steps_override, cmd_steps_run, cmd_steps_show, cmd_streak_recompute, cmd_streak_show,
    cmd_sync_list, cmd_sync_mark, cmd_sync_pending, cmd_sync_tombstones, cmd_weight_delete,
    cmd_weight_history, cmd_weight_log,
};
use crate::config::Config;
use kcal_core::Store;

#[derive(Parser)]
#[command(
    name = "kcal",
    version,
    about = "An offline-first nutrition and fitness tracker"
)]
struct Cli {
    /// User to act as (default: `user_id` from config.toml, else "local")
    #[arg(long, global = true)]
    user: Option<String>,
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log, list, edit and delete single food entries
    Food {
        #[command(subcommand)]
        command: FoodCommands,
    },
    /// Log several food items as one meal
    Meal {
        #[command(subcommand)]
        command: MealCommands,
    },
    /// Track exercise sessions
    Exercise {
        #[command(subcommand)]
        command: ExerciseCommands,
    },
    /// Track body weight
    Weight {
        #[command(subcommand)]
        command: WeightCommands,
    },
    /// Show or edit the user profile
    Profile {
        #[command(subcommand)]
        command: ProfileCommands,
    },
    /// Daily step counts and the background step service
    Steps {
        #[command(subcommand)]
        command: StepsCommands,
    },
    /// Consecutive-day activity streak
    Streak {
        #[command(subcommand)]
        command: StreakCommands,
    },
    /// Recurring cheat-day schedule
    CheatDay {
        #[command(subcommand)]
        command: CheatDayCommands,
    },
    /// Inspect and acknowledge the upload queue
    Sync {
        #[command(subcommand)]
        command: SyncCommands,
    },
    /// Temporary onboarding sessions
    Onboarding {
        #[command(subcommand)]
        command: OnboardingCommands,
    },
    /// Remove old synced rows from this device
    Purge {
        /// Keep this many days instead of the configured retention
        #[arg(long)]
        days: Option<i64>,
    },
    /// Import data from external sources
    Import {
        #[command(subcommand)]
        command: ImportCommands,
    },
    /// Start the uploader API server
    Serve {
        /// Port to listen on (default: [server] port, else 8080)
        #[arg(short, long)]
        port: Option<u16>,
        /// Address to bind to (default: 127.0.0.1, use 0.0.0.0 to expose to network)
        #[arg(short, long)]
        bind: Option<String>,
        /// Disable API key authentication (for development/testing)
        #[arg(long)]
        no_auth: bool,
    },
}

#[derive(Args)]
struct NutritionArgs {
    /// Protein in grams
    #[arg(long)]
    protein: Option<f64>,
    /// Carbs in grams
    #[arg(long)]
    carbs: Option<f64>,
    /// Fat in grams
    #[arg(long)]
    fat: Option<f64>,
    /// Serving size in grams
    #[arg(long)]
    serving: Option<f64>,
    /// Healthiness rating, 1-10
    #[arg(long)]
    rating: Option<i64>,
}

#[derive(Subcommand)]
enum FoodCommands {
    /// Log a single food entry
    Log {
        /// Food name
        name: String,
        /// Calories
        #[arg(short, long)]
        calories: f64,
        /// Meal type: breakfast, lunch, dinner, snack
        #[arg(short, long, default_value = "snack")]
        meal: String,
        #[command(flatten)]
        nutrition: NutritionArgs,
        /// Date (YYYY-MM-DD or today/yesterday/tomorrow, default: today)
        #[arg(long)]
        date: Option<String>,
        /// Optional notes
        #[arg(long)]
        notes: Option<String>,
    },
    /// List food entries for a date
    List {
        /// Date (YYYY-MM-DD or today/yesterday/tomorrow, default: today)
        date: Option<String>,
    },
    /// Update fields of a food entry
    Update {
        /// Entry ID
        id: String,
        /// New food name
        #[arg(long)]
        name: Option<String>,
        /// New calories
        #[arg(short, long)]
        calories: Option<f64>,
        /// New meal type
        #[arg(short, long)]
        meal: Option<String>,
        #[command(flatten)]
        nutrition: NutritionArgs,
        /// New date
        #[arg(long)]
        date: Option<String>,
        /// New notes ("" clears them)
        #[arg(long)]
        notes: Option<String>,
    },
    /// Delete a food entry
    Delete {
        /// Entry ID
        id: String,
    },
}

#[derive(Subcommand)]
enum MealCommands {
    /// Log a meal of several items in one batch
    Log {
        /// Items as "name:calories" (e.g. "Rice:200" "Grilled fish:180")
        #[arg(required = true)]
        items: Vec<String>,
        /// Meal type: breakfast, lunch, dinner, snack
        #[arg(short, long, default_value = "snack")]
        meal: String,
        /// Meal name
        #[arg(long)]
        name: Option<String>,
        /// Date (YYYY-MM-DD or today/yesterday/tomorrow, default: today)
        #[arg(long)]
        date: Option<String>,
    },
    /// Delete a meal and all of its entries
    Delete {
        /// Meal ID
        id: String,
    },
}

#[derive(Subcommand)]
enum ExerciseCommands {
    /// Log an exercise session
    Log {
        /// Exercise name
        name: String,
        /// Duration in minutes
        #[arg(long)]
        minutes: i64,
        /// Calories burned
        #[arg(short, long)]
        calories: f64,
        /// Date (YYYY-MM-DD or today/yesterday/tomorrow, default: today)
        #[arg(long)]
        date: Option<String>,
        /// Optional notes
        #[arg(long)]
        notes: Option<String>,
    },
    /// List exercises for a date
    List {
        /// Date (default: today)
        date: Option<String>,
    },
    /// Delete an exercise
    Delete {
        /// Exercise ID
        id: String,
    },
}

#[derive(Subcommand)]
enum WeightCommands {
    /// Log a weight entry
    Log {
        /// Weight value (number)
        value: f64,
        /// Unit: kg or lbs (default: kg)
        #[arg(short, long, default_value = "kg")]
        unit: String,
        /// Date (YYYY-MM-DD or today/yesterday/tomorrow, default: today)
        #[arg(long)]
        date: Option<String>,
        /// Optional notes
        #[arg(long)]
        notes: Option<String>,
    },
    /// Show the most recent weight entries
    History {
        /// Number of entries to show
        #[arg(short = 'n', long, default_value = "30")]
        limit: usize,
    },
    /// Delete a weight entry by ID
    Delete {
        /// Weight entry ID
        id: String,
    },
}

#[derive(Subcommand)]
enum ProfileCommands {
    /// Show the profile
    Show,
    /// Set one or more profile fields
    Set {
        #[command(flatten)]
        fields: ProfileArgs,
    },
}

#[derive(Subcommand)]
enum StepsCommands {
    /// Show the stored step count for a date
    Show {
        /// Date (default: today)
        date: Option<String>,
    },
    /// Show the fast-cache total for today
    Cache,
    /// Replace a day's step count, even with a lower value
    Override {
        /// New count
        count: i64,
        /// Date (default: today)
        #[arg(long)]
        date: Option<String>,
    },
    /// Run the background step service in the foreground
    Run {
        /// Stop after this many seconds (default: run until Ctrl-C)
        #[arg(long)]
        seconds: Option<u64>,
    },
    /// Check the step service heartbeat
    Health,
}

#[derive(Subcommand)]
enum StreakCommands {
    /// Show the current streak
    Show,
    /// Rebuild the streak from logged activity
    Recompute,
}

#[derive(Subcommand)]
enum CheatDayCommands {
    /// Show the cheat-day schedule
    Status,
    /// Configure the schedule
    Set {
        /// Days between cheat days
        #[arg(long)]
        every: i64,
        /// Preferred weekday: sun-sat or 0-6 (0 = Sunday)
        #[arg(long)]
        day: Option<String>,
        /// Keep the schedule but turn it off
        #[arg(long)]
        disable: bool,
    },
    /// Mark today's cheat day as taken
    Complete,
}

#[derive(Subcommand)]
enum SyncCommands {
    /// Count unsynced rows per record kind
    Pending,
    /// List unsynced rows of one kind
    List {
        /// Record kind (meal, food_entry, exercise, weight, profile, daily_steps, streak, cheat_day)
        kind: String,
    },
    /// Mark rows as synced
    Mark {
        /// Record kind
        kind: String,
        /// Local IDs, optionally remapped as "LOCAL_ID:SERVER_ID"
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// List pending deletions, or acknowledge them
    Tombstones {
        /// Acknowledge these tombstone sequence numbers
        #[arg(long)]
        ack: Vec<i64>,
    },
}

#[derive(Subcommand)]
enum OnboardingCommands {
    /// Save progress of an onboarding session
    Save {
        /// Session ID
        session: String,
        /// Current onboarding step
        #[arg(long, default_value = "0")]
        step: i64,
        #[command(flatten)]
        fields: ProfileArgs,
    },
    /// Show a saved session
    Show {
        /// Session ID
        session: String,
    },
    /// Turn a session into the user's profile and discard it
    Consume {
        /// Session ID
        session: String,
    },
    /// Delete sessions older than the retention window
    Purge,
}

#[derive(Subcommand)]
enum ImportCommands {
    /// Import a food log CSV export
    Csv {
        /// Path to the CSV file
        file: PathBuf,
        /// Preview import without making changes
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

#[allow(clippy::too_many_lines)]
async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let store = Store::open(&config.db_path)
        .with_context(|| format!("Failed to open {}", config.db_path.display()))?;
    let owner = config.resolve_user(cli.user.as_deref())?;
    let json = cli.json;

    match cli.command {
        Commands::Food { command } => match command {
            FoodCommands::Log {
                name,
                calories,
                meal,
                nutrition,
                date,
                notes,
            } => {
                let item = nutrition.into_item(name, calories, notes);
                cmd_food_log(&store, &owner, item, &meal, date, json).await
            }
            FoodCommands::List { date } => cmd_food_list(&store, &owner, date, json).await,
            FoodCommands::Update {
                id,
                name,
                calories,
                meal,
                nutrition,
                date,
                notes,
            } => {
                let update = nutrition.into_update(name, calories, meal, notes);
                cmd_food_update(&store, &owner, &id, update, date, json).await
            }
            FoodCommands::Delete { id } => cmd_food_delete(&store, &owner, &id, json).await,
        },
        Commands::Meal { command } => match command {
            MealCommands::Log {
                items,
                meal,
                name,
                date,
            } => cmd_meal_log(&store, &owner, &items, &meal, name, date, json).await,
            MealCommands::Delete { id } => cmd_meal_delete(&store, &owner, &id, json).await,
        },
        Commands::Exercise { command } => match command {
            ExerciseCommands::Log {
                name,
                minutes,
                calories,
                date,
                notes,
            } => {
                cmd_exercise_log(&store, &owner, name, minutes, calories, date, notes, json).await
            }
            ExerciseCommands::List { date } => {
                cmd_exercise_list(&store, &owner, date, json).await
            }
            ExerciseCommands::Delete { id } => {
                cmd_exercise_delete(&store, &owner, &id, json).await
            }
        },
        Commands::Weight { command } => match command {
            WeightCommands::Log {
                value,
                unit,
                date,
                notes,
            } => cmd_weight_log(&store, &owner, value, &unit, date, notes, json).await,
            WeightCommands::History { limit } => {
                cmd_weight_history(&store, &owner, limit, json).await
            }
            WeightCommands::Delete { id } => cmd_weight_delete(&store, &owner, &id, json).await,
        },
        Commands::Profile { command } => match command {
            ProfileCommands::Show => cmd_profile_show(&store, &owner, json).await,
            ProfileCommands::Set { fields } => {
                cmd_profile_set(&store, &owner, fields, json).await
            }
        },
        Commands::Steps { command } => match command {
            StepsCommands::Show { date } => cmd_steps_show(&store, &owner, date, json).await,
            StepsCommands::Cache => cmd_steps_cache(&store, &config, &owner, json),
            StepsCommands::Override { count, date } => {
                cmd_steps_override(&store, &config, &owner, count, date, json).await
            }
            StepsCommands::Run { seconds } => {
                cmd_steps_run(&store, &config, &owner, seconds, json).await
            }
            StepsCommands::Health => cmd_steps_health(&store, &config, &owner, json).await,
        },
        Commands::Streak { command } => match command {
            StreakCommands::Show => cmd_streak_show(&store, &owner, json).await,
            StreakCommands::Recompute => cmd_streak_recompute(&store, &owner, json).await,
        },
        Commands::CheatDay { command } => match command {
            CheatDayCommands::Status => cmd_cheat_day_status(&store, &owner, json).await,
            CheatDayCommands::Set {
                every,
                day,
                disable,
            } => cmd_cheat_day_set(&store, &owner, every, day.as_deref(), !disable, json).await,
            CheatDayCommands::Complete => cmd_cheat_day_complete(&store, &owner, json).await,
        },
        Commands::Sync { command } => match command {
            SyncCommands::Pending => cmd_sync_pending(&store, &owner, json).await,
            SyncCommands::List { kind } => cmd_sync_list(&store, &owner, &kind, json).await,
            SyncCommands::Mark { kind, ids } => cmd_sync_mark(&store, &kind, &ids, json).await,
            SyncCommands::Tombstones { ack } => {
                cmd_sync_tombstones(&store, &owner, ack, json).await
            }
        },
        Commands::Onboarding { command } => match command {
            OnboardingCommands::Save {
                session,
                step,
                fields,
            } => cmd_onboarding_save(&store, &session, fields, step, json).await,
            OnboardingCommands::Show { session } => {
                cmd_onboarding_show(&store, &session, json).await
            }
            OnboardingCommands::Consume { session } => {
                cmd_onboarding_consume(&store, &owner, &session, json).await
            }
            OnboardingCommands::Purge => {
                cmd_onboarding_purge(&store, &config.settings.retention, json).await
            }
        },
        Commands::Purge { days } => {
            let mut policy = config.settings.retention;
            if let Some(days) = days {
                policy.synced_days = days;
            }
            cmd_purge(&store, &owner, &policy, json).await
        }
        Commands::Import { command } => match command {
            ImportCommands::Csv { file, dry_run } => {
                cmd_import_csv(&store, &owner, &file, dry_run, json).await
            }
        },
        Commands::Serve {
            port,
            bind,
            no_auth,
        } => {
            let api_key = if no_auth {
                None
            } else {
                Some(config.load_or_create_api_key()?.0)
            };
            let port = port.unwrap_or(config.settings.server.port);
            let bind = bind.unwrap_or_else(|| config.settings.server.bind.clone());
            server::start_server(store, port, &bind, api_key).await
        }
    }
}

impl NutritionArgs {
    fn into_item(
        self,
        food_name: String,
        calories: f64,
        notes: Option<String>,
    ) -> kcal_core::models::NewFoodItem {
        kcal_core::models::NewFoodItem {
            food_name,
            calories,
            protein_g: self.protein,
            carbs_g: self.carbs,
            fat_g: self.fat,
            serving_g: self.serving,
            healthiness_rating: self.rating,
            notes,
        }
    }

    fn into_update(
        self,
        food_name: Option<String>,
        calories: Option<f64>,
        meal_type: Option<String>,
        notes: Option<String>,
    ) -> kcal_core::models::UpdateFoodEntry {
        kcal_core::models::UpdateFoodEntry {
            date: None,
            meal_type,
            food_name,
            calories,
            protein_g: self.protein,
            carbs_g: self.carbs,
            fat_g: self.fat,
            serving_g: self.serving,
            healthiness_rating: self.rating,
            notes: notes.map(|n| if n.is_empty() { None } else { Some(n) }),
        }
    }
}
