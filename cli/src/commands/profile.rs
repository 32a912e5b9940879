use anyhow::{Result, bail};
use clap::Args;

use kcal_core::Store;
use kcal_core::models::{Profile, ProfileUpdate, UserId};

use super::helpers::{json_error, print_json};

/// Profile fields shared by `profile set` and `onboarding save`.
#[derive(Args, Debug, Default)]
pub(crate) struct ProfileArgs {
    #[arg(long)]
    pub(crate) first_name: Option<String>,
    #[arg(long)]
    pub(crate) last_name: Option<String>,
    /// Height in cm
    #[arg(long)]
    pub(crate) height: Option<f64>,
    /// Current weight in kg
    #[arg(long)]
    pub(crate) weight: Option<f64>,
    #[arg(long)]
    pub(crate) age: Option<i64>,
    /// male, female, other
    #[arg(long)]
    pub(crate) gender: Option<String>,
    /// sedentary, light, moderate, active, `very_active`
    #[arg(long)]
    pub(crate) activity: Option<String>,
    /// lose, maintain, gain
    #[arg(long)]
    pub(crate) goal: Option<String>,
    /// Target weight in kg
    #[arg(long)]
    pub(crate) target_weight: Option<f64>,
    /// Starting weight in kg
    #[arg(long)]
    pub(crate) starting_weight: Option<f64>,
    /// Display imperial units
    #[arg(long)]
    pub(crate) imperial: Option<bool>,
}

impl From<ProfileArgs> for ProfileUpdate {
    fn from(a: ProfileArgs) -> Self {
        ProfileUpdate {
            first_name: a.first_name,
            last_name: a.last_name,
            height_cm: a.height,
            weight_kg: a.weight,
            age: a.age,
            gender: a.gender,
            activity_level: a.activity,
            weight_goal: a.goal,
            target_weight_kg: a.target_weight,
            starting_weight_kg: a.starting_weight,
            is_imperial_units: a.imperial,
        }
    }
}

pub(super) fn print_profile(p: &Profile) {
    fn line<T: std::fmt::Display>(label: &str, value: Option<T>) {
        if let Some(v) = value {
            println!("  {label:<16} {v}");
        }
    }

    println!("Profile for {}", p.user_id);
    let name = [p.first_name.as_deref(), p.last_name.as_deref()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");
    line("Name:", (!name.is_empty()).then_some(name));
    line("Height (cm):", p.height_cm);
    line("Weight (kg):", p.weight_kg);
    line("Age:", p.age);
    line("Gender:", p.gender.as_deref());
    line("Activity:", p.activity_level.as_deref());
    line("Goal:", p.weight_goal.as_deref());
    line("Target (kg):", p.target_weight_kg);
    line("Starting (kg):", p.starting_weight_kg);
    println!(
        "  {:<16} {}",
        "Units:",
        if p.is_imperial_units { "imperial" } else { "metric" }
    );
    println!(
        "  {:<16} {}",
        "Onboarded:",
        if p.onboarding_complete { "yes" } else { "no" }
    );
}

pub(crate) async fn cmd_profile_show(store: &Store, owner: &UserId, json: bool) -> Result<()> {
    match store.get_profile(owner).await? {
        Some(p) if json => print_json(&p)?,
        Some(p) => print_profile(&p),
        None if json => println!("{}", json_error(&format!("No profile for {owner}"))),
        None => eprintln!("No profile yet. Use `kcal profile set` or `kcal onboarding`."),
    }
    Ok(())
}

pub(crate) async fn cmd_profile_set(
    store: &Store,
    owner: &UserId,
    fields: ProfileArgs,
    json: bool,
) -> Result<()> {
    let update = ProfileUpdate::from(fields);
    if update == ProfileUpdate::default() {
        bail!("Nothing to set. Pass at least one field, e.g. --height or --goal");
    }
    let profile = store.upsert_profile(owner, update).await?;
    if json {
        print_json(&profile)?;
    } else {
        print_profile(&profile);
    }
    Ok(())
}
