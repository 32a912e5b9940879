use anyhow::Result;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use kcal_core::Store;
use kcal_core::models::{NewExercise, UserId};

use super::helpers::{no_neg_zero, parse_date, print_json, short_id, truncate};

#[allow(clippy::too_many_arguments)]
pub(crate) async fn cmd_exercise_log(
    store: &Store,
    owner: &UserId,
    name: String,
    minutes: i64,
    calories: f64,
    date: Option<String>,
    notes: Option<String>,
    json: bool,
) -> Result<()> {
    let date = parse_date(date, store.today())?;
    let exercise = store
        .insert_exercise(
            owner,
            NewExercise {
                date,
                exercise_name: name,
                duration_minutes: minutes,
                calories_burned: calories,
                notes,
            },
        )
        .await?;

    if json {
        print_json(&exercise)?;
    } else {
        println!(
            "Logged {} for {} min ({:.0} kcal burned) on {} [{}]",
            exercise.exercise_name,
            exercise.duration_minutes,
            exercise.calories_burned,
            exercise.date.format("%Y-%m-%d"),
            exercise.id
        );
    }
    Ok(())
}

pub(crate) async fn cmd_exercise_list(
    store: &Store,
    owner: &UserId,
    date: Option<String>,
    json: bool,
) -> Result<()> {
    let date = parse_date(date, store.today())?;
    let exercises = store.exercises_for_date(owner, date).await?;

    if json {
        print_json(&exercises)?;
    } else if exercises.is_empty() {
        eprintln!("No exercise logged for {}.", date.format("%Y-%m-%d"));
    } else {
        #[derive(Tabled)]
        struct ExerciseRow {
            #[tabled(rename = "ID")]
            id: String,
            #[tabled(rename = "Exercise")]
            name: String,
            #[tabled(rename = "Minutes")]
            minutes: i64,
            #[tabled(rename = "Burned")]
            burned: String,
            #[tabled(rename = "Notes")]
            notes: String,
        }

        let rows: Vec<ExerciseRow> = exercises
            .iter()
            .map(|e| ExerciseRow {
                id: short_id(&e.id),
                name: truncate(&e.exercise_name, 30),
                minutes: e.duration_minutes,
                burned: format!("{:.0}", no_neg_zero(e.calories_burned)),
                notes: e.notes.clone().unwrap_or_default(),
            })
            .collect();

        let table = Table::new(&rows)
            .with(Style::rounded())
            .with(Modify::new(Columns::new(2..4)).with(Alignment::right()))
            .to_string();
        println!("{table}");
    }
    Ok(())
}

pub(crate) async fn cmd_exercise_delete(
    store: &Store,
    owner: &UserId,
    id: &str,
    json: bool,
) -> Result<()> {
    store.delete_exercise_by_owner(owner, id).await?;
    if json {
        println!("{}", serde_json::json!({ "deleted": id }));
    } else {
        println!("Deleted exercise {id}");
    }
    Ok(())
}
