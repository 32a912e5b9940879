use anyhow::{Result, bail};
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use kcal_core::Store;
use kcal_core::models::{NewWeightEntry, UserId};

use super::helpers::{no_neg_zero, parse_date, print_json, short_id};

const LBS_PER_KG: f64 = 2.20462;
const KG_PER_LB: f64 = 0.453_592;

fn to_kg(value: f64, unit: &str) -> Result<f64> {
    if value <= 0.0 {
        bail!("Weight must be greater than 0");
    }
    match unit.to_lowercase().as_str() {
        "kg" => Ok(value),
        "lbs" | "lb" => Ok(no_neg_zero(value * KG_PER_LB)),
        _ => bail!("Invalid unit '{unit}'. Use 'kg' or 'lbs'"),
    }
}

pub(crate) async fn cmd_weight_log(
    store: &Store,
    owner: &UserId,
    value: f64,
    unit: &str,
    date: Option<String>,
    notes: Option<String>,
    json: bool,
) -> Result<()> {
    let weight_kg = to_kg(value, unit)?;
    if unit.eq_ignore_ascii_case("lbs") || unit.eq_ignore_ascii_case("lb") {
        eprintln!("Converting {value:.1} lbs → {weight_kg:.2} kg");
    }

    let date = parse_date(date, store.today())?;
    let result = store
        .insert_weight(
            owner,
            NewWeightEntry {
                date,
                weight_kg,
                notes,
            },
        )
        .await?;

    if json {
        print_json(&result)?;
    } else {
        let lbs = result.weight_kg * LBS_PER_KG;
        println!(
            "Logged {:.1} kg ({:.1} lbs) for {}",
            result.weight_kg,
            lbs,
            result.date.format("%Y-%m-%d")
        );
        if let Some(ref n) = result.notes {
            println!("  Notes: {n}");
        }
    }

    Ok(())
}

pub(crate) async fn cmd_weight_history(
    store: &Store,
    owner: &UserId,
    limit: usize,
    json: bool,
) -> Result<()> {
    let entries = store.weight_history(owner, limit).await?;

    if json {
        print_json(&entries)?;
    } else if entries.is_empty() {
        eprintln!("No weight entries found. Use `kcal weight log` to record your weight.");
    } else {
        #[derive(Tabled)]
        struct WeightRow {
            #[tabled(rename = "ID")]
            id: String,
            #[tabled(rename = "Date")]
            date: String,
            #[tabled(rename = "Weight (kg)")]
            kg: String,
            #[tabled(rename = "Weight (lbs)")]
            lbs: String,
            #[tabled(rename = "Notes")]
            notes: String,
        }

        let rows: Vec<WeightRow> = entries
            .iter()
            .map(|e| WeightRow {
                id: short_id(&e.id),
                date: e.date.format("%Y-%m-%d").to_string(),
                kg: format!("{:.1}", e.weight_kg),
                lbs: format!("{:.1}", e.weight_kg * LBS_PER_KG),
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

pub(crate) async fn cmd_weight_delete(
    store: &Store,
    owner: &UserId,
    id: &str,
    json: bool,
) -> Result<()> {
    store.delete_weight_by_owner(owner, id).await?;

    if json {
        println!("{}", serde_json::json!({ "deleted": id }));
    } else {
        println!("Deleted weight entry {id}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_kg() {
        assert!((to_kg(80.0, "kg").unwrap() - 80.0).abs() < f64::EPSILON);
        assert!((to_kg(100.0, "LBS").unwrap() - 45.3592).abs() < 1e-9);
        assert!(to_kg(0.0, "kg").is_err());
        assert!(to_kg(80.0, "stone").is_err());
    }

    #[tokio::test]
    async fn test_weight_log_and_history() {
        let store = Store::open_in_memory().unwrap();
        let alice = UserId::new("alice").unwrap();
        cmd_weight_log(&store, &alice, 176.0, "lbs", None, None, true)
            .await
            .unwrap();
        let history = store.weight_history(&alice, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!((history[0].weight_kg - 176.0 * KG_PER_LB).abs() < 1e-9);
        assert!(!history[0].envelope.synced);
    }
}
