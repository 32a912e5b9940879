use anyhow::{Result, bail};
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use kcal_core::Store;
use kcal_core::models::{FoodEntry, NewFoodEntry, NewFoodItem, NewMeal, UpdateFoodEntry, UserId};

use super::helpers::{no_neg_zero, opt_num, parse_date, parse_meal_item, print_json, short_id, truncate};

pub(crate) async fn cmd_food_log(
    store: &Store,
    owner: &UserId,
    item: NewFoodItem,
    meal: &str,
    date: Option<String>,
    json: bool,
) -> Result<()> {
    let date = parse_date(date, store.today())?;
    let entry = store
        .insert_food_entry(
            owner,
            NewFoodEntry {
                date,
                meal_type: meal.to_string(),
                item,
            },
        )
        .await?;

    if json {
        print_json(&entry)?;
    } else {
        println!(
            "Logged {} ({:.0} kcal) to {} on {} [{}]",
            entry.food_name,
            entry.calories,
            entry.meal_type,
            entry.date.format("%Y-%m-%d"),
            entry.id
        );
    }
    Ok(())
}

pub(crate) async fn cmd_food_list(
    store: &Store,
    owner: &UserId,
    date: Option<String>,
    json: bool,
) -> Result<()> {
    let date = parse_date(date, store.today())?;
    let entries = store.food_entries_for_date(owner, date).await?;

    if json {
        print_json(&entries)?;
    } else if entries.is_empty() {
        eprintln!(
            "No food logged for {}. Use `kcal food log` or `kcal meal log` to add some.",
            date.format("%Y-%m-%d")
        );
    } else {
        print_entry_table(&entries);
        let total: f64 = entries.iter().map(|e| e.calories).sum();
        println!("Total: {:.0} kcal", no_neg_zero(total));
    }
    Ok(())
}

fn print_entry_table(entries: &[FoodEntry]) {
    #[derive(Tabled)]
    struct EntryRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Meal")]
        meal: String,
        #[tabled(rename = "Food")]
        food: String,
        #[tabled(rename = "Cal")]
        calories: String,
        #[tabled(rename = "P")]
        protein: String,
        #[tabled(rename = "C")]
        carbs: String,
        #[tabled(rename = "F")]
        fat: String,
        #[tabled(rename = "Synced")]
        synced: &'static str,
    }

    let rows: Vec<EntryRow> = entries
        .iter()
        .map(|e| EntryRow {
            id: short_id(&e.id),
            meal: e.meal_type.clone(),
            food: truncate(&e.food_name, 30),
            calories: format!("{:.0}", no_neg_zero(e.calories)),
            protein: opt_num(e.protein_g),
            carbs: opt_num(e.carbs_g),
            fat: opt_num(e.fat_g),
            synced: if e.envelope.synced { "yes" } else { "no" },
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(3..7)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}

pub(crate) async fn cmd_food_update(
    store: &Store,
    owner: &UserId,
    id: &str,
    mut update: UpdateFoodEntry,
    date: Option<String>,
    json: bool,
) -> Result<()> {
    if let Some(d) = date {
        update.date = Some(parse_date(Some(d), store.today())?);
    }
    if update.is_empty() {
        bail!("Nothing to update. Pass at least one field, e.g. --calories or --meal");
    }
    let entry = store.update_food_entry_by_owner(owner, id, update).await?;

    if json {
        print_json(&entry)?;
    } else {
        println!(
            "Updated {}: {} ({:.0} kcal), {} on {}",
            entry.id,
            entry.food_name,
            entry.calories,
            entry.meal_type,
            entry.date.format("%Y-%m-%d")
        );
    }
    Ok(())
}

pub(crate) async fn cmd_food_delete(
    store: &Store,
    owner: &UserId,
    id: &str,
    json: bool,
) -> Result<()> {
    store.delete_food_entry_by_owner(owner, id).await?;
    if json {
        println!("{}", serde_json::json!({ "deleted": id }));
    } else {
        println!("Deleted food entry {id}");
    }
    Ok(())
}

pub(crate) async fn cmd_meal_log(
    store: &Store,
    owner: &UserId,
    items: &[String],
    meal: &str,
    name: Option<String>,
    date: Option<String>,
    json: bool,
) -> Result<()> {
    let date = parse_date(date, store.today())?;
    let items = items
        .iter()
        .map(|s| parse_meal_item(s))
        .collect::<Result<Vec<_>>>()?;
    let logged = store
        .log_meal(
            owner,
            NewMeal {
                date,
                meal_type: meal.to_string(),
                name,
                items,
            },
        )
        .await?;

    if json {
        print_json(&logged)?;
    } else {
        println!(
            "Logged {} with {} item(s), {:.0} kcal, on {} [{}]",
            logged.meal.name.as_deref().unwrap_or(&logged.meal.meal_type),
            logged.entries.len(),
            no_neg_zero(logged.total_calories()),
            logged.meal.date.format("%Y-%m-%d"),
            logged.meal.id
        );
        print_entry_table(&logged.entries);
    }
    Ok(())
}

pub(crate) async fn cmd_meal_delete(
    store: &Store,
    owner: &UserId,
    id: &str,
    json: bool,
) -> Result<()> {
    store.delete_meal_by_owner(owner, id).await?;
    if json {
        println!("{}", serde_json::json!({ "deleted": id }));
    } else {
        println!("Deleted meal {id} and its entries");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> UserId {
        UserId::new("alice").unwrap()
    }

    #[tokio::test]
    async fn test_meal_log_writes_one_batch() {
        let store = Store::open_in_memory().unwrap();
        let items = vec!["Rice:200".to_string(), "Fish:180".to_string()];
        cmd_meal_log(&store, &alice(), &items, "lunch", None, None, true)
            .await
            .unwrap();

        let meals = store.meals_for_date(&alice(), store.today()).await.unwrap();
        assert_eq!(meals.len(), 1);
        assert_eq!(meals[0].entries.len(), 2);
        assert!((meals[0].total_calories() - 380.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_bad_item_logs_nothing() {
        let store = Store::open_in_memory().unwrap();
        let items = vec!["Rice:200".to_string(), "Fish".to_string()];
        assert!(
            cmd_meal_log(&store, &alice(), &items, "lunch", None, None, true)
                .await
                .is_err()
        );
        assert!(
            store
                .meals_for_date(&alice(), store.today())
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_empty_update_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let err = cmd_food_update(
            &store,
            &alice(),
            "whatever",
            UpdateFoodEntry::default(),
            None,
            true,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("Nothing to update"));
    }
}
