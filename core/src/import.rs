//! Bulk import of food-log CSV exports.

use std::collections::{BTreeMap, HashSet};
use std::io::Read;

use chrono::NaiveDate;

use crate::db::{Database, begin, insert_meal_batch};
use crate::error::{StoreError, StoreResult};
use crate::models::{ImportSummary, NewFoodItem, UserId, validate_food_item};
use crate::streak;

/// One parsed CSV row. Macros missing from the export are `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct FoodLogRow {
    pub date: NaiveDate,
    pub meal_type: &'static str,
    pub food_name: String,
    pub calories: f64,
    pub fat_g: Option<f64>,
    pub protein_g: Option<f64>,
    pub carbs_g: Option<f64>,
}

/// Parse a food-log export.
///
/// Expected header: `Date,Meal,Food Name,Calories` followed by the optional
/// `Fat (g)`, `Protein (g)` and `Carbohydrates (g)` columns, in any order and
/// any case. Rows without a date or food name are skipped.
pub fn parse_food_log_csv<R: Read>(reader: R) -> StoreResult<Vec<FoodLogRow>> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = rdr.headers()?.clone();
    let col = |name: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(name));
    let required = |name: &str| {
        col(name).ok_or_else(|| StoreError::validation(format!("missing required column: {name}")))
    };

    let idx_date = required("Date")?;
    let idx_meal = required("Meal")?;
    let idx_food = required("Food Name")?;
    let idx_cal = required("Calories")?;
    let idx_fat = col("Fat (g)");
    let idx_protein = col("Protein (g)");
    let idx_carbs = col("Carbohydrates (g)");

    let mut rows = Vec::new();
    for (line, result) in rdr.records().enumerate() {
        let record = result?;
        let field = |idx: usize| record.get(idx).unwrap_or("").trim();
        let number = |idx: Option<usize>| {
            idx.map(field)
                .filter(|v| !v.is_empty())
                .and_then(|v| v.parse::<f64>().ok())
        };

        let date = field(idx_date);
        let food_name = field(idx_food);
        if date.is_empty() || food_name.is_empty() {
            continue;
        }
        // +2: header line plus one-based numbering.
        let date = normalize_date(date)
            .ok_or_else(|| StoreError::validation(format!("row {}: cannot parse date {date:?}", line + 2)))?;

        rows.push(FoodLogRow {
            date,
            meal_type: normalize_meal_type(field(idx_meal)),
            food_name: food_name.to_string(),
            calories: number(Some(idx_cal)).unwrap_or(0.0),
            fat_g: number(idx_fat),
            protein_g: number(idx_protein),
            carbs_g: number(idx_carbs),
        });
    }
    Ok(rows)
}

/// Map an exported meal label onto the four meal types; anything
/// unrecognized ("Snacks", "Morning Snack") becomes a snack.
#[must_use]
pub fn normalize_meal_type(meal: &str) -> &'static str {
    match meal.trim().to_lowercase().as_str() {
        "breakfast" => "breakfast",
        "lunch" => "lunch",
        "dinner" => "dinner",
        _ => "snack",
    }
}

/// `YYYY-MM-DD`, then `M/D/YYYY`, then `D/M/YYYY`.
fn normalize_date(raw: &str) -> Option<NaiveDate> {
    ["%Y-%m-%d", "%m/%d/%Y", "%d/%m/%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

impl FoodLogRow {
    fn to_item(&self) -> NewFoodItem {
        NewFoodItem {
            food_name: self.food_name.clone(),
            calories: self.calories,
            protein_g: self.protein_g,
            carbs_g: self.carbs_g,
            fat_g: self.fat_g,
            serving_g: None,
            healthiness_rating: None,
            notes: None,
        }
    }
}

impl Database {
    /// Import parsed rows as one meal per (date, meal type), all in a single
    /// transaction with one streak check. A dry run validates and counts
    /// without writing.
    pub fn import_food_log(
        &mut self,
        owner: &UserId,
        rows: &[FoodLogRow],
        dry_run: bool,
    ) -> StoreResult<ImportSummary> {
        let mut groups: BTreeMap<(NaiveDate, &'static str), Vec<NewFoodItem>> = BTreeMap::new();
        for row in rows {
            let item = row.to_item();
            validate_food_item(&item)?;
            groups.entry((row.date, row.meal_type)).or_default().push(item);
        }
        let dates: HashSet<NaiveDate> = groups.keys().map(|(date, _)| *date).collect();

        let mut summary = ImportSummary {
            rows_parsed: rows.len(),
            meals_created: groups.len(),
            entries_logged: rows.len(),
            dates_spanned: dates.len(),
            dry_run,
            meal_ids: Vec::new(),
        };
        if dry_run || groups.is_empty() {
            return Ok(summary);
        }

        let now = self.clock().now();
        let today = self.clock().today();
        let tx = begin(&mut self.conn)?;
        for ((date, meal_type), items) in groups {
            let logged = insert_meal_batch(&tx, owner, date, meal_type, None, items, now)?;
            summary.meal_ids.push(logged.meal.id);
        }
        streak::apply_check(&tx, owner, today, now)?;
        tx.commit()?;

        tracing::info!(
            event = "food_log_imported",
            user_id = %owner,
            meals = summary.meals_created,
            entries = summary.entries_logged,
            dates = summary.dates_spanned
        );
        Ok(summary)
    }
}
