use std::path::Path;

use anyhow::{Context, Result};

use kcal_core::Store;
use kcal_core::import::parse_food_log_csv;
use kcal_core::models::UserId;

use super::helpers::json_error;

pub(crate) async fn cmd_import_csv(
    store: &Store,
    owner: &UserId,
    path: &Path,
    dry_run: bool,
    json: bool,
) -> Result<()> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open file: {}", path.display()))?;

    let rows = parse_food_log_csv(file)?;

    if rows.is_empty() {
        if json {
            println!("{}", json_error("No rows found in CSV file"));
        } else {
            eprintln!("No rows found in CSV file.");
        }
        return Ok(());
    }

    let summary = store.import_food_log(owner, rows, dry_run).await?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "dry_run": summary.dry_run,
                "rows_parsed": summary.rows_parsed,
                "meals_created": summary.meals_created,
                "entries_logged": summary.entries_logged,
                "dates_spanned": summary.dates_spanned,
            })
        );
    } else if dry_run {
        println!("Dry run, no changes made.\n");
        println!("  Rows parsed:     {}", summary.rows_parsed);
        println!("  Meals to create: {}", summary.meals_created);
        println!("  Entries to log:  {}", summary.entries_logged);
        println!("  Dates spanned:   {}", summary.dates_spanned);
    } else {
        println!("Import complete.\n");
        println!("  Rows parsed:    {}", summary.rows_parsed);
        println!("  Meals created:  {}", summary.meals_created);
        println!("  Entries logged: {}", summary.entries_logged);
        println!("  Dates spanned:  {}", summary.dates_spanned);
    }

    Ok(())
}
