use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use serde::Serialize;

use kcal_core::models::{NewFoodItem, SyncAck};

pub(crate) fn parse_date(date_str: Option<String>, today: NaiveDate) -> Result<NaiveDate> {
    match date_str {
        None => Ok(today),
        Some(s) => match s.as_str() {
            "today" => Ok(today),
            "yesterday" => Ok(today - chrono::Duration::days(1)),
            "tomorrow" => Ok(today + chrono::Duration::days(1)),
            _ => NaiveDate::parse_from_str(&s, "%Y-%m-%d").with_context(|| {
                format!("Invalid date '{s}'. Use YYYY-MM-DD or today/yesterday/tomorrow")
            }),
        },
    }
}

/// Parse a meal item given as "name:calories". The name may itself contain
/// colons; the calories are taken after the last one.
pub(crate) fn parse_meal_item(s: &str) -> Result<NewFoodItem> {
    let Some((name, calories)) = s.rsplit_once(':') else {
        bail!("Invalid item '{s}'. Use format 'name:calories' (e.g. 'Rice:200')");
    };
    let name = name.trim();
    if name.is_empty() {
        bail!("Item '{s}' has no name");
    }
    let calories: f64 = calories
        .trim()
        .parse()
        .with_context(|| format!("Invalid calories in '{s}'"))?;
    Ok(NewFoodItem {
        food_name: name.to_string(),
        calories,
        protein_g: None,
        carbs_g: None,
        fat_g: None,
        serving_g: None,
        healthiness_rating: None,
        notes: None,
    })
}

/// "LOCAL_ID" or "LOCAL_ID:SERVER_ID".
pub(crate) fn parse_ack(s: &str) -> Result<SyncAck> {
    match s.split_once(':') {
        None if !s.is_empty() => Ok(SyncAck::new(s)),
        Some((local, server)) if !local.is_empty() && !server.is_empty() => {
            Ok(SyncAck::remapped(local, server))
        }
        _ => bail!("Invalid id '{s}'. Use LOCAL_ID or LOCAL_ID:SERVER_ID"),
    }
}

/// Weekday as 0 (Sunday) through 6 (Saturday).
pub(crate) fn parse_weekday(s: &str) -> Result<u32> {
    if let Ok(n) = s.parse::<u32>() {
        if n <= 6 {
            return Ok(n);
        }
        bail!("Day number must be 0 (Sunday) through 6 (Saturday)");
    }
    let day = match s.to_lowercase().as_str() {
        "sun" | "sunday" => 0,
        "mon" | "monday" => 1,
        "tue" | "tuesday" => 2,
        "wed" | "wednesday" => 3,
        "thu" | "thursday" => 4,
        "fri" | "friday" => 5,
        "sat" | "saturday" => 6,
        _ => bail!("Invalid day '{s}'. Use sun-sat or 0-6"),
    };
    Ok(day)
}

pub(crate) const WEEKDAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub(crate) fn json_error(message: &str) -> String {
    #[derive(Serialize)]
    struct CliError<'a> {
        error: &'a str,
    }
    serde_json::to_string(&CliError { error: message })
        .unwrap_or_else(|_| format!("{{\"error\":\"{message}\"}}"))
}

pub(crate) fn no_neg_zero(v: f64) -> f64 {
    if v == 0.0 { 0.0 } else { v }
}

pub(crate) fn opt_num(v: Option<f64>) -> String {
    v.map_or("-".into(), |v| format!("{:.1}", no_neg_zero(v)))
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}

/// First eight characters of a UUID, enough to tell rows apart in a table.
pub(crate) fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 10).unwrap()
    }

    #[test]
    fn test_parse_date_none() {
        assert_eq!(parse_date(None, today()).unwrap(), today());
    }

    #[test]
    fn test_parse_date_keywords() {
        assert_eq!(parse_date(Some("today".to_string()), today()).unwrap(), today());
        assert_eq!(
            parse_date(Some("yesterday".to_string()), today()).unwrap(),
            today() - chrono::Duration::days(1)
        );
        assert_eq!(
            parse_date(Some("tomorrow".to_string()), today()).unwrap(),
            today() + chrono::Duration::days(1)
        );
    }

    #[test]
    fn test_parse_date_iso() {
        let date = parse_date(Some("2024-01-15".to_string()), today()).unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
    }

    #[test]
    fn test_parse_date_invalid() {
        assert!(parse_date(Some("nope".to_string()), today()).is_err());
    }

    #[test]
    fn test_parse_meal_item() {
        let item = parse_meal_item("Rice:200").unwrap();
        assert_eq!(item.food_name, "Rice");
        assert!((item.calories - 200.0).abs() < f64::EPSILON);

        let item = parse_meal_item("Tea: earl grey : 2.5").unwrap();
        assert_eq!(item.food_name, "Tea: earl grey");
        assert!((item.calories - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_meal_item_invalid() {
        assert!(parse_meal_item("Rice").is_err());
        assert!(parse_meal_item(":200").is_err());
        assert!(parse_meal_item("Rice:lots").is_err());
    }

    #[test]
    fn test_parse_ack() {
        assert_eq!(parse_ack("abc").unwrap(), SyncAck::new("abc"));
        assert_eq!(
            parse_ack("abc:srv-9").unwrap(),
            SyncAck::remapped("abc", "srv-9")
        );
        assert!(parse_ack("").is_err());
        assert!(parse_ack("abc:").is_err());
        assert!(parse_ack(":srv").is_err());
    }

    #[test]
    fn test_parse_weekday() {
        assert_eq!(parse_weekday("sun").unwrap(), 0);
        assert_eq!(parse_weekday("Friday").unwrap(), 5);
        assert_eq!(parse_weekday("6").unwrap(), 6);
        assert!(parse_weekday("7").is_err());
        assert!(parse_weekday("someday").is_err());
    }

    #[test]
    fn test_json_error() {
        assert_eq!(json_error("boom \"x\""), r#"{"error":"boom \"x\""}"#);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello world this is long", 10), "hello w...");
    }

    #[test]
    fn test_truncate_utf8() {
        assert_eq!(truncate("Crème fraîche", 10), "Crème f...");
        assert_eq!(truncate("日清カップヌードル", 8), "日清カップ...");
    }

    #[test]
    fn test_no_neg_zero() {
        assert_eq!(no_neg_zero(-0.0).to_bits(), 0.0_f64.to_bits());
        assert_eq!(no_neg_zero(-3.0), -3.0);
        assert_eq!(opt_num(None), "-");
        assert_eq!(opt_num(Some(-0.0)), "0.0");
    }
}
