//! Table definitions and the additive migration pass.
//!
//! [`ensure_schema`] runs on every open. It creates any missing table, then
//! compares each table's live columns against the definitions below and
//! `ALTER`s in whatever is missing. Columns are never dropped or retyped, so
//! a database written by any earlier build opens cleanly.

use chrono::Utc;
use rusqlite::{Connection, params};

use crate::error::SchemaError;

/// A column that may be added to an existing table after the fact. `decl`
/// must be valid in `ALTER TABLE ... ADD COLUMN`: nullable or with a
/// constant default.
#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub decl: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct TableDef {
    pub name: &'static str,
    /// Columns present since the table first existed.
    pub base: &'static str,
    pub columns: &'static [Column],
    /// Trailing table constraints (`UNIQUE (...)`).
    pub constraints: &'static str,
    /// Whether rows carry the sync envelope.
    pub syncable: bool,
}

const fn col(name: &'static str, decl: &'static str) -> Column {
    Column { name, decl }
}

pub const ENVELOPE: &[Column] = &[
    col("synced", "INTEGER NOT NULL DEFAULT 0"),
    col(
        "sync_action",
        "TEXT CHECK (sync_action IN ('create', 'update'))",
    ),
    col("last_modified", "TEXT"),
];

pub const TABLES: &[TableDef] = &[
    TableDef {
        name: "meals",
        base: "id TEXT PRIMARY KEY,
               user_id TEXT NOT NULL,
               date TEXT NOT NULL,
               meal_type TEXT NOT NULL,
               created_at TEXT NOT NULL",
        columns: &[col("name", "TEXT")],
        constraints: "",
        syncable: true,
    },
    TableDef {
        name: "food_entries",
        base: "id TEXT PRIMARY KEY,
               user_id TEXT NOT NULL,
               date TEXT NOT NULL,
               meal_type TEXT NOT NULL,
               food_name TEXT NOT NULL,
               calories REAL NOT NULL,
               created_at TEXT NOT NULL",
        columns: &[
            col("meal_id", "TEXT REFERENCES meals(id)"),
            col("protein_g", "REAL"),
            col("carbs_g", "REAL"),
            col("fat_g", "REAL"),
            col("serving_g", "REAL"),
            col(
                "healthiness_rating",
                "INTEGER CHECK (healthiness_rating BETWEEN 1 AND 10)",
            ),
            col("notes", "TEXT"),
        ],
        constraints: "",
        syncable: true,
    },
    TableDef {
        name: "exercises",
        base: "id TEXT PRIMARY KEY,
               user_id TEXT NOT NULL,
               date TEXT NOT NULL,
               exercise_name TEXT NOT NULL,
               duration_minutes INTEGER NOT NULL,
               calories_burned REAL NOT NULL,
               created_at TEXT NOT NULL",
        columns: &[col("notes", "TEXT")],
        constraints: "",
        syncable: true,
    },
    TableDef {
        name: "weights",
        base: "id TEXT PRIMARY KEY,
               user_id TEXT NOT NULL,
               date TEXT NOT NULL,
               weight_kg REAL NOT NULL,
               created_at TEXT NOT NULL",
        columns: &[col("notes", "TEXT")],
        constraints: "",
        syncable: true,
    },
    TableDef {
        name: "profiles",
        base: "user_id TEXT PRIMARY KEY",
        columns: &[
            col("first_name", "TEXT"),
            col("last_name", "TEXT"),
            col("height_cm", "REAL"),
            col("weight_kg", "REAL"),
            col("age", "INTEGER"),
            col("gender", "TEXT"),
            col("activity_level", "TEXT"),
            col("weight_goal", "TEXT"),
            col("target_weight_kg", "REAL"),
            col("starting_weight_kg", "REAL"),
            col("is_imperial_units", "INTEGER NOT NULL DEFAULT 0"),
            col("onboarding_complete", "INTEGER NOT NULL DEFAULT 0"),
        ],
        constraints: "",
        syncable: true,
    },
    TableDef {
        name: "daily_steps",
        base: "id TEXT PRIMARY KEY,
               user_id TEXT NOT NULL,
               date TEXT NOT NULL,
               count INTEGER NOT NULL DEFAULT 0",
        columns: &[],
        constraints: "UNIQUE (user_id, date)",
        syncable: true,
    },
    TableDef {
        name: "streaks",
        base: "user_id TEXT PRIMARY KEY",
        columns: &[
            col("current_streak", "INTEGER NOT NULL DEFAULT 0"),
            col("longest_streak", "INTEGER NOT NULL DEFAULT 0"),
            col("last_activity_date", "TEXT"),
        ],
        constraints: "",
        syncable: true,
    },
    TableDef {
        name: "cheat_day_settings",
        base: "user_id TEXT PRIMARY KEY,
               frequency_days INTEGER NOT NULL DEFAULT 7 CHECK (frequency_days >= 1)",
        columns: &[
            col(
                "preferred_day_of_week",
                "INTEGER CHECK (preferred_day_of_week BETWEEN 0 AND 6)",
            ),
            col("last_cheat_day", "TEXT"),
            col("next_cheat_day", "TEXT"),
            col("enabled", "INTEGER NOT NULL DEFAULT 1"),
        ],
        constraints: "",
        syncable: true,
    },
    TableDef {
        name: "onboarding_sessions",
        base: "session_id TEXT PRIMARY KEY,
               profile_json TEXT NOT NULL,
               step_index INTEGER NOT NULL DEFAULT 0,
               created_at TEXT NOT NULL,
               updated_at TEXT NOT NULL",
        columns: &[],
        constraints: "",
        syncable: false,
    },
    TableDef {
        name: "step_sync_state",
        base: "user_id TEXT PRIMARY KEY",
        columns: &[
            col("last_sync_date", "TEXT"),
            col("last_heartbeat_at", "TEXT"),
        ],
        constraints: "",
        syncable: false,
    },
    TableDef {
        name: "sync_tombstones",
        base: "seq INTEGER PRIMARY KEY AUTOINCREMENT,
               kind TEXT NOT NULL,
               id TEXT NOT NULL,
               user_id TEXT NOT NULL,
               deleted_at TEXT NOT NULL",
        columns: &[],
        constraints: "",
        syncable: false,
    },
];

/// Indexes are created after the column pass since some cover added columns.
const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_meals_user_date ON meals(user_id, date)",
    "CREATE INDEX IF NOT EXISTS idx_food_entries_user_date ON food_entries(user_id, date)",
    "CREATE INDEX IF NOT EXISTS idx_food_entries_meal ON food_entries(meal_id)",
    "CREATE INDEX IF NOT EXISTS idx_exercises_user_date ON exercises(user_id, date)",
    "CREATE INDEX IF NOT EXISTS idx_weights_user_date ON weights(user_id, date)",
    "CREATE INDEX IF NOT EXISTS idx_tombstones_user ON sync_tombstones(user_id)",
];

impl TableDef {
    fn create_sql(&self) -> String {
        let mut sql = format!("CREATE TABLE IF NOT EXISTS {} ({}", self.name, self.base);
        for column in self.all_columns() {
            sql.push_str(&format!(", {} {}", column.name, column.decl));
        }
        if !self.constraints.is_empty() {
            sql.push_str(", ");
            sql.push_str(self.constraints);
        }
        sql.push(')');
        sql
    }

    fn all_columns(&self) -> impl Iterator<Item = &'static Column> {
        let envelope: &'static [Column] = if self.syncable { ENVELOPE } else { &[] };
        self.columns.iter().chain(envelope.iter())
    }
}

/// Names of the columns `table` currently has.
pub fn table_columns(conn: &Connection, table: &'static str) -> Result<Vec<String>, SchemaError> {
    let inspect = |source| SchemaError::Inspect { table, source };
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .map_err(inspect)?;
    stmt.query_map([], |row| row.get::<_, String>(1))
        .map_err(inspect)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(inspect)
}

/// Create every table and add any missing columns. Idempotent; the whole
/// pass commits or rolls back as one transaction.
pub fn ensure_schema(conn: &mut Connection) -> Result<(), SchemaError> {
    let tx = conn.transaction().map_err(SchemaError::Transaction)?;
    let mut added = 0usize;

    for table in TABLES {
        tx.execute_batch(&table.create_sql())
            .map_err(|source| SchemaError::CreateTable {
                table: table.name,
                source,
            })?;

        let existing = table_columns(&tx, table.name)?;
        for column in table.all_columns() {
            if existing.iter().any(|c| c.eq_ignore_ascii_case(column.name)) {
                continue;
            }
            tx.execute_batch(&format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                table.name, column.name, column.decl
            ))
            .map_err(|source| SchemaError::AddColumn {
                table: table.name,
                column: column.name,
                source,
            })?;
            tracing::info!(
                event = "schema_column_added",
                table = table.name,
                column = column.name
            );
            added += 1;
        }

        if table.syncable {
            // Rows from before the envelope existed get a timestamp so reads
            // never see a NULL last_modified.
            tx.execute(
                &format!(
                    "UPDATE {} SET last_modified = ?1 WHERE last_modified IS NULL",
                    table.name
                ),
                params![Utc::now()],
            )
            .map_err(|source| SchemaError::AddColumn {
                table: table.name,
                column: "last_modified",
                source,
            })?;
        }
    }

    for index in INDEXES {
        tx.execute_batch(index).map_err(SchemaError::Transaction)?;
    }

    tx.commit().map_err(SchemaError::Transaction)?;
    if added > 0 {
        tracing::info!(event = "schema_migrated", columns_added = added);
    }
    Ok(())
}
