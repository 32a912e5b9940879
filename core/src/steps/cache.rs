//! Fast step cache shared with the foreground UI.
//!
//! The cache is advisory: it may be stale, from an older day, or missing.
//! Reads for another date return `None` and write failures are only logged.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::models::UserId;

pub trait StepCache: Send + Sync {
    fn read(&self, owner: &UserId, date: NaiveDate) -> Option<i64>;
    fn write(&self, owner: &UserId, date: NaiveDate, total: i64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct CachedTotal {
    date: NaiveDate,
    total: i64,
}

#[derive(Debug, Default)]
pub struct MemoryStepCache {
    entries: Mutex<HashMap<String, CachedTotal>>,
}

impl MemoryStepCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StepCache for MemoryStepCache {
    fn read(&self, owner: &UserId, date: NaiveDate) -> Option<i64> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(owner.as_str())
            .filter(|cached| cached.date == date)
            .map(|cached| cached.total)
    }

    fn write(&self, owner: &UserId, date: NaiveDate, total: i64) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(owner.to_string(), CachedTotal { date, total });
    }
}

/// JSON file cache, one entry per user. Writes go through a temp file and a
/// rename so a killed process never leaves a half-written file behind.
#[derive(Debug)]
pub struct FileStepCache {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStepCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> HashMap<String, CachedTotal> {
        match fs::read_to_string(&self.path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|err| {
                tracing::warn!(
                    event = "step_cache_unreadable",
                    path = %self.path.display(),
                    error = %err
                );
                HashMap::new()
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => {
                tracing::warn!(
                    event = "step_cache_unreadable",
                    path = %self.path.display(),
                    error = %err
                );
                HashMap::new()
            }
        }
    }

    fn store(&self, entries: &HashMap<String, CachedTotal>) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)
    }
}

impl StepCache for FileStepCache {
    fn read(&self, owner: &UserId, date: NaiveDate) -> Option<i64> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.load()
            .get(owner.as_str())
            .filter(|cached| cached.date == date)
            .map(|cached| cached.total)
    }

    fn write(&self, owner: &UserId, date: NaiveDate, total: i64) {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries = self.load();
        entries.insert(owner.to_string(), CachedTotal { date, total });
        if let Err(err) = self.store(&entries) {
            tracing::warn!(
                event = "step_cache_write_failed",
                path = %self.path.display(),
                error = %err
            );
        }
    }
}
