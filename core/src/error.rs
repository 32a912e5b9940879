//! Error types for the kcal core.
//!
//! `SchemaError` is fatal and only surfaces while opening a store.
//! `StoreError` is what every record operation returns; callers can tell
//! "doesn't exist" (`NotFound`) from "not yours" (`Unauthorized`) and ask
//! whether a failure is worth retrying with [`StoreError::is_transient`].

use std::path::PathBuf;

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::models::EntityKind;

/// Failures while opening the database or bringing its schema up to date.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("failed to open database at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to configure connection: {0}")]
    Pragma(#[source] rusqlite::Error),

    #[error("failed to create table {table}: {source}")]
    CreateTable {
        table: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to inspect columns of {table}: {source}")]
    Inspect {
        table: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to add column {table}.{column}: {source}")]
    AddColumn {
        table: &'static str,
        column: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("schema transaction failed: {0}")]
    Transaction(#[source] rusqlite::Error),
}

/// Errors returned by record store, sync queue and derived-state operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("{kind} {id} does not belong to user {owner}")]
    Unauthorized {
        kind: EntityKind,
        id: String,
        owner: String,
    },

    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: String },

    /// Onboarding sessions are not syncable records, so they have no
    /// [`EntityKind`].
    #[error("onboarding session {session_id} not found")]
    OnboardingNotFound { session_id: String },

    /// Busy or locked database; the same call may succeed later.
    #[error("transient storage failure: {0}")]
    TransientIo(#[source] rusqlite::Error),

    #[error("database error: {0}")]
    Database(#[source] rusqlite::Error),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage task failed: {0}")]
    Join(String),
}

impl StoreError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientIo(_) | Self::Join(_))
    }

    pub(crate) fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => Self::TransientIo(err),
            _ => Self::Database(err),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A step source disagreed with the running total and the max-merge rule
/// had to pick a winner. Logged, never returned as an error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{source_name} reported {reported} steps against a running total of {running_total}")]
pub struct ReconciliationConflict {
    pub source_name: &'static str,
    pub reported: i64,
    pub running_total: i64,
}

/// Sensor-side failures. Absorbed by the step service, which retries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepSourceError {
    #[error("step source {0} is not available")]
    Unavailable(&'static str),

    #[error("step source {0} closed its stream")]
    Closed(&'static str),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepServiceError {
    #[error("step service is not running")]
    Stopped,

    #[error("step service task failed: {0}")]
    Task(String),
}
