mod config;
pub mod database;
pub mod migrations;

pub use config::{
    AccountsConfig, AttachmentsConfig, Config, LoggingConfig, RemindersConfig, ScheduleConfig,
};
pub use database::Database;

use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::error::{ConfigError, DatabaseError};
use crate::routine::{DoseEvent, Routine};

/// Returns the data directory, creating it if needed.
///
/// `DOSEWATCH_HOME` wins when set. Otherwise `~/.config/dosewatch[-dev]/`
/// based on `DOSEWATCH_ENV` (set it to `dev` for a development directory).
///
/// # Errors
/// Returns an error if creating the directory fails.
pub fn data_dir() -> Result<PathBuf, ConfigError> {
    let dir = match std::env::var_os("DOSEWATCH_HOME") {
        Some(home) if !home.is_empty() => PathBuf::from(home),
        _ => {
            let base_dir = dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".config");
            let env = std::env::var("DOSEWATCH_ENV").unwrap_or_else(|_| "production".to_string());
            if env == "dev" {
                base_dir.join("dosewatch-dev")
            } else {
                base_dir.join("dosewatch")
            }
        }
    };

    std::fs::create_dir_all(&dir)
        .map_err(|e| ConfigError::DataDir(format!("{}: {e}", dir.display())))?;
    Ok(dir)
}

/// Persistence for routines and the dose ledger.
///
/// Every write that modifies an existing routine is conditional on the
/// routine's `revision`: the write only lands if the stored revision still
/// equals the one in the snapshot passed in, and it bumps the stored
/// revision by one. A `false` return means the snapshot was stale and
/// nothing was written.
pub trait RoutineStore: Send + Sync {
    fn insert_routine(&self, routine: &Routine) -> Result<(), DatabaseError>;

    fn get_routine(&self, id: &str) -> Result<Option<Routine>, DatabaseError>;

    /// All routines of one owner, ordered by next dose time.
    fn list_routines(&self, owner_id: &str) -> Result<Vec<Routine>, DatabaseError>;

    /// Unnotified routines due at or before `due_before`.
    fn list_reminder_candidates(
        &self,
        due_before: DateTime<Utc>,
    ) -> Result<Vec<Routine>, DatabaseError>;

    /// Overwrite the stored routine with `routine`.
    fn replace_routine(&self, routine: &Routine) -> Result<bool, DatabaseError>;

    /// Overwrite the stored routine and append `event` to the ledger, in
    /// one transaction.
    fn record_dose(&self, routine: &Routine, event: &DoseEvent) -> Result<bool, DatabaseError>;

    /// Set `notified` on a routine that has not moved since it was read.
    fn mark_notified(
        &self,
        id: &str,
        expected_revision: u64,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Remove a routine. Its ledger entries are kept.
    fn delete_routine(&self, id: &str) -> Result<bool, DatabaseError>;

    /// Ledger entries for a routine, oldest first.
    fn list_doses(&self, routine_id: &str) -> Result<Vec<DoseEvent>, DatabaseError>;
}
