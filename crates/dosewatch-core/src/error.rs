//! Core error types for dosewatch-core.
//!
//! Domain failures (validation, missing records, short supply) are kept
//! distinct from infrastructure failures so callers can react to each:
//! prompt for a refill, show a form error, or give up and log.

use std::path::PathBuf;

use rust_decimal::Decimal;
use thiserror::Error;

/// Core error type for dosewatch-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Input was missing or out of range
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The referenced record does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Not enough medication left for one full dose
    #[error("Insufficient supply for routine {routine_id}: {remaining} left, {required} required")]
    InsufficientSupply {
        routine_id: String,
        remaining: Decimal,
        required: Decimal,
    },

    /// The routine kept changing underneath a conditional update
    #[error("Routine {routine_id} was modified concurrently; retry the operation")]
    Conflict { routine_id: String },

    /// Account-related errors
    #[error("Account error: {0}")]
    Account(#[from] AccountError),

    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic errors with context
    #[error("{0}")]
    Custom(String),
}

impl CoreError {
    pub fn routine_not_found(id: impl Into<String>) -> Self {
        CoreError::NotFound {
            kind: "Routine",
            id: id.into(),
        }
    }

    pub fn user_not_found(id: impl Into<String>) -> Self {
        CoreError::NotFound {
            kind: "User",
            id: id.into(),
        }
    }
}

/// Database-specific errors.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Failed to open database connection
    #[error("Failed to open database at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Migration failed
    #[error("Database migration failed: {0}")]
    MigrationFailed(String),

    /// A stored row could not be decoded into a domain value
    #[error("Corrupt value in column '{column}': {message}")]
    CorruptRow { column: String, message: String },

    /// Database is locked
    #[error("Database is locked")]
    Locked,
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// Failed to save configuration
    #[error("Failed to save configuration to {path}: {message}")]
    SaveFailed { path: PathBuf, message: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Unknown configuration key
    #[error("Unknown configuration key: {0}")]
    UnknownKey(String),

    /// Data directory could not be resolved or created
    #[error("Data directory unavailable: {0}")]
    DataDir(String),
}

/// Validation errors.
#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    /// Required field missing or blank
    #[error("Missing required field '{0}'")]
    MissingField(&'static str),

    /// Invalid value
    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    /// Total supply smaller than a single dose
    #[error("total_quantity ({total}) must be at least dose_quantity ({dose})")]
    QuantityOrder { total: Decimal, dose: Decimal },

    /// Attachment with an extension outside the image allowlist
    #[error("Unsupported file type '{0}': expected png, jpg, jpeg or gif")]
    UnsupportedFileType(String),

    /// Attachment larger than the configured limit
    #[error("File is {size} bytes, limit is {limit} bytes")]
    FileTooLarge { size: usize, limit: usize },
}

impl ValidationError {
    pub fn invalid(field: &str, message: impl Into<String>) -> Self {
        ValidationError::InvalidValue {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Account errors.
#[derive(Error, Debug, PartialEq)]
pub enum AccountError {
    /// Email already registered
    #[error("Email already registered: {0}")]
    EmailTaken(String),

    /// Unknown email or wrong password
    #[error("Invalid email or password")]
    InvalidCredentials,

    /// Stored password hash could not be parsed
    #[error("Malformed password hash")]
    MalformedHash,
}

// Helper implementations for converting from other error types

impl From<rusqlite::Error> for DatabaseError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _msg)
                if e.code == rusqlite::ErrorCode::DatabaseLocked
                    || e.code == rusqlite::ErrorCode::DatabaseBusy =>
            {
                DatabaseError::Locked
            }
            rusqlite::Error::FromSqlConversionFailure(idx, _ty, source) => DatabaseError::CorruptRow {
                column: idx.to_string(),
                message: source.to_string(),
            },
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Database(DatabaseError::from(err))
    }
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;
