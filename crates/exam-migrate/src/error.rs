//! Error types for the migration engine.

use std::path::PathBuf;
use thiserror::Error;

/// Process exit codes, mapped from [`MigrateError::exit_code`].
pub const EXIT_CONFIG_ERROR: u8 = 1;
pub const EXIT_CONNECTION_ERROR: u8 = 2;
pub const EXIT_LOAD_FAILED: u8 = 3;
pub const EXIT_RECONCILE_FAILED: u8 = 4;
pub const EXIT_CANCELLED: u8 = 5;
pub const EXIT_IO_ERROR: u8 = 7;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A store could not be reached. Fatal for the running stage.
    #[error("Connection error: {message}\n  Context: {context}")]
    Connection { message: String, context: String },

    /// A source page could not be fetched after all retries.
    #[error("Page fetch failed for table {table} at offset {offset}: {message}")]
    PageFetch {
        table: String,
        offset: u64,
        message: String,
    },

    /// A single record failed required-field validation.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The target rejected a write because of a named constraint.
    #[error("Constraint {constraint} violated: {message}")]
    ConstraintViolation { constraint: String, message: String },

    /// A referenced parent identifier is absent from the identifier map.
    #[error("No mapping for {table} id {source_id}")]
    MappingMiss { table: String, source_id: String },

    /// A table load was aborted.
    #[error("Load failed for table {table}: {message}")]
    Load { table: String, message: String },

    /// Reconciliation found FAIL or ERROR checks.
    #[error("Reconciliation failed: {0}")]
    ReconciliationMismatch(String),

    /// Target database query error
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// Intermediate artifact missing or malformed
    #[error("Artifact error at {path}: {message}")]
    Artifact { path: PathBuf, message: String },

    /// State file error
    #[error("State file error: {0}")]
    State(String),

    /// Config hash mismatch on resume
    #[error("Config has changed since last run - cannot resume. Use `run` to start fresh.")]
    ConfigChanged,

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Connection error with context about where it occurred
    pub fn connection(message: impl std::fmt::Display, context: impl Into<String>) -> Self {
        MigrateError::Connection {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Load error
    pub fn load(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Load {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create an Artifact error
    pub fn artifact(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        MigrateError::Artifact {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Name of the violated constraint, if this error carries one.
    ///
    /// Database errors are inspected too so callers can classify raw
    /// driver failures without converting them first.
    pub fn constraint(&self) -> Option<&str> {
        match self {
            MigrateError::ConstraintViolation { constraint, .. } => Some(constraint),
            MigrateError::Database(e) => e.as_db_error().and_then(|db| db.constraint()),
            _ => None,
        }
    }

    /// Whether the error ends the whole run rather than a single record.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MigrateError::Connection { .. }
                | MigrateError::PageFetch { .. }
                | MigrateError::Config(_)
                | MigrateError::Cancelled
        )
    }

    /// Map this error to a process exit code.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_)
            | MigrateError::Yaml(_)
            | MigrateError::ConfigChanged
            | MigrateError::State(_) => EXIT_CONFIG_ERROR,
            MigrateError::Connection { .. } | MigrateError::PageFetch { .. } => {
                EXIT_CONNECTION_ERROR
            }
            MigrateError::ReconciliationMismatch(_) => EXIT_RECONCILE_FAILED,
            MigrateError::Cancelled => EXIT_CANCELLED,
            MigrateError::Io(_) => EXIT_IO_ERROR,
            _ => EXIT_LOAD_FAILED,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_name_exposed() {
        let err = MigrateError::ConstraintViolation {
            constraint: "users_username_key".into(),
            message: "duplicate key".into(),
        };
        assert_eq!(err.constraint(), Some("users_username_key"));
        assert!(MigrateError::Validation("x".into()).constraint().is_none());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(MigrateError::Config("bad".into()).exit_code(), EXIT_CONFIG_ERROR);
        assert_eq!(
            MigrateError::connection("refused", "source").exit_code(),
            EXIT_CONNECTION_ERROR
        );
        assert_eq!(
            MigrateError::ReconciliationMismatch("1 FAIL".into()).exit_code(),
            EXIT_RECONCILE_FAILED
        );
        assert_eq!(MigrateError::load("users", "boom").exit_code(), EXIT_LOAD_FAILED);
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert_eq!(MigrateError::from(io).exit_code(), EXIT_IO_ERROR);
    }

    #[test]
    fn test_fatal_classification() {
        let page = MigrateError::PageFetch {
            table: "questions".into(),
            offset: 1500,
            message: "timeout".into(),
        };
        assert!(page.is_fatal());
        assert!(page.to_string().contains("questions"));
        assert!(page.to_string().contains("1500"));
        assert!(!MigrateError::Validation("missing user".into()).is_fatal());
    }
}
