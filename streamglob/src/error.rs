//! Application-wide error types.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Unsupported source: {reason}")]
    UnsupportedSource { reason: String },

    #[error("Invalid filename template {template:?}: {reason}")]
    InvalidFilenameTemplate { template: String, reason: String },

    #[error("Task {task_id} was already finalized with a different result")]
    TaskAlreadyFinalized { task_id: String },

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Task has no sources")]
    EmptyTask,

    #[error("Unknown {kind} program: {name}")]
    UnknownProgram { kind: String, name: String },

    #[error("Process error: {0}")]
    Process(String),

    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error while {op} {}: {source}", path.display())]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::UnsupportedSource {
            reason: reason.into(),
        }
    }

    pub fn template(template: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidFilenameTemplate {
            template: template.into(),
            reason: reason.into(),
        }
    }

    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether this error was raised while resolving a task, before any
    /// process was spawned.
    pub fn is_resolution_error(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedSource { .. }
                | Self::InvalidFilenameTemplate { .. }
                | Self::EmptyTask
                | Self::UnknownProgram { .. }
        )
    }
}

impl From<process_utils::SpawnError> for Error {
    fn from(err: process_utils::SpawnError) -> Self {
        Self::Process(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_errors() {
        assert!(Error::unsupported("image").is_resolution_error());
        assert!(Error::template("{x", "unbalanced").is_resolution_error());
        assert!(Error::EmptyTask.is_resolution_error());
        assert!(!Error::Process("boom".into()).is_resolution_error());
        assert!(!Error::validation("bad").is_resolution_error());
    }

    #[test]
    fn test_io_path_message() {
        let err = Error::io_path(
            "moving",
            Path::new("/tmp/a"),
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.to_string(), "IO error while moving /tmp/a: gone");
    }
}
