//! # Error Types
//!
//! Unified error taxonomy for the migration engine. Every error is explicit
//! and carries enough context to act on; transient store conditions are the
//! only errors the executor is allowed to retry.

use std::fmt;
use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

/// Result type for migration operations
pub type ShiftResult<T> = Result<T, MigrationError>;

/// Migration error types
#[derive(Debug)]
pub enum MigrationError {
    /// A file could not be read
    FileRead { path: PathBuf, source: io::Error },

    /// A file could not be written
    FileWrite { path: PathBuf, source: io::Error },

    /// A migration file failed parsing
    Parse { path: PathBuf, message: String },

    /// A migration source file violates the naming/structure contract
    MalformedMigration { path: PathBuf, reason: String },

    /// Recorded checksum does not match the on-disk scripts
    ChecksumMismatch {
        version: u64,
        expected: String,
        actual: String,
    },

    /// The version is already recorded in the ledger
    AlreadyApplied { version: u64 },

    /// No migration with this version exists
    MigrationNotFound { version: u64 },

    /// The stored down-script is empty, the version cannot be reversed
    NoRollbackScript { version: u64 },

    /// Another orchestrated run is active; requests never queue
    Busy { since: DateTime<Utc> },

    /// Checkpoint resume found the store at an unexpected version
    StateMismatch { expected: u64, actual: u64 },

    /// Plan or migration validation failed
    Validation {
        errors: Vec<String>,
        warnings: Vec<String>,
    },

    /// Retryable busy/lock condition reported by the store
    TransientStore { message: String },

    /// Non-retryable SQL syntax error
    Syntax { statement: String, message: String },

    /// A step exceeded its deadline; the in-flight script is not interrupted
    Timeout { version: u64, after_ms: u64 },

    /// Rollback did not complete; `steps_executed` reflects how far it got
    RollbackFailed {
        target: u64,
        steps_executed: usize,
        message: String,
    },

    /// Error reported by the store collaborator
    Store { message: String },

    /// Generic internal error
    Internal { message: String },
}

impl MigrationError {
    /// Whether the executor may retry the failed operation with backoff.
    ///
    /// Only busy/lock conditions qualify; syntax and constraint errors never do.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStore { .. })
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }
}

impl fmt::Display for MigrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FileRead { path, source } => {
                write!(f, "Failed to read {:?}: {}", path, source)
            }
            Self::FileWrite { path, source } => {
                write!(f, "Failed to write {:?}: {}", path, source)
            }
            Self::Parse { path, message } => {
                write!(f, "Failed to parse migration {:?}: {}", path, message)
            }
            Self::MalformedMigration { path, reason } => {
                write!(f, "Malformed migration {:?}: {}", path, reason)
            }
            Self::ChecksumMismatch {
                version,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Checksum mismatch for migration {}: expected {}, got {}. \
                     Migration scripts may have been manually modified.",
                    version, expected, actual
                )
            }
            Self::AlreadyApplied { version } => {
                write!(f, "Migration {} is already applied", version)
            }
            Self::MigrationNotFound { version } => {
                write!(f, "Migration version {} not found", version)
            }
            Self::NoRollbackScript { version } => {
                write!(
                    f,
                    "Migration {} has no stored down-script and cannot be reversed",
                    version
                )
            }
            Self::Busy { since } => {
                write!(
                    f,
                    "Another migration run has been active since {}; requests are never queued",
                    since
                )
            }
            Self::StateMismatch { expected, actual } => {
                write!(
                    f,
                    "Checkpoint expects store at version {} but found {}",
                    expected, actual
                )
            }
            Self::Validation { errors, warnings } => {
                write!(
                    f,
                    "Validation failed with {} error(s), {} warning(s): {}",
                    errors.len(),
                    warnings.len(),
                    errors.join("; ")
                )
            }
            Self::TransientStore { message } => {
                write!(f, "Transient store error (retryable): {}", message)
            }
            Self::Syntax { statement, message } => {
                write!(f, "Syntax error in '{}': {}", statement, message)
            }
            Self::Timeout { version, after_ms } => {
                write!(f, "Migration {} timed out after {}ms", version, after_ms)
            }
            Self::RollbackFailed {
                target,
                steps_executed,
                message,
            } => {
                write!(
                    f,
                    "Rollback to version {} failed after {} step(s): {}",
                    target, steps_executed, message
                )
            }
            Self::Store { message } => write!(f, "Store error: {}", message),
            Self::Internal { message } => write!(f, "Internal error: {}", message),
        }
    }
}

impl std::error::Error for MigrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::FileRead { source, .. } | Self::FileWrite { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for MigrationError {
    fn from(err: io::Error) -> Self {
        Self::Internal {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for MigrationError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Parse {
            path: PathBuf::new(),
            message: err.to_string(),
        }
    }
}
