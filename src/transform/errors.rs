//! # Transformation Errors
//!
//! Only conditions that abort a transformation outright live here. Per-row
//! and per-batch failures are accounted in `TransformationResult`, and
//! integrity findings in `IntegrityOutcome`, so callers can see partial
//! progress instead of a bare error.

use thiserror::Error;

use crate::errors::MigrationError;

/// Transformation errors
#[derive(Debug, Clone, Error)]
pub enum TransformError {
    #[error("Rule '{rule_id}' targets unknown table: {table}")]
    UnknownTable { rule_id: String, table: String },

    #[error("Store error: {0}")]
    Store(String),
}

impl From<TransformError> for MigrationError {
    fn from(err: TransformError) -> Self {
        match err {
            TransformError::Store(message) => MigrationError::Store { message },
            other => MigrationError::Internal {
                message: other.to_string(),
            },
        }
    }
}

impl From<MigrationError> for TransformError {
    fn from(err: MigrationError) -> Self {
        TransformError::Store(err.to_string())
    }
}
