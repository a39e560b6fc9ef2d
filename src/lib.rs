//! schemashift - A strict, checksummed schema-migration and
//! data-transformation orchestrator for embedded relational stores
//!
//! The orchestrator plans, validates, applies, and reverses versioned schema
//! changes against a single-writer store, with snapshot rollback points and
//! typed row-level data migration.

pub mod checksum;
pub mod errors;
pub mod events;
pub mod ledger;
pub mod orchestrator;
pub mod progress;
pub mod rollback;
pub mod store;
pub mod transform;
pub mod validator;

pub use errors::{MigrationError, ShiftResult};
pub use events::{EventBus, EventSink, MigrationEvent};
pub use ledger::{Migration, MigrationRecord, MigrationVersion, VersionLedger};
pub use orchestrator::plan::{MigrationPlan, RiskLevel};
pub use orchestrator::{
    ExecuteOptions, ExecutionReport, MigrationCheckpoint, MigrationOrchestrator, RunStatus,
};
pub use progress::{ProgressSnapshot, ProgressTracker};
pub use rollback::{RollbackManager, RollbackPoint, RollbackRehearsal, RollbackReport};
pub use transform::{DataTransformer, TransformOptions, TransformationRule};
pub use validator::{MigrationValidator, ValidationResult};
