//! # Store Collaborators
//!
//! Interfaces to the subsystems the migration engine depends on but does not
//! own: the embedded relational store itself, the reader/writer connection
//! pool, and the snapshot/restore backup engine. The engine only ever needs a
//! writer handle for migrations and a reader handle for read-only validation
//! queries.
//!
//! [`memory::MemoryStore`] provides a test-grade implementation of all three
//! seams for unit tests and throwaway rollback rehearsals.

pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::ShiftResult;

/// A structured row: ordered field-name/value mapping.
pub type Row = BTreeMap<String, serde_json::Value>;

/// Hidden row-identity column injected by [`StoreHandle::select_rows`] and
/// required by [`StoreHandle::update_rows`] to address rows in place.
pub const ROWID_COLUMN: &str = "_rowid_";

/// Role requested from the connection pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Reader,
    Writer,
}

/// One column of a table, as reported by the store's metadata catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    pub primary_key: bool,
}

/// One index, as reported by the store's metadata catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

/// One foreign-key constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyInfo {
    pub table: String,
    pub columns: Vec<String>,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
}

/// A referential-integrity violation found by [`StoreHandle::fk_violations`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FkViolation {
    pub table: String,
    pub column: String,
    pub value: serde_json::Value,
    pub referenced_table: String,
}

/// Handle to the embedded store.
///
/// `execute_batch` is transactional: either every statement in the batch
/// takes effect or none do. Typed row access exists for the data transformer,
/// which must rewrite rows without going through SQL text.
pub trait StoreHandle: Send + Sync {
    /// Execute a script (one or more `;`-separated statements) atomically.
    fn execute_batch(&self, sql: &str) -> ShiftResult<()>;

    /// All user table names, sorted.
    fn list_tables(&self) -> ShiftResult<Vec<String>>;

    /// Column metadata for a table.
    fn table_columns(&self, table: &str) -> ShiftResult<Vec<ColumnInfo>>;

    /// Index metadata for a table.
    fn table_indexes(&self, table: &str) -> ShiftResult<Vec<IndexInfo>>;

    /// Foreign keys declared on a table.
    fn foreign_keys(&self, table: &str) -> ShiftResult<Vec<ForeignKeyInfo>>;

    /// Number of rows in a table.
    fn row_count(&self, table: &str) -> ShiftResult<u64>;

    /// Page of rows from a table, each carrying [`ROWID_COLUMN`].
    fn select_rows(&self, table: &str, offset: usize, limit: usize) -> ShiftResult<Vec<Row>>;

    /// Insert rows atomically. Any [`ROWID_COLUMN`] entries are ignored and
    /// fresh row ids assigned.
    fn insert_rows(&self, table: &str, rows: &[Row]) -> ShiftResult<()>;

    /// Update rows in place atomically, addressed by their [`ROWID_COLUMN`].
    fn update_rows(&self, table: &str, rows: &[Row]) -> ShiftResult<()>;

    /// Scan every declared foreign key for violations.
    fn fk_violations(&self) -> ShiftResult<Vec<FkViolation>>;

    /// Approximate on-disk size of the store.
    fn size_bytes(&self) -> ShiftResult<u64>;

    /// Deterministic checksum over the store's schema and data.
    fn content_checksum(&self) -> ShiftResult<String>;

    /// Independent throwaway copy of the store, for rollback rehearsals.
    /// Mutations to the copy never touch the live store.
    fn scratch_copy(&self) -> ShiftResult<Arc<dyn StoreHandle>>;
}

/// Reader/writer connection pool.
///
/// The writer handle is exclusive for the duration of a migration run; the
/// pool, not the engine, enforces that.
pub trait ConnectionPool: Send + Sync {
    fn acquire(&self, role: Role) -> ShiftResult<Arc<dyn StoreHandle>>;
    fn release(&self, handle: Arc<dyn StoreHandle>);
}

/// Snapshot/restore backup collaborator.
///
/// Both operations are synchronous from the engine's point of view. Snapshot
/// creation must not overlap an in-progress write; the engine only calls it
/// between steps while holding the writer handle.
pub trait BackupEngine: Send + Sync {
    /// Create a snapshot and return its location.
    fn snapshot(&self, label: &str) -> ShiftResult<String>;

    /// Restore the store from a snapshot location.
    fn restore(&self, path: &str) -> ShiftResult<()>;

    /// Delete a snapshot. Missing snapshots are not an error.
    fn delete(&self, path: &str) -> ShiftResult<()>;

    /// Whether a snapshot still exists at the location.
    fn exists(&self, path: &str) -> bool;
}

/// Trivial pool handing out the same embedded store handle for both roles.
///
/// Matches the single-writer model: there is exactly one store file and the
/// engine runs with exclusive access.
pub struct SingleStorePool {
    handle: Arc<dyn StoreHandle>,
}

impl SingleStorePool {
    pub fn new(handle: Arc<dyn StoreHandle>) -> Self {
        Self { handle }
    }
}

impl ConnectionPool for SingleStorePool {
    fn acquire(&self, _role: Role) -> ShiftResult<Arc<dyn StoreHandle>> {
        Ok(self.handle.clone())
    }

    fn release(&self, _handle: Arc<dyn StoreHandle>) {}
}
