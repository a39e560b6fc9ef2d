//! # Version Ledger
//!
//! Persistent record of which schema versions have been applied to the store.
//!
//! # Design Principles
//!
//! 1. **Checksummed**: CRC32 over `up + "\n" + down` detects edits to
//!    migration files after they were applied
//! 2. **Self-contained rollback**: the down-script is captured at apply time,
//!    so rollback never depends on the source file still existing
//! 3. **Atomic**: apply and rollback mutate the store and the ledger as one
//!    unit under the ledger's write lock; the sidecar file is written
//!    temp-then-rename
//! 4. **Tracked**: one record per applied version, deleted on rollback
//!
//! # Migration File Format
//!
//! Migrations are YAML files named `NNN_description.yaml`:
//!
//! ```yaml
//! version: 1
//! description: create users
//! checksum: crc32:ABC12345
//! up: |
//!   CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL);
//! down: |
//!   DROP TABLE users;
//! ```

pub mod generator;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checksum::migration_checksum;
use crate::errors::{MigrationError, ShiftResult};
use crate::store::{ConnectionPool, Role};

/// Migration version number
pub type MigrationVersion = u64;

/// Sidecar file the ledger persists itself into, next to the store.
const LEDGER_FILE: &str = "_ledger.json";

/// An immutable unit of schema change, discovered from a migration source
/// directory. Never mutated after discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Migration {
    /// Monotonically increasing version (sequential, starts at 1)
    pub version: MigrationVersion,

    /// Human-readable description (falls back to the filename)
    #[serde(default)]
    pub description: String,

    /// Forward script
    pub up: String,

    /// Reverse script; may be empty, which makes the version irreversible
    #[serde(default)]
    pub down: String,

    /// Checksum over up+down; computed at discovery when absent
    #[serde(default)]
    pub checksum: String,

    /// Source file on disk
    #[serde(skip)]
    pub file_path: Option<PathBuf>,
}

impl Migration {
    /// Structural validation of a discovered migration.
    pub fn validate(&self) -> ShiftResult<()> {
        let path = self.file_path.clone().unwrap_or_default();
        if self.version == 0 {
            return Err(MigrationError::MalformedMigration {
                path,
                reason: "version must be >= 1".to_string(),
            });
        }
        if self.up.trim().is_empty() {
            return Err(MigrationError::MalformedMigration {
                path,
                reason: "'up' script must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Whether this migration can be reversed by script.
    pub fn is_reversible(&self) -> bool {
        !self.down.trim().is_empty()
    }
}

/// The persisted fact that a migration was applied.
///
/// Field set mirrors the documented ledger-table columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub version: MigrationVersion,
    pub description: String,
    pub applied_at: DateTime<Utc>,
    /// Down-script captured at apply time
    pub rollback_sql: String,
    pub checksum: String,
    pub duration_ms: u64,
    pub applied_by: String,
}

/// Outcome of a single apply or rollback.
#[derive(Debug, Clone)]
pub struct AppliedMigration {
    pub version: MigrationVersion,
    pub description: String,
    pub duration_ms: u64,
}

/// Result of [`VersionLedger::validate_integrity`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub valid: bool,
    pub issues: Vec<String>,
}

/// The version ledger: single source of truth for applied schema versions.
pub struct VersionLedger {
    migrations_dir: PathBuf,
    ledger_file: PathBuf,
    records: RwLock<BTreeMap<MigrationVersion, MigrationRecord>>,
    pool: Arc<dyn ConnectionPool>,
}

impl VersionLedger {
    /// Open (or initialize) the ledger.
    ///
    /// # Arguments
    /// * `migrations_dir` - Directory containing numbered migration files
    /// * `data_dir` - Directory where the ledger sidecar is stored
    /// * `pool` - Connection pool for the store being migrated
    pub fn new(
        migrations_dir: PathBuf,
        data_dir: PathBuf,
        pool: Arc<dyn ConnectionPool>,
    ) -> ShiftResult<Self> {
        let ledger = Self {
            migrations_dir,
            ledger_file: data_dir.join(LEDGER_FILE),
            records: RwLock::new(BTreeMap::new()),
            pool,
        };
        ledger.load()?;
        Ok(ledger)
    }

    fn load(&self) -> ShiftResult<()> {
        if !self.ledger_file.exists() {
            return Ok(());
        }
        let content =
            fs::read_to_string(&self.ledger_file).map_err(|e| MigrationError::FileRead {
                path: self.ledger_file.clone(),
                source: e,
            })?;
        let records: BTreeMap<MigrationVersion, MigrationRecord> = serde_json::from_str(&content)
            .map_err(|e| MigrationError::Parse {
            path: self.ledger_file.clone(),
            message: format!("ledger sidecar is corrupt: {}", e),
        })?;
        *self.records.write().unwrap() = records;
        Ok(())
    }

    /// Atomic write: temp file, then rename over the live sidecar.
    fn save_records(
        &self,
        records: &BTreeMap<MigrationVersion, MigrationRecord>,
    ) -> ShiftResult<()> {
        let content = serde_json::to_string_pretty(records)
            .map_err(|e| MigrationError::internal(format!("failed to serialize ledger: {}", e)))?;
        let temp_file = self.ledger_file.with_extension("json.tmp");
        fs::write(&temp_file, &content).map_err(|e| MigrationError::FileWrite {
            path: temp_file.clone(),
            source: e,
        })?;
        fs::rename(&temp_file, &self.ledger_file).map_err(|e| MigrationError::FileWrite {
            path: self.ledger_file.clone(),
            source: e,
        })?;
        Ok(())
    }

    /// Highest applied version; 0 if none.
    pub fn current_version(&self) -> MigrationVersion {
        let records = self.records.read().unwrap();
        records.keys().max().copied().unwrap_or(0)
    }

    /// Whether a specific version is recorded as applied.
    pub fn is_applied(&self, version: MigrationVersion) -> bool {
        self.records.read().unwrap().contains_key(&version)
    }

    /// All records, ascending by version.
    pub fn records(&self) -> Vec<MigrationRecord> {
        self.records.read().unwrap().values().cloned().collect()
    }

    /// The record for one version, if applied.
    pub fn record(&self, version: MigrationVersion) -> Option<MigrationRecord> {
        self.records.read().unwrap().get(&version).cloned()
    }

    /// Discover all migrations from the source directory, sorted ascending.
    ///
    /// Fails with `MalformedMigration` on duplicate versions or files that
    /// violate the structure contract.
    pub fn discover(&self) -> ShiftResult<Vec<Migration>> {
        if !self.migrations_dir.exists() {
            return Err(MigrationError::MalformedMigration {
                path: self.migrations_dir.clone(),
                reason: "migration directory does not exist".to_string(),
            });
        }

        let mut by_version: BTreeMap<MigrationVersion, Migration> = BTreeMap::new();

        for entry in
            fs::read_dir(&self.migrations_dir).map_err(|e| MigrationError::FileRead {
                path: self.migrations_dir.clone(),
                source: e,
            })?
        {
            let entry = entry.map_err(|e| MigrationError::FileRead {
                path: self.migrations_dir.clone(),
                source: e,
            })?;
            let path = entry.path();
            let is_yaml = path
                .extension()
                .map(|e| e == "yaml" || e == "yml")
                .unwrap_or(false);
            if !is_yaml {
                continue;
            }

            let migration = load_migration(&path)?;
            if by_version.contains_key(&migration.version) {
                return Err(MigrationError::MalformedMigration {
                    path,
                    reason: format!("duplicate version {}", migration.version),
                });
            }
            by_version.insert(migration.version, migration);
        }

        Ok(by_version.into_values().collect())
    }

    /// Migrations with a version above the current one, sorted ascending.
    pub fn pending(&self) -> ShiftResult<Vec<Migration>> {
        let current = self.current_version();
        Ok(self
            .discover()?
            .into_iter()
            .filter(|m| m.version > current)
            .collect())
    }

    /// Apply one migration: execute the up-script and insert the ledger
    /// record as one atomic unit.
    ///
    /// The already-applied check happens inside the same critical section to
    /// avoid racing a concurrent apply.
    pub fn apply(&self, migration: &Migration) -> ShiftResult<AppliedMigration> {
        migration.validate()?;
        let start = Instant::now();

        let mut records = self.records.write().unwrap();
        let current = records.keys().max().copied().unwrap_or(0);
        if migration.version <= current || records.contains_key(&migration.version) {
            return Err(MigrationError::AlreadyApplied {
                version: migration.version,
            });
        }

        let writer = self.pool.acquire(Role::Writer)?;
        let executed = writer.execute_batch(&migration.up);
        self.pool.release(writer);
        executed?;

        let duration_ms = start.elapsed().as_millis() as u64;
        records.insert(
            migration.version,
            MigrationRecord {
                version: migration.version,
                description: migration.description.clone(),
                applied_at: Utc::now(),
                rollback_sql: migration.down.clone(),
                checksum: migration.checksum.clone(),
                duration_ms,
                applied_by: whoami::username(),
            },
        );
        self.save_records(&records)?;

        Ok(AppliedMigration {
            version: migration.version,
            description: migration.description.clone(),
            duration_ms,
        })
    }

    /// Reverse one applied migration: execute the stored down-script and
    /// delete the record as one atomic unit.
    pub fn rollback(&self, version: MigrationVersion) -> ShiftResult<AppliedMigration> {
        let start = Instant::now();

        let mut records = self.records.write().unwrap();
        let record = records
            .get(&version)
            .ok_or(MigrationError::MigrationNotFound { version })?
            .clone();
        if record.rollback_sql.trim().is_empty() {
            return Err(MigrationError::NoRollbackScript { version });
        }

        let writer = self.pool.acquire(Role::Writer)?;
        let executed = writer.execute_batch(&record.rollback_sql);
        self.pool.release(writer);
        executed?;

        records.remove(&version);
        self.save_records(&records)?;

        Ok(AppliedMigration {
            version,
            description: record.description,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Delete a record without executing anything. Used by the rollback
    /// manager after a snapshot restore has already reversed the store.
    pub(crate) fn forget(&self, version: MigrationVersion) -> ShiftResult<()> {
        let mut records = self.records.write().unwrap();
        records.remove(&version);
        self.save_records(&records)
    }

    /// Cross-check the ledger against the on-disk migration source.
    ///
    /// Reports checksum mismatches for applied versions whose files changed,
    /// and records with no matching on-disk file as orphaned. Version gaps in
    /// the applied set are flagged as issues but do not invalidate the ledger.
    pub fn validate_integrity(&self) -> ShiftResult<IntegrityReport> {
        let mut issues = Vec::new();
        let mut mismatch = false;

        let discovered: BTreeMap<MigrationVersion, Migration> = match self.discover() {
            Ok(migrations) => migrations.into_iter().map(|m| (m.version, m)).collect(),
            Err(e) => {
                issues.push(format!("migration source unreadable: {}", e));
                BTreeMap::new()
            }
        };

        let records = self.records.read().unwrap();
        for record in records.values() {
            match discovered.get(&record.version) {
                Some(migration) => {
                    let actual = migration_checksum(&migration.up, &migration.down);
                    if actual != record.checksum {
                        mismatch = true;
                        issues.push(format!(
                            "version {}: checksum mismatch (recorded {}, on disk {})",
                            record.version, record.checksum, actual
                        ));
                    }
                }
                None => {
                    issues.push(format!(
                        "version {}: orphaned record, no matching on-disk migration",
                        record.version
                    ));
                }
            }
        }

        let versions: Vec<MigrationVersion> = records.keys().copied().collect();
        for pair in versions.windows(2) {
            if pair[1] != pair[0] + 1 {
                issues.push(format!(
                    "gap in applied versions between {} and {}",
                    pair[0], pair[1]
                ));
            }
        }

        Ok(IntegrityReport {
            valid: !mismatch,
            issues,
        })
    }
}

/// Load and validate a single migration file.
fn load_migration(path: &Path) -> ShiftResult<Migration> {
    let content = fs::read_to_string(path).map_err(|e| MigrationError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut migration: Migration =
        serde_yaml::from_str(&content).map_err(|e| MigrationError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    migration.file_path = Some(path.to_path_buf());

    // Derive description from filename: 001_create_users.yaml -> create_users
    if migration.description.is_empty() {
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
        migration.description = match stem.find('_') {
            Some(idx) => stem[idx + 1..].to_string(),
            None => stem.to_string(),
        };
    }

    let computed = migration_checksum(&migration.up, &migration.down);
    if migration.checksum.is_empty() {
        migration.checksum = computed;
    } else if migration.checksum != computed {
        return Err(MigrationError::ChecksumMismatch {
            version: migration.version,
            expected: migration.checksum,
            actual: computed,
        });
    }

    migration.validate()?;
    Ok(migration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::{SingleStorePool, StoreHandle};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn write_migration(dir: &Path, version: u64, name: &str, up: &str, down: &str) {
        let migration = Migration {
            version,
            description: name.to_string(),
            up: up.to_string(),
            down: down.to_string(),
            checksum: String::new(),
            file_path: None,
        };
        let content = serde_yaml::to_string(&migration).unwrap();
        let filename = format!("{:03}_{}.yaml", version, name);
        fs::write(dir.join(filename), content).unwrap();
    }

    fn test_ledger(temp: &TempDir) -> (VersionLedger, Arc<MemoryStore>) {
        let migrations_dir = temp.path().join("migrations");
        let data_dir = temp.path().join("data");
        fs::create_dir_all(&migrations_dir).unwrap();
        fs::create_dir_all(&data_dir).unwrap();

        let store = Arc::new(MemoryStore::new());
        let pool = Arc::new(SingleStorePool::new(store.clone()));
        let ledger = VersionLedger::new(migrations_dir, data_dir, pool).unwrap();
        (ledger, store)
    }

    #[test]
    fn test_discover_sorted_no_duplicates() {
        let temp = TempDir::new().unwrap();
        let (ledger, _) = test_ledger(&temp);
        let dir = temp.path().join("migrations");

        write_migration(&dir, 2, "posts", "CREATE TABLE posts (id INTEGER)", "DROP TABLE posts");
        write_migration(&dir, 1, "users", "CREATE TABLE users (id INTEGER)", "DROP TABLE users");

        let migrations = ledger.discover().unwrap();
        assert_eq!(migrations.len(), 2);
        assert_eq!(migrations[0].version, 1);
        assert_eq!(migrations[1].version, 2);
    }

    #[test]
    fn test_discover_duplicate_version_is_malformed() {
        let temp = TempDir::new().unwrap();
        let (ledger, _) = test_ledger(&temp);
        let dir = temp.path().join("migrations");

        write_migration(&dir, 1, "users", "CREATE TABLE users (id INTEGER)", "");
        write_migration(&dir, 1, "users_again", "CREATE TABLE u2 (id INTEGER)", "");

        let result = ledger.discover();
        assert!(matches!(
            result,
            Err(MigrationError::MalformedMigration { .. })
        ));
    }

    #[test]
    fn test_discover_rejects_empty_up() {
        let temp = TempDir::new().unwrap();
        let (ledger, _) = test_ledger(&temp);
        let dir = temp.path().join("migrations");

        write_migration(&dir, 1, "empty", "   ", "");

        let result = ledger.discover();
        assert!(matches!(
            result,
            Err(MigrationError::MalformedMigration { .. })
        ));
    }

    #[test]
    fn test_discover_rejects_tampered_checksum() {
        let temp = TempDir::new().unwrap();
        let (ledger, _) = test_ledger(&temp);
        let dir = temp.path().join("migrations");

        let migration = Migration {
            version: 1,
            description: "users".to_string(),
            up: "CREATE TABLE users (id INTEGER)".to_string(),
            down: String::new(),
            checksum: "crc32:DEADBEEF".to_string(),
            file_path: None,
        };
        let content = serde_yaml::to_string(&migration).unwrap();
        fs::write(dir.join("001_users.yaml"), content).unwrap();

        let result = ledger.discover();
        assert!(matches!(
            result,
            Err(MigrationError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_apply_and_current_version() {
        let temp = TempDir::new().unwrap();
        let (ledger, store) = test_ledger(&temp);
        let dir = temp.path().join("migrations");
        write_migration(&dir, 1, "users", "CREATE TABLE users (id INTEGER)", "DROP TABLE users");

        let migrations = ledger.discover().unwrap();
        let outcome = ledger.apply(&migrations[0]).unwrap();

        assert_eq!(outcome.version, 1);
        assert_eq!(ledger.current_version(), 1);
        assert_eq!(store.list_tables().unwrap(), vec!["users".to_string()]);
    }

    #[test]
    fn test_apply_already_applied_leaves_ledger_unchanged() {
        let temp = TempDir::new().unwrap();
        let (ledger, _) = test_ledger(&temp);
        let dir = temp.path().join("migrations");
        write_migration(&dir, 1, "users", "CREATE TABLE users (id INTEGER)", "DROP TABLE users");

        let migrations = ledger.discover().unwrap();
        ledger.apply(&migrations[0]).unwrap();
        let before = ledger.records();

        let result = ledger.apply(&migrations[0]);
        assert!(matches!(
            result,
            Err(MigrationError::AlreadyApplied { version: 1 })
        ));
        assert_eq!(ledger.records().len(), before.len());
    }

    #[test]
    fn test_failed_apply_records_nothing() {
        let temp = TempDir::new().unwrap();
        let (ledger, _) = test_ledger(&temp);

        let migration = Migration {
            version: 1,
            description: "broken".to_string(),
            up: "CREAT TABLE oops (id INTEGER)".to_string(),
            down: String::new(),
            checksum: String::new(),
            file_path: None,
        };
        assert!(ledger.apply(&migration).is_err());
        assert_eq!(ledger.current_version(), 0);
        assert!(ledger.records().is_empty());
    }

    #[test]
    fn test_rollback_round_trip() {
        let temp = TempDir::new().unwrap();
        let (ledger, store) = test_ledger(&temp);
        let dir = temp.path().join("migrations");
        write_migration(&dir, 1, "users", "CREATE TABLE users (id INTEGER)", "DROP TABLE users");

        let migrations = ledger.discover().unwrap();
        ledger.apply(&migrations[0]).unwrap();
        assert_eq!(ledger.current_version(), 1);

        let outcome = ledger.rollback(1).unwrap();
        assert_eq!(outcome.version, 1);
        assert_eq!(ledger.current_version(), 0);
        assert!(ledger.record(1).is_none());
        assert!(store.list_tables().unwrap().is_empty());
    }

    #[test]
    fn test_rollback_without_down_script() {
        let temp = TempDir::new().unwrap();
        let (ledger, _) = test_ledger(&temp);
        let dir = temp.path().join("migrations");
        write_migration(&dir, 1, "users", "CREATE TABLE users (id INTEGER)", "");

        let migrations = ledger.discover().unwrap();
        ledger.apply(&migrations[0]).unwrap();

        let result = ledger.rollback(1);
        assert!(matches!(
            result,
            Err(MigrationError::NoRollbackScript { version: 1 })
        ));
        // Record must survive the failed rollback
        assert_eq!(ledger.current_version(), 1);
    }

    #[test]
    fn test_ledger_persists_across_reopen() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("migrations");
        {
            let (ledger, _) = test_ledger(&temp);
            write_migration(&dir, 1, "users", "CREATE TABLE users (id INTEGER)", "DROP TABLE users");
            let migrations = ledger.discover().unwrap();
            ledger.apply(&migrations[0]).unwrap();
        }

        let store = Arc::new(MemoryStore::new());
        let pool = Arc::new(SingleStorePool::new(store));
        let reopened =
            VersionLedger::new(dir, temp.path().join("data"), pool).unwrap();
        assert_eq!(reopened.current_version(), 1);
        let record = reopened.record(1).unwrap();
        assert_eq!(record.rollback_sql, "DROP TABLE users");
    }

    #[test]
    fn test_validate_integrity_detects_edit_and_orphan() {
        let temp = TempDir::new().unwrap();
        let (ledger, _) = test_ledger(&temp);
        let dir = temp.path().join("migrations");
        write_migration(&dir, 1, "users", "CREATE TABLE users (id INTEGER)", "DROP TABLE users");
        write_migration(&dir, 2, "posts", "CREATE TABLE posts (id INTEGER)", "DROP TABLE posts");

        for migration in ledger.discover().unwrap() {
            ledger.apply(&migration).unwrap();
        }

        // Edit migration 1 after it was applied
        write_migration(&dir, 1, "users", "CREATE TABLE users (id INTEGER, email TEXT)", "DROP TABLE users");
        // Remove migration 2's file entirely
        fs::remove_file(dir.join("002_posts.yaml")).unwrap();

        let report = ledger.validate_integrity().unwrap();
        assert!(!report.valid);
        assert!(report
            .issues
            .iter()
            .any(|i| i.contains("checksum mismatch")));
        assert!(report.issues.iter().any(|i| i.contains("orphaned")));
    }
}
