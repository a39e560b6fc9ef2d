//! # Rollback Manager
//!
//! Reverses applied migrations, one version at a time, newest first. Each
//! step is reversed by its stored down-script when one exists; irreversible
//! steps fall back to restoring the snapshot taken before they were applied.
//!
//! Rollback points are snapshots of the store at a known version, created
//! before each migration step and kept in a registry sidecar. A point for
//! version N means "the store exactly as it was at version N".

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{MigrationError, ShiftResult};
use crate::events::{EventBus, MigrationEvent};
use crate::ledger::{MigrationVersion, VersionLedger};
use crate::store::{BackupEngine, ConnectionPool, Role};

/// Registry sidecar holding rollback point metadata.
const POINTS_FILE: &str = "_rollback_points.json";

/// How a version was (or would be) reversed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppliedVia {
    Script,
    Snapshot,
}

impl AppliedVia {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::Snapshot => "snapshot",
        }
    }
}

/// Snapshot of the store at a known version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackPoint {
    pub id: String,
    /// Ledger version the snapshot captures
    pub version: MigrationVersion,
    pub created_at: DateTime<Utc>,
    pub backup_path: String,
    pub description: String,
    /// Store content checksum at creation, for post-restore verification
    pub checksum: String,
}

/// One reversed version within a rollback run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackStepOutcome {
    pub version: MigrationVersion,
    pub applied_via: AppliedVia,
    pub success: bool,
    pub error: Option<String>,
}

/// Outcome of a full rollback run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackReport {
    pub target_version: MigrationVersion,
    pub finished_version: MigrationVersion,
    pub steps: Vec<RollbackStepOutcome>,
    pub success: bool,
}

/// Outcome of a rollback rehearsal against a throwaway store copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRehearsal {
    pub target_version: MigrationVersion,
    pub steps_executed: usize,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Registry statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackStats {
    pub total_points: usize,
    pub live_snapshots: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// Manages rollback points and drives version-by-version reversal.
pub struct RollbackManager {
    points_file: PathBuf,
    points: RwLock<Vec<RollbackPoint>>,
    ledger: Arc<VersionLedger>,
    pool: Arc<dyn ConnectionPool>,
    backup: Arc<dyn BackupEngine>,
    events: Arc<EventBus>,
}

impl RollbackManager {
    pub fn new(
        data_dir: PathBuf,
        ledger: Arc<VersionLedger>,
        pool: Arc<dyn ConnectionPool>,
        backup: Arc<dyn BackupEngine>,
        events: Arc<EventBus>,
    ) -> ShiftResult<Self> {
        let manager = Self {
            points_file: data_dir.join(POINTS_FILE),
            points: RwLock::new(Vec::new()),
            ledger,
            pool,
            backup,
            events,
        };
        manager.load()?;
        Ok(manager)
    }

    fn load(&self) -> ShiftResult<()> {
        if !self.points_file.exists() {
            return Ok(());
        }
        let content =
            fs::read_to_string(&self.points_file).map_err(|e| MigrationError::FileRead {
                path: self.points_file.clone(),
                source: e,
            })?;
        let points: Vec<RollbackPoint> =
            serde_json::from_str(&content).map_err(|e| MigrationError::Parse {
                path: self.points_file.clone(),
                message: format!("rollback registry is corrupt: {}", e),
            })?;
        *self.points.write().unwrap() = points;
        Ok(())
    }

    fn save(&self, points: &[RollbackPoint]) -> ShiftResult<()> {
        let content = serde_json::to_string_pretty(points)
            .map_err(|e| MigrationError::internal(e.to_string()))?;
        let temp_file = self.points_file.with_extension("json.tmp");
        fs::write(&temp_file, &content).map_err(|e| MigrationError::FileWrite {
            path: temp_file.clone(),
            source: e,
        })?;
        fs::rename(&temp_file, &self.points_file).map_err(|e| MigrationError::FileWrite {
            path: self.points_file.clone(),
            source: e,
        })?;
        Ok(())
    }

    /// Snapshot the store at its current version and register the point.
    pub fn create_rollback_point(
        &self,
        description: impl Into<String>,
    ) -> ShiftResult<RollbackPoint> {
        let version = self.ledger.current_version();
        let backup_path = self.backup.snapshot(&format!("v{}", version))?;

        let writer = self.pool.acquire(Role::Writer)?;
        let checksum = writer.content_checksum();
        self.pool.release(writer);

        let point = RollbackPoint {
            id: Uuid::new_v4().to_string(),
            version,
            created_at: Utc::now(),
            backup_path,
            description: description.into(),
            checksum: checksum?,
        };

        let mut points = self.points.write().unwrap();
        points.push(point.clone());
        self.save(&points)?;
        drop(points);

        self.events.emit(MigrationEvent::RollbackPointCreated {
            id: point.id.clone(),
            version,
        });
        Ok(point)
    }

    /// All registered points, oldest first.
    pub fn points(&self) -> Vec<RollbackPoint> {
        self.points.read().unwrap().clone()
    }

    /// Newest registered point capturing exactly `version`, if its snapshot
    /// still exists.
    fn live_point_at(&self, version: MigrationVersion) -> Option<RollbackPoint> {
        self.points
            .read()
            .unwrap()
            .iter()
            .rev()
            .find(|p| p.version == version && self.backup.exists(&p.backup_path))
            .cloned()
    }

    /// Reverse versions one at a time, newest first, until the ledger is at
    /// `target`. Script-first; snapshot fallback per step.
    ///
    /// Stops at the first step that can be reversed neither way and reports
    /// how far it got.
    pub fn rollback_to_version(
        &self,
        target: MigrationVersion,
    ) -> ShiftResult<RollbackReport> {
        let from = self.ledger.current_version();
        if target > from {
            return Err(MigrationError::internal(format!(
                "cannot roll back to {} from {}",
                target, from
            )));
        }

        self.events.emit(MigrationEvent::RollbackStarted {
            from_version: from,
            to_version: target,
        });

        let mut steps = Vec::new();
        let mut version = from;
        while version > target {
            let outcome = self.reverse_one(version);
            let success = outcome.success;
            self.events.emit(MigrationEvent::RollbackStep {
                version,
                applied_via: outcome.applied_via.as_str().to_string(),
                success,
            });
            steps.push(outcome);
            if !success {
                break;
            }
            version -= 1;
        }

        let finished_version = self.ledger.current_version();
        let success = finished_version == target;
        self.events.emit(MigrationEvent::RollbackCompleted {
            to_version: target,
            steps_executed: steps.len(),
            success,
        });

        if !success {
            let message = steps
                .last()
                .and_then(|s| s.error.clone())
                .unwrap_or_else(|| "unknown failure".to_string());
            return Err(MigrationError::RollbackFailed {
                target,
                steps_executed: steps.iter().filter(|s| s.success).count(),
                message,
            });
        }

        Ok(RollbackReport {
            target_version: target,
            finished_version,
            steps,
            success,
        })
    }

    /// Reverse exactly one version. Script first; when the script is missing
    /// or fails at execution time, fall back to restoring the snapshot taken
    /// before this version applied.
    fn reverse_one(&self, version: MigrationVersion) -> RollbackStepOutcome {
        let has_script = self
            .ledger
            .record(version)
            .map(|r| !r.rollback_sql.trim().is_empty())
            .unwrap_or(false);

        let script_error = if has_script {
            match self.ledger.rollback(version) {
                Ok(_) => {
                    return RollbackStepOutcome {
                        version,
                        applied_via: AppliedVia::Script,
                        success: true,
                        error: None,
                    }
                }
                Err(e) => Some(e.to_string()),
            }
        } else {
            None
        };

        let point = match self.live_point_at(version - 1) {
            Some(point) => point,
            None => {
                let error = match script_error {
                    Some(e) => format!(
                        "down-script failed ({}) and no snapshot at version {}",
                        e,
                        version - 1
                    ),
                    None => format!(
                        "no down-script and no snapshot at version {}",
                        version - 1
                    ),
                };
                return RollbackStepOutcome {
                    version,
                    applied_via: if has_script {
                        AppliedVia::Script
                    } else {
                        AppliedVia::Snapshot
                    },
                    success: false,
                    error: Some(error),
                };
            }
        };

        let restored = self
            .backup
            .restore(&point.backup_path)
            .and_then(|_| self.ledger.forget(version));
        match restored {
            Ok(_) => RollbackStepOutcome {
                version,
                applied_via: AppliedVia::Snapshot,
                success: true,
                error: None,
            },
            Err(e) => RollbackStepOutcome {
                version,
                applied_via: AppliedVia::Snapshot,
                success: false,
                error: Some(e.to_string()),
            },
        }
    }

    /// Reverse exactly one applied version, with a safety point created
    /// first so even the rollback itself can be undone. Only the most
    /// recently applied version can be reversed this way; reversing a
    /// middle version would leave later schema states orphaned.
    pub fn rollback_migration(&self, version: MigrationVersion) -> ShiftResult<RollbackReport> {
        let current = self.ledger.current_version();
        if current == 0 {
            return Err(MigrationError::MigrationNotFound { version });
        }
        if version != current {
            return Err(MigrationError::StateMismatch {
                expected: version,
                actual: current,
            });
        }
        self.create_rollback_point(format!("pre-rollback of v{}", version))?;
        self.rollback_to_version(version - 1)
    }

    /// Check, without touching the store, whether every version above
    /// `target` can be reversed by script or snapshot.
    pub fn validate_rollback_capability(
        &self,
        target: MigrationVersion,
    ) -> ShiftResult<Vec<String>> {
        let current = self.ledger.current_version();
        let mut blockers = Vec::new();

        for version in (target + 1..=current).rev() {
            let has_script = self
                .ledger
                .record(version)
                .map(|r| !r.rollback_sql.trim().is_empty())
                .unwrap_or(false);
            if has_script {
                continue;
            }
            if self.live_point_at(version - 1).is_none() {
                blockers.push(format!(
                    "version {} has no down-script and no snapshot at version {}",
                    version,
                    version - 1
                ));
            }
        }
        Ok(blockers)
    }

    /// Rehearse rolling back to `target` against a throwaway copy of the
    /// store. Only stored down-scripts are replayed; a version without one
    /// fails the rehearsal, since a snapshot restore cannot be rehearsed on
    /// a copy. The live store and ledger are never touched.
    pub fn test_rollback(&self, target: MigrationVersion) -> ShiftResult<RollbackRehearsal> {
        let started = std::time::Instant::now();
        let current = self.ledger.current_version();
        if target > current {
            return Err(MigrationError::internal(format!(
                "cannot roll back to {} from {}",
                target, current
            )));
        }

        let writer = self.pool.acquire(Role::Writer)?;
        let scratch = writer.scratch_copy();
        self.pool.release(writer);
        let scratch = scratch?;

        let mut steps_executed = 0;
        let mut error = None;
        for version in (target + 1..=current).rev() {
            let script = self
                .ledger
                .record(version)
                .map(|r| r.rollback_sql)
                .unwrap_or_default();
            if script.trim().is_empty() {
                error = Some(format!("version {} has no down-script", version));
                break;
            }
            if let Err(e) = scratch.execute_batch(&script) {
                error = Some(format!("version {}: {}", version, e));
                break;
            }
            steps_executed += 1;
        }

        Ok(RollbackRehearsal {
            target_version: target,
            steps_executed,
            success: error.is_none(),
            duration_ms: started.elapsed().as_millis() as u64,
            error,
        })
    }

    /// Delete rollback points older than `retention_days`. Failures to
    /// delete individual snapshots are skipped, not fatal; those points stay
    /// registered.
    pub fn cleanup_old_rollback_points(&self, retention_days: u32) -> ShiftResult<usize> {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        let mut points = self.points.write().unwrap();

        let mut kept = Vec::new();
        let mut deleted = 0;

        for point in points.iter() {
            if point.created_at < cutoff && self.backup.delete(&point.backup_path).is_ok() {
                deleted += 1;
            } else {
                kept.push(point.clone());
            }
        }

        if deleted > 0 {
            *points = kept;
            self.save(&points)?;
        }
        drop(points);

        self.events
            .emit(MigrationEvent::CleanupCompleted { deleted });
        Ok(deleted)
    }

    pub fn stats(&self) -> RollbackStats {
        let points = self.points.read().unwrap();
        RollbackStats {
            total_points: points.len(),
            live_snapshots: points
                .iter()
                .filter(|p| self.backup.exists(&p.backup_path))
                .count(),
            oldest: points.iter().map(|p| p.created_at).min(),
            newest: points.iter().map(|p| p.created_at).max(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Migration;
    use crate::store::memory::{MemoryBackupEngine, MemoryStore};
    use crate::store::{SingleStorePool, StoreHandle};
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        store: Arc<MemoryStore>,
        backup: Arc<MemoryBackupEngine>,
        ledger: Arc<VersionLedger>,
        manager: RollbackManager,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let migrations_dir = temp.path().join("migrations");
        let data_dir = temp.path().join("data");
        fs::create_dir_all(&migrations_dir).unwrap();
        fs::create_dir_all(&data_dir).unwrap();

        let store = Arc::new(MemoryStore::new());
        let pool = Arc::new(SingleStorePool::new(store.clone()));
        let backup = Arc::new(MemoryBackupEngine::new(store.clone()));
        let ledger = Arc::new(
            VersionLedger::new(migrations_dir, data_dir.clone(), pool.clone()).unwrap(),
        );
        let manager = RollbackManager::new(
            data_dir,
            ledger.clone(),
            pool,
            backup.clone(),
            Arc::new(EventBus::new()),
        )
        .unwrap();

        Fixture {
            _temp: temp,
            store,
            backup,
            ledger,
            manager,
        }
    }

    fn apply(fixture: &Fixture, version: u64, up: &str, down: &str) {
        let migration = Migration {
            version,
            description: format!("m{}", version),
            up: up.to_string(),
            down: down.to_string(),
            checksum: String::new(),
            file_path: None,
        };
        fixture.ledger.apply(&migration).unwrap();
    }

    #[test]
    fn test_create_rollback_point_snapshots_current_version() {
        let f = fixture();
        apply(&f, 1, "CREATE TABLE users (id INTEGER)", "DROP TABLE users");

        let point = f.manager.create_rollback_point("before v2").unwrap();
        assert_eq!(point.version, 1);
        assert!(f.backup.exists(&point.backup_path));
        assert!(!point.checksum.is_empty());
    }

    #[test]
    fn test_rollback_by_script() {
        let f = fixture();
        apply(&f, 1, "CREATE TABLE users (id INTEGER)", "DROP TABLE users");
        apply(&f, 2, "CREATE TABLE posts (id INTEGER)", "DROP TABLE posts");

        let report = f.manager.rollback_to_version(0).unwrap();
        assert!(report.success);
        assert_eq!(report.steps.len(), 2);
        assert_eq!(report.steps[0].version, 2);
        assert_eq!(report.steps[0].applied_via, AppliedVia::Script);
        assert_eq!(f.ledger.current_version(), 0);
        assert!(f.store.list_tables().unwrap().is_empty());
    }

    #[test]
    fn test_rollback_falls_back_to_snapshot() {
        let f = fixture();
        apply(&f, 1, "CREATE TABLE users (id INTEGER)", "DROP TABLE users");

        // Point captures version 1, then an irreversible version 2 applies.
        f.manager.create_rollback_point("before v2").unwrap();
        apply(&f, 2, "CREATE TABLE posts (id INTEGER)", "");

        let report = f.manager.rollback_to_version(1).unwrap();
        assert!(report.success);
        assert_eq!(report.steps[0].applied_via, AppliedVia::Snapshot);
        assert_eq!(f.ledger.current_version(), 1);
        assert_eq!(f.store.list_tables().unwrap(), vec!["users".to_string()]);
    }

    #[test]
    fn test_failing_down_script_falls_back_to_snapshot() {
        let f = fixture();
        // Snapshot captures version 0, then a version whose down-script
        // targets a table that never existed.
        f.manager.create_rollback_point("before v1").unwrap();
        apply(&f, 1, "CREATE TABLE users (id INTEGER)", "DROP TABLE ghosts");

        let report = f.manager.rollback_to_version(0).unwrap();
        assert!(report.success);
        assert_eq!(report.steps[0].applied_via, AppliedVia::Snapshot);
        assert_eq!(f.ledger.current_version(), 0);
        assert!(f.store.list_tables().unwrap().is_empty());
    }

    #[test]
    fn test_rollback_stops_when_neither_path_available() {
        let f = fixture();
        apply(&f, 1, "CREATE TABLE users (id INTEGER)", "DROP TABLE users");
        // No snapshot before version 2 and no down-script.
        apply(&f, 2, "CREATE TABLE posts (id INTEGER)", "");

        let result = f.manager.rollback_to_version(0);
        match result {
            Err(MigrationError::RollbackFailed {
                target,
                steps_executed,
                ..
            }) => {
                assert_eq!(target, 0);
                assert_eq!(steps_executed, 0);
            }
            other => panic!("unexpected: {:?}", other.map(|r| r.success)),
        }
        // Nothing was reversed.
        assert_eq!(f.ledger.current_version(), 2);
    }

    #[test]
    fn test_validate_rollback_capability() {
        let f = fixture();
        apply(&f, 1, "CREATE TABLE users (id INTEGER)", "DROP TABLE users");
        apply(&f, 2, "CREATE TABLE posts (id INTEGER)", "");

        let blockers = f.manager.validate_rollback_capability(0).unwrap();
        assert_eq!(blockers.len(), 1);
        assert!(blockers[0].contains("version 2"));

        // Version 1 itself has a down-script, so only version 2 blocks.
        let blockers = f.manager.validate_rollback_capability(1).unwrap();
        assert_eq!(blockers.len(), 1);
        assert!(blockers[0].contains("version 2"));
    }

    #[test]
    fn test_rollback_migration_creates_safety_point() {
        let f = fixture();
        apply(&f, 1, "CREATE TABLE users (id INTEGER)", "DROP TABLE users");

        let report = f.manager.rollback_migration(1).unwrap();
        assert!(report.success);
        assert_eq!(f.ledger.current_version(), 0);
        // The pre-rollback safety point is registered.
        assert_eq!(f.manager.points().len(), 1);
        assert_eq!(f.manager.points()[0].version, 1);
    }

    #[test]
    fn test_rollback_migration_rejects_non_current_version() {
        let f = fixture();
        apply(&f, 1, "CREATE TABLE users (id INTEGER)", "DROP TABLE users");
        apply(&f, 2, "CREATE TABLE posts (id INTEGER)", "DROP TABLE posts");

        match f.manager.rollback_migration(1) {
            Err(MigrationError::StateMismatch { expected, actual }) => {
                assert_eq!(expected, 1);
                assert_eq!(actual, 2);
            }
            other => panic!("unexpected: {:?}", other.map(|r| r.success)),
        }
        assert_eq!(f.ledger.current_version(), 2);
    }

    #[test]
    fn test_test_rollback_leaves_live_store_untouched() {
        let f = fixture();
        apply(&f, 1, "CREATE TABLE users (id INTEGER)", "DROP TABLE users");
        apply(&f, 2, "CREATE TABLE posts (id INTEGER)", "DROP TABLE posts");

        let rehearsal = f.manager.test_rollback(0).unwrap();
        assert!(rehearsal.success);
        assert_eq!(rehearsal.steps_executed, 2);
        // Rehearsal ran against a scratch copy only.
        assert_eq!(
            f.store.list_tables().unwrap(),
            vec!["posts".to_string(), "users".to_string()]
        );
        assert_eq!(f.ledger.current_version(), 2);
    }

    #[test]
    fn test_test_rollback_reports_missing_down_script() {
        let f = fixture();
        apply(&f, 1, "CREATE TABLE users (id INTEGER)", "");

        let rehearsal = f.manager.test_rollback(0).unwrap();
        assert!(!rehearsal.success);
        assert_eq!(rehearsal.steps_executed, 0);
        assert!(rehearsal.error.unwrap().contains("no down-script"));
    }

    #[test]
    fn test_cleanup_deletes_points_past_retention() {
        let f = fixture();
        apply(&f, 1, "CREATE TABLE users (id INTEGER)", "DROP TABLE users");

        for i in 0..5 {
            f.manager
                .create_rollback_point(format!("point {}", i))
                .unwrap();
        }
        assert_eq!(f.backup.snapshot_count(), 5);

        // Age the first three past the cutoff.
        {
            let mut points = f.manager.points.write().unwrap();
            for point in points.iter_mut().take(3) {
                point.created_at = Utc::now() - Duration::days(30);
            }
        }

        let deleted = f.manager.cleanup_old_rollback_points(7).unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(f.manager.points().len(), 2);
        assert_eq!(f.backup.snapshot_count(), 2);

        let stats = f.manager.stats();
        assert_eq!(stats.total_points, 2);
        assert_eq!(stats.live_snapshots, 2);
    }

    #[test]
    fn test_cleanup_keeps_points_within_retention() {
        let f = fixture();
        apply(&f, 1, "CREATE TABLE users (id INTEGER)", "DROP TABLE users");
        f.manager.create_rollback_point("fresh").unwrap();

        let deleted = f.manager.cleanup_old_rollback_points(7).unwrap();
        assert_eq!(deleted, 0);
        assert_eq!(f.manager.points().len(), 1);
    }
}
