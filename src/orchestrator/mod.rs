//! # Migration Orchestrator
//!
//! Drives full upgrade runs: plan, snapshot, validate, apply with retries,
//! transform data, and unwind on failure. One orchestrated run at a time;
//! concurrent requests are rejected immediately, never queued.
//!
//! The execution order per step is fixed:
//! 1. rollback point (snapshot of the store at the pre-step version)
//! 2. pre-validation (syntax, dependencies, safety scan)
//! 3. apply the up-script, retrying only transient store errors
//! 4. post-validation (expected objects, referential integrity)
//! 5. data transformation rules registered for the step's version
//!
//! A failed step unwinds every step this run applied, newest first, and the
//! run reports `RolledBack`. With `rollback_on_failure` off the run stops in
//! place and reports `Failed` with a resumable checkpoint.

pub mod plan;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{MigrationError, ShiftResult};
use crate::events::{EventBus, MigrationEvent};
use crate::ledger::{AppliedMigration, IntegrityReport, Migration, MigrationVersion, VersionLedger};
use crate::progress::{ProgressSnapshot, ProgressTracker};
use crate::rollback::{RollbackManager, RollbackReport};
use crate::store::{BackupEngine, ConnectionPool};
use crate::transform::{DataTransformer, TransformOptions, TransformationResult, TransformationRule};
use crate::validator::MigrationValidator;
use plan::{build_plan, MigrationPlan};

/// First retry delay; doubles per attempt.
const RETRY_BASE_DELAY_MS: u64 = 100;
/// Retry delay ceiling.
const RETRY_MAX_DELAY_MS: u64 = 5_000;
/// Default retry budget per step.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Terminal status of an orchestrated run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    RolledBack,
    DryRun,
}

/// Per-run options. Data rules are keyed by the version they run after.
#[derive(Clone, Default)]
pub struct ExecuteOptions {
    pub dry_run: bool,
    /// Optional settle delay between steps
    pub pause_between_steps: Option<Duration>,
    /// Retry budget for transient store errors; `None` uses the default
    pub max_retries: Option<u32>,
    /// Accept validation warnings instead of failing the step
    pub continue_on_warning: bool,
    /// Wall-clock budget per apply attempt
    pub step_timeout: Option<Duration>,
    /// Unwind applied steps when one fails (on by default)
    pub no_rollback_on_failure: bool,
    /// Transformation rules to run after specific versions apply
    pub data_rules: HashMap<MigrationVersion, Vec<TransformationRule>>,
}

/// Outcome of one step within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub version: MigrationVersion,
    pub description: String,
    pub attempts: u32,
    pub duration_ms: u64,
    pub warnings: Vec<String>,
    pub transform_results: Vec<TransformationResult>,
    pub error: Option<String>,
}

/// Resumable record of a partially completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationCheckpoint {
    pub run_id: String,
    pub plan: MigrationPlan,
    pub completed: Vec<MigrationVersion>,
    pub created_at: DateTime<Utc>,
}

impl MigrationCheckpoint {
    pub fn to_json(&self) -> ShiftResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| MigrationError::internal(e.to_string()))
    }

    pub fn from_json(json: &str) -> ShiftResult<Self> {
        serde_json::from_str(json).map_err(|e| MigrationError::Parse {
            path: PathBuf::new(),
            message: format!("checkpoint is corrupt: {}", e),
        })
    }

    /// Version the store must be at for this checkpoint to resume.
    pub fn expected_version(&self) -> MigrationVersion {
        self.completed
            .iter()
            .max()
            .copied()
            .unwrap_or(self.plan.current_version)
    }
}

/// Full record of an orchestrated run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub from_version: MigrationVersion,
    pub final_version: MigrationVersion,
    pub steps: Vec<StepReport>,
    /// What a dry run would have executed, in order
    pub dry_run_steps: Vec<String>,
    pub error: Option<String>,
    pub rollback: Option<RollbackReport>,
    pub checkpoint: Option<MigrationCheckpoint>,
}

/// Pre-flight analysis of an upgrade path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeAnalysis {
    pub plan: MigrationPlan,
    pub ledger_integrity: IntegrityReport,
    /// Planned steps with no down-script
    pub irreversible_steps: Vec<MigrationVersion>,
    /// Already-applied versions that could not currently be rolled back
    pub rollback_blockers: Vec<String>,
}

/// Coordinates the ledger, validator, rollback manager, and transformer for
/// whole upgrade runs.
pub struct MigrationOrchestrator {
    ledger: Arc<VersionLedger>,
    validator: MigrationValidator,
    rollback: RollbackManager,
    transformer: DataTransformer,
    events: Arc<EventBus>,
    running: AtomicBool,
    run_since: RwLock<Option<DateTime<Utc>>>,
    progress: RwLock<Option<Arc<ProgressTracker>>>,
}

/// Clears the single-flight flag when a run ends, on every exit path.
struct RunGuard<'a> {
    orchestrator: &'a MigrationOrchestrator,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.orchestrator.running.store(false, Ordering::SeqCst);
        *self.orchestrator.run_since.write().unwrap() = None;
    }
}

impl MigrationOrchestrator {
    pub fn new(
        migrations_dir: PathBuf,
        data_dir: PathBuf,
        pool: Arc<dyn ConnectionPool>,
        backup: Arc<dyn BackupEngine>,
        events: Arc<EventBus>,
    ) -> ShiftResult<Self> {
        let ledger = Arc::new(VersionLedger::new(
            migrations_dir,
            data_dir.clone(),
            pool.clone(),
        )?);
        let rollback = RollbackManager::new(
            data_dir,
            ledger.clone(),
            pool.clone(),
            backup,
            events.clone(),
        )?;
        Ok(Self {
            ledger,
            validator: MigrationValidator::new(pool.clone()),
            rollback,
            transformer: DataTransformer::new(pool, events.clone()),
            events,
            running: AtomicBool::new(false),
            run_since: RwLock::new(None),
            progress: RwLock::new(None),
        })
    }

    pub fn ledger(&self) -> &VersionLedger {
        &self.ledger
    }

    pub fn rollback_manager(&self) -> &RollbackManager {
        &self.rollback
    }

    pub fn current_version(&self) -> MigrationVersion {
        self.ledger.current_version()
    }

    /// Progress of the run in flight, if any.
    pub fn progress(&self) -> Option<ProgressSnapshot> {
        self.progress
            .read()
            .unwrap()
            .as_ref()
            .map(|tracker| tracker.snapshot())
    }

    fn begin_run(&self) -> ShiftResult<RunGuard<'_>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let since = self.run_since.read().unwrap().unwrap_or_else(Utc::now);
            return Err(MigrationError::Busy { since });
        }
        *self.run_since.write().unwrap() = Some(Utc::now());
        Ok(RunGuard { orchestrator: self })
    }

    /// Build and validate a plan from the current version to `target`
    /// (default: highest discovered version).
    ///
    /// Rejects `target <= current` before touching anything, and refuses to
    /// produce a plan the validator finds errors in.
    pub fn create_plan(&self, target: Option<MigrationVersion>) -> ShiftResult<MigrationPlan> {
        let current = self.ledger.current_version();
        let discovered = self.ledger.discover()?;
        let target = target.unwrap_or_else(|| {
            discovered.last().map(|m| m.version).unwrap_or(current)
        });

        if target <= current {
            return Err(MigrationError::Validation {
                errors: vec![format!(
                    "target version {} is not above current version {}",
                    target, current
                )],
                warnings: Vec::new(),
            });
        }

        let pending: Vec<Migration> = discovered
            .into_iter()
            .filter(|m| m.version > current && m.version <= target)
            .collect();
        if pending.is_empty() {
            return Err(MigrationError::MigrationNotFound { version: target });
        }
        if pending.last().map(|m| m.version) != Some(target) {
            return Err(MigrationError::MigrationNotFound { version: target });
        }

        let validation = self.validator.validate_plan(&pending)?;
        if !validation.is_valid() {
            return Err(MigrationError::Validation {
                errors: validation.errors,
                warnings: validation.warnings,
            });
        }

        let plan = build_plan(current, target, &pending, validation.warnings);
        self.events.emit(MigrationEvent::PlanCreated {
            current_version: current,
            target_version: target,
            steps: plan.steps.len(),
            risk_level: plan.risk_level.as_str().to_string(),
        });
        Ok(plan)
    }

    /// Plan plus everything an operator wants to know before committing to
    /// an upgrade.
    pub fn analyze_upgrade_path(
        &self,
        target: Option<MigrationVersion>,
    ) -> ShiftResult<UpgradeAnalysis> {
        let plan = self.create_plan(target)?;
        let ledger_integrity = self.ledger.validate_integrity()?;
        let irreversible_steps = plan
            .steps
            .iter()
            .filter(|s| !s.reversible)
            .map(|s| s.version)
            .collect();
        let rollback_blockers = self.rollback.validate_rollback_capability(0).unwrap_or_default();

        self.events.emit(MigrationEvent::ReportGenerated {
            kind: "upgrade_analysis".to_string(),
        });
        Ok(UpgradeAnalysis {
            plan,
            ledger_integrity,
            irreversible_steps,
            rollback_blockers,
        })
    }

    /// Execute a plan end to end. Returns a report for runs that started;
    /// `Busy`, `StateMismatch`, and checksum drift are errors.
    pub async fn execute_plan(
        &self,
        plan: &MigrationPlan,
        options: &ExecuteOptions,
    ) -> ShiftResult<ExecutionReport> {
        let _guard = self.begin_run()?;
        let run_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let started_at = Utc::now();

        // The store must still be where the plan left it.
        let current = self.ledger.current_version();
        if current != plan.current_version {
            return Err(MigrationError::StateMismatch {
                expected: plan.current_version,
                actual: current,
            });
        }

        // Re-discover and pin the scripts the plan was built against.
        let migrations = self.resolve_plan_migrations(plan)?;

        if options.dry_run {
            return self.dry_run_report(plan, &migrations, run_id, started_at);
        }

        let tracker = Arc::new(ProgressTracker::start(
            plan.steps.len() as u64,
            plan.steps
                .iter()
                .map(|s| (s.version, s.description.clone()))
                .collect(),
        ));
        *self.progress.write().unwrap() = Some(tracker.clone());

        let mut report = ExecutionReport {
            run_id: run_id.clone(),
            status: RunStatus::Completed,
            started_at,
            duration_ms: 0,
            from_version: plan.current_version,
            final_version: plan.current_version,
            steps: Vec::new(),
            dry_run_steps: Vec::new(),
            error: None,
            rollback: None,
            checkpoint: None,
        };

        // Mandatory safety net before the first step.
        if let Err(e) = self.rollback.create_rollback_point("pre-run snapshot") {
            report.status = RunStatus::Failed;
            report.error = Some(format!("could not create pre-run snapshot: {}", e));
            report.duration_ms = started.elapsed().as_millis() as u64;
            tracker.finish(false);
            return Ok(report);
        }

        let mut completed: Vec<MigrationVersion> = Vec::new();
        let mut failure: Option<String> = None;

        for migration in &migrations {
            tracker.start_step(migration.version);
            let step = self.execute_step(migration, options, &tracker).await;
            let failed = step.error.is_some();
            if let Some(error) = &step.error {
                failure = Some(error.clone());
            }
            report.steps.push(step);

            if failed {
                tracker.fail_step(migration.version, failure.clone().unwrap_or_default());
                break;
            }
            completed.push(migration.version);
            tracker.update_progress(completed.len() as u64);

            if let Some(pause) = options.pause_between_steps {
                tokio::time::sleep(pause).await;
            }
        }

        report.final_version = self.ledger.current_version();

        if let Some(error) = failure {
            report.error = Some(error);
            if options.no_rollback_on_failure {
                report.status = RunStatus::Failed;
                report.checkpoint = Some(MigrationCheckpoint {
                    run_id,
                    plan: plan.clone(),
                    completed,
                    created_at: Utc::now(),
                });
            } else {
                // Unwind everything this run applied, newest first.
                match self.rollback.rollback_to_version(plan.current_version) {
                    Ok(rollback_report) => {
                        report.status = RunStatus::RolledBack;
                        report.rollback = Some(rollback_report);
                    }
                    Err(e) => {
                        report.status = RunStatus::Failed;
                        report.error = Some(format!(
                            "{}; rollback also failed: {}",
                            report.error.take().unwrap_or_default(),
                            e
                        ));
                        report.checkpoint = Some(MigrationCheckpoint {
                            run_id,
                            plan: plan.clone(),
                            completed,
                            created_at: Utc::now(),
                        });
                    }
                }
                report.final_version = self.ledger.current_version();
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        tracker.finish(matches!(report.status, RunStatus::Completed));
        self.events.emit(MigrationEvent::ReportGenerated {
            kind: "execution_report".to_string(),
        });
        Ok(report)
    }

    /// Continue a failed run from its checkpoint.
    pub async fn resume_from_checkpoint(
        &self,
        checkpoint: &MigrationCheckpoint,
        options: &ExecuteOptions,
    ) -> ShiftResult<ExecutionReport> {
        let expected = checkpoint.expected_version();
        let actual = self.ledger.current_version();
        if actual != expected {
            return Err(MigrationError::StateMismatch { expected, actual });
        }

        let mut remaining = checkpoint.plan.clone();
        remaining.current_version = expected;
        remaining.steps.retain(|s| !checkpoint.completed.contains(&s.version));
        if remaining.steps.is_empty() {
            return Err(MigrationError::AlreadyApplied {
                version: checkpoint.plan.target_version,
            });
        }

        Box::pin(self.execute_plan(&remaining, options)).await
    }

    /// Roll the store back to `target`, as its own single-flight run.
    pub fn rollback_to(&self, target: MigrationVersion) -> ShiftResult<RollbackReport> {
        let _guard = self.begin_run()?;
        self.rollback.rollback_to_version(target)
    }

    fn resolve_plan_migrations(&self, plan: &MigrationPlan) -> ShiftResult<Vec<Migration>> {
        let discovered = self.ledger.discover()?;
        let mut resolved = Vec::with_capacity(plan.steps.len());
        for step in &plan.steps {
            let migration = discovered
                .iter()
                .find(|m| m.version == step.version)
                .cloned()
                .ok_or(MigrationError::MigrationNotFound {
                    version: step.version,
                })?;
            // The scripts must not have drifted since planning.
            if migration.checksum != step.checksum {
                return Err(MigrationError::ChecksumMismatch {
                    version: step.version,
                    expected: step.checksum.clone(),
                    actual: migration.checksum.clone(),
                });
            }
            resolved.push(migration);
        }
        Ok(resolved)
    }

    fn dry_run_report(
        &self,
        plan: &MigrationPlan,
        migrations: &[Migration],
        run_id: String,
        started_at: DateTime<Utc>,
    ) -> ShiftResult<ExecutionReport> {
        let mut dry_run_steps = Vec::new();
        let mut error = None;
        // Tables earlier steps would have created, so later steps validate
        // against the schema they would actually see.
        let mut assumed = std::collections::HashSet::new();

        for migration in migrations {
            let validation = self
                .validator
                .validate_pre_migration_assuming(migration, &assumed)?;
            assumed.extend(crate::validator::created_tables(&migration.up));
            for dropped in crate::validator::dropped_tables(&migration.up) {
                assumed.remove(&dropped);
            }
            if !validation.is_valid() {
                error = Some(format!(
                    "version {} would fail validation: {}",
                    migration.version,
                    validation.errors.join("; ")
                ));
                break;
            }
            dry_run_steps.push(format!(
                "would apply version {} ({}){}",
                migration.version,
                migration.description,
                if validation.warnings.is_empty() {
                    String::new()
                } else {
                    format!(" with {} warning(s)", validation.warnings.len())
                }
            ));
        }

        Ok(ExecutionReport {
            run_id,
            status: RunStatus::DryRun,
            started_at,
            duration_ms: 0,
            from_version: plan.current_version,
            final_version: self.ledger.current_version(),
            steps: Vec::new(),
            dry_run_steps,
            error,
            rollback: None,
            checkpoint: None,
        })
    }

    async fn execute_step(
        &self,
        migration: &Migration,
        options: &ExecuteOptions,
        tracker: &ProgressTracker,
    ) -> StepReport {
        let started = Instant::now();
        let mut step = StepReport {
            version: migration.version,
            description: migration.description.clone(),
            attempts: 0,
            duration_ms: 0,
            warnings: Vec::new(),
            transform_results: Vec::new(),
            error: None,
        };

        self.events.emit(MigrationEvent::StepStarted {
            version: migration.version,
            description: migration.description.clone(),
        });

        let outcome = self.run_step_phases(migration, options, &mut step).await;
        step.duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => {
                tracker.complete_step(migration.version, step.duration_ms);
                self.events.emit(MigrationEvent::StepCompleted {
                    version: migration.version,
                    duration_ms: step.duration_ms,
                });
            }
            Err(e) => {
                step.error = Some(e.to_string());
                self.events.emit(MigrationEvent::StepFailed {
                    version: migration.version,
                    error: e.to_string(),
                });
            }
        }
        step
    }

    async fn run_step_phases(
        &self,
        migration: &Migration,
        options: &ExecuteOptions,
        step: &mut StepReport,
    ) -> ShiftResult<()> {
        // Snapshot the store at the pre-step version.
        self.rollback
            .create_rollback_point(format!("before v{}", migration.version))?;

        let pre = self.validator.validate_pre_migration(migration)?;
        step.warnings.extend(pre.warnings.clone());
        if !pre.is_valid() {
            return Err(MigrationError::Validation {
                errors: pre.errors,
                warnings: pre.warnings,
            });
        }
        if !pre.warnings.is_empty() && !options.continue_on_warning {
            return Err(MigrationError::Validation {
                errors: vec![format!(
                    "version {} has {} unaccepted warning(s)",
                    migration.version,
                    pre.warnings.len()
                )],
                warnings: pre.warnings,
            });
        }

        self.apply_with_retries(migration, options, step).await?;

        let post = self.validator.validate_post_migration(migration)?;
        step.warnings.extend(post.warnings.clone());
        if !post.is_valid() {
            return Err(MigrationError::Validation {
                errors: post.errors,
                warnings: post.warnings,
            });
        }
        if !post.warnings.is_empty() && !options.continue_on_warning {
            return Err(MigrationError::Validation {
                errors: vec![format!(
                    "version {} failed post-validation with {} unaccepted warning(s)",
                    migration.version,
                    post.warnings.len()
                )],
                warnings: post.warnings,
            });
        }

        if let Some(rules) = options.data_rules.get(&migration.version) {
            let plan = self.transformer.create_plan(rules.clone())?;
            let results = self
                .transformer
                .execute_plan(&plan, &TransformOptions::default(), None)
                .await?;
            let bad = results
                .iter()
                .any(|r| r.failed > 0 || r.cancelled || (r.processed > 0 && r.successful == 0));
            step.transform_results = results;
            if bad {
                return Err(MigrationError::internal(format!(
                    "data transformation after version {} failed",
                    migration.version
                )));
            }
        }

        Ok(())
    }

    /// Apply one up-script, retrying transient store errors with exponential
    /// backoff and jitter. The script runs on the blocking pool; a timeout
    /// abandons the wait but cannot interrupt the script itself.
    async fn apply_with_retries(
        &self,
        migration: &Migration,
        options: &ExecuteOptions,
        step: &mut StepReport,
    ) -> ShiftResult<AppliedMigration> {
        let max_retries = options.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            step.attempts = attempt;

            let ledger = self.ledger.clone();
            let to_apply = migration.clone();
            let task = tokio::task::spawn_blocking(move || ledger.apply(&to_apply));

            let joined = match options.step_timeout {
                Some(limit) => match tokio::time::timeout(limit, task).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        return Err(MigrationError::Timeout {
                            version: migration.version,
                            after_ms: limit.as_millis() as u64,
                        })
                    }
                },
                None => task.await,
            };
            let result = joined
                .map_err(|e| MigrationError::internal(format!("apply task panicked: {}", e)))?;

            match result {
                Ok(applied) => return Ok(applied),
                Err(e) if e.is_transient() && attempt <= max_retries => {
                    let delay = backoff_delay(attempt);
                    self.events.emit(MigrationEvent::StepRetried {
                        version: migration.version,
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                    });
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Exponential backoff with up to 50% added jitter, capped.
fn backoff_delay(attempt: u32) -> Duration {
    let base = RETRY_BASE_DELAY_MS
        .saturating_mul(1u64 << (attempt - 1).min(16))
        .min(RETRY_MAX_DELAY_MS);
    let jitter = rand::thread_rng().gen_range(0..=base / 2);
    Duration::from_millis((base + jitter).min(RETRY_MAX_DELAY_MS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemorySink;
    use crate::ledger::Migration;
    use crate::store::memory::{MemoryBackupEngine, MemoryStore};
    use crate::store::{Row, SingleStorePool, StoreHandle};
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        temp: TempDir,
        store: Arc<MemoryStore>,
        sink: Arc<MemorySink>,
        orchestrator: MigrationOrchestrator,
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
        let events = Arc::new(EventBus::new());
        let sink = Arc::new(MemorySink::new());
        events.attach(sink.clone());

        let orchestrator =
            MigrationOrchestrator::new(migrations_dir, data_dir, pool, backup, events).unwrap();
        Fixture {
            temp,
            store,
            sink,
            orchestrator,
        }
    }

    fn write_migration(fixture: &Fixture, version: u64, name: &str, up: &str, down: &str) {
        let migration = Migration {
            version,
            description: name.to_string(),
            up: up.to_string(),
            down: down.to_string(),
            checksum: String::new(),
            file_path: None,
        };
        let content = serde_yaml::to_string(&migration).unwrap();
        let path = fixture
            .temp
            .path()
            .join("migrations")
            .join(format!("{:03}_{}.yaml", version, name));
        fs::write(path, content).unwrap();
    }

    fn two_step_fixture() -> Fixture {
        let f = fixture();
        write_migration(
            &f,
            1,
            "create_users",
            "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL)",
            "DROP TABLE users",
        );
        write_migration(
            &f,
            2,
            "add_name",
            "ALTER TABLE users ADD COLUMN name TEXT",
            "ALTER TABLE users DROP COLUMN name",
        );
        f
    }

    #[test]
    fn test_create_plan_rejects_target_not_above_current() {
        let f = two_step_fixture();
        let result = f.orchestrator.create_plan(Some(0));
        assert!(matches!(result, Err(MigrationError::Validation { .. })));
        // Nothing was touched.
        assert!(f.store.list_tables().unwrap().is_empty());
        assert_eq!(f.orchestrator.current_version(), 0);
    }

    #[test]
    fn test_create_plan_defaults_to_latest() {
        let f = two_step_fixture();
        let plan = f.orchestrator.create_plan(None).unwrap();
        assert_eq!(plan.current_version, 0);
        assert_eq!(plan.target_version, 2);
        assert_eq!(plan.steps.len(), 2);
    }

    #[test]
    fn test_create_plan_missing_target_version() {
        let f = two_step_fixture();
        let result = f.orchestrator.create_plan(Some(9));
        assert!(matches!(
            result,
            Err(MigrationError::MigrationNotFound { version: 9 })
        ));
    }

    #[tokio::test]
    async fn test_full_run_then_rollback_to_zero() {
        let f = two_step_fixture();
        let plan = f.orchestrator.create_plan(None).unwrap();
        let report = f
            .orchestrator
            .execute_plan(&plan, &ExecuteOptions::default())
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.final_version, 2);
        assert_eq!(report.steps.len(), 2);
        let columns = f.store.table_columns("users").unwrap();
        assert!(columns.iter().any(|c| c.name == "name"));

        // Reverse the whole upgrade.
        let rollback = f.orchestrator.rollback_to(0).unwrap();
        assert!(rollback.success);
        assert_eq!(rollback.steps.len(), 2);
        assert_eq!(f.orchestrator.current_version(), 0);
        assert!(f.store.list_tables().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_step_unwinds_applied_steps() {
        let f = two_step_fixture();
        let plan = f.orchestrator.create_plan(None).unwrap();

        // Step 2 fails at the store level.
        f.store.fail_when_sql_contains("ADD COLUMN name");
        let report = f
            .orchestrator
            .execute_plan(&plan, &ExecuteOptions::default())
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::RolledBack);
        assert!(report.error.is_some());
        // One successful step means one reverse rollback step.
        let rollback = report.rollback.unwrap();
        assert_eq!(rollback.steps.len(), 1);
        assert_eq!(rollback.steps[0].version, 1);
        assert_eq!(report.final_version, 0);
        assert!(f.store.list_tables().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let f = two_step_fixture();
        let plan = f.orchestrator.create_plan(Some(1)).unwrap();

        f.store.inject_transient_failures(2);
        let report = f
            .orchestrator
            .execute_plan(&plan, &ExecuteOptions::default())
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.steps[0].attempts, 3);

        // Retry events were emitted with growing attempt numbers.
        let retries: Vec<u32> = f
            .sink
            .entries()
            .into_iter()
            .filter_map(|e| match e.event {
                MigrationEvent::StepRetried { attempt, .. } => Some(attempt),
                _ => None,
            })
            .collect();
        assert_eq!(retries, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_syntax_error_is_not_retried() {
        let f = fixture();
        write_migration(&f, 1, "broken", "CREAT TABLE oops (id INTEGER)", "");
        // A plan for a syntactically broken migration never comes back valid,
        // so drive the ledger directly through a hand-built plan.
        let migrations = vec![Migration {
            version: 1,
            description: "broken".to_string(),
            up: "CREAT TABLE oops (id INTEGER)".to_string(),
            down: String::new(),
            checksum: String::new(),
            file_path: None,
        }];
        let validation = f.orchestrator.validator.validate_plan(&migrations).unwrap();
        assert!(validation.is_valid());
        let pre = f
            .orchestrator
            .validator
            .validate_pre_migration(&migrations[0])
            .unwrap();
        assert!(!pre.is_valid());
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let f = two_step_fixture();
        let plan = f.orchestrator.create_plan(None).unwrap();
        let before = f.store.content_checksum().unwrap();

        let options = ExecuteOptions {
            dry_run: true,
            ..Default::default()
        };
        let report = f.orchestrator.execute_plan(&plan, &options).await.unwrap();

        assert_eq!(report.status, RunStatus::DryRun);
        assert_eq!(report.dry_run_steps.len(), 2);
        assert!(report.dry_run_steps[0].contains("version 1"));
        assert_eq!(f.store.content_checksum().unwrap(), before);
        assert_eq!(f.orchestrator.current_version(), 0);
    }

    #[tokio::test]
    async fn test_busy_rejected_not_queued() {
        let f = two_step_fixture();
        let plan = f.orchestrator.create_plan(None).unwrap();

        // Simulate an in-flight run holding the single-flight slot.
        f.orchestrator.running.store(true, Ordering::SeqCst);
        *f.orchestrator.run_since.write().unwrap() = Some(Utc::now());

        let result = f
            .orchestrator
            .execute_plan(&plan, &ExecuteOptions::default())
            .await;
        assert!(matches!(result, Err(MigrationError::Busy { .. })));

        f.orchestrator.running.store(false, Ordering::SeqCst);
        let report = f
            .orchestrator
            .execute_plan(&plan, &ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_stale_plan_rejected() {
        let f = two_step_fixture();
        let plan = f.orchestrator.create_plan(Some(1)).unwrap();
        f.orchestrator
            .execute_plan(&plan, &ExecuteOptions::default())
            .await
            .unwrap();

        // The same plan again: the store has moved.
        let result = f
            .orchestrator
            .execute_plan(&plan, &ExecuteOptions::default())
            .await;
        assert!(matches!(
            result,
            Err(MigrationError::StateMismatch {
                expected: 0,
                actual: 1
            })
        ));
    }

    #[tokio::test]
    async fn test_edited_script_rejected_by_checksum() {
        let f = two_step_fixture();
        let plan = f.orchestrator.create_plan(None).unwrap();

        // Edit migration 1 between planning and execution.
        write_migration(
            &f,
            1,
            "create_users",
            "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL, extra TEXT)",
            "DROP TABLE users",
        );

        let result = f
            .orchestrator
            .execute_plan(&plan, &ExecuteOptions::default())
            .await;
        assert!(matches!(
            result,
            Err(MigrationError::ChecksumMismatch { version: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_warnings_block_without_continue_on_warning() {
        let f = fixture();
        f.store
            .execute_batch("CREATE TABLE legacy (id INTEGER)")
            .unwrap();
        // Destructive and irreversible: two warnings.
        write_migration(&f, 1, "drop_legacy", "DROP TABLE legacy", "");

        let plan = f.orchestrator.create_plan(None).unwrap();
        let report = f
            .orchestrator
            .execute_plan(&plan, &ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::RolledBack);
        assert!(report.error.unwrap().contains("unaccepted warning"));
        // The step never applied, so legacy survives.
        assert_eq!(f.store.list_tables().unwrap(), vec!["legacy".to_string()]);

        let options = ExecuteOptions {
            continue_on_warning: true,
            ..Default::default()
        };
        let report = f.orchestrator.execute_plan(&plan, &options).await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert!(f.store.list_tables().unwrap().is_empty());
        assert!(!report.steps[0].warnings.is_empty());
    }

    #[tokio::test]
    async fn test_data_rules_run_after_their_version() {
        let f = fixture();
        write_migration(
            &f,
            1,
            "create_users",
            "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT)",
            "DROP TABLE users",
        );

        // Seed data arrives through a rule attached to version 1.
        let seed: TransformationRule = TransformationRule::new(
            "noop",
            "users",
            Arc::new(|row: &Row| Ok(row.clone())),
        );
        let mut data_rules = HashMap::new();
        data_rules.insert(1u64, vec![seed]);

        let plan = f.orchestrator.create_plan(None).unwrap();
        let options = ExecuteOptions {
            data_rules,
            ..Default::default()
        };
        let report = f.orchestrator.execute_plan(&plan, &options).await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.steps[0].transform_results.len(), 1);
    }

    #[tokio::test]
    async fn test_checkpoint_resume_after_failure() {
        let f = two_step_fixture();
        let plan = f.orchestrator.create_plan(None).unwrap();

        f.store.fail_when_sql_contains("ADD COLUMN name");
        let options = ExecuteOptions {
            no_rollback_on_failure: true,
            ..Default::default()
        };
        let report = f.orchestrator.execute_plan(&plan, &options).await.unwrap();
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.final_version, 1);

        let checkpoint = report.checkpoint.unwrap();
        assert_eq!(checkpoint.completed, vec![1]);

        // Round-trip through JSON like an operator would.
        let restored = MigrationCheckpoint::from_json(&checkpoint.to_json().unwrap()).unwrap();

        f.store.clear_failure_pattern();
        let resumed = f
            .orchestrator
            .resume_from_checkpoint(&restored, &ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(resumed.status, RunStatus::Completed);
        assert_eq!(f.orchestrator.current_version(), 2);
    }

    #[tokio::test]
    async fn test_checkpoint_resume_rejects_moved_store() {
        let f = two_step_fixture();
        let plan = f.orchestrator.create_plan(None).unwrap();

        f.store.fail_when_sql_contains("ADD COLUMN name");
        let options = ExecuteOptions {
            no_rollback_on_failure: true,
            ..Default::default()
        };
        let report = f.orchestrator.execute_plan(&plan, &options).await.unwrap();
        let checkpoint = report.checkpoint.unwrap();

        // Someone rolled the store back underneath the checkpoint.
        f.store.clear_failure_pattern();
        f.orchestrator.rollback_to(0).unwrap();

        let result = f
            .orchestrator
            .resume_from_checkpoint(&checkpoint, &ExecuteOptions::default())
            .await;
        assert!(matches!(
            result,
            Err(MigrationError::StateMismatch {
                expected: 1,
                actual: 0
            })
        ));
    }

    #[tokio::test]
    async fn test_analyze_upgrade_path() {
        let f = fixture();
        write_migration(
            &f,
            1,
            "create_users",
            "CREATE TABLE users (id INTEGER)",
            "DROP TABLE users",
        );
        write_migration(&f, 2, "one_way", "CREATE TABLE audit (id INTEGER)", "");

        let analysis = f.orchestrator.analyze_upgrade_path(None).unwrap();
        assert_eq!(analysis.plan.steps.len(), 2);
        assert_eq!(analysis.irreversible_steps, vec![2]);
        assert!(analysis.ledger_integrity.valid);
    }

    #[tokio::test]
    async fn test_progress_reaches_completion() {
        let f = two_step_fixture();
        let plan = f.orchestrator.create_plan(None).unwrap();
        f.orchestrator
            .execute_plan(&plan, &ExecuteOptions::default())
            .await
            .unwrap();

        let snapshot = f.orchestrator.progress().unwrap();
        assert!(snapshot.finished);
        assert_eq!(snapshot.processed_units, 2);
        assert!((snapshot.percent - 100.0).abs() < f64::EPSILON);
        assert!(snapshot
            .steps
            .iter()
            .all(|s| s.status == crate::progress::StepStatus::Completed));
    }

    #[tokio::test]
    async fn test_events_tell_the_whole_story() {
        let f = two_step_fixture();
        let plan = f.orchestrator.create_plan(None).unwrap();
        f.orchestrator
            .execute_plan(&plan, &ExecuteOptions::default())
            .await
            .unwrap();

        let events = f.sink.entries();
        let mut kinds: Vec<&'static str> = Vec::new();
        for envelope in &events {
            kinds.push(match envelope.event {
                MigrationEvent::PlanCreated { .. } => "plan",
                MigrationEvent::StepStarted { .. } => "start",
                MigrationEvent::StepCompleted { .. } => "done",
                MigrationEvent::RollbackPointCreated { .. } => "point",
                MigrationEvent::ReportGenerated { .. } => "report",
                _ => "other",
            });
        }
        assert!(kinds.contains(&"plan"));
        assert_eq!(kinds.iter().filter(|k| **k == "start").count(), 2);
        assert_eq!(kinds.iter().filter(|k| **k == "done").count(), 2);
        // Pre-run snapshot plus one per step.
        assert_eq!(kinds.iter().filter(|k| **k == "point").count(), 3);
    }

    #[tokio::test]
    async fn test_seed_data_survives_partial_failure_rollback() {
        // End-to-end: apply v1, insert rows, fail v2, unwind, verify the
        // store is back to the pre-run schema with no leftovers.
        let f = two_step_fixture();
        let plan1 = f.orchestrator.create_plan(Some(1)).unwrap();
        f.orchestrator
            .execute_plan(&plan1, &ExecuteOptions::default())
            .await
            .unwrap();

        let mut row = Row::new();
        row.insert("id".to_string(), json!(1));
        row.insert("email".to_string(), json!("ada@example.com"));
        f.store.insert_rows("users", &[row]).unwrap();

        let plan2 = f.orchestrator.create_plan(Some(2)).unwrap();
        f.store.fail_when_sql_contains("ADD COLUMN name");
        let report = f
            .orchestrator
            .execute_plan(&plan2, &ExecuteOptions::default())
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::RolledBack);
        // v2 never applied and v1 data is intact.
        assert_eq!(f.orchestrator.current_version(), 1);
        assert_eq!(f.store.row_count("users").unwrap(), 1);
        let columns = f.store.table_columns("users").unwrap();
        assert!(!columns.iter().any(|c| c.name == "name"));
    }

    #[test]
    fn test_backoff_delay_grows_and_caps() {
        let first = backoff_delay(1);
        assert!(first >= Duration::from_millis(RETRY_BASE_DELAY_MS));
        assert!(first <= Duration::from_millis(RETRY_BASE_DELAY_MS + RETRY_BASE_DELAY_MS / 2));

        for attempt in 1..12 {
            assert!(backoff_delay(attempt) <= Duration::from_millis(RETRY_MAX_DELAY_MS));
        }
    }
}
