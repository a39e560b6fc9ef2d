//! Upgrade planning: step costing, risk scoring, and the serializable plan
//! the orchestrator executes.
//!
//! Estimates are deliberately coarse and deliberately high. A plan is a
//! promise to an operator, and a plan that finishes early is a kept promise.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::{Migration, MigrationVersion};
use crate::validator::{destructive_operations, has_unconditional_write};

/// Floor cost of any step: lock handoff, snapshot, ledger write.
const BASE_STEP_COST_MS: u64 = 30_000;
/// Per-line cost of the up-script.
const PER_LINE_COST_MS: u64 = 50;
/// Surcharge for steps that move row data.
const DATA_STATEMENT_COST_MS: u64 = 15_000;
/// Surcharge per index build.
const INDEX_COST_MS: u64 = 20_000;

/// Risk points per finding.
const RISK_DROP_TABLE: u32 = 3;
const RISK_TRUNCATE: u32 = 3;
const RISK_DROP_COLUMN: u32 = 2;
const RISK_UNCONDITIONAL_WRITE: u32 = 2;
const RISK_FLAGGED_DESCRIPTION: u32 = 2;

/// Overall risk classification, ordered from safest to most dangerous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Monotonic in the score: more findings never lower the level.
    pub fn from_score(score: u32) -> Self {
        match score {
            0 => Self::Low,
            1..=3 => Self::Medium,
            4..=6 => Self::High,
            _ => Self::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// One migration as placed in a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub version: MigrationVersion,
    pub description: String,
    pub checksum: String,
    pub estimated_duration_ms: u64,
    pub destructive_operations: Vec<String>,
    pub risk_score: u32,
    pub reversible: bool,
}

/// Ordered, costed, risk-scored upgrade path. Serializable so it can be
/// reviewed and approved out of band before execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub created_at: DateTime<Utc>,
    pub current_version: MigrationVersion,
    pub target_version: MigrationVersion,
    pub steps: Vec<PlanStep>,
    pub estimated_duration_ms: u64,
    pub risk_score: u32,
    pub risk_level: RiskLevel,
    pub requires_downtime: bool,
    pub warnings: Vec<String>,
}

impl MigrationPlan {
    /// Human-readable reverse path: how this plan would be undone, newest
    /// step first.
    pub fn rollback_plan(&self) -> Vec<String> {
        self.steps
            .iter()
            .rev()
            .map(|step| {
                if step.reversible {
                    format!(
                        "roll back version {} ({}) via stored down-script",
                        step.version, step.description
                    )
                } else {
                    format!(
                        "roll back version {} ({}) via snapshot restore",
                        step.version, step.description
                    )
                }
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Cost, score, and assemble a plan from pending migrations.
///
/// The caller guarantees `migrations` is the ascending pending set between
/// `current` (exclusive) and `target` (inclusive).
pub fn build_plan(
    current: MigrationVersion,
    target: MigrationVersion,
    migrations: &[Migration],
    warnings: Vec<String>,
) -> MigrationPlan {
    let mut steps = Vec::with_capacity(migrations.len());
    let mut total_duration = 0u64;
    let mut total_score = 0u32;
    let mut requires_downtime = false;

    for migration in migrations {
        let duration = estimate_step_duration_ms(&migration.up);
        let score = risk_score(migration);
        let destructive = destructive_operations(&migration.up);

        requires_downtime |= destructive
            .iter()
            .any(|op| op.starts_with("DROP TABLE") || op.starts_with("TRUNCATE"))
            || has_unconditional_write(&migration.up);

        total_duration += duration;
        total_score += score;
        steps.push(PlanStep {
            version: migration.version,
            description: migration.description.clone(),
            checksum: migration.checksum.clone(),
            estimated_duration_ms: duration,
            destructive_operations: destructive,
            risk_score: score,
            reversible: migration.is_reversible(),
        });
    }

    MigrationPlan {
        created_at: Utc::now(),
        current_version: current,
        target_version: target,
        steps,
        estimated_duration_ms: total_duration,
        risk_score: total_score,
        risk_level: RiskLevel::from_score(total_score),
        requires_downtime,
        warnings,
    }
}

/// Pessimistic wall-clock estimate for one up-script.
pub fn estimate_step_duration_ms(sql: &str) -> u64 {
    let upper = sql.to_uppercase();
    let mut cost = BASE_STEP_COST_MS;
    cost += PER_LINE_COST_MS * sql.lines().filter(|l| !l.trim().is_empty()).count() as u64;
    if upper.contains("INSERT") || upper.contains("UPDATE") {
        cost += DATA_STATEMENT_COST_MS;
    }
    cost += INDEX_COST_MS * upper.matches("CREATE INDEX").count() as u64;
    cost += INDEX_COST_MS * upper.matches("CREATE UNIQUE INDEX").count() as u64;
    cost
}

/// Risk points for one migration.
pub fn risk_score(migration: &Migration) -> u32 {
    let mut score = 0;
    for op in destructive_operations(&migration.up) {
        if op.starts_with("DROP TABLE") {
            score += RISK_DROP_TABLE;
        } else if op.starts_with("DROP COLUMN") {
            score += RISK_DROP_COLUMN;
        } else if op.starts_with("TRUNCATE") {
            score += RISK_TRUNCATE;
        }
    }
    if has_unconditional_write(&migration.up) {
        score += RISK_UNCONDITIONAL_WRITE;
    }
    let description = migration.description.to_lowercase();
    if description.contains("breaking") || description.contains("major") {
        score += RISK_FLAGGED_DESCRIPTION;
    }
    score
}
