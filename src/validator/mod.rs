//! # Migration Validator
//!
//! Pre-flight, post-flight, and plan-level validation. The validator is
//! strictly advisory about warnings and strictly blocking about errors: an
//! error anywhere means the migration or plan must not run.
//!
//! Checks fall into three layers:
//! 1. **Syntax**: every script must parse as SQL before anything executes
//! 2. **Dependencies**: statements must target tables that exist, either in
//!    the store already or created earlier in the same script/plan
//! 3. **Safety**: destructive operations, missing down-scripts, and
//!    unconditional writes are surfaced as warnings with suggestions

pub mod schema;

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;

use crate::errors::ShiftResult;
use crate::ledger::Migration;
use crate::store::{ConnectionPool, Role, StoreHandle};

/// Rough estimate of catalog overhead per new table, used for growth checks.
const TABLE_OVERHEAD_BYTES: u64 = 4096;
/// Rough per-statement estimate for data-bearing statements.
const INSERT_ESTIMATE_BYTES: u64 = 1024;

/// Outcome of a validation pass.
///
/// Errors block execution; warnings are surfaced and may be accepted
/// explicitly; suggestions are advisory text for the operator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn suggestion(&mut self, message: impl Into<String>) {
        self.suggestions.push(message.into());
    }

    /// Fold another result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        self.suggestions.extend(other.suggestions);
    }
}

/// Validator over the live store.
pub struct MigrationValidator {
    pool: Arc<dyn ConnectionPool>,
}

impl MigrationValidator {
    pub fn new(pool: Arc<dyn ConnectionPool>) -> Self {
        Self { pool }
    }

    /// Parse-check a script without executing it, and flag common smells.
    /// Smells never block: missing idempotency guards become suggestions and
    /// hardcoded date literals become warnings.
    pub fn validate_sql_syntax(&self, sql: &str) -> ValidationResult {
        let mut result = ValidationResult::new();
        if sql.trim().is_empty() {
            result.error("script is empty");
            return result;
        }
        for statement in split_statements(sql) {
            if let Err(e) = Parser::parse_sql(&SQLiteDialect {}, &statement) {
                result.error(format!("syntax error in '{}': {}", truncate(&statement), e));
                continue;
            }
            if creates_object_re().is_match(&statement)
                && !if_not_exists_re().is_match(&statement)
            {
                result.suggestion(format!(
                    "add IF NOT EXISTS to '{}' so reruns are idempotent",
                    truncate(&statement)
                ));
            }
            if date_literal_re().is_match(&statement) {
                result.warning(format!(
                    "hardcoded date literal in '{}'; consider a computed timestamp",
                    truncate(&statement)
                ));
            }
        }
        result
    }

    /// Everything that can be checked before the up-script runs.
    pub fn validate_pre_migration(&self, migration: &Migration) -> ShiftResult<ValidationResult> {
        self.validate_pre_migration_assuming(migration, &HashSet::new())
    }

    /// Pre-flight validation with extra tables assumed to exist. Dry runs use
    /// this to account for tables earlier plan steps would have created.
    pub fn validate_pre_migration_assuming(
        &self,
        migration: &Migration,
        assumed_tables: &HashSet<String>,
    ) -> ShiftResult<ValidationResult> {
        let mut result = self.validate_sql_syntax(&migration.up);

        if migration.is_reversible() {
            let down = self.validate_sql_syntax(&migration.down);
            for error in down.errors {
                result.error(format!("down-script: {}", error));
            }
        } else {
            result.warning(format!(
                "migration {} has no down-script and cannot be rolled back by script",
                migration.version
            ));
            result.suggestion(
                "a snapshot rollback point will be the only way back; keep backups enabled",
            );
        }

        let reader = self.pool.acquire(Role::Reader)?;
        let mut existing: HashSet<String> = reader
            .list_tables()?
            .into_iter()
            .map(|t| t.to_lowercase())
            .collect();
        self.pool.release(reader);
        existing.extend(assumed_tables.iter().map(|t| t.to_lowercase()));
        check_table_dependencies(&migration.up, &existing, &mut result);

        for op in destructive_operations(&migration.up) {
            result.warning(format!(
                "migration {} contains a destructive operation: {}",
                migration.version, op
            ));
        }
        if has_unconditional_write(&migration.up) {
            result.warning(format!(
                "migration {} has an UPDATE or DELETE without a WHERE clause",
                migration.version
            ));
        }
        if !destructive_operations(&migration.up).is_empty() {
            result.suggestion("verify a rollback point exists before applying");
        }

        Ok(result)
    }

    /// Everything that can be checked after the up-script ran: expected
    /// objects exist, dropped objects are gone, referential integrity holds.
    pub fn validate_post_migration(&self, migration: &Migration) -> ShiftResult<ValidationResult> {
        let mut result = ValidationResult::new();
        let reader = self.pool.acquire(Role::Reader)?;
        let outcome = self.post_checks(reader.as_ref(), migration, &mut result);
        self.pool.release(reader);
        outcome?;
        Ok(result)
    }

    fn post_checks(
        &self,
        handle: &dyn StoreHandle,
        migration: &Migration,
        result: &mut ValidationResult,
    ) -> ShiftResult<()> {
        let snapshot = schema::SchemaSnapshot::capture(handle)?;

        for table in created_tables(&migration.up) {
            // A table both created and dropped within the script is allowed
            // to be absent afterwards.
            if dropped_tables(&migration.up).contains(&table) {
                continue;
            }
            if !snapshot.has_table(&table) {
                result.error(format!(
                    "expected table '{}' to exist after migration {}",
                    table, migration.version
                ));
            }
        }
        for table in dropped_tables(&migration.up) {
            if created_tables(&migration.up).contains(&table) {
                continue;
            }
            if snapshot.has_table(&table) {
                result.error(format!(
                    "expected table '{}' to be gone after migration {}",
                    table, migration.version
                ));
            }
        }
        for index in created_indexes(&migration.up) {
            if !snapshot.has_index(&index) {
                result.error(format!(
                    "expected index '{}' to exist after migration {}",
                    index, migration.version
                ));
            }
        }

        let violations = handle.fk_violations()?;
        if !violations.is_empty() {
            result.error(format!(
                "{} foreign-key violation(s) after migration {}; first: {}.{} -> {}",
                violations.len(),
                migration.version,
                violations[0].table,
                violations[0].column,
                violations[0].referenced_table
            ));
        }

        Ok(())
    }

    /// Plan-level validation across an ordered set of pending migrations.
    pub fn validate_plan(&self, migrations: &[Migration]) -> ShiftResult<ValidationResult> {
        let mut result = ValidationResult::new();

        let mut seen = HashSet::new();
        for migration in migrations {
            if !seen.insert(migration.version) {
                result.error(format!("duplicate version {} in plan", migration.version));
            }
        }
        for pair in migrations.windows(2) {
            if pair[1].version != pair[0].version + 1 {
                result.warning(format!(
                    "version gap in plan between {} and {}",
                    pair[0].version, pair[1].version
                ));
            }
        }

        let reader = self.pool.acquire(Role::Reader)?;
        let existing: HashSet<String> = reader
            .list_tables()?
            .into_iter()
            .map(|t| t.to_lowercase())
            .collect();
        let store_size = reader.size_bytes()?;
        self.pool.release(reader);

        let mut created_in_plan: HashSet<String> = HashSet::new();
        let mut estimated_growth: u64 = 0;

        for migration in migrations {
            for table in created_tables(&migration.up) {
                if created_in_plan.contains(&table) {
                    result.error(format!(
                        "table '{}' is created twice within the plan (second time in version {})",
                        table, migration.version
                    ));
                }
                created_in_plan.insert(table);
                estimated_growth += TABLE_OVERHEAD_BYTES;
            }
            for table in altered_tables(&migration.up) {
                if !existing.contains(&table) && !created_in_plan.contains(&table) {
                    result.warning(format!(
                        "version {} modifies table '{}' before any migration creates it",
                        migration.version, table
                    ));
                }
            }
            for table in dropped_tables(&migration.up) {
                if created_in_plan.contains(&table) {
                    result.warning(format!(
                        "table '{}' is created and then dropped within the same plan",
                        table
                    ));
                }
            }
            estimated_growth +=
                INSERT_ESTIMATE_BYTES * count_matches(insert_re(), &migration.up) as u64;

            if !created_indexes(&migration.up).is_empty() {
                result.suggestion(format!(
                    "version {} builds an index, which scans the whole table; \
                     expect memory and time proportional to row count",
                    migration.version
                ));
            }
            if has_unconditional_write(&migration.up) {
                result.suggestion(format!(
                    "version {} rewrites entire tables; on large data this is \
                     a long-running statement",
                    migration.version
                ));
            }
        }

        if store_size > 0 && estimated_growth > store_size / 2 {
            result.warning(format!(
                "plan may grow the store by ~{} bytes, more than half its current {} bytes",
                estimated_growth, store_size
            ));
            result.suggestion("check available disk space before applying");
        }

        Ok(result)
    }
}

/// Destructive statements found in a script, in order of appearance.
pub fn destructive_operations(sql: &str) -> Vec<String> {
    let mut found = Vec::new();
    for caps in destructive_re().captures_iter(sql) {
        if let Some(m) = caps.get(0) {
            found.push(m.as_str().trim().to_uppercase());
        }
    }
    found
}

/// Whether the script contains an UPDATE or DELETE with no WHERE clause.
pub fn has_unconditional_write(sql: &str) -> bool {
    for statement in split_statements(sql) {
        let upper = statement.to_uppercase();
        let is_write = upper.trim_start().starts_with("UPDATE")
            || upper.trim_start().starts_with("DELETE");
        if is_write && !upper.contains("WHERE") {
            return true;
        }
    }
    false
}

/// Tables created by CREATE TABLE statements, lowercased.
pub fn created_tables(sql: &str) -> HashSet<String> {
    capture_tables(create_table_re(), sql)
}

/// Tables dropped by DROP TABLE statements, lowercased.
pub fn dropped_tables(sql: &str) -> HashSet<String> {
    capture_tables(drop_table_re(), sql)
}

/// Tables altered by ALTER TABLE statements, lowercased.
pub fn altered_tables(sql: &str) -> HashSet<String> {
    capture_tables(alter_table_re(), sql)
}

/// Names of indexes created with an explicit name, lowercased.
pub fn created_indexes(sql: &str) -> HashSet<String> {
    capture_tables(create_index_re(), sql)
}

/// Statement-boundary split on `;`, ignoring blank fragments. Good enough for
/// migration scripts, which do not embed semicolons in literals.
fn split_statements(sql: &str) -> Vec<String> {
    sql.split(';')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty() && !s.starts_with("--"))
        .map(|s| s.to_string())
        .collect()
}

fn check_table_dependencies(
    sql: &str,
    existing: &HashSet<String>,
    result: &mut ValidationResult,
) {
    let created = created_tables(sql);
    let known = |table: &str| existing.contains(table) || created.contains(table);

    for table in altered_tables(sql) {
        if !known(&table) {
            result.error(format!("ALTER TABLE targets unknown table '{}'", table));
        }
    }
    for table in dropped_tables(sql) {
        if !known(&table) {
            result.error(format!("DROP TABLE targets unknown table '{}'", table));
        }
    }
    for table in capture_tables(index_target_re(), sql) {
        if !known(&table) {
            result.error(format!("CREATE INDEX targets unknown table '{}'", table));
        }
    }
    for table in capture_tables(insert_re(), sql) {
        if !known(&table) {
            result.error(format!("INSERT targets unknown table '{}'", table));
        }
    }
    for table in capture_tables(update_re(), sql) {
        if !known(&table) {
            result.error(format!("UPDATE targets unknown table '{}'", table));
        }
    }
}

fn capture_tables(re: &Regex, sql: &str) -> HashSet<String> {
    re.captures_iter(sql)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim_matches('"').to_lowercase())
        .collect()
}

fn count_matches(re: &Regex, sql: &str) -> usize {
    re.find_iter(sql).count()
}

fn truncate(statement: &str) -> String {
    let flat: String = statement.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > 60 {
        format!("{}...", flat.chars().take(60).collect::<String>())
    } else {
        flat
    }
}

macro_rules! static_regex {
    ($fn_name:ident, $pattern:literal) => {
        fn $fn_name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| Regex::new($pattern).expect("static pattern"))
        }
    };
}

static_regex!(
    create_table_re,
    r#"(?i)\bCREATE\s+TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?["]?([A-Za-z_][A-Za-z0-9_]*)"#
);
static_regex!(
    drop_table_re,
    r#"(?i)\bDROP\s+TABLE\s+(?:IF\s+EXISTS\s+)?["]?([A-Za-z_][A-Za-z0-9_]*)"#
);
static_regex!(
    alter_table_re,
    r#"(?i)\bALTER\s+TABLE\s+["]?([A-Za-z_][A-Za-z0-9_]*)"#
);
static_regex!(
    create_index_re,
    r#"(?i)\bCREATE\s+(?:UNIQUE\s+)?INDEX\s+(?:IF\s+NOT\s+EXISTS\s+)?["]?([A-Za-z_][A-Za-z0-9_]*)"#
);
static_regex!(
    index_target_re,
    r#"(?i)\bCREATE\s+(?:UNIQUE\s+)?INDEX\s+(?:IF\s+NOT\s+EXISTS\s+)?["]?[A-Za-z_][A-Za-z0-9_]*["]?\s+ON\s+["]?([A-Za-z_][A-Za-z0-9_]*)"#
);
static_regex!(
    insert_re,
    r#"(?i)\bINSERT\s+INTO\s+["]?([A-Za-z_][A-Za-z0-9_]*)"#
);
static_regex!(
    update_re,
    r#"(?i)\bUPDATE\s+["]?([A-Za-z_][A-Za-z0-9_]*)\s+SET\b"#
);
static_regex!(
    destructive_re,
    r#"(?i)\b(DROP\s+TABLE|DROP\s+COLUMN|TRUNCATE|DELETE\s+FROM)\b"#
);
static_regex!(
    creates_object_re,
    r#"(?i)^\s*CREATE\s+(?:TABLE|(?:UNIQUE\s+)?INDEX)\b"#
);
static_regex!(if_not_exists_re, r#"(?i)\bIF\s+NOT\s+EXISTS\b"#);
static_regex!(date_literal_re, r#"'\d{4}-\d{2}-\d{2}"#);
