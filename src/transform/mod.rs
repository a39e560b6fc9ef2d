//! # Data Transformer
//!
//! Row-level data migration: prioritized rules, batched writes, dry runs,
//! and cooperative cancellation. A rule reads typed rows from its source
//! table, maps each through a transform closure, optionally validates the
//! output against the original, and writes either in place or into a target
//! table.
//!
//! Each batch is one store transaction. A batch either commits whole or
//! counts whole as failed; row-level failures inside a batch keep the batch
//! from committing unless `continue_on_error` is set, in which case the
//! failing rows are dropped from the batch and recorded individually.

pub mod errors;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::errors::ShiftResult;
use crate::events::{EventBus, MigrationEvent};
use crate::progress::ProgressTracker;
use crate::store::{ConnectionPool, Role, Row, StoreHandle};
use errors::TransformError;

/// Rows per batch when a rule does not say otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 500;
/// Row errors retained per rule before truncation.
const MAX_ROW_ERRORS: usize = 100;
/// Page size for integrity sweeps.
const SCAN_BATCH: usize = 500;
/// Planning estimate: rows a rule gets through per second.
const ROWS_PER_SECOND_ESTIMATE: u64 = 2_000;
/// Planning estimate: fixed cost per committed batch.
const BATCH_OVERHEAD_MS: u64 = 5;

/// Maps one source row to its transformed shape. An `Err` fails the row.
pub type TransformFn = Arc<dyn Fn(&Row) -> Result<Row, String> + Send + Sync>;
/// Row predicate; rows it rejects are skipped, not failed.
pub type RowFilterFn = Arc<dyn Fn(&Row) -> bool + Send + Sync>;
/// `(original, transformed) -> bool`; `false` fails the row.
pub type RowValidatorFn = Arc<dyn Fn(&Row, &Row) -> bool + Send + Sync>;

/// One unit of data migration.
#[derive(Clone)]
pub struct TransformationRule {
    pub id: String,
    pub description: String,
    pub source_table: String,
    /// `None` rewrites rows in place; `Some` copies into another table
    pub target_table: Option<String>,
    /// Lower runs first
    pub priority: i32,
    pub batch_size: usize,
    pub filter: Option<RowFilterFn>,
    pub transform: TransformFn,
    pub validator: Option<RowValidatorFn>,
}

impl TransformationRule {
    pub fn new(id: impl Into<String>, source_table: impl Into<String>, transform: TransformFn) -> Self {
        let id = id.into();
        Self {
            description: id.clone(),
            id,
            source_table: source_table.into(),
            target_table: None,
            priority: 0,
            batch_size: DEFAULT_BATCH_SIZE,
            filter: None,
            transform,
            validator: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_target_table(mut self, table: impl Into<String>) -> Self {
        self.target_table = Some(table.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_filter(mut self, filter: RowFilterFn) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_validator(mut self, validator: RowValidatorFn) -> Self {
        self.validator = Some(validator);
        self
    }

    fn writes_cross_table(&self) -> bool {
        match &self.target_table {
            Some(target) => !target.eq_ignore_ascii_case(&self.source_table),
            None => false,
        }
    }
}

/// Execution options for a whole plan.
#[derive(Debug, Clone)]
pub struct TransformOptions {
    pub batch_size_override: Option<usize>,
    /// Keep going past failing rows and zero-success rules
    pub continue_on_error: bool,
    /// Run rule validators on every transformed row
    pub validate_each: bool,
    /// Walk every row and batch without writing anything
    pub dry_run: bool,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            batch_size_override: None,
            continue_on_error: false,
            validate_each: true,
            dry_run: false,
        }
    }
}

/// One rule as placed in a plan, with its row count at planning time.
#[derive(Clone)]
pub struct PlannedRule {
    pub rule: TransformationRule,
    pub row_count: u64,
    pub batches: usize,
}

/// Ordered, costed set of rules ready to execute.
#[derive(Clone)]
pub struct TransformPlan {
    pub rules: Vec<PlannedRule>,
    pub total_rows: u64,
    pub estimated_duration_ms: u64,
    /// True when any rule copies across tables while readers may be live
    pub requires_downtime: bool,
}

/// One failed row, bounded per rule by truncation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowError {
    pub rule_id: String,
    pub rowid: Option<u64>,
    pub message: String,
}

/// Outcome of one rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransformationResult {
    pub rule_id: String,
    pub table: String,
    pub processed: u64,
    pub successful: u64,
    pub failed: u64,
    pub skipped: u64,
    pub batches_committed: usize,
    pub entire_batch_failures: usize,
    pub row_errors: Vec<RowError>,
    pub errors_truncated: bool,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl TransformationResult {
    fn record_row_error(&mut self, rule_id: &str, rowid: Option<u64>, message: String) {
        self.failed += 1;
        if self.row_errors.len() < MAX_ROW_ERRORS {
            self.row_errors.push(RowError {
                rule_id: rule_id.to_string(),
                rowid,
                message,
            });
        } else {
            self.errors_truncated = true;
        }
    }
}

/// Caller-supplied post-transformation assertion.
#[derive(Clone)]
pub struct IntegrityCheck {
    pub name: String,
    pub table: String,
    /// Exact row count the table must have
    pub expected_rows: Option<u64>,
    /// Must hold for every row in the table
    pub assertion: Option<RowFilterFn>,
}

/// Outcome of [`DataTransformer::validate_data_integrity`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrityOutcome {
    pub passed: bool,
    pub failures: Vec<String>,
}

/// Executes transformation plans against the store's writer handle.
pub struct DataTransformer {
    pool: Arc<dyn ConnectionPool>,
    events: Arc<EventBus>,
    cancelled: AtomicBool,
}

impl DataTransformer {
    pub fn new(pool: Arc<dyn ConnectionPool>, events: Arc<EventBus>) -> Self {
        Self {
            pool,
            events,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Request cancellation; honored at the next batch boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Order rules by priority, count their rows, and cost the run.
    pub fn create_plan(&self, rules: Vec<TransformationRule>) -> ShiftResult<TransformPlan> {
        let reader = self.pool.acquire(Role::Reader)?;
        let planned = self.plan_rules(reader.as_ref(), rules);
        self.pool.release(reader);
        planned
    }

    fn plan_rules(
        &self,
        handle: &dyn StoreHandle,
        mut rules: Vec<TransformationRule>,
    ) -> ShiftResult<TransformPlan> {
        rules.sort_by_key(|r| r.priority);

        let mut planned = Vec::with_capacity(rules.len());
        let mut total_rows = 0u64;
        let mut estimated_duration_ms = 0u64;
        let mut requires_downtime = false;

        for rule in rules {
            let row_count = handle.row_count(&rule.source_table).map_err(|_| {
                TransformError::UnknownTable {
                    rule_id: rule.id.clone(),
                    table: rule.source_table.clone(),
                }
            })?;
            let batches = (row_count as usize).div_ceil(rule.batch_size.max(1));
            total_rows += row_count;
            estimated_duration_ms +=
                row_count * 1000 / ROWS_PER_SECOND_ESTIMATE + batches as u64 * BATCH_OVERHEAD_MS;
            requires_downtime |= rule.writes_cross_table();
            planned.push(PlannedRule {
                rule,
                row_count,
                batches,
            });
        }

        Ok(TransformPlan {
            rules: planned,
            total_rows,
            estimated_duration_ms,
            requires_downtime,
        })
    }

    /// Execute every rule in plan order.
    ///
    /// Stops early when a rule processes rows but lands zero successes (the
    /// data clearly does not match expectations) unless `continue_on_error`
    /// is set, and at the next batch boundary after [`cancel`](Self::cancel).
    pub async fn execute_plan(
        &self,
        plan: &TransformPlan,
        options: &TransformOptions,
        progress: Option<&ProgressTracker>,
    ) -> ShiftResult<Vec<TransformationResult>> {
        self.cancelled.store(false, Ordering::SeqCst);

        let writer = self.pool.acquire(Role::Writer)?;
        let mut results = Vec::new();
        let mut processed_total = 0u64;

        for planned in &plan.rules {
            let result =
                self.execute_rule(writer.as_ref(), planned, options, progress, &mut processed_total);
            let result = match result {
                Ok(result) => result,
                Err(e) => {
                    self.pool.release(writer);
                    return Err(e);
                }
            };

            self.events.emit(MigrationEvent::RuleCompleted {
                rule_id: result.rule_id.clone(),
                processed: result.processed,
                successful: result.successful,
                failed: result.failed,
            });

            let exhausted = result.processed > 0 && result.successful == 0;
            let cancelled = result.cancelled;
            results.push(result);
            if cancelled || (exhausted && !options.continue_on_error) {
                break;
            }

            // Yield between rules so a long plan never starves the runtime.
            tokio::task::yield_now().await;
        }

        self.pool.release(writer);
        Ok(results)
    }

    fn execute_rule(
        &self,
        handle: &dyn StoreHandle,
        planned: &PlannedRule,
        options: &TransformOptions,
        progress: Option<&ProgressTracker>,
        processed_total: &mut u64,
    ) -> ShiftResult<TransformationResult> {
        let rule = &planned.rule;
        let started = Instant::now();
        let batch_size = options
            .batch_size_override
            .unwrap_or(rule.batch_size)
            .max(1);

        // Source must exist; a missing target surfaces on the first write.
        handle
            .row_count(&rule.source_table)
            .map_err(|_| TransformError::UnknownTable {
                rule_id: rule.id.clone(),
                table: rule.source_table.clone(),
            })?;

        self.events.emit(MigrationEvent::RuleStarted {
            rule_id: rule.id.clone(),
            table: rule.source_table.clone(),
        });

        let mut result = TransformationResult {
            rule_id: rule.id.clone(),
            table: rule.source_table.clone(),
            ..Default::default()
        };

        let mut offset = 0usize;
        let mut batch_no = 0usize;

        'batches: loop {
            if self.cancelled.load(Ordering::SeqCst) {
                result.cancelled = true;
                break;
            }

            let rows = handle.select_rows(&rule.source_table, offset, batch_size)?;
            if rows.is_empty() {
                break;
            }
            batch_no += 1;

            let mut outgoing: Vec<Row> = Vec::with_capacity(rows.len());
            for (index, row) in rows.iter().enumerate() {
                if let Some(filter) = &rule.filter {
                    if !filter(row) {
                        result.skipped += 1;
                        continue;
                    }
                }
                result.processed += 1;
                *processed_total += 1;

                let failure = match (rule.transform)(row) {
                    Ok(transformed) => {
                        let valid = match (&rule.validator, options.validate_each) {
                            (Some(validator), true) => validator(row, &transformed),
                            _ => true,
                        };
                        if valid {
                            outgoing.push(carry_rowid(row, transformed));
                            None
                        } else {
                            Some("validator rejected transformed row".to_string())
                        }
                    }
                    Err(message) => Some(message),
                };

                if let Some(message) = failure {
                    result.record_row_error(&rule.id, rowid_of(row), message);
                    if !options.continue_on_error {
                        // The whole uncommitted batch counts as failed, along
                        // with every matching row not yet reached.
                        result.failed += outgoing.len() as u64;
                        result.failed += count_matching(
                            handle,
                            rule,
                            &rows[index + 1..],
                            offset + rows.len(),
                            batch_size,
                        )?;
                        break 'batches;
                    }
                }
            }

            if !outgoing.is_empty() {
                if options.dry_run {
                    result.successful += outgoing.len() as u64;
                    result.batches_committed += 1;
                } else {
                    let written = match &rule.target_table {
                        Some(target) if rule.writes_cross_table() => {
                            handle.insert_rows(target, &outgoing)
                        }
                        _ => handle.update_rows(&rule.source_table, &outgoing),
                    };
                    match written {
                        Ok(()) => {
                            result.successful += outgoing.len() as u64;
                            result.batches_committed += 1;
                        }
                        Err(e) => {
                            result.entire_batch_failures += 1;
                            result.failed += outgoing.len() as u64;
                            if !options.continue_on_error {
                                result.failed += count_matching(
                                    handle,
                                    rule,
                                    &[],
                                    offset + rows.len(),
                                    batch_size,
                                )?;
                                result.row_errors.push(RowError {
                                    rule_id: rule.id.clone(),
                                    rowid: None,
                                    message: format!("batch {} failed: {}", batch_no, e),
                                });
                                break;
                            }
                        }
                    }
                }
            }

            self.events.emit(MigrationEvent::BatchCompleted {
                rule_id: rule.id.clone(),
                batch: batch_no,
                total_batches: planned.batches.max(batch_no),
            });
            if let Some(tracker) = progress {
                tracker.update_progress(*processed_total);
            }

            offset += rows.len();
        }

        result.duration_ms = started.elapsed().as_millis() as u64;
        Ok(result)
    }

    /// Run caller assertions plus a NOT NULL sweep over every table.
    pub fn validate_data_integrity(
        &self,
        checks: &[IntegrityCheck],
    ) -> ShiftResult<IntegrityOutcome> {
        let reader = self.pool.acquire(Role::Reader)?;
        let outcome = self.integrity_checks(reader.as_ref(), checks);
        self.pool.release(reader);
        outcome
    }

    fn integrity_checks(
        &self,
        handle: &dyn StoreHandle,
        checks: &[IntegrityCheck],
    ) -> ShiftResult<IntegrityOutcome> {
        let mut failures = Vec::new();

        for check in checks {
            let count = match handle.row_count(&check.table) {
                Ok(count) => count,
                Err(_) => {
                    failures.push(format!(
                        "check '{}': table '{}' does not exist",
                        check.name, check.table
                    ));
                    continue;
                }
            };
            if let Some(expected) = check.expected_rows {
                if count != expected {
                    failures.push(format!(
                        "check '{}': expected {} rows in '{}', found {}",
                        check.name, expected, check.table, count
                    ));
                }
            }
            if let Some(assertion) = &check.assertion {
                let mut offset = 0;
                loop {
                    let rows = handle.select_rows(&check.table, offset, SCAN_BATCH)?;
                    if rows.is_empty() {
                        break;
                    }
                    for row in &rows {
                        if !assertion(row) {
                            failures.push(format!(
                                "check '{}': assertion failed for row {:?} in '{}'",
                                check.name,
                                rowid_of(row),
                                check.table
                            ));
                        }
                    }
                    offset += rows.len();
                }
            }
        }

        // NOT NULL sweep: every non-nullable, non-key column must carry a
        // value in every row.
        for table in handle.list_tables()? {
            let required: Vec<String> = handle
                .table_columns(&table)?
                .into_iter()
                .filter(|c| !c.nullable && !c.primary_key)
                .map(|c| c.name)
                .collect();
            if required.is_empty() {
                continue;
            }
            let mut offset = 0;
            loop {
                let rows = handle.select_rows(&table, offset, SCAN_BATCH)?;
                if rows.is_empty() {
                    break;
                }
                for row in &rows {
                    for column in &required {
                        let missing = match row.get(column) {
                            Some(value) => value.is_null(),
                            None => true,
                        };
                        if missing {
                            failures.push(format!(
                                "NOT NULL violated: {}.{} in row {:?}",
                                table,
                                column,
                                rowid_of(row)
                            ));
                        }
                    }
                }
                offset += rows.len();
            }
        }

        Ok(IntegrityOutcome {
            passed: failures.is_empty(),
            failures,
        })
    }
}

fn rowid_of(row: &Row) -> Option<u64> {
    row.get(crate::store::ROWID_COLUMN).and_then(|v| v.as_u64())
}

/// Transformed rows keep their source rowid so in-place updates can address
/// them. Inserts ignore the column.
fn carry_rowid(original: &Row, mut transformed: Row) -> Row {
    if let Some(rowid) = original.get(crate::store::ROWID_COLUMN) {
        transformed.insert(crate::store::ROWID_COLUMN.to_string(), rowid.clone());
    }
    transformed
}

/// Count filter-matching rows in the rest of the current batch plus every
/// later page. Used to account failed rows after an abort.
fn count_matching(
    handle: &dyn StoreHandle,
    rule: &TransformationRule,
    rest_of_batch: &[Row],
    mut offset: usize,
    batch_size: usize,
) -> ShiftResult<u64> {
    let matches = |row: &Row| rule.filter.as_ref().map(|f| f(row)).unwrap_or(true);

    let mut count = rest_of_batch.iter().filter(|r| matches(r)).count() as u64;
    loop {
        let rows = handle.select_rows(&rule.source_table, offset, batch_size)?;
        if rows.is_empty() {
            break;
        }
        count += rows.iter().filter(|r| matches(r)).count() as u64;
        offset += rows.len();
    }
    Ok(count)
}
