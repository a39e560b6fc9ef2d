//! # In-Memory Store
//!
//! Test-grade implementation of the store collaborator seams: an in-memory
//! SQLite-flavored catalog plus a matching backup engine. Used by unit tests
//! and by rollback rehearsals against throwaway copies.
//!
//! DDL statements (CREATE/DROP/ALTER TABLE, CREATE/DROP INDEX) mutate the
//! catalog; DML statements are parsed and accepted but row data enters only
//! through the typed row API, which is what the data transformer uses.
//! `execute_batch` is transactional: statements apply to a working copy of
//! the catalog that replaces the live one only if every statement succeeds.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use sqlparser::ast::{self, AlterTableOperation, ColumnOption, ObjectType, Statement};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;
use uuid::Uuid;

use crate::checksum::compute_checksum;
use crate::errors::{MigrationError, ShiftResult};
use crate::store::{
    BackupEngine, ColumnInfo, FkViolation, ForeignKeyInfo, IndexInfo, Row, StoreHandle,
    ROWID_COLUMN,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TableState {
    name: String,
    columns: Vec<ColumnInfo>,
    foreign_keys: Vec<ForeignKeyInfo>,
    rows: Vec<(u64, Row)>,
    next_rowid: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Catalog {
    /// Keyed by lowercased table name; SQLite identifiers are case-insensitive.
    tables: BTreeMap<String, TableState>,
    indexes: BTreeMap<String, IndexInfo>,
}

/// In-memory SQLite-flavored store.
pub struct MemoryStore {
    catalog: Arc<RwLock<Catalog>>,
    /// Fault injection: next N `execute_batch` calls fail with a transient
    /// busy condition.
    transient_failures: AtomicUsize,
    /// Fault injection: `execute_batch` fails when the script contains this
    /// substring.
    fail_on_pattern: RwLock<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            catalog: Arc::new(RwLock::new(Catalog::default())),
            transient_failures: AtomicUsize::new(0),
            fail_on_pattern: RwLock::new(None),
        }
    }

    /// Make the next `count` script executions fail with a retryable busy
    /// condition.
    pub fn inject_transient_failures(&self, count: usize) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Fail any script containing `pattern` with a non-retryable store error.
    pub fn fail_when_sql_contains(&self, pattern: &str) {
        *self.fail_on_pattern.write().unwrap() = Some(pattern.to_string());
    }

    pub fn clear_failure_pattern(&self) {
        *self.fail_on_pattern.write().unwrap() = None;
    }

    /// Serialize the full catalog; consumed by [`MemoryBackupEngine`].
    pub fn export_state(&self) -> ShiftResult<String> {
        let catalog = self.catalog.read().unwrap();
        serde_json::to_string(&*catalog).map_err(|e| MigrationError::internal(e.to_string()))
    }

    /// Replace the full catalog from a serialized snapshot.
    pub fn import_state(&self, state: &str) -> ShiftResult<()> {
        let restored: Catalog =
            serde_json::from_str(state).map_err(|e| MigrationError::internal(e.to_string()))?;
        *self.catalog.write().unwrap() = restored;
        Ok(())
    }

    fn parse(&self, sql: &str) -> ShiftResult<Vec<Statement>> {
        Parser::parse_sql(&SQLiteDialect {}, sql).map_err(|e| MigrationError::Syntax {
            statement: sql.chars().take(80).collect(),
            message: e.to_string(),
        })
    }

    fn apply(&self, catalog: &mut Catalog, stmt: Statement) -> ShiftResult<()> {
        match stmt {
            Statement::CreateTable(ct) => create_table(catalog, ct),
            Statement::CreateIndex(ci) => create_index(catalog, ci),
            Statement::AlterTable {
                name, operations, ..
            } => alter_table(catalog, &object_name(&name), operations),
            Statement::Drop {
                object_type,
                if_exists,
                names,
                ..
            } => drop_objects(catalog, object_type, if_exists, &names),
            // Row data enters through the typed row API; DML is validated by
            // the parse above and otherwise accepted without effect.
            _ => Ok(()),
        }
    }

    fn with_table<T>(
        &self,
        table: &str,
        f: impl FnOnce(&TableState) -> T,
    ) -> ShiftResult<T> {
        let catalog = self.catalog.read().unwrap();
        let state = catalog
            .tables
            .get(&table_key(table))
            .ok_or_else(|| MigrationError::store(format!("no such table: {}", table)))?;
        Ok(f(state))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn table_key(name: &str) -> String {
    name.trim_matches('"').to_ascii_lowercase()
}

fn object_name(name: &ast::ObjectName) -> String {
    name.0
        .last()
        .map(|part| part.to_string().trim_matches('"').to_string())
        .unwrap_or_default()
}

fn column_info(def: &ast::ColumnDef) -> ColumnInfo {
    let not_null = def
        .options
        .iter()
        .any(|opt| matches!(opt.option, ColumnOption::NotNull));
    let primary_key = def.options.iter().any(|opt| {
        matches!(
            opt.option,
            ColumnOption::Unique {
                is_primary: true,
                ..
            }
        )
    });
    let default = def.options.iter().find_map(|opt| match &opt.option {
        ColumnOption::Default(expr) => Some(expr.to_string()),
        _ => None,
    });
    ColumnInfo {
        name: def.name.value.clone(),
        data_type: def.data_type.to_string(),
        nullable: !not_null && !primary_key,
        default,
        primary_key,
    }
}

fn create_table(catalog: &mut Catalog, ct: ast::CreateTable) -> ShiftResult<()> {
    let name = object_name(&ct.name);
    let key = table_key(&name);
    if catalog.tables.contains_key(&key) {
        if ct.if_not_exists {
            return Ok(());
        }
        return Err(MigrationError::store(format!(
            "table {} already exists",
            name
        )));
    }

    let columns: Vec<ColumnInfo> = ct.columns.iter().map(column_info).collect();

    let mut foreign_keys = Vec::new();
    for def in &ct.columns {
        for opt in &def.options {
            if let ColumnOption::ForeignKey {
                foreign_table,
                referred_columns,
                ..
            } = &opt.option
            {
                foreign_keys.push(ForeignKeyInfo {
                    table: name.clone(),
                    columns: vec![def.name.value.clone()],
                    referenced_table: object_name(foreign_table),
                    referenced_columns: referred_columns
                        .iter()
                        .map(|c| c.value.clone())
                        .collect(),
                });
            }
        }
    }
    for constraint in &ct.constraints {
        if let ast::TableConstraint::ForeignKey {
            columns,
            foreign_table,
            referred_columns,
            ..
        } = constraint
        {
            foreign_keys.push(ForeignKeyInfo {
                table: name.clone(),
                columns: columns.iter().map(|c| c.value.clone()).collect(),
                referenced_table: object_name(foreign_table),
                referenced_columns: referred_columns.iter().map(|c| c.value.clone()).collect(),
            });
        }
    }

    catalog.tables.insert(
        key,
        TableState {
            name,
            columns,
            foreign_keys,
            rows: Vec::new(),
            next_rowid: 1,
        },
    );
    Ok(())
}

fn create_index(catalog: &mut Catalog, ci: ast::CreateIndex) -> ShiftResult<()> {
    let table = object_name(&ci.table_name);
    if !catalog.tables.contains_key(&table_key(&table)) {
        return Err(MigrationError::store(format!("no such table: {}", table)));
    }

    let columns: Vec<String> = ci
        .columns
        .iter()
        .map(|c| match &c.column.expr {
            ast::Expr::Identifier(ident) => ident.value.clone(),
            other => other.to_string(),
        })
        .collect();

    let index_name = match &ci.name {
        Some(name) => object_name(name),
        None => format!("idx_{}_{}", table, columns.join("_")),
    };
    let key = index_name.to_ascii_lowercase();

    if catalog.indexes.contains_key(&key) {
        if ci.if_not_exists {
            return Ok(());
        }
        return Err(MigrationError::store(format!(
            "index {} already exists",
            index_name
        )));
    }

    catalog.indexes.insert(
        key,
        IndexInfo {
            name: index_name,
            table,
            columns,
            unique: ci.unique,
        },
    );
    Ok(())
}

fn alter_table(
    catalog: &mut Catalog,
    table: &str,
    operations: Vec<AlterTableOperation>,
) -> ShiftResult<()> {
    let key = table_key(table);
    if !catalog.tables.contains_key(&key) {
        return Err(MigrationError::store(format!("no such table: {}", table)));
    }

    for op in operations {
        let state = catalog.tables.get_mut(&key).expect("checked above");
        match op {
            AlterTableOperation::AddColumn { column_def, .. } => {
                let column = column_info(&column_def);
                if state
                    .columns
                    .iter()
                    .any(|c| c.name.eq_ignore_ascii_case(&column.name))
                {
                    return Err(MigrationError::store(format!(
                        "duplicate column name: {}",
                        column.name
                    )));
                }
                state.columns.push(column);
            }
            AlterTableOperation::DropColumn { column_names, .. } => {
                for ident in &column_names {
                    let dropped = ident.value.clone();
                    if !state
                        .columns
                        .iter()
                        .any(|c| c.name.eq_ignore_ascii_case(&dropped))
                    {
                        return Err(MigrationError::store(format!(
                            "no such column: {}",
                            dropped
                        )));
                    }
                    state
                        .columns
                        .retain(|c| !c.name.eq_ignore_ascii_case(&dropped));
                    for (_, row) in state.rows.iter_mut() {
                        row.remove(&dropped);
                    }
                }
            }
            AlterTableOperation::RenameColumn {
                old_column_name,
                new_column_name,
            } => {
                let old = old_column_name.value;
                let new = new_column_name.value;
                let column = state
                    .columns
                    .iter_mut()
                    .find(|c| c.name.eq_ignore_ascii_case(&old))
                    .ok_or_else(|| {
                        MigrationError::store(format!("no such column: {}", old))
                    })?;
                column.name = new.clone();
                for (_, row) in state.rows.iter_mut() {
                    if let Some(value) = row.remove(&old) {
                        row.insert(new.clone(), value);
                    }
                }
            }
            AlterTableOperation::RenameTable { table_name } => {
                let renamed = match table_name {
                    ast::RenameTableNameKind::To(name) | ast::RenameTableNameKind::As(name) => {
                        name
                    }
                };
                let new_name = object_name(&renamed);
                let new_key = table_key(&new_name);
                if catalog.tables.contains_key(&new_key) {
                    return Err(MigrationError::store(format!(
                        "table {} already exists",
                        new_name
                    )));
                }
                let mut moved = catalog.tables.remove(&key).expect("checked above");
                moved.name = new_name;
                catalog.tables.insert(new_key, moved);
                // Nothing further can target the old name in this batch
                return Ok(());
            }
            // Constraint and storage-parameter alterations have no catalog
            // effect in the test-grade store.
            _ => {}
        }
    }
    Ok(())
}

fn drop_objects(
    catalog: &mut Catalog,
    object_type: ObjectType,
    if_exists: bool,
    names: &[ast::ObjectName],
) -> ShiftResult<()> {
    for name in names {
        let name = object_name(name);
        match object_type {
            ObjectType::Table => {
                let key = table_key(&name);
                if catalog.tables.remove(&key).is_none() && !if_exists {
                    return Err(MigrationError::store(format!("no such table: {}", name)));
                }
                catalog
                    .indexes
                    .retain(|_, idx| !idx.table.eq_ignore_ascii_case(&name));
            }
            ObjectType::Index => {
                if catalog.indexes.remove(&name.to_ascii_lowercase()).is_none() && !if_exists {
                    return Err(MigrationError::store(format!("no such index: {}", name)));
                }
            }
            _ => {
                return Err(MigrationError::store(format!(
                    "unsupported DROP object type: {:?}",
                    object_type
                )))
            }
        }
    }
    Ok(())
}

impl StoreHandle for MemoryStore {
    fn execute_batch(&self, sql: &str) -> ShiftResult<()> {
        loop {
            let remaining = self.transient_failures.load(Ordering::SeqCst);
            if remaining == 0 {
                break;
            }
            if self
                .transient_failures
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Err(MigrationError::TransientStore {
                    message: "database is locked".to_string(),
                });
            }
        }

        if let Some(pattern) = self.fail_on_pattern.read().unwrap().as_deref() {
            if sql.contains(pattern) {
                return Err(MigrationError::store(format!(
                    "injected failure on pattern '{}'",
                    pattern
                )));
            }
        }

        let statements = self.parse(sql)?;

        // Transactional: build the result on a working copy, swap on success.
        let mut work = self.catalog.read().unwrap().clone();
        for stmt in statements {
            self.apply(&mut work, stmt)?;
        }
        *self.catalog.write().unwrap() = work;
        Ok(())
    }

    fn list_tables(&self) -> ShiftResult<Vec<String>> {
        let catalog = self.catalog.read().unwrap();
        Ok(catalog.tables.values().map(|t| t.name.clone()).collect())
    }

    fn table_columns(&self, table: &str) -> ShiftResult<Vec<ColumnInfo>> {
        self.with_table(table, |t| t.columns.clone())
    }

    fn table_indexes(&self, table: &str) -> ShiftResult<Vec<IndexInfo>> {
        let catalog = self.catalog.read().unwrap();
        if !catalog.tables.contains_key(&table_key(table)) {
            return Err(MigrationError::store(format!("no such table: {}", table)));
        }
        Ok(catalog
            .indexes
            .values()
            .filter(|idx| idx.table.eq_ignore_ascii_case(table))
            .cloned()
            .collect())
    }

    fn foreign_keys(&self, table: &str) -> ShiftResult<Vec<ForeignKeyInfo>> {
        self.with_table(table, |t| t.foreign_keys.clone())
    }

    fn row_count(&self, table: &str) -> ShiftResult<u64> {
        self.with_table(table, |t| t.rows.len() as u64)
    }

    fn select_rows(&self, table: &str, offset: usize, limit: usize) -> ShiftResult<Vec<Row>> {
        self.with_table(table, |t| {
            t.rows
                .iter()
                .skip(offset)
                .take(limit)
                .map(|(rowid, row)| {
                    let mut out = row.clone();
                    out.insert(ROWID_COLUMN.to_string(), serde_json::json!(rowid));
                    out
                })
                .collect()
        })
    }

    fn insert_rows(&self, table: &str, rows: &[Row]) -> ShiftResult<()> {
        let mut catalog = self.catalog.write().unwrap();
        let state = catalog
            .tables
            .get_mut(&table_key(table))
            .ok_or_else(|| MigrationError::store(format!("no such table: {}", table)))?;

        // Validate the whole batch before touching anything: all-or-nothing.
        let required: Vec<&ColumnInfo> = state
            .columns
            .iter()
            .filter(|c| !c.nullable && c.default.is_none() && !c.primary_key)
            .collect();
        for row in rows {
            for column in &required {
                match row.get(&column.name) {
                    Some(value) if !value.is_null() => {}
                    _ => {
                        return Err(MigrationError::store(format!(
                            "NOT NULL constraint failed: {}.{}",
                            table, column.name
                        )))
                    }
                }
            }
        }

        for row in rows {
            let mut stored = row.clone();
            stored.remove(ROWID_COLUMN);
            let rowid = state.next_rowid;
            state.next_rowid += 1;
            state.rows.push((rowid, stored));
        }
        Ok(())
    }

    fn update_rows(&self, table: &str, rows: &[Row]) -> ShiftResult<()> {
        let mut catalog = self.catalog.write().unwrap();
        let state = catalog
            .tables
            .get_mut(&table_key(table))
            .ok_or_else(|| MigrationError::store(format!("no such table: {}", table)))?;

        // Resolve every target rowid before mutating: all-or-nothing.
        let mut updates = Vec::with_capacity(rows.len());
        for row in rows {
            let rowid = row
                .get(ROWID_COLUMN)
                .and_then(|v| v.as_u64())
                .ok_or_else(|| {
                    MigrationError::store(format!(
                        "update on {} requires {} in every row",
                        table, ROWID_COLUMN
                    ))
                })?;
            let position = state
                .rows
                .iter()
                .position(|(id, _)| *id == rowid)
                .ok_or_else(|| {
                    MigrationError::store(format!("no row {} in table {}", rowid, table))
                })?;
            updates.push((position, row.clone()));
        }

        for (position, mut row) in updates {
            row.remove(ROWID_COLUMN);
            state.rows[position].1 = row;
        }
        Ok(())
    }

    fn fk_violations(&self) -> ShiftResult<Vec<FkViolation>> {
        let catalog = self.catalog.read().unwrap();
        let mut violations = Vec::new();

        for state in catalog.tables.values() {
            for fk in &state.foreign_keys {
                let parent = match catalog.tables.get(&table_key(&fk.referenced_table)) {
                    Some(parent) => parent,
                    None => {
                        // Referenced table missing: every non-null child value
                        // is a violation.
                        for (_, row) in &state.rows {
                            for column in &fk.columns {
                                if let Some(value) = row.get(column) {
                                    if !value.is_null() {
                                        violations.push(FkViolation {
                                            table: state.name.clone(),
                                            column: column.clone(),
                                            value: value.clone(),
                                            referenced_table: fk.referenced_table.clone(),
                                        });
                                    }
                                }
                            }
                        }
                        continue;
                    }
                };

                for (column, referenced) in fk.columns.iter().zip(fk.referenced_columns.iter()) {
                    for (_, row) in &state.rows {
                        let value = match row.get(column) {
                            Some(v) if !v.is_null() => v,
                            _ => continue,
                        };
                        let found = parent
                            .rows
                            .iter()
                            .any(|(_, parent_row)| parent_row.get(referenced) == Some(value));
                        if !found {
                            violations.push(FkViolation {
                                table: state.name.clone(),
                                column: column.clone(),
                                value: value.clone(),
                                referenced_table: fk.referenced_table.clone(),
                            });
                        }
                    }
                }
            }
        }
        Ok(violations)
    }

    fn size_bytes(&self) -> ShiftResult<u64> {
        Ok(self.export_state()?.len() as u64)
    }

    fn content_checksum(&self) -> ShiftResult<String> {
        Ok(compute_checksum(&self.export_state()?))
    }

    fn scratch_copy(&self) -> ShiftResult<Arc<dyn StoreHandle>> {
        let copy = MemoryStore::new();
        *copy.catalog.write().unwrap() = self.catalog.read().unwrap().clone();
        Ok(Arc::new(copy))
    }
}

/// Backup engine over a [`MemoryStore`]: snapshots are serialized catalogs.
pub struct MemoryBackupEngine {
    store: Arc<MemoryStore>,
    snapshots: RwLock<HashMap<String, String>>,
    /// Fault injection: fail the next snapshot request.
    fail_next_snapshot: AtomicUsize,
}

impl MemoryBackupEngine {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            snapshots: RwLock::new(HashMap::new()),
            fail_next_snapshot: AtomicUsize::new(0),
        }
    }

    pub fn inject_snapshot_failures(&self, count: usize) {
        self.fail_next_snapshot.store(count, Ordering::SeqCst);
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.read().unwrap().len()
    }
}

impl BackupEngine for MemoryBackupEngine {
    fn snapshot(&self, label: &str) -> ShiftResult<String> {
        if self.fail_next_snapshot.load(Ordering::SeqCst) > 0 {
            self.fail_next_snapshot.fetch_sub(1, Ordering::SeqCst);
            return Err(MigrationError::store("injected snapshot failure"));
        }
        let path = format!("mem://{}/{}", label, Uuid::new_v4());
        let state = self.store.export_state()?;
        self.snapshots.write().unwrap().insert(path.clone(), state);
        Ok(path)
    }

    fn restore(&self, path: &str) -> ShiftResult<()> {
        let snapshots = self.snapshots.read().unwrap();
        let state = snapshots
            .get(path)
            .ok_or_else(|| MigrationError::store(format!("no snapshot at {}", path)))?;
        self.store.import_state(state)
    }

    fn delete(&self, path: &str) -> ShiftResult<()> {
        self.snapshots.write().unwrap().remove(path);
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        self.snapshots.read().unwrap().contains_key(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_users() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .execute_batch(
                "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL, name TEXT)",
            )
            .unwrap();
        store
    }

    #[test]
    fn test_create_table_and_columns() {
        let store = store_with_users();
        assert_eq!(store.list_tables().unwrap(), vec!["users".to_string()]);

        let columns = store.table_columns("users").unwrap();
        assert_eq!(columns.len(), 3);
        assert!(columns[0].primary_key);
        assert!(!columns[1].nullable);
        assert!(columns[2].nullable);
    }

    #[test]
    fn test_duplicate_table_fails() {
        let store = store_with_users();
        let result = store.execute_batch("CREATE TABLE users (id INTEGER)");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("already exists"));
    }

    #[test]
    fn test_batch_is_atomic() {
        let store = store_with_users();
        // Second statement fails, first must not take effect.
        let result = store.execute_batch(
            "CREATE TABLE posts (id INTEGER); CREATE TABLE users (id INTEGER)",
        );
        assert!(result.is_err());
        assert_eq!(store.list_tables().unwrap(), vec!["users".to_string()]);
    }

    #[test]
    fn test_alter_table_add_and_drop_column() {
        let store = store_with_users();
        store
            .execute_batch("ALTER TABLE users ADD COLUMN age INTEGER")
            .unwrap();
        assert_eq!(store.table_columns("users").unwrap().len(), 4);

        store
            .execute_batch("ALTER TABLE users DROP COLUMN age")
            .unwrap();
        assert_eq!(store.table_columns("users").unwrap().len(), 3);
    }

    #[test]
    fn test_alter_table_rename() {
        let store = store_with_users();
        store
            .execute_batch("ALTER TABLE users RENAME TO accounts")
            .unwrap();
        assert_eq!(store.list_tables().unwrap(), vec!["accounts".to_string()]);
        assert_eq!(store.table_columns("accounts").unwrap().len(), 3);
        assert!(store.table_columns("users").is_err());
    }

    #[test]
    fn test_create_and_drop_index() {
        let store = store_with_users();
        store
            .execute_batch("CREATE UNIQUE INDEX idx_users_email ON users(email)")
            .unwrap();

        let indexes = store.table_indexes("users").unwrap();
        assert_eq!(indexes.len(), 1);
        assert_eq!(indexes[0].name, "idx_users_email");
        assert!(indexes[0].unique);

        store.execute_batch("DROP INDEX idx_users_email").unwrap();
        assert!(store.table_indexes("users").unwrap().is_empty());
    }

    #[test]
    fn test_drop_table_removes_indexes() {
        let store = store_with_users();
        store
            .execute_batch("CREATE INDEX idx_users_name ON users(name)")
            .unwrap();
        store.execute_batch("DROP TABLE users").unwrap();
        assert!(store.list_tables().unwrap().is_empty());
    }

    #[test]
    fn test_syntax_error_rejected() {
        let store = MemoryStore::new();
        let result = store.execute_batch("CREAT TABLE broken (id)");
        assert!(matches!(
            result,
            Err(MigrationError::Syntax { .. })
        ));
    }

    #[test]
    fn test_typed_rows_round_trip() {
        let store = store_with_users();
        let mut row = Row::new();
        row.insert("id".to_string(), serde_json::json!(1));
        row.insert("email".to_string(), serde_json::json!("a@example.com"));
        store.insert_rows("users", &[row]).unwrap();

        assert_eq!(store.row_count("users").unwrap(), 1);

        let mut selected = store.select_rows("users", 0, 10).unwrap();
        assert_eq!(selected.len(), 1);
        assert!(selected[0].contains_key(ROWID_COLUMN));

        selected[0].insert("name".to_string(), serde_json::json!("Ada"));
        store.update_rows("users", &selected).unwrap();

        let updated = store.select_rows("users", 0, 10).unwrap();
        assert_eq!(updated[0]["name"], serde_json::json!("Ada"));
    }

    #[test]
    fn test_insert_enforces_not_null() {
        let store = store_with_users();
        let mut row = Row::new();
        row.insert("id".to_string(), serde_json::json!(1));
        // email is NOT NULL and missing
        let result = store.insert_rows("users", &[row]);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("NOT NULL"));
        assert_eq!(store.row_count("users").unwrap(), 0);
    }

    #[test]
    fn test_fk_violations_detected() {
        let store = MemoryStore::new();
        store
            .execute_batch(
                "CREATE TABLE authors (id INTEGER PRIMARY KEY);
                 CREATE TABLE books (id INTEGER PRIMARY KEY, author_id INTEGER REFERENCES authors(id))",
            )
            .unwrap();

        let mut author = Row::new();
        author.insert("id".to_string(), serde_json::json!(1));
        store.insert_rows("authors", &[author]).unwrap();

        let mut ok_book = Row::new();
        ok_book.insert("id".to_string(), serde_json::json!(1));
        ok_book.insert("author_id".to_string(), serde_json::json!(1));
        let mut bad_book = Row::new();
        bad_book.insert("id".to_string(), serde_json::json!(2));
        bad_book.insert("author_id".to_string(), serde_json::json!(99));
        store.insert_rows("books", &[ok_book, bad_book]).unwrap();

        let violations = store.fk_violations().unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].column, "author_id");
    }

    #[test]
    fn test_transient_failure_injection() {
        let store = MemoryStore::new();
        store.inject_transient_failures(1);

        let first = store.execute_batch("CREATE TABLE t (id INTEGER)");
        assert!(matches!(first, Err(ref e) if e.is_transient()));

        store.execute_batch("CREATE TABLE t (id INTEGER)").unwrap();
    }

    #[test]
    fn test_scratch_copy_is_independent() {
        let store = store_with_users();
        let copy = store.scratch_copy().unwrap();
        copy.execute_batch("DROP TABLE users").unwrap();

        assert!(copy.list_tables().unwrap().is_empty());
        assert_eq!(store.list_tables().unwrap(), vec!["users".to_string()]);
    }

    #[test]
    fn test_backup_round_trip() {
        let store = Arc::new(store_with_users());
        let engine = MemoryBackupEngine::new(store.clone());

        let path = engine.snapshot("pre-migration").unwrap();
        assert!(engine.exists(&path));

        store.execute_batch("DROP TABLE users").unwrap();
        assert!(store.list_tables().unwrap().is_empty());

        engine.restore(&path).unwrap();
        assert_eq!(store.list_tables().unwrap(), vec!["users".to_string()]);
    }
}
