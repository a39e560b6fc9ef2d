//! Schema snapshots and structural diffing.
//!
//! A snapshot is taken through the store's metadata catalog before and after
//! a step; the diff is what post-validation and reports reason about.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::ShiftResult;
use crate::store::{ColumnInfo, ForeignKeyInfo, IndexInfo, StoreHandle};

/// Full structure of one table at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub foreign_keys: Vec<ForeignKeyInfo>,
    pub row_count: u64,
}

/// Point-in-time structure of the whole store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub tables: BTreeMap<String, TableSchema>,
    pub indexes: BTreeMap<String, IndexInfo>,
}

impl SchemaSnapshot {
    /// Capture the current schema through the store's metadata catalog.
    pub fn capture(handle: &dyn StoreHandle) -> ShiftResult<Self> {
        let mut snapshot = Self::default();
        for table in handle.list_tables()? {
            let schema = TableSchema {
                name: table.clone(),
                columns: handle.table_columns(&table)?,
                foreign_keys: handle.foreign_keys(&table)?,
                row_count: handle.row_count(&table)?,
            };
            for index in handle.table_indexes(&table)? {
                snapshot.indexes.insert(index.name.to_lowercase(), index);
            }
            snapshot.tables.insert(table.to_lowercase(), schema);
        }
        Ok(snapshot)
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(&name.to_lowercase())
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.indexes.contains_key(&name.to_lowercase())
    }
}

/// Column-level change within one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableChange {
    pub table: String,
    pub added_columns: Vec<String>,
    pub removed_columns: Vec<String>,
    pub changed_columns: Vec<String>,
}

/// Structural difference between two snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaDiff {
    pub added_tables: Vec<String>,
    pub removed_tables: Vec<String>,
    pub modified_tables: Vec<TableChange>,
    pub added_indexes: Vec<String>,
    pub removed_indexes: Vec<String>,
}

impl SchemaDiff {
    pub fn is_empty(&self) -> bool {
        self.added_tables.is_empty()
            && self.removed_tables.is_empty()
            && self.modified_tables.is_empty()
            && self.added_indexes.is_empty()
            && self.removed_indexes.is_empty()
    }
}

/// Diff two snapshots, `before` -> `after`.
pub fn diff_schemas(before: &SchemaSnapshot, after: &SchemaSnapshot) -> SchemaDiff {
    let mut diff = SchemaDiff::default();

    for (key, table) in &after.tables {
        match before.tables.get(key) {
            None => diff.added_tables.push(table.name.clone()),
            Some(old) => {
                if let Some(change) = diff_table(old, table) {
                    diff.modified_tables.push(change);
                }
            }
        }
    }
    for (key, table) in &before.tables {
        if !after.tables.contains_key(key) {
            diff.removed_tables.push(table.name.clone());
        }
    }

    for name in after.indexes.keys() {
        if !before.indexes.contains_key(name) {
            diff.added_indexes.push(name.clone());
        }
    }
    for name in before.indexes.keys() {
        if !after.indexes.contains_key(name) {
            diff.removed_indexes.push(name.clone());
        }
    }

    diff
}

fn diff_table(before: &TableSchema, after: &TableSchema) -> Option<TableChange> {
    let old: BTreeMap<&str, &ColumnInfo> =
        before.columns.iter().map(|c| (c.name.as_str(), c)).collect();
    let new: BTreeMap<&str, &ColumnInfo> =
        after.columns.iter().map(|c| (c.name.as_str(), c)).collect();

    let mut change = TableChange {
        table: after.name.clone(),
        added_columns: Vec::new(),
        removed_columns: Vec::new(),
        changed_columns: Vec::new(),
    };

    for (name, column) in &new {
        match old.get(name) {
            None => change.added_columns.push(name.to_string()),
            Some(previous) if previous != column => {
                change.changed_columns.push(name.to_string())
            }
            Some(_) => {}
        }
    }
    for name in old.keys() {
        if !new.contains_key(name) {
            change.removed_columns.push(name.to_string());
        }
    }

    if change.added_columns.is_empty()
        && change.removed_columns.is_empty()
        && change.changed_columns.is_empty()
    {
        None
    } else {
        Some(change)
    }
}
