//! Result-set diffing into insert / update / delete change sets.
//!
//! The baseline for each shape is a `LocalSnapshot`: primary key → the row
//! as last broadcast plus its serialization. Reconciling a new full row set
//! against it is O(n) in the row count: one hash lookup per incoming row and
//! one membership check per baseline row.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::types::{ChangeSet, Row, RowUpdate};

/// A row paired with its primary-key identity.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedRow {
    pub key: String,
    pub row: Row,
}

impl KeyedRow {
    pub fn new(key: impl Into<String>, row: Row) -> Self {
        Self {
            key: key.into(),
            row,
        }
    }

    /// Key a row by the given primary-key columns. Without primary-key columns
    /// the whole row is its own identity, so any change shows up as a
    /// delete plus an insert.
    pub fn from_row(row: Row, primary_key: &[String]) -> Self {
        let key = row_key(&row, primary_key);
        Self { key, row }
    }
}

/// Build a stable identity string from a row's primary-key values.
pub fn row_key(row: &Row, primary_key: &[String]) -> String {
    if primary_key.is_empty() {
        return serialize_row(row);
    }
    let parts: Vec<&Value> = primary_key
        .iter()
        .map(|col| row.get(col).unwrap_or(&Value::Null))
        .collect();
    serde_json::to_string(&parts).unwrap_or_default()
}

fn serialize_row(row: &Row) -> String {
    serde_json::to_string(row).unwrap_or_default()
}

#[derive(Debug, Clone)]
struct SnapshotEntry {
    row: Row,
    serialized: String,
}

/// Per-shape diff baseline. Owned by the sync core, never persisted.
#[derive(Debug, Clone, Default)]
pub struct LocalSnapshot {
    entries: HashMap<String, SnapshotEntry>,
    /// Keys in the order they were last seen, so deletes come out in a
    /// deterministic order.
    order: Vec<String>,
}

impl LocalSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn get(&self, key: &str) -> Option<&Row> {
        self.entries.get(key).map(|e| &e.row)
    }

    /// Diff `next` against the baseline, then make `next` the new baseline.
    ///
    /// Rows whose serialization is unchanged are left out entirely. If `next`
    /// repeats a key, the last occurrence wins.
    pub fn reconcile(&mut self, next: Vec<KeyedRow>) -> ChangeSet {
        let mut changes = ChangeSet::default();
        let mut entries: HashMap<String, SnapshotEntry> = HashMap::with_capacity(next.len());
        let mut order = Vec::with_capacity(next.len());

        for KeyedRow { key, row } in next {
            let serialized = serialize_row(&row);
            if entries.contains_key(&key) {
                // Duplicate key in one result set; keep the latest row.
                entries.insert(key, SnapshotEntry { row, serialized });
                continue;
            }
            order.push(key.clone());
            entries.insert(key, SnapshotEntry { row, serialized });
        }

        for key in &order {
            let entry = &entries[key];
            match self.entries.get(key) {
                None => changes.insert.push(entry.row.clone()),
                Some(prev) if prev.serialized != entry.serialized => {
                    changes.update.push(RowUpdate {
                        old: prev.row.clone(),
                        new: entry.row.clone(),
                    });
                }
                Some(_) => {}
            }
        }

        let seen: HashSet<&String> = entries.keys().collect();
        for key in &self.order {
            if !seen.contains(key) {
                if let Some(prev) = self.entries.get(key) {
                    changes.delete.push(prev.row.clone());
                }
            }
        }

        self.entries = entries;
        self.order = order;
        changes
    }
}

/// Diff two full row sets without keeping a baseline.
pub fn diff_rows(prev: Vec<KeyedRow>, next: Vec<KeyedRow>) -> ChangeSet {
    let mut snapshot = LocalSnapshot::new();
    snapshot.reconcile(prev);
    snapshot.reconcile(next)
}
