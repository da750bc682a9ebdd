//! In-memory staging area: table → primary key → pending [`Operation`].
//!
//! Tables and keys keep their first-staged order so the flushed SQL is
//! deterministic. The area is only cleared after a successful commit.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use tracing::trace;

use crate::error::SinkError;
use crate::operation::Operation;
use crate::types::OperationKind;

#[derive(Debug, Default)]
pub struct StagingArea {
    entries: IndexMap<String, IndexMap<String, Operation>>,
    pending: usize,
    /// Sequence giving each key-less insert its own slot.
    keyless_rows: u64,
}

impl StagingArea {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of staged entries across all tables.
    pub fn len(&self) -> usize {
        self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending == 0
    }

    /// Iterate tables (in staging order) with their operations.
    pub fn tables(&self) -> impl Iterator<Item = (&str, &IndexMap<String, Operation>)> {
        self.entries.iter().map(|(name, ops)| (name.as_str(), ops))
    }

    /// Iterate every operation in flush order.
    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.entries.values().flat_map(|ops| ops.values())
    }

    pub fn get(&self, table: &str, key_json: &str) -> Option<&Operation> {
        self.entries.get(table).and_then(|ops| ops.get(key_json))
    }

    /// Stage an operation according to its kind.
    pub fn stage(&mut self, op: Operation) -> Result<(), SinkError> {
        match op.kind {
            OperationKind::Insert => self.insert(op),
            OperationKind::Update => self.update(op),
            OperationKind::Delete => self.delete(op),
        }
    }

    /// Stage an insert. Fails if anything is already staged for the key.
    /// Rows of tables without a primary key never conflict.
    pub fn insert(&mut self, op: Operation) -> Result<(), SinkError> {
        let key = if op.is_keyless() {
            self.keyless_rows += 1;
            format!("#{}", self.keyless_rows)
        } else {
            op.key_json()
        };
        let table = self.entries.entry(op.table.name.clone()).or_default();
        if let Some(existing) = table.get(&key) {
            return Err(SinkError::Conflict {
                table: op.table.identifier.clone(),
                primary_key: key,
                attempted: OperationKind::Insert,
                existing: existing.kind,
            });
        }
        trace!(op = %op, "staging insert");
        table.insert(key, op);
        self.pending += 1;
        Ok(())
    }

    /// Stage an update, merging it into a staged insert/update for the same key.
    pub fn update(&mut self, op: Operation) -> Result<(), SinkError> {
        let key = op.key_json();
        let table = self.entries.entry(op.table.name.clone()).or_default();
        match table.get_mut(&key) {
            Some(existing) if existing.kind == OperationKind::Delete => Err(SinkError::Conflict {
                table: op.table.identifier.clone(),
                primary_key: key,
                attempted: OperationKind::Update,
                existing: OperationKind::Delete,
            }),
            Some(existing) => {
                trace!(op = %op, "merging update into staged entry");
                existing.merge_update(op.data);
                Ok(())
            }
            None => {
                trace!(op = %op, "staging update");
                table.insert(key, op);
                self.pending += 1;
                Ok(())
            }
        }
    }

    /// Stage a delete. Whatever was staged for the key is replaced.
    pub fn delete(&mut self, op: Operation) -> Result<(), SinkError> {
        let key = op.key_json();
        let table = self.entries.entry(op.table.name.clone()).or_default();
        trace!(op = %op, "staging delete");
        if table.insert(key, op).is_none() {
            self.pending += 1;
        }
        Ok(())
    }

    /// Per-table entry counts, for logging.
    pub fn counts(&self) -> BTreeMap<String, usize> {
        self.entries
            .iter()
            .map(|(name, ops)| (name.clone(), ops.len()))
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.pending = 0;
        self.keyless_rows = 0;
    }
}
