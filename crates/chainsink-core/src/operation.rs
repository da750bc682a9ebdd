//! A staged row-level mutation.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::escape::{primary_key_to_json, RowKey};
use crate::schema::TableInfo;
use crate::types::OperationKind;

/// One pending mutation for a (table, primary key) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub table: Arc<TableInfo>,
    pub kind: OperationKind,
    pub primary_key: RowKey,
    /// Column name → raw value. Always contains the key columns for inserts.
    pub data: BTreeMap<String, String>,
    /// Block the change belongs to when it can still be forked out and its
    /// effect must be recorded in the history table.
    pub reversible_block: Option<u64>,
}

impl Operation {
    pub fn new(
        table: Arc<TableInfo>,
        kind: OperationKind,
        primary_key: RowKey,
        mut data: BTreeMap<String, String>,
        reversible_block: Option<u64>,
    ) -> Self {
        if kind == OperationKind::Insert {
            for (column, value) in &primary_key {
                data.entry(column.clone()).or_insert_with(|| value.clone());
            }
        }
        if kind == OperationKind::Delete {
            data.clear();
        }
        Self {
            table,
            kind,
            primary_key,
            data,
            reversible_block,
        }
    }

    /// `true` for a row of a table without a primary key.
    pub fn is_keyless(&self) -> bool {
        self.primary_key.is_empty()
    }

    /// Canonical key used in the staging area and the history table.
    pub fn key_json(&self) -> String {
        primary_key_to_json(&self.primary_key)
    }

    /// Fold an update into this entry: column values are overwritten (last
    /// write wins), kind is kept.
    pub fn merge_update(&mut self, data: BTreeMap<String, String>) {
        self.data.extend(data);
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} ({} columns)",
            self.kind,
            self.table.identifier,
            self.key_json(),
            self.data.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnInfo, ColumnKind};

    fn table() -> Arc<TableInfo> {
        Arc::new(TableInfo::new(
            "public",
            "xfer",
            vec!["id".into()],
            [
                ColumnInfo::new("id", "text", ColumnKind::Text),
                ColumnInfo::new("from", "text", ColumnKind::Text),
            ],
        ))
    }

    fn key(id: &str) -> RowKey {
        RowKey::from([("id".to_string(), id.to_string())])
    }

    #[test]
    fn insert_carries_key_columns() {
        let op = Operation::new(
            table(),
            OperationKind::Insert,
            key("1"),
            BTreeMap::from([("from".to_string(), "a".to_string())]),
            None,
        );
        assert_eq!(op.data.get("id").map(String::as_str), Some("1"));
        assert_eq!(op.key_json(), r#"{"id":"1"}"#);
    }

    #[test]
    fn merge_update_last_write_wins() {
        let mut op = Operation::new(
            table(),
            OperationKind::Insert,
            key("1"),
            BTreeMap::from([("from".to_string(), "a".to_string())]),
            Some(7),
        );
        op.merge_update(BTreeMap::from([("from".to_string(), "b".to_string())]));
        assert_eq!(op.kind, OperationKind::Insert);
        assert_eq!(op.data.get("from").map(String::as_str), Some("b"));
        assert_eq!(op.reversible_block, Some(7));
    }

    #[test]
    fn display() {
        let op = Operation::new(table(), OperationKind::Delete, key("9"), BTreeMap::new(), None);
        assert_eq!(op.to_string(), r#"delete "public"."xfer" {"id":"9"} (0 columns)"#);
    }
}
