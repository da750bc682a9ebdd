//! ClickHouse dialect.
//!
//! ClickHouse is fed in append-only batches: staged inserts of a table are
//! grouped by column set into multi-row `INSERT` statements. Updates and
//! deletes are refused at staging time, no history is kept, and the cursor
//! table is a `ReplacingMergeTree` where the latest insert per id wins.

use async_trait::async_trait;
use indexmap::IndexMap;
use tracing::debug;

use crate::cancel::CancelSignal;
use crate::connection::{Connection, Transaction};
use crate::cursor::Cursor;
use crate::error::SinkError;
use crate::escape::qualified_identifier;
use crate::types::OperationKind;

use super::{Dialect, FlushRequest, CURSORS_TABLE};

#[derive(Debug, Clone, Copy, Default)]
pub struct ClickHouseDialect;

#[async_trait]
impl Dialect for ClickHouseDialect {
    fn name(&self) -> &'static str {
        "clickhouse"
    }

    fn create_cursor_table_sql(&self, schema: &str, _with_postgraphile: bool) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {}\n\
             (\n    \
                 id         String,\n    \
                 cursor     String,\n    \
                 block_num  Int64,\n    \
                 block_id   String\n\
             ) Engine = ReplacingMergeTree() ORDER BY id;\n",
            qualified_identifier(schema, CURSORS_TABLE)
        )
    }

    fn create_history_table_sql(&self, _schema: &str, _with_postgraphile: bool) -> Option<String> {
        None
    }

    /// The HTTP interface accepts a single statement per request.
    async fn execute_setup_script(&self, conn: &dyn Connection, script: &str) -> Result<(), SinkError> {
        for statement in script.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            conn.execute(statement).await?;
        }
        Ok(())
    }

    fn update_cursor_sql(
        &self,
        cursor_table: &str,
        module_hash: &str,
        _stored_module_hash: Option<&str>,
        cursor: &Cursor,
    ) -> String {
        // A fresh row under `module_hash`; rows of another hash are left as-is.
        self.insert_cursor_sql(cursor_table, module_hash, cursor)
    }

    fn parse_datetime_normalization(&self, value: &str) -> String {
        format!("parseDateTimeBestEffort({})", self.quote_string(value))
    }

    fn driver_supports_rows_affected(&self) -> bool {
        false
    }

    fn only_inserts(&self) -> bool {
        true
    }

    fn supports_history(&self) -> bool {
        false
    }

    /// ClickHouse string literals interpret backslash escapes.
    fn quote_string(&self, value: &str) -> String {
        format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
    }

    fn bool_literal(&self, value: &str) -> Option<String> {
        match value.to_ascii_lowercase().as_str() {
            "true" | "1" => Some("true".into()),
            "false" | "0" => Some("false".into()),
            _ => None,
        }
    }

    fn epoch_literal(&self, secs: i64) -> Option<String> {
        Some(secs.to_string())
    }

    fn select_cursors_sql(&self, cursor_table: &str) -> String {
        format!("SELECT id, cursor, block_num, block_id FROM {cursor_table} FINAL")
    }

    async fn flush(&self, tx: &mut dyn Transaction, request: FlushRequest<'_>) -> Result<usize, SinkError> {
        let mut rows = 0;
        for (table, ops) in request.staging.tables() {
            debug!(table, row_count = ops.len(), "flushing table entries");

            // column list → value tuples, in staging order
            let mut batches: IndexMap<Vec<String>, Vec<String>> = IndexMap::new();
            let mut identifier = None;
            for op in ops.values() {
                if op.kind != OperationKind::Insert {
                    return Err(SinkError::UnsupportedOperation {
                        dialect: self.name().into(),
                        operation: op.kind,
                        table: op.table.identifier.clone(),
                    });
                }
                let (columns, values) = self.column_values(op)?;
                batches
                    .entry(columns)
                    .or_default()
                    .push(format!("({})", values.join(",")));
                identifier.get_or_insert_with(|| op.table.identifier.clone());
            }

            let Some(identifier) = identifier else {
                continue;
            };
            for (columns, tuples) in &batches {
                request.cancel.check()?;
                tx.execute(&format!(
                    "INSERT INTO {identifier} ({}) VALUES {};",
                    columns.join(","),
                    tuples.join(",")
                ))
                .await?;
            }
            rows += ops.len();
        }
        Ok(rows)
    }

    async fn revert(
        &self,
        _tx: &mut dyn Transaction,
        _schema: &str,
        _last_valid_block: u64,
        _cancel: &CancelSignal,
    ) -> Result<(), SinkError> {
        Err(SinkError::UndoWithoutHistory {
            dialect: self.name().into(),
        })
    }
}
