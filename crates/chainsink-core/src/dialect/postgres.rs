//! PostgreSQL dialect.
//!
//! Every staged operation becomes one statement inside the flush
//! transaction. Operations of reversible blocks are preceded by a history
//! insert capturing how to undo them:
//!
//! - insert → `I` record with the primary key only (none for tables
//!   without a primary key, whose rows cannot be located again)
//! - update / delete → `U` / `D` record with the previous row image
//!   (`row_to_json`), selected from the row before it is modified
//!
//! A revert replays those records newest first.

use std::borrow::Cow;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cancel::CancelSignal;
use crate::connection::{Connection, HistoryRow, Transaction};
use crate::cursor::Cursor;
use crate::error::SinkError;
use crate::escape::{
    escape_identifier, escape_string_value, json_to_primary_key, primary_key_where_clause,
    qualified_identifier,
};
use crate::operation::Operation;
use crate::types::OperationKind;

use super::{Dialect, FlushRequest, CURSORS_TABLE, HISTORY_TABLE};

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    pub fn history_table(&self, schema: &str) -> String {
        qualified_identifier(schema, HISTORY_TABLE)
    }

    /// The DML statement for `op`, or `None` when there is nothing to write
    /// (an update without columns).
    pub fn operation_sql(&self, op: &Operation) -> Result<Option<String>, SinkError> {
        let table = &op.table.identifier;
        match op.kind {
            OperationKind::Insert => {
                let (columns, values) = self.column_values(op)?;
                Ok(Some(format!(
                    "INSERT INTO {table} ({}) VALUES ({});",
                    columns.join(","),
                    values.join(",")
                )))
            }
            OperationKind::Update => {
                let (columns, values) = self.column_values(op)?;
                if columns.is_empty() {
                    return Ok(None);
                }
                let assignments = columns
                    .iter()
                    .zip(&values)
                    .map(|(c, v)| format!("{c}={v}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                Ok(Some(format!(
                    "UPDATE {table} SET {assignments} WHERE {};",
                    primary_key_where_clause(&op.primary_key)
                )))
            }
            OperationKind::Delete => Ok(Some(format!(
                "DELETE FROM {table} WHERE {};",
                primary_key_where_clause(&op.primary_key)
            ))),
        }
    }

    /// History record for `op` applied at reversible block `block_num`.
    pub fn history_sql(&self, schema: &str, op: &Operation, block_num: u64) -> String {
        let history = self.history_table(schema);
        let table_name = escape_string_value(&op.table.identifier);
        let pk = escape_string_value(&op.key_json());
        match op.kind {
            OperationKind::Insert => format!(
                "INSERT INTO {history} (op,table_name,pk,block_num) values ('I',{table_name},{pk},{block_num});"
            ),
            OperationKind::Update | OperationKind::Delete => format!(
                "INSERT INTO {history} (op,table_name,pk,prev_value,block_num) \
                 SELECT '{}',{table_name},{pk},row_to_json({}),{block_num} FROM {} WHERE {};",
                op.kind.history_tag(),
                op.table.escaped_name,
                op.table.identifier,
                primary_key_where_clause(&op.primary_key),
            ),
        }
    }

    pub fn prune_history_sql(&self, schema: &str, last_final_block: u64) -> String {
        format!(
            "DELETE FROM {} WHERE block_num <= {last_final_block};",
            self.history_table(schema)
        )
    }

    pub fn select_history_sql(&self, schema: &str, last_valid_block: u64) -> String {
        format!(
            "SELECT op,table_name,pk,prev_value,block_num FROM {} WHERE \"block_num\" > {last_valid_block} \
             ORDER BY \"block_num\" DESC, \"id\" DESC",
            self.history_table(schema)
        )
    }

    /// Inverse statement for one history record.
    pub fn revert_sql(&self, row: &HistoryRow) -> Result<String, SinkError> {
        let table = &row.table_name;
        let key = json_to_primary_key(&row.pk)?;
        let prev_value = || {
            row.prev_value.as_deref().ok_or_else(|| {
                SinkError::database(format!(
                    "history record {} {table} {} has no previous value",
                    row.op, row.pk
                ))
            })
        };

        match row.op.as_str() {
            "I" => Ok(format!("DELETE FROM {table} WHERE {};", primary_key_where_clause(&key))),
            "D" => Ok(format!(
                "INSERT INTO {table} SELECT * FROM json_populate_record(null::{table},{});",
                escape_string_value(prev_value()?)
            )),
            "U" => {
                let prev = prev_value()?;
                let columns = column_names_from_json(prev)?;
                Ok(format!(
                    "UPDATE {table} SET({columns})=((SELECT {columns} FROM json_populate_record(null::{table},{}))) WHERE {};",
                    escape_string_value(prev),
                    primary_key_where_clause(&key)
                ))
            }
            other => Err(SinkError::database(format!(
                "unknown history operation {other:?} for {table} {}",
                row.pk
            ))),
        }
    }
}

/// Sorted, escaped, comma separated keys of a JSON object.
fn column_names_from_json(json: &str) -> Result<String, SinkError> {
    let value: Value = serde_json::from_str(json)
        .map_err(|e| SinkError::database(format!("invalid row image {json:?}: {e}")))?;
    let Value::Object(object) = value else {
        return Err(SinkError::database(format!("row image {json:?} is not an object")));
    };
    let mut names = object.keys().map(|k| escape_identifier(k)).collect::<Vec<_>>();
    names.sort();
    Ok(names.join(","))
}

#[async_trait]
impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn create_cursor_table_sql(&self, schema: &str, with_postgraphile: bool) -> String {
        let table = qualified_identifier(schema, CURSORS_TABLE);
        let mut sql = format!(
            "create table if not exists {table}\n\
             (\n    \
                 id         text not null constraint cursor_pk primary key,\n    \
                 cursor     text,\n    \
                 block_num  bigint,\n    \
                 block_id   text\n\
             );\n"
        );
        if with_postgraphile {
            sql.push_str(&format!("COMMENT ON TABLE {table} IS E'@omit';"));
        }
        sql
    }

    fn create_history_table_sql(&self, schema: &str, with_postgraphile: bool) -> Option<String> {
        let table = self.history_table(schema);
        let mut sql = format!(
            "create table if not exists {table}\n\
             (\n    \
                 id           SERIAL PRIMARY KEY,\n    \
                 op           char,\n    \
                 table_name   text,\n    \
                 pk           text,\n    \
                 prev_value   text,\n    \
                 block_num    bigint\n\
             );\n"
        );
        if with_postgraphile {
            sql.push_str(&format!("COMMENT ON TABLE {table} IS E'@omit';"));
        }
        Some(sql)
    }

    async fn execute_setup_script(&self, conn: &dyn Connection, script: &str) -> Result<(), SinkError> {
        conn.execute(script).await?;
        Ok(())
    }

    fn update_cursor_sql(
        &self,
        cursor_table: &str,
        module_hash: &str,
        stored_module_hash: Option<&str>,
        cursor: &Cursor,
    ) -> String {
        let token = escape_string_value(&cursor.token);
        let block_num = cursor.block.number;
        let block_id = escape_string_value(&cursor.block.id);
        match stored_module_hash {
            Some(stored) => format!(
                "UPDATE {cursor_table} set id = {}, cursor = {token}, block_num = {block_num}, block_id = {block_id} WHERE id = {};",
                escape_string_value(module_hash),
                escape_string_value(stored),
            ),
            None => format!(
                "UPDATE {cursor_table} set cursor = {token}, block_num = {block_num}, block_id = {block_id} WHERE id = {};",
                escape_string_value(module_hash),
            ),
        }
    }

    fn parse_datetime_normalization(&self, value: &str) -> String {
        escape_string_value(value)
    }

    fn driver_supports_rows_affected(&self) -> bool {
        true
    }

    fn only_inserts(&self) -> bool {
        false
    }

    fn supports_history(&self) -> bool {
        true
    }

    /// PostgreSQL cannot store NUL in text columns.
    fn sanitize_text<'a>(&self, value: &'a str) -> Cow<'a, str> {
        if value.contains('\0') {
            Cow::Owned(value.replace('\0', ""))
        } else {
            Cow::Borrowed(value)
        }
    }

    async fn flush(&self, tx: &mut dyn Transaction, request: FlushRequest<'_>) -> Result<usize, SinkError> {
        let mut rows = 0;
        let mut untracked = 0usize;
        for (table, ops) in request.staging.tables() {
            debug!(table, row_count = ops.len(), "flushing table rows");
            for op in ops.values() {
                let Some(statement) = self.operation_sql(op)? else {
                    continue;
                };
                match op.reversible_block {
                    Some(_) if request.handle_reorgs && op.is_keyless() => untracked += 1,
                    Some(block) if request.handle_reorgs => {
                        request.cancel.check()?;
                        tx.execute(&self.history_sql(request.schema, op, block)).await?;
                    }
                    _ => {}
                }
                request.cancel.check()?;
                tx.execute(&statement).await?;
            }
            rows += ops.len();
        }
        if untracked > 0 {
            warn!(
                rows = untracked,
                "reversible rows of tables without a primary key cannot be reverted on a fork"
            );
        }

        if request.handle_reorgs {
            request.cancel.check()?;
            tx.execute(&self.prune_history_sql(request.schema, request.last_final_block))
                .await?;
        }
        Ok(rows)
    }

    async fn revert(
        &self,
        tx: &mut dyn Transaction,
        schema: &str,
        last_valid_block: u64,
        cancel: &CancelSignal,
    ) -> Result<(), SinkError> {
        info!(last_valid_block, "reverting forked block(s)");
        let records = tx
            .query_history(&self.select_history_sql(schema, last_valid_block))
            .await?;

        for row in &records {
            debug!(op = %row.op, table = %row.table_name, pk = %row.pk, block_num = row.block_num, "reverting");
            cancel.check()?;
            tx.execute(&self.revert_sql(row)?).await?;
        }

        cancel.check()?;
        tx.execute(&format!(
            "DELETE FROM {} WHERE \"block_num\" > {last_valid_block};",
            self.history_table(schema)
        ))
        .await?;
        info!(reverted = records.len(), last_valid_block, "revert applied");
        Ok(())
    }
}
