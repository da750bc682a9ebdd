//! Database connection seam.
//!
//! Everything the engine sends is textual SQL; the storage crate provides
//! concrete connections (PostgreSQL via sqlx, ClickHouse over HTTP) and the
//! `testing` module provides a recording one.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cursor::CursorRow;
use crate::error::SinkError;
use crate::schema::TableInfo;

/// A row of the history table, as read back during a revert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRow {
    /// `I`, `U` or `D`.
    pub op: String,
    /// Escaped, schema-qualified table identifier.
    pub table_name: String,
    /// Canonical primary-key JSON.
    pub pk: String,
    /// Row image (JSON) before an update or delete.
    pub prev_value: Option<String>,
    pub block_num: u64,
}

/// A live database connection (or pool).
#[async_trait]
pub trait Connection: Send + Sync {
    /// Driver name used to pick the dialect (`"postgres"`, `"clickhouse"`).
    fn driver(&self) -> &str;

    /// Open a transaction.
    async fn begin(&self) -> Result<Box<dyn Transaction>, SinkError>;

    /// Run one or more statements outside any transaction; returns rows affected.
    async fn execute(&self, sql: &str) -> Result<u64, SinkError>;

    /// Run a `SELECT id, cursor, block_num, block_id ...` query.
    async fn query_cursors(&self, sql: &str) -> Result<Vec<CursorRow>, SinkError>;

    /// Describe every table of `schema`.
    async fn describe_schema(&self, schema: &str) -> Result<Vec<TableInfo>, SinkError>;
}

/// An open transaction. Dropping it without commit discards its work.
#[async_trait]
pub trait Transaction: Send {
    /// Execute one statement; returns rows affected when the driver knows it.
    async fn execute(&mut self, sql: &str) -> Result<u64, SinkError>;

    /// Run a `SELECT op,table_name,pk,prev_value,block_num ...` query.
    async fn query_history(&mut self, sql: &str) -> Result<Vec<HistoryRow>, SinkError>;

    async fn commit(self: Box<Self>) -> Result<(), SinkError>;

    async fn rollback(self: Box<Self>) -> Result<(), SinkError>;
}
