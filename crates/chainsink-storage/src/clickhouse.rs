//! ClickHouse connection over the HTTP interface, backed by `reqwest`.
//!
//! Every statement is one POST request. ClickHouse has no multi-statement
//! transactions: a [`Transaction`] here buffers its statements and sends them
//! in order on commit, the cursor insert last, so a failed batch never moves
//! the cursor. Rows already inserted by a failed batch are replayed on
//! restart; tables are expected to use a deduplicating engine such as
//! `ReplacingMergeTree`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use chainsink_core::connection::{Connection, HistoryRow, Transaction};
use chainsink_core::cursor::CursorRow;
use chainsink_core::dialect::{ClickHouseDialect, Dialect};
use chainsink_core::dsn::Dsn;
use chainsink_core::error::SinkError;
use chainsink_core::schema::{ColumnInfo, ColumnKind, TableInfo};

use crate::assemble_tables;

const EXCEPTION_CODE_HEADER: &str = "X-ClickHouse-Exception-Code";

/// Options for the ClickHouse HTTP client.
#[derive(Debug, Clone)]
pub struct ClickHouseOptions {
    /// Per-request timeout (default: 60s)
    pub request_timeout: Duration,
}

impl Default for ClickHouseOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// HTTP connection to a ClickHouse server. Cheaply cloneable.
#[derive(Clone)]
pub struct ClickHouseConnection {
    url: String,
    username: String,
    password: String,
    database: String,
    http: reqwest::Client,
}

impl ClickHouseConnection {
    pub fn new(
        url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
        opts: ClickHouseOptions,
    ) -> Result<Self, SinkError> {
        let http = reqwest::Client::builder()
            .timeout(opts.request_timeout)
            .build()
            .map_err(|e| SinkError::database(format!("clickhouse client: {e}")))?;
        Ok(Self {
            url: url.into(),
            username: username.into(),
            password: password.into(),
            database: database.into(),
            http,
        })
    }

    /// Connection for a `clickhouse://` DSN, checking the server answers.
    pub async fn connect(dsn: &Dsn, opts: ClickHouseOptions) -> Result<Self, SinkError> {
        let username = if dsn.username.is_empty() {
            "default"
        } else {
            dsn.username.as_str()
        };
        let conn = Self::new(
            dsn.clickhouse_http_url(),
            username,
            dsn.password.clone(),
            dsn.database.clone(),
            opts,
        )?;
        conn.post("SELECT 1").await?;
        info!(url = %conn.url, database = %conn.database, "connected to clickhouse");
        Ok(conn)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post(&self, sql: &str) -> Result<String, SinkError> {
        debug!(url = %self.url, sql_len = sql.len(), "clickhouse request");
        let resp = self
            .http
            .post(&self.url)
            .header("X-ClickHouse-User", &self.username)
            .header("X-ClickHouse-Key", &self.password)
            .header("X-ClickHouse-Database", &self.database)
            .body(sql.to_string())
            .send()
            .await
            .map_err(|e| SinkError::database(format!("clickhouse request: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let code = resp
                .headers()
                .get(EXCEPTION_CODE_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = resp.text().await.unwrap_or_default();
            return Err(SinkError::Database {
                message: format!("HTTP {status}: {}", body.trim()),
                code,
            });
        }

        resp.text()
            .await
            .map_err(|e| SinkError::database(format!("clickhouse response: {e}")))
    }

    /// Run a query and decode its `JSONEachRow` output.
    async fn query_rows<T: for<'de> Deserialize<'de>>(&self, sql: &str) -> Result<Vec<T>, SinkError> {
        let body = self.post(&format!("{sql} FORMAT JSONEachRow")).await?;
        parse_json_each_row(&body)
    }
}

fn parse_json_each_row<T: for<'de> Deserialize<'de>>(body: &str) -> Result<Vec<T>, SinkError> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line)
                .map_err(|e| SinkError::database(format!("decode clickhouse row {line:?}: {e}")))
        })
        .collect()
}

/// 64-bit integers are quoted in JSON output by default.
fn integer(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n.as_u64().unwrap_or_default(),
        Value::String(s) => s.parse().unwrap_or_default(),
        _ => 0,
    }
}

#[derive(Debug, Deserialize)]
struct RawCursor {
    id: String,
    cursor: String,
    block_num: Value,
    block_id: String,
}

#[derive(Debug, Deserialize)]
struct RawColumn {
    table: String,
    name: String,
    #[serde(rename = "type")]
    type_name: String,
    is_in_primary_key: Value,
}

#[async_trait]
impl Connection for ClickHouseConnection {
    fn driver(&self) -> &str {
        "clickhouse"
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, SinkError> {
        Ok(Box::new(ClickHouseTransaction {
            conn: self.clone(),
            statements: Vec::new(),
        }))
    }

    async fn execute(&self, sql: &str) -> Result<u64, SinkError> {
        self.post(sql).await?;
        Ok(0)
    }

    async fn query_cursors(&self, sql: &str) -> Result<Vec<CursorRow>, SinkError> {
        let rows: Vec<RawCursor> = self.query_rows(sql).await?;
        Ok(rows
            .into_iter()
            .map(|r| CursorRow {
                block_num: integer(&r.block_num),
                id: r.id,
                cursor: r.cursor,
                block_id: r.block_id,
            })
            .collect())
    }

    async fn describe_schema(&self, schema: &str) -> Result<Vec<TableInfo>, SinkError> {
        let sql = format!(
            "SELECT table, name, type, is_in_primary_key FROM system.columns \
             WHERE database = {} ORDER BY table, position",
            ClickHouseDialect.quote_string(schema)
        );
        let rows: Vec<RawColumn> = self.query_rows(&sql).await?;

        let mut columns = Vec::with_capacity(rows.len());
        let mut primary_keys = Vec::new();
        for row in rows {
            if integer(&row.is_in_primary_key) == 1 {
                primary_keys.push((row.table.clone(), row.name.clone()));
            }
            let kind = ColumnKind::from_clickhouse_type(&row.type_name);
            columns.push((row.table, ColumnInfo::new(row.name, row.type_name, kind)));
        }

        let tables = assemble_tables(schema, columns, primary_keys);
        debug!(schema, table_count = tables.len(), "clickhouse schema described");
        Ok(tables)
    }
}

// ─── Transaction ─────────────────────────────────────────────────────────────

struct ClickHouseTransaction {
    conn: ClickHouseConnection,
    statements: Vec<String>,
}

#[async_trait]
impl Transaction for ClickHouseTransaction {
    async fn execute(&mut self, sql: &str) -> Result<u64, SinkError> {
        self.statements.push(sql.to_string());
        Ok(0)
    }

    async fn query_history(&mut self, _sql: &str) -> Result<Vec<HistoryRow>, SinkError> {
        Err(SinkError::UndoWithoutHistory {
            dialect: "clickhouse".into(),
        })
    }

    async fn commit(self: Box<Self>) -> Result<(), SinkError> {
        for statement in &self.statements {
            self.conn.post(statement).await?;
        }
        debug!(statements = self.statements.len(), "clickhouse batch sent");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), SinkError> {
        debug!(statements = self.statements.len(), "clickhouse batch discarded");
        Ok(())
    }
}
