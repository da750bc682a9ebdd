//! In-memory connection recording every statement, for tests.
//!
//! Transactions append `COMMIT` / `ROLLBACK` markers to the same log, so a
//! test can assert the exact statement sequence a flush or revert produced.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::config::LoaderConfig;
use crate::connection::{Connection, HistoryRow, Transaction};
use crate::cursor::CursorRow;
use crate::dialect::{DialectRegistry, CURSORS_TABLE, HISTORY_TABLE};
use crate::error::SinkError;
use crate::loader::Loader;
use crate::schema::{ColumnInfo, ColumnKind, TableInfo};

#[derive(Debug)]
struct State {
    statements: Vec<String>,
    cursors: Vec<CursorRow>,
    history: Vec<HistoryRow>,
    tables: Vec<TableInfo>,
    fail_on: Option<String>,
    fail_code: Option<String>,
    rows_affected: u64,
}

/// Recording connection. Clones share the same log.
#[derive(Debug, Clone)]
pub struct TestConnection {
    driver: String,
    state: Arc<Mutex<State>>,
}

impl TestConnection {
    pub fn new(driver: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            state: Arc::new(Mutex::new(State {
                statements: Vec::new(),
                cursors: Vec::new(),
                history: Vec::new(),
                tables: Vec::new(),
                fail_on: None,
                fail_code: None,
                rows_affected: 1,
            })),
        }
    }

    pub fn postgres() -> Self {
        Self::new("postgres")
    }

    pub fn clickhouse() -> Self {
        Self::new("clickhouse")
    }

    /// Rows returned by cursor queries.
    pub fn with_cursors(self, cursors: Vec<CursorRow>) -> Self {
        self.lock().cursors = cursors;
        self
    }

    /// Rows returned by history queries.
    pub fn with_history(self, history: Vec<HistoryRow>) -> Self {
        self.lock().history = history;
        self
    }

    /// Tables returned by `describe_schema`.
    pub fn with_tables(self, tables: Vec<TableInfo>) -> Self {
        self.lock().tables = tables;
        self
    }

    /// Fail every statement containing `needle`.
    pub fn fail_on(self, needle: impl Into<String>) -> Self {
        self.lock().fail_on = Some(needle.into());
        self
    }

    /// Like [`TestConnection::fail_on`], reporting `code` as the database
    /// error code.
    pub fn fail_on_with_code(self, needle: impl Into<String>, code: impl Into<String>) -> Self {
        {
            let mut state = self.lock();
            state.fail_on = Some(needle.into());
            state.fail_code = Some(code.into());
        }
        self
    }

    /// Rows affected reported by every statement (default: 1).
    pub fn set_rows_affected(&self, rows: u64) {
        self.lock().rows_affected = rows;
    }

    /// Every statement recorded so far.
    pub fn statements(&self) -> Vec<String> {
        self.lock().statements.clone()
    }

    pub fn clear_statements(&self) {
        self.lock().statements.clear();
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // a test that panicked while holding the lock already failed
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, sql: &str) -> Result<u64, SinkError> {
        let mut state = self.lock();
        if let Some(needle) = &state.fail_on {
            if sql.contains(needle.as_str()) {
                return Err(SinkError::Database {
                    message: format!("forced failure executing {sql:?}"),
                    code: state.fail_code.clone(),
                });
            }
        }
        state.statements.push(sql.to_string());
        Ok(state.rows_affected)
    }
}

#[async_trait]
impl Connection for TestConnection {
    fn driver(&self) -> &str {
        &self.driver
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, SinkError> {
        Ok(Box::new(TestTransaction { conn: self.clone() }))
    }

    async fn execute(&self, sql: &str) -> Result<u64, SinkError> {
        self.record(sql)
    }

    async fn query_cursors(&self, _sql: &str) -> Result<Vec<CursorRow>, SinkError> {
        Ok(self.lock().cursors.clone())
    }

    async fn describe_schema(&self, schema: &str) -> Result<Vec<TableInfo>, SinkError> {
        Ok(self
            .lock()
            .tables
            .iter()
            .filter(|t| t.schema == schema)
            .cloned()
            .collect())
    }
}

struct TestTransaction {
    conn: TestConnection,
}

#[async_trait]
impl Transaction for TestTransaction {
    async fn execute(&mut self, sql: &str) -> Result<u64, SinkError> {
        self.conn.record(sql)
    }

    async fn query_history(&mut self, sql: &str) -> Result<Vec<HistoryRow>, SinkError> {
        self.conn.record(sql)?;
        Ok(self.conn.lock().history.clone())
    }

    async fn commit(self: Box<Self>) -> Result<(), SinkError> {
        self.conn.record("COMMIT").map(|_| ())
    }

    async fn rollback(self: Box<Self>) -> Result<(), SinkError> {
        self.conn.lock().statements.push("ROLLBACK".into());
        Ok(())
    }
}

/// `xfer(id, from, to)`, the key-less `logs(msg)`, plus the cursors and
/// history system tables.
pub fn test_tables(schema: &str) -> Vec<TableInfo> {
    let text = |name: &str| ColumnInfo::new(name, "text", ColumnKind::Text);
    vec![
        TableInfo::new(
            schema,
            "xfer",
            vec!["id".into()],
            [text("id"), text("from"), text("to")],
        ),
        TableInfo::new(schema, "logs", Vec::new(), [text("msg")]),
        TableInfo::new(
            schema,
            CURSORS_TABLE,
            vec!["id".into()],
            [
                text("id"),
                text("cursor"),
                ColumnInfo::new("block_num", "bigint", ColumnKind::Integer),
                text("block_id"),
            ],
        ),
        TableInfo::new(
            schema,
            HISTORY_TABLE,
            vec!["id".into()],
            [
                ColumnInfo::new("id", "integer", ColumnKind::Integer),
                text("op"),
                text("table_name"),
                text("pk"),
                text("prev_value"),
                ColumnInfo::new("block_num", "bigint", ColumnKind::Integer),
            ],
        ),
    ]
}

/// A loader on `conn` with [`test_tables`] installed.
///
/// # Panics
/// If the tables do not validate, which would be a bug in the test setup.
pub fn test_loader(conn: &TestConnection, config: LoaderConfig) -> Loader {
    let tables = test_tables(&config.schema);
    let mut loader = Loader::new(
        Arc::new(conn.clone()),
        &DialectRegistry::with_defaults(),
        &config,
    )
    .expect("test connection driver is registered");
    loader
        .set_tables(tables)
        .expect("test tables are valid");
    loader
}
