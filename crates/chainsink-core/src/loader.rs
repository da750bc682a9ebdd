//! The loader: owns the staging area and everything needed to write it out.
//!
//! A `Loader` is bound to one connection, one resolved dialect and one
//! schema. Changes are validated against the table metadata when staged, so
//! a flush only fails for database-side reasons. Flushing lives in
//! [`crate::flush`], reverting in [`crate::revert`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cancel::CancelSignal;
use crate::config::{LoaderConfig, OnModuleHashMismatch};
use crate::connection::Connection;
use crate::cursor::{Cursor, CursorLookup, CursorRow};
use crate::dialect::{Dialect, DialectRegistry, CURSORS_TABLE, HISTORY_TABLE};
use crate::error::SinkError;
use crate::escape::qualified_identifier;
use crate::operation::Operation;
use crate::schema::TableInfo;
use crate::staging::StagingArea;
use crate::types::{OperationKind, PrimaryKey, TableChange};

const CURSOR_COLUMNS: [&str; 4] = ["id", "cursor", "block_num", "block_id"];
const HISTORY_COLUMNS: [&str; 5] = ["op", "table_name", "pk", "prev_value", "block_num"];

pub struct Loader {
    pub(crate) conn: Arc<dyn Connection>,
    pub(crate) dialect: Arc<dyn Dialect>,
    pub(crate) schema: String,
    pub(crate) cursor_table: String,
    pub(crate) staging: StagingArea,
    pub(crate) handle_reorgs: bool,
    /// Hash the resumed cursor row is stored under, until the next cursor
    /// write moves it to the running module hash.
    pub(crate) stored_module_hash: Option<String>,
    pub(crate) cancel: CancelSignal,
    tables: HashMap<String, Arc<TableInfo>>,
    mismatch_mode: OnModuleHashMismatch,
    undo_buffer_size: u64,
}

impl Loader {
    /// Bind a loader to `conn`, resolving the dialect from its driver name.
    pub fn new(
        conn: Arc<dyn Connection>,
        registry: &DialectRegistry,
        config: &LoaderConfig,
    ) -> Result<Self, SinkError> {
        let dialect = registry.resolve(conn.driver())?;
        let handle_reorgs = config.undo_buffer_size == 0 && dialect.supports_history();
        info!(
            dialect = dialect.name(),
            schema = %config.schema,
            undo_buffer_size = config.undo_buffer_size,
            handle_reorgs,
            "loader created"
        );
        Ok(Self {
            cursor_table: dialect.cursor_table(&config.schema),
            conn,
            dialect,
            schema: config.schema.clone(),
            staging: StagingArea::new(),
            handle_reorgs,
            stored_module_hash: None,
            cancel: CancelSignal::never(),
            tables: HashMap::new(),
            mismatch_mode: config.on_module_hash_mismatch,
            undo_buffer_size: config.undo_buffer_size,
        })
    }

    /// Use `cancel` for every subsequent flush and revert.
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn dialect(&self) -> &dyn Dialect {
        self.dialect.as_ref()
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Escaped identifier of the cursors table.
    pub fn cursor_table(&self) -> &str {
        &self.cursor_table
    }

    /// `true` when reversible blocks are recorded in the history table.
    pub fn handle_reorgs(&self) -> bool {
        self.handle_reorgs
    }

    pub fn undo_buffer_size(&self) -> u64 {
        self.undo_buffer_size
    }

    pub fn has_pending_entries(&self) -> bool {
        !self.staging.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.staging.len()
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    pub fn table(&self, name: &str) -> Option<&Arc<TableInfo>> {
        self.tables.get(name)
    }

    // ─── Table metadata ──────────────────────────────────────────────────────

    /// Read the schema's tables from the database catalog.
    pub async fn load_tables(&mut self) -> Result<(), SinkError> {
        let tables = self.conn.describe_schema(&self.schema).await?;
        self.set_tables(tables)
    }

    /// Install table metadata, checking the system tables are usable.
    pub fn set_tables(&mut self, tables: Vec<TableInfo>) -> Result<(), SinkError> {
        let mut by_name = tables
            .into_iter()
            .map(|t| (t.name.clone(), t))
            .collect::<HashMap<_, _>>();

        let cursors = by_name.remove(CURSORS_TABLE);
        self.check_cursor_table(cursors.as_ref())?;

        let history = by_name.remove(HISTORY_TABLE);
        if self.handle_reorgs {
            self.check_history_table(history.as_ref())?;
        }

        info!(
            schema = %self.schema,
            table_count = by_name.len(),
            "tables loaded"
        );
        self.tables = by_name
            .into_iter()
            .map(|(name, table)| (name, Arc::new(table)))
            .collect();
        Ok(())
    }

    fn check_cursor_table(&self, table: Option<&TableInfo>) -> Result<(), SinkError> {
        let ddl = || self.dialect.create_cursor_table_sql(&self.schema, false);
        let Some(table) = table else {
            return Err(SinkError::SystemTable {
                reason: format!("{} table does not exist", self.cursor_table),
                ddl: ddl(),
            });
        };

        if let Some(missing) = CURSOR_COLUMNS.iter().find(|c| table.column(c).is_none()) {
            return Err(SinkError::SystemTable {
                reason: format!("{} table is missing column {missing:?}", self.cursor_table),
                ddl: ddl(),
            });
        }
        if table.primary_columns != ["id"] {
            return Err(SinkError::SystemTable {
                reason: format!(
                    "{} table must have column \"id\" as its only primary key, found ({})",
                    self.cursor_table,
                    table.primary_columns.join(", ")
                ),
                ddl: ddl(),
            });
        }
        Ok(())
    }

    fn check_history_table(&self, table: Option<&TableInfo>) -> Result<(), SinkError> {
        let identifier = qualified_identifier(&self.schema, HISTORY_TABLE);
        let ddl = || {
            self.dialect
                .create_history_table_sql(&self.schema, false)
                .unwrap_or_default()
        };
        let Some(table) = table else {
            return Err(SinkError::SystemTable {
                reason: format!(
                    "{identifier} table does not exist and is required to handle forks \
                     (or run with a non-zero undo buffer size)"
                ),
                ddl: ddl(),
            });
        };
        if let Some(missing) = HISTORY_COLUMNS.iter().find(|c| table.column(c).is_none()) {
            return Err(SinkError::SystemTable {
                reason: format!("{identifier} table is missing column {missing:?}"),
                ddl: ddl(),
            });
        }
        Ok(())
    }

    // ─── Staging ─────────────────────────────────────────────────────────────

    /// Stage one change from block `block`. Changes of blocks above
    /// `final_block` are reversible and recorded in history when forks are
    /// handled.
    pub fn stage(&mut self, change: &TableChange, block: u64, final_block: u64) -> Result<(), SinkError> {
        let reversible = (self.handle_reorgs && block > final_block).then_some(block);
        let data = change.fields.clone();
        match change.operation {
            OperationKind::Insert => self.insert(&change.table, &change.primary_key, data, reversible),
            OperationKind::Update => self.update(&change.table, &change.primary_key, data, reversible),
            OperationKind::Delete => self.delete(&change.table, &change.primary_key, reversible),
        }
    }

    pub fn insert(
        &mut self,
        table: &str,
        primary_key: &PrimaryKey,
        data: BTreeMap<String, String>,
        reversible_block: Option<u64>,
    ) -> Result<(), SinkError> {
        let op = self.operation(table, OperationKind::Insert, primary_key, data, reversible_block)?;
        self.staging.insert(op)
    }

    pub fn update(
        &mut self,
        table: &str,
        primary_key: &PrimaryKey,
        data: BTreeMap<String, String>,
        reversible_block: Option<u64>,
    ) -> Result<(), SinkError> {
        let op = self.operation(table, OperationKind::Update, primary_key, data, reversible_block)?;
        self.staging.update(op)
    }

    pub fn delete(
        &mut self,
        table: &str,
        primary_key: &PrimaryKey,
        reversible_block: Option<u64>,
    ) -> Result<(), SinkError> {
        let op = self.operation(
            table,
            OperationKind::Delete,
            primary_key,
            BTreeMap::new(),
            reversible_block,
        )?;
        self.staging.delete(op)
    }

    fn operation(
        &self,
        table: &str,
        kind: OperationKind,
        primary_key: &PrimaryKey,
        data: BTreeMap<String, String>,
        reversible_block: Option<u64>,
    ) -> Result<Operation, SinkError> {
        let info = self.tables.get(table).ok_or_else(|| {
            let mut available = self.tables.keys().cloned().collect::<Vec<_>>();
            available.sort();
            SinkError::UnknownTable {
                table: table.to_string(),
                available: available.join(", "),
            }
        })?;

        if kind != OperationKind::Insert && self.dialect.only_inserts() {
            return Err(SinkError::UnsupportedOperation {
                dialect: self.dialect.name().to_string(),
                operation: kind,
                table: info.identifier.clone(),
            });
        }

        if kind != OperationKind::Insert && !info.has_primary_key() {
            return Err(SinkError::PrimaryKey {
                table: info.identifier.clone(),
                reason: format!("table has no primary key, {kind} is not supported"),
            });
        }

        if let Some(column) = data.keys().find(|c| info.column(c).is_none()) {
            return Err(SinkError::UnknownColumn {
                table: info.identifier.clone(),
                column: column.clone(),
                available: info.column_names(),
            });
        }

        let key = info.resolve_primary_key(primary_key)?;
        Ok(Operation::new(Arc::clone(info), kind, key, data, reversible_block))
    }

    // ─── Setup ───────────────────────────────────────────────────────────────

    /// Run the user schema script, then create the cursors table and, when
    /// the dialect keeps one, the history table.
    pub async fn setup(&self, script: &str, with_postgraphile: bool) -> Result<(), SinkError> {
        info!(dialect = self.dialect.name(), schema = %self.schema, "running setup script");
        self.dialect
            .execute_setup_script(self.conn.as_ref(), script)
            .await?;
        self.create_system_tables(with_postgraphile).await?;
        info!("setup completed");
        Ok(())
    }

    /// Create the cursors table and, when the dialect keeps one, the history
    /// table. Both statements are idempotent.
    pub async fn create_system_tables(&self, with_postgraphile: bool) -> Result<(), SinkError> {
        let cursors = self
            .dialect
            .create_cursor_table_sql(&self.schema, with_postgraphile);
        self.dialect
            .execute_setup_script(self.conn.as_ref(), &cursors)
            .await?;

        if let Some(history) = self
            .dialect
            .create_history_table_sql(&self.schema, with_postgraphile)
        {
            self.dialect
                .execute_setup_script(self.conn.as_ref(), &history)
                .await?;
        }
        debug!(cursor_table = %self.cursor_table, "system tables created");
        Ok(())
    }

    // ─── Cursors ─────────────────────────────────────────────────────────────

    pub async fn get_all_cursors(&self) -> Result<Vec<CursorRow>, SinkError> {
        self.conn
            .query_cursors(&self.dialect.select_cursors_sql(&self.cursor_table))
            .await
    }

    /// Cursor to resume `module_hash` from, applying the mismatch policy
    /// when only cursors of other module hashes exist.
    pub async fn get_cursor(&mut self, module_hash: &str) -> Result<CursorLookup, SinkError> {
        let rows = self.get_all_cursors().await?;
        let lookup = CursorLookup::select(&rows, module_hash);

        if let CursorLookup::Mismatch {
            cursor,
            stored_module_hash,
        } = &lookup
        {
            match self.mismatch_mode {
                OnModuleHashMismatch::Error => {
                    return Err(SinkError::ModuleHashMismatch {
                        expected: module_hash.to_string(),
                        actual: stored_module_hash.clone(),
                        block: cursor.block.number,
                    })
                }
                OnModuleHashMismatch::Warn => warn!(
                    expected_module_hash = module_hash,
                    actual_module_hash = %stored_module_hash,
                    block = %cursor.block,
                    "cursor module hash mismatch, continuing from the cursor at the highest block \
                     (use on-module-hash-mismatch=ignore to silence)"
                ),
                OnModuleHashMismatch::Ignore => debug!(
                    expected_module_hash = module_hash,
                    actual_module_hash = %stored_module_hash,
                    "cursor module hash mismatch ignored"
                ),
            }
            self.stored_module_hash = Some(stored_module_hash.clone());
        }
        Ok(lookup)
    }

    pub async fn insert_cursor(&self, module_hash: &str, cursor: &Cursor) -> Result<(), SinkError> {
        self.conn
            .execute(&self.dialect.insert_cursor_sql(&self.cursor_table, module_hash, cursor))
            .await?;
        debug!(module_hash, cursor = %cursor, "cursor inserted");
        Ok(())
    }

    /// Delete the cursor of `module_hash`.
    pub async fn delete_cursor(&self, module_hash: &str) -> Result<(), SinkError> {
        let affected = self
            .conn
            .execute(&self.dialect.delete_cursor_sql(&self.cursor_table, module_hash))
            .await?;
        if affected == 0 && self.dialect.driver_supports_rows_affected() {
            return Err(SinkError::CursorNotFound {
                module_hash: module_hash.to_string(),
            });
        }
        Ok(())
    }

    /// Delete every cursor; returns how many were removed (when known).
    pub async fn delete_all_cursors(&self) -> Result<u64, SinkError> {
        self.conn
            .execute(&self.dialect.delete_all_cursors_sql(&self.cursor_table))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_loader, test_tables, TestConnection};

    #[test]
    fn resolves_dialect_and_reorg_mode() {
        let conn = TestConnection::postgres();
        let loader = test_loader(&conn, LoaderConfig::default());
        assert_eq!(loader.dialect().name(), "postgres");
        assert!(loader.handle_reorgs());
        assert_eq!(loader.cursor_table(), "\"public\".\"cursors\"");

        let buffered = test_loader(
            &conn,
            LoaderConfig {
                undo_buffer_size: 12,
                ..LoaderConfig::default()
            },
        );
        assert!(!buffered.handle_reorgs());

        let ch = test_loader(&TestConnection::clickhouse(), LoaderConfig::default());
        assert!(!ch.handle_reorgs());
    }

    #[test]
    fn unknown_driver_is_fatal() {
        let conn = Arc::new(TestConnection::new("sqlite"));
        let err = Loader::new(conn, &DialectRegistry::with_defaults(), &LoaderConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, SinkError::UnknownDriver { .. }));
    }

    #[test]
    fn system_tables_are_validated() {
        let conn = Arc::new(TestConnection::postgres());
        let mut loader =
            Loader::new(conn, &DialectRegistry::with_defaults(), &LoaderConfig::default()).unwrap();

        let without_cursors = test_tables("public")
            .into_iter()
            .filter(|t| t.name != CURSORS_TABLE)
            .collect();
        let err = loader.set_tables(without_cursors).unwrap_err();
        assert!(matches!(err, SinkError::SystemTable { .. }));
        assert!(err.to_string().contains("create table if not exists \"public\".\"cursors\""));

        let without_history = test_tables("public")
            .into_iter()
            .filter(|t| t.name != HISTORY_TABLE)
            .collect();
        let err = loader.set_tables(without_history).unwrap_err();
        assert!(err.to_string().contains("chainsink_history"), "{err}");

        loader.set_tables(test_tables("public")).unwrap();
        assert!(loader.table("xfer").is_some());
        assert!(loader.table(CURSORS_TABLE).is_none());
    }

    #[test]
    fn staging_validates_tables_and_columns() {
        let mut loader = test_loader(&TestConnection::postgres(), LoaderConfig::default());
        let pk = PrimaryKey::from("1");

        let err = loader.insert("nope", &pk, BTreeMap::new(), None).unwrap_err();
        assert!(matches!(err, SinkError::UnknownTable { .. }));
        assert!(err.to_string().contains("xfer"));

        let data = BTreeMap::from([("amount".to_string(), "1".to_string())]);
        let err = loader.insert("xfer", &pk, data, None).unwrap_err();
        assert!(matches!(err, SinkError::UnknownColumn { .. }));
        assert!(!loader.has_pending_entries());
    }

    #[test]
    fn stage_marks_reversible_changes() {
        let mut loader = test_loader(&TestConnection::postgres(), LoaderConfig::default());
        let change = TableChange::new("xfer", "1", OperationKind::Insert).field("from", "a");
        loader.stage(&change, 10, 5).unwrap();
        let change = TableChange::new("xfer", "2", OperationKind::Insert);
        loader.stage(&change, 10, 10).unwrap();

        let blocks = loader
            .staging()
            .operations()
            .map(|op| op.reversible_block)
            .collect::<Vec<_>>();
        assert_eq!(blocks, [Some(10), None]);
        assert_eq!(loader.pending_count(), 2);
    }

    #[test]
    fn keyless_tables_accept_inserts_only() {
        let mut loader = test_loader(&TestConnection::postgres(), LoaderConfig::default());
        let pk = PrimaryKey::from("");
        let row = BTreeMap::from([("msg".to_string(), "a".to_string())]);
        loader.insert("logs", &pk, row.clone(), None).unwrap();
        loader.insert("logs", &pk, row.clone(), None).unwrap();

        let err = loader.update("logs", &pk, row, None).unwrap_err();
        assert!(matches!(err, SinkError::PrimaryKey { .. }), "{err}");
        assert!(loader.delete("logs", &pk, None).is_err());
        assert_eq!(loader.pending_count(), 2);
    }

    #[test]
    fn only_insert_dialect_rejects_mutations() {
        let mut loader = test_loader(&TestConnection::clickhouse(), LoaderConfig::default());
        let pk = PrimaryKey::from("1");
        loader.insert("xfer", &pk, BTreeMap::new(), None).unwrap();
        let err = loader.delete("xfer", &pk, None).unwrap_err();
        assert!(matches!(
            err,
            SinkError::UnsupportedOperation {
                operation: OperationKind::Delete,
                ..
            }
        ));
        assert!(loader.update("xfer", &pk, BTreeMap::new(), None).is_err());
        assert_eq!(loader.pending_count(), 1);
    }

    #[tokio::test]
    async fn setup_runs_script_then_system_tables() {
        let conn = TestConnection::postgres();
        let loader = test_loader(&conn, LoaderConfig::default());
        loader
            .setup("create table xfer (id text primary key);", true)
            .await
            .unwrap();

        let statements = conn.statements();
        assert_eq!(statements.len(), 3);
        assert_eq!(statements[0], "create table xfer (id text primary key);");
        assert!(statements[1].contains("\"public\".\"cursors\""));
        assert!(statements[1].ends_with("IS E'@omit';"));
        assert!(statements[2].contains("\"public\".\"chainsink_history\""));
    }

    #[tokio::test]
    async fn clickhouse_setup_splits_statements() {
        let conn = TestConnection::clickhouse();
        let loader = test_loader(&conn, LoaderConfig::default());
        loader
            .setup("CREATE TABLE a (x String) ENGINE = Log; CREATE TABLE b (y String) ENGINE = Log;", false)
            .await
            .unwrap();

        let statements = conn.statements();
        assert_eq!(statements[0], "CREATE TABLE a (x String) ENGINE = Log");
        assert_eq!(statements[1], "CREATE TABLE b (y String) ENGINE = Log");
        assert!(statements[2].contains("ReplacingMergeTree"));
        assert_eq!(statements.len(), 3);
    }

    #[tokio::test]
    async fn get_cursor_applies_mismatch_policy() {
        let rows = vec![
            CursorRow {
                id: "old".into(),
                cursor: "c50".into(),
                block_num: 50,
                block_id: "0x50".into(),
            },
            CursorRow {
                id: "older".into(),
                cursor: "c20".into(),
                block_num: 20,
                block_id: "0x20".into(),
            },
        ];
        let conn = TestConnection::postgres().with_cursors(rows);

        let mut strict = test_loader(&conn, LoaderConfig::default());
        let err = strict.get_cursor("new").await.unwrap_err();
        assert!(matches!(err, SinkError::ModuleHashMismatch { block: 50, .. }));

        for mode in [OnModuleHashMismatch::Warn, OnModuleHashMismatch::Ignore] {
            let mut loader = test_loader(
                &conn,
                LoaderConfig {
                    on_module_hash_mismatch: mode,
                    ..LoaderConfig::default()
                },
            );
            let lookup = loader.get_cursor("new").await.unwrap();
            assert_eq!(lookup.cursor().token, "c50");
            assert_eq!(loader.stored_module_hash.as_deref(), Some("old"));
        }

        let mut exact = test_loader(&conn, LoaderConfig::default());
        assert!(matches!(exact.get_cursor("older").await.unwrap(), CursorLookup::Found(c) if c.token == "c20"));
        assert!(exact.stored_module_hash.is_none());
    }

    #[tokio::test]
    async fn cursor_admin_statements() {
        let conn = TestConnection::postgres();
        let loader = test_loader(&conn, LoaderConfig::default());
        loader.insert_cursor("abc", &Cursor::blank()).await.unwrap();
        loader.delete_cursor("abc").await.unwrap();
        loader.delete_all_cursors().await.unwrap();
        assert_eq!(
            conn.statements(),
            [
                "INSERT INTO \"public\".\"cursors\" (id, cursor, block_num, block_id) values ('abc', '', 0, '')",
                "DELETE FROM \"public\".\"cursors\" WHERE id = 'abc'",
                "DELETE FROM \"public\".\"cursors\"",
            ]
        );

        conn.set_rows_affected(0);
        assert!(matches!(
            loader.delete_cursor("abc").await,
            Err(SinkError::CursorNotFound { .. })
        ));
    }
}
