//! SQL dialects, one strategy per database engine.
//!
//! A [`Dialect`] owns everything engine specific: DDL for the system tables,
//! value literals, how the staged operations are turned into statements and
//! how forked blocks are undone. Dialects are registered explicitly in a
//! [`DialectRegistry`] and resolved once from the connection's driver name.

pub mod clickhouse;
pub mod postgres;

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SecondsFormat, TimeZone, Utc};

use crate::cancel::CancelSignal;
use crate::connection::{Connection, Transaction};
use crate::cursor::Cursor;
use crate::error::SinkError;
use crate::escape::{escape_string_value, qualified_identifier};
use crate::operation::Operation;
use crate::schema::{ColumnInfo, ColumnKind, TableInfo};
use crate::staging::StagingArea;

pub use clickhouse::ClickHouseDialect;
pub use postgres::PostgresDialect;

/// Name of the cursors table, created next to the data tables.
pub const CURSORS_TABLE: &str = "cursors";

/// Name of the history table used to undo reversible blocks.
pub const HISTORY_TABLE: &str = "chainsink_history";

/// Input of [`Dialect::flush`].
pub struct FlushRequest<'a> {
    pub schema: &'a str,
    pub staging: &'a StagingArea,
    /// Highest final block; history at or below it can be pruned.
    pub last_final_block: u64,
    /// Whether history records are written and pruned.
    pub handle_reorgs: bool,
    pub cancel: &'a CancelSignal,
}

#[async_trait]
pub trait Dialect: Send + Sync + fmt::Debug {
    /// Registry name, matching [`Connection::driver`].
    fn name(&self) -> &'static str;

    fn create_cursor_table_sql(&self, schema: &str, with_postgraphile: bool) -> String;

    /// `None` when the dialect keeps no history.
    fn create_history_table_sql(&self, schema: &str, with_postgraphile: bool) -> Option<String>;

    /// Run a user schema script.
    async fn execute_setup_script(&self, conn: &dyn Connection, script: &str) -> Result<(), SinkError>;

    /// Statement persisting `cursor` for `module_hash`. When the row is still
    /// stored under another hash (`stored_module_hash`), the statement moves
    /// it to `module_hash`.
    fn update_cursor_sql(
        &self,
        cursor_table: &str,
        module_hash: &str,
        stored_module_hash: Option<&str>,
        cursor: &Cursor,
    ) -> String;

    /// Literal for a non-numeric date/time value.
    fn parse_datetime_normalization(&self, value: &str) -> String;

    /// Whether `execute` reports reliable affected-row counts.
    fn driver_supports_rows_affected(&self) -> bool;

    /// Whether only inserts can be applied.
    fn only_inserts(&self) -> bool;

    /// Whether a history table is kept so reversible blocks can be undone.
    fn supports_history(&self) -> bool;

    /// Apply every staged operation inside `tx`; returns the number of rows.
    async fn flush(&self, tx: &mut dyn Transaction, request: FlushRequest<'_>) -> Result<usize, SinkError>;

    /// Undo everything recorded after `last_valid_block` inside `tx`.
    async fn revert(
        &self,
        tx: &mut dyn Transaction,
        schema: &str,
        last_valid_block: u64,
        cancel: &CancelSignal,
    ) -> Result<(), SinkError>;

    // ─── Literals ────────────────────────────────────────────────────────────

    fn quote_string(&self, value: &str) -> String {
        escape_string_value(value)
    }

    /// Text clean-up applied before quoting.
    fn sanitize_text<'a>(&self, value: &'a str) -> Cow<'a, str> {
        Cow::Borrowed(value)
    }

    fn bool_literal(&self, value: &str) -> Option<String> {
        Some(self.quote_string(value))
    }

    /// Literal for a Unix timestamp in seconds.
    fn epoch_literal(&self, secs: i64) -> Option<String> {
        let at = Utc.timestamp_opt(secs, 0).single()?;
        Some(self.quote_string(&at.to_rfc3339_opts(SecondsFormat::Secs, true)))
    }

    /// Turn a raw value into a SQL literal for `column`.
    fn normalize_value(&self, table: &TableInfo, column: &ColumnInfo, value: &str) -> Result<String, SinkError> {
        let invalid = |reason: &str| SinkError::InvalidValue {
            table: table.identifier.clone(),
            column: column.name.clone(),
            value: value.to_string(),
            reason: reason.to_string(),
        };

        match column.kind {
            ColumnKind::Text => Ok(self.quote_string(&self.sanitize_text(value))),
            ColumnKind::Bytes => Ok(self.quote_string(value)),
            ColumnKind::Bool => self.bool_literal(value).ok_or_else(|| invalid("not a boolean")),
            ColumnKind::Integer if is_integer_literal(value) => Ok(value.to_string()),
            ColumnKind::Integer => Err(invalid("not an integer")),
            ColumnKind::Float if is_decimal_literal(value) => Ok(value.to_string()),
            ColumnKind::Float => Err(invalid("not a decimal number")),
            ColumnKind::Timestamp if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) => {
                let secs = value
                    .parse::<i64>()
                    .map_err(|_| invalid("epoch seconds out of range"))?;
                self.epoch_literal(secs)
                    .ok_or_else(|| invalid("epoch seconds out of range"))
            }
            ColumnKind::Timestamp => Ok(self.parse_datetime_normalization(value)),
            ColumnKind::Other => Ok(value.to_string()),
        }
    }

    /// Escaped column names and literals of an operation, sorted by column name.
    fn column_values(&self, op: &Operation) -> Result<(Vec<String>, Vec<String>), SinkError> {
        let table = op.table.as_ref();
        let mut columns = Vec::with_capacity(op.data.len());
        let mut values = Vec::with_capacity(op.data.len());
        for (name, raw) in &op.data {
            let column = table.column(name).ok_or_else(|| SinkError::UnknownColumn {
                table: table.identifier.clone(),
                column: name.clone(),
                available: table.column_names(),
            })?;
            columns.push(column.escaped_name.clone());
            values.push(self.normalize_value(table, column, raw)?);
        }
        Ok((columns, values))
    }

    // ─── Cursor statements ───────────────────────────────────────────────────

    fn select_cursors_sql(&self, cursor_table: &str) -> String {
        format!("SELECT id, cursor, block_num, block_id FROM {cursor_table}")
    }

    fn insert_cursor_sql(&self, cursor_table: &str, module_hash: &str, cursor: &Cursor) -> String {
        format!(
            "INSERT INTO {cursor_table} (id, cursor, block_num, block_id) values ({}, {}, {}, {})",
            escape_string_value(module_hash),
            escape_string_value(&cursor.token),
            cursor.block.number,
            escape_string_value(&cursor.block.id),
        )
    }

    fn delete_cursor_sql(&self, cursor_table: &str, module_hash: &str) -> String {
        format!("DELETE FROM {cursor_table} WHERE id = {}", escape_string_value(module_hash))
    }

    fn delete_all_cursors_sql(&self, cursor_table: &str) -> String {
        format!("DELETE FROM {cursor_table}")
    }

    fn cursor_table(&self, schema: &str) -> String {
        qualified_identifier(schema, CURSORS_TABLE)
    }
}

/// Optional sign followed by at least one ASCII digit.
fn is_integer_literal(value: &str) -> bool {
    let digits = value.strip_prefix(['-', '+']).unwrap_or(value);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// `[sign] digits [. digits] [e [sign] digits]`, any magnitude. At least one
/// mantissa digit is required on either side of the point.
fn is_decimal_literal(value: &str) -> bool {
    let unsigned = value.strip_prefix(['-', '+']).unwrap_or(value);
    let (mantissa, exponent) = match unsigned.find(['e', 'E']) {
        Some(at) => (&unsigned[..at], Some(&unsigned[at + 1..])),
        None => (unsigned, None),
    };
    let (whole, fraction) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());

    !(whole.is_empty() && fraction.is_empty())
        && all_digits(whole)
        && all_digits(fraction)
        && exponent.map_or(true, is_integer_literal)
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Driver name → dialect. Populated explicitly at start-up.
#[derive(Debug, Clone, Default)]
pub struct DialectRegistry {
    dialects: BTreeMap<String, Arc<dyn Dialect>>,
}

impl DialectRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in PostgreSQL and ClickHouse dialects.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PostgresDialect));
        registry.register(Arc::new(ClickHouseDialect));
        registry
    }

    pub fn register(&mut self, dialect: Arc<dyn Dialect>) {
        self.dialects.insert(dialect.name().to_string(), dialect);
    }

    pub fn names(&self) -> Vec<&str> {
        self.dialects.keys().map(String::as_str).collect()
    }

    /// Look up the dialect for `driver`.
    pub fn resolve(&self, driver: &str) -> Result<Arc<dyn Dialect>, SinkError> {
        self.dialects
            .get(driver)
            .cloned()
            .ok_or_else(|| SinkError::UnknownDriver {
                driver: driver.to_string(),
                available: self.names().join(", "),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TableInfo {
        TableInfo::new(
            "public",
            "t",
            vec!["id".into()],
            [
                ColumnInfo::new("name", "text", ColumnKind::Text),
                ColumnInfo::new("raw", "bytea", ColumnKind::Bytes),
                ColumnInfo::new("ok", "boolean", ColumnKind::Bool),
                ColumnInfo::new("n", "bigint", ColumnKind::Integer),
                ColumnInfo::new("f", "numeric", ColumnKind::Float),
                ColumnInfo::new("at", "timestamp", ColumnKind::Timestamp),
                ColumnInfo::new("net", "inet", ColumnKind::Other),
            ],
        )
    }

    fn normalize(dialect: &dyn Dialect, column: &str, value: &str) -> Result<String, SinkError> {
        let t = table();
        let c = t.column(column).unwrap().clone();
        dialect.normalize_value(&t, &c, value)
    }

    #[test]
    fn registry_resolves_registered_dialects() {
        let registry = DialectRegistry::with_defaults();
        assert_eq!(registry.names(), ["clickhouse", "postgres"]);
        assert_eq!(registry.resolve("postgres").unwrap().name(), "postgres");
        assert!(registry.resolve("clickhouse").unwrap().only_inserts());

        let err = registry.resolve("mysql").unwrap_err();
        assert!(matches!(err, SinkError::UnknownDriver { .. }));
        assert!(DialectRegistry::new().resolve("postgres").is_err());
    }

    #[test]
    fn numeric_values_pass_through_validated() {
        let d = PostgresDialect;
        assert_eq!(normalize(&d, "n", "-42").unwrap(), "-42");
        assert_eq!(normalize(&d, "f", "1.5e3").unwrap(), "1.5e3");
        assert!(normalize(&d, "n", "1; DROP TABLE t").is_err());
        assert!(normalize(&d, "n", "").is_err());
        assert!(normalize(&d, "f", "NaN").is_err());
        assert!(normalize(&d, "f", "1e").is_err());
        assert!(normalize(&d, "f", ".").is_err());
        assert!(normalize(&d, "f", "1.2.3").is_err());
        assert_eq!(normalize(&d, "f", "-.5").unwrap(), "-.5");
        assert_eq!(normalize(&d, "f", "2.E-7").unwrap(), "2.E-7");

        let huge = format!("{}.25", "9".repeat(400));
        assert_eq!(normalize(&d, "f", &huge).unwrap(), huge);
        assert_eq!(normalize(&d, "net", "'10.0.0.1'").unwrap(), "'10.0.0.1'");
    }

    #[test]
    fn epoch_timestamps_become_rfc3339() {
        let d = PostgresDialect;
        assert_eq!(normalize(&d, "at", "0").unwrap(), "'1970-01-01T00:00:00Z'");
        assert_eq!(normalize(&d, "at", "1700000000").unwrap(), "'2023-11-14T22:13:20Z'");
        assert_eq!(
            normalize(&d, "at", "2023-01-01 10:00:00").unwrap(),
            "'2023-01-01 10:00:00'"
        );
    }

    #[test]
    fn text_and_bool_are_quoted() {
        let d = PostgresDialect;
        assert_eq!(normalize(&d, "name", "o'hara").unwrap(), "'o''hara'");
        assert_eq!(normalize(&d, "raw", "\\x00ff").unwrap(), "'\\x00ff'");
        assert_eq!(normalize(&d, "ok", "true").unwrap(), "'true'");
    }

    #[test]
    fn integer_literal_detection() {
        assert!(is_integer_literal("0"));
        assert!(is_integer_literal("+7"));
        assert!(is_integer_literal("-123456789012345678901234567890"));
        assert!(!is_integer_literal("-"));
        assert!(!is_integer_literal("1.0"));
    }
}
