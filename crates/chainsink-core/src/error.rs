//! Error types for the chainsink loading engine.

use thiserror::Error;

use crate::types::OperationKind;

/// SQLSTATE reported by PostgreSQL when `CREATE TABLE` hits an existing relation.
const DUPLICATE_TABLE_CODE: &str = "42P07";

/// Connection exceptions (`08xxx`) are matched by class.
const CONNECTION_EXCEPTION_CLASS: &str = "08";
/// Serialization failure and deadlock: the transaction may succeed when replayed.
const TRANSIENT_CODES: [&str; 2] = ["40001", "40P01"];

/// Errors that can occur while staging, flushing or reverting.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("cannot {attempted} row {primary_key} in table {table}: it is {}", .existing.scheduled_phrase())]
    Conflict {
        table: String,
        primary_key: String,
        attempted: OperationKind,
        existing: OperationKind,
    },

    #[error("unknown table {table} (known tables: {available})")]
    UnknownTable { table: String, available: String },

    #[error("cannot find column {column:?} for table {table} (valid columns are {available})")]
    UnknownColumn {
        table: String,
        column: String,
        available: String,
    },

    #[error("invalid primary key for table {table}: {reason}")]
    PrimaryKey { table: String, reason: String },

    #[error("dialect {dialect} only accepts inserts, refusing {operation} on table {table}")]
    UnsupportedOperation {
        dialect: String,
        operation: OperationKind,
        table: String,
    },

    #[error("invalid value {value:?} for column {column:?} of table {table}: {reason}")]
    InvalidValue {
        table: String,
        column: String,
        value: String,
        reason: String,
    },

    #[error("cursor not found for module hash {module_hash:?}")]
    CursorNotFound { module_hash: String },

    #[error(
        "cursor module hash mismatch, refusing to continue: module hash is {expected:?} but the cursor \
         with the highest block ({block}) belongs to {actual:?}; use on-module-hash-mismatch=warn or ignore to continue"
    )]
    ModuleHashMismatch {
        expected: String,
        actual: String,
        block: u64,
    },

    #[error("{reason}; run the following to fix it:\n{ddl}")]
    SystemTable { reason: String, ddl: String },

    #[error("database error: {message}")]
    Database {
        message: String,
        code: Option<String>,
    },

    #[error("operation cancelled, transaction rolled back")]
    Cancelled,

    #[error("received an undo signal while {pending} staged entries are waiting to be flushed")]
    PendingOnUndo { pending: usize },

    #[error(
        "received an undo signal but dialect {dialect} keeps no history and undo buffering is disabled; \
         run with a non-zero undo buffer size"
    )]
    UndoWithoutHistory { dialect: String },

    #[error("unknown database driver {driver:?} (registered: {available})")]
    UnknownDriver { driver: String, available: String },

    #[error("invalid DSN: {0}")]
    Dsn(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("block stream error: {0}")]
    Stream(String),
}

impl SinkError {
    /// Database error without a driver-specific code.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            code: None,
        }
    }

    /// Returns `true` if the database refused to create an already existing table.
    pub fn is_duplicate_table(&self) -> bool {
        matches!(self, Self::Database { code: Some(code), .. } if code == DUPLICATE_TABLE_CODE)
    }

    /// Returns `true` for staging conflicts (an operation clashing with a staged one).
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Returns `true` if the error came from a cancellation request.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns `true` if retrying the same batch may succeed (transient).
    ///
    /// Database errors without a code never reached the server's SQL layer
    /// (I/O, pool timeouts) and are retryable. Coded errors are retryable
    /// only for connection exceptions, serialization failures and deadlocks.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database { code: None, .. } | Self::Stream(_) => true,
            Self::Database { code: Some(code), .. } => {
                code.starts_with(CONNECTION_EXCEPTION_CLASS) || TRANSIENT_CODES.contains(&code.as_str())
            }
            _ => false,
        }
    }

    /// Returns `true` if the error reflects invalid data or configuration,
    /// which no retry can fix.
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable() && !self.is_cancelled()
    }
}
