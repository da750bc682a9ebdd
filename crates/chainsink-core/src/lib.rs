//! chainsink-core: batched, transactional, reorg-safe SQL loading of
//! blockchain change streams.
//!
//! # Architecture
//!
//! ```text
//! BlockStream → Sinker
//!                 └── Loader
//!                      ├── StagingArea      (one merged operation per row)
//!                      ├── Dialect          (postgres / clickhouse SQL)
//!                      ├── flush            (operations + cursor, one transaction)
//!                      ├── revert           (history replay on forks)
//!                      └── Connection       (storage backend, see chainsink-storage)
//! ```
//!
//! Changes are validated and merged in memory, then written together with
//! the stream cursor in a single transaction, so a crash replays from the
//! last committed cursor without duplicating or losing rows. Dialects that
//! keep a history table record the previous state of every row touched by
//! a reversible block, which lets a fork be undone exactly.

pub mod cancel;
pub mod config;
pub mod connection;
pub mod cursor;
pub mod dialect;
pub mod dsn;
pub mod error;
pub mod escape;
pub mod loader;
pub mod operation;
pub mod schema;
pub mod sinker;
pub mod staging;
pub mod stats;
pub mod stream;
pub mod types;

mod flush;
mod revert;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cancel::{CancelHandle, CancelSignal};
pub use config::{LoaderConfig, OnModuleHashMismatch, SinkerConfig};
pub use connection::{Connection, HistoryRow, Transaction};
pub use cursor::{Cursor, CursorLookup, CursorRow};
pub use dialect::{ClickHouseDialect, Dialect, DialectRegistry, PostgresDialect};
pub use dsn::{Driver, Dsn};
pub use error::SinkError;
pub use loader::Loader;
pub use schema::{ColumnInfo, ColumnKind, TableInfo};
pub use sinker::Sinker;
pub use stream::{BlockStream, JsonLinesStream, MemoryStream};
pub use types::{
    BlockRef, BlockScopedData, BlockUndoSignal, OperationKind, PrimaryKey, StreamMessage,
    TableChange,
};
