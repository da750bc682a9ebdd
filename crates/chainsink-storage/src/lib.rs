//! chainsink-storage: database connections for ChainSink.
//!
//! Backends:
//! - [`postgres`]: PostgreSQL via `sqlx` (feature `postgres`)
//! - [`clickhouse`]: ClickHouse over HTTP via `reqwest` (feature `clickhouse`)
//!
//! [`connect`] picks the backend from a parsed [`Dsn`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chainsink_core::connection::Connection;
use chainsink_core::dsn::{Driver, Dsn};
use chainsink_core::error::SinkError;
use chainsink_core::schema::{ColumnInfo, TableInfo};

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "clickhouse")]
pub mod clickhouse;

/// Open a connection for `dsn`.
pub async fn connect(dsn: &Dsn) -> Result<Arc<dyn Connection>, SinkError> {
    tracing::info!(driver = %dsn.driver, dsn = %dsn, "connecting");
    match dsn.driver {
        #[cfg(feature = "postgres")]
        Driver::Postgres => Ok(Arc::new(
            postgres::PostgresConnection::connect(&dsn.postgres_url()?).await?,
        )),
        #[cfg(feature = "clickhouse")]
        Driver::ClickHouse => Ok(Arc::new(
            clickhouse::ClickHouseConnection::connect(dsn, clickhouse::ClickHouseOptions::default())
                .await?,
        )),
        #[allow(unreachable_patterns)]
        other => Err(SinkError::UnknownDriver {
            driver: other.name().to_string(),
            available: compiled_drivers().join(", "),
        }),
    }
}

/// Drivers this build was compiled with.
pub fn compiled_drivers() -> Vec<&'static str> {
    let mut drivers = Vec::new();
    if cfg!(feature = "postgres") {
        drivers.push(Driver::Postgres.name());
    }
    if cfg!(feature = "clickhouse") {
        drivers.push(Driver::ClickHouse.name());
    }
    drivers
}

/// Group catalog rows into tables. Columns keep the order they are given
/// in; primary key columns too.
pub(crate) fn assemble_tables(
    schema: &str,
    columns: Vec<(String, ColumnInfo)>,
    primary_keys: Vec<(String, String)>,
) -> Vec<TableInfo> {
    let mut keys: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (table, column) in primary_keys {
        keys.entry(table).or_default().push(column);
    }

    let mut by_table: BTreeMap<String, Vec<ColumnInfo>> = BTreeMap::new();
    for (table, column) in columns {
        by_table.entry(table).or_default().push(column);
    }

    by_table
        .into_iter()
        .map(|(name, columns)| {
            let primary = keys.remove(&name).unwrap_or_default();
            TableInfo::new(schema, name, primary, columns)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainsink_core::schema::ColumnKind;

    #[test]
    fn groups_columns_and_keys_by_table() {
        let col = |name: &str| ColumnInfo::new(name, "text", ColumnKind::Text);
        let tables = assemble_tables(
            "public",
            vec![
                ("xfer".into(), col("id")),
                ("xfer".into(), col("from")),
                ("logs".into(), col("block")),
                ("logs".into(), col("index")),
                ("nokey".into(), col("x")),
            ],
            vec![
                ("logs".into(), "block".into()),
                ("logs".into(), "index".into()),
                ("xfer".into(), "id".into()),
            ],
        );

        assert_eq!(tables.len(), 3);
        let logs = &tables[0];
        assert_eq!(logs.identifier, "\"public\".\"logs\"");
        assert_eq!(logs.primary_columns, ["block", "index"]);
        assert!(tables[1].primary_columns.is_empty());
        assert_eq!(tables[2].name, "xfer");
        assert_eq!(tables[2].columns.len(), 2);
    }

    #[test]
    fn default_build_has_both_drivers() {
        assert_eq!(compiled_drivers(), ["postgres", "clickhouse"]);
    }
}
