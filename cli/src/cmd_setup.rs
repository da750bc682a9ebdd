//! `chainsink setup`: run a schema script, then create the system tables.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use chainsink_core::config::LoaderConfig;
use chainsink_core::connection::Connection;
use chainsink_core::dialect::DialectRegistry;
use chainsink_core::dsn::Dsn;
use chainsink_core::loader::Loader;

pub async fn run(
    dsn: &Dsn,
    schema_file: &str,
    postgraphile: bool,
    ignore_duplicate_table_errors: bool,
) -> Result<()> {
    let script = tokio::fs::read_to_string(schema_file)
        .await
        .with_context(|| format!("read schema file '{}'", schema_file))?;
    let conn = chainsink_storage::connect(dsn).await.context("connect")?;

    setup(
        conn,
        &dsn.schema,
        &script,
        postgraphile,
        ignore_duplicate_table_errors,
    )
    .await
}

pub async fn setup(
    conn: Arc<dyn Connection>,
    schema: &str,
    script: &str,
    postgraphile: bool,
    ignore_duplicate_table_errors: bool,
) -> Result<()> {
    let config = LoaderConfig {
        schema: schema.to_string(),
        ..LoaderConfig::default()
    };
    let loader = Loader::new(conn, &DialectRegistry::with_defaults(), &config)?;

    match loader.setup(script, postgraphile).await {
        Ok(()) => {
            info!(schema, "database set up");
            Ok(())
        }
        Err(err) if ignore_duplicate_table_errors && err.is_duplicate_table() => {
            warn!(error = %err, "schema script hit an existing table, creating system tables only");
            loader
                .create_system_tables(postgraphile)
                .await
                .context("create system tables")
        }
        Err(err) => Err(err).context("setup"),
    }
}
