//! `chainsink run`: consume a JSON-lines block stream and load it.
//!
//! Ctrl-C cancels the run. Work already committed stays committed, the
//! staged remainder is dropped and replayed from the stored cursor on the
//! next start.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::BufReader;
use tracing::{error, info, warn};

use chainsink_core::cancel::CancelSignal;
use chainsink_core::config::{LoaderConfig, SinkerConfig};
use chainsink_core::connection::Connection;
use chainsink_core::dialect::DialectRegistry;
use chainsink_core::dsn::Dsn;
use chainsink_core::loader::Loader;
use chainsink_core::sinker::Sinker;
use chainsink_core::stream::{BlockStream, JsonLinesStream};

pub async fn run(
    dsn: &Dsn,
    input: &str,
    loader_config: LoaderConfig,
    sinker_config: SinkerConfig,
) -> Result<()> {
    sinker_config.validate()?;
    let conn = chainsink_storage::connect(dsn).await.context("connect")?;

    let (handle, cancel) = CancelSignal::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping");
            handle.cancel();
        }
    });

    if input == "-" {
        let stream = JsonLinesStream::new(BufReader::new(tokio::io::stdin()));
        sink(conn, loader_config, sinker_config, stream, cancel).await
    } else {
        let file = tokio::fs::File::open(input)
            .await
            .with_context(|| format!("open input '{}'", input))?;
        let stream = JsonLinesStream::new(BufReader::new(file));
        sink(conn, loader_config, sinker_config, stream, cancel).await
    }
}

/// Load `stream` through `conn` until it ends or `cancel` fires.
pub async fn sink<S: BlockStream>(
    conn: Arc<dyn Connection>,
    loader_config: LoaderConfig,
    sinker_config: SinkerConfig,
    stream: S,
    cancel: CancelSignal,
) -> Result<()> {
    let mut loader = Loader::new(conn, &DialectRegistry::with_defaults(), &loader_config)?;
    loader.load_tables().await.context("load table metadata")?;

    let mut sinker = Sinker::new(loader, stream, sinker_config).with_cancel(cancel);
    match sinker.run().await {
        Ok(()) => {
            info!("stream ended");
            Ok(())
        }
        Err(err) if err.is_cancelled() => {
            info!("run cancelled");
            Ok(())
        }
        Err(err) => {
            error!(fatal = err.is_fatal(), error = %err, "sink failed");
            Err(err.into())
        }
    }
}
