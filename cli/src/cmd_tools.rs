//! `chainsink tools`: inspect and edit stored cursors.

use std::sync::Arc;

use anyhow::{Context, Result};

use chainsink_core::config::LoaderConfig;
use chainsink_core::connection::Connection;
use chainsink_core::cursor::{Cursor, CursorRow};
use chainsink_core::dialect::DialectRegistry;
use chainsink_core::dsn::Dsn;
use chainsink_core::loader::Loader;
use chainsink_core::types::BlockRef;

async fn loader_for(dsn: &Dsn) -> Result<Loader> {
    let conn = chainsink_storage::connect(dsn).await.context("connect")?;
    loader_on(conn, &dsn.schema)
}

fn loader_on(conn: Arc<dyn Connection>, schema: &str) -> Result<Loader> {
    let config = LoaderConfig {
        schema: schema.to_string(),
        ..LoaderConfig::default()
    };
    Ok(Loader::new(conn, &DialectRegistry::with_defaults(), &config)?)
}

// ─── read-cursor ─────────────────────────────────────────────────────────────

pub async fn read_cursors(dsn: &Dsn) -> Result<()> {
    let loader = loader_for(dsn).await?;
    let rows = loader.get_all_cursors().await.context("read cursors")?;
    for line in cursor_lines(&rows) {
        println!("{line}");
    }
    Ok(())
}

fn cursor_lines(rows: &[CursorRow]) -> Vec<String> {
    if rows.is_empty() {
        return vec!["No cursor stored".to_string()];
    }
    rows.iter()
        .map(|row| {
            format!(
                "Module {}: block #{} ({}) cursor {}",
                row.id, row.block_num, row.block_id, row.cursor
            )
        })
        .collect()
}

// ─── write-cursor ────────────────────────────────────────────────────────────

pub async fn write_cursor(
    dsn: &Dsn,
    module_hash: &str,
    cursor: &str,
    block_num: u64,
    block_id: &str,
) -> Result<()> {
    let loader = loader_for(dsn).await?;
    let cursor = Cursor::new(cursor, BlockRef::new(block_num, block_id));
    loader
        .insert_cursor(module_hash, &cursor)
        .await
        .with_context(|| format!("write cursor for module {}", module_hash))?;
    println!("Cursor for module {} written at block #{}", module_hash, block_num);
    Ok(())
}

// ─── delete-cursor ───────────────────────────────────────────────────────────

pub async fn delete_cursor(dsn: &Dsn, module_hash: Option<&str>, all: bool) -> Result<()> {
    let loader = loader_for(dsn).await?;
    println!("{}", delete(&loader, module_hash, all).await?);
    Ok(())
}

async fn delete(loader: &Loader, module_hash: Option<&str>, all: bool) -> Result<String> {
    match (module_hash, all) {
        (_, true) => {
            let deleted = loader.delete_all_cursors().await.context("delete cursors")?;
            Ok(format!("Deleted {} cursor(s)", deleted))
        }
        (Some(hash), false) => {
            loader
                .delete_cursor(hash)
                .await
                .with_context(|| format!("delete cursor for module {}", hash))?;
            Ok(format!("Deleted cursor for module {}", hash))
        }
        (None, false) => anyhow::bail!("pass a module hash or --all"),
    }
}
