//! Live PostgreSQL round trips.
//!
//! Require a running PostgreSQL instance; set DATABASE_URL to enable.
//! Example: DATABASE_URL=postgres://localhost/chainsink_test cargo test -- --ignored

#![cfg(feature = "postgres")]

use std::sync::Arc;

use sqlx::Row;

use chainsink_core::config::LoaderConfig;
use chainsink_core::cursor::{Cursor, CursorLookup};
use chainsink_core::dialect::DialectRegistry;
use chainsink_core::loader::Loader;
use chainsink_core::types::{BlockRef, OperationKind, TableChange};
use chainsink_storage::postgres::PostgresConnection;

const SCHEMA: &str = "chainsink_it";

async fn fresh_loader() -> (PostgresConnection, Loader) {
    let url = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL must be set for integration tests");
    let conn = PostgresConnection::connect(&url).await.unwrap();
    sqlx::query(&format!("DROP SCHEMA IF EXISTS {SCHEMA} CASCADE"))
        .execute(conn.pool())
        .await
        .unwrap();

    let config = LoaderConfig {
        schema: SCHEMA.into(),
        ..LoaderConfig::default()
    };
    let mut loader = Loader::new(
        Arc::new(conn.clone()),
        &DialectRegistry::with_defaults(),
        &config,
    )
    .unwrap();
    let script = format!(
        "CREATE SCHEMA {SCHEMA};\n\
         CREATE TABLE {SCHEMA}.xfer (id text primary key, \"from\" text, \"to\" text, amount numeric);"
    );
    loader.setup(&script, false).await.unwrap();
    loader.load_tables().await.unwrap();
    (conn, loader)
}

async fn snapshot(conn: &PostgresConnection) -> Vec<(String, Option<String>, Option<String>)> {
    sqlx::query(&format!(
        "SELECT id, \"from\", \"to\" FROM {SCHEMA}.xfer ORDER BY id"
    ))
    .fetch_all(conn.pool())
    .await
    .unwrap()
    .iter()
    .map(|r| (r.get(0), r.get(1), r.get(2)))
    .collect()
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set DATABASE_URL to enable)"]
async fn setup_reports_duplicate_tables() {
    let (_conn, loader) = fresh_loader().await;
    let err = loader
        .setup(&format!("CREATE TABLE {SCHEMA}.xfer (id text primary key);"), false)
        .await
        .unwrap_err();
    assert!(err.is_duplicate_table(), "{err}");
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set DATABASE_URL to enable)"]
async fn revert_restores_the_pre_fork_snapshot() {
    let (conn, mut loader) = fresh_loader().await;
    loader.insert_cursor("abc", &Cursor::blank()).await.unwrap();
    assert!(matches!(loader.get_cursor("abc").await.unwrap(), CursorLookup::Found(_)));

    // final block 5
    loader
        .stage(
            &TableChange::new("xfer", "1", OperationKind::Insert)
                .field("from", "alice")
                .field("to", "bob"),
            5,
            5,
        )
        .unwrap();
    loader
        .stage(&TableChange::new("xfer", "2", OperationKind::Insert).field("from", "carol"), 5, 5)
        .unwrap();
    loader
        .flush("abc", &Cursor::new("c5", BlockRef::new(5, "0x5")), 5)
        .await
        .unwrap();
    let before = snapshot(&conn).await;

    // reversible block 6: one insert, one update, one delete
    loader
        .stage(&TableChange::new("xfer", "3", OperationKind::Insert).field("from", "dave"), 6, 5)
        .unwrap();
    loader
        .stage(&TableChange::new("xfer", "1", OperationKind::Update).field("to", "eve"), 6, 5)
        .unwrap();
    loader
        .stage(&TableChange::new("xfer", "2", OperationKind::Delete), 6, 5)
        .unwrap();
    loader
        .flush("abc", &Cursor::new("c6", BlockRef::new(6, "0x6")), 5)
        .await
        .unwrap();
    assert_ne!(snapshot(&conn).await, before);

    loader
        .revert("abc", &Cursor::new("c5", BlockRef::new(5, "0x5")))
        .await
        .unwrap();
    assert_eq!(snapshot(&conn).await, before);

    let cursor = loader.get_cursor("abc").await.unwrap().cursor();
    assert_eq!(cursor.token, "c5");
    assert_eq!(cursor.block.number, 5);
}
