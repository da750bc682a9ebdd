//! Transactional flush: staged operations + cursor in one commit.
//!
//! 1. begin
//! 2. dialect flush (history records, DML, history pruning)
//! 3. cursor update, which must hit a row when the driver reports counts
//! 4. commit, then clear the staging area
//!
//! Any failure rolls the transaction back and leaves the staging area as it
//! was, so the same batch can be retried.

use std::time::Instant;

use tracing::{debug, info, warn};

use crate::connection::Transaction;
use crate::cursor::Cursor;
use crate::dialect::FlushRequest;
use crate::error::SinkError;
use crate::loader::Loader;

impl Loader {
    /// Write every staged operation and `cursor` atomically. Returns the
    /// number of flushed entries.
    pub async fn flush(
        &mut self,
        module_hash: &str,
        cursor: &Cursor,
        last_final_block: u64,
    ) -> Result<usize, SinkError> {
        let started = Instant::now();
        let mut tx = self.conn.begin().await?;

        let result = self
            .flush_in(tx.as_mut(), module_hash, cursor, last_final_block)
            .await;
        match result {
            Ok(rows) => {
                tx.commit().await?;
                self.staging.clear();
                self.stored_module_hash = None;
                info!(
                    rows,
                    block = %cursor.block,
                    last_final_block,
                    took_ms = started.elapsed().as_millis() as u64,
                    "flushed"
                );
                Ok(rows)
            }
            Err(err) => {
                warn!(error = %err, pending = self.staging.len(), "flush failed, rolling back");
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn flush_in(
        &self,
        tx: &mut dyn Transaction,
        module_hash: &str,
        cursor: &Cursor,
        last_final_block: u64,
    ) -> Result<usize, SinkError> {
        debug!(tables = ?self.staging.counts(), "flushing staged entries");
        let rows = self
            .dialect
            .flush(
                tx,
                FlushRequest {
                    schema: &self.schema,
                    staging: &self.staging,
                    last_final_block,
                    handle_reorgs: self.handle_reorgs,
                    cancel: &self.cancel,
                },
            )
            .await?;
        self.cancel.check()?;
        self.update_cursor_in(tx, module_hash, cursor).await?;
        Ok(rows)
    }

    /// Persist `cursor` inside `tx`.
    pub(crate) async fn update_cursor_in(
        &self,
        tx: &mut dyn Transaction,
        module_hash: &str,
        cursor: &Cursor,
    ) -> Result<(), SinkError> {
        let sql = self.dialect.update_cursor_sql(
            &self.cursor_table,
            module_hash,
            self.stored_module_hash.as_deref(),
            cursor,
        );
        let affected = tx.execute(&sql).await?;
        if affected == 0 && self.dialect.driver_supports_rows_affected() {
            return Err(SinkError::CursorNotFound {
                module_hash: module_hash.to_string(),
            });
        }
        Ok(())
    }
}
