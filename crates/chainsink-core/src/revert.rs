//! Fork handling: undo every recorded change above the last valid block and
//! move the cursor back, in one transaction.

use tracing::{info, warn};

use crate::connection::Transaction;
use crate::cursor::Cursor;
use crate::error::SinkError;
use crate::loader::Loader;

impl Loader {
    /// Revert to `last_valid`. The staging area must be empty: staged
    /// entries would otherwise be written on top of the reverted state.
    pub async fn revert(&mut self, module_hash: &str, last_valid: &Cursor) -> Result<(), SinkError> {
        if self.has_pending_entries() {
            return Err(SinkError::PendingOnUndo {
                pending: self.pending_count(),
            });
        }
        if !self.dialect.supports_history() {
            return Err(SinkError::UndoWithoutHistory {
                dialect: self.dialect.name().to_string(),
            });
        }

        let mut tx = self.conn.begin().await?;
        let result = self.revert_in(tx.as_mut(), module_hash, last_valid).await;
        match result {
            Ok(()) => {
                tx.commit().await?;
                self.stored_module_hash = None;
                info!(last_valid_block = %last_valid.block, "reverted to last valid block");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "revert failed, rolling back");
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn revert_in(
        &self,
        tx: &mut dyn Transaction,
        module_hash: &str,
        last_valid: &Cursor,
    ) -> Result<(), SinkError> {
        self.dialect
            .revert(tx, &self.schema, last_valid.block.number, &self.cancel)
            .await?;
        self.cancel.check()?;
        self.update_cursor_in(tx, module_hash, last_valid).await
    }
}
