//! The sink loop: consumes the block stream and drives the loader.
//!
//! # Startup
//! Look up the cursor of the module hash (bootstrapping a blank one when
//! none exists) and position the stream right after it.
//!
//! # Data
//! Stage every change of the block, then flush when the policy says so:
//!   - the stream is live
//!   - the block is still reversible and forks are handled, so the history
//!     records of each reversible block are committed on their own
//!   - the block number is a multiple of `flush_interval`
//!   - the staged entry count reached `flush_row_limit`
//!
//! # Undo
//! Flush what is staged, then revert everything above the last valid block.
//! Without history the signal is ignored when the producer buffers undos,
//! and fatal otherwise.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::cancel::CancelSignal;
use crate::config::SinkerConfig;
use crate::cursor::{Cursor, CursorLookup};
use crate::error::SinkError;
use crate::loader::Loader;
use crate::stats::SinkerStats;
use crate::stream::BlockStream;
use crate::types::{BlockScopedData, BlockUndoSignal, StreamMessage};

/// Drives a [`Loader`] from a [`BlockStream`].
///
/// The loader must have its tables loaded ([`Loader::load_tables`]) before
/// the sinker runs.
pub struct Sinker<S: BlockStream> {
    loader: Loader,
    stream: S,
    config: SinkerConfig,
    stats: SinkerStats,
    cancel: CancelSignal,
    /// Cursor of the last staged block, written by the next flush.
    pending_cursor: Option<Cursor>,
    last_final_block: u64,
}

impl<S: BlockStream> Sinker<S> {
    pub fn new(loader: Loader, stream: S, config: SinkerConfig) -> Self {
        let stats = SinkerStats::new(Duration::from_secs(config.stats_interval_secs));
        Self {
            loader,
            stream,
            config,
            stats,
            cancel: CancelSignal::never(),
            pending_cursor: None,
            last_final_block: 0,
        }
    }

    /// Stop between messages, and abort in-flight flushes, once `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.loader = self.loader.with_cancel(cancel.clone());
        self.cancel = cancel;
        self
    }

    pub fn loader(&self) -> &Loader {
        &self.loader
    }

    pub fn stats(&self) -> &SinkerStats {
        &self.stats
    }

    pub fn into_loader(self) -> Loader {
        self.loader
    }

    /// Run until the stream ends (after a final flush) or cancellation.
    ///
    /// On cancellation staged entries are dropped and
    /// [`SinkError::Cancelled`] is returned; the persisted cursor still
    /// points at the last committed block.
    pub async fn run(&mut self) -> Result<(), SinkError> {
        self.config.validate()?;
        let cursor = self.start().await?;
        self.stream.resume(&cursor).await?;
        info!(
            module_hash = %self.config.module_hash,
            cursor = %cursor,
            flush_interval = self.config.flush_interval,
            handle_reorgs = self.loader.handle_reorgs(),
            "sinker started"
        );

        let mut cancel = self.cancel.clone();
        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(pending = self.loader.pending_count(), "cancellation requested, stopping");
                    self.stats.log();
                    return Err(SinkError::Cancelled);
                }
                message = self.stream.next() => message?,
            };

            match message {
                Some(StreamMessage::Data(data)) => self.handle_block_scoped_data(data).await?,
                Some(StreamMessage::Undo(signal)) => self.handle_block_undo_signal(signal).await?,
                None => break,
            }
            self.stats.maybe_log();
        }

        if self.pending_cursor.is_some() {
            info!(pending = self.loader.pending_count(), "stream ended, flushing remaining entries");
            self.flush_pending().await?;
        }
        self.stats.log();
        info!("sinker completed");
        Ok(())
    }

    /// Cursor to resume from, creating the cursor row on first run.
    async fn start(&mut self) -> Result<Cursor, SinkError> {
        let module_hash = self.config.module_hash.clone();
        match self.loader.get_cursor(&module_hash).await? {
            CursorLookup::NotFound => {
                info!(module_hash = %module_hash, "no cursor found, starting from the beginning");
                let cursor = Cursor::blank();
                self.loader.insert_cursor(&module_hash, &cursor).await?;
                Ok(cursor)
            }
            CursorLookup::Found(cursor) => Ok(cursor),
            CursorLookup::Mismatch {
                cursor,
                stored_module_hash,
            } => {
                info!(
                    stored_module_hash = %stored_module_hash,
                    cursor = %cursor,
                    "resuming from the cursor of another module hash"
                );
                Ok(cursor)
            }
        }
    }

    /// Stage one block and flush if the policy requires it.
    pub async fn handle_block_scoped_data(&mut self, data: BlockScopedData) -> Result<(), SinkError> {
        let reversible = self.loader.handle_reorgs() && !data.is_final();

        // Entries of final blocks must not merge with those of a reversible
        // one, or the merged entry would miss its history record.
        if reversible && self.loader.has_pending_entries() {
            debug!(block = %data.clock, "flushing final entries before a reversible block");
            self.flush_pending().await?;
        }

        for change in &data.changes {
            self.loader
                .stage(change, data.clock.number, data.final_block_height)?;
        }
        self.stats.record_block(&data.clock);
        self.last_final_block = data.final_block_height;
        self.pending_cursor = Some(Cursor::new(data.cursor.clone(), data.clock.clone()));

        if self.should_flush(&data, reversible) {
            self.flush_pending().await?;
        }
        Ok(())
    }

    fn should_flush(&self, data: &BlockScopedData, reversible: bool) -> bool {
        data.is_live
            || reversible
            || data.clock.number % self.config.flush_interval == 0
            || self
                .config
                .flush_row_limit
                .is_some_and(|limit| self.loader.pending_count() >= limit)
    }

    /// Undo everything above the signal's last valid block.
    pub async fn handle_block_undo_signal(&mut self, signal: BlockUndoSignal) -> Result<(), SinkError> {
        if !self.loader.handle_reorgs() {
            if self.loader.undo_buffer_size() == 0 {
                return Err(SinkError::UndoWithoutHistory {
                    dialect: self.loader.dialect().name().to_string(),
                });
            }
            warn!(
                last_valid_block = %signal.last_valid_block,
                undo_buffer_size = self.loader.undo_buffer_size(),
                "undo signal received while the producer buffers undos, ignoring"
            );
            return Ok(());
        }

        if self.pending_cursor.is_some() {
            self.flush_pending().await?;
        }

        let cursor = Cursor::new(signal.last_valid_cursor, signal.last_valid_block);
        info!(last_valid_block = %cursor.block, "undo signal received, reverting");
        self.loader
            .revert(&self.config.module_hash, &cursor)
            .await?;
        self.stats.record_revert();
        Ok(())
    }

    async fn flush_pending(&mut self) -> Result<(), SinkError> {
        let Some(cursor) = self.pending_cursor.clone() else {
            return Ok(());
        };
        let started = Instant::now();
        let rows = self
            .loader
            .flush(&self.config.module_hash, &cursor, self.last_final_block)
            .await?;
        self.stats.record_flush(rows, started.elapsed());
        self.pending_cursor = None;
        Ok(())
    }
}
