//! Progress counters, logged periodically by the sinker.

use std::time::Duration;

use tokio::time::Instant;
use tracing::info;

use crate::types::BlockRef;

#[derive(Debug)]
pub struct SinkerStats {
    started_at: Instant,
    last_logged: Instant,
    interval: Duration,
    pub blocks: u64,
    pub last_block: Option<BlockRef>,
    pub flushes: u64,
    pub flushed_rows: u64,
    pub flush_time: Duration,
    pub reverts: u64,
}

impl SinkerStats {
    pub fn new(interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            started_at: now,
            last_logged: now,
            interval,
            blocks: 0,
            last_block: None,
            flushes: 0,
            flushed_rows: 0,
            flush_time: Duration::ZERO,
            reverts: 0,
        }
    }

    pub fn record_block(&mut self, block: &BlockRef) {
        self.blocks += 1;
        self.last_block = Some(block.clone());
    }

    pub fn record_flush(&mut self, rows: usize, took: Duration) {
        self.flushes += 1;
        self.flushed_rows += rows as u64;
        self.flush_time += took;
    }

    pub fn record_revert(&mut self) {
        self.reverts += 1;
    }

    /// Log if the interval elapsed since the last report.
    pub fn maybe_log(&mut self) {
        if self.interval.is_zero() || self.last_logged.elapsed() < self.interval {
            return;
        }
        self.log();
        self.last_logged = Instant::now();
    }

    pub fn log(&self) {
        let elapsed = self.started_at.elapsed();
        let blocks_per_sec = if elapsed.as_secs_f64() > 0.0 {
            self.blocks as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        info!(
            blocks = self.blocks,
            last_block = self.last_block.as_ref().map(|b| b.number).unwrap_or_default(),
            blocks_per_sec = %format!("{blocks_per_sec:.2}"),
            flushes = self.flushes,
            flushed_rows = self.flushed_rows,
            flush_time_ms = self.flush_time.as_millis() as u64,
            reverts = self.reverts,
            "sink stats"
        );
    }
}
