//! Upstream block stream seam.

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};

use crate::cursor::Cursor;
use crate::error::SinkError;
use crate::types::StreamMessage;

/// Ordered source of block data and undo signals.
#[async_trait]
pub trait BlockStream: Send {
    /// Position the stream right after `cursor`. Called once before the
    /// first [`BlockStream::next`]; a blank cursor means the beginning.
    async fn resume(&mut self, _cursor: &Cursor) -> Result<(), SinkError> {
        Ok(())
    }

    /// Next message, or `None` once the stream is exhausted.
    async fn next(&mut self) -> Result<Option<StreamMessage>, SinkError>;
}

// ─── In-memory ───────────────────────────────────────────────────────────────

/// Stream replaying a fixed list of messages.
#[derive(Debug, Default)]
pub struct MemoryStream {
    messages: VecDeque<StreamMessage>,
}

impl MemoryStream {
    pub fn new(messages: impl IntoIterator<Item = StreamMessage>) -> Self {
        Self {
            messages: messages.into_iter().collect(),
        }
    }
}

#[async_trait]
impl BlockStream for MemoryStream {
    async fn next(&mut self) -> Result<Option<StreamMessage>, SinkError> {
        Ok(self.messages.pop_front())
    }
}

// ─── JSON lines ──────────────────────────────────────────────────────────────

/// One [`StreamMessage`] per line, JSON encoded. Blank lines and lines
/// starting with `#` are skipped. On resume, data messages at or below the
/// cursor's block are dropped.
pub struct JsonLinesStream<R> {
    lines: Lines<R>,
    line_no: usize,
    resume_after: Option<u64>,
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesStream<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
            resume_after: None,
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> BlockStream for JsonLinesStream<R> {
    async fn resume(&mut self, cursor: &Cursor) -> Result<(), SinkError> {
        self.resume_after = (!cursor.is_blank()).then_some(cursor.block.number);
        Ok(())
    }

    async fn next(&mut self) -> Result<Option<StreamMessage>, SinkError> {
        while let Some(line) = self
            .lines
            .next_line()
            .await
            .map_err(|e| SinkError::Stream(format!("read line {}: {e}", self.line_no + 1)))?
        {
            self.line_no += 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let message: StreamMessage = serde_json::from_str(line)
                .map_err(|e| SinkError::Stream(format!("line {}: {e}", self.line_no)))?;
            if let (Some(after), StreamMessage::Data(data)) = (self.resume_after, &message) {
                if data.clock.number <= after {
                    continue;
                }
            }
            return Ok(Some(message));
        }
        Ok(None)
    }
}
