//! Shared types consumed from the upstream block stream.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A block reference: number + opaque block id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub number: u64,
    #[serde(default)]
    pub id: String,
}

impl BlockRef {
    pub fn new(number: u64, id: impl Into<String>) -> Self {
        Self {
            number,
            id: id.into(),
        }
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.id.is_empty() {
            write!(f, "#{}", self.number)
        } else {
            write!(f, "#{} ({})", self.number, self.id)
        }
    }
}

/// Kind of row-level mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    #[serde(alias = "create")]
    Insert,
    Update,
    Delete,
}

impl OperationKind {
    /// Single-letter tag stored in the history table.
    pub fn history_tag(&self) -> &'static str {
        match self {
            Self::Insert => "I",
            Self::Update => "U",
            Self::Delete => "D",
        }
    }

    /// How a staged entry of this kind is described in conflict errors.
    pub fn scheduled_phrase(&self) -> &'static str {
        match self {
            Self::Insert => "already scheduled for insertion",
            Self::Update => "already scheduled for update",
            Self::Delete => "scheduled for deletion",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

/// Primary key as carried by a change: either a single value resolved
/// against the table's only key column, or an explicit column → value map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryKey {
    Scalar(String),
    Composite(BTreeMap<String, String>),
}

impl From<&str> for PrimaryKey {
    fn from(value: &str) -> Self {
        Self::Scalar(value.to_string())
    }
}

impl From<String> for PrimaryKey {
    fn from(value: String) -> Self {
        Self::Scalar(value)
    }
}

impl From<BTreeMap<String, String>> for PrimaryKey {
    fn from(value: BTreeMap<String, String>) -> Self {
        Self::Composite(value)
    }
}

/// One row-level change emitted by the producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableChange {
    pub table: String,
    #[serde(alias = "pk")]
    pub primary_key: PrimaryKey,
    pub operation: OperationKind,
    /// Column name → raw string value.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl TableChange {
    pub fn new(
        table: impl Into<String>,
        primary_key: impl Into<PrimaryKey>,
        operation: OperationKind,
    ) -> Self {
        Self {
            table: table.into(),
            primary_key: primary_key.into(),
            operation,
            fields: BTreeMap::new(),
        }
    }

    /// Builder helper: set one column value.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

/// A batch of changes scoped to one block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockScopedData {
    pub clock: BlockRef,
    /// Opaque resume token positioned right after this block.
    pub cursor: String,
    pub final_block_height: u64,
    #[serde(default)]
    pub is_live: bool,
    #[serde(default)]
    pub changes: Vec<TableChange>,
}

impl BlockScopedData {
    /// `true` when the block can no longer be retracted by a fork.
    pub fn is_final(&self) -> bool {
        self.clock.number <= self.final_block_height
    }
}

/// Fork notification: everything after `last_valid_block` must be undone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockUndoSignal {
    pub last_valid_block: BlockRef,
    pub last_valid_cursor: String,
}

/// Message delivered by a [`crate::stream::BlockStream`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    Data(BlockScopedData),
    Undo(BlockUndoSignal),
}
