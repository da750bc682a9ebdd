//! Stream cursor: the resume position persisted next to the data.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::BlockRef;

/// Opaque resume token plus the block it points at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub token: String,
    pub block: BlockRef,
}

impl Cursor {
    pub fn new(token: impl Into<String>, block: BlockRef) -> Self {
        Self {
            token: token.into(),
            block,
        }
    }

    /// Cursor meaning "start from the beginning".
    pub fn blank() -> Self {
        Self::default()
    }

    pub fn is_blank(&self) -> bool {
        self.token.is_empty()
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_blank() {
            write!(f, "<blank>")
        } else {
            write!(f, "{} @ {}", self.token, self.block)
        }
    }
}

/// A row of the cursors table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRow {
    /// Module hash owning the cursor.
    pub id: String,
    pub cursor: String,
    pub block_num: u64,
    pub block_id: String,
}

impl CursorRow {
    pub fn to_cursor(&self) -> Cursor {
        Cursor::new(self.cursor.clone(), BlockRef::new(self.block_num, self.block_id.clone()))
    }
}

/// Outcome of looking up the cursor for a module hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorLookup {
    /// The table holds no cursor at all.
    NotFound,
    Found(Cursor),
    /// No cursor for the requested hash; `cursor` is the one at the highest
    /// block, owned by `stored_module_hash`.
    Mismatch {
        cursor: Cursor,
        stored_module_hash: String,
    },
}

impl CursorLookup {
    /// Pick the cursor for `module_hash` among all stored rows.
    pub fn select(rows: &[CursorRow], module_hash: &str) -> Self {
        if let Some(row) = rows.iter().find(|r| r.id == module_hash) {
            return Self::Found(row.to_cursor());
        }
        // first row wins on equal block numbers
        let highest = rows.iter().fold(None::<&CursorRow>, |best, row| match best {
            Some(b) if b.block_num >= row.block_num => Some(b),
            _ => Some(row),
        });
        match highest {
            Some(row) => Self::Mismatch {
                cursor: row.to_cursor(),
                stored_module_hash: row.id.clone(),
            },
            None => Self::NotFound,
        }
    }

    /// The cursor to resume from (blank when none is stored).
    pub fn cursor(&self) -> Cursor {
        match self {
            Self::NotFound => Cursor::blank(),
            Self::Found(c) | Self::Mismatch { cursor: c, .. } => c.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, block: u64) -> CursorRow {
        CursorRow {
            id: id.into(),
            cursor: format!("tok-{block}"),
            block_num: block,
            block_id: block.to_string(),
        }
    }

    #[test]
    fn blank_cursor() {
        let c = Cursor::blank();
        assert!(c.is_blank());
        assert_eq!(c.block.number, 0);
        assert_eq!(c.to_string(), "<blank>");
    }

    #[test]
    fn select_exact_hash() {
        let rows = [row("aaa", 10), row("bbb", 50)];
        assert_eq!(
            CursorLookup::select(&rows, "aaa"),
            CursorLookup::Found(Cursor::new("tok-10", BlockRef::new(10, "10")))
        );
    }

    #[test]
    fn select_highest_block_on_mismatch() {
        let rows = [row("aaa", 10), row("bbb", 50), row("ccc", 20)];
        let lookup = CursorLookup::select(&rows, "zzz");
        assert_eq!(
            lookup,
            CursorLookup::Mismatch {
                cursor: Cursor::new("tok-50", BlockRef::new(50, "50")),
                stored_module_hash: "bbb".into(),
            }
        );
        assert_eq!(lookup.cursor().block.number, 50);
    }

    #[test]
    fn select_empty_table() {
        let lookup = CursorLookup::select(&[], "aaa");
        assert_eq!(lookup, CursorLookup::NotFound);
        assert!(lookup.cursor().is_blank());
    }
}
