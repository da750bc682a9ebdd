//! Loader and sinker configuration.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SinkError;

/// What to do when the stored cursor belongs to another module hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnModuleHashMismatch {
    /// Resume silently from the cursor at the highest block.
    Ignore,
    /// Same as `Ignore`, with a warning.
    Warn,
    /// Refuse to start.
    #[default]
    Error,
}

impl FromStr for OnModuleHashMismatch {
    type Err = SinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ignore" => Ok(Self::Ignore),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(SinkError::Config(format!(
                "invalid module hash mismatch mode {other:?}, expected one of: ignore, warn, error"
            ))),
        }
    }
}

impl fmt::Display for OnModuleHashMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ignore => "ignore",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Configuration of the [`crate::loader::Loader`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Schema (ClickHouse: database) holding the data and system tables.
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default)]
    pub on_module_hash_mismatch: OnModuleHashMismatch,
    /// Number of blocks the producer holds back before emitting them. When
    /// non-zero, forks are absorbed upstream and no history is recorded.
    #[serde(default)]
    pub undo_buffer_size: u64,
}

fn default_schema() -> String {
    "public".to_string()
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            schema: default_schema(),
            on_module_hash_mismatch: OnModuleHashMismatch::default(),
            undo_buffer_size: 0,
        }
    }
}

/// Configuration of the [`crate::sinker::Sinker`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkerConfig {
    /// Hash of the producing module; keys the cursor row.
    pub module_hash: String,
    /// Flush every N blocks while catching up (default: 1000).
    #[serde(default = "default_flush_interval")]
    pub flush_interval: u64,
    /// Also flush once this many entries are staged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flush_row_limit: Option<usize>,
    /// Seconds between progress log lines (default: 15).
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

fn default_flush_interval() -> u64 {
    1000
}

fn default_stats_interval_secs() -> u64 {
    15
}

impl SinkerConfig {
    pub fn new(module_hash: impl Into<String>) -> Self {
        Self {
            module_hash: module_hash.into(),
            flush_interval: default_flush_interval(),
            flush_row_limit: None,
            stats_interval_secs: default_stats_interval_secs(),
        }
    }

    pub fn validate(&self) -> Result<(), SinkError> {
        if self.module_hash.trim().is_empty() {
            return Err(SinkError::Config("module hash must not be empty".into()));
        }
        if self.flush_interval == 0 {
            return Err(SinkError::Config("flush interval must be greater than 0".into()));
        }
        if self.flush_row_limit == Some(0) {
            return Err(SinkError::Config("flush row limit must be greater than 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatch_mode_parsing() {
        assert_eq!("IGNORE".parse::<OnModuleHashMismatch>().unwrap(), OnModuleHashMismatch::Ignore);
        assert_eq!(" warn ".parse::<OnModuleHashMismatch>().unwrap(), OnModuleHashMismatch::Warn);
        assert_eq!("Error".parse::<OnModuleHashMismatch>().unwrap(), OnModuleHashMismatch::Error);
        assert!("panic".parse::<OnModuleHashMismatch>().is_err());
        assert_eq!(OnModuleHashMismatch::default(), OnModuleHashMismatch::Error);
        assert_eq!(OnModuleHashMismatch::Warn.to_string(), "warn");
    }

    #[test]
    fn serde_defaults() {
        let loader: LoaderConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(loader, LoaderConfig::default());
        assert_eq!(loader.schema, "public");

        let sinker: SinkerConfig = serde_json::from_str(r#"{"module_hash":"abc"}"#).unwrap();
        assert_eq!(sinker, SinkerConfig::new("abc"));
        assert_eq!(sinker.flush_interval, 1000);
    }

    #[test]
    fn validation() {
        assert!(SinkerConfig::new("abc").validate().is_ok());
        assert!(SinkerConfig::new("").validate().is_err());
        let mut config = SinkerConfig::new("abc");
        config.flush_interval = 0;
        assert!(config.validate().is_err());
        config.flush_interval = 1;
        config.flush_row_limit = Some(0);
        assert!(config.validate().is_err());
    }
}
