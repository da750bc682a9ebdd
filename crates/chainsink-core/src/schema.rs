//! Static table metadata: column kinds, primary keys, escaped identifiers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::SinkError;
use crate::escape::{escape_identifier, primary_key_to_json, qualified_identifier, RowKey};
use crate::types::PrimaryKey;

/// Value representation class of a column, derived from its database type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Text,
    Bytes,
    Bool,
    Integer,
    Float,
    Timestamp,
    /// Anything else: the raw value is handed to the database untouched.
    Other,
}

impl ColumnKind {
    /// Classify a PostgreSQL type name (`information_schema.columns.data_type`
    /// or `udt_name`).
    pub fn from_postgres_type(type_name: &str) -> Self {
        let lower = type_name.trim().to_ascii_lowercase();
        match lower.as_str() {
            "text" | "varchar" | "character varying" | "char" | "character" | "bpchar"
            | "name" | "citext" | "uuid" | "json" | "jsonb" => Self::Text,
            "bytea" => Self::Bytes,
            "bool" | "boolean" => Self::Bool,
            "int2" | "int4" | "int8" | "smallint" | "integer" | "bigint" | "serial"
            | "bigserial" | "smallserial" => Self::Integer,
            "float4" | "float8" | "real" | "double precision" | "numeric" | "decimal" => {
                Self::Float
            }
            "date" | "timestamp" | "timestamptz" | "timestamp without time zone"
            | "timestamp with time zone" => Self::Timestamp,
            _ => Self::Other,
        }
    }

    /// Classify a ClickHouse type name (`system.columns.type`).
    ///
    /// `Nullable(..)` and `LowCardinality(..)` wrappers are looked through.
    pub fn from_clickhouse_type(type_name: &str) -> Self {
        let mut inner = type_name.trim();
        loop {
            let unwrapped = ["Nullable(", "LowCardinality("]
                .iter()
                .find_map(|w| inner.strip_prefix(w).and_then(|s| s.strip_suffix(')')));
            match unwrapped {
                Some(s) => inner = s.trim(),
                None => break,
            }
        }

        if inner == "String" || inner == "UUID" || inner.starts_with("FixedString") || inner.starts_with("Enum") {
            Self::Text
        } else if inner == "Bool" {
            Self::Bool
        } else if inner.starts_with("Int") || inner.starts_with("UInt") {
            Self::Integer
        } else if inner.starts_with("Float") || inner.starts_with("Decimal") {
            Self::Float
        } else if inner.starts_with("DateTime") || inner.starts_with("Date") {
            Self::Timestamp
        } else {
            Self::Other
        }
    }
}

/// One column of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub escaped_name: String,
    /// Type name as reported by the database catalog.
    pub database_type: String,
    pub kind: ColumnKind,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, database_type: impl Into<String>, kind: ColumnKind) -> Self {
        let name = name.into();
        Self {
            escaped_name: escape_identifier(&name),
            name,
            database_type: database_type.into(),
            kind,
        }
    }
}

/// Metadata for one table. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub schema: String,
    pub name: String,
    /// `"schema"."name"`
    pub identifier: String,
    /// `"name"`
    pub escaped_name: String,
    /// Primary key columns, in key order.
    pub primary_columns: Vec<String>,
    pub columns: BTreeMap<String, ColumnInfo>,
}

impl TableInfo {
    pub fn new(
        schema: impl Into<String>,
        name: impl Into<String>,
        primary_columns: Vec<String>,
        columns: impl IntoIterator<Item = ColumnInfo>,
    ) -> Self {
        let schema = schema.into();
        let name = name.into();
        Self {
            identifier: qualified_identifier(&schema, &name),
            escaped_name: escape_identifier(&name),
            columns: columns.into_iter().map(|c| (c.name.clone(), c)).collect(),
            primary_columns,
            schema,
            name,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.get(name)
    }

    /// Comma separated column names, for error messages.
    pub fn column_names(&self) -> String {
        self.columns.keys().cloned().collect::<Vec<_>>().join(", ")
    }

    /// `false` for append-only tables declared without a primary key.
    pub fn has_primary_key(&self) -> bool {
        !self.primary_columns.is_empty()
    }

    /// Resolve a change's primary key into the canonical column → value map.
    /// Tables without a primary key resolve every change to an empty key.
    pub fn resolve_primary_key(&self, key: &PrimaryKey) -> Result<RowKey, SinkError> {
        let err = |reason: String| SinkError::PrimaryKey {
            table: self.identifier.clone(),
            reason,
        };

        if !self.has_primary_key() {
            return Ok(RowKey::new());
        }

        match key {
            PrimaryKey::Scalar(value) => match self.primary_columns.as_slice() {
                [column] => Ok(RowKey::from([(column.clone(), value.clone())])),
                columns => Err(err(format!(
                    "composite primary key ({}) requires a column map, got single value {value:?}",
                    columns.join(", ")
                ))),
            },
            PrimaryKey::Composite(map) => {
                for column in &self.primary_columns {
                    if !map.contains_key(column) {
                        return Err(err(format!(
                            "missing primary key column {column:?} in {}",
                            primary_key_to_json(map)
                        )));
                    }
                }
                if let Some(extra) = map.keys().find(|k| !self.primary_columns.contains(k)) {
                    return Err(err(format!("{extra:?} is not a primary key column")));
                }
                Ok(map.clone())
            }
        }
    }
}
