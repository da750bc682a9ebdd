//! SQL identifier / literal escaping and canonical primary-key encoding.
//!
//! Statements are built as text, so every identifier and every string value
//! that reaches a statement goes through one of the helpers below.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::SinkError;

/// Canonical primary key: column name → value, sorted by column name.
pub type RowKey = BTreeMap<String, String>;

/// Quote an identifier with `"`, doubling any embedded `"`.
pub fn escape_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal with `'`, doubling any embedded `'`.
///
/// Nothing else is altered: backslashes and control characters are passed
/// through as-is (standard conforming strings).
pub fn escape_string_value(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `"schema"."table"`
pub fn qualified_identifier(schema: &str, table: &str) -> String {
    format!("{}.{}", escape_identifier(schema), escape_identifier(table))
}

/// Canonical JSON form of a key, e.g. `{"id":"1234"}`.
///
/// Used both as the staging-area key and as the `pk` column of the history
/// table, so both sides always agree.
pub fn primary_key_to_json(key: &RowKey) -> String {
    let object = key
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect::<serde_json::Map<_, _>>();
    Value::Object(object).to_string()
}

/// Parse a canonical key back. Non-string JSON values are kept in their
/// JSON text form.
pub fn json_to_primary_key(json: &str) -> Result<RowKey, SinkError> {
    let value: Value = serde_json::from_str(json)
        .map_err(|e| SinkError::database(format!("invalid primary key JSON {json:?}: {e}")))?;
    let Value::Object(object) = value else {
        return Err(SinkError::database(format!(
            "primary key JSON {json:?} is not an object"
        )));
    };
    Ok(object
        .into_iter()
        .map(|(k, v)| match v {
            Value::String(s) => (k, s),
            other => (k, other.to_string()),
        })
        .collect())
}

/// `"a" = '1' AND "b" = '2'`, terms sorted for determinism.
pub fn primary_key_where_clause(key: &RowKey) -> String {
    let mut terms = key
        .iter()
        .map(|(k, v)| format!("{} = {}", escape_identifier(k), escape_string_value(v)))
        .collect::<Vec<_>>();
    terms.sort();
    terms.join(" AND ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(pairs: &[(&str, &str)]) -> RowKey {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(escape_identifier("xfer"), "\"xfer\"");
        assert_eq!(escape_identifier("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(qualified_identifier("public", "from"), "\"public\".\"from\"");
    }

    #[test]
    fn string_values_only_double_quotes() {
        assert_eq!(escape_string_value("abc"), "'abc'");
        assert_eq!(escape_string_value("it's"), "'it''s'");
        assert_eq!(escape_string_value("''"), "''''''");
        // backslashes and control characters are untouched
        assert_eq!(escape_string_value("a\\b"), "'a\\b'");
        assert_eq!(escape_string_value("line\nnext\t"), "'line\nnext\t'");
    }

    #[test]
    fn canonical_key_json_is_sorted() {
        let k = key(&[("idx", "3"), ("id", "2345")]);
        assert_eq!(primary_key_to_json(&k), r#"{"id":"2345","idx":"3"}"#);
        assert_eq!(json_to_primary_key(r#"{"idx":"3","id":"2345"}"#).unwrap(), k);
    }

    #[test]
    fn key_json_with_non_string_values() {
        let k = json_to_primary_key(r#"{"id":12}"#).unwrap();
        assert_eq!(k.get("id").map(String::as_str), Some("12"));
        assert!(json_to_primary_key("[1]").is_err());
        assert!(json_to_primary_key("nope").is_err());
    }

    #[test]
    fn where_clause() {
        assert_eq!(primary_key_where_clause(&key(&[("id", "2345")])), "\"id\" = '2345'");
        assert_eq!(
            primary_key_where_clause(&key(&[("idx", "3"), ("id", "2345")])),
            "\"id\" = '2345' AND \"idx\" = '3'"
        );
        assert_eq!(
            primary_key_where_clause(&key(&[("id", "o'neil")])),
            "\"id\" = 'o''neil'"
        );
    }
}
