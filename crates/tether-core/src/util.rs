//! Shared utility functions used across multiple modules.

use serde_json::Value;
use uuid::Uuid;

/// Prefix reserved for locally generated identifiers.
pub const TEMP_ID_PREFIX: &str = "temp_";

/// Generate a fresh temporary identifier.
///
/// UUID v7 keeps identifiers created by the same process roughly time-ordered.
pub fn new_temp_id() -> String {
    format!("{TEMP_ID_PREFIX}{}", Uuid::now_v7().simple())
}

/// Generate a correlation id for an outbox entry.
pub fn new_correlation_id() -> String {
    Uuid::now_v7().to_string()
}

/// Check whether an identifier was generated locally and not yet acknowledged.
pub fn is_temporary_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// Read an identifier out of a JSON value.
///
/// Servers commonly hand out numeric keys, so numbers are accepted and
/// rendered as strings.
pub fn value_as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Read a server timestamp as unix milliseconds.
///
/// Accepts integer milliseconds or RFC 3339 strings.
pub fn parse_timestamp_ms(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|date_time| date_time.timestamp_millis()),
        _ => None,
    }
}

/// Truncate text to at most 180 characters for error messages.
pub fn compact_text(value: &str) -> String {
    value.trim().chars().take(180).collect()
}

/// Current Unix timestamp in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn temp_ids_are_prefixed_and_unique() {
        let a = new_temp_id();
        let b = new_temp_id();
        assert!(is_temporary_id(&a));
        assert!(is_temporary_id(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn permanent_ids_are_not_temporary() {
        assert!(!is_temporary_id("100"));
        assert!(!is_temporary_id("0193a1c2-temp"));
    }

    #[test]
    fn value_as_id_accepts_strings_and_numbers() {
        assert_eq!(value_as_id(&json!("abc")), Some("abc".to_string()));
        assert_eq!(value_as_id(&json!(100)), Some("100".to_string()));
        assert_eq!(value_as_id(&json!("")), None);
        assert_eq!(value_as_id(&json!(null)), None);
        assert_eq!(value_as_id(&json!(true)), None);
    }

    #[test]
    fn parse_timestamp_ms_accepts_millis_and_rfc3339() {
        assert_eq!(parse_timestamp_ms(&json!(1_700_000_000_000_i64)), Some(1_700_000_000_000));
        assert_eq!(
            parse_timestamp_ms(&json!("2024-01-01T00:00:00Z")),
            Some(1_704_067_200_000)
        );
        assert_eq!(parse_timestamp_ms(&json!("yesterday")), None);
    }

    #[test]
    fn compact_text_truncates() {
        let long = "x".repeat(500);
        assert_eq!(compact_text(&long).len(), 180);
        assert_eq!(compact_text("  short  "), "short");
    }
}
