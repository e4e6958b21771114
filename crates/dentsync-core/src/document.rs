//! Loosely-typed entity documents
//!
//! Remote entities are JSON objects. Helpers here cover the few fields the
//! sync core needs to understand: the entity id and the timestamps used for
//! conflict resolution and dashboard derivations.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

/// A single entity's field set
pub type Document = Map<String, Value>;

/// Field holding the entity identifier
pub const ID_FIELD: &str = "id";

/// Prefix for ids minted locally before the remote assigns one
pub const PROVISIONAL_PREFIX: &str = "local-";

/// Get the entity id of a document, if present and a non-empty string
pub fn document_id(doc: &Document) -> Option<&str> {
    doc.get(ID_FIELD)
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
}

/// Check whether an id was minted locally
pub fn is_provisional_id(id: &str) -> bool {
    id.starts_with(PROVISIONAL_PREFIX)
}

/// Mint a new provisional id
pub fn provisional_id() -> String {
    format!("{}{}", PROVISIONAL_PREFIX, uuid::Uuid::new_v4())
}

/// Convert a JSON value to a document (objects only)
pub fn from_value(value: Value) -> Option<Document> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// Whether a value counts as "empty" for merge purposes
///
/// Null, empty strings, empty arrays and empty objects are empty.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Return `base` with every field of `patch` written over it
pub fn overlay(base: &Document, patch: &Document) -> Document {
    let mut merged = base.clone();
    for (key, value) in patch {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Parse a timestamp value into epoch milliseconds
///
/// Accepts RFC 3339 strings, plain numbers (epoch milliseconds) and
/// `{seconds, nanoseconds}` objects as produced by the remote store
/// (`_seconds`/`_nanoseconds` spellings included).
pub fn timestamp_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.timestamp_millis()),
        Value::Object(o) => {
            let seconds = o
                .get("seconds")
                .or_else(|| o.get("_seconds"))
                .and_then(Value::as_i64)?;
            let nanos = o
                .get("nanoseconds")
                .or_else(|| o.get("_nanoseconds"))
                .and_then(Value::as_i64)
                .unwrap_or(0);
            Some(seconds * 1000 + nanos / 1_000_000)
        }
        _ => None,
    }
}

/// Read a timestamp field as a UTC datetime
pub fn field_datetime(doc: &Document, field: &str) -> Option<DateTime<Utc>> {
    let millis = doc.get(field).and_then(timestamp_millis)?;
    Utc.timestamp_millis_opt(millis).single()
}

/// Read a numeric field, treating missing or non-numeric values as zero
pub fn field_number(doc: &Document, field: &str) -> f64 {
    doc.get(field).and_then(Value::as_f64).unwrap_or(0.0)
}

/// Read a string field
pub fn field_str<'a>(doc: &'a Document, field: &str) -> Option<&'a str> {
    doc.get(field).and_then(Value::as_str)
}

/// Current time as an RFC 3339 string, the format local writes are stamped with
pub fn now_timestamp() -> Value {
    Value::String(Utc::now().to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        from_value(value).unwrap()
    }

    #[test]
    fn test_document_id() {
        assert_eq!(document_id(&doc(json!({"id": "a1"}))), Some("a1"));
        assert_eq!(document_id(&doc(json!({"id": ""}))), None);
        assert_eq!(document_id(&doc(json!({"id": 7}))), None);
        assert_eq!(document_id(&doc(json!({}))), None);
    }

    #[test]
    fn test_provisional_ids() {
        let id = provisional_id();
        assert!(is_provisional_id(&id));
        assert!(!is_provisional_id("apt-1"));
        assert_ne!(provisional_id(), id);
    }

    #[test]
    fn test_is_empty_value() {
        assert!(is_empty_value(&json!(null)));
        assert!(is_empty_value(&json!("")));
        assert!(is_empty_value(&json!([])));
        assert!(is_empty_value(&json!({})));
        assert!(!is_empty_value(&json!(0)));
        assert!(!is_empty_value(&json!(false)));
        assert!(!is_empty_value(&json!("x")));
    }

    #[test]
    fn test_overlay() {
        let base = doc(json!({"id": "a1", "status": "pending", "notes": "n"}));
        let patch = doc(json!({"id": "a1", "status": "confirmed"}));
        let merged = overlay(&base, &patch);
        assert_eq!(merged["status"], "confirmed");
        assert_eq!(merged["notes"], "n");
    }

    #[test]
    fn test_timestamp_formats() {
        assert_eq!(timestamp_millis(&json!(1500)), Some(1500));
        assert_eq!(
            timestamp_millis(&json!("1970-01-01T00:00:02Z")),
            Some(2000)
        );
        assert_eq!(
            timestamp_millis(&json!({"seconds": 3, "nanoseconds": 500_000_000})),
            Some(3500)
        );
        assert_eq!(timestamp_millis(&json!({"_seconds": 4})), Some(4000));
        assert_eq!(timestamp_millis(&json!("not a date")), None);
        assert_eq!(timestamp_millis(&json!(true)), None);
    }

    #[test]
    fn test_field_helpers() {
        let d = doc(json!({"amount": 2500, "when": "2024-03-01T10:00:00Z", "name": "x"}));
        assert_eq!(field_number(&d, "amount"), 2500.0);
        assert_eq!(field_number(&d, "missing"), 0.0);
        assert_eq!(field_str(&d, "name"), Some("x"));
        let when = field_datetime(&d, "when").unwrap();
        assert_eq!(when.to_rfc3339(), "2024-03-01T10:00:00+00:00");
    }
}
