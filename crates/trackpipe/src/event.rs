//! Invocation events for the transform and load phases.
//!
//! Both phases are triggered with an object location. Three shapes are
//! accepted:
//!
//! ```json
//! {"bucket": "raw", "key": "songs.csv"}
//! {"key": "songs.csv"}
//! {"Records": [{"s3": {"bucket": {"name": "raw"}, "object": {"key": "songs.csv"}}}]}
//! ```
//!
//! A missing or empty `bucket` falls back to the phase's configured bucket.
//! Keys in S3 notification records are URL-encoded (`+` for space) and are
//! decoded. Any of these may also arrive wrapped as `{"body": "<json>"}`.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::object_store::ObjectRef;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("malformed event: {0}")]
    Malformed(String),

    #[error("event must contain a non-empty 'key'")]
    MissingKey,
}

#[derive(Deserialize)]
struct DirectEvent {
    #[serde(default)]
    bucket: Option<String>,
    #[serde(default)]
    key: Option<String>,
}

#[derive(Deserialize)]
struct NotificationEvent {
    #[serde(rename = "Records")]
    records: Vec<NotificationRecord>,
}

#[derive(Deserialize)]
struct NotificationRecord {
    s3: NotificationS3,
}

#[derive(Deserialize)]
struct NotificationS3 {
    bucket: NamedBucket,
    object: NamedObject,
}

#[derive(Deserialize)]
struct NamedBucket {
    name: String,
}

#[derive(Deserialize)]
struct NamedObject {
    key: String,
}

/// Replace a gateway-style `{"body": "<json>"}` event with its parsed body.
pub fn unwrap_body(event: Value) -> Result<Value, EventError> {
    match event.get("body") {
        Some(Value::String(body)) => serde_json::from_str(body)
            .map_err(|e| EventError::Malformed(format!("body is not JSON: {e}"))),
        _ => Ok(event),
    }
}

/// Resolve the object an event refers to.
pub fn object_from_event(event: &Value, default_bucket: &str) -> Result<ObjectRef, EventError> {
    if let Some(Value::String(_)) = event.get("body") {
        let inner = unwrap_body(event.clone())?;
        return object_from_event(&inner, default_bucket);
    }
    if !event.is_object() {
        return Err(EventError::Malformed("expected a JSON object".to_string()));
    }

    let (bucket, key) = if event.get("Records").is_some() {
        let notification = NotificationEvent::deserialize(event)
            .map_err(|e| EventError::Malformed(e.to_string()))?;
        let record = notification
            .records
            .into_iter()
            .next()
            .ok_or_else(|| EventError::Malformed("'Records' is empty".to_string()))?;
        (Some(record.s3.bucket.name), Some(decode_key(&record.s3.object.key)))
    } else {
        let direct =
            DirectEvent::deserialize(event).map_err(|e| EventError::Malformed(e.to_string()))?;
        (direct.bucket, direct.key)
    };

    let key = key.filter(|k| !k.trim().is_empty()).ok_or(EventError::MissingKey)?;
    let bucket = bucket
        .filter(|b| !b.trim().is_empty())
        .unwrap_or_else(|| default_bucket.to_string());
    Ok(ObjectRef::new(bucket, key))
}

/// Key of the transformed output for a raw object key.
///
/// A trailing `.csv` becomes `_transformed.csv`; other keys get the suffix
/// appended.
pub fn transformed_key(key: &str) -> String {
    match key.strip_suffix(".csv") {
        Some(stem) => format!("{stem}_transformed.csv"),
        None => format!("{key}_transformed.csv"),
    }
}

/// Decode an S3 notification key (`+` → space, `%XX` → byte).
fn decode_key(key: &str) -> String {
    let bytes = key.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => match (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    i += 2;
                }
                _ => out.push(b'%'),
            },
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    char::from(b).to_digit(16).map(|d| d as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_direct_event() {
        let object = object_from_event(&json!({"bucket": "in", "key": "a.csv"}), "raw").unwrap();
        assert_eq!(object, ObjectRef::new("in", "a.csv"));
    }

    #[test]
    fn test_default_bucket() {
        let object = object_from_event(&json!({"key": "a.csv"}), "raw").unwrap();
        assert_eq!(object.bucket, "raw");
        let object = object_from_event(&json!({"bucket": "", "key": "a.csv"}), "raw").unwrap();
        assert_eq!(object.bucket, "raw");
    }

    #[test]
    fn test_missing_key() {
        assert_eq!(
            object_from_event(&json!({"bucket": "in"}), "raw").unwrap_err(),
            EventError::MissingKey
        );
        assert_eq!(
            object_from_event(&json!({"key": "  "}), "raw").unwrap_err(),
            EventError::MissingKey
        );
    }

    #[test]
    fn test_s3_notification() {
        let event = json!({
            "Records": [{
                "s3": {
                    "bucket": {"name": "uploads"},
                    "object": {"key": "2024/top+hits%281%29.csv"}
                }
            }]
        });
        let object = object_from_event(&event, "raw").unwrap();
        assert_eq!(object, ObjectRef::new("uploads", "2024/top hits(1).csv"));

        assert!(matches!(
            object_from_event(&json!({"Records": []}), "raw"),
            Err(EventError::Malformed(_))
        ));
    }

    #[test]
    fn test_gateway_body() {
        let event = json!({"body": "{\"key\": \"a.csv\"}"});
        assert_eq!(object_from_event(&event, "raw").unwrap().key, "a.csv");
        assert!(matches!(
            object_from_event(&json!({"body": "nope"}), "raw"),
            Err(EventError::Malformed(_))
        ));
    }

    #[test]
    fn test_transformed_key() {
        assert_eq!(transformed_key("songs.csv"), "songs_transformed.csv");
        assert_eq!(transformed_key("dir/songs.csv"), "dir/songs_transformed.csv");
        assert_eq!(transformed_key("songs"), "songs_transformed.csv");
    }

    #[test]
    fn test_decode_key_keeps_bad_escapes() {
        assert_eq!(decode_key("100%"), "100%");
        assert_eq!(decode_key("a%zzb"), "a%zzb");
    }
}
