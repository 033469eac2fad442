//! Chunk codec: typed values <-> flat bytes + type tag
//!
//! Blobs travel as their raw bytes tagged with their own content type.
//! Everything else is serialized to UTF-8 JSON and tagged with
//! [`STRING_MIME`], so the same chunked pipeline carries both.

use serde_json::Value;

use crate::error::CodecError;
use crate::protocol::STRING_MIME;

/// Binary payload with a declared content type
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Blob {
    pub data: Vec<u8>,
    pub content_type: String,
}

impl Blob {
    pub fn new(data: impl Into<Vec<u8>>, content_type: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            content_type: content_type.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A cached value.
///
/// Plain strings are always [`Payload::Text`]. A hand-built
/// `Json(Value::String)` is not canonical: it encodes like `Text` and comes
/// back as `Text`. Build JSON payloads with [`Payload::json`] (or `From`),
/// or pass them through [`Payload::normalized`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Blob(Blob),
    Json(Value),
    Text(String),
}

impl Payload {
    /// JSON payload, with a bare string routed to `Text`
    pub fn json(v: Value) -> Self {
        match v {
            Value::String(s) => Payload::Text(s),
            other => Payload::Json(other),
        }
    }

    /// Canonical form: `Json(String)` becomes `Text`
    pub fn normalized(self) -> Self {
        match self {
            Payload::Json(v) => Payload::json(v),
            other => other,
        }
    }

    /// Human readable type name used in mismatch errors
    pub fn type_name(&self) -> &'static str {
        match self {
            Payload::Blob(_) => "Blob",
            Payload::Json(_) => "Json",
            Payload::Text(_) => "String",
        }
    }

    /// Approximate in-memory size in bytes
    pub fn size(&self) -> usize {
        match self {
            Payload::Blob(b) => b.len(),
            Payload::Text(s) => s.len(),
            Payload::Json(v) => v.to_string().len(),
        }
    }

    pub fn as_blob(&self) -> Option<&Blob> {
        match self {
            Payload::Blob(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(s) => Some(s),
            _ => None,
        }
    }

    /// JSON view of a non-blob payload, used for settings and filesystem
    pub fn to_json(&self) -> Option<Value> {
        match self {
            Payload::Blob(_) => None,
            Payload::Json(v) => Some(v.clone()),
            Payload::Text(s) => Some(Value::String(s.clone())),
        }
    }
}

impl From<Blob> for Payload {
    fn from(b: Blob) -> Self {
        Payload::Blob(b)
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_string())
    }
}

impl From<Value> for Payload {
    fn from(v: Value) -> Self {
        Payload::json(v)
    }
}

/// Expected shape for a cache read. A cached value of another shape reads as absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueType {
    Blob,
    Json,
    Text,
    #[default]
    Any,
}

impl ValueType {
    pub fn matches(&self, payload: &Payload) -> bool {
        matches!(
            (self, payload),
            (ValueType::Any, _)
                | (ValueType::Blob, Payload::Blob(_))
                | (ValueType::Json, Payload::Json(_))
                | (ValueType::Text, Payload::Text(_))
        )
    }

    /// Empty default used when a missing entry is created on read
    pub fn empty_value(&self) -> Payload {
        match self {
            ValueType::Blob => Payload::Blob(Blob::default()),
            ValueType::Text => Payload::Text(String::new()),
            ValueType::Json | ValueType::Any => Payload::Json(Value::Object(Default::default())),
        }
    }
}

/// Encoded form of a payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub bytes: Vec<u8>,
    pub dtype: String,
}

pub fn encode(payload: &Payload) -> Encoded {
    match payload {
        Payload::Blob(b) => Encoded {
            bytes: b.data.clone(),
            dtype: b.content_type.clone(),
        },
        Payload::Json(v) => Encoded {
            bytes: v.to_string().into_bytes(),
            dtype: STRING_MIME.to_string(),
        },
        Payload::Text(s) => Encoded {
            bytes: Value::String(s.clone()).to_string().into_bytes(),
            dtype: STRING_MIME.to_string(),
        },
    }
}

pub fn decode(bytes: Vec<u8>, dtype: &str) -> Result<Payload, CodecError> {
    if dtype != STRING_MIME {
        return Ok(Payload::Blob(Blob::new(bytes, dtype)));
    }
    let value: Value = serde_json::from_slice(&bytes)?;
    Ok(Payload::from(value))
}

/// Content-addressed uid: blake3 over the type tag and encoded bytes
pub fn content_uid(payload: &Payload) -> String {
    let encoded = encode(payload);
    let mut hasher = blake3::Hasher::new();
    hasher.update(encoded.dtype.as_bytes());
    hasher.update(&[0]);
    hasher.update(&encoded.bytes);
    hasher.finalize().to_hex().to_string()
}

/// Fresh caller-assigned uid
pub fn random_uid() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn blob_keeps_raw_bytes_and_type() {
        let p = Payload::Blob(Blob::new(b"\x00\x01binary".to_vec(), "image/png"));
        let enc = encode(&p);
        assert_eq!(enc.dtype, "image/png");
        assert_eq!(enc.bytes, b"\x00\x01binary");
        assert_eq!(decode(enc.bytes, &enc.dtype).unwrap(), p);
    }

    #[test]
    fn json_and_text_use_sentinel() {
        let obj = Payload::Json(json!({"color": "blue", "n": [1, 2, 3]}));
        let enc = encode(&obj);
        assert_eq!(enc.dtype, STRING_MIME);
        assert_eq!(decode(enc.bytes, &enc.dtype).unwrap(), obj);

        let text = Payload::from("hello");
        let enc = encode(&text);
        assert_eq!(enc.bytes, b"\"hello\"");
        assert_eq!(decode(enc.bytes, &enc.dtype).unwrap(), text);
    }

    #[test]
    fn malformed_sentinel_bytes_fail_to_parse() {
        let err = decode(b"{not json".to_vec(), STRING_MIME).unwrap_err();
        assert!(matches!(err, CodecError::Parse(_)));
    }

    #[test]
    fn string_values_normalize_to_text() {
        assert_eq!(Payload::from(json!("x")), Payload::Text("x".into()));
        assert_eq!(Payload::json(json!("x")), Payload::Text("x".into()));
        assert_eq!(Payload::json(json!([1])), Payload::Json(json!([1])));
    }

    #[test]
    fn hand_built_json_string_round_trips_in_canonical_form() {
        let raw = Payload::Json(json!("plain"));
        let enc = encode(&raw);
        assert_eq!(enc, encode(&Payload::from("plain")));
        let back = decode(enc.bytes, &enc.dtype).unwrap();
        assert_eq!(back, raw.clone().normalized());
        assert_eq!(back, Payload::Text("plain".into()));
    }

    #[test]
    fn expected_type_narrowing() {
        let blob = Payload::Blob(Blob::default());
        assert!(ValueType::Blob.matches(&blob));
        assert!(!ValueType::Json.matches(&blob));
        assert!(ValueType::Any.matches(&blob));
        assert_eq!(ValueType::Text.empty_value(), Payload::Text(String::new()));
    }

    #[test]
    fn content_uid_depends_on_type_and_bytes() {
        let a = Payload::Blob(Blob::new(b"same".to_vec(), "text/plain"));
        let b = Payload::Blob(Blob::new(b"same".to_vec(), "text/html"));
        assert_ne!(content_uid(&a), content_uid(&b));
        assert_eq!(content_uid(&a), content_uid(&a.clone()));
        assert_ne!(random_uid(), random_uid());
    }
}
