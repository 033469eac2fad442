//! Merge law for writes onto an existing value

use serde_json::Value;

use crate::codec::{Blob, Payload};
use crate::error::{CacheError, CacheResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    #[default]
    Overwrite,
    Append,
    Prepend,
}

fn mismatch(stored: &Payload, given: &Payload) -> CacheError {
    CacheError::TypeMismatch {
        stored: stored.type_name(),
        given: given.type_name(),
    }
}

/// Combine `old` and `new` according to `mode`.
///
/// Strings concatenate, objects take a shallow key union (the later side of
/// the concatenation wins on shared keys), arrays concatenate and blobs of
/// the same content type concatenate their bytes. Anything else is a type
/// mismatch.
pub fn merge(old: Option<&Payload>, new: Payload, mode: WriteMode) -> CacheResult<Payload> {
    let Some(old) = old else {
        return Ok(new);
    };
    let (first, second) = match mode {
        WriteMode::Overwrite => return Ok(new),
        WriteMode::Append => (old, &new),
        WriteMode::Prepend => (&new, old),
    };
    let merged = match (first, second) {
        (Payload::Text(a), Payload::Text(b)) => Payload::Text(format!("{a}{b}")),
        (Payload::Json(Value::Object(a)), Payload::Json(Value::Object(b))) => {
            let mut out = a.clone();
            for (k, v) in b {
                out.insert(k.clone(), v.clone());
            }
            Payload::Json(Value::Object(out))
        }
        (Payload::Json(Value::Array(a)), Payload::Json(Value::Array(b))) => {
            Payload::Json(Value::Array(a.iter().chain(b).cloned().collect()))
        }
        (Payload::Blob(a), Payload::Blob(b)) if a.content_type == b.content_type => {
            let mut data = Vec::with_capacity(a.len() + b.len());
            data.extend_from_slice(&a.data);
            data.extend_from_slice(&b.data);
            Payload::Blob(Blob::new(data, a.content_type.clone()))
        }
        _ => return Err(mismatch(old, &new)),
    };
    Ok(merged)
}
