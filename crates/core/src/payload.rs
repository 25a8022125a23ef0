//! Webhook body normalization.
//!
//! Some deployments post JSON, others post form-encoded bodies; both are
//! normalized into one `serde_json::Value` before any event decoding, so the
//! decoders never see the transport encoding. Unrecognized shapes fail
//! closed instead of degrading into empty strings.

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("empty webhook body")]
    Empty,
    #[error("malformed {encoding} payload: {detail}")]
    Malformed { encoding: &'static str, detail: String },
    #[error("unsupported content type `{0}`")]
    UnsupportedContentType(String),
}

/// Decode a raw webhook body into a JSON value.
///
/// Content type wins when present; without one, the body is sniffed (JSON
/// starts with `{` or `[`). Form-encoded fields whose values are themselves
/// JSON documents (the common `data=...` gateway convention) are inlined.
pub fn decode_body(content_type: Option<&str>, raw: &[u8]) -> Result<Value, PayloadError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Err(PayloadError::Empty);
    }

    match content_type.map(|value| value.to_ascii_lowercase()) {
        Some(header) if header.contains("json") => decode_json(raw),
        Some(header) if header.contains("x-www-form-urlencoded") => decode_form(raw),
        Some(header) => Err(PayloadError::UnsupportedContentType(header)),
        None => {
            let first = raw.iter().find(|byte| !byte.is_ascii_whitespace()).copied();
            if matches!(first, Some(b'{') | Some(b'[')) {
                decode_json(raw)
            } else {
                decode_form(raw)
            }
        }
    }
}

fn decode_json(raw: &[u8]) -> Result<Value, PayloadError> {
    serde_json::from_slice(raw)
        .map_err(|error| PayloadError::Malformed { encoding: "json", detail: error.to_string() })
}

fn decode_form(raw: &[u8]) -> Result<Value, PayloadError> {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(raw).map_err(|error| {
        PayloadError::Malformed { encoding: "form", detail: error.to_string() }
    })?;
    if pairs.is_empty() {
        return Err(PayloadError::Empty);
    }

    let mut object = Map::new();
    for (key, value) in pairs {
        let trimmed = value.trim_start();
        let inlined = if trimmed.starts_with('{') || trimmed.starts_with('[') {
            serde_json::from_str(&value).unwrap_or(Value::String(value))
        } else {
            Value::String(value)
        };
        object.insert(key, inlined);
    }
    Ok(Value::Object(object))
}
