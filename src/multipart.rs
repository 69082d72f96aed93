//! Two-part `multipart/related` bodies: JSON metadata followed by the JSON document.

use crate::error::{MirrorError, Result};
use serde_json::Value;

/// Encoded upload body and the boundary that separates its parts
#[derive(Debug, Clone)]
pub struct MultipartBody {
    pub boundary: String,
    pub bytes: Vec<u8>,
}

impl MultipartBody {
    pub fn content_type(&self) -> String {
        format!("multipart/related; boundary={}", self.boundary)
    }
}

pub fn encode(metadata: &Value, document: &Value) -> Result<MultipartBody> {
    let boundary = format!("mirrorkeep-{}", uuid::Uuid::new_v4().simple());
    let metadata = serde_json::to_string(metadata)?;
    let document = serde_json::to_string(document)?;

    let text = format!(
        "--{b}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n\
         --{b}\r\nContent-Type: application/json\r\n\r\n{document}\r\n\
         --{b}--\r\n",
        b = boundary
    );

    Ok(MultipartBody {
        boundary,
        bytes: text.into_bytes(),
    })
}

/// Pull the boundary parameter out of a `Content-Type` header value.
pub fn boundary_from_content_type(content_type: &str) -> Option<&str> {
    content_type
        .split(';')
        .map(str::trim)
        .find_map(|param| param.strip_prefix("boundary="))
        .map(|b| b.trim_matches('"'))
}

/// Split a body produced by [`encode`] back into `(metadata, document)`.
pub fn decode(boundary: &str, bytes: &[u8]) -> Result<(Value, Value)> {
    let text = std::str::from_utf8(bytes).map_err(|e| MirrorError::Multipart(e.to_string()))?;
    let delimiter = format!("--{boundary}");

    let mut parts = Vec::with_capacity(2);
    for chunk in text.split(delimiter.as_str()).skip(1) {
        if chunk.starts_with("--") {
            break;
        }
        let (_headers, body) = chunk
            .split_once("\r\n\r\n")
            .ok_or_else(|| MirrorError::Multipart("part without header separator".into()))?;
        let body = body.strip_suffix("\r\n").unwrap_or(body);
        parts.push(serde_json::from_str::<Value>(body)?);
    }

    let mut parts = parts.into_iter();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(metadata), Some(document), None) => Ok((metadata, document)),
        _ => Err(MirrorError::Multipart("expected exactly two parts".into())),
    }
}
