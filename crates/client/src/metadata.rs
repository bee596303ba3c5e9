//! `Upload-Metadata` header codec.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

/// Errors from metadata encoding.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    /// Keys may contain only ASCII letters, digits, `-` and `_`.
    #[error("invalid metadata key: {0:?}")]
    InvalidKey(String),
}

/// Encodes user metadata per the tus `Upload-Metadata` grammar.
///
/// Pairs are emitted in key order as `key SP base64(value)`, joined by
/// commas. Values are UTF-8 bytes, base64-encoded with padding. A key with
/// an empty value is emitted bare. An empty map encodes to an empty string,
/// in which case the header is omitted from the creation request.
pub fn encode(metadata: &BTreeMap<String, String>) -> Result<String, MetadataError> {
    let mut parts = Vec::with_capacity(metadata.len());
    for (key, value) in metadata {
        if !is_valid_key(key) {
            return Err(MetadataError::InvalidKey(key.clone()));
        }
        if value.is_empty() {
            parts.push(key.clone());
        } else {
            parts.push(format!("{key} {}", STANDARD.encode(value.as_bytes())));
        }
    }
    Ok(parts.join(","))
}

fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
