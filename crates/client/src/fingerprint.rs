//! Deterministic file fingerprints for resumption lookup.

use sha2::{Digest, Sha256};

/// Derives a stable identifier for a file from its name, size, and MIME
/// type.
///
/// The fingerprint is the SHA-256 hex digest of the `::`-joined parts: the
/// file name, `size-<N>` (or `size-dynamic` when the size is unknown at
/// construction), and `mime-<MIME>` when a non-empty MIME type is present.
/// It carries no path, wall-clock, or random component, so it is identical
/// across platforms and process restarts and safe to use as a store key.
pub fn fingerprint(name: &str, size: Option<u64>, mime: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b"::");
    match size {
        Some(n) => {
            hasher.update(b"size-");
            hasher.update(n.to_string().as_bytes());
        }
        None => hasher.update(b"size-dynamic"),
    }
    if let Some(mime) = mime.filter(|m| !m.is_empty()) {
        hasher.update(b"::mime-");
        hasher.update(mime.as_bytes());
    }
    hex::encode(hasher.finalize())
}
