//! Upload error types.

use crate::metadata::MetadataError;

/// Errors produced by the upload engine.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// The source file went missing or became unreadable. Fatal.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection-level failure: reset, DNS, timeout, aborted request.
    /// Retried at the chunk level up to the configured budget.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server violated the tus contract. Carries the HTTP status when
    /// one was received.
    #[error("protocol error: {message}")]
    Protocol {
        status: Option<u16>,
        message: String,
    },

    /// Operation called in an incompatible engine state.
    #[error("invalid state: {0}")]
    State(String),

    /// A prior upload exists for this fingerprint but the server has lost
    /// it; the stale store entry has been removed.
    #[error("duplicate upload: {0}")]
    Duplicate(String),

    #[error("store error: {0}")]
    Store(#[from] tuskit_store::StoreError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),
}

impl UploadError {
    /// HTTP status attached to a protocol error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            UploadError::Protocol { status, .. } => *status,
            _ => None,
        }
    }
}
