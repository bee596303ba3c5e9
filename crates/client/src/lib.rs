//! tus 1.0.0 resumable-upload client engine.
//!
//! This crate implements the per-file half of the library: an [`Upload`]
//! drives one file through the tus protocol — creation, offset discovery,
//! and the chunked PATCH loop — persisting `fingerprint -> upload URL` in a
//! shared [`tuskit_store::Store`] so an interrupted upload can be resumed
//! after a process restart.
//!
//! # Pieces
//!
//! 1. **Fingerprint** — deterministic identity for a file ([`fingerprint`])
//! 2. **Metadata** — `Upload-Metadata` header codec ([`metadata`])
//! 3. **Retry** — per-chunk wait policies ([`retry`])
//! 4. **Source** — the file abstraction ([`source`])
//! 5. **Transport** — object-safe HTTP seam ([`http`])
//! 6. **Engine** — the protocol state machine ([`upload`])
//!
//! The manager crate layers a bounded-concurrency queue on top.

pub mod error;
pub mod fingerprint;
pub mod http;
pub mod metadata;
pub mod retry;
pub mod source;
pub mod speed;
pub mod upload;

pub use error::UploadError;
pub use http::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
pub use retry::RetryPolicy;
pub use source::{BytesSource, FileSource, UploadSource};
pub use speed::SpeedProbe;
pub use upload::{
    CallbackPatch, DEFAULT_CHUNK_SIZE, OnComplete, OnProgress, OnStart, ResumeRequest, Upload,
    UploadOptions, UploadOutcome, UploadRequest, UploadSnapshot, UploadState,
};
