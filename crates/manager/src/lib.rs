//! Bounded-concurrency coordinator for tus uploads.
//!
//! [`UploadManager`] owns a set of `tuskit-client` engines, enforces a
//! configurable parallelism limit over them, deduplicates submissions by
//! file fingerprint, and broadcasts lifecycle events to any number of
//! subscribers. Uploads past the limit wait in a FIFO queue and start as
//! slots free up.

pub mod manager;
pub mod types;

pub use manager::{ManagerError, UploadManager};
pub use types::{
    DEFAULT_CONCURRENCY, EventKind, ManagerOptions, UploadEvent, UploadRecord, UploadStatus,
};
