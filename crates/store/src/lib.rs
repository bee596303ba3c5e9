//! Resumption state storage for tus uploads.
//!
//! Maps file fingerprints to upload URLs so an interrupted upload can be
//! resumed across process restarts. Three backends are provided: a volatile
//! in-memory map, a one-file-per-fingerprint directory layout, and a
//! single-file JSON database.

mod fs;
mod kv;
mod memory;

pub use fs::FsStore;
pub use kv::KvStore;
pub use memory::MemoryStore;

use std::future::Future;
use std::pin::Pin;

/// Errors produced by store backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Future returned by [`Store`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Persistent mapping from file fingerprint to upload URL.
///
/// At most one URL exists per fingerprint; an absent entry means there is no
/// resumable state. Implementations must be safe under concurrent
/// `set`/`get`/`remove` — engines and the upload manager share one store
/// behind an `Arc`.
pub trait Store: Send + Sync {
    /// Records the upload URL for a fingerprint, replacing any prior entry.
    fn set<'a>(&'a self, fingerprint: &'a str, url: &'a str) -> StoreFuture<'a, ()>;

    /// Returns the upload URL for a fingerprint, if present.
    fn get<'a>(&'a self, fingerprint: &'a str) -> StoreFuture<'a, Option<String>>;

    /// Removes the entry for a fingerprint. Removing an absent entry is not
    /// an error.
    fn remove<'a>(&'a self, fingerprint: &'a str) -> StoreFuture<'a, ()>;
}
