//! Public types for the upload manager.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use tuskit_client::{DEFAULT_CHUNK_SIZE, HttpTransport, ReqwestTransport, RetryPolicy};
use tuskit_store::Store;

/// Default parallelism bound.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Status of a managed upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Ready,
    Uploading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl UploadStatus {
    /// True for states that can never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadStatus::Completed | UploadStatus::Failed | UploadStatus::Cancelled
        )
    }
}

/// Snapshot of a managed upload, carried by every event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRecord {
    pub id: String,
    pub fingerprint: String,
    pub status: UploadStatus,
    /// Percent complete in `[0, 100]`.
    pub progress: f64,
    /// Last time-to-completion estimate, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    pub updated_at: u64,
}

/// What happened to a managed upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Add,
    Start,
    Progress,
    Pause,
    Resume,
    Complete,
    Error,
    Cancel,
}

/// Broadcast payload delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadEvent {
    pub upload: UploadRecord,
    pub kind: EventKind,
}

/// Manager configuration.
#[derive(Clone)]
pub struct ManagerOptions {
    /// tus collection endpoint uploads are created against.
    pub endpoint: Url,
    /// Resumption store shared by every engine.
    pub store: Arc<dyn Store>,
    /// HTTP transport shared by every engine.
    pub transport: Arc<dyn HttpTransport>,
    /// Default bytes per PATCH; overridable per upload.
    pub chunk_size: u64,
    /// Maximum simultaneously running uploads.
    pub concurrency: usize,
    /// Start uploads as soon as they are added.
    pub auto_start: bool,
    /// Run the bandwidth probe before each upload.
    pub measure_speed: bool,
    /// Reject submissions whose fingerprint is already managed, and consult
    /// the store before creating server-side uploads.
    pub prevent_duplicates: bool,
    pub retries: u32,
    pub retry_policy: RetryPolicy,
    pub retry_interval: Duration,
    /// Log event dispatch at debug level.
    pub debug: bool,
}

impl ManagerOptions {
    /// Creates options with library defaults and a reqwest transport.
    pub fn new(endpoint: Url, store: Arc<dyn Store>) -> Self {
        Self {
            endpoint,
            store,
            transport: Arc::new(ReqwestTransport::new()),
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            auto_start: true,
            measure_speed: false,
            prevent_duplicates: true,
            retries: 0,
            retry_policy: RetryPolicy::default(),
            retry_interval: Duration::ZERO,
            debug: false,
        }
    }
}
