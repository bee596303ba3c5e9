//! The per-file upload engine: a tus 1.0.0 protocol state machine.
//!
//! One [`Upload`] drives a single source through creation, offset discovery,
//! and the chunked PATCH loop. The engine owns its descriptor; the store is
//! shared, so a second process (or a later run) can pick an upload back up
//! from wherever the server says it stopped.
//!
//! # Flow
//!
//! 1. **Lookup** — with duplicate prevention on, a prior store entry is
//!    verified with `HEAD` and adopted when the server still knows the upload
//! 2. **Create** — otherwise `POST` mints a new upload URL, persisted to the
//!    store before any bytes move
//! 3. **Patch** — chunks go out in strict offset order, each retried per the
//!    configured policy, until the server acknowledges the final byte
//!
//! `pause` flips a shared atomic flag and aborts the in-flight request; the
//! loop settles the current chunk and exits. `cancel` pauses best-effort and
//! removes the store entry.

use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reqwest::{Method, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use tuskit_store::Store;

use crate::error::UploadError;
use crate::fingerprint::fingerprint;
use crate::http::{
    self, HEADER_LOCATION, HEADER_TUS_RESUMABLE, HEADER_UPLOAD_LENGTH, HEADER_UPLOAD_METADATA,
    HEADER_UPLOAD_OFFSET, HttpRequest, HttpTransport, OFFSET_OCTET_STREAM, TUS_VERSION,
};
use crate::metadata;
use crate::retry::RetryPolicy;
use crate::source::UploadSource;
use crate::speed::SpeedProbe;

/// Default chunk size: 512 KiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 512 * 1024;

/// Engine construction options.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Bytes per PATCH request.
    pub chunk_size: u64,
    /// Retries per chunk after the first attempt.
    pub retries: u32,
    /// Spacing strategy for those retries.
    pub retry_policy: RetryPolicy,
    /// Base interval fed to the policy.
    pub retry_interval: Duration,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            retries: 0,
            retry_policy: RetryPolicy::default(),
            retry_interval: Duration::ZERO,
        }
    }
}

/// Lifecycle states of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    Creating,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

/// How a call to [`Upload::upload`] or [`Upload::resume`] settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// All bytes acknowledged by the server.
    Completed,
    /// The pause flag was observed; the upload can be resumed.
    Paused,
    /// The call had nothing to do in the current state.
    Noop,
}

/// Observable state snapshot, passed to `on_start`.
#[derive(Debug, Clone)]
pub struct UploadSnapshot {
    pub fingerprint: String,
    pub upload_url: Option<Url>,
    pub offset: u64,
    pub size: u64,
}

/// Invoked once before the first PATCH, with an estimated total duration
/// when a bandwidth measurement is available.
pub type OnStart = Box<dyn Fn(UploadSnapshot, Option<Duration>) + Send + Sync>;
/// Invoked after each successful chunk with percent complete and ETA.
pub type OnProgress = Box<dyn Fn(f64, Duration) + Send + Sync>;
/// Invoked once after the final chunk and store cleanup.
pub type OnComplete = Box<dyn Fn() + Send + Sync>;

/// Patch applied to one callback slot on resume. Clear beats new beats keep.
pub enum CallbackPatch<T> {
    /// Retain whatever the slot holds.
    Keep,
    /// Empty the slot.
    Clear,
    /// Replace the slot.
    Set(T),
}

// Hand-written so callback types, which are not `Default`, still get the
// `Keep` default.
impl<T> Default for CallbackPatch<T> {
    fn default() -> Self {
        CallbackPatch::Keep
    }
}

impl<T> CallbackPatch<T> {
    fn apply(self, slot: &mut Option<T>) {
        match self {
            CallbackPatch::Keep => {}
            CallbackPatch::Clear => *slot = None,
            CallbackPatch::Set(value) => *slot = Some(value),
        }
    }
}

/// Parameters for [`Upload::upload`].
pub struct UploadRequest {
    /// tus collection endpoint the upload is created against.
    pub endpoint: Url,
    /// User headers merged into every request.
    pub headers: HashMap<String, String>,
    /// User metadata sent as `Upload-Metadata` on creation.
    pub metadata: BTreeMap<String, String>,
    /// Run the bandwidth probe before uploading.
    pub measure_speed: bool,
    /// Consult the store before creating a new upload.
    pub prevent_duplicates: bool,
    pub on_start: Option<OnStart>,
    pub on_progress: Option<OnProgress>,
    pub on_complete: Option<OnComplete>,
}

impl UploadRequest {
    /// Creates a request with default flags: duplicates prevented, no probe.
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            headers: HashMap::new(),
            metadata: BTreeMap::new(),
            measure_speed: false,
            prevent_duplicates: true,
            on_start: None,
            on_progress: None,
            on_complete: None,
        }
    }
}

/// Parameters for [`Upload::resume`].
#[derive(Default)]
pub struct ResumeRequest {
    pub on_start: CallbackPatch<OnStart>,
    pub on_progress: CallbackPatch<OnProgress>,
    pub on_complete: CallbackPatch<OnComplete>,
}

/// Everything needed to (re-)create the upload on the server.
#[derive(Clone)]
struct CreationContext {
    endpoint: Url,
    headers: HashMap<String, String>,
    encoded_metadata: String,
}

/// Mutable descriptor, guarded by the engine mutex.
struct Inner {
    state: UploadState,
    upload_url: Option<Url>,
    offset: u64,
    size: u64,
    bandwidth: Option<f64>,
    creation: Option<CreationContext>,
}

#[derive(Default)]
struct Callbacks {
    on_start: Option<OnStart>,
    on_progress: Option<OnProgress>,
    on_complete: Option<OnComplete>,
}

/// Retryability classification for one chunk attempt.
enum ChunkError {
    /// Transport failure or non-2xx status; eligible for the retry budget.
    Retryable(UploadError),
    /// tus contract violation; surfaces immediately.
    Fatal(UploadError),
}

/// The upload engine for one source file.
pub struct Upload {
    source: Arc<dyn UploadSource>,
    store: Option<Arc<dyn Store>>,
    transport: Arc<dyn HttpTransport>,
    options: UploadOptions,
    fingerprint: String,
    inner: Mutex<Inner>,
    paused: AtomicBool,
    /// Abort token for the request window currently in flight, if any.
    inflight: Mutex<Option<CancellationToken>>,
    callbacks: Mutex<Callbacks>,
    /// Serializes runs so a resume cannot overlap a loop that is still
    /// settling its final chunk after a pause.
    run_lock: tokio::sync::Mutex<()>,
}

impl Upload {
    /// Constructs an engine. Computes the fingerprint from the source
    /// attributes; performs no I/O. Passing no store disables resumption.
    pub fn new(
        source: Arc<dyn UploadSource>,
        store: Option<Arc<dyn Store>>,
        transport: Arc<dyn HttpTransport>,
        options: UploadOptions,
    ) -> Self {
        let fingerprint = fingerprint(source.name(), source.size_hint(), source.content_type());
        Self {
            source,
            store,
            transport,
            options,
            fingerprint,
            inner: Mutex::new(Inner {
                state: UploadState::Idle,
                upload_url: None,
                offset: 0,
                size: 0,
                bandwidth: None,
                creation: None,
            }),
            paused: AtomicBool::new(false),
            inflight: Mutex::new(None),
            callbacks: Mutex::new(Callbacks::default()),
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The deterministic fingerprint of the source.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Current lifecycle state.
    pub fn state(&self) -> UploadState {
        self.inner.lock().unwrap().state
    }

    /// Snapshot of the observable descriptor.
    pub fn snapshot(&self) -> UploadSnapshot {
        let inner = self.inner.lock().unwrap();
        UploadSnapshot {
            fingerprint: self.fingerprint.clone(),
            upload_url: inner.upload_url.clone(),
            offset: inner.offset,
            size: inner.size,
        }
    }

    /// Drives the full protocol. Returns when the upload completes, is
    /// paused, or fails.
    pub async fn upload(&self, request: UploadRequest) -> Result<UploadOutcome, UploadError> {
        let _run = self.run_lock.lock().await;
        {
            let inner = self.inner.lock().unwrap();
            match inner.state {
                UploadState::Idle | UploadState::Failed => {}
                UploadState::Paused => {
                    return Err(UploadError::State(
                        "upload is paused; call resume() to continue".into(),
                    ));
                }
                other => {
                    return Err(UploadError::State(format!(
                        "upload() not permitted in state {other:?}"
                    )));
                }
            }
        }

        {
            let mut callbacks = self.callbacks.lock().unwrap();
            if let Some(cb) = request.on_start {
                callbacks.on_start = Some(cb);
            }
            if let Some(cb) = request.on_progress {
                callbacks.on_progress = Some(cb);
            }
            if let Some(cb) = request.on_complete {
                callbacks.on_complete = Some(cb);
            }
        }
        self.paused.store(false, Ordering::SeqCst);

        let context = CreationContext {
            endpoint: request.endpoint,
            headers: request.headers,
            encoded_metadata: metadata::encode(&request.metadata)?,
        };
        match self
            .run_upload(context, request.measure_speed, request.prevent_duplicates)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.set_state(UploadState::Failed);
                Err(e)
            }
        }
    }

    async fn run_upload(
        &self,
        context: CreationContext,
        measure_speed: bool,
        prevent_duplicates: bool,
    ) -> Result<UploadOutcome, UploadError> {
        let total = self.resolve_total().await?;
        {
            let mut inner = self.inner.lock().unwrap();
            inner.size = total;
            inner.creation = Some(context.clone());
        }

        let mut resumed = false;
        if prevent_duplicates
            && let Some(store) = &self.store
            && let Some(prior) = store.get(&self.fingerprint).await?
        {
            match self.probe_offset(&prior).await {
                Some((url, offset)) => {
                    debug!(fingerprint = %self.fingerprint, offset, "resuming prior upload");
                    {
                        let mut inner = self.inner.lock().unwrap();
                        inner.upload_url = Some(url);
                        inner.offset = offset;
                    }
                    self.begin_running();
                    resumed = true;
                }
                None => {
                    warn!(
                        fingerprint = %self.fingerprint,
                        "server no longer knows the prior upload, dropping stale entry"
                    );
                    if let Err(e) = store.remove(&self.fingerprint).await {
                        warn!(error = %e, "failed to remove stale store entry");
                    }
                    return Err(UploadError::Duplicate(
                        "a prior upload exists for this file but the server has lost it; \
                         retry with duplicate prevention disabled to force a new upload"
                            .into(),
                    ));
                }
            }
        }

        if !resumed {
            self.set_state(UploadState::Creating);
            let url = self.create_upload(&context, total).await?;
            if let Some(store) = &self.store {
                store.set(&self.fingerprint, url.as_str()).await?;
            }
            {
                let mut inner = self.inner.lock().unwrap();
                inner.upload_url = Some(url);
                inner.offset = 0;
            }
            self.begin_running();
        }

        // A cancel that raced the lookup or creation wins; whatever the
        // creation wrote to the store is cleaned back out.
        if self.state() == UploadState::Cancelled {
            self.remove_store_entry_best_effort().await;
            return Ok(UploadOutcome::Paused);
        }

        let bandwidth = if measure_speed {
            SpeedProbe::new(self.transport.clone()).measure().await
        } else {
            None
        };
        self.inner.lock().unwrap().bandwidth = bandwidth;

        let estimate = bandwidth
            .filter(|b| *b > 0.0)
            .map(|b| Duration::from_secs_f64(total as f64 / b));
        self.invoke_on_start(estimate);

        self.patch_loop().await
    }

    /// Re-verifies server state and continues from the server's offset.
    ///
    /// A no-op unless the engine is paused with a known upload URL. Callback
    /// slots are patched first: clear beats new beats keep.
    pub async fn resume(&self, request: ResumeRequest) -> Result<UploadOutcome, UploadError> {
        let _run = self.run_lock.lock().await;
        let url = {
            let inner = self.inner.lock().unwrap();
            match (inner.state, &inner.upload_url) {
                (UploadState::Paused, Some(url)) => url.clone(),
                _ => {
                    debug!(
                        fingerprint = %self.fingerprint,
                        "resume ignored: not paused with a known URL"
                    );
                    return Ok(UploadOutcome::Noop);
                }
            }
        };

        {
            let mut callbacks = self.callbacks.lock().unwrap();
            request.on_start.apply(&mut callbacks.on_start);
            request.on_progress.apply(&mut callbacks.on_progress);
            request.on_complete.apply(&mut callbacks.on_complete);
        }
        self.paused.store(false, Ordering::SeqCst);
        self.set_state(UploadState::Running);

        match self.run_resume(&url).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.set_state(UploadState::Failed);
                Err(e)
            }
        }
    }

    async fn run_resume(&self, url: &Url) -> Result<UploadOutcome, UploadError> {
        match self.probe_offset(url.as_str()).await {
            Some((url, offset)) => {
                debug!(fingerprint = %self.fingerprint, offset, "resuming from server offset");
                let mut inner = self.inner.lock().unwrap();
                inner.upload_url = Some(url);
                inner.offset = offset;
            }
            None => {
                // The server lost the upload; recreate it from the
                // remembered creation context.
                warn!(fingerprint = %self.fingerprint, "server lost the upload, creating fresh");
                let (context, total) = {
                    let inner = self.inner.lock().unwrap();
                    let context = inner.creation.clone().ok_or_else(|| {
                        UploadError::State("no creation context to recreate the upload".into())
                    })?;
                    (context, inner.size)
                };
                if let Some(store) = &self.store
                    && let Err(e) = store.remove(&self.fingerprint).await
                {
                    warn!(error = %e, "failed to remove stale store entry");
                }
                let new_url = self.create_upload(&context, total).await?;
                if let Some(store) = &self.store {
                    store.set(&self.fingerprint, new_url.as_str()).await?;
                }
                let mut inner = self.inner.lock().unwrap();
                inner.upload_url = Some(new_url);
                inner.offset = 0;
            }
        }
        if self.state() == UploadState::Cancelled {
            self.remove_store_entry_best_effort().await;
            return Ok(UploadOutcome::Paused);
        }
        self.patch_loop().await
    }

    /// Requests a pause. The loop exits once the current chunk settles; an
    /// in-flight request is aborted immediately. Returns `false` only when
    /// the upload is already terminal.
    pub fn pause(&self) -> bool {
        let state = self.inner.lock().unwrap().state;
        if matches!(state, UploadState::Completed | UploadState::Cancelled) {
            return false;
        }
        self.paused.store(true, Ordering::SeqCst);
        if let Some(token) = self.inflight.lock().unwrap().as_ref() {
            token.cancel();
        }
        debug!(fingerprint = %self.fingerprint, "pause requested");
        true
    }

    /// Cancels the upload: best-effort pause, then store cleanup.
    /// Idempotent; the store entry is removed even when the pause failed.
    pub async fn cancel(&self) -> Result<(), UploadError> {
        if !self.pause() {
            debug!(
                fingerprint = %self.fingerprint,
                "pause refused during cancel, removing store entry anyway"
            );
        }
        self.set_state(UploadState::Cancelled);
        if let Some(store) = &self.store {
            store.remove(&self.fingerprint).await?;
        }
        info!(fingerprint = %self.fingerprint, "upload cancelled");
        Ok(())
    }

    /// True when resumption is enabled, a store entry exists, and the server
    /// confirms the upload with a valid `Upload-Offset`.
    pub async fn is_resumable(&self) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        match store.get(&self.fingerprint).await {
            Ok(Some(url)) => self.probe_offset(&url).await.is_some(),
            _ => false,
        }
    }

    // -----------------------------------------------------------------------
    // Protocol steps
    // -----------------------------------------------------------------------

    async fn resolve_total(&self) -> Result<u64, UploadError> {
        match self.source.size_hint() {
            Some(n) if n > 0 => Ok(n),
            // Unknown or reported as zero: materialize the real length.
            _ => Ok(self.source.resolve_len().await?),
        }
    }

    /// `HEAD`s a stored upload URL. `Some` only for a 2xx response carrying
    /// a parseable `Upload-Offset`.
    async fn probe_offset(&self, url: &str) -> Option<(Url, u64)> {
        let url = Url::parse(http::truncate_at_comma(url)).ok()?;
        let mut request = HttpRequest::new(Method::HEAD, url.clone());
        self.apply_common_headers(&mut request).ok()?;
        let response = self.transport.send(request).await.ok()?;
        if !response.status.is_success() {
            return None;
        }
        let offset = response
            .header(HEADER_UPLOAD_OFFSET)
            .and_then(http::parse_offset)?;
        Some((url, offset))
    }

    async fn create_upload(
        &self,
        context: &CreationContext,
        total: u64,
    ) -> Result<Url, UploadError> {
        let mut request = HttpRequest::new(Method::POST, context.endpoint.clone());
        for (name, value) in &context.headers {
            request.set_header(name, value)?;
        }
        request.set_header(HEADER_TUS_RESUMABLE, TUS_VERSION)?;
        request.set_header(HEADER_UPLOAD_LENGTH, &total.to_string())?;
        if !context.encoded_metadata.is_empty() {
            request.set_header(HEADER_UPLOAD_METADATA, &context.encoded_metadata)?;
        }

        let response = self.transport.send(request).await?;
        let status = response.status;
        // 404 is tolerated for servers that redirect unknown creations.
        if !(status.is_success() || status == StatusCode::NOT_FOUND) {
            return Err(UploadError::Protocol {
                status: Some(status.as_u16()),
                message: format!("creation failed with status {status}"),
            });
        }
        let location = response.header(HEADER_LOCATION).ok_or_else(|| {
            UploadError::Protocol {
                status: Some(status.as_u16()),
                message: "creation response missing Location header".into(),
            }
        })?;
        let url = http::resolve_location(&context.endpoint, location)?;
        info!(fingerprint = %self.fingerprint, url = %url, "upload created");
        Ok(url)
    }

    async fn patch_loop(&self) -> Result<UploadOutcome, UploadError> {
        let (url, total, start_offset, bandwidth) = {
            let inner = self.inner.lock().unwrap();
            let url = inner
                .upload_url
                .clone()
                .ok_or_else(|| UploadError::State("no upload URL".into()))?;
            (url, inner.size, inner.offset, inner.bandwidth)
        };
        let started = Instant::now();
        let mut offset = start_offset;

        loop {
            if offset >= total {
                return self.finish().await;
            }
            if self.paused.load(Ordering::SeqCst) {
                self.pause_state();
                return Ok(UploadOutcome::Paused);
            }

            let end = (offset + self.options.chunk_size).min(total);
            let buffer = self.source.read_range(offset, end).await?;
            let read = buffer.len() as u64;

            // Pause may have been requested while reading.
            if self.paused.load(Ordering::SeqCst) {
                self.pause_state();
                return Ok(UploadOutcome::Paused);
            }

            let server_offset = match self.send_chunk_with_retries(&url, offset, &buffer).await {
                Ok(server_offset) => server_offset,
                Err(e) if self.paused.load(Ordering::SeqCst) => {
                    // Error raised by the pause abort; swallowed along this
                    // path only.
                    debug!(fingerprint = %self.fingerprint, error = %e, "chunk settled by pause");
                    self.pause_state();
                    return Ok(UploadOutcome::Paused);
                }
                Err(e) => return Err(e),
            };

            // The server is authoritative for the next offset.
            offset = server_offset;
            self.inner.lock().unwrap().offset = offset;

            let percent = ((offset.min(total) as f64) / total as f64 * 100.0).clamp(0.0, 100.0);
            let eta = estimate_eta(total, offset, start_offset, started.elapsed(), bandwidth);
            self.invoke_on_progress(percent, eta);
        }
    }

    /// Final-chunk bookkeeping: store cleanup, then the completion callback.
    async fn finish(&self) -> Result<UploadOutcome, UploadError> {
        if let Some(store) = &self.store
            && let Err(e) = store.remove(&self.fingerprint).await
        {
            warn!(
                fingerprint = %self.fingerprint,
                error = %e,
                "failed to remove store entry after completion"
            );
        }
        self.set_state(UploadState::Completed);
        info!(fingerprint = %self.fingerprint, "upload complete");
        self.invoke_on_complete();
        Ok(UploadOutcome::Completed)
    }

    async fn send_chunk_with_retries(
        &self,
        url: &Url,
        offset: u64,
        body: &[u8],
    ) -> Result<u64, UploadError> {
        let mut attempt: u32 = 0;
        loop {
            match self.send_chunk(url, offset, body).await {
                Ok(server_offset) => return Ok(server_offset),
                Err(ChunkError::Retryable(e))
                    if attempt < self.options.retries && !self.paused.load(Ordering::SeqCst) =>
                {
                    let delay = self
                        .options
                        .retry_policy
                        .interval(attempt, self.options.retry_interval);
                    warn!(
                        fingerprint = %self.fingerprint,
                        offset,
                        attempt,
                        delay_secs = delay.as_secs_f64(),
                        error = %e,
                        "chunk failed, retrying"
                    );
                    attempt += 1;
                    // The sleep is a pause point too.
                    if self
                        .with_abort(async {
                            tokio::time::sleep(delay).await;
                            Ok(())
                        })
                        .await
                        .is_err()
                    {
                        return Err(e);
                    }
                }
                Err(ChunkError::Retryable(e)) | Err(ChunkError::Fatal(e)) => return Err(e),
            }
        }
    }

    async fn send_chunk(&self, url: &Url, offset: u64, body: &[u8]) -> Result<u64, ChunkError> {
        let read = body.len() as u64;
        let mut request = HttpRequest::new(Method::PATCH, url.clone());
        self.apply_common_headers(&mut request)
            .map_err(ChunkError::Fatal)?;
        request
            .set_header(HEADER_UPLOAD_OFFSET, &offset.to_string())
            .map_err(ChunkError::Fatal)?;
        request
            .set_header("Content-Type", OFFSET_OCTET_STREAM)
            .map_err(ChunkError::Fatal)?;
        request.body = Some(body.to_vec());

        let response = self
            .with_abort(self.transport.send(request))
            .await
            .map_err(ChunkError::Retryable)?;

        if !response.status.is_success() {
            return Err(ChunkError::Retryable(UploadError::Protocol {
                status: Some(response.status.as_u16()),
                message: format!("PATCH failed with status {}", response.status),
            }));
        }
        let server_offset = response
            .header(HEADER_UPLOAD_OFFSET)
            .and_then(http::parse_offset)
            .ok_or_else(|| {
                ChunkError::Fatal(UploadError::Protocol {
                    status: Some(response.status.as_u16()),
                    message: "PATCH response missing or invalid Upload-Offset".into(),
                })
            })?;
        if server_offset != offset + read && server_offset != offset {
            return Err(ChunkError::Fatal(UploadError::Protocol {
                status: Some(response.status.as_u16()),
                message: format!(
                    "server offset {server_offset} disagrees with local offset {offset} (+{read})"
                ),
            }));
        }
        debug!(offset, read, server_offset, "chunk acknowledged");
        Ok(server_offset)
    }

    /// Applies user headers (from the remembered creation context) and the
    /// protocol version header, which always wins.
    fn apply_common_headers(&self, request: &mut HttpRequest) -> Result<(), UploadError> {
        let headers = {
            let inner = self.inner.lock().unwrap();
            inner
                .creation
                .as_ref()
                .map(|c| c.headers.clone())
                .unwrap_or_default()
        };
        for (name, value) in &headers {
            request.set_header(name, value)?;
        }
        request.set_header(HEADER_TUS_RESUMABLE, TUS_VERSION)?;
        Ok(())
    }

    /// Runs `future` racing the abort token registered for this request
    /// window, so `pause` can interrupt mid-flight.
    async fn with_abort<F, T>(&self, future: F) -> Result<T, UploadError>
    where
        F: Future<Output = Result<T, UploadError>>,
    {
        let token = CancellationToken::new();
        *self.inflight.lock().unwrap() = Some(token.clone());
        // A pause that landed between the caller's flag check and the
        // registration above missed this token; honor it now.
        if self.paused.load(Ordering::SeqCst) {
            token.cancel();
        }
        let result = tokio::select! {
            result = future => result,
            _ = token.cancelled() => Err(UploadError::Transport("request aborted".into())),
        };
        *self.inflight.lock().unwrap() = None;
        result
    }

    fn set_state(&self, state: UploadState) {
        self.inner.lock().unwrap().state = state;
    }

    /// Running is never entered over a concurrent cancel.
    fn begin_running(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != UploadState::Cancelled {
            inner.state = UploadState::Running;
        }
    }

    /// Paused is only entered from Running; a concurrent cancel wins.
    fn pause_state(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == UploadState::Running {
            inner.state = UploadState::Paused;
        }
    }

    async fn remove_store_entry_best_effort(&self) {
        if let Some(store) = &self.store
            && let Err(e) = store.remove(&self.fingerprint).await
        {
            warn!(
                fingerprint = %self.fingerprint,
                error = %e,
                "failed to remove store entry"
            );
        }
    }

    // -----------------------------------------------------------------------
    // Callbacks
    // -----------------------------------------------------------------------
    // Invoked synchronously; a panicking callback must never take the upload
    // down with it.

    fn invoke_on_start(&self, estimate: Option<Duration>) {
        let callbacks = self.callbacks.lock().unwrap();
        if let Some(cb) = &callbacks.on_start {
            let snapshot = self.snapshot();
            if panic::catch_unwind(AssertUnwindSafe(|| cb(snapshot, estimate))).is_err() {
                warn!(fingerprint = %self.fingerprint, "on_start callback panicked");
            }
        }
    }

    fn invoke_on_progress(&self, percent: f64, eta: Duration) {
        let callbacks = self.callbacks.lock().unwrap();
        if let Some(cb) = &callbacks.on_progress
            && panic::catch_unwind(AssertUnwindSafe(|| cb(percent, eta))).is_err()
        {
            warn!(fingerprint = %self.fingerprint, "on_progress callback panicked");
        }
    }

    fn invoke_on_complete(&self) {
        let callbacks = self.callbacks.lock().unwrap();
        if let Some(cb) = &callbacks.on_complete
            && panic::catch_unwind(AssertUnwindSafe(|| cb())).is_err()
        {
            warn!(fingerprint = %self.fingerprint, "on_complete callback panicked");
        }
    }
}

/// Estimates time to completion: measured bandwidth when available, else the
/// observed rate of this run. Remaining bytes floor at zero.
fn estimate_eta(
    total: u64,
    offset: u64,
    run_start: u64,
    elapsed: Duration,
    bandwidth: Option<f64>,
) -> Duration {
    let remaining = total.saturating_sub(offset) as f64;
    if let Some(rate) = bandwidth
        && rate > 0.0
    {
        return Duration::from_secs_f64(remaining / rate);
    }
    let sent = offset.saturating_sub(run_start) as f64;
    let secs = elapsed.as_secs_f64();
    if sent <= 0.0 || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(remaining / (sent / secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HttpResponse;
    use crate::source::BytesSource;
    use reqwest::header::{HeaderName, HeaderValue};
    use std::collections::VecDeque;
    use std::sync::OnceLock;
    use tuskit_store::{MemoryStore, Store};

    /// Scripted transport that records every request.
    struct MockTransport {
        requests: Mutex<Vec<HttpRequest>>,
        responses: Mutex<VecDeque<Result<HttpResponse, UploadError>>>,
    }

    impl MockTransport {
        fn new() -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                responses: Mutex::new(VecDeque::new()),
            }
        }

        fn push(&self, response: HttpResponse) {
            self.responses.lock().unwrap().push_back(Ok(response));
        }

        fn push_err(&self, message: &str) {
            self.responses
                .lock()
                .unwrap()
                .push_back(Err(UploadError::Transport(message.into())));
        }

        fn recorded(&self) -> Vec<HttpRequest> {
            self.requests.lock().unwrap().clone()
        }

        fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    impl HttpTransport for MockTransport {
        fn send(
            &self,
            request: HttpRequest,
        ) -> std::pin::Pin<
            Box<dyn Future<Output = Result<HttpResponse, UploadError>> + Send + '_>,
        > {
            self.requests.lock().unwrap().push(request);
            Box::pin(async move {
                self.responses
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| Err(UploadError::Transport("no scripted response".into())))
            })
        }
    }

    fn response(status: u16, headers: &[(&str, &str)]) -> HttpResponse {
        let mut resp = HttpResponse::new(StatusCode::from_u16(status).unwrap());
        for (name, value) in headers {
            resp.headers.insert(
                HeaderName::try_from(*name).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        resp
    }

    fn endpoint() -> Url {
        Url::parse("https://tus.example/files/").unwrap()
    }

    fn engine_for(
        data: Vec<u8>,
        chunk_size: u64,
        transport: Arc<MockTransport>,
        store: Arc<MemoryStore>,
    ) -> Upload {
        let source = Arc::new(BytesSource::new("movie.bin", data));
        Upload::new(
            source,
            Some(store),
            transport,
            UploadOptions {
                chunk_size,
                ..UploadOptions::default()
            },
        )
    }

    /// Scripts a creation plus enough 2xx PATCH responses to finish `size`
    /// bytes in `chunk_size` steps.
    fn script_full_upload(transport: &MockTransport, size: u64, chunk_size: u64) {
        transport.push(response(
            201,
            &[("Location", "https://tus.example/files/abc")],
        ));
        let mut offset = 0;
        while offset < size {
            offset = (offset + chunk_size).min(size);
            transport.push(response(204, &[("Upload-Offset", &offset.to_string())]));
        }
    }

    #[tokio::test]
    async fn full_upload_patches_every_chunk_in_order() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        script_full_upload(&transport, 1_572_864, 524_288);

        let engine = engine_for(vec![7u8; 1_572_864], 524_288, transport.clone(), store.clone());

        let progress: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
        let completions = Arc::new(Mutex::new(0u32));
        let mut request = UploadRequest::new(endpoint());
        let p = progress.clone();
        request.on_progress = Some(Box::new(move |percent, _eta| p.lock().unwrap().push(percent)));
        let c = completions.clone();
        request.on_complete = Some(Box::new(move || *c.lock().unwrap() += 1));

        let outcome = engine.upload(request).await.unwrap();
        assert_eq!(outcome, UploadOutcome::Completed);
        assert_eq!(engine.state(), UploadState::Completed);

        let recorded = transport.recorded();
        assert_eq!(recorded.len(), 4); // POST + 3 PATCH
        assert_eq!(recorded[0].method, Method::POST);
        for (i, expected_offset) in [0u64, 524_288, 1_048_576].iter().enumerate() {
            let patch = &recorded[i + 1];
            assert_eq!(patch.method, Method::PATCH);
            assert_eq!(patch.url.as_str(), "https://tus.example/files/abc");
            assert_eq!(
                patch.header(HEADER_UPLOAD_OFFSET),
                Some(expected_offset.to_string().as_str())
            );
            assert_eq!(patch.header("Content-Type"), Some(OFFSET_OCTET_STREAM));
            assert_eq!(patch.header(HEADER_TUS_RESUMABLE), Some(TUS_VERSION));
            assert_eq!(patch.body.as_ref().unwrap().len(), 524_288);
        }

        // Progress is monotonic and terminates at 100.
        let progress = progress.lock().unwrap();
        assert_eq!(progress.len(), 3);
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*progress.last().unwrap(), 100.0);
        assert_eq!(*completions.lock().unwrap(), 1);

        // Store is cleaned up on completion.
        assert!(store.get(engine.fingerprint()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn creation_sends_length_and_metadata() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        script_full_upload(&transport, 5, 1024);

        let engine = engine_for(b"hello".to_vec(), 1024, transport.clone(), store);
        let mut request = UploadRequest::new(endpoint());
        request
            .metadata
            .insert("filename".into(), "movie.bin".into());
        request.headers.insert("X-Api-Key".into(), "secret".into());

        engine.upload(request).await.unwrap();

        let recorded = transport.recorded();
        let post = &recorded[0];
        assert_eq!(post.header(HEADER_UPLOAD_LENGTH), Some("5"));
        assert_eq!(
            post.header(HEADER_UPLOAD_METADATA),
            Some("filename bW92aWUuYmlu")
        );
        assert_eq!(post.header("X-Api-Key"), Some("secret"));
        // User headers ride along on PATCH requests too.
        assert_eq!(recorded[1].header("X-Api-Key"), Some("secret"));
    }

    #[tokio::test]
    async fn creation_accepts_404_and_resolves_relative_location() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        transport.push(response(404, &[("Location", "abc,ignored-tail")]));
        transport.push(response(204, &[("Upload-Offset", "5")]));

        let engine = engine_for(b"hello".to_vec(), 1024, transport.clone(), store.clone());
        let outcome = engine.upload(UploadRequest::new(endpoint())).await.unwrap();
        assert_eq!(outcome, UploadOutcome::Completed);
        assert_eq!(
            transport.recorded()[1].url.as_str(),
            "https://tus.example/files/abc"
        );
    }

    #[tokio::test]
    async fn creation_failure_is_protocol_error() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        transport.push(response(500, &[]));

        let engine = engine_for(b"hello".to_vec(), 1024, transport, store);
        let err = engine
            .upload(UploadRequest::new(endpoint()))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Protocol { status: Some(500), .. }));
        assert_eq!(engine.state(), UploadState::Failed);
    }

    #[tokio::test]
    async fn missing_location_is_protocol_error() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        transport.push(response(201, &[]));

        let engine = engine_for(b"hello".to_vec(), 1024, transport, store);
        let err = engine
            .upload(UploadRequest::new(endpoint()))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Protocol { .. }));
    }

    #[tokio::test]
    async fn resumes_from_server_offset_when_store_entry_confirms() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());

        let engine = engine_for(
            vec![7u8; 1_572_864],
            524_288,
            transport.clone(),
            store.clone(),
        );
        store
            .set(engine.fingerprint(), "https://tus.example/files/abc")
            .await
            .unwrap();

        // HEAD confirms 524288 bytes already on the server.
        transport.push(response(200, &[("Upload-Offset", "524288")]));
        transport.push(response(204, &[("Upload-Offset", "1048576")]));
        transport.push(response(204, &[("Upload-Offset", "1572864")]));

        let outcome = engine.upload(UploadRequest::new(endpoint())).await.unwrap();
        assert_eq!(outcome, UploadOutcome::Completed);

        let recorded = transport.recorded();
        assert_eq!(recorded.len(), 3); // HEAD + 2 PATCH, no POST
        assert_eq!(recorded[0].method, Method::HEAD);
        assert_eq!(recorded[1].header(HEADER_UPLOAD_OFFSET), Some("524288"));
        let patched: usize = recorded[1..]
            .iter()
            .map(|r| r.body.as_ref().map(Vec::len).unwrap_or(0))
            .sum();
        assert_eq!(patched, 1_048_576);
        assert!(store.get(engine.fingerprint()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_store_entry_fails_with_duplicate_error() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());

        let engine = engine_for(b"hello".to_vec(), 1024, transport.clone(), store.clone());
        store
            .set(engine.fingerprint(), "https://tus.example/files/gone")
            .await
            .unwrap();
        transport.push(response(404, &[]));

        let err = engine
            .upload(UploadRequest::new(endpoint()))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Duplicate(_)));
        // The stale entry is removed so the caller can force a fresh upload.
        assert!(store.get(engine.fingerprint()).await.unwrap().is_none());
        assert_eq!(transport.request_count(), 1); // just the HEAD
    }

    #[tokio::test]
    async fn prevent_duplicates_off_creates_fresh_and_overwrites_entry() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());

        let engine = engine_for(b"hello".to_vec(), 1024, transport.clone(), store.clone());
        store
            .set(engine.fingerprint(), "https://tus.example/files/old")
            .await
            .unwrap();
        script_full_upload(&transport, 5, 1024);

        let mut request = UploadRequest::new(endpoint());
        request.prevent_duplicates = false;
        let outcome = engine.upload(request).await.unwrap();
        assert_eq!(outcome, UploadOutcome::Completed);

        // No HEAD was issued; creation went straight through.
        assert_eq!(transport.recorded()[0].method, Method::POST);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_with_policy_sleeps() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());

        // 100_000 bytes in 40_000-byte chunks; first chunk fails twice.
        transport.push(response(
            201,
            &[("Location", "https://tus.example/files/abc")],
        ));
        transport.push(response(503, &[]));
        transport.push(response(503, &[]));
        transport.push(response(204, &[("Upload-Offset", "40000")]));
        transport.push(response(204, &[("Upload-Offset", "80000")]));
        transport.push(response(204, &[("Upload-Offset", "100000")]));

        let source = Arc::new(BytesSource::new("movie.bin", vec![1u8; 100_000]));
        let engine = Upload::new(
            source,
            Some(store),
            transport.clone(),
            UploadOptions {
                chunk_size: 40_000,
                retries: 2,
                retry_policy: RetryPolicy::Exponential,
                retry_interval: Duration::from_secs(1),
            },
        );

        let before = tokio::time::Instant::now();
        let outcome = engine.upload(UploadRequest::new(endpoint())).await.unwrap();
        assert_eq!(outcome, UploadOutcome::Completed);

        // Two sleeps: 1s (attempt 0) + 2s (attempt 1).
        assert_eq!(before.elapsed(), Duration::from_secs(3));
        // POST + 5 PATCH attempts (2 failed + 3 succeeded).
        assert_eq!(transport.request_count(), 6);
        assert_eq!(engine.snapshot().offset, 100_000);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_is_exactly_retries_plus_one() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        transport.push(response(
            201,
            &[("Location", "https://tus.example/files/abc")],
        ));
        transport.push_err("connection reset");
        transport.push_err("connection reset");
        transport.push_err("connection reset");

        let source = Arc::new(BytesSource::new("movie.bin", b"hello".to_vec()));
        let engine = Upload::new(
            source,
            Some(store.clone()),
            transport.clone(),
            UploadOptions {
                chunk_size: 1024,
                retries: 2,
                retry_policy: RetryPolicy::Constant,
                retry_interval: Duration::from_secs(1),
            },
        );

        let err = engine
            .upload(UploadRequest::new(endpoint()))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Transport(_)));
        assert_eq!(transport.request_count(), 4); // POST + 3 PATCH attempts
        assert_eq!(engine.state(), UploadState::Failed);
        // Failure keeps the store entry for a later resume.
        assert!(store.get(engine.fingerprint()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn offset_mismatch_is_fatal_and_keeps_store_entry() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        transport.push(response(
            201,
            &[("Location", "https://tus.example/files/abc")],
        ));
        // Server claims 40_001 after a 40_000-byte body from offset 0.
        transport.push(response(204, &[("Upload-Offset", "40001")]));

        let source = Arc::new(BytesSource::new("movie.bin", vec![1u8; 100_000]));
        let engine = Upload::new(
            source,
            Some(store.clone()),
            transport.clone(),
            UploadOptions {
                chunk_size: 40_000,
                ..UploadOptions::default()
            },
        );

        let err = engine
            .upload(UploadRequest::new(endpoint()))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Protocol { .. }));
        assert_eq!(transport.request_count(), 2);
        assert!(store.get(engine.fingerprint()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn missing_patch_offset_is_fatal() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        transport.push(response(
            201,
            &[("Location", "https://tus.example/files/abc")],
        ));
        transport.push(response(204, &[]));

        let engine = engine_for(b"hello".to_vec(), 1024, transport, store);
        let err = engine
            .upload(UploadRequest::new(endpoint()))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Protocol { .. }));
    }

    #[tokio::test]
    async fn pause_exits_after_current_chunk_and_resume_finishes() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        transport.push(response(
            201,
            &[("Location", "https://tus.example/files/abc")],
        ));
        transport.push(response(204, &[("Upload-Offset", "524288")]));

        let engine = Arc::new(engine_for(
            vec![7u8; 1_572_864],
            524_288,
            transport.clone(),
            store.clone(),
        ));

        // The progress callback pauses the engine after the first chunk.
        let slot: Arc<OnceLock<Arc<Upload>>> = Arc::new(OnceLock::new());
        slot.set(engine.clone()).ok().unwrap();
        let mut request = UploadRequest::new(endpoint());
        let s = slot.clone();
        let first_run_calls = Arc::new(Mutex::new(0u32));
        let f = first_run_calls.clone();
        request.on_progress = Some(Box::new(move |_, _| {
            *f.lock().unwrap() += 1;
            s.get().unwrap().pause();
        }));

        let outcome = engine.upload(request).await.unwrap();
        assert_eq!(outcome, UploadOutcome::Paused);
        assert_eq!(engine.state(), UploadState::Paused);
        assert_eq!(transport.request_count(), 2); // POST + first PATCH only
        assert_eq!(*first_run_calls.lock().unwrap(), 1);
        // Paused uploads keep their store entry.
        assert!(store.get(engine.fingerprint()).await.unwrap().is_some());

        // Resume re-verifies with HEAD and replaces the progress callback.
        transport.push(response(200, &[("Upload-Offset", "524288")]));
        transport.push(response(204, &[("Upload-Offset", "1048576")]));
        transport.push(response(204, &[("Upload-Offset", "1572864")]));

        let resumed_progress: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
        let r = resumed_progress.clone();
        let outcome = engine
            .resume(ResumeRequest {
                on_progress: CallbackPatch::Set(Box::new(move |percent, _| {
                    r.lock().unwrap().push(percent)
                })),
                ..ResumeRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(outcome, UploadOutcome::Completed);

        // The original callback stopped receiving calls after the swap.
        assert_eq!(*first_run_calls.lock().unwrap(), 1);
        let resumed = resumed_progress.lock().unwrap();
        assert_eq!(resumed.len(), 2);
        assert_eq!(*resumed.last().unwrap(), 100.0);
        assert!(store.get(engine.fingerprint()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resume_recreates_when_server_lost_the_upload() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        transport.push(response(
            201,
            &[("Location", "https://tus.example/files/abc")],
        ));
        transport.push(response(204, &[("Upload-Offset", "3")]));

        let engine = Arc::new(engine_for(b"hello".to_vec(), 3, transport.clone(), store.clone()));
        let slot: Arc<OnceLock<Arc<Upload>>> = Arc::new(OnceLock::new());
        slot.set(engine.clone()).ok().unwrap();
        let mut request = UploadRequest::new(endpoint());
        let s = slot.clone();
        request.on_progress = Some(Box::new(move |_, _| {
            s.get().unwrap().pause();
        }));
        assert_eq!(
            engine.upload(request).await.unwrap(),
            UploadOutcome::Paused
        );

        // HEAD says the upload is gone; a fresh creation follows, restarting
        // from offset zero.
        transport.push(response(404, &[]));
        transport.push(response(
            201,
            &[("Location", "https://tus.example/files/new")],
        ));
        transport.push(response(204, &[("Upload-Offset", "3")]));
        transport.push(response(204, &[("Upload-Offset", "5")]));

        let outcome = engine.resume(ResumeRequest::default()).await.unwrap();
        assert_eq!(outcome, UploadOutcome::Completed);

        let recorded = transport.recorded();
        let fresh_patch = &recorded[recorded.len() - 2];
        assert_eq!(fresh_patch.url.as_str(), "https://tus.example/files/new");
        assert_eq!(fresh_patch.header(HEADER_UPLOAD_OFFSET), Some("0"));
    }

    #[tokio::test]
    async fn cancel_removes_store_entry_and_stops_requests() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        transport.push(response(
            201,
            &[("Location", "https://tus.example/files/abc")],
        ));
        transport.push(response(204, &[("Upload-Offset", "524288")]));

        let engine = Arc::new(engine_for(
            vec![7u8; 1_572_864],
            524_288,
            transport.clone(),
            store.clone(),
        ));
        let slot: Arc<OnceLock<Arc<Upload>>> = Arc::new(OnceLock::new());
        slot.set(engine.clone()).ok().unwrap();
        let mut request = UploadRequest::new(endpoint());
        let s = slot.clone();
        request.on_progress = Some(Box::new(move |_, _| {
            s.get().unwrap().pause();
        }));
        assert_eq!(
            engine.upload(request).await.unwrap(),
            UploadOutcome::Paused
        );
        let requests_before = transport.request_count();

        engine.cancel().await.unwrap();
        assert_eq!(engine.state(), UploadState::Cancelled);
        assert!(store.get(engine.fingerprint()).await.unwrap().is_none());
        // Cancel is idempotent.
        engine.cancel().await.unwrap();

        // No further HTTP traffic, and the engine refuses to restart.
        assert_eq!(transport.request_count(), requests_before);
        assert_eq!(
            engine.resume(ResumeRequest::default()).await.unwrap(),
            UploadOutcome::Noop
        );
        assert!(matches!(
            engine.upload(UploadRequest::new(endpoint())).await,
            Err(UploadError::State(_))
        ));
        assert_eq!(transport.request_count(), requests_before);
    }

    #[tokio::test]
    async fn resume_is_noop_when_never_started() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        let engine = engine_for(b"hello".to_vec(), 1024, transport.clone(), store);
        assert_eq!(
            engine.resume(ResumeRequest::default()).await.unwrap(),
            UploadOutcome::Noop
        );
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn empty_file_completes_without_patches() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        transport.push(response(
            201,
            &[("Location", "https://tus.example/files/abc")],
        ));

        let engine = engine_for(Vec::new(), 1024, transport.clone(), store.clone());
        let completions = Arc::new(Mutex::new(0u32));
        let mut request = UploadRequest::new(endpoint());
        let c = completions.clone();
        request.on_complete = Some(Box::new(move || *c.lock().unwrap() += 1));

        let outcome = engine.upload(request).await.unwrap();
        assert_eq!(outcome, UploadOutcome::Completed);
        assert_eq!(transport.request_count(), 1); // creation only
        assert_eq!(transport.recorded()[0].header(HEADER_UPLOAD_LENGTH), Some("0"));
        assert_eq!(*completions.lock().unwrap(), 1);
        assert!(store.get(engine.fingerprint()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn panicking_callback_does_not_fail_the_upload() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        script_full_upload(&transport, 5, 1024);

        let engine = engine_for(b"hello".to_vec(), 1024, transport, store);
        let mut request = UploadRequest::new(endpoint());
        request.on_progress = Some(Box::new(|_, _| panic!("listener bug")));
        request.on_complete = Some(Box::new(|| panic!("listener bug")));

        let outcome = engine.upload(request).await.unwrap();
        assert_eq!(outcome, UploadOutcome::Completed);
    }

    #[tokio::test]
    async fn is_resumable_reflects_store_and_server() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        let engine = engine_for(b"hello".to_vec(), 1024, transport.clone(), store.clone());

        // No entry.
        assert!(!engine.is_resumable().await);

        // Entry plus confirming HEAD.
        store
            .set(engine.fingerprint(), "https://tus.example/files/abc")
            .await
            .unwrap();
        transport.push(response(200, &[("Upload-Offset", "2")]));
        assert!(engine.is_resumable().await);

        // Entry but the server lost it.
        transport.push(response(404, &[]));
        assert!(!engine.is_resumable().await);

        // Resumption disabled entirely.
        let source = Arc::new(BytesSource::new("movie.bin", b"hello".to_vec()));
        let detached = Upload::new(source, None, transport, UploadOptions::default());
        assert!(!detached.is_resumable().await);
    }

    #[tokio::test]
    async fn on_start_reports_measured_estimate() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        transport.push(response(
            201,
            &[("Location", "https://tus.example/files/abc")],
        ));
        // Probe response, then the single PATCH.
        transport.push(response(200, &[]));
        transport.push(response(204, &[("Upload-Offset", "5")]));

        let engine = engine_for(b"hello".to_vec(), 1024, transport.clone(), store);
        let estimates: Arc<Mutex<Vec<Option<Duration>>>> = Arc::new(Mutex::new(Vec::new()));
        let mut request = UploadRequest::new(endpoint());
        request.measure_speed = true;
        let e = estimates.clone();
        request.on_start = Some(Box::new(move |snapshot, estimate| {
            assert!(snapshot.upload_url.is_some());
            assert_eq!(snapshot.size, 5);
            e.lock().unwrap().push(estimate);
        }));

        engine.upload(request).await.unwrap();
        let estimates = estimates.lock().unwrap();
        assert_eq!(estimates.len(), 1);
        assert!(estimates[0].is_some());
    }

    #[test]
    fn eta_prefers_measured_bandwidth() {
        let eta = estimate_eta(
            1_000_000,
            500_000,
            0,
            Duration::from_secs(10),
            Some(100_000.0),
        );
        assert_eq!(eta, Duration::from_secs(5));
    }

    #[test]
    fn eta_falls_back_to_observed_rate() {
        // 500_000 bytes sent in 10s -> 50_000 B/s -> 10s remaining.
        let eta = estimate_eta(1_000_000, 500_000, 0, Duration::from_secs(10), None);
        assert_eq!(eta, Duration::from_secs(10));
    }

    #[test]
    fn eta_is_zero_when_nothing_sent_yet() {
        assert_eq!(
            estimate_eta(1_000_000, 500_000, 500_000, Duration::from_secs(10), None),
            Duration::ZERO
        );
    }
}
