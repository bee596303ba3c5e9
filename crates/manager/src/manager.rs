//! The upload manager: queueing, duplicate suppression, and lifecycle
//! events over a set of `tuskit-client` engines.
//!
//! At most `concurrency` engines run at once; the rest wait in a FIFO queue
//! that drains whenever a slot frees. Every lifecycle change is broadcast as
//! an [`UploadEvent`]; slow subscribers lag and drop events rather than
//! stall an engine.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use tuskit_client::{
    ResumeRequest, Upload, UploadError, UploadOptions, UploadOutcome, UploadRequest, UploadSource,
    UploadState,
};

use crate::types::{EventKind, ManagerOptions, UploadEvent, UploadRecord, UploadStatus};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Errors from manager operations.
///
/// Engine failures are not returned from these methods; they are recorded on
/// the managed upload and broadcast as [`EventKind::Error`] events.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("upload not found: {0}")]
    NotFound(String),

    #[error("an active upload already exists for fingerprint {0}")]
    Duplicate(String),
}

/// One upload under management.
struct ManagedUpload {
    engine: Arc<Upload>,
    record: UploadRecord,
    headers: HashMap<String, String>,
    metadata: BTreeMap<String, String>,
    /// Incremented on every runner spawn, so a stale runner's settle cannot
    /// clobber the bookkeeping of a newer run.
    run_seq: u64,
}

struct ManagerState {
    uploads: HashMap<String, ManagedUpload>,
    queue: VecDeque<String>,
    active: HashSet<String>,
}

struct ManagerInner {
    options: ManagerOptions,
    state: Mutex<ManagerState>,
    events: Mutex<Option<broadcast::Sender<UploadEvent>>>,
    last_id_ms: AtomicU64,
}

/// Coordinates many uploads against shared persistent state.
#[derive(Clone)]
pub struct UploadManager {
    inner: Arc<ManagerInner>,
}

impl UploadManager {
    /// Creates a manager. Engines it constructs share the configured store
    /// and transport.
    pub fn new(options: ManagerOptions) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ManagerInner {
                options,
                state: Mutex::new(ManagerState {
                    uploads: HashMap::new(),
                    queue: VecDeque::new(),
                    active: HashSet::new(),
                }),
                events: Mutex::new(Some(events_tx)),
                last_id_ms: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribes to lifecycle events. Events dispatched before the call are
    /// not replayed. Returns `None` after [`dispose`](Self::dispose).
    pub fn subscribe(&self) -> Option<broadcast::Receiver<UploadEvent>> {
        self.inner
            .events
            .lock()
            .unwrap()
            .as_ref()
            .map(|tx| tx.subscribe())
    }

    /// Registers a new upload and returns its id
    /// (`<fingerprint>-<timestamp_ms>`).
    ///
    /// With duplicate prevention on, a fingerprint that already has a
    /// non-terminal managed upload is rejected. If `auto_start` is set the
    /// upload starts (or queues) immediately; otherwise it joins the queue
    /// in state `ready`.
    pub fn add_upload(
        &self,
        source: Arc<dyn UploadSource>,
        metadata: BTreeMap<String, String>,
        headers: HashMap<String, String>,
        chunk_size: Option<u64>,
    ) -> Result<String, ManagerError> {
        let options = &self.inner.options;
        let engine = Arc::new(Upload::new(
            source,
            Some(options.store.clone()),
            options.transport.clone(),
            UploadOptions {
                chunk_size: chunk_size.unwrap_or(options.chunk_size),
                retries: options.retries,
                retry_policy: options.retry_policy,
                retry_interval: options.retry_interval,
            },
        ));
        let fingerprint = engine.fingerprint().to_string();

        let record = {
            let mut guard = self.inner.state.lock().unwrap();
            let st = &mut *guard;
            if options.prevent_duplicates
                && st.uploads.values().any(|u| {
                    u.record.fingerprint == fingerprint && !u.record.status.is_terminal()
                })
            {
                return Err(ManagerError::Duplicate(fingerprint));
            }
            let created_at = self.inner.next_timestamp_ms();
            let id = format!("{fingerprint}-{created_at}");
            let record = UploadRecord {
                id: id.clone(),
                fingerprint: fingerprint.clone(),
                status: UploadStatus::Ready,
                progress: 0.0,
                eta_secs: None,
                error: None,
                created_at,
                updated_at: created_at,
            };
            st.uploads.insert(
                id,
                ManagedUpload {
                    engine,
                    record: record.clone(),
                    headers,
                    metadata,
                    run_seq: 0,
                },
            );
            record
        };
        let id = record.id.clone();
        debug!(id = %id, "upload added");
        self.inner.emit(record, EventKind::Add);

        if options.auto_start {
            self.start_upload(&id)?;
        } else {
            let mut guard = self.inner.state.lock().unwrap();
            if !guard.queue.iter().any(|q| q == &id) {
                guard.queue.push_back(id.clone());
            }
        }
        Ok(id)
    }

    /// Starts an upload, or enqueues it when the concurrency bound is
    /// reached (idempotently). A no-op for uploads already running or
    /// already terminal.
    pub fn start_upload(&self, id: &str) -> Result<(), ManagerError> {
        let started = {
            let mut guard = self.inner.state.lock().unwrap();
            let st = &mut *guard;
            let managed = st
                .uploads
                .get_mut(id)
                .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;
            if managed.record.status == UploadStatus::Uploading
                || managed.record.status.is_terminal()
            {
                return Ok(());
            }
            if st.active.len() >= self.inner.options.concurrency {
                if !st.queue.iter().any(|q| q == id) {
                    st.queue.push_back(id.to_string());
                }
                return Ok(());
            }
            st.active.insert(id.to_string());
            managed.record.status = UploadStatus::Uploading;
            managed.record.updated_at = now_ms();
            managed.run_seq += 1;
            (
                managed.engine.clone(),
                managed.record.clone(),
                managed.headers.clone(),
                managed.metadata.clone(),
                managed.run_seq,
            )
        };
        let (engine, record, headers, metadata, seq) = started;
        self.inner.emit(record, EventKind::Start);
        spawn_runner(self.inner.clone(), id.to_string(), seq, engine, headers, metadata);
        Ok(())
    }

    /// Pauses a running upload. Returns `Ok(false)` when the upload was not
    /// uploading or refused the pause.
    pub fn pause_upload(&self, id: &str) -> Result<bool, ManagerError> {
        let engine = {
            let guard = self.inner.state.lock().unwrap();
            let managed = guard
                .uploads
                .get(id)
                .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;
            if managed.record.status != UploadStatus::Uploading {
                return Ok(false);
            }
            managed.engine.clone()
        };
        if !engine.pause() {
            return Ok(false);
        }
        let record = {
            let mut guard = self.inner.state.lock().unwrap();
            let st = &mut *guard;
            st.active.remove(id);
            st.uploads.get_mut(id).map(|m| {
                m.record.status = UploadStatus::Paused;
                m.record.updated_at = now_ms();
                m.record.clone()
            })
        };
        if let Some(record) = record {
            self.inner.emit(record, EventKind::Pause);
        }
        process_queue(&self.inner);
        Ok(true)
    }

    /// Resumes a paused upload, or enqueues it when the concurrency bound is
    /// reached. A no-op for uploads that are not paused.
    pub fn resume_upload(&self, id: &str) -> Result<(), ManagerError> {
        let (record, runner) = {
            let mut guard = self.inner.state.lock().unwrap();
            let st = &mut *guard;
            let managed = st
                .uploads
                .get_mut(id)
                .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;
            if managed.record.status != UploadStatus::Paused {
                return Ok(());
            }
            if st.active.len() >= self.inner.options.concurrency {
                if !st.queue.iter().any(|q| q == id) {
                    st.queue.push_back(id.to_string());
                }
                (managed.record.clone(), None)
            } else {
                st.active.insert(id.to_string());
                managed.record.status = UploadStatus::Uploading;
                managed.record.updated_at = now_ms();
                managed.run_seq += 1;
                (
                    managed.record.clone(),
                    Some((
                        managed.engine.clone(),
                        managed.headers.clone(),
                        managed.metadata.clone(),
                        managed.run_seq,
                    )),
                )
            }
        };
        self.inner.emit(record, EventKind::Resume);
        if let Some((engine, headers, metadata, seq)) = runner {
            spawn_runner(self.inner.clone(), id.to_string(), seq, engine, headers, metadata);
        }
        Ok(())
    }

    /// Cancels an upload and forgets it: the engine is cancelled (removing
    /// the store entry), and the managed upload leaves the state map, the
    /// active set, and the queue. Returns `false` for unknown ids.
    pub async fn cancel_upload(&self, id: &str) -> bool {
        let engine = {
            let guard = self.inner.state.lock().unwrap();
            guard.uploads.get(id).map(|m| m.engine.clone())
        };
        let Some(engine) = engine else {
            return false;
        };
        if let Err(e) = engine.cancel().await {
            warn!(id = %id, error = %e, "engine cancel failed");
        }
        let record = {
            let mut guard = self.inner.state.lock().unwrap();
            let st = &mut *guard;
            st.active.remove(id);
            st.queue.retain(|q| q != id);
            st.uploads.remove(id).map(|mut m| {
                m.record.status = UploadStatus::Cancelled;
                m.record.updated_at = now_ms();
                m.record
            })
        };
        if let Some(record) = record {
            self.inner.emit(record, EventKind::Cancel);
        }
        process_queue(&self.inner);
        true
    }

    /// Pauses every uploading upload. Iterates a snapshot of ids so engine
    /// callbacks can mutate the state map concurrently.
    pub fn pause_all(&self) {
        for id in self.ids_with_status(UploadStatus::Uploading) {
            let _ = self.pause_upload(&id);
        }
    }

    /// Resumes every paused upload.
    pub fn resume_all(&self) {
        for id in self.ids_with_status(UploadStatus::Paused) {
            let _ = self.resume_upload(&id);
        }
    }

    /// Cancels every managed upload.
    pub async fn cancel_all(&self) {
        let ids: Vec<String> = {
            let guard = self.inner.state.lock().unwrap();
            guard.uploads.keys().cloned().collect()
        };
        for id in ids {
            self.cancel_upload(&id).await;
        }
    }

    /// Returns the snapshot for one upload.
    pub fn get_upload(&self, id: &str) -> Option<UploadRecord> {
        let guard = self.inner.state.lock().unwrap();
        guard.uploads.get(id).map(|m| m.record.clone())
    }

    /// Returns all snapshots, oldest first.
    pub fn get_all_uploads(&self) -> Vec<UploadRecord> {
        let guard = self.inner.state.lock().unwrap();
        let mut records: Vec<UploadRecord> =
            guard.uploads.values().map(|m| m.record.clone()).collect();
        records.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        records
    }

    /// Returns the id of the newest upload for a fingerprint.
    pub fn get_id_by_fingerprint(&self, fingerprint: &str) -> Option<String> {
        let guard = self.inner.state.lock().unwrap();
        guard
            .uploads
            .values()
            .filter(|m| m.record.fingerprint == fingerprint)
            .max_by_key(|m| m.record.created_at)
            .map(|m| m.record.id.clone())
    }

    /// Returns the fingerprint of a managed upload.
    pub fn get_fingerprint_for_id(&self, id: &str) -> Option<String> {
        let guard = self.inner.state.lock().unwrap();
        guard.uploads.get(id).map(|m| m.record.fingerprint.clone())
    }

    /// Number of uploads currently holding an active slot.
    pub fn active_count(&self) -> usize {
        self.inner.state.lock().unwrap().active.len()
    }

    /// Closes the event broadcaster. Subsequent events are dropped and
    /// [`subscribe`](Self::subscribe) returns `None`.
    pub fn dispose(&self) {
        self.inner.events.lock().unwrap().take();
    }

    fn ids_with_status(&self, status: UploadStatus) -> Vec<String> {
        let guard = self.inner.state.lock().unwrap();
        guard
            .uploads
            .values()
            .filter(|m| m.record.status == status)
            .map(|m| m.record.id.clone())
            .collect()
    }
}

impl ManagerInner {
    fn emit(&self, record: UploadRecord, kind: EventKind) {
        if self.options.debug {
            debug!(id = %record.id, kind = ?kind, "dispatching event");
        }
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            // A send error just means nobody is listening right now.
            let _ = tx.send(UploadEvent {
                upload: record,
                kind,
            });
        }
    }

    /// Strictly increasing millisecond stamp for ids, so two adds within the
    /// same millisecond still get distinct ids.
    fn next_timestamp_ms(&self) -> u64 {
        let now = now_ms();
        let mut prev = self.last_id_ms.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match self.last_id_ms.compare_exchange(
                prev,
                next,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Runs one engine pass on its own task and settles the outcome.
fn spawn_runner(
    inner: Arc<ManagerInner>,
    id: String,
    seq: u64,
    engine: Arc<Upload>,
    headers: HashMap<String, String>,
    metadata: BTreeMap<String, String>,
) {
    tokio::spawn(async move {
        let mut result = match engine.state() {
            UploadState::Paused => engine.resume(ResumeRequest::default()).await,
            // A pause raced the final chunk; the engine already finished.
            UploadState::Completed => Ok(UploadOutcome::Completed),
            _ => {
                let mut request = UploadRequest::new(inner.options.endpoint.clone());
                request.headers = headers;
                request.metadata = metadata;
                request.measure_speed = inner.options.measure_speed;
                request.prevent_duplicates = inner.options.prevent_duplicates;
                request.on_start = Some(start_hook(&inner, &id));
                request.on_progress = Some(progress_hook(&inner, &id));
                engine.upload(request).await
            }
        };
        // The engine may have been mid-settle when the state was sampled;
        // re-dispatch once against the settled state.
        if matches!(result, Err(UploadError::State(_))) {
            result = match engine.state() {
                UploadState::Paused => engine.resume(ResumeRequest::default()).await,
                UploadState::Completed => Ok(UploadOutcome::Completed),
                _ => result,
            };
        }
        settle(&inner, &id, seq, result);
    });
}

/// Records the engine's pre-upload duration estimate on the managed record.
fn start_hook(inner: &Arc<ManagerInner>, id: &str) -> tuskit_client::OnStart {
    let inner = inner.clone();
    let id = id.to_string();
    Box::new(move |_snapshot, estimate| {
        if let Some(estimate) = estimate {
            let mut guard = inner.state.lock().unwrap();
            if let Some(managed) = guard.uploads.get_mut(&id) {
                managed.record.eta_secs = Some(estimate.as_secs_f64());
                managed.record.updated_at = now_ms();
            }
        }
    })
}

/// Translates engine progress callbacks into `progress` events.
fn progress_hook(inner: &Arc<ManagerInner>, id: &str) -> tuskit_client::OnProgress {
    let inner = inner.clone();
    let id = id.to_string();
    Box::new(move |percent, eta| {
        let record = {
            let mut guard = inner.state.lock().unwrap();
            let Some(managed) = guard.uploads.get_mut(&id) else {
                return;
            };
            managed.record.progress = percent;
            managed.record.eta_secs = Some(eta.as_secs_f64());
            managed.record.updated_at = now_ms();
            managed.record.clone()
        };
        inner.emit(record, EventKind::Progress);
    })
}

/// Terminal bookkeeping after a runner finishes: free the slot, record the
/// outcome, broadcast it, and drain the queue.
fn settle(
    inner: &Arc<ManagerInner>,
    id: &str,
    seq: u64,
    result: Result<UploadOutcome, UploadError>,
) {
    let event = {
        let mut guard = inner.state.lock().unwrap();
        let st = &mut *guard;
        if st.uploads.get(id).is_some_and(|m| m.run_seq != seq) {
            // A newer runner owns this upload now.
            return;
        }
        st.active.remove(id);
        match result {
            Ok(UploadOutcome::Completed) => st.uploads.get_mut(id).map(|m| {
                m.record.status = UploadStatus::Completed;
                m.record.progress = 100.0;
                m.record.eta_secs = Some(0.0);
                m.record.error = None;
                m.record.updated_at = now_ms();
                (m.record.clone(), EventKind::Complete)
            }),
            // Pause and cancel are announced by the calls that initiated
            // them.
            Ok(UploadOutcome::Paused) => None,
            Ok(UploadOutcome::Noop) => match st.uploads.get_mut(id) {
                Some(m) if m.engine.state() == UploadState::Completed => {
                    m.record.status = UploadStatus::Completed;
                    m.record.progress = 100.0;
                    m.record.eta_secs = Some(0.0);
                    m.record.updated_at = now_ms();
                    Some((m.record.clone(), EventKind::Complete))
                }
                Some(m) if m.engine.state() == UploadState::Paused => {
                    m.record.status = UploadStatus::Paused;
                    m.record.updated_at = now_ms();
                    None
                }
                _ => None,
            },
            Err(e) => st.uploads.get_mut(id).map(|m| {
                m.record.status = UploadStatus::Failed;
                m.record.error = Some(e.to_string());
                m.record.updated_at = now_ms();
                (m.record.clone(), EventKind::Error)
            }),
        }
    };
    if let Some((record, kind)) = event {
        if kind == EventKind::Error {
            warn!(
                id = %record.id,
                error = record.error.as_deref().unwrap_or_default(),
                "upload failed"
            );
        }
        inner.emit(record, kind);
    }
    process_queue(inner);
}

/// Pops queued uploads into free slots until the bound is reached. Starting
/// a queued upload never blocks the caller that freed the slot.
fn process_queue(inner: &Arc<ManagerInner>) {
    loop {
        let next = {
            let mut guard = inner.state.lock().unwrap();
            let st = &mut *guard;
            if st.active.len() >= inner.options.concurrency {
                return;
            }
            let Some(id) = st.queue.pop_front() else {
                return;
            };
            match st.uploads.get_mut(&id) {
                // Only ready or paused uploads are startable; anything else
                // changed state while it sat in the queue.
                Some(managed)
                    if matches!(
                        managed.record.status,
                        UploadStatus::Ready | UploadStatus::Paused
                    ) =>
                {
                    managed.record.status = UploadStatus::Uploading;
                    managed.record.updated_at = now_ms();
                    managed.run_seq += 1;
                    let payload = (
                        id.clone(),
                        managed.run_seq,
                        managed.engine.clone(),
                        managed.headers.clone(),
                        managed.metadata.clone(),
                        managed.record.clone(),
                    );
                    st.active.insert(id);
                    Some(payload)
                }
                _ => None,
            }
        };
        let Some((id, seq, engine, headers, metadata, record)) = next else {
            continue;
        };
        inner.emit(record, EventKind::Start);
        spawn_runner(inner.clone(), id, seq, engine, headers, metadata);
    }
}
