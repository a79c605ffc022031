//! Segmentation provider: lifecycle, worker ownership and session state
//!
//! The provider is the unit of concurrency callers see. It owns the compute
//! worker, serializes requests to it FIFO, publishes lifecycle transitions
//! on a watch channel and keeps the per-session refinement state (previous
//! mask logits, last candidate set).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use metrics::counter;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::state::{ProviderState, SessionState};
use crate::capability::{GpuCapabilities, probe_gpu};
use crate::config::EngineConfig;
use crate::engine::{ExecutionBackend, PromptPoint, SegmentationOutput};
use crate::protocol::{RequestKind, WorkerRequest, WorkerResponse, WorkerStatus};
use crate::store::{
    AbortHandle, CachedInfo, LoadProgress, LoadStage, ModelFetcher, ProgressFn, StoreError,
    abort_pair,
};
use crate::tensor;
use crate::worker::{EngineFactory, WorkerHandle, sam2_engine_factory, spawn_worker};

/// Provider-level errors
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("initialization failed: {0}")]
    Init(String),

    #[error("model load failed: {0}")]
    Store(StoreError),

    #[error("operation aborted")]
    Aborted,

    #[error("provider is not initialized")]
    NotInitialized,

    #[error("compute worker is gone")]
    WorkerGone,

    #[error("worker {request} failed: {message}")]
    Worker {
        request: RequestKind,
        message: String,
    },

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl From<StoreError> for ProviderError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Aborted => ProviderError::Aborted,
            other => ProviderError::Store(other),
        }
    }
}

/// A single segmentation call
#[derive(Debug, Clone)]
pub struct SegmentationRequest {
    /// Row-major RGBA bytes, `width * height * 4` long
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Non-empty, ordered prompt points in captured-image space
    pub points: Vec<PromptPoint>,
    /// Overrides the configured logit threshold when set
    pub threshold: Option<f32>,
}

type PendingEntry = (u64, oneshot::Sender<Result<WorkerResponse, ProviderError>>);
type PendingQueue = Arc<StdMutex<VecDeque<PendingEntry>>>;

struct Inner {
    worker: Option<WorkerHandle>,
    pump: Option<tokio::task::JoinHandle<()>>,
    next_seq: u64,
    session: Option<SessionState>,
    backend: Option<ExecutionBackend>,
}

/// Public segmentation contract plus lifecycle controls
pub struct SegmentationProvider {
    fetcher: Arc<dyn ModelFetcher>,
    factory: EngineFactory,
    engine_config: EngineConfig,
    state_tx: watch::Sender<ProviderState>,
    inner: Mutex<Inner>,
    /// Serializes initialization so concurrent callers share one attempt
    init_lock: Mutex<()>,
    pending: PendingQueue,
    in_flight: AtomicUsize,
    capabilities: OnceCell<GpuCapabilities>,
    progress: StdMutex<Option<ProgressFn>>,
    abort: StdMutex<Option<AbortHandle>>,
}

impl SegmentationProvider {
    /// Provider over the production ONNX engine.
    pub fn new(fetcher: Arc<dyn ModelFetcher>, engine_config: EngineConfig) -> Self {
        Self::with_engine_factory(fetcher, engine_config, sam2_engine_factory())
    }

    /// Provider with an injected engine factory (test seam).
    pub fn with_engine_factory(
        fetcher: Arc<dyn ModelFetcher>,
        engine_config: EngineConfig,
        factory: EngineFactory,
    ) -> Self {
        let (state_tx, _) = watch::channel(ProviderState::Idle);
        Self {
            fetcher,
            factory,
            engine_config,
            state_tx,
            inner: Mutex::new(Inner {
                worker: None,
                pump: None,
                next_seq: 0,
                session: None,
                backend: None,
            }),
            init_lock: Mutex::new(()),
            pending: Arc::new(StdMutex::new(VecDeque::new())),
            in_flight: AtomicUsize::new(0),
            capabilities: OnceCell::new(),
            progress: StdMutex::new(None),
            abort: StdMutex::new(None),
        }
    }

    /// Install a model-load progress handler. Must be set before
    /// `initialize` to observe download events.
    pub fn set_progress_handler(&self, handler: ProgressFn) {
        *self.progress.lock().unwrap() = Some(handler);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProviderState {
        *self.state_tx.borrow()
    }

    /// Subscribe to lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ProviderState> {
        self.state_tx.subscribe()
    }

    /// Backend the engine ended up on, once initialized.
    pub async fn backend(&self) -> Option<ExecutionBackend> {
        self.inner.lock().await.backend
    }

    fn transition(&self, next: ProviderState) {
        let changed = *self.state_tx.borrow() != next;
        if changed {
            debug!("provider state -> {}", next);
            let _ = self.state_tx.send(next);
        }
    }

    /// GPU capability report, probed once and cached. Informational: a
    /// CPU-only host still runs everything.
    pub async fn capabilities(&self) -> &GpuCapabilities {
        self.capabilities.get_or_init(probe_gpu).await
    }

    /// Whether GPU-quality execution is expected.
    pub async fn is_available(&self) -> bool {
        self.capabilities().await.available
    }

    /// Idempotent initialization: load models (cache or network), spawn the
    /// worker and build the engine. Concurrent calls share the in-flight
    /// attempt; after a failure the next call restarts from scratch.
    pub async fn initialize(&self) -> Result<ExecutionBackend, ProviderError> {
        let _guard = self.init_lock.lock().await;

        if matches!(
            self.state(),
            ProviderState::Ready | ProviderState::Processing
        ) && let Some(backend) = self.inner.lock().await.backend
        {
            return Ok(backend);
        }

        self.transition(ProviderState::LoadingModels);
        match self.initialize_inner().await {
            Ok(backend) => {
                self.transition(ProviderState::Ready);
                info!("provider ready on {} backend", backend);
                Ok(backend)
            }
            Err(e) => {
                self.teardown_worker().await;
                self.transition(ProviderState::Error);
                counter!("samkit_provider_init_failures_total").increment(1);
                Err(e)
            }
        }
    }

    async fn initialize_inner(&self) -> Result<ExecutionBackend, ProviderError> {
        let (abort_handle, abort_signal) = abort_pair();
        *self.abort.lock().unwrap() = Some(abort_handle);

        let progress: ProgressFn = self
            .progress
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Arc::new(|_| {}));

        let models = self
            .fetcher
            .load_all(Arc::clone(&progress), abort_signal)
            .await?;

        self.transition(ProviderState::Initializing);
        let total = (models.encoder.len() + models.decoder.len()) as u64;
        progress(LoadProgress {
            loaded: total,
            total,
            stage: LoadStage::Initializing,
        });

        let mut worker = spawn_worker(Arc::clone(&self.factory));
        let responses = worker
            .take_responses()
            .expect("fresh worker exposes its response stream");
        {
            let mut inner = self.inner.lock().await;
            inner.worker = Some(worker);
            inner.pump = Some(tokio::spawn(pump_responses(
                responses,
                Arc::clone(&self.pending),
            )));
        }

        let engine_config = self.engine_config.clone();
        let response = self
            .request(move |seq| WorkerRequest::Initialize {
                seq,
                encoder_bytes: models.encoder,
                decoder_bytes: models.decoder,
                config: engine_config,
            })
            .await?;

        match response {
            WorkerResponse::Initialized { backend, .. } => {
                self.inner.lock().await.backend = Some(backend);
                Ok(backend)
            }
            WorkerResponse::Error { message, .. } => Err(ProviderError::Init(message)),
            other => Err(ProviderError::Init(format!(
                "unexpected response '{}' to initialize",
                other.message_type()
            ))),
        }
    }

    async fn teardown_worker(&self) {
        let mut inner = self.inner.lock().await;
        // Dropping the handle closes the request channel and stops the thread
        inner.worker = None;
        inner.pump = None;
        inner.backend = None;
    }

    /// Start segmenting a new image: mints a fresh image id and clears
    /// previous-mask state. Call whenever the captured image changes.
    pub async fn start_new_session(&self) -> String {
        let session = SessionState::new();
        let image_id = session.image_id.clone();
        self.inner.lock().await.session = Some(session);
        debug!("started session {}", image_id);
        image_id
    }

    /// Image id of the current session, if one is open.
    pub async fn current_image_id(&self) -> Option<String> {
        self.inner
            .lock()
            .await
            .session
            .as_ref()
            .map(|s| s.image_id.clone())
    }

    async fn ensure_session(&self) -> String {
        let mut inner = self.inner.lock().await;
        match &inner.session {
            Some(session) => session.image_id.clone(),
            None => {
                warn!("no active session; creating one implicitly");
                let session = SessionState::new();
                let image_id = session.image_id.clone();
                inner.session = Some(session);
                image_id
            }
        }
    }

    async fn ensure_ready(&self) -> Result<(), ProviderError> {
        match self.state() {
            ProviderState::Ready | ProviderState::Processing => Ok(()),
            ProviderState::Idle => self.initialize().await.map(|_| ()),
            ProviderState::LoadingModels | ProviderState::Initializing => {
                // Wait for the in-flight initialization to settle
                let _guard = self.init_lock.lock().await;
                match self.state() {
                    ProviderState::Ready | ProviderState::Processing => Ok(()),
                    _ => Err(ProviderError::NotInitialized),
                }
            }
            ProviderState::Error => Err(ProviderError::NotInitialized),
        }
    }

    fn begin_processing(&self) {
        if self.in_flight.fetch_add(1, Ordering::SeqCst) == 0 {
            self.transition(ProviderState::Processing);
        }
    }

    fn end_processing(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1
            && self.state() == ProviderState::Processing
        {
            self.transition(ProviderState::Ready);
        }
    }

    /// Encode the current session's frame ahead of the first decode, so the
    /// decode feels instantaneous. Returns the encode time in milliseconds
    /// (0 on a cache hit).
    pub async fn pre_encode_image(
        &self,
        rgba: Vec<u8>,
        width: u32,
        height: u32,
    ) -> Result<f64, ProviderError> {
        self.ensure_ready().await?;
        let image_id = self.ensure_session().await;

        self.begin_processing();
        let result = self
            .request(move |seq| WorkerRequest::Encode {
                seq,
                image_id,
                rgba,
                width,
                height,
            })
            .await;
        self.end_processing();

        match result? {
            WorkerResponse::Encoded { encode_ms, .. } => Ok(encode_ms),
            WorkerResponse::Error { message, request, .. } => {
                Err(ProviderError::Worker { request, message })
            }
            other => Err(unexpected(other)),
        }
    }

    /// Run one segmentation round for the current session.
    ///
    /// Feeds the previous round's selected logits as `mask_input` and, on
    /// success, stores the new selection's logits for the next round.
    pub async fn segment_single_view(
        &self,
        request: SegmentationRequest,
    ) -> Result<SegmentationOutput, ProviderError> {
        if request.points.is_empty() {
            return Err(ProviderError::InvalidArguments(
                "at least one prompt point is required".into(),
            ));
        }
        let expected = request.width as usize * request.height as usize * 4;
        if request.rgba.len() != expected {
            return Err(ProviderError::InvalidArguments(format!(
                "rgba buffer is {} bytes, expected {}",
                request.rgba.len(),
                expected
            )));
        }

        self.ensure_ready().await?;
        let image_id = self.ensure_session().await;
        let previous_logits = self
            .inner
            .lock()
            .await
            .session
            .as_ref()
            .and_then(|s| s.previous_mask_logits.clone());

        let SegmentationRequest {
            rgba,
            width,
            height,
            points,
            threshold,
        } = request;
        let request_image_id = image_id.clone();

        self.begin_processing();
        let result = self
            .request(move |seq| WorkerRequest::Segment {
                seq,
                image_id: request_image_id,
                rgba,
                points,
                width,
                height,
                previous_logits,
                threshold,
            })
            .await;
        self.end_processing();

        let output = match result? {
            WorkerResponse::Segmented { output, .. } => output,
            WorkerResponse::Error { message, request, .. } => {
                counter!("samkit_segment_failures_total").increment(1);
                return Err(ProviderError::Worker { request, message });
            }
            other => return Err(unexpected(other)),
        };

        // Persist refinement state unless the session changed underneath us
        {
            let mut inner = self.inner.lock().await;
            if let Some(session) = inner.session.as_mut()
                && session.image_id == image_id
            {
                session.previous_mask_logits = tensor::extract_previous_logits(
                    &output.logits,
                    Some(output.selected_mask_index),
                );
                session.last_candidates = output.all_masks.clone();
                session.last_selected_index = Some(output.selected_mask_index);
            }
        }

        Ok(output)
    }

    /// Persist a different candidate's logits for the next refinement round
    /// (the UI overrode the IoU-ranked default).
    pub async fn select_candidate(&self, index: usize) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().await;
        let session = inner
            .session
            .as_mut()
            .ok_or_else(|| ProviderError::InvalidArguments("no active session".into()))?;
        let candidate = session
            .last_candidates
            .iter()
            .find(|c| c.index == index)
            .ok_or_else(|| {
                ProviderError::InvalidArguments(format!("no mask candidate with index {index}"))
            })?;
        session.previous_mask_logits = Some(candidate.logits.clone());
        session.last_selected_index = Some(index);
        debug!("candidate {} will seed the next refinement round", index);
        Ok(())
    }

    /// Cancel the in-flight model download and reject every pending worker
    /// request with `Aborted`. The worker itself stays usable.
    pub fn abort(&self) {
        if let Some(handle) = self.abort.lock().unwrap().take() {
            handle.abort();
        }
        let rejected: Vec<PendingEntry> = {
            let mut queue = self.pending.lock().unwrap();
            queue.drain(..).collect()
        };
        if !rejected.is_empty() {
            debug!("rejecting {} pending worker requests", rejected.len());
        }
        for (_, tx) in rejected {
            let _ = tx.send(Err(ProviderError::Aborted));
        }
        if self.state() == ProviderState::Processing {
            self.transition(ProviderState::Ready);
        }
    }

    /// Abort, dispose the engine, stop the worker and return to `idle`.
    pub async fn dispose(&self) {
        self.abort();
        let mut inner = self.inner.lock().await;
        if let Some(worker) = inner.worker.take() {
            let seq = inner.next_seq;
            inner.next_seq += 1;
            // No pending entry: the pump drops the Disposed response
            let _ = worker.send(WorkerRequest::Dispose { seq });
        }
        inner.pump = None;
        inner.session = None;
        inner.backend = None;
        drop(inner);
        self.transition(ProviderState::Idle);
        info!("provider disposed");
    }

    /// Drop the engine's cached embeddings for one image.
    pub async fn clear_image_cache(&self, image_id: &str) -> Result<(), ProviderError> {
        let image_id = Some(image_id.to_string());
        match self
            .request(move |seq| WorkerRequest::ClearCache { seq, image_id })
            .await?
        {
            WorkerResponse::CacheCleared { .. } => Ok(()),
            WorkerResponse::Error { message, request, .. } => {
                Err(ProviderError::Worker { request, message })
            }
            other => Err(unexpected(other)),
        }
    }

    /// Drop all cached embeddings.
    pub async fn clear_all_caches(&self) -> Result<(), ProviderError> {
        match self
            .request(|seq| WorkerRequest::ClearCache {
                seq,
                image_id: None,
            })
            .await?
        {
            WorkerResponse::CacheCleared { .. } => Ok(()),
            WorkerResponse::Error { message, request, .. } => {
                Err(ProviderError::Worker { request, message })
            }
            other => Err(unexpected(other)),
        }
    }

    /// Engine status snapshot from the worker.
    pub async fn worker_status(&self) -> Result<WorkerStatus, ProviderError> {
        match self.request(|seq| WorkerRequest::GetStatus { seq }).await? {
            WorkerResponse::Status { status, .. } => Ok(status),
            WorkerResponse::Error { message, request, .. } => {
                Err(ProviderError::Worker { request, message })
            }
            other => Err(unexpected(other)),
        }
    }

    /// Whether both model artifacts are already in the durable cache.
    pub async fn models_cached(&self) -> bool {
        self.fetcher.is_cached().await
    }

    /// Cached artifact sizes, if fully cached.
    pub async fn cached_model_info(&self) -> Option<CachedInfo> {
        self.fetcher.cached_info().await
    }

    /// Expected total download size, for UI estimation.
    pub fn total_expected_bytes(&self) -> u64 {
        self.fetcher.total_expected_bytes()
    }

    /// Submit one request and await its FIFO-matched response.
    async fn request(
        &self,
        build: impl FnOnce(u64) -> WorkerRequest,
    ) -> Result<WorkerResponse, ProviderError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().await;
            if inner.worker.is_none() {
                return Err(ProviderError::NotInitialized);
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            // Queue before sending so the response can never outrun its slot
            self.pending.lock().unwrap().push_back((seq, tx));
            let worker = inner.worker.as_ref().expect("checked above");
            if worker.send(build(seq)).is_err() {
                let mut queue = self.pending.lock().unwrap();
                if let Some(pos) = queue.iter().position(|(s, _)| *s == seq) {
                    queue.remove(pos);
                }
                return Err(ProviderError::WorkerGone);
            }
        }
        match rx.await {
            Ok(result) => result,
            // Sender dropped without a verdict: provider went away
            Err(_) => Err(ProviderError::Aborted),
        }
    }
}

fn unexpected(response: WorkerResponse) -> ProviderError {
    ProviderError::Protocol(format!(
        "unexpected response '{}'",
        response.message_type()
    ))
}

/// Match worker responses to pending requests in FIFO order. Responses whose
/// seq is no longer at the front belong to aborted requests and are dropped.
async fn pump_responses(
    mut responses: mpsc::UnboundedReceiver<WorkerResponse>,
    pending: PendingQueue,
) {
    while let Some(response) = responses.recv().await {
        let Some(seq) = response.seq() else {
            if let WorkerResponse::Debug { message } = &response {
                debug!("worker: {}", message);
            }
            continue;
        };
        let sender = {
            let mut queue = pending.lock().unwrap();
            match queue.front() {
                Some((front_seq, _)) if *front_seq == seq => queue.pop_front().map(|(_, tx)| tx),
                _ => None,
            }
        };
        match sender {
            Some(tx) => {
                let _ = tx.send(Ok(response));
            }
            None => debug!("dropping response for request {} (aborted)", seq),
        }
    }
    // Worker gone: nothing pending will ever resolve
    let orphaned: Vec<PendingEntry> = pending.lock().unwrap().drain(..).collect();
    for (_, tx) in orphaned {
        let _ = tx.send(Err(ProviderError::WorkerGone));
    }
}
