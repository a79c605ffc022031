//! Background compute worker
//!
//! Runs the inference engine on a dedicated thread so encode/decode never
//! block the caller's executor. Requests are handled strictly one at a time
//! in arrival order, and every request gets exactly one response. Failures —
//! including panics inside the engine — become `Error` responses; the worker
//! itself survives them and keeps serving.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Instant;

use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::engine::{DecodeRequest, EngineError, InferenceEngine, Sam2Engine};
use crate::protocol::{RequestKind, WorkerRequest, WorkerResponse, WorkerStatus};

/// Builds an engine from model bytes inside the worker thread.
///
/// Shared so a provider can re-initialize after failure with the same
/// factory; tests inject scripted engines here.
pub type EngineFactory = std::sync::Arc<
    dyn Fn(Vec<u8>, Vec<u8>, EngineConfig) -> Result<Box<dyn InferenceEngine>, EngineError>
        + Send
        + Sync,
>;

/// The production factory: ONNX sessions via [`Sam2Engine`].
pub fn sam2_engine_factory() -> EngineFactory {
    std::sync::Arc::new(|encoder_bytes, decoder_bytes, config| {
        Sam2Engine::new(&encoder_bytes, &decoder_bytes, config)
            .map(|engine| Box::new(engine) as Box<dyn InferenceEngine>)
    })
}

/// Handle to a spawned compute worker
pub struct WorkerHandle {
    request_tx: mpsc::UnboundedSender<WorkerRequest>,
    response_rx: Option<mpsc::UnboundedReceiver<WorkerResponse>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Submit a request. Fails only when the worker thread is gone.
    pub fn send(&self, request: WorkerRequest) -> Result<(), WorkerRequest> {
        self.request_tx.send(request).map_err(|e| e.0)
    }

    /// Take the response stream. Callable once; the consumer matches
    /// responses to requests FIFO.
    pub fn take_responses(&mut self) -> Option<mpsc::UnboundedReceiver<WorkerResponse>> {
        self.response_rx.take()
    }

    /// Wait for the thread to exit. Dropping the handle instead also stops
    /// the worker once the request channel closes.
    pub fn join(self) {
        let WorkerHandle {
            request_tx, thread, ..
        } = self;
        drop(request_tx);
        if let Some(thread) = thread {
            let _ = thread.join();
        }
    }
}

/// Spawn a compute worker around the given engine factory.
pub fn spawn_worker(factory: EngineFactory) -> WorkerHandle {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (response_tx, response_rx) = mpsc::unbounded_channel();

    let thread = std::thread::Builder::new()
        .name("sam-compute".to_string())
        .spawn(move || run_worker(request_rx, response_tx, factory))
        .expect("spawning the compute thread");

    WorkerHandle {
        request_tx,
        response_rx: Some(response_rx),
        thread: Some(thread),
    }
}

fn run_worker(
    mut requests: mpsc::UnboundedReceiver<WorkerRequest>,
    responses: mpsc::UnboundedSender<WorkerResponse>,
    factory: EngineFactory,
) {
    info!("compute worker started");
    let mut engine: Option<Box<dyn InferenceEngine>> = None;

    while let Some(request) = requests.blocking_recv() {
        let seq = request.seq();
        let kind = request.kind();
        let start = Instant::now();
        counter!("samkit_worker_requests_total", "type" => kind.as_str()).increment(1);

        if matches!(request, WorkerRequest::Dispose { .. }) {
            engine = None;
            let _ = responses.send(WorkerResponse::Disposed { seq });
            break;
        }

        // A panicking engine must not take the worker down with it
        let response = match catch_unwind(AssertUnwindSafe(|| {
            handle(&mut engine, &factory, request, &responses)
        })) {
                Ok(response) => response,
                Err(panic) => {
                    warn!("request {} panicked", kind);
                    WorkerResponse::Error {
                        seq,
                        message: panic_message(panic),
                        request: kind,
                    }
                }
            };

        histogram!("samkit_worker_request_duration_seconds", "type" => kind.as_str())
            .record(start.elapsed());
        if matches!(response, WorkerResponse::Error { .. }) {
            counter!("samkit_worker_errors_total", "type" => kind.as_str()).increment(1);
        }

        if responses.send(response).is_err() {
            debug!("response receiver dropped, stopping worker");
            break;
        }
    }

    info!("compute worker stopped");
}

fn handle(
    engine: &mut Option<Box<dyn InferenceEngine>>,
    factory: &EngineFactory,
    request: WorkerRequest,
    responses: &mpsc::UnboundedSender<WorkerResponse>,
) -> WorkerResponse {
    let seq = request.seq();
    let kind = request.kind();

    let result = match request {
        WorkerRequest::Initialize {
            encoder_bytes,
            decoder_bytes,
            config,
            ..
        } => {
            let verbose = config.verbose;
            factory(encoder_bytes, decoder_bytes, config).map(|built| {
                let backend = built.backend();
                *engine = Some(built);
                if verbose {
                    let _ = responses.send(WorkerResponse::Debug {
                        message: format!("engine initialized on {} backend", backend),
                    });
                }
                WorkerResponse::Initialized { seq, backend }
            })
        }
        WorkerRequest::Encode {
            image_id,
            rgba,
            width,
            height,
            ..
        } => require(engine).and_then(|engine| {
            engine
                .encode(&image_id, &rgba, width, height)
                .map(|out| WorkerResponse::Encoded {
                    seq,
                    image_id,
                    encode_ms: out.encode_ms,
                })
        }),
        WorkerRequest::Decode {
            image_id,
            points,
            width,
            height,
            previous_logits,
            threshold,
            ..
        } => require(engine).and_then(|engine| {
            engine
                .decode(DecodeRequest {
                    image_id: &image_id,
                    points: &points,
                    width,
                    height,
                    previous_logits: previous_logits.as_deref(),
                    threshold,
                })
                .map(|output| WorkerResponse::Decoded { seq, output })
        }),
        WorkerRequest::Segment {
            image_id,
            rgba,
            points,
            width,
            height,
            previous_logits,
            threshold,
            ..
        } => require(engine).and_then(|engine| {
            engine
                .segment(
                    &image_id,
                    &rgba,
                    &points,
                    width,
                    height,
                    previous_logits.as_deref(),
                    threshold,
                )
                .map(|output| WorkerResponse::Segmented { seq, output })
        }),
        WorkerRequest::ClearCache { image_id, .. } => require(engine).map(|engine| {
            match image_id {
                Some(id) => engine.clear_image_cache(&id),
                None => engine.clear_all_caches(),
            }
            WorkerResponse::CacheCleared { seq }
        }),
        WorkerRequest::GetStatus { .. } => Ok(WorkerResponse::Status {
            seq,
            status: WorkerStatus {
                initialized: engine.is_some(),
                backend: engine.as_ref().map(|e| e.backend()),
                cached_images: engine.as_ref().map_or(0, |e| e.cached_image_count()),
            },
        }),
        WorkerRequest::Dispose { .. } => unreachable!("dispose is handled in the loop"),
    };

    result.unwrap_or_else(|e| WorkerResponse::Error {
        seq,
        message: e.to_string(),
        request: kind,
    })
}

fn require(
    engine: &mut Option<Box<dyn InferenceEngine>>,
) -> Result<&mut Box<dyn InferenceEngine>, EngineError> {
    engine
        .as_mut()
        .ok_or_else(|| EngineError::Init("engine is not initialized".into()))
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "engine panicked".to_string()
    }
}
