//! Compute-worker request/response protocol
//!
//! A strict request/response pairing: the worker answers every request, in
//! submission order, with exactly one response carrying the same `seq`.
//! Large buffers (model bytes, frames, logits) move through the channel by
//! value, transferring ownership instead of copying.

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::engine::{ExecutionBackend, PromptPoint, SegmentationOutput};

/// Requests accepted by the compute worker
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Build the engine from raw model bytes
    Initialize {
        seq: u64,
        encoder_bytes: Vec<u8>,
        decoder_bytes: Vec<u8>,
        config: EngineConfig,
    },
    /// Encode a frame and cache its embeddings
    Encode {
        seq: u64,
        image_id: String,
        rgba: Vec<u8>,
        width: u32,
        height: u32,
    },
    /// Decode prompt points against cached embeddings
    Decode {
        seq: u64,
        image_id: String,
        points: Vec<PromptPoint>,
        width: u32,
        height: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        previous_logits: Option<Vec<f32>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        threshold: Option<f32>,
    },
    /// Encode (if needed) and decode in one round trip
    Segment {
        seq: u64,
        image_id: String,
        rgba: Vec<u8>,
        points: Vec<PromptPoint>,
        width: u32,
        height: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        previous_logits: Option<Vec<f32>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        threshold: Option<f32>,
    },
    /// Drop cached embeddings for one image, or all of them
    ClearCache {
        seq: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        image_id: Option<String>,
    },
    /// Report engine status
    GetStatus { seq: u64 },
    /// Tear down the engine and stop the worker
    Dispose { seq: u64 },
}

/// Responses produced by the compute worker, mirroring the requests
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    Initialized {
        seq: u64,
        backend: ExecutionBackend,
    },
    Encoded {
        seq: u64,
        image_id: String,
        encode_ms: f64,
    },
    Decoded {
        seq: u64,
        output: SegmentationOutput,
    },
    Segmented {
        seq: u64,
        output: SegmentationOutput,
    },
    CacheCleared {
        seq: u64,
    },
    Status {
        seq: u64,
        status: WorkerStatus,
    },
    Disposed {
        seq: u64,
    },
    /// Any failure while handling a request; the worker stays alive
    Error {
        seq: u64,
        message: String,
        request: RequestKind,
    },
    /// Out-of-band diagnostics (verbose mode); not part of the FIFO pairing
    Debug { message: String },
}

/// Discriminant of a request, used to tag errors and metrics
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Initialize,
    Encode,
    Decode,
    Segment,
    ClearCache,
    GetStatus,
    Dispose,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Initialize => "initialize",
            RequestKind::Encode => "encode",
            RequestKind::Decode => "decode",
            RequestKind::Segment => "segment",
            RequestKind::ClearCache => "clear_cache",
            RequestKind::GetStatus => "get_status",
            RequestKind::Dispose => "dispose",
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine status snapshot
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub initialized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<ExecutionBackend>,
    pub cached_images: usize,
}

impl WorkerRequest {
    pub fn seq(&self) -> u64 {
        match self {
            WorkerRequest::Initialize { seq, .. }
            | WorkerRequest::Encode { seq, .. }
            | WorkerRequest::Decode { seq, .. }
            | WorkerRequest::Segment { seq, .. }
            | WorkerRequest::ClearCache { seq, .. }
            | WorkerRequest::GetStatus { seq }
            | WorkerRequest::Dispose { seq } => *seq,
        }
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            WorkerRequest::Initialize { .. } => RequestKind::Initialize,
            WorkerRequest::Encode { .. } => RequestKind::Encode,
            WorkerRequest::Decode { .. } => RequestKind::Decode,
            WorkerRequest::Segment { .. } => RequestKind::Segment,
            WorkerRequest::ClearCache { .. } => RequestKind::ClearCache,
            WorkerRequest::GetStatus { .. } => RequestKind::GetStatus,
            WorkerRequest::Dispose { .. } => RequestKind::Dispose,
        }
    }
}

impl WorkerResponse {
    /// Request this response answers; `None` for out-of-band diagnostics.
    pub fn seq(&self) -> Option<u64> {
        match self {
            WorkerResponse::Initialized { seq, .. }
            | WorkerResponse::Encoded { seq, .. }
            | WorkerResponse::Decoded { seq, .. }
            | WorkerResponse::Segmented { seq, .. }
            | WorkerResponse::CacheCleared { seq }
            | WorkerResponse::Status { seq, .. }
            | WorkerResponse::Disposed { seq }
            | WorkerResponse::Error { seq, .. } => Some(*seq),
            WorkerResponse::Debug { .. } => None,
        }
    }

    /// Response type name for metrics
    pub fn message_type(&self) -> &'static str {
        match self {
            WorkerResponse::Initialized { .. } => "initialized",
            WorkerResponse::Encoded { .. } => "encoded",
            WorkerResponse::Decoded { .. } => "decoded",
            WorkerResponse::Segmented { .. } => "segmented",
            WorkerResponse::CacheCleared { .. } => "cache_cleared",
            WorkerResponse::Status { .. } => "status",
            WorkerResponse::Disposed { .. } => "disposed",
            WorkerResponse::Error { .. } => "error",
            WorkerResponse::Debug { .. } => "debug",
        }
    }
}
