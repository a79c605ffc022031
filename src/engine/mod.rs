//! Inference engine: encoder/decoder sessions and per-image embedding cache

mod cache;
mod sam2;
mod types;

pub use cache::{EmbeddingCache, ImageEmbeddings, TensorData};
pub use sam2::Sam2Engine;
pub use types::{
    DecodeRequest, DecodeTiming, EncodeOutput, EngineError, ExecutionBackend, InferenceEngine,
    MaskCandidate, PointLabel, PromptPoint, SegmentationOutput,
};
