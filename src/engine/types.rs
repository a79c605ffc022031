//! Engine-level types and error definitions

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the inference engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no execution provider could be initialized: {0}")]
    Init(String),

    #[error("image {0} has not been encoded")]
    NotEncoded(String),

    #[error("model I/O failed: {0}")]
    ModelIo(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl From<ort::Error> for EngineError {
    fn from(e: ort::Error) -> Self {
        EngineError::ModelIo(e.to_string())
    }
}

/// Execution backend actually used by the sessions
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionBackend {
    Gpu,
    Cpu,
}

impl std::fmt::Display for ExecutionBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionBackend::Gpu => write!(f, "gpu"),
            ExecutionBackend::Cpu => write!(f, "cpu"),
        }
    }
}

/// Foreground/background role of a prompt point
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PointLabel {
    Foreground,
    Background,
}

impl PointLabel {
    /// Numeric label fed to the decoder
    pub fn as_f32(self) -> f32 {
        match self {
            PointLabel::Foreground => 1.0,
            PointLabel::Background => 0.0,
        }
    }
}

/// A user click in captured-image pixel space
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PromptPoint {
    pub x: f32,
    pub y: f32,
    pub label: PointLabel,
}

impl PromptPoint {
    pub fn foreground(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            label: PointLabel::Foreground,
        }
    }

    pub fn background(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            label: PointLabel::Background,
        }
    }
}

/// One decoder output plane, binarized and upscaled to image resolution.
///
/// `index` reflects granularity: 0 = tight, 1 = medium, 2 = broad.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaskCandidate {
    pub index: usize,
    pub iou_score: f32,
    /// Row-major bytes, each 0 or 255, `width * height` long
    pub mask: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Raw 256x256 logits for this plane, reused for iterative refinement
    pub logits: Vec<f32>,
}

/// Wall-clock timings of a decode, in milliseconds
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DecodeTiming {
    pub encode_ms: f64,
    pub decode_ms: f64,
}

/// Result of a decode: ranked candidates plus the default selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationOutput {
    pub width: u32,
    pub height: u32,
    /// Bytewise equal to `all_masks[selected_mask_index].mask`
    pub mask: Vec<u8>,
    /// Logits of the selected candidate (256x256)
    pub logits: Vec<f32>,
    pub all_masks: Vec<MaskCandidate>,
    pub selected_mask_index: usize,
    pub timing: DecodeTiming,
}

/// Result of an encode call
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EncodeOutput {
    /// 0.0 when the image id was already cached
    pub encode_ms: f64,
}

/// A decode invocation against previously encoded embeddings
#[derive(Debug, Clone)]
pub struct DecodeRequest<'a> {
    pub image_id: &'a str,
    pub points: &'a [PromptPoint],
    pub width: u32,
    pub height: u32,
    /// Selected logits of the previous decode for this image, if any
    pub previous_logits: Option<&'a [f32]>,
    /// Overrides the configured logit threshold when set
    pub threshold: Option<f32>,
}

/// Seam between the worker shim and the model runtime.
///
/// Implemented by [`super::Sam2Engine`] over ONNX Runtime sessions and by
/// scripted fakes in tests. Methods take `&mut self`: the engine runs on a
/// single compute thread and processes one request at a time.
pub trait InferenceEngine: Send {
    /// Resize, tensorize and encode an image, caching embeddings by id.
    /// Idempotent per id; a cache hit reports 0 ms.
    fn encode(
        &mut self,
        image_id: &str,
        rgba: &[u8],
        width: u32,
        height: u32,
    ) -> Result<EncodeOutput, EngineError>;

    /// Decode prompt points against cached embeddings.
    fn decode(&mut self, request: DecodeRequest<'_>) -> Result<SegmentationOutput, EngineError>;

    /// Encode (if needed) then decode in one call.
    fn segment(
        &mut self,
        image_id: &str,
        rgba: &[u8],
        points: &[PromptPoint],
        width: u32,
        height: u32,
        previous_logits: Option<&[f32]>,
        threshold: Option<f32>,
    ) -> Result<SegmentationOutput, EngineError> {
        let encoded = self.encode(image_id, rgba, width, height)?;
        let mut output = self.decode(DecodeRequest {
            image_id,
            points,
            width,
            height,
            previous_logits,
            threshold,
        })?;
        output.timing.encode_ms = encoded.encode_ms;
        Ok(output)
    }

    /// Drop cached embeddings for one image id.
    fn clear_image_cache(&mut self, image_id: &str);

    /// Drop all cached embeddings.
    fn clear_all_caches(&mut self);

    /// Number of images currently held in the embedding cache.
    fn cached_image_count(&self) -> usize;

    /// Backend the sessions ended up on.
    fn backend(&self) -> ExecutionBackend;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_labels() {
        assert_eq!(PromptPoint::foreground(1.0, 2.0).label.as_f32(), 1.0);
        assert_eq!(PromptPoint::background(1.0, 2.0).label.as_f32(), 0.0);
    }

    #[test]
    fn test_backend_display() {
        assert_eq!(ExecutionBackend::Gpu.to_string(), "gpu");
        assert_eq!(ExecutionBackend::Cpu.to_string(), "cpu");
    }
}
