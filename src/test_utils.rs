//! Test fixtures: in-memory model fetcher, scripted inference engine and
//! fake editor collaborators
//!
//! Compiled for this crate's unit tests and, behind the `test-util`
//! feature, for the integration suite — one fixture source for both.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::EngineConfig;
use crate::engine::{
    DecodeRequest, DecodeTiming, EncodeOutput, EngineError, ExecutionBackend, InferenceEngine,
    MaskCandidate, SegmentationOutput,
};
use crate::store::{
    AbortSignal, CachedInfo, LoadProgress, LoadStage, LoadedModels, ModelFetcher, ProgressFn,
    StoreError,
};
use crate::worker::EngineFactory;

/// In-memory model source with optional per-chunk delay (for abort tests)
pub struct MemoryFetcher {
    pub cached: bool,
    pub chunk_delay: Option<Duration>,
    pub encoder: Vec<u8>,
    pub decoder: Vec<u8>,
}

impl MemoryFetcher {
    pub fn instant(cached: bool) -> Arc<Self> {
        Arc::new(Self {
            cached,
            chunk_delay: None,
            encoder: vec![1u8; 64],
            decoder: vec![2u8; 32],
        })
    }

    pub fn slow(chunk_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            cached: false,
            chunk_delay: Some(chunk_delay),
            encoder: vec![1u8; 64],
            decoder: vec![2u8; 32],
        })
    }
}

#[async_trait]
impl ModelFetcher for MemoryFetcher {
    async fn is_cached(&self) -> bool {
        self.cached
    }

    async fn cached_info(&self) -> Option<CachedInfo> {
        self.cached.then_some(CachedInfo {
            encoder_bytes: self.encoder.len() as u64,
            decoder_bytes: self.decoder.len() as u64,
        })
    }

    async fn load_all(
        &self,
        on_progress: ProgressFn,
        abort: AbortSignal,
    ) -> Result<LoadedModels, StoreError> {
        let total = (self.encoder.len() + self.decoder.len()) as u64;
        let stages = [
            (LoadStage::Encoder, self.encoder.len() as u64, 0u64),
            (
                LoadStage::Decoder,
                self.decoder.len() as u64,
                self.encoder.len() as u64,
            ),
        ];
        for (stage, len, base) in stages {
            // Emit a handful of chunks per stage
            for step in 1..=4u64 {
                if let Some(delay) = self.chunk_delay {
                    tokio::time::sleep(delay).await;
                }
                if abort.is_aborted() {
                    return Err(StoreError::Aborted);
                }
                on_progress(LoadProgress {
                    loaded: base + len * step / 4,
                    total,
                    stage,
                });
            }
        }
        Ok(LoadedModels {
            encoder: self.encoder.clone(),
            decoder: self.decoder.clone(),
        })
    }

    async fn clear_cache(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn total_expected_bytes(&self) -> u64 {
        (self.encoder.len() + self.decoder.len()) as u64
    }
}

/// One decode call as observed by the fake engine
#[derive(Debug, Clone)]
pub struct RecordedDecode {
    pub image_id: String,
    pub point_count: usize,
    pub previous_logits: Option<Vec<f32>>,
}

/// What the fake engine should answer
#[derive(Clone)]
pub struct EngineScript {
    pub iou_scores: Vec<f32>,
    /// Fail this many decodes before succeeding
    pub fail_decodes: usize,
    pub backend: ExecutionBackend,
}

impl Default for EngineScript {
    fn default() -> Self {
        Self {
            iou_scores: vec![0.7, 0.9, 0.8],
            fail_decodes: 0,
            backend: ExecutionBackend::Cpu,
        }
    }
}

/// Deterministic logits plane for candidate `k`
pub fn plane_logits(k: usize) -> Vec<f32> {
    vec![(k as f32 + 1.0) * 10.0; 256 * 256]
}

/// Deterministic binary mask for candidate `k` at the given resolution
pub fn plane_mask(k: usize, width: u32, height: u32) -> Vec<u8> {
    (0..(width * height) as usize)
        .map(|i| if i % (k + 2) == 0 { 255 } else { 0 })
        .collect()
}

pub struct ScriptedEngine {
    script: EngineScript,
    encoded: Vec<String>,
    failures_left: usize,
    recorded: Arc<Mutex<Vec<RecordedDecode>>>,
}

impl ScriptedEngine {
    fn output(&self, width: u32, height: u32) -> SegmentationOutput {
        let scores = if self.script.iou_scores.is_empty() {
            vec![1.0]
        } else {
            self.script.iou_scores.clone()
        };
        // Rank with the real selection logic so fixtures can never drift
        // from the crate's tie-break behavior
        let selected = crate::tensor::select_best_candidate(&scores, false);
        let all_masks: Vec<MaskCandidate> = (0..scores.len())
            .map(|idx| MaskCandidate {
                index: idx,
                iou_score: scores[idx],
                mask: plane_mask(idx, width, height),
                width,
                height,
                logits: plane_logits(idx),
            })
            .collect();
        SegmentationOutput {
            width,
            height,
            mask: all_masks[selected].mask.clone(),
            logits: all_masks[selected].logits.clone(),
            all_masks,
            selected_mask_index: selected,
            timing: DecodeTiming {
                encode_ms: 0.0,
                decode_ms: 3.0,
            },
        }
    }
}

impl InferenceEngine for ScriptedEngine {
    fn encode(
        &mut self,
        image_id: &str,
        _rgba: &[u8],
        _width: u32,
        _height: u32,
    ) -> Result<EncodeOutput, EngineError> {
        if self.encoded.iter().any(|id| id == image_id) {
            return Ok(EncodeOutput { encode_ms: 0.0 });
        }
        self.encoded.push(image_id.to_string());
        Ok(EncodeOutput { encode_ms: 7.0 })
    }

    fn decode(&mut self, request: DecodeRequest<'_>) -> Result<SegmentationOutput, EngineError> {
        self.recorded.lock().unwrap().push(RecordedDecode {
            image_id: request.image_id.to_string(),
            point_count: request.points.len(),
            previous_logits: request.previous_logits.map(|l| l.to_vec()),
        });
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(EngineError::ModelIo("scripted decode failure".into()));
        }
        if !self.encoded.iter().any(|id| id == request.image_id) {
            return Err(EngineError::NotEncoded(request.image_id.to_string()));
        }
        Ok(self.output(request.width, request.height))
    }

    fn clear_image_cache(&mut self, image_id: &str) {
        self.encoded.retain(|id| id != image_id);
    }

    fn clear_all_caches(&mut self) {
        self.encoded.clear();
    }

    fn cached_image_count(&self) -> usize {
        self.encoded.len()
    }

    fn backend(&self) -> ExecutionBackend {
        self.script.backend
    }
}

/// Engine factory producing scripted engines; decode calls are observable
/// through the returned recorder.
pub fn scripted_factory(script: EngineScript) -> (EngineFactory, Arc<Mutex<Vec<RecordedDecode>>>) {
    let recorded = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&recorded);
    let factory: EngineFactory = Arc::new(move |_enc, _dec, _config: EngineConfig| {
        Ok(Box::new(ScriptedEngine {
            script: script.clone(),
            encoded: Vec::new(),
            failures_left: script.fail_decodes,
            recorded: Arc::clone(&recorder),
        }) as Box<dyn InferenceEngine>)
    });
    (factory, recorded)
}

/// A solid white RGBA frame
pub fn white_frame(width: u32, height: u32) -> Vec<u8> {
    vec![255u8; (width * height * 4) as usize]
}

/// Renderer fake returning solid white frames at a fixed viewport size
pub struct FakeRenderer {
    width: u32,
    height: u32,
    pub fail: std::sync::atomic::AtomicBool,
}

impl FakeRenderer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            fail: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl crate::external::ViewportRenderer for FakeRenderer {
    fn viewport_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    async fn render_offscreen(
        &self,
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>, crate::external::ExternalError> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(crate::external::ExternalError::Render(
                "scripted render failure".into(),
            ));
        }
        Ok(white_frame(width, height))
    }
}

/// Selection sink fake recording every applied canvas
#[derive(Default)]
pub struct RecordingSink {
    pub applied: Mutex<Vec<(crate::tensor::SelectionOp, u32, u32)>>,
}

#[async_trait]
impl crate::external::SelectionSink for RecordingSink {
    async fn apply_mask(
        &self,
        op: crate::tensor::SelectionOp,
        canvas: crate::external::MaskCanvas,
    ) -> Result<(), crate::external::ExternalError> {
        let (width, height) = canvas.dimensions();
        self.applied.lock().unwrap().push((op, width, height));
        Ok(())
    }
}
