//! SAM2 two-stage inference over ONNX Runtime
//!
//! The encoder turns a 1024x1024 frame into an image embedding plus optional
//! high-resolution feature maps; the decoder turns embeddings and prompt
//! points into K candidate mask planes with predicted IoU scores. Both are
//! opaque exported graphs; this module only honors their tensor contract.

use std::time::Instant;

use ort::execution_providers::CUDA;
use ort::session::Session;
use ort::session::builder::GraphOptimizationLevel;
use ort::value::Value;
use tracing::{debug, info, warn};

use super::cache::{EmbeddingCache, ImageEmbeddings, TensorData};
use super::types::{
    DecodeRequest, DecodeTiming, EncodeOutput, EngineError, ExecutionBackend, InferenceEngine,
    MaskCandidate, SegmentationOutput,
};
use crate::config::{DECODER_MASK_SIZE, EngineConfig};
use crate::tensor;

const EMBED_ALIASES: [&str; 2] = ["image_embed", "image_embeddings"];
const HIGH_RES_ALIASES: [[&str; 2]; 2] = [
    ["high_res_feats_0", "high_res_features_0"],
    ["high_res_feats_1", "high_res_features_1"],
];
const MASKS_ALIASES: [&str; 2] = ["masks", "low_res_masks"];
const IOU_ALIASES: [&str; 2] = ["iou_predictions", "iou_pred"];

/// ONNX-backed implementation of [`InferenceEngine`]
pub struct Sam2Engine {
    encoder: Session,
    decoder: Session,
    backend: ExecutionBackend,
    config: EngineConfig,
    cache: EmbeddingCache,
    encoder_input: String,
    encoder_outputs: Vec<String>,
    decoder_inputs: Vec<String>,
    decoder_outputs: Vec<String>,
}

impl Sam2Engine {
    /// Build encoder and decoder sessions, trying backends in order
    /// `[gpu, cpu]` (or `[cpu]` alone when CPU is preferred). A failure on
    /// one backend drops any partially created session before the next try.
    pub fn new(
        encoder_bytes: &[u8],
        decoder_bytes: &[u8],
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let order: &[ExecutionBackend] = if config.prefer_cpu {
            &[ExecutionBackend::Cpu]
        } else {
            &[ExecutionBackend::Gpu, ExecutionBackend::Cpu]
        };

        let mut last_error = String::from("no backend attempted");
        for &backend in order {
            match Self::build_sessions(encoder_bytes, decoder_bytes, backend) {
                Ok((encoder, decoder)) => {
                    info!("inference sessions created on {} backend", backend);
                    let encoder_input = encoder
                        .inputs()
                        .first()
                        .map(|i| i.name().to_string())
                        .unwrap_or_else(|| "image".to_string());
                    let encoder_outputs: Vec<String> =
                        encoder.outputs().iter().map(|o| o.name().to_string()).collect();
                    let decoder_inputs: Vec<String> =
                        decoder.inputs().iter().map(|i| i.name().to_string()).collect();
                    let decoder_outputs: Vec<String> =
                        decoder.outputs().iter().map(|o| o.name().to_string()).collect();
                    if config.verbose {
                        debug!(?encoder_outputs, ?decoder_inputs, ?decoder_outputs, "model signatures");
                    }
                    let max_cached = config.max_cached_embeddings;
                    return Ok(Self {
                        encoder,
                        decoder,
                        backend,
                        config,
                        cache: EmbeddingCache::new(max_cached),
                        encoder_input,
                        encoder_outputs,
                        decoder_inputs,
                        decoder_outputs,
                    });
                }
                Err(e) => {
                    warn!("session creation failed on {} backend: {}", backend, e);
                    last_error = e.to_string();
                }
            }
        }
        Err(EngineError::Init(last_error))
    }

    fn build_sessions(
        encoder_bytes: &[u8],
        decoder_bytes: &[u8],
        backend: ExecutionBackend,
    ) -> Result<(Session, Session), ort::Error> {
        let encoder = Self::build_session(encoder_bytes, backend)?;
        // If the decoder fails here, the encoder session drops with the error
        let decoder = Self::build_session(decoder_bytes, backend)?;
        Ok((encoder, decoder))
    }

    fn build_session(bytes: &[u8], backend: ExecutionBackend) -> Result<Session, ort::Error> {
        let mut builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?;
        if backend == ExecutionBackend::Gpu {
            builder = builder.with_execution_providers([CUDA::default()
                .build()
                .error_on_failure()])?;
        }
        builder.commit_from_memory(bytes)
    }

    fn resolve<'a>(names: &'a [String], aliases: &[&str]) -> Option<&'a str> {
        names
            .iter()
            .find(|n| aliases.contains(&n.as_str()))
            .map(String::as_str)
    }
}

/// Turn cached tensor data back into an ONNX runtime value.
fn tensor_value(tensor: TensorData) -> Result<ort::value::Tensor<f32>, ort::Error> {
    let TensorData { shape, data } = tensor;
    Value::from_array((shape.as_slice(), data))
}

impl InferenceEngine for Sam2Engine {
    fn encode(
        &mut self,
        image_id: &str,
        rgba: &[u8],
        width: u32,
        height: u32,
    ) -> Result<EncodeOutput, EngineError> {
        if self.cache.contains(image_id) {
            debug!("embeddings for image {} already cached", image_id);
            return Ok(EncodeOutput { encode_ms: 0.0 });
        }

        let start = Instant::now();
        let input = tensor::preprocess_image(rgba, width, height)?;
        let input_value = Value::from_array(input)?;
        let input_name = self.encoder_input.clone();
        let outputs = self
            .encoder
            .run(ort::inputs![input_name.as_str() => input_value])?;

        let embed_name = Self::resolve(&self.encoder_outputs, &EMBED_ALIASES)
            .or(self.encoder_outputs.first().map(String::as_str))
            .ok_or_else(|| EngineError::ModelIo("encoder has no outputs".into()))?;
        let (shape, data) = outputs[embed_name].try_extract_tensor::<f32>()?;
        let image_embed = TensorData::new(
            shape.as_ref().iter().map(|&d| d as usize).collect(),
            data.to_vec(),
        );

        let mut high_res = Vec::new();
        for aliases in HIGH_RES_ALIASES {
            if let Some(name) = Self::resolve(&self.encoder_outputs, &aliases) {
                let (shape, data) = outputs[name].try_extract_tensor::<f32>()?;
                high_res.push(TensorData::new(
                    shape.as_ref().iter().map(|&d| d as usize).collect(),
                    data.to_vec(),
                ));
            }
        }
        drop(outputs);

        self.cache.insert(
            image_id.to_string(),
            ImageEmbeddings {
                image_embed,
                high_res,
            },
        );

        let encode_ms = start.elapsed().as_secs_f64() * 1000.0;
        debug!("encoded image {} in {:.1} ms", image_id, encode_ms);
        Ok(EncodeOutput { encode_ms })
    }

    fn decode(&mut self, request: DecodeRequest<'_>) -> Result<SegmentationOutput, EngineError> {
        if request.points.is_empty() {
            return Err(EngineError::InvalidInput("no prompt points".into()));
        }

        let embeddings = self
            .cache
            .get(request.image_id)
            .ok_or_else(|| EngineError::NotEncoded(request.image_id.to_string()))?
            .clone();

        let start = Instant::now();

        let coords = tensor::point_coords_tensor(request.points, request.width, request.height);
        let labels = tensor::point_labels_tensor(request.points);
        let mask_input = tensor::mask_input_tensor(request.previous_logits)?;
        let has_mask = tensor::has_mask_tensor(request.previous_logits.is_some());

        let embed_name = Self::resolve(&self.decoder_inputs, &EMBED_ALIASES)
            .ok_or_else(|| EngineError::ModelIo("decoder takes no image embedding".into()))?
            .to_string();
        let ImageEmbeddings {
            image_embed,
            high_res,
        } = embeddings;
        let embed_value = tensor_value(image_embed)?;
        let coords_value = Value::from_array(coords)?;
        let labels_value = Value::from_array(labels)?;
        let mask_value = Value::from_array(mask_input)?;
        let has_mask_value = Value::from_array(has_mask)?;

        // Feed high-res features only when the export declares those inputs.
        // `multimask_output` is baked into the export and must never be fed.
        let hr_names: Vec<String> = HIGH_RES_ALIASES
            .iter()
            .filter_map(|aliases| Self::resolve(&self.decoder_inputs, aliases))
            .map(str::to_string)
            .collect();
        let outputs = if hr_names.len() == 2 && high_res.len() == 2 {
            let mut hr = high_res.into_iter();
            let hr0_value = tensor_value(hr.next().expect("two high-res tensors"))?;
            let hr1_value = tensor_value(hr.next().expect("two high-res tensors"))?;
            self.decoder.run(ort::inputs![
                embed_name.as_str() => embed_value,
                "point_coords" => coords_value,
                "point_labels" => labels_value,
                "mask_input" => mask_value,
                "has_mask_input" => has_mask_value,
                hr_names[0].as_str() => hr0_value,
                hr_names[1].as_str() => hr1_value,
            ])?
        } else {
            self.decoder.run(ort::inputs![
                embed_name.as_str() => embed_value,
                "point_coords" => coords_value,
                "point_labels" => labels_value,
                "mask_input" => mask_value,
                "has_mask_input" => has_mask_value,
            ])?
        };

        let masks_name = Self::resolve(&self.decoder_outputs, &MASKS_ALIASES)
            .or(self.decoder_outputs.first().map(String::as_str))
            .ok_or_else(|| EngineError::ModelIo("decoder has no outputs".into()))?;
        let (masks_shape, masks_data) = outputs[masks_name].try_extract_tensor::<f32>()?;
        let shape: &[i64] = masks_shape.as_ref();
        if shape.len() != 4 {
            return Err(EngineError::ModelIo(format!(
                "mask output has rank {}, expected 4",
                shape.len()
            )));
        }
        let k = shape[1] as usize;
        if k == 0 {
            return Err(EngineError::ModelIo("decoder produced zero mask planes".into()));
        }
        let side = DECODER_MASK_SIZE;
        let plane = (side * side) as usize;
        if masks_data.len() != k * plane {
            return Err(EngineError::ModelIo(format!(
                "mask output holds {} floats, expected {} planes of {}",
                masks_data.len(),
                k,
                plane
            )));
        }

        let iou_scores: Vec<f32> = match Self::resolve(&self.decoder_outputs, &IOU_ALIASES) {
            Some(name) => {
                let (_, iou_data) = outputs[name].try_extract_tensor::<f32>()?;
                iou_data.to_vec()
            }
            None => {
                warn!("decoder reports no IoU predictions, defaulting to candidate 0");
                vec![1.0; k]
            }
        };

        let selected = tensor::select_best_candidate(&iou_scores, self.config.exclude_aux_candidate)
            .min(k - 1);
        let threshold = request.threshold.unwrap_or(self.config.mask_threshold);

        let mut all_masks = Vec::with_capacity(k);
        for idx in 0..k {
            let logits = tensor::slice_candidate_logits(masks_data, idx);
            let small = tensor::candidate_mask_from_logits(logits, threshold);
            let mask =
                tensor::resize_mask_binary(&small, side, side, request.width, request.height);
            all_masks.push(MaskCandidate {
                index: idx,
                iou_score: iou_scores.get(idx).copied().unwrap_or(1.0),
                mask,
                width: request.width,
                height: request.height,
                logits: logits.to_vec(),
            });
        }

        let decode_ms = start.elapsed().as_secs_f64() * 1000.0;
        debug!(
            "decoded {} candidates for image {} in {:.1} ms, selected {}",
            k, request.image_id, decode_ms, selected
        );

        Ok(SegmentationOutput {
            width: request.width,
            height: request.height,
            mask: all_masks[selected].mask.clone(),
            logits: all_masks[selected].logits.clone(),
            all_masks,
            selected_mask_index: selected,
            timing: DecodeTiming {
                encode_ms: 0.0,
                decode_ms,
            },
        })
    }

    fn clear_image_cache(&mut self, image_id: &str) {
        self.cache.remove(image_id);
    }

    fn clear_all_caches(&mut self) {
        self.cache.clear();
    }

    fn cached_image_count(&self) -> usize {
        self.cache.len()
    }

    fn backend(&self) -> ExecutionBackend {
        self.backend
    }
}
