//! Mask post-processing: binarization, resizing and selection canvases
//!
//! Two resize paths exist on purpose. The binary path re-thresholds after
//! upscaling and feeds selection; the smooth path keeps fractional membership
//! and feeds preview overlays. Mixing them up produces soft selections or
//! aliased previews.

use image::{GrayImage, Luma, RgbaImage, imageops};
use tracing::warn;

use crate::config::DECODER_MASK_SIZE;
use crate::engine::SegmentationOutput;

/// Selection operation forwarded to the downstream consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionOp {
    Add,
    Remove,
    Set,
}

/// Options for [`apply_mask_to_selection`]
#[derive(Debug, Clone, Copy)]
pub struct SelectionOptions {
    pub op: SelectionOp,
    /// Applied to sigmoid(logit) when candidate logits are available
    pub threshold: f32,
    pub target_width: u32,
    pub target_height: u32,
}

/// Binarize one logits plane: 255 where `logit > threshold`, else 0.
pub fn candidate_mask_from_logits(logits: &[f32], threshold: f32) -> Vec<u8> {
    logits
        .iter()
        .map(|&v| if v > threshold { 255 } else { 0 })
        .collect()
}

/// Slice the `k`-th `256x256` plane out of a `[1, K, 256, 256]` buffer.
pub fn slice_candidate_logits(data: &[f32], k: usize) -> &[f32] {
    let plane = (DECODER_MASK_SIZE * DECODER_MASK_SIZE) as usize;
    &data[k * plane..(k + 1) * plane]
}

/// Upscale a binary mask with bilinear filtering and re-threshold at 127.
///
/// Output bytes are exactly 0 or 255. Intended for selection.
pub fn resize_mask_binary(mask: &[u8], mw: u32, mh: u32, tw: u32, th: u32) -> Vec<u8> {
    if (mw, mh) == (tw, th) {
        return mask.to_vec();
    }
    let gray = GrayImage::from_fn(mw, mh, |x, y| Luma([mask[(y * mw + x) as usize]]));
    let resized = imageops::resize(&gray, tw, th, imageops::FilterType::Triangle);
    resized
        .pixels()
        .map(|p| if p[0] > 127 { 255 } else { 0 })
        .collect()
}

/// Upscale a binary mask with bilinear filtering, keeping soft membership.
///
/// Output values are in [0, 1]. Intended for visualization.
pub fn resize_mask_smooth(mask: &[u8], mw: u32, mh: u32, tw: u32, th: u32) -> Vec<f32> {
    if (mw, mh) == (tw, th) {
        return mask.iter().map(|&v| v as f32 / 255.0).collect();
    }
    let gray = GrayImage::from_fn(mw, mh, |x, y| Luma([mask[(y * mw + x) as usize]]));
    let resized = imageops::resize(&gray, tw, th, imageops::FilterType::Triangle);
    resized.pixels().map(|p| p[0] as f32 / 255.0).collect()
}

/// Pick the candidate with the highest predicted IoU; ties break to the
/// smallest index. With `exclude_aux` set and a four-plane output, index 0
/// is treated as an auxiliary mask and skipped.
pub fn select_best_candidate(iou_scores: &[f32], exclude_aux: bool) -> usize {
    if iou_scores.is_empty() {
        return 0;
    }
    let start = if exclude_aux && iou_scores.len() == 4 {
        1
    } else {
        0
    };
    let mut best = start;
    for (k, &score) in iou_scores.iter().enumerate().skip(start) {
        if score > iou_scores[best] {
            best = k;
        }
    }
    best
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Recover the selected candidate's `256x256` logits from whatever the
/// worker handed back.
///
/// A buffer of exactly one plane is trusted as the selected slice. A
/// multi-plane buffer is sliced at `selected_index` when known, falling back
/// to plane 0 with a warning. Anything else is discarded.
pub fn extract_previous_logits(logits: &[f32], selected_index: Option<usize>) -> Option<Vec<f32>> {
    let plane = (DECODER_MASK_SIZE * DECODER_MASK_SIZE) as usize;
    if logits.len() == plane {
        return Some(logits.to_vec());
    }
    if !logits.is_empty() && logits.len() % plane == 0 {
        let planes = logits.len() / plane;
        let k = match selected_index {
            Some(k) if k < planes => k,
            _ => {
                warn!(
                    "selected index unavailable for {}-plane logits blob, using plane 0",
                    planes
                );
                0
            }
        };
        return Some(slice_candidate_logits(logits, k).to_vec());
    }
    warn!(
        "discarding previous-mask logits of unexpected length {}",
        logits.len()
    );
    None
}

/// Convert a segmentation result into an RGBA selection canvas.
///
/// Selected pixels get alpha 255, everything else 0. When the selected
/// candidate's logits are available the mask is re-derived from
/// `sigmoid(logit) > threshold`; otherwise the binary mask is used verbatim
/// and the threshold is ignored. Scaling to the target uses nearest
/// filtering so edges stay hard.
pub fn apply_mask_to_selection(output: &SegmentationOutput, opts: &SelectionOptions) -> RgbaImage {
    let side = DECODER_MASK_SIZE;
    let plane = (side * side) as usize;

    let (mask, mw, mh) = if output.logits.len() == plane {
        let binary: Vec<u8> = output
            .logits
            .iter()
            .map(|&v| if sigmoid(v) > opts.threshold { 255 } else { 0 })
            .collect();
        (
            resize_mask_binary(&binary, side, side, output.width, output.height),
            output.width,
            output.height,
        )
    } else {
        (output.mask.clone(), output.width, output.height)
    };

    let canvas = RgbaImage::from_fn(mw, mh, |x, y| {
        let on = mask[(y * mw + x) as usize] > 0;
        image::Rgba([255, 255, 255, if on { 255 } else { 0 }])
    });

    if (mw, mh) == (opts.target_width, opts.target_height) {
        canvas
    } else {
        imageops::resize(
            &canvas,
            opts.target_width,
            opts.target_height,
            imageops::FilterType::Nearest,
        )
    }
}
