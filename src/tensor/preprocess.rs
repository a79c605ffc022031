//! Image and prompt tensor packing for the encoder/decoder contract
//!
//! The encoder takes a normalized `1x3xSxS` float tensor (S = 1024) with
//! values in [0, 1]; any further normalization is baked into the model.
//! The decoder takes point coordinates rescaled into that SxS space.

use image::{RgbaImage, imageops};
use ndarray::{Array2, Array3, Array4};

use crate::config::{DECODER_MASK_SIZE, ENCODER_INPUT_SIZE};
use crate::engine::{EngineError, PromptPoint};

/// Resize an RGBA frame to the encoder resolution and repack it as a
/// channel-first normalized tensor `[1, 3, S, S]`.
pub fn preprocess_image(
    rgba: &[u8],
    width: u32,
    height: u32,
) -> Result<Array4<f32>, EngineError> {
    let expected = width as usize * height as usize * 4;
    if rgba.len() != expected {
        return Err(EngineError::InvalidInput(format!(
            "rgba buffer is {} bytes, expected {} for {}x{}",
            rgba.len(),
            expected,
            width,
            height
        )));
    }

    let image = RgbaImage::from_raw(width, height, rgba.to_vec())
        .ok_or_else(|| EngineError::InvalidInput("rgba buffer does not fit dimensions".into()))?;

    let side = ENCODER_INPUT_SIZE;
    let resized = if (width, height) == (side, side) {
        image
    } else {
        imageops::resize(&image, side, side, imageops::FilterType::Triangle)
    };

    let s = side as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, s, s));
    for (x, y, pixel) in resized.enumerate_pixels() {
        tensor[[0, 0, y as usize, x as usize]] = pixel[0] as f32 / 255.0;
        tensor[[0, 1, y as usize, x as usize]] = pixel[1] as f32 / 255.0;
        tensor[[0, 2, y as usize, x as usize]] = pixel[2] as f32 / 255.0;
    }

    Ok(tensor)
}

/// Rescale a point from captured-image space to encoder space.
///
/// No clamping: out-of-frame points are forwarded as-is.
pub fn scale_point(x: f32, y: f32, width: u32, height: u32) -> (f32, f32) {
    let side = ENCODER_INPUT_SIZE as f32;
    (x * side / width as f32, y * side / height as f32)
}

/// Pack prompt coordinates into a `[1, N, 2]` tensor in encoder space.
pub fn point_coords_tensor(points: &[PromptPoint], width: u32, height: u32) -> Array3<f32> {
    let mut data = Vec::with_capacity(points.len() * 2);
    for p in points {
        let (x, y) = scale_point(p.x, p.y, width, height);
        data.push(x);
        data.push(y);
    }
    Array3::from_shape_vec((1, points.len(), 2), data)
        .expect("coords length matches point count")
}

/// Pack prompt labels into a `[1, N]` tensor (1.0 fg, 0.0 bg).
pub fn point_labels_tensor(points: &[PromptPoint]) -> Array2<f32> {
    let data: Vec<f32> = points.iter().map(|p| p.label.as_f32()).collect();
    Array2::from_shape_vec((1, points.len()), data).expect("labels length matches point count")
}

/// Build the `[1, 1, 256, 256]` mask input from previous logits, or zeros.
pub fn mask_input_tensor(previous_logits: Option<&[f32]>) -> Result<Array4<f32>, EngineError> {
    let side = DECODER_MASK_SIZE as usize;
    match previous_logits {
        Some(logits) => {
            if logits.len() != side * side {
                return Err(EngineError::InvalidInput(format!(
                    "previous mask logits are {} floats, expected {}",
                    logits.len(),
                    side * side
                )));
            }
            Ok(Array4::from_shape_vec((1, 1, side, side), logits.to_vec())
                .expect("logits length checked above"))
        }
        None => Ok(Array4::zeros((1, 1, side, side))),
    }
}

/// Build the `[1, 1]` has-mask flag tensor.
pub fn has_mask_tensor(present: bool) -> Array2<f32> {
    Array2::from_elem((1, 1), if present { 1.0 } else { 0.0 })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn white_rgba(width: u32, height: u32) -> Vec<u8> {
        vec![255u8; (width * height * 4) as usize]
    }

    #[test]
    fn test_preprocess_shape_and_range() {
        let tensor = preprocess_image(&white_rgba(64, 32), 64, 32).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 1024, 1024]);
        assert!(tensor.iter().all(|v| (0.0..=1.0).contains(v)));
        // White input stays white after resize
        assert_eq!(tensor[[0, 0, 0, 0]], 1.0);
        assert_eq!(tensor[[0, 2, 1023, 1023]], 1.0);
    }

    #[test]
    fn test_preprocess_at_native_size_is_pure_reshuffle() {
        let side = ENCODER_INPUT_SIZE;
        let mut rgba = white_rgba(side, side);
        // Mark one pixel to verify channel placement survives untouched
        let idx = ((side * 7 + 5) * 4) as usize;
        rgba[idx] = 51; // R
        rgba[idx + 1] = 102; // G
        rgba[idx + 2] = 204; // B

        let tensor = preprocess_image(&rgba, side, side).unwrap();
        assert_eq!(tensor[[0, 0, 7, 5]], 51.0 / 255.0);
        assert_eq!(tensor[[0, 1, 7, 5]], 102.0 / 255.0);
        assert_eq!(tensor[[0, 2, 7, 5]], 204.0 / 255.0);
    }

    #[test]
    fn test_preprocess_rejects_bad_length() {
        let err = preprocess_image(&[0u8; 10], 4, 4).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn test_scale_point() {
        let (x, y) = scale_point(320.0, 180.0, 640, 360);
        assert_eq!((x, y), (512.0, 512.0));
        // No clamping for out-of-frame points
        let (x, y) = scale_point(-10.0, 400.0, 640, 360);
        assert!(x < 0.0);
        assert!(y > 1024.0);
    }

    #[test]
    fn test_point_tensors() {
        let points = vec![
            PromptPoint::foreground(0.0, 0.0),
            PromptPoint::background(640.0, 360.0),
        ];
        let coords = point_coords_tensor(&points, 640, 360);
        assert_eq!(coords.shape(), &[1, 2, 2]);
        assert_eq!(coords[[0, 1, 0]], 1024.0);
        assert_eq!(coords[[0, 1, 1]], 1024.0);

        let labels = point_labels_tensor(&points);
        assert_eq!(labels.shape(), &[1, 2]);
        assert_eq!(labels[[0, 0]], 1.0);
        assert_eq!(labels[[0, 1]], 0.0);
    }

    #[test]
    fn test_mask_input_tensor() {
        let zeros = mask_input_tensor(None).unwrap();
        assert_eq!(zeros.shape(), &[1, 1, 256, 256]);
        assert!(zeros.iter().all(|v| *v == 0.0));

        let logits = vec![0.5f32; 256 * 256];
        let filled = mask_input_tensor(Some(&logits)).unwrap();
        assert_eq!(filled[[0, 0, 128, 128]], 0.5);

        assert!(mask_input_tensor(Some(&[1.0, 2.0])).is_err());
    }

    #[test]
    fn test_has_mask_tensor() {
        assert_eq!(has_mask_tensor(true)[[0, 0]], 1.0);
        assert_eq!(has_mask_tensor(false)[[0, 0]], 0.0);
    }
}
