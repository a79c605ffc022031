//! Seams to external editor collaborators
//!
//! The viewport renderer supplies captured frames; the selection sink
//! consumes confirmed masks. Both are editor-owned; the pipeline only holds
//! trait objects.

use async_trait::async_trait;
use image::RgbaImage;
use thiserror::Error;

use crate::tensor::SelectionOp;

/// RGBA canvas whose alpha channel encodes the mask (0 or 255 per pixel)
pub type MaskCanvas = RgbaImage;

/// Errors from external collaborators
#[derive(Debug, Error)]
pub enum ExternalError {
    #[error("offscreen render failed: {0}")]
    Render(String),

    #[error("selection update failed: {0}")]
    Selection(String),
}

/// Supplies viewport frames for segmentation
#[async_trait]
pub trait ViewportRenderer: Send + Sync {
    /// Current viewport dimensions in pixels.
    fn viewport_size(&self) -> (u32, u32);

    /// Render the viewport offscreen at the given size. Returns
    /// `width * height * 4` RGBA bytes, row-major, top-left origin.
    async fn render_offscreen(&self, width: u32, height: u32) -> Result<Vec<u8>, ExternalError>;
}

/// Receives confirmed masks as selection updates
#[async_trait]
pub trait SelectionSink: Send + Sync {
    async fn apply_mask(&self, op: SelectionOp, canvas: MaskCanvas) -> Result<(), ExternalError>;
}
