//! Editor-facing message set
//!
//! Commands flow in from the editor (one mpsc queue, handled serially);
//! events flow out on a broadcast channel. Both are tagged variants so
//! nothing stringly-typed crosses the module boundary.

use serde::{Deserialize, Serialize};

use crate::capability::GpuCapabilities;
use crate::engine::{ExecutionBackend, MaskCandidate, PromptPoint};
use crate::provider::ProviderState;
use crate::store::LoadStage;

/// Commands the editor sends to the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EditorCommand {
    /// Capture the current viewport and pre-encode it
    CapturePreview,
    /// Run segmentation for the given prompt points
    Segment { points: Vec<PromptPoint> },
    /// Override which candidate feeds the next refinement round
    MaskSelected { index: usize },
    /// Confirm the pending mask and forward it to selection
    ApplyMask,
    /// Discard the pending mask
    CancelMask,
    /// Eagerly initialize the provider (downloads models if needed)
    InitializeProvider,
    /// Tear the provider down
    DisposeProvider,
}

/// Timing stats attached to `SegmentComplete`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SegmentStats {
    pub total_ms: f64,
    pub encode_ms: f64,
    pub decode_ms: f64,
}

/// Events the orchestrator emits for the UI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SamEvent {
    /// GPU capability report (informational, never blocks execution)
    Capabilities { report: GpuCapabilities },
    /// The probed GPU has under 4 GiB of estimated VRAM
    LowVramWarning { estimated_vram_bytes: u64 },
    /// Model download/initialization progress
    ModelLoadProgress {
        loaded: u64,
        total: u64,
        stage: LoadStage,
    },
    /// Provider lifecycle transition
    ProviderStatusChanged { state: ProviderState },
    /// Provider reached `ready`
    ProviderReady { backend: ExecutionBackend },
    /// Provider initialization failed
    InitError { message: String },
    /// A viewport frame was captured and a session opened for it
    ImageCaptured {
        image_id: String,
        width: u32,
        height: u32,
    },
    EncodingStart { image_id: String },
    EncodingComplete { image_id: String, encode_ms: f64 },
    EncodingError { image_id: String, message: String },
    SegmentStart,
    SegmentComplete {
        has_pending_mask: bool,
        stats: SegmentStats,
    },
    SegmentError { message: String },
    /// Candidate masks are ready for preview
    MaskReady {
        mask: Vec<u8>,
        width: u32,
        height: u32,
        all_masks: Vec<MaskCandidate>,
        selected_mask_index: usize,
    },
    MaskApplied,
    MaskCancelled,
}

impl EditorCommand {
    /// Command type name for metrics and logs
    pub fn message_type(&self) -> &'static str {
        match self {
            EditorCommand::CapturePreview => "capture_preview",
            EditorCommand::Segment { .. } => "segment",
            EditorCommand::MaskSelected { .. } => "mask_selected",
            EditorCommand::ApplyMask => "apply_mask",
            EditorCommand::CancelMask => "cancel_mask",
            EditorCommand::InitializeProvider => "initialize_provider",
            EditorCommand::DisposeProvider => "dispose_provider",
        }
    }
}

impl SamEvent {
    /// Event type name for metrics and logs
    pub fn message_type(&self) -> &'static str {
        match self {
            SamEvent::Capabilities { .. } => "capabilities",
            SamEvent::LowVramWarning { .. } => "low_vram_warning",
            SamEvent::ModelLoadProgress { .. } => "model_load_progress",
            SamEvent::ProviderStatusChanged { .. } => "provider_status_changed",
            SamEvent::ProviderReady { .. } => "provider_ready",
            SamEvent::InitError { .. } => "init_error",
            SamEvent::ImageCaptured { .. } => "image_captured",
            SamEvent::EncodingStart { .. } => "encoding_start",
            SamEvent::EncodingComplete { .. } => "encoding_complete",
            SamEvent::EncodingError { .. } => "encoding_error",
            SamEvent::SegmentStart => "segment_start",
            SamEvent::SegmentComplete { .. } => "segment_complete",
            SamEvent::SegmentError { .. } => "segment_error",
            SamEvent::MaskReady { .. } => "mask_ready",
            SamEvent::MaskApplied => "mask_applied",
            SamEvent::MaskCancelled => "mask_cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_serialization() {
        let cmd = EditorCommand::Segment {
            points: vec![PromptPoint::foreground(1.0, 2.0)],
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "segment");
        assert_eq!(json["points"][0]["label"], "foreground");
    }

    #[test]
    fn test_event_type_names() {
        assert_eq!(SamEvent::MaskApplied.message_type(), "mask_applied");
        assert_eq!(
            SamEvent::SegmentError {
                message: "x".into()
            }
            .message_type(),
            "segment_error"
        );
    }
}
