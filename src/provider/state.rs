//! Provider lifecycle and per-session state

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::MaskCandidate;

/// Provider lifecycle. Transitions are the single source of truth for the
/// orchestrator:
///
/// ```text
/// idle ──initialize──▶ loading-models ──▶ initializing ──▶ ready
///                                   │             │           │
///                                   ▼             ▼           ▼
///                                 error         error     processing ──(ok|err)──▶ ready
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderState {
    Idle,
    LoadingModels,
    Initializing,
    Ready,
    Processing,
    Error,
}

impl std::fmt::Display for ProviderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProviderState::Idle => "idle",
            ProviderState::LoadingModels => "loading-models",
            ProviderState::Initializing => "initializing",
            ProviderState::Ready => "ready",
            ProviderState::Processing => "processing",
            ProviderState::Error => "error",
        };
        f.write_str(s)
    }
}

/// State of the image currently being segmented.
///
/// A session is the UI-side notion ("we are segmenting this picture");
/// `image_id` is the engine cache key. They map 1:1 — starting a session
/// mints both.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub image_id: String,
    /// Selected logits of the last decode, fed into the next one
    pub previous_mask_logits: Option<Vec<f32>>,
    /// Candidates of the last decode, kept so the UI can re-pick
    pub last_candidates: Vec<MaskCandidate>,
    pub last_selected_index: Option<usize>,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            image_id: Uuid::new_v4().to_string(),
            previous_mask_logits: None,
            last_candidates: Vec::new(),
            last_selected_index: None,
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}
