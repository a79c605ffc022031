//! Orchestrator: the policy layer between editor commands and the provider
//!
//! Consumes [`EditorCommand`]s from one queue (handled strictly in order, so
//! the events of one operation never interleave with another's) and emits
//! [`SamEvent`]s on a broadcast channel. Owns the pending-mask state: the
//! accepted-but-unconfirmed candidate between `mask_ready` and
//! apply/cancel.

use std::sync::Arc;
use std::time::Instant;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::engine::{PromptPoint, SegmentationOutput};
use crate::external::{SelectionSink, ViewportRenderer};
use crate::protocol::{EditorCommand, SamEvent, SegmentStats};
use crate::provider::{
    ProviderError, ProviderState, SegmentationProvider, SegmentationRequest,
};
use crate::store::CachedInfo;
use crate::tensor::{SelectionOp, SelectionOptions, apply_mask_to_selection};

/// Share of the decode window attributed to encoding in segment stats
const ENCODE_STAT_SHARE: f64 = 0.7;

/// Threshold used when a confirmed mask is converted for selection
const SELECTION_THRESHOLD: f32 = 0.5;

/// The accepted-but-not-applied candidate awaiting confirmation
#[derive(Debug, Clone)]
pub struct PendingMask {
    pub response: SegmentationOutput,
    pub canvas_width: u32,
    pub canvas_height: u32,
}

/// Answer to the model-download-info query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDownloadInfo {
    pub total_expected_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached: Option<CachedInfo>,
}

/// Mediates between the editor and the segmentation provider
pub struct Orchestrator {
    provider: Arc<SegmentationProvider>,
    renderer: Arc<dyn ViewportRenderer>,
    selection: Arc<dyn SelectionSink>,
    events: broadcast::Sender<SamEvent>,
    pending_mask: Mutex<Option<PendingMask>>,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<SegmentationProvider>,
        renderer: Arc<dyn ViewportRenderer>,
        selection: Arc<dyn SelectionSink>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);

        // Forward model-load progress into the event stream
        let progress_events = events.clone();
        provider.set_progress_handler(Arc::new(move |progress| {
            let _ = progress_events.send(SamEvent::ModelLoadProgress {
                loaded: progress.loaded,
                total: progress.total,
                stage: progress.stage,
            });
        }));

        Arc::new(Self {
            provider,
            renderer,
            selection,
            events,
            pending_mask: Mutex::new(None),
        })
    }

    /// Subscribe to the outbound event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SamEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SamEvent) {
        debug!("emit {}", event.message_type());
        let _ = self.events.send(event);
    }

    /// Drive the command queue until the editor closes it. Lifecycle
    /// transitions are relayed as `provider_status_changed` while running.
    pub async fn run(self: Arc<Self>, mut commands: mpsc::Receiver<EditorCommand>) {
        let state_task = {
            let orchestrator = Arc::clone(&self);
            let mut state_rx = self.provider.subscribe_state();
            tokio::spawn(async move {
                while state_rx.changed().await.is_ok() {
                    let state = *state_rx.borrow_and_update();
                    orchestrator.emit(SamEvent::ProviderStatusChanged { state });
                }
            })
        };

        info!("orchestrator running");
        while let Some(command) = commands.recv().await {
            self.handle_command(command).await;
        }
        state_task.abort();
        info!("orchestrator stopped");
    }

    /// Handle one command. Public so embedders without a queue can drive the
    /// orchestrator directly.
    pub async fn handle_command(&self, command: EditorCommand) {
        counter!("samkit_commands_total", "type" => command.message_type()).increment(1);
        match command {
            EditorCommand::CapturePreview => self.capture_preview().await,
            EditorCommand::Segment { points } => self.segment(points).await,
            EditorCommand::MaskSelected { index } => self.mask_selected(index).await,
            EditorCommand::ApplyMask => self.apply_mask().await,
            EditorCommand::CancelMask => self.cancel_mask().await,
            EditorCommand::InitializeProvider => self.initialize_provider().await,
            EditorCommand::DisposeProvider => self.dispose_provider().await,
        }
    }

    /// Current provider lifecycle state (request/response query).
    pub fn provider_status(&self) -> ProviderState {
        self.provider.state()
    }

    /// Whether both model artifacts are cached (request/response query).
    pub async fn models_cached(&self) -> bool {
        self.provider.models_cached().await
    }

    /// Download size estimation for the UI (request/response query).
    pub async fn model_download_info(&self) -> ModelDownloadInfo {
        ModelDownloadInfo {
            total_expected_bytes: self.provider.total_expected_bytes(),
            cached: self.provider.cached_model_info().await,
        }
    }

    async fn initialize_provider(&self) {
        let capabilities = self.provider.capabilities().await.clone();
        let low_vram = capabilities.available && capabilities.is_low_vram;
        let estimated_vram_bytes = capabilities.estimated_vram_bytes;
        self.emit(SamEvent::Capabilities {
            report: capabilities,
        });
        if low_vram {
            self.emit(SamEvent::LowVramWarning {
                estimated_vram_bytes,
            });
        }

        match self.provider.initialize().await {
            Ok(backend) => self.emit(SamEvent::ProviderReady { backend }),
            Err(e) => {
                warn!("provider initialization failed: {}", e);
                self.emit(SamEvent::InitError {
                    message: e.to_string(),
                });
            }
        }
    }

    async fn dispose_provider(&self) {
        self.pending_mask.lock().await.take();
        self.provider.dispose().await;
    }

    async fn capture_preview(&self) {
        let (width, height) = self.renderer.viewport_size();
        let rgba = match self.renderer.render_offscreen(width, height).await {
            Ok(rgba) => rgba,
            Err(e) => {
                warn!("viewport capture failed: {}", e);
                return;
            }
        };

        // A new capture invalidates any stale mask state
        let image_id = self.provider.start_new_session().await;
        self.pending_mask.lock().await.take();
        self.emit(SamEvent::ImageCaptured {
            image_id: image_id.clone(),
            width,
            height,
        });

        // Encode in the background so the first decode feels instantaneous
        self.emit(SamEvent::EncodingStart {
            image_id: image_id.clone(),
        });
        match self.provider.pre_encode_image(rgba, width, height).await {
            Ok(encode_ms) => self.emit(SamEvent::EncodingComplete {
                image_id,
                encode_ms,
            }),
            Err(e) => {
                warn!("pre-encode failed: {}", e);
                self.emit(SamEvent::EncodingError {
                    image_id,
                    message: e.to_string(),
                });
            }
        }
    }

    async fn segment(&self, points: Vec<PromptPoint>) {
        // Empty prompt sets are a silent no-op: no start, no error
        if points.is_empty() {
            debug!("segment command with no points ignored");
            return;
        }

        // Lazy initialization surfaces the full capability/ready event set
        if self.provider.state() == ProviderState::Idle {
            self.initialize_provider().await;
        }

        self.emit(SamEvent::SegmentStart);
        let started = Instant::now();

        let (width, height) = self.renderer.viewport_size();
        // Re-render: the viewport may have changed since the last capture
        let rgba = match self.renderer.render_offscreen(width, height).await {
            Ok(rgba) => rgba,
            Err(e) => {
                self.emit(SamEvent::SegmentError {
                    message: e.to_string(),
                });
                return;
            }
        };

        let request = SegmentationRequest {
            rgba,
            width,
            height,
            points,
            threshold: None,
        };

        match self.provider.segment_single_view(request).await {
            Ok(output) => {
                let total_ms = started.elapsed().as_secs_f64() * 1000.0;
                self.emit(SamEvent::MaskReady {
                    mask: output.mask.clone(),
                    width: output.width,
                    height: output.height,
                    all_masks: output.all_masks.clone(),
                    selected_mask_index: output.selected_mask_index,
                });
                *self.pending_mask.lock().await = Some(PendingMask {
                    response: output,
                    canvas_width: width,
                    canvas_height: height,
                });
                self.emit(SamEvent::SegmentComplete {
                    has_pending_mask: true,
                    stats: SegmentStats {
                        total_ms,
                        encode_ms: total_ms * ENCODE_STAT_SHARE,
                        decode_ms: total_ms * (1.0 - ENCODE_STAT_SHARE),
                    },
                });
            }
            Err(ProviderError::InvalidArguments(reason)) => {
                // Malformed input from the editor: drop the operation
                debug!("segment ignored: {}", reason);
            }
            Err(e) => {
                warn!("segmentation failed: {}", e);
                self.emit(SamEvent::SegmentError {
                    message: e.to_string(),
                });
            }
        }
    }

    async fn mask_selected(&self, index: usize) {
        if let Err(e) = self.provider.select_candidate(index).await {
            warn!("candidate override rejected: {}", e);
        }
    }

    async fn apply_mask(&self) {
        let Some(pending) = self.pending_mask.lock().await.take() else {
            debug!("apply_mask with nothing pending");
            return;
        };

        let canvas = apply_mask_to_selection(
            &pending.response,
            &SelectionOptions {
                op: SelectionOp::Add,
                threshold: SELECTION_THRESHOLD,
                target_width: pending.canvas_width,
                target_height: pending.canvas_height,
            },
        );

        match self.selection.apply_mask(SelectionOp::Add, canvas).await {
            Ok(()) => self.emit(SamEvent::MaskApplied),
            Err(e) => warn!("selection sink rejected the mask: {}", e),
        }
    }

    async fn cancel_mask(&self) {
        if self.pending_mask.lock().await.take().is_some() {
            self.emit(SamEvent::MaskCancelled);
        } else {
            debug!("cancel_mask with nothing pending");
        }
    }

    /// Whether a mask is awaiting confirmation.
    pub async fn has_pending_mask(&self) -> bool {
        self.pending_mask.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::provider::SegmentationProvider;
    use crate::test_utils::{
        EngineScript, FakeRenderer, MemoryFetcher, RecordingSink, scripted_factory,
    };

    fn orchestrator_with(
        script: EngineScript,
    ) -> (Arc<Orchestrator>, Arc<RecordingSink>, broadcast::Receiver<SamEvent>) {
        let (factory, _) = scripted_factory(script);
        let provider = Arc::new(SegmentationProvider::with_engine_factory(
            MemoryFetcher::instant(true),
            EngineConfig::default(),
            factory,
        ));
        let renderer = Arc::new(FakeRenderer::new(64, 48));
        let sink = Arc::new(RecordingSink::default());
        let orchestrator = Orchestrator::new(provider, renderer, Arc::clone(&sink) as _);
        let events = orchestrator.subscribe();
        (orchestrator, sink, events)
    }

    fn drain(events: &mut broadcast::Receiver<SamEvent>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(event) = events.try_recv() {
            names.push(event.message_type());
        }
        names
    }

    #[tokio::test]
    async fn test_empty_points_is_a_silent_noop() {
        let (orchestrator, _, mut events) = orchestrator_with(EngineScript::default());
        orchestrator
            .handle_command(EditorCommand::Segment { points: vec![] })
            .await;
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_segment_emits_ordered_events_and_sets_pending() {
        let (orchestrator, _, mut events) = orchestrator_with(EngineScript::default());
        orchestrator
            .handle_command(EditorCommand::Segment {
                points: vec![PromptPoint::foreground(32.0, 24.0)],
            })
            .await;

        let names = drain(&mut events);
        let start = names.iter().position(|n| *n == "segment_start").unwrap();
        let ready = names.iter().position(|n| *n == "mask_ready").unwrap();
        let complete = names
            .iter()
            .position(|n| *n == "segment_complete")
            .unwrap();
        assert!(start < ready && ready < complete);
        assert!(orchestrator.has_pending_mask().await);
    }

    #[tokio::test]
    async fn test_apply_mask_applies_exactly_once() {
        let (orchestrator, sink, mut events) = orchestrator_with(EngineScript::default());
        orchestrator
            .handle_command(EditorCommand::Segment {
                points: vec![PromptPoint::foreground(32.0, 24.0)],
            })
            .await;
        drain(&mut events);

        orchestrator.handle_command(EditorCommand::ApplyMask).await;
        assert_eq!(drain(&mut events), vec!["mask_applied"]);
        assert_eq!(sink.applied.lock().unwrap().len(), 1);

        // Second apply: nothing pending, nothing happens
        orchestrator.handle_command(EditorCommand::ApplyMask).await;
        assert!(drain(&mut events).is_empty());
        assert_eq!(sink.applied.lock().unwrap().len(), 1);

        // Cancel after apply is a no-op too
        orchestrator.handle_command(EditorCommand::CancelMask).await;
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_cancel_then_apply_is_a_noop() {
        let (orchestrator, sink, mut events) = orchestrator_with(EngineScript::default());
        orchestrator
            .handle_command(EditorCommand::Segment {
                points: vec![PromptPoint::foreground(1.0, 1.0)],
            })
            .await;
        drain(&mut events);

        orchestrator.handle_command(EditorCommand::CancelMask).await;
        assert_eq!(drain(&mut events), vec!["mask_cancelled"]);

        orchestrator.handle_command(EditorCommand::ApplyMask).await;
        assert!(drain(&mut events).is_empty());
        assert!(sink.applied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_capture_preview_emits_capture_and_encoding_events() {
        let (orchestrator, _, mut events) = orchestrator_with(EngineScript::default());
        orchestrator
            .handle_command(EditorCommand::InitializeProvider)
            .await;
        drain(&mut events);

        orchestrator
            .handle_command(EditorCommand::CapturePreview)
            .await;
        let names = drain(&mut events);
        assert_eq!(
            names,
            vec!["image_captured", "encoding_start", "encoding_complete"]
        );
    }

    #[tokio::test]
    async fn test_initialize_provider_emits_capabilities_then_ready_or_error() {
        let (orchestrator, _, mut events) = orchestrator_with(EngineScript::default());
        orchestrator
            .handle_command(EditorCommand::InitializeProvider)
            .await;
        let names = drain(&mut events);
        assert_eq!(names.first(), Some(&"capabilities"));
        assert!(names.contains(&"provider_ready") || names.contains(&"init_error"));
        // Progress events were forwarded ahead of readiness
        assert!(!names.contains(&"segment_start"));
    }

    #[tokio::test]
    async fn test_worker_failure_surfaces_as_segment_error() {
        let script = EngineScript {
            fail_decodes: 1,
            ..EngineScript::default()
        };
        let (orchestrator, _, mut events) = orchestrator_with(script);
        let points = vec![PromptPoint::foreground(2.0, 2.0)];

        orchestrator
            .handle_command(EditorCommand::Segment {
                points: points.clone(),
            })
            .await;
        let names = drain(&mut events);
        assert!(names.contains(&"segment_error"));
        assert!(!names.contains(&"mask_ready"));

        // The worker survived: the next segment succeeds
        orchestrator
            .handle_command(EditorCommand::Segment { points })
            .await;
        let names = drain(&mut events);
        assert!(names.contains(&"mask_ready"));
    }

    #[tokio::test]
    async fn test_render_failure_paths() {
        use std::sync::atomic::Ordering;

        let (factory, _) = scripted_factory(EngineScript::default());
        let provider = Arc::new(SegmentationProvider::with_engine_factory(
            MemoryFetcher::instant(true),
            EngineConfig::default(),
            factory,
        ));
        let renderer = Arc::new(FakeRenderer::new(32, 32));
        let sink = Arc::new(RecordingSink::default());
        let orchestrator = Orchestrator::new(
            Arc::clone(&provider),
            Arc::clone(&renderer) as _,
            Arc::clone(&sink) as _,
        );
        let mut events = orchestrator.subscribe();

        orchestrator
            .handle_command(EditorCommand::InitializeProvider)
            .await;
        drain(&mut events);

        renderer.fail.store(true, Ordering::SeqCst);

        // Capture: the failure is swallowed; no events, no session opened
        orchestrator
            .handle_command(EditorCommand::CapturePreview)
            .await;
        assert!(drain(&mut events).is_empty());
        assert!(provider.current_image_id().await.is_none());

        // Segment: started, then surfaced as a segment error
        let points = vec![PromptPoint::foreground(1.0, 1.0)];
        orchestrator
            .handle_command(EditorCommand::Segment {
                points: points.clone(),
            })
            .await;
        assert_eq!(drain(&mut events), vec!["segment_start", "segment_error"]);
        assert!(!orchestrator.has_pending_mask().await);

        // A working renderer recovers both flows
        renderer.fail.store(false, Ordering::SeqCst);
        orchestrator
            .handle_command(EditorCommand::Segment { points })
            .await;
        assert!(drain(&mut events).contains(&"mask_ready"));
    }

    #[tokio::test]
    async fn test_queries() {
        let (orchestrator, _, _) = orchestrator_with(EngineScript::default());
        assert_eq!(orchestrator.provider_status(), ProviderState::Idle);
        assert!(orchestrator.models_cached().await);
        let info = orchestrator.model_download_info().await;
        assert_eq!(info.total_expected_bytes, 96);
        assert!(info.cached.is_some());
    }
}
