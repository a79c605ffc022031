//! End-to-end scenarios through the public provider and orchestrator APIs,
//! driven by scripted fakes at the engine and editor seams.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use samkit::config::EngineConfig;
use samkit::engine::PromptPoint;
use samkit::orchestrator::Orchestrator;
use samkit::protocol::{EditorCommand, SamEvent};
use samkit::provider::{
    ProviderError, ProviderState, SegmentationProvider, SegmentationRequest,
};
use samkit::store::LoadProgress;
use samkit::test_utils::{
    EngineScript, FakeRenderer, MemoryFetcher, RecordedDecode, RecordingSink, plane_logits,
    scripted_factory, white_frame,
};
use tokio::sync::mpsc;

fn provider_with(
    fetcher: Arc<MemoryFetcher>,
    script: EngineScript,
) -> (
    Arc<SegmentationProvider>,
    Arc<Mutex<Vec<RecordedDecode>>>,
) {
    let (factory, recorded) = scripted_factory(script);
    let provider = Arc::new(SegmentationProvider::with_engine_factory(
        fetcher,
        EngineConfig::default(),
        factory,
    ));
    (provider, recorded)
}

fn request(width: u32, height: u32, points: Vec<PromptPoint>) -> SegmentationRequest {
    SegmentationRequest {
        rgba: white_frame(width, height),
        width,
        height,
        points,
        threshold: None,
    }
}

/// S1: cold start with nothing cached, then one foreground point on a
/// 640x360 white frame.
#[tokio::test]
async fn cold_start_single_foreground_point() {
    let fetcher = MemoryFetcher::instant(false);
    let (provider, _) = provider_with(Arc::clone(&fetcher), EngineScript::default());
    assert!(!provider.models_cached().await);

    let progress: Arc<Mutex<Vec<LoadProgress>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&progress);
    provider.set_progress_handler(Arc::new(move |p| sink.lock().unwrap().push(p)));

    provider.initialize().await.unwrap();

    {
        let events = progress.lock().unwrap();
        assert!(!events.is_empty());
        assert!(events.windows(2).all(|w| w[0].loaded <= w[1].loaded));
        let last = events.last().unwrap();
        assert_eq!(last.loaded, last.total);
    }

    provider.start_new_session().await;
    let output = provider
        .segment_single_view(request(
            640,
            360,
            vec![PromptPoint::foreground(320.0, 180.0)],
        ))
        .await
        .unwrap();

    assert_eq!(output.width, 640);
    assert_eq!(output.height, 360);
    assert_eq!(output.mask.len(), 230_400);
    assert!((3..=4).contains(&output.all_masks.len()));
    assert!(output.selected_mask_index < output.all_masks.len());
    assert!(output.mask.iter().all(|&b| b == 0 || b == 255));
    assert_eq!(
        output.mask,
        output.all_masks[output.selected_mask_index].mask
    );
}

/// S2: cached start; the second round must feed round one's selected logits
/// as the decoder mask input.
#[tokio::test]
async fn cached_start_iterative_refinement() {
    let (provider, recorded) =
        provider_with(MemoryFetcher::instant(true), EngineScript::default());
    assert!(provider.models_cached().await);

    provider.initialize().await.unwrap();
    provider.start_new_session().await;

    let first = provider
        .segment_single_view(request(64, 64, vec![PromptPoint::foreground(200.0, 200.0)]))
        .await
        .unwrap();

    provider
        .segment_single_view(request(
            64,
            64,
            vec![
                PromptPoint::foreground(200.0, 200.0),
                PromptPoint::foreground(210.0, 210.0),
            ],
        ))
        .await
        .unwrap();

    let recorded = recorded.lock().unwrap();
    assert_eq!(recorded.len(), 2);
    assert!(recorded[0].previous_logits.is_none());
    assert_eq!(recorded[1].point_count, 2);
    // has_mask_input = 1.0 with exactly the previous selection's logits
    assert_eq!(
        recorded[1].previous_logits.as_deref(),
        Some(first.logits.as_slice())
    );
}

/// S3: aborting a slow model load rejects initialize; a later initialize
/// succeeds.
#[tokio::test]
async fn abort_cancels_slow_load_then_recovers() {
    let (provider, _) = provider_with(
        MemoryFetcher::slow(Duration::from_millis(25)),
        EngineScript::default(),
    );

    let initializing = {
        let provider = Arc::clone(&provider);
        tokio::spawn(async move { provider.initialize().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    provider.abort();

    assert!(matches!(
        initializing.await.unwrap(),
        Err(ProviderError::Aborted)
    ));

    provider.initialize().await.unwrap();
    assert_eq!(provider.state(), ProviderState::Ready);
}

/// S4: after the UI overrides the ranked default, the next round refines
/// from the overridden candidate's logits.
#[tokio::test]
async fn candidate_override_feeds_next_round() {
    let (provider, recorded) = provider_with(
        MemoryFetcher::instant(true),
        EngineScript {
            iou_scores: vec![0.7, 0.9, 0.8],
            ..EngineScript::default()
        },
    );
    provider.initialize().await.unwrap();
    provider.start_new_session().await;

    let output = provider
        .segment_single_view(request(32, 32, vec![PromptPoint::foreground(16.0, 16.0)]))
        .await
        .unwrap();
    assert_eq!(output.selected_mask_index, 1);

    provider.select_candidate(2).await.unwrap();
    provider
        .segment_single_view(request(32, 32, vec![PromptPoint::foreground(16.0, 16.0)]))
        .await
        .unwrap();

    let recorded = recorded.lock().unwrap();
    assert_eq!(
        recorded[1].previous_logits.as_deref(),
        Some(plane_logits(2).as_slice())
    );
}

/// Degenerate exports: one candidate still yields a singleton list with
/// index 0 selected.
#[tokio::test]
async fn single_candidate_model() {
    let (provider, _) = provider_with(
        MemoryFetcher::instant(true),
        EngineScript {
            iou_scores: vec![0.5],
            ..EngineScript::default()
        },
    );
    provider.initialize().await.unwrap();
    provider.start_new_session().await;

    let output = provider
        .segment_single_view(request(16, 16, vec![PromptPoint::foreground(8.0, 8.0)]))
        .await
        .unwrap();
    assert_eq!(output.all_masks.len(), 1);
    assert_eq!(output.selected_mask_index, 0);
}

/// Out-of-frame points are forwarded, not clamped, and still segment.
#[tokio::test]
async fn out_of_frame_points_are_forwarded() {
    let (provider, recorded) =
        provider_with(MemoryFetcher::instant(true), EngineScript::default());
    provider.initialize().await.unwrap();
    provider.start_new_session().await;

    provider
        .segment_single_view(request(
            32,
            32,
            vec![
                PromptPoint::foreground(-5.0, 40.0),
                PromptPoint::background(100.0, -2.0),
            ],
        ))
        .await
        .unwrap();
    assert_eq!(recorded.lock().unwrap()[0].point_count, 2);
}

fn orchestrator_fixture(
    script: EngineScript,
) -> (
    Arc<Orchestrator>,
    Arc<RecordingSink>,
    tokio::sync::broadcast::Receiver<SamEvent>,
) {
    let (factory, _) = scripted_factory(script);
    let provider = Arc::new(SegmentationProvider::with_engine_factory(
        MemoryFetcher::instant(true),
        EngineConfig::default(),
        factory,
    ));
    let sink = Arc::new(RecordingSink::default());
    let orchestrator = Orchestrator::new(
        provider,
        Arc::new(FakeRenderer::new(640, 360)),
        Arc::clone(&sink) as _,
    );
    let events = orchestrator.subscribe();
    (orchestrator, sink, events)
}

async fn collect_until(
    events: &mut tokio::sync::broadcast::Receiver<SamEvent>,
    terminal: &[&str],
) -> Vec<&'static str> {
    let mut names = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event stream stalled")
            .expect("event stream closed");
        let name = event.message_type();
        names.push(name);
        if terminal.contains(&name) {
            return names;
        }
    }
}

/// S5: apply fires the selection exactly once; cancel afterwards is a no-op.
#[tokio::test]
async fn apply_cancel_exclusivity_through_command_queue() {
    let (orchestrator, sink, mut events) = orchestrator_fixture(EngineScript::default());

    let (tx, rx) = mpsc::channel(16);
    let runner = tokio::spawn(Arc::clone(&orchestrator).run(rx));

    tx.send(EditorCommand::Segment {
        points: vec![PromptPoint::foreground(320.0, 180.0)],
    })
    .await
    .unwrap();
    let names = collect_until(&mut events, &["segment_complete", "segment_error"]).await;
    assert!(names.contains(&"mask_ready"));
    assert!(names.contains(&"segment_complete"));

    tx.send(EditorCommand::ApplyMask).await.unwrap();
    let names = collect_until(&mut events, &["mask_applied"]).await;
    assert_eq!(names.last(), Some(&"mask_applied"));

    {
        let applied = sink.applied.lock().unwrap();
        assert_eq!(applied.len(), 1);
        let (op, width, height) = applied[0];
        assert_eq!(op, samkit::tensor::SelectionOp::Add);
        assert_eq!((width, height), (640, 360));
    }

    // Cancel after apply: no event, no second application
    tx.send(EditorCommand::CancelMask).await.unwrap();
    tx.send(EditorCommand::ApplyMask).await.unwrap();
    drop(tx);
    runner.await.unwrap();

    assert_eq!(sink.applied.lock().unwrap().len(), 1);
    let mut trailing = Vec::new();
    while let Ok(event) = events.try_recv() {
        trailing.push(event.message_type());
    }
    assert!(!trailing.contains(&"mask_applied"));
    assert!(!trailing.contains(&"mask_cancelled"));
}

/// S6: a decoder failure surfaces as a segment error and the next attempt
/// succeeds against the same worker.
#[tokio::test]
async fn worker_isolated_failure_recovers() {
    let (orchestrator, _, mut events) = orchestrator_fixture(EngineScript {
        fail_decodes: 1,
        ..EngineScript::default()
    });
    let points = vec![PromptPoint::foreground(320.0, 180.0)];

    orchestrator
        .handle_command(EditorCommand::Segment {
            points: points.clone(),
        })
        .await;
    let names = collect_until(&mut events, &["segment_complete", "segment_error"]).await;
    assert!(names.contains(&"segment_error"));

    orchestrator
        .handle_command(EditorCommand::Segment { points })
        .await;
    let names = collect_until(&mut events, &["segment_complete", "segment_error"]).await;
    assert!(names.contains(&"segment_complete"));
}

/// Capture then segment: the pre-encode makes the segment's encode free.
#[tokio::test]
async fn capture_preview_then_segment() {
    let (orchestrator, _, mut events) = orchestrator_fixture(EngineScript::default());

    orchestrator
        .handle_command(EditorCommand::InitializeProvider)
        .await;
    collect_until(&mut events, &["provider_ready", "init_error"]).await;

    orchestrator
        .handle_command(EditorCommand::CapturePreview)
        .await;
    let names = collect_until(&mut events, &["encoding_complete", "encoding_error"]).await;
    assert_eq!(
        names,
        vec!["image_captured", "encoding_start", "encoding_complete"]
    );

    orchestrator
        .handle_command(EditorCommand::Segment {
            points: vec![PromptPoint::foreground(100.0, 100.0)],
        })
        .await;
    let names = collect_until(&mut events, &["segment_complete", "segment_error"]).await;
    assert!(names.contains(&"mask_ready"));
}
