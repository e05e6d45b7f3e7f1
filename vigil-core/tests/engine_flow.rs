use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use vigil_core::capture::{BackoffPolicy, SyntheticConfig, SyntheticSource};
use vigil_core::features::FeatureVector;
use vigil_core::{
    ActivityClassifier, ActivityEvent, ActivityLabel, CaptureSources, Classification,
    ClassifierHandle, EngineConfig, EngineStatus, InMemoryStore, IncidentKind, LabelSet, Period,
    TransitionCause, VigilEngine, VigilError,
};

/// Returns whatever label the test currently points it at.
struct ScriptedClassifier {
    label: Arc<Mutex<ActivityLabel>>,
    confidence: f32,
}

impl ActivityClassifier for ScriptedClassifier {
    fn name(&self) -> &str {
        "scripted"
    }

    fn classify(
        &mut self,
        features: &FeatureVector,
        labels: &LabelSet,
        _timeout: Duration,
    ) -> vigil_core::Result<Classification> {
        let label = self.label.lock().clone();
        Ok(Classification::with_uniform_remainder(
            features.timestamp,
            label,
            self.confidence,
            &labels.labels,
        ))
    }
}

struct Fixture {
    engine: Arc<VigilEngine>,
    store: Arc<InMemoryStore>,
    label: Arc<Mutex<ActivityLabel>>,
    source: SyntheticSource,
}

fn fixture(synthetic: SyntheticConfig) -> Fixture {
    let mut config = EngineConfig::default();
    config.features.video_width = 4;
    config.features.video_height = 4;
    config.skew_max = Duration::from_millis(30);
    config.tick = Duration::from_millis(10);
    config.reconnect = BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(40), 2.0);

    let source = SyntheticSource::new(SyntheticConfig {
        width: 4,
        height: 4,
        audio_chunk: Duration::from_millis(20),
        frame_interval: Duration::from_millis(20),
        ..synthetic
    });
    let label = Arc::new(Mutex::new(ActivityLabel::from("video")));
    let store = Arc::new(InMemoryStore::new());
    let engine = VigilEngine::new(
        config,
        CaptureSources::shared(Arc::new(source.clone())),
        ClassifierHandle::new(ScriptedClassifier {
            label: Arc::clone(&label),
            confidence: 0.95,
        }),
        store.clone(),
    )
    .expect("valid config");
    Fixture {
        engine: Arc::new(engine),
        store,
        label,
        source,
    }
}

fn wait_for_transition_to(
    rx: &mut broadcast::Receiver<ActivityEvent>,
    label: &str,
    timeout: Duration,
) -> ActivityEvent {
    let start = Instant::now();
    loop {
        match rx.try_recv() {
            Ok(ev) => {
                let matches = ev
                    .current
                    .as_ref()
                    .is_some_and(|state| state.label.as_str() == label);
                if matches {
                    return ev;
                }
            }
            Err(TryRecvError::Empty) => {
                if start.elapsed() >= timeout {
                    panic!("timed out waiting for transition to {label}");
                }
                thread::sleep(Duration::from_millis(5));
            }
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Closed) => panic!("activity channel closed unexpectedly"),
        }
    }
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    check()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transitions_are_published_and_history_is_ordered() {
    let fx = fixture(SyntheticConfig::default());
    let mut rx = fx.engine.subscribe_activity();
    fx.engine.start().unwrap();

    let ev = wait_for_transition_to(&mut rx, "video", Duration::from_secs(3));
    assert_eq!(ev.cause, TransitionCause::HighConfidence);
    assert_eq!(
        fx.engine.current_activity().map(|s| s.label),
        Some(ActivityLabel::from("video"))
    );

    *fx.label.lock() = ActivityLabel::from("reading");
    let ev = wait_for_transition_to(&mut rx, "reading", Duration::from_secs(3));
    let closed = ev.closed.expect("video interval closed");
    assert_eq!(closed.label.as_str(), "video");
    assert!(closed.sample_count >= 1);

    fx.engine.stop().await.unwrap();
    assert_eq!(fx.engine.status(), EngineStatus::Stopped);

    let history = fx.engine.history(0, u64::MAX).unwrap();
    let labels: Vec<&str> = history.iter().map(|r| r.label.as_str()).collect();
    assert!(labels.contains(&"video"), "history: {labels:?}");
    assert_eq!(labels.last(), Some(&"reading"));
    for pair in history.windows(2) {
        assert!(pair[0].started_at <= pair[0].ended_at);
        assert!(pair[0].ended_at <= pair[1].started_at);
    }
    assert_eq!(fx.store.len(), history.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forced_classification_returns_classifier_label() {
    let fx = fixture(SyntheticConfig::default());
    *fx.label.lock() = ActivityLabel::from("browsing");
    fx.engine.start().unwrap();

    let start = Instant::now();
    let classification = loop {
        match fx.engine.force_classification().await {
            Ok(c) => break c,
            Err(VigilError::NoSampleAvailable) if start.elapsed() < Duration::from_secs(3) => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => panic!("forced classification failed: {e}"),
        }
    };
    assert_eq!(classification.label.as_str(), "browsing");
    assert!(classification.confidence > 0.9);

    let current = fx.engine.current_activity().expect("running engine has a state");
    assert_eq!(current.label.as_str(), "browsing");
    assert!(fx.engine.diagnostics_snapshot().manual_requests >= 1);

    fx.engine.stop().await.unwrap();
    assert!(matches!(
        fx.engine.force_classification().await,
        Err(VigilError::NotRunning)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn capture_failures_are_retried_and_journaled() {
    let fx = fixture(SyntheticConfig {
        fail_first_connects: 2,
        disconnect_after: Some(20),
        ..SyntheticConfig::default()
    });
    let mut rx = fx.engine.subscribe_activity();
    fx.engine.start().unwrap();

    wait_for_transition_to(&mut rx, "video", Duration::from_secs(3));
    let engine = Arc::clone(&fx.engine);
    assert!(wait_until(Duration::from_secs(3), || {
        engine.diagnostics_snapshot().capture_disconnects >= 1
    }));

    let diagnostics = fx.engine.diagnostics_snapshot();
    assert!(diagnostics.capture_connect_failures >= 2);
    assert!(fx.source.connect_attempts() >= 4);
    assert!(!fx
        .engine
        .recent_errors(10, Some(IncidentKind::CaptureUnavailable))
        .is_empty());

    fx.engine.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_report_and_stats_reflect_activity() {
    let fx = fixture(SyntheticConfig::default());
    let mut rx = fx.engine.subscribe_activity();
    fx.engine.start().unwrap();
    wait_for_transition_to(&mut rx, "video", Duration::from_secs(3));

    let report = serde_json::to_value(fx.engine.status_report()).unwrap();
    assert_eq!(report["status"], "running");
    assert_eq!(report["current"]["label"], "video");
    assert_eq!(report["sinkDegraded"], false);
    assert!(report["diagnostics"]["samplesPaired"].as_u64().unwrap() >= 1);

    *fx.label.lock() = ActivityLabel::from("idle");
    wait_for_transition_to(&mut rx, "idle", Duration::from_secs(3));

    let stats = fx.engine.stats(Period::Day).unwrap();
    assert!(stats.labels.contains_key(&ActivityLabel::from("video")));
    assert!(stats.total_records >= 1);

    fx.engine.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopped_engine_can_be_restarted() {
    let fx = fixture(SyntheticConfig::default());
    for round in 0..2 {
        let mut rx = fx.engine.subscribe_activity();
        fx.engine.start().unwrap();
        wait_for_transition_to(&mut rx, "video", Duration::from_secs(3));
        fx.engine.stop().await.unwrap();
        assert!(fx.engine.current_activity().is_none(), "round {round}");
    }

    let history = fx.engine.history(0, u64::MAX).unwrap();
    for pair in history.windows(2) {
        assert!(pair[0].ended_at <= pair[1].started_at);
    }
}
