//! `VigilEngine`: top-level lifecycle controller and consumer API.
//!
//! ## Lifecycle
//!
//! ```text
//! VigilEngine::new()
//!     └─► warm_up()          → classifier prepared
//!         └─► start()        → producers + coordinator spawned, status = Running
//!             └─► stop()     → drained, current activity closed, status = Stopped
//! ```
//!
//! `start()`/`stop()` return `AlreadyRunning`/`NotRunning` when called in the
//! wrong state rather than panicking. A stopped engine may be started again.
//!
//! ## Consumer operations
//!
//! - `current_activity()`: snapshot of the current state
//! - `history(from, to)`: closed records overlapping a time range
//! - `force_classification()`: classify now, ahead of queued work
//! - `status()` / `status_report()`: engine, connectivity and sink health
//!
//! ## Threading
//!
//! Capture sessions may be `!Send` (cpal streams). Each producer therefore
//! builds its `StreamAdapter` inside its own `spawn_blocking` closure and the
//! session never crosses a thread boundary.

pub mod config;
pub mod journal;
pub mod pipeline;

pub use config::EngineConfig;
pub use journal::{ErrorJournal, Incident, IncidentKind};
pub use pipeline::{DiagnosticsSnapshot, PipelineDiagnostics};

use std::collections::BTreeMap;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{
    buffering::{chunk::StreamKind, chunk_channel},
    capture::{CaptureSources, ConnectivityMonitor},
    classifier::{ClassifierHandle, ClassifierWorker},
    clock::{duration_ns, PipelineClock},
    error::{Result, VigilError},
    history::{summarize, ActivityHistory, ActivityStats, HistoryStore, Period},
    ipc::events::{
        ActivityEvent, ActivityRecord, ActivityState, Classification, ConnectivityEvent,
        EngineStatus, EngineStatusEvent,
    },
};

use pipeline::{ManualReply, PipelineContext, ProducerContext};

/// Broadcast channel capacity: 256 events buffered for slow consumers.
const BROADCAST_CAP: usize = 256;

/// Serde helpers storing a `Duration` as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis().min(u64::MAX as u128) as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Point-in-time view of engine health for a status read.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: EngineStatus,
    pub detail: Option<String>,
    pub current: Option<ActivityState>,
    pub connectivity: Vec<ConnectivityEvent>,
    pub pending_records: usize,
    pub sink_degraded: bool,
    pub diagnostics: DiagnosticsSnapshot,
    pub incidents: BTreeMap<IncidentKind, u64>,
}

struct Control {
    manual_tx: crossbeam_channel::Sender<ManualReply>,
    tasks: Vec<JoinHandle<()>>,
}

/// The top-level engine handle.
///
/// `VigilEngine` is `Send + Sync`; all fields use interior mutability.
/// Wrap in `Arc<VigilEngine>` to share with console and forwarding tasks.
pub struct VigilEngine {
    config: EngineConfig,
    sources: CaptureSources,
    classifier: ClassifierHandle,
    history: Arc<ActivityHistory>,
    clock: PipelineClock,
    warmed: AtomicBool,
    /// `true` while producers and the coordinator are active.
    running: Arc<AtomicBool>,
    status: Arc<Mutex<EngineStatusEvent>>,
    activity_tx: broadcast::Sender<ActivityEvent>,
    status_tx: broadcast::Sender<EngineStatusEvent>,
    connectivity: ConnectivityMonitor,
    /// Monotonically increasing activity event sequence counter.
    seq: Arc<AtomicU64>,
    diagnostics: Arc<PipelineDiagnostics>,
    journal: Arc<ErrorJournal>,
    control: Mutex<Option<Control>>,
}

impl VigilEngine {
    /// Create a new engine. Does not start capturing; call `start()`.
    ///
    /// # Errors
    /// `VigilError::Config` if `config` fails validation.
    pub fn new(
        config: EngineConfig,
        sources: CaptureSources,
        classifier: ClassifierHandle,
        store: Arc<dyn HistoryStore>,
    ) -> Result<Self> {
        config.validate()?;
        let (activity_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (connectivity_tx, _) = broadcast::channel(BROADCAST_CAP);
        let history = Arc::new(ActivityHistory::new(store, config.history_retry()));
        let journal = Arc::new(ErrorJournal::new(config.journal_capacity));

        Ok(Self {
            config,
            sources,
            classifier,
            history,
            clock: PipelineClock::new(),
            warmed: AtomicBool::new(false),
            running: Arc::new(AtomicBool::new(false)),
            status: Arc::new(Mutex::new(EngineStatusEvent {
                status: EngineStatus::Idle,
                detail: None,
            })),
            activity_tx,
            status_tx,
            connectivity: ConnectivityMonitor::new(connectivity_tx),
            seq: Arc::new(AtomicU64::new(0)),
            diagnostics: Arc::new(PipelineDiagnostics::default()),
            journal,
            control: Mutex::new(None),
        })
    }

    /// Prepare the classifier. `start()` calls this if it has not run yet.
    pub fn warm_up(&self) -> Result<()> {
        if self.warmed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let name = self.classifier.name();
        info!(classifier = %name, "warming up classifier");
        self.classifier.0.lock().warm_up()?;
        self.warmed.store(true, Ordering::SeqCst);
        info!(classifier = %name, "classifier ready");
        Ok(())
    }

    /// Spawn the producers and the coordinator.
    ///
    /// Must be called from within a Tokio runtime. Capture sources are not
    /// contacted here: an unreachable source is retried in the background
    /// and reported through `subscribe_connectivity()`.
    ///
    /// # Errors
    /// - `VigilError::AlreadyRunning` if already started.
    /// - `VigilError::UnsupportedStream` if a source cannot produce its stream.
    /// - Classifier warm-up or worker spawn failures.
    pub fn start(&self) -> Result<()> {
        let mut control = self.control.lock();
        if control.is_some() {
            return Err(VigilError::AlreadyRunning);
        }
        for stream in StreamKind::ALL {
            if !self.sources.get(stream).supports(stream) {
                return Err(VigilError::UnsupportedStream(stream));
            }
        }

        if let Err(e) = self.warm_up() {
            self.set_status(EngineStatus::Error, Some(e.to_string()));
            return Err(e);
        }
        if let Some(last_end) = self.history.resume() {
            info!(last_end, "history resumed");
        }
        let worker = ClassifierWorker::spawn(
            self.classifier.clone(),
            self.config.labels.clone(),
            self.config.classifier_timeout,
        )?;

        self.diagnostics.reset();
        self.running.store(true, Ordering::SeqCst);
        self.set_status(EngineStatus::Running, None);

        let (audio_tx, audio_rx) = chunk_channel(self.config.chunk_channel_capacity);
        let (video_tx, video_rx) = chunk_channel(self.config.chunk_channel_capacity);
        let (manual_tx, manual_rx) = crossbeam_channel::unbounded::<ManualReply>();

        let mut tasks = Vec::with_capacity(3);
        for (stream, tx) in [(StreamKind::Audio, audio_tx), (StreamKind::Video, video_tx)] {
            let ctx = ProducerContext {
                stream,
                source: self.sources.get(stream),
                clock: self.clock,
                reconnect: self.config.reconnect,
                max_wait: self.config.capture_max_wait,
                tx,
                running: Arc::clone(&self.running),
                monitor: self.connectivity.clone(),
                diagnostics: Arc::clone(&self.diagnostics),
                journal: Arc::clone(&self.journal),
            };
            tasks.push(tokio::task::spawn_blocking(move || pipeline::run_producer(ctx)));
        }

        let ctx = PipelineContext {
            config: self.config.clone(),
            clock: self.clock,
            worker,
            audio_rx,
            video_rx,
            manual_rx,
            running: Arc::clone(&self.running),
            history: Arc::clone(&self.history),
            activity_tx: self.activity_tx.clone(),
            status_tx: self.status_tx.clone(),
            status: Arc::clone(&self.status),
            seq: Arc::clone(&self.seq),
            diagnostics: Arc::clone(&self.diagnostics),
            journal: Arc::clone(&self.journal),
        };
        tasks.push(tokio::task::spawn_blocking(move || pipeline::run(ctx)));

        *control = Some(Control { manual_tx, tasks });
        info!(
            audio = self.sources.audio.name(),
            video = self.sources.video.name(),
            "engine started"
        );
        Ok(())
    }

    /// Stop capture, drain the in-flight classification (bounded by the
    /// shutdown grace), close the current activity and flush history.
    ///
    /// # Errors
    /// `VigilError::NotRunning` if not currently running.
    pub async fn stop(&self) -> Result<()> {
        let control = self.control.lock().take().ok_or(VigilError::NotRunning)?;
        self.running.store(false, Ordering::SeqCst);
        info!("engine stop requested");

        let Control { manual_tx, tasks } = control;
        drop(manual_tx);
        for task in tasks {
            if let Err(e) = task.await {
                warn!("pipeline task ended abnormally: {e}");
            }
        }
        self.set_status(EngineStatus::Stopped, None);
        info!("engine stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Snapshot of the current activity. `None` before the first start and after stop.
    pub fn current_activity(&self) -> Option<ActivityState> {
        self.history.current()
    }

    /// Closed activity records overlapping `[from, to)` (ns since the UNIX epoch).
    ///
    /// # Errors
    /// `VigilError::Config` if `from > to`; store read failures.
    pub fn history(&self, from: u64, to: u64) -> Result<Vec<ActivityRecord>> {
        if from > to {
            return Err(VigilError::Config(format!(
                "invalid history range: from {from} is after to {to}"
            )));
        }
        self.history.query(from, to)
    }

    /// Closed records overlapping the last `window`.
    pub fn recent_history(&self, window: Duration) -> Result<Vec<ActivityRecord>> {
        let now = self.clock.now_ns();
        self.history(now.saturating_sub(duration_ns(window)), now.saturating_add(1))
    }

    /// Classify the newest available sample now, ahead of queued automatic work.
    ///
    /// # Errors
    /// - `VigilError::NotRunning` if the engine is not running or stops meanwhile.
    /// - `VigilError::NoSampleAvailable` if nothing has been captured yet.
    /// - `VigilError::ClassifierTimeout` / `VigilError::Classifier` on scorer failure.
    pub async fn force_classification(&self) -> Result<Classification> {
        let manual_tx = self
            .control
            .lock()
            .as_ref()
            .map(|c| c.manual_tx.clone())
            .ok_or(VigilError::NotRunning)?;
        let (tx, rx) = oneshot::channel();
        manual_tx.send(tx).map_err(|_| VigilError::NotRunning)?;
        rx.await.map_err(|_| VigilError::NotRunning)?
    }

    /// Per-label totals over the trailing `period`.
    pub fn stats(&self, period: Period) -> Result<ActivityStats> {
        let to = self.clock.now_ns();
        let from = to.saturating_sub(duration_ns(period.duration()));
        let records = self.history(from, to)?;
        Ok(summarize(&records, from, to))
    }

    /// Current engine status (snapshot).
    pub fn status(&self) -> EngineStatus {
        self.status.lock().status
    }

    pub fn status_report(&self) -> StatusReport {
        let status = self.status.lock().clone();
        StatusReport {
            status: status.status,
            detail: status.detail,
            current: self.current_activity(),
            connectivity: self.connectivity.snapshot(),
            pending_records: self.history.pending(),
            sink_degraded: self.history.is_degraded(),
            diagnostics: self.diagnostics.snapshot(),
            incidents: self.journal.counts(),
        }
    }

    /// Most recent incidents, newest first.
    pub fn recent_errors(&self, limit: usize, kind: Option<IncidentKind>) -> Vec<Incident> {
        self.journal.recent(limit, kind)
    }

    /// Subscribe to activity transitions.
    pub fn subscribe_activity(&self) -> broadcast::Receiver<ActivityEvent> {
        self.activity_tx.subscribe()
    }

    /// Subscribe to live status change events.
    pub fn subscribe_status(&self) -> broadcast::Receiver<EngineStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Subscribe to per-stream connectivity changes.
    pub fn subscribe_connectivity(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.connectivity.subscribe()
    }

    /// Snapshot of pipeline counters for observability.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Zero every counter and clear the error journal.
    pub fn reset_diagnostics(&self) {
        self.diagnostics.reset();
        self.journal.clear();
    }

    pub fn clock(&self) -> PipelineClock {
        self.clock
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn set_status(&self, new_status: EngineStatus, detail: Option<String>) {
        pipeline::set_status(&self.status, &self.status_tx, new_status, detail);
    }
}

impl Drop for VigilEngine {
    fn drop(&mut self) {
        // Producers and the coordinator exit on their next poll.
        self.running.store(false, Ordering::SeqCst);
    }
}
