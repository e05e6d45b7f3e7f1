//! Blocking coordinator and producer loops.
//!
//! ## Coordinator (one `spawn_blocking` task)
//!
//! ```text
//! loop:
//!   1. Drain manual requests (they outrank queued automatic work)
//!   2. Dispatch: manual → newest unclassified vector; else pending slot
//!   3. select! on worker replies, manual requests, audio/video chunks, tick
//!      chunk  → Synchronizer → FeatureExtractor → LatestSlot (depth 1)
//!      reply  → StabilityEngine → ActivityEvent + ActivityHistory
//!   4. Housekeeping: classifier timeout, stall check, sink retry, idle flush
//! ```
//!
//! ## Producers (one `spawn_blocking` task per stream)
//!
//! Each owns a `StreamAdapter` and pushes chunks into a drop-oldest channel,
//! so a slow coordinator never blocks capture.
//!
//! Per-sample failures are absorbed here: counted in `PipelineDiagnostics`,
//! recorded in the `ErrorJournal`, and logged. Nothing in these loops returns
//! an error to the caller.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use crossbeam_channel::{never, select, Receiver};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};

use crate::{
    buffering::{
        chunk::{RawChunk, Sample, StreamKind},
        ChunkReceiver, ChunkSender, LatestSlot,
    },
    capture::{AdapterRead, BackoffPolicy, CaptureSource, ConnectivityMonitor, StreamAdapter},
    classifier::{ClassifierWorker, Completion, Origin, Outcome},
    clock::PipelineClock,
    engine::journal::{ErrorJournal, IncidentKind},
    engine::EngineConfig,
    error::{Result, VigilError},
    features::{FeatureExtractor, FeatureVector},
    history::{ActivityHistory, FlushReport},
    ipc::events::{
        ActivityEvent, ActivityRecord, ActivityState, Classification, EngineStatus,
        EngineStatusEvent, TransitionCause,
    },
    stability::{Applied, StabilityEngine, Transition},
    sync::{SyncStats, Synchronizer},
};

/// Reply channel for one "classify now" request.
pub type ManualReply = oneshot::Sender<Result<Classification>>;

#[derive(Default)]
pub struct PipelineDiagnostics {
    pub audio_chunks: AtomicU64,
    pub video_chunks: AtomicU64,
    pub chunks_evicted: AtomicU64,
    pub capture_connect_failures: AtomicU64,
    pub capture_disconnects: AtomicU64,
    pub samples_paired: AtomicU64,
    pub pairing_dropped: AtomicU64,
    pub feature_errors: AtomicU64,
    pub samples_superseded: AtomicU64,
    pub classifications_dispatched: AtomicU64,
    pub classifications_applied: AtomicU64,
    pub classifications_rejected: AtomicU64,
    pub classifier_timeouts: AtomicU64,
    pub classifier_errors: AtomicU64,
    pub late_replies_discarded: AtomicU64,
    pub manual_requests: AtomicU64,
    pub transitions: AtomicU64,
    pub stalls: AtomicU64,
    pub records_written: AtomicU64,
    pub sink_failures: AtomicU64,
}

impl PipelineDiagnostics {
    pub fn reset(&self) {
        self.audio_chunks.store(0, Ordering::Relaxed);
        self.video_chunks.store(0, Ordering::Relaxed);
        self.chunks_evicted.store(0, Ordering::Relaxed);
        self.capture_connect_failures.store(0, Ordering::Relaxed);
        self.capture_disconnects.store(0, Ordering::Relaxed);
        self.samples_paired.store(0, Ordering::Relaxed);
        self.pairing_dropped.store(0, Ordering::Relaxed);
        self.feature_errors.store(0, Ordering::Relaxed);
        self.samples_superseded.store(0, Ordering::Relaxed);
        self.classifications_dispatched.store(0, Ordering::Relaxed);
        self.classifications_applied.store(0, Ordering::Relaxed);
        self.classifications_rejected.store(0, Ordering::Relaxed);
        self.classifier_timeouts.store(0, Ordering::Relaxed);
        self.classifier_errors.store(0, Ordering::Relaxed);
        self.late_replies_discarded.store(0, Ordering::Relaxed);
        self.manual_requests.store(0, Ordering::Relaxed);
        self.transitions.store(0, Ordering::Relaxed);
        self.stalls.store(0, Ordering::Relaxed);
        self.records_written.store(0, Ordering::Relaxed);
        self.sink_failures.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            audio_chunks: self.audio_chunks.load(Ordering::Relaxed),
            video_chunks: self.video_chunks.load(Ordering::Relaxed),
            chunks_evicted: self.chunks_evicted.load(Ordering::Relaxed),
            capture_connect_failures: self.capture_connect_failures.load(Ordering::Relaxed),
            capture_disconnects: self.capture_disconnects.load(Ordering::Relaxed),
            samples_paired: self.samples_paired.load(Ordering::Relaxed),
            pairing_dropped: self.pairing_dropped.load(Ordering::Relaxed),
            feature_errors: self.feature_errors.load(Ordering::Relaxed),
            samples_superseded: self.samples_superseded.load(Ordering::Relaxed),
            classifications_dispatched: self.classifications_dispatched.load(Ordering::Relaxed),
            classifications_applied: self.classifications_applied.load(Ordering::Relaxed),
            classifications_rejected: self.classifications_rejected.load(Ordering::Relaxed),
            classifier_timeouts: self.classifier_timeouts.load(Ordering::Relaxed),
            classifier_errors: self.classifier_errors.load(Ordering::Relaxed),
            late_replies_discarded: self.late_replies_discarded.load(Ordering::Relaxed),
            manual_requests: self.manual_requests.load(Ordering::Relaxed),
            transitions: self.transitions.load(Ordering::Relaxed),
            stalls: self.stalls.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64, by: u64) {
        if by > 0 {
            counter.fetch_add(by, Ordering::Relaxed);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub audio_chunks: u64,
    pub video_chunks: u64,
    pub chunks_evicted: u64,
    pub capture_connect_failures: u64,
    pub capture_disconnects: u64,
    pub samples_paired: u64,
    pub pairing_dropped: u64,
    pub feature_errors: u64,
    pub samples_superseded: u64,
    pub classifications_dispatched: u64,
    pub classifications_applied: u64,
    pub classifications_rejected: u64,
    pub classifier_timeouts: u64,
    pub classifier_errors: u64,
    pub late_replies_discarded: u64,
    pub manual_requests: u64,
    pub transitions: u64,
    pub stalls: u64,
    pub records_written: u64,
    pub sink_failures: u64,
}

/// Everything the coordinator needs, passed as one struct so the closure stays tidy.
pub struct PipelineContext {
    pub config: EngineConfig,
    pub clock: PipelineClock,
    pub worker: ClassifierWorker,
    pub audio_rx: ChunkReceiver,
    pub video_rx: ChunkReceiver,
    pub manual_rx: Receiver<ManualReply>,
    pub running: Arc<AtomicBool>,
    pub history: Arc<ActivityHistory>,
    pub activity_tx: broadcast::Sender<ActivityEvent>,
    pub status_tx: broadcast::Sender<EngineStatusEvent>,
    pub status: Arc<Mutex<EngineStatusEvent>>,
    pub seq: Arc<AtomicU64>,
    pub diagnostics: Arc<PipelineDiagnostics>,
    pub journal: Arc<ErrorJournal>,
}

/// Update the shared status and broadcast it if anything changed.
pub(crate) fn set_status(
    cell: &Mutex<EngineStatusEvent>,
    tx: &broadcast::Sender<EngineStatusEvent>,
    status: EngineStatus,
    detail: Option<String>,
) {
    let mut current = cell.lock();
    if current.status == status && current.detail == detail {
        return;
    }
    current.status = status;
    current.detail = detail;
    let _ = tx.send(current.clone());
}

/// Run the coordinator until `ctx.running` becomes false, then drain and close.
pub fn run(ctx: PipelineContext) {
    info!("coordinator started");

    let mut results_rx = ctx.worker.results().clone();
    let mut manual = ctx.manual_rx.clone();
    let mut audio_rx = ctx.audio_rx.clone();
    let mut video_rx = ctx.video_rx.clone();

    let mut co = Coordinator::new(ctx);
    co.ctx.history.set_current(Some(co.stability.current().clone()));

    loop {
        if !co.ctx.running.load(Ordering::Relaxed) {
            break;
        }

        while let Ok(reply) = manual.try_recv() {
            co.on_manual(reply);
        }
        co.try_dispatch();

        let wait = co.next_wait();
        let mut closed: Option<Input> = None;
        select! {
            recv(results_rx) -> msg => match msg {
                Ok(outcome) => co.on_outcome(outcome),
                Err(_) => closed = Some(Input::Results),
            },
            recv(manual) -> msg => match msg {
                Ok(reply) => co.on_manual(reply),
                Err(_) => closed = Some(Input::Manual),
            },
            recv(audio_rx) -> msg => match msg {
                Ok(chunk) => co.on_chunk(chunk),
                Err(_) => closed = Some(Input::Stream(StreamKind::Audio)),
            },
            recv(video_rx) -> msg => match msg {
                Ok(chunk) => co.on_chunk(chunk),
                Err(_) => closed = Some(Input::Stream(StreamKind::Video)),
            },
            default(wait) => {}
        }

        match closed {
            Some(Input::Results) => {
                error!("classifier worker exited unexpectedly");
                results_rx = never();
            }
            Some(Input::Manual) => manual = never(),
            Some(Input::Stream(StreamKind::Audio)) => {
                debug!("audio channel closed");
                audio_rx = never();
            }
            Some(Input::Stream(StreamKind::Video)) => {
                debug!("video channel closed");
                video_rx = never();
            }
            None => {}
        }

        co.housekeeping();
    }

    while let Ok(reply) = manual.try_recv() {
        let _ = reply.send(Err(VigilError::NotRunning));
    }
    co.shutdown();
}

enum Input {
    Results,
    Manual,
    Stream(StreamKind),
}

struct Coordinator {
    ctx: PipelineContext,
    sync: Synchronizer,
    sync_seen: SyncStats,
    extractor: FeatureExtractor,
    stability: StabilityEngine,
    pending: LatestSlot<FeatureVector>,
    last_vector: Option<FeatureVector>,
    waiting_manual: Vec<(ManualReply, Instant)>,
    in_flight_manual: Vec<ManualReply>,
    last_chunk_at: Instant,
    idle_flush_after: Duration,
}

impl Coordinator {
    fn new(ctx: PipelineContext) -> Self {
        let sync = Synchronizer::new(ctx.config.sync_config());
        let extractor = FeatureExtractor::new(ctx.config.features.clone());
        let stability = StabilityEngine::new(
            ctx.config.stability_config(),
            ctx.config.labels.clone(),
            ctx.clock.now_ns(),
        );
        let idle_flush_after = ctx.config.skew_max.saturating_mul(4).max(ctx.config.tick);
        Self {
            ctx,
            sync,
            sync_seen: SyncStats::default(),
            extractor,
            stability,
            pending: LatestSlot::new(),
            last_vector: None,
            waiting_manual: Vec::new(),
            in_flight_manual: Vec::new(),
            last_chunk_at: Instant::now(),
            idle_flush_after,
        }
    }

    fn next_wait(&self) -> Duration {
        let tick = self.ctx.config.tick;
        self.ctx
            .worker
            .until_deadline(Instant::now())
            .map_or(tick, |d| d.min(tick))
    }

    // ── Inputs ───────────────────────────────────────────────────────────

    fn on_chunk(&mut self, chunk: RawChunk) {
        let counter = match chunk.stream {
            StreamKind::Audio => &self.ctx.diagnostics.audio_chunks,
            StreamKind::Video => &self.ctx.diagnostics.video_chunks,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.last_chunk_at = Instant::now();

        let samples = self.sync.push(chunk);
        self.account_sync();
        for sample in samples {
            self.on_sample(&sample);
        }
    }

    fn on_sample(&mut self, sample: &Sample) {
        match self.extractor.extract(sample) {
            Ok(vector) => {
                self.last_vector = Some(vector.clone());
                if let Some(dropped) = self.pending.put(vector) {
                    self.ctx
                        .diagnostics
                        .samples_superseded
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(ts = dropped.timestamp, "pending sample superseded");
                }
            }
            Err(e) => {
                self.ctx
                    .diagnostics
                    .feature_errors
                    .fetch_add(1, Ordering::Relaxed);
                debug!(ts = sample.timestamp, "feature extraction failed: {e}");
                self.journal(IncidentKind::FeatureError, e.to_string());
            }
        }
    }

    fn account_sync(&mut self) {
        let now = self.sync.stats();
        let seen = self.sync_seen;
        let d = &self.ctx.diagnostics;
        PipelineDiagnostics::bump(&d.samples_paired, now.paired - seen.paired);
        let dropped = (now.missed - seen.missed) + (now.late - seen.late) + (now.overflow - seen.overflow);
        if dropped > 0 {
            PipelineDiagnostics::bump(&d.pairing_dropped, dropped);
            self.journal(
                IncidentKind::PairingTimeout,
                format!("{dropped} chunk(s) dropped without a partner"),
            );
        }
        self.sync_seen = now;
    }

    fn on_manual(&mut self, reply: ManualReply) {
        self.ctx
            .diagnostics
            .manual_requests
            .fetch_add(1, Ordering::Relaxed);
        debug!(waiting = self.waiting_manual.len() + 1, "manual classification requested");
        self.waiting_manual.push((reply, Instant::now()));
    }

    fn on_outcome(&mut self, outcome: Outcome) {
        let completion = self.ctx.worker.complete(outcome);
        self.on_completion(completion);
    }

    // ── Dispatch ─────────────────────────────────────────────────────────

    fn try_dispatch(&mut self) {
        if !self.ctx.worker.is_idle() {
            return;
        }

        if !self.waiting_manual.is_empty() {
            if self.last_vector.is_none() {
                debug!("manual request with no sample available");
                for (reply, _) in self.waiting_manual.drain(..) {
                    let _ = reply.send(Err(VigilError::NoSampleAvailable));
                }
                return;
            }
            // With nothing fresh, requests wait for the next sample while
            // automatic work proceeds.
            if let Some(vector) = self.fresh_manual_vector() {
                self.dispatch_manual(vector);
                return;
            }
        }

        if let Some(vector) = self.pending.take() {
            match self.ctx.worker.dispatch(vector, Origin::Automatic) {
                Ok(job) => {
                    self.ctx
                        .diagnostics
                        .classifications_dispatched
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(job, "classification dispatched");
                }
                Err(vector) => {
                    self.pending.put(vector);
                }
            }
        }
    }

    fn dispatch_manual(&mut self, vector: FeatureVector) {
        let ts = vector.timestamp;
        match self.ctx.worker.dispatch(vector, Origin::Manual) {
            Ok(job) => {
                self.ctx
                    .diagnostics
                    .classifications_dispatched
                    .fetch_add(1, Ordering::Relaxed);
                debug!(job, ts, "manual classification dispatched");
                self.in_flight_manual
                    .extend(self.waiting_manual.drain(..).map(|(reply, _)| reply));
            }
            Err(_) => {
                warn!("classifier worker unavailable for manual request");
                for (reply, _) in self.waiting_manual.drain(..) {
                    let _ = reply.send(Err(VigilError::Classifier(
                        "classifier worker unavailable".into(),
                    )));
                }
            }
        }
    }

    /// Newest vector not yet covered by an applied classification.
    ///
    /// A stale pending vector is left for automatic dispatch.
    fn fresh_manual_vector(&mut self) -> Option<FeatureVector> {
        let last_applied = self.stability.last_timestamp();
        let is_fresh = |v: &FeatureVector| last_applied.map_or(true, |last| v.timestamp > last);
        if self.pending.peek().is_some_and(|v| is_fresh(v)) {
            return self.pending.take();
        }
        if self.pending.is_empty() {
            return self.last_vector.clone().filter(|v| is_fresh(v));
        }
        None
    }

    // ── Classifier replies ───────────────────────────────────────────────

    fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Classified {
                origin,
                classification,
                elapsed,
            } => {
                debug!(
                    label = %classification.label,
                    confidence = classification.confidence,
                    elapsed_ms = elapsed.as_millis() as u64,
                    ?origin,
                    "classification received"
                );
                let applied = self
                    .stability
                    .apply(&classification, origin, self.ctx.clock.now_ns());
                let reply = match &applied {
                    Applied::Rejected(rejection) => Err(VigilError::Classifier(format!(
                        "classification rejected: {rejection:?}"
                    ))),
                    _ => Ok(classification),
                };
                self.on_applied(applied);
                if origin == Origin::Manual {
                    self.reply_manual(reply);
                }
            }
            Completion::Failed { origin, error } => self.on_failure(origin, error),
            Completion::Discarded { elapsed } => {
                self.ctx
                    .diagnostics
                    .late_replies_discarded
                    .fetch_add(1, Ordering::Relaxed);
                debug!(elapsed_ms = elapsed.as_millis() as u64, "late classifier reply dropped");
            }
        }
    }

    fn on_failure(&mut self, origin: Origin, error: VigilError) {
        let kind = if matches!(error, VigilError::ClassifierTimeout(_)) {
            self.ctx
                .diagnostics
                .classifier_timeouts
                .fetch_add(1, Ordering::Relaxed);
            IncidentKind::ClassifierTimeout
        } else {
            self.ctx
                .diagnostics
                .classifier_errors
                .fetch_add(1, Ordering::Relaxed);
            IncidentKind::ClassifierError
        };
        warn!(?origin, "classification failed: {error}");
        self.journal(kind, error.to_string());
        if origin == Origin::Manual {
            self.reply_manual(Err(error));
        }
    }

    fn on_applied(&mut self, applied: Applied) {
        match applied {
            Applied::Refreshed => {
                self.ctx
                    .diagnostics
                    .classifications_applied
                    .fetch_add(1, Ordering::Relaxed);
                self.ctx
                    .history
                    .set_current(Some(self.stability.current().clone()));
            }
            Applied::Streak { label, count } => {
                self.ctx
                    .diagnostics
                    .classifications_applied
                    .fetch_add(1, Ordering::Relaxed);
                debug!(%label, count, "candidate streak");
            }
            Applied::Transition(transition) => {
                self.ctx
                    .diagnostics
                    .classifications_applied
                    .fetch_add(1, Ordering::Relaxed);
                self.publish(transition);
            }
            Applied::Rejected(rejection) => {
                self.ctx
                    .diagnostics
                    .classifications_rejected
                    .fetch_add(1, Ordering::Relaxed);
                warn!(?rejection, "classification rejected");
            }
        }
    }

    fn reply_manual(&mut self, result: Result<Classification>) {
        let mut replies = std::mem::take(&mut self.in_flight_manual).into_iter();
        let Some(first) = replies.next() else {
            return;
        };
        for reply in replies {
            let _ = reply.send(match &result {
                Ok(c) => Ok(c.clone()),
                Err(e) => Err(replicate(e)),
            });
        }
        let _ = first.send(result);
    }

    // ── Output ───────────────────────────────────────────────────────────

    fn publish(&mut self, transition: Transition) {
        self.ctx
            .diagnostics
            .transitions
            .fetch_add(1, Ordering::Relaxed);
        if let Some(record) = &transition.closed {
            self.persist(record.clone());
        }
        self.ctx
            .history
            .set_current(Some(transition.current.clone()));
        self.emit(transition.cause, transition.closed, Some(transition.current));
    }

    fn emit(
        &self,
        cause: TransitionCause,
        closed: Option<ActivityRecord>,
        current: Option<ActivityState>,
    ) {
        let seq = self.ctx.seq.fetch_add(1, Ordering::Relaxed);
        let sent = self
            .ctx
            .activity_tx
            .send(ActivityEvent {
                seq,
                cause,
                closed,
                current,
            })
            .is_ok();
        debug!(seq, ?cause, subscribers = sent, "activity event emitted");
    }

    fn persist(&mut self, record: ActivityRecord) {
        match self.ctx.history.append(record) {
            Ok(report) => self.on_flush(report),
            Err(e) => {
                error!("history rejected record: {e}");
                self.journal(IncidentKind::SinkWriteFailure, e.to_string());
            }
        }
    }

    fn on_flush(&mut self, report: FlushReport) {
        PipelineDiagnostics::bump(&self.ctx.diagnostics.records_written, report.written as u64);
        if report.failed {
            self.ctx
                .diagnostics
                .sink_failures
                .fetch_add(1, Ordering::Relaxed);
            let message = self
                .ctx
                .history
                .last_error()
                .unwrap_or_else(|| "history write failed".into());
            self.journal(IncidentKind::SinkWriteFailure, message);
        }
    }

    // ── Housekeeping ─────────────────────────────────────────────────────

    fn housekeeping(&mut self) {
        let now = Instant::now();

        if let Some(origin) = self.ctx.worker.check_timeout(now) {
            let timeout = self.ctx.worker.timeout();
            self.on_failure(origin, VigilError::ClassifierTimeout(timeout));
        }

        // A stuck classifier or a silent capture must not keep callers waiting forever.
        let limit = self.ctx.config.classifier_timeout;
        if self
            .waiting_manual
            .iter()
            .any(|(_, since)| now.duration_since(*since) >= limit)
        {
            let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiting_manual)
                .into_iter()
                .partition(|(_, since)| now.duration_since(*since) >= limit);
            self.waiting_manual = kept;
            let busy = !self.ctx.worker.is_idle();
            for (reply, _) in expired {
                let error = if busy {
                    VigilError::ClassifierTimeout(limit)
                } else {
                    VigilError::NoSampleAvailable
                };
                let _ = reply.send(Err(error));
            }
        }

        let was_stalled = self.stability.is_stalled();
        let stall = self.stability.check_stall(self.ctx.clock.now_ns());
        if !was_stalled && self.stability.is_stalled() {
            self.ctx.diagnostics.stalls.fetch_add(1, Ordering::Relaxed);
            let timeout = self.ctx.config.stall_timeout;
            self.journal(
                IncidentKind::StallDetected,
                VigilError::StallDetected(timeout).to_string(),
            );
        }
        if let Some(transition) = stall {
            self.publish(transition);
        }

        if self.ctx.history.pending() > 0 {
            let report = self.ctx.history.flush();
            self.on_flush(report);
        }

        if self.sync.pending() > 0 && now.duration_since(self.last_chunk_at) >= self.idle_flush_after {
            debug!(pending = self.sync.pending(), "input idle, releasing formed samples");
            for sample in self.sync.flush() {
                self.on_sample(&sample);
            }
            self.account_sync();
        }

        self.refresh_status();
    }

    fn refresh_status(&self) {
        let (status, detail) = if self.ctx.history.is_degraded() {
            (
                EngineStatus::Degraded,
                Some("history writes failing; records queued for replay".to_string()),
            )
        } else if self.stability.is_stalled() {
            (
                EngineStatus::Degraded,
                Some(format!(
                    "no classification for {}s",
                    self.ctx.config.stall_timeout.as_secs_f32()
                )),
            )
        } else {
            (EngineStatus::Running, None)
        };
        set_status(&self.ctx.status, &self.ctx.status_tx, status, detail);
    }

    fn journal(&self, kind: IncidentKind, message: String) {
        self.ctx
            .journal
            .record(kind, message, self.ctx.clock.now_ns());
    }

    // ── Shutdown ─────────────────────────────────────────────────────────

    fn shutdown(mut self) {
        if !self.ctx.worker.is_idle() {
            let grace = self.ctx.config.shutdown_grace;
            match self.ctx.worker.wait(grace) {
                Some(completion) => self.on_completion(completion),
                None => warn!(?grace, "in-flight classification abandoned at shutdown"),
            }
        }

        let closed = self.stability.finalize(self.ctx.clock.now_ns());
        if let Some(record) = &closed {
            info!(label = %record.label, samples = record.sample_count, "closing current activity");
            self.persist(record.clone());
        }
        self.ctx.history.set_current(None);
        self.emit(TransitionCause::Shutdown, closed, None);

        let report = self.ctx.history.flush_now();
        self.on_flush(report);
        if report.pending > 0 {
            warn!(pending = report.pending, "history records left unwritten at shutdown");
        }

        for (reply, _) in self.waiting_manual.drain(..) {
            let _ = reply.send(Err(VigilError::NotRunning));
        }
        for reply in self.in_flight_manual.drain(..) {
            let _ = reply.send(Err(VigilError::NotRunning));
        }

        let snap = self.ctx.diagnostics.snapshot();
        info!(
            audio_chunks = snap.audio_chunks,
            video_chunks = snap.video_chunks,
            samples_paired = snap.samples_paired,
            pairing_dropped = snap.pairing_dropped,
            classifications = snap.classifications_applied,
            classifier_timeouts = snap.classifier_timeouts,
            transitions = snap.transitions,
            records_written = snap.records_written,
            "coordinator stopped; diagnostics"
        );
    }
}

/// Copy of an error for fan-out to coalesced manual requests.
fn replicate(error: &VigilError) -> VigilError {
    match error {
        VigilError::ClassifierTimeout(d) => VigilError::ClassifierTimeout(*d),
        VigilError::NoSampleAvailable => VigilError::NoSampleAvailable,
        VigilError::NotRunning => VigilError::NotRunning,
        other => VigilError::Classifier(other.to_string()),
    }
}

// ── Producers ────────────────────────────────────────────────────────────

pub struct ProducerContext {
    pub stream: StreamKind,
    pub source: Arc<dyn CaptureSource>,
    pub clock: PipelineClock,
    pub reconnect: BackoffPolicy,
    pub max_wait: Duration,
    pub tx: ChunkSender,
    pub running: Arc<AtomicBool>,
    pub monitor: ConnectivityMonitor,
    pub diagnostics: Arc<PipelineDiagnostics>,
    pub journal: Arc<ErrorJournal>,
}

/// Read one stream until `ctx.running` becomes false.
///
/// The adapter (and its session) is created here so it never leaves this thread.
pub fn run_producer(ctx: ProducerContext) {
    let stream = ctx.stream;
    info!(%stream, source = ctx.source.name(), "producer started");
    let mut adapter = StreamAdapter::new(stream, Arc::clone(&ctx.source), ctx.clock, ctx.reconnect)
        .with_monitor(ctx.monitor.clone());
    let mut failures_seen = 0u64;
    let mut evicted_seen = 0u64;

    while ctx.running.load(Ordering::Relaxed) {
        match adapter.next_chunk(ctx.max_wait) {
            AdapterRead::Chunk(chunk) => {
                if chunk.stream != stream {
                    debug!(%stream, got = %chunk.stream, "chunk for another stream ignored");
                    continue;
                }
                ctx.tx.send(chunk);
            }
            AdapterRead::Unavailable => {}
            AdapterRead::Disconnected => {
                ctx.diagnostics
                    .capture_disconnects
                    .fetch_add(1, Ordering::Relaxed);
                ctx.journal.record(
                    IncidentKind::CaptureUnavailable,
                    format!("{stream} session lost"),
                    ctx.clock.now_ns(),
                );
            }
        }

        let failures = adapter.connect_failures();
        if failures > failures_seen {
            PipelineDiagnostics::bump(
                &ctx.diagnostics.capture_connect_failures,
                failures - failures_seen,
            );
            ctx.journal.record(
                IncidentKind::CaptureUnavailable,
                format!("{stream} capture unavailable; retrying"),
                ctx.clock.now_ns(),
            );
            failures_seen = failures;
        }

        let evicted = ctx.tx.evicted();
        if evicted > evicted_seen {
            PipelineDiagnostics::bump(&ctx.diagnostics.chunks_evicted, evicted - evicted_seen);
            evicted_seen = evicted;
        }
    }

    adapter.close();
    info!(%stream, reconnects = adapter.reconnects(), "producer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread::{self, JoinHandle};

    use tokio::sync::broadcast::error::TryRecvError;

    use crate::buffering::{chunk::encode_pcm16, chunk_channel, ChunkSender};
    use crate::capture::synthetic::{SyntheticConfig, SyntheticSource};
    use crate::classifier::{ActivityClassifier, ClassifierHandle};
    use crate::history::{HistoryStore, InMemoryStore};
    use crate::labels::{ActivityLabel, LabelSet};

    const MS: u64 = 1_000_000;

    struct TestClassifier {
        label: &'static str,
        confidence: f32,
        delay: Duration,
    }

    impl ActivityClassifier for TestClassifier {
        fn classify(
            &mut self,
            features: &FeatureVector,
            labels: &LabelSet,
            _timeout: Duration,
        ) -> Result<Classification> {
            thread::sleep(self.delay);
            Ok(Classification::with_uniform_remainder(
                features.timestamp,
                ActivityLabel::from(self.label),
                self.confidence,
                &labels.labels,
            ))
        }
    }

    struct BrokenStore;

    impl HistoryStore for BrokenStore {
        fn append(&self, _record: &ActivityRecord) -> Result<()> {
            Err(VigilError::SinkWrite("disk full".into()))
        }

        fn query(&self, _from: u64, _to: u64) -> Result<Vec<ActivityRecord>> {
            Ok(Vec::new())
        }

        fn last(&self) -> Result<Option<ActivityRecord>> {
            Ok(None)
        }
    }

    struct Harness {
        audio_tx: ChunkSender,
        video_tx: ChunkSender,
        manual_tx: crossbeam_channel::Sender<ManualReply>,
        running: Arc<AtomicBool>,
        activity_rx: broadcast::Receiver<ActivityEvent>,
        status_rx: broadcast::Receiver<EngineStatusEvent>,
        history: Arc<ActivityHistory>,
        diagnostics: Arc<PipelineDiagnostics>,
        journal: Arc<ErrorJournal>,
        base: u64,
        handle: Option<JoinHandle<()>>,
    }

    impl Harness {
        fn pair(&self, offset_ms: u64) {
            let ts = self.base + offset_ms * MS;
            self.audio_tx
                .send(RawChunk::audio(ts, encode_pcm16(&[0.1, -0.1, 0.2, -0.2])));
            self.video_tx.send(RawChunk::video(ts + 2 * MS, vec![90; 16]));
        }

        fn stop(&mut self) {
            self.running.store(false, Ordering::SeqCst);
            if let Some(handle) = self.handle.take() {
                handle.join().unwrap();
            }
        }

        fn next_activity(&mut self, timeout: Duration) -> ActivityEvent {
            let start = Instant::now();
            loop {
                match self.activity_rx.try_recv() {
                    Ok(ev) => return ev,
                    Err(TryRecvError::Empty) => {
                        if start.elapsed() >= timeout {
                            panic!("timed out waiting for activity event");
                        }
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(TryRecvError::Lagged(_)) => continue,
                    Err(TryRecvError::Closed) => panic!("activity channel closed"),
                }
            }
        }

        fn wait_for(&self, timeout: Duration, cond: impl Fn(&DiagnosticsSnapshot) -> bool) {
            let start = Instant::now();
            while !cond(&self.diagnostics.snapshot()) {
                if start.elapsed() >= timeout {
                    panic!("condition not reached: {:?}", self.diagnostics.snapshot());
                }
                thread::sleep(Duration::from_millis(5));
            }
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.running.store(false, Ordering::SeqCst);
        }
    }

    fn base_config() -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.skew_max = Duration::from_millis(50);
        cfg.confirm_count = 3;
        cfg.high_confidence_override = 0.9;
        cfg.stall_timeout = Duration::from_secs(30);
        cfg.classifier_timeout = Duration::from_millis(500);
        cfg.shutdown_grace = Duration::from_millis(500);
        cfg.tick = Duration::from_millis(5);
        cfg.features.video_width = 4;
        cfg.features.video_height = 4;
        cfg.sink_retry = BackoffPolicy::new(Duration::ZERO, Duration::ZERO, 1.0);
        cfg
    }

    fn spawn(
        config: EngineConfig,
        classifier: TestClassifier,
        store: Arc<dyn HistoryStore>,
    ) -> Harness {
        let clock = PipelineClock::new();
        let (audio_tx, audio_rx) = chunk_channel(64);
        let (video_tx, video_rx) = chunk_channel(64);
        let (manual_tx, manual_rx) = crossbeam_channel::unbounded();
        let (activity_tx, activity_rx) = broadcast::channel(64);
        let (status_tx, status_rx) = broadcast::channel(64);
        let running = Arc::new(AtomicBool::new(true));
        let history = Arc::new(ActivityHistory::new(store, config.history_retry()));
        let diagnostics = Arc::new(PipelineDiagnostics::default());
        let journal = Arc::new(ErrorJournal::new(config.journal_capacity));
        let worker = ClassifierWorker::spawn(
            ClassifierHandle::new(classifier),
            config.labels.clone(),
            config.classifier_timeout,
        )
        .unwrap();

        let ctx = PipelineContext {
            config,
            clock,
            worker,
            audio_rx,
            video_rx,
            manual_rx,
            running: Arc::clone(&running),
            history: Arc::clone(&history),
            activity_tx,
            status_tx,
            status: Arc::new(Mutex::new(EngineStatusEvent {
                status: EngineStatus::Running,
                detail: None,
            })),
            seq: Arc::new(AtomicU64::new(0)),
            diagnostics: Arc::clone(&diagnostics),
            journal: Arc::clone(&journal),
        };
        let handle = thread::spawn(move || run(ctx));

        Harness {
            audio_tx,
            video_tx,
            manual_tx,
            running,
            activity_rx,
            status_rx,
            history,
            diagnostics,
            journal,
            base: clock.now_ns() + 1_000 * MS,
            handle: Some(handle),
        }
    }

    fn classifier(label: &'static str, confidence: f32, delay_ms: u64) -> TestClassifier {
        TestClassifier {
            label,
            confidence,
            delay: Duration::from_millis(delay_ms),
        }
    }

    #[test]
    fn high_confidence_transition_is_persisted_and_closed_on_stop() {
        let store = Arc::new(InMemoryStore::new());
        let mut h = spawn(base_config(), classifier("reading", 0.95, 0), store.clone());

        h.pair(0);
        h.pair(200);

        let ev = h.next_activity(Duration::from_secs(2));
        assert_eq!(ev.cause, TransitionCause::HighConfidence);
        assert_eq!(ev.current.as_ref().unwrap().label.as_str(), "reading");
        // The startup `unknown` gap is closed at the first classification.
        let gap = ev.closed.unwrap();
        assert_eq!(gap.label.as_str(), "unknown");
        assert_eq!(gap.ended_at, ev.current.unwrap().started_at);
        assert_eq!(h.history.current().unwrap().label.as_str(), "reading");

        h.stop();
        let last = h.next_activity(Duration::from_secs(1));
        assert_eq!(last.cause, TransitionCause::Shutdown);
        assert!(last.current.is_none());
        assert!(h.history.current().is_none());

        let records = store.all();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].label.as_str(), "reading");
        assert!(records[0].ended_at <= records[1].started_at);
    }

    #[test]
    fn manual_request_without_any_sample_fails() {
        let mut h = spawn(
            base_config(),
            classifier("video", 0.5, 0),
            Arc::new(InMemoryStore::new()),
        );
        let (tx, rx) = oneshot::channel();
        h.manual_tx.send(tx).unwrap();
        assert!(matches!(
            rx.blocking_recv().unwrap(),
            Err(VigilError::NoSampleAvailable)
        ));
        h.stop();
    }

    #[test]
    fn manual_request_switches_immediately() {
        let mut cfg = base_config();
        cfg.classifier_timeout = Duration::from_secs(2);
        let mut h = spawn(cfg, classifier("video", 0.5, 0), Arc::new(InMemoryStore::new()));
        h.pair(0);
        h.pair(200);
        h.wait_for(Duration::from_secs(2), |d| d.samples_paired >= 1);
        h.wait_for(Duration::from_secs(2), |d| d.classifications_applied >= 1);

        let (tx, rx) = oneshot::channel();
        h.manual_tx.send(tx).unwrap();
        h.pair(400);
        let c = rx.blocking_recv().unwrap().unwrap();
        assert_eq!(c.label.as_str(), "video");

        let ev = h.next_activity(Duration::from_secs(1));
        assert_eq!(ev.cause, TransitionCause::Manual);
        assert_eq!(h.history.current().unwrap().label.as_str(), "video");
        assert_eq!(h.diagnostics.snapshot().manual_requests, 1);
        h.stop();
    }

    #[test]
    fn manual_request_outranks_queued_sample() {
        let mut cfg = base_config();
        cfg.skew_max = Duration::from_millis(100);
        cfg.classifier_timeout = Duration::from_secs(2);
        let mut h = spawn(cfg, classifier("video", 0.5, 150), Arc::new(InMemoryStore::new()));

        h.pair(0);
        thread::sleep(Duration::from_millis(20));
        h.pair(300);
        h.wait_for(Duration::from_secs(2), |d| d.classifications_dispatched >= 1);
        thread::sleep(Duration::from_millis(20));
        // Sample 300 lands in the pending slot while the first call is running.
        h.pair(600);
        let (tx, rx) = oneshot::channel();
        h.manual_tx.send(tx).unwrap();

        let c = rx.blocking_recv().unwrap().unwrap();
        assert_eq!(c.timestamp, h.base + 302 * MS);
        let ev = h.next_activity(Duration::from_secs(1));
        assert_eq!(ev.cause, TransitionCause::Manual);
        assert_eq!(ev.current.unwrap().last_confirmed_at, h.base + 302 * MS);
        assert_eq!(h.diagnostics.snapshot().samples_superseded, 0);
        h.stop();
    }

    #[test]
    fn manual_request_after_stall_keeps_the_gap() {
        let mut cfg = base_config();
        cfg.skew_max = Duration::from_millis(10);
        cfg.stall_timeout = Duration::from_millis(150);
        cfg.classifier_timeout = Duration::from_millis(300);
        let store = Arc::new(InMemoryStore::new());
        let mut h = spawn(cfg, classifier("reading", 0.95, 0), store.clone());

        for offset in [0, 20, 40] {
            h.pair(offset);
            thread::sleep(Duration::from_millis(15));
        }
        assert_eq!(
            h.next_activity(Duration::from_secs(2)).cause,
            TransitionCause::HighConfidence
        );
        assert_eq!(h.next_activity(Duration::from_secs(2)).cause, TransitionCause::Stall);

        // Let the pipeline clock move past the last sample timestamp.
        thread::sleep(Duration::from_millis(1_200));
        let (tx, rx) = oneshot::channel();
        h.manual_tx.send(tx).unwrap();
        assert!(matches!(
            rx.blocking_recv().unwrap(),
            Err(VigilError::NoSampleAvailable)
        ));
        assert!(matches!(h.activity_rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(h.diagnostics.snapshot().stalls, 1);

        h.stop();
        let records = store.all();
        let labels: Vec<&str> = records.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, ["unknown", "reading", "unknown"]);
        assert_eq!(records[2].started_at, records[1].ended_at);
        assert!(records[2].ended_at > records[2].started_at);
    }

    #[test]
    fn slow_classifier_is_abandoned_and_late_reply_discarded() {
        let mut cfg = base_config();
        cfg.classifier_timeout = Duration::from_millis(20);
        let mut h = spawn(cfg, classifier("idle", 0.95, 120), Arc::new(InMemoryStore::new()));

        h.pair(0);
        h.pair(200);
        h.wait_for(Duration::from_secs(2), |d| {
            d.classifier_timeouts >= 1 && d.late_replies_discarded >= 1
        });
        assert_eq!(h.diagnostics.snapshot().transitions, 0);
        assert!(!h
            .journal
            .recent(10, Some(IncidentKind::ClassifierTimeout))
            .is_empty());
        h.stop();
    }

    #[test]
    fn stall_closes_current_as_unknown_once() {
        let mut cfg = base_config();
        cfg.stall_timeout = Duration::from_millis(150);
        let mut h = spawn(cfg, classifier("reading", 0.95, 0), Arc::new(InMemoryStore::new()));

        h.pair(0);
        h.pair(200);
        let first = h.next_activity(Duration::from_secs(2));
        assert_eq!(first.cause, TransitionCause::HighConfidence);

        let stall = h.next_activity(Duration::from_secs(2));
        assert_eq!(stall.cause, TransitionCause::Stall);
        assert_eq!(stall.closed.unwrap().label.as_str(), "reading");
        assert_eq!(stall.current.unwrap().label.as_str(), "unknown");

        thread::sleep(Duration::from_millis(300));
        assert!(matches!(h.activity_rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(h.diagnostics.snapshot().stalls, 1);

        let mut degraded = false;
        while let Ok(ev) = h.status_rx.try_recv() {
            degraded |= ev.status == EngineStatus::Degraded;
        }
        assert!(degraded);
        h.stop();
    }

    #[test]
    fn failing_sink_reports_degraded_and_keeps_records() {
        let mut cfg = base_config();
        cfg.sink_retry_budget = 0;
        let mut h = spawn(cfg, classifier("reading", 0.95, 0), Arc::new(BrokenStore));

        h.pair(0);
        h.pair(200);
        h.next_activity(Duration::from_secs(2));

        let start = Instant::now();
        loop {
            match h.status_rx.try_recv() {
                Ok(ev) if ev.status == EngineStatus::Degraded => break,
                Ok(_) | Err(TryRecvError::Lagged(_)) => {}
                Err(_) => {
                    assert!(start.elapsed() < Duration::from_secs(2), "no degraded status");
                    thread::sleep(Duration::from_millis(5));
                }
            }
        }
        assert!(h.history.pending() >= 1);
        assert!(h.diagnostics.snapshot().sink_failures >= 1);
        // Still queryable from memory.
        assert!(!h.history.query(0, u64::MAX).unwrap().is_empty());
        h.stop();
    }

    #[test]
    fn bad_payloads_are_counted_not_fatal() {
        let mut h = spawn(
            base_config(),
            classifier("reading", 0.95, 0),
            Arc::new(InMemoryStore::new()),
        );
        let ts = h.base;
        h.audio_tx.send(RawChunk::audio(ts, vec![1, 2, 3]));
        h.video_tx.send(RawChunk::video(ts, vec![0; 16]));
        h.pair(300);
        h.pair(600);

        h.wait_for(Duration::from_secs(2), |d| {
            d.feature_errors >= 1 && d.transitions >= 1
        });
        assert_eq!(
            h.journal.counts().get(&IncidentKind::FeatureError).copied(),
            Some(1)
        );
        h.stop();
    }

    #[test]
    fn producer_forwards_chunks_until_stopped() {
        let source = Arc::new(SyntheticSource::new(SyntheticConfig {
            realtime: false,
            width: 4,
            height: 4,
            ..SyntheticConfig::default()
        }));
        let (tx, rx) = chunk_channel(8);
        let (conn_tx, _conn_rx) = broadcast::channel(16);
        let running = Arc::new(AtomicBool::new(true));
        let diagnostics = Arc::new(PipelineDiagnostics::default());

        let ctx = ProducerContext {
            stream: StreamKind::Video,
            source,
            clock: PipelineClock::new(),
            reconnect: BackoffPolicy::default(),
            max_wait: Duration::from_millis(5),
            tx,
            running: Arc::clone(&running),
            monitor: ConnectivityMonitor::new(conn_tx),
            diagnostics,
            journal: Arc::new(ErrorJournal::default()),
        };
        let handle = thread::spawn(move || run_producer(ctx));

        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first.stream, StreamKind::Video);
        assert_eq!(first.len(), 16);
        assert!(second.timestamp > first.timestamp);

        running.store(false, Ordering::SeqCst);
        handle.join().unwrap();
    }

    #[test]
    fn diagnostics_reset_clears_counters() {
        let d = PipelineDiagnostics::default();
        d.transitions.fetch_add(3, Ordering::Relaxed);
        d.sink_failures.fetch_add(1, Ordering::Relaxed);
        assert_eq!(d.snapshot().transitions, 3);
        d.reset();
        assert_eq!(d.snapshot(), DiagnosticsSnapshot::default());
    }
}
