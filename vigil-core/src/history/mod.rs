//! Activity history: closed records plus the current-state snapshot.
//!
//! `HistoryStore` is the persistence boundary (SQLite in the app, memory in
//! tests). `ActivityHistory` sits in front of it as the single writer:
//!
//! - appends are checked for time order and queued before being written,
//!   so a failing store never loses a record;
//! - failed writes are retried with backoff; pending records are replayed in
//!   order once the store recovers;
//! - once a write has failed `budget` retries in a row the sink reports degraded;
//! - queries merge the store with still-pending records under the same lock
//!   as appends, so readers never observe records out of order.

pub mod memory;
pub mod stats;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::capture::backoff::{Backoff, BackoffPolicy};
use crate::clock::deadline_after;
use crate::error::{Result, VigilError};
use crate::ipc::events::{ActivityRecord, ActivityState};

pub use memory::InMemoryStore;
pub use stats::{summarize, ActivityStats, LabelStats, Period};

/// Append-only persistence for closed activity records.
pub trait HistoryStore: Send + Sync + 'static {
    /// Persist one record. Must be atomic: either fully visible or not at all.
    fn append(&self, record: &ActivityRecord) -> Result<()>;

    /// Records overlapping `[from, to)`, ordered by `started_at`.
    fn query(&self, from: u64, to: u64) -> Result<Vec<ActivityRecord>>;

    /// Most recently appended record.
    fn last(&self) -> Result<Option<ActivityRecord>>;
}

/// Outcome of a flush attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub written: usize,
    pub pending: usize,
    pub failed: bool,
    /// `Some(true)` when this flush entered degraded mode, `Some(false)` when it left it.
    pub degraded_changed: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SinkRetry {
    pub backoff: BackoffPolicy,
    /// Consecutive failed writes tolerated before reporting degraded.
    pub budget: u32,
}

impl Default for SinkRetry {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::new(Duration::from_millis(200), Duration::from_secs(10), 2.0),
            budget: 5,
        }
    }
}

struct SinkState {
    pending: VecDeque<ActivityRecord>,
    last_end: Option<u64>,
    failures: u32,
    retry_at: Option<Instant>,
    backoff: Backoff,
    degraded: bool,
    last_error: Option<String>,
}

pub struct ActivityHistory {
    store: Arc<dyn HistoryStore>,
    budget: u32,
    state: Mutex<SinkState>,
    current: RwLock<Option<ActivityState>>,
}

impl ActivityHistory {
    pub fn new(store: Arc<dyn HistoryStore>, retry: SinkRetry) -> Self {
        Self {
            store,
            budget: retry.budget,
            state: Mutex::new(SinkState {
                pending: VecDeque::new(),
                last_end: None,
                failures: 0,
                retry_at: None,
                backoff: Backoff::new(retry.backoff),
                degraded: false,
                last_error: None,
            }),
            current: RwLock::new(None),
        }
    }

    /// Seed the ordering check from the store's newest record.
    ///
    /// A store that cannot be read leaves the check unseeded.
    pub fn resume(&self) -> Option<u64> {
        let mut state = self.state.lock();
        if state.last_end.is_some() {
            return state.last_end;
        }
        match self.store.last() {
            Ok(last) => {
                state.last_end = last.map(|r| r.ended_at);
                state.last_end
            }
            Err(e) => {
                warn!("history store unreadable at startup: {e}");
                None
            }
        }
    }

    /// Accept a closed record and try to write it (and anything still pending).
    ///
    /// # Errors
    /// `OutOfOrderRecord` if `record` starts before the last accepted record ended.
    /// Store failures are not errors: the record stays queued for replay.
    pub fn append(&self, record: ActivityRecord) -> Result<FlushReport> {
        let mut state = self.state.lock();
        if let Some(last_end) = state.last_end {
            if record.started_at < last_end {
                return Err(VigilError::OutOfOrderRecord {
                    started_at: record.started_at,
                    last_ended_at: last_end,
                });
            }
        }
        state.last_end = Some(record.ended_at);
        debug!(label = %record.label, started_at = record.started_at, "record queued");
        state.pending.push_back(record);
        Ok(self.flush_locked(&mut state, false))
    }

    /// Retry pending writes if the backoff delay has elapsed.
    pub fn flush(&self) -> FlushReport {
        let mut state = self.state.lock();
        self.flush_locked(&mut state, false)
    }

    /// Retry pending writes immediately, ignoring backoff. Used at shutdown.
    pub fn flush_now(&self) -> FlushReport {
        let mut state = self.state.lock();
        self.flush_locked(&mut state, true)
    }

    /// Records overlapping `[from, to)`, including ones not yet persisted.
    pub fn query(&self, from: u64, to: u64) -> Result<Vec<ActivityRecord>> {
        let state = self.state.lock();
        let mut records = self.store.query(from, to)?;
        records.extend(
            state
                .pending
                .iter()
                .filter(|r| r.overlaps(from, to))
                .cloned(),
        );
        Ok(records)
    }

    pub fn current(&self) -> Option<ActivityState> {
        self.current.read().clone()
    }

    pub fn set_current(&self, state: Option<ActivityState>) {
        *self.current.write() = state;
    }

    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_degraded(&self) -> bool {
        self.state.lock().degraded
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    fn flush_locked(&self, state: &mut SinkState, force: bool) -> FlushReport {
        let mut report = FlushReport::default();
        if !force {
            if let Some(at) = state.retry_at {
                if Instant::now() < at {
                    report.pending = state.pending.len();
                    return report;
                }
            }
        }

        while let Some(record) = state.pending.front() {
            match self.store.append(record) {
                Ok(()) => {
                    state.pending.pop_front();
                    report.written += 1;
                }
                Err(e) => {
                    state.failures = state.failures.saturating_add(1);
                    let delay = state.backoff.next_delay();
                    state.retry_at = Some(deadline_after(delay));
                    warn!(
                        failures = state.failures,
                        pending = state.pending.len(),
                        retry_in = ?delay,
                        "history write failed: {e}"
                    );
                    state.last_error = Some(e.to_string());
                    report.failed = true;
                    if !state.degraded && state.failures > self.budget {
                        state.degraded = true;
                        report.degraded_changed = Some(true);
                        warn!("history sink degraded after {} failed writes", state.failures);
                    }
                    break;
                }
            }
        }

        if !report.failed && report.written > 0 {
            state.failures = 0;
            state.retry_at = None;
            state.backoff.reset();
            if state.degraded {
                state.degraded = false;
                state.last_error = None;
                report.degraded_changed = Some(false);
                info!(replayed = report.written, "history sink recovered");
            }
        }
        report.pending = state.pending.len();
        report
    }
}

impl std::fmt::Debug for ActivityHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityHistory")
            .field("pending", &self.pending())
            .field("degraded", &self.is_degraded())
            .finish()
    }
}
