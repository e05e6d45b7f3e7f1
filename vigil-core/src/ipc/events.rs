//! Event and snapshot types published by the engine.
//!
//! | Type | Delivered via |
//! |------|---------------|
//! | `ActivityEvent` | `VigilEngine::subscribe_activity` |
//! | `EngineStatusEvent` | `VigilEngine::subscribe_status` |
//! | `ConnectivityEvent` | `VigilEngine::subscribe_connectivity` |

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::buffering::chunk::StreamKind;
use crate::labels::ActivityLabel;

// ---------------------------------------------------------------------------
// Classification output
// ---------------------------------------------------------------------------

/// One scored sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    /// Timestamp of the sample that was scored (ns).
    pub timestamp: u64,
    pub label: ActivityLabel,
    /// Confidence in [0.0, 1.0] of `label`.
    pub confidence: f32,
    /// Score per label.
    pub distribution: BTreeMap<ActivityLabel, f32>,
}

impl Classification {
    /// Build a classification whose distribution puts `confidence` on `label`
    /// and spreads the remainder evenly across `others`.
    pub fn with_uniform_remainder<'a>(
        timestamp: u64,
        label: ActivityLabel,
        confidence: f32,
        others: impl IntoIterator<Item = &'a ActivityLabel>,
    ) -> Self {
        let confidence = confidence.clamp(0.0, 1.0);
        let others: Vec<&ActivityLabel> = others.into_iter().filter(|l| **l != label).collect();
        let mut distribution = BTreeMap::new();
        if !others.is_empty() {
            let share = (1.0 - confidence) / others.len() as f32;
            for other in others {
                distribution.insert(other.clone(), share);
            }
        }
        distribution.insert(label.clone(), confidence);
        Self {
            timestamp,
            label,
            confidence,
            distribution,
        }
    }
}

// ---------------------------------------------------------------------------
// Activity state and history
// ---------------------------------------------------------------------------

/// The currently accepted activity. Owned by the stability engine; consumers
/// only ever see copies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityState {
    pub label: ActivityLabel,
    pub started_at: u64,
    pub last_confirmed_at: u64,
    pub sample_count: u64,
}

impl ActivityState {
    pub fn new(label: ActivityLabel, started_at: u64) -> Self {
        Self {
            label,
            started_at,
            last_confirmed_at: started_at,
            sample_count: 0,
        }
    }
}

/// A closed, immutable activity interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    pub label: ActivityLabel,
    pub started_at: u64,
    pub ended_at: u64,
    #[serde(default)]
    pub sample_count: u64,
}

impl ActivityRecord {
    pub fn duration_ns(&self) -> u64 {
        self.ended_at.saturating_sub(self.started_at)
    }

    /// Whether this record intersects `[from, to)`. A record ending exactly at
    /// `from` still counts.
    pub fn overlaps(&self, from: u64, to: u64) -> bool {
        self.started_at < to && self.ended_at >= from
    }
}

/// Why the current activity changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCause {
    /// A candidate label reached the confirmation streak.
    Confirmed,
    /// A single sample exceeded the high-confidence override.
    HighConfidence,
    /// A manual classification request.
    Manual,
    /// No classification arrived within the stall timeout.
    Stall,
    /// The engine shut down and closed the open state.
    Shutdown,
}

/// Emitted whenever the stability engine changes the current activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    pub cause: TransitionCause,
    /// The record that was closed by this transition, if any.
    pub closed: Option<ActivityRecord>,
    /// The state that is now current. `None` after shutdown.
    pub current: Option<ActivityState>,
}

// ---------------------------------------------------------------------------
// Engine status events
// ---------------------------------------------------------------------------

/// Emitted when the engine state changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatusEvent {
    pub status: EngineStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

/// Current state of the Vigil engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    /// Engine created but `start()` not yet called.
    Idle,
    /// Capturing and classifying.
    Running,
    /// Running, but history writes are failing beyond the retry budget or
    /// classification has stalled.
    Degraded,
    /// Shut down; the engine may be restarted.
    Stopped,
    /// Unrecoverable startup error.
    Error,
}

// ---------------------------------------------------------------------------
// Connectivity
// ---------------------------------------------------------------------------

/// Connection state of one stream adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum ConnectivityState {
    Connecting,
    Connected,
    #[serde(rename_all = "camelCase")]
    Reconnecting {
        attempt: u32,
        retry_in_ms: u64,
    },
    Stopped,
}

/// Emitted when a stream adapter's connection state changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityEvent {
    pub stream: StreamKind,
    #[serde(flatten)]
    pub state: ConnectivityState,
}
