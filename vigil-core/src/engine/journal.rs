//! Bounded in-memory log of recent pipeline incidents.
//!
//! Per-sample failures never leave the coordinator as errors. They are
//! counted in `PipelineDiagnostics` and the most recent ones are kept here
//! so a status read can show what went wrong.

use std::collections::{BTreeMap, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentKind {
    CaptureUnavailable,
    PairingTimeout,
    FeatureError,
    ClassifierTimeout,
    ClassifierError,
    StallDetected,
    SinkWriteFailure,
}

impl IncidentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CaptureUnavailable => "capture_unavailable",
            Self::PairingTimeout => "pairing_timeout",
            Self::FeatureError => "feature_error",
            Self::ClassifierTimeout => "classifier_timeout",
            Self::ClassifierError => "classifier_error",
            Self::StallDetected => "stall_detected",
            Self::SinkWriteFailure => "sink_write_failure",
        }
    }
}

impl std::str::FromStr for IncidentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            Self::CaptureUnavailable,
            Self::PairingTimeout,
            Self::FeatureError,
            Self::ClassifierTimeout,
            Self::ClassifierError,
            Self::StallDetected,
            Self::SinkWriteFailure,
        ]
        .into_iter()
        .find(|k| k.as_str() == s)
        .ok_or_else(|| format!("unknown incident kind '{s}'"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    pub kind: IncidentKind,
    pub message: String,
    /// Pipeline time (ns since the UNIX epoch).
    pub timestamp: u64,
}

#[derive(Debug)]
pub struct ErrorJournal {
    capacity: usize,
    entries: Mutex<VecDeque<Incident>>,
    counts: Mutex<BTreeMap<IncidentKind, u64>>,
}

impl ErrorJournal {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
            counts: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn record(&self, kind: IncidentKind, message: impl Into<String>, timestamp: u64) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(Incident {
            kind,
            message: message.into(),
            timestamp,
        });
        *self.counts.lock().entry(kind).or_default() += 1;
    }

    /// Up to `limit` incidents, newest first, optionally of one kind.
    pub fn recent(&self, limit: usize, kind: Option<IncidentKind>) -> Vec<Incident> {
        self.entries
            .lock()
            .iter()
            .rev()
            .filter(|i| kind.map_or(true, |k| i.kind == k))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Total incidents per kind since the last `clear`, including evicted ones.
    pub fn counts(&self) -> BTreeMap<IncidentKind, u64> {
        self.counts.lock().clone()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
        self.counts.lock().clear();
    }
}

impl Default for ErrorJournal {
    fn default() -> Self {
        Self::new(100)
    }
}
