//! # vigil-core
//!
//! Real-time activity recognition engine.
//!
//! ## Architecture
//!
//! ```text
//! CaptureSource ─► StreamAdapter(audio) ─┐  drop-oldest channels
//!               └► StreamAdapter(video) ─┤
//!                                        ▼
//!                     Coordinator(spawn_blocking)
//!                 Synchronizer → FeatureExtractor → LatestSlot
//!                                        │ at most one in flight
//!                              ClassifierWorker (timeout)
//!                                        │
//!                                 StabilityEngine
//!                                        │
//!               ActivityHistory + broadcast::Sender<ActivityEvent>
//! ```
//!
//! Consumers read through `VigilEngine`: current activity, history by time
//! range, forced classification and a status report.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod buffering;
pub mod capture;
pub mod classifier;
pub mod clock;
pub mod engine;
pub mod error;
pub mod features;
pub mod history;
pub mod ipc;
pub mod labels;
pub mod stability;
pub mod sync;

// Convenience re-exports for downstream crates
pub use capture::{CaptureSource, CaptureSources};
pub use classifier::{ActivityClassifier, ClassifierHandle, RuleClassifier};
pub use clock::PipelineClock;
pub use engine::{EngineConfig, IncidentKind, StatusReport, VigilEngine};
pub use error::{Result, VigilError};
pub use history::{ActivityStats, HistoryStore, InMemoryStore, Period};
pub use ipc::events::{
    ActivityEvent, ActivityRecord, ActivityState, Classification, ConnectivityEvent,
    ConnectivityState, EngineStatus, EngineStatusEvent, TransitionCause,
};
pub use labels::{ActivityLabel, LabelSet};

#[cfg(feature = "remote-classifier")]
pub use classifier::{RemoteClassifier, RemoteClassifierConfig};
