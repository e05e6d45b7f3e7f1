//! Capture boundary: where timestamped audio and video chunks enter the pipeline.
//!
//! A `CaptureSource` is the external real-time provider. Each stream adapter
//! opens its own `CaptureSession` from it and pulls chunks with a bounded
//! wait, so a silent or dead source surfaces as `Unavailable` instead of
//! blocking the producer forever.
//!
//! Sources shipped with the crate:
//!
//! | Source | Streams | Use |
//! |--------|---------|-----|
//! | `SyntheticSource` | audio + video | demos, benchmark, tests |
//! | `MicrophoneSource` | audio | local input device via cpal (`audio-cpal`) |

pub mod adapter;
pub mod backoff;
pub mod device;
pub mod microphone;
pub mod resample;
pub mod synthetic;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use crate::buffering::chunk::{RawChunk, StreamKind};
use crate::clock::PipelineClock;
use crate::error::Result;
use crate::ipc::events::{ConnectivityEvent, ConnectivityState};

pub use adapter::{AdapterRead, StreamAdapter};
pub use backoff::{Backoff, BackoffPolicy};
pub use device::{list_input_devices, DevicePreference, InputDevice};
pub use microphone::{MicrophoneConfig, MicrophoneSource};
pub use synthetic::{FramePattern, SyntheticConfig, SyntheticScene, SyntheticSource};

/// Result of a single bounded read from a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkRead {
    Chunk(RawChunk),
    /// Nothing arrived within the wait budget; the session is still healthy.
    Unavailable,
}

/// Factory for capture sessions: the external real-time provider.
pub trait CaptureSource: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Streams this source can produce.
    fn streams(&self) -> &[StreamKind];

    /// Open a new session stamping chunks with `clock`.
    ///
    /// # Errors
    /// Any error is treated as transient and retried with backoff.
    fn connect(&self, clock: PipelineClock) -> Result<Box<dyn CaptureSession>>;

    fn supports(&self, stream: StreamKind) -> bool {
        self.streams().contains(&stream)
    }
}

/// A live connection to a capture source.
///
/// Sessions are created and dropped on the producer thread that uses them,
/// so implementations may hold `!Send` handles (e.g. `cpal::Stream`).
pub trait CaptureSession {
    /// Wait at most `max_wait` for the next chunk of `stream`.
    ///
    /// # Errors
    /// An error means the session is dead; the adapter drops it and reconnects.
    fn next(&mut self, stream: StreamKind, max_wait: Duration) -> Result<ChunkRead>;

    /// Release the session. Called at most once before drop.
    fn close(&mut self);
}

/// Per-stream capture sources handed to the engine. Both fields may point at
/// the same source.
#[derive(Clone)]
pub struct CaptureSources {
    pub audio: Arc<dyn CaptureSource>,
    pub video: Arc<dyn CaptureSource>,
}

impl CaptureSources {
    /// Use one source for both streams.
    pub fn shared(source: Arc<dyn CaptureSource>) -> Self {
        Self {
            audio: Arc::clone(&source),
            video: source,
        }
    }

    pub fn get(&self, stream: StreamKind) -> Arc<dyn CaptureSource> {
        match stream {
            StreamKind::Audio => Arc::clone(&self.audio),
            StreamKind::Video => Arc::clone(&self.video),
        }
    }
}

impl std::fmt::Debug for CaptureSources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSources")
            .field("audio", &self.audio.name())
            .field("video", &self.video.name())
            .finish()
    }
}

/// Observable connectivity of every stream adapter.
///
/// Not required for pipeline correctness; consumed by status readers.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    states: Arc<RwLock<HashMap<StreamKind, ConnectivityState>>>,
    tx: broadcast::Sender<ConnectivityEvent>,
}

impl ConnectivityMonitor {
    pub fn new(tx: broadcast::Sender<ConnectivityEvent>) -> Self {
        Self {
            states: Arc::new(RwLock::new(HashMap::new())),
            tx,
        }
    }

    /// Record a new state; only actual changes are broadcast.
    pub fn set(&self, stream: StreamKind, state: ConnectivityState) {
        let changed = self.states.write().insert(stream, state) != Some(state);
        if changed {
            debug!(%stream, ?state, "connectivity changed");
            let _ = self.tx.send(ConnectivityEvent { stream, state });
        }
    }

    pub fn get(&self, stream: StreamKind) -> Option<ConnectivityState> {
        self.states.read().get(&stream).copied()
    }

    pub fn snapshot(&self) -> Vec<ConnectivityEvent> {
        let states = self.states.read();
        StreamKind::ALL
            .iter()
            .filter_map(|s| {
                states.get(s).map(|state| ConnectivityEvent {
                    stream: *s,
                    state: *state,
                })
            })
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.tx.subscribe()
    }
}

impl std::fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("states", &*self.states.read())
            .finish()
    }
}
