use std::time::Duration;

use thiserror::Error;

use crate::buffering::chunk::StreamKind;

/// All errors produced by vigil-core.
///
/// Only lifecycle and configuration errors ever reach a caller of the engine.
/// Per-sample failures are absorbed by the coordinator and surfaced through
/// diagnostics counters and the error journal.
#[derive(Debug, Error)]
pub enum VigilError {
    #[error("capture source unavailable: {0}")]
    CaptureUnavailable(String),

    #[error("capture session disconnected: {0}")]
    Disconnected(String),

    #[error("capture source does not provide the {0} stream")]
    UnsupportedStream(StreamKind),

    #[error("chunk expired before a pairing was found")]
    PairingTimeout,

    #[error(transparent)]
    Feature(#[from] FeatureError),

    #[error("classifier timed out after {0:?}")]
    ClassifierTimeout(Duration),

    #[error("classifier error: {0}")]
    Classifier(String),

    #[error("no classification received for {0:?}")]
    StallDetected(Duration),

    #[error("history sink write failed: {0}")]
    SinkWrite(String),

    #[error("history sink read failed: {0}")]
    SinkRead(String),

    #[error("record starting at {started_at} precedes last record end {last_ended_at}")]
    OutOfOrderRecord { started_at: u64, last_ended_at: u64 },

    #[error("no synchronized sample available to classify")]
    NoSampleAvailable,

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is not running")]
    NotRunning,

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Malformed payloads rejected by the feature extractor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeatureError {
    #[error("{0} payload is empty")]
    EmptyPayload(StreamKind),

    #[error("audio payload has odd length {0} (expected 16-bit PCM)")]
    OddAudioLength(usize),

    #[error("audio payload is {actual} bytes, expected {expected}")]
    AudioLengthMismatch { expected: usize, actual: usize },

    #[error("video payload is {actual} bytes, expected {expected}")]
    VideoLengthMismatch { expected: usize, actual: usize },

    #[error("expected a {expected} chunk, got {actual}")]
    StreamMismatch {
        expected: StreamKind,
        actual: StreamKind,
    },
}

pub type Result<T> = std::result::Result<T, VigilError>;
