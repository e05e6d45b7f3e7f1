//! Typed media units passed between the capture, sync and feature stages.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which of the two independently clocked media streams a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Audio,
    Video,
}

impl StreamKind {
    pub const ALL: [StreamKind; 2] = [StreamKind::Audio, StreamKind::Video];

    /// The stream a chunk of this kind must be paired with.
    pub fn other(self) -> Self {
        match self {
            StreamKind::Audio => StreamKind::Video,
            StreamKind::Video => StreamKind::Audio,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Audio => "audio",
            StreamKind::Video => "video",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One timestamped unit of captured media.
///
/// Audio payloads are 16-bit little-endian mono PCM; video payloads are raw
/// frames in the pixel format configured for the feature extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChunk {
    pub stream: StreamKind,
    /// Capture time in the pipeline clock domain (ns).
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

impl RawChunk {
    pub fn new(stream: StreamKind, timestamp: u64, payload: Vec<u8>) -> Self {
        Self {
            stream,
            timestamp,
            payload,
        }
    }

    pub fn audio(timestamp: u64, payload: Vec<u8>) -> Self {
        Self::new(StreamKind::Audio, timestamp, payload)
    }

    pub fn video(timestamp: u64, payload: Vec<u8>) -> Self {
        Self::new(StreamKind::Video, timestamp, payload)
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// A time-aligned audio/video pair emitted by the synchronizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    /// Ordering key: the later of the two chunk timestamps.
    pub timestamp: u64,
    pub audio: RawChunk,
    pub video: RawChunk,
}

impl Sample {
    pub fn new(audio: RawChunk, video: RawChunk) -> Self {
        Self {
            timestamp: audio.timestamp.max(video.timestamp),
            audio,
            video,
        }
    }

    /// Absolute timestamp difference between the paired chunks.
    pub fn skew(&self) -> u64 {
        self.audio.timestamp.abs_diff(self.video.timestamp)
    }
}

/// Encode mono f32 samples in [-1.0, 1.0] as 16-bit little-endian PCM.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Decode 16-bit little-endian PCM into f32 samples in [-1.0, 1.0].
///
/// A trailing odd byte is ignored; callers validate lengths first.
pub fn decode_pcm16(payload: &[u8]) -> Vec<f32> {
    payload
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect()
}
