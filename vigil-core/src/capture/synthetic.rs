//! Deterministic audio/video generator.
//!
//! Plays a looping script of scenes, each with its own tone and frame
//! pattern, so the rules classifier sees distinct activities. Timestamps are
//! scheduled from the session start rather than read at emit time, which
//! keeps replays reproducible. Optional fault injection exercises the
//! reconnect path.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::buffering::chunk::{encode_pcm16, RawChunk, StreamKind};
use crate::capture::{CaptureSession, CaptureSource, ChunkRead};
use crate::clock::{duration_ns, PipelineClock};
use crate::error::{Result, VigilError};

/// Pixel content of generated frames.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum FramePattern {
    /// Every pixel has the same luma.
    Flat(u8),
    /// Horizontal ramp from black to white, shifting each frame.
    Gradient,
    /// Checkerboard with the given cell size, inverting each frame.
    Checker(u8),
}

/// One segment of the synthetic script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyntheticScene {
    #[serde(with = "crate::engine::duration_ms")]
    pub duration: Duration,
    pub tone_hz: f32,
    /// Peak amplitude of the tone in [0, 1].
    pub amplitude: f32,
    /// Amplitude of added white noise in [0, 1].
    #[serde(default)]
    pub noise: f32,
    pub frame: FramePattern,
}

impl SyntheticScene {
    pub fn quiet(duration: Duration) -> Self {
        Self {
            duration,
            tone_hz: 0.0,
            amplitude: 0.0,
            noise: 0.0,
            frame: FramePattern::Flat(40),
        }
    }
}

/// Settings for `SyntheticSource`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyntheticConfig {
    pub sample_rate: u32,
    #[serde(with = "crate::engine::duration_ms")]
    pub audio_chunk: Duration,
    #[serde(with = "crate::engine::duration_ms")]
    pub frame_interval: Duration,
    pub width: u32,
    pub height: u32,
    /// Looped in order. An empty script produces silence and flat frames.
    pub scenes: Vec<SyntheticScene>,
    /// Pace output to wall time. When false chunks are emitted as fast as they are read.
    pub realtime: bool,
    /// Number of initial `connect` calls that fail.
    pub fail_first_connects: u32,
    /// End each session with an error after this many chunks.
    pub disconnect_after: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            audio_chunk: Duration::from_millis(500),
            frame_interval: Duration::from_millis(500),
            width: 64,
            height: 48,
            scenes: vec![
                SyntheticScene::quiet(Duration::from_secs(20)),
                SyntheticScene {
                    duration: Duration::from_secs(20),
                    tone_hz: 440.0,
                    amplitude: 0.6,
                    noise: 0.3,
                    frame: FramePattern::Checker(4),
                },
                SyntheticScene {
                    duration: Duration::from_secs(20),
                    tone_hz: 0.0,
                    amplitude: 0.0,
                    noise: 0.0,
                    frame: FramePattern::Gradient,
                },
            ],
            realtime: true,
            fail_first_connects: 0,
            disconnect_after: None,
        }
    }
}

impl SyntheticConfig {
    fn scene_at(&self, offset: Duration) -> Option<&SyntheticScene> {
        let total: Duration = self.scenes.iter().map(|s| s.duration).sum();
        if total.is_zero() {
            return None;
        }
        let mut rem = Duration::from_nanos((offset.as_nanos() % total.as_nanos()) as u64);
        for scene in &self.scenes {
            if rem < scene.duration {
                return Some(scene);
            }
            rem -= scene.duration;
        }
        self.scenes.last()
    }

    fn interval(&self, stream: StreamKind) -> Duration {
        match stream {
            StreamKind::Audio => self.audio_chunk,
            StreamKind::Video => self.frame_interval,
        }
        .max(Duration::from_millis(1))
    }
}

/// Capture source producing both streams from a `SyntheticConfig` script.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    config: Arc<SyntheticConfig>,
    connects: Arc<AtomicU32>,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config: Arc::new(config),
            connects: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Total `connect` calls so far, including failed ones.
    pub fn connect_attempts(&self) -> u32 {
        self.connects.load(Ordering::Relaxed)
    }
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self::new(SyntheticConfig::default())
    }
}

impl CaptureSource for SyntheticSource {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn streams(&self) -> &[StreamKind] {
        &StreamKind::ALL
    }

    fn connect(&self, clock: PipelineClock) -> Result<Box<dyn CaptureSession>> {
        let attempt = self.connects.fetch_add(1, Ordering::Relaxed);
        if attempt < self.config.fail_first_connects {
            return Err(VigilError::CaptureUnavailable(format!(
                "synthetic connect {} of {} scripted to fail",
                attempt + 1,
                self.config.fail_first_connects
            )));
        }
        let started = Instant::now();
        Ok(Box::new(SyntheticSession {
            config: Arc::clone(&self.config),
            start_ns: clock.at(started),
            started,
            emitted: [0, 0],
            delivered: 0,
            noise: NoiseGen::new(0x9E37_79B9_7F4A_7C15 ^ attempt as u64),
        }))
    }
}

struct SyntheticSession {
    config: Arc<SyntheticConfig>,
    start_ns: u64,
    started: Instant,
    emitted: [u64; 2],
    delivered: u64,
    noise: NoiseGen,
}

impl SyntheticSession {
    fn index(stream: StreamKind) -> usize {
        match stream {
            StreamKind::Audio => 0,
            StreamKind::Video => 1,
        }
    }

    fn audio_payload(&mut self, offset: Duration) -> Vec<u8> {
        let rate = self.config.sample_rate.max(1);
        let n = ((rate as u128 * self.config.audio_chunk.as_micros()) / 1_000_000).max(1) as usize;
        let scene = self.config.scene_at(offset).cloned();
        let t0 = offset.as_secs_f64();
        let samples: Vec<f32> = (0..n)
            .map(|i| {
                let Some(scene) = scene.as_ref() else {
                    return 0.0;
                };
                let t = t0 + i as f64 / rate as f64;
                let tone = scene.amplitude
                    * (2.0 * std::f64::consts::PI * scene.tone_hz as f64 * t).sin() as f32;
                let noise = scene.noise * self.noise.next_signed();
                (tone + noise).clamp(-1.0, 1.0)
            })
            .collect();
        encode_pcm16(&samples)
    }

    fn video_payload(&self, offset: Duration, frame_index: u64) -> Vec<u8> {
        let (w, h) = (self.config.width.max(1), self.config.height.max(1));
        let pattern = self
            .config
            .scene_at(offset)
            .map(|s| s.frame)
            .unwrap_or(FramePattern::Flat(0));
        let mut frame = Vec::with_capacity((w * h) as usize);
        for y in 0..h {
            for x in 0..w {
                let luma = match pattern {
                    FramePattern::Flat(v) => v,
                    FramePattern::Gradient => {
                        (((x as u64 + frame_index) % w as u64) * 255 / (w as u64 - 1).max(1)) as u8
                    }
                    FramePattern::Checker(cell) => {
                        let cell = cell.max(1) as u32;
                        let on = ((x / cell + y / cell) as u64 + frame_index) % 2 == 0;
                        if on {
                            230
                        } else {
                            20
                        }
                    }
                };
                frame.push(luma);
            }
        }
        frame
    }
}

impl CaptureSession for SyntheticSession {
    fn next(&mut self, stream: StreamKind, max_wait: Duration) -> Result<ChunkRead> {
        if let Some(limit) = self.config.disconnect_after {
            if self.delivered >= limit {
                return Err(VigilError::Disconnected(format!(
                    "synthetic session ended after {limit} chunks"
                )));
            }
        }

        let idx = Self::index(stream);
        let seq = self.emitted[idx];
        let offset =
            Duration::from_nanos(duration_ns(self.config.interval(stream)).saturating_mul(seq));

        if self.config.realtime {
            let due = self.started + offset;
            let now = Instant::now();
            if due > now {
                let wait = due - now;
                if wait > max_wait {
                    std::thread::sleep(max_wait);
                    return Ok(ChunkRead::Unavailable);
                }
                std::thread::sleep(wait);
            }
        }

        let payload = match stream {
            StreamKind::Audio => self.audio_payload(offset),
            StreamKind::Video => self.video_payload(offset, seq),
        };
        self.emitted[idx] += 1;
        self.delivered += 1;
        Ok(ChunkRead::Chunk(RawChunk::new(
            stream,
            self.start_ns + duration_ns(offset),
            payload,
        )))
    }

    fn close(&mut self) {}
}

/// xorshift64* noise in [-1, 1].
struct NoiseGen(u64);

impl NoiseGen {
    fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    fn next_signed(&mut self) -> f32 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        let v = x.wrapping_mul(0x2545_F491_4F6C_DD1D) >> 40;
        (v as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
    }
}
