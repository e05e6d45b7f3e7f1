//! Microphone / loopback audio capture via cpal.
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It must not block or perform I/O, so it only downmixes to mono and pushes
//! into a lock-free SPSC ring. The capture session drains that ring on its
//! producer thread, resamples, and cuts fixed-length PCM chunks.
//!
//! `cpal::Stream` is `!Send` on most platforms. Sessions are therefore opened
//! and dropped on the same producer thread, which `CaptureSession` allows.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
#[cfg(feature = "audio-cpal")]
use tracing::info;

use crate::buffering::chunk::{encode_pcm16, RawChunk, StreamKind};
use crate::buffering::{create_audio_ring, AudioConsumer, AudioProducer, Consumer};
use crate::capture::device::DevicePreference;
use crate::capture::resample::RateConverter;
use crate::capture::{CaptureSession, CaptureSource, ChunkRead};
use crate::clock::{deadline_after, duration_ns, PipelineClock};
use crate::error::{Result, VigilError};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Settings for `MicrophoneSource`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MicrophoneConfig {
    /// Exact device name to open. Falls back to `preference` when absent or missing.
    pub device: Option<String>,
    pub preference: DevicePreference,
    /// Output sample rate of emitted chunks (Hz).
    pub sample_rate: u32,
    /// Audio length of each emitted chunk.
    #[serde(with = "crate::engine::duration_ms")]
    pub chunk: Duration,
    /// Ring capacity in samples between the device callback and the session.
    pub ring_capacity: usize,
}

impl Default for MicrophoneConfig {
    fn default() -> Self {
        Self {
            device: None,
            preference: DevicePreference::Microphone,
            sample_rate: 16_000,
            chunk: Duration::from_millis(500),
            ring_capacity: crate::buffering::RING_CAPACITY,
        }
    }
}

impl MicrophoneConfig {
    fn chunk_samples(&self) -> usize {
        ((self.sample_rate as u128 * self.chunk.as_millis()) / 1000).max(1) as usize
    }
}

/// Audio-only capture source backed by the host input device.
#[derive(Debug, Clone, Default)]
pub struct MicrophoneSource {
    config: MicrophoneConfig,
}

impl MicrophoneSource {
    pub fn new(config: MicrophoneConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MicrophoneConfig {
        &self.config
    }
}

impl CaptureSource for MicrophoneSource {
    fn name(&self) -> &str {
        "microphone"
    }

    fn streams(&self) -> &[StreamKind] {
        &[StreamKind::Audio]
    }

    fn connect(&self, clock: PipelineClock) -> Result<Box<dyn CaptureSession>> {
        let (producer, consumer) = create_audio_ring(self.config.ring_capacity);
        let capture = DeviceCapture::open(&self.config, producer)?;
        let converter = RateConverter::new(
            capture.sample_rate,
            self.config.sample_rate,
            (capture.sample_rate / 50).max(1) as usize,
        )?;
        Ok(Box::new(MicrophoneSession {
            capture,
            consumer,
            converter,
            clock,
            chunk_samples: self.config.chunk_samples(),
            sample_rate: self.config.sample_rate,
            converted: Vec::new(),
            read_buf: vec![0.0; 4096],
        }))
    }
}

struct MicrophoneSession {
    capture: DeviceCapture,
    consumer: AudioConsumer,
    converter: RateConverter,
    clock: PipelineClock,
    chunk_samples: usize,
    sample_rate: u32,
    converted: Vec<f32>,
    read_buf: Vec<f32>,
}

impl MicrophoneSession {
    fn drain_ring(&mut self) {
        loop {
            let n = self.consumer.pop_slice(&mut self.read_buf);
            if n == 0 {
                break;
            }
            let out = self.converter.process(&self.read_buf[..n]);
            self.converted.extend_from_slice(&out);
        }
    }

    fn samples_to_ns(&self, samples: usize) -> u64 {
        duration_ns(Duration::from_secs_f64(
            samples as f64 / self.sample_rate.max(1) as f64,
        ))
    }
}

impl CaptureSession for MicrophoneSession {
    fn next(&mut self, stream: StreamKind, max_wait: Duration) -> Result<ChunkRead> {
        if stream != StreamKind::Audio {
            return Err(VigilError::UnsupportedStream(stream));
        }
        let deadline = deadline_after(max_wait);
        loop {
            if self.capture.failed.load(Ordering::Acquire) {
                return Err(VigilError::Disconnected("input device reported an error".into()));
            }
            self.drain_ring();
            if self.converted.len() >= self.chunk_samples {
                // Chunk timestamp marks its first sample.
                let behind = self.samples_to_ns(self.converted.len());
                let timestamp = self.clock.now_ns().saturating_sub(behind);
                let pcm: Vec<f32> = self.converted.drain(..self.chunk_samples).collect();
                return Ok(ChunkRead::Chunk(RawChunk::audio(
                    timestamp,
                    encode_pcm16(&pcm),
                )));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(ChunkRead::Unavailable);
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    fn close(&mut self) {
        self.capture.stop();
    }
}

/// Live cpal input stream feeding an `AudioProducer`.
struct DeviceCapture {
    #[cfg(feature = "audio-cpal")]
    _stream: cpal::Stream,
    running: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    sample_rate: u32,
}

impl DeviceCapture {
    fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

#[cfg(feature = "audio-cpal")]
impl DeviceCapture {
    fn open(config: &MicrophoneConfig, producer: AudioProducer) -> Result<Self> {
        use cpal::traits::{DeviceTrait, StreamTrait};
        use cpal::SampleFormat;

        let device = select_device(config)?;
        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| VigilError::CaptureUnavailable(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels().max(1) as usize;
        let stream_config = cpal::StreamConfig {
            channels: supported.channels(),
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        info!(sample_rate, channels, "input stream config selected");

        let running = Arc::new(AtomicBool::new(true));
        let failed = Arc::new(AtomicBool::new(false));

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_stream::<f32>(
                &device,
                &stream_config,
                channels,
                producer,
                &running,
                &failed,
                |s| s,
            ),
            SampleFormat::I16 => build_stream::<i16>(
                &device,
                &stream_config,
                channels,
                producer,
                &running,
                &failed,
                |s| s as f32 / 32768.0,
            ),
            SampleFormat::U8 => build_stream::<u8>(
                &device,
                &stream_config,
                channels,
                producer,
                &running,
                &failed,
                |s| (s as f32 - 128.0) / 128.0,
            ),
            other => {
                return Err(VigilError::AudioStream(format!(
                    "unsupported sample format: {other:?}"
                )))
            }
        }?;

        stream
            .play()
            .map_err(|e| VigilError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            running,
            failed,
            sample_rate,
        })
    }
}

#[cfg(not(feature = "audio-cpal"))]
impl DeviceCapture {
    fn open(_config: &MicrophoneConfig, _producer: AudioProducer) -> Result<Self> {
        Err(VigilError::CaptureUnavailable(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

#[cfg(feature = "audio-cpal")]
fn select_device(config: &MicrophoneConfig) -> Result<cpal::Device> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();

    if let Some(wanted) = config.device.as_deref() {
        let found = host
            .input_devices()
            .ok()
            .and_then(|mut devices| devices.find(|d| d.name().map(|n| n == wanted).unwrap_or(false)));
        match found {
            Some(device) => return Ok(device),
            None => tracing::warn!("input device '{wanted}' not found, falling back"),
        }
    }

    if config.preference == DevicePreference::SystemAudio {
        let ranked = crate::capture::device::list_input_devices(config.preference);
        if let Some(best) = ranked.into_iter().find(|d| d.is_recommended && d.is_loopback) {
            if let Some(device) = host
                .input_devices()
                .ok()
                .and_then(|mut devices| devices.find(|d| d.name().map(|n| n == best.name).unwrap_or(false)))
            {
                return Ok(device);
            }
        }
        tracing::warn!("no system audio device found, using default input");
    }

    if let Some(device) = host.default_input_device() {
        return Ok(device);
    }
    host.input_devices()
        .map_err(|e| VigilError::AudioDevice(e.to_string()))?
        .next()
        .ok_or_else(|| VigilError::CaptureUnavailable("no input device available".into()))
}

#[cfg(feature = "audio-cpal")]
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: usize,
    mut producer: AudioProducer,
    running: &Arc<AtomicBool>,
    failed: &Arc<AtomicBool>,
    to_f32: fn(T) -> f32,
) -> Result<cpal::Stream>
where
    T: cpal::SizedSample + 'static,
{
    use crate::buffering::Producer;
    use cpal::traits::DeviceTrait;

    let running = Arc::clone(running);
    let failed = Arc::clone(failed);
    let mut mono: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                let frames = data.len() / channels;
                mono.resize(frames, 0.0);
                for (f, slot) in mono.iter_mut().enumerate() {
                    let base = f * channels;
                    let sum: f32 = data[base..base + channels].iter().map(|s| to_f32(*s)).sum();
                    *slot = sum / channels as f32;
                }
                let written = producer.push_slice(&mono);
                if written < mono.len() {
                    tracing::warn!("capture ring full: dropped {} frames", mono.len() - written);
                }
            },
            move |err| {
                tracing::error!("input stream error: {err}");
                failed.store(true, Ordering::Release);
            },
            None,
        )
        .map_err(|e| VigilError::AudioStream(e.to_string()))
}
