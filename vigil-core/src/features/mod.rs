//! Sample → fixed-shape feature vector.
//!
//! Extraction is a pure function of the payload bytes and `FeatureConfig`.
//! Malformed payloads are rejected with a `FeatureError`; the coordinator
//! drops such samples without touching the stability engine.
//!
//! Layout (all values are scale-free, mostly in [0, 1]):
//!
//! | Slice | Names |
//! |-------|-------|
//! | audio | see `AUDIO_FEATURES` |
//! | video | see `VIDEO_FEATURES` |

pub mod audio;
pub mod video;

use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};

use crate::buffering::chunk::{RawChunk, Sample, StreamKind};
use crate::error::{FeatureError, Result, VigilError};

pub use audio::AUDIO_FEATURES;
pub use video::{PixelFormat, VIDEO_FEATURES};

/// Features for one synchronized sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureVector {
    pub timestamp: u64,
    pub audio_features: Vec<f32>,
    pub video_features: Vec<f32>,
}

impl FeatureVector {
    /// Look up a feature by name in either slice.
    pub fn get(&self, name: &str) -> Option<f32> {
        if let Some(i) = AUDIO_FEATURES.iter().position(|n| *n == name) {
            return self.audio_features.get(i).copied();
        }
        VIDEO_FEATURES
            .iter()
            .position(|n| *n == name)
            .and_then(|i| self.video_features.get(i).copied())
    }
}

/// Payload layout and spectral band edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FeatureConfig {
    /// Sample rate of 16-bit mono PCM audio payloads (Hz).
    pub audio_sample_rate: u32,
    /// Exact sample count per audio chunk; `None` accepts any even length.
    pub audio_samples: Option<usize>,
    pub video_width: u32,
    pub video_height: u32,
    pub pixel_format: PixelFormat,
    /// Upper edge of the low band (Hz).
    pub low_band_hz: f32,
    /// Lower edge of the high band (Hz).
    pub high_band_hz: f32,
    /// Spectral energy fraction used for the rolloff frequency.
    pub rolloff: f32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            audio_sample_rate: 16_000,
            audio_samples: None,
            video_width: 64,
            video_height: 48,
            pixel_format: PixelFormat::Gray8,
            low_band_hz: 300.0,
            high_band_hz: 3_000.0,
            rolloff: 0.85,
        }
    }
}

impl FeatureConfig {
    pub fn validate(&self) -> Result<()> {
        if self.audio_sample_rate == 0 {
            return Err(VigilError::Config("audio sample rate must be positive".into()));
        }
        if self.video_width == 0 || self.video_height == 0 {
            return Err(VigilError::Config("video dimensions must be positive".into()));
        }
        if !(self.low_band_hz > 0.0 && self.low_band_hz < self.high_band_hz) {
            return Err(VigilError::Config(
                "band edges must satisfy 0 < low_band_hz < high_band_hz".into(),
            ));
        }
        if !(self.rolloff > 0.0 && self.rolloff <= 1.0) {
            return Err(VigilError::Config("rolloff must be in (0, 1]".into()));
        }
        Ok(())
    }

    /// Bytes expected in one video payload.
    pub fn frame_bytes(&self) -> usize {
        self.video_width as usize * self.video_height as usize * self.pixel_format.bytes_per_pixel()
    }
}

/// Stateless apart from a cached FFT planner.
pub struct FeatureExtractor {
    config: FeatureConfig,
    planner: FftPlanner<f32>,
}

impl FeatureExtractor {
    pub fn new(config: FeatureConfig) -> Self {
        Self {
            config,
            planner: FftPlanner::new(),
        }
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    pub fn extract(&mut self, sample: &Sample) -> std::result::Result<FeatureVector, FeatureError> {
        expect_stream(&sample.audio, StreamKind::Audio)?;
        expect_stream(&sample.video, StreamKind::Video)?;

        let pcm = audio::decode(&sample.audio.payload, self.config.audio_samples)?;
        let luma = video::luma(
            &sample.video.payload,
            self.config.frame_bytes(),
            self.config.pixel_format,
        )?;

        Ok(FeatureVector {
            timestamp: sample.timestamp,
            audio_features: audio::describe(&pcm, &self.config, &mut self.planner),
            video_features: video::describe(
                &luma,
                self.config.video_width as usize,
                self.config.video_height as usize,
            ),
        })
    }
}

impl std::fmt::Debug for FeatureExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureExtractor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn expect_stream(chunk: &RawChunk, expected: StreamKind) -> std::result::Result<(), FeatureError> {
    if chunk.stream != expected {
        return Err(FeatureError::StreamMismatch {
            expected,
            actual: chunk.stream,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::chunk::encode_pcm16;

    fn config() -> FeatureConfig {
        FeatureConfig {
            video_width: 4,
            video_height: 2,
            ..FeatureConfig::default()
        }
    }

    fn sample(audio: Vec<u8>, video: Vec<u8>) -> Sample {
        Sample::new(RawChunk::audio(10, audio), RawChunk::video(12, video))
    }

    #[test]
    fn produces_fixed_shape_vector() {
        let mut ex = FeatureExtractor::new(config());
        let fv = ex
            .extract(&sample(encode_pcm16(&[0.1; 256]), vec![128; 8]))
            .unwrap();
        assert_eq!(fv.timestamp, 12);
        assert_eq!(fv.audio_features.len(), AUDIO_FEATURES.len());
        assert_eq!(fv.video_features.len(), VIDEO_FEATURES.len());
    }

    #[test]
    fn extraction_is_deterministic() {
        let mut ex = FeatureExtractor::new(config());
        let pcm: Vec<f32> = (0..512).map(|i| ((i * 7) % 13) as f32 / 13.0 - 0.5).collect();
        let s = sample(encode_pcm16(&pcm), (0..8).map(|i| i * 30).collect());
        assert_eq!(ex.extract(&s).unwrap(), ex.extract(&s).unwrap());
    }

    #[test]
    fn rejects_malformed_payloads() {
        let mut ex = FeatureExtractor::new(config());
        assert_eq!(
            ex.extract(&sample(vec![], vec![0; 8])),
            Err(FeatureError::EmptyPayload(StreamKind::Audio))
        );
        assert_eq!(
            ex.extract(&sample(vec![0; 3], vec![0; 8])),
            Err(FeatureError::OddAudioLength(3))
        );
        assert_eq!(
            ex.extract(&sample(vec![0; 4], vec![0; 7])),
            Err(FeatureError::VideoLengthMismatch {
                expected: 8,
                actual: 7
            })
        );
    }

    #[test]
    fn rejects_swapped_streams() {
        let mut ex = FeatureExtractor::new(config());
        let s = Sample {
            timestamp: 0,
            audio: RawChunk::video(0, vec![0; 8]),
            video: RawChunk::video(0, vec![0; 8]),
        };
        assert!(matches!(
            ex.extract(&s),
            Err(FeatureError::StreamMismatch { .. })
        ));
    }

    #[test]
    fn named_lookup_finds_both_slices() {
        let mut ex = FeatureExtractor::new(config());
        let fv = ex
            .extract(&sample(encode_pcm16(&[0.0; 64]), vec![255; 8]))
            .unwrap();
        assert_eq!(fv.get("rms"), Some(0.0));
        assert_eq!(fv.get("luma_mean"), Some(1.0));
        assert_eq!(fv.get("nope"), None);
    }

    #[test]
    fn config_validation() {
        assert!(FeatureConfig::default().validate().is_ok());
        let bad = FeatureConfig {
            low_band_hz: 4_000.0,
            ..FeatureConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
