//! Fixed-ratio sample-rate conversion for microphone capture.
//!
//! Input devices run at their native rate (44.1 or 48 kHz is typical) while
//! the audio feature extractor expects `EngineConfig::audio_sample_rate`.
//! Conversion happens on the capture session's thread, never in the device
//! callback.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{debug, error};

use crate::error::{Result, VigilError};

/// Mono f32 resampler that buffers partial input blocks between calls.
pub struct RateConverter {
    // None when both rates match.
    resampler: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
    block: usize,
    out: Vec<Vec<f32>>,
}

impl RateConverter {
    /// `block` is the number of input frames handed to rubato per call.
    ///
    /// # Errors
    /// Returns `VigilError::AudioDevice` if rubato rejects the ratio.
    pub fn new(from_rate: u32, to_rate: u32, block: usize) -> Result<Self> {
        let block = block.max(1);
        if from_rate == to_rate {
            return Ok(Self {
                resampler: None,
                pending: Vec::new(),
                block,
                out: Vec::new(),
            });
        }

        let resampler = FastFixedIn::<f32>::new(
            to_rate as f64 / from_rate as f64,
            1.0,
            PolynomialDegree::Cubic,
            block,
            1,
        )
        .map_err(|e| VigilError::AudioDevice(format!("resampler init: {e}")))?;

        let out = vec![vec![0f32; resampler.output_frames_max()]; 1];
        debug!(from_rate, to_rate, block, "microphone resampling enabled");

        Ok(Self {
            resampler: Some(resampler),
            pending: Vec::new(),
            block,
            out,
        })
    }

    /// Feed captured samples and return whatever converted output is ready.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(resampler) = self.resampler.as_mut() else {
            return samples.to_vec();
        };

        self.pending.extend_from_slice(samples);
        let mut converted = Vec::new();
        let mut consumed = 0;
        while self.pending.len() - consumed >= self.block {
            let input = &self.pending[consumed..consumed + self.block];
            match resampler.process_into_buffer(&[input], &mut self.out, None) {
                Ok((_, produced)) => converted.extend_from_slice(&self.out[0][..produced]),
                Err(e) => error!("resampler error: {e}"),
            }
            consumed += self.block;
        }
        self.pending.drain(..consumed);
        converted
    }

    /// Samples waiting for a full input block.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}
