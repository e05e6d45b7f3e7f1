//! Audio descriptors: level, zero crossings and FFT band statistics.

use rustfft::{num_complex::Complex, FftPlanner};

use crate::buffering::chunk::{decode_pcm16, StreamKind};
use crate::error::FeatureError;
use crate::features::FeatureConfig;

/// Order of `FeatureVector::audio_features`.
pub const AUDIO_FEATURES: [&str; 11] = [
    "rms",
    "energy",
    "mean",
    "std",
    "peak",
    "zero_crossing_rate",
    "spectral_centroid",
    "spectral_rolloff",
    "band_low",
    "band_mid",
    "band_high",
];

/// Validate and decode a 16-bit LE mono payload.
pub fn decode(payload: &[u8], expected_samples: Option<usize>) -> Result<Vec<f32>, FeatureError> {
    if payload.is_empty() {
        return Err(FeatureError::EmptyPayload(StreamKind::Audio));
    }
    if payload.len() % 2 != 0 {
        return Err(FeatureError::OddAudioLength(payload.len()));
    }
    if let Some(n) = expected_samples {
        if payload.len() != n * 2 {
            return Err(FeatureError::AudioLengthMismatch {
                expected: n * 2,
                actual: payload.len(),
            });
        }
    }
    Ok(decode_pcm16(payload))
}

/// Compute `AUDIO_FEATURES` for `samples`. Spectral frequencies are reported
/// as a fraction of Nyquist.
pub fn describe(samples: &[f32], config: &FeatureConfig, planner: &mut FftPlanner<f32>) -> Vec<f32> {
    let n = samples.len();
    if n == 0 {
        return vec![0.0; AUDIO_FEATURES.len()];
    }
    let nf = n as f32;

    let mean = samples.iter().sum::<f32>() / nf;
    let energy = samples.iter().map(|s| s * s).sum::<f32>() / nf;
    let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f32>() / nf;
    let peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
    let zcr = if n > 1 {
        samples
            .windows(2)
            .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
            .count() as f32
            / (n - 1) as f32
    } else {
        0.0
    };

    let spectral = spectrum(samples, config, planner);

    vec![
        energy.sqrt(),
        energy,
        mean,
        variance.sqrt(),
        peak,
        zcr,
        spectral.centroid,
        spectral.rolloff,
        spectral.bands[0],
        spectral.bands[1],
        spectral.bands[2],
    ]
}

#[derive(Debug, Default)]
struct Spectral {
    centroid: f32,
    rolloff: f32,
    bands: [f32; 3],
}

fn spectrum(samples: &[f32], config: &FeatureConfig, planner: &mut FftPlanner<f32>) -> Spectral {
    let n = samples.len();
    let fft = planner.plan_fft_forward(n);
    let mut buf: Vec<Complex<f32>> = samples.iter().map(|s| Complex::new(*s, 0.0)).collect();
    fft.process(&mut buf);

    let bins = n / 2 + 1;
    let bin_hz = config.audio_sample_rate as f32 / n as f32;
    let nyquist = config.audio_sample_rate as f32 / 2.0;
    let power: Vec<f32> = buf[..bins].iter().map(|c| c.norm_sqr()).collect();
    let total: f32 = power.iter().sum();
    if total <= f32::EPSILON {
        return Spectral::default();
    }

    let magnitude_sum: f32 = power.iter().map(|p| p.sqrt()).sum();
    let centroid = power
        .iter()
        .enumerate()
        .map(|(k, p)| k as f32 * bin_hz * p.sqrt())
        .sum::<f32>()
        / magnitude_sum;

    let threshold = total * config.rolloff;
    let mut cumulative = 0.0;
    let mut rolloff_bin = bins - 1;
    for (k, p) in power.iter().enumerate() {
        cumulative += p;
        if cumulative >= threshold {
            rolloff_bin = k;
            break;
        }
    }

    let mut bands = [0.0f32; 3];
    for (k, p) in power.iter().enumerate() {
        let hz = k as f32 * bin_hz;
        let idx = if hz < config.low_band_hz {
            0
        } else if hz < config.high_band_hz {
            1
        } else {
            2
        };
        bands[idx] += p;
    }
    for b in &mut bands {
        *b /= total;
    }

    Spectral {
        centroid: (centroid / nyquist).clamp(0.0, 1.0),
        rolloff: (rolloff_bin as f32 * bin_hz / nyquist).clamp(0.0, 1.0),
        bands,
    }
}
