//! Threshold rules over audio energy and frame statistics.
//!
//! Loud audio dominates: high zero-crossing rate reads as a call, otherwise
//! as media playback. Quiet audio falls back to frame statistics. A final
//! combined rule upgrades to a call when the frame varies and there is
//! moderate sound.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::classifier::ActivityClassifier;
use crate::error::{Result, VigilError};
use crate::features::FeatureVector;
use crate::ipc::events::Classification;
use crate::labels::{ActivityLabel, LabelSet};

/// Thresholds and output labels for `RuleClassifier`.
///
/// Luma thresholds are on the [0, 1] scale of the video features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuleSet {
    pub loud_energy: f32,
    pub speech_zcr: f32,
    pub static_std: f32,
    pub dark_mean: f32,
    pub busy_std: f32,
    pub combined_std: f32,
    pub combined_energy: f32,
    pub idle: ActivityLabel,
    pub reading: ActivityLabel,
    pub browsing: ActivityLabel,
    pub video: ActivityLabel,
    pub video_call: ActivityLabel,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            loud_energy: 0.1,
            speech_zcr: 0.2,
            static_std: 20.0 / 255.0,
            dark_mean: 100.0 / 255.0,
            busy_std: 50.0 / 255.0,
            combined_std: 30.0 / 255.0,
            combined_energy: 0.05,
            idle: "idle".into(),
            reading: "reading".into(),
            browsing: "browsing".into(),
            video: "video".into(),
            video_call: "video_call".into(),
        }
    }
}

/// Default classifier: deterministic, instant, and model-free.
#[derive(Debug, Clone, Default)]
pub struct RuleClassifier {
    rules: RuleSet,
}

impl RuleClassifier {
    pub fn new(rules: RuleSet) -> Self {
        Self { rules }
    }

    /// Pick a label and confidence without building the distribution.
    pub fn decide(&self, features: &FeatureVector) -> (ActivityLabel, f32) {
        let r = &self.rules;
        let energy = features.get("energy").unwrap_or(0.0);
        let zcr = features.get("zero_crossing_rate").unwrap_or(0.0);
        let std = features.get("luma_std").unwrap_or(0.0);
        let mean = features.get("luma_mean").unwrap_or(0.0);

        let (mut label, mut confidence) = if energy > r.loud_energy {
            if zcr > r.speech_zcr {
                (&r.video_call, (0.7 + energy).min(0.95))
            } else {
                (&r.video, (0.65 + energy).min(0.9))
            }
        } else if std < r.static_std {
            if mean < r.dark_mean {
                (&r.idle, 0.8)
            } else {
                (&r.reading, 0.7)
            }
        } else if std > r.busy_std {
            (&r.video, 0.75)
        } else {
            (&r.browsing, 0.65)
        };

        if std > r.combined_std && energy > r.combined_energy {
            label = &r.video_call;
            confidence = 0.85;
        }
        (label.clone(), confidence)
    }
}

impl ActivityClassifier for RuleClassifier {
    fn name(&self) -> &str {
        "rules"
    }

    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }

    fn classify(
        &mut self,
        features: &FeatureVector,
        labels: &LabelSet,
        _timeout: Duration,
    ) -> Result<Classification> {
        let (label, confidence) = self.decide(features);
        if !labels.contains(&label) {
            return Err(VigilError::Classifier(format!(
                "rule label '{label}' is not in the configured label set"
            )));
        }
        Ok(Classification::with_uniform_remainder(
            features.timestamp,
            label,
            confidence,
            &labels.labels,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{AUDIO_FEATURES, VIDEO_FEATURES};

    fn vector(pairs: &[(&str, f32)]) -> FeatureVector {
        let mut fv = FeatureVector {
            timestamp: 42,
            audio_features: vec![0.0; AUDIO_FEATURES.len()],
            video_features: vec![0.0; VIDEO_FEATURES.len()],
        };
        for (name, value) in pairs {
            if let Some(i) = AUDIO_FEATURES.iter().position(|n| n == name) {
                fv.audio_features[i] = *value;
            } else if let Some(i) = VIDEO_FEATURES.iter().position(|n| n == name) {
                fv.video_features[i] = *value;
            }
        }
        fv
    }

    fn decide(pairs: &[(&str, f32)]) -> (String, f32) {
        let (label, conf) = RuleClassifier::default().decide(&vector(pairs));
        (label.to_string(), conf)
    }

    #[test]
    fn dark_static_frame_is_idle() {
        assert_eq!(decide(&[("luma_mean", 0.1)]), ("idle".into(), 0.8));
    }

    #[test]
    fn bright_static_frame_is_reading() {
        assert_eq!(decide(&[("luma_mean", 0.8)]), ("reading".into(), 0.7));
    }

    #[test]
    fn frame_variation_picks_video_or_browsing() {
        assert_eq!(decide(&[("luma_std", 0.3)]).0, "video");
        assert_eq!(decide(&[("luma_std", 0.15)]).0, "browsing");
    }

    #[test]
    fn loud_audio_dominates() {
        let (label, conf) = decide(&[("energy", 0.2), ("zero_crossing_rate", 0.4)]);
        assert_eq!(label, "video_call");
        assert!((conf - 0.9).abs() < 1e-6);
        let (label, _) = decide(&[("energy", 0.2), ("zero_crossing_rate", 0.05)]);
        assert_eq!(label, "video");
    }

    #[test]
    fn combined_rule_overrides() {
        assert_eq!(
            decide(&[("energy", 0.06), ("luma_std", 0.25)]),
            ("video_call".into(), 0.85)
        );
    }

    #[test]
    fn classification_carries_timestamp_and_distribution() {
        let labels = LabelSet::default();
        let c = RuleClassifier::default()
            .classify(&vector(&[]), &labels, Duration::from_secs(1))
            .unwrap();
        assert_eq!(c.timestamp, 42);
        assert_eq!(c.label.as_str(), "idle");
        assert_eq!(c.distribution.len(), labels.labels.len());
        let total: f32 = c.distribution.values().sum();
        assert!((total - 1.0).abs() < 1e-5);
    }

    #[test]
    fn label_outside_set_is_an_error() {
        let labels = LabelSet::new([ActivityLabel::from("working")], "unknown".into());
        assert!(RuleClassifier::default()
            .classify(&vector(&[]), &labels, Duration::from_secs(1))
            .is_err());
    }
}
