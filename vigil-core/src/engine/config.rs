use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capture::backoff::BackoffPolicy;
use crate::error::{Result, VigilError};
use crate::features::FeatureConfig;
use crate::history::SinkRetry;
use crate::labels::LabelSet;
use crate::stability::StabilityConfig;
use crate::sync::SyncConfig;

use super::duration_ms;

/// Configuration for `VigilEngine`.
///
/// Every value is tunable. Defaults are conservative values suited to local
/// development against the synthetic source, not production recommendations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    pub labels: LabelSet,
    /// Largest audio/video timestamp difference accepted when pairing.
    #[serde(with = "duration_ms")]
    pub skew_max: Duration,
    /// Unpaired chunks held per stream by the synchronizer.
    pub sync_capacity: usize,
    /// Depth of each producer → coordinator chunk channel (drop-oldest).
    pub chunk_channel_capacity: usize,
    pub confirm_count: u32,
    pub high_confidence_override: f32,
    #[serde(with = "duration_ms")]
    pub stall_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub classifier_timeout: Duration,
    /// How long shutdown waits for an in-flight classification.
    #[serde(with = "duration_ms")]
    pub shutdown_grace: Duration,
    /// Longest a producer blocks in one capture read.
    #[serde(with = "duration_ms")]
    pub capture_max_wait: Duration,
    pub reconnect: BackoffPolicy,
    pub sink_retry: BackoffPolicy,
    /// Consecutive failed history writes tolerated before reporting degraded.
    pub sink_retry_budget: u32,
    /// Coordinator housekeeping interval (timeouts, stall check, sink retry).
    #[serde(with = "duration_ms")]
    pub tick: Duration,
    pub features: FeatureConfig,
    /// Incidents kept by the error journal.
    pub journal_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            labels: LabelSet::default(),
            skew_max: Duration::from_millis(250),
            sync_capacity: 32,
            chunk_channel_capacity: 16,
            confirm_count: 3,
            high_confidence_override: 0.9,
            stall_timeout: Duration::from_secs(30),
            classifier_timeout: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(2),
            capture_max_wait: Duration::from_millis(200),
            reconnect: BackoffPolicy::default(),
            sink_retry: BackoffPolicy::new(Duration::from_millis(200), Duration::from_secs(10), 2.0),
            sink_retry_budget: 5,
            tick: Duration::from_millis(50),
            features: FeatureConfig::default(),
            journal_capacity: 100,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.labels.validate()?;
        self.features.validate()?;
        if self.confirm_count == 0 {
            return Err(VigilError::Config("confirmCount must be at least 1".into()));
        }
        if !(self.high_confidence_override > 0.0 && self.high_confidence_override <= 1.0) {
            return Err(VigilError::Config(
                "highConfidenceOverride must be in (0, 1]".into(),
            ));
        }
        for (name, value) in [
            ("skewMax", self.skew_max),
            ("stallTimeout", self.stall_timeout),
            ("classifierTimeout", self.classifier_timeout),
            ("captureMaxWait", self.capture_max_wait),
            ("tick", self.tick),
        ] {
            if value.is_zero() {
                return Err(VigilError::Config(format!("{name} must be non-zero")));
            }
        }
        if self.sync_capacity == 0 || self.chunk_channel_capacity == 0 {
            return Err(VigilError::Config("buffer capacities must be positive".into()));
        }
        if self.journal_capacity == 0 {
            return Err(VigilError::Config("journalCapacity must be positive".into()));
        }
        Ok(())
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            skew_max: self.skew_max,
            capacity: self.sync_capacity,
        }
    }

    pub fn stability_config(&self) -> StabilityConfig {
        StabilityConfig {
            confirm_count: self.confirm_count,
            high_confidence_override: self.high_confidence_override,
            stall_timeout: self.stall_timeout,
        }
    }

    pub fn history_retry(&self) -> SinkRetry {
        SinkRetry {
            backoff: self.sink_retry,
            budget: self.sink_retry_budget,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn history_retry_carries_sink_settings() {
        let mut cfg = EngineConfig::default();
        cfg.sink_retry = BackoffPolicy::new(Duration::from_millis(5), Duration::from_millis(80), 1.5);
        cfg.sink_retry_budget = 7;
        assert_eq!(
            cfg.history_retry(),
            SinkRetry {
                backoff: BackoffPolicy::new(Duration::from_millis(5), Duration::from_millis(80), 1.5),
                budget: 7,
            }
        );
        assert_ne!(cfg.history_retry(), SinkRetry::default());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"confirmCount":5,"stallTimeout":1500}"#).unwrap();
        assert_eq!(cfg.confirm_count, 5);
        assert_eq!(cfg.stall_timeout, Duration::from_millis(1500));
        assert_eq!(cfg.skew_max, Duration::from_millis(250));
        assert_eq!(cfg.labels, LabelSet::default());
    }

    #[test]
    fn durations_serialize_as_millis() {
        let value = serde_json::to_value(EngineConfig::default()).unwrap();
        assert_eq!(value["classifierTimeout"], 2000);
        assert_eq!(value["reconnect"]["initial"], 250);
    }

    #[test]
    fn rejects_bad_values() {
        let mut cfg = EngineConfig::default();
        cfg.confirm_count = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.high_confidence_override = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.stall_timeout = Duration::ZERO;
        assert!(matches!(cfg.validate(), Err(VigilError::Config(msg)) if msg.contains("stallTimeout")));

        let mut cfg = EngineConfig::default();
        cfg.labels.labels.clear();
        assert!(cfg.validate().is_err());
    }
}
