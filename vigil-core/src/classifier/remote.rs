//! HTTP scoring service client.
//!
//! POSTs `{"features": FeatureVector, "labels": [...]}` and expects
//! `{"label": "...", "confidence": 0.8, "distribution": {...}}` back.
//! A missing distribution is filled in uniformly from the label set.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::classifier::ActivityClassifier;
use crate::error::{Result, VigilError};
use crate::features::FeatureVector;
use crate::ipc::events::Classification;
use crate::labels::{ActivityLabel, LabelSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RemoteClassifierConfig {
    pub endpoint: String,
    pub bearer_token: Option<String>,
}

impl Default for RemoteClassifierConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8765/classify".into(),
            bearer_token: None,
        }
    }
}

#[derive(Serialize)]
struct ScoreRequest<'a> {
    features: &'a FeatureVector,
    labels: &'a [ActivityLabel],
}

#[derive(Deserialize)]
struct ScoreResponse {
    label: ActivityLabel,
    confidence: f32,
    #[serde(default)]
    distribution: Option<BTreeMap<ActivityLabel, f32>>,
}

pub struct RemoteClassifier {
    config: RemoteClassifierConfig,
    client: Option<reqwest::blocking::Client>,
}

impl RemoteClassifier {
    pub fn new(config: RemoteClassifierConfig) -> Self {
        Self {
            config,
            client: None,
        }
    }

    fn client(&mut self) -> Result<&reqwest::blocking::Client> {
        if self.client.is_none() {
            let client = reqwest::blocking::Client::builder()
                .build()
                .map_err(|e| VigilError::Classifier(format!("http client build failed: {e}")))?;
            self.client = Some(client);
        }
        self.client
            .as_ref()
            .ok_or_else(|| VigilError::Classifier("http client unavailable".into()))
    }
}

impl ActivityClassifier for RemoteClassifier {
    fn name(&self) -> &str {
        "remote"
    }

    fn warm_up(&mut self) -> Result<()> {
        self.client()?;
        debug!(endpoint = %self.config.endpoint, "remote classifier ready");
        Ok(())
    }

    fn classify(
        &mut self,
        features: &FeatureVector,
        labels: &LabelSet,
        timeout: Duration,
    ) -> Result<Classification> {
        let endpoint = self.config.endpoint.clone();
        let token = self.config.bearer_token.clone();
        let client = self.client()?;

        let mut request = client.post(&endpoint).timeout(timeout).json(&ScoreRequest {
            features,
            labels: &labels.labels,
        });
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request.send().map_err(|e| {
            if e.is_timeout() {
                VigilError::ClassifierTimeout(timeout)
            } else {
                VigilError::Classifier(format!("scoring request failed: {e}"))
            }
        })?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "scoring service returned non-success status");
            return Err(VigilError::Classifier(format!(
                "scoring service returned {}",
                response.status()
            )));
        }

        let reply: ScoreResponse = response
            .json()
            .map_err(|e| VigilError::Classifier(format!("invalid scoring reply: {e}")))?;
        Ok(into_classification(features.timestamp, reply, labels))
    }
}

fn into_classification(timestamp: u64, reply: ScoreResponse, labels: &LabelSet) -> Classification {
    match reply.distribution {
        Some(distribution) if !distribution.is_empty() => Classification {
            timestamp,
            label: reply.label,
            confidence: reply.confidence.clamp(0.0, 1.0),
            distribution,
        },
        _ => Classification::with_uniform_remainder(
            timestamp,
            reply.label,
            reply.confidence,
            &labels.labels,
        ),
    }
}
