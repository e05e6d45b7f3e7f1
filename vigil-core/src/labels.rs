//! Activity labels and the configured closed label set.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VigilError};

/// A string-identified activity category, e.g. `"idle"` or `"video_call"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActivityLabel(String);

impl ActivityLabel {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActivityLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActivityLabel {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ActivityLabel {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The closed set of labels a deployment accepts, plus the label used for
/// "no reliable signal" (startup and stalls).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSet {
    pub labels: Vec<ActivityLabel>,
    pub unknown: ActivityLabel,
}

impl LabelSet {
    pub fn new(labels: impl IntoIterator<Item = ActivityLabel>, unknown: ActivityLabel) -> Self {
        let mut labels: Vec<ActivityLabel> = labels.into_iter().collect();
        if !labels.contains(&unknown) {
            labels.push(unknown.clone());
        }
        Self { labels, unknown }
    }

    pub fn contains(&self, label: &ActivityLabel) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    pub fn is_unknown(&self, label: &ActivityLabel) -> bool {
        &self.unknown == label
    }

    pub fn validate(&self) -> Result<()> {
        if self.labels.is_empty() {
            return Err(VigilError::Config("label set is empty".into()));
        }
        if !self.contains(&self.unknown) {
            return Err(VigilError::Config(format!(
                "unknown label '{}' is not part of the label set",
                self.unknown
            )));
        }
        Ok(())
    }
}

impl Default for LabelSet {
    fn default() -> Self {
        Self::new(
            ["idle", "reading", "browsing", "video", "video_call"]
                .into_iter()
                .map(ActivityLabel::from),
            ActivityLabel::from("unknown"),
        )
    }
}
