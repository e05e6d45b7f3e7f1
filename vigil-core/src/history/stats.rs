//! Aggregate statistics over a slice of history.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::VigilError;
use crate::ipc::events::ActivityRecord;
use crate::labels::ActivityLabel;

/// Look-back window for statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    #[default]
    Day,
    Week,
    Month,
}

impl Period {
    pub fn duration(self) -> Duration {
        const DAY: u64 = 24 * 60 * 60;
        Duration::from_secs(match self {
            Period::Day => DAY,
            Period::Week => 7 * DAY,
            Period::Month => 30 * DAY,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Period::Day => "day",
            Period::Week => "week",
            Period::Month => "month",
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Period {
    type Err = VigilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "day" => Ok(Period::Day),
            "week" => Ok(Period::Week),
            "month" => Ok(Period::Month),
            other => Err(VigilError::Config(format!("unknown period '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelStats {
    pub count: u64,
    pub total_ns: u64,
    pub mean_ns: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityStats {
    pub from: u64,
    pub to: u64,
    pub total_records: u64,
    pub total_ns: u64,
    pub mean_ns: u64,
    pub labels: BTreeMap<ActivityLabel, LabelStats>,
}

/// Summarize `records` over `[from, to)`. Durations are clipped to the window.
pub fn summarize(records: &[ActivityRecord], from: u64, to: u64) -> ActivityStats {
    let mut stats = ActivityStats {
        from,
        to,
        ..ActivityStats::default()
    };
    for record in records.iter().filter(|r| r.overlaps(from, to)) {
        let clipped = record
            .ended_at
            .min(to)
            .saturating_sub(record.started_at.max(from));
        let entry = stats.labels.entry(record.label.clone()).or_default();
        entry.count += 1;
        entry.total_ns += clipped;
        stats.total_records += 1;
        stats.total_ns += clipped;
    }
    for entry in stats.labels.values_mut() {
        entry.mean_ns = entry.total_ns / entry.count.max(1);
    }
    stats.mean_ns = stats.total_ns / stats.total_records.max(1);
    stats
}
