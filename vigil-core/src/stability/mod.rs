//! Debounced activity state machine.
//!
//! ## Rules
//!
//! ```text
//! same label as current      → refresh lastConfirmedAt, sampleCount += 1, clear streak
//! different label            → extend (or restart) the candidate streak
//!   streak >= confirm_count  ┐
//!   confidence >= override   ├→ close current as a record, open candidate
//!   manual request           ┘
//! no classification for stall_timeout → close current, open `unknown` (once)
//! ```
//!
//! Records are contiguous: a new state starts where the closed record ends,
//! at the last confirming sample of the old label. An `unknown` state opened
//! by a stall or at startup is stretched to the first classification that
//! ends the gap, so the gap itself becomes an explicit record. A stall gap
//! always reaches at least the instant the stall was detected, even when the
//! next classification carries an older timestamp.
//!
//! The engine is single-owner and clock-free: every call takes the current
//! pipeline time, which keeps it deterministic under test.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::classifier::Origin;
use crate::clock::duration_ns;
use crate::ipc::events::{ActivityRecord, ActivityState, Classification, TransitionCause};
use crate::labels::{ActivityLabel, LabelSet};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StabilityConfig {
    /// Consecutive differing classifications needed to switch label.
    pub confirm_count: u32,
    /// A single classification at or above this confidence switches immediately.
    pub high_confidence_override: f32,
    pub stall_timeout: Duration,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            confirm_count: 3,
            high_confidence_override: 0.9,
            stall_timeout: Duration::from_secs(30),
        }
    }
}

/// A change of current activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub cause: TransitionCause,
    /// `None` when the closed state had zero length and was an `unknown` placeholder.
    pub closed: Option<ActivityRecord>,
    pub current: ActivityState,
}

/// Why a classification was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    OutOfOrder { last: u64 },
    UnknownLabel,
}

/// Result of feeding one classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// Same label as current.
    Refreshed,
    /// A differing label that has not yet reached confirmation.
    Streak { label: ActivityLabel, count: u32 },
    Transition(Transition),
    Rejected(Rejection),
}

#[derive(Debug, Clone)]
struct Streak {
    label: ActivityLabel,
    count: u32,
}

pub struct StabilityEngine {
    config: StabilityConfig,
    labels: LabelSet,
    current: ActivityState,
    streak: Option<Streak>,
    last_timestamp: Option<u64>,
    last_heard_ns: u64,
    stalled: bool,
    // Current `unknown` state should be stretched by the next classification.
    open_gap: bool,
}

impl StabilityEngine {
    /// Start in the `unknown` state at `now_ns`.
    pub fn new(config: StabilityConfig, labels: LabelSet, now_ns: u64) -> Self {
        let current = ActivityState::new(labels.unknown.clone(), now_ns);
        Self {
            config,
            labels,
            current,
            streak: None,
            last_timestamp: None,
            last_heard_ns: now_ns,
            stalled: false,
            open_gap: true,
        }
    }

    pub fn current(&self) -> &ActivityState {
        &self.current
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    /// Timestamp of the newest applied classification.
    pub fn last_timestamp(&self) -> Option<u64> {
        self.last_timestamp
    }

    /// Candidate label and streak length, if any.
    pub fn streak(&self) -> Option<(&ActivityLabel, u32)> {
        self.streak.as_ref().map(|s| (&s.label, s.count))
    }

    /// Feed one classification received at pipeline time `now_ns`.
    pub fn apply(&mut self, c: &Classification, origin: Origin, now_ns: u64) -> Applied {
        if !self.labels.contains(&c.label) {
            return Applied::Rejected(Rejection::UnknownLabel);
        }
        if let Some(last) = self.last_timestamp {
            if c.timestamp < last {
                debug!(ts = c.timestamp, last, "out-of-order classification ignored");
                return Applied::Rejected(Rejection::OutOfOrder { last });
            }
        }
        self.last_timestamp = Some(c.timestamp);
        self.last_heard_ns = now_ns;
        if self.stalled {
            info!("classifications resumed after stall");
            self.stalled = false;
        }
        if self.open_gap {
            self.open_gap = false;
            self.current.last_confirmed_at = self.current.last_confirmed_at.max(c.timestamp);
        }

        if c.label == self.current.label {
            self.current.last_confirmed_at = self.current.last_confirmed_at.max(c.timestamp);
            self.current.sample_count += 1;
            self.streak = None;
            return Applied::Refreshed;
        }

        let count = match self.streak.as_mut() {
            Some(streak) if streak.label == c.label => {
                streak.count += 1;
                streak.count
            }
            _ => {
                self.streak = Some(Streak {
                    label: c.label.clone(),
                    count: 1,
                });
                1
            }
        };

        let cause = if origin == Origin::Manual {
            TransitionCause::Manual
        } else if count >= self.config.confirm_count {
            TransitionCause::Confirmed
        } else if c.confidence >= self.config.high_confidence_override {
            TransitionCause::HighConfidence
        } else {
            return Applied::Streak {
                label: c.label.clone(),
                count,
            };
        };

        self.streak = None;
        let closed = self.close_current();
        let started_at = self.current.last_confirmed_at;
        self.current = ActivityState {
            label: c.label.clone(),
            started_at,
            last_confirmed_at: c.timestamp.max(started_at),
            sample_count: u64::from(count),
        };
        info!(
            from = closed.as_ref().map(|r| r.label.as_str()).unwrap_or("-"),
            to = %self.current.label,
            ?cause,
            "activity changed"
        );
        Applied::Transition(Transition {
            cause,
            closed,
            current: self.current.clone(),
        })
    }

    /// Close the current state as `unknown` if nothing has been heard for the
    /// stall timeout. Fires at most once per silence.
    pub fn check_stall(&mut self, now_ns: u64) -> Option<Transition> {
        if self.stalled {
            return None;
        }
        let timeout_ns = duration_ns(self.config.stall_timeout);
        if now_ns.saturating_sub(self.last_heard_ns) < timeout_ns {
            return None;
        }

        self.stalled = true;
        self.open_gap = true;
        self.streak = None;
        warn!(
            label = %self.current.label,
            silent_for_ms = now_ns.saturating_sub(self.last_heard_ns) / 1_000_000,
            "classification stalled"
        );

        if self.labels.is_unknown(&self.current.label) {
            self.current.last_confirmed_at = self.current.last_confirmed_at.max(now_ns);
            return None;
        }
        let closed = self.close_current();
        let mut gap = ActivityState::new(self.labels.unknown.clone(), self.current.last_confirmed_at);
        gap.last_confirmed_at = gap.started_at.max(now_ns);
        self.current = gap;
        Some(Transition {
            cause: TransitionCause::Stall,
            closed,
            current: self.current.clone(),
        })
    }

    /// Close the current state for shutdown. An open gap is closed at `now_ns`.
    pub fn finalize(&mut self, now_ns: u64) -> Option<ActivityRecord> {
        if self.open_gap {
            self.current.last_confirmed_at = self.current.last_confirmed_at.max(now_ns);
            self.open_gap = false;
        }
        let record = self.close_current();
        self.current = ActivityState::new(self.labels.unknown.clone(), self.current.last_confirmed_at);
        self.streak = None;
        record
    }

    fn close_current(&self) -> Option<ActivityRecord> {
        let record = ActivityRecord {
            label: self.current.label.clone(),
            started_at: self.current.started_at,
            ended_at: self.current.last_confirmed_at,
            sample_count: self.current.sample_count,
        };
        if self.labels.is_unknown(&record.label) && record.duration_ns() == 0 {
            return None;
        }
        Some(record)
    }
}

impl std::fmt::Debug for StabilityEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StabilityEngine")
            .field("current", &self.current)
            .field("streak", &self.streak)
            .field("stalled", &self.stalled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const S: u64 = 1_000_000_000;

    fn engine(confirm: u32) -> StabilityEngine {
        StabilityEngine::new(
            StabilityConfig {
                confirm_count: confirm,
                high_confidence_override: 0.95,
                stall_timeout: Duration::from_secs(10),
            },
            LabelSet::default(),
            0,
        )
    }

    fn c(ts_s: u64, label: &str, confidence: f32) -> Classification {
        Classification::with_uniform_remainder(ts_s * S, label.into(), confidence, std::iter::empty::<&ActivityLabel>())
    }

    fn auto(e: &mut StabilityEngine, ts_s: u64, label: &str) -> Applied {
        e.apply(&c(ts_s, label, 0.6), Origin::Automatic, ts_s * S)
    }

    /// Engine whose current state is `label` (reached through a confirmed streak).
    fn settled(confirm: u32, label: &str) -> StabilityEngine {
        let mut e = engine(confirm);
        for i in 0..confirm as u64 {
            auto(&mut e, i + 1, label);
        }
        assert_eq!(e.current().label.as_str(), label);
        e
    }

    fn transitions(results: &[Applied]) -> Vec<&Transition> {
        results
            .iter()
            .filter_map(|a| match a {
                Applied::Transition(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn starts_unknown() {
        let e = engine(2);
        assert_eq!(e.current().label.as_str(), "unknown");
        assert_eq!(e.current().sample_count, 0);
    }

    #[test]
    fn confirm_two_switches_on_second_differing_sample() {
        let mut e = settled(2, "idle");
        let results: Vec<Applied> = [(3, "idle"), (4, "idle"), (5, "video"), (6, "video"), (7, "video")]
            .iter()
            .map(|(ts, l)| auto(&mut e, *ts, l))
            .collect();

        assert_eq!(results[2], Applied::Streak { label: "video".into(), count: 1 });
        let t = transitions(&results);
        assert_eq!(t.len(), 1);
        let closed = t[0].closed.as_ref().unwrap();
        assert_eq!(closed.label.as_str(), "idle");
        assert_eq!(closed.ended_at, 4 * S);
        assert_eq!(t[0].cause, TransitionCause::Confirmed);
        assert_eq!(t[0].current.label.as_str(), "video");
        assert_eq!(t[0].current.started_at, 4 * S);
        assert_eq!(results[4], Applied::Refreshed);
        assert_eq!(e.current().sample_count, 3);
    }

    #[test]
    fn confirm_three_needs_three_differing_samples() {
        let mut e = settled(3, "idle");
        let results: Vec<Applied> = [(4, "idle"), (5, "idle"), (6, "video"), (7, "video")]
            .iter()
            .map(|(ts, l)| auto(&mut e, *ts, l))
            .collect();
        assert!(transitions(&results).is_empty());
        assert_eq!(e.current().label.as_str(), "idle");
        assert!(matches!(auto(&mut e, 8, "video"), Applied::Transition(_)));
    }

    #[test]
    fn interrupted_streak_restarts() {
        let mut e = settled(2, "idle");
        auto(&mut e, 3, "video");
        assert_eq!(e.streak(), Some((&ActivityLabel::from("video"), 1)));
        auto(&mut e, 4, "idle");
        assert_eq!(e.streak(), None);
        assert!(matches!(auto(&mut e, 5, "video"), Applied::Streak { count: 1, .. }));
        auto(&mut e, 6, "reading");
        assert!(matches!(auto(&mut e, 7, "video"), Applied::Streak { count: 1, .. }));
        assert_eq!(e.current().label.as_str(), "idle");
    }

    #[test]
    fn high_confidence_switches_immediately() {
        let mut e = settled(5, "idle");
        match e.apply(&c(9, "video_call", 0.97), Origin::Automatic, 9 * S) {
            Applied::Transition(t) => {
                assert_eq!(t.cause, TransitionCause::HighConfidence);
                assert_eq!(t.current.label.as_str(), "video_call");
                assert_eq!(t.current.sample_count, 1);
            }
            other => panic!("expected transition, got {other:?}"),
        }
    }

    #[test]
    fn manual_classification_confirms_alone() {
        let mut e = settled(4, "idle");
        match e.apply(&c(9, "reading", 0.3), Origin::Manual, 9 * S) {
            Applied::Transition(t) => assert_eq!(t.cause, TransitionCause::Manual),
            other => panic!("expected transition, got {other:?}"),
        }
    }

    #[test]
    fn stall_closes_once_as_unknown() {
        let mut e = settled(1, "reading");
        auto(&mut e, 2, "reading");

        assert!(e.check_stall(5 * S).is_none());
        let t = e.check_stall(12 * S).expect("stall transition");
        assert_eq!(t.cause, TransitionCause::Stall);
        let closed = t.closed.unwrap();
        assert_eq!(closed.label.as_str(), "reading");
        assert_eq!(closed.ended_at, 2 * S);
        assert_eq!(t.current.label.as_str(), "unknown");
        assert_eq!(t.current.started_at, 2 * S);
        assert_eq!(t.current.last_confirmed_at, 12 * S);

        assert!(e.check_stall(30 * S).is_none());
        assert!(e.check_stall(60 * S).is_none());
        assert!(e.is_stalled());
    }

    #[test]
    fn resumption_records_the_gap_and_rearms_stall() {
        let mut e = settled(1, "reading");
        e.check_stall(20 * S).unwrap();

        match auto(&mut e, 25, "idle") {
            Applied::Transition(t) => {
                let gap = t.closed.unwrap();
                assert_eq!(gap.label.as_str(), "unknown");
                assert_eq!((gap.started_at, gap.ended_at), (S, 25 * S));
                assert_eq!(t.current.started_at, 25 * S);
            }
            other => panic!("expected transition, got {other:?}"),
        }
        assert!(!e.is_stalled());
        assert!(e.check_stall(40 * S).is_some());
    }

    #[test]
    fn stale_classification_after_stall_keeps_the_gap() {
        let mut e = settled(1, "reading");
        auto(&mut e, 2, "reading");
        e.check_stall(20 * S).unwrap();

        // Same timestamp as the last applied classification, delivered late.
        match e.apply(&c(2, "reading", 0.3), Origin::Manual, 30 * S) {
            Applied::Transition(t) => {
                let gap = t.closed.expect("stall gap recorded");
                assert_eq!(gap.label.as_str(), "unknown");
                assert_eq!((gap.started_at, gap.ended_at), (2 * S, 20 * S));
                assert_eq!(t.current.label.as_str(), "reading");
                assert_eq!(t.current.started_at, 20 * S);
                assert!(t.current.last_confirmed_at >= t.current.started_at);
            }
            other => panic!("expected transition, got {other:?}"),
        }
    }

    #[test]
    fn first_transition_from_startup_unknown_keeps_the_gap() {
        let mut e = engine(1);
        match auto(&mut e, 3, "idle") {
            Applied::Transition(t) => {
                let gap = t.closed.unwrap();
                assert_eq!((gap.started_at, gap.ended_at), (0, 3 * S));
            }
            other => panic!("expected transition, got {other:?}"),
        }
    }

    #[test]
    fn zero_length_unknown_is_not_recorded() {
        let mut e = StabilityEngine::new(
            StabilityConfig {
                confirm_count: 1,
                ..StabilityConfig::default()
            },
            LabelSet::default(),
            5 * S,
        );
        match auto(&mut e, 5, "idle") {
            Applied::Transition(t) => assert!(t.closed.is_none()),
            other => panic!("expected transition, got {other:?}"),
        }
    }

    #[test]
    fn out_of_order_and_foreign_labels_are_rejected() {
        let mut e = settled(2, "idle");
        assert_eq!(
            auto(&mut e, 1, "idle"),
            Applied::Rejected(Rejection::OutOfOrder { last: 2 * S })
        );
        assert_eq!(
            auto(&mut e, 9, "juggling"),
            Applied::Rejected(Rejection::UnknownLabel)
        );
    }

    #[test]
    fn finalize_closes_current() {
        let mut e = settled(1, "video");
        auto(&mut e, 4, "video");
        let record = e.finalize(10 * S).unwrap();
        assert_eq!(record.label.as_str(), "video");
        assert_eq!(record.ended_at, 4 * S);
        assert_eq!(record.sample_count, 2);
    }

    #[test]
    fn records_are_contiguous_and_ordered() {
        let mut e = engine(2);
        let script = [
            "idle", "idle", "idle", "video", "video", "reading", "reading", "reading", "idle", "video",
            "video",
        ];
        let mut records = Vec::new();
        for (i, label) in script.iter().enumerate() {
            if let Applied::Transition(t) = auto(&mut e, i as u64 + 1, label) {
                records.extend(t.closed);
            }
        }
        records.extend(e.finalize(100 * S));
        assert!(records.len() >= 4);
        for pair in records.windows(2) {
            assert_eq!(pair[0].ended_at, pair[1].started_at);
            assert!(pair[0].started_at <= pair[0].ended_at);
        }
    }
}
