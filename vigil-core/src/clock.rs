//! Shared timestamp domain for every stage of the pipeline.
//!
//! Timestamps are nanoseconds since the UNIX epoch, anchored once when the
//! clock is created and then advanced by `Instant`. Within a process they
//! never go backwards; across restarts they stay comparable, which keeps
//! persisted history queryable by range.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Monotonic nanosecond clock shared by capture sessions and the coordinator.
#[derive(Debug, Clone, Copy)]
pub struct PipelineClock {
    anchor: Instant,
    anchor_ns: u64,
}

impl PipelineClock {
    pub fn new() -> Self {
        let anchor_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(duration_ns)
            .unwrap_or(0);
        Self {
            anchor: Instant::now(),
            anchor_ns,
        }
    }

    /// A clock whose epoch starts at `anchor_ns`. Used by tests and replays.
    pub fn starting_at(anchor_ns: u64) -> Self {
        Self {
            anchor: Instant::now(),
            anchor_ns,
        }
    }

    pub fn now_ns(&self) -> u64 {
        self.at(Instant::now())
    }

    /// Map an `Instant` taken in this process onto the clock's domain.
    pub fn at(&self, instant: Instant) -> u64 {
        self.anchor_ns
            .saturating_add(duration_ns(instant.saturating_duration_since(self.anchor)))
    }
}

impl Default for PipelineClock {
    fn default() -> Self {
        Self::new()
    }
}

const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// `Instant::now() + wait`, clamped instead of panicking when `wait` is huge.
pub fn deadline_after(wait: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(wait)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Saturating `Duration` → nanoseconds.
pub fn duration_ns(d: Duration) -> u64 {
    d.as_nanos().min(u64::MAX as u128) as u64
}
