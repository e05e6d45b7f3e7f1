//! Audio/video pairing.
//!
//! Each arriving chunk is matched against the unconsumed chunks of the other
//! stream: the candidate with the smallest timestamp delta within `skew_max`
//! wins, earliest arrival breaks ties. Unmatched chunks are held until they
//! fall behind the release horizon (`watermark - 2 * skew_max`, where the
//! watermark is the newest timestamp seen on either stream) and are then
//! dropped as missed pairings.
//!
//! Formed samples are not emitted immediately. They wait in a min-heap until
//! their timestamp is at or below the horizon. Any chunk arriving later is
//! either above the horizon or dropped as late, so no future sample can sort
//! before one already released.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::buffering::chunk::{RawChunk, Sample, StreamKind};
use crate::clock::duration_ns;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    pub skew_max: Duration,
    /// Unpaired chunks held per stream before the oldest is evicted.
    pub capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            skew_max: Duration::from_millis(250),
            capacity: 32,
        }
    }
}

/// Cumulative synchronizer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub paired: u64,
    pub released: u64,
    /// Held chunks that aged past the horizon without a partner.
    pub missed: u64,
    /// Chunks that arrived already behind the horizon.
    pub late: u64,
    /// Held chunks evicted because the per-stream buffer was full.
    pub overflow: u64,
}

#[derive(Debug)]
struct Held {
    chunk: RawChunk,
    arrival: u64,
}

#[derive(Debug)]
struct Ready {
    sample: Sample,
    seq: u64,
}

impl PartialEq for Ready {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ready {}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.sample.timestamp, self.seq).cmp(&(other.sample.timestamp, other.seq))
    }
}

pub struct Synchronizer {
    skew_ns: u64,
    capacity: usize,
    audio: VecDeque<Held>,
    video: VecDeque<Held>,
    ready: BinaryHeap<Reverse<Ready>>,
    watermark: Option<u64>,
    floor: u64,
    arrivals: u64,
    formed: u64,
    stats: SyncStats,
}

impl Synchronizer {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            skew_ns: duration_ns(config.skew_max),
            capacity: config.capacity.max(1),
            audio: VecDeque::new(),
            video: VecDeque::new(),
            ready: BinaryHeap::new(),
            watermark: None,
            floor: 0,
            arrivals: 0,
            formed: 0,
            stats: SyncStats::default(),
        }
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    /// Chunks currently held waiting for a partner.
    pub fn held(&self, stream: StreamKind) -> usize {
        self.queue(stream).len()
    }

    /// Samples formed but not yet released.
    pub fn pending(&self) -> usize {
        self.ready.len()
    }

    /// Ingest one chunk and return every sample that became releasable.
    pub fn push(&mut self, chunk: RawChunk) -> Vec<Sample> {
        let arrival = self.arrivals;
        self.arrivals += 1;

        let watermark = self.watermark.map_or(chunk.timestamp, |w| w.max(chunk.timestamp));
        self.watermark = Some(watermark);
        let horizon = self.horizon();

        if chunk.timestamp < horizon {
            self.stats.late += 1;
            debug!(stream = %chunk.stream, ts = chunk.timestamp, horizon, "late chunk dropped");
        } else if let Some(partner) = self.take_partner(&chunk) {
            let (audio, video) = match chunk.stream {
                StreamKind::Audio => (chunk, partner),
                StreamKind::Video => (partner, chunk),
            };
            self.stats.paired += 1;
            let seq = self.formed;
            self.formed += 1;
            self.ready.push(Reverse(Ready {
                sample: Sample::new(audio, video),
                seq,
            }));
        } else {
            let capacity = self.capacity;
            let queue = self.queue_mut(chunk.stream);
            if queue.len() >= capacity {
                queue.pop_front();
                self.stats.overflow += 1;
            }
            self.queue_mut(chunk.stream).push_back(Held { chunk, arrival });
        }

        self.expire(horizon);
        self.release(horizon)
    }

    /// Release every formed sample regardless of the horizon, e.g. when input
    /// has gone quiet or at shutdown. Chunks still waiting for a partner stay held.
    pub fn flush(&mut self) -> Vec<Sample> {
        self.release(u64::MAX)
    }

    fn horizon(&self) -> u64 {
        self.watermark
            .unwrap_or(0)
            .saturating_sub(self.skew_ns.saturating_mul(2))
            .max(self.floor)
    }

    fn take_partner(&mut self, chunk: &RawChunk) -> Option<RawChunk> {
        let skew = self.skew_ns;
        let floor = self.floor;
        let best = self
            .queue(chunk.stream.other())
            .iter()
            .enumerate()
            .filter(|(_, h)| h.chunk.timestamp.max(chunk.timestamp) >= floor)
            .map(|(i, h)| (i, h.chunk.timestamp.abs_diff(chunk.timestamp), h.arrival))
            .filter(|(_, delta, _)| *delta <= skew)
            .min_by_key(|(_, delta, arrival)| (*delta, *arrival))
            .map(|(i, _, _)| i)?;
        self.queue_mut(chunk.stream.other())
            .remove(best)
            .map(|h| h.chunk)
    }

    fn expire(&mut self, horizon: u64) {
        for stream in StreamKind::ALL {
            let queue = self.queue_mut(stream);
            let before = queue.len();
            queue.retain(|h| h.chunk.timestamp >= horizon);
            let dropped = (before - queue.len()) as u64;
            if dropped > 0 {
                debug!(%stream, dropped, "unpaired chunks expired");
            }
            self.stats.missed += dropped;
        }
    }

    fn release(&mut self, up_to: u64) -> Vec<Sample> {
        let mut out = Vec::new();
        while let Some(Reverse(next)) = self.ready.peek() {
            if next.sample.timestamp > up_to {
                break;
            }
            if let Some(Reverse(ready)) = self.ready.pop() {
                self.floor = self.floor.max(ready.sample.timestamp);
                out.push(ready.sample);
            }
        }
        self.stats.released += out.len() as u64;
        out
    }

    fn queue(&self, stream: StreamKind) -> &VecDeque<Held> {
        match stream {
            StreamKind::Audio => &self.audio,
            StreamKind::Video => &self.video,
        }
    }

    fn queue_mut(&mut self, stream: StreamKind) -> &mut VecDeque<Held> {
        match stream {
            StreamKind::Audio => &mut self.audio,
            StreamKind::Video => &mut self.video,
        }
    }
}

impl std::fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronizer")
            .field("skew_ns", &self.skew_ns)
            .field("held_audio", &self.audio.len())
            .field("held_video", &self.video.len())
            .field("pending", &self.ready.len())
            .field("stats", &self.stats)
            .finish()
    }
}
