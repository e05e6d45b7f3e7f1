//! Hand-off buffers between pipeline stages.
//!
//! - `AudioProducer`/`AudioConsumer`: lock-free SPSC ring between the
//!   microphone callback and its capture session. `push_slice` is wait-free
//!   and safe to call from the real-time audio thread.
//! - `ChunkSender`/`ChunkReceiver`: bounded per-stream channel from a producer
//!   task to the coordinator. When full, the oldest chunk is evicted so the
//!   producer never blocks and the newest data always gets through.
//! - `LatestSlot`: depth-1 latest-wins slot in front of the classifier.

pub mod chunk;
pub mod latest;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use ringbuf::{traits::Split, HeapRb};

pub use latest::LatestSlot;
pub use ringbuf::traits::{Consumer, Observer, Producer};

use chunk::RawChunk;

/// Producer half, held by the audio callback thread.
pub type AudioProducer = ringbuf::HeapProd<f32>;

/// Consumer half, held by the microphone capture session.
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// Default ring capacity: 2^20 f32 samples ≈ 21.8 s at 48 kHz.
pub const RING_CAPACITY: usize = 1 << 20;

/// Create a matched producer/consumer pair backed by a heap-allocated ring buffer.
pub fn create_audio_ring(capacity: usize) -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(capacity.max(1)).split()
}

/// Sending half of a drop-oldest chunk channel.
#[derive(Clone)]
pub struct ChunkSender {
    tx: Sender<RawChunk>,
    // Second receiver handle used only to evict the oldest entry when full.
    evict: Receiver<RawChunk>,
    evicted: Arc<AtomicU64>,
}

pub type ChunkReceiver = Receiver<RawChunk>;

/// Create a bounded chunk channel that evicts the oldest entry instead of blocking.
pub fn chunk_channel(capacity: usize) -> (ChunkSender, ChunkReceiver) {
    let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
    (
        ChunkSender {
            tx,
            evict: rx.clone(),
            evicted: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}

impl ChunkSender {
    /// Enqueue `chunk` without blocking, evicting the oldest queued chunk if full.
    pub fn send(&self, chunk: RawChunk) {
        let mut chunk = chunk;
        loop {
            match self.tx.try_send(chunk) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => return,
                Err(TrySendError::Full(back)) => {
                    if self.evict.try_recv().is_ok() {
                        self.evicted.fetch_add(1, Ordering::Relaxed);
                    }
                    chunk = back;
                }
            }
        }
    }

    /// Number of chunks dropped because the coordinator fell behind.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_channel_evicts_oldest_chunk() {
        let (tx, rx) = chunk_channel(2);
        tx.send(RawChunk::audio(1, vec![]));
        tx.send(RawChunk::audio(2, vec![]));
        tx.send(RawChunk::audio(3, vec![]));

        assert_eq!(tx.evicted(), 1);
        assert_eq!(rx.try_recv().map(|c| c.timestamp).ok(), Some(2));
        assert_eq!(rx.try_recv().map(|c| c.timestamp).ok(), Some(3));
    }

    #[test]
    fn audio_ring_round_trips_samples() {
        let (mut producer, mut consumer) = create_audio_ring(8);
        assert_eq!(producer.push_slice(&[0.1, 0.2, 0.3]), 3);
        let mut out = [0f32; 4];
        assert_eq!(consumer.pop_slice(&mut out), 3);
        assert_eq!(&out[..3], &[0.1, 0.2, 0.3]);
    }
}
