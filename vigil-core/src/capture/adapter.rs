//! Per-stream connection manager around a `CaptureSource`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::buffering::chunk::{RawChunk, StreamKind};
use crate::capture::backoff::{Backoff, BackoffPolicy};
use crate::capture::{CaptureSession, CaptureSource, ChunkRead, ConnectivityMonitor};
use crate::clock::{deadline_after, PipelineClock};
use crate::ipc::events::ConnectivityState;

/// Outcome of `StreamAdapter::next_chunk`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterRead {
    Chunk(RawChunk),
    /// No chunk within the wait budget. Also returned while waiting out a
    /// reconnect delay.
    Unavailable,
    /// The session died during this call. A reconnect has been scheduled.
    Disconnected,
}

/// Owns one stream's session, reconnecting with bounded exponential backoff.
///
/// Must live on the thread that reads from it; the session it holds may be `!Send`.
pub struct StreamAdapter {
    stream: StreamKind,
    source: Arc<dyn CaptureSource>,
    clock: PipelineClock,
    session: Option<Box<dyn CaptureSession>>,
    backoff: Backoff,
    retry_at: Option<Instant>,
    // Backoff resets only once a fresh session actually delivers data.
    awaiting_first_chunk: bool,
    monitor: Option<ConnectivityMonitor>,
    reconnects: u64,
    connect_failures: u64,
}

impl StreamAdapter {
    pub fn new(
        stream: StreamKind,
        source: Arc<dyn CaptureSource>,
        clock: PipelineClock,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            stream,
            source,
            clock,
            session: None,
            backoff: Backoff::new(policy),
            retry_at: None,
            awaiting_first_chunk: false,
            monitor: None,
            reconnects: 0,
            connect_failures: 0,
        }
    }

    pub fn with_monitor(mut self, monitor: ConnectivityMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn stream(&self) -> StreamKind {
        self.stream
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Sessions lost so far.
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    /// Connect attempts that failed so far.
    pub fn connect_failures(&self) -> u64 {
        self.connect_failures
    }

    /// Wait at most roughly `max_wait` for the next chunk.
    ///
    /// Never returns an error: connect failures and dead sessions are retried
    /// internally and reported through the monitor.
    pub fn next_chunk(&mut self, max_wait: Duration) -> AdapterRead {
        if self.session.is_none() && !self.try_connect(max_wait) {
            return AdapterRead::Unavailable;
        }
        let Some(session) = self.session.as_mut() else {
            return AdapterRead::Unavailable;
        };

        match session.next(self.stream, max_wait) {
            Ok(ChunkRead::Chunk(chunk)) => {
                if self.awaiting_first_chunk {
                    self.awaiting_first_chunk = false;
                    self.backoff.reset();
                }
                AdapterRead::Chunk(chunk)
            }
            Ok(ChunkRead::Unavailable) => AdapterRead::Unavailable,
            Err(e) => {
                warn!(stream = %self.stream, "capture session lost: {e}");
                session.close();
                self.session = None;
                self.reconnects += 1;
                self.schedule_retry();
                AdapterRead::Disconnected
            }
        }
    }

    /// Close the session and mark the stream stopped.
    pub fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
        self.retry_at = None;
        self.set_state(ConnectivityState::Stopped);
    }

    fn try_connect(&mut self, max_wait: Duration) -> bool {
        if let Some(at) = self.retry_at {
            let now = Instant::now();
            if at > now {
                let remaining = at - now;
                std::thread::sleep(remaining.min(max_wait));
                if remaining > max_wait {
                    return false;
                }
            }
        }

        self.set_state(ConnectivityState::Connecting);
        match self.source.connect(self.clock) {
            Ok(session) => {
                info!(stream = %self.stream, source = self.source.name(), "capture connected");
                self.session = Some(session);
                self.retry_at = None;
                self.awaiting_first_chunk = true;
                self.set_state(ConnectivityState::Connected);
                true
            }
            Err(e) => {
                warn!(stream = %self.stream, source = self.source.name(), "connect failed: {e}");
                self.connect_failures += 1;
                self.schedule_retry();
                false
            }
        }
    }

    fn schedule_retry(&mut self) {
        let attempt = self.backoff.attempt() + 1;
        let delay = self.backoff.next_delay();
        debug!(stream = %self.stream, attempt, ?delay, "reconnect scheduled");
        self.retry_at = Some(deadline_after(delay));
        self.set_state(ConnectivityState::Reconnecting {
            attempt,
            retry_in_ms: delay.as_millis().min(u64::MAX as u128) as u64,
        });
    }

    fn set_state(&self, state: ConnectivityState) {
        if let Some(monitor) = &self.monitor {
            monitor.set(self.stream, state);
        }
    }
}

impl Drop for StreamAdapter {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::synthetic::{SyntheticConfig, SyntheticSource};
    use tokio::sync::broadcast;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(4), 2.0)
    }

    fn source(config: SyntheticConfig) -> Arc<SyntheticSource> {
        Arc::new(SyntheticSource::new(SyntheticConfig {
            realtime: false,
            width: 4,
            height: 4,
            ..config
        }))
    }

    fn read_until_chunk(adapter: &mut StreamAdapter) -> RawChunk {
        for _ in 0..200 {
            if let AdapterRead::Chunk(c) = adapter.next_chunk(Duration::from_millis(5)) {
                return c;
            }
        }
        panic!("adapter never produced a chunk");
    }

    #[test]
    fn retries_failed_connects_until_success() {
        let src = source(SyntheticConfig {
            fail_first_connects: 3,
            ..SyntheticConfig::default()
        });
        let (tx, _rx) = broadcast::channel(32);
        let monitor = ConnectivityMonitor::new(tx);
        let mut adapter = StreamAdapter::new(
            StreamKind::Audio,
            src.clone(),
            PipelineClock::new(),
            policy(),
        )
        .with_monitor(monitor.clone());

        read_until_chunk(&mut adapter);

        assert_eq!(src.connect_attempts(), 4);
        assert_eq!(adapter.connect_failures(), 3);
        assert!(adapter.is_connected());
        assert_eq!(
            monitor.get(StreamKind::Audio),
            Some(ConnectivityState::Connected)
        );
    }

    #[test]
    fn huge_backoff_waits_instead_of_panicking() {
        let src = source(SyntheticConfig {
            fail_first_connects: 1,
            ..SyntheticConfig::default()
        });
        let mut adapter = StreamAdapter::new(
            StreamKind::Audio,
            src.clone(),
            PipelineClock::new(),
            BackoffPolicy::new(Duration::MAX, Duration::MAX, 2.0),
        );

        assert_eq!(
            adapter.next_chunk(Duration::from_millis(1)),
            AdapterRead::Unavailable
        );
        assert_eq!(
            adapter.next_chunk(Duration::from_millis(1)),
            AdapterRead::Unavailable
        );
        assert_eq!(src.connect_attempts(), 1);
        assert!(!adapter.is_connected());
    }

    #[test]
    fn lost_session_reports_disconnect_then_recovers() {
        let src = source(SyntheticConfig {
            disconnect_after: Some(1),
            ..SyntheticConfig::default()
        });
        let mut adapter =
            StreamAdapter::new(StreamKind::Video, src.clone(), PipelineClock::new(), policy());

        read_until_chunk(&mut adapter);
        assert_eq!(
            adapter.next_chunk(Duration::from_millis(5)),
            AdapterRead::Disconnected
        );
        assert!(!adapter.is_connected());

        read_until_chunk(&mut adapter);
        assert_eq!(adapter.reconnects(), 1);
        assert_eq!(src.connect_attempts(), 2);
    }

    #[test]
    fn close_marks_stream_stopped() {
        let (tx, _rx) = broadcast::channel(8);
        let monitor = ConnectivityMonitor::new(tx);
        let mut adapter = StreamAdapter::new(
            StreamKind::Audio,
            source(SyntheticConfig::default()),
            PipelineClock::new(),
            policy(),
        )
        .with_monitor(monitor.clone());
        read_until_chunk(&mut adapter);
        adapter.close();
        assert!(!adapter.is_connected());
        assert_eq!(
            monitor.get(StreamKind::Audio),
            Some(ConnectivityState::Stopped)
        );
    }
}
