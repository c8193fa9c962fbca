//! The channel between a worker and the transport that owns the socket.
//!
//! Each flush produces a [`FlushChunk`]. The first chunk of a response
//! carries the [`ResponseHead`]; later ones carry body bytes only. The
//! response ends when the sink is dropped.

use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

/// Status and rendered headers of a response, `Set-Cookie` lines included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

/// One flush worth of output.
#[derive(Debug)]
pub struct FlushChunk {
    pub head: Option<ResponseHead>,
    pub body: Bytes,
}

/// The receiving side went away (client disconnect or transport shutdown).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("response sink closed")]
pub struct SinkClosed;

/// Where a connection writes its output.
pub trait ResponseSink: Send {
    fn send(&mut self, chunk: FlushChunk) -> Result<(), SinkClosed>;
}

/// Chunks a sink may hold before the worker waits for the transport.
pub const SINK_CAPACITY: usize = 16;

/// Longest pause between attempts on a full channel.
const MAX_BACKOFF: Duration = Duration::from_millis(10);

/// Sink backed by a bounded tokio channel.
///
/// A full channel means the client reads slower than the handler writes.
/// The worker thread then waits, up to the write timeout, for room; past
/// it the sink reports [`SinkClosed`] as if the client had gone.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<FlushChunk>,
    write_timeout: Duration,
}

impl ResponseSink for ChannelSink {
    fn send(&mut self, chunk: FlushChunk) -> Result<(), SinkClosed> {
        // No deadline if it lies beyond what `Instant` can represent.
        let deadline = Instant::now().checked_add(self.write_timeout);
        let mut backoff = Duration::from_micros(50);
        let mut chunk = chunk;
        loop {
            match self.tx.try_send(chunk) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Closed(_)) => return Err(SinkClosed),
                Err(TrySendError::Full(returned)) => {
                    let remaining =
                        deadline.map_or(backoff, |at| at.saturating_duration_since(Instant::now()));
                    if remaining.is_zero() {
                        warn!(timeout = ?self.write_timeout, "client not reading, abandoning response");
                        return Err(SinkClosed);
                    }
                    chunk = returned;
                    std::thread::sleep(backoff.min(remaining));
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }
}

/// Create a sink and the receiver a transport drains. `write_timeout`
/// bounds how long one flush may wait on a full channel.
pub fn channel(write_timeout: Duration) -> (ChannelSink, mpsc::Receiver<FlushChunk>) {
    let (tx, rx) = mpsc::channel(SINK_CAPACITY);
    (ChannelSink { tx, write_timeout }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_after_receiver_drop_fails() {
        let (mut sink, rx) = channel(Duration::from_secs(1));
        drop(rx);
        let chunk = FlushChunk {
            head: None,
            body: Bytes::from_static(b"x"),
        };
        assert_eq!(sink.send(chunk), Err(SinkClosed));
    }

    #[test]
    fn test_dropping_sink_ends_stream() {
        let (mut sink, mut rx) = channel(Duration::from_secs(1));
        sink.send(FlushChunk {
            head: None,
            body: Bytes::from_static(b"a"),
        })
        .unwrap();
        drop(sink);
        assert_eq!(rx.try_recv().unwrap().body.as_ref(), b"a");
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    fn chunk(body: &'static [u8]) -> FlushChunk {
        FlushChunk {
            head: None,
            body: Bytes::from_static(body),
        }
    }

    #[test]
    fn test_stalled_receiver_times_out() {
        let (mut sink, rx) = channel(Duration::from_millis(50));
        for _ in 0..SINK_CAPACITY {
            sink.send(chunk(b"queued")).unwrap();
        }
        let started = Instant::now();
        assert_eq!(sink.send(chunk(b"one too many")), Err(SinkClosed));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(started.elapsed() < Duration::from_secs(2));
        // Nothing beyond the bound was buffered.
        assert_eq!(rx.len(), SINK_CAPACITY);
    }

    #[test]
    fn test_full_sink_resumes_when_receiver_reads() {
        let (mut sink, mut rx) = channel(Duration::from_secs(5));
        for _ in 0..SINK_CAPACITY {
            sink.send(chunk(b"x")).unwrap();
        }
        let reader = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            let mut seen = 0;
            while rx.blocking_recv().is_some() {
                seen += 1;
            }
            seen
        });
        sink.send(chunk(b"late")).unwrap();
        drop(sink);
        assert_eq!(reader.join().unwrap(), SINK_CAPACITY + 1);
    }
}
