//! Bidirectional byte splicing between two streams.
//!
//! Each direction is pumped by its own task through a bounded buffer; a chunk
//! is fully written before the next read. Tasks coordinate through tokens only:
//!
//! - `abort` (per circuit): cancelled on any read/write error, a stalled write or
//!   relay shutdown; both pumps stop immediately.
//! - `done` (per pump): cancelled when that pump stops. From then on the sibling
//!   keeps forwarding, but a read that stays idle for `linger` ends it.
//!
//! On EOF a pump shuts down the write side of the opposite stream, so the far
//! end sees the close. A write that accepts nothing for `linger` counts as a
//! stall and aborts the circuit, so a peer that stops reading cannot pin it.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;
pub const DEFAULT_LINGER: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpliceConfig {
    pub buffer_size: usize,
    pub linger: Duration,
}

impl Default for SpliceConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            linger: DEFAULT_LINGER,
        }
    }
}

/// Why a pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    /// Read side reached end of stream.
    Eof,
    /// Sibling had stopped and this direction stayed idle past the linger.
    Idle,
    /// Read or write failed.
    Error,
    /// A write accepted no bytes for the linger; the circuit is aborted.
    Stalled,
    /// Circuit was aborted from outside or by the sibling's error.
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectionReport {
    pub bytes: u64,
    pub end: PumpEnd,
}

/// Live byte counters for a splice in progress.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    forward: AtomicU64,
    backward: AtomicU64,
}

impl TrafficCounters {
    pub fn forward(&self) -> u64 {
        self.forward.load(Ordering::Relaxed)
    }

    pub fn backward(&self) -> u64 {
        self.backward.load(Ordering::Relaxed)
    }

    fn counter(&self, direction: Direction) -> &AtomicU64 {
        match direction {
            Direction::Forward => &self.forward,
            Direction::Backward => &self.backward,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

/// Outcome of a finished splice, `a -> b` and `b -> a`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpliceReport {
    pub forward: DirectionReport,
    pub backward: DirectionReport,
}

impl SpliceReport {
    pub fn total_bytes(&self) -> u64 {
        self.forward.bytes + self.backward.bytes
    }

    /// True if neither direction hit an error or abort.
    pub fn is_clean(&self) -> bool {
        [self.forward.end, self.backward.end]
            .iter()
            .all(|end| matches!(end, PumpEnd::Eof | PumpEnd::Idle))
    }
}

/// Forward bytes between `a` and `b` until both directions stop.
///
/// Both streams are dropped before this returns.
pub async fn splice<A, B>(a: A, b: B, config: SpliceConfig, abort: CancellationToken) -> SpliceReport
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    splice_counted(a, b, config, abort, Arc::default()).await
}

/// [`splice`], updating `counters` as bytes are written.
pub async fn splice_counted<A, B>(
    a: A,
    b: B,
    config: SpliceConfig,
    abort: CancellationToken,
    counters: Arc<TrafficCounters>,
) -> SpliceReport
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let forward_done = CancellationToken::new();
    let backward_done = CancellationToken::new();

    let forward = tokio::spawn(pump(
        Direction::Forward,
        a_read,
        b_write,
        Tokens {
            done: forward_done.clone(),
            sibling_done: backward_done.clone(),
            abort: abort.clone(),
        },
        config,
        counters.clone(),
    ));
    let backward = tokio::spawn(pump(
        Direction::Backward,
        b_read,
        a_write,
        Tokens {
            done: backward_done,
            sibling_done: forward_done,
            abort: abort.clone(),
        },
        config,
        counters,
    ));

    let (forward, backward) = tokio::join!(forward, backward);
    let joined = |result: Result<DirectionReport, tokio::task::JoinError>| {
        result.unwrap_or_else(|e| {
            debug!(error = %e, "splice pump task failed");
            abort.cancel();
            DirectionReport {
                bytes: 0,
                end: PumpEnd::Error,
            }
        })
    };

    SpliceReport {
        forward: joined(forward),
        backward: joined(backward),
    }
}

struct Tokens {
    done: CancellationToken,
    sibling_done: CancellationToken,
    abort: CancellationToken,
}

async fn pump<R, W>(
    direction: Direction,
    mut reader: R,
    mut writer: W,
    tokens: Tokens,
    config: SpliceConfig,
    counters: Arc<TrafficCounters>,
) -> DirectionReport
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let Tokens {
        done,
        sibling_done,
        abort,
    } = tokens;
    let counter = counters.counter(direction);
    let mut buf = vec![0u8; config.buffer_size.max(1)];
    let mut bytes = 0u64;

    let end = 'pump: loop {
        let read = tokio::select! {
            biased;
            _ = abort.cancelled() => break PumpEnd::Aborted,
            read = until_idle(&sibling_done, config.linger, reader.read(&mut buf)) => read,
        };
        let n = match read {
            None => break PumpEnd::Idle,
            Some(Ok(0)) => break PumpEnd::Eof,
            Some(Ok(n)) => n,
            Some(Err(e)) => {
                debug!(direction = ?direction, error = %e, "splice read failed");
                abort.cancel();
                break PumpEnd::Error;
            }
        };

        // Each write must make progress within the linger, or the circuit is stalled.
        let mut written = 0;
        while written < n {
            let write = tokio::select! {
                biased;
                _ = abort.cancelled() => break 'pump PumpEnd::Aborted,
                write = tokio::time::timeout(config.linger, writer.write(&buf[written..n])) => write,
            };
            match write {
                Ok(Ok(0)) => {
                    debug!(direction = ?direction, "splice write returned zero");
                    abort.cancel();
                    break 'pump PumpEnd::Error;
                }
                Ok(Ok(k)) => {
                    written += k;
                    bytes += k as u64;
                    counter.fetch_add(k as u64, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    debug!(direction = ?direction, error = %e, "splice write failed");
                    abort.cancel();
                    break 'pump PumpEnd::Error;
                }
                Err(_) => {
                    debug!(direction = ?direction, linger = ?config.linger, "splice write stalled");
                    abort.cancel();
                    break 'pump PumpEnd::Stalled;
                }
            }
        }
    };

    if matches!(end, PumpEnd::Eof | PumpEnd::Idle) {
        // Half-close the opposite leg, bounded by the linger.
        let _ = tokio::time::timeout(config.linger, writer.shutdown()).await;
    }
    done.cancel();
    debug!(direction = ?direction, bytes, end = ?end, "splice pump finished");

    DirectionReport { bytes, end }
}

/// Run `op`; once `sibling_done` fires, give it at most `linger` more.
async fn until_idle<F: Future>(
    sibling_done: &CancellationToken,
    linger: Duration,
    op: F,
) -> Option<F::Output> {
    tokio::select! {
        out = op => Some(out),
        _ = async {
            sibling_done.cancelled().await;
            tokio::time::sleep(linger).await;
        } => None,
    }
}
