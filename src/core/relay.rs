//! Bidirectional relay with traffic accounting
//!
//! Two pump futures move data in each direction and are raced against an
//! idle watchdog and the session's cancellation token. Whichever finishes
//! first decides how the session ends; dropping the rest closes both sides.

use pin_project_lite::pin_project;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;

const MIN_IDLE_CHECK: Duration = Duration::from_millis(10);
const MAX_IDLE_CHECK: Duration = Duration::from_secs(30);

/// Live counters of one session, shared by its pumps
#[derive(Debug)]
pub struct SessionTraffic {
    start_time: Instant,
    /// Milliseconds since `start_time` of the last client-side byte
    last_activity: AtomicU64,
    client_to_backend_bytes: AtomicU64,
    backend_to_client_bytes: AtomicU64,
    client_to_backend_records: AtomicU64,
    backend_to_client_records: AtomicU64,
}

/// Point-in-time copy of [`SessionTraffic`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub client_to_backend_bytes: u64,
    pub backend_to_client_bytes: u64,
    pub client_to_backend_records: u64,
    pub backend_to_client_records: u64,
}

impl Default for SessionTraffic {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTraffic {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            last_activity: AtomicU64::new(0),
            client_to_backend_bytes: AtomicU64::new(0),
            backend_to_client_bytes: AtomicU64::new(0),
            client_to_backend_records: AtomicU64::new(0),
            backend_to_client_records: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        self.last_activity
            .store(self.start_time.elapsed().as_millis() as u64, Ordering::Release);
    }

    /// Time since bytes last moved in either direction
    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity.load(Ordering::Acquire);
        let now = self.start_time.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(last))
    }

    pub fn record_client_to_backend(&self) {
        self.client_to_backend_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backend_to_client(&self) {
        self.backend_to_client_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            client_to_backend_bytes: self.client_to_backend_bytes.load(Ordering::Relaxed),
            backend_to_client_bytes: self.backend_to_client_bytes.load(Ordering::Relaxed),
            client_to_backend_records: self.client_to_backend_records.load(Ordering::Relaxed),
            backend_to_client_records: self.backend_to_client_records.load(Ordering::Relaxed),
        }
    }
}

pin_project! {
    /// Client-side stream wrapper that tracks activity and byte counts.
    ///
    /// Everything a session relays passes through the client stream, so
    /// wrapping that one side is enough for both idle detection and totals.
    pub struct TimedStream<S> {
        #[pin]
        inner: S,
        traffic: Arc<SessionTraffic>,
    }
}

impl<S> TimedStream<S> {
    pub fn new(inner: S, traffic: Arc<SessionTraffic>) -> Self {
        Self { inner, traffic }
    }
}

impl<S: AsyncRead> AsyncRead for TimedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before_len = buf.filled().len();
        let result = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let bytes_read = buf.filled().len() - before_len;
            if bytes_read > 0 {
                this.traffic.touch();
                this.traffic
                    .client_to_backend_bytes
                    .fetch_add(bytes_read as u64, Ordering::Relaxed);
            }
        }
        result
    }
}

impl<S: AsyncWrite> AsyncWrite for TimedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        let result = this.inner.poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            if *n > 0 {
                this.traffic.touch();
                this.traffic
                    .backend_to_client_bytes
                    .fetch_add(*n as u64, Ordering::Relaxed);
            }
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// How a relay ended
#[derive(Debug)]
pub enum RelayEnd {
    /// One side reached end of stream
    Eof,
    /// Nothing moved for the idle timeout
    Idle,
    /// Server shutdown
    Shutdown,
    /// One side failed
    Error(io::Error),
}

/// Copy `reader` into `writer` until end of stream, counting one record per read
pub async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    on_record: impl Fn(),
) -> io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        on_record();
    }
}

/// Resolve once the session has been idle for `idle_timeout`
pub async fn idle_watch(traffic: &SessionTraffic, idle_timeout: Duration) {
    let period = (idle_timeout / 4).clamp(MIN_IDLE_CHECK, MAX_IDLE_CHECK);
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;
    loop {
        interval.tick().await;
        if traffic.idle_for() >= idle_timeout {
            return;
        }
    }
}

/// Race the two directions against the idle watchdog and cancellation
pub async fn race<U, D>(
    up: U,
    down: D,
    traffic: &SessionTraffic,
    idle_timeout: Duration,
    cancel: &CancellationToken,
) -> RelayEnd
where
    U: Future<Output = io::Result<()>>,
    D: Future<Output = io::Result<()>>,
{
    let finished = |result: io::Result<()>| match result {
        Ok(()) => RelayEnd::Eof,
        Err(e) => RelayEnd::Error(e),
    };

    tokio::select! {
        result = up => finished(result),
        result = down => finished(result),
        _ = idle_watch(traffic, idle_timeout) => RelayEnd::Idle,
        _ = cancel.cancelled() => RelayEnd::Shutdown,
    }
}

/// Relay two byte streams until one side closes, the idle timeout hits, or `cancel` fires.
///
/// `client` is the side whose traffic is accounted.
pub async fn relay_bidirectional<A, B>(
    client: A,
    backend: B,
    traffic: Arc<SessionTraffic>,
    idle_timeout: Duration,
    buffer_size: usize,
    cancel: &CancellationToken,
) -> RelayEnd
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let client = TimedStream::new(client, Arc::clone(&traffic));
    let (mut client_rx, mut client_tx) = tokio::io::split(client);
    let (mut backend_rx, mut backend_tx) = tokio::io::split(backend);

    let up = pump(&mut client_rx, &mut backend_tx, buffer_size, || {
        traffic.record_client_to_backend()
    });
    let down = pump(&mut backend_rx, &mut client_tx, buffer_size, || {
        traffic.record_backend_to_client()
    });

    race(up, down, &traffic, idle_timeout, cancel).await
}
