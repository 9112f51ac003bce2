//! A bidirectional stream whose reads and writes travel over a simulated slow link.
//!
//! [`ThrottledStream`] wraps any `AsyncRead + AsyncWrite` and shapes the two directions
//! independently using a shared [`Rates`] policy:
//! - reads follow [`Rates::down`], writes follow [`Rates::up`];
//! - every read or write call first waits the direction's latency, once per call;
//! - while a bandwidth cap is active, every call moves one chunk of about 10ms of traffic
//!   (at most [`READ_CHUNK`] / [`WRITE_CHUNK`] bytes) and releases it no earlier than its
//!   paced slot.
//!
//! Reads stage the bytes they pull from the inner stream and hand them to the caller only at
//! their release instant. Writes reserve their slot first and forward the bytes once it is
//! reached. Either way, what the peer observes never runs ahead of the configured rate by
//! more than one chunk. A cap-limited write may therefore be partial; `write_all` and friends
//! keep going, paying the latency on each call.
//!
//! ```no_run
//! use std::time::Duration;
//! use tokio::io::{self, AsyncReadExt, AsyncWriteExt};
//! use tokio::net::TcpStream;
//! use tokio_netshape::{
//!     rate::{Rate, Rates},
//!     stream::ThrottledStream,
//! };
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! let rates = Rates::symmetric(Rate::new(16, Duration::from_millis(40))).shared();
//! let stream = TcpStream::connect("127.0.0.1:3000").await?;
//! let mut stream = ThrottledStream::new(stream, rates);
//!
//! stream.write_all(b"GET / HTTP/1.0\r\n\r\n").await?; // ~40ms + paced at 16 KB/s
//! let mut body = Vec::new();
//! stream.read_to_end(&mut body).await?;
//! stream.close().await?;
//! # Ok(()) }
//! ```
//!
//! ## Deadlines and cancellation
//! - [`ThrottledStream::set_read_deadline`] / [`ThrottledStream::set_write_deadline`] bound
//!   the whole operation, including throttle sleeps. An elapsed deadline fails the call with
//!   `io::ErrorKind::TimedOut` instead of completing late.
//! - [`Closer::close`] aborts sleeps in progress from any task; the pending call fails with
//!   `io::ErrorKind::NotConnected`.
//! - Dropping an in-flight read or write keeps its reservation, so cancelling and retrying
//!   cannot be used to skip pacing.
use std::{
    fmt, io,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll, ready},
};

use bytes::BytesMut;
use futures::task::AtomicWaker;
use pin_project::pin_project;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf},
    time::Instant,
};

use crate::{
    error::closed_error,
    io::SocketAddrs,
    rate::{Rate, Rates},
    shaper::{Shaper, instant_after},
};

/// Largest read pulled from the inner stream while a download cap is active.
pub const READ_CHUNK: usize = 1024;

/// Largest write forwarded to the inner stream while an upload cap is active.
pub const WRITE_CHUNK: usize = 10 * 1024;

// one chunk carries 1/100 s of traffic
const CHUNKS_PER_SECOND: u64 = 100;

/// Bytes one call may move at `rate`: about 10ms worth, at least 1 and at most `max`.
fn chunk_len(rate: &Rate, max: usize) -> usize {
    usize::try_from(rate.bytes_per_second() / CHUNKS_PER_SECOND)
        .unwrap_or(usize::MAX)
        .clamp(1, max)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadPhase {
    Idle,
    Latency(Instant),
    Transfer(Instant),
    Pacing(Instant),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WritePhase {
    Idle,
    Latency(Instant),
    Pacing { release: Instant, reserved: usize },
    Transfer { reserved: usize },
}

#[derive(Debug, Default)]
struct CloseState {
    closed: AtomicBool,
    read: AtomicWaker,
    write: AtomicWaker,
}

impl CloseState {
    fn check(&self, cx: &mut Context<'_>, waker: &AtomicWaker) -> io::Result<()> {
        waker.register(cx.waker());
        if self.closed.load(Ordering::Acquire) {
            Err(closed_error())
        } else {
            Ok(())
        }
    }
}

/// Closes a [`ThrottledStream`] from another task.
///
/// Closing wakes any read or write of the stream that is sleeping on latency or pacing; the
/// call fails with the "already closed" error and so does every later call. The socket itself
/// is released when the stream is dropped.
#[derive(Debug, Clone)]
pub struct Closer {
    state: Arc<CloseState>,
}

impl Closer {
    /// Marks the stream closed. Returns `false` if it already was.
    pub fn close(&self) -> bool {
        let first = !self.state.closed.swap(true, Ordering::AcqRel);
        if first {
            tracing::debug!("throttled connection closed");
        }
        self.state.read.wake();
        self.state.write.wake();
        first
    }

    /// Returns `true` once the stream has been closed.
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }
}

/// A stream shaped by an upload and a download [`Rate`].
///
/// Implements [`AsyncRead`] and [`AsyncWrite`], so it can replace the wrapped stream anywhere,
/// including under hyper/axum. Upload and download keep separate state and never wait on each
/// other; two calls in the same direction cannot overlap because both take `Pin<&mut Self>`.
#[pin_project]
pub struct ThrottledStream<T> {
    #[pin]
    inner: T,
    rates: Arc<Rates>,
    down: Shaper,
    up: Shaper,
    read_phase: ReadPhase,
    write_phase: WritePhase,
    staged: BytesMut,
    close: Arc<CloseState>,
    shut_down: bool,
}

impl<T> ThrottledStream<T> {
    /// Wraps `inner`, shaping it with the shared `rates`.
    pub fn new(inner: T, rates: Arc<Rates>) -> Self {
        Self {
            inner,
            rates,
            down: Shaper::default(),
            up: Shaper::default(),
            read_phase: ReadPhase::Idle,
            write_phase: WritePhase::Idle,
            staged: BytesMut::new(),
            close: Arc::default(),
            shut_down: false,
        }
    }

    /// The policy this stream is shaped with.
    pub fn rates(&self) -> &Arc<Rates> {
        &self.rates
    }

    /// A handle that closes this stream from elsewhere.
    pub fn closer(&self) -> Closer {
        Closer {
            state: self.close.clone(),
        }
    }

    /// Returns `true` once [`close`](Self::close) or a [`Closer`] has run.
    pub fn is_closed(&self) -> bool {
        self.close.closed.load(Ordering::Acquire)
    }

    /// Bounds every following read; `None` removes the bound.
    ///
    /// The deadline is absolute and stays in force until replaced, like a socket deadline.
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.down.set_deadline(deadline);
    }

    /// Bounds every following write; `None` removes the bound.
    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.up.set_deadline(deadline);
    }

    /// Sets both the read and the write deadline.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    /// The deadline currently bounding reads.
    pub fn read_deadline(&self) -> Option<Instant> {
        self.down.deadline()
    }

    /// The deadline currently bounding writes.
    pub fn write_deadline(&self) -> Option<Instant> {
        self.up.deadline()
    }

    /// Immutable access to the inner stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutable access to the inner stream. Bytes moved through it bypass shaping.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Unwraps the inner stream. Bytes staged for a paced read are dropped.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: AsyncWrite + Unpin> ThrottledStream<T> {
    /// Closes the stream: aborts pending sleeps and shuts the inner write side down.
    ///
    /// Calling it again is a no-op returning `Ok(())`. A peer that already disconnected
    /// is not an error.
    pub async fn close(&mut self) -> io::Result<()> {
        self.closer().close();

        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        match self.inner.shutdown().await {
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

impl<T: SocketAddrs> ThrottledStream<T> {
    /// Local address of the inner stream.
    pub fn local_addr(&self) -> io::Result<T::Addr> {
        self.inner.local_addr()
    }

    /// Peer address of the inner stream.
    pub fn peer_addr(&self) -> io::Result<T::Addr> {
        self.inner.peer_addr()
    }
}

fn after_read_latency(staged: &BytesMut, down: &Shaper) -> ReadPhase {
    match down.released_at() {
        Some(release) if !staged.is_empty() => ReadPhase::Pacing(release),
        _ => ReadPhase::Transfer(Instant::now()),
    }
}

fn reserve_write(up: &mut Shaper, rate: &Rate, len: usize) -> WritePhase {
    if rate.is_unlimited() || len == 0 {
        return WritePhase::Transfer { reserved: len };
    }

    let reserved = len.min(chunk_len(rate, WRITE_CHUNK));
    let release = up.reserve(rate, reserved, Instant::now());
    WritePhase::Pacing { release, reserved }
}

impl<T: AsyncRead> AsyncRead for ThrottledStream<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut this = self.project();
        let rate = this.rates.down();

        let checked = this
            .close
            .check(cx, &this.close.read)
            .and_then(|()| this.down.check_deadline(cx));
        if let Err(err) = checked {
            // staged bytes keep their release slot for the next read
            *this.read_phase = ReadPhase::Idle;
            return Poll::Ready(Err(err));
        }

        // fast path
        if rate.is_passthrough() && this.staged.is_empty() {
            if buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }
            return this.inner.poll_read(cx, buf);
        }

        loop {
            match *this.read_phase {
                ReadPhase::Idle => {
                    let latency = rate.latency();
                    if !latency.is_zero() {
                        *this.read_phase =
                            ReadPhase::Latency(instant_after(Instant::now(), latency));
                        continue;
                    }
                    if buf.remaining() == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    *this.read_phase = after_read_latency(this.staged, this.down);
                }
                ReadPhase::Latency(until) => {
                    ready!(this.down.poll_until(cx, until));
                    if buf.remaining() == 0 {
                        // empty reads complete once the latency is paid
                        *this.read_phase = ReadPhase::Idle;
                        return Poll::Ready(Ok(()));
                    }
                    *this.read_phase = after_read_latency(this.staged, this.down);
                }
                ReadPhase::Transfer(started) => {
                    if rate.is_unlimited() {
                        let res = ready!(this.inner.as_mut().poll_read(cx, buf));
                        *this.read_phase = ReadPhase::Idle;
                        return Poll::Ready(res);
                    }

                    let mut chunk = [0u8; READ_CHUNK];
                    let want = buf.remaining().min(chunk_len(&rate, READ_CHUNK));
                    let mut chunk_buf = ReadBuf::new(&mut chunk[..want]);

                    let res = ready!(this.inner.as_mut().poll_read(cx, &mut chunk_buf));
                    let filled = chunk_buf.filled();
                    if res.is_err() || filled.is_empty() {
                        // errors and EOF are reported as-is
                        *this.read_phase = ReadPhase::Idle;
                        return Poll::Ready(res);
                    }

                    this.staged.extend_from_slice(filled);
                    let release = this.down.reserve(&rate, filled.len(), started);
                    *this.read_phase = ReadPhase::Pacing(release);
                }
                ReadPhase::Pacing(release) => {
                    ready!(this.down.poll_until(cx, release));
                    let amt = this.staged.len().min(buf.remaining());
                    buf.put_slice(&this.staged.split_to(amt));
                    *this.read_phase = ReadPhase::Idle;
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

impl<T: AsyncWrite> ThrottledStream<T> {
    fn abort_write(self: Pin<&mut Self>) {
        let this = self.project();
        let rate = this.rates.up();
        if let WritePhase::Pacing { reserved, .. } | WritePhase::Transfer { reserved } =
            *this.write_phase
        {
            this.up.refund(&rate, reserved);
        }
        *this.write_phase = WritePhase::Idle;
    }
}

impl<T: AsyncWrite> AsyncWrite for ThrottledStream<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let checked = {
            let this = self.as_mut().project();
            this.close
                .check(cx, &this.close.write)
                .and_then(|()| this.up.check_deadline(cx))
        };
        if let Err(err) = checked {
            self.abort_write();
            return Poll::Ready(Err(err));
        }

        let mut this = self.project();
        let rate = this.rates.up();

        // fast path
        if rate.is_passthrough() && *this.write_phase == WritePhase::Idle {
            return this.inner.poll_write(cx, buf);
        }

        loop {
            match *this.write_phase {
                WritePhase::Idle => {
                    let latency = rate.latency();
                    *this.write_phase = if latency.is_zero() {
                        reserve_write(this.up, &rate, buf.len())
                    } else {
                        WritePhase::Latency(instant_after(Instant::now(), latency))
                    };
                }
                WritePhase::Latency(until) => {
                    ready!(this.up.poll_until(cx, until));
                    *this.write_phase = reserve_write(this.up, &rate, buf.len());
                }
                WritePhase::Pacing { release, reserved } => {
                    ready!(this.up.poll_until(cx, release));
                    *this.write_phase = WritePhase::Transfer { reserved };
                }
                WritePhase::Transfer { reserved } => {
                    if buf.is_empty() {
                        *this.write_phase = WritePhase::Idle;
                        return Poll::Ready(Ok(0));
                    }

                    let len = buf.len().min(reserved);
                    let res = ready!(this.inner.as_mut().poll_write(cx, &buf[..len]));
                    *this.write_phase = WritePhase::Idle;

                    let written = *res.as_ref().unwrap_or(&0);
                    this.up.refund(&rate, reserved.saturating_sub(written));
                    return Poll::Ready(res);
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        if *this.shut_down {
            return Poll::Ready(Ok(()));
        }

        ready!(this.inner.poll_shutdown(cx))?;
        *this.shut_down = true;
        Poll::Ready(Ok(()))
    }
}

impl<T: fmt::Debug> fmt::Debug for ThrottledStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottledStream")
            .field("inner", &self.inner)
            .field("rates", &self.rates)
            .field("closed", &self.is_closed())
            .finish()
    }
}
