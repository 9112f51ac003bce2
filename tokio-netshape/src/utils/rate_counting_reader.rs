//! Throughput measurement for asynchronous readers.
//!
//! [`RateCountingReader`] wraps any `AsyncRead` and accumulates bytes plus the instant of the
//! first non-empty read, so you can query the average bytes-per-second figure. It reads the
//! clock through [`tokio::time::Instant`], which makes it usable under a paused test runtime
//! where shaping delays cost no wall time.
//!
//! ## Example
//! ```no_run
//! use std::time::Duration;
//! use tokio::io::{self, AsyncReadExt, AsyncWriteExt, duplex};
//! use tokio_netshape::io::NetShapeExt;
//! use tokio_netshape::rate::{Rate, Rates};
//! use tokio_netshape::utils::rate_counting_reader::RateCountingReader;
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! let (mut writer, reader) = duplex(64 * 1024);
//! let rates = Rates::new(Rate::UNLIMITED, Rate::new(4, Duration::ZERO)).shared();
//! let mut reader = RateCountingReader::new(reader.throttle(rates));
//!
//! writer.write_all(&[0u8; 8192]).await?;
//! let mut buf = vec![0u8; 8192];
//! reader.read_exact(&mut buf).await?;
//! assert!(reader.rate_bps().unwrap() <= 4.0 * 1024.0 * 1.5);
//! # Ok(()) }
//! ```
use std::{
    fmt, io,
    pin::Pin,
    task::{Context, Poll},
};

use pin_project::pin_project;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    time::Instant,
};

/// Counts bytes flowing through an `AsyncRead` and reports the average rate.
///
/// - The clock starts at the **first non-empty** read, so latency before it is not counted.
/// - `rate_bps()` returns `None` until at least one byte has been read.
/// - Writes pass through uncounted.
#[pin_project]
pub struct RateCountingReader<T> {
    #[pin]
    inner: T,
    total_bytes: u64,
    start: Option<Instant>,
}

impl<T> RateCountingReader<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            total_bytes: 0,
            start: None,
        }
    }

    /// Total bytes read so far (saturating).
    pub fn total(&self) -> u64 {
        self.total_bytes
    }

    /// When the first non-empty read completed.
    pub fn start_instant(&self) -> Option<Instant> {
        self.start
    }

    /// Average read rate since [`start_instant`](Self::start_instant) in bytes per second.
    pub fn rate_bps(&self) -> Option<f64> {
        let start = self.start?;
        // clamp so a single instant read does not divide by zero
        let elapsed = start.elapsed().as_secs_f64().max(1e-6);
        Some(self.total_bytes as f64 / elapsed)
    }

    pub fn reset(&mut self) {
        self.total_bytes = 0;
        self.start = None;
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: fmt::Debug> fmt::Debug for RateCountingReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateCountingReader")
            .field("inner", &self.inner)
            .field("total_bytes", &self.total_bytes)
            .field("start", &self.start)
            .finish()
    }
}

impl<T: AsyncRead> AsyncRead for RateCountingReader<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();

        let res = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            let read = (buf.filled().len() - before) as u64;
            if read > 0 {
                *this.total_bytes = this.total_bytes.saturating_add(read);
                this.start.get_or_insert_with(Instant::now);
            }
        }
        res
    }
}

impl<T: AsyncWrite> AsyncWrite for RateCountingReader<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
