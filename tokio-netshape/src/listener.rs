//! A listener whose accepted connections are shaped.
//!
//! [`ThrottledListener`] decorates anything implementing [`Listener`] (tokio's `TcpListener`
//! and, on unix, `UnixListener` out of the box). Every accepted connection is wrapped in a fresh
//! [`ThrottledStream`] that shares the listener's [`Rates`] handle and nothing else, so each
//! connection gets its own accounting window in each direction.
//!
//! ```no_run
//! use std::time::Duration;
//! use tokio::io::{self, AsyncWriteExt};
//! use tokio::net::TcpListener;
//! use tokio_netshape::{
//!     listener::ThrottledListener,
//!     rate::{Rate, Rates},
//! };
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! let rates = Rates::symmetric(Rate::new(10, Duration::from_millis(10)));
//! let listener = ThrottledListener::new(TcpListener::bind("0.0.0.0:3000").await?, rates);
//!
//! loop {
//!     let (mut stream, peer) = listener.accept().await?;
//!     tokio::spawn(async move {
//!         let _ = stream.write_all(format!("hello {peer}\n").as_bytes()).await;
//!         let _ = stream.close().await;
//!     });
//! }
//! # }
//! ```
//!
//! ## Under the hood
//! - The inner listener sits in a `Mutex<Option<_>>` that is only held for a non-blocking poll.
//!   [`ThrottledListener::close`] takes it out and drops it, which releases the socket.
//! - A pending accept registers with an [`AtomicWaker`] so `close` can wake it; the woken accept
//!   fails with the "already closed" error. Like tokio's own `poll_accept`, only the most
//!   recently registered task is woken.
//! - Accept errors of the inner listener are returned unchanged and never retried here.
use std::{
    fmt, io,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll, ready},
};

use futures::{future::poll_fn, task::AtomicWaker};
use tokio::net::{TcpListener, ToSocketAddrs};

use crate::{error::closed_error, rate::Rates, stream::ThrottledStream};

/// A source of incoming connections.
pub trait Listener {
    /// The connection type produced by `accept`.
    type Io;
    /// The peer address type.
    type Addr: fmt::Debug;

    /// Polls for the next incoming connection.
    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(Self::Io, Self::Addr)>>;

    /// The address this listener is bound to.
    fn local_addr(&self) -> io::Result<Self::Addr>;
}

impl Listener for TcpListener {
    type Io = tokio::net::TcpStream;
    type Addr = SocketAddr;

    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(Self::Io, Self::Addr)>> {
        TcpListener::poll_accept(self, cx)
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        TcpListener::local_addr(self)
    }
}

#[cfg(unix)]
impl Listener for tokio::net::UnixListener {
    type Io = tokio::net::UnixStream;
    type Addr = tokio::net::unix::SocketAddr;

    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(Self::Io, Self::Addr)>> {
        tokio::net::UnixListener::poll_accept(self, cx)
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        tokio::net::UnixListener::local_addr(self)
    }
}

/// Wraps a [`Listener`] so that every accepted connection is a [`ThrottledStream`].
///
/// All methods take `&self`: share the listener behind an [`Arc`] to accept on one task and
/// close from another.
pub struct ThrottledListener<L> {
    inner: Mutex<Option<L>>,
    accept_waker: AtomicWaker,
    rates: Arc<Rates>,
}

impl<L: Listener> ThrottledListener<L> {
    /// Shapes connections accepted from `inner` with `rates`.
    pub fn new(inner: L, rates: Rates) -> Self {
        Self::with_shared_rates(inner, rates.shared())
    }

    /// Like [`new`](Self::new) but reuses an existing policy handle.
    pub fn with_shared_rates(inner: L, rates: Arc<Rates>) -> Self {
        Self {
            inner: Mutex::new(Some(inner)),
            accept_waker: AtomicWaker::new(),
            rates,
        }
    }

    /// Polls for the next connection and wraps it.
    pub fn poll_accept(
        &self,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<(ThrottledStream<L::Io>, L::Addr)>> {
        self.accept_waker.register(cx.waker());

        let (io, addr) = {
            let inner = self.lock();
            let Some(listener) = inner.as_ref() else {
                return Poll::Ready(Err(closed_error()));
            };
            ready!(listener.poll_accept(cx))?
        };

        tracing::debug!(peer = ?addr, "accepted throttled connection");
        Poll::Ready(Ok((ThrottledStream::new(io, self.rates.clone()), addr)))
    }

    /// Waits for the next connection and wraps it.
    pub async fn accept(&self) -> io::Result<(ThrottledStream<L::Io>, L::Addr)> {
        poll_fn(|cx| self.poll_accept(cx)).await
    }

    /// The address of the inner listener; the "already closed" error after [`close`](Self::close).
    pub fn local_addr(&self) -> io::Result<L::Addr> {
        self.lock()
            .as_ref()
            .ok_or_else(closed_error)?
            .local_addr()
    }
}

impl<L> ThrottledListener<L> {
    /// Closes the inner listener and fails any pending or later accept.
    ///
    /// Already accepted connections are not affected. Closing twice is a no-op.
    pub fn close(&self) -> io::Result<()> {
        let listener = self.lock().take();
        if listener.is_some() {
            tracing::debug!("throttled listener closed");
        }
        drop(listener);
        self.accept_waker.wake();
        Ok(())
    }

    /// Returns `true` once [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    /// The policy handed to every accepted connection.
    pub fn rates(&self) -> &Arc<Rates> {
        &self.rates
    }

    fn lock(&self) -> MutexGuard<'_, Option<L>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ThrottledListener<TcpListener> {
    /// Binds a TCP listener on `addr` and shapes its connections with `rates`.
    pub async fn bind(addr: impl ToSocketAddrs, rates: Rates) -> io::Result<Self> {
        Ok(Self::new(TcpListener::bind(addr).await?, rates))
    }
}

impl<L: fmt::Debug> fmt::Debug for ThrottledListener<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottledListener")
            .field("inner", &*self.lock())
            .field("rates", &self.rates)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::is_closed, rate::Rate};
    use std::time::Duration;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex},
        net::TcpStream,
        sync::mpsc,
        time::{Instant, sleep},
    };

    async fn loopback(rates: Rates) -> ThrottledListener<TcpListener> {
        ThrottledListener::bind("127.0.0.1:0", rates).await.unwrap()
    }

    #[tokio::test]
    async fn accepted_connections_share_the_policy() {
        let listener = loopback(Rates::default()).await;
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();

        assert_eq!(peer, client.local_addr().unwrap());
        assert_eq!(stream.peer_addr().unwrap(), peer);
        assert!(Arc::ptr_eq(stream.rates(), listener.rates()));
    }

    #[tokio::test]
    async fn accepted_connections_are_shaped() {
        let latency = Duration::from_millis(50);
        let listener = loopback(Rates::new(Rate::new(0, latency), Rate::UNLIMITED)).await;
        let mut client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (mut stream, _) = listener.accept().await.unwrap();

        let start = Instant::now();
        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert!(start.elapsed() >= latency);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_later_calls() {
        let listener = loopback(Rates::default()).await;
        listener.close().unwrap();
        listener.close().unwrap();
        assert!(listener.is_closed());

        let err = listener.accept().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(is_closed(&err));
        assert!(is_closed(&listener.local_addr().unwrap_err()));
    }

    #[tokio::test]
    async fn close_releases_the_port() {
        let listener = loopback(Rates::default()).await;
        let addr = listener.local_addr().unwrap();
        listener.close().unwrap();

        TcpListener::bind(addr).await.unwrap();
    }

    #[tokio::test]
    async fn close_wakes_a_pending_accept() {
        let listener = Arc::new(loopback(Rates::default()).await);
        let accepting = tokio::spawn({
            let listener = listener.clone();
            async move { listener.accept().await.map(|_| ()) }
        });

        sleep(Duration::from_millis(20)).await;
        listener.close().unwrap();

        let err = accepting.await.unwrap().unwrap_err();
        assert!(is_closed(&err));
    }

    struct Refusing;

    impl Listener for Refusing {
        type Io = DuplexStream;
        type Addr = ();

        fn poll_accept(&self, _: &mut Context<'_>) -> Poll<io::Result<(DuplexStream, ())>> {
            Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "refused",
            )))
        }

        fn local_addr(&self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn accept_errors_pass_through_unchanged() {
        let listener = ThrottledListener::new(Refusing, Rates::default());

        let err = listener.accept().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert_eq!(err.to_string(), "refused");
        assert!(!listener.is_closed());
    }

    /// Hands out in-memory connections pushed into a channel.
    struct Pipes(Mutex<mpsc::UnboundedReceiver<DuplexStream>>);

    impl Listener for Pipes {
        type Io = DuplexStream;
        type Addr = ();

        fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(DuplexStream, ())>> {
            let mut incoming = self.0.lock().unwrap();
            match ready!(incoming.poll_recv(cx)) {
                Some(io) => Poll::Ready(Ok((io, ()))),
                None => Poll::Ready(Err(io::ErrorKind::ConnectionAborted.into())),
            }
        }

        fn local_addr(&self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_connections_get_their_own_budget() {
        let (connect, incoming) = mpsc::unbounded_channel();
        let listener = ThrottledListener::new(
            Pipes(Mutex::new(incoming)),
            Rates::new(Rate::UNLIMITED, Rate::new(4, Duration::ZERO)),
        );

        let mut clients = Vec::new();
        for _ in 0..2 {
            let (server_side, mut client) = duplex(8 * 1024);
            client.write_all(&[7u8; 4096]).await.unwrap();
            connect.send(server_side).unwrap();
            clients.push(client);
        }

        let start = Instant::now();
        let mut downloads = Vec::new();
        for _ in 0..2 {
            let (mut stream, ()) = listener.accept().await.unwrap();
            assert!(Arc::ptr_eq(stream.rates(), listener.rates()));
            downloads.push(tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                stream.read_exact(&mut buf).await.unwrap();
                assert!(buf.iter().all(|&b| b == 7));
            }));
        }
        for download in downloads {
            download.await.unwrap();
        }

        // 4 KiB each at 4 KB/s: ~1s side by side, 2s if they shared one window
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(1), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1500), "{elapsed:?}");
        drop(clients);
    }
}
