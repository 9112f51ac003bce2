//! NetShape extension traits and helpers.
//!
//! These blanket impls let you bolt shaping straight onto any stream without going through a
//! [`ThrottledListener`](crate::listener::ThrottledListener), e.g. to slow down a client
//! connection or an in-memory [`DuplexStream`](tokio::io::DuplexStream) in a test.
//!
//! ```no_run
//! use std::time::Duration;
//! use tokio::io::{self, AsyncWriteExt};
//! use tokio::net::TcpStream;
//! use tokio_netshape::io::NetShapeExt;
//! use tokio_netshape::rate::{Rate, Rates};
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! let rates = Rates::new(
//!     Rate::new(8, Duration::from_millis(50)),
//!     Rate::UNLIMITED,
//! )
//! .shared();
//!
//! let mut stream = TcpStream::connect("127.0.0.1:12345").await?.throttle(rates);
//! stream.write_all(b"ping").await?; // 50ms latency, then paced at 8 KB/s
//! # Ok(()) }
//! ```
//!
//! ## Under the hood
//! - [`NetShapeExt`] is blanket-implemented for every `AsyncRead + AsyncWrite` and returns the
//!   [`ThrottledStream`] adapter from [`stream`](crate::stream).
//! - [`SocketAddrs`] exposes endpoint addresses of the socket types tokio ships, so a
//!   throttled stream can report them without unwrapping.
use std::{io, net::SocketAddr, sync::Arc};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::{rate::Rates, stream::ThrottledStream};

/// Endpoint addresses of a connected socket.
///
/// # Type behavior
/// - **`tokio::net::TcpStream`**: `SocketAddr` of both ends.
/// - **`tokio::net::UnixStream`**: `unix::SocketAddr` of both ends (usually unnamed on the
///   client side).
pub trait SocketAddrs {
    type Addr;

    fn local_addr(&self) -> io::Result<Self::Addr>;

    fn peer_addr(&self) -> io::Result<Self::Addr>;
}

impl SocketAddrs for tokio::net::TcpStream {
    type Addr = SocketAddr;

    fn local_addr(&self) -> io::Result<SocketAddr> {
        tokio::net::TcpStream::local_addr(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        tokio::net::TcpStream::peer_addr(self)
    }
}

#[cfg(unix)]
impl SocketAddrs for tokio::net::UnixStream {
    type Addr = tokio::net::unix::SocketAddr;

    fn local_addr(&self) -> io::Result<Self::Addr> {
        tokio::net::UnixStream::local_addr(self)
    }

    fn peer_addr(&self) -> io::Result<Self::Addr> {
        tokio::net::UnixStream::peer_addr(self)
    }
}

/// Shaping ergonomics for any bidirectional stream.
///
/// # Examples
/// ```
/// use std::time::Duration;
/// use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
/// use tokio_netshape::io::NetShapeExt;
/// use tokio_netshape::rate::{Rate, Rates};
///
/// # async fn example() {
/// let rates = Rates::symmetric(Rate::new(64, Duration::from_millis(5))).shared();
/// let (mut peer, stream) = duplex(64);
/// let mut stream = stream.throttle(rates);
/// peer.write_all(b"hello").await.unwrap();
/// let mut buf = vec![0; 5];
/// stream.read_exact(&mut buf).await.unwrap();
/// assert_eq!(&buf, b"hello");
/// # }
/// ```
pub trait NetShapeExt: AsyncRead + AsyncWrite {
    /// Wraps this stream so its reads follow `rates.down()` and its writes `rates.up()`.
    #[must_use]
    fn throttle(self, rates: Arc<Rates>) -> ThrottledStream<Self>
    where
        Self: Sized,
    {
        ThrottledStream::new(self, rates)
    }
}

impl<T: AsyncRead + AsyncWrite> NetShapeExt for T {}
