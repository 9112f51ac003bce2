//! Bandwidth and latency shaping for Tokio listeners and streams.
//!
//! `tokio-netshape` simulates a slow network link under an otherwise unmodified server: wrap
//! the listener in a [`ThrottledListener`] and every accepted connection becomes a
//! [`ThrottledStream`] whose reads (download) and writes (upload) are paced to a
//! kilobytes-per-second cap and delayed by a fixed latency per call.
//!
//! ```no_run
//! use std::time::Duration;
//! use tokio::io;
//! use tokio_netshape::{Rate, Rates, ThrottledListener};
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! let rates = Rates::symmetric(Rate::new(10, Duration::from_millis(10)));
//! let listener = ThrottledListener::bind("127.0.0.1:3000", rates).await?;
//! let (stream, peer) = listener.accept().await?;
//! # drop((stream, peer));
//! # Ok(()) }
//! ```
//!
//! Modules:
//! - [`rate`]: the [`Rate`] / [`Rates`] policy values.
//! - [`listener`]: [`ThrottledListener`] and the [`Listener`](listener::Listener) trait.
//! - [`stream`]: [`ThrottledStream`], its [`Closer`](stream::Closer) and deadlines.
//! - [`io`]: the [`NetShapeExt`](io::NetShapeExt) extension trait.
//! - [`error`]: marker errors for closed resources and elapsed deadlines.
//! - [`utils`]: throughput measurement for tests.
pub mod error;
pub mod io;
pub mod listener;
pub mod rate;
mod shaper;
pub mod stream;
pub mod utils;

pub use listener::ThrottledListener;
pub use rate::{Rate, Rates};
pub use stream::ThrottledStream;
