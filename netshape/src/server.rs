use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::State,
    routing::get,
};
use chrono::Utc;
use serde::Serialize;
use tokio::{
    net::{TcpListener, TcpStream, ToSocketAddrs},
    signal,
};
use tokio_netshape::{Rate, Rates, ThrottledListener, ThrottledStream, error::is_closed};
use tracing::{debug, error, info, warn};

const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// HTTP server whose connections all go through a [`ThrottledListener`].
pub struct Server {
    router: Router,
    rates: Arc<Rates>,
    listener: Option<TcpListener>,
}

impl Server {
    pub fn new(rates: Rates) -> Self {
        let rates = rates.shared();
        Self {
            router: routes(rates.clone()),
            rates,
            listener: None,
        }
    }

    /// Binds `addr` unless a listener is already bound, and returns the bound address.
    pub async fn listen(&mut self, addr: impl ToSocketAddrs) -> io::Result<SocketAddr> {
        if let Some(listener) = &self.listener {
            return listener.local_addr();
        }

        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        self.listener = Some(listener);
        Ok(local)
    }

    /// Serves until Ctrl-C.
    pub async fn serve(self) -> anyhow::Result<()> {
        self.serve_with_shutdown(async {
            if let Err(err) = signal::ctrl_c().await {
                error!(%err, "failed to listen for Ctrl-C");
            }
        })
        .await
    }

    /// Serves until `shutdown` resolves, then waits for open connections to finish.
    pub async fn serve_with_shutdown<F>(mut self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.listener.is_none() {
            warn!("no listen address set, binding an ephemeral port");
        }
        let addr = self.listen("0.0.0.0:0").await?;
        let listener = self
            .listener
            .take()
            .context("listener disappeared before serving")?;

        let listener = Arc::new(ThrottledListener::with_shared_rates(listener, self.rates));
        let closing = listener.clone();

        info!(%addr, "serving");
        let served = axum::serve(ServeListener::new(listener.clone()), self.router)
            .with_graceful_shutdown(async move {
                shutdown.await;
                info!("shutting down");
                if let Err(err) = closing.close() {
                    warn!(%err, "failed to close listener");
                }
            })
            .await;

        listener.close()?;
        served.context("http server failed")
    }
}

/// Adapts a shared [`ThrottledListener`] to axum's accept loop.
///
/// axum expects `accept` to always produce a connection, so failures are logged here and the
/// accept retried; a closed listener never yields again.
pub struct ServeListener {
    inner: Arc<ThrottledListener<TcpListener>>,
}

impl ServeListener {
    pub fn new(inner: Arc<ThrottledListener<TcpListener>>) -> Self {
        Self { inner }
    }
}

impl axum::serve::Listener for ServeListener {
    type Io = ThrottledStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.inner.accept().await {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "connection accepted");
                    return (stream, addr);
                }
                Err(err) if is_closed(&err) => {
                    debug!("listener closed, no more connections");
                    std::future::pending::<()>().await;
                }
                Err(err) => handle_accept_error(err).await,
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

async fn handle_accept_error(err: io::Error) {
    if is_connection_error(&err) {
        return;
    }

    error!(%err, "accept failed, retrying in {ACCEPT_BACKOFF:?}");
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}

fn is_connection_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

fn routes(rates: Arc<Rates>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(|| async { "ok" }))
        .route("/rates", get(current_rates))
        .with_state(rates)
}

async fn index() -> String {
    format!("Hello World!! the time is {}\n", Utc::now())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateStatus {
    kilobytes_per_second: u64,
    latency_ms: u64,
}

impl From<Rate> for RateStatus {
    fn from(rate: Rate) -> Self {
        Self {
            kilobytes_per_second: rate.kilobytes_per_second(),
            latency_ms: u64::try_from(rate.latency().as_millis()).unwrap_or(u64::MAX),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RatesStatus {
    up: RateStatus,
    down: RateStatus,
}

async fn current_rates(State(rates): State<Arc<Rates>>) -> Json<RatesStatus> {
    Json(RatesStatus {
        up: rates.up().into(),
        down: rates.down().into(),
    })
}
