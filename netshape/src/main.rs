use std::net::SocketAddr;

use anyhow::Context;
use clap::Parser;
use thiserror::Error as ThisError;
use tokio_netshape::{Rate, Rates};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod server;

use server::Server;

const MAX_LATENCY_MS: i64 = 60 * 60 * 1000;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
struct Config {
    /// Address to listen on, e.g. 0.0.0.0:3000
    #[arg(short = 'l', long, default_value = "0.0.0.0:3000")]
    listen: SocketAddr,

    /// Bandwidth cap for both directions; 0 or less disables it
    #[arg(long, value_name = "KB/s", default_value_t = 10, allow_negative_numbers = true)]
    rate: i64,

    /// Latency added to every read and write; 0 or less disables it
    #[arg(long, value_name = "ms", default_value_t = 10, allow_negative_numbers = true)]
    latency_ms: i64,

    /// Upload (server to client) bandwidth, overrides --rate
    #[arg(long, value_name = "KB/s", allow_negative_numbers = true)]
    up_rate: Option<i64>,

    /// Download (client to server) bandwidth, overrides --rate
    #[arg(long, value_name = "KB/s", allow_negative_numbers = true)]
    down_rate: Option<i64>,

    /// Upload latency, overrides --latency-ms
    #[arg(long, value_name = "ms", allow_negative_numbers = true)]
    up_latency_ms: Option<i64>,

    /// Download latency, overrides --latency-ms
    #[arg(long, value_name = "ms", allow_negative_numbers = true)]
    down_latency_ms: Option<i64>,
}

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum ConfigError {
    #[error("--{flag} must be at most {max}ms (got {value})", max = MAX_LATENCY_MS)]
    LatencyTooLarge { flag: &'static str, value: i64 },
}

impl Config {
    fn up_latency(&self) -> i64 {
        self.up_latency_ms.unwrap_or(self.latency_ms)
    }

    fn down_latency(&self) -> i64 {
        self.down_latency_ms.unwrap_or(self.latency_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let latencies = [
            ("latency-ms", Some(self.latency_ms)),
            ("up-latency-ms", self.up_latency_ms),
            ("down-latency-ms", self.down_latency_ms),
        ];

        for (flag, value) in latencies {
            if let Some(value) = value
                && value > MAX_LATENCY_MS
            {
                return Err(ConfigError::LatencyTooLarge { flag, value });
            }
        }

        Ok(())
    }

    fn rates(&self) -> Rates {
        Rates::new(
            Rate::from_signed(self.up_rate.unwrap_or(self.rate), self.up_latency()),
            Rate::from_signed(self.down_rate.unwrap_or(self.rate), self.down_latency()),
        )
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = Config::parse();
    cfg.validate()?;
    let rates = cfg.rates();

    let mut server = Server::new(rates);
    let addr = server
        .listen(cfg.listen)
        .await
        .with_context(|| format!("failed to listen on {}", cfg.listen))?;
    info!(listen = %addr, up = %rates.up(), down = %rates.down(), "server started");

    server.serve().await
}
