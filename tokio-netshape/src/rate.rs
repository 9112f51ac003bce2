//! Shaping policies for throttled listeners and streams.
//!
//! A [`Rate`] describes how one direction of a connection is degraded: a bandwidth cap in
//! **kilobytes per second** (1 KB = 1024 bytes) and a fixed latency added to every I/O call.
//! [`Rates`] pairs the two directions:
//! - `up`: the write path, bytes the server sends to its peer.
//! - `down`: the read path, bytes the server receives from its peer.
//!
//! Both values are plain `Copy` data without setters. A listener wraps its [`Rates`] in an
//! [`Arc`] once and hands clones of that handle to every connection it accepts, so all
//! connections observe the same policy and none of them can change it.
//!
//! ```
//! use std::time::Duration;
//! use tokio_netshape::rate::{Rate, Rates};
//!
//! let slow_3g = Rate::new(50, Duration::from_millis(300));
//! let rates = Rates::new(slow_3g, Rate::new(100, Duration::from_millis(300))).shared();
//!
//! assert_eq!(rates.up().bytes_per_second(), 50 * 1024);
//! assert_eq!(rates.up().byte_time(1024), Duration::from_millis(20));
//! ```
use std::{fmt, sync::Arc, time::Duration};

/// Bytes in one kilobyte, as used by [`Rate::kilobytes_per_second`].
pub const KILOBYTE: u64 = 1024;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Bandwidth cap and latency for one direction of a connection.
///
/// A `kilobytes_per_second` of `0` disables the bandwidth cap and a zero `latency`
/// disables the delay; [`Rate::UNLIMITED`] disables both.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Rate {
    kilobytes_per_second: u64,
    latency: Duration,
}

impl Rate {
    /// No bandwidth cap and no latency: a pure pass-through.
    pub const UNLIMITED: Rate = Rate {
        kilobytes_per_second: 0,
        latency: Duration::ZERO,
    };

    /// Creates a rate of `kilobytes_per_second` (`0` = unlimited) and `latency` per call.
    pub const fn new(kilobytes_per_second: u64, latency: Duration) -> Self {
        Self {
            kilobytes_per_second,
            latency,
        }
    }

    /// Creates a rate from possibly negative inputs, as they come from loosely typed
    /// configuration.
    ///
    /// A negative bandwidth disables the cap and a negative latency disables the delay.
    pub fn from_signed(kilobytes_per_second: i64, latency_ms: i64) -> Self {
        Self {
            kilobytes_per_second: u64::try_from(kilobytes_per_second).unwrap_or(0),
            latency: u64::try_from(latency_ms)
                .map(Duration::from_millis)
                .unwrap_or(Duration::ZERO),
        }
    }

    /// The configured cap in kilobytes per second; `0` means unlimited.
    pub const fn kilobytes_per_second(&self) -> u64 {
        self.kilobytes_per_second
    }

    /// The configured cap in bytes per second; `0` means unlimited.
    pub const fn bytes_per_second(&self) -> u64 {
        self.kilobytes_per_second.saturating_mul(KILOBYTE)
    }

    /// The latency added once to every read or write call.
    pub const fn latency(&self) -> Duration {
        self.latency
    }

    /// Returns `true` when no bandwidth cap is configured.
    pub const fn is_unlimited(&self) -> bool {
        self.kilobytes_per_second == 0
    }

    /// Returns `true` when neither a cap nor a latency is configured.
    pub const fn is_passthrough(&self) -> bool {
        self.is_unlimited() && self.latency.is_zero()
    }

    /// Time it takes to move `bytes` at this rate, rounded up to the next nanosecond.
    ///
    /// Always [`Duration::ZERO`] for an unlimited rate or an empty transfer.
    pub fn byte_time(&self, bytes: usize) -> Duration {
        let bps = self.bytes_per_second() as u128;
        if bps == 0 || bytes == 0 {
            return Duration::ZERO;
        }

        let nanos = (bytes as u128 * NANOS_PER_SEC).div_ceil(bps);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unlimited() {
            write!(f, "unlimited")?;
        } else {
            write!(f, "{} KB/s", self.kilobytes_per_second)?;
        }
        write!(f, ", {:?} latency", self.latency)
    }
}

/// Upload and download policies applied to every connection of a listener.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Rates {
    up: Rate,
    down: Rate,
}

impl Rates {
    /// Pairs an upload (write path) and a download (read path) policy.
    pub const fn new(up: Rate, down: Rate) -> Self {
        Self { up, down }
    }

    /// Applies the same policy in both directions.
    pub const fn symmetric(rate: Rate) -> Self {
        Self { up: rate, down: rate }
    }

    /// Policy for bytes written to the peer.
    pub const fn up(&self) -> Rate {
        self.up
    }

    /// Policy for bytes read from the peer.
    pub const fn down(&self) -> Rate {
        self.down
    }

    /// Freezes the pair into a shareable handle.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_time_follows_kilobytes_per_second() {
        let rate = Rate::new(10, Duration::ZERO);
        assert_eq!(rate.bytes_per_second(), 10 * 1024);
        assert_eq!(rate.byte_time(10 * 1024), Duration::from_secs(1));
        assert_eq!(rate.byte_time(1024), Duration::from_millis(100));
        assert_eq!(rate.byte_time(0), Duration::ZERO);
    }

    #[test]
    fn byte_time_rounds_up() {
        // 1 byte at 3 KB/s is 325520.83..ns
        let rate = Rate::new(3, Duration::ZERO);
        assert_eq!(rate.byte_time(1), Duration::from_nanos(325_521));
    }

    #[test]
    fn unlimited_rate_never_costs_time() {
        assert!(Rate::UNLIMITED.is_unlimited());
        assert!(Rate::UNLIMITED.is_passthrough());
        assert_eq!(Rate::UNLIMITED.byte_time(usize::MAX), Duration::ZERO);

        let latency_only = Rate::new(0, Duration::from_millis(5));
        assert!(latency_only.is_unlimited());
        assert!(!latency_only.is_passthrough());
    }

    #[test]
    fn negative_inputs_disable_the_dimension() {
        let rate = Rate::from_signed(-5, 20);
        assert!(rate.is_unlimited());
        assert_eq!(rate.latency(), Duration::from_millis(20));

        let rate = Rate::from_signed(8, -1);
        assert_eq!(rate.kilobytes_per_second(), 8);
        assert!(rate.latency().is_zero());

        assert_eq!(Rate::from_signed(-1, -1), Rate::UNLIMITED);
    }

    #[test]
    fn huge_rates_saturate() {
        let rate = Rate::new(u64::MAX, Duration::ZERO);
        assert_eq!(rate.bytes_per_second(), u64::MAX);
        assert_eq!(rate.byte_time(1), Duration::from_nanos(1));
    }

    #[test]
    fn rates_keep_directions_apart() {
        let up = Rate::new(1, Duration::from_millis(1));
        let down = Rate::new(2, Duration::from_millis(2));
        let rates = Rates::new(up, down).shared();
        assert_eq!(rates.up(), up);
        assert_eq!(rates.down(), down);
        assert_eq!(Rates::symmetric(up).down(), up);
    }

    #[test]
    fn display_is_human_readable() {
        assert_eq!(
            Rate::new(10, Duration::from_millis(10)).to_string(),
            "10 KB/s, 10ms latency"
        );
        assert_eq!(Rate::UNLIMITED.to_string(), "unlimited, 0ns latency");
    }
}
