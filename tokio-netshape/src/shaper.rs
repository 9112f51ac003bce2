//! Per-direction shaping bookkeeping shared by the read and write paths of
//! [`ThrottledStream`](crate::stream::ThrottledStream).
//!
//! A [`Shaper`] owns everything one direction needs between polls:
//! - the **accounting window**: the paced release instant of the previous transfer,
//! - a reusable timer for latency and pacing sleeps,
//! - an optional caller-set deadline with its own timer.
//!
//! ## Accounting
//! Every transfer of `n` bytes is given a release slot
//! `max(previous_release, transfer_start) + n / rate`. The slot is never reset between calls,
//! so a burst of tiny operations pays for its bytes exactly like one large operation, and an
//! idle link does not bank credit for a later burst. Consecutive releases are therefore at
//! least `n / rate` apart, which bounds the bytes released in any window of length `T` by
//! `rate * T` plus the chunk that opens the window.
//!
//! Timers are boxed lazily: a direction that never sleeps never allocates one.
use std::{
    future::Future,
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::time::{Instant, Sleep, sleep_until};

use crate::{error::deadline_exceeded, rate::Rate};

/// Stand-in for instants too far out to represent: roughly 30 years from the base.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `from + delay`, saturating at a far-future instant instead of overflowing.
pub(crate) fn instant_after(from: Instant, delay: Duration) -> Instant {
    from.checked_add(delay)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

/// A lazily allocated, re-armable tokio timer.
#[derive(Default)]
pub(crate) struct Timer {
    sleep: Option<Pin<Box<Sleep>>>,
}

impl Timer {
    /// Resolves once `at` has been reached.
    ///
    /// Instants already in the past resolve without touching the timer wheel.
    pub(crate) fn poll_until(&mut self, cx: &mut Context<'_>, at: Instant) -> Poll<()> {
        if Instant::now() >= at {
            return Poll::Ready(());
        }

        match self.sleep.as_mut() {
            Some(sleep) => {
                if sleep.deadline() != at {
                    sleep.as_mut().reset(at);
                }
                sleep.as_mut().poll(cx)
            }
            None => self
                .sleep
                .insert(Box::pin(sleep_until(at)))
                .as_mut()
                .poll(cx),
        }
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self) -> bool {
        self.sleep.is_some()
    }
}

/// Shaping state for one direction of one connection.
#[derive(Default)]
pub(crate) struct Shaper {
    released_at: Option<Instant>,
    pub(crate) timer: Timer,
    deadline: Option<Instant>,
    deadline_timer: Timer,
}

impl Shaper {
    /// Paced release instant of the most recent transfer, if any.
    pub(crate) fn released_at(&self) -> Option<Instant> {
        self.released_at
    }

    /// Books a release slot for `bytes` transferred from `started` on and returns it.
    pub(crate) fn reserve(&mut self, rate: &Rate, bytes: usize, started: Instant) -> Instant {
        let from = self
            .released_at
            .map_or(started, |previous| previous.max(started));
        let release = instant_after(from, rate.byte_time(bytes));
        self.released_at = Some(release);
        release
    }

    /// Gives back the part of the latest reservation that was not transferred.
    pub(crate) fn refund(&mut self, rate: &Rate, bytes: usize) {
        let unused = rate.byte_time(bytes);
        if let Some(released_at) = self.released_at.as_mut()
            && let Some(earlier) = released_at.checked_sub(unused)
        {
            *released_at = earlier;
        }
    }

    /// Sleeps until `at`.
    pub(crate) fn poll_until(&mut self, cx: &mut Context<'_>, at: Instant) -> Poll<()> {
        self.timer.poll_until(cx, at)
    }

    pub(crate) fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fails once the deadline has elapsed; otherwise registers a wakeup for it.
    pub(crate) fn check_deadline(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        let Some(deadline) = self.deadline else {
            return Ok(());
        };

        match self.deadline_timer.poll_until(cx, deadline) {
            Poll::Ready(()) => {
                tracing::trace!(?deadline, "throttled i/o deadline exceeded");
                Err(deadline_exceeded())
            }
            Poll::Pending => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: Rate = Rate::new(1, Duration::ZERO); // 1024 B/s

    #[tokio::test(start_paused = true)]
    async fn reservations_accumulate_across_calls() {
        let mut shaper = Shaper::default();
        let start = Instant::now();

        let first = shaper.reserve(&RATE, 512, start);
        assert_eq!(first, start + Duration::from_millis(500));

        // Issued immediately again: queued behind the first slot, not reset.
        let second = shaper.reserve(&RATE, 512, start);
        assert_eq!(second, start + Duration::from_secs(1));
        assert_eq!(shaper.released_at(), Some(second));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_time_is_not_banked() {
        let mut shaper = Shaper::default();
        let start = Instant::now();
        shaper.reserve(&RATE, 1024, start);

        let later = start + Duration::from_secs(10);
        let release = shaper.reserve(&RATE, 1024, later);
        assert_eq!(release, later + Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn refund_returns_unused_bandwidth() {
        let mut shaper = Shaper::default();
        let start = Instant::now();
        shaper.reserve(&RATE, 1024, start);
        shaper.refund(&RATE, 256);
        assert_eq!(
            shaper.released_at(),
            Some(start + Duration::from_millis(750))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unlimited_rate_releases_immediately() {
        let mut shaper = Shaper::default();
        let start = Instant::now();
        assert_eq!(shaper.reserve(&Rate::UNLIMITED, 1 << 20, start), start);
    }

    #[tokio::test(start_paused = true)]
    async fn unrepresentable_instants_saturate() {
        let now = Instant::now();
        assert_eq!(instant_after(now, Duration::MAX), now + FAR_FUTURE);
        assert_eq!(
            instant_after(now, Duration::from_secs(1)),
            now + Duration::from_secs(1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fails_only_after_it_elapses() {
        let mut shaper = Shaper::default();
        shaper.set_deadline(Some(Instant::now() + Duration::from_millis(50)));

        futures::future::poll_fn(|cx| {
            assert!(shaper.check_deadline(cx).is_ok());
            Poll::Ready(())
        })
        .await;

        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = futures::future::poll_fn(|cx| Poll::Ready(shaper.check_deadline(cx)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        shaper.set_deadline(None);
        futures::future::poll_fn(|cx| Poll::Ready(shaper.check_deadline(cx)))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn timer_skips_instants_in_the_past() {
        let mut timer = Timer::default();
        let now = Instant::now();
        futures::future::poll_fn(|cx| timer.poll_until(cx, now)).await;
        assert!(!timer.is_armed());

        let later = now + Duration::from_millis(20);
        futures::future::poll_fn(|cx| timer.poll_until(cx, later)).await;
        assert!(timer.is_armed());
        assert!(Instant::now() >= later);
    }
}
