//! Marker errors surfaced by throttled listeners and streams.
//!
//! Transport errors from the wrapped listener or stream are always returned unchanged. The
//! shaping layer only adds two failures of its own, each carried inside an [`io::Error`] so
//! callers can match on the kind or downcast the payload:
//!
//! | condition                         | `io::ErrorKind` | payload            |
//! |-----------------------------------|-----------------|--------------------|
//! | listener or stream already closed | `NotConnected`  | [`ClosedError`]    |
//! | caller-set deadline elapsed       | `TimedOut`      | [`DeadlineExceeded`] |
use std::{error::Error, fmt, io};

/// Returned when a closed listener or stream is used.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ClosedError;

/// Singleton instance carried by [`closed_error`].
pub const CLOSED_ERROR: ClosedError = ClosedError;

impl fmt::Display for ClosedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "use of closed throttled connection")
    }
}

impl Error for ClosedError {}

/// Returned when a read or write deadline elapses before the operation completes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DeadlineExceeded;

/// Singleton instance carried by [`deadline_exceeded`].
pub const DEADLINE_EXCEEDED: DeadlineExceeded = DeadlineExceeded;

impl fmt::Display for DeadlineExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i/o deadline exceeded")
    }
}

impl Error for DeadlineExceeded {}

/// `io::Error` of kind `NotConnected` wrapping [`CLOSED_ERROR`].
pub fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, CLOSED_ERROR)
}

/// `io::Error` of kind `TimedOut` wrapping [`DEADLINE_EXCEEDED`].
pub fn deadline_exceeded() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, DEADLINE_EXCEEDED)
}

/// Returns `true` if `err` was produced by [`closed_error`].
pub fn is_closed(err: &io::Error) -> bool {
    err.get_ref()
        .is_some_and(|inner| inner.downcast_ref::<ClosedError>().is_some())
}

/// Returns `true` if `err` was produced by [`deadline_exceeded`].
pub fn is_deadline_exceeded(err: &io::Error) -> bool {
    err.get_ref()
        .is_some_and(|inner| inner.downcast_ref::<DeadlineExceeded>().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_keep_kind_and_payload() {
        let err = closed_error();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(is_closed(&err));
        assert!(!is_deadline_exceeded(&err));
        assert_eq!(err.to_string(), CLOSED_ERROR.to_string());

        let err = deadline_exceeded();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(is_deadline_exceeded(&err));
        assert!(!is_closed(&err));
    }

    #[test]
    fn foreign_errors_are_not_markers() {
        let err = io::Error::new(io::ErrorKind::TimedOut, "socket timeout");
        assert!(!is_deadline_exceeded(&err));
        assert!(!is_closed(&io::Error::from(io::ErrorKind::NotConnected)));
    }
}
