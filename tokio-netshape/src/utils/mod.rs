//! Helpers for measuring shaped streams.
pub mod rate_counting_reader;
