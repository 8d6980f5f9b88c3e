//! Token-bucket bandwidth shaping for the tunnel data plane.
//!
//! [`RateBucket`] is the pure state machine: all time is injected, so the
//! shaping policy is testable without sleeping. [`RateLimiter`] wraps it for
//! concurrent use by the two pump tasks and the reload controller.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod bucket;
mod limiter;

pub use bucket::{BucketConfig, BucketMetrics, Decision, RateBucket};
pub use limiter::RateLimiter;

/// Converts a configured rate in kbit/s to the bucket's byte/s unit.
pub fn kbps_to_bytes(kbps: u64) -> u64 {
    kbps * 1000 / 8
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("requested {requested} bytes but the burst capacity is {burst}; fragment the write")]
    TooLarge { requested: u64, burst: u64 },
    #[error("rate {requested} B/s is outside [{min}, {max}] B/s")]
    RateOutOfRange { requested: u64, min: u64, max: u64 },
}
