//! Sliding-window admission limiting and the backoff arithmetic shared
//! with the OTP engine.

mod backoff;
mod client;
mod decision;
mod limiter;

pub use backoff::{backoff, BackoffPolicy};
pub use client::client_identifier;
pub use decision::Decision;
pub use limiter::{LimitInfo, LimiterStats, RateLimiter};
