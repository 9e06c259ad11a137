//! Passive observability for the throttling core.
//!
//! The registry is updated inline by the limiter and the OTP engine; the
//! collector samples store-side state on its own task and shares nothing
//! with the request path beyond the registry.

mod collector;
mod metrics;

pub use collector::{Collector, CollectorHandle};
pub use metrics::Metrics;
