//! Warden - Throttling & Cooldown Engine
//!
//! This crate implements the two throttling primitives of a multi-tenant
//! task-tracking API: a sliding-window admission limiter and a one-time-code
//! issuance/verification engine with exponential-backoff cooldowns. Both keep
//! all of their state in a shared atomic store (Redis in production, an
//! in-memory fake in tests) and hold nothing authoritative in-process.

pub mod clock;
pub mod config;
pub mod error;
pub mod observability;
pub mod otp;
pub mod ratelimit;
pub mod store;
