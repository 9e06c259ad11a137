//! Shared atomic state store.
//!
//! Everything the limiter and the OTP engine know lives here; the components
//! themselves keep no authoritative state between calls.
//!
//! ## Key layout
//!
//! ```text
//! rate_limit:{identifier}                  → ordered set of admissions
//! otp:code:{email}:{identifier}            → OTP record JSON
//! otp:cooldown:{email}:{identifier}        → cooldown record JSON
//! otp:generation:{email}:{identifier}      → "recently issued" guard
//! otp:generation:count:{email}:{identifier} → issuance counter
//! ```

mod backend;
mod memory;
mod redis;

pub use backend::{AtomicStore, StoreError, StoreResult, Swap, WindowOutcome, WindowRequest};
pub use memory::MemoryStore;
pub use self::redis::RedisStore;
