//! One-time-code issuance and verification.
//!
//! Codes are scoped to an (email, client identifier) pair. Issuance is
//! throttled by a backoff guard that doubles with every request in the
//! generation window, and exhausting the verification attempt budget starts
//! a cooldown that doubles with every consecutive exhaustion.

mod code;
mod engine;
mod error;
mod record;

pub use code::{constant_time_eq, generate_code, is_well_formed};
pub use engine::{IssuedOtp, OtpEngine, Verification};
pub use error::{CooldownReason, OtpError};
pub use record::{CooldownRecord, OtpKey, OtpRecord};
