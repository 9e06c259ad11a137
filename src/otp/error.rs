//! Structured OTP outcomes.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::store::StoreError;

/// Why an issuance request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownReason {
    /// A code was issued too recently.
    RecentlyIssued,
    /// Verification failed too often.
    VerificationFailures,
}

impl std::fmt::Display for CooldownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CooldownReason::RecentlyIssued => {
                write!(f, "OTP was recently sent. Please wait before requesting another.")
            }
            CooldownReason::VerificationFailures => {
                write!(f, "Too many OTP requests. Please try again later.")
            }
        }
    }
}

/// Errors returned by the OTP engine.
#[derive(Debug, Error)]
pub enum OtpError {
    /// Issuance refused until `cooldown_until`.
    #[error("{reason}")]
    Cooldown {
        reason: CooldownReason,
        retry_after: Duration,
        cooldown_until: DateTime<Utc>,
        /// Remaining validity of a code that is still live, if any was checked.
        otp_expires_in: Option<Duration>,
    },

    #[error("OTP not found or expired. Please request a new one.")]
    NotFound,

    #[error("This OTP has already been used.")]
    AlreadyVerified,

    #[error("OTP has expired. Please request a new one.")]
    Expired,

    /// The attempt budget is spent and a verification cooldown is running.
    #[error("Maximum OTP attempts exceeded. Please request a new OTP.")]
    AttemptsExceeded {
        retry_after: Duration,
        cooldown_until: DateTime<Utc>,
    },

    #[error("Invalid OTP code.")]
    Invalid { remaining_attempts: u32 },

    /// Caller-correctable input problem; nothing was written.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The store failed; verification is refused rather than bypassed.
    #[error("OTP service unavailable: {0}")]
    Internal(#[from] StoreError),
}

impl OtpError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            OtpError::Cooldown { .. } => "OTP_COOLDOWN",
            OtpError::NotFound => "OTP_NOT_FOUND",
            OtpError::AlreadyVerified => "OTP_ALREADY_VERIFIED",
            OtpError::Expired => "OTP_EXPIRED",
            OtpError::AttemptsExceeded { .. } => "OTP_ATTEMPTS_EXCEEDED",
            OtpError::Invalid { .. } => "OTP_INVALID",
            OtpError::Validation(_) => "VALIDATION_FAILED",
            OtpError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status class for the error.
    pub fn status_code(&self) -> u16 {
        match self {
            OtpError::Cooldown { .. } | OtpError::AttemptsExceeded { .. } => 429,
            OtpError::NotFound => 404,
            OtpError::AlreadyVerified
            | OtpError::Expired
            | OtpError::Invalid { .. }
            | OtpError::Validation(_) => 400,
            OtpError::Internal(_) => 500,
        }
    }

    /// Whether waiting (rather than a new code or new input) resolves it.
    pub fn is_backoff(&self) -> bool {
        matches!(self, OtpError::Cooldown { .. } | OtpError::AttemptsExceeded { .. })
    }

    /// String details attached to the error response.
    pub fn details(&self) -> BTreeMap<&'static str, String> {
        let mut details = BTreeMap::new();
        match self {
            OtpError::Cooldown {
                retry_after,
                cooldown_until,
                otp_expires_in,
                ..
            } => {
                details.insert("retry_after", retry_after.as_secs().to_string());
                details.insert("cooldown_until", cooldown_until.timestamp().to_string());
                if let Some(expires_in) = otp_expires_in {
                    details.insert("otp_expires_in", expires_in.as_secs().to_string());
                }
            }
            OtpError::AttemptsExceeded {
                retry_after,
                cooldown_until,
            } => {
                details.insert("remaining_attempts", "0".to_string());
                details.insert("retry_after", retry_after.as_secs().to_string());
                details.insert("cooldown_until", cooldown_until.timestamp().to_string());
            }
            OtpError::Invalid { remaining_attempts } => {
                details.insert("remaining_attempts", remaining_attempts.to_string());
            }
            _ => {}
        }
        details
    }
}
