//! Stored OTP state and its key layout.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::OtpError;

/// Identifies the OTP state of one email address seen from one client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OtpKey {
    email: String,
    identifier: String,
}

impl OtpKey {
    /// Build a key, rejecting blank parts and malformed emails. Emails are
    /// compared case-insensitively.
    pub fn new(email: &str, identifier: &str) -> Result<Self, OtpError> {
        let email = email.trim();
        let identifier = identifier.trim();
        if email.is_empty() {
            return Err(OtpError::Validation("email is required".to_string()));
        }
        if !email.contains('@') || email.contains(':') || email.chars().any(char::is_whitespace) {
            return Err(OtpError::Validation("email is malformed".to_string()));
        }
        if identifier.is_empty() {
            return Err(OtpError::Validation("client identifier is required".to_string()));
        }

        Ok(Self {
            email: email.to_lowercase(),
            identifier: identifier.to_string(),
        })
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn code_key(&self) -> String {
        format!("otp:code:{}", self)
    }

    pub fn cooldown_key(&self) -> String {
        format!("otp:cooldown:{}", self)
    }

    /// "Recently issued" guard; its TTL is the current issuance backoff.
    pub fn guard_key(&self) -> String {
        format!("otp:generation:{}", self)
    }

    pub fn generation_count_key(&self) -> String {
        format!("otp:generation:count:{}", self)
    }
}

/// Escape the key separator so a caller-supplied identifier always stays
/// one key segment. `%` is escaped too, keeping the mapping injective.
fn escape_segment(raw: &str) -> Cow<'_, str> {
    if raw.contains([':', '%']) {
        Cow::Owned(raw.replace('%', "%25").replace(':', "%3A"))
    } else {
        Cow::Borrowed(raw)
    }
}

impl std::fmt::Display for OtpKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.email, escape_segment(&self.identifier))
    }
}

/// A live one-time code.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpRecord {
    pub code: String,
    pub email: String,
    pub identifier: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub attempts: u32,
    pub verified: bool,
    pub last_attempt_at: DateTime<Utc>,
}

impl std::fmt::Debug for OtpRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtpRecord")
            .field("code", &"<redacted>")
            .field("email", &self.email)
            .field("identifier", &self.identifier)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .field("attempts", &self.attempts)
            .field("verified", &self.verified)
            .field("last_attempt_at", &self.last_attempt_at)
            .finish()
    }
}

/// Verification cooldown after repeated failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownRecord {
    /// Consecutive failures that led here.
    pub failed_attempts: u32,
    pub cooldown_until: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
}

impl CooldownRecord {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until > now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let key = OtpKey::new(" Alice@Example.com ", "203.0.113.7").unwrap();
        assert_eq!(key.code_key(), "otp:code:alice@example.com:203.0.113.7");
        assert_eq!(key.cooldown_key(), "otp:cooldown:alice@example.com:203.0.113.7");
        assert_eq!(key.guard_key(), "otp:generation:alice@example.com:203.0.113.7");
        assert_eq!(
            key.generation_count_key(),
            "otp:generation:count:alice@example.com:203.0.113.7"
        );
    }

    #[test]
    fn test_blank_parts_rejected() {
        assert!(matches!(OtpKey::new("", "ip"), Err(OtpError::Validation(_))));
        assert!(matches!(OtpKey::new("a@b.c", "  "), Err(OtpError::Validation(_))));
    }

    #[test]
    fn test_malformed_emails_rejected() {
        for email in ["count", "a:b@c.d", "a b@c.d"] {
            assert!(
                matches!(OtpKey::new(email, "ip"), Err(OtpError::Validation(_))),
                "{:?}",
                email
            );
        }
    }

    #[test]
    fn test_identifier_cannot_span_segments() {
        let key = OtpKey::new("alice@example.com", "2001:db8::1").unwrap();
        assert_eq!(key.identifier(), "2001:db8::1");
        assert_eq!(key.code_key(), "otp:code:alice@example.com:2001%3Adb8%3A%3A1");

        let alice = OtpKey::new("alice@example.com", "1.2.3.4").unwrap();
        let crafted = OtpKey::new("mallory@example.com", "x:alice@example.com:1.2.3.4").unwrap();
        let alice_keys = [
            alice.code_key(),
            alice.cooldown_key(),
            alice.guard_key(),
            alice.generation_count_key(),
        ];
        for key in [
            crafted.code_key(),
            crafted.cooldown_key(),
            crafted.guard_key(),
            crafted.generation_count_key(),
        ] {
            assert!(!alice_keys.contains(&key), "{}", key);
        }
        assert_eq!(crafted.guard_key().split(':').count(), 4);

        let percent = OtpKey::new("a@b.c", "x%3Ay").unwrap();
        let colon = OtpKey::new("a@b.c", "x:y").unwrap();
        assert_ne!(percent.code_key(), colon.code_key());
    }

    #[test]
    fn test_record_debug_redacts_code() {
        let now = Utc::now();
        let record = OtpRecord {
            code: "424242".to_string(),
            email: "a@b.c".to_string(),
            identifier: "ip".to_string(),
            created_at: now,
            expires_at: now,
            attempts: 0,
            verified: false,
            last_attempt_at: now,
        };
        assert!(!format!("{:?}", record).contains("424242"));
    }
}
