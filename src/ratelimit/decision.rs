//! Admission decisions and their response metadata.

use std::time::Duration;

use serde::Serialize;

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    /// Configured quota for the window.
    pub limit: u64,
    /// Admissions left in the current window.
    pub remaining: u64,
    /// Unix milliseconds at which the oldest counted admission expires.
    pub reset_at_ms: i64,
    /// Unix milliseconds at which the decision was taken.
    pub decided_at_ms: i64,
    /// The store could not be consulted and the request was let through.
    pub fail_open: bool,
}

impl Decision {
    /// Time until the window frees a slot, rounded up to whole seconds.
    pub fn retry_after(&self) -> Duration {
        let millis = (self.reset_at_ms - self.decided_at_ms).max(0) as u64;
        Duration::from_secs(millis.div_ceil(1000))
    }

    /// HTTP status for the decision: 429 when denied.
    pub fn status_code(&self) -> u16 {
        if self.allowed {
            200
        } else {
            429
        }
    }

    /// Quota headers for the response.
    ///
    /// Nothing is reported for a fail-open decision since no quota was read.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        if self.fail_open {
            return Vec::new();
        }

        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", (self.reset_at_ms / 1000).to_string()),
        ];
        if !self.allowed {
            headers.push(("Retry-After", self.retry_after().as_secs().to_string()));
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(allowed: bool) -> Decision {
        Decision {
            allowed,
            limit: 5,
            remaining: if allowed { 3 } else { 0 },
            reset_at_ms: 1_700_000_060_000,
            decided_at_ms: 1_700_000_000_500,
            fail_open: false,
        }
    }

    #[test]
    fn test_allowed_headers() {
        let headers = decision(true).headers();
        assert_eq!(
            headers,
            vec![
                ("X-RateLimit-Limit", "5".to_string()),
                ("X-RateLimit-Remaining", "3".to_string()),
                ("X-RateLimit-Reset", "1700000060".to_string()),
            ]
        );
        assert_eq!(decision(true).status_code(), 200);
    }

    #[test]
    fn test_denied_carries_retry_after() {
        let denied = decision(false);
        assert_eq!(denied.status_code(), 429);
        assert_eq!(denied.retry_after(), Duration::from_secs(60));
        assert!(denied
            .headers()
            .contains(&("Retry-After", "60".to_string())));
    }

    #[test]
    fn test_fail_open_has_no_headers() {
        let mut open = decision(true);
        open.fail_open = true;
        assert!(open.headers().is_empty());
    }
}
