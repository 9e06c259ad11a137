//! Atomic store trait shared by the limiter and the OTP engine.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by a store adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The call did not finish within its deadline.
    #[error("store operation `{operation}` timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// The backend rejected the call or could not be reached.
    #[error("store backend error: {0}")]
    Backend(String),

    /// A stored value could not be encoded or decoded.
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An optimistic update kept losing to concurrent writers.
    #[error("concurrent modification of `{key}`")]
    Conflict { key: String },
}

impl StoreError {
    /// Short classification used as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Timeout { .. } => "timeout",
            StoreError::Serialization(_) => "serialization",
            StoreError::Conflict { .. } => "conflict",
            StoreError::Backend(msg) => {
                let msg = msg.to_ascii_lowercase();
                if msg.contains("timeout") || msg.contains("timed out") {
                    "timeout"
                } else if msg.contains("connection refused") {
                    "connection_refused"
                } else if msg.contains("connection reset") {
                    "connection_reset"
                } else if msg.contains("eof") {
                    "eof"
                } else if msg.contains("pool") {
                    "pool_exhausted"
                } else {
                    "unknown"
                }
            }
        }
    }
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Arguments of the atomic sliding-window admission script.
#[derive(Debug, Clone)]
pub struct WindowRequest<'a> {
    /// Ordered-set key for the client.
    pub key: &'a str,
    /// Maximum admissions inside the window.
    pub limit: u64,
    /// Window length in milliseconds.
    pub window_ms: i64,
    /// Current time in Unix milliseconds; also the score of the new member.
    pub now_ms: i64,
    /// Unique member recorded on admission.
    pub member: &'a str,
}

/// Fixed-shape result of the sliding-window script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    pub allowed: bool,
    pub remaining: u64,
    /// Unix milliseconds at which the oldest counted event leaves the window.
    pub reset_at_ms: i64,
}

/// Replacement applied by a successful compare-and-swap.
#[derive(Debug, Clone, Copy)]
pub enum Swap<'a> {
    /// Overwrite the value and its TTL.
    Set { value: &'a str, ttl: Duration },
    /// Remove the key.
    Delete,
}

/// A shared key-value store with TTLs, counters, ordered sets and atomic
/// scripted operations.
///
/// Implementations must make `sliding_window` and `compare_and_swap` atomic
/// with respect to every other call on the same key.
#[async_trait]
pub trait AtomicStore: Send + Sync {
    /// Read a string value.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write a string value with a TTL.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Write a string value with a TTL only if the key is absent.
    /// Returns whether this call created it.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Check whether a key exists.
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Atomically increment an integer value, creating it at 1.
    async fn incr(&self, key: &str) -> StoreResult<i64>;

    /// Refresh a key's TTL. Returns whether the key existed.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Remaining TTL, or `None` when the key is missing or never expires.
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    /// Insert (or re-score) an ordered-set member.
    async fn zadd(&self, key: &str, member: &str, score: i64) -> StoreResult<()>;

    /// Number of ordered-set members.
    async fn zcard(&self, key: &str) -> StoreResult<u64>;

    /// Members with `min <= score <= max`, lowest score first.
    async fn zrange_by_score(&self, key: &str, min: i64, max: i64) -> StoreResult<Vec<String>>;

    /// Remove members with `min <= score <= max`. Returns how many were removed.
    async fn zrem_range_by_score(&self, key: &str, min: i64, max: i64) -> StoreResult<u64>;

    /// Keys matching a glob pattern such as `rate_limit:*`.
    async fn scan_keys(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// Purge, count and conditionally insert as one atomic step.
    async fn sliding_window(&self, request: &WindowRequest<'_>) -> StoreResult<WindowOutcome>;

    /// Apply `replacement` only if the key currently holds exactly `expected`.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        replacement: Swap<'_>,
    ) -> StoreResult<bool>;
}

/// Convert a TTL into whole milliseconds, never below one.
pub(crate) fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_classification() {
        let timeout = StoreError::Timeout {
            operation: "get",
            after: Duration::from_secs(2),
        };
        assert_eq!(timeout.kind(), "timeout");
        assert_eq!(
            StoreError::Backend("Connection refused (os error 111)".into()).kind(),
            "connection_refused"
        );
        assert_eq!(StoreError::Backend("unexpected EOF".into()).kind(), "eof");
        assert_eq!(StoreError::Backend("boom".into()).kind(), "unknown");
        assert_eq!(
            StoreError::Conflict { key: "k".into() }.kind(),
            "conflict"
        );
    }

    #[test]
    fn test_ttl_millis_floors_at_one() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
    }
}
