//! Sliding-window admission limiter.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::decision::Decision;
use crate::clock::{Clock, SystemClock};
use crate::config::RateLimitingConfig;
use crate::error::{Result, WardenError};
use crate::observability::Metrics;
use crate::store::{AtomicStore, StoreResult, WindowRequest};

/// Identifier used when the caller could not determine one.
const UNKNOWN_CLIENT: &str = "unknown";

/// Per-client sliding-window limiter.
///
/// Each decision is one atomic script against the shared store; the limiter
/// itself holds only its configuration and can be shared freely.
pub struct RateLimiter {
    store: Arc<dyn AtomicStore>,
    metrics: Arc<Metrics>,
    clock: Arc<dyn Clock>,
    enabled: bool,
    limit: i64,
    window: Duration,
    key_prefix: String,
    timeout: Duration,
}

/// Snapshot of one client's window.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LimitInfo {
    pub identifier: String,
    pub count: u64,
    pub ttl_ms: Option<u64>,
    pub remaining: u64,
}

/// Read-only limiter statistics.
#[derive(Debug, Clone, Serialize)]
pub struct LimiterStats {
    pub enabled: bool,
    /// Number of live per-client windows.
    pub active_limits: usize,
    /// Details for up to the requested sample size of windows.
    pub sample: Vec<LimitInfo>,
}

impl RateLimiter {
    /// Create a limiter driven by the system clock.
    pub fn new(
        store: Arc<dyn AtomicStore>,
        metrics: Arc<Metrics>,
        config: &RateLimitingConfig,
    ) -> Result<Self> {
        Self::with_clock(store, metrics, config, Arc::new(SystemClock))
    }

    /// Create a limiter with an explicit clock.
    pub fn with_clock(
        store: Arc<dyn AtomicStore>,
        metrics: Arc<Metrics>,
        config: &RateLimitingConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if config.window_secs <= 0 {
            return Err(WardenError::Config(format!(
                "rate limit window must be positive, got {}s",
                config.window_secs
            )));
        }

        Ok(Self {
            store,
            metrics,
            clock,
            enabled: config.enabled,
            limit: config.requests_per_window,
            window: Duration::from_secs(config.window_secs as u64),
            key_prefix: config.key_prefix.clone(),
            timeout: config.timeout(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Configured quota; never negative.
    pub fn limit(&self) -> u64 {
        self.limit.max(0) as u64
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn key(&self, identifier: &str) -> String {
        format!("{}{}", self.key_prefix, identifier)
    }

    fn window_ms(&self) -> i64 {
        i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX)
    }

    /// Decide whether one more request from `identifier` fits its window.
    ///
    /// Store failures fail open: the request is admitted, flagged as such,
    /// and counted as an anomaly.
    pub async fn admit(&self, identifier: &str) -> Decision {
        let identifier = if identifier.is_empty() {
            UNKNOWN_CLIENT
        } else {
            identifier
        };
        let now_ms = self.clock.now_millis();
        let window_ms = self.window_ms();

        if !self.enabled {
            return Decision {
                allowed: true,
                limit: self.limit(),
                remaining: self.limit(),
                reset_at_ms: now_ms + window_ms,
                decided_at_ms: now_ms,
                fail_open: false,
            };
        }

        if self.limit <= 0 {
            self.metrics.record_decision(false);
            return Decision {
                allowed: false,
                limit: 0,
                remaining: 0,
                reset_at_ms: now_ms + window_ms,
                decided_at_ms: now_ms,
                fail_open: false,
            };
        }

        let key = self.key(identifier);
        // Two admissions in the same millisecond must stay distinct members.
        let member = format!("{}-{}", now_ms, Uuid::new_v4().simple());
        let request = WindowRequest {
            key: &key,
            limit: self.limit(),
            window_ms,
            now_ms,
            member: &member,
        };

        trace!(identifier = %identifier, now_ms, "Checking rate limit");

        let outcome = self
            .metrics
            .track("rate_check", self.timeout, self.store.sliding_window(&request))
            .await;

        match outcome {
            Ok(outcome) => {
                self.metrics.record_decision(outcome.allowed);
                self.metrics.record_quota(
                    identifier,
                    outcome.remaining,
                    self.limit(),
                    outcome.reset_at_ms,
                );
                if !outcome.allowed {
                    debug!(
                        identifier = %identifier,
                        limit = self.limit,
                        reset_at_ms = outcome.reset_at_ms,
                        "Rate limit exceeded"
                    );
                }
                Decision {
                    allowed: outcome.allowed,
                    limit: self.limit(),
                    remaining: outcome.remaining,
                    reset_at_ms: outcome.reset_at_ms,
                    decided_at_ms: now_ms,
                    fail_open: false,
                }
            }
            Err(e) => {
                self.metrics.record_fail_open();
                warn!(
                    identifier = %identifier,
                    error = %e,
                    kind = e.kind(),
                    "Rate limit store unavailable, failing open"
                );
                Decision {
                    allowed: true,
                    limit: self.limit(),
                    remaining: self.limit(),
                    reset_at_ms: now_ms + window_ms,
                    decided_at_ms: now_ms,
                    fail_open: true,
                }
            }
        }
    }

    /// Count live windows and describe up to `sample_size` of them.
    ///
    /// Windows that vanish or fail to read while sampling are skipped.
    pub async fn stats(&self, sample_size: usize) -> StoreResult<LimiterStats> {
        if !self.enabled {
            return Ok(LimiterStats {
                enabled: false,
                active_limits: 0,
                sample: Vec::new(),
            });
        }

        let pattern = format!("{}*", self.key_prefix);
        let keys = self
            .metrics
            .track("stats_keys", self.timeout, self.store.scan_keys(&pattern))
            .await?;

        let probes = keys.iter().take(sample_size).map(|key| self.probe(key));
        let sample: Vec<LimitInfo> = join_all(probes).await.into_iter().flatten().collect();

        Ok(LimiterStats {
            enabled: true,
            active_limits: keys.len(),
            sample,
        })
    }

    async fn probe(&self, key: &str) -> Option<LimitInfo> {
        let count = self
            .metrics
            .track("stats_count", self.timeout, self.store.zcard(key))
            .await
            .ok()?;
        let ttl = self
            .metrics
            .track("stats_ttl", self.timeout, self.store.ttl(key))
            .await
            .ok()?;

        Some(LimitInfo {
            identifier: key
                .strip_prefix(self.key_prefix.as_str())
                .unwrap_or(key)
                .to_string(),
            count,
            ttl_ms: ttl.map(|t| t.as_millis() as u64),
            remaining: self.limit().saturating_sub(count),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    struct Fixture {
        limiter: Arc<RateLimiter>,
        store: Arc<MemoryStore>,
        metrics: Arc<Metrics>,
        clock: ManualClock,
    }

    fn fixture(limit: i64, window_secs: i64) -> Fixture {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let metrics = Arc::new(Metrics::default());
        let config = RateLimitingConfig {
            requests_per_window: limit,
            window_secs,
            ..Default::default()
        };
        let limiter = RateLimiter::with_clock(
            store.clone(),
            metrics.clone(),
            &config,
            Arc::new(clock.clone()),
        )
        .unwrap();
        Fixture {
            limiter: Arc::new(limiter),
            store,
            metrics,
            clock,
        }
    }

    #[tokio::test]
    async fn test_six_requests_against_limit_of_five() {
        let f = fixture(5, 60);

        let mut remaining = Vec::new();
        for _ in 0..5 {
            let decision = f.limiter.admit("203.0.113.7").await;
            assert!(decision.allowed);
            remaining.push(decision.remaining);
            f.clock.advance(Duration::from_millis(100));
        }
        assert_eq!(remaining, vec![4, 3, 2, 1, 0]);

        let denied = f.limiter.admit("203.0.113.7").await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.status_code(), 429);
        assert!(denied.retry_after() > Duration::ZERO);

        assert_eq!(f.metrics.requests_allowed(), 5);
        assert_eq!(f.metrics.requests_blocked(), 1);
        let text = f.metrics.encode().unwrap();
        assert!(text.contains("warden_ratelimit_remaining_quota_percent_count 6"));
        assert!(text.contains("warden_ratelimit_reset_timestamp_seconds{identifier=\"203.0.113.7\"}"));
    }

    #[tokio::test]
    async fn test_same_millisecond_admissions_are_all_counted() {
        let f = fixture(3, 60);

        // The clock never moves, so every member shares one timestamp.
        for _ in 0..3 {
            assert!(f.limiter.admit("client").await.allowed);
        }
        assert!(!f.limiter.admit("client").await.allowed);
        assert_eq!(f.store.zcard("rate_limit:client").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_window_slides() {
        let f = fixture(2, 10);

        assert!(f.limiter.admit("c").await.allowed);
        f.clock.advance(Duration::from_secs(4));
        assert!(f.limiter.admit("c").await.allowed);
        f.clock.advance(Duration::from_secs(4));
        assert!(!f.limiter.admit("c").await.allowed);

        // The first admission leaves the window; the second is still counted.
        f.clock.advance(Duration::from_secs(2));
        let decision = f.limiter.admit("c").await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_reset_points_at_oldest_admission() {
        let f = fixture(5, 60);
        let first = f.limiter.admit("c").await;
        assert_eq!(first.reset_at_ms, first.decided_at_ms + 60_000);

        f.clock.advance(Duration::from_secs(5));
        let second = f.limiter.admit("c").await;
        assert_eq!(second.reset_at_ms, first.reset_at_ms);
    }

    #[tokio::test]
    async fn test_clients_are_isolated() {
        let f = fixture(1, 60);
        assert!(f.limiter.admit("a").await.allowed);
        assert!(f.limiter.admit("b").await.allowed);
        assert!(!f.limiter.admit("a").await.allowed);
    }

    #[tokio::test]
    async fn test_non_positive_limit_always_denies() {
        let f = fixture(0, 60);
        let decision = f.limiter.admit("c").await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(f.store.is_empty());
    }

    #[test]
    fn test_non_positive_window_rejected() {
        let store = Arc::new(MemoryStore::new());
        let config = RateLimitingConfig {
            window_secs: 0,
            ..Default::default()
        };
        let result = RateLimiter::new(store, Arc::new(Metrics::default()), &config);
        assert!(matches!(result, Err(WardenError::Config(_))));
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let f = fixture(1, 60);
        f.store.set_unavailable(true);

        for _ in 0..3 {
            let decision = f.limiter.admit("c").await;
            assert!(decision.allowed);
            assert!(decision.fail_open);
        }
        assert_eq!(f.metrics.fail_open_count(), 3);
        assert_eq!(f.metrics.error_count("rate_check", "connection_refused"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_timeout_fails_open() {
        let f = fixture(1, 60);
        f.store.set_latency(Some(Duration::from_secs(30)));

        let decision = f.limiter.admit("c").await;
        assert!(decision.allowed);
        assert!(decision.fail_open);
        assert_eq!(f.metrics.error_count("rate_check", "timeout"), 1);
    }

    #[tokio::test]
    async fn test_disabled_limiter_skips_store() {
        let store = Arc::new(MemoryStore::new());
        let config = RateLimitingConfig {
            enabled: false,
            requests_per_window: 1,
            ..Default::default()
        };
        let limiter = RateLimiter::new(store.clone(), Arc::new(Metrics::default()), &config).unwrap();

        for _ in 0..3 {
            assert!(limiter.admit("c").await.allowed);
        }
        assert!(store.is_empty());

        let stats = limiter.stats(100).await.unwrap();
        assert!(!stats.enabled);
        assert_eq!(stats.active_limits, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admissions_never_exceed_limit() {
        let f = fixture(10, 60);
        f.store.set_latency(Some(Duration::from_millis(5)));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let limiter = f.limiter.clone();
            handles.push(tokio::spawn(async move { limiter.admit("burst").await }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap().allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
        assert_eq!(f.metrics.requests_blocked(), 40);
    }

    #[tokio::test]
    async fn test_stats_samples_windows() {
        let f = fixture(5, 60);
        f.limiter.admit("10.0.0.1").await;
        f.limiter.admit("10.0.0.1").await;
        f.limiter.admit("10.0.0.2").await;

        let stats = f.limiter.stats(1).await.unwrap();
        assert!(stats.enabled);
        assert_eq!(stats.active_limits, 2);
        assert_eq!(stats.sample.len(), 1);
        assert_eq!(stats.sample[0].identifier, "10.0.0.1");
        assert_eq!(stats.sample[0].count, 2);
        assert_eq!(stats.sample[0].remaining, 3);
        assert_eq!(stats.sample[0].ttl_ms, Some(60_000));
    }
}
