//! Prometheus metric families for store calls and admission decisions.

use std::future::Future;
use std::time::{Duration, Instant};

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, linear_buckets, Histogram};
use prometheus_client::registry::{Registry, Unit};
use tracing::trace;

use crate::store::{StoreError, StoreResult};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OperationLabels {
    operation: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ErrorLabels {
    operation: String,
    error_type: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ClientLabels {
    identifier: String,
}

/// 1ms up to ~0.5s.
fn store_duration_histogram() -> Histogram {
    Histogram::new(exponential_buckets(0.001, 2.0, 10))
}

/// Metrics shared by the limiter, the OTP engine and the collector.
///
/// Families live under `{namespace}_ratelimit_`. Handles are cheap atomic
/// clones of what the registry holds, so recording never takes a lock on
/// the request path beyond a family's first sight of a label set.
pub struct Metrics {
    registry: Registry,
    requests_allowed: Counter,
    requests_blocked: Counter,
    fail_open: Counter,
    store_errors: Family<ErrorLabels, Counter>,
    store_duration: Family<OperationLabels, Histogram, fn() -> Histogram>,
    active_limits: Gauge,
    remaining_quota: Histogram,
    reset_time: Family<ClientLabels, Gauge>,
    collections: Counter,
    collection_failures: Counter,
}

impl Metrics {
    /// Create a registry with every family registered.
    pub fn new(namespace: impl Into<String>) -> Self {
        let requests_allowed = Counter::default();
        let requests_blocked = Counter::default();
        let fail_open = Counter::default();
        let store_errors = Family::<ErrorLabels, Counter>::default();
        let store_duration = Family::<OperationLabels, Histogram, fn() -> Histogram>::new_with_constructor(
            store_duration_histogram,
        );
        let active_limits = Gauge::default();
        let remaining_quota = Histogram::new(linear_buckets(0.0, 10.0, 11));
        let reset_time = Family::<ClientLabels, Gauge>::default();
        let collections = Counter::default();
        let collection_failures = Counter::default();

        let mut registry = Registry::with_prefix(namespace);
        {
            let ratelimit = registry.sub_registry_with_prefix("ratelimit");
            ratelimit.register(
                "requests_allowed",
                "Requests admitted by the limiter",
                requests_allowed.clone(),
            );
            ratelimit.register(
                "requests_blocked",
                "Requests rejected by the limiter",
                requests_blocked.clone(),
            );
            ratelimit.register(
                "fail_open",
                "Requests admitted because the store could not be consulted",
                fail_open.clone(),
            );
            ratelimit.register(
                "redis_errors",
                "Store errors by operation and error type",
                store_errors.clone(),
            );
            ratelimit.register_with_unit(
                "redis_duration",
                "Store call latency",
                Unit::Seconds,
                store_duration.clone(),
            );
            ratelimit.register(
                "active_limits",
                "Live rate limit windows in the store",
                active_limits.clone(),
            );
            ratelimit.register(
                "remaining_quota_percent",
                "Remaining quota after each decision, as a percentage of the limit",
                remaining_quota.clone(),
            );
            ratelimit.register(
                "reset_timestamp_seconds",
                "Unix time at which each client's window frees a slot",
                reset_time.clone(),
            );
            ratelimit.register(
                "collections",
                "Completed collector rounds",
                collections.clone(),
            );
            ratelimit.register(
                "collection_failures",
                "Collector rounds that failed to read the store",
                collection_failures.clone(),
            );
        }

        Self {
            registry,
            requests_allowed,
            requests_blocked,
            fail_open,
            store_errors,
            store_duration,
            active_limits,
            remaining_quota,
            reset_time,
            collections,
            collection_failures,
        }
    }

    /// Run a store call under a deadline, recording its latency and outcome.
    pub async fn track<T, F>(
        &self,
        operation: &'static str,
        deadline: Duration,
        call: F,
    ) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        let started = Instant::now();
        let result = match tokio::time::timeout(deadline, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                operation,
                after: deadline,
            }),
        };
        self.observe(operation, started.elapsed(), result.as_ref().err());
        result
    }

    /// Record one finished store call.
    pub fn observe(&self, operation: &'static str, elapsed: Duration, error: Option<&StoreError>) {
        self.store_duration
            .get_or_create(&OperationLabels {
                operation: operation.to_string(),
            })
            .observe(elapsed.as_secs_f64());

        if let Some(error) = error {
            self.store_errors
                .get_or_create(&ErrorLabels {
                    operation: operation.to_string(),
                    error_type: error.kind().to_string(),
                })
                .inc();
        }

        trace!(operation, elapsed = ?elapsed, failed = error.is_some(), "Store call observed");
    }

    /// Record an admission decision.
    pub fn record_decision(&self, allowed: bool) {
        if allowed {
            self.requests_allowed.inc();
        } else {
            self.requests_blocked.inc();
        }
    }

    /// Record what a decision left of a client's window.
    pub fn record_quota(&self, identifier: &str, remaining: u64, limit: u64, reset_at_ms: i64) {
        if limit > 0 {
            self.remaining_quota
                .observe(remaining as f64 / limit as f64 * 100.0);
        }
        self.reset_time
            .get_or_create(&ClientLabels {
                identifier: identifier.to_string(),
            })
            .set(reset_at_ms.div_euclid(1000));
    }

    /// Record a request let through because the store was unavailable.
    pub fn record_fail_open(&self) {
        self.fail_open.inc();
    }

    pub fn set_active_limits(&self, count: u64) {
        self.active_limits
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    pub fn record_collection(&self, succeeded: bool) {
        if succeeded {
            self.collections.inc();
        } else {
            self.collection_failures.inc();
        }
    }

    pub fn requests_allowed(&self) -> u64 {
        self.requests_allowed.get()
    }

    pub fn requests_blocked(&self) -> u64 {
        self.requests_blocked.get()
    }

    pub fn fail_open_count(&self) -> u64 {
        self.fail_open.get()
    }

    pub fn active_limits(&self) -> u64 {
        u64::try_from(self.active_limits.get()).unwrap_or(0)
    }

    pub fn collection_failures(&self) -> u64 {
        self.collection_failures.get()
    }

    /// Errors of one type recorded for an operation.
    pub fn error_count(&self, operation: &str, error_type: &str) -> u64 {
        self.store_errors
            .get_or_create(&ErrorLabels {
                operation: operation.to_string(),
                error_type: error_type.to_string(),
            })
            .get()
    }

    /// Render every family in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("requests_allowed", &self.requests_allowed.get())
            .field("requests_blocked", &self.requests_blocked.get())
            .field("fail_open", &self.fail_open.get())
            .field("active_limits", &self.active_limits.get())
            .finish_non_exhaustive()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new("warden")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_track_records_success_and_failure() {
        let metrics = Metrics::default();

        let ok: StoreResult<u32> = metrics
            .track("get", Duration::from_secs(1), async { Ok(7) })
            .await;
        assert_eq!(ok.unwrap(), 7);

        let err: StoreResult<u32> = metrics
            .track("get", Duration::from_secs(1), async {
                Err(StoreError::Backend("connection refused".into()))
            })
            .await;
        assert!(err.is_err());

        assert_eq!(metrics.error_count("get", "connection_refused"), 1);

        let text = metrics.encode().unwrap();
        assert!(text.contains(
            "warden_ratelimit_redis_errors_total{operation=\"get\",error_type=\"connection_refused\"} 1"
        ));
        assert!(text.contains("warden_ratelimit_redis_duration_seconds_count{operation=\"get\"} 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_enforces_deadline() {
        let metrics = Metrics::default();
        let result: StoreResult<()> = metrics
            .track("slow", Duration::from_millis(50), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(
            result,
            Err(StoreError::Timeout { operation: "slow", .. })
        ));
        assert_eq!(metrics.error_count("slow", "timeout"), 1);
    }

    #[test]
    fn test_decision_counters() {
        let metrics = Metrics::new("test");
        metrics.record_decision(true);
        metrics.record_decision(true);
        metrics.record_decision(false);
        metrics.record_fail_open();
        metrics.set_active_limits(4);

        assert_eq!(metrics.requests_allowed(), 2);
        assert_eq!(metrics.requests_blocked(), 1);
        assert_eq!(metrics.fail_open_count(), 1);
        assert_eq!(metrics.active_limits(), 4);

        let text = metrics.encode().unwrap();
        assert!(text.contains("test_ratelimit_requests_allowed_total 2"));
        assert!(text.contains("test_ratelimit_requests_blocked_total 1"));
        assert!(text.contains("test_ratelimit_active_limits 4"));
    }

    #[test]
    fn test_quota_families() {
        let metrics = Metrics::default();
        metrics.record_quota("203.0.113.7", 4, 5, 1_700_000_060_500);
        metrics.record_quota("203.0.113.7", 0, 5, 1_700_000_061_000);

        let text = metrics.encode().unwrap();
        assert!(text.contains("warden_ratelimit_remaining_quota_percent_count 2"));
        assert!(text.contains(
            "warden_ratelimit_reset_timestamp_seconds{identifier=\"203.0.113.7\"} 1700000061"
        ));
    }
}
