//! Periodic sampling of limiter state from the shared store.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::metrics::Metrics;
use crate::config::WardenConfig;
use crate::store::{AtomicStore, StoreResult};

/// Samples the number of active limiter windows on a fixed interval.
///
/// The collector only reads from the store and writes to the metric
/// registry; a failed round is logged and the loop carries on.
pub struct Collector {
    store: Arc<dyn AtomicStore>,
    metrics: Arc<Metrics>,
    /// Glob matching limiter keys, e.g. `rate_limit:*`.
    pattern: String,
    interval: Duration,
    timeout: Duration,
}

impl Collector {
    pub fn new(
        store: Arc<dyn AtomicStore>,
        metrics: Arc<Metrics>,
        key_prefix: &str,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            metrics,
            pattern: format!("{}*", key_prefix),
            interval,
            timeout,
        }
    }

    /// Sample the limiter's key space with the shared store deadline.
    pub fn from_config(
        store: Arc<dyn AtomicStore>,
        metrics: Arc<Metrics>,
        config: &WardenConfig,
    ) -> Self {
        Self::new(
            store,
            metrics,
            &config.rate_limiting.key_prefix,
            config.observability.collection_interval(),
            config.store.timeout(),
        )
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run one sampling round and publish the active window count.
    pub async fn collect_once(&self) -> StoreResult<usize> {
        let keys = self
            .metrics
            .track("collect_keys", self.timeout, self.store.scan_keys(&self.pattern))
            .await?;
        self.metrics.set_active_limits(keys.len() as u64);
        Ok(keys.len())
    }

    /// Start the sampling loop on its own task.
    pub fn spawn(self) -> CollectorHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            info!(
                interval = ?self.interval,
                pattern = %self.pattern,
                "Observability collector started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.collect_once().await {
                            Ok(active) => {
                                self.metrics.record_collection(true);
                                debug!(active_limits = active, "Collection cycle complete");
                            }
                            Err(e) => {
                                self.metrics.record_collection(false);
                                warn!(error = %e, "Failed to collect limiter metrics");
                            }
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        // A dropped sender also means shut down.
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Observability collector stopped");
        });

        CollectorHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Handle to a running [`Collector`].
pub struct CollectorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CollectorHandle {
    /// Signal the loop to stop and wait for its task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Observability collector task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
