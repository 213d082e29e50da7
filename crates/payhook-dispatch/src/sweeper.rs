//! Poll-driven retry sweeper.
//!
//! Retries are not driven by in-process timers: the schedule lives in
//! storage as `next_attempt_at`, and this sweeper periodically claims the
//! events whose retry is due and re-dispatches them. A crash between
//! polls loses nothing, the next sweep finds the same rows.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use payhook_core::{Clock, EventStore, Metric, MetricsSink, Result};

use crate::router::EventRouter;

/// Sweep cadence and claim sizing.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// How often to poll for due retries.
    pub poll_interval: Duration,
    /// Maximum events claimed per sweep.
    pub batch_size: usize,
    /// How long a `Processing` claim may age before the sweeper treats the
    /// owning task as dead and reclaims the event.
    pub visibility_timeout: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 50,
            visibility_timeout: Duration::from_secs(60),
        }
    }
}

/// Claims due retries and feeds them back through the router.
pub struct RetrySweeper<S> {
    router: Arc<EventRouter<S>>,
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    config: SweeperConfig,
}

impl<S: EventStore> RetrySweeper<S> {
    /// Creates a sweeper over the router's store.
    pub fn new(
        router: Arc<EventRouter<S>>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
        config: SweeperConfig,
    ) -> Self {
        let store = Arc::clone(router.store());
        Self { router, store, clock, metrics, config }
    }

    /// Claims and processes one batch of due retries, then reclaims any
    /// `Processing` events whose claim outlived the visibility timeout
    /// (the owning task crashed before recording an outcome).
    ///
    /// Returns how many events were claimed. Per-event handler failures
    /// are absorbed by the router's retry path; only infrastructure errors
    /// propagate.
    pub async fn sweep_once(&self) -> Result<usize> {
        let now = self.clock.now_utc();
        let mut claimed = self.store.claim_due(now, self.config.batch_size).await?;

        let cutoff = now
            - chrono::Duration::from_std(self.config.visibility_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let stale = self.store.reclaim_stale(cutoff, now, self.config.batch_size).await?;
        if !stale.is_empty() {
            warn!(count = stale.len(), "reclaimed events abandoned mid-processing");
        }
        claimed.extend(stale);

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "claimed due retries");
        }

        for event in &claimed {
            if let Err(err) = self.router.process_claimed(event).await {
                // The claim timestamp keeps aging, so a later sweep
                // reclaims the event once the visibility timeout passes.
                error!(event_id = %event.id, error = %err, "retry processing failed");
            }
        }

        let depth = self.store.queue_depth().await?;
        self.metrics.record(Metric::QueueDepth, depth as f64);

        Ok(claimed.len())
    }

    /// Polls for due retries until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "retry sweeper started"
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("retry sweeper stopping");
                    break;
                },
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep_once().await {
                        error!(error = %err, "retry sweep failed");
                    }
                },
            }
        }
    }
}

impl<S> std::fmt::Debug for RetrySweeper<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrySweeper").field("config", &self.config).finish_non_exhaustive()
    }
}
