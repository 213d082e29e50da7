//! Payhook webhook and batch-operations service.
//!
//! Entry point for the server binary. Wires the connection pool, stores,
//! webhook router, retry sweeper, batch processor, and monitor together,
//! then runs the HTTP server until a shutdown signal arrives.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use payhook_api::{create_router, serve, AppState, Config, Verifier};
use payhook_batch::{BatchProcessor, BillingItemExecutor};
use payhook_core::{
    ensure_schema, AlertPolicy, Clock, InMemoryMetrics, LogNotifier, Metric, MetricsSink, Monitor,
    PgBatchStore, PgEventStore, SystemClock,
};
use payhook_dispatch::{billing_registry, DeadLetterQueue, EventRouter, RetrySweeper};
use payhook_pool::{PgConnector, Pool};

/// Cadence for threshold checks and pool gauge sampling.
const MONITOR_INTERVAL: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.rust_log.clone())),
        )
        .init();

    info!(
        database_url = %config.database_url_masked(),
        host = %config.host,
        port = config.port,
        pool_max_size = config.pool_max_size,
        "starting payhook"
    );

    let cancel = CancellationToken::new();

    let pool = Pool::new(PgConnector::new(&config.database_url), config.to_pool_config());
    ensure_schema(&pool).await.context("failed to prepare database schema")?;
    let maintenance = pool.spawn_maintenance(cancel.clone());
    info!("connection pool established");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let metrics = Arc::new(InMemoryMetrics::new());
    let metrics_sink: Arc<dyn MetricsSink> = metrics.clone();
    let event_store = Arc::new(PgEventStore::new(pool.clone()));
    let batch_store = Arc::new(PgBatchStore::new(pool.clone()));

    // Webhook routing and the retry pipeline.
    let registry = Arc::new(billing_registry(pool.clone()));
    let router = Arc::new(EventRouter::new(
        event_store,
        registry,
        config.to_retry_policy(),
        Arc::clone(&clock),
        Arc::clone(&metrics_sink),
    ));

    let sweeper = RetrySweeper::new(
        Arc::clone(&router),
        Arc::clone(&clock),
        Arc::clone(&metrics_sink),
        config.to_sweeper_config(),
    );
    let sweeper_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { sweeper.run(cancel).await }
    });

    // Threshold monitoring and pool gauges.
    let monitor = Monitor::new(
        Arc::clone(&metrics),
        AlertPolicy::default(),
        Arc::new(LogNotifier),
        MONITOR_INTERVAL,
    );
    let monitor_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { monitor.run(cancel).await }
    });
    let gauge_task = tokio::spawn({
        let pool = pool.clone();
        let metrics = Arc::clone(&metrics);
        let cancel = cancel.clone();
        async move {
            let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let stats = pool.stats();
                        metrics.record(Metric::PoolInUse, stats.in_use as f64);
                        metrics.record(Metric::PoolIdle, stats.idle as f64);
                        metrics.record(Metric::PoolExhaustions, stats.exhaustions as f64);
                    },
                }
            }
        }
    });

    let state = AppState {
        verifier: Arc::new(Verifier::new(config.provider_secrets(), Arc::clone(&metrics_sink))),
        router: Arc::clone(&router),
        dead_letters: Arc::new(DeadLetterQueue::new(
            Arc::clone(router.store()),
            Arc::clone(&clock),
        )),
        batch: Arc::new(BatchProcessor::new(
            batch_store,
            Arc::new(BillingItemExecutor::new(pool.clone())),
            config.to_batch_config(),
            Arc::clone(&clock),
            Arc::clone(&metrics_sink),
        )),
        clock: Arc::clone(&clock),
    };

    let app = create_router(state, &config.admin_token, Duration::from_secs(config.request_timeout));
    let addr = config.parse_server_addr()?;

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            cancel.cancel();
        }
    });

    if let Err(err) = serve(app, addr, cancel.clone()).await {
        error!(error = %err, "HTTP server failed");
    }

    // Drain background tasks before closing the pool.
    cancel.cancel();
    let _ = tokio::join!(sweeper_task, monitor_task, gauge_task, maintenance);
    pool.close();

    info!("payhook stopped");
    Ok(())
}

/// Resolves when SIGINT or SIGTERM is delivered.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(err) => error!(error = %err, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
