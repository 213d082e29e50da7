//! Batch job validation, background driving, and status polling.

use std::{collections::HashSet, sync::Arc, time::Duration, time::Instant};

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{error, info};

use payhook_core::{
    BatchJob, BatchOperation, BatchStore, Clock, Component, CoreError, ItemOutcome, ItemRef,
    JobId, Metric, MetricsSink,
};

use crate::executor::ItemExecutor;

/// Batch sizing and concurrency limits.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum items accepted per job.
    pub max_items: usize,
    /// Items executed concurrently within one job. Kept below the pool's
    /// max size so a batch can never exhaust the pool on its own.
    pub concurrency: usize,
    /// Wall-clock budget for a single item.
    pub item_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { max_items: 1000, concurrency: 4, item_timeout: Duration::from_secs(30) }
    }
}

/// Rejection of a batch submission. The job is never created.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The item list was empty.
    #[error("batch contains no items")]
    Empty,

    /// The item list exceeded the configured limit.
    #[error("batch of {count} items exceeds limit of {max}")]
    TooLarge {
        /// Submitted item count.
        count: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The same record was referenced twice.
    #[error("duplicate item reference: {0}")]
    DuplicateItem(ItemRef),

    /// The job could not be persisted.
    #[error(transparent)]
    Storage(#[from] CoreError),
}

/// Accepts batch jobs and drives them to completion in the background.
pub struct BatchProcessor<S> {
    store: Arc<S>,
    executor: Arc<dyn ItemExecutor>,
    config: BatchConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
}

impl<S> Clone for BatchProcessor<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            executor: Arc::clone(&self.executor),
            config: self.config.clone(),
            clock: Arc::clone(&self.clock),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<S: BatchStore> BatchProcessor<S> {
    /// Creates a processor.
    pub fn new(
        store: Arc<S>,
        executor: Arc<dyn ItemExecutor>,
        config: BatchConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self { store, executor, config, clock, metrics }
    }

    /// Validates and accepts a job, returning its id immediately.
    ///
    /// Execution happens in a spawned task; poll [`BatchProcessor::status`]
    /// for progress.
    pub async fn submit(
        &self,
        operation: BatchOperation,
        items: Vec<ItemRef>,
    ) -> Result<JobId, SubmitError> {
        if items.is_empty() {
            return Err(SubmitError::Empty);
        }
        if items.len() > self.config.max_items {
            return Err(SubmitError::TooLarge { count: items.len(), max: self.config.max_items });
        }
        let mut seen = HashSet::with_capacity(items.len());
        for item in &items {
            if !seen.insert(item) {
                return Err(SubmitError::DuplicateItem(item.clone()));
            }
        }

        let job = BatchJob::new(operation, items, self.clock.now_utc());
        let id = job.id;
        self.store.create(&job).await?;

        info!(job_id = %id, operation = %operation, items = job.items.len(), "batch accepted");

        let this = self.clone();
        tokio::spawn(async move { this.run(job).await });

        Ok(id)
    }

    /// Point-in-time snapshot of a job.
    pub async fn status(&self, id: JobId) -> Result<Option<BatchJob>, CoreError> {
        self.store.find(id).await
    }

    async fn run(&self, job: BatchJob) {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));

        let mut tasks = Vec::with_capacity(job.items.len());
        for item in job.items.clone() {
            let this = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let operation = job.operation;
            let job_id = job.id;

            tasks.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let outcome = this.execute_item(operation, &item).await;
                if let Err(err) = this.store.record_item_outcome(job_id, &item, outcome).await {
                    error!(job_id = %job_id, item = %item, error = %err, "failed to record item outcome");
                }
            }));
        }
        join_all(tasks).await;

        self.finalize(job.id).await;
    }

    async fn execute_item(&self, operation: BatchOperation, item: &ItemRef) -> ItemOutcome {
        self.metrics.record(Metric::Requests(Component::Batch), 1.0);
        let started = Instant::now();

        let result =
            tokio::time::timeout(self.config.item_timeout, self.executor.execute(operation, item))
                .await;

        self.metrics.record(
            Metric::Latency(Component::Batch),
            started.elapsed().as_secs_f64() * 1000.0,
        );

        match result {
            Ok(Ok(())) => ItemOutcome::Success,
            Ok(Err(err)) => {
                self.metrics.record(Metric::Errors(Component::Batch), 1.0);
                ItemOutcome::Error { reason: err.to_string() }
            },
            Err(_) => {
                self.metrics.record(Metric::Errors(Component::Batch), 1.0);
                ItemOutcome::Error {
                    reason: format!("timed out after {:?}", self.config.item_timeout),
                }
            },
        }
    }

    async fn finalize(&self, id: JobId) {
        let status = match self.store.find(id).await {
            Ok(Some(snapshot)) => snapshot.terminal_status(),
            Ok(None) => {
                error!(job_id = %id, "job vanished before finalization");
                return;
            },
            Err(err) => {
                error!(job_id = %id, error = %err, "failed to load job for finalization");
                return;
            },
        };

        match self.store.finalize(id, status).await {
            Ok(()) => info!(job_id = %id, status = %status, "batch finished"),
            Err(err) => error!(job_id = %id, error = %err, "failed to finalize batch"),
        }
    }
}

impl<S> std::fmt::Debug for BatchProcessor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchProcessor").field("config", &self.config).finish_non_exhaustive()
    }
}
