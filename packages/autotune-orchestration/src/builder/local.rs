use super::{BuildInput, BuildResult, Builder};
use crate::config::LocalBuilderConfig;
use crate::error::{FailureKind, Result};
#[cfg(feature = "metrics")]
use crate::metrics::BuilderMetrics;
use crate::pool::WorkerPool;
use async_trait::async_trait;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Builder backed by a pool of forked worker processes
///
/// Each task runs `build_fn` then `export_fn` in a worker under a wall-clock
/// budget. Timed-out and crashed workers are killed and replaced; their tasks
/// report `LocalBuilder: Timeout` / `LocalBuilder: An exception occurred`.
/// Concurrent `build` calls are served one batch at a time.
pub struct LocalBuilder {
    id: String,
    num_workers: usize,
    timeout: Duration,
    pool: Mutex<WorkerPool>,
}

impl LocalBuilder {
    /// Validate `config`, fork the workers and wait for each to be ready
    ///
    /// Fails with a configuration error if a build or export callback does
    /// not resolve, and with `WorkerInit` if an initializer fails.
    pub async fn new(config: LocalBuilderConfig) -> Result<Self> {
        config.validate()?;
        let id = format!("builder-{}", &Uuid::new_v4().simple().to_string()[..8]);
        info!(
            builder = %id,
            num_workers = config.num_workers,
            timeout_secs = config.timeout.as_secs_f64(),
            build_fn = %config.build_fn.describe(),
            export_fn = %config.export_fn.describe(),
            "Starting local builder"
        );

        let pool = WorkerPool::start(&config).await.map_err(|e| {
            warn!(builder = %id, error = %e, "Local builder failed to start");
            e
        })?;

        Ok(Self {
            id,
            num_workers: config.num_workers,
            timeout: config.timeout,
            pool: Mutex::new(pool),
        })
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: BuilderMetrics) -> Self {
        self.pool.get_mut().set_metrics(metrics);
        self
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Workers currently able to take tasks
    pub async fn live_workers(&self) -> usize {
        self.pool.lock().await.live_workers()
    }

    /// Ask every worker to exit and reclaim it
    ///
    /// Dropping the builder also reclaims workers, by killing them.
    pub async fn shutdown(self) {
        let mut pool = self.pool.into_inner();
        pool.shutdown().await;
        info!(builder = %self.id, "Local builder shut down");
    }
}

#[async_trait]
impl Builder for LocalBuilder {
    async fn build(&self, inputs: &[BuildInput]) -> Vec<BuildResult> {
        if inputs.is_empty() {
            return Vec::new();
        }
        let mut pool = self.pool.lock().await;

        let started = Instant::now();
        info!(builder = %self.id, tasks = inputs.len(), "Build batch started");
        let results = pool.run_batch(inputs).await;

        let mut succeeded = 0usize;
        let mut timed_out = 0usize;
        let mut failed = 0usize;
        for result in &results {
            match FailureKind::of(result) {
                None => succeeded += 1,
                Some(FailureKind::Timeout) => timed_out += 1,
                Some(_) => failed += 1,
            }
        }
        info!(
            builder = %self.id,
            succeeded,
            failed,
            timed_out,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Build batch finished"
        );
        results
    }
}

impl fmt::Debug for LocalBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBuilder")
            .field("id", &self.id)
            .field("num_workers", &self.num_workers)
            .field("timeout", &self.timeout)
            .finish()
    }
}
