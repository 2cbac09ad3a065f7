//! Worker pool
//!
//! A fixed set of slots, each holding at most one forked worker. A batch is
//! run by one lane per slot; lanes pull input indices from a shared queue and
//! are polled together on the calling task, so slot bookkeeping never needs
//! a lock. Timed-out or crashed workers are killed and replaced in place; a
//! replacement's handshake is awaited before it gets its first task.

mod child;
mod protocol;
mod worker;

use crate::builder::{BuildInput, BuildResult};
use crate::callbacks::WorkerCallbacks;
use crate::config::LocalBuilderConfig;
use crate::error::{exception_message, BuilderError, Result};
#[cfg(feature = "metrics")]
use crate::metrics::BuilderMetrics;
use crate::task::TaskStateMachine;
use futures::future::join_all;
use parking_lot::Mutex;
use protocol::{Rejection, WorkerMessage, WorkerRequest};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use worker::{WorkerEvent, WorkerProcess};

/// Grace period for a worker to exit after a shutdown request
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// State shared by every lane of the pool
struct PoolContext {
    callbacks: WorkerCallbacks,
    timeout: Duration,
    startup_timeout: Duration,
    next_task_id: AtomicU64,
    #[cfg(feature = "metrics")]
    metrics: Option<BuilderMetrics>,
}

impl PoolContext {
    fn spawn(&self) -> Result<WorkerProcess> {
        WorkerProcess::spawn(&self.callbacks)
    }

    /// Wait for the worker's `ready` message
    async fn handshake(&self, worker: &mut WorkerProcess) -> Result<()> {
        let deadline = Instant::now() + self.startup_timeout;
        loop {
            match worker.recv_until(deadline).await {
                Some(WorkerEvent::Message(WorkerMessage::Ready { pid })) => {
                    debug!(worker = worker.id(), pid, "Worker ready");
                    return Ok(());
                }
                Some(WorkerEvent::Message(WorkerMessage::Rejected { reason })) => {
                    return Err(match reason {
                        Rejection::UnresolvedCallback { callback, name } => {
                            BuilderError::UnresolvedCallback {
                                kind: callback,
                                name,
                            }
                        }
                        Rejection::Initializer { error } => BuilderError::WorkerInit(error),
                    });
                }
                Some(WorkerEvent::Message(other)) => {
                    return Err(BuilderError::protocol(format!(
                        "expected handshake from {}, got {:?}",
                        worker.id(),
                        other
                    )));
                }
                Some(WorkerEvent::Disconnected) => {
                    let status = worker.reap_disconnected().await;
                    return Err(BuilderError::WorkerInit(format!(
                        "worker exited during startup ({})",
                        status
                    )));
                }
                None => {
                    let status = worker.kill();
                    return Err(BuilderError::WorkerInit(format!(
                        "worker not ready within {} seconds ({})",
                        self.startup_timeout.as_secs_f64(),
                        status
                    )));
                }
            }
        }
    }

    #[cfg(feature = "metrics")]
    fn observe(&self, result: &BuildResult) {
        if let Some(metrics) = &self.metrics {
            metrics.observe(result);
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn observe(&self, _result: &BuildResult) {}

    fn observe_restart(&self) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.worker_restarts.inc();
        }
    }
}

/// One pool position
///
/// `worker == None` means the slot is retired: its last replacement could
/// not start, so it takes no more tasks.
struct WorkerSlot {
    index: usize,
    worker: Option<WorkerProcess>,
    ready: bool,
}

impl WorkerSlot {
    /// Await a pending handshake; `false` if the slot cannot take tasks
    async fn ensure_ready(&mut self, ctx: &PoolContext) -> bool {
        let Some(worker) = self.worker.as_mut() else {
            return false;
        };
        if self.ready {
            return true;
        }
        match ctx.handshake(worker).await {
            Ok(()) => {
                self.ready = true;
                true
            }
            Err(e) => {
                error!(slot = self.index, error = %e, "Replacement worker failed to start, retiring slot");
                self.worker = None;
                false
            }
        }
    }

    /// Kill the current worker and fork a replacement
    fn recycle(&mut self, ctx: &PoolContext) {
        if let Some(mut old) = self.worker.take() {
            let status = old.kill();
            debug!(slot = self.index, worker = old.id(), %status, "Reclaimed worker");
        }
        self.ready = false;
        ctx.observe_restart();
        match ctx.spawn() {
            Ok(worker) => {
                info!(
                    slot = self.index,
                    worker = worker.id(),
                    pid = worker.pid(),
                    "Replacement worker forked"
                );
                self.worker = Some(worker);
            }
            Err(e) => {
                error!(slot = self.index, error = %e, "Failed to fork replacement worker, retiring slot");
            }
        }
    }

    async fn run_task(&mut self, index: usize, input: &BuildInput, ctx: &PoolContext) -> BuildResult {
        let mut task = TaskStateMachine::new(index);
        let result = match self.drive(&mut task, input, ctx).await {
            Ok(()) => task.into_result(),
            Err(e) => Err(e),
        };
        let result = result.unwrap_or_else(|e| {
            error!(task = index, error = %e, "Task bookkeeping failed");
            BuildResult::failure(exception_message(e))
        });
        ctx.observe(&result);
        result
    }

    /// Move `task` from queued to a terminal state on this slot's worker
    async fn drive(
        &mut self,
        task: &mut TaskStateMachine,
        input: &BuildInput,
        ctx: &PoolContext,
    ) -> Result<()> {
        let worker = self
            .worker
            .as_mut()
            .ok_or_else(|| BuilderError::protocol("task dispatched to a retired slot"))?;
        let task_id = ctx.next_task_id.fetch_add(1, Ordering::Relaxed);
        task.start(worker.id())?;
        debug!(task = task.index(), task_id, worker = worker.id(), "Task running");

        let request = WorkerRequest::Build {
            task_id,
            input: input.clone(),
        };
        if let Err(e) = worker.send(request) {
            let status = worker.reap_disconnected().await;
            warn!(task = task.index(), worker = worker.id(), error = %e, %status, "Worker gone before accepting task");
            task.fail(exception_message(format!(
                "worker exited before accepting the task ({})",
                status
            )))?;
            self.recycle(ctx);
            return Ok(());
        }

        let deadline = Instant::now() + ctx.timeout;
        loop {
            match worker.recv_until(deadline).await {
                Some(WorkerEvent::Message(WorkerMessage::Built {
                    task_id: id,
                    artifact_path,
                })) if id == task_id => {
                    debug!(task = task.index(), artifact = ?artifact_path, "Task succeeded");
                    task.succeed(artifact_path)?;
                    return Ok(());
                }
                Some(WorkerEvent::Message(WorkerMessage::Failed {
                    task_id: id,
                    stage,
                    error,
                })) if id == task_id => {
                    debug!(task = task.index(), %stage, %error, "Task failed");
                    task.fail(exception_message(format!("{} failed: {}", stage, error)))?;
                    return Ok(());
                }
                Some(WorkerEvent::Message(other)) => {
                    warn!(worker = worker.id(), message = ?other, "Ignoring unexpected worker message");
                }
                Some(WorkerEvent::Disconnected) => {
                    let status = worker.reap_disconnected().await;
                    warn!(task = task.index(), worker = worker.id(), %status, "Worker died during task");
                    task.fail(exception_message(format!(
                        "worker exited unexpectedly ({})",
                        status
                    )))?;
                    self.recycle(ctx);
                    return Ok(());
                }
                None => {
                    warn!(
                        task = task.index(),
                        worker = worker.id(),
                        timeout_secs = ctx.timeout.as_secs_f64(),
                        "Task timed out, killing worker"
                    );
                    task.time_out(ctx.timeout)?;
                    self.recycle(ctx);
                    return Ok(());
                }
            }
        }
    }
}

/// The process pool behind a `LocalBuilder`
pub(crate) struct WorkerPool {
    slots: Vec<WorkerSlot>,
    ctx: PoolContext,
}

impl WorkerPool {
    /// Fork `num_workers` workers and wait until every one is ready
    pub async fn start(config: &LocalBuilderConfig) -> Result<Self> {
        let ctx = PoolContext {
            callbacks: WorkerCallbacks {
                build: config.build_fn.clone(),
                export: config.export_fn.clone(),
                initializer: config.initializer.clone(),
            },
            timeout: config.timeout,
            startup_timeout: config.startup_timeout,
            next_task_id: AtomicU64::new(0),
            #[cfg(feature = "metrics")]
            metrics: None,
        };

        let mut workers = Vec::with_capacity(config.num_workers);
        for _ in 0..config.num_workers {
            workers.push(ctx.spawn()?);
        }

        let handshakes = join_all(workers.iter_mut().map(|w| ctx.handshake(w))).await;
        // Configuration errors take precedence over incidental startup failures
        let mut first_error: Option<BuilderError> = None;
        for outcome in handshakes {
            if let Err(e) = outcome {
                match &first_error {
                    Some(prev) if prev.is_configuration() || !e.is_configuration() => {}
                    _ => first_error = Some(e),
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let slots = workers
            .into_iter()
            .enumerate()
            .map(|(index, worker)| WorkerSlot {
                index,
                worker: Some(worker),
                ready: true,
            })
            .collect();
        Ok(Self { slots, ctx })
    }

    #[cfg(feature = "metrics")]
    pub fn set_metrics(&mut self, metrics: BuilderMetrics) {
        self.ctx.metrics = Some(metrics);
    }

    /// Slots still able to take tasks
    pub fn live_workers(&self) -> usize {
        self.slots.iter().filter(|s| s.worker.is_some()).count()
    }

    /// Run a batch; `results[i]` belongs to `inputs[i]`
    pub async fn run_batch(&mut self, inputs: &[BuildInput]) -> Vec<BuildResult> {
        let queue = Mutex::new((0..inputs.len()).collect::<VecDeque<usize>>());
        let WorkerPool { slots, ctx } = self;
        let ctx = &*ctx;

        let lanes = slots.iter_mut().map(|slot| {
            let queue = &queue;
            async move {
                let mut done = Vec::new();
                loop {
                    let pending = !queue.lock().is_empty();
                    if !pending || !slot.ensure_ready(ctx).await {
                        break;
                    }
                    let next = queue.lock().pop_front();
                    let Some(index) = next else {
                        break;
                    };
                    let result = slot.run_task(index, &inputs[index], ctx).await;
                    done.push((index, result));
                }
                done
            }
        });

        let mut results: Vec<Option<BuildResult>> = vec![None; inputs.len()];
        for (index, result) in join_all(lanes).await.into_iter().flatten() {
            results[index] = Some(result);
        }

        results
            .into_iter()
            .enumerate()
            .map(|(index, result)| {
                result.unwrap_or_else(|| {
                    error!(task = index, "No live worker left to run task");
                    let result =
                        BuildResult::failure(exception_message("no live worker left in the pool"));
                    ctx.observe(&result);
                    result
                })
            })
            .collect()
    }

    /// Ask every worker to exit and reclaim it
    pub async fn shutdown(&mut self) {
        let workers: Vec<WorkerProcess> = self
            .slots
            .iter_mut()
            .filter_map(|slot| {
                slot.ready = false;
                slot.worker.take()
            })
            .collect();
        join_all(workers.into_iter().map(|w| w.shutdown(SHUTDOWN_GRACE))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::{BuildFn, FnRef};
    use crate::error::{EXCEPTION_PREFIX, TIMEOUT_PREFIX};
    use autotune_ir::{IRModule, Target};

    fn inputs(n: usize) -> Vec<BuildInput> {
        (0..n)
            .map(|_| BuildInput::new(IRModule::new(), Target::new("llvm")))
            .collect()
    }

    fn config(build: FnRef<BuildFn>) -> LocalBuilderConfig {
        LocalBuilderConfig::new()
            .with_num_workers(2)
            .with_timeout(Duration::from_secs(1))
            .with_build_fn(build)
    }

    #[tokio::test]
    async fn test_crashed_worker_is_replaced() {
        // The empty program marks the task that takes its worker down
        let build = FnRef::<BuildFn>::direct(|program: &IRModule, _, _| {
            if program.is_empty() {
                std::process::abort();
            }
            anyhow::bail!("not a crash")
        });
        let mut pool = WorkerPool::start(&config(build)).await.unwrap();

        let mut batch = inputs(1);
        batch.push(BuildInput::new(
            IRModule::from_func("main", autotune_ir::PrimFunc::new()),
            Target::new("llvm"),
        ));
        let results = pool.run_batch(&batch).await;

        let crashed = results[0].error_msg().unwrap();
        assert!(crashed.starts_with(EXCEPTION_PREFIX));
        assert!(crashed.contains("worker exited unexpectedly"));
        assert!(results[1].error_msg().unwrap().contains("not a crash"));

        // The replacement serves the next batch
        let results = pool.run_batch(&batch[1..]).await;
        assert!(results[0].error_msg().unwrap().contains("not a crash"));
        assert_eq!(pool.live_workers(), 2);
        pool.shutdown().await;
        assert_eq!(pool.live_workers(), 0);
    }

    #[tokio::test]
    async fn test_timed_out_worker_is_replaced() {
        let build = FnRef::<BuildFn>::direct(|_, _, _| {
            std::thread::sleep(Duration::from_secs(10));
            anyhow::bail!("unreachable")
        });
        let mut pool = WorkerPool::start(&config(build).with_num_workers(1))
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let results = pool.run_batch(&inputs(1)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(results[0].error_msg().unwrap().starts_with(TIMEOUT_PREFIX));
        assert_eq!(pool.live_workers(), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_retired_slots_fail_remaining_tasks() {
        use std::sync::atomic::AtomicBool;
        use std::sync::Arc;

        // Workers forked after the first batch starts refuse to initialize
        let poisoned = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&poisoned);
        let config = config(FnRef::<BuildFn>::direct(|_, _, _| std::process::abort()))
            .with_num_workers(1)
            .with_initializer(move || {
                if flag.load(Ordering::SeqCst) {
                    anyhow::bail!("poisoned");
                }
                Ok(())
            });
        let mut pool = WorkerPool::start(&config).await.unwrap();
        poisoned.store(true, Ordering::SeqCst);

        let results = pool.run_batch(&inputs(3)).await;
        assert_eq!(results.len(), 3);
        assert!(results[0]
            .error_msg()
            .unwrap()
            .contains("worker exited unexpectedly"));
        for result in &results[1..] {
            assert!(result.error_msg().unwrap().starts_with(EXCEPTION_PREFIX));
            assert!(result.error_msg().unwrap().contains("no live worker"));
        }
        assert_eq!(pool.live_workers(), 0);
    }
}
