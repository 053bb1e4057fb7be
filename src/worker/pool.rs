//! Consumer side of the queue: claims tasks and runs them.
//!
//! Each claimed task runs in its own tokio task with a child of the pool's
//! root [`CancellationToken`]. The registry maps handles to those tokens so
//! the revocation watcher can cancel one task, and shutdown can cancel all of
//! them at once.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::error::{BrokerError, ToolInvocationError};
use crate::invoker::{ExecutionResult, Invoker, TaskLogger};
use crate::logstream::LogChannel;
use crate::queue::{Broker, ClaimedTask, TaskHandle, TaskState};

use super::lifecycle::is_process_alive;

/// How long shutdown waits for each running task to wind down.
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

const WORKER_ID_PREFIX: &str = "genqueue-";

/// Error recorded for a task whose tool was killed by pool shutdown.
pub const SHUTDOWN_ERROR: &str = "Worker shut down before the task finished";

/// PID embedded in a worker id (`genqueue-{pid}-{suffix}`).
fn worker_pid(worker_id: &str) -> Option<u32> {
    worker_id
        .strip_prefix(WORKER_ID_PREFIX)?
        .split('-')
        .next()?
        .parse()
        .ok()
}

struct RunningEntry {
    cancel_token: CancellationToken,
    join_handle: Option<JoinHandle<()>>,
}

/// Registry of tasks currently executing in this worker.
#[derive(Clone)]
pub struct RunningTasks {
    entries: Arc<Mutex<HashMap<TaskHandle, RunningEntry>>>,
    root_cancel_token: CancellationToken,
}

impl RunningTasks {
    pub fn new(root_cancel_token: CancellationToken) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            root_cancel_token,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TaskHandle, RunningEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `handle` and return its cancellation token.
    pub fn register(&self, handle: &TaskHandle) -> CancellationToken {
        let token = self.root_cancel_token.child_token();
        self.lock().insert(
            handle.clone(),
            RunningEntry {
                cancel_token: token.clone(),
                join_handle: None,
            },
        );
        token
    }

    pub fn set_join_handle(&self, handle: &TaskHandle, join: JoinHandle<()>) {
        if let Some(entry) = self.lock().get_mut(handle) {
            entry.join_handle = Some(join);
        }
    }

    pub fn remove(&self, handle: &TaskHandle) {
        self.lock().remove(handle);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, handle: &TaskHandle) -> bool {
        self.lock().contains_key(handle)
    }

    /// Cancel one task. Returns `true` if it was running here.
    pub fn cancel(&self, handle: &TaskHandle) -> bool {
        match self.lock().get(handle) {
            Some(entry) => {
                entry.cancel_token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every task and wait (bounded) for each to finish.
    pub async fn shutdown_all(&self) {
        self.root_cancel_token.cancel();

        let handles: Vec<JoinHandle<()>> = self
            .lock()
            .values_mut()
            .filter_map(|e| e.join_handle.take())
            .collect();

        for handle in handles {
            let _ = tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, handle).await;
        }
    }
}

/// Shared pieces every task execution needs.
#[derive(Clone)]
struct TaskContext {
    broker: Broker,
    logs: Option<LogChannel>,
    invoker: Arc<Invoker>,
    worker_id: String,
}

pub struct WorkerPool {
    ctx: TaskContext,
    running: RunningTasks,
    concurrency: usize,
    poll_interval: Duration,
}

impl WorkerPool {
    /// Open the broker and log store named by `config`.
    pub async fn connect(config: AppConfig) -> Result<Self, BrokerError> {
        let broker = Broker::open(&config.broker_path).await?;
        let logs = LogChannel::connect(&config.log_store_path).await;
        Ok(Self::new(config, broker, logs))
    }

    pub fn new(config: AppConfig, broker: Broker, logs: Option<LogChannel>) -> Self {
        let worker_id = format!(
            "{WORKER_ID_PREFIX}{}-{}",
            std::process::id(),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        Self {
            concurrency: config.worker_concurrency.max(1),
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            ctx: TaskContext {
                broker,
                logs,
                invoker: Arc::new(Invoker::new(config)),
                worker_id,
            },
            running: RunningTasks::new(CancellationToken::new()),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.ctx.worker_id
    }

    pub fn running(&self) -> &RunningTasks {
        &self.running
    }

    /// Claim and run tasks until `shutdown` fires, then cancel whatever is
    /// still running.
    pub async fn run_until(&self, shutdown: CancellationToken) {
        tracing::info!(
            worker = %self.ctx.worker_id,
            concurrency = self.concurrency,
            "Worker pool started"
        );
        self.fail_abandoned().await;
        let mut ticker = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            self.cancel_revoked().await;
            self.fill_slots().await;
        }

        tracing::info!(
            worker = %self.ctx.worker_id,
            running = self.running.len(),
            "Worker pool shutting down"
        );
        self.running.shutdown_all().await;
    }

    /// Settle tasks left in PROGRESS by worker processes that no longer
    /// exist, so their handles reach a terminal state.
    async fn fail_abandoned(&self) {
        let in_flight = match self.ctx.broker.list_in_state(TaskState::Progress).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "Abandoned task scan failed");
                return;
            }
        };
        let gone: BTreeSet<String> = in_flight
            .into_iter()
            .filter_map(|(worker, _)| worker)
            .filter(|worker| worker_pid(worker).is_some_and(|pid| !is_process_alive(pid)))
            .collect();

        for worker in gone {
            let message = format!("Worker {worker} exited before the task finished");
            match self.ctx.broker.fail_abandoned(&worker, &message).await {
                Ok(count) => tracing::warn!(worker = %worker, count, "Failed abandoned tasks"),
                Err(e) => tracing::warn!(worker = %worker, error = %e, "Could not fail abandoned tasks"),
            }
        }
    }

    async fn cancel_revoked(&self) {
        if self.running.is_empty() {
            return;
        }
        match self.ctx.broker.revoked_for_worker(&self.ctx.worker_id).await {
            Ok(revoked) => {
                for handle in revoked {
                    if self.running.cancel(&handle) {
                        tracing::info!(task = %handle, "Task revoked, killing tool");
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "Revocation check failed"),
        }
    }

    async fn fill_slots(&self) {
        while self.running.len() < self.concurrency {
            match self.ctx.broker.claim(&self.ctx.worker_id).await {
                Ok(Some(claimed)) => self.dispatch(claimed),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Claim failed");
                    break;
                }
            }
        }
    }

    fn dispatch(&self, claimed: ClaimedTask) {
        let handle = claimed.handle.clone();
        let token = self.running.register(&handle);
        let ctx = self.ctx.clone();
        let running = self.running.clone();
        let task_handle = handle.clone();

        let join = tokio::spawn(async move {
            execute_claimed(&ctx, claimed, &token).await;
            running.remove(&task_handle);
        });
        self.running.set_join_handle(&handle, join);
    }
}

async fn execute_claimed(ctx: &TaskContext, claimed: ClaimedTask, cancel: &CancellationToken) {
    let ClaimedTask { handle, task } = claimed;
    let descriptor = &task.descriptor;

    let mut logger = TaskLogger::new(handle.to_string())
        .with_progress(ctx.broker.clone(), handle.clone());
    if let Some(logs) = &ctx.logs {
        logger = logger.with_live(logs.clone(), handle.clone());
    }
    logger
        .info(format!(
            "Worker {} picked up {} task for database {}",
            ctx.worker_id, descriptor.task_type, task.database_name
        ))
        .await;

    let outcome = ctx
        .invoker
        .execute(
            descriptor,
            &task.database_name,
            task.shared_rules_path.as_deref(),
            &mut logger,
            cancel,
        )
        .await;

    let recorded = match outcome {
        Ok(mut result) => {
            result.logs = logger.take_entries();
            ctx.broker.complete(&handle, &result).await
        }
        Err(e) => {
            // A revocation has already settled the row, so this write only
            // lands when the kill came from shutdown.
            let message = match e {
                ToolInvocationError::Cancelled => SHUTDOWN_ERROR.to_string(),
                other => other.to_string(),
            };
            let mut result = ExecutionResult::failed(descriptor, logger.log_path(), message.clone());
            result.logs = logger.take_entries();
            ctx.broker.fail(&handle, &message, Some(&result)).await
        }
    };

    match recorded {
        Ok(true) => {}
        Ok(false) => tracing::info!(task = %handle, "Task settled elsewhere; result dropped"),
        Err(e) => tracing::error!(task = %handle, error = %e, "Failed to record task result"),
    }
}

/// Entry point of `genqueue worker`: run until Ctrl-C or SIGTERM.
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let pool = WorkerPool::connect(config).await?;
    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_token.cancel();
    });

    pool.run_until(shutdown).await;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
