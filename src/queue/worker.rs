//! The single sequential worker.
//!
//! Dequeues one id at a time, drives it through the state machine and hands
//! terminal tasks with a callback endpoint to the dispatcher. No error in a
//! single task ends the loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::callback::CallbackDispatcher;
use crate::error::{ExecutionError, TaskError};
use crate::executor::{ExecutionRequest, Executor};
use crate::store::TaskStore;
use crate::tasks::{Task, TaskId, TaskTransition};

/// Terminal writes tried before falling back to marking the task failed.
const OUTCOME_WRITE_ATTEMPTS: u32 = 3;
const STORE_RETRY_DELAY: Duration = Duration::from_millis(50);
const STORE_RETRY_MAX_DELAY: Duration = Duration::from_secs(5);

/// Shared handles the worker needs.
#[derive(Clone)]
pub struct Worker {
    pub store: Arc<dyn TaskStore>,
    pub executor: Arc<dyn Executor>,
    pub dispatcher: Arc<CallbackDispatcher>,
    pub current: Arc<RwLock<Option<TaskId>>>,
    pub poll_interval: Duration,
}

/// Spawn the worker loop on `rx`.
///
/// Returns a `JoinHandle` that yields the receiver back once the loop
/// exits, and a shutdown flag. Set the flag to stop after the current task.
pub fn spawn_worker(
    worker: Worker,
    mut rx: mpsc::Receiver<TaskId>,
) -> (JoinHandle<mpsc::Receiver<TaskId>>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(
            executor = worker.executor.name(),
            poll_ms = worker.poll_interval.as_millis() as u64,
            "Task worker started"
        );

        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("Task worker shutting down");
                break;
            }

            match tokio::time::timeout(worker.poll_interval, rx.recv()).await {
                Ok(Some(id)) => worker.process(id).await,
                Ok(None) => {
                    warn!("Task channel closed, worker exiting");
                    break;
                }
                Err(_) => continue,
            }
        }

        rx
    });

    (handle, shutdown_flag)
}

impl Worker {
    /// Run one task with `current` set for its whole duration.
    pub async fn process(&self, id: TaskId) {
        *self.current.write().await = Some(id);
        self.execute(id).await;
        *self.current.write().await = None;
    }

    async fn execute(&self, id: TaskId) {
        match self
            .store
            .update(id, TaskTransition::MarkRunning { at: Utc::now() })
            .await
        {
            Ok(()) => {}
            Err(TaskError::NotFound { .. }) => {
                warn!(task_id = %id, "Task vanished before it could run, skipping");
                return;
            }
            Err(TaskError::InvalidTransition { state, .. }) => {
                warn!(task_id = %id, state = %state, "Task is no longer queued, skipping");
                return;
            }
            Err(e) => {
                error!(task_id = %id, "Failed to mark task running: {e}");
                return;
            }
        }

        let task = match self.store.get(id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!(task_id = %id, "Task deleted after it started, skipping");
                return;
            }
            Err(e) => {
                error!(task_id = %id, "Failed to load task: {e}");
                let failed = TaskTransition::MarkFailed {
                    reason: format!("Failed to load task: {e}"),
                    at: Utc::now(),
                };
                if self.settle(id, failed).await {
                    self.dispatch_callback(id).await;
                }
                return;
            }
        };

        info!(
            task_id = %id,
            target = %task.target,
            timeout_secs = task.timeout.as_secs(),
            "Task started"
        );

        let transition = self.run_executor(&task).await;
        if self.settle(id, transition).await && task.callback_endpoint.is_some() {
            self.dispatch_callback(id).await;
        }
    }

    /// Persist a terminal transition for a `running` task.
    ///
    /// Store errors are retried with backoff. If the outcome still cannot be
    /// written the task is marked failed instead, retried until the store
    /// accepts it, so the worker never leaves a task `running` behind.
    /// Returns `true` when the record is terminal afterwards.
    async fn settle(&self, id: TaskId, transition: TaskTransition) -> bool {
        let status = transition.name();
        let mut delay = STORE_RETRY_DELAY;

        let mut attempt = 1;
        let last_error = loop {
            match self.store.update(id, transition.clone()).await {
                Ok(()) => {
                    info!(task_id = %id, status, "Task finished");
                    return true;
                }
                Err(e) => {
                    if let Some(settled) = already_settled(id, status, &e) {
                        return settled;
                    }
                    warn!(
                        task_id = %id,
                        status,
                        attempt,
                        "Failed to record task outcome: {e}"
                    );
                    if attempt >= OUTCOME_WRITE_ATTEMPTS {
                        break e;
                    }
                }
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(STORE_RETRY_MAX_DELAY);
            attempt += 1;
        };

        let reason = format!("Failed to record task outcome: {last_error}");
        loop {
            let failed = TaskTransition::MarkFailed {
                reason: reason.clone(),
                at: Utc::now(),
            };
            match self.store.update(id, failed).await {
                Ok(()) => {
                    warn!(
                        task_id = %id,
                        dropped = status,
                        "Task marked failed after outcome write errors"
                    );
                    return true;
                }
                Err(e) => {
                    if let Some(settled) = already_settled(id, "failed", &e) {
                        return settled;
                    }
                    error!(task_id = %id, "Failed to mark task failed: {e}");
                }
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(STORE_RETRY_MAX_DELAY);
        }
    }

    /// Run the executor on its own task, bounded by the task timeout.
    async fn run_executor(&self, task: &Task) -> TaskTransition {
        let request = ExecutionRequest::from_task(task);
        let executor = Arc::clone(&self.executor);
        let mut handle = tokio::spawn(async move { executor.run(request).await });

        let outcome = match tokio::time::timeout(task.timeout, &mut handle).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => Err(ExecutionError::Failed(format!("executor task aborted: {e}"))),
            Err(_) => {
                handle.abort();
                Err(ExecutionError::TimedOut(task.timeout))
            }
        };

        let at = Utc::now();
        match outcome {
            Ok(result) => TaskTransition::MarkCompleted { result, at },
            Err(ExecutionError::TimedOut(_)) => {
                warn!(task_id = %task.id, "Task exceeded its timeout");
                TaskTransition::MarkTimedOut {
                    reason: format!(
                        "Task exceeded timeout of {} seconds",
                        task.timeout.as_secs()
                    ),
                    at,
                }
            }
            Err(e) => {
                warn!(task_id = %task.id, "Task execution failed: {e}");
                TaskTransition::MarkFailed {
                    reason: format!("Task execution error: {e}"),
                    at,
                }
            }
        }
    }

    async fn dispatch_callback(&self, id: TaskId) {
        let task = match self.store.get(id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!(task_id = %id, "Task deleted before its webhook, skipped");
                return;
            }
            Err(e) => {
                error!(task_id = %id, "Failed to load task for webhook: {e}");
                return;
            }
        };

        let Some(endpoint) = task.callback_endpoint.clone() else {
            return;
        };
        match task.callback_payload() {
            Some(payload) => {
                debug!(task_id = %id, endpoint = %endpoint, "Dispatching webhook");
                self.dispatcher.spawn(id, endpoint, payload).await;
            }
            None => warn!(task_id = %id, "No terminal record to report, webhook skipped"),
        }
    }
}

/// Outcome of a terminal write that the store refused for a non-transient
/// reason: `Some(true)` if the task is terminal anyway, `Some(false)` if it is
/// gone, `None` for errors worth retrying.
fn already_settled(id: TaskId, status: &str, err: &TaskError) -> Option<bool> {
    match err {
        TaskError::NotFound { .. } => {
            warn!(task_id = %id, status, "Task deleted while running, result dropped");
            Some(false)
        }
        TaskError::InvalidTransition { state, .. } => {
            warn!(task_id = %id, status, state = %state, "Task already left running");
            Some(state.is_terminal())
        }
        _ => None,
    }
}
