//! Bounded in-memory FIFO of task ids in front of the worker.
//!
//! The store is the source of truth; the queue only carries ids. Capacity is
//! reserved before a record is written, so a rejected submission leaves
//! nothing behind.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::worker::{Worker, spawn_worker};
use crate::callback::CallbackDispatcher;
use crate::config::QueueConfig;
use crate::error::TaskError;
use crate::executor::Executor;
use crate::store::TaskStore;
use crate::tasks::{Submission, TaskId, TaskSpec};

type WorkerHandle = (JoinHandle<mpsc::Receiver<TaskId>>, Arc<AtomicBool>);

/// Admission queue plus the single worker that drains it.
pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    executor: Arc<dyn Executor>,
    dispatcher: Arc<CallbackDispatcher>,
    config: QueueConfig,
    tx: mpsc::Sender<TaskId>,
    /// Receiver side, parked here while no worker is running.
    rx: Mutex<Option<mpsc::Receiver<TaskId>>>,
    current: Arc<RwLock<Option<TaskId>>>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl TaskQueue {
    pub fn new(
        store: Arc<dyn TaskStore>,
        executor: Arc<dyn Executor>,
        dispatcher: Arc<CallbackDispatcher>,
        config: QueueConfig,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.max_queue_size.max(1));
        Arc::new(Self {
            store,
            executor,
            dispatcher,
            config,
            tx,
            rx: Mutex::new(Some(rx)),
            current: Arc::new(RwLock::new(None)),
            worker: Mutex::new(None),
        })
    }

    /// Validate, persist and enqueue a new task.
    ///
    /// Fails with `QueueFull` when `max_queue_size` tasks are already waiting;
    /// no record is created in that case.
    pub async fn submit(&self, spec: TaskSpec) -> Result<Submission, TaskError> {
        let permit = self.tx.try_reserve().map_err(|e| self.admission_error(e))?;
        let queue_position = self.queue_depth().saturating_sub(1);

        // Dropping the permit on error releases the slot.
        let task = self.store.create(spec).await?;
        permit.send(task.id);

        info!(
            task_id = %task.id,
            target = %task.target,
            queue_position,
            "Task queued"
        );

        Ok(Submission {
            task_id: task.id,
            status: task.status,
            queue_position,
            created_at: task.created_at,
        })
    }

    /// Enqueue an already persisted task. Returns its queue position.
    pub fn enqueue(&self, id: TaskId) -> Result<usize, TaskError> {
        let queue_position = self.queue_depth();
        self.tx.try_send(id).map_err(|e| self.admission_error(e))?;
        info!(task_id = %id, queue_position, "Task enqueued");
        Ok(queue_position)
    }

    /// Spawn the worker. A no-op with a warning if it is already running.
    pub async fn start(&self) {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            warn!("Task queue already running");
            return;
        }

        let Some(rx) = self.rx.lock().await.take() else {
            error!("Task queue receiver lost, cannot start worker");
            return;
        };

        self.dispatcher.resume();
        let handles = Worker {
            store: Arc::clone(&self.store),
            executor: Arc::clone(&self.executor),
            dispatcher: Arc::clone(&self.dispatcher),
            current: Arc::clone(&self.current),
            poll_interval: self.config.poll_interval,
        };
        *worker = Some(spawn_worker(handles, rx));
        info!(max_queue_size = self.config.max_queue_size, "Task queue started");
    }

    /// Signal the worker and wait for it to finish its current task.
    ///
    /// Pending webhook backoffs are cancelled. The queue can be started again.
    pub async fn stop(&self) {
        let taken = self.worker.lock().await.take();
        let Some((handle, shutdown)) = taken else {
            return;
        };

        shutdown.store(true, Ordering::Relaxed);
        match handle.await {
            Ok(rx) => *self.rx.lock().await = Some(rx),
            Err(e) => error!("Task worker ended abnormally: {e}"),
        }

        self.dispatcher.shutdown().await;
        info!(waiting = self.queue_depth(), "Task queue stopped");
    }

    /// Whether the worker is running.
    pub async fn is_running(&self) -> bool {
        self.worker
            .lock()
            .await
            .as_ref()
            .is_some_and(|(handle, _)| !handle.is_finished())
    }

    /// The task the worker is executing, if any.
    pub async fn current_task(&self) -> Option<TaskId> {
        *self.current.read().await
    }

    /// Number of ids waiting (or reserved) in the queue.
    pub fn queue_depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn max_queue_size(&self) -> usize {
        self.config.max_queue_size
    }

    fn admission_error<T>(&self, err: TrySendError<T>) -> TaskError {
        match err {
            TrySendError::Full(_) => {
                warn!(max = self.config.max_queue_size, "Task queue full, submission rejected");
                TaskError::QueueFull {
                    max: self.config.max_queue_size,
                }
            }
            TrySendError::Closed(_) => TaskError::QueueClosed,
        }
    }
}
