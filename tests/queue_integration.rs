//! End-to-end tests for the queue, worker, store and webhook dispatcher.
//!
//! Each test wires the real components together with a stub executor and,
//! where callbacks are involved, an Axum webhook receiver on a random port.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::time::timeout;

use task_relay::callback::CallbackDispatcher;
use task_relay::config::{QueueConfig, TaskLimits, WebhookConfig};
use task_relay::error::ExecutionError;
use task_relay::executor::{ExecutionRequest, Executor};
use task_relay::queue::{TaskQueue, reconcile_on_startup};
use task_relay::store::{LibSqlTaskStore, TaskStore};
use task_relay::tasks::{RESTART_FAILURE_REASON, Task, TaskId, TaskSpec, TaskStatus};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Executor that records call order and concurrency.
struct RecordingExecutor {
    result: &'static str,
    delay: Duration,
    hang: bool,
    active: AtomicUsize,
    max_active: AtomicUsize,
    order: Mutex<Vec<String>>,
}

impl RecordingExecutor {
    fn returning(result: &'static str) -> Self {
        Self {
            result,
            delay: Duration::ZERO,
            hang: false,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            order: Mutex::new(Vec::new()),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::returning("never")
        }
    }
}

#[async_trait]
impl Executor for RecordingExecutor {
    fn name(&self) -> &str {
        "recording"
    }

    async fn run(&self, request: ExecutionRequest) -> Result<String, ExecutionError> {
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        self.order.lock().await.push(request.target.clone());

        if self.hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        tokio::time::sleep(self.delay).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(self.result.to_string())
    }
}

/// Webhook receiver that fails the first `fail_first` requests with 500.
#[derive(Clone)]
struct Receiver {
    hits: Arc<AtomicUsize>,
    fail_first: usize,
    bodies: Arc<Mutex<Vec<Value>>>,
}

async fn receive(State(rx): State<Receiver>, Json(body): Json<Value>) -> StatusCode {
    rx.bodies.lock().await.push(body);
    if rx.hits.fetch_add(1, Ordering::SeqCst) < rx.fail_first {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    }
}

/// Start a webhook receiver on a random port, return (url, receiver).
async fn start_receiver(fail_first: usize) -> (String, Receiver) {
    let rx = Receiver {
        hits: Arc::new(AtomicUsize::new(0)),
        fail_first,
        bodies: Arc::new(Mutex::new(Vec::new())),
    };
    let app = Router::new()
        .route("/webhook/task-complete", post(receive))
        .with_state(rx.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://127.0.0.1:{port}/webhook/task-complete"), rx)
}

/// Limits that allow the one-second timeouts used below.
fn test_limits() -> TaskLimits {
    TaskLimits {
        min_timeout: Duration::from_secs(1),
        ..TaskLimits::default()
    }
}

fn fast_webhooks() -> WebhookConfig {
    WebhookConfig {
        retry_attempts: 3,
        retry_delay: Duration::from_millis(20),
        timeout: Duration::from_secs(2),
    }
}

fn build_queue(
    store: Arc<LibSqlTaskStore>,
    executor: Arc<RecordingExecutor>,
    webhooks: WebhookConfig,
) -> Arc<TaskQueue> {
    let dispatcher = Arc::new(CallbackDispatcher::new(store.clone(), webhooks));
    TaskQueue::new(
        store,
        executor,
        dispatcher,
        QueueConfig {
            max_queue_size: 100,
            poll_interval: Duration::from_millis(20),
        },
    )
}

fn spec(target: &str, timeout_secs: u64) -> TaskSpec {
    TaskSpec::new(target, "Fill in the contact form and submit it")
        .with_timeout(Duration::from_secs(timeout_secs))
}

async fn wait_until_terminal(store: &LibSqlTaskStore, id: TaskId) -> Task {
    loop {
        let task = store.get(id).await.unwrap().unwrap();
        if task.status.is_terminal() {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn assert_timestamps_ordered(task: &Task) {
    let started = task.started_at.expect("started_at set");
    let completed = task.completed_at.expect("completed_at set");
    assert!(task.created_at <= started, "created_at after started_at");
    assert!(started <= completed, "started_at after completed_at");
}

#[tokio::test]
async fn scenario_a_completes_without_callback() {
    timeout(TEST_TIMEOUT, async {
        let store = Arc::new(LibSqlTaskStore::new_memory(test_limits()).await.unwrap());
        let executor = Arc::new(RecordingExecutor::returning("done"));
        let queue = build_queue(store.clone(), executor, fast_webhooks());
        queue.start().await;

        let sub = queue
            .submit(spec("https://example.com/a", 30))
            .await
            .unwrap();
        assert_eq!(sub.status, TaskStatus::Queued);

        let task = wait_until_terminal(&store, sub.task_id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_deref(), Some("done"));
        assert!(task.failure_reason.is_none());
        assert_eq!(task.callback_attempts, 0);
        assert_timestamps_ordered(&task);

        queue.stop().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn scenario_b_hung_executor_times_out_and_notifies() {
    timeout(TEST_TIMEOUT, async {
        let store = Arc::new(LibSqlTaskStore::new_memory(test_limits()).await.unwrap());
        let executor = Arc::new(RecordingExecutor::hanging());
        let queue = build_queue(store.clone(), executor, fast_webhooks());
        let (url, rx) = start_receiver(0).await;
        queue.start().await;

        let sub = queue
            .submit(spec("https://example.com/b", 1).with_callback(url))
            .await
            .unwrap();

        let task = wait_until_terminal(&store, sub.task_id).await;
        assert_eq!(task.status, TaskStatus::TimedOut);
        assert_eq!(
            task.failure_reason.as_deref(),
            Some("Task exceeded timeout of 1 seconds")
        );
        assert!(task.result.is_none());
        assert_timestamps_ordered(&task);

        while rx.hits.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let bodies = rx.bodies.lock().await.clone();
        assert_eq!(bodies[0]["status"], "timed_out");
        assert_eq!(bodies[0]["task_id"], sub.task_id.to_string());
        assert!(bodies[0]["result"].is_null());
        assert_eq!(bodies[0]["error"], "Task exceeded timeout of 1 seconds");

        queue.stop().await;
        let task = store.get(sub.task_id).await.unwrap().unwrap();
        assert_eq!(task.callback_attempts, 1);
        assert!(task.last_callback_error.is_none());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn scenario_c_restart_before_dequeue_fails_task() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");

        let id = {
            let store = Arc::new(LibSqlTaskStore::new_local(&path, test_limits()).await.unwrap());
            let executor = Arc::new(RecordingExecutor::returning("done"));
            let queue = build_queue(store.clone(), executor, fast_webhooks());
            // Never started: the process "dies" with the task still queued.
            queue
                .submit(spec("https://example.com/c", 30))
                .await
                .unwrap()
                .task_id
        };

        let store = Arc::new(LibSqlTaskStore::new_local(&path, test_limits()).await.unwrap());
        assert_eq!(reconcile_on_startup(store.as_ref()).await.unwrap(), 1);

        let task = store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.failure_reason.as_deref(), Some(RESTART_FAILURE_REASON));
        assert!(task.completed_at.is_some());

        let active = store.list(Some(TaskStatus::Queued), 100, 0).await.unwrap();
        assert_eq!(active.total, 0);
        let active = store.list(Some(TaskStatus::Running), 100, 0).await.unwrap();
        assert_eq!(active.total, 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn scenario_d_tasks_complete_in_submission_order() {
    timeout(TEST_TIMEOUT, async {
        let store = Arc::new(LibSqlTaskStore::new_memory(test_limits()).await.unwrap());
        let executor =
            Arc::new(RecordingExecutor::returning("done").with_delay(Duration::from_millis(30)));
        let queue = build_queue(store.clone(), executor.clone(), fast_webhooks());

        let targets: Vec<String> = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|n| format!("https://example.com/{n}"))
            .collect();
        let mut ids = Vec::new();
        for (pos, target) in targets.iter().enumerate() {
            let sub = queue.submit(spec(target, 30)).await.unwrap();
            assert_eq!(sub.queue_position, pos);
            ids.push(sub.task_id);
        }

        queue.start().await;
        let mut finished = Vec::new();
        for id in &ids {
            finished.push(wait_until_terminal(&store, *id).await);
        }
        queue.stop().await;

        assert_eq!(*executor.order.lock().await, targets);
        assert_eq!(executor.max_active.load(Ordering::SeqCst), 1);
        for pair in finished.windows(2) {
            assert_eq!(pair[0].status, TaskStatus::Completed);
            assert!(pair[0].completed_at.unwrap() <= pair[1].started_at.unwrap());
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn at_most_one_task_runs_at_a_time() {
    timeout(TEST_TIMEOUT, async {
        let store = Arc::new(LibSqlTaskStore::new_memory(test_limits()).await.unwrap());
        let executor =
            Arc::new(RecordingExecutor::returning("done").with_delay(Duration::from_millis(50)));
        let queue = build_queue(store.clone(), executor.clone(), fast_webhooks());
        queue.start().await;

        let mut ids = Vec::new();
        for n in 0..4 {
            let target = format!("https://example.com/{n}");
            ids.push(queue.submit(spec(&target, 30)).await.unwrap().task_id);
        }

        let mut saw_current = false;
        for id in &ids {
            loop {
                let running = store.list(Some(TaskStatus::Running), 100, 0).await.unwrap();
                assert!(running.total <= 1, "more than one running task");
                if let Some(current) = queue.current_task().await {
                    saw_current = true;
                    assert!(ids.contains(&current));
                }
                if store.get(*id).await.unwrap().unwrap().status.is_terminal() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        queue.stop().await;

        assert!(saw_current);
        assert_eq!(executor.max_active.load(Ordering::SeqCst), 1);
        assert!(queue.current_task().await.is_none());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn webhook_retries_are_recorded() {
    timeout(TEST_TIMEOUT, async {
        let store = Arc::new(LibSqlTaskStore::new_memory(test_limits()).await.unwrap());
        let executor = Arc::new(RecordingExecutor::returning("done"));
        let queue = build_queue(store.clone(), executor, fast_webhooks());
        let (url, rx) = start_receiver(2).await;
        queue.start().await;

        let sub = queue
            .submit(spec("https://example.com/hook", 30).with_callback(url))
            .await
            .unwrap();
        wait_until_terminal(&store, sub.task_id).await;

        while rx.hits.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        queue.stop().await;

        let task = store.get(sub.task_id).await.unwrap().unwrap();
        assert_eq!(task.callback_attempts, 3);
        assert!(task.last_callback_error.is_none());
        assert_eq!(rx.hits.load(Ordering::SeqCst), 3);

        let bodies = rx.bodies.lock().await;
        assert!(bodies.iter().all(|b| b["status"] == "completed" && b["result"] == "done"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn deleting_a_running_task_does_not_stop_the_worker() {
    timeout(TEST_TIMEOUT, async {
        let store = Arc::new(LibSqlTaskStore::new_memory(test_limits()).await.unwrap());
        let executor =
            Arc::new(RecordingExecutor::returning("done").with_delay(Duration::from_millis(200)));
        let queue = build_queue(store.clone(), executor, fast_webhooks());
        queue.start().await;

        let first = queue
            .submit(spec("https://example.com/1", 30))
            .await
            .unwrap();
        let second = queue
            .submit(spec("https://example.com/2", 30))
            .await
            .unwrap();

        while queue.current_task().await != Some(first.task_id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(store.delete(first.task_id).await.unwrap());

        let task = wait_until_terminal(&store, second.task_id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(store.get(first.task_id).await.unwrap().is_none());

        queue.stop().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn stop_waits_for_in_flight_task() {
    timeout(TEST_TIMEOUT, async {
        let store = Arc::new(LibSqlTaskStore::new_memory(test_limits()).await.unwrap());
        let executor =
            Arc::new(RecordingExecutor::returning("done").with_delay(Duration::from_millis(300)));
        let queue = build_queue(store.clone(), executor, fast_webhooks());
        queue.start().await;

        let sub = queue
            .submit(spec("https://example.com/slow", 30))
            .await
            .unwrap();
        while queue.current_task().await != Some(sub.task_id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        queue.stop().await;

        let task = store.get(sub.task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_deref(), Some("done"));
        let running = store.list(Some(TaskStatus::Running), 50, 0).await.unwrap();
        assert_eq!(running.total, 0);
        assert!(!queue.is_running().await);
    })
    .await
    .expect("test timed out");
}
