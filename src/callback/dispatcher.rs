//! Webhook delivery with bounded retries.
//!
//! Each delivery runs on its own tokio task so the worker never waits for a
//! slow receiver. Backoff sleeps end early when the dispatcher shuts down;
//! attempts made so far stay recorded on the task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::WebhookConfig;
use crate::error::{DeliveryError, TaskError};
use crate::store::TaskStore;
use crate::tasks::{CallbackPayload, TaskId, TaskTransition};

/// How a delivery ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The receiver answered 2xx on attempt `attempts`.
    Delivered { attempts: u32 },
    /// Every attempt failed.
    Exhausted { attempts: u32 },
    /// Shutdown interrupted a backoff sleep.
    Cancelled { attempts: u32 },
}

/// Delay after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor)
}

/// POSTs terminal task payloads to caller-supplied endpoints.
pub struct CallbackDispatcher {
    client: reqwest::Client,
    store: Arc<dyn TaskStore>,
    config: WebhookConfig,
    shutdown: watch::Sender<bool>,
    in_flight: Mutex<JoinSet<()>>,
}

impl CallbackDispatcher {
    pub fn new(store: Arc<dyn TaskStore>, config: WebhookConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            client: reqwest::Client::new(),
            store,
            config,
            shutdown,
            in_flight: Mutex::new(JoinSet::new()),
        }
    }

    /// Start a delivery in the background and return immediately.
    pub async fn spawn(
        self: &Arc<Self>,
        task_id: TaskId,
        endpoint: String,
        payload: CallbackPayload,
    ) {
        let dispatcher = Arc::clone(self);
        let mut in_flight = self.in_flight.lock().await;
        while in_flight.try_join_next().is_some() {}
        in_flight.spawn(async move {
            dispatcher.deliver(task_id, &endpoint, &payload).await;
        });
    }

    /// Deliver `payload` to `endpoint`, retrying with exponential backoff.
    ///
    /// Never fails: the outcome is logged and recorded on the task.
    pub async fn deliver(
        &self,
        task_id: TaskId,
        endpoint: &str,
        payload: &CallbackPayload,
    ) -> DeliveryOutcome {
        let max_attempts = self.config.retry_attempts.max(1);
        let mut shutdown = self.shutdown.subscribe();

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = backoff_delay(self.config.retry_delay, attempt - 1);
                debug!(
                    task_id = %task_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Webhook backoff"
                );
                let stopping = *shutdown.borrow_and_update();
                let cancelled = stopping
                    || tokio::select! {
                        _ = tokio::time::sleep(delay) => false,
                        _ = shutdown.changed() => true,
                    };
                if cancelled {
                    warn!(
                        task_id = %task_id,
                        attempts = attempt - 1,
                        "Webhook delivery abandoned on shutdown"
                    );
                    return DeliveryOutcome::Cancelled { attempts: attempt - 1 };
                }
            }

            let result = self.post(endpoint, payload).await;
            let error = result.as_ref().err().map(ToString::to_string);
            self.record_attempt(task_id, attempt, error).await;

            match result {
                Ok(()) => {
                    info!(task_id = %task_id, attempt, endpoint, "Webhook delivered");
                    return DeliveryOutcome::Delivered { attempts: attempt };
                }
                Err(e) => {
                    warn!(task_id = %task_id, attempt, max_attempts, "Webhook attempt failed: {e}");
                }
            }
        }

        warn!(
            task_id = %task_id,
            attempts = max_attempts,
            endpoint,
            "Webhook delivery failed after all retries"
        );
        DeliveryOutcome::Exhausted {
            attempts: max_attempts,
        }
    }

    /// Cancel pending backoffs and wait for in-flight deliveries to finish.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let mut in_flight = self.in_flight.lock().await;
        let pending = in_flight.len();
        if pending > 0 {
            info!(pending, "Waiting for webhook deliveries");
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                warn!("Webhook delivery task panicked: {e}");
            }
        }
    }

    /// Allow deliveries to retry again after a `shutdown`.
    pub fn resume(&self) {
        self.shutdown.send_replace(false);
    }

    async fn post(&self, endpoint: &str, payload: &CallbackPayload) -> Result<(), DeliveryError> {
        let resp = self
            .client
            .post(endpoint)
            .timeout(self.config.timeout)
            .json(payload)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(DeliveryError::Status {
                endpoint: endpoint.to_string(),
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }

    async fn record_attempt(&self, task_id: TaskId, attempts: u32, error: Option<String>) {
        let transition = TaskTransition::RecordCallbackAttempt { attempts, error };
        match self.store.update(task_id, transition).await {
            Ok(()) => {}
            Err(TaskError::NotFound { .. }) => {
                debug!(task_id = %task_id, "Task deleted before webhook attempt was recorded");
            }
            Err(e) => {
                warn!(task_id = %task_id, attempts, "Failed to record webhook attempt: {e}");
            }
        }
    }
}
