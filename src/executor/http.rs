//! Remote executor over HTTP.
//!
//! POSTs the request JSON to a configured endpoint. A 2xx body of the form
//! `{"result": ...}` or plain text is the task result.

use async_trait::async_trait;
use reqwest::Url;
use tracing::debug;

use super::{ExecutionRequest, Executor};
use crate::error::ExecutionError;

/// Delegates each task to a remote executor service.
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client: reqwest::Client,
    url: Url,
}

impl HttpExecutor {
    pub fn new(url: impl Into<String>) -> Result<Self, ExecutionError> {
        let raw = url.into();
        let url = Url::parse(&raw)
            .map_err(|e| ExecutionError::Failed(format!("Invalid executor URL {raw:?}: {e}")))?;
        Ok(Self {
            client: reqwest::Client::new(),
            url,
        })
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    fn name(&self) -> &str {
        "http"
    }

    async fn run(&self, request: ExecutionRequest) -> Result<String, ExecutionError> {
        let timeout = request.timeout();
        let map_err = |e: reqwest::Error| {
            if e.is_timeout() {
                ExecutionError::TimedOut(timeout)
            } else {
                ExecutionError::Failed(format!("Executor request failed: {e}"))
            }
        };

        let resp = self
            .client
            .post(self.url.clone())
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(map_err)?;

        let status = resp.status();
        let body = resp.text().await.map_err(map_err)?;

        if !status.is_success() {
            return Err(ExecutionError::Failed(format!(
                "Executor responded with HTTP {}: {}",
                status.as_u16(),
                body.trim()
            )));
        }

        debug!(task_id = %request.task_id, bytes = body.len(), "Executor response received");
        Ok(extract_result(&body))
    }
}

/// Pull the result out of an executor response body.
fn extract_result(body: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(serde_json::Value::Object(mut obj)) => match obj.remove("result") {
            Some(serde_json::Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => serde_json::Value::Object(obj).to_string(),
        },
        _ => body.trim().to_string(),
    }
}
