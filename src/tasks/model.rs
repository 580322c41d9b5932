//! Task records, submission specs and the webhook payload.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::TaskStatus;
use crate::config::TaskLimits;
use crate::error::TaskError;

/// Task identifier.
pub type TaskId = Uuid;

/// Minimum instruction length, in characters.
pub const MIN_INSTRUCTIONS_LEN: usize = 10;

/// Maximum instruction length, in characters.
pub const MAX_INSTRUCTIONS_LEN: usize = 2000;

/// Failure reason written by startup reconciliation.
pub const RESTART_FAILURE_REASON: &str = "server restarted during execution";

/// Caller-supplied key/value data handed to the executor untouched.
///
/// Stored as a JSON object in the `parameters` column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameters(BTreeMap<String, serde_json::Value>);

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Encode for the store boundary.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.0)
    }

    /// Decode from the store boundary. Empty text means no parameters.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw).map(Self)
    }
}

impl From<BTreeMap<String, serde_json::Value>> for Parameters {
    fn from(map: BTreeMap<String, serde_json::Value>) -> Self {
        Self(map)
    }
}

/// What a caller submits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub target: String,
    pub instructions: String,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default)]
    pub callback_endpoint: Option<String>,
    /// Execution bound; `None` takes the configured default.
    #[serde(default, with = "opt_secs")]
    pub timeout: Option<Duration>,
}

impl TaskSpec {
    pub fn new(target: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            instructions: instructions.into(),
            parameters: Parameters::default(),
            callback_endpoint: None,
            timeout: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_callback(mut self, endpoint: impl Into<String>) -> Self {
        self.callback_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Check the spec against `limits` and return the effective timeout.
    pub fn validate(&self, limits: &TaskLimits) -> Result<Duration, TaskError> {
        validate_http_url("target", &self.target)?;

        let len = self.instructions.trim().chars().count();
        if !(MIN_INSTRUCTIONS_LEN..=MAX_INSTRUCTIONS_LEN).contains(&len) {
            return Err(TaskError::validation(
                "instructions",
                format!(
                    "length {len} outside {MIN_INSTRUCTIONS_LEN}..={MAX_INSTRUCTIONS_LEN} characters"
                ),
            ));
        }

        if let Some(endpoint) = &self.callback_endpoint {
            validate_http_url("callback_endpoint", endpoint)?;
        }

        let timeout = self.timeout.unwrap_or(limits.default_timeout);
        if timeout < limits.min_timeout || timeout > limits.max_timeout {
            return Err(TaskError::validation(
                "timeout",
                format!(
                    "{}s outside [{}s, {}s]",
                    timeout.as_secs_f64(),
                    limits.min_timeout.as_secs(),
                    limits.max_timeout.as_secs()
                ),
            ));
        }

        Ok(timeout)
    }
}

fn validate_http_url(field: &str, raw: &str) -> Result<(), TaskError> {
    let url = Url::parse(raw).map_err(|e| TaskError::validation(field, format!("{raw:?}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(TaskError::validation(
            field,
            format!("unsupported scheme {other:?}, expected http or https"),
        )),
    }
}

/// A persisted task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub target: String,
    pub instructions: String,
    pub parameters: Parameters,
    pub callback_endpoint: Option<String>,
    #[serde(with = "secs")]
    pub timeout: Duration,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub failure_reason: Option<String>,
    pub callback_attempts: u32,
    pub last_callback_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Build a fresh `queued` record from an already validated spec.
    pub fn queued(spec: TaskSpec, timeout: Duration, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            target: spec.target,
            instructions: spec.instructions,
            parameters: spec.parameters,
            callback_endpoint: spec.callback_endpoint,
            timeout,
            status: TaskStatus::Queued,
            result: None,
            failure_reason: None,
            callback_attempts: 0,
            last_callback_error: None,
            created_at,
            started_at: None,
            completed_at: None,
        }
    }

    /// Webhook body for a terminal task, `None` while it is still active.
    pub fn callback_payload(&self) -> Option<CallbackPayload> {
        if !self.status.is_terminal() {
            return None;
        }
        Some(CallbackPayload {
            task_id: self.id,
            status: self.status,
            result: self.result.clone(),
            error: self.failure_reason.clone(),
            completed_at: self.completed_at.unwrap_or(self.created_at),
        })
    }
}

/// Returned to the caller of `submit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// Tasks ahead of this one at admission time. Advisory only.
    pub queue_position: usize,
    pub created_at: DateTime<Utc>,
}

/// Webhook body. Same shape for every terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// One page of a `list` query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(d)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> TaskLimits {
        TaskLimits::default()
    }

    fn valid_spec() -> TaskSpec {
        TaskSpec::new(
            "https://example.com/form",
            "Fill in the contact form and submit it",
        )
    }

    #[test]
    fn valid_spec_uses_default_timeout() {
        let timeout = valid_spec().validate(&limits()).unwrap();
        assert_eq!(timeout, Duration::from_secs(300));
    }

    #[test]
    fn timeout_bounds_are_inclusive() {
        let l = limits();
        assert!(valid_spec().with_timeout(l.min_timeout).validate(&l).is_ok());
        assert!(valid_spec().with_timeout(l.max_timeout).validate(&l).is_ok());
    }

    #[test]
    fn timeout_outside_bounds_is_rejected() {
        let l = limits();
        for timeout in [Duration::from_secs(29), Duration::from_secs(3601)] {
            let err = valid_spec().with_timeout(timeout).validate(&l).unwrap_err();
            assert!(
                matches!(err, TaskError::Validation { ref field, .. } if field == "timeout"),
                "unexpected error: {err}"
            );
        }
    }

    #[test]
    fn target_must_be_http_url() {
        let l = limits();
        let mut spec = valid_spec();
        spec.target = "not a url".into();
        assert!(spec.validate(&l).is_err());

        spec.target = "ftp://example.com/file".into();
        let err = spec.validate(&l).unwrap_err();
        assert!(err.to_string().contains("unsupported scheme"));
    }

    #[test]
    fn callback_endpoint_is_checked() {
        let l = limits();
        let spec = valid_spec().with_callback("file:///tmp/hook");
        assert!(spec.validate(&l).is_err());
        let spec = valid_spec().with_callback("http://n8n:5678/webhook/task-complete");
        assert!(spec.validate(&l).is_ok());
    }

    #[test]
    fn instruction_length_is_bounded() {
        let l = limits();
        let mut spec = valid_spec();
        spec.instructions = "too short".into();
        assert!(spec.validate(&l).is_err());
        spec.instructions = "x".repeat(MAX_INSTRUCTIONS_LEN + 1);
        assert!(spec.validate(&l).is_err());
        spec.instructions = "x".repeat(MAX_INSTRUCTIONS_LEN);
        assert!(spec.validate(&l).is_ok());
    }

    #[test]
    fn parameters_json_boundary() {
        let params = Parameters::new()
            .with("name", "John Doe")
            .with("age", 42)
            .with("subscribe", true);
        let json = params.to_json().unwrap();
        assert_eq!(json, r#"{"age":42,"name":"John Doe","subscribe":true}"#);
        assert_eq!(Parameters::from_json(&json).unwrap(), params);
        assert!(Parameters::from_json("").unwrap().is_empty());
        assert!(Parameters::from_json("[1,2]").is_err());
    }

    #[test]
    fn spec_deserializes_with_defaults() {
        let spec: TaskSpec = serde_json::from_str(
            r#"{"target":"https://example.com","instructions":"Click the big button","timeout":45}"#,
        )
        .unwrap();
        assert!(spec.parameters.is_empty());
        assert!(spec.callback_endpoint.is_none());
        assert_eq!(spec.timeout, Some(Duration::from_secs(45)));
    }

    #[test]
    fn callback_payload_only_for_terminal_tasks() {
        let now = Utc::now();
        let mut task = Task::queued(valid_spec(), Duration::from_secs(60), now);
        assert!(task.callback_payload().is_none());

        task.status = TaskStatus::TimedOut;
        task.failure_reason = Some("Task exceeded timeout of 60 seconds".into());
        task.completed_at = Some(now);
        let payload = task.callback_payload().unwrap();
        assert_eq!(payload.task_id, task.id);
        assert_eq!(payload.status, TaskStatus::TimedOut);
        assert!(payload.result.is_none());
        assert_eq!(payload.completed_at, now);

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["status"], "timed_out");
        assert!(json["result"].is_null());
        assert_eq!(json["error"], "Task exceeded timeout of 60 seconds");
    }
}
