//! Configuration types.
//!
//! Everything is read from the environment once at startup. Each sub-config
//! has a `Default` matching the documented defaults so tests can build one
//! without touching the process environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Bounds applied to submissions and list queries.
#[derive(Debug, Clone)]
pub struct TaskLimits {
    /// Smallest accepted task timeout.
    pub min_timeout: Duration,
    /// Largest accepted task timeout.
    pub max_timeout: Duration,
    /// Timeout used when a submission does not specify one.
    pub default_timeout: Duration,
    /// Upper clamp for `list` page sizes.
    pub max_list_limit: u32,
}

impl Default for TaskLimits {
    fn default() -> Self {
        Self {
            min_timeout: Duration::from_secs(30),
            max_timeout: Duration::from_secs(3600), // 1 hour
            default_timeout: Duration::from_secs(300), // 5 minutes
            max_list_limit: 100,
        }
    }
}

/// Admission queue and worker settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Submissions are rejected once this many tasks are waiting.
    pub max_queue_size: usize,
    /// How long the worker waits for an id before re-checking for shutdown.
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Callback delivery settings.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Maximum delivery attempts per task.
    pub retry_attempts: u32,
    /// Delay before the second attempt; doubles after every failure.
    pub retry_delay: Duration,
    /// Per-attempt request timeout.
    pub timeout: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_delay: Duration::from_secs(2),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Which executor adapter the binary wires into the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorConfig {
    /// POST each task to a remote executor service.
    Http { url: String },
    /// Run a local program per task (request JSON on stdin).
    Command { program: String, args: Vec<String> },
}

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: PathBuf,
    pub api_host: String,
    pub api_port: u16,
    pub api_key: SecretString,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub limits: TaskLimits,
    pub queue: QueueConfig,
    pub webhook: WebhookConfig,
    pub executor: ExecutorConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("API_SERVER_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("API_SERVER_KEY".into()))?;

        let defaults = TaskLimits::default();
        let limits = TaskLimits {
            min_timeout: Duration::from_secs(env_or(
                "MIN_TASK_TIMEOUT",
                defaults.min_timeout.as_secs(),
            )?),
            max_timeout: Duration::from_secs(env_or(
                "MAX_TASK_TIMEOUT",
                defaults.max_timeout.as_secs(),
            )?),
            default_timeout: Duration::from_secs(env_or(
                "DEFAULT_TASK_TIMEOUT",
                defaults.default_timeout.as_secs(),
            )?),
            max_list_limit: env_or("MAX_LIST_LIMIT", defaults.max_list_limit)?,
        };

        let queue_defaults = QueueConfig::default();
        let queue = QueueConfig {
            max_queue_size: env_or("MAX_QUEUE_SIZE", queue_defaults.max_queue_size)?,
            poll_interval: Duration::from_millis(env_or(
                "WORKER_POLL_INTERVAL_MS",
                queue_defaults.poll_interval.as_millis() as u64,
            )?),
        };

        let webhook_defaults = WebhookConfig::default();
        let webhook = WebhookConfig {
            retry_attempts: env_or("WEBHOOK_RETRY_ATTEMPTS", webhook_defaults.retry_attempts)?,
            retry_delay: Duration::from_secs(env_or(
                "WEBHOOK_RETRY_DELAY",
                webhook_defaults.retry_delay.as_secs(),
            )?),
            timeout: Duration::from_secs(env_or(
                "WEBHOOK_TIMEOUT",
                webhook_defaults.timeout.as_secs(),
            )?),
        };

        let executor = executor_from_env()?;

        let config = Self {
            database_path: std::env::var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/tasks.db")),
            api_host: std::env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            api_port: env_or("API_PORT", 8000)?,
            api_key: SecretString::from(api_key),
            log_dir: std::env::var("LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./logs")),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            limits,
            queue,
            webhook,
            executor,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent settings before anything is started.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits = &self.limits;
        if limits.min_timeout.is_zero() {
            return Err(invalid("MIN_TASK_TIMEOUT", "must be positive"));
        }
        if limits.min_timeout > limits.max_timeout {
            return Err(invalid(
                "MIN_TASK_TIMEOUT",
                format!(
                    "{}s exceeds MAX_TASK_TIMEOUT {}s",
                    limits.min_timeout.as_secs(),
                    limits.max_timeout.as_secs()
                ),
            ));
        }
        if limits.default_timeout < limits.min_timeout || limits.default_timeout > limits.max_timeout
        {
            return Err(invalid(
                "DEFAULT_TASK_TIMEOUT",
                "must lie within [MIN_TASK_TIMEOUT, MAX_TASK_TIMEOUT]",
            ));
        }
        if limits.max_list_limit == 0 {
            return Err(invalid("MAX_LIST_LIMIT", "must be positive"));
        }
        if self.queue.max_queue_size == 0 {
            return Err(invalid("MAX_QUEUE_SIZE", "must be positive"));
        }
        if self.queue.poll_interval.is_zero() {
            return Err(invalid("WORKER_POLL_INTERVAL_MS", "must be positive"));
        }
        if self.webhook.retry_attempts == 0 {
            return Err(invalid("WEBHOOK_RETRY_ATTEMPTS", "must be at least 1"));
        }
        if self.webhook.timeout.is_zero() {
            return Err(invalid("WEBHOOK_TIMEOUT", "must be positive"));
        }
        Ok(())
    }

    /// Address the HTTP adapter binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }
}

fn executor_from_env() -> Result<ExecutorConfig, ConfigError> {
    let url = std::env::var("EXECUTOR_URL").ok().filter(|s| !s.is_empty());
    let command = std::env::var("EXECUTOR_COMMAND").ok().filter(|s| !s.is_empty());

    match (url, command) {
        (Some(url), None) => Ok(ExecutorConfig::Http { url }),
        (None, Some(command)) => {
            let mut parts = command.split_whitespace().map(str::to_string);
            let program = parts
                .next()
                .ok_or_else(|| invalid("EXECUTOR_COMMAND", "is blank"))?;
            Ok(ExecutorConfig::Command {
                program,
                args: parts.collect(),
            })
        }
        (Some(_), Some(_)) => Err(invalid(
            "EXECUTOR_URL",
            "set either EXECUTOR_URL or EXECUTOR_COMMAND, not both",
        )),
        (None, None) => Err(ConfigError::MissingEnvVar(
            "EXECUTOR_URL or EXECUTOR_COMMAND".into(),
        )),
    }
}

/// Parse an optional environment variable, falling back to `default` when unset.
fn env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|e: T::Err| {
            ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }
        }),
        _ => Ok(default),
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}
