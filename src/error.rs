//! Error types for the task relay.

use std::time::Duration;

use uuid::Uuid;

use crate::tasks::TaskStatus;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors raised by task submission and lifecycle bookkeeping.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Invalid task: {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Task {id} is {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: TaskStatus,
        target: String,
    },

    #[error("Queue is full ({max} tasks waiting)")]
    QueueFull { max: usize },

    #[error("Task queue is not accepting submissions")]
    QueueClosed,

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl TaskError {
    pub(crate) fn validation(field: &str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Executor failures. Both variants end the task; neither stops the worker.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("{0}")]
    Failed(String),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

/// A single failed webhook attempt.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("request to {endpoint} failed: {reason}")]
    Transport { endpoint: String, reason: String },

    #[error("{endpoint} responded with HTTP {status}")]
    Status { endpoint: String, status: u16 },
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
