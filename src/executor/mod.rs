//! Executor capability: performs the automation work for one task.
//!
//! The worker only knows this trait. Two adapters ship with the binary:
//! a local subprocess and a remote HTTP service.

pub mod command;
pub mod http;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ExecutorConfig;
use crate::error::ExecutionError;
use crate::tasks::{Parameters, Task, TaskId};

pub use command::CommandExecutor;
pub use http::HttpExecutor;

/// Everything an executor needs to run one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub task_id: TaskId,
    pub target: String,
    pub instructions: String,
    pub parameters: Parameters,
    /// Seconds the worker will wait before giving up.
    pub timeout: u64,
}

impl ExecutionRequest {
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id,
            target: task.target.clone(),
            instructions: task.instructions.clone(),
            parameters: task.parameters.clone(),
            timeout: task.timeout.as_secs(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// Runs a task and returns its result text.
///
/// Implementations may be cancelled at any await point when the worker's
/// timeout fires; they must not leave external resources running.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Adapter name for logs.
    fn name(&self) -> &str;

    async fn run(&self, request: ExecutionRequest) -> Result<String, ExecutionError>;
}

/// Build the adapter selected by configuration.
pub fn from_config(config: &ExecutorConfig) -> Result<Arc<dyn Executor>, ExecutionError> {
    match config {
        ExecutorConfig::Http { url } => Ok(Arc::new(HttpExecutor::new(url.clone())?)),
        ExecutorConfig::Command { program, args } => {
            Ok(Arc::new(CommandExecutor::new(program.clone(), args.clone())))
        }
    }
}
