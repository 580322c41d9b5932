//! Subprocess executor.
//!
//! Spawns the configured program once per task, writes the request JSON on
//! stdin and takes trimmed stdout as the result.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{ExecutionRequest, Executor};
use crate::error::ExecutionError;

/// Maximum result size before truncation (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// Runs a local program per task.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    fn name(&self) -> &str {
        "command"
    }

    async fn run(&self, request: ExecutionRequest) -> Result<String, ExecutionError> {
        let payload = serde_json::to_vec(&request)
            .map_err(|e| ExecutionError::Failed(format!("Failed to encode request: {e}")))?;
        let timeout = request.timeout();

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            ExecutionError::Failed(format!("Failed to spawn {}: {e}", self.program))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A program that ignores stdin may exit before reading it.
            if let Err(e) = stdin.write_all(&payload).await {
                debug!(task_id = %request.task_id, "Executor stdin closed early: {e}");
            }
        }

        // Dropping the future on timeout drops the child, which kills it.
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| ExecutionError::TimedOut(timeout))?
            .map_err(|e| ExecutionError::Failed(format!("Command execution failed: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            return Err(ExecutionError::Failed(format!(
                "{} exited with {code}: {}",
                self.program,
                truncate_output(stderr.trim())
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(truncate_output(stdout.trim()))
    }
}

/// Truncate output to MAX_OUTPUT_SIZE on a char boundary.
fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        return s.to_string();
    }
    let mut end = MAX_OUTPUT_SIZE;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... (truncated)", &s[..end])
}
