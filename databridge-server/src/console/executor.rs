//! Injected command execution strategy
//!
//! The console extension never knows how commands run; it is handed a
//! [`CommandExecutor`] at construction time and forwards command lines to
//! it. Execution failures are caught by the caller and surfaced inside the
//! `COMMAND.RESULT` payload, never as a protocol fault.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::debug;

/// Error raised inside a command executor
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("command failed: {0}")]
    Failed(String),
}

pub type ExecuteResult<T> = std::result::Result<T, ExecuteError>;

/// Output of one command execution
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    /// Result value returned to the requesting client
    pub result: Value,
    /// Log lines collected while the command ran
    pub log: Vec<String>,
}

impl CommandOutcome {
    pub fn new(result: Value) -> Self {
        Self {
            result,
            log: Vec::new(),
        }
    }

    pub fn with_log(mut self, log: Vec<String>) -> Self {
        self.log = log;
        self
    }
}

/// Capability to execute a console command line
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command_line: &str) -> ExecuteResult<CommandOutcome>;
}

/// Default executor: runs the command line through the system shell
///
/// stdout becomes the result value; stderr lines become the log.
pub struct ShellExecutor;

impl ShellExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(&self, command_line: &str) -> ExecuteResult<CommandOutcome> {
        debug!("Executing shell command: {}", command_line);

        let output = Command::new("sh")
            .arg("-c")
            .arg(command_line)
            .output()
            .await
            .map_err(|e| ExecuteError::Failed(format!("spawn failed: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let log: Vec<String> = String::from_utf8_lossy(&output.stderr)
            .lines()
            .map(String::from)
            .collect();

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            return Err(ExecuteError::Failed(format!(
                "exit code {}: {}",
                code,
                stdout.trim_end()
            )));
        }

        Ok(CommandOutcome::new(json!(stdout.trim_end())).with_log(log))
    }
}
