//! `sh>` operator: runs a shell command.
//!
//! The command runs under `sh -c` with scalar session and task parameters
//! exported as environment variables, plus the entries of `_env`. A non-zero
//! exit fails the task with the tail of stderr in the message.

use std::process::Stdio;

use serde_json::Value;
use taskflow_core::workflow::operator::{Operator, OperatorOutcome, TaskFailure, TaskResult, command};
use taskflow_types::task::Action;
use tokio::process::Command;

/// Bytes of stderr kept in the failure message.
const STDERR_TAIL_BYTES: usize = 2048;

pub struct ShOperator {
    shell: String,
}

impl ShOperator {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }

    fn build_command(&self, script: &str, action: &Action) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in action.params.iter() {
            if let Some(value) = env_value(value) {
                if is_env_name(key) {
                    cmd.env(key, value);
                }
            }
        }
        if let Ok(env) = action.config.get_nested_or_empty("_env") {
            for (key, value) in env.iter() {
                if let Some(value) = env_value(value) {
                    cmd.env(key, value);
                }
            }
        }
        cmd
    }
}

impl Default for ShOperator {
    fn default() -> Self {
        Self::new()
    }
}

fn env_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn is_env_name(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn tail(bytes: &[u8]) -> String {
    let start = bytes.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&bytes[start..]).trim().to_string()
}

impl Operator for ShOperator {
    fn name(&self) -> &str {
        "sh"
    }

    async fn run(&self, action: &Action) -> OperatorOutcome {
        let script = match command(action, "sh") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => {
                return OperatorOutcome::Failed(TaskFailure::new(format!(
                    "{}: sh> requires a command",
                    action.full_name
                )));
            }
        };

        tracing::debug!(task = %action.full_name, task_id = action.task_id, command = %script, "running shell command");
        let output = match self.build_command(&script, action).output().await {
            Ok(output) => output,
            Err(e) => {
                return OperatorOutcome::Failed(TaskFailure::new(format!(
                    "{}: failed to start {}: {e}",
                    action.full_name, self.shell
                )));
            }
        };

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            tracing::info!(task = %action.full_name, "{line}");
        }

        if output.status.success() {
            return OperatorOutcome::Succeeded(TaskResult::empty());
        }
        let code = output
            .status
            .code()
            .map_or_else(|| "a signal".to_string(), |c| c.to_string());
        let stderr = tail(&output.stderr);
        let message = if stderr.is_empty() {
            format!("Command failed with code {code}")
        } else {
            format!("Command failed with code {code}: {stderr}")
        };
        OperatorOutcome::Failed(TaskFailure::new(message))
    }
}
