use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use tokio::process::Command;

use crate::jobs::{Job, ReplyPayload};

/// Runs the built-in commands an agent understands.
///
/// | command                 | behaviour                                  |
/// |-------------------------|--------------------------------------------|
/// | `test.ping`             | replies `true`                             |
/// | `test.echo`, `echo`     | replies with the arguments joined by space |
/// | `test.sleep`, `sleep`   | sleeps `arguments[0]` seconds              |
/// | `cmd.run`               | `sh -c <arguments>` (needs `allow_shell`)  |
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    allow_shell: bool,
}

impl CommandExecutor {
    pub fn new(allow_shell: bool) -> Self {
        Self { allow_shell }
    }

    pub async fn execute(&self, job: &Job) -> ReplyPayload {
        tracing::info!(job_id = %job.id, command = %job.command, "Executing job");

        let payload = match job.command.as_str() {
            "test.ping" => ReplyPayload::Success("true".to_string()),
            "test.echo" | "echo" => ReplyPayload::Success(job.arguments.join(" ")),
            "test.sleep" | "sleep" => Self::sleep(&job.arguments).await,
            "cmd.run" if self.allow_shell => {
                let timeout = job.remaining(Utc::now());
                Self::run_shell(&job.arguments.join(" "), timeout).await
            }
            "cmd.run" => ReplyPayload::Failure("shell execution is disabled".to_string()),
            other => ReplyPayload::Failure(format!("unknown command: {}", other)),
        };

        match &payload {
            ReplyPayload::Success(_) => {
                tracing::info!(job_id = %job.id, "Job succeeded");
            }
            ReplyPayload::Failure(msg) => {
                tracing::info!(job_id = %job.id, error = %msg, "Job failed");
            }
        }
        payload
    }

    async fn sleep(arguments: &[String]) -> ReplyPayload {
        let Some(raw) = arguments.first() else {
            return ReplyPayload::Failure("sleep requires a duration in seconds".to_string());
        };
        match raw.parse::<f64>().map(Duration::try_from_secs_f64) {
            Ok(Ok(duration)) => {
                tokio::time::sleep(duration).await;
                ReplyPayload::Success(raw.clone())
            }
            _ => ReplyPayload::Failure(format!("invalid sleep duration: {}", raw)),
        }
    }

    async fn run_shell(command: &str, timeout: Duration) -> ReplyPayload {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(timeout, child).await {
            Ok(result) => Self::process_output(result),
            Err(_) => ReplyPayload::Failure("command exceeded job deadline".to_string()),
        }
    }

    fn process_output(result: std::io::Result<std::process::Output>) -> ReplyPayload {
        match result {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();

                if output.status.success() {
                    ReplyPayload::Success(stdout)
                } else if stderr.is_empty() {
                    ReplyPayload::Failure(format!("Exit code: {:?}", output.status.code()))
                } else {
                    ReplyPayload::Failure(stderr)
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to spawn shell");
                ReplyPayload::Failure(e.to_string())
            }
        }
    }
}
