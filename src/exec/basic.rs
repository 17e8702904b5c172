//! Direct process executor

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tracing::debug;

use super::{ExecParams, ExecResult, Executor};

/// Runs commands directly in the agent's own namespaces
#[derive(Debug, Clone, Default)]
pub struct BasicExecutor;

impl BasicExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Executor for BasicExecutor {
    async fn run(&self, params: ExecParams) -> ExecResult {
        let started = Instant::now();

        let child = Command::new(&params.cmd)
            .args(&params.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(c) => c,
            Err(e) => {
                debug!("Failed to spawn {}: {}", params, e);
                return ExecResult::spawn_failed(e.to_string());
            }
        };

        // Dropping the wait future on timeout kills the child
        let result = match tokio::time::timeout(params.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => ExecResult::from(output),
            Ok(Err(e)) => ExecResult::spawn_failed(e.to_string()),
            Err(_) => ExecResult::timed_out(params.timeout),
        };

        debug!(
            "Executed {} (exit={}, elapsed={:?})",
            params,
            result.exit_code,
            started.elapsed()
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{ExecFailure, EXIT_CODE_TIMEOUT};
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_captures_output() {
        let exec = BasicExecutor::new();
        let res = exec
            .run(ExecParams::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]))
            .await;
        assert_eq!(res.stdout.trim(), "out");
        assert_eq!(res.stderr.trim(), "err");
        assert_eq!(res.exit_code, 3);
        assert!(res.error.is_none());
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let exec = BasicExecutor::new();
        let res = exec
            .run(ExecParams::new("sleep").arg("5").timeout(Duration::from_millis(100)))
            .await;
        assert_eq!(res.exit_code, EXIT_CODE_TIMEOUT);
        assert!(matches!(res.error, Some(ExecFailure::Timeout(_))));
    }

    #[tokio::test]
    async fn test_run_spawn_failure() {
        let exec = BasicExecutor::new();
        let res = exec.run(ExecParams::new("/nonexistent/binary")).await;
        assert_eq!(res.exit_code, 1);
        assert!(matches!(res.error, Some(ExecFailure::Spawn(_))));
    }
}
