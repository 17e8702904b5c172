//! Command Execution
//!
//! Every host mutation in the engine goes through an [`Executor`]: LVM,
//! DRBD, cryptsetup, smartctl and mount tooling are all invoked as child
//! processes with a bounded timeout and fully captured output.
//!
//! A non-zero exit status is not an error at this layer; callers decide
//! whether the output means success (e.g. "already exists").

pub mod basic;
pub mod nsenter;

#[cfg(test)]
pub mod mock;

pub use basic::BasicExecutor;
pub use nsenter::NsExecutor;

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

/// Default command timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Exit code reported when a command hit its timeout
pub const EXIT_CODE_TIMEOUT: i32 = 124;

/// Exit code reported when no OS exit status is available
pub const EXIT_CODE_UNKNOWN: i32 = 1;

// =============================================================================
// Parameters & Results
// =============================================================================

/// A command to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecParams {
    pub cmd: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl ExecParams {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Full command line, used in logs and errors
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.cmd.clone()
        } else {
            format!("{} {}", self.cmd, self.args.join(" "))
        }
    }
}

impl fmt::Display for ExecParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.command_line())
    }
}

/// Why a command produced no usable exit status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecFailure {
    Timeout(Duration),
    Spawn(String),
}

/// Outcome of a command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub error: Option<ExecFailure>,
}

impl ExecResult {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stderr: stderr.into(),
            exit_code,
            ..Default::default()
        }
    }

    pub fn timed_out(timeout: Duration) -> Self {
        Self {
            exit_code: EXIT_CODE_TIMEOUT,
            error: Some(ExecFailure::Timeout(timeout)),
            ..Default::default()
        }
    }

    pub fn spawn_failed(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            stderr: reason.clone(),
            exit_code: EXIT_CODE_UNKNOWN,
            error: Some(ExecFailure::Spawn(reason)),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.exit_code == 0
    }

    /// Convert a failed outcome into the matching engine error
    pub fn check(self, command: &str) -> Result<ExecResult> {
        match &self.error {
            Some(ExecFailure::Timeout(t)) => Err(Error::CommandTimeout {
                command: command.to_string(),
                timeout_secs: t.as_secs(),
            }),
            Some(ExecFailure::Spawn(reason)) => Err(Error::CommandSpawn {
                command: command.to_string(),
                reason: reason.clone(),
            }),
            None if self.exit_code != 0 => Err(Error::CommandFailed {
                command: command.to_string(),
                exit_code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            }),
            None => Ok(self),
        }
    }
}

impl From<std::process::Output> for ExecResult {
    fn from(output: std::process::Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(EXIT_CODE_UNKNOWN),
            error: None,
        }
    }
}

// =============================================================================
// Executor Trait
// =============================================================================

/// Runs external commands
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run a command to completion or timeout
    async fn run(&self, params: ExecParams) -> ExecResult;

    /// Run a command and treat any failure as an error
    async fn run_checked(&self, params: ExecParams) -> Result<ExecResult> {
        let command = params.command_line();
        self.run(params).await.check(&command)
    }
}

#[async_trait]
impl<T: Executor + ?Sized> Executor for std::sync::Arc<T> {
    async fn run(&self, params: ExecParams) -> ExecResult {
        (**self).run(params).await
    }
}
