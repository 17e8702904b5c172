//! Host namespace executor
//!
//! The agent runs in a container; storage tooling must see the host's
//! mount, IPC, network, UTS and PID namespaces, so every command is
//! prefixed with `nsenter` targeting host PID 1.

use async_trait::async_trait;

use super::{ExecParams, ExecResult, Executor};

const NSENTER: &str = "nsenter";
const NSENTER_ARGS: [&str; 8] = ["-t", "1", "-m", "-i", "-n", "-u", "-p", "--"];

/// Wraps another executor and runs commands in the host namespaces
pub struct NsExecutor<E: Executor> {
    inner: E,
}

impl<E: Executor> NsExecutor<E> {
    pub fn new(inner: E) -> Self {
        Self { inner }
    }

    /// Rewrite a command to run through nsenter
    pub fn wrap(params: ExecParams) -> ExecParams {
        let ExecParams { cmd, args, timeout } = params;
        ExecParams::new(NSENTER)
            .args(NSENTER_ARGS)
            .arg(cmd)
            .args(args)
            .timeout(timeout)
    }
}

#[async_trait]
impl<E: Executor> Executor for NsExecutor<E> {
    async fn run(&self, params: ExecParams) -> ExecResult {
        self.inner.run(Self::wrap(params)).await
    }
}
