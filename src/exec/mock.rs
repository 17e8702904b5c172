//! Scripted executor for tests

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{ExecParams, ExecResult, Executor};

struct Rule {
    prefix: String,
    result: ExecResult,
    once: bool,
}

/// Records every command and answers from scripted rules.
///
/// Rules match on a command-line prefix. One-shot rules are consumed in
/// registration order before persistent ones; among persistent rules the
/// most recently added wins. Unmatched commands succeed with empty output.
#[derive(Default)]
pub struct MockExecutor {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<ExecParams>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every matching command with `result`
    pub fn on(&self, prefix: &str, result: ExecResult) -> &Self {
        self.rules.lock().push(Rule {
            prefix: prefix.to_string(),
            result,
            once: false,
        });
        self
    }

    /// Answer the next matching command with `result`
    pub fn once(&self, prefix: &str, result: ExecResult) -> &Self {
        self.rules.lock().push(Rule {
            prefix: prefix.to_string(),
            result,
            once: true,
        });
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().iter().map(|p| p.command_line()).collect()
    }

    pub fn params(&self) -> Vec<ExecParams> {
        self.calls.lock().clone()
    }

    /// Whether any recorded command starts with `prefix`
    pub fn called(&self, prefix: &str) -> bool {
        self.calls().iter().any(|c| c.starts_with(prefix))
    }

    fn answer(&self, line: &str) -> ExecResult {
        let mut rules = self.rules.lock();
        if let Some(idx) = rules
            .iter()
            .position(|r| r.once && line.starts_with(&r.prefix))
        {
            return rules.remove(idx).result;
        }
        rules
            .iter()
            .rev()
            .find(|r| !r.once && line.starts_with(&r.prefix))
            .map(|r| r.result.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn run(&self, params: ExecParams) -> ExecResult {
        let line = params.command_line();
        self.calls.lock().push(params);
        self.answer(&line)
    }
}
