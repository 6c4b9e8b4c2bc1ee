//! Subprocess agent backend.
//!
//! Drives a CLI coding agent in non-interactive mode:
//! `<program> [args…] -p <prompt> --output-format json [--resume <session>]`
//! and parses the single JSON result object it prints.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::process::Command;

use crate::agent::{AgentBackend, AgentRun, ExecuteOptions};
use crate::error::AgentError;

/// Marker the agent prints when it needs an answer from the user.
pub const NEEDS_INPUT_MARKER: &str = "[[NEEDS_INPUT]]";

/// Maximum stderr kept in error messages.
const MAX_STDERR_CHARS: usize = 2000;

/// JSON object printed by the agent CLI.
#[derive(Debug, Deserialize)]
struct CliOutput {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    result: String,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    total_cost_usd: Option<f64>,
    #[serde(default)]
    duration_ms: Option<u64>,
}

/// Agent backend that shells out to a CLI agent.
#[derive(Debug, Clone)]
pub struct CommandAgentBackend {
    program: String,
    args: Vec<String>,
    default_dir: Option<PathBuf>,
}

impl CommandAgentBackend {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            default_dir: None,
        }
    }

    /// Extra arguments placed before the prompt.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Working directory used when the options don't name one.
    pub fn with_default_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.default_dir = dir;
        self
    }

    async fn run(
        &self,
        prompt: &str,
        resume: Option<&str>,
        options: &ExecuteOptions,
    ) -> Result<AgentRun, AgentError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .args(["-p", prompt, "--output-format", "json"]);
        if let Some(session_id) = resume {
            command.args(["--resume", session_id]);
        }
        if let Some(dir) = options.working_dir.as_ref().or(self.default_dir.as_ref()) {
            command.current_dir(dir);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| AgentError::SpawnFailed {
            command: self.program.clone(),
            reason: e.to_string(),
        })?;

        tracing::debug!(
            program = %self.program,
            intent = %options.intent,
            resume = resume.is_some(),
            timeout_secs = options.timeout.as_secs(),
            "Agent process started"
        );

        let started = Instant::now();
        // Dropping the wait future on timeout kills the child.
        let output = tokio::time::timeout(options.timeout, child.wait_with_output())
            .await
            .map_err(|_| AgentError::Timeout {
                timeout: options.timeout,
            })??;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let stdout = String::from_utf8_lossy(&output.stdout);
        match parse_output(&stdout) {
            Some(parsed) => {
                let mut run = parsed.into_run(elapsed_ms);
                run.success &= output.status.success();
                Ok(run)
            }
            None if !output.status.success() => Err(AgentError::ExitStatus {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr)
                    .chars()
                    .take(MAX_STDERR_CHARS)
                    .collect(),
            }),
            None => Err(AgentError::InvalidOutput(
                stdout.chars().take(MAX_STDERR_CHARS).collect(),
            )),
        }
    }
}

impl CliOutput {
    fn into_run(self, elapsed_ms: u64) -> AgentRun {
        let needs_input = self.result.contains(NEEDS_INPUT_MARKER);
        let result_text = if needs_input {
            self.result.replace(NEEDS_INPUT_MARKER, "").trim().to_string()
        } else {
            self.result
        };
        let cost_units = self
            .total_cost_usd
            .and_then(|c| Decimal::try_from(c).ok())
            .map(|c| c.round_dp(6))
            .unwrap_or(Decimal::ZERO);

        AgentRun {
            success: !self.is_error,
            needs_input,
            session_id: self.session_id.filter(|s| !s.is_empty()),
            result_text,
            cost_units,
            duration_ms: self.duration_ms.unwrap_or(elapsed_ms),
        }
    }
}

/// Find the result object in the agent's stdout. Tolerates log lines before it.
fn parse_output(stdout: &str) -> Option<CliOutput> {
    if let Ok(parsed) = serde_json::from_str::<CliOutput>(stdout.trim()) {
        return Some(parsed);
    }
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str::<CliOutput>(line).ok())
}

#[async_trait]
impl AgentBackend for CommandAgentBackend {
    fn name(&self) -> &str {
        &self.program
    }

    async fn execute(&self, prompt: &str, options: &ExecuteOptions) -> Result<AgentRun, AgentError> {
        self.run(prompt, None, options).await
    }

    async fn resume(
        &self,
        session_id: &str,
        prompt: &str,
        options: &ExecuteOptions,
    ) -> Result<AgentRun, AgentError> {
        self.run(prompt, Some(session_id), options).await
    }
}
