//! Agent backend — the external runtime that actually performs a task.
//!
//! The engine only needs two calls: a fresh `execute` and a `resume` of a
//! prior session. Timeouts are enforced inside the backend.

pub mod command;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AgentError;
use crate::tasks::model::TaskStatus;

pub use command::CommandAgentBackend;

/// Options for a single agent invocation.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Task being executed, if any (absent for ad-hoc follow-up runs).
    pub task_id: Option<Uuid>,
    /// Opaque intent tag passed through from classification.
    pub intent: String,
    pub timeout: Duration,
    pub working_dir: Option<PathBuf>,
}

impl ExecuteOptions {
    pub fn new(intent: impl Into<String>, timeout: Duration) -> Self {
        Self {
            task_id: None,
            intent: intent.into(),
            timeout,
            working_dir: None,
        }
    }

    pub fn with_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }
}

/// Outcome of one agent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRun {
    pub success: bool,
    /// The agent stopped to ask the user something.
    pub needs_input: bool,
    pub session_id: Option<String>,
    pub result_text: String,
    pub cost_units: Decimal,
    pub duration_ms: u64,
}

impl AgentRun {
    /// Status the task moves to after this run.
    pub fn outcome_status(&self) -> TaskStatus {
        if self.needs_input {
            TaskStatus::Waiting
        } else if self.success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        }
    }
}

/// An AI agent runtime that can execute prompts and resume sessions.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Start a fresh run.
    async fn execute(&self, prompt: &str, options: &ExecuteOptions) -> Result<AgentRun, AgentError>;

    /// Continue an earlier run. The backend may start a new session internally,
    /// in which case the returned `session_id` differs from the one passed in.
    async fn resume(
        &self,
        session_id: &str,
        prompt: &str,
        options: &ExecuteOptions,
    ) -> Result<AgentRun, AgentError>;
}
