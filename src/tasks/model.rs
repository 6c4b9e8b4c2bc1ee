//! Task data model — the persistent unit of work and its state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Separator placed between the execution prompt and a clarification reply.
pub const CLARIFY_SEPARATOR: &str = "\n\n補足: ";

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Classified, but waiting on a clarification answer.
    Pending,
    /// Ready to be claimed by the scheduler.
    Queued,
    /// Claimed and executing.
    Running,
    /// Execution stopped to ask for more input. Can still receive follow-ups.
    Waiting,
    Completed,
    Failed,
    /// Explicitly rejected by the user. Nothing leaves this state.
    Rejected,
}

impl TaskStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [TaskStatus; 7] = [
        Self::Pending,
        Self::Queued,
        Self::Running,
        Self::Waiting,
        Self::Completed,
        Self::Failed,
        Self::Rejected,
    ];

    /// Statuses a rejection signal applies to.
    pub const REJECTABLE: [TaskStatus; 3] = [Self::Pending, Self::Queued, Self::Waiting];

    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            // Clarification answered / rejected before it was ever queued
            (Pending, Queued) | (Pending, Rejected) |
            // Claim or rejection before claim
            (Queued, Running) | (Queued, Rejected) |
            // Execution outcomes, plus crash recovery back to the queue
            (Running, Completed) | (Running, Waiting) | (Running, Failed) | (Running, Queued) |
            (Waiting, Rejected)
        )
    }

    /// Terminal states never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Rejected)
    }

    /// States in which a task is finished with execution but can still be
    /// continued conversationally.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Waiting)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown task status: {s}"))
    }
}

/// Output of the upstream classifier. `intent` and `autonomy_level` are opaque here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub intent: String,
    pub autonomy_level: String,
    pub summary: String,
    pub execution_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarify_question: Option<String>,
}

/// A task as persisted in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    /// Messaging thread the task was created from.
    pub thread_id: String,
    pub intent: String,
    pub autonomy_level: String,
    pub summary: String,
    pub original_message: String,
    pub execution_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarify_question: Option<String>,
    pub status: TaskStatus,
    /// Agent continuation handle. Once set it is only ever replaced, never cleared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_units: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Build a new task from a classified message.
    ///
    /// Starts `pending` when the classifier asked a clarifying question,
    /// otherwise `queued`.
    pub fn new(
        thread_id: impl Into<String>,
        original_message: impl Into<String>,
        classification: Classification,
    ) -> Self {
        let now = Utc::now();
        let status = if classification.clarify_question.is_some() {
            TaskStatus::Pending
        } else {
            TaskStatus::Queued
        };
        Self {
            id: Uuid::new_v4(),
            thread_id: thread_id.into(),
            intent: classification.intent,
            autonomy_level: classification.autonomy_level,
            summary: classification.summary,
            original_message: original_message.into(),
            execution_prompt: classification.execution_prompt,
            clarify_question: classification.clarify_question,
            status,
            session_id: None,
            result: None,
            cost_units: None,
            attachments: Vec::new(),
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Builder: attach file paths received with the message.
    pub fn with_attachments(mut self, attachments: Vec<String>) -> Self {
        self.attachments = attachments;
        self
    }

    /// Builder: override the creation time.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.updated_at = created_at;
        self
    }

    /// The prompt handed to the agent backend, with attachments listed.
    pub fn prompt_for_agent(&self) -> String {
        if self.attachments.is_empty() {
            return self.execution_prompt.clone();
        }
        let mut prompt = self.execution_prompt.clone();
        prompt.push_str("\n\nAttached files:");
        for path in &self.attachments {
            prompt.push_str("\n- ");
            prompt.push_str(path);
        }
        prompt
    }
}

/// Append a clarification reply to an execution prompt.
pub fn append_clarification(prompt: &str, reply: &str) -> String {
    format!("{prompt}{CLARIFY_SEPARATOR}{reply}")
}

/// A partial update to a task row.
///
/// `session_id` can be replaced but never cleared.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub execution_prompt: Option<String>,
    pub session_id: Option<String>,
    pub result: Option<String>,
    pub cost_units: Option<Decimal>,
    /// `Some(None)` clears the column.
    pub started_at: Option<Option<DateTime<Utc>>>,
    /// `Some(None)` clears the column.
    pub completed_at: Option<Option<DateTime<Utc>>>,
}

impl TaskPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn execution_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.execution_prompt = Some(prompt.into());
        self
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    pub fn cost_units(mut self, cost: Decimal) -> Self {
        self.cost_units = Some(cost);
        self
    }

    pub fn started_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn completed_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
