//! Conversation resumer — follow-up messages on a thread that already has a task.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::AgentRun;
use crate::channels::{Reaction, truncate};
use crate::error::DatabaseError;
use crate::inbox::{InboxOutcome, clarify};
use crate::tasks::{Task, TaskPatch, TaskStatus};
use crate::worker::executor::{RESULT_MAX_CHARS, reaction_for};
use crate::worker::{QueueScheduler, TaskExecutor};

/// Statuses a follow-up can match. Rejected tasks never match.
pub const FOLLOW_UP_STATUSES: [TaskStatus; 6] = [
    TaskStatus::Pending,
    TaskStatus::Queued,
    TaskStatus::Running,
    TaskStatus::Waiting,
    TaskStatus::Completed,
    TaskStatus::Failed,
];

/// How much of the previous result is quoted in a fresh follow-up prompt.
pub const RESULT_EXCERPT_CHARS: usize = 500;

/// Prompt for a follow-up on a task that has no session to resume.
pub fn follow_up_prompt(task: &Task, message: &str) -> String {
    let excerpt = task
        .result
        .as_deref()
        .filter(|r| !r.trim().is_empty())
        .map(|r| format!("\n\nPrevious result (excerpt):\n{}", truncate(r, RESULT_EXCERPT_CHARS)))
        .unwrap_or_default();
    format!(
        "Original request:\n{}{excerpt}\n\nFollow-up from the user:\n{message}",
        task.original_message
    )
}

pub struct ConversationResumer {
    scheduler: Arc<QueueScheduler>,
    /// Tasks with a follow-up run in flight. At most one per task.
    in_flight: Mutex<HashSet<Uuid>>,
}

impl ConversationResumer {
    pub fn new(scheduler: Arc<QueueScheduler>) -> Self {
        Self {
            scheduler,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn executor(&self) -> &TaskExecutor {
        self.scheduler.executor()
    }

    fn in_flight_set(&self) -> MutexGuard<'_, HashSet<Uuid>> {
        self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark a follow-up as running for `task_id`. `None` if one already is.
    fn begin_follow_up(&self, task_id: Uuid) -> Option<FollowUpGuard<'_>> {
        if !self.in_flight_set().insert(task_id) {
            return None;
        }
        Some(FollowUpGuard {
            resumer: self,
            task_id,
        })
    }

    /// Route a threaded reply to the right path for the thread's latest task.
    pub async fn handle(&self, thread_id: &str, text: &str) -> Result<InboxOutcome, DatabaseError> {
        let Some(task) = self
            .executor()
            .store()
            .latest_for_thread(thread_id, &FOLLOW_UP_STATUSES)
            .await?
        else {
            debug!(thread_id, "Reply on a thread without an active task");
            self.executor()
                .reply(
                    thread_id,
                    "🤷 There's no active task on this thread. Send a new message to start one.",
                )
                .await;
            return Ok(InboxOutcome::Ignored);
        };

        match task.status {
            TaskStatus::Running => {
                self.executor()
                    .reply(
                        thread_id,
                        "⏳ Still working on this one. I'll post the result here when it's done.",
                    )
                    .await;
                Ok(InboxOutcome::InProgress { task_id: task.id })
            }
            TaskStatus::Queued => {
                self.executor()
                    .reply(thread_id, "🕒 This task is queued and will start shortly.")
                    .await;
                Ok(InboxOutcome::StillQueued { task_id: task.id })
            }
            TaskStatus::Pending => clarify(&self.scheduler, &task, text).await,
            status if status.is_resumable() => {
                let Some(_guard) = self.begin_follow_up(task.id) else {
                    self.executor()
                        .reply(
                            thread_id,
                            "⏳ Still working on your last message. I'll reply here when it's done.",
                        )
                        .await;
                    return Ok(InboxOutcome::InProgress { task_id: task.id });
                };
                Ok(self.continue_task(&task, text).await)
            }
            _ => Ok(InboxOutcome::Ignored),
        }
    }

    /// Resume the task's session, or start a fresh run seeded with its history.
    ///
    /// The task's status is left as it was. Only the session handle is
    /// persisted, and only when the backend hands back a new one.
    async fn continue_task(&self, task: &Task, text: &str) -> InboxOutcome {
        let executor = self.executor();
        executor.react(&task.thread_id, Reaction::Working).await;

        let options = executor.options_for(task);
        let outcome = match task.session_id.as_deref() {
            Some(session_id) => {
                info!(task_id = %task.id, session_id, "Resuming session");
                executor.invoke(Some(session_id), text, &options).await
            }
            None => {
                info!(task_id = %task.id, "No session to resume, starting fresh run");
                executor
                    .invoke(None, &follow_up_prompt(task, text), &options)
                    .await
            }
        };

        let run = match outcome {
            Ok(run) => run,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Follow-up failed");
                executor.react(&task.thread_id, Reaction::Failed).await;
                executor
                    .reply(
                        &task.thread_id,
                        &format!("⚠️ Couldn't continue this task: {}", truncate(&e.to_string(), 500)),
                    )
                    .await;
                return InboxOutcome::ResumeFailed {
                    task_id: task.id,
                    error: e.to_string(),
                };
            }
        };

        if self.was_rejected(task).await {
            info!(task_id = %task.id, "Task rejected during follow-up, discarding result");
            return InboxOutcome::Discarded { task_id: task.id };
        }

        self.persist_session(task, &run).await;

        executor
            .react(&task.thread_id, reaction_for(run.outcome_status()))
            .await;
        if !run.result_text.trim().is_empty() {
            executor
                .reply(&task.thread_id, &truncate(&run.result_text, RESULT_MAX_CHARS))
                .await;
        }

        InboxOutcome::Resumed {
            task_id: task.id,
            session_id: run.session_id,
            success: run.success,
        }
    }

    async fn was_rejected(&self, task: &Task) -> bool {
        match self.executor().store().get(task.id).await {
            Ok(Some(current)) => current.status == TaskStatus::Rejected,
            Ok(None) => false,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Could not re-read task after follow-up");
                false
            }
        }
    }

    async fn persist_session(&self, task: &Task, run: &AgentRun) {
        let Some(new_session) = run.session_id.as_deref() else {
            return;
        };
        if task.session_id.as_deref() == Some(new_session) {
            return;
        }
        let patch = TaskPatch::new().session_id(new_session);
        match self.executor().store().update(task.id, patch).await {
            Ok(()) => info!(task_id = %task.id, session_id = new_session, "Stored new session"),
            Err(e) => warn!(task_id = %task.id, error = %e, "Failed to store new session"),
        }
    }
}

/// Clears a task's in-flight follow-up mark when the run ends.
struct FollowUpGuard<'a> {
    resumer: &'a ConversationResumer,
    task_id: Uuid,
}

impl Drop for FollowUpGuard<'_> {
    fn drop(&mut self) {
        self.resumer.in_flight_set().remove(&self.task_id);
    }
}
