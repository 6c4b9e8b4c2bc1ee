//! Inbox — routes inbound surface events into the task queue.
//!
//! Top-level messages become tasks. Threaded replies go to the
//! [`ConversationResumer`]. Rejection gestures end a task that has not
//! started running.

pub mod resume;

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channels::{InboundEvent, InboundMessage, Reaction};
use crate::classifier::Classifier;
use crate::error::{DatabaseError, Error, TaskError};
use crate::tasks::{Task, TaskEvent, TaskPatch, TaskStatus, append_clarification};
use crate::worker::{QueueScheduler, TaskExecutor};

pub use resume::ConversationResumer;

/// What handling an inbound event did.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InboxOutcome {
    /// A new task was created.
    Created { task: Box<Task> },
    /// A clarification reply was appended and the task queued.
    Clarified { task_id: Uuid },
    /// The thread's task is executing; the user was asked to wait.
    InProgress { task_id: Uuid },
    /// The thread's task is queued and has not started yet.
    StillQueued { task_id: Uuid },
    /// A follow-up run finished.
    Resumed {
        task_id: Uuid,
        session_id: Option<String>,
        success: bool,
    },
    /// A follow-up run failed; the user was told.
    ResumeFailed { task_id: Uuid, error: String },
    /// The task was rejected while a follow-up was in flight; its result was dropped.
    Discarded { task_id: Uuid },
    Rejected { task_id: Uuid },
    /// Nothing to act on.
    Ignored,
}

/// Entry point for inbound events.
pub struct Inbox {
    classifier: Arc<dyn Classifier>,
    scheduler: Arc<QueueScheduler>,
    resumer: ConversationResumer,
}

impl Inbox {
    pub fn new(classifier: Arc<dyn Classifier>, scheduler: Arc<QueueScheduler>) -> Self {
        Self {
            classifier,
            resumer: ConversationResumer::new(Arc::clone(&scheduler)),
            scheduler,
        }
    }

    fn executor(&self) -> &TaskExecutor {
        self.scheduler.executor()
    }

    /// Handle an event, reporting failures on the thread instead of returning them.
    pub async fn dispatch(&self, event: InboundEvent) -> InboxOutcome {
        let thread_id = match &event {
            InboundEvent::Message(msg) => msg.thread_id.clone(),
            InboundEvent::Rejection { thread_id } => thread_id.clone(),
        };
        match self.handle(event).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(thread_id = %thread_id, error = %e, "Failed to handle inbound event");
                self.executor()
                    .reply(&thread_id, &format!("⚠️ Something went wrong: {e}"))
                    .await;
                InboxOutcome::Ignored
            }
        }
    }

    pub async fn handle(&self, event: InboundEvent) -> Result<InboxOutcome, Error> {
        match event {
            InboundEvent::Message(msg) if msg.is_reply => {
                Ok(self.resumer.handle(&msg.thread_id, &msg.text).await?)
            }
            InboundEvent::Message(msg) => {
                let task = self.ingest(msg).await?;
                Ok(InboxOutcome::Created {
                    task: Box::new(task),
                })
            }
            InboundEvent::Rejection { thread_id } => Ok(self.reject_thread(&thread_id).await?),
        }
    }

    /// Classify a new message and store it as a task.
    pub async fn ingest(&self, msg: InboundMessage) -> Result<Task, DatabaseError> {
        let classification = self.classifier.classify(&msg.text).await;
        let task = Task::new(&msg.thread_id, &msg.text, classification)
            .with_attachments(msg.attachments);

        self.executor().store().insert(&task).await?;
        info!(
            task_id = %task.id,
            thread_id = %task.thread_id,
            intent = %task.intent,
            status = %task.status,
            "Task created"
        );

        self.executor().react(&task.thread_id, Reaction::Accepted).await;
        match task.clarify_question.as_deref() {
            Some(question) if task.status == TaskStatus::Pending => {
                self.executor().reply(&task.thread_id, question).await;
                self.executor().emit(TaskEvent::Pending {
                    task_id: task.id,
                    question: question.to_string(),
                });
            }
            _ => {
                self.executor().emit(TaskEvent::Queued { task_id: task.id });
                self.scheduler.trigger();
            }
        }
        Ok(task)
    }

    /// Reject the most recent task on a thread.
    pub async fn reject_thread(&self, thread_id: &str) -> Result<InboxOutcome, DatabaseError> {
        let store = self.executor().store();
        let Some(task) = store
            .latest_for_thread(thread_id, &resume::FOLLOW_UP_STATUSES)
            .await?
        else {
            debug!(thread_id, "Rejection for thread without a task");
            return Ok(InboxOutcome::Ignored);
        };
        reject(self.executor(), &task).await
    }

    /// Reject a task by id.
    pub async fn reject_task(&self, id: Uuid) -> Result<InboxOutcome, Error> {
        let task = self
            .executor()
            .store()
            .get(id)
            .await?
            .ok_or(TaskError::NotFound { id })?;
        if !task.status.can_transition_to(TaskStatus::Rejected) {
            return Err(TaskError::InvalidTransition {
                id,
                from: task.status,
                to: TaskStatus::Rejected,
            }
            .into());
        }
        Ok(reject(self.executor(), &task).await?)
    }
}

/// Move a task to `rejected` from whichever rejectable status it holds.
///
/// Each attempt is a claim, so a task the scheduler is claiming at the same
/// moment is either rejected or running, never both.
async fn reject(executor: &TaskExecutor, task: &Task) -> Result<InboxOutcome, DatabaseError> {
    for from in TaskStatus::REJECTABLE {
        let patch = TaskPatch::new().completed_at(Some(Utc::now()));
        if executor
            .store()
            .claim(task.id, from, TaskStatus::Rejected, patch)
            .await?
        {
            info!(task_id = %task.id, from = %from, "Task rejected");
            executor.react(&task.thread_id, Reaction::Rejected).await;
            executor.emit(TaskEvent::Rejected { task_id: task.id });
            return Ok(InboxOutcome::Rejected { task_id: task.id });
        }
    }
    debug!(task_id = %task.id, status = %task.status, "Rejection ignored");
    Ok(InboxOutcome::Ignored)
}

/// Append a clarification reply to a pending task and queue it.
///
/// The `pending -> queued` claim makes this happen at most once; a reply to a
/// task that is already queued appends nothing.
async fn clarify(
    scheduler: &QueueScheduler,
    task: &Task,
    reply: &str,
) -> Result<InboxOutcome, DatabaseError> {
    let executor = scheduler.executor();
    let prompt = append_clarification(&task.execution_prompt, reply);
    let claimed = executor
        .store()
        .claim(
            task.id,
            TaskStatus::Pending,
            TaskStatus::Queued,
            TaskPatch::new().execution_prompt(prompt),
        )
        .await?;
    if !claimed {
        debug!(task_id = %task.id, "Task left pending before clarification applied");
        return Ok(InboxOutcome::Ignored);
    }

    info!(task_id = %task.id, "Clarification received, task queued");
    executor.emit(TaskEvent::Queued { task_id: task.id });
    scheduler.trigger();
    Ok(InboxOutcome::Clarified { task_id: task.id })
}
