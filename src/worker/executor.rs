//! Task executor — runs one claimed task through the agent backend and turns
//! the outcome into a status write plus thread notifications.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::agent::{AgentBackend, AgentRun, ExecuteOptions};
use crate::artifacts::{ArtifactSnapshot, ArtifactSurface};
use crate::channels::{MessagingSurface, Reaction, truncate};
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::store::TaskStore;
use crate::tasks::{Task, TaskEvent, TaskPatch, TaskStatus};

/// Longest result text posted to a thread.
pub const RESULT_MAX_CHARS: usize = 3000;

/// Slack on top of the backend's own timeout before the executor gives up on it.
const TIMEOUT_GRACE: Duration = Duration::from_secs(30);

/// Reaction shown for a task status.
pub fn reaction_for(status: TaskStatus) -> Reaction {
    match status {
        TaskStatus::Pending | TaskStatus::Queued => Reaction::Accepted,
        TaskStatus::Running => Reaction::Working,
        TaskStatus::Completed => Reaction::Completed,
        TaskStatus::Waiting => Reaction::Waiting,
        TaskStatus::Failed => Reaction::Failed,
        TaskStatus::Rejected => Reaction::Rejected,
    }
}

/// Shared dependencies for running tasks.
pub struct TaskExecutor {
    store: Arc<dyn TaskStore>,
    backend: Arc<dyn AgentBackend>,
    surface: Arc<dyn MessagingSurface>,
    artifacts: Option<Arc<dyn ArtifactSurface>>,
    config: AgentConfig,
    events: broadcast::Sender<TaskEvent>,
}

impl TaskExecutor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        backend: Arc<dyn AgentBackend>,
        surface: Arc<dyn MessagingSurface>,
        config: AgentConfig,
        events: broadcast::Sender<TaskEvent>,
    ) -> Self {
        Self {
            store,
            backend,
            surface,
            artifacts: None,
            config,
            events,
        }
    }

    /// Enable before/after artifact detection.
    pub fn with_artifacts(mut self, artifacts: Arc<dyn ArtifactSurface>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn events(&self) -> &broadcast::Sender<TaskEvent> {
        &self.events
    }

    /// Backend options for a task: intent-specific timeout and working dir.
    ///
    /// With artifact detection on, the task's own artifact directory is the
    /// working dir, so concurrent runs never see each other's output.
    pub fn options_for(&self, task: &Task) -> ExecuteOptions {
        let working_dir = match &self.artifacts {
            Some(artifacts) => Some(artifacts.task_dir(task.id)),
            None => self.config.working_dir.clone(),
        };
        ExecuteOptions::new(&task.intent, self.config.timeout_for(&task.intent))
            .with_task(task.id)
            .with_working_dir(working_dir)
    }

    /// Run a task that has already been claimed into `running`.
    ///
    /// Never fails: execution faults end in `failed` plus a notice on the
    /// thread. Returns the status the task was moved to.
    pub async fn run(&self, task: Task) -> TaskStatus {
        info!(task_id = %task.id, intent = %task.intent, "Executing task");
        self.react(&task.thread_id, Reaction::Working).await;
        self.emit(TaskEvent::Started { task_id: task.id });

        let before = self.snapshot(&task).await;
        let options = self.options_for(&task);

        match self.invoke(None, &task.prompt_for_agent(), &options).await {
            Ok(run) => self.finish(&task, run, before).await,
            Err(e) => self.fail(&task, &e.to_string()).await,
        }
    }

    /// Call the backend: `resume` when a session is given, else `execute`.
    ///
    /// Bounded by the option timeout plus a grace period in case the
    /// backend does not enforce its own.
    pub async fn invoke(
        &self,
        session_id: Option<&str>,
        prompt: &str,
        options: &ExecuteOptions,
    ) -> Result<AgentRun, AgentError> {
        let call = async {
            match session_id {
                Some(session_id) => self.backend.resume(session_id, prompt, options).await,
                None => self.backend.execute(prompt, options).await,
            }
        };
        match tokio::time::timeout(options.timeout + TIMEOUT_GRACE, call).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout {
                timeout: options.timeout,
            }),
        }
    }

    async fn finish(&self, task: &Task, run: AgentRun, before: Option<ArtifactSnapshot>) -> TaskStatus {
        let status = run.outcome_status();
        let mut patch = TaskPatch::new()
            .status(status)
            .result(run.result_text.clone())
            .cost_units(run.cost_units);
        if let Some(session_id) = &run.session_id {
            patch = patch.session_id(session_id.clone());
        }
        if status != TaskStatus::Waiting {
            patch = patch.completed_at(Some(Utc::now()));
        }

        // Left `running` on failure; recovery requeues it on the next start.
        if let Err(e) = self.store.update(task.id, patch).await {
            error!(task_id = %task.id, error = %e, "Failed to persist task outcome");
        }

        info!(
            task_id = %task.id,
            status = %status,
            cost = %run.cost_units,
            duration_ms = run.duration_ms,
            "Task finished"
        );

        self.react(&task.thread_id, reaction_for(status)).await;
        if !run.result_text.trim().is_empty() {
            self.reply(&task.thread_id, &truncate(&run.result_text, RESULT_MAX_CHARS))
                .await;
        }

        if let Some(before) = before {
            self.upload_new_artifacts(task, &before).await;
        }

        self.emit(match status {
            TaskStatus::Waiting => TaskEvent::Waiting {
                task_id: task.id,
                summary: truncate(&run.result_text, 200),
            },
            TaskStatus::Completed => TaskEvent::Completed {
                task_id: task.id,
                summary: task.summary.clone(),
            },
            _ => TaskEvent::Failed {
                task_id: task.id,
                error: truncate(&run.result_text, 200),
            },
        });
        status
    }

    async fn fail(&self, task: &Task, error: &str) -> TaskStatus {
        warn!(task_id = %task.id, error, "Task execution fault");

        let patch = TaskPatch::new()
            .status(TaskStatus::Failed)
            .result(error)
            .completed_at(Some(Utc::now()));
        if let Err(e) = self.store.update(task.id, patch).await {
            error!(task_id = %task.id, error = %e, "Failed to mark task failed");
        }

        self.react(&task.thread_id, Reaction::Failed).await;
        self.reply(
            &task.thread_id,
            &format!("⚠️ Task failed: {}", truncate(error, 500)),
        )
        .await;
        self.emit(TaskEvent::Failed {
            task_id: task.id,
            error: error.to_string(),
        });
        TaskStatus::Failed
    }

    async fn snapshot(&self, task: &Task) -> Option<ArtifactSnapshot> {
        let artifacts = self.artifacts.as_ref()?;
        match artifacts.snapshot(task.id).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Artifact snapshot failed, skipping detection");
                None
            }
        }
    }

    async fn upload_new_artifacts(&self, task: &Task, before: &ArtifactSnapshot) {
        let Some(artifacts) = &self.artifacts else {
            return;
        };
        let after = match artifacts.snapshot(task.id).await {
            Ok(after) => after,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Artifact snapshot failed");
                return;
            }
        };
        let new_files = before.diff(&after);
        if new_files.is_empty() {
            return;
        }
        match artifacts.upload(&task.thread_id, &new_files).await {
            Ok(n) => info!(task_id = %task.id, uploaded = n, "Uploaded artifacts"),
            Err(e) => warn!(task_id = %task.id, error = %e, "Artifact upload failed"),
        }
    }

    /// Post text to a thread, logging delivery failures.
    pub async fn reply(&self, thread_id: &str, text: &str) {
        if let Err(e) = self.surface.reply(thread_id, text).await {
            warn!(thread_id, surface = self.surface.name(), error = %e, "Reply failed");
        }
    }

    /// Set a status reaction, logging delivery failures.
    pub async fn react(&self, thread_id: &str, reaction: Reaction) {
        if let Err(e) = self.surface.react(thread_id, reaction).await {
            warn!(thread_id, surface = self.surface.name(), error = %e, "Reaction failed");
        }
    }

    pub fn emit(&self, event: TaskEvent) {
        // Ok if no subscribers
        let _ = self.events.send(event);
    }
}
