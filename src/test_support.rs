//! Test doubles shared by unit tests.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::{Semaphore, broadcast};
use uuid::Uuid;

use crate::agent::{AgentBackend, AgentRun, ExecuteOptions};
use crate::channels::{MessagingSurface, Reaction};
use crate::classifier::Classifier;
use crate::config::AgentConfig;
use crate::error::{AgentError, ChannelError};
use crate::inbox::Inbox;
use crate::store::{LibSqlBackend, TaskStore};
use crate::tasks::{Classification, Task, TaskEvent, TaskStatus, event_channel};
use crate::worker::{QueueScheduler, TaskExecutor};

const WAIT_LIMIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub enum AgentCall {
    Execute { prompt: String },
    Resume { session_id: String, prompt: String },
}

impl AgentCall {
    pub fn prompt(&self) -> &str {
        match self {
            Self::Execute { prompt } | Self::Resume { prompt, .. } => prompt,
        }
    }
}

/// Agent backend that records calls and returns scripted outcomes.
///
/// When gated, each call blocks until the test adds a permit.
#[derive(Default)]
pub struct StubBackend {
    calls: Mutex<Vec<AgentCall>>,
    scripted: Mutex<VecDeque<Result<AgentRun, AgentError>>>,
    gate: Option<Arc<Semaphore>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let backend = Self {
            gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (backend, gate)
    }

    /// Queue the outcome of the next call.
    pub fn push(&self, outcome: Result<AgentRun, AgentError>) {
        self.scripted.lock().unwrap().push_back(outcome);
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Most calls ever in flight at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub async fn wait_for_calls(&self, n: usize) {
        wait_until(|| self.calls.lock().unwrap().len() >= n).await;
    }

    async fn respond(&self, call: AgentCall, default_session: String) -> Result<AgentRun, AgentError> {
        self.calls.lock().unwrap().push(call);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        let scripted = self.scripted.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(AgentRun {
                success: true,
                needs_input: false,
                session_id: Some(default_session),
                result_text: "done".into(),
                cost_units: Decimal::ZERO,
                duration_ms: 1,
            })
        })
    }
}

#[async_trait]
impl AgentBackend for StubBackend {
    fn name(&self) -> &str {
        "stub"
    }

    async fn execute(&self, prompt: &str, _options: &ExecuteOptions) -> Result<AgentRun, AgentError> {
        let session = format!("sess-{}", Uuid::new_v4());
        self.respond(
            AgentCall::Execute {
                prompt: prompt.to_string(),
            },
            session,
        )
        .await
    }

    async fn resume(
        &self,
        session_id: &str,
        prompt: &str,
        _options: &ExecuteOptions,
    ) -> Result<AgentRun, AgentError> {
        self.respond(
            AgentCall::Resume {
                session_id: session_id.to_string(),
                prompt: prompt.to_string(),
            },
            session_id.to_string(),
        )
        .await
    }
}

/// Messaging surface that records everything sent to it.
#[derive(Default)]
pub struct RecordingSurface {
    replies: Mutex<Vec<(String, String)>>,
    reactions: Mutex<Vec<(String, Reaction)>>,
}

impl RecordingSurface {
    pub fn replies_for(&self, thread_id: &str) -> Vec<String> {
        self.replies
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == thread_id)
            .map(|(_, text)| text.clone())
            .collect()
    }

    pub fn reactions_for(&self, thread_id: &str) -> Vec<Reaction> {
        self.reactions
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == thread_id)
            .map(|(_, r)| *r)
            .collect()
    }
}

#[async_trait]
impl MessagingSurface for RecordingSurface {
    fn name(&self) -> &str {
        "recording"
    }

    async fn reply(&self, thread_id: &str, text: &str) -> Result<(), ChannelError> {
        self.replies
            .lock()
            .unwrap()
            .push((thread_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn react(&self, thread_id: &str, reaction: Reaction) -> Result<(), ChannelError> {
        self.reactions
            .lock()
            .unwrap()
            .push((thread_id.to_string(), reaction));
        Ok(())
    }

    async fn upload(&self, thread_id: &str, path: &Path) -> Result<(), ChannelError> {
        self.reply(thread_id, &format!("📎 {}", path.display())).await
    }
}

/// Classifier that optionally asks a clarifying question.
pub struct StubClassifier {
    clarify: Option<String>,
}

impl StubClassifier {
    pub fn direct() -> Self {
        Self { clarify: None }
    }

    pub fn asking(question: &str) -> Self {
        Self {
            clarify: Some(question.to_string()),
        }
    }
}

#[async_trait]
impl Classifier for StubClassifier {
    async fn classify(&self, text: &str) -> Classification {
        Classification {
            intent: "general".into(),
            autonomy_level: "auto".into(),
            summary: text.chars().take(40).collect(),
            execution_prompt: text.to_string(),
            clarify_question: self.clarify.clone(),
        }
    }
}

/// A fresh `queued` task whose prompt is `prompt`.
pub fn queued_task(thread_id: &str, prompt: &str) -> Task {
    Task::new(
        thread_id,
        prompt,
        Classification {
            intent: "general".into(),
            autonomy_level: "auto".into(),
            summary: prompt.into(),
            execution_prompt: prompt.into(),
            clarify_question: None,
        },
    )
}

/// Engine wired to an in-memory store and test doubles.
pub struct Harness {
    pub store: Arc<dyn TaskStore>,
    pub backend: Arc<StubBackend>,
    pub surface: Arc<RecordingSurface>,
    pub events: broadcast::Sender<TaskEvent>,
    pub executor: Arc<TaskExecutor>,
    pub scheduler: Arc<QueueScheduler>,
}

impl Harness {
    pub async fn new(backend: StubBackend, max_concurrent: usize) -> Self {
        Self::with_executor(backend, max_concurrent, |executor| executor).await
    }

    pub async fn with_executor(
        backend: StubBackend,
        max_concurrent: usize,
        customize: impl FnOnce(TaskExecutor) -> TaskExecutor,
    ) -> Self {
        let store: Arc<dyn TaskStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let backend = Arc::new(backend);
        let surface = Arc::new(RecordingSurface::default());
        let events = event_channel();
        let executor = Arc::new(customize(TaskExecutor::new(
            Arc::clone(&store),
            Arc::clone(&backend) as Arc<dyn AgentBackend>,
            Arc::clone(&surface) as Arc<dyn MessagingSurface>,
            AgentConfig::default(),
            events.clone(),
        )));
        let scheduler = Arc::new(QueueScheduler::new(Arc::clone(&executor), max_concurrent));
        Self {
            store,
            backend,
            surface,
            events,
            executor,
            scheduler,
        }
    }

    pub fn inbox(&self, classifier: StubClassifier) -> Inbox {
        Inbox::new(Arc::new(classifier), Arc::clone(&self.scheduler))
    }
}

/// Poll until the task reaches `status`.
pub async fn wait_for_status(store: &dyn TaskStore, id: Uuid, status: TaskStatus) -> Task {
    tokio::time::timeout(WAIT_LIMIT, async {
        loop {
            if let Some(task) = store.get(id).await.unwrap() {
                if task.status == status {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("task {id} never reached {status}"))
}

/// Poll a condition until it holds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT_LIMIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}
