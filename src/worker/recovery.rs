//! Startup recovery — requeue tasks a previous process left `running`.
//!
//! No executor survives a restart, so every `running` row at startup is an
//! orphan. Resetting them is a plain update: nothing else is mutating these
//! rows yet.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::TaskStore;
use crate::tasks::{TaskEvent, TaskPatch, TaskStatus};
use crate::worker::scheduler::QueueScheduler;

/// What a recovery pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    /// Tasks reset from `running` to `queued`.
    pub recovered: Vec<Uuid>,
    /// Queued tasks waiting after the reset.
    pub queued: usize,
}

pub struct RecoveryCoordinator {
    store: Arc<dyn TaskStore>,
    events: broadcast::Sender<TaskEvent>,
    delay: Duration,
}

impl RecoveryCoordinator {
    pub fn new(
        store: Arc<dyn TaskStore>,
        events: broadcast::Sender<TaskEvent>,
        delay: Duration,
    ) -> Self {
        Self {
            store,
            events,
            delay,
        }
    }

    /// Reset orphaned `running` tasks. Store errors are returned; the caller
    /// must not start scheduling if this fails.
    pub async fn repair(&self) -> Result<RecoveryReport, DatabaseError> {
        let orphans = self.store.all_by_status(TaskStatus::Running).await?;

        let mut recovered = Vec::with_capacity(orphans.len());
        for task in orphans {
            let patch = TaskPatch::new()
                .status(TaskStatus::Queued)
                .started_at(None);
            self.store.update(task.id, patch).await?;
            info!(task_id = %task.id, "Recovered orphaned running task");
            let _ = self.events.send(TaskEvent::Recovered { task_id: task.id });
            recovered.push(task.id);
        }

        let queued = self.store.count_by_status(TaskStatus::Queued).await?;
        Ok(RecoveryReport { recovered, queued })
    }

    /// Repair, then schedule a delayed scheduler pass if anything is queued.
    ///
    /// The delay gives the messaging surface time to finish connecting.
    pub async fn run(
        &self,
        scheduler: &Arc<QueueScheduler>,
    ) -> Result<(RecoveryReport, Option<JoinHandle<()>>), DatabaseError> {
        let report = self.repair().await?;
        if !report.recovered.is_empty() {
            warn!(count = report.recovered.len(), "Requeued tasks interrupted by restart");
        }

        let kick = (report.queued > 0).then(|| {
            let scheduler = Arc::clone(scheduler);
            let delay = self.delay;
            let queued = report.queued;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                info!(queued, "Starting queued tasks after recovery");
                scheduler.trigger();
            })
        });

        Ok((report, kick))
    }
}
