//! Queue scheduler — keeps up to `max_concurrent` tasks running.
//!
//! A single loop waits on a wake-up signal and fills free slots from the
//! queue, oldest first. Every completion posts another wake-up instead of
//! calling back into the scheduler, so long task streams never nest.
//!
//! The in-memory running set only decides whether another claim is worth
//! attempting. Exclusivity comes from [`TaskStore::claim`]; redundant passes
//! are harmless.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::TaskStore;
use crate::tasks::{Task, TaskPatch, TaskStatus};
use crate::worker::executor::TaskExecutor;

/// Counts occupied execution slots with a compare-and-swap bound.
pub struct SlotTracker {
    active: AtomicUsize,
    max: usize,
}

impl SlotTracker {
    pub fn new(max: usize) -> Self {
        Self {
            active: AtomicUsize::new(0),
            max,
        }
    }

    /// Try to take a slot. Returns `true` if one was free.
    pub fn try_acquire(&self) -> bool {
        loop {
            let current = self.active.load(Ordering::Acquire);
            if current >= self.max {
                return false;
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(_) => continue, // Retry on spurious CAS failure
            }
        }
    }

    pub fn release(&self) {
        self.active.fetch_sub(1, Ordering::Release);
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

/// Bounded, FIFO task scheduler.
pub struct QueueScheduler {
    store: Arc<dyn TaskStore>,
    executor: Arc<TaskExecutor>,
    slots: SlotTracker,
    running: Mutex<HashSet<Uuid>>,
    wake: Notify,
}

impl QueueScheduler {
    pub fn new(executor: Arc<TaskExecutor>, max_concurrent: usize) -> Self {
        Self {
            store: Arc::clone(executor.store()),
            executor,
            slots: SlotTracker::new(max_concurrent),
            running: Mutex::new(HashSet::new()),
            wake: Notify::new(),
        }
    }

    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.executor
    }

    /// Signal that work may be runnable. Triggers coalesce; none are lost.
    pub fn trigger(&self) {
        self.wake.notify_one();
    }

    /// Spawn the scheduling loop.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            info!(max_concurrent = scheduler.slots.max(), "Queue scheduler started");
            loop {
                scheduler.wake.notified().await;
                scheduler.fill_slots().await;
            }
        })
    }

    /// One scheduling pass: claim and launch queued tasks until the slots
    /// are full or the queue is empty. Returns how many tasks were started.
    pub async fn fill_slots(self: &Arc<Self>) -> usize {
        let mut started = 0;

        while self.slots.try_acquire() {
            let task = match self.store.oldest_by_status(TaskStatus::Queued).await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    self.slots.release();
                    break;
                }
                Err(e) => {
                    self.slots.release();
                    warn!(error = %e, "Failed to query queued tasks, skipping pass");
                    break;
                }
            };

            let started_at = Utc::now();
            let claimed = self
                .store
                .claim(
                    task.id,
                    TaskStatus::Queued,
                    TaskStatus::Running,
                    TaskPatch::new().started_at(Some(started_at)),
                )
                .await;

            match claimed {
                Ok(true) => {}
                Ok(false) => {
                    // Someone else got it; try the next one.
                    self.slots.release();
                    debug!(task_id = %task.id, "Claim lost");
                    continue;
                }
                Err(e) => {
                    self.slots.release();
                    warn!(task_id = %task.id, error = %e, "Claim failed, skipping pass");
                    break;
                }
            }

            let task = Task {
                status: TaskStatus::Running,
                started_at: Some(started_at),
                ..task
            };
            self.launch(task);
            started += 1;
        }

        started
    }

    /// Start the executor without waiting for it.
    fn launch(self: &Arc<Self>, task: Task) {
        self.running_set().insert(task.id);
        info!(task_id = %task.id, running = self.slots.active_count(), "Task claimed");

        let guard = SlotGuard {
            scheduler: Arc::clone(self),
            task_id: task.id,
        };
        let executor = Arc::clone(&self.executor);
        tokio::spawn(async move {
            let _guard = guard;
            executor.run(task).await;
        });
    }

    /// Ids of tasks this process is currently executing.
    pub fn running_ids(&self) -> Vec<Uuid> {
        self.running_set().iter().copied().collect()
    }

    pub fn running_count(&self) -> usize {
        self.slots.active_count()
    }

    fn running_set(&self) -> MutexGuard<'_, HashSet<Uuid>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Frees a slot when an execution ends, even if it panicked, and asks for
/// another pass.
struct SlotGuard {
    scheduler: Arc<QueueScheduler>,
    task_id: Uuid,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.scheduler.running_set().remove(&self.task_id);
        self.scheduler.slots.release();
        self.scheduler.trigger();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::TimeDelta;

    use super::*;
    use crate::agent::AgentBackend;
    use crate::channels::MessagingSurface;
    use crate::config::AgentConfig;
    use crate::error::{AgentError, DatabaseError};
    use crate::store::LibSqlBackend;
    use crate::tasks::event_channel;
    use crate::test_support::{
        Harness, RecordingSurface, StubBackend, queued_task, wait_for_status, wait_until,
    };

    #[test]
    fn tracker_respects_limit() {
        let tracker = SlotTracker::new(2);
        assert!(tracker.try_acquire());
        assert!(tracker.try_acquire());
        assert!(!tracker.try_acquire());
        assert_eq!(tracker.active_count(), 2);
        tracker.release();
        assert!(tracker.try_acquire());
    }

    #[test]
    fn tracker_zero_max_always_rejects() {
        let tracker = SlotTracker::new(0);
        assert!(!tracker.try_acquire());
        assert_eq!(tracker.active_count(), 0);
    }

    async fn enqueue_three(harness: &Harness) -> Vec<Task> {
        let t0 = Utc::now() - TimeDelta::seconds(30);
        let mut tasks = Vec::new();
        for (i, offset) in [0, 10, 20].into_iter().enumerate() {
            let task = queued_task(&format!("th-{i}"), &format!("task {i}"))
                .with_created_at(t0 + TimeDelta::seconds(offset));
            harness.store.insert(&task).await.unwrap();
            tasks.push(task);
        }
        tasks
    }

    #[tokio::test]
    async fn third_task_waits_for_a_free_slot() {
        let (backend, gate) = StubBackend::gated();
        let harness = Harness::new(backend, 2).await;
        let tasks = enqueue_three(&harness).await;

        assert_eq!(harness.scheduler.fill_slots().await, 2);

        let running = harness.store.all_by_status(TaskStatus::Running).await.unwrap();
        let running_ids: Vec<Uuid> = running.iter().map(|t| t.id).collect();
        assert_eq!(running_ids, vec![tasks[0].id, tasks[1].id]);
        assert!(running.iter().all(|t| t.started_at.is_some()));
        assert_eq!(
            harness.store.get(tasks[2].id).await.unwrap().unwrap().status,
            TaskStatus::Queued
        );

        // A redundant pass changes nothing while both slots are busy.
        assert_eq!(harness.scheduler.fill_slots().await, 0);

        // Finish one run; the completion wakes the loop, which claims the third.
        let _loop = harness.scheduler.spawn();
        gate.add_permits(1);
        wait_for_status(harness.store.as_ref(), tasks[2].id, TaskStatus::Running).await;

        gate.add_permits(2);
        for task in &tasks {
            wait_for_status(harness.store.as_ref(), task.id, TaskStatus::Completed).await;
        }
        wait_until(|| harness.scheduler.running_count() == 0).await;
        assert!(harness.backend.peak() <= 2);
    }

    #[tokio::test]
    async fn overlapping_passes_never_exceed_the_bound() {
        let (backend, gate) = StubBackend::gated();
        let harness = Harness::new(backend, 3).await;
        for i in 0..8 {
            harness
                .store
                .insert(&queued_task(&format!("th-{i}"), "work"))
                .await
                .unwrap();
        }

        let passes = (0..4).map(|_| {
            let scheduler = Arc::clone(&harness.scheduler);
            tokio::spawn(async move { scheduler.fill_slots().await })
        });
        let started: usize = futures::future::join_all(passes)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .sum();

        assert_eq!(started, 3);
        assert_eq!(harness.store.count_by_status(TaskStatus::Running).await.unwrap(), 3);
        assert_eq!(harness.scheduler.running_ids().len(), 3);

        let _loop = harness.scheduler.spawn();
        gate.add_permits(8);
        wait_for_completed(&harness, 8).await;
        assert!(harness.backend.peak() <= 3);
    }

    async fn wait_for_completed(harness: &Harness, completed: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let done = harness
                    .store
                    .count_by_status(TaskStatus::Completed)
                    .await
                    .unwrap();
                if done == completed {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("tasks did not complete in time");
    }

    #[tokio::test]
    async fn empty_queue_releases_slot() {
        let harness = Harness::new(StubBackend::new(), 1).await;
        assert_eq!(harness.scheduler.fill_slots().await, 0);
        assert_eq!(harness.scheduler.running_count(), 0);
    }

    #[tokio::test]
    async fn rejected_task_is_never_claimed() {
        let harness = Harness::new(StubBackend::new(), 1).await;
        let task = queued_task("th", "nope");
        harness.store.insert(&task).await.unwrap();
        harness
            .store
            .claim(task.id, TaskStatus::Queued, TaskStatus::Rejected, TaskPatch::new())
            .await
            .unwrap();

        assert_eq!(harness.scheduler.fill_slots().await, 0);
        assert!(harness.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn trigger_before_loop_is_not_lost() {
        let harness = Harness::new(StubBackend::new(), 1).await;
        let task = queued_task("th", "go");
        harness.store.insert(&task).await.unwrap();

        harness.scheduler.trigger();
        let _loop = harness.scheduler.spawn();
        wait_for_status(harness.store.as_ref(), task.id, TaskStatus::Completed).await;
    }

    /// Store whose next queue query or claim can be made to fail once.
    struct FlakyStore {
        inner: LibSqlBackend,
        fail_query: AtomicBool,
        fail_claim: AtomicBool,
    }

    impl FlakyStore {
        fn fault(flag: &AtomicBool, op: &str) -> Result<(), DatabaseError> {
            if flag.swap(false, Ordering::SeqCst) {
                return Err(DatabaseError::Query(format!("{op}: disk I/O error")));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl TaskStore for FlakyStore {
        async fn insert(&self, task: &Task) -> Result<Uuid, DatabaseError> {
            self.inner.insert(task).await
        }

        async fn get(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
            self.inner.get(id).await
        }

        async fn oldest_by_status(&self, status: TaskStatus) -> Result<Option<Task>, DatabaseError> {
            Self::fault(&self.fail_query, "oldest_by_status")?;
            self.inner.oldest_by_status(status).await
        }

        async fn all_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, DatabaseError> {
            self.inner.all_by_status(status).await
        }

        async fn claim(
            &self,
            id: Uuid,
            expected: TaskStatus,
            new: TaskStatus,
            extra: TaskPatch,
        ) -> Result<bool, DatabaseError> {
            Self::fault(&self.fail_claim, "claim")?;
            self.inner.claim(id, expected, new, extra).await
        }

        async fn update(&self, id: Uuid, patch: TaskPatch) -> Result<(), DatabaseError> {
            self.inner.update(id, patch).await
        }

        async fn latest_for_thread(
            &self,
            thread_id: &str,
            statuses: &[TaskStatus],
        ) -> Result<Option<Task>, DatabaseError> {
            self.inner.latest_for_thread(thread_id, statuses).await
        }

        async fn list_recent(&self, limit: usize) -> Result<Vec<Task>, DatabaseError> {
            self.inner.list_recent(limit).await
        }

        async fn count_by_status(&self, status: TaskStatus) -> Result<usize, DatabaseError> {
            self.inner.count_by_status(status).await
        }
    }

    #[tokio::test]
    async fn store_faults_skip_the_pass_and_the_loop_carries_on() {
        let store = Arc::new(FlakyStore {
            inner: LibSqlBackend::new_memory().await.unwrap(),
            fail_query: AtomicBool::new(true),
            fail_claim: AtomicBool::new(true),
        });
        let backend = Arc::new(StubBackend::new());
        let executor = TaskExecutor::new(
            Arc::clone(&store) as Arc<dyn TaskStore>,
            Arc::clone(&backend) as Arc<dyn AgentBackend>,
            Arc::new(RecordingSurface::default()) as Arc<dyn MessagingSurface>,
            AgentConfig::default(),
            event_channel(),
        );
        let scheduler = Arc::new(QueueScheduler::new(Arc::new(executor), 1));
        let task = queued_task("th", "survive");
        store.insert(&task).await.unwrap();

        // Query fails, then the claim fails: nothing starts and the slot is freed.
        assert_eq!(scheduler.fill_slots().await, 0);
        assert_eq!(scheduler.running_count(), 0);
        assert_eq!(scheduler.fill_slots().await, 0);
        assert_eq!(scheduler.running_count(), 0);
        assert_eq!(
            store.get(task.id).await.unwrap().unwrap().status,
            TaskStatus::Queued
        );

        let _loop = scheduler.spawn();
        scheduler.trigger();
        wait_for_status(store.as_ref(), task.id, TaskStatus::Completed).await;
        assert_eq!(backend.calls().len(), 1);
    }

    #[tokio::test]
    async fn execution_fault_does_not_stop_the_loop() {
        let harness = Harness::new(StubBackend::new(), 1).await;
        harness.backend.push(Err(AgentError::SpawnFailed {
            command: "agent".into(),
            reason: "not found".into(),
        }));
        let t0 = Utc::now() - TimeDelta::seconds(10);
        let first = queued_task("th-1", "first").with_created_at(t0);
        let second = queued_task("th-2", "second").with_created_at(t0 + TimeDelta::seconds(1));
        harness.store.insert(&first).await.unwrap();
        harness.store.insert(&second).await.unwrap();

        let _loop = harness.scheduler.spawn();
        harness.scheduler.trigger();

        wait_for_status(harness.store.as_ref(), first.id, TaskStatus::Failed).await;
        wait_for_status(harness.store.as_ref(), second.id, TaskStatus::Completed).await;
        assert_eq!(harness.backend.calls().len(), 2);
    }
}
