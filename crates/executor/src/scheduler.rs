//! Pulls from the priority queue, admits up to `MaxConcurrent`
//! concurrent executions, and manages bounded retries.
//!
//! Uses atomic in-flight counters per key and a `tokio::sync::Notify`-
//! woken background loop: the scheduler doesn't poll on a timer, it
//! wakes on enqueue or on completion.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use ao_domain::config::RetryConfig;
use ao_domain::error::Result;
use ao_domain::model::{AgentProfileId, ExecutorId, StepId, Task, TaskId};
use ao_queue::{PriorityQueue, QueueError};

/// Per-task execution parameters the scheduler hands to the executor.
/// The scheduler itself never chooses an agent profile — callers embed
/// it in the task when they enqueue.
#[derive(Debug, Clone)]
pub struct ExecutionParams {
    pub agent_profile_id: AgentProfileId,
    pub executor_id: ExecutorId,
    pub prompt: String,
    pub workflow_step_id: Option<StepId>,
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: Task, params: ExecutionParams) -> Result<()>;
}

#[async_trait]
pub trait TaskSource: Send + Sync {
    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SchedulerCounters {
    pub completed: u64,
    pub failed: u64,
}

pub struct Scheduler {
    queue: Arc<PriorityQueue>,
    params: Mutex<HashMap<TaskId, ExecutionParams>>,
    attempts: Mutex<HashMap<TaskId, u32>>,
    executor: Arc<dyn TaskExecutor>,
    tasks: Arc<dyn TaskSource>,
    max_concurrent: usize,
    active: AtomicUsize,
    counters: Mutex<SchedulerCounters>,
    retry: RetryConfig,
    notify: Notify,
}

impl Scheduler {
    pub fn new(
        queue: Arc<PriorityQueue>,
        executor: Arc<dyn TaskExecutor>,
        tasks: Arc<dyn TaskSource>,
        max_concurrent: usize,
        retry: RetryConfig,
    ) -> Self {
        Self {
            queue,
            params: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
            executor,
            tasks,
            max_concurrent,
            active: AtomicUsize::new(0),
            counters: Mutex::new(SchedulerCounters::default()),
            retry,
            notify: Notify::new(),
        }
    }

    pub fn enqueue(
        &self,
        task_id: TaskId,
        priority: i64,
        queued_at: u64,
        params: ExecutionParams,
    ) -> std::result::Result<(), QueueError> {
        self.queue.enqueue(task_id.clone(), priority, queued_at)?;
        self.params.lock().insert(task_id, params);
        self.notify.notify_one();
        Ok(())
    }

    pub fn counters(&self) -> SchedulerCounters {
        *self.counters.lock()
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Drains as much of the queue as `max_concurrent` allows, firing
    /// each admitted task on a detached `tokio::spawn`. Returns the
    /// number of tasks admitted this tick.
    pub async fn tick(self: &Arc<Self>) -> usize {
        let mut admitted = 0;
        loop {
            if self.active.load(Ordering::SeqCst) >= self.max_concurrent {
                break;
            }
            let Some(queued) = self.queue.dequeue() else {
                break;
            };
            let Some(params) = self.params.lock().remove(&queued.task_id) else {
                // Enqueued without params (shouldn't happen through the
                // public API) — drop it rather than executing blind.
                tracing::warn!(task_id = %queued.task_id, "dequeued task with no execution params");
                continue;
            };
            let Some(task) = self.tasks.get_task(&queued.task_id).await.ok().flatten() else {
                tracing::warn!(task_id = %queued.task_id, "dequeued task no longer exists in the store");
                continue;
            };

            self.active.fetch_add(1, Ordering::SeqCst);
            admitted += 1;

            let this = self.clone();
            tokio::spawn(async move {
                let task_id = task.id.clone();
                let result = this.executor.execute(task, params).await;
                this.handle_task_completed(&task_id, result.is_ok());
                if let Err(err) = result {
                    tracing::warn!(%task_id, error = %err, "task execution failed");
                }
            });
        }
        admitted
    }

    /// Runs `tick` in a loop, woken by `Notify` on enqueue/completion.
    /// Returns a handle the caller can abort on shutdown.
    pub fn spawn_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                this.tick().await;
                this.notify.notified().await;
            }
        })
    }

    pub fn handle_task_completed(&self, _task_id: &TaskId, success: bool) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        let mut counters = self.counters.lock();
        if success {
            counters.completed += 1;
        } else {
            counters.failed += 1;
        }
        self.notify.notify_one();
    }

    /// Bounded retry: returns `true` (and schedules a backoff-delayed
    /// re-enqueue) if attempts remain, `false` once exhausted — in which
    /// case the caller surfaces the task as failed.
    pub fn retry_task(self: &Arc<Self>, task_id: TaskId, priority: i64, queued_at: u64, params: ExecutionParams) -> bool {
        let attempt = {
            let mut attempts = self.attempts.lock();
            let entry = attempts.entry(task_id.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        if attempt > self.retry.max_attempts {
            tracing::warn!(%task_id, attempt, "retry budget exhausted, surfacing as failed");
            return false;
        }

        let delay_ms = self.retry.backoff_for_attempt(attempt);
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            // Re-enqueue ignoring `ErrTaskExists`: a caller-initiated
            // cancel between scheduling and firing is a legitimate race.
            let _ = this.enqueue(task_id, priority, queued_at, params);
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ao_store::{InMemoryStore, Store};
    use std::sync::atomic::AtomicU32;

    struct CountingExecutor {
        calls: AtomicU32,
        fail_first_n: u32,
    }

    #[async_trait]
    impl TaskExecutor for CountingExecutor {
        async fn execute(&self, _task: Task, _params: ExecutionParams) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first_n {
                Err(ao_domain::error::Error::Other("simulated failure".to_string()))
            } else {
                Ok(())
            }
        }
    }

    struct StoreTaskSource(Arc<InMemoryStore>);

    #[async_trait]
    impl TaskSource for StoreTaskSource {
        async fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
            self.0.get_task(id).await
        }
    }

    fn params() -> ExecutionParams {
        ExecutionParams {
            agent_profile_id: AgentProfileId::from("p1"),
            executor_id: ExecutorId::from("e1"),
            prompt: "go".to_string(),
            workflow_step_id: None,
        }
    }

    #[tokio::test]
    async fn tick_admits_up_to_max_concurrent_and_runs_the_rest_later() {
        let store = Arc::new(InMemoryStore::new());
        for i in 0..3 {
            store
                .create_task(Task::new(TaskId::from(format!("t{i}")), "x", 0))
                .await
                .unwrap();
        }

        let executor = Arc::new(CountingExecutor {
            calls: AtomicU32::new(0),
            fail_first_n: 0,
        });
        let scheduler = Arc::new(Scheduler::new(
            Arc::new(PriorityQueue::new(0)),
            executor.clone(),
            Arc::new(StoreTaskSource(store)),
            2,
            RetryConfig {
                max_attempts: 1,
                base_delay_ms: 1,
                max_delay_ms: 1,
            },
        ));

        for i in 0..3 {
            scheduler
                .enqueue(TaskId::from(format!("t{i}")), 0, i as u64, params())
                .unwrap();
        }

        let admitted = scheduler.tick().await;
        assert_eq!(admitted, 2, "cap of 2 concurrent must be respected");
        assert_eq!(scheduler.active_count(), 2);

        // Let the spawned executions finish and decrement the counter.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(scheduler.active_count(), 0);

        let admitted = scheduler.tick().await;
        assert_eq!(admitted, 1, "the third task becomes admissible once a slot frees up");
    }

    #[tokio::test]
    async fn retry_task_exhausts_after_max_attempts() {
        let store = Arc::new(InMemoryStore::new());
        store
            .create_task(Task::new(TaskId::from("t1"), "x", 0))
            .await
            .unwrap();
        let executor = Arc::new(CountingExecutor {
            calls: AtomicU32::new(0),
            fail_first_n: 0,
        });
        let scheduler = Arc::new(Scheduler::new(
            Arc::new(PriorityQueue::new(0)),
            executor,
            Arc::new(StoreTaskSource(store)),
            4,
            RetryConfig {
                max_attempts: 2,
                base_delay_ms: 1,
                max_delay_ms: 1,
            },
        ));

        assert!(scheduler.retry_task(TaskId::from("t1"), 0, 0, params()));
        assert!(scheduler.retry_task(TaskId::from("t1"), 0, 0, params()));
        assert!(!scheduler.retry_task(TaskId::from("t1"), 0, 0, params()));
    }

    #[tokio::test]
    async fn handle_task_completed_updates_counters() {
        let store = Arc::new(InMemoryStore::new());
        let executor = Arc::new(CountingExecutor {
            calls: AtomicU32::new(0),
            fail_first_n: 0,
        });
        let scheduler = Arc::new(Scheduler::new(
            Arc::new(PriorityQueue::new(0)),
            executor,
            Arc::new(StoreTaskSource(store)),
            1,
            RetryConfig::default(),
        ));

        scheduler.handle_task_completed(&TaskId::from("t1"), true);
        scheduler.handle_task_completed(&TaskId::from("t2"), false);
        let counters = scheduler.counters();
        assert_eq!(counters.completed, 1);
        assert_eq!(counters.failed, 1);
    }
}
