//! End-to-end runner tests.
//!
//! Validates:
//! 1. Dependency chains execute in order and the run drains
//! 2. Failures retry under the policy and dependents still run
//! 3. Exhausted retries abort the task and its dependents
//! 4. `stop_on_error` surfaces the first error and halts the run
//! 5. An unaffordable high-priority task does not block cheaper work
//! 6. Intermediate values stream before the final envelope
//! 7. Outcomes of tasks aborted mid-flight are discarded

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use taskloom::core::{
    AbortOnError, AgingPolicy, CapacitySource, DependencySource, PrioritySource, ProgressSender,
    ResourceCapacity, ResourceCost, RetryWithLimit, ScheduledTask, SchedulerError, TaskExecutor,
    TaskMetadata, TaskPoolRunner, TaskProgressEnvelope, TaskSource, TaskState,
};
use taskloom::util::SystemClock;

fn task(id: u64, priority: f64, cost: ResourceCost) -> ScheduledTask<String> {
    ScheduledTask {
        meta: TaskMetadata {
            id,
            cost,
            priority,
            created_at_ms: 0,
        },
        payload: format!("job-{id}"),
    }
}

/// Executor that records execution order and can be scripted to sleep or
/// fail a fixed number of times per task.
#[derive(Clone, Default)]
struct RecordingExecutor {
    log: Arc<Mutex<Vec<u64>>>,
    fail_remaining: Arc<Mutex<HashMap<u64, u32>>>,
    delays_ms: Arc<Mutex<HashMap<u64, u64>>>,
}

impl RecordingExecutor {
    fn with_failures(self, id: u64, times: u32) -> Self {
        self.fail_remaining.lock().insert(id, times);
        self
    }

    fn with_delay(self, id: u64, ms: u64) -> Self {
        self.delays_ms.lock().insert(id, ms);
        self
    }

    fn executed(&self) -> Vec<u64> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl TaskExecutor<String, String> for RecordingExecutor {
    async fn execute(
        &self,
        payload: String,
        meta: TaskMetadata,
        _progress: ProgressSender<String>,
    ) -> anyhow::Result<String> {
        self.log.lock().push(meta.id);
        let delay = self.delays_ms.lock().get(&meta.id).copied().unwrap_or(0);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let should_fail = {
            let mut remaining = self.fail_remaining.lock();
            match remaining.get_mut(&meta.id) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            }
        };
        if should_fail {
            anyhow::bail!("injected failure for task {}", meta.id);
        }
        Ok(format!("{payload}:done"))
    }
}

#[tokio::test]
async fn dependency_chain_runs_and_drains() {
    taskloom::util::init_tracing();
    let source = Arc::new(DependencySource::new(
        AgingPolicy::NONE,
        Arc::new(SystemClock),
    ));
    let capacity = Arc::new(ResourceCapacity::new(ResourceCost::new().with("cpu", 4)));
    let unit = ResourceCost::new().with("cpu", 1);
    source.enqueue(task(1, 0.0, unit.clone()), &[]).unwrap();
    source.enqueue(task(2, 0.0, unit.clone()), &[1]).unwrap();
    source.enqueue(task(3, 0.0, unit), &[1]).unwrap();
    source.close();

    let executor = RecordingExecutor::default();
    let runner = TaskPoolRunner::new(Arc::clone(&source), capacity, executor.clone(), AbortOnError);
    let envelopes = runner.run_tasks(false).collect().await.unwrap();

    assert_eq!(envelopes.len(), 3);
    assert!(envelopes.iter().all(TaskProgressEnvelope::is_final));
    assert_eq!(envelopes[0].task_id(), 1);
    assert_eq!(executor.executed()[0], 1);
    assert!(source.is_done());

    let stats = runner.stats();
    assert_eq!(stats.started, 3);
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.failed, 0);
}

#[tokio::test]
async fn failures_retry_under_the_policy() {
    let source = Arc::new(DependencySource::new(
        AgingPolicy::NONE,
        Arc::new(SystemClock),
    ));
    let capacity = Arc::new(ResourceCapacity::new(ResourceCost::new().with("cpu", 4)));
    let unit = ResourceCost::new().with("cpu", 1);
    source.enqueue(task(1, 0.0, unit.clone()), &[]).unwrap();
    source.enqueue(task(2, 0.0, unit), &[1]).unwrap();
    source.close();

    let executor = RecordingExecutor::default().with_failures(1, 2);
    let runner = TaskPoolRunner::new(
        Arc::clone(&source),
        capacity,
        executor.clone(),
        RetryWithLimit::new(3),
    );
    let envelopes = runner.run_tasks(false).collect().await.unwrap();

    let errors = envelopes.iter().filter(|e| e.is_error()).count();
    let finals = envelopes.iter().filter(|e| e.is_final()).count();
    assert_eq!(errors, 2);
    assert_eq!(finals, 2);
    assert_eq!(executor.executed(), vec![1, 1, 1, 2]);
    assert!(source.is_done());
    assert_eq!(runner.stats().started, 4);
}

#[tokio::test]
async fn exhausted_retries_abort_dependents() {
    let source = Arc::new(DependencySource::new(
        AgingPolicy::NONE,
        Arc::new(SystemClock),
    ));
    let capacity = Arc::new(ResourceCapacity::new(ResourceCost::new().with("cpu", 4)));
    let unit = ResourceCost::new().with("cpu", 1);
    source.enqueue(task(1, 0.0, unit.clone()), &[]).unwrap();
    source.enqueue(task(2, 0.0, unit), &[1]).unwrap();
    source.close();

    let executor = RecordingExecutor::default().with_failures(1, 10);
    let runner = TaskPoolRunner::new(
        Arc::clone(&source),
        capacity,
        executor.clone(),
        RetryWithLimit::new(2),
    );
    let envelopes = runner.run_tasks(false).collect().await.unwrap();

    assert_eq!(envelopes.iter().filter(|e| e.is_error()).count(), 2);
    assert_eq!(envelopes.iter().filter(|e| e.is_final()).count(), 0);
    // The dependent never executed.
    assert_eq!(executor.executed(), vec![1, 1]);
    assert_eq!(source.task_state(2), Some(TaskState::Aborted));
    assert_eq!(runner.stats().aborted, 2);
}

#[tokio::test]
async fn stop_on_error_surfaces_the_first_error() {
    let source = Arc::new(DependencySource::new(
        AgingPolicy::NONE,
        Arc::new(SystemClock),
    ));
    let capacity = Arc::new(ResourceCapacity::new(ResourceCost::new().with("cpu", 4)));
    source
        .enqueue(task(1, 0.0, ResourceCost::new().with("cpu", 1)), &[])
        .unwrap();
    source.close();

    let executor = RecordingExecutor::default().with_failures(1, 1);
    let runner = TaskPoolRunner::new(Arc::clone(&source), capacity, executor, AbortOnError);
    let mut run = runner.run_tasks(true);

    let err = run.next_envelope().await.unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::TaskExecution { task: 1, .. }
    ));
}

#[tokio::test]
async fn expensive_task_does_not_block_cheaper_work() {
    let source = Arc::new(PrioritySource::new(
        AgingPolicy::NONE,
        Arc::new(SystemClock),
    ));
    let capacity = Arc::new(ResourceCapacity::new(ResourceCost::new().with("cpu", 10)));
    source
        .enqueue(task(1, 10.0, ResourceCost::new().with("cpu", 6)))
        .unwrap();
    source
        .enqueue(task(2, 9.0, ResourceCost::new().with("cpu", 10)))
        .unwrap();
    source
        .enqueue(task(3, 1.0, ResourceCost::new().with("cpu", 2)))
        .unwrap();
    source.close();

    let executor = RecordingExecutor::default().with_delay(1, 30);
    let runner = TaskPoolRunner::new(Arc::clone(&source), capacity, executor.clone(), AbortOnError);
    let envelopes = runner.run_tasks(false).collect().await.unwrap();

    assert_eq!(envelopes.len(), 3);
    // 2 wants the whole pool, so it can only start once 1 releases; the
    // cheap low-priority 3 is not held hostage behind it.
    let executed = executor.executed();
    assert_eq!(executed.len(), 3);
    assert_eq!(*executed.last().unwrap(), 2);
}

#[derive(Clone)]
struct StreamingExecutor;

#[async_trait]
impl TaskExecutor<String, String> for StreamingExecutor {
    async fn execute(
        &self,
        payload: String,
        _meta: TaskMetadata,
        progress: ProgressSender<String>,
    ) -> anyhow::Result<String> {
        assert!(progress.send(format!("{payload}:chunk-1")).await);
        assert!(progress.send(format!("{payload}:chunk-2")).await);
        Ok(format!("{payload}:done"))
    }
}

#[tokio::test]
async fn intermediate_values_stream_before_the_final() {
    let source = Arc::new(PrioritySource::new(
        AgingPolicy::NONE,
        Arc::new(SystemClock),
    ));
    let capacity = Arc::new(ResourceCapacity::new(ResourceCost::new().with("cpu", 1)));
    source
        .enqueue(task(7, 0.0, ResourceCost::new().with("cpu", 1)))
        .unwrap();
    source.close();

    let runner = TaskPoolRunner::new(Arc::clone(&source), capacity, StreamingExecutor, AbortOnError);
    let envelopes = runner.run_tasks(false).collect().await.unwrap();

    assert_eq!(envelopes.len(), 3);
    assert!(matches!(
        &envelopes[0],
        TaskProgressEnvelope::Intermediate { task_id: 7, value } if value == "job-7:chunk-1"
    ));
    assert!(matches!(
        &envelopes[1],
        TaskProgressEnvelope::Intermediate { task_id: 7, value } if value == "job-7:chunk-2"
    ));
    assert!(matches!(
        &envelopes[2],
        TaskProgressEnvelope::Final { task_id: 7, value } if value == "job-7:done"
    ));
}

#[tokio::test]
async fn aborted_mid_flight_outcome_is_discarded() {
    let source = Arc::new(DependencySource::new(
        AgingPolicy::NONE,
        Arc::new(SystemClock),
    ));
    let capacity = Arc::new(ResourceCapacity::new(ResourceCost::new().with("cpu", 3)));
    let unit = ResourceCost::new().with("cpu", 1);
    source.enqueue(task(1, 0.0, unit.clone()), &[]).unwrap();
    source.enqueue(task(2, 0.0, unit.clone()), &[1]).unwrap();
    source.enqueue(task(3, 0.0, unit), &[1]).unwrap();
    source.close();

    let executor = RecordingExecutor::default().with_delay(2, 50);
    let runner = TaskPoolRunner::new(
        Arc::clone(&source),
        Arc::clone(&capacity),
        executor,
        AbortOnError,
    );
    let run = runner.run_tasks(false);

    let aborter = Arc::clone(&source);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let _ = aborter.abort(2);
    });

    let envelopes = run.collect().await.unwrap();
    // Completing 1 readied both dependents; aborting 2 mid-flight leaves 3
    // to finish, and 2's late outcome produces no envelope.
    assert_eq!(envelopes.len(), 2);
    assert_eq!(envelopes[0].task_id(), 1);
    assert_eq!(envelopes[1].task_id(), 3);
    assert_eq!(source.task_state(2), Some(TaskState::Aborted));
    // The aborted task's capacity still came back.
    assert_eq!(capacity.available().get("cpu"), 3);
}
