//! Scheduled task pool runner: drives the peek / check / acquire / start /
//! settle cycle over a task source and a capacity source.
//!
//! All bookkeeping (selection, acquisition, release, graph transitions) runs
//! on the runner's own task, so check-then-act pairs are never interleaved;
//! only the tasks' actual work executes concurrently.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::core::capacity::{CapacitySource, ResourceCost};
use crate::core::error::SchedulerError;
use crate::core::source::TaskSource;
use crate::core::task::{ProgressSender, TaskExecutor, TaskId, TaskProgressEnvelope};
use crate::util::clock::now_ms;
use crate::util::window::RollingWindow;

/// What to do with a task after an execution error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// Make the task eligible again for another attempt.
    Retry,
    /// Give up: abort the task and everything depending on it.
    Abort,
}

/// Owns the retry/abort decision after an execution error.
///
/// The runner never retries on its own and is retry-count-agnostic; policies
/// that bound attempts keep their own counters.
pub trait FailurePolicy: Send + Sync {
    /// Decide the fate of `task` after `error`.
    fn on_error(&self, task: TaskId, error: &anyhow::Error) -> FailureDecision;
}

/// Abort the task (and its dependents) on the first error.
#[derive(Debug, Clone, Copy, Default)]
pub struct AbortOnError;

impl FailurePolicy for AbortOnError {
    fn on_error(&self, _task: TaskId, _error: &anyhow::Error) -> FailureDecision {
        FailureDecision::Abort
    }
}

/// Allow up to `max_attempts` executions per task, then abort.
#[derive(Debug)]
pub struct RetryWithLimit {
    max_attempts: u32,
    failures: Mutex<HashMap<TaskId, u32>>,
}

impl RetryWithLimit {
    /// Create a policy allowing `max_attempts` executions per task.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl FailurePolicy for RetryWithLimit {
    fn on_error(&self, task: TaskId, _error: &anyhow::Error) -> FailureDecision {
        let mut failures = self.failures.lock();
        let count = failures.entry(task).or_insert(0);
        *count += 1;
        if *count < self.max_attempts {
            FailureDecision::Retry
        } else {
            FailureDecision::Abort
        }
    }
}

/// Read-only snapshot of runner activity.
#[derive(Debug, Clone, Default)]
pub struct RunnerStats {
    /// Tasks started (executions, including retries).
    pub started: u64,
    /// Tasks completed successfully.
    pub completed: u64,
    /// Execution errors observed.
    pub failed: u64,
    /// Tasks aborted, including cascaded dependents.
    pub aborted: u64,
    /// Envelopes emitted.
    pub envelopes: u64,
    /// Completions per second over the rolling window.
    pub throughput_per_sec: f64,
}

/// Internal counters behind the stats snapshot.
#[derive(Debug)]
struct RunnerCounters {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    aborted: AtomicU64,
    envelopes: AtomicU64,
    window: RollingWindow,
}

impl RunnerCounters {
    fn new(window_ms: u64) -> Self {
        Self {
            started: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
            envelopes: AtomicU64::new(0),
            window: RollingWindow::new(window_ms),
        }
    }

    fn snapshot(&self) -> RunnerStats {
        RunnerStats {
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            envelopes: self.envelopes.load(Ordering::Relaxed),
            throughput_per_sec: self.window.per_second(now_ms()),
        }
    }
}

/// A settled execution, funneled back to the runner task for bookkeeping.
struct TaskOutcome<T> {
    id: TaskId,
    cost: ResourceCost,
    result: anyhow::Result<T>,
}

/// Iteration handle over a run's envelopes.
///
/// `next_envelope` returns `Ok(None)` once the source is drained and every
/// in-flight task has settled. With `stop_on_error`, the first `Error`
/// envelope surfaces as `Err(SchedulerError::TaskExecution)` and the run
/// shuts down.
pub struct TaskRun<T> {
    rx: mpsc::Receiver<TaskProgressEnvelope<T>>,
    stop_on_error: bool,
}

impl<T> TaskRun<T> {
    /// Next envelope, or `Ok(None)` when the run is finished.
    pub async fn next_envelope(
        &mut self,
    ) -> Result<Option<TaskProgressEnvelope<T>>, SchedulerError> {
        let Some(envelope) = self.rx.recv().await else {
            return Ok(None);
        };
        if self.stop_on_error {
            if let TaskProgressEnvelope::Error { task_id, message } = &envelope {
                self.rx.close();
                return Err(SchedulerError::TaskExecution {
                    task: *task_id,
                    message: message.clone(),
                });
            }
        }
        Ok(Some(envelope))
    }

    /// Drain the run, collecting every envelope. Propagates the first error
    /// when `stop_on_error` was requested.
    pub async fn collect(mut self) -> Result<Vec<TaskProgressEnvelope<T>>, SchedulerError> {
        let mut envelopes = Vec::new();
        while let Some(envelope) = self.next_envelope().await? {
            envelopes.push(envelope);
        }
        Ok(envelopes)
    }
}

/// Drives tasks from a [`TaskSource`] against a [`CapacitySource`].
///
/// Capacity is reserved before an entry is consumed, so a consumed task can
/// never be left unschedulable; unaffordable heads are skipped in favor of
/// cheaper ready tasks, avoiding head-of-line priority inversion.
pub struct TaskPoolRunner<P, T, S, C, E, F> {
    source: Arc<S>,
    capacity: Arc<C>,
    executor: E,
    policy: Arc<F>,
    counters: Arc<RunnerCounters>,
    channel_capacity: usize,
    _markers: PhantomData<fn(P) -> T>,
}

impl<P, T, S, C, E, F> TaskPoolRunner<P, T, S, C, E, F>
where
    P: Clone + Send + Sync + 'static,
    T: Send + 'static,
    S: TaskSource<P> + 'static,
    C: CapacitySource + 'static,
    E: TaskExecutor<P, T>,
    F: FailurePolicy + 'static,
{
    /// Create a runner from its collaborators.
    pub fn new(source: Arc<S>, capacity: Arc<C>, executor: E, policy: F) -> Self {
        Self {
            source,
            capacity,
            executor,
            policy: Arc::new(policy),
            counters: Arc::new(RunnerCounters::new(10_000)),
            channel_capacity: 64,
            _markers: PhantomData,
        }
    }

    /// Override the envelope/outcome channel capacity.
    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Snapshot of runner counters.
    pub fn stats(&self) -> RunnerStats {
        self.counters.snapshot()
    }

    /// Run until the source is drained and in-flight work settles.
    ///
    /// When `stop_on_error` is true, the first `Error` envelope terminates
    /// the whole loop and surfaces as an error from the returned handle;
    /// when false, errors are yielded like any other envelope and the loop
    /// continues, enabling per-task retry policy.
    pub fn run_tasks(&self, stop_on_error: bool) -> TaskRun<T> {
        let (env_tx, env_rx) = mpsc::channel(self.channel_capacity);
        tokio::spawn(Self::drive(
            Arc::clone(&self.source),
            Arc::clone(&self.capacity),
            self.executor.clone(),
            Arc::clone(&self.policy),
            Arc::clone(&self.counters),
            env_tx,
            stop_on_error,
            self.channel_capacity,
        ));
        TaskRun {
            rx: env_rx,
            stop_on_error,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        source: Arc<S>,
        capacity: Arc<C>,
        executor: E,
        policy: Arc<F>,
        counters: Arc<RunnerCounters>,
        env_tx: mpsc::Sender<TaskProgressEnvelope<T>>,
        stop_on_error: bool,
        channel_capacity: usize,
    ) {
        let (outcome_tx, mut outcome_rx) = mpsc::channel::<TaskOutcome<T>>(channel_capacity);
        let mut cap_rx = capacity.subscribe();
        let mut src_rx = source.subscribe();
        let mut in_flight: usize = 0;

        'run: loop {
            // Start every eligible task whose cost can be reserved right
            // now. Reservation happens inside the selection predicate, so
            // the entry is only consumed once capacity is held.
            loop {
                let reserve = |cost: &ResourceCost| capacity.try_acquire(cost).is_accepted();
                let Some(task) = source.next_affordable(&reserve) else {
                    break;
                };
                in_flight += 1;
                counters.started.fetch_add(1, Ordering::Relaxed);
                let id = task.meta.id;
                let cost = task.meta.cost.clone();
                debug!(task = id, "task started");

                let executor = executor.clone();
                let progress = ProgressSender::new(id, env_tx.clone());
                let outcome_tx = outcome_tx.clone();
                let meta = task.meta;
                let payload = task.payload;
                tokio::spawn(async move {
                    let result = executor.execute(payload, meta, progress).await;
                    if outcome_tx
                        .send(TaskOutcome { id, cost, result })
                        .await
                        .is_err()
                    {
                        debug!(task = id, "runner gone before outcome delivery");
                    }
                });
            }

            if in_flight == 0 {
                if source.is_drained() {
                    break 'run;
                }
                if source.is_wedged() {
                    warn!(
                        waiting = source.len(),
                        "source closed with tasks that can never become ready"
                    );
                    break 'run;
                }
            }

            tokio::select! {
                outcome = outcome_rx.recv() => {
                    let Some(outcome) = outcome else { break 'run };
                    in_flight -= 1;
                    let keep_going = Self::settle(
                        &source, &capacity, &policy, &counters, &env_tx,
                        stop_on_error, outcome,
                    )
                    .await;
                    if !keep_going {
                        break 'run;
                    }
                }
                _ = cap_rx.changed() => {}
                _ = src_rx.changed() => {}
            }
        }
        info!("runner loop finished");
    }

    /// Apply one settled outcome: release capacity, record the result in the
    /// source, emit the envelope, and defer retry/abort to the policy.
    /// Returns false when the loop should stop.
    async fn settle(
        source: &Arc<S>,
        capacity: &Arc<C>,
        policy: &Arc<F>,
        counters: &Arc<RunnerCounters>,
        env_tx: &mpsc::Sender<TaskProgressEnvelope<T>>,
        stop_on_error: bool,
        outcome: TaskOutcome<T>,
    ) -> bool {
        // Terminal outcomes always release, even stale ones: the capacity
        // was held for the whole execution.
        capacity.release(&outcome.cost);

        match outcome.result {
            Ok(value) => match source.complete(outcome.id) {
                Ok(true) => {
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                    counters.window.record(now_ms());
                    counters.envelopes.fetch_add(1, Ordering::Relaxed);
                    env_tx
                        .send(TaskProgressEnvelope::Final {
                            task_id: outcome.id,
                            value,
                        })
                        .await
                        .is_ok()
                }
                Ok(false) => {
                    debug!(task = outcome.id, "discarding outcome of aborted task");
                    true
                }
                Err(e) => {
                    error!(task = outcome.id, error = %e, "completion bookkeeping failed");
                    true
                }
            },
            Err(err) => {
                if source.was_aborted(outcome.id) {
                    debug!(task = outcome.id, "discarding error of aborted task");
                    return true;
                }
                counters.failed.fetch_add(1, Ordering::Relaxed);
                counters.envelopes.fetch_add(1, Ordering::Relaxed);
                let delivered = env_tx
                    .send(TaskProgressEnvelope::Error {
                        task_id: outcome.id,
                        message: format!("{err:#}"),
                    })
                    .await
                    .is_ok();

                match policy.on_error(outcome.id, &err) {
                    FailureDecision::Retry => match source.fail(outcome.id) {
                        Ok(true) => debug!(task = outcome.id, "eligible for retry"),
                        Ok(false) => debug!(task = outcome.id, "aborted before retry"),
                        Err(e) => {
                            error!(task = outcome.id, error = %e, "retry bookkeeping failed");
                        }
                    },
                    FailureDecision::Abort => match source.abort(outcome.id) {
                        Ok(keys) => {
                            counters
                                .aborted
                                .fetch_add(keys.len() as u64, Ordering::Relaxed);
                            info!(task = outcome.id, cascade = ?keys, "task aborted");
                        }
                        Err(e) => {
                            error!(task = outcome.id, error = %e, "abort bookkeeping failed");
                        }
                    },
                }

                if stop_on_error {
                    info!(task = outcome.id, "stopping on first error");
                    return false;
                }
                delivered
            }
        }
    }
}
